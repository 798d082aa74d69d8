// Fixture modules for end-to-end runs
//
// The same registry is compiled into the `workerfarm-child` binary and into
// the coordinator under test, so method names validate on both sides.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tracing::info;
use workerfarm::{Diagnostic, LogLevel, ModuleRegistry, SharedRefId, Value, WorkerModule};

/// Worker path of the fixture module
pub const FIXTURE: &str = "fixture";

/// Reply of `readShared` for a missing reference
pub const MISSING_SHARED: &str = "Shared reference does not exist";

fn first(args: Vec<Value>) -> Value {
    args.into_iter().next().unwrap_or_default()
}

/// Registry holding the fixture module
pub fn registry() -> ModuleRegistry {
    ModuleRegistry::new().with_module(FIXTURE, || {
        WorkerModule::builder(FIXTURE)
            .on_init(|api| async move {
                info!(child_id = ?api.child_id(), "Fixture module loaded");
                Ok(())
            })
            .method("run", |_api, args| async move { Ok(first(args)) })
            .method("pid", |_api, _args| async move { Ok(json!(std::process::id())) })
            .method("invoke", |api, args| async move {
                let handle = first(args);
                api.run_handle_value(&handle, vec![]).await
            })
            .method("readShared", |api, args| async move {
                let id: SharedRefId = serde_json::from_value(first(args))?;
                Ok(api
                    .get_shared_reference(id)
                    .unwrap_or_else(|| json!(MISSING_SHARED)))
            })
            .method("log", |api, args| async move {
                let message = first(args);
                api.log(LogLevel::Info, FIXTURE, message.as_str().unwrap_or("hello"));
                Ok(Value::Null)
            })
            .method("slow", |_api, args| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(first(args))
            })
            // Exits the executor the first time it sees a marker path, then echoes
            .method("crashOnce", |_api, args| async move {
                let mut args = args.into_iter();
                let value = args.next().unwrap_or_default();
                let marker = marker_arg(args.next())?;
                if !marker.exists() {
                    std::fs::write(&marker, b"crashed")
                        .map_err(|e| format!("write marker: {e}"))?;
                    std::process::exit(1);
                }
                Ok(json!({ "value": value, "pid": std::process::id() }))
            })
            // Closes the executor's output the first time it sees a marker
            // path and keeps the process alive; later attempts echo
            .method("closeOutputOnce", |_api, args| async move {
                let mut args = args.into_iter();
                let value = args.next().unwrap_or_default();
                let marker = marker_arg(args.next())?;
                if !marker.exists() {
                    std::fs::write(&marker, b"closed")
                        .map_err(|e| format!("write marker: {e}"))?;
                    close_stdout();
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(json!({ "value": value, "pid": std::process::id() }))
            })
            .method("crash", |_api, _args| async move { crash() })
            .build()
    })
}

fn crash() -> Result<Value, Diagnostic> {
    std::process::exit(1)
}

fn marker_arg(arg: Option<Value>) -> Result<PathBuf, &'static str> {
    arg.and_then(|v| v.as_str().map(PathBuf::from))
        .ok_or("marker path argument missing")
}

#[cfg(unix)]
fn close_stdout() {
    use std::os::fd::{FromRawFd, OwnedFd};
    // SAFETY: fd 1 is owned by the process and closed only here
    drop(unsafe { OwnedFd::from_raw_fd(1) });
}

#[cfg(not(unix))]
fn close_stdout() {
    std::process::exit(1);
}
