//! Worker modules and the module registry
//!
//! A worker module is a named set of async methods plus an optional init
//! hook. Executors cannot load code at runtime, so every module an executor
//! may be asked to run is registered up front in a [`ModuleRegistry`] under
//! its worker path; the registry is validated when the farm is built.
//!
//! ```ignore
//! let echo = WorkerModule::builder("echo")
//!     .method("run", |_api, args| async move {
//!         Ok(args.into_iter().next().unwrap_or_default())
//!     })
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use workerfarm_protocol::diagnostic::kind;
use workerfarm_protocol::{methods, Diagnostic, Value};

use crate::api::WorkerApi;
use crate::error::RegistryError;

/// Future returned by a module method
pub type MethodFuture = BoxFuture<'static, Result<Value, Diagnostic>>;

/// A type-erased module method
pub type MethodFn = Arc<dyn Fn(WorkerApi, Vec<Value>) -> MethodFuture + Send + Sync>;

/// A type-erased init hook
pub type InitFn = Arc<dyn Fn(WorkerApi) -> BoxFuture<'static, Result<(), Diagnostic>> + Send + Sync>;

/// Poll a future, turning a panic into a diagnostic
pub(crate) async fn guarded<T, F>(fut: F) -> Result<T, Diagnostic>
where
    F: Future<Output = Result<T, Diagnostic>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Diagnostic::from_panic(payload)),
    }
}

/// A named set of methods runnable inside an executor
#[derive(Clone)]
pub struct WorkerModule {
    name: String,
    init: Option<InitFn>,
    methods: HashMap<String, MethodFn>,
}

impl WorkerModule {
    /// Start building a module
    pub fn builder(name: impl Into<String>) -> WorkerModuleBuilder {
        WorkerModuleBuilder {
            name: name.into(),
            init: None,
            methods: HashMap::new(),
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the init hook, if any
    pub async fn init(&self, api: WorkerApi) -> Result<(), Diagnostic> {
        match &self.init {
            Some(init) => guarded(init(api))
                .await
                .map_err(|d| d.with_origin(self.name.clone())),
            None => Ok(()),
        }
    }

    /// Invoke a method
    pub async fn invoke(
        &self,
        api: WorkerApi,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Diagnostic> {
        let f = self.methods.get(method).ok_or_else(|| {
            Diagnostic::new(format!(
                "Unknown method '{method}' on worker module '{}'",
                self.name
            ))
            .with_kind(kind::UNKNOWN_METHOD)
        })?;
        guarded(f(api, args))
            .await
            .map_err(|d| d.with_origin(self.name.clone()))
    }
}

impl fmt::Debug for WorkerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerModule")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .field("has_init", &self.init.is_some())
            .finish()
    }
}

/// Builder for [`WorkerModule`]
pub struct WorkerModuleBuilder {
    name: String,
    init: Option<InitFn>,
    methods: HashMap<String, MethodFn>,
    error: Option<RegistryError>,
}

impl WorkerModuleBuilder {
    /// Register a method taking raw JSON arguments
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkerApi, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Diagnostic>> + Send + 'static,
    {
        let name = name.into();
        let method: MethodFn = Arc::new(move |api, args| Box::pin(f(api, args)));
        self.insert(name, method);
        self
    }

    /// Register a method with typed arguments and result
    ///
    /// The argument list is deserialized as `A`, typically a tuple such as
    /// `(u64,)` or `(String, Value)`.
    pub fn typed_method<A, R, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(WorkerApi, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Diagnostic>> + Send + 'static,
    {
        let name = name.into();
        let f = Arc::new(f);
        let method: MethodFn = Arc::new(move |api, args| {
            let f = f.clone();
            Box::pin(async move {
                let typed: A = serde_json::from_value(Value::Array(args))?;
                let result = f(api, typed).await?;
                Ok(serde_json::to_value(result)?)
            })
        });
        self.insert(name, method);
        self
    }

    /// Register the init hook run once per executor
    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(WorkerApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Diagnostic>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |api| Box::pin(f(api))));
        self
    }

    /// Finish the module, rejecting reserved and duplicate names
    pub fn build(self) -> Result<WorkerModule, RegistryError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(WorkerModule {
            name: self.name,
            init: self.init,
            methods: self.methods,
        })
    }

    fn insert(&mut self, name: String, method: MethodFn) {
        if self.error.is_some() {
            return;
        }
        if methods::is_reserved(&name) {
            self.error = Some(RegistryError::ReservedMethod {
                module: self.name.clone(),
                method: name,
            });
        } else if self.methods.contains_key(&name) {
            self.error = Some(RegistryError::DuplicateMethod {
                module: self.name.clone(),
                method: name,
            });
        } else {
            self.methods.insert(name, method);
        }
    }
}

/// Factory creating a fresh module instance per executor
pub type ModuleFactory = Arc<dyn Fn() -> Result<WorkerModule, RegistryError> + Send + Sync>;

/// Worker paths mapped to module factories
///
/// Cloning is cheap; every executor gets its own clone and builds its own
/// module instance.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under a worker path
    pub fn register<F>(&mut self, worker_path: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<WorkerModule, RegistryError> + Send + Sync + 'static,
    {
        self.factories.insert(worker_path.into(), Arc::new(factory));
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_module<F>(mut self, worker_path: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<WorkerModule, RegistryError> + Send + Sync + 'static,
    {
        self.register(worker_path, factory);
        self
    }

    pub fn contains(&self, worker_path: &str) -> bool {
        self.factories.contains_key(worker_path)
    }

    /// Registered worker paths, sorted
    pub fn worker_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Build the module registered under `worker_path`
    pub fn create(&self, worker_path: &str) -> Result<WorkerModule, RegistryError> {
        let factory = self
            .factories
            .get(worker_path)
            .ok_or_else(|| RegistryError::UnknownModule(worker_path.to_string()))?;
        factory()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("worker_paths", &self.worker_paths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::detached_api;
    use serde_json::json;

    fn echo() -> Result<WorkerModule, RegistryError> {
        WorkerModule::builder("echo")
            .method("run", |_api, args| async move {
                Ok(args.into_iter().next().unwrap_or_default())
            })
            .typed_method("add", |_api, (a, b): (i64, i64)| async move { Ok(a + b) })
            .build()
    }

    #[tokio::test]
    async fn test_invoke_methods() {
        let module = echo().unwrap();
        let api = detached_api();

        assert_eq!(
            module.invoke(api.clone(), "run", vec![json!(5)]).await.unwrap(),
            json!(5)
        );
        assert_eq!(
            module.invoke(api, "add", vec![json!(2), json!(3)]).await.unwrap(),
            json!(5)
        );
    }

    #[tokio::test]
    async fn test_typed_method_rejects_bad_arguments() {
        let module = echo().unwrap();
        let err = module
            .invoke(detached_api(), "add", vec![json!("two")])
            .await
            .unwrap_err();

        assert!(err.is_kind(kind::SERIALIZATION));
        assert_eq!(err.origin.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let module = echo().unwrap();
        let err = module.invoke(detached_api(), "nope", vec![]).await.unwrap_err();
        assert!(err.is_kind(kind::UNKNOWN_METHOD));
    }

    #[tokio::test]
    async fn test_panics_become_diagnostics() {
        let module = WorkerModule::builder("fragile")
            .method("boom", |_api, args| async move {
                if args.is_empty() {
                    panic!("index out of range");
                }
                Ok(Value::Null)
            })
            .build()
            .unwrap();

        let err = module.invoke(detached_api(), "boom", vec![]).await.unwrap_err();
        assert!(err.is_kind(kind::PANIC));
        assert_eq!(err.to_string(), "[fragile] index out of range");
    }

    #[test]
    fn test_reserved_and_duplicate_names() {
        let reserved = WorkerModule::builder("m")
            .method("childInit", |_api, _args| async { Ok(Value::Null) })
            .build();
        assert!(matches!(reserved, Err(RegistryError::ReservedMethod { .. })));

        let duplicate = WorkerModule::builder("m")
            .method("run", |_api, _args| async { Ok(Value::Null) })
            .method("run", |_api, _args| async { Ok(Value::Null) })
            .build();
        assert!(matches!(duplicate, Err(RegistryError::DuplicateMethod { .. })));
    }

    #[test]
    fn test_registry() {
        let registry = ModuleRegistry::new().with_module("echo", echo);

        assert!(registry.contains("echo"));
        assert_eq!(registry.worker_paths(), vec!["echo"]);
        assert_eq!(registry.create("echo").unwrap().method_names(), vec!["add", "run"]);
        assert_eq!(
            registry.create("missing").unwrap_err(),
            RegistryError::UnknownModule("missing".into())
        );
    }
}
