// Entry point of a process executor
//
// The coordinator spawns the child binary with `WORKERFARM_CHILD` set. The
// binary calls `run_process_child`, which speaks base64 frame lines over
// stdin/stdout until told to die or until stdin closes.

use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use workerfarm_protocol::{decode_frame, encode_frame, BusEvent, ChildId, Frame, ProtocolError};

use super::ChildRuntime;
use crate::module::ModuleRegistry;

/// Set in the environment of every process executor
pub const CHILD_ENV: &str = "WORKERFARM_CHILD";
/// The executor's child id
pub const CHILD_ID_ENV: &str = "WORKERFARM_CHILD_ID";

/// Whether the current process was spawned as an executor
pub fn is_child_process() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Serve the coordinator over stdin/stdout until told to stop
pub async fn run_process_child(
    registry: ModuleRegistry,
    bus_events: Option<mpsc::UnboundedReceiver<BusEvent>>,
) -> anyhow::Result<()> {
    let child_id = std::env::var(CHILD_ID_ENV)
        .with_context(|| format!("{CHILD_ID_ENV} is not set"))?
        .parse::<u64>()
        .map(ChildId)
        .with_context(|| format!("{CHILD_ID_ENV} is not a number"))?;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Frame>();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_frame(&line) {
                    Ok(frame) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(ProtocolError::EmptyFrame) => {}
                    Err(e) => warn!(error = %e, "Dropping undecodable frame"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read from coordinator");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(frame) = outbound_rx.recv().await {
            let mut line = match encode_frame(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut runtime = ChildRuntime::new(child_id, registry);
    if let Some(events) = bus_events {
        runtime = runtime.with_bus_events(events);
    }
    runtime.run(inbound_rx, outbound_tx).await;

    reader.abort();
    // Flush what the runtime queued before it stopped
    let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
    Ok(())
}
