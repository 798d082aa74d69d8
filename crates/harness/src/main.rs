// Executor binary for the process backend
//
// Spawned by the coordinator with WORKERFARM_CHILD set; speaks frames on
// stdin/stdout and relays its logs to the coordinator's bus.

use anyhow::{bail, Context};
use workerfarm::telemetry::{init_child_telemetry, BusLayer};
use workerfarm::{is_child_process, run_process_child, TelemetryConfig};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    if !is_child_process() {
        bail!("workerfarm-child is started by a farm coordinator, not directly");
    }

    let (bus, bus_events) = BusLayer::channel();
    init_child_telemetry(
        TelemetryConfig::from_env().with_service_name("workerfarm-child"),
        bus,
    )
    .context("Failed to install telemetry")?;

    // One executor serves requests on a single task
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run_process_child(
        workerfarm_harness::registry(),
        Some(bus_events),
    ))
}
