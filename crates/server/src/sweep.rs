use std::sync::Arc;
use std::time::Duration;

use gradplan_agent::{GenerationJobService, WorkerCycleRunner};
use gradplan_core::config::WorkerConfig;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Runs a worker cycle every `sweep_interval_secs`. Returns `None` when the interval is zero,
/// which leaves sweeping to an external scheduler calling `/internal/worker-cycle`.
pub fn spawn(service: Arc<GenerationJobService>, config: &WorkerConfig) -> Option<JoinHandle<()>> {
    if config.sweep_interval_secs == 0 {
        return None;
    }

    let period = Duration::from_secs(config.sweep_interval_secs);
    let runner = WorkerCycleRunner::new(service, config.clone());
    info!(
        event_name = "system.sweep.start",
        correlation_id = "bootstrap",
        interval_secs = period.as_secs(),
        "in-process worker sweep started"
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = runner.run_cycle(None).await {
                error!(
                    event_name = "system.sweep.cycle_failed",
                    correlation_id = "sweep",
                    error = %error,
                    "worker sweep cycle failed"
                );
            }
        }
    }))
}
