use crate::{
    executors::local::RunningJob,
    monitor::{kill, KillReason, MonitorError},
};
use std::time::Duration;

/// Kill `running` if it is still alive and has run longer than its timeout
pub fn enforce(running: &mut RunningJob, grace: Duration) -> Result<Option<KillReason>, MonitorError> {
    if !running.is_alive()? || running.elapsed() <= running.job.timeout() {
        return Ok(None);
    }

    kill(running, KillReason::Timeout, grace)?;

    Ok(Some(KillReason::Timeout))
}
