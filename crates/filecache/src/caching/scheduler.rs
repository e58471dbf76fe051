use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Spawns a task that runs `task` every `period` until `cancel` is triggered.
///
/// The first run happens one `period` after spawning. `task` produces the future for the next
/// run, or `None` to stop the schedule. Runs never overlap: a run that takes longer than
/// `period` delays the next one instead of piling up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Option<Fut> + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(run) = task() else {
                break;
            };
            run.await;
        }

        tracing::debug!("Periodic task `{name}` stopped");
    })
}
