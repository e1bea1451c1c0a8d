//! Background eviction of idle connections.

use std::sync::{Arc, Weak};

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, Instrument as _};

use super::Shared;

/// Start the reaper for a pool, if there is a runtime to run it on.
///
/// The task holds only a weak reference, so it stops once the pool is dropped
/// or shut down.
pub(super) fn spawn(shared: &Arc<Shared>) {
    let Some(interval) = shared.config.reap_interval.filter(|i| !i.is_zero()) else {
        return;
    };

    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("no tokio runtime, idle connections will only be reaped on checkout");
        return;
    };

    let pool: Weak<Shared> = Arc::downgrade(shared);
    handle.spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(shared) = pool.upgrade() else {
                    trace!("pool dropped, stopping reaper");
                    break;
                };

                if !shared.reap() {
                    trace!("pool closed, stopping reaper");
                    break;
                }
            }
        }
        .instrument(tracing::trace_span!("reaper")),
    );
}
