//! Background passes on a timer.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{EventSink, LockPolicy, SyncCoordinator, SyncError, SyncEvent};

/// Run a pass for every device with pending operations each `interval`
/// until `shutdown` fires.
pub fn spawn_periodic_sync(
    coordinator: Arc<SyncCoordinator>,
    events: Arc<dyn EventSink>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Periodic sync started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    run_scheduled_passes(&coordinator, events.as_ref(), &shutdown).await;
                }
            }
        }

        tracing::info!("Periodic sync stopped");
    })
}

/// One scheduler tick. Returns how many passes ran to completion.
///
/// Devices are synced concurrently. A device that already has a pass
/// running is skipped rather than queued.
pub async fn run_scheduled_passes(
    coordinator: &SyncCoordinator,
    events: &dyn EventSink,
    cancel: &CancellationToken,
) -> usize {
    let evicted = coordinator.evict_expired();
    if evicted > 0 {
        tracing::debug!(evicted, "Evicted expired cache entries");
    }

    let devices = match coordinator.devices_with_pending().await {
        Ok(devices) => devices,
        Err(err) => {
            tracing::warn!("Could not list devices with pending operations: {}", err);
            return 0;
        }
    };

    let passes = devices.iter().map(|key| async move {
        match coordinator.sync_device(key, LockPolicy::Reject, cancel).await {
            Ok(result) => {
                let event = SyncEvent::from_result(key, &result);
                if event.is_noteworthy() {
                    events.publish(&event);
                }
                true
            }
            Err(SyncError::Busy(_)) => false,
            Err(err) => {
                tracing::warn!(device = %key, "Scheduled pass failed: {}", err);
                false
            }
        }
    });

    join_all(passes).await.into_iter().filter(|ran| *ran).count()
}
