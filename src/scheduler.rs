// Scheduler module - supervises the per-device collection tasks
//
// This module implements the core scheduling logic using Tokio tasks.
// Each configured device gets its own collector and its own interval timer.
//
// # Architecture
// - Uses Tokio's interval timer for periodic execution
// - Each device runs in its own async task
// - Tasks run concurrently and independently
// - A slow or failing device never delays the others

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::client::{DeviceApi, HttpDeviceClient};
use crate::collector::{CollectorHandle, InstanceCollector};
use crate::config::DeviceRecord;
use crate::metrics::MetricRegistry;

/// Collector supervisor
///
/// Builds one [`InstanceCollector`] per device, all sharing the process-wide
/// registry, and drives each of them from its own timer.
pub struct CollectorScheduler {
    handles: Vec<CollectorHandle>,
    interval: Duration,
}

impl CollectorScheduler {
    /// Creates collectors for every device record
    ///
    /// A device whose HTTP client cannot be built is logged and left out; the
    /// remaining devices are still scheduled.
    pub fn new(
        devices: Vec<DeviceRecord>,
        registry: Arc<MetricRegistry>,
        interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        let mut handles = Vec::with_capacity(devices.len());

        for device in devices {
            let name = device.name.clone();
            match HttpDeviceClient::new(device, request_timeout) {
                Ok(client) => {
                    let api: Arc<dyn DeviceApi> = Arc::new(client);
                    let collector = InstanceCollector::new(name, api, Arc::clone(&registry));
                    handles.push(CollectorHandle::new(collector));
                }
                Err(e) => error!(instance = %name, "Failed to create device client: {}", e),
            }
        }

        Self::from_handles(handles, interval)
    }

    /// Creates a scheduler over already-built collectors
    pub fn from_handles(handles: Vec<CollectorHandle>, interval: Duration) -> Self {
        CollectorScheduler { handles, interval }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Starts one task per collector and waits on them
    ///
    /// The tasks run for the lifetime of the process, so under normal
    /// operation this never returns.
    pub async fn start(self) {
        info!(
            "Starting {} collector task(s), interval {}s",
            self.handles.len(),
            self.interval.as_secs()
        );

        let period = self.interval;
        let tasks: Vec<_> = self
            .handles
            .into_iter()
            .map(|handle| tokio::spawn(Self::run_device_task(handle, period)))
            .collect();

        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Collector task panicked: {}", e);
            }
        }

        // If we reach here, all tasks have stopped (shouldn't happen in normal operation)
        error!("All collector tasks have stopped");
    }

    /// Drives a single collector from its own timer
    ///
    /// Each tick spawns a cycle unless the previous one is still running;
    /// overlapping ticks are dropped, not queued.
    async fn run_device_task(handle: CollectorHandle, period: Duration) {
        info!(instance = handle.name(), "Starting collection loop (every {}s)", period.as_secs());

        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // The first tick completes immediately
            timer.tick().await;

            // The spawned cycle reports its own outcome
            if handle.tick().is_none() {
                warn!(
                    instance = handle.name(),
                    state = ?handle.state(),
                    "Previous cycle still in progress, skipping this interval"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CollectError;
    use crate::collector::CollectorState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Device whose histogram fetch blocks until released
    #[derive(Default)]
    struct SlowDevice {
        fetches: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl DeviceApi for SlowDevice {
        async fn login(&self) -> Result<String, CollectError> {
            Ok("token".to_string())
        }

        async fn fetch_histogram(&self, _token: &str) -> Result<String, CollectError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok("{}".to_string())
        }

        async fn fetch_cyclic_backup(&self, _token: &str) -> Result<String, CollectError> {
            Ok(r#"{"performanceMetrics": {}}"#.to_string())
        }
    }

    fn device(name: &str) -> DeviceRecord {
        DeviceRecord {
            name: name.to_string(),
            login_url: format!("https://{name}/login"),
            api_url: format!("https://{name}/api"),
            username: "u".to_string(),
            password: "p".to_string(),
        }
    }

    #[test]
    fn test_one_collector_per_device() {
        let registry = Arc::new(MetricRegistry::new().unwrap());
        let scheduler = CollectorScheduler::new(
            vec![device("a"), device("b"), device("c")],
            registry,
            Duration::from_secs(10),
            Duration::from_secs(5),
        );

        assert_eq!(scheduler.len(), 3);
        let names: Vec<_> = scheduler.handles.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_loop_skips_ticks_while_cycle_runs() {
        let registry = Arc::new(MetricRegistry::new().unwrap());
        let device = Arc::new(SlowDevice::default());
        let handle = CollectorHandle::new(InstanceCollector::new(
            "slow".to_string(),
            device.clone(),
            registry,
        ));

        let task = tokio::spawn(CollectorScheduler::run_device_task(
            handle.clone(),
            Duration::from_secs(10),
        ));

        // Four ticks elapse while the first cycle is stuck in its fetch
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(device.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), CollectorState::Collecting);

        device.release.notify_one();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(device.fetches.load(Ordering::SeqCst), 2);

        task.abort();
    }
}
