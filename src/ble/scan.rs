use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{AdapterSource, AdapterState, DeviceFilter, DeviceInfo, Scanner};
use crate::errors::AppError;

/// Runs one-shot scans and waits on adapter power changes.
#[derive(Clone)]
pub struct ScanCoordinator {
    adapter: Arc<dyn AdapterSource>,
    scanner: Arc<dyn Scanner>,
}

// Makes sure a scan abandoned mid-flight (caller dropped the future)
// still gets stopped.
struct ScanGuard {
    scanner: Option<Arc<dyn Scanner>>,
}

impl ScanGuard {
    fn disarm(&mut self) -> Option<Arc<dyn Scanner>> {
        self.scanner.take()
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if let Some(scanner) = self.scanner.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = scanner.stop_scan().await {
                        debug!("Ignoring stop_scan error after abandoned scan: {e}");
                    }
                });
            }
        }
    }
}

impl ScanCoordinator {
    pub fn new(adapter: Arc<dyn AdapterSource>, scanner: Arc<dyn Scanner>) -> Self {
        Self { adapter, scanner }
    }

    /// Scans until a device matching `filter` shows up.
    ///
    /// Returns `Ok(None)` if `cancel` fires first. Either way the hardware
    /// scan is stopped exactly once before returning.
    pub async fn scan_for_first_match(
        &self,
        filter: &DeviceFilter,
        cancel: CancellationToken,
    ) -> Result<Option<DeviceInfo>, AppError> {
        let mut results = self.scanner.start_scan(filter).await?;
        let mut guard = ScanGuard {
            scanner: Some(self.scanner.clone()),
        };
        info!("Scanning for {filter}");

        let found = 'scan: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Scan cancelled");
                    break 'scan Ok(None);
                }
                result = results.next() => {
                    match result {
                        Some(device) if filter.matches(&device) => {
                            info!("Found {} ({})", device.display_name(), device.address);
                            break 'scan Ok(Some(device));
                        }
                        Some(device) => {
                            trace!("Skipping {}", device.display_name());
                        }
                        None => {
                            warn!("Scan results ended without a match");
                            break 'scan Err(AppError::ScanEnded);
                        }
                    }
                }
            }
        };

        drop(results);
        if let Some(scanner) = guard.disarm() {
            Self::stop(scanner.as_ref()).await;
        }
        found
    }

    /// Stops any running scan. Errors are only logged, stopping an
    /// already-stopped scan is not a failure.
    pub async fn stop_scan(&self) {
        Self::stop(self.scanner.as_ref()).await;
    }

    async fn stop(scanner: &dyn Scanner) {
        if let Err(e) = scanner.stop_scan().await {
            debug!("Ignoring stop_scan error: {e}");
        }
    }

    /// Resolves once the adapter reports `target`, immediately if it already does.
    pub async fn wait_for_adapter_state(&self, target: AdapterState) -> Result<(), AppError> {
        // Register first so a change between the check and the wait isn't lost
        let mut changes = self.adapter.observe_state_changes().await?;
        if AdapterState::from(self.adapter.is_enabled().await?) == target {
            return Ok(());
        }
        debug!("Waiting for adapter to turn {target:?}");
        while let Some(state) = changes.next().await {
            if state == target {
                return Ok(());
            }
        }
        Err(AppError::AdapterEventsClosed)
    }

    pub async fn is_adapter_present(&self) -> bool {
        self.adapter.is_present().await
    }

    pub async fn is_adapter_enabled(&self) -> Result<bool, AppError> {
        self.adapter.is_enabled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::SimulatedBackend;
    use crate::heart_rate::HEART_RATE_SERVICE_UUID;
    use ntest::timeout;
    use std::time::Duration;

    fn coordinator(sim: &SimulatedBackend) -> ScanCoordinator {
        ScanCoordinator::new(Arc::new(sim.clone()), Arc::new(sim.clone()))
    }

    fn hrm(id: &str, name: &str) -> DeviceInfo {
        DeviceInfo::new(id, Some(name), vec![HEART_RATE_SERVICE_UUID])
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn first_match_stops_the_scan() {
        let sim = SimulatedBackend::new();
        sim.advertise(hrm("a", "Polar H10"));
        let coordinator = coordinator(&sim);

        let found = coordinator
            .scan_for_first_match(
                &DeviceFilter::for_service(HEART_RATE_SERVICE_UUID),
                CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "a");

        let stats = sim.stats();
        assert_eq!(stats.scans_started, 1);
        assert_eq!(stats.scans_stopped, 1);
        assert!(!sim.is_scanning());
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn name_prefix_skips_other_devices() {
        let sim = SimulatedBackend::new();
        sim.advertise(hrm("a", "Garmin HRM"));
        sim.advertise(hrm("b", "Polar H10"));
        let coordinator = coordinator(&sim);

        let filter = DeviceFilter::for_service(HEART_RATE_SERVICE_UUID).with_name_prefix("Polar");
        let found = coordinator
            .scan_for_first_match(&filter, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "b");
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn cancellation_returns_none_and_stops_once() {
        let sim = SimulatedBackend::new();
        let coordinator = coordinator(&sim);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        };
        let filter = DeviceFilter::for_service(HEART_RATE_SERVICE_UUID);
        let (found, _) = tokio::join!(coordinator.scan_for_first_match(&filter, cancel), canceller);
        assert!(found.unwrap().is_none());

        let stats = sim.stats();
        assert_eq!(stats.scans_started, 1);
        assert_eq!(stats.scans_stopped, 1);

        // A second stop hits ScanNotRunning in the backend, which is swallowed
        coordinator.stop_scan().await;
        assert_eq!(sim.stats().scans_stopped, 1);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn scanning_a_powered_off_adapter_fails() {
        let sim = SimulatedBackend::powered_off();
        let coordinator = coordinator(&sim);
        let result = coordinator
            .scan_for_first_match(&DeviceFilter::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::AdapterOff)));
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn adapter_wait_resolves_immediately_when_already_there() {
        let sim = SimulatedBackend::new();
        let coordinator = coordinator(&sim);
        coordinator
            .wait_for_adapter_state(AdapterState::On)
            .await
            .unwrap();

        let stats = sim.stats();
        assert_eq!(stats.observers_registered, 1);
        assert_eq!(stats.observers_unregistered, 1);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn adapter_wait_follows_power_changes() {
        let sim = SimulatedBackend::powered_off();
        let coordinator = coordinator(&sim);

        let power = {
            let sim = sim.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                sim.set_powered(true);
            }
        };
        let (result, _) = tokio::join!(coordinator.wait_for_adapter_state(AdapterState::On), power);
        result.unwrap();

        let stats = sim.stats();
        assert_eq!(stats.observers_registered, 1);
        assert_eq!(stats.observers_unregistered, 1);
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn missing_adapter_cannot_be_observed() {
        let sim = SimulatedBackend::without_adapter();
        let coordinator = coordinator(&sim);
        assert!(!coordinator.is_adapter_present().await);
        assert!(matches!(
            coordinator.wait_for_adapter_state(AdapterState::On).await,
            Err(AppError::NoAdapter)
        ));
    }

    #[tokio::test]
    #[timeout(1000)]
    async fn reports_adapter_power() {
        let sim = SimulatedBackend::powered_off();
        let coordinator = coordinator(&sim);
        assert!(coordinator.is_adapter_present().await);
        assert!(!coordinator.is_adapter_enabled().await.unwrap());

        sim.set_powered(true);
        assert!(coordinator.is_adapter_enabled().await.unwrap());
    }
}
