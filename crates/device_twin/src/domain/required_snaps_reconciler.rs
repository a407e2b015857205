use crate::domain::RequiredInstall;
use crate::mqtt::{required_install_topic, EgressPublisher};
use common::domain::{
    Device, DeviceModelRepository, DeviceRepository, DomainError, DomainResult,
    OrganizationRepository, SettingRepository,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Setting that switches reconciliation off when set to `"false"`
pub const REQUIRED_SNAPS_ENABLED_SETTING: &str = "required_snaps.enabled";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Period of the working-set refresh (default: 10 minutes)
    pub install_service_tick_secs: u64,

    /// Period between two device checks (default: 2 seconds)
    pub device_check_tick_secs: u64,

    /// Minimum delay before the same missing set is sent again to a device
    /// (default: 1 hour)
    pub redispatch_after_secs: u64,

    pub enabled: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            install_service_tick_secs: 600,
            device_check_tick_secs: 2,
            redispatch_after_secs: 3600,
            enabled: true,
        }
    }
}

impl ReconcilerConfig {
    pub fn install_service_tick(&self) -> Duration {
        Duration::from_secs(self.install_service_tick_secs.max(1))
    }

    pub fn device_check_tick(&self) -> Duration {
        Duration::from_secs(self.device_check_tick_secs).max(Duration::from_millis(10))
    }

    pub fn redispatch_after(&self) -> Duration {
        Duration::from_secs(self.redispatch_after_secs)
    }
}

/// Outcome of checking one device of the working set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCheck {
    /// Working set is empty
    Idle,
    /// Every required snap is installed
    Satisfied { device_id: String },
    /// A required-install request was published
    Dispatched { device_id: String, snaps: Vec<String> },
    /// The same missing set was published recently
    Suppressed { device_id: String },
}

struct PendingDevice {
    device: Device,
    installed: BTreeSet<String>,
    required: Vec<String>,
}

impl PendingDevice {
    fn missing(&self) -> Vec<String> {
        self.required
            .iter()
            .filter(|name| !self.installed.contains(*name))
            .cloned()
            .collect()
    }
}

struct Dispatched {
    snaps: Vec<String>,
    at: Instant,
}

/// Periodically asks devices to install the snaps their model requires
pub struct RequiredSnapsReconciler {
    organizations: Arc<dyn OrganizationRepository>,
    devices: Arc<dyn DeviceRepository>,
    models: Arc<dyn DeviceModelRepository>,
    settings: Arc<dyn SettingRepository>,
    egress: EgressPublisher,
    config: ReconcilerConfig,
    pending: Mutex<IndexMap<String, PendingDevice>>,
    dispatched: Mutex<HashMap<String, Dispatched>>,
}

impl RequiredSnapsReconciler {
    pub fn new(
        organizations: Arc<dyn OrganizationRepository>,
        devices: Arc<dyn DeviceRepository>,
        models: Arc<dyn DeviceModelRepository>,
        settings: Arc<dyn SettingRepository>,
        egress: EgressPublisher,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            organizations,
            devices,
            models,
            settings,
            egress,
            config,
            pending: Mutex::new(IndexMap::new()),
            dispatched: Mutex::new(HashMap::new()),
        }
    }

    async fn is_enabled(&self) -> DomainResult<bool> {
        let setting = self
            .settings
            .get_setting(REQUIRED_SNAPS_ENABLED_SETTING)
            .await?;
        Ok(setting.as_deref() != Some("false"))
    }

    /// Merge newly seen devices into the working set. Devices still pending
    /// keep their position. Returns the size of the working set.
    ///
    /// Disabling the setting empties the working set.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> DomainResult<usize> {
        let mut pending = self.pending.lock().await;

        if !self.is_enabled().await? {
            debug!("required snaps reconciliation disabled by setting");
            pending.clear();
            self.dispatched.lock().await.clear();
            return Ok(0);
        }

        let mut required_by_model: HashMap<String, Vec<String>> = HashMap::new();
        let mut live: HashSet<String> = HashSet::new();
        let mut added = 0usize;

        for organization in self.organizations.list_organizations().await? {
            for device in self.devices.list_devices(&organization.org_id).await? {
                live.insert(device.device_id.clone());
                if pending.contains_key(&device.device_id) {
                    continue;
                }

                let required = match required_by_model.get(&device.model) {
                    Some(required) => required.clone(),
                    None => {
                        let model = self.models.get_model_required_snaps(&device.model).await?;
                        let required: Vec<String> =
                            model.required_snaps.into_iter().map(|s| s.name).collect();
                        required_by_model.insert(device.model.clone(), required.clone());
                        required
                    }
                };
                if required.is_empty() {
                    continue;
                }

                let installed = self
                    .devices
                    .list_device_snaps(&device.device_id)
                    .await?
                    .into_iter()
                    .map(|snap| snap.name)
                    .collect();

                pending.insert(
                    device.device_id.clone(),
                    PendingDevice {
                        device,
                        installed,
                        required,
                    },
                );
                added += 1;
            }
        }

        // deleted devices leave both the working set and the memo
        pending.retain(|device_id, _| live.contains(device_id));
        self.dispatched
            .lock()
            .await
            .retain(|device_id, _| live.contains(device_id));

        debug!(added, pending = pending.len(), "refreshed required snaps working set");
        Ok(pending.len())
    }

    /// Take the oldest device off the working set and publish its missing
    /// snaps. The device leaves the set even when the publish fails.
    #[instrument(skip(self))]
    pub async fn check_next(&self) -> DomainResult<DeviceCheck> {
        let next = {
            let mut pending = self.pending.lock().await;
            pending.shift_remove_index(0)
        };
        let Some((device_id, entry)) = next else {
            return Ok(DeviceCheck::Idle);
        };

        let missing = entry.missing();
        let mut dispatched = self.dispatched.lock().await;

        if missing.is_empty() {
            dispatched.remove(&device_id);
            return Ok(DeviceCheck::Satisfied { device_id });
        }

        if let Some(previous) = dispatched.get(&device_id) {
            if previous.snaps == missing && previous.at.elapsed() < self.config.redispatch_after() {
                debug!(device_id = %device_id, "required install already requested");
                return Ok(DeviceCheck::Suppressed { device_id });
            }
        }

        let request = RequiredInstall::for_snaps(missing.iter().cloned());
        let payload =
            serde_json::to_vec(&request).map_err(|e| DomainError::PayloadError(e.to_string()))?;
        self.egress
            .publish(required_install_topic(&entry.device.serial), payload)
            .await?;

        info!(
            device_id = %device_id,
            serial = %entry.device.serial,
            missing = missing.len(),
            "requested install of required snaps"
        );
        dispatched.insert(
            device_id.clone(),
            Dispatched {
                snaps: missing.clone(),
                at: Instant::now(),
            },
        );

        Ok(DeviceCheck::Dispatched {
            device_id,
            snaps: missing,
        })
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Refresh, then check every pending device without waiting between
    /// checks. Returns the number of published requests.
    pub async fn run_cycle(&self) -> DomainResult<usize> {
        self.refresh().await?;

        let mut published = 0usize;
        loop {
            match self.check_next().await {
                Ok(DeviceCheck::Idle) => return Ok(published),
                Ok(DeviceCheck::Dispatched { .. }) => published += 1,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "required snaps check failed"),
            }
        }
    }

    /// Supervisor loop: refresh on the install tick, check one device per
    /// device tick while the working set is not empty
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(
            install_service_tick_secs = self.config.install_service_tick_secs,
            device_check_tick_secs = self.config.device_check_tick_secs,
            "required snaps reconciler started"
        );

        let mut install_tick = interval(self.config.install_service_tick());
        install_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut check_tick = interval(self.config.device_check_tick());
        check_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut checking = false;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = install_tick.tick() => match self.refresh().await {
                    Ok(pending) => {
                        if pending > 0 && !checking {
                            check_tick.reset();
                        }
                        checking = pending > 0;
                    }
                    Err(e) => warn!(error = %e, "failed to refresh required snaps working set"),
                },
                _ = check_tick.tick(), if checking => {
                    if let Err(e) = self.check_next().await {
                        warn!(error = %e, "required snaps check failed");
                    }
                    checking = self.pending_len().await > 0;
                },
            }
        }

        info!("required snaps reconciler stopped");
        Ok(())
    }
}
