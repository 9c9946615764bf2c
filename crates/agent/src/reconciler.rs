//! Device reconciliation engine
//!
//! One [`DeviceManager`] per node tracks every configured device: it polls
//! the configured targets for availability, releases attached devices no
//! workload holds any more, and performs the import/attach dance when a
//! device is allocated. All mutable state lives behind a single async
//! mutex, so a refresh cycle and an allocation never interleave.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info, warn};

use common::Broadcaster;
use protocol::{Connection, Target, UsbDevice};
use vhci::{AttrStore, VhciDriver};

use crate::catalog::{AttachedDevice, DeviceKey, DeviceSpec, KnownDevice, MountSpec};
use crate::oracle::UsageOracle;

/// Startup refresh retries, for nodes that boot before their targets.
const STARTUP_REFRESH_ATTEMPTS: u32 = 10;
const STARTUP_REFRESH_BACKOFF: Duration = Duration::from_secs(10);

/// Tunables for the attach readiness poll.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// How often to re-check the port table while waiting for an attached
    /// device's node to appear.
    pub attach_wait_attempts: u32,
    pub attach_wait_step: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            attach_wait_attempts: 5,
            attach_wait_step: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("requested device {0} does not exist")]
    UnknownDevice(DeviceKey),
    #[error("requested device {0} is not available")]
    NotAvailable(DeviceKey),
    #[error("device {key} attached to port {port} but its node never appeared")]
    AttachTimeout { key: DeviceKey, port: u8 },
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error(transparent)]
    Driver(#[from] vhci::Error),
}

/// What one refresh cycle accomplished.
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Keys whose availability or observed properties changed.
    pub changed: Vec<DeviceKey>,
    /// Targets skipped because listing them failed.
    pub skipped_targets: Vec<Target>,
    /// Orphaned devices that could not be detached this cycle.
    pub orphan_failures: usize,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.skipped_targets.is_empty() && self.orphan_failures == 0
    }
}

struct EngineState<S> {
    driver: VhciDriver<S>,
    known: HashMap<DeviceKey, KnownDevice>,
    attached: HashMap<DeviceKey, AttachedDevice>,
    subscribers: Broadcaster<Vec<DeviceKey>>,
}

pub struct DeviceManager<S, O> {
    state: Mutex<EngineState<S>>,
    oracle: Option<O>,
    settings: ManagerSettings,
}

impl<S: AttrStore, O: UsageOracle> DeviceManager<S, O> {
    pub fn new(driver: VhciDriver<S>, oracle: Option<O>, settings: ManagerSettings) -> Self {
        Self {
            state: Mutex::new(EngineState {
                driver,
                known: HashMap::new(),
                attached: HashMap::new(),
                subscribers: Broadcaster::new(),
            }),
            oracle,
            settings,
        }
    }

    /// Add the devices of one resource to the catalog, returning their keys
    /// in spec order. Registering the same spec twice is a no-op.
    pub async fn register(
        &self,
        resource: &str,
        specs: impl IntoIterator<Item = DeviceSpec>,
    ) -> anyhow::Result<Vec<DeviceKey>> {
        let mut state = self.state.lock().await;
        let mut keys = Vec::new();
        for spec in specs {
            let key = spec.key(resource)?;
            debug!(key = %key, target = %spec.target, "registered device");
            state
                .known
                .entry(key.clone())
                .or_insert_with(|| KnownDevice::new(spec));
            keys.push(key);
        }
        Ok(keys)
    }

    /// Receive the changed-key set of every future refresh cycle. Slow
    /// receivers miss updates rather than stall the engine.
    pub async fn subscribe(&self) -> async_channel::Receiver<Vec<DeviceKey>> {
        self.state.lock().await.subscribers.subscribe()
    }

    /// Bring the engine up: refresh until the first clean cycle, then adopt
    /// devices a previous run left attached.
    pub async fn start(&self) -> anyhow::Result<()> {
        for attempt in 1..=STARTUP_REFRESH_ATTEMPTS {
            let report = self.refresh_all().await;
            if report.is_clean() {
                break;
            }
            warn!(
                attempt,
                skipped = report.skipped_targets.len(),
                "initial device refresh incomplete"
            );
            if attempt < STARTUP_REFRESH_ATTEMPTS {
                sleep(STARTUP_REFRESH_BACKOFF).await;
            }
        }
        self.adopt_attached().await;
        info!("device manager ready");
        Ok(())
    }

    /// One full reconciliation cycle: drop orphaned attachments first so
    /// their devices can reappear in the listings, then refresh every
    /// configured target. Changed keys are broadcast to subscribers.
    pub async fn refresh_all(&self) -> RefreshReport {
        let mut state = self.state.lock().await;
        let mut report = RefreshReport::default();

        match self.release_orphans(&mut state).await {
            Ok(failures) => report.orphan_failures = failures,
            Err(err) => {
                warn!(error = %err, "failed to query device usage; keeping attachments");
                report.orphan_failures = state.attached.len();
            }
        }

        let mut targets: Vec<Target> = state
            .known
            .values()
            .map(|device| device.target().clone())
            .collect();
        targets.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        targets.dedup();

        for target in targets {
            match Self::refresh_target(&mut state, &target).await {
                Ok(mut changed) => report.changed.append(&mut changed),
                Err(err) => {
                    warn!(target = %target, error = %err, "skipping target; refresh failed");
                    report.skipped_targets.push(target);
                }
            }
        }

        if !report.changed.is_empty() {
            state.subscribers.broadcast(report.changed.clone());
        }
        report
    }

    /// Detach attached devices no workload holds. Individual detach
    /// failures are retried on the next cycle.
    async fn release_orphans(&self, state: &mut EngineState<S>) -> anyhow::Result<usize> {
        if state.attached.is_empty() {
            return Ok(0);
        }
        let Some(oracle) = &self.oracle else {
            anyhow::bail!("no usage oracle configured");
        };
        let held = oracle.held_devices().await?;

        let mut failures = 0;
        let keys: Vec<DeviceKey> = state.attached.keys().cloned().collect();
        for key in keys {
            if let Some(witness) = held.get(&key) {
                debug!(key = %key, witness = %witness, "device still in use");
                continue;
            }
            let Some(entry) = state.attached.get(&key) else {
                continue;
            };
            let port = entry.port;
            info!(key = %key, port, "detaching orphaned device");
            match state.driver.detach(port) {
                Ok(()) => {
                    state.attached.remove(&key);
                }
                Err(err) => {
                    warn!(key = %key, port, error = %err, "failed to detach orphan");
                    failures += 1;
                }
            }
        }
        Ok(failures)
    }

    /// List one target and fold the result into every known device that
    /// points at it. Attached devices are skipped; an imported device no
    /// longer shows up in its target's export list.
    async fn refresh_target(
        state: &mut EngineState<S>,
        target: &Target,
    ) -> anyhow::Result<Vec<DeviceKey>> {
        let mut conn = Connection::dial(target).await?;
        let exported = conn.list().await?;
        drop(conn);

        let EngineState {
            known, attached, ..
        } = state;

        let mut changed = Vec::new();
        for (key, device) in known.iter_mut() {
            if device.target() != target || attached.contains_key(key) {
                continue;
            }

            let matched = exported
                .iter()
                .find(|candidate| device.spec.filter.matches(candidate));
            let was_available = device.available;
            let mut properties_changed = false;

            match matched {
                Some(candidate) => {
                    if device.observed.as_ref() != Some(candidate) {
                        info!(key = %key, device = %candidate, "device available");
                        device.observed = Some(candidate.clone());
                        properties_changed = true;
                    }
                    device.available = true;
                }
                None => {
                    if was_available {
                        info!(key = %key, target = %target, "device no longer exported");
                    }
                    device.available = false;
                    device.observed = None;
                }
            }

            if properties_changed || was_available != device.available {
                changed.push(key.clone());
            }
        }
        Ok(changed)
    }

    /// Make every requested device available to a workload, attaching those
    /// that are not already on a local port. The request is validated as a
    /// whole before any attach happens.
    pub async fn allocate(
        &self,
        keys: &[DeviceKey],
    ) -> Result<Vec<MountSpec>, AllocationError> {
        let mut state = self.state.lock().await;

        for key in keys {
            let device = state
                .known
                .get(key)
                .ok_or_else(|| AllocationError::UnknownDevice(key.clone()))?;
            if !device.available && !state.attached.contains_key(key) {
                return Err(AllocationError::NotAvailable(key.clone()));
            }
        }

        let mut mounts = Vec::new();
        for key in keys {
            let attached = match state.attached.get(key) {
                Some(attached) => attached.clone(),
                None => self.attach_device(&mut state, key).await?,
            };
            mounts.push(MountSpec {
                host_path: attached.dev_mount_path.clone(),
                container_path: attached.dev_mount_path.clone(),
                permissions: "mrw".to_owned(),
            });
            if let Some(device) = state.known.get(key) {
                mounts.extend(device.spec.extra_devices.iter().cloned());
            }
        }
        Ok(mounts)
    }

    /// Import the device over TCP, hand its socket to the controller, and
    /// poll until the kernel reports the port in use and the device node
    /// exists.
    async fn attach_device(
        &self,
        state: &mut EngineState<S>,
        key: &DeviceKey,
    ) -> Result<AttachedDevice, AllocationError> {
        let device = state
            .known
            .get(key)
            .ok_or_else(|| AllocationError::UnknownDevice(key.clone()))?;
        let target = device.target().clone();
        let bus_id = device
            .observed
            .as_ref()
            .map(|observed| observed.bus_id.clone())
            .unwrap_or_default();
        let extra_paths: Vec<_> = device
            .spec
            .extra_devices
            .iter()
            .map(|extra| extra.host_path.clone())
            .collect();

        let mut conn = Connection::dial(&target).await?;
        let description = conn.import(&bus_id).await?;
        let port = state.driver.attach(
            conn.stream(),
            description.device_id(),
            description.usb_speed(),
        )?;
        // The kernel holds its own reference to the socket from here on.
        drop(conn);
        info!(key = %key, port, device = %description.summary(), "attached device");

        for attempt in 1..=self.settings.attach_wait_attempts {
            if let Err(err) = state.driver.refresh() {
                warn!(port, attempt, error = %err, "port table refresh failed while waiting");
            } else {
                let slot = &state.driver.slots()[usize::from(port)];
                if slot.is_attached()
                    && slot.dev_mount_path.exists()
                    && extra_paths.iter().all(|path| path.exists())
                {
                    let attached = AttachedDevice {
                        device: UsbDevice {
                            vendor: description.vendor,
                            product: description.product,
                            bus_id: bus_id.clone(),
                        },
                        target,
                        port,
                        dev_mount_path: slot.dev_mount_path.clone(),
                    };
                    state.attached.insert(key.clone(), attached.clone());
                    return Ok(attached);
                }
            }
            if attempt < self.settings.attach_wait_attempts {
                sleep(self.settings.attach_wait_step).await;
            }
        }

        warn!(key = %key, port, "device node never appeared; detaching");
        if let Err(err) = state.driver.detach(port) {
            warn!(port, error = %err, "failed to detach unready device");
        }
        Err(AllocationError::AttachTimeout {
            key: key.clone(),
            port,
        })
    }

    /// Pair ports left in use by a previous run with configured devices.
    ///
    /// The remote bus id is not recoverable from local state, so pairing
    /// goes by vendor and product alone; a slot that matches nothing in the
    /// catalog is logged and left attached.
    pub async fn adopt_attached(&self) {
        let mut state = self.state.lock().await;
        let EngineState {
            driver,
            known,
            attached,
            ..
        } = &mut *state;

        for slot in driver.slots().iter().filter(|slot| slot.is_attached()) {
            let probe = UsbDevice {
                vendor: slot.local_device.vendor,
                product: slot.local_device.product,
                bus_id: String::new(),
            };
            let matched = known.iter().find(|(key, device)| {
                device.spec.filter.matches(&probe) && !attached.contains_key(key)
            });
            match matched {
                Some((key, device)) => {
                    info!(key = %key, port = slot.port, device = %probe, "adopted attached device");
                    attached.insert(
                        key.clone(),
                        AttachedDevice {
                            device: probe,
                            target: device.target().clone(),
                            port: slot.port,
                            dev_mount_path: slot.dev_mount_path.clone(),
                        },
                    );
                }
                None => {
                    warn!(port = slot.port, device = %probe, "attached device matches no configured spec");
                }
            }
        }
    }

    /// Periodic refresh until `shutdown` flips. Closes the subscriber
    /// channels on exit so watchers drain and stop.
    pub async fn run_refresh_loop(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(period_secs = period.as_secs(), "starting refresh loop");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("scheduled device refresh");
                    let report = self.refresh_all().await;
                    if !report.is_clean() {
                        warn!(
                            skipped = report.skipped_targets.len(),
                            orphan_failures = report.orphan_failures,
                            "refresh cycle incomplete"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.state.lock().await.subscribers.close();
        info!("refresh loop stopped");
    }

    /// Keys from `keys` that can currently be allocated.
    pub async fn available_devices(&self, keys: &HashSet<DeviceKey>) -> Vec<DeviceKey> {
        let state = self.state.lock().await;
        let mut available: Vec<DeviceKey> = keys
            .iter()
            .filter(|key| {
                state.attached.contains_key(*key)
                    || state.known.get(*key).is_some_and(|device| device.available)
            })
            .cloned()
            .collect();
        available.sort();
        available
    }

    /// Current attachments, for logging and inspection.
    pub async fn attached(&self) -> Vec<(DeviceKey, AttachedDevice)> {
        let state = self.state.lock().await;
        let mut attached: Vec<_> = state
            .attached
            .iter()
            .map(|(key, device)| (key.clone(), device.clone()))
            .collect();
        attached.sort_by(|a, b| a.0.cmp(&b.0));
        attached
    }

    /// Catalog entry for one key, if registered.
    pub async fn known_device(&self, key: &DeviceKey) -> Option<KnownDevice> {
        self.state.lock().await.known.get(key).cloned()
    }
}
