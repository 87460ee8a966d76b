use crate::{
    hardware::Hardware,
    profile::DeviceProfile,
    result::{Result, SaneError},
    scanner::Scanner,
    store::CalibrationStore,
    stream::{DetachedTask, Scheduler},
    transport::{Transport, TransportOpener},
    Device,
};
use bstr::{BStr, BString, ByteSlice};
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

const DEFAULT_STORE_DIR: &str = ".linescan";

/// A device known to the backend, shared with the session that opened it.
pub(crate) struct AttachedDevice {
    pub(crate) device: Device,
    pub(crate) profile: DeviceProfile,
    opener: Box<dyn TransportOpener>,
    in_use: AtomicBool,
    /// Reader task that still owns the hardware after a timed out cancel.
    detached: Mutex<Option<DetachedTask>>,
}

impl AttachedDevice {
    pub(crate) fn lock(&self) -> Result<()> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                log::debug!("Device {} is already open", self.device);
                SaneError::DeviceBusy
            })
    }

    pub(crate) fn unlock(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    /// Keeps the device busy until `task` exits.
    pub(crate) fn hold(&self, task: DetachedTask) {
        log::warn!("{} stays busy until its reader task exits", self.device);
        *self.detached.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Hardware left by a detached reader task. `DeviceBusy` while the task
    /// still runs, `Ok(None)` when there is nothing to take back.
    pub(crate) fn reclaim(&self) -> Result<Option<Hardware>> {
        let mut detached = self.detached.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(task) = detached.as_ref() else {
            return Ok(None);
        };

        let hw = task.try_reclaim().inspect_err(|_| {
            log::debug!("Reader task of {} is still running", self.device);
        })?;
        *detached = None;

        match &hw {
            Some(_) => log::debug!("Reclaimed the transport of {}", self.device),
            None => log::warn!("Lost the transport of {}, reopening it", self.device),
        }
        Ok(hw)
    }

    pub(crate) fn open_transport(&self) -> Result<Box<dyn Transport>> {
        log::trace!("Open transport for '{}'", self.device.name);
        self.opener.open(self.device.name.as_bstr())
    }
}

/// Registry of attached devices.
pub struct Backend {
    devices: Vec<Arc<AttachedDevice>>,
    store: Option<CalibrationStore>,
    scheduler: Scheduler,
}

impl Backend {
    pub fn new() -> Self {
        log::trace!("Backend init");

        Self {
            devices: Vec::new(),
            store: CalibrationStore::user_default(DEFAULT_STORE_DIR),
            scheduler: Scheduler::current(),
        }
    }

    /// Where calibration results are cached, `None` to keep them in memory only.
    pub fn with_store(mut self, store: Option<CalibrationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Registers a device. Attaching a name twice keeps the first registration.
    pub fn attach<N>(&mut self, name: N, profile: DeviceProfile, opener: Box<dyn TransportOpener>) -> Device
    where
        N: Into<BString>,
    {
        let name = name.into();
        if let Some(existing) = self.find(name.as_bstr()) {
            log::debug!("Device {} already attached", existing.device);
            return existing.device.clone();
        }

        let device = Device::new(name, &profile);
        log::info!("Attached {device}");

        self.devices.push(Arc::new(AttachedDevice {
            device: device.clone(),
            profile,
            opener,
            in_use: AtomicBool::new(false),
            detached: Mutex::new(None),
        }));

        device
    }

    fn find(&self, name: &BStr) -> Option<&Arc<AttachedDevice>> {
        self.devices.iter().find(|attached| attached.device.name.as_bstr() == name)
    }

    pub fn get_all_devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|attached| attached.device.clone())
            .collect()
    }

    pub fn find_device_by_name<N>(&self, name: N) -> Option<Device>
    where
        N: AsRef<[u8]>,
    {
        self.find(BStr::new(&name)).map(|attached| attached.device.clone())
    }

    pub fn profile<N>(&self, name: N) -> Option<&DeviceProfile>
    where
        N: AsRef<[u8]>,
    {
        self.find(BStr::new(&name)).map(|attached| &attached.profile)
    }

    /// Opens an exclusive session on a device.
    pub fn open<N>(&self, name: N) -> Result<Scanner>
    where
        N: AsRef<[u8]>,
    {
        let Some(attached) = self.find(BStr::new(&name)) else {
            log::debug!("No device named '{}'", BStr::new(&name));
            return Err(SaneError::Inval);
        };

        Scanner::open(attached.clone(), self.store.clone(), self.scheduler.clone())
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("devices", &self.get_all_devices())
            .field("store", &self.store)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        log::trace!("Backend exit");
    }
}
