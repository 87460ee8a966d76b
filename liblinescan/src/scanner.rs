use crate::{
    backend::AttachedDevice,
    calibration::{CalibrationMode, CalibrationTables, Calibrator},
    geometry::{plan, plan_calibration, ScanAction, ScanParameters},
    hardware::Hardware,
    options::{Info, OptionId, ScanOptions, ScannerOption, Value},
    packing::{LinePacker, VerticalInterpolator},
    profile::DeviceProfile,
    reader::{ChannelLines, LineReader},
    result::{Result, SaneError},
    shading::{Corrector, ShadingTables, ToneTables},
    store::CalibrationStore,
    stream::{Acquisition, ScanStream, Scheduler, Stopped},
    Device, Parameters,
};
use bstr::BStr;
use std::{io, sync::Arc};

/// An open session on one device.
pub struct Scanner {
    device: Arc<AttachedDevice>,
    hw: Option<Hardware>,
    options: ScanOptions,
    calibration: Option<CalibrationTables>,
    store: Option<CalibrationStore>,
    scheduler: Scheduler,
    stream: Option<ScanStream>,
    active: Option<ScanParameters>,
    non_blocking: bool,
}

/// Pipeline stages built before the reader task takes over the hardware.
struct Pipeline {
    reader: LineReader,
    corrector: Corrector,
    packer: LinePacker,
    vertical: Option<VerticalInterpolator>,
    work: ChannelLines,
}

impl Scanner {
    pub(crate) fn open(
        device: Arc<AttachedDevice>,
        store: Option<CalibrationStore>,
        scheduler: Scheduler,
    ) -> Result<Self> {
        device.lock()?;

        log::trace!("Open {}", device.device);
        let hw = match device.reclaim().and_then(|hw| acquire(&device, hw)) {
            Ok(hw) => hw,
            Err(err) => {
                device.unlock();
                return Err(err);
            }
        };

        let profile = &device.profile;
        let mut scanner = Self {
            hw: Some(hw),
            options: ScanOptions::new(profile),
            calibration: None,
            store,
            scheduler,
            stream: None,
            active: None,
            non_blocking: false,
            device: device.clone(),
        };

        scanner.calibration = scanner.load_calibration();
        if scanner.calibration.is_none() {
            log::info!("{} is uncalibrated, calibration runs before the first scan", scanner.device.device);
        }

        Ok(scanner)
    }

    fn load_calibration(&self) -> Option<CalibrationTables> {
        let store = self.store.as_ref()?;
        let profile = self.profile();
        let pixels = plan_calibration(profile, ScanAction::CalibrateWhite).ok()?.pixel_xs;
        store.load(&profile.identity(), pixels as usize)
    }

    pub fn get_device(&self) -> &Device {
        &self.device.device
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.device.profile
    }

    pub fn options(&self) -> Vec<ScannerOption> {
        self.options.descriptors(self.profile())
    }

    pub fn option(&self, id: OptionId) -> ScannerOption {
        self.options.descriptor(self.profile(), id)
    }

    pub fn get_option(&self, id: OptionId) -> Result<Value> {
        self.options.get(id)
    }

    pub fn set_option(&mut self, id: OptionId, value: Value) -> Result<Info> {
        if self.is_scanning() {
            log::debug!("Refusing to change {id:?} while scanning");
            return Err(SaneError::DeviceBusy);
        }

        let profile = &self.device.profile;
        self.options.set(profile, id, value)
    }

    pub fn set_option_by_name<N: AsRef<[u8]>>(&mut self, name: N, value: Value) -> Result<Info> {
        let id = find_option(&name)?;
        self.set_option(id, value)
    }

    /// Sets an option from its textual form.
    pub fn set_option_text<N: AsRef<[u8]>>(&mut self, name: N, text: &BStr) -> Result<Info> {
        let id = find_option(&name)?;
        if self.is_scanning() {
            return Err(SaneError::DeviceBusy);
        }

        let profile = &self.device.profile;
        self.options.set_from_text(profile, id, text)
    }

    pub fn is_scanning(&self) -> bool {
        self.stream.as_ref().is_some_and(|stream| !stream.is_finished())
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration(&self) -> Option<&CalibrationTables> {
        self.calibration.as_ref()
    }

    /// Drops the in-memory calibration so the next start recalibrates.
    pub fn invalidate_calibration(&mut self) {
        self.calibration = None;
    }

    /// Frame layout of the running scan, or of the scan the current options describe.
    pub fn get_parameters(&self) -> Result<Parameters> {
        if let Some(params) = self.active.as_ref().filter(|_| self.is_scanning()) {
            return Ok(params.into());
        }

        let profile = self.profile();
        let params = plan(&self.options.request(profile), profile)?;
        Ok((&params).into())
    }

    /// Lines the running scan has yet to pull from the device.
    pub fn lines_remaining(&self) -> Option<u32> {
        self.stream.as_ref().map(ScanStream::lines_remaining)
    }

    pub fn start(&mut self) -> Result<PageReader<'_>> {
        self.start_scan()?;
        Ok(PageReader(self))
    }

    /// Calibrates if needed, configures the device and starts the reader task.
    pub fn start_scan(&mut self) -> Result<()> {
        if self.is_scanning() {
            log::debug!("Scan already in progress");
            return Err(SaneError::DeviceBusy);
        }
        self.cancel();

        let device = self.device.clone();
        let profile = &device.profile;

        let params = plan(&self.options.request(profile), profile)?;
        let tone = ToneTables::new(&self.options.tone_settings())?;

        let mut hw = match self.hw.take() {
            Some(hw) => hw,
            None => acquire(&device, device.reclaim()?)?,
        };

        let pipeline = match self.prepare(&mut hw, profile, &params, tone) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                log::error!("Failed to start scan: {err}");
                hw.park();
                self.hw = Some(hw);
                return Err(err);
            }
        };

        let acquisition = Acquisition {
            hw,
            reader: pipeline.reader,
            corrector: pipeline.corrector,
            packer: pipeline.packer,
            vertical: pipeline.vertical,
            work: pipeline.work,
            lines: params.pixel_ys,
        };

        let stream = match ScanStream::start(acquisition, &self.scheduler, profile.timing.cancel_timeout) {
            Ok(stream) => stream,
            Err((err, acquisition)) => {
                log::error!("Failed to start reader task: {err}");
                let mut hw = acquisition.hw;
                hw.park();
                self.hw = Some(hw);
                return Err(err);
            }
        };

        self.stream = Some(stream);
        self.active = Some(params);
        self.non_blocking = false;

        log::info!("Scan started on {}", device.device);

        Ok(())
    }

    fn prepare(
        &mut self,
        hw: &mut Hardware,
        profile: &DeviceProfile,
        params: &ScanParameters,
        tone: ToneTables,
    ) -> Result<Pipeline> {
        if self.calibration.is_none() || self.options.calibrate {
            self.calibrate(hw, profile)?;
        }
        let Some(calibration) = self.calibration.as_ref() else {
            return Err(SaneError::Inval);
        };

        let shading = ShadingTables::for_scan(calibration, params, profile)?;
        let corrector = Corrector::new(shading, tone, profile.gray_channel);
        let reader = LineReader::new(params)?;
        let packer = LinePacker::new(params, self.options.threshold())?;
        let pixels = params.pixel_xs as usize;
        let vertical = if params.interpolate_y {
            Some(VerticalInterpolator::new(params.channels(), pixels)?)
        } else {
            None
        };
        let work = ChannelLines::new(params.channels(), pixels)?;

        hw.carriage_home()?;
        hw.wait_for_positioning()?;
        hw.setup_scan(&params.setup_command()?)?;
        hw.set_exposure(&calibration.exposure)?;
        hw.set_afe(&calibration.afe)?;
        hw.read_prepare(params.raw_line_bytes(), params.raw_lines() * params.raw_line_bytes())?;
        hw.start_scan()?;

        Ok(Pipeline {
            reader,
            corrector,
            packer,
            vertical,
            work,
        })
    }

    fn calibrate(&mut self, hw: &mut Hardware, profile: &DeviceProfile) -> Result<()> {
        let mode = if self.options.calibrate_shading {
            CalibrationMode::ShadingOnly
        } else {
            CalibrationMode::Full
        };

        let (afe, exposure) = match &self.calibration {
            Some(previous) => (previous.afe, previous.exposure),
            None => (profile.default_afe, profile.default_exposure),
        };

        log::info!("Calibrating {} ({mode:?})", self.device.device);
        let (tables, _) = Calibrator::new(profile, hw, afe, exposure).run(mode)?;

        if let Some(store) = &self.store {
            if let Err(err) = store.save(&profile.identity(), &tables) {
                log::warn!("Failed to save calibration to {}: {err}", store.dir().display());
            }
        }

        self.calibration = Some(tables);
        Ok(())
    }

    /// Reads image bytes. `Err(EOF)` ends the page; an error from the reader
    /// task is reported once, followed by `EOF`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            log::debug!("Read without a started scan");
            return Err(SaneError::Inval);
        };

        let result = stream.read(buf, self.non_blocking);
        if stream.is_finished() {
            if let Some(hw) = stream.take_hardware() {
                log::debug!("Scan finished on {}", self.device.device);
                self.hw = Some(hw);
            }
        }

        result
    }

    pub fn set_io_mode(&mut self, non_blocking: bool) -> Result<()> {
        if !self.is_scanning() {
            return Err(SaneError::Inval);
        }

        self.non_blocking = non_blocking;
        Ok(())
    }

    /// Lines travel over an in-process channel, so there is no descriptor to poll.
    pub fn get_select_fd(&self) -> Result<i32> {
        Err(SaneError::Unsupported)
    }

    /// Stops a running scan and waits for the carriage to be parked. A reader
    /// task that misses the cancel timeout keeps the device busy until it exits.
    pub fn cancel(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        self.active = None;

        log::trace!("Cancel scan on {}", self.device.device);
        match stream.cancel() {
            Stopped::Parked(hw) => self.hw = Some(hw),
            Stopped::Detached(task) => self.device.hold(task),
            Stopped::Lost if self.hw.is_none() => {
                log::warn!("Lost the transport of {}, it is reopened on the next start", self.device.device)
            }
            Stopped::Lost => {}
        }
    }
}

/// Reclaimed hardware, or a freshly opened transport.
fn acquire(device: &AttachedDevice, reclaimed: Option<Hardware>) -> Result<Hardware> {
    match reclaimed {
        Some(hw) => Ok(hw),
        None => Ok(Hardware::new(device.open_transport()?, device.profile.timing)),
    }
}

fn find_option<N: AsRef<[u8]>>(name: &N) -> Result<OptionId> {
    OptionId::find(name).ok_or_else(|| {
        log::debug!("Unknown option '{}'", BStr::new(name));
        SaneError::Inval
    })
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.cancel();
        log::trace!("Close {}", self.device.device);
        self.device.unlock();
    }
}

pub struct PageReader<'s>(&'s mut Scanner);

impl PageReader<'_> {
    pub fn get_parameters(&self) -> Result<Parameters> {
        self.0.get_parameters()
    }

    pub fn scanner(&self) -> &Scanner {
        &*self.0
    }
}

impl io::Read for PageReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Err(io::ErrorKind::InvalidInput.into());
        }

        match self.0.read(buf) {
            Ok(count) => Ok(count),
            Err(SaneError::EOF) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for PageReader<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
