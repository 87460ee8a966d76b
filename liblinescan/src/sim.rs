//! In-process scanner that speaks the device protocol, used for tests and
//! for running the frontend without hardware.

use crate::{
    profile::{ColorOrdering, DeviceProfile},
    protocol::{
        ack, moving_reply, ready_reply, AfeParameters, Command, ExposureParameters, MotorMode,
        Packet, SetupScan, PACKET_SIZE,
    },
    reorder::{LineArrangement, LineSkipper},
    result::{Result, SaneError},
    transport::{Transport, TransportOpener},
    utils::{mm_to_pixels, Channel},
};
use bstr::BStr;
use std::{
    collections::VecDeque,
    f64::consts::PI,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

/// Optics and behavior of a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub sensor_pixels: u32,
    pub optical_xdpi: u32,
    pub optical_ydpi: u32,
    pub base_ydpi: u32,
    pub ordering: ColorOrdering,
    pub gray_channel: Channel,
    /// End of the white calibration strip, in base motor units.
    pub strip_end: u32,

    /// Dark level per channel at the reference offsets.
    pub dark: [f64; 3],
    pub reference_afe: AfeParameters,
    /// Dark level change per AFE offset unit.
    pub offset_step: f64,
    /// Level per exposure unit on white at full illumination.
    pub slope: [f64; 3],

    /// Polls the carriage reports moving after a move command.
    pub move_polls: u32,
    /// Polls before data is ready after a start.
    pub ready_polls: u32,
    /// Raw lines served before bulk reads start failing.
    pub fail_after_lines: Option<u64>,
    /// Pause before each raw line.
    pub line_delay: Duration,
}

const TARGET_WHITE: f64 = 248.0 * 257.0;

impl SimConfig {
    /// Device whose default exposure lands inside the calibration bands.
    pub fn for_profile(profile: &DeviceProfile) -> Self {
        let dark = 2000.0;
        let slope = [
            profile.default_exposure.r_time,
            profile.default_exposure.g_time,
            profile.default_exposure.b_time,
        ]
        .map(|time| (TARGET_WHITE - dark) / time.max(1) as f64);

        let strip_end = profile
            .areas
            .iter()
            .map(|(_, area)| mm_to_pixels(area.y_offset, profile.base_ydpi))
            .min()
            .unwrap_or(0);

        Self {
            sensor_pixels: profile.sensor_pixels,
            optical_xdpi: profile.optical_xdpi,
            optical_ydpi: profile.optical_ydpi,
            base_ydpi: profile.base_ydpi,
            ordering: profile.ordering,
            gray_channel: profile.gray_channel,
            strip_end,
            dark: [dark; 3],
            reference_afe: profile.default_afe,
            offset_step: 300.0,
            slope,
            move_polls: 2,
            ready_polls: 1,
            fail_after_lines: None,
            line_delay: Duration::ZERO,
        }
    }

    fn illumination(&self, sensor_x: u32) -> f64 {
        0.85 + 0.15 * (PI * sensor_x as f64 / self.sensor_pixels.max(1) as f64).sin()
    }

    fn reflectance(&self, channel: Channel, sensor_x: u32, y: u32) -> f64 {
        if y < self.strip_end {
            return 1.0;
        }

        let band = ((sensor_x / 64 + y / 64) % 4) as f64;
        0.1 + 0.25 * band + 0.02 * channel.index() as f64
    }

    /// Analog level the device samples for one pixel, before quantization.
    pub fn level(
        &self,
        channel: Channel,
        sensor_x: u32,
        y: u32,
        exposure: &ExposureParameters,
        afe: &AfeParameters,
    ) -> f64 {
        let c = channel.index();
        let sensor_x = sensor_x.min(self.sensor_pixels.saturating_sub(1));
        let offset =
            (self.reference_afe.offset(channel) as f64 - afe.offset(channel) as f64) * self.offset_step;
        let signal = exposure.time(channel) as f64
            * self.slope[c]
            * self.illumination(sensor_x)
            * self.reflectance(channel, sensor_x, y);

        (self.dark[c] + offset + signal).clamp(0.0, 65535.0)
    }
}

/// One raw line source of an active scan.
struct RawLine {
    channel: Option<Channel>,
    y: u32,
}

struct Job {
    setup: SetupScan,
    rows: VecDeque<RawLine>,
    pending: VecDeque<u8>,
}

struct SimState {
    config: SimConfig,
    setup: Option<SetupScan>,
    afe: AfeParameters,
    exposure: ExposureParameters,
    job: Option<Job>,
    homed: bool,
    moving_polls: u32,
    ready_polls: u32,
    lines_served: u64,
    scans_started: u32,
    transports_opened: u32,
    commands: Vec<u8>,
}

/// Handle to a simulated device. Clones share the device.
#[derive(Clone)]
pub struct SimulatedScanner {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedScanner {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                setup: None,
                afe: AfeParameters::default(),
                exposure: ExposureParameters::default(),
                job: None,
                homed: true,
                moving_polls: 0,
                ready_polls: 0,
                lines_served: 0,
                scans_started: 0,
                transports_opened: 0,
                commands: Vec::new(),
            })),
        }
    }

    /// Opener handing out this device under any name.
    pub fn opener(&self) -> Box<dyn TransportOpener> {
        let device = self.clone();
        Box::new(move |_: &BStr| -> Result<Box<dyn Transport>> {
            device.lock()?.transports_opened += 1;
            Ok(Box::new(device.clone()) as Box<dyn Transport>)
        })
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state.lock().map_err(|_| {
            log::error!("Simulated device state poisoned");
            SaneError::IO
        })
    }
}

impl SimState {
    fn handle(&mut self, command: Command) -> Packet {
        self.commands.push(command.opcode());

        match command {
            Command::IsMoving => {
                let moving = self.moving_polls > 0;
                self.moving_polls = self.moving_polls.saturating_sub(1);
                return moving_reply(moving);
            }
            Command::CarriageHome => {
                self.job = None;
                self.moving_polls = self.config.move_polls;
                self.homed = true;
            }
            Command::SetupScan(setup) => self.setup = Some(setup),
            Command::SetAfe(afe) => self.afe = afe,
            Command::SetExposure(exposure) => self.exposure = exposure,
            Command::StartScan => {
                if let Some(setup) = self.setup {
                    self.job = Some(Job {
                        setup,
                        rows: self.schedule(&setup),
                        pending: VecDeque::new(),
                    });
                    self.scans_started += 1;
                    self.ready_polls = self.config.ready_polls;
                    if setup.motor == MotorMode::Forward {
                        self.homed = false;
                    }
                }
            }
            Command::ReadScannedData => {
                let ready = self.job.is_some() && self.ready_polls == 0;
                self.ready_polls = self.ready_polls.saturating_sub(1);
                return ready_reply(ready);
            }
            Command::StopScan => self.job = None,
        }

        ack(&command)
    }

    /// Raw lines in the order the device transfers them.
    fn schedule(&self, setup: &SetupScan) -> VecDeque<RawLine> {
        let config = &self.config;
        let ydpi = setup.ydpi.max(1) as u32;
        let lines = setup.lines as u32;
        let ccd = match config.ordering {
            ColorOrdering::LineCcd {
                distance,
                arrangement,
            } if setup.color => Some((distance, LineArrangement::from_code(arrangement))),
            _ => None,
        };

        let Some((distance, arrangement)) = ccd else {
            return (0..lines)
                .map(|line| RawLine {
                    channel: None,
                    y: setup.abs_y0 as u32 + line * config.base_ydpi / ydpi,
                })
                .collect();
        };

        let y_scale = if ydpi > config.optical_ydpi { 2 } else { 1 };
        let line_rate = config.optical_ydpi * y_scale;
        let distance = distance * y_scale;
        let mut skippers = Channel::ALL.map(|_| LineSkipper::new(line_rate, ydpi));

        let mut rows = VecDeque::new();
        for step in 0..lines + 2 * distance {
            for channel in arrangement.cycle() {
                let delay = arrangement.delay(channel, distance);
                if step < delay || step >= delay + lines {
                    continue;
                }
                if skippers[channel.index()].skip_next() {
                    continue;
                }

                let line = step - delay;
                rows.push_back(RawLine {
                    channel: Some(channel),
                    y: setup.abs_y0 as u32 + line * config.base_ydpi / line_rate,
                });
            }
        }
        rows
    }

    fn sample(&self, channel: Channel, column: u32, y: u32, setup: &SetupScan) -> f64 {
        let sensor_x = setup.abs_x0 as u32 + column * self.config.optical_xdpi / setup.xdpi.max(1) as u32;
        self.config.level(channel, sensor_x, y, &self.exposure, &self.afe)
    }

    fn render(&self, row: &RawLine, setup: &SetupScan, out: &mut VecDeque<u8>) {
        let wide = setup.depth == 16;
        let pixels = setup.bytes_per_line as u32 * 8 / setup.depth.max(1) as u32;

        let mut put = |level: f64| {
            if wide {
                out.extend((level.round() as u16).to_le_bytes());
            } else {
                out.push_back(((level.round() as u32 + 128) / 257).min(255) as u8);
            }
        };

        let planes = match (row.channel, setup.color, self.config.ordering) {
            (Some(channel), _, _) => vec![channel],
            (None, false, _) => vec![self.config.gray_channel],
            (None, true, ColorOrdering::Pixel) => {
                for x in 0..pixels {
                    for channel in Channel::ALL {
                        put(self.sample(channel, x, row.y, setup));
                    }
                }
                return;
            }
            (None, true, _) => vec![Channel::Blue, Channel::Green, Channel::Red],
        };

        for channel in planes {
            for x in 0..pixels {
                put(self.sample(channel, x, row.y, setup));
            }
        }
    }

    /// Hands out pending bytes once enough are buffered or the scan has no more lines.
    fn drain(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let Some(job) = self.job.as_mut() else {
            log::error!("Bulk read without an active scan");
            return Err(SaneError::IO);
        };

        if job.pending.len() < buf.len() && !job.rows.is_empty() {
            return Ok(None);
        }

        let count = buf.len().min(job.pending.len());
        for (dst, src) in buf.iter_mut().zip(job.pending.drain(..count)) {
            *dst = src;
        }
        Ok(Some(count))
    }

    fn render_next(&mut self) -> Result<()> {
        if let Some(limit) = self.config.fail_after_lines {
            if self.lines_served >= limit {
                log::error!("Simulated transfer failure after {limit} lines");
                return Err(SaneError::IO);
            }
        }

        // A stop between polls leaves nothing to render.
        let Some(mut job) = self.job.take() else {
            return Ok(());
        };
        if let Some(row) = job.rows.pop_front() {
            self.render(&row, &job.setup, &mut job.pending);
            self.lines_served += 1;
        }
        self.job = Some(job);
        Ok(())
    }
}

impl Transport for SimulatedScanner {
    fn send(&mut self, command: &[u8], reply: &mut [u8]) -> Result<()> {
        let Some(command) = <&Packet>::try_from(command).ok().and_then(Command::decode) else {
            log::error!("Simulated device got a malformed packet");
            return Err(SaneError::IO);
        };

        let answer = self.lock()?.handle(command);
        let count = reply.len().min(PACKET_SIZE);
        reply[..count].copy_from_slice(&answer[..count]);
        Ok(())
    }

    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut state = self.lock()?;
            if let Some(count) = state.drain(buf)? {
                return Ok(count);
            }

            let delay = state.config.line_delay;
            if !delay.is_zero() {
                drop(state);
                thread::sleep(delay);
                state = self.lock()?;
            }
            state.render_next()?;
        }
    }
}

/// Read-only view of a simulated device's state.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimProbe {
    fn with<T>(&self, f: impl FnOnce(&SimState) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }

    pub fn is_scanning(&self) -> bool {
        self.with(|state| state.job.is_some())
    }

    /// Carriage at home and at rest.
    pub fn is_homed(&self) -> bool {
        self.with(|state| state.homed && state.job.is_none())
    }

    pub fn afe(&self) -> AfeParameters {
        self.with(|state| state.afe)
    }

    pub fn exposure(&self) -> ExposureParameters {
        self.with(|state| state.exposure)
    }

    pub fn scans_started(&self) -> u32 {
        self.with(|state| state.scans_started)
    }

    pub fn transports_opened(&self) -> u32 {
        self.with(|state| state.transports_opened)
    }

    pub fn lines_served(&self) -> u64 {
        self.with(|state| state.lines_served)
    }

    /// Opcodes received so far.
    pub fn commands(&self) -> Vec<u8> {
        self.with(|state| state.commands.clone())
    }

    pub fn config(&self) -> SimConfig {
        self.with(|state| state.config.clone())
    }

    pub fn set_config(&self, config: SimConfig) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.config = config;
    }
}
