//! Photometric calibration: dark offset and exposure search, then shading capture.

use crate::{
    geometry::{plan_calibration, ScanAction},
    hardware::Hardware,
    profile::{CalibrationTuning, DeviceProfile},
    protocol::{AfeParameters, ExposureParameters},
    reader::{ChannelLines, LineReader},
    result::Result,
    utils::{try_zeroed, Channel},
};

/// Full sensor width references plus the hardware settings they were taken with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationTables {
    pub black: [Vec<u16>; 3],
    pub white: [Vec<u16>; 3],
    pub afe: AfeParameters,
    pub exposure: ExposureParameters,
}

impl CalibrationTables {
    pub fn pixels(&self) -> usize {
        self.black[0].len()
    }

    /// Shading levels as R, G, B little-endian words per pixel.
    pub fn encode_shading(levels: &[Vec<u16>; 3]) -> Vec<u8> {
        let pixels = levels[0].len();
        let mut bytes = Vec::with_capacity(pixels * 6);
        for x in 0..pixels {
            for channel in levels {
                bytes.extend_from_slice(&channel[x].to_le_bytes());
            }
        }
        bytes
    }

    pub fn decode_shading(bytes: &[u8], pixels: usize) -> Option<[Vec<u16>; 3]> {
        if bytes.len() != pixels * 6 {
            return None;
        }

        let mut levels: [Vec<u16>; 3] = Default::default();
        for pixel in bytes.chunks_exact(6) {
            for (channel, word) in levels.iter_mut().zip(pixel.chunks_exact(2)) {
                channel.push(u16::from_le_bytes([word[0], word[1]]));
            }
        }
        Some(levels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Uncalibrated,
    HomePositioning,
    BlackScan,
    OffsetAdjust,
    WhiteScan,
    ExposureAdjust,
    ShadingBuild,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMode {
    /// Search offsets and exposure, then capture shading.
    Full,
    /// Capture shading with the current offsets and exposure.
    ShadingOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationOutcome {
    pub rounds: u32,
    pub converged: bool,
}

/// Sums sub-scan lines per pixel and channel.
pub struct ShadingAccumulator {
    sums: [Vec<u32>; 3],
    lines: u32,
}

impl ShadingAccumulator {
    pub fn new(pixels: usize) -> Result<Self> {
        Ok(Self {
            sums: [try_zeroed(pixels)?, try_zeroed(pixels)?, try_zeroed(pixels)?],
            lines: 0,
        })
    }

    pub fn add(&mut self, line: &ChannelLines) {
        for (c, sums) in self.sums.iter_mut().enumerate().take(line.channels()) {
            for (sum, &value) in sums.iter_mut().zip(line.channel(c)) {
                *sum += value as u32;
            }
        }
        self.lines += 1;
    }

    pub fn lines(&self) -> u32 {
        self.lines
    }

    pub fn average(&self) -> [Vec<u16>; 3] {
        let lines = self.lines.max(1);
        self.sums
            .clone()
            .map(|sums| sums.into_iter().map(|sum| (sum / lines) as u16).collect())
    }
}

/// Darkest column per channel.
pub fn darkest(levels: &[Vec<u16>; 3]) -> [u32; 3] {
    levels
        .clone()
        .map(|channel| channel.into_iter().min().unwrap_or(0) as u32)
}

/// Brightest column per channel.
pub fn brightest(levels: &[Vec<u16>; 3]) -> [u32; 3] {
    levels
        .clone()
        .map(|channel| channel.into_iter().max().unwrap_or(0) as u32)
}

/// Moves each AFE offset one step toward the black band. Returns whether
/// every channel already sat inside it.
pub fn adjust_offsets(afe: &mut AfeParameters, black: [u32; 3], tuning: &CalibrationTuning) -> bool {
    let mut in_band = true;
    for channel in Channel::ALL {
        let level = black[channel.index()];
        let offset = afe.offset_mut(channel);
        if level < tuning.black_min {
            // a lower offset raises the dark level
            *offset = offset.saturating_sub(1);
            in_band = false;
        } else if level > tuning.black_max {
            *offset = offset.saturating_add(1);
            in_band = false;
        }
    }
    in_band
}

/// Steps each exposure time toward the middle of the white band. Returns
/// whether every channel already sat inside it.
pub fn adjust_exposure(
    exposure: &mut ExposureParameters,
    white: [u32; 3],
    tuning: &CalibrationTuning,
    bounds: (i32, i32),
) -> bool {
    let target = (tuning.white_min + tuning.white_max) / 2;
    let step = tuning.exposure_step.max(1);

    let mut in_band = true;
    for channel in Channel::ALL {
        let level = white[channel.index()];
        let time = exposure.time_mut(channel);
        if level < tuning.white_min {
            *time += ((target - level) / step).max(1) as i32;
            in_band = false;
        } else if level > tuning.white_max {
            *time -= ((level - target) / step).max(1) as i32;
            in_band = false;
        }
        *time = (*time).clamp(bounds.0, bounds.1);
    }
    in_band
}

/// Drives the calibration sub-scans on one device.
pub struct Calibrator<'a> {
    profile: &'a DeviceProfile,
    hw: &'a mut Hardware,
    state: CalibrationState,
    afe: AfeParameters,
    exposure: ExposureParameters,
}

impl<'a> Calibrator<'a> {
    pub fn new(
        profile: &'a DeviceProfile,
        hw: &'a mut Hardware,
        afe: AfeParameters,
        exposure: ExposureParameters,
    ) -> Self {
        Self {
            profile,
            hw,
            state: CalibrationState::Uncalibrated,
            afe,
            exposure,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    fn enter(&mut self, state: CalibrationState) {
        log::trace!("Calibration {:?} -> {state:?}", self.state);
        self.state = state;
    }

    pub fn run(mut self, mode: CalibrationMode) -> Result<(CalibrationTables, CalibrationOutcome)> {
        let tuning = self.profile.calibration;
        let dark_exposure = ExposureParameters::uniform(tuning.black_exposure);
        let bounds = (self.profile.exposure_min, self.profile.exposure_max);

        let mut outcome = CalibrationOutcome {
            rounds: 0,
            converged: true,
        };

        if mode == CalibrationMode::Full {
            outcome.converged = false;

            while outcome.rounds < tuning.max_rounds.max(1) {
                outcome.rounds += 1;

                self.enter(CalibrationState::HomePositioning);
                self.home()?;

                self.enter(CalibrationState::BlackScan);
                let black = darkest(&self.sub_scan(ScanAction::CalibrateOffset, dark_exposure)?);

                self.enter(CalibrationState::OffsetAdjust);
                let offsets_ok = adjust_offsets(&mut self.afe, black, &tuning);

                self.enter(CalibrationState::WhiteScan);
                let white = brightest(&self.sub_scan(ScanAction::CalibrateExposure, self.exposure)?);

                self.enter(CalibrationState::ExposureAdjust);
                let exposure_ok = adjust_exposure(&mut self.exposure, white, &tuning, bounds);

                log::debug!(
                    "Calibration round {}: black {black:?}, white {white:?}, afe {:?}, exposure {:?}",
                    outcome.rounds,
                    self.afe,
                    self.exposure,
                );

                if offsets_ok && exposure_ok {
                    outcome.converged = true;
                    break;
                }
            }

            if !outcome.converged {
                log::warn!(
                    "Calibration did not settle in {} rounds, continuing with afe {:?}, exposure {:?}",
                    outcome.rounds,
                    self.afe,
                    self.exposure,
                );
            }
        }

        self.enter(CalibrationState::ShadingBuild);
        let black = self.sub_scan(ScanAction::CalibrateBlack, dark_exposure)?;
        let white = self.sub_scan(ScanAction::CalibrateWhite, self.exposure)?;

        let tables = CalibrationTables {
            black,
            white,
            afe: self.afe,
            exposure: self.exposure,
        };

        self.enter(CalibrationState::Done);
        log::info!(
            "Calibrated over {} pixels in {} rounds (settled: {})",
            tables.pixels(),
            outcome.rounds,
            outcome.converged
        );

        Ok((tables, outcome))
    }

    fn home(&mut self) -> Result<()> {
        self.hw.carriage_home()?;
        self.hw.wait_for_positioning()
    }

    /// Runs one calibration sub-scan and returns per-pixel averages.
    fn sub_scan(&mut self, action: ScanAction, exposure: ExposureParameters) -> Result<[Vec<u16>; 3]> {
        let params = plan_calibration(self.profile, action)?;

        self.home()?;
        self.hw.setup_scan(&params.setup_command()?)?;
        self.hw.set_exposure(&exposure)?;
        self.hw.set_afe(&self.afe)?;

        let mut reader = LineReader::new(&params)?;
        let mut accumulator = ShadingAccumulator::new(params.pixel_xs as usize)?;
        self.hw
            .read_prepare(params.raw_line_bytes(), params.raw_lines() * params.raw_line_bytes())?;
        self.hw.start_scan()?;

        let read = read_lines(self.hw, &mut reader, &mut accumulator, params.pixel_ys);
        self.hw.read_finish();
        let stopped = self.hw.stop_scan();
        read?;
        stopped?;

        log::trace!("{action:?} sub-scan averaged {} lines", accumulator.lines());

        Ok(accumulator.average())
    }
}

fn read_lines(
    hw: &mut Hardware,
    reader: &mut LineReader,
    accumulator: &mut ShadingAccumulator,
    lines: u32,
) -> Result<()> {
    for _ in 0..lines {
        accumulator.add(reader.read_line(hw)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_averages() {
        let mut accumulator = ShadingAccumulator::new(2).unwrap();
        for value in [100u16, 200, 301] {
            accumulator.add(&ChannelLines::from_channels(vec![
                vec![value, 0],
                vec![value * 2, 1],
                vec![value * 3, 2],
            ]));
        }

        let average = accumulator.average();
        assert_eq!(accumulator.lines(), 3);
        assert_eq!(average[0], vec![200, 0]);
        assert_eq!(average[1], vec![400, 1]);
        assert_eq!(average[2], vec![601, 2]);
        assert_eq!(darkest(&average), [0, 1, 2]);
        assert_eq!(brightest(&average), [200, 400, 601]);
    }

    #[test]
    fn offsets_move_toward_band() {
        let tuning = CalibrationTuning::default();
        let mut afe = AfeParameters {
            r_offset: 10,
            g_offset: 10,
            b_offset: 0,
            ..Default::default()
        };

        let in_band = adjust_offsets(&mut afe, [tuning.black_min - 1, tuning.black_max + 1, 3000], &tuning);
        assert!(!in_band);
        assert_eq!((afe.r_offset, afe.g_offset, afe.b_offset), (9, 11, 0));

        assert!(adjust_offsets(&mut afe, [3000; 3], &tuning));
        assert_eq!((afe.r_offset, afe.g_offset, afe.b_offset), (9, 11, 0));
    }

    #[test]
    fn exposure_steps_scale_with_distance() {
        let tuning = CalibrationTuning::default();
        let target = (tuning.white_min + tuning.white_max) / 2;
        let mut exposure = ExposureParameters::uniform(100);

        let white = [target - 2800, target + 100, tuning.white_min];
        assert!(!adjust_exposure(&mut exposure, white, &tuning, (1, 0xffff)));
        assert_eq!(exposure, ExposureParameters { r_time: 110, g_time: 99, b_time: 100 });

        let mut capped = ExposureParameters::uniform(0xfff0);
        adjust_exposure(&mut capped, [0; 3], &tuning, (1, 0xffff));
        assert_eq!(capped, ExposureParameters::uniform(0xffff));
    }

    #[test]
    fn shading_encoding_interleaves_channels() {
        let levels = [vec![1, 2], vec![3, 4], vec![0x1234, 6]];
        let bytes = CalibrationTables::encode_shading(&levels);
        assert_eq!(&bytes[..6], &[1, 0, 3, 0, 0x34, 0x12]);
        assert_eq!(CalibrationTables::decode_shading(&bytes, 2), Some(levels));
        assert_eq!(CalibrationTables::decode_shading(&bytes[1..], 2), None);
    }
}
