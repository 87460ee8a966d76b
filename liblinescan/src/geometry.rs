//! Translation of a scan request into device coordinates and transfer sizes.

use crate::{
    parameters::FrameFormat,
    profile::{ColorOrdering, DeviceProfile, ScanSource},
    protocol::{MotorMode, SetupScan},
    reorder::kept_lines,
    result::{Result, SaneError},
    utils::{mm_to_pixels, round_up, Fixed},
};
use serde::Deserialize;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
pub enum ScanMode {
    Lineart,
    Halftone,
    Gray,
    Color,
}

impl ScanMode {
    pub fn is_color(self) -> bool {
        self == ScanMode::Color
    }

    pub fn is_binary(self) -> bool {
        matches!(self, ScanMode::Lineart | ScanMode::Halftone)
    }
}

/// What the user asked for, in physical units.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub tl_x: Fixed,
    pub tl_y: Fixed,
    pub br_x: Fixed,
    pub br_y: Fixed,
    pub xdpi: u32,
    pub ydpi: u32,
    pub mode: ScanMode,
    pub depth: u8,
    pub source: ScanSource,
    pub negative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Scan,
    CalibrateOffset,
    CalibrateExposure,
    CalibrateBlack,
    CalibrateWhite,
}

impl ScanAction {
    fn motor(self) -> MotorMode {
        match self {
            ScanAction::CalibrateOffset | ScanAction::CalibrateBlack => MotorMode::Still,
            _ => MotorMode::Forward,
        }
    }
}

/// Device-side description of one scan. Fixed for the scan's duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParameters {
    pub action: ScanAction,
    pub mode: ScanMode,
    pub color: bool,
    /// Bits per sample delivered by the device.
    pub depth: u8,
    /// Bits per sample handed to the client.
    pub output_depth: u8,
    pub negative: bool,
    pub ordering: ColorOrdering,

    /// Resolution the hardware samples at.
    pub xdpi: u32,
    pub ydpi: u32,
    pub interpolate_x: bool,
    pub interpolate_y: bool,

    pub pixel_x0: u32,
    pub pixel_y0: u32,
    pub pixel_xs: u32,
    pub pixel_ys: u32,

    /// Pixels per transferred line, padded to the transfer alignment.
    pub scan_xs: u32,
    /// Bytes per transferred line of one channel.
    pub scan_bpl: u32,

    pub abs_x0: u32,
    pub abs_y0: u32,
    pub abs_xs: u32,
    pub abs_ys: u32,

    /// Motor stepping multiple over the optical resolution.
    pub y_scale: u32,
    /// Lines per inch the sensor passes over.
    pub line_rate: u32,
    /// Lines the sensor passes over at the stepping rate.
    pub optical_lines: u32,
}

struct Window {
    action: ScanAction,
    mode: ScanMode,
    depth: u8,
    output_depth: u8,
    negative: bool,
    xdpi: u32,
    ydpi: u32,
    interpolate_x: bool,
    interpolate_y: bool,
    x_start: Fixed,
    x_end: Fixed,
    y_start: Fixed,
    y_end: Fixed,
}

fn ordered(a: Fixed, b: Fixed) -> (Fixed, Fixed) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Plans a user scan.
pub fn plan(request: &ScanRequest, profile: &DeviceProfile) -> Result<ScanParameters> {
    let Some(area) = profile.area(request.source) else {
        log::debug!("Source {} not available on {}", request.source, profile.model);
        return Err(SaneError::Inval);
    };

    let zero = Fixed::from_int(0);
    let (tl_x, br_x) = ordered(request.tl_x, request.br_x);
    let (tl_y, br_y) = ordered(request.tl_y, request.br_y);
    let tl_x = tl_x.clamp(zero, area.width);
    let br_x = br_x.clamp(zero, area.width);
    let tl_y = tl_y.clamp(zero, area.height);
    let br_y = br_y.clamp(zero, area.height);

    if request.xdpi < profile.min_dpi
        || request.ydpi < profile.min_dpi
        || request.xdpi > profile.max_xdpi
        || request.ydpi > profile.max_ydpi
    {
        log::debug!(
            "Resolution {}x{} outside {}..={}",
            request.xdpi,
            request.ydpi,
            profile.min_dpi,
            profile.max_xdpi
        );
        return Err(SaneError::Inval);
    }

    let (depth, output_depth) = if request.mode.is_binary() {
        (8, 1)
    } else {
        (request.depth, request.depth)
    };

    let ccd = request.mode.is_color() && matches!(profile.ordering, ColorOrdering::LineCcd { .. });

    // A CCD motor can step at twice the optical rate.
    let motor_ydpi = if ccd {
        profile.optical_ydpi * 2
    } else {
        profile.optical_ydpi
    };

    let interpolate_x = request.xdpi > profile.optical_xdpi;
    let interpolate_y = request.ydpi > motor_ydpi;
    let xdpi = if interpolate_x { request.xdpi / 2 } else { request.xdpi };
    let ydpi = if interpolate_y { request.ydpi / 2 } else { request.ydpi };

    if xdpi > profile.optical_xdpi || ydpi > motor_ydpi {
        log::debug!("Resolution {xdpi}x{ydpi} needs more than 2x interpolation");
        return Err(SaneError::Inval);
    }

    layout(
        profile,
        Window {
            action: ScanAction::Scan,
            mode: request.mode,
            depth,
            output_depth,
            negative: request.negative,
            xdpi,
            ydpi,
            interpolate_x,
            interpolate_y,
            x_start: area.x_offset + tl_x,
            x_end: area.x_offset + br_x,
            y_start: area.y_offset + tl_y,
            y_end: area.y_offset + br_y,
        },
    )
}

/// Plans a calibration sub-scan: the whole sensor width at optical
/// resolution, always in 8-bit color, over the calibration strip.
pub fn plan_calibration(profile: &DeviceProfile, action: ScanAction) -> Result<ScanParameters> {
    let tuning = &profile.calibration;
    let lines = match action {
        ScanAction::CalibrateOffset | ScanAction::CalibrateBlack => tuning.shading_lines_black,
        _ => tuning.shading_lines_white,
    };

    let dpi = profile.optical_xdpi;
    let line = |n: u32| Fixed::from_f64(n as f64 * 25.4 / dpi as f64);
    let width = Fixed::from_f64(profile.sensor_pixels as f64 * 25.4 / dpi as f64);

    layout(
        profile,
        Window {
            action,
            mode: ScanMode::Color,
            depth: 8,
            output_depth: 8,
            negative: false,
            xdpi: dpi,
            ydpi: dpi,
            interpolate_x: false,
            interpolate_y: false,
            x_start: Fixed::from_int(0),
            x_end: width,
            y_start: line(tuning.shading_offset),
            y_end: line(tuning.shading_offset + lines),
        },
    )
}

fn layout(profile: &DeviceProfile, window: Window) -> Result<ScanParameters> {
    let Window {
        action,
        mode,
        depth,
        output_depth,
        negative,
        xdpi,
        ydpi,
        interpolate_x,
        interpolate_y,
        x_start,
        x_end,
        y_start,
        y_end,
    } = window;

    if !profile.capture_depths.supports(depth) || !profile.output_depths.supports(output_depth) {
        log::debug!("Depth {depth} (output {output_depth}) unsupported by {}", profile.model);
        return Err(SaneError::Inval);
    }

    let color = mode.is_color();

    let sensor_end = (profile.sensor_pixels as u64 * xdpi as u64 / profile.optical_xdpi as u64) as u32;
    let pixel_x0 = mm_to_pixels(x_start, xdpi);
    let pixel_x1 = mm_to_pixels(x_end, xdpi).min(sensor_end);
    let pixel_xs = pixel_x1.saturating_sub(pixel_x0);

    let (y_scale, line_rate) = match profile.ordering {
        ColorOrdering::LineCcd { .. } if color && ydpi > profile.optical_ydpi => {
            (2, profile.optical_ydpi * 2)
        }
        ColorOrdering::LineCcd { .. } if color => (1, profile.optical_ydpi),
        _ => (1, ydpi),
    };

    let pixel_y0 = mm_to_pixels(y_start, ydpi);
    let optical_y0 = mm_to_pixels(y_start, line_rate);
    let optical_lines = mm_to_pixels(y_end, line_rate).saturating_sub(optical_y0);
    let pixel_ys = if line_rate == ydpi {
        optical_lines
    } else {
        kept_lines(optical_lines, line_rate, ydpi)
    };

    if pixel_xs == 0 || pixel_ys == 0 {
        log::debug!("Empty scan window {pixel_xs}x{pixel_ys}");
        return Err(SaneError::Inval);
    }

    // Smallest power-of-two pixel count (from 32) whose line fills whole transfer blocks.
    let block_bits = profile.alignment * 8;
    let mut pixel_align = 32u32;
    while (depth as u32 * pixel_align) % block_bits != 0 {
        if pixel_align >= 1 << 16 {
            log::error!("No pixel alignment fits {} byte blocks", profile.alignment);
            return Err(SaneError::Inval);
        }
        pixel_align *= 2;
    }

    let scan_xs = round_up(pixel_xs as usize, pixel_align as usize) as u32;
    let scan_bpl = depth as u32 * scan_xs / 8;
    if scan_bpl > profile.max_scan_bpl {
        log::debug!("Line of {scan_bpl} bytes exceeds {}", profile.max_scan_bpl);
        return Err(SaneError::Inval);
    }

    let abs_x0 = pixel_x0 * profile.optical_xdpi / xdpi;
    let abs_xs = scan_xs * profile.optical_xdpi / xdpi;
    let abs_y0 = (optical_y0 as u64 * profile.base_ydpi as u64 / line_rate as u64) as u32;
    let abs_ys = (optical_lines as u64 * profile.base_ydpi as u64 / line_rate as u64) as u32;

    let params = ScanParameters {
        action,
        mode,
        color,
        depth,
        output_depth,
        negative,
        ordering: profile.ordering,
        xdpi,
        ydpi,
        interpolate_x,
        interpolate_y,
        pixel_x0,
        pixel_y0,
        pixel_xs,
        pixel_ys,
        scan_xs,
        scan_bpl,
        abs_x0,
        abs_y0,
        abs_xs,
        abs_ys,
        y_scale,
        line_rate,
        optical_lines,
    };

    log::debug!("Planned {params:?}");

    Ok(params)
}

impl ScanParameters {
    pub fn channels(&self) -> usize {
        if self.color {
            3
        } else {
            1
        }
    }

    /// CCD distance (already scaled by the stepping multiple) and arrangement
    /// code when raw lines carry a single color each.
    pub fn ccd_layout(&self) -> Option<(u32, u8)> {
        match self.ordering {
            ColorOrdering::LineCcd {
                distance,
                arrangement,
            } if self.color => Some((distance * self.y_scale, arrangement)),
            _ => None,
        }
    }

    /// Bytes of one device read.
    pub fn raw_line_bytes(&self) -> usize {
        if self.color && self.ccd_layout().is_none() {
            self.scan_bpl as usize * 3
        } else {
            self.scan_bpl as usize
        }
    }

    /// Device reads making up the scan.
    pub fn raw_lines(&self) -> usize {
        if self.ccd_layout().is_some() {
            self.pixel_ys as usize * 3
        } else {
            self.pixel_ys as usize
        }
    }

    pub fn output_pixels_per_line(&self) -> u32 {
        if self.interpolate_x {
            self.pixel_xs * 2
        } else {
            self.pixel_xs
        }
    }

    pub fn output_lines(&self) -> u32 {
        if self.interpolate_y {
            self.pixel_ys * 2
        } else {
            self.pixel_ys
        }
    }

    pub fn output_bytes_per_line(&self) -> usize {
        let pixels = self.output_pixels_per_line() as usize;
        match self.output_depth {
            1 => pixels.div_ceil(8),
            depth => pixels * self.channels() * depth as usize / 8,
        }
    }

    pub fn frame_format(&self) -> FrameFormat {
        if self.color {
            FrameFormat::RGB
        } else {
            FrameFormat::Gray
        }
    }

    pub fn setup_command(&self) -> Result<SetupScan> {
        let word = |value: u32| u16::try_from(value).map_err(|_| SaneError::Inval);
        let lines = if self.ccd_layout().is_some() {
            self.optical_lines
        } else {
            self.pixel_ys
        };

        Ok(SetupScan {
            abs_y0: word(self.abs_y0)?,
            abs_ys: word(self.abs_ys)?,
            abs_x0: word(self.abs_x0)?,
            abs_xs: word(self.abs_xs)?,
            color: self.color,
            depth: self.depth,
            xdpi: word(self.xdpi)?,
            ydpi: word(self.ydpi)?,
            bytes_per_line: word(self.scan_bpl)?,
            lines: word(lines)?,
            motor: self.action.motor(),
        })
    }
}
