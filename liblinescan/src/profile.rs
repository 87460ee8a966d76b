//! Static facts about a scanner model.

use crate::{
    protocol::{AfeParameters, ExposureParameters},
    utils::{Channel, Fixed},
};
use bitflags::bitflags;
use bstr::BString;
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::time::Duration;

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
    strum::IntoStaticStr,
)]
pub enum ScanSource {
    Flatbed,
    #[strum(serialize = "Transparency Adapter")]
    #[serde(rename = "Transparency Adapter")]
    Transparency,
    #[strum(serialize = "Automatic Document Feeder")]
    #[serde(rename = "Automatic Document Feeder")]
    Adf,
}

/// Scannable region of one source, relative to the carriage home position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanArea {
    pub x_offset: Fixed,
    pub y_offset: Fixed,
    pub width: Fixed,
    pub height: Fixed,
}

bitflags! {
    /// Sample depths, bit `n - 1` standing for `n` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Depths: u32 {
        const D1 = 1 << 0;
        const D8 = 1 << 7;
        const D10 = 1 << 9;
        const D12 = 1 << 11;
        const D14 = 1 << 13;
        const D16 = 1 << 15;
    }
}

impl Depths {
    pub fn supports(self, depth: u8) -> bool {
        (1..=32).contains(&depth) && self.bits() & (1 << (depth - 1)) != 0
    }

    pub fn iter_depths(self) -> impl Iterator<Item = u8> {
        (1u8..=32).filter(move |&depth| self.supports(depth))
    }
}

/// How a color scan's samples arrive from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorOrdering {
    /// Each read holds one line of interleaved R, G, B samples.
    Pixel,
    /// Each read holds one line as consecutive B, G, R planes.
    LinePlanes,
    /// Each read holds a single color row of a three-row CCD whose rows
    /// are `distance` optical lines apart.
    LineCcd { distance: u32, arrangement: u8 },
}

/// Closed-loop calibration tuning. Values are empirical per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationTuning {
    pub white_min: u32,
    pub white_max: u32,
    pub black_min: u32,
    pub black_max: u32,
    /// Level change that one exposure unit is assumed to cause.
    pub exposure_step: u32,
    pub max_rounds: u32,
    pub black_exposure: i32,
    /// Lines skipped at the start of a shading sub-scan.
    pub shading_offset: u32,
    pub shading_lines_black: u32,
    pub shading_lines_white: u32,
}

impl Default for CalibrationTuning {
    fn default() -> Self {
        Self {
            white_min: 243 * 257,
            white_max: 253 * 257,
            black_min: 8 * 257,
            black_max: 18 * 257,
            exposure_step: 280,
            max_rounds: 10,
            black_exposure: 4,
            shading_offset: 10,
            shading_lines_black: 70,
            shading_lines_white: 70,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaDefaults {
    pub master: f64,
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub poll_retries: u32,
    /// Bound on waiting for the reader task after a cancel.
    pub cancel_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            poll_retries: 300,
            cancel_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub key: &'static str,
    pub vendor: BString,
    pub model: BString,
    pub ty: BString,

    pub optical_xdpi: u32,
    /// Motor step resolution; scans above it are doubled in software.
    pub optical_ydpi: u32,
    /// Unit of vertical device coordinates.
    pub base_ydpi: u32,
    pub min_dpi: u32,
    pub max_xdpi: u32,
    pub max_ydpi: u32,
    pub resolutions: Vec<u32>,
    pub sensor_pixels: u32,
    pub areas: Vec<(ScanSource, ScanArea)>,
    pub ordering: ColorOrdering,
    pub capture_depths: Depths,
    pub output_depths: Depths,
    /// Required byte multiple of one transfer line.
    pub alignment: u32,
    pub max_scan_bpl: u32,

    pub exposure_unit_us: u32,
    pub exposure_min: i32,
    pub exposure_max: i32,
    pub default_afe: AfeParameters,
    pub default_exposure: ExposureParameters,
    pub gamma: GammaDefaults,
    pub calibration: CalibrationTuning,
    pub timing: Timing,
    pub gray_channel: Channel,
}

impl DeviceProfile {
    pub fn area(&self, source: ScanSource) -> Option<&ScanArea> {
        self.areas
            .iter()
            .find_map(|(s, area)| (*s == source).then_some(area))
    }

    pub fn sources(&self) -> impl Iterator<Item = ScanSource> + '_ {
        self.areas.iter().map(|(source, _)| *source)
    }

    /// Exposure time in device units for a duration in microseconds.
    pub fn exposure_from_micros(&self, micros: u32) -> i32 {
        let steps = micros / self.exposure_unit_us.max(1);
        (steps.min(i32::MAX as u32) as i32).clamp(self.exposure_min, self.exposure_max)
    }

    /// Key under which calibration data for this model is cached.
    pub fn identity(&self) -> String {
        format!("{}-{}", self.vendor, self.model)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn apply(&mut self, overrides: &ProfileOverrides) {
        if let Some(vendor) = &overrides.vendor {
            self.vendor = vendor.clone();
        }
        if let Some(model) = &overrides.model {
            self.model = model.clone();
        }

        let gamma = &mut self.gamma;
        for (target, value) in [
            (&mut gamma.master, overrides.gamma_master),
            (&mut gamma.red, overrides.gamma_red),
            (&mut gamma.green, overrides.gamma_green),
            (&mut gamma.blue, overrides.gamma_blue),
        ] {
            if let Some(value) = value {
                *target = value;
            }
        }

        if let Some(afe) = overrides.afe {
            self.default_afe = afe;
        }
        if let Some(exposure) = overrides.exposure {
            self.default_exposure = exposure;
        }
        if let Some(micros) = overrides.exposure_us {
            self.default_exposure = ExposureParameters {
                r_time: self.exposure_from_micros(micros[0]),
                g_time: self.exposure_from_micros(micros[1]),
                b_time: self.exposure_from_micros(micros[2]),
            };
        }

        let tuning = &mut self.calibration;
        for (target, value) in [
            (&mut tuning.white_min, overrides.white_min),
            (&mut tuning.white_max, overrides.white_max),
            (&mut tuning.black_min, overrides.black_min),
            (&mut tuning.black_max, overrides.black_max),
            (&mut tuning.exposure_step, overrides.exposure_step),
            (&mut tuning.max_rounds, overrides.max_rounds),
            (&mut tuning.shading_offset, overrides.shading_offset),
            (&mut tuning.shading_lines_black, overrides.shading_lines_black),
            (&mut tuning.shading_lines_white, overrides.shading_lines_white),
        ] {
            if let Some(value) = value {
                *target = value;
            }
        }

        if let Some(exposure) = overrides.black_exposure {
            tuning.black_exposure = exposure;
        }

        if let Some(ms) = overrides.poll_interval_ms {
            self.timing.poll_interval = Duration::from_millis(ms);
        }
    }

    fn artec_eplus48u() -> Self {
        Self {
            key: "artec-eplus48u",
            vendor: "Artec".into(),
            model: "E+ 48U".into(),
            ty: "flatbed scanner".into(),
            optical_xdpi: 600,
            optical_ydpi: 1200,
            base_ydpi: 600,
            min_dpi: 50,
            max_xdpi: 1200,
            max_ydpi: 1200,
            resolutions: vec![50, 100, 200, 300, 600, 1200],
            sensor_pixels: 5120,
            areas: vec![(
                ScanSource::Flatbed,
                ScanArea {
                    x_offset: Fixed::from_int(0),
                    // 280 motor steps at 1200 dpi
                    y_offset: Fixed::from_f64(280.0 * 25.4 / 1200.0),
                    width: Fixed::from_int(216),
                    height: Fixed::from_int(297),
                },
            )],
            ordering: ColorOrdering::LinePlanes,
            capture_depths: Depths::D8 | Depths::D16,
            output_depths: Depths::D1 | Depths::D8 | Depths::D16,
            alignment: 64,
            max_scan_bpl: 15600,
            exposure_unit_us: 1,
            exposure_min: 1,
            exposure_max: 0xffff,
            default_afe: AfeParameters {
                r_offset: 0x28,
                r_pga: 0x0a,
                g_offset: 0x2e,
                g_pga: 0x03,
                b_offset: 0x2e,
                b_pga: 0x03,
            },
            default_exposure: ExposureParameters {
                r_time: 0x9f,
                g_time: 0x109,
                b_time: 0xcb,
            },
            gamma: GammaDefaults {
                master: 1.7,
                red: 1.0,
                green: 1.0,
                blue: 1.0,
            },
            calibration: CalibrationTuning::default(),
            timing: Timing::default(),
            gray_channel: Channel::Green,
        }
    }

    fn umax_astra_ccd() -> Self {
        Self {
            key: "umax-astra-ccd",
            vendor: "UMAX".into(),
            model: "Astra CCD".into(),
            ty: "flatbed scanner".into(),
            optical_xdpi: 600,
            optical_ydpi: 600,
            base_ydpi: 600,
            min_dpi: 75,
            max_xdpi: 1200,
            max_ydpi: 1200,
            resolutions: vec![75, 150, 300, 600, 1200],
            sensor_pixels: 5100,
            areas: vec![
                (
                    ScanSource::Flatbed,
                    ScanArea {
                        x_offset: Fixed::from_int(0),
                        y_offset: Fixed::from_int(8),
                        width: Fixed::from_f64(215.9),
                        height: Fixed::from_f64(297.18),
                    },
                ),
                (
                    ScanSource::Transparency,
                    ScanArea {
                        x_offset: Fixed::from_f64(44.45),
                        y_offset: Fixed::from_int(50),
                        width: Fixed::from_int(127),
                        height: Fixed::from_int(127),
                    },
                ),
            ],
            ordering: ColorOrdering::LineCcd {
                distance: 8,
                arrangement: 1,
            },
            capture_depths: Depths::D8 | Depths::D16,
            output_depths: Depths::D1 | Depths::D8 | Depths::D16,
            alignment: 64,
            max_scan_bpl: 15600,
            exposure_unit_us: 2,
            exposure_min: 1,
            exposure_max: 0x3fff,
            default_afe: AfeParameters {
                r_offset: 0x20,
                r_pga: 0x08,
                g_offset: 0x20,
                g_pga: 0x08,
                b_offset: 0x20,
                b_pga: 0x08,
            },
            default_exposure: ExposureParameters {
                r_time: 0xa0,
                g_time: 0xa0,
                b_time: 0xa0,
            },
            gamma: GammaDefaults {
                master: 1.0,
                red: 1.0,
                green: 1.0,
                blue: 1.0,
            },
            calibration: CalibrationTuning::default(),
            timing: Timing::default(),
            gray_channel: Channel::Green,
        }
    }

    fn generic_cis() -> Self {
        Self {
            key: "generic-cis",
            vendor: "Generic".into(),
            model: "CIS 300".into(),
            ty: "sheetfed scanner".into(),
            optical_xdpi: 300,
            optical_ydpi: 300,
            base_ydpi: 300,
            min_dpi: 75,
            max_xdpi: 600,
            max_ydpi: 600,
            resolutions: vec![75, 150, 300, 600],
            sensor_pixels: 2560,
            areas: vec![
                (
                    ScanSource::Flatbed,
                    ScanArea {
                        x_offset: Fixed::from_int(0),
                        y_offset: Fixed::from_int(10),
                        width: Fixed::from_int(216),
                        height: Fixed::from_int(297),
                    },
                ),
                (
                    ScanSource::Adf,
                    ScanArea {
                        x_offset: Fixed::from_int(0),
                        y_offset: Fixed::from_int(10),
                        width: Fixed::from_int(216),
                        height: Fixed::from_int(356),
                    },
                ),
            ],
            ordering: ColorOrdering::Pixel,
            capture_depths: Depths::D8,
            output_depths: Depths::D1 | Depths::D8,
            alignment: 64,
            max_scan_bpl: 8192,
            exposure_unit_us: 1,
            exposure_min: 1,
            exposure_max: 0xffff,
            default_afe: AfeParameters {
                r_offset: 0x30,
                r_pga: 0x04,
                g_offset: 0x30,
                g_pga: 0x04,
                b_offset: 0x30,
                b_pga: 0x04,
            },
            default_exposure: ExposureParameters::uniform(0x100),
            gamma: GammaDefaults {
                master: 2.2,
                red: 1.0,
                green: 1.0,
                blue: 1.0,
            },
            calibration: CalibrationTuning::default(),
            timing: Timing::default(),
            gray_channel: Channel::Green,
        }
    }
}

static KNOWN_MODELS: Lazy<Vec<DeviceProfile>> = Lazy::new(|| {
    vec![
        DeviceProfile::artec_eplus48u(),
        DeviceProfile::umax_astra_ccd(),
        DeviceProfile::generic_cis(),
    ]
});

pub fn known_models() -> &'static [DeviceProfile] {
    &KNOWN_MODELS
}

pub fn find_model(key: &str) -> Option<DeviceProfile> {
    KNOWN_MODELS.iter().find(|profile| profile.key == key).cloned()
}

/// Per-device adjustments read from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileOverrides {
    pub vendor: Option<BString>,
    pub model: Option<BString>,

    pub gamma_master: Option<f64>,
    pub gamma_red: Option<f64>,
    pub gamma_green: Option<f64>,
    pub gamma_blue: Option<f64>,

    pub afe: Option<AfeParameters>,
    pub exposure: Option<ExposureParameters>,
    pub exposure_us: Option<[u32; 3]>,

    pub white_min: Option<u32>,
    pub white_max: Option<u32>,
    pub black_min: Option<u32>,
    pub black_max: Option<u32>,
    pub exposure_step: Option<u32>,
    pub max_rounds: Option<u32>,
    pub black_exposure: Option<i32>,
    pub shading_offset: Option<u32>,
    pub shading_lines_black: Option<u32>,
    pub shading_lines_white: Option<u32>,

    pub poll_interval_ms: Option<u64>,
}
