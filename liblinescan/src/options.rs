use crate::{
    geometry::{ScanMode, ScanRequest},
    profile::{DeviceProfile, ScanSource},
    result::{Result, SaneError},
    shading::ToneSettings,
    utils::Fixed,
};
use bitflags::bitflags;
use bstr::{BStr, BString, ByteSlice};
use std::{fmt, ops, str::FromStr};
use strum::IntoEnumIterator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum OptionId {
    NumOptions,
    ModeGroup,
    Mode,
    Depth,
    Threshold,
    Resolution,
    Preview,
    Source,
    Negative,
    EnhancementGroup,
    Brightness,
    Contrast,
    Gamma,
    CustomGamma,
    GammaR,
    GammaG,
    GammaB,
    GeometryGroup,
    TlX,
    TlY,
    BrX,
    BrY,
    CalibrationGroup,
    Calibrate,
    CalibrateShading,
}

impl OptionId {
    pub fn from_index(index: usize) -> Option<Self> {
        OptionId::iter().nth(index)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn count() -> usize {
        OptionId::iter().count()
    }

    /// Looks an option up by its well-known name.
    pub fn find<N: AsRef<[u8]>>(name: N) -> Option<Self> {
        let name = BStr::new(&name);
        OptionId::iter().find(|id| !id.name().is_empty() && BStr::new(id.name()) == name)
    }

    pub fn name(self) -> &'static str {
        self.info().0
    }

    fn info(self) -> (&'static str, &'static str, &'static str, Type, Unit) {
        use OptionId::*;

        match self {
            NumOptions => ("", "Number of options", "Read-only option count.", Type::Int, Unit::None),
            ModeGroup => ("", "Scan mode", "", Type::Group, Unit::None),
            Mode => ("mode", "Scan mode", "Selects the scan mode.", Type::String, Unit::None),
            Depth => ("depth", "Bit depth", "Bits per sample.", Type::Int, Unit::Bit),
            Threshold => (
                "threshold",
                "Threshold",
                "Samples at or below this level become black in lineart mode.",
                Type::Int,
                Unit::None,
            ),
            Resolution => ("resolution", "Resolution", "Scan resolution.", Type::Int, Unit::Dpi),
            Preview => ("preview", "Preview", "Fast low-resolution scan.", Type::Bool, Unit::None),
            Source => ("source", "Scan source", "Selects the scan source.", Type::String, Unit::None),
            Negative => ("negative", "Negative", "Inverts the image.", Type::Bool, Unit::None),
            EnhancementGroup => ("", "Enhancement", "", Type::Group, Unit::None),
            Brightness => ("brightness", "Brightness", "Brightness shift.", Type::Int, Unit::None),
            Contrast => ("contrast", "Contrast", "Contrast around the midpoint.", Type::Int, Unit::None),
            Gamma => ("gamma-value", "Gamma", "Master gamma correction.", Type::Fixed, Unit::None),
            CustomGamma => (
                "custom-gamma",
                "Per-channel gamma",
                "Use separate gamma values for red, green and blue.",
                Type::Bool,
                Unit::None,
            ),
            GammaR => ("red-gamma-value", "Red gamma", "Red channel gamma.", Type::Fixed, Unit::None),
            GammaG => ("green-gamma-value", "Green gamma", "Green channel gamma.", Type::Fixed, Unit::None),
            GammaB => ("blue-gamma-value", "Blue gamma", "Blue channel gamma.", Type::Fixed, Unit::None),
            GeometryGroup => ("", "Geometry", "", Type::Group, Unit::None),
            TlX => ("tl-x", "Top-left x", "Left edge of the scan area.", Type::Fixed, Unit::Mm),
            TlY => ("tl-y", "Top-left y", "Top edge of the scan area.", Type::Fixed, Unit::Mm),
            BrX => ("br-x", "Bottom-right x", "Right edge of the scan area.", Type::Fixed, Unit::Mm),
            BrY => ("br-y", "Bottom-right y", "Bottom edge of the scan area.", Type::Fixed, Unit::Mm),
            CalibrationGroup => ("", "Calibration", "", Type::Group, Unit::None),
            Calibrate => (
                "calibrate",
                "Calibrate before every scan",
                "Runs the full calibration before each scan instead of reusing cached data.",
                Type::Bool,
                Unit::None,
            ),
            CalibrateShading => (
                "calibrate-shading",
                "Shading calibration only",
                "Skips the offset and exposure search when calibrating.",
                Type::Bool,
                Unit::None,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Bool,
    Int,
    Fixed,
    String,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    None,
    Bit,
    Mm,
    Dpi,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const SoftSelect = 1 << 0;
        const HardSelect = 1 << 1;
        const SoftDetect = 1 << 2;
        const Emulated = 1 << 3;
        const Automatic = 1 << 4;
        const Inactive = 1 << 5;
        const Advanced = 1 << 6;
    }
}

bitflags! {
    /// Side effects of setting an option.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Info: u32 {
        const INEXACT = 1 << 0;
        const RELOAD_OPTIONS = 1 << 1;
        const RELOAD_PARAMS = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    None,
    /// Bounds in raw values: plain integers, or raw fixed point for fixed options.
    Range {
        range: ops::RangeInclusive<i32>,
        quant: i32,
    },
    WordList(Vec<i32>),
    StringList(Vec<BString>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Fixed(Fixed),
    String(BString),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{}", if *value { "yes" } else { "no" }),
            Value::Int(value) => write!(f, "{value}"),
            Value::Fixed(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerOption {
    pub id: OptionId,
    pub number: usize,
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub ty: Type,
    pub unit: Unit,
    pub capabilities: Capabilities,
    pub constraint: Constraint,
}

impl ScannerOption {
    pub fn is_settable(&self) -> bool {
        self.capabilities.contains(Capabilities::SoftSelect)
    }

    pub fn is_active(&self) -> bool {
        !self.capabilities.contains(Capabilities::Inactive)
    }
}

const GAMMA_MIN: f64 = 0.1;
const GAMMA_MAX: f64 = 4.0;
const TONE_RANGE: ops::RangeInclusive<i32> = -127..=127;

/// Current option values of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    pub mode: ScanMode,
    pub depth: u8,
    pub threshold: i32,
    pub resolution: u32,
    pub preview: bool,
    pub source: ScanSource,
    pub negative: bool,
    pub brightness: i32,
    pub contrast: i32,
    pub gamma: Fixed,
    pub custom_gamma: bool,
    pub channel_gamma: [Fixed; 3],
    pub tl_x: Fixed,
    pub tl_y: Fixed,
    pub br_x: Fixed,
    pub br_y: Fixed,
    pub calibrate: bool,
    pub calibrate_shading: bool,
}

impl ScanOptions {
    pub fn new(profile: &DeviceProfile) -> Self {
        let source = profile.sources().next().unwrap_or(ScanSource::Flatbed);
        let resolution = if profile.resolutions.contains(&300) {
            300
        } else {
            profile.resolutions.first().copied().unwrap_or(profile.optical_xdpi)
        };

        let mut options = Self {
            mode: ScanMode::Color,
            depth: 8,
            threshold: 128,
            resolution,
            preview: false,
            source,
            negative: false,
            brightness: 0,
            contrast: 0,
            gamma: Fixed::from_f64(profile.gamma.master),
            custom_gamma: false,
            channel_gamma: [profile.gamma.red, profile.gamma.green, profile.gamma.blue]
                .map(Fixed::from_f64),
            tl_x: Fixed::from_int(0),
            tl_y: Fixed::from_int(0),
            br_x: Fixed::from_int(0),
            br_y: Fixed::from_int(0),
            calibrate: false,
            calibrate_shading: false,
        };
        options.reset_geometry(profile);
        options
    }

    fn reset_geometry(&mut self, profile: &DeviceProfile) {
        if let Some(area) = profile.area(self.source) {
            self.tl_x = Fixed::from_int(0);
            self.tl_y = Fixed::from_int(0);
            self.br_x = area.width;
            self.br_y = area.height;
        }
    }

    fn is_active(&self, id: OptionId) -> bool {
        use OptionId::*;

        match id {
            Threshold => self.mode == ScanMode::Lineart,
            Depth => !self.mode.is_binary(),
            GammaR | GammaG | GammaB => self.custom_gamma && self.mode.is_color(),
            _ => true,
        }
    }

    /// Describes option `id` as it currently stands.
    pub fn descriptor(&self, profile: &DeviceProfile, id: OptionId) -> ScannerOption {
        use OptionId::*;

        let (name, title, description, ty, unit) = id.info();

        let mut capabilities = match ty {
            Type::Group => Capabilities::empty(),
            _ if id == NumOptions => Capabilities::SoftDetect,
            _ => Capabilities::SoftSelect | Capabilities::SoftDetect,
        };
        if !self.is_active(id) {
            capabilities |= Capabilities::Inactive;
        }
        if matches!(id, Calibrate | CalibrateShading | GammaR | GammaG | GammaB | CustomGamma) {
            capabilities |= Capabilities::Advanced;
        }

        let fixed_range = |max: Fixed| Constraint::Range {
            range: 0..=max.raw(),
            quant: 0,
        };
        let area = profile.area(self.source);

        let constraint = match id {
            Mode => Constraint::StringList(
                ScanMode::iter()
                    .filter(|mode| self.mode_supported(profile, *mode))
                    .map(|mode| <&'static str>::from(mode).into())
                    .collect(),
            ),
            Depth => Constraint::WordList(
                profile
                    .output_depths
                    .iter_depths()
                    .filter(|&depth| depth > 1)
                    .map(i32::from)
                    .collect(),
            ),
            Threshold => Constraint::Range {
                range: 0..=255,
                quant: 1,
            },
            Resolution => {
                Constraint::WordList(profile.resolutions.iter().map(|&dpi| dpi as i32).collect())
            }
            Source => Constraint::StringList(
                profile
                    .sources()
                    .map(|source| <&'static str>::from(source).into())
                    .collect(),
            ),
            Brightness | Contrast => Constraint::Range {
                range: TONE_RANGE,
                quant: 1,
            },
            Gamma | GammaR | GammaG | GammaB => Constraint::Range {
                range: Fixed::from_f64(GAMMA_MIN).raw()..=Fixed::from_f64(GAMMA_MAX).raw(),
                quant: 0,
            },
            TlX | BrX => area.map_or(Constraint::None, |area| fixed_range(area.width)),
            TlY | BrY => area.map_or(Constraint::None, |area| fixed_range(area.height)),
            _ => Constraint::None,
        };

        ScannerOption {
            id,
            number: id.index(),
            name,
            title,
            description,
            ty,
            unit,
            capabilities,
            constraint,
        }
    }

    pub fn descriptors(&self, profile: &DeviceProfile) -> Vec<ScannerOption> {
        OptionId::iter().map(|id| self.descriptor(profile, id)).collect()
    }

    fn mode_supported(&self, profile: &DeviceProfile, mode: ScanMode) -> bool {
        !mode.is_binary() || profile.output_depths.supports(1)
    }

    pub fn get(&self, id: OptionId) -> Result<Value> {
        use OptionId::*;

        let value = match id {
            NumOptions => Value::Int(OptionId::count() as i32),
            Mode => Value::String(<&'static str>::from(self.mode).into()),
            Depth => Value::Int(self.depth as i32),
            Threshold => Value::Int(self.threshold),
            Resolution => Value::Int(self.resolution as i32),
            Preview => Value::Bool(self.preview),
            Source => Value::String(<&'static str>::from(self.source).into()),
            Negative => Value::Bool(self.negative),
            Brightness => Value::Int(self.brightness),
            Contrast => Value::Int(self.contrast),
            Gamma => Value::Fixed(self.gamma),
            CustomGamma => Value::Bool(self.custom_gamma),
            GammaR => Value::Fixed(self.channel_gamma[0]),
            GammaG => Value::Fixed(self.channel_gamma[1]),
            GammaB => Value::Fixed(self.channel_gamma[2]),
            TlX => Value::Fixed(self.tl_x),
            TlY => Value::Fixed(self.tl_y),
            BrX => Value::Fixed(self.br_x),
            BrY => Value::Fixed(self.br_y),
            Calibrate => Value::Bool(self.calibrate),
            CalibrateShading => Value::Bool(self.calibrate_shading),
            ModeGroup | EnhancementGroup | GeometryGroup | CalibrationGroup => {
                return Err(SaneError::Inval)
            }
        };

        Ok(value)
    }

    /// Sets option `id`, checking its constraint.
    pub fn set(&mut self, profile: &DeviceProfile, id: OptionId, value: Value) -> Result<Info> {
        use OptionId::*;

        let descriptor = self.descriptor(profile, id);
        if !descriptor.is_settable() {
            log::debug!("Option '{}' is read-only", descriptor.title);
            return Err(SaneError::Inval);
        }
        if !descriptor.is_active() {
            log::debug!("Option '{}' is inactive", descriptor.name);
            return Err(SaneError::Inval);
        }

        let (value, mut info) = constrain(&descriptor, value)?;

        let params = Info::RELOAD_PARAMS;
        let everything = Info::RELOAD_PARAMS | Info::RELOAD_OPTIONS;

        match (id, value) {
            (Mode, Value::String(text)) => {
                self.mode = parse_text(text.as_bstr())?;
                info |= everything;
            }
            (Depth, Value::Int(depth)) => {
                self.depth = depth as u8;
                info |= params;
            }
            (Threshold, Value::Int(threshold)) => self.threshold = threshold,
            (Resolution, Value::Int(dpi)) => {
                self.resolution = dpi as u32;
                info |= params;
            }
            (Preview, Value::Bool(preview)) => {
                self.preview = preview;
                info |= params;
            }
            (Source, Value::String(text)) => {
                self.source = parse_text(text.as_bstr())?;
                self.reset_geometry(profile);
                info |= everything;
            }
            (Negative, Value::Bool(negative)) => self.negative = negative,
            (Brightness, Value::Int(brightness)) => self.brightness = brightness,
            (Contrast, Value::Int(contrast)) => self.contrast = contrast,
            (Gamma, Value::Fixed(gamma)) => self.gamma = gamma,
            (CustomGamma, Value::Bool(custom)) => {
                self.custom_gamma = custom;
                info |= Info::RELOAD_OPTIONS;
            }
            (GammaR, Value::Fixed(gamma)) => self.channel_gamma[0] = gamma,
            (GammaG, Value::Fixed(gamma)) => self.channel_gamma[1] = gamma,
            (GammaB, Value::Fixed(gamma)) => self.channel_gamma[2] = gamma,
            (TlX, Value::Fixed(mm)) => {
                self.tl_x = mm;
                info |= params;
            }
            (TlY, Value::Fixed(mm)) => {
                self.tl_y = mm;
                info |= params;
            }
            (BrX, Value::Fixed(mm)) => {
                self.br_x = mm;
                info |= params;
            }
            (BrY, Value::Fixed(mm)) => {
                self.br_y = mm;
                info |= params;
            }
            (Calibrate, Value::Bool(calibrate)) => self.calibrate = calibrate,
            (CalibrateShading, Value::Bool(shading)) => self.calibrate_shading = shading,
            (id, value) => {
                log::debug!("Value {value:?} does not fit option {id:?}");
                return Err(SaneError::Inval);
            }
        }

        log::trace!("Set option '{}' ({info:?})", descriptor.name);

        Ok(info)
    }

    /// Sets option `id` from its textual form, as found in configuration files.
    pub fn set_from_text(&mut self, profile: &DeviceProfile, id: OptionId, text: &BStr) -> Result<Info> {
        let descriptor = self.descriptor(profile, id);
        let value = parse_value(descriptor.ty, text)?;
        self.set(profile, id, value)
    }

    /// The scan these options describe.
    pub fn request(&self, profile: &DeviceProfile) -> ScanRequest {
        let dpi = if self.preview {
            profile.resolutions.iter().copied().min().unwrap_or(profile.min_dpi)
        } else {
            self.resolution
        };

        ScanRequest {
            tl_x: self.tl_x,
            tl_y: self.tl_y,
            br_x: self.br_x,
            br_y: self.br_y,
            xdpi: dpi,
            ydpi: dpi,
            mode: self.mode,
            depth: self.depth,
            source: self.source,
            negative: self.negative,
        }
    }

    pub fn tone_settings(&self) -> ToneSettings {
        let channel_gamma = if self.custom_gamma && self.mode.is_color() {
            self.channel_gamma.map(Fixed::to_f64)
        } else {
            [1.0; 3]
        };

        ToneSettings {
            brightness: self.brightness,
            contrast: self.contrast,
            gamma: self.gamma.to_f64(),
            channel_gamma,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold.clamp(0, 255) as u8
    }
}

/// Applies `descriptor`'s constraint, clamping ranges.
fn constrain(descriptor: &ScannerOption, value: Value) -> Result<(Value, Info)> {
    let raw = match (&descriptor.ty, &value) {
        (Type::Bool, Value::Bool(_)) | (Type::String, Value::String(_)) => None,
        (Type::Int, Value::Int(int)) => Some(*int),
        (Type::Fixed, Value::Fixed(fixed)) => Some(fixed.raw()),
        (Type::Fixed, Value::Int(int)) => Some(Fixed::from_int(*int).raw()),
        _ => {
            log::debug!("Value {value:?} has the wrong type for '{}'", descriptor.name);
            return Err(SaneError::Inval);
        }
    };

    let rebuild = |raw: i32| match descriptor.ty {
        Type::Fixed => Value::Fixed(Fixed::from_raw(raw)),
        _ => Value::Int(raw),
    };

    match (&descriptor.constraint, raw) {
        (Constraint::Range { range, quant }, Some(raw)) => {
            let mut clamped = raw.clamp(*range.start(), *range.end());
            if *quant > 0 {
                let steps = (clamped - range.start() + quant / 2) / quant;
                clamped = (range.start() + steps * quant).min(*range.end());
            }

            let info = if clamped != raw {
                Info::INEXACT
            } else {
                Info::empty()
            };
            Ok((rebuild(clamped), info))
        }
        (Constraint::WordList(words), Some(raw)) => {
            if words.contains(&raw) {
                Ok((rebuild(raw), Info::empty()))
            } else {
                log::debug!("{raw} is not one of {words:?} for '{}'", descriptor.name);
                Err(SaneError::Inval)
            }
        }
        (Constraint::StringList(strings), None) => {
            let known = matches!(&value, Value::String(text) if strings.iter().any(|s| s == text));
            if known {
                Ok((value, Info::empty()))
            } else {
                log::debug!("{value} is not one of {strings:?} for '{}'", descriptor.name);
                Err(SaneError::Inval)
            }
        }
        (_, Some(raw)) => Ok((rebuild(raw), Info::empty())),
        _ => Ok((value, Info::empty())),
    }
}

fn parse_text<T: FromStr>(text: &BStr) -> Result<T> {
    text.to_str()
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or(SaneError::Inval)
}

fn parse_value(ty: Type, text: &BStr) -> Result<Value> {
    let value = match ty {
        Type::Bool => match text.trim().to_ascii_lowercase().as_slice() {
            b"yes" | b"true" | b"on" | b"1" => Value::Bool(true),
            b"no" | b"false" | b"off" | b"0" => Value::Bool(false),
            _ => return Err(SaneError::Inval),
        },
        Type::Int => Value::Int(parse_text(text)?),
        Type::Fixed => Value::Fixed(Fixed::from_f64(parse_text::<f64>(text)?)),
        Type::String => Value::String(text.trim().into()),
        Type::Group => return Err(SaneError::Inval),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::find_model;

    fn setup() -> (DeviceProfile, ScanOptions) {
        let profile = find_model("artec-eplus48u").unwrap();
        let options = ScanOptions::new(&profile);
        (profile, options)
    }

    #[test]
    fn indices_match_table() {
        assert_eq!(OptionId::from_index(0), Some(OptionId::NumOptions));
        assert_eq!(OptionId::from_index(OptionId::Mode.index()), Some(OptionId::Mode));
        assert_eq!(OptionId::from_index(OptionId::count()), None);
        assert_eq!(OptionId::find("br-y"), Some(OptionId::BrY));
        assert_eq!(OptionId::find(""), None);

        let (_, options) = setup();
        assert_eq!(options.get(OptionId::NumOptions), Ok(Value::Int(OptionId::count() as i32)));
        assert_eq!(options.get(OptionId::GeometryGroup), Err(SaneError::Inval));
    }

    #[test]
    fn ranges_clamp_and_report_inexact() {
        let (profile, mut options) = setup();

        let info = options.set(&profile, OptionId::Brightness, Value::Int(500)).unwrap();
        assert!(info.contains(Info::INEXACT));
        assert_eq!(options.brightness, 127);

        let info = options.set(&profile, OptionId::Contrast, Value::Int(-20)).unwrap();
        assert_eq!(info, Info::empty());
        assert_eq!(options.contrast, -20);

        let info = options
            .set(&profile, OptionId::BrX, Value::Fixed(Fixed::from_int(1000)))
            .unwrap();
        assert!(info.contains(Info::INEXACT | Info::RELOAD_PARAMS));
        assert_eq!(options.br_x, Fixed::from_int(216));
    }

    #[test]
    fn lists_reject_unknown_values() {
        let (profile, mut options) = setup();

        assert_eq!(options.set(&profile, OptionId::Resolution, Value::Int(333)), Err(SaneError::Inval));
        assert_eq!(
            options.set(&profile, OptionId::Mode, Value::String("Sepia".into())),
            Err(SaneError::Inval)
        );
        assert_eq!(
            options.set(&profile, OptionId::Source, Value::String("Automatic Document Feeder".into())),
            Err(SaneError::Inval)
        );
        assert_eq!(options.set(&profile, OptionId::Depth, Value::Int(12)), Err(SaneError::Inval));
        assert_eq!(options.set(&profile, OptionId::Mode, Value::Int(1)), Err(SaneError::Inval));

        let info = options.set(&profile, OptionId::Resolution, Value::Int(600)).unwrap();
        assert_eq!(info, Info::RELOAD_PARAMS);
        assert_eq!(options.resolution, 600);
    }

    #[test]
    fn activity_follows_mode() {
        let (profile, mut options) = setup();

        assert_eq!(options.set(&profile, OptionId::Threshold, Value::Int(10)), Err(SaneError::Inval));
        assert!(!options.descriptor(&profile, OptionId::GammaR).is_active());

        let info = options
            .set(&profile, OptionId::Mode, Value::String("Lineart".into()))
            .unwrap();
        assert!(info.contains(Info::RELOAD_OPTIONS));
        assert!(options.descriptor(&profile, OptionId::Threshold).is_active());
        assert!(!options.descriptor(&profile, OptionId::Depth).is_active());
        options.set(&profile, OptionId::Threshold, Value::Int(10)).unwrap();
        assert_eq!(options.threshold(), 10);

        options.set(&profile, OptionId::Mode, Value::String("Color".into())).unwrap();
        options.set(&profile, OptionId::CustomGamma, Value::Bool(true)).unwrap();
        assert!(options.descriptor(&profile, OptionId::GammaB).is_active());
        options
            .set(&profile, OptionId::GammaB, Value::Fixed(Fixed::from_f64(2.0)))
            .unwrap();
        assert_eq!(options.tone_settings().channel_gamma[2], 2.0);
    }

    #[test]
    fn text_values_parse_by_type() {
        let (profile, mut options) = setup();

        options.set_from_text(&profile, OptionId::Mode, "Gray".into()).unwrap();
        options.set_from_text(&profile, OptionId::Preview, "yes".into()).unwrap();
        options.set_from_text(&profile, OptionId::TlY, " 12.5 ".into()).unwrap();
        options.set_from_text(&profile, OptionId::Depth, "16".into()).unwrap();

        assert_eq!(options.mode, ScanMode::Gray);
        assert!(options.preview);
        assert_eq!(options.tl_y, Fixed::from_f64(12.5));
        assert_eq!(options.depth, 16);
        assert_eq!(
            options.set_from_text(&profile, OptionId::Resolution, "many".into()),
            Err(SaneError::Inval)
        );

        let request = options.request(&profile);
        assert_eq!((request.xdpi, request.ydpi), (50, 50));
    }

    #[test]
    fn source_change_resets_geometry() {
        let profile = find_model("umax-astra-ccd").unwrap();
        let mut options = ScanOptions::new(&profile);

        let info = options
            .set(&profile, OptionId::Source, Value::String("Transparency Adapter".into()))
            .unwrap();
        assert!(info.contains(Info::RELOAD_OPTIONS | Info::RELOAD_PARAMS));
        assert_eq!(options.br_x, Fixed::from_int(127));
        assert_eq!(
            options.descriptor(&profile, OptionId::BrY).constraint,
            Constraint::Range {
                range: 0..=Fixed::from_int(127).raw(),
                quant: 0
            }
        );
    }
}
