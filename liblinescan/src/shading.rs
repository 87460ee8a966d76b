//! Per-pixel shading correction followed by the user's tone curves.

use crate::{
    calibration::CalibrationTables,
    geometry::ScanParameters,
    profile::DeviceProfile,
    reader::ChannelLines,
    result::{Result, SaneError},
    utils::{try_zeroed, Channel},
};

const MAX_VALUE: u32 = 65535;
const TABLE_SIZE: usize = 1 << 16;

/// Black and white reference levels for the columns of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadingTables {
    black: [Vec<u16>; 3],
    white: [Vec<u16>; 3],
}

impl ShadingTables {
    /// Tables that leave samples untouched.
    pub fn identity(pixels: usize) -> Result<Self> {
        let black = [try_zeroed(pixels)?, try_zeroed(pixels)?, try_zeroed(pixels)?];
        let mut white = [try_zeroed(pixels)?, try_zeroed(pixels)?, try_zeroed(pixels)?];
        for table in &mut white {
            table.fill(MAX_VALUE as u16);
        }
        Ok(Self { black, white })
    }

    /// Picks the sensor columns a scan samples out of full-width calibration data.
    pub fn for_scan(
        calibration: &CalibrationTables,
        params: &ScanParameters,
        profile: &DeviceProfile,
    ) -> Result<Self> {
        let pixels = params.pixel_xs as usize;
        let sensor = calibration.pixels();
        if sensor == 0 {
            return Err(SaneError::Inval);
        }

        let mut tables = Self::identity(pixels)?;
        for channel in Channel::ALL {
            let c = channel.index();
            for x in 0..pixels {
                let column = (params.pixel_x0 as usize + x) * profile.optical_xdpi as usize
                    / params.xdpi as usize;
                let column = column.min(sensor - 1);
                tables.black[c][x] = calibration.black[c][column];
                tables.white[c][x] = calibration.white[c][column];
            }
        }

        Ok(tables)
    }

    pub fn pixels(&self) -> usize {
        self.black[0].len()
    }

    /// Columns whose white reference does not exceed the black one.
    pub fn degenerate_columns(&self) -> usize {
        (0..3)
            .map(|c| {
                self.black[c]
                    .iter()
                    .zip(&self.white[c])
                    .filter(|(black, white)| white <= black)
                    .count()
            })
            .sum()
    }

    fn correct(&self, value: u16, x: usize, channel: usize) -> u16 {
        let black = self.black[channel][x] as u32;
        let white = self.white[channel][x] as u32;
        if white <= black {
            return 0;
        }

        let value = (value as u32).clamp(black, white);
        ((value - black) * MAX_VALUE / (white - black)).min(MAX_VALUE) as u16
    }
}

/// User tone settings. Gamma values are exponents, 1.0 being linear.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSettings {
    pub brightness: i32,
    pub contrast: i32,
    pub gamma: f64,
    /// Per-channel gamma, applied before the master curve.
    pub channel_gamma: [f64; 3],
}

impl Default for ToneSettings {
    fn default() -> Self {
        Self {
            brightness: 0,
            contrast: 0,
            gamma: 1.0,
            channel_gamma: [1.0; 3],
        }
    }
}

/// Lookup tables over the 16-bit sample domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToneTables {
    brightness: Vec<u16>,
    contrast: Vec<u16>,
    master: Vec<u16>,
    channel: [Vec<u16>; 3],
}

impl ToneTables {
    pub fn new(settings: &ToneSettings) -> Result<Self> {
        Ok(Self {
            brightness: brightness_table(settings.brightness)?,
            contrast: contrast_table(settings.contrast)?,
            master: gamma_table(settings.gamma)?,
            channel: [
                gamma_table(settings.channel_gamma[0])?,
                gamma_table(settings.channel_gamma[1])?,
                gamma_table(settings.channel_gamma[2])?,
            ],
        })
    }

    fn map(&self, value: u16, channel: Option<usize>) -> u16 {
        let value = self.contrast[self.brightness[value as usize] as usize];
        let value = match channel {
            Some(channel) => self.channel[channel][value as usize],
            None => value,
        };
        self.master[value as usize]
    }
}

/// Linear shift by `brightness * 257` toward black or white.
pub fn brightness_table(brightness: i32) -> Result<Vec<u16>> {
    let shift = brightness.clamp(-255, 255) as i64 * 257;
    let max = MAX_VALUE as i64;

    let mut table = try_zeroed(TABLE_SIZE)?;
    for (i, entry) in table.iter_mut().enumerate() {
        let i = i as i64;
        let value = if shift < 0 {
            i * (max + shift) / max
        } else {
            i + (max - i) * shift / max
        };
        *entry = value.clamp(0, max) as u16;
    }
    Ok(table)
}

/// Power curve mirrored around the midpoint; positive contrast steepens it.
pub fn contrast_table(contrast: i32) -> Result<Vec<u16>> {
    let mut table = try_zeroed(TABLE_SIZE)?;
    if contrast == 0 {
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = i as u16;
        }
        return Ok(table);
    }

    let amount = contrast.clamp(-127, 127) as f64 * 257.0;
    let exponent = if amount > 0.0 {
        32769.0 / (32769.0 - amount)
    } else {
        (32769.0 + amount) / 32769.0
    };

    let max = MAX_VALUE as f64;
    for (i, entry) in table.iter_mut().enumerate() {
        let t = i as f64 / max;
        let curved = if t < 0.5 {
            0.5 * (2.0 * t).powf(exponent)
        } else {
            1.0 - 0.5 * (2.0 * (1.0 - t)).powf(exponent)
        };
        *entry = (curved * max).round().clamp(0.0, max) as u16;
    }
    Ok(table)
}

/// `round(i^(1/gamma) * 65536 / 65536^(1/gamma))`, clamped to 16 bits.
pub fn gamma_table(gamma: f64) -> Result<Vec<u16>> {
    if gamma <= 0.0 || !gamma.is_finite() {
        log::error!("Invalid gamma {gamma}");
        return Err(SaneError::Inval);
    }

    let inverse = 1.0 / gamma;
    let scale = TABLE_SIZE as f64 / (TABLE_SIZE as f64).powf(inverse);

    let mut table = try_zeroed(TABLE_SIZE)?;
    for (i, entry) in table.iter_mut().enumerate() {
        let value = ((i as f64).powf(inverse) * scale).round();
        *entry = value.clamp(0.0, MAX_VALUE as f64) as u16;
    }
    Ok(table)
}

/// Shading plus tone correction for the lines of one scan.
pub struct Corrector {
    shading: ShadingTables,
    tone: ToneTables,
    gray_channel: Channel,
}

impl Corrector {
    pub fn new(shading: ShadingTables, tone: ToneTables, gray_channel: Channel) -> Self {
        let degenerate = shading.degenerate_columns();
        if degenerate > 0 {
            log::warn!("{degenerate} shading columns have white at or below black, they read as 0");
        }

        Self {
            shading,
            tone,
            gray_channel,
        }
    }

    pub fn correct(&self, lines: &mut ChannelLines) {
        if lines.channels() == 1 {
            let table = self.gray_channel.index();
            for (x, value) in lines.channel_mut(0).iter_mut().enumerate() {
                let shaded = self.shading.correct(*value, x, table);
                *value = self.tone.map(shaded, None);
            }
            return;
        }

        for channel in 0..lines.channels() {
            for (x, value) in lines.channel_mut(channel).iter_mut().enumerate() {
                let shaded = self.shading.correct(*value, x, channel);
                *value = self.tone.map(shaded, Some(channel));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_monotonic(table: &[u16]) -> bool {
        table.windows(2).all(|w| w[0] <= w[1])
    }

    #[test]
    fn identity_round_trip() {
        let pixels = 256;
        let corrector = Corrector::new(
            ShadingTables::identity(pixels).unwrap(),
            ToneTables::new(&ToneSettings::default()).unwrap(),
            Channel::Green,
        );

        let raw: Vec<Vec<u16>> = (0..3)
            .map(|c| (0..pixels).map(|x| (x * 250 + c * 11) as u16).collect())
            .collect();
        let mut lines = ChannelLines::from_channels(raw.clone());
        corrector.correct(&mut lines);

        for c in 0..3 {
            assert_eq!(lines.channel(c), &raw[c][..]);
        }

        let mut gray = ChannelLines::from_channels(vec![vec![0, 1, 2, 65534, 65535]]);
        corrector.correct(&mut gray);
        assert_eq!(gray.channel(0), &[0, 1, 2, 65534, 65535]);
    }

    #[test]
    fn shading_rescales_between_references() {
        let mut shading = ShadingTables::identity(3).unwrap();
        shading.black[0] = vec![1000, 1000, 5000];
        shading.white[0] = vec![3000, 1000, 4000];

        assert_eq!(shading.correct(500, 0, 0), 0);
        assert_eq!(shading.correct(2000, 0, 0), 32767);
        assert_eq!(shading.correct(9000, 0, 0), 65535);
        // white == black and white < black never divide
        assert_eq!(shading.correct(2000, 1, 0), 0);
        assert_eq!(shading.correct(4500, 2, 0), 0);
        assert_eq!(shading.degenerate_columns(), 2);
    }

    #[test]
    fn tables_are_monotonic() {
        for brightness in [-127, -40, 0, 60, 127] {
            assert!(is_monotonic(&brightness_table(brightness).unwrap()), "{brightness}");
        }
        for contrast in [-127, -10, 0, 10, 127] {
            assert!(is_monotonic(&contrast_table(contrast).unwrap()), "{contrast}");
        }
        for gamma in [0.1, 0.5, 1.0, 1.7, 4.0] {
            assert!(is_monotonic(&gamma_table(gamma).unwrap()), "{gamma}");
        }
    }

    #[test]
    fn curve_shapes() {
        let bright = brightness_table(127).unwrap();
        assert!(bright[0] > 30000);
        assert_eq!(bright[65535], 65535);
        let dark = brightness_table(-127).unwrap();
        assert_eq!(dark[0], 0);
        assert!(dark[65535] < 35000);

        let steep = contrast_table(100).unwrap();
        assert!(steep[16384] < 16384);
        assert!(steep[49151] > 49151);
        assert_eq!(steep[0], 0);
        assert_eq!(steep[65535], 65535);

        let gamma = gamma_table(2.0).unwrap();
        assert_eq!(gamma[0], 0);
        assert_eq!(gamma[65535], 65535);
        assert_eq!(gamma[16384], 32768);
        assert_eq!(gamma_table(0.0), Err(SaneError::Inval));
    }
}
