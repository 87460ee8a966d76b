//! Conversion of corrected 16-bit channel lines into client bytes.

use crate::{
    geometry::{ScanMode, ScanParameters},
    reader::ChannelLines,
    result::Result,
    utils::try_zeroed,
};

#[rustfmt::skip]
const BAYER: [[u8; 8]; 8] = [
    [ 0, 32,  8, 40,  2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44,  4, 36, 14, 46,  6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [ 3, 35, 11, 43,  1, 33,  9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47,  7, 39, 13, 45,  5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// Inserts the average of each sample pair between them; the last sample repeats.
pub fn double_width(src: &[u16], dst: &mut [u16]) {
    for (i, &value) in src.iter().enumerate() {
        let next = src.get(i + 1).copied().unwrap_or(value);
        if let Some(slot) = dst.get_mut(2 * i) {
            *slot = value;
        }
        if let Some(slot) = dst.get_mut(2 * i + 1) {
            *slot = ((value as u32 + next as u32) / 2) as u16;
        }
    }
}

fn average_lines(a: &ChannelLines, b: &ChannelLines, out: &mut ChannelLines) {
    for channel in 0..out.channels() {
        let (a, b) = (a.channel(channel), b.channel(channel));
        for (x, value) in out.channel_mut(channel).iter_mut().enumerate() {
            *value = ((a[x] as u32 + b[x] as u32) / 2) as u16;
        }
    }
}

/// Emits a blended line between consecutive lines, doubling the line count.
pub struct VerticalInterpolator {
    previous: Option<ChannelLines>,
    blend: ChannelLines,
}

impl VerticalInterpolator {
    pub fn new(channels: usize, pixels: usize) -> Result<Self> {
        Ok(Self {
            previous: None,
            blend: ChannelLines::new(channels, pixels)?,
        })
    }

    pub fn push<F>(&mut self, line: &ChannelLines, mut emit: F) -> Result<()>
    where
        F: FnMut(&ChannelLines) -> Result<()>,
    {
        if let Some(previous) = &self.previous {
            average_lines(previous, line, &mut self.blend);
            emit(&self.blend)?;
        }
        emit(line)?;

        match &mut self.previous {
            Some(previous) => previous.clone_from(line),
            None => self.previous = Some(line.clone()),
        }
        Ok(())
    }

    /// Repeats the last line so every source line yields two.
    pub fn finish<F>(&mut self, mut emit: F) -> Result<()>
    where
        F: FnMut(&ChannelLines) -> Result<()>,
    {
        match self.previous.take() {
            Some(last) => emit(&last),
            None => Ok(()),
        }
    }
}

/// Writes lines in the client's sample format.
pub struct LinePacker {
    mode: ScanMode,
    output_depth: u8,
    negative: bool,
    threshold: u8,
    interpolate_x: bool,
    row: usize,
    wide: ChannelLines,
    out: Vec<u8>,
}

impl LinePacker {
    pub fn new(params: &ScanParameters, threshold: u8) -> Result<Self> {
        let pixels = params.output_pixels_per_line() as usize;
        let wide_pixels = if params.interpolate_x { pixels } else { 0 };

        Ok(Self {
            mode: params.mode,
            output_depth: params.output_depth,
            negative: params.negative,
            threshold,
            interpolate_x: params.interpolate_x,
            row: 0,
            wide: ChannelLines::new(params.channels(), wide_pixels)?,
            out: try_zeroed(params.output_bytes_per_line())?,
        })
    }

    pub fn bytes_per_line(&self) -> usize {
        self.out.len()
    }

    pub fn pack(&mut self, line: &ChannelLines) -> &[u8] {
        if self.interpolate_x {
            for channel in 0..line.channels() {
                double_width(line.channel(channel), self.wide.channel_mut(channel));
            }
        }
        let src = if self.interpolate_x { &self.wide } else { line };

        let invert = |value: u16| if self.negative { u16::MAX - value } else { value };

        match self.output_depth {
            1 => {
                self.out.fill(0);
                let row = &BAYER[self.row % 8];
                for (x, &value) in src.channel(0).iter().enumerate() {
                    let level = invert(value) / 257;
                    let black = match self.mode {
                        ScanMode::Halftone => level < row[x % 8] as u16 * 4 + 2,
                        _ => level <= self.threshold as u16,
                    };
                    if black {
                        self.out[x / 8] |= 0x80 >> (x % 8);
                    }
                }
            }
            16 => {
                let channels = src.channels();
                for channel in 0..channels {
                    for (x, &value) in src.channel(channel).iter().enumerate() {
                        let at = (x * channels + channel) * 2;
                        self.out[at..at + 2].copy_from_slice(&invert(value).to_ne_bytes());
                    }
                }
            }
            _ => {
                let channels = src.channels();
                for channel in 0..channels {
                    for (x, &value) in src.channel(channel).iter().enumerate() {
                        self.out[x * channels + channel] = (invert(value) / 257) as u8;
                    }
                }
            }
        }

        self.row += 1;
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::{plan, ScanRequest},
        profile::{find_model, ScanSource},
        utils::Fixed,
    };

    fn params(mode: ScanMode, dpi: u32, depth: u8) -> ScanParameters {
        let profile = find_model("artec-eplus48u").unwrap();
        let request = ScanRequest {
            tl_x: Fixed::from_int(0),
            tl_y: Fixed::from_int(0),
            br_x: Fixed::from_int(20),
            br_y: Fixed::from_int(2),
            xdpi: dpi,
            ydpi: dpi,
            mode,
            depth,
            source: ScanSource::Flatbed,
            negative: false,
        };
        plan(&request, &profile).unwrap()
    }

    #[test]
    fn doubles_width_with_averages() {
        let mut dst = [0u16; 6];
        double_width(&[100, 200, 301], &mut dst);
        assert_eq!(dst, [100, 150, 200, 250, 301, 301]);
    }

    #[test]
    fn vertical_interpolation_doubles_lines() {
        let mut interpolator = VerticalInterpolator::new(1, 2).unwrap();
        let mut emitted = Vec::new();
        for value in [0u16, 100, 300] {
            let line = ChannelLines::from_channels(vec![vec![value, value + 1]]);
            interpolator
                .push(&line, |l| Ok(emitted.push(l.channel(0)[0])))
                .unwrap();
        }
        interpolator
            .finish(|l| Ok(emitted.push(l.channel(0)[0])))
            .unwrap();

        assert_eq!(emitted, [0, 50, 100, 200, 300, 300]);
    }

    #[test]
    fn packs_eight_bit_color() {
        let params = params(ScanMode::Color, 50, 8);
        let mut packer = LinePacker::new(&params, 128).unwrap();
        let pixels = params.pixel_xs as usize;
        let line = ChannelLines::from_channels(vec![
            vec![0xffff; pixels],
            vec![0x8080; pixels],
            vec![0; pixels],
        ]);

        let out = packer.pack(&line);
        assert_eq!(out.len(), pixels * 3);
        assert_eq!(&out[..3], &[0xff, 0x80, 0x00]);
    }

    #[test]
    fn packs_sixteen_bit_native_order() {
        let mut params = params(ScanMode::Gray, 50, 16);
        params.negative = true;
        let mut packer = LinePacker::new(&params, 128).unwrap();
        let pixels = params.pixel_xs as usize;
        let line = ChannelLines::from_channels(vec![vec![0x1234; pixels]]);

        let out = packer.pack(&line);
        assert_eq!(&out[..2], &(0xffff - 0x1234u16).to_ne_bytes());
    }

    #[test]
    fn lineart_threshold_sets_black_bits() {
        let params = params(ScanMode::Lineart, 50, 8);
        let mut packer = LinePacker::new(&params, 100).unwrap();
        let pixels = params.pixel_xs as usize;
        let mut samples = vec![0xffff; pixels];
        samples[0] = 100 * 257;
        samples[2] = 101 * 257;
        samples[9] = 0;
        let out = packer.pack(&ChannelLines::from_channels(vec![samples]));

        assert_eq!(out.len(), pixels.div_ceil(8));
        assert_eq!(out[0], 0b1000_0000);
        assert_eq!(out[1], 0b0100_0000);
    }

    #[test]
    fn halftone_dithers_mid_gray() {
        let params = params(ScanMode::Halftone, 50, 8);
        let mut packer = LinePacker::new(&params, 128).unwrap();
        let pixels = params.pixel_xs as usize;
        let line = ChannelLines::from_channels(vec![vec![128 * 257; pixels]]);

        let out = packer.pack(&line).to_vec();
        let black: u32 = out.iter().map(|b| b.count_ones()).sum();
        assert!(black > 0 && (black as usize) < pixels);
    }
}
