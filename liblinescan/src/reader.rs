use crate::{
    geometry::ScanParameters,
    hardware::Hardware,
    profile::ColorOrdering,
    reorder::{CcdReorderer, LineArrangement},
    result::{Result, SaneError},
    utils::try_zeroed,
};

/// One scan line as 16-bit samples, one buffer per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLines {
    channels: Vec<Vec<u16>>,
}

impl ChannelLines {
    pub fn new(channels: usize, pixels: usize) -> Result<Self> {
        let mut buffers = Vec::with_capacity(channels);
        for _ in 0..channels {
            buffers.push(try_zeroed(pixels)?);
        }
        Ok(Self { channels: buffers })
    }

    pub fn from_channels(channels: Vec<Vec<u16>>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    pub fn pixels(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[u16] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [u16] {
        &mut self.channels[index]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Vec<u16>> {
        self.channels.iter_mut()
    }

    /// Overwrites this line with `other`, reusing the buffers.
    pub fn copy_from(&mut self, other: &ChannelLines) {
        self.channels.resize_with(other.channels.len(), Vec::new);
        for (dst, src) in self.channels.iter_mut().zip(&other.channels) {
            dst.clone_from(src);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    Gray8,
    Gray16,
    Color8,
    Color16,
}

impl LineFormat {
    pub fn new(color: bool, depth: u8) -> Result<Self> {
        match (color, depth) {
            (false, 8) => Ok(LineFormat::Gray8),
            (false, 16) => Ok(LineFormat::Gray16),
            (true, 8) => Ok(LineFormat::Color8),
            (true, 16) => Ok(LineFormat::Color16),
            (color, depth) => {
                log::error!("No line reader for depth {depth} (color {color})");
                Err(SaneError::Unsupported)
            }
        }
    }

    fn wide(self) -> bool {
        matches!(self, LineFormat::Gray16 | LineFormat::Color16)
    }

    fn channels(self) -> usize {
        match self {
            LineFormat::Gray8 | LineFormat::Gray16 => 1,
            LineFormat::Color8 | LineFormat::Color16 => 3,
        }
    }
}

enum Layout {
    Single,
    Interleaved,
    /// Blue, green and red planes in one read.
    Planes,
    Ccd(Box<CcdReorderer>),
}

/// Pulls raw reads from the device and widens them to 16-bit channel lines.
pub struct LineReader {
    format: LineFormat,
    layout: Layout,
    pixels: usize,
    plane_bytes: usize,
    raw: Vec<u8>,
    row: Vec<u16>,
    line: ChannelLines,
}

impl LineReader {
    pub fn new(params: &ScanParameters) -> Result<Self> {
        let format = LineFormat::new(params.color, params.depth)?;

        let layout = match (params.color, params.ordering) {
            (false, _) => Layout::Single,
            (true, ColorOrdering::Pixel) => Layout::Interleaved,
            (true, ColorOrdering::LinePlanes) => Layout::Planes,
            (true, ColorOrdering::LineCcd { .. }) => {
                let (distance, code) = params.ccd_layout().ok_or(SaneError::Inval)?;
                let reorderer =
                    CcdReorderer::new(params, distance, LineArrangement::from_code(code))?;
                Layout::Ccd(Box::new(reorderer))
            }
        };

        Ok(Self {
            format,
            layout,
            pixels: params.pixel_xs as usize,
            plane_bytes: params.scan_bpl as usize,
            raw: try_zeroed(params.raw_line_bytes())?,
            row: try_zeroed(params.pixel_xs as usize)?,
            line: ChannelLines::new(format.channels(), params.pixel_xs as usize)?,
        })
    }

    pub fn format(&self) -> LineFormat {
        self.format
    }

    /// Reads the next complete line.
    pub fn read_line(&mut self, hw: &mut Hardware) -> Result<&ChannelLines> {
        let wide = self.format.wide();
        let sample = if wide { 2 } else { 1 };

        match &mut self.layout {
            Layout::Single => {
                let received = hw.read(&mut self.raw)?;
                check_received(received, self.raw.len())?;
                unpack(&self.raw, self.line.channel_mut(0), wide);
            }
            Layout::Interleaved => {
                let received = hw.read(&mut self.raw)?;
                check_received(received, self.raw.len())?;
                unpack_interleaved(&self.raw, &mut self.line, wide);
            }
            Layout::Planes => {
                let received = hw.read(&mut self.raw)?;
                check_received(received, self.raw.len())?;
                for (plane, channel) in [2, 1, 0].into_iter().enumerate() {
                    let start = plane * self.plane_bytes;
                    let end = start + self.pixels * sample;
                    unpack(&self.raw[start..end], self.line.channel_mut(channel), wide);
                }
            }
            Layout::Ccd(reorderer) => {
                while !reorderer.pop(&mut self.line) {
                    let received = hw.read(&mut self.raw)?;
                    check_received(received, self.raw.len())?;
                    unpack(&self.raw, &mut self.row, wide);
                    reorderer.push(&self.row)?;
                }
            }
        }

        Ok(&self.line)
    }
}

fn check_received(received: usize, expected: usize) -> Result<()> {
    match received {
        0 => Err(SaneError::EOF),
        n if n < expected => {
            log::error!("Short line: {n} of {expected} bytes");
            Err(SaneError::IO)
        }
        _ => Ok(()),
    }
}

/// Widens samples to 16 bits. 8-bit values are replicated into both bytes.
fn unpack(src: &[u8], dst: &mut [u16], wide: bool) {
    if wide {
        for (value, bytes) in dst.iter_mut().zip(src.chunks_exact(2)) {
            *value = u16::from_le_bytes([bytes[0], bytes[1]]);
        }
    } else {
        for (value, &byte) in dst.iter_mut().zip(src) {
            *value = (byte as u16) << 8 | byte as u16;
        }
    }
}

fn unpack_interleaved(src: &[u8], line: &mut ChannelLines, wide: bool) {
    let sample = if wide { 2 } else { 1 };
    let pixels = line.pixels();

    for channel in 0..line.channels() {
        let dst = line.channel_mut(channel);
        for (x, value) in dst.iter_mut().enumerate().take(pixels) {
            let at = (x * 3 + channel) * sample;
            *value = if wide {
                u16::from_le_bytes([src[at], src[at + 1]])
            } else {
                (src[at] as u16) << 8 | src[at] as u16
            };
        }
    }
}
