use crate::result::Result;
use serde::Deserialize;
use std::fmt;

pub const MM_PER_INCH: f64 = 25.4;

/// SANE fixed point value: 16 integer bits and 16 fractional bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(from = "f64")]
pub struct Fixed(i32);

impl Fixed {
    pub const SCALE_SHIFT: u32 = 16;

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn from_int(value: i32) -> Self {
        Self(value << Self::SCALE_SHIFT)
    }

    pub fn from_f64(value: f64) -> Self {
        Self((value * (1 << Self::SCALE_SHIFT) as f64).round() as i32)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / (1 << Self::SCALE_SHIFT) as f64
    }
}

impl From<f64> for Fixed {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl std::ops::Add for Fixed {
    type Output = Fixed;

    fn add(self, rhs: Self) -> Self::Output {
        Fixed(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for Fixed {
    type Output = Fixed;

    fn sub(self, rhs: Self) -> Self::Output {
        Fixed(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.to_f64())
    }
}

/// Pixels covered by `length` millimetres sampled at `dpi`, rounded to nearest.
pub fn mm_to_pixels(length: Fixed, dpi: u32) -> u32 {
    let pixels = length.to_f64() * dpi as f64 / MM_PER_INCH + 0.5;
    if pixels <= 0.0 {
        0
    } else {
        pixels as u32
    }
}

/// Color channel of a sample. Discriminants index per-channel arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Red => "red",
            Channel::Green => "green",
            Channel::Blue => "blue",
        };
        f.write_str(name)
    }
}

pub fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// Allocates a zeroed buffer, reporting allocator refusal as `NoMem`.
pub fn try_zeroed<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, T::default());
    Ok(buf)
}

// Wire fields are little-endian regardless of host order.

pub fn get_le16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub fn put_le16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub fn get_le32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub fn put_le32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_converts_millimetres() {
        assert_eq!(Fixed::from_int(216).to_f64(), 216.0);
        assert_eq!(Fixed::from_f64(25.4).to_f64(), 25.399993896484375);
        assert_eq!(mm_to_pixels(Fixed::from_int(216), 100), 850);
        assert_eq!(mm_to_pixels(Fixed::from_f64(25.4), 600), 600);
        assert_eq!(mm_to_pixels(Fixed::from_int(-3), 600), 0);
    }

    #[test]
    fn le_fields() {
        let mut buf = [0u8; 8];
        put_le16(&mut buf, 1, 0x1234);
        put_le32(&mut buf, 3, -2);
        assert_eq!(buf, [0, 0x34, 0x12, 0xfe, 0xff, 0xff, 0xff, 0]);
        assert_eq!(get_le16(&buf, 1), 0x1234);
        assert_eq!(get_le32(&buf, 3), -2);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(850, 64), 896);
        assert_eq!(round_up(896, 64), 896);
        assert_eq!(round_up(7, 0), 7);
    }
}
