//! Command packets of the scanner's USB controller.
//!
//! Every command and reply is a 64-byte packet. Byte 0 of a command is the
//! opcode and byte 1 is `0x01`; the reply echoes the opcode in byte 1.
//! Multi-byte fields are little-endian.

use crate::{
    result::{Result, SaneError},
    utils::{get_le16, get_le32, put_le16, put_le32, Channel},
};
use serde::Deserialize;

pub const PACKET_SIZE: usize = 64;

pub type Packet = [u8; PACKET_SIZE];

const SMALL_SIZE: usize = 8;

const OP_IS_MOVING: u8 = 0x17;
const OP_SETUP_SCAN: u8 = 0x20;
const OP_SET_AFE: u8 = 0x22;
const OP_CARRIAGE_HOME: u8 = 0x24;
const OP_READY: u8 = 0x35;
const OP_STOP_SCAN: u8 = 0x41;
const OP_START_SCAN: u8 = 0x43;
const OP_SET_EXPOSURE: u8 = 0x76;

/// Analog front end offset and gain per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AfeParameters {
    pub r_offset: u8,
    pub r_pga: u8,
    pub g_offset: u8,
    pub g_pga: u8,
    pub b_offset: u8,
    pub b_pga: u8,
}

impl AfeParameters {
    pub const WIRE_SIZE: usize = 6;

    pub fn offset(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Red => self.r_offset,
            Channel::Green => self.g_offset,
            Channel::Blue => self.b_offset,
        }
    }

    pub fn offset_mut(&mut self, channel: Channel) -> &mut u8 {
        match channel {
            Channel::Red => &mut self.r_offset,
            Channel::Green => &mut self.g_offset,
            Channel::Blue => &mut self.b_offset,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        [
            self.r_offset,
            self.r_pga,
            self.g_offset,
            self.g_pga,
            self.b_offset,
            self.b_pga,
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::WIRE_SIZE] = bytes.try_into().ok()?;
        Some(Self {
            r_offset: bytes[0],
            r_pga: bytes[1],
            g_offset: bytes[2],
            g_pga: bytes[3],
            b_offset: bytes[4],
            b_pga: bytes[5],
        })
    }
}

/// Per-channel exposure (integration) time in device units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ExposureParameters {
    pub r_time: i32,
    pub g_time: i32,
    pub b_time: i32,
}

impl ExposureParameters {
    pub const WIRE_SIZE: usize = 12;

    pub const fn uniform(time: i32) -> Self {
        Self {
            r_time: time,
            g_time: time,
            b_time: time,
        }
    }

    pub fn time(&self, channel: Channel) -> i32 {
        match channel {
            Channel::Red => self.r_time,
            Channel::Green => self.g_time,
            Channel::Blue => self.b_time,
        }
    }

    pub fn time_mut(&mut self, channel: Channel) -> &mut i32 {
        match channel {
            Channel::Red => &mut self.r_time,
            Channel::Green => &mut self.g_time,
            Channel::Blue => &mut self.b_time,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut bytes = [0; Self::WIRE_SIZE];
        put_le32(&mut bytes, 0, self.r_time);
        put_le32(&mut bytes, 4, self.g_time);
        put_le32(&mut bytes, 8, self.b_time);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_SIZE {
            return None;
        }
        Some(Self {
            r_time: get_le32(bytes, 0),
            g_time: get_le32(bytes, 4),
            b_time: get_le32(bytes, 8),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorMode {
    /// Carriage advances while the sensor integrates.
    Forward,
    /// Carriage stays put, used for dark-level probes.
    Still,
}

impl MotorMode {
    fn code(self) -> u8 {
        match self {
            MotorMode::Forward => 0x01,
            MotorMode::Still => 0x04,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(MotorMode::Forward),
            0x04 => Some(MotorMode::Still),
            _ => None,
        }
    }
}

/// Scan window in device coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupScan {
    pub abs_y0: u16,
    pub abs_ys: u16,
    pub abs_x0: u16,
    pub abs_xs: u16,
    pub color: bool,
    pub depth: u8,
    pub xdpi: u16,
    pub ydpi: u16,
    pub bytes_per_line: u16,
    pub lines: u16,
    pub motor: MotorMode,
}

impl SetupScan {
    fn mode_code(&self) -> u8 {
        match (self.depth, self.color) {
            (16, true) => 0xa4,
            (16, false) => 0xa2,
            (_, true) => 0x84,
            (_, false) => 0x82,
        }
    }

    fn encode_into(&self, packet: &mut Packet) {
        put_le16(packet, 0x02, self.abs_y0);
        put_le16(packet, 0x04, self.abs_ys);
        put_le16(packet, 0x06, self.abs_x0);
        put_le16(packet, 0x08, self.abs_xs);
        packet[0x0a] = self.mode_code();
        packet[0x0b] = 0x60;
        put_le16(packet, 0x0c, self.xdpi);
        packet[0x0e] = 0x12;
        put_le16(packet, 0x10, self.bytes_per_line);
        put_le16(packet, 0x12, self.lines);
        packet[0x14] = self.motor.code();
        packet[0x15] = self.motor.code();
        put_le16(packet, 0x16, self.ydpi);
    }

    fn decode(packet: &Packet) -> Option<Self> {
        let (depth, color) = match packet[0x0a] {
            0xa4 => (16, true),
            0xa2 => (16, false),
            0x84 => (8, true),
            0x82 => (8, false),
            _ => return None,
        };

        Some(Self {
            abs_y0: get_le16(packet, 0x02),
            abs_ys: get_le16(packet, 0x04),
            abs_x0: get_le16(packet, 0x06),
            abs_xs: get_le16(packet, 0x08),
            color,
            depth,
            xdpi: get_le16(packet, 0x0c),
            ydpi: get_le16(packet, 0x16),
            bytes_per_line: get_le16(packet, 0x10),
            lines: get_le16(packet, 0x12),
            motor: MotorMode::from_code(packet[0x14])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    IsMoving,
    CarriageHome,
    SetupScan(SetupScan),
    SetAfe(AfeParameters),
    SetExposure(ExposureParameters),
    StartScan,
    ReadScannedData,
    StopScan,
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::IsMoving => OP_IS_MOVING,
            Command::CarriageHome => OP_CARRIAGE_HOME,
            Command::SetupScan(_) => OP_SETUP_SCAN,
            Command::SetAfe(_) => OP_SET_AFE,
            Command::SetExposure(_) => OP_SET_EXPOSURE,
            Command::StartScan => OP_START_SCAN,
            Command::ReadScannedData => OP_READY,
            Command::StopScan => OP_STOP_SCAN,
        }
    }

    /// Small requests carry 8 meaningful bytes, repeated over the packet.
    pub fn is_small(&self) -> bool {
        matches!(self, Command::StopScan)
    }

    pub fn encode(&self) -> Packet {
        let mut packet = [0; PACKET_SIZE];
        packet[0] = self.opcode();
        packet[1] = 0x01;

        match self {
            Command::SetupScan(setup) => setup.encode_into(&mut packet),
            Command::SetAfe(afe) => packet[2..2 + AfeParameters::WIRE_SIZE]
                .copy_from_slice(&afe.to_bytes()),
            Command::SetExposure(exposure) => {
                for (i, channel) in Channel::ALL.into_iter().enumerate() {
                    packet[2 + i * 4] = 0x04;
                    put_le16(&mut packet, 4 + i * 4, exposure.time(channel) as u16);
                }
            }
            _ => {}
        }

        if self.is_small() {
            let (head, tail) = packet.split_at_mut(SMALL_SIZE);
            for chunk in tail.chunks_exact_mut(SMALL_SIZE) {
                chunk.copy_from_slice(head);
            }
        }

        packet
    }

    pub fn decode(packet: &Packet) -> Option<Command> {
        if packet[1] != 0x01 {
            return None;
        }

        let command = match packet[0] {
            OP_IS_MOVING => Command::IsMoving,
            OP_CARRIAGE_HOME => Command::CarriageHome,
            OP_SETUP_SCAN => Command::SetupScan(SetupScan::decode(packet)?),
            OP_SET_AFE => Command::SetAfe(AfeParameters::from_bytes(&packet[2..8])?),
            OP_SET_EXPOSURE => {
                let time = |i: usize| get_le16(packet, 4 + i * 4) as i32;
                Command::SetExposure(ExposureParameters {
                    r_time: time(0),
                    g_time: time(1),
                    b_time: time(2),
                })
            }
            OP_START_SCAN => Command::StartScan,
            OP_READY => Command::ReadScannedData,
            OP_STOP_SCAN => Command::StopScan,
            _ => return None,
        };

        Some(command)
    }
}

/// Plain acknowledgement of `command`.
pub fn ack(command: &Command) -> Packet {
    let mut reply = [0; PACKET_SIZE];
    reply[1] = command.opcode();
    reply
}

pub fn moving_reply(moving: bool) -> Packet {
    let mut reply = ack(&Command::IsMoving);
    reply[2] = if moving { 0x01 } else { 0x00 };
    reply
}

pub fn ready_reply(ready: bool) -> Packet {
    let mut reply = ack(&Command::ReadScannedData);
    reply[0] = if ready { 0x00 } else { 0x01 };
    reply
}

pub fn check_ack(command: &Command, reply: &Packet) -> Result<()> {
    if reply[1] != command.opcode() {
        log::error!(
            "Reply to command 0x{:02x} carries opcode 0x{:02x}",
            command.opcode(),
            reply[1]
        );
        return Err(SaneError::IO);
    }
    Ok(())
}

pub fn parse_moving(reply: &Packet) -> Result<bool> {
    check_ack(&Command::IsMoving, reply)?;
    if reply[0] != 0x00 {
        log::error!("Moving status reply has error byte 0x{:02x}", reply[0]);
        return Err(SaneError::IO);
    }
    Ok(!(reply[2] == 0x00 && (reply[3] == 0x00 || reply[3] == 0x02)))
}

pub fn parse_ready(reply: &Packet) -> Result<bool> {
    check_ack(&Command::ReadScannedData, reply)?;
    Ok(reply[0] == 0x00)
}
