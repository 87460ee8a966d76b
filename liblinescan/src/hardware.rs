use crate::{
    profile::Timing,
    protocol::{
        check_ack, parse_moving, parse_ready, AfeParameters, Command, ExposureParameters, Packet,
        SetupScan, PACKET_SIZE,
    },
    result::{Result, SaneError},
    transport::Transport,
    utils::{round_up, try_zeroed},
};
use std::thread;

const BULK_ALIGNMENT: usize = 64;

/// Typed command layer over a transport.
pub struct Hardware {
    transport: Box<dyn Transport>,
    timing: Timing,
    read: Option<ReadState>,
}

struct ReadState {
    buffer: Vec<u8>,
    position: usize,
    filled: usize,
    bytes_left: usize,
}

impl Hardware {
    pub fn new(transport: Box<dyn Transport>, timing: Timing) -> Self {
        Self {
            transport,
            timing,
            read: None,
        }
    }

    fn request(&mut self, command: Command) -> Result<Packet> {
        let packet = command.encode();
        let mut reply = [0; PACKET_SIZE];

        log::trace!("Send command 0x{:02x}", command.opcode());
        self.transport.send(&packet, &mut reply)?;

        Ok(reply)
    }

    fn simple_request(&mut self, command: Command) -> Result<()> {
        let reply = self.request(command)?;
        check_ack(&command, &reply)
    }

    pub fn is_moving(&mut self) -> Result<bool> {
        let reply = self.request(Command::IsMoving)?;
        parse_moving(&reply)
    }

    pub fn carriage_home(&mut self) -> Result<()> {
        self.simple_request(Command::CarriageHome)
    }

    /// Polls until the carriage stops, giving up after the configured retries.
    pub fn wait_for_positioning(&mut self) -> Result<()> {
        for _ in 0..=self.timing.poll_retries {
            if !self.is_moving()? {
                return Ok(());
            }
            thread::sleep(self.timing.poll_interval);
        }

        log::error!("Carriage still moving after {} polls", self.timing.poll_retries);
        Err(SaneError::DeviceBusy)
    }

    pub fn setup_scan(&mut self, setup: &SetupScan) -> Result<()> {
        log::debug!("Setup scan {setup:?}");
        self.simple_request(Command::SetupScan(*setup))
    }

    pub fn set_afe(&mut self, afe: &AfeParameters) -> Result<()> {
        log::debug!("Set AFE {afe:?}");
        self.simple_request(Command::SetAfe(*afe))
    }

    pub fn set_exposure(&mut self, exposure: &ExposureParameters) -> Result<()> {
        log::debug!("Set exposure {exposure:?}");
        self.simple_request(Command::SetExposure(*exposure))
    }

    /// Starts the configured scan and waits until the device has data ready.
    pub fn start_scan(&mut self) -> Result<()> {
        self.wait_for_positioning()?;
        self.simple_request(Command::StartScan)?;

        for _ in 0..=self.timing.poll_retries {
            let reply = self.request(Command::ReadScannedData)?;
            if parse_ready(&reply)? {
                return Ok(());
            }
            thread::sleep(self.timing.poll_interval);
        }

        log::error!("No scan data after {} polls", self.timing.poll_retries);
        Err(SaneError::DeviceBusy)
    }

    pub fn stop_scan(&mut self) -> Result<()> {
        self.simple_request(Command::StopScan)
    }

    /// Stops any scan and returns the carriage, logging failures.
    pub fn park(&mut self) {
        self.read_finish();
        if let Err(err) = self.stop_scan() {
            log::warn!("Failed to stop scan: {err}");
        }
        if let Err(err) = self.carriage_home() {
            log::warn!("Failed to return carriage home: {err}");
        }
    }

    /// Arms the buffered read path for `expected` bytes fetched in `block` sized transfers.
    pub fn read_prepare(&mut self, block: usize, expected: usize) -> Result<()> {
        let block = round_up(block.max(1), BULK_ALIGNMENT);
        self.read = Some(ReadState {
            buffer: try_zeroed(block)?,
            position: 0,
            filled: 0,
            bytes_left: expected,
        });
        Ok(())
    }

    /// Fills `buf` from the data stream. A short count means the stream ended.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(state) = self.read.as_mut() else {
            log::error!("Read without prepared transfer");
            return Err(SaneError::Inval);
        };

        let mut copied = 0;
        while copied < buf.len() {
            if state.position == state.filled {
                if state.bytes_left == 0 {
                    break;
                }

                let raw = round_up(state.bytes_left.min(state.buffer.len()), BULK_ALIGNMENT)
                    .min(state.buffer.len());

                log::trace!("Bulk read of {raw} bytes, {} left", state.bytes_left);
                let received = self.transport.read_bulk(&mut state.buffer[..raw])?;
                if received == 0 {
                    log::error!("Device returned no data with {} bytes left", state.bytes_left);
                    return Err(SaneError::IO);
                }

                state.position = 0;
                state.filled = received.min(state.bytes_left);
                state.bytes_left -= state.filled;
            }

            let count = (state.filled - state.position).min(buf.len() - copied);
            buf[copied..copied + count]
                .copy_from_slice(&state.buffer[state.position..state.position + count]);
            state.position += count;
            copied += count;
        }

        Ok(copied)
    }

    pub fn read_finish(&mut self) {
        if let Some(state) = self.read.take() {
            if state.bytes_left > 0 {
                log::debug!("Read finished with {} bytes unread", state.bytes_left);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ack, moving_reply, ready_reply};
    use std::{collections::VecDeque, time::Duration};

    struct Scripted {
        moving: VecDeque<bool>,
        data: Vec<u8>,
        sent: Vec<u8>,
    }

    impl Transport for Scripted {
        fn send(&mut self, command: &[u8], reply: &mut [u8]) -> Result<()> {
            let packet: &Packet = command.try_into().unwrap();
            let command = Command::decode(packet).unwrap();
            self.sent.push(command.opcode());
            let answer = match command {
                Command::IsMoving => moving_reply(self.moving.pop_front().unwrap_or(false)),
                Command::ReadScannedData => ready_reply(true),
                command => ack(&command),
            };
            reply.copy_from_slice(&answer);
            Ok(())
        }

        fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize> {
            let count = buf.len().min(self.data.len());
            buf[..count].copy_from_slice(&self.data[..count]);
            self.data.drain(..count);
            Ok(count)
        }
    }

    fn timing(retries: u32) -> Timing {
        Timing {
            poll_interval: Duration::ZERO,
            poll_retries: retries,
            cancel_timeout: Duration::from_secs(1),
        }
    }

    fn hardware(moving: &[bool], data: Vec<u8>, retries: u32) -> Hardware {
        let transport = Scripted {
            moving: moving.iter().copied().collect(),
            data,
            sent: Vec::new(),
        };
        Hardware::new(Box::new(transport), timing(retries))
    }

    #[test]
    fn positioning_wait_is_bounded() {
        let mut hw = hardware(&[true, true, false], Vec::new(), 5);
        assert_eq!(hw.wait_for_positioning(), Ok(()));

        let mut hw = hardware(&[true; 10], Vec::new(), 3);
        assert_eq!(hw.wait_for_positioning(), Err(SaneError::DeviceBusy));
    }

    #[test]
    fn buffered_read_splits_blocks() {
        let data: Vec<u8> = (0..=255).collect();
        let mut hw = hardware(&[], data.clone(), 1);
        hw.read_prepare(64, 200).unwrap();

        let mut out = vec![0; 150];
        assert_eq!(hw.read(&mut out).unwrap(), 150);
        assert_eq!(out, data[..150]);

        let mut rest = vec![0; 100];
        assert_eq!(hw.read(&mut rest).unwrap(), 50);
        assert_eq!(rest[..50], data[150..200]);
    }

    #[test]
    fn read_requires_prepare() {
        let mut hw = hardware(&[], vec![1, 2, 3], 1);
        assert_eq!(hw.read(&mut [0; 3]), Err(SaneError::Inval));
    }
}
