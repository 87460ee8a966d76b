//! Realignment of color rows that a multi-row CCD delivers at different times.
//!
//! A three-row sensor exposes its leading row to a document line first; the
//! middle row sees the same line `distance` steps later and the trailing row
//! `2 * distance` steps later. Every step the device sends one raw line per
//! active row, in an order fixed by the model's arrangement code.

use crate::{
    geometry::ScanParameters,
    reader::ChannelLines,
    result::{Result, SaneError},
    utils::{try_zeroed, Channel},
};

/// Colors of the raw lines in one read cycle.
///
/// Slot 0 is the leading row alone, slots 1-2 the leading and middle rows,
/// slots 3-5 all three rows, slots 6-7 the middle and trailing rows, and
/// slot 8 the trailing row alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineArrangement([Channel; 9]);

impl LineArrangement {
    pub fn from_code(code: u8) -> Self {
        use Channel::{Blue as B, Green as G, Red as R};

        let colors = match code {
            1 => [G, B, G, B, R, G, B, R, R],
            2 => [B, G, B, G, R, B, G, R, R],
            3 => [R, B, R, B, G, R, B, G, G],
            4 => [R, G, R, G, R, B, G, B, B],
            32 => [G, G, B, G, R, B, R, B, R],
            33 => [R, R, B, R, G, B, G, B, G],
            code => {
                log::warn!("Unknown line arrangement {code}, assuming 1");
                [G, B, G, B, R, G, B, R, R]
            }
        };

        Self(colors)
    }

    pub fn slot(&self, slot: usize) -> Channel {
        self.0[slot]
    }

    pub fn leading(&self) -> Channel {
        self.0[0]
    }

    pub fn trailing(&self) -> Channel {
        self.0[8]
    }

    pub fn middle(&self) -> Channel {
        let (leading, trailing) = (self.leading(), self.trailing());
        Channel::ALL
            .into_iter()
            .find(|&c| c != leading && c != trailing)
            .unwrap_or(Channel::Green)
    }

    /// Order of the rows within a step where all of them deliver.
    pub fn cycle(&self) -> [Channel; 3] {
        [self.0[3], self.0[4], self.0[5]]
    }

    /// Steps by which `channel`'s row lags the leading row.
    pub fn delay(&self, channel: Channel, distance: u32) -> u32 {
        if channel == self.leading() {
            0
        } else if channel == self.middle() {
            distance
        } else {
            2 * distance
        }
    }
}

/// Proportional dropping of optical lines down to a lower resolution.
///
/// Line `n` (counted from 1) is dropped when it equals
/// `k * optical / (optical - requested)` for the next pending `k`.
#[derive(Debug, Clone)]
pub struct LineSkipper {
    optical: u32,
    requested: u32,
    next_drop: u32,
    seen: u32,
}

impl LineSkipper {
    pub fn new(optical: u32, requested: u32) -> Self {
        Self {
            optical,
            requested,
            next_drop: 1,
            seen: 1,
        }
    }

    /// Whether the next optical line is dropped.
    pub fn skip_next(&mut self) -> bool {
        if self.requested >= self.optical {
            return false;
        }

        let drop_at =
            (self.next_drop as u64 * self.optical as u64 / (self.optical - self.requested) as u64) as u32;
        let current = self.seen;
        self.seen += 1;

        if current == drop_at {
            self.next_drop += 1;
            true
        } else {
            false
        }
    }
}

/// Lines remaining out of `optical_lines` after proportional dropping.
pub fn kept_lines(optical_lines: u32, optical: u32, requested: u32) -> u32 {
    let mut skipper = LineSkipper::new(optical, requested);
    (0..optical_lines).filter(|_| !skipper.skip_next()).count() as u32
}

/// Ring of lines holding back one color until the others catch up.
pub struct DelayLine {
    slots: Vec<Vec<u16>>,
    head: usize,
    stored: usize,
}

impl DelayLine {
    pub fn new(capacity: usize, pixels: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        for _ in 0..capacity {
            slots.push(try_zeroed(pixels)?);
        }

        Ok(Self {
            slots,
            head: 0,
            stored: 0,
        })
    }

    pub fn push(&mut self, line: &[u16]) -> Result<()> {
        if self.stored == self.slots.len() {
            log::error!("Delay line overflow after {} lines", self.stored);
            return Err(SaneError::IO);
        }

        let slot = &mut self.slots[self.head];
        let count = slot.len().min(line.len());
        slot[..count].copy_from_slice(&line[..count]);

        self.head = (self.head + 1) % self.slots.len();
        self.stored += 1;
        Ok(())
    }

    pub fn stored(&self) -> usize {
        self.stored
    }

    pub fn front(&self) -> Option<&[u16]> {
        if self.stored == 0 {
            return None;
        }
        let tail = (self.head + self.slots.len() - self.stored) % self.slots.len();
        Some(&self.slots[tail])
    }

    pub fn pop(&mut self) {
        self.stored = self.stored.saturating_sub(1);
    }
}

/// Order in which the device delivers color rows, step by step.
#[derive(Debug, Clone)]
struct RowSchedule {
    cycle: [Channel; 3],
    delays: [u32; 3],
    lines: u32,
    last_step: u32,
    step: u32,
    slot: usize,
}

impl RowSchedule {
    fn new(arrangement: &LineArrangement, distance: u32, lines: u32) -> Self {
        Self {
            cycle: arrangement.cycle(),
            delays: Channel::ALL.map(|c| arrangement.delay(c, distance)),
            lines,
            last_step: lines + 2 * distance,
            step: 0,
            slot: 0,
        }
    }

    fn next_row(&mut self) -> Option<Channel> {
        while self.step < self.last_step {
            while self.slot < self.cycle.len() {
                let channel = self.cycle[self.slot];
                self.slot += 1;

                let delay = self.delays[channel.index()];
                if self.step >= delay && self.step < delay + self.lines {
                    return Some(channel);
                }
            }

            self.slot = 0;
            self.step += 1;
        }

        None
    }
}

/// Reassembles single-color raw lines into synchronized color lines.
pub struct CcdReorderer {
    rings: [DelayLine; 3],
    schedule: RowSchedule,
    skippers: [LineSkipper; 3],
    emitted: u32,
}

impl CcdReorderer {
    pub fn new(params: &ScanParameters, distance: u32, arrangement: LineArrangement) -> Result<Self> {
        let capacity = 3 * distance as usize + 2;
        let pixels = params.pixel_xs as usize;

        log::debug!(
            "CCD reorder: distance {distance}, arrangement {arrangement:?}, {} optical lines, ring of {capacity}",
            params.optical_lines
        );

        Ok(Self {
            rings: [
                DelayLine::new(capacity, pixels)?,
                DelayLine::new(capacity, pixels)?,
                DelayLine::new(capacity, pixels)?,
            ],
            schedule: RowSchedule::new(&arrangement, distance, params.optical_lines),
            skippers: std::array::from_fn(|_| LineSkipper::new(params.line_rate, params.ydpi)),
            emitted: 0,
        })
    }

    /// Files one raw line under the color the schedule expects next.
    pub fn push(&mut self, raw: &[u16]) -> Result<Channel> {
        loop {
            let Some(channel) = self.schedule.next_row() else {
                log::error!("Device sent more lines than the scan covers");
                return Err(SaneError::IO);
            };

            // Dropped lines are never transferred.
            if self.skippers[channel.index()].skip_next() {
                continue;
            }

            self.rings[channel.index()].push(raw)?;
            return Ok(channel);
        }
    }

    /// Moves the next complete color line into `out`, if every row has delivered it.
    pub fn pop(&mut self, out: &mut ChannelLines) -> bool {
        if self.rings.iter().any(|ring| ring.stored() == 0) {
            return false;
        }

        for channel in Channel::ALL {
            let ring = &mut self.rings[channel.index()];
            if let Some(line) = ring.front() {
                let dst = out.channel_mut(channel.index());
                let count = dst.len().min(line.len());
                dst[..count].copy_from_slice(&line[..count]);
            }
            ring.pop();
        }

        self.emitted += 1;
        true
    }

    pub fn emitted(&self) -> u32 {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Color at raw position `p` per the cycle table, for `lines >= 2 * d`.
    fn table_color(arrangement: &LineArrangement, p: u32, d: u32, lines: u32) -> Channel {
        let slot = if p < d {
            0
        } else if p < 3 * d {
            1 + (p - d) % 2
        } else if p < 3 * lines - 3 * d {
            3 + p % 3
        } else if p < 3 * lines - d {
            6 + (p + 3 * d - 3 * lines) % 2
        } else {
            8
        };
        arrangement.slot(slot as usize)
    }

    #[test]
    fn schedule_matches_cycle_table() {
        for code in [1, 2, 3, 4, 32, 33] {
            let arrangement = LineArrangement::from_code(code);
            for (d, lines) in [(0, 5), (1, 7), (4, 9), (16, 40)] {
                let mut schedule = RowSchedule::new(&arrangement, d, lines);
                for p in 0..3 * lines {
                    assert_eq!(
                        schedule.next_row(),
                        Some(table_color(&arrangement, p, d, lines)),
                        "code {code} distance {d} position {p}"
                    );
                }
                assert_eq!(schedule.next_row(), None);
            }
        }
    }

    #[test]
    fn arrangement_rows() {
        let arrangement = LineArrangement::from_code(1);
        assert_eq!(arrangement.leading(), Channel::Green);
        assert_eq!(arrangement.middle(), Channel::Blue);
        assert_eq!(arrangement.trailing(), Channel::Red);
        assert_eq!(LineArrangement::from_code(99), arrangement);
    }

    #[test]
    fn skipper_halves_lines() {
        let mut skipper = LineSkipper::new(600, 300);
        let dropped: Vec<bool> = (0..6).map(|_| skipper.skip_next()).collect();
        assert_eq!(dropped, [false, true, false, true, false, true]);
        assert_eq!(kept_lines(601, 600, 300), 301);
    }

    #[test]
    fn skipper_keeps_every_sixth_line() {
        let mut skipper = LineSkipper::new(600, 100);
        let kept: Vec<u32> = (1..=24).filter(|_| !skipper.skip_next()).collect();
        assert_eq!(kept, [5, 11, 17, 23]);
        assert_eq!(kept_lines(600, 600, 600), 600);
    }

    #[test]
    fn delay_line_is_bounded() {
        let mut ring = DelayLine::new(2, 3).unwrap();
        ring.push(&[1, 2, 3]).unwrap();
        ring.push(&[4, 5, 6]).unwrap();
        assert_eq!(ring.push(&[7, 8, 9]), Err(SaneError::IO));

        assert_eq!(ring.front(), Some(&[1, 2, 3][..]));
        ring.pop();
        ring.push(&[7, 8, 9]).unwrap();
        assert_eq!(ring.front(), Some(&[4, 5, 6][..]));
        ring.pop();
        assert_eq!(ring.front(), Some(&[7, 8, 9][..]));
        ring.pop();
        assert_eq!(ring.front(), None);
    }
}
