//! Delay line calibration.
//!
//! Each candidate timing is applied to the controller and checked with a
//! write/read-back of a test block through the memory mapped window. Passing
//! receive delays are collected into one 32-bit mask per transmit delay, the
//! widest run of passing points wins and its midpoint becomes the operating
//! point.

use core::ops::RangeInclusive;

use log::{debug, info, trace, warn};

use crate::mspi::{Mspi, Request, TimingScan};
use crate::session::bus_error;
use crate::Error;

/// Number of fine delay steps on each axis
pub const DELAY_STEPS: usize = 32;

/// Bytes written and read back per check
pub const CHECK_CHUNK: usize = 256;

/// Test data written during a check
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// 0x5555AAAA words
    Alternating,
    /// 0xFFFF0000 words
    HighHalf,
    /// One bit set, moving up each byte
    WalkingOne,
    /// 1, 2, 3, ...
    Incrementing,
    /// 0xFF, 0xFE, 0xFD, ...
    Decrementing,
}

impl Pattern {
    pub const ALL: [Pattern; 5] = [
        Pattern::Alternating,
        Pattern::HighHalf,
        Pattern::WalkingOne,
        Pattern::Incrementing,
        Pattern::Decrementing,
    ];

    /// Rotating pattern for the `index`th chunk
    pub fn from_index(index: usize) -> Pattern {
        Self::ALL[index % Self::ALL.len()]
    }

    /// Fill `buf`. Its length must be a multiple of 4.
    pub fn fill(self, buf: &mut [u8]) -> Result<(), Error> {
        if buf.len() % 4 != 0 {
            return Err(Error::InvalidArgument);
        }
        match self {
            Pattern::Alternating => fill_words(buf, 0x5555_AAAA),
            Pattern::HighHalf => fill_words(buf, 0xFFFF_0000),
            Pattern::WalkingOne => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = 1 << (i % 8);
                }
            }
            Pattern::Incrementing => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = (i + 1) as u8;
                }
            }
            Pattern::Decrementing => {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = 0xFF - (i as u8);
                }
            }
        }
        Ok(())
    }
}

fn fill_words(buf: &mut [u8], word: u32) {
    for chunk in buf.chunks_exact_mut(4) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

/// Length of the longest run of set bits in `mask`
pub fn count_consecutive_ones(mask: u32) -> u32 {
    let mut data = mask;
    let mut count = 0;
    while data != 0 {
        data &= data << 1;
        count += 1;
    }
    count
}

/// Bit index to operate at inside the longest run of set bits of `mask`.
///
/// The first of several equally long runs wins. A window touching the low
/// edge leans one step down for odd lengths, one touching the high edge
/// leans one step up; the result always stays inside the run.
pub fn find_mid_point(mask: u32) -> Option<u8> {
    let (mut best_start, mut best_len) = (0u32, 0u32);
    let mut run_start = 0u32;
    let mut run_len = 0u32;
    for i in 0..=32u32 {
        if i < 32 && mask & (1 << i) != 0 {
            if run_len == 0 {
                run_start = i;
            }
            run_len += 1;
        } else {
            if run_len > best_len {
                best_start = run_start;
                best_len = run_len;
            }
            run_len = 0;
        }
    }
    if best_len == 0 {
        return None;
    }

    let first = best_start;
    let last = best_start + best_len - 1;
    let mut point = first + (best_len - 1) / 2;
    if point < 16 && mask & 0x0000_0002 != 0 {
        point = point.saturating_sub(best_len % 2);
    } else if point > 15 && mask & 0x4000_0000 != 0 {
        point += 1;
    }
    Some(point.clamp(first, last) as u8)
}

/// Timing knobs swept during calibration. Unswept knobs keep the value the
/// controller reports before the scan.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanAxes {
    pub tx_neg: bool,
    pub rx_neg: bool,
    pub rx_cap: bool,
    /// Base turnaround and one more cycle
    pub turnaround: bool,
    pub tx_delay: bool,
    pub rx_delay: bool,
}

impl Default for ScanAxes {
    fn default() -> Self {
        ScanAxes {
            tx_neg: false,
            rx_neg: false,
            rx_cap: false,
            turnaround: false,
            tx_delay: true,
            rx_delay: true,
        }
    }
}

/// Calibration policy
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationConfig {
    pub axes: ScanAxes,
    /// Narrowest passing window accepted
    pub min_acceptance_len: u32,
    /// Bytes checked per scan point, a non-zero multiple of 4 up to
    /// `MAX_BLOCK_SIZE`
    pub block_size: u32,
    /// Trust a cached result after one passing check
    pub fast_scan: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            axes: ScanAxes::default(),
            min_acceptance_len: 3,
            block_size: 4 * 1024,
            fast_scan: true,
        }
    }
}

impl CalibrationConfig {
    /// Largest test block
    pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0
            || self.block_size % 4 != 0
            || self.block_size > Self::MAX_BLOCK_SIZE
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// A selected operating point
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub timing: TimingScan,
    /// Transmit delays whose receive window was accepted
    pub tx_mask: u32,
    /// Passing receive delays at the chosen transmit delay
    pub rx_mask: u32,
}

impl Candidate {
    /// Width of the receive window the candidate sits in
    pub fn window_len(&self) -> u32 {
        count_consecutive_ones(self.rx_mask)
    }

    /// Delays are in range and the selected point itself passed
    pub fn is_valid(&self) -> bool {
        delays_in_range(&self.timing) && self.rx_mask & (1 << self.timing.rx_dqs_delay) != 0
    }
}

/// Something a timing point can be tried against
pub trait TimingProbe {
    /// Program `timing` into the controller
    fn apply(&mut self, timing: &TimingScan) -> Result<(), Error>;
    /// Write and read back the test block at `offset`; true when it matched
    fn check(&mut self, offset: u32) -> Result<bool, Error>;
}

/// Fine delays are 5-bit fields
pub(crate) fn delays_in_range(timing: &TimingScan) -> bool {
    usize::from(timing.tx_dqs_delay) < DELAY_STEPS && usize::from(timing.rx_dqs_delay) < DELAY_STEPS
}

fn axis(scanned: bool, current: u8, full: RangeInclusive<u8>) -> RangeInclusive<u8> {
    if scanned {
        full
    } else {
        current..=current
    }
}

fn block_offset(timing: &TimingScan, block_size: u32) -> Result<u32, Error> {
    let coarse = u32::from(timing.tx_neg)
        + u32::from(timing.rx_neg)
        + u32::from(timing.rx_cap)
        + u32::from(timing.turnaround);
    let fine = (u32::from(timing.tx_dqs_delay) + u32::from(timing.rx_dqs_delay)) * 2;
    coarse
        .checked_mul(block_size)
        .and_then(|base| base.checked_add(fine))
        .ok_or(Error::InvalidArgument)
}

/// Sweep every point of the delay grid for one coarse setting and collect
/// a receive mask per transmit delay
fn scan_delay_grid<P: TimingProbe>(
    probe: &mut P,
    coarse: TimingScan,
    config: &CalibrationConfig,
) -> Result<[u32; DELAY_STEPS], Error> {
    let mut rx_masks = [0u32; DELAY_STEPS];
    let last = (DELAY_STEPS - 1) as u8;
    for tx in axis(config.axes.tx_delay, coarse.tx_dqs_delay, 0..=last) {
        for rx in axis(config.axes.rx_delay, coarse.rx_dqs_delay, 0..=last) {
            let point = TimingScan {
                tx_dqs_delay: tx,
                rx_dqs_delay: rx,
                ..coarse
            };
            probe.apply(&point)?;
            if probe.check(block_offset(&point, config.block_size)?)? {
                rx_masks[usize::from(tx)] |= 1 << rx;
            }
        }
        trace!(
            "tx delay {}: rx mask {:#010x}, window {}",
            tx,
            rx_masks[usize::from(tx)],
            count_consecutive_ones(rx_masks[usize::from(tx)])
        );
    }
    Ok(rx_masks)
}

/// Pick the delays for one coarse setting, if any transmit delay has an
/// acceptable receive window
fn aggregate(
    coarse: TimingScan,
    rx_masks: &[u32; DELAY_STEPS],
    config: &CalibrationConfig,
) -> Option<Candidate> {
    let mut tx_mask = 0u32;
    for (tx, &rx_mask) in rx_masks.iter().enumerate() {
        let accepted = if config.axes.rx_delay {
            count_consecutive_ones(rx_mask) >= config.min_acceptance_len
        } else {
            rx_mask != 0
        };
        if accepted {
            tx_mask |= 1 << tx;
        }
    }
    if tx_mask == 0 {
        return None;
    }

    let tx = if config.axes.tx_delay {
        find_mid_point(tx_mask)?
    } else {
        coarse.tx_dqs_delay
    };
    let rx_mask = rx_masks[usize::from(tx)];
    let rx = if config.axes.rx_delay {
        find_mid_point(rx_mask)?
    } else {
        coarse.rx_dqs_delay
    };
    Some(Candidate {
        timing: TimingScan {
            tx_dqs_delay: tx,
            rx_dqs_delay: rx,
            ..coarse
        },
        tx_mask,
        rx_mask,
    })
}

/// Search for a working operating point starting from `base`.
///
/// Coarse settings are tried in order and the first one with an acceptable
/// window is selected. The probe is left at the last point tried; callers
/// apply the result themselves.
pub fn scan<P: TimingProbe>(
    probe: &mut P,
    base: TimingScan,
    config: &CalibrationConfig,
) -> Result<Candidate, Error> {
    config.validate()?;
    if !delays_in_range(&base) {
        return Err(Error::InvalidArgument);
    }
    let axes = &config.axes;

    for tx_neg in axis(axes.tx_neg, base.tx_neg as u8, 0..=1) {
        for rx_neg in axis(axes.rx_neg, base.rx_neg as u8, 0..=1) {
            for rx_cap in axis(axes.rx_cap, base.rx_cap as u8, 0..=1) {
                let turnarounds = axis(
                    axes.turnaround,
                    base.turnaround,
                    base.turnaround..=base.turnaround.saturating_add(1),
                );
                for turnaround in turnarounds {
                    let coarse = TimingScan {
                        tx_neg: tx_neg != 0,
                        rx_neg: rx_neg != 0,
                        rx_cap: rx_cap != 0,
                        turnaround,
                        ..base
                    };
                    debug!(
                        "scan tx_neg={} rx_neg={} rx_cap={} turnaround={}",
                        coarse.tx_neg, coarse.rx_neg, coarse.rx_cap, coarse.turnaround
                    );
                    let rx_masks = scan_delay_grid(probe, coarse, config)?;
                    if let Some(candidate) = aggregate(coarse, &rx_masks, config) {
                        info!(
                            "selected timing {:?}, rx window {}",
                            candidate.timing,
                            candidate.window_len()
                        );
                        return Ok(candidate);
                    }
                }
            }
        }
    }
    warn!("timing scan found no window");
    Err(Error::NoTimingWindowFound)
}

/// Runs checks through the controller's memory mapped window
pub(crate) struct XipProbe<'a, M> {
    pub(crate) mspi: &'a mut M,
    pub(crate) base_address: u32,
    pub(crate) block_size: u32,
}

impl<'d, 'a, M> TimingProbe for XipProbe<'a, M>
where
    M: Mspi<'d>,
{
    fn apply(&mut self, timing: &TimingScan) -> Result<(), Error> {
        self.mspi
            .control(Request::TimingScan(timing))
            .map_err(bus_error("timing scan"))
    }

    fn check(&mut self, offset: u32) -> Result<bool, Error> {
        let mut tx = [0u8; CHECK_CHUNK];
        let mut rx = [0u8; CHECK_CHUNK];
        let start = self.base_address.wrapping_add(offset);
        let mut done = 0u32;
        let mut index = 0;
        while done < self.block_size {
            let len = (self.block_size - done).min(CHECK_CHUNK as u32) as usize;
            let address = start.wrapping_add(done);
            Pattern::from_index(index).fill(&mut tx[..len])?;
            self.mspi
                .xip_write(address, &tx[..len])
                .map_err(bus_error("xip write"))?;
            self.mspi
                .xip_read(address, &mut rx[..len])
                .map_err(bus_error("xip read"))?;
            if tx[..len] != rx[..len] {
                trace!("mismatch at {:#010x}", address);
                return Ok(false);
            }
            done += len as u32;
            index += 1;
        }
        Ok(true)
    }
}
