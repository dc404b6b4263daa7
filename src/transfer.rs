//! Segmented DMA transfers.
//!
//! The controller cannot carry a transfer across a device page boundary
//! when the start address is not word aligned. Such requests are split so
//! that the first piece ends on the next word boundary.

use hal::blocking::delay::DelayUs;

use crate::completion::{Completion, TransferStatus};
use crate::mspi::{Direction, Mspi, TransferDescriptor};
use crate::session::{bus_error, Session};
use crate::Error;

/// Device page size in bytes
pub const PAGE_SIZE: u32 = 1024;

/// Queue a transfer ahead of the normal queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

/// One hardware-legal piece of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    /// Offset into the caller's buffer
    pub offset: u32,
    pub len: u32,
    pub first: bool,
    pub last: bool,
}

/// Splits `[address, address + len)` into hardware-legal pieces, in address order
#[derive(Debug, Clone)]
pub struct Segments {
    address: u32,
    offset: u32,
    remaining: u32,
}

/// Pieces of `[address, address + len)`
pub fn segments(address: u32, len: u32) -> Segments {
    Segments {
        address,
        offset: 0,
        remaining: len,
    }
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }
        let misaligned = self.address & 0x3;
        let to_page_end = PAGE_SIZE - (self.address & (PAGE_SIZE - 1));
        let len = if misaligned != 0 && to_page_end < self.remaining {
            4 - misaligned
        } else {
            self.remaining
        };
        let segment = Segment {
            address: self.address,
            offset: self.offset,
            len,
            first: self.offset == 0,
            last: len == self.remaining,
        };
        self.address = self.address.wrapping_add(len);
        self.offset += len;
        self.remaining -= len;
        Some(segment)
    }
}

/// What the caller wants around a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Conditions {
    /// Gates the first piece
    pub pause: u32,
    /// Applied after the last piece
    pub status_set_clr: u32,
}

impl<'d, M> Session<M>
where
    M: Mspi<'d>,
{
    /// Queue every piece of a request. Only the last piece carries the
    /// post-condition and `done`; pieces are queued in address order and
    /// queuing stops at the first refusal.
    pub(crate) fn queue(
        &mut self,
        direction: Direction,
        priority: Priority,
        host_address: usize,
        address: u32,
        len: u32,
        conditions: Conditions,
        done: Option<&'d Completion>,
    ) -> Result<(), Error> {
        for segment in segments(address, len) {
            let desc = TransferDescriptor {
                direction,
                device_address: segment.address,
                host_address: host_address + segment.offset as usize,
                count: segment.len,
                pause_condition: if segment.first { conditions.pause } else { 0 },
                status_set_clr: if segment.last {
                    conditions.status_set_clr
                } else {
                    0
                },
                priority: 1,
            };
            let done = if segment.last { done } else { None };
            match priority {
                Priority::Normal => self.mspi.nonblocking_transfer(&desc, done),
                Priority::High => self.mspi.highprio_transfer(&desc, done),
            }
            .map_err(bus_error("queue transfer"))?;
        }
        Ok(())
    }
}

/// Length of a caller buffer as a transfer count
pub(crate) fn transfer_len(len: usize) -> Result<u32, Error> {
    if len == 0 {
        return Err(Error::InvalidArgument);
    }
    u32::try_from(len).map_err(|_| Error::InvalidArgument)
}

/// Wait on a synchronous request's completion
pub(crate) fn finish<D: DelayUs<u32>>(
    done: &Completion,
    delay: &mut D,
    timeout_us: u32,
) -> Result<(), Error> {
    match done.wait_blocking(delay, timeout_us)? {
        TransferStatus::Success => Ok(()),
        TransferStatus::Failure => Err(Error::BusTransactionFailed),
    }
}

/// A queued request.
///
/// Holds the host buffer until the request has completed. Dropping it early
/// releases the borrow while the hardware may still be using the memory.
#[must_use]
pub struct Transfer<'d, B> {
    buffer: B,
    done: &'d Completion,
}

impl<'d, B> Transfer<'d, B> {
    pub(crate) fn new(buffer: B, done: &'d Completion) -> Self {
        Transfer { buffer, done }
    }

    /// Outcome, if the request has finished
    pub fn poll(&self) -> Option<TransferStatus> {
        self.done.status()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_resolved()
    }

    /// Run `f` with the outcome once the request finishes
    pub fn on_complete(&self, f: fn(TransferStatus)) {
        self.done.on_complete(f)
    }

    /// Spin until finished and hand the buffer back
    pub fn wait_blocking<D: DelayUs<u32>>(self, delay: &mut D, timeout_us: u32) -> Result<B, Error> {
        finish(self.done, delay, timeout_us)?;
        Ok(self.buffer)
    }

    /// Wait until finished and hand the buffer back
    pub async fn wait(self) -> Result<B, Error> {
        match self.done.wait().await {
            TransferStatus::Success => Ok(self.buffer),
            TransferStatus::Failure => Err(Error::BusTransactionFailed),
        }
    }
}
