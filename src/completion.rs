//! Single-shot transfer completion.
//!
//! The controller resolves a `Completion` from its interrupt handler. The
//! owner can poll it, wait on it asynchronously, spin on it with a bounded
//! delay loop, or attach a continuation.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use hal::blocking::delay::DelayUs;

use crate::Error;

/// Outcome of a hardware transfer
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failure,
}

#[derive(Clone, Copy)]
struct State {
    status: Option<TransferStatus>,
    continuation: Option<fn(TransferStatus)>,
}

const IDLE: State = State {
    status: None,
    continuation: None,
};

/// Resolved at most once per arming
pub struct Completion {
    state: Mutex<CriticalSectionRawMutex, Cell<State>>,
    signal: Signal<CriticalSectionRawMutex, TransferStatus>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub const fn new() -> Self {
        Completion {
            state: Mutex::new(Cell::new(IDLE)),
            signal: Signal::new(),
        }
    }

    /// Forget any previous outcome and continuation
    pub fn arm(&self) {
        self.state.lock(|s| s.set(IDLE));
        self.signal.reset();
    }

    /// Record the outcome. Returns false if it was already resolved.
    pub fn resolve(&self, status: TransferStatus) -> bool {
        let continuation = self.state.lock(|s| {
            let mut state = s.get();
            if state.status.is_some() {
                return Err(());
            }
            state.status = Some(status);
            let continuation = state.continuation.take();
            s.set(state);
            Ok(continuation)
        });
        match continuation {
            Err(()) => false,
            Ok(continuation) => {
                self.signal.signal(status);
                if let Some(f) = continuation {
                    f(status);
                }
                true
            }
        }
    }

    /// Outcome, if resolved
    pub fn status(&self) -> Option<TransferStatus> {
        self.state.lock(|s| s.get().status)
    }

    pub fn is_resolved(&self) -> bool {
        self.status().is_some()
    }

    /// Run `f` once resolved (immediately if that already happened)
    pub fn on_complete(&self, f: fn(TransferStatus)) {
        let resolved = self.state.lock(|s| {
            let mut state = s.get();
            if state.status.is_none() {
                state.continuation = Some(f);
                s.set(state);
            }
            state.status
        });
        if let Some(status) = resolved {
            f(status);
        }
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> TransferStatus {
        if let Some(status) = self.status() {
            return status;
        }
        self.signal.wait().await
    }

    /// Spin until resolved, sleeping 1 us between polls, for at most
    /// `timeout_us` polls
    pub fn wait_blocking<D: DelayUs<u32>>(
        &self,
        delay: &mut D,
        timeout_us: u32,
    ) -> Result<TransferStatus, Error> {
        for _ in 0..timeout_us {
            if let Some(status) = self.status() {
                return Ok(status);
            }
            delay.delay_us(1);
        }
        self.status().ok_or(Error::TransferTimeout)
    }
}
