//! Ownership of controller instances.
//!
//! A module can be driven by one `Psram` at a time. Claiming it yields a
//! lease that releases the module when dropped. The registry also keeps the
//! last calibration result of every module for the lifetime of the program.

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;
use log::{debug, warn};

use crate::completion::Completion;
use crate::mspi::MAX_MODULES;
use crate::timing::Candidate;
use crate::Error;

/// Module ownership and per-module shared state
pub struct PsramRegistry {
    claimed: Mutex<CriticalSectionRawMutex, RefCell<Vec<u8, MAX_MODULES>>>,
    timing: Mutex<CriticalSectionRawMutex, Cell<[Option<Candidate>; MAX_MODULES]>>,
    completions: [Completion; MAX_MODULES],
}

impl Default for PsramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const IDLE: Completion = Completion::new();

impl PsramRegistry {
    pub const fn new() -> Self {
        PsramRegistry {
            claimed: Mutex::new(RefCell::new(Vec::new())),
            timing: Mutex::new(Cell::new([None; MAX_MODULES])),
            completions: [IDLE; MAX_MODULES],
        }
    }

    /// Take ownership of `module`
    pub fn claim(&self, module: usize) -> Result<ModuleLease<'_>, Error> {
        if module >= MAX_MODULES {
            return Err(Error::InvalidArgument);
        }
        self.claimed.lock(|claimed| {
            let mut claimed = claimed.borrow_mut();
            if claimed.contains(&(module as u8)) {
                warn!("module {} already in use", module);
                return Err(Error::AlreadyOccupied);
            }
            claimed
                .push(module as u8)
                .map_err(|_| Error::AlreadyOccupied)
        })?;
        debug!("module {} claimed", module);
        Ok(ModuleLease {
            registry: self,
            module,
        })
    }

    pub fn is_claimed(&self, module: usize) -> bool {
        self.claimed
            .lock(|claimed| claimed.borrow().contains(&(module as u8)))
    }

    /// Last calibration result of `module`
    pub fn cached_timing(&self, module: usize) -> Option<Candidate> {
        self.timing
            .lock(|timing| timing.get().get(module).copied().flatten())
    }

    /// Drop the calibration result of `module` so the next check scans again
    pub fn forget_timing(&self, module: usize) {
        self.store(module, None);
    }

    fn store(&self, module: usize, value: Option<Candidate>) {
        self.timing.lock(|timing| {
            let mut all = timing.get();
            if let Some(slot) = all.get_mut(module) {
                *slot = value;
            }
            timing.set(all);
        });
    }

    fn release(&self, module: usize) {
        self.claimed.lock(|claimed| {
            claimed.borrow_mut().retain(|&m| usize::from(m) != module);
        });
        debug!("module {} released", module);
    }
}

/// Exclusive use of one module
pub struct ModuleLease<'d> {
    registry: &'d PsramRegistry,
    module: usize,
}

impl<'d> ModuleLease<'d> {
    pub fn module(&self) -> usize {
        self.module
    }

    /// Completion used for this module's synchronous transfers
    pub fn completion(&self) -> &'d Completion {
        &self.registry.completions[self.module]
    }

    pub fn cached_timing(&self) -> Option<Candidate> {
        self.registry.cached_timing(self.module)
    }

    pub fn store_timing(&self, timing: Candidate) {
        self.registry.store(self.module, Some(timing));
    }
}

impl Drop for ModuleLease<'_> {
    fn drop(&mut self) {
        self.registry.release(self.module);
    }
}

impl core::fmt::Debug for ModuleLease<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleLease")
            .field("module", &self.module)
            .finish()
    }
}
