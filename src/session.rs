//! The open connection to one controller instance.
//!
//! Register traffic and bring-up commands are single in-line exchanges;
//! bulk data goes through DMA in `transfer`.

use log::{debug, warn};

use crate::mspi::{DeviceSetting, Mspi, PioData, PioTransfer, Request, TimingScan};
use crate::registers::ModeRegister;
use crate::{Error, Instruction};

/// Timeout handed to the controller for in-line exchanges and used as the
/// polling bound for DMA completions, in microseconds
pub const TIMEOUT_US: u32 = 1_000_000;

pub(crate) fn bus_error<E: core::fmt::Debug>(context: &'static str) -> impl FnOnce(E) -> Error {
    move |e| {
        warn!("{}: {:?}", context, e);
        Error::BusTransactionFailed
    }
}

pub struct Session<M> {
    pub(crate) mspi: M,
}

impl<'d, M> Session<M>
where
    M: Mspi<'d>,
{
    pub(crate) fn new(mspi: M) -> Self {
        Session { mspi }
    }

    /// Send `instr` followed by `data`
    pub fn command_write(&mut self, instr: u16, address: u32, data: &[u8]) -> Result<(), Error> {
        let txn = PioTransfer {
            instr,
            send_addr: true,
            address,
            turnaround: false,
            enable_write_latency: false,
            scrambling: false,
            data: PioData::Tx(data),
        };
        self.mspi
            .blocking_transfer(txn, TIMEOUT_US)
            .map_err(bus_error("command write"))
    }

    /// Send `instr` and clock the response into `buf`
    pub fn command_read(&mut self, instr: u16, address: u32, buf: &mut [u8]) -> Result<(), Error> {
        let txn = PioTransfer {
            instr,
            send_addr: true,
            address,
            turnaround: true,
            enable_write_latency: true,
            scrambling: false,
            data: PioData::Rx(buf),
        };
        self.mspi
            .blocking_transfer(txn, TIMEOUT_US)
            .map_err(bus_error("command read"))
    }

    /// Raw 32-bit response of a register read. The low byte is `reg`; reads
    /// of MR2 also return MR3 in the next byte.
    pub fn read_register_raw(&mut self, reg: ModeRegister) -> Result<u32, Error> {
        let mut raw = [0u8; 4];
        self.command_read(Instruction::ReadRegister as u16, reg as u32, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_register(&mut self, reg: ModeRegister) -> Result<u8, Error> {
        let value = self.read_register_raw(reg)? as u8;
        debug!("MR{} = {:#04x}", reg as u8, value);
        Ok(value)
    }

    pub fn write_register(&mut self, reg: ModeRegister, value: u8) -> Result<(), Error> {
        let raw = u32::from(value).to_le_bytes();
        self.command_write(Instruction::WriteRegister as u16, reg as u32, &raw)?;
        debug!("MR{} <- {:#04x}", reg as u8, value);
        Ok(())
    }

    /// Program `setting` without touching the enable state
    pub fn configure(&mut self, setting: &DeviceSetting) -> Result<(), Error> {
        self.mspi
            .device_configure(setting)
            .map_err(bus_error("device configure"))
    }

    /// Disable, program `setting`, re-enable
    pub fn reconfigure(&mut self, setting: &DeviceSetting) -> Result<(), Error> {
        self.disable()?;
        self.configure(setting)?;
        self.enable()
    }

    pub fn enable(&mut self) -> Result<(), Error> {
        self.mspi.enable().map_err(bus_error("enable"))
    }

    pub fn disable(&mut self) -> Result<(), Error> {
        self.mspi.disable().map_err(bus_error("disable"))
    }

    pub fn control(&mut self, request: Request<'_>, context: &'static str) -> Result<(), Error> {
        self.mspi.control(request).map_err(bus_error(context))
    }

    /// Timing currently programmed into the controller
    pub fn timing_scan(&mut self) -> Result<TimingScan, Error> {
        self.mspi
            .timing_scan_get()
            .map_err(bus_error("timing scan get"))
    }
}
