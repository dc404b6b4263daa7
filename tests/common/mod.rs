//! Simulated MSPI controller with an APMemory PSRAM behind it.

#![allow(dead_code)]

use std::cell::Cell;
use std::convert::Infallible;
use std::ops::RangeInclusive;
use std::rc::Rc;

use embedded_hal::digital::v2::OutputPin;

use aps25616::mspi::{
    DeviceSetting, Direction, Mspi, PioData, PioTransfer, PowerState, Request, TransferDescriptor,
};
use aps25616::{
    ClockFreq, Completion, DeviceConfig, DqsConfig, PsramConfig, RxConfig, TimingScan,
    TransferStatus, XipConfig,
};

pub const MEMORY_SIZE: usize = 1024 * 1024;

const READ_REGISTER: u16 = 0x4040;
const WRITE_REGISTER: u16 = 0xC0C0;
const GLOBAL_RESET: u16 = 0xFFFF;
const DUMMY: u16 = 0x0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    NotInitialized,
    NotEnabled,
    HalfSleep,
    LaneMismatch,
    OutOfRange,
    XipDisabled,
    Refused,
    UnknownInstruction(u16),
}

/// Which queue a descriptor went to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Normal,
    High,
}

/// CE line into the simulated part. A low then high edge wakes it from
/// half sleep.
#[derive(Clone)]
pub struct ChipSelect {
    low: Rc<Cell<bool>>,
    pulses: Rc<Cell<u32>>,
}

impl ChipSelect {
    pub fn pulses(&self) -> u32 {
        self.pulses.get()
    }
}

impl OutputPin for ChipSelect {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.low.set(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        if self.low.replace(false) {
            self.pulses.set(self.pulses.get() + 1);
        }
        Ok(())
    }
}

/// Mode registers and memory of the simulated part
pub struct Device {
    /// Indexed by register number
    pub mr: [u8; 9],
    pub memory: Vec<u8>,
    pub half_sleep: bool,
}

impl Device {
    pub fn aps25616() -> Self {
        Self::with_identity(0x8D, 0b1100_1111, 0x80)
    }

    pub fn aps51216() -> Self {
        Self::with_identity(0x8D, 0b1100_1110, 0x80)
    }

    pub fn with_identity(mr1: u8, mr2: u8, mr3: u8) -> Self {
        let mut device = Device {
            mr: [0; 9],
            memory: vec![0; MEMORY_SIZE],
            half_sleep: false,
        };
        device.mr[1] = mr1;
        device.mr[2] = mr2;
        device.mr[3] = mr3;
        device.power_up();
        device
    }

    fn power_up(&mut self) {
        self.mr[0] = 0x09;
        self.mr[4] = 0xC0;
        self.mr[6] = 0x00;
        self.mr[8] = 0x05;
        self.half_sleep = false;
    }

    pub fn is_hex(&self) -> bool {
        self.mr[8] & 0x40 != 0
    }
}

pub struct MockMspi<'d> {
    pub device: Device,
    pub module: Option<usize>,
    pub enabled: bool,
    pub power: Option<PowerState>,
    pub txn_buffer_len: usize,
    pub setting: Option<DeviceSetting>,
    pub xip: Option<XipConfig>,
    pub xip_enabled: bool,
    pub scrambling: bool,
    pub ddr: bool,
    pub dqs: Option<DqsConfig>,
    pub rx: Option<RxConfig>,
    pub timing: TimingScan,
    /// Timing requests seen
    pub timing_applies: usize,
    /// Delays at which the memory mapped window carries data intact
    pub window: Option<(RangeInclusive<u8>, RangeInclusive<u8>)>,
    pub interrupts: u32,
    /// Instruction and address of every in-line exchange
    pub commands: Vec<(u16, u32)>,
    pub descriptors: Vec<(Queue, TransferDescriptor)>,
    /// Hold completions until `service_interrupt`
    pub defer: bool,
    pending: Vec<&'d Completion>,
    /// Accept this many more descriptors, then refuse
    pub refuse_after: Option<usize>,
    /// Fail this many more mode register writes from now, then succeed
    pub fail_register_write: Option<usize>,
    ce: ChipSelect,
    ce_seen: u32,
}

impl<'d> MockMspi<'d> {
    pub fn new(device: Device) -> Self {
        MockMspi {
            device,
            module: None,
            enabled: false,
            power: None,
            txn_buffer_len: 0,
            setting: None,
            xip: None,
            xip_enabled: false,
            scrambling: false,
            ddr: false,
            dqs: None,
            rx: None,
            timing: TimingScan {
                rx_dqs_delay: 16,
                ..TimingScan::default()
            },
            timing_applies: 0,
            window: Some((4..=24, 8..=20)),
            interrupts: 0,
            commands: Vec::new(),
            descriptors: Vec::new(),
            defer: false,
            pending: Vec::new(),
            refuse_after: None,
            fail_register_write: None,
            ce: ChipSelect {
                low: Rc::new(Cell::new(false)),
                pulses: Rc::new(Cell::new(0)),
            },
            ce_seen: 0,
        }
    }

    /// The CE pin wired to this device
    pub fn chip_select(&self) -> ChipSelect {
        self.ce.clone()
    }

    /// Latch CE pulses since the last bus activity
    fn sample_ce(&mut self) {
        let pulses = self.ce.pulses();
        if pulses != self.ce_seen {
            self.ce_seen = pulses;
            self.device.half_sleep = false;
        }
    }

    /// Resolve every held completion
    pub fn service_interrupt(&mut self) {
        for done in self.pending.drain(..) {
            done.resolve(TransferStatus::Success);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn lanes_hex(&self) -> bool {
        self.setting.map_or(false, |s| s.device.is_hex())
    }

    fn ready(&self) -> Result<(), MockError> {
        if self.module.is_none() {
            return Err(MockError::NotInitialized);
        }
        if !self.enabled {
            return Err(MockError::NotEnabled);
        }
        Ok(())
    }

    fn timing_passes(&self) -> bool {
        match &self.window {
            Some((tx, rx)) => {
                tx.contains(&self.timing.tx_dqs_delay) && rx.contains(&self.timing.rx_dqs_delay)
            }
            None => false,
        }
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, MockError> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(MockError::OutOfRange)?;
        if end > self.device.memory.len() {
            return Err(MockError::OutOfRange);
        }
        Ok(start..end)
    }

    fn window_range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, MockError> {
        if !self.xip_enabled {
            return Err(MockError::XipDisabled);
        }
        let base = self.xip.ok_or(MockError::XipDisabled)?.base_address;
        let offset = address.checked_sub(base).ok_or(MockError::OutOfRange)?;
        self.range(offset, len)
    }

    fn queue(
        &mut self,
        queue: Queue,
        desc: &TransferDescriptor,
        done: Option<&'d Completion>,
    ) -> Result<(), MockError> {
        self.ready()?;
        self.sample_ce();
        if self.device.half_sleep {
            return Err(MockError::HalfSleep);
        }
        if self.device.is_hex() != self.lanes_hex() {
            return Err(MockError::LaneMismatch);
        }
        if let Some(left) = self.refuse_after.as_mut() {
            if *left == 0 {
                return Err(MockError::Refused);
            }
            *left -= 1;
        }
        let range = self.range(desc.device_address, desc.count as usize)?;
        let len = range.len();
        match desc.direction {
            Direction::Rx => {
                let host = desc.host_address as *mut u8;
                let host = unsafe { std::slice::from_raw_parts_mut(host, len) };
                host.copy_from_slice(&self.device.memory[range]);
            }
            Direction::Tx => {
                let host = desc.host_address as *const u8;
                let host = unsafe { std::slice::from_raw_parts(host, len) };
                self.device.memory[range].copy_from_slice(host);
            }
        }
        self.descriptors.push((queue, *desc));
        if let Some(done) = done {
            if self.defer {
                self.pending.push(done);
            } else {
                done.resolve(TransferStatus::Success);
            }
        }
        Ok(())
    }
}

impl<'d> Mspi<'d> for MockMspi<'d> {
    type Error = MockError;

    fn initialize(&mut self, module: usize) -> Result<(), MockError> {
        self.module = Some(module);
        Ok(())
    }

    fn deinitialize(&mut self) -> Result<(), MockError> {
        self.module = None;
        Ok(())
    }

    fn power_control(&mut self, state: PowerState, _retain: bool) -> Result<(), MockError> {
        self.power = Some(state);
        Ok(())
    }

    fn configure(&mut self, txn_buffer: &'d mut [u32]) -> Result<(), MockError> {
        self.txn_buffer_len = txn_buffer.len();
        Ok(())
    }

    fn device_configure(&mut self, setting: &DeviceSetting) -> Result<(), MockError> {
        if self.module.is_none() {
            return Err(MockError::NotInitialized);
        }
        self.setting = Some(*setting);
        Ok(())
    }

    fn enable(&mut self) -> Result<(), MockError> {
        self.enabled = true;
        Ok(())
    }

    fn disable(&mut self) -> Result<(), MockError> {
        self.enabled = false;
        Ok(())
    }

    fn blocking_transfer(&mut self, txn: PioTransfer<'_>, _timeout_us: u32) -> Result<(), MockError> {
        self.ready()?;
        self.sample_ce();
        self.commands.push((txn.instr, txn.address));
        if txn.instr == DUMMY {
            self.device.half_sleep = false;
            return Ok(());
        }
        if self.device.half_sleep {
            return Err(MockError::HalfSleep);
        }
        let reg = txn.address as usize;
        match (txn.instr, txn.data) {
            (READ_REGISTER, PioData::Rx(buf)) => {
                let value = *self.device.mr.get(reg).ok_or(MockError::OutOfRange)?;
                buf.fill(0);
                buf[0] = value;
                if reg == 2 && buf.len() > 1 {
                    buf[1] = self.device.mr[3];
                }
                Ok(())
            }
            (WRITE_REGISTER, PioData::Tx(data)) => {
                if let Some(left) = self.fail_register_write.as_mut() {
                    if *left > 0 {
                        *left -= 1;
                        return Err(MockError::Refused);
                    }
                }
                let slot = self.device.mr.get_mut(reg).ok_or(MockError::OutOfRange)?;
                *slot = data[0];
                if reg == 6 && data[0] == 0xF0 {
                    self.device.half_sleep = true;
                }
                Ok(())
            }
            (GLOBAL_RESET, PioData::Tx(_)) => {
                self.device.power_up();
                Ok(())
            }
            (instr, _) => Err(MockError::UnknownInstruction(instr)),
        }
    }

    fn nonblocking_transfer(
        &mut self,
        desc: &TransferDescriptor,
        done: Option<&'d Completion>,
    ) -> Result<(), MockError> {
        self.queue(Queue::Normal, desc, done)
    }

    fn highprio_transfer(
        &mut self,
        desc: &TransferDescriptor,
        done: Option<&'d Completion>,
    ) -> Result<(), MockError> {
        self.queue(Queue::High, desc, done)
    }

    fn control(&mut self, request: Request<'_>) -> Result<(), MockError> {
        if self.module.is_none() {
            return Err(MockError::NotInitialized);
        }
        match request {
            Request::TimingScan(timing) => {
                self.timing = *timing;
                self.timing_applies += 1;
            }
            Request::Dqs(dqs) => self.dqs = Some(*dqs),
            Request::RxConfig(rx) => self.rx = Some(*rx),
            Request::DdrEnable => self.ddr = true,
            Request::XipConfig(xip) => self.xip = Some(*xip),
            Request::XipMisc(_) => {}
            Request::XipEnable => self.xip_enabled = true,
            Request::XipDisable => self.xip_enabled = false,
            Request::ScramblingEnable => self.scrambling = true,
            Request::ScramblingDisable => self.scrambling = false,
        }
        Ok(())
    }

    fn timing_scan_get(&mut self) -> Result<TimingScan, MockError> {
        Ok(self.timing)
    }

    fn interrupt_enable(&mut self, mask: u32) -> Result<(), MockError> {
        self.interrupts |= mask;
        Ok(())
    }

    fn interrupt_disable(&mut self, mask: u32) -> Result<(), MockError> {
        self.interrupts &= !mask;
        Ok(())
    }

    fn interrupt_clear(&mut self, _mask: u32) -> Result<(), MockError> {
        Ok(())
    }

    fn interrupt_status(&mut self) -> Result<u32, MockError> {
        Ok(0)
    }

    fn xip_write(&mut self, address: u32, data: &[u8]) -> Result<(), MockError> {
        self.ready()?;
        self.sample_ce();
        let range = self.window_range(address, data.len())?;
        self.device.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn xip_read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), MockError> {
        self.ready()?;
        self.sample_ce();
        let range = self.window_range(address, buf.len())?;
        buf.copy_from_slice(&self.device.memory[range]);
        if !self.timing_passes() {
            for b in buf.iter_mut() {
                *b ^= 0xA5;
            }
        }
        Ok(())
    }
}

/// Octal at 250 MHz with a small calibration block
pub fn config(txn_buffer: &mut [u32]) -> PsramConfig<'_> {
    let mut config = PsramConfig::new(DeviceConfig::OctalDdrCe0, ClockFreq::Mhz250, txn_buffer);
    config.calibration.block_size = 512;
    config
}
