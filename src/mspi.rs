//! The multi-lane SPI controller seen from the PSRAM driver.
//!
//! The controller driver owns the electrical transactions and the interrupt
//! handler. The PSRAM driver only needs the operations below.

use crate::completion::Completion;

/// Number of controller instances (bus modules) on the host.
pub const MAX_MODULES: usize = 4;

/// Controller interrupt sources the driver enables.
pub mod interrupt {
    /// Command queue update
    pub const CQ_UPDATE: u32 = 1 << 0;
    /// Transfer error
    pub const ERROR: u32 = 1 << 1;
    /// Every source
    pub const ALL: u32 = 0xFFFF_FFFF;
}

/// Device wiring as seen by the controller
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceConfig {
    /// 8 data lanes, DDR, chip select 0
    OctalDdrCe0,
    /// 8 data lanes, DDR, chip select 1
    OctalDdrCe1,
    /// 16 data lanes, DDR, chip select 0
    HexDdrCe0,
    /// 16 data lanes, DDR, chip select 1
    HexDdrCe1,
}

impl DeviceConfig {
    /// True for the 16 lane variants
    pub fn is_hex(self) -> bool {
        matches!(self, DeviceConfig::HexDdrCe0 | DeviceConfig::HexDdrCe1)
    }

    /// The 8 lane variant on the same chip select
    pub fn octal(self) -> Self {
        match self {
            DeviceConfig::OctalDdrCe0 | DeviceConfig::HexDdrCe0 => DeviceConfig::OctalDdrCe0,
            DeviceConfig::OctalDdrCe1 | DeviceConfig::HexDdrCe1 => DeviceConfig::OctalDdrCe1,
        }
    }

    /// The 16 lane variant on the same chip select
    pub fn hex(self) -> Self {
        match self {
            DeviceConfig::OctalDdrCe0 | DeviceConfig::HexDdrCe0 => DeviceConfig::HexDdrCe0,
            DeviceConfig::OctalDdrCe1 | DeviceConfig::HexDdrCe1 => DeviceConfig::HexDdrCe1,
        }
    }
}

/// Controller interface clock
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockFreq {
    Mhz6,
    Mhz12,
    Mhz24,
    Mhz48,
    Mhz96,
    Mhz125,
    Mhz192,
    Mhz250,
}

impl ClockFreq {
    /// Clocks at which the receive path samples one cycle later
    pub fn is_high_speed(self) -> bool {
        matches!(
            self,
            ClockFreq::Mhz96 | ClockFreq::Mhz125 | ClockFreq::Mhz192 | ClockFreq::Mhz250
        )
    }
}

/// Controller power states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Wake,
    DeepSleep,
}

/// Per-device protocol setting programmed into the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSetting {
    pub device: DeviceConfig,
    pub clock: ClockFreq,
    pub read_instr: u16,
    pub write_instr: u16,
    /// Turnaround cycles between address and data on reads
    pub turnaround: u8,
    /// Write latency in controller cycles
    pub write_latency: u8,
    pub enable_write_latency: bool,
    pub emulate_ddr: bool,
    /// DMA time slice limit
    pub dma_time_limit: u16,
    /// DMA transfers break at 1 KiB boundaries
    pub dma_break_1k: bool,
}

/// Read/write aperture of the memory mapped window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApertureMode {
    ReadOnly,
    ReadWrite,
}

/// Memory mapped (XIP) window configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XipConfig {
    pub base_address: u32,
    pub mode: ApertureMode,
    pub size_mib: u32,
    pub scrambling_start: u32,
    pub scrambling_end: u32,
}

/// Memory mapped window base of each controller instance
pub const APERTURE_BASE: [u32; MAX_MODULES] = [0x6000_0000, 0x8000_0000, 0xA000_0000, 0xC000_0000];

impl XipConfig {
    /// 64 MiB read/write window for `module`
    pub fn for_module(module: usize) -> Option<Self> {
        APERTURE_BASE.get(module).map(|&base_address| XipConfig {
            base_address,
            mode: ApertureMode::ReadWrite,
            size_mib: 64,
            scrambling_start: 0,
            scrambling_end: 0,
        })
    }
}

/// Miscellaneous XIP knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XipMisc {
    pub ce_break: u32,
    pub boundary: bool,
    pub odd: bool,
    pub append_odd: bool,
    pub byte_enable: bool,
}

impl Default for XipMisc {
    fn default() -> Self {
        XipMisc {
            ce_break: 10,
            boundary: true,
            odd: true,
            append_odd: false,
            byte_enable: false,
        }
    }
}

/// Data strobe configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DqsConfig {
    pub enable: bool,
    pub sync_neg: bool,
    pub fine_delay: bool,
    pub tx_delay: u8,
    pub rx_delay: u8,
}

impl Default for DqsConfig {
    fn default() -> Self {
        DqsConfig {
            enable: true,
            sync_neg: false,
            fine_delay: false,
            tx_delay: 0,
            rx_delay: 16,
        }
    }
}

/// Receive path configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxConfig {
    pub dqs_turn: u8,
    pub ta_forth: bool,
    pub rx_sample: u8,
    /// Read row boundary crossing
    pub rbx: bool,
    /// Write row boundary crossing
    pub wbx: bool,
    pub sf_turn: u8,
}

impl Default for RxConfig {
    fn default() -> Self {
        RxConfig {
            dqs_turn: 2,
            ta_forth: true,
            rx_sample: 1,
            rbx: false,
            wbx: false,
            sf_turn: 10,
        }
    }
}

/// One point of the electrical timing space
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingScan {
    /// Transmit on the negative clock edge
    pub tx_neg: bool,
    /// Receive on the negative clock edge
    pub rx_neg: bool,
    /// Receive capture edge
    pub rx_cap: bool,
    pub turnaround: u8,
    /// Transmit data strobe fine delay (0..=31)
    pub tx_dqs_delay: u8,
    /// Receive data strobe fine delay (0..=31)
    pub rx_dqs_delay: u8,
}

impl Default for TimingScan {
    fn default() -> Self {
        TimingScan {
            tx_neg: true,
            rx_neg: false,
            rx_cap: false,
            turnaround: 6,
            tx_dqs_delay: 0,
            rx_dqs_delay: 0,
        }
    }
}

/// Data direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    Rx,
    /// Host to device
    Tx,
}

/// Payload of an in-line (programmed I/O) transfer
#[derive(Debug)]
pub enum PioData<'a> {
    Tx(&'a [u8]),
    Rx(&'a mut [u8]),
}

/// An in-line command/response exchange
#[derive(Debug)]
pub struct PioTransfer<'a> {
    pub instr: u16,
    pub send_addr: bool,
    pub address: u32,
    pub turnaround: bool,
    pub enable_write_latency: bool,
    pub scrambling: bool,
    pub data: PioData<'a>,
}

/// A single hardware DMA unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub direction: Direction,
    pub device_address: u32,
    /// Host memory address of the first byte
    pub host_address: usize,
    pub count: u32,
    /// Command queue pause condition gating this transfer
    pub pause_condition: u32,
    /// Command queue status bits set/cleared once this transfer is done
    pub status_set_clr: u32,
    pub priority: u8,
}

/// Out-of-band controller requests
#[derive(Debug)]
pub enum Request<'a> {
    TimingScan(&'a TimingScan),
    Dqs(&'a DqsConfig),
    RxConfig(&'a RxConfig),
    DdrEnable,
    XipConfig(&'a XipConfig),
    XipMisc(&'a XipMisc),
    XipEnable,
    XipDisable,
    ScramblingEnable,
    ScramblingDisable,
}

/// Multi-lane SPI controller driver.
///
/// `'d` bounds the completions the controller resolves from its interrupt
/// handler and the command queue scratch buffer it is handed.
pub trait Mspi<'d> {
    type Error: core::fmt::Debug;

    fn initialize(&mut self, module: usize) -> Result<(), Self::Error>;
    fn deinitialize(&mut self) -> Result<(), Self::Error>;
    fn power_control(&mut self, state: PowerState, retain: bool) -> Result<(), Self::Error>;
    /// Hand over the command queue scratch buffer
    fn configure(&mut self, txn_buffer: &'d mut [u32]) -> Result<(), Self::Error>;
    /// Program the device protocol. Also routes the pins for `setting.device`.
    fn device_configure(&mut self, setting: &DeviceSetting) -> Result<(), Self::Error>;
    fn enable(&mut self) -> Result<(), Self::Error>;
    fn disable(&mut self) -> Result<(), Self::Error>;

    fn blocking_transfer(&mut self, txn: PioTransfer<'_>, timeout_us: u32) -> Result<(), Self::Error>;
    /// Queue a DMA transfer; `done` is resolved from interrupt context.
    fn nonblocking_transfer(
        &mut self,
        desc: &TransferDescriptor,
        done: Option<&'d Completion>,
    ) -> Result<(), Self::Error>;
    /// Queue a DMA transfer ahead of the normal queue.
    fn highprio_transfer(
        &mut self,
        desc: &TransferDescriptor,
        done: Option<&'d Completion>,
    ) -> Result<(), Self::Error>;

    fn control(&mut self, request: Request<'_>) -> Result<(), Self::Error>;
    fn timing_scan_get(&mut self) -> Result<TimingScan, Self::Error>;

    fn interrupt_enable(&mut self, mask: u32) -> Result<(), Self::Error>;
    fn interrupt_disable(&mut self, mask: u32) -> Result<(), Self::Error>;
    fn interrupt_clear(&mut self, mask: u32) -> Result<(), Self::Error>;
    fn interrupt_status(&mut self) -> Result<u32, Self::Error>;

    /// Store `data` through the memory mapped window and flush the write buffer
    fn xip_write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error>;
    /// Load from the memory mapped window
    fn xip_read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
}
