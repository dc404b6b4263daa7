/*!
This is a platform agnostic Rust driver for the [APMemory APS25616BA and APS51216BA](https://www.apmemory.com/products/psram-iot-ram/)
DDR octal/hex PSRAM chips behind a multi-lane SPI (MSPI) controller,
based on the [`embedded-hal`](https://github.com/rust-embedded/embedded-hal) traits.

The controller itself is abstracted by the [`mspi::Mspi`] trait: the driver
programs the device through it and moves data with its DMA engine and its
memory mapped (XIP) window.

This driver allows you to:

- Bring the device up at a target clock, selecting read/write latencies. See: `init()`.
- Read and write any address range, waiting or not. See: `read()`, `write()`, `read_nonblocking()`.
- Queue transfers behind command queue conditions or ahead of the queue. See: `read_advanced()`, `write_high_priority()`.
- Calibrate the data strobe delay lines and apply the result. See: `init_timing_check()`, `apply_timing()`.
- Enable and disable XIP access and scrambling. See: `enable_xip()`, `enable_scrambling()`.
- Switch between 8 and 16 data lanes. See: `set_io_mode()`.
- Enter and leave half sleep. See: `enter_half_sleep()`, `exit_half_sleep()`.
- Read the identity and size of the device. See: `id()`, `device_info()`.

# Supported devices

| Device | Memory bytes | Memory bits | Read latency | Datasheet |
|-------:|-------------:|------------:|-------------:|:----------|
| Aps25616ba | 32 MB | 256 Mbit | code + 3 | [APS256XXN-OBR] |
| Aps51216ba | 64 MB | 512 Mbit | code + 4 | [APS512XXN-OBR] |

[APS256XXN-OBR]: https://www.apmemory.com/wp-content/uploads/APM_PSRAM_OPI_Xccela-APS256XXN-OBRx-v1.0-PKG.pdf
[APS512XXN-OBR]: https://www.apmemory.com/wp-content/uploads/APM_PSRAM_OPI_Xccela-APS512XXN-OBRx-v1.0-PKG.pdf

# Usage

Include the library as a dependency in your Cargo.toml

```toml
[dependencies]
aps25616 = "0.1.0"
```

Some example usage:

```ignore
use aps25616::*;

static REGISTRY: PsramRegistry = PsramRegistry::new();
static mut TXN_BUFFER: [u32; 2560] = [0; 2560];

fn main() {
    // 1. Ensure the MSPI controller driver, a delay and the CE pin are defined
    // (device specific). The CE pin is only pulsed for WakeMethod::CePulse.

    // 2. Bring the device up in octal mode at 250 MHz on module 0
    let config = PsramConfig::new(DeviceConfig::OctalDdrCe0, ClockFreq::Mhz250, txn_buffer);
    let mut psram =
        Psram::init(&REGISTRY, 0, mspi, delay, ce, device_type::Aps25616ba, config).unwrap();

    // 3. Calibrate the delay lines and use the result
    let timing = psram.init_timing_check().unwrap();
    psram.apply_timing(&timing).unwrap();

    // 4. Write 256 bytes at 0x1000 and read them back
    let mut data = [0u8; 256];
    Pattern::Incrementing.fill(&mut data).unwrap();
    psram.write(&data, 0x1000).unwrap();
    let mut back = [0u8; 256];
    psram.read(&mut back, 0x1000).unwrap();
    assert_eq!(data, back);

    // 5. Park the device and bring it back
    psram.enter_half_sleep().unwrap();
    psram.exit_half_sleep().unwrap();

    // 6. Release the controller
    let (mspi, delay, ce) = psram.deinit().unwrap();
}
```

*/
#![deny(unsafe_code)]
#![no_std]

extern crate bit_field;
extern crate embedded_hal as hal;

mod aps25616;
pub mod completion;
pub mod mspi;
pub mod registers;
pub mod registry;
mod session;
pub mod timing;
pub mod transfer;

pub use aps25616::DeviceType;
pub use completion::{Completion, TransferStatus};
pub use mspi::{ClockFreq, DeviceConfig, DqsConfig, Mspi, RxConfig, TimingScan, XipConfig};
pub use registers::{ModeRegister, RegisterImage};
pub use registry::{ModuleLease, PsramRegistry};
pub use session::TIMEOUT_US;
pub use timing::{count_consecutive_ones, find_mid_point, CalibrationConfig, Candidate, Pattern, ScanAxes};
pub use transfer::{Conditions, Priority, Transfer, PAGE_SIZE};

use mspi::{DeviceSetting, XipMisc};
use session::Session;

/// APMemory DDR PSRAM driver
pub struct Psram<'d, M, DELAY, CE, DT> {
    /// Exclusive use of the controller instance
    lease: ModuleLease<'d>,
    /// The open connection to the controller
    session: Session<M>,
    /// Microsecond delay source
    delay: DELAY,
    /// Chip select, pulsed to wake the device from half sleep
    ce: CE,
    /// The PSRAM device type
    dt: DT,
    /// Protocol used for data access outside of half sleep
    setting: DeviceSetting,
    /// Cached mode registers
    registers: RegisterImage,
    xip: XipConfig,
    xip_misc: XipMisc,
    dqs: DqsConfig,
    rx: RxConfig,
    /// Applied calibration result, if any
    timing: Option<Candidate>,
    wake: WakeMethod,
    /// Busy loop iterations CE is held low when pulsed
    ce_pulse_spins: u32,
    calibration: CalibrationConfig,
    power: PowerMode,
    xip_enabled: bool,
    scrambling_enabled: bool,
}

/// All possible instructions
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Reset the device to its power up state
    GlobalReset = 0xFFFF,
    /// Synchronous burst read
    Read = 0x2020,
    /// Synchronous burst write
    Write = 0xA0A0,
    /// Read a mode register
    ReadRegister = 0x4040,
    /// Write a mode register
    WriteRegister = 0xC0C0,
    /// No operation, holds CE low to wake the device
    Dummy = 0x0000,
}

/// Width of the data bus
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// 8 data lanes
    Octal,
    /// 16 data lanes
    Hex,
}

/// How the device is woken from half sleep
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeMethod {
    /// Pulse the CE pin low for tXPHS
    CePulse,
    /// Send a dummy command, the controller holds CE low long enough
    DummyCommand,
}

/// Power mode of the device
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Active,
    HalfSleep,
}

/// All possible errors in this crate
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The controller reported a failure, or the device is not awake
    BusTransactionFailed,
    /// Module out of range, empty buffer or malformed configuration
    InvalidArgument,
    /// A transfer did not complete in time
    TransferTimeout,
    /// Calibration found no acceptably wide passing window
    NoTimingWindowFound,
    /// The vendor id read at bring-up is not APMemory's
    UnexpectedDeviceIdentity,
    /// The module is driven by another handle
    AlreadyOccupied,
    /// Latency code outside the set the device accepts
    InvalidLatencyCode,
    /// The device is not in the state the driver put it in
    Fatal(Fatal),
}

/// Hardware states the driver cannot recover from
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// A mode register did not read back as written
    RegisterMismatch {
        register: ModeRegister,
        expected: u8,
        actual: u8,
    },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::BusTransactionFailed => f.write_str("bus transaction failed"),
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::TransferTimeout => f.write_str("transfer timed out"),
            Error::NoTimingWindowFound => f.write_str("no timing window found"),
            Error::UnexpectedDeviceIdentity => f.write_str("unexpected device identity"),
            Error::AlreadyOccupied => f.write_str("module already occupied"),
            Error::InvalidLatencyCode => f.write_str("invalid latency code"),
            Error::Fatal(Fatal::RegisterMismatch {
                register,
                expected,
                actual,
            }) => write!(
                f,
                "{:?} reads {:#04x}, expected {:#04x}",
                register, actual, expected
            ),
        }
    }
}

/// Types of devices supported by this crate
pub mod device_type {
    /// APMemory APS25616BA, 32MB (256Mbit) octal/hex DDR PSRAM
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Aps25616ba;
    /// APMemory APS51216BA, 64MB (512Mbit) octal/hex DDR PSRAM
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Aps51216ba;
}

/// Identity and geometry of an initialized device
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u8,
    /// Device generation
    pub device_id: u8,
    /// Start of the memory mapped window
    pub base_address: u32,
    /// Capacity in KiB, 0 for an unknown density
    pub size_kib: u32,
}

/// Bring-up configuration
#[derive(Debug)]
pub struct PsramConfig<'d> {
    /// Lane count and chip select used for data access
    pub device: DeviceConfig,
    /// Target interface clock
    pub clock: ClockFreq,
    /// Command queue scratch space, owned by the controller until `deinit`
    pub txn_buffer: &'d mut [u32],
    pub scrambling_start: u32,
    pub scrambling_end: u32,
    pub wake: WakeMethod,
    /// Busy loop iterations between the CE edges of a wake pulse. Pick a
    /// count that keeps the pulse inside tXPHS (60 ns to 500 ns) at the core
    /// clock.
    pub ce_pulse_spins: u32,
    pub dqs: DqsConfig,
    pub rx: RxConfig,
    pub calibration: CalibrationConfig,
}

impl<'d> PsramConfig<'d> {
    /// Defaults for everything but the wiring, clock and scratch buffer
    pub fn new(device: DeviceConfig, clock: ClockFreq, txn_buffer: &'d mut [u32]) -> Self {
        PsramConfig {
            device,
            clock,
            txn_buffer,
            scrambling_start: 0,
            scrambling_end: 0,
            wake: WakeMethod::DummyCommand,
            ce_pulse_spins: 8,
            dqs: DqsConfig::default(),
            rx: RxConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}
