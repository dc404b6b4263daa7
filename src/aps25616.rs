use super::*;
use hal::blocking::delay::DelayUs;
use hal::digital::v2::OutputPin;
use log::{debug, error, info, warn};

use crate::mspi::{interrupt, Direction, PowerState, Request};
use crate::registers::{write_latency_code, write_latency_cycles, HALF_SLEEP, VENDOR_ID};
use crate::session::bus_error;
use crate::timing::{TimingProbe, XipProbe};
use crate::transfer::{finish, transfer_len};

/// Clock used for register access during bring-up and in half sleep
const BASE_CLOCK: ClockFreq = ClockFreq::Mhz48;
/// Settle time after the controller is first enabled, us
const POWER_UP_US: u32 = 150;
/// Settle time after a global reset, us
const RESET_US: u32 = 2;
/// tHS, us
const HALF_SLEEP_ENTRY_US: u32 = 155;
/// tXHS, us
const HALF_SLEEP_EXIT_US: u32 = 155;
/// Write latency after power up, clock cycles
const POWER_UP_WRITE_LATENCY: u8 = 6;
/// DMA time slice, controller cycles
const DMA_TIME_LIMIT: u16 = 40;

pub trait DeviceType {
    /// Read latency in clock cycles is the MR0 code plus this
    const RLC_OFFSET: u8;
    /// MR0 read latency code after power up
    const DEFAULT_RLC: u8;
    /// Write latencies, in clock cycles, the part does not accept
    const RESERVED_WRITE_LATENCY: &'static [u8];

    /// Read latency code and write latency cycles for `clock`
    fn latency_for(clock: ClockFreq) -> (u8, u8);

    /// Clock cycles of the MR4 write latency `code`
    fn write_latency(code: u8) -> Result<u8, Error> {
        let cycles = write_latency_cycles(code)?;
        if Self::RESERVED_WRITE_LATENCY.contains(&cycles) {
            Err(Error::InvalidLatencyCode)
        } else {
            Ok(cycles)
        }
    }

    /// Controller turnaround for the read latency code `rlc`
    fn turnaround(rlc: u8, dqs: bool) -> u8 {
        let cycles = (rlc + Self::RLC_OFFSET) * 2;
        if dqs {
            cycles
        } else {
            cycles * 2
        }
    }
}

// Macros
macro_rules! impl_device_type {
    ($devicetype:ident, $offset:expr, $rlc:expr, $reserved:expr, $latency:expr) => {
        impl DeviceType for device_type::$devicetype {
            const RLC_OFFSET: u8 = $offset;
            const DEFAULT_RLC: u8 = $rlc;
            const RESERVED_WRITE_LATENCY: &'static [u8] = $reserved;

            fn latency_for(clock: ClockFreq) -> (u8, u8) {
                let [mhz250, mhz192, mhz125, mhz96, slower]: [(u8, u8); 5] = $latency;
                match clock {
                    ClockFreq::Mhz250 => mhz250,
                    ClockFreq::Mhz192 => mhz192,
                    ClockFreq::Mhz125 => mhz125,
                    ClockFreq::Mhz96 => mhz96,
                    _ => slower,
                }
            }
        }
    };
}

impl_device_type!(Aps25616ba, 3, 2, &[], [(3, 7), (2, 6), (1, 5), (1, 5), (0, 3)]);
impl_device_type!(Aps51216ba, 4, 3, &[3, 4], [(4, 8), (3, 7), (2, 6), (2, 6), (1, 5)]);

impl<'d, M, DELAY, CE, P, DT> Psram<'d, M, DELAY, CE, DT>
where
    M: Mspi<'d>,
    DELAY: DelayUs<u32>,
    CE: OutputPin<Error = P>,
    P: core::fmt::Debug,
    DT: DeviceType,
{
    /// Claim `module`, bring the controller up and configure the device for
    /// `config.clock`
    pub fn init(
        registry: &'d PsramRegistry,
        module: usize,
        mut mspi: M,
        delay: DELAY,
        ce: CE,
        dt: DT,
        config: PsramConfig<'d>,
    ) -> Result<Self, Error> {
        config.calibration.validate()?;
        let mut xip = XipConfig::for_module(module).ok_or(Error::InvalidArgument)?;
        xip.scrambling_start = config.scrambling_start;
        xip.scrambling_end = config.scrambling_end;
        let lease = registry.claim(module)?;

        let power_up_wlc = write_latency_code(POWER_UP_WRITE_LATENCY)?;
        let setting = Self::bring_up_setting(config.device, config.dqs.enable);
        mspi.initialize(module).map_err(bus_error("initialize"))?;

        let mut psram = Psram {
            lease,
            session: Session::new(mspi),
            delay,
            ce,
            dt,
            setting,
            registers: RegisterImage::power_up(DT::DEFAULT_RLC, power_up_wlc),
            xip,
            xip_misc: XipMisc::default(),
            dqs: config.dqs,
            rx: config.rx,
            timing: None,
            wake: config.wake,
            ce_pulse_spins: config.ce_pulse_spins,
            calibration: config.calibration,
            power: PowerMode::Active,
            xip_enabled: false,
            scrambling_enabled: false,
        };
        psram.start_session(config.txn_buffer)?;
        psram.device_init(config.clock)?;
        psram.finish_init(config.device, config.clock)?;
        info!(
            "module {}: PSRAM {:#06x} up, {:?} at {:?}",
            module,
            psram.id(),
            config.device,
            config.clock
        );
        Ok(psram)
    }

    /// Octal protocol at the base clock with power up latencies
    fn bring_up_setting(device: DeviceConfig, dqs: bool) -> DeviceSetting {
        DeviceSetting {
            device: device.octal(),
            clock: BASE_CLOCK,
            read_instr: Instruction::Read as u16,
            write_instr: Instruction::Write as u16,
            turnaround: DT::turnaround(DT::DEFAULT_RLC, dqs),
            write_latency: POWER_UP_WRITE_LATENCY * 2,
            enable_write_latency: true,
            emulate_ddr: true,
            dma_time_limit: DMA_TIME_LIMIT,
            dma_break_1k: true,
        }
    }

    /// Power the controller and program the conservative octal protocol
    fn start_session(&mut self, txn_buffer: &'d mut [u32]) -> Result<(), Error> {
        self.session
            .mspi
            .power_control(PowerState::Wake, false)
            .map_err(bus_error("power on"))?;
        self.session
            .mspi
            .configure(txn_buffer)
            .map_err(bus_error("configure"))?;
        self.session.configure(&self.setting)?;
        self.session
            .control(Request::XipConfig(&self.xip), "xip config")?;
        self.session
            .control(Request::XipMisc(&self.xip_misc), "xip misc config")?;
        self.session.control(Request::Dqs(&self.dqs), "dqs config")?;
        self.session.control(Request::RxConfig(&self.rx), "rx config")?;
        self.session.control(Request::DdrEnable, "ddr enable")?;
        self.session.enable()?;
        self.delay.delay_us(POWER_UP_US);
        Ok(())
    }

    /// Reset the device, check its identity and select the latencies for
    /// `clock`
    fn device_init(&mut self, clock: ClockFreq) -> Result<(), Error> {
        self.global_reset()?;
        self.read_identity()?;

        if self.registers.rbx_supported() && self.rx.rbx {
            self.registers.mr8 = self.session.read_register(ModeRegister::Mr8)?;
            self.registers.set_rbx(true);
            self.session
                .write_register(ModeRegister::Mr8, self.registers.mr8)?;
        }

        self.registers.mr4 = self.session.read_register(ModeRegister::Mr4)?;
        DT::write_latency(self.registers.write_latency_code())?;
        self.registers.mr0 = self.session.read_register(ModeRegister::Mr0)?;

        let (rlc, write_latency) = DT::latency_for(clock);
        let wlc = write_latency_code(write_latency)?;
        DT::write_latency(wlc)?;
        self.registers.set_read_latency_code(rlc);
        self.registers.set_write_latency_code(wlc);
        if !self.dqs.enable {
            self.registers.set_fixed_latency(true);
        }
        self.session
            .write_register(ModeRegister::Mr0, self.registers.mr0)?;
        self.session
            .write_register(ModeRegister::Mr4, self.registers.mr4)?;

        self.setting.write_latency = write_latency * 2;
        self.setting.turnaround = DT::turnaround(rlc, self.dqs.enable);
        self.session.configure(&self.setting)?;

        self.verify(ModeRegister::Mr0)?;
        self.verify(ModeRegister::Mr4)?;
        debug!(
            "read latency code {}, write latency {} cycles",
            rlc, write_latency
        );
        Ok(())
    }

    fn read_identity(&mut self) -> Result<(), Error> {
        self.registers.mr1 = self.session.read_register(ModeRegister::Mr1)?;
        if self.registers.vendor_id() != VENDOR_ID {
            warn!("unexpected vendor id {:#07b}", self.registers.vendor_id());
            return Err(Error::UnexpectedDeviceIdentity);
        }
        let raw = self.session.read_register_raw(ModeRegister::Mr2)?;
        self.registers.mr2 = raw as u8;
        self.registers.mr3 = (raw >> 8) as u8;
        debug!(
            "generation {}, {} KiB, row boundary crossing {}",
            self.registers.generation(),
            self.registers.size_kib().unwrap_or(0),
            self.registers.rbx_supported()
        );
        Ok(())
    }

    /// Read `reg` back and compare it with the cached image
    fn verify(&mut self, reg: ModeRegister) -> Result<(), Error> {
        let actual = self.session.read_register(reg)?;
        let expected = self.registers.get(reg);
        if actual != expected {
            error!(
                "MR{} reads {:#04x}, wrote {:#04x}",
                reg as u8, actual, expected
            );
            return Err(Error::Fatal(Fatal::RegisterMismatch {
                register: reg,
                expected,
                actual,
            }));
        }
        Ok(())
    }

    /// Switch to the requested wiring and clock and enable interrupts
    fn finish_init(&mut self, device: DeviceConfig, clock: ClockFreq) -> Result<(), Error> {
        if device.is_hex() {
            self.write_io_mode(IoMode::Hex)?;
        }
        self.setting.device = device;
        self.setting.clock = clock;

        self.session.disable()?;
        if clock.is_high_speed() {
            self.rx.rx_sample = 2;
        }
        self.session.control(Request::RxConfig(&self.rx), "rx config")?;
        self.session.configure(&self.setting)?;
        self.session.enable()?;

        let mask = interrupt::CQ_UPDATE | interrupt::ERROR;
        self.session
            .mspi
            .interrupt_clear(mask)
            .map_err(bus_error("interrupt clear"))?;
        self.session
            .mspi
            .interrupt_enable(mask)
            .map_err(bus_error("interrupt enable"))
    }

    /// Update the IO mode bit of MR8 using the protocol currently programmed
    fn write_io_mode(&mut self, mode: IoMode) -> Result<(), Error> {
        self.registers.mr8 = self.session.read_register(ModeRegister::Mr8)?;
        self.registers.set_hex_mode(mode == IoMode::Hex);
        self.session
            .write_register(ModeRegister::Mr8, self.registers.mr8)
    }

    /// Leave hex mode, shut the controller down and release the module
    pub fn deinit(mut self) -> Result<(M, DELAY, CE), Error> {
        if self.power == PowerMode::HalfSleep {
            self.exit_half_sleep()?;
        }
        if self.setting.device.is_hex() {
            self.write_io_mode(IoMode::Octal)?;
        }
        let mspi = &mut self.session.mspi;
        mspi.interrupt_disable(interrupt::ALL)
            .map_err(bus_error("interrupt disable"))?;
        mspi.interrupt_clear(interrupt::ALL)
            .map_err(bus_error("interrupt clear"))?;
        mspi.disable().map_err(bus_error("disable"))?;
        mspi.power_control(PowerState::DeepSleep, false)
            .map_err(bus_error("power off"))?;
        mspi.deinitialize().map_err(bus_error("deinitialize"))?;
        debug!("module {} shut down", self.lease.module());

        let Psram {
            session, delay, ce, ..
        } = self;
        Ok((session.mspi, delay, ce))
    }

    /// Reset the device and bring it back to the current IO mode and clock.
    ///
    /// The controller drops to the bring-up protocol for the reset and the
    /// latency selection, exactly as during `init`.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.ensure_awake()?;
        let device = self.setting.device;
        let clock = self.setting.clock;
        if device.is_hex() {
            self.write_io_mode(IoMode::Octal)?;
        }
        self.setting = Self::bring_up_setting(device, self.dqs.enable);
        self.session.reconfigure(&self.setting)?;
        self.device_init(clock)?;
        self.finish_init(device, clock)?;
        debug!("device reset, {:?} at {:?}", device, clock);
        Ok(())
    }

    /// Issue a global reset. The cached mode registers return to their
    /// power up values.
    fn global_reset(&mut self) -> Result<(), Error> {
        self.session
            .command_write(Instruction::GlobalReset as u16, 0, &[0; 2])?;
        self.delay.delay_us(RESET_US);
        let power_up = RegisterImage::power_up(
            DT::DEFAULT_RLC,
            write_latency_code(POWER_UP_WRITE_LATENCY)?,
        );
        self.registers = RegisterImage {
            mr1: self.registers.mr1,
            mr2: self.registers.mr2,
            mr3: self.registers.mr3,
            ..power_up
        };
        Ok(())
    }

    fn ensure_awake(&self) -> Result<(), Error> {
        match self.power {
            PowerMode::Active => Ok(()),
            PowerMode::HalfSleep => {
                warn!("device is in half sleep");
                Err(Error::BusTransactionFailed)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn queue(
        &mut self,
        direction: Direction,
        priority: Priority,
        host_address: usize,
        len: usize,
        address: u32,
        conditions: Conditions,
        done: &'d Completion,
    ) -> Result<(), Error> {
        self.ensure_awake()?;
        let len = transfer_len(len)?;
        done.arm();
        self.session.queue(
            direction,
            priority,
            host_address,
            address,
            len,
            conditions,
            Some(done),
        )
    }

    fn blocking(
        &mut self,
        direction: Direction,
        host_address: usize,
        len: usize,
        address: u32,
    ) -> Result<(), Error> {
        let done = self.lease.completion();
        self.queue(
            direction,
            Priority::Normal,
            host_address,
            len,
            address,
            Conditions::default(),
            done,
        )?;
        finish(done, &mut self.delay, TIMEOUT_US)
    }

    /// Read `buf.len()` bytes starting at `address`
    pub fn read(&mut self, buf: &mut [u8], address: u32) -> Result<(), Error> {
        self.blocking(Direction::Rx, buf.as_mut_ptr() as usize, buf.len(), address)
    }

    /// Write `data` starting at `address`
    pub fn write(&mut self, data: &[u8], address: u32) -> Result<(), Error> {
        self.blocking(Direction::Tx, data.as_ptr() as usize, data.len(), address)
    }

    /// Queue a read into `buf`; `done` resolves once the last byte landed
    pub fn read_nonblocking<'b>(
        &mut self,
        buf: &'b mut [u8],
        address: u32,
        done: &'d Completion,
    ) -> Result<Transfer<'d, &'b mut [u8]>, Error> {
        self.read_advanced(buf, address, Conditions::default(), done)
    }

    /// Queue a write of `data`; `done` resolves once the last byte left
    pub fn write_nonblocking<'b>(
        &mut self,
        data: &'b [u8],
        address: u32,
        done: &'d Completion,
    ) -> Result<Transfer<'d, &'b [u8]>, Error> {
        self.write_advanced(data, address, Conditions::default(), done)
    }

    /// Queue a read gated on `conditions.pause` that applies
    /// `conditions.status_set_clr` when it finishes
    pub fn read_advanced<'b>(
        &mut self,
        buf: &'b mut [u8],
        address: u32,
        conditions: Conditions,
        done: &'d Completion,
    ) -> Result<Transfer<'d, &'b mut [u8]>, Error> {
        let host = buf.as_mut_ptr() as usize;
        self.queue(
            Direction::Rx,
            Priority::Normal,
            host,
            buf.len(),
            address,
            conditions,
            done,
        )?;
        Ok(Transfer::new(buf, done))
    }

    /// Queue a write gated on `conditions.pause` that applies
    /// `conditions.status_set_clr` when it finishes
    pub fn write_advanced<'b>(
        &mut self,
        data: &'b [u8],
        address: u32,
        conditions: Conditions,
        done: &'d Completion,
    ) -> Result<Transfer<'d, &'b [u8]>, Error> {
        self.queue(
            Direction::Tx,
            Priority::Normal,
            data.as_ptr() as usize,
            data.len(),
            address,
            conditions,
            done,
        )?;
        Ok(Transfer::new(data, done))
    }

    /// Queue a read ahead of the normal queue
    pub fn read_high_priority<'b>(
        &mut self,
        buf: &'b mut [u8],
        address: u32,
        done: &'d Completion,
    ) -> Result<Transfer<'d, &'b mut [u8]>, Error> {
        let host = buf.as_mut_ptr() as usize;
        self.queue(
            Direction::Rx,
            Priority::High,
            host,
            buf.len(),
            address,
            Conditions::default(),
            done,
        )?;
        Ok(Transfer::new(buf, done))
    }

    /// Queue a write ahead of the normal queue
    pub fn write_high_priority<'b>(
        &mut self,
        data: &'b [u8],
        address: u32,
        done: &'d Completion,
    ) -> Result<Transfer<'d, &'b [u8]>, Error> {
        self.queue(
            Direction::Tx,
            Priority::High,
            data.as_ptr() as usize,
            data.len(),
            address,
            Conditions::default(),
            done,
        )?;
        Ok(Transfer::new(data, done))
    }

    pub fn enable_xip(&mut self) -> Result<(), Error> {
        self.session.control(Request::XipEnable, "xip enable")?;
        self.xip_enabled = true;
        Ok(())
    }

    pub fn disable_xip(&mut self) -> Result<(), Error> {
        self.session.control(Request::XipDisable, "xip disable")?;
        self.xip_enabled = false;
        Ok(())
    }

    pub fn enable_scrambling(&mut self) -> Result<(), Error> {
        self.session
            .control(Request::ScramblingEnable, "scrambling enable")?;
        self.scrambling_enabled = true;
        Ok(())
    }

    pub fn disable_scrambling(&mut self) -> Result<(), Error> {
        self.session
            .control(Request::ScramblingDisable, "scrambling disable")?;
        self.scrambling_enabled = false;
        Ok(())
    }

    /// Replace the memory mapped window configuration
    pub fn xip_config(&mut self, config: XipConfig) -> Result<(), Error> {
        self.session
            .control(Request::XipConfig(&config), "xip config")?;
        self.xip = config;
        Ok(())
    }

    pub fn is_xip_enabled(&self) -> bool {
        self.xip_enabled
    }

    pub fn is_scrambling_enabled(&self) -> bool {
        self.scrambling_enabled
    }

    /// Switch between 8 and 16 data lanes. MR8 is written with the lane
    /// count being left, then the controller follows.
    pub fn set_io_mode(&mut self, mode: IoMode) -> Result<(), Error> {
        self.ensure_awake()?;
        let device = match mode {
            IoMode::Octal => self.setting.device.octal(),
            IoMode::Hex => self.setting.device.hex(),
        };
        if device == self.setting.device {
            return Ok(());
        }
        self.write_io_mode(mode)?;
        self.setting.device = device;
        self.session.reconfigure(&self.setting)?;
        debug!("io mode {:?}", mode);
        Ok(())
    }

    pub fn io_mode(&self) -> IoMode {
        if self.setting.device.is_hex() {
            IoMode::Hex
        } else {
            IoMode::Octal
        }
    }

    /// Put the device into half sleep. The controller is left in octal mode
    /// at the base clock.
    pub fn enter_half_sleep(&mut self) -> Result<(), Error> {
        self.ensure_awake()?;
        let parked = DeviceSetting {
            device: self.setting.device.octal(),
            clock: BASE_CLOCK,
            ..self.setting
        };
        self.session.reconfigure(&parked)?;
        let entered = self.session.command_write(
            Instruction::WriteRegister as u16,
            ModeRegister::Mr6 as u32,
            &[HALF_SLEEP],
        );
        if let Err(e) = entered {
            self.session.reconfigure(&self.setting)?;
            return Err(e);
        }
        self.registers.mr6 = HALF_SLEEP;
        self.power = PowerMode::HalfSleep;
        self.delay.delay_us(HALF_SLEEP_ENTRY_US);
        debug!("entered half sleep");
        Ok(())
    }

    /// Wake the device and restore the operating protocol
    pub fn exit_half_sleep(&mut self) -> Result<(), Error> {
        if self.power == PowerMode::Active {
            return Ok(());
        }
        match self.wake {
            WakeMethod::CePulse => {
                // tXPHS: 60 ns min, 500 ns max
                self.ce.set_low().map_err(bus_error("ce low"))?;
                for _ in 0..self.ce_pulse_spins {
                    core::hint::spin_loop();
                }
                self.ce.set_high().map_err(bus_error("ce high"))?;
            }
            WakeMethod::DummyCommand => {
                self.session
                    .command_write(Instruction::Dummy as u16, 0, &[0; 2])?;
            }
        }
        self.delay.delay_us(HALF_SLEEP_EXIT_US);
        self.session.reconfigure(&self.setting)?;
        self.registers.mr6 = 0;
        self.power = PowerMode::Active;
        debug!("left half sleep");
        Ok(())
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power
    }

    /// Calibrate the delay lines at the current clock and apply the result.
    ///
    /// With fast scan enabled a result cached for this module is checked once
    /// and reused if it still passes. On failure the controller keeps the
    /// timing it had before the call. The XIP state is restored either way.
    pub fn init_timing_check(&mut self) -> Result<Candidate, Error> {
        self.ensure_awake()?;
        let previous = self.session.timing_scan()?;
        let xip_was_enabled = self.xip_enabled;
        if !xip_was_enabled {
            self.enable_xip()?;
        }

        let result = self.calibrate(previous);
        let restore = match &result {
            Ok(candidate) => candidate.timing,
            Err(_) => previous,
        };
        let applied = self
            .session
            .control(Request::TimingScan(&restore), "timing scan");
        let xip = if xip_was_enabled {
            Ok(())
        } else {
            self.disable_xip()
        };

        let candidate = result?;
        applied?;
        xip?;
        self.timing = Some(candidate);
        self.lease.store_timing(candidate);
        Ok(candidate)
    }

    fn calibrate(&mut self, base: TimingScan) -> Result<Candidate, Error> {
        let config = self.calibration;
        let mut probe = XipProbe {
            mspi: &mut self.session.mspi,
            base_address: self.xip.base_address,
            block_size: config.block_size,
        };
        if config.fast_scan {
            if let Some(cached) = self.lease.cached_timing() {
                probe.apply(&cached.timing)?;
                if probe.check(0)? {
                    info!("cached timing still passes, skipping scan");
                    return Ok(cached);
                }
                debug!("cached timing failed, scanning");
            }
        }
        timing::scan(&mut probe, base, &config)
    }

    /// Program a calibration result into the controller
    pub fn apply_timing(&mut self, candidate: &Candidate) -> Result<(), Error> {
        if !candidate.is_valid() {
            warn!("refusing timing {:?}", candidate.timing);
            return Err(Error::InvalidArgument);
        }
        self.session
            .control(Request::TimingScan(&candidate.timing), "timing scan")?;
        self.timing = Some(*candidate);
        info!("applied timing {:?}", candidate.timing);
        Ok(())
    }

    /// Calibration result in use, if any
    pub fn timing(&self) -> Option<Candidate> {
        self.timing
    }

    /// Device id: MR2 identity bits with the vendor id above them
    pub fn id(&self) -> u32 {
        u32::from(self.registers.mr2 & 0x1F) | u32::from(self.registers.vendor_id()) << 8
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            vendor_id: self.registers.vendor_id(),
            device_id: self.registers.generation(),
            base_address: self.xip.base_address,
            size_kib: self.registers.size_kib().unwrap_or(0),
        }
    }

    /// Cached mode registers
    pub fn registers(&self) -> &RegisterImage {
        &self.registers
    }

    pub fn device_type(&self) -> &DT {
        &self.dt
    }

    pub fn module(&self) -> usize {
        self.lease.module()
    }

    /// The controller driver
    pub fn mspi(&self) -> &M {
        &self.session.mspi
    }

    pub fn mspi_mut(&mut self) -> &mut M {
        &mut self.session.mspi
    }
}
