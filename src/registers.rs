//! Mode register image.
//!
//! Every field is a shift/mask over a plain `u8`, one byte per register.

use bit_field::BitField;

use crate::Error;

/// Mode registers of the device
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRegister {
    /// Drive strength, read latency, latency type
    Mr0 = 0,
    /// Vendor id, half sleep support
    Mr1 = 1,
    /// Density, generation, good-die
    Mr2 = 2,
    /// Self refresh, row boundary crossing support
    Mr3 = 3,
    /// Refresh, write latency
    Mr4 = 4,
    /// Low power mode select
    Mr6 = 6,
    /// Burst, row boundary crossing read, IO mode
    Mr8 = 8,
}

/// Output drive strength
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStrength {
    /// 25 ohm
    Full = 0b00,
    /// 50 ohm
    Half = 0b01,
    /// 100 ohm
    Quarter = 0b10,
    /// 200 ohm
    Octuple = 0b11,
}

/// Vendor id reported in MR1
pub const VENDOR_ID: u8 = 0b0_1101;

/// MR6 value entering half sleep
pub const HALF_SLEEP: u8 = 0xF0;
/// MR6 value entering deep power down
pub const DEEP_POWER_DOWN: u8 = 0xC0;

/// Write latency, in clock cycles, for each 3-bit MR4 code
const WRITE_LATENCY_CYCLES: [u8; 8] = [3, 7, 5, 9, 4, 8, 6, 10];

/// MR4 code for a write latency of `cycles`
pub fn write_latency_code(cycles: u8) -> Result<u8, Error> {
    WRITE_LATENCY_CYCLES
        .iter()
        .position(|&c| c == cycles)
        .map(|code| code as u8)
        .ok_or(Error::InvalidLatencyCode)
}

/// Clock cycles of the MR4 write latency `code`
pub fn write_latency_cycles(code: u8) -> Result<u8, Error> {
    WRITE_LATENCY_CYCLES
        .get(usize::from(code))
        .copied()
        .ok_or(Error::InvalidLatencyCode)
}

/// Cached copy of the device's mode registers
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterImage {
    pub mr0: u8,
    pub mr1: u8,
    pub mr2: u8,
    pub mr3: u8,
    pub mr4: u8,
    pub mr6: u8,
    pub mr8: u8,
}

impl RegisterImage {
    /// Power-up defaults. `rlc` is the default read latency code of the part.
    pub fn power_up(rlc: u8, wlc: u8) -> Self {
        let mut regs = RegisterImage::default();
        regs.set_drive_strength(DriveStrength::Half);
        regs.set_read_latency_code(rlc);
        regs.set_write_latency_code(wlc);
        regs.set_burst_length(1);
        regs.set_hybrid_burst(true);
        regs
    }

    pub fn get(&self, reg: ModeRegister) -> u8 {
        match reg {
            ModeRegister::Mr0 => self.mr0,
            ModeRegister::Mr1 => self.mr1,
            ModeRegister::Mr2 => self.mr2,
            ModeRegister::Mr3 => self.mr3,
            ModeRegister::Mr4 => self.mr4,
            ModeRegister::Mr6 => self.mr6,
            ModeRegister::Mr8 => self.mr8,
        }
    }

    pub fn set(&mut self, reg: ModeRegister, value: u8) {
        match reg {
            ModeRegister::Mr0 => self.mr0 = value,
            ModeRegister::Mr1 => self.mr1 = value,
            ModeRegister::Mr2 => self.mr2 = value,
            ModeRegister::Mr3 => self.mr3 = value,
            ModeRegister::Mr4 => self.mr4 = value,
            ModeRegister::Mr6 => self.mr6 = value,
            ModeRegister::Mr8 => self.mr8 = value,
        }
    }

    // MR0

    pub fn drive_strength(&self) -> DriveStrength {
        match self.mr0.get_bits(0..2) {
            0b00 => DriveStrength::Full,
            0b01 => DriveStrength::Half,
            0b10 => DriveStrength::Quarter,
            _ => DriveStrength::Octuple,
        }
    }

    pub fn set_drive_strength(&mut self, ds: DriveStrength) {
        self.mr0.set_bits(0..2, ds as u8);
    }

    pub fn read_latency_code(&self) -> u8 {
        self.mr0.get_bits(2..5)
    }

    pub fn set_read_latency_code(&mut self, code: u8) {
        self.mr0.set_bits(2..5, code & 0b111);
    }

    /// Fixed (true) or variable (false) read latency
    pub fn fixed_latency(&self) -> bool {
        self.mr0.get_bit(5)
    }

    pub fn set_fixed_latency(&mut self, fixed: bool) {
        self.mr0.set_bit(5, fixed);
    }

    pub fn temperature_override(&self) -> bool {
        self.mr0.get_bit(7)
    }

    // MR1

    pub fn vendor_id(&self) -> u8 {
        self.mr1.get_bits(0..5)
    }

    pub fn half_sleep_supported(&self) -> bool {
        self.mr1.get_bit(7)
    }

    // MR2

    pub fn density(&self) -> u8 {
        self.mr2.get_bits(0..3)
    }

    pub fn generation(&self) -> u8 {
        self.mr2.get_bits(3..5)
    }

    /// 0b110 marks a good die
    pub fn good_die(&self) -> u8 {
        self.mr2.get_bits(5..8)
    }

    /// Capacity in KiB, `None` for an unknown density code
    pub fn size_kib(&self) -> Option<u32> {
        let mbit = match self.density() {
            1 => 32,
            3 => 64,
            5 => 128,
            7 => 256,
            6 => 512,
            _ => return None,
        };
        Some(mbit / 8 * 1024)
    }

    // MR3

    pub fn self_refresh(&self) -> u8 {
        self.mr3.get_bits(4..6)
    }

    /// Row boundary crossing supported
    pub fn rbx_supported(&self) -> bool {
        self.mr3.get_bit(7)
    }

    // MR4

    pub fn refresh_frequency(&self) -> u8 {
        self.mr4.get_bits(3..5)
    }

    pub fn write_latency_code(&self) -> u8 {
        self.mr4.get_bits(5..8)
    }

    pub fn set_write_latency_code(&mut self, code: u8) {
        self.mr4.set_bits(5..8, code & 0b111);
    }

    // MR6

    pub fn low_power_mode(&self) -> u8 {
        self.mr6
    }

    // MR8

    pub fn burst_length(&self) -> u8 {
        self.mr8.get_bits(0..2)
    }

    pub fn set_burst_length(&mut self, bl: u8) {
        self.mr8.set_bits(0..2, bl & 0b11);
    }

    pub fn hybrid_burst(&self) -> bool {
        self.mr8.get_bit(2)
    }

    pub fn set_hybrid_burst(&mut self, hybrid: bool) {
        self.mr8.set_bit(2, hybrid);
    }

    /// Reads cross 1 KiB row boundaries
    pub fn rbx(&self) -> bool {
        self.mr8.get_bit(3)
    }

    pub fn set_rbx(&mut self, enabled: bool) {
        self.mr8.set_bit(3, enabled);
    }

    /// 16 lane (true) or 8 lane (false) IO
    pub fn hex_mode(&self) -> bool {
        self.mr8.get_bit(6)
    }

    pub fn set_hex_mode(&mut self, hex: bool) {
        self.mr8.set_bit(6, hex);
    }
}
