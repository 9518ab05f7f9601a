//! PWM controller for BCM2837
//!
//! Owns the two PWM channels and their range (period) and data (duty)
//! registers. The peripheral clock runs at the default 19.2 MHz; the cycle
//! rate is derived from it purely through the range register, so only the
//! 4 kHz cycle frequency is supported and clock divisors are left alone.

use bitflags::bitflags;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use thiserror::Error;

use super::mmio::RegisterBlock;

/// Default PWM peripheral clock rate in Hz (19.2 MHz).
pub const PWM_CLOCK_RATE: u32 = 19_200_000;

/// The one supported PWM cycle frequency in Hz.
pub const SUPPORTED_CYCLE_FREQ_HZ: u32 = 4_000;

/// Range register value both channels reset to (data sheet power-on value).
const RESET_RANGE: u32 = 0x20;

// Register word indices within the mapped PWM block: CTL, STA, DMAC,
// RNG1, DAT1, FIF1, RNG2, DAT2.
const CTL_WORD: usize = 0;
const RNG1_WORD: usize = 3;
const DAT1_WORD: usize = 4;
const RNG2_WORD: usize = 6;
const DAT2_WORD: usize = 7;

bitflags! {
    /// Fields of the shared PWM control word.
    ///
    /// The data sheet names the channels 1 and 2; here they are 0 and 1 to
    /// match [`PwmChannel`]. Channel 0 owns the low byte, channel 1 owns
    /// bits 8..=15 (bit 14 is reserved).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PwmControl: u32 {
        const PWEN_0 = 1;
        const MODE_0 = 1 << 1;
        const RPTL_0 = 1 << 2;
        const SBIT_0 = 1 << 3;
        const POLA_0 = 1 << 4;
        const USEF_0 = 1 << 5;
        const CLRF_0 = 1 << 6;
        const MSEN_0 = 1 << 7;
        const PWEN_1 = 1 << 8;
        const MODE_1 = 1 << 9;
        const RPTL_1 = 1 << 10;
        const SBIT_1 = 1 << 11;
        const POLA_1 = 1 << 12;
        const USEF_1 = 1 << 13;
        const MSEN_1 = 1 << 15;
    }
}

/// One of the two independently configurable PWM channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PwmChannel {
    /// Channel 0 (pins 12 and 18)
    Channel0,
    /// Channel 1 (pins 13 and 19)
    Channel1,
}

impl PwmChannel {
    /// Mask covering every control word bit owned by this channel.
    fn ctl_mask(self) -> u32 {
        match self {
            Self::Channel0 => 0x0000_00FF,
            Self::Channel1 => 0x0000_FF00,
        }
    }

    fn enable_bit(self) -> u32 {
        match self {
            Self::Channel0 => PwmControl::PWEN_0.bits(),
            Self::Channel1 => PwmControl::PWEN_1.bits(),
        }
    }

    fn range_word(self) -> usize {
        match self {
            Self::Channel0 => RNG1_WORD,
            Self::Channel1 => RNG2_WORD,
        }
    }

    fn data_word(self) -> usize {
        match self {
            Self::Channel0 => DAT1_WORD,
            Self::Channel1 => DAT2_WORD,
        }
    }
}

impl TryFrom<u32> for PwmChannel {
    type Error = PwmError;

    fn try_from(value: u32) -> Result<Self, PwmError> {
        match value {
            0 => Ok(Self::Channel0),
            1 => Ok(Self::Channel1),
            _ => Err(PwmError::InvalidChannel),
        }
    }
}

/// PWM controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PwmError {
    /// The value does not name a PWM channel
    #[error("invalid PWM channel")]
    InvalidChannel,
    /// The requested cycle frequency is not supported
    #[error("unsupported PWM cycle frequency")]
    InvalidFrequency,
    /// A register index fell outside the mapped block
    #[error("tried to access an invalid register")]
    InvalidRegister,
}

/// Range register value for a requested cycle frequency.
///
/// # Errors
/// [`PwmError::InvalidFrequency`] for anything other than the supported
/// 4 kHz; unsupported frequencies are rejected, never clamped.
pub fn range_from_cycle_freq(cycle_freq_hz: u32) -> Result<u32, PwmError> {
    if cycle_freq_hz != SUPPORTED_CYCLE_FREQ_HZ {
        log::error!("unsupported PWM cycle frequency: {cycle_freq_hz} Hz!");
        return Err(PwmError::InvalidFrequency);
    }

    Ok(PWM_CLOCK_RATE / cycle_freq_hz)
}

/// Data register value for `percent` of `range`.
///
/// 100 or more maps to `range` (always high) and the division truncates,
/// so 33% of a range of 100 comes out at exactly 33.
#[must_use]
pub fn duty_data_from_percent(percent: u8, range: u32) -> u32 {
    if percent >= 100 {
        return range;
    }

    (range / 100) * u32::from(percent)
}

/// PWM controller for BCM2837
///
/// Owns the mapped PWM register block. Both channels pack their control
/// bits into the one control word, so every control word read-modify-write
/// is serialized through an internal lock; writes that touch only a
/// channel's data register are not.
pub struct PwmController {
    regs: RegisterBlock,
    ctl_lock: Mutex<CriticalSectionRawMutex, ()>,
}

impl PwmController {
    /// Creates a PWM controller over a successfully mapped register block.
    #[must_use]
    pub fn new(regs: RegisterBlock) -> Self {
        log::info!("PWM controller initialized");
        Self {
            regs,
            ctl_lock: Mutex::new(()),
        }
    }

    /// Configures a channel's duty cycle and cycle frequency in one go.
    ///
    /// Clears only the 8 control bits owned by `channel`, writes the data
    /// and range registers and then sets the channel's enable bit if
    /// `enable` is requested.
    ///
    /// # Errors
    /// * [`PwmError::InvalidFrequency`] - `cycle_freq_hz` is unsupported
    /// * [`PwmError::InvalidRegister`] - a register index fell outside the
    ///   mapped block
    pub fn configure_channel(
        &self,
        channel: PwmChannel,
        duty_percent: u8,
        cycle_freq_hz: u32,
        enable: bool,
    ) -> Result<(), PwmError> {
        let range = range_from_cycle_freq(cycle_freq_hz)?;
        let data = duty_data_from_percent(duty_percent, range);
        self.init_channel(channel, data, range, enable)
    }

    /// Updates only the duty cycle of a channel.
    ///
    /// Recomputes the data value against the channel's current range
    /// register and writes the data register alone; the shared control word
    /// is untouched, so the control lock is not taken.
    ///
    /// # Errors
    /// [`PwmError::InvalidRegister`] if a register index fell outside the
    /// mapped block.
    pub fn set_duty_cycle(&self, channel: PwmChannel, duty_percent: u8) -> Result<(), PwmError> {
        let range = self
            .regs
            .read(channel.range_word())
            .ok_or(PwmError::InvalidRegister)?;

        self.regs
            .write(channel.data_word(), duty_data_from_percent(duty_percent, range))
            .ok_or(PwmError::InvalidRegister)
    }

    /// Sets or clears only the enable bit of `channel`.
    ///
    /// # Errors
    /// [`PwmError::InvalidRegister`] if the control word fell outside the
    /// mapped block.
    pub fn enable(&self, channel: PwmChannel, on: bool) -> Result<(), PwmError> {
        self.ctl_lock.lock(|_| {
            let ctl = self.regs.read(CTL_WORD).ok_or(PwmError::InvalidRegister)?;
            let next = if on {
                ctl | channel.enable_bit()
            } else {
                ctl & !channel.enable_bit()
            };

            self.regs
                .write(CTL_WORD, next)
                .ok_or(PwmError::InvalidRegister)
        })
    }

    /// Restores both channels to their power-on defaults.
    ///
    /// Data 0, range 0x20, disabled; invoked at teardown so the hardware is
    /// in a known state for the next owner. Must run while the mapping is
    /// still live.
    ///
    /// # Errors
    /// [`PwmError::InvalidRegister`] if a register index fell outside the
    /// mapped block.
    pub fn reset(&self) -> Result<(), PwmError> {
        self.init_channel(PwmChannel::Channel0, 0, RESET_RANGE, false)?;
        self.init_channel(PwmChannel::Channel1, 0, RESET_RANGE, false)?;
        log::info!("PWM channels reset to power-on defaults");
        Ok(())
    }

    fn init_channel(
        &self,
        channel: PwmChannel,
        data: u32,
        range: u32,
        enable: bool,
    ) -> Result<(), PwmError> {
        self.ctl_lock.lock(|_| {
            let ctl = self.regs.read(CTL_WORD).ok_or(PwmError::InvalidRegister)?;
            self.regs
                .write(CTL_WORD, ctl & !channel.ctl_mask())
                .ok_or(PwmError::InvalidRegister)?;

            self.regs
                .write(channel.data_word(), data)
                .ok_or(PwmError::InvalidRegister)?;
            self.regs
                .write(channel.range_word(), range)
                .ok_or(PwmError::InvalidRegister)?;

            if enable {
                let ctl = self.regs.read(CTL_WORD).ok_or(PwmError::InvalidRegister)?;
                self.regs
                    .write(CTL_WORD, ctl | channel.enable_bit())
                    .ok_or(PwmError::InvalidRegister)?;
            }

            Ok(())
        })
    }
}
