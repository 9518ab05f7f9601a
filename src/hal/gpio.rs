//! GPIO controller for BCM2837
//!
//! Validates pin numbers, multiplexes each pin's function and drives output
//! levels for the usable GPIO pins on the Raspberry Pi 3 family.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use thiserror::Error;

use super::mmio::RegisterBlock;
use super::pwm::PwmChannel;

/// GPIO function select register offset (bytes)
const GPFSEL_OFFSET: usize = 0x00;

/// GPIO pin output set register offset (bytes)
const GPSET_OFFSET: usize = 0x1C;

/// GPIO pin output clear register offset (bytes)
const GPCLR_OFFSET: usize = 0x28;

/// GPIO pin level register offset (bytes)
const GPLEV_OFFSET: usize = 0x2C;

/// Lowest usable GPIO pin (inclusive)
pub const MIN_PIN: u32 = 2;

/// Highest usable GPIO pin (inclusive)
pub const MAX_PIN: u32 = 27;

/// Each GPFSEL register holds the function select fields for 10 pins.
const PINS_PER_FSEL_REG: u32 = 10;

/// Each GPFSEL field is 3 bits wide.
const FSEL_FIELD_WIDTH: u32 = 3;
const FSEL_FIELD_MASK: u32 = 0b111;

/// Highest GPFSEL register index a usable pin can land in.
const FSEL_MAX_REG: usize = (MAX_PIN / PINS_PER_FSEL_REG) as usize;

/// GPIO pin function modes
///
/// The discriminant is the 3-bit function select code written to the
/// hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinFunction {
    /// Plain input
    Input = 0b000,
    /// Plain output
    Output = 0b001,
    /// Alternate function 0
    Alt0 = 0b100,
    /// Alternate function 1
    Alt1 = 0b101,
    /// Alternate function 2
    Alt2 = 0b110,
    /// Alternate function 3
    Alt3 = 0b111,
    /// Alternate function 4
    Alt4 = 0b011,
    /// Alternate function 5
    Alt5 = 0b010,
}

/// GPIO controller errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GpioError {
    /// The pin is outside the usable pin range
    #[error("GPIO pin provided is outside valid pin range")]
    InvalidPin,
    /// The pin cannot provide the requested function
    #[error("GPIO function provided is not valid")]
    InvalidFunction,
    /// A computed register index fell outside the mapped block
    #[error("tried to access an invalid register")]
    InvalidRegister,
}

/// GPIO controller for BCM2837
///
/// Owns the mapped GPIO register block. Function select updates are
/// serialized through an internal lock because ten pins share each GPFSEL
/// word; output set/clear writes are single-bit writes to dedicated
/// registers and take no lock.
pub struct GpioController {
    regs: RegisterBlock,
    fsel_lock: Mutex<CriticalSectionRawMutex, ()>,
}

impl GpioController {
    /// Creates a GPIO controller over a successfully mapped register block.
    #[must_use]
    pub fn new(regs: RegisterBlock) -> Self {
        log::info!("GPIO controller initialized");
        Self {
            regs,
            fsel_lock: Mutex::new(()),
        }
    }

    /// Whether `pin` is inside the usable pin range of the board.
    #[must_use]
    pub fn is_valid_pin(pin: u32) -> bool {
        (MIN_PIN..=MAX_PIN).contains(&pin)
    }

    /// Sets the function select field of `pin` to `function`.
    ///
    /// The field update is a read-modify-write on the GPFSEL word shared
    /// with nine other pins; the other fields in the word are preserved.
    /// The whole sequence holds the function select lock.
    ///
    /// # Errors
    /// * [`GpioError::InvalidPin`] - `pin` is outside the usable range
    /// * [`GpioError::InvalidRegister`] - the computed register index is
    ///   outside the mapped block
    pub fn set_pin_function(&self, pin: u32, function: PinFunction) -> Result<(), GpioError> {
        if !Self::is_valid_pin(pin) {
            log::error!("GPIO pin {pin} is outside the valid pin range!");
            return Err(GpioError::InvalidPin);
        }

        let reg_index = (pin / PINS_PER_FSEL_REG) as usize;

        // Even though the pin number was verified above, re-check the
        // computed index so only valid GPFSEL registers are accessed.
        if reg_index > FSEL_MAX_REG {
            log::error!("tried to access an invalid register during function select of pin {pin}!");
            return Err(GpioError::InvalidRegister);
        }

        let word = GPFSEL_OFFSET / 4 + reg_index;
        let field_shift = (pin % PINS_PER_FSEL_REG) * FSEL_FIELD_WIDTH;

        self.fsel_lock.lock(|_| {
            let current = self.regs.read(word).ok_or(GpioError::InvalidRegister)?;
            let cleared = current & !(FSEL_FIELD_MASK << field_shift);
            self.regs
                .write(word, cleared | ((function as u32) << field_shift))
                .ok_or(GpioError::InvalidRegister)
        })
    }

    /// Drives `pin` high or low.
    ///
    /// Writes a single bit to the set or clear register picked by `high`.
    /// All usable pins fit in the first register of each direction, and the
    /// write does not disturb other pins, so no lock is taken.
    ///
    /// # Errors
    /// * [`GpioError::InvalidPin`] - `pin` is outside the usable range
    /// * [`GpioError::InvalidRegister`] - the register is outside the
    ///   mapped block
    pub fn set_output(&self, pin: u32, high: bool) -> Result<(), GpioError> {
        if !Self::is_valid_pin(pin) {
            log::error!("GPIO pin {pin} is outside the valid pin range!");
            return Err(GpioError::InvalidPin);
        }

        let offset = if high { GPSET_OFFSET } else { GPCLR_OFFSET };
        self.regs
            .write(offset / 4, 1 << pin)
            .ok_or(GpioError::InvalidRegister)
    }

    /// Configures `pin` as an output already driven to `initially_high`.
    ///
    /// The level is written first so the pin is at its initial value the
    /// moment it switches over to an output.
    ///
    /// # Errors
    /// Propagates the errors of [`set_output`](Self::set_output) and
    /// [`set_pin_function`](Self::set_pin_function).
    pub fn configure_as_output(&self, pin: u32, initially_high: bool) -> Result<(), GpioError> {
        self.set_output(pin, initially_high)?;
        self.set_pin_function(pin, PinFunction::Output)
    }

    /// Reads the current electrical level of `pin`.
    ///
    /// # Errors
    /// * [`GpioError::InvalidPin`] - `pin` is outside the usable range
    /// * [`GpioError::InvalidRegister`] - the level register is outside the
    ///   mapped block
    pub fn read_level(&self, pin: u32) -> Result<bool, GpioError> {
        if !Self::is_valid_pin(pin) {
            log::error!("GPIO pin {pin} is outside the valid pin range!");
            return Err(GpioError::InvalidPin);
        }

        let value = self
            .regs
            .read(GPLEV_OFFSET / 4)
            .ok_or(GpioError::InvalidRegister)?;
        Ok(value & (1 << pin) != 0)
    }

    /// PWM channel `pin` can drive, if any.
    #[must_use]
    pub fn pwm_capability(pin: u32) -> Option<PwmChannel> {
        match pin {
            12 | 18 => Some(PwmChannel::Channel0),
            13 | 19 => Some(PwmChannel::Channel1),
            _ => None,
        }
    }

    /// Alternate function that routes the PWM peripheral to `pin`, if any.
    #[must_use]
    pub fn pwm_alt_function(pin: u32) -> Option<PinFunction> {
        match pin {
            12 | 13 => Some(PinFunction::Alt0),
            18 | 19 => Some(PinFunction::Alt5),
            _ => None,
        }
    }

    /// Routes the PWM peripheral to `pin` and returns the channel it drives.
    ///
    /// # Errors
    /// * [`GpioError::InvalidPin`] - `pin` is not PWM-capable
    /// * [`GpioError::InvalidFunction`] - no alternate function routes PWM
    ///   to `pin`
    /// * [`GpioError::InvalidRegister`] - propagated from the function
    ///   select update
    pub fn configure_as_pwm(&self, pin: u32) -> Result<PwmChannel, GpioError> {
        let channel = Self::pwm_capability(pin).ok_or(GpioError::InvalidPin)?;
        let function = Self::pwm_alt_function(pin).ok_or_else(|| {
            log::error!("no PWM alternate function for pin {pin}!");
            GpioError::InvalidFunction
        })?;

        self.set_pin_function(pin, function)?;
        Ok(channel)
    }
}
