//! # BCM2837 LED Driver
//!
//! A memory-mapped GPIO and PWM control layer for the BCM2837 SoC
//! (Raspberry Pi 3 family), exposed as small stateful logical devices.
//!
//! The crate provides:
//! - Register-block mapping with exclusive ownership per peripheral range
//! - GPIO function multiplexing and output control
//! - Two-channel PWM configuration with duty-cycle/frequency math
//! - Logical LED devices with on/off/toggle/blink command processing and a
//!   cancellable background blink task
//!
//! ## Features
//!
//! - `defmt`: Derive `defmt::Format` on the public enums for target-side
//!   logging
//!
//! ## Example
//!
//! ```rust,ignore
//! use bcm2837_led_driver::hal::{self, GpioController, PwmController, RegisterBlock};
//!
//! // Map the fixed peripheral windows once at startup. Each block is owned
//! // by exactly one controller; a mapping failure is fatal to that
//! // peripheral's availability.
//! let gpio_regs = unsafe { RegisterBlock::map(hal::GPIO_BASE as *mut u32, hal::GPIO_SIZE) }?;
//! let gpio = GpioController::new(gpio_regs);
//!
//! let pwm_regs = unsafe { RegisterBlock::map(hal::PWM_BASE as *mut u32, hal::PWM_SIZE) }?;
//! let pwm = PwmController::new(pwm_regs);
//!
//! gpio.configure_as_output(22, false)?;
//! gpio.set_output(22, true)?;
//!
//! // 25% duty at the supported 4 kHz cycle rate.
//! let channel = gpio.configure_as_pwm(18)?;
//! pwm.configure_channel(channel, 25, 4_000, true)?;
//! ```

#![no_std]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]

#[cfg(test)]
extern crate std;

pub mod hal;

// Re-export the logical device layer
pub use led::{LedCommand, LedDevice, LedError, LedSlot, LedState};

// Re-export HAL components for advanced users
pub use hal::{
    gpio::{GpioController, GpioError, PinFunction},
    mmio::{MapError, RegisterBlock},
    pwm::{PwmChannel, PwmController, PwmError},
};

mod led;
