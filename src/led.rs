//! Logical LED devices on top of the GPIO controller
//!
//! Each device owns one output pin and a small state machine (`Off`, `On`,
//! `Blinking`). Commands arrive as raw bytes through [`LedDevice::write`];
//! blinking runs on a background task that is always cancelled and awaited
//! before any other command touches the pin, so at most one blink task per
//! device ever exists.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use heapless::Vec;
use thiserror::Error;

use crate::hal::gpio::{GpioController, GpioError};

/// First GPIO pin dedicated to LED devices.
pub const FIRST_LED_PIN: u32 = 22;

/// Number of LED devices supported.
pub const MAX_LED_DEVICES: usize = 2;

/// Largest accepted command message.
///
/// "toggle" is the longest command at 6 characters, plus room for the NUL
/// terminator a string-style write may append.
pub const MSG_BUF_MAX_SIZE: usize = 7;

/// Toggle interval while blinking: 4 toggles per second.
const BLINK_INTERVAL: Duration = Duration::from_millis(125);

/// Logical state of one LED device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedState {
    /// Output driven low
    Off,
    /// Output driven high
    On,
    /// A background task is toggling the output
    Blinking,
}

impl LedState {
    /// State matching a recorded physical output level.
    fn from_level(is_high: bool) -> Self {
        if is_high {
            LedState::On
        } else {
            LedState::Off
        }
    }
}

/// Commands accepted by [`LedDevice::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedCommand {
    /// Drive the output low
    Off,
    /// Drive the output high
    On,
    /// Invert the recorded output level
    Toggle,
    /// Start the background blink task
    Blink,
}

impl LedCommand {
    /// Parses one raw command message.
    ///
    /// Matching is case-insensitive and each command has a numeric
    /// equivalent: "off"/"0", "on"/"1", "toggle"/"2", "blink"/"3". A
    /// string-style write may carry one trailing NUL byte; a trailing
    /// newline is not accepted.
    ///
    /// # Errors
    /// [`LedError::UnsupportedCommand`] for anything else.
    pub fn parse(message: &[u8]) -> Result<Self, LedError> {
        // Tolerate the NUL terminator a string-style write appends.
        let message = match message {
            [head @ .., 0] => head,
            other => other,
        };

        if message.eq_ignore_ascii_case(b"off") || message == b"0" {
            Ok(Self::Off)
        } else if message.eq_ignore_ascii_case(b"on") || message == b"1" {
            Ok(Self::On)
        } else if message.eq_ignore_ascii_case(b"toggle") || message == b"2" {
            Ok(Self::Toggle)
        } else if message.eq_ignore_ascii_case(b"blink") || message == b"3" {
            Ok(Self::Blink)
        } else {
            Err(LedError::UnsupportedCommand)
        }
    }
}

/// LED device errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedError {
    /// An underlying GPIO operation failed
    #[error("gpio error: {0}")]
    Gpio(#[from] GpioError),
    /// The command message was not recognized
    #[error("unsupported command")]
    UnsupportedCommand,
    /// The command message exceeds the message buffer
    #[error("message to write is too long")]
    MessageTooLong,
    /// Reads are not supported on LED devices
    #[error("operation isn't supported")]
    UnsupportedOperation,
    /// The device ordinal is outside the supported device range
    #[error("no such LED device")]
    InvalidDevice,
    /// The slot is already bound to another device instance
    #[error("LED device slot already in use")]
    SlotInUse,
    /// Device state and blink task bookkeeping disagree
    #[error("internal LED device state inconsistency")]
    Internal,
}

/// State shared between the command context and the blink task.
struct LedCore {
    state: LedState,
    /// Last output level successfully written to the hardware.
    is_output_high: bool,
    /// Error that terminated a blink task, until the next blink starts.
    blink_fault: Option<GpioError>,
}

/// Per-ordinal storage backing one [`LedDevice`].
///
/// Slots are const-constructible so an application can keep one static
/// slot per device ordinal; each slot is claimed by exactly one device
/// instance at a time.
pub struct LedSlot {
    core: Mutex<CriticalSectionRawMutex, RefCell<LedCore>>,
    stop: Signal<CriticalSectionRawMutex, ()>,
    done: Signal<CriticalSectionRawMutex, Result<(), GpioError>>,
    live_blink_tasks: AtomicU32,
    claimed: AtomicBool,
}

impl LedSlot {
    /// Creates an unclaimed slot.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            core: Mutex::new(RefCell::new(LedCore {
                state: LedState::Off,
                is_output_high: false,
                blink_fault: None,
            })),
            stop: Signal::new(),
            done: Signal::new(),
            live_blink_tasks: AtomicU32::new(0),
            claimed: AtomicBool::new(false),
        }
    }
}

impl Default for LedSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the single running blink task of one device.
struct BlinkHandle {
    slot: &'static LedSlot,
}

impl BlinkHandle {
    /// Requests the task to stop and waits until it has fully exited,
    /// including its final output write.
    async fn cancel(self) -> Result<(), GpioError> {
        self.slot.stop.signal(());
        self.slot.done.wait().await
    }
}

/// One logical LED bound to a GPIO output pin.
///
/// Commands are processed synchronously; entering the `Blinking` state
/// spawns one background task that runs until the next command cancels it.
/// Call [`shutdown`](Self::shutdown) before dropping the device so no
/// blink task outlives it.
pub struct LedDevice {
    pin: u32,
    slot: &'static LedSlot,
    gpio: &'static GpioController,
    spawner: Spawner,
    msg_buffer: Vec<u8, MSG_BUF_MAX_SIZE>,
    blink: Option<BlinkHandle>,
}

impl LedDevice {
    /// Creates LED device `index` and configures its pin as an output
    /// driven low.
    ///
    /// # Errors
    /// * [`LedError::InvalidDevice`] - `index` is outside the supported
    ///   device range
    /// * [`LedError::SlotInUse`] - `slot` already backs another device
    /// * [`LedError::Gpio`] - the pin could not be configured as an output
    pub fn new(
        index: usize,
        slot: &'static LedSlot,
        gpio: &'static GpioController,
        spawner: Spawner,
    ) -> Result<Self, LedError> {
        if index >= MAX_LED_DEVICES {
            log::error!("LED device index {index} is out of range!");
            return Err(LedError::InvalidDevice);
        }

        if slot.claimed.swap(true, Ordering::AcqRel) {
            log::error!("LED device slot {index} is already in use!");
            return Err(LedError::SlotInUse);
        }

        let pin = FIRST_LED_PIN + index as u32;

        if let Err(error) = gpio.configure_as_output(pin, false) {
            slot.claimed.store(false, Ordering::Release);
            return Err(error.into());
        }

        slot.core.lock(|core| {
            let mut core = core.borrow_mut();
            core.state = LedState::Off;
            core.is_output_high = false;
            core.blink_fault = None;
        });

        log::info!("LED device {index} initialized on pin {pin}");

        Ok(Self {
            pin,
            slot,
            gpio,
            spawner,
            msg_buffer: Vec::new(),
            blink: None,
        })
    }

    /// Processes one raw command message and returns the number of bytes
    /// accepted.
    ///
    /// An empty message performs no action and accepts zero bytes. Any
    /// running blink task is cancelled and awaited before the command
    /// touches the pin, and an over-length message is rejected before any
    /// state mutation.
    ///
    /// # Errors
    /// * [`LedError::MessageTooLong`] - the message exceeds the buffer
    /// * [`LedError::UnsupportedCommand`] - the message is not a command
    /// * [`LedError::Gpio`] - the output write failed
    /// * [`LedError::Internal`] - state said `Blinking` with no live task
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, LedError> {
        if data.is_empty() {
            return Ok(0);
        }

        self.msg_buffer.clear();
        self.msg_buffer.extend_from_slice(data).map_err(|()| {
            log::error!("length to write is too long! max msg size: {MSG_BUF_MAX_SIZE}");
            LedError::MessageTooLong
        })?;

        let command = LedCommand::parse(&self.msg_buffer)?;
        self.dispatch(command).await?;
        Ok(data.len())
    }

    /// Reading an LED device is not supported.
    ///
    /// # Errors
    /// Always returns [`LedError::UnsupportedOperation`].
    pub fn read(&mut self, _buffer: &mut [u8]) -> Result<usize, LedError> {
        log::error!("sorry, this operation isn't supported");
        Err(LedError::UnsupportedOperation)
    }

    /// Current logical state of the device.
    #[must_use]
    pub fn state(&self) -> LedState {
        self.slot.core.lock(|core| core.borrow().state)
    }

    /// Last output level successfully written to the hardware.
    #[must_use]
    pub fn is_output_high(&self) -> bool {
        self.slot.core.lock(|core| core.borrow().is_output_high)
    }

    /// Error that terminated the last blink task, if any.
    ///
    /// Set when a blink task stops itself on a hardware write failure and
    /// cleared when the next blink starts.
    #[must_use]
    pub fn blink_fault(&self) -> Option<GpioError> {
        self.slot.core.lock(|core| core.borrow().blink_fault)
    }

    /// Number of live blink tasks bound to this device; never exceeds one.
    #[must_use]
    pub fn live_blink_tasks(&self) -> u32 {
        self.slot.live_blink_tasks.load(Ordering::Acquire)
    }

    /// Stops any blink task and drives the output low.
    ///
    /// Teardown path: leaves the device in the `Off` state (unless the
    /// final write failed) with no background task running.
    ///
    /// # Errors
    /// Propagates [`LedError::Gpio`] from the final output write and
    /// [`LedError::Internal`] from blink task bookkeeping.
    pub async fn shutdown(&mut self) -> Result<(), LedError> {
        self.cancel_blink().await?;
        self.set_level(false)?;
        log::info!("LED device on pin {} shut down", self.pin);
        Ok(())
    }

    async fn dispatch(&mut self, command: LedCommand) -> Result<(), LedError> {
        // Stopping the old blink task is a synchronous prefix of every
        // command, so a command never races the task's last register write.
        self.cancel_blink().await?;

        match command {
            LedCommand::Off => self.set_level(false),
            LedCommand::On => self.set_level(true),
            LedCommand::Toggle => {
                let target = !self.is_output_high();
                self.set_level(target)
            }
            LedCommand::Blink => self.start_blink(),
        }
    }

    /// Writes `high` to the pin and records the level and matching state.
    fn set_level(&mut self, high: bool) -> Result<(), LedError> {
        self.gpio.set_output(self.pin, high)?;

        self.slot.core.lock(|core| {
            let mut core = core.borrow_mut();
            core.is_output_high = high;
            core.state = LedState::from_level(high);
        });

        Ok(())
    }

    fn start_blink(&mut self) -> Result<(), LedError> {
        self.slot.stop.reset();
        self.slot.done.reset();
        self.slot.core.lock(|core| core.borrow_mut().blink_fault = None);

        self.slot.live_blink_tasks.fetch_add(1, Ordering::AcqRel);

        if self
            .spawner
            .spawn(blink_task(self.pin, self.gpio, self.slot))
            .is_err()
        {
            self.slot.live_blink_tasks.fetch_sub(1, Ordering::AcqRel);
            log::error!("failed to start blink task for pin {}!", self.pin);
            return Err(LedError::Internal);
        }

        self.slot.core.lock(|core| core.borrow_mut().state = LedState::Blinking);
        self.blink = Some(BlinkHandle { slot: self.slot });
        Ok(())
    }

    /// Stops the running blink task, if any, and waits for it to finish
    /// its final output write. Idempotent when nothing is blinking.
    async fn cancel_blink(&mut self) -> Result<(), LedError> {
        if self.state() != LedState::Blinking {
            return Ok(());
        }

        let Some(handle) = self.blink.take() else {
            log::error!("LED device in the blink state without a blink task!");
            return Err(LedError::Internal);
        };

        // The task records its own outcome in the slot; a failed final
        // write shows up in the recorded state and blink fault.
        let _ = handle.cancel().await;
        Ok(())
    }
}

impl Drop for LedDevice {
    fn drop(&mut self) {
        self.slot.claimed.store(false, Ordering::Release);
    }
}

/// Background toggling task for one device.
#[embassy_executor::task(pool_size = MAX_LED_DEVICES)]
async fn blink_task(pin: u32, gpio: &'static GpioController, slot: &'static LedSlot) {
    let outcome = blink_loop(pin, gpio, slot).await;

    if let Err(error) = outcome {
        log::error!("blink task for pin {pin} stopped: {error}");
    }

    slot.live_blink_tasks.fetch_sub(1, Ordering::AcqRel);
    slot.done.signal(outcome);
}

/// Toggles the pin every [`BLINK_INTERVAL`] until a stop is requested or a
/// hardware write fails. The state recorded in the slot always reflects the
/// last successful output write.
async fn blink_loop(
    pin: u32,
    gpio: &'static GpioController,
    slot: &'static LedSlot,
) -> Result<(), GpioError> {
    loop {
        let target = !slot.core.lock(|core| core.borrow().is_output_high);

        if let Err(error) = gpio.set_output(pin, target) {
            // The toggle failed; the device keeps the state of the last
            // successful write instead of being forced back to Off.
            slot.core.lock(|core| {
                let mut core = core.borrow_mut();
                core.state = LedState::from_level(core.is_output_high);
                core.blink_fault = Some(error);
            });
            return Err(error);
        }

        slot.core.lock(|core| core.borrow_mut().is_output_high = target);

        // Interruptible sleep: a stop request must not wait out the full
        // interval.
        if let Either::First(()) = select(slot.stop.wait(), Timer::after(BLINK_INTERVAL)).await {
            break;
        }
    }

    // Try to leave the LED off on the way out; only claim Off if the write
    // actually took effect.
    let result = gpio.set_output(pin, false);

    slot.core.lock(|core| {
        let mut core = core.borrow_mut();
        match result {
            Ok(()) => core.is_output_high = false,
            Err(error) => core.blink_fault = Some(error),
        }
        core.state = LedState::from_level(core.is_output_high);
    });

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mmio::RegisterBlock;
    use crate::hal::GPIO_SIZE;
    use embassy_executor::Executor;
    use std::boxed::Box;
    use std::sync::mpsc;
    use std::time::Duration as StdDuration;

    const GPSET_WORD: usize = 0x1C / 4;
    const GPCLR_WORD: usize = 0x28 / 4;

    #[test]
    fn parse_accepts_all_command_spellings() {
        for message in [&b"off"[..], b"OFF", b"Off", b"0", b"off\0", b"0\0"] {
            assert_eq!(LedCommand::parse(message), Ok(LedCommand::Off));
        }
        for message in [&b"on"[..], b"ON", b"1"] {
            assert_eq!(LedCommand::parse(message), Ok(LedCommand::On));
        }
        for message in [&b"toggle"[..], b"TOGGLE", b"Toggle", b"2", b"toggle\0"] {
            assert_eq!(LedCommand::parse(message), Ok(LedCommand::Toggle));
        }
        for message in [&b"blink"[..], b"BLINK", b"3"] {
            assert_eq!(LedCommand::parse(message), Ok(LedCommand::Blink));
        }
    }

    #[test]
    fn parse_rejects_everything_else() {
        for message in [&b"banana"[..], b"of", b"onn", b"4", b"on\n", b"\0", b"togglee"] {
            assert_eq!(
                LedCommand::parse(message),
                Err(LedError::UnsupportedCommand),
                "{message:?} was accepted"
            );
        }
    }

    fn leak_gpio() -> (&'static GpioController, *mut u32) {
        let base = Box::leak(Box::new([0u32; GPIO_SIZE / 4])).as_mut_ptr();
        let regs = unsafe { RegisterBlock::map(base, GPIO_SIZE) }.unwrap();
        (Box::leak(Box::new(GpioController::new(regs))), base)
    }

    fn read_word(base: *mut u32, word: usize) -> u32 {
        unsafe { base.add(word).read_volatile() }
    }

    fn clear_word(base: *mut u32, word: usize) {
        unsafe { base.add(word).write_volatile(0) };
    }

    fn run_scenario(rx: mpsc::Receiver<()>) {
        rx.recv_timeout(StdDuration::from_secs(30))
            .expect("scenario did not finish");
    }

    #[embassy_executor::task]
    async fn command_semantics_scenario(spawner: Spawner, finished: mpsc::Sender<()>) {
        let (gpio, base) = leak_gpio();
        let slot = Box::leak(Box::new(LedSlot::new()));
        let mut device = LedDevice::new(0, slot, gpio, spawner).unwrap();

        // Freshly created: off, pin driven low.
        assert_eq!(device.state(), LedState::Off);
        assert!(!device.is_output_high());
        assert_eq!(read_word(base, GPCLR_WORD), 1 << 22);

        // "ON" and "1" are equivalent; bytes accepted equals message length.
        assert_eq!(device.write(b"ON").await.unwrap(), 2);
        assert_eq!(device.state(), LedState::On);
        assert!(device.is_output_high());
        assert_eq!(read_word(base, GPSET_WORD), 1 << 22);

        // Toggle flips the recorded level.
        clear_word(base, GPCLR_WORD);
        assert_eq!(device.write(b"toggle").await.unwrap(), 6);
        assert_eq!(device.state(), LedState::Off);
        assert!(!device.is_output_high());
        assert_eq!(read_word(base, GPCLR_WORD), 1 << 22);

        assert_eq!(device.write(b"2").await.unwrap(), 1);
        assert_eq!(device.state(), LedState::On);

        // Unsupported commands leave the device untouched.
        assert_eq!(
            device.write(b"banana").await,
            Err(LedError::UnsupportedCommand)
        );
        assert_eq!(device.state(), LedState::On);

        // Over-length input is rejected before anything happens.
        assert_eq!(
            device.write(b"toggled!").await,
            Err(LedError::MessageTooLong)
        );
        assert_eq!(device.state(), LedState::On);

        // Empty input accepts zero bytes and does nothing.
        assert_eq!(device.write(b"").await.unwrap(), 0);
        assert_eq!(device.state(), LedState::On);

        // Reads are not supported.
        let mut buffer = [0u8; 4];
        assert_eq!(
            device.read(&mut buffer),
            Err(LedError::UnsupportedOperation)
        );

        assert_eq!(device.write(b"off\0").await.unwrap(), 4);
        assert_eq!(device.state(), LedState::Off);

        finished.send(()).unwrap();
    }

    #[test]
    fn command_semantics() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| spawner.must_spawn(command_semantics_scenario(spawner, tx)));
        });
        run_scenario(rx);
    }

    #[embassy_executor::task]
    async fn blink_lifecycle_scenario(spawner: Spawner, finished: mpsc::Sender<()>) {
        let (gpio, base) = leak_gpio();
        let slot = Box::leak(Box::new(LedSlot::new()));
        let mut device = LedDevice::new(1, slot, gpio, spawner).unwrap();

        // Blink starts exactly one background task.
        assert_eq!(device.write(b"blink").await.unwrap(), 5);
        assert_eq!(device.state(), LedState::Blinking);
        assert_eq!(device.live_blink_tasks(), 1);

        // Let it toggle a few times; still exactly one task.
        Timer::after(Duration::from_millis(300)).await;
        assert_eq!(device.live_blink_tasks(), 1);
        assert_eq!(device.state(), LedState::Blinking);

        // A second blink cancels the first task before starting its own.
        assert_eq!(device.write(b"3").await.unwrap(), 1);
        assert_eq!(device.live_blink_tasks(), 1);
        Timer::after(Duration::from_millis(200)).await;
        assert_eq!(device.live_blink_tasks(), 1);

        // Off cancels the task, waits it out and drives the pin low.
        clear_word(base, GPCLR_WORD);
        assert_eq!(device.write(b"off").await.unwrap(), 3);
        assert_eq!(device.state(), LedState::Off);
        assert_eq!(device.live_blink_tasks(), 0);
        assert!(!device.is_output_high());
        assert_eq!(read_word(base, GPCLR_WORD), 1 << 23);
        assert_eq!(device.blink_fault(), None);

        // Blink followed immediately by off must not leave a task behind,
        // regardless of where the toggle cycle was.
        assert_eq!(device.write(b"blink").await.unwrap(), 5);
        assert_eq!(device.write(b"off").await.unwrap(), 3);
        assert_eq!(device.state(), LedState::Off);
        assert_eq!(device.live_blink_tasks(), 0);
        assert!(!device.is_output_high());

        // Blink then toggle: the task is gone and the level flips once.
        assert_eq!(device.write(b"blink").await.unwrap(), 5);
        assert_eq!(device.write(b"toggle").await.unwrap(), 6);
        assert_eq!(device.state(), LedState::On);
        assert_eq!(device.live_blink_tasks(), 0);

        device.shutdown().await.unwrap();
        assert_eq!(device.state(), LedState::Off);
        assert_eq!(device.live_blink_tasks(), 0);

        finished.send(()).unwrap();
    }

    #[test]
    fn blink_lifecycle() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| spawner.must_spawn(blink_lifecycle_scenario(spawner, tx)));
        });
        run_scenario(rx);
    }

    #[embassy_executor::task]
    async fn device_slot_scenario(spawner: Spawner, finished: mpsc::Sender<()>) {
        let (gpio, _base) = leak_gpio();
        let slot = Box::leak(Box::new(LedSlot::new()));

        // Out-of-range ordinals are rejected before the slot is touched.
        assert!(matches!(
            LedDevice::new(MAX_LED_DEVICES, slot, gpio, spawner),
            Err(LedError::InvalidDevice)
        ));

        let device = LedDevice::new(0, slot, gpio, spawner).unwrap();

        // The slot is bound to one device at a time.
        assert!(matches!(
            LedDevice::new(0, slot, gpio, spawner),
            Err(LedError::SlotInUse)
        ));

        // Dropping the device releases the slot.
        drop(device);
        assert!(LedDevice::new(0, slot, gpio, spawner).is_ok());

        finished.send(()).unwrap();
    }

    #[test]
    fn device_slots_are_single_owner() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| spawner.must_spawn(device_slot_scenario(spawner, tx)));
        });
        run_scenario(rx);
    }
}
