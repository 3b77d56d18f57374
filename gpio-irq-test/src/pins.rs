// Pin and interrupt ownership
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{spawn, JoinHandle},
    time::Duration,
};

use libc::{EBUSY, EINVAL, EIO};
use log::{debug, error, info};
use thiserror::Error as ThisError;

use crate::gpio::{
    self, Direction, GpioDevice, GPIO_IRQ_TYPE_EDGE_BOTH, GPIO_IRQ_TYPE_EDGE_FALLING,
    GPIO_IRQ_TYPE_EDGE_RISING, GPIO_IRQ_TYPE_NONE,
};

/// Longest time the watcher waits for an edge before re-checking whether it
/// was asked to stop.
const WATCH_POLL: Duration = Duration::from_millis(50);

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, ThisError)]
/// Errors related to pin and irq ownership
pub(crate) enum Error {
    #[error("Gpio {0} unavailable: {1}")]
    PinUnavailable(u16, gpio::Error),
    #[error("Gpio {0} configuration failed: {1}")]
    ConfigurationError(u16, gpio::Error),
    #[error("Irq {irq} registration failed: {status}")]
    IrqRegistration { irq: u32, status: i32 },
}

/// Interrupt source resolved from an input line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct IrqLine(u32);

impl IrqLine {
    pub(crate) fn number(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interrupt handler, run on the watcher thread for every sensed edge.
pub(crate) type IrqHandler = Arc<dyn Fn(IrqLine) + Send + Sync>;

/// Negative errno reported for a failed irq (de)registration.
fn irq_status(e: &gpio::Error) -> i32 {
    let errno = match e {
        gpio::Error::GpioLineBusy(_) => EBUSY,
        gpio::Error::GpioIrqTypeNotSupported(_) | gpio::Error::GpioOutOfRange(_) => EINVAL,
        _ => EIO,
    };

    -errno
}

// Claim on a line, freed when dropped.
struct LineClaim<D: GpioDevice> {
    device: Arc<D>,
    gpio: u16,
}

impl<D: GpioDevice> LineClaim<D> {
    fn new(device: &Arc<D>, gpio: u16, consumer: &str) -> Result<Self> {
        device
            .request(gpio, consumer)
            .map_err(|e| Error::PinUnavailable(gpio, e))?;

        Ok(LineClaim {
            device: device.clone(),
            gpio,
        })
    }

    fn configure(&self, dir: Direction, value: u32) -> Result<()> {
        self.device
            .set_direction(self.gpio, dir, value)
            .map_err(|e| Error::ConfigurationError(self.gpio, e))
    }
}

impl<D: GpioDevice> Drop for LineClaim<D> {
    fn drop(&mut self) {
        self.device.free(self.gpio);
        debug!("gpio {} released", self.gpio);
    }
}

/// Owned input line and the interrupt it raises.
///
/// At most one handler can be armed at a time. A registration borrows the
/// pin, so the pin can't be released while a handler is still armed.
pub(crate) struct InputPin<D: GpioDevice> {
    claim: LineClaim<D>,
    irq: IrqLine,
    armed: AtomicBool,
}

/// Claims `gpio`, configures it as input and resolves its interrupt.
///
/// Nothing stays claimed if any step fails.
pub(crate) fn acquire_input_pin<D: GpioDevice>(device: &Arc<D>, gpio: u16) -> Result<InputPin<D>> {
    let claim = LineClaim::new(device, gpio, "irqpin")?;
    claim.configure(Direction::Input, 0)?;

    let irq = device
        .to_irq(gpio)
        .map_err(|e| Error::ConfigurationError(gpio, e))?;

    info!(
        "gpio {} ({}) mapped to irq {}",
        gpio,
        device.gpio_name(gpio).unwrap_or_default(),
        irq
    );

    Ok(InputPin {
        claim,
        irq: IrqLine(irq),
        armed: AtomicBool::new(false),
    })
}

/// Gives up ownership of the input line.
pub(crate) fn release_input_pin<D: GpioDevice>(pin: InputPin<D>) {
    drop(pin)
}

impl<D: GpioDevice> InputPin<D> {
    pub(crate) fn gpio(&self) -> u16 {
        self.claim.gpio
    }

    pub(crate) fn irq_line(&self) -> IrqLine {
        self.irq
    }

    /// Registers `handler` for `trigger` edges on `irq`.
    ///
    /// Fails with a negative errno: `-EBUSY` while another handler is armed,
    /// `-EINVAL` for a foreign irq or a non-edge trigger, `-EIO` if the chip
    /// refuses edge detection.
    pub(crate) fn arm_handler(
        &self,
        irq: IrqLine,
        handler: IrqHandler,
        trigger: u16,
    ) -> Result<IrqRegistration<'_, D>> {
        let failed = |status: i32| Error::IrqRegistration {
            irq: irq.number(),
            status,
        };

        if irq != self.irq {
            return Err(failed(-EINVAL));
        }

        if !matches!(
            trigger,
            GPIO_IRQ_TYPE_EDGE_RISING | GPIO_IRQ_TYPE_EDGE_FALLING | GPIO_IRQ_TYPE_EDGE_BOTH
        ) {
            return Err(failed(-EINVAL));
        }

        if self.armed.swap(true, Ordering::AcqRel) {
            return Err(failed(-EBUSY));
        }

        let device = self.claim.device.clone();
        let gpio = self.gpio();

        if let Err(e) = device.set_irq_type(gpio, trigger) {
            self.armed.store(false, Ordering::Release);
            return Err(failed(irq_status(&e)));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let stop = stop.clone();
            spawn(move || watch(device, gpio, irq, handler, stop))
        };

        debug!("irq {} armed, trigger {}", irq, trigger);

        Ok(IrqRegistration {
            pin: self,
            stop,
            watcher: Some(watcher),
        })
    }
}

// Runs `handler` for every edge sensed on `gpio` until `stop` is raised.
fn watch<D: GpioDevice>(
    device: Arc<D>,
    gpio: u16,
    irq: IrqLine,
    handler: IrqHandler,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        match device.wait_for_interrupt(gpio, WATCH_POLL) {
            Ok(true) => handler(irq),
            Ok(false) => {}
            Err(e) => {
                error!("irq {} watcher stopped: {}", irq, e);
                break;
            }
        }
    }
}

/// Armed interrupt handler. Disarmed by [`disarm_handler`] or on drop.
#[must_use]
pub(crate) struct IrqRegistration<'a, D: GpioDevice> {
    pin: &'a InputPin<D>,
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl<D: GpioDevice> IrqRegistration<'_, D> {
    fn teardown(&mut self) -> Result<()> {
        let Some(watcher) = self.watcher.take() else {
            return Ok(());
        };

        // The handler must not run once disarmed.
        self.stop.store(true, Ordering::Release);
        if watcher.join().is_err() {
            error!("irq {} handler panicked", self.pin.irq);
        }

        let result = self
            .pin
            .claim
            .device
            .set_irq_type(self.pin.gpio(), GPIO_IRQ_TYPE_NONE)
            .map_err(|e| Error::IrqRegistration {
                irq: self.pin.irq.number(),
                status: irq_status(&e),
            });

        self.pin.armed.store(false, Ordering::Release);
        debug!("irq {} disarmed", self.pin.irq);

        result
    }
}

impl<D: GpioDevice> Drop for IrqRegistration<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!("Failed to disarm irq: {}", e);
        }
    }
}

/// Deregisters the handler, the line can be armed again afterwards.
pub(crate) fn disarm_handler<D: GpioDevice>(mut registration: IrqRegistration<'_, D>) -> Result<()> {
    registration.teardown()
}

/// Owned output line, driven low when acquired.
pub(crate) struct OutputPin<D: GpioDevice> {
    claim: LineClaim<D>,
}

pub(crate) fn acquire_output_pin<D: GpioDevice>(device: &Arc<D>, gpio: u16) -> Result<OutputPin<D>> {
    let claim = LineClaim::new(device, gpio, "togglepin")?;
    claim.configure(Direction::Output, 0)?;

    Ok(OutputPin { claim })
}

impl<D: GpioDevice> OutputPin<D> {
    pub(crate) fn gpio(&self) -> u16 {
        self.claim.gpio
    }

    pub(crate) fn set(&self, high: bool) -> gpio::Result<()> {
        self.claim.device.set_value(self.claim.gpio, high.into())
    }
}
