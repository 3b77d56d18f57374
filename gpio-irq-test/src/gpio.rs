// GPIO line access
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use libgpiod::{chip, line, request, Error as LibGpiodError};
use thiserror::Error as ThisError;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, ThisError)]
/// Errors related to low level gpio helpers
pub(crate) enum Error {
    #[error("Invalid gpio count: {0}")]
    GpioCountInvalid(u32),
    #[error("Gpio {0} out of range")]
    GpioOutOfRange(u16),
    #[error("Invalid gpio value: {0}")]
    GpioValueInvalid(u32),
    #[error("Gpio {0} already in use")]
    GpioLineBusy(u16),
    #[error("Gpio {0} not requested")]
    GpioLineNotRequested(u16),
    #[error("Gpiod operation failed {0:?}")]
    GpiodFailed(LibGpiodError),
    #[error("Gpio irq type not supported {0}")]
    GpioIrqTypeNotSupported(u16),
    #[error("Gpio irq not enabled yet")]
    GpioIrqNotEnabled,
    #[cfg(test)]
    #[error("Gpio test Operation failed {0}")]
    GpioOperationFailed(&'static str),
}

// Irq trigger types

pub(crate) const GPIO_IRQ_TYPE_NONE: u16 = 0x00;
pub(crate) const GPIO_IRQ_TYPE_EDGE_RISING: u16 = 0x01;
pub(crate) const GPIO_IRQ_TYPE_EDGE_FALLING: u16 = 0x02;
pub(crate) const GPIO_IRQ_TYPE_EDGE_BOTH: u16 =
    GPIO_IRQ_TYPE_EDGE_RISING | GPIO_IRQ_TYPE_EDGE_FALLING;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Input,
    Output,
}

/// Trait that represents a GPIO chip.
///
/// All operations address a line by its offset on the chip. A line must be
/// claimed with `request()` before it can be configured, driven or used as an
/// interrupt source, and stays claimed until `free()`.
///
/// The trait exists so the test protocol can run against a simulated chip
/// without the need of a physical board.
pub(crate) trait GpioDevice: Send + Sync + 'static {
    fn open(device: u32) -> Result<Self>
    where
        Self: Sized;

    fn num_gpios(&self) -> Result<u16>;
    fn gpio_name(&self, gpio: u16) -> Result<String>;

    fn request(&self, gpio: u16, consumer: &str) -> Result<()>;
    fn free(&self, gpio: u16);
    fn set_direction(&self, gpio: u16, dir: Direction, value: u32) -> Result<()>;
    fn to_irq(&self, gpio: u16) -> Result<u32>;
    fn set_value(&self, gpio: u16, value: u32) -> Result<()>;

    fn set_irq_type(&self, gpio: u16, value: u16) -> Result<()>;
    fn wait_for_interrupt(&self, gpio: u16, timeout: Duration) -> Result<bool>;
}

pub(crate) struct PhysLineState {
    // See wait_for_interrupt() for explanation of Arc.
    request: Option<Arc<Mutex<request::Request>>>,
    buffer: Option<request::Buffer>,
}

pub(crate) struct PhysDevice {
    chip: Mutex<chip::Chip>,
    ngpio: u16,
    state: Vec<Mutex<PhysLineState>>,
}

impl PhysDevice {
    fn line_state(&self, gpio: u16) -> Result<&Mutex<PhysLineState>> {
        self.state
            .get(gpio as usize)
            .ok_or(Error::GpioOutOfRange(gpio))
    }

    fn line_config(gpio: u16, lsettings: line::Settings) -> Result<line::Config> {
        let mut lconfig = line::Config::new().map_err(Error::GpiodFailed)?;
        lconfig
            .add_line_settings(&[gpio as u32], lsettings)
            .map_err(Error::GpiodFailed)?;

        Ok(lconfig)
    }
}

fn request_failure(gpio: u16, e: LibGpiodError, in_use: bool) -> Error {
    if in_use {
        Error::GpioLineBusy(gpio)
    } else {
        Error::GpiodFailed(e)
    }
}

impl GpioDevice for PhysDevice {
    fn open(device: u32) -> Result<Self>
    where
        Self: Sized,
    {
        let path = format!("/dev/gpiochip{device}");
        let chip = chip::Chip::open(&path).map_err(Error::GpiodFailed)?;
        let num_lines = chip.info().map_err(Error::GpiodFailed)?.num_lines();
        let ngpio =
            u16::try_from(num_lines).map_err(|_| Error::GpioCountInvalid(num_lines as u32))?;

        let mut state: Vec<Mutex<PhysLineState>> = Vec::new();
        state.resize_with(ngpio as usize, || {
            Mutex::new(PhysLineState {
                request: None,
                buffer: None,
            })
        });

        Ok(PhysDevice {
            chip: Mutex::new(chip),
            ngpio,
            state,
        })
    }

    fn num_gpios(&self) -> Result<u16> {
        Ok(self.ngpio)
    }

    fn gpio_name(&self, gpio: u16) -> Result<String> {
        let line_info = self
            .chip
            .lock()
            .unwrap()
            .line_info(gpio.into())
            .map_err(Error::GpiodFailed)?;

        Ok(line_info.name().unwrap_or("").to_string())
    }

    fn request(&self, gpio: u16, consumer: &str) -> Result<()> {
        let mut state = self.line_state(gpio)?.lock().unwrap();
        if state.request.is_some() {
            return Err(Error::GpioLineBusy(gpio));
        }

        let chip = self.chip.lock().unwrap();

        // Claimed by another consumer, possibly in another process.
        if chip
            .line_info(gpio.into())
            .map_err(Error::GpiodFailed)?
            .is_used()
        {
            return Err(Error::GpioLineBusy(gpio));
        }

        // Claim the line as-is, direction is configured separately.
        let lsettings = line::Settings::new().map_err(Error::GpiodFailed)?;
        let lconfig = Self::line_config(gpio, lsettings)?;

        let mut rconfig = request::Config::new().map_err(Error::GpiodFailed)?;
        rconfig.set_consumer(consumer).map_err(Error::GpiodFailed)?;

        let request = chip.request_lines(Some(&rconfig), &lconfig).map_err(|e| {
            // Busy only if another consumer got the line first.
            let in_use = chip
                .line_info(gpio.into())
                .map(|info| info.is_used())
                .unwrap_or(false);
            request_failure(gpio, e, in_use)
        })?;

        state.request = Some(Arc::new(Mutex::new(request)));

        Ok(())
    }

    fn free(&self, gpio: u16) {
        if let Ok(state) = self.line_state(gpio) {
            let mut state = state.lock().unwrap();
            state.buffer = None;
            state.request = None;
        }
    }

    fn set_direction(&self, gpio: u16, dir: Direction, value: u32) -> Result<()> {
        let mut lsettings = line::Settings::new().map_err(Error::GpiodFailed)?;
        let state = self.line_state(gpio)?.lock().unwrap();
        let request = state
            .request
            .as_ref()
            .ok_or(Error::GpioLineNotRequested(gpio))?;

        match dir {
            Direction::Input => {
                lsettings
                    .set_direction(line::Direction::Input)
                    .map_err(Error::GpiodFailed)?;
            }
            Direction::Output => {
                let value = line::Value::new(value as i32).map_err(Error::GpiodFailed)?;
                lsettings
                    .set_direction(line::Direction::Output)
                    .map_err(Error::GpiodFailed)?
                    .set_output_value(value)
                    .map_err(Error::GpiodFailed)?;
            }
        };

        let lconfig = Self::line_config(gpio, lsettings)?;
        request
            .lock()
            .unwrap()
            .reconfigure_lines(&lconfig)
            .map_err(Error::GpiodFailed)?;

        Ok(())
    }

    fn to_irq(&self, gpio: u16) -> Result<u32> {
        let state = self.line_state(gpio)?.lock().unwrap();

        // Edge events are delivered through the line request, the line offset
        // is what identifies the interrupt source.
        if state.request.is_none() {
            return Err(Error::GpioLineNotRequested(gpio));
        }

        Ok(gpio.into())
    }

    fn set_value(&self, gpio: u16, value: u32) -> Result<()> {
        if value > 1 {
            return Err(Error::GpioValueInvalid(value));
        }

        let state = self.line_state(gpio)?.lock().unwrap();
        let request = state
            .request
            .as_ref()
            .ok_or(Error::GpioLineNotRequested(gpio))?;

        let value = line::Value::new(value as i32).map_err(Error::GpiodFailed)?;
        request
            .lock()
            .unwrap()
            .set_value(gpio as u32, value)
            .map_err(Error::GpiodFailed)?;

        Ok(())
    }

    fn set_irq_type(&self, gpio: u16, value: u16) -> Result<()> {
        let mut state = self.line_state(gpio)?.lock().unwrap();

        let edge = match value {
            GPIO_IRQ_TYPE_EDGE_RISING => Some(line::Edge::Rising),
            GPIO_IRQ_TYPE_EDGE_FALLING => Some(line::Edge::Falling),
            GPIO_IRQ_TYPE_EDGE_BOTH => Some(line::Edge::Both),
            GPIO_IRQ_TYPE_NONE => None,

            // Only edge IRQs are supported.
            _ => return Err(Error::GpioIrqTypeNotSupported(value)),
        };

        if state.request.is_none() {
            return Err(Error::GpioLineNotRequested(gpio));
        }

        let mut lsettings = line::Settings::new().map_err(Error::GpiodFailed)?;
        lsettings
            .set_direction(line::Direction::Input)
            .map_err(Error::GpiodFailed)?
            .set_edge_detection(edge)
            .map_err(Error::GpiodFailed)?;
        let lconfig = Self::line_config(gpio, lsettings)?;

        // A single event is consumed per wait_for_interrupt() call.
        state.buffer = match edge {
            Some(_) => Some(request::Buffer::new(1).map_err(Error::GpiodFailed)?),
            None => None,
        };

        // Callers stop waiting on the line before changing its irq type, the
        // state lock is taken before the request lock here and after it in
        // wait_for_interrupt().
        state
            .request
            .as_ref()
            .ok_or(Error::GpioLineNotRequested(gpio))?
            .lock()
            .unwrap()
            .reconfigure_lines(&lconfig)
            .map_err(Error::GpiodFailed)?;

        Ok(())
    }

    fn wait_for_interrupt(&self, gpio: u16, timeout: Duration) -> Result<bool> {
        // The `request` is shared through an Arc so the state lock is not held
        // while waiting. Disabling the interrupt only needs the state lock to
        // drop the `buffer`, an event sensed afterwards is then reported as an
        // error instead of being read into freed memory.

        // Take the state lock, get the request and release the state lock again
        let request = {
            let state = self.line_state(gpio)?.lock().unwrap();
            state
                .request
                .as_ref()
                .ok_or(Error::GpioIrqNotEnabled)?
                .clone()
        };

        // Only take the request lock now
        let request = request.lock().unwrap();

        if !request
            .wait_edge_events(Some(timeout))
            .map_err(Error::GpiodFailed)?
        {
            return Ok(false);
        }

        // The interrupt has already occurred, we can lock the state again.
        let mut state = self.line_state(gpio)?.lock().unwrap();
        if let Some(buffer) = &mut state.buffer {
            request
                .read_edge_events(buffer)
                .map_err(Error::GpiodFailed)?;

            Ok(true)
        } else {
            Err(Error::GpioIrqNotEnabled)
        }
    }
}
