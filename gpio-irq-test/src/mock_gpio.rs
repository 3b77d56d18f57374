// Simulated GPIO chip
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use log::{info, trace};

use crate::gpio::{
    Direction, Error, GpioDevice, Result, GPIO_IRQ_TYPE_EDGE_FALLING, GPIO_IRQ_TYPE_EDGE_RISING,
    GPIO_IRQ_TYPE_NONE,
};

/// First irq number handed out by the simulated chip, line N maps to
/// `MOCK_IRQ_BASE + N`.
pub(crate) const MOCK_IRQ_BASE: u32 = 64;

#[derive(Debug, Copy, Clone, Default)]
struct MockLineState {
    requested: bool,
    dir: Option<Direction>,
    val: u8,
    irq_type: u16,
    pending: u32,
}

/// Operations that reached the simulated hardware, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MockEvent {
    Request(u16),
    Free(u16),
    SetDirection(u16, Direction),
    SetValue(u16, u32),
    SetIrqType(u16, u16),
}

#[derive(Debug)]
pub(crate) struct MockGpioDevice {
    ngpio: u16,
    pub(crate) gpio_names: Vec<String>,
    state: Mutex<Vec<MockLineState>>,
    irq_raised: Condvar,
    // (output, input) pairs wired together on the simulated board.
    jumpers: Vec<(u16, u16)>,
    events: Mutex<Vec<MockEvent>>,
    pub(crate) request_result: Result<()>,
    pub(crate) set_direction_result: Result<()>,
    pub(crate) to_irq_result: Result<u32>,
    pub(crate) set_value_result: Result<()>,
    pub(crate) set_irq_type_result: Result<()>,
    pub(crate) wait_for_irq_result: Result<bool>,
}

impl MockGpioDevice {
    pub(crate) fn new(ngpio: u16) -> Self {
        let mut gpio_names = Vec::with_capacity(ngpio.into());
        for i in 0..ngpio {
            gpio_names.push(format!("dummy{}", i));
        }

        Self {
            ngpio,
            gpio_names,
            state: Mutex::new(vec![MockLineState::default(); ngpio.into()]),
            irq_raised: Condvar::new(),
            jumpers: Vec::new(),
            events: Mutex::new(Vec::new()),
            request_result: Ok(()),
            set_direction_result: Ok(()),
            to_irq_result: Ok(0),
            set_value_result: Ok(()),
            set_irq_type_result: Ok(()),
            wait_for_irq_result: Ok(true),
        }
    }

    /// Wires `output` to `input`, edges driven on `output` are sensed on
    /// `input`.
    pub(crate) fn with_jumper(mut self, output: u16, input: u16) -> Self {
        info!("jumper gpio {} -> gpio {}", output, input);
        self.jumpers.push((output, input));
        self
    }
}

#[cfg(test)]
impl MockGpioDevice {
    pub(crate) fn events(&self) -> Vec<MockEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn is_requested(&self, gpio: u16) -> bool {
        self.state.lock().unwrap()[gpio as usize].requested
    }

    pub(crate) fn irq_type(&self, gpio: u16) -> u16 {
        self.state.lock().unwrap()[gpio as usize].irq_type
    }

    pub(crate) fn value(&self, gpio: u16) -> u8 {
        self.state.lock().unwrap()[gpio as usize].val
    }
}

impl MockGpioDevice {
    fn record(&self, event: MockEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn check_range(&self, gpio: u16) -> Result<()> {
        if gpio >= self.ngpio {
            return Err(Error::GpioOutOfRange(gpio));
        }

        Ok(())
    }

    fn check_requested(state: &[MockLineState], gpio: u16) -> Result<()> {
        if !state[gpio as usize].requested {
            return Err(Error::GpioLineNotRequested(gpio));
        }

        Ok(())
    }
}

impl GpioDevice for MockGpioDevice {
    fn open(ngpios: u32) -> Result<Self>
    where
        Self: Sized,
    {
        let ngpio = u16::try_from(ngpios).map_err(|_| Error::GpioCountInvalid(ngpios))?;
        Ok(MockGpioDevice::new(ngpio))
    }

    fn num_gpios(&self) -> Result<u16> {
        Ok(self.ngpio)
    }

    fn gpio_name(&self, gpio: u16) -> Result<String> {
        self.check_range(gpio)?;
        Ok(self.gpio_names[gpio as usize].clone())
    }

    fn request(&self, gpio: u16, consumer: &str) -> Result<()> {
        self.check_range(gpio)?;
        info!("gpio {} requested by {}", self.gpio_names[gpio as usize], consumer);

        if self.request_result.is_err() {
            return self.request_result;
        }

        let mut state = self.state.lock().unwrap();
        if state[gpio as usize].requested {
            return Err(Error::GpioLineBusy(gpio));
        }

        state[gpio as usize].requested = true;
        self.record(MockEvent::Request(gpio));
        Ok(())
    }

    fn free(&self, gpio: u16) {
        if self.check_range(gpio).is_err() {
            return;
        }

        info!("gpio {} freed", self.gpio_names[gpio as usize]);
        self.state.lock().unwrap()[gpio as usize] = MockLineState::default();
        self.record(MockEvent::Free(gpio));
    }

    fn set_direction(&self, gpio: u16, dir: Direction, value: u32) -> Result<()> {
        self.check_range(gpio)?;
        info!(
            "gpio {} set direction to {:?}",
            self.gpio_names[gpio as usize], dir
        );

        if self.set_direction_result.is_err() {
            return self.set_direction_result;
        }

        let mut state = self.state.lock().unwrap();
        Self::check_requested(&state, gpio)?;

        let line = &mut state[gpio as usize];
        line.dir = Some(dir);
        if dir == Direction::Output {
            line.val = value as u8;
        }

        self.record(MockEvent::SetDirection(gpio, dir));
        Ok(())
    }

    fn to_irq(&self, gpio: u16) -> Result<u32> {
        self.check_range(gpio)?;
        if self.to_irq_result.is_err() {
            return self.to_irq_result;
        }

        Self::check_requested(&self.state.lock().unwrap(), gpio)?;
        Ok(MOCK_IRQ_BASE + gpio as u32)
    }

    fn set_value(&self, gpio: u16, value: u32) -> Result<()> {
        self.check_range(gpio)?;
        trace!(
            "gpio {} set value to {}",
            self.gpio_names[gpio as usize],
            value
        );

        if self.set_value_result.is_err() {
            return self.set_value_result;
        }

        if value > 1 {
            return Err(Error::GpioValueInvalid(value));
        }

        let mut state = self.state.lock().unwrap();
        Self::check_requested(&state, gpio)?;

        let prev = state[gpio as usize].val;
        let value = value as u8;
        state[gpio as usize].val = value;
        self.record(MockEvent::SetValue(gpio, value.into()));

        let edge = match (prev, value) {
            (0, 1) => GPIO_IRQ_TYPE_EDGE_RISING,
            (1, 0) => GPIO_IRQ_TYPE_EDGE_FALLING,
            _ => return Ok(()),
        };

        let mut raised = false;
        for &(_, input) in self.jumpers.iter().filter(|(output, _)| *output == gpio) {
            let line = &mut state[input as usize];
            line.val = value;
            if line.irq_type & edge != 0 {
                line.pending += 1;
                raised = true;
            }
        }

        if raised {
            self.irq_raised.notify_all();
        }

        Ok(())
    }

    fn set_irq_type(&self, gpio: u16, value: u16) -> Result<()> {
        self.check_range(gpio)?;
        info!(
            "gpio {} set irq type to {}",
            self.gpio_names[gpio as usize], value
        );

        if self.set_irq_type_result.is_err() {
            return self.set_irq_type_result;
        }

        let mut state = self.state.lock().unwrap();
        Self::check_requested(&state, gpio)?;

        let line = &mut state[gpio as usize];
        line.irq_type = value;
        if value == GPIO_IRQ_TYPE_NONE {
            line.pending = 0;
        }

        self.record(MockEvent::SetIrqType(gpio, value));
        Ok(())
    }

    fn wait_for_interrupt(&self, gpio: u16, timeout: Duration) -> Result<bool> {
        self.check_range(gpio)?;
        if self.wait_for_irq_result.is_err() {
            return self.wait_for_irq_result;
        }

        let state = self.state.lock().unwrap();
        if state[gpio as usize].irq_type == GPIO_IRQ_TYPE_NONE {
            return Err(Error::GpioIrqNotEnabled);
        }

        let (mut state, _) = self
            .irq_raised
            .wait_timeout_while(state, timeout, |state| state[gpio as usize].pending == 0)
            .unwrap();

        let line = &mut state[gpio as usize];
        if line.pending == 0 {
            return Ok(false);
        }

        line.pending -= 1;
        Ok(true)
    }
}
