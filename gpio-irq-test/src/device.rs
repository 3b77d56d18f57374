// GPIO irq test device
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use libc::{EFAULT, ENODEV};
use log::{debug, error, info, warn};
use thiserror::Error as ThisError;

use crate::{
    gpio::{GpioDevice, GPIO_IRQ_TYPE_EDGE_RISING},
    pins::{
        acquire_input_pin, acquire_output_pin, disarm_handler, release_input_pin, InputPin,
        IrqHandler, IrqLine, OutputPin,
    },
    sync::{AccessGate, CancelToken, Completion, WaitOutcome},
};

// Kernel-internal "restart the call" status, reported for interrupted waits.
pub(crate) const ERESTARTSYS: i32 = 512;

// gpio 3 is the ENTER key on the LCD7 beaglebone cape.
pub(crate) const DEFAULT_IRQ_PIN: u16 = 3;
// gpio 147 is pin 29.
pub(crate) const DEFAULT_TOGGLE_PIN: u16 = 147;
pub(crate) const DEFAULT_LATENCY_TIMEOUT_MS: u64 = 500;
pub(crate) const DEFAULT_TOGGLE_COUNT: u32 = 1000;

/// Command byte selecting the latency test.
const LATENCY_TEST_CMD: u8 = b'1';

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, ThisError)]
/// Errors related to the test device
pub(crate) enum Error {
    #[error("Could not acquire irq pin: {0}")]
    IrqPin(crate::pins::Error),
    #[error("Could not acquire toggle pin: {0}")]
    TogglePin(crate::pins::Error),
    #[error("Interrupted while waiting for the device")]
    Interrupted,
    #[error("Bad address in write buffer")]
    BadBufferAccess,
}

impl Error {
    /// Positive errno value reported to the writer.
    pub(crate) fn errno(&self) -> i32 {
        match self {
            Error::Interrupted => ERESTARTSYS,
            Error::BadBufferAccess => EFAULT,
            Error::IrqPin(_) | Error::TogglePin(_) => ENODEV,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BufferFault;

/// Caller supplied write buffer.
pub(crate) trait UserBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the first `dst.len()` bytes into `dst`.
    fn copy_to(&self, dst: &mut [u8]) -> std::result::Result<(), BufferFault>;
}

impl UserBuffer for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn copy_to(&self, dst: &mut [u8]) -> std::result::Result<(), BufferFault> {
        let src = self.get(..dst.len()).ok_or(BufferFault)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TestConfig {
    pub(crate) irq_pin: u16,
    pub(crate) toggle_pin: u16,
    pub(crate) latency_timeout: Duration,
    pub(crate) toggle_count: u32,
    pub(crate) toggle_delay: Duration,
    /// Let the handler complete the latency wait. When disabled the handler
    /// only counts and logs, and the latency test always times out.
    pub(crate) signal_completion: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        TestConfig {
            irq_pin: DEFAULT_IRQ_PIN,
            toggle_pin: DEFAULT_TOGGLE_PIN,
            latency_timeout: Duration::from_millis(DEFAULT_LATENCY_TIMEOUT_MS),
            toggle_count: DEFAULT_TOGGLE_COUNT,
            toggle_delay: Duration::ZERO,
            signal_completion: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum LatencyOutcome {
    /// Handler completed the wait, with the delay from edge to handler.
    Processed(Duration),
    TimedOut,
    Interrupted,
    ArmFailed(crate::pins::Error),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum TestOutcome {
    Latency(LatencyOutcome),
    /// Number of completed high/low iterations.
    Toggle(u32),
}

/// State of the test device, from start-up until it is dropped.
pub(crate) struct GpioIrqDevice<D: GpioDevice> {
    config: TestConfig,
    input: InputPin<D>,
    output: OutputPin<D>,
    gate: AccessGate,
    irq_count: Arc<AtomicU32>,
    // Wait token of the latency test in flight, taken by the handler.
    context: Arc<Mutex<Option<Arc<Completion>>>>,
}

impl<D: GpioDevice> GpioIrqDevice<D> {
    /// Takes ownership of both test lines. Lines acquired before a failure are
    /// released again.
    pub(crate) fn new(device: Arc<D>, config: TestConfig) -> Result<Self> {
        let input = acquire_input_pin(&device, config.irq_pin).map_err(Error::IrqPin)?;
        let output = acquire_output_pin(&device, config.toggle_pin).map_err(Error::TogglePin)?;

        info!(
            "irq gpio {} (irq {}), toggle gpio {}",
            input.gpio(),
            input.irq_line(),
            output.gpio()
        );

        Ok(GpioIrqDevice {
            config,
            input,
            output,
            gate: AccessGate::new(),
            irq_count: Arc::new(AtomicU32::new(0)),
            context: Arc::new(Mutex::new(None)),
        })
    }

    pub(crate) fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Interrupts handled so far.
    pub(crate) fn irq_count(&self) -> u32 {
        self.irq_count.load(Ordering::Relaxed)
    }

    /// Releases both lines.
    pub(crate) fn release(self) {
        let GpioIrqDevice { input, output, .. } = self;

        drop(output);
        release_input_pin(input);
        info!("test device released");
    }

    /// Write entry point.
    ///
    /// Runs one test per call, serialized with every other caller, and
    /// reports the whole buffer as consumed.
    pub(crate) fn handle_write<B>(&self, buffer: &B, cancel: &CancelToken) -> Result<usize>
    where
        B: UserBuffer + ?Sized,
    {
        if buffer.is_empty() {
            return Ok(0);
        }

        let _gate = self
            .gate
            .down_interruptible(cancel)
            .map_err(|_| Error::Interrupted)?;

        let mut cmd = [0u8; 1];
        buffer
            .copy_to(&mut cmd)
            .map_err(|_| Error::BadBufferAccess)?;

        match self.run(cmd[0], cancel) {
            TestOutcome::Latency(LatencyOutcome::Processed(latency)) => {
                debug!("latency test passed in {:?}", latency)
            }
            TestOutcome::Latency(LatencyOutcome::ArmFailed(e)) => {
                debug!("latency test not run: {}", e)
            }
            TestOutcome::Toggle(iterations) => debug!("{} toggle iterations", iterations),
            outcome => debug!("test finished: {:?}", outcome),
        }

        Ok(buffer.len())
    }

    fn run(&self, cmd: u8, cancel: &CancelToken) -> TestOutcome {
        // Nothing fancy, '1' is latency test, anything else is a toggle test.
        if cmd == LATENCY_TEST_CMD {
            TestOutcome::Latency(self.latency_test(cancel))
        } else {
            TestOutcome::Toggle(self.toggle_test())
        }
    }

    fn irq_handler(&self) -> IrqHandler {
        let irq_count = self.irq_count.clone();
        let context = self.context.clone();
        let signal = self.config.signal_completion;

        Arc::new(move |irq: IrqLine| {
            irq_count.fetch_add(1, Ordering::Relaxed);
            info!("Interrupt! (irq {})", irq);

            if signal {
                if let Some(done) = context.lock().unwrap().take() {
                    done.complete();
                }
            }
        })
    }

    fn latency_test(&self, cancel: &CancelToken) -> LatencyOutcome {
        let registration = match self.input.arm_handler(
            self.input.irq_line(),
            self.irq_handler(),
            GPIO_IRQ_TYPE_EDGE_RISING,
        ) {
            Ok(registration) => registration,
            Err(e) => {
                warn!("request_irq failed: {}", e);
                return LatencyOutcome::ArmFailed(e);
            }
        };

        let done = Arc::new(Completion::new());
        *self.context.lock().unwrap() = Some(done.clone());

        let edge = Instant::now();
        if let Err(e) = self.output.set(true) {
            error!("Failed to drive gpio {} high: {}", self.output.gpio(), e);
        }

        let outcome = match done.wait_interruptible_timeout(self.config.latency_timeout, cancel) {
            WaitOutcome::Completed(at) => {
                let latency = at.saturating_duration_since(edge);
                info!("Interrupt processed, latency {:?}", latency);
                LatencyOutcome::Processed(latency)
            }
            WaitOutcome::TimedOut => {
                warn!("Timed out waiting for interrupt.");
                warn!("Did you forget to jumper the pins?");
                LatencyOutcome::TimedOut
            }
            WaitOutcome::Interrupted => {
                debug!("latency wait interrupted");
                warn!("Timed out waiting for interrupt.");
                warn!("Did you forget to jumper the pins?");
                LatencyOutcome::Interrupted
            }
        };

        self.context.lock().unwrap().take();

        // Back to low, the next test needs a fresh rising edge.
        if let Err(e) = self.output.set(false) {
            error!("Failed to drive gpio {} low: {}", self.output.gpio(), e);
        }

        if let Err(e) = disarm_handler(registration) {
            error!("free_irq failed: {}", e);
        }

        debug!("{} interrupts handled so far", self.irq_count());
        outcome
    }

    fn toggle_test(&self) -> u32 {
        let delay = self.config.toggle_delay;

        for i in 0..self.config.toggle_count {
            for high in [true, false] {
                if let Err(e) = self.output.set(high) {
                    error!("Toggle test aborted after {} iterations: {}", i, e);
                    return i;
                }

                if !delay.is_zero() {
                    sleep(delay);
                }
            }
        }

        info!("Toggle test complete");
        self.config.toggle_count
    }
}

#[cfg(test)]
mod tests {
    use std::thread::{sleep, spawn};

    use assert_matches::assert_matches;
    use libc::{EBUSY, EIO};

    use super::*;
    use crate::{
        gpio::{self, GPIO_IRQ_TYPE_NONE},
        mock_gpio::{MockEvent, MockGpioDevice},
        pins,
    };

    const NGPIO: u16 = 16;
    const IRQ_PIN: u16 = 3;
    const TOGGLE_PIN: u16 = 9;

    struct FaultyBuffer(usize);

    impl UserBuffer for FaultyBuffer {
        fn len(&self) -> usize {
            self.0
        }

        fn copy_to(&self, _dst: &mut [u8]) -> std::result::Result<(), BufferFault> {
            Err(BufferFault)
        }
    }

    fn test_config() -> TestConfig {
        TestConfig {
            irq_pin: IRQ_PIN,
            toggle_pin: TOGGLE_PIN,
            latency_timeout: Duration::from_millis(200),
            toggle_count: 10,
            ..Default::default()
        }
    }

    fn jumpered() -> Arc<MockGpioDevice> {
        Arc::new(MockGpioDevice::new(NGPIO).with_jumper(TOGGLE_PIN, IRQ_PIN))
    }

    fn create(device: &Arc<MockGpioDevice>, config: TestConfig) -> GpioIrqDevice<MockGpioDevice> {
        GpioIrqDevice::new(device.clone(), config).unwrap()
    }

    // Events after start-up, without the line setup.
    fn test_events(device: &MockGpioDevice) -> Vec<MockEvent> {
        device
            .events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::SetValue(..) | MockEvent::SetIrqType(..)))
            .collect()
    }

    #[test]
    fn test_device_new() {
        let device = jumpered();
        let dev = create(&device, test_config());

        assert!(device.is_requested(IRQ_PIN));
        assert!(device.is_requested(TOGGLE_PIN));
        assert_eq!(device.value(TOGGLE_PIN), 0);
        assert_eq!(dev.irq_count(), 0);
        assert_eq!(dev.config().toggle_count, 10);

        dev.release();
        assert!(!device.is_requested(IRQ_PIN));
        assert!(!device.is_requested(TOGGLE_PIN));
    }

    #[test]
    fn test_device_new_failure() {
        // Toggle pin taken: irq pin is released again
        let device = jumpered();
        device.request(TOGGLE_PIN, "other").unwrap();
        assert_matches!(
            GpioIrqDevice::new(device.clone(), test_config()).err(),
            Some(Error::TogglePin(pins::Error::PinUnavailable(TOGGLE_PIN, _)))
        );
        assert!(!device.is_requested(IRQ_PIN));

        // Irq pin can't be configured
        let err = gpio::Error::GpioOperationFailed("set-direction");
        let mut mock = MockGpioDevice::new(NGPIO);
        mock.set_direction_result = Err(err);
        let device = Arc::new(mock);
        assert_eq!(
            GpioIrqDevice::new(device.clone(), test_config()).err(),
            Some(Error::IrqPin(pins::Error::ConfigurationError(IRQ_PIN, err)))
        );
        assert!(!device.is_requested(IRQ_PIN));
        assert!(!device.is_requested(TOGGLE_PIN));
    }

    #[test]
    fn test_empty_write() {
        let device = jumpered();
        let dev = create(&device, test_config());

        assert_eq!(dev.handle_write(&b""[..], &CancelToken::new()), Ok(0));
        assert!(test_events(&device).is_empty());
    }

    #[test]
    fn test_toggle_write() {
        let device = jumpered();
        let dev = create(&device, test_config());

        assert_eq!(dev.handle_write(&b"x\n"[..], &CancelToken::new()), Ok(2));

        let mut expected = Vec::new();
        for _ in 0..10 {
            expected.push(MockEvent::SetValue(TOGGLE_PIN, 1));
            expected.push(MockEvent::SetValue(TOGGLE_PIN, 0));
        }

        // Never arms the irq
        assert_eq!(test_events(&device), expected);
        assert_eq!(dev.irq_count(), 0);
    }

    #[test]
    fn test_toggle_count_and_delay() {
        let device = jumpered();
        let config = TestConfig {
            toggle_count: 5,
            toggle_delay: Duration::from_millis(10),
            ..test_config()
        };
        let dev = create(&device, config);

        let start = Instant::now();
        assert_eq!(dev.run(b'0', &CancelToken::new()), TestOutcome::Toggle(5));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(test_events(&device).len(), 10);
    }

    #[test]
    fn test_toggle_failure() {
        let mut mock = MockGpioDevice::new(NGPIO);
        mock.set_value_result = Err(gpio::Error::GpioOperationFailed("set-value"));
        let device = Arc::new(mock);
        let dev = create(&device, test_config());

        assert_eq!(dev.run(b'x', &CancelToken::new()), TestOutcome::Toggle(0));

        // Still reported as consumed
        assert_eq!(dev.handle_write(&b"x"[..], &CancelToken::new()), Ok(1));
    }

    #[test]
    fn test_latency_timeout_without_jumper() {
        let device = Arc::new(MockGpioDevice::new(NGPIO));
        let config = TestConfig {
            signal_completion: true,
            ..test_config()
        };
        let dev = create(&device, config);

        let start = Instant::now();
        assert_eq!(
            dev.run(LATENCY_TEST_CMD, &CancelToken::new()),
            TestOutcome::Latency(LatencyOutcome::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(dev.irq_count(), 0);

        // Armed before driving, disarmed at the end
        assert_eq!(
            test_events(&device),
            vec![
                MockEvent::SetIrqType(IRQ_PIN, GPIO_IRQ_TYPE_EDGE_RISING),
                MockEvent::SetValue(TOGGLE_PIN, 1),
                MockEvent::SetValue(TOGGLE_PIN, 0),
                MockEvent::SetIrqType(IRQ_PIN, GPIO_IRQ_TYPE_NONE),
            ]
        );
        assert_eq!(device.irq_type(IRQ_PIN), GPIO_IRQ_TYPE_NONE);
    }

    #[test]
    fn test_latency_handler_without_signaling() {
        let device = jumpered();
        let dev = create(&device, test_config());

        // Handler runs, but never completes the wait
        assert_eq!(
            dev.run(LATENCY_TEST_CMD, &CancelToken::new()),
            TestOutcome::Latency(LatencyOutcome::TimedOut)
        );
        assert_eq!(dev.irq_count(), 1);
        assert!(dev.context.lock().unwrap().is_none());
    }

    #[test]
    fn test_latency_processed() {
        let device = jumpered();
        let config = TestConfig {
            latency_timeout: Duration::from_secs(5),
            signal_completion: true,
            ..test_config()
        };
        let dev = create(&device, config);

        for round in 1..=3 {
            let start = Instant::now();
            assert_matches!(
                dev.run(LATENCY_TEST_CMD, &CancelToken::new()),
                TestOutcome::Latency(LatencyOutcome::Processed(latency))
                    if latency < Duration::from_secs(5)
            );
            assert!(start.elapsed() < Duration::from_secs(5));
            assert_eq!(dev.irq_count(), round);
        }

        assert_eq!(device.irq_type(IRQ_PIN), GPIO_IRQ_TYPE_NONE);
    }

    #[test]
    fn test_latency_arm_failure() {
        let mut mock = MockGpioDevice::new(NGPIO).with_jumper(TOGGLE_PIN, IRQ_PIN);
        mock.set_irq_type_result = Err(gpio::Error::GpioOperationFailed("set-irq-type"));
        let device = Arc::new(mock);
        let dev = create(&device, test_config());

        assert_matches!(
            dev.run(LATENCY_TEST_CMD, &CancelToken::new()),
            TestOutcome::Latency(LatencyOutcome::ArmFailed(pins::Error::IrqRegistration {
                status,
                ..
            })) if status == -EIO
        );

        // Output never driven
        assert!(test_events(&device).is_empty());

        // Not propagated to the writer
        assert_eq!(dev.handle_write(&b"1"[..], &CancelToken::new()), Ok(1));
    }

    #[test]
    fn test_latency_arm_busy() {
        let device = jumpered();
        let dev = create(&device, test_config());

        let _registration = dev
            .input
            .arm_handler(
                dev.input.irq_line(),
                Arc::new(|_: IrqLine| {}),
                GPIO_IRQ_TYPE_EDGE_RISING,
            )
            .unwrap();

        assert_matches!(
            dev.run(LATENCY_TEST_CMD, &CancelToken::new()),
            TestOutcome::Latency(LatencyOutcome::ArmFailed(pins::Error::IrqRegistration {
                status,
                ..
            })) if status == -EBUSY
        );
        assert_eq!(device.value(TOGGLE_PIN), 0);
    }

    #[test]
    fn test_latency_interrupted() {
        let device = Arc::new(MockGpioDevice::new(NGPIO));
        let config = TestConfig {
            latency_timeout: Duration::from_secs(30),
            ..test_config()
        };
        let dev = Arc::new(create(&device, config));
        let cancel = CancelToken::new();

        let writer = {
            let dev = dev.clone();
            let cancel = cancel.clone();
            spawn(move || dev.handle_write(&b"1"[..], &cancel))
        };

        sleep(Duration::from_millis(100));
        cancel.cancel();

        // The test itself ran, so the write completes
        assert_eq!(writer.join().unwrap(), Ok(1));

        // No handler left behind
        assert_eq!(device.irq_type(IRQ_PIN), GPIO_IRQ_TYPE_NONE);
        assert_eq!(
            dev.run(LATENCY_TEST_CMD, &cancel),
            TestOutcome::Latency(LatencyOutcome::Interrupted)
        );
    }

    #[test]
    fn test_gate_wait_interrupted() {
        let device = jumpered();
        let dev = create(&device, test_config());
        let cancel = CancelToken::new();

        let guard = dev.gate.down_interruptible(&cancel).unwrap();
        cancel.cancel();

        assert_eq!(dev.handle_write(&b"x"[..], &cancel), Err(Error::Interrupted));
        assert_eq!(Error::Interrupted.errno(), ERESTARTSYS);
        assert!(test_events(&device).is_empty());

        drop(guard);
        assert_eq!(dev.handle_write(&b"x"[..], &CancelToken::new()), Ok(1));
    }

    #[test]
    fn test_bad_buffer_releases_gate() {
        let device = jumpered();
        let dev = create(&device, test_config());

        assert_eq!(
            dev.handle_write(&FaultyBuffer(4), &CancelToken::new()),
            Err(Error::BadBufferAccess)
        );
        assert_eq!(Error::BadBufferAccess.errno(), EFAULT);
        assert!(test_events(&device).is_empty());

        // Gate released: the next write goes through
        assert_eq!(dev.handle_write(&b"x"[..], &CancelToken::new()), Ok(1));
    }

    #[test]
    fn test_overlapping_writes_serialized() {
        let device = Arc::new(MockGpioDevice::new(NGPIO));
        let config = TestConfig {
            latency_timeout: Duration::from_millis(300),
            toggle_count: 3,
            ..test_config()
        };
        let dev = Arc::new(create(&device, config));

        let first = {
            let dev = dev.clone();
            spawn(move || dev.handle_write(&b"1"[..], &CancelToken::new()))
        };

        // Let the latency test take the gate first
        sleep(Duration::from_millis(50));
        let second = {
            let dev = dev.clone();
            spawn(move || dev.handle_write(&b"t"[..], &CancelToken::new()))
        };

        assert_eq!(first.join().unwrap(), Ok(1));
        assert_eq!(second.join().unwrap(), Ok(1));

        let mut expected = vec![
            MockEvent::SetIrqType(IRQ_PIN, GPIO_IRQ_TYPE_EDGE_RISING),
            MockEvent::SetValue(TOGGLE_PIN, 1),
            MockEvent::SetValue(TOGGLE_PIN, 0),
            MockEvent::SetIrqType(IRQ_PIN, GPIO_IRQ_TYPE_NONE),
        ];
        for _ in 0..3 {
            expected.push(MockEvent::SetValue(TOGGLE_PIN, 1));
            expected.push(MockEvent::SetValue(TOGGLE_PIN, 0));
        }

        assert_eq!(test_events(&device), expected);
    }

    #[test]
    fn test_user_buffer_slice() {
        let mut cmd = [0u8; 1];

        assert!(b""[..].copy_to(&mut cmd).is_err());

        b"1x"[..].copy_to(&mut cmd).unwrap();
        assert_eq!(cmd, [b'1']);
        assert_eq!(UserBuffer::len(&b"1x"[..]), 2);
    }
}
