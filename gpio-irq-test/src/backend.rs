// GPIO irq test daemon
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{num::ParseIntError, path::PathBuf, process::exit, sync::Arc, time::Duration};

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use thiserror::Error as ThisError;

#[cfg(any(test, feature = "mock_gpio"))]
use crate::mock_gpio::MockGpioDevice;
use crate::{
    device::{
        GpioIrqDevice, TestConfig, DEFAULT_IRQ_PIN, DEFAULT_LATENCY_TIMEOUT_MS,
        DEFAULT_TOGGLE_COUNT, DEFAULT_TOGGLE_PIN,
    },
    gpio::{GpioDevice, PhysDevice},
    node::DeviceNode,
};

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
/// Errors related to the daemon set-up
pub(crate) enum Error {
    #[error("Irq pin and toggle pin are the same: {0}")]
    PinsIdentical(u16),
    #[error("Gpio {0} out of range, device has {1} lines")]
    PinOutOfRange(u16, u16),
    #[error("Latency timeout must not be zero")]
    TimeoutInvalid,
    #[error("Failed while parsing to integer: {0:?}")]
    ParseFailure(ParseIntError),
    #[error("Could not open gpio device: {0}")]
    CouldNotOpenDevice(crate::gpio::Error),
    #[error("Could not query gpio device: {0}")]
    CouldNotQueryDevice(crate::gpio::Error),
    #[error("Could not create test device: {0}")]
    CouldNotCreateDevice(crate::device::Error),
    #[error("Could not create device node: {0}")]
    CouldNotCreateNode(crate::node::Error),
    #[error("Could not install termination handler: {0}")]
    CouldNotInstallHandler(ctrlc::Error),
    #[error("Fatal error: {0}")]
    ServeFailed(crate::node::Error),
}

const GPIO_IRQ_AFTER_HELP: &str = "The device number selects /dev/gpiochipN, or simulates a GPIO \
                                   chip with N lines when prefixed with 's' (when feature \
                                   enabled). The simulated chip has the toggle pin jumpered to \
                                   the irq pin. Write '1' to the socket for a latency test, \
                                   anything else for a toggle test, e.g. \"-d 0 -s \
                                   /run/gpio_irq.sock\"\n";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None, after_help = GPIO_IRQ_AFTER_HELP)]
struct GpioIrqArgs {
    /// Location of the Unix domain socket serving test requests.
    #[clap(short, long)]
    socket_path: PathBuf,

    /// GPIO device in the format `[s]<N>`.
    #[clap(short, long)]
    device: String,

    /// Input line raising the interrupt.
    #[clap(long, default_value_t = DEFAULT_IRQ_PIN)]
    irq_pin: u16,

    /// Output line driven by the tests, jumpered to the irq pin.
    #[clap(long, default_value_t = DEFAULT_TOGGLE_PIN)]
    toggle_pin: u16,

    /// How long the latency test waits for the interrupt.
    #[clap(long, default_value_t = DEFAULT_LATENCY_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Number of high/low iterations of the toggle test.
    #[clap(long, default_value_t = DEFAULT_TOGGLE_COUNT)]
    toggle_count: u32,

    /// Delay between toggle transitions, 0 toggles as fast as possible.
    #[clap(long, default_value_t = 0)]
    toggle_delay_us: u64,

    /// Let the interrupt handler complete the latency test.
    #[clap(long)]
    signal_completion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GpioDeviceType {
    PhysicalDevice {
        id: u32,
    },
    #[cfg(any(test, feature = "mock_gpio"))]
    SimulatedDevice {
        num_gpios: u32,
    },
}

impl GpioDeviceType {
    fn new(cfg: &str) -> Result<Self> {
        match cfg.strip_prefix('s') {
            #[cfg(any(test, feature = "mock_gpio"))]
            Some(num) => {
                let num_gpios = num.parse::<u32>().map_err(Error::ParseFailure)?;
                Ok(GpioDeviceType::SimulatedDevice { num_gpios })
            }
            _ => {
                let id = cfg.parse::<u32>().map_err(Error::ParseFailure)?;
                Ok(GpioDeviceType::PhysicalDevice { id })
            }
        }
    }
}

#[derive(PartialEq, Debug)]
struct GpioIrqConfiguration {
    socket_path: PathBuf,
    device: GpioDeviceType,
    test: TestConfig,
}

impl TryFrom<GpioIrqArgs> for GpioIrqConfiguration {
    type Error = Error;

    fn try_from(args: GpioIrqArgs) -> Result<Self> {
        if args.irq_pin == args.toggle_pin {
            return Err(Error::PinsIdentical(args.irq_pin));
        }

        if args.timeout_ms == 0 {
            return Err(Error::TimeoutInvalid);
        }

        let device = GpioDeviceType::new(&args.device)?;

        Ok(GpioIrqConfiguration {
            socket_path: args.socket_path,
            device,
            test: TestConfig {
                irq_pin: args.irq_pin,
                toggle_pin: args.toggle_pin,
                latency_timeout: Duration::from_millis(args.timeout_ms),
                toggle_count: args.toggle_count,
                toggle_delay: Duration::from_micros(args.toggle_delay_us),
                signal_completion: args.signal_completion,
            },
        })
    }
}

fn start_device<D: GpioDevice>(device: D, config: &GpioIrqConfiguration) -> Result<()> {
    let ngpio = device.num_gpios().map_err(Error::CouldNotQueryDevice)?;
    for pin in [config.test.irq_pin, config.test.toggle_pin] {
        if pin >= ngpio {
            return Err(Error::PinOutOfRange(pin, ngpio));
        }
    }

    let device = Arc::new(
        GpioIrqDevice::new(Arc::new(device), config.test).map_err(Error::CouldNotCreateDevice)?,
    );

    // Dropping the device on failure releases both lines.
    let node = DeviceNode::create(&config.socket_path).map_err(Error::CouldNotCreateNode)?;

    // SIGINT and SIGTERM interrupt blocked writers and stop serving.
    let shutdown = node.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("termination requested, shutting down");
        shutdown.shutdown();
    })
    .map_err(Error::CouldNotInstallHandler)?;

    if !device.config().signal_completion {
        info!("completion signaling disabled, latency tests report timeouts only");
    }
    info!("serving test requests on {:?}", node.path());

    node.serve(device.clone()).map_err(Error::ServeFailed)?;
    drop(node);

    match Arc::try_unwrap(device) {
        Ok(device) => device.release(),
        Err(_) => warn!("test device still in use at shutdown"),
    }

    Ok(())
}

fn start_backend(args: GpioIrqArgs) -> Result<()> {
    let config = GpioIrqConfiguration::try_from(args)?;

    match config.device {
        GpioDeviceType::PhysicalDevice { id } => {
            let device = PhysDevice::open(id).map_err(Error::CouldNotOpenDevice)?;
            start_device(device, &config)
        }
        #[cfg(any(test, feature = "mock_gpio"))]
        GpioDeviceType::SimulatedDevice { num_gpios } => {
            let device = MockGpioDevice::open(num_gpios)
                .map_err(Error::CouldNotOpenDevice)?
                .with_jumper(config.test.toggle_pin, config.test.irq_pin);
            start_device(device, &config)
        }
    }
}

pub(crate) fn gpio_irq_init() {
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    if let Err(e) = start_backend(GpioIrqArgs::parse()) {
        error!("Fatal error starting backend: {e}");
        exit(1);
    }
}
