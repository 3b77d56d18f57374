// GPIO interrupt latency and toggle test
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#[cfg(target_env = "gnu")]
mod backend;
#[cfg(target_env = "gnu")]
mod device;
#[cfg(target_env = "gnu")]
mod gpio;
#[cfg(all(target_env = "gnu", any(test, feature = "mock_gpio")))]
mod mock_gpio;
#[cfg(target_env = "gnu")]
mod node;
#[cfg(target_env = "gnu")]
mod pins;
#[cfg(target_env = "gnu")]
mod sync;

#[cfg(target_env = "gnu")]
fn main() {
    backend::gpio_irq_init()
}

// libgpiod is only available pre-built for glibc targets, skip musl builds.
#[cfg(target_env = "musl")]
fn main() {}
