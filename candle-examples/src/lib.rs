//! Shared setup for the example binaries.

use candle::utils::{cuda_is_available, metal_is_available};
use candle::{Device, Result};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;

/// Picks the first available accelerator unless `cpu` is set.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Device::new_cuda(0)
    } else if metal_is_available() {
        Device::new_metal(0)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Installs a Chrome trace writer if enabled, otherwise a `RUST_LOG`-driven
/// fmt subscriber.
///
/// The returned guard must stay alive until the trace should be flushed.
pub fn setup_tracing(enabled: bool) -> Option<tracing_chrome::FlushGuard> {
    if enabled {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        None
    }
}
