//! Compute device selection
//!
//! Accelerators are checked explicitly and in a fixed order. Only a failure to
//! construct an accelerator that reported itself available is recovered from,
//! by falling back to the CPU.

use candle_core::Device;

pub trait Accelerator {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    fn create(&self) -> candle_core::Result<Device>;
}

pub struct Cuda {
    pub ordinal: usize,
}

impl Accelerator for Cuda {
    fn name(&self) -> &str {
        "cuda"
    }

    fn is_available(&self) -> bool {
        candle_core::utils::cuda_is_available()
    }

    fn create(&self) -> candle_core::Result<Device> {
        Device::new_cuda(self.ordinal)
    }
}

pub struct Metal {
    pub ordinal: usize,
}

impl Accelerator for Metal {
    fn name(&self) -> &str {
        "metal"
    }

    fn is_available(&self) -> bool {
        candle_core::utils::metal_is_available()
    }

    fn create(&self) -> candle_core::Result<Device> {
        Device::new_metal(self.ordinal)
    }
}

/// Accelerators compiled into this build, in preference order
pub fn system_accelerators() -> Vec<Box<dyn Accelerator>> {
    vec![Box::new(Cuda { ordinal: 0 }), Box::new(Metal { ordinal: 0 })]
}

/// Pick the first available accelerator, or the CPU.
pub fn select_device(accelerators: &[Box<dyn Accelerator>]) -> Device {
    match accelerators.iter().find(|a| a.is_available()) {
        Some(accelerator) => match accelerator.create() {
            Ok(device) => {
                tracing::info!("Using {} device", accelerator.name());
                device
            }
            Err(e) => {
                tracing::warn!(
                    "{} reported available but failed to initialise ({}), falling back to CPU",
                    accelerator.name(),
                    e
                );
                Device::Cpu
            }
        },
        None => {
            tracing::info!("No accelerator available, using CPU");
            Device::Cpu
        }
    }
}
