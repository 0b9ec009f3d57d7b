use std::fmt::Display;

use tracing::info;

/// Device requested on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum DeviceRequest {
    #[default]
    #[value(name = "auto")]
    Auto,
    #[value(name = "cuda")]
    Cuda,
    #[value(name = "metal")]
    Metal,
    #[value(name = "cpu")]
    Cpu,
}

/// Runtime capability flags, probed by the compute backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceCaps {
    pub cuda: bool,
    pub metal: bool,
}

/// The device a pipeline will be built on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Metal,
    Cpu,
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

impl DeviceRequest {
    /// Resolve the request against the probed capabilities.
    ///
    /// `Auto` prefers CUDA, then Metal, and falls through to the CPU; it
    /// never fails. An explicit request is honored unchecked — if it is
    /// wrong for the running machine, the error surfaces when the pipeline
    /// is built.
    pub fn resolve(self, caps: DeviceCaps) -> DeviceKind {
        let kind = match self {
            Self::Auto => {
                if caps.cuda {
                    DeviceKind::Cuda
                } else if caps.metal {
                    DeviceKind::Metal
                } else {
                    DeviceKind::Cpu
                }
            }
            Self::Cuda => DeviceKind::Cuda,
            Self::Metal => DeviceKind::Metal,
            Self::Cpu => DeviceKind::Cpu,
        };
        info!("using device: {kind}");
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: DeviceCaps = DeviceCaps {
        cuda: false,
        metal: false,
    };
    const ALL: DeviceCaps = DeviceCaps {
        cuda: true,
        metal: true,
    };

    #[test]
    fn auto_prefers_cuda_then_metal_then_cpu() {
        assert_eq!(DeviceRequest::Auto.resolve(ALL), DeviceKind::Cuda);
        assert_eq!(
            DeviceRequest::Auto.resolve(DeviceCaps {
                cuda: false,
                metal: true,
            }),
            DeviceKind::Metal
        );
        assert_eq!(DeviceRequest::Auto.resolve(NONE), DeviceKind::Cpu);
    }

    #[test]
    fn explicit_request_passes_through_unchecked() {
        assert_eq!(DeviceRequest::Cuda.resolve(NONE), DeviceKind::Cuda);
        assert_eq!(DeviceRequest::Metal.resolve(NONE), DeviceKind::Metal);
        assert_eq!(DeviceRequest::Cpu.resolve(ALL), DeviceKind::Cpu);
    }
}
