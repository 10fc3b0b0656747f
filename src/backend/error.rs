// Error taxonomy for negotiation and provisioning
//
// Required-tier misses surface as one of these; requested-tier misses are
// logged and only cost a candidate its optimal status.

use ash::vk;
use std::fmt;
use thiserror::Error;

use super::version::ApiVersion;

pub type Result<T> = std::result::Result<T, Error>;

/// What kind of capability a `MissingCapability` error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Extension,
    Layer,
    Feature,
    QueueTopology,
    Memory,
    DeviceClass,
    DeviceName,
    Presentation,
    ImageCount,
    SurfaceFormat,
    PresentMode,
    DepthFormat,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Extension => "extension",
            Self::Layer => "layer",
            Self::Feature => "feature",
            Self::QueueTopology => "queue topology",
            Self::Memory => "memory",
            Self::DeviceClass => "device class",
            Self::DeviceName => "device name",
            Self::Presentation => "presentation support",
            Self::ImageCount => "image count",
            Self::SurfaceFormat => "surface format",
            Self::PresentMode => "present mode",
            Self::DepthFormat => "depth format",
        };
        f.write_str(name)
    }
}

/// Coarse discriminant of [`Error`], handy for callers deciding whether to
/// relax a requirement and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedVersion,
    MissingCapability,
    Query,
    NoCandidate,
    Creation,
    IncompatibleDriver,
    InvalidConfiguration,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{subject} requires Vulkan {required}, but only {available} is available")]
    UnsupportedVersion {
        subject: String,
        required: ApiVersion,
        available: ApiVersion,
    },

    #[error("{subject} is missing required {kind}: {detail}")]
    MissingCapability {
        subject: String,
        kind: CapabilityKind,
        detail: String,
    },

    #[error("Failed to query {what}: {result}")]
    Query { what: String, result: vk::Result },

    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("No suitable candidate found: {0}")]
    NoCandidate(String),

    #[error("Failed to create {what}: {result}")]
    Creation { what: String, result: vk::Result },

    #[error("Failed to allocate {what}: {source}")]
    Allocation {
        what: String,
        #[source]
        source: gpu_allocator::AllocationError,
    },

    #[error("Driver does not expose mandatory entry point {0}")]
    IncompatibleDriver(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Self::MissingCapability { .. } => ErrorKind::MissingCapability,
            Self::Query { .. } | Self::Loading(_) => ErrorKind::Query,
            Self::NoCandidate(_) => ErrorKind::NoCandidate,
            Self::Creation { .. } | Self::Allocation { .. } => ErrorKind::Creation,
            Self::IncompatibleDriver(_) => ErrorKind::IncompatibleDriver,
            Self::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
        }
    }

    pub(crate) fn missing(
        subject: impl Into<String>,
        kind: CapabilityKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::MissingCapability {
            subject: subject.into(),
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn query(what: impl Into<String>, result: vk::Result) -> Self {
        Self::Query {
            what: what.into(),
            result,
        }
    }

    pub(crate) fn creation(what: impl Into<String>, result: vk::Result) -> Self {
        Self::Creation {
            what: what.into(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        let err = Error::missing("instance", CapabilityKind::Layer, "VK_LAYER_foo");
        assert_eq!(err.kind(), ErrorKind::MissingCapability);
        assert_eq!(
            err.to_string(),
            "instance is missing required layer: VK_LAYER_foo"
        );

        let err = Error::creation("device", vk::Result::ERROR_INITIALIZATION_FAILED);
        assert_eq!(err.kind(), ErrorKind::Creation);
    }

    #[test]
    fn version_error_prints_dotted_versions() {
        let err = Error::UnsupportedVersion {
            subject: "instance".into(),
            required: ApiVersion::V1_3,
            available: ApiVersion::V1_1,
        };
        assert_eq!(
            err.to_string(),
            "instance requires Vulkan 1.3.0, but only 1.1.0 is available"
        );
    }
}
