use std::fmt;

use thiserror::Error;

/// Failure reported by the native device while creating an object.
///
/// Carries the driver's human-readable message. It is `Clone` because failed creations are
/// memoized and handed back to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DeviceError {
    pub message: String,
}

impl DeviceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Which interning table an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    RootSignature,
    PipelineDesc,
    InputLayout,
    OutputLayout,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::RootSignature => write!(f, "root signature"),
            IdKind::PipelineDesc => write!(f, "pipeline description"),
            IdKind::InputLayout => write!(f, "input layout"),
            IdKind::OutputLayout => write!(f, "output layout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    #[error("invalid {kind} id {id}")]
    InvalidId { kind: IdKind, id: u32 },
    #[error("{kind} id space exhausted after {max} registrations")]
    IdSpaceExhausted { kind: IdKind, max: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("descriptor handle 0x{0:x} is outside the allocated heap range")]
    NotFound(u64),
    #[error("descriptor index {index} out of range for a table of {count} descriptors")]
    IndexOutOfRange { index: u32, count: u32 },
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("shader input `{shader_input}` cannot be represented by the binding layout: {reason}")]
    LayoutMismatch {
        shader_input: String,
        reason: String,
    },
    #[error("{slot} is incompatible with shader input `{shader_input}`: {reason}")]
    Verification {
        slot: String,
        shader_input: String,
        reason: String,
    },
}

/// Errors returned by [`crate::FrameRingAllocator`].
///
/// `InsufficientSpace` is a capacity signal; callers are expected to branch on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingBufferError {
    #[error("invalid ring allocation: {0}")]
    InvalidRequest(&'static str),
    #[error(
        "frame ring out of space: requested {requested} bytes (alignment {alignment}), {available} bytes available"
    )]
    InsufficientSpace {
        requested: u64,
        alignment: u64,
        available: u64,
    },
}
