//! Error taxonomy for the buffer and compositing core
//!
//! Allocation, GPU program and submission failures are distinct types so a
//! caller can tell "no memory for the next frame" apart from "the output
//! rejected this frame". None of them are retried inside the crate.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::buffer::PixelFormat;
use crate::geometry::{Size, Stride};

/// Step of a buffer allocation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStep {
    /// Creating the backing file
    Open,
    /// Reserving the full extent up front
    Preallocate,
    /// Mapping the backing store into the process
    Map,
    /// Exporting a transferable handle
    Export,
    /// Asking the display driver's buffer manager for memory
    DeviceAllocate,
}

impl fmt::Display for AllocationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            AllocationStep::Open => "open",
            AllocationStep::Preallocate => "preallocate",
            AllocationStep::Map => "map",
            AllocationStep::Export => "export",
            AllocationStep::DeviceAllocate => "device-allocate",
        };
        f.write_str(step)
    }
}

/// Failure to produce backing memory for a pixel buffer
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("no usable shared-memory directory (searched {searched:?})")]
    NoUsableDirectory {
        searched: Vec<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("failed to {step} pixel buffer")]
    Os {
        step: AllocationStep,
        #[source]
        source: io::Error,
    },

    #[error("invalid buffer geometry {size:?} with stride {stride:?} for {format:?}")]
    InvalidGeometry {
        size: Size,
        stride: Stride,
        format: PixelFormat,
    },

    #[error("pixel format {format:?} is not supported by the {platform} platform")]
    UnsupportedFormat {
        format: PixelFormat,
        platform: &'static str,
    },
}

impl AllocationError {
    pub(crate) fn os(step: AllocationStep, source: io::Error) -> Self {
        AllocationError::Os { step, source }
    }

    /// Underlying OS error code, when there is one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            AllocationError::NoUsableDirectory { source, .. }
            | AllocationError::Os { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

/// The GPU context bound to an output could not be made current
#[derive(Debug, Error)]
#[error("failed to make GPU context current: {reason}")]
pub struct ContextError {
    pub reason: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ContextError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    /// Context failure caused by a lower-level error, e.g. a driver failure
    /// while waiting for the previous frame
    pub fn with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Shader stage that failed to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Failure to build a GPU program
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("{stage:?} shader failed to compile: {log}")]
    Compile { stage: ShaderStage, log: String },

    #[error("program failed to link: {log}")]
    Link { log: String },

    #[error("program has no active uniform named `{name}`")]
    MissingUniform { name: String },

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Failure to hand a frame to an output
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("post_update called outside make_current/release_current")]
    NotCurrent,

    #[error("bypass rejected: {reason}")]
    BypassRejected { reason: String },

    #[error("display driver rejected the frame")]
    Driver(#[source] io::Error),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl SubmissionError {
    pub(crate) fn bypass_rejected(reason: impl Into<String>) -> Self {
        SubmissionError::BypassRejected {
            reason: reason.into(),
        }
    }
}

/// Failure while a renderer produced a frame
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("display exposes no CPU render target")]
    NoRenderTarget,

    #[error("failed to map the display's back buffer")]
    MapTarget(#[source] io::Error),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// Failure reported by an output compositor thread
#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("failed to spawn output compositor thread")]
    Spawn(#[source] io::Error),

    #[error("output compositor thread `{0}` is no longer running")]
    Disconnected(String),

    #[error(transparent)]
    Render(#[from] RenderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_error_reports_step_and_errno() {
        let err = AllocationError::os(
            AllocationStep::Preallocate,
            io::Error::from_raw_os_error(libc::ENOSPC),
        );
        assert_eq!(err.to_string(), "failed to preallocate pixel buffer");
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }

    #[test]
    fn test_context_error_keeps_driver_cause() {
        let driver = SubmissionError::Driver(io::Error::from_raw_os_error(libc::EBUSY));
        let err = ContextError::with_source("HDMI-A-1 lost its page flip", driver);
        let source = std::error::Error::source(&err).expect("driver cause");
        let submission = source.downcast_ref::<SubmissionError>().expect("submission error");
        assert!(matches!(
            submission,
            SubmissionError::Driver(e) if e.raw_os_error() == Some(libc::EBUSY)
        ));
    }

    #[test]
    fn test_submission_error_is_distinct_from_allocation() {
        let err: RenderError = SubmissionError::NotCurrent.into();
        assert!(matches!(err, RenderError::Submission(SubmissionError::NotCurrent)));
    }
}
