//! Error types for bitflow.
//!
//! Errors are split into two categories:
//! - **Wire errors** ([`MarshalError`]): codec failures on a single byte
//!   stream. Fatal for that connection, but a source serving several
//!   connections keeps running.
//! - **Pipeline errors** ([`PipelineError`]): everything that stops a task,
//!   from unusable endpoints to failing processors. Collected by the task
//!   group into a [`MultiError`] whose length becomes the process exit code.

use std::fmt;

/// Codec failures while reading or writing a sample byte stream.
#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    /// The stream ended cleanly between frames. Triggers graceful close,
    /// never reported as a failure.
    #[error("end of stream")]
    EndOfStream,

    /// The byte stream is structurally damaged (truncated frame, bad
    /// marker byte, unparseable field).
    #[error("bad frame: {reason}")]
    BadFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// A sample's value count disagrees with the header in force.
    #[error("sample has {actual} values, header declares {expected} fields")]
    SchemaMismatch {
        /// Field count declared by the current header.
        expected: usize,
        /// Value count actually carried by the sample.
        actual: usize,
    },

    /// A tag string could not be parsed back into tags.
    #[error("malformed tag string: {reason}")]
    MalformedTag {
        /// Which pair was malformed and why.
        reason: String,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MarshalError {
    /// Creates a framing error with the given reason.
    pub fn bad_frame(reason: impl Into<String>) -> Self {
        Self::BadFrame {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is a clean end of stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Errors that stop a pipeline task.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The script failed to lex, parse or validate. Carries the position
    /// of the offending token.
    #[error(transparent)]
    Script(#[from] crate::script::ParserError),

    /// A script step name is not present in the registry.
    #[error("unknown pipeline step '{name}'")]
    UnknownStep {
        /// The step name from the script.
        name: String,
    },

    /// A registered step rejected its parameters.
    #[error("step '{step}': {reason}")]
    InvalidStepParams {
        /// The step whose parameters were invalid.
        step: String,
        /// Description of the problem.
        reason: String,
    },

    /// An endpoint could not be parsed, opened or bound.
    #[error("endpoint '{endpoint}': {reason}")]
    Endpoint {
        /// The endpoint URI as written.
        endpoint: String,
        /// Why it is unusable.
        reason: String,
    },

    /// A codec failure that was fatal for the whole task.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// A processor's `sample()` call failed.
    #[error("processor '{processor}': {reason}")]
    Processor {
        /// Name of the failing processor.
        processor: String,
        /// Description of the failure.
        reason: String,
    },

    /// The pipeline is structurally unusable (no source, bad wiring).
    #[error("{0}")]
    Config(String),

    /// Several errors from concurrent branches or tasks.
    #[error(transparent)]
    Multi(#[from] Box<MultiError>),

    /// Underlying I/O failure outside the codec layer.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Creates a processor error with the given origin and reason.
    pub fn processor(processor: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Processor {
            processor: processor.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an endpoint error with the given URI and reason.
    pub fn endpoint(endpoint: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Endpoint {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

/// Append-only collector of errors from concurrent branches.
///
/// Flattens to `Ok(())` when empty and to the single contained error when it
/// holds exactly one, so callers never wrap needlessly.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<PipelineError>,
}

impl MultiError {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error. `Ok` results are ignored, so branch results can be
    /// fed in unconditionally.
    pub fn add(&mut self, result: Result<(), PipelineError>) {
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    /// Records an error directly.
    pub fn push(&mut self, err: PipelineError) {
        self.errors.push(err);
    }

    /// Number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterates over the collected errors.
    pub fn iter(&self) -> impl Iterator<Item = &PipelineError> {
        self.errors.iter()
    }

    /// Flattens the collector: `Ok` when empty, the single error when one,
    /// otherwise the whole collector.
    pub fn into_result(mut self) -> Result<(), PipelineError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(PipelineError::Multi(Box::new(self))),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
