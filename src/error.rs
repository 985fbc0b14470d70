//! Error type for the recognizer. Everything recoverable funnels through [`Error`] so callers get
//! one enum to match on, with the kind telling them which stage of setup or decoding went wrong.
//! The DSP and scoring kernels never return errors, they emit sentinel scores instead, so the
//! variants here all surface at API boundaries (init, grammar loading, utterance control).
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A config value is out of range, inconsistent, or refers to something that can't exist
    /// (e.g. an unsupported sample rate, or two grammar sources at once).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A model file parsed but its contents don't hang together (dimension mismatches, bad
    /// headers, senone ids out of range and so on).
    #[error("invalid model data in {path:?}: {reason}")]
    InvalidModel { path: PathBuf, reason: String },

    /// A pronunciation contains a phone the model definition doesn't know.
    #[error("invalid phone {phone:?} in pronunciation for {word:?}")]
    InvalidPhones { word: String, phone: String },

    /// Grammar text (FSG or JSGF) failed to parse.
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// An operation was called in the wrong utterance state, e.g. `process_raw` before
    /// `start_utt`, or `reinit` while decoding.
    #[error("operation invalid in state {state}: {op}")]
    BadState { op: &'static str, state: &'static str },

    /// Forced alignment could not reach the final grammar state even after widening the beams.
    #[error("could not align utterance to {text:?}")]
    AlignmentFailed { text: String },

    /// The search pruned every active path mid-utterance. Usually a sign the beams are far too
    /// tight for the audio.
    #[error("all paths fell out of the beam at frame {frame}")]
    OutOfBeam { frame: i32 },
}

impl Error {
    pub(crate) fn model(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidModel {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(line: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            line,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
