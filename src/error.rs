//! # Errors
//! Every failure in this crate is fatal to the run. The variants only exist so that the
//! diagnostic printed before exiting names the layer that broke.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Hardware or transport provider failure (device, PD, MR, CQ, QP, post, poll).
    #[error("transport provider: {op} failed: {reason}")]
    Transport { op: &'static str, reason: String },

    /// Socket level failure on the out-of-band control channel.
    #[error("control channel: {op} failed: {source}")]
    ControlChannel {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Malformed or truncated peer information.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A computed read target falls outside of the advertised region.
    #[error("offset {offset:#x} (+{len}) is outside of a region of {size} bytes")]
    OutOfBounds { offset: u64, len: u32, size: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Measurements could not be written out.
    #[error("output: {0}")]
    Output(String),
}

impl Error {
    pub(crate) fn transport<S: ToString>(op: &'static str, reason: S) -> Error {
        Error::Transport {
            op,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn channel(op: &'static str, source: io::Error) -> Error {
        Error::ControlChannel { op, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
