//! Error taxonomy for the journal engine (spec §7).

use thiserror::Error;

/// Engine-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors the engine surfaces to its callers.
///
/// `NoSpace` is deliberately absent: under the `Drop` overflow policy the
/// record is silently dropped (an `OVERFLOW` marker stands in for it)
/// rather than returning an error, and under `Wait` the caller either
/// succeeds once space frees up or observes `Interrupted`.
#[derive(Debug, Error)]
pub enum Error {
    /// Physical device read/write failure. Never retried internally.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural or CRC violation in a persistent artefact.
    #[error("invalid on-device structure")]
    Invalid,

    /// Record exceeds `commit_size` under the `TooBig = Error` policy.
    #[error("record of {0} bytes exceeds the commit buffer")]
    TooBig(usize),

    /// Exclusivity required by the caller is held by someone else.
    #[error("resource busy")]
    Busy,

    /// A suspension was cancelled by an interrupt.
    #[error("operation interrupted")]
    Interrupted,

    /// Admin path invoked against a device in an incompatible state.
    #[error("not mounted: {0}")]
    NotMounted(&'static str),
}
