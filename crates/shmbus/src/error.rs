use thiserror::Error;

/// Error codes surfaced by the transport core.
///
/// The cyclic buffer and the doorbell only ever return codes, they never log.
/// Layers above decide what (if anything) is worth reporting.
#[derive(Debug, Error)]
pub enum Error {
    /// A wait or lock exceeded its budget. Callers may retry with the
    /// remaining time.
    #[error("operation timed out")]
    TimedOut,

    /// A blocked lock was cancelled by `alert()`. Callers should typically
    /// abandon the operation.
    #[error("wait aborted by alert")]
    Alerted,

    /// A read found no data.
    #[error("no data available")]
    Empty,

    /// A write or reservation could not claim enough space.
    #[error("not enough space to write")]
    WriteError,

    /// The destination was too small for the next record. The record is
    /// consumed; `required` is the size a retry would need.
    #[error("record truncated, {required} bytes required")]
    Truncated {
        /// Full length of the record that was cut.
        required: u16,
    },

    /// The operation is not permitted in the current state, e.g. unlocking a
    /// lock held by another process or reserving while a reservation is open.
    #[error("operation not permitted in current state")]
    IllegalState,

    /// The doorbell (or RPC endpoint) is not paired with its counterpart.
    #[error("endpoint unavailable")]
    Unavailable,

    /// Setup of the backing region or a socket failed. Never produced on the
    /// push/pop hot paths.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Truncated { required: a }, Self::Truncated { required: b }) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
