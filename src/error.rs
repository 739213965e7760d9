//! Error taxonomy shared across the whole crate.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy described in the design: every fallible public
/// operation returns one of these variants. `Expired` is deliberately
/// absent here — a lease expiry is an asynchronous [`crate::subscription::SubscriptionEvent`],
/// never a return value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// OS/network error from a socket or HTTP operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller used a component out of order (e.g. `start` before `open`).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Content could not be parsed as a well-formed SSDP/GENA message.
    /// Dropped silently by receive loops; never logged above `trace`.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The requested interface has no address of the requested family.
    #[error("no suitable address on interface")]
    NoSuitableAddress,

    /// SUBSCRIBE/RENEW/UNSUBSCRIBE failed: non-200 response, missing
    /// `SID`, or an unparsable `TIMEOUT`.
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}
