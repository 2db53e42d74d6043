/// Errors surfaced by the portal API.
///
/// These map one-to-one onto the conditions callers are expected to branch
/// on; anything the router layer can recover from internally never reaches
/// the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A handle or argument was structurally unusable, for example putting a
    /// portal into itself.
    InvalidArgument,
    /// The operation can never complete: the other side of the route is gone
    /// and everything it sent has been consumed.
    NotFound,
    /// Nothing to retrieve right now, but the other side may still produce
    /// parcels.
    Unavailable,
    /// A conflicting transaction is already in progress on this portal.
    AlreadyExists,
    /// The object is not in a state that permits the operation, for example
    /// installing a trap whose conditions are already met.
    FailedPrecondition,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Error::InvalidArgument => "invalid argument",
            Error::NotFound => "not found",
            Error::Unavailable => "unavailable",
            Error::AlreadyExists => "already exists",
            Error::FailedPrecondition => "failed precondition",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}
