use std::fmt::Display;

/// AshFS errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// On-device metadata could not be decoded: missing mandatory tag,
    /// zero-length filename, extent pointing into no zone, bad checksum.
    Corruption(String),
    /// A zone or the allocator cannot host the request. NoSpace from a zone
    /// is recoverable by rotating to a new zone; NoSpace from the allocator
    /// is surfaced to the caller.
    NoSpace(String),
    /// A device read, write, ioctl or async completion failed.
    IO(String),
    /// Invalid user input or device configuration: skip past end of file,
    /// positioned append not at the write pointer, unsupported scheduler,
    /// too few zones.
    InvalidArgument(String),
    /// The referenced file does not exist, or the device holds no filesystem.
    NotFound(String),
    /// The device cannot be used at all, e.g. it is not host-managed.
    NotSupported(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NoSpace(msg) => write!(f, "no space: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
        }
    }
}

/// An AshFS Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::Corruption("file id missing".to_string()).to_string(),
            "corruption: file id missing"
        );
        assert_eq!(
            Error::NoSpace("zone full".to_string()).to_string(),
            "no space: zone full"
        );
    }

    #[test]
    fn test_from_io_error() {
        let err: Error = std::io::Error::other("boom").into();
        assert!(matches!(err, Error::IO(_)));
    }
}
