//! Wire-format types for fabricated TCP flows.
//!
//! Every outgoing segment is built from an owned header template and
//! serialized with recomputed lengths and checksums; every captured frame
//! is parsed back into the same owned types. Nothing here talks to a
//! socket: encoding and decoding are pure functions over byte slices so
//! they can be exercised without privileges.

pub mod checksum;
pub mod eth;
pub mod frame;
pub mod ip;
pub mod tcp;
pub mod udp;

/// Decode failure for a captured frame.
///
/// Callers on the capture path treat every variant the same way (skip the
/// frame); the split exists so tests can assert *why* a frame was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The buffer ended before the header (or its options) did.
    Truncated,
    /// A field held a value the codec cannot represent.
    Malformed,
    /// A well-formed layer this stack does not carry (non-IPv4, non-TCP).
    Unsupported,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated header"),
            Error::Malformed => write!(f, "malformed header"),
            Error::Unsupported => write!(f, "unsupported layer"),
        }
    }
}

impl std::error::Error for Error {}
