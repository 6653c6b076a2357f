//! UDP header, which is present after the IP header.
//!
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Length             |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! Only parsed here; the tunnel never fabricates UDP. The link-discovery
//! probe matches its own outgoing datagram by these ports.

use crate::Error;

/// The length of the UDP header.
pub const UDP_LEN: usize = 8;

/// Parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHdr {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
}

impl UdpHdr {
    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<UdpHdr, Error> {
        if data.len() < UDP_LEN {
            return Err(Error::Truncated);
        }
        Ok(UdpHdr {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            len: u16::from_be_bytes([data[4], data[5]]),
        })
    }
}
