//! Whole-frame codec: {link, IPv4, TCP, payload}.
//!
//! A [`PktLayers`] is both the per-flow send template (mutated in place
//! between sends) and the parse result for captured frames. Encoding
//! always recomputes length fields and checksums. Parsing is total over
//! arbitrary capture input: anything that is not IPv4+TCP comes back as an
//! error the capture path treats as "skip this frame".

use crate::eth::EthHdr;
use crate::ip::Ipv4Hdr;
use crate::tcp::TcpHdr;
use crate::Error;

/// The length of the loopback/null pseudo-link header.
pub const LOOP_LEN: usize = 4;

/// Protocol family tag carried by the loopback link layer for IPv4.
pub const LOOP_FAMILY_IPV4: u32 = 2;

/// Link framing of a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    Loopback,
}

/// The layers of one fabricated or captured packet.
///
/// `eth` is `None` for loopback flows; such frames are emitted with the
/// 4-byte loopback family tag instead of an Ethernet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PktLayers {
    pub eth: Option<EthHdr>,
    pub ip: Ipv4Hdr,
    pub tcp: TcpHdr,
    pub payload: Vec<u8>,
}

impl PktLayers {
    /// Serializes the frame, recomputing lengths and checksums.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            LOOP_LEN + crate::ip::IPV4_LEN + self.tcp.header_len() + self.payload.len() + 14,
        );
        match &self.eth {
            Some(eth) => eth.encode(&mut out),
            None => out.extend_from_slice(&LOOP_FAMILY_IPV4.to_ne_bytes()),
        }
        let l4_len = self.tcp.header_len() + self.payload.len();
        self.ip.encode(l4_len, &mut out);
        self.tcp
            .encode(self.ip.src, self.ip.dst, &self.payload, &mut out);
        out
    }

    /// Parses a captured frame under the given link framing.
    pub fn parse(frame: &[u8], link: LinkKind) -> Result<PktLayers, Error> {
        let (eth, l2_len) = match link {
            LinkKind::Ethernet => {
                let eth = EthHdr::parse(frame)?;
                if eth.eth_type != crate::eth::EtherType::Ipv4 {
                    return Err(Error::Unsupported);
                }
                (Some(eth), crate::eth::ETH_LEN)
            }
            LinkKind::Loopback => {
                if frame.len() < LOOP_LEN {
                    return Err(Error::Truncated);
                }
                let mut family = [0u8; 4];
                family.copy_from_slice(&frame[..LOOP_LEN]);
                let value = u32::from_ne_bytes(family);
                // Captures written on the other byte order show up swapped.
                if value != LOOP_FAMILY_IPV4 && value.swap_bytes() != LOOP_FAMILY_IPV4 {
                    return Err(Error::Unsupported);
                }
                (None, LOOP_LEN)
            }
        };

        let ip_bytes = &frame[l2_len..];
        let (ip, ip_len) = Ipv4Hdr::parse(ip_bytes)?;
        if ip.proto != crate::ip::IpProto::Tcp {
            return Err(Error::Unsupported);
        }
        let total_len = usize::from(Ipv4Hdr::total_len(ip_bytes));
        if total_len < ip_len || ip_bytes.len() < total_len {
            return Err(Error::Truncated);
        }

        let l4_bytes = &ip_bytes[ip_len..total_len];
        let (tcp, tcp_len) = TcpHdr::parse(l4_bytes)?;
        Ok(PktLayers {
            eth,
            ip,
            tcp,
            payload: l4_bytes[tcp_len..].to_vec(),
        })
    }
}
