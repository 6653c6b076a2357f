//! IPv4 header, which is present after the link layer.
//!
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |ip_ver | h_len |    ip_tos     |        ip_total_length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       ip_identification       |flags|   ip_fragment_offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    ip_ttl     |  ip_protocol  |          ip_checksum          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         source_ipaddr                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      destination_ipaddr                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! Templates always emit a 20-byte header (no IP options); captured frames
//! may carry options, which the parser skips over.

use std::net::Ipv4Addr;

use crate::{checksum, Error};

/// The length of the IPv4 header without options.
pub const IPV4_LEN: usize = 20;

/// Don't-fragment bit within the 3-bit flags field.
pub const IPV4_FLAG_DF: u8 = 0b010;

/// TTL stamped on every fabricated packet.
pub const IPV4_TTL: u8 = 0x40;

/// Protocol carried in the IPv4 payload.
#[repr(u8)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum IpProto {
    #[default]
    Tcp = 6,
    Udp = 17,
}

impl TryFrom<u8> for IpProto {
    type Error = u8; // the unknown value itself

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(IpProto::Tcp),
            17 => Ok(IpProto::Udp),
            _ => Err(value),
        }
    }
}

/// Owned IPv4 header. Version and header length are implied (4, 20);
/// total length and checksum are recomputed on every encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Hdr {
    pub tos: u8,
    pub id: u16,
    /// 3-bit flags field; fabricated packets set [`IPV4_FLAG_DF`].
    pub flags: u8,
    pub ttl: u8,
    pub proto: IpProto,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Hdr {
    /// Appends the 20 header bytes to `out`, with the total length covering
    /// `payload_len` bytes after the header.
    pub fn encode(&self, payload_len: usize, out: &mut Vec<u8>) {
        let start = out.len();
        let total_len = (IPV4_LEN + payload_len) as u16;
        out.push(0x45); // version 4, ihl 5
        out.push(self.tos);
        out.extend_from_slice(&total_len.to_be_bytes());
        out.extend_from_slice(&self.id.to_be_bytes());
        let frag = (u16::from(self.flags) << 13).to_be_bytes();
        out.extend_from_slice(&frag);
        out.push(self.ttl);
        out.push(self.proto as u8);
        out.extend_from_slice(&[0, 0]); // checksum placeholder
        out.extend_from_slice(&self.src.octets());
        out.extend_from_slice(&self.dst.octets());
        let ck = checksum::ipv4_header(&out[start..start + IPV4_LEN]);
        out[start + 10..start + 12].copy_from_slice(&ck.to_be_bytes());
    }

    /// Parses the header at the start of `data`.
    ///
    /// Returns the header plus its on-wire length (options included) so
    /// the caller can locate the payload.
    pub fn parse(data: &[u8]) -> Result<(Ipv4Hdr, usize), Error> {
        if data.len() < IPV4_LEN {
            return Err(Error::Truncated);
        }
        if data[0] >> 4 != 4 {
            return Err(Error::Malformed);
        }
        let hdr_len = usize::from(data[0] & 0x0F) * 4;
        if hdr_len < IPV4_LEN || data.len() < hdr_len {
            return Err(Error::Truncated);
        }
        let proto = IpProto::try_from(data[9]).map_err(|_| Error::Unsupported)?;
        let frag = u16::from_be_bytes([data[6], data[7]]);
        Ok((
            Ipv4Hdr {
                tos: data[1],
                id: u16::from_be_bytes([data[4], data[5]]),
                flags: (frag >> 13) as u8,
                ttl: data[8],
                proto,
                src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
                dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            },
            hdr_len,
        ))
    }

    /// Total length field of an already-validated header slice.
    pub fn total_len(data: &[u8]) -> u16 {
        u16::from_be_bytes([data[2], data[3]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipv4Hdr {
        Ipv4Hdr {
            tos: 0,
            id: 0x1C46,
            flags: IPV4_FLAG_DF,
            ttl: IPV4_TTL,
            proto: IpProto::Tcp,
            src: Ipv4Addr::new(172, 16, 10, 99),
            dst: Ipv4Addr::new(172, 16, 10, 12),
        }
    }

    #[test]
    fn test_ipv4_len_constant() {
        assert_eq!(IPV4_LEN, 20);
    }

    #[test]
    fn test_ip_proto_try_from() {
        assert_eq!(IpProto::try_from(6), Ok(IpProto::Tcp));
        assert_eq!(IpProto::try_from(17), Ok(IpProto::Udp));
        assert_eq!(IpProto::try_from(1), Err(1));
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let hdr = sample();
        let mut out = Vec::new();
        hdr.encode(40, &mut out);
        assert_eq!(out.len(), IPV4_LEN);
        assert_eq!(Ipv4Hdr::total_len(&out), 60);

        let (parsed, hdr_len) = Ipv4Hdr::parse(&out).unwrap();
        assert_eq!(hdr_len, IPV4_LEN);
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn test_encode_sets_df_and_checksum() {
        let hdr = sample();
        let mut out = Vec::new();
        hdr.encode(20, &mut out);
        // DF bit lives at the top of the fragment word
        assert_eq!(out[6] & 0xE0, 0x40);
        // Checksum over the emitted header must verify to zero
        assert_eq!(checksum::fold(checksum::sum_words(&out)), 0);
    }

    #[test]
    fn test_parse_rejects_version_6() {
        let mut bytes = [0u8; IPV4_LEN];
        bytes[0] = 0x65;
        assert_eq!(Ipv4Hdr::parse(&bytes), Err(Error::Malformed));
    }

    #[test]
    fn test_parse_rejects_non_tcp_udp() {
        let hdr = sample();
        let mut out = Vec::new();
        hdr.encode(0, &mut out);
        out[9] = 1; // ICMP
        assert_eq!(Ipv4Hdr::parse(&out), Err(Error::Unsupported));
    }

    #[test]
    fn test_parse_skips_options() {
        let hdr = sample();
        let mut out = Vec::new();
        hdr.encode(0, &mut out);
        out[0] = 0x46; // ihl 6
        out.extend_from_slice(&[1, 1, 1, 1]); // one option word
        let (_, hdr_len) = Ipv4Hdr::parse(&out).unwrap();
        assert_eq!(hdr_len, 24);
    }
}
