//! Ethernet header, which appears at the beginning of every Ethernet frame.
//!
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     destination_mac_addr                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | destination_mac_addr (con't)  |        source_mac_addr        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    source_mac_addr (con't)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           eth_type            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

use crate::Error;

/// The length of the Ethernet header.
pub const ETH_LEN: usize = 14;

/// A MAC address in wire order.
pub type MacAddr = [u8; 6];

/// Protocol encapsulated in the payload of the Ethernet frame.
#[repr(u16)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum EtherType {
    #[default]
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Ipv6 = 0x86DD,
}

impl TryFrom<u16> for EtherType {
    type Error = u16; // the unknown value itself

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0800 => Ok(EtherType::Ipv4),
            0x0806 => Ok(EtherType::Arp),
            0x86DD => Ok(EtherType::Ipv6),
            _ => Err(value),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(ether_type: EtherType) -> Self {
        ether_type as u16
    }
}

/// Owned Ethernet header used both as a send-template layer and as the
/// parse result for captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHdr {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub eth_type: EtherType,
}

impl EthHdr {
    /// Appends the 14 header bytes to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.dst_mac);
        out.extend_from_slice(&self.src_mac);
        out.extend_from_slice(&u16::from(self.eth_type).to_be_bytes());
    }

    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<EthHdr, Error> {
        if data.len() < ETH_LEN {
            return Err(Error::Truncated);
        }
        let mut dst_mac = [0u8; 6];
        let mut src_mac = [0u8; 6];
        dst_mac.copy_from_slice(&data[0..6]);
        src_mac.copy_from_slice(&data[6..12]);
        let eth_type = EtherType::try_from(u16::from_be_bytes([data[12], data[13]]))
            .map_err(|_| Error::Unsupported)?;
        Ok(EthHdr {
            dst_mac,
            src_mac,
            eth_type,
        })
    }

    /// The same header with source and destination swapped, for reply
    /// templates built from a captured frame.
    pub fn reversed(&self) -> EthHdr {
        EthHdr {
            dst_mac: self.src_mac,
            src_mac: self.dst_mac,
            eth_type: self.eth_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DST: MacAddr = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    const SRC: MacAddr = [0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB];

    #[test]
    fn test_eth_hdr_len() {
        assert_eq!(ETH_LEN, 14);
        assert_eq!(ETH_LEN, 6 + 6 + 2);
    }

    #[test]
    fn test_ethertype_try_from_u16() {
        assert_eq!(EtherType::try_from(0x0800), Ok(EtherType::Ipv4));
        assert_eq!(EtherType::try_from(0x0806), Ok(EtherType::Arp));
        assert_eq!(EtherType::try_from(0x86DD), Ok(EtherType::Ipv6));
        assert_eq!(EtherType::try_from(0x1234), Err(0x1234));
    }

    #[test]
    fn test_encode_layout() {
        let hdr = EthHdr {
            dst_mac: DST,
            src_mac: SRC,
            eth_type: EtherType::Ipv4,
        };
        let mut out = Vec::new();
        hdr.encode(&mut out);
        assert_eq!(out.len(), ETH_LEN);
        assert_eq!(&out[0..6], &DST);
        assert_eq!(&out[6..12], &SRC);
        assert_eq!(&out[12..14], &[0x08, 0x00]);
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert_eq!(EthHdr::parse(&[0u8; 13]), Err(Error::Truncated));
    }

    #[test]
    fn test_parse_rejects_unknown_ethertype() {
        let mut bytes = [0u8; 14];
        bytes[12] = 0x12;
        bytes[13] = 0x34;
        assert_eq!(EthHdr::parse(&bytes), Err(Error::Unsupported));
    }

    #[test]
    fn test_reversed_swaps_macs() {
        let hdr = EthHdr {
            dst_mac: DST,
            src_mac: SRC,
            eth_type: EtherType::Ipv4,
        };
        let rev = hdr.reversed();
        assert_eq!(rev.dst_mac, SRC);
        assert_eq!(rev.src_mac, DST);
        assert_eq!(rev.eth_type, EtherType::Ipv4);
    }
}
