//! TCP header, which is present after the IP header.
//!
//!    0                   1                   2                   3
//!    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |          Source Port          |       Destination Port        |
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |                        Sequence Number                        |
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |                    Acknowledgment Number                      |
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |  Data |     |N|C|E|U|A|P|R|S|F|                               |
//!   | Offset| Rsrv|S|R|C|R|C|S|S|Y|I|            Window             |
//!   |       |     | |W|E|G|K|H|T|N|N|                               |
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |           Checksum            |         Urgent Pointer        |
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!   |                            Options                            |
//!   /                              ...                              /
//!   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! The flow templates only ever assert the five classic control flags;
//! options are carried as owned values so handshake segments can attach
//! and detach them around a send.

use std::net::Ipv4Addr;

use crate::{checksum, Error};

/// The length of the TCP header without options.
pub const TCP_LEN: usize = 20;

/// TCP flag masks
pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

/// TCP option kinds
pub const TCP_OPT_EOL: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_WSCALE: u8 = 3;
pub const TCP_OPT_SACK_PERMITTED: u8 = 4;

/// A single TCP option as carried in the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl TcpOption {
    /// Maximum segment size option.
    pub fn mss(value: u16) -> TcpOption {
        TcpOption {
            kind: TCP_OPT_MSS,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Window scale option.
    pub fn window_scale(shift: u8) -> TcpOption {
        TcpOption {
            kind: TCP_OPT_WSCALE,
            data: vec![shift],
        }
    }

    /// SACK-permitted option.
    pub fn sack_permitted() -> TcpOption {
        TcpOption {
            kind: TCP_OPT_SACK_PERMITTED,
            data: Vec::new(),
        }
    }
}

/// Owned TCP header. The data offset and checksum are recomputed on every
/// encode; `seq` and `ack` double as the flow's send/receive cursors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpHdr {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<TcpOption>,
}

impl TcpHdr {
    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & TCP_FLAG_PSH != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    /// On-wire header length: 20 plus options padded to a 4-byte boundary.
    pub fn header_len(&self) -> usize {
        let opts: usize = self
            .options
            .iter()
            .map(|o| match o.kind {
                TCP_OPT_EOL | TCP_OPT_NOP => 1,
                _ => 2 + o.data.len(),
            })
            .sum();
        TCP_LEN + (opts + 3) / 4 * 4
    }

    /// Appends the header and `payload` to `out`, computing the data
    /// offset and the checksum over the given pseudo-header addresses.
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        let hdr_len = self.header_len();
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(((hdr_len / 4) as u8) << 4);
        out.push(self.flags);
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(&[0, 0]); // checksum placeholder
        out.extend_from_slice(&self.urgent.to_be_bytes());
        for opt in &self.options {
            match opt.kind {
                TCP_OPT_EOL | TCP_OPT_NOP => out.push(opt.kind),
                _ => {
                    out.push(opt.kind);
                    out.push((2 + opt.data.len()) as u8);
                    out.extend_from_slice(&opt.data);
                }
            }
        }
        out.resize(start + hdr_len, TCP_OPT_EOL); // pad options
        out.extend_from_slice(payload);
        let ck = checksum::tcp_ipv4(src, dst, &out[start..]);
        out[start + 16..start + 18].copy_from_slice(&ck.to_be_bytes());
    }

    /// Parses the header at the start of `data`.
    ///
    /// Returns the header plus its on-wire length so the caller can locate
    /// the payload.
    pub fn parse(data: &[u8]) -> Result<(TcpHdr, usize), Error> {
        if data.len() < TCP_LEN {
            return Err(Error::Truncated);
        }
        let hdr_len = usize::from(data[12] >> 4) * 4;
        if hdr_len < TCP_LEN || data.len() < hdr_len {
            return Err(Error::Truncated);
        }
        let mut options = Vec::new();
        let mut off = TCP_LEN;
        while off < hdr_len {
            match data[off] {
                TCP_OPT_EOL => break,
                TCP_OPT_NOP => {
                    options.push(TcpOption {
                        kind: TCP_OPT_NOP,
                        data: Vec::new(),
                    });
                    off += 1;
                }
                kind => {
                    if off + 1 >= hdr_len {
                        return Err(Error::Malformed);
                    }
                    let len = usize::from(data[off + 1]);
                    if len < 2 || off + len > hdr_len {
                        return Err(Error::Malformed);
                    }
                    options.push(TcpOption {
                        kind,
                        data: data[off + 2..off + len].to_vec(),
                    });
                    off += len;
                }
            }
        }
        Ok((
            TcpHdr {
                src_port: u16::from_be_bytes([data[0], data[1]]),
                dst_port: u16::from_be_bytes([data[2], data[3]]),
                seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                flags: data[13],
                window: u16::from_be_bytes([data[14], data[15]]),
                urgent: u16::from_be_bytes([data[18], data[19]]),
                options,
            },
            hdr_len,
        ))
    }

    /// Peer-advertised maximum segment size from the options; 0 if the
    /// option is absent or empty.
    pub fn mss(&self) -> u16 {
        for opt in &self.options {
            if opt.kind != TCP_OPT_MSS || opt.data.len() < 2 {
                continue;
            }
            return u16::from_be_bytes([opt.data[0], opt.data[1]]);
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TcpHdr {
        TcpHdr {
            src_port: 1234,
            dst_port: 80,
            seq: 0x12345678,
            ack: 0x87654321,
            flags: TCP_FLAG_PSH | TCP_FLAG_ACK,
            window: 12580,
            urgent: 0,
            options: Vec::new(),
        }
    }

    #[test]
    fn test_tcp_len_constant() {
        assert_eq!(TCP_LEN, 20);
    }

    #[test]
    fn test_flag_masks() {
        assert_eq!(TCP_FLAG_FIN, 0x01);
        assert_eq!(TCP_FLAG_SYN, 0x02);
        assert_eq!(TCP_FLAG_RST, 0x04);
        assert_eq!(TCP_FLAG_PSH, 0x08);
        assert_eq!(TCP_FLAG_ACK, 0x10);
        assert_eq!(TCP_FLAG_URG, 0x20);
    }

    #[test]
    fn test_flag_getters() {
        let mut hdr = sample();
        hdr.flags = TCP_FLAG_SYN | TCP_FLAG_ACK;
        assert!(hdr.is_syn());
        assert!(hdr.is_ack());
        assert!(!hdr.is_fin());
        assert!(!hdr.is_rst());
        assert!(!hdr.is_psh());
    }

    #[test]
    fn test_header_len_pads_options() {
        let mut hdr = sample();
        assert_eq!(hdr.header_len(), 20);
        hdr.options.push(TcpOption::mss(1460)); // 4 bytes
        assert_eq!(hdr.header_len(), 24);
        hdr.options.push(TcpOption::window_scale(6)); // +3 -> pads to 8
        assert_eq!(hdr.header_len(), 28);
        hdr.options.push(TcpOption::sack_permitted()); // +2 -> within pad
        assert_eq!(hdr.header_len(), 32);
    }

    #[test]
    fn test_encode_parse_round_trip_with_options() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut hdr = sample();
        hdr.flags = TCP_FLAG_SYN;
        hdr.options = vec![
            TcpOption::mss(1460),
            TcpOption::window_scale(6),
            TcpOption::sack_permitted(),
        ];
        let mut out = Vec::new();
        hdr.encode(src, dst, &[], &mut out);
        assert_eq!(out.len(), hdr.header_len());

        let (parsed, hdr_len) = TcpHdr::parse(&out).unwrap();
        assert_eq!(hdr_len, hdr.header_len());
        assert_eq!(parsed.src_port, hdr.src_port);
        assert_eq!(parsed.seq, hdr.seq);
        assert!(parsed.is_syn());
        assert_eq!(parsed.mss(), 1460);
    }

    #[test]
    fn test_encode_checksum_verifies() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let hdr = sample();
        let payload = b"hello";
        let mut out = Vec::new();
        hdr.encode(src, dst, payload, &mut out);

        let mut sum = checksum::sum_words(&src.octets()) + checksum::sum_words(&dst.octets());
        sum += 6 + out.len() as u32;
        sum += checksum::sum_words(&out);
        assert_eq!(checksum::fold(sum), 0);
    }

    #[test]
    fn test_mss_absent_is_zero() {
        assert_eq!(sample().mss(), 0);
    }

    #[test]
    fn test_mss_short_option_is_skipped() {
        let mut hdr = sample();
        hdr.options.push(TcpOption {
            kind: TCP_OPT_MSS,
            data: vec![0x05],
        });
        assert_eq!(hdr.mss(), 0);
        hdr.options.push(TcpOption::mss(1400));
        assert_eq!(hdr.mss(), 1400);
    }

    #[test]
    fn test_parse_rejects_bad_option_length() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut hdr = sample();
        hdr.options = vec![TcpOption::mss(1460)];
        let mut out = Vec::new();
        hdr.encode(src, dst, &[], &mut out);
        out[21] = 1; // option length below the 2-byte minimum
        assert_eq!(TcpHdr::parse(&out), Err(Error::Malformed));
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert_eq!(TcpHdr::parse(&[0u8; 19]), Err(Error::Truncated));
    }
}
