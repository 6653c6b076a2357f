//! Per-flow send template and the helpers that emit segments from it.
//!
//! Each flow owns one [`FlowTemplate`] as the single source of truth for
//! its outgoing header values. Every helper clears the control flags,
//! asserts its own, serializes, injects, then post-increments the IPv4 ID
//! and drops the payload. Callers hold the flow mutex across a helper.

use std::net::SocketAddrV4;

use rand::Rng;
use wire_types::eth::EthHdr;
use wire_types::frame::PktLayers;
use wire_types::ip::{IpProto, Ipv4Hdr, IPV4_FLAG_DF, IPV4_TTL};
use wire_types::tcp::{TcpHdr, TcpOption, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN};

use crate::capture::FrameSink;
use crate::error::{GuiseError, Result};

/// Advertised receive window on the active-open side.
pub(crate) const DIAL_WINDOW: u16 = 12580;

/// Advertised receive window on the passive-open side.
pub(crate) const LISTEN_WINDOW: u16 = 32760;

/// Options attached to SYN and SYN/ACK segments.
pub(crate) fn handshake_options() -> Vec<TcpOption> {
    vec![
        TcpOption::mss(1460),
        TcpOption::window_scale(6),
        TcpOption::sack_permitted(),
    ]
}

/// A flow's mutable outgoing header state.
#[derive(Debug, Clone)]
pub(crate) struct FlowTemplate {
    pub layers: PktLayers,
}

impl FlowTemplate {
    /// Template for an active open from `local` toward `peer`.
    pub fn dial(
        local: SocketAddrV4,
        peer: SocketAddrV4,
        eth: Option<EthHdr>,
        dscp: u8,
    ) -> FlowTemplate {
        FlowTemplate {
            layers: PktLayers {
                eth,
                ip: Ipv4Hdr {
                    tos: dscp,
                    id: rand::thread_rng().gen(),
                    flags: IPV4_FLAG_DF,
                    ttl: IPV4_TTL,
                    proto: IpProto::Tcp,
                    src: *local.ip(),
                    dst: *peer.ip(),
                },
                tcp: TcpHdr {
                    src_port: local.port(),
                    dst_port: peer.port(),
                    window: DIAL_WINDOW,
                    ..TcpHdr::default()
                },
                payload: Vec::new(),
            },
        }
    }

    /// Reply template built from a captured segment: addresses, ports and
    /// MACs reversed, `ack` primed past the peer's SYN.
    pub fn listen_reply(captured: &PktLayers, dscp: u8) -> FlowTemplate {
        FlowTemplate {
            layers: PktLayers {
                eth: captured.eth.as_ref().map(EthHdr::reversed),
                ip: Ipv4Hdr {
                    tos: dscp,
                    id: rand::thread_rng().gen(),
                    flags: IPV4_FLAG_DF,
                    ttl: IPV4_TTL,
                    proto: IpProto::Tcp,
                    src: captured.ip.dst,
                    dst: captured.ip.src,
                },
                tcp: TcpHdr {
                    src_port: captured.tcp.dst_port,
                    dst_port: captured.tcp.src_port,
                    ack: captured.tcp.seq.wrapping_add(1),
                    window: LISTEN_WINDOW,
                    ..TcpHdr::default()
                },
                payload: Vec::new(),
            },
        }
    }

    /// The flow's local endpoint as seen by UDP-shaped callers.
    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.layers.ip.src, self.layers.tcp.src_port)
    }

    /// The flow's remote endpoint.
    pub fn remote_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.layers.ip.dst, self.layers.tcp.dst_port)
    }

    /// Clears the control flags ahead of the next send.
    pub fn clear_tcp(&mut self) {
        self.layers.tcp.flags = 0;
    }

    /// Raises `ack` to cover a captured segment, never lowering it.
    pub fn advance_ack(&mut self, seq: u32, len: usize) {
        if u64::from(seq) + len as u64 > u64::from(self.layers.tcp.ack) {
            self.layers.tcp.ack = seq.wrapping_add(len as u32);
        }
    }
}

/// The injection half a flow sends through.
pub(crate) struct FrameTx {
    sink: Box<dyn FrameSink>,
    pub closed: bool,
}

impl FrameTx {
    pub fn new(sink: Box<dyn FrameSink>) -> FrameTx {
        FrameTx {
            sink,
            closed: false,
        }
    }

    fn transmit(&mut self, tpl: &mut FlowTemplate) -> Result<()> {
        if self.closed {
            return Err(GuiseError::Closed);
        }
        let frame = tpl.layers.encode();
        self.sink.inject(&frame)?;
        tpl.layers.ip.id = tpl.layers.ip.id.wrapping_add(1);
        tpl.layers.payload.clear();
        Ok(())
    }

    pub fn send_syn(&mut self, tpl: &mut FlowTemplate) -> Result<()> {
        tpl.clear_tcp();
        tpl.layers.tcp.flags = TCP_FLAG_SYN;
        tpl.layers.tcp.options = handshake_options();
        let sent = self.transmit(tpl);
        tpl.layers.tcp.options.clear();
        sent
    }

    pub fn send_syn_ack(&mut self, tpl: &mut FlowTemplate) -> Result<()> {
        tpl.clear_tcp();
        tpl.layers.tcp.flags = TCP_FLAG_SYN | TCP_FLAG_ACK;
        tpl.layers.tcp.options = handshake_options();
        let sent = self.transmit(tpl);
        tpl.layers.tcp.options.clear();
        sent
    }

    pub fn send_ack(&mut self, tpl: &mut FlowTemplate) -> Result<()> {
        tpl.clear_tcp();
        tpl.layers.tcp.flags = TCP_FLAG_ACK;
        self.transmit(tpl)
    }

    pub fn send_fin(&mut self, tpl: &mut FlowTemplate) -> Result<()> {
        tpl.clear_tcp();
        tpl.layers.tcp.flags = TCP_FLAG_FIN;
        self.transmit(tpl)
    }

    pub fn send_rst(&mut self, tpl: &mut FlowTemplate) -> Result<()> {
        tpl.clear_tcp();
        tpl.layers.tcp.flags = TCP_FLAG_RST;
        self.transmit(tpl)
    }

    /// Emits one PSH+ACK segment carrying `payload`. Does not advance
    /// `seq`; the caller decides whether this send counts against it.
    pub fn send_data(&mut self, tpl: &mut FlowTemplate, payload: &[u8]) -> Result<usize> {
        tpl.clear_tcp();
        tpl.layers.tcp.flags = TCP_FLAG_PSH | TCP_FLAG_ACK;
        tpl.layers.payload = payload.to_vec();
        self.transmit(tpl)?;
        Ok(payload.len())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    use wire_types::frame::LinkKind;

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FrameSink for RecordingSink {
        fn inject(&mut self, frame: &[u8]) -> Result<()> {
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    fn harness() -> (FrameTx, FlowTemplate, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sink = RecordingSink::default();
        let frames = sink.frames.clone();
        let tpl = FlowTemplate::dial(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5000),
            None,
            0,
        );
        (FrameTx::new(Box::new(sink)), tpl, frames)
    }

    fn parse_all(frames: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<PktLayers> {
        frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| PktLayers::parse(f, LinkKind::Loopback).unwrap())
            .collect()
    }

    #[test]
    fn helpers_emit_exactly_their_flags() {
        let (mut tx, mut tpl, frames) = harness();
        tx.send_syn(&mut tpl).unwrap();
        tx.send_syn_ack(&mut tpl).unwrap();
        tx.send_ack(&mut tpl).unwrap();
        tx.send_data(&mut tpl, b"abc").unwrap();
        tx.send_fin(&mut tpl).unwrap();
        tx.send_rst(&mut tpl).unwrap();

        let flags: Vec<u8> = parse_all(&frames).iter().map(|p| p.tcp.flags).collect();
        assert_eq!(
            flags,
            vec![
                TCP_FLAG_SYN,
                TCP_FLAG_SYN | TCP_FLAG_ACK,
                TCP_FLAG_ACK,
                TCP_FLAG_PSH | TCP_FLAG_ACK,
                TCP_FLAG_FIN,
                TCP_FLAG_RST,
            ]
        );
    }

    #[test]
    fn handshake_options_only_on_syn_segments() {
        let (mut tx, mut tpl, frames) = harness();
        tx.send_syn(&mut tpl).unwrap();
        tx.send_ack(&mut tpl).unwrap();
        assert!(tpl.layers.tcp.options.is_empty());

        let pkts = parse_all(&frames);
        assert_eq!(pkts[0].tcp.mss(), 1460);
        assert!(pkts[1].tcp.options.is_empty());
    }

    #[test]
    fn ip_id_increments_per_send() {
        let (mut tx, mut tpl, frames) = harness();
        for _ in 0..5 {
            tx.send_ack(&mut tpl).unwrap();
        }
        let ids: Vec<u16> = parse_all(&frames).iter().map(|p| p.ip.id).collect();
        for pair in ids.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn payload_cleared_after_data_send() {
        let (mut tx, mut tpl, frames) = harness();
        tx.send_data(&mut tpl, b"hello").unwrap();
        assert!(tpl.layers.payload.is_empty());
        tx.send_ack(&mut tpl).unwrap();

        let pkts = parse_all(&frames);
        assert_eq!(pkts[0].payload, b"hello");
        assert!(pkts[1].payload.is_empty());
    }

    #[test]
    fn closed_tx_refuses_to_send() {
        let (mut tx, mut tpl, _) = harness();
        tx.closed = true;
        assert!(matches!(tx.send_ack(&mut tpl), Err(GuiseError::Closed)));
    }

    #[test]
    fn advance_ack_is_monotone() {
        let (_, mut tpl, _) = harness();
        tpl.advance_ack(100, 50);
        assert_eq!(tpl.layers.tcp.ack, 150);
        tpl.advance_ack(40, 10);
        assert_eq!(tpl.layers.tcp.ack, 150);
        tpl.advance_ack(150, 1);
        assert_eq!(tpl.layers.tcp.ack, 151);
    }

    #[test]
    fn listen_reply_reverses_captured_tuple() {
        let (mut tx, mut tpl, frames) = harness();
        tpl.layers.tcp.seq = 9000;
        tx.send_syn(&mut tpl).unwrap();
        let captured = parse_all(&frames).remove(0);

        let reply = FlowTemplate::listen_reply(&captured, 0);
        assert_eq!(reply.layers.ip.src, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(reply.layers.ip.dst, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reply.layers.tcp.src_port, 5000);
        assert_eq!(reply.layers.tcp.dst_port, 4000);
        assert_eq!(reply.layers.tcp.ack, 9001);
        assert_eq!(reply.layers.tcp.window, LISTEN_WINDOW);
    }
}
