//! Active open and the dial-side connection surface.
//!
//! Dialing fabricates the client half of a TCP handshake, optionally the
//! HTTP decoy request, and then hands back a [`RawConn`] that reads and
//! writes single-segment datagrams. A UDP socket connected to the peer is
//! used once to learn the local address and then held for the life of the
//! connection so the port stays reserved.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::{Rng, RngCore};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;
use wire_types::eth::{EtherType, EthHdr};
use wire_types::frame::PktLayers;

use crate::capture::{self, FlowFilter, FrameSink, FrameSource, PnetSink, PnetSource, PumpHandle};
use crate::conf::TunnelOpts;
use crate::error::{GuiseError, Result};
use crate::http;
use crate::pacer;
use crate::template::{FlowTemplate, FrameTx};

/// Handshake attempts (both phases) before giving up.
const HANDSHAKE_ATTEMPTS: usize = 6;

/// Everything the send path touches, guarded by one mutex per flow.
pub(crate) struct ConnShared {
    pub tpl: FlowTemplate,
    pub tx: FrameTx,
    /// Sequence number of the peer's decoy response, used to drop its
    /// retransmissions from the datagram stream.
    pub hseqn: u32,
    pub mss: u16,
}

/// A dial-side tunnel connection with a datagram surface.
pub struct RawConn {
    shared: Arc<Mutex<ConnShared>>,
    packets: Mutex<mpsc::Receiver<PktLayers>>,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
    local: SocketAddrV4,
    peer: SocketAddrV4,
    mss: u16,
    udp: StdMutex<Option<UdpSocket>>,
    pump: PumpHandle,
    pacer: JoinHandle<()>,
}

impl std::fmt::Debug for RawConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("mss", &self.mss)
            .finish()
    }
}

pub(crate) async fn dial_raw(opts: TunnelOpts, remote: &str) -> Result<RawConn> {
    let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    udp.connect(remote)?;
    let peer = expect_v4(udp.peer_addr()?)?;
    let local = expect_v4(udp.local_addr()?)?;

    let setup = tokio::task::spawn_blocking(move || -> Result<(PnetSource, PnetSink, Option<EthHdr>)> {
        let iface = capture::find_interface(*local.ip())?;
        let (mut source, sink) = capture::open_channel(&iface)?;
        let eth = if local.ip().is_loopback() {
            None
        } else {
            let (src_mac, dst_mac) = capture::discover_link(&mut source)?;
            Some(EthHdr {
                dst_mac,
                src_mac,
                eth_type: EtherType::Ipv4,
            })
        };
        Ok((source, sink, eth))
    })
    .await
    .map_err(|e| GuiseError::Capture(e.to_string()))?;
    let (source, sink, eth) = setup?;

    dial_inner(
        opts,
        local,
        peer,
        Box::new(source),
        Box::new(sink),
        eth,
        Some(udp),
    )
    .await
}

/// Dials over a caller-supplied transport instead of a capture channel.
/// The transport decides the link framing; no MAC discovery runs.
pub async fn dial_over(
    opts: TunnelOpts,
    local: SocketAddrV4,
    peer: SocketAddrV4,
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
) -> Result<RawConn> {
    dial_inner(opts, local, peer, source, sink, None, None).await
}

async fn dial_inner(
    opts: TunnelOpts,
    local: SocketAddrV4,
    peer: SocketAddrV4,
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    eth: Option<EthHdr>,
    udp: Option<UdpSocket>,
) -> Result<RawConn> {
    let filter = FlowFilter::dial(local, peer);
    let (mut packets, pump) = capture::spawn_capture_pump(source, filter, opts.ignore_rst);

    let mut tpl = FlowTemplate::dial(local, peer, eth, opts.dscp);
    tpl.layers.tcp.seq = rand::rngs::OsRng.next_u32();
    let shared = Arc::new(Mutex::new(ConnShared {
        tpl,
        tx: FrameTx::new(sink),
        hseqn: 0,
        mss: 0,
    }));

    if let Err(e) = handshake(&shared, &mut packets, &opts, peer).await {
        let mut guard = shared.lock().await;
        let ConnShared { tpl, tx, .. } = &mut *guard;
        let _ = tx.send_fin(tpl);
        return Err(e);
    }
    debug!("tunnel to {peer} established");

    let mss = shared.lock().await.mss;
    let pacer = pacer::spawn(shared.clone());
    Ok(RawConn {
        shared,
        packets: Mutex::new(packets),
        read_deadline: StdMutex::new(None),
        write_deadline: StdMutex::new(None),
        local,
        peer,
        mss,
        udp: StdMutex::new(udp),
        pump,
        pacer,
    })
}

async fn handshake(
    shared: &Arc<Mutex<ConnShared>>,
    packets: &mut mpsc::Receiver<PktLayers>,
    opts: &TunnelOpts,
    peer: SocketAddrV4,
) -> Result<()> {
    // Phase 1: SYN -> SYN/ACK -> ACK.
    let mut ackn = 0u32;
    let mut seqn = 0u32;
    let mut attempt = 0;
    'syn: loop {
        if attempt == HANDSHAKE_ATTEMPTS {
            return Err(GuiseError::RetryExhausted);
        }
        attempt += 1;
        {
            let mut guard = shared.lock().await;
            let ConnShared { tpl, tx, .. } = &mut *guard;
            tx.send_syn(tpl)?;
        }
        let deadline = jittered_deadline();
        loop {
            let pkt = match recv_until(packets, Some(deadline), peer).await {
                Ok(pkt) => pkt,
                Err(e) if e.is_temporary() => continue 'syn,
                Err(e) => return Err(e),
            };
            if pkt.tcp.is_syn() && pkt.tcp.is_ack() {
                let mut guard = shared.lock().await;
                guard.mss = pkt.tcp.mss();
                let ConnShared { tpl, tx, .. } = &mut *guard;
                tpl.layers.tcp.ack = pkt.tcp.seq.wrapping_add(1);
                tpl.layers.tcp.seq = tpl.layers.tcp.seq.wrapping_add(1);
                ackn = tpl.layers.tcp.ack;
                seqn = tpl.layers.tcp.seq;
                tx.send_ack(tpl)?;
                break 'syn;
            }
        }
    }

    if opts.no_http {
        return Ok(());
    }

    // Phase 2: decoy request -> decoy response. The request send does not
    // advance seq; the cursor moves only once the response lands.
    let req = http::build_request(opts.host.as_deref());
    let mut attempt = 0;
    'req: loop {
        if attempt == HANDSHAKE_ATTEMPTS {
            return Err(GuiseError::RetryExhausted);
        }
        attempt += 1;
        {
            let mut guard = shared.lock().await;
            let ConnShared { tpl, tx, .. } = &mut *guard;
            tx.send_data(tpl, req.as_bytes())?;
        }
        let deadline = jittered_deadline();
        loop {
            let pkt = match recv_until(packets, Some(deadline), peer).await {
                Ok(pkt) => pkt,
                Err(e) if e.is_temporary() => continue 'req,
                Err(e) => return Err(e),
            };
            if pkt.tcp.is_syn() && pkt.tcp.is_ack() {
                // Our handshake ACK was lost; restore the saved cursors
                // and answer the retransmitted SYN/ACK again.
                let mut guard = shared.lock().await;
                let ConnShared { tpl, tx, .. } = &mut *guard;
                tpl.layers.tcp.ack = ackn;
                tpl.layers.tcp.seq = seqn;
                tx.send_ack(tpl)?;
                continue 'req;
            }
            if pkt.tcp.is_psh() && pkt.tcp.is_ack() && http::is_response_shaped(&pkt.payload) {
                let mut guard = shared.lock().await;
                guard.hseqn = pkt.tcp.seq;
                guard.tpl.layers.tcp.seq = seqn.wrapping_add(req.len() as u32);
                guard.tpl.layers.tcp.ack = pkt.tcp.seq.wrapping_add(pkt.payload.len() as u32);
                return Ok(());
            }
        }
    }
}

impl RawConn {
    /// Reads the next datagram, returning the sending peer as captured
    /// off the wire. A stray SYN/ACK retransmit is answered with a bare
    /// ACK and skipped; a retransmit of the decoy response is dropped.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        let deadline = self.read_deadline.lock().unwrap().take();
        let mut packets = self.packets.lock().await;
        loop {
            let pkt = recv_until(&mut packets, deadline, self.peer).await?;
            if pkt.tcp.is_syn() && pkt.tcp.is_ack() {
                let mut guard = self.shared.lock().await;
                let ConnShared { tpl, tx, .. } = &mut *guard;
                tx.send_ack(tpl)?;
                continue;
            }
            if !pkt.tcp.is_psh() || !pkt.tcp.is_ack() {
                continue;
            }
            let mut guard = self.shared.lock().await;
            if pkt.tcp.seq == guard.hseqn {
                continue;
            }
            let from = SocketAddrV4::new(pkt.ip.src, pkt.tcp.src_port);
            let len = pkt.payload.len();
            if len == 0 {
                return Ok((0, from));
            }
            guard.tpl.advance_ack(pkt.tcp.seq, len);
            let n = len.min(buf.len());
            buf[..n].copy_from_slice(&pkt.payload[..n]);
            return Ok((n, from));
        }
    }

    /// Reads the next datagram.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_from(buf).await.map(|(n, _)| n)
    }

    /// Emits one PSH+ACK segment carrying `buf` and advances `seq` by its
    /// length. The payload must fit one segment; nothing fragments here.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.take_expired_write_deadline() {
            return Err(GuiseError::WriteTimeout(self.peer));
        }
        let mut guard = self.shared.lock().await;
        let ConnShared { tpl, tx, .. } = &mut *guard;
        let n = tx.send_data(tpl, buf)?;
        tpl.layers.tcp.seq = tpl.layers.tcp.seq.wrapping_add(n as u32);
        Ok(n)
    }

    /// Arms the one-shot read deadline, replacing any pending one.
    /// `None` clears it; a deadline already in the past fails the next
    /// read with a temporary timeout.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock().unwrap() = deadline;
    }

    /// Arms the one-shot write deadline, replacing any pending one.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock().unwrap() = deadline;
    }

    /// Arms both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.peer
    }

    /// Peer-advertised MSS from the handshake, or 0 if none was sent.
    pub fn mss(&self) -> u16 {
        self.mss
    }

    /// Emits FIN and tears the connection down. Pending and future reads
    /// fail with "read from closed connection" once the buffered packets
    /// drain.
    pub async fn close(&self) -> Result<()> {
        self.pacer.abort();
        {
            let mut guard = self.shared.lock().await;
            if !guard.tx.closed {
                let ConnShared { tpl, tx, .. } = &mut *guard;
                let _ = tx.send_fin(tpl);
                tx.closed = true;
            }
        }
        self.pump.stop();
        self.udp.lock().unwrap().take();
        Ok(())
    }

    fn take_expired_write_deadline(&self) -> bool {
        let mut deadline = self.write_deadline.lock().unwrap();
        match *deadline {
            Some(t) if Instant::now() >= t => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for RawConn {
    fn drop(&mut self) {
        self.pacer.abort();
    }
}

/// Waits for the next in-filter packet, bounded by `deadline` if armed.
pub(crate) async fn recv_until(
    packets: &mut mpsc::Receiver<PktLayers>,
    deadline: Option<Instant>,
    peer: SocketAddrV4,
) -> Result<PktLayers> {
    match deadline {
        Some(deadline) => {
            match tokio::time::timeout_at(deadline.into(), packets.recv()).await {
                Ok(Some(pkt)) => Ok(pkt),
                Ok(None) => Err(GuiseError::Closed),
                Err(_) => Err(GuiseError::ReadTimeout(peer)),
            }
        }
        None => packets.recv().await.ok_or(GuiseError::Closed),
    }
}

fn jittered_deadline() -> Instant {
    Instant::now() + Duration::from_millis(rand::thread_rng().gen_range(500..1000))
}

fn expect_v4(addr: SocketAddr) -> Result<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(_) => Err(GuiseError::NoInterface),
    }
}
