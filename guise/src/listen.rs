//! Passive open: accepting many flows behind one capture handle.
//!
//! The listener demultiplexes every captured segment by its source
//! address. Flows move through {SYN_RECEIVED, WAIT_HTTP_REQ,
//! HTTP_REP_SENT, ESTABLISHED}; a flow lives in exactly one of two maps
//! (pending or established) and is moved between them in a single
//! critical section under the table mutex. Per-flow state is guarded by
//! that flow's own mutex; the table mutex is never held across a send.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use wire_types::frame::PktLayers;

use crate::capture::{self, FlowFilter, FrameSink, FrameSource, PnetSink, PnetSource, PumpHandle};
use crate::conf::TunnelOpts;
use crate::dial::recv_until;
use crate::error::{GuiseError, Result};
use crate::http;
use crate::template::{FlowTemplate, FrameTx};

/// Lifecycle of one accepted flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowState {
    SynReceived,
    WaitHttpReq,
    HttpRepSent,
    Established,
}

/// Per-flow record owned by the listener.
struct ConnInfo {
    state: FlowState,
    tpl: FlowTemplate,
    /// Cached decoy response, kept until the peer moves past the decoy
    /// exchange so retransmitted requests can be answered byte-identically.
    rep: Option<Vec<u8>>,
    /// Sequence number of the peer's decoy request.
    hseqn: u32,
    mss: u16,
}

type ConnRef = Arc<Mutex<ConnInfo>>;

#[derive(Default)]
struct ConnTables {
    pending: HashMap<SocketAddrV4, ConnRef>,
    established: HashMap<SocketAddrV4, ConnRef>,
}

/// A listen-side tunnel endpoint with a datagram surface.
pub struct RawListener {
    opts: TunnelOpts,
    tables: StdMutex<ConnTables>,
    tx: Mutex<FrameTx>,
    packets: Mutex<mpsc::Receiver<PktLayers>>,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
    local: SocketAddrV4,
    pump: PumpHandle,
}

pub(crate) async fn listen_raw(opts: TunnelOpts, local: &str) -> Result<RawListener> {
    let mut local = resolve_v4(local)?;
    if local.ip().is_unspecified() {
        local.set_ip(Ipv4Addr::LOCALHOST);
    }

    let setup = tokio::task::spawn_blocking(move || -> Result<(PnetSource, PnetSink)> {
        let iface = capture::find_interface(*local.ip())?;
        capture::open_channel(&iface)
    })
    .await
    .map_err(|e| GuiseError::Capture(e.to_string()))?;
    let (source, sink) = setup?;

    info!("listening for tunnel flows on {local}");
    Ok(listen_over(opts, local, Box::new(source), Box::new(sink)))
}

/// Listens over a caller-supplied transport instead of a capture channel.
pub fn listen_over(
    opts: TunnelOpts,
    local: SocketAddrV4,
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
) -> RawListener {
    let filter = FlowFilter::listen(local);
    let (packets, pump) = capture::spawn_capture_pump(source, filter, opts.ignore_rst);
    RawListener {
        opts,
        tables: StdMutex::new(ConnTables::default()),
        tx: Mutex::new(FrameTx::new(sink)),
        packets: Mutex::new(packets),
        read_deadline: StdMutex::new(None),
        write_deadline: StdMutex::new(None),
        local,
        pump,
    }
}

impl RawListener {
    /// Reads the next datagram from any established flow, driving the
    /// per-flow state machines for everything else that arrives.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
        let deadline = self.read_deadline.lock().unwrap().take();
        let mut packets = self.packets.lock().await;
        loop {
            let pkt = recv_until(&mut packets, deadline, self.local).await?;
            let peer = SocketAddrV4::new(pkt.ip.src, pkt.tcp.src_port);

            if pkt.tcp.is_rst() || pkt.tcp.is_fin() {
                self.evict(peer).await;
                continue;
            }

            let established = self.tables.lock().unwrap().established.get(&peer).cloned();
            if let Some(conn) = established {
                if let Some(n) = self.drive_established(&conn, &pkt, buf).await? {
                    return Ok((n, peer));
                }
                continue;
            }

            let pending = self.tables.lock().unwrap().pending.get(&peer).cloned();
            if let Some(conn) = pending {
                self.drive_pending(&conn, peer, &pkt).await?;
                continue;
            }

            self.greet(peer, &pkt).await?;
        }
    }

    /// Emits one PSH+ACK segment to an established peer and advances that
    /// flow's `seq` by the payload length.
    pub async fn write_to(&self, buf: &[u8], peer: SocketAddrV4) -> Result<usize> {
        if self.take_expired_write_deadline() {
            return Err(GuiseError::WriteTimeout(peer));
        }
        let conn = self
            .tables
            .lock()
            .unwrap()
            .established
            .get(&peer)
            .cloned()
            .ok_or(GuiseError::UnknownPeer(peer))?;
        let mut conn = conn.lock().await;
        {
            let mut tx = self.tx.lock().await;
            tx.send_data(&mut conn.tpl, buf)?;
        }
        conn.tpl.layers.tcp.seq = conn.tpl.layers.tcp.seq.wrapping_add(buf.len() as u32);
        Ok(buf.len())
    }

    /// Peer-advertised MSS recorded from the flow's SYN, or 0.
    pub async fn mss_by_addr(&self, peer: SocketAddrV4) -> u16 {
        let conn = self.tables.lock().unwrap().established.get(&peer).cloned();
        match conn {
            Some(conn) => conn.lock().await.mss,
            None => 0,
        }
    }

    /// Arms the one-shot read deadline, replacing any pending one.
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

    /// Emits FIN for every tracked flow and tears the listener down.
    pub async fn close(&self) -> Result<()> {
        let flows: Vec<ConnRef> = {
            let mut tables = self.tables.lock().unwrap();
            let mut flows: Vec<ConnRef> =
                tables.pending.drain().map(|(_, conn)| conn).collect();
            flows.extend(tables.established.drain().map(|(_, conn)| conn));
            flows
        };
        for conn in flows {
            let mut conn = conn.lock().await;
            let mut tx = self.tx.lock().await;
            let _ = tx.send_fin(&mut conn.tpl);
        }
        self.tx.lock().await.closed = true;
        self.pump.stop();
        Ok(())
    }

    /// Removes the flow (from whichever map holds it) and waves it off
    /// with a FIN.
    async fn evict(&self, peer: SocketAddrV4) {
        let removed = {
            let mut tables = self.tables.lock().unwrap();
            tables
                .pending
                .remove(&peer)
                .or_else(|| tables.established.remove(&peer))
        };
        if let Some(conn) = removed {
            debug!("evicting flow from {peer}");
            let mut conn = conn.lock().await;
            let mut tx = self.tx.lock().await;
            let _ = tx.send_fin(&mut conn.tpl);
        }
    }

    /// Handles a segment for a flow in the established table. Returns the
    /// delivered datagram length, or `None` when nothing reaches the
    /// caller.
    async fn drive_established(
        &self,
        conn: &ConnRef,
        pkt: &PktLayers,
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        let mut conn = conn.lock().await;
        let n = pkt.payload.len();
        if n == 0 {
            // Empty PSH+ACK is the peer's keepalive shape.
            if pkt.tcp.is_ack() && pkt.tcp.is_psh() {
                return Ok(Some(0));
            }
            return Ok(None);
        }

        conn.tpl.advance_ack(pkt.tcp.seq, n);
        if conn.state == FlowState::HttpRepSent && pkt.tcp.is_psh() && pkt.tcp.is_ack() {
            if pkt.tcp.seq == conn.hseqn && http::is_request_shaped(&pkt.payload) {
                // The peer missed our decoy response; replay it from the
                // same cursor it was first sent at.
                conn.tpl.layers.tcp.ack = pkt.tcp.seq.wrapping_add(n as u32);
                let rep = conn.rep.clone().unwrap_or_default();
                conn.tpl.layers.tcp.seq = conn.tpl.layers.tcp.seq.wrapping_add(rep.len() as u32);
                let mut tx = self.tx.lock().await;
                tx.send_data(&mut conn.tpl, &rep)?;
            } else {
                conn.rep = None;
                conn.state = FlowState::Established;
            }
        }

        if conn.state == FlowState::Established {
            let n = n.min(buf.len());
            buf[..n].copy_from_slice(&pkt.payload[..n]);
            return Ok(Some(n));
        }
        Ok(None)
    }

    /// Handles a segment for a flow still in the pending table.
    async fn drive_pending(&self, conn: &ConnRef, peer: SocketAddrV4, pkt: &PktLayers) -> Result<()> {
        let mut conn = conn.lock().await;
        match conn.state {
            FlowState::SynReceived => {
                if pkt.tcp.is_ack() && !pkt.tcp.is_psh() && !pkt.tcp.is_fin() && !pkt.tcp.is_syn() {
                    conn.tpl.layers.tcp.seq = conn.tpl.layers.tcp.seq.wrapping_add(1);
                    if self.opts.no_http {
                        conn.state = FlowState::Established;
                        drop(conn);
                        self.promote(peer);
                        debug!("flow from {peer} established");
                    } else {
                        conn.state = FlowState::WaitHttpReq;
                    }
                } else if pkt.tcp.is_syn() && !pkt.tcp.is_ack() && !pkt.tcp.is_psh() {
                    let mut tx = self.tx.lock().await;
                    tx.send_syn_ack(&mut conn.tpl)?;
                }
            }
            FlowState::WaitHttpReq => {
                if pkt.tcp.is_psh() && pkt.tcp.is_ack() && http::is_request_shaped(&pkt.payload) {
                    let n = pkt.payload.len() as u32;
                    conn.tpl.layers.tcp.ack = conn.tpl.layers.tcp.ack.wrapping_add(n);
                    if conn.rep.is_none() {
                        conn.rep = Some(http::build_response().into_bytes());
                    }
                    conn.hseqn = pkt.tcp.seq;
                    let rep = conn.rep.clone().unwrap_or_default();
                    {
                        let mut tx = self.tx.lock().await;
                        tx.send_data(&mut conn.tpl, &rep)?;
                    }
                    conn.state = FlowState::HttpRepSent;
                    drop(conn);
                    self.promote(peer);
                    debug!("flow from {peer} answered decoy request");
                } else if pkt.tcp.is_syn() && !pkt.tcp.is_ack() && !pkt.tcp.is_psh() {
                    let mut tx = self.tx.lock().await;
                    tx.send_syn_ack(&mut conn.tpl)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// First contact from an unknown peer: a clean SYN opens a flow,
    /// anything else gets a fire-and-forget FIN from an ephemeral
    /// template.
    async fn greet(&self, peer: SocketAddrV4, pkt: &PktLayers) -> Result<()> {
        if pkt.tcp.is_syn() && !pkt.tcp.is_ack() && !pkt.tcp.is_psh() && !pkt.tcp.is_fin() {
            let mut tpl = FlowTemplate::listen_reply(pkt, self.opts.dscp);
            tpl.layers.tcp.seq = rand::rngs::OsRng.next_u32();
            let mss = pkt.tcp.mss();
            {
                let mut tx = self.tx.lock().await;
                tx.send_syn_ack(&mut tpl)?;
            }
            let info = ConnInfo {
                state: FlowState::SynReceived,
                tpl,
                rep: None,
                hseqn: 0,
                mss,
            };
            self.tables
                .lock()
                .unwrap()
                .pending
                .insert(peer, Arc::new(Mutex::new(info)));
            debug!("new flow from {peer}");
        } else {
            let mut tpl = FlowTemplate::listen_reply(pkt, self.opts.dscp);
            let mut tx = self.tx.lock().await;
            if let Err(e) = tx.send_fin(&mut tpl) {
                debug!("could not wave off {peer}: {e}");
            }
        }
        Ok(())
    }

    /// Moves a flow from the pending to the established table in one
    /// critical section.
    fn promote(&self, peer: SocketAddrV4) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(conn) = tables.pending.remove(&peer) {
            tables.established.insert(peer, conn);
        }
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

fn resolve_v4(addr: &str) -> Result<SocketAddrV4> {
    if let Ok(addr) = addr.parse::<SocketAddrV4>() {
        return Ok(addr);
    }
    addr.to_socket_addrs()?
        .find_map(|addr| match addr {
            std::net::SocketAddr::V4(addr) => Some(addr),
            std::net::SocketAddr::V6(_) => None,
        })
        .ok_or(GuiseError::NoInterface)
}
