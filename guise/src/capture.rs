//! Capture and injection over a network interface.
//!
//! The endpoint owns one capture handle. A pump thread drains it, parses
//! each frame, narrows the stream through a [`FlowFilter`], and forwards
//! surviving packets into a bounded channel consumed by the read paths.
//! Injection goes through the paired [`FrameSink`].
//!
//! The pnet implementations wrap an AF_PACKET datalink channel; tests and
//! simulations substitute the in-memory transport from [`crate::pipe`].

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pnet::datalink::{self, NetworkInterface};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use wire_types::eth::{EtherType, EthHdr, MacAddr, ETH_LEN};
use wire_types::frame::{LinkKind, PktLayers};
use wire_types::ip::{IpProto, Ipv4Hdr};
use wire_types::udp::UdpHdr;

use crate::error::{GuiseError, Result};

/// Capacity of the parsed-packet channel between the pump and readers.
pub const PACKET_CHANNEL_CAPACITY: usize = 1024;

/// How long link discovery waits for its probe frame to appear.
const LINK_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// One end of a frame transport: raw frames captured off the wire.
///
/// `next_frame` returns `Ok(None)` on a poll tick with nothing captured so
/// callers can interleave deadline checks; `Err(Closed)` once the handle
/// is gone.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Link framing this source captures with.
    fn link(&self) -> LinkKind;
}

/// The other end: fully-formed frames written back to the wire.
pub trait FrameSink: Send + 'static {
    fn inject(&mut self, frame: &[u8]) -> Result<()>;
}

/// Per-instance predicate narrowing the captured stream to one flow
/// (dial: exact 4-tuple) or one bound endpoint (listen: 2-tuple).
#[derive(Debug, Clone, Copy)]
pub struct FlowFilter {
    local: SocketAddrV4,
    peer: Option<SocketAddrV4>,
}

impl FlowFilter {
    /// Matches only segments from `peer` to `local`.
    pub fn dial(local: SocketAddrV4, peer: SocketAddrV4) -> FlowFilter {
        FlowFilter {
            local,
            peer: Some(peer),
        }
    }

    /// Matches all segments addressed to `local`.
    pub fn listen(local: SocketAddrV4) -> FlowFilter {
        FlowFilter { local, peer: None }
    }

    pub fn matches(&self, pkt: &PktLayers) -> bool {
        if pkt.ip.dst != *self.local.ip() || pkt.tcp.dst_port != self.local.port() {
            return false;
        }
        match self.peer {
            Some(peer) => pkt.ip.src == *peer.ip() && pkt.tcp.src_port == peer.port(),
            None => true,
        }
    }
}

/// Picks the interface whose addresses include `local_ip`.
pub fn find_interface(local_ip: Ipv4Addr) -> Result<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| {
            iface
                .ips
                .iter()
                .any(|net| net.ip() == std::net::IpAddr::V4(local_ip))
        })
        .ok_or(GuiseError::NoInterface)
}

/// Opens `iface` promiscuously with a 1 ms poll interval.
pub fn open_channel(iface: &NetworkInterface) -> Result<(PnetSource, PnetSink)> {
    let config = datalink::Config {
        read_timeout: Some(Duration::from_millis(1)),
        read_buffer_size: 65536,
        write_buffer_size: 65536,
        promiscuous: true,
        ..Default::default()
    };
    let link = if iface.is_loopback() {
        LinkKind::Loopback
    } else {
        LinkKind::Ethernet
    };
    match datalink::channel(iface, config) {
        Ok(datalink::Channel::Ethernet(tx, rx)) => {
            debug!("opened capture channel on {}", iface.name);
            Ok((PnetSource { rx, link }, PnetSink { tx }))
        }
        Ok(_) => Err(GuiseError::Capture(format!(
            "unsupported channel type on {}",
            iface.name
        ))),
        Err(e) => Err(GuiseError::Capture(format!(
            "cannot open {}: {e}",
            iface.name
        ))),
    }
}

pub struct PnetSource {
    rx: Box<dyn datalink::DataLinkReceiver>,
    link: LinkKind,
}

impl FrameSource for PnetSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(GuiseError::Io(e)),
        }
    }

    fn link(&self) -> LinkKind {
        self.link
    }
}

pub struct PnetSink {
    tx: Box<dyn datalink::DataLinkSender>,
}

impl FrameSink for PnetSink {
    fn inject(&mut self, frame: &[u8]) -> Result<()> {
        match self.tx.send_to(frame, None) {
            Some(result) => result.map_err(GuiseError::Io),
            None => Err(GuiseError::Closed),
        }
    }
}

/// Stops a capture pump, standing in for closing the capture handle.
///
/// Once stopped, the pump drops its sender; a reader blocked on the
/// packet channel wakes up with "read from closed connection" as soon as
/// the buffered packets drain.
#[derive(Clone)]
pub struct PumpHandle {
    stop: Arc<AtomicBool>,
}

impl PumpHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Spawns the pump thread: capture, parse, filter, forward.
///
/// Malformed and foreign frames are dropped without a trace; RST segments
/// are dropped too when `ignore_rst` is set. The pump exits once the
/// source dies, the receiving side is dropped, or the handle is stopped.
pub fn spawn_capture_pump(
    mut source: Box<dyn FrameSource>,
    filter: FlowFilter,
    ignore_rst: bool,
) -> (mpsc::Receiver<PktLayers>, PumpHandle) {
    let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let handle = PumpHandle { stop: stop.clone() };
    std::thread::spawn(move || {
        let link = source.link();
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    if tx.is_closed() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    debug!("capture pump stopping: {e}");
                    break;
                }
            };
            let pkt = match PktLayers::parse(&frame, link) {
                Ok(pkt) => pkt,
                Err(_) => continue,
            };
            if ignore_rst && pkt.tcp.is_rst() {
                continue;
            }
            if !filter.matches(&pkt) {
                continue;
            }
            if tx.blocking_send(pkt).is_err() {
                break;
            }
        }
        debug!("capture pump exited");
    });
    (rx, handle)
}

/// Learns the egress MAC pair by watching our own probe leave the host.
///
/// Sends one UDP datagram toward an unreachable 8.8.x.y address and waits
/// for the frame to show up on the capture handle; its Ethernet header
/// carries the source and gateway MACs this flow must use.
pub fn discover_link(source: &mut dyn FrameSource) -> Result<(MacAddr, MacAddr)> {
    let mut rng = rand::thread_rng();
    let probe_dst = SocketAddrV4::new(
        Ipv4Addr::new(8, 8, rng.gen(), rng.gen()),
        rng.gen_range(1024..u16::MAX),
    );
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let local_port = match probe.local_addr()? {
        std::net::SocketAddr::V4(addr) => addr.port(),
        std::net::SocketAddr::V6(_) => return Err(GuiseError::NoInterface),
    };
    let payload: [u8; 32] = rng.gen();
    probe.send_to(&payload, probe_dst)?;

    let deadline = Instant::now() + LINK_PROBE_TIMEOUT;
    while Instant::now() < deadline {
        let Some(frame) = source.next_frame()? else {
            continue;
        };
        if let Some(macs) = match_probe_frame(&frame, probe_dst, local_port) {
            return Ok(macs);
        }
    }
    warn!("link discovery probe went unanswered");
    Err(GuiseError::Capture("link discovery timed out".to_string()))
}

fn match_probe_frame(
    frame: &[u8],
    probe_dst: SocketAddrV4,
    local_port: u16,
) -> Option<(MacAddr, MacAddr)> {
    let eth = EthHdr::parse(frame).ok()?;
    if eth.eth_type != EtherType::Ipv4 {
        return None;
    }
    let (ip, ip_len) = Ipv4Hdr::parse(&frame[ETH_LEN..]).ok()?;
    if ip.proto != IpProto::Udp || ip.dst != *probe_dst.ip() {
        return None;
    }
    let udp = UdpHdr::parse(&frame[ETH_LEN + ip_len..]).ok()?;
    if udp.src_port != local_port || udp.dst_port != probe_dst.port() {
        return None;
    }
    Some((eth.src_mac, eth.dst_mac))
}
