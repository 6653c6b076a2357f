use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use guise::cli::{Cli, Command};
use guise::error::Result;
use guise::{GuiseError, RawConn, RawListener, TunnelOpts};

/// One datagram per read/write; headroom over any sane MSS.
const BUF_SIZE: usize = 65536;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("warn,guise={}", cli.log_level)))
        .init();

    let opts = cli.tunnel_opts()?;
    match cli.command {
        Command::Client { listen, remote } => run_client(&listen, &remote, opts).await,
        Command::Server { listen, forward } => run_server(&listen, &forward, opts).await,
    }
}

/// Relays a local UDP socket through a dialed tunnel.
async fn run_client(listen: &str, remote: &str, opts: TunnelOpts) -> Result<()> {
    let udp = Arc::new(UdpSocket::bind(listen).await?);
    info!("accepting datagrams on {}", udp.local_addr()?);

    let conn = Arc::new(opts.dial_raw(remote).await?);
    info!(
        "tunnel established to {} (mss {})",
        conn.remote_addr(),
        conn.mss()
    );

    // The most recent application peer gets the downstream datagrams.
    let app_peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    tokio::select! {
        result = client_uplink(udp.clone(), conn.clone(), app_peer.clone()) => result,
        result = client_downlink(udp, conn.clone(), app_peer) => result,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            conn.close().await
        }
    }
}

async fn client_uplink(
    udp: Arc<UdpSocket>,
    conn: Arc<RawConn>,
    app_peer: Arc<Mutex<Option<SocketAddr>>>,
) -> Result<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let (n, from) = udp.recv_from(&mut buf).await?;
        *app_peer.lock().unwrap() = Some(from);
        conn.write(&buf[..n]).await?;
    }
}

async fn client_downlink(
    udp: Arc<UdpSocket>,
    conn: Arc<RawConn>,
    app_peer: Arc<Mutex<Option<SocketAddr>>>,
) -> Result<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = conn.read(&mut buf).await?;
        let peer = *app_peer.lock().unwrap();
        if let Some(peer) = peer {
            udp.send_to(&buf[..n], peer).await?;
        }
    }
}

/// Accepts tunnel flows and bridges them to a UDP service.
async fn run_server(listen: &str, forward: &str, opts: TunnelOpts) -> Result<()> {
    let listener = Arc::new(opts.listen_raw(listen).await?);
    let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    udp.connect(forward).await?;
    info!("forwarding tunneled datagrams to {forward}");

    // The most recent tunnel peer gets the service's replies.
    let tunnel_peer: Arc<Mutex<Option<SocketAddrV4>>> = Arc::new(Mutex::new(None));

    tokio::select! {
        result = server_inbound(listener.clone(), udp.clone(), tunnel_peer.clone()) => result,
        result = server_outbound(listener.clone(), udp, tunnel_peer) => result,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            listener.close().await
        }
    }
}

async fn server_inbound(
    listener: Arc<RawListener>,
    udp: Arc<UdpSocket>,
    tunnel_peer: Arc<Mutex<Option<SocketAddrV4>>>,
) -> Result<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let (n, peer) = listener.read_from(&mut buf).await?;
        *tunnel_peer.lock().unwrap() = Some(peer);
        udp.send(&buf[..n]).await?;
    }
}

async fn server_outbound(
    listener: Arc<RawListener>,
    udp: Arc<UdpSocket>,
    tunnel_peer: Arc<Mutex<Option<SocketAddrV4>>>,
) -> Result<()> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = udp.recv(&mut buf).await?;
        let peer = *tunnel_peer.lock().unwrap();
        let Some(peer) = peer else {
            continue;
        };
        match listener.write_to(&buf[..n], peer).await {
            Ok(_) => {}
            Err(e @ GuiseError::UnknownPeer(_)) => warn!("dropping reply: {e}"),
            Err(e) => return Err(e),
        }
    }
}
