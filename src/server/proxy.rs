//! Remote listeners
//!
//! One proxy = one remote listener owned by a session. Stream proxies
//! (tcp/http/https) run an accept loop that feeds the work-connection
//! broker; udp proxies relay datagrams through UDPPacket control messages.
//! Port policy: deny wins over allow, `remote_port = 0` picks a free port
//! from the allow set (or lets the OS choose when the set is open).

use super::broker;
use super::Shared;
use crate::config::parse_bandwidth;
use crate::crypto::derive_data_keys;
use crate::protocol::{Message, NewProxy, ProxyType, UdpPacket};
use crate::relay::TrafficCounters;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cap on unmatched work-connection requests per proxy; accepts beyond it
/// are dropped immediately.
const MAX_UNMATCHED_REQUESTS: usize = 1024;

/// Largest datagram relayed for a udp proxy.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// State shared between a proxy's accept loop and its request tasks.
pub(crate) struct ProxyRuntime {
    pub name: String,
    pub run_id: String,
    /// Address the listener is bound to, reported in StartWorkConn.
    pub bind_ip: String,
    pub port: u16,
    pub bandwidth_limit: u64,
    /// (client-to-server, server-to-client) envelope keys when the proxy
    /// opted into data-plane encryption.
    pub data_keys: Option<([u8; 32], [u8; 32])>,
    pub counters: Arc<TrafficCounters>,
    pub session_counters: Arc<TrafficCounters>,
    pub out_tx: mpsc::Sender<Message>,
    /// Session-wide strictly increasing request ids.
    pub request_ids: Arc<AtomicU64>,
    /// Requests accepted but not yet matched or timed out.
    pub unmatched: AtomicUsize,
}

/// A live proxy owned by one session.
pub(crate) struct ProxyHandle {
    pub name: String,
    pub proxy_type: ProxyType,
    /// "ip:port" as reported in NewProxyResp.
    pub bound_addr: String,
    pub port: u16,
    pub counters: Arc<TrafficCounters>,
    /// Inbound datagrams routed from the control stream (udp proxies only).
    pub udp_tx: Option<mpsc::Sender<UdpPacket>>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Close the listener, release the port, and drop pending requests.
    /// Returns once the listener socket is gone, so the port is reusable.
    pub async fn destroy(self, shared: &Arc<Shared>, run_id: &str) {
        let _ = self.cancel_tx.send(true);
        let _ = self.task.await;
        shared.ports.release(self.port);
        shared.pending.remove_proxy(run_id, &self.name);

        let (bytes_in, bytes_out) = self.counters.totals();
        debug!(
            proxy = %self.name,
            proxy_type = %self.proxy_type,
            port = self.port,
            bytes_in,
            bytes_out,
            "proxy destroyed"
        );
    }
}

/// Everything a session passes in when creating proxies.
pub(crate) struct ProxyContext {
    pub run_id: String,
    pub out_tx: mpsc::Sender<Message>,
    pub session_counters: Arc<TrafficCounters>,
    pub request_ids: Arc<AtomicU64>,
}

/// Create a remote listener for `req`. The error string travels back to
/// the client in NewProxyResp and leaves no listener behind.
pub(crate) async fn create_proxy(
    shared: &Arc<Shared>,
    ctx: &ProxyContext,
    req: &NewProxy,
) -> Result<ProxyHandle, String> {
    let bandwidth_limit = if req.bandwidth_limit.is_empty() {
        0
    } else {
        parse_bandwidth(&req.bandwidth_limit)?
    };

    if req.remote_port != 0 {
        check_port_policy(shared, req.remote_port)?;
        if shared.ports.owner(req.remote_port).is_some() {
            return Err(format!("port {} already in use", req.remote_port));
        }
    }

    let data_keys = req
        .use_encryption
        .then(|| derive_data_keys(&shared.config.auth_token, &ctx.run_id, &req.proxy_name));

    match req.proxy_type {
        ProxyType::Tcp | ProxyType::Http | ProxyType::Https => {
            create_stream_proxy(shared, ctx, req, bandwidth_limit, data_keys).await
        }
        ProxyType::Udp => create_udp_proxy(shared, ctx, req).await,
    }
}

fn check_port_policy(shared: &Arc<Shared>, port: u16) -> Result<(), String> {
    if shared.deny_ports.contains(port) {
        return Err(format!("port {} denied by policy", port));
    }
    if !shared.allow_ports.is_empty() && !shared.allow_ports.contains(port) {
        return Err(format!("port {} outside allowed range", port));
    }
    Ok(())
}

/// Bind a listener honoring the port policy. `port == 0` walks the allow
/// set (or asks the OS when the set is open) for a free port.
async fn bind_stream_listener(
    shared: &Arc<Shared>,
    requested_port: u16,
) -> Result<TcpListener, String> {
    let bind_ip = &shared.config.proxy.bind_addr;

    if requested_port != 0 {
        return TcpListener::bind((bind_ip.as_str(), requested_port))
            .await
            .map_err(|e| format!("bind failed: {}", e));
    }

    if shared.allow_ports.is_empty() {
        let listener = TcpListener::bind((bind_ip.as_str(), 0))
            .await
            .map_err(|e| format!("bind failed: {}", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| format!("bind failed: {}", e))?
            .port();
        check_port_policy(shared, port)?;
        return Ok(listener);
    }

    // Closed allow set: first free allowed port wins
    for port in shared.allow_ports.iter_ports() {
        if shared.deny_ports.contains(port) || shared.ports.owner(port).is_some() {
            continue;
        }
        if let Ok(listener) = TcpListener::bind((bind_ip.as_str(), port)).await {
            return Ok(listener);
        }
    }
    Err("no allowed port available".to_string())
}

async fn create_stream_proxy(
    shared: &Arc<Shared>,
    ctx: &ProxyContext,
    req: &NewProxy,
    bandwidth_limit: u64,
    data_keys: Option<([u8; 32], [u8; 32])>,
) -> Result<ProxyHandle, String> {
    let listener = bind_stream_listener(shared, req.remote_port).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| format!("bind failed: {}", e))?;

    if !shared.ports.claim(bound.port(), &ctx.run_id, &req.proxy_name) {
        // Lost the race between policy check and bind
        return Err(format!("port {} already in use", bound.port()));
    }

    let counters = Arc::new(TrafficCounters::new());
    let runtime = Arc::new(ProxyRuntime {
        name: req.proxy_name.clone(),
        run_id: ctx.run_id.clone(),
        bind_ip: bound.ip().to_string(),
        port: bound.port(),
        bandwidth_limit,
        data_keys,
        counters: counters.clone(),
        session_counters: ctx.session_counters.clone(),
        out_tx: ctx.out_tx.clone(),
        request_ids: ctx.request_ids.clone(),
        unmatched: AtomicUsize::new(0),
    });

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(run_accept_loop(
        shared.clone(),
        runtime,
        listener,
        cancel_rx,
    ));

    Ok(ProxyHandle {
        name: req.proxy_name.clone(),
        proxy_type: req.proxy_type,
        bound_addr: bound.to_string(),
        port: bound.port(),
        counters,
        udp_tx: None,
        cancel_tx,
        task,
    })
}

async fn run_accept_loop(
    shared: Arc<Shared>,
    rt: Arc<ProxyRuntime>,
    listener: TcpListener,
    mut cancel: watch::Receiver<bool>,
) {
    debug!(proxy = %rt.name, port = rt.port, "accept loop started");
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            accepted = listener.accept() => {
                let (user, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(proxy = %rt.name, error = %e, "accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if rt.unmatched.load(Ordering::Relaxed) >= MAX_UNMATCHED_REQUESTS {
                    // Broker backpressure: drop the connection outright
                    warn!(proxy = %rt.name, "too many unmatched requests, dropping user connection");
                    drop(user);
                    continue;
                }
                rt.unmatched.fetch_add(1, Ordering::Relaxed);

                user.set_nodelay(true).ok();
                tokio::spawn(broker::serve_user_conn(
                    shared.clone(),
                    rt.clone(),
                    user,
                    peer,
                    cancel.clone(),
                ));
            }
        }
    }
    debug!(proxy = %rt.name, port = rt.port, "accept loop stopped");
}

async fn create_udp_proxy(
    shared: &Arc<Shared>,
    ctx: &ProxyContext,
    req: &NewProxy,
) -> Result<ProxyHandle, String> {
    if req.remote_port == 0 {
        return Err("udp proxies need an explicit remote_port".to_string());
    }

    let bind_ip = shared.config.proxy.bind_addr.clone();
    let socket = UdpSocket::bind((bind_ip.as_str(), req.remote_port))
        .await
        .map_err(|e| format!("bind failed: {}", e))?;
    let bound = socket
        .local_addr()
        .map_err(|e| format!("bind failed: {}", e))?;

    if !shared.ports.claim(bound.port(), &ctx.run_id, &req.proxy_name) {
        return Err(format!("port {} already in use", bound.port()));
    }

    let counters = Arc::new(TrafficCounters::new());
    let (udp_tx, udp_rx) = mpsc::channel::<UdpPacket>(256);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let task = tokio::spawn(run_udp_loop(
        socket,
        bound,
        ctx.out_tx.clone(),
        udp_rx,
        counters.clone(),
        ctx.session_counters.clone(),
        cancel_rx,
    ));

    Ok(ProxyHandle {
        name: req.proxy_name.clone(),
        proxy_type: ProxyType::Udp,
        bound_addr: bound.to_string(),
        port: bound.port(),
        counters,
        udp_tx: Some(udp_tx),
        cancel_tx,
        task,
    })
}

/// Relay datagrams between the packet listener and the control stream.
async fn run_udp_loop(
    socket: UdpSocket,
    bound: SocketAddr,
    out_tx: mpsc::Sender<Message>,
    mut udp_rx: mpsc::Receiver<UdpPacket>,
    counters: Arc<TrafficCounters>,
    session_counters: Arc<TrafficCounters>,
    mut cancel: watch::Receiver<bool>,
) {
    let local_addr = bound.to_string();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "udp recv error");
                        continue;
                    }
                };
                counters.add_in(n as u64);
                session_counters.add_in(n as u64);

                let packet = Message::UdpPacket(UdpPacket {
                    content: buf[..n].to_vec(),
                    local_addr: local_addr.clone(),
                    remote_addr: peer.to_string(),
                });
                // Control channel full: drop the datagram, never block
                if out_tx.try_send(packet).is_err() {
                    debug!("control channel congested, dropping datagram");
                }
            }
            outbound = udp_rx.recv() => {
                let Some(packet) = outbound else { break };
                let Ok(peer) = packet.remote_addr.parse::<SocketAddr>() else {
                    debug!(addr = %packet.remote_addr, "unparseable datagram destination");
                    continue;
                };
                if packet.content.len() > MAX_DATAGRAM_SIZE {
                    debug!("oversized datagram dropped");
                    continue;
                }
                match socket.send_to(&packet.content, peer).await {
                    Ok(n) => {
                        counters.add_out(n as u64);
                        session_counters.add_out(n as u64);
                    }
                    Err(e) => debug!(error = %e, "udp send error"),
                }
            }
        }
    }
}
