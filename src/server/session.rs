//! Control session
//!
//! Per-client state machine: a new connection is in GREET until a valid
//! Login arrives, then RUNNING until heartbeat timeout, I/O error, protocol
//! error, takeover, or peer EOF. The write side of the control stream is
//! owned by a single writer task fed from a bounded channel so framing can
//! never interleave; a dedicated reader task feeds the session loop the
//! same way.

use super::proxy::{self, ProxyContext, ProxyHandle};
use super::Shared;
use crate::auth::mask_token;
use crate::crypto::{random_bytes, unix_timestamp, HmacSigner};
use crate::protocol::{
    read_message, write_message, Login, LoginResp, Message, NewProxyResp, Ping, Pong,
    ProtocolError, UdpPacket,
};
use crate::relay::TrafficCounters;
use crate::transport::BoxedStream;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Handle a control connection whose first message was Login.
pub(crate) async fn handle_login(
    shared: Arc<Shared>,
    mut stream: BoxedStream,
    peer: SocketAddr,
    login: Login,
) {
    let now = unix_timestamp();

    if let Err(auth_err) = shared.verifier.verify_login(&login, now) {
        warn!(
            target: "audit",
            event = "login_failed",
            peer = %peer,
            user = %login.user,
            client_id = %login.client_id,
            token = %mask_token(&login.token),
            error = %auth_err,
        );
        shared.note_auth_failure(peer.ip());
        let resp = Message::LoginResp(LoginResp {
            version: crate::VERSION.to_string(),
            run_id: String::new(),
            server_time: now,
            error: auth_err.to_string(),
            nonce: Vec::new(),
        });
        let _ = write_message(&mut stream, &resp).await;
        return;
    }
    shared.clear_auth_failures(peer.ip());

    // Connection limit counts control sessions per client id
    let limit_key = if login.client_id.is_empty() {
        peer.ip().to_string()
    } else {
        login.client_id.clone()
    };
    if let Err(limit_err) = shared.limiter.increment(&limit_key) {
        warn!(
            target: "audit",
            event = "login_rejected",
            peer = %peer,
            client_id = %limit_key,
            error = %limit_err,
        );
        let resp = Message::LoginResp(LoginResp {
            version: crate::VERSION.to_string(),
            run_id: String::new(),
            server_time: now,
            error: limit_err.to_string(),
            nonce: Vec::new(),
        });
        let _ = write_message(&mut stream, &resp).await;
        return;
    }

    let run_id = if login.run_id.is_empty() {
        crate::crypto::random_hex_id()
    } else {
        login.run_id.clone()
    };

    // Takeover: the previous holder of this run id is fully closed
    // (listeners gone, ports released) before the new session exists
    if shared.sessions.displace(&run_id).await {
        info!(
            target: "audit",
            event = "session_takeover",
            run_id = %run_id,
            peer = %peer,
        );
    }

    let epoch = shared.sessions.next_epoch();
    let counters = Arc::new(TrafficCounters::new());
    let (out_tx, out_rx) = mpsc::channel::<Message>(64);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let (done_tx, done_rx) = watch::channel(false);

    let handle = super::registry::SessionHandle::new(
        run_id.clone(),
        login.client_id.clone(),
        login.user.clone(),
        peer,
        epoch,
        login.public_key.clone(),
        out_tx.clone(),
        counters.clone(),
        shutdown_tx,
        done_rx,
    );
    shared.sessions.insert(handle);

    info!(
        target: "audit",
        event = "login",
        run_id = %run_id,
        peer = %peer,
        user = %login.user,
        client_id = %login.client_id,
        hostname = %login.hostname,
        version = %login.version,
    );

    // Single writer task owns the write half
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut writer = tokio::spawn(async move {
        let mut out_rx = out_rx;
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &msg).await {
                debug!(error = %e, "control write failed");
                break;
            }
        }
    });

    // LoginResp is the first frame on the wire
    let mut nonce = vec![0u8; 16];
    random_bytes(&mut nonce);
    let resp = Message::LoginResp(LoginResp {
        version: crate::VERSION.to_string(),
        run_id: run_id.clone(),
        server_time: now,
        error: String::new(),
        nonce,
    });
    if out_tx.send(resp).await.is_err() {
        shared.sessions.remove_if_epoch(&run_id, epoch);
        shared.limiter.decrement(&limit_key);
        let _ = done_tx.send(true);
        return;
    }

    // Dedicated reader task; EOF and errors arrive as messages
    let (msg_tx, msg_rx) = mpsc::channel::<Result<Message, ProtocolError>>(64);
    let reader = tokio::spawn(async move {
        let mut read_half = read_half;
        loop {
            let result = read_message(&mut read_half).await;
            let stop = result.is_err();
            if msg_tx.send(result).await.is_err() || stop {
                break;
            }
        }
    });

    let mut session = Session {
        shared: shared.clone(),
        run_id: run_id.clone(),
        client_id: login.client_id,
        peer,
        epoch,
        limit_key,
        out_tx,
        proxies: HashMap::new(),
        request_ids: Arc::new(AtomicU64::new(0)),
        counters,
        heartbeat: HmacSigner::for_heartbeat(&shared.config.auth_token),
        last_heartbeat: Instant::now(),
    };

    session.run(msg_rx, &mut writer, shutdown_rx).await;
    session.teardown().await;

    reader.abort();
    writer.abort();
    let _ = done_tx.send(true);
}

struct Session {
    shared: Arc<Shared>,
    run_id: String,
    client_id: String,
    peer: SocketAddr,
    epoch: u64,
    limit_key: String,
    out_tx: mpsc::Sender<Message>,
    proxies: HashMap<String, ProxyHandle>,
    request_ids: Arc<AtomicU64>,
    counters: Arc<TrafficCounters>,
    heartbeat: HmacSigner,
    last_heartbeat: Instant,
}

impl Session {
    /// Queue a message for the writer task. A peer that stops draining its
    /// socket must not wedge the session loop (heartbeat checks and
    /// takeover both run on it), so a stalled queue closes the session.
    async fn send_control(&self, msg: Message) -> bool {
        match self
            .out_tx
            .send_timeout(msg, Duration::from_secs(5))
            .await
        {
            Ok(()) => true,
            Err(_) => {
                warn!(run_id = %self.run_id, "control write stalled");
                false
            }
        }
    }

    async fn run(
        &mut self,
        mut msg_rx: mpsc::Receiver<Result<Message, ProtocolError>>,
        writer: &mut tokio::task::JoinHandle<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let heartbeat_timeout =
            Duration::from_secs(self.shared.config.security.heartbeat_timeout);
        let mut check = tokio::time::interval(heartbeat_timeout / 3);
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                incoming = msg_rx.recv() => match incoming {
                    Some(Ok(msg)) => {
                        if !self.dispatch(msg).await {
                            break;
                        }
                    }
                    Some(Err(ProtocolError::Truncated)) => {
                        debug!(run_id = %self.run_id, "peer closed control stream");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(
                            target: "audit",
                            event = "protocol_error",
                            run_id = %self.run_id,
                            peer = %self.peer,
                            error = %e,
                        );
                        break;
                    }
                    None => break,
                },
                _ = check.tick() => {
                    if self.last_heartbeat.elapsed() > heartbeat_timeout {
                        warn!(
                            target: "audit",
                            event = "heartbeat_timeout",
                            run_id = %self.run_id,
                            idle_secs = self.last_heartbeat.elapsed().as_secs(),
                        );
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!(run_id = %self.run_id, "session shutdown requested");
                    break;
                }
                _ = &mut *writer => {
                    debug!(run_id = %self.run_id, "control writer ended");
                    break;
                }
            }
        }
    }

    /// Handle one RUNNING-state message; false closes the session.
    async fn dispatch(&mut self, msg: Message) -> bool {
        match msg {
            Message::NewProxy(req) => {
                let resp = if self.proxies.contains_key(&req.proxy_name) {
                    NewProxyResp {
                        proxy_name: req.proxy_name.clone(),
                        remote_addr: String::new(),
                        error: format!("proxy name {} already in use", req.proxy_name),
                    }
                } else {
                    let ctx = ProxyContext {
                        run_id: self.run_id.clone(),
                        out_tx: self.out_tx.clone(),
                        session_counters: self.counters.clone(),
                        request_ids: self.request_ids.clone(),
                    };
                    match proxy::create_proxy(&self.shared, &ctx, &req).await {
                        Ok(handle) => {
                            info!(
                                target: "audit",
                                event = "proxy_created",
                                run_id = %self.run_id,
                                proxy = %req.proxy_name,
                                proxy_type = %req.proxy_type,
                                remote_addr = %handle.bound_addr,
                            );
                            let resp = NewProxyResp {
                                proxy_name: req.proxy_name.clone(),
                                remote_addr: handle.bound_addr.clone(),
                                error: String::new(),
                            };
                            self.proxies.insert(req.proxy_name.clone(), handle);
                            resp
                        }
                        Err(error) => {
                            info!(
                                target: "audit",
                                event = "proxy_rejected",
                                run_id = %self.run_id,
                                proxy = %req.proxy_name,
                                error = %error,
                            );
                            NewProxyResp {
                                proxy_name: req.proxy_name.clone(),
                                remote_addr: String::new(),
                                error,
                            }
                        }
                    }
                };
                self.send_control(Message::NewProxyResp(resp)).await
            }

            Message::CloseProxy(close) => {
                match self.proxies.remove(&close.proxy_name) {
                    Some(handle) => {
                        handle.destroy(&self.shared, &self.run_id).await;
                        info!(
                            target: "audit",
                            event = "proxy_closed",
                            run_id = %self.run_id,
                            proxy = %close.proxy_name,
                        );
                    }
                    None => {
                        debug!(proxy = %close.proxy_name, "close for unknown proxy");
                    }
                }
                true
            }

            Message::Ping(Ping { timestamp, signature }) => {
                if !self.heartbeat.verify_timestamp(timestamp, &signature) {
                    warn!(
                        target: "audit",
                        event = "heartbeat_rejected",
                        run_id = %self.run_id,
                        peer = %self.peer,
                    );
                    return false;
                }
                self.last_heartbeat = Instant::now();

                let server_time = unix_timestamp();
                let pong = Message::Pong(Pong {
                    server_time,
                    signature: self.heartbeat.sign_timestamp(server_time),
                    error: String::new(),
                });
                self.send_control(pong).await
            }

            Message::UdpPacket(packet) => {
                self.route_udp(packet);
                true
            }

            // Work connections belong on their own streams; one sent down
            // the control channel is tolerated but does nothing
            Message::NewWorkConn(msg) => {
                debug!(
                    run_id = %self.run_id,
                    request_id = msg.request_id,
                    "ignoring NewWorkConn on control stream"
                );
                true
            }

            other => {
                warn!(
                    target: "audit",
                    event = "protocol_error",
                    run_id = %self.run_id,
                    peer = %self.peer,
                    message = other.type_name(),
                );
                false
            }
        }
    }

    /// Route a datagram from the client to the udp proxy bound on the
    /// packet's local address.
    fn route_udp(&self, packet: UdpPacket) {
        let Some(port) = packet
            .local_addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
        else {
            debug!(addr = %packet.local_addr, "datagram with unparseable local address");
            return;
        };

        let target = self
            .proxies
            .values()
            .find(|p| p.port == port)
            .and_then(|p| p.udp_tx.as_ref());
        match target {
            Some(udp_tx) => {
                if udp_tx.try_send(packet).is_err() {
                    debug!(port, "udp proxy congested, dropping datagram");
                }
            }
            None => debug!(port, "datagram for unknown udp proxy"),
        }
    }

    async fn teardown(&mut self) {
        for (_, handle) in self.proxies.drain() {
            handle.destroy(&self.shared, &self.run_id).await;
        }
        self.shared.pending.remove_session(&self.run_id);
        self.shared.sessions.remove_if_epoch(&self.run_id, self.epoch);
        self.shared.limiter.decrement(&self.limit_key);

        let (bytes_in, bytes_out) = self.counters.totals();
        info!(
            target: "audit",
            event = "session_closed",
            run_id = %self.run_id,
            client_id = %self.client_id,
            peer = %self.peer,
            bytes_in,
            bytes_out,
        );
    }
}
