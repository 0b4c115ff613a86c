//! Tunnel server
//!
//! Accepts control and work connections on one port, distinguishing them by
//! their first message: a Login starts a control session, a NewWorkConn is
//! matched against a pending broker request. Shared state (session and port
//! registries, pending table, limiter, block-list) hangs off one [`Shared`]
//! value; tests instantiate fresh servers with no global state.

mod broker;
mod proxy;
pub mod registry;
mod session;

pub use registry::{PortRegistry, SessionHandle, SessionRegistry};

use crate::auth::{ConnectionLimiter, IpBlocker, LoginVerifier};
use crate::config::{PortRangeSet, SecurityConfig, ServerConfig};
use crate::protocol::Message;
use crate::relay::BufferPool;
use crate::transport::{Listener, TcpListenerAdapter, TlsListenerAdapter};
use base64::Engine;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Consecutive auth failures from one address before it is blocked.
const AUTH_FAILURE_THRESHOLD: u32 = 3;

/// Interval of the block-list sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// State shared by every server task.
pub(crate) struct Shared {
    pub config: ServerConfig,
    pub verifier: LoginVerifier,
    pub limiter: ConnectionLimiter,
    pub blocker: IpBlocker,
    pub sessions: SessionRegistry,
    pub ports: PortRegistry,
    pub pending: broker::PendingWorkConns,
    pub pool: Arc<BufferPool>,
    pub allow_ports: PortRangeSet,
    pub deny_ports: PortRangeSet,
    whitelist: Option<HashSet<IpAddr>>,
    auth_failures: Mutex<HashMap<IpAddr, u32>>,
}

impl Shared {
    /// Record one auth failure; repeated failures earn a short block.
    pub fn note_auth_failure(&self, ip: IpAddr) {
        let mut failures = self.auth_failures.lock().expect("failure lock");
        let count = failures.entry(ip).or_insert(0);
        *count += 1;
        if *count >= AUTH_FAILURE_THRESHOLD {
            let duration = Duration::from_secs(self.config.security.block_duration);
            warn!(
                target: "audit",
                event = "ip_blocked",
                ip = %ip,
                failures = *count,
                block_secs = duration.as_secs(),
            );
            self.blocker.block(ip, duration);
            failures.remove(&ip);
        }
    }

    /// Reset the failure count after a successful login.
    pub fn clear_auth_failures(&self, ip: IpAddr) {
        self.auth_failures.lock().expect("failure lock").remove(&ip);
    }

    fn admits(&self, ip: IpAddr) -> bool {
        if self.blocker.is_blocked(ip) {
            debug!(target: "audit", event = "connection_blocked", ip = %ip);
            return false;
        }
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.contains(&ip) {
                debug!(target: "audit", event = "whitelist_miss", ip = %ip);
                return false;
            }
        }
        true
    }
}

/// The tunnel server. Binds in [`Server::bind`], serves in [`Server::run`].
pub struct Server {
    shared: Arc<Shared>,
    listener: Arc<dyn Listener>,
}

impl Server {
    /// Bind the control socket and build the shared state.
    pub async fn bind(config: ServerConfig) -> crate::Result<Self> {
        let security: &SecurityConfig = &config.security;

        let whitelist = if security.enable_ip_whitelist {
            let mut set = HashSet::new();
            for entry in &security.allowed_ips {
                let ip: IpAddr = entry.parse().map_err(|_| {
                    crate::Error::Config(format!("invalid allowed_ips entry: {}", entry))
                })?;
                set.insert(ip);
            }
            Some(set)
        } else {
            None
        };

        let mut verifier = LoginVerifier::new(&config.auth_token, security.signature_grace);
        if !security.registered_public_keys.is_empty() {
            let mut keys = Vec::new();
            for entry in &security.registered_public_keys {
                let key = base64::engine::general_purpose::STANDARD
                    .decode(entry)
                    .map_err(|_| {
                        crate::Error::Config(format!(
                            "invalid registered_public_keys entry: {}",
                            entry
                        ))
                    })?;
                if key.len() != 32 {
                    return Err(crate::Error::Config(format!(
                        "registered public key has {} bytes, expected 32",
                        key.len()
                    )));
                }
                keys.push(key);
            }
            verifier = verifier.with_registered_keys(keys);
        }

        let listener: Arc<dyn Listener> = if config.tls.enabled {
            Arc::new(TlsListenerAdapter::bind(&config.bind_address(), &config.tls).await?)
        } else {
            Arc::new(TcpListenerAdapter::bind(&config.bind_address()).await?)
        };

        let shared = Arc::new(Shared {
            verifier,
            limiter: ConnectionLimiter::new(security.max_connections_per_client),
            blocker: IpBlocker::new(),
            sessions: SessionRegistry::new(),
            ports: PortRegistry::new(),
            pending: broker::PendingWorkConns::new(),
            pool: Arc::new(BufferPool::default()),
            allow_ports: config.proxy.allow_set()?,
            deny_ports: config.proxy.deny_set()?,
            whitelist,
            auth_failures: Mutex::new(HashMap::new()),
            config,
        });

        Ok(Self { shared, listener })
    }

    /// The bound control socket address.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the accept loop fails fatally.
    pub async fn run(self) -> crate::Result<()> {
        info!(
            addr = %self.local_addr()?,
            tls = self.shared.config.tls.enabled,
            "server listening"
        );

        // Periodic sweep bounds block-list memory
        let sweeper_shared = self.shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                sweeper_shared.blocker.sweep();
            }
        });

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if !self.shared.admits(peer.ip()) {
                drop(stream);
                continue;
            }

            let shared = self.shared.clone();
            let listener = self.listener.clone();
            tokio::spawn(async move {
                let stream = match listener.handshake(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "transport handshake failed");
                        return;
                    }
                };
                handle_connection(shared, stream, peer).await;
            });
        }
    }
}

/// Read the first message and route the connection: Login starts a control
/// session, NewWorkConn pairs with a pending broker request. Anything else
/// is dropped without a response.
async fn handle_connection(
    shared: Arc<Shared>,
    mut stream: crate::transport::BoxedStream,
    peer: SocketAddr,
) {
    let greet_window = Duration::from_secs(shared.config.security.connection_timeout);

    match timeout(greet_window, crate::protocol::read_message(&mut stream)).await {
        Ok(Ok(Message::Login(login))) => {
            session::handle_login(shared, stream, peer, login).await;
        }
        Ok(Ok(Message::NewWorkConn(msg))) => {
            broker::handle_inbound_work_conn(shared, stream, peer, msg).await;
        }
        Ok(Ok(other)) => {
            warn!(
                target: "audit",
                event = "unexpected_greeting",
                peer = %peer,
                message = other.type_name(),
            );
        }
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "bad greeting");
        }
        Err(_) => {
            debug!(peer = %peer, "greeting timed out");
        }
    }
}
