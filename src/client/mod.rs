//! Tunnel client engine
//!
//! Maintains exactly one control stream to the server. On startup and after
//! any disconnection the configured reconnect strategy applies; on every
//! successful login all configured proxies are re-registered. While
//! connected the engine answers ReqWorkConn by dialing a fresh work
//! connection back to the server and splicing it with the local upstream,
//! sends signed heartbeats, and forwards udp datagrams.

mod backoff;

pub use backoff::Backoff;

use crate::config::{ClientConfig, ProxyConfig};
use crate::crypto::{derive_data_keys, unix_timestamp, HmacSigner, KeyPair, SealedStream};
use crate::protocol::{
    read_message, write_message, Login, Message, NewProxy, NewWorkConn, Ping, ProtocolError,
    ProxyType, ReqWorkConn, UdpPacket,
};
use crate::relay::{splice, BufferPool, SpliceOptions};
use crate::transport::{BoxedStream, Dialer, TcpDialer, TlsDialer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long to wait for LoginResp and StartWorkConn.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on concurrently tracked udp flows.
const MAX_UDP_FLOWS: usize = 1024;

/// The tunnel client.
pub struct Client {
    config: ClientConfig,
    keypair: Arc<KeyPair>,
    /// Session id, kept across reconnects once the server assigned one.
    run_id: Mutex<String>,
    pool: Arc<BufferPool>,
}

impl Client {
    /// Build a client; generates a fresh Ed25519 key pair unless one is
    /// configured.
    pub fn new(config: ClientConfig) -> crate::Result<Self> {
        let keypair = if config.private_key.is_empty() {
            KeyPair::generate()?
        } else {
            KeyPair::from_base64(&config.private_key)?
        };

        Ok(Self {
            config,
            keypair: Arc::new(keypair),
            run_id: Mutex::new(String::new()),
            pool: Arc::new(BufferPool::default()),
        })
    }

    fn build_dialer(&self) -> crate::Result<Arc<dyn Dialer>> {
        match self.config.protocol.as_str() {
            "tls" => Ok(Arc::new(TlsDialer::new(
                &self.config.tls,
                &self.config.server_addr,
            )?)),
            _ => Ok(Arc::new(TcpDialer::default())),
        }
    }

    /// Run until reconnect attempts are exhausted or reconnecting is off.
    pub async fn run(&self) -> crate::Result<()> {
        let dialer = self.build_dialer()?;
        let mut backoff = Backoff::new(&self.config.reconnect);

        loop {
            let error = match self.run_session(dialer.clone(), &mut backoff).await {
                Err(e) => e,
                Ok(()) => crate::Error::ConnectionClosed,
            };
            warn!(error = %error, "control session ended");

            if !self.config.reconnect.enabled {
                return Err(error);
            }
            match backoff.next_delay() {
                Some(delay) => {
                    info!(delay_ms = delay.as_millis() as u64, "reconnecting");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(attempts = backoff.attempts(), "reconnect attempts exhausted");
                    return Err(error);
                }
            }
        }
    }

    /// One control-session lifetime: login, register proxies, serve until
    /// the stream dies.
    async fn run_session(
        &self,
        dialer: Arc<dyn Dialer>,
        backoff: &mut Backoff,
    ) -> crate::Result<()> {
        let addr = self.config.server_address();
        let mut stream = dialer.open(&addr).await?;

        let now = unix_timestamp();
        let login = Message::Login(Login {
            version: crate::VERSION.to_string(),
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: self.config.user.clone(),
            token: self.config.auth_token.clone(),
            timestamp: now,
            run_id: self.run_id.lock().expect("run id lock").clone(),
            client_id: self.client_id(),
            pool_count: self.config.pool_count,
            metas: HashMap::new(),
            signature: self.keypair.sign_timestamp(now),
            public_key: self.keypair.public_key(),
        });
        write_message(&mut stream, &login).await?;

        let resp = match timeout(RESPONSE_TIMEOUT, read_message(&mut stream))
            .await
            .map_err(|_| crate::Error::Timeout)??
        {
            Message::LoginResp(resp) => resp,
            other => {
                return Err(ProtocolError::UnexpectedMessage(other.type_name()).into());
            }
        };
        if !resp.error.is_empty() {
            return Err(crate::Error::LoginRejected(resp.error));
        }

        *self.run_id.lock().expect("run id lock") = resp.run_id.clone();
        info!(run_id = %resp.run_id, server = %addr, "logged in");
        backoff.reset();

        let (read_half, mut write_half) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let mut writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write_message(&mut write_half, &msg).await {
                    debug!(error = %e, "control write failed");
                    break;
                }
            }
        });

        let (msg_tx, mut msg_rx) = mpsc::channel::<Result<Message, ProtocolError>>(64);
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

        // (Re-)register every configured proxy
        for proxy in &self.config.proxies {
            let mut req = NewProxy::stream(&proxy.name, proxy.proxy_type, proxy.remote_port);
            req.use_encryption = proxy.use_encryption;
            req.use_compression = proxy.use_compression;
            req.bandwidth_limit = proxy.bandwidth_limit.clone();
            if out_tx.send(Message::NewProxy(req)).await.is_err() {
                return Err(crate::Error::ConnectionClosed);
            }
        }

        let mut engine = Engine {
            run_id: resp.run_id,
            dialer,
            server_addr: addr,
            keypair: self.keypair.clone(),
            token: self.config.auth_token.clone(),
            proxies: self
                .config
                .proxies
                .iter()
                .map(|p| (p.name.clone(), p.clone()))
                .collect(),
            bound_ports: HashMap::new(),
            heartbeat: HmacSigner::for_heartbeat(&self.config.auth_token),
            out_tx: out_tx.clone(),
            pool: self.pool.clone(),
            udp_flows: HashMap::new(),
        };

        let mut hb_tick =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval.max(1)));
        hb_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                incoming = msg_rx.recv() => match incoming {
                    Some(Ok(msg)) => {
                        if let Err(e) = engine.dispatch(msg).await {
                            break Err(e);
                        }
                    }
                    Some(Err(ProtocolError::Truncated)) => break Err(crate::Error::ConnectionClosed),
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(crate::Error::ConnectionClosed),
                },
                _ = hb_tick.tick() => {
                    let ts = unix_timestamp();
                    let ping = Message::Ping(Ping {
                        timestamp: ts,
                        signature: engine.heartbeat.sign_timestamp(ts),
                    });
                    if out_tx.send(ping).await.is_err() {
                        break Err(crate::Error::ConnectionClosed);
                    }
                }
                _ = &mut writer => break Err(crate::Error::ConnectionClosed),
            }
        };

        reader.abort();
        writer.abort();
        engine.shutdown();
        result
    }

    fn client_id(&self) -> String {
        if self.config.client_id.is_empty() {
            hostname()
        } else {
            self.config.client_id.clone()
        }
    }
}

/// Per-connection state of one logged-in control session.
struct Engine {
    run_id: String,
    dialer: Arc<dyn Dialer>,
    server_addr: String,
    keypair: Arc<KeyPair>,
    token: String,
    proxies: HashMap<String, ProxyConfig>,
    /// Remote port → proxy name, learned from NewProxyResp.
    bound_ports: HashMap<u16, String>,
    heartbeat: HmacSigner,
    out_tx: mpsc::Sender<Message>,
    pool: Arc<BufferPool>,
    /// (proxy name, end-user address) → local udp flow.
    udp_flows: HashMap<(String, String), UdpFlow>,
}

struct UdpFlow {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl Engine {
    async fn dispatch(&mut self, msg: Message) -> crate::Result<()> {
        match msg {
            Message::NewProxyResp(resp) => {
                if !resp.error.is_empty() {
                    warn!(proxy = %resp.proxy_name, error = %resp.error, "proxy rejected");
                    return Ok(());
                }
                info!(proxy = %resp.proxy_name, remote_addr = %resp.remote_addr, "proxy registered");
                if let Ok(addr) = resp.remote_addr.parse::<SocketAddr>() {
                    self.bound_ports.insert(addr.port(), resp.proxy_name);
                }
                Ok(())
            }

            Message::ReqWorkConn(req) => {
                self.spawn_work_conn(req);
                Ok(())
            }

            Message::Pong(pong) => {
                if !self.heartbeat.verify_timestamp(pong.server_time, &pong.signature) {
                    warn!("pong carried a bad signature");
                }
                debug!(server_time = pong.server_time, "pong");
                Ok(())
            }

            Message::UdpPacket(packet) => {
                self.handle_udp(packet).await;
                Ok(())
            }

            other => {
                debug!(message = other.type_name(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    /// Answer a ReqWorkConn: dial back, authenticate the work connection,
    /// connect the local upstream, and splice.
    fn spawn_work_conn(&self, req: ReqWorkConn) {
        let Some(proxy) = self.proxies.get(&req.proxy_name).cloned() else {
            warn!(proxy = %req.proxy_name, "work connection for unknown proxy");
            return;
        };
        if proxy.proxy_type == ProxyType::Udp {
            warn!(proxy = %req.proxy_name, "work connection for udp proxy");
            return;
        }

        let dialer = self.dialer.clone();
        let server_addr = self.server_addr.clone();
        let keypair = self.keypair.clone();
        let run_id = self.run_id.clone();
        let token = self.token.clone();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_work_conn(
                dialer,
                &server_addr,
                keypair,
                &run_id,
                &token,
                &proxy,
                req.request_id,
                pool,
            )
            .await
            {
                debug!(proxy = %proxy.name, request_id = req.request_id, error = %e, "work connection failed");
            }
        });
    }

    /// Forward one datagram from the server to the local upstream, creating
    /// the per-(proxy, user) flow on first sight.
    async fn handle_udp(&mut self, packet: UdpPacket) {
        let Some(port) = packet
            .local_addr
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
        else {
            debug!(addr = %packet.local_addr, "datagram with unparseable local address");
            return;
        };
        let Some(proxy_name) = self.bound_ports.get(&port).cloned() else {
            debug!(port, "datagram for unknown proxy");
            return;
        };
        let Some(proxy) = self.proxies.get(&proxy_name) else {
            return;
        };

        let key = (proxy_name.clone(), packet.remote_addr.clone());
        if !self.udp_flows.contains_key(&key) {
            if self.udp_flows.len() >= MAX_UDP_FLOWS {
                debug!("udp flow table full, dropping datagram");
                return;
            }
            match self
                .open_udp_flow(&proxy.local_address(), &packet.local_addr, &packet.remote_addr)
                .await
            {
                Some(flow) => {
                    self.udp_flows.insert(key.clone(), flow);
                }
                None => return,
            }
        }

        let flow = self.udp_flows.get(&key).expect("flow just inserted");
        if flow.socket.send(&packet.content).await.is_err() {
            // Upstream went away; forget the flow so it can be rebuilt
            if let Some(flow) = self.udp_flows.remove(&key) {
                flow.task.abort();
            }
        }
    }

    async fn open_udp_flow(
        &self,
        upstream_addr: &str,
        local_addr: &str,
        remote_addr: &str,
    ) -> Option<UdpFlow> {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "udp bind failed");
                return None;
            }
        };
        if let Err(e) = socket.connect(upstream_addr).await {
            warn!(upstream = %upstream_addr, error = %e, "udp connect failed");
            return None;
        }

        let socket = Arc::new(socket);
        let reply_socket = socket.clone();
        let out_tx = self.out_tx.clone();
        let local_addr = local_addr.to_string();
        let remote_addr = remote_addr.to_string();

        // Relay upstream replies back through the control channel
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = match reply_socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(_) => break,
                };
                let packet = Message::UdpPacket(UdpPacket {
                    content: buf[..n].to_vec(),
                    local_addr: local_addr.clone(),
                    remote_addr: remote_addr.clone(),
                });
                if out_tx.send(packet).await.is_err() {
                    break;
                }
            }
        });

        Some(UdpFlow { socket, task })
    }

    fn shutdown(&mut self) {
        for (_, flow) in self.udp_flows.drain() {
            flow.task.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_work_conn(
    dialer: Arc<dyn Dialer>,
    server_addr: &str,
    keypair: Arc<KeyPair>,
    run_id: &str,
    token: &str,
    proxy: &ProxyConfig,
    request_id: u64,
    pool: Arc<BufferPool>,
) -> crate::Result<()> {
    let mut work = dialer.open(server_addr).await?;

    let ts = unix_timestamp();
    let hello = Message::NewWorkConn(NewWorkConn {
        run_id: run_id.to_string(),
        request_id,
        timestamp: ts,
        signature: keypair.sign_work_conn(run_id, request_id, ts),
    });
    write_message(&mut work, &hello).await?;

    let start = match timeout(RESPONSE_TIMEOUT, read_message(&mut work))
        .await
        .map_err(|_| crate::Error::Timeout)??
    {
        Message::StartWorkConn(start) => start,
        other => return Err(ProtocolError::UnexpectedMessage(other.type_name()).into()),
    };
    if !start.error.is_empty() {
        return Err(crate::Error::WorkConnRejected(start.error));
    }

    debug!(
        proxy = %proxy.name,
        request_id,
        src = %format!("{}:{}", start.src_addr, start.src_port),
        "work connection matched"
    );

    let upstream = TcpStream::connect(proxy.local_address()).await?;
    upstream.set_nodelay(true).ok();

    // The client seals client-to-server records
    let work: BoxedStream = if proxy.use_encryption {
        let (c2s, s2c) = derive_data_keys(token, run_id, &proxy.name);
        Box::new(SealedStream::new(work, &c2s, &s2c)?)
    } else {
        work
    };

    let options = SpliceOptions {
        bandwidth_limit: 0,
        pool,
        counters: Vec::new(),
    };
    splice(upstream, work, options).await?;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ClientConfig {
        let config: crate::Config = toml::from_str(
            r#"
            [client]
            server_addr = "127.0.0.1"
            server_port = 7000
            auth_token = "t"
            "#,
        )
        .unwrap();
        config.client.unwrap()
    }

    #[test]
    fn test_client_generates_keypair() {
        let client = Client::new(base_config()).unwrap();
        assert_eq!(client.keypair.public_key().len(), 32);
    }

    #[test]
    fn test_client_loads_configured_keypair() {
        let keypair = KeyPair::generate().unwrap();
        let mut config = base_config();
        config.private_key = keypair.to_base64();

        let client = Client::new(config).unwrap();
        assert_eq!(client.keypair.public_key(), keypair.public_key());
    }

    #[test]
    fn test_client_id_falls_back_to_hostname() {
        let client = Client::new(base_config()).unwrap();
        assert!(!client.client_id().is_empty());

        let mut config = base_config();
        config.client_id = "stable-id".to_string();
        let client = Client::new(config).unwrap();
        assert_eq!(client.client_id(), "stable-id");
    }
}
