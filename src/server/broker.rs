//! Work-connection broker
//!
//! Every user connection accepted on a proxy listener becomes a pending
//! request: the broker asks the owning client for a fresh work connection
//! over the control channel and pairs the two by `(run_id, request_id)`.
//! Arrival order is irrelevant; matching is strictly by identifier.

use super::proxy::ProxyRuntime;
use super::Shared;
use crate::crypto::{Ed25519Verifier, HmacSigner, SealedStream};
use crate::protocol::{
    write_message, Message, NewWorkConn, ReqWorkConn, StartWorkConn,
};
use crate::relay::{splice, SpliceOptions};
use crate::transport::BoxedStream;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// How long a pending request waits for its work connection.
pub(crate) const WORK_CONN_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingEntry {
    proxy_name: String,
    tx: oneshot::Sender<BoxedStream>,
}

/// Table of requests awaiting their matching inbound work connection.
pub(crate) struct PendingWorkConns {
    map: Mutex<HashMap<(String, u64), PendingEntry>>,
}

impl PendingWorkConns {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Register a request and return the completion slot.
    pub fn register(
        &self,
        run_id: &str,
        request_id: u64,
        proxy_name: &str,
    ) -> oneshot::Receiver<BoxedStream> {
        let (tx, rx) = oneshot::channel();
        self.map.lock().expect("pending lock").insert(
            (run_id.to_string(), request_id),
            PendingEntry {
                proxy_name: proxy_name.to_string(),
                tx,
            },
        );
        rx
    }

    /// Take the completion slot for a matched work connection.
    pub fn complete(&self, run_id: &str, request_id: u64) -> Option<oneshot::Sender<BoxedStream>> {
        self.map
            .lock()
            .expect("pending lock")
            .remove(&(run_id.to_string(), request_id))
            .map(|entry| entry.tx)
    }

    /// Drop an unmatched request (timeout or abandoned user connection).
    pub fn remove(&self, run_id: &str, request_id: u64) {
        self.map
            .lock()
            .expect("pending lock")
            .remove(&(run_id.to_string(), request_id));
    }

    /// Drop every pending request of one proxy; the waiting request tasks
    /// observe the closed slot and hang up their user connections.
    pub fn remove_proxy(&self, run_id: &str, proxy_name: &str) {
        self.map
            .lock()
            .expect("pending lock")
            .retain(|(rid, _), entry| rid != run_id || entry.proxy_name != proxy_name);
    }

    /// Drop every pending request of one session.
    pub fn remove_session(&self, run_id: &str) {
        self.map
            .lock()
            .expect("pending lock")
            .retain(|(rid, _), _| rid != run_id);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("pending lock").len()
    }
}

/// Serve one user connection accepted on a proxy listener: request a work
/// connection, await the match, then splice.
pub(crate) async fn serve_user_conn(
    shared: Arc<Shared>,
    rt: Arc<ProxyRuntime>,
    user: TcpStream,
    peer: SocketAddr,
    mut cancel: watch::Receiver<bool>,
) {
    let request_id = rt.request_ids.fetch_add(1, Ordering::Relaxed) + 1;
    let slot = shared.pending.register(&rt.run_id, request_id, &rt.name);

    debug!(
        proxy = %rt.name,
        request_id,
        peer = %peer,
        "requesting work connection"
    );

    let req = Message::ReqWorkConn(ReqWorkConn {
        proxy_name: rt.name.clone(),
        request_id,
    });
    if rt.out_tx.send(req).await.is_err() {
        // Session already closing
        shared.pending.remove(&rt.run_id, request_id);
        rt.unmatched.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    let work = tokio::select! {
        _ = cancel.changed() => {
            shared.pending.remove(&rt.run_id, request_id);
            rt.unmatched.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        matched = tokio::time::timeout(WORK_CONN_TIMEOUT, slot) => match matched {
            Ok(Ok(stream)) => stream,
            _ => {
                // Timeout or proxy teardown dropped the slot; hang up the user
                debug!(proxy = %rt.name, request_id, "work connection timed out");
                shared.pending.remove(&rt.run_id, request_id);
                rt.unmatched.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        },
    };
    rt.unmatched.fetch_sub(1, Ordering::Relaxed);

    let mut work = work;
    let start = Message::StartWorkConn(StartWorkConn {
        proxy_name: rt.name.clone(),
        src_addr: peer.ip().to_string(),
        src_port: peer.port(),
        dst_addr: rt.bind_ip.clone(),
        dst_port: rt.port,
        error: String::new(),
    });
    if let Err(e) = write_message(&mut work, &start).await {
        debug!(proxy = %rt.name, request_id, error = %e, "failed to start work connection");
        return;
    }

    // Optional data-plane envelope; the server seals server-to-client
    let work: BoxedStream = match &rt.data_keys {
        Some((c2s, s2c)) => match SealedStream::new(work, s2c, c2s) {
            Ok(sealed) => Box::new(sealed),
            Err(e) => {
                warn!(proxy = %rt.name, error = %e, "failed to arm data envelope");
                return;
            }
        },
        None => work,
    };

    let options = SpliceOptions {
        bandwidth_limit: rt.bandwidth_limit,
        pool: shared.pool.clone(),
        counters: vec![rt.counters.clone(), rt.session_counters.clone()],
    };

    tokio::select! {
        _ = cancel.changed() => {
            debug!(proxy = %rt.name, request_id, "splice cancelled by proxy teardown");
        }
        result = splice(user, work, options) => match result {
            Ok(stats) => debug!(
                proxy = %rt.name,
                request_id,
                bytes_in = stats.a_to_b,
                bytes_out = stats.b_to_a,
                "splice finished"
            ),
            Err(e) => debug!(proxy = %rt.name, request_id, error = %e, "splice failed"),
        },
    }
}

/// Handle a fresh inbound connection whose first message was NewWorkConn:
/// authenticate it, find the pending request, and hand the stream over.
pub(crate) async fn handle_inbound_work_conn(
    shared: Arc<Shared>,
    mut stream: BoxedStream,
    peer: SocketAddr,
    msg: NewWorkConn,
) {
    let Some(session) = shared.sessions.get(&msg.run_id) else {
        info!(target: "audit", event = "work_conn_rejected", peer = %peer, reason = "unknown session");
        reject(&mut stream, "unknown session").await;
        return;
    };

    let now = crate::crypto::unix_timestamp();
    let window = shared.config.security.anti_replay_window as i64;
    if (now - msg.timestamp).abs() > window {
        info!(
            target: "audit",
            event = "work_conn_rejected",
            run_id = %msg.run_id,
            peer = %peer,
            reason = "timestamp outside replay window"
        );
        reject(&mut stream, "InvalidTimestamp").await;
        return;
    }

    let verified = if !session.public_key.is_empty() {
        Ed25519Verifier::new(&session.public_key)
            .map(|v| v.verify_work_conn(&msg.run_id, msg.request_id, msg.timestamp, &msg.signature))
            .unwrap_or(false)
    } else {
        HmacSigner::new(shared.config.auth_token.as_bytes()).verify(
            &NewWorkConn::signed_bytes(&msg.run_id, msg.request_id, msg.timestamp),
            &msg.signature,
        )
    };
    if !verified {
        warn!(
            target: "audit",
            event = "work_conn_rejected",
            run_id = %msg.run_id,
            request_id = msg.request_id,
            peer = %peer,
            reason = "bad signature"
        );
        shared.note_auth_failure(peer.ip());
        reject(&mut stream, "InvalidSignature").await;
        return;
    }

    match shared.pending.complete(&msg.run_id, msg.request_id) {
        Some(slot) => {
            if slot.send(stream).is_err() {
                // The request task gave up in the meantime; nothing to pair
                debug!(run_id = %msg.run_id, request_id = msg.request_id, "request gone before match");
            }
        }
        None => {
            // Late or forged arrival: answer with an error and hang up
            debug!(run_id = %msg.run_id, request_id = msg.request_id, "no pending request");
            reject(&mut stream, "no pending request").await;
        }
    }
}

async fn reject(stream: &mut BoxedStream, error: &str) {
    let msg = Message::StartWorkConn(StartWorkConn {
        error: error.to_string(),
        ..Default::default()
    });
    let _ = write_message(stream, &msg).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_pair() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn test_pending_match_by_id() {
        let pending = PendingWorkConns::new();
        let rx1 = pending.register("r", 1, "ssh");
        let rx2 = pending.register("r", 2, "ssh");
        assert_eq!(pending.len(), 2);

        // Completed out of order; each slot gets its own stream
        let (s2, _keep2) = boxed_pair();
        pending.complete("r", 2).unwrap().send(s2).ok();
        let (s1, _keep1) = boxed_pair();
        pending.complete("r", 1).unwrap().send(s1).ok();

        assert!(rx1.await.is_ok());
        assert!(rx2.await.is_ok());
        assert_eq!(pending.len(), 0);

        // A request is matched at most once
        assert!(pending.complete("r", 1).is_none());
    }

    #[tokio::test]
    async fn test_pending_remove_proxy_drops_slots() {
        let pending = PendingWorkConns::new();
        let rx = pending.register("r", 1, "ssh");
        let other = pending.register("r", 2, "web");

        pending.remove_proxy("r", "ssh");
        assert!(rx.await.is_err());
        assert_eq!(pending.len(), 1);

        pending.remove_session("r");
        assert!(other.await.is_err());
        assert_eq!(pending.len(), 0);
    }
}
