//! Session and port registries
//!
//! Both registries are keyed by stable identifiers (`run_id`, port number)
//! so teardown is a registry removal rather than a walk of back-pointers.
//! Reads dominate (every work connection and accept path does a lookup), so
//! the maps sit behind `RwLock`s.

use crate::protocol::Message;
use crate::relay::TrafficCounters;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};

/// Shared view of a live control session.
///
/// The session task owns the real state; the handle carries what other
/// tasks need: the control writer channel, the client public key for
/// work-connection verification, and the shutdown/done plumbing used for
/// takeover.
#[derive(Clone)]
pub struct SessionHandle {
    pub run_id: String,
    pub client_id: String,
    pub user: String,
    pub peer: SocketAddr,
    /// Distinguishes this instance from a takeover reusing the run id.
    pub epoch: u64,
    /// Ed25519 public key from Login; empty when the client used the
    /// HMAC fallback.
    pub public_key: Vec<u8>,
    pub out_tx: mpsc::Sender<Message>,
    pub counters: Arc<TrafficCounters>,
    shutdown_tx: mpsc::Sender<()>,
    done_rx: watch::Receiver<bool>,
}

impl SessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: String,
        client_id: String,
        user: String,
        peer: SocketAddr,
        epoch: u64,
        public_key: Vec<u8>,
        out_tx: mpsc::Sender<Message>,
        counters: Arc<TrafficCounters>,
        shutdown_tx: mpsc::Sender<()>,
        done_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run_id,
            client_id,
            user,
            peer,
            epoch,
            public_key,
            out_tx,
            counters,
            shutdown_tx,
            done_rx,
        }
    }

    /// Ask the session task to stop and wait until its teardown finished.
    pub async fn close_and_wait(&self) {
        let _ = self.shutdown_tx.try_send(());
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                // Sender dropped: the session task is gone either way
                break;
            }
        }
    }
}

/// `run_id → SessionHandle`, with at-most-one session per run id.
pub struct SessionRegistry {
    map: RwLock<HashMap<String, SessionHandle>>,
    epochs: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        }
    }

    /// Allocate an epoch for a new session instance.
    pub fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Remove and fully close any session holding `run_id`. Returns once the
    /// old session's teardown (listeners closed, ports released) completed,
    /// so a takeover never overlaps its predecessor.
    pub async fn displace(&self, run_id: &str) -> bool {
        let old = self.map.write().expect("session registry lock").remove(run_id);
        match old {
            Some(old) => {
                old.close_and_wait().await;
                true
            }
            None => false,
        }
    }

    /// Insert a handle; the caller must have displaced any predecessor.
    pub fn insert(&self, handle: SessionHandle) {
        self.map
            .write()
            .expect("session registry lock")
            .insert(handle.run_id.clone(), handle);
    }

    /// Look up a session by run id.
    pub fn get(&self, run_id: &str) -> Option<SessionHandle> {
        self.map
            .read()
            .expect("session registry lock")
            .get(run_id)
            .cloned()
    }

    /// Remove the entry only if it still belongs to `epoch`; a takeover may
    /// already have replaced it.
    pub fn remove_if_epoch(&self, run_id: &str, epoch: u64) {
        let mut map = self.map.write().expect("session registry lock");
        if map.get(run_id).map(|h| h.epoch) == Some(epoch) {
            map.remove(run_id);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("session registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of a claimed remote port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub run_id: String,
    pub proxy_name: String,
}

/// Server-wide `port → owner` table for collision checks and teardown.
pub struct PortRegistry {
    map: RwLock<HashMap<u16, PortOwner>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Claim `port` for `(run_id, proxy_name)`; false if already taken.
    pub fn claim(&self, port: u16, run_id: &str, proxy_name: &str) -> bool {
        let mut map = self.map.write().expect("port registry lock");
        if map.contains_key(&port) {
            return false;
        }
        map.insert(
            port,
            PortOwner {
                run_id: run_id.to_string(),
                proxy_name: proxy_name.to_string(),
            },
        );
        true
    }

    /// Release a claimed port.
    pub fn release(&self, port: u16) {
        self.map.write().expect("port registry lock").remove(&port);
    }

    /// Current owner, if any.
    pub fn owner(&self, port: u16) -> Option<PortOwner> {
        self.map
            .read()
            .expect("port registry lock")
            .get(&port)
            .cloned()
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
