// Copyright (c) 2025 Quilt Foundation

//! The gossip instance: shared state, topology management, public surface.
//!
//! A [`Gossip`] owns the info store, the three address sets, and the live
//! client sessions, all behind one mutex. The pieces are read and mutated
//! in concert ("if outgoing is empty and the sentinel is missing, signal"),
//! and a single lock keeps those views from tearing. Two notifiers hang off
//! the same state: `stalled` wakes the bootstrap loop, `new_info` wakes
//! server sessions long-polling for fresh records.
//!
//! `start` launches three long-lived tasks: the server accept loop, the
//! bootstrap loop, and the manage loop that shapes the outgoing peer set.

use crate::addr_set::AddrSet;
use crate::client::{self, ClientHandle, DisconnectEvent};
use crate::config::GossipConfig;
use crate::error::{GossipError, GossipResult};
use crate::group::GroupKind;
use crate::info::{now_nanos, Info, Value};
use crate::server;
use crate::store::InfoStore;
use crate::{DEFAULT_NODE_COUNT, MAX_PEERS, NODE_COUNT_KEY, SENTINEL_KEY};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Mutable state guarded by the instance mutex.
pub(crate) struct State {
    pub(crate) store: InfoStore,
    pub(crate) bootstraps: AddrSet,
    pub(crate) incoming: AddrSet,
    /// Live server sessions per advertised incoming address. Peers may hold
    /// more than one session under one address; the `incoming` entry stays
    /// until the last of them ends.
    pub(crate) incoming_refs: HashMap<String, usize>,
    pub(crate) outgoing: AddrSet,
    pub(crate) clients: HashMap<String, ClientHandle>,
    pub(crate) closed: bool,
}

/// State and signals shared by the instance and its tasks.
pub(crate) struct Shared {
    pub(crate) config: GossipConfig,
    pub(crate) state: Mutex<State>,
    /// Wakes the bootstrap loop when connectivity is lost.
    pub(crate) stalled: Notify,
    /// Wakes server sessions waiting for records past their mark.
    pub(crate) new_info: Notify,
    /// Flipped to `true` exactly once, on close.
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) disconnected_tx: mpsc::Sender<DisconnectEvent>,
}

impl Shared {
    /// The endpoint this node advertises to peers.
    pub(crate) fn local_addr(&self) -> String {
        self.state.lock().unwrap().store.node_addr().to_string()
    }
}

/// A gossip node.
///
/// Created with a listen address and a [`GossipConfig`], started with
/// [`Gossip::start`], and shut down with [`Gossip::close`]. All accessors
/// are usable from any task; they briefly take the instance mutex.
pub struct Gossip {
    shared: Arc<Shared>,
    listen_addr: String,
    disconnected_rx: Option<mpsc::Receiver<DisconnectEvent>>,
    exited: Option<oneshot::Receiver<()>>,
    started: bool,
}

impl Gossip {
    /// Create a gossip node that will listen on `listen_addr`.
    pub fn new(listen_addr: &str, config: GossipConfig) -> Self {
        let (disconnected_tx, disconnected_rx) = mpsc::channel(MAX_PEERS);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State {
                store: InfoStore::new(listen_addr),
                bootstraps: AddrSet::new(MAX_PEERS),
                incoming: AddrSet::new(MAX_PEERS),
                incoming_refs: HashMap::new(),
                outgoing: AddrSet::new(MAX_PEERS),
                clients: HashMap::new(),
                closed: false,
            }),
            stalled: Notify::new(),
            new_info: Notify::new(),
            shutdown,
            disconnected_tx,
        });
        Self {
            shared,
            listen_addr: listen_addr.to_string(),
            disconnected_rx: Some(disconnected_rx),
            exited: None,
            started: false,
        }
    }

    /// Bind the listen address and launch the serve, bootstrap, and manage
    /// tasks.
    ///
    /// Fails with [`GossipError::BootstrapEmpty`] when the bootstrap list,
    /// minus this node's own address, is empty: the node could never join
    /// a network.
    pub async fn start(&mut self) -> GossipResult<()> {
        if self.started {
            return Ok(());
        }
        if self.shared.state.lock().unwrap().closed {
            return Err(GossipError::Closed);
        }
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let local = listener.local_addr()?.to_string();

        {
            let mut state = self.shared.state.lock().unwrap();
            state.store.set_node_addr(&local);
            for addr in &self.shared.config.bootstrap {
                let addr = addr.trim();
                if !addr.is_empty() && addr != local && addr != self.listen_addr {
                    state.bootstraps.add(addr);
                }
            }
            if state.bootstraps.is_empty() {
                return Err(GossipError::BootstrapEmpty);
            }
        }

        let disconnected_rx = match self.disconnected_rx.take() {
            Some(rx) => rx,
            None => return Err(GossipError::Closed),
        };
        let (exited_tx, exited_rx) = oneshot::channel();
        tokio::spawn(server::serve(Arc::clone(&self.shared), listener));
        tokio::spawn(bootstrap(Arc::clone(&self.shared)));
        tokio::spawn(manage(
            Arc::clone(&self.shared),
            disconnected_rx,
            exited_tx,
        ));
        self.exited = Some(exited_rx);
        self.started = true;
        info!(addr = %local, "gossip instance started");
        Ok(())
    }

    /// Shut down: close every outgoing client, release all waiters, and
    /// wait for the manage loop to drain and exit.
    pub async fn close(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closed = true;
            for client in state.clients.values() {
                client.close();
            }
        }
        let _ = self.shared.shutdown.send(true);
        self.shared.stalled.notify_one();
        self.shared.new_info.notify_waiters();
        if let Some(exited) = self.exited.take() {
            let _ = exited.await;
        }
        info!("gossip instance closed");
    }

    /// The endpoint this node advertises: the bound address once started,
    /// the configured listen address before that.
    pub fn local_addr(&self) -> String {
        self.shared.local_addr()
    }

    fn add_value(&self, key: &str, value: Value, ttl: Duration) -> GossipResult<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            let info = state.store.new_info(key, value, ttl);
            state.store.add_info(info)?;
        }
        // Wake sessions long-polling for records past their mark.
        self.shared.new_info.notify_waiters();
        Ok(())
    }

    fn get_value(&self, key: &str) -> GossipResult<Value> {
        let state = self.shared.state.lock().unwrap();
        state
            .store
            .get_info(key)
            .map(|i| i.value.clone())
            .ok_or_else(|| GossipError::KeyNotFound(key.to_string()))
    }

    /// Add or update an int64-valued info.
    pub fn add_int64(&self, key: &str, value: i64, ttl: Duration) -> GossipResult<()> {
        self.add_value(key, Value::Int64(value), ttl)
    }

    /// Add or update a float64-valued info.
    pub fn add_float64(&self, key: &str, value: f64, ttl: Duration) -> GossipResult<()> {
        self.add_value(key, Value::Float64(value), ttl)
    }

    /// Add or update a string-valued info.
    pub fn add_string(&self, key: &str, value: impl Into<String>, ttl: Duration) -> GossipResult<()> {
        self.add_value(key, Value::Text(value.into()), ttl)
    }

    /// Read an int64 value by key.
    pub fn get_int64(&self, key: &str) -> GossipResult<i64> {
        match self.get_value(key)? {
            Value::Int64(v) => Ok(v),
            _ => Err(GossipError::TypeMismatch(key.to_string())),
        }
    }

    /// Read a float64 value by key.
    pub fn get_float64(&self, key: &str) -> GossipResult<f64> {
        match self.get_value(key)? {
            Value::Float64(v) => Ok(v),
            _ => Err(GossipError::TypeMismatch(key.to_string())),
        }
    }

    /// Read a string value by key.
    pub fn get_string(&self, key: &str) -> GossipResult<String> {
        match self.get_value(key)? {
            Value::Text(v) => Ok(v),
            _ => Err(GossipError::TypeMismatch(key.to_string())),
        }
    }

    /// Register a bounded group for `prefix`.
    pub fn register_group(&self, prefix: &str, limit: usize, kind: GroupKind) -> GossipResult<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.store.register_group(prefix, limit, kind)
    }

    /// Non-expired members of the group registered for `prefix`.
    pub fn group_infos(&self, prefix: &str) -> GossipResult<Vec<Info>> {
        let state = self.shared.state.lock().unwrap();
        state
            .store
            .group_infos(prefix)
            .ok_or_else(|| GossipError::GroupUnknown(prefix.to_string()))
    }

    /// Int64 values of the group registered for `prefix`.
    pub fn group_int64s(&self, prefix: &str) -> GossipResult<Vec<i64>> {
        self.group_infos(prefix)?
            .into_iter()
            .map(|i| match i.value {
                Value::Int64(v) => Ok(v),
                _ => Err(GossipError::TypeMismatch(prefix.to_string())),
            })
            .collect()
    }

    /// Float64 values of the group registered for `prefix`.
    pub fn group_float64s(&self, prefix: &str) -> GossipResult<Vec<f64>> {
        self.group_infos(prefix)?
            .into_iter()
            .map(|i| match i.value {
                Value::Float64(v) => Ok(v),
                _ => Err(GossipError::TypeMismatch(prefix.to_string())),
            })
            .collect()
    }

    /// String values of the group registered for `prefix`.
    pub fn group_strings(&self, prefix: &str) -> GossipResult<Vec<String>> {
        self.group_infos(prefix)?
            .into_iter()
            .map(|i| match i.value {
                Value::Text(v) => Ok(v),
                _ => Err(GossipError::TypeMismatch(prefix.to_string())),
            })
            .collect()
    }

    /// Hop count of the furthest gossiped information currently held.
    pub fn max_hops(&self) -> u32 {
        self.shared.state.lock().unwrap().store.max_hops()
    }

    /// Snapshot of incoming gossip peer endpoints.
    pub fn incoming(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().incoming.as_slice().to_vec()
    }

    /// Snapshot of outgoing gossip peer endpoints. These may still be
    /// dialling or already failed but not yet reaped.
    pub fn outgoing(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().outgoing.as_slice().to_vec()
    }
}

/// Launch a client session to `addr` and track it in the outgoing set.
fn start_client(shared: &Arc<Shared>, state: &mut State, addr: &str) {
    if state.closed || state.clients.contains_key(addr) || addr == state.store.node_addr() {
        return;
    }
    if state.outgoing.len() >= MAX_PEERS {
        debug!(%addr, "outgoing gossip peers full; not starting client");
        return;
    }
    info!(%addr, "starting gossip client");
    state.outgoing.add(addr);
    state
        .clients
        .insert(addr.to_string(), client::start(Arc::clone(shared), addr.to_string()));
}

/// Bootstrap addresses not already connected in either direction.
fn available_bootstraps(state: &State) -> AddrSet {
    state
        .bootstraps
        .filter(|a| !state.outgoing.has(a) && !state.incoming.has(a))
}

/// The hop ceiling a well-shaped overlay should stay under: in a regular
/// graph of fan-out `MAX_PEERS` every node is reachable within
/// `ceil(log_fanout(n))` hops; doubled plus one to absorb churn and
/// asymmetry.
fn max_tolerated_hops(state: &State) -> u32 {
    let node_count = match state.store.get_info(NODE_COUNT_KEY) {
        Some(info) => match info.value {
            Value::Int64(n) if n > 0 => n,
            _ => DEFAULT_NODE_COUNT,
        },
        None => DEFAULT_NODE_COUNT,
    };
    ((node_count as f64).ln() / (MAX_PEERS as f64).ln()).ceil() as u32 * 2 + 1
}

/// The bootstrap loop: dial into the network whenever connectivity is
/// lost, then park on the stalled notifier until the manage loop signals.
async fn bootstrap(shared: Arc<Shared>) {
    loop {
        let notified = shared.stalled.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let mut state = shared.state.lock().unwrap();
            if state.closed {
                break;
            }
            let avail = available_bootstraps(&state);
            if !avail.is_empty() {
                let have_clients = !state.outgoing.is_empty();
                let have_sentinel = state.store.get_info(SENTINEL_KEY).is_some();
                if !have_clients || !have_sentinel {
                    if let Some(addr) = avail.select_random().map(str::to_string) {
                        info!(%addr, "bootstrapping gossip network");
                        start_client(&shared, &mut state, &addr);
                    }
                }
            }
        }
        notified.await;
    }
    debug!("gossip bootstrap loop stopped");
}

/// The manage loop: reap disconnected clients, tighten the graph on a
/// jittered tick, signal the bootstrapper when stalled, and exit once the
/// instance is closed and the outgoing set has drained.
async fn manage(
    shared: Arc<Shared>,
    mut disconnected_rx: mpsc::Receiver<DisconnectEvent>,
    exited_tx: oneshot::Sender<()>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    // The tick period is re-sampled after every firing, so the periods of a
    // fleet started in lockstep stay decorrelated.
    let tick = sleep(shared.config.jittered_interval());
    tokio::pin!(tick);
    loop {
        tokio::select! {
            Some(event) = disconnected_rx.recv() => handle_disconnect(&shared, event),
            _ = &mut tick => {
                on_tick(&shared);
                tick.as_mut()
                    .reset(Instant::now() + shared.config.jittered_interval());
            }
            _ = shutdown.changed() => {}
        }

        let exit = {
            let state = shared.state.lock().unwrap();
            if state.outgoing.is_empty() && !available_bootstraps(&state).is_empty() {
                debug!("no outgoing gossip hosts; signaling bootstrap");
                shared.stalled.notify_one();
            } else if state.store.get_info(SENTINEL_KEY).is_none() {
                debug!(key = SENTINEL_KEY, "sentinel gossip missing; assuming partition");
                shared.stalled.notify_one();
            }
            state.closed && state.outgoing.is_empty()
        };
        if exit {
            break;
        }
    }
    debug!("gossip manage loop stopped");
    let _ = exited_tx.send(());
}

fn handle_disconnect(shared: &Arc<Shared>, event: DisconnectEvent) {
    let mut state = shared.state.lock().unwrap();
    if let Some(err) = &event.err {
        warn!(addr = %event.addr, %err, "gossip client disconnected");
    }
    state.outgoing.remove(&event.addr);
    state.clients.remove(&event.addr);
    state.store.forget_client(&event.addr);

    // A redirect names a peer with room; chase it right away.
    if let Some(forward) = &event.forward_addr {
        start_client(shared, &mut state, forward);
    }
}

fn on_tick(shared: &Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();
    if state.closed {
        return;
    }
    let pruned = state.store.prune_expired(now_nanos());
    if pruned > 0 {
        debug!(pruned, "dropped expired gossip records");
    }
    tighten(shared, &mut state);
}

/// Graph tightness: when records arrive from past the hop ceiling, dial
/// their origin directly, evicting the least useful peer first if the
/// outgoing set is full.
fn tighten(shared: &Arc<Shared>, state: &mut State) {
    let threshold = max_tolerated_hops(state);
    let distant = state
        .store
        .distant(threshold)
        .filter(|a| !state.outgoing.has(a) && !state.incoming.has(a));
    if distant.is_empty() {
        return;
    }
    if state.outgoing.len() < MAX_PEERS {
        if let Some(addr) = distant.select_random().map(str::to_string) {
            info!(%addr, threshold, "tightening gossip graph");
            start_client(shared, state, &addr);
        }
    } else {
        // Only connected clients are eviction candidates; half-open entries
        // may still be dialling.
        let connected = state
            .outgoing
            .filter(|a| state.clients.get(a).map(ClientHandle::is_connected).unwrap_or(false));
        if let Some(victim) = state.store.least_useful(&connected) {
            info!(addr = %victim, "closing least useful gossip client to tighten graph");
            if let Some(client) = state.clients.get(&victim) {
                client.close();
            }
        }
    }
}
