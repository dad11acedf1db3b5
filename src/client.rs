// Copyright (c) 2025 Quilt Foundation

//! The outgoing half of a gossip session.
//!
//! One client pulls deltas from one remote peer in a long-poll loop: send
//! the high-water mark, merge whatever comes back, repeat. Every way out of
//! the loop (dial failure, timeout, redirect, starvation, instance close)
//! funnels into a single disconnect event for the manage loop.

use crate::error::{GossipError, GossipResult};
use crate::messages::{GossipRequest, GossipResponse};
use crate::service::Shared;
use crate::transport::{read_frame, write_frame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// Reported by a dying client through the disconnect queue.
#[derive(Debug)]
pub(crate) struct DisconnectEvent {
    /// The remote endpoint this client was attached to.
    pub addr: String,
    /// Redirect target, when the remote was full.
    pub forward_addr: Option<String>,
    /// Terminal error, when the session did not end cleanly.
    pub err: Option<GossipError>,
}

/// Owning handle for a spawned client task.
#[derive(Debug)]
pub(crate) struct ClientHandle {
    shutdown: Arc<Notify>,
    connected: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Whether the dial has completed. Half-open clients are excluded from
    /// least-useful eviction.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Ask the client task to terminate; it reports back through the
    /// disconnect queue like any other exit.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

/// Spawn a client session to `addr`.
pub(crate) fn start(shared: Arc<Shared>, addr: String) -> ClientHandle {
    let shutdown = Arc::new(Notify::new());
    let connected = Arc::new(AtomicBool::new(false));
    let handle = ClientHandle {
        shutdown: Arc::clone(&shutdown),
        connected: Arc::clone(&connected),
    };
    tokio::spawn(run(shared, addr, shutdown, connected));
    handle
}

async fn run(shared: Arc<Shared>, addr: String, shutdown: Arc<Notify>, connected: Arc<AtomicBool>) {
    let mut event = DisconnectEvent {
        addr: addr.clone(),
        forward_addr: None,
        err: None,
    };
    match gossip_loop(&shared, &addr, &shutdown, &connected).await {
        Ok(Some(forward)) => {
            debug!(%addr, %forward, "gossip peer is full; redirected");
            event.forward_addr = Some(forward);
        }
        Ok(None) => trace!(%addr, "gossip client closed"),
        Err(err) => event.err = Some(err),
    }
    let _ = shared.disconnected_tx.send(event).await;
}

async fn gossip_loop(
    shared: &Shared,
    addr: &str,
    shutdown: &Notify,
    connected: &AtomicBool,
) -> GossipResult<Option<String>> {
    let request_timeout = shared.config.request_timeout();
    let local_addr = shared.local_addr();

    let mut stream = tokio::select! {
        res = timeout(request_timeout, TcpStream::connect(addr)) => {
            res.map_err(|_| GossipError::Timeout)??
        }
        _ = shutdown.notified() => return Ok(None),
    };
    connected.store(true, Ordering::Relaxed);
    debug!(%addr, "started gossip client");

    // Negative on the first exchange: the initial probe is answered with the
    // peer's full delta immediately.
    let mut max_seq: i64 = -1;
    let mut last_new = Instant::now();

    loop {
        let request = GossipRequest {
            addr: local_addr.clone(),
            max_seq,
        };
        write_frame(&mut stream, &request).await?;

        let response: GossipResponse = tokio::select! {
            res = timeout(request_timeout, read_frame(&mut stream)) => {
                res.map_err(|_| GossipError::Timeout)??
            }
            _ = shutdown.notified() => return Ok(None),
        };

        if let Some(forward) = response.forward_addr {
            return Ok(Some(forward));
        }

        // The probe has been answered; from here on carry a non-negative
        // mark so the server paces this session with its jittered long poll
        // instead of replying immediately every time.
        max_seq = max_seq.max(0);

        let mut fresh: u64 = 0;
        {
            let mut state = shared.state.lock().unwrap();
            if state.closed {
                return Ok(None);
            }
            for mut info in response.delta {
                // Advance past everything the peer sent, accepted or not, so
                // the same range is never requested twice.
                max_seq = max_seq.max(info.seq as i64);
                info.hops += 1;
                info.peer_addr = addr.to_string();
                match state.store.add_info(info) {
                    Ok(()) => fresh += 1,
                    Err(err) => trace!(%addr, %err, "dropped gossip record"),
                }
            }
            if fresh > 0 {
                state.store.credit_client(addr, fresh);
            }
        }

        if fresh > 0 {
            last_new = Instant::now();
            shared.new_info.notify_waiters();
        } else if last_new.elapsed() >= shared.config.max_wait_for_new_gossip() {
            debug!(%addr, "nothing new from peer; closing client");
            return Ok(None);
        }
    }
}
