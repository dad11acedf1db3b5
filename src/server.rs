// Copyright (c) 2025 Quilt Foundation

//! The inbound half of gossip: accepting peers and serving their pulls.
//!
//! Each accepted connection gets its own session task. A session answers a
//! pull either immediately (initial probe, or records already past the
//! requested mark) or after a long poll that ends when new records land or
//! a jittered interval elapses. Surplus peers are redirected to an
//! already-connected peer instead of being served.

use crate::error::GossipResult;
use crate::messages::{GossipRequest, GossipResponse};
use crate::service::{Shared, State};
use crate::transport::{read_frame, write_frame};
use crate::MAX_PEERS;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

/// Accept loop. Runs until the instance shuts down.
pub(crate) async fn serve(shared: Arc<Shared>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    trace!(%remote, "accepted gossip connection");
                    tokio::spawn(session(Arc::clone(&shared), stream));
                }
                Err(err) => warn!(%err, "failed to accept gossip connection"),
            },
        }
    }
    debug!("gossip server stopped");
}

async fn session(shared: Arc<Shared>, mut stream: TcpStream) {
    let mut registered: Option<String> = None;
    if let Err(err) = session_loop(&shared, &mut stream, &mut registered).await {
        trace!(%err, "gossip session ended");
    }
    if let Some(addr) = registered {
        let mut state = shared.state.lock().unwrap();
        unregister_incoming(&mut state, &addr);
    }
}

/// Count a session against its advertised address. Peers may run several
/// sessions under one address; the incoming entry lives as long as any of
/// them does.
fn register_incoming(state: &mut State, addr: &str) {
    *state.incoming_refs.entry(addr.to_string()).or_insert(0) += 1;
    state.incoming.add(addr);
}

fn unregister_incoming(state: &mut State, addr: &str) {
    if let Some(count) = state.incoming_refs.get_mut(addr) {
        *count -= 1;
        if *count == 0 {
            state.incoming_refs.remove(addr);
            state.incoming.remove(addr);
            debug!(%addr, "incoming gossip peer detached");
        }
    }
}

async fn session_loop(
    shared: &Arc<Shared>,
    stream: &mut TcpStream,
    registered: &mut Option<String>,
) -> GossipResult<()> {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let request: GossipRequest = tokio::select! {
            res = read_frame(stream) => res?,
            _ = shutdown.changed() => return Ok(()),
        };
        let response = answer(shared, &request, registered).await;
        write_frame(stream, &response).await?;
    }
}

fn empty_reply() -> GossipResponse {
    GossipResponse {
        delta: Vec::new(),
        forward_addr: None,
    }
}

/// Produce the reply for one pull, long-polling when there is nothing to
/// send yet. Never holds the instance mutex across an await.
async fn answer(
    shared: &Arc<Shared>,
    request: &GossipRequest,
    registered: &mut Option<String>,
) -> GossipResponse {
    let since = {
        let mut state = shared.state.lock().unwrap();
        if state.closed {
            return empty_reply();
        }

        // A full house: hand the peer one of the connected incoming
        // addresses instead of taking it on.
        if state.incoming.len() >= MAX_PEERS && !state.incoming.has(&request.addr) {
            let forward = state.incoming.select_random().map(str::to_string);
            debug!(addr = %request.addr, ?forward, "incoming gossip peers full; redirecting");
            return GossipResponse {
                delta: Vec::new(),
                forward_addr: forward,
            };
        }

        if registered.is_none() {
            register_incoming(&mut state, &request.addr);
            *registered = Some(request.addr.clone());
            debug!(addr = %request.addr, "incoming gossip peer attached");
        }

        // Initial probe: answer with everything, immediately.
        if request.max_seq < 0 {
            return GossipResponse {
                delta: state.store.delta(0, u64::MAX, u32::MAX),
                forward_addr: None,
            };
        }

        let since = request.max_seq as u64;
        let delta = state.store.delta(since, u64::MAX, u32::MAX);
        if !delta.is_empty() {
            return GossipResponse {
                delta,
                forward_addr: None,
            };
        }
        since
    };

    // Nothing new yet: wait for fresh records or the jittered deadline.
    // Empty replies on the deadline keep the remote client from timing out.
    let deadline = sleep(shared.config.jittered_interval());
    tokio::pin!(deadline);
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let notified = shared.new_info.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let state = shared.state.lock().unwrap();
            if state.closed {
                return empty_reply();
            }
            let delta = state.store.delta(since, u64::MAX, u32::MAX);
            if !delta.is_empty() {
                return GossipResponse {
                    delta,
                    forward_addr: None,
                };
            }
        }
        tokio::select! {
            _ = &mut deadline => return empty_reply(),
            _ = &mut notified => {}
            _ = shutdown.changed() => return empty_reply(),
        }
    }
}
