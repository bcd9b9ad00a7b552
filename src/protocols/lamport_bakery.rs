//! Lamport's Bakery algorithm (§4.3): timestamp-ordered total order, 3(N-1)
//! messages per critical-section entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::driver::Report;
use crate::error::Result;
use crate::message::Header;
use crate::node_id::NodeId;
use crate::runtime::{self, CsGuard, Inbox, MessageCounters, Outbox, Tally};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request { timestamp: u64 },
    Reply { timestamp: u64 },
    Release { timestamp: u64 },
}

/// Total order used to find the queue head and to break request ties:
/// lower timestamp first, ties broken by lower node id (§4.3).
fn priority_key(timestamp: u64, id: NodeId) -> (u64, NodeId) {
    (timestamp, id)
}

struct State {
    clock: u64,
    /// Every request this node currently knows is pending, keyed by the
    /// requester. Acts as the priority queue from §3: its head is the
    /// smallest `(timestamp, id)` pair.
    pending: HashMap<NodeId, u64>,
    is_requesting: bool,
    own_timestamp: u64,
    replies_received: std::collections::HashSet<NodeId>,
    ready_to_enter: bool,
}

impl State {
    fn new() -> Self {
        Self {
            clock: 0,
            pending: HashMap::new(),
            is_requesting: false,
            own_timestamp: 0,
            replies_received: std::collections::HashSet::new(),
            ready_to_enter: false,
        }
    }

    fn is_head(&self, id: NodeId) -> bool {
        let own_key = priority_key(self.own_timestamp, id);
        self.pending
            .iter()
            .all(|(&peer, &ts)| peer == id || priority_key(ts, peer) >= own_key)
    }

    fn recheck_entry(&mut self, id: NodeId, n: usize) {
        if self.is_requesting
            && self.replies_received.len() == n - 1
            && self.pending.contains_key(&id)
            && self.is_head(id)
        {
            self.ready_to_enter = true;
        }
    }
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

fn requester_loop(
    id: NodeId,
    n: usize,
    shared: Arc<Shared>,
    outbox: Outbox<Message>,
    tally: Arc<Tally>,
    counters: Arc<MessageCounters>,
    cs_guard: Arc<CsGuard>,
) {
    let mut next_request_id: u64 = 0;
    loop {
        if !tally.try_reserve() {
            break;
        }
        next_request_id += 1;

        // requestCS (§4.3): advance own clock, build the request, insert it
        // into our own queue, broadcast REQUEST to every peer.
        {
            let mut st = shared.state.lock();
            st.clock += 1;
            let ts = st.clock;
            st.own_timestamp = ts;
            st.pending.insert(id, ts);
            st.is_requesting = true;
            st.replies_received.clear();
            st.ready_to_enter = false;
        }
        let ts = shared.state.lock().own_timestamp;
        if outbox
            .broadcast(next_request_id, Message::Request { timestamp: ts })
            .is_err()
        {
            break;
        }
        counters.bump("REQUEST");

        // Wait (via condvar, no polling) until the entry condition holds.
        {
            let mut st = shared.state.lock();
            while !st.ready_to_enter {
                shared.cv.wait(&mut st);
            }
        }

        if cs_guard.enter(id).is_err() {
            log::error!("{} fatal: mutual exclusion violated entering CS", id);
            break;
        }
        log::debug!("{} entering CS (lamport-bakery, ts={})", id, ts);
        tally.record_entry(id);
        log::debug!("{} releasing CS (lamport-bakery, ts={})", id, ts);
        if cs_guard.exit(id).is_err() {
            log::error!("{} fatal: mutual exclusion violated exiting CS", id);
            break;
        }

        // releaseCS: pop our own request, broadcast RELEASE.
        {
            let mut st = shared.state.lock();
            st.pending.remove(&id);
            st.is_requesting = false;
        }
        if outbox
            .broadcast(next_request_id, Message::Release { timestamp: ts })
            .is_err()
        {
            break;
        }
        counters.bump("RELEASE");
    }
}

fn inbox_loop(
    id: NodeId,
    n: usize,
    shared: Arc<Shared>,
    inbox: Inbox<Message>,
    outbox: Outbox<Message>,
    counters: Arc<MessageCounters>,
) {
    loop {
        let stored = match inbox.recv() {
            Ok(Some(stored)) => stored,
            Ok(None) => break,
            Err(e) => {
                log::error!("{} fatal decode error: {:?}", id, e);
                break;
            }
        };
        let Header { sender, request_id } = stored.header;

        match stored.kind {
            Message::Request { timestamp } => {
                let reply_ts = {
                    let mut st = shared.state.lock();
                    st.clock = st.clock.max(timestamp) + 1;
                    st.pending.insert(sender, timestamp);
                    st.clock
                };
                if outbox
                    .send(sender, Header::new(id, request_id), Message::Reply { timestamp: reply_ts })
                    .is_err()
                {
                    break;
                }
                counters.bump("REPLY");
                shared.cv.notify_all();
            }
            Message::Reply { timestamp } => {
                let mut st = shared.state.lock();
                st.clock = st.clock.max(timestamp) + 1;
                if st.is_requesting {
                    st.replies_received.insert(sender);
                    st.recheck_entry(id, n);
                    if st.ready_to_enter {
                        drop(st);
                        shared.cv.notify_all();
                    }
                } else {
                    // Benign (§7): a stale REPLY arriving after our own
                    // release, from a peer that was slow to answer.
                    log::debug!("{} dropping stale REPLY from {}", id, sender);
                }
            }
            Message::Release { .. } => {
                let mut st = shared.state.lock();
                st.pending.remove(&sender);
            }
        }
    }
}

pub fn run(cfg: &Config) -> Result<Report> {
    let n = cfg.nodes;
    let tally = Arc::new(Tally::new(n, cfg.nb_iterations));
    let counters = Arc::new(MessageCounters::new());
    let cs_guard = Arc::new(CsGuard::new());
    let links = runtime::build_links::<Message>(n);

    let watcher = runtime::spawn_shutdown_watcher(tally.clone(), links[0].0.clone());

    let mut handles = Vec::new();
    for (id, (outbox, inbox)) in links.into_iter().enumerate() {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::new()),
            cv: Condvar::new(),
        });

        let node_id = NodeId(id as u32);
        let req_outbox = outbox.clone();
        let req_shared = shared.clone();
        let req_tally = tally.clone();
        let req_counters = counters.clone();
        let req_cs_guard = cs_guard.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("lamport-bakery-requester-{id}"))
                .spawn(move || {
                    requester_loop(node_id, n, req_shared, req_outbox, req_tally, req_counters, req_cs_guard)
                })
                .expect("failed to spawn requester thread"),
        );

        let in_counters = counters.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("lamport-bakery-inbox-{id}"))
                .spawn(move || inbox_loop(node_id, n, shared, inbox, outbox, in_counters))
                .expect("failed to spawn inbox thread"),
        );
    }

    for h in handles {
        let _ = h.join();
    }
    let _ = watcher.join();

    Ok(Report {
        algo: cfg.algo,
        per_node_entries: tally.per_node_snapshot(),
        message_counts: counters.snapshot(),
        extra: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Algorithm;

    #[test]
    fn priority_key_breaks_ties_by_id() {
        assert!(priority_key(5, NodeId(1)) < priority_key(5, NodeId(2)));
        assert!(priority_key(4, NodeId(9)) < priority_key(5, NodeId(0)));
    }

    #[test]
    fn four_nodes_ten_iterations_conserve_and_count_messages() {
        let cfg = Config {
            algo: Algorithm::LamportBakery,
            nodes: 4,
            nb_iterations: 10,
            request_size: 1,
            seed: 1,
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.total_cs_entries(), 10);
        assert!(report.per_node_entries.iter().all(|&c| c <= 10));
        let total_msgs: u64 = ["REQUEST", "REPLY", "RELEASE"]
            .iter()
            .map(|k| report.message_count(k))
            .sum();
        assert_eq!(total_msgs, 3 * (cfg.nodes as u64 - 1) * cfg.nb_iterations as u64);
    }
}
