//! Ricart-Agrawala (§4.4): deferred replies instead of an explicit RELEASE,
//! 2(N-1) messages per critical-section entry.

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
    Reply,
}

fn outranks(my_ts: u64, my_id: NodeId, their_ts: u64, their_id: NodeId) -> bool {
    (my_ts, my_id) < (their_ts, their_id)
}

struct State {
    clock: u64,
    is_requesting: bool,
    own_timestamp: u64,
    replies_outstanding: usize,
    deferred: Vec<NodeId>,
    ready_to_enter: bool,
}

impl State {
    fn new() -> Self {
        Self {
            clock: 0,
            is_requesting: false,
            own_timestamp: 0,
            replies_outstanding: 0,
            deferred: Vec::new(),
            ready_to_enter: false,
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

        let ts = {
            let mut st = shared.state.lock();
            st.clock += 1;
            st.own_timestamp = st.clock;
            st.is_requesting = true;
            st.replies_outstanding = n - 1;
            st.ready_to_enter = false;
            st.own_timestamp
        };
        if outbox
            .broadcast(next_request_id, Message::Request { timestamp: ts })
            .is_err()
        {
            break;
        }
        counters.bump("REQUEST");

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
        log::debug!("{} entering CS (ricart-agrawala, ts={})", id, ts);
        tally.record_entry(id);
        log::debug!("{} releasing CS (ricart-agrawala, ts={})", id, ts);
        if cs_guard.exit(id).is_err() {
            log::error!("{} fatal: mutual exclusion violated exiting CS", id);
            break;
        }

        let deferred = {
            let mut st = shared.state.lock();
            st.is_requesting = false;
            std::mem::take(&mut st.deferred)
        };
        for peer in deferred {
            if outbox
                .send(peer, Header::new(id, next_request_id), Message::Reply)
                .is_err()
            {
                break;
            }
            counters.bump("REPLY");
        }
    }
}

fn inbox_loop(
    id: NodeId,
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
                let defer = {
                    let mut st = shared.state.lock();
                    st.clock = st.clock.max(timestamp) + 1;
                    if st.is_requesting
                        && outranks(st.own_timestamp, id, timestamp, sender)
                    {
                        st.deferred.push(sender);
                        true
                    } else {
                        false
                    }
                };
                if defer {
                    continue;
                }
                if outbox
                    .send(sender, Header::new(id, request_id), Message::Reply)
                    .is_err()
                {
                    break;
                }
                counters.bump("REPLY");
            }
            Message::Reply => {
                let mut st = shared.state.lock();
                if st.is_requesting && st.replies_outstanding > 0 {
                    st.replies_outstanding -= 1;
                    if st.replies_outstanding == 0 {
                        st.ready_to_enter = true;
                        drop(st);
                        shared.cv.notify_all();
                    }
                } else {
                    log::debug!("{} dropping stale REPLY from {}", id, sender);
                }
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
                .name(format!("ricart-agrawala-requester-{id}"))
                .spawn(move || {
                    requester_loop(node_id, n, req_shared, req_outbox, req_tally, req_counters, req_cs_guard)
                })
                .expect("failed to spawn requester thread"),
        );

        let in_counters = counters.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("ricart-agrawala-inbox-{id}"))
                .spawn(move || inbox_loop(node_id, shared, inbox, outbox, in_counters))
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
    fn outranks_breaks_ties_by_id() {
        assert!(outranks(3, NodeId(1), 3, NodeId(2)));
        assert!(!outranks(3, NodeId(2), 3, NodeId(1)));
    }

    #[test]
    fn five_nodes_conserve_and_count_messages() {
        let cfg = Config {
            algo: Algorithm::RicartAgrawala,
            nodes: 5,
            nb_iterations: 12,
            request_size: 1,
            seed: 7,
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.total_cs_entries(), 12);
        let total_msgs: u64 = ["REQUEST", "REPLY"].iter().map(|k| report.message_count(k)).sum();
        assert_eq!(total_msgs, 2 * (cfg.nodes as u64 - 1) * cfg.nb_iterations as u64);
    }
}
