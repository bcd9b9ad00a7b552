//! Dijkstra's incremental resource allocation (§4.7): every node also
//! manages the resource sharing its id; a k-resource request is routed
//! through the resource managers in strictly decreasing-id order, which is
//! the deadlock-avoidance device (every request acquires shared resources in
//! the same order).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::driver::Report;
use crate::error::Result;
use crate::message::Header;
use crate::node_id::NodeId;
use crate::rng::ResourceSampler;
use crate::runtime::{self, Inbox, MessageCounters, Outbox, Tally};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request { requester: NodeId, resources: Vec<usize> },
    Reply,
    Free,
}

struct State {
    present: bool,
    pending: VecDeque<(NodeId, Vec<usize>)>,
    ready_to_enter: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// Applies the manager-side routing rule (§4.7 "REQUEST(r) at node m") for
/// one request at resource `m`. Returns the outgoing message to send, if any.
fn route_request(m: usize, state: &mut State, requester: NodeId, resources: Vec<usize>) -> Option<(NodeId, Message)> {
    if state.present {
        state.present = false;
        match resources.iter().filter(|&&x| x < m).max().copied() {
            Some(next) => Some((NodeId(next as u32), Message::Request { requester, resources })),
            None => Some((requester, Message::Reply)),
        }
    } else {
        state.pending.push_back((requester, resources));
        None
    }
}

fn requester_loop(
    id: NodeId,
    n: usize,
    shared: Arc<Shared>,
    outbox: Outbox<Message>,
    tally: Arc<Tally>,
    counters: Arc<MessageCounters>,
    mut sampler: ResourceSampler,
    request_size: usize,
) {
    loop {
        if !tally.try_reserve() {
            break;
        }
        let resources = sampler.sample(n, request_size);
        let start = *resources.iter().max().expect("request size is at least 1");

        {
            let mut st = shared.state.lock();
            st.ready_to_enter = false;
        }
        if outbox
            .send(
                NodeId(start as u32),
                Header::new(id, 0),
                Message::Request {
                    requester: id,
                    resources: resources.clone(),
                },
            )
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

        log::debug!("{} entering CS (dijkstra, resources={:?})", id, resources);
        tally.record_entry(id);
        log::debug!("{} releasing CS (dijkstra)", id);

        for &r in &resources {
            if outbox.send(NodeId(r as u32), Header::new(id, 0), Message::Free).is_err() {
                break;
            }
            counters.bump("FREE");
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
    let m = usize::from(id);
    loop {
        let stored = match inbox.recv() {
            Ok(Some(stored)) => stored,
            Ok(None) => break,
            Err(e) => {
                log::error!("{} fatal decode error: {:?}", id, e);
                break;
            }
        };

        match stored.kind {
            Message::Request { requester, resources } => {
                let outgoing = {
                    let mut st = shared.state.lock();
                    route_request(m, &mut st, requester, resources)
                };
                if let Some((to, msg)) = outgoing {
                    let kind_label = match msg {
                        Message::Reply => "REPLY",
                        Message::Request { .. } => "REQUEST",
                        Message::Free => unreachable!("route_request never produces FREE"),
                    };
                    if outbox.send(to, Header::new(id, 0), msg).is_err() {
                        break;
                    }
                    counters.bump(kind_label);
                }
            }
            Message::Reply => {
                let mut st = shared.state.lock();
                st.ready_to_enter = true;
                drop(st);
                shared.cv.notify_all();
            }
            Message::Free => {
                let outgoing = {
                    let mut st = shared.state.lock();
                    st.present = true;
                    if let Some((requester, resources)) = st.pending.pop_front() {
                        route_request(m, &mut st, requester, resources)
                    } else {
                        None
                    }
                };
                if let Some((to, msg)) = outgoing {
                    let kind_label = match msg {
                        Message::Reply => "REPLY",
                        Message::Request { .. } => "REQUEST",
                        Message::Free => unreachable!("route_request never produces FREE"),
                    };
                    if outbox.send(to, Header::new(id, 0), msg).is_err() {
                        break;
                    }
                    counters.bump(kind_label);
                }
            }
        }
    }
}

pub fn run(cfg: &Config) -> Result<Report> {
    let n = cfg.nodes;
    let tally = Arc::new(Tally::new(n, cfg.nb_iterations));
    let counters = Arc::new(MessageCounters::new());
    let links = runtime::build_links::<Message>(n);

    let watcher = runtime::spawn_shutdown_watcher(tally.clone(), links[0].0.clone());

    let mut handles = Vec::new();
    for (id, (outbox, inbox)) in links.into_iter().enumerate() {
        let node_id = NodeId(id as u32);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                present: true,
                pending: VecDeque::new(),
                ready_to_enter: false,
            }),
            cv: Condvar::new(),
        });

        let sampler = ResourceSampler::new(cfg.seed, node_id);
        let req_outbox = outbox.clone();
        let req_shared = shared.clone();
        let req_tally = tally.clone();
        let req_counters = counters.clone();
        let request_size = cfg.request_size;
        handles.push(
            std::thread::Builder::new()
                .name(format!("dijkstra-requester-{id}"))
                .spawn(move || {
                    requester_loop(
                        node_id,
                        n,
                        req_shared,
                        req_outbox,
                        req_tally,
                        req_counters,
                        sampler,
                        request_size,
                    )
                })
                .expect("failed to spawn requester thread"),
        );

        let in_counters = counters.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("dijkstra-inbox-{id}"))
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
    fn route_request_forwards_to_next_lower_id_when_present() {
        let mut st = State {
            present: true,
            pending: VecDeque::new(),
            ready_to_enter: false,
        };
        let out = route_request(5, &mut st, NodeId(9), vec![1, 3, 5]);
        assert_eq!(out, Some((NodeId(3), Message::Request { requester: NodeId(9), resources: vec![1, 3, 5] })));
        assert!(!st.present);
    }

    #[test]
    fn route_request_replies_when_no_lower_id_remains() {
        let mut st = State {
            present: true,
            pending: VecDeque::new(),
            ready_to_enter: false,
        };
        let out = route_request(1, &mut st, NodeId(9), vec![1, 3, 5]);
        assert_eq!(out, Some((NodeId(9), Message::Reply)));
    }

    #[test]
    fn route_request_queues_when_resource_absent() {
        let mut st = State {
            present: false,
            pending: VecDeque::new(),
            ready_to_enter: false,
        };
        let out = route_request(5, &mut st, NodeId(9), vec![1, 3, 5]);
        assert!(out.is_none());
        assert_eq!(st.pending.len(), 1);
    }

    #[test]
    fn four_nodes_conserve_with_multi_resource_requests() {
        let cfg = Config {
            algo: Algorithm::Dijkstra,
            nodes: 4,
            nb_iterations: 16,
            request_size: 2,
            seed: 11,
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.total_cs_entries(), 16);
    }
}
