//! Naimi-Trehel (§4.5): a distributed queue kept as two pointers per node,
//! `last` (towards the queue tail) and `next` (successor once queued), with
//! path reversal on every REQUEST forwarded.

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
    Request,
    Token,
}

struct State {
    last: Option<NodeId>,
    next: Option<NodeId>,
    has_token: bool,
    requesting: bool,
    ready_to_enter: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

fn requester_loop(
    id: NodeId,
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

        let target = {
            let mut st = shared.state.lock();
            st.requesting = true;
            if st.last.is_none() && st.has_token {
                st.ready_to_enter = true;
                None
            } else {
                st.last.take()
            }
        };
        if let Some(target) = target {
            if outbox
                .send(target, Header::new(id, next_request_id), Message::Request)
                .is_err()
            {
                break;
            }
            counters.bump("REQUEST");
        }

        {
            let mut st = shared.state.lock();
            while !st.ready_to_enter {
                shared.cv.wait(&mut st);
            }
            st.ready_to_enter = false;
        }

        if cs_guard.enter(id).is_err() {
            log::error!("{} fatal: mutual exclusion violated entering CS", id);
            break;
        }
        log::debug!("{} entering CS (naimi-trehel)", id);
        tally.record_entry(id);
        log::debug!("{} releasing CS (naimi-trehel)", id);
        if cs_guard.exit(id).is_err() {
            log::error!("{} fatal: mutual exclusion violated exiting CS", id);
            break;
        }

        let handoff = {
            let mut st = shared.state.lock();
            st.requesting = false;
            if let Some(next) = st.next.take() {
                st.last = Some(next);
                st.has_token = false;
                Some(next)
            } else {
                None
            }
        };
        if let Some(next) = handoff {
            if outbox
                .send(next, Header::new(id, next_request_id), Message::Token)
                .is_err()
            {
                break;
            }
            counters.bump("TOKEN");
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
            Message::Request => {
                enum Action {
                    ForwardToken,
                    Forward(NodeId),
                    Queued,
                }
                let action = {
                    let mut st = shared.state.lock();
                    let action = if st.last.is_none() {
                        if st.requesting {
                            st.next = Some(sender);
                            Action::Queued
                        } else {
                            st.has_token = false;
                            Action::ForwardToken
                        }
                    } else {
                        Action::Forward(st.last.unwrap())
                    };
                    st.last = Some(sender);
                    action
                };
                match action {
                    Action::ForwardToken => {
                        if outbox
                            .send(sender, Header::new(id, request_id), Message::Token)
                            .is_err()
                        {
                            break;
                        }
                        counters.bump("TOKEN");
                    }
                    Action::Forward(target) => {
                        if outbox
                            .send(target, Header::new(id, request_id), Message::Request)
                            .is_err()
                        {
                            break;
                        }
                        counters.bump("REQUEST");
                    }
                    Action::Queued => {}
                }
            }
            Message::Token => {
                let mut st = shared.state.lock();
                st.has_token = true;
                st.ready_to_enter = true;
                drop(st);
                shared.cv.notify_all();
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
        let node_id = NodeId(id as u32);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                last: if id == 0 { None } else { Some(NodeId(0)) },
                next: None,
                has_token: id == 0,
                requesting: false,
                ready_to_enter: false,
            }),
            cv: Condvar::new(),
        });

        let req_outbox = outbox.clone();
        let req_shared = shared.clone();
        let req_tally = tally.clone();
        let req_counters = counters.clone();
        let req_cs_guard = cs_guard.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("naimi-trehel-requester-{id}"))
                .spawn(move || requester_loop(node_id, req_shared, req_outbox, req_tally, req_counters, req_cs_guard))
                .expect("failed to spawn requester thread"),
        );

        let in_counters = counters.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("naimi-trehel-inbox-{id}"))
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
    fn single_node_holds_token_from_the_start_and_never_sends() {
        let cfg = Config {
            algo: Algorithm::NaimiTrehel,
            nodes: 2,
            nb_iterations: 1,
            request_size: 1,
            seed: 0,
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.total_cs_entries(), 1);
    }

    #[test]
    fn six_nodes_conserve_across_many_entries() {
        let cfg = Config {
            algo: Algorithm::NaimiTrehel,
            nodes: 6,
            nb_iterations: 30,
            request_size: 1,
            seed: 42,
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.total_cs_entries(), 30);
        // Every non-initial entry needed at least one REQUEST/TOKEN hop.
        assert!(report.message_count("TOKEN") >= 29);
    }
}
