//! Chandy-Misra (§4.6): a fork per edge of the complete graph, clean/dirty
//! discipline to guarantee liveness, deferred requests drained on release.
//!
//! Exposed as a library (`ChandyMisra::acquire`/`release`) as well as a
//! standalone driven protocol, so Rhee (§4.9) can compose it as its inner
//! mutex instead of re-implementing fork handling.

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
    RequestFork,
    SendFork,
}

struct ForkEntry {
    held: bool,
    clean: bool,
    /// A REQUEST arrived for this fork while we couldn't immediately send it
    /// (either because it was clean and we're still using it, or because we
    /// didn't hold it yet and the request raced the fork itself in transit).
    /// Replayed the moment we next give the fork up.
    queued_request: bool,
    /// Whether we currently have an outstanding RequestFork out for this
    /// fork (set when sent, cleared when the fork arrives). Also doubles as
    /// "have we had reason to doubt this fork since we last went hungry": a
    /// fork we still hold and never had to ask for again is safe to treat as
    /// clean without a round trip (see `acquire`).
    requested: bool,
}

struct State {
    forks: HashMap<NodeId, ForkEntry>,
    hungry: bool,
    enabled: bool,
}

impl State {
    fn recompute_enabled(&mut self) {
        self.enabled = self.hungry && self.forks.values().all(|f| f.held && f.clean);
    }
}

/// One node's fork-holding state machine. Shared (`Arc`) between whichever
/// thread owns the inbox loop (dispatching [`ChandyMisra::on_message`]) and
/// whichever thread calls [`ChandyMisra::acquire`]/[`ChandyMisra::release`].
pub struct ChandyMisra {
    id: NodeId,
    outbox: Outbox<Message>,
    counters: Arc<MessageCounters>,
    state: Mutex<State>,
    cv: Condvar,
}

impl ChandyMisra {
    /// Builds the initial fork assignment: the lower-id endpoint of each edge
    /// holds the fork, and every fork starts dirty, which keeps the
    /// who-owes-whom graph acyclic from the first step.
    pub fn new(id: NodeId, n: usize, outbox: Outbox<Message>, counters: Arc<MessageCounters>) -> Self {
        let forks = NodeId::all(n)
            .filter(|&peer| peer != id)
            .map(|peer| {
                (
                    peer,
                    ForkEntry {
                        held: id < peer,
                        clean: false,
                        queued_request: false,
                        requested: false,
                    },
                )
            })
            .collect();
        Self {
            id,
            outbox,
            counters,
            state: Mutex::new(State {
                forks,
                hungry: false,
                enabled: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Becomes hungry, (re-)requests every fork not currently held and not
    /// already awaiting a reply, and blocks until every fork is held and
    /// clean. Returns once this node is enabled to eat; the caller is now in
    /// the critical section.
    ///
    /// A fork we already hold but never had to ask for again (`!requested`)
    /// is marked clean right here rather than left dirty forever: a fork
    /// assigned to us at start-up, or returned to us by a previous release
    /// with nobody else ever asking for it back, would otherwise never see a
    /// SendFork message to clean it through the normal path, and `enabled`
    /// requires every held fork to be clean. Without this, the very first
    /// node to hold every incident fork (and every node thereafter that
    /// nobody contests) can never become enabled — a permanent deadlock.
    pub fn acquire(&self) -> Result<()> {
        let missing: Vec<NodeId> = {
            let mut st = self.state.lock();
            st.hungry = true;
            let mut missing = Vec::new();
            for (&peer, f) in st.forks.iter_mut() {
                if f.held {
                    if !f.requested {
                        f.clean = true;
                    }
                } else if !f.requested {
                    f.requested = true;
                    missing.push(peer);
                }
            }
            st.recompute_enabled();
            missing
        };
        for peer in missing {
            self.outbox
                .send(peer, Header::new(self.id, 0), Message::RequestFork)?;
            self.counters.bump("REQUEST_FORK");
        }

        let mut st = self.state.lock();
        while !st.enabled {
            self.cv.wait(&mut st);
        }
        Ok(())
    }

    /// Dirties every held fork, then drains and sends every fork a peer
    /// asked for while we were using it (§4.6 "Entry" step).
    pub fn release(&self) -> Result<()> {
        let to_send: Vec<NodeId> = {
            let mut st = self.state.lock();
            st.hungry = false;
            st.enabled = false;
            for f in st.forks.values_mut() {
                f.clean = false;
            }
            let mut to_send = Vec::new();
            for (&peer, f) in st.forks.iter_mut() {
                if f.queued_request {
                    f.held = false;
                    f.queued_request = false;
                    to_send.push(peer);
                }
            }
            to_send
        };
        for peer in to_send {
            self.outbox
                .send(peer, Header::new(self.id, 0), Message::SendFork)?;
            self.counters.bump("SEND_FORK");
        }
        Ok(())
    }

    /// Feeds one incoming fork-plane message into the state machine. Called
    /// by whatever owns the inbox loop — this module's own `run`, or Rhee's
    /// combined dispatcher.
    pub fn on_message(&self, sender: NodeId, msg: Message) -> Result<()> {
        match msg {
            Message::RequestFork => {
                let reply = {
                    let mut st = self.state.lock();
                    let entry = st
                        .forks
                        .get_mut(&sender)
                        .expect("request from a node outside the fork graph");
                    if entry.held {
                        if entry.clean {
                            entry.queued_request = true;
                            false
                        } else {
                            entry.held = false;
                            entry.clean = true;
                            true
                        }
                    } else {
                        entry.queued_request = true;
                        false
                    }
                };
                if reply {
                    self.outbox
                        .send(sender, Header::new(self.id, 0), Message::SendFork)?;
                    self.counters.bump("SEND_FORK");
                }
            }
            Message::SendFork => {
                let mut st = self.state.lock();
                let entry = st
                    .forks
                    .get_mut(&sender)
                    .expect("fork from a node outside the fork graph");
                entry.held = true;
                entry.clean = true;
                entry.requested = false;
                st.recompute_enabled();
                if st.enabled {
                    drop(st);
                    self.cv.notify_all();
                }
            }
        }
        Ok(())
    }
}

fn inbox_loop(cm: Arc<ChandyMisra>, id: NodeId, inbox: Inbox<Message>) {
    loop {
        let stored = match inbox.recv() {
            Ok(Some(stored)) => stored,
            Ok(None) => break,
            Err(e) => {
                log::error!("{} fatal decode error: {:?}", id, e);
                break;
            }
        };
        if let Err(e) = cm.on_message(stored.header.sender, stored.kind) {
            log::error!("{} fatal error handling {:?}: {:?}", id, stored.kind, e);
            break;
        }
    }
}

fn requester_loop(cm: Arc<ChandyMisra>, id: NodeId, tally: Arc<Tally>, cs_guard: Arc<CsGuard>) {
    loop {
        if !tally.try_reserve() {
            break;
        }
        if cm.acquire().is_err() {
            break;
        }
        if cs_guard.enter(id).is_err() {
            log::error!("{} fatal: mutual exclusion violated entering CS", id);
            break;
        }
        log::debug!("{} entering CS (chandy-misra)", id);
        tally.record_entry(id);
        log::debug!("{} releasing CS (chandy-misra)", id);
        if cs_guard.exit(id).is_err() {
            log::error!("{} fatal: mutual exclusion violated exiting CS", id);
            break;
        }
        if cm.release().is_err() {
            break;
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
        let cm = Arc::new(ChandyMisra::new(node_id, n, outbox, counters.clone()));

        let req_cm = cm.clone();
        let req_tally = tally.clone();
        let req_cs_guard = cs_guard.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("chandy-misra-requester-{id}"))
                .spawn(move || requester_loop(req_cm, node_id, req_tally, req_cs_guard))
                .expect("failed to spawn requester thread"),
        );

        handles.push(
            std::thread::Builder::new()
                .name(format!("chandy-misra-inbox-{id}"))
                .spawn(move || inbox_loop(cm, node_id, inbox))
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
    fn initial_assignment_is_acyclic_by_id() {
        let (outbox, _inbox) = runtime::build_links::<Message>(3).remove(1);
        let cm = ChandyMisra::new(NodeId(1), 3, outbox, Arc::new(MessageCounters::new()));
        let st = cm.state.lock();
        assert!(!st.forks[&NodeId(0)].held); // peer 0 < 1: node 1 does not hold it
        assert!(st.forks[&NodeId(2)].held); // peer 2 > 1: node 1 holds it
        assert!(st.forks.values().all(|f| !f.clean));
    }

    #[test]
    fn four_nodes_conserve_across_many_entries() {
        let cfg = Config {
            algo: Algorithm::ChandyMisra,
            nodes: 4,
            nb_iterations: 20,
            request_size: 1,
            seed: 3,
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.total_cs_entries(), 20);
    }
}
