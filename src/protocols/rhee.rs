//! Rhee (§4.9): a k-out-of-M drinking-philosophers scheduler built out of two
//! independent planes that share nothing but the node id:
//!
//! - the **fork plane**, a plain [`ChandyMisra`] instance used purely as a
//!   library inner mutex (`acquire`/`release`/`on_message`), never driven by
//!   its own requester loop — it exists only to serialise the REPORT/SELECT
//!   phase across the whole system;
//! - the **resource-scheduling plane**, this module's own message set
//!   (REPORT, SELECT, RELEASE, MARKED, GRANT, ADV, DEC), carried over a
//!   second, independently-wired set of inboxes.
//!
//! Every node plays both roles at once: it is a *user* issuing its own
//! k-resource requests, and it is the *manager* of the resource sharing its
//! id (the same "node doubles as resource manager" shape Dijkstra's
//! allocator uses, see `dijkstra.rs`).
//!
//! §9's open question ("receiveRelease but not rm_critical", suspected
//! missing queue) is resolved per the spec's instruction: a REPORT arriving
//! while the manager is already mid-episode is queued, never treated as an
//! error, and served the moment the in-flight SELECT clears `rm_critical`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::driver::Report;
use crate::error::Result;
use crate::message::Header;
use crate::node_id::NodeId;
use crate::protocols::chandy_misra::{self, ChandyMisra};
use crate::rng::ResourceSampler;
use crate::runtime::{self, Inbox, MessageCounters, Outbox, Tally};

/// The resource-scheduling plane's message set. The fork plane reuses
/// [`chandy_misra::Message`] unchanged, carried on its own wiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Report,
    Select { position: u64 },
    Release,
    Marked { occupied: Vec<u64> },
    Grant,
    Adv { position: u64 },
    Dec { position: u64 },
}

/// This node's state as manager of the resource sharing its id.
struct ManagerState {
    rm_critical: bool,
    /// REPORTs that arrived while already mid-episode; served in order as
    /// soon as the current episode's SELECT clears `rm_critical`.
    queued_reports: VecDeque<(NodeId, u64)>,
    /// position -> (requesting user, that user's request id).
    occupant: BTreeMap<u64, (NodeId, u64)>,
    has_received_advance: HashSet<u64>,
    has_dec_sent: HashSet<u64>,
}

/// This node's state as the user of its own in-flight request, if any.
struct UserState {
    request_id: u64,
    resources: Vec<usize>,
    marked_occupied: Vec<u64>,
    marked_count: usize,
    collect_done: bool,
    granted: HashSet<usize>,
    all_granted: bool,
}

struct Shared {
    manager: Mutex<ManagerState>,
    user: Mutex<UserState>,
    cv: Condvar,
}

fn occupied_positions(mgr: &ManagerState) -> Vec<u64> {
    mgr.occupant.keys().copied().collect()
}

/// §4.9 step 4: the position a requester claims once it has heard back from
/// every resource in its set, one past the highest position any of them
/// reported occupied (or 0 if none of them reported anything).
fn compute_position_selected(occupied: &[u64]) -> u64 {
    occupied.iter().copied().max().map_or(0, |m| m + 1)
}

enum AdjustAction {
    SendDec { to: NodeId, request_id: u64, position: u64 },
    Shift { to: NodeId, request_id: u64, new_position: u64 },
}

/// One step of §4.9 step 8's `adjust_queue(p)`: whether position `p` can
/// compact down into the now-empty `p-1`, and if so what follow-up message
/// that requires. Pure so the compaction logic is unit-testable without a
/// live outbox.
fn adjust_step(p: u64, mgr: &mut ManagerState) -> Option<AdjustAction> {
    if p == 0 {
        return None;
    }
    let occupant = *mgr.occupant.get(&p)?;
    if mgr.occupant.contains_key(&(p - 1)) {
        return None;
    }
    if !mgr.has_dec_sent.contains(&p) {
        mgr.has_dec_sent.insert(p);
        return Some(AdjustAction::SendDec {
            to: occupant.0,
            request_id: occupant.1,
            position: p,
        });
    }
    if mgr.has_received_advance.contains(&p) {
        mgr.occupant.remove(&p);
        mgr.occupant.insert(p - 1, occupant);
        mgr.has_dec_sent.remove(&p);
        mgr.has_received_advance.remove(&p);
        return Some(AdjustAction::Shift {
            to: occupant.0,
            request_id: occupant.1,
            new_position: p - 1,
        });
    }
    None
}

/// Drives `adjust_step` to a fixed point, starting at `p`: a shift makes
/// position `p+1` worth re-checking (its "below" slot just emptied), while a
/// bare DEC send stops the loop here — compaction resumes asynchronously when
/// the matching ADV arrives (step 10).
fn run_adjust_queue(
    id: NodeId,
    mut p: u64,
    manager: &Mutex<ManagerState>,
    outbox: &Outbox<Message>,
    counters: &MessageCounters,
) -> Result<()> {
    loop {
        let action = {
            let mut mgr = manager.lock();
            adjust_step(p, &mut mgr)
        };
        match action {
            None => break,
            Some(AdjustAction::SendDec { to, request_id, position }) => {
                outbox.send(to, Header::new(id, request_id), Message::Dec { position })?;
                counters.bump("DEC");
                break;
            }
            Some(AdjustAction::Shift { to, request_id, new_position }) => {
                if new_position == 0 {
                    outbox.send(to, Header::new(id, request_id), Message::Grant)?;
                    counters.bump("GRANT");
                }
                p += 1;
            }
        }
    }
    Ok(())
}

fn fork_inbox_loop(cm: Arc<ChandyMisra>, id: NodeId, inbox: Inbox<chandy_misra::Message>) {
    loop {
        let stored = match inbox.recv() {
            Ok(Some(stored)) => stored,
            Ok(None) => break,
            Err(e) => {
                log::error!("{} fatal decode error (fork plane): {:?}", id, e);
                break;
            }
        };
        if let Err(e) = cm.on_message(stored.header.sender, stored.kind) {
            log::error!("{} fatal error handling fork message: {:?}", id, e);
            break;
        }
    }
}

fn begin_request(user: &Mutex<UserState>, request_id: u64, resources: Vec<usize>) {
    let mut u = user.lock();
    u.request_id = request_id;
    u.resources = resources;
    u.marked_occupied.clear();
    u.marked_count = 0;
    u.collect_done = false;
    u.granted.clear();
    u.all_granted = false;
}

fn requester_loop(
    id: NodeId,
    n: usize,
    cm: Arc<ChandyMisra>,
    shared: Arc<Shared>,
    outbox: Outbox<Message>,
    tally: Arc<Tally>,
    counters: Arc<MessageCounters>,
    mut sampler: ResourceSampler,
    request_size: usize,
) {
    let mut next_request_id = 0u64;
    loop {
        if !tally.try_reserve() {
            break;
        }
        let resources = sampler.sample(n, request_size);

        // Step 1: acquire the inner mutex system-wide before touching any
        // resource manager's REPORT/SELECT episode.
        if cm.acquire().is_err() {
            break;
        }
        next_request_id += 1;
        let request_id = next_request_id;
        begin_request(&shared.user, request_id, resources.clone());

        for &r in &resources {
            if outbox
                .send(NodeId::from(r), Header::new(id, request_id), Message::Report)
                .is_err()
            {
                return;
            }
            counters.bump("REPORT");
        }

        let position_selected = {
            let mut u = shared.user.lock();
            while !u.collect_done {
                shared.cv.wait(&mut u);
            }
            compute_position_selected(&u.marked_occupied)
        };

        for &r in &resources {
            if outbox
                .send(
                    NodeId::from(r),
                    Header::new(id, request_id),
                    Message::Select { position: position_selected },
                )
                .is_err()
            {
                return;
            }
            counters.bump("SELECT");
        }

        // Step 4: release the inner mutex the moment SELECT is sent — the
        // rest of the protocol (waiting for GRANTs) runs unserialised.
        if cm.release().is_err() {
            break;
        }

        {
            let mut u = shared.user.lock();
            while !u.all_granted {
                shared.cv.wait(&mut u);
            }
        }

        log::debug!(
            "{} entering CS (rhee, resources={:?}, position={})",
            id,
            resources,
            position_selected
        );
        tally.record_entry(id);
        log::debug!("{} releasing CS (rhee)", id);

        for &r in &resources {
            if outbox
                .send(NodeId::from(r), Header::new(id, request_id), Message::Release)
                .is_err()
            {
                return;
            }
            counters.bump("RELEASE");
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
                log::error!("{} fatal decode error (resource plane): {:?}", id, e);
                break;
            }
        };
        let sender = stored.header.sender;
        let request_id = stored.header.request_id;

        match stored.kind {
            Message::Report => {
                let reply = {
                    let mut mgr = shared.manager.lock();
                    if mgr.rm_critical {
                        mgr.queued_reports.push_back((sender, request_id));
                        None
                    } else {
                        mgr.rm_critical = true;
                        Some(occupied_positions(&mgr))
                    }
                };
                if let Some(occupied) = reply {
                    if outbox
                        .send(sender, Header::new(id, request_id), Message::Marked { occupied })
                        .is_err()
                    {
                        break;
                    }
                    counters.bump("MARKED");
                }
            }
            Message::Select { position } => {
                let (grant_to, dequeued) = {
                    let mut mgr = shared.manager.lock();
                    mgr.occupant.insert(position, (sender, request_id));
                    let grant_to = if position == 0 { Some((sender, request_id)) } else { None };
                    let dequeued = mgr.queued_reports.pop_front();
                    if dequeued.is_none() {
                        mgr.rm_critical = false;
                    }
                    (grant_to, dequeued)
                };
                if let Some((to, rid)) = grant_to {
                    if outbox.send(to, Header::new(id, rid), Message::Grant).is_err() {
                        break;
                    }
                    counters.bump("GRANT");
                }
                if run_adjust_queue(id, position, &shared.manager, &outbox, &counters).is_err() {
                    break;
                }
                if let Some((user, rid)) = dequeued {
                    let occupied = {
                        let mgr = shared.manager.lock();
                        occupied_positions(&mgr)
                    };
                    if outbox
                        .send(user, Header::new(id, rid), Message::Marked { occupied })
                        .is_err()
                    {
                        break;
                    }
                    counters.bump("MARKED");
                }
            }
            Message::Release => {
                {
                    let mut mgr = shared.manager.lock();
                    mgr.occupant.remove(&0);
                }
                if run_adjust_queue(id, 1, &shared.manager, &outbox, &counters).is_err() {
                    break;
                }
            }
            Message::Adv { position } => {
                {
                    let mut mgr = shared.manager.lock();
                    mgr.has_received_advance.insert(position);
                }
                if run_adjust_queue(id, position, &shared.manager, &outbox, &counters).is_err() {
                    break;
                }
            }
            Message::Marked { occupied } => {
                let mut u = shared.user.lock();
                if request_id == u.request_id {
                    u.marked_occupied.extend(occupied);
                    u.marked_count += 1;
                    if u.marked_count == u.resources.len() {
                        u.collect_done = true;
                        drop(u);
                        shared.cv.notify_all();
                    }
                }
            }
            Message::Grant => {
                let mut u = shared.user.lock();
                if request_id == u.request_id {
                    u.granted.insert(usize::from(sender));
                    if u.granted.len() == u.resources.len() {
                        u.all_granted = true;
                        drop(u);
                        shared.cv.notify_all();
                    }
                }
            }
            Message::Dec { position } => {
                // §4.9 step 9: forward ADV to every resource in the set,
                // not only the one that sent DEC — harmless where a
                // resource's own occupant map isn't at `position`.
                let resources = {
                    let u = shared.user.lock();
                    u.resources.clone()
                };
                for r in resources {
                    if outbox
                        .send(NodeId::from(r), Header::new(id, request_id), Message::Adv { position })
                        .is_err()
                    {
                        return;
                    }
                    counters.bump("ADV");
                }
            }
        }
    }
}

pub fn run(cfg: &Config) -> Result<Report> {
    let n = cfg.nodes;
    let tally = Arc::new(Tally::new(n, cfg.nb_iterations));
    let counters = Arc::new(MessageCounters::new());
    let fork_counters = Arc::new(MessageCounters::new());
    let fork_links = runtime::build_links::<chandy_misra::Message>(n);
    let res_links = runtime::build_links::<Message>(n);

    let fork_watcher = runtime::spawn_shutdown_watcher(tally.clone(), fork_links[0].0.clone());
    let res_watcher = runtime::spawn_shutdown_watcher(tally.clone(), res_links[0].0.clone());

    let mut handles = Vec::new();
    let mut fork_iter = fork_links.into_iter();
    let mut res_iter = res_links.into_iter();
    for id in 0..n {
        let node_id = NodeId(id as u32);
        let (fork_outbox, fork_inbox) = fork_iter.next().expect("one fork link per node");
        let (res_outbox, res_inbox) = res_iter.next().expect("one resource link per node");

        let cm = Arc::new(ChandyMisra::new(node_id, n, fork_outbox, fork_counters.clone()));
        let shared = Arc::new(Shared {
            manager: Mutex::new(ManagerState {
                rm_critical: false,
                queued_reports: VecDeque::new(),
                occupant: BTreeMap::new(),
                has_received_advance: HashSet::new(),
                has_dec_sent: HashSet::new(),
            }),
            user: Mutex::new(UserState {
                request_id: 0,
                resources: Vec::new(),
                marked_occupied: Vec::new(),
                marked_count: 0,
                collect_done: false,
                granted: HashSet::new(),
                all_granted: false,
            }),
            cv: Condvar::new(),
        });

        let sampler = ResourceSampler::new(cfg.seed, node_id);
        let req_cm = cm.clone();
        let req_shared = shared.clone();
        let req_outbox = res_outbox.clone();
        let req_tally = tally.clone();
        let req_counters = counters.clone();
        let request_size = cfg.request_size;
        handles.push(
            std::thread::Builder::new()
                .name(format!("rhee-requester-{id}"))
                .spawn(move || {
                    requester_loop(
                        node_id,
                        n,
                        req_cm,
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

        let fork_cm = cm.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("rhee-fork-inbox-{id}"))
                .spawn(move || fork_inbox_loop(fork_cm, node_id, fork_inbox))
                .expect("failed to spawn fork inbox thread"),
        );

        let res_counters = counters.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("rhee-resource-inbox-{id}"))
                .spawn(move || inbox_loop(node_id, shared, res_inbox, res_outbox, res_counters))
                .expect("failed to spawn resource inbox thread"),
        );
    }

    for h in handles {
        let _ = h.join();
    }
    let _ = fork_watcher.join();
    let _ = res_watcher.join();

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

    fn empty_manager() -> ManagerState {
        ManagerState {
            rm_critical: false,
            queued_reports: VecDeque::new(),
            occupant: BTreeMap::new(),
            has_received_advance: HashSet::new(),
            has_dec_sent: HashSet::new(),
        }
    }

    #[test]
    fn position_selected_is_one_past_the_highest_occupied() {
        assert_eq!(compute_position_selected(&[]), 0);
        assert_eq!(compute_position_selected(&[0, 2, 1]), 3);
    }

    #[test]
    fn adjust_step_sends_dec_before_it_will_shift() {
        let mut mgr = empty_manager();
        mgr.occupant.insert(1, (NodeId(2), 7));
        let action = adjust_step(1, &mut mgr).expect("position 1 is occupied with 0 free");
        match action {
            AdjustAction::SendDec { to, request_id, position } => {
                assert_eq!(to, NodeId(2));
                assert_eq!(request_id, 7);
                assert_eq!(position, 1);
            }
            AdjustAction::Shift { .. } => panic!("expected a DEC send first"),
        }
        assert!(mgr.has_dec_sent.contains(&1));
    }

    #[test]
    fn adjust_step_shifts_once_advance_has_been_seen() {
        let mut mgr = empty_manager();
        mgr.occupant.insert(1, (NodeId(2), 7));
        mgr.has_dec_sent.insert(1);
        mgr.has_received_advance.insert(1);
        let action = adjust_step(1, &mut mgr).expect("ready to compact");
        match action {
            AdjustAction::Shift { to, request_id, new_position } => {
                assert_eq!(to, NodeId(2));
                assert_eq!(request_id, 7);
                assert_eq!(new_position, 0);
            }
            AdjustAction::SendDec { .. } => panic!("expected a shift"),
        }
        assert!(mgr.occupant.contains_key(&0));
        assert!(!mgr.occupant.contains_key(&1));
    }

    #[test]
    fn adjust_step_is_a_noop_when_the_slot_below_is_still_occupied() {
        let mut mgr = empty_manager();
        mgr.occupant.insert(0, (NodeId(1), 1));
        mgr.occupant.insert(1, (NodeId(2), 2));
        assert!(adjust_step(1, &mut mgr).is_none());
    }

    #[test]
    fn four_nodes_conserve_across_many_requests() {
        let cfg = Config {
            algo: Algorithm::Rhee,
            nodes: 4,
            nb_iterations: 12,
            request_size: 2,
            seed: 9,
        };
        let report = run(&cfg).unwrap();
        assert_eq!(report.total_cs_entries(), 12);
        assert_eq!(report.message_count("REPORT"), (cfg.request_size as u64) * 12);
        assert_eq!(report.message_count("RELEASE"), (cfg.request_size as u64) * 12);
    }
}
