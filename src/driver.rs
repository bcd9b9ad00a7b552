//! The driver / harness (§4.10): picks the configured algorithm, builds `N`
//! nodes wired to every peer's inbox, runs them until the shared iteration
//! counter reaches the target, and joins everything into one [`Report`].

use std::collections::HashMap;

use crate::config::{Algorithm, Config};
use crate::error::{Error, ErrorKind, Result};
use crate::protocols::{
    bouabdallah_laforest, chandy_misra, dijkstra, lamport_bakery, naimi_trehel, ricart_agrawala,
    rhee,
};

/// Everything the test scenarios in §8 need to check against a completed run:
/// per-node CS-entry counts, a ledger of message kinds sent, and a small bag
/// of algorithm-specific numbers (final token holder, fork conservation
/// check, and so on) that don't warrant a bespoke type per protocol.
#[derive(Debug, Clone)]
pub struct Report {
    pub algo: Algorithm,
    pub per_node_entries: Vec<usize>,
    pub message_counts: HashMap<&'static str, u64>,
    pub extra: HashMap<&'static str, i64>,
}

impl Report {
    pub fn total_cs_entries(&self) -> usize {
        self.per_node_entries.iter().sum()
    }

    pub fn message_count(&self, kind: &str) -> u64 {
        self.message_counts.get(kind).copied().unwrap_or(0)
    }

    pub fn extra(&self, key: &str) -> Option<i64> {
        self.extra.get(key).copied()
    }
}

/// Runs `cfg.algo` to completion and returns the tally.
pub fn run(cfg: &Config) -> Result<Report> {
    cfg.validate()
        .map_err(|_| Error::new(ErrorKind::InvalidConfig))?;

    log::info!(
        "starting {} with {} nodes, {} CS entries, request size {}",
        cfg.algo,
        cfg.nodes,
        cfg.nb_iterations,
        cfg.request_size
    );

    let report = match cfg.algo {
        Algorithm::LamportBakery => lamport_bakery::run(cfg)?,
        Algorithm::RicartAgrawala => ricart_agrawala::run(cfg)?,
        Algorithm::NaimiTrehel => naimi_trehel::run(cfg)?,
        Algorithm::ChandyMisra => chandy_misra::run(cfg)?,
        Algorithm::Dijkstra => dijkstra::run(cfg)?,
        Algorithm::BouabdallahLaforest => bouabdallah_laforest::run(cfg)?,
        Algorithm::Rhee => rhee::run(cfg)?,
    };

    log::info!(
        "{} finished: {} total CS entries, per-node {:?}",
        cfg.algo,
        report.total_cs_entries(),
        report.per_node_entries
    );

    Ok(report)
}
