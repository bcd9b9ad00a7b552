//! A didactic library of classical distributed mutual exclusion and
//! drinking-philosophers protocols: Lamport-Bakery, Ricart-Agrawala,
//! Naimi-Trehel, Chandy-Misra, Dijkstra's incremental allocator,
//! Bouabdallah-Laforest and Rhee.
//!
//! Every protocol is a per-node state machine communicating over reliable,
//! FIFO, in-memory channels; [`driver::run`] wires up `N` nodes and runs them
//! until a configured number of critical-section entries has been reached.

pub mod config;
pub mod driver;
pub mod error;
pub mod message;
pub mod node_id;
pub mod protocols;
pub mod rng;
pub mod runtime;

pub use error::Result;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, Config};

    #[test]
    fn smoke_runs_every_algorithm() {
        for algo in [
            Algorithm::LamportBakery,
            Algorithm::RicartAgrawala,
            Algorithm::NaimiTrehel,
            Algorithm::ChandyMisra,
            Algorithm::Dijkstra,
            Algorithm::BouabdallahLaforest,
            Algorithm::Rhee,
        ] {
            let cfg = Config {
                algo,
                nodes: 3,
                nb_iterations: 6,
                request_size: 2,
                seed: 1,
            };
            let report = driver::run(&cfg).expect("driver run should not fail");
            assert_eq!(report.total_cs_entries(), cfg.nb_iterations);
        }
    }
}
