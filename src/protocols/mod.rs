//! One module per algorithm named in §1. Each owns its message enum, its
//! per-node state machine, and a `run(&Config) -> Result<Report>` entry point
//! that the driver dispatches to.

pub mod bouabdallah_laforest;
pub mod chandy_misra;
pub mod dijkstra;
pub mod lamport_bakery;
pub mod naimi_trehel;
pub mod ricart_agrawala;
pub mod rhee;
