//! Thin CLI wrapper around the `dmx` engine (§6, §10.3). Parses argv into a
//! [`Config`], installs the process-wide logger, runs the configured
//! algorithm to completion, and prints the per-node tally.
//!
//! The engine crate itself never touches argv or a logger: both are this
//! binary's job, so the engine can be embedded elsewhere without fighting
//! over global state.

use clap::Parser;
use dmx::config::{Algorithm, Config};

/// A didactic library of classical distributed mutual-exclusion and
/// drinking-philosophers protocols.
#[derive(Debug, Parser)]
#[command(name = "dmx", version, about)]
struct Args {
    /// Which protocol to run.
    #[arg(long = "algo", default_value = "rhee")]
    algo: Algorithm,

    /// Number of participating nodes (N >= 2).
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Total CS entries across all nodes before the run terminates.
    #[arg(long = "nb-iterations", default_value_t = 10)]
    nb_iterations: usize,

    /// Resources requested per CS entry, for k-out-of-M algorithms.
    #[arg(long = "request-size", default_value_t = 2)]
    request_size: usize,

    /// RNG seed for deterministic resource-set sampling.
    #[arg(long, default_value_t = 0x5EED)]
    seed: u64,

    /// Raise log verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Config {
            algo: args.algo,
            nodes: args.nodes,
            nb_iterations: args.nb_iterations,
            request_size: args.request_size,
            seed: args.seed,
        }
    }
}

fn main() {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let cfg = Config::from(&args);
    if let Err(e) = cfg.validate() {
        eprintln!("invalid configuration: {e}");
        std::process::exit(2);
    }

    match dmx::driver::run(&cfg) {
        Ok(report) => {
            println!("algorithm:      {}", report.algo);
            println!("total entries:  {}", report.total_cs_entries());
            println!("per-node:       {:?}", report.per_node_entries);
            let mut kinds: Vec<_> = report.message_counts.iter().collect();
            kinds.sort_by_key(|(k, _)| *k);
            for (kind, count) in kinds {
                println!("  {kind:<12} {count}");
            }
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    }
}
