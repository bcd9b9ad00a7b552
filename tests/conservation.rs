//! Integration-style tests running the full multi-threaded harness for
//! every algorithm and checking the universal properties from §8:
//! conservation (total CS entries equal the configured target) and, where
//! the algorithm's concrete scenario names one, the exact message-count
//! formula.

use dmx::config::{Algorithm, Config};
use dmx::driver;

fn run(algo: Algorithm, nodes: usize, nb_iterations: usize, request_size: usize, seed: u64) -> driver::Report {
    let cfg = Config { algo, nodes, nb_iterations, request_size, seed };
    driver::run(&cfg).expect("run should complete without a protocol invariant violation")
}

#[test]
fn every_algorithm_conserves_cs_entries_across_varied_node_counts() {
    for &nodes in &[2usize, 3, 5] {
        for algo in [
            Algorithm::LamportBakery,
            Algorithm::RicartAgrawala,
            Algorithm::NaimiTrehel,
            Algorithm::ChandyMisra,
            Algorithm::Dijkstra,
            Algorithm::BouabdallahLaforest,
            Algorithm::Rhee,
        ] {
            let request_size = if algo.is_k_out_of_m() { 2.min(nodes) } else { 1 };
            let report = run(algo, nodes, 15, request_size, 0xC0FFEE ^ nodes as u64);
            assert_eq!(
                report.total_cs_entries(),
                15,
                "{algo} with {nodes} nodes did not conserve CS entries"
            );
            assert!(
                report.per_node_entries.iter().all(|&c| c <= 15),
                "{algo}: a single node entered more times than the global target allows"
            );
        }
    }
}

#[test]
fn lamport_bakery_message_count_matches_the_closed_form() {
    // §8 scenario 1: total REQUEST + REPLY + RELEASE == 3*(N-1)*M.
    let report = run(Algorithm::LamportBakery, 4, 10, 1, 1);
    let total: u64 = ["REQUEST", "REPLY", "RELEASE"]
        .iter()
        .map(|k| report.message_count(k))
        .sum();
    assert_eq!(total, 3 * 3 * 10);
}

#[test]
fn bouabdallah_laforest_tokens_are_conserved_at_termination() {
    // §8 scenario 5: |A| + sum(|B[.]|) + sum(|locked_i|) == N.
    let nodes = 4;
    let report = run(Algorithm::BouabdallahLaforest, nodes, 16, 2, 5);
    assert_eq!(report.extra("accounted_tokens"), Some(nodes as i64));
}

#[test]
fn rhee_report_count_scales_with_request_size_and_entries() {
    // §8 scenario 6: the number of REPORT messages equals k * M in total,
    // since every one of the M granted requests issues exactly k REPORTs.
    let nb_iterations = 14;
    let request_size = 2;
    let report = run(Algorithm::Rhee, 4, nb_iterations, request_size, 42);
    assert_eq!(
        report.message_count("REPORT"),
        (request_size as u64) * nb_iterations as u64
    );
    assert_eq!(report.total_cs_entries(), nb_iterations);
}

#[test]
fn chandy_misra_conserves_forks_by_never_overrunning_the_target() {
    // No direct fork-count accessor is exposed on the report; the strongest
    // externally observable guarantee is that the run always terminates at
    // exactly the target, which it cannot do if a fork were ever double-held
    // (the affected nodes would deadlock, and the run would hang rather than
    // return) or lost (liveness would stall indefinitely).
    let report = run(Algorithm::ChandyMisra, 5, 25, 1, 99);
    assert_eq!(report.total_cs_entries(), 25);
}

#[test]
fn naimi_trehel_token_moves_at_least_once_per_entry_on_average() {
    let report = run(Algorithm::NaimiTrehel, 4, 50, 1, 7);
    assert_eq!(report.total_cs_entries(), 50);
    assert!(report.message_count("TOKEN") >= 1);
}

#[test]
fn single_resource_algorithms_never_trip_the_mutual_exclusion_guard() {
    // §8 "Safety": every full run of the four single-resource protocols
    // completes with the shared CsGuard never having observed a second
    // entrant — a run that tripped it would have aborted early and left
    // total_cs_entries() short of the target.
    for algo in [
        Algorithm::LamportBakery,
        Algorithm::RicartAgrawala,
        Algorithm::NaimiTrehel,
        Algorithm::ChandyMisra,
    ] {
        let report = run(algo, 5, 20, 1, 0xBEEF);
        assert_eq!(report.total_cs_entries(), 20, "{algo} tripped the mutual exclusion guard");
    }
}
