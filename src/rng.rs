//! Resource-set sampling shared by the three k-out-of-M protocols (§4.2,
//! §9 "Random request generation"): draw `request_size` resources uniformly
//! without replacement from `{0,...,n-1}`, off a seedable RNG so test runs
//! are reproducible.

use crate::node_id::NodeId;

/// A per-node RNG derived from the run's configured seed. Each node gets a
/// distinct stream (seed folded with the node id) so concurrent draws are
/// independent without any cross-node coordination.
pub struct ResourceSampler {
    rng: fastrand::Rng,
}

impl ResourceSampler {
    pub fn new(seed: u64, node: NodeId) -> Self {
        let folded = seed ^ (u64::from(u32::from(node)).wrapping_mul(0x9E3779B97F4A7C15));
        Self {
            rng: fastrand::Rng::with_seed(folded),
        }
    }

    /// Draws `size` distinct resource ids from `0..n`, in increasing order.
    pub fn sample(&mut self, n: usize, size: usize) -> Vec<usize> {
        debug_assert!(size <= n);
        let mut pool: Vec<usize> = (0..n).collect();
        let mut chosen = Vec::with_capacity(size);
        for _ in 0..size {
            let idx = self.rng.usize(0..pool.len());
            chosen.push(pool.swap_remove(idx));
        }
        chosen.sort_unstable();
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_distinct_and_sorted() {
        let mut sampler = ResourceSampler::new(42, NodeId(0));
        let picked = sampler.sample(6, 3);
        assert_eq!(picked.len(), 3);
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        assert_eq!(picked, sorted);
        let unique: std::collections::HashSet<_> = picked.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn same_seed_same_node_is_deterministic() {
        let mut a = ResourceSampler::new(7, NodeId(1));
        let mut b = ResourceSampler::new(7, NodeId(1));
        assert_eq!(a.sample(10, 4), b.sample(10, 4));
    }
}
