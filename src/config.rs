//! The single configuration surface the engine accepts (§6, §10.3). The
//! engine itself never parses argv; a `clap`-based binary target owns that
//! and hands the engine a `Config`.

use std::fmt;
use std::str::FromStr;

/// Which of the seven protocols to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    LamportBakery,
    RicartAgrawala,
    NaimiTrehel,
    ChandyMisra,
    Dijkstra,
    BouabdallahLaforest,
    Rhee,
}

impl Algorithm {
    pub fn name(self) -> &'static str {
        match self {
            Algorithm::LamportBakery => "lamport-bakery",
            Algorithm::RicartAgrawala => "ricart-agrawala",
            Algorithm::NaimiTrehel => "naimi-trehel",
            Algorithm::ChandyMisra => "chandy-misra",
            Algorithm::Dijkstra => "dijkstra",
            Algorithm::BouabdallahLaforest => "bouabdallah-laforest",
            Algorithm::Rhee => "rhee",
        }
    }

    /// Whether this is a k-out-of-M (drinking philosophers) protocol, as
    /// opposed to a single-resource mutual-exclusion protocol.
    pub fn is_k_out_of_m(self) -> bool {
        matches!(
            self,
            Algorithm::Dijkstra | Algorithm::BouabdallahLaforest | Algorithm::Rhee
        )
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAlgorithmError(String);

impl fmt::Display for ParseAlgorithmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown algorithm {:?}", self.0)
    }
}

impl std::error::Error for ParseAlgorithmError {}

impl FromStr for Algorithm {
    type Err = ParseAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lamport-bakery" | "lamport_bakery" | "lamportbakery" => Ok(Algorithm::LamportBakery),
            "ricart-agrawala" | "ricart_agrawala" | "ricartagrawala" => {
                Ok(Algorithm::RicartAgrawala)
            }
            "naimi-trehel" | "naimi_trehel" | "naimitrehel" => Ok(Algorithm::NaimiTrehel),
            "chandy-misra" | "chandy_misra" | "chandymisra" => Ok(Algorithm::ChandyMisra),
            "dijkstra" => Ok(Algorithm::Dijkstra),
            "bouabdallah-laforest" | "bouabdallah_laforest" | "bouabdallahlaforest" => {
                Ok(Algorithm::BouabdallahLaforest)
            }
            "rhee" => Ok(Algorithm::Rhee),
            other => Err(ParseAlgorithmError(other.to_string())),
        }
    }
}

/// Engine configuration (§6). Defaults mirror the specification's defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub algo: Algorithm,
    pub nodes: usize,
    pub nb_iterations: usize,
    pub request_size: usize,
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            algo: Algorithm::Rhee,
            nodes: 4,
            nb_iterations: 10,
            request_size: 2,
            seed: 0x5EED,
        }
    }
}

impl Config {
    /// Validates the invariants §6 places on the surface (N >= 2, 1 <= k <= N).
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.nodes < 2 {
            return Err(format!("--nodes must be >= 2, got {}", self.nodes));
        }
        if self.algo.is_k_out_of_m() && !(1..=self.nodes).contains(&self.request_size) {
            return Err(format!(
                "--request-size must be in 1..={}, got {}",
                self.nodes, self.request_size
            ));
        }
        Ok(())
    }
}
