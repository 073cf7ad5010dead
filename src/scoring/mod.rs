//! Luck scoring: how far an observed rarity distribution deviates from the
//! game's stated drop rates.
//!
//! Per rarity with expected probability p over `total` openings:
//!   expected  = total × p
//!   deviation = (observed − expected) / √expected      (Poisson z-score)
//!   weight    = −log₂ p                                 (rarer counts more)
//! score = Σ(weight × deviation) / Σ weight × 100
//!
//! 0 means exactly as expected; positive is luckier than expected.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rarity {
    Mythic,
    Legendary,
    Epic,
    Rare,
    Uncommon,
    Common,
}

impl Rarity {
    pub const ALL: [Rarity; 6] = [
        Rarity::Mythic,
        Rarity::Legendary,
        Rarity::Epic,
        Rarity::Rare,
        Rarity::Uncommon,
        Rarity::Common,
    ];

    /// Stated drop probability of one case opening.
    pub fn expected_rate(self) -> f64 {
        match self {
            Rarity::Mythic => 0.0001,
            Rarity::Legendary => 0.0004,
            Rarity::Epic => 0.0085,
            Rarity::Rare => 0.071,
            Rarity::Uncommon => 0.30,
            Rarity::Common => 0.62,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rarity::Mythic => "mythic",
            Rarity::Legendary => "legendary",
            Rarity::Epic => "epic",
            Rarity::Rare => "rare",
            Rarity::Uncommon => "uncommon",
            Rarity::Common => "common",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Rarity::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

pub type RarityCounts = BTreeMap<Rarity, u64>;

/// Deviation score of `observed` over `total` openings.
///
/// Returns 0.0 for `total == 0`. Rarities missing from `observed` count as
/// zero observations.
pub fn score(observed: &RarityCounts, total: u64) -> f64 {
    score_with(observed, total, |r| r.expected_rate())
}

fn score_with(observed: &RarityCounts, total: u64, rate: impl Fn(Rarity) -> f64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let mut weighted = 0.0;
    let mut weights = 0.0;
    for rarity in Rarity::ALL {
        let p = rate(rarity);
        let expected = total as f64 * p;
        if p <= 0.0 || expected <= 0.0 {
            continue;
        }
        let seen = observed.get(&rarity).copied().unwrap_or(0) as f64;
        let deviation = (seen - expected) / expected.sqrt();
        let weight = -p.log2();
        weighted += weight * deviation;
        weights += weight;
    }
    if weights <= 0.0 {
        return 0.0;
    }
    weighted / weights * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_scores_zero() {
        assert_eq!(score(&RarityCounts::new(), 0), 0.0);
        // counts without a total are still degenerate
        let counts = RarityCounts::from([(Rarity::Mythic, 3)]);
        assert_eq!(score(&counts, 0), 0.0);
    }

    #[test]
    fn test_single_mythic_hit_dominates() {
        let counts = RarityCounts::from([(Rarity::Mythic, 1)]);
        let s = score(&counts, 1);
        assert!(s > 3000.0, "score was {s}");
        assert!((s - 3515.0).abs() < 5.0, "score was {s}");
    }

    #[test]
    fn test_expected_distribution_scores_near_zero() {
        let total = 1_000_000u64;
        let counts: RarityCounts = Rarity::ALL
            .into_iter()
            .map(|r| (r, (r.expected_rate() * total as f64).round() as u64))
            .collect();
        assert_eq!(counts.values().sum::<u64>(), total);
        assert!(score(&counts, total).abs() < 1e-6);
    }

    #[test]
    fn test_all_common_is_unlucky() {
        let counts = RarityCounts::from([(Rarity::Common, 500)]);
        assert!(score(&counts, 500) < 0.0);
    }

    #[test]
    fn test_zero_probability_category_is_skipped() {
        let counts = RarityCounts::from([(Rarity::Common, 10)]);
        let s = score_with(&counts, 10, |r| if r == Rarity::Mythic { 0.0 } else { r.expected_rate() });
        assert!(s.is_finite());
    }

    #[test]
    fn test_rarity_parse() {
        assert_eq!(Rarity::parse("Legendary"), Some(Rarity::Legendary));
        assert_eq!(Rarity::parse("shiny"), None);
    }
}
