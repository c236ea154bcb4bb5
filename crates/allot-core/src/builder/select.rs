//! UTXO selection strategies.

use std::str::FromStr;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Utxo;

/// Order in which candidates are accumulated until the target is covered.
///
/// `Optimal` currently accumulates largest-first; no separate
/// fee-minimising search is performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    LargestFirst,
    SmallestFirst,
    #[default]
    Optimal,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "largest-first" | "largest_first" => Ok(Self::LargestFirst),
            "smallest-first" | "smallest_first" => Ok(Self::SmallestFirst),
            "optimal" => Ok(Self::Optimal),
            other => Err(format!(
                "unknown selection strategy `{other}`; expected largest-first, smallest-first or optimal"
            )),
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LargestFirst => write!(f, "largest-first"),
            Self::SmallestFirst => write!(f, "smallest-first"),
            Self::Optimal => write!(f, "optimal"),
        }
    }
}

/// Greedily accumulate `candidates` in strategy order, stopping as soon as
/// the running total covers `target`.
///
/// Candidates must already be filtered to spendable UTXOs. Ties are broken
/// by outpoint so the result is deterministic.
pub fn select_utxos(
    candidates: &[Utxo],
    target: Amount,
    strategy: SelectionStrategy,
) -> Result<(Vec<Utxo>, Amount), CoreError> {
    let mut ordered: Vec<&Utxo> = candidates.iter().collect();
    match strategy {
        SelectionStrategy::LargestFirst | SelectionStrategy::Optimal => ordered.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        }),
        SelectionStrategy::SmallestFirst => ordered.sort_by(|a, b| {
            a.amount
                .cmp(&b.amount)
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        }),
    }

    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for utxo in ordered {
        if total >= target {
            break;
        }
        total = total
            .checked_add(utxo.amount)
            .ok_or_else(|| CoreError::InputValidation("utxo total overflows".into()))?;
        selected.push(utxo.clone());
    }

    if total < target {
        return Err(CoreError::InsufficientFunds {
            target,
            available: total,
        });
    }
    Ok((selected, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::utxo;

    fn sats(list: &[Utxo]) -> Vec<u64> {
        list.iter().map(|u| u.amount.to_sat()).collect()
    }

    #[test]
    fn largest_first_stops_once_target_is_covered() {
        let pool = vec![utxo(1, 10_000, 6), utxo(2, 50_000, 6), utxo(3, 30_000, 6)];
        let (picked, total) =
            select_utxos(&pool, Amount::from_sat(60_000), SelectionStrategy::LargestFirst)
                .expect("selection succeeds");
        assert_eq!(sats(&picked), vec![50_000, 30_000]);
        assert_eq!(total, Amount::from_sat(80_000));
    }

    #[test]
    fn smallest_first_accumulates_small_coins() {
        let pool = vec![utxo(1, 10_000, 6), utxo(2, 50_000, 6), utxo(3, 30_000, 6)];
        let (picked, total) =
            select_utxos(&pool, Amount::from_sat(35_000), SelectionStrategy::SmallestFirst)
                .expect("selection succeeds");
        assert_eq!(sats(&picked), vec![10_000, 30_000]);
        assert_eq!(total, Amount::from_sat(40_000));
    }

    #[test]
    fn optimal_matches_largest_first() {
        let pool = vec![utxo(1, 7_000, 6), utxo(2, 9_000, 6), utxo(3, 8_000, 6)];
        let target = Amount::from_sat(16_000);
        let (optimal, _) = select_utxos(&pool, target, SelectionStrategy::Optimal).unwrap();
        let (largest, _) = select_utxos(&pool, target, SelectionStrategy::LargestFirst).unwrap();
        assert_eq!(optimal, largest);
    }

    #[test]
    fn exhausted_pool_reports_target_and_available() {
        let pool = vec![utxo(1, 1_000, 6), utxo(2, 2_000, 6)];
        let err = select_utxos(&pool, Amount::from_sat(5_000), SelectionStrategy::Optimal)
            .expect_err("pool too small");
        match err {
            CoreError::InsufficientFunds { target, available } => {
                assert_eq!(target, Amount::from_sat(5_000));
                assert_eq!(available, Amount::from_sat(3_000));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn selection_always_covers_target() {
        let pool: Vec<Utxo> = (1..=12u8)
            .map(|i| utxo(i, u64::from(i) * 1_250, 6))
            .collect();
        for strategy in [
            SelectionStrategy::LargestFirst,
            SelectionStrategy::SmallestFirst,
            SelectionStrategy::Optimal,
        ] {
            for target in [1u64, 1_250, 9_999, 40_000, 97_500] {
                let target = Amount::from_sat(target);
                let (picked, total) = select_utxos(&pool, target, strategy).unwrap();
                let sum: u64 = picked.iter().map(|u| u.amount.to_sat()).sum();
                assert_eq!(sum, total.to_sat());
                assert!(total >= target, "{strategy} fell short of {target}");
            }
        }
    }

    #[test]
    fn strategy_parses_cli_spellings() {
        assert_eq!(
            "largest-first".parse::<SelectionStrategy>(),
            Ok(SelectionStrategy::LargestFirst)
        );
        assert_eq!(
            "smallest_first".parse::<SelectionStrategy>(),
            Ok(SelectionStrategy::SmallestFirst)
        );
        assert!("random".parse::<SelectionStrategy>().is_err());
    }
}
