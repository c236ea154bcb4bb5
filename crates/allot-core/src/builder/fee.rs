//! Legacy P2PKH size and fee model.

use bitcoin::Amount;

/// Version, locktime and count prefixes.
pub const BASE_OVERHEAD_BYTES: u64 = 10;
/// Outpoint, sequence and a signature + compressed key `script_sig`.
pub const INPUT_BYTES: u64 = 148;
/// Value and a 25-byte P2PKH locking script.
pub const OUTPUT_BYTES: u64 = 34;

/// Outputs below this value are uneconomical to spend and are rejected.
pub const DUST_THRESHOLD: Amount = Amount::from_sat(546);

/// Estimated serialized size of a transaction with the given shape.
#[must_use]
pub fn estimate_size(inputs: usize, outputs: usize) -> u64 {
    BASE_OVERHEAD_BYTES + inputs as u64 * INPUT_BYTES + outputs as u64 * OUTPUT_BYTES
}

/// `estimate_size * sat_per_byte`. Returns `None` on overflow.
#[must_use]
pub fn estimate_fee(inputs: usize, outputs: usize, sat_per_byte: u64) -> Option<Amount> {
    estimate_size(inputs, outputs)
        .checked_mul(sat_per_byte)
        .map(Amount::from_sat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_matches_p2pkh_constants() {
        assert_eq!(estimate_size(1, 2), 10 + 148 + 2 * 34);
        assert_eq!(estimate_size(0, 0), BASE_OVERHEAD_BYTES);
    }

    #[test]
    fn fee_is_monotonic_in_inputs_and_outputs() {
        let rate = 7;
        for inputs in 0..20 {
            for outputs in 0..20 {
                let fee = estimate_fee(inputs, outputs, rate).expect("no overflow");
                let more_inputs = estimate_fee(inputs + 1, outputs, rate).expect("no overflow");
                let more_outputs = estimate_fee(inputs, outputs + 1, rate).expect("no overflow");
                assert!(more_inputs >= fee);
                assert!(more_outputs >= fee);
            }
        }
    }

    #[test]
    fn fee_overflow_is_reported() {
        assert!(estimate_fee(10, 10, u64::MAX).is_none());
    }

    #[test]
    fn zero_rate_means_zero_fee() {
        assert_eq!(estimate_fee(3, 3, 0), Some(Amount::ZERO));
    }
}
