//! Transaction builder: selects spendable funds and assembles a balanced,
//! fee-correct unsigned transaction.
//!
//! Everything here is pure and synchronous. Inputs are left with empty
//! `script_sig`s for the signing service to fill in.

pub mod fee;
pub mod select;

use std::collections::{HashMap, HashSet};

use bitcoin::address::NetworkUnchecked;
use bitcoin::{
    absolute, transaction, Address, Amount, Network, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Witness,
};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Allocation, Utxo};

pub use fee::{estimate_fee, estimate_size, DUST_THRESHOLD};
pub use select::{select_utxos, SelectionStrategy};

// ==============================================================================
// Parameters and Results
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildParams {
    pub network: Network,
    pub sat_per_byte: u64,
    pub strategy: SelectionStrategy,
    /// UTXOs with fewer confirmations are never selected.
    pub min_confirmations: u32,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            sat_per_byte: 10,
            strategy: SelectionStrategy::default(),
            min_confirmations: 1,
        }
    }
}

/// An allocation with its venue address resolved and network-checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub venue: String,
    pub address: Address,
    pub amount: Amount,
}

/// A balanced, unsigned transaction plus the accounting that produced it.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub tx: Transaction,
    /// Source UTXOs, aligned with `tx.input`.
    pub spent: Vec<Utxo>,
    pub total_input: Amount,
    /// All outputs, change included.
    pub total_output: Amount,
    pub fee: Amount,
    pub change: Option<Amount>,
}

impl BuiltTransaction {
    /// Sum of the allocation outputs, change excluded.
    pub fn allocated(&self) -> Amount {
        self.total_output - self.change.unwrap_or(Amount::ZERO)
    }
}

// ==============================================================================
// Venue Address Book
// ==============================================================================

/// Maps venue names to their deposit addresses.
#[derive(Debug, Clone, Default)]
pub struct VenueBook {
    addresses: HashMap<String, Address<NetworkUnchecked>>,
}

impl VenueBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a venue. The address is only parsed here; the network check
    /// happens at resolution time.
    pub fn insert(&mut self, venue: &str, address: &str) -> Result<(), CoreError> {
        let parsed = address.parse::<Address<NetworkUnchecked>>().map_err(|e| {
            CoreError::InputValidation(format!("invalid address for venue {venue}: {e}"))
        })?;
        self.addresses.insert(venue.to_owned(), parsed);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Turn `(venue, amount)` allocations into destinations valid for
    /// `network`, rejecting zero or sub-dust amounts, unknown venues and a
    /// venue listed twice. Positions are keyed by venue and funding
    /// transaction, so each venue may appear once per plan.
    pub fn resolve(
        &self,
        allocations: &[Allocation],
        network: Network,
    ) -> Result<Vec<Destination>, CoreError> {
        if allocations.is_empty() {
            return Err(CoreError::InputValidation("plan has no allocations".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = allocations.iter().find(|a| !seen.insert(a.venue.as_str())) {
            return Err(CoreError::InputValidation(format!(
                "venue {} is allocated more than once",
                dup.venue
            )));
        }

        allocations
            .iter()
            .map(|allocation| {
                if allocation.amount == Amount::ZERO {
                    return Err(CoreError::InputValidation(format!(
                        "allocation to {} is zero",
                        allocation.venue
                    )));
                }
                if allocation.amount < DUST_THRESHOLD {
                    return Err(CoreError::InputValidation(format!(
                        "allocation of {} to {} is below the dust threshold",
                        allocation.amount, allocation.venue
                    )));
                }
                let unchecked = self
                    .addresses
                    .get(&allocation.venue)
                    .ok_or_else(|| CoreError::not_found("venue", &allocation.venue))?;
                let address = unchecked.clone().require_network(network).map_err(|e| {
                    CoreError::InputValidation(format!(
                        "address of venue {} is not valid on {network}: {e}",
                        allocation.venue
                    ))
                })?;
                Ok(Destination {
                    venue: allocation.venue.clone(),
                    address,
                    amount: allocation.amount,
                })
            })
            .collect()
    }
}

/// Parse an address string and check it belongs to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, CoreError> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| CoreError::InputValidation(format!("invalid address {address}: {e}")))?
        .require_network(network)
        .map_err(|e| CoreError::InputValidation(format!("address {address} not valid on {network}: {e}")))
}

// ==============================================================================
// Construction
// ==============================================================================

/// Select funds from `candidates` and build a transaction paying every
/// destination, with change to `change_address` when it exceeds dust.
pub fn build_transaction(
    candidates: &[Utxo],
    destinations: &[Destination],
    change_address: &Address,
    params: &BuildParams,
) -> Result<BuiltTransaction, CoreError> {
    if destinations.is_empty() {
        return Err(CoreError::InputValidation("no destinations to pay".into()));
    }

    let spendable: Vec<Utxo> = candidates
        .iter()
        .filter(|u| u.is_spendable(params.min_confirmations))
        .cloned()
        .collect();

    let allocated = destinations
        .iter()
        .try_fold(Amount::ZERO, |acc, d| acc.checked_add(d.amount))
        .ok_or_else(|| CoreError::InputValidation("allocation total overflows".into()))?;

    let fee_overflow = || CoreError::InputValidation("fee estimate overflows".into());

    // Initial estimate assumes every spendable candidate is used plus a change
    // output, so selection never undershoots the final fee.
    let initial_fee = estimate_fee(spendable.len(), destinations.len() + 1, params.sat_per_byte)
        .ok_or_else(fee_overflow)?;
    let target = allocated.checked_add(initial_fee).ok_or_else(fee_overflow)?;

    if spendable.is_empty() {
        return Err(CoreError::InsufficientFunds {
            target,
            available: Amount::ZERO,
        });
    }

    let (selected, total_input) = select_utxos(&spendable, target, params.strategy)?;

    let fee_with_change =
        estimate_fee(selected.len(), destinations.len() + 1, params.sat_per_byte)
            .ok_or_else(fee_overflow)?;
    let remainder = total_input.checked_sub(allocated).ok_or_else(|| {
        CoreError::InsufficientFunds {
            target,
            available: total_input,
        }
    })?;
    let change = remainder
        .checked_sub(fee_with_change)
        .filter(|change| *change > DUST_THRESHOLD);

    let mut output: Vec<TxOut> = destinations
        .iter()
        .map(|d| TxOut {
            value: d.amount,
            script_pubkey: d.address.script_pubkey(),
        })
        .collect();

    // Without change the whole remainder is absorbed into the fee.
    let fee = match change {
        Some(change) => {
            output.push(TxOut {
                value: change,
                script_pubkey: change_address.script_pubkey(),
            });
            fee_with_change
        }
        None => remainder,
    };

    let input = selected
        .iter()
        .map(|utxo| TxIn {
            previous_output: utxo.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        })
        .collect();

    let built = BuiltTransaction {
        tx: Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input,
            output,
        },
        spent: selected,
        total_input,
        total_output: allocated + change.unwrap_or(Amount::ZERO),
        fee,
        change,
    };

    validate(&built, params.network)?;

    tracing::debug!(
        inputs = built.tx.input.len(),
        outputs = built.tx.output.len(),
        total_input = %built.total_input,
        fee = %built.fee,
        change = ?built.change,
        "built transaction"
    );
    Ok(built)
}

/// Structural and accounting checks on a built transaction.
pub fn validate(built: &BuiltTransaction, network: Network) -> Result<(), CoreError> {
    let tx = &built.tx;
    if tx.input.is_empty() {
        return Err(CoreError::InputValidation("transaction has no inputs".into()));
    }
    if tx.output.is_empty() {
        return Err(CoreError::InputValidation("transaction has no outputs".into()));
    }
    if tx.input.len() != built.spent.len() {
        return Err(CoreError::InputValidation(format!(
            "{} inputs but {} source utxos",
            tx.input.len(),
            built.spent.len()
        )));
    }

    let sum_in = built
        .spent
        .iter()
        .try_fold(Amount::ZERO, |acc, u| acc.checked_add(u.amount));
    let sum_out = tx
        .output
        .iter()
        .try_fold(Amount::ZERO, |acc, o| acc.checked_add(o.value));
    let (Some(sum_in), Some(sum_out)) = (sum_in, sum_out) else {
        return Err(CoreError::InputValidation("amount overflow".into()));
    };
    if sum_in != built.total_input || sum_out != built.total_output {
        return Err(CoreError::InputValidation(
            "recorded totals do not match inputs and outputs".into(),
        ));
    }
    if sum_out.checked_add(built.fee) != Some(sum_in) {
        return Err(CoreError::InputValidation(format!(
            "unbalanced transaction: inputs {sum_in} != outputs {sum_out} + fee {}",
            built.fee
        )));
    }

    for (idx, out) in tx.output.iter().enumerate() {
        if out.value < DUST_THRESHOLD {
            return Err(CoreError::InputValidation(format!(
                "output {idx} value {} is below the dust threshold",
                out.value
            )));
        }
        Address::from_script(&out.script_pubkey, network).map_err(|e| {
            CoreError::InputValidation(format!("output {idx} has no valid {network} address: {e}"))
        })?;
    }
    Ok(())
}
