//! Deterministic per-user derivation paths.

use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::hashes::{sha256, Hash};

use crate::types::UserId;

/// Number of path components taken from the user digest.
const USER_COMPONENTS: usize = 4;

/// `m/<u0>/<u1>/<u2>/<u3>/<epoch>`, where `u0..u3` are the first 16 bytes of
/// `sha256(user)` read as big-endian integers with the hardened bit cleared.
///
/// The same user and epoch always map to the same path.
pub fn derivation_path(user: &UserId, epoch: u32) -> DerivationPath {
    let digest = sha256::Hash::hash(user.as_str().as_bytes()).to_byte_array();
    let mut children: Vec<ChildNumber> = digest
        .chunks_exact(4)
        .take(USER_COMPONENTS)
        .map(|chunk| {
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            ChildNumber::Normal {
                index: index & 0x7FFF_FFFF,
            }
        })
        .collect();
    children.push(ChildNumber::Normal {
        index: epoch & 0x7FFF_FFFF,
    });
    DerivationPath::from(children)
}
