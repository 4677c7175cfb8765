//! QR token signatures for serialized medication units.
//!
//! At packaging time the issuing authority signs the tuple
//! `(serial_number, batch_id, registry_sequence)` with a shared secret and
//! embeds the signature in the unit's QR code. On every consumer scan the
//! server recomputes the signature for the exact stored tuple and compares
//! it against the one supplied in the URL.
//!
//! Comparison is constant-time ([`subtle::ConstantTimeEq`]) so a probing
//! client learns nothing from response timing.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Version prefix mixed into every signature. Bump when the canonical
/// string format changes.
const SIGNATURE_VERSION: &str = "v1";

/// Compute the hex-encoded signature for a unit tuple.
///
/// The canonical string is `serial_number|batch_id|registry_sequence`,
/// keyed by the shared secret. Changing any element of the tuple changes
/// the signature.
pub fn compute_signature(
    serial_number: &str,
    batch_id: &str,
    registry_sequence: u64,
    secret: &str,
) -> String {
    let canonical = format!("{serial_number}|{batch_id}|{registry_sequence}");
    let mut hasher = Sha256::new();
    hasher.update(SIGNATURE_VERSION.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verify a supplied signature against the recomputed value for the stored
/// tuple. Constant-time over the signature bytes.
pub fn verify_signature(
    supplied: &str,
    serial_number: &str,
    batch_id: &str,
    registry_sequence: u64,
    secret: &str,
) -> bool {
    let expected = compute_signature(serial_number, batch_id, registry_sequence, secret);
    bool::from(supplied.as_bytes().ct_eq(expected.as_bytes()))
}

/// Recover the batch identifier embedded in a unit serial number.
///
/// Serial numbers follow `prefix-batchPart1-batchPart2[-suffix...]`; the
/// second and third `-`-separated segments joined with `-` are the batch id
/// (`SER-ABC-123-0007` → `ABC-123`). Returns `None` for serials too short
/// to carry a batch fragment.
pub fn embedded_batch_id(serial_number: &str) -> Option<String> {
    let parts: Vec<&str> = serial_number.split('-').collect();
    if parts.len() < 3 {
        return None;
    }
    Some(format!("{}-{}", parts[1], parts[2]))
}
