// Registration token handling.
// The master stores only a SHA-256 digest of the shared token; workers send
// the raw token during the registration handshake.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of a generated registration token.
const TOKEN_LENGTH: usize = 48;

/// Compute the hex digest the master stores for a raw token.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a presented raw token against a stored digest.
///
/// Both sides are compared as fixed-length digests so the comparison shape
/// does not depend on the presented token.
pub fn verify_token(presented: &str, stored_digest: &str) -> bool {
    let presented_digest = token_digest(presented);
    if presented_digest.len() != stored_digest.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in presented_digest.bytes().zip(stored_digest.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Generate a fresh random registration token (master initialization).
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
