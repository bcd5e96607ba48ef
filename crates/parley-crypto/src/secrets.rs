use rand::RngCore;
use sha2::{Digest, Sha256};

/// Raw entropy in a refresh secret, before hex encoding.
pub const REFRESH_SECRET_BYTES: usize = 40;

/// Generate a fresh opaque refresh secret (80 hex chars).
/// Only the client ever sees this value; the server keeps its digest.
pub fn generate_refresh_secret() -> String {
    let mut bytes = [0u8; REFRESH_SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// One-way digest used as the lookup key for a stored secret.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_long_and_unique() {
        let a = generate_refresh_secret();
        let b = generate_refresh_secret();
        assert_eq!(a.len(), REFRESH_SECRET_BYTES * 2);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_is_stable_and_hides_input() {
        let secret = generate_refresh_secret();
        let digest = hash_secret(&secret);
        assert_eq!(digest, hash_secret(&secret));
        assert_eq!(digest.len(), 64);
        assert_ne!(digest, secret);
        assert_ne!(digest, hash_secret("something else"));
    }
}
