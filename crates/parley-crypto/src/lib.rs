/// Parley Crypto Library
///
/// Server-side secret handling only:
/// - opaque refresh secrets (generated here, stored as SHA-256 digests)
/// - Argon2id password hashing
///
/// Access credentials are signed JWTs and live in parley-core.

pub mod password;
pub mod secrets;
