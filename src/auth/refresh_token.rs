/// Refresh Token Material
///
/// Refresh tokens are:
/// - 32 bytes from the OS CSPRNG (256 bits), base64url-encoded without padding
/// - Hashed with SHA-256 before storage (the plaintext never reaches the store)
/// - Single-use: the store consumes them on exchange

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const TOKEN_BYTES: usize = 32;

/// Generate a new cryptographically secure refresh token
///
/// The returned plaintext is what the client holds.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest under which a refresh token is stored and looked up
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}
