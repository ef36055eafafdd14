/// Password Hashing and Verification
///
/// One-way salted hashing with bcrypt. The salt and work factor are embedded
/// in the hash string, so two hashes of the same password never match
/// byte-for-byte yet both verify.
///
/// bcrypt silently ignores input past 72 bytes. Longer passwords are refused
/// here rather than truncated, so two passwords sharing a 72-byte prefix can
/// never stand in for each other.

use bcrypt::{hash, verify};

use crate::error::{AppError, ValidationError};

/// Longest password bcrypt reads in full
pub const MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    cost: u32,
}

impl PasswordHasher {
    /// # Arguments
    /// * `cost` - bcrypt work factor (4..=31)
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }

    /// Hash a password with a fresh random salt
    ///
    /// # Errors
    /// `TooLong` past `MAX_PASSWORD_BYTES`; internal error if bcrypt rejects
    /// the configured cost
    pub fn hash(&self, password: &str) -> Result<String, AppError> {
        if password.len() > MAX_PASSWORD_BYTES {
            return Err(ValidationError::TooLong("password", MAX_PASSWORD_BYTES).into());
        }
        hash(password, self.cost)
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))
    }

    /// Verify a password against a stored hash
    ///
    /// bcrypt compares digests in constant time. A stored hash that cannot be
    /// parsed is treated as a failed verification.
    pub fn verify(&self, password: &str, stored_hash: &str) -> bool {
        if password.len() > MAX_PASSWORD_BYTES {
            return false;
        }
        match verify(password, stored_hash) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::error!(error = %e, "Stored password hash is unreadable");
                false
            }
        }
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new(bcrypt::DEFAULT_COST)
    }
}
