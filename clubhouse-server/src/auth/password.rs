//! Password hashing using Argon2id
//!
//! PHC-format hashes with OWASP-recommended parameters. Verification is
//! constant-time and reads its parameters from the stored hash, so cost
//! changes roll forward without invalidating old hashes.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2Hasher, PasswordVerifier,
        SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::error::{Error, Result};

const MEMORY_COST_KIB: u32 = 19 * 1024;
const TIME_COST: u32 = 2;
const PARALLELISM: u32 = 1;

/// Argon2id password hasher
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    min_password_length: usize,
}

impl PasswordHasher {
    /// Create a hasher enforcing the given minimum password length
    pub fn new(min_password_length: usize) -> Result<Self> {
        let params = Params::new(MEMORY_COST_KIB, TIME_COST, PARALLELISM, None)
            .map_err(|e| Error::Internal(format!("invalid Argon2 parameters: {e}")))?;

        Ok(Self {
            params,
            min_password_length,
        })
    }

    /// Hash a password into PHC string format
    pub fn hash(&self, password: &str) -> Result<String> {
        if password.len() < self.min_password_length {
            return Err(Error::InvalidRequest(format!(
                "password must be at least {} characters",
                self.min_password_length
            )));
        }

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?;

        Ok(hash.to_string())
    }

    /// Verify a password against a stored hash.
    ///
    /// A malformed stored hash is an internal error, never a login failure
    /// the caller could confuse with bad credentials.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| Error::Internal(format!("invalid stored password hash: {e}")))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("password verification failed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hasher = PasswordHasher::new(8).unwrap();
        let hash = hasher.hash("correct horse battery").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse battery", &hash).unwrap());
        assert!(!hasher.verify("wrong horse", &hash).unwrap());
    }

    #[test]
    fn short_passwords_are_rejected_before_hashing() {
        let hasher = PasswordHasher::new(8).unwrap();
        let err = hasher.hash("short").unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn salts_differ_per_hash() {
        let hasher = PasswordHasher::new(8).unwrap();
        let a = hasher.hash("same password").unwrap();
        let b = hasher.hash("same password").unwrap();
        assert_ne!(a, b);
        assert!(hasher.verify("same password", &a).unwrap());
        assert!(hasher.verify("same password", &b).unwrap());
    }

    #[test]
    fn garbage_hash_is_an_internal_error() {
        let hasher = PasswordHasher::new(8).unwrap();
        assert!(hasher.verify("whatever", "not-a-phc-hash").is_err());
    }
}
