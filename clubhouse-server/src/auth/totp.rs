//! TOTP enrollment, verification, and recovery codes
//!
//! Secrets are 160-bit, verified with RFC 6238 parameters (SHA-1, 30 s step,
//! ±1 step of skew), and stored AES-256-GCM encrypted. Recovery codes are
//! shown once; only keyed BLAKE3 digests are persisted, which keeps the
//! redeem path a single conditional `UPDATE`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::Rng;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::error::{Error, Result};

/// Number of recovery codes issued at enrollment
pub const RECOVERY_CODE_COUNT: usize = 10;

/// Recovery code length in characters
const RECOVERY_CODE_LEN: usize = 10;

/// Alphabet for recovery codes; skips characters readers confuse (0/O, 1/I/l)
const RECOVERY_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;

const NONCE_LEN: usize = 12;

/// What enrollment hands back to the client (and what we persist)
#[derive(Debug)]
pub struct MfaEnrollment {
    /// Base32 secret for manual entry
    pub secret_base32: String,

    /// otpauth:// URI for QR provisioning
    pub otpauth_url: String,

    /// Encrypted secret for the user row; never returned to the client
    pub encrypted_secret: String,
}

/// TOTP secret lifecycle and recovery-code derivation
#[derive(Clone)]
pub struct TotpManager {
    issuer: String,
    encryption_key: [u8; 32],
    recovery_mac_key: [u8; 32],
}

impl TotpManager {
    /// Build from the configured base64 key.
    ///
    /// An empty key yields a process-local random key so development setups
    /// start, at the cost of enrollments not surviving a restart.
    pub fn new(issuer: &str, encryption_key_b64: &str) -> Result<Self> {
        let encryption_key: [u8; 32] = if encryption_key_b64.is_empty() {
            tracing::warn!(
                "auth.totp_encryption_key is not set; using an ephemeral key \
                 (MFA enrollments will not survive a restart)"
            );
            rand::rng().random()
        } else {
            let bytes = STANDARD
                .decode(encryption_key_b64)
                .map_err(|e| Error::Internal(format!("invalid TOTP encryption key: {e}")))?;
            bytes
                .try_into()
                .map_err(|_| Error::Internal("TOTP encryption key must be 32 bytes".into()))?
        };

        Ok(Self {
            issuer: issuer.to_string(),
            encryption_key,
            recovery_mac_key: blake3::derive_key("clubhouse recovery-code v1", &encryption_key),
        })
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| Error::Internal(format!("TOTP construction failed: {e}")))
    }

    /// Start enrollment: a fresh 160-bit secret, not yet enabled
    pub fn enroll(&self, account: &str) -> Result<MfaEnrollment> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| Error::Internal(format!("secret generation failed: {e:?}")))?;

        let totp = self.totp(secret_bytes.clone(), account)?;

        Ok(MfaEnrollment {
            secret_base32: secret.to_encoded().to_string(),
            otpauth_url: totp.get_url(),
            encrypted_secret: self.encrypt_secret(&secret_bytes)?,
        })
    }

    /// Check a 6-digit code against the user's stored (encrypted) secret
    pub fn verify_code(&self, encrypted_secret: &str, account: &str, code: &str) -> Result<bool> {
        if code.len() != TOTP_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }

        let secret_bytes = self.decrypt_secret(encrypted_secret)?;
        let totp = self.totp(secret_bytes, account)?;

        totp.check_current(code)
            .map_err(|e| Error::Internal(format!("system clock error: {e}")))
    }

    fn encrypt_secret(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key));
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Internal(format!("secret encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    fn decrypt_secret(&self, encoded: &str) -> Result<Vec<u8>> {
        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Internal(format!("corrupt stored secret: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(Error::Internal("corrupt stored secret: too short".into()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key));

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Internal(format!("secret decryption failed: {e}")))
    }

    /// Generate a fresh set of one-time recovery codes (plaintext, shown once)
    pub fn generate_recovery_codes(&self) -> Vec<String> {
        let mut rng = rand::rng();
        (0..RECOVERY_CODE_COUNT)
            .map(|_| {
                (0..RECOVERY_CODE_LEN)
                    .map(|_| {
                        let idx = rng.random_range(0..RECOVERY_ALPHABET.len());
                        RECOVERY_ALPHABET[idx] as char
                    })
                    .collect()
            })
            .collect()
    }

    /// Keyed digest of a recovery code as stored in `mfa_recovery_codes`.
    ///
    /// Deterministic per deployment key, so redemption can match by equality
    /// inside the single-use `UPDATE`.
    pub fn recovery_digest(&self, code: &str) -> String {
        // Codes are case-insensitive on input
        let normalized = code.trim().to_ascii_uppercase();
        blake3::keyed_hash(&self.recovery_mac_key, normalized.as_bytes())
            .to_hex()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TotpManager {
        let key = STANDARD.encode([7u8; 32]);
        TotpManager::new("Clubhouse", &key).unwrap()
    }

    #[test]
    fn enrollment_produces_consistent_artifacts() {
        let mfa = manager();
        let enrollment = mfa.enroll("marta").unwrap();

        assert!(enrollment.otpauth_url.starts_with("otpauth://totp/"));
        assert!(enrollment.otpauth_url.contains("Clubhouse"));
        // 160-bit secret -> 32 base32 chars
        assert_eq!(enrollment.secret_base32.len(), 32);
    }

    #[test]
    fn secret_encryption_round_trips() {
        let mfa = manager();
        let secret = b"0123456789abcdef0123".to_vec();

        let encrypted = mfa.encrypt_secret(&secret).unwrap();
        assert_ne!(encrypted.as_bytes(), secret.as_slice());
        assert_eq!(mfa.decrypt_secret(&encrypted).unwrap(), secret);
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let mfa = manager();
        let secret = b"0123456789abcdef0123".to_vec();
        assert_ne!(
            mfa.encrypt_secret(&secret).unwrap(),
            mfa.encrypt_secret(&secret).unwrap()
        );
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let mfa = manager();
        let other = TotpManager::new("Clubhouse", &STANDARD.encode([8u8; 32])).unwrap();

        let encrypted = mfa.encrypt_secret(b"0123456789abcdef0123").unwrap();
        assert!(other.decrypt_secret(&encrypted).is_err());
    }

    #[test]
    fn current_code_verifies_and_junk_does_not() {
        let mfa = manager();
        let enrollment = mfa.enroll("marta").unwrap();

        let secret_bytes = Secret::Encoded(enrollment.secret_base32.clone())
            .to_bytes()
            .unwrap();
        let totp = mfa.totp(secret_bytes, "marta").unwrap();
        let current = totp.generate_current().unwrap();

        assert!(mfa
            .verify_code(&enrollment.encrypted_secret, "marta", &current)
            .unwrap());

        let wrong = if current == "000000" { "111111" } else { "000000" };
        assert!(!mfa
            .verify_code(&enrollment.encrypted_secret, "marta", wrong)
            .unwrap());
        // Non-numeric input short-circuits without touching the secret
        assert!(!mfa
            .verify_code(&enrollment.encrypted_secret, "marta", "abcdef")
            .unwrap());
    }

    #[test]
    fn recovery_codes_are_unique_and_digestible() {
        let mfa = manager();
        let codes = mfa.generate_recovery_codes();

        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        for code in &codes {
            assert_eq!(code.len(), RECOVERY_CODE_LEN);
        }

        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());

        // Digest is deterministic and case-insensitive
        let digest = mfa.recovery_digest(&codes[0]);
        assert_eq!(digest, mfa.recovery_digest(&codes[0].to_lowercase()));
        assert_ne!(digest, mfa.recovery_digest(&codes[1]));
    }

    #[test]
    fn digests_depend_on_the_deployment_key() {
        let a = manager();
        let b = TotpManager::new("Clubhouse", &STANDARD.encode([9u8; 32])).unwrap();
        assert_ne!(a.recovery_digest("AAAA BBBB"), b.recovery_digest("AAAA BBBB"));
    }
}
