use anyhow::anyhow;
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use password_hash::{PasswordHash, SaltString};

use crate::error::{SecurityError, SecurityResult};

/// Password hashing seam used by user creation and authentication.
pub trait PasswordHashing: Send + Sync {
    fn hash(&self, password: &str) -> SecurityResult<String>;
    fn verify(&self, hash: &str, password: &str) -> bool;
}

/// Argon2 PHC strings with a random 16-byte salt.
#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2Hashing;

impl PasswordHashing for Argon2Hashing {
    fn hash(&self, password: &str) -> SecurityResult<String> { hash_password(password) }
    fn verify(&self, hash: &str, password: &str) -> bool { verify_password(hash, password) }
}

pub fn hash_password(password: &str) -> SecurityResult<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| SecurityError::storage(anyhow!(e.to_string())))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| SecurityError::storage(anyhow!(e.to_string())))?;
    let phc = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| SecurityError::storage(anyhow!(e.to_string())))?
        .to_string();
    Ok(phc)
}

/// Unparseable hashes never verify.
pub fn verify_password(hash: &str, password: &str) -> bool {
    if let Ok(parsed) = PasswordHash::new(hash) {
        Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
    } else { false }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let h = hash_password("s3cret").unwrap();
        assert!(h.starts_with("$argon2"));
        assert!(verify_password(&h, "s3cret"));
        assert!(!verify_password(&h, "guess"));
        assert!(!verify_password("plain-text", "plain-text"));
        let again = hash_password("s3cret").unwrap();
        assert_ne!(h, again, "salts differ per hash");
    }
}
