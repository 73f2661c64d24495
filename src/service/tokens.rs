//! Opaque bearer tokens, scoped to one security service instance.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::RwLock;

use crate::error::{SecurityError, SecurityResult};
use crate::tprintln;

#[derive(Debug, Clone)]
struct TokenEntry {
    user: String,
    expires_at: Instant,
}

// 256 random bits, base64url without padding
fn gen_token() -> SecurityResult<String> {
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| SecurityError::storage(anyhow::anyhow!(e.to_string())))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

pub struct TokenRegistry {
    ttl: Duration,
    tokens: RwLock<HashMap<String, TokenEntry>>,
    by_user: RwLock<HashMap<String, HashSet<String>>>,
}

impl TokenRegistry {
    pub fn new(ttl: Duration) -> Self { Self { ttl, tokens: RwLock::new(HashMap::new()), by_user: RwLock::new(HashMap::new()) } }

    pub fn ttl(&self) -> Duration { self.ttl }

    pub fn issue(&self, user: &str) -> SecurityResult<String> {
        let token = gen_token()?;
        let key = user.to_ascii_lowercase();
        self.tokens.write().insert(token.clone(), TokenEntry { user: key.clone(), expires_at: Instant::now() + self.ttl });
        self.by_user.write().entry(key).or_default().insert(token.clone());
        tprintln!("token.issue user={} ttl_secs={}", user, self.ttl.as_secs());
        Ok(token)
    }

    /// User name (lowercase) bound to a live token. Expired tokens are pruned on sight.
    pub fn validate(&self, token: &str) -> Option<String> {
        let now = Instant::now();
        let (user, expired) = {
            let m = self.tokens.read();
            match m.get(token) {
                Some(e) if e.expires_at > now => (Some(e.user.clone()), false),
                Some(_) => (None, true),
                None => (None, false),
            }
        };
        if expired { self.revoke(token); }
        user
    }

    pub fn revoke(&self, token: &str) -> bool {
        let Some(entry) = self.tokens.write().remove(token) else { return false };
        if let Some(set) = self.by_user.write().get_mut(&entry.user) { set.remove(token); }
        true
    }

    pub fn revoke_user(&self, user: &str) -> usize {
        let Some(tokens) = self.by_user.write().remove(&user.to_ascii_lowercase()) else { return 0 };
        let mut m = self.tokens.write();
        let count = tokens.iter().filter(|t| m.remove(*t).is_some()).count();
        tprintln!("token.revoke_user user={} count={}", user, count);
        count
    }

    pub fn clear(&self) {
        self.tokens.write().clear();
        self.by_user.write().clear();
    }

    pub fn len(&self) -> usize { self.tokens.read().len() }
    pub fn is_empty(&self) -> bool { self.tokens.read().is_empty() }
}
