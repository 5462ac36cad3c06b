//! Encrypted at-rest token storage.
//!
//! Tokens are sealed with ChaCha20-Poly1305 under a per-installation key
//! held in an owner-only file. A leaked token file alone reveals nothing,
//! and tampering fails authentication on open.
//!
//! Storage is two-tiered: a fast local cache ([`TokenVault`]) plus a
//! durable store keyed by owner id ([`DurableTokenStore`]) so a session
//! survives process and device restarts. Load order is cache first,
//! durable second, discarding anything already expired.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::Mutex;
use std::collections::HashMap;

use calsync_core::{SyncError, SyncResult};

use crate::token::Token;

const KEY_FILE: &str = "vault.key";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

fn owner_slug(owner_id: &str) -> String {
    owner_id.replace(['/', '\\', ':'], "_")
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> SyncResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> SyncResult<()> {
    Ok(())
}

/// Fast local tier: one sealed token file per owner.
pub struct TokenVault {
    dir: PathBuf,
    token_path: PathBuf,
}

impl TokenVault {
    pub fn new(dir: &Path, owner_id: &str) -> SyncResult<TokenVault> {
        std::fs::create_dir_all(dir)?;
        Ok(TokenVault {
            dir: dir.to_path_buf(),
            token_path: dir.join(format!("{}.token", owner_slug(owner_id))),
        })
    }

    fn key(&self) -> SyncResult<Key> {
        let key_path = self.dir.join(KEY_FILE);
        if key_path.exists() {
            let bytes = std::fs::read(&key_path)?;
            if bytes.len() != KEY_LEN {
                return Err(SyncError::Store(format!(
                    "corrupt vault key at {}",
                    key_path.display()
                )));
            }
            return Ok(*Key::from_slice(&bytes));
        }

        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        std::fs::write(&key_path, key.as_slice())?;
        // Owner-only, the file is key material.
        restrict_permissions(&key_path)?;
        Ok(key)
    }

    pub fn save(&self, token: &Token) -> SyncResult<()> {
        let key = self.key()?;
        let cipher = ChaCha20Poly1305::new(&key);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let plaintext =
            serde_json::to_vec(token).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| SyncError::Store("failed to seal token".into()))?;

        let mut contents = Vec::with_capacity(NONCE_LEN + sealed.len());
        contents.extend_from_slice(&nonce);
        contents.extend_from_slice(&sealed);

        let temp = self.token_path.with_extension("token.tmp");
        std::fs::write(&temp, &contents)?;
        std::fs::rename(&temp, &self.token_path)?;
        restrict_permissions(&self.token_path)?;
        Ok(())
    }

    /// Open the sealed token. Tampered or truncated files fail
    /// authentication and surface as an error rather than silently
    /// yielding garbage.
    pub fn load(&self) -> SyncResult<Option<Token>> {
        if !self.token_path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read(&self.token_path)?;
        if contents.len() < NONCE_LEN {
            return Err(SyncError::Store("truncated token file".into()));
        }

        let key = self.key()?;
        let cipher = ChaCha20Poly1305::new(&key);
        let nonce = Nonce::from_slice(&contents[..NONCE_LEN]);
        let plaintext = cipher
            .decrypt(nonce, &contents[NONCE_LEN..])
            .map_err(|_| SyncError::Store("token file failed authentication".into()))?;

        let token = serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(Some(token))
    }

    pub fn clear(&self) -> SyncResult<()> {
        if self.token_path.exists() {
            std::fs::remove_file(&self.token_path)?;
        }
        Ok(())
    }
}

/// Durable tier, keyed by owner id. Backed remotely in a full deployment;
/// the file implementation below covers single-machine installs.
#[async_trait]
pub trait DurableTokenStore: Send + Sync {
    async fn load(&self, owner_id: &str) -> SyncResult<Option<Token>>;
    async fn save(&self, owner_id: &str, token: &Token) -> SyncResult<()>;
    async fn delete(&self, owner_id: &str) -> SyncResult<()>;
}

/// File-backed durable store. Reuses the vault sealing so tokens are
/// never written in the clear.
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: &Path) -> SyncResult<FileTokenStore> {
        std::fs::create_dir_all(dir)?;
        Ok(FileTokenStore {
            dir: dir.to_path_buf(),
        })
    }
}

#[async_trait]
impl DurableTokenStore for FileTokenStore {
    async fn load(&self, owner_id: &str) -> SyncResult<Option<Token>> {
        TokenVault::new(&self.dir, owner_id)?.load()
    }

    async fn save(&self, owner_id: &str, token: &Token) -> SyncResult<()> {
        TokenVault::new(&self.dir, owner_id)?.save(token)
    }

    async fn delete(&self, owner_id: &str) -> SyncResult<()> {
        TokenVault::new(&self.dir, owner_id)?.clear()
    }
}

/// In-memory durable store for tests.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> MemoryTokenStore {
        MemoryTokenStore::default()
    }

    pub fn insert(&self, token: Token) {
        self.tokens.lock().insert(token.owner_id.clone(), token);
    }
}

#[async_trait]
impl DurableTokenStore for MemoryTokenStore {
    async fn load(&self, owner_id: &str) -> SyncResult<Option<Token>> {
        Ok(self.tokens.lock().get(owner_id).cloned())
    }

    async fn save(&self, owner_id: &str, token: &Token) -> SyncResult<()> {
        self.tokens
            .lock()
            .insert(owner_id.to_string(), token.clone());
        Ok(())
    }

    async fn delete(&self, owner_id: &str) -> SyncResult<()> {
        self.tokens.lock().remove(owner_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_token() -> Token {
        Token {
            access_token: "ya29.sample".to_string(),
            refresh_token: Some("1//refresh".to_string()),
            expires_at: Utc.timestamp_opt(1_700_003_600, 0).unwrap(),
            scope: "https://www.googleapis.com/auth/calendar".to_string(),
            owner_id: "user-1".to_string(),
        }
    }

    #[test]
    fn test_seal_and_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = TokenVault::new(dir.path(), "user-1").unwrap();

        vault.save(&sample_token()).unwrap();
        let loaded = vault.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "ya29.sample");
        assert_eq!(loaded.refresh_token.as_deref(), Some("1//refresh"));
    }

    #[test]
    fn test_token_unreadable_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let vault = TokenVault::new(dir.path(), "user-1").unwrap();
        vault.save(&sample_token()).unwrap();

        let raw = std::fs::read(dir.path().join("user-1.token")).unwrap();
        let as_text = String::from_utf8_lossy(&raw);
        assert!(!as_text.contains("ya29.sample"));
        assert!(!as_text.contains("refresh"));
    }

    #[test]
    fn test_tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let vault = TokenVault::new(dir.path(), "user-1").unwrap();
        vault.save(&sample_token()).unwrap();

        let path = dir.path().join("user-1.token");
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        assert!(vault.load().is_err());
    }

    #[test]
    fn test_clear_removes_token() {
        let dir = tempfile::tempdir().unwrap();
        let vault = TokenVault::new(dir.path(), "user-1").unwrap();
        vault.save(&sample_token()).unwrap();
        vault.clear().unwrap();
        assert!(vault.load().unwrap().is_none());
    }
}
