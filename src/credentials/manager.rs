//! Encrypted credentials manager with environment override and audit trail.

use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::audit::{AccessAction, AccessLogEntry, AuditRetention};
use super::cipher::{load_or_create_key, Encryptor, PlaintextEncryptor, SealedBoxEncryptor};
use super::store::{Credential, CredentialStore};
use crate::config::CredentialsConfig;
use crate::error::{GatehouseError, Result};

/// What `get` returns when a stored value cannot be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptFailurePolicy {
    /// Hand back the stored text unchanged, as if it had never been encrypted
    #[default]
    ReturnRaw,
    /// Treat the credential as missing and return the caller's default
    Reject,
}

impl fmt::Display for DecryptFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReturnRaw => write!(f, "return_raw"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Environment variable consulted before the store for `key`.
///
/// `db.password` and `db-password` both map to `DB_PASSWORD`.
pub fn env_var_name(key: &str) -> String {
    key.to_uppercase().replace(['.', '-'], "_")
}

/// The environment value for `key`, if its variable is set.
///
/// A value that is not valid UTF-8 still counts as set and is converted lossily.
fn env_override(key: &str) -> Option<String> {
    let env_name = env_var_name(key);
    let raw = std::env::var_os(&env_name)?;
    let value = match raw.into_string() {
        Ok(value) => value,
        Err(raw) => {
            warn!(
                key = %key,
                env = %env_name,
                "Environment credential is not valid UTF-8; converting lossily"
            );
            raw.to_string_lossy().into_owned()
        }
    };
    debug!(key = %key, env = %env_name, "Credential resolved from environment");
    Some(value)
}

/// Durable, encrypted-at-rest storage for named secrets.
///
/// Failures are logged and reported as `false` or the caller's default rather
/// than returned as errors, so a broken store never takes down the caller.
/// Construct one instance at startup and share it by reference.
pub struct CredentialsManager {
    store: CredentialStore,
    encryptor: Box<dyn Encryptor>,
    decrypt_failure: DecryptFailurePolicy,
    retention: AuditRetention,
}

impl CredentialsManager {
    /// Open the store and key file named in `config`.
    ///
    /// If the key cannot be loaded or created, this fails when
    /// `require_encryption` is set and otherwise falls back to storing
    /// plaintext, logging a warning.
    pub fn open(config: &CredentialsConfig) -> Result<Self> {
        let store = CredentialStore::open(&config.db_path)?;

        let encryptor: Box<dyn Encryptor> = match load_or_create_key(&config.key_path) {
            Ok(key) => Box::new(SealedBoxEncryptor::new(&key)),
            Err(e) if config.require_encryption => {
                error!(key_path = %config.key_path.display(), error = %e, "Encryption key unavailable");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    key_path = %config.key_path.display(),
                    error = %e,
                    "Encryption key unavailable; credentials will be stored in PLAINTEXT"
                );
                Box::new(PlaintextEncryptor)
            }
        };

        let manager = Self::new(store, encryptor)
            .with_decrypt_failure(config.decrypt_failure)
            .with_retention(AuditRetention::from_max_entries(config.max_audit_entries));

        info!(
            db_path = %config.db_path.display(),
            encrypted = manager.encryption_enabled(),
            decrypt_failure = %manager.decrypt_failure,
            "Credentials manager initialized"
        );
        Ok(manager)
    }

    /// Build a manager from parts.
    pub fn new(store: CredentialStore, encryptor: Box<dyn Encryptor>) -> Self {
        if !encryptor.is_secure() {
            warn!("Credentials manager running without encryption");
        }
        Self {
            store,
            encryptor,
            decrypt_failure: DecryptFailurePolicy::default(),
            retention: AuditRetention::default(),
        }
    }

    pub fn with_decrypt_failure(mut self, policy: DecryptFailurePolicy) -> Self {
        self.decrypt_failure = policy;
        self
    }

    pub fn with_retention(mut self, retention: AuditRetention) -> Self {
        self.retention = retention;
        self
    }

    /// Whether values stored with `encrypt = true` are actually encrypted.
    pub fn encryption_enabled(&self) -> bool {
        self.encryptor.is_secure()
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// Returns `false` if encryption or storage failed.
    pub fn store(&self, key: &str, value: &str, encrypt: bool) -> bool {
        let encrypted = encrypt && self.encryptor.is_secure();
        let stored = if encrypted {
            match self.encryptor.encrypt(value) {
                Ok(token) => token,
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to encrypt credential");
                    return false;
                }
            }
        } else {
            value.to_string()
        };

        match self.store.upsert(key, &stored, encrypted, Utc::now()) {
            Ok(()) => {
                info!(key = %key, encrypted, "Credential stored");
                self.apply_retention();
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to store credential");
                false
            }
        }
    }

    /// Look up `key`, preferring the environment over the store.
    ///
    /// Returns `default` when the key is in neither place or the store fails.
    pub fn get(&self, key: &str, default: Option<&str>) -> Option<String> {
        if let Some(value) = env_override(key) {
            return Some(value);
        }

        let row = match self.store.fetch(key) {
            Ok(Some(row)) => row,
            Ok(None) => return default.map(str::to_string),
            Err(e) => {
                error!(key = %key, error = %e, "Failed to read credential");
                return default.map(str::to_string);
            }
        };

        if let Err(e) = self.store.log_access(key, AccessAction::Read, Utc::now()) {
            warn!(key = %key, error = %e, "Failed to record credential read");
        } else {
            self.apply_retention();
        }

        if !row.encrypted {
            return Some(row.value);
        }
        self.reveal(&row).or_else(|| default.map(str::to_string))
    }

    /// Remove `key`. Succeeds whether or not it existed.
    pub fn delete(&self, key: &str) -> bool {
        match self.store.remove(key, Utc::now()) {
            Ok(existed) => {
                info!(key = %key, existed, "Credential deleted");
                self.apply_retention();
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to delete credential");
                false
            }
        }
    }

    /// Keys held in the store. Environment-only secrets are not included.
    pub fn list_keys(&self) -> BTreeSet<String> {
        self.store.keys().unwrap_or_else(|e| {
            error!(error = %e, "Failed to list credentials");
            BTreeSet::new()
        })
    }

    /// Whether `key` resolves from the store or the environment.
    pub fn exists(&self, key: &str) -> bool {
        if env_override(key).is_some() {
            return true;
        }
        self.store.contains(key).unwrap_or_else(|e| {
            error!(key = %key, error = %e, "Failed to check credential");
            false
        })
    }

    /// Stored metadata for `key`, without decrypting or auditing.
    pub fn credential(&self, key: &str) -> Option<Credential> {
        self.store.fetch(key).unwrap_or_else(|e| {
            error!(key = %key, error = %e, "Failed to read credential metadata");
            None
        })
    }

    /// Access log entries, newest first, optionally for one key.
    pub fn get_access_log(&self, key: Option<&str>, limit: usize) -> Vec<AccessLogEntry> {
        self.store.access_log(key, limit).unwrap_or_else(|e| {
            error!(error = %e, "Failed to read credential access log");
            Vec::new()
        })
    }

    /// Keep only the newest `keep` access log entries. Returns how many were removed.
    pub fn prune_access_log(&self, keep: usize) -> usize {
        match self.store.prune_access_log(keep) {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, keep, "Pruned credential access log");
                }
                removed
            }
            Err(e) => {
                error!(error = %e, "Failed to prune credential access log");
                0
            }
        }
    }

    fn apply_retention(&self) {
        if let AuditRetention::MaxEntries(max) = self.retention {
            if let Err(e) = self.store.prune_access_log(max) {
                warn!(error = %e, "Failed to apply audit retention");
            }
        }
    }

    fn reveal(&self, row: &Credential) -> Option<String> {
        let result = if self.encryptor.is_secure() {
            self.encryptor.decrypt(&row.value)
        } else {
            Err(GatehouseError::Crypto("no encryption key loaded".to_string()))
        };

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    key = %row.key,
                    error = %e,
                    policy = %self.decrypt_failure,
                    "Failed to decrypt credential"
                );
                match self.decrypt_failure {
                    DecryptFailurePolicy::ReturnRaw => Some(row.value.clone()),
                    DecryptFailurePolicy::Reject => None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::cipher::KEY_LEN;
    use std::path::PathBuf;

    fn config(dir: &tempfile::TempDir) -> CredentialsConfig {
        CredentialsConfig {
            db_path: dir.path().join("data").join("credentials.db"),
            key_path: dir.path().join("keys").join("secret.key"),
            ..Default::default()
        }
    }

    fn manager() -> (CredentialsManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = CredentialsManager::open(&config(&dir)).unwrap();
        (manager, dir)
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("db.password"), "DB_PASSWORD");
        assert_eq!(env_var_name("openai-api.key"), "OPENAI_API_KEY");
        assert_eq!(env_var_name("PLAIN"), "PLAIN");
    }

    #[test]
    fn test_round_trip_encrypted_and_plain() {
        let (manager, _dir) = manager();
        assert!(manager.encryption_enabled());

        assert!(manager.store("gh-test.secret", "s3cr3t", true));
        assert!(manager.store("gh-test.public", "visible", false));

        assert_eq!(manager.get("gh-test.secret", None).as_deref(), Some("s3cr3t"));
        assert_eq!(manager.get("gh-test.public", None).as_deref(), Some("visible"));

        let secret = manager.credential("gh-test.secret").unwrap();
        assert!(secret.encrypted);
        assert_ne!(secret.value, "s3cr3t");
        let public = manager.credential("gh-test.public").unwrap();
        assert!(!public.encrypted);
        assert_eq!(public.value, "visible");
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let manager = CredentialsManager::open(&config(&dir)).unwrap();
            assert!(manager.store("gh-test.persisted", "kept", true));
        }
        let manager = CredentialsManager::open(&config(&dir)).unwrap();
        assert_eq!(manager.get("gh-test.persisted", None).as_deref(), Some("kept"));
    }

    #[test]
    fn test_missing_key_returns_default() {
        let (manager, _dir) = manager();
        assert_eq!(manager.get("gh-test.absent", None), None);
        assert_eq!(
            manager.get("gh-test.absent", Some("fallback")).as_deref(),
            Some("fallback")
        );
        assert!(manager.get_access_log(Some("gh-test.absent"), 10).is_empty());
    }

    #[test]
    fn test_environment_takes_precedence() {
        let (manager, _dir) = manager();
        assert!(manager.store("gh-test.env-precedence", "from-store", true));

        std::env::set_var("GH_TEST_ENV_PRECEDENCE", "from-env");
        assert_eq!(
            manager.get("gh-test.env-precedence", None).as_deref(),
            Some("from-env")
        );
        std::env::remove_var("GH_TEST_ENV_PRECEDENCE");

        assert_eq!(
            manager.get("gh-test.env-precedence", None).as_deref(),
            Some("from-store")
        );
    }

    #[test]
    fn test_exists_and_list_keys() {
        let (manager, _dir) = manager();
        manager.store("gh-test.listed", "v", true);

        std::env::set_var("GH_TEST_ENV_LISTED", "v");
        assert!(manager.exists("gh-test.env-listed"));
        assert!(manager.exists("gh-test.listed"));
        assert!(!manager.exists("gh-test.nowhere"));

        let keys = manager.list_keys();
        assert!(keys.contains("gh-test.listed"));
        assert!(!keys.contains("gh-test.env-listed"));
        std::env::remove_var("GH_TEST_ENV_LISTED");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_environment_value_still_takes_precedence() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let (manager, _dir) = manager();
        assert!(manager.store("gh-test.latin1", "from-store", true));

        std::env::set_var("GH_TEST_LATIN1", OsStr::from_bytes(b"caf\xe9"));
        assert!(manager.exists("gh-test.latin1"));
        assert_eq!(
            manager.get("gh-test.latin1", None).as_deref(),
            Some("caf\u{FFFD}")
        );
        std::env::remove_var("GH_TEST_LATIN1");

        assert_eq!(
            manager.get("gh-test.latin1", None).as_deref(),
            Some("from-store")
        );
    }

    #[test]
    fn test_audit_trail_is_complete_and_ordered() {
        let (manager, _dir) = manager();
        manager.store("gh-test.audited", "v1", true);
        manager.get("gh-test.audited", None);
        manager.store("gh-test.audited", "v2", true);
        manager.delete("gh-test.audited");
        manager.get("gh-test.audited", None);

        let actions: Vec<AccessAction> = manager
            .get_access_log(Some("gh-test.audited"), 100)
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AccessAction::Delete,
                AccessAction::Store,
                AccessAction::Read,
                AccessAction::Store,
            ]
        );
        assert_eq!(manager.get_access_log(None, 2).len(), 2);
    }

    #[test]
    fn test_delete_absent_key_still_logged() {
        let (manager, _dir) = manager();
        assert!(manager.delete("gh-test.never-stored"));

        let log = manager.get_access_log(Some("gh-test.never-stored"), 10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, AccessAction::Delete);
        assert!(manager.list_keys().is_empty());
    }

    #[test]
    fn test_decrypt_failure_policies() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("credentials.db");

        let writer = CredentialsManager::new(
            CredentialStore::open(&db_path).unwrap(),
            Box::new(SealedBoxEncryptor::new(&[3u8; KEY_LEN])),
        );
        assert!(writer.store("gh-test.foreign", "original", true));
        let ciphertext = writer.credential("gh-test.foreign").unwrap().value;

        let raw = CredentialsManager::new(
            CredentialStore::open(&db_path).unwrap(),
            Box::new(SealedBoxEncryptor::new(&[4u8; KEY_LEN])),
        );
        assert_eq!(raw.get("gh-test.foreign", None), Some(ciphertext));

        let strict = CredentialsManager::new(
            CredentialStore::open(&db_path).unwrap(),
            Box::new(SealedBoxEncryptor::new(&[4u8; KEY_LEN])),
        )
        .with_decrypt_failure(DecryptFailurePolicy::Reject);
        assert_eq!(strict.get("gh-test.foreign", None), None);
        assert_eq!(
            strict.get("gh-test.foreign", Some("default")).as_deref(),
            Some("default")
        );
    }

    #[test]
    fn test_plaintext_fallback_when_key_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("secret.key");
        std::fs::write(&key_path, b"corrupt").unwrap();

        let mut config = config(&dir);
        config.key_path = key_path.clone();

        let manager = CredentialsManager::open(&config).unwrap();
        assert!(!manager.encryption_enabled());
        assert!(manager.store("gh-test.fallback", "plain", true));
        let row = manager.credential("gh-test.fallback").unwrap();
        assert!(!row.encrypted);
        assert_eq!(row.value, "plain");
        assert_eq!(manager.get("gh-test.fallback", None).as_deref(), Some("plain"));

        config.require_encryption = true;
        assert!(CredentialsManager::open(&config).is_err());
    }

    #[test]
    fn test_retention_trims_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.max_audit_entries = Some(3);
        let manager = CredentialsManager::open(&config).unwrap();

        for i in 0..5 {
            manager.store("gh-test.retained", &format!("v{}", i), true);
        }
        manager.get("gh-test.retained", None);

        let log = manager.get_access_log(None, 100);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].action, AccessAction::Read);

        assert_eq!(manager.prune_access_log(1), 2);
    }

    #[test]
    fn test_store_failure_reported_as_false() {
        let dir = tempfile::tempdir().unwrap();
        let db_path: PathBuf = dir.path().join("credentials.db");
        let manager = CredentialsManager::new(
            CredentialStore::open(&db_path).unwrap(),
            Box::new(PlaintextEncryptor),
        );

        // Replace the database with a directory so every connection fails.
        std::fs::remove_file(&db_path).unwrap();
        std::fs::create_dir(&db_path).unwrap();

        assert!(!manager.store("gh-test.broken", "v", false));
        assert!(!manager.delete("gh-test.broken"));
        assert_eq!(manager.get("gh-test.broken", Some("d")).as_deref(), Some("d"));
        assert!(manager.list_keys().is_empty());
        assert!(manager.get_access_log(None, 10).is_empty());
    }
}
