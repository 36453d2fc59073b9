//! Encrypted credential storage.
//!
//! Secrets are encrypted under one process-wide key kept in a restricted key
//! file, persisted in SQLite, and every store, read and delete is appended to
//! an access log.

mod audit;
mod cipher;
mod manager;
mod store;

pub use audit::{AccessAction, AccessLogEntry, AuditRetention};
pub use cipher::{load_or_create_key, Encryptor, PlaintextEncryptor, SealedBoxEncryptor, KEY_LEN};
pub use manager::{env_var_name, CredentialsManager, DecryptFailurePolicy};
pub use store::{Credential, CredentialStore};
