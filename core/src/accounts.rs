//! Test-account keystore and the node's account manager.
//!
//! Keys here are derived deterministically from fixed seeds. They exist so a
//! freshly started node has known accounts to exercise, not to protect
//! anything.

use crate::error::{NodeError, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const KEYSTORE_VERSION: u8 = 1;

/// A well-known account written into the keystore on request
#[derive(Debug, Clone, Copy)]
pub struct TestAccount {
    pub seed: &'static str,
    pub password: &'static str,
}

pub const TEST_ACCOUNTS: &[TestAccount] = &[
    TestAccount {
        seed: "wnode-status/test-account/1",
        password: "test-password-1",
    },
    TestAccount {
        seed: "wnode-status/test-account/2",
        password: "test-password-2",
    },
];

impl TestAccount {
    fn secret(&self) -> [u8; 32] {
        Sha256::digest(self.seed.as_bytes()).into()
    }

    /// Account address (base58 of the key hash, like node ids elsewhere)
    pub fn address(&self) -> String {
        derive_address(&self.secret())
    }
}

fn derive_address(secret: &[u8]) -> String {
    let hash = Sha256::digest(secret);
    bs58::encode(&hash[..20]).into_string()
}

fn password_digest(address: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(password.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Serialize, Deserialize)]
struct KeystoreFileV1 {
    version: u8,
    address: String,
    key_b64: String,
    password_sha256: String,
}

fn keystore_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("keystore")
}

pub fn keystore_path(data_dir: &Path, address: &str) -> PathBuf {
    keystore_dir(data_dir).join(format!("{}.json", address))
}

/// Write the test accounts into `<data_dir>/keystore`, overwriting old copies
pub fn load_test_accounts(data_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(keystore_dir(data_dir))?;

    let mut written = Vec::with_capacity(TEST_ACCOUNTS.len());
    for account in TEST_ACCOUNTS {
        let secret = account.secret();
        let address = derive_address(&secret);
        let file = KeystoreFileV1 {
            version: KEYSTORE_VERSION,
            key_b64: general_purpose::STANDARD.encode(secret),
            password_sha256: password_digest(&address, account.password),
            address: address.clone(),
        };

        let path = keystore_path(data_dir, &address);
        fs::write(&path, serde_json::to_vec_pretty(&file)?)?;
        debug!("Wrote keystore file {}", path.display());
        written.push(path);
    }

    info!("Loaded {} test accounts into {}", written.len(), data_dir.display());
    Ok(written)
}

/// Unlock every test account on `accounts` and select the first one
pub async fn inject_test_accounts(accounts: &AccountManager, data_dir: &Path) -> Result<Vec<String>> {
    let mut addresses = Vec::with_capacity(TEST_ACCOUNTS.len());
    for account in TEST_ACCOUNTS {
        let path = keystore_path(data_dir, &account.address());
        let address = accounts.unlock(&path, account.password).await?;
        addresses.push(address);
    }

    if let Some(first) = addresses.first() {
        accounts.select(first).await?;
    }

    info!("Injected {} test accounts", addresses.len());
    Ok(addresses)
}

#[derive(Default)]
struct AccountState {
    /// address -> secret key
    unlocked: HashMap<String, Vec<u8>>,
    selected: Option<String>,
}

/// Accounts unlocked on a running node
#[derive(Clone, Default)]
pub struct AccountManager {
    state: Arc<RwLock<AccountState>>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a keystore file, check the password and keep the key unlocked
    pub async fn unlock(&self, keystore: &Path, password: &str) -> Result<String> {
        let raw = tokio::fs::read_to_string(keystore).await.map_err(|e| {
            NodeError::Account(format!("Cannot read keystore {}: {}", keystore.display(), e))
        })?;
        let parsed: KeystoreFileV1 = serde_json::from_str(&raw)?;
        if parsed.version != KEYSTORE_VERSION {
            return Err(NodeError::Account(format!(
                "Unsupported keystore version: {}",
                parsed.version
            )));
        }

        if password_digest(&parsed.address, password) != parsed.password_sha256 {
            return Err(NodeError::Account(format!(
                "Wrong password for {}",
                parsed.address
            )));
        }

        let secret = general_purpose::STANDARD
            .decode(&parsed.key_b64)
            .map_err(|e| NodeError::Account(format!("Invalid key encoding: {}", e)))?;
        if derive_address(&secret) != parsed.address {
            return Err(NodeError::Account(format!(
                "Key does not match address {}",
                parsed.address
            )));
        }

        let mut state = self.state.write().await;
        state.unlocked.insert(parsed.address.clone(), secret);
        debug!("Unlocked account {}", parsed.address);
        Ok(parsed.address)
    }

    /// Make an unlocked account the active one
    pub async fn select(&self, address: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.unlocked.contains_key(address) {
            return Err(NodeError::Account(format!("Account {} is not unlocked", address)));
        }
        state.selected = Some(address.to_string());
        Ok(())
    }

    pub async fn selected(&self) -> Option<String> {
        self.state.read().await.selected.clone()
    }

    pub async fn unlocked(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.state.read().await.unlocked.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}
