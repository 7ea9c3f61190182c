//! In-memory Vault behind the real `VaultProvider`

use async_trait::async_trait;
use latchkey::secrets::backends::vault::{
    KvVersion, VaultConnector, VaultCredentials, VaultKv, VaultLogin, VaultSession,
};
use latchkey::secrets::VendorError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct VaultState {
    pub logins: AtomicUsize,
    pub reads: AtomicUsize,
    /// Fail every login with 403
    pub reject_logins: AtomicBool,
    /// Fail the next read with 403, as if the token had been revoked
    pub revoke_next_read: AtomicBool,
    pub login_delay: Mutex<Duration>,
    /// url of every login, in order
    pub login_urls: Mutex<Vec<String>>,
    secrets: Mutex<HashMap<(String, String), Value>>,
}

impl VaultState {
    pub fn put(&self, mount: &str, path: &str, data: Value) {
        self.secrets.lock().unwrap().insert((mount.to_string(), path.to_string()), data);
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

pub struct MockVaultConnector {
    pub state: Arc<VaultState>,
}

impl MockVaultConnector {
    pub fn new() -> (Arc<Self>, Arc<VaultState>) {
        let state = Arc::new(VaultState::default());
        (Arc::new(Self { state: Arc::clone(&state) }), state)
    }
}

#[async_trait]
impl VaultConnector for MockVaultConnector {
    async fn login(&self, login: &VaultLogin) -> Result<VaultSession, VendorError> {
        self.state.logins.fetch_add(1, Ordering::SeqCst);
        self.state.login_urls.lock().unwrap().push(login.url.clone());

        let delay = *self.state.login_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.state.reject_logins.load(Ordering::SeqCst) {
            return Err(VendorError::http(403, "permission denied"));
        }
        if let VaultCredentials::Token(token) = &login.credentials {
            if token.expose_secret() != "s.root" {
                return Err(VendorError::http(403, "invalid token"));
            }
        }

        Ok(VaultSession {
            kv: Arc::new(MockKv { state: Arc::clone(&self.state) }),
            lease: None,
        })
    }
}

struct MockKv {
    state: Arc<VaultState>,
}

#[async_trait]
impl VaultKv for MockKv {
    async fn read(&self, mount: &str, path: &str, _version: KvVersion) -> Result<Value, VendorError> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        if self.state.revoke_next_read.swap(false, Ordering::SeqCst) {
            return Err(VendorError::http(403, "permission denied"));
        }
        self.state
            .secrets
            .lock()
            .unwrap()
            .get(&(mount.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| VendorError::http(404, ""))
    }
}
