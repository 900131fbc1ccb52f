//! Registered credentials, address <-> login sessions and sign-in throttling.
//!
//! Every public operation takes the single table lock once and performs its
//! whole check-then-act sequence under it.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::{AuthError, StorageError};
use crate::logger::AuditLogger;
use crate::protocol_core::Credential;
use crate::sandbox::Storage;

/// Source of "now" for ban bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    pub attempt_limit: u32,
    pub ban_window: Duration,
    pub reset_attempts_on_success: bool,
    /// Count attempts and bans per host instead of per `ip:port`.
    pub throttle_by_ip: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for AuthPolicy {
    fn from(config: &ServerConfig) -> Self {
        Self {
            attempt_limit: config.sign_in_attempt_limit,
            ban_window: config.ban_window(),
            reset_attempts_on_success: config.reset_attempts_on_success,
            throttle_by_ip: config.throttle_by_ip,
        }
    }
}

struct StoredPassword {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl StoredPassword {
    fn new(password: &str) -> Self {
        let salt = *uuid::Uuid::new_v4().as_bytes();
        Self {
            digest: digest(&salt, password),
            salt,
        }
    }

    fn matches(&self, password: &str) -> bool {
        digest(&self.salt, password) == self.digest
    }
}

fn digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

#[derive(Default)]
struct Tables {
    credentials: HashMap<String, StoredPassword>,
    login_by_addr: HashMap<SocketAddr, String>,
    addr_by_login: HashMap<String, SocketAddr>,
    attempts: HashMap<SocketAddr, u32>,
    bans: HashMap<SocketAddr, Instant>,
}

impl Tables {
    fn start_session(&mut self, peer: SocketAddr, login: &str) -> Result<(), AuthError> {
        if self.addr_by_login.contains_key(login) {
            return Err(AuthError::LoginHasSession);
        }
        if self.login_by_addr.contains_key(&peer) {
            return Err(AuthError::AddressHasSession);
        }
        self.login_by_addr.insert(peer, login.to_string());
        self.addr_by_login.insert(login.to_string(), peer);
        Ok(())
    }

    fn end_session(&mut self, peer: SocketAddr) -> Option<String> {
        let login = self.login_by_addr.remove(&peer)?;
        self.addr_by_login.remove(&login);
        Some(login)
    }

    /// Lazily expires a ban; true while the window is still running.
    fn is_banned(&mut self, key: SocketAddr, now: Instant, window: Duration) -> bool {
        match self.bans.get(&key) {
            None => false,
            Some(started) if now.saturating_duration_since(*started) < window => true,
            Some(_) => {
                self.bans.remove(&key);
                false
            }
        }
    }
}

/// Process-wide authentication and session table.
pub struct SessionStore {
    tables: Mutex<Tables>,
    storage: Arc<Storage>,
    policy: AuthPolicy,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditLogger>,
}

impl SessionStore {
    pub fn new(storage: Arc<Storage>, policy: AuthPolicy, audit: Arc<dyn AuditLogger>) -> Self {
        Self::with_clock(storage, policy, audit, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<Storage>,
        policy: AuthPolicy,
        audit: Arc<dyn AuditLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            storage,
            policy,
            clock,
            audit,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Registers the credential, creates its sandbox and opens a session.
    ///
    /// Returns the working directory display string. A failed sandbox
    /// creation removes the credential again before the lock is released.
    pub fn sign_up(&self, peer: SocketAddr, credential: &Credential) -> Result<String, AuthError> {
        let mut tables = self.tables.lock();
        if tables.login_by_addr.contains_key(&peer) {
            return Err(AuthError::AddressHasSession);
        }
        if tables.credentials.contains_key(&credential.login) {
            return Err(AuthError::LoginTaken);
        }
        tables
            .credentials
            .insert(credential.login.clone(), StoredPassword::new(&credential.password));

        if let Err(e) = self.storage.create_sandbox(&credential.login) {
            tables.credentials.remove(&credential.login);
            warn!(
                login = %credential.login,
                error = %e,
                "sandbox creation failed, sign-up rolled back"
            );
            self.audit.user_removed(&credential.login);
            return Err(AuthError::SandboxUnavailable);
        }
        info!(login = %credential.login, "user created");
        self.audit.user_created(&credential.login);

        self.open_session(&mut tables, peer, &credential.login)
    }

    /// Checks the ban window and attempt counter, then the credential.
    pub fn sign_in(&self, peer: SocketAddr, credential: &Credential) -> Result<String, AuthError> {
        let key = self.throttle_key(peer);
        let now = self.clock.now();
        let mut tables = self.tables.lock();

        if tables.is_banned(key, now, self.policy.ban_window) {
            return Err(AuthError::Banned);
        }
        let attempts = {
            let counter = tables.attempts.entry(key).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempts > self.policy.attempt_limit {
            tables.attempts.remove(&key);
            tables.bans.insert(key, now);
            warn!(address = %key, attempts, "address banned");
            self.audit.banned(key);
            return Err(AuthError::NowBanned {
                minutes: self.policy.ban_window.as_secs().div_ceil(60),
            });
        }

        if tables.login_by_addr.contains_key(&peer) {
            return Err(AuthError::AddressHasSession);
        }
        match tables.credentials.get(&credential.login) {
            None => return Err(AuthError::UnknownLogin),
            Some(stored) if !stored.matches(&credential.password) => {
                return Err(AuthError::WrongPassword)
            }
            Some(_) => {}
        }

        let shown = self.open_session(&mut tables, peer, &credential.login)?;
        if self.policy.reset_attempts_on_success {
            tables.attempts.remove(&key);
        }
        Ok(shown)
    }

    /// Releases whatever session `peer` holds. No-op without one.
    pub fn sign_out(&self, peer: SocketAddr) -> Option<String> {
        let login = self.tables.lock().end_session(peer)?;
        info!(peer = %peer, login = %login, "session ended");
        self.audit.session_ended(peer, &login);
        Some(login)
    }

    pub fn login_of(&self, peer: SocketAddr) -> Option<String> {
        self.tables.lock().login_by_addr.get(&peer).cloned()
    }

    pub fn require_login(&self, peer: SocketAddr) -> Result<String, StorageError> {
        self.login_of(peer).ok_or(StorageError::NoSession)
    }

    pub fn active_sessions(&self) -> Vec<(SocketAddr, String)> {
        let tables = self.tables.lock();
        let mut out: Vec<_> = tables
            .login_by_addr
            .iter()
            .map(|(addr, login)| (*addr, login.clone()))
            .collect();
        out.sort();
        out
    }

    pub fn is_registered(&self, login: &str) -> bool {
        self.tables.lock().credentials.contains_key(login)
    }

    /// Attempts and bans follow the session address unless per-host
    /// throttling is on, where every port of a host shares one entry.
    fn throttle_key(&self, peer: SocketAddr) -> SocketAddr {
        if self.policy.throttle_by_ip {
            SocketAddr::new(peer.ip(), 0)
        } else {
            peer
        }
    }

    fn open_session(
        &self,
        tables: &mut Tables,
        peer: SocketAddr,
        login: &str,
    ) -> Result<String, AuthError> {
        tables.start_session(peer, login)?;
        info!(peer = %peer, login = %login, "session started");
        self.audit.session_started(peer, login);
        Ok(self
            .storage
            .working_dir_display(login)
            .unwrap_or_else(|| "/".to_string()))
    }
}
