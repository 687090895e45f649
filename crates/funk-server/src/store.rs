//! Persistent store behind the auth oracle.
//!
//! The relay only depends on the [`Store`] trait; [`JsonStore`] is the
//! shipping implementation (a users file plus append-only JSON-line logs).
//! All operations are synchronous and must be called off the relay loop.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use funk_protocol::types::{all_channels, ChannelId};

/// Store-side user id (independent of the 1-byte wire user id).
pub type StoreUserId = u32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store data error: {0}")]
    Data(#[from] serde_json::Error),

    #[error("store worker failed")]
    Worker,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAction {
    Connect,
    Disconnect,
}

/// A verified identity as the relay sees it.
#[derive(Debug, Clone)]
pub struct VerifiedUser {
    pub id: StoreUserId,
    pub username: String,
    pub allowed_channels: HashSet<ChannelId>,
}

/// The operations the relay consumes; each is atomic.
pub trait Store: Send + Sync {
    /// Resolve a funk key to an identity. Inactive users resolve to `None`.
    fn verify(&self, funk_key: &str) -> Result<Option<VerifiedUser>, StoreError>;

    fn log_connection(
        &self,
        user_id: StoreUserId,
        channel: ChannelId,
        action: ConnectionAction,
        ip: IpAddr,
    ) -> Result<(), StoreError>;

    fn touch_last_seen(&self, user_id: StoreUserId) -> Result<(), StoreError>;

    fn record_traffic(&self, bytes_in: u64, bytes_out: u64) -> Result<(), StoreError>;
}

/// Short credential fingerprint for log lines; funk keys are never logged
/// in full.
pub fn fingerprint(funk_key: &str) -> String {
    let digest = Sha256::digest(funk_key.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// On-disk user record.
#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    id: StoreUserId,
    username: String,
    funk_key: String,
    allowed_channels: Vec<ChannelId>,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    last_seen: Option<u64>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ConnectionLogLine {
    user_id: StoreUserId,
    channel_id: ChannelId,
    action: ConnectionAction,
    ip: IpAddr,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct TrafficLine {
    bytes_in: u64,
    bytes_out: u64,
    timestamp: u64,
}

struct StoredUser {
    id: StoreUserId,
    username: String,
    funk_key: Zeroizing<String>,
    allowed_channels: HashSet<ChannelId>,
    active: bool,
    last_seen: Option<u64>,
}

/// File-backed store: users in a JSON array, connection and traffic logs
/// appended as JSON lines next to it.
pub struct JsonStore {
    users_path: PathBuf,
    log_path: PathBuf,
    traffic_path: PathBuf,
    users: Mutex<Vec<StoredUser>>,
}

impl JsonStore {
    /// Open (or bootstrap) the store. A missing users file is created with
    /// a single admin user holding a freshly generated funk key.
    pub fn open(
        users_path: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        traffic_path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let users_path = users_path.into();

        let records: Vec<UserRecord> = if users_path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&users_path)?)?
        } else {
            let admin = bootstrap_admin();
            write_users_atomic(&users_path, std::slice::from_ref(&admin))?;
            vec![admin]
        };

        let users = records
            .into_iter()
            .map(|r| StoredUser {
                id: r.id,
                username: r.username,
                funk_key: Zeroizing::new(r.funk_key),
                allowed_channels: r.allowed_channels.into_iter().collect(),
                active: r.active,
                last_seen: r.last_seen,
            })
            .collect();

        Ok(Self {
            users_path,
            log_path: log_path.into(),
            traffic_path: traffic_path.into(),
            users: Mutex::new(users),
        })
    }

    fn persist_users(&self, users: &[StoredUser]) -> Result<(), StoreError> {
        let records: Vec<UserRecord> = users
            .iter()
            .map(|u| UserRecord {
                id: u.id,
                username: u.username.clone(),
                funk_key: u.funk_key.as_str().to_owned(),
                allowed_channels: {
                    let mut channels: Vec<ChannelId> =
                        u.allowed_channels.iter().copied().collect();
                    channels.sort_unstable();
                    channels
                },
                active: u.active,
                last_seen: u.last_seen,
            })
            .collect();
        write_users_atomic(&self.users_path, &records)
    }
}

fn bootstrap_admin() -> UserRecord {
    let key: String = format!("{:032x}", rand::thread_rng().gen::<u128>());
    info!("created admin user with funk key {} — store it now", key);
    UserRecord {
        id: 1,
        username: "admin".into(),
        funk_key: key,
        allowed_channels: all_channels(),
        active: true,
        last_seen: None,
    }
}

fn write_users_atomic(path: &Path, records: &[UserRecord]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

impl Store for JsonStore {
    fn verify(&self, funk_key: &str) -> Result<Option<VerifiedUser>, StoreError> {
        let users = self.users.lock();
        for user in users.iter() {
            let matches: bool = user
                .funk_key
                .as_bytes()
                .ct_eq(funk_key.as_bytes())
                .into();
            if matches {
                if !user.active {
                    warn!(user = %user.username, "inactive user attempted auth");
                    return Ok(None);
                }
                return Ok(Some(VerifiedUser {
                    id: user.id,
                    username: user.username.clone(),
                    allowed_channels: user.allowed_channels.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn log_connection(
        &self,
        user_id: StoreUserId,
        channel: ChannelId,
        action: ConnectionAction,
        ip: IpAddr,
    ) -> Result<(), StoreError> {
        let line = serde_json::to_string(&ConnectionLogLine {
            user_id,
            channel_id: channel,
            action,
            ip,
            timestamp: unix_now(),
        })?;
        append_line(&self.log_path, &line)
    }

    fn touch_last_seen(&self, user_id: StoreUserId) -> Result<(), StoreError> {
        let mut users = self.users.lock();
        if let Some(user) = users.iter_mut().find(|u| u.id == user_id) {
            user.last_seen = Some(unix_now());
        }
        self.persist_users(&users)
    }

    fn record_traffic(&self, bytes_in: u64, bytes_out: u64) -> Result<(), StoreError> {
        let line = serde_json::to_string(&TrafficLine {
            bytes_in,
            bytes_out,
            timestamp: unix_now(),
        })?;
        append_line(&self.traffic_path, &line)
    }
}
