//! Instance registry for tracking loader processes
//!
//! Each process registers once at startup and then refreshes its heartbeat
//! periodically. Nothing ever pushes a failure notification: liveness is
//! recomputed from the stored heartbeat whenever someone needs it, so a late
//! sweep only delays reclaiming work.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{InstanceId, LoaderInstance, Registration};

/// Maximum stored hostname length
pub const HOSTNAME_MAX_LEN: usize = 64;

/// Whether an instance with the given last heartbeat is live at `now`
///
/// An instance is live iff `now - last_heartbeat < timeout`.
pub fn is_live(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    now.signed_duration_since(last_heartbeat) < timeout
}

/// Generate a fresh instance key (36-character hyphenated UUID)
pub fn new_instance_key() -> String {
    Uuid::new_v4().to_string()
}

/// Host identity of the running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub hostname: String,
    pub pid: u32,
}

impl InstanceIdentity {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        let mut hostname: String = hostname.into();
        if hostname.len() > HOSTNAME_MAX_LEN {
            let mut end = HOSTNAME_MAX_LEN;
            while !hostname.is_char_boundary(end) {
                end -= 1;
            }
            hostname.truncate(end);
        }
        Self { hostname, pid }
    }

    /// Identity of the current process
    pub fn current() -> Self {
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| String::from("localhost"));

        Self::new(hostname, std::process::id())
    }
}

/// Durable registry of loader instances
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Insert a new instance row with the current time as its first heartbeat
    async fn register(&self, hostname: &str, pid: u32) -> Result<Registration>;

    /// Set the instance's last heartbeat to `now`
    ///
    /// Fails with `UnknownInstance` if no such row exists.
    async fn heartbeat(&self, instance: InstanceId, now: DateTime<Utc>) -> Result<()>;

    async fn get_instance(&self, instance: InstanceId) -> Result<Option<LoaderInstance>>;

    /// All instances ever registered, oldest first
    async fn list_instances(&self) -> Result<Vec<LoaderInstance>>;

    /// Whether the instance is live at `now`; unknown instances are not live
    async fn is_live(
        &self,
        instance: InstanceId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool> {
        Ok(self
            .get_instance(instance)
            .await?
            .is_some_and(|info| is_live(info.last_heartbeat, now, timeout)))
    }
}
