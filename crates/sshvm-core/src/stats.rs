//! Connection statistics, persisted as pretty-printed JSON under the data
//! directory and surfaced in the welcome banner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const STATS_FILE: &str = "user_stats.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStat {
    pub username: String,
    pub connect_count: u64,
    pub last_connected: DateTime<Utc>,
}

pub struct UserStats {
    path: PathBuf,
    users: Mutex<HashMap<String, UserStat>>,
}

impl UserStats {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(STATS_FILE),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted stats. A missing file is an empty history.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let list: Vec<UserStat> = serde_json::from_str(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;

        let mut users = self.users.lock().expect("stats lock poisoned");
        *users = list
            .into_iter()
            .map(|stat| (stat.username.clone(), stat))
            .collect();
        Ok(())
    }

    /// Persist stats, most recently connected first.
    pub fn save(&self) -> Result<()> {
        let mut list: Vec<UserStat> = self
            .users
            .lock()
            .expect("stats lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));

        let data = serde_json::to_string_pretty(&list).context("serialize user stats")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&self.path, data).with_context(|| format!("write {}", self.path.display()))?;
        info!(path = %self.path.display(), users = list.len(), "user stats saved");
        Ok(())
    }

    /// Record a connection. Returns the previous `last_connected` timestamp,
    /// `None` on a user's first visit, so the banner can show the prior
    /// login rather than the one just recorded.
    pub fn record_connection(&self, username: &str) -> Option<DateTime<Utc>> {
        let mut users = self.users.lock().expect("stats lock poisoned");
        match users.get_mut(username) {
            Some(stat) => {
                let previous = stat.last_connected;
                stat.connect_count += 1;
                stat.last_connected = Utc::now();
                Some(previous)
            }
            None => {
                users.insert(
                    username.to_string(),
                    UserStat {
                        username: username.to_string(),
                        connect_count: 1,
                        last_connected: Utc::now(),
                    },
                );
                None
            }
        }
    }

    pub fn get(&self, username: &str) -> Option<UserStat> {
        self.users
            .lock()
            .expect("stats lock poisoned")
            .get(username)
            .cloned()
    }

    /// Most recent users, excluding `exclude`, newest first.
    pub fn recent_users(&self, exclude: &str, limit: usize) -> Vec<UserStat> {
        let mut list: Vec<UserStat> = self
            .users
            .lock()
            .expect("stats lock poisoned")
            .values()
            .filter(|stat| stat.username != exclude)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
        if limit > 0 {
            list.truncate(limit);
        }
        list
    }
}
