//! Telemetry record types
//!
//! Activity records are one-shot log lines; identity records accumulate every
//! password a given (ip, user) pair has tried.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Something a peer did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub ip: String,
    pub user: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(ip: impl Into<String>, user: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user: user.into(),
            action: action.into(),
            timestamp: Utc::now(),
        }
    }

    /// Activity log line, without the trailing newline
    pub fn to_line(&self) -> String {
        format!(
            "{} - IP:{} USER:{} ACTION:{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.ip,
            self.user,
            self.action
        )
    }

    /// Echo the record to the tracing output
    pub fn log(&self) {
        info!(
            event = "activity",
            client_ip = %self.ip,
            username = %self.user,
            action = %self.action,
            "Peer activity"
        );
    }
}

/// Every password seen from one (ip, user) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub ip: String,
    pub user: String,
    /// Insertion order, no duplicates
    pub passwords: Vec<String>,
    pub last_attempt: DateTime<Utc>,
}

impl IdentityRecord {
    fn new(ip: &str, user: &str, password: &str) -> Self {
        Self {
            ip: ip.to_string(),
            user: user.to_string(),
            passwords: vec![password.to_string()],
            last_attempt: Utc::now(),
        }
    }

    fn observe(&mut self, password: &str) {
        if !self.passwords.iter().any(|p| p == password) {
            self.passwords.push(password.to_string());
        }
        self.last_attempt = Utc::now();
    }
}

/// Append-only table of identity records keyed by (ip, user)
#[derive(Debug, Default)]
pub struct IdentityTable {
    records: Vec<IdentityRecord>,
    index: HashMap<(String, String), usize>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one login attempt
    ///
    /// # Returns
    ///
    /// `true` when this is the first attempt seen from the pair.
    pub fn observe(&mut self, ip: &str, user: &str, password: &str) -> bool {
        let key = (ip.to_string(), user.to_string());
        if let Some(&slot) = self.index.get(&key) {
            self.records[slot].observe(password);
            return false;
        }

        self.index.insert(key, self.records.len());
        self.records.push(IdentityRecord::new(ip, user, password));
        true
    }

    pub fn get(&self, ip: &str, user: &str) -> Option<&IdentityRecord> {
        self.index
            .get(&(ip.to_string(), user.to_string()))
            .map(|&slot| &self.records[slot])
    }

    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Pretty-printed JSON array of every record
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.records)
    }
}
