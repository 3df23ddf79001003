//! Authentication gate
//!
//! Decides a single password attempt: stall, record, compare. Whatever the
//! reason for a rejection, the peer only ever sees a generic failure; the
//! difference between "unknown user" and "wrong password" lives in the
//! recorder's output.

use std::sync::Arc;
use tracing::{info, warn};

use crate::recorder::Recorder;
use crate::{Config, Error, Result};

/// Per-attempt login policy
pub struct AuthGate {
    config: Arc<Config>,
    recorder: Arc<Recorder>,
}

impl AuthGate {
    /// Create a new gate
    ///
    /// # Arguments
    ///
    /// * `config` - Credential store and delays
    /// * `recorder` - Sink for attempts and rejections
    pub fn new(config: Arc<Config>, recorder: Arc<Recorder>) -> Self {
        Self { config, recorder }
    }

    /// Whether the server accepts every identity without checking
    pub fn is_open(&self) -> bool {
        self.config.no_auth
    }

    /// Accept an identity that offered no credentials
    ///
    /// # Errors
    ///
    /// `Error::Authentication` unless the server runs without authentication.
    pub fn check_none(&self, user: &str) -> Result<()> {
        if self.is_open() {
            info!(event = "auth_success", username = user, method = "none", "Open login accepted");
            Ok(())
        } else {
            Err(Error::Authentication(user.to_string()))
        }
    }

    /// Decide one password attempt
    ///
    /// The login delay is slept before anything else, and the attempt is
    /// recorded whatever the outcome.
    ///
    /// # Errors
    ///
    /// `Error::Authentication` carrying the username when the attempt is
    /// rejected.
    pub async fn check_password(&self, ip: &str, user: &str, password: &str) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        self.stall_and_record(ip, user, password).await;

        let Some(expected) = self.config.credentials.get(user) else {
            warn!(
                event = "auth_failure",
                client_ip = ip,
                username = user,
                reason = "unknown_user",
                "Login rejected"
            );
            return Err(Error::Authentication(user.to_string()));
        };

        if expected.is_empty() || expected == password {
            info!(
                event = "auth_success",
                client_ip = ip,
                username = user,
                method = "password",
                "Login accepted"
            );
            return Ok(());
        }

        warn!(
            event = "auth_failure",
            client_ip = ip,
            username = user,
            reason = "bad_password",
            "Login rejected"
        );
        self.recorder
            .record_activity(ip, user, format!("Login Rejected: {}", password))
            .await;
        Err(Error::Authentication(user.to_string()))
    }

    /// Refuse a password attempt from a peer over its connection cap
    ///
    /// The attempt is stalled and captured like any other, but never
    /// compared against the credential store.
    ///
    /// # Errors
    ///
    /// Always `Error::Authentication` carrying the username.
    pub async fn refuse_password(&self, ip: &str, user: &str, password: &str) -> Result<()> {
        if !self.is_open() {
            self.stall_and_record(ip, user, password).await;
        }

        warn!(
            event = "auth_failure",
            client_ip = ip,
            username = user,
            reason = "connection_cap",
            "Login refused"
        );
        Err(Error::Authentication(user.to_string()))
    }

    async fn stall_and_record(&self, ip: &str, user: &str, password: &str) {
        let delay = self.config.login_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.recorder.record_login(ip, user, password).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(no_auth: bool) -> (AuthGate, Arc<Recorder>) {
        let mut config = Config::default();
        config.no_auth = no_auth;
        config.credentials.insert("admin".to_string(), "s3cret".to_string());
        let recorder = Arc::new(Recorder::with_paths("activity.log", "users.json"));
        (AuthGate::new(Arc::new(config), recorder.clone()), recorder)
    }

    #[test]
    fn test_none_rejected_when_closed() {
        let (gate, _) = gate(false);
        assert!(matches!(gate.check_none("admin"), Err(Error::Authentication(_))));
    }

    #[test]
    fn test_none_accepted_when_open() {
        let (gate, _) = gate(true);
        assert!(gate.check_none("anyone").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_password_is_stalled_and_recorded() {
        let mut config = Config::default();
        config.login_delay = 3;
        config.credentials.insert("admin".to_string(), "s3cret".to_string());
        let recorder = Arc::new(Recorder::with_paths("activity.log", "users.json"));
        let gate = AuthGate::new(Arc::new(config), recorder.clone());

        let start = tokio::time::Instant::now();
        let result = gate.refuse_password("10.0.0.7", "admin", "s3cret").await;

        assert!(matches!(result, Err(Error::Authentication(_))));
        assert!(start.elapsed() >= std::time::Duration::from_secs(3));
        let identities = recorder.identities().await;
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].user, "admin");
        assert_eq!(identities[0].passwords, vec!["s3cret".to_string()]);
    }

    #[tokio::test]
    async fn test_open_mode_skips_recording() {
        let (gate, recorder) = gate(true);
        assert!(gate.check_password("10.0.0.1", "nobody", "x").await.is_ok());
        assert!(recorder.identities().await.is_empty());
        assert_eq!(recorder.pending_activity().await, 0);
    }
}
