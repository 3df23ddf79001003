//! SSH front end
//!
//! Accepts SSH connections, runs password logins through the [`AuthGate`] and
//! hands every `sftp` subsystem channel to the request loop backed by a
//! [`DecoyFs`] bound to the logged-in identity. Shells and exec requests are
//! refused.

use russh::keys::PrivateKey;
use russh::server::{Auth, Handler, Msg, Server as SshServer, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, SshId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthGate;
use crate::connection_tracker::{ConnectionSlot, ConnectionTracker, ConnectionTrackerConfig};
use crate::decoy_fs::DecoyFs;
use crate::recorder::Recorder;
use crate::{sftp, Config, Error, Result};

/// Recorded for a peer whose address the transport did not report
const UNKNOWN_IP: &str = "unknown";

/// Honeypot SSH server
pub struct Server {
    config: Arc<Config>,
    recorder: Arc<Recorder>,
    ssh_config: russh::server::Config,
}

impl Server {
    /// Create a server
    ///
    /// Loads the host key from `config.host_key_path`, or generates a fresh
    /// Ed25519 key when no path is configured.
    ///
    /// # Errors
    ///
    /// `Error::Config` if the configuration is invalid or the host key cannot
    /// be loaded.
    pub fn new(config: Arc<Config>, recorder: Arc<Recorder>) -> Result<Self> {
        config.validate()?;

        let host_key = match &config.host_key_path {
            Some(path) => load_host_key(path)?,
            None => generate_host_key()?,
        };

        let inactivity_timeout = (config.inactivity_timeout_secs > 0)
            .then(|| Duration::from_secs(config.inactivity_timeout_secs));

        // Only passwords are offered, plus "none" when logins are open
        let mut methods = MethodSet::empty();
        if config.no_auth {
            methods.push(MethodKind::None);
        }
        methods.push(MethodKind::Password);

        // Rejections are answered at once; the login delay is the only stall
        let ssh_config = russh::server::Config {
            server_id: SshId::Standard(config.server_id.clone()),
            methods,
            inactivity_timeout,
            auth_rejection_time: Duration::ZERO,
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![host_key],
            ..Default::default()
        };

        Ok(Self {
            config,
            recorder,
            ssh_config,
        })
    }

    /// Accept connections until the listener fails
    ///
    /// # Errors
    ///
    /// `Error::Io` if the listen address cannot be bound, `Error::Connection`
    /// if the accept loop stops.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let socket = TcpListener::bind(&addr).await?;

        info!(
            event = "server_listening",
            address = %addr,
            server_id = %self.config.server_id,
            open_auth = self.config.no_auth,
            "SFTP honeypot listening"
        );

        let mut server = SftpServer::new(self.config.clone(), self.recorder.clone());
        server
            .run_on_socket(Arc::new(self.ssh_config), &socket)
            .await
            .map_err(|e| Error::Connection(format!("Server error: {}", e)))
    }
}

/// Connection factory
struct SftpServer {
    config: Arc<Config>,
    recorder: Arc<Recorder>,
    gate: Arc<AuthGate>,
    connection_tracker: ConnectionTracker,
}

impl SftpServer {
    fn new(config: Arc<Config>, recorder: Arc<Recorder>) -> Self {
        let connection_tracker = ConnectionTracker::new(ConnectionTrackerConfig {
            max_connections_per_ip: config.max_connections_per_ip,
        });

        Self {
            gate: Arc::new(AuthGate::new(config.clone(), recorder.clone())),
            config,
            recorder,
            connection_tracker,
        }
    }
}

impl SshServer for SftpServer {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        let peer_ip = peer_addr.map(|addr| addr.ip());
        let session_id = Uuid::new_v4();

        let admission = match peer_ip {
            Some(ip) => match self.connection_tracker.try_acquire(ip) {
                Some(slot) => Admission::Admitted(Some(slot)),
                None => Admission::Refused,
            },
            None => Admission::Admitted(None),
        };

        let open_connections = peer_ip.map(|ip| self.connection_tracker.connection_count(ip));
        info!(
            event = "connection_accepted",
            session_id = %session_id,
            client_ip = ?peer_ip,
            admitted = admission.is_admitted(),
            open_connections = ?open_connections,
            "New connection"
        );

        SessionHandler {
            config: self.config.clone(),
            recorder: self.recorder.clone(),
            gate: self.gate.clone(),
            ip: peer_ip.map_or_else(|| UNKNOWN_IP.to_string(), |ip| ip.to_string()),
            session_id,
            admission,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        debug!(error = %error, "SSH session ended with error");
    }
}

enum Admission {
    /// Holds the slot for tracked peers
    Admitted(Option<ConnectionSlot>),
    /// Over the per-IP cap; every login is refused
    Refused,
}

impl Admission {
    fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Per-connection SSH state
pub struct SessionHandler {
    config: Arc<Config>,
    recorder: Arc<Recorder>,
    gate: Arc<AuthGate>,
    ip: String,
    session_id: Uuid,
    admission: Admission,
    user: Option<String>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SessionHandler {
    fn accept(&mut self, user: &str) -> Auth {
        self.user = Some(user.to_string());
        Auth::Accept
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    fn start_sftp(&self, channel: Channel<Msg>, user: String) {
        let fs = DecoyFs::new(
            self.config.clone(),
            self.recorder.clone(),
            self.ip.clone(),
            user.clone(),
        );
        let session_id = self.session_id;
        let client_ip = self.ip.clone();

        tokio::spawn(async move {
            info!(
                event = "sftp_started",
                session_id = %session_id,
                client_ip = %client_ip,
                username = %user,
                "SFTP session started"
            );
            match sftp::serve(channel.into_stream(), fs).await {
                Ok(()) => {
                    info!(
                        event = "sftp_finished",
                        session_id = %session_id,
                        client_ip = %client_ip,
                        username = %user,
                        "SFTP session finished"
                    );
                }
                Err(e) => {
                    warn!(
                        event = "sftp_aborted",
                        session_id = %session_id,
                        client_ip = %client_ip,
                        username = %user,
                        error = %e,
                        "SFTP session aborted"
                    );
                }
            }
        });
    }
}

impl Handler for SessionHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        if !self.admission.is_admitted() {
            return Ok(Self::reject());
        }

        match self.gate.check_none(user) {
            Ok(()) => Ok(self.accept(user)),
            Err(_) => Ok(Self::reject()),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        if !self.admission.is_admitted() {
            // Still stalled and captured, never compared
            let _ = self.gate.refuse_password(&self.ip, user, password).await;
            return Ok(Self::reject());
        }

        match self.gate.check_password(&self.ip, user, password).await {
            Ok(()) => Ok(self.accept(user)),
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "Password rejected");
                Ok(Self::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!(
            session_id = %self.session_id,
            channel = %channel.id(),
            "Session channel opened"
        );
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name != "sftp" {
            warn!(
                session_id = %self.session_id,
                subsystem = name,
                "Unsupported subsystem"
            );
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let Some(user) = self.user.clone() else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        session.channel_success(channel_id)?;
        self.start_sftp(channel, user);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<()> {
        info!(
            event = "shell_refused",
            session_id = %self.session_id,
            client_ip = %self.ip,
            "Shell request refused"
        );
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        info!(
            event = "exec_refused",
            session_id = %self.session_id,
            client_ip = %self.ip,
            command = %String::from_utf8_lossy(data),
            "Exec request refused"
        );
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<()> {
        self.channels.remove(&channel_id);
        Ok(())
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        // The slot itself is released by its own Drop right after this
        if let Admission::Admitted(Some(slot)) = &self.admission {
            debug!(
                event = "connection_closed",
                session_id = %self.session_id,
                client_ip = %slot.ip(),
                "Releasing connection slot"
            );
        } else {
            debug!(
                event = "connection_closed",
                session_id = %self.session_id,
                client_ip = %self.ip,
                "Connection closed"
            );
        }
    }
}

fn load_host_key(path: &Path) -> Result<PrivateKey> {
    let key = russh::keys::load_secret_key(path, None).map_err(|e| {
        Error::Config(format!("Failed to load host key {}: {}", path.display(), e))
    })?;
    info!(path = %path.display(), "Loaded host key");
    Ok(key)
}

fn generate_host_key() -> Result<PrivateKey> {
    warn!("No host key configured, generating an ephemeral Ed25519 key");
    PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
        .map_err(|e| Error::Config(format!("Failed to generate host key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder::with_paths("activity.log", "users.json"))
    }

    #[test]
    fn test_server_generates_key_without_path() {
        let server = Server::new(Arc::new(Config::default()), recorder()).unwrap();
        assert_eq!(server.ssh_config.keys.len(), 1);
        assert_eq!(server.ssh_config.auth_rejection_time, Duration::ZERO);
        assert!(server.ssh_config.methods.contains(&MethodKind::Password));
        assert!(!server.ssh_config.methods.contains(&MethodKind::None));
    }

    #[test]
    fn test_missing_host_key_is_config_error() {
        let mut config = Config::default();
        config.host_key_path = Some("/nonexistent/flytrap/host_key".into());
        let result = Server::new(Arc::new(config), recorder());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_over_cap_peer_is_refused() {
        let mut config = Config::default();
        config.max_connections_per_ip = 1;
        let mut server = SftpServer::new(Arc::new(config), recorder());
        let peer: SocketAddr = "203.0.113.5:40000".parse().unwrap();

        let first = server.new_client(Some(peer));
        let second = server.new_client(Some(peer));
        assert!(first.admission.is_admitted());
        assert!(!second.admission.is_admitted());
        assert_eq!(first.ip, "203.0.113.5");

        drop(first);
        let third = server.new_client(Some(peer));
        assert!(third.admission.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connection_still_captures_attempts() {
        let mut config = Config::default();
        config.max_connections_per_ip = 1;
        config.login_delay = 2;
        config.credentials.insert("guest".to_string(), String::new());
        let recorder = recorder();
        let mut server = SftpServer::new(Arc::new(config), recorder.clone());
        let peer: SocketAddr = "203.0.113.9:40000".parse().unwrap();

        let _first = server.new_client(Some(peer));
        let mut second = server.new_client(Some(peer));

        let start = tokio::time::Instant::now();
        for password in ["123456", "toor", "root"] {
            let auth = second.auth_password("root", password).await.unwrap();
            assert!(matches!(auth, Auth::Reject { .. }));
        }
        assert!(start.elapsed() >= Duration::from_secs(6));

        // A credential that would open the door is still refused
        let auth = second.auth_password("guest", "anything").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
        assert!(second.user.is_none());

        let root = recorder.identity("203.0.113.9", "root").await.unwrap();
        assert_eq!(root.passwords, vec!["123456", "toor", "root"]);
        assert_eq!(recorder.identities().await.len(), 2);
    }

    #[tokio::test]
    async fn test_password_login_sets_user() {
        let mut config = Config::default();
        config.credentials.insert("guest".to_string(), String::new());
        let mut server = SftpServer::new(Arc::new(config), recorder());
        let mut handler = server.new_client(Some("198.51.100.2:5555".parse().unwrap()));

        let auth = handler.auth_password("guest", "pw").await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(handler.user.as_deref(), Some("guest"));
    }
}
