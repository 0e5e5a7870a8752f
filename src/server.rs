//! Fake SSH server lifecycle
//!
//! [`SshTestServer`] owns the listener. `start` binds and spawns the accept
//! loop, `close` cancels it and waits until the socket is released.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::Server as _;
use russh::{Disconnect, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::ssh::SshServer;
use crate::state::{Recorder, ServerState, SharedState};

/// Random ports are drawn from this range
pub const RANDOM_PORTS: std::ops::Range<u16> = 1024..10000;

const BIND_ATTEMPTS: usize = 16;

enum Lifecycle {
    Idle,
    Running {
        addr: SocketAddr,
        token: CancellationToken,
        task: JoinHandle<()>,
    },
    Closed,
}

/// In-process fake SSH server
pub struct SshTestServer {
    config: Arc<ServerConfig>,
    rng: std::sync::Mutex<StdRng>,
    recorder: Arc<Recorder>,
    state: Arc<ServerState>,
    lifecycle: Mutex<Lifecycle>,
}

impl SshTestServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            rng: std::sync::Mutex::new(StdRng::from_entropy()),
            recorder: Arc::new(Recorder::new()),
            state: Arc::new(ServerState::default()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener and start accepting connections
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { addr, .. } => return Err(Error::AlreadyStarted(*addr)),
            Lifecycle::Closed => return Err(Error::AlreadyClosed),
        }

        self.config.validate()?;

        let host_key = host_key(&self.config)?;
        let authorized_key = authorized_key(&self.config, &host_key)?;

        let russh_config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            methods: auth_methods(&self.config),
            auth_rejection_time: Duration::ZERO,
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let listener = self.bind().await?;
        let addr = listener.local_addr()?;

        let server = SshServer::new(Arc::new(SharedState {
            config: self.config.clone(),
            authorized_key,
            recorder: self.recorder.clone(),
        }));

        let token = CancellationToken::new();
        self.state.set_connected(true);
        let task = tokio::spawn(
            accept_loop(
                listener,
                russh_config,
                server,
                self.state.clone(),
                token.clone(),
            )
            .instrument(tracing::info_span!("sshfake", %addr)),
        );

        info!(%addr, "fake ssh server listening");
        *lifecycle = Lifecycle::Running { addr, token, task };
        Ok(addr)
    }

    /// Stop accepting, drop live connections and release the socket
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                Err(Error::NotStarted)
            }
            Lifecycle::Closed => Err(Error::AlreadyClosed),
            Lifecycle::Running { addr, token, task } => {
                token.cancel();
                if let Err(e) = task.await {
                    error!(%addr, error = %e, "accept loop panicked");
                }
                info!(%addr, "fake ssh server closed");
                Ok(())
            }
        }
    }

    /// Whether the accept loop is running
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    pub async fn port(&self) -> Option<u16> {
        self.local_addr().await.map(|a| a.port())
    }

    /// Times `command_match` fired across all sessions
    pub fn match_count(&self, command_match: &str) -> usize {
        self.recorder.match_count(command_match)
    }

    /// Session channels that got a shell
    pub fn sessions_opened(&self) -> usize {
        self.recorder.sessions_opened()
    }

    async fn bind(&self) -> Result<TcpListener> {
        let host = self.config.host.as_str();

        if let Some(port) = self.config.port {
            let addr = format!("{host}:{port}");
            return TcpListener::bind(&addr)
                .await
                .map_err(|source| Error::Bind { addr, source });
        }

        let mut last = None;
        for _ in 0..BIND_ATTEMPTS {
            let port = self.random_port();
            let addr = format!("{host}:{port}");
            match TcpListener::bind(&addr).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!(port, "port in use, retrying");
                    last = Some((addr, e));
                }
                Err(source) => return Err(Error::Bind { addr, source }),
            }
        }

        let (addr, source) = last.unwrap_or_else(|| {
            (
                host.to_string(),
                io::Error::new(io::ErrorKind::AddrInUse, "no free port"),
            )
        });
        Err(Error::Bind { addr, source })
    }

    fn random_port(&self) -> u16 {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.gen_range(RANDOM_PORTS)
    }
}

impl Drop for SshTestServer {
    fn drop(&mut self) {
        if let Lifecycle::Running { token, .. } = self.lifecycle.get_mut() {
            token.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    mut server: SshServer,
    state: Arc<ServerState>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        };

        let handler = server.new_client(Some(peer));
        let config = config.clone();
        let token = token.child_token();

        tokio::spawn(
            async move {
                let session = match russh::server::run_stream(config, stream, handler).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(error = %e, "handshake failed");
                        return;
                    }
                };

                let handle = session.handle();
                tokio::select! {
                    result = session => {
                        if let Err(e) = result {
                            debug!(error = %e, "connection ended with error");
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("server closing, disconnecting client");
                        let _ = handle
                            .disconnect(Disconnect::ByApplication, "server closing".into(), "en".into())
                            .await;
                    }
                }
                debug!("connection closed");
            }
            .instrument(tracing::info_span!("conn", %peer)),
        );
    }

    state.set_connected(false);
    info!("accept loop stopped");
}

fn auth_methods(config: &ServerConfig) -> MethodSet {
    let mut methods = Vec::new();
    if config.allow_key_auth {
        methods.push(MethodKind::PublicKey);
    }
    if config.allow_password_auth {
        methods.push(MethodKind::Password);
    }
    MethodSet::from(&methods[..])
}

fn host_key(config: &ServerConfig) -> Result<PrivateKey> {
    match &config.private_key {
        Some(pem) => {
            russh::keys::decode_secret_key(pem, None).map_err(|e| Error::HostKey(e.to_string()))
        }
        None => {
            debug!("generating ed25519 host key");
            PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
                .map_err(|e| Error::HostKey(e.to_string()))
        }
    }
}

fn authorized_key(config: &ServerConfig, host_key: &PrivateKey) -> Result<PublicKey> {
    match &config.public_key {
        Some(text) => {
            PublicKey::from_openssh(text.trim()).map_err(|e| Error::PublicKey(e.to_string()))
        }
        None => Ok(host_key.public_key().clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_methods() {
        let config = ServerConfig::default();
        let methods = auth_methods(&config);
        assert!(methods.contains(&MethodKind::PublicKey));
        assert!(!methods.contains(&MethodKind::Password));

        let config = ServerConfig {
            allow_password_auth: true,
            ..Default::default()
        };
        let methods = auth_methods(&config);
        assert!(methods.contains(&MethodKind::PublicKey));
        assert!(methods.contains(&MethodKind::Password));
    }

    #[test]
    fn test_authorized_key_defaults_to_host_key() {
        let config = ServerConfig::default();
        let key = host_key(&config).unwrap();
        let authorized = authorized_key(&config, &key).unwrap();
        assert_eq!(authorized.key_data(), key.public_key().key_data());
    }

    #[test]
    fn test_configured_keys_parse() {
        let key = PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
            .unwrap();
        let other = PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
            .unwrap();
        let config = ServerConfig {
            private_key: Some(
                key.to_openssh(russh::keys::ssh_key::LineEnding::LF)
                    .unwrap()
                    .to_string(),
            ),
            public_key: Some(other.public_key().to_openssh().unwrap()),
            ..Default::default()
        };

        let host = host_key(&config).unwrap();
        assert_eq!(host.public_key().key_data(), key.public_key().key_data());
        let authorized = authorized_key(&config, &host).unwrap();
        assert_eq!(authorized.key_data(), other.public_key().key_data());
    }

    #[test]
    fn test_bad_keys_rejected() {
        let config = ServerConfig {
            private_key: Some("not a key".to_string()),
            ..Default::default()
        };
        assert!(matches!(host_key(&config), Err(Error::HostKey(_))));

        let config = ServerConfig {
            public_key: Some("ssh-ed25519 garbage".to_string()),
            ..Default::default()
        };
        let key = host_key(&ServerConfig::default()).unwrap();
        assert!(matches!(
            authorized_key(&config, &key),
            Err(Error::PublicKey(_))
        ));
    }

    #[test]
    fn test_random_port_in_range() {
        let server = SshTestServer::new(ServerConfig::default());
        for _ in 0..100 {
            assert!(RANDOM_PORTS.contains(&server.random_port()));
        }
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let server = SshTestServer::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: Some(0),
            ..Default::default()
        });
        assert!(matches!(server.close().await, Err(Error::NotStarted)));
        assert!(!server.is_connected());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_connected());
        assert_eq!(server.port().await, Some(addr.port()));
        assert!(matches!(server.start().await, Err(Error::AlreadyStarted(a)) if a == addr));

        server.close().await.unwrap();
        assert!(!server.is_connected());
        assert!(server.local_addr().await.is_none());
        assert!(matches!(server.close().await, Err(Error::AlreadyClosed)));
        assert!(matches!(server.start().await, Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_start() {
        let server = SshTestServer::new(ServerConfig {
            allow_key_auth: false,
            ..Default::default()
        });
        assert!(matches!(server.start().await, Err(Error::InvalidConfig(_))));
        assert!(!server.is_connected());
    }
}
