//! SSH test client for automated testing
//!
//! Connects to a fake server, sends input, captures output.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::client::{self, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::Disconnect;
use tokio::net::ToSocketAddrs;

/// How the client logs in
#[derive(Clone)]
pub enum Credentials {
    Password(String),
    Key(Arc<PrivateKey>),
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password(password.into())
    }

    pub fn key(key: PrivateKey) -> Self {
        Self::Key(Arc::new(key))
    }
}

/// SSH test client for sending commands and capturing output
pub struct SshTestClient {
    handle: Handle<ClientHandler>,
    channel: russh::Channel<client::Msg>,
}

impl SshTestClient {
    /// Log in, then open a session with an 80x24 pty and a shell
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: &str,
        credentials: &Credentials,
    ) -> Result<Self> {
        Self::connect_with_size(addr, username, credentials, 80, 24).await
    }

    /// Like [`connect`](Self::connect) with a chosen terminal size
    pub async fn connect_with_size(
        addr: impl ToSocketAddrs,
        username: &str,
        credentials: &Credentials,
        cols: u32,
        rows: u32,
    ) -> Result<Self> {
        let (handle, accepted) = authenticate(addr, username, credentials).await?;
        if !accepted {
            anyhow::bail!("authentication rejected");
        }
        Self::finish_connect(handle, cols, rows).await
    }

    /// Complete connection after successful auth
    async fn finish_connect(handle: Handle<ClientHandler>, cols: u32, rows: u32) -> Result<Self> {
        let channel = handle
            .channel_open_session()
            .await
            .context("failed to open session channel")?;

        channel
            .request_pty(false, "xterm-256color", cols, rows, 0, 0, &[])
            .await
            .context("failed to request PTY")?;

        channel
            .request_shell(false)
            .await
            .context("failed to request shell")?;

        Ok(Self { handle, channel })
    }

    /// Send a line to the shell (adds newline if not present)
    pub async fn send(&mut self, input: &str) -> Result<()> {
        let data = if input.ends_with('\n') {
            input.as_bytes().to_vec()
        } else {
            format!("{}\n", input).into_bytes()
        };
        self.send_raw(&data).await
    }

    /// Send bytes exactly as given
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .data(data)
            .await
            .context("failed to send data")?;
        Ok(())
    }

    /// Signal end of input on the session channel
    pub async fn eof(&mut self) -> Result<()> {
        self.channel.eof().await.context("failed to send eof")?;
        Ok(())
    }

    /// Tell the server the terminal was resized
    pub async fn window_change(&mut self, cols: u32, rows: u32) -> Result<()> {
        self.channel
            .window_change(cols, rows, 0, 0)
            .await
            .context("failed to send window change")?;
        Ok(())
    }

    /// Wait for output with timeout, then collect what we got
    pub async fn wait_and_collect(&mut self, duration: Duration) -> Result<Vec<u8>> {
        self.wait_internal(duration, None).await
    }

    /// Wait until pattern appears in output, or timeout
    ///
    /// Pattern is matched against the visible text (ANSI codes stripped).
    pub async fn wait_for_pattern(&mut self, pattern: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.wait_internal(timeout, Some(pattern)).await
    }

    /// Wait for the server to close the channel, returning what arrived first
    pub async fn wait_for_close(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        tokio::time::timeout(timeout, async {
            while let Some(msg) = self.channel.wait().await {
                match msg {
                    russh::ChannelMsg::Data { data } => output.extend_from_slice(&data),
                    russh::ChannelMsg::Close => break,
                    _ => {}
                }
            }
        })
        .await
        .context("timeout waiting for channel close")?;
        Ok(output)
    }

    async fn wait_internal(&mut self, duration: Duration, pattern: Option<&str>) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            if let Some(pat) = pattern {
                if strip_ansi(&output).contains(pat) {
                    return Ok(output);
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                if pattern.is_some() {
                    anyhow::bail!("timeout waiting for pattern");
                }
                break;
            }

            tokio::select! {
                msg = self.channel.wait() => {
                    match msg {
                        Some(russh::ChannelMsg::Data { data }) => {
                            output.extend_from_slice(&data);
                        }
                        Some(russh::ChannelMsg::Eof) | None => break,
                        Some(_) => {}
                    }
                }
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        if let Some(pat) = pattern {
            if !strip_ansi(&output).contains(pat) {
                anyhow::bail!("channel closed before pattern {pat:?}");
            }
        }
        Ok(output)
    }

    /// Close the connection
    pub async fn close(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "goodbye", "en")
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}

/// Connect and attempt to log in.
///
/// Returns the handle and whether the server accepted the credentials.
pub async fn authenticate(
    addr: impl ToSocketAddrs,
    username: &str,
    credentials: &Credentials,
) -> Result<(Handle<ClientHandler>, bool)> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, ClientHandler)
        .await
        .context("failed to connect")?;

    let result = match credentials {
        Credentials::Password(password) => handle
            .authenticate_password(username, password)
            .await
            .context("password authentication failed")?,
        Credentials::Key(key) => {
            // no hash alg needed for Ed25519
            let key_with_alg = PrivateKeyWithHashAlg::new(key.clone(), None);
            handle
                .authenticate_publickey(username, key_with_alg)
                .await
                .context("key authentication failed")?
        }
    };

    Ok((handle, result.success()))
}

/// Strip ANSI escape sequences from bytes, return as string
pub fn strip_ansi(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut result = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // skip until the terminating letter
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Client handler; the server is a local fake, so any host key is trusted
pub struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> impl std::future::Future<Output = Result<bool, Self::Error>> + Send {
        async { Ok(true) }
    }
}
