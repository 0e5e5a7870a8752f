//! SSH connection handler

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use tracing::{debug, info, warn};

use crate::ssh::session::{ChannelRequest, ChannelSession, ChannelSink, HandleSink, RequestOutcome};
use crate::state::SharedState;

/// Per-connection SSH handler
pub struct SshHandler {
    state: Arc<SharedState>,
    peer: Option<SocketAddr>,
    sessions: HashMap<ChannelId, ChannelSession<HandleSink>>,
}

impl SshHandler {
    pub fn new(state: Arc<SharedState>, peer: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer,
            sessions: HashMap::new(),
        }
    }

    fn key_allowed(&self, key: &PublicKey) -> bool {
        self.state.config.allow_key_auth && key.key_data() == self.state.authorized_key.key_data()
    }

    /// Apply a request to the channel's session and send the reply it calls for
    fn dispatch(
        &self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) {
        let outcome = match self.sessions.get(&channel) {
            Some(sess) => sess.apply(&request),
            None => {
                warn!(?channel, kind = request.kind(), "request for channel without a shell");
                RequestOutcome::Failure
            }
        };

        let reply = match outcome {
            RequestOutcome::Success => session.channel_success(channel),
            RequestOutcome::Failure => session.channel_failure(channel),
            RequestOutcome::NoReply => return,
        };
        if let Err(e) = reply {
            debug!(?channel, error = %e, "could not send request reply");
        }
    }

    /// Forget the session and close it off the event loop
    fn end_session(&mut self, channel: ChannelId, reason: &'static str) {
        if let Some(sess) = self.sessions.remove(&channel) {
            sess.close_detached(reason);
        }
    }
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let config = &self.state.config;

        // Plain comparison: this is a test double, not an authenticator
        if config.allow_password_auth && user == config.username && password == config.password {
            info!(user, peer = ?self.peer, "password accepted");
            Ok(Auth::Accept)
        } else {
            warn!(user, peer = ?self.peer, "password rejected");
            Ok(reject())
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.key_allowed(key) {
            debug!(user, "key offered");
            Ok(Auth::Accept)
        } else {
            warn!(user, peer = ?self.peer, "unknown key");
            Ok(reject())
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.key_allowed(key) {
            info!(user, peer = ?self.peer, "key accepted");
            Ok(Auth::Accept)
        } else {
            warn!(user, peer = ?self.peer, "key rejected");
            Ok(reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let sink = HandleSink::new(session.handle(), id);

        match ChannelSession::start(sink.clone(), &self.state.config, self.state.recorder.clone()) {
            Ok(sess) => {
                info!(channel = ?id, session = %sess.id(), "session channel opened");
                self.sessions.insert(id, sess);
            }
            Err(e) => {
                warn!(channel = ?id, error = %e, "could not start pty");
                // confirmation goes out when this callback returns; close after it
                tokio::spawn(async move { sink.close().await });
            }
        }
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // russh answers with SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
        warn!(channel = ?channel.id(), host_to_connect, port_to_connect, "refusing direct-tcpip channel");
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(channel = ?channel.id(), "refusing x11 channel");
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::PtyReq {
            term: term.to_string(),
            width: col_width,
            height: row_height,
        };
        self.dispatch(channel, request, session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange {
            width: col_width,
            height: row_height,
        };
        self.dispatch(channel, request, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Shell {
            command: Vec::new(),
        };
        self.dispatch(channel, request, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // An explicit command is a shell request with a payload
        let request = ChannelRequest::Shell {
            command: data.to_vec(),
        };
        self.dispatch(channel, request, session);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let overflowed = match self.sessions.get(&channel) {
            Some(sess) => !sess.input(data),
            None => false,
        };
        if overflowed {
            warn!(?channel, peer = ?self.peer, "client input backlog too large, closing session");
            self.end_session(channel, "input overflow");
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, "client eof");
        // the input task drains what is queued, then closes the session
        if let Some(sess) = self.sessions.get_mut(&channel) {
            sess.end_input();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(?channel, "client closed channel");
        self.end_session(channel, "client close");
        Ok(())
    }
}
