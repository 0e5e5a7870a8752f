//! SSH server module
//!
//! russh drives the protocol; this module supplies the per-connection
//! handler and the per-channel session engine.

mod handler;
pub mod intercept;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use russh::server;
use tracing::info;

use crate::state::SharedState;

pub use handler::SshHandler;
pub use intercept::CommandInterceptor;
pub use session::{
    ChannelRequest, ChannelSession, ChannelSink, CloseLatch, HandleSink, RequestOutcome,
};

/// Builds one handler per accepted connection
#[derive(Clone)]
pub struct SshServer {
    pub state: Arc<SharedState>,
}

impl SshServer {
    pub fn new(state: Arc<SharedState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(?peer_addr, "new connection");
        SshHandler::new(self.state.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        tracing::error!("session error: {:?}", error);
    }
}
