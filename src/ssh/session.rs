//! Channel session: one session channel bound to one shell on a pty
//!
//! Two tasks run per session:
//! - input: client bytes arrive over an mpsc channel, are written to the pty
//!   and fed to the [`CommandInterceptor`], which may answer with a canned
//!   response;
//! - output: pty bytes are forwarded to the client, or drained when canned
//!   responses replace real output.
//!
//! Client EOF ends the input queue, so bytes already queued still reach the
//! shell. Whichever task stops first runs the close sequence through the
//! [`CloseLatch`]; the other one is cancelled.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::{InterceptMode, ServerConfig};
use crate::error::Result;
use crate::pty::{PtyProcess, DEFAULT_COLS, DEFAULT_ROWS};
use crate::ssh::intercept::CommandInterceptor;
use crate::state::Recorder;

/// Buffer size for pty reads.
const IO_BUFFER_SIZE: usize = 8192;

/// A channel request the session understands
///
/// russh decodes the wire payloads; the handler maps its callbacks onto these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Start a shell; a non-empty command means an explicit program was asked for
    Shell { command: Vec<u8> },
    PtyReq { term: String, width: u32, height: u32 },
    WindowChange { width: u32, height: u32 },
    Other(String),
}

impl ChannelRequest {
    pub fn kind(&self) -> &str {
        match self {
            Self::Shell { .. } => "shell",
            Self::PtyReq { .. } => "pty-req",
            Self::WindowChange { .. } => "window-change",
            Self::Other(kind) => kind,
        }
    }
}

/// The client end of a session channel
pub trait ChannelSink: Clone + Send + Sync + 'static {
    /// Send bytes to the client. Fails once the channel is gone.
    fn data(&self, data: &[u8]) -> impl Future<Output = std::result::Result<(), ()>> + Send;

    /// Send EOF and close the channel
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// [`ChannelSink`] over a russh session handle
#[derive(Clone)]
pub struct HandleSink {
    handle: Handle,
    channel: ChannelId,
}

impl HandleSink {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

impl ChannelSink for HandleSink {
    fn data(&self, data: &[u8]) -> impl Future<Output = std::result::Result<(), ()>> + Send {
        let data = CryptoVec::from_slice(data);
        async move { self.handle.data(self.channel, data).await.map_err(|_| ()) }
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = self.handle.eof(self.channel).await;
            let _ = self.handle.close(self.channel).await;
        }
    }
}

/// Exactly-once close guard shared by a session's tasks
#[derive(Debug, Default)]
pub struct CloseLatch {
    fired: AtomicBool,
    token: CancellationToken,
}

impl CloseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the one caller that gets to run the close sequence.
    /// Every call cancels the session's tasks.
    pub fn fire(&self) -> bool {
        let won = !self.fired.swap(true, Ordering::AcqRel);
        self.token.cancel();
        won
    }

    pub fn is_closed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// How the session answers a channel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Failure,
    NoReply,
}

/// A live session channel
pub struct ChannelSession<S: ChannelSink> {
    id: Uuid,
    sink: S,
    pty: Arc<PtyProcess>,
    /// `None` once the client sent EOF
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    latch: Arc<CloseLatch>,
}

impl<S: ChannelSink> ChannelSession<S> {
    /// Spawn the shell and start the I/O tasks.
    ///
    /// On error nothing is running and the caller must close the channel.
    pub fn start(sink: S, config: &ServerConfig, recorder: Arc<Recorder>) -> Result<Self> {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("session", id = %id);
        let _enter = span.enter();

        info!(shell = %config.shell, "creating pty");
        let pty = Arc::new(PtyProcess::spawn(
            &config.shell,
            &config.shell_args,
            DEFAULT_COLS,
            DEFAULT_ROWS,
        )?);
        recorder.session_opened();

        let interceptor = CommandInterceptor::new(config.rules());
        let forward_output =
            !interceptor.is_active() || config.intercept_mode == InterceptMode::Augment;

        let (input_tx, input_rx) = mpsc::channel(config.input_queue_depth);
        let latch = Arc::new(CloseLatch::new());

        tokio::spawn(
            pump_input(
                input_rx,
                interceptor,
                recorder,
                sink.clone(),
                pty.clone(),
                latch.clone(),
            )
            .in_current_span(),
        );
        tokio::spawn(
            pump_output(sink.clone(), pty.clone(), forward_output, latch.clone())
                .in_current_span(),
        );

        Ok(Self {
            id,
            sink,
            pty,
            input_tx: Some(input_tx),
            latch,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pty(&self) -> &PtyProcess {
        &self.pty
    }

    pub fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }

    /// Queue client bytes for the shell.
    ///
    /// Never waits. Returns false when the queue is full; the caller should
    /// close the session rather than buffer without bound.
    pub fn input(&self, data: &[u8]) -> bool {
        let Some(tx) = &self.input_tx else {
            trace!(session = %self.id, bytes = data.len(), "input after eof dropped");
            return true;
        };
        match tx.try_send(data.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.id, bytes = data.len(), "input queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(session = %self.id, bytes = data.len(), "input after close dropped");
                true
            }
        }
    }

    /// Client EOF: queued input still reaches the shell, then the session closes
    pub fn end_input(&mut self) {
        if self.input_tx.take().is_some() {
            debug!(session = %self.id, "client input ended");
        }
    }

    /// Apply a decoded channel request
    pub fn apply(&self, request: &ChannelRequest) -> RequestOutcome {
        match request {
            ChannelRequest::Shell { command } if command.is_empty() => RequestOutcome::Success,
            ChannelRequest::Shell { command } => {
                warn!(
                    session = %self.id,
                    command = %String::from_utf8_lossy(command),
                    "only the default shell is supported"
                );
                RequestOutcome::Failure
            }
            ChannelRequest::PtyReq {
                term,
                width,
                height,
            } => {
                debug!(session = %self.id, term = %term, width, height, "pty requested");
                self.resize(*width, *height);
                RequestOutcome::Success
            }
            ChannelRequest::WindowChange { width, height } => {
                self.resize(*width, *height);
                RequestOutcome::NoReply
            }
            ChannelRequest::Other(kind) => {
                debug!(session = %self.id, kind = %kind, "ignoring channel request");
                RequestOutcome::NoReply
            }
        }
    }

    /// Close the channel and reap the shell, unless already closing
    pub async fn close(&self, reason: &str) {
        close_once(&self.latch, &self.sink, &self.pty, reason)
            .instrument(tracing::info_span!("session", id = %self.id))
            .await;
    }

    /// Run the close sequence on its own task.
    ///
    /// Handler callbacks must use this: the sink talks to the connection's
    /// event loop, which is parked until the callback returns.
    pub fn close_detached(self, reason: &'static str) {
        tokio::spawn(async move { self.close(reason).await });
    }

    fn resize(&self, width: u32, height: u32) {
        if let Err(e) = self.pty.resize(width, height) {
            warn!(session = %self.id, error = %e, width, height, "failed to resize pty");
        }
    }
}

/// Client → shell, with trigger detection after every chunk
async fn pump_input<S: ChannelSink>(
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    mut interceptor: CommandInterceptor,
    recorder: Arc<Recorder>,
    sink: S,
    pty: Arc<PtyProcess>,
    latch: Arc<CloseLatch>,
) {
    loop {
        let chunk = tokio::select! {
            _ = latch.cancelled() => return,
            chunk = input_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            debug!("client input closed");
            break;
        };

        if let Err(e) = pty.write_all(&chunk).await {
            debug!(error = %e, "pty write failed");
            break;
        }

        if let Some(rule) = interceptor.observe(&chunk) {
            info!(command_match = %rule.command_match, "command matched, sending fake response");
            recorder.matched(&rule.command_match);
            let sent = tokio::select! {
                _ = latch.cancelled() => return,
                sent = sink.data(&rule.response) => sent,
            };
            if sent.is_err() {
                debug!("client gone before fake response");
                break;
            }
        }
    }

    close_once(&latch, &sink, &pty, "client eof").await;
}

/// Shell → client
async fn pump_output<S: ChannelSink>(
    sink: S,
    pty: Arc<PtyProcess>,
    forward: bool,
    latch: Arc<CloseLatch>,
) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            _ = latch.cancelled() => return,
            read = pty.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                debug!("shell closed pty");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "pty read failed");
                break;
            }
        };

        if !forward {
            trace!(bytes = n, "shell output replaced");
            continue;
        }
        let sent = tokio::select! {
            _ = latch.cancelled() => return,
            sent = sink.data(&buf[..n]) => sent,
        };
        if sent.is_err() {
            debug!("client gone");
            break;
        }
    }

    close_once(&latch, &sink, &pty, "shell eof").await;
}

async fn close_once<S: ChannelSink>(latch: &CloseLatch, sink: &S, pty: &PtyProcess, reason: &str) {
    if !latch.fire() {
        return;
    }
    info!(reason, "closing session");
    sink.close().await;
    pty.shutdown().await;
    info!("session closed");
}
