//! Per-connection session loop: heartbeat, read deadline, prompt dispatch
//! and teardown.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tether_backend::Dispatcher;
use tether_core::backend::Resolver;
use tether_core::config::SessionSettings;
use tether_core::ids::ConnectionId;

use crate::channel::{ChannelError, Inbound, MessageChannel};
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::registry::ConnectionRegistry;

/// Payload sent to the peer when a read fails but the connection still
/// accepts writes.
pub const READ_FAILURE_MESSAGE: &str = "Error reading message from WebSocket.";
/// Payload sent to the peer when an answer could not be written.
pub const WRITE_FAILURE_MESSAGE: &str = "Error sending message to WebSocket.";

/// Messages read while a dispatch is in flight and held until it finishes.
const MAX_PENDING: usize = 32;

/// Liveness timings for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Read deadline, renewed by every acknowledgement.
    pub pong_wait: Duration,
    /// Interval between liveness probes.
    pub ping_period: Duration,
    /// Deadline for any single write.
    pub write_wait: Duration,
    /// End the session after a dispatch failure has been reported.
    pub close_on_dispatch_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            pong_wait: settings.pong_wait(),
            ping_period: settings.ping_period(),
            write_wait: settings.write_wait(),
            close_on_dispatch_failure: settings.close_on_dispatch_failure,
        }
    }
}

/// Lifecycle of a session. States only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Created, not yet registered.
    Connecting,
    /// Registered and serving prompts.
    Active,
    /// Serving has ended, the channel is being closed.
    Closing,
    /// Channel released.
    Closed,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent a normal or going-away close.
    PeerClosedNormally,
    /// A liveness probe could not be written.
    HeartbeatFailure,
    /// A read failed or the read deadline passed.
    ReadFailure,
    /// An answer could not be written.
    WriteFailure,
    /// A dispatch failure was reported and the session is configured to end.
    DispatchFailed,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Metric label for this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosedNormally => "peer_closed",
            Self::HeartbeatFailure => "heartbeat_failure",
            Self::ReadFailure => "read_failure",
            Self::WriteFailure => "write_failure",
            Self::DispatchFailed => "dispatch_failed",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the session ended because something went wrong.
    pub fn is_error(self) -> bool {
        !matches!(self, Self::PeerClosedNormally | Self::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a session needs besides its channel. Cheap to clone.
pub struct SessionContext<R: Resolver + ?Sized> {
    /// Resolves prompts with retry.
    pub dispatcher: Dispatcher<R>,
    /// Where the session registers itself while it runs.
    pub registry: Arc<ConnectionRegistry>,
    /// Liveness timings.
    pub config: SessionConfig,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

impl<R: Resolver + ?Sized> Clone for SessionContext<R> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

enum Event {
    Heartbeat,
    Read(Result<Inbound, ChannelError>),
}

/// One client connection from upgrade to close.
pub struct Session<C: MessageChannel, R: Resolver + ?Sized> {
    id: ConnectionId,
    channel: C,
    ctx: SessionContext<R>,
    state: SessionState,
    /// Read during a dispatch, served before the channel is read again.
    pending: VecDeque<Result<Inbound, ChannelError>>,
}

impl<C: MessageChannel, R: Resolver + ?Sized + 'static> Session<C, R> {
    /// A session in [`SessionState::Connecting`]. Nothing happens until
    /// [`run`](Self::run).
    pub fn new(id: ConnectionId, channel: C, ctx: SessionContext<R>) -> Self {
        Self {
            id,
            channel,
            ctx,
            state: SessionState::Connecting,
            pending: VecDeque::new(),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "session state moved from {:?} to {next:?}", self.state);
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Serve the connection until it closes. The session is deregistered and
    /// its channel released on every exit path.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn run(mut self, peer: Option<SocketAddr>) -> CloseReason {
        let _registration = self.ctx.registry.register(self.id.clone(), peer);
        let started = Instant::now();
        info!(?peer, "client connected");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

        self.transition(SessionState::Active);
        let reason = self.serve().await;
        self.transition(SessionState::Closing);

        if let Err(err) = self.channel.close().await {
            debug!(error = %err, "close after session end failed");
        }
        self.transition(SessionState::Closed);

        if reason.is_error() {
            warn!(reason = %reason, "client disconnected");
        } else {
            info!(reason = %reason, "client disconnected");
        }
        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        reason
    }

    async fn serve(&mut self) -> CloseReason {
        let pong_wait = self.ctx.config.pong_wait;
        let ping_period = self.ctx.config.ping_period;
        let write_wait = self.ctx.config.write_wait;

        let now = Instant::now();
        let mut read_deadline = now + pong_wait;
        let mut heartbeat = interval_at(now + ping_period, ping_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = match self.pending.pop_front() {
                Some(_) if Instant::now() >= read_deadline => {
                    Event::Read(Err(ChannelError::DeadlineExceeded))
                }
                Some(msg) => Event::Read(msg),
                None => tokio::select! {
                    biased;
                    () = self.ctx.shutdown.cancelled() => return CloseReason::Shutdown,
                    _ = heartbeat.tick() => Event::Heartbeat,
                    () = sleep_until(read_deadline) => Event::Read(Err(ChannelError::DeadlineExceeded)),
                    msg = self.channel.read_message() => Event::Read(msg),
                },
            };

            match event {
                Event::Heartbeat => {
                    if let Err(err) = self.channel.write_probe(write_wait).await {
                        warn!(error = %err, "heartbeat probe failed");
                        return CloseReason::HeartbeatFailure;
                    }
                }
                Event::Read(Ok(Inbound::Ack)) => {
                    read_deadline = Instant::now() + pong_wait;
                }
                Event::Read(Ok(Inbound::Prompt(prompt))) => {
                    if let Some(reason) = self
                        .handle_prompt(prompt, &mut heartbeat, &mut read_deadline)
                        .await
                    {
                        return reason;
                    }
                }
                Event::Read(Err(err)) if err.is_normal_close() => {
                    info!("peer closed the connection");
                    return CloseReason::PeerClosedNormally;
                }
                Event::Read(Err(err)) => return self.read_failed(err).await,
            }
        }
    }

    async fn read_failed(&mut self, err: ChannelError) -> CloseReason {
        warn!(error = %err, "{READ_FAILURE_MESSAGE}");
        let write_wait = self.ctx.config.write_wait;
        if let Err(probe_err) = self.channel.write_probe(write_wait).await {
            debug!(error = %probe_err, "connection is not writable");
            return CloseReason::ReadFailure;
        }
        if let Err(write_err) = self.channel.write_text(READ_FAILURE_MESSAGE).await {
            debug!(error = %write_err, "could not report read failure to peer");
        }
        CloseReason::ReadFailure
    }

    /// Dispatch one prompt and deliver the outcome. Returns a reason when the
    /// session must close.
    ///
    /// Heartbeats keep firing while the dispatch is in flight and the channel
    /// keeps being read: an acknowledgement received before `read_deadline`
    /// renews it at once, anything else is queued for the main loop. Reading
    /// pauses once the queue is full or holds a read error.
    async fn handle_prompt(
        &mut self,
        prompt: String,
        heartbeat: &mut Interval,
        read_deadline: &mut Instant,
    ) -> Option<CloseReason> {
        let write_wait = self.ctx.config.write_wait;
        let pong_wait = self.ctx.config.pong_wait;
        debug!(prompt_len = prompt.len(), "prompt received");

        let outcome = {
            let dispatch = self.ctx.dispatcher.dispatch(&prompt);
            tokio::pin!(dispatch);
            loop {
                let reading = self.pending.len() < MAX_PENDING
                    && !self.pending.back().is_some_and(Result::is_err);
                tokio::select! {
                    biased;
                    () = self.ctx.shutdown.cancelled() => return Some(CloseReason::Shutdown),
                    result = &mut dispatch => break result,
                    _ = heartbeat.tick() => {
                        if let Err(err) = self.channel.write_probe(write_wait).await {
                            warn!(error = %err, "heartbeat probe failed during dispatch");
                            return Some(CloseReason::HeartbeatFailure);
                        }
                    }
                    msg = self.channel.read_message(), if reading => match msg {
                        Ok(Inbound::Ack) => {
                            let now = Instant::now();
                            if now < *read_deadline {
                                *read_deadline = now + pong_wait;
                            } else {
                                debug!("acknowledgement arrived after the read deadline");
                            }
                        }
                        other => self.pending.push_back(other),
                    },
                }
            }
        };

        match outcome {
            Ok(answer) => match self.channel.write_text(&answer).await {
                Ok(()) => None,
                Err(err) if err.is_normal_close() => {
                    info!("peer closed before the answer was delivered");
                    Some(CloseReason::PeerClosedNormally)
                }
                Err(err) => {
                    warn!(error = %err, "{WRITE_FAILURE_MESSAGE}");
                    if self.channel.write_probe(write_wait).await.is_ok() {
                        let _ = self.channel.write_text(WRITE_FAILURE_MESSAGE).await;
                    }
                    Some(CloseReason::WriteFailure)
                }
            },
            Err(err) => {
                warn!(error = %err, kind = err.error_kind(), attempts = err.attempts(), "dispatch failed");
                if let Err(probe_err) = self.channel.write_probe(write_wait).await {
                    debug!(error = %probe_err, "connection is not writable");
                    return Some(CloseReason::DispatchFailed);
                }
                if let Err(write_err) = self.channel.write_text(&err.to_string()).await {
                    if write_err.is_normal_close() {
                        return Some(CloseReason::PeerClosedNormally);
                    }
                    debug!(error = %write_err, "could not report dispatch failure to peer");
                    return Some(CloseReason::WriteFailure);
                }
                self.ctx
                    .config
                    .close_on_dispatch_failure
                    .then_some(CloseReason::DispatchFailed)
            }
        }
    }
}
