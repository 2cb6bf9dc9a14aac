//! Agent connection loop
//!
//! Probe the backend, connect, serve requests until the socket ends, then
//! wait and reconnect. Credential rejection (1008) and replacement by a
//! newer session (4001) end the loop instead of retrying.

use futures_util::{SinkExt, StreamExt};
use neuralgate_proto::{AgentRequest, CLOSE_POLICY_VIOLATION, CLOSE_SESSION_REPLACED};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::forwarder::UpstreamForwarder;
use crate::hardware::{HardwareReporter, HardwareSpecs};
use crate::AgentError;

/// How a connected session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The gateway refused or superseded this agent; do not retry
    Rejected { code: u16, reason: String },
    Disconnected,
    Stopped,
}

pub struct Agent {
    config: AgentConfig,
    forwarder: Arc<UpstreamForwarder>,
    reporter: Option<HardwareReporter>,
    started: Instant,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let forwarder = UpstreamForwarder::new(config.upstream.clone(), config.upstream_timeout)?;
        let reporter = if config.optout_stats {
            None
        } else {
            Some(HardwareReporter::new(config.stats_url()?)?)
        };

        Ok(Self {
            config,
            forwarder: Arc::new(forwarder),
            reporter,
            started: Instant::now(),
        })
    }

    /// Run until `shutdown` fires or the gateway rejects this agent
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            if !self.forwarder.probe().await {
                error!(
                    upstream = %self.forwarder.base(),
                    "Local backend is offline, retrying in {:?}",
                    self.config.probe_retry
                );
                if pause(self.config.probe_retry, &shutdown).await {
                    return Ok(());
                }
                continue;
            }

            match self.run_session(&shutdown).await {
                Ok(SessionEnd::Stopped) => return Ok(()),
                Ok(SessionEnd::Rejected { code, reason }) => {
                    error!(code, reason = %reason, "Connection rejected by gateway");
                    return Err(AgentError::Rejected { code, reason });
                }
                Ok(SessionEnd::Disconnected) => warn!("Disconnected from gateway"),
                Err(e) => warn!(error = %e, "Gateway connection failed"),
            }

            info!("Retrying connection in {:?}", self.config.reconnect_delay);
            if pause(self.config.reconnect_delay, &shutdown).await {
                return Ok(());
            }
        }
    }

    /// One connection: connect, serve requests, report how it ended
    pub async fn run_session(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, AgentError> {
        info!(gateway = %self.config.gateway_url, "Connecting to gateway");
        let (socket, _) = connect_async(self.config.tunnel_url().as_str()).await?;
        info!(
            username = %self.config.credentials.username,
            slug = %self.config.credentials.slug,
            "Connected to gateway"
        );

        self.spawn_report();

        let (mut sink, mut stream) = socket.split();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str(), &reply_tx),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.dispatch(text, &reply_tx),
                        Err(_) => warn!("Ignoring non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => return Ok(classify_close(frame)),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Gateway socket error");
                        return Ok(SessionEnd::Disconnected);
                    }
                    None => return Ok(SessionEnd::Disconnected),
                },
                Some(reply) = reply_rx.recv() => {
                    sink.send(Message::Text(reply.into())).await?;
                }
                _ = ping.tick() => {
                    sink.send(Message::Ping(Default::default())).await?;
                }
                _ = shutdown.cancelled() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Agent stopping".into(),
                        })))
                        .await;
                    return Ok(SessionEnd::Stopped);
                }
            }
        }
    }

    /// Forward one broker message on its own task
    fn dispatch(&self, text: &str, replies: &mpsc::UnboundedSender<String>) {
        let request = match AgentRequest::from_json(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Skipping malformed gateway message");
                return;
            }
        };

        info!(
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            "Processing request"
        );

        let forwarder = self.forwarder.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = forwarder.forward(&request).await;
            match reply.to_json() {
                Ok(text) => {
                    // The session may have ended meanwhile
                    let _ = replies.send(text);
                }
                Err(e) => {
                    error!(request_id = %request.request_id, error = %e, "Failed to encode reply")
                }
            }
        });
    }

    fn spawn_report(&self) {
        let Some(reporter) = self.reporter.clone() else {
            info!("Statistics collection skipped (opt-out)");
            return;
        };

        let credentials = self.config.credentials.clone();
        let uptime = self.started.elapsed();
        tokio::spawn(async move {
            let specs = HardwareSpecs::collect();
            match reporter.report(&credentials, &specs, uptime).await {
                Ok(()) => info!("Hardware stats sent to gateway"),
                Err(e) => warn!(error = %e, "Failed to send hardware stats"),
            }
        });
    }
}

/// Sleep for `delay`; returns `true` if `shutdown` fired first
async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

pub(crate) fn classify_close(frame: Option<CloseFrame>) -> SessionEnd {
    let Some(frame) = frame else {
        return SessionEnd::Disconnected;
    };

    let code = u16::from(frame.code);
    if code == CLOSE_POLICY_VIOLATION || code == CLOSE_SESSION_REPLACED {
        SessionEnd::Rejected {
            code,
            reason: frame.reason.as_str().to_string(),
        }
    } else {
        debug!(code, reason = %frame.reason.as_str(), "Gateway closed the session");
        SessionEnd::Disconnected
    }
}
