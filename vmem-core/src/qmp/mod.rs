//! QEMU Machine Protocol client.
//!
//! The controller talks to the hypervisor through the [`MonitorSession`]
//! trait. [`QmpClient`] is the real implementation over the monitor's Unix
//! socket; tests substitute scripted sessions.
//!
//! # Session rules
//!
//! - Capabilities are negotiated before any other command.
//! - Exactly one command is in flight (`execute` takes `&mut self`).
//! - Events that arrive while waiting for a reply are queued and handed out
//!   by the next [`MonitorSession::drain_events`] call.
//! - After a timeout or a garbled exchange the stream position is unknown;
//!   callers drop the session (see [`VmemError::poisons_session`]).

mod protocol;

pub use protocol::{
    decode_reply, parse_memory_devices, BalloonInfo, MemoryDevice, MemorySizeSummary, QmpCommand,
    QmpError, QmpEvent, QmpMessage,
};

use crate::error::{Result, VmemError};
use crate::observability::metrics as vmem_metrics;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, instrument, warn};

/// How long `drain_events` waits for more input before returning.
const EVENT_POLL_WINDOW: Duration = Duration::from_millis(10);

/// A negotiated monitor session.
#[async_trait]
pub trait MonitorSession: Send {
    /// Issue one command and wait for its reply.
    async fn execute(&mut self, command: &QmpCommand, timeout: Duration) -> Result<Value>;

    /// Return queued events plus any already waiting on the socket.
    async fn drain_events(&mut self) -> Result<Vec<QmpEvent>>;

    async fn query_memory_devices(&mut self, timeout: Duration) -> Result<Vec<MemoryDevice>> {
        let reply = self.execute(&QmpCommand::QueryMemoryDevices, timeout).await?;
        parse_memory_devices(reply)
    }

    async fn query_balloon(&mut self, timeout: Duration) -> Result<BalloonInfo> {
        let reply = self.execute(&QmpCommand::QueryBalloon, timeout).await?;
        decode_reply("query-balloon", reply)
    }

    async fn query_memory_size_summary(&mut self, timeout: Duration) -> Result<MemorySizeSummary> {
        let reply = self.execute(&QmpCommand::QueryMemorySizeSummary, timeout).await?;
        decode_reply("query-memory-size-summary", reply)
    }
}

/// Opens new sessions; used by the controller to reconnect.
#[async_trait]
pub trait MonitorConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MonitorSession>>;
}

/// Connects to a QMP socket and negotiates capabilities.
#[derive(Debug, Clone)]
pub struct QmpConnector {
    socket: PathBuf,
    timeout: Duration,
}

impl QmpConnector {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { socket: socket.into(), timeout }
    }
}

#[async_trait]
impl MonitorConnector for QmpConnector {
    async fn connect(&self) -> Result<Box<dyn MonitorSession>> {
        let mut client = QmpClient::connect(&self.socket, self.timeout).await?;
        client.negotiate(self.timeout).await?;
        Ok(Box::new(client))
    }
}

/// QMP client over a Unix stream socket.
pub struct QmpClient {
    socket: PathBuf,
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
    events: VecDeque<QmpEvent>,
    negotiated: bool,
    closed: bool,
}

impl QmpClient {
    /// Open the socket. The session is unusable until [`negotiate`](Self::negotiate).
    #[instrument(skip(timeout))]
    pub async fn connect(socket: &Path, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(socket))
            .await
            .map_err(|_| VmemError::ConnectionFailed {
                socket: socket.to_path_buf(),
                reason: format!("connect timed out after {}ms", timeout.as_millis()),
            })?
            .map_err(|e| VmemError::ConnectionFailed {
                socket: socket.to_path_buf(),
                reason: e.to_string(),
            })?;

        let (read_half, writer) = stream.into_split();
        Ok(Self {
            socket: socket.to_path_buf(),
            reader: BufReader::new(read_half).lines(),
            writer,
            next_id: 1,
            events: VecDeque::new(),
            negotiated: false,
            closed: false,
        })
    }

    /// Read the greeting and enter command mode.
    #[instrument(skip(self, timeout), fields(socket = %self.socket.display()))]
    pub async fn negotiate(&mut self, timeout: Duration) -> Result<()> {
        let handshake = async {
            let greeting = match self.read_message().await? {
                Some(QmpMessage::Greeting(greeting)) => greeting,
                Some(other) => {
                    return Err(VmemError::HandshakeFailed {
                        reason: format!("expected greeting, got {:?}", other),
                    })
                }
                None => {
                    return Err(VmemError::HandshakeFailed {
                        reason: "monitor closed before greeting".into(),
                    })
                }
            };
            let version = greeting.get("version").cloned().unwrap_or_default();
            debug!(%version, "QMP greeting");

            match self.exchange(&QmpCommand::Capabilities).await? {
                Ok(_) => Ok(()),
                Err(err) => Err(VmemError::HandshakeFailed {
                    reason: format!("qmp_capabilities rejected ({}): {}", err.class, err.desc),
                }),
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {
                self.negotiated = true;
                debug!("QMP capabilities negotiated");
                Ok(())
            }
            Ok(Err(VmemError::HandshakeFailed { reason })) => {
                Err(VmemError::HandshakeFailed { reason })
            }
            Ok(Err(e)) => Err(VmemError::HandshakeFailed { reason: e.to_string() }),
            Err(_) => Err(VmemError::HandshakeFailed {
                reason: format!("no handshake within {}ms", timeout.as_millis()),
            }),
        }
    }

    /// Send one request and read until its reply, queueing events on the way.
    async fn exchange(
        &mut self,
        command: &QmpCommand,
    ) -> Result<std::result::Result<Value, QmpError>> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = command.encode(id);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.map_err(|e| self.io_error(e))?;
        self.writer.flush().await.map_err(|e| self.io_error(e))?;

        loop {
            match self.read_message().await? {
                None => {
                    self.closed = true;
                    return Err(VmemError::NotConnected);
                }
                Some(QmpMessage::Event(event)) => {
                    vmem_metrics::record_qmp_event(&event.event);
                    self.events.push_back(event);
                }
                Some(QmpMessage::Reply { id: Some(reply_id), .. }) if reply_id != id => {
                    debug!(reply_id, expected = id, "Discarding reply to an earlier request");
                }
                Some(QmpMessage::Reply { result, .. }) => return Ok(result),
                Some(QmpMessage::Greeting(_)) => {
                    return Err(VmemError::ProtocolError {
                        reason: "unexpected greeting mid-session".into(),
                    })
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<Option<QmpMessage>> {
        loop {
            let line = self.reader.next_line().await.map_err(|e| self.io_error(e))?;
            match line {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return QmpMessage::parse(&line).map(Some),
            }
        }
    }

    fn io_error(&self, e: std::io::Error) -> VmemError {
        VmemError::ConnectionFailed { socket: self.socket.clone(), reason: e.to_string() }
    }
}

#[async_trait]
impl MonitorSession for QmpClient {
    #[instrument(skip(self, timeout), fields(command = command.name()))]
    async fn execute(&mut self, command: &QmpCommand, timeout: Duration) -> Result<Value> {
        if self.closed {
            return Err(VmemError::NotConnected);
        }
        if !self.negotiated {
            return Err(VmemError::ProtocolError {
                reason: "command issued before capabilities negotiation".into(),
            });
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.exchange(command)).await {
            Err(_) => Err(VmemError::CommandTimeout {
                command: command.name().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(VmemError::CommandFailed {
                command: command.name().to_string(),
                class: err.class,
                desc: err.desc,
            }),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(VmemError::CommandFailed { .. }) => "rejected",
            Err(VmemError::CommandTimeout { .. }) => "timeout",
            Err(_) => "error",
        };
        vmem_metrics::record_qmp_command(command.name(), outcome, started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!("QMP {} failed: {}", command.name(), e);
        }
        result
    }

    async fn drain_events(&mut self) -> Result<Vec<QmpEvent>> {
        while !self.closed {
            match tokio::time::timeout(EVENT_POLL_WINDOW, self.read_message()).await {
                Err(_) => break,
                Ok(Ok(None)) => {
                    debug!("Monitor closed the connection");
                    self.closed = true;
                }
                Ok(Ok(Some(QmpMessage::Event(event)))) => {
                    vmem_metrics::record_qmp_event(&event.event);
                    self.events.push_back(event);
                }
                Ok(Ok(Some(other))) => {
                    warn!("Ignoring unsolicited monitor message: {:?}", other);
                }
                Ok(Err(e)) => return Err(e),
            }
        }
        // Hand out what arrived before the hangup; the next call reports it.
        if self.closed && self.events.is_empty() {
            return Err(VmemError::NotConnected);
        }
        Ok(self.events.drain(..).collect())
    }
}
