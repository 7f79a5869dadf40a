//! The per-device task tying the link, the discipline and the state model together.
//!
//! [`DeviceEngine::run`] owns the link and is the only writer to it. Callers
//! talk to the engine through a cloneable [`DeviceHandle`]; each command comes
//! back as a future that resolves exactly once, with the interpreted value, a
//! device rejection, a timeout, or [`LinkError::Closed`] when the engine stops.

use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::assembler::{FramingMode, StreamAssembler};
use crate::config::{config as global_config, SerialSettings};
use crate::discipline::{LinkDiscipline, LinkState, Outbound};
use crate::error::LinkError;
use crate::matcher::{Message, Resolution};
use crate::protocol::{setter_key, Framing, Protocol};
use crate::scheduler::RequestScheduler;
use crate::state::{DeviceStateModel, SharedState};
use crate::transport::{hex_dump, maybe_log_payload};
use crate::value::Value;

const COMMAND_QUEUE_DEPTH: usize = 64;
const READ_BUF_LEN: usize = 1024;
const MIN_TICK: Duration = Duration::from_millis(1);

fn read_state(state: &SharedState) -> Result<RwLockReadGuard<'_, DeviceStateModel>, LinkError> {
    state
        .read()
        .map_err(|_| LinkError::Protocol("state model lock poisoned".into()))
}

fn write_state(state: &SharedState) -> Result<RwLockWriteGuard<'_, DeviceStateModel>, LinkError> {
    state
        .write()
        .map_err(|_| LinkError::Protocol("state model lock poisoned".into()))
}

/// Caller side of a running engine.
#[derive(Clone)]
pub struct DeviceHandle {
    name: Arc<str>,
    protocol: Arc<Protocol>,
    state: SharedState,
    commands: mpsc::Sender<Outbound>,
}

impl DeviceHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Shared state model, e.g. to register watchers. Watchers are called by
    /// the engine task after it has released the lock.
    #[must_use]
    pub const fn state(&self) -> &SharedState {
        &self.state
    }

    /// Queue a registered command and wait for its outcome. Commands are sent
    /// ahead of any scheduled poll, in the order they were queued.
    pub async fn enqueue_command(&self, key: &str, args: Vec<Value>) -> Result<Value, LinkError> {
        let spec = self.protocol.command(key)?;
        let payload = spec.build_payload(&args)?;
        let (tx, rx) = oneshot::channel();
        let outbound = Outbound::new(key, payload)
            .with_expected_response(spec.expected_response.clone())
            .with_expect_reply(spec.expect_reply)
            .with_responder(tx);
        self.commands
            .send(outbound)
            .await
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    /// Ask the device to change an editable variable through its `set_<name>`
    /// command. The model itself only changes once the device reports back.
    pub async fn state_set(&self, var: &str, value: Value) -> Result<Value, LinkError> {
        {
            let state = read_state(&self.state)?;
            let v = state
                .variable(var)
                .ok_or_else(|| LinkError::UnknownVariable(var.to_string()))?;
            if !v.editable {
                return Err(LinkError::ReadOnly(var.to_string()));
            }
        }
        self.enqueue_command(&setter_key(var), vec![value]).await
    }

    pub fn state_get(&self, var: &str) -> Result<Value, LinkError> {
        read_state(&self.state)?
            .get(var)
            .cloned()
            .ok_or_else(|| LinkError::UnknownVariable(var.to_string()))
    }

    pub fn snapshot(&self) -> Result<serde_json::Value, LinkError> {
        Ok(read_state(&self.state)?.snapshot())
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("protocol", &self.protocol.name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct DeviceEngine {
    name: Arc<str>,
    protocol: Arc<Protocol>,
    state: SharedState,
    discipline: LinkDiscipline,
    scheduler: RequestScheduler,
    assembler: StreamAssembler,
    commands: mpsc::Receiver<Outbound>,
    tick: Duration,
}

impl DeviceEngine {
    /// Build an engine and its handle. Nothing touches the link until
    /// [`run`](Self::run) is awaited.
    pub fn new(
        name: impl Into<String>,
        protocol: Arc<Protocol>,
        settings: &SerialSettings,
    ) -> Result<(Self, DeviceHandle), LinkError> {
        let name: Arc<str> = Arc::from(name.into());
        let mode = match protocol.framing() {
            Framing::Text => FramingMode::text(settings.message_end.as_bytes())?,
            Framing::Binary => FramingMode::Binary,
        };
        settings.validate_line()?;
        let timeout = settings.timeout()?;
        let tick = global_config()
            .tick_interval_ms
            .map_or(timeout, Duration::from_millis)
            .max(MIN_TICK);
        let state = protocol.new_state()?.into_shared();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let engine = Self {
            name: Arc::clone(&name),
            protocol: Arc::clone(&protocol),
            state: Arc::clone(&state),
            discipline: LinkDiscipline::new(timeout),
            scheduler: protocol.scheduler()?,
            assembler: StreamAssembler::new(mode),
            commands: rx,
            tick,
        };
        let handle = DeviceHandle {
            name,
            protocol,
            state,
            commands: tx,
        };
        Ok((engine, handle))
    }

    /// Period of the idle check that drives polling, at least one millisecond.
    #[must_use]
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick = tick.max(MIN_TICK);
        self
    }

    /// Drive the device until the link closes or every handle is dropped.
    /// Outstanding and queued commands fail with [`LinkError::Closed`] on exit.
    pub async fn run<L>(mut self, link: L) -> Result<(), LinkError>
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::info!(device = %self.name, protocol = self.protocol.name(), "engine started");
        let (mut reader, mut writer) = tokio::io::split(link);
        let result = self.serve(&mut reader, &mut writer).await;
        self.discipline.abort_all();
        match &result {
            Ok(()) => tracing::info!(device = %self.name, "engine stopped"),
            Err(e) => tracing::error!(device = %self.name, error = %e, "engine stopped"),
        }
        result
    }

    async fn serve<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), LinkError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut tick = interval_at(Instant::now() + self.tick, self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = [0u8; READ_BUF_LEN];

        loop {
            let deadline = self.discipline.deadline();
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        tracing::info!(device = %self.name, "link closed by peer");
                        return Ok(());
                    }
                    if self.on_bytes(&buf[..n])? {
                        self.pump(writer).await?;
                    }
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::debug!(device = %self.name, "all handles dropped");
                        return Ok(());
                    };
                    tracing::debug!(device = %self.name, key = %cmd.key, "command queued");
                    self.discipline.enqueue(cmd);
                    self.pump(writer).await?;
                }
                _ = tick.tick() => {
                    self.expire();
                    self.pump(writer).await?;
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire();
                    self.pump(writer).await?;
                }
            }
        }
    }

    fn expire(&mut self) {
        let Some(expired) = self.discipline.expire(Instant::now()) else {
            return;
        };
        tracing::warn!(
            device = %self.name,
            key = %expired.key,
            command = expired.was_command,
            "no response before deadline"
        );
        if global_config().dump_on_error {
            log::warn!("[{} TIMEOUT {}] sent {}", self.name, expired.key, hex_dump(&expired.payload));
        }
    }

    /// Send while the link is idle and something is waiting: queued commands
    /// first, then the next scheduled poll.
    async fn pump<W>(&mut self, writer: &mut W) -> Result<(), LinkError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(tx) = self
            .discipline
            .next_transmit(&mut self.scheduler, Instant::now())
        {
            tracing::trace!(device = %self.name, key = %tx.key, poll = tx.is_poll, "send");
            maybe_log_payload("send", &self.name, &tx.payload);
            let written = match writer.write_all(&tx.payload).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                let failure = || LinkError::Protocol(format!("write of {} failed: {e}", tx.key));
                if let Some(responder) = tx.on_written {
                    let _ = responder.send(Err(failure()));
                }
                self.discipline.settle(Err(failure()));
                return Err(LinkError::Io(e));
            }
            if let Some(responder) = tx.on_written {
                let _ = responder.send(Ok(Value::Null));
            }
            if self.discipline.state() == LinkState::Awaiting {
                break;
            }
        }
        Ok(())
    }

    /// Feed inbound bytes through the assembler and dispatch every complete
    /// message. Returns whether a text terminator was seen.
    fn on_bytes(&mut self, bytes: &[u8]) -> Result<bool, LinkError> {
        maybe_log_payload("recv", &self.name, bytes);
        let assembled = self.assembler.push(bytes);
        for message in assembled.messages {
            self.dispatch(&message)?;
        }
        Ok(assembled.saw_terminator)
    }

    fn dispatch(&mut self, message: &Message) -> Result<(), LinkError> {
        if let Message::Frame(frame) = message {
            // a zero id1 never comes from the device; it is an echo of our own traffic
            if frame.id1 == 0 {
                tracing::trace!(device = %self.name, %message, "ignored");
                return Ok(());
            }
        }
        let Some(rule) = self.protocol.matcher().find(message) else {
            tracing::trace!(device = %self.name, %message, "unmatched");
            return Ok(());
        };

        let settles = self.discipline.pending().is_some_and(|p| {
            rule.is_status()
                || p.expected_response
                    .as_deref()
                    .map_or(true, |expected| expected == rule.key)
        });
        let (resolution, notifications) = {
            let mut state = write_state(&self.state)?;
            let resolution = rule.evaluate(message, &mut state);
            (resolution, state.take_notifications())
        };
        // watchers run unlocked and may read the model through a handle
        notifications.deliver();

        if settles {
            let result = match resolution {
                Resolution::Resolve(v) => Ok(v),
                Resolution::Reject(e) => {
                    tracing::debug!(device = %self.name, rule = %rule.key, error = %e, "rejected");
                    if global_config().dump_on_error {
                        if let Some(p) = self.discipline.pending() {
                            log::warn!("[{} REJECT {}] sent {}", self.name, p.request_key, hex_dump(&p.payload));
                        }
                    }
                    Err(e)
                }
            };
            if let Some(key) = self.discipline.settle(result) {
                tracing::debug!(device = %self.name, key = %key, rule = %rule.key, "settled");
            }
        } else {
            match resolution {
                Resolution::Resolve(_) => {
                    tracing::trace!(device = %self.name, rule = %rule.key, "unsolicited");
                }
                Resolution::Reject(e) => {
                    tracing::debug!(device = %self.name, rule = %rule.key, error = %e, "unsolicited rejection");
                }
            }
        }
        Ok(())
    }
}
