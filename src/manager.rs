//! Connection Manager with Automatic Reconnection
//!
//! Single responsibility: own the transport lifecycle, the outbound queue,
//! and inbound fan-out for one user session.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  ConnectionManager                      │
//! │  - connect() / send() / on_message() / disconnect()     │
//! │  - Queues outbound envelopes while the channel is down  │
//! │  - Reconnects on unexpected close, up to a bound        │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!               ┌────────────┼────────────┐
//!               ▼            ▼            ▼
//!          Connector     reader task   reconnect timer
//! ```
//!
//! # Reconnection Policy
//!
//! When the connection closes without an explicit `disconnect()`:
//! 1. If the attempt counter is below the bound, increment it and schedule
//!    a timer that re-invokes connect with the last-known identity
//! 2. A reconnect attempt that fails counts as another unexpected close
//! 3. At the bound, stop silently; callers poll `reconnect_exhausted()`
//! 4. The counter resets to 0 on every successful open
//!
//! The timer handle is stored so `disconnect()` cancels it deterministically.
//! An attempt epoch is bumped on every teardown; a connect attempt whose
//! epoch is stale when the handshake completes is discarded, which is what
//! makes `disconnect()` during `Connecting` safe.
//!
//! # Guarantees
//!
//! - Outbound envelopes reach the transport in exact `send()` call order,
//!   preceded by exactly one `CONNECT` per successful open
//! - A write fault never loses the envelope (re-queued at the front)
//! - Malformed inbound payloads are dropped without closing the connection
//! - At most one transport connection is alive at a time

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::envelope::Envelope;
use crate::error::ChannelError;
use crate::transport::{Connector, FrameSink, FrameStream, WsConnector};

/// Inbound subscriber. Invoked for every successfully decoded envelope,
/// in registration order.
pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Lifecycle state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

struct Inner {
    state: ConnectionState,
    /// Bumped on every teardown; stale attempts and tasks check it and bail.
    epoch: u64,
    sink: Option<Box<dyn FrameSink>>,
    /// Pending envelopes, insertion order = send order. Unbounded: no
    /// backpressure exists at this layer.
    queue: VecDeque<Envelope>,
    handlers: Vec<MessageHandler>,
    attempts: u32,
    exhausted: bool,
    /// Last identity passed to connect(), used by the reconnect timer.
    identity: Option<u64>,
    reconnect_timer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Inner {
    /// Tear down the current connection or attempt. Cancels companion tasks
    /// and invalidates anything still in flight via the epoch bump. The
    /// outbound queue is deliberately left intact.
    fn teardown(&mut self) -> Option<Box<dyn FrameSink>> {
        self.epoch += 1;
        self.state = ConnectionState::Closed;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.sink.take()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last-resort cleanup only: the reader task holds a manager clone,
        // so while a connection is live this cannot run. disconnect() is
        // the shutdown path; this covers a manager dropped while closed.
        self.teardown();
    }
}

/// A reconnecting duplex channel to the message server.
///
/// One instance is live per user session. Cheap to clone; clones share the
/// same channel. `disconnect()` is the shutdown path and must be called when
/// the owning session ends.
#[derive(Clone)]
pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    inner: Arc<Mutex<Inner>>,
}

impl ConnectionManager {
    /// Create a manager that connects over WebSocket.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Create a manager with a custom connector. This is the seam tests and
    /// alternative transports plug into.
    pub fn with_connector(config: ManagerConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Idle,
                epoch: 0,
                sink: None,
                queue: VecDeque::new(),
                handlers: Vec::new(),
                attempts: 0,
                exhausted: false,
                identity: None,
                reconnect_timer: None,
                reader: None,
                heartbeat: None,
            })),
        }
    }

    /// Connect to the message server and announce presence as `user_id`.
    ///
    /// A call while an attempt is already in flight (or while the channel
    /// is open) is a no-op: at most one transport connection is alive at a
    /// time. On success the outbound queue is flushed in FIFO order, right
    /// after the presence announcement.
    ///
    /// # Errors
    /// `ChannelError::Connection` when the transport could not be
    /// established. An explicit connect is not retried automatically; only
    /// unexpected closes of an established connection engage the
    /// reconnection policy.
    pub async fn connect(&self, user_id: u64) -> Result<(), ChannelError> {
        self.connect_inner(user_id, false).await
    }

    async fn connect_inner(&self, user_id: u64, via_reconnect: bool) -> Result<(), ChannelError> {
        let epoch = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ConnectionState::Connecting => {
                    debug!("Connection attempt already in progress");
                    return Ok(());
                }
                ConnectionState::Open => {
                    debug!("Channel already open");
                    return Ok(());
                }
                _ => {}
            }
            inner.state = ConnectionState::Connecting;
            inner.identity = Some(user_id);
            inner.epoch
        };

        info!(url = %self.config.server_url, user_id, "Connecting to message server");

        let transport = match self.connector.open(&self.config.server_url).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch && inner.state == ConnectionState::Connecting {
                    inner.teardown();
                    if via_reconnect {
                        self.schedule_reconnect(&mut inner);
                    }
                }
                return Err(e);
            }
        };

        let (mut sink, stream) = transport.split();

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            // disconnect() arrived while the handshake was in flight. The
            // late completion must not resurrect the connection.
            debug!("Discarding stale connection attempt");
            drop(inner);
            sink.close().await;
            return Ok(());
        }

        // Presence announcement goes out before anything queued.
        if let Err(e) = transmit(sink.as_mut(), &Envelope::connect(user_id)).await {
            warn!(error = %e, "Failed to announce presence");
            inner.teardown();
            self.schedule_reconnect(&mut inner);
            return Err(e);
        }

        // Flush everything queued while the channel was down, oldest first.
        while let Some(envelope) = inner.queue.pop_front() {
            if let Err(e) = transmit(sink.as_mut(), &envelope).await {
                warn!(error = %e, remaining = inner.queue.len() + 1, "Flush failed, re-queueing");
                inner.queue.push_front(envelope);
                inner.teardown();
                self.schedule_reconnect(&mut inner);
                return Err(e);
            }
        }

        inner.state = ConnectionState::Open;
        inner.attempts = 0;
        inner.exhausted = false;
        inner.sink = Some(sink);

        let manager = self.clone();
        inner.reader = Some(tokio::spawn(async move {
            manager.reader_loop(stream, epoch).await;
        }));

        if let Some(interval) = self.config.heartbeat_interval() {
            let manager = self.clone();
            inner.heartbeat = Some(tokio::spawn(async move {
                manager.heartbeat_loop(user_id, interval, epoch).await;
            }));
        }

        info!(user_id, "Channel open");
        Ok(())
    }

    /// Send an envelope, or queue it if the channel is not open.
    ///
    /// Validation runs unconditionally; invalid envelopes are rejected
    /// before any queueing or transmission. Queueing while the channel is
    /// down is not an error.
    ///
    /// # Errors
    /// - `ChannelError::Validation` for a structurally invalid envelope
    /// - `ChannelError::Transmission` when the write failed; the envelope
    ///   has been re-queued and the reconnection policy engaged
    pub async fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        envelope.validate()?;

        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Open {
            debug!(state = ?inner.state, queued = inner.queue.len() + 1, "Channel not open, queueing envelope");
            inner.queue.push_back(envelope);
            return Ok(());
        }

        // Take the sink out while writing; the lock is held throughout, so
        // nothing observes the gap.
        let mut sink = match inner.sink.take() {
            Some(sink) => sink,
            None => {
                // Open without a sink cannot normally happen; queue rather
                // than lose the envelope.
                inner.queue.push_back(envelope);
                return Ok(());
            }
        };

        match transmit(sink.as_mut(), &envelope).await {
            Ok(()) => {
                inner.sink = Some(sink);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Write failed on open channel, re-queueing envelope");
                inner.queue.push_front(envelope);
                // A failed write means the connection is dead: treat it as
                // an unexpected close.
                inner.teardown();
                self.schedule_reconnect(&mut inner);
                Err(e)
            }
        }
    }

    /// Register a handler for inbound envelopes.
    ///
    /// Handlers are invoked in registration order, for every decoded
    /// envelope, for the life of the manager. There is no unsubscribe.
    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.inner.lock().await.handlers.push(Arc::new(handler));
    }

    /// Close the channel. Idempotent.
    ///
    /// Cancels any pending reconnect timer, discards any in-flight connect
    /// attempt, closes the transport. The outbound queue is preserved: a
    /// later `connect` flushes whatever was queued.
    pub async fn disconnect(&self) {
        let sink = {
            let mut inner = self.inner.lock().await;
            inner.teardown()
        };
        if let Some(mut sink) = sink {
            sink.close().await;
        }
        info!("Channel disconnected");
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Open
    }

    /// True once the reconnection budget is spent. Cleared by a successful
    /// open (explicit or automatic).
    pub async fn reconnect_exhausted(&self) -> bool {
        self.inner.lock().await.exhausted
    }

    /// Reconnect attempts made since the last successful open.
    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().await.attempts
    }

    /// Envelopes waiting for the channel to open.
    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Schedule a reconnect attempt, or mark the channel exhausted if the
    /// budget is spent. Caller holds the lock and has already torn down.
    fn schedule_reconnect(&self, inner: &mut Inner) {
        let Some(user_id) = inner.identity else {
            return;
        };
        if inner.attempts >= self.config.max_reconnect_attempts {
            if !inner.exhausted {
                warn!(attempts = inner.attempts, "Reconnect attempts exhausted, giving up");
                inner.exhausted = true;
            }
            return;
        }
        inner.attempts += 1;
        info!(
            attempt = inner.attempts,
            max = self.config.max_reconnect_attempts,
            delay_ms = self.config.reconnect_delay_ms,
            "Scheduling reconnect"
        );

        let manager = self.clone();
        let scheduled_epoch = inner.epoch;
        let delay = self.config.reconnect_delay();
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let inner = manager.inner.lock().await;
                if inner.epoch != scheduled_epoch {
                    return; // disconnect() happened in the meantime
                }
            }
            if let Err(e) = manager.connect_inner(user_id, true).await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        }));
    }

    /// Receives inbound frames and fans decoded envelopes out to handlers.
    /// Runs until the connection dies, then engages the reconnection policy
    /// unless the teardown already happened elsewhere.
    async fn reader_loop(self, mut stream: Box<dyn FrameStream>, epoch: u64) {
        debug!("Reader loop started");

        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    let envelope: Envelope = match serde_json::from_str(&frame) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            let err = ChannelError::from(e);
                            warn!(error = %err, "Dropping malformed inbound payload");
                            continue;
                        }
                    };
                    // Snapshot the handler list; invoke outside the lock.
                    let handlers = {
                        let inner = self.inner.lock().await;
                        if inner.epoch != epoch {
                            return;
                        }
                        inner.handlers.clone()
                    };
                    for handler in &handlers {
                        handler(envelope.clone());
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Transport error");
                    break;
                }
                None => {
                    info!("Connection closed by server");
                    break;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return; // already torn down by disconnect() or a write fault
        }
        warn!("Connection closed unexpectedly");
        inner.teardown();
        self.schedule_reconnect(&mut inner);
    }

    /// Transmits liveness probes while the channel is open. A write fault
    /// here is not acted on; the reader loop notices the dead connection.
    async fn heartbeat_loop(self, user_id: u64, interval: std::time::Duration, epoch: u64) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick, skip it

        loop {
            ticker.tick().await;
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.state != ConnectionState::Open {
                return;
            }
            let Some(sink) = inner.sink.as_mut() else {
                return;
            };
            if let Err(e) = transmit(sink.as_mut(), &Envelope::heartbeat(user_id)).await {
                debug!(error = %e, "Heartbeat write failed");
                return;
            }
        }
    }
}

async fn transmit(sink: &mut dyn FrameSink, envelope: &Envelope) -> Result<(), ChannelError> {
    let frame = serde_json::to_string(envelope)
        .map_err(|e| ChannelError::Transmission(format!("Failed to encode envelope: {}", e)))?;
    debug!(frame = %frame, "Transmitting");
    sink.send(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;

    #[tokio::test]
    async fn starts_idle_with_empty_queue() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        assert_eq!(manager.state().await, ConnectionState::Idle);
        assert_eq!(manager.queued_len().await, 0);
        assert!(!manager.is_connected().await);
        assert!(!manager.reconnect_exhausted().await);
    }

    #[tokio::test]
    async fn invalid_envelope_is_rejected_before_queueing() {
        let manager = ConnectionManager::new(ManagerConfig::default());

        let mut envelope = Envelope::private(1, 2, "hi");
        envelope.to_user_id = None;

        let err = manager.send(envelope).await.unwrap_err();
        assert!(matches!(err, ChannelError::Validation(_)));
        assert_eq!(manager.queued_len().await, 0);
    }

    #[tokio::test]
    async fn sends_while_idle_are_queued_in_order() {
        let manager = ConnectionManager::new(ManagerConfig::default());

        for to in [2, 3, 4] {
            manager.send(Envelope::private(1, to, "hi")).await.unwrap();
        }
        assert_eq!(manager.queued_len().await, 3);
        assert_eq!(manager.state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_preserves_queue() {
        let manager = ConnectionManager::new(ManagerConfig::default());
        manager
            .send(Envelope::group(1, 9, "hi all"))
            .await
            .unwrap();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state().await, ConnectionState::Closed);
        assert_eq!(manager.queued_len().await, 1);
    }

    #[test]
    fn heartbeat_envelope_has_no_payload() {
        let beat = Envelope::heartbeat(1);
        assert_eq!(beat.kind, EnvelopeKind::Heartbeat);
        assert!(beat.content.is_none());
        assert!(beat.to_user_id.is_none());
        assert!(beat.group_id.is_none());
    }
}
