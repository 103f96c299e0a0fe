// src/session.rs
//
// Top-level session façade. Owns the frame table, both log rings, the rule
// engine and the transmit scheduler; talks to the injected transport and
// key-value store. All bus-side mutation funnels through one mutex so frame
// ingestion, timer fires and commands never interleave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::console::{encode_command, validate_button, ComButton, ComMode, LineSplitter};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::frame::{payload_hex, CanId, Direction, Frame, FrameTable, FrameTableEntry};
use crate::logbuf::{LogBuffer, LogChannel, LogLine, LogTag};
use crate::rules::{CanRule, RuleAction, RuleEngine};
use crate::store::{load_list, save_list, KvStore, KEY_COM_BUTTONS, KEY_RULES, KEY_TX_MESSAGES};
use crate::transport::{CanSpeed, CanTransport, ConnectionState, TransportErrorKind};
use crate::tx::{validate_message, SavedTxMessage, TxScheduler, TxSink};

// ============================================================================
// Shared state
// ============================================================================

/// Everything guarded by the session mutex. One instance per session.
struct EngineState {
    connection: ConnectionState,
    speed: CanSpeed,
    frames: FrameTable,
    bus_log: LogBuffer,
    console_log: LogBuffer,
    rules: RuleEngine,
    console_splitter: LineSplitter,
}

/// Shared core behind the façade. Job tasks and console repeats hold an
/// `Arc` to this; it is also the scheduler's `TxSink`.
struct SessionShared {
    config: EngineConfig,
    transport: Arc<dyn CanTransport>,
    store: Arc<dyn KvStore>,
    events: EventBus,
    scheduler: TxScheduler,
    state: Mutex<EngineState>,
}

impl SessionShared {
    /// Transmit on the bus while already holding the state lock. Writes the
    /// TX log line on success and an error-marked line on failure; never
    /// touches the frame table.
    async fn transmit_locked(
        &self,
        state: &mut EngineState,
        id: CanId,
        payload: &[u8],
    ) -> EngineResult<()> {
        if state.connection != ConnectionState::Connected {
            return Err(EngineError::NotConnected);
        }

        match self.transport.send_frame(id, payload).await {
            Ok(()) => {
                state
                    .bus_log
                    .append(LogLine::new(LogTag::Tx, format!("{} {}", id, payload_hex(payload))));
                self.events.emit(EngineEvent::LogAppended {
                    channel: LogChannel::Bus,
                });
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                state.bus_log.append(LogLine::new(
                    LogTag::Error,
                    format!("{} transmit failed: {}", id, detail),
                ));
                self.events.emit(EngineEvent::LogAppended {
                    channel: LogChannel::Bus,
                });
                Err(EngineError::TransmitFailed(detail))
            }
        }
    }

    /// Write bytes to the console channel and log the outbound line.
    /// The console has its own connection state inside the transport, so
    /// there is no CAN-side gate here.
    async fn console_send(&self, bytes: &[u8], label: &str) -> EngineResult<()> {
        match self.transport.send_console(bytes).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state
                    .console_log
                    .append(LogLine::new(LogTag::Tx, label.to_string()));
                drop(state);
                self.events.emit(EngineEvent::LogAppended {
                    channel: LogChannel::Console,
                });
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                let mut state = self.state.lock().await;
                state.console_log.append(LogLine::new(
                    LogTag::Error,
                    format!("{} send failed: {}", label, detail),
                ));
                drop(state);
                self.events.emit(EngineEvent::LogAppended {
                    channel: LogChannel::Console,
                });
                Err(EngineError::TransmitFailed(detail))
            }
        }
    }
}

#[async_trait]
impl TxSink for SessionShared {
    async fn job_transmit(&self, id: CanId, payload: &[u8]) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        self.transmit_locked(&mut state, id, payload).await
    }
}

// ============================================================================
// SessionController
// ============================================================================

/// The engine's command API and state exposure. Exactly one instance is
/// live per session; the UI subscribes to change events and re-reads
/// snapshots.
pub struct SessionController {
    inner: Arc<SessionShared>,
}

impl SessionController {
    pub fn new(
        transport: Arc<dyn CanTransport>,
        store: Arc<dyn KvStore>,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);

        // Preload the persisted rule list; a corrupt or invalid list starts
        // the session with no rules rather than refusing to start.
        let mut rules = RuleEngine::new();
        match load_list::<CanRule>(store.as_ref(), KEY_RULES) {
            Ok(list) => {
                if let Err(e) = rules.set_rules(list) {
                    tracing::warn!(error = %e, "stored rule list invalid, starting empty");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load stored rules"),
        }

        let state = EngineState {
            connection: ConnectionState::Disconnected,
            speed: CanSpeed::K500,
            frames: FrameTable::new(),
            bus_log: LogBuffer::new(config.bus_log_capacity),
            console_log: LogBuffer::new(config.console_log_capacity),
            rules,
            console_splitter: LineSplitter::new(),
        };

        SessionController {
            inner: Arc::new(SessionShared {
                scheduler: TxScheduler::new(events.clone()),
                config,
                transport,
                store,
                events,
                state: Mutex::new(state),
            }),
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open the CAN side at the given bit rate.
    ///
    /// Rejected while the bus is open or opening (speed is immutable while
    /// running). The Connecting phase is bounded by the configured open
    /// timeout. Opening does not clear frame history — clearing is a
    /// distinct user action.
    pub async fn open(&self, speed: CanSpeed) -> EngineResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            if state.connection != ConnectionState::Disconnected {
                return Err(EngineError::SpeedChangeRejected);
            }
            state.connection = ConnectionState::Connecting;
            state.speed = speed;
        }
        self.inner.events.emit(EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Connecting,
        });
        tracing::info!(%speed, "opening CAN bus");

        let timeout = Duration::from_millis(self.inner.config.open_timeout_ms);
        let opened = tokio::time::timeout(timeout, self.inner.transport.open(speed)).await;

        let mut state = self.inner.state.lock().await;
        match opened {
            Ok(Ok(())) => {
                if state.connection != ConnectionState::Connecting {
                    // close() raced the open; roll the transport back.
                    drop(state);
                    self.inner.transport.close().await;
                    return Err(EngineError::NotConnected);
                }
                state.connection = ConnectionState::Connected;
                state
                    .bus_log
                    .append(LogLine::new(LogTag::Note, format!("bus open at {}", speed)));
                drop(state);
                self.inner.events.emit(EngineEvent::ConnectionStateChanged {
                    state: ConnectionState::Connected,
                });
                self.inner.events.emit(EngineEvent::LogAppended {
                    channel: LogChannel::Bus,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                state.connection = ConnectionState::Disconnected;
                state.bus_log.append(LogLine::new(
                    LogTag::Error,
                    format!("open failed: {}", e),
                ));
                drop(state);
                self.inner.events.emit(EngineEvent::ConnectionStateChanged {
                    state: ConnectionState::Disconnected,
                });
                self.inner.events.emit(EngineEvent::LogAppended {
                    channel: LogChannel::Bus,
                });
                Err(e)
            }
            Err(_) => {
                state.connection = ConnectionState::Disconnected;
                state
                    .bus_log
                    .append(LogLine::new(LogTag::Error, "open timed out".to_string()));
                drop(state);
                self.inner.events.emit(EngineEvent::ConnectionStateChanged {
                    state: ConnectionState::Disconnected,
                });
                self.inner.events.emit(EngineEvent::LogAppended {
                    channel: LogChannel::Bus,
                });
                self.inner.transport.close().await;
                Err(EngineError::OpenTimeout)
            }
        }
    }

    /// Close the CAN side. Idempotent. Cancels every periodic transmit job
    /// (no fire is observed after this returns) and leaves the frame table
    /// intact for postmortem inspection.
    pub async fn close(&self) -> EngineResult<()> {
        let was_disconnected = {
            let mut state = self.inner.state.lock().await;
            let was = state.connection == ConnectionState::Disconnected;
            if !was {
                state.connection = ConnectionState::Disconnected;
                state
                    .bus_log
                    .append(LogLine::new(LogTag::Note, "bus closed".to_string()));
            }
            was
        };

        if !was_disconnected {
            self.inner.events.emit(EngineEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
            });
            self.inner.events.emit(EngineEvent::LogAppended {
                channel: LogChannel::Bus,
            });
        }

        // Jobs first, transport second: a fire that slips in sees the
        // Disconnected state and is refused before the link goes away.
        self.inner.scheduler.cancel_all().await;
        self.inner.transport.close().await;
        tracing::info!("CAN bus closed");
        Ok(())
    }

    /// Select the bit rate for the next open. Rejected while the bus is
    /// open, mirroring the disabled speed buttons in the monitor UI.
    pub async fn change_speed(&self, speed: CanSpeed) -> EngineResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.connection != ConnectionState::Disconnected {
            return Err(EngineError::SpeedChangeRejected);
        }
        state.speed = speed;
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().await.connection
    }

    pub async fn speed(&self) -> CanSpeed {
        self.inner.state.lock().await.speed
    }

    // ========================================================================
    // Inbound (called by the transport)
    // ========================================================================

    /// Ingest one bus frame: frame table, bus log, rule evaluation. The
    /// whole fan-out runs under the session mutex, so it completes before
    /// the next frame or timer fire is processed.
    pub async fn on_frame_received(&self, id: &str, payload: Vec<u8>) -> EngineResult<()> {
        let frame = Frame::new(CanId::parse(id)?, payload, Direction::Rx)?;

        let mut state = self.inner.state.lock().await;
        state.frames.update(&frame);
        state.bus_log.append(LogLine::new(
            LogTag::Rx,
            format!("{} {}", frame.id, frame.payload_hex()),
        ));

        for action in state.rules.evaluate(&frame) {
            match action {
                RuleAction::AnnotateLog { text } => {
                    state.bus_log.append(LogLine::new(LogTag::Note, text));
                }
                RuleAction::TransmitResponse { id, payload } => {
                    // Failure is already logged by the transmit path; an
                    // auto-reply must not fail frame ingestion.
                    let _ = self
                        .inner
                        .transmit_locked(&mut state, id, &payload)
                        .await;
                }
            }
        }
        drop(state);

        self.inner.events.emit(EngineEvent::FrameTableChanged);
        self.inner.events.emit(EngineEvent::LogAppended {
            channel: LogChannel::Bus,
        });
        Ok(())
    }

    /// Ingest inbound console bytes. Whole lines land in the console log;
    /// a trailing partial line waits for its newline.
    pub async fn on_console_bytes_received(&self, bytes: &[u8]) {
        let mut state = self.inner.state.lock().await;
        let lines = state.console_splitter.push(bytes);
        if lines.is_empty() {
            return;
        }
        for line in lines {
            state.console_log.append(LogLine::new(LogTag::Rx, line));
        }
        drop(state);
        self.inner.events.emit(EngineEvent::LogAppended {
            channel: LogChannel::Console,
        });
    }

    /// Asynchronous transport failure: forced transition to Disconnected
    /// plus mass job cancellation, surfaced as a state-change event rather
    /// than an error.
    pub async fn on_transport_error(&self, kind: TransportErrorKind) {
        tracing::warn!(%kind, "transport error");
        let was_connected = {
            let mut state = self.inner.state.lock().await;
            let was = state.connection != ConnectionState::Disconnected;
            state.connection = ConnectionState::Disconnected;
            state.bus_log.append(LogLine::new(
                LogTag::Error,
                format!("transport error: {}", kind),
            ));
            was
        };

        self.inner.events.emit(EngineEvent::LogAppended {
            channel: LogChannel::Bus,
        });
        if was_connected {
            self.inner.events.emit(EngineEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
            });
        }
        self.inner.scheduler.cancel_all().await;
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Manual one-off transmit. Fails with NotConnected while the bus is
    /// closed; logs the outbound line on success.
    pub async fn transmit(&self, id: CanId, payload: &[u8]) -> EngineResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.transmit_locked(&mut state, id, payload).await
    }

    /// Send a text command on the console channel (CRLF appended).
    /// Independent of CAN connection state.
    pub async fn send_command(&self, text: &str) -> EngineResult<()> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidCommand("empty command".into()));
        }
        let bytes = encode_command(text, ComMode::Text)?;
        self.inner.console_send(&bytes, text).await
    }

    /// Send raw bytes on the console channel.
    pub async fn send_console(&self, bytes: &[u8]) -> EngineResult<()> {
        let label = payload_hex(bytes);
        self.inner.console_send(bytes, &label).await
    }

    // ========================================================================
    // Periodic transmit
    // ========================================================================

    /// Flip the periodic transmission of a saved message. Returns whether
    /// the message is active after the call (one-shot messages transmit
    /// once and stay inactive).
    pub async fn toggle_periodic_tx(&self, id_key: &str) -> EngineResult<bool> {
        if self.inner.scheduler.is_active(id_key) {
            self.inner.scheduler.deactivate(id_key).await;
            return Ok(false);
        }

        let msg = self
            .saved_tx_messages()?
            .into_iter()
            .find(|m| m.id_key == id_key)
            .ok_or_else(|| {
                EngineError::InvalidMessage(format!("unknown saved message '{}'", id_key))
            })?;

        // Activating a dead-bus job would only log a failure per tick.
        if self.connection_state().await != ConnectionState::Connected {
            return Err(EngineError::NotConnected);
        }

        let sink: Arc<dyn TxSink> = Arc::clone(&self.inner) as Arc<dyn TxSink>;
        self.inner.scheduler.activate(&msg, sink).await?;
        Ok(self.inner.scheduler.is_active(id_key))
    }

    pub fn is_tx_active(&self, id_key: &str) -> bool {
        self.inner.scheduler.is_active(id_key)
    }

    /// The id_key set the UI renders as `activeTxIds`.
    pub fn active_tx_ids(&self) -> Vec<String> {
        self.inner.scheduler.active_ids()
    }

    // ========================================================================
    // Saved transmit messages (persisted)
    // ========================================================================

    pub fn saved_tx_messages(&self) -> EngineResult<Vec<SavedTxMessage>> {
        load_list(self.inner.store.as_ref(), KEY_TX_MESSAGES)
    }

    /// Create or update a saved message. A message saved without an id_key
    /// gets a generated one. Editing a message with a live job deactivates
    /// the job first so a stale definition can never keep transmitting.
    pub async fn save_tx_message(&self, mut msg: SavedTxMessage) -> EngineResult<SavedTxMessage> {
        validate_message(&msg)?;

        if msg.id_key.is_empty() {
            msg.id_key = Uuid::new_v4().to_string();
        } else {
            self.inner.scheduler.deactivate(&msg.id_key).await;
        }

        let mut list = self.saved_tx_messages()?;
        match list.iter_mut().find(|m| m.id_key == msg.id_key) {
            Some(existing) => *existing = msg.clone(),
            None => list.push(msg.clone()),
        }
        save_list(self.inner.store.as_ref(), KEY_TX_MESSAGES, &list);
        Ok(msg)
    }

    /// Delete a saved message, stopping its job if one is running.
    pub async fn delete_saved_tx(&self, id_key: &str) -> EngineResult<()> {
        self.inner.scheduler.deactivate(id_key).await;
        let mut list = self.saved_tx_messages()?;
        list.retain(|m| m.id_key != id_key);
        save_list(self.inner.store.as_ref(), KEY_TX_MESSAGES, &list);
        Ok(())
    }

    /// Replace the whole saved-message list (file import). All-or-nothing:
    /// the first invalid entry rejects the import. Messages imported
    /// without an id_key get generated ones.
    pub async fn import_tx_messages(
        &self,
        mut list: Vec<SavedTxMessage>,
    ) -> EngineResult<Vec<SavedTxMessage>> {
        for msg in &mut list {
            validate_message(msg)?;
            if msg.id_key.is_empty() {
                msg.id_key = Uuid::new_v4().to_string();
            }
        }

        // The whole list is replaced, so every running job now references a
        // stale definition. Stop them all; the caller re-toggles as needed.
        for id_key in self.inner.scheduler.active_ids() {
            self.inner.scheduler.deactivate(&id_key).await;
        }

        save_list(self.inner.store.as_ref(), KEY_TX_MESSAGES, &list);
        Ok(list)
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Replace the rule list. Validation is atomic — an invalid rule
    /// rejects the whole incoming list and the previous rules stay live.
    pub async fn update_rules(&self, rules: Vec<CanRule>) -> EngineResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            state.rules.set_rules(rules.clone())?;
        }
        save_list(self.inner.store.as_ref(), KEY_RULES, &rules);
        Ok(())
    }

    pub async fn rules(&self) -> Vec<CanRule> {
        self.inner.state.lock().await.rules.rules().to_vec()
    }

    // ========================================================================
    // COM buttons
    // ========================================================================

    pub fn com_buttons(&self) -> EngineResult<Vec<ComButton>> {
        load_list(self.inner.store.as_ref(), KEY_COM_BUTTONS)
    }

    /// Replace the button list. Every definition is revalidated; buttons
    /// without an id get generated ones.
    pub fn update_com_buttons(&self, mut buttons: Vec<ComButton>) -> EngineResult<Vec<ComButton>> {
        for button in &mut buttons {
            if button.id.is_empty() {
                button.id = Uuid::new_v4().to_string();
            }
            validate_button(button)?;
        }
        save_list(self.inner.store.as_ref(), KEY_COM_BUTTONS, &buttons);
        Ok(buttons)
    }

    /// Fire a button: one immediate send, then repeat_count-1 further sends
    /// at repeat_period intervals in the background.
    pub async fn press_com_button(&self, button_id: &str) -> EngineResult<()> {
        let button = self
            .com_buttons()?
            .into_iter()
            .find(|b| b.id == button_id)
            .ok_or_else(|| {
                EngineError::InvalidCommand(format!("unknown COM button '{}'", button_id))
            })?;

        let bytes = encode_command(&button.command, button.mode)?;
        self.inner.console_send(&bytes, &button.command).await?;

        if button.repeat_count > 1 {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                for _ in 1..button.repeat_count {
                    tokio::time::sleep(Duration::from_millis(button.repeat_period_ms)).await;
                    if inner.console_send(&bytes, &button.command).await.is_err() {
                        // Console went away; no point hammering it.
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    // ========================================================================
    // Snapshots and log management
    // ========================================================================

    /// Sorted defensive copy of the frame table.
    pub async fn frame_snapshot(&self) -> Vec<FrameTableEntry> {
        self.inner.state.lock().await.frames.snapshot()
    }

    /// Drop all frame history. Distinct user action; never implied by open.
    pub async fn clear_frames(&self) {
        self.inner.state.lock().await.frames.clear();
        self.inner.events.emit(EngineEvent::FrameTableChanged);
    }

    pub async fn logs(&self, channel: LogChannel) -> Vec<LogLine> {
        let state = self.inner.state.lock().await;
        match channel {
            LogChannel::Bus => state.bus_log.snapshot(),
            LogChannel::Console => state.console_log.snapshot(),
        }
    }

    /// Rendered log lines, the strings the UI displays.
    pub async fn log_lines(&self, channel: LogChannel) -> Vec<String> {
        self.logs(channel).await.iter().map(LogLine::display).collect()
    }

    pub async fn clear_logs(&self) {
        self.inner.state.lock().await.bus_log.clear();
        self.inner.events.emit(EngineEvent::LogAppended {
            channel: LogChannel::Bus,
        });
    }

    pub async fn clear_com_logs(&self) {
        let mut state = self.inner.state.lock().await;
        state.console_log.clear();
        state.console_splitter.reset();
        drop(state);
        self.inner.events.emit(EngineEvent::LogAppended {
            channel: LogChannel::Console,
        });
    }

    /// Pause or resume ingestion on a log channel. Lines arriving while
    /// paused are dropped, not queued.
    pub async fn set_log_paused(&self, channel: LogChannel, paused: bool) {
        let mut state = self.inner.state.lock().await;
        match channel {
            LogChannel::Bus => state.bus_log.set_paused(paused),
            LogChannel::Console => state.console_log.set_paused(paused),
        }
    }

    pub async fn is_log_paused(&self, channel: LogChannel) -> bool {
        let state = self.inner.state.lock().await;
        match channel {
            LogChannel::Bus => state.bus_log.is_paused(),
            LogChannel::Console => state.console_log.is_paused(),
        }
    }

    /// Replace the bus log with externally captured lines.
    pub async fn import_logs(&self, lines: Vec<String>) {
        self.inner.state.lock().await.bus_log.import_lines(lines);
        self.inner.events.emit(EngineEvent::LogAppended {
            channel: LogChannel::Bus,
        });
    }
}
