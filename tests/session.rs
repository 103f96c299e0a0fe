// tests/session.rs
//
// End-to-end engine tests against a scriptable mock transport. Timer
// behaviour runs under tokio's paused clock for determinism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use canmon::{
    CanId, CanRule, CanSpeed, CanTransport, ComButton, ComMode, ConnectionState, EngineConfig,
    EngineError, EngineEvent, EngineResult, LogChannel, LogTag, MemoryStore, RuleAction,
    SavedTxMessage, SessionController, TransportErrorKind,
};

// ============================================================================
// Mock transport
// ============================================================================

/// Records outbound traffic and fails or stalls on command.
#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<(CanId, Vec<u8>)>>,
    console_sent: Mutex<Vec<Vec<u8>>>,
    fail_open: AtomicBool,
    hang_open: AtomicBool,
    fail_send: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sent_frames(&self) -> Vec<(CanId, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    fn console_writes(&self) -> Vec<Vec<u8>> {
        self.console_sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl CanTransport for MockTransport {
    async fn open(&self, _speed: CanSpeed) -> EngineResult<()> {
        if self.hang_open.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("device refused".into()));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn send_frame(&self, id: CanId, payload: &[u8]) -> EngineResult<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(EngineError::TransmitFailed("bus off".into()));
        }
        self.sent.lock().unwrap().push((id, payload.to_vec()));
        Ok(())
    }

    async fn send_console(&self, bytes: &[u8]) -> EngineResult<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(EngineError::TransmitFailed("port closed".into()));
        }
        self.console_sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
}

fn engine(transport: Arc<MockTransport>) -> SessionController {
    SessionController::new(transport, Arc::new(MemoryStore::new()), EngineConfig::default())
}

fn engine_with_store(
    transport: Arc<MockTransport>,
    store: Arc<MemoryStore>,
) -> SessionController {
    SessionController::new(transport, store, EngineConfig::default())
}

async fn open_engine(transport: &Arc<MockTransport>) -> SessionController {
    let session = engine(Arc::clone(transport));
    session.open(CanSpeed::K500).await.unwrap();
    session
}

fn saved(id_key: &str, id: &str, payload: &[u8], period_ms: u64) -> SavedTxMessage {
    SavedTxMessage {
        id_key: id_key.into(),
        id: CanId::parse(id).unwrap(),
        payload: payload.to_vec(),
        period_ms,
        name: id_key.into(),
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_open_close_cycle() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));

    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
    session.open(CanSpeed::K500).await.unwrap();
    assert_eq!(session.connection_state().await, ConnectionState::Connected);
    assert_eq!(session.speed().await.kbps(), 500);

    session.close().await.unwrap();
    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
    assert!(transport.closed.load(Ordering::SeqCst));

    // close is idempotent
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_open_while_connected_rejected() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    let err = session.open(CanSpeed::K125).await;
    assert_eq!(err, Err(EngineError::SpeedChangeRejected));
    // Speed unchanged by the rejected call.
    assert_eq!(session.speed().await.kbps(), 500);
}

#[tokio::test]
async fn test_change_speed_rejected_while_open() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    assert_eq!(
        session.change_speed(CanSpeed::K250).await,
        Err(EngineError::SpeedChangeRejected)
    );

    session.close().await.unwrap();
    session.change_speed(CanSpeed::K250).await.unwrap();
    assert_eq!(session.speed().await.kbps(), 250);
}

#[tokio::test]
async fn test_open_failure_returns_to_disconnected() {
    let transport = MockTransport::new();
    transport.fail_open.store(true, Ordering::SeqCst);
    let session = engine(Arc::clone(&transport));

    assert!(session.open(CanSpeed::K500).await.is_err());
    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_open_timeout() {
    let transport = MockTransport::new();
    transport.hang_open.store(true, Ordering::SeqCst);
    let session = engine(Arc::clone(&transport));

    let err = session.open(CanSpeed::K500).await;
    assert_eq!(err, Err(EngineError::OpenTimeout));
    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connection_events_emitted() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));
    let mut events = session.subscribe();

    session.open(CanSpeed::K500).await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Connecting
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        EngineEvent::ConnectionStateChanged {
            state: ConnectionState::Connected
        }
    );
}

// ============================================================================
// Frame ingestion
// ============================================================================

#[tokio::test]
async fn test_frame_table_scenario() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    session.on_frame_received("0x100", vec![1, 2, 3]).await.unwrap();
    let snap = session.frame_snapshot().await;
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].id.canonical(), "0x100");
    assert_eq!(snap[0].count, 1);
    assert_eq!(snap[0].payload, vec![1, 2, 3]);

    session.on_frame_received("0x100", vec![9]).await.unwrap();
    let snap = session.frame_snapshot().await;
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].count, 2);
    assert_eq!(snap[0].payload, vec![9]);
}

#[tokio::test]
async fn test_frames_survive_disconnect_and_reopen() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    session.on_frame_received("0x100", vec![1]).await.unwrap();
    session.close().await.unwrap();

    // Table intact for postmortem inspection.
    assert_eq!(session.frame_snapshot().await.len(), 1);

    // Reopening does not implicitly clear history.
    session.open(CanSpeed::K500).await.unwrap();
    assert_eq!(session.frame_snapshot().await.len(), 1);

    session.clear_frames().await;
    assert!(session.frame_snapshot().await.is_empty());
}

#[tokio::test]
async fn test_frame_ingestion_writes_bus_log() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    session.on_frame_received("0x1A0", vec![0xDE, 0xAD]).await.unwrap();

    let logs = session.logs(LogChannel::Bus).await;
    let rx_line = logs.iter().find(|l| l.tag == LogTag::Rx).unwrap();
    assert!(rx_line.text.contains("0x1A0"));
    assert!(rx_line.text.contains("DE AD"));
}

#[tokio::test]
async fn test_bad_identifier_rejected() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    assert!(session.on_frame_received("zz", vec![]).await.is_err());
    assert!(session.on_frame_received("0x100", vec![0; 9]).await.is_err());
    assert!(session.frame_snapshot().await.is_empty());
}

// ============================================================================
// Transmit and logs
// ============================================================================

#[tokio::test]
async fn test_transmit_requires_connection() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));

    let err = session.transmit(CanId::parse("0x100").unwrap(), &[1]).await;
    assert_eq!(err, Err(EngineError::NotConnected));
    assert!(transport.sent_frames().is_empty());
}

#[tokio::test]
async fn test_transmit_logs_tx_line() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    session
        .transmit(CanId::parse("0x7FF").unwrap(), &[0xAA])
        .await
        .unwrap();

    assert_eq!(transport.sent_frames(), vec![(CanId::parse("0x7FF").unwrap(), vec![0xAA])]);
    let lines = session.log_lines(LogChannel::Bus).await;
    assert!(lines.iter().any(|l| l.contains("TX →") && l.contains("0x7FF")));
}

#[tokio::test]
async fn test_failed_transmit_logged_with_error_marker() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    transport.fail_send.store(true, Ordering::SeqCst);

    let err = session.transmit(CanId::parse("0x100").unwrap(), &[1]).await;
    assert!(matches!(err, Err(EngineError::TransmitFailed(_))));

    let logs = session.logs(LogChannel::Bus).await;
    assert!(logs.iter().any(|l| l.tag == LogTag::Error));
}

#[tokio::test]
async fn test_log_pause_drops_new_lines() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    session.on_frame_received("0x100", vec![1]).await.unwrap();
    let before = session.logs(LogChannel::Bus).await.len();

    session.set_log_paused(LogChannel::Bus, true).await;
    session.on_frame_received("0x200", vec![2]).await.unwrap();
    session.on_frame_received("0x300", vec![3]).await.unwrap();
    session.set_log_paused(LogChannel::Bus, false).await;

    // Paused lines are gone, not queued; the table still counted them.
    assert_eq!(session.logs(LogChannel::Bus).await.len(), before);
    assert_eq!(session.frame_snapshot().await.len(), 3);
}

#[tokio::test]
async fn test_import_logs_replaces_bus_log() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;

    session.on_frame_received("0x100", vec![1]).await.unwrap();
    session
        .import_logs(vec!["line one".into(), "line two".into()])
        .await;

    let logs = session.logs(LogChannel::Bus).await;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].text, "line one");
    assert_eq!(logs[1].tag, LogTag::Note);
}

// ============================================================================
// Periodic transmit through the session
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_toggle_periodic_tx_fires_on_schedule() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session.save_tx_message(saved("hb", "0x123", &[1, 2], 100)).await.unwrap();

    assert!(session.toggle_periodic_tx("hb").await.unwrap());
    assert_eq!(session.active_tx_ids(), vec!["hb".to_string()]);

    tokio::time::sleep(Duration::from_millis(550)).await;
    let fired = transport.sent_frames().len();
    assert!((4..=6).contains(&fired), "fired {} times", fired);

    assert!(!session.toggle_periodic_tx("hb").await.unwrap());
    assert!(session.active_tx_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_active_jobs() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session.save_tx_message(saved("a", "0x100", &[1], 100)).await.unwrap();

    session.toggle_periodic_tx("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    session.close().await.unwrap();

    assert!(!session.is_tx_active("a"));
    let at_close = transport.sent_frames().len();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(transport.sent_frames().len(), at_close);
}

#[tokio::test(start_paused = true)]
async fn test_deactivate_within_first_period_transmits_nothing() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session.save_tx_message(saved("a", "0x100", &[1], 100)).await.unwrap();

    session.toggle_periodic_tx("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.toggle_periodic_tx("a").await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(transport.sent_frames().is_empty());
}

#[tokio::test]
async fn test_one_shot_message_transmits_once() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session.save_tx_message(saved("once", "0x100", &[7], 0)).await.unwrap();

    assert!(!session.toggle_periodic_tx("once").await.unwrap());
    assert_eq!(transport.sent_frames().len(), 1);
    assert!(!session.is_tx_active("once"));
}

#[tokio::test(start_paused = true)]
async fn test_transmit_failure_does_not_deactivate_job() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session.save_tx_message(saved("a", "0x100", &[1], 100)).await.unwrap();

    session.toggle_periodic_tx("a").await.unwrap();
    transport.fail_send.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(350)).await;

    // Still active and retrying; failures carry error markers in the log.
    assert!(session.is_tx_active("a"));
    let logs = session.logs(LogChannel::Bus).await;
    assert!(logs.iter().any(|l| l.tag == LogTag::Error));

    // Transport recovers; the same job starts landing frames again.
    transport.fail_send.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(!transport.sent_frames().is_empty());

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_toggle_unknown_message_fails() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    assert!(session.toggle_periodic_tx("ghost").await.is_err());
}

#[tokio::test]
async fn test_toggle_requires_connection() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));
    session.save_tx_message(saved("a", "0x100", &[1], 100)).await.unwrap();

    assert_eq!(
        session.toggle_periodic_tx("a").await,
        Err(EngineError::NotConnected)
    );
}

// ============================================================================
// Transport errors
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transport_error_disconnects_and_cancels_jobs() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session.save_tx_message(saved("a", "0x100", &[1], 100)).await.unwrap();
    session.toggle_periodic_tx("a").await.unwrap();

    let mut events = session.subscribe();
    session
        .on_transport_error(TransportErrorKind::ConnectionLost)
        .await;

    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);
    assert!(session.active_tx_ids().is_empty());

    // Surfaced as events, not errors.
    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (EngineEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
            })
        {
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);
}

// ============================================================================
// Rules
// ============================================================================

fn reply_rule(id: &str, match_id: &str, reply_id: &str, reply: &[u8]) -> CanRule {
    CanRule {
        id: id.into(),
        name: String::new(),
        match_id: CanId::parse(match_id).unwrap(),
        payload: None,
        mask: None,
        exclusive: true,
        action: RuleAction::TransmitResponse {
            id: CanId::parse(reply_id).unwrap(),
            payload: reply.to_vec(),
        },
    }
}

#[tokio::test]
async fn test_rule_auto_reply() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session
        .update_rules(vec![reply_rule("r0", "0x100", "0x200", &[0xBE, 0xEF])])
        .await
        .unwrap();

    session.on_frame_received("0x100", vec![1]).await.unwrap();

    assert_eq!(
        transport.sent_frames(),
        vec![(CanId::parse("0x200").unwrap(), vec![0xBE, 0xEF])]
    );
}

#[tokio::test]
async fn test_rule_annotation_lands_in_bus_log() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session
        .update_rules(vec![CanRule {
            id: "r0".into(),
            name: String::new(),
            match_id: CanId::parse("0x100").unwrap(),
            payload: None,
            mask: None,
            exclusive: true,
            action: RuleAction::AnnotateLog {
                text: "door opened".into(),
            },
        }])
        .await
        .unwrap();

    session.on_frame_received("0x100", vec![]).await.unwrap();

    let logs = session.logs(LogChannel::Bus).await;
    assert!(logs.iter().any(|l| l.tag == LogTag::Note && l.text == "door opened"));
}

#[tokio::test]
async fn test_invalid_rule_list_rejected_atomically() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session
        .update_rules(vec![reply_rule("keep", "0x100", "0x200", &[1])])
        .await
        .unwrap();

    let mut bad = reply_rule("bad", "0x300", "0x400", &[1]);
    bad.mask = Some(vec![0xFF]); // mask without payload
    let result = session
        .update_rules(vec![reply_rule("ok", "0x500", "0x600", &[1]), bad])
        .await;

    assert!(matches!(result, Err(EngineError::InvalidRule { .. })));
    let rules = session.rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, "keep");
}

#[tokio::test]
async fn test_rules_reload_from_store() {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    {
        let session = engine_with_store(Arc::clone(&transport), Arc::clone(&store));
        session
            .update_rules(vec![reply_rule("r0", "0x100", "0x200", &[1])])
            .await
            .unwrap();
    }

    // A fresh session picks up the persisted rule list.
    let session = engine_with_store(Arc::clone(&transport), store);
    assert_eq!(session.rules().await.len(), 1);
}

// ============================================================================
// Console channel
// ============================================================================

#[tokio::test]
async fn test_send_command_independent_of_can_state() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));

    // CAN bus never opened; the console still works.
    session.send_command("ATZ").await.unwrap();

    assert_eq!(transport.console_writes(), vec![b"ATZ\r\n".to_vec()]);
    let lines = session.log_lines(LogChannel::Console).await;
    assert!(lines.iter().any(|l| l.contains("TX →") && l.contains("ATZ")));
}

#[tokio::test]
async fn test_console_rx_splits_lines() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));

    session.on_console_bytes_received(b"OK\r\nREA").await;
    session.on_console_bytes_received(b"DY\r\n").await;

    let logs = session.logs(LogChannel::Console).await;
    let texts: Vec<&str> = logs.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, vec!["OK", "READY"]);
}

#[tokio::test(start_paused = true)]
async fn test_com_button_repeats() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));
    let buttons = session
        .update_com_buttons(vec![ComButton {
            id: String::new(),
            name: "poll".into(),
            command: "01 02".into(),
            mode: ComMode::Hex,
            repeat_count: 3,
            repeat_period_ms: 100,
        }])
        .unwrap();

    session.press_com_button(&buttons[0].id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    let writes = transport.console_writes();
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|w| w == &vec![0x01, 0x02]));
}

#[tokio::test]
async fn test_invalid_com_button_rejected() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));

    let result = session.update_com_buttons(vec![ComButton {
        id: String::new(),
        name: "bad".into(),
        command: "not hex".into(),
        mode: ComMode::Hex,
        repeat_count: 1,
        repeat_period_ms: 0,
    }]);
    assert!(matches!(result, Err(EngineError::InvalidCommand(_))));
}

#[tokio::test]
async fn test_clear_com_logs() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));

    session.send_command("AT").await.unwrap();
    session.clear_com_logs().await;
    assert!(session.logs(LogChannel::Console).await.is_empty());
}

// ============================================================================
// Saved message persistence
// ============================================================================

#[tokio::test]
async fn test_save_generates_id_key_and_persists() {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let session = engine_with_store(Arc::clone(&transport), Arc::clone(&store));

    let mut msg = saved("", "0x100", &[1], 50);
    msg.id_key = String::new();
    let stored = session.save_tx_message(msg).await.unwrap();
    assert!(!stored.id_key.is_empty());

    // Visible to a fresh session over the same store.
    let session2 = engine_with_store(Arc::clone(&transport), store);
    let list = session2.saved_tx_messages().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id_key, stored.id_key);
}

#[tokio::test(start_paused = true)]
async fn test_delete_saved_tx_stops_active_job() {
    let transport = MockTransport::new();
    let session = open_engine(&transport).await;
    session.save_tx_message(saved("a", "0x100", &[1], 100)).await.unwrap();
    session.toggle_periodic_tx("a").await.unwrap();

    session.delete_saved_tx("a").await.unwrap();

    assert!(!session.is_tx_active("a"));
    assert!(session.saved_tx_messages().unwrap().is_empty());
    let at_delete = transport.sent_frames().len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.sent_frames().len(), at_delete);
}

#[tokio::test]
async fn test_import_tx_messages_replaces_list() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));
    session.save_tx_message(saved("old", "0x100", &[1], 0)).await.unwrap();

    let imported = session
        .import_tx_messages(vec![
            saved("n1", "0x200", &[2], 100),
            saved("n2", "0x300", &[3], 0),
        ])
        .await
        .unwrap();

    assert_eq!(imported.len(), 2);
    let keys: Vec<String> = session
        .saved_tx_messages()
        .unwrap()
        .into_iter()
        .map(|m| m.id_key)
        .collect();
    assert_eq!(keys, vec!["n1".to_string(), "n2".to_string()]);
}

#[tokio::test]
async fn test_import_rejects_oversized_payload() {
    let transport = MockTransport::new();
    let session = engine(Arc::clone(&transport));

    let mut bad = saved("b", "0x100", &[0; 8], 0);
    bad.payload = vec![0; 9];
    assert!(session.import_tx_messages(vec![bad]).await.is_err());
    assert!(session.saved_tx_messages().unwrap().is_empty());
}
