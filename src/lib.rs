// src/lib.rs
//
// CAN bus session engine. Ingests a stream of bus frames into a
// deduplicated per-identifier table, drives independently scheduled
// periodic transmissions, evaluates trigger rules against inbound traffic,
// and keeps bounded pausable logs for the bus and the COM console. The
// physical transport, persistence and all rendering are injected
// collaborators — see `CanTransport` and `KvStore`.

mod config;
mod console;
mod error;
mod events;
mod frame;
mod logbuf;
mod rules;
mod session;
mod store;
mod transport;
mod tx;

pub use config::EngineConfig;
pub use console::{ComButton, ComMode, LineSplitter};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus};
pub use frame::{
    now_us, payload_hex, CanId, Direction, Frame, FrameTable, FrameTableEntry, MAX_PAYLOAD_LEN,
};
pub use logbuf::{LogBuffer, LogChannel, LogLine, LogTag, DEFAULT_LOG_CAPACITY};
pub use rules::{CanRule, RuleAction, RuleEngine};
pub use session::SessionController;
pub use store::{KvStore, MemoryStore, KEY_COM_BUTTONS, KEY_RULES, KEY_TX_MESSAGES};
pub use transport::{CanSpeed, CanTransport, ConnectionState, TransportErrorKind};
pub use tx::{SavedTxMessage, TxScheduler, TxSink};
