//! Realtime streaming session: wire protocol, transport, session state
//! machine, reconnection and voice bridging.

pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod voice;

pub use manager::SessionManager;
pub use protocol::{ClientEvent, FunctionCall, ServerEvent, ToolChoice, ToolDefinition};
pub use session::{
    AssistantSession, ConnectionState, FunctionCallObserver, RealtimeSession, SessionEvent,
};
pub use transport::{Connection, Transport, TransportEvent, WebSocketTransport};
pub use voice::SpeechInterface;
