//! Agents on the message bus.

pub mod conversation;
pub mod planning;
pub mod terminal;

pub use conversation::ConversationAgent;
pub use planning::PlanningAgent;
pub use terminal::{CommandExecutor, CommandOutput, ShellExecutor, TerminalAgent};
