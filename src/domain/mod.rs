//! Core domain entities: channels, messages, content, responses, and pruning config.

pub mod channel;
pub mod message;
pub mod pruning;

pub use channel::{Channel, ChannelConfig, DestinationConfig, ScriptSet, StorageMode};
pub use message::{Attachment, ConnectorMessage, Maps, Message, MessageContent, Response, ResponseStatus};
pub use pruning::{PruneSettings, PrunerConfig};
