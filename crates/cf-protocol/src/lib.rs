//! cf-protocol: Wire protocol for the cluster fabric
//!
//! Two layers are defined here. The tunnel layer frames control messages and
//! virtual channel traffic over one physical connection per site. The session
//! layer is carried inside a single channel (or a direct node connection) and
//! drives one participant's attachment to an interactive session.

pub mod channel;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod presence;
pub mod terminal;

pub use channel::ChannelId;
pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{ErrorCode, Message, MessageType, PROTOCOL_VERSION};
pub use presence::{NodeHeartbeat, PartySnapshot, PresenceUpdate, SessionHeartbeat, SessionPhase};
pub use terminal::{SessionMessage, StartRequest, TerminalSize};
