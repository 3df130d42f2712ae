//! Virtual channel multiplexing over one physical connection
//!
//! The tunnel owns the table of open channel ids. Channels hold only a weak
//! reference back to the tunnel; tearing a tunnel down walks its id table and
//! signals `TunnelLost` to each channel's consumer.

mod channel;
mod framed;
mod tunnel;

pub use channel::{ChannelEvent, IncomingChannel, VirtualChannel};
pub use framed::FramedConduit;
pub use tunnel::{Mux, MuxConfig, MuxEvents, MuxRole};
