//! Interactive sessions hosted by this node

mod interactive;
mod table;

pub use interactive::{Attachment, InteractiveSession, SessionOutput, SessionSettings};
pub use table::{Admission, SessionTable};
