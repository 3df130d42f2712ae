//! Pseudo-terminal processes for interactive sessions

mod process;

pub use process::{resolve_shell, PtyProcess, SpawnRequest};
