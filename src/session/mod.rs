// ABOUTME: Terminal session layer built on the connection manager
// Sessions own an emulator and an isolated connection; they survive
// disconnects and reattach with scrollback intact

pub mod emulator;
pub mod store;
pub mod surface;

pub use emulator::TerminalEmulator;
pub use store::{SessionConnectionStatus, SessionSnapshot, SessionStore};
pub use surface::{ScriptedSurface, TerminalSurface};
