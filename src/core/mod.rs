//! Core terminal components.
//!
//! - **pty**: Unix pseudo-terminal pairs, fork/exec bootstrap, resize and wait
//! - **term**: VT screen model fed by a pane's child process
//!
//! # Architecture
//!
//! ```text
//! Pane (wm::pane)
//! ├── Pty (master fd + child pid)
//! └── Screen
//!     ├── vte::Parser (escape sequence state machine)
//!     └── TerminalState (grids, cursor, modes)
//! ```

pub mod pty;
pub mod term;
