//! tilemux - a tiling terminal multiplexer
//!
//! Panes run programs on Unix ptys; a VT screen model per pane is diffed and
//! repainted to any number of clients. The local terminal can host a session
//! directly, or a server can share one session with clients over a socket.

pub mod config;
pub mod core;
pub mod server;
pub mod ui;
pub mod wm;

pub use config::Config;
