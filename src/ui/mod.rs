//! Output and input for clients.
//!
//! - **renderer**: diff composer and the pipe/stdout/network backends
//! - **statusbar**: bottom-row window list and clock
//! - **input**: prefix-key dispatcher
//! - **terminal**: raw mode and async stdin for local clients

pub mod input;
pub mod renderer;
pub mod statusbar;
pub mod terminal;

pub use input::{CommandTarget, InputDispatcher, Variant};
pub use renderer::{NetworkBackend, PipeBackend, RendererBackend, StdoutBackend};
pub use statusbar::StatusBar;
