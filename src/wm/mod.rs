//! Window management: tiling layout, panes, windows, and the session.
//!
//! # Module Hierarchy
//!
//! ```text
//! wm/
//! ├── mod.rs        - Module exports
//! ├── session.rs    - Session (windows, renderers, repaint loop)
//! ├── window.rs     - Window (layout tree + panes)
//! ├── pane.rs       - Pane (pty + screen model)
//! ├── layout.rs     - Layout tree arena and geometry
//! └── invalidate.rs - Redraw bits and repaint scheduler
//! ```

pub mod invalidate;
pub mod layout;
pub mod pane;
pub mod session;
pub mod window;

pub use invalidate::{Redraw, RepaintScheduler};
pub use layout::{Direction, Location, Orientation};
pub use pane::{Pane, PaneId};
pub use session::{Session, SessionDriver, SessionHandle};
pub use window::{Window, WindowId};
