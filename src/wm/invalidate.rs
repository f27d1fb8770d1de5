//! Redraw bits and the single-flight repaint scheduler

use bitflags::bitflags;

bitflags! {
    /// Parts of the screen that need repainting; bits OR-accumulate between flushes
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Redraw: u8 {
        const CURSOR      = 1;
        const BORDERS     = 2;
        const PANES       = 4;
        const STATUS_BAR  = 8;
        const CLEAR_FIRST = 16;
        const ALL = Self::CURSOR.bits()
            | Self::BORDERS.bits()
            | Self::PANES.bits()
            | Self::STATUS_BAR.bits()
            | Self::CLEAR_FIRST.bits();
    }
}

/// Where the repaint cycle stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepaintState {
    Idle,
    Scheduled,
    Running,
}

/// Coalesces invalidations so at most one repaint is queued or running.
#[derive(Debug)]
pub struct RepaintScheduler {
    state: RepaintState,
    pending: Redraw,
}

impl Default for RepaintScheduler {
    fn default() -> Self {
        Self {
            state: RepaintState::Idle,
            pending: Redraw::empty(),
        }
    }
}

impl RepaintScheduler {
    pub fn state(&self) -> RepaintState {
        self.state
    }

    pub fn pending(&self) -> Redraw {
        self.pending
    }

    /// Record dirty parts. Returns true when the caller must wake the loop.
    pub fn invalidate(&mut self, parts: Redraw) -> bool {
        if parts.is_empty() {
            return false;
        }
        self.pending |= parts;
        if self.state == RepaintState::Idle {
            self.state = RepaintState::Scheduled;
            return true;
        }
        false
    }

    /// Start a repaint: take the pending parts and clear them.
    ///
    /// Returns `None` when nothing was scheduled.
    pub fn begin(&mut self) -> Option<Redraw> {
        if self.state != RepaintState::Scheduled {
            return None;
        }
        self.state = RepaintState::Running;
        Some(std::mem::take(&mut self.pending))
    }

    /// Finish a repaint. Returns true when invalidations arrived meanwhile
    /// and another repaint has been scheduled.
    pub fn finish(&mut self) -> bool {
        if self.pending.is_empty() {
            self.state = RepaintState::Idle;
            false
        } else {
            self.state = RepaintState::Scheduled;
            true
        }
    }
}
