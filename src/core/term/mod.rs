//! Pane screen model
//!
//! `Screen` is the collaborator the rest of the multiplexer talks to:
//! feed it the child's output, resize it, ask where the cursor is, and
//! diff it against the last rendered snapshot.

pub mod parser;
pub mod state;

pub use state::{AttrFlags, Cell, CellAttrs, Color, TerminalState};

/// Emulated terminal for one pane
pub struct Screen {
    parser: vte::Parser,
    state: TerminalState,
}

impl Screen {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: vte::Parser::new(),
            state: TerminalState::new(cols, rows),
        }
    }

    /// Run the child's output through the emulator.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.advance(&mut self.state, bytes);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.state.resize(cols, rows);
    }

    pub fn size(&self) -> (u16, u16) {
        (self.state.rows, self.state.cols)
    }

    /// Cursor as (row, col), clamped to the visible grid
    pub fn cursor_position(&self) -> (u16, u16) {
        let cursor = &self.state.cursor;
        (cursor.row, cursor.col.min(self.state.cols - 1))
    }

    pub fn cursor_hidden(&self) -> bool {
        !self.state.cursor.visible
    }

    pub fn application_cursor_keys(&self) -> bool {
        self.state.modes.application_cursor
    }

    pub fn title(&self) -> &str {
        &self.state.title
    }

    /// Drain replies the emulator owes the child (e.g. cursor reports)
    pub fn take_responses(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.state.responses)
    }

    pub fn state(&self) -> &TerminalState {
        &self.state
    }

    /// Copy of the visible grid
    pub fn snapshot(&self) -> Snapshot {
        let grid = self.state.active_screen();
        Snapshot {
            rows: self.state.rows,
            cols: self.state.cols,
            cells: grid.lines.iter().flatten().copied().collect(),
        }
    }

    /// Changed cells relative to `previous`; a missing or differently sized
    /// snapshot yields every cell.
    pub fn dump_diff(&self, previous: Option<&Snapshot>) -> PaneDiff {
        let current = self.snapshot();
        let comparable = previous.filter(|p| p.rows == current.rows && p.cols == current.cols);

        let cells = current
            .cells
            .iter()
            .enumerate()
            .filter(|(i, cell)| comparable.map_or(true, |p| p.cells[*i] != **cell))
            .map(|(i, cell)| ChangedCell {
                row: (i / current.cols as usize) as u16,
                col: (i % current.cols as usize) as u16,
                cell: *cell,
            })
            .collect();

        PaneDiff {
            cells,
            snapshot: current,
        }
    }
}

/// Row-major copy of a pane's visible cells at render time
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub rows: u16,
    pub cols: u16,
    pub cells: Vec<Cell>,
}

/// One cell that differs from the previous snapshot
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChangedCell {
    pub row: u16,
    pub col: u16,
    pub cell: Cell,
}

/// Result of `Screen::dump_diff`: the changes plus the snapshot to keep
#[derive(Clone, Debug)]
pub struct PaneDiff {
    /// Row-major order
    pub cells: Vec<ChangedCell>,
    pub snapshot: Snapshot,
}

impl PaneDiff {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_diff_is_full() {
        let screen = Screen::new(2, 4);
        let diff = screen.dump_diff(None);
        assert_eq!(diff.cells.len(), 8);
        assert_eq!((diff.cells[5].row, diff.cells[5].col), (1, 1));
    }

    #[test]
    fn test_diff_only_changed_cells() {
        let mut screen = Screen::new(3, 10);
        screen.feed(b"hello");
        let first = screen.dump_diff(None);

        let again = screen.dump_diff(Some(&first.snapshot));
        assert!(again.is_empty());

        screen.feed(b"\r\nx");
        let diff = screen.dump_diff(Some(&first.snapshot));
        assert_eq!(diff.cells.len(), 1);
        assert_eq!((diff.cells[0].row, diff.cells[0].col, diff.cells[0].cell.ch), (1, 0, 'x'));
    }

    #[test]
    fn test_resize_invalidates_snapshot() {
        let mut screen = Screen::new(3, 10);
        let first = screen.dump_diff(None);
        screen.resize(4, 12);
        assert_eq!(screen.size(), (4, 12));
        let diff = screen.dump_diff(Some(&first.snapshot));
        assert_eq!(diff.cells.len(), 48);
    }

    #[test]
    fn test_cursor_position_clamps_pending_wrap() {
        let mut screen = Screen::new(2, 3);
        screen.feed(b"abc");
        assert_eq!(screen.cursor_position(), (0, 2));
        screen.feed(b"\x1b[?25l");
        assert!(screen.cursor_hidden());
    }

    #[test]
    fn test_responses_drained() {
        let mut screen = Screen::new(3, 10);
        screen.feed(b"\x1b[6n");
        assert_eq!(screen.take_responses(), b"\x1b[1;1R".to_vec());
        assert!(screen.take_responses().is_empty());
    }
}
