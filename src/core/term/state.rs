//! Terminal state management
//!
//! This module defines the pane's screen buffers, cursor state, and attributes.
//! The VT parser (`parser.rs`) drives it; renderers only ever see snapshots.

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

/// Terminal state holding all screen data
pub struct TerminalState {
    pub cols: u16,
    pub rows: u16,
    pub primary_screen: Grid,
    pub alternate_screen: Grid,
    pub using_alternate: bool,
    pub cursor: CursorState,
    pub saved_cursor: Option<SavedCursor>,
    pub current_attrs: CellAttrs,
    pub modes: TerminalModes,
    pub title: String,
    /// Scroll region (top, bottom) - 0-indexed, inclusive
    pub scroll_region: (u16, u16),
    /// Replies owed to the child (cursor reports, device attributes)
    pub responses: Vec<u8>,
}

impl TerminalState {
    pub fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            primary_screen: Grid::new(cols, rows),
            alternate_screen: Grid::new(cols, rows),
            using_alternate: false,
            cursor: CursorState::default(),
            saved_cursor: None,
            current_attrs: CellAttrs::default(),
            modes: TerminalModes::default(),
            title: String::new(),
            scroll_region: (0, rows - 1),
            responses: Vec::new(),
        }
    }

    pub fn active_screen(&self) -> &Grid {
        if self.using_alternate {
            &self.alternate_screen
        } else {
            &self.primary_screen
        }
    }

    pub fn active_screen_mut(&mut self) -> &mut Grid {
        if self.using_alternate {
            &mut self.alternate_screen
        } else {
            &mut self.primary_screen
        }
    }

    /// Resize the terminal
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);

        // Keep the cursor line on screen when shrinking.
        let overflow = (self.cursor.row + 1).saturating_sub(rows);
        self.active_screen_mut().drop_top(overflow as usize);
        self.cursor.row -= overflow;

        self.cols = cols;
        self.rows = rows;
        self.primary_screen.resize(cols, rows);
        self.alternate_screen.resize(cols, rows);
        self.scroll_region = (0, rows - 1);

        self.cursor.col = self.cursor.col.min(cols - 1);
        self.cursor.row = self.cursor.row.min(rows - 1);
    }

    /// Full reset (RIS)
    pub fn reset(&mut self) {
        let title = std::mem::take(&mut self.title);
        *self = Self::new(self.cols, self.rows);
        self.title = title;
    }

    /// Blank cell carrying the current background
    fn blank(&self) -> Cell {
        Cell {
            attrs: CellAttrs {
                bg: self.current_attrs.bg,
                ..CellAttrs::default()
            },
            ..Cell::default()
        }
    }

    /// Put a character at the current cursor position
    pub fn put_char(&mut self, ch: char) {
        let width = match ch.width() {
            Some(w) if w > 0 => w as u16,
            // Combining marks and controls take no cell of their own.
            _ => return,
        };
        if width > self.cols {
            return;
        }

        if self.cursor.col + width > self.cols {
            if self.modes.auto_wrap {
                self.cursor.col = 0;
                self.linefeed();
            } else {
                self.cursor.col = self.cols - width;
            }
        }

        let (row, col) = (self.cursor.row as usize, self.cursor.col as usize);
        let attrs = self.current_attrs;
        let screen = self.active_screen_mut();

        screen.break_wide_pair(row, col);
        screen.lines[row][col] = Cell {
            ch,
            width: width as u8,
            attrs,
        };
        if width == 2 {
            screen.break_wide_pair(row, col + 1);
            screen.lines[row][col + 1] = Cell::continuation(attrs);
        }

        // col may now equal cols: the wrap happens on the next printable.
        self.cursor.col += width;
    }

    /// Carriage return - move cursor to column 0
    pub fn carriage_return(&mut self) {
        self.cursor.col = 0;
    }

    /// Line feed - move cursor down, scroll if needed
    pub fn linefeed(&mut self) {
        if self.cursor.row == self.scroll_region.1 {
            self.scroll_up(1);
        } else if self.cursor.row < self.rows - 1 {
            self.cursor.row += 1;
        }
    }

    /// Reverse index - cursor up, scroll if at top
    pub fn reverse_index(&mut self) {
        if self.cursor.row == self.scroll_region.0 {
            self.scroll_down(1);
        } else {
            self.cursor_up(1);
        }
    }

    /// Backspace - move cursor left
    pub fn backspace(&mut self) {
        self.clamp_pending_wrap();
        self.cursor.col = self.cursor.col.saturating_sub(1);
    }

    /// Horizontal tab (stops every 8 columns)
    pub fn horizontal_tab(&mut self) {
        let next = (self.cursor.col / 8 + 1) * 8;
        self.cursor.col = next.min(self.cols - 1);
    }

    /// Scroll the region up by n lines
    pub fn scroll_up(&mut self, n: u16) {
        let (top, bottom) = (self.scroll_region.0 as usize, self.scroll_region.1 as usize);
        let blank = self.blank();
        let screen = self.active_screen_mut();
        let n = (n as usize).min(bottom + 1 - top);
        for _ in 0..n {
            let line = screen.blank_line(blank);
            screen.lines.remove(top);
            screen.lines.insert(bottom, line);
        }
    }

    /// Scroll the region down by n lines
    pub fn scroll_down(&mut self, n: u16) {
        let (top, bottom) = (self.scroll_region.0 as usize, self.scroll_region.1 as usize);
        let blank = self.blank();
        let screen = self.active_screen_mut();
        let n = (n as usize).min(bottom + 1 - top);
        for _ in 0..n {
            let line = screen.blank_line(blank);
            screen.lines.remove(bottom);
            screen.lines.insert(top, line);
        }
    }

    fn clamp_pending_wrap(&mut self) {
        self.cursor.col = self.cursor.col.min(self.cols - 1);
    }

    pub fn cursor_up(&mut self, n: u16) {
        self.clamp_pending_wrap();
        self.cursor.row = self.cursor.row.saturating_sub(n);
    }

    pub fn cursor_down(&mut self, n: u16) {
        self.clamp_pending_wrap();
        self.cursor.row = self.cursor.row.saturating_add(n).min(self.rows - 1);
    }

    pub fn cursor_forward(&mut self, n: u16) {
        self.cursor.col = self.cursor.col.saturating_add(n).min(self.cols - 1);
    }

    pub fn cursor_backward(&mut self, n: u16) {
        self.clamp_pending_wrap();
        self.cursor.col = self.cursor.col.saturating_sub(n);
    }

    /// Set cursor position (1-indexed parameters)
    pub fn cursor_position(&mut self, row: u16, col: u16) {
        self.cursor.row = row.saturating_sub(1).min(self.rows - 1);
        self.cursor.col = col.saturating_sub(1).min(self.cols - 1);
    }

    pub fn cursor_column(&mut self, col: u16) {
        self.cursor.col = col.saturating_sub(1).min(self.cols - 1);
    }

    pub fn cursor_row(&mut self, row: u16) {
        self.clamp_pending_wrap();
        self.cursor.row = row.saturating_sub(1).min(self.rows - 1);
    }

    /// Erase in display
    pub fn erase_in_display(&mut self, mode: u16) {
        let blank = self.blank();
        let row = self.cursor.row as usize;
        match mode {
            0 => {
                self.erase_in_line(0);
                let screen = self.active_screen_mut();
                for line in screen.lines.iter_mut().skip(row + 1) {
                    line.fill(blank);
                }
            }
            1 => {
                self.erase_in_line(1);
                let screen = self.active_screen_mut();
                for line in screen.lines.iter_mut().take(row) {
                    line.fill(blank);
                }
            }
            2 | 3 => {
                let screen = self.active_screen_mut();
                for line in screen.lines.iter_mut() {
                    line.fill(blank);
                }
            }
            _ => {}
        }
    }

    /// Erase in line
    pub fn erase_in_line(&mut self, mode: u16) {
        let blank = self.blank();
        let row = self.cursor.row as usize;
        let col = (self.cursor.col.min(self.cols - 1)) as usize;
        let line = &mut self.active_screen_mut().lines[row];
        match mode {
            0 => line[col..].fill(blank),
            1 => line[..=col].fill(blank),
            2 => line.fill(blank),
            _ => {}
        }
    }

    /// Erase n characters from the cursor without moving it
    pub fn erase_chars(&mut self, n: u16) {
        let blank = self.blank();
        let row = self.cursor.row as usize;
        let col = (self.cursor.col.min(self.cols - 1)) as usize;
        let line = &mut self.active_screen_mut().lines[row];
        let end = (col + n as usize).min(line.len());
        line[col..end].fill(blank);
    }

    /// Insert n blank lines at the cursor (inside the scroll region)
    pub fn insert_lines(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        if self.cursor.row < top || self.cursor.row > bottom {
            return;
        }
        let saved_top = self.scroll_region.0;
        self.scroll_region.0 = self.cursor.row;
        self.scroll_down(n);
        self.scroll_region.0 = saved_top;
        self.cursor.col = 0;
    }

    /// Delete n lines at the cursor (inside the scroll region)
    pub fn delete_lines(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        if self.cursor.row < top || self.cursor.row > bottom {
            return;
        }
        let saved_top = self.scroll_region.0;
        self.scroll_region.0 = self.cursor.row;
        self.scroll_up(n);
        self.scroll_region.0 = saved_top;
        self.cursor.col = 0;
    }

    /// Insert n blank cells at the cursor, shifting the rest right
    pub fn insert_chars(&mut self, n: u16) {
        let blank = self.blank();
        let row = self.cursor.row as usize;
        let col = (self.cursor.col.min(self.cols - 1)) as usize;
        let line = &mut self.active_screen_mut().lines[row];
        let n = (n as usize).min(line.len() - col);
        line[col..].rotate_right(n);
        line[col..col + n].fill(blank);
    }

    /// Delete n cells at the cursor, shifting the rest left
    pub fn delete_chars(&mut self, n: u16) {
        let blank = self.blank();
        let row = self.cursor.row as usize;
        let col = (self.cursor.col.min(self.cols - 1)) as usize;
        let line = &mut self.active_screen_mut().lines[row];
        let len = line.len();
        let n = (n as usize).min(len - col);
        line[col..].rotate_left(n);
        line[len - n..].fill(blank);
    }

    /// Set scroll region (1-indexed, inclusive); homes the cursor
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let top = top.max(1) - 1;
        let bottom = (if bottom == 0 { self.rows } else { bottom.min(self.rows) }).max(1) - 1;
        if top < bottom {
            self.scroll_region = (top, bottom);
            self.cursor.row = 0;
            self.cursor.col = 0;
        }
    }

    pub fn save_cursor(&mut self) {
        self.saved_cursor = Some(SavedCursor {
            col: self.cursor.col,
            row: self.cursor.row,
            attrs: self.current_attrs,
        });
    }

    pub fn restore_cursor(&mut self) {
        if let Some(saved) = self.saved_cursor {
            self.cursor.col = saved.col.min(self.cols - 1);
            self.cursor.row = saved.row.min(self.rows - 1);
            self.current_attrs = saved.attrs;
        }
    }

    /// Set private mode
    pub fn set_private_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.modes.application_cursor = enable,
            7 => self.modes.auto_wrap = enable,
            25 => self.cursor.visible = enable,
            47 | 1047 => self.switch_screen(enable),
            1048 => {
                if enable {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => {
                if enable {
                    self.save_cursor();
                    self.switch_screen(true);
                    self.cursor.col = 0;
                    self.cursor.row = 0;
                } else {
                    self.switch_screen(false);
                    self.restore_cursor();
                }
            }
            2004 => self.modes.bracketed_paste = enable,
            _ => {} // Ignore unknown modes
        }
    }

    fn switch_screen(&mut self, alternate: bool) {
        if alternate && !self.using_alternate {
            self.alternate_screen = Grid::new(self.cols, self.rows);
        }
        self.using_alternate = alternate;
    }
}

/// One screen's worth of cells
#[derive(Clone, Debug)]
pub struct Grid {
    pub cols: u16,
    pub lines: Vec<Vec<Cell>>,
}

impl Grid {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            lines: vec![vec![Cell::default(); cols as usize]; rows as usize],
        }
    }

    fn blank_line(&self, blank: Cell) -> Vec<Cell> {
        vec![blank; self.cols as usize]
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.lines.resize_with(rows as usize, Vec::new);
        for line in &mut self.lines {
            line.resize(cols as usize, Cell::default());
            // A wide char cut in half at the new edge becomes a blank.
            if line.last().map_or(false, |c| c.width == 2) {
                if let Some(last) = line.last_mut() {
                    *last = Cell::default();
                }
            }
        }
    }

    fn drop_top(&mut self, n: usize) {
        let n = n.min(self.lines.len());
        self.lines.drain(..n);
    }

    /// Overwriting either half of a wide char blanks the other half.
    fn break_wide_pair(&mut self, row: usize, col: usize) {
        let line = &mut self.lines[row];
        if col >= line.len() {
            return;
        }
        if line[col].is_continuation() && col > 0 {
            line[col - 1] = Cell::default();
        }
        if line[col].width == 2 && col + 1 < line.len() {
            line[col + 1] = Cell::default();
        }
    }
}

/// A single cell
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Cell {
    pub ch: char,
    /// 1 for normal, 2 for the left half of a wide char, 0 for its right half
    pub width: u8,
    pub attrs: CellAttrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            width: 1,
            attrs: CellAttrs::default(),
        }
    }
}

impl Cell {
    pub fn continuation(attrs: CellAttrs) -> Self {
        Self {
            ch: ' ',
            width: 0,
            attrs,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }
}

/// Cell attributes
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

/// Color definition
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Color {
    /// Convert to crossterm color
    pub fn to_crossterm(self) -> crossterm::style::Color {
        match self {
            Color::Default => crossterm::style::Color::Reset,
            Color::Indexed(n) => crossterm::style::Color::AnsiValue(n),
            Color::Rgb(r, g, b) => crossterm::style::Color::Rgb { r, g, b },
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct AttrFlags: u16 {
        const BOLD          = 0b0000_0000_0001;
        const DIM           = 0b0000_0000_0010;
        const ITALIC        = 0b0000_0000_0100;
        const UNDERLINE     = 0b0000_0000_1000;
        const BLINK         = 0b0000_0001_0000;
        const INVERSE       = 0b0000_0010_0000;
        const HIDDEN        = 0b0000_0100_0000;
        const STRIKETHROUGH = 0b0000_1000_0000;
    }
}

/// Cursor state
#[derive(Clone, Copy, Debug)]
pub struct CursorState {
    /// May equal `cols` while a wrap is pending
    pub col: u16,
    pub row: u16,
    pub visible: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            col: 0,
            row: 0,
            visible: true,
        }
    }
}

/// Saved cursor state
#[derive(Clone, Copy, Debug)]
pub struct SavedCursor {
    pub col: u16,
    pub row: u16,
    pub attrs: CellAttrs,
}

/// Terminal modes
#[derive(Clone, Debug)]
pub struct TerminalModes {
    pub application_cursor: bool,
    pub auto_wrap: bool,
    pub bracketed_paste: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            auto_wrap: true,
            bracketed_paste: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_text(state: &TerminalState, row: usize) -> String {
        state.active_screen().lines[row]
            .iter()
            .filter(|c| !c.is_continuation())
            .map(|c| c.ch)
            .collect::<String>()
            .trim_end()
            .to_string()
    }

    fn put_str(state: &mut TerminalState, s: &str) {
        for ch in s.chars() {
            state.put_char(ch);
        }
    }

    #[test]
    fn test_deferred_wrap() {
        let mut state = TerminalState::new(5, 3);
        put_str(&mut state, "abcde");
        assert_eq!((state.cursor.row, state.cursor.col), (0, 5));
        put_str(&mut state, "f");
        assert_eq!(row_text(&state, 0), "abcde");
        assert_eq!(row_text(&state, 1), "f");
    }

    #[test]
    fn test_scroll_at_bottom() {
        let mut state = TerminalState::new(10, 2);
        put_str(&mut state, "one");
        state.carriage_return();
        state.linefeed();
        put_str(&mut state, "two");
        state.carriage_return();
        state.linefeed();
        put_str(&mut state, "three");
        assert_eq!(row_text(&state, 0), "two");
        assert_eq!(row_text(&state, 1), "three");
    }

    #[test]
    fn test_wide_char_occupies_two_cells() {
        let mut state = TerminalState::new(6, 1);
        put_str(&mut state, "a漢b");
        let line = &state.active_screen().lines[0];
        assert_eq!(line[1].width, 2);
        assert!(line[2].is_continuation());
        assert_eq!(line[3].ch, 'b');
        assert_eq!(state.cursor.col, 4);

        // Overwriting the right half blanks the left half.
        state.cursor_position(1, 3);
        state.put_char('x');
        let line = &state.active_screen().lines[0];
        assert_eq!(line[1], Cell::default());
        assert_eq!(line[2].ch, 'x');
    }

    #[test]
    fn test_erase_and_delete_chars() {
        let mut state = TerminalState::new(8, 1);
        put_str(&mut state, "abcdefgh");
        state.cursor_position(1, 3);
        state.delete_chars(2);
        assert_eq!(row_text(&state, 0), "abefgh");
        state.insert_chars(1);
        assert_eq!(row_text(&state, 0), "ab efgh");
        state.erase_in_line(0);
        assert_eq!(row_text(&state, 0), "ab");
    }

    #[test]
    fn test_alternate_screen_restores_primary() {
        let mut state = TerminalState::new(10, 3);
        put_str(&mut state, "shell");
        state.set_private_mode(1049, true);
        assert!(state.using_alternate);
        assert_eq!(row_text(&state, 0), "");
        put_str(&mut state, "vim");
        state.set_private_mode(1049, false);
        assert_eq!(row_text(&state, 0), "shell");
        assert_eq!(state.cursor.col, 5);
    }

    #[test]
    fn test_resize_keeps_cursor_line() {
        let mut state = TerminalState::new(10, 5);
        for line in ["a", "b", "c", "d", "e"] {
            put_str(&mut state, line);
            if line != "e" {
                state.carriage_return();
                state.linefeed();
            }
        }
        state.resize(4, 2);
        assert_eq!(row_text(&state, 0), "d");
        assert_eq!(row_text(&state, 1), "e");
        assert_eq!(state.cursor.row, 1);
        assert_eq!(state.active_screen().lines[0].len(), 4);
    }

    #[test]
    fn test_insert_delete_lines_in_region() {
        let mut state = TerminalState::new(4, 4);
        for (i, line) in ["1", "2", "3", "4"].iter().enumerate() {
            state.cursor_position(i as u16 + 1, 1);
            put_str(&mut state, line);
        }
        state.cursor_position(2, 1);
        state.delete_lines(1);
        assert_eq!(
            (0..4).map(|r| row_text(&state, r)).collect::<Vec<_>>(),
            vec!["1", "3", "4", ""]
        );
        state.insert_lines(2);
        assert_eq!(
            (0..4).map(|r| row_text(&state, r)).collect::<Vec<_>>(),
            vec!["1", "", "", "3"]
        );
    }
}
