//! VT sequence handling
//!
//! `vte` does the byte-level state machine; this module maps its callbacks
//! onto `TerminalState` operations.

use tracing::trace;
use vte::{Params, Perform};

use super::state::{AttrFlags, Color, TerminalState};

/// Flatten params to their first sub-parameter each
fn flat_params(params: &Params) -> Vec<u16> {
    params.iter().map(|sub| sub.first().copied().unwrap_or(0)).collect()
}

/// Parameter `i`, with 0 or missing meaning `default`
fn param_or(params: &[u16], i: usize, default: u16) -> u16 {
    match params.get(i).copied() {
        Some(0) | None => default,
        Some(v) => v,
    }
}

impl Perform for TerminalState {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x08 => self.backspace(),
            0x09 => self.horizontal_tab(),
            0x0a..=0x0c => self.linefeed(),
            0x0d => self.carriage_return(),
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if ignore {
            return;
        }
        let p = flat_params(params);
        let private = intermediates.first() == Some(&b'?');
        let secondary = intermediates.first() == Some(&b'>');

        match action {
            'A' => self.cursor_up(param_or(&p, 0, 1)),
            'B' | 'e' => self.cursor_down(param_or(&p, 0, 1)),
            'C' | 'a' => self.cursor_forward(param_or(&p, 0, 1)),
            'D' => self.cursor_backward(param_or(&p, 0, 1)),
            'E' => {
                self.cursor_down(param_or(&p, 0, 1));
                self.carriage_return();
            }
            'F' => {
                self.cursor_up(param_or(&p, 0, 1));
                self.carriage_return();
            }
            'G' | '`' => self.cursor_column(param_or(&p, 0, 1)),
            'H' | 'f' => self.cursor_position(param_or(&p, 0, 1), param_or(&p, 1, 1)),
            'd' => self.cursor_row(param_or(&p, 0, 1)),
            'J' => self.erase_in_display(param_or(&p, 0, 0)),
            'K' => self.erase_in_line(param_or(&p, 0, 0)),
            'X' => self.erase_chars(param_or(&p, 0, 1)),
            'L' => self.insert_lines(param_or(&p, 0, 1)),
            'M' => self.delete_lines(param_or(&p, 0, 1)),
            '@' => self.insert_chars(param_or(&p, 0, 1)),
            'P' => self.delete_chars(param_or(&p, 0, 1)),
            'S' => self.scroll_up(param_or(&p, 0, 1)),
            'T' => self.scroll_down(param_or(&p, 0, 1)),
            'r' if !private => self.set_scroll_region(param_or(&p, 0, 1), param_or(&p, 1, 0)),
            's' if !private => self.save_cursor(),
            'u' if !private => self.restore_cursor(),
            'h' | 'l' if private => {
                let enable = action == 'h';
                for &mode in &p {
                    self.set_private_mode(mode, enable);
                }
            }
            'm' if intermediates.is_empty() => self.handle_sgr(params),
            'n' if param_or(&p, 0, 0) == 6 => {
                let reply = format!(
                    "\x1b[{};{}R",
                    self.cursor.row + 1,
                    self.cursor.col.min(self.cols - 1) + 1
                );
                self.responses.extend_from_slice(reply.as_bytes());
            }
            'c' if secondary => self.responses.extend_from_slice(b"\x1b[>1;10;0c"),
            'c' if intermediates.is_empty() => self.responses.extend_from_slice(b"\x1b[?62;c"),
            _ => trace!("Unhandled CSI {:?} {:?} {}", intermediates, p, action),
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], ignore: bool, byte: u8) {
        if ignore || !intermediates.is_empty() {
            // Charset designations and friends are not modelled.
            return;
        }
        match byte {
            b'7' => self.save_cursor(),
            b'8' => self.restore_cursor(),
            b'D' => self.linefeed(),
            b'E' => {
                self.carriage_return();
                self.linefeed();
            }
            b'M' => self.reverse_index(),
            b'c' => self.reset(),
            _ => trace!("Unhandled ESC {}", byte as char),
        }
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        if let [kind, title, ..] = params {
            if *kind == b"0" || *kind == b"2" {
                self.title = String::from_utf8_lossy(title).into_owned();
            }
        }
    }
}

impl TerminalState {
    /// Apply an SGR sequence to the current attributes
    fn handle_sgr(&mut self, params: &Params) {
        let groups: Vec<&[u16]> = params.iter().collect();
        if groups.is_empty() {
            self.current_attrs = Default::default();
            return;
        }

        let mut i = 0;
        while i < groups.len() {
            let code = groups[i].first().copied().unwrap_or(0);
            let attrs = &mut self.current_attrs;
            match code {
                0 => *attrs = Default::default(),
                1 => attrs.flags.insert(AttrFlags::BOLD),
                2 => attrs.flags.insert(AttrFlags::DIM),
                3 => attrs.flags.insert(AttrFlags::ITALIC),
                4 => attrs.flags.insert(AttrFlags::UNDERLINE),
                5 => attrs.flags.insert(AttrFlags::BLINK),
                7 => attrs.flags.insert(AttrFlags::INVERSE),
                8 => attrs.flags.insert(AttrFlags::HIDDEN),
                9 => attrs.flags.insert(AttrFlags::STRIKETHROUGH),
                22 => attrs.flags.remove(AttrFlags::BOLD | AttrFlags::DIM),
                23 => attrs.flags.remove(AttrFlags::ITALIC),
                24 => attrs.flags.remove(AttrFlags::UNDERLINE),
                25 => attrs.flags.remove(AttrFlags::BLINK),
                27 => attrs.flags.remove(AttrFlags::INVERSE),
                28 => attrs.flags.remove(AttrFlags::HIDDEN),
                29 => attrs.flags.remove(AttrFlags::STRIKETHROUGH),
                30..=37 => attrs.fg = Color::Indexed((code - 30) as u8),
                39 => attrs.fg = Color::Default,
                40..=47 => attrs.bg = Color::Indexed((code - 40) as u8),
                49 => attrs.bg = Color::Default,
                90..=97 => attrs.fg = Color::Indexed((code - 90 + 8) as u8),
                100..=107 => attrs.bg = Color::Indexed((code - 100 + 8) as u8),
                38 | 48 => {
                    let (color, consumed) = extended_color(&groups, i);
                    if let Some(color) = color {
                        if code == 38 {
                            attrs.fg = color;
                        } else {
                            attrs.bg = color;
                        }
                    }
                    i += consumed;
                    continue;
                }
                _ => trace!("Unhandled SGR {}", code),
            }
            i += 1;
        }
    }
}

/// Parse `38;5;n` / `38;2;r;g;b` in either the `;` or the `:` form.
///
/// Returns the colour and how many groups were consumed.
fn extended_color(groups: &[&[u16]], start: usize) -> (Option<Color>, usize) {
    let head = groups[start];

    // Colon form: everything is inside one group.
    if head.len() > 1 {
        let color = match head.get(1) {
            Some(5) => head.get(2).map(|&n| Color::Indexed(n as u8)),
            Some(2) => {
                // 38:2:<colorspace>:r:g:b or 38:2:r:g:b
                let rgb = if head.len() >= 6 { &head[3..6] } else { &head[2..] };
                match rgb {
                    [r, g, b, ..] => Some(Color::Rgb(*r as u8, *g as u8, *b as u8)),
                    _ => None,
                }
            }
            _ => None,
        };
        return (color, 1);
    }

    let arg = |offset: usize| groups.get(start + offset).and_then(|g| g.first()).copied();
    match arg(1) {
        Some(5) => (arg(2).map(|n| Color::Indexed(n as u8)), 3),
        Some(2) => match (arg(2), arg(3), arg(4)) {
            (Some(r), Some(g), Some(b)) => (Some(Color::Rgb(r as u8, g as u8, b as u8)), 5),
            _ => (None, groups.len() - start),
        },
        _ => (None, 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::term::state::CellAttrs;

    fn feed(state: &mut TerminalState, bytes: &[u8]) {
        let mut parser = vte::Parser::new();
        parser.advance(state, bytes);
    }

    #[test]
    fn test_cursor_movement() {
        let mut state = TerminalState::new(80, 24);
        feed(&mut state, b"\x1b[10;20H");
        assert_eq!((state.cursor.row, state.cursor.col), (9, 19));
        feed(&mut state, b"\x1b[3A\x1b[2D");
        assert_eq!((state.cursor.row, state.cursor.col), (6, 17));
        feed(&mut state, b"\x1b[H");
        assert_eq!((state.cursor.row, state.cursor.col), (0, 0));
    }

    #[test]
    fn test_sgr_colors() {
        let mut state = TerminalState::new(80, 24);
        feed(&mut state, b"\x1b[1;31;44m");
        assert!(state.current_attrs.flags.contains(AttrFlags::BOLD));
        assert_eq!(state.current_attrs.fg, Color::Indexed(1));
        assert_eq!(state.current_attrs.bg, Color::Indexed(4));

        feed(&mut state, b"\x1b[38;5;208m\x1b[48;2;1;2;3m");
        assert_eq!(state.current_attrs.fg, Color::Indexed(208));
        assert_eq!(state.current_attrs.bg, Color::Rgb(1, 2, 3));

        feed(&mut state, b"\x1b[38:5:33m");
        assert_eq!(state.current_attrs.fg, Color::Indexed(33));

        feed(&mut state, b"\x1b[m");
        assert_eq!(state.current_attrs, CellAttrs::default());
    }

    #[test]
    fn test_private_modes() {
        let mut state = TerminalState::new(80, 24);
        feed(&mut state, b"\x1b[?1h\x1b[?25l");
        assert!(state.modes.application_cursor);
        assert!(!state.cursor.visible);
        feed(&mut state, b"\x1b[?1l\x1b[?25h\x1b[?1049h");
        assert!(!state.modes.application_cursor);
        assert!(state.cursor.visible);
        assert!(state.using_alternate);
    }

    #[test]
    fn test_cursor_report() {
        let mut state = TerminalState::new(80, 24);
        feed(&mut state, b"\x1b[5;7H\x1b[6n\x1b[c");
        assert_eq!(state.responses, b"\x1b[5;7R\x1b[?62;c".to_vec());
    }

    #[test]
    fn test_title() {
        let mut state = TerminalState::new(80, 24);
        feed(&mut state, b"\x1b]2;vim main.rs\x07");
        assert_eq!(state.title, "vim main.rs");
    }

    #[test]
    fn test_text_and_newlines() {
        let mut state = TerminalState::new(10, 3);
        feed(&mut state, b"ab\r\ncd");
        let lines = &state.active_screen().lines;
        assert_eq!(lines[0][1].ch, 'b');
        assert_eq!(lines[1][0].ch, 'c');
        assert_eq!((state.cursor.row, state.cursor.col), (1, 2));
    }
}
