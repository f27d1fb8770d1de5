//! Prefix-key input dispatcher
//!
//! Raw keyboard bytes pass through to the active pane until the prefix
//! (Ctrl-A) arrives; the byte after it selects a `Command`.

use tracing::debug;

use crate::wm::layout::Direction;

/// Ctrl-A
pub const PREFIX: u8 = 0x01;

/// Cells moved per resize key press
pub const RESIZE_STEP: u16 = 4;

/// Action bound to a key after the prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    NextWindow,
    NewWindow,
    /// New pane below the active one
    SplitStacked,
    /// New pane right of the active one
    SplitSideBySide,
    KillPane,
    Resize(Direction, u16),
    Focus(Direction),
    FocusNextPane,
    Redraw,
    Detach,
}

/// Whether detaching makes sense for the client typing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Standalone,
    Server,
}

/// Receiver of dispatched input
pub trait CommandTarget {
    fn send_to_active_pane(&mut self, data: &[u8]);
    fn run(&mut self, command: Command);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    AwaitingCommandChar,
}

/// Key binding table
fn binding(byte: u8, variant: Variant) -> Option<Command> {
    let command = match byte {
        b'n' => Command::NextWindow,
        b'c' => Command::NewWindow,
        b'"' => Command::SplitStacked,
        b'%' => Command::SplitSideBySide,
        b'x' => Command::KillPane,
        b'h' => Command::Resize(Direction::Left, RESIZE_STEP),
        b'j' => Command::Resize(Direction::Down, RESIZE_STEP),
        b'k' => Command::Resize(Direction::Up, RESIZE_STEP),
        b'l' => Command::Resize(Direction::Right, RESIZE_STEP),
        b'H' => Command::Focus(Direction::Left),
        b'J' => Command::Focus(Direction::Down),
        b'K' => Command::Focus(Direction::Up),
        b'L' => Command::Focus(Direction::Right),
        b'o' => Command::FocusNextPane,
        b'R' => Command::Redraw,
        b'd' if variant == Variant::Server => Command::Detach,
        _ => return None,
    };
    Some(command)
}

/// Per-client prefix state machine
#[derive(Debug)]
pub struct InputDispatcher {
    state: State,
    variant: Variant,
}

impl InputDispatcher {
    pub fn new(variant: Variant) -> Self {
        Self {
            state: State::Normal,
            variant,
        }
    }

    /// Route one chunk of keyboard input.
    ///
    /// Literal bytes are forwarded as one batch, flushed before any command
    /// so ordering is preserved.
    pub fn process(&mut self, data: &[u8], target: &mut dyn CommandTarget) {
        let mut literal = Vec::with_capacity(data.len());

        for &byte in data {
            match self.state {
                State::Normal if byte == PREFIX => self.state = State::AwaitingCommandChar,
                State::Normal => literal.push(byte),
                State::AwaitingCommandChar => {
                    self.state = State::Normal;
                    if byte == PREFIX {
                        literal.push(PREFIX);
                        continue;
                    }
                    match binding(byte, self.variant) {
                        Some(command) => {
                            if !literal.is_empty() {
                                target.send_to_active_pane(&literal);
                                literal.clear();
                            }
                            debug!("Key {:?} -> {:?}", byte as char, command);
                            target.run(command);
                        }
                        None => debug!("Unbound key after prefix: {:#04x}", byte),
                    }
                }
            }
        }

        if !literal.is_empty() {
            target.send_to_active_pane(&literal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<Result<Vec<u8>, Command>>,
    }

    impl CommandTarget for Recorder {
        fn send_to_active_pane(&mut self, data: &[u8]) {
            self.events.push(Ok(data.to_vec()));
        }

        fn run(&mut self, command: Command) {
            self.events.push(Err(command));
        }
    }

    fn dispatch(variant: Variant, chunks: &[&[u8]]) -> Vec<Result<Vec<u8>, Command>> {
        let mut dispatcher = InputDispatcher::new(variant);
        let mut target = Recorder::default();
        for chunk in chunks {
            dispatcher.process(chunk, &mut target);
        }
        target.events
    }

    #[test]
    fn test_plain_bytes_batched() {
        assert_eq!(dispatch(Variant::Standalone, &[b"ls -l\r"]), vec![Ok(b"ls -l\r".to_vec())]);
    }

    #[test]
    fn test_prefix_command() {
        assert_eq!(
            dispatch(Variant::Standalone, &[b"ab\x01%cd"]),
            vec![
                Ok(b"ab".to_vec()),
                Err(Command::SplitSideBySide),
                Ok(b"cd".to_vec()),
            ]
        );
    }

    #[test]
    fn test_prefix_split_across_chunks() {
        assert_eq!(
            dispatch(Variant::Standalone, &[b"\x01", b"l"]),
            vec![Err(Command::Resize(Direction::Right, 4))]
        );
    }

    #[test]
    fn test_double_prefix_is_literal() {
        assert_eq!(
            dispatch(Variant::Standalone, &[b"x\x01\x01y"]),
            vec![Ok(b"x\x01y".to_vec())]
        );
    }

    #[test]
    fn test_unbound_key_dropped() {
        assert_eq!(dispatch(Variant::Standalone, &[b"\x01zq"]), vec![Ok(b"q".to_vec())]);
    }

    #[test]
    fn test_detach_only_on_server() {
        assert_eq!(dispatch(Variant::Standalone, &[b"\x01d"]), vec![]);
        assert_eq!(dispatch(Variant::Server, &[b"\x01d"]), vec![Err(Command::Detach)]);
    }

    #[test]
    fn test_bindings() {
        let cases: &[(u8, Command)] = &[
            (b'n', Command::NextWindow),
            (b'c', Command::NewWindow),
            (b'"', Command::SplitStacked),
            (b'x', Command::KillPane),
            (b'K', Command::Focus(Direction::Up)),
            (b'j', Command::Resize(Direction::Down, 4)),
            (b'o', Command::FocusNextPane),
            (b'R', Command::Redraw),
        ];
        for &(key, command) in cases {
            assert_eq!(binding(key, Variant::Standalone), Some(command));
        }
    }
}
