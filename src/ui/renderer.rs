//! Diff renderer
//!
//! `Composer` turns the session's invalidation mask and pane diffs into one
//! escape-sequence byte string per client. A `RendererBackend` delivers that
//! string; the write is the only part that awaits.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use async_trait::async_trait;
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    queue,
    style::{Attribute, Color as CtColor, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::core::term::{AttrFlags, CellAttrs, PaneDiff};
use crate::server::protocol::{Command, Outbound, OUTPUT_CHUNK_SIZE};
use crate::wm::invalidate::Redraw;
use crate::wm::layout::Compass;
use crate::wm::pane::PaneId;
use crate::wm::window::Window;

const BEGIN_SYNC: &[u8] = b"\x1b[?2026h";
const END_SYNC: &[u8] = b"\x1b[?2026l";

/// Identifier of an attached renderer
pub type RendererId = u64;

/// Where a renderer's output goes
#[async_trait(?Send)]
pub trait RendererBackend {
    /// Client size as (width, height)
    fn get_size(&self) -> (u16, u16);

    async fn write_output(&self, data: Vec<u8>) -> io::Result<()>;
}

/// Everything a repaint draws from, borrowed from the session
pub struct RenderView<'a> {
    pub window: Option<&'a Window>,
    pub diffs: &'a HashMap<PaneId, PaneDiff>,
    pub status_left: &'a str,
    pub status_right: &'a str,
}

/// Per-renderer output state carried between repaints
#[derive(Debug, Default)]
pub struct Composer {
    last_size: Option<(u16, u16)>,
}

/// Cursor and SGR tracking while one frame is built
struct Pen {
    out: Vec<u8>,
    width: u16,
    /// Where the terminal cursor sits after the last write, if known
    position: Option<(u16, u16)>,
    attrs: Option<CellAttrs>,
}

impl Pen {
    fn new(width: u16) -> Self {
        Self {
            out: Vec::with_capacity(4096),
            width,
            position: None,
            attrs: None,
        }
    }

    /// Position the cursor, skipping the escape when the previous write
    /// already left it there.
    fn move_to(&mut self, x: u16, y: u16) -> io::Result<()> {
        match self.position {
            Some(pos) if pos == (x, y) => {}
            Some((_, row)) if x == 0 && y == row + 1 => self.out.extend_from_slice(b"\r\n"),
            _ => queue!(self.out, MoveTo(x, y))?,
        }
        self.position = Some((x, y));
        Ok(())
    }

    fn set_attrs(&mut self, attrs: CellAttrs) -> io::Result<()> {
        if self.attrs == Some(attrs) {
            return Ok(());
        }
        queue!(self.out, SetAttribute(Attribute::Reset))?;
        let flags = [
            (AttrFlags::BOLD, Attribute::Bold),
            (AttrFlags::DIM, Attribute::Dim),
            (AttrFlags::ITALIC, Attribute::Italic),
            (AttrFlags::UNDERLINE, Attribute::Underlined),
            (AttrFlags::BLINK, Attribute::SlowBlink),
            (AttrFlags::INVERSE, Attribute::Reverse),
            (AttrFlags::HIDDEN, Attribute::Hidden),
            (AttrFlags::STRIKETHROUGH, Attribute::CrossedOut),
        ];
        for (flag, attribute) in flags {
            if attrs.flags.contains(flag) {
                queue!(self.out, SetAttribute(attribute))?;
            }
        }
        let fg = attrs.fg.to_crossterm();
        if fg != CtColor::Reset {
            queue!(self.out, SetForegroundColor(fg))?;
        }
        let bg = attrs.bg.to_crossterm();
        if bg != CtColor::Reset {
            queue!(self.out, SetBackgroundColor(bg))?;
        }
        self.attrs = Some(attrs);
        Ok(())
    }

    /// Raw SGR sequence; forgets the tracked attributes
    fn set_style(&mut self, sgr: &[u8]) {
        self.out.extend_from_slice(sgr);
        self.attrs = None;
    }

    /// Write a glyph occupying `cells` columns at the current position
    fn put(&mut self, ch: char, cells: u16) -> io::Result<()> {
        queue!(self.out, Print(ch))?;
        self.advance(cells);
        Ok(())
    }

    fn put_str(&mut self, text: &str, cells: u16) -> io::Result<()> {
        queue!(self.out, Print(text))?;
        self.advance(cells);
        Ok(())
    }

    fn advance(&mut self, cells: u16) {
        self.position = match self.position {
            // Writing into the last column leaves a pending wrap.
            Some((x, y)) if x + cells < self.width => Some((x + cells, y)),
            _ => None,
        };
    }
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the output for one repaint on a client of size `size`.
    pub fn compose(&mut self, view: &RenderView<'_>, redraw: Redraw, size: (u16, u16)) -> io::Result<Vec<u8>> {
        let (width, height) = size;
        let mut pen = Pen::new(width);

        pen.out.extend_from_slice(BEGIN_SYNC);
        queue!(pen.out, Hide)?;

        if redraw.contains(Redraw::CLEAR_FIRST) {
            queue!(pen.out, SetAttribute(Attribute::Reset), ResetColor, Clear(ClearType::All))?;
            pen.attrs = Some(CellAttrs::default());
        }

        if redraw.contains(Redraw::PANES) {
            if let Some(window) = view.window {
                draw_panes(&mut pen, window, view.diffs, size)?;
            }
        }

        if redraw.contains(Redraw::BORDERS) {
            if let Some(window) = view.window {
                draw_borders(&mut pen, window, size)?;
            }
        }

        if let Some((old_width, old_height)) = self.last_size {
            if width > old_width || height > old_height {
                clear_exposed(&mut pen, (old_width, old_height), size)?;
            }
        }
        self.last_size = Some(size);

        if redraw.contains(Redraw::STATUS_BAR) && height > 0 {
            let line = crate::ui::statusbar::fit_line(view.status_left, view.status_right, width as usize);
            pen.move_to(0, height - 1)?;
            pen.set_style(b"\x1b[0;30;42m");
            pen.put_str(&line, width)?;
            pen.set_style(b"\x1b[0m");
        }

        draw_cursor(&mut pen, view.window)?;
        pen.out.extend_from_slice(END_SYNC);
        Ok(pen.out)
    }
}

fn draw_panes(
    pen: &mut Pen,
    window: &Window,
    diffs: &HashMap<PaneId, PaneDiff>,
    (width, height): (u16, u16),
) -> io::Result<()> {
    for pane in window.panes() {
        let Some(diff) = diffs.get(&pane.id) else {
            continue;
        };
        let loc = pane.location();
        for changed in &diff.cells {
            let cell = changed.cell;
            if cell.is_continuation() || changed.col >= loc.width || changed.row >= loc.height {
                continue;
            }
            let x = loc.x + changed.col;
            let y = loc.y + changed.row;
            let cells = (cell.width as u16).max(1);
            // The status bar owns the last row.
            if y + 1 >= height || x + cells > width {
                continue;
            }
            pen.move_to(x, y)?;
            pen.set_attrs(cell.attrs)?;
            pen.put(cell.ch, cells)?;
        }
    }
    Ok(())
}

/// Box-drawing glyph for the directions a border line runs through a cell
pub fn border_glyph(lines: Compass) -> Option<char> {
    let (t, b, l, r) = (
        lines.contains(Compass::TOP),
        lines.contains(Compass::BOTTOM),
        lines.contains(Compass::LEFT),
        lines.contains(Compass::RIGHT),
    );
    let glyph = match (t, b, l, r) {
        (true, true, true, true) => '┼',
        (true, false, true, true) => '┴',
        (false, true, true, true) => '┬',
        (true, true, false, true) => '├',
        (true, true, true, false) => '┤',
        (false, false, true, _) | (false, false, _, true) => '─',
        (true, _, false, false) | (_, true, false, false) => '│',
        (true, false, true, false) => '┘',
        (false, true, true, false) => '┐',
        (true, false, false, true) => '└',
        (false, true, false, true) => '┌',
        (false, false, false, false) => return None,
    };
    Some(glyph)
}

fn draw_borders(pen: &mut Pen, window: &Window, (width, height): (u16, u16)) -> io::Result<()> {
    let mut active_style = None;
    for ((y, x), cell) in window.border_map() {
        if x >= width || y + 1 >= height {
            continue;
        }
        let Some(glyph) = border_glyph(cell.lines) else {
            continue;
        };
        if active_style != Some(cell.active) {
            pen.set_style(if cell.active { b"\x1b[0;32m" } else { b"\x1b[0m" });
            active_style = Some(cell.active);
        }
        pen.move_to(x, y)?;
        pen.put(glyph, 1)?;
    }
    pen.set_style(b"\x1b[0m");
    Ok(())
}

/// Blank the area a client gained since the previous repaint
fn clear_exposed(pen: &mut Pen, (old_width, old_height): (u16, u16), (width, height): (u16, u16)) -> io::Result<()> {
    pen.set_style(b"\x1b[0m");
    for y in 0..height.saturating_sub(1) {
        let from = if y >= old_height { 0 } else { old_width };
        if from >= width {
            continue;
        }
        pen.move_to(from, y)?;
        queue!(pen.out, Clear(ClearType::UntilNewLine))?;
    }
    Ok(())
}

fn draw_cursor(pen: &mut Pen, window: Option<&Window>) -> io::Result<()> {
    let Some(pane) = window.and_then(Window::active_pane) else {
        return Ok(());
    };
    let loc = pane.location();
    let (row, col) = pane.cursor_position();
    queue!(pen.out, MoveTo(loc.x + col, loc.y + row))?;
    if !pane.cursor_hidden() {
        queue!(pen.out, Show)?;
    }
    if pane.application_cursor_keys() {
        pen.out.extend_from_slice(b"\x1b[?1h");
    } else {
        pen.out.extend_from_slice(b"\x1b[?1l");
    }
    Ok(())
}

/// Renderer writing to any async byte sink
pub struct PipeBackend<W> {
    writer: Mutex<W>,
    size: (u16, u16),
}

impl<W: AsyncWrite + Unpin> PipeBackend<W> {
    pub fn new(writer: W, size: (u16, u16)) -> Self {
        Self {
            writer: Mutex::new(writer),
            size,
        }
    }
}

#[async_trait(?Send)]
impl<W: AsyncWrite + Unpin> RendererBackend for PipeBackend<W> {
    fn get_size(&self) -> (u16, u16) {
        self.size
    }

    async fn write_output(&self, data: Vec<u8>) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await
    }
}

/// Renderer for the local terminal on fd 1
#[derive(Debug, Default)]
pub struct StdoutBackend;

impl StdoutBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait(?Send)]
impl RendererBackend for StdoutBackend {
    fn get_size(&self) -> (u16, u16) {
        crossterm::terminal::size().unwrap_or((80, 24))
    }

    async fn write_output(&self, data: Vec<u8>) -> io::Result<()> {
        // The tty's file description is shared with stdin, which the reactor
        // keeps non-blocking.
        let _blocking = BlockingGuard::new(libc::STDOUT_FILENO)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&data)?;
        stdout.flush()
    }
}

/// Clears O_NONBLOCK on a descriptor and restores the old flags on drop
struct BlockingGuard {
    fd: libc::c_int,
    flags: libc::c_int,
}

impl BlockingGuard {
    fn new(fd: libc::c_int) -> io::Result<Self> {
        // SAFETY: fcntl on a descriptor the process owns.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, flags })
    }
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        // SAFETY: restores flags read from the same descriptor.
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, self.flags);
        }
    }
}

/// Renderer for a client attached over the control socket
pub struct NetworkBackend {
    outbox: mpsc::Sender<Outbound>,
    size: Rc<Cell<(u16, u16)>>,
    /// Raised when the client falls a full outbox behind
    stalled: Rc<Notify>,
}

impl NetworkBackend {
    pub fn new(outbox: mpsc::Sender<Outbound>, size: Rc<Cell<(u16, u16)>>, stalled: Rc<Notify>) -> Self {
        Self { outbox, size, stalled }
    }
}

/// Split output into `WriteOutput` payloads that stay under the frame limit.
pub fn output_chunks(data: &[u8]) -> impl Iterator<Item = Vec<u8>> + '_ {
    data.chunks(OUTPUT_CHUNK_SIZE).map(<[u8]>::to_vec)
}

#[async_trait(?Send)]
impl RendererBackend for NetworkBackend {
    fn get_size(&self) -> (u16, u16) {
        self.size.get()
    }

    async fn write_output(&self, data: Vec<u8>) -> io::Result<()> {
        for chunk in output_chunks(&data) {
            match self.outbox.try_send(Outbound::Call(Command::WriteOutput { data: chunk })) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.stalled.notify_one();
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "client is not reading its output"));
                }
                Err(TrySendError::Closed(_)) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client connection closed"));
                }
            }
        }
        Ok(())
    }
}
