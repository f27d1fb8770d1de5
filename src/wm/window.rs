//! Window - a layout tree of panes, one of them active

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

use super::invalidate::Redraw;
use super::layout::{
    CellPosition, Compass, Direction, LayoutError, LayoutTree, Location, Orientation,
};
use super::pane::{Pane, PaneId};
use crate::core::pty::{CommandSpec, PtyError};

/// Unique identifier for a window
pub type WindowId = u64;

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug)]
pub enum WindowError {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Border line through one cell, OR-combined over every pane it frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BorderCell {
    pub lines: Compass,
    /// Part of the active pane's frame
    pub active: bool,
}

/// A window containing tiled panes
pub struct Window {
    pub id: WindowId,
    layout: LayoutTree,
    panes: HashMap<PaneId, Pane>,
    /// Creation order, used for cycling and probing
    pane_order: Vec<PaneId>,
    active_pane: Option<PaneId>,
}

impl Window {
    pub fn new(location: Location) -> Self {
        let mut layout = LayoutTree::new(Orientation::Horizontal);
        let root = layout.root();
        // The root always exists, so this cannot fail.
        let _ = layout.set_location(root, location);

        Self {
            id: NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed),
            layout,
            panes: HashMap::new(),
            pane_order: Vec::new(),
            active_pane: None,
        }
    }

    /// Rectangle available to the panes
    pub fn location(&self) -> Location {
        self.layout.location(self.layout.root()).unwrap_or_default()
    }

    /// Resize the whole window
    pub fn set_location(&mut self, location: Location) -> Result<(), LayoutError> {
        let root = self.layout.root();
        self.layout.set_location(root, location)?;
        self.reflow();
        Ok(())
    }

    /// Add a pane next to the active one and make it active.
    ///
    /// The pane's process is not started here; the caller does that once the
    /// pane has its final geometry.
    pub fn create_new_pane(
        &mut self,
        command: CommandSpec,
        orientation: Orientation,
    ) -> Result<(PaneId, Redraw), WindowError> {
        let area = self.location();
        let pane = Pane::new(command, area.height, area.width)?;
        let id = pane.id;

        let leaf = self.layout.new_leaf(id);
        let placed = match self.active_pane.and_then(|a| self.layout.leaf_of(a)) {
            None => {
                let root = self.layout.root();
                self.layout.split(root, leaf, orientation, None)
            }
            Some(active_leaf) => {
                let parent = self
                    .layout
                    .parent(active_leaf)
                    .ok_or(LayoutError::NotAChild(active_leaf))?;
                self.layout.split(parent, leaf, orientation, Some(active_leaf))
            }
        };
        placed?;

        self.panes.insert(id, pane);
        self.pane_order.push(id);
        self.active_pane = Some(id);
        self.reflow();

        debug!("Window {}: created pane {}", self.id, id);
        Ok((id, Redraw::ALL))
    }

    /// Push leaf rectangles into the panes
    pub fn reflow(&mut self) -> bool {
        let mut changed = false;
        for (pane_id, location) in self.layout.leaves() {
            if let Some(pane) = self.panes.get_mut(&pane_id) {
                changed |= pane.set_location(location);
            }
        }
        changed
    }

    /// Detach a pane from the tree; the next pane takes focus if it was active.
    pub fn remove_pane(&mut self, id: PaneId) -> Result<Option<Pane>, LayoutError> {
        let Some(pane) = self.panes.remove(&id) else {
            return Ok(None);
        };

        if self.active_pane == Some(id) {
            self.active_pane = self.neighbour_in_order(id);
        }
        self.pane_order.retain(|&p| p != id);

        if let Some(leaf) = self.layout.leaf_of(id) {
            self.layout.remove(leaf)?;
        }
        self.reflow();
        Ok(Some(pane))
    }

    /// Next pane after `id` in creation order, wrapping, excluding `id` itself
    fn neighbour_in_order(&self, id: PaneId) -> Option<PaneId> {
        let index = self.pane_order.iter().position(|&p| p == id)?;
        let n = self.pane_order.len();
        (n > 1).then(|| self.pane_order[(index + 1) % n])
    }

    /// Cycle focus in creation order
    pub fn focus_next(&mut self) -> Redraw {
        let next = match self.active_pane {
            Some(active) => self.neighbour_in_order(active),
            None => self.pane_order.first().copied(),
        };
        match next {
            Some(next) if Some(next) != self.active_pane => {
                self.active_pane = Some(next);
                Redraw::CURSOR | Redraw::BORDERS
            }
            _ => Redraw::empty(),
        }
    }

    /// Focus the pane found two cells past the active pane's edge
    pub fn move_focus(&mut self, direction: Direction) -> Redraw {
        let Some(active) = self.active_pane() else {
            return Redraw::empty();
        };
        let loc = active.location();
        let (px, py) = (loc.x as i32, loc.y as i32);
        let (sx, sy) = (loc.width as i32, loc.height as i32);

        let (x, y) = match direction {
            Direction::Up => (px, py - 2),
            Direction::Down => (px, py + sy + 2),
            Direction::Left => (px - 2, py),
            Direction::Right => (px + sx + 2, py),
        };

        let target = self
            .pane_order
            .iter()
            .copied()
            .find(|id| self.panes.get(id).is_some_and(|p| p.is_inside(x, y)));

        match target {
            Some(id) if Some(id) != self.active_pane => {
                self.active_pane = Some(id);
                Redraw::CURSOR | Redraw::BORDERS
            }
            _ => Redraw::empty(),
        }
    }

    /// Move the active pane's boundary toward `direction`
    pub fn resize_active_tile(&mut self, direction: Direction, amount: u16) -> Result<Redraw, LayoutError> {
        let Some(leaf) = self.active_pane.and_then(|a| self.layout.leaf_of(a)) else {
            return Ok(Redraw::empty());
        };
        if !self.layout.resize_tile(leaf, direction, amount)? {
            return Ok(Redraw::empty());
        }
        self.reflow();
        Ok(Redraw::ALL)
    }

    pub fn active_pane_id(&self) -> Option<PaneId> {
        self.active_pane
    }

    pub fn active_pane(&self) -> Option<&Pane> {
        self.active_pane.and_then(|id| self.panes.get(&id))
    }

    pub fn pane(&self, id: PaneId) -> Option<&Pane> {
        self.panes.get(&id)
    }

    pub fn pane_mut(&mut self, id: PaneId) -> Option<&mut Pane> {
        self.panes.get_mut(&id)
    }

    pub fn contains_pane(&self, id: PaneId) -> bool {
        self.panes.contains_key(&id)
    }

    /// Panes in creation order
    pub fn panes(&self) -> impl Iterator<Item = &Pane> {
        self.pane_order.iter().filter_map(|id| self.panes.get(id))
    }

    pub fn pane_count(&self) -> usize {
        self.panes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panes.is_empty()
    }

    /// Display name of the window, taken from its active pane
    pub fn name(&self) -> String {
        self.active_pane()
            .map(Pane::display_title)
            .unwrap_or_default()
    }

    /// Every framed cell inside the window, keyed by (row, col)
    pub fn border_map(&self) -> BTreeMap<(u16, u16), BorderCell> {
        let area = self.location();
        let (max_x, max_y) = (
            area.x as i32 + area.width as i32,
            area.y as i32 + area.height as i32,
        );
        let mut cells: BTreeMap<(u16, u16), BorderCell> = BTreeMap::new();

        for pane in self.panes() {
            let is_active = self.active_pane == Some(pane.id);
            for (x, y) in frame_cells(pane.location()) {
                if x < area.x as i32 || y < area.y as i32 || x >= max_x || y >= max_y {
                    continue;
                }
                let CellPosition::Border(edges) = pane.cell_position(x, y) else {
                    continue;
                };
                let entry = cells.entry((y as u16, x as u16)).or_insert(BorderCell {
                    lines: Compass::empty(),
                    active: false,
                });
                entry.lines |= edges.line_directions();
                entry.active |= is_active;
            }
        }
        cells
    }
}

/// The one-cell ring around a rectangle
fn frame_cells(loc: Location) -> impl Iterator<Item = (i32, i32)> {
    let (px, py) = (loc.x as i32, loc.y as i32);
    let (sx, sy) = (loc.width as i32, loc.height as i32);
    let horizontal = (px - 1..=px + sx).flat_map(move |x| [(x, py - 1), (x, py + sy)]);
    let vertical = (py..py + sy).flat_map(move |y| [(px - 1, y), (px + sx, y)]);
    horizontal.chain(vertical)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(width: u16, height: u16) -> Window {
        Window::new(Location::new(0, 0, width, height))
    }

    fn sh() -> CommandSpec {
        CommandSpec::new("/bin/sh")
    }

    #[test]
    fn test_first_pane_fills_window() {
        let mut w = window(80, 23);
        let (id, redraw) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        assert_eq!(redraw, Redraw::ALL);
        assert_eq!(w.active_pane_id(), Some(id));
        assert_eq!(w.pane(id).unwrap().location(), Location::new(0, 0, 80, 23));
    }

    #[test]
    fn test_side_by_side_split() {
        let mut w = window(80, 23);
        let (a, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        let (b, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        assert_eq!(w.active_pane_id(), Some(b));
        assert_eq!(w.pane(a).unwrap().location(), Location::new(0, 0, 40, 23));
        assert_eq!(w.pane(b).unwrap().location(), Location::new(41, 0, 39, 23));
    }

    #[test]
    fn test_stacked_split() {
        let mut w = window(80, 23);
        let (a, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        let (b, _) = w.create_new_pane(sh(), Orientation::Vertical).unwrap();
        assert_eq!(w.pane(a).unwrap().location(), Location::new(0, 0, 80, 11));
        assert_eq!(w.pane(b).unwrap().location(), Location::new(0, 12, 80, 11));
    }

    #[test]
    fn test_focus_next_wraps() {
        let mut w = window(80, 23);
        let (a, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        let (b, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        assert_eq!(w.focus_next(), Redraw::CURSOR | Redraw::BORDERS);
        assert_eq!(w.active_pane_id(), Some(a));
        w.focus_next();
        assert_eq!(w.active_pane_id(), Some(b));
    }

    #[test]
    fn test_focus_next_single_pane_is_noop() {
        let mut w = window(80, 23);
        w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        assert_eq!(w.focus_next(), Redraw::empty());
    }

    #[test]
    fn test_move_focus_finds_neighbours() {
        let mut w = window(80, 23);
        let (a, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        let (b, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();

        assert_eq!(w.move_focus(Direction::Left), Redraw::CURSOR | Redraw::BORDERS);
        assert_eq!(w.active_pane_id(), Some(a));

        // Nothing further left or above.
        assert_eq!(w.move_focus(Direction::Left), Redraw::empty());
        assert_eq!(w.move_focus(Direction::Up), Redraw::empty());
        assert_eq!(w.active_pane_id(), Some(a));

        w.move_focus(Direction::Right);
        assert_eq!(w.active_pane_id(), Some(b));
    }

    #[test]
    fn test_remove_active_pane_focuses_next() {
        let mut w = window(80, 23);
        let (a, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        let (b, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();

        let removed = w.remove_pane(b).unwrap();
        assert_eq!(removed.map(|p| p.id), Some(b));
        assert_eq!(w.active_pane_id(), Some(a));
        assert_eq!(w.pane(a).unwrap().location(), Location::new(0, 0, 80, 23));

        w.remove_pane(a).unwrap();
        assert!(w.is_empty());
        assert_eq!(w.active_pane_id(), None);
    }

    #[test]
    fn test_resize_active_tile() {
        let mut w = window(80, 23);
        let (a, _) = w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        w.move_focus(Direction::Left);

        assert_eq!(w.resize_active_tile(Direction::Right, 4).unwrap(), Redraw::ALL);
        assert_eq!(w.pane(a).unwrap().location().width, 44);
    }

    #[test]
    fn test_border_map_joins_lines() {
        let mut w = window(20, 5);
        w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        w.create_new_pane(sh(), Orientation::Horizontal).unwrap();

        let borders = w.border_map();
        // Left pane is 10 wide, so the divider runs down column 10.
        for row in 0..5 {
            let cell = borders[&(row, 10)];
            assert_eq!(cell.lines, Compass::TOP | Compass::BOTTOM);
            assert!(cell.active);
        }
        assert_eq!(borders.len(), 5);
    }

    #[test]
    fn test_border_map_stacked() {
        let mut w = window(21, 5);
        w.create_new_pane(sh(), Orientation::Horizontal).unwrap();
        w.create_new_pane(sh(), Orientation::Vertical).unwrap();

        let (a, b) = {
            let ids: Vec<_> = w.panes().map(|p| p.id).collect();
            (ids[0], ids[1])
        };
        assert_eq!(w.pane(a).unwrap().location(), Location::new(0, 0, 21, 2));
        assert_eq!(w.pane(b).unwrap().location(), Location::new(0, 3, 21, 2));

        let borders = w.border_map();
        assert_eq!(borders[&(2, 5)].lines, Compass::LEFT | Compass::RIGHT);
        assert_eq!(borders.len(), 21);
    }
}
