//! Layout - tiles a window's rectangle among its panes
//!
//! The tree lives in an arena: nodes refer to their parent by index only, and
//! containers own their children top-down. Leaves carry a `PaneId`; the
//! window pushes leaf rectangles into the panes after every change
//! (see `Window::reflow`).

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;

use super::pane::PaneId;

/// Index of a node inside a `LayoutTree`
pub type NodeId = usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("node {child} already belongs to container {parent}")]
    AlreadyParented { child: NodeId, parent: NodeId },

    #[error("node {0} is not attached to a container")]
    NotAChild(NodeId),

    #[error("node {0} is a pane and cannot hold children")]
    NotAContainer(NodeId),

    #[error("unknown layout node {0}")]
    UnknownNode(NodeId),

    #[error("invalid direction: {0:?}")]
    InvalidDirection(String),
}

pub type Result<T> = std::result::Result<T, LayoutError>;

/// Rectangle in terminal cells
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Location {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Location {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    /// Whether the cell lies within the rectangle
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (px, py) = (self.x as i32, self.y as i32);
        px <= x && x < px + self.width as i32 && py <= y && y < py + self.height as i32
    }

    /// Classify a cell relative to this rectangle and its one-cell frame.
    pub fn cell_position(&self, x: i32, y: i32) -> CellPosition {
        let (px, py) = (self.x as i32, self.y as i32);
        let (sx, sy) = (self.width as i32, self.height as i32);

        if x < px - 1 || x > px + sx || y < py - 1 || y > py + sy {
            return CellPosition::Outside;
        }

        let mut edges = Compass::empty();
        if y == py - 1 {
            edges |= Compass::TOP;
        }
        if y == py + sy {
            edges |= Compass::BOTTOM;
        }
        if x == px - 1 {
            edges |= Compass::LEFT;
        }
        if x == px + sx {
            edges |= Compass::RIGHT;
        }

        if edges.is_empty() {
            CellPosition::Inside
        } else {
            CellPosition::Border(edges)
        }
    }
}

bitflags! {
    /// Four compass bits, used both for "which edge" and "which way a line runs"
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Compass: u8 {
        const TOP    = 0b0001;
        const BOTTOM = 0b0010;
        const LEFT   = 0b0100;
        const RIGHT  = 0b1000;
    }
}

impl Compass {
    /// Map the edges a cell sits on to the directions its border line runs.
    ///
    /// A top edge is a horizontal line, a top-left corner runs right and down,
    /// and so on. OR-ing the result over every pane gives the joined glyph.
    pub fn line_directions(self) -> Compass {
        let vertical_edge = self.intersects(Compass::LEFT | Compass::RIGHT);
        let horizontal_edge = self.intersects(Compass::TOP | Compass::BOTTOM);

        match (horizontal_edge, vertical_edge) {
            (true, false) => Compass::LEFT | Compass::RIGHT,
            (false, true) => Compass::TOP | Compass::BOTTOM,
            (true, true) => {
                let mut lines = Compass::empty();
                lines |= if self.contains(Compass::TOP) { Compass::BOTTOM } else { Compass::TOP };
                lines |= if self.contains(Compass::LEFT) { Compass::RIGHT } else { Compass::LEFT };
                lines
            }
            (false, false) => Compass::empty(),
        }
    }
}

/// Where a cell sits relative to one pane
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CellPosition {
    Outside,
    Inside,
    Border(Compass),
}

/// Orientation of a tile container
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Orientation {
    Horizontal, // Children left to right (vertical borders)
    Vertical,   // Children top to bottom (horizontal borders)
}

/// Compass direction for focus movement and tile resizing
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Split axis along which this direction moves
    pub fn axis(self) -> Orientation {
        match self {
            Direction::Left | Direction::Right => Orientation::Horizontal,
            Direction::Up | Direction::Down => Orientation::Vertical,
        }
    }

    fn is_forward(self) -> bool {
        matches!(self, Direction::Right | Direction::Down)
    }
}

impl FromStr for Direction {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "u" | "up" => Ok(Direction::Up),
            "d" | "down" => Ok(Direction::Down),
            "l" | "left" => Ok(Direction::Left),
            "r" | "right" => Ok(Direction::Right),
            _ => Err(LayoutError::InvalidDirection(s.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        };
        f.write_str(name)
    }
}

/// Split `available` cells into `n` buckets.
///
/// Every bucket gets `available / n`; the first `available % n` buckets get
/// one more.
pub fn divide_equally(available: u16, n: usize) -> Vec<u16> {
    if n == 0 {
        return Vec::new();
    }
    let base = available as usize / n;
    let extra = available as usize % n;
    (0..n)
        .map(|i| (base + usize::from(i < extra)) as u16)
        .collect()
}

/// Adjust existing extents to a new total, keeping their proportions roughly.
fn redistribute(extents: &mut [u16], available: u16) {
    let n = extents.len();
    let current: u32 = extents.iter().map(|&e| e as u32).sum();
    let target = available as u32;

    if target >= current {
        let grow = divide_equally((target - current) as u16, n);
        for (extent, g) in extents.iter_mut().zip(grow) {
            *extent += g;
        }
        return;
    }

    // Shrink; nobody drops below one cell while that is still possible.
    let mut remaining = current - target;
    while remaining > 0 {
        let shrinkable = extents.iter().filter(|&&e| e > 1).count();
        if shrinkable == 0 {
            break;
        }
        let shares = divide_equally(remaining.min(u16::MAX as u32) as u16, shrinkable);
        let mut shares = shares.into_iter();
        for extent in extents.iter_mut().filter(|e| **e > 1) {
            let share = shares.next().unwrap_or(0);
            let taken = share.min(*extent - 1);
            *extent -= taken;
            remaining -= taken as u32;
        }
        if extents.iter().all(|&e| e <= 1) {
            break;
        }
    }

    if remaining > 0 {
        let fresh = divide_equally(available, n);
        extents.copy_from_slice(&fresh);
    }
}

#[derive(Debug)]
enum NodeKind {
    Leaf(PaneId),
    Tile {
        orientation: Orientation,
        children: Vec<NodeId>,
        /// Extent of each child along the split axis; empty means "recompute"
        extents: Vec<u16>,
    },
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    location: Location,
}

/// Arena-backed tiling tree; the root is always a tile container
#[derive(Debug)]
pub struct LayoutTree {
    nodes: Vec<Option<Node>>,
    root: NodeId,
}

impl LayoutTree {
    /// Create an empty tree with a root container of the given orientation
    pub fn new(orientation: Orientation) -> Self {
        let root = Node {
            kind: NodeKind::Tile {
                orientation,
                children: Vec::new(),
                extents: Vec::new(),
            },
            parent: None,
            location: Location::default(),
        };
        Self {
            nodes: vec![Some(root)],
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Create a detached leaf for a pane
    pub fn new_leaf(&mut self, pane_id: PaneId) -> NodeId {
        self.alloc(NodeKind::Leaf(pane_id))
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Some(Node {
            kind,
            parent: None,
            location: Location::default(),
        }));
        self.nodes.len() - 1
    }

    fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(LayoutError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(LayoutError::UnknownNode(id))
    }

    fn children_mut(&mut self, id: NodeId) -> Result<(&mut Vec<NodeId>, &mut Vec<u16>)> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Tile { children, extents, .. } => Ok((children, extents)),
            NodeKind::Leaf(_) => Err(LayoutError::NotAContainer(id)),
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).ok().and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match self.node(id).map(|n| &n.kind) {
            Ok(NodeKind::Tile { children, .. }) => children,
            _ => &[],
        }
    }

    pub fn orientation(&self, id: NodeId) -> Option<Orientation> {
        match self.node(id).ok()?.kind {
            NodeKind::Tile { orientation, .. } => Some(orientation),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn location(&self, id: NodeId) -> Option<Location> {
        self.node(id).ok().map(|n| n.location)
    }

    /// Find the leaf holding a pane
    pub fn leaf_of(&self, pane_id: PaneId) -> Option<NodeId> {
        self.nodes.iter().position(|slot| {
            matches!(slot, Some(Node { kind: NodeKind::Leaf(id), .. }) if *id == pane_id)
        })
    }

    /// Leaves in tree order with their current rectangles
    pub fn leaves(&self) -> Vec<(PaneId, Location)> {
        let mut out = Vec::new();
        self.collect_leaves(self.root, &mut out);
        out
    }

    fn collect_leaves(&self, id: NodeId, out: &mut Vec<(PaneId, Location)>) {
        let Ok(node) = self.node(id) else { return };
        match &node.kind {
            NodeKind::Leaf(pane_id) => out.push((*pane_id, node.location)),
            NodeKind::Tile { children, .. } => {
                for &child in children {
                    self.collect_leaves(child, out);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children(self.root).is_empty()
    }

    /// Assign a rectangle to a node and lay out everything below it.
    pub fn set_location(&mut self, id: NodeId, location: Location) -> Result<()> {
        let node = self.node_mut(id)?;
        node.location = location;

        let NodeKind::Tile { orientation, children, extents } = &mut node.kind else {
            return Ok(());
        };
        if children.is_empty() {
            return Ok(());
        }

        let n = children.len();
        let axis_len = match orientation {
            Orientation::Horizontal => location.width,
            Orientation::Vertical => location.height,
        };
        let available = axis_len.saturating_sub((n - 1) as u16);

        if extents.len() != n {
            *extents = divide_equally(available, n);
        } else if extents.iter().map(|&e| e as u32).sum::<u32>() != available as u32 {
            redistribute(extents, available);
        }

        let orientation = *orientation;
        let placements: Vec<(NodeId, Location)> = {
            let mut offset = 0u16;
            children
                .iter()
                .zip(extents.iter())
                .map(|(&child, &extent)| {
                    let loc = match orientation {
                        Orientation::Horizontal => Location::new(
                            location.x.saturating_add(offset),
                            location.y,
                            extent,
                            location.height,
                        ),
                        Orientation::Vertical => Location::new(
                            location.x,
                            location.y.saturating_add(offset),
                            location.width,
                            extent,
                        ),
                    };
                    offset = offset.saturating_add(extent).saturating_add(1);
                    (child, loc)
                })
                .collect()
        };

        for (child, loc) in placements {
            self.set_location(child, loc)?;
        }
        Ok(())
    }

    /// Lay out a node again with its current rectangle
    fn relayout(&mut self, id: NodeId) -> Result<()> {
        let location = self.node(id)?.location;
        self.set_location(id, location)
    }

    /// Attach `child` to the container `parent`.
    ///
    /// Fails if the child already sits in a different container and
    /// `replace_parent` is not set.
    pub fn add(&mut self, parent: NodeId, child: NodeId, replace_parent: bool) -> Result<()> {
        self.attach(parent, child, None, replace_parent)?;
        self.relayout(parent)
    }

    fn attach(
        &mut self,
        parent: NodeId,
        child: NodeId,
        after: Option<NodeId>,
        replace_parent: bool,
    ) -> Result<()> {
        self.children_mut(parent)?;
        let current = self.node(child)?.parent;

        match current {
            Some(existing) if existing == parent => return Ok(()),
            Some(existing) if !replace_parent => {
                return Err(LayoutError::AlreadyParented {
                    child,
                    parent: existing,
                });
            }
            Some(existing) => self.detach(existing, child)?,
            None => {}
        }

        let (children, extents) = self.children_mut(parent)?;
        let index = after
            .and_then(|sibling| children.iter().position(|&c| c == sibling))
            .map(|i| i + 1)
            .unwrap_or(children.len());
        children.insert(index, child);
        extents.clear();

        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    fn detach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let (children, extents) = self.children_mut(parent)?;
        let index = children
            .iter()
            .position(|&c| c == child)
            .ok_or(LayoutError::NotAChild(child))?;
        children.remove(index);
        extents.clear();
        self.node_mut(child)?.parent = None;
        Ok(())
    }

    /// Detach `child` from its container and free its subtree.
    ///
    /// A non-root container left empty is removed as well.
    pub fn remove(&mut self, child: NodeId) -> Result<()> {
        let parent = self.node(child)?.parent.ok_or(LayoutError::NotAChild(child))?;
        self.detach(parent, child)?;
        self.free(child);

        if parent != self.root && self.children(parent).is_empty() {
            return self.remove(parent);
        }
        self.relayout(parent)
    }

    fn free(&mut self, id: NodeId) {
        let children = self.children(id).to_vec();
        for child in children {
            self.free(child);
        }
        if let Some(slot) = self.nodes.get_mut(id) {
            *slot = None;
        }
    }

    /// Insert `child` next to `after_sibling` inside a new split container.
    ///
    /// The new container takes the sibling's slot in `container`. Without a
    /// sibling, the child is added to the root. Returns the container that now
    /// holds the child.
    pub fn split(
        &mut self,
        container: NodeId,
        child: NodeId,
        orientation: Orientation,
        after_sibling: Option<NodeId>,
    ) -> Result<NodeId> {
        if let Some(existing) = self.node(child)?.parent {
            return Err(LayoutError::AlreadyParented {
                child,
                parent: existing,
            });
        }

        let Some(sibling) = after_sibling else {
            let root = self.root;
            self.attach(root, child, None, false)?;
            self.relayout(root)?;
            return Ok(root);
        };

        let index = self
            .children(container)
            .iter()
            .position(|&c| c == sibling)
            .ok_or(LayoutError::NotAChild(sibling))?;

        let split = self.alloc(NodeKind::Tile {
            orientation,
            children: Vec::new(),
            extents: Vec::new(),
        });

        // The split container inherits the sibling's slot and extent.
        {
            let (children, _) = self.children_mut(container)?;
            children[index] = split;
        }
        self.node_mut(split)?.parent = Some(container);
        self.node_mut(sibling)?.parent = None;

        self.attach(split, sibling, None, true)?;
        self.attach(split, child, Some(sibling), false)?;

        let root = self.root;
        self.relayout(root)?;
        Ok(split)
    }

    /// Move the boundary next to `leaf` by `amount` cells toward `direction`.
    ///
    /// The boundary between the leaf's branch and its neighbour in
    /// `direction` is preferred (the branch grows); failing that, the
    /// boundary on the opposite side moves (the branch shrinks). No child is
    /// shrunk below one cell. Returns false when no boundary exists on that
    /// axis.
    pub fn resize_tile(&mut self, leaf: NodeId, direction: Direction, amount: u16) -> Result<bool> {
        if self.shift_boundary(leaf, direction, amount, true)? {
            return Ok(true);
        }
        self.shift_boundary(leaf, direction, amount, false)
    }

    fn shift_boundary(
        &mut self,
        leaf: NodeId,
        direction: Direction,
        amount: u16,
        grow: bool,
    ) -> Result<bool> {
        let neighbour_forward = direction.is_forward() == grow;
        let mut node = leaf;

        while let Some(parent) = self.node(node)?.parent {
            if self.orientation(parent) == Some(direction.axis()) {
                let children = self.children(parent);
                let index = children
                    .iter()
                    .position(|&c| c == node)
                    .ok_or(LayoutError::NotAChild(node))?;
                let neighbour = if neighbour_forward {
                    Some(index + 1).filter(|&i| i < children.len())
                } else {
                    index.checked_sub(1)
                };

                if let Some(neighbour) = neighbour {
                    let (_, extents) = self.children_mut(parent)?;
                    if extents.len() <= index.max(neighbour) {
                        return Ok(false);
                    }
                    let (growing, shrinking) = if grow {
                        (index, neighbour)
                    } else {
                        (neighbour, index)
                    };
                    let moved = amount.min(extents[shrinking].saturating_sub(1));
                    extents[shrinking] -= moved;
                    extents[growing] += moved;
                    self.relayout(parent)?;
                    return Ok(true);
                }
            }
            node = parent;
        }
        Ok(false)
    }
}
