//! The host side of a frame: state-sorted draw list, camera and the state
//! stack the engine must leave untouched.

use glam::Mat4;

use crate::backend::Viewport;
use crate::context::ContextToken;
use crate::types::Aabb;

/// Id of a host state set. Extra shaders are attached per state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StateSetId(pub u32);

/// One recorded draw.
pub struct Leaf<G> {
    pub geometry: G,
    /// Eye space bounds used by approximate min/max estimation.
    pub bounds: Option<Aabb>,
}

impl<G> Leaf<G> {
    pub fn new(geometry: G) -> Self {
        Self {
            geometry,
            bounds: None,
        }
    }

    pub fn with_bounds(mut self, bounds: Aabb) -> Self {
        self.bounds = Some(bounds);
        self
    }
}

/// Leaves sharing a state set, with the state sets applied above it.
pub struct StateGraph<G> {
    pub state: StateSetId,
    pub ancestors: Vec<StateSetId>,
    pub leaves: Vec<Leaf<G>>,
}

impl<G> StateGraph<G> {
    pub fn new(state: StateSetId) -> Self {
        Self {
            state,
            ancestors: Vec::new(),
            leaves: Vec::new(),
        }
    }

    pub fn with_ancestors(mut self, ancestors: Vec<StateSetId>) -> Self {
        self.ancestors = ancestors;
        self
    }

    pub fn with_leaf(mut self, leaf: Leaf<G>) -> Self {
        self.leaves.push(leaf);
        self
    }
}

/// The host's stack of applied state sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateStack {
    sets: Vec<StateSetId>,
}

impl StateStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: StateSetId) {
        self.sets.push(state);
    }

    pub fn pop(&mut self) -> Option<StateSetId> {
        self.sets.pop()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Pops until `len` sets remain.
    pub fn pop_to(&mut self, len: usize) {
        self.sets.truncate(len);
    }

    pub fn top(&self) -> Option<StateSetId> {
        self.sets.last().copied()
    }
}

/// Host render state the engine saves at frame start and restores at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    /// Framebuffer bound by the host, if any.
    pub framebuffer: Option<u64>,
    pub stack: StateStack,
}

/// Camera of the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    /// Identity of the host camera; canvases are rebuilt when it changes.
    pub id: u64,
    pub projection: Mat4,
    pub viewport: Viewport,
}

impl Camera {
    pub fn new(id: u64, projection: Mat4, viewport: Viewport) -> Self {
        Self {
            id,
            projection,
            viewport,
        }
    }
}

/// Everything the host hands over for one frame of one context.
pub struct RenderInfo<G> {
    pub context: ContextToken,
    pub camera: Camera,
    pub state_graphs: Vec<StateGraph<G>>,
    pub host: HostState,
}

impl<G> RenderInfo<G> {
    pub fn new(context: ContextToken, camera: Camera) -> Self {
        Self {
            context,
            camera,
            state_graphs: Vec::new(),
            host: HostState::default(),
        }
    }

    pub fn with_state_graph(mut self, graph: StateGraph<G>) -> Self {
        self.state_graphs.push(graph);
        self
    }

    /// Leaves in draw order, numbered the way occlusion queries index them.
    pub fn leaves(&self) -> impl Iterator<Item = (StateSetId, &Leaf<G>)> {
        self.state_graphs
            .iter()
            .flat_map(|graph| graph.leaves.iter().map(move |leaf| (graph.state, leaf)))
    }

    pub fn leaf_count(&self) -> usize {
        self.state_graphs.iter().map(|g| g.leaves.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_stack_pop_to_restores_depth() {
        let mut stack = StateStack::new();
        stack.push(StateSetId(1));
        let saved = stack.len();
        stack.push(StateSetId(2));
        stack.push(StateSetId(3));
        stack.pop_to(saved);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.top(), Some(StateSetId(1)));
    }

    #[test]
    fn test_leaves_flatten_in_draw_order() {
        let camera = Camera::new(1, Mat4::IDENTITY, Viewport::sized(1, 1));
        let info = RenderInfo::new(ContextToken(0), camera)
            .with_state_graph(StateGraph::new(StateSetId(4)).with_leaf(Leaf::new('a')))
            .with_state_graph(
                StateGraph::new(StateSetId(5))
                    .with_leaf(Leaf::new('b'))
                    .with_leaf(Leaf::new('c')),
            );
        let order: Vec<_> = info.leaves().map(|(s, l)| (s.0, l.geometry)).collect();
        assert_eq!(order, vec![(4, 'a'), (5, 'b'), (5, 'c')]);
        assert_eq!(info.leaf_count(), 3);
    }
}
