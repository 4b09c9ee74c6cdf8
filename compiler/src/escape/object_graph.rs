//! Object-flow graph
//!
//! One node per abstract storage location of an SCC; an edge `dst <- src`
//! with a dereference delta records that the value of `src`, dereferenced
//! `derefs` times (`-1` meaning "the address of `src`"), flows into `dst`.
//! Edges are stored at their destination because propagation walks them
//! backwards from sinks.
//!
//! Nothing is ever removed from a graph, and node statuses only go up.

use crate::ir::{DeclId, ExprId, FunctionId, NodeId, SourceLocation, TempId};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use log::trace;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Scope depth of a Phantom: it outlives everything in the function
pub const PHANTOM_DEPTH: i32 = -1;

/// Scope depth of formal parameters
pub const PARAMETER_DEPTH: i32 = 0;

/// Scope depth of caller-side argument placeholders; they never outlive anything
pub const ARGUMENT_DEPTH: i32 = i32::MAX;

/// Escape status of a node, ordered from least to most escaped
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EscapeStatus {
    /// Not reached by propagation yet
    #[default]
    Unknown,
    /// Does not escape
    None,
    /// Its address is held by something in the same function that does not
    /// outlive it
    Scope,
    /// Must live on the heap
    Heap,
}

impl fmt::Display for EscapeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::None => write!(f, "none"),
            Self::Scope => write!(f, "scope"),
            Self::Heap => write!(f, "heap"),
        }
    }
}

/// A formal parameter, by position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamRef {
    pub function: FunctionId,
    pub index: usize,
}

/// Identity of an allocation site
///
/// Sites are keyed by source location. An expression without a location is
/// keyed by its own id instead, so it never merges with other sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AllocationKey {
    pub location: SourceLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<ExprId>,
}

impl AllocationKey {
    pub fn new(location: SourceLocation, expr: ExprId) -> Self {
        Self {
            location,
            expr: (!location.is_valid()).then_some(expr),
        }
    }

    /// Key of the site at `location`
    pub fn at(location: SourceLocation) -> Self {
        Self {
            location,
            expr: None,
        }
    }
}

impl fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expr {
            Some(expr) => write!(f, "{}", expr),
            None => write!(f, "{}", self.location),
        }
    }
}

/// What a node stands for; also its identity within a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// `new`, composite literal, `make`, closure object or implicit `&rvalue`
    Allocation(AllocationKey),
    /// Formal parameter of a function in the context
    Parameter(ParamRef),
    /// Caller-side stand-in for a callee parameter known not to leak
    Argument { caller: FunctionId, param: ParamRef },
    Local(DeclId),
    Temporary(TempId),
    /// Everything outside the function: globals, callers, unknown callees
    Phantom(FunctionId),
}

impl NodeKind {
    pub fn is_phantom(&self) -> bool {
        matches!(self, Self::Phantom(_))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation(key) => write!(f, "alloc@{}", key),
            Self::Parameter(param) => write!(f, "param#{} of {}", param.index, param.function),
            Self::Argument { caller, param } => write!(
                f,
                "arg#{} of {} in {}",
                param.index, param.function, caller
            ),
            Self::Local(decl) => write!(f, "local {}", decl),
            Self::Temporary(temp) => write!(f, "temp {}", temp),
            Self::Phantom(function) => write!(f, "phantom of {}", function),
        }
    }
}

/// The IR entity a node was created for, kept for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Expr(ExprId),
    Decl(DeclId),
}

/// Incoming edge, stored at its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub src: NodeId,
    /// `-1` address taken, `0` copy, `n > 0` n dereferences
    pub derefs: i32,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Function whose body created the node
    pub owner: FunctionId,
    pub origin: Option<Origin>,
    /// Loop nesting depth at creation
    pub scope_depth: i32,
    status: EscapeStatus,
    forced: bool,
    incoming: SmallVec<[Edge; 4]>,
}

impl Node {
    pub fn status(&self) -> EscapeStatus {
        self.status
    }

    /// Whether the status was pinned before propagation started
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn incoming(&self) -> &[Edge] {
        &self.incoming
    }
}

/// Phantom and parameter nodes of one function in a context
#[derive(Debug, Clone)]
pub struct FunctionNodes {
    pub phantom: NodeId,
    pub params: Vec<NodeId>,
}

/// Analysis context of one SCC: the node arena plus its identity maps
#[derive(Debug, Default)]
pub struct EscapeContext {
    nodes: Vec<Node>,
    identities: FxHashMap<NodeKind, NodeId>,
    expr_nodes: FxHashMap<ExprId, NodeId>,
    functions: IndexMap<FunctionId, FunctionNodes>,
    edge_count: usize,
}

impl EscapeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node for `kind`, creating it on first request
    ///
    /// Phantoms start out as `Heap`; everything else starts `Unknown`.
    pub fn create_node(
        &mut self,
        kind: NodeKind,
        owner: FunctionId,
        origin: Option<Origin>,
        scope_depth: i32,
    ) -> NodeId {
        if let Some(&existing) = self.identities.get(&kind) {
            return existing;
        }

        let id = NodeId::from_raw(self.nodes.len() as u32);
        let status = if kind.is_phantom() {
            EscapeStatus::Heap
        } else {
            EscapeStatus::Unknown
        };
        self.nodes.push(Node {
            id,
            kind,
            owner,
            origin,
            scope_depth,
            status,
            forced: false,
            incoming: SmallVec::new(),
        });
        self.identities.insert(kind, id);
        id
    }

    pub fn lookup(&self, kind: &NodeKind) -> Option<NodeId> {
        self.identities.get(kind).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Remember which node an allocating expression produced
    pub fn bind_expr(&mut self, expr: ExprId, node: NodeId) {
        self.expr_nodes.insert(expr, node);
    }

    pub fn expr_node(&self, expr: ExprId) -> Option<NodeId> {
        self.expr_nodes.get(&expr).copied()
    }

    /// Record `dst <- src` with `derefs`; returns false if the edge already existed
    pub fn add_edge(&mut self, dst: NodeId, src: NodeId, derefs: i32) -> bool {
        let edge = Edge { src, derefs };
        let incoming = &mut self.nodes[dst.index()].incoming;
        if incoming.contains(&edge) {
            return false;
        }
        incoming.push(edge);
        self.edge_count += 1;
        true
    }

    /// Raise the status of `node` to at least `status`; returns whether it changed
    pub fn raise(&mut self, node: NodeId, status: EscapeStatus) -> bool {
        let entry = &mut self.nodes[node.index()];
        if status <= entry.status {
            return false;
        }
        trace!("{} ({}): {} -> {}", entry.kind, node, entry.status, status);
        entry.status = status;
        true
    }

    /// Pin a status before propagation
    pub fn force(&mut self, node: NodeId, status: EscapeStatus) {
        self.raise(node, status);
        self.nodes[node.index()].forced = true;
    }

    pub fn register_function(&mut self, function: FunctionId, nodes: FunctionNodes) {
        self.functions.insert(function, nodes);
    }

    pub fn function_nodes(&self, function: FunctionId) -> Option<&FunctionNodes> {
        self.functions.get(&function)
    }

    /// Member functions in registration order
    pub fn functions(&self) -> impl Iterator<Item = (FunctionId, &FunctionNodes)> {
        self.functions.iter().map(|(id, nodes)| (*id, nodes))
    }

    pub fn contains_function(&self, function: FunctionId) -> bool {
        self.functions.contains_key(&function)
    }

    /// The parameter a node stands for, if it is a parameter of a member function
    pub fn own_parameter(&self, node: NodeId) -> Option<ParamRef> {
        match self.node(node).kind {
            NodeKind::Parameter(param) if self.contains_function(param.function) => Some(param),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f0() -> FunctionId {
        FunctionId::from_raw(0)
    }

    #[test]
    fn test_create_node_is_idempotent_per_identity() {
        let mut ctx = EscapeContext::new();
        let kind = NodeKind::Local(DeclId::from_raw(4));
        let a = ctx.create_node(kind, f0(), None, 0);
        let b = ctx.create_node(kind, f0(), None, 3);
        assert_eq!(a, b);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.node(a).scope_depth, 0);

        let other = ctx.create_node(NodeKind::Local(DeclId::from_raw(5)), f0(), None, 0);
        assert_ne!(a, other);
        assert_eq!(ctx.lookup(&kind), Some(a));
    }

    #[test]
    fn test_phantom_starts_heap() {
        let mut ctx = EscapeContext::new();
        let phantom = ctx.create_node(NodeKind::Phantom(f0()), f0(), None, PHANTOM_DEPTH);
        assert_eq!(ctx.node(phantom).status(), EscapeStatus::Heap);
    }

    #[test]
    fn test_duplicate_edges_are_ignored() {
        let mut ctx = EscapeContext::new();
        let x = ctx.create_node(NodeKind::Local(DeclId::from_raw(0)), f0(), None, 0);
        let y = ctx.create_node(NodeKind::Local(DeclId::from_raw(1)), f0(), None, 0);

        assert!(ctx.add_edge(x, y, -1));
        assert!(!ctx.add_edge(x, y, -1));
        assert!(ctx.add_edge(x, y, 0));
        assert_eq!(ctx.node(x).incoming().len(), 2);
        assert_eq!(ctx.edge_count(), 2);
        assert!(ctx.node(y).incoming().is_empty());
    }

    #[test]
    fn test_raise_is_monotonic() {
        let mut ctx = EscapeContext::new();
        let x = ctx.create_node(NodeKind::Temporary(TempId::from_raw(0)), f0(), None, 0);

        assert!(ctx.raise(x, EscapeStatus::Scope));
        assert!(!ctx.raise(x, EscapeStatus::None));
        assert_eq!(ctx.node(x).status(), EscapeStatus::Scope);
        assert!(ctx.raise(x, EscapeStatus::Heap));
        assert!(!ctx.raise(x, EscapeStatus::Heap));
    }

    #[test]
    fn test_own_parameter_requires_member_function() {
        let mut ctx = EscapeContext::new();
        let own = ParamRef {
            function: f0(),
            index: 0,
        };
        let foreign = ParamRef {
            function: FunctionId::from_raw(9),
            index: 0,
        };
        let phantom = ctx.create_node(NodeKind::Phantom(f0()), f0(), None, PHANTOM_DEPTH);
        let p = ctx.create_node(NodeKind::Parameter(own), f0(), None, PARAMETER_DEPTH);
        let q = ctx.create_node(NodeKind::Parameter(foreign), f0(), None, PARAMETER_DEPTH);
        ctx.register_function(
            f0(),
            FunctionNodes {
                phantom,
                params: vec![p],
            },
        );

        assert_eq!(ctx.own_parameter(p), Some(own));
        assert_eq!(ctx.own_parameter(q), None);
        assert_eq!(ctx.own_parameter(phantom), None);
    }
}
