//! Escape propagation
//!
//! Floods the object-flow graph of one SCC backwards from every root,
//! tracking how many dereferences separate each reached node from the root.
//! A node reached at a negative level has its address held by the root; if
//! the root outlives it, the node must move to the heap.
//!
//! Walks and the upward closure of heap nodes are repeated until no status
//! changes. Statuses only increase and there are four of them, so the number
//! of passes is bounded by the node count.

use super::error::EscapeAnalysisError;
use super::object_graph::{EscapeContext, EscapeStatus, ParamRef};
use crate::ir::{FunctionId, NodeId};
use fxhash::FxHashMap;
use log::{debug, trace};

/// What propagation learned beyond node statuses
#[derive(Debug, Clone, Default)]
pub struct PropagationOutcome {
    /// Smallest dereference depth at which each leaking parameter reaches a sink
    pub leaks: FxHashMap<ParamRef, u32>,
    /// Walk/closure passes until the fixed point
    pub passes: usize,
    /// Total `escape_walk` calls
    pub walks: usize,
}

/// Run walks and upward closure on `ctx` to a fixed point
pub fn propagate(ctx: &mut EscapeContext) -> Result<PropagationOutcome, EscapeAnalysisError> {
    let mut propagator = Propagator {
        ctx,
        outcome: PropagationOutcome::default(),
    };
    propagator.run()?;
    Ok(propagator.outcome)
}

struct Propagator<'c> {
    ctx: &'c mut EscapeContext,
    outcome: PropagationOutcome,
}

impl<'c> Propagator<'c> {
    fn run(&mut self) -> Result<(), EscapeAnalysisError> {
        let bound = 4 * self.ctx.len() + 1;

        loop {
            if self.outcome.passes == bound {
                let functions: Vec<FunctionId> = self.ctx.functions().map(|(id, _)| id).collect();
                return Err(EscapeAnalysisError::FixedPointDiverged {
                    functions,
                    passes: bound,
                });
            }
            self.outcome.passes += 1;

            let mut changed = false;
            for root in self.roots() {
                changed |= self.escape_walk(root);
            }
            changed |= self.upward_closure();

            if !changed {
                break;
            }
        }

        self.finalize();
        debug!(
            "Propagation converged after {} passes ({} walks, {} leaking parameters)",
            self.outcome.passes,
            self.outcome.walks,
            self.outcome.leaks.len()
        );
        Ok(())
    }

    /// Phantoms, forced nodes and every node something flows into
    fn roots(&self) -> Vec<NodeId> {
        self.ctx
            .nodes()
            .filter(|node| {
                node.kind.is_phantom() || node.is_forced() || !node.incoming().is_empty()
            })
            .map(|node| node.id)
            .collect()
    }

    /// Flood backwards from `root`; returns whether anything changed
    fn escape_walk(&mut self, root: NodeId) -> bool {
        self.outcome.walks += 1;

        let root_node = self.ctx.node(root);
        let root_depth = root_node.scope_depth;
        // The root holds whatever it reaches beyond this frame
        let root_is_sink =
            root_node.kind.is_phantom() || root_node.status() == EscapeStatus::Heap;

        let mut changed = false;
        let mut best: FxHashMap<NodeId, i32> = FxHashMap::default();
        let mut worklist = vec![(root, 0)];
        best.insert(root, 0);

        while let Some((node, level)) = worklist.pop() {
            if best.get(&node).map_or(false, |&seen| seen < level) {
                continue;
            }

            changed |= self.ctx.raise(node, EscapeStatus::None);

            let mut expand_level = level;
            if level < 0 {
                let outlived = root_is_sink || root_depth < self.ctx.node(node).scope_depth;
                let status = if outlived {
                    EscapeStatus::Heap
                } else {
                    EscapeStatus::Scope
                };
                changed |= self.ctx.raise(node, status);
                expand_level = 0;
            }

            if root_is_sink {
                if let Some(param) = self.ctx.own_parameter(node) {
                    changed |= self.record_leak(param, level.max(0) as u32);
                    changed |= self.ctx.raise(node, EscapeStatus::Heap);
                }
            }

            if node != root && self.ctx.node(node).status() == EscapeStatus::Heap {
                continue;
            }

            for edge in self.ctx.node(node).incoming() {
                let next = expand_level + edge.derefs;
                let better = best.get(&edge.src).map_or(true, |&seen| next < seen);
                if better {
                    best.insert(edge.src, next);
                    worklist.push((edge.src, next));
                }
            }
        }

        changed
    }

    fn record_leak(&mut self, param: ParamRef, level: u32) -> bool {
        match self.outcome.leaks.get(&param) {
            Some(&recorded) if recorded <= level => false,
            _ => {
                trace!(
                    "parameter {} of {} leaks at level {}",
                    param.index,
                    param.function,
                    level
                );
                self.outcome.leaks.insert(param, level);
                true
            }
        }
    }

    /// Everything that flows into a heap node lives on the heap as well
    ///
    /// The Phantom takes part through edges that store the source's own value
    /// (at most zero dereferences). Its other edges store only what the
    /// source points to, which the walks already cover.
    fn upward_closure(&mut self) -> bool {
        let mut worklist: Vec<NodeId> = self
            .ctx
            .nodes()
            .filter(|node| node.status() == EscapeStatus::Heap)
            .map(|node| node.id)
            .collect();

        let mut changed = false;
        while let Some(node) = worklist.pop() {
            let dst = self.ctx.node(node);
            let into_phantom = dst.kind.is_phantom();
            let sources: Vec<NodeId> = dst
                .incoming()
                .iter()
                .filter(|edge| !into_phantom || edge.derefs <= 0)
                .map(|edge| edge.src)
                .collect();
            for src in sources {
                if self.ctx.node(src).kind.is_phantom() {
                    continue;
                }
                if self.ctx.raise(src, EscapeStatus::Heap) {
                    changed = true;
                    worklist.push(src);
                }
            }
        }
        changed
    }

    /// Nodes no walk reached do not escape
    fn finalize(&mut self) {
        for index in 0..self.ctx.len() {
            self.ctx
                .raise(NodeId::from_raw(index as u32), EscapeStatus::None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::object_graph::{
        AllocationKey, FunctionNodes, NodeKind, PARAMETER_DEPTH, PHANTOM_DEPTH,
    };
    use crate::ir::{DeclId, SourceLocation};

    struct Fixture {
        ctx: EscapeContext,
        function: FunctionId,
        phantom: NodeId,
        next_decl: u32,
    }

    impl Fixture {
        fn new(param_count: usize) -> Self {
            let function = FunctionId::from_raw(0);
            let mut ctx = EscapeContext::new();
            let phantom =
                ctx.create_node(NodeKind::Phantom(function), function, None, PHANTOM_DEPTH);
            let params = (0..param_count)
                .map(|index| {
                    ctx.create_node(
                        NodeKind::Parameter(ParamRef { function, index }),
                        function,
                        None,
                        PARAMETER_DEPTH,
                    )
                })
                .collect();
            ctx.register_function(function, FunctionNodes { phantom, params });
            Self {
                ctx,
                function,
                phantom,
                next_decl: 0,
            }
        }

        fn param(&self, index: usize) -> NodeId {
            self.ctx.function_nodes(self.function).unwrap().params[index]
        }

        fn local(&mut self, depth: i32) -> NodeId {
            self.next_decl += 1;
            self.ctx.create_node(
                NodeKind::Local(DeclId::from_raw(self.next_decl)),
                self.function,
                None,
                depth,
            )
        }

        fn alloc(&mut self, line: u32, depth: i32) -> NodeId {
            self.ctx.create_node(
                NodeKind::Allocation(AllocationKey::at(SourceLocation::new(0, line, 1, 0))),
                self.function,
                None,
                depth,
            )
        }

        fn status(&self, node: NodeId) -> EscapeStatus {
            self.ctx.node(node).status()
        }
    }

    #[test]
    fn test_address_returned_moves_to_heap() {
        let mut fx = Fixture::new(0);
        let x = fx.local(0);
        let obj = fx.alloc(1, 0);
        fx.ctx.add_edge(x, obj, -1);
        fx.ctx.add_edge(fx.phantom, x, -1);

        propagate(&mut fx.ctx).unwrap();
        assert_eq!(fx.status(x), EscapeStatus::Heap);
        assert_eq!(fx.status(obj), EscapeStatus::Heap);
    }

    #[test]
    fn test_pointer_stored_in_global_moves_to_heap() {
        let mut fx = Fixture::new(0);
        let p = fx.local(0);
        let obj = fx.alloc(1, 0);
        fx.ctx.add_edge(p, obj, -1);
        fx.ctx.add_edge(fx.phantom, p, 0);

        propagate(&mut fx.ctx).unwrap();
        assert_eq!(fx.status(p), EscapeStatus::Heap);
        assert_eq!(fx.status(obj), EscapeStatus::Heap);
    }

    #[test]
    fn test_pointee_leak_keeps_holder_on_stack() {
        // global = *pp, with pp := &p and p := &x
        let mut fx = Fixture::new(0);
        let x = fx.local(0);
        let p = fx.local(0);
        let pp = fx.local(0);
        fx.ctx.add_edge(p, x, -1);
        fx.ctx.add_edge(pp, p, -1);
        fx.ctx.add_edge(fx.phantom, pp, 1);

        propagate(&mut fx.ctx).unwrap();
        assert_eq!(fx.status(x), EscapeStatus::Heap);
        assert_eq!(fx.status(p), EscapeStatus::None);
        assert_eq!(fx.status(pp), EscapeStatus::None);
    }

    #[test]
    fn test_dereference_cancels_address() {
        // global = *(&x)
        let mut fx = Fixture::new(0);
        let x = fx.local(0);
        let t = fx.local(0);
        fx.ctx.add_edge(t, x, -1);
        fx.ctx.add_edge(fx.phantom, t, 1);

        propagate(&mut fx.ctx).unwrap();
        // Only `t` holds the address, and it lives exactly as long as `x`
        assert_eq!(fx.status(x), EscapeStatus::Scope);
        assert_eq!(fx.status(t), EscapeStatus::None);
    }

    #[test]
    fn test_loop_scope_outlived_by_outer_variable() {
        let mut fx = Fixture::new(0);
        let outer = fx.local(0);
        let inner = fx.local(1);
        let same = fx.local(0);
        fx.ctx.add_edge(outer, inner, -1);
        fx.ctx.add_edge(inner, same, -1);

        propagate(&mut fx.ctx).unwrap();
        assert_eq!(fx.status(inner), EscapeStatus::Heap);
        // `same` is held by `inner`, which is itself on the heap now
        assert_eq!(fx.status(same), EscapeStatus::Heap);
    }

    #[test]
    fn test_address_held_within_scope() {
        let mut fx = Fixture::new(0);
        let p = fx.local(0);
        let x = fx.local(0);
        fx.ctx.add_edge(p, x, -1);

        propagate(&mut fx.ctx).unwrap();
        assert_eq!(fx.status(x), EscapeStatus::Scope);
        assert_eq!(fx.status(p), EscapeStatus::None);
    }

    #[test]
    fn test_parameter_leak_levels() {
        let mut fx = Fixture::new(3);
        let (a, b, c) = (fx.param(0), fx.param(1), fx.param(2));
        // return a; global = *b; c unused
        fx.ctx.add_edge(fx.phantom, a, 0);
        fx.ctx.add_edge(fx.phantom, b, 1);

        let outcome = propagate(&mut fx.ctx).unwrap();
        let function = fx.function;
        assert_eq!(outcome.leaks.get(&ParamRef { function, index: 0 }), Some(&0));
        assert_eq!(outcome.leaks.get(&ParamRef { function, index: 1 }), Some(&1));
        assert_eq!(outcome.leaks.get(&ParamRef { function, index: 2 }), None);
        assert_eq!(fx.status(a), EscapeStatus::Heap);
        assert_eq!(fx.status(c), EscapeStatus::None);
    }

    #[test]
    fn test_leak_keeps_smallest_level() {
        let mut fx = Fixture::new(1);
        let a = fx.param(0);
        fx.ctx.add_edge(fx.phantom, a, 2);
        fx.ctx.add_edge(fx.phantom, a, 1);

        let outcome = propagate(&mut fx.ctx).unwrap();
        let param = ParamRef {
            function: fx.function,
            index: 0,
        };
        assert_eq!(outcome.leaks.get(&param), Some(&1));
    }

    #[test]
    fn test_upward_closure_and_cycles() {
        let mut fx = Fixture::new(0);
        let x = fx.local(0);
        let y = fx.local(0);
        let z = fx.local(0);
        // x <-> y cycle, z flows into y, and &x escapes
        fx.ctx.add_edge(x, y, 0);
        fx.ctx.add_edge(y, x, 0);
        fx.ctx.add_edge(y, z, 0);
        fx.ctx.add_edge(fx.phantom, x, -1);

        let outcome = propagate(&mut fx.ctx).unwrap();
        for node in [x, y, z] {
            assert_eq!(fx.status(node), EscapeStatus::Heap);
        }
        assert!(outcome.passes <= 4 * fx.ctx.len() + 1);
    }

    #[test]
    fn test_forced_node_spreads_heap_upwards() {
        let mut fx = Fixture::new(0);
        let buf = fx.alloc(1, 0);
        let x = fx.local(0);
        fx.ctx.force(buf, EscapeStatus::Heap);
        fx.ctx.add_edge(buf, x, -1);

        propagate(&mut fx.ctx).unwrap();
        assert_eq!(fx.status(x), EscapeStatus::Heap);
    }

    #[test]
    fn test_unreached_nodes_finalize_to_none() {
        let mut fx = Fixture::new(1);
        let lonely = fx.local(2);
        propagate(&mut fx.ctx).unwrap();
        assert_eq!(fx.status(lonely), EscapeStatus::None);
        assert_eq!(fx.status(fx.param(0)), EscapeStatus::None);
        assert_eq!(fx.status(fx.phantom), EscapeStatus::Heap);
    }

    #[test]
    fn test_propagation_is_idempotent() {
        let mut fx = Fixture::new(1);
        let a = fx.param(0);
        let x = fx.local(0);
        fx.ctx.add_edge(x, a, 0);
        fx.ctx.add_edge(fx.phantom, x, -1);

        let first = propagate(&mut fx.ctx).unwrap();
        let statuses: Vec<EscapeStatus> = fx.ctx.nodes().map(|n| n.status()).collect();
        let second = propagate(&mut fx.ctx).unwrap();
        let again: Vec<EscapeStatus> = fx.ctx.nodes().map(|n| n.status()).collect();

        assert_eq!(statuses, again);
        assert_eq!(first.leaks, second.leaks);
        assert_eq!(second.passes, 1);
    }
}
