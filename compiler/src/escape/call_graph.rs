//! Call graph and bottom-up SCC ordering
//!
//! Nodes are the program's functions in registration order, edges are direct
//! call sites. Strongly connected components are computed with Tarjan's
//! algorithm, which emits them callees first; that is exactly the order the
//! escape analysis needs, since a caller consumes its callees' summaries.
//!
//! Each SCC also gets a condensation level (leaves are level 0), so that the
//! SCCs of one level can be analyzed independently of each other.

use crate::ir::{FunctionId, SourceLocation};
use fxhash::{FxHashMap, FxHashSet};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::fmt;

/// A direct call from `caller` to `callee`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub caller: FunctionId,
    pub callee: FunctionId,
    pub location: SourceLocation,
}

impl CallSite {
    pub fn new(caller: FunctionId, callee: FunctionId, location: SourceLocation) -> Self {
        Self {
            caller,
            callee,
            location,
        }
    }

    pub fn is_self_call(&self) -> bool {
        self.caller == self.callee
    }
}

/// Strongly connected component of the call graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StronglyConnectedComponent {
    /// Member functions, in registration order
    pub functions: Vec<FunctionId>,

    /// Whether some member calls a member (itself included)
    pub is_recursive: bool,

    /// 0 for SCCs that call no other SCC, otherwise one more than the
    /// deepest callee SCC
    pub level: usize,
}

impl StronglyConnectedComponent {
    pub fn contains(&self, function: FunctionId) -> bool {
        self.functions.contains(&function)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    /// Every function of the program, called or not
    functions: IndexSet<FunctionId>,

    /// caller -> call sites
    direct_calls: IndexMap<FunctionId, Vec<CallSite>>,

    /// callee -> callers (deduplicated)
    callers: IndexMap<FunctionId, IndexSet<FunctionId>>,

    /// SCCs in bottom-up order, filled by `compute_strongly_connected_components`
    sccs: Vec<StronglyConnectedComponent>,

    scc_index: FxHashMap<FunctionId, usize>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function; returns false if it was already present
    pub fn add_function(&mut self, function: FunctionId) -> bool {
        self.direct_calls.entry(function).or_default();
        self.functions.insert(function)
    }

    pub fn add_call_site(&mut self, call_site: CallSite) {
        self.direct_calls
            .entry(call_site.caller)
            .or_default()
            .push(call_site);
        self.callers
            .entry(call_site.callee)
            .or_default()
            .insert(call_site.caller);
    }

    pub fn contains_function(&self, function: FunctionId) -> bool {
        self.functions.contains(&function)
    }

    pub fn functions(&self) -> impl Iterator<Item = FunctionId> + '_ {
        self.functions.iter().copied()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn call_site_count(&self) -> usize {
        self.direct_calls.values().map(Vec::len).sum()
    }

    /// All call sites in the body of `function`
    pub fn get_calls_from(&self, function: FunctionId) -> &[CallSite] {
        self.direct_calls
            .get(&function)
            .map_or(&[], |v| v.as_slice())
    }

    /// Distinct callees of `function`, in first-call order
    pub fn get_callees(&self, function: FunctionId) -> IndexSet<FunctionId> {
        self.get_calls_from(function)
            .iter()
            .map(|site| site.callee)
            .collect()
    }

    /// Distinct callers of `function`
    pub fn get_callers(&self, function: FunctionId) -> Vec<FunctionId> {
        self.callers
            .get(&function)
            .map(|callers| callers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Run Tarjan's algorithm and assign condensation levels
    pub fn compute_strongly_connected_components(&mut self) {
        let mut sccs = self.tarjan_scc_algorithm();

        self.scc_index.clear();
        for (index, scc) in sccs.iter().enumerate() {
            for &function in &scc.functions {
                self.scc_index.insert(function, index);
            }
        }

        // Callees precede callers, so one forward sweep settles every level
        for index in 0..sccs.len() {
            let is_recursive = self.scc_has_cycles(&sccs[index].functions);
            sccs[index].is_recursive = is_recursive;

            let mut level = 0;
            for &function in &sccs[index].functions {
                for site in self.get_calls_from(function) {
                    match self.scc_index.get(&site.callee) {
                        Some(&callee_scc) if callee_scc != index => {
                            level = level.max(sccs[callee_scc].level + 1);
                        }
                        _ => {}
                    }
                }
            }
            sccs[index].level = level;
        }

        self.sccs = sccs;
    }

    /// SCCs in bottom-up order (callees before callers)
    pub fn sccs(&self) -> &[StronglyConnectedComponent] {
        &self.sccs
    }

    /// Index into [`sccs`](Self::sccs) of the component containing `function`
    pub fn scc_of(&self, function: FunctionId) -> Option<usize> {
        self.scc_index.get(&function).copied()
    }

    /// Whether `function` belongs to a recursive SCC
    pub fn is_recursive(&self, function: FunctionId) -> bool {
        self.scc_of(function)
            .map(|index| self.sccs[index].is_recursive)
            .unwrap_or(false)
    }

    /// SCC indices grouped by level, lowest level first
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let depth = self.sccs.iter().map(|scc| scc.level + 1).max().unwrap_or(0);
        let mut waves = vec![Vec::new(); depth];
        for (index, scc) in self.sccs.iter().enumerate() {
            waves[scc.level].push(index);
        }
        waves
    }

    /// Tarjan's algorithm for finding strongly connected components
    fn tarjan_scc_algorithm(&self) -> Vec<StronglyConnectedComponent> {
        let mut state = TarjanState::default();

        for &function in &self.functions {
            if !state.indices.contains_key(&function) {
                self.tarjan_strongconnect(function, &mut state);
            }
        }

        state.sccs
    }

    /// Tarjan's `strongconnect` from `root`, on an explicit frame stack
    fn tarjan_strongconnect(&self, root: FunctionId, state: &mut TarjanState) {
        state.visit(root);
        // (function, index of the next call site to follow)
        let mut frames = vec![(root, 0usize)];

        while let Some(frame) = frames.last_mut() {
            let (v, position) = *frame;
            if let Some(site) = self.get_calls_from(v).get(position) {
                frame.1 += 1;
                let w = site.callee;
                if !self.functions.contains(&w) {
                    // Unregistered callee; discovery reports it
                    continue;
                }
                if !state.indices.contains_key(&w) {
                    state.visit(w);
                    frames.push((w, 0));
                } else if state.on_stack.contains(&w) {
                    let v_lowlink = state.lowlinks[&v].min(state.indices[&w]);
                    state.lowlinks.insert(v, v_lowlink);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                let parent_lowlink = state.lowlinks[&parent].min(state.lowlinks[&v]);
                state.lowlinks.insert(parent, parent_lowlink);
            }

            // v is the root of an SCC: pop it off the stack
            if state.lowlinks[&v] == state.indices[&v] {
                let mut functions = Vec::new();
                while let Some(w) = state.stack.pop() {
                    state.on_stack.remove(&w);
                    functions.push(w);
                    if w == v {
                        break;
                    }
                }
                functions.sort_by_key(|f| self.functions.get_index_of(f));

                state.sccs.push(StronglyConnectedComponent {
                    functions,
                    is_recursive: false,
                    level: 0,
                });
            }
        }
    }

    /// Check if an SCC has cycles (internal edges)
    fn scc_has_cycles(&self, functions: &[FunctionId]) -> bool {
        if functions.len() > 1 {
            return true;
        }
        functions.iter().any(|&function| {
            self.get_calls_from(function)
                .iter()
                .any(CallSite::is_self_call)
        })
    }
}

#[derive(Default)]
struct TarjanState {
    index_counter: usize,
    stack: Vec<FunctionId>,
    indices: FxHashMap<FunctionId, usize>,
    lowlinks: FxHashMap<FunctionId, usize>,
    on_stack: FxHashSet<FunctionId>,
    sccs: Vec<StronglyConnectedComponent>,
}

impl TarjanState {
    fn visit(&mut self, v: FunctionId) {
        self.indices.insert(v, self.index_counter);
        self.lowlinks.insert(v, self.index_counter);
        self.index_counter += 1;
        self.stack.push(v);
        self.on_stack.insert(v);
    }
}

impl fmt::Display for StronglyConnectedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, function) in self.functions.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", function)?;
        }
        write!(f, "}}")?;
        if self.is_recursive {
            write!(f, " (recursive)")?;
        }
        write!(f, " level {}", self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(raw: u32) -> FunctionId {
        FunctionId::from_raw(raw)
    }

    fn call(caller: u32, callee: u32) -> CallSite {
        CallSite::new(fid(caller), fid(callee), SourceLocation::unknown())
    }

    #[test]
    fn test_call_graph_creation() {
        let graph = CallGraph::new();
        assert_eq!(graph.function_count(), 0);
        assert_eq!(graph.call_site_count(), 0);
        assert!(graph.sccs().is_empty());
    }

    #[test]
    fn test_add_function() {
        let mut graph = CallGraph::new();
        assert!(graph.add_function(fid(1)));
        assert!(!graph.add_function(fid(1)));
        assert!(graph.contains_function(fid(1)));
        assert!(graph.get_calls_from(fid(1)).is_empty());
    }

    #[test]
    fn test_add_call_site() {
        let mut graph = CallGraph::new();
        graph.add_function(fid(1));
        graph.add_function(fid(2));
        graph.add_call_site(call(1, 2));
        graph.add_call_site(call(1, 2));

        assert_eq!(graph.get_calls_from(fid(1)).len(), 2);
        assert_eq!(graph.get_callees(fid(1)).len(), 1);
        assert_eq!(graph.get_callers(fid(2)), vec![fid(1)]);
        assert_eq!(graph.call_site_count(), 2);
    }

    #[test]
    fn test_recursion_detection() {
        let mut graph = CallGraph::new();
        graph.add_function(fid(1));
        graph.add_function(fid(2));
        graph.add_call_site(call(1, 1));
        graph.add_call_site(call(2, 1));
        graph.compute_strongly_connected_components();

        assert!(graph.is_recursive(fid(1)));
        assert!(!graph.is_recursive(fid(2)));
        assert_eq!(graph.sccs().len(), 2);
    }

    #[test]
    fn test_long_call_chain() {
        let mut graph = CallGraph::new();
        let length = 100_000;
        for raw in 0..length {
            graph.add_function(fid(raw));
        }
        for raw in 1..length {
            graph.add_call_site(call(raw - 1, raw));
        }
        graph.compute_strongly_connected_components();

        let sccs = graph.sccs();
        assert_eq!(sccs.len(), length as usize);
        assert_eq!(sccs[0].functions, vec![fid(length - 1)]);
        assert_eq!(sccs[sccs.len() - 1].level, length as usize - 1);
        assert!(!graph.is_recursive(fid(0)));
    }
}
