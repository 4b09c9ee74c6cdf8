//! Function discovery and bottom-up scheduling
//!
//! One pass over the program registers every function in the call graph and
//! records its direct call sites; the resulting SCCs, grouped into waves,
//! are the units of work of the escape analysis.

use super::call_graph::{CallGraph, CallSite, StronglyConnectedComponent};
use super::error::EscapeAnalysisError;
use crate::ir::{visit_expressions, Expr, FunctionId, Program};
use log::debug;

#[derive(Debug, Clone)]
pub struct Scheduler {
    call_graph: CallGraph,
}

impl Scheduler {
    /// Build the call graph of `program` and order its SCCs callees first
    pub fn compute_functions_to_process(program: &Program) -> Result<Self, EscapeAnalysisError> {
        let mut call_graph = CallGraph::new();
        let mut duplicate: Option<FunctionId> = None;
        let mut call_sites = Vec::new();

        program.for_each_function(|function| {
            if !call_graph.add_function(function.id) && duplicate.is_none() {
                duplicate = Some(function.id);
            }
            if let Some(body) = &function.body {
                visit_expressions(body, &mut |expr: &Expr| {
                    if let Some(callee) = expr.direct_callee() {
                        call_sites.push(CallSite::new(function.id, callee, expr.location));
                    }
                });
            }
        });

        if let Some(function) = duplicate {
            return Err(EscapeAnalysisError::DuplicateFunction(function));
        }
        for site in call_sites {
            if !call_graph.contains_function(site.callee) {
                return Err(EscapeAnalysisError::UnknownFunction(site.callee));
            }
            call_graph.add_call_site(site);
        }

        call_graph.compute_strongly_connected_components();
        debug!(
            "Scheduled {} functions ({} call sites) into {} SCCs over {} waves",
            call_graph.function_count(),
            call_graph.call_site_count(),
            call_graph.sccs().len(),
            call_graph.waves().len()
        );

        Ok(Self { call_graph })
    }

    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    /// SCCs callees first
    pub fn sccs(&self) -> &[StronglyConnectedComponent] {
        self.call_graph.sccs()
    }

    /// SCC indices grouped into independent waves, leaves first
    pub fn waves(&self) -> Vec<Vec<usize>> {
        self.call_graph.waves()
    }
}
