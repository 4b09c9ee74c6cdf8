//! Escape analysis
//!
//! Decides for every allocation whether it may stay in its function's stack
//! frame, and summarizes for every function whether it leaks anything
//! reachable from its pointer parameters.
//!
//! The pass runs bottom-up over the call graph:
//!
//! 1. [`scheduler`] discovers functions and call sites and orders the
//!    strongly connected components callees first, grouped into waves
//! 2. [`builder`] lowers each SCC into an object-flow graph
//!    ([`object_graph`]), consulting the summaries of already analyzed callees
//! 3. [`propagate`] floods the graph to a fixed point
//! 4. [`summary`] extracts function summaries and allocation decisions,
//!    which are published once the whole wave is done
//!
//! Recursive SCCs are refined: after a conservative first round, calls
//! between members are resolved through the previous round's summaries until
//! they stop changing.

pub mod builder;
pub mod call_graph;
pub mod error;
pub mod object_graph;
pub mod propagate;
pub mod scheduler;
pub mod summary;

pub use call_graph::{CallGraph, CallSite, StronglyConnectedComponent};
pub use error::EscapeAnalysisError;
pub use object_graph::{AllocationKey, EscapeContext, EscapeStatus, NodeKind};
pub use scheduler::Scheduler;
pub use summary::{
    AllocationDecision, AllocationSite, AllocationTable, FunctionSummary, SummarySource,
    SummaryTable, VariableDecision,
};

use crate::config::EscapeConfig;
use crate::ir::{DeclId, FunctionId, Program};
use builder::GraphBuilder;
use indexmap::IndexMap;
use log::{debug, info, warn};
use propagate::propagate;
use rayon::prelude::*;
use serde::Serialize;
use std::time::{Duration, Instant};
use summary::{compute_analysis_results, ExtractedResults};

/// Everything the pass publishes
#[derive(Debug, Clone, Default, Serialize)]
pub struct EscapeAnalysisResults {
    /// Per-function summaries, for later interprocedural passes
    pub summaries: SummaryTable,

    /// Per-site allocation decisions, for the code generator
    pub allocations: AllocationTable,

    /// Per-variable decisions; a heap decision moves the variable to the heap
    pub variables: IndexMap<DeclId, VariableDecision>,

    /// SCCs in the order they were analyzed
    pub schedule: Vec<StronglyConnectedComponent>,

    pub stats: EscapeAnalysisStats,
}

/// Performance statistics for escape analysis
#[derive(Debug, Clone, Default, Serialize)]
pub struct EscapeAnalysisStats {
    /// Time spent in analysis
    pub analysis_time: Duration,

    /// Functions with a body that went through graph construction
    pub functions_analyzed: usize,

    /// Functions summarized without a body
    pub external_functions: usize,

    pub scc_count: usize,
    pub recursive_sccs: usize,
    pub waves: usize,

    /// Graph sizes, summed over the final round of every SCC
    pub nodes_created: usize,
    pub edges_created: usize,

    pub propagation_passes: usize,
    pub refinement_rounds: usize,
    pub calls_analyzed: usize,

    pub stack_allocations: usize,
    pub heap_allocations: usize,
}

/// Result of analyzing one SCC, before publication
#[derive(Debug, Default)]
struct SccOutcome {
    extracted: ExtractedResults,
    external: bool,
    rounds: usize,
    nodes: usize,
    edges: usize,
    passes: usize,
    calls: usize,
}

/// The escape analysis pass
pub struct EscapeAnalysis<'a> {
    program: &'a Program,
    config: &'a EscapeConfig,
}

impl<'a> EscapeAnalysis<'a> {
    pub fn new(program: &'a Program, config: &'a EscapeConfig) -> Self {
        Self { program, config }
    }

    /// Analyze `program` and publish summaries and decisions
    pub fn perform(
        program: &Program,
        config: &EscapeConfig,
    ) -> Result<EscapeAnalysisResults, EscapeAnalysisError> {
        EscapeAnalysis::new(program, config).run()
    }

    pub fn run(&self) -> Result<EscapeAnalysisResults, EscapeAnalysisError> {
        let start_time = Instant::now();
        info!(
            "Escape analysis over {} functions{}",
            self.program.functions.len(),
            if self.config.parallel {
                " (parallel)"
            } else {
                ""
            }
        );

        for entry in &self.config.external {
            if self.program.function_named(&entry.name).is_none() {
                warn!("External summary for `{}` matches no function", entry.name);
            }
        }

        let scheduler = Scheduler::compute_functions_to_process(self.program)?;
        let sccs = scheduler.sccs();
        let waves = scheduler.waves();

        let mut results = EscapeAnalysisResults {
            schedule: sccs.to_vec(),
            ..EscapeAnalysisResults::default()
        };
        results.stats.scc_count = sccs.len();
        results.stats.recursive_sccs = sccs.iter().filter(|scc| scc.is_recursive).count();
        results.stats.waves = waves.len();

        for (level, wave) in waves.iter().enumerate() {
            debug!("Wave {}: {} SCCs", level, wave.len());
            let published = &results.summaries;
            let outcomes: Vec<Result<SccOutcome, EscapeAnalysisError>> =
                if self.config.parallel && wave.len() > 1 {
                    wave.par_iter()
                        .map(|&index| self.analyze_scc(&sccs[index], published))
                        .collect()
                } else {
                    wave.iter()
                        .map(|&index| self.analyze_scc(&sccs[index], published))
                        .collect()
                };

            // Publish only once the whole wave is done
            for outcome in outcomes {
                results.absorb(outcome?)?;
            }
        }

        results.stats.stack_allocations = results.allocations.stack_count();
        results.stats.heap_allocations = results.allocations.heap_count();
        results.stats.analysis_time = start_time.elapsed();
        info!(
            "Escape analysis done in {:?}: {} allocation sites ({} heap), {} summaries",
            results.stats.analysis_time,
            results.allocations.len(),
            results.stats.heap_allocations,
            results.summaries.len()
        );
        Ok(results)
    }

    fn analyze_scc(
        &self,
        scc: &StronglyConnectedComponent,
        published: &SummaryTable,
    ) -> Result<SccOutcome, EscapeAnalysisError> {
        if let [only] = scc.functions.as_slice() {
            let function = self
                .program
                .function(*only)
                .ok_or(EscapeAnalysisError::UnknownFunction(*only))?;
            if !function.has_body() {
                let summary = match self.config.external_summary(&function.name) {
                    Some(entry) => FunctionSummary::from_override(function, entry)?,
                    None => FunctionSummary::conservative(function),
                };
                debug!("`{}` has no body: {:?} summary", function.name, summary.source);
                return Ok(SccOutcome {
                    extracted: ExtractedResults {
                        summaries: vec![summary],
                        ..ExtractedResults::default()
                    },
                    external: true,
                    ..SccOutcome::default()
                });
            }
        }

        let limit = if scc.is_recursive {
            self.config.scc_round_limit(scc.len())
        } else {
            1
        };

        let mut provisional: Option<IndexMap<FunctionId, FunctionSummary>> = None;
        let mut outcome = SccOutcome::default();
        loop {
            let builder =
                GraphBuilder::new(self.program, self.config, published, &scc.functions);
            let builder = match &provisional {
                Some(summaries) => builder.with_provisional(summaries),
                None => builder,
            };
            let (mut ctx, calls) = builder.build()?;
            let propagation = propagate(&mut ctx)?;
            let extracted = compute_analysis_results(self.program, &ctx, &propagation)?;

            outcome.rounds += 1;
            outcome.passes += propagation.passes;
            outcome.nodes = ctx.len();
            outcome.edges = ctx.edge_count();
            outcome.calls = calls;

            let summaries: IndexMap<FunctionId, FunctionSummary> = extracted
                .summaries
                .iter()
                .map(|summary| (summary.function, summary.clone()))
                .collect();
            let stable = provisional.as_ref() == Some(&summaries);

            if stable || outcome.rounds >= limit {
                debug!(
                    "SCC {} done after {} round(s){}",
                    scc,
                    outcome.rounds,
                    if stable { "" } else { " (round limit)" }
                );
                outcome.extracted = extracted;
                return Ok(outcome);
            }
            provisional = Some(summaries);
        }
    }
}

impl EscapeAnalysisResults {
    /// Placement of a local variable or parameter, if the pass saw it
    pub fn variable_decision(&self, decl: DeclId) -> Option<AllocationDecision> {
        self.variables.get(&decl).map(|variable| variable.decision)
    }

    /// Whether `function` leaks nothing through its parameters
    pub fn is_safe_function(&self, function: FunctionId) -> Result<bool, EscapeAnalysisError> {
        self.summaries.is_safe_function(function)
    }

    /// Allocation sites that may be placed on the stack
    pub fn stack_allocatable(&self) -> Vec<&AllocationSite> {
        self.allocations
            .iter()
            .filter(|site| site.decision == AllocationDecision::StackEligible)
            .collect()
    }

    fn absorb(&mut self, outcome: SccOutcome) -> Result<(), EscapeAnalysisError> {
        let SccOutcome {
            extracted,
            external,
            rounds,
            nodes,
            edges,
            passes,
            calls,
        } = outcome;

        if external {
            self.stats.external_functions += extracted.summaries.len();
        } else {
            self.stats.functions_analyzed += extracted.summaries.len();
        }
        self.stats.refinement_rounds += rounds;
        self.stats.nodes_created += nodes;
        self.stats.edges_created += edges;
        self.stats.propagation_passes += passes;
        self.stats.calls_analyzed += calls;

        for summary in extracted.summaries {
            self.summaries.publish(summary)?;
        }
        for site in extracted.allocations {
            self.allocations.record(site);
        }
        for variable in extracted.variables {
            self.variables.insert(variable.decl, variable);
        }
        Ok(())
    }
}
