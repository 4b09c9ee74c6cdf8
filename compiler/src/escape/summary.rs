//! Summaries and allocation decisions
//!
//! After an SCC converges, its final node statuses are turned into
//! - one [`FunctionSummary`] per member, consumed by callers in later SCCs
//! - one [`AllocationSite`] per allocating source location, consumed by codegen
//! - one [`VariableDecision`] per local or parameter that codegen may have to
//!   move to the heap

use super::error::EscapeAnalysisError;
use super::object_graph::{
    AllocationKey, EscapeContext, EscapeStatus, NodeKind, Origin, ParamRef,
};
use super::propagate::PropagationOutcome;
use crate::config::ExternalSummary;
use crate::ir::{DeclId, ExprId, Function, FunctionId, Program, SourceLocation};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Where a summary came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    /// Computed from the function body
    Analyzed,
    /// No body and no override: everything leaks
    External,
    /// Supplied by configuration
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSummary {
    pub function: FunctionId,
    pub name: String,

    /// The function moves nothing to the heap: no pointer parameter leaks and
    /// none of its own storage escapes its frame
    pub is_safe: bool,

    /// Per parameter: `None` if it does not leak, otherwise the number of
    /// dereferences after which it reaches a heap sink
    pub parameter_leak_level: Vec<Option<u32>>,

    pub source: SummarySource,
}

impl FunctionSummary {
    /// Maximally leaking summary for a function whose body is not available
    pub fn conservative(function: &Function) -> Self {
        let parameter_leak_level = function
            .params
            .iter()
            .map(|param| param.has_pointers.then_some(0))
            .collect();
        Self {
            function: function.id,
            name: function.name.clone(),
            is_safe: false,
            parameter_leak_level,
            source: SummarySource::External,
        }
    }

    /// Summary of a bodiless function as described by configuration
    ///
    /// An entry that is neither safe nor lists any leaking parameter says
    /// nothing, and leaves every pointer parameter leaking at level 0.
    pub fn from_override(
        function: &Function,
        entry: &ExternalSummary,
    ) -> Result<Self, EscapeAnalysisError> {
        if !entry.safe && entry.leaking_parameters.is_empty() {
            return Ok(Self {
                source: SummarySource::Override,
                ..Self::conservative(function)
            });
        }

        let mut parameter_leak_level = vec![None; function.params.len()];
        for leak in &entry.leaking_parameters {
            let slot = parameter_leak_level.get_mut(leak.index).ok_or(
                EscapeAnalysisError::ParameterIndexOutOfRange {
                    function: function.id,
                    index: leak.index,
                    count: function.params.len(),
                },
            )?;
            *slot = Some(leak.level);
        }
        Ok(Self {
            function: function.id,
            name: function.name.clone(),
            is_safe: entry.safe,
            parameter_leak_level,
            source: SummarySource::Override,
        })
    }

    pub fn leaking_parameter_count(&self) -> usize {
        self.parameter_leak_level
            .iter()
            .filter(|level| level.is_some())
            .count()
    }
}

/// Published summaries; each function is written exactly once
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct SummaryTable {
    summaries: IndexMap<FunctionId, FunctionSummary>,
}

impl SummaryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&mut self, summary: FunctionSummary) -> Result<(), EscapeAnalysisError> {
        if self.summaries.contains_key(&summary.function) {
            return Err(EscapeAnalysisError::SummaryAlreadyPublished(
                summary.function,
            ));
        }
        self.summaries.insert(summary.function, summary);
        Ok(())
    }

    pub fn get(&self, function: FunctionId) -> Option<&FunctionSummary> {
        self.summaries.get(&function)
    }

    pub fn is_safe_function(&self, function: FunctionId) -> Result<bool, EscapeAnalysisError> {
        self.get(function)
            .map(|summary| summary.is_safe)
            .ok_or(EscapeAnalysisError::SummaryNotPublished(function))
    }

    pub fn leak_level(
        &self,
        function: FunctionId,
        index: usize,
    ) -> Result<Option<u32>, EscapeAnalysisError> {
        let summary = self
            .get(function)
            .ok_or(EscapeAnalysisError::SummaryNotPublished(function))?;
        summary
            .parameter_leak_level
            .get(index)
            .copied()
            .ok_or(EscapeAnalysisError::ParameterIndexOutOfRange {
                function,
                index,
                count: summary.parameter_leak_level.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    /// Summaries in publication order
    pub fn iter(&self) -> impl Iterator<Item = &FunctionSummary> {
        self.summaries.values()
    }
}

/// Code generator's placement decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationDecision {
    StackEligible,
    HeapRequired,
}

impl AllocationDecision {
    pub fn from_status(status: EscapeStatus) -> Self {
        match status {
            EscapeStatus::Heap => Self::HeapRequired,
            EscapeStatus::Unknown | EscapeStatus::None | EscapeStatus::Scope => {
                Self::StackEligible
            }
        }
    }
}

impl fmt::Display for AllocationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackEligible => write!(f, "stack"),
            Self::HeapRequired => write!(f, "heap"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationSite {
    pub location: SourceLocation,
    /// The allocating expression, for sites without a source location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<ExprId>,
    pub function: FunctionId,
    pub status: EscapeStatus,
    pub decision: AllocationDecision,
    /// Heap placement was required by size, not by an escape
    pub forced: bool,
}

impl AllocationSite {
    pub fn key(&self) -> AllocationKey {
        AllocationKey {
            location: self.location,
            expr: self.expr,
        }
    }
}

/// Allocation decisions keyed by source location
#[derive(Debug, Clone, Default)]
pub struct AllocationTable {
    sites: IndexMap<AllocationKey, AllocationSite>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a site; a location recorded twice keeps the stronger decision
    pub fn record(&mut self, site: AllocationSite) {
        match self.sites.get_mut(&site.key()) {
            Some(existing) => {
                if site.status > existing.status {
                    existing.status = site.status;
                }
                if site.decision > existing.decision {
                    existing.decision = site.decision;
                    existing.forced = site.forced;
                }
            }
            None => {
                self.sites.insert(site.key(), site);
            }
        }
    }

    pub fn decision(&self, location: SourceLocation) -> Option<AllocationDecision> {
        self.site(location).map(|site| site.decision)
    }

    pub fn site(&self, location: SourceLocation) -> Option<&AllocationSite> {
        self.sites.get(&AllocationKey::at(location))
    }

    /// Site of an allocating expression that has no source location
    pub fn unlocated_site(&self, expr: ExprId) -> Option<&AllocationSite> {
        self.sites.get(&AllocationKey::new(SourceLocation::unknown(), expr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationSite> {
        self.sites.values()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn heap_count(&self) -> usize {
        self.iter()
            .filter(|site| site.decision == AllocationDecision::HeapRequired)
            .count()
    }

    pub fn stack_count(&self) -> usize {
        self.len() - self.heap_count()
    }
}

impl Serialize for AllocationTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.sites.values())
    }
}

/// Placement of a declared variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableDecision {
    pub decl: DeclId,
    pub function: FunctionId,
    pub status: EscapeStatus,
    pub decision: AllocationDecision,
}

/// Everything extracted from one converged SCC
#[derive(Debug, Clone, Default)]
pub struct ExtractedResults {
    pub summaries: Vec<FunctionSummary>,
    pub allocations: Vec<AllocationSite>,
    pub variables: Vec<VariableDecision>,
}

/// Turn the converged statuses of `ctx` into summaries and decisions
pub fn compute_analysis_results(
    program: &Program,
    ctx: &EscapeContext,
    outcome: &PropagationOutcome,
) -> Result<ExtractedResults, EscapeAnalysisError> {
    let mut results = ExtractedResults::default();

    for (function_id, nodes) in ctx.functions() {
        let function = program
            .function(function_id)
            .ok_or(EscapeAnalysisError::UnknownFunction(function_id))?;

        let mut parameter_leak_level = Vec::with_capacity(function.params.len());
        for (index, (param, &node)) in function.params.iter().zip(&nodes.params).enumerate() {
            let level = if !param.has_pointers {
                None
            } else if let Some(&level) = outcome.leaks.get(&ParamRef {
                function: function_id,
                index,
            }) {
                Some(level)
            } else if ctx.node(node).status() == EscapeStatus::Heap {
                Some(0)
            } else {
                None
            };
            parameter_leak_level.push(level);
        }

        let frame_escapes = ctx.nodes().any(|node| {
            node.owner == function_id
                && node.status() == EscapeStatus::Heap
                && !node.is_forced()
                && matches!(
                    node.kind,
                    NodeKind::Allocation(_)
                        | NodeKind::Local(_)
                        | NodeKind::Temporary(_)
                        | NodeKind::Parameter(_)
                )
        });
        let leaks = parameter_leak_level.iter().any(Option::is_some);

        results.summaries.push(FunctionSummary {
            function: function_id,
            name: function.name.clone(),
            is_safe: !leaks && !frame_escapes,
            parameter_leak_level,
            source: SummarySource::Analyzed,
        });
    }

    for node in ctx.nodes() {
        let decision = AllocationDecision::from_status(node.status());
        match (node.kind, node.origin) {
            (NodeKind::Allocation(key), _) => results.allocations.push(AllocationSite {
                location: key.location,
                expr: key.expr,
                function: node.owner,
                status: node.status(),
                decision,
                forced: node.is_forced(),
            }),
            (NodeKind::Local(_) | NodeKind::Parameter(_), Some(Origin::Decl(decl))) => {
                results.variables.push(VariableDecision {
                    decl,
                    function: node.owner,
                    status: node.status(),
                    decision,
                })
            }
            _ => {}
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterLeak;
    use crate::ir::ProgramBuilder;

    fn external_program() -> (Program, FunctionId) {
        let mut program = ProgramBuilder::new();
        let ext = program.external("copy", &[("dst", true), ("src", true), ("n", false)]);
        (program.build(), ext)
    }

    #[test]
    fn test_conservative_summary_leaks_pointer_parameters() {
        let (program, ext) = external_program();
        let summary = FunctionSummary::conservative(program.function(ext).unwrap());
        assert!(!summary.is_safe);
        assert_eq!(summary.parameter_leak_level, vec![Some(0), Some(0), None]);
        assert_eq!(summary.source, SummarySource::External);
        assert_eq!(summary.leaking_parameter_count(), 2);
    }

    #[test]
    fn test_override_summary() {
        let (program, ext) = external_program();
        let function = program.function(ext).unwrap();
        let entry = ExternalSummary {
            name: "copy".to_string(),
            safe: false,
            leaking_parameters: vec![ParameterLeak { index: 1, level: 1 }],
        };
        let summary = FunctionSummary::from_override(function, &entry).unwrap();
        assert_eq!(summary.parameter_leak_level, vec![None, Some(1), None]);
        assert_eq!(summary.source, SummarySource::Override);

        let bad = ExternalSummary {
            leaking_parameters: vec![ParameterLeak { index: 7, level: 0 }],
            ..entry
        };
        assert_eq!(
            FunctionSummary::from_override(function, &bad).unwrap_err(),
            EscapeAnalysisError::ParameterIndexOutOfRange {
                function: ext,
                index: 7,
                count: 3
            }
        );
    }

    #[test]
    fn test_bare_override_stays_conservative() {
        let (program, ext) = external_program();
        let function = program.function(ext).unwrap();
        let entry = ExternalSummary {
            name: "copy".to_string(),
            safe: false,
            leaking_parameters: Vec::new(),
        };
        let summary = FunctionSummary::from_override(function, &entry).unwrap();
        assert!(!summary.is_safe);
        assert_eq!(summary.parameter_leak_level, vec![Some(0), Some(0), None]);
        assert_eq!(summary.source, SummarySource::Override);
    }

    #[test]
    fn test_summary_table_publish_once() {
        let (program, ext) = external_program();
        let summary = FunctionSummary::conservative(program.function(ext).unwrap());
        let mut table = SummaryTable::new();

        assert_eq!(
            table.is_safe_function(ext),
            Err(EscapeAnalysisError::SummaryNotPublished(ext))
        );
        table.publish(summary.clone()).unwrap();
        assert_eq!(
            table.publish(summary),
            Err(EscapeAnalysisError::SummaryAlreadyPublished(ext))
        );

        assert_eq!(table.is_safe_function(ext), Ok(false));
        assert_eq!(table.leak_level(ext, 0), Ok(Some(0)));
        assert_eq!(table.leak_level(ext, 2), Ok(None));
        assert!(matches!(
            table.leak_level(ext, 3),
            Err(EscapeAnalysisError::ParameterIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_allocation_table_merges_to_stronger_decision() {
        let location = SourceLocation::new(0, 4, 2, 40);
        let function = FunctionId::from_raw(0);
        let mut table = AllocationTable::new();
        table.record(AllocationSite {
            location,
            expr: None,
            function,
            status: EscapeStatus::Scope,
            decision: AllocationDecision::StackEligible,
            forced: false,
        });
        table.record(AllocationSite {
            location,
            expr: None,
            function,
            status: EscapeStatus::Heap,
            decision: AllocationDecision::HeapRequired,
            forced: false,
        });
        table.record(AllocationSite {
            location,
            expr: None,
            function,
            status: EscapeStatus::None,
            decision: AllocationDecision::StackEligible,
            forced: false,
        });

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.decision(location),
            Some(AllocationDecision::HeapRequired)
        );
        assert_eq!(table.site(location).unwrap().status, EscapeStatus::Heap);
        assert_eq!(table.heap_count(), 1);
        assert_eq!(table.stack_count(), 0);
        assert_eq!(table.decision(SourceLocation::unknown()), None);
    }

    #[test]
    fn test_unlocated_sites_stay_apart() {
        let function = FunctionId::from_raw(0);
        let mut table = AllocationTable::new();
        for (raw, decision) in [
            (1, AllocationDecision::HeapRequired),
            (2, AllocationDecision::StackEligible),
        ] {
            table.record(AllocationSite {
                location: SourceLocation::unknown(),
                expr: Some(ExprId::from_raw(raw)),
                function,
                status: EscapeStatus::None,
                decision,
                forced: false,
            });
        }

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.unlocated_site(ExprId::from_raw(1)).unwrap().decision,
            AllocationDecision::HeapRequired
        );
        assert_eq!(
            table.unlocated_site(ExprId::from_raw(2)).unwrap().decision,
            AllocationDecision::StackEligible
        );
        assert_eq!(table.decision(SourceLocation::unknown()), None);
    }

    #[test]
    fn test_decision_from_status() {
        assert_eq!(
            AllocationDecision::from_status(EscapeStatus::Scope),
            AllocationDecision::StackEligible
        );
        assert_eq!(
            AllocationDecision::from_status(EscapeStatus::Heap),
            AllocationDecision::HeapRequired
        );
    }
}
