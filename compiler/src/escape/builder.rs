//! Per-function graph construction
//!
//! Walks each function of an SCC once and lowers every store of a value into
//! `escape_flows` calls on the SCC's [`EscapeContext`]. Expressions are
//! visited against a [`Hole`]: the node their value flows into, plus the
//! number of dereferences still to be applied on the way there.

use super::error::EscapeAnalysisError;
use super::object_graph::{
    AllocationKey, EscapeContext, EscapeStatus, FunctionNodes, NodeKind, Origin, ParamRef,
    ARGUMENT_DEPTH, PARAMETER_DEPTH, PHANTOM_DEPTH,
};
use super::summary::{FunctionSummary, SummaryTable};
use crate::config::EscapeConfig;
use crate::ir::{
    Callee, Capture, DeclId, Expr, ExprKind, Function, FunctionId, NodeId, Program, Stmt, TempId,
};
use fxhash::FxHashMap;
use indexmap::IndexMap;
use log::{debug, trace};

type Result<T> = std::result::Result<T, EscapeAnalysisError>;

/// Destination of an expression's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    /// `None` discards the value
    dst: Option<NodeId>,
    derefs: i32,
}

impl Hole {
    fn discard() -> Self {
        Self {
            dst: None,
            derefs: 0,
        }
    }

    fn to(node: NodeId) -> Self {
        Self {
            dst: Some(node),
            derefs: 0,
        }
    }

    fn with_derefs(node: NodeId, derefs: i32) -> Self {
        Self {
            dst: Some(node),
            derefs,
        }
    }

    /// The hole for `x` when the value being placed is `*x`
    fn deref(self) -> Self {
        Self {
            derefs: self.derefs + 1,
            ..self
        }
    }

    /// The hole for `x` when the value being placed is `&x`
    fn addr(self) -> Self {
        Self {
            derefs: self.derefs - 1,
            ..self
        }
    }
}

/// How a direct call is resolved
enum CalleeSummary<'s> {
    Known(&'s FunctionSummary),
    /// Callee is analyzed together with the caller and has no summary yet
    SameScc,
}

/// Builds the object-flow graph of one SCC
pub struct GraphBuilder<'a> {
    program: &'a Program,
    config: &'a EscapeConfig,
    published: &'a SummaryTable,
    /// Previous refinement round's summaries of SCC members
    provisional: Option<&'a IndexMap<FunctionId, FunctionSummary>>,
    members: &'a [FunctionId],
    ctx: EscapeContext,

    // State of the function being visited
    function: FunctionId,
    phantom: NodeId,
    loop_depth: i32,
    decls: FxHashMap<DeclId, NodeId>,
    temps: FxHashMap<TempId, NodeId>,

    calls_analyzed: usize,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        program: &'a Program,
        config: &'a EscapeConfig,
        published: &'a SummaryTable,
        members: &'a [FunctionId],
    ) -> Self {
        Self {
            program,
            config,
            published,
            provisional: None,
            members,
            ctx: EscapeContext::new(),
            function: FunctionId::invalid(),
            phantom: NodeId::invalid(),
            loop_depth: 0,
            decls: FxHashMap::default(),
            temps: FxHashMap::default(),
            calls_analyzed: 0,
        }
    }

    /// Resolve calls to SCC members through these summaries instead of the Phantom
    pub fn with_provisional(
        mut self,
        provisional: &'a IndexMap<FunctionId, FunctionSummary>,
    ) -> Self {
        self.provisional = Some(provisional);
        self
    }

    /// Visit every member of the SCC and hand back the finished graph
    pub fn build(mut self) -> Result<(EscapeContext, usize)> {
        for &member in self.members {
            let function = self
                .program
                .function(member)
                .ok_or(EscapeAnalysisError::UnknownFunction(member))?;
            self.visit_function(function)?;
        }
        Ok((self.ctx, self.calls_analyzed))
    }

    /// Create the Phantom and parameter nodes of `function` and walk its body
    pub fn visit_function(&mut self, function: &Function) -> Result<()> {
        self.function = function.id;
        self.loop_depth = 0;
        self.decls.clear();
        self.temps.clear();

        self.phantom = self.ctx.create_node(
            NodeKind::Phantom(function.id),
            function.id,
            None,
            PHANTOM_DEPTH,
        );

        let mut params = Vec::with_capacity(function.params.len());
        for (index, param) in function.params.iter().enumerate() {
            let node = self.ctx.create_node(
                NodeKind::Parameter(ParamRef {
                    function: function.id,
                    index,
                }),
                function.id,
                Some(Origin::Decl(param.decl)),
                PARAMETER_DEPTH,
            );
            self.decls.insert(param.decl, node);
            params.push(node);
        }
        self.ctx.register_function(
            function.id,
            FunctionNodes {
                phantom: self.phantom,
                params,
            },
        );

        if let Some(body) = &function.body {
            self.visit_statement_list(body)?;
        }

        debug!(
            "Built escape graph of `{}`: {} nodes, {} edges so far",
            function.name,
            self.ctx.len(),
            self.ctx.edge_count()
        );
        Ok(())
    }

    pub fn visit_statement_list(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            self.visit_statement(stmt)?;
        }
        Ok(())
    }

    pub fn visit_statement(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Declare { decl, init, .. } => {
                let node = self.ctx.create_node(
                    NodeKind::Local(*decl),
                    self.function,
                    Some(Origin::Decl(*decl)),
                    self.loop_depth,
                );
                self.decls.insert(*decl, node);
                if let Some(init) = init {
                    self.visit_expression(init, Hole::to(node))?;
                }
            }
            Stmt::Assign { target, value } => {
                let hole = self.assignment_hole(target)?;
                self.visit_expression(value, hole)?;
            }
            Stmt::Return { values } => {
                for value in values {
                    self.visit_expression(value, Hole::to(self.phantom))?;
                }
            }
            Stmt::Expr(expr) => self.visit_expression(expr, Hole::discard())?,
            Stmt::Temp { temp, init } => {
                let node = self.ctx.create_node(
                    NodeKind::Temporary(*temp),
                    self.function,
                    Some(Origin::Expr(init.id)),
                    self.loop_depth,
                );
                self.temps.insert(*temp, node);
                self.visit_expression(init, Hole::to(node))?;
            }
            Stmt::Block(body) => self.visit_statement_list(body)?,
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.visit_expression(cond, Hole::discard())?;
                self.visit_statement_list(then_body)?;
                self.visit_statement_list(else_body)?;
            }
            Stmt::Loop { cond, body } => {
                self.loop_depth += 1;
                if let Some(cond) = cond {
                    self.visit_expression(cond, Hole::discard())?;
                }
                self.visit_statement_list(body)?;
                self.loop_depth -= 1;
            }
            Stmt::Send { channel, value } => {
                self.visit_expression(channel, Hole::discard())?;
                self.visit_expression(value, Hole::to(self.phantom))?;
            }
            Stmt::Spawn { call } => match &call.kind {
                ExprKind::Call { callee, args } => {
                    self.calls_analyzed += 1;
                    if let Callee::Indirect(target) = callee {
                        self.visit_expression(target, Hole::discard())?;
                    }
                    // The spawned call outlives this frame whatever its callee does
                    for arg in args {
                        self.visit_expression(arg, Hole::to(self.phantom))?;
                    }
                }
                _ => self.visit_expression(call, Hole::to(self.phantom))?,
            },
        }
        Ok(())
    }

    /// Where a value assigned to `target` goes
    fn assignment_hole(&mut self, target: &Expr) -> Result<Hole> {
        match &target.kind {
            ExprKind::Local(decl) => Ok(Hole::to(self.decl_node(*decl)?)),
            ExprKind::Temp(temp) => Ok(Hole::to(self.temp_node(*temp)?)),
            ExprKind::Blank => Ok(Hole::discard()),
            ExprKind::Global(_) | ExprKind::Captured(_) => Ok(Hole::to(self.phantom)),
            ExprKind::Field {
                base,
                through_pointer: false,
                ..
            } => self.assignment_hole(base),
            ExprKind::Index {
                base,
                index,
                through_pointer: false,
            } => {
                self.visit_expression(index, Hole::discard())?;
                self.assignment_hole(base)
            }
            ExprKind::Deref(base)
            | ExprKind::Field {
                base,
                through_pointer: true,
                ..
            } => {
                self.visit_expression(base, Hole::discard())?;
                Ok(Hole::to(self.phantom))
            }
            ExprKind::Index {
                base,
                index,
                through_pointer: true,
            } => {
                self.visit_expression(base, Hole::discard())?;
                self.visit_expression(index, Hole::discard())?;
                Ok(Hole::to(self.phantom))
            }
            other => Err(EscapeAnalysisError::InvalidAssignmentTarget {
                function: self.function,
                what: format!("{:?}", other),
            }),
        }
    }

    /// Lower the value of `expr` into `hole`
    fn visit_expression(&mut self, expr: &Expr, hole: Hole) -> Result<()> {
        match &expr.kind {
            ExprKind::Literal
            | ExprKind::Global(_)
            | ExprKind::Captured(_)
            | ExprKind::Blank => {}
            ExprKind::Local(decl) => {
                let node = self.decl_node(*decl)?;
                self.flow(hole, node);
            }
            ExprKind::Temp(temp) => {
                let node = self.temp_node(*temp)?;
                self.flow(hole, node);
            }
            ExprKind::AddressOf(inner) => {
                if is_addressable(inner) {
                    self.visit_expression(inner, hole.addr())?;
                } else {
                    // &f(), &(a + b): the value gets a hidden home
                    let node = self.allocation_node(expr);
                    self.visit_expression(inner, Hole::to(node))?;
                    self.flow(hole.addr(), node);
                }
            }
            ExprKind::Deref(inner) => self.visit_expression(inner, hole.deref())?,
            ExprKind::Field {
                base,
                through_pointer,
                ..
            } => {
                let hole = if *through_pointer { hole.deref() } else { hole };
                self.visit_expression(base, hole)?;
            }
            ExprKind::Index {
                base,
                index,
                through_pointer,
            } => {
                self.visit_expression(index, Hole::discard())?;
                let hole = if *through_pointer { hole.deref() } else { hole };
                self.visit_expression(base, hole)?;
            }
            ExprKind::Slice {
                base,
                through_pointer,
            } => {
                // Slicing an array value points into it
                let hole = if *through_pointer { hole } else { hole.addr() };
                self.visit_expression(base, hole)?;
            }
            ExprKind::New { init, size } => {
                let node = self.allocation_node(expr);
                if size.map_or(false, |size| self.config.exceeds_stack_limit(size)) {
                    self.force_heap(node);
                }
                if let Some(init) = init {
                    self.visit_expression(init, Hole::to(node))?;
                }
                self.flow(hole.addr(), node);
            }
            ExprKind::Composite { elements } => {
                let node = self.allocation_node(expr);
                for element in elements {
                    self.visit_expression(element, Hole::to(node))?;
                }
                self.flow(hole, node);
            }
            ExprKind::Make { args, size, .. } => {
                let node = self.allocation_node(expr);
                let too_big = match size {
                    Some(size) => self.config.exceeds_stack_limit(*size),
                    None => true,
                };
                if too_big {
                    self.force_heap(node);
                }
                for arg in args {
                    self.visit_expression(arg, Hole::discard())?;
                }
                self.flow(hole.addr(), node);
            }
            ExprKind::Closure { captures, .. } => {
                let node = self.allocation_node(expr);
                for capture in captures {
                    self.visit_capture(node, capture);
                }
                self.flow(hole.addr(), node);
            }
            ExprKind::Call { callee, args } => self.visit_call_expression(callee, args)?,
            ExprKind::Convert(inner) => self.visit_expression(inner, hole)?,
            ExprKind::Binary { lhs, rhs } => {
                self.visit_expression(lhs, Hole::discard())?;
                self.visit_expression(rhs, Hole::discard())?;
            }
        }
        Ok(())
    }

    /// Route call arguments according to what is known about the callee
    ///
    /// The call's own result carries no edges: whatever a callee returns
    /// already flowed into the callee's Phantom.
    pub fn visit_call_expression(&mut self, callee: &Callee, args: &[Expr]) -> Result<()> {
        self.calls_analyzed += 1;

        let target = match callee {
            Callee::Direct(target) => *target,
            Callee::Indirect(target) => {
                self.visit_expression(target, Hole::discard())?;
                return self.arguments_to_phantom(args);
            }
        };

        match self.resolve_callee(target)? {
            CalleeSummary::SameScc => {
                trace!("call to SCC member {} routed to phantom", target);
                self.arguments_to_phantom(args)
            }
            CalleeSummary::Known(summary) => {
                for (index, arg) in args.iter().enumerate() {
                    let hole = match summary.parameter_leak_level.get(index) {
                        Some(None) => {
                            let placeholder = self.argument_node(ParamRef {
                                function: target,
                                index,
                            });
                            Hole::to(placeholder)
                        }
                        Some(Some(level)) => Hole::with_derefs(self.phantom, *level as i32),
                        // Variadic tail
                        None => Hole::to(self.phantom),
                    };
                    self.visit_expression(arg, hole)?;
                }
                Ok(())
            }
        }
    }

    fn resolve_callee(&self, target: FunctionId) -> Result<CalleeSummary<'a>> {
        if self.members.contains(&target) {
            return Ok(match self.provisional.and_then(|p| p.get(&target)) {
                Some(summary) => CalleeSummary::Known(summary),
                None => CalleeSummary::SameScc,
            });
        }
        self.published
            .get(target)
            .map(CalleeSummary::Known)
            .ok_or(EscapeAnalysisError::SummaryNotPublished(target))
    }

    fn arguments_to_phantom(&mut self, args: &[Expr]) -> Result<()> {
        for arg in args {
            self.visit_expression(arg, Hole::to(self.phantom))?;
        }
        Ok(())
    }

    fn visit_capture(&mut self, closure: NodeId, capture: &Capture) {
        // Variables of functions further out are not storage of this frame
        let Some(&var) = self.decls.get(&capture.decl) else {
            return;
        };
        let derefs = if capture.by_reference { -1 } else { 0 };
        self.escape_flows(closure, var, derefs);
    }

    /// Record that `src`, dereferenced `derefs` times, flows into `dst`
    ///
    /// Every edge of the graph is added here.
    pub fn escape_flows(&mut self, dst: NodeId, src: NodeId, derefs: i32) {
        if self.ctx.add_edge(dst, src, derefs) {
            trace!(
                "{} <- {} ({})",
                self.ctx.node(dst).kind,
                self.ctx.node(src).kind,
                derefs
            );
        }
    }

    fn flow(&mut self, hole: Hole, src: NodeId) {
        if let Some(dst) = hole.dst {
            self.escape_flows(dst, src, hole.derefs);
        }
    }

    fn allocation_node(&mut self, expr: &Expr) -> NodeId {
        if !expr.location.is_valid() {
            trace!("allocation {} in {} has no source location", expr.id, self.function);
        }
        let node = self.ctx.create_node(
            NodeKind::Allocation(AllocationKey::new(expr.location, expr.id)),
            self.function,
            Some(Origin::Expr(expr.id)),
            self.loop_depth,
        );
        self.ctx.bind_expr(expr.id, node);
        node
    }

    fn argument_node(&mut self, param: ParamRef) -> NodeId {
        self.ctx.create_node(
            NodeKind::Argument {
                caller: self.function,
                param,
            },
            self.function,
            None,
            ARGUMENT_DEPTH,
        )
    }

    fn force_heap(&mut self, node: NodeId) {
        debug!("{} forced to heap", self.ctx.node(node).kind);
        self.ctx.force(node, EscapeStatus::Heap);
    }

    fn decl_node(&self, decl: DeclId) -> Result<NodeId> {
        self.decls
            .get(&decl)
            .copied()
            .ok_or(EscapeAnalysisError::UnknownDeclaration {
                function: self.function,
                decl,
            })
    }

    fn temp_node(&self, temp: TempId) -> Result<NodeId> {
        self.temps
            .get(&temp)
            .copied()
            .ok_or(EscapeAnalysisError::UnknownTemporary {
                function: self.function,
                temp,
            })
    }
}

/// Whether `&expr` names existing storage rather than needing a fresh home
fn is_addressable(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Local(_)
        | ExprKind::Temp(_)
        | ExprKind::Global(_)
        | ExprKind::Captured(_)
        | ExprKind::Deref(_)
        | ExprKind::Composite { .. } => true,
        ExprKind::Field {
            base,
            through_pointer,
            ..
        }
        | ExprKind::Index {
            base,
            through_pointer,
            ..
        } => *through_pointer || is_addressable(base),
        _ => false,
    }
}
