//! Closure-based traversal over statement and expression trees
//!
//! Passes that only need to observe nodes (call-graph discovery, statistics)
//! hand a closure to these walkers instead of implementing a visitor type.

use super::{Expr, Stmt};

/// Invoke `callback` on every statement, pre-order, descending into nested bodies
pub fn visit_statements<'a, F>(stmts: &'a [Stmt], callback: &mut F)
where
    F: FnMut(&'a Stmt),
{
    for stmt in stmts {
        callback(stmt);
        match stmt {
            Stmt::Block(body) | Stmt::Loop { body, .. } => visit_statements(body, callback),
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                visit_statements(then_body, callback);
                visit_statements(else_body, callback);
            }
            _ => {}
        }
    }
}

/// Invoke `callback` on every expression reachable from `stmts`, pre-order
///
/// Closure bodies are separate functions and are not entered.
pub fn visit_expressions<'a, F>(stmts: &'a [Stmt], callback: &mut F)
where
    F: FnMut(&'a Expr),
{
    visit_statements(stmts, &mut |stmt: &'a Stmt| {
        for expr in statement_expressions(stmt) {
            visit_expression_tree(expr, &mut *callback);
        }
    });
}

/// Invoke `callback` on `expr` and all of its sub-expressions, pre-order
pub fn visit_expression_tree<'a, F>(expr: &'a Expr, callback: &mut F)
where
    F: FnMut(&'a Expr),
{
    callback(expr);
    expr.for_each_child(|child| visit_expression_tree(child, &mut *callback));
}

/// The expressions owned directly by a statement (not by nested statements)
fn statement_expressions(stmt: &Stmt) -> Vec<&Expr> {
    match stmt {
        Stmt::Declare { init, .. } => init.iter().collect(),
        Stmt::Assign { target, value } => vec![target, value],
        Stmt::Return { values } => values.iter().collect(),
        Stmt::Expr(expr) | Stmt::Spawn { call: expr } => vec![expr],
        Stmt::Temp { init, .. } => vec![init],
        Stmt::Block(_) => Vec::new(),
        Stmt::If { cond, .. } => vec![cond],
        Stmt::Loop { cond, .. } => cond.iter().collect(),
        Stmt::Send { channel, value } => vec![channel, value],
    }
}
