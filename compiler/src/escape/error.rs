//! Internal-consistency errors of the escape analysis pass
//!
//! Analytical uncertainty never produces one of these: it resolves to `Heap`
//! or "not safe". An `Err` here means the IR handed to the pass, or the pass
//! itself, is broken, and the driver reports it as an internal compiler error.

use crate::ir::{DeclId, FunctionId, TempId};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeAnalysisError {
    /// A call or query names a function that is not part of the program
    UnknownFunction(FunctionId),

    /// Two functions of the program share an id
    DuplicateFunction(FunctionId),

    /// A local is read or assigned before its declaration was visited
    UnknownDeclaration { function: FunctionId, decl: DeclId },

    /// A temporary is used before its definition was visited
    UnknownTemporary { function: FunctionId, temp: TempId },

    /// The left-hand side of an assignment is not an lvalue
    InvalidAssignmentTarget { function: FunctionId, what: String },

    /// A summary was queried before its SCC was published
    SummaryNotPublished(FunctionId),

    /// A summary was written twice
    SummaryAlreadyPublished(FunctionId),

    ParameterIndexOutOfRange {
        function: FunctionId,
        index: usize,
        count: usize,
    },

    /// Propagation did not reach a fixed point within its pass bound
    FixedPointDiverged { functions: Vec<FunctionId>, passes: usize },
}

impl fmt::Display for EscapeAnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction(function) => write!(f, "Unknown function {}", function),
            Self::DuplicateFunction(function) => {
                write!(f, "Function {} is defined more than once", function)
            }
            Self::UnknownDeclaration { function, decl } => {
                write!(f, "{} used before its declaration in {}", decl, function)
            }
            Self::UnknownTemporary { function, temp } => {
                write!(f, "{} used before its definition in {}", temp, function)
            }
            Self::InvalidAssignmentTarget { function, what } => {
                write!(f, "Invalid assignment target in {}: {}", function, what)
            }
            Self::SummaryNotPublished(function) => {
                write!(f, "Escape summary of {} queried before publication", function)
            }
            Self::SummaryAlreadyPublished(function) => {
                write!(f, "Escape summary of {} published twice", function)
            }
            Self::ParameterIndexOutOfRange {
                function,
                index,
                count,
            } => write!(
                f,
                "Parameter index {} out of range for {} ({} parameters)",
                index, function, count
            ),
            Self::FixedPointDiverged { functions, passes } => write!(
                f,
                "Escape propagation over {} function(s) did not converge after {} passes",
                functions.len(),
                passes
            ),
        }
    }
}

impl std::error::Error for EscapeAnalysisError {}
