//! Type-checked IR consumed by the escape analysis pass
//!
//! This is the narrow slice of the middle-end IR the pass needs: functions,
//! their formal parameters, and a statement/expression tree whose nodes carry
//! stable identities. Types are already erased down to the one fact the pass
//! cares about (`Param::has_pointers`); pointer-ness of individual expressions
//! is encoded structurally (`through_pointer` on field/index/slice).
//!
//! The model is plain data, serializable with serde so programs can be
//! exchanged with the `escapist` driver as JSON.

pub mod build;
pub mod id_types;
pub mod visit;

pub use build::{FunctionBuilder, ProgramBuilder};
pub use id_types::{DeclId, ExprId, FunctionId, IdGenerator, IdType, NodeId, TempId};
pub use visit::{visit_expressions, visit_statements};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of an IR entity in the source program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceLocation {
    /// File ID where this entity is defined
    pub file_id: u32,
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub column: u32,
    /// Byte offset in file
    pub byte_offset: u32,
}

impl SourceLocation {
    pub const fn new(file_id: u32, line: u32, column: u32, byte_offset: u32) -> Self {
        Self {
            file_id,
            line,
            column,
            byte_offset,
        }
    }

    pub const fn unknown() -> Self {
        Self::new(u32::MAX, 0, 0, 0)
    }

    pub const fn is_valid(self) -> bool {
        self.file_id != u32::MAX
    }
}

impl Default for SourceLocation {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}:{}:{}", self.file_id, self.line, self.column)
        } else {
            write!(f, "<unknown>")
        }
    }
}

/// A whole compilation unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a function by id
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// Look up a function by name (first match)
    pub fn function_named(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Invoke `callback` once for every function of the unit, in declaration order
    pub fn for_each_function<'a, F>(&'a self, mut callback: F)
    where
        F: FnMut(&'a Function),
    {
        for function in &self.functions {
            callback(function);
        }
    }
}

/// A function, method or closure body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub params: Vec<Param>,
    /// `None` for external or intrinsic functions
    pub body: Option<Vec<Stmt>>,
    #[serde(default)]
    pub location: SourceLocation,
}

impl Function {
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

/// A formal parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub decl: DeclId,
    pub name: String,
    /// Whether values of the parameter's type can contain pointers
    pub has_pointers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    /// `var name = init`
    Declare {
        decl: DeclId,
        name: String,
        init: Option<Expr>,
    },
    /// `target = value`
    Assign { target: Expr, value: Expr },
    Return { values: Vec<Expr> },
    Expr(Expr),
    /// Compiler temporary definition
    Temp { temp: TempId, init: Expr },
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    /// Any looping construct; its body runs one loop level deeper
    Loop { cond: Option<Expr>, body: Vec<Stmt> },
    /// Send on a channel-like construct
    Send { channel: Expr, value: Expr },
    /// Start `call` concurrently
    Spawn { call: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprKind {
    /// Any constant; carries no pointer
    Literal,
    /// Read of a local variable or parameter
    Local(DeclId),
    Temp(TempId),
    /// Package-level variable
    Global(String),
    /// Variable of an enclosing function, referenced from a closure body
    Captured(DeclId),
    /// The blank assignment target `_`
    Blank,
    AddressOf(Box<Expr>),
    Deref(Box<Expr>),
    Field {
        base: Box<Expr>,
        field: String,
        /// `p.f` where `p` is a pointer
        through_pointer: bool,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
        /// Indexing a slice/map (shared backing store) rather than an array value
        through_pointer: bool,
    },
    /// `base[lo:hi]`; slicing an array value takes its address
    Slice { base: Box<Expr>, through_pointer: bool },
    /// `new(T)` or `&T{..}`: yields a pointer to fresh storage
    New {
        init: Option<Box<Expr>>,
        /// Allocation size in bytes when statically known
        size: Option<u64>,
    },
    /// Composite literal value `T{a, b}`
    Composite { elements: Vec<Expr> },
    /// `make(...)`: yields a reference to a fresh backing store
    Make {
        kind: MakeKind,
        args: Vec<Expr>,
        /// Backing-store size in bytes when statically known
        size: Option<u64>,
    },
    /// Closure creation
    Closure {
        function: FunctionId,
        captures: Vec<Capture>,
    },
    Call { callee: Callee, args: Vec<Expr> },
    Convert(Box<Expr>),
    /// Arithmetic/comparison; the result carries no pointer
    Binary { lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Direct(FunctionId),
    /// Call through a function value; the target is unknown
    Indirect(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub decl: DeclId,
    pub by_reference: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MakeKind {
    Slice,
    Map,
    Channel,
}

impl Expr {
    pub fn new(id: ExprId, kind: ExprKind, location: SourceLocation) -> Self {
        Self { id, kind, location }
    }

    /// Invoke `f` on every direct sub-expression, left to right
    pub fn for_each_child<'a, F>(&'a self, mut f: F)
    where
        F: FnMut(&'a Expr),
    {
        match &self.kind {
            ExprKind::Literal
            | ExprKind::Local(_)
            | ExprKind::Temp(_)
            | ExprKind::Global(_)
            | ExprKind::Captured(_)
            | ExprKind::Blank
            | ExprKind::Closure { .. } => {}
            ExprKind::AddressOf(inner) | ExprKind::Deref(inner) | ExprKind::Convert(inner) => {
                f(inner)
            }
            ExprKind::Field { base, .. } | ExprKind::Slice { base, .. } => f(base),
            ExprKind::Index { base, index, .. } => {
                f(base);
                f(index);
            }
            ExprKind::New { init, .. } => {
                if let Some(init) = init {
                    f(init);
                }
            }
            ExprKind::Composite { elements } => elements.iter().for_each(f),
            ExprKind::Make { args, .. } => args.iter().for_each(f),
            ExprKind::Call { callee, args } => {
                if let Callee::Indirect(target) = callee {
                    f(target);
                }
                args.iter().for_each(f);
            }
            ExprKind::Binary { lhs, rhs } => {
                f(lhs);
                f(rhs);
            }
        }
    }

    /// The direct callee if this is a direct call
    pub fn direct_callee(&self) -> Option<FunctionId> {
        match &self.kind {
            ExprKind::Call {
                callee: Callee::Direct(function),
                ..
            } => Some(*function),
            _ => None,
        }
    }
}
