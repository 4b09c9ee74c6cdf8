//! Fluent construction of IR programs
//!
//! Used by tests, benchmarks and the driver's demo programs. Every expression
//! gets a fresh `ExprId` and a distinct source location, so allocation sites
//! built here never collide.

use super::{
    Callee, Capture, DeclId, Expr, ExprId, ExprKind, Function, FunctionId, IdGenerator,
    MakeKind, Param, Program, SourceLocation, Stmt, TempId,
};

/// Builds a [`Program`]; functions may be declared before they are defined so
/// that calls can refer to them (recursion, forward references).
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    functions: Vec<Function>,
    function_ids: IdGenerator<FunctionId>,
    decl_ids: IdGenerator<DeclId>,
    temp_ids: IdGenerator<TempId>,
    expr_ids: IdGenerator<ExprId>,
    file_id: u32,
    next_line: u32,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a function. Until [`define`](Self::define) is called it has no body.
    pub fn declare_function(&mut self, name: &str) -> FunctionId {
        let id = self.function_ids.next();
        let location = self.next_location();
        self.functions.push(Function {
            id,
            name: name.to_string(),
            params: Vec::new(),
            body: None,
            location,
        });
        id
    }

    /// Declare a function without a body (external/intrinsic)
    pub fn external(&mut self, name: &str, params: &[(&str, bool)]) -> FunctionId {
        let id = self.declare_function(name);
        let params: Vec<Param> = params
            .iter()
            .map(|(name, has_pointers)| Param {
                decl: self.decl_ids.next(),
                name: name.to_string(),
                has_pointers: *has_pointers,
            })
            .collect();
        if let Some(function) = self.functions.iter_mut().find(|f| f.id == id) {
            function.params = params;
        }
        id
    }

    /// Give a declared function its parameters and body
    pub fn define<F>(&mut self, id: FunctionId, build: F)
    where
        F: FnOnce(&mut FunctionBuilder<'_>),
    {
        let mut builder = FunctionBuilder {
            program: self,
            params: Vec::new(),
            bodies: vec![Vec::new()],
        };
        build(&mut builder);

        let FunctionBuilder {
            params, mut bodies, ..
        } = builder;
        let body = bodies.pop().unwrap_or_default();

        if let Some(function) = self.functions.iter_mut().find(|f| f.id == id) {
            function.params = params;
            function.body = Some(body);
        }
    }

    pub fn build(self) -> Program {
        Program {
            functions: self.functions,
        }
    }

    fn next_location(&mut self) -> SourceLocation {
        self.next_line += 1;
        SourceLocation::new(self.file_id, self.next_line, 1, self.next_line * 80)
    }

    fn expr(&mut self, kind: ExprKind) -> Expr {
        let location = self.next_location();
        Expr::new(self.expr_ids.next(), kind, location)
    }
}

/// Builds the parameter list and body of one function
pub struct FunctionBuilder<'a> {
    program: &'a mut ProgramBuilder,
    params: Vec<Param>,
    /// Innermost statement list is last
    bodies: Vec<Vec<Stmt>>,
}

impl<'a> FunctionBuilder<'a> {
    pub fn param(&mut self, name: &str, has_pointers: bool) -> DeclId {
        let decl = self.program.decl_ids.next();
        self.params.push(Param {
            decl,
            name: name.to_string(),
            has_pointers,
        });
        decl
    }

    // Statements

    pub fn declare(&mut self, name: &str, init: Option<Expr>) -> DeclId {
        let decl = self.program.decl_ids.next();
        self.push(Stmt::Declare {
            decl,
            name: name.to_string(),
            init,
        });
        decl
    }

    pub fn temp(&mut self, init: Expr) -> TempId {
        let temp = self.program.temp_ids.next();
        self.push(Stmt::Temp { temp, init });
        temp
    }

    pub fn assign(&mut self, target: Expr, value: Expr) {
        self.push(Stmt::Assign { target, value });
    }

    pub fn ret(&mut self, values: Vec<Expr>) {
        self.push(Stmt::Return { values });
    }

    pub fn expr_stmt(&mut self, expr: Expr) {
        self.push(Stmt::Expr(expr));
    }

    pub fn send(&mut self, channel: Expr, value: Expr) {
        self.push(Stmt::Send { channel, value });
    }

    pub fn spawn(&mut self, call: Expr) {
        self.push(Stmt::Spawn { call });
    }

    pub fn block<F>(&mut self, build: F)
    where
        F: FnOnce(&mut Self),
    {
        let body = self.nested(build);
        self.push(Stmt::Block(body));
    }

    pub fn if_<T, E>(&mut self, cond: Expr, then_build: T, else_build: E)
    where
        T: FnOnce(&mut Self),
        E: FnOnce(&mut Self),
    {
        let then_body = self.nested(then_build);
        let else_body = self.nested(else_build);
        self.push(Stmt::If {
            cond,
            then_body,
            else_body,
        });
    }

    pub fn loop_<F>(&mut self, cond: Option<Expr>, build: F)
    where
        F: FnOnce(&mut Self),
    {
        let body = self.nested(build);
        self.push(Stmt::Loop { cond, body });
    }

    // Expressions

    pub fn lit(&mut self) -> Expr {
        self.program.expr(ExprKind::Literal)
    }

    pub fn var(&mut self, decl: DeclId) -> Expr {
        self.program.expr(ExprKind::Local(decl))
    }

    pub fn temp_ref(&mut self, temp: TempId) -> Expr {
        self.program.expr(ExprKind::Temp(temp))
    }

    pub fn global(&mut self, name: &str) -> Expr {
        self.program.expr(ExprKind::Global(name.to_string()))
    }

    pub fn captured(&mut self, decl: DeclId) -> Expr {
        self.program.expr(ExprKind::Captured(decl))
    }

    pub fn blank(&mut self) -> Expr {
        self.program.expr(ExprKind::Blank)
    }

    pub fn addr(&mut self, inner: Expr) -> Expr {
        self.program.expr(ExprKind::AddressOf(Box::new(inner)))
    }

    pub fn deref(&mut self, inner: Expr) -> Expr {
        self.program.expr(ExprKind::Deref(Box::new(inner)))
    }

    /// `base.field` on a struct value
    pub fn field(&mut self, base: Expr, field: &str) -> Expr {
        self.field_expr(base, field, false)
    }

    /// `base.field` where `base` is a pointer
    pub fn field_ptr(&mut self, base: Expr, field: &str) -> Expr {
        self.field_expr(base, field, true)
    }

    /// `base[index]` on an array value
    pub fn index(&mut self, base: Expr, index: Expr) -> Expr {
        self.index_expr(base, index, false)
    }

    /// `base[index]` on a slice or map
    pub fn index_ptr(&mut self, base: Expr, index: Expr) -> Expr {
        self.index_expr(base, index, true)
    }

    /// `base[:]` on an array value
    pub fn slice(&mut self, base: Expr) -> Expr {
        self.program.expr(ExprKind::Slice {
            base: Box::new(base),
            through_pointer: false,
        })
    }

    /// `base[:]` on a slice
    pub fn slice_ptr(&mut self, base: Expr) -> Expr {
        self.program.expr(ExprKind::Slice {
            base: Box::new(base),
            through_pointer: true,
        })
    }

    pub fn new_object(&mut self) -> Expr {
        self.program.expr(ExprKind::New {
            init: None,
            size: Some(8),
        })
    }

    pub fn new_with(&mut self, init: Expr) -> Expr {
        self.program.expr(ExprKind::New {
            init: Some(Box::new(init)),
            size: Some(8),
        })
    }

    pub fn new_sized(&mut self, size: Option<u64>) -> Expr {
        self.program.expr(ExprKind::New { init: None, size })
    }

    pub fn composite(&mut self, elements: Vec<Expr>) -> Expr {
        self.program.expr(ExprKind::Composite { elements })
    }

    pub fn make(&mut self, kind: MakeKind, args: Vec<Expr>, size: Option<u64>) -> Expr {
        self.program.expr(ExprKind::Make { kind, args, size })
    }

    pub fn closure(&mut self, function: FunctionId, captures: Vec<Capture>) -> Expr {
        self.program
            .expr(ExprKind::Closure { function, captures })
    }

    pub fn call(&mut self, function: FunctionId, args: Vec<Expr>) -> Expr {
        self.program.expr(ExprKind::Call {
            callee: Callee::Direct(function),
            args,
        })
    }

    pub fn call_indirect(&mut self, target: Expr, args: Vec<Expr>) -> Expr {
        self.program.expr(ExprKind::Call {
            callee: Callee::Indirect(Box::new(target)),
            args,
        })
    }

    pub fn convert(&mut self, inner: Expr) -> Expr {
        self.program.expr(ExprKind::Convert(Box::new(inner)))
    }

    pub fn binary(&mut self, lhs: Expr, rhs: Expr) -> Expr {
        self.program.expr(ExprKind::Binary {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn field_expr(&mut self, base: Expr, field: &str, through_pointer: bool) -> Expr {
        self.program.expr(ExprKind::Field {
            base: Box::new(base),
            field: field.to_string(),
            through_pointer,
        })
    }

    fn index_expr(&mut self, base: Expr, index: Expr, through_pointer: bool) -> Expr {
        self.program.expr(ExprKind::Index {
            base: Box::new(base),
            index: Box::new(index),
            through_pointer,
        })
    }

    fn push(&mut self, stmt: Stmt) {
        if let Some(body) = self.bodies.last_mut() {
            body.push(stmt);
        }
    }

    fn nested<F>(&mut self, build: F) -> Vec<Stmt>
    where
        F: FnOnce(&mut Self),
    {
        self.bodies.push(Vec::new());
        build(self);
        self.bodies.pop().unwrap_or_default()
    }
}
