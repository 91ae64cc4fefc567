//! Closures: capture analysis and context construction.
//!
//! A two-pass design. The first pass walks a body once and discovers, for
//! every local and for the receiver, whether a nested function reads or
//! writes it from a deeper scope. The second pass builds one context struct
//! per scope that has captures, chained to the nearest non-empty ancestor
//! scope, and assigns every captured variable a field slot. Scopes without
//! captures get no context at all.
//!
//! A lambda value is a two-field struct pairing the enclosing context with
//! a typed function reference; calls go through `call_ref` after loading
//! both fields.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Error, Result};
use crate::ir::{Body, ClassId, Expr, ExprId, IrType, LocalId, Program, Stmt};
use crate::layout::ClassLayout;
use crate::types::{
    FieldType, FuncType, HeapType, StorageType, StructType, TypeIdx, TypeStore, ValType,
};

/// The module-level shape of one closure signature: the struct carrying
/// `{context, function}` and the typed function reference it stores.
#[derive(Debug, Clone, Copy)]
pub struct ClosureShape {
    pub closure_struct: TypeIdx,
    pub func_type: TypeIdx,
}

/// Closure-struct field indices.
pub const CLOSURE_CONTEXT_FIELD: u32 = 0;
pub const CLOSURE_FUNC_FIELD: u32 = 1;

/// Memoizes one [`ClosureShape`] per function signature.
#[derive(Debug, Default)]
pub struct ClosureRegistry {
    by_sig: HashMap<(Vec<IrType>, IrType), ClosureShape>,
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shape(
        &mut self,
        layout: &ClassLayout,
        program: &Program,
        types: &mut TypeStore,
        params: &[IrType],
        ret: &IrType,
    ) -> Result<ClosureShape> {
        let key = (params.to_vec(), ret.clone());
        if let Some(shape) = self.by_sig.get(&key) {
            return Ok(*shape);
        }
        // Register the reserved struct before lowering parameter types so a
        // self-referential signature resolves to the reservation instead of
        // recursing forever.
        let closure_struct = types.reserve_struct()?;
        self.by_sig.insert(
            key.clone(),
            ClosureShape {
                closure_struct,
                func_type: TypeIdx(u32::MAX),
            },
        );

        let mut fn_params = vec![ValType::nullable_ref(HeapType::Struct)];
        for param in params {
            fn_params.push(layout.value_type(program, types, self, param)?);
        }
        let results = if ret.is_void() {
            Vec::new()
        } else {
            vec![layout.value_type(program, types, self, ret)?]
        };
        let func_type = types.intern_func(FuncType {
            params: fn_params,
            results,
        })?;
        types.define_struct(
            closure_struct,
            StructType {
                fields: vec![
                    FieldType::immutable(StorageType::Val(ValType::nullable_ref(
                        HeapType::Struct,
                    ))),
                    FieldType::immutable(StorageType::Val(ValType::non_null_ref(
                        HeapType::Def(func_type),
                    ))),
                ],
            },
            None,
        )?;
        let shape = ClosureShape {
            closure_struct,
            func_type,
        };
        self.by_sig.insert(key, shape);
        Ok(shape)
    }
}

/// Scope index within one body: 0 is the member body itself, every lambda
/// opens one more.
pub type ScopeId = usize;

/// One lexical scope's captured-variable storage.
#[derive(Debug)]
pub struct Context {
    pub scope: ScopeId,
    pub struct_type: TypeIdx,
    /// Index into the context arena of the nearest capturing ancestor.
    pub parent: Option<usize>,
    pub parent_field: Option<u32>,
    pub this_field: Option<u32>,
    /// Captured local -> context struct field.
    pub slots: BTreeMap<LocalId, u32>,
}

/// Result of the discovery pass plus the built context arena.
#[derive(Debug, Default)]
pub struct CaptureAnalysis {
    /// Scope opened by each lambda expression.
    pub lambda_scopes: HashMap<ExprId, ScopeId>,
    /// Parent scope of each scope; `None` for the body scope.
    scope_parents: Vec<Option<ScopeId>>,
    /// Scope that declares each local (temps introduced later are absent).
    decl_scopes: HashMap<LocalId, ScopeId>,
    pub captured: HashSet<LocalId>,
    pub captures_this: bool,
    pub contexts: Vec<Context>,
    /// Scope -> index of its own context, if it has captures.
    own_context: Vec<Option<usize>>,
}

impl CaptureAnalysis {
    /// Pass 1: discover captured locals and receiver use across scopes.
    pub fn discover(body: &Body) -> Self {
        let mut analysis = CaptureAnalysis {
            scope_parents: vec![None],
            own_context: vec![None],
            ..CaptureAnalysis::default()
        };
        for index in 0..body.param_count {
            analysis.decl_scopes.insert(LocalId(index), 0);
        }
        analysis.walk_stmts(body, &body.stmts, 0);
        analysis
    }

    fn open_scope(&mut self, parent: ScopeId) -> ScopeId {
        let scope = self.scope_parents.len();
        self.scope_parents.push(Some(parent));
        self.own_context.push(None);
        scope
    }

    fn walk_stmts(&mut self, body: &Body, stmts: &[Stmt], scope: ScopeId) {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(expr) => self.walk_expr(body, *expr, scope),
                Stmt::Let { local, value } => {
                    self.decl_scopes.insert(*local, scope);
                    if let Some(value) = value {
                        self.walk_expr(body, *value, scope);
                    }
                }
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    self.walk_expr(body, *cond, scope);
                    self.walk_stmts(body, then_branch, scope);
                    self.walk_stmts(body, else_branch, scope);
                }
                Stmt::While { cond, body: inner } => {
                    self.walk_expr(body, *cond, scope);
                    self.walk_stmts(body, inner, scope);
                }
                Stmt::Return(value) => {
                    if let Some(value) = value {
                        self.walk_expr(body, *value, scope);
                    }
                }
                Stmt::Break | Stmt::Continue => {}
                Stmt::Block(inner) => self.walk_stmts(body, inner, scope),
            }
        }
    }

    fn use_local(&mut self, local: LocalId, scope: ScopeId) {
        if let Some(&decl) = self.decl_scopes.get(&local)
            && decl != scope
        {
            self.captured.insert(local);
        }
    }

    fn walk_expr(&mut self, body: &Body, expr: ExprId, scope: ScopeId) {
        match body.expr(expr) {
            Expr::IntLit(_)
            | Expr::DoubleLit(_)
            | Expr::BoolLit(_)
            | Expr::StringLit(_)
            | Expr::Null
            | Expr::Const(_)
            | Expr::StaticGet(_) => {}
            Expr::This => {
                if scope != 0 {
                    self.captures_this = true;
                }
            }
            Expr::LocalGet(local) => self.use_local(*local, scope),
            Expr::LocalSet(local, value) => {
                self.use_local(*local, scope);
                self.walk_expr(body, *value, scope);
            }
            Expr::StaticSet(_, value) | Expr::NullCheck(value) | Expr::Not(value) => {
                self.walk_expr(body, *value, scope);
            }
            Expr::FieldGet { receiver, .. } => self.walk_expr(body, *receiver, scope),
            Expr::FieldSet {
                receiver, value, ..
            } => {
                self.walk_expr(body, *receiver, scope);
                self.walk_expr(body, *value, scope);
            }
            Expr::CallVirtual {
                receiver,
                args,
                named_args,
                ..
            } => {
                self.walk_expr(body, *receiver, scope);
                for arg in args {
                    self.walk_expr(body, *arg, scope);
                }
                for (_, arg) in named_args {
                    self.walk_expr(body, *arg, scope);
                }
            }
            Expr::CallDirect {
                receiver,
                args,
                named_args,
                ..
            } => {
                if let Some(receiver) = receiver {
                    self.walk_expr(body, *receiver, scope);
                }
                for arg in args {
                    self.walk_expr(body, *arg, scope);
                }
                for (_, arg) in named_args {
                    self.walk_expr(body, *arg, scope);
                }
            }
            Expr::New {
                args, named_args, ..
            } => {
                for arg in args {
                    self.walk_expr(body, *arg, scope);
                }
                for (_, arg) in named_args {
                    self.walk_expr(body, *arg, scope);
                }
            }
            Expr::CallClosure { callee, args } => {
                self.walk_expr(body, *callee, scope);
                for arg in args {
                    self.walk_expr(body, *arg, scope);
                }
            }
            Expr::Lambda {
                params,
                body: lambda_body,
                ..
            } => {
                let inner = self.open_scope(scope);
                self.lambda_scopes.insert(expr, inner);
                for &param in params {
                    self.decl_scopes.insert(param, inner);
                }
                self.walk_stmts(body, lambda_body, inner);
            }
            Expr::Is { operand, .. } | Expr::As { operand, .. } => {
                self.walk_expr(body, *operand, scope);
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                self.walk_expr(body, *cond, scope);
                self.walk_expr(body, *then, scope);
                self.walk_expr(body, *otherwise, scope);
            }
            Expr::Logical { lhs, rhs, .. } => {
                self.walk_expr(body, *lhs, scope);
                self.walk_expr(body, *rhs, scope);
            }
        }
    }

    /// Pass 2: build context structs for every scope with captures.
    ///
    /// Contexts chain to the nearest capturing ancestor; the parent link
    /// and receiver slot always precede variable fields.
    pub fn build_contexts(
        &mut self,
        body: &Body,
        layout: &ClassLayout,
        program: &Program,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
        owner: Option<ClassId>,
    ) -> Result<()> {
        // Group captured locals by declaring scope, in local order so slot
        // assignment is deterministic.
        let mut by_scope: BTreeMap<ScopeId, Vec<LocalId>> = BTreeMap::new();
        let mut captured: Vec<LocalId> = self.captured.iter().copied().collect();
        captured.sort_by_key(|local| local.0);
        for local in captured {
            let scope = *self
                .decl_scopes
                .get(&local)
                .ok_or_else(|| Error::internal(format!("captured local {local} has no scope")))?;
            by_scope.entry(scope).or_default().push(local);
        }
        if self.captures_this {
            by_scope.entry(0).or_default();
        }

        // Scope ids grow parent-first, so iterating in order guarantees the
        // parent context exists before its children reference its struct.
        for (scope, locals) in by_scope {
            let parent = self.nearest_context(self.scope_parents[scope]);
            let mut fields = Vec::new();
            let parent_field = parent.map(|parent_index| {
                let parent_struct = self.contexts[parent_index].struct_type;
                fields.push(FieldType::mutable(StorageType::Val(ValType::nullable_ref(
                    HeapType::Def(parent_struct),
                ))));
                0u32
            });
            let this_field = if scope == 0 && self.captures_this {
                let class = owner.ok_or_else(|| {
                    Error::internal("receiver captured in a body without a receiver")
                })?;
                fields.push(FieldType::mutable(StorageType::Val(ValType::nullable_ref(
                    HeapType::Def(layout.struct_of(class)),
                ))));
                Some(fields.len() as u32 - 1)
            } else {
                None
            };
            let mut slots = BTreeMap::new();
            for local in locals {
                let storage =
                    layout.storage_type(program, types, closures, &body.local(local).ty)?;
                slots.insert(local, fields.len() as u32);
                fields.push(FieldType::mutable(storage));
            }
            let struct_type = types.add_struct(StructType { fields }, None)?;
            let index = self.contexts.len();
            self.contexts.push(Context {
                scope,
                struct_type,
                parent,
                parent_field,
                this_field,
                slots,
            });
            self.own_context[scope] = Some(index);
        }
        Ok(())
    }

    fn nearest_context(&self, mut scope: Option<ScopeId>) -> Option<usize> {
        while let Some(current) = scope {
            if let Some(index) = self.own_context[current] {
                return Some(index);
            }
            scope = self.scope_parents[current];
        }
        None
    }

    /// The context a scope's code starts from: its own, or the nearest
    /// capturing ancestor's.
    pub fn enclosing_context(&self, scope: ScopeId) -> Option<usize> {
        self.nearest_context(Some(scope))
    }

    pub fn own_context(&self, scope: ScopeId) -> Option<usize> {
        self.own_context[scope]
    }

    pub fn is_captured(&self, local: LocalId) -> bool {
        self.captured.contains(&local)
    }

    /// Resolve a captured local from code running in `scope`: how many
    /// parent links to follow from the scope's context, and the field.
    pub fn resolve_local(&self, scope: ScopeId, local: LocalId) -> Option<(u32, u32, usize)> {
        let mut hops = 0u32;
        let mut current = self.enclosing_context(scope);
        while let Some(index) = current {
            if let Some(&field) = self.contexts[index].slots.get(&local) {
                return Some((hops, field, index));
            }
            current = self.contexts[index].parent;
            hops += 1;
        }
        None
    }

    /// Resolve the captured receiver the same way.
    pub fn resolve_this(&self, scope: ScopeId) -> Option<(u32, u32, usize)> {
        let mut hops = 0u32;
        let mut current = self.enclosing_context(scope);
        while let Some(index) = current {
            if let Some(field) = self.contexts[index].this_field {
                return Some((hops, field, index));
            }
            current = self.contexts[index].parent;
            hops += 1;
        }
        None
    }
}
