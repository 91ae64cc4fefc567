//! The emission pass.
//!
//! Re-walks each analyzed body and turns it into verified instructions,
//! consulting the recorded conversions, intrinsics, devirtualizations, and
//! inline decisions from [`crate::analyze`]. Every IR node kind has exactly
//! one emission rule; a kind with no rule cannot exist because the match is
//! exhaustive over the closed sum.
//!
//! Inlined calls are not textual substitution: the callee's body is
//! re-generated against fresh locals bound to the caller's argument values,
//! inside a fresh block typed with the call's result, which keeps the
//! encoder's stack bookkeeping intact across the boundary.

use std::collections::HashMap;

use tracing::debug;

use crate::analyze::{BodyPlan, Conversion, analyze_body};
use crate::closures::{
    CLOSURE_CONTEXT_FIELD, CLOSURE_FUNC_FIELD, CaptureAnalysis, ClosureRegistry, ScopeId,
};
use crate::constants::{ConstantPool, PoolCx};
use crate::dispatch::{DispatchTables, DispatchTree, SelectorId};
use crate::error::{Error, Result};
use crate::instr::{BlockType, CodeWriter, Instr};
use crate::intrinsics::Intrinsic;
use crate::ir::{
    Body, ClassId, Constant, Expr, ExprId, IrType, LocalId, MemberDef, MemberId, MemberKind,
    ParamDef, Program, StaticId, Stmt,
};
use crate::layout::{CLASS_ID_FIELD, ClassLayout};
use crate::globals::{StaticKind, StaticTables};
use crate::module::{FuncIdx, ModuleBuilder};
use crate::options::BackendOptions;
use crate::types::{FuncType, HeapType, RefType, TypeIdx, ValType};

/// Member -> declared function index, fixed before body generation.
#[derive(Debug, Default)]
pub struct FuncMap {
    pub by_member: Vec<Option<FuncIdx>>,
}

impl FuncMap {
    pub fn get(&self, member: MemberId) -> Result<FuncIdx> {
        self.by_member
            .get(member.0)
            .copied()
            .flatten()
            .ok_or_else(|| {
                Error::internal(format!("member {member} has no declared function"))
            })
    }
}

/// Where a `return` statement sends its value.
#[derive(Debug, Clone, Copy)]
enum ReturnTarget {
    Function,
    /// Branch to an enclosing block (inline expansion, accessor bodies).
    Branch { pos: usize, has_value: bool },
}

/// Per-function emission state.
struct Frame<'p> {
    plan: &'p BodyPlan,
    captures: &'p CaptureAnalysis,
    body: &'p Body,
    scope: ScopeId,
    owner: Option<ClassId>,
    locals: HashMap<LocalId, u32>,
    this_local: Option<u32>,
    /// Local holding the scope's context and its arena index.
    context: Option<(u32, usize)>,
    /// (break position, continue position) as writer label depths.
    loops: Vec<(usize, usize)>,
    ret: ReturnTarget,
    scratch: HashMap<ValType, u32>,
}

impl<'p> Frame<'p> {
    fn new(
        plan: &'p BodyPlan,
        captures: &'p CaptureAnalysis,
        body: &'p Body,
        scope: ScopeId,
        owner: Option<ClassId>,
        ret: ReturnTarget,
    ) -> Self {
        Self {
            plan,
            captures,
            body,
            scope,
            owner,
            locals: HashMap::new(),
            this_local: None,
            context: None,
            loops: Vec::new(),
            ret,
            scratch: HashMap::new(),
        }
    }
}

/// The type-directed code generator.
pub struct CodeGenerator<'a> {
    pub program: &'a Program,
    pub layout: &'a ClassLayout,
    pub dispatch: &'a DispatchTables,
    pub statics: &'a StaticTables,
    pub options: &'a BackendOptions,
    pub closures: &'a mut ClosureRegistry,
    pub constants: &'a mut ConstantPool,
    pub module: &'a mut ModuleBuilder,
    pub funcs: &'a FuncMap,
    /// Counter for lambda function naming.
    pub lambda_count: usize,
}

impl<'a> CodeGenerator<'a> {
    fn value_type(&mut self, ty: &IrType) -> Result<ValType> {
        self.layout
            .value_type(self.program, &mut self.module.types, self.closures, ty)
    }

    fn storage_local_type(&mut self, ty: &IrType) -> Result<ValType> {
        let value = self.value_type(ty)?;
        Ok(match value {
            ValType::Ref(reference) => ValType::nullable_ref(reference.heap),
            other => other,
        })
    }

    fn scratch(&mut self, f: &mut Frame<'_>, w: &mut CodeWriter, ty: ValType) -> u32 {
        *f.scratch.entry(ty).or_insert_with(|| w.add_local(ty))
    }

    /// Insert the null-check/cast needed so a value of `from` satisfies a
    /// consumer expecting `to`. Class representation types can invert
    /// across an IR upcast; the cast here is what keeps the wasm types
    /// sound in that case.
    fn adapt(&mut self, w: &mut CodeWriter, from: ValType, to: ValType) -> Result<()> {
        if self.module.types.is_val_subtype(from, to) {
            return Ok(());
        }
        match (from, to) {
            (ValType::Ref(a), ValType::Ref(b)) => {
                if a.nullable && !b.nullable {
                    w.ref_as_non_null()?;
                    let narrowed = RefType::non_null(a.heap);
                    if self
                        .module
                        .types
                        .is_val_subtype(ValType::Ref(narrowed), to)
                    {
                        return Ok(());
                    }
                }
                w.ref_cast(b)?;
                Ok(())
            }
            (from, to) => Err(Error::internal(format!(
                "no adaptation from {from} to {to}"
            ))),
        }
    }

    // ---- member bodies ----

    pub fn emit_member(&mut self, member_id: MemberId) -> Result<()> {
        let member = self.program.member(member_id);
        if member.import.is_some() {
            return Ok(());
        }
        let Some(body) = member.body.as_ref() else {
            return Ok(());
        };
        let func = self.funcs.get(member_id)?;
        let plan = analyze_body(
            self.program,
            self.dispatch,
            self.options,
            member_id,
            member.owner,
            body,
            &member.return_ty,
        )?;
        let mut captures = CaptureAnalysis::discover(body);
        captures.build_contexts(
            body,
            self.layout,
            self.program,
            &mut self.module.types,
            self.closures,
            member.owner,
        )?;

        let sig = self.module.func_sig(func)?.clone();
        let mut w = CodeWriter::new(&sig.params, sig.results.clone());
        let mut frame = Frame::new(
            &plan,
            &captures,
            body,
            0,
            member.owner,
            ReturnTarget::Function,
        );
        self.emit_prologue(&mut frame, &mut w, member, &sig)?;
        if member.kind == MemberKind::Constructor {
            let owner = member.owner.ok_or_else(|| {
                Error::codegen(format!("constructor `{}` has no owning class", member.name))
            })?;
            self.emit_field_initializers(&mut frame, &mut w, owner)?;
        }
        self.emit_stmts(&mut frame, &mut w, &body.stmts)?;
        if !sig.results.is_empty() {
            // Only reachable when the input body can fall off the end of a
            // non-void function.
            w.unreachable()?;
        }
        self.finish_into(w, func, &member.name)
    }

    fn finish_into(&mut self, w: CodeWriter, func: FuncIdx, name: &str) -> Result<()> {
        if self.options.dump_functions {
            let listing = serde_json::json!({
                "function": name,
                "instructions": w.listing(),
            });
            debug!(target: "moss_wasm::dump", %listing, "function body");
        }
        wasm_debug!("emit `{name}`: {} instructions", w.listing().len());
        let entry = w.finish(&self.module.types)?;
        self.module.set_body(func, entry)
    }

    fn emit_prologue(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        member: &MemberDef,
        sig: &FuncType,
    ) -> Result<()> {
        let has_receiver = member.owner.is_some()
            && matches!(
                member.kind,
                MemberKind::Method
                    | MemberKind::Getter
                    | MemberKind::Setter
                    | MemberKind::Constructor
            );
        if has_receiver {
            let owner = member.owner.ok_or_else(|| Error::internal("receiver without owner"))?;
            // Specialize `this` into a local narrowed from the declared
            // receiver type to the one the body needs.
            if f.plan.specialize_this
                || f.captures.captures_this
                || member.kind == MemberKind::Constructor
            {
                let own = ValType::non_null_ref(HeapType::Def(self.layout.struct_of(owner)));
                w.local_get(0)?;
                self.adapt(w, sig.params[0], own)?;
                let this_local = w.add_local(own);
                w.local_set(&self.module.types, this_local)?;
                f.this_local = Some(this_local);
            }
        }

        let offset = usize::from(has_receiver);
        let order = param_order(member);
        for (position, local) in order.iter().enumerate() {
            let wasm_index = (offset + position) as u32;
            if f.captures.is_captured(*local) {
                continue; // moved into the context below
            }
            let declared = sig.params[offset + position];
            if self.options.nullable_locals
                && let ValType::Ref(reference) = declared
                && !reference.nullable
            {
                let relaxed = ValType::nullable_ref(reference.heap);
                let copy = w.add_local(relaxed);
                w.local_get(wasm_index)?;
                w.local_set(&self.module.types, copy)?;
                f.locals.insert(*local, copy);
            } else {
                f.locals.insert(*local, wasm_index);
            }
        }

        if let Some(ctx_index) = f.captures.own_context(0) {
            self.open_context(f, w, ctx_index, &order, offset)?;
        }

        // Remaining declared locals, captured ones excluded.
        for index in f.body.param_count..f.body.locals.len() {
            let local = LocalId(index);
            if f.captures.is_captured(local) || f.locals.contains_key(&local) {
                continue;
            }
            let ty = self.storage_local_type(&f.body.local(local).ty.clone())?;
            f.locals.insert(local, w.add_local(ty));
        }
        Ok(())
    }

    /// Allocate a scope's context struct and move captured parameters (and
    /// the receiver) into it.
    fn open_context(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        ctx_index: usize,
        order: &[LocalId],
        offset: usize,
    ) -> Result<()> {
        let (struct_type, parent_field, this_field) = {
            let ctx = &f.captures.contexts[ctx_index];
            (ctx.struct_type, ctx.parent_field, ctx.this_field)
        };
        w.struct_new_default(&self.module.types, struct_type)?;
        let ctx_local = w.add_local(ValType::non_null_ref(HeapType::Def(struct_type)));
        w.local_set(&self.module.types, ctx_local)?;
        if let (Some(field), Some((parent_local, _))) = (parent_field, f.context) {
            w.local_get(ctx_local)?;
            w.local_get(parent_local)?;
            w.struct_set(&self.module.types, struct_type, field)?;
        }
        if let (Some(field), Some(this_local)) = (this_field, f.this_local) {
            w.local_get(ctx_local)?;
            w.local_get(this_local)?;
            w.struct_set(&self.module.types, struct_type, field)?;
        }
        for (position, local) in order.iter().enumerate() {
            if !f.captures.is_captured(*local) {
                continue;
            }
            let slot = {
                let ctx = &f.captures.contexts[ctx_index];
                ctx.slots.get(local).copied()
            };
            if let Some(slot) = slot {
                w.local_get(ctx_local)?;
                w.local_get((offset + position) as u32)?;
                w.struct_set(&self.module.types, struct_type, slot)?;
            }
        }
        f.context = Some((ctx_local, ctx_index));
        Ok(())
    }

    fn emit_field_initializers(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        class: ClassId,
    ) -> Result<()> {
        let this_local = f
            .this_local
            .ok_or_else(|| Error::internal("constructor prologue lost its receiver"))?;
        let struct_type = self.layout.struct_of(class);
        let field_base = self.layout.info(class).field_base;
        for (index, field) in self.program.class(class).fields.iter().enumerate() {
            let Some(init) = field.initializer.as_ref() else {
                continue;
            };
            let plan = analyze_body(
                self.program,
                self.dispatch,
                self.options,
                self.program.entry,
                None,
                init,
                &field.ty,
            )?;
            if plan.specialize_this {
                return Err(Error::codegen(format!(
                    "field initializer for `{}` may not reference `this`",
                    field.name
                )));
            }
            let captures = CaptureAnalysis::discover(init);
            let mut sub = Frame::new(&plan, &captures, init, 0, None, f.ret);
            let value = initializer_value(init).ok_or_else(|| {
                Error::codegen(format!(
                    "field initializer for `{}` must be a single returned expression",
                    field.name
                ))
            })?;
            w.local_get(this_local)?;
            let produced = self
                .emit_expr(&mut sub, w, value)?
                .ok_or_else(|| Error::codegen("field initializer produces no value"))?;
            let storage = self.storage_local_type(&field.ty.clone())?;
            self.adapt(w, produced, storage)?;
            w.struct_set(&self.module.types, struct_type, field_base + index as u32)?;
        }
        Ok(())
    }

    // ---- statements ----

    fn emit_stmts(&mut self, f: &mut Frame<'_>, w: &mut CodeWriter, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(expr) => {
                    if let Some(_value) = self.emit_expr(f, w, *expr)? {
                        w.drop_()?;
                    }
                }
                Stmt::Let { local, value } => {
                    if let Some(value) = value {
                        self.emit_local_store(f, w, *local, *value)?;
                    }
                }
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    self.emit_expr(f, w, *cond)?;
                    w.if_(&self.module.types, BlockType::Empty)?;
                    self.emit_stmts(f, w, then_branch)?;
                    if !else_branch.is_empty() {
                        w.else_(&self.module.types)?;
                        self.emit_stmts(f, w, else_branch)?;
                    }
                    w.end(&self.module.types)?;
                }
                Stmt::While { cond, body } => {
                    w.block(BlockType::Empty);
                    let break_pos = w.depth();
                    w.loop_(BlockType::Empty);
                    let continue_pos = w.depth();
                    f.loops.push((break_pos, continue_pos));
                    self.emit_expr(f, w, *cond)?;
                    w.i32_eqz(&self.module.types)?;
                    w.br_if(&self.module.types, (w.depth() - break_pos) as u32)?;
                    self.emit_stmts(f, w, body)?;
                    w.br(&self.module.types, (w.depth() - continue_pos) as u32)?;
                    f.loops.pop();
                    w.end(&self.module.types)?;
                    w.end(&self.module.types)?;
                }
                Stmt::Return(value) => self.emit_return(f, w, *value)?,
                Stmt::Break => {
                    let (break_pos, _) = *f.loops.last().ok_or_else(|| {
                        Error::codegen("`break` outside a loop")
                    })?;
                    w.br(&self.module.types, (w.depth() - break_pos) as u32)?;
                }
                Stmt::Continue => {
                    let (_, continue_pos) = *f.loops.last().ok_or_else(|| {
                        Error::codegen("`continue` outside a loop")
                    })?;
                    w.br(&self.module.types, (w.depth() - continue_pos) as u32)?;
                }
                Stmt::Block(inner) => self.emit_stmts(f, w, inner)?,
            }
        }
        Ok(())
    }

    fn emit_return(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        value: Option<ExprId>,
    ) -> Result<()> {
        match f.ret {
            ReturnTarget::Function => {
                if let Some(value) = value {
                    self.emit_expr(f, w, value)?;
                }
                w.return_(&self.module.types)
            }
            ReturnTarget::Branch { pos, has_value } => {
                if let Some(value) = value {
                    let produced = self.emit_expr(f, w, value)?;
                    if produced.is_some() && !has_value {
                        w.drop_()?;
                    }
                }
                w.br(&self.module.types, (w.depth() - pos) as u32)
            }
        }
    }

    // ---- expressions ----

    /// Emit one expression and apply its recorded conversion. Returns the
    /// value type now on the stack, or `None` for void productions.
    fn emit_expr(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        id: ExprId,
    ) -> Result<Option<ValType>> {
        let raw = self.emit_node(f, w, id)?;
        match (raw, f.plan.conversions[id.0].clone()) {
            (Some(value), Some(conversion)) => {
                Ok(Some(self.apply_conversion(f, w, &conversion, value)?))
            }
            (raw, _) => Ok(raw),
        }
    }

    fn apply_conversion(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        conversion: &Conversion,
        current: ValType,
    ) -> Result<ValType> {
        match conversion {
            Conversion::Box(class) => self.emit_box(f, w, *class, current),
            Conversion::Unbox(class) => self.emit_unbox(w, *class),
            Conversion::NullAssert => {
                w.ref_as_non_null()?;
                match current {
                    ValType::Ref(reference) => {
                        Ok(ValType::non_null_ref(reference.heap))
                    }
                    other => Err(Error::internal(format!(
                        "null assertion applied to a {other}"
                    ))),
                }
            }
            Conversion::Downcast(ty) => {
                let target = self.value_type(&ty.clone())?;
                match target {
                    ValType::Ref(reference) => {
                        w.ref_cast(reference)?;
                        Ok(target)
                    }
                    other => Err(Error::internal(format!("downcast to a {other}"))),
                }
            }
        }
    }

    /// Wrap the primitive on the stack in its box class.
    fn emit_box(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        class: ClassId,
        current: ValType,
    ) -> Result<ValType> {
        let struct_type = self.layout.struct_of(class);
        let tmp = self.scratch(f, w, current);
        w.local_set(&self.module.types, tmp)?;
        w.i32_const(self.layout.runtime_id(class) as i32);
        w.local_get(tmp)?;
        w.struct_new(&self.module.types, struct_type)?;
        Ok(ValType::non_null_ref(HeapType::Def(struct_type)))
    }

    /// Narrow to the box class and read the payload back out.
    fn emit_unbox(&mut self, w: &mut CodeWriter, class: ClassId) -> Result<ValType> {
        let struct_type = self.layout.struct_of(class);
        w.ref_cast(RefType::non_null(HeapType::Def(struct_type)))?;
        let field = self.layout.info(class).field_base;
        w.struct_get(&self.module.types, struct_type, field)?;
        let payload = self
            .module
            .types
            .struct_type(struct_type)?
            .fields
            .get(field as usize)
            .ok_or_else(|| Error::internal("box class has no payload field"))?
            .storage
            .unpacked();
        Ok(payload)
    }

    fn emit_node(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        id: ExprId,
    ) -> Result<Option<ValType>> {
        match f.body.expr(id).clone() {
            Expr::IntLit(value) => {
                w.i64_const(value);
                Ok(Some(ValType::I64))
            }
            Expr::DoubleLit(value) => {
                w.f64_const(value);
                Ok(Some(ValType::F64))
            }
            Expr::BoolLit(value) => {
                w.i32_const(i32::from(value));
                Ok(Some(ValType::I32))
            }
            Expr::StringLit(text) => {
                let ty = self.pool_read(w, &Constant::String(text))?;
                Ok(Some(ValType::Ref(ty)))
            }
            Expr::Null => {
                let ty = self.value_type(&f.plan.produced[id.0].clone())?;
                match ty {
                    ValType::Ref(reference) => {
                        w.ref_null(reference.heap);
                        Ok(Some(ValType::nullable_ref(reference.heap)))
                    }
                    other => Err(Error::internal(format!("null lowered to {other}"))),
                }
            }
            Expr::Const(constant) => self.emit_constant(f, w, &constant),
            Expr::This => self.emit_this(f, w).map(Some),
            Expr::LocalGet(local) => self.emit_local_get(f, w, local).map(Some),
            Expr::LocalSet(local, value) => {
                if f.plan.drop_value[id.0] {
                    self.emit_local_store(f, w, local, value)?;
                    Ok(None)
                } else {
                    let produced = self.emit_value_to_scratch(f, w, value)?;
                    let (value_ty, tmp) = produced;
                    self.store_local_from_scratch(f, w, local, value_ty, tmp)?;
                    w.local_get(tmp)?;
                    Ok(Some(value_ty))
                }
            }
            Expr::StaticGet(static_id) => self.emit_static_get(f, w, static_id).map(Some),
            Expr::StaticSet(static_id, value) => {
                let keep = !f.plan.drop_value[id.0];
                let (value_ty, tmp) = self.emit_value_to_scratch(f, w, value)?;
                let slot = self.statics.slot(static_id).clone();
                w.local_get(tmp)?;
                self.adapt(w, value_ty, slot.storage)?;
                w.global_set(&self.module.types, slot.global.0, slot.storage)?;
                if let StaticKind::Lazy {
                    flag: Some(flag), ..
                } = slot.kind
                {
                    w.i32_const(1);
                    w.global_set(&self.module.types, flag.0, ValType::I32)?;
                }
                if keep {
                    w.local_get(tmp)?;
                    Ok(Some(value_ty))
                } else {
                    Ok(None)
                }
            }
            Expr::FieldGet { receiver, field } => {
                let recv = self
                    .emit_expr(f, w, receiver)?
                    .ok_or_else(|| Error::internal("field receiver produced no value"))?;
                let declaring = self.layout.struct_of(field.class);
                self.adapt(w, recv, ValType::nullable_ref(HeapType::Def(declaring)))?;
                let slot = self.layout.field_slot(field);
                w.struct_get(&self.module.types, declaring, slot)?;
                let field_ty = self.program.class(field.class).fields[field.index].ty.clone();
                let loaded = self
                    .module
                    .types
                    .struct_type(declaring)?
                    .fields[slot as usize]
                    .storage
                    .unpacked();
                let want = self.value_type(&field_ty)?;
                self.adapt(w, loaded, want)?;
                Ok(Some(want))
            }
            Expr::FieldSet {
                receiver,
                field,
                value,
            } => {
                let keep = !f.plan.drop_value[id.0];
                let recv = self
                    .emit_expr(f, w, receiver)?
                    .ok_or_else(|| Error::internal("field receiver produced no value"))?;
                let declaring = self.layout.struct_of(field.class);
                self.adapt(w, recv, ValType::nullable_ref(HeapType::Def(declaring)))?;
                let (value_ty, tmp) = self.emit_value_to_scratch(f, w, value)?;
                w.local_get(tmp)?;
                let slot = self.layout.field_slot(field);
                w.struct_set(&self.module.types, declaring, slot)?;
                if keep {
                    w.local_get(tmp)?;
                    Ok(Some(value_ty))
                } else {
                    Ok(None)
                }
            }
            Expr::CallVirtual {
                receiver,
                interface_target,
                args,
                named_args,
            } => {
                if let Some(intrinsic) = f.plan.intrinsics[id.0] {
                    return self.emit_intrinsic(f, w, intrinsic, receiver, &args);
                }
                if let Some(target) = f.plan.inline[id.0] {
                    return self.emit_inline(f, w, target, Some(receiver), &args, &named_args);
                }
                let selector_id = self
                    .dispatch
                    .selector_of(interface_target)
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "virtual target {interface_target} has no selector"
                        ))
                    })?;
                if let Some(target) = f.plan.devirt[id.0] {
                    return self.emit_devirtualized(
                        f,
                        w,
                        selector_id,
                        target,
                        receiver,
                        &args,
                        &named_args,
                    );
                }
                self.emit_indirect(f, w, selector_id, receiver, &args, &named_args)
            }
            Expr::CallDirect {
                target,
                receiver,
                args,
                named_args,
            } => {
                if f.plan.inline[id.0] == Some(target) {
                    return self.emit_inline(f, w, target, receiver, &args, &named_args);
                }
                let func = self.funcs.get(target)?;
                let sig = self.module.func_sig(func)?.clone();
                let callee = self.program.member(target);
                let mut offset = 0;
                if let Some(receiver) = receiver {
                    let recv = self
                        .emit_expr(f, w, receiver)?
                        .ok_or_else(|| Error::internal("call receiver produced no value"))?;
                    self.adapt(w, recv, sig.params[0])?;
                    offset = 1;
                }
                let params = self.call_param_info(callee, None);
                self.emit_call_args(f, w, &sig, offset, &params, &args, &named_args)?;
                w.call(&self.module.types, func.0, &sig)?;
                Ok(sig.results.first().copied())
            }
            Expr::New {
                class,
                ctor,
                args,
                named_args,
            } => self.emit_new(f, w, class, ctor, &args, &named_args),
            Expr::CallClosure { callee, args } => self.emit_closure_call(f, w, callee, &args),
            Expr::Lambda {
                params,
                return_ty,
                body,
            } => self
                .emit_lambda(f, w, id, &params, &return_ty, &body)
                .map(Some),
            Expr::Is { operand, class } => self.emit_is(f, w, operand, class).map(Some),
            Expr::As { operand, ty } => self.emit_as(f, w, operand, &ty).map(Some),
            Expr::NullCheck(operand) => {
                self.emit_expr(f, w, operand)?;
                w.ref_as_non_null()?;
                let ty = self.value_type(&f.plan.produced[id.0].clone().as_non_nullable())?;
                Ok(Some(ty))
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                let produced = f.plan.produced[id.0].clone();
                self.emit_expr(f, w, cond)?;
                if produced.is_void() {
                    w.if_(&self.module.types, BlockType::Empty)?;
                    if self.emit_expr(f, w, then)?.is_some() {
                        w.drop_()?;
                    }
                    w.else_(&self.module.types)?;
                    if self.emit_expr(f, w, otherwise)?.is_some() {
                        w.drop_()?;
                    }
                    w.end(&self.module.types)?;
                    Ok(None)
                } else {
                    let result = self.value_type(&produced)?;
                    w.if_(&self.module.types, BlockType::Result(result))?;
                    let then_ty = self
                        .emit_expr(f, w, then)?
                        .ok_or_else(|| Error::internal("conditional arm produced no value"))?;
                    self.adapt(w, then_ty, result)?;
                    w.else_(&self.module.types)?;
                    let else_ty = self
                        .emit_expr(f, w, otherwise)?
                        .ok_or_else(|| Error::internal("conditional arm produced no value"))?;
                    self.adapt(w, else_ty, result)?;
                    w.end(&self.module.types)?;
                    Ok(Some(result))
                }
            }
            Expr::Logical { op, lhs, rhs } => {
                self.emit_expr(f, w, lhs)?;
                w.if_(&self.module.types, BlockType::Result(ValType::I32))?;
                match op {
                    crate::ir::LogicalOp::And => {
                        self.emit_expr(f, w, rhs)?;
                        w.else_(&self.module.types)?;
                        w.i32_const(0);
                    }
                    crate::ir::LogicalOp::Or => {
                        w.i32_const(1);
                        w.else_(&self.module.types)?;
                        self.emit_expr(f, w, rhs)?;
                    }
                }
                w.end(&self.module.types)?;
                Ok(Some(ValType::I32))
            }
            Expr::Not(operand) => {
                self.emit_expr(f, w, operand)?;
                w.i32_eqz(&self.module.types)?;
                Ok(Some(ValType::I32))
            }
        }
    }

    // ---- locals, receivers, statics ----

    fn emit_this(&mut self, f: &mut Frame<'_>, w: &mut CodeWriter) -> Result<ValType> {
        if let Some(this_local) = f.this_local {
            w.local_get(this_local)?;
            return w
                .local_type(this_local)
                .ok_or_else(|| Error::internal("receiver local vanished"));
        }
        if let Some((hops, field, _)) = f.captures.resolve_this(f.scope) {
            let struct_type = self.emit_context_path(f, w, hops)?;
            w.struct_get(&self.module.types, struct_type, field)?;
            w.ref_as_non_null()?;
            let owner = f
                .owner
                .ok_or_else(|| Error::internal("captured receiver without an owner"))?;
            return Ok(ValType::non_null_ref(HeapType::Def(
                self.layout.struct_of(owner),
            )));
        }
        Err(Error::internal("`this` used without a receiver in scope"))
    }

    /// Walk `hops` parent links from the frame's context; returns the
    /// struct type the cursor ends on.
    fn emit_context_path(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        hops: u32,
    ) -> Result<TypeIdx> {
        let (ctx_local, mut index) = f
            .context
            .ok_or_else(|| Error::internal("captured access without a context in scope"))?;
        w.local_get(ctx_local)?;
        for _ in 0..hops {
            let ctx = &f.captures.contexts[index];
            let field = ctx
                .parent_field
                .ok_or_else(|| Error::internal("context chain is missing a parent link"))?;
            let parent = ctx
                .parent
                .ok_or_else(|| Error::internal("context chain ends before the target"))?;
            w.struct_get(&self.module.types, ctx.struct_type, field)?;
            index = parent;
        }
        Ok(f.captures.contexts[index].struct_type)
    }

    fn emit_local_get(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        local: LocalId,
    ) -> Result<ValType> {
        let ir_ty = f.body.local(local).ty.clone();
        let want = self.value_type(&ir_ty)?;
        if f.captures.is_captured(local) {
            let (hops, field, _) = f.captures.resolve_local(f.scope, local).ok_or_else(|| {
                Error::internal(format!("captured local {local} has no context slot"))
            })?;
            let struct_type = self.emit_context_path(f, w, hops)?;
            w.struct_get(&self.module.types, struct_type, field)?;
            let loaded = self.module.types.struct_type(struct_type)?.fields[field as usize]
                .storage
                .unpacked();
            self.adapt(w, loaded, want)?;
        } else {
            let index = *f.locals.get(&local).ok_or_else(|| {
                Error::internal(format!("local {local} has no frame slot"))
            })?;
            w.local_get(index)?;
            let held = w
                .local_type(index)
                .ok_or_else(|| Error::internal("frame local vanished"))?;
            self.adapt(w, held, want)?;
        }
        Ok(want)
    }

    /// Evaluate and store, leaving nothing on the stack.
    fn emit_local_store(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        local: LocalId,
        value: ExprId,
    ) -> Result<()> {
        if f.captures.is_captured(local) {
            let (value_ty, tmp) = self.emit_value_to_scratch(f, w, value)?;
            let (hops, field, _) = f.captures.resolve_local(f.scope, local).ok_or_else(|| {
                Error::internal(format!("captured local {local} has no context slot"))
            })?;
            let struct_type = self.emit_context_path(f, w, hops)?;
            w.local_get(tmp)?;
            let storage = self.module.types.struct_type(struct_type)?.fields[field as usize]
                .storage
                .unpacked();
            self.adapt(w, value_ty, storage)?;
            w.struct_set(&self.module.types, struct_type, field)?;
        } else {
            let index = *f.locals.get(&local).ok_or_else(|| {
                Error::internal(format!("local {local} has no frame slot"))
            })?;
            let produced = self
                .emit_expr(f, w, value)?
                .ok_or_else(|| Error::internal("assignment value produced nothing"))?;
            let held = w
                .local_type(index)
                .ok_or_else(|| Error::internal("frame local vanished"))?;
            self.adapt(w, produced, held)?;
            w.local_set(&self.module.types, index)?;
        }
        Ok(())
    }

    fn store_local_from_scratch(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        local: LocalId,
        value_ty: ValType,
        tmp: u32,
    ) -> Result<()> {
        if f.captures.is_captured(local) {
            let (hops, field, _) = f.captures.resolve_local(f.scope, local).ok_or_else(|| {
                Error::internal(format!("captured local {local} has no context slot"))
            })?;
            let struct_type = self.emit_context_path(f, w, hops)?;
            w.local_get(tmp)?;
            let storage = self.module.types.struct_type(struct_type)?.fields[field as usize]
                .storage
                .unpacked();
            self.adapt(w, value_ty, storage)?;
            w.struct_set(&self.module.types, struct_type, field)?;
        } else {
            let index = *f.locals.get(&local).ok_or_else(|| {
                Error::internal(format!("local {local} has no frame slot"))
            })?;
            w.local_get(tmp)?;
            let held = w
                .local_type(index)
                .ok_or_else(|| Error::internal("frame local vanished"))?;
            self.adapt(w, value_ty, held)?;
            w.local_set(&self.module.types, index)?;
        }
        Ok(())
    }

    /// Evaluate an expression into a scratch local; returns its type and
    /// the local.
    fn emit_value_to_scratch(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        value: ExprId,
    ) -> Result<(ValType, u32)> {
        let produced = self
            .emit_expr(f, w, value)?
            .ok_or_else(|| Error::internal("expression produced no value for storage"))?;
        let tmp = self.scratch(f, w, produced);
        w.local_set(&self.module.types, tmp)?;
        Ok((produced, tmp))
    }

    fn emit_static_get(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        static_id: StaticId,
    ) -> Result<ValType> {
        let slot = self.statics.slot(static_id).clone();
        let want = self.value_type(&slot.ty.clone())?;
        match &slot.kind {
            StaticKind::Constant(constant) => {
                let constant = constant.clone();
                let ty = self.emit_constant(f, w, &constant)?.ok_or_else(|| {
                    Error::internal("constant static produced no value")
                })?;
                self.adapt(w, ty, want)?;
            }
            StaticKind::Plain => {
                w.global_get(slot.global.0, slot.storage);
                self.adapt(w, slot.storage, want)?;
            }
            StaticKind::Lazy { accessor, .. } => {
                let sig = self.module.func_sig(*accessor)?.clone();
                w.call(&self.module.types, accessor.0, &sig)?;
            }
        }
        Ok(want)
    }

    fn emit_constant(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        constant: &Constant,
    ) -> Result<Option<ValType>> {
        match constant {
            Constant::Bool(value) => {
                w.i32_const(i32::from(*value));
                Ok(Some(ValType::I32))
            }
            Constant::Int(value) => {
                w.i64_const(*value);
                Ok(Some(ValType::I64))
            }
            Constant::Double(bits) => {
                w.f64_const(Constant::double_value(*bits));
                Ok(Some(ValType::F64))
            }
            Constant::Null => {
                // Bottom reference; subsumes every nullable target.
                w.ref_null(HeapType::None);
                Ok(Some(ValType::nullable_ref(HeapType::None)))
            }
            heap => {
                let ty = self.pool_read(w, heap)?;
                Ok(Some(ValType::Ref(ty)))
            }
        }
    }

    fn pool_read(&mut self, w: &mut CodeWriter, constant: &Constant) -> Result<RefType> {
        let mut cx = PoolCx {
            program: self.program,
            layout: self.layout,
            closures: self.closures,
            module: self.module,
        };
        self.constants.read(&mut cx, w, constant)
    }

    // ---- calls ----

    /// The parameter shape a call site fills missing arguments from: the
    /// selector's merged info for virtual dispatch, the member's own
    /// otherwise.
    fn call_param_info(
        &self,
        callee: &MemberDef,
        selector: Option<SelectorId>,
    ) -> crate::ir::ParameterInfo {
        match selector {
            Some(id) => self.dispatch.selector(id).params.clone(),
            None => crate::ir::ParameterInfo::from_member(callee),
        }
    }

    /// Push positional then named (name-ordered) arguments, filling gaps
    /// from defaults and adapting each to the target signature.
    fn emit_call_args(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        sig: &FuncType,
        offset: usize,
        params: &crate::ir::ParameterInfo,
        args: &[ExprId],
        named_args: &[(String, ExprId)],
    ) -> Result<()> {
        let mut position = offset;
        for (index, default) in params.positional.iter().enumerate() {
            let expected = sig.params[position];
            if let Some(&arg) = args.get(index) {
                let produced = self
                    .emit_expr(f, w, arg)?
                    .ok_or_else(|| Error::internal("argument produced no value"))?;
                self.adapt(w, produced, expected)?;
            } else {
                let default = default.as_ref().ok_or_else(|| {
                    Error::codegen(format!("missing required positional argument {index}"))
                })?;
                self.emit_default(f, w, default, expected)?;
            }
            position += 1;
        }
        for (name, default) in &params.named {
            let expected = sig.params[position];
            if let Some((_, arg)) = named_args.iter().find(|(n, _)| n == name) {
                let produced = self
                    .emit_expr(f, w, *arg)?
                    .ok_or_else(|| Error::internal("argument produced no value"))?;
                self.adapt(w, produced, expected)?;
            } else {
                let default = default.as_ref().ok_or_else(|| {
                    Error::codegen(format!("missing required named argument `{name}`"))
                })?;
                self.emit_default(f, w, default, expected)?;
            }
            position += 1;
        }
        Ok(())
    }

    fn emit_default(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        default: &Constant,
        expected: ValType,
    ) -> Result<()> {
        match default {
            Constant::Null => match expected {
                ValType::Ref(reference) => {
                    w.ref_null(reference.heap);
                    Ok(())
                }
                other => Err(Error::codegen(format!(
                    "null default used where a {other} is expected"
                ))),
            },
            other => {
                let produced = self
                    .emit_constant(f, w, other)?
                    .ok_or_else(|| Error::internal("default produced no value"))?;
                self.adapt(w, produced, expected)
            }
        }
    }

    fn emit_indirect(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        selector_id: SelectorId,
        receiver: ExprId,
        args: &[ExprId],
        named_args: &[(String, ExprId)],
    ) -> Result<Option<ValType>> {
        let (sig, type_index, offset, params) = {
            let selector = self.dispatch.selector(selector_id);
            (
                selector.signature.clone(),
                selector.type_index,
                selector.offset,
                selector.params.clone(),
            )
        };
        let recv = self
            .emit_expr(f, w, receiver)?
            .ok_or_else(|| Error::internal("virtual receiver produced no value"))?;
        self.adapt(w, recv, sig.params[0])?;
        // Fresh local: argument emission below may itself dispatch and must
        // not clobber this receiver.
        let rtmp = w.add_local(sig.params[0]);
        w.local_set(&self.module.types, rtmp)?;

        if self.options.polymorphic_specialization
            && let Some(tree) = self.dispatch.specialization_tree(selector_id)
        {
            self.emit_call_args(f, w, &sig, 1, &params, args, named_args)?;
            return self.emit_specialized(f, w, &sig, rtmp, tree);
        }

        w.local_get(rtmp)?;
        self.emit_call_args(f, w, &sig, 1, &params, args, named_args)?;
        let object_struct = self.layout.struct_of(self.program.core.object);
        w.local_get(rtmp)?;
        w.struct_get(&self.module.types, object_struct, CLASS_ID_FIELD)?;
        let offset = i32::try_from(offset)
            .map_err(|_| Error::codegen("dispatch table offset exceeds the i32 range"))?;
        w.i32_const(offset);
        w.numeric(&self.module.types, Instr::I32Add)?;
        w.call_indirect(&self.module.types, type_index, 0)?;
        Ok(sig.results.first().copied())
    }

    /// Lower one virtual call as a class-id branch tree instead of a table
    /// access. Arguments are parked in locals so every leaf can reload
    /// them.
    fn emit_specialized(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        sig: &FuncType,
        rtmp: u32,
        tree: DispatchTree,
    ) -> Result<Option<ValType>> {
        let mut arg_locals = Vec::new();
        for &param in sig.params[1..].iter().rev() {
            let local = w.add_local(param);
            w.local_set(&self.module.types, local)?;
            arg_locals.push(local);
        }
        arg_locals.reverse();

        let object_struct = self.layout.struct_of(self.program.core.object);
        w.local_get(rtmp)?;
        w.struct_get(&self.module.types, object_struct, CLASS_ID_FIELD)?;
        let idtmp = self.scratch(f, w, ValType::I32);
        w.local_set(&self.module.types, idtmp)?;

        let result_bt = match sig.results.first() {
            Some(&ty) => BlockType::Result(ty),
            None => BlockType::Empty,
        };
        self.emit_tree(w, sig, rtmp, &arg_locals, idtmp, result_bt, &tree)?;
        Ok(sig.results.first().copied())
    }

    fn emit_tree(
        &mut self,
        w: &mut CodeWriter,
        sig: &FuncType,
        rtmp: u32,
        arg_locals: &[u32],
        idtmp: u32,
        result_bt: BlockType,
        tree: &DispatchTree,
    ) -> Result<()> {
        match tree {
            DispatchTree::Call(member) => {
                let func = self.funcs.get(*member)?;
                w.local_get(rtmp)?;
                for &local in arg_locals {
                    w.local_get(local)?;
                }
                w.call(&self.module.types, func.0, sig)?;
                Ok(())
            }
            DispatchTree::IfEq {
                class_id,
                target,
                otherwise,
            } => {
                w.local_get(idtmp)?;
                w.i32_const(*class_id as i32);
                w.numeric(&self.module.types, Instr::I32Eq)?;
                w.if_(&self.module.types, result_bt)?;
                self.emit_tree(w, sig, rtmp, arg_locals, idtmp, result_bt, &DispatchTree::Call(*target))?;
                w.else_(&self.module.types)?;
                self.emit_tree(w, sig, rtmp, arg_locals, idtmp, result_bt, otherwise)?;
                w.end(&self.module.types)
            }
            DispatchTree::Split { pivot, low, high } => {
                w.local_get(idtmp)?;
                w.i32_const(*pivot as i32);
                w.numeric(&self.module.types, Instr::I32LtS)?;
                w.if_(&self.module.types, result_bt)?;
                self.emit_tree(w, sig, rtmp, arg_locals, idtmp, result_bt, low)?;
                w.else_(&self.module.types)?;
                self.emit_tree(w, sig, rtmp, arg_locals, idtmp, result_bt, high)?;
                w.end(&self.module.types)
            }
        }
    }

    fn emit_devirtualized(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        selector_id: SelectorId,
        target: MemberId,
        receiver: ExprId,
        args: &[ExprId],
        named_args: &[(String, ExprId)],
    ) -> Result<Option<ValType>> {
        let (sig, params) = {
            let selector = self.dispatch.selector(selector_id);
            (selector.signature.clone(), selector.params.clone())
        };
        let recv = self
            .emit_expr(f, w, receiver)?
            .ok_or_else(|| Error::internal("virtual receiver produced no value"))?;
        self.adapt(w, recv, sig.params[0])?;
        self.emit_call_args(f, w, &sig, 1, &params, args, named_args)?;
        let func = self.funcs.get(target)?;
        w.call(&self.module.types, func.0, &sig)?;
        Ok(sig.results.first().copied())
    }

    /// Re-run generation for a trivial callee against fresh locals bound to
    /// the caller's arguments, inside a block typed with the result.
    fn emit_inline(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        target: MemberId,
        receiver: Option<ExprId>,
        args: &[ExprId],
        named_args: &[(String, ExprId)],
    ) -> Result<Option<ValType>> {
        let callee = self.program.member(target);
        let body = callee
            .body
            .as_ref()
            .ok_or_else(|| Error::internal("inlined callee has no body"))?;
        let plan = analyze_body(
            self.program,
            self.dispatch,
            self.options,
            target,
            callee.owner,
            body,
            &callee.return_ty,
        )?;
        let captures = CaptureAnalysis::discover(body);

        // Bind the receiver.
        let this_local = match receiver {
            Some(receiver) => {
                let owner = callee
                    .owner
                    .ok_or_else(|| Error::internal("inlined receiver without an owner"))?;
                let own = ValType::non_null_ref(HeapType::Def(self.layout.struct_of(owner)));
                let recv = self
                    .emit_expr(f, w, receiver)?
                    .ok_or_else(|| Error::internal("inlined receiver produced no value"))?;
                self.adapt(w, recv, own)?;
                let local = w.add_local(own);
                w.local_set(&self.module.types, local)?;
                Some(local)
            }
            None => None,
        };

        // Bind positional arguments (the analysis pass excluded callees
        // with named parameters).
        let mut locals = HashMap::new();
        for (index, param) in callee.params.iter().enumerate() {
            let target_ty = self.value_type(&param.ty.clone())?;
            if let Some(&arg) = args.get(index) {
                let produced = self
                    .emit_expr(f, w, arg)?
                    .ok_or_else(|| Error::internal("inlined argument produced no value"))?;
                self.adapt(w, produced, target_ty)?;
            } else {
                let default = param.default.clone().ok_or_else(|| {
                    Error::codegen(format!("missing required positional argument {index}"))
                })?;
                self.emit_default(f, w, &default, target_ty)?;
            }
            let local = w.add_local(target_ty);
            w.local_set(&self.module.types, local)?;
            locals.insert(LocalId(index), local);
        }
        let _ = named_args;

        let has_value = !callee.return_ty.is_void();
        let result_ty = if has_value {
            Some(self.value_type(&callee.return_ty.clone())?)
        } else {
            None
        };
        match result_ty {
            Some(ty) => w.block(BlockType::Result(ty)),
            None => w.block(BlockType::Empty),
        }
        let pos = w.depth();
        let mut sub = Frame::new(
            &plan,
            &captures,
            body,
            0,
            callee.owner,
            ReturnTarget::Branch { pos, has_value },
        );
        sub.this_local = this_local;
        sub.locals = locals;
        for index in body.param_count..body.locals.len() {
            let local = LocalId(index);
            let ty = self.storage_local_type(&body.local(local).ty.clone())?;
            sub.locals.insert(local, w.add_local(ty));
        }
        self.emit_stmts(&mut sub, w, &body.stmts)?;
        if has_value {
            w.unreachable()?;
        }
        w.end(&self.module.types)?;
        Ok(result_ty)
    }

    fn emit_new(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        class: ClassId,
        ctor: MemberId,
        args: &[ExprId],
        named_args: &[(String, ExprId)],
    ) -> Result<Option<ValType>> {
        let struct_type = self.layout.struct_of(class);
        // Allocation zero-fills every field, the class-id slot included, so
        // nothing observes a partially-tagged object before the write below.
        w.struct_new_default(&self.module.types, struct_type)?;
        let obj = w.add_local(ValType::non_null_ref(HeapType::Def(struct_type)));
        w.local_tee(&self.module.types, obj)?;
        w.i32_const(self.layout.runtime_id(class) as i32);
        w.struct_set(&self.module.types, struct_type, CLASS_ID_FIELD)?;

        let func = self.funcs.get(ctor)?;
        let sig = self.module.func_sig(func)?.clone();
        let callee = self.program.member(ctor);
        w.local_get(obj)?;
        self.adapt(
            w,
            ValType::non_null_ref(HeapType::Def(struct_type)),
            sig.params[0],
        )?;
        let params = self.call_param_info(callee, None);
        self.emit_call_args(f, w, &sig, 1, &params, args, named_args)?;
        w.call(&self.module.types, func.0, &sig)?;
        w.local_get(obj)?;
        Ok(Some(ValType::non_null_ref(HeapType::Def(struct_type))))
    }

    fn emit_closure_call(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        callee: ExprId,
        args: &[ExprId],
    ) -> Result<Option<ValType>> {
        let produced = self
            .emit_expr(f, w, callee)?
            .ok_or_else(|| Error::internal("closure callee produced no value"))?;
        let ValType::Ref(reference) = produced else {
            return Err(Error::internal("closure callee is not a reference"));
        };
        let HeapType::Def(closure_struct) = reference.heap else {
            return Err(Error::internal("closure callee has no struct type"));
        };
        let ctmp = w.add_local(produced);
        w.local_tee(&self.module.types, ctmp)?;
        w.struct_get(&self.module.types, closure_struct, CLOSURE_CONTEXT_FIELD)?;
        let func_field = self
            .module
            .types
            .struct_type(closure_struct)?
            .fields[CLOSURE_FUNC_FIELD as usize]
            .storage
            .unpacked();
        let ValType::Ref(fn_ref) = func_field else {
            return Err(Error::internal("closure struct carries no function"));
        };
        let HeapType::Def(fn_type) = fn_ref.heap else {
            return Err(Error::internal("closure function field is untyped"));
        };
        let sig = self.module.types.func_type(fn_type)?.clone();
        for (index, &arg) in args.iter().enumerate() {
            let produced = self
                .emit_expr(f, w, arg)?
                .ok_or_else(|| Error::internal("closure argument produced no value"))?;
            self.adapt(w, produced, sig.params[index + 1])?;
        }
        w.local_get(ctmp)?;
        w.struct_get(&self.module.types, closure_struct, CLOSURE_FUNC_FIELD)?;
        w.call_ref(&self.module.types, fn_type)?;
        Ok(sig.results.first().copied())
    }

    /// Compile a lambda into its own function and build the closure pair.
    fn emit_lambda(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        id: ExprId,
        params: &[LocalId],
        return_ty: &IrType,
        body_stmts: &[Stmt],
    ) -> Result<ValType> {
        let scope = *f
            .captures
            .lambda_scopes
            .get(&id)
            .ok_or_else(|| Error::internal("lambda expression has no scope"))?;
        let param_tys: Vec<IrType> = params
            .iter()
            .map(|&p| f.body.local(p).ty.clone())
            .collect();
        let shape = self.closures.shape(
            self.layout,
            self.program,
            &mut self.module.types,
            &param_tys,
            return_ty,
        )?;
        let fn_sig = self.module.types.func_type(shape.func_type)?.clone();
        self.lambda_count += 1;
        let func = self
            .module
            .declare_function_with_type(format!("lambda#{}", self.lambda_count), shape.func_type)?;

        let mut lw = CodeWriter::new(&fn_sig.params, fn_sig.results.clone());
        let mut lf = Frame::new(
            f.plan,
            f.captures,
            f.body,
            scope,
            f.owner,
            ReturnTarget::Function,
        );

        // Context plumbing: either allocate this scope's context (chaining
        // the incoming one as parent) or just narrow the incoming one.
        if let Some(own_index) = f.captures.own_context(scope) {
            let (struct_type, parent_field) = {
                let ctx = &f.captures.contexts[own_index];
                (ctx.struct_type, ctx.parent_field)
            };
            lw.struct_new_default(&self.module.types, struct_type)?;
            let ctx_local = lw.add_local(ValType::non_null_ref(HeapType::Def(struct_type)));
            lw.local_set(&self.module.types, ctx_local)?;
            if let Some(field) = parent_field {
                let parent_index = f.captures.contexts[own_index]
                    .parent
                    .ok_or_else(|| Error::internal("context parent field without a parent"))?;
                let parent_struct = f.captures.contexts[parent_index].struct_type;
                lw.local_get(ctx_local)?;
                lw.local_get(0)?;
                lw.ref_cast(RefType::nullable(HeapType::Def(parent_struct)))?;
                lw.struct_set(&self.module.types, struct_type, field)?;
            }
            for (position, param) in params.iter().enumerate() {
                if let Some(&slot) = f.captures.contexts[own_index].slots.get(param) {
                    lw.local_get(ctx_local)?;
                    lw.local_get((1 + position) as u32)?;
                    lw.struct_set(&self.module.types, struct_type, slot)?;
                }
            }
            lf.context = Some((ctx_local, own_index));
        } else if let Some(enclosing) = f.captures.enclosing_context(scope) {
            let ctx_struct = f.captures.contexts[enclosing].struct_type;
            let held = ValType::nullable_ref(HeapType::Def(ctx_struct));
            let ctx_local = lw.add_local(held);
            lw.local_get(0)?;
            lw.ref_cast(RefType::nullable(HeapType::Def(ctx_struct)))?;
            lw.local_set(&self.module.types, ctx_local)?;
            lf.context = Some((ctx_local, enclosing));
        }

        for (position, param) in params.iter().enumerate() {
            if !f.captures.is_captured(*param) {
                lf.locals.insert(*param, (1 + position) as u32);
            }
        }
        // Locals declared inside the lambda body.
        for index in f.body.param_count..f.body.locals.len() {
            let local = LocalId(index);
            if f.captures.is_captured(local)
                || lf.locals.contains_key(&local)
                || params.contains(&local)
            {
                continue;
            }
            let ty = self.storage_local_type(&f.body.local(local).ty.clone())?;
            lf.locals.insert(local, lw.add_local(ty));
        }

        self.emit_stmts(&mut lf, &mut lw, body_stmts)?;
        if !fn_sig.results.is_empty() {
            lw.unreachable()?;
        }
        self.finish_into(lw, func, &format!("lambda#{}", self.lambda_count))?;

        // The closure value in the enclosing function.
        match f.context {
            Some((ctx_local, _)) => w.local_get(ctx_local)?,
            None => w.ref_null(HeapType::Struct),
        }
        self.module.declare_func_ref(func);
        w.ref_func(func.0, shape.func_type);
        w.struct_new(&self.module.types, shape.closure_struct)?;
        Ok(ValType::non_null_ref(HeapType::Def(shape.closure_struct)))
    }

    // ---- intrinsics ----

    fn emit_intrinsic(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        intrinsic: Intrinsic,
        receiver: ExprId,
        args: &[ExprId],
    ) -> Result<Option<ValType>> {
        use Intrinsic::*;
        // Integer negation needs its zero under the operand.
        if intrinsic == IntNeg {
            w.i64_const(0);
            self.emit_expr(f, w, receiver)?;
            w.numeric(&self.module.types, Instr::I64Sub)?;
            return Ok(Some(ValType::I64));
        }

        let receiver_ty = self
            .emit_expr(f, w, receiver)?
            .ok_or_else(|| Error::internal("intrinsic receiver produced no value"))?;

        let simple = |instr: Instr, result: ValType| (instr, result);
        let binary = match intrinsic {
            IntAdd => Some(simple(Instr::I64Add, ValType::I64)),
            IntSub => Some(simple(Instr::I64Sub, ValType::I64)),
            IntMul => Some(simple(Instr::I64Mul, ValType::I64)),
            IntDiv => Some(simple(Instr::I64DivS, ValType::I64)),
            IntMod => Some(simple(Instr::I64RemS, ValType::I64)),
            IntEq => Some(simple(Instr::I64Eq, ValType::I32)),
            IntNe => Some(simple(Instr::I64Ne, ValType::I32)),
            IntLt => Some(simple(Instr::I64LtS, ValType::I32)),
            IntLe => Some(simple(Instr::I64LeS, ValType::I32)),
            IntGt => Some(simple(Instr::I64GtS, ValType::I32)),
            IntGe => Some(simple(Instr::I64GeS, ValType::I32)),
            DoubleAdd => Some(simple(Instr::F64Add, ValType::F64)),
            DoubleSub => Some(simple(Instr::F64Sub, ValType::F64)),
            DoubleMul => Some(simple(Instr::F64Mul, ValType::F64)),
            DoubleDiv => Some(simple(Instr::F64Div, ValType::F64)),
            DoubleEq => Some(simple(Instr::F64Eq, ValType::I32)),
            DoubleNe => Some(simple(Instr::F64Ne, ValType::I32)),
            DoubleLt => Some(simple(Instr::F64Lt, ValType::I32)),
            DoubleLe => Some(simple(Instr::F64Le, ValType::I32)),
            DoubleGt => Some(simple(Instr::F64Gt, ValType::I32)),
            DoubleGe => Some(simple(Instr::F64Ge, ValType::I32)),
            BoolEq => Some(simple(Instr::I32Eq, ValType::I32)),
            _ => None,
        };
        if let Some((instr, result)) = binary {
            self.emit_expr(f, w, args[0])?;
            w.numeric(&self.module.types, instr)?;
            return Ok(Some(result));
        }

        match intrinsic {
            DoubleNeg => {
                w.numeric(&self.module.types, Instr::F64Neg)?;
                Ok(Some(ValType::F64))
            }
            DoubleSqrt => {
                w.numeric(&self.module.types, Instr::F64Sqrt)?;
                Ok(Some(ValType::F64))
            }
            IntToDouble => {
                w.numeric(&self.module.types, Instr::F64ConvertI64S)?;
                Ok(Some(ValType::F64))
            }
            DoubleToInt => {
                w.numeric(&self.module.types, Instr::I64TruncSatF64S)?;
                Ok(Some(ValType::I64))
            }
            ArrayLength | BytesLength => {
                w.array_len(&self.module.types)?;
                w.numeric(&self.module.types, Instr::I64ExtendI32S)?;
                Ok(Some(ValType::I64))
            }
            ArrayGet => {
                let array = ref_def_of(receiver_ty)?;
                self.emit_expr(f, w, args[0])?;
                w.numeric(&self.module.types, Instr::I32WrapI64)?;
                w.array_get(&self.module.types, array)?;
                let elem = self.module.types.array_type(array)?.elem.storage.unpacked();
                Ok(Some(elem))
            }
            BytesGet => {
                let array = ref_def_of(receiver_ty)?;
                self.emit_expr(f, w, args[0])?;
                w.numeric(&self.module.types, Instr::I32WrapI64)?;
                w.array_get_u(&self.module.types, array)?;
                w.numeric(&self.module.types, Instr::I64ExtendI32U)?;
                Ok(Some(ValType::I64))
            }
            ArraySet => {
                let array = ref_def_of(receiver_ty)?;
                self.emit_expr(f, w, args[0])?;
                w.numeric(&self.module.types, Instr::I32WrapI64)?;
                let (value_ty, tmp) = self.emit_value_to_scratch(f, w, args[1])?;
                w.local_get(tmp)?;
                let storage = self.module.types.array_type(array)?.elem.storage.unpacked();
                self.adapt(w, value_ty, storage)?;
                w.array_set(&self.module.types, array)?;
                w.local_get(tmp)?;
                Ok(Some(value_ty))
            }
            other => Err(Error::internal(format!(
                "intrinsic {other:?} fell through its emission table"
            ))),
        }
    }

    // ---- type tests and casts ----

    fn emit_is(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        operand: ExprId,
        class: ClassId,
    ) -> Result<ValType> {
        let produced = self
            .emit_expr(f, w, operand)?
            .ok_or_else(|| Error::internal("`is` operand produced no value"))?;
        let object_struct = self.layout.struct_of(self.program.core.object);
        self.adapt(
            w,
            produced,
            ValType::nullable_ref(HeapType::Def(object_struct)),
        )?;
        let otmp = self.scratch(
            f,
            w,
            ValType::nullable_ref(HeapType::Def(object_struct)),
        );
        w.local_tee(&self.module.types, otmp)?;
        w.ref_is_null()?;
        w.if_(&self.module.types, BlockType::Result(ValType::I32))?;
        w.i32_const(0);
        w.else_(&self.module.types)?;
        w.local_get(otmp)?;
        w.struct_get(&self.module.types, object_struct, CLASS_ID_FIELD)?;
        let idtmp = self.scratch(f, w, ValType::I32);
        w.local_set(&self.module.types, idtmp)?;
        let ranges = self.layout.id_ranges(class);
        for (index, (lo, hi)) in ranges.iter().enumerate() {
            w.local_get(idtmp)?;
            w.i32_const(*lo as i32);
            w.numeric(&self.module.types, Instr::I32GeS)?;
            w.local_get(idtmp)?;
            w.i32_const(*hi as i32);
            w.numeric(&self.module.types, Instr::I32LeS)?;
            w.numeric(&self.module.types, Instr::I32And)?;
            if index > 0 {
                w.numeric(&self.module.types, Instr::I32Or)?;
            }
        }
        if ranges.is_empty() {
            w.i32_const(0);
        }
        w.end(&self.module.types)?;
        Ok(ValType::I32)
    }

    fn emit_as(
        &mut self,
        f: &mut Frame<'_>,
        w: &mut CodeWriter,
        operand: ExprId,
        ty: &IrType,
    ) -> Result<ValType> {
        self.emit_expr(f, w, operand)?;
        if ty.is_primitive() {
            let class = match ty {
                IrType::Bool => self.program.core.boxed_bool,
                IrType::Double => self.program.core.boxed_double,
                _ => self.program.core.boxed_int,
            };
            return self.emit_unbox(w, class);
        }
        let target = self.value_type(&ty.clone())?;
        match target {
            ValType::Ref(reference) => {
                w.ref_cast(reference)?;
                Ok(target)
            }
            other => Err(Error::codegen(format!(
                "checked cast to `{ty}` has no reference lowering ({other})"
            ))),
        }
    }

    // ---- static accessors ----

    /// Compile the lazy-initialization accessor for one static field.
    pub fn emit_static_accessor(&mut self, static_id: StaticId) -> Result<()> {
        let slot = self.statics.slot(static_id).clone();
        let StaticKind::Lazy { accessor, flag } = slot.kind else {
            return Ok(());
        };
        let field = self.program.static_field(static_id);
        let body = field
            .initializer
            .as_ref()
            .ok_or_else(|| Error::internal("lazy static without an initializer body"))?;
        let plan = analyze_body(
            self.program,
            self.dispatch,
            self.options,
            self.program.entry,
            None,
            body,
            &field.ty,
        )?;
        let mut captures = CaptureAnalysis::discover(body);
        captures.build_contexts(
            body,
            self.layout,
            self.program,
            &mut self.module.types,
            self.closures,
            None,
        )?;
        let sig = self.module.func_sig(accessor)?.clone();
        let value_ty = sig.results[0];
        let mut w = CodeWriter::new(&[], sig.results.clone());

        match flag {
            None => {
                // Null is the initialized flag.
                w.block(BlockType::Result(value_ty));
                w.global_get(slot.global.0, slot.storage);
                w.br_on_non_null(&self.module.types, 0)?;
                self.emit_initializer_block(&mut w, &plan, &captures, body, value_ty)?;
                let tmp = w.add_local(value_ty);
                w.local_tee(&self.module.types, tmp)?;
                w.global_set(&self.module.types, slot.global.0, slot.storage)?;
                w.local_get(tmp)?;
                w.end(&self.module.types)?;
            }
            Some(flag) => {
                w.global_get(flag.0, ValType::I32);
                w.i32_eqz(&self.module.types)?;
                w.if_(&self.module.types, BlockType::Empty)?;
                self.emit_initializer_block(&mut w, &plan, &captures, body, value_ty)?;
                w.global_set(&self.module.types, slot.global.0, slot.storage)?;
                w.i32_const(1);
                w.global_set(&self.module.types, flag.0, ValType::I32)?;
                w.end(&self.module.types)?;
                w.global_get(slot.global.0, slot.storage);
            }
        }
        self.finish_into(w, accessor, &format!("static:{}", field.name))
    }

    /// The initializer body inside a result-typed block, with `return`
    /// redirected to the block exit.
    fn emit_initializer_block(
        &mut self,
        w: &mut CodeWriter,
        plan: &BodyPlan,
        captures: &CaptureAnalysis,
        body: &Body,
        value_ty: ValType,
    ) -> Result<()> {
        w.block(BlockType::Result(value_ty));
        let pos = w.depth();
        let mut frame = Frame::new(
            plan,
            captures,
            body,
            0,
            None,
            ReturnTarget::Branch {
                pos,
                has_value: true,
            },
        );
        if let Some(ctx_index) = captures.own_context(0) {
            self.open_context(&mut frame, w, ctx_index, &[], 0)?;
        }
        for index in body.param_count..body.locals.len() {
            let local = LocalId(index);
            if captures.is_captured(local) {
                continue;
            }
            let ty = self.storage_local_type(&body.local(local).ty.clone())?;
            frame.locals.insert(local, w.add_local(ty));
        }
        self.emit_stmts(&mut frame, w, &body.stmts)?;
        w.unreachable()?;
        w.end(&self.module.types)
    }
}

/// Positional parameters in declaration order, then named parameters in
/// name order; this is the one slot order signatures and call sites share.
fn param_order(member: &MemberDef) -> Vec<LocalId> {
    let mut order: Vec<LocalId> = (0..member.params.len()).map(LocalId).collect();
    let mut named: Vec<(usize, &ParamDef)> = member.named_params.iter().enumerate().collect();
    named.sort_by(|a, b| a.1.name.cmp(&b.1.name));
    order.extend(
        named
            .into_iter()
            .map(|(index, _)| LocalId(member.params.len() + index)),
    );
    order
}

fn initializer_value(body: &Body) -> Option<ExprId> {
    match body.stmts.as_slice() {
        [Stmt::Return(Some(value))] => Some(*value),
        _ => None,
    }
}

fn ref_def_of(ty: ValType) -> Result<TypeIdx> {
    match ty {
        ValType::Ref(RefType {
            heap: HeapType::Def(idx),
            ..
        }) => Ok(idx),
        other => Err(Error::internal(format!(
            "expected a defined reference type, found {other}"
        ))),
    }
}
