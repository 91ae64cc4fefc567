//! Static analysis pass over one member body.
//!
//! Walks the body once, propagating the type the consumer expects top-down
//! while computing the type each expression produces bottom-up. Where the
//! two differ, a conversion from the total table below is recorded against
//! the node; the emission pass applies it after producing the value. The
//! pass also resolves intrinsic calls, devirtualizes single-target virtual
//! calls, selects trivial callees for inlining, and decides whether
//! assignment results stay on the operand stack.
//!
//! Nothing is emitted here; every decision lands in an `ExprId`-indexed
//! side table inside [`BodyPlan`].

use crate::dispatch::DispatchTables;
use crate::error::{Error, Result};
use crate::intrinsics::{self, Intrinsic};
use crate::ir::{
    Body, ClassId, Expr, ExprId, IrType, MemberDef, MemberId, MemberKind, Program, Stmt,
};
use crate::options::BackendOptions;

/// Callees at or below this body size are eligible for inlining.
pub const INLINE_NODE_LIMIT: usize = 16;

/// A recorded value conversion, applied after the node produces its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    /// Wrap a primitive in its box class.
    Box(ClassId),
    /// Narrow to the box class and read the payload back out.
    Unbox(ClassId),
    /// Assert a nullable reference is non-null.
    NullAssert,
    /// Checked narrowing to the expected reference type.
    Downcast(IrType),
}

/// The analysis pass's output for one body.
#[derive(Debug, Default)]
pub struct BodyPlan {
    pub conversions: Vec<Option<Conversion>>,
    pub intrinsics: Vec<Option<Intrinsic>>,
    /// Virtual calls proven to reach exactly one implementation.
    pub devirt: Vec<Option<MemberId>>,
    /// Calls chosen for inline expansion.
    pub inline: Vec<Option<MemberId>>,
    /// Assignment nodes whose value the consumer discards.
    pub drop_value: Vec<bool>,
    /// The pre-conversion type each node produces.
    pub produced: Vec<IrType>,
    /// The receiver is re-narrowed into a dedicated local in the prologue.
    pub specialize_this: bool,
}

impl BodyPlan {
    fn sized(body: &Body) -> Self {
        let n = body.exprs.len();
        Self {
            conversions: vec![None; n],
            intrinsics: vec![None; n],
            devirt: vec![None; n],
            inline: vec![None; n],
            drop_value: vec![false; n],
            produced: vec![IrType::Void; n],
            specialize_this: false,
        }
    }
}

/// Analyze one member body (or a detached body such as a static
/// initializer, passed with its observing member context).
pub fn analyze_body(
    program: &Program,
    dispatch: &DispatchTables,
    options: &BackendOptions,
    member: MemberId,
    owner: Option<ClassId>,
    body: &Body,
    return_ty: &IrType,
) -> Result<BodyPlan> {
    let mut analyzer = Analyzer {
        program,
        dispatch,
        options,
        member,
        owner,
        body,
        return_ty: return_ty.clone(),
        plan: BodyPlan::sized(body),
    };
    analyzer.stmts(&body.stmts)?;
    Ok(analyzer.plan)
}

struct Analyzer<'a> {
    program: &'a Program,
    dispatch: &'a DispatchTables,
    options: &'a BackendOptions,
    member: MemberId,
    owner: Option<ClassId>,
    body: &'a Body,
    return_ty: IrType,
    plan: BodyPlan,
}

impl<'a> Analyzer<'a> {
    fn stmts(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(expr) => {
                    self.expr(*expr, &IrType::Void)?;
                }
                Stmt::Let { local, value } => {
                    if let Some(value) = value {
                        let ty = self.body.local(*local).ty.clone();
                        self.expr(*value, &ty)?;
                    }
                }
                Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    self.expr(*cond, &IrType::Bool)?;
                    self.stmts(then_branch)?;
                    self.stmts(else_branch)?;
                }
                Stmt::While { cond, body } => {
                    self.expr(*cond, &IrType::Bool)?;
                    self.stmts(body)?;
                }
                Stmt::Return(value) => match (value, self.return_ty.is_void()) {
                    (Some(value), false) => {
                        let ty = self.return_ty.clone();
                        self.expr(*value, &ty)?;
                    }
                    (Some(value), true) => {
                        self.expr(*value, &IrType::Void)?;
                    }
                    (None, false) => {
                        return Err(Error::codegen(
                            "bare `return` in a body with a non-void return type",
                        ));
                    }
                    (None, true) => {}
                },
                Stmt::Break | Stmt::Continue => {}
                Stmt::Block(inner) => self.stmts(inner)?,
            }
        }
        Ok(())
    }

    /// Analyze one expression against the type its consumer expects and
    /// record the conversion bridging any difference.
    fn expr(&mut self, id: ExprId, expected: &IrType) -> Result<IrType> {
        let produced = self.produce(id, expected)?;
        self.plan.produced[id.0] = produced.clone();
        if expected.is_void() {
            self.plan.drop_value[id.0] = true;
            return Ok(produced);
        }
        let conversion = self.conversion_for(&produced, expected)?;
        self.plan.conversions[id.0] = conversion;
        Ok(produced)
    }

    /// The total conversion table. `None` means the produced value already
    /// satisfies the consumer.
    fn conversion_for(
        &self,
        produced: &IrType,
        expected: &IrType,
    ) -> Result<Option<Conversion>> {
        if produced == expected || expected.is_void() {
            return Ok(None);
        }
        if produced.is_void() {
            return Err(Error::codegen(format!(
                "a void expression is used where `{expected}` is expected"
            )));
        }
        match (produced, expected) {
            // Primitive into a reference context: box it.
            (IrType::Bool | IrType::Int | IrType::Double, IrType::Class { class, .. }) => {
                let boxed = self.box_class(produced);
                if !self.is_class_subtype(boxed, *class) {
                    return Err(Error::codegen(format!(
                        "`{produced}` cannot convert to `{expected}`"
                    )));
                }
                Ok(Some(Conversion::Box(boxed)))
            }
            // Reference into a primitive context: unbox through the box
            // class.
            (IrType::Class { .. }, IrType::Bool | IrType::Int | IrType::Double) => {
                Ok(Some(Conversion::Unbox(self.box_class(expected))))
            }
            (
                IrType::Class {
                    class: from,
                    nullable: from_null,
                },
                IrType::Class {
                    class: to,
                    nullable: to_null,
                },
            ) => {
                if self.is_class_subtype(*from, *to) {
                    // Upcast; only nullability may still differ.
                    if *from_null && !*to_null {
                        Ok(Some(Conversion::NullAssert))
                    } else {
                        Ok(None)
                    }
                } else if self.is_class_subtype(*to, *from) {
                    Ok(Some(Conversion::Downcast(expected.clone())))
                } else {
                    Err(Error::codegen(format!(
                        "`{produced}` and `{expected}` are unrelated reference types"
                    )))
                }
            }
            // Same shape, nullability narrows.
            (a, b) if a.as_non_nullable() == b.as_non_nullable() => {
                if a.is_nullable() && !b.is_nullable() {
                    Ok(Some(Conversion::NullAssert))
                } else {
                    Ok(None)
                }
            }
            _ => Err(Error::codegen(format!(
                "no conversion lowers `{produced}` to `{expected}`"
            ))),
        }
    }

    fn box_class(&self, primitive: &IrType) -> ClassId {
        match primitive {
            IrType::Bool => self.program.core.boxed_bool,
            IrType::Double => self.program.core.boxed_double,
            _ => self.program.core.boxed_int,
        }
    }

    /// Nominal IR subtyping: the superclass chain plus (transitive)
    /// implemented interfaces.
    fn is_class_subtype(&self, sub: ClassId, sup: ClassId) -> bool {
        if sup == self.program.core.object {
            return true;
        }
        for link in self.program.superclass_chain(sub) {
            if link == sup || self.program.class(link).interfaces.contains(&sup) {
                return true;
            }
        }
        false
    }

    /// Compute the produced type while recursing into children with their
    /// expected types.
    fn produce(&mut self, id: ExprId, expected: &IrType) -> Result<IrType> {
        match self.body.expr(id).clone() {
            Expr::IntLit(_) => Ok(IrType::Int),
            Expr::DoubleLit(_) => Ok(IrType::Double),
            Expr::BoolLit(_) => Ok(IrType::Bool),
            Expr::StringLit(_) => Ok(IrType::class(self.program.core.string)),
            Expr::Null => {
                if expected.is_primitive() || expected.is_void() {
                    return Err(Error::codegen(format!(
                        "`null` literal used where `{expected}` is expected"
                    )));
                }
                Ok(expected.as_nullable())
            }
            Expr::Const(constant) => Ok(constant.ty(&self.program.core)),
            Expr::This => {
                let owner = self.owner.ok_or_else(|| {
                    Error::codegen("`this` used in a body without a receiver")
                })?;
                self.plan.specialize_this = true;
                Ok(IrType::class(owner))
            }
            Expr::LocalGet(local) => Ok(self.body.local(local).ty.clone()),
            Expr::LocalSet(local, value) => {
                let ty = self.body.local(local).ty.clone();
                self.expr(value, &ty)?;
                Ok(ty)
            }
            Expr::StaticGet(id) => Ok(self.program.static_field(id).ty.clone()),
            Expr::StaticSet(id, value) => {
                let ty = self.program.static_field(id).ty.clone();
                self.expr(value, &ty)?;
                Ok(ty)
            }
            Expr::FieldGet { receiver, field } => {
                self.expr(receiver, &IrType::class(field.class))?;
                Ok(self.field_ty(field))
            }
            Expr::FieldSet {
                receiver,
                field,
                value,
            } => {
                self.expr(receiver, &IrType::class(field.class))?;
                let ty = self.field_ty(field);
                self.expr(value, &ty)?;
                Ok(ty)
            }
            Expr::CallVirtual {
                receiver,
                interface_target,
                args,
                named_args,
            } => {
                let target = self.program.member(interface_target);
                // Intrinsics beat dispatch when the receiver is statically
                // primitive.
                let receiver_ty = self.static_type(receiver)?;
                if let Some(intrinsic) =
                    intrinsics::resolve(&receiver_ty, &target.name, args.len())
                {
                    self.plan.intrinsics[id.0] = Some(intrinsic);
                    self.expr(receiver, &receiver_ty)?;
                    self.analyze_intrinsic_args(intrinsic, &receiver_ty, &args)?;
                    return Ok(self.intrinsic_result(intrinsic, &receiver_ty));
                }
                let owner = target.owner.ok_or_else(|| {
                    Error::codegen(format!(
                        "virtual call target `{}` has no owning class",
                        target.name
                    ))
                })?;
                self.expr(receiver, &IrType::class(owner))?;
                self.analyze_call_args(target, &args, &named_args)?;
                if self.options.devirtualize
                    && let Some(selector_id) = self.dispatch.selector_of(interface_target)
                    && let Some(single) = self.dispatch.selector(selector_id).single_target()
                {
                    self.plan.devirt[id.0] = Some(single);
                    self.consider_inline(id, single);
                }
                Ok(target.return_ty.clone())
            }
            Expr::CallDirect {
                target,
                receiver,
                args,
                named_args,
            } => {
                let callee = self.program.member(target);
                if let Some(receiver) = receiver {
                    let owner = callee.owner.ok_or_else(|| {
                        Error::codegen(format!(
                            "direct call to `{}` passes a receiver but the member has no \
                             owning class",
                            callee.name
                        ))
                    })?;
                    self.expr(receiver, &IrType::class(owner))?;
                }
                self.analyze_call_args(callee, &args, &named_args)?;
                self.consider_inline(id, target);
                Ok(callee.return_ty.clone())
            }
            Expr::New { class, ctor, args, named_args } => {
                let callee = self.program.member(ctor);
                if callee.kind != MemberKind::Constructor {
                    return Err(Error::codegen(format!(
                        "`{}` is not a constructor",
                        callee.name
                    )));
                }
                self.analyze_call_args(callee, &args, &named_args)?;
                Ok(IrType::class(class))
            }
            Expr::CallClosure { callee, args } => {
                let callee_ty = self.static_type(callee)?;
                let IrType::Func { params, ret, .. } = callee_ty.clone() else {
                    return Err(Error::codegen(format!(
                        "closure call on a non-function value of type `{callee_ty}`"
                    )));
                };
                if params.len() != args.len() {
                    return Err(Error::codegen(format!(
                        "closure call passes {} arguments, signature takes {}",
                        args.len(),
                        params.len()
                    )));
                }
                self.expr(callee, &callee_ty.as_non_nullable())?;
                for (arg, param) in args.iter().zip(params.iter()) {
                    self.expr(*arg, param)?;
                }
                Ok(*ret)
            }
            Expr::Lambda {
                params,
                return_ty,
                body,
            } => {
                let param_tys: Vec<IrType> = params
                    .iter()
                    .map(|&p| self.body.local(p).ty.clone())
                    .collect();
                let outer_return = std::mem::replace(&mut self.return_ty, return_ty.clone());
                self.stmts(&body)?;
                self.return_ty = outer_return;
                Ok(IrType::Func {
                    params: param_tys,
                    ret: Box::new(return_ty),
                    nullable: false,
                })
            }
            Expr::Is { operand, .. } => {
                self.expr(operand, &IrType::nullable_class(self.program.core.object))?;
                Ok(IrType::Bool)
            }
            Expr::As { operand, ty } => {
                self.expr(operand, &IrType::nullable_class(self.program.core.object))?;
                Ok(ty)
            }
            Expr::NullCheck(operand) => {
                let ty = self.static_type(operand)?;
                self.expr(operand, &ty)?;
                Ok(ty.as_non_nullable())
            }
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond, &IrType::Bool)?;
                self.expr(then, expected)?;
                self.expr(otherwise, expected)?;
                Ok(expected.clone())
            }
            Expr::Logical { lhs, rhs, .. } => {
                self.expr(lhs, &IrType::Bool)?;
                self.expr(rhs, &IrType::Bool)?;
                Ok(IrType::Bool)
            }
            Expr::Not(operand) => {
                self.expr(operand, &IrType::Bool)?;
                Ok(IrType::Bool)
            }
        }
    }

    fn field_ty(&self, field: crate::ir::FieldRef) -> IrType {
        self.program.class(field.class).fields[field.index].ty.clone()
    }

    fn analyze_call_args(
        &mut self,
        callee: &MemberDef,
        args: &[ExprId],
        named_args: &[(String, ExprId)],
    ) -> Result<()> {
        if args.len() > callee.params.len() {
            return Err(Error::codegen(format!(
                "call to `{}` passes {} positional arguments, {} declared",
                callee.name,
                args.len(),
                callee.params.len()
            )));
        }
        for (arg, param) in args.iter().zip(callee.params.iter()) {
            self.expr(*arg, &param.ty.clone())?;
        }
        for (index, param) in callee.params.iter().enumerate().skip(args.len()) {
            if param.default.is_none() {
                return Err(Error::codegen(format!(
                    "call to `{}` omits required positional parameter {index}",
                    callee.name
                )));
            }
        }
        for (name, arg) in named_args {
            let param = callee
                .named_params
                .iter()
                .find(|p| &p.name == name)
                .ok_or_else(|| {
                    Error::codegen(format!(
                        "call to `{}` passes unknown named argument `{name}`",
                        callee.name
                    ))
                })?;
            self.expr(*arg, &param.ty.clone())?;
        }
        for param in &callee.named_params {
            if param.default.is_none()
                && !named_args.iter().any(|(name, _)| name == &param.name)
            {
                return Err(Error::codegen(format!(
                    "call to `{}` omits required named parameter `{}`",
                    callee.name, param.name
                )));
            }
        }
        Ok(())
    }

    fn analyze_intrinsic_args(
        &mut self,
        intrinsic: Intrinsic,
        receiver_ty: &IrType,
        args: &[ExprId],
    ) -> Result<()> {
        use Intrinsic::*;
        match intrinsic {
            ArrayGet | BytesGet => self.expr(args[0], &IrType::Int).map(drop),
            ArraySet => {
                self.expr(args[0], &IrType::Int)?;
                let IrType::Array { elem, .. } = receiver_ty else {
                    return Err(Error::internal("array intrinsic on a non-array receiver"));
                };
                self.expr(args[1], &elem.clone())?;
                Ok(())
            }
            ArrayLength | BytesLength | IntNeg | IntToDouble | DoubleNeg | DoubleSqrt
            | DoubleToInt => Ok(()),
            IntAdd | IntSub | IntMul | IntDiv | IntMod | IntEq | IntNe | IntLt | IntLe
            | IntGt | IntGe => self.expr(args[0], &IrType::Int).map(drop),
            DoubleAdd | DoubleSub | DoubleMul | DoubleDiv | DoubleEq | DoubleNe | DoubleLt
            | DoubleLe | DoubleGt | DoubleGe => self.expr(args[0], &IrType::Double).map(drop),
            BoolEq => self.expr(args[0], &IrType::Bool).map(drop),
        }
    }

    fn intrinsic_result(&self, intrinsic: Intrinsic, receiver_ty: &IrType) -> IrType {
        use Intrinsic::*;
        match intrinsic {
            IntAdd | IntSub | IntMul | IntDiv | IntMod | IntNeg | DoubleToInt | ArrayLength
            | BytesLength | BytesGet => IrType::Int,
            DoubleAdd | DoubleSub | DoubleMul | DoubleDiv | DoubleNeg | DoubleSqrt
            | IntToDouble => IrType::Double,
            IntEq | IntNe | IntLt | IntLe | IntGt | IntGe | DoubleEq | DoubleNe | DoubleLt
            | DoubleLe | DoubleGt | DoubleGe | BoolEq => IrType::Bool,
            ArrayGet => match receiver_ty {
                IrType::Array { elem, .. } => (**elem).clone(),
                _ => IrType::Void,
            },
            ArraySet => match receiver_ty {
                IrType::Array { elem, .. } => (**elem).clone(),
                _ => IrType::Void,
            },
        }
    }

    fn consider_inline(&mut self, call: ExprId, target: MemberId) {
        if !self.options.inline_trivial_calls || target == self.member {
            return;
        }
        let callee = self.program.member(target);
        let Some(body) = &callee.body else { return };
        if callee.kind == MemberKind::Constructor
            || callee.import.is_some()
            || body.node_count() > INLINE_NODE_LIMIT
            || !callee.named_params.is_empty()
            || body_has_lambda(body)
        {
            return;
        }
        self.plan.inline[call.0] = Some(target);
    }

    /// Pure bottom-up static type of an expression, used where a decision
    /// needs the type before the node is analyzed.
    fn static_type(&self, id: ExprId) -> Result<IrType> {
        match self.body.expr(id) {
            Expr::IntLit(_) => Ok(IrType::Int),
            Expr::DoubleLit(_) => Ok(IrType::Double),
            Expr::BoolLit(_) => Ok(IrType::Bool),
            Expr::StringLit(_) => Ok(IrType::class(self.program.core.string)),
            Expr::Null => Ok(IrType::nullable_class(self.program.core.object)),
            Expr::Const(constant) => Ok(constant.ty(&self.program.core)),
            Expr::This => self
                .owner
                .map(IrType::class)
                .ok_or_else(|| Error::codegen("`this` used in a body without a receiver")),
            Expr::LocalGet(local) | Expr::LocalSet(local, _) => {
                Ok(self.body.local(*local).ty.clone())
            }
            Expr::StaticGet(id) | Expr::StaticSet(id, _) => {
                Ok(self.program.static_field(*id).ty.clone())
            }
            Expr::FieldGet { field, .. } | Expr::FieldSet { field, .. } => {
                Ok(self.field_ty(*field))
            }
            Expr::CallVirtual {
                receiver,
                interface_target,
                args,
                ..
            } => {
                let target = self.program.member(*interface_target);
                let receiver_ty = self.static_type(*receiver)?;
                if let Some(intrinsic) =
                    intrinsics::resolve(&receiver_ty, &target.name, args.len())
                {
                    return Ok(self.intrinsic_result(intrinsic, &receiver_ty));
                }
                Ok(target.return_ty.clone())
            }
            Expr::CallDirect { target, .. } => {
                Ok(self.program.member(*target).return_ty.clone())
            }
            Expr::New { class, .. } => Ok(IrType::class(*class)),
            Expr::CallClosure { callee, .. } => match self.static_type(*callee)? {
                IrType::Func { ret, .. } => Ok(*ret),
                other => Err(Error::codegen(format!(
                    "closure call on a non-function value of type `{other}`"
                ))),
            },
            Expr::Lambda {
                params, return_ty, ..
            } => Ok(IrType::Func {
                params: params
                    .iter()
                    .map(|&p| self.body.local(p).ty.clone())
                    .collect(),
                ret: Box::new(return_ty.clone()),
                nullable: false,
            }),
            Expr::Is { .. } => Ok(IrType::Bool),
            Expr::As { ty, .. } => Ok(ty.clone()),
            Expr::NullCheck(operand) => Ok(self.static_type(*operand)?.as_non_nullable()),
            Expr::Conditional { then, .. } => self.static_type(*then),
            Expr::Logical { .. } | Expr::Not(_) => Ok(IrType::Bool),
        }
    }
}

fn body_has_lambda(body: &Body) -> bool {
    body.exprs
        .iter()
        .any(|expr| matches!(expr, Expr::Lambda { .. }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closures::ClosureRegistry;
    use crate::ir::{ClassDef, CoreClasses, LocalDef};
    use crate::layout::ClassLayout;
    use crate::types::TypeStore;

    fn core_program() -> Program {
        let class = |name: &str, superclass: Option<usize>, fields: Vec<(&str, IrType)>| {
            ClassDef {
                name: name.into(),
                superclass: superclass.map(ClassId),
                interfaces: Vec::new(),
                is_abstract: false,
                fields: fields
                    .into_iter()
                    .map(|(name, ty)| crate::ir::FieldDef {
                        name: name.into(),
                        ty,
                        initializer: None,
                    })
                    .collect(),
                members: Vec::new(),
            }
        };
        Program {
            classes: vec![
                class("Object", None, vec![]),
                class("BoxedInt", Some(0), vec![("value", IrType::Int)]),
                class("BoxedDouble", Some(0), vec![("value", IrType::Double)]),
                class("BoxedBool", Some(0), vec![("value", IrType::Bool)]),
                class("String", Some(0), vec![("bytes", IrType::Bytes)]),
            ],
            members: vec![MemberDef {
                name: "main".into(),
                owner: None,
                kind: MemberKind::Function,
                params: Vec::new(),
                named_params: Vec::new(),
                return_ty: IrType::Void,
                body: Some(Body::new(Vec::new(), 0)),
                is_abstract: false,
                import: None,
            }],
            statics: Vec::new(),
            imports: Vec::new(),
            core: CoreClasses {
                object: ClassId(0),
                boxed_int: ClassId(1),
                boxed_double: ClassId(2),
                boxed_bool: ClassId(3),
                string: ClassId(4),
            },
            entry: MemberId(0),
        }
    }

    fn analyze(program: &Program, body: &Body, ret: IrType) -> Result<BodyPlan> {
        let mut types = TypeStore::new();
        let mut closures = ClosureRegistry::new();
        let layout = ClassLayout::collect(program, &mut types, &mut closures).unwrap();
        let dispatch =
            DispatchTables::build(program, &layout, &mut types, &mut closures).unwrap();
        analyze_body(
            program,
            &dispatch,
            &BackendOptions::default(),
            MemberId(0),
            None,
            body,
            &ret,
        )
    }

    #[test]
    fn primitive_into_object_records_a_box() {
        let program = core_program();
        let mut body = Body::new(
            vec![LocalDef {
                name: "o".into(),
                ty: IrType::nullable_class(ClassId(0)),
            }],
            0,
        );
        let value = body.add_expr(Expr::IntLit(7));
        let set = body.add_expr(Expr::LocalSet(crate::ir::LocalId(0), value));
        body.stmts = vec![Stmt::Expr(set)];
        let plan = analyze(&program, &body, IrType::Void).unwrap();
        assert_eq!(
            plan.conversions[value.0],
            Some(Conversion::Box(ClassId(1)))
        );
        // The assignment's own result is discarded.
        assert!(plan.drop_value[set.0]);
    }

    #[test]
    fn conversion_decisions_are_idempotent() {
        let program = core_program();
        let body = Body::new(Vec::new(), 0);
        let plan = analyze(&program, &body, IrType::Void).unwrap();
        drop(plan);

        // Re-running the table on each conversion's result type is a no-op.
        let mut types = TypeStore::new();
        let mut closures = ClosureRegistry::new();
        let layout = ClassLayout::collect(&program, &mut types, &mut closures).unwrap();
        let dispatch =
            DispatchTables::build(&program, &layout, &mut types, &mut closures).unwrap();
        let options = BackendOptions::default();
        let analyzer = Analyzer {
            program: &program,
            dispatch: &dispatch,
            options: &options,
            member: MemberId(0),
            owner: None,
            body: &body,
            return_ty: IrType::Void,
            plan: BodyPlan::default(),
        };
        let cases = [
            (IrType::Int, IrType::class(ClassId(0))),
            (IrType::nullable_class(ClassId(1)), IrType::class(ClassId(1))),
            (IrType::class(ClassId(0)), IrType::class(ClassId(1))),
            (IrType::class(ClassId(4)), IrType::Int),
        ];
        for (produced, expected) in cases {
            let conversion = analyzer.conversion_for(&produced, &expected).unwrap();
            let result_ty = match conversion {
                Some(Conversion::Box(class)) => IrType::class(class),
                Some(Conversion::Unbox(_)) => expected.clone(),
                Some(Conversion::NullAssert) => produced.as_non_nullable(),
                Some(Conversion::Downcast(ty)) => ty,
                None => produced.clone(),
            };
            assert_eq!(
                analyzer.conversion_for(&result_ty, &expected).unwrap(),
                None,
                "converting {produced} to {expected} must settle in one step"
            );
        }
    }

    #[test]
    fn unrelated_reference_types_are_fatal() {
        let program = core_program();
        let mut types = TypeStore::new();
        let mut closures = ClosureRegistry::new();
        let layout = ClassLayout::collect(&program, &mut types, &mut closures).unwrap();
        let dispatch =
            DispatchTables::build(&program, &layout, &mut types, &mut closures).unwrap();
        let body = Body::new(Vec::new(), 0);
        let options = BackendOptions::default();
        let analyzer = Analyzer {
            program: &program,
            dispatch: &dispatch,
            options: &options,
            member: MemberId(0),
            owner: None,
            body: &body,
            return_ty: IrType::Void,
            plan: BodyPlan::default(),
        };
        // BoxedInt and String share no subtype edge in either direction.
        let err = analyzer
            .conversion_for(&IrType::class(ClassId(1)), &IrType::class(ClassId(4)))
            .unwrap_err();
        assert!(err.to_string().contains("unrelated"), "{err}");
    }

    #[test]
    fn intrinsics_resolve_on_primitive_receivers() {
        let program = core_program();
        let mut body = Body::new(Vec::new(), 0);
        let lhs = body.add_expr(Expr::IntLit(2));
        let rhs = body.add_expr(Expr::IntLit(3));
        // The interface target is irrelevant once the intrinsic fires; use
        // a synthetic virtual call through member 0's id.
        let mut program = program;
        program.members.push(MemberDef {
            name: "+".into(),
            owner: Some(ClassId(0)),
            kind: MemberKind::Method,
            params: vec![crate::ir::ParamDef {
                name: "other".into(),
                ty: IrType::Int,
                default: None,
            }],
            named_params: Vec::new(),
            return_ty: IrType::Int,
            body: None,
            is_abstract: true,
            import: None,
        });
        program.classes[0].members.push(MemberId(1));
        let call = body.add_expr(Expr::CallVirtual {
            receiver: lhs,
            interface_target: MemberId(1),
            args: vec![rhs],
            named_args: Vec::new(),
        });
        body.stmts = vec![Stmt::Expr(call)];
        let plan = analyze(&program, &body, IrType::Void).unwrap();
        assert_eq!(plan.intrinsics[call.0], Some(Intrinsic::IntAdd));
        assert_eq!(plan.produced[call.0], IrType::Int);
    }
}
