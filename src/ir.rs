//! Typed input IR consumed by the backend.
//!
//! The front end hands the backend a fully-resolved program: classes with
//! ordered fields and superclass/interface edges, members with typed
//! signatures, and typed expression trees. Nothing here is re-validated;
//! a shape the backend cannot lower is reported as a [`crate::Error`]
//! during code generation, not repaired.
//!
//! Bodies are arenas: expressions live in a per-body pool indexed by
//! [`ExprId`], so analysis passes can record per-node decisions in dense
//! side tables instead of identity-keyed maps.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Identifier for a class, dense in hierarchy order after layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub usize);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identifier for a member (method, getter, setter, constructor, function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(pub usize);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Identifier for a top-level (static) field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StaticId(pub usize);

/// Identifier for a local slot within one body. Parameters occupy the
/// leading slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub usize);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.0)
    }
}

/// Identifier for an expression node within one body's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(pub usize);

/// Index into [`Program::imports`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportId(pub usize);

/// A value type as the front end sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IrType {
    Void,
    Bool,
    Int,
    Double,
    /// Immutable byte payload backing string contents.
    Bytes,
    Array {
        elem: Box<IrType>,
        nullable: bool,
    },
    Class {
        class: ClassId,
        nullable: bool,
    },
    Func {
        params: Vec<IrType>,
        ret: Box<IrType>,
        nullable: bool,
    },
}

impl IrType {
    pub fn class(class: ClassId) -> Self {
        IrType::Class {
            class,
            nullable: false,
        }
    }

    pub fn nullable_class(class: ClassId) -> Self {
        IrType::Class {
            class,
            nullable: true,
        }
    }

    pub fn array(elem: IrType) -> Self {
        IrType::Array {
            elem: Box::new(elem),
            nullable: false,
        }
    }

    /// Whether the type admits `null`.
    pub fn is_nullable(&self) -> bool {
        match self {
            IrType::Array { nullable, .. }
            | IrType::Class { nullable, .. }
            | IrType::Func { nullable, .. } => *nullable,
            _ => false,
        }
    }

    /// Whether values of this type live outside the GC heap.
    pub fn is_primitive(&self) -> bool {
        matches!(self, IrType::Bool | IrType::Int | IrType::Double)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, IrType::Void)
    }

    /// The same type with nullability added. Primitives are unchanged.
    #[must_use]
    pub fn as_nullable(&self) -> IrType {
        let mut out = self.clone();
        match &mut out {
            IrType::Array { nullable, .. }
            | IrType::Class { nullable, .. }
            | IrType::Func { nullable, .. } => *nullable = true,
            _ => {}
        }
        out
    }

    /// The same type with nullability removed. Primitives are unchanged.
    #[must_use]
    pub fn as_non_nullable(&self) -> IrType {
        let mut out = self.clone();
        match &mut out {
            IrType::Array { nullable, .. }
            | IrType::Class { nullable, .. }
            | IrType::Func { nullable, .. } => *nullable = false,
            _ => {}
        }
        out
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => f.write_str("void"),
            IrType::Bool => f.write_str("bool"),
            IrType::Int => f.write_str("int"),
            IrType::Double => f.write_str("double"),
            IrType::Bytes => f.write_str("bytes"),
            IrType::Array { elem, nullable } => {
                write!(f, "[{elem}]{}", if *nullable { "?" } else { "" })
            }
            IrType::Class { class, nullable } => {
                write!(f, "{class}{}", if *nullable { "?" } else { "" })
            }
            IrType::Func {
                params,
                ret,
                nullable,
            } => {
                f.write_str("fn(")?;
                for (idx, param) in params.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ") -> {ret}{}", if *nullable { "?" } else { "" })
            }
        }
    }
}

/// An interned constant value. Identity is by value, which is what the
/// constant pool memoizes on; `Double` stores the bit pattern so the type
/// can carry `Eq`/`Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Double(u64),
    String(String),
    List {
        elem: IrType,
        values: Vec<Constant>,
    },
    Instance {
        class: ClassId,
        fields: Vec<Constant>,
    },
}

impl Constant {
    pub fn double(value: f64) -> Self {
        Constant::Double(value.to_bits())
    }

    pub fn double_value(bits: u64) -> f64 {
        f64::from_bits(bits)
    }

    /// The static type this constant produces.
    pub fn ty(&self, core: &CoreClasses) -> IrType {
        match self {
            Constant::Null => IrType::nullable_class(core.object),
            Constant::Bool(_) => IrType::Bool,
            Constant::Int(_) => IrType::Int,
            Constant::Double(_) => IrType::Double,
            Constant::String(_) => IrType::class(core.string),
            Constant::List { elem, .. } => IrType::array(elem.clone()),
            Constant::Instance { class, .. } => IrType::class(*class),
        }
    }
}

/// The well-known classes the lowering depends on. The front end designates
/// them; the backend never resolves classes by name.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    /// Root of the class hierarchy; receives class id 0.
    pub object: ClassId,
    pub boxed_int: ClassId,
    pub boxed_double: ClassId,
    pub boxed_bool: ClassId,
    pub string: ClassId,
}

/// A host function made available through the import section.
#[derive(Debug, Clone)]
pub struct HostImport {
    pub module: String,
    pub name: String,
    pub params: Vec<IrType>,
    pub ret: IrType,
}

/// One instance field declaration.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: IrType,
    /// Runs during construction, in declaration order, before the
    /// super initializer.
    pub initializer: Option<Body>,
}

/// One class declaration.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub superclass: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    pub is_abstract: bool,
    pub fields: Vec<FieldDef>,
    pub members: Vec<MemberId>,
}

/// Distinguishes dispatch identity: a getter and a method of the same name
/// are different selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemberKind {
    Method,
    Getter,
    Setter,
    Constructor,
    /// Top-level or static function; never dispatched through the table.
    Function,
}

/// One positional or named parameter.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub ty: IrType,
    /// `None` means the parameter is required.
    pub default: Option<Constant>,
}

/// One callable member.
#[derive(Debug, Clone)]
pub struct MemberDef {
    pub name: String,
    pub owner: Option<ClassId>,
    pub kind: MemberKind,
    pub params: Vec<ParamDef>,
    /// Named parameters, in declaration order. Call sites pass these by
    /// name; the selector's merged [`ParameterInfo`] fixes each name's slot.
    pub named_params: Vec<ParamDef>,
    pub return_ty: IrType,
    pub body: Option<Body>,
    pub is_abstract: bool,
    /// Present when the member is backed by a host import instead of a body.
    pub import: Option<ImportId>,
}

impl MemberDef {
    /// Whether calls to this member dispatch through the selector table.
    pub fn is_virtual(&self) -> bool {
        self.owner.is_some()
            && matches!(
                self.kind,
                MemberKind::Method | MemberKind::Getter | MemberKind::Setter
            )
    }
}

/// One top-level field.
#[derive(Debug, Clone)]
pub struct StaticDef {
    pub name: String,
    pub ty: IrType,
    /// Constant initializers pre-resolve to the constant pool; any other
    /// initializer runs lazily on first read.
    pub constant: Option<Constant>,
    pub initializer: Option<Body>,
}

/// One local slot declaration.
#[derive(Debug, Clone)]
pub struct LocalDef {
    pub name: String,
    pub ty: IrType,
}

/// A member body: a local table, an expression arena, and a statement tree.
#[derive(Debug, Clone, Default)]
pub struct Body {
    pub locals: Vec<LocalDef>,
    /// How many leading locals are parameters (named parameters included).
    pub param_count: usize,
    pub exprs: Vec<Expr>,
    pub stmts: Vec<Stmt>,
}

impl Body {
    pub fn new(locals: Vec<LocalDef>, param_count: usize) -> Self {
        Self {
            locals,
            param_count,
            exprs: Vec::new(),
            stmts: Vec::new(),
        }
    }

    pub fn add_local(&mut self, name: impl Into<String>, ty: IrType) -> LocalId {
        let id = LocalId(self.locals.len());
        self.locals.push(LocalDef {
            name: name.into(),
            ty,
        });
        id
    }

    pub fn add_expr(&mut self, expr: Expr) -> ExprId {
        let id = ExprId(self.exprs.len());
        self.exprs.push(expr);
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0]
    }

    pub fn local(&self, id: LocalId) -> &LocalDef {
        &self.locals[id.0]
    }

    /// Rough body size used by the trivial-call inliner threshold.
    pub fn node_count(&self) -> usize {
        self.exprs.len() + count_stmts(&self.stmts)
    }
}

fn count_stmts(stmts: &[Stmt]) -> usize {
    let mut total = stmts.len();
    for stmt in stmts {
        match stmt {
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                total += count_stmts(then_branch) + count_stmts(else_branch);
            }
            Stmt::While { body, .. } => total += count_stmts(body),
            Stmt::Block(inner) => total += count_stmts(inner),
            _ => {}
        }
    }
    total
}

/// Statements. Control flow is structured; the encoder lowers it onto
/// block/loop/if scopes directly.
#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(ExprId),
    Let {
        local: LocalId,
        value: Option<ExprId>,
    },
    If {
        cond: ExprId,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    While {
        cond: ExprId,
        body: Vec<Stmt>,
    },
    Return(Option<ExprId>),
    Break,
    Continue,
    Block(Vec<Stmt>),
}

/// Reference to a resolved instance field: the declaring class and the
/// ordinal within that class's own declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub class: ClassId,
    pub index: usize,
}

/// Expression nodes — a closed sum the passes match exhaustively, so a
/// missing lowering rule is a compile-time gap rather than a runtime throw.
#[derive(Debug, Clone)]
pub enum Expr {
    IntLit(i64),
    DoubleLit(f64),
    BoolLit(bool),
    StringLit(String),
    Null,
    Const(Constant),
    This,
    LocalGet(LocalId),
    LocalSet(LocalId, ExprId),
    StaticGet(StaticId),
    StaticSet(StaticId, ExprId),
    FieldGet {
        receiver: ExprId,
        field: FieldRef,
    },
    FieldSet {
        receiver: ExprId,
        field: FieldRef,
        value: ExprId,
    },
    /// Dispatch through the interface target's selector.
    CallVirtual {
        receiver: ExprId,
        interface_target: MemberId,
        args: Vec<ExprId>,
        named_args: Vec<(String, ExprId)>,
    },
    /// Statically-bound call: top-level functions, super calls, and
    /// front-end-resolved instance calls.
    CallDirect {
        target: MemberId,
        receiver: Option<ExprId>,
        args: Vec<ExprId>,
        named_args: Vec<(String, ExprId)>,
    },
    /// Allocation followed by the designated constructor.
    New {
        class: ClassId,
        ctor: MemberId,
        args: Vec<ExprId>,
        named_args: Vec<(String, ExprId)>,
    },
    /// Invoke a first-class function value.
    CallClosure {
        callee: ExprId,
        args: Vec<ExprId>,
    },
    /// A nested function. Parameters are locals of the enclosing body;
    /// capture analysis decides what moves into a context struct.
    Lambda {
        params: Vec<LocalId>,
        return_ty: IrType,
        body: Vec<Stmt>,
    },
    Is {
        operand: ExprId,
        class: ClassId,
    },
    As {
        operand: ExprId,
        ty: IrType,
    },
    NullCheck(ExprId),
    Conditional {
        cond: ExprId,
        then: ExprId,
        otherwise: ExprId,
    },
    Logical {
        op: LogicalOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Not(ExprId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// A callable member's full parameter shape including defaults, merged
/// across every class contributing to one dispatch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterInfo {
    /// One entry per positional parameter; `None` marks it required.
    pub positional: Vec<Option<Constant>>,
    /// Every named parameter, keyed by name (which fixes its slot order);
    /// `None` marks it required.
    pub named: BTreeMap<String, Option<Constant>>,
}

impl ParameterInfo {
    pub fn from_member(member: &MemberDef) -> Self {
        let positional = member.params.iter().map(|p| p.default.clone()).collect();
        let named = member
            .named_params
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect();
        Self { positional, named }
    }

    /// Index of a named parameter within the merged named slot order.
    pub fn named_index(&self, name: &str) -> Option<usize> {
        self.named.keys().position(|key| key == name)
    }

    /// Merge the shapes of two overriders sharing one selector. Differing
    /// default values are a reportable error, never a silent pick.
    pub fn merge(&self, other: &Self, selector: &str) -> Result<Self> {
        if self.positional.len() != other.positional.len() {
            return Err(Error::codegen(format!(
                "selector `{selector}` has overriders with differing arity \
                 ({} vs {} positional parameters)",
                self.positional.len(),
                other.positional.len()
            )));
        }
        let mut positional = Vec::with_capacity(self.positional.len());
        for (idx, (a, b)) in self
            .positional
            .iter()
            .zip(other.positional.iter())
            .enumerate()
        {
            positional.push(match (a, b) {
                (Some(a), Some(b)) if a != b => {
                    return Err(Error::codegen(format!(
                        "selector `{selector}` has incompatible default values \
                         for positional parameter {idx}"
                    )));
                }
                (Some(a), _) => Some(a.clone()),
                (None, other) => other.clone(),
            });
        }
        let mut named = self.named.clone();
        for (name, value) in &other.named {
            match named.get_mut(name) {
                Some(existing) => {
                    if let (Some(a), Some(b)) = (&*existing, value)
                        && a != b
                    {
                        return Err(Error::codegen(format!(
                            "selector `{selector}` has incompatible default values \
                             for named parameter `{name}`"
                        )));
                    }
                    if existing.is_none() {
                        *existing = value.clone();
                    }
                }
                None => {
                    named.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(Self { positional, named })
    }
}

/// The fully-resolved typed program handed over by the front end.
#[derive(Debug, Clone)]
pub struct Program {
    pub classes: Vec<ClassDef>,
    pub members: Vec<MemberDef>,
    pub statics: Vec<StaticDef>,
    pub imports: Vec<HostImport>,
    pub core: CoreClasses,
    pub entry: MemberId,
}

impl Program {
    pub fn class(&self, id: ClassId) -> &ClassDef {
        &self.classes[id.0]
    }

    pub fn member(&self, id: MemberId) -> &MemberDef {
        &self.members[id.0]
    }

    pub fn static_field(&self, id: StaticId) -> &StaticDef {
        &self.statics[id.0]
    }

    /// Walk the superclass chain starting at `id` (inclusive).
    pub fn superclass_chain(&self, id: ClassId) -> SuperclassChain<'_> {
        SuperclassChain {
            program: self,
            next: Some(id),
        }
    }

    /// Resolve a field name against a class and its ancestors.
    pub fn resolve_field(&self, class: ClassId, name: &str) -> Option<FieldRef> {
        for current in self.superclass_chain(class) {
            if let Some(index) = self
                .class(current)
                .fields
                .iter()
                .position(|field| field.name == name)
            {
                return Some(FieldRef {
                    class: current,
                    index,
                });
            }
        }
        None
    }
}

pub struct SuperclassChain<'a> {
    program: &'a Program,
    next: Option<ClassId>,
}

impl Iterator for SuperclassChain<'_> {
    type Item = ClassId;

    fn next(&mut self) -> Option<ClassId> {
        let current = self.next?;
        self.next = self.program.class(current).superclass;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(name: &str, ty: IrType) -> ParamDef {
        ParamDef {
            name: name.into(),
            ty,
            default: None,
        }
    }

    fn defaulted(name: &str, ty: IrType, value: Constant) -> ParamDef {
        ParamDef {
            name: name.into(),
            ty,
            default: Some(value),
        }
    }

    fn member_with_params(params: Vec<ParamDef>, named: Vec<ParamDef>) -> MemberDef {
        MemberDef {
            name: "m".into(),
            owner: None,
            kind: MemberKind::Method,
            params,
            named_params: named,
            return_ty: IrType::Void,
            body: None,
            is_abstract: false,
            import: None,
        }
    }

    #[test]
    fn parameter_info_merge_keeps_compatible_defaults() {
        let a = ParameterInfo::from_member(&member_with_params(
            vec![required("x", IrType::Int)],
            vec![defaulted("flag", IrType::Bool, Constant::Bool(true))],
        ));
        let b = ParameterInfo::from_member(&member_with_params(
            vec![defaulted("x", IrType::Int, Constant::Int(7))],
            vec![defaulted("flag", IrType::Bool, Constant::Bool(true))],
        ));
        let merged = a.merge(&b, "m").unwrap();
        assert_eq!(merged.positional, vec![Some(Constant::Int(7))]);
        assert_eq!(
            merged.named.get("flag"),
            Some(&Some(Constant::Bool(true)))
        );
    }

    #[test]
    fn parameter_info_merge_reports_conflicting_defaults() {
        let a = ParameterInfo::from_member(&member_with_params(
            vec![defaulted("x", IrType::Int, Constant::Int(1))],
            Vec::new(),
        ));
        let b = ParameterInfo::from_member(&member_with_params(
            vec![defaulted("x", IrType::Int, Constant::Int(2))],
            Vec::new(),
        ));
        let err = a.merge(&b, "m").unwrap_err();
        assert!(err.to_string().contains("incompatible default values"));
    }

    #[test]
    fn double_constants_compare_by_bit_pattern() {
        assert_eq!(Constant::double(1.5), Constant::double(1.5));
        assert_ne!(Constant::double(0.0), Constant::double(-0.0));
    }

    #[test]
    fn nullability_round_trips() {
        let ty = IrType::class(ClassId(3));
        assert!(!ty.is_nullable());
        assert!(ty.as_nullable().is_nullable());
        assert_eq!(ty.as_nullable().as_non_nullable(), ty);
        assert_eq!(IrType::Int.as_nullable(), IrType::Int);
    }
}
