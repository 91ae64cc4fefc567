//! Top-level field storage.
//!
//! Every static field maps to one module global. Constant-initialized
//! fields are pre-resolved to the constant pool's global; fields with a
//! computed initializer get an accessor function invoked lazily on first
//! read, using nullability itself as the "initialized" flag where the value
//! type supports it and an explicit i32 flag global otherwise. Fields with
//! no initializer read their default directly.

use crate::closures::ClosureRegistry;
use crate::error::{Error, Result};
use crate::ir::{Constant, IrType, Program, StaticId};
use crate::layout::ClassLayout;
use crate::module::{ConstExpr, FuncIdx, GlobalIdx, ModuleBuilder};
use crate::types::{FuncType, ValType};

/// How reads of one static field are lowered.
#[derive(Debug, Clone)]
pub enum StaticKind {
    /// Aliases an interned constant; reads go through the pool.
    Constant(Constant),
    /// Default-valued; reads are a bare `global.get`.
    Plain,
    /// Lazily initialized through the accessor on first read.
    Lazy {
        accessor: FuncIdx,
        /// Present when the value type has no null sentinel to spend.
        flag: Option<GlobalIdx>,
    },
}

/// One static field's compiled slot.
#[derive(Debug, Clone)]
pub struct StaticSlot {
    pub global: GlobalIdx,
    /// The global's declared (storage) type: references are nullable here
    /// even when the field type is not.
    pub storage: ValType,
    pub ty: IrType,
    pub kind: StaticKind,
}

/// Write-once table of every static field's slot.
#[derive(Debug, Default)]
pub struct StaticTables {
    slots: Vec<StaticSlot>,
}

impl StaticTables {
    /// Declare globals, flags, and accessor indices. Accessor bodies are
    /// compiled with the member bodies; only the index space is fixed here.
    pub fn declare(
        program: &Program,
        layout: &ClassLayout,
        closures: &mut ClosureRegistry,
        module: &mut ModuleBuilder,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(program.statics.len());
        for (index, field) in program.statics.iter().enumerate() {
            let value =
                layout.value_type(program, &mut module.types, closures, &field.ty)?;
            let storage = match value {
                ValType::Ref(reference) => ValType::nullable_ref(reference.heap),
                other => other,
            };
            let init = default_init(storage);
            let kind = if let Some(constant) = &field.constant {
                StaticKind::Constant(constant.clone())
            } else if let Some(_body) = &field.initializer {
                let accessor = module.declare_function(
                    format!("static#{index}:{}", field.name),
                    FuncType {
                        params: Vec::new(),
                        results: vec![value],
                    },
                )?;
                let flag = match storage {
                    // Non-nullable field stored in a nullable global: null
                    // still means "not yet initialized".
                    ValType::Ref(_) if !field.ty.is_nullable() => None,
                    ValType::Ref(_) => Some(
                        module.add_global(ValType::I32, true, ConstExpr::I32(0))?,
                    ),
                    _ => Some(module.add_global(ValType::I32, true, ConstExpr::I32(0))?),
                };
                StaticKind::Lazy { accessor, flag }
            } else {
                if !field.ty.is_nullable() && !field.ty.is_primitive() {
                    return Err(Error::codegen(format!(
                        "static field `{}` is non-nullable but has no initializer",
                        field.name
                    )));
                }
                StaticKind::Plain
            };
            let global = module.add_global(storage, true, init)?;
            slots.push(StaticSlot {
                global,
                storage,
                ty: field.ty.clone(),
                kind,
            });
        }
        Ok(Self { slots })
    }

    pub fn slot(&self, id: StaticId) -> &StaticSlot {
        &self.slots[id.0]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn default_init(storage: ValType) -> ConstExpr {
    match storage {
        ValType::I32 => ConstExpr::I32(0),
        ValType::I64 => ConstExpr::I64(0),
        ValType::F32 | ValType::F64 => ConstExpr::F64(0.0),
        ValType::Ref(reference) => ConstExpr::RefNull(reference.heap),
        _ => ConstExpr::I32(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Body, ClassDef, ClassId, CoreClasses, MemberId, StaticDef};

    fn program_with_statics(statics: Vec<StaticDef>) -> Program {
        Program {
            classes: vec![ClassDef {
                name: "Object".into(),
                superclass: None,
                interfaces: Vec::new(),
                is_abstract: false,
                fields: Vec::new(),
                members: Vec::new(),
            }],
            members: Vec::new(),
            statics,
            imports: Vec::new(),
            core: CoreClasses {
                object: ClassId(0),
                boxed_int: ClassId(0),
                boxed_double: ClassId(0),
                boxed_bool: ClassId(0),
                string: ClassId(0),
            },
            entry: MemberId(0),
        }
    }

    fn declare(program: &Program) -> Result<StaticTables> {
        let mut module = ModuleBuilder::new();
        let mut closures = ClosureRegistry::new();
        let layout =
            ClassLayout::collect(program, &mut module.types, &mut closures).unwrap();
        StaticTables::declare(program, &layout, &mut closures, &mut module)
    }

    fn static_field(name: &str, ty: IrType) -> StaticDef {
        StaticDef {
            name: name.into(),
            ty,
            constant: None,
            initializer: None,
        }
    }

    #[test]
    fn primitive_initializer_needs_an_explicit_flag() {
        let mut field = static_field("counter", IrType::Int);
        field.initializer = Some(Body::new(Vec::new(), 0));
        let tables = declare(&program_with_statics(vec![field])).unwrap();
        match &tables.slot(StaticId(0)).kind {
            StaticKind::Lazy { flag, .. } => assert!(flag.is_some()),
            other => panic!("expected lazy slot, got {other:?}"),
        }
    }

    #[test]
    fn non_nullable_reference_uses_null_as_its_flag() {
        let mut field = static_field("name", IrType::class(ClassId(0)));
        field.initializer = Some(Body::new(Vec::new(), 0));
        let tables = declare(&program_with_statics(vec![field])).unwrap();
        match &tables.slot(StaticId(0)).kind {
            StaticKind::Lazy { flag, .. } => assert!(flag.is_none()),
            other => panic!("expected lazy slot, got {other:?}"),
        }
    }

    #[test]
    fn uninitialized_non_nullable_reference_is_rejected() {
        let field = static_field("bad", IrType::class(ClassId(0)));
        let err = declare(&program_with_statics(vec![field])).unwrap_err();
        assert!(err.to_string().contains("no initializer"), "{err}");
    }

    #[test]
    fn constant_statics_resolve_to_the_pool() {
        let mut field = static_field("table", IrType::array(IrType::Int));
        field.constant = Some(Constant::List {
            elem: IrType::Int,
            values: vec![Constant::Int(1)],
        });
        let tables = declare(&program_with_statics(vec![field])).unwrap();
        assert!(matches!(
            tables.slot(StaticId(0)).kind,
            StaticKind::Constant(_)
        ));
    }
}
