//! The interned constant pool.
//!
//! Each distinct constant value gets exactly one backing global (identity is
//! the value itself, not its occurrences) plus a zero-argument initializer
//! function. Reads call the initializer, which materializes the value on
//! first use and returns the cached reference afterwards; in eager mode a
//! module start function runs every initializer once and reads collapse to
//! `global.get`.
//!
//! The memo entry is registered before any nested constant is instantiated,
//! and instance constants publish their placeholder global before their
//! fields are written, so self-referential constants settle through the
//! placeholder instead of recursing.

use std::collections::HashMap;

use crate::closures::ClosureRegistry;
use crate::error::{Error, Result};
use crate::instr::{BlockType, CodeWriter};
use crate::ir::{Constant, IrType, Program};
use crate::layout::{CLASS_ID_FIELD, ClassLayout, bytes_array};
use crate::module::{ConstExpr, DataIdx, FuncIdx, GlobalIdx, ModuleBuilder};
use crate::types::{FuncType, HeapType, RefType, ValType};

/// Index into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantId(pub usize);

/// One interned constant's compiled form.
#[derive(Debug, Clone, Copy)]
pub struct ConstantInfo {
    /// Nullable placeholder global; null until first materialization.
    pub global: GlobalIdx,
    /// Zero-argument initializer returning the (non-null) value.
    pub init_func: FuncIdx,
    /// The non-null reference type the initializer returns.
    pub ty: RefType,
}

/// Everything constant materialization needs from the rest of the pipeline.
pub struct PoolCx<'a> {
    pub program: &'a Program,
    pub layout: &'a ClassLayout,
    pub closures: &'a mut ClosureRegistry,
    pub module: &'a mut ModuleBuilder,
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    by_value: HashMap<Constant, ConstantId>,
    infos: Vec<ConstantInfo>,
    string_segments: HashMap<String, DataIdx>,
    pub eager: bool,
}

impl ConstantPool {
    pub fn new(eager: bool) -> Self {
        Self {
            eager,
            ..Self::default()
        }
    }

    pub fn info(&self, id: ConstantId) -> ConstantInfo {
        self.infos[id.0]
    }

    /// Initializers in creation order, for the eager-mode start function.
    pub fn init_funcs(&self) -> impl Iterator<Item = ConstantInfo> + '_ {
        self.infos.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Intern a heap constant, creating its global and initializer on first
    /// encounter.
    pub fn intern(&mut self, cx: &mut PoolCx<'_>, constant: &Constant) -> Result<ConstantId> {
        if let Some(&id) = self.by_value.get(constant) {
            return Ok(id);
        }
        let ty = self.reference_type(cx, constant)?;
        let global = cx.module.add_global(
            ValType::Ref(RefType::nullable(ty.heap)),
            true,
            ConstExpr::RefNull(ty.heap),
        )?;
        let init_func = cx.module.declare_function(
            format!("constant#{}", self.infos.len()),
            FuncType {
                params: Vec::new(),
                results: vec![ValType::Ref(ty)],
            },
        )?;
        let id = ConstantId(self.infos.len());
        self.infos.push(ConstantInfo {
            global,
            init_func,
            ty,
        });
        // Register before recursing so dependents resolve to this entry.
        self.by_value.insert(constant.clone(), id);

        let body = self.build_initializer(cx, constant, id)?;
        cx.module.set_body(init_func, body)?;
        Ok(id)
    }

    /// Emit a read of an interned constant into `w`.
    pub fn read(
        &mut self,
        cx: &mut PoolCx<'_>,
        w: &mut CodeWriter,
        constant: &Constant,
    ) -> Result<RefType> {
        let id = self.intern(cx, constant)?;
        let info = self.infos[id.0];
        if self.eager {
            // The start function has already run the initializer.
            w.global_get(info.global.0, ValType::nullable_ref(info.ty.heap));
            w.ref_as_non_null()?;
        } else {
            let sig = cx.module.func_sig(info.init_func)?.clone();
            w.call(&cx.module.types, info.init_func.0, &sig)?;
        }
        Ok(info.ty)
    }

    /// The non-null reference type a pooled constant materializes as.
    fn reference_type(&self, cx: &mut PoolCx<'_>, constant: &Constant) -> Result<RefType> {
        match constant {
            Constant::String(_) => Ok(RefType::non_null(HeapType::Def(
                cx.layout.struct_of(cx.program.core.string),
            ))),
            Constant::List { elem, .. } => {
                let storage = cx.layout.storage_type(
                    cx.program,
                    &mut cx.module.types,
                    cx.closures,
                    elem,
                )?;
                let array = cx
                    .module
                    .types
                    .intern_array(crate::types::FieldType::mutable(storage))?;
                Ok(RefType::non_null(HeapType::Def(array)))
            }
            Constant::Instance { class, .. } => Ok(RefType::non_null(HeapType::Def(
                cx.layout.struct_of(*class),
            ))),
            other => Err(Error::internal(format!(
                "{other:?} is not a pooled constant; emit it inline"
            ))),
        }
    }

    fn build_initializer(
        &mut self,
        cx: &mut PoolCx<'_>,
        constant: &Constant,
        id: ConstantId,
    ) -> Result<Vec<u8>> {
        let info = self.infos[id.0];
        let mut w = CodeWriter::new(&[], vec![ValType::Ref(info.ty)]);
        w.block(BlockType::Result(ValType::Ref(info.ty)));
        w.global_get(info.global.0, ValType::nullable_ref(info.ty.heap));
        w.br_on_non_null(&cx.module.types, 0)?;
        self.build_value(cx, &mut w, constant, Some(info.global))?;
        let tmp = w.add_local(ValType::Ref(info.ty));
        w.local_tee(&cx.module.types, tmp)?;
        w.global_set(
            &cx.module.types,
            info.global.0,
            ValType::nullable_ref(info.ty.heap),
        )?;
        w.local_get(tmp)?;
        w.end(&cx.module.types)?;
        w.finish(&cx.module.types)
    }

    /// Emit instructions producing a constant value. Heap constants other
    /// than the one currently being initialized are routed through their
    /// own pool entry.
    fn build_value(
        &mut self,
        cx: &mut PoolCx<'_>,
        w: &mut CodeWriter,
        constant: &Constant,
        own_global: Option<GlobalIdx>,
    ) -> Result<()> {
        match constant {
            Constant::Bool(value) => w.i32_const(i32::from(*value)),
            Constant::Int(value) => w.i64_const(*value),
            Constant::Double(bits) => w.f64_const(Constant::double_value(*bits)),
            Constant::Null => {
                return Err(Error::internal(
                    "null is not a pooled constant; emit it against its expected type",
                ));
            }
            Constant::String(text) => {
                let segment = self.string_segment(cx.module, text)?;
                let bytes = bytes_array(&mut cx.module.types)?;
                let string_class = cx.program.core.string;
                let string_struct = cx.layout.struct_of(string_class);
                let field_count = cx.layout.info(string_class).field_count;
                if field_count != 2 {
                    return Err(Error::codegen(
                        "the designated string class must declare exactly its byte payload",
                    ));
                }
                w.i32_const(cx.layout.runtime_id(string_class) as i32);
                w.i32_const(0);
                w.i32_const(text.len() as i32);
                w.array_new_data(&cx.module.types, bytes, segment.0)?;
                w.struct_new(&cx.module.types, string_struct)?;
            }
            Constant::List { elem, values } => {
                let storage = cx.layout.storage_type(
                    cx.program,
                    &mut cx.module.types,
                    cx.closures,
                    elem,
                )?;
                let array = cx.module.types.intern_array(crate::types::FieldType::mutable(storage))?;
                for value in values {
                    self.build_element(cx, w, value, elem)?;
                }
                w.array_new_fixed(&cx.module.types, array, values.len() as u32)?;
            }
            Constant::Instance { class, fields } => {
                let struct_type = cx.layout.struct_of(*class);
                let declared = cx.layout.info(*class).field_count - 1;
                if fields.len() != declared as usize {
                    return Err(Error::codegen(format!(
                        "instance constant for class {class} supplies {} fields, {declared} \
                         declared",
                        fields.len()
                    )));
                }
                w.struct_new_default(&cx.module.types, struct_type)?;
                let tmp = w.add_local(ValType::non_null_ref(HeapType::Def(struct_type)));
                w.local_tee(&cx.module.types, tmp)?;
                w.i32_const(cx.layout.runtime_id(*class) as i32);
                w.struct_set(&cx.module.types, struct_type, CLASS_ID_FIELD)?;
                if let Some(global) = own_global {
                    // Publish the placeholder before the fields settle so a
                    // self-referential constant reads it instead of
                    // re-entering the initializer.
                    w.local_get(tmp)?;
                    w.global_set(
                        &cx.module.types,
                        global.0,
                        ValType::nullable_ref(HeapType::Def(struct_type)),
                    )?;
                }
                for (index, value) in fields.iter().enumerate() {
                    w.local_get(tmp)?;
                    let field_index = 1 + index as u32;
                    let elem_ty = self.struct_field_ir_ty(cx, *class, index)?;
                    self.build_element(cx, w, value, &elem_ty)?;
                    w.struct_set(&cx.module.types, struct_type, field_index)?;
                }
                w.local_get(tmp)?;
            }
        }
        Ok(())
    }

    /// A list element or instance field: primitives inline, heap values via
    /// their own pool entry, nulls against the declared element type.
    fn build_element(
        &mut self,
        cx: &mut PoolCx<'_>,
        w: &mut CodeWriter,
        value: &Constant,
        declared: &IrType,
    ) -> Result<()> {
        match value {
            Constant::Bool(_) | Constant::Int(_) | Constant::Double(_) => {
                self.build_value(cx, w, value, None)
            }
            Constant::Null => {
                let ty = cx.layout.value_type(
                    cx.program,
                    &mut cx.module.types,
                    cx.closures,
                    &declared.as_nullable(),
                )?;
                match ty {
                    ValType::Ref(reference) => {
                        w.ref_null(reference.heap);
                        Ok(())
                    }
                    other => Err(Error::codegen(format!(
                        "null constant used where a {other} is declared"
                    ))),
                }
            }
            heap => {
                let id = self.intern(cx, heap)?;
                let info = self.infos[id.0];
                let sig = cx.module.func_sig(info.init_func)?.clone();
                w.call(&cx.module.types, info.init_func.0, &sig)?;
                Ok(())
            }
        }
    }

    fn struct_field_ir_ty(
        &self,
        cx: &PoolCx<'_>,
        class: crate::ir::ClassId,
        flat_index: usize,
    ) -> Result<IrType> {
        // Flattened field order: walk the superclass chain root-first.
        let mut chain: Vec<crate::ir::ClassId> = cx.program.superclass_chain(class).collect();
        chain.reverse();
        let mut remaining = flat_index;
        for link in chain {
            let fields = &cx.program.class(link).fields;
            if remaining < fields.len() {
                return Ok(fields[remaining].ty.clone());
            }
            remaining -= fields.len();
        }
        Err(Error::internal(format!(
            "instance constant field {flat_index} is out of range for {class}"
        )))
    }

    fn string_segment(&mut self, module: &mut ModuleBuilder, text: &str) -> Result<DataIdx> {
        if let Some(&segment) = self.string_segments.get(text) {
            return Ok(segment);
        }
        let segment = module.add_data(text.as_bytes().to_vec())?;
        self.string_segments.insert(text.to_string(), segment);
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ClassDef, ClassId, CoreClasses, FieldDef, MemberId};

    fn string_program() -> Program {
        Program {
            classes: vec![
                ClassDef {
                    name: "Object".into(),
                    superclass: None,
                    interfaces: Vec::new(),
                    is_abstract: false,
                    fields: Vec::new(),
                    members: Vec::new(),
                },
                ClassDef {
                    name: "String".into(),
                    superclass: Some(ClassId(0)),
                    interfaces: Vec::new(),
                    is_abstract: false,
                    fields: vec![FieldDef {
                        name: "bytes".into(),
                        ty: IrType::Bytes,
                        initializer: None,
                    }],
                    members: Vec::new(),
                },
            ],
            members: Vec::new(),
            statics: Vec::new(),
            imports: Vec::new(),
            core: CoreClasses {
                object: ClassId(0),
                boxed_int: ClassId(0),
                boxed_double: ClassId(0),
                boxed_bool: ClassId(0),
                string: ClassId(1),
            },
            entry: MemberId(0),
        }
    }

    fn pool_cx(program: &Program) -> (ClassLayout, ClosureRegistry, ModuleBuilder) {
        let mut module = ModuleBuilder::new();
        let mut closures = ClosureRegistry::new();
        let layout =
            ClassLayout::collect(program, &mut module.types, &mut closures).unwrap();
        (layout, closures, module)
    }

    #[test]
    fn equal_constants_share_one_global() {
        let program = string_program();
        let (layout, mut closures, mut module) = pool_cx(&program);
        let mut pool = ConstantPool::new(false);
        let list = Constant::List {
            elem: IrType::Int,
            values: vec![Constant::Int(1), Constant::Int(2), Constant::Int(3)],
        };
        let mut cx = PoolCx {
            program: &program,
            layout: &layout,
            closures: &mut closures,
            module: &mut module,
        };
        let a = pool.intern(&mut cx, &list).unwrap();
        let b = pool.intern(&mut cx, &list.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.info(a).global, pool.info(b).global);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn distinct_constants_never_alias() {
        let program = string_program();
        let (layout, mut closures, mut module) = pool_cx(&program);
        let mut pool = ConstantPool::new(false);
        let mut cx = PoolCx {
            program: &program,
            layout: &layout,
            closures: &mut closures,
            module: &mut module,
        };
        let a = pool
            .intern(
                &mut cx,
                &Constant::List {
                    elem: IrType::Int,
                    values: vec![Constant::Int(1)],
                },
            )
            .unwrap();
        let b = pool
            .intern(
                &mut cx,
                &Constant::List {
                    elem: IrType::Int,
                    values: vec![Constant::Int(2)],
                },
            )
            .unwrap();
        assert_ne!(a, b);
        assert_ne!(pool.info(a).global, pool.info(b).global);
    }

    #[test]
    fn string_payloads_share_data_segments() {
        let program = string_program();
        let (layout, mut closures, mut module) = pool_cx(&program);
        let mut pool = ConstantPool::new(false);
        let mut cx = PoolCx {
            program: &program,
            layout: &layout,
            closures: &mut closures,
            module: &mut module,
        };
        let a = pool
            .intern(&mut cx, &Constant::String("shared".into()))
            .unwrap();
        // A different constant embedding the same text reuses the segment.
        let b = pool
            .intern(
                &mut cx,
                &Constant::List {
                    elem: IrType::class(ClassId(1)),
                    values: vec![Constant::String("shared".into())],
                },
            )
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.string_segments.len(), 1);
    }

    #[test]
    fn nested_constants_are_interned_bottom_up() {
        let program = string_program();
        let (layout, mut closures, mut module) = pool_cx(&program);
        let mut pool = ConstantPool::new(false);
        let mut cx = PoolCx {
            program: &program,
            layout: &layout,
            closures: &mut closures,
            module: &mut module,
        };
        let inner = Constant::List {
            elem: IrType::Int,
            values: vec![Constant::Int(9)],
        };
        let outer = Constant::List {
            elem: IrType::array(IrType::Int),
            values: vec![inner.clone(), inner.clone()],
        };
        let outer_id = pool.intern(&mut cx, &outer).unwrap();
        let inner_id = pool.intern(&mut cx, &inner).unwrap();
        assert_ne!(outer_id, inner_id);
        // Outer was registered first, inner materialized during its build.
        assert_eq!(outer_id, ConstantId(0));
        assert_eq!(inner_id, ConstantId(1));
    }
}
