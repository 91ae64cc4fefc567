//! Class layout: runtime class ids, struct shapes, and representation types.
//!
//! One hierarchy traversal assigns every class a dense id in depth-first
//! preorder (the root object class gets id 0), derives its struct as a field
//! extension of the superclass's struct, and computes the representation
//! type used wherever a reference is polymorphic. Preorder ids make every
//! class's transitive subclasses a contiguous id range, which is what the
//! `is`-check lowering relies on.

use std::collections::BTreeMap;

use tracing::debug;

use crate::closures::ClosureRegistry;
use crate::error::{Error, Result};
use crate::ir::{ClassId, FieldRef, IrType, Program};
use crate::types::{FieldType, StorageType, StructType, TypeIdx, TypeStore, ValType};

/// Struct field index of the runtime class id in every object struct.
pub const CLASS_ID_FIELD: u32 = 0;

/// One source class's compiled layout. Immutable once the pass completes.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub class: ClassId,
    /// Dense runtime id, depth-first preorder over the hierarchy.
    pub class_id: u32,
    /// Distance from the root class.
    pub depth: u32,
    pub superclass: Option<ClassId>,
    /// The struct backing instances. Shared with the superclass when this
    /// class declares no additional fields; the sharing is identity, not a
    /// copy, and downstream subtype checks depend on it.
    pub struct_type: TypeIdx,
    /// Struct index where this class's own declared fields begin.
    pub field_base: u32,
    /// Total struct field count, class-id slot included.
    pub field_count: u32,
    /// Last runtime id in this class's subtree (inclusive).
    pub subtree_last: u32,
    /// Classes through which instances may be reached polymorphically:
    /// the class itself plus every class implementing it as an interface.
    pub implementers: Vec<ClassId>,
    /// The least common ancestor of all implementers; its struct is the
    /// static type used at polymorphic references.
    pub repr_class: ClassId,
}

/// The finished layout tables.
#[derive(Debug)]
pub struct ClassLayout {
    infos: Vec<ClassInfo>,
    /// Runtime class id -> IR class id.
    by_runtime_id: Vec<ClassId>,
}

impl ClassLayout {
    pub fn collect(
        program: &Program,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
    ) -> Result<Self> {
        let collector = Collector::new(program)?;
        let mut layout = collector.assign_ids()?;
        layout.compute_representations(program);
        layout.build_structs(program, types, closures)?;
        debug!(
            classes = layout.infos.len(),
            types = types.len(),
            "class layout complete"
        );
        Ok(layout)
    }

    pub fn info(&self, class: ClassId) -> &ClassInfo {
        &self.infos[class.0]
    }

    pub fn class_count(&self) -> usize {
        self.infos.len()
    }

    pub fn runtime_id(&self, class: ClassId) -> u32 {
        self.infos[class.0].class_id
    }

    /// IR classes ordered by runtime id.
    pub fn classes_in_id_order(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.by_runtime_id.iter().copied()
    }

    pub fn struct_of(&self, class: ClassId) -> TypeIdx {
        self.infos[class.0].struct_type
    }

    /// The struct used for references whose static type is `class`.
    pub fn repr_struct(&self, class: ClassId) -> TypeIdx {
        self.struct_of(self.infos[class.0].repr_class)
    }

    /// Struct field index for a resolved field reference.
    pub fn field_slot(&self, field: FieldRef) -> u32 {
        self.infos[field.class.0].field_base + field.index as u32
    }

    /// Merged, sorted runtime-id ranges an `is`-check against `class` must
    /// accept.
    pub fn id_ranges(&self, class: ClassId) -> Vec<(u32, u32)> {
        let info = &self.infos[class.0];
        let mut ranges: Vec<(u32, u32)> = info
            .implementers
            .iter()
            .map(|&c| {
                let ci = &self.infos[c.0];
                (ci.class_id, ci.subtree_last)
            })
            .collect();
        ranges.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::new();
        for (lo, hi) in ranges {
            match merged.last_mut() {
                Some((_, last_hi)) if lo <= last_hi.saturating_add(1) => {
                    *last_hi = (*last_hi).max(hi);
                }
                _ => merged.push((lo, hi)),
            }
        }
        merged
    }

    /// Map an IR value type onto a module value type.
    pub fn value_type(
        &self,
        program: &Program,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
        ty: &IrType,
    ) -> Result<ValType> {
        match ty {
            IrType::Void => Err(Error::codegen(
                "`void` has no value representation; it only types empty results",
            )),
            IrType::Bool => Ok(ValType::I32),
            IrType::Int => Ok(ValType::I64),
            IrType::Double => Ok(ValType::F64),
            IrType::Bytes => {
                let bytes = bytes_array(types)?;
                Ok(ref_to(bytes, false))
            }
            IrType::Array { elem, nullable } => {
                let storage = self.storage_type(program, types, closures, elem)?;
                let array = types.intern_array(FieldType::mutable(storage))?;
                Ok(ref_to(array, *nullable))
            }
            IrType::Class { class, nullable } => {
                Ok(ref_to(self.repr_struct(*class), *nullable))
            }
            IrType::Func {
                params,
                ret,
                nullable,
            } => {
                let shape = closures.shape(self, program, types, params, ret)?;
                Ok(ref_to(shape.closure_struct, *nullable))
            }
        }
    }

    /// Storage type for struct fields and array elements. References are
    /// stored nullable so `struct.new_default` stays available to the
    /// constructor protocol.
    pub fn storage_type(
        &self,
        program: &Program,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
        ty: &IrType,
    ) -> Result<StorageType> {
        let value = self.value_type(program, types, closures, ty)?;
        Ok(match value {
            ValType::Ref(reference) => {
                StorageType::Val(ValType::nullable_ref(reference.heap))
            }
            other => StorageType::Val(other),
        })
    }

    fn compute_representations(&mut self, program: &Program) {
        // Interface lists are assumed transitively closed by the front end.
        for (index, class) in program.classes.iter().enumerate() {
            for &interface in &class.interfaces {
                self.infos[interface.0].implementers.push(ClassId(index));
            }
        }
        for index in 0..self.infos.len() {
            let set = self.infos[index].implementers.clone();
            self.infos[index].repr_class = self.reduce_to_ancestor(set);
        }
    }

    /// Least-common-ancestor reduction over hierarchy depth: promote the
    /// deepest members to their parents until one class remains.
    fn reduce_to_ancestor(&self, mut set: Vec<ClassId>) -> ClassId {
        set.sort_unstable();
        set.dedup();
        while set.len() > 1 {
            let deepest = set
                .iter()
                .map(|&c| self.infos[c.0].depth)
                .max()
                .unwrap_or(0);
            for entry in &mut set {
                if self.infos[entry.0].depth == deepest {
                    if let Some(parent) = self.infos[entry.0].superclass {
                        *entry = parent;
                    }
                }
            }
            set.sort_unstable();
            set.dedup();
        }
        set[0]
    }

    fn build_structs(
        &mut self,
        program: &Program,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
    ) -> Result<()> {
        // Reserve indices first so fields can reference any class,
        // including ones later in id order.
        for rt_id in 0..self.by_runtime_id.len() {
            let class = self.by_runtime_id[rt_id];
            let def = program.class(class);
            let shares_super = def.fields.is_empty() && def.superclass.is_some();
            let idx = if shares_super {
                let superclass = self.infos[class.0]
                    .superclass
                    .ok_or_else(|| Error::internal("sharing class lost its superclass"))?;
                self.infos[superclass.0].struct_type
            } else {
                types.reserve_struct()?
            };
            self.infos[class.0].struct_type = idx;
        }

        for rt_id in 0..self.by_runtime_id.len() {
            let class = self.by_runtime_id[rt_id];
            let def = program.class(class);
            let (field_base, mut fields, supertype) = match self.infos[class.0].superclass {
                Some(superclass) => {
                    let super_info = &self.infos[superclass.0];
                    let super_struct = types.struct_type(super_info.struct_type)?;
                    (
                        super_info.field_count,
                        super_struct.fields.clone(),
                        Some(super_info.struct_type),
                    )
                }
                None => (
                    1,
                    vec![FieldType::mutable(StorageType::Val(ValType::I32))],
                    None,
                ),
            };
            self.infos[class.0].field_base = field_base;
            self.infos[class.0].field_count = field_base + def.fields.len() as u32;
            if def.fields.is_empty() && def.superclass.is_some() {
                // Shares the superclass's struct; nothing to define.
                continue;
            }
            for field in &def.fields {
                let storage = self
                    .storage_type(program, types, closures, &field.ty)
                    .map_err(|_| {
                        Error::codegen(format!(
                            "field `{}.{}` has type `{}`, which has no storable lowering",
                            def.name, field.name, field.ty
                        ))
                    })?;
                fields.push(FieldType::mutable(storage));
            }
            types.define_struct(
                self.infos[class.0].struct_type,
                StructType { fields },
                supertype,
            )?;
        }
        Ok(())
    }
}

fn ref_to(idx: TypeIdx, nullable: bool) -> ValType {
    if nullable {
        ValType::nullable_ref(crate::types::HeapType::Def(idx))
    } else {
        ValType::non_null_ref(crate::types::HeapType::Def(idx))
    }
}

/// The interned i8 array type backing string payloads.
pub fn bytes_array(types: &mut TypeStore) -> Result<TypeIdx> {
    types.intern_array(FieldType::immutable(StorageType::I8))
}

struct Collector<'a> {
    program: &'a Program,
    children: Vec<Vec<ClassId>>,
}

impl<'a> Collector<'a> {
    fn new(program: &'a Program) -> Result<Self> {
        let root = program.core.object;
        if program.class(root).superclass.is_some() {
            return Err(Error::codegen(
                "the designated root class must not declare a superclass",
            ));
        }
        let mut children: Vec<Vec<ClassId>> = vec![Vec::new(); program.classes.len()];
        for (index, class) in program.classes.iter().enumerate() {
            let id = ClassId(index);
            if id == root {
                continue;
            }
            // Classes without an explicit superclass hang off the root.
            let parent = class.superclass.unwrap_or(root);
            children[parent.0].push(id);
        }
        Ok(Self { program, children })
    }

    fn assign_ids(&self) -> Result<ClassLayout> {
        let class_count = self.program.classes.len();
        let mut infos: Vec<Option<ClassInfo>> = vec![None; class_count];
        let mut by_runtime_id = Vec::with_capacity(class_count);

        // Iterative preorder: (class, depth), children pushed in reverse so
        // declaration order wins.
        let mut stack = vec![(self.program.core.object, 0u32)];
        while let Some((class, depth)) = stack.pop() {
            let class_id = by_runtime_id.len() as u32;
            by_runtime_id.push(class);
            infos[class.0] = Some(ClassInfo {
                class,
                class_id,
                depth,
                superclass: if class == self.program.core.object {
                    None
                } else {
                    Some(
                        self.program
                            .class(class)
                            .superclass
                            .unwrap_or(self.program.core.object),
                    )
                },
                struct_type: TypeIdx(u32::MAX),
                field_base: 0,
                field_count: 0,
                subtree_last: class_id,
                implementers: vec![class],
                repr_class: class,
            });
            for &child in self.children[class.0].iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        if by_runtime_id.len() != class_count {
            return Err(Error::codegen(
                "class hierarchy is not a tree rooted at the designated root class",
            ));
        }

        let mut infos: Vec<ClassInfo> = infos
            .into_iter()
            .map(|info| info.ok_or_else(|| Error::internal("class missing from traversal")))
            .collect::<Result<_>>()?;

        // A class's subtree ends where the next id at the same or shallower
        // depth begins; walk runtime ids backwards propagating the maximum
        // into each ancestor chain.
        let mut last_by_class: BTreeMap<usize, u32> = BTreeMap::new();
        for &class in &by_runtime_id {
            let id = infos[class.0].class_id;
            let mut current = Some(class);
            while let Some(c) = current {
                last_by_class
                    .entry(c.0)
                    .and_modify(|v| *v = (*v).max(id))
                    .or_insert(id);
                current = infos[c.0].superclass;
            }
        }
        for (class, last) in last_by_class {
            infos[class].subtree_last = last;
        }

        Ok(ClassLayout {
            infos,
            by_runtime_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ClassDef, CoreClasses, MemberId};

    fn class(name: &str, superclass: Option<usize>) -> ClassDef {
        ClassDef {
            name: name.into(),
            superclass: superclass.map(ClassId),
            interfaces: Vec::new(),
            is_abstract: false,
            fields: Vec::new(),
            members: Vec::new(),
        }
    }

    fn field(name: &str, ty: IrType) -> crate::ir::FieldDef {
        crate::ir::FieldDef {
            name: name.into(),
            ty,
            initializer: None,
        }
    }

    fn program(classes: Vec<ClassDef>) -> Program {
        Program {
            classes,
            members: Vec::new(),
            statics: Vec::new(),
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

    fn collect(program: &Program) -> (ClassLayout, TypeStore) {
        let mut types = TypeStore::new();
        let mut closures = ClosureRegistry::new();
        let layout = ClassLayout::collect(program, &mut types, &mut closures).unwrap();
        (layout, types)
    }

    #[test]
    fn ids_are_dense_and_subtrees_contiguous() {
        // object(0) -> a, b; a -> c. Declaration order: object, a, b, c.
        let mut classes = vec![
            class("Object", None),
            class("A", Some(0)),
            class("B", Some(0)),
            class("C", Some(1)),
        ];
        classes[1].fields.push(field("x", IrType::Int));
        let program = program(classes);
        let (layout, _) = collect(&program);

        assert_eq!(layout.runtime_id(ClassId(0)), 0);
        // Preorder: object, A, C, B.
        assert_eq!(layout.runtime_id(ClassId(1)), 1);
        assert_eq!(layout.runtime_id(ClassId(3)), 2);
        assert_eq!(layout.runtime_id(ClassId(2)), 3);
        // A's subtree covers [1, 2].
        assert_eq!(layout.info(ClassId(1)).subtree_last, 2);
        assert_eq!(layout.id_ranges(ClassId(1)), vec![(1, 2)]);
    }

    #[test]
    fn subclass_struct_extends_superclass_fields() {
        let mut classes = vec![class("Object", None), class("A", Some(0)), class("B", Some(1))];
        classes[1].fields.push(field("x", IrType::Int));
        classes[2].fields.push(field("y", IrType::Double));
        let program = program(classes);
        let (layout, types) = collect(&program);

        let a = types.struct_type(layout.struct_of(ClassId(1))).unwrap();
        let b = types.struct_type(layout.struct_of(ClassId(2))).unwrap();
        assert_eq!(a.fields.len(), 2); // class id + x
        assert_eq!(b.fields.len(), 3); // class id + x + y
        assert_eq!(&b.fields[..2], &a.fields[..]);
        assert_eq!(layout.field_slot(FieldRef { class: ClassId(2), index: 0 }), 2);
    }

    #[test]
    fn fieldless_subclass_shares_the_superclass_struct() {
        let mut classes = vec![class("Object", None), class("A", Some(0)), class("B", Some(1))];
        classes[1].fields.push(field("x", IrType::Int));
        let program = program(classes);
        let (layout, _) = collect(&program);
        assert_eq!(layout.struct_of(ClassId(2)), layout.struct_of(ClassId(1)));
    }

    #[test]
    fn representation_reduces_to_common_ancestor() {
        // I is an interface implemented by A and B, siblings under object.
        let mut classes = vec![
            class("Object", None),
            class("I", Some(0)),
            class("A", Some(0)),
            class("B", Some(0)),
        ];
        classes[2].interfaces.push(ClassId(1));
        classes[3].interfaces.push(ClassId(1));
        let program = program(classes);
        let (layout, _) = collect(&program);
        assert_eq!(layout.info(ClassId(1)).repr_class, ClassId(0));
        // A concrete class with no implementers represents itself.
        assert_eq!(layout.info(ClassId(2)).repr_class, ClassId(2));
    }

    #[test]
    fn interface_is_check_unions_implementer_ranges() {
        let mut classes = vec![
            class("Object", None),
            class("I", Some(0)),
            class("A", Some(0)),
            class("B", Some(0)),
        ];
        classes[2].interfaces.push(ClassId(1));
        classes[3].interfaces.push(ClassId(1));
        let program = program(classes);
        let (layout, _) = collect(&program);
        // Preorder ids: object=0, I=1, A=2, B=3. A and B merge with I's own
        // range into [1, 3].
        assert_eq!(layout.id_ranges(ClassId(1)), vec![(1, 3)]);
    }

    #[test]
    fn unmappable_field_type_is_fatal() {
        let mut classes = vec![class("Object", None), class("A", Some(0))];
        classes[1].fields.push(field("bad", IrType::Void));
        let program = program(classes);
        let mut types = TypeStore::new();
        let mut closures = ClosureRegistry::new();
        let err = ClassLayout::collect(&program, &mut types, &mut closures).unwrap_err();
        assert!(err.to_string().contains("no storable lowering"), "{err}");
    }
}
