//! Dispatch-table construction.
//!
//! Every virtual selector (method, getter, or setter identity) gets a
//! contiguous row of table slots indexed by runtime class id, with
//! inheritance-driven slot reuse: a class that does not override a selector
//! repeats its nearest ancestor's entry. Offsets are assigned linearly, one
//! row after another, with no overlap elimination; `offset + class_id`
//! uniquely names a slot.
//!
//! The alternative polymorphic-specialization lowering partitions a
//! selector's `(class id, implementation)` pairs into an explicit branch
//! tree. When the sorted id runs per implementation cannot be split by a
//! single pivot, the builder falls back to the indirect path for that
//! selector instead of emitting wrong dispatch code.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::closures::ClosureRegistry;
use crate::error::{Error, Result};
use crate::ir::{MemberDef, MemberId, MemberKind, ParameterInfo, Program};
use crate::layout::ClassLayout;
use crate::types::{FuncType, HeapType, TypeIdx, TypeStore, ValType};

/// Index into [`DispatchTables::selectors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectorId(pub usize);

/// The dispatch identity of a member, independent of the declaring class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectorKey {
    pub name: String,
    pub kind: MemberKind,
    pub arity: usize,
}

impl SelectorKey {
    pub fn of(member: &MemberDef) -> Self {
        Self {
            name: member.name.clone(),
            kind: member.kind,
            arity: member.params.len(),
        }
    }
}

/// One selector's compiled dispatch row. Read-only after the build pass.
#[derive(Debug)]
pub struct SelectorInfo {
    pub key: SelectorKey,
    /// The merged signature every implementation is compiled against.
    pub signature: FuncType,
    pub type_index: TypeIdx,
    pub params: ParameterInfo,
    /// Runtime class id -> most-derived implementation reachable from it.
    pub targets: BTreeMap<u32, MemberId>,
    /// `offset + class_id` is the table slot; negative offsets arise when a
    /// row starts above slot zero.
    pub offset: i64,
}

impl SelectorInfo {
    pub fn first_class_id(&self) -> Option<u32> {
        self.targets.keys().next().copied()
    }

    pub fn last_class_id(&self) -> Option<u32> {
        self.targets.keys().next_back().copied()
    }

    /// The single implementation, when static analysis can prove only one
    /// is reachable.
    pub fn single_target(&self) -> Option<MemberId> {
        let mut targets = self.targets.values();
        let first = *targets.next()?;
        targets.all(|&m| m == first).then_some(first)
    }
}

/// An explicit branch tree over the receiver's class id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTree {
    Call(MemberId),
    IfEq {
        class_id: u32,
        target: MemberId,
        otherwise: Box<DispatchTree>,
    },
    /// `class_id < pivot` goes low, the rest go high.
    Split {
        pivot: u32,
        low: Box<DispatchTree>,
        high: Box<DispatchTree>,
    },
}

/// The finished dispatch tables.
#[derive(Debug)]
pub struct DispatchTables {
    selectors: Vec<SelectorInfo>,
    by_member: HashMap<MemberId, SelectorId>,
    pub table_size: usize,
}

impl DispatchTables {
    pub fn build(
        program: &Program,
        layout: &ClassLayout,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
    ) -> Result<Self> {
        let mut builder = Builder {
            program,
            layout,
            selectors: Vec::new(),
            by_key: HashMap::new(),
            by_member: HashMap::new(),
            class_rows: vec![HashMap::new(); program.classes.len()],
        };
        builder.collect(types, closures)?;
        let mut tables = DispatchTables {
            selectors: builder.selectors,
            by_member: builder.by_member,
            table_size: 0,
        };
        tables.assign_offsets();
        debug!(
            selectors = tables.selectors.len(),
            slots = tables.table_size,
            "dispatch tables complete"
        );
        Ok(tables)
    }

    fn assign_offsets(&mut self) {
        let mut size: i64 = 0;
        for selector in &mut self.selectors {
            let (Some(first), Some(last)) =
                (selector.first_class_id(), selector.last_class_id())
            else {
                continue;
            };
            selector.offset = size - i64::from(first);
            size += i64::from(last) - i64::from(first) + 1;
        }
        self.table_size = size as usize;
    }

    pub fn selectors(&self) -> &[SelectorInfo] {
        &self.selectors
    }

    pub fn selector(&self, id: SelectorId) -> &SelectorInfo {
        &self.selectors[id.0]
    }

    /// The selector a virtual member participates in.
    pub fn selector_of(&self, member: MemberId) -> Option<SelectorId> {
        self.by_member.get(&member).copied()
    }

    /// The implementation `table[offset + class_id]` routes to.
    pub fn target_for(&self, id: SelectorId, class_id: u32) -> Option<MemberId> {
        self.selectors[id.0].targets.get(&class_id).copied()
    }

    /// Build the specialization branch tree for one selector, or `None`
    /// when the id runs are not pivot-splittable and dispatch must stay
    /// indirect.
    pub fn specialization_tree(&self, id: SelectorId) -> Option<DispatchTree> {
        let selector = &self.selectors[id.0];
        let pairs: Vec<(u32, MemberId)> = selector
            .targets
            .iter()
            .map(|(&class_id, &member)| (class_id, member))
            .collect();
        match build_tree(&pairs) {
            Some(tree) => Some(tree),
            None => {
                warn!(
                    selector = selector.key.name.as_str(),
                    "implementation id runs are not contiguous; selector stays on the \
                     indirect path"
                );
                None
            }
        }
    }
}

fn build_tree(pairs: &[(u32, MemberId)]) -> Option<DispatchTree> {
    let mut counts: BTreeMap<MemberId, usize> = BTreeMap::new();
    for &(_, member) in pairs {
        *counts.entry(member).or_insert(0) += 1;
    }
    if counts.len() == 1 {
        return Some(DispatchTree::Call(pairs[0].1));
    }
    // (a) peel off implementations used by exactly one class id.
    if let Some(&(class_id, member)) = pairs
        .iter()
        .find(|(_, member)| counts[member] == 1)
    {
        let rest: Vec<(u32, MemberId)> = pairs
            .iter()
            .copied()
            .filter(|&(id, _)| id != class_id)
            .collect();
        return Some(DispatchTree::IfEq {
            class_id,
            target: member,
            otherwise: Box::new(build_tree(&rest)?),
        });
    }
    // (b) split at the first implementation change, provided every
    // implementation's ids land entirely on one side.
    let pivot_pos = pairs.windows(2).position(|w| w[0].1 != w[1].1)? + 1;
    let pivot = pairs[pivot_pos].0;
    let (low, high) = pairs.split_at(pivot_pos);
    let low_members: Vec<MemberId> = low.iter().map(|&(_, m)| m).collect();
    if high.iter().any(|(_, m)| low_members.contains(m)) {
        // An implementation straddles the pivot; contiguity does not hold.
        return None;
    }
    Some(DispatchTree::Split {
        pivot,
        low: Box::new(build_tree(low)?),
        high: Box::new(build_tree(high)?),
    })
}

struct Builder<'a> {
    program: &'a Program,
    layout: &'a ClassLayout,
    selectors: Vec<SelectorInfo>,
    by_key: HashMap<SelectorKey, SelectorId>,
    by_member: HashMap<MemberId, SelectorId>,
    /// Per IR class: selector -> implementation visible on that class.
    class_rows: Vec<HashMap<SelectorId, MemberId>>,
}

impl<'a> Builder<'a> {
    fn collect(&mut self, types: &mut TypeStore, closures: &mut ClosureRegistry) -> Result<()> {
        // Runtime-id order guarantees the superclass's row is complete
        // before any subclass inherits it.
        let classes: Vec<_> = self.layout.classes_in_id_order().collect();
        for class in classes {
            let mut row = match self.program.class(class).superclass.or_else(|| {
                self.layout.info(class).superclass
            }) {
                Some(superclass) => self.class_rows[superclass.0].clone(),
                None => HashMap::new(),
            };
            for &member_id in &self.program.class(class).members {
                let member = self.program.member(member_id);
                if !member.is_virtual() {
                    continue;
                }
                let selector_id = self.intern_selector(member_id, types, closures)?;
                self.by_member.insert(member_id, selector_id);
                if member.is_abstract {
                    continue;
                }
                row.insert(selector_id, member_id);
            }
            let class_id = self.layout.runtime_id(class);
            if !self.program.class(class).is_abstract {
                for (&selector_id, &member_id) in &row {
                    self.selectors[selector_id.0]
                        .targets
                        .insert(class_id, member_id);
                }
            }
            self.class_rows[class.0] = row;
        }
        Ok(())
    }

    fn intern_selector(
        &mut self,
        member_id: MemberId,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
    ) -> Result<SelectorId> {
        let member = self.program.member(member_id);
        let key = SelectorKey::of(member);
        if let Some(&existing) = self.by_key.get(&key) {
            let info = ParameterInfo::from_member(member);
            if self.selectors[existing.0].params.named.keys().ne(info.named.keys()) {
                return Err(Error::codegen(format!(
                    "selector `{}` has overriders with differing named parameter sets",
                    key.name
                )));
            }
            let merged = self.selectors[existing.0]
                .params
                .merge(&info, &key.name)?;
            self.selectors[existing.0].params = merged;
            return Ok(existing);
        }

        let signature = self.selector_signature(member, types, closures)?;
        let type_index = types.intern_func(signature.clone())?;
        let id = SelectorId(self.selectors.len());
        self.selectors.push(SelectorInfo {
            key: key.clone(),
            signature,
            type_index,
            params: ParameterInfo::from_member(member),
            targets: BTreeMap::new(),
            offset: 0,
        });
        self.by_key.insert(key, id);
        Ok(id)
    }

    /// The merged signature of a selector: the receiver travels as the
    /// root object struct and every implementation re-narrows it in its
    /// prologue.
    fn selector_signature(
        &self,
        member: &MemberDef,
        types: &mut TypeStore,
        closures: &mut ClosureRegistry,
    ) -> Result<FuncType> {
        let object = self.layout.struct_of(self.program.core.object);
        let mut params = vec![ValType::nullable_ref(HeapType::Def(object))];
        for param in member.params.iter() {
            params.push(
                self.layout
                    .value_type(self.program, types, closures, &param.ty)?,
            );
        }
        // Named parameters occupy slots in name order, matching the merged
        // ParameterInfo at every call site.
        let mut named: Vec<&crate::ir::ParamDef> = member.named_params.iter().collect();
        named.sort_by(|a, b| a.name.cmp(&b.name));
        for param in named {
            params.push(
                self.layout
                    .value_type(self.program, types, closures, &param.ty)?,
            );
        }
        let results = if member.return_ty.is_void() {
            Vec::new()
        } else {
            vec![self
                .layout
                .value_type(self.program, types, closures, &member.return_ty)?]
        };
        Ok(FuncType { params, results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Body, ClassDef, ClassId, CoreClasses, IrType, ParamDef, Program, Stmt};

    fn method(name: &str, owner: usize, is_abstract: bool) -> MemberDef {
        MemberDef {
            name: name.into(),
            owner: Some(ClassId(owner)),
            kind: MemberKind::Method,
            params: Vec::new(),
            named_params: Vec::new(),
            return_ty: IrType::Int,
            body: (!is_abstract).then(|| {
                let mut body = Body::new(Vec::new(), 0);
                let value = body.add_expr(crate::ir::Expr::IntLit(0));
                body.stmts = vec![Stmt::Return(Some(value))];
                body
            }),
            is_abstract,
            import: None,
        }
    }

    fn class(name: &str, superclass: Option<usize>, members: Vec<usize>) -> ClassDef {
        ClassDef {
            name: name.into(),
            superclass: superclass.map(ClassId),
            interfaces: Vec::new(),
            is_abstract: false,
            fields: Vec::new(),
            members: members.into_iter().map(MemberId).collect(),
        }
    }

    /// Object(0); Animal(1) { speak m0 }; Dog(2): Animal { speak m1 };
    /// Cat(3): Animal.
    fn animals() -> Program {
        Program {
            classes: vec![
                class("Object", None, vec![]),
                class("Animal", Some(0), vec![0]),
                class("Dog", Some(1), vec![1]),
                class("Cat", Some(1), vec![]),
            ],
            members: vec![method("speak", 1, false), method("speak", 2, false)],
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

    fn build(program: &Program) -> (DispatchTables, ClassLayout) {
        let mut types = TypeStore::new();
        let mut closures = ClosureRegistry::new();
        let layout = ClassLayout::collect(program, &mut types, &mut closures).unwrap();
        let tables =
            DispatchTables::build(program, &layout, &mut types, &mut closures).unwrap();
        (tables, layout)
    }

    #[test]
    fn table_routes_to_most_derived_implementation() {
        let program = animals();
        let (tables, layout) = build(&program);
        let selector_id = tables.selector_of(MemberId(0)).unwrap();
        let selector = tables.selector(selector_id);

        let animal = layout.runtime_id(ClassId(1));
        let dog = layout.runtime_id(ClassId(2));
        let cat = layout.runtime_id(ClassId(3));
        assert_eq!(tables.target_for(selector_id, animal), Some(MemberId(0)));
        assert_eq!(tables.target_for(selector_id, dog), Some(MemberId(1)));
        // Cat inherits Animal's slot value.
        assert_eq!(tables.target_for(selector_id, cat), Some(MemberId(0)));
        // The row covers the contiguous [first, last] class id range.
        assert_eq!(selector.first_class_id(), Some(animal));
        assert_eq!(selector.last_class_id(), Some(cat.max(dog)));
    }

    #[test]
    fn overriders_share_one_selector() {
        let program = animals();
        let (tables, _) = build(&program);
        assert_eq!(
            tables.selector_of(MemberId(0)),
            tables.selector_of(MemberId(1))
        );
        assert_eq!(tables.selectors().len(), 1);
    }

    #[test]
    fn slots_are_offset_plus_class_id() {
        let program = animals();
        let (tables, layout) = build(&program);
        let selector_id = tables.selector_of(MemberId(0)).unwrap();
        let selector = tables.selector(selector_id);
        let first = selector.first_class_id().unwrap();
        let last = selector.last_class_id().unwrap();
        assert_eq!(selector.offset + i64::from(first), 0);
        assert_eq!(
            tables.table_size,
            (last - first + 1) as usize,
            "one row, no overlap elimination"
        );
        let _ = layout;
    }

    #[test]
    fn single_implementation_is_devirtualizable() {
        let mut program = animals();
        // Remove Dog's override; only Animal.speak remains.
        program.classes[2].members.clear();
        program.members.truncate(1);
        let (tables, _) = build(&program);
        let selector_id = tables.selector_of(MemberId(0)).unwrap();
        assert_eq!(
            tables.selector(selector_id).single_target(),
            Some(MemberId(0))
        );
    }

    #[test]
    fn specialization_tree_peels_singletons_then_splits() {
        let program = animals();
        let (tables, layout) = build(&program);
        let selector_id = tables.selector_of(MemberId(0)).unwrap();
        let tree = tables.specialization_tree(selector_id).unwrap();
        // Dog's override covers exactly one class id, so it peels off as an
        // equality branch before any split.
        let dog = layout.runtime_id(ClassId(2));
        match tree {
            DispatchTree::IfEq {
                class_id, target, ..
            } => {
                assert_eq!(class_id, dog);
                assert_eq!(target, MemberId(1));
            }
            other => panic!("expected IfEq at the root, got {other:?}"),
        }
    }

    #[test]
    fn non_contiguous_runs_fall_back_to_indirect() {
        // Hand-built pairs: implementation m0 at ids 1 and 3, m1 at id 2,
        // m1 again at 4 — m0 straddles every possible pivot.
        let pairs = vec![
            (1, MemberId(0)),
            (2, MemberId(1)),
            (3, MemberId(0)),
            (4, MemberId(1)),
        ];
        assert_eq!(super::build_tree(&pairs), None);
    }

    #[test]
    fn conflicting_defaults_across_overriders_are_reported() {
        let mut program = animals();
        program.members[0].params.push(ParamDef {
            name: "x".into(),
            ty: IrType::Int,
            default: Some(crate::ir::Constant::Int(1)),
        });
        program.members[1].params.push(ParamDef {
            name: "x".into(),
            ty: IrType::Int,
            default: Some(crate::ir::Constant::Int(2)),
        });
        let mut types = TypeStore::new();
        let mut closures = ClosureRegistry::new();
        let layout = ClassLayout::collect(&program, &mut types, &mut closures).unwrap();
        let err = DispatchTables::build(&program, &layout, &mut types, &mut closures)
            .unwrap_err();
        assert!(err.to_string().contains("incompatible default"), "{err}");
    }
}
