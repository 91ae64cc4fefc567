//! The binary module's type universe.
//!
//! Numeric types, nullable/non-nullable references into the GC heap, and
//! defined struct/array/function types with a declared (nominal) supertype
//! relation. Subtype queries walk the declared chain first and fall back to
//! a structural check, which is what lets a subclass that shares its
//! superclass's struct satisfy both classes' reference types.

use std::collections::HashMap;
use std::fmt;

use crate::encoding::{ensure_u32, write_s33, write_u32};
use crate::error::{Error, Result};

/// Index into the module's defined-type list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeIdx(pub u32);

impl fmt::Display for TypeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumType {
    I32,
    I64,
    F32,
    F64,
}

impl NumType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            NumType::I32 => 0x7F,
            NumType::I64 => 0x7E,
            NumType::F32 => 0x7D,
            NumType::F64 => 0x7C,
        }
    }
}

/// A heap type: one of the abstract hierarchy points or a defined type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    Func,
    Extern,
    Any,
    Eq,
    I31,
    Struct,
    Array,
    None,
    NoFunc,
    Def(TypeIdx),
}

impl HeapType {
    pub(crate) fn encode(self, buf: &mut Vec<u8>) {
        match self {
            HeapType::NoFunc => buf.push(0x73),
            HeapType::None => buf.push(0x71),
            HeapType::Func => buf.push(0x70),
            HeapType::Extern => buf.push(0x6F),
            HeapType::Any => buf.push(0x6E),
            HeapType::Eq => buf.push(0x6D),
            HeapType::I31 => buf.push(0x6C),
            HeapType::Struct => buf.push(0x6B),
            HeapType::Array => buf.push(0x6A),
            HeapType::Def(idx) => write_s33(buf, i64::from(idx.0)),
        }
    }
}

impl fmt::Display for HeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapType::Func => f.write_str("func"),
            HeapType::Extern => f.write_str("extern"),
            HeapType::Any => f.write_str("any"),
            HeapType::Eq => f.write_str("eq"),
            HeapType::I31 => f.write_str("i31"),
            HeapType::Struct => f.write_str("struct"),
            HeapType::Array => f.write_str("array"),
            HeapType::None => f.write_str("none"),
            HeapType::NoFunc => f.write_str("nofunc"),
            HeapType::Def(idx) => write!(f, "{idx}"),
        }
    }
}

/// A reference value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefType {
    pub nullable: bool,
    pub heap: HeapType,
}

impl RefType {
    pub fn nullable(heap: HeapType) -> Self {
        Self {
            nullable: true,
            heap,
        }
    }

    pub fn non_null(heap: HeapType) -> Self {
        Self {
            nullable: false,
            heap,
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "(ref null {})", self.heap)
        } else {
            write!(f, "(ref {})", self.heap)
        }
    }
}

/// A value type: what locals, stack slots, and function signatures carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    Num(NumType),
    Ref(RefType),
}

impl ValType {
    pub const I32: ValType = ValType::Num(NumType::I32);
    pub const I64: ValType = ValType::Num(NumType::I64);
    pub const F32: ValType = ValType::Num(NumType::F32);
    pub const F64: ValType = ValType::Num(NumType::F64);

    pub fn nullable_ref(heap: HeapType) -> Self {
        ValType::Ref(RefType::nullable(heap))
    }

    pub fn non_null_ref(heap: HeapType) -> Self {
        ValType::Ref(RefType::non_null(heap))
    }

    pub(crate) fn encode(self, buf: &mut Vec<u8>) {
        match self {
            ValType::Num(num) => buf.push(num.to_byte()),
            ValType::Ref(reference) => {
                buf.push(if reference.nullable { 0x63 } else { 0x64 });
                reference.heap.encode(buf);
            }
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::Num(NumType::I32) => f.write_str("i32"),
            ValType::Num(NumType::I64) => f.write_str("i64"),
            ValType::Num(NumType::F32) => f.write_str("f32"),
            ValType::Num(NumType::F64) => f.write_str("f64"),
            ValType::Ref(reference) => write!(f, "{reference}"),
        }
    }
}

/// A field/element storage type; packed forms widen to i32 on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    Val(ValType),
    I8,
    I16,
}

impl StorageType {
    /// The value type a load of this storage produces.
    pub fn unpacked(self) -> ValType {
        match self {
            StorageType::Val(ty) => ty,
            StorageType::I8 | StorageType::I16 => ValType::I32,
        }
    }

    pub fn is_packed(self) -> bool {
        matches!(self, StorageType::I8 | StorageType::I16)
    }

    fn encode(self, buf: &mut Vec<u8>) {
        match self {
            StorageType::Val(ty) => ty.encode(buf),
            StorageType::I8 => buf.push(0x78),
            StorageType::I16 => buf.push(0x77),
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Val(ty) => write!(f, "{ty}"),
            StorageType::I8 => f.write_str("i8"),
            StorageType::I16 => f.write_str("i16"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldType {
    pub storage: StorageType,
    pub mutable: bool,
}

impl FieldType {
    pub fn mutable(storage: StorageType) -> Self {
        Self {
            storage,
            mutable: true,
        }
    }

    pub fn immutable(storage: StorageType) -> Self {
        Self {
            storage,
            mutable: false,
        }
    }

    fn encode(self, buf: &mut Vec<u8>) {
        self.storage.encode(buf);
        buf.push(if self.mutable { 0x01 } else { 0x00 });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StructType {
    pub fields: Vec<FieldType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayType {
    pub elem: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CompositeType {
    Struct(StructType),
    Array(ArrayType),
    Func(FuncType),
}

/// One defined type: a composite plus its declared supertype.
#[derive(Debug, Clone)]
pub struct SubType {
    pub composite: CompositeType,
    pub supertype: Option<TypeIdx>,
    pub is_final: bool,
}

/// Append-only list of defined types with interning for the structural
/// kinds (function and array types); struct types are nominal and never
/// deduplicated.
#[derive(Debug, Default)]
pub struct TypeStore {
    types: Vec<SubType>,
    func_index: HashMap<FuncType, TypeIdx>,
    array_index: HashMap<ArrayType, TypeIdx>,
}

impl TypeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, idx: TypeIdx) -> &SubType {
        &self.types[idx.0 as usize]
    }

    fn push(&mut self, ty: SubType) -> Result<TypeIdx> {
        let idx = TypeIdx(ensure_u32(
            self.types.len(),
            "defined type count exceeds WebAssembly limits",
        )?);
        self.types.push(ty);
        Ok(idx)
    }

    /// Declare a new struct type. Struct identity is nominal, so every call
    /// produces a fresh index even for an identical shape.
    pub fn add_struct(&mut self, ty: StructType, supertype: Option<TypeIdx>) -> Result<TypeIdx> {
        self.push(SubType {
            composite: CompositeType::Struct(ty),
            supertype,
            is_final: false,
        })
    }

    /// Reserve an index for a struct whose shape arrives later. Reservation
    /// is what lets mutually-referential structs name each other: both get
    /// indices first, then both get defined.
    pub fn reserve_struct(&mut self) -> Result<TypeIdx> {
        self.push(SubType {
            composite: CompositeType::Struct(StructType::default()),
            supertype: None,
            is_final: false,
        })
    }

    /// Fill in a reserved struct. Each reservation is defined exactly once.
    pub fn define_struct(
        &mut self,
        idx: TypeIdx,
        ty: StructType,
        supertype: Option<TypeIdx>,
    ) -> Result<()> {
        let slot = self
            .types
            .get_mut(idx.0 as usize)
            .ok_or_else(|| Error::internal(format!("no reserved type at {idx}")))?;
        match &slot.composite {
            CompositeType::Struct(existing) if existing.fields.is_empty() => {
                slot.composite = CompositeType::Struct(ty);
                slot.supertype = supertype;
                Ok(())
            }
            _ => Err(Error::internal(format!(
                "type {idx} is already defined and cannot be redefined"
            ))),
        }
    }

    /// Intern a function type; repeated signatures share one index so that
    /// `call_indirect` type checks line up across call sites.
    pub fn intern_func(&mut self, ty: FuncType) -> Result<TypeIdx> {
        if let Some(&idx) = self.func_index.get(&ty) {
            return Ok(idx);
        }
        let idx = self.push(SubType {
            composite: CompositeType::Func(ty.clone()),
            supertype: None,
            is_final: true,
        })?;
        self.func_index.insert(ty, idx);
        Ok(idx)
    }

    /// Intern an array type keyed by its element field type.
    pub fn intern_array(&mut self, elem: FieldType) -> Result<TypeIdx> {
        let ty = ArrayType { elem };
        if let Some(&idx) = self.array_index.get(&ty) {
            return Ok(idx);
        }
        let idx = self.push(SubType {
            composite: CompositeType::Array(ty),
            supertype: None,
            is_final: true,
        })?;
        self.array_index.insert(ty, idx);
        Ok(idx)
    }

    pub fn struct_type(&self, idx: TypeIdx) -> Result<&StructType> {
        match &self.get(idx).composite {
            CompositeType::Struct(ty) => Ok(ty),
            other => Err(Error::internal(format!(
                "type {idx} is not a struct ({other:?})"
            ))),
        }
    }

    pub fn array_type(&self, idx: TypeIdx) -> Result<&ArrayType> {
        match &self.get(idx).composite {
            CompositeType::Array(ty) => Ok(ty),
            other => Err(Error::internal(format!(
                "type {idx} is not an array ({other:?})"
            ))),
        }
    }

    pub fn func_type(&self, idx: TypeIdx) -> Result<&FuncType> {
        match &self.get(idx).composite {
            CompositeType::Func(ty) => Ok(ty),
            other => Err(Error::internal(format!(
                "type {idx} is not a function type ({other:?})"
            ))),
        }
    }

    /// Value-type subsumption.
    pub fn is_val_subtype(&self, sub: ValType, sup: ValType) -> bool {
        match (sub, sup) {
            (ValType::Num(a), ValType::Num(b)) => a == b,
            (ValType::Ref(a), ValType::Ref(b)) => self.is_ref_subtype(a, b),
            _ => false,
        }
    }

    pub fn is_ref_subtype(&self, sub: RefType, sup: RefType) -> bool {
        if sub.nullable && !sup.nullable {
            return false;
        }
        self.is_heap_subtype(sub.heap, sup.heap)
    }

    pub fn is_heap_subtype(&self, sub: HeapType, sup: HeapType) -> bool {
        use HeapType::{Any, Array, Def, Eq, Func, I31, Struct};
        if sub == sup {
            return true;
        }
        match (sub, sup) {
            (HeapType::None, Any | Eq | I31 | Struct | Array) => true,
            (HeapType::None, Def(idx)) => {
                !matches!(self.get(idx).composite, CompositeType::Func(_))
            }
            (HeapType::NoFunc, Func) => true,
            (HeapType::NoFunc, Def(idx)) => {
                matches!(self.get(idx).composite, CompositeType::Func(_))
            }
            (I31 | Struct | Array | Eq, Any) => true,
            (I31 | Struct | Array, Eq) => true,
            (Def(idx), Func) => matches!(self.get(idx).composite, CompositeType::Func(_)),
            (Def(idx), Struct) => matches!(self.get(idx).composite, CompositeType::Struct(_)),
            (Def(idx), Array) => matches!(self.get(idx).composite, CompositeType::Array(_)),
            (Def(idx), Eq | Any) => {
                !matches!(self.get(idx).composite, CompositeType::Func(_))
            }
            (Def(a), Def(b)) => self.is_def_subtype(a, b),
            _ => false,
        }
    }

    /// Defined-type subsumption: the declared chain first, then structure.
    fn is_def_subtype(&self, sub: TypeIdx, sup: TypeIdx) -> bool {
        let mut current = Some(sub);
        while let Some(idx) = current {
            if idx == sup {
                return true;
            }
            current = self.get(idx).supertype;
        }
        self.is_structurally_compatible(sub, sup)
    }

    fn is_structurally_compatible(&self, sub: TypeIdx, sup: TypeIdx) -> bool {
        match (&self.get(sub).composite, &self.get(sup).composite) {
            (CompositeType::Struct(a), CompositeType::Struct(b)) => {
                // Width subtyping with a matching prefix; mutable fields are
                // invariant, immutable fields may narrow.
                a.fields.len() >= b.fields.len()
                    && a.fields.iter().zip(b.fields.iter()).all(|(fa, fb)| {
                        if fa.mutable || fb.mutable {
                            fa == fb
                        } else {
                            self.is_storage_subtype(fa.storage, fb.storage)
                        }
                    })
            }
            (CompositeType::Array(a), CompositeType::Array(b)) => a.elem == b.elem,
            (CompositeType::Func(a), CompositeType::Func(b)) => {
                a.params.len() == b.params.len()
                    && a.results.len() == b.results.len()
                    && b.params
                        .iter()
                        .zip(a.params.iter())
                        .all(|(&bp, &ap)| self.is_val_subtype(bp, ap))
                    && a.results
                        .iter()
                        .zip(b.results.iter())
                        .all(|(&ar, &br)| self.is_val_subtype(ar, br))
            }
            _ => false,
        }
    }

    fn is_storage_subtype(&self, sub: StorageType, sup: StorageType) -> bool {
        match (sub, sup) {
            (StorageType::Val(a), StorageType::Val(b)) => self.is_val_subtype(a, b),
            (a, b) => a == b,
        }
    }

    /// Serialize the whole store as the type section payload: one recursion
    /// group covering every defined type, so mutually-referential class
    /// structs can point at each other regardless of index order.
    pub(crate) fn encode_section_payload(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        write_u32(&mut payload, 1); // one recursion group
        payload.push(0x4E);
        write_u32(
            &mut payload,
            ensure_u32(
                self.types.len(),
                "defined type count exceeds WebAssembly limits",
            )?,
        );
        for ty in &self.types {
            match (ty.supertype, ty.is_final) {
                (None, true) => {}
                (supertype, is_final) => {
                    payload.push(if is_final { 0x4F } else { 0x50 });
                    match supertype {
                        Some(idx) => {
                            write_u32(&mut payload, 1);
                            write_u32(&mut payload, idx.0);
                        }
                        None => write_u32(&mut payload, 0),
                    }
                }
            }
            match &ty.composite {
                CompositeType::Func(func) => {
                    payload.push(0x60);
                    write_u32(
                        &mut payload,
                        ensure_u32(
                            func.params.len(),
                            "parameter count exceeds WebAssembly limits",
                        )?,
                    );
                    for &param in &func.params {
                        param.encode(&mut payload);
                    }
                    write_u32(
                        &mut payload,
                        ensure_u32(
                            func.results.len(),
                            "result count exceeds WebAssembly limits",
                        )?,
                    );
                    for &result in &func.results {
                        result.encode(&mut payload);
                    }
                }
                CompositeType::Struct(st) => {
                    payload.push(0x5F);
                    write_u32(
                        &mut payload,
                        ensure_u32(
                            st.fields.len(),
                            "struct field count exceeds WebAssembly limits",
                        )?,
                    );
                    for &field in &st.fields {
                        field.encode(&mut payload);
                    }
                }
                CompositeType::Array(array) => {
                    payload.push(0x5E);
                    array.elem.encode(&mut payload);
                }
            }
        }
        Ok(payload)
    }
}
