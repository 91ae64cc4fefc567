//! Module assembly: append-only object pools and binary section emission.
//!
//! Every pool (types, imports, functions, globals, table slots, data
//! segments) is appended to monotonically and never reordered; later stages
//! embed the resulting indices directly into the encoded bytes, so index
//! stability is a correctness requirement, not a nicety.

use std::fmt;

use crate::encoding::{ensure_u32, push_bytes, push_string, write_f64, write_i32, write_i64, write_u32};
use crate::error::{Error, Result};
use crate::types::{FuncType, HeapType, TypeIdx, TypeStore, ValType};

pub(crate) const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
pub(crate) const WASM_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Index into the function index space (imports first, then definitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncIdx(pub u32);

impl fmt::Display for FuncIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataIdx(pub u32);

/// A host function surfaced through the import section.
#[derive(Debug, Clone)]
pub(crate) struct ImportEntry {
    pub module: String,
    pub name: String,
    pub type_index: TypeIdx,
}

#[derive(Debug)]
struct FunctionEntry {
    name: String,
    type_index: TypeIdx,
    body: Option<Vec<u8>>,
}

/// A global's initializer: the restricted constant-expression grammar the
/// encoder needs.
#[derive(Debug, Clone)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F64(f64),
    RefNull(HeapType),
    RefFunc(FuncIdx),
}

impl ConstExpr {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ConstExpr::I32(value) => {
                buf.push(0x41);
                write_i32(buf, *value);
            }
            ConstExpr::I64(value) => {
                buf.push(0x42);
                write_i64(buf, *value);
            }
            ConstExpr::F64(value) => {
                buf.push(0x44);
                write_f64(buf, *value);
            }
            ConstExpr::RefNull(heap) => {
                buf.push(0xD0);
                heap.encode(buf);
            }
            ConstExpr::RefFunc(func) => {
                buf.push(0xD2);
                write_u32(buf, func.0);
            }
        }
        buf.push(0x0B);
    }
}

#[derive(Debug)]
struct GlobalEntry {
    ty: ValType,
    mutable: bool,
    init: ConstExpr,
}

#[derive(Debug)]
pub(crate) struct ExportEntry {
    pub name: String,
    pub kind: u8,
    pub index: u32,
}

/// One encoded module section.
#[derive(Debug)]
pub(crate) struct Section {
    id: u8,
    payload: Vec<u8>,
}

impl Section {
    pub(crate) fn new(id: u8, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.id);
        let len = ensure_u32(self.payload.len(), "section payload exceeds WebAssembly limits")?;
        write_u32(out, len);
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Owns every module pool and serializes the final byte stream.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    pub types: TypeStore,
    imports: Vec<ImportEntry>,
    functions: Vec<FunctionEntry>,
    globals: Vec<GlobalEntry>,
    table: Vec<Option<FuncIdx>>,
    /// Functions named by `ref.func`; they must appear in a declarative
    /// element segment to validate.
    declared_refs: Vec<FuncIdx>,
    data: Vec<Vec<u8>>,
    start: Option<FuncIdx>,
    exports: Vec<ExportEntry>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host import. All imports precede defined functions in the
    /// index space, so registration is only legal before any definition.
    pub fn add_import(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        sig: FuncType,
    ) -> Result<FuncIdx> {
        if !self.functions.is_empty() {
            return Err(Error::internal(
                "imports must be registered before function declarations",
            ));
        }
        let type_index = self.types.intern_func(sig)?;
        let index = FuncIdx(ensure_u32(
            self.imports.len(),
            "import count exceeds WebAssembly limits",
        )?);
        self.imports.push(ImportEntry {
            module: module.into(),
            name: name.into(),
            type_index,
        });
        Ok(index)
    }

    /// Declare a function and reserve its index; the body arrives later via
    /// [`ModuleBuilder::set_body`].
    pub fn declare_function(&mut self, name: impl Into<String>, sig: FuncType) -> Result<FuncIdx> {
        let type_index = self.types.intern_func(sig)?;
        self.declare_function_with_type(name, type_index)
    }

    pub fn declare_function_with_type(
        &mut self,
        name: impl Into<String>,
        type_index: TypeIdx,
    ) -> Result<FuncIdx> {
        let total = self.imports.len() + self.functions.len();
        let index = FuncIdx(ensure_u32(
            total,
            "function index exceeds WebAssembly limits",
        )?);
        self.functions.push(FunctionEntry {
            name: name.into(),
            type_index,
            body: None,
        });
        Ok(index)
    }

    pub fn set_body(&mut self, func: FuncIdx, body: Vec<u8>) -> Result<()> {
        let slot = (func.0 as usize)
            .checked_sub(self.imports.len())
            .and_then(|idx| self.functions.get_mut(idx))
            .ok_or_else(|| Error::internal(format!("no declared function at index {func}")))?;
        slot.body = Some(body);
        Ok(())
    }

    pub fn function_name(&self, func: FuncIdx) -> Option<&str> {
        (func.0 as usize)
            .checked_sub(self.imports.len())
            .and_then(|idx| self.functions.get(idx))
            .map(|entry| entry.name.as_str())
    }

    /// The signature of any function in the index space.
    pub fn func_sig(&self, func: FuncIdx) -> Result<&FuncType> {
        let type_index = self.func_type_index(func)?;
        self.types.func_type(type_index)
    }

    pub fn func_type_index(&self, func: FuncIdx) -> Result<TypeIdx> {
        let index = func.0 as usize;
        if index < self.imports.len() {
            return Ok(self.imports[index].type_index);
        }
        self.functions
            .get(index - self.imports.len())
            .map(|entry| entry.type_index)
            .ok_or_else(|| Error::internal(format!("no function at index {func}")))
    }

    pub fn add_global(&mut self, ty: ValType, mutable: bool, init: ConstExpr) -> Result<GlobalIdx> {
        let index = GlobalIdx(ensure_u32(
            self.globals.len(),
            "global count exceeds WebAssembly limits",
        )?);
        self.globals.push(GlobalEntry { ty, mutable, init });
        Ok(index)
    }

    pub fn global_type(&self, index: GlobalIdx) -> Option<ValType> {
        self.globals.get(index.0 as usize).map(|entry| entry.ty)
    }

    /// Grow the dispatch table to at least `size` slots.
    pub fn reserve_table(&mut self, size: usize) {
        if self.table.len() < size {
            self.table.resize(size, None);
        }
    }

    pub fn set_table_slot(&mut self, slot: usize, func: FuncIdx) {
        if self.table.len() <= slot {
            self.table.resize(slot + 1, None);
        }
        self.table[slot] = Some(func);
    }

    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    /// Record a function whose reference is taken with `ref.func`.
    pub fn declare_func_ref(&mut self, func: FuncIdx) {
        if !self.declared_refs.contains(&func) {
            self.declared_refs.push(func);
        }
    }

    /// Register a passive data segment and return its index.
    pub fn add_data(&mut self, bytes: Vec<u8>) -> Result<DataIdx> {
        let index = DataIdx(ensure_u32(
            self.data.len(),
            "data segment count exceeds WebAssembly limits",
        )?);
        self.data.push(bytes);
        Ok(index)
    }

    pub fn set_start(&mut self, func: FuncIdx) {
        self.start = Some(func);
    }

    pub fn add_export(&mut self, name: impl Into<String>, func: FuncIdx) {
        self.exports.push(ExportEntry {
            name: name.into(),
            kind: 0x00,
            index: func.0,
        });
    }

    // ---- section emission ----

    fn emit_type_section(&self) -> Result<Section> {
        Ok(Section::new(1, self.types.encode_section_payload()?))
    }

    fn emit_import_section(&self) -> Result<Option<Section>> {
        if self.imports.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(self.imports.len(), "import count exceeds WebAssembly limits")?,
        );
        for import in &self.imports {
            push_string(&mut payload, &import.module)?;
            push_string(&mut payload, &import.name)?;
            payload.push(0x00); // function import kind
            write_u32(&mut payload, import.type_index.0);
        }
        Ok(Some(Section::new(2, payload)))
    }

    fn emit_function_section(&self) -> Result<Section> {
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(
                self.functions.len(),
                "function count exceeds WebAssembly limits",
            )?,
        );
        for function in &self.functions {
            write_u32(&mut payload, function.type_index.0);
        }
        Ok(Section::new(3, payload))
    }

    fn emit_table_section(&self) -> Result<Option<Section>> {
        if self.table.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        write_u32(&mut payload, 1); // table count
        payload.push(0x70); // funcref element type
        payload.push(0x00); // limits: min only
        write_u32(
            &mut payload,
            ensure_u32(self.table.len(), "dispatch table exceeds WebAssembly limits")?,
        );
        Ok(Some(Section::new(4, payload)))
    }

    fn emit_memory_section(&self) -> Result<Option<Section>> {
        // Only string/byte data segments need a memory declared.
        if self.data.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        write_u32(&mut payload, 1); // memory count
        payload.push(0x00); // min only
        write_u32(&mut payload, 1);
        Ok(Some(Section::new(5, payload)))
    }

    fn emit_global_section(&self) -> Result<Option<Section>> {
        if self.globals.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(self.globals.len(), "global count exceeds WebAssembly limits")?,
        );
        for global in &self.globals {
            global.ty.encode(&mut payload);
            payload.push(if global.mutable { 0x01 } else { 0x00 });
            global.init.encode(&mut payload);
        }
        Ok(Some(Section::new(6, payload)))
    }

    fn emit_export_section(&self) -> Result<Option<Section>> {
        if self.exports.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(self.exports.len(), "export count exceeds WebAssembly limits")?,
        );
        for entry in &self.exports {
            push_string(&mut payload, &entry.name)?;
            payload.push(entry.kind);
            write_u32(&mut payload, entry.index);
        }
        Ok(Some(Section::new(7, payload)))
    }

    fn emit_start_section(&self) -> Option<Section> {
        self.start.map(|func| {
            let mut payload = Vec::new();
            write_u32(&mut payload, func.0);
            Section::new(8, payload)
        })
    }

    /// One active element segment per contiguous run of populated slots;
    /// unpopulated slots stay null in the table.
    fn emit_element_section(&self) -> Result<Option<Section>> {
        let mut runs: Vec<(usize, Vec<FuncIdx>)> = Vec::new();
        let mut cursor = 0usize;
        while cursor < self.table.len() {
            match self.table[cursor] {
                Some(func) => {
                    let start = cursor;
                    let mut entries = vec![func];
                    cursor += 1;
                    while let Some(Some(next)) = self.table.get(cursor) {
                        entries.push(*next);
                        cursor += 1;
                    }
                    runs.push((start, entries));
                }
                None => cursor += 1,
            }
        }
        if runs.is_empty() && self.declared_refs.is_empty() {
            return Ok(None);
        }
        let segment_count = runs.len() + usize::from(!self.declared_refs.is_empty());
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(segment_count, "element segment count exceeds WebAssembly limits")?,
        );
        for (start, entries) in runs {
            payload.push(0x00); // active, table 0, funcidx entries
            payload.push(0x41); // i32.const offset
            write_i32(
                &mut payload,
                i32::try_from(start).map_err(|_| {
                    Error::codegen("dispatch table offset exceeds WebAssembly limits")
                })?,
            );
            payload.push(0x0B);
            write_u32(
                &mut payload,
                ensure_u32(entries.len(), "element run exceeds WebAssembly limits")?,
            );
            for func in entries {
                write_u32(&mut payload, func.0);
            }
        }
        if !self.declared_refs.is_empty() {
            payload.push(0x03); // declarative, funcidx entries
            payload.push(0x00); // elemkind: funcref
            write_u32(
                &mut payload,
                ensure_u32(
                    self.declared_refs.len(),
                    "declared reference count exceeds WebAssembly limits",
                )?,
            );
            for func in &self.declared_refs {
                write_u32(&mut payload, func.0);
            }
        }
        Ok(Some(Section::new(9, payload)))
    }

    fn emit_data_count_section(&self) -> Result<Option<Section>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(self.data.len(), "data segment count exceeds WebAssembly limits")?,
        );
        Ok(Some(Section::new(12, payload)))
    }

    fn emit_code_section(&self) -> Result<Section> {
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(
                self.functions.len(),
                "function count exceeds WebAssembly limits",
            )?,
        );
        for function in &self.functions {
            let body = function.body.as_ref().ok_or_else(|| {
                Error::internal(format!(
                    "function `{}` was declared but never given a body",
                    function.name
                ))
            })?;
            write_u32(
                &mut payload,
                ensure_u32(body.len(), "code body exceeds WebAssembly limits")?,
            );
            payload.extend_from_slice(body);
        }
        Ok(Section::new(10, payload))
    }

    fn emit_data_section(&self) -> Result<Option<Section>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let mut payload = Vec::new();
        write_u32(
            &mut payload,
            ensure_u32(self.data.len(), "data segment count exceeds WebAssembly limits")?,
        );
        for segment in &self.data {
            payload.push(0x01); // passive segment
            push_bytes(&mut payload, segment)?;
        }
        Ok(Some(Section::new(11, payload)))
    }

    /// Serialize the whole module.
    pub fn emit(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&WASM_MAGIC);
        bytes.extend_from_slice(&WASM_VERSION);

        self.emit_type_section()?.encode_into(&mut bytes)?;
        if let Some(section) = self.emit_import_section()? {
            section.encode_into(&mut bytes)?;
        }
        self.emit_function_section()?.encode_into(&mut bytes)?;
        if let Some(section) = self.emit_table_section()? {
            section.encode_into(&mut bytes)?;
        }
        if let Some(section) = self.emit_memory_section()? {
            section.encode_into(&mut bytes)?;
        }
        if let Some(section) = self.emit_global_section()? {
            section.encode_into(&mut bytes)?;
        }
        if let Some(section) = self.emit_export_section()? {
            section.encode_into(&mut bytes)?;
        }
        if let Some(section) = self.emit_start_section() {
            section.encode_into(&mut bytes)?;
        }
        if let Some(section) = self.emit_element_section()? {
            section.encode_into(&mut bytes)?;
        }
        if let Some(section) = self.emit_data_count_section()? {
            section.encode_into(&mut bytes)?;
        }
        self.emit_code_section()?.encode_into(&mut bytes)?;
        if let Some(section) = self.emit_data_section()? {
            section.encode_into(&mut bytes)?;
        }
        wasm_debug!(
            "emit: {} bytes, {} functions, {} globals, table of {}",
            bytes.len(),
            self.functions.len(),
            self.globals.len(),
            self.table.len()
        );
        Ok(bytes)
    }
}
