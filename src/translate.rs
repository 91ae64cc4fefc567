//! The translator: sequences the pipeline over a whole program.
//!
//! Stage order is a hard invariant. Class layout completes before dispatch
//! tables are built (they read final struct shapes and class ids); dispatch
//! tables complete before code generation (it reads selector offsets and
//! signatures); and every stage's output is write-once, read-only for the
//! stages after it. The module's own pools are the only mid-pipeline shared
//! state, and they only ever grow.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::closures::ClosureRegistry;
use crate::constants::ConstantPool;
use crate::dispatch::DispatchTables;
use crate::emit::{CodeGenerator, FuncMap};
use crate::error::{Error, Result};
use crate::globals::StaticTables;
use crate::instr::CodeWriter;
use crate::ir::{MemberDef, MemberId, MemberKind, Program, StaticId};
use crate::layout::ClassLayout;
use crate::module::ModuleBuilder;
use crate::options::BackendOptions;
use crate::types::{FuncType, HeapType, ValType};

/// One entry of the output export table.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ExportRecord {
    pub symbol: String,
    pub index: u32,
}

/// The encoded module plus its export table.
#[derive(Debug)]
pub struct CompiledModule {
    pub bytes: Vec<u8>,
    pub exports: Vec<ExportRecord>,
}

/// Lower a fully-resolved program to a binary module.
pub fn compile(program: &Program, options: &BackendOptions) -> Result<CompiledModule> {
    Translator { program, options }.run()
}

/// Persist a compiled module to disk.
pub fn write_module(module: &CompiledModule, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, &module.bytes)?;
    Ok(())
}

struct Translator<'a> {
    program: &'a Program,
    options: &'a BackendOptions,
}

impl<'a> Translator<'a> {
    fn run(&self) -> Result<CompiledModule> {
        let program = self.program;
        let entry = program.member(program.entry);
        if entry.kind != MemberKind::Function || !entry.params.is_empty() {
            return Err(Error::codegen(
                "the entry point must be a top-level function without parameters",
            ));
        }

        let mut module = ModuleBuilder::new();
        let mut closures = ClosureRegistry::new();
        let layout = ClassLayout::collect(program, &mut module.types, &mut closures)?;

        // Host imports claim the leading function indices.
        let mut import_funcs = Vec::with_capacity(program.imports.len());
        for import in &program.imports {
            let mut params = Vec::with_capacity(import.params.len());
            for ty in &import.params {
                params.push(layout.value_type(program, &mut module.types, &mut closures, ty)?);
            }
            let results = if import.ret.is_void() {
                Vec::new()
            } else {
                vec![layout.value_type(
                    program,
                    &mut module.types,
                    &mut closures,
                    &import.ret,
                )?]
            };
            import_funcs.push(module.add_import(
                import.module.clone(),
                import.name.clone(),
                FuncType { params, results },
            )?);
        }

        let dispatch = DispatchTables::build(program, &layout, &mut module.types, &mut closures)?;
        let statics = StaticTables::declare(program, &layout, &mut closures, &mut module)?;

        // Fix every member's function index before any body is generated;
        // call sites embed these indices directly.
        let mut funcs = FuncMap {
            by_member: vec![None; program.members.len()],
        };
        for (index, member) in program.members.iter().enumerate() {
            let id = MemberId(index);
            if let Some(import) = member.import {
                funcs.by_member[index] = Some(import_funcs[import.0]);
                continue;
            }
            if member.body.is_none() {
                continue;
            }
            let name = qualified_name(program, member);
            let func = if member.is_virtual() {
                let selector = dispatch.selector_of(id).ok_or_else(|| {
                    Error::internal(format!("virtual member `{name}` has no selector"))
                })?;
                module.declare_function_with_type(name, dispatch.selector(selector).type_index)?
            } else {
                let sig = self.direct_signature(member, &layout, &mut module, &mut closures)?;
                module.declare_function(name, sig)?
            };
            funcs.by_member[index] = Some(func);
        }
        debug!(
            members = program.members.len(),
            imports = program.imports.len(),
            "declarations fixed"
        );

        let mut constants = ConstantPool::new(self.options.eager_constants);
        let mut generator = CodeGenerator {
            program,
            layout: &layout,
            dispatch: &dispatch,
            statics: &statics,
            options: self.options,
            closures: &mut closures,
            constants: &mut constants,
            module: &mut module,
            funcs: &funcs,
            lambda_count: 0,
        };
        for index in 0..program.members.len() {
            generator.emit_member(MemberId(index))?;
        }
        for index in 0..program.statics.len() {
            generator.emit_static_accessor(StaticId(index))?;
        }

        // Populate the dispatch table: `offset + class id` names the slot.
        module.reserve_table(dispatch.table_size);
        for selector in dispatch.selectors() {
            for (&class_id, &member) in &selector.targets {
                let slot = selector.offset + i64::from(class_id);
                let slot = usize::try_from(slot).map_err(|_| {
                    Error::internal("dispatch slot resolved below zero")
                })?;
                module.set_table_slot(slot, funcs.get(member)?);
            }
        }

        if self.options.eager_constants && !constants.is_empty() {
            let start = module.declare_function("start", FuncType::default())?;
            let mut w = CodeWriter::new(&[], Vec::new());
            let infos: Vec<_> = constants.init_funcs().collect();
            for info in infos {
                let sig = module.func_sig(info.init_func)?.clone();
                w.call(&module.types, info.init_func.0, &sig)?;
                w.drop_()?;
            }
            let body = w.finish(&module.types)?;
            module.set_body(start, body)?;
            module.set_start(start);
        }

        let mut exports = Vec::new();
        let mut seen = HashSet::new();
        let entry_func = funcs.get(program.entry)?;
        module.add_export("main", entry_func);
        seen.insert("main".to_string());
        exports.push(ExportRecord {
            symbol: "main".into(),
            index: entry_func.0,
        });
        if self.options.export_all {
            for (index, member) in program.members.iter().enumerate() {
                let Some(func) = funcs.by_member[index] else {
                    continue;
                };
                if member.import.is_some() || MemberId(index) == program.entry {
                    continue;
                }
                let symbol = mangled_name(program, member);
                if !seen.insert(symbol.clone()) {
                    continue;
                }
                module.add_export(symbol.clone(), func);
                exports.push(ExportRecord {
                    symbol,
                    index: func.0,
                });
            }
        }

        let bytes = module.emit()?;
        info!(
            bytes = bytes.len(),
            table_slots = dispatch.table_size,
            constants = constants.len(),
            "module emitted"
        );
        if self.options.dump_functions
            && let Ok(table) = serde_json::to_string(&exports)
        {
            debug!(target: "moss_wasm::dump", exports = %table, "export table");
        }
        Ok(CompiledModule { bytes, exports })
    }

    /// Signature for members called only directly: constructors carry an
    /// exact receiver, top-level functions none.
    fn direct_signature(
        &self,
        member: &MemberDef,
        layout: &ClassLayout,
        module: &mut ModuleBuilder,
        closures: &mut ClosureRegistry,
    ) -> Result<FuncType> {
        let mut params = Vec::new();
        if member.kind == MemberKind::Constructor {
            let owner = member.owner.ok_or_else(|| {
                Error::codegen(format!("constructor `{}` has no owning class", member.name))
            })?;
            params.push(ValType::nullable_ref(HeapType::Def(layout.struct_of(owner))));
        }
        for param in &member.params {
            params.push(layout.value_type(
                self.program,
                &mut module.types,
                closures,
                &param.ty,
            )?);
        }
        let mut named: Vec<_> = member.named_params.iter().collect();
        named.sort_by(|a, b| a.name.cmp(&b.name));
        for param in named {
            params.push(layout.value_type(
                self.program,
                &mut module.types,
                closures,
                &param.ty,
            )?);
        }
        let results = if member.return_ty.is_void() {
            Vec::new()
        } else {
            vec![layout.value_type(
                self.program,
                &mut module.types,
                closures,
                &member.return_ty,
            )?]
        };
        Ok(FuncType { params, results })
    }
}

fn qualified_name(program: &Program, member: &MemberDef) -> String {
    match member.owner {
        Some(owner) => format!("{}.{}", program.class(owner).name, member.name),
        None => member.name.clone(),
    }
}

/// Export symbol: qualified member name, setters suffixed so a
/// getter/setter pair stays distinguishable.
fn mangled_name(program: &Program, member: &MemberDef) -> String {
    let base = qualified_name(program, member);
    if member.kind == MemberKind::Setter {
        format!("{base}=")
    } else {
        base
    }
}
