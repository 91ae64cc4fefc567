#![deny(clippy::unwrap_used, clippy::expect_used)]

//! WebAssembly GC backend for the Moss compiler.
//!
//! This crate lowers a fully-resolved, typed, class-based Moss IR into a
//! WebAssembly module using the GC proposal's structural heap types
//! (structs, arrays, typed function references). The pipeline is strictly
//! staged: class layout, dispatch-table construction, then two-pass code
//! generation over every member body, with an instruction encoder that
//! type-checks emitted code as it is written.

macro_rules! wasm_debug {
    ($($arg:tt)*) => {
        $crate::logging::trace_log(format_args!($($arg)*));
    };
}

pub mod analyze;
pub mod closures;
pub mod constants;
pub mod dispatch;
pub mod emit;
pub mod encoding;
pub mod error;
pub mod globals;
pub mod instr;
pub mod intrinsics;
pub mod ir;
pub mod layout;
pub mod logging;
pub mod module;
pub mod options;
pub mod translate;
pub mod types;

pub use error::{Error, Result};
pub use options::BackendOptions;
pub use translate::{CompiledModule, ExportRecord, compile, write_module};
