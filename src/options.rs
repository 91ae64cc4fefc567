//! Backend strategy configuration.
//!
//! Every toggle here changes internal strategy only — which instruction
//! sequence gets emitted — never the observable behavior of the compiled
//! program.

/// Shared backend options.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Inline statically-known callees below the trivial-size threshold.
    pub inline_trivial_calls: bool,
    /// Materialize interned constants from a module `start` function instead
    /// of lazily on first read.
    pub eager_constants: bool,
    /// Declare locals and parameters with nullable reference types even when
    /// the IR type is non-nullable (trades null checks for simpler frames).
    pub nullable_locals: bool,
    /// Lower virtual calls to class-id branch trees instead of indirect
    /// calls through the dispatch table.
    pub polymorphic_specialization: bool,
    /// Replace table dispatch with a direct call when exactly one
    /// implementation is reachable.
    pub devirtualize: bool,
    /// Export every member under its mangled qualified name in addition to
    /// the entry point.
    pub export_all: bool,
    /// Emit a JSON record of each compiled function's instruction listing.
    pub dump_functions: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            inline_trivial_calls: false,
            eager_constants: false,
            nullable_locals: false,
            polymorphic_specialization: false,
            devirtualize: true,
            export_all: false,
            dump_functions: false,
        }
    }
}
