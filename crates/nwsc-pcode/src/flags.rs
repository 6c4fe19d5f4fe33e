//! Symbol and function flag sets.
//!
//! Passes combine flags with monotonic OR only; no pass ever clears a
//! bit another pass set.

use bitflags::bitflags;

bitflags! {
    /// Per-symbol flags. The increment/decrement bits describe a
    /// *use site* and travel on `Variable`/`Assignment` records;
    /// `INCREMENTS` is set whenever any of the four variant bits is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SymbolFlags: u32 {
        /// Visible in global scope.
        const GLOBAL             = 0x0001;
        /// Live after the reachability pass.
        const REFERENCED         = 0x0002;
        /// Written to after the reachability pass.
        const MODIFIED           = 0x0004;
        /// The use site performs some pre/post increment or decrement.
        const INCREMENTS         = 0x0008;
        /// `++x` at the use site.
        const PRE_INCREMENT      = 0x0010;
        /// `x++` at the use site.
        const POST_INCREMENT     = 0x0020;
        /// `--x` at the use site.
        const PRE_DECREMENT      = 0x0040;
        /// `x--` at the use site.
        const POST_DECREMENT     = 0x0080;
        /// Global whose initializer is inlined at each read.
        const TREAT_AS_CONSTANT  = 0x0100;
        /// Initializer reads the variable being declared.
        const SELF_REFERENCE_DEF = 0x0200;
        /// Last declaration on its source line.
        const LAST_DECL          = 0x0400;
        /// Host-provided call, emitted as `ACTION`.
        const ENGINE_FUNC        = 0x0800;
        /// Compiler-lowered built-in.
        const INTRINSIC          = 0x1000;
    }
}

bitflags! {
    /// Per-function flags carried in the function side table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FunctionFlags: u32 {
        /// A body was supplied.
        const DEFINED          = 0x0001;
        /// May be emitted with a synthesised body if no real one exists.
        const DEFAULT_FUNCTION = 0x0002;
        /// Touches global variables (directly or through a callee).
        const USES_GLOBAL_VARS = 0x0004;
        /// Free of side effects; calls to it do not spoil purity.
        const PURE_FUNCTION    = 0x0008;
    }
}
