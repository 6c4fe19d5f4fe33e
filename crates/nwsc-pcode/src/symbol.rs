//! Symbol table: named entities with kind, type, flags and side tables.
//!
//! Symbols are created by the front-end, flag-OR'd by the reachability
//! pass, and read by the emitter, which additionally writes
//! `stack_offset` and the compiled byte range exactly once per declared
//! symbol.

use nwsc_core::Type;

use crate::flags::{FunctionFlags, SymbolFlags};
use crate::record::PCodeSlice;

/// Signalling value for "no compiled offset". Written literally into
/// debug output for tooling compatibility.
pub const NO_OFFSET: u32 = 0xFFFF_FFFF;

/// Index of a symbol in its [`crate::Unit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

impl SymbolId {
    /// The index as `usize`.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbol kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A variable (global or local).
    Variable,
    /// A function.
    Function,
    /// A user structure type.
    Structure,
    /// A named constant surfaced in debug listings.
    Constant,
    /// Reserved word / token entry (front-end only).
    Token,
    /// Linker label (emitter internal).
    Linker,
}

/// Compiler-lowered built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    /// `__readbp() -> int`
    ReadBp,
    /// `__writebp(int)`
    WriteBp,
    /// `__readrelativesp() -> int`
    ReadRelativeSp,
    /// `__readsp() -> int`
    ReadSp,
    /// `__readpc() -> int`
    ReadPc,
}

/// Variable side table.
#[derive(Debug, Clone, Default)]
pub struct VariableData {
    /// Initializer PCode; empty means default-initialized.
    pub init: PCodeSlice,
    /// File of the declaration.
    pub file: i32,
    /// Line of the declaration.
    pub line: i32,
}

/// Function side table.
#[derive(Debug, Clone, Default)]
pub struct FunctionData {
    /// Number of declared parameters.
    pub arg_count: u32,
    /// Total parameter size in cells.
    pub arg_size: i32,
    /// Body PCode; empty until defined.
    pub code: PCodeSlice,
    /// Parameter `Declaration` records (carrying default initializers).
    pub args: PCodeSlice,
    /// File of the definition, `-1` if unknown.
    pub file: i32,
    /// Line of the definition, `-1` if unknown.
    pub line: i32,
    /// Engine action id (engine functions only).
    pub action: i32,
    /// Intrinsic id (intrinsics only).
    pub intrinsic: Option<Intrinsic>,
    /// Function flags.
    pub flags: FunctionFlags,
}

/// Structure side table.
#[derive(Debug, Clone, Default)]
pub struct StructData {
    /// Number of members.
    pub element_count: u32,
    /// Member `Declaration` records, in order.
    pub members: PCodeSlice,
}

/// Kind-dependent side table of a symbol.
#[derive(Debug, Clone)]
pub enum SymbolData {
    /// No extra data.
    None,
    /// Variable extras.
    Variable(VariableData),
    /// Function extras.
    Function(FunctionData),
    /// Structure extras.
    Struct(StructData),
}

/// A named entity.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Source name.
    pub name: String,
    /// Symbol kind.
    pub kind: SymbolKind,
    /// Value type (return type for functions).
    pub ty: Type,
    /// Flag set, OR-mutated between passes.
    pub flags: SymbolFlags,
    /// Stack offset in cells; assigned by the emitter for stored globals.
    pub stack_offset: i32,
    /// First output byte of the compiled range, [`NO_OFFSET`] until set.
    pub compiled_start: u32,
    /// One past the last output byte, [`NO_OFFSET`] until set.
    pub compiled_end: u32,
    /// Kind-dependent extras.
    pub data: SymbolData,
}

impl Symbol {
    /// Construct a symbol with no extras and unset offsets.
    pub fn new(name: impl Into<String>, kind: SymbolKind, ty: Type) -> Self {
        Self {
            name: name.into(),
            kind,
            ty,
            flags: SymbolFlags::empty(),
            stack_offset: 0,
            compiled_start: NO_OFFSET,
            compiled_end: NO_OFFSET,
            data: SymbolData::None,
        }
    }

    /// The function side table, if this is a function.
    pub fn function(&self) -> Option<&FunctionData> {
        match &self.data {
            SymbolData::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Mutable function side table.
    pub fn function_mut(&mut self) -> Option<&mut FunctionData> {
        match &mut self.data {
            SymbolData::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The variable side table, if this is a variable.
    pub fn variable(&self) -> Option<&VariableData> {
        match &self.data {
            SymbolData::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// The structure side table, if this is a structure.
    pub fn structure(&self) -> Option<&StructData> {
        match &self.data {
            SymbolData::Struct(s) => Some(s),
            _ => None,
        }
    }
}
