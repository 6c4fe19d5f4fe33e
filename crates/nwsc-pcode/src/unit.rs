//! The compilation unit: PCode arena, symbol table, file table and the
//! declaration-order lists later passes iterate.
//!
//! The front-end owns the append-only build surface; the reachability
//! pass and the emitter borrow the unit, mutating only symbol flag bits
//! and the per-symbol compiled offsets.

use indexmap::IndexMap;
use nwsc_core::{Type, TypeSizes};

use crate::build::PCodeBuilder;
use crate::flags::{FunctionFlags, SymbolFlags};
use crate::record::{PCode, PCodeSlice};
use crate::symbol::{
    FunctionData, Intrinsic, StructData, Symbol, SymbolData, SymbolId, SymbolKind, VariableData,
};
use crate::walk::{PCodeReader, PCodeResult};

/// One source file referenced by the unit.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// File name as recorded in debug output.
    pub name: String,
    /// True for the main compilation unit, false for includes.
    pub is_main: bool,
}

/// A compilation unit under translation.
#[derive(Debug, Default)]
pub struct Unit {
    data: Vec<u8>,
    symbols: Vec<Symbol>,
    by_name: IndexMap<String, SymbolId>,
    files: Vec<SourceFile>,
    globals: Vec<SymbolId>,
    global_defs: Vec<SymbolId>,
    global_fns: Vec<SymbolId>,
    structs: Vec<SymbolId>,
}

impl Unit {
    /// Empty unit.
    pub fn new() -> Self {
        Self::default()
    }

    /* ── PCode arena ── */

    /// The PCode arena bytes.
    pub fn pcode(&self) -> &[u8] {
        &self.data
    }

    /// Copy a finished fragment into the arena and return its range.
    pub fn append_pcode(&mut self, frag: &PCodeBuilder) -> PCodeSlice {
        let start = self.data.len() as u32;
        self.data.extend_from_slice(frag.bytes());
        PCodeSlice::new(start, frag.len() as u32)
    }

    /// Reader over one slice of the arena.
    pub fn reader(&self, slice: PCodeSlice) -> PCodeReader<'_> {
        PCodeReader::new(&self.data, slice)
    }

    /// Linear scan of `slice`, reporting each record to `visitor`.
    /// The walker never recurses; visitors recurse by calling `walk`
    /// again on child slices.
    pub fn walk<E, F>(&self, slice: PCodeSlice, mut visitor: F) -> Result<(), E>
    where
        F: FnMut(usize, &PCode<'_>) -> Result<(), E>,
        E: From<crate::walk::PCodeError>,
    {
        for item in self.reader(slice) {
            let (at, record) = item?;
            visitor(at, &record)?;
        }
        Ok(())
    }

    /* ── files ── */

    /// Register a source file; returns its index.
    pub fn add_file(&mut self, name: impl Into<String>, is_main: bool) -> i32 {
        self.files.push(SourceFile { name: name.into(), is_main });
        (self.files.len() - 1) as i32
    }

    /// The file table.
    pub fn files(&self) -> &[SourceFile] {
        &self.files
    }

    /* ── symbols ── */

    fn intern(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.by_name.entry(symbol.name.clone()).or_insert(id);
        self.symbols.push(symbol);
        id
    }

    /// O(1) symbol lookup.
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    /// Mutable symbol lookup.
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    /// Find a symbol by source name.
    pub fn find_symbol(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    /// Number of symbols.
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /* ── declaration-order lists ── */

    /// Global variables in declaration order.
    pub fn globals(&self) -> &[SymbolId] {
        &self.globals
    }

    /// All global definitions (variables, structures, functions) in
    /// declaration order.
    pub fn global_defs(&self) -> &[SymbolId] {
        &self.global_defs
    }

    /// Global functions and named constants, for debug listings.
    pub fn global_fns(&self) -> &[SymbolId] {
        &self.global_fns
    }

    /// Number of user structure types.
    pub fn struct_count(&self) -> usize {
        self.structs.len()
    }

    /// Symbol of structure type `k`.
    pub fn struct_symbol(&self, k: u16) -> SymbolId {
        self.structs[k as usize]
    }

    /* ── front-end build surface ── */

    /// Declare a global variable. `GLOBAL` is implied.
    pub fn add_global_variable(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        init: PCodeSlice,
        file: i32,
        line: i32,
        flags: SymbolFlags,
    ) -> SymbolId {
        let mut sym = Symbol::new(name, SymbolKind::Variable, ty);
        sym.flags = flags | SymbolFlags::GLOBAL;
        sym.data = SymbolData::Variable(VariableData { init, file, line });
        let id = self.intern(sym);
        self.globals.push(id);
        self.global_defs.push(id);
        id
    }

    /// Declare a user structure; returns its symbol and its type.
    /// `members` must be a stream of `Declaration` records.
    pub fn add_struct(
        &mut self,
        name: impl Into<String>,
        element_count: u32,
        members: PCodeSlice,
    ) -> (SymbolId, Type) {
        let k = self.structs.len() as u16;
        let mut sym = Symbol::new(name, SymbolKind::Structure, Type::Struct(k));
        sym.data = SymbolData::Struct(StructData { element_count, members });
        let id = self.intern(sym);
        self.structs.push(id);
        self.global_defs.push(id);
        (id, Type::Struct(k))
    }

    /// Declare a function prototype. `args` must be a stream of
    /// `Declaration` records, one per parameter, carrying default
    /// initializers where present; argument count and total size are
    /// derived from it.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        ret: Type,
        args: PCodeSlice,
        file: i32,
        line: i32,
        flags: FunctionFlags,
    ) -> PCodeResult<SymbolId> {
        let (arg_count, arg_size) = self.measure_args(args)?;
        let mut sym = Symbol::new(name, SymbolKind::Function, ret);
        sym.data = SymbolData::Function(FunctionData {
            arg_count,
            arg_size,
            code: PCodeSlice::EMPTY,
            args,
            file,
            line,
            action: -1,
            intrinsic: None,
            flags,
        });
        let id = self.intern(sym);
        self.global_defs.push(id);
        self.global_fns.push(id);
        Ok(id)
    }

    /// Attach a body to a declared function and mark it `DEFINED`.
    pub fn set_function_code(&mut self, id: SymbolId, code: PCodeSlice) {
        let sym = self.symbol_mut(id);
        let f = sym.function_mut().expect("set_function_code on a non-function");
        f.code = code;
        f.flags |= FunctionFlags::DEFINED;
    }

    /// Declare an engine (host) function, called through `ACTION`.
    pub fn add_engine_function(
        &mut self,
        name: impl Into<String>,
        ret: Type,
        action: i32,
        args: PCodeSlice,
    ) -> PCodeResult<SymbolId> {
        let (arg_count, arg_size) = self.measure_args(args)?;
        let mut sym = Symbol::new(name, SymbolKind::Function, ret);
        sym.flags = SymbolFlags::ENGINE_FUNC;
        sym.data = SymbolData::Function(FunctionData {
            arg_count,
            arg_size,
            code: PCodeSlice::EMPTY,
            args,
            file: -1,
            line: -1,
            action,
            intrinsic: None,
            flags: FunctionFlags::empty(),
        });
        Ok(self.intern(sym))
    }

    /// Declare a compiler intrinsic.
    pub fn add_intrinsic(
        &mut self,
        name: impl Into<String>,
        ret: Type,
        intrinsic: Intrinsic,
        args: PCodeSlice,
    ) -> PCodeResult<SymbolId> {
        let (arg_count, arg_size) = self.measure_args(args)?;
        let mut sym = Symbol::new(name, SymbolKind::Function, ret);
        sym.flags = SymbolFlags::INTRINSIC;
        sym.data = SymbolData::Function(FunctionData {
            arg_count,
            arg_size,
            code: PCodeSlice::EMPTY,
            args,
            file: -1,
            line: -1,
            action: -1,
            intrinsic: Some(intrinsic),
            flags: FunctionFlags::empty(),
        });
        Ok(self.intern(sym))
    }

    /// Register a named constant so it shows up in debug listings.
    pub fn add_constant(&mut self, name: impl Into<String>, ty: Type) -> SymbolId {
        let sym = Symbol::new(name, SymbolKind::Constant, ty);
        let id = self.intern(sym);
        self.global_fns.push(id);
        id
    }

    fn measure_args(&self, args: PCodeSlice) -> PCodeResult<(u32, i32)> {
        let mut count = 0u32;
        let mut size = 0i32;
        for item in self.reader(args) {
            let (_, record) = item?;
            if let PCode::Declaration { ty, .. } = record {
                count += 1;
                size += self.size_of(ty);
            }
        }
        Ok((count, size))
    }
}

impl TypeSizes for Unit {
    fn size_of(&self, ty: Type) -> i32 {
        match ty.scalar_size() {
            Some(n) => n,
            None => {
                let Type::Struct(k) = ty else { return 0 };
                let Some(data) = self.symbol(self.struct_symbol(k)).structure() else {
                    return 0;
                };
                let mut total = 0;
                for item in self.reader(data.members) {
                    let Ok((_, PCode::Declaration { ty, .. })) = item else { continue };
                    total += self.size_of(ty);
                }
                total
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn struct_sizes_are_transitive() {
        let mut unit = Unit::new();

        let mut members = PCodeBuilder::new();
        members.push_declaration(Type::Integer, "a", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
        members.push_declaration(Type::Vector, "b", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
        let members = unit.append_pcode(&members);
        let (_, inner_ty) = unit.add_struct("inner", 2, members);
        assert_eq!(unit.size_of(inner_ty), 4);

        let mut members = PCodeBuilder::new();
        members.push_declaration(inner_ty, "i", 0, 2, SymbolFlags::empty(), &PCodeBuilder::new());
        members.push_declaration(Type::String, "s", 0, 2, SymbolFlags::empty(), &PCodeBuilder::new());
        let members = unit.append_pcode(&members);
        let (_, outer_ty) = unit.add_struct("outer", 2, members);
        assert_eq!(unit.size_of(outer_ty), 5);
    }

    #[test]
    fn function_args_are_measured() {
        let mut unit = Unit::new();
        let mut args = PCodeBuilder::new();
        args.push_declaration(Type::Integer, "n", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
        args.push_declaration(Type::Vector, "v", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
        let args = unit.append_pcode(&args);
        let id = unit
            .add_function("f", Type::Void, args, 0, 1, FunctionFlags::empty())
            .unwrap();
        let f = unit.symbol(id).function().unwrap();
        assert_eq!((f.arg_count, f.arg_size), (2, 4));
        assert!(!f.flags.contains(FunctionFlags::DEFINED));
    }

    #[test]
    fn first_symbol_wins_name_lookup() {
        let mut unit = Unit::new();
        let a = unit.add_global_variable(
            "g",
            Type::Integer,
            PCodeSlice::EMPTY,
            0,
            1,
            SymbolFlags::empty(),
        );
        let _shadow = unit.add_global_variable(
            "g",
            Type::Float,
            PCodeSlice::EMPTY,
            0,
            2,
            SymbolFlags::empty(),
        );
        assert_eq!(unit.find_symbol("g"), Some(a));
        assert!(unit.symbol(a).flags.contains(SymbolFlags::GLOBAL));
    }
}
