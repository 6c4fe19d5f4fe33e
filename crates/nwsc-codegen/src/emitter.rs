//! The stack-discipline emitter: lowers PCode to VM instructions while
//! tracking the three stack cursors and patching control-flow offsets.
//!
//! Cursor model, all in cells:
//! - `bp_depth` — cells below the base pointer (globals or enclosing
//!   frames);
//! - `sp_depth` — function locals, arguments included;
//! - `exp_depth` — expression transients above the stack pointer.
//!
//! Every emit helper updates the cursors by exactly the amount the VM
//! would at run time; statement boundaries check `exp_depth == 0` and
//! any violation aborts with an internal error.

use std::collections::HashMap;

use nwsc_core::{Type, TypeSizes};
use nwsc_ncs::ndb::{NdbFile, NdbFunction, NdbLine, NdbSourceFile, NdbStruct, NdbVariable};
use nwsc_ncs::{binary_type_byte, type_byte, Op};
use nwsc_pcode::{
    printer, single_constant_int, AssignOp, BinaryOp, BlockOp, ConstValue, FunctionFlags,
    Intrinsic, PCode, PCodeReader, PCodeSlice, SymbolFlags, SymbolId, SymbolKind, UnaryOp, Unit,
    NO_OFFSET,
};

use crate::buffer::CodeBuffer;
use crate::debuginfo::DebugTracker;
use crate::diag::{CodegenError, Diagnostic, EmitResult};
use crate::linker::{LabelId, Linker};
use crate::options::{CodeGenFlags, CodeGenOptions, GLOBALS_OPT_VERSION};
use crate::reachability::Reachability;
use crate::sideeffects::has_side_effects;

/// Which cursor a stack adjustment lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorSel {
    /// Adjust nothing (the adjustment is accounted elsewhere).
    None,
    /// Adjust the stack-pointer depth.
    Sp,
    /// Adjust the expression depth.
    Exp,
}

pub(crate) struct Emitter<'u, 'p> {
    unit: &'u mut Unit,
    pcode: &'p [u8],
    flags: CodeGenFlags,
    version: u32,
    dump_pcode: bool,
    make_debug: bool,

    out: CodeBuffer,
    linker: Linker,
    debug: DebugTracker,
    diags: Vec<Diagnostic>,

    global_scope: bool,
    bp_depth: i32,
    sp_depth: i32,
    exp_depth: i32,
    break_depth: i32,
    continue_depth: i32,
    return_size: i32,
    argument_size: i32,

    return_label: Option<LabelId>,
    break_label: Option<LabelId>,
    continue_label: Option<LabelId>,

    line_start: usize,
    case_labels: HashMap<usize, LabelId>,
    functions: Vec<SymbolId>,
}

/// Drive a full emission over `unit`. Returns the finished container
/// bytes, the debug sidecar if requested, and the collected warnings.
pub(crate) fn run(
    unit: &mut Unit,
    pcode: &[u8],
    options: &CodeGenOptions,
    make_debug: bool,
) -> EmitResult<(Vec<u8>, Option<NdbFile>, Vec<Diagnostic>)> {
    let mut emitter = Emitter::new(unit, pcode, options, make_debug);
    let ndb = emitter.generate()?;
    if emitter.linker.has_dangling_references() {
        return Err(CodegenError::Internal("unresolved label references remain".into()));
    }
    let Emitter { out, diags, .. } = emitter;
    Ok((out.into_vec(), ndb, diags))
}

impl<'u, 'p> Emitter<'u, 'p> {
    fn new(
        unit: &'u mut Unit,
        pcode: &'p [u8],
        options: &CodeGenOptions,
        make_debug: bool,
    ) -> Self {
        Self {
            unit,
            pcode,
            flags: options.resolve_flags(),
            version: options.version,
            dump_pcode: options.dump_pcode,
            make_debug,
            out: CodeBuffer::with_capacity(options.initial_capacity, options.max_script),
            linker: Linker::new(),
            debug: DebugTracker::new(),
            diags: Vec::new(),
            global_scope: false,
            bp_depth: 0,
            sp_depth: 0,
            exp_depth: 0,
            break_depth: 0,
            continue_depth: 0,
            return_size: 0,
            argument_size: 0,
            return_label: None,
            break_label: None,
            continue_label: None,
            line_start: 0,
            case_labels: HashMap::new(),
            functions: Vec::new(),
        }
    }

    fn size_of(&self, ty: Type) -> i32 {
        self.unit.size_of(ty)
    }

    fn internal(&self, message: impl Into<String>) -> CodegenError {
        CodegenError::Internal(message.into())
    }

    fn expect_balanced(&self, what: &str) -> EmitResult<()> {
        // Without the return accounting fix the cursor model drifts in
        // code that follows a `return`, exactly like the stock
        // compiler's did; the checks only hold under the fixed mode.
        if !self.flags.opt_return {
            return Ok(());
        }
        if self.exp_depth != 0 {
            return Err(self.internal(format!(
                "expression depth is {} at {what}, expected 0",
                self.exp_depth
            )));
        }
        Ok(())
    }

    /* ─────────────────────────── line accounting ─────────────────────────── */

    /// Flush the byte range since the last marker under `(file, line)`
    /// and restart the range at the current position.
    fn add_line_here(&mut self, file: i32, line: i32) {
        if file >= 0 {
            self.debug.add_line(file, line, self.line_start, self.out.pos());
        }
        self.line_start = self.out.pos();
    }

    /* ─────────────────────────── instruction emitters ─────────────────────────── */

    fn scalar_type_byte(&self, ty: Type) -> EmitResult<u8> {
        Ok(match ty {
            Type::Void => type_byte::VOID,
            Type::Integer => type_byte::INT,
            Type::Float => type_byte::FLOAT,
            Type::String => type_byte::STRING,
            Type::Object => type_byte::OBJECT,
            _ => return Err(self.internal(format!("invalid unary op type {ty}"))),
        })
    }

    fn emit_unary_op(&mut self, op: Op, ty: Type) -> EmitResult<()> {
        let byte = self.scalar_type_byte(ty)?;
        self.out.put_u8(op as u8)?;
        self.out.put_u8(byte)
    }

    fn emit_binary_op(
        &mut self,
        op: Op,
        use_tt: bool,
        out_ty: Type,
        lhs: Type,
        rhs: Type,
    ) -> EmitResult<()> {
        let mut extra: Option<i16> = None;
        let op_type = match (lhs, rhs) {
            (Type::Integer, Type::Integer) => binary_type_byte::II,
            (Type::Integer, Type::Float) => binary_type_byte::IF,
            (Type::Float, Type::Integer) => binary_type_byte::FI,
            (Type::Float, Type::Float) => binary_type_byte::FF,
            (Type::Float, Type::Vector) => binary_type_byte::FV,
            (Type::Object, Type::Object) => binary_type_byte::OO,
            (Type::String, Type::String) => binary_type_byte::SS,
            (Type::Vector, Type::Vector) if use_tt => {
                extra = Some(12);
                binary_type_byte::TT
            }
            (Type::Vector, Type::Vector) => binary_type_byte::VV,
            (Type::Vector, Type::Float) => binary_type_byte::VF,
            (Type::Engine(a), Type::Engine(b)) if a == b => binary_type_byte::ENGINE_BASE + a,
            (a, b) if use_tt && a.is_struct() && a == b => {
                extra = Some((self.size_of(a) * 4) as i16);
                binary_type_byte::TT
            }
            _ => return Err(self.internal(format!("invalid binary op over {lhs} and {rhs}"))),
        };

        self.exp_depth += self.size_of(out_ty) - (self.size_of(lhs) + self.size_of(rhs));

        self.out.put_u8(op as u8)?;
        self.out.put_u8(op_type)?;
        if let Some(v) = extra {
            self.out.put_i16(v)?;
        }
        Ok(())
    }

    fn emit_movsp(&mut self, count: i32, cursor: CursorSel) -> EmitResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.out.put_u8(Op::MovSp as u8)?;
        self.out.put_u8(type_byte::VOID)?;
        self.out.put_i32(-count * 4)?;
        match cursor {
            CursorSel::None => {}
            CursorSel::Sp => self.sp_depth -= count,
            CursorSel::Exp => self.exp_depth -= count,
        }
        Ok(())
    }

    fn emit_jump_op(&mut self, op: Op, label: LabelId) -> EmitResult<()> {
        self.out.ensure(6)?;
        let site = self.out.pos();
        self.out.put_u8(op as u8)?;
        self.out.put_u8(type_byte::VOID)?;
        self.out.put_i32(0)?;
        self.linker.reference(label, site, &mut self.out);
        Ok(())
    }

    fn emit_jmp(&mut self, label: LabelId) -> EmitResult<()> {
        self.emit_jump_op(Op::Jmp, label)
    }

    fn emit_jsr(&mut self, label: LabelId, arg_size: i32) -> EmitResult<()> {
        self.emit_jump_op(Op::Jsr, label)?;
        self.exp_depth -= arg_size;
        Ok(())
    }

    fn emit_jz(&mut self, label: LabelId) -> EmitResult<()> {
        self.emit_jump_op(Op::Jz, label)?;
        self.exp_depth -= 1;
        Ok(())
    }

    fn emit_jnz(&mut self, label: LabelId) -> EmitResult<()> {
        self.emit_jump_op(Op::Jnz, label)?;
        self.exp_depth -= 1;
        Ok(())
    }

    /// Raw stack copy. `stack_cells` is the source/target depth below
    /// the cursor, `count_cells` the copied span; both encode in bytes.
    fn emit_cp_raw(&mut self, op: Op, stack_cells: i32, count_cells: i32) -> EmitResult<()> {
        self.out.put_u8(op as u8)?;
        self.out.put_u8(type_byte::COPY)?;
        self.out.put_i32(-stack_cells * 4)?;
        self.out.put_i16((count_cells * 4) as i16)?;
        if matches!(op, Op::CpTopSp | Op::CpTopBp) {
            self.exp_depth += count_cells;
        }
        Ok(())
    }

    /// Symbol-addressed copy, resolving the cell offset per the
    /// addressing rules and wrapping it with pre/post inc/dec.
    #[allow(clippy::too_many_arguments)]
    fn emit_cp_symbol(
        &mut self,
        top: bool,
        symbol: SymbolId,
        ty: Type,
        source_ty: Type,
        flags: SymbolFlags,
        element: i32,
        stack_offset: i32,
    ) -> EmitResult<()> {
        let element_offset = if element != -1 { element } else { 0 };
        let element_size = self.size_of(ty);

        let (sp_rel, op, offset) = if flags.contains(SymbolFlags::GLOBAL) {
            let sym_offset = self.unit.symbol(symbol).stack_offset;
            if self.global_scope {
                (
                    true,
                    if top { Op::CpTopSp } else { Op::CpDownSp },
                    self.bp_depth + self.exp_depth - sym_offset,
                )
            } else {
                (
                    false,
                    if top { Op::CpTopBp } else { Op::CpDownBp },
                    self.bp_depth - sym_offset,
                )
            }
        } else {
            (
                true,
                if top { Op::CpTopSp } else { Op::CpDownSp },
                self.sp_depth + self.exp_depth - stack_offset,
            )
        };

        if flags.contains(SymbolFlags::PRE_INCREMENT) {
            self.emit_inc(if sp_rel { Op::IncISp } else { Op::IncIBp }, offset - element_offset)?;
        } else if flags.contains(SymbolFlags::PRE_DECREMENT) {
            self.emit_inc(if sp_rel { Op::DecISp } else { Op::DecIBp }, offset - element_offset)?;
        }

        if !top || element == -1 || self.flags.opt_struct_copy {
            self.emit_cp_raw(op, offset - element_offset, element_size)?;
        } else {
            let total = self.size_of(source_ty);
            self.emit_cp_raw(op, offset, total)?;
            self.emit_destruct(total, element, element_size)?;
        }

        // Post inc/dec sees the value just pushed, one cell further down.
        let post_adjust = if sp_rel { 1 } else { 0 };
        if flags.contains(SymbolFlags::POST_INCREMENT) {
            self.emit_inc(
                if sp_rel { Op::IncISp } else { Op::IncIBp },
                offset - element_offset + post_adjust,
            )?;
        } else if flags.contains(SymbolFlags::POST_DECREMENT) {
            self.emit_inc(
                if sp_rel { Op::DecISp } else { Op::DecIBp },
                offset - element_offset + post_adjust,
            )?;
        }
        Ok(())
    }

    fn emit_const_int(&mut self, value: i32) -> EmitResult<()> {
        self.emit_unary_op(Op::Const, Type::Integer)?;
        self.exp_depth += 1;
        self.out.put_i32(value)
    }

    fn emit_const_float(&mut self, value: f32) -> EmitResult<()> {
        self.emit_unary_op(Op::Const, Type::Float)?;
        self.exp_depth += 1;
        self.out.put_f32(value)
    }

    fn emit_const_object(&mut self, id: u32) -> EmitResult<()> {
        self.emit_unary_op(Op::Const, Type::Object)?;
        self.exp_depth += 1;
        self.out.put_i32(id as i32)
    }

    fn emit_const_string(&mut self, value: &str) -> EmitResult<()> {
        self.emit_unary_op(Op::Const, Type::String)?;
        self.exp_depth += 1;
        self.out.put_i16(value.len() as i16)?;
        self.out.put_bytes(value.as_bytes())
    }

    /// Default-initialize a structure value member by member.
    fn emit_const_default(&mut self, ty: Type) -> EmitResult<()> {
        let Type::Struct(k) = ty else {
            return Err(self.internal(format!("default constant of non-structure type {ty}")));
        };
        let members = self
            .unit
            .symbol(self.unit.struct_symbol(k))
            .structure()
            .ok_or_else(|| self.internal("structure symbol has no member table"))?
            .members;
        let buf = self.pcode;
        for item in PCodeReader::new(buf, members) {
            let (_, record) = item?;
            let PCode::Declaration { ty: member_ty, .. } = record else {
                return Err(self.internal("structure member table holds a non-declaration"));
            };
            match member_ty {
                Type::Integer => self.emit_const_int(0)?,
                Type::Float => self.emit_const_float(0.0)?,
                Type::String => self.emit_const_string("")?,
                Type::Object => self.emit_const_object(0)?,
                Type::Vector => {
                    self.emit_const_float(0.0)?;
                    self.emit_const_float(0.0)?;
                    self.emit_const_float(0.0)?;
                }
                t if t.is_struct() => self.emit_const_default(t)?,
                t => return Err(self.internal(format!("invalid structure member type {t}"))),
            }
        }
        Ok(())
    }

    fn emit_action(&mut self, ret: Type, action: i16, argc: u8, arg_size: i32) -> EmitResult<()> {
        self.out.put_u8(Op::Action as u8)?;
        self.out.put_u8(type_byte::VOID)?;
        self.out.put_i16(action)?;
        self.out.put_u8(argc)?;
        self.exp_depth -= arg_size;
        self.exp_depth += self.size_of(ret);
        Ok(())
    }

    fn emit_destruct(&mut self, total: i32, element: i32, size: i32) -> EmitResult<()> {
        self.out.put_u8(Op::Destruct as u8)?;
        self.out.put_u8(type_byte::COPY)?;
        self.out.put_i16((total * 4) as i16)?;
        self.out.put_i16((element * 4) as i16)?;
        self.out.put_i16((size * 4) as i16)?;
        self.exp_depth -= total;
        self.exp_depth += size;
        Ok(())
    }

    fn emit_store_state(&mut self) -> EmitResult<()> {
        // A state captured at global scope snapshots a globals frame
        // that later declarations will not match.
        if self.global_scope {
            self.diags.push(Diagnostic::warn(
                "deferred statement at global scope captures an incomplete globals frame",
            ));
        }
        self.out.put_u8(Op::StoreState as u8)?;
        self.out.put_u8(type_byte::STORE_STATE)?;
        self.out.put_i32(self.bp_depth * 4)?;
        self.out.put_i32((self.return_size + self.sp_depth) * 4)
    }

    fn emit_inc(&mut self, op: Op, depth_cells: i32) -> EmitResult<()> {
        self.out.put_u8(op as u8)?;
        self.out.put_u8(type_byte::INT)?;
        self.out.put_i32(-depth_cells * 4)
    }

    fn emit_nop(&mut self) -> EmitResult<()> {
        self.out.put_u8(Op::Nop as u8)?;
        self.out.put_u8(type_byte::VOID)
    }

    fn emit_rsadd(&mut self, byte: u8) -> EmitResult<()> {
        self.out.put_u8(Op::RsAdd as u8)?;
        self.out.put_u8(byte)
    }

    /* ─────────────────────────── declarations ─────────────────────────── */

    fn optimized_declaration_permitted(&self, init: PCodeSlice, flags: SymbolFlags) -> bool {
        // A self-referencing initializer needs the variable on the stack
        // while the expression runs, which only the reserve form gives.
        if flags.contains(SymbolFlags::SELF_REFERENCE_DEF) {
            return false;
        }
        self.flags.opt_declaration && !init.is_empty()
    }

    /// Lower one declaration. Returns the compiled-start offset of the
    /// declared storage.
    fn emit_declaration(
        &mut self,
        ty: Type,
        cursor: CursorSel,
        init: PCodeSlice,
        flags: SymbolFlags,
    ) -> EmitResult<usize> {
        if self.optimized_declaration_permitted(init, flags) {
            // The initializer's result cells become the storage.
            let start = self.out.pos();
            let exp_save = self.exp_depth;
            self.code_block(init)?;
            if cursor != CursorSel::Exp {
                let diff = self.exp_depth - exp_save;
                self.exp_depth = exp_save;
                if cursor == CursorSel::Sp {
                    self.sp_depth += diff;
                }
            }
            return Ok(start);
        }

        match ty {
            Type::Integer => self.emit_rsadd(type_byte::INT)?,
            Type::Float => self.emit_rsadd(type_byte::FLOAT)?,
            Type::String => self.emit_rsadd(type_byte::STRING)?,
            Type::Object => self.emit_rsadd(type_byte::OBJECT)?,
            Type::Vector => {
                self.emit_rsadd(type_byte::FLOAT)?;
                self.emit_rsadd(type_byte::FLOAT)?;
                self.emit_rsadd(type_byte::FLOAT)?;
            }
            Type::Engine(k) => self.emit_rsadd(type_byte::ENGINE_BASE + k)?,
            Type::Struct(k) => {
                let members = self
                    .unit
                    .symbol(self.unit.struct_symbol(k))
                    .structure()
                    .ok_or_else(|| self.internal("structure symbol has no member table"))?
                    .members;
                let buf = self.pcode;
                for item in PCodeReader::new(buf, members) {
                    let (_, record) = item?;
                    let PCode::Declaration { ty: member_ty, flags: member_flags, init, .. } =
                        record
                    else {
                        return Err(
                            self.internal("structure member table holds a non-declaration")
                        );
                    };
                    self.emit_declaration(member_ty, CursorSel::None, init, member_flags)?;
                }
            }
            _ => return Err(self.internal(format!("invalid declaration type {ty}"))),
        }

        let start = self.out.pos();
        let size = self.size_of(ty);
        match cursor {
            CursorSel::None => {}
            CursorSel::Sp => self.sp_depth += size,
            CursorSel::Exp => self.exp_depth += size,
        }

        if !init.is_empty() {
            self.code_block(init)?;
            self.emit_cp_raw(Op::CpDownSp, size * 2, size)?;
            self.emit_movsp(size, CursorSel::Exp)?;
        }
        Ok(start)
    }

    /* ─────────────────────────── intrinsics ─────────────────────────── */

    fn check_intrinsic_arity(&self, name: &str, argc: u32, expected: u32) -> EmitResult<()> {
        if argc != expected {
            return Err(self.internal(format!(
                "intrinsic `{name}` takes {expected} argument(s), got {argc}"
            )));
        }
        Ok(())
    }

    fn emit_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        name: &str,
        argc: u32,
        arg_size: i32,
    ) -> EmitResult<()> {
        match intrinsic {
            // Read the pointer SAVEBP parks on the stack into the
            // intrinsic's return slot.
            Intrinsic::ReadBp => {
                self.check_intrinsic_arity(name, argc, 0)?;
                self.emit_unary_op(Op::SaveBp, Type::Void)?;
                self.emit_cp_raw(Op::CpDownSp, 2, 1)?;
                self.emit_unary_op(Op::RestoreBp, Type::Void)?;
            }
            // Overwrite the parked pointer before RESTOREBP picks it up.
            Intrinsic::WriteBp => {
                self.check_intrinsic_arity(name, argc, 1)?;
                self.emit_unary_op(Op::SaveBp, Type::Void)?;
                self.emit_cp_raw(Op::CpTopSp, 2, 1)?;
                self.emit_cp_raw(Op::CpDownSp, 2, 1)?;
                self.emit_movsp(1, CursorSel::Exp)?;
                self.emit_unary_op(Op::RestoreBp, Type::Void)?;
            }
            Intrinsic::ReadRelativeSp => {
                self.check_intrinsic_arity(name, argc, 0)?;
                let depth = self.sp_depth;
                self.emit_const_int(depth)?;
                self.emit_cp_raw(Op::CpDownSp, 2, 1)?;
                self.emit_movsp(1, CursorSel::Exp)?;
            }
            // Establish a BP frame twice so the second SAVEBP pushes the
            // absolute SP at the first, then subtract the transient
            // depth back out.
            Intrinsic::ReadSp => {
                self.check_intrinsic_arity(name, argc, 0)?;
                let bias = self.exp_depth + 2;
                self.emit_declaration(
                    Type::Integer,
                    CursorSel::Exp,
                    PCodeSlice::EMPTY,
                    SymbolFlags::empty(),
                )?;
                self.emit_const_int(bias)?;
                self.emit_unary_op(Op::SaveBp, Type::Void)?;
                self.emit_unary_op(Op::SaveBp, Type::Void)?;
                self.emit_cp_raw(Op::CpDownSp, 4, 1)?;
                self.emit_unary_op(Op::RestoreBp, Type::Void)?;
                self.emit_unary_op(Op::RestoreBp, Type::Void)?;
                self.emit_binary_op(Op::Sub, false, Type::Integer, Type::Integer, Type::Integer)?;
                self.emit_cp_raw(Op::CpDownSp, 2, 1)?;
                self.emit_movsp(1, CursorSel::Exp)?;
            }
            Intrinsic::ReadPc => {
                self.check_intrinsic_arity(name, argc, 0)?;
                let pc = (self.out.pos() - nwsc_ncs::HEADER_SIZE) as i32;
                self.emit_const_int(pc)?;
                self.emit_cp_raw(Op::CpDownSp, 2, 1)?;
                self.emit_movsp(1, CursorSel::Exp)?;
            }
        }
        if arg_size != 0 {
            self.emit_movsp(arg_size, CursorSel::Exp)?;
        }
        Ok(())
    }

    /* ─────────────────────────── case scan ─────────────────────────── */

    /// First switch pass: emit the selector comparisons and collect the
    /// case/default labels, keyed by record offset.
    fn scan_cases(
        &mut self,
        slice: PCodeSlice,
        default_label: &mut Option<LabelId>,
    ) -> EmitResult<()> {
        let buf = self.pcode;
        for item in PCodeReader::new(buf, slice) {
            let (at, record) = item?;
            match record {
                PCode::Statement { body, .. } => self.scan_cases(body, default_label)?,
                PCode::Case { key, .. } => {
                    let label = self.linker.forward_label();
                    self.case_labels.insert(at, label);
                    self.emit_cp_raw(Op::CpTopSp, 1, 1)?;
                    self.code_block(key)?;
                    self.emit_binary_op(
                        Op::Equal,
                        false,
                        Type::Integer,
                        Type::Integer,
                        Type::Integer,
                    )?;
                    self.emit_jnz(label)?;
                }
                PCode::Default { .. } => {
                    let label = self.linker.forward_label();
                    self.case_labels.insert(at, label);
                    *default_label = Some(label);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /* ─────────────────────────── block lowering ─────────────────────────── */

    fn code_block(&mut self, slice: PCodeSlice) -> EmitResult<()> {
        let buf = self.pcode;
        for item in PCodeReader::new(buf, slice) {
            let (at, record) = item?;
            match record {
                PCode::Variable { ty, source_ty, symbol, element, stack_offset, flags } => {
                    let constant_global = flags.contains(SymbolFlags::GLOBAL)
                        && self
                            .unit
                            .symbol(symbol)
                            .flags
                            .contains(SymbolFlags::TREAT_AS_CONSTANT);
                    if constant_global {
                        let init = self
                            .unit
                            .symbol(symbol)
                            .variable()
                            .ok_or_else(|| self.internal("constant global is not a variable"))?
                            .init;
                        self.code_block(init)?;
                    } else {
                        self.emit_cp_symbol(
                            true,
                            symbol,
                            ty,
                            source_ty,
                            flags,
                            element,
                            stack_offset,
                        )?;
                    }
                }

                PCode::Declaration { ty, name, flags, init, .. } => {
                    let depth = self.sp_depth + self.return_size;
                    let start = self.emit_declaration(ty, CursorSel::Sp, init, flags)?;
                    if self.make_debug {
                        let at = self.debug.add_local(name, ty);
                        let var = self.debug.local_mut(at);
                        var.compiled_start = start as u32;
                        var.stack_offset = depth;
                    }
                }

                PCode::Argument { body, .. } => self.code_block(body)?,

                PCode::Statement { locals, body } => {
                    self.expect_balanced("statement entry")?;
                    self.code_block(body)?;
                    if locals != 0 {
                        if self.make_debug {
                            let depth = self.return_size + self.sp_depth - locals;
                            self.debug.purge(depth, self.out.pos());
                        }
                        self.emit_movsp(locals, CursorSel::Sp)?;
                        self.line_start = self.out.pos();
                    }
                    self.expect_balanced("statement exit")?;
                }

                PCode::Call { ty, symbol, args, .. } => {
                    self.lower_call(ty, symbol, args)?;
                }

                PCode::Element { ty, lhs_ty, element, body } => {
                    self.code_block(body)?;
                    let total = self.size_of(lhs_ty);
                    let size = self.size_of(ty);
                    self.emit_destruct(total, element, size)?;
                }

                PCode::Break => {
                    let label = self
                        .break_label
                        .ok_or_else(|| self.internal("break outside of a breakable scope"))?;
                    if self.flags.no_bug_break_continue && self.break_depth < self.sp_depth {
                        self.emit_movsp(self.sp_depth - self.break_depth, CursorSel::None)?;
                    }
                    self.emit_jmp(label)?;
                }

                PCode::Continue => {
                    let label = self
                        .continue_label
                        .ok_or_else(|| self.internal("continue outside of a loop"))?;
                    if self.flags.no_bug_break_continue && self.continue_depth < self.sp_depth {
                        self.emit_movsp(self.sp_depth - self.continue_depth, CursorSel::None)?;
                    }
                    self.emit_jmp(label)?;
                }

                PCode::Return { value, .. } => {
                    let label = self
                        .return_label
                        .ok_or_else(|| self.internal("return outside of a function"))?;
                    if !value.is_empty() {
                        self.code_block(value)?;
                        self.emit_cp_raw(
                            Op::CpDownSp,
                            self.return_size + self.sp_depth + self.exp_depth,
                            self.return_size,
                        )?;
                    }
                    self.emit_movsp(
                        self.sp_depth + self.exp_depth - self.argument_size,
                        CursorSel::None,
                    )?;
                    if self.flags.opt_return {
                        self.exp_depth -= self.return_size;
                    }
                    self.emit_jmp(label)?;
                }

                PCode::Case { file, line, .. } | PCode::Default { file, line } => {
                    self.line_start = self.out.pos();
                    self.add_line_here(file, line);
                    if let Some(label) = self.case_labels.remove(&at) {
                        self.linker.resolve(label, &mut self.out)?;
                    }
                }

                PCode::Block5 { op, ty, slots } => match op {
                    BlockOp::Switch => self.lower_switch(&slots)?,
                    BlockOp::If => self.lower_if(&slots)?,
                    BlockOp::Do => self.lower_do(&slots)?,
                    BlockOp::While => self.lower_while(&slots)?,
                    BlockOp::For => self.lower_for(&slots)?,
                    BlockOp::Conditional => self.lower_conditional(ty, &slots)?,
                },

                PCode::Assignment {
                    op,
                    ty,
                    source_ty,
                    rhs_ty,
                    symbol,
                    element,
                    stack_offset,
                    flags,
                    rhs,
                } => {
                    let bin = match op {
                        AssignOp::Assign => None,
                        AssignOp::Multiply => Some(Op::Mul),
                        AssignOp::Divide => Some(Op::Div),
                        AssignOp::Modulus => Some(Op::Mod),
                        AssignOp::Add => Some(Op::Add),
                        AssignOp::Subtract => Some(Op::Sub),
                        AssignOp::ShiftLeft => Some(Op::ShLeft),
                        AssignOp::ShiftRight => Some(Op::ShRight),
                        AssignOp::UnsignedShiftRight => Some(Op::UShRight),
                        AssignOp::BitwiseAnd => Some(Op::BoolAnd),
                        AssignOp::BitwiseXor => Some(Op::ExcOr),
                        AssignOp::BitwiseOr => Some(Op::IncOr),
                    };
                    if let Some(bin) = bin {
                        self.emit_cp_symbol(
                            true,
                            symbol,
                            ty,
                            source_ty,
                            flags,
                            element,
                            stack_offset,
                        )?;
                        self.code_block(rhs)?;
                        self.emit_binary_op(bin, false, ty, ty, rhs_ty)?;
                    } else {
                        self.code_block(rhs)?;
                    }
                    // The assigned value stays on the stack as the
                    // expression's result.
                    self.emit_cp_symbol(false, symbol, ty, ty, flags, element, stack_offset)?;
                }

                PCode::UnaryOp { op, ty } => {
                    let vm_op = match op {
                        UnaryOp::Negate => Op::Neg,
                        UnaryOp::BitwiseNot => Op::Comp,
                        UnaryOp::LogicalNot => Op::Not,
                    };
                    self.emit_unary_op(vm_op, ty)?;
                }

                PCode::BinaryOp { op, ty, lhs, rhs } => {
                    let (vm_op, use_tt) = match op {
                        BinaryOp::Multiply => (Op::Mul, false),
                        BinaryOp::Divide => (Op::Div, false),
                        BinaryOp::Modulus => (Op::Mod, false),
                        BinaryOp::Add => (Op::Add, false),
                        BinaryOp::Subtract => (Op::Sub, false),
                        BinaryOp::ShiftLeft => (Op::ShLeft, false),
                        BinaryOp::ShiftRight => (Op::ShRight, false),
                        BinaryOp::UnsignedShiftRight => (Op::UShRight, false),
                        BinaryOp::LessThan => (Op::Lt, false),
                        BinaryOp::GreaterThan => (Op::Gt, false),
                        BinaryOp::LessThanEq => (Op::Leq, false),
                        BinaryOp::GreaterThanEq => (Op::Geq, false),
                        BinaryOp::Equal => (Op::Equal, true),
                        BinaryOp::NotEqual => (Op::NEqual, true),
                        BinaryOp::BitwiseAnd => (Op::BoolAnd, false),
                        BinaryOp::BitwiseXor => (Op::ExcOr, false),
                        BinaryOp::BitwiseOr => (Op::IncOr, false),
                    };
                    self.emit_binary_op(vm_op, use_tt, ty, lhs, rhs)?;
                }

                PCode::LogicalAnd { lhs, rhs } => {
                    let end = self.linker.forward_label();
                    self.code_block(lhs)?;
                    self.emit_cp_raw(Op::CpTopSp, 1, 1)?;
                    self.emit_jz(end)?;
                    self.code_block(rhs)?;
                    self.emit_binary_op(
                        Op::LogAnd,
                        false,
                        Type::Integer,
                        Type::Integer,
                        Type::Integer,
                    )?;
                    self.linker.resolve(end, &mut self.out)?;
                }

                PCode::LogicalOr { lhs, rhs } => self.lower_logical_or(lhs, rhs)?,

                PCode::Constant(value) => match value {
                    ConstValue::Integer(v) => self.emit_const_int(v)?,
                    ConstValue::Float(v) => self.emit_const_float(v)?,
                    ConstValue::String(v) => self.emit_const_string(v)?,
                    ConstValue::Object(v) => self.emit_const_object(v)?,
                    ConstValue::Vector(v) => {
                        self.emit_const_float(v[0])?;
                        self.emit_const_float(v[1])?;
                        self.emit_const_float(v[2])?;
                    }
                    ConstValue::Struct(t) => self.emit_const_default(t)?,
                },

                PCode::ExpressionEnd { ty } => {
                    let size = self.size_of(ty);
                    self.emit_movsp(size, CursorSel::Exp)?;
                    self.expect_balanced("expression statement end")?;
                }

                PCode::Line { file, line } => self.add_line_here(file, line),
            }
        }
        Ok(())
    }

    /* ─────────────────────────── calls ─────────────────────────── */

    fn lower_call(&mut self, ret: Type, symbol: SymbolId, args: PCodeSlice) -> EmitResult<()> {
        let callee_flags = self.unit.symbol(symbol).flags;
        let callee_name = self.unit.symbol(symbol).name.clone();
        let (fn_arg_count, fn_arg_size, fn_args, fn_action, fn_intrinsic, fn_flags) = {
            let f = self
                .unit
                .symbol(symbol)
                .function()
                .ok_or_else(|| self.internal(format!("call target `{callee_name}` is not a function")))?;
            (f.arg_count, f.arg_size, f.args, f.action, f.intrinsic, f.flags)
        };

        // Reserve the return cells; engine calls push their result
        // themselves.
        if !callee_flags.contains(SymbolFlags::ENGINE_FUNC) && ret != Type::Void {
            self.emit_declaration(ret, CursorSel::Exp, PCodeSlice::EMPTY, SymbolFlags::empty())?;
        }

        // Pair each parameter with the supplied argument, falling back
        // to the declaration's default initializer for the tail.
        let buf = self.pcode;
        let mut sources: Vec<(Type, PCodeSlice)> = Vec::new();
        for item in PCodeReader::new(buf, args) {
            let (_, record) = item?;
            match record {
                PCode::Argument { ty, body } => sources.push((ty, body)),
                PCode::Declaration { ty, init, .. } => sources.push((ty, init)),
                _ => return Err(self.internal("unexpected record in call arguments")),
            }
        }
        if sources.len() < fn_arg_count as usize {
            let mut defaults = Vec::new();
            for item in PCodeReader::new(buf, fn_args) {
                let (_, record) = item?;
                if let PCode::Declaration { ty, init, .. } = record {
                    defaults.push((ty, init));
                }
            }
            for i in sources.len()..fn_arg_count as usize {
                let &(ty, init) = defaults
                    .get(i)
                    .ok_or_else(|| self.internal("missing default for call argument"))?;
                sources.push((ty, init));
            }
        }
        if sources.len() != fn_arg_count as usize {
            return Err(self.internal(format!(
                "call to `{callee_name}` supplies {} arguments, expected {fn_arg_count}",
                sources.len()
            )));
        }

        // Arguments go onto the stack right-to-left.
        for &(arg_ty, body) in sources.iter().rev() {
            if arg_ty == Type::Action {
                // A deferred statement: capture the VM state, then skip
                // the statement body that the captured state will run.
                let end = self.linker.forward_label();
                let exp_save = self.exp_depth;
                self.sp_depth += exp_save;
                self.exp_depth = 0;
                self.emit_store_state()?;
                self.emit_jmp(end)?;
                self.code_block(body)?;
                self.emit_unary_op(Op::Retn, Type::Void)?;
                self.linker.resolve(end, &mut self.out)?;
                self.sp_depth -= exp_save;
                self.exp_depth += exp_save;
            } else {
                self.code_block(body)?;
            }
        }

        if callee_flags.contains(SymbolFlags::ENGINE_FUNC) {
            self.emit_action(ret, fn_action as i16, fn_arg_count as u8, fn_arg_size)?;
        } else if callee_flags.contains(SymbolFlags::INTRINSIC) {
            let intrinsic = fn_intrinsic
                .ok_or_else(|| self.internal(format!("intrinsic `{callee_name}` has no id")))?;
            self.emit_intrinsic(intrinsic, &callee_name, fn_arg_count, fn_arg_size)?;
        } else {
            if fn_flags.contains(FunctionFlags::USES_GLOBAL_VARS) && self.global_scope {
                self.diags.push(Diagnostic::warn(format!(
                    "function `{callee_name}` uses global variables but is called before the \
                     globals frame is established"
                )));
            }
            let label = self.linker.named_label(&callee_name);
            self.emit_jsr(label, fn_arg_size)?;
        }
        Ok(())
    }

    /* ─────────────────────────── control flow ─────────────────────────── */

    fn const_condition(&self, slice: PCodeSlice) -> Option<i32> {
        if self.flags.opt_conditional {
            single_constant_int(self.pcode, slice)
        } else {
            None
        }
    }

    fn lower_switch(&mut self, slots: &[nwsc_pcode::BlockSlot; 5]) -> EmitResult<()> {
        let end = self.linker.forward_label();
        let break_save = (self.break_label, self.break_depth);
        self.break_label = Some(end);
        // The selector cell below the cases counts as block stack.
        self.break_depth = self.sp_depth + 1;
        let mut default_label = None;
        self.line_start = self.out.pos();

        self.code_block(slots[1].body)?;
        self.scan_cases(slots[3].body, &mut default_label)?;
        self.emit_jmp(default_label.unwrap_or(end))?;
        self.add_line_here(slots[1].file, slots[1].line);
        self.line_start = self.out.pos();

        // The selector becomes an ordinary stack variable for the body.
        self.sp_depth += 1;
        self.exp_depth -= 1;

        self.code_block(slots[3].body)?;

        self.linker.resolve(end, &mut self.out)?;
        self.emit_movsp(1, CursorSel::Sp)?;

        (self.break_label, self.break_depth) = break_save;
        self.line_start = self.out.pos();
        Ok(())
    }

    fn lower_if(&mut self, slots: &[nwsc_pcode::BlockSlot; 5]) -> EmitResult<()> {
        if let Some(value) = self.const_condition(slots[1].body) {
            return if value != 0 {
                self.code_block(slots[3].body)
            } else {
                self.code_block(slots[4].body)
            };
        }

        if slots[4].body.is_empty() && self.flags.opt_if {
            let end = self.linker.forward_label();
            self.code_block(slots[1].body)?;
            self.add_line_here(slots[1].file, slots[1].line);
            self.emit_jz(end)?;
            self.line_start = self.out.pos();
            self.code_block(slots[3].body)?;
            self.linker.resolve(end, &mut self.out)?;
            return Ok(());
        }

        let end = self.linker.forward_label();
        let else_label = self.linker.forward_label();
        self.code_block(slots[1].body)?;
        self.add_line_here(slots[1].file, slots[1].line);
        self.emit_jz(else_label)?;
        self.line_start = self.out.pos();
        self.code_block(slots[3].body)?;
        self.emit_jmp(end)?;
        self.line_start = self.out.pos();
        self.linker.resolve(else_label, &mut self.out)?;
        if self.version >= GLOBALS_OPT_VERSION
            && (!slots[4].body.is_empty() || slots[4].file >= 0)
        {
            // Landing pad so the debugger can stop on the else branch.
            self.line_start = self.out.pos();
            self.emit_nop()?;
            self.add_line_here(slots[3].file, slots[3].line);
            self.line_start = self.out.pos();
        }
        self.code_block(slots[4].body)?;
        self.linker.resolve(end, &mut self.out)
    }

    fn lower_do(&mut self, slots: &[nwsc_pcode::BlockSlot; 5]) -> EmitResult<()> {
        let start = self.linker.forward_label();
        let end = self.linker.forward_label();
        let test = self.linker.forward_label();

        let break_save = (self.break_label, self.break_depth);
        let continue_save = (self.continue_label, self.continue_depth);
        self.break_label = Some(end);
        self.continue_label = Some(test);
        self.break_depth = self.sp_depth;
        self.continue_depth = self.sp_depth;

        self.linker.resolve(start, &mut self.out)?;
        self.code_block(slots[3].body)?;

        self.line_start = self.out.pos();
        self.linker.resolve(test, &mut self.out)?;
        if let Some(value) = self.const_condition(slots[1].body) {
            self.line_start = self.out.pos();
            if value != 0 {
                self.emit_jmp(start)?;
            }
        } else {
            self.code_block(slots[1].body)?;
            if self.flags.opt_do {
                self.emit_jnz(start)?;
            } else {
                self.emit_jz(end)?;
                self.emit_jmp(start)?;
            }
        }
        self.add_line_here(slots[1].file, slots[1].line);
        self.linker.resolve(end, &mut self.out)?;

        (self.break_label, self.break_depth) = break_save;
        (self.continue_label, self.continue_depth) = continue_save;
        Ok(())
    }

    fn lower_while(&mut self, slots: &[nwsc_pcode::BlockSlot; 5]) -> EmitResult<()> {
        let condition = self.const_condition(slots[1].body);
        if condition == Some(0) {
            return Ok(());
        }

        let test = self.linker.forward_label();
        let end = self.linker.forward_label();
        let continue_label = self.linker.forward_label();

        let break_save = (self.break_label, self.break_depth);
        let continue_save = (self.continue_label, self.continue_depth);
        self.break_label = Some(end);
        self.continue_label = Some(continue_label);
        self.break_depth = self.sp_depth;
        self.continue_depth = self.sp_depth;

        self.linker.resolve(test, &mut self.out)?;
        if self.flags.opt_while {
            self.linker.resolve(continue_label, &mut self.out)?;
        }
        if condition.is_none() {
            self.line_start = self.out.pos();
            self.code_block(slots[1].body)?;
            self.emit_jz(end)?;
            self.add_line_here(slots[1].file, slots[1].line);
        }
        self.code_block(slots[3].body)?;
        if !self.flags.opt_while {
            self.linker.resolve(continue_label, &mut self.out)?;
        }
        self.emit_jmp(test)?;
        self.linker.resolve(end, &mut self.out)?;
        self.line_start = self.out.pos();

        (self.break_label, self.break_depth) = break_save;
        (self.continue_label, self.continue_depth) = continue_save;
        Ok(())
    }

    fn lower_for(&mut self, slots: &[nwsc_pcode::BlockSlot; 5]) -> EmitResult<()> {
        let condition = self.const_condition(slots[1].body);

        let test = self.linker.forward_label();
        let end = self.linker.forward_label();
        let increment = self.linker.forward_label();

        let break_save = (self.break_label, self.break_depth);
        let continue_save = (self.continue_label, self.continue_depth);
        self.break_label = Some(end);
        self.continue_label = Some(increment);
        self.break_depth = self.sp_depth;
        self.continue_depth = self.sp_depth;

        // Initializer: evaluate and drop any expression residue.
        self.expect_balanced("for initializer")?;
        self.line_start = self.out.pos();
        self.code_block(slots[0].body)?;
        if self.exp_depth != 0 {
            self.emit_movsp(self.exp_depth, CursorSel::Exp)?;
        }
        self.add_line_here(slots[0].file, slots[0].line);

        self.linker.resolve(test, &mut self.out)?;
        if condition.is_none() {
            if slots[1].body.is_empty() {
                if !self.flags.opt_for {
                    self.emit_const_int(1)?;
                    self.emit_jz(end)?;
                }
            } else {
                self.code_block(slots[1].body)?;
                self.emit_jz(end)?;
            }
        }

        if condition != Some(0) {
            self.line_start = self.out.pos();
            self.code_block(slots[3].body)?;
        }

        self.linker.resolve(increment, &mut self.out)?;
        if condition != Some(0) {
            self.expect_balanced("for step")?;
            self.line_start = self.out.pos();
            self.code_block(slots[2].body)?;
            if self.exp_depth != 0 {
                self.emit_movsp(self.exp_depth, CursorSel::Exp)?;
            }
            self.add_line_here(slots[0].file, slots[0].line);
            self.emit_jmp(test)?;
        }

        self.linker.resolve(end, &mut self.out)?;

        self.line_start = self.out.pos();
        (self.break_label, self.break_depth) = break_save;
        (self.continue_label, self.continue_depth) = continue_save;
        Ok(())
    }

    fn lower_conditional(&mut self, ty: Type, slots: &[nwsc_pcode::BlockSlot; 5]) -> EmitResult<()> {
        if let Some(value) = self.const_condition(slots[1].body) {
            return if value != 0 {
                self.code_block(slots[3].body)
            } else {
                self.code_block(slots[4].body)
            };
        }

        let end = self.linker.forward_label();
        let else_label = self.linker.forward_label();
        self.code_block(slots[1].body)?;
        self.emit_jz(else_label)?;
        self.code_block(slots[3].body)?;
        // Only one branch materializes at run time.
        self.exp_depth -= self.size_of(ty);
        self.emit_jmp(end)?;
        self.linker.resolve(else_label, &mut self.out)?;
        self.code_block(slots[4].body)?;
        self.linker.resolve(end, &mut self.out)
    }

    fn lower_logical_or(&mut self, lhs: PCodeSlice, rhs: PCodeSlice) -> EmitResult<()> {
        if self.flags.no_bug_logical_or {
            let end = self.linker.forward_label();
            self.code_block(lhs)?;
            self.emit_cp_raw(Op::CpTopSp, 1, 1)?;
            self.emit_jnz(end)?;
            self.code_block(rhs)?;
            self.emit_binary_op(Op::LogOr, false, Type::Integer, Type::Integer, Type::Integer)?;
            self.linker.resolve(end, &mut self.out)
        } else {
            // Quirk-compatible shape. Before version 130 the second test
            // re-checks for zero, so a true left side still evaluates
            // the right side; the stock VM shipped with that behavior
            // and old binaries expect the byte sequence.
            let end = self.linker.forward_label();
            let rhs_label = self.linker.forward_label();
            self.code_block(lhs)?;
            self.emit_cp_raw(Op::CpTopSp, 1, 1)?;
            self.emit_jz(rhs_label)?;
            self.emit_cp_raw(Op::CpTopSp, 1, 1)?;
            if self.version >= GLOBALS_OPT_VERSION {
                self.emit_jmp(end)?;
                self.exp_depth -= 1;
            } else {
                self.emit_jz(end)?;
            }
            self.linker.resolve(rhs_label, &mut self.out)?;
            self.code_block(rhs)?;
            self.linker.resolve(end, &mut self.out)?;
            self.emit_binary_op(Op::LogOr, false, Type::Integer, Type::Integer, Type::Integer)
        }
    }

    /* ─────────────────────────── routines ─────────────────────────── */

    fn emit_routine(&mut self, symbol: SymbolId) -> EmitResult<()> {
        let name = self.unit.symbol(symbol).name.clone();
        let ret = self.unit.symbol(symbol).ty;
        let (arg_size, code, fn_args, arg_count, mut file, mut line, fn_flags) = {
            let f = self
                .unit
                .symbol(symbol)
                .function()
                .ok_or_else(|| self.internal(format!("`{name}` is not a function")))?;
            (f.arg_size, f.code, f.args, f.arg_count, f.file, f.line, f.flags)
        };

        if self.dump_pcode {
            log::debug!("pcode for function `{name}`:\n{}", printer::render(self.unit, code));
        }

        if !fn_flags.contains(FunctionFlags::DEFINED)
            && !fn_flags.contains(FunctionFlags::DEFAULT_FUNCTION)
        {
            return Err(CodegenError::FunctionBodyMissing(name));
        }
        let default_function = !fn_flags.contains(FunctionFlags::DEFINED);

        // Defaulted functions have no real source position.
        if file == -1 || line == -1 {
            file = 0;
            line = 0;
        }

        let routine = self.linker.named_label(&name);
        self.linker.resolve(routine, &mut self.out)?;

        let return_label = self.linker.forward_label();
        self.return_label = Some(return_label);
        self.return_size = self.size_of(ret);

        if self.make_debug {
            if ret != Type::Void {
                let at = self.debug.add_local("#retval", ret);
                let pos = self.out.pos() as u32;
                let var = self.debug.local_mut(at);
                var.compiled_start = pos;
                var.stack_offset = 0;
            }
            if arg_count > 0 {
                let buf = self.pcode;
                let mut params: Vec<(String, Type)> = Vec::new();
                for item in PCodeReader::new(buf, fn_args) {
                    let (_, record) = item?;
                    if let PCode::Declaration { ty, name, .. } = record {
                        params.push((name.to_string(), ty));
                    }
                }
                let mut offset = self.return_size;
                for (param_name, param_ty) in params.into_iter().rev() {
                    let size = self.size_of(param_ty);
                    let at = self.debug.add_local(param_name, param_ty);
                    let pos = self.out.pos() as u32;
                    let var = self.debug.local_mut(at);
                    var.compiled_start = pos;
                    var.stack_offset = offset;
                    offset += size;
                }
            }
        }

        self.argument_size = arg_size;
        self.sp_depth = arg_size;
        self.break_depth = arg_size;
        self.continue_depth = arg_size;
        self.exp_depth = 0;
        self.line_start = self.out.pos();

        self.code_block(code)?;

        // A defaulted body still has to populate its return slot.
        if default_function && self.return_size != 0 {
            self.emit_declaration(ret, CursorSel::Exp, PCodeSlice::EMPTY, SymbolFlags::empty())?;
            self.emit_cp_raw(
                Op::CpDownSp,
                self.return_size + self.sp_depth + self.exp_depth,
                self.return_size,
            )?;
            self.emit_movsp(self.return_size, CursorSel::Exp)?;
        }

        self.linker.resolve(return_label, &mut self.out)?;
        self.return_label = None;

        if self.make_debug {
            self.debug.purge(self.return_size, self.out.pos());
        }

        self.line_start = self.out.pos();
        if arg_size != 0 {
            self.emit_movsp(arg_size, CursorSel::Sp)?;
        }
        if self.make_debug {
            self.debug.purge(0, self.out.pos());
        }

        self.emit_unary_op(Op::Retn, Type::Void)?;
        self.add_line_here(file, line);
        Ok(())
    }

    /* ─────────────────────────── whole-unit emission ─────────────────────────── */

    fn select_entry(&self) -> EmitResult<(SymbolId, bool)> {
        if let Some(id) = self.unit.find_symbol("main") {
            let sym = self.unit.symbol(id);
            if sym.kind != SymbolKind::Function {
                return Err(CodegenError::EntrySymbolMustBeFunction("main".into()));
            }
            if sym.ty != Type::Void {
                return Err(CodegenError::EntrySymbolMustReturnType {
                    name: "main".into(),
                    expected: Type::Void,
                });
            }
            return Ok((id, true));
        }
        if let Some(id) = self.unit.find_symbol("StartingConditional") {
            let sym = self.unit.symbol(id);
            if sym.kind != SymbolKind::Function {
                return Err(CodegenError::EntrySymbolMustBeFunction(
                    "StartingConditional".into(),
                ));
            }
            if sym.ty != Type::Integer {
                return Err(CodegenError::EntrySymbolMustReturnType {
                    name: "StartingConditional".into(),
                    expected: Type::Integer,
                });
            }
            return Ok((id, false));
        }
        Err(CodegenError::EntrySymbolNotFound)
    }

    /// Decide whether `#globals` is required and settle
    /// `TREAT_AS_CONSTANT` on every global.
    fn decide_globals(&mut self) -> EmitResult<bool> {
        let optimizable =
            self.flags.opt_empty_globals && self.version >= GLOBALS_OPT_VERSION;
        // The debug file needs #globals to anchor structure types, and
        // pre-optimization targets always emitted it.
        let mut create = if optimizable {
            self.unit.struct_count() != 0
        } else {
            !self.unit.globals().is_empty() || self.unit.struct_count() != 0
        };

        let globals: Vec<SymbolId> = self.unit.globals().to_vec();
        for id in globals {
            let sym = self.unit.symbol(id);
            let flags = sym.flags;
            let ty = sym.ty;
            let init = sym
                .variable()
                .ok_or_else(|| self.internal("global list holds a non-variable"))?
                .init;

            let eligible = optimizable
                && !flags.contains(SymbolFlags::MODIFIED)
                && ty != Type::String
                && !ty.is_struct()
                && !flags.contains(SymbolFlags::SELF_REFERENCE_DEF)
                && !init.is_empty()
                && flags.contains(SymbolFlags::REFERENCED)
                && !has_side_effects(self.unit, self.pcode, init)?;

            if eligible {
                self.unit.symbol_mut(id).flags |= SymbolFlags::TREAT_AS_CONSTANT;
            } else {
                create = true;
            }
        }
        Ok(create)
    }

    fn emit_globals_routine(&mut self, entry_name: &str, is_main: bool) -> EmitResult<()> {
        self.global_scope = true;
        let globals_label = self.linker.named_label("#globals");
        self.linker.resolve(globals_label, &mut self.out)?;

        let mut cur_file = -1i32;
        let mut cur_line = -1i32;
        let mut range_start = self.out.pos();
        let mut range_end = self.out.pos();

        let defs: Vec<SymbolId> = self.unit.global_defs().to_vec();
        for id in defs {
            let kind = self.unit.symbol(id).kind;
            match kind {
                SymbolKind::Variable => {
                    let flags = self.unit.symbol(id).flags;
                    if flags.contains(SymbolFlags::TREAT_AS_CONSTANT) {
                        continue;
                    }
                    let ty = self.unit.symbol(id).ty;
                    let data = self
                        .unit
                        .symbol(id)
                        .variable()
                        .ok_or_else(|| self.internal("global list holds a non-variable"))?;
                    let (init, vfile, vline) = (data.init, data.file, data.line);

                    if self.dump_pcode {
                        let name = &self.unit.symbol(id).name;
                        log::debug!(
                            "pcode for global `{name}`:\n{}",
                            printer::render(self.unit, init)
                        );
                    }

                    let start_save = self.out.pos();
                    self.unit.symbol_mut(id).stack_offset = self.bp_depth;
                    self.expect_balanced("global declaration entry")?;

                    // BP moves before a reserve-style declaration and
                    // after an optimized one, so the address the
                    // initializer sees stays right either way.
                    let size = self.size_of(ty);
                    let post_alloc = self.optimized_declaration_permitted(init, flags);
                    if !post_alloc {
                        self.bp_depth += size;
                    }
                    let compiled_start = self.emit_declaration(ty, CursorSel::Sp, init, flags)?;
                    self.unit.symbol_mut(id).compiled_start = compiled_start as u32;
                    if post_alloc {
                        self.bp_depth += size;
                    }
                    self.expect_balanced("global declaration exit")?;

                    if cur_file != vfile
                        || cur_line != vline
                        || flags.contains(SymbolFlags::LAST_DECL)
                    {
                        if cur_file != -1 {
                            self.debug.add_line(cur_file, cur_line, range_start, range_end);
                        }
                        cur_file = vfile;
                        cur_line = vline;
                        range_start = start_save;
                    }
                    range_end = self.out.pos();
                }
                SymbolKind::Structure => {
                    let flags = self.unit.symbol(id).flags;
                    let members = self
                        .unit
                        .symbol(id)
                        .structure()
                        .ok_or_else(|| self.internal("structure symbol has no member table"))?
                        .members;
                    let buf = self.pcode;
                    for item in PCodeReader::new(buf, members) {
                        let (_, record) = item?;
                        let PCode::Declaration { file, line, .. } = record else {
                            return Err(
                                self.internal("structure member table holds a non-declaration")
                            );
                        };
                        if cur_file != file
                            || cur_line != line
                            || flags.contains(SymbolFlags::LAST_DECL)
                        {
                            if cur_file != -1 {
                                self.debug.add_line(cur_file, cur_line, range_start, range_end);
                            }
                            cur_file = file;
                            cur_line = line;
                            range_start = range_end;
                        }
                    }
                }
                SymbolKind::Function => {}
                _ => return Err(self.internal("unknown kind in global definition list")),
            }
        }
        if cur_file != -1 {
            self.debug.add_line(cur_file, cur_line, range_start, range_end);
        }

        // Establish the globals frame and run the user entry inside it.
        self.emit_unary_op(Op::SaveBp, Type::Void)?;
        if !is_main {
            self.emit_declaration(
                Type::Integer,
                CursorSel::Exp,
                PCodeSlice::EMPTY,
                SymbolFlags::empty(),
            )?;
        }
        let entry_label = self.linker.named_label(entry_name);
        self.emit_jsr(entry_label, 0)?;
        if !is_main {
            // Propagate the conditional result past the saved BP and the
            // globals frame into the loader's slot.
            self.emit_cp_raw(Op::CpDownSp, self.bp_depth + 3, 1)?;
            self.emit_movsp(1, CursorSel::Exp)?;
        }
        self.emit_unary_op(Op::RestoreBp, Type::Void)?;
        self.emit_movsp(self.bp_depth, CursorSel::Sp)?;
        self.emit_unary_op(Op::Retn, Type::Void)?;
        Ok(())
    }

    fn generate(&mut self) -> EmitResult<Option<NdbFile>> {
        let (entry_id, is_main) = self.select_entry()?;
        let entry_name = self.unit.symbol(entry_id).name.clone();

        // Container header; the size field is patched at the end.
        self.out.put_bytes(nwsc_ncs::MAGIC)?;
        self.out.put_bytes(nwsc_ncs::VERSION)?;
        self.out.put_u8(nwsc_ncs::SIZE_TAG)?;
        self.out.put_bytes(&[0, 0, 0, 0])?;

        // Reachability: global initializers first, then the entry.
        let mut reach = Reachability::new();
        reach.scan_global_initializers(self.unit, self.pcode)?;
        reach.add_entry(self.unit, self.pcode, entry_id)?;
        self.functions = reach.into_functions();

        self.exp_depth = 0;
        self.sp_depth = 0;
        self.bp_depth = 0;
        self.return_size = 0;

        let create_globals = self.decide_globals()?;

        // #loader
        let loader_start = self.out.pos();
        let mut retval_pos = NO_OFFSET;
        if !is_main {
            retval_pos = self.emit_declaration(
                Type::Integer,
                CursorSel::None,
                PCodeSlice::EMPTY,
                SymbolFlags::empty(),
            )? as u32;
        }
        let first_target =
            self.linker.named_label(if create_globals { "#globals" } else { entry_name.as_str() });
        self.emit_jsr(first_target, 0)?;
        self.emit_unary_op(Op::Retn, Type::Void)?;
        let loader_end = self.out.pos();

        // #globals
        let mut globals_range = None;
        if create_globals {
            let globals_start = self.out.pos();
            self.emit_globals_routine(&entry_name, is_main)?;
            globals_range = Some((globals_start, self.out.pos()));
        }

        // Prototypes show up in the debug file even without bodies.
        if self.make_debug {
            let defs: Vec<SymbolId> = self.unit.global_defs().to_vec();
            for id in defs {
                let sym = self.unit.symbol(id);
                if sym.kind == SymbolKind::Function {
                    if let Some(f) = sym.function() {
                        let file = f.file;
                        if file >= 0 {
                            self.debug.mark_used_file(file);
                        }
                    }
                }
            }
            let fns: Vec<SymbolId> = self.unit.global_fns().to_vec();
            for id in fns {
                let sym = self.unit.symbol(id);
                if sym.kind != SymbolKind::Function {
                    continue;
                }
                if let Some(f) = sym.function() {
                    let file = f.file;
                    if file >= 0 {
                        self.debug.mark_used_file(file);
                    }
                }
            }
        }

        // Routines, in discovery order.
        self.global_scope = false;
        let functions = self.functions.clone();
        for id in functions {
            let start = self.out.pos() as u32;
            self.unit.symbol_mut(id).compiled_start = start;
            self.emit_routine(id)?;
            let end = self.out.pos() as u32;
            self.unit.symbol_mut(id).compiled_end = end;
        }

        // Patch the total size into the header.
        let total = self.out.pos() as u32;
        self.out.patch_u32(9, total);

        if !self.make_debug {
            return Ok(None);
        }
        Ok(Some(self.build_ndb(
            is_main,
            create_globals,
            (loader_start, loader_end),
            globals_range,
            retval_pos,
        )))
    }

    /* ─────────────────────────── debug sidecar ─────────────────────────── */

    fn build_ndb(
        &self,
        is_main: bool,
        create_globals: bool,
        loader: (usize, usize),
        globals_range: Option<(usize, usize)>,
        retval_pos: u32,
    ) -> NdbFile {
        let mut ndb = NdbFile::default();

        for &src in self.debug.used_files() {
            let (name, main) = self
                .unit
                .files()
                .get(src as usize)
                .map(|f| (f.name.clone(), f.is_main))
                .unwrap_or_else(|| (String::from("<unknown>"), false));
            ndb.files.push(NdbSourceFile { name, is_main: main });
        }

        for k in 0..self.unit.struct_count() {
            let sym = self.unit.symbol(self.unit.struct_symbol(k as u16));
            let mut fields = Vec::new();
            if let Some(data) = sym.structure() {
                for item in PCodeReader::new(self.pcode, data.members) {
                    let Ok((_, PCode::Declaration { ty, name, .. })) = item else { continue };
                    fields.push(nwsc_ncs::ndb::NdbField {
                        type_code: ty.debug_text(),
                        name: name.to_string(),
                    });
                }
            }
            ndb.structs.push(NdbStruct { name: sym.name.clone(), fields });
        }

        for &id in self.unit.global_fns() {
            let sym = self.unit.symbol(id);
            match sym.kind {
                SymbolKind::Function => {
                    let mut params = Vec::new();
                    if let Some(f) = sym.function() {
                        for item in PCodeReader::new(self.pcode, f.args) {
                            let Ok((_, PCode::Declaration { ty, .. })) = item else { continue };
                            params.push(ty.debug_text());
                        }
                    }
                    ndb.functions.push(NdbFunction {
                        name: sym.name.clone(),
                        start: sym.compiled_start,
                        end: sym.compiled_end,
                        ret: sym.ty.debug_text(),
                        params,
                    });
                }
                // Named constants list with no compiled range.
                _ => ndb.functions.push(NdbFunction {
                    name: sym.name.clone(),
                    start: NO_OFFSET,
                    end: NO_OFFSET,
                    ret: sym.ty.debug_text(),
                    params: Vec::new(),
                }),
            }
        }

        ndb.functions.push(NdbFunction {
            name: "#loader".into(),
            start: loader.0 as u32,
            end: loader.1 as u32,
            ret: if is_main { "v".into() } else { "i".into() },
            params: Vec::new(),
        });
        if create_globals {
            let (start, end) = globals_range.unwrap_or((0, 0));
            // The stock toolchain always types #globals as void.
            ndb.functions.push(NdbFunction {
                name: "#globals".into(),
                start: start as u32,
                end: end as u32,
                ret: "v".into(),
                params: Vec::new(),
            });
        }

        if !is_main {
            ndb.variables.push(NdbVariable {
                name: "#retval".into(),
                type_code: "i".into(),
                start: retval_pos,
                end: NO_OFFSET,
                stack_offset: 0,
            });
        }
        for &id in self.unit.globals() {
            let sym = self.unit.symbol(id);
            if sym.flags.contains(SymbolFlags::TREAT_AS_CONSTANT) {
                continue;
            }
            ndb.variables.push(NdbVariable {
                name: sym.name.clone(),
                type_code: sym.ty.debug_text(),
                start: sym.compiled_start,
                end: sym.compiled_end,
                stack_offset: (sym.stack_offset * 4) as u32,
            });
        }
        for var in self.debug.locals() {
            ndb.variables.push(NdbVariable {
                name: var.name.clone(),
                type_code: var.ty.debug_text(),
                start: var.compiled_start,
                end: var.compiled_end,
                stack_offset: (var.stack_offset * 4) as u32,
            });
        }

        for line in self.debug.lines() {
            ndb.lines.push(NdbLine {
                file: line.file,
                line: line.line,
                start: line.start as u32,
                end: line.end as u32,
            });
        }

        ndb
    }
}
