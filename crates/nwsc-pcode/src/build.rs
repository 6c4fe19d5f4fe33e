//! Append-only builder surface for PCode fragments.
//!
//! The front-end composes expressions bottom-up: each sub-expression is
//! built into its own fragment, then embedded into the parent record.
//! Because nested offsets are relative to the containing record's start,
//! fragments can be copied into larger streams without fixups.
//!
//! Invariants enforced on append: the record size header matches the
//! bytes actually written, and payload strings are length-prefixed and
//! null-terminated.

use nwsc_core::Type;

use crate::flags::SymbolFlags;
use crate::record::{AssignOp, BinaryOp, BlockOp, PCodeOp, UnaryOp, HEADER_SIZE};
use crate::symbol::SymbolId;

/// Source view of one composite slot handed to
/// [`PCodeBuilder::push_block5`].
#[derive(Debug, Clone, Copy)]
pub struct BlockSlotSrc<'a> {
    /// Slot body bytes (a complete PCode sub-stream, possibly empty).
    pub body: &'a [u8],
    /// Source file index, `-1` when absent.
    pub file: i32,
    /// Source line, `-1` when absent.
    pub line: i32,
}

impl BlockSlotSrc<'static> {
    /// An absent slot.
    pub const EMPTY: BlockSlotSrc<'static> = BlockSlotSrc { body: &[], file: -1, line: -1 };
}

impl<'a> BlockSlotSrc<'a> {
    /// Slot with a body and source position.
    pub fn new(body: &'a [u8], file: i32, line: i32) -> Self {
        Self { body, file, line }
    }
}

/// A PCode fragment under construction.
#[derive(Debug, Default, Clone)]
pub struct PCodeBuilder {
    buf: Vec<u8>,
}

impl PCodeBuilder {
    /// Empty fragment.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// The encoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been pushed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the builder, returning the raw fragment.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /* ── encoding helpers ── */

    fn begin(&mut self, op: PCodeOp, ty: Type) -> usize {
        let start = self.buf.len();
        self.buf.push(op as u8);
        self.buf.push(0);
        self.put_u16(ty.code());
        self.put_u32(0); // size, patched by finish()
        start
    }

    fn finish(&mut self, start: usize) {
        let size = (self.buf.len() - start) as u32;
        self.buf[start + 4..start + 8].copy_from_slice(&size.to_le_bytes());
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn put_str(&mut self, s: &str) {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.put_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /* ── leaf records ── */

    /// Append a source line marker.
    pub fn push_line(&mut self, file: i32, line: i32) {
        let s = self.begin(PCodeOp::Line, Type::Void);
        self.put_i32(file);
        self.put_i32(line);
        self.finish(s);
    }

    /// Append a `break`.
    pub fn push_break(&mut self) {
        let s = self.begin(PCodeOp::Break, Type::Void);
        self.finish(s);
    }

    /// Append a `continue`.
    pub fn push_continue(&mut self) {
        let s = self.begin(PCodeOp::Continue, Type::Void);
        self.finish(s);
    }

    /// Append an expression-statement end dropping a value of `ty`.
    pub fn push_expression_end(&mut self, ty: Type) {
        let s = self.begin(PCodeOp::ExpressionEnd, ty);
        self.finish(s);
    }

    /// Append a unary operator.
    pub fn push_unary_op(&mut self, op: UnaryOp, ty: Type) {
        let tag = match op {
            UnaryOp::Negate => PCodeOp::Negate,
            UnaryOp::BitwiseNot => PCodeOp::BitwiseNot,
            UnaryOp::LogicalNot => PCodeOp::LogicalNot,
        };
        let s = self.begin(tag, ty);
        self.finish(s);
    }

    /// Append a binary operator over already-pushed operands.
    pub fn push_binary_op(&mut self, op: BinaryOp, out: Type, lhs: Type, rhs: Type) {
        let tag = match op {
            BinaryOp::Multiply => PCodeOp::Multiply,
            BinaryOp::Divide => PCodeOp::Divide,
            BinaryOp::Modulus => PCodeOp::Modulus,
            BinaryOp::Add => PCodeOp::Add,
            BinaryOp::Subtract => PCodeOp::Subtract,
            BinaryOp::ShiftLeft => PCodeOp::ShiftLeft,
            BinaryOp::ShiftRight => PCodeOp::ShiftRight,
            BinaryOp::UnsignedShiftRight => PCodeOp::UnsignedShiftRight,
            BinaryOp::LessThan => PCodeOp::LessThan,
            BinaryOp::GreaterThan => PCodeOp::GreaterThan,
            BinaryOp::LessThanEq => PCodeOp::LessThanEq,
            BinaryOp::GreaterThanEq => PCodeOp::GreaterThanEq,
            BinaryOp::Equal => PCodeOp::Equal,
            BinaryOp::NotEqual => PCodeOp::NotEqual,
            BinaryOp::BitwiseAnd => PCodeOp::BitwiseAnd,
            BinaryOp::BitwiseXor => PCodeOp::BitwiseXor,
            BinaryOp::BitwiseOr => PCodeOp::BitwiseOr,
        };
        let s = self.begin(tag, out);
        self.put_u16(lhs.code());
        self.put_u16(rhs.code());
        self.finish(s);
    }

    /// Append an integer literal.
    pub fn push_constant_int(&mut self, value: i32) {
        let s = self.begin(PCodeOp::Constant, Type::Integer);
        self.put_i32(value);
        self.finish(s);
    }

    /// Append a float literal.
    pub fn push_constant_float(&mut self, value: f32) {
        let s = self.begin(PCodeOp::Constant, Type::Float);
        self.put_f32(value);
        self.finish(s);
    }

    /// Append a string literal.
    pub fn push_constant_string(&mut self, value: &str) {
        let s = self.begin(PCodeOp::Constant, Type::String);
        self.put_str(value);
        self.finish(s);
    }

    /// Append an object id literal.
    pub fn push_constant_object(&mut self, id: u32) {
        let s = self.begin(PCodeOp::Constant, Type::Object);
        self.put_u32(id);
        self.finish(s);
    }

    /// Append a vector literal.
    pub fn push_constant_vector(&mut self, v: [f32; 3]) {
        let s = self.begin(PCodeOp::Constant, Type::Vector);
        self.put_f32(v[0]);
        self.put_f32(v[1]);
        self.put_f32(v[2]);
        self.finish(s);
    }

    /// Append a zero-initialized structure literal.
    pub fn push_constant_struct(&mut self, ty: Type) {
        debug_assert!(ty.is_struct());
        let s = self.begin(PCodeOp::Constant, ty);
        self.finish(s);
    }

    /// Append a variable read.
    #[allow(clippy::too_many_arguments)]
    pub fn push_variable(
        &mut self,
        ty: Type,
        source_ty: Type,
        symbol: SymbolId,
        element: i32,
        stack_offset: i32,
        flags: SymbolFlags,
    ) {
        let s = self.begin(PCodeOp::Variable, ty);
        self.put_u32(symbol.0);
        self.put_i32(element);
        self.put_i32(stack_offset);
        self.put_u32(flags.bits());
        self.put_u16(source_ty.code());
        self.put_u16(0);
        self.finish(s);
    }

    /// Append a declaration with an optional initializer fragment.
    pub fn push_declaration(
        &mut self,
        ty: Type,
        name: &str,
        file: i32,
        line: i32,
        flags: SymbolFlags,
        init: &PCodeBuilder,
    ) {
        let s = self.begin(PCodeOp::Declaration, ty);
        self.put_i32(file);
        self.put_i32(line);
        self.put_u32(flags.bits());
        let init_off = (HEADER_SIZE + 20 + 2 + name.len() + 1) as u32;
        self.put_u32(init_off);
        self.put_u32(init.len() as u32);
        self.put_str(name);
        self.buf.extend_from_slice(init.bytes());
        self.finish(s);
    }

    /// Append a call argument wrapper.
    pub fn push_argument(&mut self, ty: Type, body: &PCodeBuilder) {
        let s = self.begin(PCodeOp::Argument, ty);
        self.put_u32((HEADER_SIZE + 8) as u32);
        self.put_u32(body.len() as u32);
        self.buf.extend_from_slice(body.bytes());
        self.finish(s);
    }

    /// Append a statement block that releases `locals` cells on exit.
    pub fn push_statement(&mut self, locals: i32, body: &PCodeBuilder) {
        let s = self.begin(PCodeOp::Statement, Type::Void);
        self.put_i32(locals);
        self.put_u32((HEADER_SIZE + 12) as u32);
        self.put_u32(body.len() as u32);
        self.buf.extend_from_slice(body.bytes());
        self.finish(s);
    }

    /// Append a call with its argument sub-stream.
    pub fn push_call(&mut self, ret: Type, symbol: SymbolId, arg_count: u32, args: &PCodeBuilder) {
        let s = self.begin(PCodeOp::Call, ret);
        self.put_u32(symbol.0);
        self.put_u32(arg_count);
        self.put_u32((HEADER_SIZE + 16) as u32);
        self.put_u32(args.len() as u32);
        self.buf.extend_from_slice(args.bytes());
        self.finish(s);
    }

    /// Append a field extraction from a structure expression.
    pub fn push_element(&mut self, ty: Type, lhs_ty: Type, element: i32, body: &PCodeBuilder) {
        let s = self.begin(PCodeOp::Element, ty);
        self.put_u16(lhs_ty.code());
        self.put_u16(0);
        self.put_i32(element);
        self.put_u32((HEADER_SIZE + 16) as u32);
        self.put_u32(body.len() as u32);
        self.buf.extend_from_slice(body.bytes());
        self.finish(s);
    }

    /// Append a `return`; pass an empty fragment for `void`.
    pub fn push_return(&mut self, ty: Type, value: &PCodeBuilder) {
        let s = self.begin(PCodeOp::Return, ty);
        self.put_u32((HEADER_SIZE + 8) as u32);
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.bytes());
        self.finish(s);
    }

    /// Append a `case` label with its key expression.
    pub fn push_case(&mut self, file: i32, line: i32, key: &PCodeBuilder) {
        let s = self.begin(PCodeOp::Case, Type::Integer);
        self.put_i32(file);
        self.put_i32(line);
        self.put_u32((HEADER_SIZE + 16) as u32);
        self.put_u32(key.len() as u32);
        self.buf.extend_from_slice(key.bytes());
        self.finish(s);
    }

    /// Append a `default` label.
    pub fn push_default(&mut self, file: i32, line: i32) {
        let s = self.begin(PCodeOp::Default, Type::Void);
        self.put_i32(file);
        self.put_i32(line);
        self.finish(s);
    }

    /// Append a short-circuit logical operator.
    pub fn push_logical_op(&mut self, and: bool, lhs: &PCodeBuilder, rhs: &PCodeBuilder) {
        let op = if and { PCodeOp::LogicalAnd } else { PCodeOp::LogicalOr };
        let s = self.begin(op, Type::Integer);
        let lhs_off = (HEADER_SIZE + 16) as u32;
        self.put_u32(lhs_off);
        self.put_u32(lhs.len() as u32);
        self.put_u32(lhs_off + lhs.len() as u32);
        self.put_u32(rhs.len() as u32);
        self.buf.extend_from_slice(lhs.bytes());
        self.buf.extend_from_slice(rhs.bytes());
        self.finish(s);
    }

    /// Append an assignment (plain or compound) with its RHS.
    #[allow(clippy::too_many_arguments)]
    pub fn push_assignment(
        &mut self,
        op: AssignOp,
        ty: Type,
        source_ty: Type,
        rhs_ty: Type,
        symbol: SymbolId,
        element: i32,
        stack_offset: i32,
        flags: SymbolFlags,
        rhs: &PCodeBuilder,
    ) {
        let tag = match op {
            AssignOp::Assign => PCodeOp::Assign,
            AssignOp::Multiply => PCodeOp::AsnMultiply,
            AssignOp::Divide => PCodeOp::AsnDivide,
            AssignOp::Modulus => PCodeOp::AsnModulus,
            AssignOp::Add => PCodeOp::AsnAdd,
            AssignOp::Subtract => PCodeOp::AsnSubtract,
            AssignOp::ShiftLeft => PCodeOp::AsnShiftLeft,
            AssignOp::ShiftRight => PCodeOp::AsnShiftRight,
            AssignOp::UnsignedShiftRight => PCodeOp::AsnUnsignedShiftRight,
            AssignOp::BitwiseAnd => PCodeOp::AsnBitwiseAnd,
            AssignOp::BitwiseXor => PCodeOp::AsnBitwiseXor,
            AssignOp::BitwiseOr => PCodeOp::AsnBitwiseOr,
        };
        let s = self.begin(tag, ty);
        self.put_u32(symbol.0);
        self.put_i32(element);
        self.put_i32(stack_offset);
        self.put_u32(flags.bits());
        self.put_u16(source_ty.code());
        self.put_u16(rhs_ty.code());
        self.put_u32((HEADER_SIZE + 28) as u32);
        self.put_u32(rhs.len() as u32);
        self.buf.extend_from_slice(rhs.bytes());
        self.finish(s);
    }

    /// Append a five-slot control-flow composite.
    pub fn push_block5(&mut self, op: BlockOp, ty: Type, slots: [BlockSlotSrc<'_>; 5]) {
        let tag = match op {
            BlockOp::Switch => PCodeOp::Switch,
            BlockOp::If => PCodeOp::If,
            BlockOp::Do => PCodeOp::Do,
            BlockOp::While => PCodeOp::While,
            BlockOp::For => PCodeOp::For,
            BlockOp::Conditional => PCodeOp::Conditional,
        };
        let s = self.begin(tag, ty);
        let mut off = (HEADER_SIZE + 80) as u32;
        for slot in &slots {
            self.put_u32(off);
            self.put_u32(slot.body.len() as u32);
            self.put_i32(slot.file);
            self.put_i32(slot.line);
            off += slot.body.len() as u32;
        }
        for slot in &slots {
            self.buf.extend_from_slice(slot.body);
        }
        self.finish(s);
    }
}
