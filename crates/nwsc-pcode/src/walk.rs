//! Linear PCode scanning.
//!
//! [`PCodeReader`] yields one decoded record at a time and never
//! recurses; callers recurse by constructing a new reader over each
//! child slice a record reports. Every decode validates the record size
//! against the enclosing slice and every child range against the record.

use nwsc_core::Type;

use crate::flags::SymbolFlags;
use crate::record::{
    AssignOp, BinaryOp, BlockOp, BlockSlot, ConstValue, PCode, PCodeOp, PCodeSlice, UnaryOp,
    HEADER_SIZE,
};
use crate::symbol::SymbolId;

/// Decode failures. All of them indicate a front-end bug or a corrupted
/// buffer, never a user error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PCodeError {
    /// Fewer bytes than a record header at the given offset.
    #[error("truncated pcode record at offset {at}")]
    Truncated {
        /// Offset of the truncated record.
        at: usize,
    },
    /// Record size field is smaller than the header or runs past the
    /// enclosing slice.
    #[error("pcode record size {size} out of bounds at offset {at}")]
    BadSize {
        /// Offset of the record.
        at: usize,
        /// Claimed size.
        size: u32,
    },
    /// Unknown opcode tag.
    #[error("unknown pcode opcode {op:#04x} at offset {at}")]
    UnknownOp {
        /// Offset of the record.
        at: usize,
        /// Raw tag byte.
        op: u8,
    },
    /// Type code that does not name a type.
    #[error("bad type code {code:#06x} in pcode record at offset {at}")]
    BadType {
        /// Offset of the record.
        at: usize,
        /// Raw type code.
        code: u16,
    },
    /// String payload not length-prefixed + null-terminated UTF-8.
    #[error("malformed string payload in pcode record at offset {at}")]
    BadString {
        /// Offset of the record.
        at: usize,
    },
    /// Child range escapes the record.
    #[error("child range out of bounds in pcode record at offset {at}")]
    BadChild {
        /// Offset of the record.
        at: usize,
    },
}

/// Result alias for decode operations.
pub type PCodeResult<T> = Result<T, PCodeError>;

/// Cursor state for one record being decoded.
struct Cursor<'a> {
    rec: &'a [u8],
    at: usize,  // absolute record start, for diagnostics
    pos: usize, // within rec
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> PCodeResult<&'a [u8]> {
        if self.rec.len() - self.pos < n {
            return Err(PCodeError::Truncated { at: self.at });
        }
        let s = &self.rec[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> PCodeResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> PCodeResult<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> PCodeResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f32(&mut self) -> PCodeResult<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn ty(&mut self) -> PCodeResult<Type> {
        let code = self.u16()?;
        Type::from_code(code).ok_or(PCodeError::BadType { at: self.at, code })
    }

    fn str(&mut self) -> PCodeResult<&'a str> {
        let len = self.u16()? as usize;
        let bytes = self.take(len + 1).map_err(|_| PCodeError::BadString { at: self.at })?;
        if bytes[len] != 0 {
            return Err(PCodeError::BadString { at: self.at });
        }
        core::str::from_utf8(&bytes[..len]).map_err(|_| PCodeError::BadString { at: self.at })
    }

    /// A child `(off, len)` pair, converted to an absolute slice and
    /// bounds-checked against the record.
    fn child(&mut self, rec_size: usize) -> PCodeResult<PCodeSlice> {
        let off = self.u32()? as usize;
        let len = self.u32()? as usize;
        if len == 0 {
            return Ok(PCodeSlice::EMPTY);
        }
        if off < HEADER_SIZE || off + len > rec_size {
            return Err(PCodeError::BadChild { at: self.at });
        }
        Ok(PCodeSlice::new((self.at + off) as u32, len as u32))
    }
}

/// Decode the record starting at absolute offset `at`, bounded by `end`.
/// Returns the decoded view and the record's total size.
pub fn decode_record(buf: &[u8], at: usize, end: usize) -> PCodeResult<(PCode<'_>, usize)> {
    if end - at < HEADER_SIZE || end > buf.len() {
        return Err(PCodeError::Truncated { at });
    }
    let op = buf[at];
    let op = PCodeOp::from_u8(op).ok_or(PCodeError::UnknownOp { at, op })?;
    let ty_code = u16::from_le_bytes([buf[at + 2], buf[at + 3]]);
    let ty = Type::from_code(ty_code).ok_or(PCodeError::BadType { at, code: ty_code })?;
    let size = u32::from_le_bytes([buf[at + 4], buf[at + 5], buf[at + 6], buf[at + 7]]);
    let size_us = size as usize;
    if size_us < HEADER_SIZE || at + size_us > end {
        return Err(PCodeError::BadSize { at, size });
    }

    let mut c = Cursor { rec: &buf[at..at + size_us], at, pos: HEADER_SIZE };

    let record = match op {
        PCodeOp::Line => PCode::Line { file: c.i32()?, line: c.i32()? },
        PCodeOp::Break => PCode::Break,
        PCodeOp::Continue => PCode::Continue,
        PCodeOp::ExpressionEnd => PCode::ExpressionEnd { ty },
        PCodeOp::Negate => PCode::UnaryOp { op: UnaryOp::Negate, ty },
        PCodeOp::BitwiseNot => PCode::UnaryOp { op: UnaryOp::BitwiseNot, ty },
        PCodeOp::LogicalNot => PCode::UnaryOp { op: UnaryOp::LogicalNot, ty },
        PCodeOp::Multiply
        | PCodeOp::Divide
        | PCodeOp::Modulus
        | PCodeOp::Add
        | PCodeOp::Subtract
        | PCodeOp::ShiftLeft
        | PCodeOp::ShiftRight
        | PCodeOp::UnsignedShiftRight
        | PCodeOp::LessThan
        | PCodeOp::GreaterThan
        | PCodeOp::LessThanEq
        | PCodeOp::GreaterThanEq
        | PCodeOp::Equal
        | PCodeOp::NotEqual
        | PCodeOp::BitwiseAnd
        | PCodeOp::BitwiseXor
        | PCodeOp::BitwiseOr => {
            let bin = match op {
                PCodeOp::Multiply => BinaryOp::Multiply,
                PCodeOp::Divide => BinaryOp::Divide,
                PCodeOp::Modulus => BinaryOp::Modulus,
                PCodeOp::Add => BinaryOp::Add,
                PCodeOp::Subtract => BinaryOp::Subtract,
                PCodeOp::ShiftLeft => BinaryOp::ShiftLeft,
                PCodeOp::ShiftRight => BinaryOp::ShiftRight,
                PCodeOp::UnsignedShiftRight => BinaryOp::UnsignedShiftRight,
                PCodeOp::LessThan => BinaryOp::LessThan,
                PCodeOp::GreaterThan => BinaryOp::GreaterThan,
                PCodeOp::LessThanEq => BinaryOp::LessThanEq,
                PCodeOp::GreaterThanEq => BinaryOp::GreaterThanEq,
                PCodeOp::Equal => BinaryOp::Equal,
                PCodeOp::NotEqual => BinaryOp::NotEqual,
                PCodeOp::BitwiseAnd => BinaryOp::BitwiseAnd,
                PCodeOp::BitwiseXor => BinaryOp::BitwiseXor,
                _ => BinaryOp::BitwiseOr,
            };
            PCode::BinaryOp { op: bin, ty, lhs: c.ty()?, rhs: c.ty()? }
        }
        PCodeOp::Constant => {
            let value = match ty {
                Type::Integer => ConstValue::Integer(c.i32()?),
                Type::Float => ConstValue::Float(c.f32()?),
                Type::String => ConstValue::String(c.str()?),
                Type::Object => ConstValue::Object(c.u32()?),
                Type::Vector => ConstValue::Vector([c.f32()?, c.f32()?, c.f32()?]),
                t if t.is_struct() => ConstValue::Struct(t),
                _ => return Err(PCodeError::BadType { at, code: ty_code }),
            };
            PCode::Constant(value)
        }
        PCodeOp::Variable => {
            let symbol = SymbolId(c.u32()?);
            let element = c.i32()?;
            let stack_offset = c.i32()?;
            let flags = SymbolFlags::from_bits_retain(c.u32()?);
            let source_ty = c.ty()?;
            PCode::Variable { ty, source_ty, symbol, element, stack_offset, flags }
        }
        PCodeOp::Declaration => {
            let file = c.i32()?;
            let line = c.i32()?;
            let flags = SymbolFlags::from_bits_retain(c.u32()?);
            let init = c.child(size_us)?;
            let name = c.str()?;
            PCode::Declaration { ty, name, file, line, flags, init }
        }
        PCodeOp::Argument => PCode::Argument { ty, body: c.child(size_us)? },
        PCodeOp::Statement => {
            let locals = c.i32()?;
            PCode::Statement { locals, body: c.child(size_us)? }
        }
        PCodeOp::Call => {
            let symbol = SymbolId(c.u32()?);
            let arg_count = c.u32()?;
            PCode::Call { ty, symbol, arg_count, args: c.child(size_us)? }
        }
        PCodeOp::Element => {
            let lhs_ty = c.ty()?;
            let _pad = c.u16()?;
            let element = c.i32()?;
            PCode::Element { ty, lhs_ty, element, body: c.child(size_us)? }
        }
        PCodeOp::Return => PCode::Return { ty, value: c.child(size_us)? },
        PCodeOp::Case => {
            let file = c.i32()?;
            let line = c.i32()?;
            PCode::Case { file, line, key: c.child(size_us)? }
        }
        PCodeOp::Default => PCode::Default { file: c.i32()?, line: c.i32()? },
        PCodeOp::LogicalAnd => {
            PCode::LogicalAnd { lhs: c.child(size_us)?, rhs: c.child(size_us)? }
        }
        PCodeOp::LogicalOr => {
            PCode::LogicalOr { lhs: c.child(size_us)?, rhs: c.child(size_us)? }
        }
        PCodeOp::Assign
        | PCodeOp::AsnMultiply
        | PCodeOp::AsnDivide
        | PCodeOp::AsnModulus
        | PCodeOp::AsnAdd
        | PCodeOp::AsnSubtract
        | PCodeOp::AsnShiftLeft
        | PCodeOp::AsnShiftRight
        | PCodeOp::AsnUnsignedShiftRight
        | PCodeOp::AsnBitwiseAnd
        | PCodeOp::AsnBitwiseXor
        | PCodeOp::AsnBitwiseOr => {
            let asn = match op {
                PCodeOp::Assign => AssignOp::Assign,
                PCodeOp::AsnMultiply => AssignOp::Multiply,
                PCodeOp::AsnDivide => AssignOp::Divide,
                PCodeOp::AsnModulus => AssignOp::Modulus,
                PCodeOp::AsnAdd => AssignOp::Add,
                PCodeOp::AsnSubtract => AssignOp::Subtract,
                PCodeOp::AsnShiftLeft => AssignOp::ShiftLeft,
                PCodeOp::AsnShiftRight => AssignOp::ShiftRight,
                PCodeOp::AsnUnsignedShiftRight => AssignOp::UnsignedShiftRight,
                PCodeOp::AsnBitwiseAnd => AssignOp::BitwiseAnd,
                PCodeOp::AsnBitwiseXor => AssignOp::BitwiseXor,
                _ => AssignOp::BitwiseOr,
            };
            let symbol = SymbolId(c.u32()?);
            let element = c.i32()?;
            let stack_offset = c.i32()?;
            let flags = SymbolFlags::from_bits_retain(c.u32()?);
            let source_ty = c.ty()?;
            let rhs_ty = c.ty()?;
            let rhs = c.child(size_us)?;
            PCode::Assignment {
                op: asn,
                ty,
                source_ty,
                rhs_ty,
                symbol,
                element,
                stack_offset,
                flags,
                rhs,
            }
        }
        PCodeOp::Switch
        | PCodeOp::If
        | PCodeOp::Do
        | PCodeOp::While
        | PCodeOp::For
        | PCodeOp::Conditional => {
            let block = match op {
                PCodeOp::Switch => BlockOp::Switch,
                PCodeOp::If => BlockOp::If,
                PCodeOp::Do => BlockOp::Do,
                PCodeOp::While => BlockOp::While,
                PCodeOp::For => BlockOp::For,
                _ => BlockOp::Conditional,
            };
            let mut slots = [BlockSlot { body: PCodeSlice::EMPTY, file: -1, line: -1 }; 5];
            for slot in &mut slots {
                let body = c.child(size_us)?;
                let file = c.i32()?;
                let line = c.i32()?;
                *slot = BlockSlot { body, file, line };
            }
            PCode::Block5 { op: block, ty, slots }
        }
    };

    Ok((record, size_us))
}

/// Iterator over the records of one slice.
#[derive(Debug, Clone)]
pub struct PCodeReader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> PCodeReader<'a> {
    /// Reader over `slice` of `buf`.
    pub fn new(buf: &'a [u8], slice: PCodeSlice) -> Self {
        let start = slice.start as usize;
        let end = start + slice.len as usize;
        Self { buf, pos: start, end: end.min(buf.len()) }
    }

    /// True when the reader has consumed its slice.
    pub fn at_end(&self) -> bool {
        self.pos >= self.end
    }
}

impl<'a> Iterator for PCodeReader<'a> {
    type Item = PCodeResult<(usize, PCode<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        match decode_record(self.buf, self.pos, self.end) {
            Ok((record, size)) => {
                let at = self.pos;
                self.pos += size;
                Some(Ok((at, record)))
            }
            Err(e) => {
                self.pos = self.end; // poison further iteration
                Some(Err(e))
            }
        }
    }
}

/// If `slice` consists of exactly one integer literal, return its value.
/// Used for constant-conditional folding.
pub fn single_constant_int(buf: &[u8], slice: PCodeSlice) -> Option<i32> {
    if slice.is_empty() {
        return None;
    }
    let at = slice.start as usize;
    let end = at + slice.len as usize;
    match decode_record(buf, at, end) {
        Ok((PCode::Constant(ConstValue::Integer(v)), size)) if at + size == end => Some(v),
        _ => None,
    }
}
