//! nwsc-core — primitives partagées de la chaîne NWScript.
//!
//! Fournit :
//! - [`Type`] : le système de types du script (scalaires, `vector`,
//!   références moteur, structures utilisateur) avec son code compact
//! - Le comptage en cellules (`CELL_BYTES`, tailles scalaires)
//! - [`ByteReader`] : lectures séquentielles big-endian sur un slice
//! - [`CoreError`] + [`CoreResult`]
//!
//! Tout le haut de la pile (IR, générateur de code, IO du conteneur)
//! repose sur ces définitions ; rien ici n'en dépend en retour.

#![deny(missing_docs)]

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/* ─────────────────────────── Cells ─────────────────────────── */

/// Size of one VM stack slot in bytes.
pub const CELL_BYTES: i32 = 4;

/* ─────────────────────────── Types ─────────────────────────── */

/// Number of engine reference slots the VM reserves (`effect`, `event`, …).
pub const ENGINE_TYPE_SLOTS: u8 = 16;

/// A script-level type.
///
/// `Engine(k)` is an opaque engine reference (k below
/// [`ENGINE_TYPE_SLOTS`]); `Struct(k)` is the k-th user structure.
/// `Action` only ever appears on deferred call arguments and has size
/// zero on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Type {
    /// No value.
    Void,
    /// 32-bit signed integer.
    Integer,
    /// 32-bit IEEE-754 float.
    Float,
    /// Counted byte string.
    String,
    /// 32-bit opaque object id.
    Object,
    /// Three floats (`x`, `y`, `z`).
    Vector,
    /// Deferred statement argument (`action` parameter).
    Action,
    /// Engine reference type `k`.
    Engine(u8),
    /// User structure type `k`.
    Struct(u16),
}

const TYPE_ENGINE_BASE: u16 = 0x0100;
const TYPE_STRUCT_BASE: u16 = 0x1000;

impl Type {
    /// Compact wire code used by the IR record encoding.
    pub fn code(self) -> u16 {
        match self {
            Type::Void => 0,
            Type::Integer => 1,
            Type::Float => 2,
            Type::String => 3,
            Type::Object => 4,
            Type::Vector => 5,
            Type::Action => 6,
            Type::Engine(k) => TYPE_ENGINE_BASE + u16::from(k),
            Type::Struct(k) => TYPE_STRUCT_BASE + k,
        }
    }

    /// Inverse of [`Type::code`].
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Type::Void),
            1 => Some(Type::Integer),
            2 => Some(Type::Float),
            3 => Some(Type::String),
            4 => Some(Type::Object),
            5 => Some(Type::Vector),
            6 => Some(Type::Action),
            c if (TYPE_ENGINE_BASE..TYPE_ENGINE_BASE + u16::from(ENGINE_TYPE_SLOTS))
                .contains(&c) =>
            {
                Some(Type::Engine((c - TYPE_ENGINE_BASE) as u8))
            }
            c if c >= TYPE_STRUCT_BASE => Some(Type::Struct(c - TYPE_STRUCT_BASE)),
            _ => None,
        }
    }

    /// True for user structure types.
    pub fn is_struct(self) -> bool {
        matches!(self, Type::Struct(_))
    }

    /// True for engine reference types.
    pub fn is_engine(self) -> bool {
        matches!(self, Type::Engine(_))
    }

    /// Stack size in cells for every type whose size does not depend on a
    /// structure layout. `None` for `Struct(_)`.
    pub fn scalar_size(self) -> Option<i32> {
        match self {
            Type::Void | Type::Action => Some(0),
            Type::Integer | Type::Float | Type::String | Type::Object | Type::Engine(_) => Some(1),
            Type::Vector => Some(3),
            Type::Struct(_) => None,
        }
    }

    /// Type code used by the textual debug (NDB) format: `v i f s o`,
    /// `t0000` for `vector`, `eK`, `tNNNN` (1-based) for structures.
    pub fn debug_text(self) -> String {
        match self {
            Type::Void => "v".into(),
            Type::Integer => "i".into(),
            Type::Float => "f".into(),
            Type::String => "s".into(),
            Type::Object => "o".into(),
            Type::Vector => "t0000".into(),
            Type::Engine(k) => format!("e{k}"),
            Type::Struct(k) => format!("t{:04}", k + 1),
            Type::Action => "???".into(),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Integer => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::String => write!(f, "string"),
            Type::Object => write!(f, "object"),
            Type::Vector => write!(f, "vector"),
            Type::Action => write!(f, "action"),
            Type::Engine(k) => write!(f, "engine{k}"),
            Type::Struct(k) => write!(f, "struct{k}"),
        }
    }
}

/// Lookup for sizes that depend on user structure layouts.
///
/// Implemented by the IR store, which owns the structure symbols; the
/// emitter only ever sees this trait.
pub trait TypeSizes {
    /// Stack size of `ty` in cells, structure members included
    /// transitively.
    fn size_of(&self, ty: Type) -> i32;
}

/* ─────────────────────────── Errors ─────────────────────────── */

/// Result alias for core IO helpers.
pub type CoreResult<T> = Result<T, CoreError>;

/// Low-level decode errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Ran past the end of the input buffer.
    #[error("unexpected end of input: need {needed} bytes at offset {at}")]
    UnexpectedEof {
        /// Bytes that were requested.
        needed: usize,
        /// Offset of the failed read.
        at: usize,
    },
    /// A byte sequence that should have been UTF-8 was not.
    #[error("invalid utf-8 at offset {at}")]
    InvalidUtf8 {
        /// Offset of the offending bytes.
        at: usize,
    },
}

/* ─────────────────────────── Byte Reader (BE) ─────────────────────────── */

/// Sequential reader over a byte slice. All multi-byte reads are
/// big-endian, matching the compiled-script container format.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Construct a reader over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, off: 0 }
    }

    /// Construct a reader starting at `off`.
    pub fn at(data: &'a [u8], off: usize) -> Self {
        Self { data, off }
    }

    /// Current offset.
    pub fn offset(&self) -> usize {
        self.off
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.off)
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::UnexpectedEof { needed: n, at: self.off });
        }
        let start = self.off;
        self.off += n;
        Ok(&self.data[start..self.off])
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> CoreResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Read a big-endian `i16`.
    pub fn read_i16(&mut self) -> CoreResult<i16> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian `u16`.
    pub fn read_u16(&mut self) -> CoreResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian `i32`.
    pub fn read_i32(&mut self) -> CoreResult<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> CoreResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian `f32`.
    pub fn read_f32(&mut self) -> CoreResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }
}

/* ─────────────────────────── Prelude ─────────────────────────── */

/// Convenience re-exports.
pub mod prelude {
    /// Re-exports of the crate's key items.
    pub use super::{ByteReader, CoreError, CoreResult, Type, TypeSizes, CELL_BYTES};
}

/* ─────────────────────────── Tests ─────────────────────────── */
