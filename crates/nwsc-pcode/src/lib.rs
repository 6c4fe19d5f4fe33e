//! nwsc-pcode — la représentation intermédiaire NWScript.
//!
//! Le front-end abaisse l'arbre syntaxique vérifié en PCode : un unique
//! tampon contigu d'enregistrements auto-décrits de taille variable,
//! avec sous-flux imbriqués, plus une table des symboles. Ce crate
//! possède les deux et expose :
//!
//! - [`PCodeBuilder`] : la surface de construction append-only
//! - [`PCodeReader`] / [`Unit::walk`] : parcours linéaire, non récursif
//! - [`Unit`] : arène + table des symboles + fichiers + listes en ordre
//!   de déclaration
//! - [`printer`] : un listing de diagnostic indenté
//!
//! Les passes ultérieures traitent l'IR en lecture seule ; la seule
//! mutation inter-passes est le OR monotone des drapeaux et les offsets
//! compilés écrits une fois par symbole.

#![deny(missing_docs)]

pub mod build;
pub mod flags;
pub mod printer;
pub mod record;
pub mod symbol;
pub mod unit;
pub mod walk;

pub use build::{BlockSlotSrc, PCodeBuilder};
pub use flags::{FunctionFlags, SymbolFlags};
pub use record::{
    AssignOp, BinaryOp, BlockOp, BlockSlot, ConstValue, PCode, PCodeOp, PCodeSlice, UnaryOp,
    HEADER_SIZE,
};
pub use symbol::{
    FunctionData, Intrinsic, StructData, Symbol, SymbolData, SymbolId, SymbolKind, VariableData,
    NO_OFFSET,
};
pub use unit::{SourceFile, Unit};
pub use walk::{decode_record, single_constant_int, PCodeError, PCodeReader, PCodeResult};
