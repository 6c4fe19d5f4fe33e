//! Diagnostics and the fatal error kinds surfaced by the generator.

use nwsc_core::Type;
use nwsc_pcode::PCodeError;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational note.
    Info,
    /// Suspicious construct; emission still succeeds.
    Warning,
    /// Fatal problem.
    Error,
}

/// One collected diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
}

impl Diagnostic {
    /// Construct a warning.
    pub fn warn(message: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, message: message.into() }
    }

    /// Construct an informational note.
    pub fn info(message: impl Into<String>) -> Self {
        Self { severity: Severity::Info, message: message.into() }
    }
}

/// Fatal failures. Any of these aborts emission; the partially-built
/// output is discarded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodegenError {
    /// Neither `main` nor `StartingConditional` exists.
    #[error("entry point symbol not found: expected `main` or `StartingConditional`")]
    EntrySymbolNotFound,
    /// The entry symbol is not a function.
    #[error("entry point `{0}` must be a function")]
    EntrySymbolMustBeFunction(String),
    /// The entry function's return type does not match its role.
    #[error("entry point `{name}` must return `{expected}`")]
    EntrySymbolMustReturnType {
        /// Entry symbol name.
        name: String,
        /// Required return type.
        expected: Type,
    },
    /// A referenced function has neither a body nor a default.
    #[error("function `{0}` has no body")]
    FunctionBodyMissing(String),
    /// Output would exceed the configured script size limit.
    #[error("compiled script exceeds the maximum size")]
    ScriptTooLarge,
    /// An IR invariant was violated; always a front-end or compiler bug.
    #[error("internal compiler error: {0}")]
    Internal(String),
    /// The PCode stream failed to decode; also a programmer error.
    #[error("internal compiler error: {0}")]
    InvalidPCode(#[from] PCodeError),
}

/// Result alias used throughout the generator.
pub type EmitResult<T> = Result<T, CodegenError>;
