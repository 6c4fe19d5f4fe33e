//! nwsc-codegen — traduit l'IR PCode en image de script compilé.
//!
//! Le pipeline est un calcul séquentiel par unité de compilation :
//!
//! 1. la passe d'atteignabilité parcourt les initialiseurs globaux et le
//!    point d'entrée, collecte les fonctions à émettre et fige les
//!    drapeaux des symboles ;
//! 2. l'émetteur abaisse l'IR en instructions VM, en suivant les trois
//!    curseurs de pile et en rustinant les références avant ;
//! 3. le cadrage du conteneur est finalisé, et le sidecar NDB est
//!    construit sur demande.
//!
//! Rien n'est partagé entre unités ; on peut compiler plusieurs unités
//! en parallèle tant que chacune possède son [`nwsc_pcode::Unit`]. Une
//! erreur fatale abandonne la sortie partiellement construite.
//!
//! ```no_run
//! use nwsc_codegen::{CodeGenOptions, CodeGenerator};
//! use nwsc_pcode::Unit;
//!
//! let mut unit = Unit::new();
//! // ... front-end fills the unit ...
//! let generator = CodeGenerator::new(CodeGenOptions::default());
//! let compiled = generator.generate(&mut unit, true)?;
//! std::fs::write("out.ncs", &compiled.ncs)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(missing_docs)]

mod buffer;
mod debuginfo;
mod diag;
mod emitter;
mod linker;
mod options;
mod reachability;
mod sideeffects;

pub use diag::{CodegenError, Diagnostic, EmitResult, Severity};
pub use options::{
    CodeGenFlags, CodeGenOptions, GLOBALS_OPT_VERSION, INITIAL_SCRIPT, MAX_SCRIPT,
};
pub use reachability::Reachability;
pub use sideeffects::has_side_effects;

use nwsc_ncs::ndb::NdbFile;
use nwsc_pcode::Unit;

/// A finished emission.
#[derive(Debug)]
pub struct CompiledScript {
    /// The complete container image, header included.
    pub ncs: Vec<u8>,
    /// The debug sidecar, when requested.
    pub ndb: Option<NdbFile>,
    /// Warnings collected along the way; never fatal.
    pub diagnostics: Vec<Diagnostic>,
}

/// The code generator facade.
#[derive(Debug, Clone, Default)]
pub struct CodeGenerator {
    options: CodeGenOptions,
}

impl CodeGenerator {
    /// Generator with the given options.
    pub fn new(options: CodeGenOptions) -> Self {
        Self { options }
    }

    /// Run the full pipeline over `unit`. With `debug` set, the debug
    /// sidecar is assembled alongside the image; the image bytes are
    /// identical either way.
    pub fn generate(&self, unit: &mut Unit, debug: bool) -> EmitResult<CompiledScript> {
        let pcode = unit.pcode().to_vec();
        let (ncs, ndb, diagnostics) = emitter::run(unit, &pcode, &self.options, debug)?;
        Ok(CompiledScript { ncs, ndb, diagnostics })
    }
}
