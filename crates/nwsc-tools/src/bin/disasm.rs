// crates/nwsc-tools/src/bin/disasm.rs
//! Désassembleur pour scripts compilés (`.ncs` -> texte).
//!
//! Exemples :
//!   nwsc-disasm a.ncs
//!   nwsc-disasm a.ncs b.ncs --emit-files
//!   cat a.ncs | nwsc-disasm - --stdin-name a.ncs
//!
//! Options utiles :
//!   --verify      : vérifie en plus que chaque saut retombe sur une instruction
//!   --emit-files  : écrit chaque listing à côté de son entrée (.lst)
//!   --summary     : une ligne par entrée (taille, nombre d'instructions)

use std::io::Write as _;

use anyhow::{Context, Result};
use clap::Parser;

use nwsc_ncs::disasm::{disassemble, listing, verify_jumps};
use nwsc_tools::{read_input, with_extension};

#[derive(Parser, Debug)]
#[command(name = "nwsc-disasm", version, about = "Désassembleur NWScript compilé (.ncs -> texte)")]
struct Cli {
    /// Fichier(s) .ncs à analyser (ou '-' pour stdin, unique)
    inputs: Vec<String>,

    /// Vérifie chaque cible de saut en plus du décodage
    #[arg(long)]
    verify: bool,

    /// Écrit chaque listing dans un fichier .lst voisin au lieu de stdout
    #[arg(long)]
    emit_files: bool,

    /// Affiche un résumé d'une ligne par entrée
    #[arg(long)]
    summary: bool,

    /// Nom logique quand l'entrée est '-' (stdin)
    #[arg(long, default_value = "<stdin>")]
    stdin_name: String,
}

fn main() {
    env_logger::init();
    if let Err(e) = real_main() {
        eprintln!("❌ {e:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();
    if cli.inputs.is_empty() {
        anyhow::bail!("Aucune entrée. Exemple : nwsc-disasm a.ncs");
    }
    if cli.inputs.len() > 1 && cli.inputs.iter().any(|i| i == "-") {
        anyhow::bail!("stdin ('-') doit être la seule entrée");
    }

    for input in &cli.inputs {
        let (bytes, name) = read_input(input, &cli.stdin_name)?;
        process_one(&bytes, &name, input, &cli)?;
    }
    Ok(())
}

fn process_one(bytes: &[u8], name: &str, input: &str, cli: &Cli) -> Result<()> {
    let instrs =
        disassemble(bytes).with_context(|| format!("désassemblage de `{name}`"))?;
    log::debug!("{name}: {} instructions", instrs.len());

    if cli.verify {
        verify_jumps(&instrs).with_context(|| format!("vérification de `{name}`"))?;
    }

    if cli.summary {
        println!("{name}: {} octets, {} instructions", bytes.len(), instrs.len());
    }

    if !cli.summary || cli.emit_files {
        let text = listing(bytes)?;
        if cli.emit_files && input != "-" {
            let out = with_extension(input, "lst");
            std::fs::write(&out, text).with_context(|| format!("écriture de `{out}`"))?;
            println!("{name} -> {out}");
        } else if !cli.summary {
            std::io::stdout().write_all(text.as_bytes())?;
        }
    }
    Ok(())
}
