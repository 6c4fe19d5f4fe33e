//! Plomberie partagée des outils en ligne de commande `nwsc-*`.

#![deny(missing_docs)]

use std::io::Read as _;
use std::path::Path;

use anyhow::{Context, Result};

/// Lit une entrée, `-` signifiant stdin. Renvoie les octets et un nom
/// d'affichage pour les messages.
pub fn read_input(path: &str, stdin_name: &str) -> Result<(Vec<u8>, String)> {
    if path == "-" {
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .context("lecture de stdin")?;
        return Ok((bytes, stdin_name.to_string()));
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("lecture de `{path}`"))?;
    Ok((bytes, path.to_string()))
}

/// Dérive un chemin de sortie en remplaçant l'extension.
pub fn with_extension(path: &str, ext: &str) -> String {
    Path::new(path).with_extension(ext).display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_swap() {
        assert_eq!(with_extension("dir/file.ncs", "lst"), "dir/file.lst");
    }

    #[test]
    fn file_input_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.ncs");
        std::fs::write(&path, b"abc").unwrap();
        let (bytes, name) = read_input(path.to_str().unwrap(), "<stdin>").unwrap();
        assert_eq!(bytes, b"abc");
        assert!(name.ends_with("x.ncs"));
    }
}
