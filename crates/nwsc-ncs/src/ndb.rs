//! NDB debug sidecar: data model and line-oriented text writer.
//!
//! The format is consumed by pre-existing debuggers, so every field
//! width and pad character is fixed: offsets are eight lower-case hex
//! digits, decimal counts are seven digits, small indices two. The
//! synthetic `vector` structure always heads the structure list.

use core::fmt::Write as _;

/// One referenced source file.
#[derive(Debug, Clone)]
pub struct NdbSourceFile {
    /// File name.
    pub name: String,
    /// True for the main compilation unit.
    pub is_main: bool,
}

/// One field of a user structure.
#[derive(Debug, Clone)]
pub struct NdbField {
    /// Debug type code (`i`, `f`, `s`, `o`, `v`, `eK`, `tNNNN`).
    pub type_code: String,
    /// Field name.
    pub name: String,
}

/// One user structure.
#[derive(Debug, Clone)]
pub struct NdbStruct {
    /// Structure name.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<NdbField>,
}

/// One function entry.
#[derive(Debug, Clone)]
pub struct NdbFunction {
    /// Function name.
    pub name: String,
    /// First compiled byte, `0xFFFF_FFFF` when never emitted.
    pub start: u32,
    /// One past the last compiled byte, `0xFFFF_FFFF` when never emitted.
    pub end: u32,
    /// Return type code.
    pub ret: String,
    /// Parameter type codes in declaration order.
    pub params: Vec<String>,
}

/// One variable entry (global or local).
#[derive(Debug, Clone)]
pub struct NdbVariable {
    /// Variable name.
    pub name: String,
    /// Debug type code.
    pub type_code: String,
    /// First compiled byte of the live range.
    pub start: u32,
    /// One past the last compiled byte of the live range.
    pub end: u32,
    /// Stack offset in bytes.
    pub stack_offset: u32,
}

/// One source-line range.
#[derive(Debug, Clone, Copy)]
pub struct NdbLine {
    /// Used-file index.
    pub file: i32,
    /// Line number.
    pub line: i32,
    /// First compiled byte.
    pub start: u32,
    /// One past the last compiled byte.
    pub end: u32,
}

/// A complete debug sidecar, ready to render.
#[derive(Debug, Clone, Default)]
pub struct NdbFile {
    /// Referenced files, in first-use order.
    pub files: Vec<NdbSourceFile>,
    /// User structures (the synthetic `vector` is implied).
    pub structs: Vec<NdbStruct>,
    /// Functions, user functions first, synthetic routines last.
    pub functions: Vec<NdbFunction>,
    /// Variables: `#retval`, then stored globals, then locals.
    pub variables: Vec<NdbVariable>,
    /// Line ranges in emission order.
    pub lines: Vec<NdbLine>,
}

impl NdbFile {
    /// Render the sidecar text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "NDB V1.0");
        let _ = writeln!(
            out,
            "{:07} {:07} {:07} {:07} {:07}",
            self.files.len(),
            self.structs.len() + 1,
            self.functions.len(),
            self.variables.len(),
            self.lines.len()
        );

        for (i, file) in self.files.iter().enumerate() {
            let tag = if file.is_main { 'N' } else { 'n' };
            let _ = writeln!(out, "{tag}{i:02} {}", file.name);
        }

        let _ = writeln!(out, "s 03 vector");
        let _ = writeln!(out, "sf f x");
        let _ = writeln!(out, "sf f y");
        let _ = writeln!(out, "sf f z");
        for s in &self.structs {
            let _ = writeln!(out, "s {:02} {}", s.fields.len(), s.name);
            for field in &s.fields {
                let _ = writeln!(out, "sf {} {}", field.type_code, field.name);
            }
        }

        for f in &self.functions {
            let _ = writeln!(
                out,
                "f {:08x} {:08x} {:03} {} {}",
                f.start,
                f.end,
                f.params.len(),
                f.ret,
                f.name
            );
            for p in &f.params {
                let _ = writeln!(out, "fp {p}");
            }
        }

        for v in &self.variables {
            let _ = writeln!(
                out,
                "v {:08x} {:08x} {:08x} {} {}",
                v.start, v.end, v.stack_offset, v.type_code, v.name
            );
        }

        for l in &self.lines {
            let _ = writeln!(out, "l{:02} {:07} {:08x} {:08x}", l.file, l.line, l.start, l.end);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn render_matches_fixed_widths() {
        let ndb = NdbFile {
            files: vec![NdbSourceFile { name: "demo.nss".into(), is_main: true }],
            structs: vec![],
            functions: vec![NdbFunction {
                name: "#loader".into(),
                start: 13,
                end: 21,
                ret: "v".into(),
                params: vec![],
            }],
            variables: vec![NdbVariable {
                name: "#retval".into(),
                type_code: "i".into(),
                start: 15,
                end: 0xFFFF_FFFF,
                stack_offset: 0,
            }],
            lines: vec![NdbLine { file: 0, line: 3, start: 23, end: 45 }],
        };

        let text = ndb.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "NDB V1.0");
        assert_eq!(lines[1], "0000001 0000001 0000001 0000001 0000001");
        assert_eq!(lines[2], "N00 demo.nss");
        assert_eq!(lines[3], "s 03 vector");
        assert_eq!(lines[7], "f 0000000d 00000015 000 v #loader");
        assert_eq!(lines[8], "v 0000000f ffffffff 00000000 i #retval");
        assert_eq!(lines[9], "l00 0000003 00000017 0000002d");
    }
}
