//! Two-phase label resolution.
//!
//! Jumps are emitted with a placeholder offset. A jump to an unresolved
//! label appends a back-link record (site, previous link) to the label's
//! chain, held in an arena separate from the output buffer; resolving
//! the label walks the chain once, patching each site with
//! `target - site`. Function labels are named and referenced by `JSR`
//! before their routines are emitted; control-flow labels are anonymous.

use indexmap::IndexMap;

use crate::buffer::CodeBuffer;
use crate::diag::{CodegenError, EmitResult};

/// Handle to a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(u32);

#[derive(Debug, Clone, Copy)]
struct Label {
    offset: Option<usize>,
    first_link: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct BackLink {
    next: Option<u32>,
    site: usize,
}

/// The label table and its back-link arena.
#[derive(Debug, Default)]
pub struct Linker {
    labels: Vec<Label>,
    links: Vec<BackLink>,
    names: IndexMap<String, LabelId>,
}

impl Linker {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn push_label(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(Label { offset: None, first_link: None });
        id
    }

    /// Fresh anonymous label, unresolved, with an empty back-link chain.
    pub fn forward_label(&mut self) -> LabelId {
        self.push_label()
    }

    /// Find or create the label for a routine name.
    pub fn named_label(&mut self, name: &str) -> LabelId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = self.push_label();
        self.names.insert(name.to_string(), id);
        id
    }

    /// Record a jump site referencing `id`. `site` is the offset of the
    /// jump instruction's first byte; the relative offset lives at
    /// `site + 2`. Patches immediately when the label is resolved.
    pub fn reference(&mut self, id: LabelId, site: usize, out: &mut CodeBuffer) {
        let label = &mut self.labels[id.0 as usize];
        match label.offset {
            Some(target) => out.patch_i32(site + 2, (target as i64 - site as i64) as i32),
            None => {
                let link = BackLink { next: label.first_link, site };
                let at = self.links.len() as u32;
                self.links.push(link);
                label.first_link = Some(at);
            }
        }
    }

    /// Resolve `id` to the current write position, patching every
    /// recorded site.
    pub fn resolve(&mut self, id: LabelId, out: &mut CodeBuffer) -> EmitResult<()> {
        let label = &mut self.labels[id.0 as usize];
        if label.offset.is_some() {
            return Err(CodegenError::Internal("label resolved twice".into()));
        }
        let target = out.pos();
        label.offset = Some(target);
        let mut link = label.first_link.take();
        while let Some(at) = link {
            let bl = self.links[at as usize];
            out.patch_i32(bl.site + 2, (target as i64 - bl.site as i64) as i32);
            link = bl.next;
        }
        Ok(())
    }

    /// True when some referenced label was never resolved.
    pub fn has_dangling_references(&self) -> bool {
        self.labels.iter().any(|l| l.offset.is_none() && l.first_link.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jump_stub(out: &mut CodeBuffer) -> usize {
        let site = out.pos();
        out.put_u8(0x1D).unwrap();
        out.put_u8(0).unwrap();
        out.put_i32(0).unwrap();
        site
    }

    #[test]
    fn backward_reference_patches_immediately() {
        let mut out = CodeBuffer::with_capacity(16, 256);
        let mut linker = Linker::new();
        let label = linker.forward_label();
        linker.resolve(label, &mut out).unwrap();
        out.put_bytes(&[0u8; 4]).unwrap();
        let site = jump_stub(&mut out);
        linker.reference(label, site, &mut out);
        let delta = i32::from_be_bytes(out.as_slice()[site + 2..site + 6].try_into().unwrap());
        assert_eq!(delta, -4);
    }

    #[test]
    fn forward_chain_is_patched_on_resolve() {
        let mut out = CodeBuffer::with_capacity(16, 256);
        let mut linker = Linker::new();
        let label = linker.forward_label();
        let a = jump_stub(&mut out);
        linker.reference(label, a, &mut out);
        let b = jump_stub(&mut out);
        linker.reference(label, b, &mut out);
        assert!(linker.has_dangling_references());
        linker.resolve(label, &mut out).unwrap();
        let target = out.pos() as i64;
        for site in [a, b] {
            let delta =
                i32::from_be_bytes(out.as_slice()[site + 2..site + 6].try_into().unwrap());
            assert_eq!(i64::from(delta), target - site as i64);
        }
        assert!(!linker.has_dangling_references());
    }

    #[test]
    fn named_labels_are_shared() {
        let mut linker = Linker::new();
        let a = linker.named_label("main");
        let b = linker.named_label("main");
        assert_eq!(a, b);
        assert_ne!(linker.forward_label(), a);
    }
}
