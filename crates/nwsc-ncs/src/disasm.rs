//! Whole-script disassembly: header validation, linear decode, listing.

use core::fmt::Write as _;

use crate::instr::{decode, Instr, Payload};
use crate::{NcsError, HEADER_SIZE, MAGIC, SIZE_TAG, VERSION};

/// Validate the 13-byte header and return the declared total size.
pub fn parse_header(data: &[u8]) -> Result<usize, NcsError> {
    if data.len() < HEADER_SIZE {
        return Err(NcsError::Truncated { at: 0 });
    }
    if &data[0..4] != MAGIC {
        return Err(NcsError::BadMagic);
    }
    if &data[4..8] != VERSION {
        return Err(NcsError::BadVersion);
    }
    if data[8] != SIZE_TAG {
        return Err(NcsError::BadSizeTag { found: data[8] });
    }
    let declared = u32::from_be_bytes([data[9], data[10], data[11], data[12]]) as usize;
    if declared != data.len() {
        return Err(NcsError::SizeMismatch { declared, actual: data.len() });
    }
    Ok(declared)
}

/// Decode a whole script into `(file_offset, instruction)` pairs.
/// Offsets include the header, matching the base jump deltas are
/// relative to.
pub fn disassemble(data: &[u8]) -> Result<Vec<(usize, Instr)>, NcsError> {
    let total = parse_header(data)?;
    let mut out = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos < total {
        let (instr, next) = decode(data, pos)?;
        out.push((pos, instr));
        pos = next;
    }
    Ok(out)
}

/// Check that every jump lands on an instruction start inside the
/// script.
pub fn verify_jumps(instrs: &[(usize, Instr)]) -> Result<(), NcsError> {
    let starts: std::collections::BTreeSet<usize> = instrs.iter().map(|(at, _)| *at).collect();
    for (at, instr) in instrs {
        if let Payload::Jump(delta) = instr.payload {
            let target = (*at as i64) + i64::from(delta);
            if target < 0 || !starts.contains(&(target as usize)) {
                return Err(NcsError::BadJumpTarget { at: *at, target });
            }
        }
    }
    Ok(())
}

/// Render a textual listing of a whole script.
pub fn listing(data: &[u8]) -> Result<String, NcsError> {
    let instrs = disassemble(data)?;
    let mut out = String::new();
    for (at, instr) in &instrs {
        let _ = write!(out, "{at:08x}  {:<14} {:02x}", instr.op.mnemonic(), instr.ty);
        match &instr.payload {
            Payload::None => {}
            Payload::Copy { offset, size } => {
                let _ = write!(out, " {offset}, {size}");
            }
            Payload::ConstInt(v) => {
                let _ = write!(out, " {v}");
            }
            Payload::ConstFloat(v) => {
                let _ = write!(out, " {v}");
            }
            Payload::ConstString(bytes) => {
                let _ = write!(out, " {:?}", String::from_utf8_lossy(bytes));
            }
            Payload::Action { action, argc } => {
                let _ = write!(out, " {action}, {argc}");
            }
            Payload::Offset(v) => {
                let _ = write!(out, " {v}");
            }
            Payload::Jump(delta) => {
                let target = (*at as i64) + i64::from(*delta);
                let _ = write!(out, " {target:08x}");
            }
            Payload::Destruct { total, element, size } => {
                let _ = write!(out, " {total}, {element}, {size}");
            }
            Payload::StoreState { bp, sp } => {
                let _ = write!(out, " {bp}, {sp}");
            }
            Payload::Size(v) => {
                let _ = write!(out, " {v}");
            }
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use crate::write_header;
    use pretty_assertions::assert_eq;

    fn tiny_script() -> Vec<u8> {
        let mut data = Vec::new();
        write_header(&mut data);
        Instr { op: Op::Jsr, ty: 0, payload: Payload::Jump(8) }.encode(&mut data);
        Instr { op: Op::Retn, ty: 0, payload: Payload::None }.encode(&mut data);
        Instr { op: Op::Retn, ty: 0, payload: Payload::None }.encode(&mut data);
        crate::finalize_size(&mut data);
        data
    }

    #[test]
    fn header_roundtrip() {
        let data = tiny_script();
        assert_eq!(parse_header(&data).unwrap(), data.len());
        let instrs = disassemble(&data).unwrap();
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[0].0, HEADER_SIZE);
        verify_jumps(&instrs).unwrap();
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut data = tiny_script();
        data.push(0);
        assert!(matches!(parse_header(&data), Err(NcsError::SizeMismatch { .. })));
    }

    #[test]
    fn bad_jump_target_is_rejected() {
        let mut data = Vec::new();
        write_header(&mut data);
        Instr { op: Op::Jmp, ty: 0, payload: Payload::Jump(3) }.encode(&mut data);
        Instr { op: Op::Retn, ty: 0, payload: Payload::None }.encode(&mut data);
        crate::finalize_size(&mut data);
        let instrs = disassemble(&data).unwrap();
        assert!(matches!(verify_jumps(&instrs), Err(NcsError::BadJumpTarget { .. })));
    }
}
