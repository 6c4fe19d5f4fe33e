//! Purity analysis over a PCode slice.
//!
//! A slice has side effects iff it contains a call to a non-pure
//! callee, an assignment of any kind, or a variable use with pre/post
//! increment or decrement. Calls flagged `PURE_FUNCTION` do not count,
//! though their arguments are still inspected.

use nwsc_pcode::{FunctionFlags, PCode, PCodeReader, PCodeSlice, SymbolFlags, Unit};

use crate::diag::EmitResult;

/// True when evaluating `slice` could be observed.
pub fn has_side_effects(unit: &Unit, buf: &[u8], slice: PCodeSlice) -> EmitResult<bool> {
    for item in PCodeReader::new(buf, slice) {
        let (_, record) = item?;
        let effect = match record {
            PCode::Call { symbol, args, .. } => {
                let pure = unit
                    .symbol(symbol)
                    .function()
                    .is_some_and(|f| f.flags.contains(FunctionFlags::PURE_FUNCTION));
                if !pure {
                    return Ok(true);
                }
                has_side_effects(unit, buf, args)?
            }
            PCode::Assignment { .. } => true,
            PCode::Variable { flags, .. } => flags.contains(SymbolFlags::INCREMENTS),
            PCode::Declaration { init, .. } => has_side_effects(unit, buf, init)?,
            PCode::Argument { body, .. }
            | PCode::Statement { body, .. }
            | PCode::Element { body, .. } => has_side_effects(unit, buf, body)?,
            PCode::Return { value, .. } => has_side_effects(unit, buf, value)?,
            PCode::Case { key, .. } => has_side_effects(unit, buf, key)?,
            PCode::LogicalAnd { lhs, rhs } | PCode::LogicalOr { lhs, rhs } => {
                has_side_effects(unit, buf, lhs)? || has_side_effects(unit, buf, rhs)?
            }
            PCode::Block5 { slots, .. } => {
                let mut any = false;
                for slot in &slots {
                    if has_side_effects(unit, buf, slot.body)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            _ => false,
        };
        if effect {
            return Ok(true);
        }
    }
    Ok(false)
}
