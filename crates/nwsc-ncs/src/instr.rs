//! Instruction codec: decoded form, byte-exact encode and decode.
//!
//! Every instruction is `(opcode: u8, type: u8, payload…)` with all
//! multi-byte payload fields big-endian. Decoding then re-encoding any
//! instruction reproduces the input bytes exactly; the round-trip tests
//! of the code generator rely on that.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::op::{binary_type_byte, Op};
use crate::NcsError;

/// Operand payload of one instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No payload.
    None,
    /// Stack copy: byte offset (negative, from the cursor) and byte count.
    Copy {
        /// Stack offset in bytes.
        offset: i32,
        /// Copied size in bytes.
        size: i16,
    },
    /// `CONST` of int or object (selected by the type byte).
    ConstInt(i32),
    /// `CONST` of float.
    ConstFloat(f32),
    /// `CONST` of string: raw bytes, length prefix re-derived on encode.
    ConstString(Vec<u8>),
    /// Engine call.
    Action {
        /// Engine action id.
        action: i16,
        /// Argument count.
        argc: u8,
    },
    /// Single stack byte offset (`MOVSP`, inc/dec).
    Offset(i32),
    /// Relative jump from the instruction's own start.
    Jump(i32),
    /// `DESTRUCT` operands, all in bytes.
    Destruct {
        /// Total size on the stack.
        total: i16,
        /// Offset of the element kept.
        element: i16,
        /// Size of the element kept.
        size: i16,
    },
    /// `STORE_STATE` operands, in bytes.
    StoreState {
        /// Saved base-pointer depth.
        bp: i32,
        /// Saved stack-pointer depth.
        sp: i32,
    },
    /// Extra byte count of a `TT`-typed binary comparison.
    Size(i16),
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    /// The opcode.
    pub op: Op,
    /// The type-operand byte.
    pub ty: u8,
    /// Opcode-dependent payload.
    pub payload: Payload,
}

impl Instr {
    /// Append the instruction's exact byte form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.op as u8);
        out.push(self.ty);
        match &self.payload {
            Payload::None => {}
            Payload::Copy { offset, size } => {
                let _ = out.write_i32::<BigEndian>(*offset);
                let _ = out.write_i16::<BigEndian>(*size);
            }
            Payload::ConstInt(v) => {
                let _ = out.write_i32::<BigEndian>(*v);
            }
            Payload::ConstFloat(v) => {
                let _ = out.write_u32::<BigEndian>(v.to_bits());
            }
            Payload::ConstString(bytes) => {
                let _ = out.write_i16::<BigEndian>(bytes.len() as i16);
                out.extend_from_slice(bytes);
            }
            Payload::Action { action, argc } => {
                let _ = out.write_i16::<BigEndian>(*action);
                out.push(*argc);
            }
            Payload::Offset(v) | Payload::Jump(v) => {
                let _ = out.write_i32::<BigEndian>(*v);
            }
            Payload::Destruct { total, element, size } => {
                let _ = out.write_i16::<BigEndian>(*total);
                let _ = out.write_i16::<BigEndian>(*element);
                let _ = out.write_i16::<BigEndian>(*size);
            }
            Payload::StoreState { bp, sp } => {
                let _ = out.write_i32::<BigEndian>(*bp);
                let _ = out.write_i32::<BigEndian>(*sp);
            }
            Payload::Size(v) => {
                let _ = out.write_i16::<BigEndian>(*v);
            }
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        2 + match &self.payload {
            Payload::None => 0,
            Payload::Copy { .. } => 6,
            Payload::ConstInt(_) | Payload::ConstFloat(_) => 4,
            Payload::ConstString(bytes) => 2 + bytes.len(),
            Payload::Action { .. } => 3,
            Payload::Offset(_) | Payload::Jump(_) => 4,
            Payload::Destruct { .. } => 6,
            Payload::StoreState { .. } => 8,
            Payload::Size(_) => 2,
        }
    }
}

fn need(data: &[u8], at: usize, n: usize) -> Result<(), NcsError> {
    if at + n > data.len() {
        return Err(NcsError::Truncated { at });
    }
    Ok(())
}

/// Decode the instruction starting at `at`. Returns the instruction and
/// the offset of the next one.
pub fn decode(data: &[u8], at: usize) -> Result<(Instr, usize), NcsError> {
    need(data, at, 2)?;
    let raw = data[at];
    let op = Op::from_u8(raw).ok_or(NcsError::UnknownOpcode { at, op: raw })?;
    let ty = data[at + 1];
    let mut pos = at + 2;

    let payload = match op {
        Op::CpDownSp | Op::CpTopSp | Op::CpDownBp | Op::CpTopBp => {
            need(data, pos, 6)?;
            let offset = BigEndian::read_i32(&data[pos..]);
            let size = BigEndian::read_i16(&data[pos + 4..]);
            pos += 6;
            Payload::Copy { offset, size }
        }
        Op::Const => match ty {
            crate::op::type_byte::INT | crate::op::type_byte::OBJECT => {
                need(data, pos, 4)?;
                let v = BigEndian::read_i32(&data[pos..]);
                pos += 4;
                Payload::ConstInt(v)
            }
            crate::op::type_byte::FLOAT => {
                need(data, pos, 4)?;
                let v = f32::from_bits(BigEndian::read_u32(&data[pos..]));
                pos += 4;
                Payload::ConstFloat(v)
            }
            crate::op::type_byte::STRING => {
                need(data, pos, 2)?;
                let len = BigEndian::read_i16(&data[pos..]);
                if len < 0 {
                    return Err(NcsError::BadTypeByte { at, ty });
                }
                pos += 2;
                need(data, pos, len as usize)?;
                let bytes = data[pos..pos + len as usize].to_vec();
                pos += len as usize;
                Payload::ConstString(bytes)
            }
            _ => return Err(NcsError::BadTypeByte { at, ty }),
        },
        Op::Action => {
            need(data, pos, 3)?;
            let action = BigEndian::read_i16(&data[pos..]);
            let argc = data[pos + 2];
            pos += 3;
            Payload::Action { action, argc }
        }
        Op::LogAnd
        | Op::LogOr
        | Op::IncOr
        | Op::ExcOr
        | Op::BoolAnd
        | Op::Equal
        | Op::NEqual
        | Op::Geq
        | Op::Gt
        | Op::Lt
        | Op::Leq
        | Op::ShLeft
        | Op::ShRight
        | Op::UShRight
        | Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::Mod => {
            if ty == binary_type_byte::TT {
                need(data, pos, 2)?;
                let v = BigEndian::read_i16(&data[pos..]);
                pos += 2;
                Payload::Size(v)
            } else {
                Payload::None
            }
        }
        Op::MovSp | Op::DecISp | Op::IncISp | Op::DecIBp | Op::IncIBp => {
            need(data, pos, 4)?;
            let v = BigEndian::read_i32(&data[pos..]);
            pos += 4;
            Payload::Offset(v)
        }
        Op::Jmp | Op::Jsr | Op::Jz | Op::Jnz => {
            need(data, pos, 4)?;
            let v = BigEndian::read_i32(&data[pos..]);
            pos += 4;
            Payload::Jump(v)
        }
        Op::Destruct => {
            need(data, pos, 6)?;
            let total = BigEndian::read_i16(&data[pos..]);
            let element = BigEndian::read_i16(&data[pos + 2..]);
            let size = BigEndian::read_i16(&data[pos + 4..]);
            pos += 6;
            Payload::Destruct { total, element, size }
        }
        Op::StoreState | Op::StoreStateAll => {
            need(data, pos, 8)?;
            let bp = BigEndian::read_i32(&data[pos..]);
            let sp = BigEndian::read_i32(&data[pos + 4..]);
            pos += 8;
            Payload::StoreState { bp, sp }
        }
        Op::RsAdd
        | Op::Neg
        | Op::Comp
        | Op::Not
        | Op::Retn
        | Op::SaveBp
        | Op::RestoreBp
        | Op::Nop => Payload::None,
    };

    Ok((Instr { op, ty, payload }, pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::type_byte;
    use pretty_assertions::assert_eq;

    fn roundtrip(instr: Instr) {
        let mut bytes = Vec::new();
        instr.encode(&mut bytes);
        assert_eq!(bytes.len(), instr.encoded_len());
        let (decoded, next) = decode(&bytes, 0).unwrap();
        assert_eq!(next, bytes.len());
        assert_eq!(decoded, instr);
        let mut again = Vec::new();
        decoded.encode(&mut again);
        assert_eq!(again, bytes);
    }

    #[test]
    fn payload_shapes_roundtrip() {
        roundtrip(Instr {
            op: Op::CpDownSp,
            ty: type_byte::COPY,
            payload: Payload::Copy { offset: -8, size: 4 },
        });
        roundtrip(Instr {
            op: Op::Const,
            ty: type_byte::STRING,
            payload: Payload::ConstString(b"abc".to_vec()),
        });
        roundtrip(Instr {
            op: Op::Equal,
            ty: binary_type_byte::TT,
            payload: Payload::Size(12),
        });
        roundtrip(Instr {
            op: Op::Action,
            ty: type_byte::VOID,
            payload: Payload::Action { action: 37, argc: 2 },
        });
        roundtrip(Instr {
            op: Op::StoreState,
            ty: type_byte::STORE_STATE,
            payload: Payload::StoreState { bp: 8, sp: 12 },
        });
        roundtrip(Instr { op: Op::Retn, ty: 0, payload: Payload::None });
    }

    #[test]
    fn jump_payload_is_big_endian() {
        let mut bytes = Vec::new();
        Instr { op: Op::Jmp, ty: 0, payload: Payload::Jump(6) }.encode(&mut bytes);
        assert_eq!(bytes, vec![0x1D, 0x00, 0x00, 0x00, 0x00, 0x06]);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let err = decode(&[0xEE, 0x00], 0).unwrap_err();
        assert_eq!(err, NcsError::UnknownOpcode { at: 0, op: 0xEE });
    }
}
