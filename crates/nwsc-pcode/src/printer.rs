//! Human-readable PCode dump, one record per line, children indented.
//!
//! Diagnostic aid only; the rendering is not a stable format.

use core::fmt::Write as _;

use crate::record::{ConstValue, PCode, PCodeSlice};
use crate::unit::Unit;

/// Render `slice` as an indented listing.
pub fn render(unit: &Unit, slice: PCodeSlice) -> String {
    let mut out = String::new();
    render_block(unit, slice, 1, &mut out);
    out
}

fn render_block(unit: &Unit, slice: PCodeSlice, depth: usize, out: &mut String) {
    let pad = " ".repeat(depth);
    for item in unit.reader(slice) {
        let record = match item {
            Ok((_, record)) => record,
            Err(e) => {
                let _ = writeln!(out, "{pad}<decode error: {e}>");
                return;
            }
        };
        match record {
            PCode::Line { file, line } => {
                let _ = writeln!(out, "{pad}Line ({file}:{line})");
            }
            PCode::Break => {
                let _ = writeln!(out, "{pad}Break");
            }
            PCode::Continue => {
                let _ = writeln!(out, "{pad}Continue");
            }
            PCode::ExpressionEnd { ty } => {
                let _ = writeln!(out, "{pad}ExpressionEnd ({ty})");
            }
            PCode::UnaryOp { op, ty } => {
                let _ = writeln!(out, "{pad}{op:?} ({ty})");
            }
            PCode::BinaryOp { op, lhs, rhs, .. } => {
                let _ = writeln!(out, "{pad}{op:?} ({lhs}, {rhs})");
            }
            PCode::Constant(value) => match value {
                ConstValue::Integer(v) => {
                    let _ = writeln!(out, "{pad}Constant (int {v})");
                }
                ConstValue::Float(v) => {
                    let _ = writeln!(out, "{pad}Constant (float {v})");
                }
                ConstValue::String(v) => {
                    let _ = writeln!(out, "{pad}Constant (string {v:?})");
                }
                ConstValue::Object(v) => {
                    let _ = writeln!(out, "{pad}Constant (object {v:#x})");
                }
                ConstValue::Vector(v) => {
                    let _ = writeln!(out, "{pad}Constant (vector [{}, {}, {}])", v[0], v[1], v[2]);
                }
                ConstValue::Struct(ty) => {
                    let _ = writeln!(out, "{pad}Constant (default {ty})");
                }
            },
            PCode::Variable { symbol, element, .. } => {
                let name = &unit.symbol(symbol).name;
                if element >= 0 {
                    let _ = writeln!(out, "{pad}Variable ({name}.{element})");
                } else {
                    let _ = writeln!(out, "{pad}Variable ({name})");
                }
            }
            PCode::Declaration { ty, name, init, .. } => {
                let _ = writeln!(out, "{pad}Declaration ({ty} {name})");
                render_block(unit, init, depth + 1, out);
            }
            PCode::Argument { ty, body } => {
                let _ = writeln!(out, "{pad}Argument ({ty})");
                render_block(unit, body, depth + 1, out);
            }
            PCode::Statement { locals, body } => {
                let _ = writeln!(out, "{pad}Statement (locals {locals})");
                render_block(unit, body, depth + 1, out);
            }
            PCode::Call { symbol, args, .. } => {
                let _ = writeln!(out, "{pad}Call ({})", unit.symbol(symbol).name);
                render_block(unit, args, depth + 1, out);
            }
            PCode::Element { element, body, .. } => {
                let _ = writeln!(out, "{pad}Element ({element})");
                render_block(unit, body, depth + 1, out);
            }
            PCode::Return { value, .. } => {
                let _ = writeln!(out, "{pad}Return");
                render_block(unit, value, depth + 1, out);
            }
            PCode::Case { key, .. } => {
                let _ = writeln!(out, "{pad}Case");
                render_block(unit, key, depth + 1, out);
            }
            PCode::Default { .. } => {
                let _ = writeln!(out, "{pad}Default");
            }
            PCode::LogicalAnd { lhs, rhs } => {
                let _ = writeln!(out, "{pad}LogicalAnd");
                render_block(unit, lhs, depth + 1, out);
                render_block(unit, rhs, depth + 1, out);
            }
            PCode::LogicalOr { lhs, rhs } => {
                let _ = writeln!(out, "{pad}LogicalOr");
                render_block(unit, lhs, depth + 1, out);
                render_block(unit, rhs, depth + 1, out);
            }
            PCode::Assignment { op, symbol, rhs, .. } => {
                let _ = writeln!(out, "{pad}Assignment ({op:?} {})", unit.symbol(symbol).name);
                render_block(unit, rhs, depth + 1, out);
            }
            PCode::Block5 { op, slots, .. } => {
                let _ = writeln!(out, "{pad}{op:?}");
                for (i, slot) in slots.iter().enumerate() {
                    if !slot.body.is_empty() {
                        let _ = writeln!(out, "{pad} slot[{i}]");
                        render_block(unit, slot.body, depth + 2, out);
                    }
                }
            }
        }
    }
}
