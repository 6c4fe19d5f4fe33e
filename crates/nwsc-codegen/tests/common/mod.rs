//! Shared front-end helpers for the generator integration tests:
//! builds units the way the parser would, and decodes the output.

#![allow(dead_code)]

use nwsc_codegen::{CodeGenOptions, CodeGenerator, CompiledScript};
use nwsc_core::Type;
use nwsc_ncs::disasm::disassemble;
use nwsc_ncs::{Instr, Op};
use nwsc_pcode::{
    BinaryOp, FunctionFlags, PCodeBuilder, PCodeSlice, SymbolFlags, SymbolId, Unit,
};

/// Placeholder symbol for local variables: the emitter only consults the
/// symbol table for globals.
pub const LOCAL: SymbolId = SymbolId(u32::MAX);

pub fn unit_with_file() -> Unit {
    let mut unit = Unit::new();
    unit.add_file("demo.nss", true);
    unit
}

/// One `int` parameter declaration without a default.
pub fn int_param(unit: &mut Unit, name: &str) -> PCodeSlice {
    let mut b = PCodeBuilder::new();
    b.push_declaration(Type::Integer, name, 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    unit.append_pcode(&b)
}

/// Declare and define a function in one step.
pub fn define_fn(
    unit: &mut Unit,
    name: &str,
    ret: Type,
    args: PCodeSlice,
    body: &PCodeBuilder,
) -> SymbolId {
    let id = unit.add_function(name, ret, args, 0, 1, FunctionFlags::empty()).unwrap();
    let code = unit.append_pcode(body);
    unit.set_function_code(id, code);
    id
}

/// Wrap records in a `Statement` releasing `locals` cells.
pub fn stmt(locals: i32, body: &PCodeBuilder) -> PCodeBuilder {
    let mut b = PCodeBuilder::new();
    b.push_statement(locals, body);
    b
}

/// `return <int literal>;`
pub fn return_int(value: i32) -> PCodeBuilder {
    let mut v = PCodeBuilder::new();
    v.push_constant_int(value);
    let mut b = PCodeBuilder::new();
    b.push_return(Type::Integer, &v);
    b
}

/// Read of a local `int` at cell `offset`.
pub fn read_local_int(b: &mut PCodeBuilder, offset: i32) {
    b.push_variable(Type::Integer, Type::Integer, LOCAL, -1, offset, SymbolFlags::empty());
}

/// `lhs <op> rhs` over two already-pushed ints.
pub fn int_binary(b: &mut PCodeBuilder, op: BinaryOp) {
    b.push_binary_op(op, Type::Integer, Type::Integer, Type::Integer);
}

pub fn compile(unit: &mut Unit) -> CompiledScript {
    compile_with(unit, CodeGenOptions::default())
}

pub fn compile_with(unit: &mut Unit, options: CodeGenOptions) -> CompiledScript {
    CodeGenerator::new(options).generate(unit, true).expect("emission failed")
}

pub fn ops_of(ncs: &[u8]) -> Vec<(usize, Instr)> {
    disassemble(ncs).expect("output does not disassemble")
}

pub fn kinds(instrs: &[(usize, Instr)]) -> Vec<Op> {
    instrs.iter().map(|(_, i)| i.op).collect()
}

/// Jump targets as absolute offsets, paired with the site.
pub fn jump_sites(instrs: &[(usize, Instr)], op: Op) -> Vec<(usize, i64)> {
    instrs
        .iter()
        .filter(|(_, i)| i.op == op)
        .filter_map(|(at, i)| match i.payload {
            nwsc_ncs::Payload::Jump(delta) => Some((*at, *at as i64 + i64::from(delta))),
            _ => None,
        })
        .collect()
}
