//! Whole-output properties: determinism, buffer growth, the NDB text,
//! and line-list ordering.

mod common;

use common::*;
use nwsc_codegen::CodeGenOptions;
use nwsc_core::Type;
use nwsc_pcode::{AssignOp, PCodeBuilder, PCodeSlice, SymbolFlags, Unit};
use pretty_assertions::assert_eq;

fn conditional_unit() -> Unit {
    let mut unit = unit_with_file();
    define_fn(
        &mut unit,
        "StartingConditional",
        Type::Integer,
        PCodeSlice::EMPTY,
        &stmt(0, &return_int(1)),
    );
    unit
}

#[test]
fn emission_is_deterministic_and_growth_safe() {
    let mut a = conditional_unit();
    let mut b = conditional_unit();
    let first = compile(&mut a).ncs;
    let second = compile(&mut b).ncs;
    assert_eq!(first, second);

    // A one-byte starting capacity forces the growth path without
    // changing a single output byte.
    let mut c = conditional_unit();
    let tiny = compile_with(
        &mut c,
        CodeGenOptions { initial_capacity: 1, ..CodeGenOptions::default() },
    )
    .ncs;
    assert_eq!(first, tiny);
}

#[test]
fn ndb_text_for_conditional_entry() {
    let mut unit = conditional_unit();
    let compiled = compile(&mut unit);
    let expected = "\
NDB V1.0
0000001 0000001 0000002 0000002 0000001
N00 demo.nss
s 03 vector
sf f x
sf f y
sf f z
f 00000017 00000033 000 i StartingConditional
f 0000000d 00000017 000 i #loader
v 0000000f ffffffff 00000000 i #retval
v 00000017 00000031 00000000 i #retval
l00 0000001 00000017 00000033
";
    assert_eq!(compiled.ndb.unwrap().render(), expected);
}

/// A conditional entry with a stored global: `#globals` has to thread
/// the result back through the loader's reserved slot.
#[test]
fn globals_propagate_conditional_result() {
    let mut unit = unit_with_file();
    let mut init = PCodeBuilder::new();
    init.push_constant_int(0);
    let init = unit.append_pcode(&init);
    let g = unit.add_global_variable("g", Type::Integer, init, 0, 1, SymbolFlags::empty());

    let mut rhs = PCodeBuilder::new();
    rhs.push_constant_int(1);
    let mut body = PCodeBuilder::new();
    body.push_assignment(
        AssignOp::Assign,
        Type::Integer,
        Type::Integer,
        Type::Integer,
        g,
        -1,
        0,
        SymbolFlags::GLOBAL,
        &rhs,
    );
    body.push_expression_end(Type::Integer);
    body.push_return(Type::Integer, &{
        let mut v = PCodeBuilder::new();
        v.push_constant_int(1);
        v
    });
    define_fn(
        &mut unit,
        "StartingConditional",
        Type::Integer,
        PCodeSlice::EMPTY,
        &stmt(0, &body),
    );

    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    nwsc_ncs::disasm::verify_jumps(&instrs).unwrap();

    // One stored global: the result hop crosses it, the saved BP and
    // the reserved cell.
    assert!(instrs.iter().any(|(_, i)| i.op == nwsc_ncs::Op::CpDownSp
        && i.payload == nwsc_ncs::Payload::Copy { offset: -16, size: 4 }));
    let ndb = compiled.ndb.unwrap();
    assert!(ndb.functions.iter().any(|f| f.name == "#globals"));
    assert!(ndb.variables.iter().any(|v| v.name == "#retval"));
}

#[test]
fn line_list_is_ordered_and_coalesced() {
    let mut unit = unit_with_file();
    let mut body = PCodeBuilder::new();
    // Three markers on two lines; the duplicate coalesces.
    body.push_line(0, 10);
    body.push_constant_int(1);
    body.push_expression_end(Type::Integer);
    body.push_line(0, 10);
    body.push_constant_int(2);
    body.push_expression_end(Type::Integer);
    body.push_line(0, 11);
    body.push_constant_int(3);
    body.push_expression_end(Type::Integer);
    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(0, &body));

    let compiled = compile(&mut unit);
    let ndb = compiled.ndb.unwrap();
    let tens: Vec<_> = ndb.lines.iter().filter(|l| l.line == 10).collect();
    assert_eq!(tens.len(), 1);
    for pair in ndb.lines.windows(2) {
        assert!(pair[0].start <= pair[1].start, "line list out of emission order");
    }
}
