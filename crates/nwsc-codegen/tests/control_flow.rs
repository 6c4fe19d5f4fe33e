//! Lowering shapes for control flow, structures, engine calls and
//! intrinsics.

mod common;

use common::*;
use nwsc_codegen::{CodeGenFlags, CodeGenOptions};
use nwsc_core::Type;
use nwsc_ncs::disasm::verify_jumps;
use nwsc_ncs::{Op, Payload};
use nwsc_pcode::{
    AssignOp, BinaryOp, BlockOp, BlockSlotSrc, Intrinsic, PCodeBuilder, PCodeSlice, SymbolFlags,
};
use pretty_assertions::assert_eq;

/// `int x = 2;` plus a switch, the three loop forms, and a `for` with
/// `continue` — all inside one scope that releases its local at exit.
fn loops_program() -> nwsc_pcode::Unit {
    let mut unit = unit_with_file();

    let mut body = PCodeBuilder::new();

    // int x = 2;
    let mut init = PCodeBuilder::new();
    init.push_constant_int(2);
    body.push_declaration(Type::Integer, "x", 0, 2, SymbolFlags::empty(), &init);

    // switch (x) { case 1: break; default: break; }
    let mut selector = PCodeBuilder::new();
    read_local_int(&mut selector, 0);
    let mut sw_body = PCodeBuilder::new();
    let mut key = PCodeBuilder::new();
    key.push_constant_int(1);
    sw_body.push_case(0, 3, &key);
    let mut brk = PCodeBuilder::new();
    brk.push_break();
    sw_body.push_statement(0, &brk);
    sw_body.push_default(0, 4);
    sw_body.push_statement(0, &brk);
    body.push_block5(
        BlockOp::Switch,
        Type::Void,
        [
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::new(selector.bytes(), 0, 3),
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::new(sw_body.bytes(), 0, 3),
            BlockSlotSrc::EMPTY,
        ],
    );

    // while (1) { break; }
    let mut one = PCodeBuilder::new();
    one.push_constant_int(1);
    let wh_body = stmt(0, &brk);
    body.push_block5(
        BlockOp::While,
        Type::Void,
        [
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::new(one.bytes(), 0, 5),
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::new(wh_body.bytes(), 0, 5),
            BlockSlotSrc::EMPTY,
        ],
    );

    // do { } while (0);
    let mut zero = PCodeBuilder::new();
    zero.push_constant_int(0);
    body.push_block5(
        BlockOp::Do,
        Type::Void,
        [
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::new(zero.bytes(), 0, 6),
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::EMPTY,
        ],
    );

    // for (x = 0; x < 3; x += 1) { continue; }
    let mut for_init = PCodeBuilder::new();
    let mut rhs = PCodeBuilder::new();
    rhs.push_constant_int(0);
    for_init.push_assignment(
        AssignOp::Assign,
        Type::Integer,
        Type::Integer,
        Type::Integer,
        LOCAL,
        -1,
        0,
        SymbolFlags::empty(),
        &rhs,
    );
    let mut for_cond = PCodeBuilder::new();
    read_local_int(&mut for_cond, 0);
    for_cond.push_constant_int(3);
    int_binary(&mut for_cond, BinaryOp::LessThan);
    let mut for_step = PCodeBuilder::new();
    let mut rhs = PCodeBuilder::new();
    rhs.push_constant_int(1);
    for_step.push_assignment(
        AssignOp::Add,
        Type::Integer,
        Type::Integer,
        Type::Integer,
        LOCAL,
        -1,
        0,
        SymbolFlags::empty(),
        &rhs,
    );
    let mut cont = PCodeBuilder::new();
    cont.push_continue();
    let for_body = stmt(0, &cont);
    body.push_block5(
        BlockOp::For,
        Type::Void,
        [
            BlockSlotSrc::new(for_init.bytes(), 0, 7),
            BlockSlotSrc::new(for_cond.bytes(), 0, 7),
            BlockSlotSrc::new(for_step.bytes(), 0, 7),
            BlockSlotSrc::new(for_body.bytes(), 0, 7),
            BlockSlotSrc::EMPTY,
        ],
    );

    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(1, &body));
    unit
}

#[test]
fn loops_and_switch_lower_cleanly() {
    let mut unit = loops_program();
    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    verify_jumps(&instrs).unwrap();

    let ops = kinds(&instrs);
    // Switch: selector copy, key compare, dispatch.
    assert!(ops.contains(&Op::CpTopSp));
    assert!(ops.contains(&Op::Equal));
    assert!(ops.contains(&Op::Jnz));
    // The for condition is live (not constant-folded).
    assert!(ops.contains(&Op::Lt));
    // The scope's local is released exactly once at statement exit,
    // besides the selector drop.
    let drops = instrs
        .iter()
        .filter(|(_, i)| i.op == Op::MovSp && i.payload == Payload::Offset(-4))
        .count();
    assert!(drops >= 3, "selector drop, for-init drop, scope release");
}

#[test]
fn loops_program_roundtrips_bytes() {
    let mut unit = loops_program();
    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);

    let mut rebuilt = Vec::new();
    nwsc_ncs::write_header(&mut rebuilt);
    for (_, instr) in &instrs {
        instr.encode(&mut rebuilt);
    }
    nwsc_ncs::finalize_size(&mut rebuilt);
    assert_eq!(rebuilt, compiled.ncs);
}

#[test]
fn struct_element_read_uses_direct_copy_when_optimized() {
    // Optimized: one four-byte copy of the selected cell.
    let mut unit = struct_read_unit();
    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    assert!(instrs.iter().any(|(_, i)| i.op == Op::CpTopSp
        && i.payload == Payload::Copy { offset: -4, size: 4 }));
    assert!(!kinds(&instrs).contains(&Op::Destruct));

    // A structure in the unit forces #globals even with no globals.
    let ndb = compiled.ndb.unwrap();
    assert!(ndb.functions.iter().any(|f| f.name == "#globals"));
    let p = ndb.structs.iter().find(|s| s.name == "P").unwrap();
    assert_eq!(p.fields.len(), 2);

    // Unoptimized struct copy: whole value plus DESTRUCT.
    let mut unit = struct_read_unit();
    let mut flags = CodeGenFlags::from_version(169, true);
    flags.opt_struct_copy = false;
    let compiled = compile_with(
        &mut unit,
        CodeGenOptions { flags: Some(flags), ..CodeGenOptions::default() },
    );
    let instrs = ops_of(&compiled.ncs);
    assert!(instrs.iter().any(|(_, i)| i.op == Op::CpTopSp
        && i.payload == Payload::Copy { offset: -8, size: 8 }));
    assert!(instrs.iter().any(|(_, i)| i.op == Op::Destruct
        && i.payload == Payload::Destruct { total: 8, element: 4, size: 4 }));
}

/// `struct P { int a; int b; }` and a `main` that declares a `P` and
/// reads its second field.
fn struct_read_unit() -> nwsc_pcode::Unit {
    let mut unit = unit_with_file();
    let mut members = PCodeBuilder::new();
    members.push_declaration(Type::Integer, "a", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    members.push_declaration(Type::Integer, "b", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    let members = unit.append_pcode(&members);
    let (_, p_ty) = unit.add_struct("P", 2, members);

    let mut body = PCodeBuilder::new();
    body.push_declaration(p_ty, "p", 0, 2, SymbolFlags::empty(), &PCodeBuilder::new());
    body.push_variable(Type::Integer, p_ty, LOCAL, 1, 0, SymbolFlags::empty());
    body.push_expression_end(Type::Integer);
    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(2, &body));
    unit
}

#[test]
fn element_extraction_from_call_result() {
    let mut unit = unit_with_file();
    let mut members = PCodeBuilder::new();
    members.push_declaration(Type::Integer, "a", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    members.push_declaration(Type::Integer, "b", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    let members = unit.append_pcode(&members);
    let (_, p_ty) = unit.add_struct("P", 2, members);

    // struct P mk() { return <zero P>; }
    let mut value = PCodeBuilder::new();
    value.push_constant_struct(p_ty);
    let mut ret = PCodeBuilder::new();
    ret.push_return(p_ty, &value);
    let mk = define_fn(&mut unit, "mk", p_ty, PCodeSlice::EMPTY, &stmt(0, &ret));

    // mk().b;
    let mut call = PCodeBuilder::new();
    call.push_call(p_ty, mk, 0, &PCodeBuilder::new());
    let mut expr = PCodeBuilder::new();
    expr.push_element(Type::Integer, p_ty, 1, &call);
    expr.push_expression_end(Type::Integer);
    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(0, &expr));

    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    verify_jumps(&instrs).unwrap();
    assert!(instrs.iter().any(|(_, i)| i.op == Op::Destruct
        && i.payload == Payload::Destruct { total: 8, element: 4, size: 4 }));
}

#[test]
fn engine_call_with_deferred_statement() {
    let mut unit = unit_with_file();
    let mut params = PCodeBuilder::new();
    params.push_declaration(Type::Float, "fDelay", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    params.push_declaration(Type::Action, "aAction", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    let params = unit.append_pcode(&params);
    let delay = unit.add_engine_function("DelayCommand", Type::Void, 7, params).unwrap();
    let nothing = unit
        .add_engine_function("DoNothing", Type::Void, 5, PCodeSlice::EMPTY)
        .unwrap();

    // DelayCommand(0.5, DoNothing());
    let mut deferred = PCodeBuilder::new();
    deferred.push_call(Type::Void, nothing, 0, &PCodeBuilder::new());
    let mut first = PCodeBuilder::new();
    first.push_constant_float(0.5);
    let mut args = PCodeBuilder::new();
    args.push_argument(Type::Float, &first);
    args.push_argument(Type::Action, &deferred);
    let mut expr = PCodeBuilder::new();
    expr.push_call(Type::Void, delay, 2, &args);
    expr.push_expression_end(Type::Void);
    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(0, &expr));

    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    verify_jumps(&instrs).unwrap();

    let main_ops: Vec<&nwsc_ncs::Instr> = instrs.iter().map(|(_, i)| i).collect();
    // Deferred argument first (right-to-left): capture, skip, body,
    // return; then the float and the outer ACTION.
    let seq: Vec<Op> = main_ops.iter().map(|i| i.op).collect();
    let store_at = seq.iter().position(|&op| op == Op::StoreState).unwrap();
    assert_eq!(seq[store_at + 1], Op::Jmp);
    assert_eq!(seq[store_at + 2], Op::Action); // DoNothing inside the capture
    assert_eq!(seq[store_at + 3], Op::Retn);
    assert!(main_ops.iter().any(|i| i.op == Op::Action
        && i.payload == Payload::Action { action: 7, argc: 2 }));
    assert!(main_ops.iter().any(|i| i.op == Op::StoreState
        && i.payload == Payload::StoreState { bp: 0, sp: 0 }));
}

#[test]
fn missing_arguments_fall_back_to_defaults() {
    let mut unit = unit_with_file();
    let mut params = PCodeBuilder::new();
    params.push_declaration(Type::Integer, "a", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    let mut five = PCodeBuilder::new();
    five.push_constant_int(5);
    params.push_declaration(Type::Integer, "b", 0, 1, SymbolFlags::empty(), &five);
    let params = unit.append_pcode(&params);

    let g = define_fn(&mut unit, "g", Type::Void, params, &PCodeBuilder::new());

    // g(9);
    let mut supplied = PCodeBuilder::new();
    supplied.push_constant_int(9);
    let mut args = PCodeBuilder::new();
    args.push_argument(Type::Integer, &supplied);
    let mut expr = PCodeBuilder::new();
    expr.push_call(Type::Void, g, 1, &args);
    expr.push_expression_end(Type::Void);
    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(0, &expr));

    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    let consts: Vec<i32> = instrs
        .iter()
        .filter_map(|(_, i)| match i.payload {
            Payload::ConstInt(v) if i.op == Op::Const => Some(v),
            _ => None,
        })
        .collect();
    // Right-to-left: the default for `b` goes first.
    assert_eq!(consts, vec![5, 9]);
}

#[test]
fn read_bp_intrinsic_sequence() {
    let mut unit = unit_with_file();
    let readbp = unit
        .add_intrinsic("__readbp", Type::Integer, Intrinsic::ReadBp, PCodeSlice::EMPTY)
        .unwrap();

    let mut expr = PCodeBuilder::new();
    expr.push_call(Type::Integer, readbp, 0, &PCodeBuilder::new());
    expr.push_expression_end(Type::Integer);
    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(0, &expr));

    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    let ops = kinds(&instrs);
    let start = ops.iter().position(|&op| op == Op::SaveBp).unwrap();
    assert_eq!(
        &ops[start - 1..start + 3],
        &[Op::RsAdd, Op::SaveBp, Op::CpDownSp, Op::RestoreBp]
    );
}

#[test]
fn compound_assignment_to_global_uses_base_pointer() {
    let mut unit = unit_with_file();
    let mut init = PCodeBuilder::new();
    init.push_constant_int(0);
    let init = unit.append_pcode(&init);
    let g = unit.add_global_variable("g", Type::Integer, init, 0, 1, SymbolFlags::empty());

    let mut rhs = PCodeBuilder::new();
    rhs.push_constant_int(2);
    let mut expr = PCodeBuilder::new();
    expr.push_assignment(
        AssignOp::Add,
        Type::Integer,
        Type::Integer,
        Type::Integer,
        g,
        -1,
        0,
        SymbolFlags::GLOBAL,
        &rhs,
    );
    expr.push_expression_end(Type::Integer);
    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(0, &expr));

    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    let ops = kinds(&instrs);
    let read = ops.iter().position(|&op| op == Op::CpTopBp).unwrap();
    let write = ops.iter().rposition(|&op| op == Op::CpDownBp).unwrap();
    assert!(read < write);
    assert!(ops[read..write].contains(&Op::Add));
}

#[test]
fn ternary_keeps_one_value_on_stack() {
    let mut unit = unit_with_file();

    let mut body = PCodeBuilder::new();
    let mut zero = PCodeBuilder::new();
    zero.push_constant_int(0);
    body.push_declaration(Type::Integer, "x", 0, 2, SymbolFlags::empty(), &zero);

    let mut cond = PCodeBuilder::new();
    read_local_int(&mut cond, 0);
    let mut t = PCodeBuilder::new();
    t.push_constant_int(1);
    let mut f = PCodeBuilder::new();
    f.push_constant_int(2);
    let mut expr = PCodeBuilder::new();
    expr.push_block5(
        BlockOp::Conditional,
        Type::Integer,
        [
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::new(cond.bytes(), 0, 3),
            BlockSlotSrc::EMPTY,
            BlockSlotSrc::new(t.bytes(), 0, 3),
            BlockSlotSrc::new(f.bytes(), 0, 3),
        ],
    );
    expr.push_expression_end(Type::Integer);
    body.push_statement(0, &expr);

    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(1, &body));

    let compiled = compile(&mut unit);
    let instrs = ops_of(&compiled.ncs);
    verify_jumps(&instrs).unwrap();
    let consts: Vec<i32> = instrs
        .iter()
        .filter_map(|(_, i)| match i.payload {
            Payload::ConstInt(v) => Some(v),
            _ => None,
        })
        .collect();
    assert!(consts.contains(&1) && consts.contains(&2));
    assert!(kinds(&instrs).contains(&Op::Jz));
}

#[test]
fn debugger_nop_lands_before_else_on_new_targets() {
    fn if_else_unit() -> nwsc_pcode::Unit {
        let mut unit = unit_with_file();
        let mut body = PCodeBuilder::new();
        let mut zero = PCodeBuilder::new();
        zero.push_constant_int(0);
        body.push_declaration(Type::Integer, "x", 0, 2, SymbolFlags::empty(), &zero);

        let mut cond = PCodeBuilder::new();
        read_local_int(&mut cond, 0);
        let mut then_expr = PCodeBuilder::new();
        let mut rhs = PCodeBuilder::new();
        rhs.push_constant_int(1);
        then_expr.push_assignment(
            AssignOp::Assign,
            Type::Integer,
            Type::Integer,
            Type::Integer,
            LOCAL,
            -1,
            0,
            SymbolFlags::empty(),
            &rhs,
        );
        then_expr.push_expression_end(Type::Integer);
        let then_block = stmt(0, &then_expr);
        let mut else_expr = PCodeBuilder::new();
        let mut rhs = PCodeBuilder::new();
        rhs.push_constant_int(2);
        else_expr.push_assignment(
            AssignOp::Assign,
            Type::Integer,
            Type::Integer,
            Type::Integer,
            LOCAL,
            -1,
            0,
            SymbolFlags::empty(),
            &rhs,
        );
        else_expr.push_expression_end(Type::Integer);
        let else_block = stmt(0, &else_expr);

        body.push_block5(
            BlockOp::If,
            Type::Void,
            [
                BlockSlotSrc::EMPTY,
                BlockSlotSrc::new(cond.bytes(), 0, 4),
                BlockSlotSrc::EMPTY,
                BlockSlotSrc::new(then_block.bytes(), 0, 4),
                BlockSlotSrc::new(else_block.bytes(), 0, 5),
            ],
        );
        define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &stmt(1, &body));
        unit
    }

    let mut unit = if_else_unit();
    let compiled = compile(&mut unit);
    assert!(kinds(&ops_of(&compiled.ncs)).contains(&Op::Nop));

    let mut unit = if_else_unit();
    let compiled = compile_with(
        &mut unit,
        CodeGenOptions { version: 125, ..CodeGenOptions::default() },
    );
    assert!(!kinds(&ops_of(&compiled.ncs)).contains(&Op::Nop));
}

#[test]
fn global_scope_calls_and_captures_warn() {
    let mut unit = unit_with_file();

    // An engine routine that captures a deferred statement.
    let mut params = PCodeBuilder::new();
    params.push_declaration(Type::Action, "aAction", 0, 1, SymbolFlags::empty(), &PCodeBuilder::new());
    let params = unit.append_pcode(&params);
    let capture = unit
        .add_engine_function("ActionToken", Type::Integer, 11, params)
        .unwrap();
    let nothing = unit
        .add_engine_function("DoNothing", Type::Void, 5, PCodeSlice::EMPTY)
        .unwrap();

    // int g = ActionToken(DoNothing());
    let mut deferred = PCodeBuilder::new();
    deferred.push_call(Type::Void, nothing, 0, &PCodeBuilder::new());
    let mut args = PCodeBuilder::new();
    args.push_argument(Type::Action, &deferred);
    let mut init = PCodeBuilder::new();
    init.push_call(Type::Integer, capture, 1, &args);
    let init = unit.append_pcode(&init);
    unit.add_global_variable("g", Type::Integer, init, 0, 1, SymbolFlags::empty());

    define_fn(&mut unit, "main", Type::Void, PCodeSlice::EMPTY, &PCodeBuilder::new());

    let compiled = compile(&mut unit);
    assert!(compiled
        .diagnostics
        .iter()
        .any(|d| d.message.contains("global scope")));
}
