//! Reachability pass: walks the IR from the global initializers and the
//! entry point, collecting the ordered list of functions to emit and
//! settling the `REFERENCED`/`MODIFIED`/`USES_GLOBAL_VARS` flags.
//!
//! The pass keeps an explicit function stack to attribute global-use to
//! the enclosing function; the `REFERENCED` mark set before recursing
//! breaks call cycles, so recursion depth is bounded by the call-graph
//! depth, not the cycle count. Emit order equals discovery order.

use nwsc_pcode::{FunctionFlags, PCode, PCodeReader, PCodeSlice, SymbolFlags, SymbolId, Unit};

use crate::diag::{CodegenError, EmitResult};

/// Pass state and result.
#[derive(Debug, Default)]
pub struct Reachability {
    functions: Vec<SymbolId>,
    stack: Vec<SymbolId>,
}

impl Reachability {
    /// Fresh pass.
    pub fn new() -> Self {
        Self::default()
    }

    /// The ordered emit list.
    pub fn into_functions(self) -> Vec<SymbolId> {
        self.functions
    }

    /// Scan every global initializer. Runs before any entry point is
    /// chosen so cross-global references are marked either way.
    pub fn scan_global_initializers(&mut self, unit: &mut Unit, buf: &[u8]) -> EmitResult<()> {
        let globals: Vec<SymbolId> = unit.globals().to_vec();
        for id in globals {
            let init = unit
                .symbol(id)
                .variable()
                .ok_or_else(|| CodegenError::Internal("global list holds a non-variable".into()))?
                .init;
            self.scan_block(unit, buf, init)?;
        }
        Ok(())
    }

    /// Mark the entry point referenced, queue it first, and walk it.
    pub fn add_entry(&mut self, unit: &mut Unit, buf: &[u8], entry: SymbolId) -> EmitResult<()> {
        unit.symbol_mut(entry).flags |= SymbolFlags::REFERENCED;
        self.functions.push(entry);
        self.scan_function(unit, buf, entry)
    }

    fn scan_function(&mut self, unit: &mut Unit, buf: &[u8], id: SymbolId) -> EmitResult<()> {
        let code = unit
            .symbol(id)
            .function()
            .ok_or_else(|| CodegenError::Internal("call target is not a function".into()))?
            .code;
        self.stack.push(id);
        let result = self.scan_block(unit, buf, code);
        self.stack.pop();
        result
    }

    fn mark_uses_globals(&self, unit: &mut Unit) {
        if let Some(&top) = self.stack.last() {
            if let Some(f) = unit.symbol_mut(top).function_mut() {
                f.flags |= FunctionFlags::USES_GLOBAL_VARS;
            }
        }
    }

    fn scan_block(&mut self, unit: &mut Unit, buf: &[u8], slice: PCodeSlice) -> EmitResult<()> {
        for item in PCodeReader::new(buf, slice) {
            let (_, record) = item?;
            match record {
                // The flags stored on the use site are authoritative:
                // the symbol itself may have been superseded since.
                PCode::Variable { symbol, flags, .. } => {
                    if flags.contains(SymbolFlags::GLOBAL) {
                        let sym = unit.symbol_mut(symbol);
                        sym.flags |= SymbolFlags::REFERENCED;
                        if flags.contains(SymbolFlags::INCREMENTS) {
                            sym.flags |= SymbolFlags::MODIFIED;
                        }
                        self.mark_uses_globals(unit);
                    }
                }
                PCode::Assignment { symbol, flags, rhs, .. } => {
                    if flags.contains(SymbolFlags::GLOBAL) {
                        unit.symbol_mut(symbol).flags |=
                            SymbolFlags::MODIFIED | SymbolFlags::REFERENCED;
                        self.mark_uses_globals(unit);
                    }
                    self.scan_block(unit, buf, rhs)?;
                }
                PCode::Declaration { init, .. } => self.scan_block(unit, buf, init)?,
                PCode::Argument { body, .. }
                | PCode::Statement { body, .. }
                | PCode::Element { body, .. } => self.scan_block(unit, buf, body)?,
                PCode::Return { value, .. } => self.scan_block(unit, buf, value)?,
                PCode::Case { key, .. } => self.scan_block(unit, buf, key)?,
                PCode::LogicalAnd { lhs, rhs } | PCode::LogicalOr { lhs, rhs } => {
                    self.scan_block(unit, buf, lhs)?;
                    self.scan_block(unit, buf, rhs)?;
                }
                PCode::Block5 { slots, .. } => {
                    for slot in &slots {
                        self.scan_block(unit, buf, slot.body)?;
                    }
                }
                PCode::Call { symbol, args, .. } => {
                    self.scan_block(unit, buf, args)?;
                    let flags = unit.symbol(symbol).flags;
                    if !flags.intersects(SymbolFlags::ENGINE_FUNC | SymbolFlags::INTRINSIC)
                        && !flags.contains(SymbolFlags::REFERENCED)
                    {
                        self.functions.push(symbol);
                        unit.symbol_mut(symbol).flags |= SymbolFlags::REFERENCED;
                        self.scan_function(unit, buf, symbol)?;
                        let callee_uses_globals = unit
                            .symbol(symbol)
                            .function()
                            .is_some_and(|f| f.flags.contains(FunctionFlags::USES_GLOBAL_VARS));
                        if callee_uses_globals {
                            self.mark_uses_globals(unit);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nwsc_core::Type;
    use nwsc_pcode::{AssignOp, PCodeBuilder};

    fn void_fn(unit: &mut Unit, name: &str, body: &PCodeBuilder) -> SymbolId {
        let id = unit
            .add_function(name, Type::Void, PCodeSlice::EMPTY, 0, 1, FunctionFlags::empty())
            .unwrap();
        let code = unit.append_pcode(body);
        unit.set_function_code(id, code);
        id
    }

    #[test]
    fn discovery_order_is_emit_order() {
        let mut unit = Unit::new();
        let c = void_fn(&mut unit, "c", &PCodeBuilder::new());
        let mut body_b = PCodeBuilder::new();
        body_b.push_call(Type::Void, c, 0, &PCodeBuilder::new());
        let b = void_fn(&mut unit, "b", &body_b);
        let mut body_a = PCodeBuilder::new();
        body_a.push_call(Type::Void, b, 0, &PCodeBuilder::new());
        body_a.push_call(Type::Void, c, 0, &PCodeBuilder::new());
        let a = void_fn(&mut unit, "a", &body_a);

        let buf = unit.pcode().to_vec();
        let mut pass = Reachability::new();
        pass.add_entry(&mut unit, &buf, a).unwrap();
        assert_eq!(pass.into_functions(), vec![a, b, c]);
    }

    #[test]
    fn recursion_terminates_and_emits_once() {
        let mut unit = Unit::new();
        let f = unit
            .add_function("f", Type::Void, PCodeSlice::EMPTY, 0, 1, FunctionFlags::empty())
            .unwrap();
        let mut body = PCodeBuilder::new();
        body.push_call(Type::Void, f, 0, &PCodeBuilder::new());
        let code = unit.append_pcode(&body);
        unit.set_function_code(f, code);

        let buf = unit.pcode().to_vec();
        let mut pass = Reachability::new();
        pass.add_entry(&mut unit, &buf, f).unwrap();
        assert_eq!(pass.into_functions(), vec![f]);
    }

    #[test]
    fn global_use_propagates_to_callers() {
        let mut unit = Unit::new();
        let g = unit.add_global_variable(
            "g",
            Type::Integer,
            PCodeSlice::EMPTY,
            0,
            1,
            SymbolFlags::empty(),
        );

        let mut rhs = PCodeBuilder::new();
        rhs.push_constant_int(1);
        let mut writer_body = PCodeBuilder::new();
        writer_body.push_assignment(
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
        let writer = void_fn(&mut unit, "writer", &writer_body);

        let mut caller_body = PCodeBuilder::new();
        caller_body.push_call(Type::Void, writer, 0, &PCodeBuilder::new());
        let caller = void_fn(&mut unit, "caller", &caller_body);

        let buf = unit.pcode().to_vec();
        let mut pass = Reachability::new();
        pass.scan_global_initializers(&mut unit, &buf).unwrap();
        pass.add_entry(&mut unit, &buf, caller).unwrap();

        let gflags = unit.symbol(g).flags;
        assert!(gflags.contains(SymbolFlags::REFERENCED | SymbolFlags::MODIFIED));
        for id in [writer, caller] {
            assert!(unit
                .symbol(id)
                .function()
                .unwrap()
                .flags
                .contains(FunctionFlags::USES_GLOBAL_VARS));
        }
    }
}
