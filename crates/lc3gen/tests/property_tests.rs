//! Property-based tests for the register allocator and stack protocol.
//!
//! Uses `proptest` to generate random operation sequences and verify:
//! - no two registers ever claim the same stack slot
//! - after a flush, frame memory matches a plain reference stack
//! - push followed by pop delivers the pushed value
//! - split then join restores the original slot
//! - frame-base deltas pick the immediate or literal-pool form at the imm5 edge

use proptest::prelude::*;

use lc3gen::abi::{FRAME_BASE_CELL, IMM5_BITS, fits_signed};
use lc3gen::codegen::{BinaryOp, CodeGen, StackModel, UnaryOp};
use lc3gen::test_harness::*;
use lc3gen::{Image, Instruction, Reg, Target};

const MAX_DEPTH: usize = 24;

#[derive(Debug, Clone)]
enum StackOp {
    Push(i16),
    Copy(usize),
    Swap(usize, usize),
    Replace(usize),
    Drop,
    Binary(BinaryOp),
    Unary(UnaryOp),
    Flush,
}

fn stack_op_strategy() -> impl Strategy<Value = StackOp> {
    prop_oneof![
        4 => any::<i16>().prop_map(StackOp::Push),
        2 => (-16i16..16).prop_map(StackOp::Push),
        2 => any::<usize>().prop_map(StackOp::Copy),
        2 => (any::<usize>(), any::<usize>()).prop_map(|(a, b)| StackOp::Swap(a, b)),
        1 => any::<usize>().prop_map(StackOp::Replace),
        1 => Just(StackOp::Drop),
        1 => Just(StackOp::Binary(BinaryOp::Add)),
        1 => Just(StackOp::Binary(BinaryOp::Sub)),
        1 => Just(StackOp::Binary(BinaryOp::And)),
        1 => Just(StackOp::Unary(UnaryOp::Not)),
        1 => Just(StackOp::Unary(UnaryOp::Neg)),
        1 => Just(StackOp::Flush),
    ]
}

/// Apply `op` to both the generator and a plain reference stack. Ops that
/// would be invalid at the current depth are skipped.
fn apply(cg: &mut CodeGen, model: &mut Vec<u16>, op: &StackOp) {
    let len = model.len();
    match *op {
        StackOp::Push(value) if len < MAX_DEPTH => {
            cg.push_const(value).unwrap();
            model.push(value as u16);
        }
        StackOp::Copy(i) if len > 0 && len < MAX_DEPTH => {
            let i = i % len;
            cg.copy(i).unwrap();
            model.push(model[i]);
        }
        StackOp::Swap(a, b) if len > 0 => {
            let (a, b) = (a % len, b % len);
            cg.swap(a, b).unwrap();
            model.swap(a, b);
        }
        StackOp::Replace(i) if len > 1 => {
            let i = i % (len - 1);
            cg.replace(i).unwrap();
            let top = model.pop().unwrap();
            model[i] = top;
        }
        StackOp::Drop if len > 0 => {
            cg.discard().unwrap();
            model.pop();
        }
        StackOp::Binary(bin) if len > 1 => {
            cg.binary(bin).unwrap();
            let rhs = model.pop().unwrap();
            let lhs = model.pop().unwrap();
            model.push(match bin {
                BinaryOp::Add => lhs.wrapping_add(rhs),
                BinaryOp::Sub => lhs.wrapping_sub(rhs),
                BinaryOp::And => lhs & rhs,
            });
        }
        StackOp::Unary(un) if len > 0 => {
            cg.unary(un).unwrap();
            let x = model.pop().unwrap();
            model.push(match un {
                UnaryOp::Not => !x,
                UnaryOp::Neg => x.wrapping_neg(),
            });
        }
        StackOp::Flush => cg.flush(None).unwrap(),
        _ => {}
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn binding_invariant_holds(ops in prop::collection::vec(stack_op_strategy(), 0..60)) {
        let mut cg = CodeGen::default();
        let mut model = Vec::new();
        for op in &ops {
            apply(&mut cg, &mut model, op);
            prop_assert!(cg.registers().check_invariants().is_ok(), "after {:?}", op);
            prop_assert_eq!(cg.registers().pinned_count(), 0);
            prop_assert_eq!(cg.stack().len(), model.len());
            for reg in Reg::ALL {
                let slots = cg.registers().stack_slots(reg);
                prop_assert!(slots.iter().all(|s| *s < model.len()));
                prop_assert!(slots.is_empty() || cg.registers().data_cell(reg).is_none());
            }
        }
    }

    #[test]
    fn flushed_memory_matches_reference(ops in prop::collection::vec(stack_op_strategy(), 1..60)) {
        let mut cg = CodeGen::default();
        let mut model = Vec::new();
        for op in &ops {
            apply(&mut cg, &mut model, op);
        }
        cg.flush(None).unwrap();
        prop_assert!(cg.registers().dirty_registers().is_empty());
        cg.halt().unwrap();

        let machine = run_codegen(cg).unwrap();
        for (offset, expected) in model.iter().enumerate() {
            prop_assert_eq!(machine.frame_word(offset as u16), *expected, "slot {}", offset);
        }
    }

    #[test]
    fn push_pop_round_trip(
        prefix in prop::collection::vec(any::<i16>(), 0..12),
        value in any::<i16>(),
        reg_index in 0usize..8,
    ) {
        let reg = Reg::ALL[reg_index];
        let mut cg = CodeGen::default();
        for v in &prefix {
            cg.push_const(*v).unwrap();
        }
        cg.flush(None).unwrap();
        let depth = cg.stack().len();

        cg.push_const(value).unwrap();
        cg.pop(Target::Fixed(reg)).unwrap();
        prop_assert_eq!(cg.stack().len(), depth);
        cg.halt().unwrap();

        let machine = run_codegen(cg).unwrap();
        prop_assert_eq!(machine.reg(reg), value as u16);
    }

    #[test]
    fn swap_then_flush_exchanges_memory(
        values in prop::collection::vec(any::<i16>(), 2..16),
        a in any::<usize>(),
        b in any::<usize>(),
    ) {
        let (a, b) = (a % values.len(), b % values.len());
        let mut cg = CodeGen::default();
        for v in &values {
            cg.push_const(*v).unwrap();
        }
        cg.swap(a, b).unwrap();
        cg.flush(None).unwrap();
        cg.halt().unwrap();

        let mut expected: Vec<u16> = values.iter().map(|v| *v as u16).collect();
        expected.swap(a, b);
        let machine = run_codegen(cg).unwrap();
        for (offset, word) in expected.iter().enumerate() {
            prop_assert_eq!(machine.frame_word(offset as u16), *word);
        }
    }

    #[test]
    fn split_then_join_restores_slot(
        sizes in prop::collection::vec(1usize..6, 1..8),
        pick in any::<usize>(),
        cut in any::<usize>(),
    ) {
        let mut stack = StackModel::new();
        for size in &sizes {
            stack.push(*size);
        }
        let index = pick % sizes.len();
        let original = stack.clone();
        let k = cut % (sizes[index] + 1);

        stack.split(index, k).unwrap();
        prop_assert_eq!(stack.len(), original.len() + 1);
        stack.join(index, 2).unwrap();
        prop_assert_eq!(stack, original);
    }

    #[test]
    fn frame_delta_immediate_boundary(delta in -64i32..64) {
        prop_assume!(delta != 0);
        let mut cg = CodeGen::default();
        cg.adjust_frame_base(delta).unwrap();
        let instrs = cg.instructions().to_vec();

        let imm_adds = instrs
            .iter()
            .filter(|i| matches!(i, Instruction::AddImm { value, .. } if *value == delta))
            .count();
        let reg_adds = count_opcode(&instrs, lc3gen::Opcode::Add) - imm_adds;
        if fits_signed(delta, IMM5_BITS) {
            prop_assert_eq!(imm_adds, 1);
            prop_assert_eq!(reg_adds, 0);
            prop_assert_eq!(cg.data().len(), 2);
        } else {
            prop_assert_eq!(imm_adds, 0);
            prop_assert_eq!(reg_adds, 1);
            prop_assert_eq!(cg.data().words()[2], delta as u16);
        }

        cg.halt().unwrap();
        let code_len = cg.instructions().len();
        let program = cg.finish().unwrap();
        let image: Image = program.assemble(0x3000).unwrap();
        prop_assert_eq!(image.code_len(), code_len);
        let machine = run_image(&image).unwrap();
        prop_assert_eq!(
            machine.mem(image.data_address(FRAME_BASE_CELL)),
            0x4000u16.wrapping_add(delta as u16)
        );
    }
}
