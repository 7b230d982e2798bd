//! Analyzer and instruction-graph invariants checked across a corpus of
//! small functions: merge algebra, stack-depth agreement, edge contiguity,
//! escape whitelisting, and determinism.

use pyjit::bytecode::{assemble, CodeObject, Const, Opcode};
use pyjit::graph::InstructionGraph;
use pyjit::interp::AbstractInterpreter;
use pyjit::sources::Producer;
use pyjit::values::{merge_kinds, supports_escaping, AbstractValueKind, ALL_KINDS};

fn corpus() -> Vec<CodeObject> {
    let mut programs = Vec::new();
    // straight-line integer arithmetic
    programs.push(CodeObject::new(
        "arith",
        assemble(&[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::BinaryAdd, 0),
            (Opcode::ReturnValue, 0),
        ]),
        vec![Const::Int(1), Const::Int(2)],
        vec![],
        0,
    ));
    // a diamond merge of unlike kinds
    programs.push(CodeObject::new(
        "diamond",
        assemble(&[
            (Opcode::LoadConst, 0),
            (Opcode::PopJumpIfFalse, 8),
            (Opcode::LoadConst, 1),
            (Opcode::JumpForward, 2),
            (Opcode::LoadConst, 2),
            (Opcode::ReturnValue, 0),
        ]),
        vec![Const::Bool(true), Const::Int(1), Const::Float(2.0)],
        vec![],
        0,
    ));
    // iteration with a back edge
    programs.push(CodeObject::new(
        "loop",
        assemble(&[
            (Opcode::LoadConst, 0),
            (Opcode::GetIter, 0),
            (Opcode::ForIter, 4),
            (Opcode::PopTop, 0),
            (Opcode::JumpAbsolute, 4),
            (Opcode::LoadConst, 1),
            (Opcode::ReturnValue, 0),
        ]),
        vec![
            Const::Tuple(vec![Const::Int(1), Const::Int(2)]),
            Const::None,
        ],
        vec![],
        0,
    ));
    // container building
    programs.push(CodeObject::new(
        "containers",
        assemble(&[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::LoadConst, 2),
            (Opcode::BuildList, 3),
            (Opcode::LoadConst, 0),
            (Opcode::ContainsOp, 0),
            (Opcode::ReturnValue, 0),
        ]),
        vec![Const::Int(1), Const::Int(2), Const::Int(3)],
        vec![],
        0,
    ));
    // unboxable compare chain
    programs.push(CodeObject::new(
        "compare",
        assemble(&[
            (Opcode::LoadConst, 0),
            (Opcode::LoadConst, 1),
            (Opcode::CompareOp, 0),
            (Opcode::PopJumpIfFalse, 12),
            (Opcode::LoadConst, 0),
            (Opcode::ReturnValue, 0),
            (Opcode::LoadConst, 1),
            (Opcode::ReturnValue, 0),
        ]),
        vec![Const::Int(1), Const::Int(2)],
        vec![],
        0,
    ));
    programs
}

fn analyzed(code: &CodeObject) -> AbstractInterpreter<'_> {
    let mut interp = AbstractInterpreter::new(code).unwrap();
    interp.interpret().unwrap();
    interp
}

#[test]
fn test_merge_is_commutative_and_idempotent() {
    for a in ALL_KINDS {
        for b in ALL_KINDS {
            assert_eq!(merge_kinds(a, b), merge_kinds(b, a));
        }
        assert_eq!(merge_kinds(a, a), a);
        assert_eq!(merge_kinds(AbstractValueKind::Undefined, a), a);
    }
}

#[test]
fn test_stack_depth_matches_hand_simulation() {
    // For every reached opcode, the recorded depth plus the opcode's
    // effect must equal the depth at its fall-through successor.
    for code in corpus() {
        let interp = analyzed(&code);
        let instructions = interp.instructions().to_vec();
        for window in instructions.windows(2) {
            let (instr, next) = (window[0], window[1]);
            if instr.jump_target().is_some()
                || matches!(
                    instr.opcode,
                    Opcode::ReturnValue | Opcode::RaiseVarargs | Opcode::BreakLoop
                )
            {
                continue;
            }
            let (Some(before), Some(after)) = (
                interp.get_stack_info(instr.index),
                interp.get_stack_info(next.index),
            ) else {
                continue;
            };
            assert_eq!(
                before.len() as i32 + instr.opcode.stack_effect(instr.oparg),
                after.len() as i32,
                "{}: effect mismatch at {}",
                code.name,
                instr.index
            );
        }
    }
}

#[test]
fn test_edges_are_contiguous_and_bounded() {
    for code in corpus() {
        let interp = analyzed(&code);
        let graph = InstructionGraph::new(&interp);
        for instruction in graph.instructions() {
            let inbound = graph.edges_to(instruction.index);
            for (expected, edge) in inbound.iter().enumerate() {
                assert_eq!(
                    edge.position, expected,
                    "{}: non-contiguous edge positions into {}",
                    code.name, instruction.index
                );
            }
        }
    }
}

#[test]
fn test_escaped_instructions_have_whitelisted_edges() {
    for code in corpus() {
        let interp = analyzed(&code);
        let graph = InstructionGraph::new(&interp);
        for instruction in graph.instructions() {
            if !instruction.escape {
                continue;
            }
            assert!(instruction.opcode.supports_unboxing());
            for edge in graph
                .edges_to(instruction.index)
                .iter()
                .chain(graph.edges_from(instruction.index).iter())
            {
                assert!(
                    supports_escaping(edge.kind),
                    "{}: escaped instruction {} has non-escapable edge {:?}",
                    code.name,
                    instruction.index,
                    edge
                );
            }
        }
    }
}

#[test]
fn test_analysis_is_deterministic() {
    for code in corpus() {
        let first = analyzed(&code);
        let second = analyzed(&code);
        for instr in first.instructions() {
            let kinds_of = |interp: &AbstractInterpreter<'_>| {
                interp
                    .get_stack_info(instr.index)
                    .map(|stack| stack.iter().map(|v| v.kind).collect::<Vec<_>>())
            };
            assert_eq!(
                kinds_of(&first),
                kinds_of(&second),
                "{}: nondeterministic state at {}",
                code.name,
                instr.index
            );
            assert_eq!(
                first.should_box(instr.index),
                second.should_box(instr.index)
            );
        }
        assert_eq!(first.return_info(), second.return_info());
    }
}

#[test]
fn test_every_edge_has_a_live_producer() {
    for code in corpus() {
        let interp = analyzed(&code);
        let graph = InstructionGraph::new(&interp);
        for edge in graph.edges() {
            if let Producer::Op(pc) = edge.from {
                assert!(
                    graph.instruction(pc).is_some(),
                    "{}: edge from unknown producer {}",
                    code.name,
                    pc
                );
            }
            assert!(graph.instruction(edge.to).is_some());
        }
    }
}

#[test]
fn test_compare_chain_escapes_jointly() {
    let code = corpus().remove(4);
    let interp = analyzed(&code);
    let graph = InstructionGraph::new(&interp);
    // COMPARE_OP at 4 and POP_JUMP_IF_FALSE at 6 run unboxed together.
    assert!(graph.is_escaped(4));
    assert!(graph.is_escaped(6));
}
