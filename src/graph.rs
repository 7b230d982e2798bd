//! Instruction dependency graph.
//!
//! After analysis completes, the bytecode is walked once more, joining each
//! opcode's inputs to the opcodes that produced them through the analyzer's
//! source information. The graph then decides, per instruction, whether it
//! can execute on unboxed machine values, and paints every edge with the
//! box/unbox transition the driver must emit along it.

use std::collections::BTreeMap;

use crate::bytecode::Opcode;
use crate::interp::AbstractInterpreter;
use crate::sources::{Producer, SourceId};
use crate::values::{supports_escaping, AbstractValueKind};

/// How a value crosses an edge between producer and consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeTransition {
    /// Boxed producer, boxed consumer: nothing to do.
    NoEscape,
    /// Boxed producer, unboxed consumer: unbox before use.
    Unbox,
    /// Unboxed producer, unboxed consumer: stays in a register.
    Unboxed,
    /// Unboxed producer, boxed consumer: box after production.
    Box,
}

/// A producer→consumer stack edge.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub from: Producer,
    pub to: usize,
    /// Position within the consumer's popped group, 0 = deepest.
    pub position: usize,
    pub kind: AbstractValueKind,
    pub source: SourceId,
    pub transition: EdgeTransition,
}

/// One decoded instruction plus its escape decision.
#[derive(Debug, Clone, Copy)]
pub struct Instruction {
    pub index: usize,
    pub opcode: Opcode,
    pub oparg: u32,
    /// Whether this instruction executes on unboxed machine values.
    pub escape: bool,
}

/// The per-function dependency graph.
pub struct InstructionGraph {
    instructions: BTreeMap<usize, Instruction>,
    edges: Vec<Edge>,
}

impl InstructionGraph {
    /// Build the graph from a completed analysis.
    pub fn new(interp: &AbstractInterpreter<'_>) -> Self {
        let mut instructions = BTreeMap::new();
        let mut edges: Vec<Edge> = Vec::new();
        let arena = interp.arena();
        for decoded in interp.instructions() {
            let pc = decoded.index;
            if let Some(stack) = interp.get_stack_info(pc) {
                for slot in stack {
                    let Some(source) = slot.source else { continue };
                    let Some(position) = arena.consumed_at(source, pc) else {
                        continue;
                    };
                    // A duplicated source can sit at two slots; one edge
                    // per consumed position.
                    if edges
                        .iter()
                        .any(|e| e.to == pc && e.position == position)
                    {
                        continue;
                    }
                    edges.push(Edge {
                        from: arena.producer(source),
                        to: pc,
                        position,
                        kind: slot.kind,
                        source,
                        transition: EdgeTransition::NoEscape,
                    });
                }
            }
            instructions.insert(
                pc,
                Instruction {
                    index: pc,
                    opcode: decoded.opcode,
                    oparg: decoded.oparg,
                    escape: false,
                },
            );
        }
        let mut graph = Self {
            instructions,
            edges,
        };
        graph.fix_instructions();
        graph.deoptimize_instructions();
        graph.fix_locals();
        graph.fix_edges();
        graph
    }

    /// Inbound edges of `pc`, ordered by ascending position.
    pub fn edges_to(&self, pc: usize) -> Vec<Edge> {
        let mut result: Vec<Edge> = self.edges.iter().filter(|e| e.to == pc).copied().collect();
        result.sort_by_key(|e| e.position);
        result
    }

    /// Outbound edges of `pc`, ordered by ascending position at the
    /// consumer.
    pub fn edges_from(&self, pc: usize) -> Vec<Edge> {
        let mut result: Vec<Edge> = self
            .edges
            .iter()
            .filter(|e| e.from == Producer::Op(pc))
            .copied()
            .collect();
        result.sort_by_key(|e| e.position);
        result
    }

    pub fn instruction(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(&pc)
    }

    /// Whether the instruction at `pc` runs on unboxed values.
    pub fn is_escaped(&self, pc: usize) -> bool {
        self.instructions.get(&pc).map(|i| i.escape).unwrap_or(false)
    }

    /// Locals elected for unboxed storage. The decision is deferred, so
    /// the map is empty for now; the driver treats every local as boxed.
    pub fn unboxed_locals(&self) -> BTreeMap<u32, AbstractValueKind> {
        BTreeMap::new()
    }

    /// First pass: mark every whitelisted instruction whose inbound and
    /// outbound edge kinds all support escaping.
    fn fix_instructions(&mut self) {
        let indices: Vec<usize> = self.instructions.keys().copied().collect();
        for pc in indices {
            let instruction = self.instructions[&pc];
            if !instruction.opcode.supports_unboxing() {
                continue;
            }
            // LOAD_FAST/STORE_FAST are decided in fix_locals.
            if matches!(instruction.opcode, Opcode::LoadFast | Opcode::StoreFast) {
                continue;
            }
            let inbound_ok = self
                .edges_to(pc)
                .iter()
                .all(|e| supports_escaping(e.kind));
            if !inbound_ok {
                continue;
            }
            let outbound_ok = self
                .edges_from(pc)
                .iter()
                .all(|e| supports_escaping(e.kind));
            if !outbound_ok {
                continue;
            }
            self.instructions.get_mut(&pc).unwrap().escape = true;
        }
    }

    /// Refinement pass: revert escape decisions that are malformed or
    /// bring no benefit. Single pass; it only ever shrinks the escape set.
    fn deoptimize_instructions(&mut self) {
        let indices: Vec<usize> = self.instructions.keys().copied().collect();
        for pc in indices {
            let instruction = self.instructions[&pc];
            if !instruction.escape {
                continue;
            }
            let edges_in = self.edges_to(pc);
            let edges_out = self.edges_from(pc);

            let reported = instruction.opcode.stack_effect(instruction.oparg);
            if reported != edges_out.len() as i32 - edges_in.len() as i32 {
                self.instructions.get_mut(&pc).unwrap().escape = false;
                continue;
            }

            // A lone producer feeding a boxed consumer gains nothing from
            // pushing an unboxed value that must immediately be boxed.
            if edges_in.is_empty() && edges_out.len() == 1 {
                let consumer_escaped = self
                    .instructions
                    .get(&edges_out[0].to)
                    .map(|i| i.escape)
                    .unwrap_or(false);
                if !consumer_escaped {
                    self.instructions.get_mut(&pc).unwrap().escape = false;
                    continue;
                }
            }

            // Symmetric case: a lone consumer fed by a boxed producer.
            if edges_in.len() == 1 && edges_out.is_empty() {
                let producer_escaped = match edges_in[0].from {
                    Producer::Op(from) => self
                        .instructions
                        .get(&from)
                        .map(|i| i.escape)
                        .unwrap_or(false),
                    Producer::Frame => false,
                };
                if !producer_escaped {
                    self.instructions.get_mut(&pc).unwrap().escape = false;
                    continue;
                }
            }
        }
    }

    /// Decide which locals can live unboxed. Deferred: every LOAD_FAST and
    /// STORE_FAST stays boxed until the frame representation carries typed
    /// slots.
    fn fix_locals(&mut self) {}

    /// Paint each edge with its transition from the producer/consumer
    /// escape pair.
    fn fix_edges(&mut self) {
        let escapes: BTreeMap<usize, bool> = self
            .instructions
            .iter()
            .map(|(&pc, i)| (pc, i.escape))
            .collect();
        for edge in &mut self.edges {
            let from_escaped = match edge.from {
                Producer::Op(pc) => escapes.get(&pc).copied().unwrap_or(false),
                Producer::Frame => false,
            };
            let to_escaped = escapes.get(&edge.to).copied().unwrap_or(false);
            edge.transition = match (from_escaped, to_escaped) {
                (false, false) => EdgeTransition::NoEscape,
                (false, true) => EdgeTransition::Unbox,
                (true, true) => EdgeTransition::Unboxed,
                (true, false) => EdgeTransition::Box,
            };
        }
    }

    /// All edges, unordered. Mostly for tests and dumps.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.values()
    }

    /// Render the graph in graphviz dot form.
    #[cfg(feature = "graph-dump")]
    pub fn to_dot(&self, name: &str, interp: &AbstractInterpreter<'_>) -> String {
        use std::fmt::Write;
        let arena = interp.arena();
        let mut out = String::new();
        let _ = writeln!(out, "digraph {} {{", name);
        let _ = writeln!(out, "\tnode [shape=box];");
        let _ = writeln!(out, "\tFRAME [label=FRAME];");
        for (pc, instruction) in &self.instructions {
            let color = if instruction.escape { " color=blue" } else { "" };
            let _ = writeln!(
                out,
                "\tOP{} [label=\"{} ({})\"{}];",
                pc,
                instruction.opcode.name(),
                instruction.oparg,
                color
            );
        }
        for edge in &self.edges {
            let (mark, color) = match edge.transition {
                EdgeTransition::NoEscape => ("-", "black"),
                EdgeTransition::Unbox => ("U", "red"),
                EdgeTransition::Box => ("B", "green"),
                EdgeTransition::Unboxed => ("UN", "purple"),
            };
            let from = match edge.from {
                Producer::Frame => "FRAME".to_string(),
                Producer::Op(pc) => format!("OP{}", pc),
            };
            let _ = writeln!(
                out,
                "\t{} -> OP{} [label=\"{} ({}) {}{}\" color={}];",
                from,
                edge.to,
                arena.describe(edge.source),
                edge.kind.describe(),
                mark,
                edge.position,
                color
            );
        }
        let _ = writeln!(out, "}}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{assemble, CodeObject, Const};
    use crate::interp::AbstractInterpreter;

    fn graph_for(instrs: &[(Opcode, u32)], consts: Vec<Const>) -> InstructionGraph {
        let code = CodeObject::new("test", assemble(instrs), consts, vec![], 0);
        let mut interp = AbstractInterpreter::new(&code).unwrap();
        interp.interpret().unwrap();
        InstructionGraph::new(&interp)
    }

    #[test]
    fn test_edges_join_producers_to_consumers() {
        let graph = graph_for(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(1), Const::Int(2)],
        );
        let into_add = graph.edges_to(4);
        assert_eq!(into_add.len(), 2);
        assert_eq!(into_add[0].position, 0);
        assert_eq!(into_add[0].from, Producer::Op(0));
        assert_eq!(into_add[1].position, 1);
        assert_eq!(into_add[1].from, Producer::Op(2));
        let into_ret = graph.edges_to(6);
        assert_eq!(into_ret.len(), 1);
        assert_eq!(into_ret[0].from, Producer::Op(4));
    }

    #[test]
    fn test_int_add_escapes() {
        let graph = graph_for(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(1), Const::Int(2)],
        );
        assert!(graph.is_escaped(0));
        assert!(graph.is_escaped(2));
        assert!(graph.is_escaped(4));
        // RETURN_VALUE is not whitelisted
        assert!(!graph.is_escaped(6));
        // the add's outbound edge must box for RETURN_VALUE
        let out = graph.edges_from(4);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].transition, EdgeTransition::Box);
        // const -> add edges stay in registers
        assert_eq!(graph.edges_from(0)[0].transition, EdgeTransition::Unboxed);
    }

    #[test]
    fn test_string_concat_stays_boxed() {
        let graph = graph_for(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Str("a".into()), Const::Str("b".into())],
        );
        assert!(!graph.is_escaped(4));
        assert!(!graph.is_escaped(0));
        assert_eq!(graph.edges_to(4)[0].transition, EdgeTransition::NoEscape);
    }

    #[test]
    fn test_lone_const_feeding_boxed_consumer_deoptimizes() {
        // LOAD_CONST -> RETURN_VALUE: escaping the load would produce an
        // unboxed value only to box it again.
        let graph = graph_for(
            &[(Opcode::LoadConst, 0), (Opcode::ReturnValue, 0)],
            vec![Const::Int(7)],
        );
        assert!(!graph.is_escaped(0));
        assert_eq!(graph.edges_to(2)[0].transition, EdgeTransition::NoEscape);
    }

    #[test]
    fn test_escaped_instruction_edges_are_whitelisted_kinds() {
        let graph = graph_for(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::BinaryMultiply, 0),
                (Opcode::LoadConst, 2),
                (Opcode::BinaryAdd, 0),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Float(1.5), Const::Float(2.0), Const::Float(3.0)],
        );
        for instruction in graph.instructions() {
            if !instruction.escape {
                continue;
            }
            for edge in graph
                .edges_to(instruction.index)
                .iter()
                .chain(graph.edges_from(instruction.index).iter())
            {
                assert!(supports_escaping(edge.kind), "edge {:?}", edge);
            }
        }
        // the chain multiply -> add stays unboxed throughout
        assert_eq!(graph.edges_from(4)[0].transition, EdgeTransition::Unboxed);
    }

    #[test]
    fn test_edge_positions_contiguous() {
        let graph = graph_for(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::LoadConst, 2),
                (Opcode::BuildList, 3),
                (Opcode::ReturnValue, 0),
            ],
            vec![Const::Int(1), Const::Int(2), Const::Int(3)],
        );
        for instruction in graph.instructions() {
            let inbound = graph.edges_to(instruction.index);
            for (expected, edge) in inbound.iter().enumerate() {
                assert_eq!(edge.position, expected);
            }
        }
        assert_eq!(graph.edges_to(6).len(), 3);
    }

    #[test]
    fn test_compare_and_jump_escape_together() {
        // 0: LOAD_CONST 0 (int)
        // 2: LOAD_CONST 1 (int)
        // 4: COMPARE_OP <
        // 6: POP_JUMP_IF_FALSE 12
        // 8: LOAD_CONST 2
        // 10: RETURN_VALUE
        // 12: LOAD_CONST 3
        // 14: RETURN_VALUE
        let graph = graph_for(
            &[
                (Opcode::LoadConst, 0),
                (Opcode::LoadConst, 1),
                (Opcode::CompareOp, 0),
                (Opcode::PopJumpIfFalse, 12),
                (Opcode::LoadConst, 2),
                (Opcode::ReturnValue, 0),
                (Opcode::LoadConst, 3),
                (Opcode::ReturnValue, 0),
            ],
            vec![
                Const::Int(1),
                Const::Int(2),
                Const::Int(10),
                Const::Int(20),
            ],
        );
        assert!(graph.is_escaped(4));
        assert!(graph.is_escaped(6));
        assert_eq!(graph.edges_to(6)[0].transition, EdgeTransition::Unboxed);
    }
}
