//! Pre- and post-allocation instruction scheduling.
//!
//! A per-block list scheduler over an explicit dependency DAG. Only the
//! order of provably independent instructions inside one block ever changes:
//! register, flag and accumulator dependencies become edges, side-effecting
//! messages are chained in their original order, and control-flow markers
//! pin the block boundaries.
//!
//! The scheduling modes exist for the allocation driver, which tries them
//! in turn and keeps whichever lets the program color without spilling.

use rustc_hash::FxHashMap;

use crate::ir::{Instruction, Opcode, RegFile, regions_overlap};
use crate::shader::{Shader, dep};

/// Instruction-ordering heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Critical-path-first (latency weighted).
    Pre,
    /// Oldest-ready-first.
    PreNonLifo,
    /// Leave the order untouched.
    None,
    /// Newest-ready-first.
    PreLifo,
    /// After allocation, critical-path-first again.
    Post,
}

/// Rough issue-to-read latency per opcode; only the relative magnitudes
/// matter to the critical-path weights.
fn latency(inst: &Instruction) -> u32 {
    match inst.opcode {
        Opcode::SampleTex => 200,
        Opcode::MemoryLoad | Opcode::MemoryAtomic | Opcode::ScratchRead => 100,
        Opcode::Send => 100,
        Opcode::Mad | Opcode::Lrp | Opcode::Mul | Opcode::Mach => 8,
        Opcode::Pln => 8,
        _ => 4,
    }
}

fn reads_conflict_write(reader: &Instruction, writer: &Instruction) -> bool {
    if writer.dst.file == RegFile::Bad || writer.size_written == 0 {
        return false;
    }
    (0..reader.sources()).any(|s| {
        let size = match reader.src[s].file {
            RegFile::Bad | RegFile::Imm => return false,
            _ => reader.size_read(s),
        };
        regions_overlap(&reader.src[s], size, &writer.dst, writer.size_written)
    })
}

fn writes_conflict(a: &Instruction, b: &Instruction) -> bool {
    a.size_written > 0
        && b.size_written > 0
        && regions_overlap(&a.dst, a.size_written, &b.dst, b.size_written)
}

/// Whether `later` must stay after `earlier`.
fn depends(earlier: &Instruction, later: &Instruction) -> bool {
    // Nothing moves past a thread end.
    if earlier.eot || later.eot {
        return true;
    }
    // RAW, WAR, WAW over register regions.
    if reads_conflict_write(later, earlier)
        || reads_conflict_write(earlier, later)
        || writes_conflict(earlier, later)
    {
        return true;
    }
    // Flag register, byte-granular.
    let fw_e = earlier.flags_written();
    let fr_e = earlier.flags_read();
    let fw_l = later.flags_written();
    let fr_l = later.flags_read();
    if fw_e & (fr_l | fw_l) != 0 || fr_e & fw_l != 0 {
        return true;
    }
    // The accumulator is a single implicit register.
    if (earlier.writes_accumulator_implicitly() || earlier.dst.is_accumulator())
        && (later.writes_accumulator_implicitly()
            || later.dst.is_accumulator()
            || later.src.iter().any(|s| s.is_accumulator()))
    {
        return true;
    }
    // Memory and other side effects keep their program order.
    if earlier.has_side_effects() && later.has_side_effects() {
        return true;
    }
    false
}

struct DepGraph {
    /// For each node, the nodes that must precede it.
    preds: Vec<Vec<usize>>,
    /// For each node, the nodes that wait on it.
    succs: Vec<Vec<usize>>,
    /// Latency-weighted longest path from the node to any leaf.
    delay: Vec<u32>,
}

fn build_graph(insts: &[Instruction]) -> DepGraph {
    let n = insts.len();
    let mut g = DepGraph {
        preds: vec![Vec::new(); n],
        succs: vec![Vec::new(); n],
        delay: vec![0; n],
    };
    for j in 0..n {
        for i in 0..j {
            if depends(&insts[i], &insts[j]) {
                g.preds[j].push(i);
                g.succs[i].push(j);
            }
        }
    }
    for i in (0..n).rev() {
        let tail = g.succs[i].iter().map(|&s| g.delay[s]).max().unwrap_or(0);
        g.delay[i] = latency(&insts[i]) + tail;
    }
    g
}

fn schedule_span(insts: Vec<Instruction>, mode: Mode) -> Vec<Instruction> {
    let n = insts.len();
    if n < 2 {
        return insts;
    }
    let g = build_graph(&insts);

    let mut remaining: FxHashMap<usize, usize> =
        (0..n).map(|i| (i, g.preds[i].len())).collect();
    let mut ready: Vec<usize> = (0..n).filter(|&i| g.preds[i].is_empty()).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(pos) = pick(&ready, &g, mode) {
        let node = ready.swap_remove(pos);
        order.push(node);
        remaining.remove(&node);
        for &succ in &g.succs[node] {
            let count = remaining.get_mut(&succ).expect("successor not yet scheduled");
            *count -= 1;
            if *count == 0 {
                ready.push(succ);
            }
        }
    }
    debug_assert_eq!(order.len(), n, "dependency graph must be acyclic");

    let mut slots: Vec<Option<Instruction>> = insts.into_iter().map(Some).collect();
    order
        .into_iter()
        .map(|i| slots[i].take().expect("each node scheduled once"))
        .collect()
}

fn pick(ready: &[usize], g: &DepGraph, mode: Mode) -> Option<usize> {
    if ready.is_empty() {
        return None;
    }
    let chosen = match mode {
        Mode::Pre | Mode::Post => ready
            .iter()
            .enumerate()
            .max_by_key(|&(_, &node)| (g.delay[node], std::cmp::Reverse(node)))
            .map(|(pos, _)| pos),
        Mode::PreNonLifo => ready
            .iter()
            .enumerate()
            .min_by_key(|&(_, &node)| node)
            .map(|(pos, _)| pos),
        Mode::PreLifo => ready
            .iter()
            .enumerate()
            .max_by_key(|&(_, &node)| node)
            .map(|(pos, _)| pos),
        Mode::None => Some(0),
    };
    chosen
}

pub fn run(shader: &mut Shader, mode: Mode) {
    if mode == Mode::None {
        return;
    }
    for block in &mut shader.cfg.blocks {
        // Control-flow markers sit at the block fringe; only the interior is
        // reorderable.
        let lo = block
            .insts
            .iter()
            .position(|i| !i.is_control_flow())
            .unwrap_or(block.insts.len());
        let hi = block
            .insts
            .iter()
            .rposition(|i| !i.is_control_flow())
            .map_or(lo, |p| p + 1);
        if hi - lo < 2 {
            continue;
        }
        let interior: Vec<Instruction> = block.insts.splice(lo..hi, []).collect();
        let scheduled = schedule_span(interior, mode);
        block.insts.splice(lo..lo, scheduled);
    }
    shader.invalidate_analysis(dep::INSTRUCTIONS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devinfo::DevInfo;
    use crate::ir::{Operand, ScalarType};
    use crate::shader::VgrfAlloc;

    fn vf(nr: u32) -> Operand {
        Operand::vgrf(nr, ScalarType::F)
    }

    fn opcode_multiset(shader: &Shader) -> Vec<Opcode> {
        let mut ops: Vec<Opcode> = shader.cfg.iter_insts().map(|(_, _, i)| i.opcode).collect();
        ops.sort_by_key(|o| format!("{o:?}"));
        ops
    }

    fn sample_program() -> (VgrfAlloc, Vec<Instruction>) {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let c = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = vec![
            Instruction::mov(8, vf(a), Operand::imm_f(1.0)),
            Instruction::mov(8, vf(b), Operand::imm_f(2.0)),
            Instruction::alu2(Opcode::Mul, 8, vf(c), vf(a), vf(a)),
            Instruction::alu2(Opcode::Add, 8, vf(d), vf(c), vf(b)),
        ];
        (vgrf, insts)
    }

    #[test]
    fn scheduling_preserves_the_instruction_multiset() {
        for mode in [Mode::Pre, Mode::PreNonLifo, Mode::PreLifo, Mode::Post] {
            let (vgrf, insts) = sample_program();
            let mut shader = Shader::new(DevInfo::default(), 8, vgrf, insts);
            let before = opcode_multiset(&shader);
            run(&mut shader, mode);
            assert_eq!(before, opcode_multiset(&shader), "{mode:?}");
        }
    }

    #[test]
    fn dependent_instructions_keep_their_order() {
        for mode in [Mode::Pre, Mode::PreNonLifo, Mode::PreLifo] {
            let (vgrf, insts) = sample_program();
            let mut shader = Shader::new(DevInfo::default(), 8, vgrf, insts);
            run(&mut shader, mode);

            let order: Vec<Opcode> = shader.cfg.iter_insts().map(|(_, _, i)| i.opcode).collect();
            let mul = order.iter().position(|&o| o == Opcode::Mul).unwrap();
            let add = order.iter().position(|&o| o == Opcode::Add).unwrap();
            assert!(mul < add, "{mode:?}: ADD consumes MUL's result");
        }
    }

    #[test]
    fn side_effects_never_reorder() {
        let mut vgrf = VgrfAlloc::new();
        let addr = vgrf.alloc(1);
        let data = vgrf.alloc(1);
        let store = |v: u32| {
            Instruction::new(
                Opcode::MemoryStore,
                8,
                Operand::null(),
                &[
                    Operand::vgrf(addr, ScalarType::UD),
                    Operand::imm_ud(v),
                    Operand::imm_ud(1),
                    Operand::vgrf(data, ScalarType::UD),
                    Operand::imm_ud(1),
                ],
            )
        };
        let insts = vec![
            Instruction::mov(8, Operand::vgrf(addr, ScalarType::UD), Operand::imm_ud(0)),
            Instruction::mov(8, Operand::vgrf(data, ScalarType::UD), Operand::imm_ud(7)),
            store(1),
            store(2),
        ];
        let mut shader = Shader::new(DevInfo::default(), 8, vgrf, insts);
        run(&mut shader, Mode::Pre);

        let surfaces: Vec<u64> = shader
            .cfg
            .iter_insts()
            .filter(|(_, _, i)| i.opcode == Opcode::MemoryStore)
            .map(|(_, _, i)| i.src[1].bits)
            .collect();
        assert_eq!(surfaces, vec![1, 2]);
    }

    #[test]
    fn control_flow_markers_stay_on_the_fringe() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let mut if_inst = Instruction::new(Opcode::If, 8, Operand::null(), &[]);
        if_inst.predicate = crate::ir::Pred::Normal;
        let insts = vec![
            Instruction::mov(8, vf(a), Operand::imm_f(1.0)),
            Instruction::mov(8, vf(b), Operand::imm_f(2.0)),
            if_inst,
            Instruction::mov(8, vf(a), vf(b)),
            Instruction::new(Opcode::Endif, 8, Operand::null(), &[]),
        ];
        let mut shader = Shader::new(DevInfo::default(), 8, vgrf, insts);
        run(&mut shader, Mode::Pre);

        let head_block = &shader.cfg.blocks[0];
        assert_eq!(head_block.insts.last().unwrap().opcode, Opcode::If);
    }
}
