//! Saturate propagation.
//!
//! A saturating move is often the only consumer of an ALU result; folding
//! the saturate onto the producer deletes nothing by itself but turns the
//! move into a pure copy that later passes can propagate and eliminate.
//!
//! Backward per-block scan: for each `MOV.sat` reading a VGRF, find the
//! producing instruction. If the producer already saturates, the move's
//! flag is redundant and cleared. Otherwise the flag moves onto the
//! producer, provided the producer can take a saturating destination, the
//! value dies at the move, and no instruction in between observes the
//! unsaturated value in an incompatible way.

use crate::ir::{Instruction, Opcode, Operand, Pred, RegFile, regions_overlap};
use crate::shader::{Shader, dep};

/// Opcodes that accept a saturating destination.
fn can_saturate(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Mov
            | Opcode::Add
            | Opcode::Avg
            | Opcode::Mul
            | Opcode::Mad
            | Opcode::Lrp
            | Opcode::Frc
            | Opcode::Rndd
            | Opcode::Rnde
            | Opcode::Sel
            | Opcode::Csel
    )
}

/// Absorb the move's negation into the producer's sources. Returns false
/// when the producer cannot express the sign flip.
fn absorb_negation(producer: &mut Instruction) -> bool {
    match producer.opcode {
        Opcode::Mul => {
            producer.src[0] = producer.src[0].negated();
            true
        }
        // dst = src1 * src2 + src0
        Opcode::Mad => {
            producer.src[0] = producer.src[0].negated();
            producer.src[1] = producer.src[1].negated();
            true
        }
        Opcode::Add => {
            producer.src[0] = producer.src[0].negated();
            producer.src[1] = producer.src[1].negated();
            true
        }
        _ => false,
    }
}

/// A compatible intervening reader: another saturating move of the same
/// region with the same modifiers. Anything else observing the value makes
/// the fold visible.
fn read_is_compatible(reader: &Instruction, mov: &Instruction) -> bool {
    reader.opcode == Opcode::Mov
        && reader.saturate == mov.saturate
        && reader.src[0] == mov.src[0]
}

pub fn run(shader: &mut Shader) -> bool {
    let live = shader.live();
    let mut progress = false;

    for block in &mut shader.cfg.blocks {
        for i in (0..block.insts.len()).rev() {
            let mov = &block.insts[i];
            if mov.opcode != Opcode::Mov
                || !mov.saturate
                || mov.predicate != Pred::None
                || mov.src[0].file != RegFile::Vgrf
                || mov.src[0].abs
            {
                continue;
            }
            let mov_ip = (block.start_ip + i) as i32;
            let src = mov.src[0];
            let read_size = mov.size_read(0);
            let negated = src.negate;

            for j in (0..i).rev() {
                let scan = &block.insts[j];

                let writes_src = scan.dst.file == RegFile::Vgrf
                    && regions_overlap(&scan.dst, scan.size_written, &src, read_size);
                if writes_src {
                    // The producer must hand over exactly the bytes the move
                    // reads, in one full write.
                    let exact = scan.dst.nr == src.nr
                        && scan.dst.offset == src.offset
                        && scan.dst.stride == src.stride
                        && scan.size_written == read_size
                        && scan.dst.ty == src.ty;
                    if !exact || scan.is_partial_write() {
                        break;
                    }
                    if scan.saturate {
                        // Already clamped; the move's flag is redundant,
                        // unless the move also negates.
                        if !negated {
                            block.insts[i].saturate = false;
                            progress = true;
                        }
                        break;
                    }
                    if !can_saturate(scan.opcode) {
                        break;
                    }
                    // Nothing may observe the unsaturated value after the
                    // move; aliasing through dst == src is the one exception
                    // (the move overwrites it in place).
                    let src_dies_here = live
                        .var_range(&src, read_size)
                        .all(|var| live.end[var] <= mov_ip);
                    let aliases = {
                        let mov = &block.insts[i];
                        mov.dst == src
                    };
                    if !src_dies_here && !aliases {
                        break;
                    }

                    let producer = &mut block.insts[j];
                    if negated && !absorb_negation(producer) {
                        break;
                    }
                    producer.saturate = true;
                    let mov = &mut block.insts[i];
                    mov.saturate = false;
                    mov.src[0].negate = false;
                    progress = true;
                    break;
                }

                let reads_src = (0..scan.sources()).any(|s| {
                    scan.src[s].file == RegFile::Vgrf
                        && regions_overlap(&scan.src[s], scan.size_read(s), &src, read_size)
                });
                if reads_src && !read_is_compatible(scan, &block.insts[i]) {
                    break;
                }
            }
        }
    }

    if progress {
        shader.invalidate_analysis(dep::DATA_FLOW);
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devinfo::DevInfo;
    use crate::ir::ScalarType;
    use crate::shader::VgrfAlloc;

    fn sat_mov(dst: u32, src: u32) -> Instruction {
        let mut mov = Instruction::mov(
            8,
            Operand::vgrf(dst, ScalarType::F),
            Operand::vgrf(src, ScalarType::F),
        );
        mov.saturate = true;
        mov
    }

    fn compile(vgrf: VgrfAlloc, insts: Vec<Instruction>) -> Shader {
        Shader::new(DevInfo::default(), 8, vgrf, insts)
    }

    #[test]
    fn saturate_folds_into_the_producer() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = vec![
            Instruction::alu2(
                Opcode::Add,
                8,
                Operand::vgrf(t, ScalarType::F),
                Operand::vgrf(a, ScalarType::F),
                Operand::vgrf(b, ScalarType::F),
            ),
            sat_mov(d, t),
        ];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        let insts = &shader.cfg.blocks[0].insts;
        assert!(insts[0].saturate, "ADD should take the saturate");
        assert!(!insts[1].saturate, "MOV should lose it");
    }

    #[test]
    fn redundant_saturate_is_cleared() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let mut producer = Instruction::mov(
            8,
            Operand::vgrf(t, ScalarType::F),
            Operand::vgrf(a, ScalarType::F),
        );
        producer.saturate = true;
        let insts = vec![producer, sat_mov(d, t)];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        let insts = &shader.cfg.blocks[0].insts;
        assert!(insts[0].saturate);
        assert!(!insts[1].saturate, "second saturate was redundant");
    }

    #[test]
    fn intervening_incompatible_read_blocks_the_fold() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let u = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = vec![
            Instruction::alu2(
                Opcode::Add,
                8,
                Operand::vgrf(t, ScalarType::F),
                Operand::vgrf(a, ScalarType::F),
                Operand::vgrf(b, ScalarType::F),
            ),
            // Reads the unsaturated value; folding would change it.
            Instruction::alu2(
                Opcode::Mul,
                8,
                Operand::vgrf(u, ScalarType::F),
                Operand::vgrf(t, ScalarType::F),
                Operand::imm_f(2.0),
            ),
            sat_mov(d, t),
        ];
        let mut shader = compile(vgrf, insts);

        run(&mut shader);
        let insts = &shader.cfg.blocks[0].insts;
        assert!(!insts[0].saturate);
        assert!(insts[2].saturate);
    }

    #[test]
    fn negated_saturating_move_flips_mul_operand() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let mut mov = sat_mov(d, t);
        mov.src[0].negate = true;
        let insts = vec![
            Instruction::alu2(
                Opcode::Mul,
                8,
                Operand::vgrf(t, ScalarType::F),
                Operand::vgrf(a, ScalarType::F),
                Operand::vgrf(b, ScalarType::F),
            ),
            mov,
        ];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        let insts = &shader.cfg.blocks[0].insts;
        assert!(insts[0].saturate);
        assert!(insts[0].src[0].negate, "negation moved into the multiply");
        assert!(!insts[1].saturate);
        assert!(!insts[1].src[0].negate);
    }
}
