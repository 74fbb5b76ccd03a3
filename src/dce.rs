//! Dead code elimination.
//!
//! A backward walk over each block, seeded with the block's live-out
//! variables and live-out flag bytes. An instruction whose result is
//! provably unread is either removed outright or, when it must stay for its
//! flag write or side effect, has its destination redirected to the null
//! register so it stops occupying a VGRF.
//!
//! Control-flow instructions and side-effecting sends are never touched, no
//! matter how dead they look.

use crate::bitset::BitSet;
use crate::ir::{Operand, Pred, RegFile};
use crate::shader::{Shader, dep};

pub fn run(shader: &mut Shader) -> bool {
    let live = shader.live();
    let mut progress = false;

    for block in &mut shader.cfg.blocks {
        let bd = &live.block_data[block.id.index()];
        let mut live_vars: BitSet = bd.liveout.clone();
        let mut flag_live: u8 = bd.flag_liveout;

        for inst in block.insts.iter_mut().rev() {
            if inst.opcode == crate::ir::Opcode::Nop {
                continue;
            }

            let result_live = match inst.dst.file {
                RegFile::Vgrf => live.var_range(&inst.dst, inst.size_written.max(1))
                    .any(|var| live_vars.contains(var)),
                RegFile::Arch(crate::ir::ArchReg::Null) => false,
                // Writes to fixed or architectural registers are observable
                // by the emitted code; treat them as live.
                _ => true,
            };
            let flags_dead = inst.flags_written() & flag_live == 0;

            if !result_live && flags_dead {
                if inst.can_eliminate() && !inst.writes_accumulator_implicitly() {
                    inst.remove();
                    progress = true;
                    continue;
                }
                if inst.dst.file == RegFile::Vgrf && inst.can_discard_destination() {
                    inst.dst = Operand::null_typed(inst.dst.ty);
                    inst.size_written = inst.dst.component_size(inst.exec_size);
                    progress = true;
                }
            }

            // Going backward: a complete definition kills liveness above it,
            // then every source read revives its variables.
            if inst.dst.file == RegFile::Vgrf && !inst.is_partial_write() {
                for var in live.var_range(&inst.dst, inst.size_written) {
                    live_vars.remove(var);
                }
            }
            if inst.predicate == Pred::None {
                flag_live &= !inst.flags_written();
            }

            for s in 0..inst.sources() {
                if inst.src[s].file == RegFile::Vgrf {
                    let size = inst.size_read(s);
                    if size > 0 {
                        for var in live.var_range(&inst.src[s], size) {
                            live_vars.insert(var);
                        }
                    }
                }
            }
            flag_live |= inst.flags_read();
        }
    }

    if progress {
        shader.cfg.compact();
        shader.invalidate_analysis(dep::INSTRUCTIONS | dep::DATA_FLOW);
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devinfo::DevInfo;
    use crate::ir::{CondMod, Instruction, Opcode, ScalarType};
    use crate::shader::VgrfAlloc;

    fn compile(vgrf: VgrfAlloc, insts: Vec<Instruction>) -> Shader {
        Shader::new(DevInfo::default(), 8, vgrf, insts)
    }

    /// A side-effecting consumer that keeps `src` alive.
    fn fb_write(src: Operand) -> Instruction {
        Instruction::new(
            Opcode::FbWrite,
            8,
            Operand::null(),
            &[src, Operand::null(), Operand::imm_ud(1)],
        )
    }

    #[test]
    fn unread_mov_is_removed_entirely() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let insts = vec![
            Instruction::mov(8, Operand::vgrf(a, ScalarType::F), Operand::imm_f(1.0)),
            Instruction::mov(8, Operand::vgrf(b, ScalarType::F), Operand::vgrf(a, ScalarType::F)),
            fb_write(Operand::vgrf(a, ScalarType::F)),
        ];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        // The dead b-write is gone and its nop was swept.
        assert_eq!(shader.cfg.num_insts(), 2);
        assert!(
            shader
                .cfg
                .iter_insts()
                .all(|(_, _, inst)| inst.dst.file != RegFile::Vgrf || inst.dst.nr != b)
        );
    }

    #[test]
    fn side_effecting_sends_survive() {
        let mut vgrf = VgrfAlloc::new();
        let payload = vgrf.alloc(2);
        let dst = vgrf.alloc(1);
        let mut atomic = Instruction::new(
            Opcode::MemoryAtomic,
            8,
            Operand::vgrf(dst, ScalarType::UD),
            &[
                Operand::vgrf(payload, ScalarType::UD),
                Operand::imm_ud(1),
                Operand::imm_ud(1),
            ],
        );
        atomic.mlen = 2;
        let insts = vec![
            Instruction::mov(8, Operand::vgrf(payload, ScalarType::UD), Operand::imm_ud(4)),
            atomic,
        ];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        assert_eq!(shader.cfg.num_insts(), 2);
        // The atomic stays, but its unread return value is discarded.
        let (_, _, atomic) = shader.cfg.iter_insts().nth(1).unwrap();
        assert_eq!(atomic.opcode, Opcode::MemoryAtomic);
        assert!(atomic.dst.is_null());
    }

    #[test]
    fn live_flag_write_blocks_elimination() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let mut cmp = Instruction::alu2(
            Opcode::Cmp,
            8,
            Operand::vgrf(b, ScalarType::F),
            Operand::vgrf(a, ScalarType::F),
            Operand::imm_f(0.0),
        );
        cmp.cmod = CondMod::G;
        let mut sel = Instruction::alu2(
            Opcode::Sel,
            8,
            Operand::vgrf(a, ScalarType::F),
            Operand::vgrf(a, ScalarType::F),
            Operand::imm_f(0.0),
        );
        sel.predicate = Pred::Normal;
        let final_read = fb_write(Operand::vgrf(a, ScalarType::F));
        let insts = vec![
            Instruction::mov(8, Operand::vgrf(a, ScalarType::F), Operand::imm_f(2.0)),
            cmp,
            sel,
            final_read,
        ];
        let mut shader = compile(vgrf, insts);

        let progress = run(&mut shader);
        // The CMP's vector result is dead but its flag write feeds the SEL:
        // it must survive with a null destination.
        let cmp = shader
            .cfg
            .iter_insts()
            .map(|(_, _, inst)| inst)
            .find(|inst| inst.opcode == Opcode::Cmp)
            .expect("CMP must survive");
        assert!(cmp.dst.is_null());
        assert!(progress);
    }

    #[test]
    fn dce_is_idempotent() {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(1);
        let b = vgrf.alloc(1);
        let insts = vec![
            Instruction::mov(8, Operand::vgrf(a, ScalarType::F), Operand::imm_f(1.0)),
            Instruction::mov(8, Operand::vgrf(b, ScalarType::F), Operand::vgrf(a, ScalarType::F)),
        ];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        assert!(!run(&mut shader), "second run must reach a fixed point");
    }
}
