//! Register allocation driver.
//!
//! The graph-coloring allocator itself is an external service behind the
//! [`Allocator`] trait; what lives here is the retry protocol around it.
//! The driver walks an ordered list of scheduling heuristics, attempting a
//! no-spill allocation under each. The first success wins. If every mode
//! fails, the ordering with the lowest register-pressure peak is restored
//! and allocation runs once more with spilling permitted; only if that also
//! fails does the compilation fail for good.
//!
//! On success the hardware fixups run unconditionally, then the final
//! post-allocation schedule.

use std::fmt;

use crate::devinfo::REG_SIZE;
use crate::ir::{Instruction, Opcode, Operand};
use crate::schedule::{self, Mode};
use crate::shader::{Shader, dep};

/// A concrete assignment produced by the allocator service.
#[derive(Debug, Clone)]
pub struct AllocOutcome {
    /// Physical base GRF per virtual register.
    pub assignments: Vec<u32>,
    /// Virtual registers that had to be spilled.
    pub spill_count: u32,
    /// Scratch space consumed by spill slots, in bytes.
    pub scratch_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    OutOfRegisters { needed: u32, available: u32 },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRegisters { needed, available } => {
                write!(f, "needed {needed} registers, {available} available")
            }
        }
    }
}

impl std::error::Error for AllocError {}

/// The external graph-coloring allocator. Given the finalized CFG and a
/// permitted-spill flag it either returns a concrete assignment (inserting
/// any spill/fill code itself) or reports failure.
pub trait Allocator {
    fn allocate(
        &mut self,
        shader: &mut Shader,
        allow_spilling: bool,
    ) -> Result<AllocOutcome, AllocError>;
}

/// Heuristics in the order the driver tries them.
const MODES: [Mode; 4] = [Mode::Pre, Mode::PreNonLifo, Mode::None, Mode::PreLifo];

fn snapshot(shader: &Shader) -> Vec<Vec<Instruction>> {
    shader.cfg.blocks.iter().map(|b| b.insts.clone()).collect()
}

fn restore(shader: &mut Shader, baseline: &[Vec<Instruction>]) {
    for (block, insts) in shader.cfg.blocks.iter_mut().zip(baseline) {
        block.insts = insts.clone();
    }
    shader.cfg.renumber_ips();
    shader.invalidate_analysis(dep::INSTRUCTIONS);
}

pub fn assign_regs(
    shader: &mut Shader,
    allocator: &mut dyn Allocator,
) -> Result<AllocOutcome, AllocError> {
    let baseline = snapshot(shader);
    let mut best: Option<(u32, Mode)> = None;

    for mode in MODES {
        restore(shader, &baseline);
        schedule::run(shader, mode);
        match allocator.allocate(shader, false) {
            Ok(outcome) => {
                log::debug!("allocated without spilling under {mode:?}");
                return Ok(post_alloc_fixups(shader, outcome));
            }
            Err(err) => {
                let peak = shader.pressure().peak();
                log::debug!("allocation failed under {mode:?} (peak {peak}): {err}");
                if best.map_or(true, |(p, _)| peak < p) {
                    best = Some((peak, mode));
                }
            }
        }
    }

    // Every heuristic failed; take the cheapest ordering and pay for the
    // spills.
    let (_, mode) = best.expect("at least one scheduling mode was attempted");
    restore(shader, &baseline);
    schedule::run(shader, mode);
    match allocator.allocate(shader, true) {
        Ok(outcome) => {
            log::debug!(
                "allocated with {} spills under {mode:?}",
                outcome.spill_count
            );
            Ok(post_alloc_fixups(shader, outcome))
        }
        Err(err) => {
            shader.fail(format!("register allocation failed: {err}"));
            Err(err)
        }
    }
}

/// Hardware fixups that must run on the allocated program, followed by the
/// final instruction schedule.
fn post_alloc_fixups(shader: &mut Shader, mut outcome: AllocOutcome) -> AllocOutcome {
    outcome.scratch_bytes =
        outcome.spill_count * REG_SIZE * (shader.dispatch_width as u32 / 8).max(1);

    // Memory writes must be globally observable before the thread retires.
    let has_stores = shader.cfg.iter_insts().any(|(_, _, i)| {
        matches!(
            i.opcode,
            Opcode::MemoryStore | Opcode::MemoryAtomic | Opcode::ScratchWrite
        )
    });
    if has_stores {
        let mut inserted = false;
        for block in &mut shader.cfg.blocks {
            if let Some(pos) = block.insts.iter().position(|i| i.eot) {
                let mut fence = Instruction::new(Opcode::SendFence, 1, Operand::null(), &[]);
                fence.force_writemask_all = true;
                block.insts.insert(pos, fence);
                inserted = true;
                break;
            }
        }
        if inserted {
            shader.cfg.renumber_ips();
            shader.invalidate_analysis(dep::INSTRUCTIONS);
        }
    }

    schedule::run(shader, Mode::Post);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devinfo::DevInfo;
    use crate::ir::ScalarType;
    use crate::shader::VgrfAlloc;

    /// Sequential packing: succeeds iff everything fits at once. Crude, but
    /// it exercises the driver protocol fully.
    struct PackingAllocator {
        grf_count: u32,
        calls: u32,
    }

    impl Allocator for PackingAllocator {
        fn allocate(
            &mut self,
            shader: &mut Shader,
            allow_spilling: bool,
        ) -> Result<AllocOutcome, AllocError> {
            self.calls += 1;
            let needed = shader.vgrf.total_regs();
            if needed <= self.grf_count {
                let mut assignments = Vec::new();
                let mut base = 0;
                for nr in 0..shader.vgrf.count() {
                    assignments.push(base);
                    base += shader.vgrf.size(nr);
                }
                return Ok(AllocOutcome {
                    assignments,
                    spill_count: 0,
                    scratch_bytes: 0,
                });
            }
            if allow_spilling {
                return Ok(AllocOutcome {
                    assignments: vec![0; shader.vgrf.count() as usize],
                    spill_count: needed - self.grf_count,
                    scratch_bytes: 0,
                });
            }
            Err(AllocError::OutOfRegisters {
                needed,
                available: self.grf_count,
            })
        }
    }

    fn sample_shader(regs_each: u32) -> Shader {
        let mut vgrf = VgrfAlloc::new();
        let a = vgrf.alloc(regs_each);
        let b = vgrf.alloc(regs_each);
        let insts = vec![
            Instruction::mov(8, Operand::vgrf(a, ScalarType::F), Operand::imm_f(1.0)),
            Instruction::mov(8, Operand::vgrf(b, ScalarType::F), Operand::imm_f(2.0)),
            Instruction::alu2(
                Opcode::Add,
                8,
                Operand::vgrf(a, ScalarType::F),
                Operand::vgrf(a, ScalarType::F),
                Operand::vgrf(b, ScalarType::F),
            ),
        ];
        Shader::new(DevInfo::default(), 8, vgrf, insts)
    }

    #[test]
    fn fitting_programs_allocate_without_spilling() {
        let mut shader = sample_shader(1);
        let mut alloc = PackingAllocator {
            grf_count: 16,
            calls: 0,
        };
        let outcome = assign_regs(&mut shader, &mut alloc).expect("must allocate");
        assert_eq!(outcome.spill_count, 0);
        assert_eq!(alloc.calls, 1, "first heuristic should already succeed");
        assert!(!shader.failed());
    }

    #[test]
    fn driver_falls_back_to_spilling_after_all_modes() {
        let mut shader = sample_shader(8);
        let mut alloc = PackingAllocator {
            grf_count: 4,
            calls: 0,
        };
        let outcome = assign_regs(&mut shader, &mut alloc).expect("spilling must succeed");
        assert!(outcome.spill_count > 0);
        assert_eq!(
            alloc.calls,
            MODES.len() as u32 + 1,
            "every heuristic tried once, then the spill attempt"
        );
        assert!(outcome.scratch_bytes >= outcome.spill_count * REG_SIZE);
        assert!(!shader.failed());
    }

    #[test]
    fn exhausted_spilling_is_a_fatal_failure() {
        struct NeverAllocator;
        impl Allocator for NeverAllocator {
            fn allocate(
                &mut self,
                _shader: &mut Shader,
                _allow_spilling: bool,
            ) -> Result<AllocOutcome, AllocError> {
                Err(AllocError::OutOfRegisters {
                    needed: 999,
                    available: 0,
                })
            }
        }
        let mut shader = sample_shader(1);
        let err = assign_regs(&mut shader, &mut NeverAllocator).unwrap_err();
        assert!(matches!(err, AllocError::OutOfRegisters { .. }));
        assert!(shader.failed());
        assert!(
            shader
                .failure_message()
                .unwrap()
                .contains("register allocation failed")
        );
    }

    #[test]
    fn stores_get_a_fence_before_the_thread_ends() {
        let mut vgrf = VgrfAlloc::new();
        let addr = vgrf.alloc(1);
        let color = vgrf.alloc(1);
        let store = Instruction::new(
            Opcode::MemoryStore,
            8,
            Operand::null(),
            &[
                Operand::vgrf(addr, ScalarType::UD),
                Operand::imm_ud(1),
                Operand::imm_ud(1),
                Operand::vgrf(color, ScalarType::UD),
                Operand::imm_ud(1),
            ],
        );
        let mut fb = Instruction::new(
            Opcode::FbWrite,
            8,
            Operand::null(),
            &[
                Operand::vgrf(color, ScalarType::F),
                Operand::null(),
                Operand::imm_ud(1),
            ],
        );
        fb.eot = true;
        let insts = vec![
            Instruction::mov(8, Operand::vgrf(addr, ScalarType::UD), Operand::imm_ud(0)),
            Instruction::mov(8, Operand::vgrf(color, ScalarType::UD), Operand::imm_ud(7)),
            store,
            fb,
        ];
        let mut shader = Shader::new(DevInfo::default(), 8, vgrf, insts);
        let mut alloc = PackingAllocator {
            grf_count: 64,
            calls: 0,
        };
        assign_regs(&mut shader, &mut alloc).expect("must allocate");

        let ops: Vec<Opcode> = shader.cfg.iter_insts().map(|(_, _, i)| i.opcode).collect();
        let fence = ops.iter().position(|&o| o == Opcode::SendFence).unwrap();
        let fb = ops.iter().position(|&o| o == Opcode::FbWrite).unwrap();
        assert!(fence < fb, "fence must precede the EOT write");
    }
}
