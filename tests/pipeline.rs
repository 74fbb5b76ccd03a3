//! End-to-end pipeline coverage: a fragment-shader-shaped program goes in,
//! a hardware-legal, allocated CFG comes out.

use wavec::ir::{Instruction, Opcode, Operand, RegFile, ScalarType};
use wavec::regalloc::{AllocError, AllocOutcome, Allocator};
use wavec::{DevInfo, Shader, VgrfAlloc, compile, lower_simd};

/// Sequential packing against a fixed register budget; spilling pretends by
/// assigning everything to the bottom of the file.
struct PackingAllocator {
    grf_count: u32,
}

impl Allocator for PackingAllocator {
    fn allocate(
        &mut self,
        shader: &mut Shader,
        allow_spilling: bool,
    ) -> Result<AllocOutcome, AllocError> {
        let needed = shader.vgrf.total_regs();
        if needed <= self.grf_count {
            let mut assignments = Vec::new();
            let mut base = 0;
            for nr in 0..shader.vgrf.count() {
                assignments.push(base);
                base += shader.vgrf.size(nr);
            }
            Ok(AllocOutcome {
                assignments,
                spill_count: 0,
                scratch_bytes: 0,
            })
        } else if allow_spilling {
            Ok(AllocOutcome {
                assignments: vec![0; shader.vgrf.count() as usize],
                spill_count: needed - self.grf_count,
                scratch_bytes: 0,
            })
        } else {
            Err(AllocError::OutOfRegisters {
                needed,
                available: self.grf_count,
            })
        }
    }
}

/// Interpolate a varying, sample a texture with it, scale the result and
/// write it out — at SIMD32, so width lowering has real work to do.
fn fragment_program(vgrf: &mut VgrfAlloc) -> Vec<Instruction> {
    let bary = vgrf.alloc(8); // 2 components at SIMD32
    let uv = vgrf.alloc(8); // 2 components of texture coordinates
    let surf = vgrf.alloc(1);
    let texel = vgrf.alloc(16); // 4 components at SIMD32
    let scaled = vgrf.alloc(16);
    let out = vgrf.alloc(16);

    let mut insts = vec![
        Instruction::new(Opcode::Undef, 32, Operand::vgrf(bary, ScalarType::F), &[]),
        Instruction::alu2(
            Opcode::Pln,
            32,
            Operand::vgrf(uv, ScalarType::F),
            Operand::vgrf(bary, ScalarType::F),
            Operand::attr(0, ScalarType::F),
        ),
        Instruction::alu2(
            Opcode::Pln,
            32,
            Operand::vgrf(uv, ScalarType::F).byte_offset(128),
            Operand::vgrf(bary, ScalarType::F),
            Operand::attr(1, ScalarType::F),
        ),
        Instruction::mov(
            32,
            Operand::vgrf(surf, ScalarType::UD).with_stride(0),
            Operand::imm_ud(3),
        ),
    ];

    let mut tex = Instruction::new(
        Opcode::SampleTex,
        32,
        Operand::vgrf(texel, ScalarType::F),
        &[
            Operand::vgrf(uv, ScalarType::F),
            Operand::vgrf(surf, ScalarType::UD).with_stride(0),
            Operand::imm_ud(2),
        ],
    );
    tex.size_written = 4 * 32 * 4;
    insts.push(tex);

    // x * 1 folds away; the copy chain coalesces.
    insts.push(Instruction::alu2(
        Opcode::Mul,
        32,
        Operand::vgrf(scaled, ScalarType::F),
        Operand::vgrf(texel, ScalarType::F),
        Operand::imm_f(1.0),
    ));
    insts.push(Instruction::mov(
        32,
        Operand::vgrf(out, ScalarType::F),
        Operand::vgrf(scaled, ScalarType::F),
    ));

    let mut fb = Instruction::new(
        Opcode::FbWrite,
        32,
        Operand::null(),
        &[
            Operand::vgrf(out, ScalarType::F),
            Operand::null(),
            Operand::imm_ud(4),
        ],
    );
    fb.eot = true;
    insts.push(fb);
    insts
}

#[test]
fn fragment_pipeline_compiles_to_hardware_legal_form() {
    let mut vgrf = VgrfAlloc::new();
    let insts = fragment_program(&mut vgrf);
    let mut shader = Shader::new(DevInfo::default(), 32, vgrf, insts);
    let mut allocator = PackingAllocator { grf_count: 256 };

    let outcome = compile(&mut shader, &mut allocator).expect("pipeline must compile");
    assert_eq!(outcome.spill_count, 0);
    assert!(!shader.failed());

    // No residual execution width may exceed its opcode's hardware bound.
    let devinfo = shader.devinfo;
    for (_, _, inst) in shader.cfg.iter_insts() {
        assert!(
            inst.exec_size <= lower_simd::max_exec_width(&devinfo, inst),
            "residual over-wide instruction: {inst}"
        );
    }

    // The EOT flag must sit on the very last instruction.
    let last = shader
        .cfg
        .blocks
        .last()
        .and_then(|b| b.insts.last())
        .expect("program must not be empty");
    assert!(last.eot, "thread must terminate on the final message");

    // Live ranges stay sound through the whole pipeline.
    let live = shader.live();
    live.validate(&shader.cfg, &shader.vgrf);
}

#[test]
fn copy_chain_temporaries_vanish_from_the_program() {
    let mut vgrf = VgrfAlloc::new();
    let x = vgrf.alloc(1);
    let t = vgrf.alloc(1);
    let y = vgrf.alloc(1);
    let insts = vec![
        Instruction::mov(8, Operand::vgrf(x, ScalarType::F), Operand::imm_f(0.5)),
        Instruction::mov(
            8,
            Operand::vgrf(t, ScalarType::F),
            Operand::vgrf(x, ScalarType::F),
        ),
        Instruction::mov(
            8,
            Operand::vgrf(y, ScalarType::F),
            Operand::vgrf(t, ScalarType::F),
        ),
        Instruction::new(
            Opcode::FbWrite,
            8,
            Operand::null(),
            &[
                Operand::vgrf(y, ScalarType::F),
                Operand::null(),
                Operand::imm_ud(1),
            ],
        ),
    ];
    let mut shader = Shader::new(DevInfo::default(), 8, vgrf, insts);
    let mut allocator = PackingAllocator { grf_count: 128 };

    compile(&mut shader, &mut allocator).expect("must compile");

    for (_, _, inst) in shader.cfg.iter_insts() {
        assert!(
            inst.dst.file != RegFile::Vgrf || inst.dst.nr != t,
            "temporary register resurfaced in {inst}"
        );
        assert!(
            !inst
                .src
                .iter()
                .any(|s| s.file == RegFile::Vgrf && s.nr == t),
            "temporary register read in {inst}"
        );
    }
}

#[test]
fn allocation_exhaustion_surfaces_as_a_compile_error() {
    struct NeverAllocator;
    impl Allocator for NeverAllocator {
        fn allocate(
            &mut self,
            _shader: &mut Shader,
            _allow_spilling: bool,
        ) -> Result<AllocOutcome, AllocError> {
            Err(AllocError::OutOfRegisters {
                needed: 512,
                available: 128,
            })
        }
    }

    let mut vgrf = VgrfAlloc::new();
    let a = vgrf.alloc(1);
    let insts = vec![
        Instruction::mov(8, Operand::vgrf(a, ScalarType::F), Operand::imm_f(1.0)),
        Instruction::new(
            Opcode::FbWrite,
            8,
            Operand::null(),
            &[
                Operand::vgrf(a, ScalarType::F),
                Operand::null(),
                Operand::imm_ud(1),
            ],
        ),
    ];
    let mut shader = Shader::new(DevInfo::default(), 8, vgrf, insts);

    let err = compile(&mut shader, &mut NeverAllocator).unwrap_err();
    assert!(err.message().contains("register allocation failed"));
    assert!(shader.failed());
}
