//! Algebraic peephole rewrites.
//!
//! One forward walk over every instruction, opcode-keyed: identity operands
//! collapse to moves, immediate-only logic folds to the computed immediate,
//! multiply-adds with a unit multiplicand demote to adds. Also the
//! generation legalization that splits 64-bit moves and selects into
//! 32-bit-half operations on parts without native 64-bit data paths.
//!
//! After a rewrite leaves a commutative instruction with its immediate in
//! the first operand slot, the operands are swapped back — the hardware
//! requires the immediate to be the second source.

use crate::ir::{CondMod, Instruction, Opcode, Operand, RegFile, ScalarType};
use crate::shader::{Shader, dep};

/// Fold a two-immediate integer operation, masked to the operand type.
fn fold_imm_pair(opcode: Opcode, a: &Operand, b: &Operand) -> Option<Operand> {
    if !a.ty.is_integer() || a.ty != b.ty {
        return None;
    }
    let bits = match opcode {
        Opcode::And => a.bits & b.bits,
        Opcode::Or => a.bits | b.bits,
        Opcode::Xor => a.bits ^ b.bits,
        Opcode::Shl => a.bits << (b.bits & 63),
        Opcode::Shr => a.bits >> (b.bits & 63),
        _ => return None,
    };
    let mask = match a.ty.size() {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    };
    Some(Operand {
        bits: bits & mask,
        ..*a
    })
}

fn zero_imm(ty: ScalarType) -> Operand {
    match ty {
        ScalarType::F => Operand::imm_f(0.0),
        ScalarType::DF => Operand::imm_df(0.0),
        _ => Operand {
            file: RegFile::Imm,
            ty,
            bits: 0,
            ..Operand::default()
        },
    }
}

/// Rewrite `inst` into `MOV dst, src`, clearing the extra sources.
fn demote_to_mov(inst: &mut Instruction, src: Operand) {
    inst.opcode = Opcode::Mov;
    inst.resize_sources(1);
    inst.src[0] = src;
    inst.predicate = crate::ir::Pred::None;
    inst.predicate_inverse = false;
}

fn try_rewrite(inst: &mut Instruction) -> bool {
    match inst.opcode {
        Opcode::Add => {
            if inst.src[1].is_zero() {
                let src = inst.src[0];
                demote_to_mov(inst, src);
                return true;
            }
            false
        }
        Opcode::Mul => {
            if inst.src[1].is_one() {
                let src = inst.src[0];
                demote_to_mov(inst, src);
                return true;
            }
            if inst.src[1].is_negative_one() {
                let src = inst.src[0].negated();
                demote_to_mov(inst, src);
                return true;
            }
            if inst.src[1].is_zero() && inst.dst.ty.is_integer() {
                let zero = zero_imm(inst.dst.ty);
                demote_to_mov(inst, zero);
                return true;
            }
            false
        }
        Opcode::And => {
            if inst.src[0].is_imm() && inst.src[1].is_imm() {
                if let Some(folded) = fold_imm_pair(Opcode::And, &inst.src[0], &inst.src[1]) {
                    demote_to_mov(inst, folded);
                    return true;
                }
            }
            if inst.src[1].is_zero() {
                let zero = zero_imm(inst.dst.ty);
                demote_to_mov(inst, zero);
                return true;
            }
            if inst.src[1].is_negative_one() || inst.src[0] == inst.src[1] {
                let src = inst.src[0];
                demote_to_mov(inst, src);
                return true;
            }
            false
        }
        Opcode::Or => {
            if inst.src[0].is_imm() && inst.src[1].is_imm() {
                if let Some(folded) = fold_imm_pair(Opcode::Or, &inst.src[0], &inst.src[1]) {
                    demote_to_mov(inst, folded);
                    return true;
                }
            }
            if inst.src[1].is_zero() || inst.src[0] == inst.src[1] {
                let src = inst.src[0];
                demote_to_mov(inst, src);
                return true;
            }
            false
        }
        Opcode::Shl | Opcode::Shr | Opcode::Asr => {
            if inst.src[1].is_zero() {
                let src = inst.src[0];
                demote_to_mov(inst, src);
                return true;
            }
            if inst.opcode != Opcode::Asr && inst.src[0].is_imm() && inst.src[1].is_imm() {
                if let Some(folded) = fold_imm_pair(inst.opcode, &inst.src[0], &inst.src[1]) {
                    demote_to_mov(inst, folded);
                    return true;
                }
            }
            false
        }
        Opcode::Sel => {
            // A select between equal operands reads the flag for nothing.
            if inst.src[0] == inst.src[1] && inst.cmod == CondMod::None {
                let src = inst.src[0];
                demote_to_mov(inst, src);
                return true;
            }
            false
        }
        Opcode::Mad => {
            // dst = src1 * src2 + src0
            if inst.src[1].is_one() {
                inst.opcode = Opcode::Add;
                let addend = inst.src[0];
                let term = inst.src[2];
                inst.resize_sources(2);
                inst.src[0] = term;
                inst.src[1] = addend;
                return true;
            }
            if inst.src[2].is_one() {
                inst.opcode = Opcode::Add;
                let addend = inst.src[0];
                let term = inst.src[1];
                inst.resize_sources(2);
                inst.src[0] = term;
                inst.src[1] = addend;
                return true;
            }
            if (inst.src[1].is_zero() || inst.src[2].is_zero()) && inst.dst.ty.is_integer() {
                let src = inst.src[0];
                demote_to_mov(inst, src);
                return true;
            }
            false
        }
        _ => false,
    }
}

/// Put an immediate back into the second slot of a commutative instruction.
fn canonicalize_imm_position(inst: &mut Instruction) {
    if inst.opcode.is_commutative()
        && inst.sources() == 2
        && inst.src[0].is_imm()
        && !inst.src[1].is_imm()
    {
        inst.src.swap(0, 1);
    }
}

/// Split one 64-bit move or select into two 32-bit-half instructions.
/// Returns the extra instruction for the high half.
fn split_64bit(inst: &mut Instruction) -> Instruction {
    let half = |op: Operand, high: bool| -> Operand {
        match op.file {
            RegFile::Imm => {
                let bits = if high { op.bits >> 32 } else { op.bits & 0xffff_ffff };
                Operand::imm_ud(bits as u32)
            }
            _ => {
                let shifted = op
                    .retyped(ScalarType::UD)
                    .with_stride(op.stride * 2)
                    .byte_offset(if high { 4 } else { 0 });
                shifted
            }
        }
    };

    let mut hi = inst.clone();
    for (part, is_high) in [(&mut *inst, false), (&mut hi, true)] {
        part.dst = half(part.dst, is_high);
        for s in 0..part.sources() {
            part.src[s] = half(part.src[s], is_high);
        }
        part.size_written = part.dst.component_size(part.exec_size);
    }
    hi
}

fn can_split_64bit(inst: &Instruction) -> bool {
    let wide = inst.dst.ty.size() == 8 && inst.dst.file == RegFile::Vgrf;
    if !wide || inst.saturate || inst.cmod != CondMod::None {
        return false;
    }
    inst.src.iter().all(|s| {
        s.ty.size() == 8
            && !s.negate
            && !s.abs
            && matches!(s.file, RegFile::Vgrf | RegFile::Imm | RegFile::Uniform)
    })
}

/// Run the peephole table over the whole program once.
pub fn run(shader: &mut Shader) -> bool {
    let mut progress = false;
    let split_wide = !shader.devinfo.has_native_64bit();

    for block in &mut shader.cfg.blocks {
        let mut i = 0;
        while i < block.insts.len() {
            let inst = &mut block.insts[i];
            if try_rewrite(inst) {
                canonicalize_imm_position(inst);
                progress = true;
            }

            if split_wide
                && matches!(inst.opcode, Opcode::Mov | Opcode::Sel)
                && can_split_64bit(inst)
            {
                let high = split_64bit(inst);
                block.insts.insert(i + 1, high);
                progress = true;
                i += 1;
            }
            i += 1;
        }
    }

    if progress {
        shader.cfg.renumber_ips();
        shader.invalidate_analysis(dep::INSTRUCTIONS | dep::DATA_FLOW);
    }
    progress
}
