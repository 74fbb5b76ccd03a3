//! SIMD-width lowering.
//!
//! Hardware caps how wide one instruction can execute: operand regions span
//! at most two registers, sampler payloads top out at SIMD16, parts without
//! native 64-bit paths run 8-wide on quadword data. Any instruction whose
//! `exec_size` exceeds its bound is split into `exec_size / bound` copies,
//! each covering one contiguous lane group.
//!
//! Sources that don't naturally decompose per lane group (multi-component
//! payloads) are first packed into a temporary ("unzip"); destinations that
//! span more than one component chunk per group, or that overlap a source,
//! go through a temporary that is copied back afterwards ("zip").
//!
//! Lane groups are emitted highest-first; the end-of-thread flag rides only
//! on the lowest group, which is emitted last, so the thread is not
//! terminated before its final message.

use crate::devinfo::{DevInfo, MAX_SIMD, REG_SIZE};
use crate::ir::{CondMod, Instruction, Opcode, Operand, RegFile, ScalarType, regions_overlap};
use crate::shader::{Shader, VgrfAlloc, dep};

fn floor_pow2(v: u8) -> u8 {
    debug_assert!(v > 0);
    1 << (7 - v.leading_zeros())
}

/// The widest execution size this instruction may legally run at.
pub fn max_exec_width(devinfo: &DevInfo, inst: &Instruction) -> u8 {
    if inst.is_control_flow()
        || matches!(
            inst.opcode,
            Opcode::Nop
                | Opcode::Undef
                | Opcode::LoadPayload
                | Opcode::Broadcast
                | Opcode::FindLiveChannel
        )
    {
        return inst.exec_size;
    }

    let mut max = MAX_SIMD as u32;

    if inst.is_send() {
        max = match inst.opcode {
            Opcode::SampleTex => devinfo.max_sampler_simd() as u32,
            Opcode::FbWrite => 16,
            Opcode::MemoryLoad | Opcode::MemoryStore | Opcode::MemoryAtomic => 16,
            Opcode::ScratchRead | Opcode::ScratchWrite => 16,
            // Raw sends and fences were already shaped by earlier lowering.
            Opcode::SendFence | Opcode::Send => inst.exec_size as u32,
            _ => max,
        };
    } else {
        // No operand region may span more than two registers.
        let mut cap_region = |ty: ScalarType, stride: u8| {
            if stride > 0 {
                max = max.min(2 * REG_SIZE / (stride as u32 * ty.size()));
            }
        };
        if inst.dst.file != RegFile::Arch(crate::ir::ArchReg::Null) {
            cap_region(inst.dst.ty, inst.dst.stride);
        }
        for s in &inst.src {
            if matches!(s.file, RegFile::Vgrf | RegFile::Fixed | RegFile::Attr) {
                cap_region(s.ty, s.stride);
            }
        }

        if inst.cmod != CondMod::None {
            max = max.min(16);
        }
        // Mixed-precision destinations execute at half rate.
        if inst.dst.ty == ScalarType::HF && inst.src.iter().any(|s| s.ty == ScalarType::F) {
            max = max.min(8);
        }
        if !devinfo.has_native_64bit()
            && (inst.dst.ty.size() == 8 || inst.src.iter().any(|s| s.ty.size() == 8))
        {
            max = max.min(8);
        }
    }

    floor_pow2(max.clamp(1, inst.exec_size as u32) as u8)
}

/// Whether a sampler instruction also returns the residency side channel
/// (flagged by an immediate fourth source).
fn has_residency(inst: &Instruction) -> bool {
    inst.opcode == Opcode::SampleTex && inst.sources() > 3 && inst.src[3].bits != 0
}

/// Destination components written per invocation, excluding the residency
/// word.
fn components_written(inst: &Instruction) -> u32 {
    let data = if has_residency(inst) {
        inst.size_written.saturating_sub(REG_SIZE)
    } else {
        inst.size_written
    };
    let chunk = inst.dst.component_size(inst.exec_size);
    if chunk == 0 { 1 } else { (data / chunk).max(1) }
}

/// A lane-group view of one source, materializing a packed temporary when
/// the original layout would not decompose.
fn unzip_source(
    vgrf: &mut VgrfAlloc,
    out: &mut Vec<Instruction>,
    inst: &Instruction,
    arg: usize,
    group: u8,
    width: u8,
) -> Operand {
    let src = inst.src[arg];
    match src.file {
        RegFile::Imm | RegFile::Uniform | RegFile::Bad | RegFile::Arch(_) => return src,
        _ if src.stride == 0 => return src,
        _ => {}
    }

    let comps = inst.components_read(arg);
    if comps <= 1 {
        return src.horiz_offset(group as u32 * width as u32);
    }

    // Multi-component payload: component chunks are spaced by the original
    // execution size, so a narrower view must be repacked.
    let elem = src.ty.size();
    let tmp_nr = vgrf.alloc((comps * width as u32 * elem).div_ceil(REG_SIZE));
    let tmp = Operand::vgrf(tmp_nr, src.ty);
    for c in 0..comps {
        let from = src
            .byte_offset(c * inst.exec_size as u32 * elem * src.stride as u32)
            .horiz_offset(group as u32 * width as u32);
        let mut mov = Instruction::mov(width, tmp.byte_offset(c * width as u32 * elem), from);
        mov.group = inst.group + group * width;
        mov.force_writemask_all = inst.force_writemask_all;
        out.push(mov);
    }
    tmp
}

fn source_overlaps_dst(inst: &Instruction) -> bool {
    if inst.dst.file != RegFile::Vgrf {
        return false;
    }
    (0..inst.sources()).any(|s| {
        inst.src[s].file == RegFile::Vgrf
            && regions_overlap(&inst.src[s], inst.size_read(s), &inst.dst, inst.size_written)
    })
}

fn split_instruction(
    vgrf: &mut VgrfAlloc,
    out: &mut Vec<Instruction>,
    inst: Instruction,
    width: u8,
) {
    let n = inst.exec_size / width;
    let comps_w = components_written(&inst);
    let residency = has_residency(&inst);
    let needs_dst_copy = inst.dst.file == RegFile::Vgrf
        && (comps_w > 1 || residency || source_overlaps_dst(&inst));
    let elem = inst.dst.ty.size();

    for g in (0..n).rev() {
        let mut part = inst.clone();
        part.exec_size = width;
        part.group = inst.group + g * width;
        part.eot = inst.eot && g == 0;

        for arg in 0..part.sources() {
            part.src[arg] = unzip_source(vgrf, out, &inst, arg, g, width);
        }

        if !needs_dst_copy {
            if inst.dst.file == RegFile::Vgrf {
                part.dst = inst.dst.horiz_offset(g as u32 * width as u32);
            }
            part.size_written = part.dst.component_size(width);
            out.push(part);
            continue;
        }

        let tmp_bytes = comps_w * width as u32 * elem + if residency { REG_SIZE } else { 0 };
        let tmp_nr = vgrf.alloc(tmp_bytes.div_ceil(REG_SIZE));
        let tmp = Operand::vgrf(tmp_nr, inst.dst.ty);
        part.dst = tmp;
        part.size_written = tmp_bytes;
        out.push(part);

        // Zip the group's result back into its slice of the original
        // destination, one component chunk at a time.
        for c in 0..comps_w {
            let to = inst
                .dst
                .byte_offset(c * inst.exec_size as u32 * elem)
                .horiz_offset(g as u32 * width as u32);
            let mut mov = Instruction::mov(width, to, tmp.byte_offset(c * width as u32 * elem));
            mov.group = inst.group + g * width;
            mov.force_writemask_all = inst.force_writemask_all;
            out.push(mov);
        }

        if residency {
            // The first-lane residency word of this group lands at the
            // group's word slot in the trailing residency register.
            let res_src = tmp
                .byte_offset(comps_w * width as u32 * elem)
                .retyped(ScalarType::UW)
                .with_stride(0);
            let res_dst = inst
                .dst
                .byte_offset(comps_w * inst.exec_size as u32 * elem + g as u32 * 2)
                .retyped(ScalarType::UW)
                .with_stride(0);
            let mut merge = Instruction::mov(1, res_dst, res_src);
            merge.force_writemask_all = true;
            out.push(merge);
        }
    }
}

pub fn run(shader: &mut Shader) -> bool {
    let devinfo = shader.devinfo;
    let mut progress = false;

    for bi in 0..shader.cfg.blocks.len() {
        let insts = std::mem::take(&mut shader.cfg.blocks[bi].insts);
        let mut out = Vec::with_capacity(insts.len());
        for inst in insts {
            let width = max_exec_width(&devinfo, &inst);
            if inst.exec_size <= width {
                out.push(inst);
                continue;
            }
            split_instruction(&mut shader.vgrf, &mut out, inst, width);
            progress = true;
        }
        shader.cfg.blocks[bi].insts = out;
    }

    if progress {
        shader.cfg.renumber_ips();
        shader.invalidate_analysis(dep::ALL);
    }
    progress
}
