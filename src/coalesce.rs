//! Register coalescing.
//!
//! A pure register-to-register copy can be deleted outright if its source
//! and destination VGRFs can share storage. The proof obligation is on the
//! live ranges of each corresponding register-sized variable pair: disjoint
//! ranges are trivially safe; overlapping ranges are accepted only when one
//! is nested in the other and no third instruction writes either register
//! inside the overlap window — with one relaxation for a write to the
//! source that can conceptually slide down to the copy itself.
//!
//! On success the copy becomes a nop (or a flag-only move when it carried a
//! conditional modifier), and every reference to the old source register
//! number is renumbered to the destination, sub-register offsets preserved.

use crate::devinfo::REG_SIZE;
use crate::ir::{CondMod, Instruction, Opcode, Operand, Pred, RegFile};
use crate::live_vars::LiveVariables;
use crate::shader::{Shader, dep};

/// One whole-register-aligned copy: `regs` registers starting at register
/// index `reg_offset` of both VGRFs.
#[derive(Debug, Clone, Copy)]
struct CopyPiece {
    inst_index: usize,
    reg_offset: u32,
    regs: u32,
}

/// A register-to-register copy that qualifies for coalescing: MOV between
/// whole-register-aligned VGRF regions with no modifiers (a conditional
/// modifier is tolerated — the flag write survives as a null-dst move).
fn mov_candidate(inst: &Instruction) -> bool {
    inst.opcode == Opcode::Mov
        && inst.predicate == Pred::None
        && !inst.saturate
        && inst.dst.file == RegFile::Vgrf
        && inst.src[0].file == RegFile::Vgrf
        && !inst.src[0].negate
        && !inst.src[0].abs
        && inst.src[0].ty.size() == inst.dst.ty.size()
        && inst.src[0].is_contiguous()
        && inst.dst.is_contiguous()
        && inst.dst.offset % REG_SIZE == 0
        && inst.src[0].offset % REG_SIZE == 0
        && inst.src[0].offset == inst.dst.offset
        && inst.size_written % REG_SIZE == 0
}

/// A LOAD_PAYLOAD that is literally an identity copy of one contiguous
/// source register.
fn payload_candidate(inst: &Instruction) -> bool {
    if inst.opcode != Opcode::LoadPayload
        || inst.header_size != 0
        || inst.dst.file != RegFile::Vgrf
        || inst.dst.offset != 0
        || inst.cmod != CondMod::None
    {
        return false;
    }
    let first = &inst.src[0];
    if first.file != RegFile::Vgrf || first.offset != 0 || !first.is_contiguous() {
        return false;
    }
    let step = first.component_size(inst.exec_size);
    inst.src.iter().enumerate().all(|(i, s)| {
        s.file == RegFile::Vgrf
            && s.nr == first.nr
            && s.is_contiguous()
            && s.ty == first.ty
            && s.offset == i as u32 * step
    })
}

/// Ranges may touch exactly at the copy's own ip; that is a read-then-write
/// in one instruction, not a conflict.
fn ranges_disjoint(live: &LiveVariables, a: usize, b: usize) -> bool {
    live.end[a] <= live.start[b] || live.end[b] <= live.start[a]
}

fn inst_writes_vgrf(inst: &Instruction, nr: u32) -> bool {
    inst.dst.file == RegFile::Vgrf && inst.dst.nr == nr && inst.size_written > 0
}

fn inst_reads_vgrf(inst: &Instruction, nr: u32) -> bool {
    (0..inst.sources()).any(|s| inst.src[s].file == RegFile::Vgrf && inst.src[s].nr == nr)
}

/// The pairwise live-range compatibility proof for one variable pair.
#[allow(clippy::too_many_arguments)]
fn can_coalesce_vars(
    shader: &Shader,
    live: &LiveVariables,
    ip_table: &[(usize, usize)],
    copy_block: usize,
    copy_ip: usize,
    src_nr: u32,
    dst_nr: u32,
    src_var: usize,
    dst_var: usize,
) -> bool {
    if ranges_disjoint(live, src_var, dst_var) {
        return true;
    }

    let (s1, e1) = (live.start[src_var], live.end[src_var]);
    let (s2, e2) = (live.start[dst_var], live.end[dst_var]);
    let nested = (s1 <= s2 && e2 <= e1) || (s2 <= s1 && e1 <= e2);
    if !nested {
        return false;
    }

    let lo = s1.max(s2).max(0) as usize;
    let hi = (e1.min(e2) as usize).min(ip_table.len() - 1);
    for ip in lo..=hi {
        if ip == copy_ip {
            continue;
        }
        let (bi, ii) = ip_table[ip];
        let inst = &shader.cfg.blocks[bi].insts[ii];
        if !inst_writes_vgrf(inst, src_nr) && !inst_writes_vgrf(inst, dst_nr) {
            continue;
        }

        // A write to the source before the copy, in the copy's own block,
        // can slide down to coincide with the copy — but only if nothing
        // reads the destination in between.
        let tolerated = inst_writes_vgrf(inst, src_nr)
            && bi == copy_block
            && ip < copy_ip
            && (ip + 1..copy_ip).all(|mid| {
                let (mb, mi) = ip_table[mid];
                !inst_reads_vgrf(&shader.cfg.blocks[mb].insts[mi], dst_nr)
            });
        if !tolerated {
            return false;
        }
    }
    true
}

/// Gather the group of consecutive copies transferring the whole source
/// register, starting at `start`. Returns `None` when coverage is broken or
/// out of order.
fn gather_group(
    shader: &Shader,
    block_index: usize,
    start: usize,
    src_nr: u32,
    dst_nr: u32,
    total_regs: u32,
) -> Option<Vec<CopyPiece>> {
    let block = &shader.cfg.blocks[block_index];
    let mut pieces = Vec::new();
    let mut covered = 0u32;
    let mut index = start;

    while covered < total_regs {
        let inst = block.insts.get(index)?;
        let piece = if mov_candidate(inst) {
            if inst.src[0].nr != src_nr || inst.dst.nr != dst_nr {
                return None;
            }
            CopyPiece {
                inst_index: index,
                reg_offset: inst.dst.offset / REG_SIZE,
                regs: inst.size_written / REG_SIZE,
            }
        } else if payload_candidate(inst) {
            if inst.src[0].nr != src_nr || inst.dst.nr != dst_nr {
                return None;
            }
            CopyPiece {
                inst_index: index,
                reg_offset: 0,
                regs: inst.size_written.div_ceil(REG_SIZE),
            }
        } else {
            return None;
        };
        if piece.reg_offset != covered {
            // Written out of the expected order.
            return None;
        }
        covered += piece.regs;
        pieces.push(piece);
        index += 1;
    }
    (covered == total_regs).then_some(pieces)
}

/// Renumber every reference to `src_nr` as `dst_nr`, offsets preserved.
fn rename_vgrf(shader: &mut Shader, src_nr: u32, dst_nr: u32) {
    for block in &mut shader.cfg.blocks {
        for inst in &mut block.insts {
            if inst.dst.file == RegFile::Vgrf && inst.dst.nr == src_nr {
                inst.dst.nr = dst_nr;
            }
            for s in 0..inst.sources() {
                if inst.src[s].file == RegFile::Vgrf && inst.src[s].nr == src_nr {
                    inst.src[s].nr = dst_nr;
                }
            }
        }
    }
}

pub fn run(shader: &mut Shader) -> bool {
    let mut live = shader.live();
    let mut progress = false;

    let ip_table: Vec<(usize, usize)> = shader
        .cfg
        .blocks
        .iter()
        .enumerate()
        .flat_map(|(bi, b)| (0..b.insts.len()).map(move |ii| (bi, ii)))
        .collect();

    for bi in 0..shader.cfg.blocks.len() {
        let mut ii = 0;
        while ii < shader.cfg.blocks[bi].insts.len() {
            let inst = &shader.cfg.blocks[bi].insts[ii];
            let is_candidate = mov_candidate(inst) || payload_candidate(inst);
            if !is_candidate {
                ii += 1;
                continue;
            }
            let src_nr = inst.src[0].nr;
            let dst_nr = inst.dst.nr;
            if src_nr == dst_nr {
                ii += 1;
                continue;
            }
            if shader.vgrf.size(src_nr) != shader.vgrf.size(dst_nr) {
                ii += 1;
                continue;
            }
            let total_regs = shader.vgrf.size(src_nr);
            let Some(pieces) = gather_group(shader, bi, ii, src_nr, dst_nr, total_regs) else {
                ii += 1;
                continue;
            };

            // Every corresponding variable pair must be provably mergeable;
            // each piece's copy is the window exception for its own vars.
            let src_base = live.vgrf_var(src_nr);
            let dst_base = live.vgrf_var(dst_nr);
            let compatible = pieces.iter().all(|piece| {
                let copy_ip = shader.cfg.blocks[bi].start_ip + piece.inst_index;
                (piece.reg_offset..piece.reg_offset + piece.regs).all(|r| {
                    can_coalesce_vars(
                        shader,
                        &live,
                        &ip_table,
                        bi,
                        copy_ip,
                        src_nr,
                        dst_nr,
                        src_base + r as usize,
                        dst_base + r as usize,
                    )
                })
            });
            if !compatible {
                ii += 1;
                continue;
            }

            // Retire the copies. A conditional modifier survives as a
            // flag-only move of the unified register.
            for piece in &pieces {
                let inst = &mut shader.cfg.blocks[bi].insts[piece.inst_index];
                if inst.cmod != CondMod::None {
                    inst.dst = Operand::null_typed(inst.dst.ty);
                    inst.size_written = inst.dst.component_size(inst.exec_size);
                } else {
                    inst.remove();
                }
            }
            rename_vgrf(shader, src_nr, dst_nr);

            // Widen the destination's ranges to the union so later
            // candidates in this same run see the merged lifetime.
            for r in 0..total_regs as usize {
                let sv = src_base + r;
                let dv = dst_base + r;
                live.start[dv] = live.start[dv].min(live.start[sv]);
                live.end[dv] = live.end[dv].max(live.end[sv]);
            }
            live.vgrf_start[dst_nr as usize] =
                live.vgrf_start[dst_nr as usize].min(live.vgrf_start[src_nr as usize]);
            live.vgrf_end[dst_nr as usize] =
                live.vgrf_end[dst_nr as usize].max(live.vgrf_end[src_nr as usize]);

            progress = true;
            ii += 1;
        }
    }

    if progress {
        shader.cfg.compact();
        shader.invalidate_analysis(dep::INSTRUCTIONS | dep::DATA_FLOW | dep::VARIABLES);
    }
    progress
}
