//! Copy and constant propagation.
//!
//! Two levels. The local pass walks one block with a working set of
//! "available copies" (ACP): every pure, fully-written, unconditional move
//! contributes an entry, and every later source operand that reads an
//! entry's destination is rewritten to read the original source instead —
//! subject to a detailed legality gate, because hardware regioning, source
//! modifiers and message payload rules all restrict what an operand can
//! express.
//!
//! The global pass extends this across block boundaries: the entries still
//! live at each block's end feed a bit-vector availability dataflow
//! (intersection over predecessors, with entries whose destination is
//! provably undefined along a path treated as transparent on that path),
//! plus a second fixed point that poisons entries whose source was
//! overwritten somewhere under a different execution-mask policy. The local
//! pass then runs once more, seeded with the entries that survive.
//!
//! Rewrites happen in place; dead moves left behind are dead-code
//! elimination's problem.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::bitset::BitSet;
use crate::cfg::Block;
use crate::devinfo::{DevInfo, REG_SIZE};
use crate::ir::{Instruction, Opcode, Operand, Pred, RegFile, ScalarType, regions_overlap};
use crate::shader::{Shader, dep};

// ─── ACP entries and the two-index working set ──────────────────────────────

/// One propagation candidate: `dst` was written as a pure copy of `src`.
#[derive(Debug, Clone, PartialEq)]
pub struct AcpEntry {
    pub dst: Operand,
    pub src: Operand,
    /// Bytes the defining instruction wrote.
    pub size_written: u32,
    /// Bytes the defining instruction read from `src`.
    pub size_read: u32,
    pub opcode: Opcode,
    pub is_partial_write: bool,
    pub force_writemask_all: bool,
}

/// The working set: an arena of entries plus two ordered indexes, one keyed
/// by destination register number, one by source register number. Kills
/// mark the arena slot dead rather than unlinking.
#[derive(Debug, Default)]
struct Acp {
    entries: Vec<AcpEntry>,
    alive: Vec<bool>,
    by_dst: BTreeMap<u32, SmallVec<[usize; 4]>>,
    by_src: BTreeMap<u32, SmallVec<[usize; 4]>>,
}

impl Acp {
    fn add(&mut self, entry: AcpEntry) {
        let idx = self.entries.len();
        self.by_dst.entry(entry.dst.nr).or_default().push(idx);
        if entry.src.file == RegFile::Vgrf {
            self.by_src.entry(entry.src.nr).or_default().push(idx);
        }
        self.entries.push(entry);
        self.alive.push(true);
    }

    fn lookup_dst(&self, nr: u32) -> impl Iterator<Item = (usize, &AcpEntry)> {
        self.by_dst
            .get(&nr)
            .into_iter()
            .flatten()
            .filter(|&&idx| self.alive[idx])
            .map(|&idx| (idx, &self.entries[idx]))
    }

    /// Kill every entry whose destination or source region is clobbered by a
    /// write through `reg` of `size` bytes.
    fn invalidate(&mut self, reg: &Operand, size: u32) {
        if size == 0 {
            return;
        }
        if reg.file == RegFile::Vgrf {
            let mut doomed: SmallVec<[usize; 8]> = SmallVec::new();
            for indexes in [self.by_dst.get(&reg.nr), self.by_src.get(&reg.nr)] {
                for &idx in indexes.into_iter().flatten() {
                    if !self.alive[idx] {
                        continue;
                    }
                    let e = &self.entries[idx];
                    if regions_overlap(&e.dst, e.size_written, reg, size)
                        || regions_overlap(&e.src, e.size_read, reg, size)
                    {
                        doomed.push(idx);
                    }
                }
            }
            for idx in doomed {
                self.alive[idx] = false;
            }
        } else {
            for idx in 0..self.entries.len() {
                if !self.alive[idx] {
                    continue;
                }
                let e = &self.entries[idx];
                if regions_overlap(&e.dst, e.size_written, reg, size)
                    || regions_overlap(&e.src, e.size_read, reg, size)
                {
                    self.alive[idx] = false;
                }
            }
        }
    }

    fn live_entries(&self) -> impl Iterator<Item = &AcpEntry> {
        self.entries
            .iter()
            .zip(&self.alive)
            .filter_map(|(e, &alive)| alive.then_some(e))
    }
}

// ─── Legality gates ─────────────────────────────────────────────────────────

const EXPRESSIBLE_STRIDES: [u32; 4] = [0, 1, 2, 4];

/// Which argument slots of an opcode may hold an immediate.
fn can_take_immediate(inst: &Instruction, arg: usize) -> bool {
    match inst.opcode {
        Opcode::Mov => arg == 0,
        Opcode::Add
        | Opcode::Mul
        | Opcode::Avg
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor => arg == 1 || (arg == 0 && !inst.src[1].is_imm()),
        Opcode::Shl | Opcode::Shr | Opcode::Asr | Opcode::Cmp | Opcode::Cmpn => arg == 1,
        Opcode::Sel | Opcode::Csel => arg == 1,
        Opcode::Broadcast => arg == 1,
        // Message payloads live in registers; the payload operand of a send
        // can never become an immediate.
        op if op.is_send() => false,
        _ => false,
    }
}

/// Build the operand that reads `entry.src` the way `inst.src[arg]`
/// currently reads `entry.dst`, or reject with `None`.
fn compose_source(
    devinfo: &DevInfo,
    inst: &Instruction,
    arg: usize,
    entry: &AcpEntry,
) -> Option<Operand> {
    let reading = inst.src[arg];
    let read_size = inst.size_read(arg);

    // The read must be fully contained in the bytes the copy wrote.
    if reading.offset < entry.dst.offset
        || reading.offset + read_size > entry.dst.offset + entry.size_written
    {
        return None;
    }
    // A copy that never covered a whole register may have left padding
    // uninitialized; reading through it would expose that.
    if entry.is_partial_write {
        return None;
    }
    // Reading elements wider than the copy moved would also reach bytes the
    // copy never wrote.
    if reading.ty.size() > entry.src.ty.size() {
        return None;
    }

    let delta = reading.offset - entry.dst.offset;
    let elem = entry.src.ty.size();
    if delta % elem != 0 {
        return None;
    }

    // Composed stride must still be a single expressible hardware stride.
    let composed_stride = entry.src.stride as u32 * reading.stride as u32;
    if !EXPRESSIBLE_STRIDES.contains(&composed_stride) {
        return None;
    }

    let mut new_src = entry.src;
    new_src.ty = reading.ty;
    new_src.stride = composed_stride as u8;
    // A byte delta into the copy's destination maps through the entry's own
    // stride; a periodic (stride 0) source reads the same element wherever
    // the consumer's offset lands.
    new_src = new_src.byte_offset((delta / elem) * elem * entry.src.stride as u32);

    // Compose modifiers: an outer abs absorbs the inner sign.
    if reading.abs {
        new_src.abs = true;
        new_src.negate = reading.negate;
    } else {
        new_src.negate ^= reading.negate;
    }
    if (new_src.negate || new_src.abs) && !inst.can_do_source_mods(devinfo) {
        return None;
    }

    // Message and indirect reads need contiguous, register-aligned payloads;
    // a spanning fixed-GRF region cannot be re-expressed either.
    let strict_contiguity = inst.is_send() || inst.opcode == Opcode::MovIndirect;
    if strict_contiguity {
        if new_src.file != RegFile::Vgrf
            || new_src.stride != 1
            || new_src.offset % REG_SIZE != 0
            || new_src.negate
            || new_src.abs
        {
            return None;
        }
    }
    if new_src.file == RegFile::Fixed && read_size > 2 * REG_SIZE {
        return None;
    }
    // Thread-terminating payloads must stay allocatable in the high
    // register range.
    if inst.eot {
        match new_src.file {
            RegFile::Vgrf => {}
            RegFile::Fixed if new_src.nr >= devinfo.eot_payload_floor() => {}
            _ => return None,
        }
    }

    Some(new_src)
}

/// Negate/abs folded into an immediate value, or `None` if the type has no
/// cheap fold.
fn apply_imm_mods(mut imm: Operand, negate: bool, abs: bool) -> Option<Operand> {
    if !negate && !abs {
        return Some(imm);
    }
    match imm.ty {
        ScalarType::F => {
            let mut v = f32::from_bits(imm.bits as u32);
            if abs {
                v = v.abs();
            }
            if negate {
                v = -v;
            }
            imm.bits = v.to_bits() as u64;
            Some(imm)
        }
        ScalarType::DF => {
            let mut v = f64::from_bits(imm.bits);
            if abs {
                v = v.abs();
            }
            if negate {
                v = -v;
            }
            imm.bits = v.to_bits();
            Some(imm)
        }
        ScalarType::D => {
            let mut v = imm.bits as u32 as i32;
            if abs {
                v = v.wrapping_abs();
            }
            if negate {
                v = v.wrapping_neg();
            }
            imm.bits = v as u32 as u64;
            Some(imm)
        }
        ScalarType::W => {
            let mut v = imm.bits as u16 as i16;
            if abs {
                v = v.wrapping_abs();
            }
            if negate {
                v = v.wrapping_neg();
            }
            imm.bits = v as u16 as u64;
            Some(imm)
        }
        _ => None,
    }
}

/// The immediate that `inst.src[arg]` would become, or `None` when the
/// opcode, type widths or modifiers forbid it.
fn compose_immediate(inst: &Instruction, arg: usize, entry: &AcpEntry) -> Option<Operand> {
    debug_assert!(entry.src.is_imm());
    if !can_take_immediate(inst, arg) {
        return None;
    }
    let reading = inst.src[arg];
    let read_elem = reading.ty.size();
    let imm_elem = entry.src.ty.size();

    let mut imm = entry.src;
    if read_elem == imm_elem {
        if reading.offset != entry.dst.offset {
            return None;
        }
    } else if imm_elem == 2 * read_elem {
        // Reading half of a wider immediate: the sub-register offset picks
        // which half.
        let delta = reading.offset.checked_sub(entry.dst.offset)?;
        if delta == 0 {
            imm.bits &= (1u64 << (read_elem * 8)) - 1;
        } else if delta == read_elem {
            imm.bits >>= read_elem * 8;
        } else {
            return None;
        }
    } else {
        return None;
    }
    imm.ty = reading.ty;
    apply_imm_mods(imm, reading.negate, reading.abs)
}

fn try_constant_propagate(inst: &mut Instruction, arg: usize, entry: &AcpEntry) -> bool {
    let Some(imm) = compose_immediate(inst, arg, entry) else {
        return false;
    };
    inst.src[arg] = imm;
    if arg == 0 && inst.opcode.is_commutative() {
        inst.src.swap(0, 1);
    }
    true
}

fn try_copy_propagate(
    devinfo: &DevInfo,
    inst: &mut Instruction,
    arg: usize,
    entry: &AcpEntry,
) -> bool {
    let Some(new_src) = compose_source(devinfo, inst, arg, entry) else {
        return false;
    };
    inst.src[arg] = new_src;
    true
}

// ─── Entry harvesting ───────────────────────────────────────────────────────

/// An instruction that publishes a new available copy.
///
/// Source modifiers are admitted — the entry records them and the legality
/// gate decides per consumer whether they can be folded on.
fn entry_for(inst: &Instruction) -> Option<AcpEntry> {
    let is_identity_payload = inst.opcode == Opcode::LoadPayload
        && inst.header_size == 0
        && inst.sources() == 1
        && inst.src[0].is_contiguous();
    let is_plain_mov = inst.opcode == Opcode::Mov
        && inst.predicate == Pred::None
        && inst.cmod == crate::ir::CondMod::None
        && !inst.saturate;
    let is_copy = is_plain_mov || is_identity_payload;
    if !is_copy
        || inst.dst.file != RegFile::Vgrf
        || inst.is_partial_write()
        || inst.src[0].ty != inst.dst.ty
    {
        return None;
    }
    match inst.src[0].file {
        RegFile::Vgrf => {
            if regions_overlap(&inst.dst, inst.size_written, &inst.src[0], inst.size_read(0)) {
                return None;
            }
        }
        RegFile::Fixed | RegFile::Uniform | RegFile::Attr | RegFile::Imm => {}
        _ => return None,
    }
    Some(AcpEntry {
        dst: inst.dst,
        src: inst.src[0],
        size_written: inst.size_written,
        size_read: inst.size_read(0),
        opcode: inst.opcode,
        is_partial_write: inst.is_partial_write(),
        force_writemask_all: inst.force_writemask_all,
    })
}

// ─── Local pass ─────────────────────────────────────────────────────────────

fn local_pass(devinfo: &DevInfo, block: &mut Block, acp: &mut Acp) -> bool {
    let mut progress = false;

    for inst in &mut block.insts {
        if inst.opcode == Opcode::Nop {
            continue;
        }

        for arg in 0..inst.sources() {
            if inst.src[arg].file != RegFile::Vgrf {
                continue;
            }
            let candidates: SmallVec<[usize; 4]> = acp
                .lookup_dst(inst.src[arg].nr)
                .map(|(idx, _)| idx)
                .collect();
            for idx in candidates {
                let entry = acp.entries[idx].clone();
                let done = if entry.src.is_imm() {
                    try_constant_propagate(inst, arg, &entry)
                } else {
                    try_copy_propagate(devinfo, inst, arg, &entry)
                };
                if done {
                    progress = true;
                    break;
                }
            }
        }

        if inst.size_written > 0
            && matches!(inst.dst.file, RegFile::Vgrf | RegFile::Fixed | RegFile::Attr)
        {
            acp.invalidate(&inst.dst, inst.size_written);
        }

        if let Some(entry) = entry_for(inst) {
            acp.add(entry);
        }
    }
    progress
}

// ─── Global dataflow ────────────────────────────────────────────────────────

struct GlobalSets {
    r#gen: Vec<BitSet>,
    kill: Vec<BitSet>,
    exec_gen: Vec<BitSet>,
    livein: Vec<BitSet>,
    liveout: Vec<BitSet>,
    reachin: Vec<BitSet>,
    mism_in: Vec<BitSet>,
}

fn global_dataflow(shader: &mut Shader, block_out: &[Vec<AcpEntry>]) -> Vec<Vec<AcpEntry>> {
    let all: Vec<(usize, AcpEntry)> = block_out
        .iter()
        .enumerate()
        .flat_map(|(b, entries)| entries.iter().map(move |e| (b, e.clone())))
        .collect();
    let n = all.len();
    let nb = shader.cfg.blocks.len();
    if n == 0 {
        return vec![Vec::new(); nb];
    }

    let live = shader.live();
    let mut sets = GlobalSets {
        r#gen: vec![BitSet::new(n); nb],
        kill: vec![BitSet::new(n); nb],
        exec_gen: vec![BitSet::new(n); nb],
        livein: vec![BitSet::new(n); nb],
        liveout: vec![BitSet::new(n); nb],
        reachin: vec![BitSet::new(n); nb],
        mism_in: vec![BitSet::new(n); nb],
    };

    for (i, (b, _)) in all.iter().enumerate() {
        sets.r#gen[*b].insert(i);
    }

    for block in &shader.cfg.blocks {
        let bi = block.id.index();
        for inst in &block.insts {
            if inst.size_written == 0 || inst.opcode == Opcode::Nop {
                continue;
            }
            for (i, (src_block, e)) in all.iter().enumerate() {
                // Entries survive their own defining block's local pass, so
                // kills only matter for the other blocks they flow through.
                if *src_block == bi {
                    continue;
                }
                let hits_src = regions_overlap(&inst.dst, inst.size_written, &e.src, e.size_read);
                let hits_dst =
                    regions_overlap(&inst.dst, inst.size_written, &e.dst, e.size_written);
                if hits_src || hits_dst {
                    sets.kill[bi].insert(i);
                }
                if hits_src && inst.force_writemask_all != e.force_writemask_all {
                    sets.exec_gen[bi].insert(i);
                }
            }
        }
    }

    // Reachability: which entries are generated somewhere along a path into
    // the block. Plain forward union.
    loop {
        let mut changed = false;
        for block in &shader.cfg.blocks {
            let bi = block.id.index();
            let mut out = sets.reachin[bi].clone();
            out.union_with(&sets.r#gen[bi]);
            for succ in &block.succs {
                changed |= sets.reachin[succ.index()].union_with(&out);
            }
        }
        if !changed {
            break;
        }
    }

    // Availability: intersection over predecessors, except that a
    // predecessor along which the entry's destination was never defined is
    // transparent — propagating into an undefined value cannot change
    // semantics. Optimistic start, monotone shrink.
    for bi in 1..nb {
        sets.livein[bi] = BitSet::full(n);
    }
    for bi in 0..nb {
        let mut out = sets.livein[bi].clone();
        out.subtract(&sets.kill[bi]);
        out.union_with(&sets.r#gen[bi]);
        sets.liveout[bi] = out;
    }
    loop {
        let mut changed = false;
        for block in &shader.cfg.blocks {
            let bi = block.id.index();
            // The entry block also receives control from outside, where
            // nothing is available — a loop back edge must not resurrect
            // entries into it.
            if bi == 0 || block.preds.is_empty() {
                continue;
            }
            let mut inn = BitSet::full(n);
            for pred in &block.preds {
                let pd = pred.index();
                let mut avail = sets.liveout[pd].clone();
                // Transparent where the destination is undefined at the
                // predecessor's exit.
                for (i, (_, e)) in all.iter().enumerate() {
                    if avail.contains(i) {
                        continue;
                    }
                    let defined = live
                        .var_range(&e.dst, e.size_written)
                        .any(|var| live.block_data[pd].defout.contains(var));
                    if !defined {
                        avail.insert(i);
                    }
                }
                inn.intersect_with(&avail);
            }
            if inn != sets.livein[bi] {
                sets.livein[bi] = inn.clone();
                let mut out = inn;
                out.subtract(&sets.kill[bi]);
                out.union_with(&sets.r#gen[bi]);
                if out != sets.liveout[bi] {
                    sets.liveout[bi] = out;
                }
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Execution-mask mismatch: grows along every path, never shrinks. Any
    // overwrite of the source under a different mask policy anywhere on a
    // reaching path poisons the entry. Deliberately over-approximate.
    loop {
        let mut changed = false;
        for block in &shader.cfg.blocks {
            let bi = block.id.index();
            let mut out = sets.mism_in[bi].clone();
            out.union_with(&sets.exec_gen[bi]);
            for succ in &block.succs {
                changed |= sets.mism_in[succ.index()].union_with(&out);
            }
        }
        if !changed {
            break;
        }
    }

    let mut seeds = vec![Vec::new(); nb];
    for (bi, seed) in seeds.iter_mut().enumerate() {
        let mut avail = sets.livein[bi].clone();
        avail.intersect_with(&sets.reachin[bi]);
        avail.subtract(&sets.mism_in[bi]);
        for i in avail.iter() {
            seed.push(all[i].1.clone());
        }
    }
    seeds
}

// ─── Driver ─────────────────────────────────────────────────────────────────

/// Run local propagation, the cross-block availability analysis, then local
/// propagation again seeded with the surviving entries.
pub fn run(shader: &mut Shader) -> bool {
    let devinfo = shader.devinfo;
    let mut progress = false;

    let mut block_out: Vec<Vec<AcpEntry>> = Vec::with_capacity(shader.cfg.blocks.len());
    for block in &mut shader.cfg.blocks {
        let mut acp = Acp::default();
        progress |= local_pass(&devinfo, block, &mut acp);
        block_out.push(acp.live_entries().cloned().collect());
    }

    if shader.cfg.blocks.len() > 1 {
        let seeds = global_dataflow(shader, &block_out);
        for block in &mut shader.cfg.blocks {
            let mut acp = Acp::default();
            for entry in &seeds[block.id.index()] {
                acp.add(entry.clone());
            }
            progress |= local_pass(&devinfo, block, &mut acp);
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
    use crate::shader::VgrfAlloc;

    fn compile(vgrf: VgrfAlloc, insts: Vec<Instruction>) -> Shader {
        Shader::new(DevInfo::default(), 8, vgrf, insts)
    }

    fn vf(nr: u32) -> Operand {
        Operand::vgrf(nr, ScalarType::F)
    }

    #[test]
    fn constant_propagates_into_add() {
        let mut vgrf = VgrfAlloc::new();
        let t = vgrf.alloc(1);
        let x = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = vec![
            Instruction::mov(8, vf(t), Operand::imm_f(2.0)),
            Instruction::alu2(Opcode::Add, 8, vf(d), vf(x), vf(t)),
        ];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        let add = &shader.cfg.blocks[0].insts[1];
        assert!(add.src[1].is_imm());
        assert_eq!(add.src[1].bits, 2f32.to_bits() as u64);
    }

    #[test]
    fn constant_into_first_slot_of_commutative_op_swaps() {
        let mut vgrf = VgrfAlloc::new();
        let t = vgrf.alloc(1);
        let x = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = vec![
            Instruction::mov(8, vf(t), Operand::imm_f(4.0)),
            Instruction::alu2(Opcode::Mul, 8, vf(d), vf(t), vf(x)),
        ];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        let mul = &shader.cfg.blocks[0].insts[1];
        assert_eq!(mul.src[0].file, RegFile::Vgrf, "register moved to slot 0");
        assert!(mul.src[1].is_imm(), "immediate must sit in slot 1");
    }

    #[test]
    fn immediate_never_lands_in_a_shift_count_position() {
        let mut vgrf = VgrfAlloc::new();
        let t = vgrf.alloc(1);
        let x = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = vec![
            Instruction::mov(
                8,
                Operand::vgrf(t, ScalarType::UD),
                Operand::imm_ud(3),
            ),
            Instruction::alu2(
                Opcode::Shl,
                8,
                Operand::vgrf(d, ScalarType::UD),
                Operand::vgrf(t, ScalarType::UD),
                Operand::vgrf(x, ScalarType::UD),
            ),
        ];
        let mut shader = compile(vgrf, insts);

        run(&mut shader);
        let shl = &shader.cfg.blocks[0].insts[1];
        assert_eq!(shl.src[0].file, RegFile::Vgrf, "shifted value cannot be imm");
    }

    #[test]
    fn register_copy_propagates_with_modifier_composition() {
        let mut vgrf = VgrfAlloc::new();
        let x = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let mut mov = Instruction::mov(8, vf(t), vf(x));
        mov.src[0].negate = true;
        let mut add = Instruction::alu2(Opcode::Add, 8, vf(d), vf(t), vf(x));
        add.src[0].negate = true;
        let insts = vec![mov, add];
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        let add = &shader.cfg.blocks[0].insts[1];
        assert_eq!(add.src[0].nr, x);
        assert!(!add.src[0].negate, "two negations cancel");
    }

    #[test]
    fn partial_write_copies_are_not_propagated() {
        let mut vgrf = VgrfAlloc::new();
        let x = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let mut mov = Instruction::mov(8, vf(t), vf(x));
        mov.predicate = Pred::Normal;
        let insts = vec![mov, Instruction::alu2(Opcode::Add, 8, vf(d), vf(t), vf(x))];
        let mut shader = compile(vgrf, insts);

        run(&mut shader);
        let add = &shader.cfg.blocks[0].insts[1];
        assert_eq!(add.src[0].nr, t, "predicated copy must not propagate");
    }

    #[test]
    fn clobbered_source_kills_the_entry() {
        let mut vgrf = VgrfAlloc::new();
        let x = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = vec![
            Instruction::mov(8, vf(t), vf(x)),
            Instruction::mov(8, vf(x), Operand::imm_f(9.0)),
            Instruction::alu2(Opcode::Add, 8, vf(d), vf(t), vf(t)),
        ];
        let mut shader = compile(vgrf, insts);

        run(&mut shader);
        let add = &shader.cfg.blocks[0].insts[2];
        assert_eq!(add.src[0].nr, t, "x was overwritten between copy and use");
    }

    #[test]
    fn mod_propagation_into_logic_respects_generation() {
        for (r#gen, expect_propagated) in [(9, true), (12, false)] {
            let mut vgrf = VgrfAlloc::new();
            let x = vgrf.alloc(1);
            let t = vgrf.alloc(1);
            let d = vgrf.alloc(1);
            let mut mov = Instruction::mov(
                8,
                Operand::vgrf(t, ScalarType::UD),
                Operand::vgrf(x, ScalarType::UD),
            );
            mov.src[0].negate = true;
            let insts = vec![
                mov,
                Instruction::alu2(
                    Opcode::And,
                    8,
                    Operand::vgrf(d, ScalarType::UD),
                    Operand::vgrf(t, ScalarType::UD),
                    Operand::vgrf(x, ScalarType::UD),
                ),
            ];
            let mut shader = Shader::new(DevInfo::new(r#gen), 8, vgrf, insts);
            run(&mut shader);
            let and = &shader.cfg.blocks[0].insts[1];
            assert_eq!(
                and.src[0].nr == x,
                expect_propagated,
                "gen{gen} modifier-into-logic rule"
            );
        }
    }

    fn diamond(
        vgrf: &mut VgrfAlloc,
        then_insts: Vec<Instruction>,
        join_inst: Instruction,
        head: Vec<Instruction>,
    ) -> Vec<Instruction> {
        let mut if_inst = Instruction::new(Opcode::If, 8, Operand::null(), &[]);
        if_inst.predicate = Pred::Normal;
        let _ = vgrf;
        let mut insts = head;
        insts.push(if_inst);
        insts.extend(then_insts);
        insts.push(Instruction::new(Opcode::Endif, 8, Operand::null(), &[]));
        insts.push(join_inst);
        insts
    }

    #[test]
    fn copy_flows_across_blocks_when_no_path_kills_it() {
        let mut vgrf = VgrfAlloc::new();
        let x = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let u = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = diamond(
            &mut vgrf,
            vec![Instruction::mov(8, vf(u), Operand::imm_f(5.0))],
            Instruction::alu2(Opcode::Add, 8, vf(d), vf(t), vf(t)),
            vec![Instruction::mov(8, vf(t), vf(x))],
        );
        let mut shader = compile(vgrf, insts);

        assert!(run(&mut shader));
        let add = shader
            .cfg
            .iter_insts()
            .map(|(_, _, i)| i)
            .find(|i| i.opcode == Opcode::Add)
            .unwrap();
        assert_eq!(add.src[0].nr, x, "copy should survive the diamond");
    }

    #[test]
    fn copy_does_not_flow_when_one_path_overwrites_the_source() {
        let mut vgrf = VgrfAlloc::new();
        let x = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        let insts = diamond(
            &mut vgrf,
            vec![Instruction::mov(8, vf(x), Operand::imm_f(7.0))],
            Instruction::alu2(Opcode::Add, 8, vf(d), vf(t), vf(t)),
            vec![Instruction::mov(8, vf(t), vf(x))],
        );
        let mut shader = compile(vgrf, insts);

        run(&mut shader);
        let add = shader
            .cfg
            .iter_insts()
            .map(|(_, _, i)| i)
            .find(|i| i.opcode == Opcode::Add)
            .unwrap();
        assert_eq!(add.src[0].nr, t, "killed along the then-path");
    }

    #[test]
    fn exec_mask_mismatch_poisons_the_entry() {
        let mut vgrf = VgrfAlloc::new();
        let x = vgrf.alloc(1);
        let t = vgrf.alloc(1);
        let d = vgrf.alloc(1);
        // The then-path rewrites part of x with all lanes forced on, under
        // a different mask policy than the copy.
        let mut masked_write = Instruction::mov(8, vf(x), Operand::imm_f(3.0));
        masked_write.force_writemask_all = true;
        let insts = diamond(
            &mut vgrf,
            vec![masked_write],
            Instruction::alu2(Opcode::Add, 8, vf(d), vf(t), vf(t)),
            vec![Instruction::mov(8, vf(t), vf(x))],
        );
        let mut shader = compile(vgrf, insts);

        run(&mut shader);
        let add = shader
            .cfg
            .iter_insts()
            .map(|(_, _, i)| i)
            .find(|i| i.opcode == Opcode::Add)
            .unwrap();
        assert_eq!(add.src[0].nr, t);
    }
}
