//! Live variable analysis.
//!
//! The unit of liveness is not a whole VGRF but each of its register-sized
//! slices (a "variable"): a 4-register VGRF contributes four variables, and
//! the VGRF's overall live range is the union of theirs. This is what lets
//! the coalescing and propagation passes reason about partial copies of
//! large registers.
//!
//! Three dataflow problems are solved over the CFG:
//!
//! 1. def/use per block (local scan),
//! 2. defin/defout — a forward union fixed point marking where a variable
//!    was possibly defined along some path, which screens spurious liveness
//!    off control paths that never defined it,
//! 3. livein/liveout — the usual backward fixed point, restricted by defin.
//!
//! The flag register gets the same treatment at byte granularity through a
//! plain `u8` mask per block.
//!
//! Results are monotonically widened, never narrowed, until a full
//! recompute; [`LiveVariables::validate`] asserts the invariant that every
//! variable's `[start, end]` covers every ip that touches it.

use crate::bitset::BitSet;
use crate::cfg::Cfg;
use crate::devinfo::REG_SIZE;
use crate::ir::{Operand, RegFile};
use crate::shader::VgrfAlloc;

/// Per-block dataflow sets.
#[derive(Debug, Clone)]
pub struct BlockLive {
    /// Variables fully defined in this block before any use in it.
    pub def: BitSet,
    /// Variables read in this block before any complete definition in it.
    pub uses: BitSet,
    /// Variables possibly defined along some path reaching block entry.
    pub defin: BitSet,
    /// Variables possibly defined at block exit.
    pub defout: BitSet,
    pub livein: BitSet,
    pub liveout: BitSet,
    pub flag_def: u8,
    pub flag_use: u8,
    pub flag_livein: u8,
    pub flag_liveout: u8,
}

impl BlockLive {
    fn new(num_vars: usize) -> Self {
        Self {
            def: BitSet::new(num_vars),
            uses: BitSet::new(num_vars),
            defin: BitSet::new(num_vars),
            defout: BitSet::new(num_vars),
            livein: BitSet::new(num_vars),
            liveout: BitSet::new(num_vars),
            flag_def: 0,
            flag_use: 0,
            flag_livein: 0,
            flag_liveout: 0,
        }
    }
}

/// The analysis result.
#[derive(Debug, Clone)]
pub struct LiveVariables {
    pub num_vars: usize,
    var_from_vgrf: Vec<u32>,
    /// First ip at which each variable is live.
    pub start: Vec<i32>,
    /// Last ip at which each variable is live.
    pub end: Vec<i32>,
    /// Union range per whole VGRF.
    pub vgrf_start: Vec<i32>,
    pub vgrf_end: Vec<i32>,
    pub block_data: Vec<BlockLive>,
}

impl LiveVariables {
    /// Variable indices covered by a VGRF operand touching `size` bytes.
    pub fn var_range(&self, op: &Operand, size: u32) -> std::ops::Range<usize> {
        debug_assert_eq!(op.file, RegFile::Vgrf);
        debug_assert!(size > 0);
        let base = self.var_from_vgrf[op.nr as usize] as usize;
        let first = (op.offset / REG_SIZE) as usize;
        let last = ((op.offset + size - 1) / REG_SIZE) as usize;
        base + first..base + last + 1
    }

    /// First variable index of a whole VGRF.
    pub fn vgrf_var(&self, nr: u32) -> usize {
        self.var_from_vgrf[nr as usize] as usize
    }

    pub fn compute(cfg: &Cfg, vgrf: &VgrfAlloc) -> Self {
        let mut var_from_vgrf = Vec::with_capacity(vgrf.count() as usize);
        let mut num_vars = 0u32;
        for nr in 0..vgrf.count() {
            var_from_vgrf.push(num_vars);
            num_vars += vgrf.size(nr);
        }
        let num_vars = num_vars as usize;

        let mut lv = Self {
            num_vars,
            var_from_vgrf,
            start: vec![i32::MAX; num_vars],
            end: vec![-1; num_vars],
            vgrf_start: vec![i32::MAX; vgrf.count() as usize],
            vgrf_end: vec![-1; vgrf.count() as usize],
            block_data: cfg.blocks.iter().map(|_| BlockLive::new(num_vars)).collect(),
        };

        lv.setup_def_use(cfg);
        lv.propagate_defin_defout(cfg);
        lv.propagate_livein_liveout(cfg);
        lv.widen_to_block_boundaries(cfg);
        lv.compute_vgrf_ranges(vgrf);
        lv
    }

    fn widen(&mut self, var: usize, ip: i32) {
        self.start[var] = self.start[var].min(ip);
        self.end[var] = self.end[var].max(ip);
    }

    fn setup_def_use(&mut self, cfg: &Cfg) {
        for block in &cfg.blocks {
            for (i, inst) in block.insts.iter().enumerate() {
                let ip = (block.start_ip + i) as i32;

                for s in 0..inst.sources() {
                    if inst.src[s].file != RegFile::Vgrf {
                        continue;
                    }
                    let size = inst.size_read(s);
                    if size == 0 {
                        continue;
                    }
                    let range = self.var_range(&inst.src[s], size);
                    let bd = &mut self.block_data[block.id.index()];
                    for var in range.clone() {
                        if !bd.def.contains(var) {
                            bd.uses.insert(var);
                        }
                    }
                    for var in range {
                        self.widen(var, ip);
                    }
                }

                let bd = &mut self.block_data[block.id.index()];
                bd.flag_use |= inst.flags_read() & !bd.flag_def;

                if inst.dst.file == RegFile::Vgrf && inst.size_written > 0 {
                    let range = self.var_range(&inst.dst, inst.size_written);
                    let partial = inst.is_partial_write();
                    let bd = &mut self.block_data[block.id.index()];
                    for var in range.clone() {
                        bd.defout.insert(var);
                        if !bd.uses.contains(var) && !partial {
                            bd.def.insert(var);
                        }
                    }
                    for var in range {
                        self.widen(var, ip);
                    }
                }

                let bd = &mut self.block_data[block.id.index()];
                bd.flag_def |= inst.flags_written() & !bd.flag_use;
            }
        }
    }

    /// Forward union fixed point: a variable is possibly-defined at a point
    /// if some path from the entry defined it.
    fn propagate_defin_defout(&mut self, cfg: &Cfg) {
        loop {
            let mut changed = false;
            for block in &cfg.blocks {
                let bi = block.id.index();
                let defin = self.block_data[bi].defin.clone();
                changed |= self.block_data[bi].defout.union_with(&defin);
                let defout = self.block_data[bi].defout.clone();
                for succ in &block.succs {
                    changed |= self.block_data[succ.index()].defin.union_with(&defout);
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Backward fixed point, restricted by defin so a variable is never
    /// considered live along a path where it was never defined.
    fn propagate_livein_liveout(&mut self, cfg: &Cfg) {
        loop {
            let mut changed = false;
            for block in cfg.blocks.iter().rev() {
                let bi = block.id.index();

                let mut out = BitSet::new(self.num_vars);
                let mut flag_out = 0u8;
                for succ in &block.succs {
                    let sd = &self.block_data[succ.index()];
                    let mut reachable = sd.livein.clone();
                    reachable.intersect_with(&sd.defin);
                    out.union_with(&reachable);
                    flag_out |= sd.flag_livein;
                }

                let bd = &self.block_data[bi];
                let mut inn = out.clone();
                inn.subtract(&bd.def);
                inn.union_with(&bd.uses);
                let flag_in = bd.flag_use | (flag_out & !bd.flag_def);

                let bd = &mut self.block_data[bi];
                if out != bd.liveout
                    || inn != bd.livein
                    || flag_out != bd.flag_liveout
                    || flag_in != bd.flag_livein
                {
                    bd.liveout = out;
                    bd.livein = inn;
                    bd.flag_liveout = flag_out;
                    bd.flag_livein = flag_in;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// A variable live across a block edge covers the boundary ips.
    fn widen_to_block_boundaries(&mut self, cfg: &Cfg) {
        for block in &cfg.blocks {
            if block.insts.is_empty() {
                continue;
            }
            let first_ip = block.start_ip as i32;
            let last_ip = (block.end_ip() - 1) as i32;
            let bd = &self.block_data[block.id.index()];
            let livein: Vec<usize> = bd.livein.iter().collect();
            let liveout: Vec<usize> = bd.liveout.iter().collect();
            for var in livein {
                self.widen(var, first_ip);
            }
            for var in liveout {
                self.widen(var, last_ip);
            }
        }
    }

    fn compute_vgrf_ranges(&mut self, vgrf: &VgrfAlloc) {
        for nr in 0..vgrf.count() {
            let base = self.var_from_vgrf[nr as usize] as usize;
            for var in base..base + vgrf.size(nr) as usize {
                self.vgrf_start[nr as usize] = self.vgrf_start[nr as usize].min(self.start[var]);
                self.vgrf_end[nr as usize] = self.vgrf_end[nr as usize].max(self.end[var]);
            }
        }
    }

    /// Assert that every register read or written at ip `i` has a live range
    /// covering `i`. Called after analysis-invalidating passes in debug
    /// builds.
    pub fn validate(&self, cfg: &Cfg, vgrf: &VgrfAlloc) {
        let _ = vgrf;
        for (ip, _, inst) in cfg.iter_insts() {
            let ip = ip as i32;
            if inst.dst.file == RegFile::Vgrf && inst.size_written > 0 {
                for var in self.var_range(&inst.dst, inst.size_written) {
                    assert!(
                        self.start[var] <= ip && ip <= self.end[var],
                        "write at ip {ip} outside live range [{}, {}] of v{}",
                        self.start[var],
                        self.end[var],
                        inst.dst.nr,
                    );
                }
            }
            for s in 0..inst.sources() {
                if inst.src[s].file != RegFile::Vgrf {
                    continue;
                }
                let size = inst.size_read(s);
                if size == 0 {
                    continue;
                }
                for var in self.var_range(&inst.src[s], size) {
                    assert!(
                        self.start[var] <= ip && ip <= self.end[var],
                        "read at ip {ip} outside live range [{}, {}] of v{}",
                        self.start[var],
                        self.end[var],
                        inst.src[s].nr,
                    );
                }
            }
        }
    }
}
