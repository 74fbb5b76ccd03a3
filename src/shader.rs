//! Per-compilation context.
//!
//! One [`Shader`] value owns everything a single compilation touches: the
//! CFG, the virtual-register allocation table, the sticky failure state and
//! the cached analyses. Nothing here is shared between compilations; a
//! caller may compile several dispatch-width variants on separate threads
//! without synchronization.

use crate::cfg::{self, Cfg};
use crate::devinfo::{DevInfo, REG_SIZE};
use crate::ir::{Instruction, ScalarType};
use crate::live_vars::LiveVariables;
use crate::pressure::RegPressure;

// ─── Virtual register allocation table ──────────────────────────────────────

/// The size table for virtual registers: the sole arbiter of how many GRFs a
/// VGRF number occupies. Passes that split or merge registers go through
/// this table so number-to-size stays consistent program-wide.
#[derive(Debug, Clone, Default)]
pub struct VgrfAlloc {
    sizes: Vec<u32>,
}

impl VgrfAlloc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh VGRF spanning `regs` whole registers.
    pub fn alloc(&mut self, regs: u32) -> u32 {
        debug_assert!(regs > 0);
        let nr = self.sizes.len() as u32;
        self.sizes.push(regs);
        nr
    }

    /// Registers occupied by VGRF `nr`.
    pub fn size(&self, nr: u32) -> u32 {
        self.sizes[nr as usize]
    }

    pub fn count(&self) -> u32 {
        self.sizes.len() as u32
    }

    /// Sum of all allocation sizes, in registers.
    pub fn total_regs(&self) -> u32 {
        self.sizes.iter().sum()
    }
}

// ─── Analysis dependency classes ────────────────────────────────────────────

/// What a pass changed, for [`Shader::invalidate_analysis`]. Passes that
/// preserve a class simply leave its bit clear.
pub mod dep {
    /// Instruction identity changed: inserted, removed or reordered.
    pub const INSTRUCTIONS: u8 = 1 << 0;
    /// Data-flow-relevant operand content changed in place.
    pub const DATA_FLOW: u8 = 1 << 1;
    /// The set of virtual registers changed (split, merged, renumbered).
    pub const VARIABLES: u8 = 1 << 2;
    pub const ALL: u8 = INSTRUCTIONS | DATA_FLOW | VARIABLES;
}

// ─── Shader ─────────────────────────────────────────────────────────────────

/// One shader-stage variant being compiled at one dispatch width.
#[derive(Debug, Clone)]
pub struct Shader {
    pub devinfo: DevInfo,
    /// SIMD width of this compilation.
    pub dispatch_width: u8,
    /// Widest dispatch this shader may be compiled at; lowered by soft
    /// capability downgrades.
    pub max_dispatch_width: u8,
    pub cfg: Cfg,
    pub vgrf: VgrfAlloc,
    /// Registers holding the thread payload, live from program start.
    pub payload_regs: u32,
    failed: Option<String>,
    live: Option<LiveVariables>,
    pressure: Option<RegPressure>,
}

impl Shader {
    /// Build a compilation from a front-end instruction list.
    pub fn new(
        devinfo: DevInfo,
        dispatch_width: u8,
        vgrf: VgrfAlloc,
        insts: Vec<Instruction>,
    ) -> Self {
        Self {
            devinfo,
            dispatch_width,
            max_dispatch_width: crate::devinfo::MAX_SIMD,
            cfg: cfg::build(insts),
            vgrf,
            payload_regs: 0,
            failed: None,
            live: None,
            pressure: None,
        }
    }

    /// Allocate a temporary sized for `exec_size` lanes of `ty`, times
    /// `components`.
    pub fn alloc_temp(&mut self, exec_size: u8, ty: ScalarType, components: u32) -> u32 {
        let bytes = exec_size as u32 * ty.size() * components;
        self.vgrf.alloc(bytes.div_ceil(REG_SIZE))
    }

    // ── Failure ─────────────────────────────────────────────────────

    /// Record a fatal compile failure. Only the first message is retained;
    /// later passes are expected to no-op once this is set.
    pub fn fail(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.failed.is_none() {
            log::debug!("compile failed: {msg}");
            self.failed = Some(msg);
        }
    }

    pub fn failed(&self) -> bool {
        self.failed.is_some()
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    /// Record a soft capability downgrade: this shader must not be compiled
    /// wider than `width`. Not an error for the current compilation unless
    /// it is already wider.
    pub fn limit_dispatch_width(&mut self, width: u8, note: &str) {
        log::info!("performance: dispatch width limited to {width}: {note}");
        self.max_dispatch_width = self.max_dispatch_width.min(width);
        if self.dispatch_width > self.max_dispatch_width {
            self.fail(format!(
                "cannot satisfy SIMD{} dispatch: {note}",
                self.dispatch_width
            ));
        }
    }

    // ── Analyses ────────────────────────────────────────────────────

    /// Live variables, recomputed on demand after invalidation.
    ///
    /// Hands out a snapshot so passes can keep consulting it while they
    /// rewrite the CFG; a pass that changes anything it depends on must
    /// invalidate afterwards.
    pub fn live(&mut self) -> LiveVariables {
        if self.live.is_none() {
            self.live = Some(LiveVariables::compute(&self.cfg, &self.vgrf));
        }
        self.live.clone().unwrap()
    }

    /// Register pressure, derived from live variables on demand.
    pub fn pressure(&mut self) -> RegPressure {
        if self.pressure.is_none() {
            let live = self.live();
            self.pressure = Some(RegPressure::compute(
                &self.cfg,
                &self.vgrf,
                &live,
                self.payload_regs,
            ));
        }
        self.pressure.clone().unwrap()
    }

    /// Drop cached analyses invalidated by the given dependency classes.
    pub fn invalidate_analysis(&mut self, deps: u8) {
        if deps & dep::ALL != 0 {
            self.live = None;
            self.pressure = None;
        }
    }

    /// Debug-build validation of the live-range invariant; a no-op in
    /// release builds.
    pub fn validate_liveness(&mut self) {
        #[cfg(debug_assertions)]
        {
            let live = self.live();
            live.validate(&self.cfg, &self.vgrf);
        }
    }
}
