//! Mid-level backend of a shader compiler for a wide-SIMD GPU.
//!
//! The front-end hands over a flat pseudo-instruction list for one shader
//! stage at one dispatch width. This crate derives the control-flow graph,
//! runs a fixed-point pipeline of optimization passes (algebraic rewrites,
//! copy/constant propagation, dead-code elimination, saturate propagation,
//! register coalescing), lowers instructions to hardware-legal SIMD widths,
//! and drives register allocation through a list of scheduling heuristics.
//! The allocator itself and the final byte emission are external
//! collaborators behind in-process contracts.

use std::fmt;

pub mod algebraic;
pub mod bitset;
pub mod cfg;
pub mod coalesce;
pub mod copy_prop;
pub mod dce;
pub mod devinfo;
pub mod ir;
pub mod live_vars;
pub mod lower_simd;
pub mod optimize;
pub mod pressure;
pub mod regalloc;
pub mod saturate;
pub mod schedule;
pub mod shader;

pub use devinfo::DevInfo;
pub use ir::{CondMod, Instruction, Opcode, Operand, Pred, RegFile, ScalarType};
pub use regalloc::{AllocError, AllocOutcome, Allocator};
pub use shader::{Shader, VgrfAlloc};

/// A fatal, user-visible compilation failure for one shader-stage variant.
#[derive(Debug, Clone)]
pub struct CompileError {
    message: String,
}

impl CompileError {
    fn from_shader(shader: &Shader) -> Self {
        Self {
            message: shader
                .failure_message()
                .unwrap_or("unknown compile failure")
                .to_owned(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// Optimize, lower and allocate one shader.
///
/// On success the CFG is left in hardware-legal form with a concrete
/// register assignment for the emission stage to consume. On failure the
/// shader's sticky failure state carries the first diagnostic.
pub fn compile(
    shader: &mut Shader,
    allocator: &mut dyn Allocator,
) -> Result<AllocOutcome, CompileError> {
    optimize::run(shader);
    if shader.failed() {
        return Err(CompileError::from_shader(shader));
    }
    regalloc::assign_regs(shader, allocator).map_err(|_| CompileError::from_shader(shader))
}
