//! Pseudo-instruction model for the mid-level backend.
//!
//! An [`Instruction`] is one pseudo-op: an opcode, a typed destination
//! operand, a variable-length list of typed source operands, an execution
//! width, and the predication/flag/saturate state that guards it. Operands
//! are plain values, copied freely; an instruction exclusively owns its
//! source list.
//!
//! Most of this module is derived-property queries: how many bytes an
//! operand contributes, which flag bytes an instruction touches, whether a
//! write covers its destination register completely. The optimization passes
//! are written entirely against these queries, never against raw opcode
//! numbers.

use std::fmt;

use smallvec::SmallVec;

use crate::devinfo::{DevInfo, REG_SIZE};

// ─── Scalar types ───────────────────────────────────────────────────────────

/// Scalar element type of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    /// Signed byte.
    B,
    /// Unsigned byte.
    UB,
    /// Signed word (16-bit).
    W,
    /// Unsigned word.
    UW,
    /// Signed doubleword (32-bit).
    D,
    /// Unsigned doubleword.
    UD,
    /// Signed quadword (64-bit).
    Q,
    /// Unsigned quadword.
    UQ,
    /// Half float.
    HF,
    /// Single float.
    F,
    /// Double float.
    DF,
}

impl ScalarType {
    /// Element size in bytes.
    pub fn size(self) -> u32 {
        match self {
            ScalarType::B | ScalarType::UB => 1,
            ScalarType::W | ScalarType::UW | ScalarType::HF => 2,
            ScalarType::D | ScalarType::UD | ScalarType::F => 4,
            ScalarType::Q | ScalarType::UQ | ScalarType::DF => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::HF | ScalarType::F | ScalarType::DF)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    pub fn is_signed_integer(self) -> bool {
        matches!(
            self,
            ScalarType::B | ScalarType::W | ScalarType::D | ScalarType::Q
        )
    }

    pub fn is_unsigned_integer(self) -> bool {
        matches!(
            self,
            ScalarType::UB | ScalarType::UW | ScalarType::UD | ScalarType::UQ
        )
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarType::B => "b",
            ScalarType::UB => "ub",
            ScalarType::W => "w",
            ScalarType::UW => "uw",
            ScalarType::D => "d",
            ScalarType::UD => "ud",
            ScalarType::Q => "q",
            ScalarType::UQ => "uq",
            ScalarType::HF => "hf",
            ScalarType::F => "f",
            ScalarType::DF => "df",
        };
        write!(f, "{s}")
    }
}

// ─── Register files ─────────────────────────────────────────────────────────

/// Architectural register selector within [`RegFile::Arch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchReg {
    /// Writes are discarded, reads are undefined.
    Null,
    /// The implicit accumulator.
    Accumulator,
    /// A flag register; the operand's `nr` selects which, its `offset`
    /// selects the 16-lane subregister in bytes.
    Flag,
    /// The indirect-addressing register.
    Address,
}

/// Storage class of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegFile {
    /// Default-constructed / unset.
    Bad,
    /// Compiler-managed virtual register; `nr` indexes the allocation table.
    Vgrf,
    /// A concrete hardware GRF.
    Fixed,
    /// Architectural register.
    Arch(ArchReg),
    /// Message register file (payload staging on older parts).
    Mrf,
    /// Immediate constant; payload in `bits`.
    Imm,
    /// Uniform (push-constant) slot; one value shared by all lanes.
    Uniform,
    /// Per-lane input attribute.
    Attr,
}

// ─── Operand ────────────────────────────────────────────────────────────────

/// One operand of an instruction.
///
/// A plain value: cloning an instruction deep-copies its operands and nothing
/// is shared. `offset` is a byte offset within the allocation; `stride` is an
/// element stride, so consecutive lanes read elements `stride` apart. The
/// hardware region descriptor for fixed and architectural registers is
/// derived by [`Operand::hw_region`] rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub file: RegFile,
    pub ty: ScalarType,
    pub nr: u32,
    pub offset: u32,
    pub stride: u8,
    pub negate: bool,
    pub abs: bool,
    /// Raw immediate payload, meaningful only when `file == Imm`.
    pub bits: u64,
}

impl Default for Operand {
    fn default() -> Self {
        Self {
            file: RegFile::Bad,
            ty: ScalarType::UD,
            nr: 0,
            offset: 0,
            stride: 0,
            negate: false,
            abs: false,
            bits: 0,
        }
    }
}

impl Operand {
    pub fn vgrf(nr: u32, ty: ScalarType) -> Self {
        Self {
            file: RegFile::Vgrf,
            ty,
            nr,
            stride: 1,
            ..Self::default()
        }
    }

    pub fn fixed_grf(nr: u32, ty: ScalarType) -> Self {
        Self {
            file: RegFile::Fixed,
            ty,
            nr,
            stride: 1,
            ..Self::default()
        }
    }

    pub fn uniform(nr: u32, ty: ScalarType) -> Self {
        Self {
            file: RegFile::Uniform,
            ty,
            nr,
            stride: 0,
            ..Self::default()
        }
    }

    pub fn attr(nr: u32, ty: ScalarType) -> Self {
        Self {
            file: RegFile::Attr,
            ty,
            nr,
            stride: 1,
            ..Self::default()
        }
    }

    pub fn null() -> Self {
        Self {
            file: RegFile::Arch(ArchReg::Null),
            ty: ScalarType::UD,
            ..Self::default()
        }
    }

    pub fn null_typed(ty: ScalarType) -> Self {
        Self {
            file: RegFile::Arch(ArchReg::Null),
            ty,
            ..Self::default()
        }
    }

    pub fn accumulator(ty: ScalarType) -> Self {
        Self {
            file: RegFile::Arch(ArchReg::Accumulator),
            ty,
            stride: 1,
            ..Self::default()
        }
    }

    pub fn flag(nr: u32, subnr: u32) -> Self {
        Self {
            file: RegFile::Arch(ArchReg::Flag),
            ty: ScalarType::UW,
            nr,
            offset: subnr * 2,
            ..Self::default()
        }
    }

    pub fn address() -> Self {
        Self {
            file: RegFile::Arch(ArchReg::Address),
            ty: ScalarType::UW,
            ..Self::default()
        }
    }

    // ── Immediates ──────────────────────────────────────────────────

    pub fn imm_f(v: f32) -> Self {
        Self {
            file: RegFile::Imm,
            ty: ScalarType::F,
            bits: v.to_bits() as u64,
            ..Self::default()
        }
    }

    pub fn imm_df(v: f64) -> Self {
        Self {
            file: RegFile::Imm,
            ty: ScalarType::DF,
            bits: v.to_bits(),
            ..Self::default()
        }
    }

    pub fn imm_d(v: i32) -> Self {
        Self {
            file: RegFile::Imm,
            ty: ScalarType::D,
            bits: v as u32 as u64,
            ..Self::default()
        }
    }

    pub fn imm_ud(v: u32) -> Self {
        Self {
            file: RegFile::Imm,
            ty: ScalarType::UD,
            bits: v as u64,
            ..Self::default()
        }
    }

    pub fn imm_w(v: i16) -> Self {
        Self {
            file: RegFile::Imm,
            ty: ScalarType::W,
            bits: v as u16 as u64,
            ..Self::default()
        }
    }

    pub fn imm_uw(v: u16) -> Self {
        Self {
            file: RegFile::Imm,
            ty: ScalarType::UW,
            bits: v as u64,
            ..Self::default()
        }
    }

    pub fn imm_uq(v: u64) -> Self {
        Self {
            file: RegFile::Imm,
            ty: ScalarType::UQ,
            bits: v,
            ..Self::default()
        }
    }

    // ── Derived views ───────────────────────────────────────────────

    /// Same storage reinterpreted at a different element type.
    pub fn retyped(mut self, ty: ScalarType) -> Self {
        self.ty = ty;
        self
    }

    /// Advance by a raw byte count.
    pub fn byte_offset(mut self, bytes: u32) -> Self {
        match self.file {
            RegFile::Imm | RegFile::Bad => {
                debug_assert_eq!(bytes, 0, "cannot offset an immediate");
            }
            _ => self.offset += bytes,
        }
        self
    }

    /// Advance by `lanes` logical lanes, following the stride.
    pub fn horiz_offset(self, lanes: u32) -> Self {
        let step = self.stride as u32 * self.ty.size();
        self.byte_offset(lanes * step)
    }

    /// Select a single component: offset to it and drop the stride so every
    /// lane reads the same element.
    pub fn component(mut self, c: u32) -> Self {
        self = self.horiz_offset(c);
        self.stride = 0;
        self
    }

    pub fn with_stride(mut self, stride: u8) -> Self {
        self.stride = stride;
        self
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn is_null(&self) -> bool {
        self.file == RegFile::Arch(ArchReg::Null)
    }

    pub fn is_accumulator(&self) -> bool {
        self.file == RegFile::Arch(ArchReg::Accumulator)
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == 1
    }

    /// Bytes occupied by one logical component at the given execution width.
    pub fn component_size(&self, exec_size: u8) -> u32 {
        let lanes = (exec_size as u32 * self.stride as u32).max(1);
        lanes * self.ty.size()
    }

    /// Canonical `(vstride, width, hstride)` region for fixed and
    /// architectural registers. The hardware encodes the addressing mode
    /// through this triple; what the passes track is only the element
    /// stride, so the descriptor is derived on demand, not stored.
    pub fn hw_region(&self, exec_size: u8) -> HwRegion {
        debug_assert!(matches!(self.file, RegFile::Fixed | RegFile::Arch(_)));
        if self.stride == 0 {
            HwRegion {
                vstride: 0,
                width: 1,
                hstride: 0,
            }
        } else {
            let width = exec_size.min(8);
            HwRegion {
                vstride: width * self.stride,
                width,
                hstride: self.stride,
            }
        }
    }

    // ── Immediate value queries ─────────────────────────────────────

    pub fn is_imm(&self) -> bool {
        self.file == RegFile::Imm
    }

    /// Whether this is an immediate equal to +0 (or integer 0).
    pub fn is_zero(&self) -> bool {
        self.is_imm()
            && match self.ty {
                ScalarType::F => self.bits as u32 == 0f32.to_bits(),
                ScalarType::DF => self.bits == 0f64.to_bits(),
                _ => self.bits == 0,
            }
    }

    /// Whether this is an immediate equal to 1.
    pub fn is_one(&self) -> bool {
        self.is_imm()
            && match self.ty {
                ScalarType::F => self.bits as u32 == 1f32.to_bits(),
                ScalarType::HF => self.bits as u16 == 0x3c00,
                ScalarType::DF => self.bits == 1f64.to_bits(),
                _ => self.bits == 1,
            }
    }

    /// Whether this is an immediate equal to -1 (all-ones for unsigned).
    pub fn is_negative_one(&self) -> bool {
        self.is_imm()
            && match self.ty {
                ScalarType::F => self.bits as u32 == (-1f32).to_bits(),
                ScalarType::DF => self.bits == (-1f64).to_bits(),
                ScalarType::HF => self.bits as u16 == 0xbc00,
                ScalarType::B | ScalarType::UB => self.bits as u8 == 0xff,
                ScalarType::W | ScalarType::UW => self.bits as u16 == 0xffff,
                ScalarType::D | ScalarType::UD => self.bits as u32 == 0xffff_ffff,
                ScalarType::Q | ScalarType::UQ => self.bits == u64::MAX,
            }
    }
}

/// Hardware addressing-mode descriptor for non-virtual registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwRegion {
    pub vstride: u8,
    pub width: u8,
    pub hstride: u8,
}

/// Whether two operands' byte ranges can touch the same storage.
///
/// `size_a`/`size_b` are the byte counts read or written through each
/// operand. Immediates and unset operands never overlap anything.
pub fn regions_overlap(a: &Operand, size_a: u32, b: &Operand, size_b: u32) -> bool {
    if a.file != b.file {
        return false;
    }
    match a.file {
        RegFile::Imm | RegFile::Bad => false,
        RegFile::Fixed => {
            // Fixed GRFs form one flat byte space; `nr` picks the register.
            let a0 = a.nr * REG_SIZE + a.offset;
            let b0 = b.nr * REG_SIZE + b.offset;
            a0 < b0 + size_b && b0 < a0 + size_a
        }
        _ => a.nr == b.nr && a.offset < b.offset + size_b && b.offset < a.offset + size_a,
    }
}

// ─── Predication and conditional modifiers ──────────────────────────────────

/// Per-lane execution guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pred {
    #[default]
    None,
    /// One flag bit per lane.
    Normal,
    /// Vertical predication: any bit set in each aligned group of 4.
    Any4h,
    /// Vertical predication: all bits set in each aligned group of 4.
    All4h,
}

/// Comparison writing the flag register as a side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CondMod {
    #[default]
    None,
    Z,
    Nz,
    G,
    Ge,
    L,
    Le,
}

// ─── Opcodes ────────────────────────────────────────────────────────────────

/// The closed opcode vocabulary.
///
/// Message-style ops (`SampleTex` through `Send`) stand for fixed-function
/// requests whose payload occupies a variable-length register block; most of
/// them are later lowered to raw `Send`s by the emission stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Removed instruction awaiting the compaction sweep.
    Nop,
    /// Marks a register range as deliberately undefined.
    Undef,

    // ── ALU ─────────────────────────────────────────────────────────
    Mov,
    Sel,
    Csel,
    Not,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Asr,
    Add,
    Avg,
    Mul,
    /// High-half multiply; implicitly writes the accumulator.
    Mach,
    Mad,
    Lrp,
    Frc,
    Rndd,
    Rnde,
    Cmp,
    Cmpn,

    // ── Control flow ────────────────────────────────────────────────
    If,
    Else,
    Endif,
    Do,
    While,
    Break,
    Continue,
    Halt,

    /// Concatenate sources into a contiguous destination block; the first
    /// `header_size` sources are whole-register header copies.
    LoadPayload,

    // ── Cross-lane ──────────────────────────────────────────────────
    /// Permute within aligned groups of four lanes; `src[1]` is the
    /// immediate swizzle selector.
    QuadSwizzle,
    /// Replicate the lane selected by `src[1]` across all lanes.
    Broadcast,
    /// Index of the first enabled lane, into a scalar destination.
    FindLiveChannel,

    /// Planar attribute interpolation: `src[0]` is a two-component
    /// barycentric pair, `src[1]` the attribute setup data.
    Pln,
    /// Gather through the address register; stricter contiguity rules than a
    /// plain `Mov`.
    MovIndirect,

    // ── Messages ────────────────────────────────────────────────────
    /// Texture sample. `src[0]` coordinates (component count in `src[2]`),
    /// `src[1]` surface/sampler descriptor, `src[2]` immediate component
    /// count. May return a trailing residency word.
    SampleTex,
    /// Render-target write. `src[0]` color payload (components in `src[2]`),
    /// `src[1]` header, `src[2]` immediate component count.
    FbWrite,
    /// Untyped memory read. `src[0]` address (dims in `src[2]`), `src[1]`
    /// surface, `src[2]` immediate address dims.
    MemoryLoad,
    /// Untyped memory write. `src[0]` address, `src[1]` surface, `src[2]`
    /// immediate address dims, `src[3]` data, `src[4]` immediate channels.
    MemoryStore,
    /// Untyped atomic; the return value is optional — a null destination is
    /// legal and cheaper.
    MemoryAtomic,
    /// Spill to scratch space.
    ScratchWrite,
    /// Fill from scratch space.
    ScratchRead,
    /// Memory fence.
    SendFence,
    /// Raw hardware send; payload lengths live in `mlen`/`ex_mlen`.
    Send,
}

impl Opcode {
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Opcode::If
                | Opcode::Else
                | Opcode::Endif
                | Opcode::Do
                | Opcode::While
                | Opcode::Break
                | Opcode::Continue
                | Opcode::Halt
        )
    }

    /// Message-style: payload in registers, handled by a fixed-function unit.
    pub fn is_send(self) -> bool {
        matches!(
            self,
            Opcode::SampleTex
                | Opcode::FbWrite
                | Opcode::MemoryLoad
                | Opcode::MemoryStore
                | Opcode::MemoryAtomic
                | Opcode::ScratchWrite
                | Opcode::ScratchRead
                | Opcode::SendFence
                | Opcode::Send
        )
    }

    /// Lowered to more than one hardware instruction by the emitter.
    pub fn is_virtual(self) -> bool {
        matches!(
            self,
            Opcode::LoadPayload
                | Opcode::QuadSwizzle
                | Opcode::Broadcast
                | Opcode::FindLiveChannel
                | Opcode::MovIndirect
        ) || (self.is_send() && self != Opcode::Send)
    }

    /// Whether swapping the first two sources preserves semantics.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Mul | Opcode::Avg | Opcode::And | Opcode::Or | Opcode::Xor
        )
    }
}

// ─── Instruction ────────────────────────────────────────────────────────────

/// Lanes covered by one flag-register byte.
const LANES_PER_FLAG_BYTE: u32 = 8;

/// One pseudo-instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dst: Operand,
    pub src: SmallVec<[Operand; 3]>,
    /// SIMD width; a power of two, never 0.
    pub exec_size: u8,
    /// First lane of the lane group this instruction covers.
    pub group: u8,
    /// Execute with all lanes enabled regardless of control flow.
    pub force_writemask_all: bool,
    pub predicate: Pred,
    pub predicate_inverse: bool,
    pub cmod: CondMod,
    pub flag_reg: u8,
    pub flag_subreg: u8,
    pub saturate: bool,
    /// End-of-thread marker; legal only on message opcodes.
    pub eot: bool,
    /// Message payload length in registers, send-style opcodes only.
    pub mlen: u8,
    pub ex_mlen: u8,
    /// Leading whole-register header sources of a `LoadPayload`.
    pub header_size: u8,
    /// Bytes written to `dst` per invocation; cached at construction.
    pub size_written: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, exec_size: u8, dst: Operand, sources: &[Operand]) -> Self {
        debug_assert!(exec_size > 0 && exec_size.is_power_of_two());
        debug_assert!(
            !matches!(dst.file, RegFile::Imm | RegFile::Uniform),
            "destination cannot be an immediate or uniform"
        );
        let mut inst = Self {
            opcode,
            dst,
            src: SmallVec::from_slice(sources),
            exec_size,
            group: 0,
            force_writemask_all: false,
            predicate: Pred::None,
            predicate_inverse: false,
            cmod: CondMod::None,
            flag_reg: 0,
            flag_subreg: 0,
            saturate: false,
            eot: false,
            mlen: 0,
            ex_mlen: 0,
            header_size: 0,
            size_written: 0,
        };
        inst.size_written = inst.dst.component_size(exec_size);
        inst
    }

    pub fn mov(exec_size: u8, dst: Operand, src: Operand) -> Self {
        Self::new(Opcode::Mov, exec_size, dst, &[src])
    }

    pub fn alu2(opcode: Opcode, exec_size: u8, dst: Operand, s0: Operand, s1: Operand) -> Self {
        Self::new(opcode, exec_size, dst, &[s0, s1])
    }

    pub fn alu3(
        opcode: Opcode,
        exec_size: u8,
        dst: Operand,
        s0: Operand,
        s1: Operand,
        s2: Operand,
    ) -> Self {
        Self::new(opcode, exec_size, dst, &[s0, s1, s2])
    }

    /// Grow or shrink the source list to exactly `n` slots.
    ///
    /// The first `min(old, n)` operands are preserved; new slots are unset.
    /// The inline capacity keeps the historical three-slot floor without a
    /// heap allocation.
    pub fn resize_sources(&mut self, n: usize) {
        self.src.resize(n, Operand::default());
    }

    /// Number of source operands.
    pub fn sources(&self) -> usize {
        self.src.len()
    }

    // ── Classification ──────────────────────────────────────────────

    pub fn is_control_flow(&self) -> bool {
        self.opcode.is_control_flow()
    }

    pub fn is_send(&self) -> bool {
        self.opcode.is_send()
    }

    /// Whether removing this instruction could change observable behavior
    /// even if its destination is never read.
    pub fn has_side_effects(&self) -> bool {
        self.eot
            || matches!(
                self.opcode,
                Opcode::FbWrite
                    | Opcode::MemoryStore
                    | Opcode::MemoryAtomic
                    | Opcode::ScratchWrite
                    | Opcode::SendFence
                    | Opcode::Send
            )
    }

    /// A plain full-width copy with no modifiers and no guard: the only shape
    /// the propagation and coalescing passes treat as a pure copy.
    pub fn is_raw_move(&self) -> bool {
        self.opcode == Opcode::Mov
            && self.predicate == Pred::None
            && self.cmod == CondMod::None
            && !self.saturate
            && !self.src[0].negate
            && !self.src[0].abs
            && self.src[0].ty == self.dst.ty
    }

    /// Whether the write may leave part of the destination register
    /// untouched.
    ///
    /// Message opcodes always count as partial, the explicit-undefine marker
    /// never does; both by definition rather than inspection.
    pub fn is_partial_write(&self) -> bool {
        if self.opcode == Opcode::Undef {
            return false;
        }
        if self.is_send() {
            return true;
        }
        (self.predicate != Pred::None && self.opcode != Opcode::Sel)
            || self.dst.offset % REG_SIZE != 0
            || self.size_written < REG_SIZE
            || !self.dst.is_contiguous()
    }

    // ── Read/write extents ──────────────────────────────────────────

    /// Logical vector components contributed by source `i`.
    pub fn components_read(&self, i: usize) -> u32 {
        match self.opcode {
            Opcode::Pln if i == 0 => 2,
            Opcode::SampleTex | Opcode::FbWrite if i == 0 => self.imm_component_count(2),
            Opcode::MemoryLoad | Opcode::MemoryStore | Opcode::MemoryAtomic if i == 0 => {
                self.imm_component_count(2)
            }
            Opcode::MemoryStore if i == 3 => self.imm_component_count(4),
            _ => 1,
        }
    }

    fn imm_component_count(&self, slot: usize) -> u32 {
        let op = &self.src[slot];
        debug_assert!(op.is_imm(), "component count operand must be an immediate");
        op.bits as u32
    }

    /// Bytes read from source `i` per invocation.
    pub fn size_read(&self, i: usize) -> u32 {
        match self.opcode {
            Opcode::Send if i == 0 => self.mlen as u32 * REG_SIZE,
            Opcode::Send if i == 1 => self.ex_mlen as u32 * REG_SIZE,
            Opcode::LoadPayload if i < self.header_size as usize => REG_SIZE,
            _ => match self.src[i].file {
                RegFile::Bad => 0,
                RegFile::Imm | RegFile::Uniform => self.src[i].ty.size(),
                RegFile::Mrf => {
                    panic!("size_read of a message register source outside a send")
                }
                _ => self.components_read(i) * self.src[i].component_size(self.exec_size),
            },
        }
    }

    /// Whole registers read through source `i`.
    pub fn regs_read(&self, i: usize) -> u32 {
        let size = self.size_read(i);
        if size == 0 {
            return 0;
        }
        (self.src[i].offset % REG_SIZE + size).div_ceil(REG_SIZE)
    }

    /// Whole registers written through the destination.
    pub fn regs_written(&self) -> u32 {
        if self.size_written == 0 {
            return 0;
        }
        (self.dst.offset % REG_SIZE + self.size_written).div_ceil(REG_SIZE)
    }

    // ── Flag tracking ───────────────────────────────────────────────

    /// Byte mask over the flag registers for this instruction's lane group.
    fn flag_mask(&self, lanes: u32) -> u8 {
        let start = self.flag_reg as u32 * 4
            + self.flag_subreg as u32 * 2
            + self.group as u32 / LANES_PER_FLAG_BYTE;
        let bytes = (lanes / LANES_PER_FLAG_BYTE).max(1);
        debug_assert!(start + bytes <= 8, "flag access past the register file");
        let mut mask = 0u8;
        for b in start..start + bytes {
            mask |= 1 << b;
        }
        mask
    }

    /// Flag bytes this instruction reads.
    pub fn flags_read(&self) -> u8 {
        match self.predicate {
            Pred::None => 0,
            // Vertical predication reads the whole 16-lane subregister
            // regardless of the lane group.
            Pred::Any4h | Pred::All4h => {
                let start = self.flag_reg as u32 * 4 + self.flag_subreg as u32 * 2;
                (1 << start) | (1 << (start + 1))
            }
            Pred::Normal => self.flag_mask(self.exec_size as u32),
        }
    }

    /// Flag bytes this instruction writes.
    pub fn flags_written(&self) -> u8 {
        // SEL/CSEL use the conditional modifier to pick, not to publish.
        let writes_flags = self.cmod != CondMod::None
            && !matches!(
                self.opcode,
                Opcode::Sel | Opcode::Csel | Opcode::FindLiveChannel
            );
        if writes_flags {
            self.flag_mask(self.exec_size as u32)
        } else {
            0
        }
    }

    /// Whether the opcode updates the accumulator as a side channel.
    pub fn writes_accumulator_implicitly(&self) -> bool {
        self.opcode == Opcode::Mach
    }

    // ── Hazards and legality ────────────────────────────────────────

    /// True when the multi-instruction expansion of this opcode could read a
    /// source after an earlier sub-instruction already overwrote it.
    pub fn has_source_and_destination_hazard(&self) -> bool {
        match self.opcode {
            Opcode::LoadPayload | Opcode::MovIndirect => true,
            Opcode::QuadSwizzle => {
                // Broadcast-one-lane swizzles expand to scalar-source moves
                // and cannot trample their own input.
                !matches!(self.src[1].bits, 0x00 | 0x55 | 0xaa | 0xff)
            }
            _ => {
                // Compressed execution writes two registers back to back; a
                // periodic or narrow integer source in the second half can be
                // clobbered by the first.
                self.size_written > REG_SIZE
                    && self.src.iter().any(|s| {
                        s.file == RegFile::Vgrf
                            && (s.stride == 0 || (s.ty.is_integer() && s.ty.size() < 4))
                    })
            }
        }
    }

    /// Whether negate/abs can be folded onto this instruction's sources.
    pub fn can_do_source_mods(&self, devinfo: &DevInfo) -> bool {
        match self.opcode {
            Opcode::Not | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr => {
                devinfo.logic_ops_take_source_mods()
            }
            Opcode::LoadPayload
            | Opcode::MovIndirect
            | Opcode::QuadSwizzle
            | Opcode::Broadcast
            | Opcode::FindLiveChannel
            | Opcode::Undef => false,
            op if op.is_send() => false,
            op if op.is_control_flow() => false,
            _ => true,
        }
    }

    /// Whether a conditional modifier can be attached.
    pub fn can_do_cmod(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Mov
                | Opcode::Not
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::Asr
                | Opcode::Add
                | Opcode::Mul
                | Opcode::Frc
                | Opcode::Rndd
                | Opcode::Rnde
        )
    }

    /// Whether the destination/source types may be rewritten wholesale, as
    /// copy propagation does when it retypes a raw move.
    pub fn can_change_types(&self) -> bool {
        match self.opcode {
            Opcode::Mov => !self.saturate,
            Opcode::Sel => {
                !self.saturate
                    && self.src[0].ty == self.src[1].ty
                    && !self.src[0].negate
                    && !self.src[1].negate
                    && !self.src[0].abs
                    && !self.src[1].abs
            }
            _ => false,
        }
    }

    /// Whether this instruction may be removed outright when its result is
    /// unread. Control flow and side effects are never eliminable.
    pub fn can_eliminate(&self) -> bool {
        !self.is_control_flow() && !self.has_side_effects() && self.opcode != Opcode::Nop
    }

    /// Whether redirecting the destination to the null register preserves
    /// semantics; the hardware requires a real destination for some opcodes.
    pub fn can_discard_destination(&self) -> bool {
        match self.opcode {
            // An atomic's return value is optional by contract.
            Opcode::MemoryAtomic => true,
            op if op.is_send() => false,
            op if op.is_control_flow() => false,
            Opcode::LoadPayload | Opcode::Undef | Opcode::Nop => false,
            _ => true,
        }
    }

    /// Replace this instruction with a `Nop`, to be swept by the next
    /// compaction pass. Never unlinks mid-iteration.
    pub fn remove(&mut self) {
        self.opcode = Opcode::Nop;
        self.dst = Operand::null();
        self.src.clear();
        self.predicate = Pred::None;
        self.predicate_inverse = false;
        self.cmod = CondMod::None;
        self.saturate = false;
        self.eot = false;
        self.mlen = 0;
        self.ex_mlen = 0;
        self.header_size = 0;
        self.size_written = 0;
    }
}

// ─── Display ────────────────────────────────────────────────────────────────

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.predicate != Pred::None {
            write!(
                f,
                "({}{:?}) ",
                if self.predicate_inverse { "-" } else { "+" },
                self.predicate
            )?;
        }
        write!(f, "{:?}({})", self.opcode, self.exec_size)?;
        if self.saturate {
            write!(f, ".sat")?;
        }
        if self.cmod != CondMod::None {
            write!(f, ".{:?}", self.cmod)?;
        }
        write!(f, " ")?;
        fmt_operand(f, &self.dst)?;
        for s in &self.src {
            write!(f, ", ")?;
            fmt_operand(f, s)?;
        }
        Ok(())
    }
}

fn fmt_operand(f: &mut fmt::Formatter<'_>, op: &Operand) -> fmt::Result {
    if op.negate {
        write!(f, "-")?;
    }
    if op.abs {
        write!(f, "|")?;
    }
    match op.file {
        RegFile::Bad => write!(f, "(bad)")?,
        RegFile::Vgrf => write!(f, "v{}+{}", op.nr, op.offset)?,
        RegFile::Fixed => write!(f, "g{}.{}", op.nr, op.offset)?,
        RegFile::Arch(ArchReg::Null) => write!(f, "null")?,
        RegFile::Arch(ArchReg::Accumulator) => write!(f, "acc")?,
        RegFile::Arch(ArchReg::Flag) => write!(f, "f{}.{}", op.nr, op.offset / 2)?,
        RegFile::Arch(ArchReg::Address) => write!(f, "a0")?,
        RegFile::Mrf => write!(f, "m{}", op.nr)?,
        RegFile::Imm => write!(f, "#{:#x}", op.bits)?,
        RegFile::Uniform => write!(f, "u{}", op.nr)?,
        RegFile::Attr => write!(f, "attr{}", op.nr)?,
    }
    write!(f, ":{}", op.ty)?;
    if op.abs {
        write!(f, "|")?;
    }
    Ok(())
}
