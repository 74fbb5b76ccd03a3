//! Hardware generation description.
//!
//! Everything generation-specific the passes need to know is a query on
//! [`DevInfo`]. Pass code never branches on a raw generation number; the
//! quirk lives here, named after what it allows or forbids.

/// One 32-byte general register file entry.
pub const REG_SIZE: u32 = 32;

/// Widest dispatch the execution units support.
pub const MAX_SIMD: u8 = 32;

/// Description of the target GPU generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevInfo {
    /// Generation number, 9 through 12.
    pub r#gen: u8,
    /// Number of physical GRFs available to one thread.
    pub grf_count: u16,
}

impl DevInfo {
    pub fn new(r#gen: u8) -> Self {
        assert!((9..=12).contains(&r#gen), "unsupported generation {gen}");
        Self {
            r#gen,
            grf_count: 128,
        }
    }

    /// Whether the ALUs have native 64-bit float/integer data paths.
    /// Without them, DF/Q/UQ moves and selects must be split into
    /// 32-bit-half operations.
    pub fn has_native_64bit(&self) -> bool {
        self.r#gen < 11
    }

    /// Whether bitwise logic ops accept negate/abs source modifiers.
    /// Later generations dropped them; propagating a modifier into AND/OR/XOR
    /// there would change semantics silently.
    pub fn logic_ops_take_source_mods(&self) -> bool {
        self.r#gen < 11
    }

    /// Widest execution size a sampler message payload can carry.
    pub fn max_sampler_simd(&self) -> u8 {
        16
    }

    /// Whether split render-target writes must be submitted in increasing
    /// lane-group order.
    pub fn needs_fb_write_ordering(&self) -> bool {
        self.r#gen >= 11
    }

    /// Widest execution size for typed memory messages.
    pub fn max_typed_memory_simd(&self) -> u8 {
        8
    }

    /// Registers at the top of the file reserved for thread-terminating
    /// message payloads. An EOT send's payload must be allocated at or above
    /// this register number.
    pub fn eot_payload_floor(&self) -> u32 {
        self.grf_count as u32 - 16
    }
}

impl Default for DevInfo {
    fn default() -> Self {
        Self::new(12)
    }
}
