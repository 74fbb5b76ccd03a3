//! Register pressure, derived from live variables.
//!
//! For every instruction index, the number of registers simultaneously live:
//! the sizes of all VGRFs whose range covers the ip, plus the payload
//! registers, which are live from program start until their last read.
//! Pure derived data — recomputed whenever live variables are invalidated
//! and pressure is queried again.

use crate::cfg::Cfg;
use crate::ir::RegFile;
use crate::live_vars::LiveVariables;
use crate::shader::VgrfAlloc;

#[derive(Debug, Clone)]
pub struct RegPressure {
    /// Live register count at each ip.
    pub regs_live_at_ip: Vec<u32>,
}

impl RegPressure {
    pub fn compute(
        cfg: &Cfg,
        vgrf: &VgrfAlloc,
        live: &LiveVariables,
        payload_regs: u32,
    ) -> Self {
        let num_insts = cfg.num_insts();
        let mut regs_live_at_ip = vec![0u32; num_insts];

        for nr in 0..vgrf.count() {
            let start = live.vgrf_start[nr as usize];
            let end = live.vgrf_end[nr as usize];
            if end < start {
                continue;
            }
            for ip in start..=end {
                regs_live_at_ip[ip as usize] += vgrf.size(nr);
            }
        }

        // Payload registers are implicitly defined at thread dispatch; they
        // stay live until the last instruction that reads a fixed GRF below
        // the payload boundary.
        if payload_regs > 0 {
            let mut last_payload_read = 0usize;
            for (ip, _, inst) in cfg.iter_insts() {
                let reads_payload = inst
                    .src
                    .iter()
                    .any(|s| s.file == RegFile::Fixed && s.nr < payload_regs);
                if reads_payload {
                    last_payload_read = ip;
                }
            }
            for slot in regs_live_at_ip.iter_mut().take(last_payload_read + 1) {
                *slot += payload_regs;
            }
        }

        Self { regs_live_at_ip }
    }

    /// The highest pressure anywhere in the program.
    pub fn peak(&self) -> u32 {
        self.regs_live_at_ip.iter().copied().max().unwrap_or(0)
    }
}
