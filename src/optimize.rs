//! The optimizer driver.
//!
//! Runs the semantics-preserving passes to a fixed point, lowers execution
//! widths to hardware bounds, then cleans up again. Every pass reports
//! whether it changed anything; the loop stops when a full round makes no
//! progress. Each round is logged so a failing shader can be diffed pass by
//! pass.

use crate::shader::Shader;
use crate::{algebraic, coalesce, copy_prop, dce, lower_simd, saturate};

/// Safety net; the passes reach their fixed point long before this.
const MAX_ROUNDS: u32 = 32;

fn pass(name: &str, shader: &mut Shader, f: fn(&mut Shader) -> bool) -> bool {
    if shader.failed() {
        return false;
    }
    let progress = f(shader);
    if progress {
        log::debug!("{name}: progress");
        shader.validate_liveness();
    }
    progress
}

fn cleanup_round(shader: &mut Shader) -> bool {
    let mut progress = false;
    progress |= pass("algebraic", shader, algebraic::run);
    progress |= pass("copy-prop", shader, copy_prop::run);
    progress |= pass("dce", shader, dce::run);
    progress |= pass("saturate-prop", shader, saturate::run);
    progress |= pass("register-coalesce", shader, coalesce::run);
    progress
}

/// Run the full optimization pipeline on one compilation.
pub fn run(shader: &mut Shader) {
    let mut rounds = 0;
    while cleanup_round(shader) {
        rounds += 1;
        if rounds >= MAX_ROUNDS {
            log::debug!("optimizer did not settle after {MAX_ROUNDS} rounds");
            break;
        }
    }

    // Width lowering synthesizes zip/unzip copies; give the cleanup passes
    // another go at them.
    if pass("lower-simd-width", shader, lower_simd::run) {
        let mut rounds = 0;
        while cleanup_round(shader) {
            rounds += 1;
            if rounds >= MAX_ROUNDS {
                break;
            }
        }
    }
}
