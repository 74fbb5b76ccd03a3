//! Control-flow graph over the structured control-flow opcodes.
//!
//! The front-end hands us a flat instruction list whose control flow is
//! expressed with `If`/`Else`/`Endif` and `Do`/`While`/`Break`/`Continue`
//! markers. [`build`] derives basic blocks and their edges from those
//! markers; every pass iterates the result.
//!
//! Instructions carry no identity of their own — a dense "instruction
//! pointer" (block `start_ip` plus position) addresses them, and live ranges
//! are half-open ip intervals. Removal is two-phase: a pass rewrites the
//! opcode to `Nop`, and [`Cfg::compact`] sweeps the nops and renumbers the
//! ips afterwards. Nothing is unlinked mid-iteration.

use crate::ir::{Instruction, Opcode, Pred};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One basic block: a run of instructions with a single entry and exit.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub insts: Vec<Instruction>,
    /// Dense ip of the first instruction.
    pub start_ip: usize,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
}

impl Block {
    /// Dense ip just past the last instruction.
    pub fn end_ip(&self) -> usize {
        self.start_ip + self.insts.len()
    }
}

/// The whole program as basic blocks.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub blocks: Vec<Block>,
}

impl Cfg {
    pub fn num_insts(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    /// Iterate `(ip, block id, instruction)` over the whole program.
    pub fn iter_insts(&self) -> impl Iterator<Item = (usize, BlockId, &Instruction)> {
        self.blocks.iter().flat_map(|b| {
            b.insts
                .iter()
                .enumerate()
                .map(move |(i, inst)| (b.start_ip + i, b.id, inst))
        })
    }

    /// Drop every `Nop` and renumber the dense ips.
    ///
    /// Block structure and edges are unaffected: a nop is never a
    /// control-flow instruction, so no terminator disappears.
    pub fn compact(&mut self) {
        for block in &mut self.blocks {
            block.insts.retain(|inst| inst.opcode != Opcode::Nop);
        }
        self.renumber_ips();
    }

    pub(crate) fn renumber_ips(&mut self) {
        let mut ip = 0;
        for block in &mut self.blocks {
            block.start_ip = ip;
            ip += block.insts.len();
        }
    }
}

// ─── Construction ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct IfMatch {
    else_ip: Option<usize>,
    endif_ip: usize,
}

#[derive(Debug, Clone, Copy)]
struct LoopMatch {
    do_ip: usize,
    while_ip: usize,
}

/// Pair every structured marker with its partner in one scan.
fn match_control_flow(
    insts: &[Instruction],
) -> (Vec<Option<IfMatch>>, Vec<Option<LoopMatch>>) {
    let mut if_match = vec![None; insts.len()];
    let mut loop_match = vec![None; insts.len()];

    let mut if_stack: Vec<(usize, Option<usize>)> = Vec::new();
    let mut loop_stack: Vec<usize> = Vec::new();
    let mut pending_jumps: Vec<Vec<usize>> = Vec::new();

    for (ip, inst) in insts.iter().enumerate() {
        match inst.opcode {
            Opcode::If => if_stack.push((ip, None)),
            Opcode::Else => {
                let top = if_stack.last_mut().expect("ELSE without matching IF");
                assert!(top.1.is_none(), "double ELSE for one IF");
                top.1 = Some(ip);
            }
            Opcode::Endif => {
                let (if_ip, else_ip) = if_stack.pop().expect("ENDIF without matching IF");
                if_match[if_ip] = Some(IfMatch {
                    else_ip,
                    endif_ip: ip,
                });
                if let Some(else_ip) = else_ip {
                    if_match[else_ip] = if_match[if_ip];
                }
            }
            Opcode::Do => {
                loop_stack.push(ip);
                pending_jumps.push(Vec::new());
            }
            Opcode::Break | Opcode::Continue => {
                let jumps = pending_jumps
                    .last_mut()
                    .expect("BREAK/CONTINUE outside a loop");
                jumps.push(ip);
            }
            Opcode::While => {
                let do_ip = loop_stack.pop().expect("WHILE without matching DO");
                let m = LoopMatch { do_ip, while_ip: ip };
                loop_match[ip] = Some(m);
                loop_match[do_ip] = Some(m);
                for jump_ip in pending_jumps.pop().expect("loop stack out of sync") {
                    loop_match[jump_ip] = Some(m);
                }
            }
            _ => {}
        }
    }
    assert!(if_stack.is_empty(), "unterminated IF");
    assert!(loop_stack.is_empty(), "unterminated DO");

    (if_match, loop_match)
}

/// Derive the basic-block structure from a flat instruction list.
pub fn build(insts: Vec<Instruction>) -> Cfg {
    if insts.is_empty() {
        return Cfg {
            blocks: vec![Block {
                id: BlockId(0),
                insts: Vec::new(),
                start_ip: 0,
                preds: Vec::new(),
                succs: Vec::new(),
            }],
        };
    }

    let (if_match, loop_match) = match_control_flow(&insts);

    // Leaders: entry, both kinds of join point, and everything following a
    // branching marker.
    let mut leaders = vec![0usize];
    for (ip, inst) in insts.iter().enumerate() {
        match inst.opcode {
            Opcode::Endif | Opcode::Do => leaders.push(ip),
            Opcode::If
            | Opcode::Else
            | Opcode::While
            | Opcode::Break
            | Opcode::Continue
            | Opcode::Halt => {
                if ip + 1 < insts.len() {
                    leaders.push(ip + 1);
                }
            }
            _ => {}
        }
    }
    leaders.sort_unstable();
    leaders.dedup();

    let mut block_for_ip = vec![0usize; insts.len()];
    for bi in 0..leaders.len() {
        let start = leaders[bi];
        let end = leaders.get(bi + 1).copied().unwrap_or(insts.len());
        for slot in &mut block_for_ip[start..end] {
            *slot = bi;
        }
    }
    let block_of = |ip: usize| BlockId(block_for_ip[ip] as u32);

    let mut insts = insts;
    let mut blocks = Vec::with_capacity(leaders.len());
    for bi in (0..leaders.len()).rev() {
        let tail = insts.split_off(leaders[bi]);
        blocks.push(Block {
            id: BlockId(bi as u32),
            insts: tail,
            start_ip: 0,
            preds: Vec::new(),
            succs: Vec::new(),
        });
    }
    blocks.reverse();

    // Successor edges from each block's final instruction.
    for bi in 0..blocks.len() {
        let next = if bi + 1 < blocks.len() {
            Some(BlockId((bi + 1) as u32))
        } else {
            None
        };
        let last_ip = blocks[bi].insts.len() + leaders[bi] - 1;
        let mut succs = Vec::new();
        match blocks[bi].insts.last() {
            None => {
                if let Some(next) = next {
                    succs.push(next);
                }
            }
            Some(last) => match last.opcode {
                Opcode::If => {
                    let m = if_match[last_ip].expect("IF left unmatched");
                    // Then-branch falls through; else-branch enters either
                    // the ELSE successor block or the join at ENDIF.
                    succs.push(next.expect("IF cannot terminate the program"));
                    let else_target = match m.else_ip {
                        Some(else_ip) => block_of(else_ip + 1),
                        None => block_of(m.endif_ip),
                    };
                    succs.push(else_target);
                }
                Opcode::Else => {
                    let m = if_match[last_ip].expect("ELSE left unmatched");
                    succs.push(block_of(m.endif_ip));
                }
                Opcode::While => {
                    let m = loop_match[last_ip].expect("WHILE left unmatched");
                    succs.push(block_of(m.do_ip));
                    if let Some(next) = next {
                        succs.push(next);
                    }
                }
                Opcode::Break => {
                    let m = loop_match[last_ip].expect("BREAK left unmatched");
                    if m.while_ip + 1 < block_for_ip.len() {
                        succs.push(block_of(m.while_ip + 1));
                    }
                    if last.predicate != Pred::None
                        && let Some(next) = next
                    {
                        succs.push(next);
                    }
                }
                Opcode::Continue => {
                    let m = loop_match[last_ip].expect("CONTINUE left unmatched");
                    succs.push(block_of(m.while_ip));
                    if last.predicate != Pred::None
                        && let Some(next) = next
                    {
                        succs.push(next);
                    }
                }
                _ => {
                    if let Some(next) = next {
                        succs.push(next);
                    }
                }
            },
        }
        succs.dedup();
        blocks[bi].succs = succs;
    }

    for bi in 0..blocks.len() {
        for succ in blocks[bi].succs.clone() {
            blocks[succ.index()].preds.push(BlockId(bi as u32));
        }
    }

    let mut cfg = Cfg { blocks };
    cfg.renumber_ips();
    cfg
}
