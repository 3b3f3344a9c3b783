// The register allocator works one block at a time and assumes that every virtual register is
// born and dies inside the block that mentions it. This pass establishes that precondition.
// A virtual register is block-crossing when it is mentioned in more than one block, or when
// its first mention in its only block is a read (the value flows around a loop back edge).
// Each such register is given an 8-byte frame variable. Inside every block, the first read
// loads the variable into a fresh block-local register, later reads reuse that register,
// and every write goes to a fresh register followed by a store back to the variable. The
// frame variable is therefore the only carrier of the value across block boundaries, and
// the result is a method in which each block can be allocated independently.

//! Demotion of block-crossing virtual registers to frame variables.

use crate::ir::inst::RegRole;
use crate::ir::{Inst, MethodBody, Reg, ValueType, VarId, VReg};
use hashbrown::{HashMap, HashSet};

/// Virtual registers whose values cross a block boundary.
pub fn find_block_crossing(body: &MethodBody) -> Vec<VReg> {
    let mut home: HashMap<VReg, usize> = HashMap::new();
    let mut crossing: HashSet<VReg> = HashSet::new();
    for (bi, block) in body.blocks.iter().enumerate() {
        let mut defined: HashSet<VReg> = HashSet::new();
        for inst in &block.insts {
            for (reg, role) in inst.regs() {
                let Reg::Virt(v) = reg else { continue };
                match home.get(&v) {
                    Some(&b) if b != bi => {
                        crossing.insert(v);
                    }
                    Some(_) => {}
                    None => {
                        home.insert(v, bi);
                    }
                }
                match role {
                    RegRole::Use if !defined.contains(&v) => {
                        crossing.insert(v);
                    }
                    RegRole::Def => {
                        defined.insert(v);
                    }
                    RegRole::Use => {}
                }
            }
        }
    }
    let mut out: Vec<VReg> = crossing.into_iter().collect();
    out.sort();
    out
}

/// Rewrite `body` so that no virtual register is live across a block boundary.
/// Returns the number of demoted registers.
pub fn demote_block_crossing(body: &mut MethodBody) -> usize {
    let crossing = find_block_crossing(body);
    if crossing.is_empty() {
        return 0;
    }
    let mut vars: HashMap<VReg, VarId> = HashMap::new();
    for v in &crossing {
        let var = body.add_local(ValueType::I64);
        vars.insert(*v, var);
    }

    let mut next = body.next_vreg;
    for block in &mut body.blocks {
        let mut cached: HashMap<VReg, Reg> = HashMap::new();
        let insts = std::mem::take(&mut block.insts);
        let mut out = Vec::with_capacity(insts.len() * 2);
        for mut inst in insts {
            let mut loads = Vec::new();
            let mut stores = Vec::new();
            inst.for_each_reg_mut(|reg, role| {
                let Reg::Virt(v) = *reg else { return };
                let Some(&var) = vars.get(&v) else { return };
                match role {
                    RegRole::Use => {
                        let tmp = *cached.entry(v).or_insert_with(|| {
                            let t = Reg::Virt(VReg::new(next));
                            next += 1;
                            loads.push(Inst::LoadVar { dst: t, var });
                            t
                        });
                        *reg = tmp;
                    }
                    RegRole::Def => {
                        let t = Reg::Virt(VReg::new(next));
                        next += 1;
                        cached.insert(v, t);
                        stores.push(Inst::StoreVar { var, src: t });
                        *reg = t;
                    }
                }
            });
            out.extend(loads);
            out.push(inst);
            out.extend(stores);
        }
        block.insts = out;
    }
    body.next_vreg = next;
    body.sync_watermarks();
    log::debug!(
        "{}: demoted {} block-crossing registers",
        body.name,
        crossing.len()
    );
    crossing.len()
}
