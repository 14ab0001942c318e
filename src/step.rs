//! The step engine: resolve a register state for the cursor's PC — from
//! the cache or by running the CFI — and apply it to produce the
//! caller's frame.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use crate::accessors::Accessors;
use crate::addr_space::{AddressSpace, ExprResult, ProcInfo};
use crate::arch;
use crate::cursor::{Cursor, Location};
use crate::fde::create_state_record;
use crate::state::{RegisterSavedWhere, RegisterState, StateRecord, CFA_OFF_COLUMN, CFA_REG_COLUMN};
use crate::{DwarfError, Result};

pub(crate) fn step<A: Accessors>(sp: &AddressSpace<A>, c: &mut Cursor) -> Result<bool> {
    let mut sr = StateRecord::default();
    find_reg_state(sp, c, &mut sr)?;
    apply_reg_state(sp, c, &sr.current)
}

/// Ask the provider about the right PC: backed into the call instruction
/// for ordinary frames, taken as-is when resuming past a signal frame.
pub(crate) fn fetch_proc_info<A: Accessors>(sp: &AddressSpace<A>, c: &Cursor) -> Result<ProcInfo> {
    let mut ip = c.ip;
    if c.use_prev_instr {
        ip = ip.wrapping_sub(1);
    }
    sp.provider.find(&sp.accessors, ip)
}

fn find_reg_state<A: Accessors>(
    sp: &AddressSpace<A>,
    c: &mut Cursor,
    sr: &mut StateRecord,
) -> Result<()> {
    let hit = sp
        .with_cache(|cache| {
            let index = cache.lookup(c.ip, c.hint)?;
            let link = cache.link(index);
            let found = (
                index,
                *cache.bucket(index),
                link.signal_frame,
                link.hint.load(Ordering::Relaxed),
            );
            cache.set_forward_hint(c.prev_rs, index);
            Some(found)
        })
        .flatten();

    if let Some((index, rs, signal_frame, hint)) = hit {
        trace!("cache hit for {:#x}", c.ip);
        sr.current = rs;
        c.use_prev_instr = !signal_frame;
        c.hint = hint;
        c.prev_rs = index;
        arch::reuse_frame(c, signal_frame);
        return Ok(());
    }

    // Compute. The cache lock is not held here: the provider and the
    // interpreter only touch this stack-local record.
    let mut pi = fetch_proc_info(sp, c)?;
    let mut next_use_prev_instr = c.use_prev_instr;
    let ret = (|| {
        if let Some(dci) = &pi.unwind_info {
            next_use_prev_instr = !dci.signal_frame;
            c.is_signal_frame = dci.signal_frame;
        }
        create_state_record(&sp.accessors, &pi, c.ip, c.use_prev_instr, sr)
    })();
    sp.provider.put(&mut pi);
    c.use_prev_instr = next_use_prev_instr;
    ret?;

    c.args_size = sr.args_size;

    let inserted = sp.with_cache(|cache| {
        let index = cache.insert(c.ip, arch::cache_frame(c));
        cache.set_bucket(index, &sr.current);
        cache.set_forward_hint(c.prev_rs, index);
        index
    });
    if let Some(index) = inserted {
        c.hint = 0;
        c.prev_rs = index;
    }
    arch::stash_frame(c, &sr.current);
    Ok(())
}

/// Read a register value through its location.
fn dwarf_get<A: Accessors>(acc: &A, loc: Location) -> Result<u64> {
    match loc {
        Location::Null => Err(DwarfError::InvalidRegisterLocation),
        Location::Register(regnum) => acc.read_reg(regnum),
        Location::Memory(addr) => acc.read_word(addr),
        Location::Value(value) => Ok(value),
    }
}

/// Decode the length prefix at `addr`, hand the block to the expression
/// VM and wrap its result as a location.
fn eval_location_expr<A: Accessors>(
    sp: &AddressSpace<A>,
    c: &Cursor,
    initial: u64,
    addr: u64,
) -> Result<Location> {
    let evaluator = sp.evaluator.as_deref().ok_or(DwarfError::NoEvaluator)?;
    let mut addr = addr;
    let len = sp.accessors.read_uleb128(&mut addr, u64::MAX)?;
    match evaluator.evaluate(&sp.accessors, c, initial, &mut addr, len)? {
        ExprResult::Register(regnum) => Ok(Location::Register(arch::dwarf_to_unw_regnum(regnum)?)),
        ExprResult::Address(a) => Ok(Location::Memory(a)),
    }
}

fn apply_reg_state<A: Accessors>(
    sp: &AddressSpace<A>,
    c: &mut Cursor,
    rs: &RegisterState,
) -> Result<bool> {
    // Corrupt CFI can point the return-address column anywhere; reject
    // it before it becomes an index.
    if rs.ret_addr_column >= arch::DWARF_NUM_PRESERVED_REGS {
        debug!("return-address column {} out of range", rs.ret_addr_column);
        return Err(DwarfError::BadFrame);
    }

    let prev_ip = c.ip;
    let prev_cfa = c.cfa;
    let acc = &sp.accessors;

    // The CFA comes first; expression rules below may refer to it.
    let cfa_slot = rs.regs[CFA_REG_COLUMN];
    let cfa = match cfa_slot.saved {
        RegisterSavedWhere::InRegister => {
            let regnum = cfa_slot.value as usize;
            // A leaf that never saved the stack pointer: popping the CFA
            // implicitly pops the SP, so the standing CFA is its value.
            let base = if regnum == arch::DWARF_SP_COLUMN && c.loc[arch::DWARF_SP_COLUMN].is_null()
            {
                c.cfa
            } else {
                if regnum >= arch::DWARF_NUM_PRESERVED_REGS {
                    return Err(DwarfError::InvalidRegisterNumber(cfa_slot.value));
                }
                dwarf_get(acc, c.loc[regnum])?
            };
            base.wrapping_add(rs.regs[CFA_OFF_COLUMN].value)
        }
        RegisterSavedWhere::AtExpression => {
            // The standard names no initial stack value for a CFA
            // expression; push a zero to keep the evaluator contract
            // uniform.
            match eval_location_expr(sp, c, 0, cfa_slot.value)? {
                Location::Memory(addr) => addr,
                _ => {
                    debug!("CFA expression produced a register location");
                    return Err(DwarfError::BadFrame);
                }
            }
        }
        _ => {
            debug!("no rule to compute the CFA");
            return Err(DwarfError::BadFrame);
        }
    };

    // New locations are computed into a shadow copy so cross-register
    // rules observe the pre-step frame, then committed at once.
    let mut new_loc = c.loc;
    for (regnum, slot) in rs
        .regs
        .iter()
        .take(arch::DWARF_NUM_PRESERVED_REGS)
        .enumerate()
    {
        match slot.saved {
            RegisterSavedWhere::Undefined => new_loc[regnum] = Location::Null,
            RegisterSavedWhere::Same => {}
            RegisterSavedWhere::Cfa => {
                new_loc[regnum] = Location::Value(cfa.wrapping_add(slot.value))
            }
            RegisterSavedWhere::CfaRelative => {
                new_loc[regnum] = Location::Memory(cfa.wrapping_add(slot.value))
            }
            RegisterSavedWhere::InRegister => {
                let src = slot.value as usize;
                if src >= arch::DWARF_NUM_PRESERVED_REGS {
                    return Err(DwarfError::InvalidRegisterNumber(slot.value));
                }
                new_loc[regnum] = new_loc[src];
            }
            RegisterSavedWhere::AtExpression => {
                // The standard puts the CFA on the expression stack.
                new_loc[regnum] = eval_location_expr(sp, c, cfa, slot.value)?;
            }
            RegisterSavedWhere::IsExpression => {
                let loc = eval_location_expr(sp, c, cfa, slot.value)?;
                new_loc[regnum] = Location::Value(loc.payload());
            }
        }
    }

    c.loc = new_loc;
    c.cfa = cfa;

    // An unrecoverable return address is how the outermost frame reads.
    if c.loc[rs.ret_addr_column].is_null() {
        c.ip = 0;
    } else {
        let ip = dwarf_get(acc, c.loc[rs.ret_addr_column])?;
        #[cfg(target_arch = "aarch64")]
        let ip = if rs.regs[arch::RA_SIGN_STATE_COLUMN].value != 0 {
            arch::strip_ptrauth(c, ip)
        } else {
            ip
        };
        c.ip = ip;
    }

    if c.ip == prev_ip && c.cfa == prev_cfa {
        debug!("ip and cfa unchanged, rejecting frame at {:#x}", c.ip);
        return Err(DwarfError::BadFrame);
    }

    Ok(c.ip != 0)
}
