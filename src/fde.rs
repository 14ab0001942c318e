//! The FDE/CIE driver: seeds a state record from the CIE's initial
//! instructions, refines it with the FDE's up to the target address, and
//! walks whole FDEs slice by slice for table consumers.

use tracing::debug;

use crate::accessors::Accessors;
use crate::addr_space::{AddressSpace, CieInfo, InfoFormat, ProcInfo};
use crate::arch;
use crate::cfi::run_cfi_program;
use crate::cursor::Cursor;
use crate::state::{RegisterSavedWhere, RegisterState, StateRecord, StateStack};
use crate::{DwarfError, Result};

/// Seed a fresh state record: every column SAME, the stack pointer
/// following the CFA where the target wants that, the CIE's initial
/// instructions applied and snapshotted for RESTORE opcodes.
pub(crate) fn setup_fde<A: Accessors>(acc: &A, dci: &CieInfo, sr: &mut StateRecord) -> Result<()> {
    *sr = StateRecord::default();
    for regnum in 0..arch::DWARF_NUM_PRESERVED_REGS + 2 {
        sr.current.set_reg(regnum, RegisterSavedWhere::Same, 0);
    }
    if arch::SP_DEFAULTS_TO_CFA {
        sr.current
            .set_reg(arch::DWARF_SP_COLUMN, RegisterSavedWhere::Cfa, 0);
    }
    sr.current.ret_addr_column = dci.ret_addr_column;

    let mut ip = 0;
    let mut addr = dci.cie_instr_start;
    let mut rs_stack = StateStack::new();
    run_cfi_program(
        acc,
        sr,
        &mut ip,
        u64::MAX,
        &mut addr,
        dci.cie_instr_end,
        &mut rs_stack,
        dci,
    )?;

    sr.initial = sr.current;
    Ok(())
}

/// Refine the seeded state with the FDE's instructions, stopping at the
/// target address (backed into the calling instruction for ordinary
/// frames, taken as-is for signal frames).
pub(crate) fn parse_fde<A: Accessors>(
    acc: &A,
    pi: &ProcInfo,
    dci: &CieInfo,
    target_ip: u64,
    use_prev_instr: bool,
    sr: &mut StateRecord,
) -> Result<()> {
    let mut ip = pi.start_ip;
    let mut addr = dci.fde_instr_start;
    let end_ip = target_ip.wrapping_sub(use_prev_instr as u64);
    let mut rs_stack = StateStack::new();
    run_cfi_program(
        acc,
        sr,
        &mut ip,
        end_ip,
        &mut addr,
        dci.fde_instr_end,
        &mut rs_stack,
        dci,
    )
}

pub(crate) fn create_state_record<A: Accessors>(
    acc: &A,
    pi: &ProcInfo,
    target_ip: u64,
    use_prev_instr: bool,
    sr: &mut StateRecord,
) -> Result<()> {
    match pi.format {
        InfoFormat::Table | InfoFormat::RemoteTable => {
            let dci = pi.unwind_info.as_ref().ok_or_else(|| {
                debug!("table-format proc-info without a table");
                DwarfError::MissingUnwindInfo
            })?;
            setup_fde(acc, dci, sr)?;
            parse_fde(acc, pi, dci, target_ip, use_prev_instr, sr)
        }
        InfoFormat::Dynamic => parse_dynamic(acc, pi, target_ip, sr),
    }
}

/// Dynamic unwind info is registered by JITs; its decoder lives outside
/// this engine.
fn parse_dynamic<A: Accessors>(
    _acc: &A,
    _pi: &ProcInfo,
    _target_ip: u64,
    _sr: &mut StateRecord,
) -> Result<()> {
    debug!("dynamic unwind info is not decoded here");
    Err(DwarfError::NoInfo)
}

pub(crate) fn reg_states_iterate<A, F>(sp: &AddressSpace<A>, c: &mut Cursor, f: F) -> Result<()>
where
    A: Accessors,
    F: FnMut(&RegisterState, u64, u64) -> bool,
{
    let mut pi = crate::step::fetch_proc_info(sp, c)?;
    let mut next_use_prev_instr = c.use_prev_instr;
    let ret = (|| match pi.format {
        InfoFormat::Table | InfoFormat::RemoteTable => {
            let dci = pi.unwind_info.as_ref().ok_or(DwarfError::MissingUnwindInfo)?;
            next_use_prev_instr = !dci.signal_frame;
            table_iterate(sp, &pi, dci, f)
        }
        InfoFormat::Dynamic => {
            debug!("dynamic unwind info is not decoded here");
            Err(DwarfError::NoInfo)
        }
    })();
    sp.provider.put(&mut pi);
    c.use_prev_instr = next_use_prev_instr;
    ret
}

/// Run the FDE from its start, yielding the state in force over each
/// `[prev_ip, curr_ip)` range as the location counter jumps, plus one
/// trailing slice to the end of the procedure.
fn table_iterate<A, F>(sp: &AddressSpace<A>, pi: &ProcInfo, dci: &CieInfo, mut f: F) -> Result<()>
where
    A: Accessors,
    F: FnMut(&RegisterState, u64, u64) -> bool,
{
    let acc = &sp.accessors;
    let mut sr = StateRecord::default();
    setup_fde(acc, dci, &mut sr)?;

    let mut curr_ip = pi.start_ip;
    let mut addr = dci.fde_instr_start;
    // One stack for the whole walk: remember/restore may span slices.
    let mut rs_stack = StateStack::new();
    while curr_ip < pi.end_ip && addr < dci.fde_instr_end {
        let prev_ip = curr_ip;
        run_cfi_program(
            acc,
            &mut sr,
            &mut curr_ip,
            prev_ip,
            &mut addr,
            dci.fde_instr_end,
            &mut rs_stack,
            dci,
        )?;
        if prev_ip < curr_ip && !f(&sr.current, prev_ip, curr_ip) {
            return Ok(());
        }
    }

    let final_ip = pi.last_ip.unwrap_or(pi.end_ip);
    if curr_ip < final_ip {
        f(&sr.current, curr_ip, final_ip);
    }
    Ok(())
}
