//! The CFI interpreter: executes a call-frame-instruction program
//! against a state record. See the DWARF spec, section 6.4.2, for the
//! opcode set.

use tracing::{debug, trace};

use crate::accessors::Accessors;
use crate::addr_space::CieInfo;
use crate::arch;
use crate::consts::*;
use crate::state::{RegisterSavedWhere, StateRecord, StateStack, CFA_OFF_COLUMN, CFA_REG_COLUMN};
use crate::{DwarfError, Result};

/// Read a ULEB128 register operand and validate it against the target's
/// preserved set.
fn read_regnum<A: Accessors>(acc: &A, addr: &mut u64, end: u64) -> Result<usize> {
    let regnum = acc.read_uleb128(addr, end)?;
    if regnum as usize >= arch::DWARF_NUM_PRESERVED_REGS {
        debug!("invalid register number {}", regnum);
        return Err(DwarfError::InvalidRegisterNumber(regnum));
    }
    Ok(regnum as usize)
}

/// Execute CFI instructions until the location counter passes `end_ip`
/// or the byte cursor reaches `end_addr`, whichever comes first.
///
/// An opcode sitting exactly at `ip == end_ip` still executes, so the
/// state at the target address itself is observable. The caller owns
/// `rs_stack` and empties it when the run is over.
pub(crate) fn run_cfi_program<A: Accessors>(
    acc: &A,
    sr: &mut StateRecord,
    ip: &mut u64,
    end_ip: u64,
    addr: &mut u64,
    end_addr: u64,
    rs_stack: &mut StateStack,
    dci: &CieInfo,
) -> Result<()> {
    while *ip <= end_ip && *addr < end_addr {
        let op = acc.read_u8(addr)?;
        let (op, operand) = if op & DW_CFA_OPCODE_MASK != 0 {
            (op & DW_CFA_OPCODE_MASK, op & DW_CFA_OPERAND_MASK)
        } else {
            (op, 0)
        };

        match op {
            DW_CFA_NOP => {}

            DW_CFA_ADVANCE_LOC => {
                *ip = ip.wrapping_add((operand as u64).wrapping_mul(dci.code_align));
                trace!("advance_loc to {:#x}", *ip);
            }

            DW_CFA_ADVANCE_LOC1 => {
                let delta = acc.read_u8(addr)? as u64;
                *ip = ip.wrapping_add(delta.wrapping_mul(dci.code_align));
                trace!("advance_loc1 to {:#x}", *ip);
            }

            DW_CFA_ADVANCE_LOC2 => {
                let delta = acc.read_u16(addr)? as u64;
                *ip = ip.wrapping_add(delta.wrapping_mul(dci.code_align));
                trace!("advance_loc2 to {:#x}", *ip);
            }

            DW_CFA_ADVANCE_LOC4 => {
                let delta = acc.read_u32(addr)? as u64;
                *ip = ip.wrapping_add(delta.wrapping_mul(dci.code_align));
                trace!("advance_loc4 to {:#x}", *ip);
            }

            // 64-bit location advances only exist in MIPS tables.
            DW_CFA_MIPS_ADVANCE_LOC8 => {
                debug!("DW_CFA_MIPS_advance_loc8 on a non-MIPS target");
                return Err(DwarfError::InvalidOpcode(op));
            }

            DW_CFA_SET_LOC => {
                *ip = acc.read_encoded_pointer(addr, dci.fde_encoding, 0)?;
                trace!("set_loc to {:#x}", *ip);
            }

            DW_CFA_OFFSET => {
                let regnum = operand as usize;
                if regnum >= arch::DWARF_NUM_PRESERVED_REGS {
                    debug!("invalid register number {} in DW_CFA_offset", regnum);
                    return Err(DwarfError::InvalidRegisterNumber(regnum as u64));
                }
                let offset = acc
                    .read_uleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align as u64);
                sr.current
                    .set_reg(regnum, RegisterSavedWhere::CfaRelative, offset);
                trace!("offset r{} at cfa{:+}", regnum, offset as i64);
            }

            DW_CFA_OFFSET_EXTENDED => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                let offset = acc
                    .read_uleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align as u64);
                sr.current
                    .set_reg(regnum, RegisterSavedWhere::CfaRelative, offset);
            }

            DW_CFA_OFFSET_EXTENDED_SF => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                let offset = acc
                    .read_sleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align) as u64;
                sr.current
                    .set_reg(regnum, RegisterSavedWhere::CfaRelative, offset);
            }

            DW_CFA_GNU_NEGATIVE_OFFSET_EXTENDED => {
                // Predates offset_extended_sf; emitted by old PowerPC
                // compilers with the offset's sign implied.
                let regnum = read_regnum(acc, addr, end_addr)?;
                let offset = acc
                    .read_uleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align as u64);
                sr.current.set_reg(
                    regnum,
                    RegisterSavedWhere::CfaRelative,
                    offset.wrapping_neg(),
                );
            }

            DW_CFA_RESTORE => {
                let regnum = operand as usize;
                if regnum >= arch::DWARF_NUM_PRESERVED_REGS {
                    debug!("invalid register number {} in DW_CFA_restore", regnum);
                    return Err(DwarfError::InvalidRegisterNumber(regnum as u64));
                }
                sr.current.regs[regnum] = sr.initial.regs[regnum];
                trace!("restore r{}", regnum);
            }

            DW_CFA_RESTORE_EXTENDED => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                sr.current.regs[regnum] = sr.initial.regs[regnum];
                trace!("restore_extended r{}", regnum);
            }

            DW_CFA_UNDEFINED => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                sr.current
                    .set_reg(regnum, RegisterSavedWhere::Undefined, 0);
            }

            DW_CFA_SAME_VALUE => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                sr.current.set_reg(regnum, RegisterSavedWhere::Same, 0);
            }

            DW_CFA_REGISTER => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                let src = read_regnum(acc, addr, end_addr)?;
                sr.current
                    .set_reg(regnum, RegisterSavedWhere::InRegister, src as u64);
                trace!("register r{} in r{}", regnum, src);
            }

            DW_CFA_REMEMBER_STATE => {
                rs_stack.push(sr.current)?;
                trace!("remember_state");
            }

            DW_CFA_RESTORE_STATE => {
                sr.current = rs_stack
                    .pop()
                    .ok_or(DwarfError::StateStackUnderflow)?;
                trace!("restore_state");
            }

            DW_CFA_DEF_CFA => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                let offset = acc.read_uleb128(addr, end_addr)?; // not factored
                sr.current
                    .set_reg(CFA_REG_COLUMN, RegisterSavedWhere::InRegister, regnum as u64);
                sr.current.regs[CFA_OFF_COLUMN].value = offset;
                trace!("def_cfa r{}+{:#x}", regnum, offset);
            }

            DW_CFA_DEF_CFA_SF => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                let offset = acc
                    .read_sleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align) as u64; // factored
                sr.current
                    .set_reg(CFA_REG_COLUMN, RegisterSavedWhere::InRegister, regnum as u64);
                sr.current.regs[CFA_OFF_COLUMN].value = offset;
            }

            DW_CFA_DEF_CFA_REGISTER => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                sr.current
                    .set_reg(CFA_REG_COLUMN, RegisterSavedWhere::InRegister, regnum as u64);
                trace!("def_cfa_register r{}", regnum);
            }

            DW_CFA_DEF_CFA_OFFSET => {
                sr.current.regs[CFA_OFF_COLUMN].value = acc.read_uleb128(addr, end_addr)?; // not factored
            }

            DW_CFA_DEF_CFA_OFFSET_SF => {
                sr.current.regs[CFA_OFF_COLUMN].value = acc
                    .read_sleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align) as u64; // factored
            }

            DW_CFA_DEF_CFA_EXPRESSION => {
                // Keep the address of the length-prefixed block for later
                // evaluation.
                sr.current
                    .set_reg(CFA_REG_COLUMN, RegisterSavedWhere::AtExpression, *addr);
                let len = acc.read_uleb128(addr, end_addr)?;
                *addr = addr.wrapping_add(len);
                trace!("def_cfa_expression, {} bytes", len);
            }

            DW_CFA_EXPRESSION => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                sr.current
                    .set_reg(regnum, RegisterSavedWhere::AtExpression, *addr);
                let len = acc.read_uleb128(addr, end_addr)?;
                *addr = addr.wrapping_add(len);
                trace!("expression r{}, {} bytes", regnum, len);
            }

            DW_CFA_VAL_EXPRESSION => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                sr.current
                    .set_reg(regnum, RegisterSavedWhere::IsExpression, *addr);
                let len = acc.read_uleb128(addr, end_addr)?;
                *addr = addr.wrapping_add(len);
                trace!("val_expression r{}, {} bytes", regnum, len);
            }

            DW_CFA_VAL_OFFSET => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                let offset = acc
                    .read_uleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align as u64);
                sr.current.set_reg(regnum, RegisterSavedWhere::Cfa, offset);
            }

            DW_CFA_VAL_OFFSET_SF => {
                let regnum = read_regnum(acc, addr, end_addr)?;
                let offset = acc
                    .read_sleb128(addr, end_addr)?
                    .wrapping_mul(dci.data_align) as u64;
                sr.current.set_reg(regnum, RegisterSavedWhere::Cfa, offset);
            }

            DW_CFA_GNU_ARGS_SIZE => {
                sr.args_size = acc.read_uleb128(addr, end_addr)?;
                trace!("args_size {}", sr.args_size);
            }

            DW_CFA_GNU_WINDOW_SAVE => window_save(sr)?,

            _ => {
                debug!("unexpected CFI opcode {:#04x}", op);
                return Err(DwarfError::InvalidOpcode(op));
            }
        }
    }
    Ok(())
}

/// All sixteen windowed registers spill to the register-save area at the
/// CFA.
#[cfg(target_arch = "sparc64")]
fn window_save(sr: &mut StateRecord) -> Result<()> {
    for regnum in 16..32usize {
        sr.current.set_reg(
            regnum,
            RegisterSavedWhere::CfaRelative,
            ((regnum - 16) * std::mem::size_of::<u64>()) as u64,
        );
    }
    trace!("window_save");
    Ok(())
}

/// The same opcode value is `DW_CFA_AARCH64_negate_ra_state` here:
/// toggle the return-address sign-state bit.
#[cfg(target_arch = "aarch64")]
fn window_save(sr: &mut StateRecord) -> Result<()> {
    let value = sr.current.regs[arch::RA_SIGN_STATE_COLUMN].value ^ 1;
    sr.current
        .set_reg(arch::RA_SIGN_STATE_COLUMN, RegisterSavedWhere::Same, value);
    trace!("negate_ra_state to {}", value);
    Ok(())
}

#[cfg(not(any(target_arch = "sparc64", target_arch = "aarch64")))]
fn window_save(_sr: &mut StateRecord) -> Result<()> {
    debug!("DW_CFA_GNU_window_save without register windows");
    Err(DwarfError::InvalidOpcode(DW_CFA_GNU_WINDOW_SAVE))
}
