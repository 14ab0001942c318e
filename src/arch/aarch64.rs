use crate::cursor::Cursor;
use crate::state::RegisterState;
use crate::{DwarfError, Result};

/// DWARF columns preserved across calls: x0..x30, sp, the reserved and
/// sign-state columns, and v0..v31.
pub const DWARF_NUM_PRESERVED_REGS: usize = 97;

/// DWARF column of the stack pointer.
pub const DWARF_SP_COLUMN: usize = 31;

/// Seed the stack-pointer slot to the CFA until the CFI says otherwise.
pub const SP_DEFAULTS_TO_CFA: bool = true;

/// Column carrying the pointer-authentication sign state of the return
/// address, toggled by `DW_CFA_AARCH64_negate_ra_state`.
pub const RA_SIGN_STATE_COLUMN: usize = 34;

#[inline]
pub fn dwarf_to_unw_regnum(regnum: u64) -> Result<u16> {
    if (regnum as usize) < DWARF_NUM_PRESERVED_REGS {
        Ok(regnum as u16)
    } else {
        Err(DwarfError::InvalidRegisterNumber(regnum))
    }
}

#[inline]
pub fn is_fpreg(regnum: u64) -> bool {
    (64..=95).contains(&regnum)
}

/// Remove the pointer-authentication code from a signed return address.
/// The code occupies the bits above the 55-bit virtual address space.
#[inline]
pub fn strip_ptrauth(_c: &Cursor, ip: u64) -> u64 {
    ip & 0x007f_ffff_ffff_ffff
}

#[inline]
pub fn cache_frame(c: &Cursor) -> bool {
    c.is_signal_frame
}

#[inline]
pub fn reuse_frame(c: &mut Cursor, signal_frame: bool) {
    c.is_signal_frame = signal_frame;
}

#[inline]
pub fn stash_frame(_c: &mut Cursor, _rs: &RegisterState) {}
