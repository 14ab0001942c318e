use crate::cursor::Cursor;
use crate::state::RegisterState;
use crate::{DwarfError, Result};

/// DWARF columns preserved across calls: the g/o/l/i register windows.
pub const DWARF_NUM_PRESERVED_REGS: usize = 32;

/// DWARF column of the stack pointer (o6).
pub const DWARF_SP_COLUMN: usize = 14;

/// Seed the stack-pointer slot to the CFA until the CFI says otherwise.
pub const SP_DEFAULTS_TO_CFA: bool = true;

#[inline]
pub fn dwarf_to_unw_regnum(regnum: u64) -> Result<u16> {
    if (regnum as usize) < DWARF_NUM_PRESERVED_REGS {
        Ok(regnum as u16)
    } else {
        Err(DwarfError::InvalidRegisterNumber(regnum))
    }
}

#[inline]
pub fn is_fpreg(_regnum: u64) -> bool {
    false
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
