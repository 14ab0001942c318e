use crate::cursor::Cursor;
use crate::state::RegisterState;
use crate::{DwarfError, Result};

/// DWARF columns preserved across calls: rax..r15 plus the return
/// address column.
pub const DWARF_NUM_PRESERVED_REGS: usize = 17;

/// DWARF column of the stack pointer (rsp).
pub const DWARF_SP_COLUMN: usize = 7;

/// Seed the stack-pointer slot to the CFA until the CFI says otherwise.
pub const SP_DEFAULTS_TO_CFA: bool = true;

/// Map a DWARF register number onto the accessor set's numbering; the
/// two coincide on x86_64.
#[inline]
pub fn dwarf_to_unw_regnum(regnum: u64) -> Result<u16> {
    if (regnum as usize) < DWARF_NUM_PRESERVED_REGS {
        Ok(regnum as u16)
    } else {
        Err(DwarfError::InvalidRegisterNumber(regnum))
    }
}

/// No floating-point column falls inside the preserved set.
#[inline]
pub fn is_fpreg(_regnum: u64) -> bool {
    false
}

/// Whether a fresh cache entry for this frame should carry the
/// signal-frame mark.
#[inline]
pub fn cache_frame(c: &Cursor) -> bool {
    c.is_signal_frame
}

/// Called when a cached state is reapplied to a new walk.
#[inline]
pub fn reuse_frame(c: &mut Cursor, signal_frame: bool) {
    c.is_signal_frame = signal_frame;
}

/// Called when a freshly computed state is about to be applied. x86_64
/// keeps no per-frame side state.
#[inline]
pub fn stash_frame(_c: &mut Cursor, _rs: &RegisterState) {}
