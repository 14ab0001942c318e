use smallvec::SmallVec;

use crate::arch;
use crate::{DwarfError, Result};

/// Two virtual columns past the preserved set hold the CFA rule, so one
/// array describes the whole frame. The interpreter writes them; the
/// apply step reads them.
pub const CFA_REG_COLUMN: usize = arch::DWARF_NUM_PRESERVED_REGS;
pub const CFA_OFF_COLUMN: usize = arch::DWARF_NUM_PRESERVED_REGS + 1;

const NUM_COLUMNS: usize = arch::DWARF_NUM_PRESERVED_REGS + 2;

/// Where a register's caller value lives, relative to the frame being
/// stepped out of.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum RegisterSavedWhere {
    /// No recoverable value.
    #[default]
    Undefined,
    /// Unchanged from the callee.
    Same,
    /// The value is the CFA plus a factored addend.
    Cfa,
    /// In memory at CFA plus a factored offset.
    CfaRelative,
    /// Held in another register, named by the payload.
    InRegister,
    /// In memory at the address computed by the DWARF expression whose
    /// length prefix starts at the payload.
    AtExpression,
    /// The value computed by that expression, not a memory address.
    IsExpression,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RegisterSlot {
    pub saved: RegisterSavedWhere,
    pub value: u64,
}

/// One complete recovery recipe for a PC: a rule for every register
/// column plus the column holding the return address. This is the unit
/// the cache stores.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterState {
    pub regs: [RegisterSlot; NUM_COLUMNS],
    pub ret_addr_column: usize,
}

impl Default for RegisterState {
    fn default() -> Self {
        Self {
            regs: [RegisterSlot::default(); NUM_COLUMNS],
            ret_addr_column: 0,
        }
    }
}

impl RegisterState {
    #[inline]
    pub(crate) fn set_reg(&mut self, regnum: usize, saved: RegisterSavedWhere, value: u64) {
        self.regs[regnum] = RegisterSlot { saved, value };
    }
}

/// The interpreter's working set: the state being mutated plus the
/// snapshot taken after the CIE's initial instructions, which RESTORE
/// opcodes copy back from.
#[derive(Debug, Default, Copy, Clone)]
pub struct StateRecord {
    pub current: RegisterState,
    pub initial: RegisterState,
    /// Callee-pushed argument bytes announced by `DW_CFA_GNU_args_size`.
    pub args_size: u64,
}

/// LIFO of `current` snapshots for remember/restore opcodes, backed by a
/// small inline pool. A push that must grow the pool reports failure
/// without disturbing the existing entries.
#[derive(Debug, Default)]
pub(crate) struct StateStack {
    states: SmallVec<[RegisterState; 2]>,
}

impl StateStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rs: RegisterState) -> Result<()> {
        if self.states.try_reserve(1).is_err() {
            return Err(DwarfError::OutOfMemory);
        }
        self.states.push(rs);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<RegisterState> {
        self.states.pop()
    }
}
