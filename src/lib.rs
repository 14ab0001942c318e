//! The core of a DWARF stack unwinder: the CFI interpreter, the
//! register-state records it produces, a bounded per-address-space cache
//! of those records, and the step function that applies a record to a
//! cursor to reach the caller's frame.
//!
//! Locating FDE/CIE entries, evaluating DWARF expressions and capturing
//! the first frame from a live context stay on the embedding's side of
//! the contract; they plug in through [`ProcInfoProvider`],
//! [`ExpressionEvaluator`] and the [`Accessors`] set.
//!
//! ```ignore
//! let space = AddressSpace::new(LocalAccessors, provider, CachingPolicy::Global);
//! let mut cursor = my_glue::cursor_from_context(&context);
//! while space.step(&mut cursor)? {
//!     println!("{:#x}", cursor.ip);
//! }
//! ```

mod accessors;
mod addr_space;
pub mod arch;
mod cache;
mod cfi;
pub mod consts;
mod cursor;
mod fde;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod ptrace;
mod state;
mod step;
#[cfg(test)]
pub(crate) mod test_support;

pub use accessors::{Accessors, Endianness, LocalAccessors};
pub use addr_space::{
    AddressSpace, CachingPolicy, CieInfo, ExprResult, ExpressionEvaluator, InfoFormat, ProcInfo,
    ProcInfoProvider,
};
pub use cursor::{Cursor, Location};
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use ptrace::PtraceAccessors;
pub use state::{
    RegisterSavedWhere, RegisterSlot, RegisterState, StateRecord, CFA_OFF_COLUMN, CFA_REG_COLUMN,
};

/// A result type that wraps [DwarfError].
pub type Result<T> = std::result::Result<T, DwarfError>;

/// Error definition.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DwarfError {
    #[error("invalid CFI opcode: {0:#04x}")]
    InvalidOpcode(u8),

    #[error("truncated LEB128 operand at {0:#x}")]
    TruncatedLeb128(u64),

    #[error("malformed LEB128 operand at {0:#x}")]
    MalformedLeb128(u64),

    #[error("invalid pointer encoding: {0:#04x}")]
    InvalidPointerEncoding(u8),

    #[error("unreadable address: {0:#x}")]
    UnreadableAddress(u64),

    #[error("invalid register number: {0}")]
    InvalidRegisterNumber(u64),

    #[error("register-state stack underflow")]
    StateStackUnderflow,

    #[error("register location is unrecoverable")]
    InvalidRegisterLocation,

    #[error("bad frame")]
    BadFrame,

    #[error("no unwind info covers the target address")]
    NoInfo,

    #[error("out of memory")]
    OutOfMemory,

    #[error("proc-info carries no unwind table")]
    MissingUnwindInfo,

    #[error("no expression evaluator installed")]
    NoEvaluator,
}
