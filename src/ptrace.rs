//! Accessors for a stopped child traced with `ptrace(2)`: the remote
//! counterpart of [`LocalAccessors`](crate::accessors::LocalAccessors).
//! Memory comes out a word at a time with `PTRACE_PEEKDATA`, registers
//! from the user area with `PTRACE_PEEKUSER`.

use crate::accessors::{Accessors, Endianness};
use crate::{DwarfError, Result};

/// Byte offsets of the DWARF-numbered registers inside the ptrace user
/// area (`struct user_regs_struct`): rax, rdx, rcx, rbx, rsi, rdi, rbp,
/// rsp, r8..r15, rip.
const REG_OFFSET: [u64; 17] = [
    80, 96, 88, 40, 104, 112, 32, 152, 72, 64, 56, 48, 24, 16, 8, 0, 128,
];

pub struct PtraceAccessors {
    pid: libc::pid_t,
}

impl PtraceAccessors {
    /// The caller owns the tracing relationship; `pid` must be attached
    /// and stopped whenever a read happens.
    pub fn new(pid: libc::pid_t) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// A peek returning -1 is ambiguous; errno tells it apart from real
    /// data.
    fn peek(&self, request: libc::c_uint, addr: u64) -> Result<u64> {
        unsafe {
            *libc::__errno_location() = 0;
            let word = libc::ptrace(
                request,
                self.pid,
                addr as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            );
            if *libc::__errno_location() != 0 {
                return Err(DwarfError::UnreadableAddress(addr));
            }
            Ok(word as u64)
        }
    }
}

impl Accessors for PtraceAccessors {
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn read_raw(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let at = addr + filled as u64;
            let word_addr = at & !7;
            let word = self.peek(libc::PTRACE_PEEKDATA, word_addr)?;
            let bytes = word.to_ne_bytes();
            let skip = (at - word_addr) as usize;
            let take = (8 - skip).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&bytes[skip..skip + take]);
            filled += take;
        }
        Ok(())
    }

    fn read_reg(&self, regnum: u16) -> Result<u64> {
        let offset = REG_OFFSET
            .get(regnum as usize)
            .copied()
            .ok_or(DwarfError::InvalidRegisterNumber(regnum as u64))?;
        self.peek(libc::PTRACE_PEEKUSER, offset)
    }
}
