use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::consts::*;
use crate::{DwarfError, Result};

/// Byte order of the target address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Memory and register access for one address space.
///
/// `read_raw` and `read_reg` are the only required methods; the scalar,
/// LEB128 and encoded-pointer readers are assembled on top of them.
/// Readers taking `&mut u64` advance the address past what they consume.
pub trait Accessors {
    fn endianness(&self) -> Endianness;

    /// Fill `buf` from target memory starting at `addr`.
    fn read_raw(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Read a machine register of the target context.
    fn read_reg(&self, regnum: u16) -> Result<u64>;

    fn read_u8(&self, addr: &mut u64) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_raw(*addr, &mut buf)?;
        *addr += 1;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: &mut u64) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_raw(*addr, &mut buf)?;
        *addr += 2;
        Ok(match self.endianness() {
            Endianness::Little => LittleEndian::read_u16(&buf),
            Endianness::Big => BigEndian::read_u16(&buf),
        })
    }

    fn read_u32(&self, addr: &mut u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw(*addr, &mut buf)?;
        *addr += 4;
        Ok(match self.endianness() {
            Endianness::Little => LittleEndian::read_u32(&buf),
            Endianness::Big => BigEndian::read_u32(&buf),
        })
    }

    fn read_u64(&self, addr: &mut u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_raw(*addr, &mut buf)?;
        *addr += 8;
        Ok(match self.endianness() {
            Endianness::Little => LittleEndian::read_u64(&buf),
            Endianness::Big => BigEndian::read_u64(&buf),
        })
    }

    /// Read a full word at `addr` without advancing anything.
    fn read_word(&self, addr: u64) -> Result<u64> {
        let mut at = addr;
        self.read_u64(&mut at)
    }

    /// Read a ULEB128 into a 64-bit word.
    fn read_uleb128(&self, addr: &mut u64, end: u64) -> Result<u64> {
        let mut res = 0u64;
        let mut bit = 0u32;
        loop {
            if *addr == end {
                return Err(DwarfError::TruncatedLeb128(*addr));
            }
            let byte = self.read_u8(addr)?;
            let low = (byte & 0x7f) as u64;
            if bit >= 64 || low << bit >> bit != low {
                return Err(DwarfError::MalformedLeb128(*addr));
            }
            res |= low << bit;
            bit += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        Ok(res)
    }

    /// Read a SLEB128 into a 64-bit word.
    fn read_sleb128(&self, addr: &mut u64, end: u64) -> Result<i64> {
        let mut res = 0i64;
        let mut bit = 0u32;
        let mut byte;
        loop {
            if *addr == end {
                return Err(DwarfError::TruncatedLeb128(*addr));
            }
            byte = self.read_u8(addr)?;
            if bit >= 64 {
                return Err(DwarfError::MalformedLeb128(*addr));
            }
            res |= (((byte & 0x7f) as u64) << bit) as i64;
            bit += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        // Sign extend negative numbers.
        if (byte & 0x40) != 0 && bit < 64 {
            res |= (u64::MAX << bit) as i64;
        }
        Ok(res)
    }

    /// Read a pointer-encoded value. `datarel_base` is only consulted for
    /// the datarel base; passing 0 rejects datarel encodings.
    fn read_encoded_pointer(&self, addr: &mut u64, enc: u8, datarel_base: u64) -> Result<u64> {
        let base = match enc & 0x70 {
            DW_EH_PE_ABSPTR => 0,
            DW_EH_PE_PCREL => *addr,
            DW_EH_PE_DATAREL => {
                if datarel_base == 0 {
                    return Err(DwarfError::InvalidPointerEncoding(enc));
                }
                datarel_base
            }
            _ => return Err(DwarfError::InvalidPointerEncoding(enc)),
        };

        let mut res = match enc & 0x0f {
            DW_EH_PE_PTR => self.read_u64(addr)?.wrapping_add(base),
            DW_EH_PE_ULEB128 => self.read_uleb128(addr, u64::MAX)?.wrapping_add(base),
            DW_EH_PE_UDATA2 => (self.read_u16(addr)? as u64).wrapping_add(base),
            DW_EH_PE_UDATA4 => (self.read_u32(addr)? as u64).wrapping_add(base),
            DW_EH_PE_UDATA8 => self.read_u64(addr)?.wrapping_add(base),
            DW_EH_PE_SLEB128 => base.wrapping_add(self.read_sleb128(addr, u64::MAX)? as u64),
            DW_EH_PE_SDATA2 => base.wrapping_add(self.read_u16(addr)? as i16 as i64 as u64),
            DW_EH_PE_SDATA4 => base.wrapping_add(self.read_u32(addr)? as i32 as i64 as u64),
            DW_EH_PE_SDATA8 => base.wrapping_add(self.read_u64(addr)?),
            _ => return Err(DwarfError::InvalidPointerEncoding(enc)),
        };

        // Dereference the pointer if necessary.
        if enc & DW_EH_PE_INDIRECT != 0 {
            res = self.read_word(res)?;
        }
        Ok(res)
    }
}

/// Accessors for the calling process itself: plain loads through a
/// pointer. The caller vouches for address validity, as with any local
/// unwind.
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalAccessors;

impl Accessors for LocalAccessors {
    fn endianness(&self) -> Endianness {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    fn read_raw(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Live thread registers are the cursor-initialization layer's to
    /// capture; a local cursor carries memory and value locations.
    fn read_reg(&self, regnum: u16) -> Result<u64> {
        Err(DwarfError::InvalidRegisterNumber(regnum as u64))
    }
}
