//! Shared harness: scripted memory/registers, a canned proc-info
//! provider and a CFI program builder, all through the public API.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dwarf_unwind::consts::*;
use dwarf_unwind::{
    Accessors, AddressSpace, CachingPolicy, CieInfo, DwarfError, Endianness, InfoFormat, ProcInfo,
    ProcInfoProvider, Result,
};

pub const CIE_BASE: u64 = 0x1000;
pub const FDE_BASE: u64 = 0x2000;
pub const START_IP: u64 = 0x4000_0000;
pub const END_IP: u64 = START_IP + 0x100;

/// Used as the return-address column throughout; valid on every
/// supported target.
pub const RA_COLUMN: usize = 16;

pub struct MemAccessors {
    regions: Vec<(u64, Vec<u8>)>,
    regs: Vec<u64>,
    pub raw_reads: AtomicUsize,
    pub reg_reads: AtomicUsize,
}

impl MemAccessors {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            regs: vec![0; 128],
            raw_reads: AtomicUsize::new(0),
            reg_reads: AtomicUsize::new(0),
        }
    }

    pub fn with_region(mut self, base: u64, bytes: Vec<u8>) -> Self {
        self.regions.push((base, bytes));
        self
    }

    pub fn with_reg(mut self, regnum: u16, value: u64) -> Self {
        self.regs[regnum as usize] = value;
        self
    }

    pub fn raw_read_count(&self) -> usize {
        self.raw_reads.load(Ordering::Relaxed)
    }
}

impl Accessors for MemAccessors {
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn read_raw(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.raw_reads.fetch_add(1, Ordering::Relaxed);
        for (base, bytes) in &self.regions {
            if addr >= *base && addr + buf.len() as u64 <= *base + bytes.len() as u64 {
                let start = (addr - base) as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                return Ok(());
            }
        }
        Err(DwarfError::UnreadableAddress(addr))
    }

    fn read_reg(&self, regnum: u16) -> Result<u64> {
        self.reg_reads.fetch_add(1, Ordering::Relaxed);
        self.regs
            .get(regnum as usize)
            .copied()
            .ok_or(DwarfError::InvalidRegisterNumber(regnum as u64))
    }
}

pub struct FdeProvider {
    pi: ProcInfo,
    pub finds: Arc<AtomicUsize>,
    pub puts: Arc<AtomicUsize>,
}

impl FdeProvider {
    pub fn new(pi: ProcInfo) -> Self {
        Self {
            pi,
            finds: Arc::new(AtomicUsize::new(0)),
            puts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<A: Accessors> ProcInfoProvider<A> for FdeProvider {
    fn find(&self, _acc: &A, ip: u64) -> Result<ProcInfo> {
        self.finds.fetch_add(1, Ordering::Relaxed);
        if ip >= self.pi.start_ip && ip < self.pi.end_ip {
            Ok(self.pi)
        } else {
            Err(DwarfError::NoInfo)
        }
    }

    fn put(&self, _pi: &mut ProcInfo) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn table_proc_info(cie: &[u8], fde: &[u8], data_align: i64, signal_frame: bool) -> ProcInfo {
    ProcInfo {
        format: InfoFormat::Table,
        start_ip: START_IP,
        end_ip: END_IP,
        last_ip: None,
        flags: 0,
        unwind_info: Some(CieInfo {
            cie_instr_start: CIE_BASE,
            cie_instr_end: CIE_BASE + cie.len() as u64,
            fde_instr_start: FDE_BASE,
            fde_instr_end: FDE_BASE + fde.len() as u64,
            code_align: 1,
            data_align,
            ret_addr_column: RA_COLUMN,
            fde_encoding: DW_EH_PE_ABSPTR | DW_EH_PE_UDATA4,
            signal_frame,
        }),
    }
}

/// An address space over one synthetic FDE, plus any extra memory the
/// scenario needs (stack words, expression operands). Also hands back
/// the provider's lookup counter.
pub fn build_space(
    cie: &[u8],
    fde: &[u8],
    data_align: i64,
    policy: CachingPolicy,
    extra: Vec<(u64, Vec<u8>)>,
    regs: Vec<(u16, u64)>,
) -> (AddressSpace<MemAccessors>, Arc<AtomicUsize>) {
    let mut acc = MemAccessors::new()
        .with_region(CIE_BASE, cie.to_vec())
        .with_region(FDE_BASE, fde.to_vec());
    for (base, bytes) in extra {
        acc = acc.with_region(base, bytes);
    }
    for (regnum, value) in regs {
        acc = acc.with_reg(regnum, value);
    }
    let pi = table_proc_info(cie, fde, data_align, false);
    let provider = FdeProvider::new(pi);
    let finds = provider.finds.clone();
    (AddressSpace::new(acc, Box::new(provider), policy), finds)
}

/// Assembles CFI byte streams opcode by opcode.
pub struct CfiProgram {
    bytes: Vec<u8>,
}

impl CfiProgram {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn op(mut self, op: u8) -> Self {
        self.bytes.push(op);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn uleb(mut self, value: u64) -> Self {
        leb128::write::unsigned(&mut self.bytes, value).unwrap();
        self
    }

    pub fn sleb(mut self, value: i64) -> Self {
        leb128::write::signed(&mut self.bytes, value).unwrap();
        self
    }

    /// `DW_CFA_advance_loc` with the delta packed into the opcode.
    pub fn advance_loc(self, delta: u8) -> Self {
        self.op(DW_CFA_ADVANCE_LOC | delta)
    }

    /// `DW_CFA_offset` with the register packed into the opcode.
    pub fn offset(self, regnum: u8, factored: u64) -> Self {
        self.op(DW_CFA_OFFSET | regnum).uleb(factored)
    }

    pub fn def_cfa(self, regnum: u64, offset: u64) -> Self {
        self.op(DW_CFA_DEF_CFA).uleb(regnum).uleb(offset)
    }

    pub fn undefined(self, regnum: u64) -> Self {
        self.op(DW_CFA_UNDEFINED).uleb(regnum)
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
