//! In-memory doubles for the external interfaces: scripted memory and
//! registers with read counters, a canned proc-info provider, and a CFI
//! program builder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::accessors::{Accessors, Endianness};
use crate::addr_space::{AddressSpace, CachingPolicy, CieInfo, InfoFormat, ProcInfo, ProcInfoProvider};
use crate::consts::*;
use crate::{DwarfError, Result};

pub(crate) const CIE_BASE: u64 = 0x1000;
pub(crate) const FDE_BASE: u64 = 0x2000;
pub(crate) const START_IP: u64 = 0x4000_0000;
pub(crate) const END_IP: u64 = START_IP + 0x100;

/// Column used as the return-address column by fixtures; a valid column
/// on every supported target.
pub(crate) const RA_COLUMN: usize = 16;

pub(crate) struct TestAccessors {
    regions: Vec<(u64, Vec<u8>)>,
    regs: Vec<u64>,
}

impl TestAccessors {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            regs: vec![0; 128],
        }
    }

    pub fn with_region(mut self, base: u64, bytes: Vec<u8>) -> Self {
        self.regions.push((base, bytes));
        self
    }
}

impl Accessors for TestAccessors {
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn read_raw(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
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
        self.regs
            .get(regnum as usize)
            .copied()
            .ok_or(DwarfError::InvalidRegisterNumber(regnum as u64))
    }
}

pub(crate) struct TestProvider {
    pi: Option<ProcInfo>,
    pub finds: Arc<AtomicUsize>,
    pub puts: Arc<AtomicUsize>,
}

impl TestProvider {
    pub fn new(pi: ProcInfo) -> Self {
        Self {
            pi: Some(pi),
            finds: Arc::new(AtomicUsize::new(0)),
            puts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn empty() -> Self {
        Self {
            pi: None,
            finds: Arc::new(AtomicUsize::new(0)),
            puts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<A: Accessors> ProcInfoProvider<A> for TestProvider {
    fn find(&self, _acc: &A, ip: u64) -> Result<ProcInfo> {
        self.finds.fetch_add(1, Ordering::Relaxed);
        match self.pi {
            Some(pi) if ip >= pi.start_ip && ip < pi.end_ip => Ok(pi),
            _ => Err(DwarfError::NoInfo),
        }
    }

    fn put(&self, _pi: &mut ProcInfo) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn proc_info(
    cie_len: usize,
    fde_len: usize,
    data_align: i64,
    signal_frame: bool,
) -> ProcInfo {
    ProcInfo {
        format: InfoFormat::Table,
        start_ip: START_IP,
        end_ip: END_IP,
        last_ip: None,
        flags: 0,
        unwind_info: Some(CieInfo {
            cie_instr_start: CIE_BASE,
            cie_instr_end: CIE_BASE + cie_len as u64,
            fde_instr_start: FDE_BASE,
            fde_instr_end: FDE_BASE + fde_len as u64,
            code_align: 1,
            data_align,
            ret_addr_column: RA_COLUMN,
            fde_encoding: DW_EH_PE_ABSPTR | DW_EH_PE_UDATA4,
            signal_frame,
        }),
    }
}

pub(crate) fn test_space(
    cie: &[u8],
    fde: &[u8],
    data_align: i64,
    signal_frame: bool,
    policy: CachingPolicy,
) -> (AddressSpace<TestAccessors>, ProcInfo) {
    let acc = TestAccessors::new()
        .with_region(CIE_BASE, cie.to_vec())
        .with_region(FDE_BASE, fde.to_vec());
    let pi = proc_info(cie.len(), fde.len(), data_align, signal_frame);
    let sp = AddressSpace::new(acc, Box::new(TestProvider::new(pi)), policy);
    (sp, pi)
}

/// Assembles CFI byte streams opcode by opcode.
pub(crate) struct CfiBuilder {
    bytes: Vec<u8>,
}

impl CfiBuilder {
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

    pub fn advance_loc(self, delta: u8) -> Self {
        self.op(DW_CFA_ADVANCE_LOC | delta)
    }

    pub fn offset(self, regnum: u8, factored: u64) -> Self {
        self.op(DW_CFA_OFFSET | regnum).uleb(factored)
    }

    pub fn def_cfa(self, regnum: u64, offset: u64) -> Self {
        self.op(DW_CFA_DEF_CFA).uleb(regnum).uleb(offset)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
