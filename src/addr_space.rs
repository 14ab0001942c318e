use std::cell::RefCell;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::accessors::Accessors;
use crate::cache::{Cache, DEFAULT_LOG_CACHE_SIZE, MAX_LOG_CACHE_SIZE};
use crate::cursor::Cursor;
use crate::state::RegisterState;
use crate::Result;

/// How unwind info for a range of PCs is expressed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InfoFormat {
    /// Registered at runtime by a JIT; decoding is delegated and
    /// currently declined.
    Dynamic,
    /// DWARF CFI table in the local address space.
    Table,
    /// DWARF CFI table read through the accessor set.
    RemoteTable,
}

/// The CIE/FDE pair covering one procedure, as decoded by the proc-info
/// provider.
#[derive(Debug, Default, Copy, Clone)]
pub struct CieInfo {
    pub cie_instr_start: u64,
    pub cie_instr_end: u64,
    pub fde_instr_start: u64,
    pub fde_instr_end: u64,
    pub code_align: u64,
    pub data_align: i64,
    pub ret_addr_column: usize,
    /// Pointer encoding `DW_CFA_set_loc` operands use.
    pub fde_encoding: u8,
    pub signal_frame: bool,
}

/// What the proc-info provider knows about the procedure covering one
/// PC.
#[derive(Debug, Copy, Clone)]
pub struct ProcInfo {
    pub format: InfoFormat,
    pub start_ip: u64,
    pub end_ip: u64,
    /// True end of the procedure on targets whose tables pad `end_ip`
    /// with a dead zone.
    pub last_ip: Option<u64>,
    /// Provider-specific bits (e.g. a `.debug_frame` marker); the engine
    /// carries them through untouched.
    pub flags: u32,
    pub unwind_info: Option<CieInfo>,
}

/// Locates and decodes the FDE/CIE entry covering a PC. Table parsing
/// itself lives behind this trait, not in the engine.
pub trait ProcInfoProvider<A: Accessors>: Send + Sync {
    fn find(&self, acc: &A, ip: u64) -> Result<ProcInfo>;

    /// Release whatever `find` pinned. The default has nothing to
    /// release.
    fn put(&self, _pi: &mut ProcInfo) {}
}

/// Result of evaluating a DWARF expression.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExprResult {
    /// The expression named a register.
    Register(u64),
    /// The expression produced an address.
    Address(u64),
}

/// The delegated DWARF expression VM.
///
/// On entry `addr` points at the first expression byte — the length
/// prefix has already been consumed — and exactly `len` bytes belong to
/// the expression. `initial` is pushed on the expression stack before
/// evaluation.
pub trait ExpressionEvaluator<A: Accessors>: Send + Sync {
    fn evaluate(
        &self,
        acc: &A,
        c: &Cursor,
        initial: u64,
        addr: &mut u64,
        len: u64,
    ) -> Result<ExprResult>;
}

impl<A, F> ExpressionEvaluator<A> for F
where
    A: Accessors,
    F: Fn(&A, &Cursor, u64, &mut u64, u64) -> Result<ExprResult> + Send + Sync,
{
    fn evaluate(
        &self,
        acc: &A,
        c: &Cursor,
        initial: u64,
        addr: &mut u64,
        len: u64,
    ) -> Result<ExprResult> {
        self(acc, c, initial, addr, len)
    }
}

/// Per-address-space caching of computed register states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CachingPolicy {
    /// Recompute every frame.
    None,
    /// One cache shared by every cursor, behind a signal-masking lock.
    Global,
    /// One cache per thread, lock-free.
    PerThread,
}

thread_local! {
    static TLS_CACHE: RefCell<Cache> = RefCell::new(Cache::new());
}

/// One target address space: its accessor set, its unwind-info provider,
/// an optional expression VM, and the register-state cache shared by all
/// cursors stepping through it.
pub struct AddressSpace<A: Accessors> {
    pub accessors: A,
    pub(crate) provider: Box<dyn ProcInfoProvider<A>>,
    pub(crate) evaluator: Option<Box<dyn ExpressionEvaluator<A>>>,
    caching_policy: CachingPolicy,
    cache_generation: AtomicU64,
    log_size: AtomicU16,
    global_cache: Mutex<Cache>,
}

impl<A: Accessors> AddressSpace<A> {
    pub fn new(
        accessors: A,
        provider: Box<dyn ProcInfoProvider<A>>,
        caching_policy: CachingPolicy,
    ) -> Self {
        Self {
            accessors,
            provider,
            evaluator: None,
            caching_policy,
            cache_generation: AtomicU64::new(1),
            log_size: AtomicU16::new(DEFAULT_LOG_CACHE_SIZE),
            global_cache: Mutex::new(Cache::new()),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn ExpressionEvaluator<A>>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn caching_policy(&self) -> CachingPolicy {
        self.caching_policy
    }

    /// Invalidate every cache attached to this address space. Caches
    /// notice lazily on their next use.
    pub fn flush_cache(&self) {
        self.cache_generation.fetch_add(1, Ordering::Release);
    }

    /// Resize to at least `size` cached states, rounded up to a power of
    /// two and clamped. Takes effect through a flush.
    pub fn set_cache_size(&self, size: usize) {
        let mut log_size = 1u16;
        while (1usize << log_size) < size && log_size < MAX_LOG_CACHE_SIZE {
            log_size += 1;
        }
        self.log_size.store(log_size, Ordering::Relaxed);
        self.flush_cache();
    }

    /// Advance the cursor to its caller's frame. `Ok(true)` when it
    /// moved, `Ok(false)` at the end of the stack.
    pub fn step(&self, c: &mut Cursor) -> Result<bool> {
        crate::step::step(self, c)
    }

    /// Walk the FDE covering `c.ip` slice by slice, handing the register
    /// state of each `[start_ip, end_ip)` range to `f`, which returns
    /// whether to keep going.
    pub fn reg_states_iterate<F>(&self, c: &mut Cursor, f: F) -> Result<()>
    where
        F: FnMut(&RegisterState, u64, u64) -> bool,
    {
        crate::fde::reg_states_iterate(self, c, f)
    }

    /// Run `f` on the policy-selected cache, flushing first if this
    /// address space's generation moved. `None` when the policy (or an
    /// allocation failure) leaves the step uncached.
    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&mut Cache) -> R) -> Option<R> {
        match self.caching_policy {
            CachingPolicy::None => None,
            CachingPolicy::Global => {
                let _masked = SignalMask::block();
                let mut cache = match self.global_cache.lock() {
                    Ok(cache) => cache,
                    Err(poisoned) => poisoned.into_inner(),
                };
                self.sync_generation(&mut cache)?;
                Some(f(&mut cache))
            }
            CachingPolicy::PerThread => TLS_CACHE.with(|cell| {
                let mut cache = cell.borrow_mut();
                self.sync_generation(&mut cache)?;
                Some(f(&mut cache))
            }),
        }
    }

    fn sync_generation(&self, cache: &mut Cache) -> Option<()> {
        let generation = self.cache_generation.load(Ordering::Acquire);
        if cache.generation() != generation || cache.is_unallocated() {
            cache.set_log_size(self.log_size.load(Ordering::Relaxed));
            if cache.flush().is_err() {
                debug!("cache flush failed, stepping uncached");
                return None;
            }
            cache.set_generation(generation);
        }
        Some(())
    }
}

/// Blocks every signal for the current thread while the global-cache
/// lock is held and restores the previous mask on drop, so a profiling
/// signal cannot interrupt a lock holder and deadlock against it.
struct SignalMask {
    old: libc::sigset_t,
}

impl SignalMask {
    fn block() -> Self {
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut old);
            SignalMask { old }
        }
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}
