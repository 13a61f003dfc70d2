//! The native platform: SIGPROF-based thread suspension and the dynamic
//! loader's view of mapped images.
//!
//! A thread is "suspended" by sending it SIGPROF with `tgkill`. The handler
//! copies the interrupted register context into a static slot and then spins
//! until the sampler signals resume, so the thread's stack stays frozen while
//! the sampler walks it. Only one capture can be in flight per process.

use std::io;

use crate::elf;
use crate::platform::{
    Arch, CaptureError, ImageSymbols, LoadedImage, Platform, RegisterState, SymbolError,
    ThreadTarget,
};

/// How long `suspend_thread` waits for the handler to run.
pub const SUSPEND_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(20);

#[derive(Debug, Default)]
pub struct NativePlatform {
    _priv: (),
}

impl NativePlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CStr;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, AtomicUsize, Ordering};
    use std::time::Instant;
    use std::{io, mem, ptr, slice};

    use crate::platform::{MAX_REGISTERS, RegisterState, ThreadTarget};

    const IDLE: u8 = 0;
    const ARMING: u8 = 1;
    const REQUESTED: u8 = 2;
    const CAPTURING: u8 = 3;
    const CAPTURED: u8 = 4;
    const RESUMED: u8 = 5;

    pub(super) struct CaptureSlot {
        state: AtomicU8,
        tid: AtomicI32,
        len: AtomicUsize,
        regs: [AtomicU64; MAX_REGISTERS],
    }

    impl CaptureSlot {
        pub(super) const fn new() -> Self {
            Self {
                state: AtomicU8::new(IDLE),
                tid: AtomicI32::new(0),
                len: AtomicUsize::new(0),
                regs: [const { AtomicU64::new(0) }; MAX_REGISTERS],
            }
        }

        /// Move a pending request addressed to `me` into `CAPTURING`.
        ///
        /// `tid` is stored before `REQUESTED`, so once the CAS has observed
        /// `REQUESTED` the reloaded `tid` belongs to that request. A signal
        /// left over from an earlier, timed-out request for another thread
        /// hands the request back untouched.
        pub(super) fn claim(&self, me: i32) -> bool {
            if self.tid.load(Ordering::Acquire) != me {
                return false;
            }
            if self
                .state
                .compare_exchange(REQUESTED, CAPTURING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            if self.tid.load(Ordering::Acquire) != me {
                self.state.store(REQUESTED, Ordering::Release);
                return false;
            }
            true
        }

        #[cfg(test)]
        pub(super) fn arm(&self, tid: i32) {
            self.tid.store(tid, Ordering::Release);
            self.state.store(REQUESTED, Ordering::Release);
        }

        #[cfg(test)]
        pub(super) fn is_requested(&self) -> bool {
            self.state.load(Ordering::Acquire) == REQUESTED
        }
    }

    static SLOT: CaptureSlot = CaptureSlot::new();

    pub(super) fn gettid() -> i32 {
        unsafe { libc::syscall(libc::SYS_gettid) as i32 }
    }

    fn install_handler() -> io::Result<()> {
        static INSTALLED: OnceLock<Option<i32>> = OnceLock::new();
        let errno = *INSTALLED.get_or_init(|| unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = on_sigprof as *const () as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGPROF, &sa, ptr::null_mut()) != 0 {
                io::Error::last_os_error().raw_os_error()
            } else {
                None
            }
        });
        match errno {
            Some(code) => Err(io::Error::from_raw_os_error(code)),
            None => Ok(()),
        }
    }

    extern "C" fn on_sigprof(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
        if !SLOT.claim(gettid()) {
            // Stale signal from a request that already timed out.
            return;
        }

        let len = unsafe { copy_registers(ctx) };
        SLOT.len.store(len, Ordering::Relaxed);
        SLOT.state.store(CAPTURED, Ordering::Release);

        while SLOT.state.load(Ordering::Acquire) != RESUMED {
            std::hint::spin_loop();
        }
        SLOT.state.store(IDLE, Ordering::Release);
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn copy_registers(ctx: *mut libc::c_void) -> usize {
        let uc = unsafe { &*(ctx as *const libc::ucontext_t) };
        let gregs = &uc.uc_mcontext.gregs;
        for (slot, &value) in SLOT.regs.iter().zip(gregs.iter()) {
            slot.store(value as u64, Ordering::Relaxed);
        }
        gregs.len().min(MAX_REGISTERS)
    }

    #[cfg(target_arch = "aarch64")]
    unsafe fn copy_registers(ctx: *mut libc::c_void) -> usize {
        let uc = unsafe { &*(ctx as *const libc::ucontext_t) };
        let mc = &uc.uc_mcontext;
        for (slot, &value) in SLOT.regs.iter().zip(mc.regs.iter()) {
            slot.store(value, Ordering::Relaxed);
        }
        SLOT.regs[31].store(mc.sp, Ordering::Relaxed);
        SLOT.regs[32].store(mc.pc, Ordering::Relaxed);
        33
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    unsafe fn copy_registers(_ctx: *mut libc::c_void) -> usize {
        0
    }

    pub(super) enum SuspendFailure {
        Busy,
        Signal(io::Error),
        Timeout,
    }

    pub(super) fn suspend(target: &ThreadTarget, timeout: std::time::Duration) -> Result<(), SuspendFailure> {
        install_handler().map_err(SuspendFailure::Signal)?;
        if SLOT
            .state
            .compare_exchange(IDLE, ARMING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SuspendFailure::Busy);
        }
        SLOT.tid.store(target.tid, Ordering::Release);
        SLOT.state.store(REQUESTED, Ordering::Release);

        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                libc::getpid(),
                target.tid,
                libc::SIGPROF,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            SLOT.state.store(IDLE, Ordering::Release);
            return Err(SuspendFailure::Signal(err));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match SLOT.state.load(Ordering::Acquire) {
                CAPTURED => return Ok(()),
                REQUESTED if Instant::now() >= deadline => {
                    // Losing this race means the handler has started and will
                    // reach CAPTURED shortly.
                    if SLOT
                        .state
                        .compare_exchange(REQUESTED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Err(SuspendFailure::Timeout);
                    }
                }
                _ => {}
            }
            std::hint::spin_loop();
        }
    }

    pub(super) fn registers() -> Option<RegisterState> {
        if SLOT.state.load(Ordering::Acquire) != CAPTURED {
            return None;
        }
        let len = SLOT.len.load(Ordering::Relaxed);
        let mut state = RegisterState::default();
        state
            .regs
            .extend(SLOT.regs[..len].iter().map(|r| r.load(Ordering::Relaxed)));
        Some(state)
    }

    pub(super) fn resume() {
        if SLOT
            .state
            .compare_exchange(CAPTURED, RESUMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        while SLOT.state.load(Ordering::Acquire) != IDLE {
            std::hint::spin_loop();
        }
    }

    pub(super) fn current_thread() -> io::Result<ThreadTarget> {
        unsafe {
            let mut attr: libc::pthread_attr_t = mem::zeroed();
            let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            let mut addr: *mut libc::c_void = ptr::null_mut();
            let mut size: libc::size_t = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(ThreadTarget {
                tid: gettid(),
                stack_lo: addr as u64,
                stack_hi: addr as u64 + size as u64,
            })
        }
    }

    /// `(path, load bias, exec start, exec end)` as reported by the loader.
    type RawImage = (Vec<u8>, u64, u64, u64);

    unsafe extern "C" fn collect_image(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let images = unsafe { &mut *(data as *mut Vec<RawImage>) };
        let info = unsafe { &*info };
        let name = if info.dlpi_name.is_null() {
            Vec::new()
        } else {
            unsafe { CStr::from_ptr(info.dlpi_name) }.to_bytes().to_vec()
        };
        if info.dlpi_phdr.is_null() {
            return 0;
        }
        let phdrs = unsafe { slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
        let exec = phdrs
            .iter()
            .find(|ph| ph.p_type == libc::PT_LOAD && ph.p_flags & libc::PF_X != 0);
        if let Some(ph) = exec {
            let bias = info.dlpi_addr as u64;
            let start = bias + ph.p_vaddr as u64;
            images.push((name, bias, start, start + ph.p_memsz as u64));
        }
        0
    }

    pub(super) fn loaded_images() -> Vec<(PathBuf, u64, u64, u64)> {
        let mut raw: Vec<RawImage> = Vec::new();
        unsafe {
            libc::dl_iterate_phdr(Some(collect_image), &mut raw as *mut Vec<RawImage> as *mut libc::c_void);
        }

        raw.into_iter()
            .filter_map(|(name, bias, start, end)| {
                let path = if name.is_empty() {
                    fs::read_link("/proc/self/exe").ok()?
                } else {
                    use std::os::unix::ffi::OsStrExt;
                    PathBuf::from(std::ffi::OsStr::from_bytes(&name))
                };
                // vdso and other images without a backing file
                if !path.starts_with("/") {
                    return None;
                }
                Some((path, bias, start, end))
            })
            .collect()
    }
}

impl ThreadTarget {
    /// The calling thread, with the bounds of its stack mapping.
    #[cfg(target_os = "linux")]
    pub fn current() -> io::Result<Self> {
        linux::current_thread()
    }

    #[cfg(not(target_os = "linux"))]
    pub fn current() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "thread sampling is only implemented on Linux",
        ))
    }
}

#[cfg(target_os = "linux")]
impl Platform for NativePlatform {
    fn arch(&self) -> Arch {
        Arch::host()
    }

    fn suspend_thread(&self, target: &ThreadTarget) -> Result<(), CaptureError> {
        if target.tid == linux::gettid() {
            return Err(CaptureError::Suspend {
                tid: target.tid,
                source: io::Error::new(io::ErrorKind::InvalidInput, "cannot suspend the calling thread"),
            });
        }
        linux::suspend(target, SUSPEND_TIMEOUT).map_err(|e| match e {
            linux::SuspendFailure::Busy => CaptureError::Busy,
            linux::SuspendFailure::Timeout => CaptureError::SuspendTimeout(target.tid),
            linux::SuspendFailure::Signal(source) => CaptureError::Suspend {
                tid: target.tid,
                source,
            },
        })
    }

    fn read_registers(&self, target: &ThreadTarget) -> Result<RegisterState, CaptureError> {
        linux::registers().ok_or(CaptureError::RegistersUnavailable(target.tid))
    }

    fn resume_thread(&self, _target: &ThreadTarget) {
        linux::resume();
    }

    fn read_word(&self, target: &ThreadTarget, addr: u64) -> Option<u64> {
        if addr % 8 != 0 || !target.contains(addr, 8) {
            return None;
        }
        // The target is parked in the signal handler and the address lies in
        // its stack mapping.
        Some(unsafe { std::ptr::read_volatile(addr as *const u64) })
    }

    fn enumerate_loaded_images(&self) -> Result<Vec<LoadedImage>, SymbolError> {
        let images: Vec<LoadedImage> = linux::loaded_images()
            .into_iter()
            .enumerate()
            .map(|(i, (path, base_address, exec_start, exec_end))| LoadedImage {
                index: i as u32,
                path,
                base_address,
                exec_start,
                exec_end,
            })
            .collect();
        if images.is_empty() {
            return Err(SymbolError::Platform("dl_iterate_phdr reported no images".into()));
        }
        Ok(images)
    }

    fn read_symbol_table(&self, image: &LoadedImage) -> Result<ImageSymbols, SymbolError> {
        let data = std::fs::read(&image.path)?;
        elf::parse_symbols(&data)
    }
}

#[cfg(not(target_os = "linux"))]
impl Platform for NativePlatform {
    fn arch(&self) -> Arch {
        Arch::host()
    }

    fn suspend_thread(&self, target: &ThreadTarget) -> Result<(), CaptureError> {
        Err(CaptureError::Suspend {
            tid: target.tid,
            source: io::Error::from(io::ErrorKind::Unsupported),
        })
    }

    fn read_registers(&self, target: &ThreadTarget) -> Result<RegisterState, CaptureError> {
        Err(CaptureError::RegistersUnavailable(target.tid))
    }

    fn resume_thread(&self, _target: &ThreadTarget) {}

    fn read_word(&self, _target: &ThreadTarget, _addr: u64) -> Option<u64> {
        None
    }

    fn enumerate_loaded_images(&self) -> Result<Vec<LoadedImage>, SymbolError> {
        Err(SymbolError::Platform("unsupported operating system".into()))
    }

    fn read_symbol_table(&self, _image: &LoadedImage) -> Result<ImageSymbols, SymbolError> {
        Err(SymbolError::Unsupported("non-ELF host"))
    }
}
