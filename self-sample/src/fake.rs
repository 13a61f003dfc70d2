//! A scripted [`Platform`] for tests: synthetic stacks, images and symbols.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::platform::{
    Arch, CaptureError, ImageSymbols, LoadedImage, Platform, RawSymbol, RegisterLayout,
    RegisterState, SymbolError, ThreadTarget,
};

/// A synthetic thread stack laid out as an x86_64 frame-pointer chain.
#[derive(Debug, Clone, Default)]
pub struct FakeStack {
    regs: RegisterState,
    memory: HashMap<u64, u64>,
    lo: u64,
    hi: u64,
}

impl FakeStack {
    /// `ip` is the leaf instruction pointer; `return_addrs` are the return
    /// addresses of each caller frame, innermost first. Frames are placed
    /// 0x20 bytes apart starting at `frame_base`.
    pub fn from_frames(frame_base: u64, ip: u64, return_addrs: &[u64]) -> Self {
        let layout = RegisterLayout::X86_64;
        let mut regs = RegisterState::default();
        regs.regs.resize(layout.ip + 1, 0);
        regs.regs[layout.ip] = ip;
        regs.regs[layout.fp] = frame_base;
        regs.regs[layout.sp] = frame_base - 0x10;

        let mut memory = HashMap::new();
        let mut fp = frame_base;
        for (i, &ret) in return_addrs.iter().enumerate() {
            let caller_fp = if i + 1 == return_addrs.len() {
                0
            } else {
                fp + 0x20
            };
            memory.insert(fp, caller_fp);
            memory.insert(fp + 8, ret);
            fp += 0x20;
        }
        if return_addrs.is_empty() {
            memory.insert(fp, 0);
            memory.insert(fp + 8, 0);
        }

        Self {
            regs,
            memory,
            lo: frame_base - 0x100,
            hi: frame_base + 0x20 * (return_addrs.len() as u64 + 1),
        }
    }
}

#[derive(Default)]
struct FakeState {
    stacks: HashMap<i32, FakeStack>,
    next_tid: i32,
    images: Vec<(LoadedImage, ImageSymbols)>,
    fail_enumerate: bool,
    fail_symbols_for: Option<u32>,
    fail_suspends: usize,
    suspended: HashMap<i32, usize>,
    suspend_calls: usize,
    resume_calls: usize,
}

pub struct FakePlatform {
    arch: Arch,
    state: Mutex<FakeState>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::with_arch(Arch::X86_64)
    }

    pub fn with_arch(arch: Arch) -> Self {
        Self {
            arch,
            state: Mutex::new(FakeState {
                next_tid: 100,
                ..FakeState::default()
            }),
        }
    }

    pub fn add_thread(&self, stack: FakeStack) -> ThreadTarget {
        let mut state = self.state.lock().unwrap();
        let tid = state.next_tid;
        state.next_tid += 1;
        let target = ThreadTarget {
            tid,
            stack_lo: stack.lo,
            stack_hi: stack.hi,
        };
        state.stacks.insert(tid, stack);
        target
    }

    /// Replace the stack a thread will show on its next capture.
    pub fn set_stack(&self, target: &ThreadTarget, stack: FakeStack) {
        self.state.lock().unwrap().stacks.insert(target.tid, stack);
    }

    /// Make the next `n` suspend calls fail.
    pub fn fail_next_suspends(&self, n: usize) {
        self.state.lock().unwrap().fail_suspends = n;
    }

    /// Register an image whose executable segment is `[exec_start,
    /// exec_end)` and whose symbols are `(name, address)` pairs with
    /// absolute addresses.
    pub fn add_image(&self, path: &str, exec_start: u64, exec_end: u64, symbols: &[(&str, u64)]) {
        let mut state = self.state.lock().unwrap();
        let index = state.images.len() as u32;
        let mut strtab = vec![0u8];
        let symbols = symbols
            .iter()
            .map(|&(name, addr)| {
                let name_offset = strtab.len() as u32;
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
                RawSymbol {
                    name_offset,
                    value: addr,
                }
            })
            .collect();
        state.images.push((
            LoadedImage {
                index,
                path: PathBuf::from(path),
                base_address: 0,
                exec_start,
                exec_end,
            },
            ImageSymbols { symbols, strtab },
        ));
    }

    pub fn fail_enumeration(&self) {
        self.state.lock().unwrap().fail_enumerate = true;
    }

    pub fn fail_symbols_for_image(&self, index: u32) {
        self.state.lock().unwrap().fail_symbols_for = Some(index);
    }

    /// `(suspend calls, resume calls)` so far.
    pub fn suspend_resume_counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.suspend_calls, state.resume_calls)
    }

    pub fn is_suspended(&self, target: &ThreadTarget) -> bool {
        self.state
            .lock()
            .unwrap()
            .suspended
            .get(&target.tid)
            .is_some_and(|&n| n > 0)
    }
}

impl Platform for FakePlatform {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn suspend_thread(&self, target: &ThreadTarget) -> Result<(), CaptureError> {
        let mut state = self.state.lock().unwrap();
        state.suspend_calls += 1;
        if state.fail_suspends > 0 {
            state.fail_suspends -= 1;
            return Err(CaptureError::SuspendTimeout(target.tid));
        }
        if !state.stacks.contains_key(&target.tid) {
            return Err(CaptureError::Suspend {
                tid: target.tid,
                source: std::io::Error::from_raw_os_error(libc::ESRCH),
            });
        }
        *state.suspended.entry(target.tid).or_default() += 1;
        Ok(())
    }

    fn read_registers(&self, target: &ThreadTarget) -> Result<RegisterState, CaptureError> {
        self.state
            .lock()
            .unwrap()
            .stacks
            .get(&target.tid)
            .map(|s| s.regs.clone())
            .ok_or(CaptureError::RegistersUnavailable(target.tid))
    }

    fn resume_thread(&self, target: &ThreadTarget) {
        let mut state = self.state.lock().unwrap();
        state.resume_calls += 1;
        if let Some(n) = state.suspended.get_mut(&target.tid) {
            *n = n.saturating_sub(1);
        }
    }

    fn read_word(&self, target: &ThreadTarget, addr: u64) -> Option<u64> {
        if !target.contains(addr, 8) {
            return None;
        }
        let state = self.state.lock().unwrap();
        state.stacks.get(&target.tid)?.memory.get(&addr).copied()
    }

    fn enumerate_loaded_images(&self) -> Result<Vec<LoadedImage>, SymbolError> {
        let state = self.state.lock().unwrap();
        if state.fail_enumerate {
            return Err(SymbolError::Platform("scripted enumeration failure".into()));
        }
        Ok(state.images.iter().map(|(image, _)| image.clone()).collect())
    }

    fn read_symbol_table(&self, image: &LoadedImage) -> Result<ImageSymbols, SymbolError> {
        let state = self.state.lock().unwrap();
        if state.fail_symbols_for == Some(image.index) {
            return Err(SymbolError::BadMagic);
        }
        state
            .images
            .get(image.index as usize)
            .map(|(_, symbols)| symbols.clone())
            .ok_or(SymbolError::NoSymbolTable)
    }
}
