//! The seam between the sampling/symbolication algorithms and the OS.
//!
//! Everything that touches another thread's registers or the loader's view
//! of the process goes through [`Platform`]. The native implementation lives
//! in `sys`; tests use `fake::FakePlatform`.

use std::path::PathBuf;

use smallvec::SmallVec;
use thiserror::Error;

/// CPU architecture of the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    X86,
    Arm,
    Unknown,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "x86") {
            Arch::X86
        } else if cfg!(target_arch = "arm") {
            Arch::Arm
        } else {
            Arch::Unknown
        }
    }
}

/// Where the instruction and frame pointers live in a [`RegisterState`].
///
/// Only 64-bit frame-pointer layouts are supported; the unwinder reads
/// 8-byte words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    pub ip: usize,
    pub fp: usize,
    pub sp: usize,
}

impl RegisterLayout {
    /// x86_64 `mcontext_t.gregs`: REG_RBP = 10, REG_RSP = 15, REG_RIP = 16.
    pub const X86_64: RegisterLayout = RegisterLayout {
        ip: 16,
        fp: 10,
        sp: 15,
    };

    /// aarch64: x0..x30 followed by sp and pc; x29 is the frame pointer.
    pub const AARCH64: RegisterLayout = RegisterLayout {
        ip: 32,
        fp: 29,
        sp: 31,
    };

    pub fn for_arch(arch: Arch) -> Option<Self> {
        match arch {
            Arch::X86_64 => Some(Self::X86_64),
            Arch::Aarch64 => Some(Self::AARCH64),
            Arch::X86 | Arch::Arm | Arch::Unknown => None,
        }
    }
}

/// Maximum number of general-purpose registers captured per suspension.
///
/// aarch64 needs 33 slots (x0-x30, sp, pc). The inline array size must be
/// one smallvec implements `Array` for.
pub const MAX_REGISTERS: usize = 36;

/// Register snapshot of a suspended thread, indexed per [`RegisterLayout`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterState {
    pub regs: SmallVec<[u64; MAX_REGISTERS]>,
}

impl RegisterState {
    pub fn get(&self, index: usize) -> Option<u64> {
        self.regs.get(index).copied()
    }
}

/// A thread that can be sampled.
///
/// The stack bounds are used to validate every frame-pointer dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadTarget {
    pub tid: i32,
    pub stack_lo: u64,
    pub stack_hi: u64,
}

impl ThreadTarget {
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.stack_lo
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= self.stack_hi)
    }
}

/// One binary image (executable or shared object) mapped into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub index: u32,
    pub path: PathBuf,
    /// Load bias added to every symbol value in the image's file.
    pub base_address: u64,
    /// `[exec_start, exec_end)` of the primary executable segment.
    pub exec_start: u64,
    pub exec_end: u64,
}

impl LoadedImage {
    pub fn short_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// A defined function symbol, as read from an image's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSymbol {
    /// Offset of the NUL-terminated name in [`ImageSymbols::strtab`].
    pub name_offset: u32,
    /// Symbol value as stored in the file (before the load bias).
    pub value: u64,
}

/// The symbol table of one image plus the string table its names live in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSymbols {
    pub symbols: Vec<RawSymbol>,
    pub strtab: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to signal thread {tid}: {source}")]
    Suspend { tid: i32, source: std::io::Error },
    #[error("thread {0} did not stop within the suspend timeout")]
    SuspendTimeout(i32),
    #[error("register state unavailable for thread {0}")]
    RegistersUnavailable(i32),
    #[error("unsupported architecture {0:?}")]
    UnsupportedArch(Arch),
    #[error("another capture is already in progress")]
    Busy,
    #[error("captured an empty call stack")]
    NullFrame,
}

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not an ELF image")]
    BadMagic,
    #[error("unsupported image format: {0}")]
    Unsupported(&'static str),
    #[error("read of {len} bytes at offset {offset:#x} is out of bounds")]
    OutOfBounds { offset: usize, len: usize },
    #[error("image has no symbol table")]
    NoSymbolTable,
    #[error("loaded images unavailable: {0}")]
    Platform(String),
}

/// Operating-system primitives needed to sample a thread and symbolicate
/// the result.
pub trait Platform: Send + Sync {
    fn arch(&self) -> Arch;

    /// Stop `target` so its registers and stack can be inspected.
    ///
    /// Every successful call must be paired with [`Platform::resume_thread`].
    fn suspend_thread(&self, target: &ThreadTarget) -> Result<(), CaptureError>;

    fn read_registers(&self, target: &ThreadTarget) -> Result<RegisterState, CaptureError>;

    fn resume_thread(&self, target: &ThreadTarget);

    /// Read one 8-byte word from the suspended thread's stack.
    ///
    /// Returns `None` for addresses the platform cannot read safely.
    fn read_word(&self, target: &ThreadTarget, addr: u64) -> Option<u64>;

    fn enumerate_loaded_images(&self) -> Result<Vec<LoadedImage>, SymbolError>;

    fn read_symbol_table(&self, image: &LoadedImage) -> Result<ImageSymbols, SymbolError>;
}

/// Resumes the target when dropped, so a capture error can never leave it
/// stopped.
pub struct SuspendGuard<'a> {
    platform: &'a dyn Platform,
    target: &'a ThreadTarget,
}

impl<'a> SuspendGuard<'a> {
    pub fn suspend(
        platform: &'a dyn Platform,
        target: &'a ThreadTarget,
    ) -> Result<Self, CaptureError> {
        platform.suspend_thread(target)?;
        Ok(Self { platform, target })
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.platform.resume_thread(self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_only_for_64_bit_arches() {
        assert_eq!(RegisterLayout::for_arch(Arch::X86_64), Some(RegisterLayout::X86_64));
        assert_eq!(RegisterLayout::for_arch(Arch::Aarch64), Some(RegisterLayout::AARCH64));
        assert_eq!(RegisterLayout::for_arch(Arch::X86), None);
        assert_eq!(RegisterLayout::for_arch(Arch::Arm), None);
        assert_eq!(RegisterLayout::for_arch(Arch::Unknown), None);
    }

    #[test]
    fn aarch64_register_file_fits_inline() {
        let mut state = RegisterState::default();
        state.regs.extend((0..33).map(|r| r * 0x10));
        assert!(!state.regs.spilled());
        assert_eq!(state.get(RegisterLayout::AARCH64.ip), Some(32 * 0x10));
        assert_eq!(state.get(RegisterLayout::AARCH64.sp), Some(31 * 0x10));
        assert_eq!(state.get(33), None);
        assert_eq!(state.clone(), state);
    }

    #[test]
    fn thread_target_bounds() {
        let t = ThreadTarget {
            tid: 1,
            stack_lo: 0x1000,
            stack_hi: 0x2000,
        };
        assert!(t.contains(0x1000, 8));
        assert!(t.contains(0x1ff8, 8));
        assert!(!t.contains(0x1ffc, 8));
        assert!(!t.contains(0x0ff8, 8));
        assert!(!t.contains(u64::MAX - 2, 8));
    }

    #[test]
    fn short_name_is_file_name() {
        let image = LoadedImage {
            index: 0,
            path: PathBuf::from("/usr/lib/libfoo.so.1"),
            base_address: 0,
            exec_start: 0,
            exec_end: 0,
        };
        assert_eq!(image.short_name(), "libfoo.so.1");
    }
}
