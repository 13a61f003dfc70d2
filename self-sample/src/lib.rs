//! # self-sample
//!
//! In-process stack sampling and symbolication for a program profiling
//! itself. A sampler thread suspends a target thread, copies its registers,
//! walks the frame-pointer chain and resumes it; addresses are later mapped
//! to names through a [`SymbolTable`] built from the ELF symbol tables of
//! every loaded image.
//!
//! Frame-pointer walking needs the binary compiled with frame pointers:
//!
//! ```toml
//! # In .cargo/config.toml:
//! [build]
//! rustflags = ["-C", "force-frame-pointers=yes"]
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use self_sample::{
//!     NativePlatform, Platform, RegisterLayout, SuspendGuard, ThreadTarget, process_symbols,
//!     walk_frame_pointers,
//! };
//!
//! let target = ThreadTarget::current().expect("no stack bounds");
//! // ... hand `target` to another thread, then from that thread:
//! let platform = NativePlatform::new();
//! let layout = RegisterLayout::for_arch(platform.arch()).expect("unsupported arch");
//! let frames = {
//!     let _guard = SuspendGuard::suspend(&platform, &target).expect("suspend failed");
//!     let regs = platform.read_registers(&target).expect("no registers");
//!     walk_frame_pointers(&platform, &target, &regs, layout, 64, |_| false)
//! };
//! let symbols = process_symbols();
//! for addr in frames.expect("walk failed") {
//!     println!("{addr:#x} {:?}", symbols.lookup(addr));
//! }
//! ```

pub mod elf;
#[cfg(any(test, feature = "fake-platform"))]
pub mod fake;
mod platform;
pub mod reader;
mod symbols;
mod sys;
mod unwind;

pub use platform::{
    Arch, CaptureError, ImageSymbols, LoadedImage, MAX_REGISTERS, Platform, RawSymbol,
    RegisterLayout, RegisterState, SuspendGuard, SymbolError, ThreadTarget,
};
pub use symbols::{
    SymbolId, SymbolName, SymbolSlot, SymbolTable, SymbolTableEntry, process_symbols,
};
pub use sys::{NativePlatform, SUSPEND_TIMEOUT};
pub use unwind::{Frames, INLINE_FRAMES, walk_frame_pointers};
