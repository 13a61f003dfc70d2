//! Frame-pointer stack walking over a suspended thread.

use smallvec::SmallVec;

use crate::platform::{CaptureError, Platform, RegisterLayout, RegisterState, ThreadTarget};

/// Inline capacity for captured stacks; deeper stacks spill to the heap.
pub const INLINE_FRAMES: usize = 64;

pub type Frames = SmallVec<[u64; INLINE_FRAMES]>;

/// Walk the frame-pointer chain of a suspended thread.
///
/// The first entry is the interrupted instruction pointer. Each following
/// entry is a return address minus one, so it points inside the call
/// instruction rather than at the instruction after it. The walk stops at a
/// null or non-increasing frame pointer, at `max_depth` entries, on an
/// unreadable word, or after pushing an address for which `is_stack_top`
/// returns true.
pub fn walk_frame_pointers(
    platform: &dyn Platform,
    target: &ThreadTarget,
    regs: &RegisterState,
    layout: RegisterLayout,
    max_depth: usize,
    is_stack_top: impl Fn(u64) -> bool,
) -> Result<Frames, CaptureError> {
    let ip = regs
        .get(layout.ip)
        .ok_or(CaptureError::RegistersUnavailable(target.tid))?;
    let mut fp = regs
        .get(layout.fp)
        .ok_or(CaptureError::RegistersUnavailable(target.tid))?;
    if ip == 0 {
        return Err(CaptureError::NullFrame);
    }

    let mut frames = Frames::new();
    frames.push(ip);
    if is_stack_top(ip) {
        return Ok(frames);
    }

    while frames.len() < max_depth {
        if fp == 0 || fp % 8 != 0 {
            break;
        }
        let Some(caller_fp) = platform.read_word(target, fp) else {
            break;
        };
        let Some(return_addr) = platform.read_word(target, fp + 8) else {
            break;
        };
        if return_addr == 0 {
            break;
        }
        let addr = return_addr - 1;
        frames.push(addr);
        if is_stack_top(addr) {
            break;
        }
        // The stack grows down, so callers' frames live at higher addresses.
        if caller_fp <= fp {
            break;
        }
        fp = caller_fp;
    }

    Ok(frames)
}
