use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use self_sample::{CaptureError, ThreadTarget};

/// Returns true when running in CI (GitHub Actions sets CI=true).
#[allow(dead_code)]
pub fn is_ci() -> bool {
    std::env::var("CI").is_ok()
}

#[inline(never)]
pub fn burn_cpu(stop: &AtomicBool) {
    let mut sum = 0u64;
    let mut i = 0u64;
    while !stop.load(Ordering::Relaxed) {
        sum = sum.wrapping_add(i);
        std::hint::black_box(sum);
        i += 1;
    }
}

/// A thread spinning in [`burn_cpu`] until dropped.
pub struct Burner {
    pub target: ThreadTarget,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Burner {
    pub fn spawn() -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || {
                tx.send(ThreadTarget::current().unwrap()).unwrap();
                burn_cpu(&stop);
            })
        };
        let target = rx.recv().unwrap();
        Self {
            target,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Burner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

/// Retry `f` while another test in this binary holds the capture slot.
#[allow(dead_code)]
pub fn retry_busy<T>(mut f: impl FnMut() -> Result<T, CaptureError>) -> Result<T, CaptureError> {
    loop {
        match f() {
            Err(CaptureError::Busy) => thread::yield_now(),
            other => return other,
        }
    }
}
