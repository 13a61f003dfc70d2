//! Background sampling profiler.
//!
//! A dedicated thread periodically suspends one target thread, walks its
//! frame-pointer chain and resumes it. Raw captures go into a bounded
//! double buffer; [`Sampler::write`] (also run by the thread every
//! `write_interval`) swaps the buffers, coalesces consecutive identical
//! stacks into one [`Sample`] and writes it through the [`Session`].
//!
//! Nothing that can allocate or take a lock runs while the target is
//! suspended: the walk fills an inline stack buffer and the sample buffer
//! lock is taken only after resume.

mod method_map;
mod sample_buffer;

pub use method_map::{MethodMap, UNKNOWN_METHOD};
pub use sample_buffer::{RawSample, SampleBuffer, SampleIter};

use std::mem;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use self_sample::{
    CaptureError, INLINE_FRAMES, NativePlatform, Platform, RegisterLayout, SuspendGuard,
    SymbolTable, ThreadTarget, process_symbols, walk_frame_pointers,
};

use crate::telemetry::events::{SAMPLE_CLASS, Sample};
use crate::telemetry::session::Session;

/// Symbols whose frames are the outermost a walk needs to visit.
const STACK_TOP_SYMBOLS: &[&str] = &["main", "__libc_start_main", "start_thread", "clone3"];

/// Consecutive capture failures before switching to the backoff sleep.
const BACKOFF_AFTER_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Wait before the first capture.
    pub start_delay: Duration,
    /// Sleep between captures.
    pub interval: Duration,
    /// Sleep between captures after repeated failures.
    pub error_backoff: Duration,
    /// Frames per capture, capped at [`INLINE_FRAMES`].
    pub max_depth: usize,
    /// Capacity of each half of the double buffer, in 8-byte words.
    pub buffer_capacity: usize,
    /// How often the sampler thread writes its own captures.
    pub write_interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_millis(100),
            interval: Duration::from_millis(1),
            error_backoff: Duration::from_millis(100),
            max_depth: INLINE_FRAMES,
            buffer_capacity: 64 * 1024,
            write_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub captures: u64,
    pub errors: u64,
    /// Captures discarded because the write buffer was full.
    pub dropped: u64,
}

struct Consumer {
    read: SampleBuffer,
    methods: MethodMap,
}

/// Capture and write stages without the thread. [`Sampler`] drives one on a
/// timer; tests drive it directly.
pub struct SampleCollector {
    session: Session,
    platform: Arc<dyn Platform>,
    target: ThreadTarget,
    layout: RegisterLayout,
    max_depth: usize,
    stack_tops: Vec<Range<u64>>,
    write_buffer: Mutex<SampleBuffer>,
    consumer: Mutex<Consumer>,
    captures: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

impl SampleCollector {
    pub fn new(
        session: Session,
        platform: Arc<dyn Platform>,
        symbols: Arc<SymbolTable>,
        target: ThreadTarget,
        config: &SamplerConfig,
    ) -> Result<Self, CaptureError> {
        let arch = platform.arch();
        let layout = RegisterLayout::for_arch(arch).ok_or(CaptureError::UnsupportedArch(arch))?;
        Ok(Self {
            session,
            platform,
            target,
            layout,
            max_depth: config.max_depth.clamp(1, INLINE_FRAMES),
            stack_tops: symbols.ranges_named(STACK_TOP_SYMBOLS),
            write_buffer: Mutex::new(SampleBuffer::with_capacity(config.buffer_capacity)),
            consumer: Mutex::new(Consumer {
                read: SampleBuffer::with_capacity(config.buffer_capacity),
                methods: MethodMap::new(symbols),
            }),
            captures: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn target(&self) -> &ThreadTarget {
        &self.target
    }

    fn is_stack_top(&self, address: u64) -> bool {
        self.stack_tops.iter().any(|r| r.contains(&address))
    }

    /// Take one capture of the target and queue it.
    ///
    /// Failures are counted in [`SamplerStats::errors`] and returned.
    pub fn capture(&self) -> Result<(), CaptureError> {
        let result = self.capture_inner();
        match &result {
            Ok(()) => self.captures.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.errors.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn capture_inner(&self) -> Result<(), CaptureError> {
        let time = self.session.now_ticks();
        let frames = {
            let _resume = SuspendGuard::suspend(&*self.platform, &self.target)?;
            let regs = self.platform.read_registers(&self.target)?;
            walk_frame_pointers(
                &*self.platform,
                &self.target,
                &regs,
                self.layout,
                self.max_depth,
                |addr| self.is_stack_top(addr),
            )?
        };
        if !self.write_buffer.lock().push(time, &frames) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Write every queued capture, merging consecutive identical stacks.
    ///
    /// Returns the number of `Sample` records written.
    pub fn write(&self) -> usize {
        let mut consumer = self.consumer.lock();
        {
            let mut write_buffer = self.write_buffer.lock();
            mem::swap(&mut *write_buffer, &mut consumer.read);
        }
        let Consumer { read, methods } = &mut *consumer;
        if !self.session.is_connected() {
            read.clear();
            return 0;
        }

        let mut written = 0;
        let mut current: Option<(Sample, &[u64])> = None;
        for raw in read.iter() {
            let time = self.session.units_since_base(raw.time);
            if let Some((sample, frames)) = current.as_mut()
                && *frames == raw.frames
            {
                sample.add_tick(time as f64);
                continue;
            }
            if let Some((sample, _)) = current.take() {
                self.write_sample(methods, &sample);
                written += 1;
            }
            let callstack = raw.frames.iter().map(|&a| methods.method_id(a)).collect();
            let time = time.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            current = Some((Sample::new(time, callstack), raw.frames));
        }
        if let Some((sample, _)) = current.take() {
            self.write_sample(methods, &sample);
            written += 1;
        }
        read.clear();
        written
    }

    /// Names and the sample that uses them go out under one lock, so a
    /// reconnect cannot land between them.
    fn write_sample(&self, methods: &mut MethodMap, sample: &Sample) {
        self.session.write_batch(|batch| {
            methods.write_to(batch);
            batch.write_record(&SAMPLE_CLASS, &sample.field_values());
        });
    }

    pub fn stats(&self) -> SamplerStats {
        SamplerStats {
            captures: self.captures.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Owns the sampler thread. Dropping it stops and joins the thread.
pub struct Sampler {
    collector: Option<Arc<SampleCollector>>,
    running: Option<Running>,
}

impl Sampler {
    /// Sample the calling thread with the native platform.
    pub fn start_current(session: &Session, config: SamplerConfig) -> Self {
        match ThreadTarget::current() {
            Ok(target) => Self::start(session, target, config),
            Err(error) => {
                tracing::warn!(%error, "sampler disabled: no stack bounds for current thread");
                Self::disabled()
            }
        }
    }

    pub fn start(session: &Session, target: ThreadTarget, config: SamplerConfig) -> Self {
        Self::with_platform(
            session,
            Arc::new(NativePlatform::new()),
            process_symbols(),
            target,
            config,
        )
    }

    pub fn with_platform(
        session: &Session,
        platform: Arc<dyn Platform>,
        symbols: Arc<SymbolTable>,
        target: ThreadTarget,
        config: SamplerConfig,
    ) -> Self {
        let collector =
            match SampleCollector::new(session.clone(), platform, symbols, target, &config) {
                Ok(collector) => Arc::new(collector),
                Err(error) => {
                    tracing::warn!(%error, "sampler disabled");
                    return Self::disabled();
                }
            };

        let stop = Arc::new(AtomicBool::new(false));
        let spawned = {
            let collector = collector.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("tlm-sampler".into())
                .spawn(move || run(&collector, &config, &stop))
        };
        match spawned {
            Ok(thread) => {
                tracing::info!(tid = collector.target().tid, "sampler started");
                Self {
                    collector: Some(collector),
                    running: Some(Running { stop, thread }),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to spawn sampler thread");
                Self {
                    collector: Some(collector),
                    running: None,
                }
            }
        }
    }

    fn disabled() -> Self {
        Self {
            collector: None,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Write queued captures now, e.g. at the end of a frame.
    pub fn write(&self) -> usize {
        self.collector.as_ref().map_or(0, |c| c.write())
    }

    pub fn stats(&self) -> SamplerStats {
        self.collector
            .as_ref()
            .map_or_else(SamplerStats::default, |c| c.stats())
    }

    /// Stop the thread and write what it captured. Idempotent.
    pub fn stop(&mut self) {
        let Some(Running { stop, thread }) = self.running.take() else {
            return;
        };
        stop.store(true, Ordering::Release);
        thread.thread().unpark();
        if thread.join().is_err() {
            tracing::warn!("sampler thread panicked");
        }
        let stats = self.stats();
        tracing::info!(
            captures = stats.captures,
            errors = stats.errors,
            dropped = stats.dropped,
            "sampler stopped"
        );
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(collector: &SampleCollector, config: &SamplerConfig, stop: &AtomicBool) {
    if !sleep_unless_stopped(config.start_delay, stop) {
        return;
    }
    let mut consecutive_errors = 0u32;
    let mut last_write = Instant::now();
    loop {
        match collector.capture() {
            Ok(()) => consecutive_errors = 0,
            Err(error) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                if consecutive_errors == BACKOFF_AFTER_ERRORS {
                    tracing::debug!(%error, "sampler backing off after repeated capture failures");
                }
            }
        }
        if last_write.elapsed() >= config.write_interval {
            collector.write();
            last_write = Instant::now();
        }
        let pause = if consecutive_errors >= BACKOFF_AFTER_ERRORS {
            config.error_backoff
        } else {
            config.interval
        };
        if !sleep_unless_stopped(pause, stop) {
            break;
        }
    }
    collector.write();
}

/// Returns false once `stop` is set.
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::park_timeout(deadline - now);
    }
}
