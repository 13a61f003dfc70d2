//! The instrumentation entry point.
//!
//! A [`Session`] is a cheap, cloneable handle. All state (codec, sinks,
//! timing markers, event log) sits behind one mutex, so calls from any
//! thread serialize in lock-acquisition order. While disconnected every
//! write is a no-op.
//!
//! ## Timing
//!
//! Timed records carry `delta`: protocol units (microseconds) elapsed since
//! the previous timed record. Deltas are computed from absolute unit counts
//! since the session's time base, so summing them reproduces each record's
//! time to within one unit regardless of how many records were written.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::telemetry::buffer::{EntryKind, EventLog};
use crate::telemetry::events::{
    FRAME_ENTER, FRAME_EXIT, SPAN_CLASS, SPAN_VALUE_CLASS, TIME_CLASS, VALUE_CLASS,
};
use crate::telemetry::format::{self, ClassDef, Value, WireCodec};
use crate::telemetry::writer::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_FLUSH_THRESHOLD, FileTransport, Sink, StreamMultiplexer,
    TcpTransport,
};

pub const DEFAULT_PORT: u16 = 7934;
pub const UNITS_PER_SECOND: u64 = 1_000_000;

/// A monotonic tick source.
pub trait Clock: Send + Sync {
    fn now_ticks(&self) -> u64;
    /// Ticks per second.
    fn frequency(&self) -> u64;
}

/// Nanoseconds since construction.
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency(&self) -> u64 {
        1_000_000_000
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    ticks: AtomicU64,
    frequency: u64,
}

impl ManualClock {
    pub fn new(frequency: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frequency,
        }
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }
}

/// Where to send telemetry. Each destination is opened independently.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Viewer host; `None` skips the network transport.
    pub host: Option<String>,
    pub port: u16,
    /// Capture file; `None` skips the file transport.
    pub output_file_path: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            output_file_path: None,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectOptions {
    /// Read `TLM_HOST`, `TLM_PORT` and `TLM_OUTPUT`. Unset or unparsable
    /// variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        options.host = lookup("TLM_HOST").filter(|h| !h.is_empty());
        if let Some(port) = lookup("TLM_PORT").and_then(|p| p.parse().ok()) {
            options.port = port;
        }
        options.output_file_path = lookup("TLM_OUTPUT")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        options
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file_path = Some(path.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Start time of a span, in clock ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct SpanToken(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Records encoded on the current connection.
    pub records: u64,
    /// Spans dropped for being shorter than the minimum, since creation.
    pub spans_dropped: u64,
    /// Bytes handed to sinks on the current connection.
    pub bytes_out: u64,
    pub sinks: usize,
}

#[derive(Debug, Clone, Copy)]
struct Timebase {
    /// Clock ticks per second, never zero.
    frequency: u64,
}

impl Timebase {
    /// Whole protocol units in `ticks`, rounded down.
    fn units(self, ticks: u64) -> u64 {
        let units = ticks as u128 * UNITS_PER_SECOND as u128 / self.frequency as u128;
        units.min(u64::MAX as u128) as u64
    }
}

fn saturate(units: i64) -> i32 {
    units.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

struct Connection {
    codec: WireCodec,
    mux: StreamMultiplexer,
}

struct SessionState {
    conn: Option<Connection>,
    /// Incremented on every successful connect.
    generation: u64,
    time_base: u64,
    last_marker: u64,
    frame_token: Option<SpanToken>,
    log: EventLog,
    records: u64,
}

impl SessionState {
    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn connection_id(&self) -> Option<u64> {
        self.is_connected().then_some(self.generation)
    }

    fn emit(&mut self, class: &ClassDef, fields: &[Value]) {
        let Some(Connection { codec, mux }) = self.conn.as_mut() else {
            return;
        };
        match codec.encode(class, fields) {
            Ok(bytes) => {
                mux.write(bytes);
                mux.flush_boundary();
                self.records += 1;
            }
            Err(error) => {
                tracing::debug!(%error, class = %class.name, "dropping unencodable record");
            }
        }
    }

    fn units_since_base(&self, tb: Timebase, ticks: u64) -> i64 {
        tb.units(ticks.saturating_sub(self.time_base)) as i64
    }

    /// Delta from the last marker to `now`, moving the marker to `now`.
    fn advance_marker(&mut self, tb: Timebase, now: u64) -> i32 {
        let delta =
            self.units_since_base(tb, now) - self.units_since_base(tb, self.last_marker);
        self.last_marker = now;
        saturate(delta)
    }

    fn write_time(&mut self, tb: Timebase, now: u64, name: &str) {
        let delta = self.advance_marker(tb, now);
        self.emit(&TIME_CLASS, &[Value::from(name), Value::Int(delta)]);
    }

    fn write_span(&mut self, tb: Timebase, end: u64, length: u64, name: &str, value: Option<Value>) {
        let delta = self.advance_marker(tb, end);
        let span = saturate(tb.units(length) as i64);
        match value {
            Some(value) => self.emit(
                &SPAN_VALUE_CLASS,
                &[Value::from(name), Value::Int(span), Value::Int(delta), value],
            ),
            None => self.emit(
                &SPAN_CLASS,
                &[Value::from(name), Value::Int(span), Value::Int(delta)],
            ),
        }
    }

    fn end_span(&mut self, tb: Timebase, now: u64, token: SpanToken, name: &str, value: Option<Value>) {
        if !self.is_connected() {
            return;
        }
        let length = now.saturating_sub(token.0);
        if !self.log.admit_span(length) {
            return;
        }
        self.write_span(tb, now, length, name, value);
    }

    fn flush_log(&mut self, tb: Timebase) {
        for entry in self.log.take() {
            let name = self.log.name(entry.name).unwrap_or_default().to_string();
            match entry.kind {
                EntryKind::Value => {
                    let value = entry.value.unwrap_or(Value::Null);
                    self.emit(&VALUE_CLASS, &[Value::from(name), value]);
                }
                EntryKind::Time => self.write_time(tb, entry.time, &name),
                EntryKind::Span(length) => {
                    self.write_span(tb, entry.time, length, &name, entry.value)
                }
            }
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            records: self.records,
            spans_dropped: self.log.dropped_spans(),
            bytes_out: self.conn.as_ref().map_or(0, |c| c.mux.bytes_out()),
            sinks: self.conn.as_ref().map_or(0, |c| c.mux.sink_count()),
        }
    }

    /// Write closing metadata, flush and release the sinks.
    fn close(&mut self, tb: Timebase, now: u64) {
        if !self.is_connected() {
            return;
        }
        self.flush_log(tb);
        let records = self.records;
        let dropped = self.log.dropped_spans();
        let elapsed = self.units_since_base(tb, now);
        self.emit(&VALUE_CLASS, &[".tlm.records".into(), Value::UInt(records.min(u32::MAX as u64) as u32)]);
        self.emit(&VALUE_CLASS, &[".tlm.spans.dropped".into(), Value::UInt(dropped.min(u32::MAX as u64) as u32)]);
        self.emit(&VALUE_CLASS, &[".tlm.session.end".into(), Value::Double(elapsed as f64)]);

        if let Some(mut conn) = self.conn.take() {
            conn.mux.close();
            tracing::info!(
                records = self.records,
                bytes = conn.mux.bytes_out(),
                "telemetry session disconnected"
            );
        }
        self.frame_token = None;
        self.log.clear();
    }
}

/// Session settings fixed at construction.
pub struct SessionBuilder {
    clock: Option<Arc<dyn Clock>>,
    min_span: Duration,
    buffer_capacity: usize,
    flush_threshold: usize,
    player_version: String,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            clock: None,
            min_span: Duration::from_micros(1),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            player_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl SessionBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Spans shorter than this are dropped without writing anything.
    pub fn with_min_span(mut self, min_span: Duration) -> Self {
        self.min_span = min_span;
        self
    }

    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }

    pub fn with_flush_threshold(mut self, bytes: usize) -> Self {
        self.flush_threshold = bytes;
        self
    }

    /// Reported as `.player.version` in the session header.
    pub fn with_player_version(mut self, version: impl Into<String>) -> Self {
        self.player_version = version.into();
        self
    }

    pub fn build(self) -> Session {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let frequency = clock.frequency().max(1);
        let min_span_ticks =
            (self.min_span.as_nanos() * frequency as u128 / 1_000_000_000).min(u64::MAX as u128) as u64;
        let now = clock.now_ticks();

        Session {
            inner: Arc::new(SessionInner {
                clock,
                timebase: Timebase { frequency },
                buffer_capacity: self.buffer_capacity,
                flush_threshold: self.flush_threshold,
                player_version: self.player_version,
                state: Mutex::new(SessionState {
                    conn: None,
                    generation: 0,
                    time_base: now,
                    last_marker: now,
                    frame_token: None,
                    log: EventLog::new(min_span_ticks),
                    records: 0,
                }),
            }),
        }
    }
}

struct SessionInner {
    clock: Arc<dyn Clock>,
    timebase: Timebase,
    buffer_capacity: usize,
    flush_threshold: usize,
    player_version: String,
    state: Mutex<SessionState>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let now = self.clock.now_ticks();
        let tb = self.timebase;
        self.state.get_mut().close(tb, now);
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Open every transport named in `options`. Succeeds if at least one
    /// opens.
    pub fn connect(&self, options: &ConnectOptions) -> bool {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        if let Some(host) = &options.host {
            match TcpTransport::connect(host, options.port, options.connect_timeout) {
                Ok(tcp) => sinks.push(Box::new(tcp)),
                Err(error) => {
                    tracing::warn!(%error, %host, port = options.port, "telemetry viewer unreachable")
                }
            }
        }
        if let Some(path) = &options.output_file_path {
            match FileTransport::create(path) {
                Ok(file) => sinks.push(Box::new(file)),
                Err(error) => {
                    tracing::warn!(%error, path = %path.display(), "cannot open telemetry capture file")
                }
            }
        }
        self.connect_sinks(sinks)
    }

    /// Connect to caller-supplied sinks. Connecting while connected closes
    /// the current connection first.
    pub fn connect_sinks(&self, sinks: Vec<Box<dyn Sink>>) -> bool {
        let tb = self.inner.timebase;
        let mut state = self.inner.state.lock();
        state.close(tb, self.inner.clock.now_ticks());

        if sinks.is_empty() {
            tracing::warn!("no telemetry transport could be opened");
            return false;
        }

        let mut mux = StreamMultiplexer::new(self.inner.buffer_capacity, self.inner.flush_threshold);
        for sink in sinks {
            if !mux.add_sink(sink) {
                tracing::warn!(max = crate::telemetry::writer::MAX_SINKS, "too many telemetry sinks, extra sink ignored");
                break;
            }
        }
        mux.write(&format::header_bytes());

        let now = self.inner.clock.now_ticks();
        state.conn = Some(Connection {
            codec: WireCodec::new(),
            mux,
        });
        state.generation += 1;
        state.time_base = now;
        state.last_marker = now;
        state.frame_token = None;
        state.records = 0;
        state.log.clear();

        for (name, value) in self.header_values() {
            state.emit(&VALUE_CLASS, &[Value::from(name), value]);
        }
        if let Some(conn) = state.conn.as_mut() {
            conn.mux.flush();
        }
        tracing::info!(sinks = state.stats().sinks, "telemetry session connected");
        true
    }

    fn header_values(&self) -> Vec<(&'static str, Value)> {
        let date = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let mut capabilities = vec![Value::from("values"), Value::from("spans")];
        if self_sample::RegisterLayout::for_arch(self_sample::Arch::host()).is_some() {
            capabilities.push(Value::from("sampler"));
        }
        vec![
            (".tlm.version", Value::UInt(format::VERSION)),
            (".tlm.date", Value::Double(date)),
            (".player.version", Value::from(self.inner.player_version.as_str())),
            (".player.os", Value::from(std::env::consts::OS)),
            (".player.cpu", Value::from(std::env::consts::ARCH)),
            (".player.cpucount", Value::UInt(cpus as u32)),
            (".tlm.timeunit", Value::Double(1.0 / UNITS_PER_SECOND as f64)),
            (".tlm.capabilities", Value::List(capabilities)),
        ]
    }

    /// Write closing values, flush and release every transport.
    pub fn disconnect(&self) {
        let now = self.inner.clock.now_ticks();
        self.inner.state.lock().close(self.inner.timebase, now);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().is_connected()
    }

    /// Identifies the current connection; changes on every connect.
    pub fn connection_id(&self) -> Option<u64> {
        self.inner.state.lock().connection_id()
    }

    pub fn now_ticks(&self) -> u64 {
        self.inner.clock.now_ticks()
    }

    pub fn ticks_to_units(&self, ticks: u64) -> u64 {
        self.inner.timebase.units(ticks)
    }

    /// Protocol units between the session's time base and `ticks`.
    pub fn units_since_base(&self, ticks: u64) -> i64 {
        self.inner
            .state
            .lock()
            .units_since_base(self.inner.timebase, ticks)
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.state.lock().stats()
    }

    /// Untimed named value.
    pub fn write_value(&self, name: &str, value: impl Into<Value>) {
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.emit(&VALUE_CLASS, &[Value::from(name), value.into()]);
        }
    }

    /// Any record, untimed. For classes beyond the built-in ones.
    pub fn write_record(&self, class: &ClassDef, fields: &[Value]) {
        self.inner.state.lock().emit(class, fields);
    }

    /// Hold the session lock across several writes. No connect or
    /// disconnect can happen in between, so every record `f` writes lands
    /// on the same stream.
    pub fn write_batch<T>(&self, f: impl FnOnce(&mut RecordBatch<'_>) -> T) -> T {
        let mut state = self.inner.state.lock();
        f(&mut RecordBatch { state: &mut *state })
    }

    pub fn write_time(&self, name: &str) {
        let now = self.now_ticks();
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.write_time(self.inner.timebase, now, name);
        }
    }

    pub fn begin_span(&self) -> SpanToken {
        SpanToken(self.now_ticks())
    }

    pub fn end_span(&self, name: &str, token: SpanToken) {
        let now = self.now_ticks();
        self.inner
            .state
            .lock()
            .end_span(self.inner.timebase, now, token, name, None);
    }

    pub fn end_span_value(&self, name: &str, token: SpanToken, value: impl Into<Value>) {
        let now = self.now_ticks();
        self.inner
            .state
            .lock()
            .end_span(self.inner.timebase, now, token, name, Some(value.into()));
    }

    /// Write the `.exit` marker. Entries logged since the last frame are
    /// flushed first so the marker never precedes them on the wire.
    pub fn on_begin_frame(&self) {
        let now = self.now_ticks();
        let tb = self.inner.timebase;
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.flush_log(tb);
            state.write_time(tb, now, FRAME_EXIT);
        }
        state.frame_token = Some(SpanToken(now));
    }

    /// Flush the frame's log, then write the `.enter` span covering the
    /// frame.
    pub fn on_end_frame(&self) {
        let now = self.now_ticks();
        let tb = self.inner.timebase;
        let mut state = self.inner.state.lock();
        let token = state.frame_token.take();
        debug_assert!(token.is_some(), "on_end_frame called without on_begin_frame");
        if state.is_connected() {
            state.flush_log(tb);
        }
        if let Some(token) = token {
            state.end_span(tb, now, token, FRAME_ENTER, None);
        }
    }

    /// Defer a value until the next [`flush_log`](Self::flush_log).
    pub fn log_value(&self, name: &str, value: impl Into<Value>) {
        let now = self.now_ticks();
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.log.append_value(now, name, value.into());
        }
    }

    pub fn log_time(&self, name: &str) {
        let now = self.now_ticks();
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.log.append_time(now, name);
        }
    }

    pub fn log_span(&self, name: &str, token: SpanToken) {
        let now = self.now_ticks();
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.log.append_span(token.0, now, name, None);
        }
    }

    pub fn log_span_value(&self, name: &str, token: SpanToken, value: impl Into<Value>) {
        let now = self.now_ticks();
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.log.append_span(token.0, now, name, Some(value.into()));
        }
    }

    /// Encode every deferred entry in append order.
    pub fn flush_log(&self) {
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            state.flush_log(self.inner.timebase);
        }
    }

    /// Push buffered bytes out to the transports now.
    pub fn flush(&self) {
        if let Some(conn) = self.inner.state.lock().conn.as_mut() {
            conn.mux.flush();
        }
    }
}

/// Writes made while holding the session lock; see [`Session::write_batch`].
pub struct RecordBatch<'a> {
    state: &'a mut SessionState,
}

impl RecordBatch<'_> {
    pub fn connection_id(&self) -> Option<u64> {
        self.state.connection_id()
    }

    pub fn write_value(&mut self, name: &str, value: impl Into<Value>) {
        if self.state.is_connected() {
            self.state.emit(&VALUE_CLASS, &[Value::from(name), value.into()]);
        }
    }

    pub fn write_record(&mut self, class: &ClassDef, fields: &[Value]) {
        self.state.emit(class, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::TelemetryRecord;
    use crate::telemetry::test_util::{SharedBuf, decode_stream};
    use assert2::check;

    /// One tick per microsecond.
    fn session(min_span_us: u64) -> (Session, Arc<ManualClock>, SharedBuf) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let session = Session::builder()
            .with_clock(clock.clone())
            .with_min_span(Duration::from_micros(min_span_us))
            .build();
        let sink = SharedBuf::default();
        assert!(session.connect_sinks(vec![Box::new(sink.clone())]));
        (session, clock, sink)
    }

    /// Records after the connect-time header values.
    fn body(records: &[TelemetryRecord]) -> &[TelemetryRecord] {
        let header = records
            .iter()
            .take_while(|r| r.name().is_some_and(|n| n.starts_with(".tlm") || n.starts_with(".player")))
            .count();
        &records[header..]
    }

    #[test]
    fn disconnected_session_is_a_no_op() {
        let session = Session::new();
        session.write_value("v", 1);
        session.write_time("t");
        let token = session.begin_span();
        session.end_span("s", token);
        session.end_span_value("s", token, "x");
        session.log_value("v", 1);
        session.log_time("t");
        session.flush_log();
        session.on_begin_frame();
        session.on_end_frame();
        session.disconnect();
        check!(!session.is_connected());
        check!(session.stats() == SessionStats::default());
    }

    #[test]
    fn connect_without_sinks_fails() {
        let session = Session::new();
        check!(!session.connect_sinks(Vec::new()));
        check!(!session.connect(&ConnectOptions::default()));
        check!(!session.is_connected());
    }

    #[test]
    fn connect_writes_header_values_in_order() {
        let (session, _clock, sink) = session(0);
        session.flush();
        let records = decode_stream(&sink.contents());
        let names: Vec<_> = records.iter().filter_map(|r| r.name()).collect();
        check!(
            names
                == [
                    ".tlm.version",
                    ".tlm.date",
                    ".player.version",
                    ".player.os",
                    ".player.cpu",
                    ".player.cpucount",
                    ".tlm.timeunit",
                    ".tlm.capabilities",
                ]
        );
    }

    #[test]
    fn deltas_sum_to_elapsed_time() {
        let (session, clock, sink) = session(0);
        let steps = [3u64, 17, 250, 1, 0, 9_999];
        for step in steps {
            clock.advance(step);
            session.write_time("tick");
        }
        session.flush();

        let records = decode_stream(&sink.contents());
        let deltas: Vec<i32> = body(&records).iter().filter_map(|r| r.delta()).collect();
        check!(deltas == [3, 17, 250, 1, 0, 9_999]);
        check!(deltas.iter().map(|&d| d as u64).sum::<u64>() == steps.iter().sum::<u64>());
    }

    #[test]
    fn sub_unit_ticks_do_not_accumulate_error() {
        // 1000 ticks per unit; each step is 1.5 units.
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let session = Session::builder().with_clock(clock.clone()).build();
        let sink = SharedBuf::default();
        session.connect_sinks(vec![Box::new(sink.clone())]);
        for _ in 0..10 {
            clock.advance(1_500);
            session.write_time("tick");
        }
        session.flush();
        let records = decode_stream(&sink.contents());
        let total: i32 = body(&records).iter().filter_map(|r| r.delta()).sum();
        check!(total == 15);
    }

    #[test]
    fn clocks_off_the_megahertz_grid_still_count_microseconds() {
        for frequency in [1_000, 32_768, 1_999_999, 3_579_545] {
            let clock = Arc::new(ManualClock::new(frequency));
            let session = Session::builder().with_clock(clock.clone()).build();
            let sink = SharedBuf::default();
            session.connect_sinks(vec![Box::new(sink.clone())]);
            clock.advance(frequency);
            session.write_time("second");
            session.flush();
            let records = decode_stream(&sink.contents());
            let deltas: Vec<i32> = body(&records).iter().filter_map(|r| r.delta()).collect();
            check!(deltas == [1_000_000], "frequency {frequency}");
        }
    }

    #[test]
    fn single_ticks_of_a_slow_clock_sum_to_elapsed_time() {
        let clock = Arc::new(ManualClock::new(32_768));
        let session = Session::builder().with_clock(clock.clone()).build();
        let sink = SharedBuf::default();
        session.connect_sinks(vec![Box::new(sink.clone())]);
        for _ in 0..1_000 {
            clock.advance(1);
            session.write_time("tick");
        }
        session.flush();
        let records = decode_stream(&sink.contents());
        let total: i64 = body(&records).iter().filter_map(|r| r.delta()).map(i64::from).sum();
        // 1000 / 32768 s, rounded down.
        check!(total == 30_517);
        check!(session.ticks_to_units(32_768) == 1_000_000);
    }

    #[test]
    fn short_spans_write_nothing() {
        let (session, clock, sink) = session(100);
        session.flush();
        let before = sink.len();

        let token = session.begin_span();
        clock.advance(99);
        session.end_span("short", token);
        session.flush();
        check!(sink.len() == before);
        check!(session.stats().spans_dropped == 1);

        let token = session.begin_span();
        clock.advance(100);
        session.end_span("long", token);
        session.flush();
        let records = decode_stream(&sink.contents());
        check!(
            body(&records)
                == [TelemetryRecord::Span {
                    name: "long".into(),
                    span: 100,
                    delta: 199,
                }]
        );
    }

    #[test]
    fn span_value_carries_value() {
        let (session, clock, sink) = session(0);
        let token = session.begin_span();
        clock.advance(40);
        session.end_span_value("load", token, "level2");
        session.flush();
        let records = decode_stream(&sink.contents());
        check!(
            body(&records)
                == [TelemetryRecord::SpanValue {
                    name: "load".into(),
                    span: 40,
                    delta: 40,
                    value: Value::from("level2"),
                }]
        );
    }

    #[test]
    fn frame_markers_bracket_the_frame() {
        let (session, clock, sink) = session(0);
        clock.advance(5);
        session.on_begin_frame();
        clock.advance(16_000);
        session.on_end_frame();
        session.flush();

        let records = decode_stream(&sink.contents());
        check!(
            body(&records)
                == [
                    TelemetryRecord::Time {
                        name: FRAME_EXIT.into(),
                        delta: 5,
                    },
                    TelemetryRecord::Span {
                        name: FRAME_ENTER.into(),
                        span: 16_000,
                        delta: 16_000,
                    },
                ]
        );
    }

    #[test]
    fn frame_log_is_written_before_frame_markers() {
        let (session, clock, sink) = session(0);
        session.on_begin_frame();
        clock.advance(100);
        session.log_time("physics.done");
        clock.advance(900);
        session.on_end_frame();
        clock.advance(50);
        session.log_time("between");
        clock.advance(50);
        session.on_begin_frame();
        session.flush();

        let records = decode_stream(&sink.contents());
        let body = body(&records);
        check!(
            body == [
                TelemetryRecord::Time {
                    name: FRAME_EXIT.into(),
                    delta: 0,
                },
                TelemetryRecord::Time {
                    name: "physics.done".into(),
                    delta: 100,
                },
                TelemetryRecord::Span {
                    name: FRAME_ENTER.into(),
                    span: 1_000,
                    delta: 900,
                },
                TelemetryRecord::Time {
                    name: "between".into(),
                    delta: 50,
                },
                TelemetryRecord::Time {
                    name: FRAME_EXIT.into(),
                    delta: 50,
                },
            ]
        );
        check!(body.iter().filter_map(|r| r.delta()).all(|d| d >= 0));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "without on_begin_frame")]
    fn end_frame_without_begin_asserts() {
        let (session, _clock, _sink) = session(0);
        session.on_end_frame();
    }

    #[test]
    fn log_entries_are_timed_at_append_and_encoded_at_flush() {
        let (session, clock, sink) = session(0);
        clock.advance(10);
        session.log_time("a");
        let token = session.begin_span();
        clock.advance(30);
        session.log_span("b", token);
        session.log_value("c", 7);
        clock.advance(1_000);
        session.flush_log();
        session.flush();

        let records = decode_stream(&sink.contents());
        check!(
            body(&records)
                == [
                    TelemetryRecord::Time {
                        name: "a".into(),
                        delta: 10,
                    },
                    TelemetryRecord::Span {
                        name: "b".into(),
                        span: 30,
                        delta: 30,
                    },
                    TelemetryRecord::Value {
                        name: "c".into(),
                        value: Value::Int(7),
                    },
                ]
        );
    }

    #[test]
    fn disconnect_writes_closing_values_once() {
        let (session, clock, sink) = session(0);
        session.write_value("fps", 60.0);
        clock.advance(2_000);
        session.disconnect();
        let len = sink.len();
        session.disconnect();
        check!(sink.len() == len);

        let records = decode_stream(&sink.contents());
        let tail: Vec<_> = records.iter().rev().take(3).rev().collect();
        check!(tail[0].name() == Some(".tlm.records"));
        check!(tail[1].name() == Some(".tlm.spans.dropped"));
        check!(
            *tail[2]
                == TelemetryRecord::Value {
                    name: ".tlm.session.end".into(),
                    value: Value::Double(2_000.0),
                }
        );
    }

    #[test]
    fn reconnect_closes_previous_stream() {
        let (session, _clock, first) = session(0);
        let first_id = session.connection_id();
        let second = SharedBuf::default();
        check!(session.connect_sinks(vec![Box::new(second.clone())]));
        check!(session.connection_id() != first_id);

        let old = decode_stream(&first.contents());
        check!(old.last().and_then(|r| r.name()) == Some(".tlm.session.end"));
        session.flush();
        let new = decode_stream(&second.contents());
        check!(new.first().and_then(|r| r.name()) == Some(".tlm.version"));
    }

    #[test]
    fn connect_options_from_env_lookup() {
        let options = ConnectOptions::from_lookup(|key| match key {
            "TLM_HOST" => Some("10.0.0.2".into()),
            "TLM_PORT" => Some("9000".into()),
            "TLM_OUTPUT" => Some("/tmp/run.tlm".into()),
            _ => None,
        });
        check!(options.host.as_deref() == Some("10.0.0.2"));
        check!(options.port == 9000);
        check!(options.output_file_path == Some(PathBuf::from("/tmp/run.tlm")));

        let defaults = ConnectOptions::from_lookup(|key| match key {
            "TLM_PORT" => Some("not a port".into()),
            _ => None,
        });
        check!(defaults.host.is_none());
        check!(defaults.port == DEFAULT_PORT);
    }

    #[test]
    fn file_transport_receives_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captures/run.tlm");
        let session = Session::new();
        check!(session.connect(&ConnectOptions::default().with_output_file(&path)));
        session.write_value("answer", 42);
        session.disconnect();

        let records = decode_stream(&std::fs::read(&path).unwrap());
        check!(records.iter().any(|r| *r
            == TelemetryRecord::Value {
                name: "answer".into(),
                value: Value::Int(42),
            }));
    }
}
