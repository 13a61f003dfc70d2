//! Offline reading of a captured stream.
//!
//! [`TraceReader`] decodes records back into [`TelemetryRecord`]s and places
//! each on the session timeline by summing deltas. [`summarize`] builds the
//! per-name span statistics and sampler hot list printed by
//! [`print_summary`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::Serialize;

use crate::telemetry::events::{METHOD_NAME_MAP, TelemetryRecord};
use crate::telemetry::format::{self, ProtocolError, Record, WireDecoder};

/// A decoded record and where it sits on the session timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimedRecord {
    /// Protocol units since the session's time base.
    pub time: i64,
    #[serde(flatten)]
    pub record: TelemetryRecord,
}

pub struct TraceReader<R> {
    reader: R,
    decoder: WireDecoder,
    version: Option<u32>,
    elapsed: i64,
    /// Method names in id order; id `n` is at index `n - 1`.
    pub method_names: Vec<String>,
}

impl TraceReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: WireDecoder::new(),
            version: None,
            elapsed: 0,
            method_names: Vec::new(),
        }
    }

    /// Read and check the stream header. Called implicitly by the first
    /// read if the caller did not.
    pub fn read_header(&mut self) -> Result<u32, ProtocolError> {
        if let Some(version) = self.version {
            return Ok(version);
        }
        let version = format::read_header(&mut self.reader)?;
        self.version = Some(version);
        Ok(version)
    }

    /// The next raw record, or `None` at the end of the stream.
    pub fn read_record(&mut self) -> Result<Option<Record>, ProtocolError> {
        self.read_header()?;
        self.decoder.read_record(&mut self.reader)
    }

    /// The next record, typed and timed. Method name tables are absorbed
    /// into [`method_names`](Self::method_names) and also returned.
    pub fn read_event(&mut self) -> Result<Option<TimedRecord>, ProtocolError> {
        let Some(record) = self.read_record()? else {
            return Ok(None);
        };
        let record = TelemetryRecord::from_record(record);
        if let Some(delta) = record.delta() {
            self.elapsed += i64::from(delta);
        }
        if let TelemetryRecord::Value { name, value } = &record
            && name == METHOD_NAME_MAP
            && let Some(names) = value.as_list()
        {
            self.method_names
                .extend(names.iter().filter_map(|n| n.as_str()).map(str::to_string));
        }
        Ok(Some(TimedRecord {
            time: self.elapsed,
            record,
        }))
    }

    pub fn read_all(&mut self) -> Result<Vec<TimedRecord>, ProtocolError> {
        let mut records = Vec::new();
        while let Some(record) = self.read_event()? {
            records.push(record);
        }
        Ok(records)
    }

    pub fn method_name(&self, id: u32) -> Option<&str> {
        let index = id.checked_sub(1)?;
        self.method_names.get(index as usize).map(String::as_str)
    }

    /// Units elapsed up to the last timed record read.
    pub fn elapsed_units(&self) -> i64 {
        self.elapsed
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SpanStats {
    pub count: usize,
    pub total_units: u64,
    pub max_units: u64,
}

#[derive(Debug, Default)]
pub struct TraceSummary {
    pub total_records: usize,
    pub duration_units: i64,
    pub frames: usize,
    pub spans: HashMap<String, SpanStats>,
    pub samples: usize,
    pub ticks: u64,
    /// Ticks per leaf method id.
    pub leaf_ticks: HashMap<u32, u64>,
    pub values: usize,
}

impl TraceSummary {
    /// Leaf methods by tick count, highest first.
    pub fn hottest(&self, limit: usize) -> Vec<(u32, u64)> {
        let mut hot: Vec<_> = self.leaf_ticks.iter().map(|(&id, &t)| (id, t)).collect();
        hot.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hot.truncate(limit);
        hot
    }
}

pub fn summarize(records: &[TimedRecord]) -> TraceSummary {
    let mut summary = TraceSummary {
        total_records: records.len(),
        duration_units: records.last().map_or(0, |r| r.time),
        ..TraceSummary::default()
    };
    for timed in records {
        match &timed.record {
            TelemetryRecord::Span { name, span, .. }
            | TelemetryRecord::SpanValue { name, span, .. } => {
                if name == crate::telemetry::events::FRAME_ENTER {
                    summary.frames += 1;
                }
                let span = (*span).max(0) as u64;
                let stats = summary.spans.entry(name.clone()).or_default();
                stats.count += 1;
                stats.total_units += span;
                stats.max_units = stats.max_units.max(span);
            }
            TelemetryRecord::Sample(sample) => {
                let ticks = sample.tick_count.max(0) as u64;
                summary.samples += 1;
                summary.ticks += ticks;
                if let Some(&leaf) = sample.callstack.first() {
                    *summary.leaf_ticks.entry(leaf).or_default() += ticks;
                }
            }
            TelemetryRecord::Value { .. } => summary.values += 1,
            TelemetryRecord::Time { .. } | TelemetryRecord::Other(_) => {}
        }
    }
    summary
}

pub fn print_summary<R: Read>(summary: &TraceSummary, reader: &TraceReader<R>) {
    println!("=== Telemetry Summary ===");
    println!("Records: {}", summary.total_records);
    println!("Duration: {:.3}s", summary.duration_units as f64 / 1e6);
    println!("Frames: {}", summary.frames);
    println!("Values: {}", summary.values);

    let mut spans: Vec<_> = summary.spans.iter().collect();
    spans.sort_by(|a, b| b.1.total_units.cmp(&a.1.total_units).then(a.0.cmp(b.0)));
    println!("\n=== Spans ===");
    for (name, stats) in spans {
        let avg = stats.total_units as f64 / stats.count.max(1) as f64;
        println!(
            "{name:<32} count={:<8} total={:.2}ms avg={avg:.1}us max={}us",
            stats.count,
            stats.total_units as f64 / 1000.0,
            stats.max_units,
        );
    }

    if summary.samples > 0 {
        println!("\n=== Sampler ===");
        println!("Samples: {} ({} ticks)", summary.samples, summary.ticks);
        for (id, ticks) in summary.hottest(10) {
            let pct = ticks as f64 / summary.ticks as f64 * 100.0;
            let name = reader
                .method_name(id)
                .unwrap_or(crate::telemetry::sampler::UNKNOWN_METHOD);
            println!("{pct:5.1}% {ticks:>8} {name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::{FRAME_ENTER, Sample};
    use crate::telemetry::format::Value;
    use crate::telemetry::session::{ManualClock, Session};
    use crate::telemetry::test_util::SharedBuf;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    fn captured_stream() -> Vec<u8> {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let session = Session::builder()
            .with_clock(clock.clone())
            .with_min_span(Duration::ZERO)
            .build();
        let sink = SharedBuf::default();
        session.connect_sinks(vec![Box::new(sink.clone())]);

        for _ in 0..3 {
            session.on_begin_frame();
            let token = session.begin_span();
            clock.advance(250);
            session.end_span("update", token);
            clock.advance(750);
            session.on_end_frame();
        }
        session.write_value(METHOD_NAME_MAP, vec!["leaf", "main"]);
        let mut sample = Sample::new(1_500, vec![1, 2]);
        sample.add_tick(1_600.0);
        session.write_record(
            &crate::telemetry::events::SAMPLE_CLASS,
            &sample.field_values(),
        );
        session.disconnect();
        sink.contents()
    }

    #[test]
    fn timeline_sums_deltas() {
        let mut reader = TraceReader::new(Cursor::new(captured_stream()));
        assert_eq!(reader.read_header().unwrap(), format::VERSION);
        let records = reader.read_all().unwrap();

        let enters: Vec<i64> = records
            .iter()
            .filter(|r| r.record.name() == Some(FRAME_ENTER))
            .map(|r| r.time)
            .collect();
        assert_eq!(enters, vec![1_000, 2_000, 3_000]);
        assert_eq!(reader.elapsed_units(), 3_000);
    }

    #[test]
    fn method_names_are_absorbed() {
        let mut reader = TraceReader::new(Cursor::new(captured_stream()));
        reader.read_all().unwrap();
        assert_eq!(reader.method_name(1), Some("leaf"));
        assert_eq!(reader.method_name(2), Some("main"));
        assert_eq!(reader.method_name(0), None);
        assert_eq!(reader.method_name(3), None);
    }

    #[test]
    fn summary_counts_frames_spans_and_ticks() {
        let mut reader = TraceReader::new(Cursor::new(captured_stream()));
        let summary = summarize(&reader.read_all().unwrap());
        assert_eq!(summary.frames, 3);
        assert_eq!(
            summary.spans["update"],
            SpanStats {
                count: 3,
                total_units: 750,
                max_units: 250,
            }
        );
        assert_eq!(summary.spans[FRAME_ENTER].total_units, 3_000);
        assert_eq!(summary.samples, 1);
        assert_eq!(summary.ticks, 2);
        assert_eq!(summary.hottest(5), vec![(1, 2)]);
    }

    #[test]
    fn read_record_reads_header_first() {
        let mut reader = TraceReader::new(Cursor::new(captured_stream()));
        let first = reader.read_record().unwrap().unwrap();
        assert_eq!(first.get("name"), Some(&Value::from(".tlm.version")));
    }

    #[test]
    fn garbage_is_rejected() {
        let mut reader = TraceReader::new(Cursor::new(b"not a telemetry stream".to_vec()));
        assert!(matches!(
            reader.read_event(),
            Err(ProtocolError::BadMagic(_))
        ));
    }

    #[test]
    fn truncated_stream_is_a_hard_error() {
        let mut bytes = captured_stream();
        bytes.truncate(bytes.len() - 3);
        let mut reader = TraceReader::new(Cursor::new(bytes));
        let result = reader.read_all();
        assert!(matches!(result, Err(ProtocolError::Truncated)));
    }

    #[test]
    fn open_reads_capture_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.tlm");
        std::fs::write(&path, captured_stream()).unwrap();
        let mut reader = TraceReader::open(&path).unwrap();
        assert!(!reader.read_all().unwrap().is_empty());
        assert!(matches!(
            TraceReader::open(dir.path().join("missing.tlm")),
            Err(ProtocolError::Io(_))
        ));
    }
}
