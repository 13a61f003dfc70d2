use std::sync::LazyLock;

use serde::Serialize;

use crate::telemetry::format::{ClassDef, Record, Value};

/// Untimed named value: `{name, value}`.
pub static VALUE_CLASS: LazyLock<ClassDef> =
    LazyLock::new(|| ClassDef::new(".value", ["name", "value"]));
/// Time marker: `{name, delta}`.
pub static TIME_CLASS: LazyLock<ClassDef> =
    LazyLock::new(|| ClassDef::new(".time", ["name", "delta"]));
/// Completed span: `{name, span, delta}`.
pub static SPAN_CLASS: LazyLock<ClassDef> =
    LazyLock::new(|| ClassDef::new(".span", ["name", "span", "delta"]));
/// Completed span carrying a value: `{name, span, delta, value}`.
pub static SPAN_VALUE_CLASS: LazyLock<ClassDef> =
    LazyLock::new(|| ClassDef::new(".spanValue", ["name", "span", "delta", "value"]));
/// Coalesced profiler sample.
pub static SAMPLE_CLASS: LazyLock<ClassDef> = LazyLock::new(|| {
    ClassDef::new(
        ".sampler.sample",
        ["time", "numticks", "ticktimes", "callstack"],
    )
});

/// Name of the `.value` record that carries newly assigned method names.
/// The value is a list of strings. Method ids are assigned from 1 in the
/// order names appear across all such records in a stream.
pub const METHOD_NAME_MAP: &str = ".sampler.methodNameMap";

/// Frame markers written by `Session::on_begin_frame` / `on_end_frame`.
pub const FRAME_EXIT: &str = ".exit";
pub const FRAME_ENTER: &str = ".enter";

/// One or more identical consecutive stack captures.
///
/// Times are in protocol units (microseconds) since the session's time base.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub time: i32,
    #[serde(rename = "numticks")]
    pub tick_count: i32,
    #[serde(rename = "ticktimes")]
    pub tick_times: Vec<f64>,
    /// Method ids, leaf first.
    pub callstack: Vec<u32>,
}

impl Sample {
    pub fn new(time: i32, callstack: Vec<u32>) -> Self {
        Self {
            time,
            tick_count: 1,
            tick_times: vec![time as f64],
            callstack,
        }
    }

    /// Fold another capture of the same stack into this sample.
    pub fn add_tick(&mut self, time: f64) {
        self.tick_count = self.tick_count.saturating_add(1);
        self.tick_times.push(time);
    }

    pub(crate) fn field_values(&self) -> Vec<Value> {
        vec![
            Value::Int(self.time),
            Value::Int(self.tick_count),
            Value::List(self.tick_times.iter().copied().map(Value::Double).collect()),
            Value::List(self.callstack.iter().copied().map(Value::UInt).collect()),
        ]
    }
}

/// Typed view over the well-known record classes.
///
/// NOTE: the `Serialize` impl here is just for convenience of writing to
/// JSON. It does NOT reflect the wire format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record")]
pub enum TelemetryRecord {
    Value {
        name: String,
        value: Value,
    },
    Time {
        name: String,
        delta: i32,
    },
    Span {
        name: String,
        span: i32,
        delta: i32,
    },
    SpanValue {
        name: String,
        span: i32,
        delta: i32,
        value: Value,
    },
    Sample(Sample),
    /// Any record whose class is not one of the above.
    Other(Record),
}

impl TelemetryRecord {
    pub fn class(&self) -> &ClassDef {
        match self {
            TelemetryRecord::Value { .. } => &VALUE_CLASS,
            TelemetryRecord::Time { .. } => &TIME_CLASS,
            TelemetryRecord::Span { .. } => &SPAN_CLASS,
            TelemetryRecord::SpanValue { .. } => &SPAN_VALUE_CLASS,
            TelemetryRecord::Sample(_) => &SAMPLE_CLASS,
            TelemetryRecord::Other(record) => &record.class,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TelemetryRecord::Value { name, .. }
            | TelemetryRecord::Time { name, .. }
            | TelemetryRecord::Span { name, .. }
            | TelemetryRecord::SpanValue { name, .. } => Some(name),
            TelemetryRecord::Sample(_) | TelemetryRecord::Other(_) => None,
        }
    }

    /// Units elapsed since the previous timed record, for timed records.
    pub fn delta(&self) -> Option<i32> {
        match self {
            TelemetryRecord::Time { delta, .. }
            | TelemetryRecord::Span { delta, .. }
            | TelemetryRecord::SpanValue { delta, .. } => Some(*delta),
            _ => None,
        }
    }

    pub fn field_values(&self) -> Vec<Value> {
        match self {
            TelemetryRecord::Value { name, value } => {
                vec![Value::from(name.as_str()), value.clone()]
            }
            TelemetryRecord::Time { name, delta } => {
                vec![Value::from(name.as_str()), Value::Int(*delta)]
            }
            TelemetryRecord::Span { name, span, delta } => vec![
                Value::from(name.as_str()),
                Value::Int(*span),
                Value::Int(*delta),
            ],
            TelemetryRecord::SpanValue {
                name,
                span,
                delta,
                value,
            } => vec![
                Value::from(name.as_str()),
                Value::Int(*span),
                Value::Int(*delta),
                value.clone(),
            ],
            TelemetryRecord::Sample(sample) => sample.field_values(),
            TelemetryRecord::Other(record) => record.fields.clone(),
        }
    }

    pub fn to_record(&self) -> Record {
        Record::new(self.class().clone(), self.field_values())
    }

    /// Classify a decoded record. Records that look like a well-known class
    /// but carry the wrong field types come back as `Other`.
    pub fn from_record(record: Record) -> Self {
        Self::typed(&record).unwrap_or(TelemetryRecord::Other(record))
    }

    fn typed(record: &Record) -> Option<Self> {
        let f = &record.fields;
        if f.len() != record.class.fields.len() {
            return None;
        }
        let name = || f.first().and_then(Value::as_str).map(str::to_string);
        let class = &record.class;
        if *class == *VALUE_CLASS {
            Some(TelemetryRecord::Value {
                name: name()?,
                value: f[1].clone(),
            })
        } else if *class == *TIME_CLASS {
            Some(TelemetryRecord::Time {
                name: name()?,
                delta: f[1].as_int()?,
            })
        } else if *class == *SPAN_CLASS {
            Some(TelemetryRecord::Span {
                name: name()?,
                span: f[1].as_int()?,
                delta: f[2].as_int()?,
            })
        } else if *class == *SPAN_VALUE_CLASS {
            Some(TelemetryRecord::SpanValue {
                name: name()?,
                span: f[1].as_int()?,
                delta: f[2].as_int()?,
                value: f[3].clone(),
            })
        } else if *class == *SAMPLE_CLASS {
            Some(TelemetryRecord::Sample(Sample {
                time: f[0].as_int()?,
                tick_count: f[1].as_int()?,
                tick_times: f[2]
                    .as_list()?
                    .iter()
                    .map(Value::as_double)
                    .collect::<Option<_>>()?,
                callstack: f[3]
                    .as_list()?
                    .iter()
                    .map(Value::as_uint)
                    .collect::<Option<_>>()?,
            }))
        } else {
            None
        }
    }
}
