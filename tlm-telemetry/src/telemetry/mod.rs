pub mod analysis;
pub mod buffer;
pub mod events;
pub mod format;
pub mod sampler;
pub mod session;
#[cfg(test)]
mod test_util;
pub mod writer;

pub use analysis::{SpanStats, TimedRecord, TraceReader, TraceSummary, print_summary, summarize};
pub use events::{FRAME_ENTER, FRAME_EXIT, METHOD_NAME_MAP, Sample, TelemetryRecord};
pub use format::{ClassDef, ProtocolError, Record, Value, WireCodec, WireDecoder};
pub use sampler::{MethodMap, SampleCollector, Sampler, SamplerConfig, SamplerStats};
pub use session::{
    Clock, ConnectOptions, ManualClock, MonotonicClock, RecordBatch, Session, SessionBuilder,
    SessionStats, SpanToken,
};
pub use writer::{FileTransport, Sink, StreamMultiplexer, TcpTransport};
