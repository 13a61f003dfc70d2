use std::io::{self, Cursor, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::telemetry::events::TelemetryRecord;
use crate::telemetry::format::{self, WireDecoder};

/// A sink whose bytes stay readable after it is handed to a session.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decode a complete stream, header included.
pub(crate) fn decode_stream(bytes: &[u8]) -> Vec<TelemetryRecord> {
    let mut cursor = Cursor::new(bytes);
    format::read_header(&mut cursor).unwrap();
    let mut decoder = WireDecoder::new();
    let mut out = Vec::new();
    while let Some(record) = decoder.read_record(&mut cursor).unwrap() {
        out.push(TelemetryRecord::from_record(record));
    }
    out
}
