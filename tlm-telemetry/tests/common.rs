use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

use tlm_telemetry::telemetry::{TimedRecord, TraceReader};

/// Returns true when running in CI (GitHub Actions sets CI=true).
#[allow(dead_code)]
pub fn is_ci() -> bool {
    std::env::var("CI").is_ok()
}

/// A sink whose bytes can be inspected after the session owns it.
///
/// ```rust,ignore
/// let (sink, bytes) = CapturingSink::new();
/// session.connect_sinks(vec![Box::new(sink)]);
/// // ...
/// let records = decode(&bytes.lock().unwrap());
/// ```
pub struct CapturingSink(Arc<Mutex<Vec<u8>>>);

impl CapturingSink {
    #[allow(dead_code)]
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        (Self(bytes.clone()), bytes)
    }
}

impl Write for CapturingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decode a complete captured stream.
#[allow(dead_code)]
pub fn decode(bytes: &[u8]) -> (Vec<TimedRecord>, Vec<String>) {
    let mut reader = TraceReader::new(Cursor::new(bytes));
    let records = reader.read_all().unwrap();
    (records, reader.method_names)
}
