//! Output side of a session: a byte buffer fanned out to several sinks.

use std::fs::{self, File};
use std::io::{self, Write};
use std::mem;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A destination for encoded telemetry bytes.
pub trait Sink: Write + Send {}

impl<T: Write + Send> Sink for T {}

pub const MAX_SINKS: usize = 8;
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_FLUSH_THRESHOLD: usize = 16 * 1024;

/// Buffers encoded records and copies them to every live sink.
///
/// A sink that returns an error is dropped on the spot; the remaining sinks
/// still receive the bytes of the same call. With no sinks left, writes are
/// discarded.
pub struct StreamMultiplexer {
    sinks: Vec<Box<dyn Sink>>,
    buffer: Vec<u8>,
    capacity: usize,
    flush_threshold: usize,
    bytes_out: u64,
    evicted: u64,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_FLUSH_THRESHOLD)
    }
}

impl StreamMultiplexer {
    pub fn new(capacity: usize, flush_threshold: usize) -> Self {
        Self {
            sinks: Vec::new(),
            buffer: Vec::with_capacity(capacity),
            capacity,
            flush_threshold: flush_threshold.min(capacity),
            bytes_out: 0,
            evicted: 0,
        }
    }

    /// Returns false (dropping the sink) when `MAX_SINKS` are already attached.
    pub fn add_sink(&mut self, sink: Box<dyn Sink>) -> bool {
        if self.sinks.len() >= MAX_SINKS {
            return false;
        }
        self.sinks.push(sink);
        true
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes handed to sinks so far, counted once per fan-out.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if self.buffer.len() + bytes.len() > self.capacity {
            self.drain();
        }
        if bytes.len() > self.capacity {
            self.fan_out(bytes);
        } else {
            self.buffer.extend_from_slice(bytes);
        }
    }

    /// Called after each complete record: flush once enough has accumulated.
    pub fn flush_boundary(&mut self) {
        if self.buffer.len() >= self.flush_threshold {
            self.flush();
        }
    }

    /// Drain the buffer to every sink and flush them.
    pub fn flush(&mut self) {
        self.drain();
        let mut i = 0;
        while i < self.sinks.len() {
            match self.sinks[i].flush() {
                Ok(()) => i += 1,
                Err(error) => self.evict(i, &error),
            }
        }
    }

    /// Flush and release every sink.
    pub fn close(&mut self) {
        self.flush();
        self.sinks.clear();
    }

    fn drain(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let buffer = mem::take(&mut self.buffer);
        self.fan_out(&buffer);
        self.buffer = buffer;
        self.buffer.clear();
    }

    fn fan_out(&mut self, bytes: &[u8]) {
        if self.sinks.is_empty() {
            return;
        }
        let mut i = 0;
        while i < self.sinks.len() {
            match self.sinks[i].write_all(bytes) {
                Ok(()) => i += 1,
                // swap_remove moves the last sink into slot i; retry the same index.
                Err(error) => self.evict(i, &error),
            }
        }
        self.bytes_out += bytes.len() as u64;
    }

    fn evict(&mut self, index: usize, error: &io::Error) {
        drop(self.sinks.swap_remove(index));
        self.evicted += 1;
        tracing::warn!(%error, remaining = self.sinks.len(), "dropping failed telemetry sink");
    }
}

/// TCP connection to a live viewer.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<Self> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Self { stream });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host}:{port} did not resolve to any address"),
            )
        }))
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Local capture file. The multiplexer already buffers, so writes go
/// straight to the file.
pub struct FileTransport {
    file: File,
    path: PathBuf,
}

impl FileTransport {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for FileTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
