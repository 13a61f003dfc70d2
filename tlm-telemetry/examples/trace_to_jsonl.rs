//! Convert a binary telemetry capture to JSONL (one JSON object per line).
//!
//! Usage:
//!   cargo run --example trace_to_jsonl -- <input.tlm> [output.jsonl]
//!
//! If output is omitted, writes to stdout.

use std::io::{BufWriter, Write};

use tlm_telemetry::telemetry::TraceReader;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: trace_to_jsonl <input.tlm> [output.jsonl]");
        std::process::exit(1);
    }

    let mut reader = TraceReader::open(&args[1])?;
    let version = reader.read_header()?;
    eprintln!("telemetry stream v{version}, converting...");

    let out: Box<dyn Write> = if let Some(path) = args.get(2) {
        Box::new(std::fs::File::create(path)?)
    } else {
        Box::new(std::io::stdout().lock())
    };
    let mut w = BufWriter::new(out);

    let mut count = 0u64;
    while let Some(record) = reader.read_event()? {
        serde_json::to_writer(&mut w, &record)?;
        w.write_all(b"\n")?;
        count += 1;
    }
    w.flush()?;
    eprintln!(
        "{count} records written, {} method names",
        reader.method_names.len()
    );
    Ok(())
}
