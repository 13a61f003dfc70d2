use std::env;

use tlm_telemetry::telemetry::{TraceReader, print_summary, summarize};

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <capture_file>", args[0]);
        std::process::exit(1);
    }

    let capture = &args[1];
    println!("Analyzing capture: {capture}");

    let mut reader = TraceReader::open(capture).expect("Failed to open capture file");
    let version = reader.read_header().expect("Failed to read header");
    println!("Version: {version}");

    let records = reader.read_all().expect("Failed to read records");
    println!("Read {} records", records.len());

    let summary = summarize(&records);
    print_summary(&summary, &reader);
}
