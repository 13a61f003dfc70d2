//! A fake game loop instrumented with spans, deferred values and the
//! sampler.
//!
//!   TLM_OUTPUT=frames.tlm RUST_LOG=debug cargo run --example frame_loop
//!
//! Set `TLM_HOST` as well to stream to a live viewer.

use std::time::Duration;

use tlm_telemetry::telemetry::{ConnectOptions, Sampler, SamplerConfig, Session};
use tracing_subscriber::EnvFilter;

#[inline(never)]
fn physics(steps: u32) -> f64 {
    let mut x = 0.0f64;
    for i in 0..steps * 10_000 {
        x = (x + i as f64).sqrt();
    }
    x
}

#[inline(never)]
fn render() {
    std::thread::sleep(Duration::from_millis(4));
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut options = ConnectOptions::from_env();
    if options.host.is_none() && options.output_file_path.is_none() {
        options = options.with_output_file("frames.tlm");
    }

    let session = Session::new();
    if !session.connect(&options) {
        eprintln!("no telemetry transport available; running uninstrumented");
    }
    let sampler = Sampler::start_current(
        &session,
        SamplerConfig {
            start_delay: Duration::ZERO,
            ..SamplerConfig::default()
        },
    );

    for frame in 0..300u32 {
        session.on_begin_frame();

        let update = session.begin_span();
        let x = physics(1 + frame % 7);
        session.end_span_value("physics", update, x);

        let draw = session.begin_span();
        render();
        session.log_span("render", draw);
        session.log_value("frame", frame);

        session.on_end_frame();
        sampler.write();
    }

    drop(sampler);
    let stats = session.stats();
    session.disconnect();
    println!(
        "{} records, {} bytes, {} short spans dropped",
        stats.records, stats.bytes_out, stats.spans_dropped
    );
    if let Some(path) = &options.output_file_path {
        println!("capture written to {}", path.display());
    }
}
