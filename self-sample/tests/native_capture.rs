#![cfg(target_os = "linux")]

mod common;

use assert2::check;
use common::{Burner, retry_busy};
use self_sample::{
    NativePlatform, Platform, RegisterLayout, SuspendGuard, process_symbols, walk_frame_pointers,
};

#[test]
fn captured_stacks_resolve_to_the_spinning_function() {
    let platform = NativePlatform::new();
    let Some(layout) = RegisterLayout::for_arch(platform.arch()) else {
        eprintln!("Skipping test: no register layout for {:?}", platform.arch());
        return;
    };
    let symbols = process_symbols();
    assert!(!symbols.is_empty(), "test binary has no symbol table");

    let burner = Burner::spawn();
    let mut hits = 0;
    for _ in 0..50 {
        let frames = retry_busy(|| {
            let _resume = SuspendGuard::suspend(&platform, &burner.target)?;
            let regs = platform.read_registers(&burner.target)?;
            walk_frame_pointers(&platform, &burner.target, &regs, layout, 64, |_| false)
        })
        .unwrap();
        check!(!frames.is_empty());
        if frames
            .iter()
            .filter_map(|&addr| symbols.lookup(addr))
            .any(|name| name.name.contains("burn_cpu"))
        {
            hits += 1;
        }
    }
    check!(hits > 0, "no capture passed through burn_cpu");
}

#[test]
fn every_thread_resumes_after_capture() {
    let platform = NativePlatform::new();
    if RegisterLayout::for_arch(platform.arch()).is_none() {
        return;
    }
    let burners: Vec<_> = (0..4).map(|_| Burner::spawn()).collect();
    for _ in 0..10 {
        for burner in &burners {
            retry_busy(|| {
                let _resume = SuspendGuard::suspend(&platform, &burner.target)?;
                platform.read_registers(&burner.target)
            })
            .unwrap();
        }
    }
    // Dropping the burners joins them, which hangs if any stayed stopped.
    drop(burners);
}

#[test]
fn process_table_is_sorted_and_resolves_local_code() {
    let symbols = process_symbols();
    let entries = symbols.entries();
    assert!(entries.windows(2).all(|w| w[0].address < w[1].address));

    let addr = common::burn_cpu as fn(&std::sync::atomic::AtomicBool) as usize as u64;
    let name = symbols.lookup(addr).expect("burn_cpu not resolved");
    check!(name.name.ends_with("burn_cpu"), "resolved to {name}");
}
