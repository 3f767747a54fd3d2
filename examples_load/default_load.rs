use std::io;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use tracing_stackdriver::{StackdriverFormatter, StackdriverLayer};

fn main() {
    let formatter = StackdriverFormatter::builder()
        .service("load-test")
        .version("0.1.0")
        .build();
    let layer = StackdriverLayer::new(formatter).with_writer(io::sink);
    let written = layer.written_events.clone();
    tracing::subscriber::set_global_default(Registry::default().with(layer))
        .expect("set global subscriber");

    let n: u64 = 100_000;

    let start = Instant::now();
    for i in 0..n {
        info!(iteration = i, "default load test info");
    }
    let info_elapsed = start.elapsed();

    // Error entries walk the call stack, so they are measured separately.
    let start = Instant::now();
    for i in 0..n / 10 {
        error!(iteration = i, "default load test error");
    }
    let error_elapsed = start.elapsed();

    println!("info: formatted {} events in {:?} (~{:.0} ev/s)",
        n,
        info_elapsed,
        n as f64 / info_elapsed.as_secs_f64()
    );
    println!("error: formatted {} events in {:?} (~{:.0} ev/s)",
        n / 10,
        error_elapsed,
        (n / 10) as f64 / error_elapsed.as_secs_f64()
    );
    println!("written: {}", written.load(std::sync::atomic::Ordering::Relaxed));
}
