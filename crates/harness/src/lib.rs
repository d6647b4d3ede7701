pub mod bench;
pub mod faults;
pub mod fixtures;

pub use bench::{BenchStore, TestBench};
pub use faults::{FaultSwitch, FlakyStore};

/// Route engine logs to the test writer. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}
