//! Logging setup for the escape analysis pass
//!
//! The pass logs through the `log` facade; binaries and tests pick a backend
//! here, built on `env_logger`.
//!
//! # Log Levels
//!
//! - `error!` - Failures the driver reports before exiting
//! - `warn!` - Suspicious input (e.g. configuration that matches no function)
//! - `info!` - One line per pass run: start and final counts
//! - `debug!` - Per SCC and per wave progress, graph sizes, round counts
//! - `trace!` - Every edge added and every status change
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=info escapist analyze program.json
//! RUST_LOG=compiler::escape::propagate=trace escapist analyze program.json
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at the default level (Warn). Later calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging at `level`. Later calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from `RUST_LOG`, falling back to Warn
pub fn init_from_env() {
    INIT.call_once(|| {
        Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests
///
/// Output is captured by the test harness; safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

/// Whether `init`, `init_with_level` or `init_from_env` has run
pub fn is_initialized() -> bool {
    INIT.is_completed()
}
