//! In-process mock server speaking the wire protocol over real TCP sockets.
//!
//! Tests script a [`MockServer`] through its shared state: stored collections,
//! batch sizes, the `ismaster` answer, forced write errors and dropped connections. The
//! server records what it was asked so tests can assert on traffic (kill-cursors messages,
//! accepted connections, discovery probes).
mod server;
mod thread;

pub(crate) use server::MockServer;

/// Routes `log` output through the test harness; safe to call from every test.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
