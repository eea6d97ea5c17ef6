#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use tollgate::{InMemoryStore, ManualClock, RateLimiter};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture log output on the current thread until the guard drops.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (writer, guard)
}

pub fn breaker(failure_threshold: usize, clock: &ManualClock) -> CircuitBreaker {
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(failure_threshold)
        .success_threshold(2)
        .call_timeout(Duration::from_millis(250))
        .backoff(Duration::from_secs(1), Duration::from_secs(30))
        .max_jitter(Duration::ZERO)
        .build()
        .expect("valid breaker config");
    CircuitBreaker::new(config).with_clock(clock.clone())
}

pub fn limiter(store: &InMemoryStore, clock: &ManualClock, failure_threshold: usize) -> RateLimiter {
    RateLimiter::builder(store.clone())
        .clock(clock.clone())
        .breaker(breaker(failure_threshold, clock))
        .build()
        .expect("valid limiter")
}
