//! Phase timestamps: DNS, TCP, TLS, TTFB, total.
//!
//! Pure instrumentation — no suspension, no fallible operations. A
//! [`Recorder`] is created at the start of a `connect`/`Do` call and fed
//! phase boundaries as they occur; [`Recorder::finish`] produces an
//! immutable [`Timings`] snapshot.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
struct Phase {
    start: Option<Instant>,
    end: Option<Instant>,
}

impl Phase {
    fn duration(&self) -> Duration {
        match (self.start, self.end) {
            (Some(s), Some(e)) => e.saturating_duration_since(s),
            _ => Duration::ZERO,
        }
    }
}

/// Mutable timing recorder, owned for the lifetime of a single request
/// attempt.
#[derive(Debug, Clone)]
pub struct Recorder {
    begin: Instant,
    dns: Phase,
    tcp: Phase,
    tls: Phase,
    ttfb: Phase,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            begin: Instant::now(),
            dns: Phase::default(),
            tcp: Phase::default(),
            tls: Phase::default(),
            ttfb: Phase::default(),
        }
    }

    pub fn dns_start(&mut self) {
        self.dns.start = Some(Instant::now());
    }
    pub fn dns_end(&mut self) {
        self.dns.end = Some(Instant::now());
    }
    pub fn tcp_start(&mut self) {
        self.tcp.start = Some(Instant::now());
    }
    pub fn tcp_end(&mut self) {
        self.tcp.end = Some(Instant::now());
    }
    pub fn tls_start(&mut self) {
        self.tls.start = Some(Instant::now());
    }
    pub fn tls_end(&mut self) {
        self.tls.end = Some(Instant::now());
    }
    /// Marks the moment the request write completed, i.e. the TTFB clock
    /// starts ticking.
    pub fn ttfb_start(&mut self) {
        self.ttfb.start = Some(Instant::now());
    }
    /// Marks the moment the first response byte became readable.
    pub fn ttfb_end(&mut self) {
        self.ttfb.end = Some(Instant::now());
    }

    /// Freezes the recorder into a [`Timings`] snapshot.
    pub fn finish(&self) -> Timings {
        let total = self.begin.elapsed();
        let ttfb = self.ttfb.duration();
        Timings {
            dns: self.dns.duration(),
            tcp: self.tcp.duration(),
            tls: self.tls.duration(),
            ttfb,
            total,
        }
    }
}

/// Immutable timing metrics attached to every [`crate::Response`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    pub dns: Duration,
    pub tcp: Duration,
    pub tls: Duration,
    pub ttfb: Duration,
    pub total: Duration,
}

impl Timings {
    /// `DNS + TCP + TLS`.
    pub fn connection_time(&self) -> Duration {
        self.dns + self.tcp + self.tls
    }

    /// `total - TTFB`, saturating at zero.
    pub fn network_time(&self) -> Duration {
        self.total.saturating_sub(self.ttfb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn zero_phase_is_zero_duration() {
        let r = Recorder::new();
        let t = r.finish();
        assert_eq!(t.dns, Duration::ZERO);
        assert_eq!(t.tls, Duration::ZERO);
    }

    #[test]
    fn connection_and_network_time_compose() {
        let mut r = Recorder::new();
        r.dns_start();
        sleep(Duration::from_millis(1));
        r.dns_end();
        r.ttfb_start();
        sleep(Duration::from_millis(1));
        r.ttfb_end();
        let t = r.finish();
        assert!(t.connection_time() >= t.dns);
        assert!(t.total >= t.ttfb);
        assert_eq!(t.network_time(), t.total.saturating_sub(t.ttfb));
    }
}
