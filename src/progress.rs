//! Locally computed progress samples and phase outcomes.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::spec::{Measurement, TestKind};

/// A throughput sample computed by this client from its own byte counters.
///
/// Emitted at a bounded rate while a phase runs, plus once at the end of a
/// successful phase with the final totals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeasurementProgress {
    /// Time elapsed since the phase started.
    pub elapsed: Duration,
    /// Payload bytes transferred so far.
    pub num_bytes: u64,
    /// Which subtest this sample belongs to.
    pub direction: TestKind,
    /// Mean throughput over the whole phase so far, in Mbit/s.
    pub mean_throughput_mbps: f64,
}

impl MeasurementProgress {
    /// Build a sample from explicit elapsed time and byte count.
    pub fn new(elapsed: Duration, num_bytes: u64, direction: TestKind) -> Self {
        let secs = elapsed.as_secs_f64();
        let mean_throughput_mbps = if secs > 0.0 {
            (num_bytes as f64 * 8.0) / secs / 1e6
        } else {
            0.0
        };
        MeasurementProgress {
            elapsed,
            num_bytes,
            direction,
            mean_throughput_mbps,
        }
    }

    /// Build a sample for the time elapsed since `start`.
    pub fn since(start: Instant, num_bytes: u64, direction: TestKind) -> Self {
        Self::new(start.elapsed(), num_bytes, direction)
    }
}

/// The condition that ended a successful phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// The server closed the connection after its measurement window.
    NormalClose,
    /// The client's measurement deadline elapsed and it closed the connection.
    Timeout,
}

/// Final accounting for one completed measurement phase.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    /// FQDN of the machine that actually served this phase. After failover
    /// this may differ from the server selected at discovery.
    pub server: String,
    /// Which subtest ran.
    pub direction: TestKind,
    /// Total payload bytes transferred.
    pub bytes_transferred: u64,
    /// Wall-clock length of the phase.
    pub elapsed: Duration,
    /// How the phase ended.
    pub terminal: Terminal,
}

impl PhaseOutcome {
    /// Mean throughput over the whole phase, in Mbit/s.
    pub fn mean_throughput_mbps(&self) -> f64 {
        MeasurementProgress::new(self.elapsed, self.bytes_transferred, self.direction)
            .mean_throughput_mbps
    }
}

/// Events flowing from a running phase to the callback dispatcher.
#[derive(Debug)]
pub(crate) enum TestEvent {
    /// A locally computed throughput sample.
    Progress(MeasurementProgress),
    /// A measurement reported by the server.
    Measurement(Measurement),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_math() {
        // 1 MB over one second is 8 Mbit/s
        let p = MeasurementProgress::new(Duration::from_secs(1), 1_000_000, TestKind::Download);
        assert!((p.mean_throughput_mbps - 8.0).abs() < f64::EPSILON);

        // 50 MB over ten seconds is 40 Mbit/s
        let p = MeasurementProgress::new(Duration::from_secs(10), 50_000_000, TestKind::Upload);
        assert!((p.mean_throughput_mbps - 40.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_has_zero_throughput() {
        let p = MeasurementProgress::new(Duration::ZERO, 12345, TestKind::Download);
        assert_eq!(p.mean_throughput_mbps, 0.0);
    }

    #[test]
    fn outcome_throughput_matches_progress() {
        let outcome = PhaseOutcome {
            server: "mlab1-lga06.mlab-oss.measurement-lab.org".into(),
            direction: TestKind::Download,
            bytes_transferred: 25_000_000,
            elapsed: Duration::from_secs(5),
            terminal: Terminal::NormalClose,
        };
        assert!((outcome.mean_throughput_mbps() - 40.0).abs() < 1e-9);
    }
}
