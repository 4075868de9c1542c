//! ndt7 download phase.
//!
//! Receives binary and text WebSocket messages from the server until the
//! server closes the connection, the measurement deadline passes, or the
//! transport fails. Whichever of the three fires first decides the outcome;
//! the single task owning the socket serializes them.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{WsStream, normal_close};
use crate::error::{Result, SpeedTestError};
use crate::params;
use crate::progress::{MeasurementProgress, Terminal, TestEvent};
use crate::spec::{Measurement, Origin, TestKind};

enum Step {
    Deadline,
    Cancelled,
    Frame(Option<std::result::Result<Message, tungstenite::Error>>),
}

/// Run the download phase on an established WebSocket connection.
///
/// Progress samples and server measurements are sent on `events` while the
/// phase runs; one final progress sample with the phase totals precedes a
/// successful return. Returns the byte total, the wall-clock elapsed time,
/// and the terminal condition.
pub(crate) async fn run(
    mut ws: WsStream,
    duration: Duration,
    cancel: CancellationToken,
    events: mpsc::Sender<TestEvent>,
) -> Result<(u64, Duration, Terminal)> {
    let start = Instant::now();
    let deadline = start + duration;
    let mut prev_update = start;
    let mut total_bytes: u64 = 0;

    let terminal = loop {
        let step = tokio::select! {
            _ = sleep_until(deadline) => Step::Deadline,
            _ = cancel.cancelled() => Step::Cancelled,
            msg = ws.next() => Step::Frame(msg),
        };
        match step {
            Step::Deadline => {
                // A server mid-write may surface an error right after this
                // close; the phase already succeeded, so it is dropped.
                let _ = timeout(params::TEARDOWN_TIMEOUT, ws.close(Some(normal_close()))).await;
                break Terminal::Timeout;
            }
            Step::Cancelled => {
                let _ = timeout(params::TEARDOWN_TIMEOUT, ws.close(Some(normal_close()))).await;
                return Err(SpeedTestError::Cancelled);
            }
            Step::Frame(None) => break Terminal::NormalClose,
            Step::Frame(Some(Ok(msg))) => match msg {
                Message::Binary(data) => {
                    total_bytes += data.len() as u64;
                }
                Message::Text(text) => {
                    match serde_json::from_str::<Measurement>(&text) {
                        Ok(mut measurement) => {
                            measurement.origin = Some(Origin::Server);
                            measurement.test = Some(TestKind::Download);
                            let _ = events.send(TestEvent::Measurement(measurement)).await;
                        }
                        // malformed counter-flow frames never abort the phase
                        Err(e) => warn!(error = %e, "discarding unparseable measurement"),
                    }
                    total_bytes += text.len() as u64;
                }
                Message::Close(frame) => {
                    debug!(?frame, "server closed download");
                    break Terminal::NormalClose;
                }
                _ => {} // Ping/Pong handled automatically by tungstenite
            },
            Step::Frame(Some(Err(e))) => return Err(e.into()),
        }
        if prev_update.elapsed() >= params::UPDATE_INTERVAL {
            prev_update = Instant::now();
            let _ = events
                .send(TestEvent::Progress(MeasurementProgress::since(
                    start,
                    total_bytes,
                    TestKind::Download,
                )))
                .await;
        }
    };

    let elapsed = start.elapsed();
    let _ = events
        .send(TestEvent::Progress(MeasurementProgress::new(
            elapsed,
            total_bytes,
            TestKind::Download,
        )))
        .await;
    Ok((total_bytes, elapsed, terminal))
}
