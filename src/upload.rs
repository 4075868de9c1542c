//! ndt7 upload phase.
//!
//! Sends random binary WebSocket messages to the server while reading
//! server counter-flow measurements, until the measurement deadline elapses
//! or the server closes the connection. The sender owns the deadline and the
//! graceful close; awaiting each flush is what bounds outbound queueing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::client::{WsStream, normal_close};
use crate::error::{Result, SpeedTestError};
use crate::params;
use crate::progress::{MeasurementProgress, Terminal, TestEvent};
use crate::spec::{Measurement, Origin, TestKind};

/// Run the upload phase on an established WebSocket connection.
///
/// Progress samples (from the client's send counter) and server counter-flow
/// measurements are sent on `events`; one final progress sample with the
/// phase totals precedes a successful return.
pub(crate) async fn run(
    ws: WsStream,
    duration: Duration,
    cancel: CancellationToken,
    events: mpsc::Sender<TestEvent>,
) -> Result<(u64, Duration, Terminal)> {
    let start = Instant::now();
    let (sink, stream) = ws.split();

    // The send loop and the counter-flow reader share the task; the counter
    // crosses the split so whichever side finishes first has the total.
    let total_bytes = Arc::new(AtomicU64::new(0));

    let sender = send_loop(
        sink,
        start,
        start + duration,
        Arc::clone(&total_bytes),
        events.clone(),
        cancel,
    );
    let reader = read_counterflow(stream, events.clone());
    tokio::pin!(sender, reader);

    let result = tokio::select! {
        r = &mut sender => r,
        r = &mut reader => r,
    };

    let elapsed = start.elapsed();
    let bytes = total_bytes.load(Ordering::Relaxed);
    let terminal = result?;
    let _ = events
        .send(TestEvent::Progress(MeasurementProgress::new(
            elapsed,
            bytes,
            TestKind::Upload,
        )))
        .await;
    Ok((bytes, elapsed, terminal))
}

/// Whether the send buffer should double, per the ndt7 scaling rule: grow
/// while under the ceiling once the total sent reaches 16x the current size.
pub(crate) fn should_scale(msg_size: usize, total_bytes: u64) -> bool {
    msg_size < params::MAX_MESSAGE_SIZE
        && total_bytes >= (params::SCALING_FRACTION * msg_size) as u64
}

async fn send_loop(
    mut sink: SplitSink<WsStream, Message>,
    start: Instant,
    deadline: Instant,
    total_bytes: Arc<AtomicU64>,
    events: mpsc::Sender<TestEvent>,
    cancel: CancellationToken,
) -> Result<Terminal> {
    let mut prev_update = start;

    let mut rng = SmallRng::from_os_rng();
    let mut msg_size = params::INITIAL_MESSAGE_SIZE;
    let mut payload = random_payload(&mut rng, msg_size);

    enum Step {
        Cancelled,
        Deadline,
        Sent(std::result::Result<(), tokio_tungstenite::tungstenite::Error>),
    }

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => Step::Cancelled,
            r = timeout_at(deadline, sink.send(Message::Binary(payload.clone()))) => {
                match r {
                    Ok(inner) => Step::Sent(inner),
                    Err(_) => Step::Deadline,
                }
            }
        };
        match step {
            Step::Cancelled => {
                let _ = timeout(
                    params::TEARDOWN_TIMEOUT,
                    sink.send(Message::Close(Some(normal_close()))),
                )
                .await;
                return Err(SpeedTestError::Cancelled);
            }
            Step::Deadline => {
                // The server may still be mid-read; any error from this close
                // is part of a successful tear-down.
                let _ = timeout(
                    params::TEARDOWN_TIMEOUT,
                    sink.send(Message::Close(Some(normal_close()))),
                )
                .await;
                return Ok(Terminal::Timeout);
            }
            Step::Sent(Err(e)) => return Err(e.into()),
            Step::Sent(Ok(())) => {
                let total =
                    total_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed)
                        + payload.len() as u64;
                if should_scale(msg_size, total) {
                    msg_size *= 2;
                    payload = random_payload(&mut rng, msg_size);
                }
                if prev_update.elapsed() >= params::UPDATE_INTERVAL {
                    prev_update = Instant::now();
                    let _ = events
                        .send(TestEvent::Progress(MeasurementProgress::since(
                            start,
                            total,
                            TestKind::Upload,
                        )))
                        .await;
                }
            }
        }
    }
}

// Reads server counter-flow measurements; their bytes are received, not
// sent, so they never touch the upload counter.
async fn read_counterflow(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<TestEvent>,
) -> Result<Terminal> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<Measurement>(&text) {
                Ok(mut measurement) => {
                    measurement.origin = Some(Origin::Server);
                    measurement.test = Some(TestKind::Upload);
                    let _ = events.send(TestEvent::Measurement(measurement)).await;
                }
                Err(e) => warn!(error = %e, "discarding unparseable measurement"),
            },
            Message::Binary(_) => {
                return Err(SpeedTestError::TestFailed(
                    "server sent unexpected binary message during upload".into(),
                ));
            }
            Message::Close(_) => return Ok(Terminal::NormalClose),
            _ => {} // Ping/Pong handled by tungstenite
        }
    }
    Ok(Terminal::NormalClose)
}

fn random_payload(rng: &mut SmallRng, size: usize) -> Bytes {
    let mut buf = vec![0u8; size];
    rng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::sleep;
    use tokio_tungstenite::connect_async;

    use crate::testutil::{collect_events, serve_ws};

    #[test]
    fn scaling_rule_boundaries() {
        // 8 KiB buffer grows only once 128 KiB have been sent
        assert!(!should_scale(1 << 13, (1 << 17) - 1));
        assert!(should_scale(1 << 13, 1 << 17));
        // at the ceiling the buffer stops growing no matter the total
        assert!(!should_scale(params::MAX_MESSAGE_SIZE, u64::MAX));
    }

    #[tokio::test]
    async fn deadline_ends_upload_with_totals() {
        let addr = serve_ws(|mut ws| async move {
            // drain client frames; reply with one counter-flow measurement
            let mut sent_measurement = false;
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(_) if !sent_measurement => {
                        sent_measurement = true;
                        let text = r#"{"TCPInfo": {"BytesReceived": 8192, "ElapsedTime": 250000}}"#;
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        })
        .await;

        let (ws, _) = connect_async(format!("ws://{addr}/ndt/v7/upload"))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(64);
        let started = Instant::now();
        let (bytes, elapsed, terminal) = run(
            ws,
            Duration::from_millis(400),
            CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(terminal, Terminal::Timeout);
        assert!(bytes >= params::INITIAL_MESSAGE_SIZE as u64);
        assert_eq!(bytes % params::INITIAL_MESSAGE_SIZE as u64, 0);
        assert!(elapsed >= Duration::from_millis(400));
        assert!(started.elapsed() < Duration::from_millis(2000));

        let (progress, measurements) = collect_events(rx).await;
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].origin, Some(Origin::Server));
        assert_eq!(measurements[0].test, Some(TestKind::Upload));
        assert_eq!(progress.last().unwrap().num_bytes, bytes);
        for pair in progress.windows(2) {
            assert!(pair[0].num_bytes <= pair[1].num_bytes);
        }
    }

    #[tokio::test]
    async fn server_close_ends_upload() {
        let addr = serve_ws(|mut ws| async move {
            // accept a few frames, then close from the server side
            let mut seen = 0;
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Binary(_)) {
                    seen += 1;
                    if seen == 3 {
                        let _ = ws.close(None).await;
                    }
                }
            }
        })
        .await;

        let (ws, _) = connect_async(format!("ws://{addr}/ndt/v7/upload"))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(64);
        let (bytes, _, terminal) = run(
            ws,
            Duration::from_secs(10),
            CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(terminal, Terminal::NormalClose);
        assert!(bytes >= 3 * params::INITIAL_MESSAGE_SIZE as u64);
        drop(rx);
    }

    #[tokio::test]
    async fn cancel_stops_the_upload() {
        let addr = serve_ws(|mut ws| async move {
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;

        let (ws, _) = connect_async(format!("ws://{addr}/ndt/v7/upload"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            stop.cancel();
        });

        let (tx, rx) = mpsc::channel(64);
        let started = Instant::now();
        let result = run(ws, Duration::from_secs(10), cancel, tx).await;
        assert!(matches!(result, Err(SpeedTestError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(600));
        drop(rx);
    }
}
