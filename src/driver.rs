//! Retry and failover across the ranked server list.
//!
//! One invocation runs one phase (download or upload). Servers are tried in
//! rank order; each gets a bounded number of attempts, with structural
//! protocol errors cutting a server's attempts short because retrying an
//! incompatible peer cannot succeed.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::{Result, SpeedTestError};
use crate::locate::{ConnectionMode, TestServer};
use crate::progress::{PhaseOutcome, Terminal, TestEvent};
use crate::spec::TestKind;
use crate::{download, upload};

/// Per-phase settings resolved by the orchestrator.
pub(crate) struct PhaseConfig {
    pub direction: TestKind,
    pub mode: ConnectionMode,
    pub duration: Duration,
    pub device_name: Option<String>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Run one phase against the ranked server list.
///
/// Succeeds on the first attempt that transfers any data; otherwise fails
/// with the last error observed, or [`SpeedTestError::NoServersAvailable`]
/// when the list is empty.
pub(crate) async fn run_phase(
    client: &Client,
    servers: &[TestServer],
    cfg: &PhaseConfig,
    cancel: &CancellationToken,
    events: mpsc::Sender<TestEvent>,
) -> Result<PhaseOutcome> {
    let mut last_error: Option<SpeedTestError> = None;

    for server in servers {
        let Some(url) = server.urls.resolve(cfg.mode, cfg.direction) else {
            warn!(machine = %server.machine, "server advertises no URL for this test");
            last_error = Some(SpeedTestError::InvalidTestUrl(server.machine.clone()));
            continue;
        };

        for attempt in 1..=cfg.max_attempts {
            if attempt > 1 {
                // spacing between attempts against the same machine only
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SpeedTestError::Cancelled),
                    _ = sleep(cfg.retry_delay) => {}
                }
            }
            debug!(machine = %server.machine, attempt, test = ?cfg.direction, "starting attempt");
            match attempt_once(client, url, cfg, cancel, &events).await {
                Ok((bytes, elapsed, terminal)) if bytes > 0 => {
                    return Ok(PhaseOutcome {
                        server: server.machine.clone(),
                        direction: cfg.direction,
                        bytes_transferred: bytes,
                        elapsed,
                        terminal,
                    });
                }
                Ok(_) => {
                    warn!(machine = %server.machine, attempt, "test ended without data");
                    last_error = Some(SpeedTestError::TestFailed("no data received".into()));
                }
                Err(SpeedTestError::Cancelled) => return Err(SpeedTestError::Cancelled),
                Err(e) if e.skips_server() => {
                    warn!(machine = %server.machine, error = %e, "protocol error, moving to next server");
                    last_error = Some(e);
                    break;
                }
                Err(e @ SpeedTestError::UrlParse(_)) => {
                    warn!(machine = %server.machine, error = %e, "malformed test URL, skipping server");
                    last_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(machine = %server.machine, attempt, error = %e, "attempt failed");
                    last_error = Some(e);
                }
            }
        }
    }

    Err(last_error.unwrap_or(SpeedTestError::NoServersAvailable))
}

async fn attempt_once(
    client: &Client,
    url: &str,
    cfg: &PhaseConfig,
    cancel: &CancellationToken,
    events: &mpsc::Sender<TestEvent>,
) -> Result<(u64, Duration, Terminal)> {
    let ws = tokio::select! {
        _ = cancel.cancelled() => return Err(SpeedTestError::Cancelled),
        ws = client.connect(url, cfg.device_name.as_deref()) => ws?,
    };
    // each attempt gets its own token so tear-down stays scoped to it
    match cfg.direction {
        TestKind::Download => {
            download::run(ws, cfg.duration, cancel.child_token(), events.clone()).await
        }
        TestKind::Upload => {
            upload::run(ws, cfg.duration, cancel.child_token(), events.clone()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use crate::locate::ServiceUrls;
    use crate::testutil::serve_ws;

    fn test_config(direction: TestKind) -> PhaseConfig {
        PhaseConfig {
            direction,
            mode: ConnectionMode::Insecure,
            duration: Duration::from_millis(300),
            device_name: None,
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
        }
    }

    fn server_for(machine: &str, addr: std::net::SocketAddr) -> TestServer {
        TestServer {
            machine: machine.into(),
            location: Default::default(),
            urls: ServiceUrls {
                download_insecure: Some(format!("ws://{addr}/ndt/v7/download")),
                upload_insecure: Some(format!("ws://{addr}/ndt/v7/upload")),
                ..Default::default()
            },
        }
    }

    /// A healthy download server: a burst of binary frames, then close.
    async fn healthy_download_server() -> std::net::SocketAddr {
        serve_ws(|mut ws| async move {
            for _ in 0..4 {
                if ws
                    .send(Message::Binary(Bytes::from(vec![0u8; 1024])))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await
    }

    #[tokio::test]
    async fn succeeds_on_first_healthy_server() {
        let addr = healthy_download_server().await;
        let servers = vec![server_for("mlab1.test", addr)];
        let client = Client::new("driver-test", "0");
        let (tx, rx) = mpsc::channel(64);

        let outcome = run_phase(
            &client,
            &servers,
            &test_config(TestKind::Download),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(outcome.server, "mlab1.test");
        assert_eq!(outcome.bytes_transferred, 4 * 1024);
        assert_eq!(outcome.terminal, Terminal::NormalClose);
        drop(rx);
    }

    #[tokio::test]
    async fn protocol_error_skips_to_next_server() {
        // server 0 injects a frame with reserved bits set after the handshake
        let broken_hits = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&broken_hits);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broken_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_hdr_async(
                        stream,
                        crate::testutil::subprotocol_echo,
                    )
                    .await
                    .unwrap();
                    let tcp = ws.get_mut();
                    let _ = tcp.write_all(&[0x92, 0x02, 0xde, 0xad]).await;
                    let _ = tcp.flush().await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let healthy_addr = healthy_download_server().await;
        let servers = vec![
            server_for("mlab-broken.test", broken_addr),
            server_for("mlab-ok.test", healthy_addr),
        ];
        let client = Client::new("driver-test", "0");
        let (tx, rx) = mpsc::channel(64);

        let outcome = run_phase(
            &client,
            &servers,
            &test_config(TestKind::Download),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap();

        // no retry against the structurally broken server
        assert_eq!(broken_hits.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.server, "mlab-ok.test");
        drop(rx);
    }

    #[tokio::test]
    async fn zero_bytes_is_retried_then_fails() {
        // accepts the websocket and closes immediately without sending data
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_hdr_async(
                        stream,
                        crate::testutil::subprotocol_echo,
                    )
                    .await
                    .unwrap();
                    let _ = ws.close(None).await;
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });

        let servers = vec![server_for("mlab-empty.test", addr)];
        let client = Client::new("driver-test", "0");
        let (tx, rx) = mpsc::channel(64);

        let err = run_phase(
            &client,
            &servers,
            &test_config(TestKind::Download),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(matches!(err, SpeedTestError::TestFailed(reason) if reason == "no data received"));
        drop(rx);
    }

    #[tokio::test]
    async fn missing_url_fails_without_connecting() {
        let servers = vec![TestServer {
            machine: "mlab-nourl.test".into(),
            location: Default::default(),
            urls: ServiceUrls::default(),
        }];
        let client = Client::new("driver-test", "0");
        let (tx, rx) = mpsc::channel(64);

        let err = run_phase(
            &client,
            &servers,
            &test_config(TestKind::Download),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SpeedTestError::InvalidTestUrl(_)));
        drop(rx);
    }

    #[tokio::test]
    async fn empty_server_list_fails() {
        let client = Client::new("driver-test", "0");
        let (tx, rx) = mpsc::channel(64);
        let err = run_phase(
            &client,
            &[],
            &test_config(TestKind::Upload),
            &CancellationToken::new(),
            tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SpeedTestError::NoServersAvailable));
        drop(rx);
    }
}
