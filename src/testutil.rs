//! In-process WebSocket servers and event collectors shared by the tests.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::params;
use crate::progress::{MeasurementProgress, TestEvent};
use crate::spec::Measurement;

/// Accept WebSocket connections on an ephemeral local port, handing each one
/// to a fresh instance of `handler`. Runs until the test's runtime is torn
/// down.
pub(crate) async fn serve_ws<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(WebSocketStream<TcpStream>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, subprotocol_echo).await
                else {
                    return;
                };
                handler(ws).await;
            });
        }
    });
    addr
}

pub(crate) fn subprotocol_echo(
    request: &Request,
    mut response: Response,
) -> std::result::Result<Response, ErrorResponse> {
    if request.headers().get("Sec-WebSocket-Protocol").is_some() {
        response.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            params::SEC_WEBSOCKET_PROTOCOL.parse().unwrap(),
        );
    }
    Ok(response)
}

/// Drain a finished phase's event channel into progress and measurement lists.
pub(crate) async fn collect_events(
    mut rx: mpsc::Receiver<TestEvent>,
) -> (Vec<MeasurementProgress>, Vec<Measurement>) {
    let mut progress = Vec::new();
    let mut measurements = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            TestEvent::Progress(p) => progress.push(p),
            TestEvent::Measurement(m) => measurements.push(m),
        }
    }
    (progress, measurements)
}
