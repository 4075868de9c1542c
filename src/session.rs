//! Measurement session orchestration.
//!
//! [`SpeedTest`] ties the pieces together: locator discovery, the retry and
//! failover driver for each requested phase, callback delivery, and
//! cooperative cancellation. One `start` call runs one session; phases run
//! strictly one after the other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::Client;
use crate::driver::{self, PhaseConfig};
use crate::error::{Result, SpeedTestError};
use crate::locate::{self, ConnectionMode, TestServer};
use crate::params;
use crate::progress::{MeasurementProgress, PhaseOutcome, TestEvent};
use crate::spec::{Measurement, TestKind};

/// Which measurements to run in one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestType {
    /// Download only.
    Download,
    /// Upload only.
    Upload,
    /// Download first, then upload. A download failure aborts the upload.
    DownloadThenUpload,
}

impl TestType {
    fn runs_download(self) -> bool {
        matches!(self, TestType::Download | TestType::DownloadThenUpload)
    }

    fn runs_upload(self) -> bool {
        matches!(self, TestType::Upload | TestType::DownloadThenUpload)
    }
}

/// Results of one completed session.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    /// The server selected at discovery: the locator's first ranked result.
    /// Failover may run a phase elsewhere; see [`PhaseOutcome::server`].
    pub selected_server: TestServer,
    /// Download phase result, when one ran.
    pub download: Option<PhaseOutcome>,
    /// Upload phase result, when one ran.
    pub upload: Option<PhaseOutcome>,
}

type ProgressCallback = Box<dyn FnMut(&MeasurementProgress) + Send>;
type MeasurementCallback = Box<dyn FnMut(&Measurement) + Send>;
type ServerCallback = Box<dyn FnMut(&TestServer) + Send>;

#[derive(Default)]
struct Callbacks {
    download_progress: Option<ProgressCallback>,
    download_measurement: Option<MeasurementCallback>,
    upload_progress: Option<ProgressCallback>,
    upload_measurement: Option<MeasurementCallback>,
    server_selected: Option<ServerCallback>,
}

impl Callbacks {
    fn dispatch(&mut self, direction: TestKind, event: TestEvent) {
        match (direction, event) {
            (TestKind::Download, TestEvent::Progress(p)) => {
                if let Some(cb) = self.download_progress.as_mut() {
                    cb(&p);
                }
            }
            (TestKind::Download, TestEvent::Measurement(m)) => {
                if let Some(cb) = self.download_measurement.as_mut() {
                    cb(&m);
                }
            }
            (TestKind::Upload, TestEvent::Progress(p)) => {
                if let Some(cb) = self.upload_progress.as_mut() {
                    cb(&p);
                }
            }
            (TestKind::Upload, TestEvent::Measurement(m)) => {
                if let Some(cb) = self.upload_measurement.as_mut() {
                    cb(&m);
                }
            }
        }
    }
}

/// Builder for [`SpeedTest`].
///
/// ```
/// # use mlab_speedtest::session::SpeedTest;
/// let speedtest = SpeedTest::builder("my-app", "1.0.0").build().unwrap();
/// ```
pub struct SpeedTestBuilder {
    client_name: String,
    client_version: String,
    mode: ConnectionMode,
    duration: Duration,
    device_name: Option<String>,
    locate_url: String,
    no_verify_tls: bool,
}

impl SpeedTestBuilder {
    /// Create a new builder. `client_name` and `client_version` identify the
    /// calling application in requests to M-Lab servers.
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        SpeedTestBuilder {
            client_name: client_name.into(),
            client_version: client_version.into(),
            mode: ConnectionMode::default(),
            duration: params::DEFAULT_TEST_DURATION,
            device_name: None,
            locate_url: locate::LOCATE_URL.into(),
            no_verify_tls: false,
        }
    }

    /// Use secure (`wss://`) or plain-text (`ws://`) service URLs.
    pub fn connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Length of each measurement phase. Defaults to 10 seconds.
    pub fn measurement_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Device name reported to the server on the opening handshake.
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Override the Locate API endpoint.
    pub fn locate_url(mut self, url: impl Into<String>) -> Self {
        self.locate_url = url.into();
        self
    }

    /// Skip TLS certificate verification.
    pub fn danger_no_verify_tls(mut self) -> Self {
        self.no_verify_tls = true;
        self
    }

    /// Build the [`SpeedTest`].
    pub fn build(self) -> Result<SpeedTest> {
        let mut client = Client::new(self.client_name, self.client_version);
        if self.no_verify_tls {
            client = client.danger_no_verify_tls();
        }
        let http = reqwest::Client::builder().build()?;
        Ok(SpeedTest {
            client,
            http,
            locate_url: self.locate_url,
            mode: self.mode,
            duration: self.duration,
            device_name: self.device_name,
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            cancel: Mutex::new(CancellationToken::new()),
            running: tokio::sync::Mutex::new(()),
        })
    }
}

/// An ndt7 measurement session orchestrator.
///
/// Register callbacks, then call [`SpeedTest::start`]. The session discovers
/// measurement servers, locks the first as the selected server, and runs the
/// requested phases with retry and failover. [`SpeedTest::cancel`] stops the
/// active phase cooperatively from any task.
pub struct SpeedTest {
    client: Client,
    http: reqwest::Client,
    locate_url: String,
    mode: ConnectionMode,
    duration: Duration,
    device_name: Option<String>,
    callbacks: Arc<Mutex<Callbacks>>,
    cancel: Mutex<CancellationToken>,
    // held across start() so only one session can be active
    running: tokio::sync::Mutex<()>,
}

impl SpeedTest {
    /// Start building a session orchestrator.
    pub fn builder(
        client_name: impl Into<String>,
        client_version: impl Into<String>,
    ) -> SpeedTestBuilder {
        SpeedTestBuilder::new(client_name, client_version)
    }

    /// Called with each locally computed download throughput sample.
    pub fn on_download_progress(&self, f: impl FnMut(&MeasurementProgress) + Send + 'static) {
        self.callbacks.lock().unwrap().download_progress = Some(Box::new(f));
    }

    /// Called with each server-reported download measurement.
    pub fn on_download_measurement(&self, f: impl FnMut(&Measurement) + Send + 'static) {
        self.callbacks.lock().unwrap().download_measurement = Some(Box::new(f));
    }

    /// Called with each locally computed upload throughput sample.
    pub fn on_upload_progress(&self, f: impl FnMut(&MeasurementProgress) + Send + 'static) {
        self.callbacks.lock().unwrap().upload_progress = Some(Box::new(f));
    }

    /// Called with each server-reported upload measurement.
    pub fn on_upload_measurement(&self, f: impl FnMut(&Measurement) + Send + 'static) {
        self.callbacks.lock().unwrap().upload_measurement = Some(Box::new(f));
    }

    /// Called once per session with the server selected at discovery.
    pub fn on_server_selected(&self, f: impl FnMut(&TestServer) + Send + 'static) {
        self.callbacks.lock().unwrap().server_selected = Some(Box::new(f));
    }

    /// Run one measurement session.
    ///
    /// Discovers servers, fires the server-selected callback, then runs the
    /// requested phases sequentially. The first fatal phase error ends the
    /// session. Calling `start` again after completion runs a fresh session
    /// with independent counters; calling it while a session is still running
    /// fails with [`SpeedTestError::SessionActive`].
    pub async fn start(&self, test_type: TestType) -> Result<TestOutcome> {
        let _active = self
            .running
            .try_lock()
            .map_err(|_| SpeedTestError::SessionActive)?;

        // swap in the fresh token under the lock so a concurrent cancel()
        // can never target a token that is no longer the active one
        let cancel = {
            let mut current = self.cancel.lock().unwrap();
            *current = CancellationToken::new();
            current.clone()
        };

        let servers = locate::nearest(&self.http, &self.locate_url, &self.client.user_agent())
            .await?;
        let selected = servers[0].clone();
        info!(machine = %selected.machine, "selected measurement server");
        if let Some(cb) = self.callbacks.lock().unwrap().server_selected.as_mut() {
            cb(&selected);
        }

        let mut outcome = TestOutcome {
            selected_server: selected,
            download: None,
            upload: None,
        };
        if test_type.runs_download() {
            outcome.download = Some(self.run_phase(&servers, TestKind::Download, &cancel).await?);
        }
        if test_type.runs_upload() {
            outcome.upload = Some(self.run_phase(&servers, TestKind::Upload, &cancel).await?);
        }
        Ok(outcome)
    }

    /// Cooperatively stop the active phase, if any. Safe to call at any
    /// time, from any task, and more than once.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    async fn run_phase(
        &self,
        servers: &[TestServer],
        direction: TestKind,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome> {
        let (tx, mut rx) = mpsc::channel::<TestEvent>(64);

        // user callbacks run on their own task, in order, so a slow consumer
        // can never stall frame handling
        let callbacks = Arc::clone(&self.callbacks);
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callbacks.lock().unwrap().dispatch(direction, event);
            }
        });

        let cfg = PhaseConfig {
            direction,
            mode: self.mode,
            duration: self.duration,
            device_name: self.device_name.clone(),
            max_attempts: params::MAX_ATTEMPTS,
            retry_delay: params::RETRY_DELAY,
        };
        let result = driver::run_phase(&self.client, servers, &cfg, cancel, tx).await;

        // every sender is gone once the driver returns; wait for the queue
        // to drain so the terminal result strictly follows all callbacks
        let _ = dispatcher.await;
        result
    }
}
