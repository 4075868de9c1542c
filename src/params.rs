//! Protocol constants and tuning parameters.

use std::time::Duration;

/// Value of the Sec-WebSocket-Protocol header.
pub const SEC_WEBSOCKET_PROTOCOL: &str = "net.measurementlab.ndt.v7";

/// URL path for the download test.
pub const DOWNLOAD_URL_PATH: &str = "/ndt/v7/download";

/// URL path for the upload test.
pub const UPLOAD_URL_PATH: &str = "/ndt/v7/upload";

/// Header carrying the caller-supplied device name on the opening handshake.
pub const DEVICE_NAME_HEADER: &str = "X-Device-Name";

/// Initial size of uploaded messages (8 KiB).
pub const INITIAL_MESSAGE_SIZE: usize = 1 << 13;

/// Maximum size of uploaded messages (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 24;

/// Upper bound on incoming frames (16 MiB).
pub const MAX_FRAME_SIZE: usize = 1 << 24;

/// Threshold for scaling binary messages. When total bytes sent reach
/// SCALING_FRACTION times the current message size, the message size doubles.
pub const SCALING_FRACTION: usize = 16;

/// Default length of one measurement phase.
pub const DEFAULT_TEST_DURATION: Duration = Duration::from_secs(10);

/// Timeout for the WebSocket opening handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(7);

/// Upper bound on the closing handshake during tear-down.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between client-side progress updates.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Attempts per server before failing over to the next one.
pub const MAX_ATTEMPTS: u32 = 3;

/// Pause between consecutive attempts against the same server.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
