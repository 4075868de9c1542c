//! ndt7 protocol data types.
//!
//! These structs match the JSON measurement messages defined in the
//! [ndt7 specification](https://github.com/m-lab/ndt-server/blob/master/spec/ndt7-protocol.md).

use serde::{Deserialize, Serialize};

/// Which side produced a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Measurement computed by the client.
    Client,
    /// Measurement reported by the server.
    Server,
}

/// Which subtest a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    /// Download (server-to-client) test.
    Download,
    /// Upload (client-to-server) test.
    Upload,
}

/// Application-level throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Microseconds elapsed since the start of the test.
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
    /// Total bytes transferred so far.
    #[serde(rename = "NumBytes")]
    pub num_bytes: i64,
}

/// Endpoint addresses and connection metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Client address as `ip:port`.
    #[serde(rename = "Client")]
    pub client: String,
    /// Server address as `ip:port`.
    #[serde(rename = "Server")]
    pub server: String,
    /// Unique identifier for the test assigned by the server.
    #[serde(rename = "UUID", skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Start time of the test in RFC 3339 format.
    #[serde(rename = "StartTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

/// TCP connection metrics from the kernel (server-side).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TCPInfo {
    /// Time (microseconds) the connection has been actively sending data.
    #[serde(rename = "BusyTime", skip_serializing_if = "Option::is_none")]
    pub busy_time: Option<i64>,
    /// Bytes acknowledged by the peer.
    #[serde(rename = "BytesAcked", skip_serializing_if = "Option::is_none")]
    pub bytes_acked: Option<i64>,
    /// Bytes received from the peer.
    #[serde(rename = "BytesReceived", skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<i64>,
    /// Bytes sent to the peer.
    #[serde(rename = "BytesSent", skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<i64>,
    /// Bytes retransmitted.
    #[serde(rename = "BytesRetrans", skip_serializing_if = "Option::is_none")]
    pub bytes_retrans: Option<i64>,
    /// Microseconds elapsed since the TCP connection was established.
    #[serde(rename = "ElapsedTime", skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<i64>,
    /// Minimum round-trip time observed (microseconds).
    #[serde(rename = "MinRTT", skip_serializing_if = "Option::is_none")]
    pub min_rtt: Option<i64>,
    /// Smoothed round-trip time (microseconds).
    #[serde(rename = "RTT", skip_serializing_if = "Option::is_none")]
    pub rtt: Option<i64>,
    /// Round-trip time variance (microseconds).
    #[serde(rename = "RTTVar", skip_serializing_if = "Option::is_none")]
    pub rtt_var: Option<i64>,
    /// Time (microseconds) limited by the receive window.
    #[serde(rename = "RWndLimited", skip_serializing_if = "Option::is_none")]
    pub rwnd_limited: Option<i64>,
    /// Time (microseconds) limited by the send buffer.
    #[serde(rename = "SndBufLimited", skip_serializing_if = "Option::is_none")]
    pub snd_buf_limited: Option<i64>,
}

/// BBR congestion-control state (server-side, when BBR is in use).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBRInfo {
    /// Bottleneck bandwidth estimate in bits per second.
    #[serde(rename = "BW", skip_serializing_if = "Option::is_none")]
    pub bw: Option<i64>,
    /// Minimum round-trip time observed (microseconds).
    #[serde(rename = "MinRTT", skip_serializing_if = "Option::is_none")]
    pub min_rtt: Option<i64>,
    /// Current pacing gain.
    #[serde(rename = "PacingGain", skip_serializing_if = "Option::is_none")]
    pub pacing_gain: Option<i64>,
    /// Current congestion-window gain.
    #[serde(rename = "CwndGain", skip_serializing_if = "Option::is_none")]
    pub cwnd_gain: Option<i64>,
    /// Microseconds elapsed since the measurement began.
    #[serde(rename = "ElapsedTime", skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<i64>,
}

/// A single measurement message exchanged during an ndt7 test.
///
/// Both the server and client produce measurements. Server measurements
/// include [`TCPInfo`] from the kernel; client measurements include
/// [`AppInfo`] with application-level byte counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Application-level throughput counters.
    #[serde(rename = "AppInfo", skip_serializing_if = "Option::is_none")]
    pub app_info: Option<AppInfo>,
    /// Connection endpoint addresses.
    #[serde(rename = "ConnectionInfo", skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
    /// Which side produced this measurement.
    #[serde(rename = "Origin", skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Which subtest this measurement belongs to.
    #[serde(rename = "Test", skip_serializing_if = "Option::is_none")]
    pub test: Option<TestKind>,
    /// TCP-level metrics from the kernel.
    #[serde(rename = "TCPInfo", skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<TCPInfo>,
    /// BBR congestion-control state.
    #[serde(rename = "BBRInfo", skip_serializing_if = "Option::is_none")]
    pub bbr_info: Option<BBRInfo>,
}
