//! An [ndt7](https://github.com/m-lab/ndt-server/blob/master/spec/ndt7-protocol.md)
//! speed test client library with retry and server failover.
//!
//! ndt7 is a network performance measurement protocol developed by
//! [M-Lab](https://www.measurementlab.net/). This crate discovers nearby
//! measurement servers through the Locate API, then measures download and
//! upload throughput over WebSocket connections, retrying and failing over
//! across the ranked server list when a server misbehaves.
//!
//! # Quick start
//!
//! ```no_run
//! use mlab_speedtest::session::{SpeedTest, TestType};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let speedtest = SpeedTest::builder("my-app", "0.1.0").build()?;
//! speedtest.on_download_progress(|p| {
//!     println!("{:.1} Mbit/s", p.mean_throughput_mbps);
//! });
//!
//! let outcome = speedtest.start(TestType::DownloadThenUpload).await?;
//! if let Some(download) = &outcome.download {
//!     println!("download: {:.1} Mbit/s", download.mean_throughput_mbps());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
mod download;
mod driver;
pub mod error;
pub mod locate;
pub mod params;
pub mod progress;
pub mod session;
pub mod spec;
mod upload;

#[cfg(test)]
pub(crate) mod testutil;
