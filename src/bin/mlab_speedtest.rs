use std::io::Write;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mlab_speedtest::locate::ConnectionMode;
use mlab_speedtest::progress::PhaseOutcome;
use mlab_speedtest::session::{SpeedTest, TestType};

#[derive(Parser, Debug)]
#[command(version, about = "Measure network throughput against M-Lab ndt7 servers")]
struct Cli {
    /// Skip the download measurement
    #[arg(long)]
    no_download: bool,
    /// Skip the upload measurement
    #[arg(long)]
    no_upload: bool,
    /// Use unencrypted WebSocket (ws://) instead of TLS (wss://)
    #[arg(long)]
    insecure: bool,
    /// Length of each measurement phase in seconds
    #[arg(long, default_value_t = 10)]
    duration: u64,
    /// Device name reported to the server
    #[arg(long)]
    device_name: Option<String>,
    /// Alternative Locate API endpoint
    #[arg(long)]
    locate_url: Option<String>,
    /// Skip TLS certificate verification (testing against self-signed certs)
    #[arg(long)]
    no_verify: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let test_type = match (cli.no_download, cli.no_upload) {
        (false, false) => TestType::DownloadThenUpload,
        (true, false) => TestType::Upload,
        (false, true) => TestType::Download,
        (true, true) => {
            eprintln!("error: nothing to do");
            std::process::exit(1);
        }
    };

    let mut builder = SpeedTest::builder("mlab-speedtest", env!("CARGO_PKG_VERSION"))
        .measurement_duration(Duration::from_secs(cli.duration));
    if cli.insecure {
        builder = builder.connection_mode(ConnectionMode::Insecure);
    }
    if let Some(name) = cli.device_name {
        builder = builder.device_name(name);
    }
    if let Some(url) = cli.locate_url {
        builder = builder.locate_url(url);
    }
    if cli.no_verify {
        builder = builder.danger_no_verify_tls();
    }
    let speedtest = builder.build()?;

    speedtest.on_server_selected(|server| {
        let place = match (&server.location.city, &server.location.country) {
            (Some(city), Some(country)) => format!(" ({city}, {country})"),
            (Some(city), None) => format!(" ({city})"),
            _ => String::new(),
        };
        println!("testing against {}{place}", server.machine);
    });
    speedtest.on_download_progress(|p| {
        print!("\rdownload: {:>7.1} Mbit/s", p.mean_throughput_mbps);
        let _ = std::io::stdout().flush();
    });
    speedtest.on_upload_progress(|p| {
        print!("\rupload:   {:>7.1} Mbit/s", p.mean_throughput_mbps);
        let _ = std::io::stdout().flush();
    });

    let outcome = speedtest.start(test_type).await?;

    println!("\n\nTest results");
    if let Some(download) = &outcome.download {
        print_phase("Download", download);
    }
    if let Some(upload) = &outcome.upload {
        print_phase("Upload", upload);
    }

    Ok(())
}

fn print_phase(name: &str, outcome: &PhaseOutcome) {
    println!(
        "{:>10}: {:>7.1} Mbit/s  ({} bytes in {:.1}s via {})",
        name,
        outcome.mean_throughput_mbps(),
        outcome.bytes_transferred,
        outcome.elapsed.as_secs_f64(),
        outcome.server
    );
}
