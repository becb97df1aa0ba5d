use std::net::SocketAddr;
use std::process::ExitCode;

use argh::FromArgs;
use tokio::net::lookup_host;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use qstream::config::ConnectionConfig;
use qstream::peer::run_initiator;

/// Initiator: connects to a responder, requests a number of streams, and
/// reports what it received (`spec.md` §6.3: `<program> <host> <port> <num_of_streams>`).
#[derive(FromArgs)]
struct CliArgs {
    /// responder hostname or IP address
    #[argh(positional)]
    host: String,

    /// responder UDP port
    #[argh(positional)]
    port: u16,

    /// number of streams to request
    #[argh(positional)]
    num_of_streams: u32,

    /// directory to persist received streams into (optional, see `spec.md` §6.4)
    #[argh(option)]
    out_dir: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let args: CliArgs = argh::from_env();

    let remote_addr = match resolve(&args.host, args.port).await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("failed to resolve {}:{}: {e}", args.host, args.port);
            return ExitCode::FAILURE;
        }
    };

    match run(remote_addr, args.num_of_streams, args.out_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("qstream-client: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves `host:port` to a socket address, accepting both IP literals and
/// hostnames (`original_source/QuicClient.py` resolves via
/// `socket.gethostbyname`; `SocketAddr::parse` alone would reject anything
/// that isn't already an IP literal).
async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"))
}

async fn run(
    remote_addr: SocketAddr,
    num_of_streams: u32,
    out_dir: Option<String>,
) -> qstream::QsResult<()> {
    let conn = run_initiator(remote_addr, num_of_streams, ConnectionConfig::default()).await?;

    let mut stream_stats = Vec::new();
    for stream_id in conn.stream_ids().await {
        if let Some(data) = conn.stream_received_data(stream_id).await {
            if let Some(dir) = &out_dir {
                let path = format!("{dir}/temp_stream_{stream_id}");
                if let Err(e) = tokio::fs::write(&path, &data).await {
                    tracing::warn!(stream_id, error = %e, "failed to persist received stream");
                }
            }
        }
        if let Some(stats) = conn.stream_stats(stream_id).await {
            stream_stats.push(stats);
        }
    }

    let stream_count = stream_stats.len();
    let report = qstream::stats::ConnectionReport {
        streams: stream_stats,
        total_bytes_sent: conn.bytes_sent().await,
        total_elapsed: conn.elapsed().await,
    };
    print!("{report}");

    if let Err(e) = tokio::fs::create_dir_all("stats").await {
        tracing::warn!(error = %e, "failed to create stats directory");
    } else {
        let path = format!("stats/client_{stream_count}_streams_stats.txt");
        if let Err(e) = tokio::fs::write(&path, report.to_string()).await {
            tracing::warn!(error = %e, path, "failed to write stats report");
        }
    }

    Ok(())
}
