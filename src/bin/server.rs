use std::process::ExitCode;

use argh::FromArgs;
use bytes::Bytes;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use qstream::config::ConnectionConfig;
use qstream::peer::run_responder;

/// Responder: listens on a UDP port and serves files out of `files_to_send/`
/// to whichever initiator connects first (`spec.md` §6.3: `<program> <port>`).
#[derive(FromArgs)]
struct CliArgs {
    /// UDP port to listen on
    #[argh(positional)]
    port: u16,

    /// directory holding `file_<i>` sources (default: `files_to_send`)
    #[argh(option, default = "String::from(\"files_to_send\")")]
    source_dir: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let args: CliArgs = argh::from_env();
    let local_addr = match format!("0.0.0.0:{}", args.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("invalid port: {e}");
            return ExitCode::FAILURE;
        }
    };

    let source_dir = args.source_dir;
    let result = run_responder(local_addr, ConnectionConfig::default(), move |stream_id| {
        let path = format!("{source_dir}/file_{stream_id}");
        async move {
            tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(qstream::QsError::from)
        }
    })
    .await;

    match result {
        Ok(conn) => {
            tracing::info!(
                bytes_sent = conn.bytes_sent().await,
                "responder finished serving streams"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("qstream-server: {e}");
            ExitCode::FAILURE
        }
    }
}
