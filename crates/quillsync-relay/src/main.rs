//! Relay server binary

use clap::Parser;
use quillsync_relay::RelayServer;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "quillsync-relay", about = "Untrusted ciphertext relay for quillsync")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9465")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let server = RelayServer::bind(&args.listen).await?;
    let cancel = server.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    server.run().await
}
