// SPDX-License-Identifier: AGPL-3.0
// Courier HTTP - Test upload server binary

use clap::Parser;
use courier_http::{start_server, ServerState};
use std::path::PathBuf;
use std::sync::Arc;

/// Accepts multipart uploads on /upload and serves them back from /files
#[derive(Debug, Parser)]
#[command(name = "courier-test-server", version)]
struct Options {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Directory to serve; uploads land in its `files` subdirectory
    #[arg(short, long, default_value = "./static")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("courier_http=info".parse().unwrap())
                .add_directive("tower_http=info".parse().unwrap()),
        )
        .init();

    let options = Options::parse();
    tracing::info!(
        "Starting Courier test server v{} at {}",
        env!("CARGO_PKG_VERSION"),
        options.root.display()
    );

    let state = Arc::new(ServerState::new(options.root));
    if let Err(e) = start_server(state, options.port).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
