/* Interpose (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use interpose::{app::InterposeApp, config::InterposeConfig, utils::init_tracing};
use tokio_util::sync::CancellationToken;

/// Command-line interface. Behavior lives in the TOML file; the CLI only points at it.
#[derive(Debug, Parser)]
#[command(name = "interpose", about = "TLS-intercepting HTTP/1.x proxy")]
struct Cli {
    /// Path to the configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Write the root certificate (PEM) to this path and exit, for installing trust.
    #[arg(long)]
    export_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => InterposeConfig::load(path)?,
        None => InterposeConfig::default(),
    };
    let app = InterposeApp::new(config).await?;

    if let Some(path) = cli.export_root {
        let pem = app
            .certificates()
            .root_certificate_pem()
            .context("no root certificate available to export")?;
        std::fs::write(&path, pem)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "root certificate exported");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });

    app.run(cancel).await
}
