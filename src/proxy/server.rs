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

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;

use super::session::{handle_client, SessionContext};

/// ProxyServer owns the listening socket and spawns one session task per client.
///
/// Sessions share the certificate manager and the connection pool through
/// [`SessionContext`]; everything else a session touches is owned by its task. A failing
/// session is logged and dropped without affecting the others. Only bind and accept
/// failures end the accept loop.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
}

impl ProxyServer {
    /// Binds `addr`. Port 0 picks a free port; see [`ProxyServer::local_addr`].
    pub async fn bind(addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind proxy listener on {addr}"))?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients until `cancel` fires, then cancels and awaits in-flight sessions.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "proxy listener online");
        let mut sessions = JoinSet::new();

        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted.context("accept failed")?,
                // Reap finished sessions so the set does not grow with connection count.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => continue,
            };
            tracing::debug!(%peer, "accepted client");

            let ctx = Arc::clone(&self.ctx);
            let session_cancel = cancel.child_token();
            sessions.spawn(async move {
                if let Err(err) = handle_client(socket, peer, ctx, session_cancel).await {
                    if err.is_transport() {
                        tracing::debug!(%peer, error = %err, "client session ended");
                    } else {
                        tracing::warn!(%peer, error = %err, "client session failed");
                    }
                }
            });
        }

        tracing::info!(%addr, active = sessions.len(), "proxy listener stopping");
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}
