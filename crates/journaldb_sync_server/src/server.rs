//! TCP journal server.

use crate::agent::ServerAgent;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::exports::ExportRegistry;
use journaldb_storage::Journal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn};

/// Accepts client connections and runs one [`ServerAgent`] per connection.
///
/// Agents do blocking I/O and run on the tokio blocking pool. Each one polls
/// its socket with a read timeout, so a halt reaches them within one poll
/// interval.
///
/// # Example
///
/// ```no_run
/// use journaldb_sync_server::{JournalServer, ServerConfig};
/// # async fn example(journal: std::sync::Arc<journaldb_storage::Journal>) -> journaldb_sync_server::ServerResult<()> {
/// let mut server = JournalServer::new(ServerConfig::default());
/// server.export(journal)?;
/// let addr = server.start().await?;
/// println!("serving on {addr}");
/// server.halt().await?;
/// # Ok(())
/// # }
/// ```
pub struct JournalServer {
    config: ServerConfig,
    exports: Arc<ExportRegistry>,
    running: Option<Running>,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JournalServer {
    /// Creates a server that is not yet listening.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            exports: Arc::new(ExportRegistry::new()),
            running: None,
        }
    }

    /// Exports `journal` to clients.
    pub fn export(&self, journal: Arc<Journal>) -> ServerResult<()> {
        self.exports.export(journal)
    }

    /// The export registry.
    pub fn exports(&self) -> &Arc<ExportRegistry> {
        &self.exports
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the server is listening on, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Returns true between `start` and `halt`.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when binding port 0.
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if let Some(running) = &self.running {
            return Err(ServerError::AlreadyRunning(running.addr));
        }
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;
        info!(%addr, exports = self.exports.len(), "journal server listening");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.exports),
            self.config.clone(),
            shutdown_rx,
        ));
        self.running = Some(Running {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Stops accepting connections and waits for every agent to finish.
    pub async fn halt(&mut self) -> ServerResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        // Receivers may all be gone already, which is fine.
        let _ = running.shutdown.send(true);
        running
            .task
            .await
            .map_err(|e| ServerError::Internal(format!("accept loop failed: {e}")))?;
        info!(addr = %running.addr, "journal server halted");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    exports: Arc<ExportRegistry>,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut agents = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(res) = agents.join_next() => {
                if let Err(err) = res {
                    error!("agent task failed: {err}");
                }
            }
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    if agents.len() >= config.max_connections {
                        warn!(%peer, max = config.max_connections, "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    }
                    let mut stream = match into_blocking(stream, &config) {
                        Ok(stream) => stream,
                        Err(err) => {
                            error!(%peer, "failed to prepare connection: {err}");
                            continue;
                        }
                    };
                    debug!(%peer, "connection opened");
                    let mut agent = ServerAgent::new(Arc::clone(&exports), config.clone(), Some(peer));
                    let shutdown = shutdown.clone();
                    agents.spawn_blocking(move || {
                        let span = info_span!("agent", %peer);
                        let _enter = span.enter();
                        if let Err(err) = agent.run(&mut stream, &shutdown) {
                            warn!("connection closed with error: {err}");
                        }
                    });
                }
                Err(err) => {
                    error!("failed to accept connection: {err}");
                }
            }
        }
    }

    drop(listener);
    while let Some(res) = agents.join_next().await {
        if let Err(err) = res {
            error!("agent task failed: {err}");
        }
    }
    debug!("accept loop finished");
}

fn into_blocking(stream: TcpStream, config: &ServerConfig) -> ServerResult<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.poll_interval))?;
    Ok(stream)
}
