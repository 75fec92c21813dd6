//! Server dispatcher.
//!
//! Accepts TCP clients and answers one request at a time per connection.
//! Connections are served concurrently, but every executor call goes through
//! a single mutex: the executor is stateful and not reentrant, so commands
//! run strictly one after another.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::executor::{execute_command, Executor};
use crate::transfer::{self, expand_path, fresh_session_dir, open_outgoing, receive_file};
use crate::transport::protocol::{decode_keywords, decode_request, encode};
use crate::transport::{recv_frame_limited, send_frame, Request, Response};

/// Pending stop requests, keyed by port.
///
/// Clones share state. A server only reacts to requests for its own port,
/// so one signal can be handed to several servers.
#[derive(Debug, Clone)]
pub struct StopSignal {
    pending: Arc<watch::Sender<HashSet<u16>>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HashSet::new());
        Self {
            pending: Arc::new(tx),
        }
    }

    /// Ask the server listening on `port` to shut down.
    pub fn stop(&self, port: u16) {
        self.pending.send_modify(|ports| {
            ports.insert(port);
        });
    }

    fn clear(&self, port: u16) {
        self.pending.send_if_modified(|ports| ports.remove(&port));
    }

    fn subscribe(&self) -> watch::Receiver<HashSet<u16>> {
        self.pending.subscribe()
    }
}

/// State shared by all connection tasks of one server.
struct Shared<E> {
    config: ServerConfig,
    executor: Mutex<E>,
}

/// Bridge server over an executor `E`.
pub struct Server<E> {
    shared: Arc<Shared<E>>,
    stop: StopSignal,
}

/// Handle to a server running on its own task.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the server to shut down.
    pub async fn join(self) -> Result<()> {
        self.task.await.map_err(|e| Error::Transport(std::io::Error::other(e)))
    }
}

/// Whether a connection can carry another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

impl<E: Executor + 'static> Server<E> {
    pub fn new(config: ServerConfig, executor: E, stop: StopSignal) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                executor: Mutex::new(executor),
            }),
            stop,
        }
    }

    /// Bind and serve on the current task until stopped.
    pub async fn serve(self) -> Result<()> {
        let listener = self.bind().await?;
        let (local_addr, stop_rx) = self.arm(&listener)?;
        self.run(listener, local_addr, stop_rx).await;
        Ok(())
    }

    /// Bind, then serve on a spawned task.
    ///
    /// Stop requests issued after this returns are always observed.
    pub async fn spawn(self) -> Result<ServerHandle> {
        let listener = self.bind().await?;
        let (local_addr, stop_rx) = self.arm(&listener)?;
        let task = tokio::spawn(self.run(listener, local_addr, stop_rx));
        Ok(ServerHandle { local_addr, task })
    }

    async fn bind(&self) -> Result<TcpListener> {
        let config = &self.shared.config;
        TcpListener::bind((config.bind_host(), config.port))
            .await
            .map_err(|e| {
                error!(
                    port = config.port,
                    error = %e,
                    "Could not start server. Check if already running on this port"
                );
                Error::Transport(e)
            })
    }

    /// Subscribe to stop requests and drop any left over for this port.
    fn arm(&self, listener: &TcpListener) -> Result<(SocketAddr, watch::Receiver<HashSet<u16>>)> {
        let local_addr = listener.local_addr()?;
        let stop_rx = self.stop.subscribe();
        self.stop.clear(local_addr.port());
        Ok((local_addr, stop_rx))
    }

    async fn run(
        self,
        listener: TcpListener,
        local_addr: SocketAddr,
        mut stop_rx: watch::Receiver<HashSet<u16>>,
    ) {
        let port = local_addr.port();
        let mut connections = JoinSet::new();

        info!(addr = %local_addr, "Starting bridge server");

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || stop_rx.borrow_and_update().contains(&port) {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "Client connected");
                        connections.spawn(serve_connection(stream, peer, Arc::clone(&self.shared)));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        connections.shutdown().await;
        self.stop.clear(port);

        if let Err(e) = self.shared.executor.lock().await.reset_session().await {
            warn!(error = %e, "Executor session reset failed");
        }
        info!(port, "Stopped bridge server");
    }
}

#[instrument(skip_all, fields(%peer))]
async fn serve_connection<E: Executor>(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared<E>>,
) {
    loop {
        match handle_request(&mut stream, &shared).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                warn!(error = %e, "Dropping connection");
                break;
            }
        }
    }
    info!("Client disconnected");
}

/// Read one request, dispatch it, and write its response.
async fn handle_request<E: Executor>(stream: &mut TcpStream, shared: &Shared<E>) -> Result<Flow> {
    let max = shared.config.max_frame_bytes;
    let Some(frame) = recv_frame_limited(stream, max).await? else {
        return Ok(Flow::Close);
    };

    let request = match decode_request(&frame) {
        Ok(request) => request,
        Err(Error::UnsupportedAction(action)) => {
            warn!(%action, "Unsupported client action");
            let response = Response::Error {
                error: Error::UnsupportedAction(action).to_string(),
            };
            send_response(stream, &response).await?;
            return Ok(Flow::Close);
        }
        Err(e) => return Err(e),
    };
    debug!(action = request.action(), "Dispatching");

    match request {
        Request::Upload { filename, size } => handle_upload(stream, shared, &filename, size).await,
        Request::Download { filename } => handle_download(stream, &filename).await,
        Request::Execute {
            command,
            is_function,
        } => handle_execute(stream, shared, &command, is_function).await,
    }
}

async fn handle_upload<E>(
    stream: &mut TcpStream,
    shared: &Shared<E>,
    filename: &str,
    size: u64,
) -> Result<Flow> {
    let config = &shared.config;
    let stored = match fresh_session_dir(&config.session_root()) {
        Ok(dir) => receive_file(stream, &dir, filename, size, config.recv_buffer).await,
        Err(e) => Err(e),
    };

    // Unconsumed upload bytes would be read as the next frame, so any
    // failure ends the connection once the response is out.
    let (response, flow) = match stored {
        Ok(path) => {
            info!(path = %path.display(), bytes = size, "Stored upload");
            let response = Response::Upload {
                filename: Some(path.display().to_string()),
                error: String::new(),
            };
            (response, Flow::Continue)
        }
        Err(e) => {
            warn!(filename, error = %e, "Upload failed");
            let response = Response::Upload {
                filename: None,
                error: e.to_string(),
            };
            (response, Flow::Close)
        }
    };
    send_response(stream, &response).await?;
    Ok(flow)
}

async fn handle_download(stream: &mut TcpStream, filename: &str) -> Result<Flow> {
    let path = expand_path(filename);
    let shown = path.display().to_string();

    let outgoing = match open_outgoing(&path).await {
        Ok(outgoing) => outgoing,
        Err(e) => {
            debug!(path = %shown, error = %e, "Download target unavailable");
            let error = match e {
                Error::Validation(_) => "File not found.".to_string(),
                Error::Transport(io) if io.kind() == std::io::ErrorKind::NotFound => {
                    "File not found.".to_string()
                }
                other => other.to_string(),
            };
            let response = Response::Download {
                filename: shown,
                size: 0,
                error,
            };
            send_response(stream, &response).await?;
            return Ok(Flow::Continue);
        }
    };

    let size = outgoing.size;
    let response = Response::Download {
        filename: shown,
        size,
        error: String::new(),
    };
    send_response(stream, &response).await?;
    if size > 0 {
        transfer::send_file(stream, outgoing).await?;
    }
    info!(path = %path.display(), bytes = size, "Sent download");
    Ok(Flow::Continue)
}

async fn handle_execute<E: Executor>(
    stream: &mut TcpStream,
    shared: &Shared<E>,
    command: &str,
    is_function: bool,
) -> Result<Flow> {
    // The keyword frame is always sent; skipping it would desynchronize the stream.
    let Some(frame) = recv_frame_limited(stream, shared.config.max_frame_bytes).await? else {
        return Ok(Flow::Close);
    };
    let keywords = decode_keywords(&frame)?;

    let outcome = {
        let mut executor = shared.executor.lock().await;
        execute_command(&mut *executor, command, is_function, &keywords).await
    };

    let response = Response::Execute {
        result: outcome.result,
        error: outcome.error,
    };
    send_response(stream, &response).await?;
    Ok(Flow::Continue)
}

async fn send_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    send_frame(stream, &encode(response)?).await
}
