//! Client session.
//!
//! Every call opens a fresh connection, sends one request and waits a bounded
//! time for one response. The `try_*` methods return typed errors; the plain
//! methods log the failure and return `None`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ClientOptions;
use crate::error::{Error, Result};
use crate::transfer::{self, expand_path, open_outgoing, receive_file, DEFAULT_CHUNK};
use crate::transport::protocol::{decode_response, encode};
use crate::transport::{
    recv_frame_limited, send_frame, Keywords, Request, Response, DEFAULT_MAX_FRAME,
};

/// Extra time granted per MiB of file body on top of the base timeout.
const PER_MIB: Duration = Duration::from_secs(1);

/// Client for one bridge server.
#[derive(Debug, Clone)]
pub struct Client {
    options: ClientOptions,
}

impl Client {
    pub const fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    pub const fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Run `command` with the configured `is_function` flag and extra keywords.
    pub async fn execute(&self, command: &str) -> Option<String> {
        self.try_execute(command)
            .await
            .map_err(|e| self.report("execute", &e))
            .ok()
    }

    /// Upload a local file. Returns its path on the server.
    pub async fn upload(&self, path: impl AsRef<Path>) -> Option<String> {
        self.try_upload(path.as_ref())
            .await
            .map_err(|e| self.report("upload", &e))
            .ok()
    }

    /// Download a server file into the configured output directory.
    pub async fn download(&self, remote: &str) -> Option<PathBuf> {
        self.try_download(remote)
            .await
            .map_err(|e| self.report("download", &e))
            .ok()
    }

    pub async fn try_execute(&self, command: &str) -> Result<String> {
        self.try_execute_with(command, self.options.is_function, &self.options.extra)
            .await
    }

    /// Run `command` on the server executor.
    ///
    /// A populated `error` is returned as `Error::Remote` only when there is
    /// no result; otherwise it is logged and the result is kept.
    pub async fn try_execute_with(
        &self,
        command: &str,
        is_function: bool,
        keywords: &Keywords,
    ) -> Result<String> {
        if command.is_empty() {
            return Err(Error::Validation("Input must be non-blank string.".into()));
        }
        self.note(&format!("Executing command: {command}"));

        let mut stream = self.connect().await?;
        let request = Request::Execute {
            command: command.to_string(),
            is_function,
        };
        self.within(self.options.timeout, async {
            send_frame(&mut stream, &encode(&request)?).await?;
            send_frame(&mut stream, &encode(keywords)?).await
        })
        .await?;

        match self.await_response(&mut stream).await? {
            Response::Execute { result, error } if error.is_empty() => Ok(result),
            Response::Execute { result, error } if result.is_empty() => Err(Error::Remote(error)),
            Response::Execute { result, error } => {
                warn!(command, error = %error, "Command reported an error alongside its result");
                Ok(result)
            }
            other => Err(unexpected("execute", &other)),
        }
    }

    /// Upload `path`, rejecting missing and empty files before connecting.
    pub async fn try_upload(&self, path: &Path) -> Result<String> {
        let path = expand_path(&path.to_string_lossy());
        let outgoing = open_outgoing(&path)
            .await
            .map_err(|_| Error::Validation(format!("Non-existent file: {}", path.display())))?;
        if outgoing.size == 0 {
            return Err(Error::Validation(format!(
                "Zero block length file: {}",
                path.display()
            )));
        }
        let filename = transfer::base_name(&path.to_string_lossy())?;
        let size = outgoing.size;
        self.note(&format!("Uploading {} ({size} bytes)", outgoing.path().display()));

        let mut stream = self.connect().await?;
        let request = Request::Upload { filename, size };
        self.within(self.body_budget(size), async {
            send_frame(&mut stream, &encode(&request)?).await?;
            transfer::send_file(&mut stream, outgoing).await
        })
        .await?;

        match self.await_response(&mut stream).await? {
            Response::Upload {
                filename: Some(remote),
                error,
            } if error.is_empty() => Ok(remote),
            Response::Upload { error, .. } => Err(Error::Remote(error)),
            other => Err(unexpected("upload", &other)),
        }
    }

    /// Download `remote` into `outdir` (or the current directory).
    ///
    /// A zero-size reply means there is nothing to fetch yet and is an error.
    pub async fn try_download(&self, remote: &str) -> Result<PathBuf> {
        if remote.is_empty() {
            return Err(Error::Validation("Filename must be non-blank string.".into()));
        }
        let dest_dir = match &self.options.outdir {
            Some(dir) => expand_path(&dir.to_string_lossy()),
            None => std::env::current_dir()?,
        };
        self.note(&format!("Downloading file: {remote}"));

        let mut stream = self.connect().await?;
        let request = Request::Download {
            filename: remote.to_string(),
        };
        self.within(self.options.timeout, async {
            send_frame(&mut stream, &encode(&request)?).await
        })
        .await?;

        match self.await_response(&mut stream).await? {
            Response::Download { size: 0, error, .. } => Err(Error::Remote(if error.is_empty() {
                format!("Empty file: {remote}")
            } else {
                error
            })),
            Response::Download { filename, size, .. } => {
                let path = self
                    .within(
                        self.body_budget(size),
                        receive_file(&mut stream, &dest_dir, &filename, size, DEFAULT_CHUNK),
                    )
                    .await?;
                self.note(&format!("Wrote {size} bytes to: {}", path.display()));
                Ok(path)
            }
            other => Err(unexpected("download", &other)),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let address = self.options.address();
        self.note(&format!("Connecting to server: {address}"));
        match tokio::time::timeout(self.options.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                warn!(
                    %address,
                    error = %e,
                    "Failed to connect to server. Check if server is running on port {}",
                    self.options.port
                );
                Err(Error::Transport(e))
            }
            Err(_) => Err(Error::Timeout(self.options.timeout)),
        }
    }

    async fn await_response(&self, stream: &mut TcpStream) -> Result<Response> {
        let frame = self
            .within(self.options.timeout, recv_frame_limited(stream, DEFAULT_MAX_FRAME))
            .await?;
        let Some(frame) = frame else {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Server closed the connection without responding",
            )));
        };
        let response = decode_response(&frame)?;
        self.note(&format!("Server sent response: {response:?}"));

        if let Response::Error { error } = response {
            return Err(Error::Remote(error));
        }
        Ok(response)
    }

    async fn within<T>(
        &self,
        budget: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(budget, fut)
            .await
            .map_err(|_| Error::Timeout(budget))?
    }

    fn body_budget(&self, bytes: u64) -> Duration {
        let mib = bytes.div_ceil(1024 * 1024);
        self.options.timeout + PER_MIB * u32::try_from(mib).unwrap_or(u32::MAX)
    }

    fn note(&self, message: &str) {
        if self.options.verbose {
            info!("{message}");
        } else {
            debug!("{message}");
        }
    }

    fn report(&self, operation: &str, error: &Error) {
        warn!(
            operation,
            server = %self.options.address(),
            error = %error,
            "Request failed"
        );
    }
}

fn unexpected(expected: &str, got: &Response) -> Error {
    Error::Malformed(format!("expected {expected} response, got {got:?}"))
}
