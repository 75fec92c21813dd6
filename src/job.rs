//! Background prep jobs.
//!
//! A job asks the server for a fresh session directory, stages its input
//! there (upload, or a URL the remote side fetches itself), issues the prep
//! command and then waits for the output file to become downloadable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::CONTENT_DISPOSITION;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::cancel::CancellationToken;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::transfer::{base_name, expand_path};
use crate::transport::Keywords;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(100);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

const HEAD_TIMEOUT: Duration = Duration::from_secs(30);
const SESSION_DIR_COMMAND: &str = r#"result=session_dir("prep",/new)"#;
const OUTPUT_PREFIX: &str = "prepped_";

/// How long and how often to retry a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for Poll {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOB_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Retry `client.download(remote)` until it yields a file or `poll.timeout` elapses.
///
/// Returns `Ok(None)` on timeout and `Err(Error::Cancelled)` as soon as
/// `token` is cancelled, even mid-sleep.
pub async fn poll_download(
    client: &Client,
    remote: &str,
    poll: Poll,
    token: &CancellationToken,
) -> Result<Option<PathBuf>> {
    let deadline = Instant::now() + poll.timeout;

    loop {
        token.check()?;
        match client.try_download(remote).await {
            Ok(path) => return Ok(Some(path)),
            Err(e) => debug!(remote, error = %e, "Output not ready"),
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(remote, timeout = ?poll.timeout, "Prep job timed out");
            return Ok(None);
        }
        let nap = poll.interval.min(deadline - now);
        tokio::select! {
            () = tokio::time::sleep(nap) => {}
            () = token.cancelled() => return Err(Error::Cancelled),
        }
    }
}

/// Prepare one input file (local path or URL) on the server.
#[derive(Debug, Clone)]
pub struct PrepJob {
    pub input: String,
    /// Local directory that receives the prepped file.
    pub outdir: PathBuf,
    /// Run the remote command in a background thread and poll for its output.
    pub thread: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl PrepJob {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            outdir: PathBuf::from("."),
            thread: false,
            timeout: DEFAULT_JOB_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = outdir.into();
        self
    }

    #[must_use]
    pub const fn threaded(mut self, thread: bool) -> Self {
        self.thread = thread;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the job to completion on the current task.
    ///
    /// `Ok(None)` means the output never became available within the timeout.
    pub async fn run(&self, client: &Client, token: &CancellationToken) -> Result<Option<PathBuf>> {
        let outdir = expand_path(&self.outdir.to_string_lossy());
        check_writable(&outdir)?;

        token.check()?;
        let remote_dir = client
            .try_execute_with(SESSION_DIR_COMMAND, true, &Keywords::new())
            .await?;
        if remote_dir.is_empty() {
            return Err(Error::Remote("Failed to create remote session directory".into()));
        }
        debug!(remote_dir, "Created remote session directory");

        token.check()?;
        let (location, name) = self.stage(client).await?;
        let output = format!("{remote_dir}/{OUTPUT_PREFIX}{name}");

        token.check()?;
        let command = prep_command(&location, &remote_dir, self.thread);
        // The prep routine reports through `err`; whether the output shows up decides the job.
        match client
            .try_execute_with(&command, false, &client.options().extra)
            .await
        {
            Ok(_) => {}
            Err(Error::Remote(error)) => {
                warn!(input = %self.input, error, "Prep command reported an error");
            }
            Err(e) => return Err(e),
        }
        info!(input = %self.input, output, thread = self.thread, "Issued prep command");

        let downloader = Client::new(client.options().clone().with_outdir(outdir));
        if self.thread {
            let poll = Poll {
                timeout: self.timeout,
                interval: self.poll_interval,
            };
            poll_download(&downloader, &output, poll, token).await
        } else {
            downloader.try_download(&output).await.map(Some)
        }
    }

    /// Run the job on its own task.
    pub fn spawn(self, client: Client) -> JobHandle {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task = tokio::spawn(async move { self.run(&client, &task_token).await });
        JobHandle { token, task }
    }

    /// Remote location of the input and the base name of the output.
    async fn stage(&self, client: &Client) -> Result<(String, String)> {
        if is_remote_url(&self.input) {
            let name = match disposition_name(&self.input).await? {
                Some(name) => name,
                None => url_base_name(&self.input)?,
            };
            return Ok((self.input.clone(), name));
        }

        let name = base_name(&self.input)?;
        let remote = client.try_upload(Path::new(&self.input)).await?;
        Ok((remote, name))
    }
}

/// Handle to a spawned [`PrepJob`].
#[derive(Debug)]
pub struct JobHandle {
    token: CancellationToken,
    task: JoinHandle<Result<Option<PathBuf>>>,
}

impl JobHandle {
    /// Ask the job to stop. A poll loop wakes immediately.
    pub fn cancel(&self) {
        if self.token.cancel() {
            debug!("Prep job cancellation requested");
        }
    }

    /// Token that cancels this job when triggered from elsewhere.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<Option<PathBuf>> {
        self.task
            .await
            .map_err(|e| Error::Transport(std::io::Error::other(e)))?
    }
}

fn check_writable(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::Validation(format!(
            "Non-existent output directory: {}",
            dir.display()
        )));
    }
    tempfile::tempfile_in(dir)
        .map(drop)
        .map_err(|_| Error::Validation(format!("No write access to: {}", dir.display())))
}

fn prep_command(location: &str, out_dir: &str, thread: bool) -> String {
    let call = format!(r#""{location}",out_dir="{out_dir}",err=err"#);
    if thread {
        format!(r#"thread,"prep_file",{call}"#)
    } else {
        format!("prep_file,{call}")
    }
}

/// Whether `text` is an absolute URL naming a resource on some host.
pub fn is_remote_url(text: &str) -> bool {
    Url::parse(text)
        .is_ok_and(|url| url.host_str().is_some_and(|h| !h.is_empty()) && url.path().len() > 1)
}

fn url_base_name(text: &str) -> Result<String> {
    let url = Url::parse(text).map_err(|e| Error::Validation(e.to_string()))?;
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("URL has no file name: {text}")))
}

/// Send a HEAD request to `url` and return the file name it advertises.
///
/// Only a failed request is an error. A non-success status yields `None`.
pub async fn disposition_name(url: &str) -> Result<Option<String>> {
    let lookup_error = |reason: String| Error::UrlLookup {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(HEAD_TIMEOUT)
        .build()
        .map_err(|e| lookup_error(format!("Failed to create HTTP client: {e}")))?;
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| lookup_error(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        // Some hosts refuse HEAD; the caller falls back to the URL path.
        warn!(url, %status, "HEAD request not answered with success");
        return Ok(None);
    }

    Ok(response
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_disposition))
}

/// Extract `filename=` from a Content-Disposition value.
///
/// Quotes are stripped and `:` is replaced so the name is a valid file name.
fn parse_disposition(header: &str) -> Option<String> {
    let start = header.find("filename=")? + "filename=".len();
    let raw = header[start..].split(';').next()?.trim();
    let name = raw.trim_matches(|c| c == '"' || c == '\'').replace(':', "_");
    (!name.is_empty()).then_some(name)
}
