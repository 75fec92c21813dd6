//! interp-bridge
//!
//! Serves a command interpreter over TCP, or talks to a running server.
//! Client defaults come from `BRIDGE_HOST`, `BRIDGE_PORT` and `BRIDGE_TIMEOUT`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use interp_bridge::config::{ClientOptions, ServerConfig};
use interp_bridge::executor::ShellExecutor;
use interp_bridge::job::PrepJob;
use interp_bridge::transport::Keywords;
use interp_bridge::{Client, Server, StopSignal};

#[derive(Parser, Debug)]
#[command(name = "interp-bridge")]
#[command(about = "TCP bridge to a stateful command interpreter")]
struct Args {
    /// Server host to connect to
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port (listen port for `serve`)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Seconds to wait for a server response
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Log per-request progress
    #[arg(long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge server with a shell executor
    Serve {
        /// Address to bind (default: all interfaces)
        #[arg(long)]
        bind: Option<String>,

        /// Root for upload session directories
        #[arg(long)]
        session_root: Option<PathBuf>,
    },

    /// Execute a command on the server
    Exec {
        command: String,

        /// Attach keywords inside the command's call syntax
        #[arg(long)]
        function: bool,

        /// Keyword passed to the command (value parsed as JSON, else text)
        #[arg(short = 'k', long = "keyword", value_name = "KEY=VALUE", value_parser = parse_keyword)]
        keywords: Vec<(String, Value)>,
    },

    /// Upload a local file into a fresh server session directory
    Upload { file: PathBuf },

    /// Download a file from the server
    Download {
        remote: String,

        #[arg(long)]
        outdir: Option<PathBuf>,
    },

    /// Prep a local file or URL on the server and fetch the result
    Prep {
        input: String,

        /// Run remotely in the background and poll for the output
        #[arg(long)]
        thread: bool,

        /// Seconds to wait for the output when polling
        #[arg(long, default_value_t = 100)]
        job_timeout: u64,

        #[arg(long, default_value = ".")]
        outdir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Serve { bind, session_root } => {
            let mut config = ServerConfig::from_env();
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if let Some(port) = args.port {
                config.port = port;
            }
            if session_root.is_some() {
                config.session_root = session_root;
            }
            serve(config).await
        }
        Command::Exec {
            command,
            function,
            keywords,
        } => {
            let mut options =
                client_options(args.host.as_deref(), args.port, args.timeout, args.verbose)?;
            options.is_function = function;
            options.extra = keywords.into_iter().collect::<Keywords>();
            let result = Client::new(options)
                .try_execute(&command)
                .await
                .context("Execute failed")?;
            println!("{result}");
            Ok(())
        }
        Command::Upload { file } => {
            let options =
                client_options(args.host.as_deref(), args.port, args.timeout, args.verbose)?;
            let remote = Client::new(options)
                .try_upload(&file)
                .await
                .with_context(|| format!("Upload of {} failed", file.display()))?;
            println!("{remote}");
            Ok(())
        }
        Command::Download { remote, outdir } => {
            let mut options =
                client_options(args.host.as_deref(), args.port, args.timeout, args.verbose)?;
            options.outdir = outdir;
            let local = Client::new(options)
                .try_download(&remote)
                .await
                .with_context(|| format!("Download of {remote} failed"))?;
            println!("{}", local.display());
            Ok(())
        }
        Command::Prep {
            input,
            thread,
            job_timeout,
            outdir,
        } => {
            let options =
                client_options(args.host.as_deref(), args.port, args.timeout, args.verbose)?;
            let job = PrepJob::new(input)
                .with_outdir(outdir)
                .threaded(thread)
                .with_timeout(Duration::from_secs(job_timeout));
            prep(job, Client::new(options)).await
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let stop = StopSignal::new();
    let handle = Server::new(config, ShellExecutor::default(), stop.clone())
        .spawn()
        .await
        .context("Failed to start server")?;

    let port = handle.port();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(port, "Interrupt received, stopping server");
            stop.stop(port);
        }
    });

    handle.join().await.context("Server task failed")?;
    Ok(())
}

async fn prep(job: PrepJob, client: Client) -> Result<()> {
    let handle = job.spawn(client);
    let token = handle.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling prep job");
            token.cancel();
        }
    });

    match handle.join().await.context("Prep job failed")? {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => bail!("Prep job timed out before the output was available"),
    }
}

fn client_options(
    host: Option<&str>,
    port: Option<u16>,
    timeout: Option<f64>,
    verbose: bool,
) -> Result<ClientOptions> {
    let mut options = ClientOptions::from_env();
    if let Some(host) = host {
        options.ip = host.to_string();
    }
    if let Some(port) = port {
        options.port = port;
    }
    if let Some(secs) = timeout {
        options.timeout = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("Invalid timeout: {secs}"))?;
    }
    options.verbose = verbose;
    Ok(options)
}

fn parse_keyword(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty keyword name in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
