//! End-to-end tests: a real server on a loopback port, driven by the client
//! and by raw frames.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use interp_bridge::config::{ClientOptions, ServerConfig};
use interp_bridge::transport::protocol::{decode_response, encode};
use interp_bridge::transport::{recv_frame, send_frame, Keywords, Request, Response};
use interp_bridge::{Client, Error, Executor, Server, ServerHandle, StopSignal};

/// Tiny interpreter: `name=a+b`, `name=N`, `name=lookup("key",_extra=extra)`,
/// and `partial`, which leaves both a result and an error.
#[derive(Debug, Default)]
struct Arithmetic {
    variables: HashMap<String, Value>,
}

impl Arithmetic {
    fn evaluate(&self, expr: &str) -> Result<Value, String> {
        let expr = expr.trim();
        if let Some(args) = expr.strip_prefix("lookup(").and_then(|a| a.strip_suffix(')')) {
            let mut parts = args.split(',');
            let key = parts.next().unwrap_or_default().trim().trim_matches('"');
            if !parts.any(|p| p.trim() == "_extra=extra") {
                return Err("lookup needs keywords".to_string());
            }
            return self
                .variables
                .get("extra")
                .and_then(|extra| extra.get(key))
                .cloned()
                .ok_or_else(|| format!("no keyword {key}"));
        }
        let mut total: i64 = 0;
        for term in expr.split('+') {
            total += term
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("Syntax error: {expr}"))?;
        }
        Ok(json!(total))
    }
}

#[async_trait]
impl Executor for Arithmetic {
    async fn run(&mut self, command: &str) -> interp_bridge::Result<()> {
        if command == "extra=hash2struct(extra_keywords)" {
            let bound = self.variables.get("extra_keywords").cloned().unwrap_or(Value::Null);
            self.variables.insert("extra".to_string(), bound);
            return Ok(());
        }
        if command == "partial" {
            self.variables.insert("result".to_string(), json!("value"));
            self.variables.insert("err".to_string(), json!("% some warning"));
            return Ok(());
        }
        let (name, expr) = command
            .split_once('=')
            .ok_or_else(|| Error::Executor(format!("Syntax error: {command}")))?;
        let value = self.evaluate(expr).map_err(Error::Executor)?;
        self.variables.insert(name.trim().to_string(), value);
        Ok(())
    }

    fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).cloned()
    }
}

struct Harness {
    handle: ServerHandle,
    stop: StopSignal,
    session_root: TempDir,
}

impl Harness {
    async fn start() -> Self {
        let session_root = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            session_root: Some(session_root.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let stop = StopSignal::new();
        let handle = Server::new(config, Arithmetic::default(), stop.clone())
            .spawn()
            .await
            .unwrap();
        Self {
            handle,
            stop,
            session_root,
        }
    }

    fn options(&self) -> ClientOptions {
        ClientOptions {
            ip: "127.0.0.1".to_string(),
            port: self.handle.port(),
            timeout: Duration::from_secs(5),
            ..ClientOptions::default()
        }
    }

    fn client(&self) -> Client {
        Client::new(self.options())
    }

    async fn raw(&self) -> TcpStream {
        TcpStream::connect(self.handle.local_addr()).await.unwrap()
    }

    async fn shutdown(self) {
        self.stop.stop(self.handle.port());
        tokio::time::timeout(Duration::from_secs(5), self.handle.join())
            .await
            .expect("server should stop")
            .unwrap();
    }
}

async fn exchange(
    stream: &mut TcpStream,
    request: &Request,
    keywords: Option<&Keywords>,
) -> Response {
    send_frame(stream, &encode(request).unwrap()).await.unwrap();
    if let Some(keywords) = keywords {
        send_frame(stream, &encode(keywords).unwrap()).await.unwrap();
    }
    let frame = recv_frame(stream).await.unwrap().expect("response frame");
    decode_response(&frame).unwrap()
}

#[tokio::test]
async fn execute_returns_result_variable() {
    let server = Harness::start().await;
    let mut options = server.options();
    options.is_function = true;
    let result = Client::new(options).execute("result=1+1").await;
    assert_eq!(result.as_deref(), Some("2"));
    server.shutdown().await;
}

#[tokio::test]
async fn executor_error_is_reported_and_server_keeps_serving() {
    let server = Harness::start().await;
    let client = server.client();

    let err = client.try_execute("result=1+x").await.unwrap_err();
    match err {
        Error::Remote(message) => assert!(message.contains("Syntax error")),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(client.execute("result=40+2").await.as_deref(), Some("42"));
    server.shutdown().await;
}

#[tokio::test]
async fn error_alongside_result_keeps_the_result() {
    let server = Harness::start().await;
    let client = server.client();
    assert_eq!(client.execute("partial").await.as_deref(), Some("value"));
    assert_eq!(client.try_execute("partial").await.unwrap(), "value");
    server.shutdown().await;
}

#[tokio::test]
async fn keywords_reach_function_commands() {
    let server = Harness::start().await;
    let mut options = server.options();
    options.is_function = true;
    options.extra.insert("title".to_string(), json!("flare"));

    let result = Client::new(options).execute(r#"result=lookup("title")"#).await;
    assert_eq!(result.as_deref(), Some("flare"));
    server.shutdown().await;
}

#[tokio::test]
async fn upload_then_download_is_byte_identical() {
    let server = Harness::start().await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("ten.bin");
    std::fs::write(&source, b"0123456789").unwrap();

    let remote = server.client().upload(&source).await.expect("upload");
    assert!(remote.starts_with(&*server.session_root.path().to_string_lossy()));
    assert!(remote.ends_with("ten.bin"));

    let outdir = local.path().join("back");
    let client = Client::new(server.options().with_outdir(&outdir));
    let fetched = client.download(&remote).await.expect("download");
    assert_eq!(fetched, outdir.join("ten.bin"));
    assert_eq!(std::fs::read(fetched).unwrap(), b"0123456789");
    server.shutdown().await;
}

#[tokio::test]
async fn uploads_land_in_separate_session_dirs() {
    let server = Harness::start().await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("a.txt");
    std::fs::write(&source, b"abc").unwrap();

    let client = server.client();
    let first = client.upload(&source).await.unwrap();
    let second = client.upload(&source).await.unwrap();
    assert_ne!(first, second);
    server.shutdown().await;
}

#[tokio::test]
async fn download_of_missing_file_sends_no_body() {
    let server = Harness::start().await;
    let mut stream = server.raw().await;

    let response = exchange(
        &mut stream,
        &Request::Download {
            filename: "/no/such/file.bin".to_string(),
        },
        None,
    )
    .await;
    match response {
        Response::Download { size, error, .. } => {
            assert_eq!(size, 0);
            assert_eq!(error, "File not found.");
        }
        other => panic!("unexpected response {other:?}"),
    }

    // The next frame on the same connection must be the execute response.
    let response = exchange(
        &mut stream,
        &Request::Execute {
            command: "result=2+3".to_string(),
            is_function: false,
        },
        Some(&Keywords::new()),
    )
    .await;
    assert_eq!(
        response,
        Response::Execute {
            result: "5".to_string(),
            error: String::new()
        }
    );
    server.shutdown().await;
}

#[tokio::test]
async fn short_upload_gets_one_reply_then_close() {
    let server = Harness::start().await;
    let mut stream = server.raw().await;

    send_frame(&mut stream, br#"{"action":"upload","filename":"a.bin","size":10}"#)
        .await
        .unwrap();
    stream.write_all(b"abc").await.unwrap();
    stream.shutdown().await.unwrap();

    let frame = recv_frame(&mut stream).await.unwrap().expect("upload reply");
    assert_eq!(
        decode_response(&frame).unwrap(),
        Response::Upload {
            filename: None,
            error: "Error writing a.bin".to_string()
        }
    );
    assert!(recv_frame(&mut stream).await.unwrap().is_none());
    server.shutdown().await;
}

#[tokio::test]
async fn unknown_action_gets_error_then_close() {
    let server = Harness::start().await;
    let mut stream = server.raw().await;

    send_frame(&mut stream, br#"{"action":"bogus"}"#).await.unwrap();
    let frame = recv_frame(&mut stream).await.unwrap().expect("error response");
    match decode_response(&frame).unwrap() {
        Response::Error { error } => assert!(error.contains("bogus")),
        other => panic!("unexpected response {other:?}"),
    }
    assert!(recv_frame(&mut stream).await.unwrap().is_none());

    // The server itself is still up.
    assert_eq!(server.client().execute("result=1").await.as_deref(), Some("1"));
    server.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_closes_only_that_connection() {
    let server = Harness::start().await;
    let mut stream = server.raw().await;

    send_frame(&mut stream, b"not json").await.unwrap();
    assert!(recv_frame(&mut stream).await.unwrap().is_none());
    assert_eq!(server.client().execute("result=3").await.as_deref(), Some("3"));
    server.shutdown().await;
}

#[tokio::test]
async fn lenient_field_types_are_accepted() {
    let server = Harness::start().await;
    let mut stream = server.raw().await;

    send_frame(
        &mut stream,
        br#"{"action":"execute","command":"result=7+1","is_function":0}"#,
    )
    .await
    .unwrap();
    send_frame(&mut stream, b"{}").await.unwrap();
    let frame = recv_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(
        decode_response(&frame).unwrap(),
        Response::Execute {
            result: "8".to_string(),
            error: String::new()
        }
    );
    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_clients_get_their_own_results() {
    let server = Harness::start().await;
    let mut tasks = tokio::task::JoinSet::new();

    for i in 0..8i64 {
        let client = server.client();
        tasks.spawn(async move {
            for j in 0..5i64 {
                let got = client.execute(&format!("result={i}+{j}")).await;
                assert_eq!(got, Some((i + j).to_string()));
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
    server.shutdown().await;
}

#[tokio::test]
async fn stopped_server_refuses_connections() {
    let server = Harness::start().await;
    let options = server.options();
    server.shutdown().await;

    let client = Client::new(options.with_timeout(Duration::from_secs(1)));
    assert!(matches!(
        client.try_execute("result=1").await,
        Err(Error::Transport(_))
    ));
}
