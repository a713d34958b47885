//! Tests for the Ollama engine against a canned local HTTP responder.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tons_core::engine::{RemoteConfig, RemoteEngine};
use tons_core::{Engine, EngineError, Request, StreamMode};

/// Canned reply: status line, body parts written with `delay` between them.
#[derive(Clone)]
struct Reply {
    status: &'static str,
    parts: Vec<String>,
    delay: Duration,
}

impl Reply {
    fn ok(parts: &[&str]) -> Self {
        Self {
            status: "200 OK",
            parts: parts.iter().map(|p| p.to_string()).collect(),
            delay: Duration::from_millis(10),
        }
    }

    fn status(status: &'static str, body: &str) -> Self {
        Self {
            status,
            parts: vec![body.to_string()],
            delay: Duration::ZERO,
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Serve `reply` to every connection. Request bodies are sent on the receiver.
fn serve(reply: Reply) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (bodies, received) = mpsc::channel();
    std::thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let reply = reply.clone();
            let bodies = bodies.clone();
            std::thread::spawn(move || respond(stream, &reply, &bodies));
        }
    });
    (url, received)
}

fn respond(mut stream: TcpStream, reply: &Reply, bodies: &mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length];
    let _ = reader.read_exact(&mut body);
    let _ = bodies.send(String::from_utf8_lossy(&body).into_owned());

    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
        reply.status
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }
    for part in &reply.parts {
        std::thread::sleep(reply.delay);
        if stream.write_all(part.as_bytes()).and_then(|_| stream.flush()).is_err() {
            return;
        }
    }
}

fn engine(url: &str) -> RemoteEngine {
    RemoteEngine::new(RemoteConfig {
        host: url.to_string(),
        model: "llama3.2".into(),
        timeout: Duration::from_secs(10),
        ..Default::default()
    })
    .unwrap()
}

fn request() -> Request {
    Request::new("Hello", "English", "German")
}

#[tokio::test]
async fn test_translate_returns_trimmed_response() {
    let (url, bodies) = serve(Reply::ok(&[r#"{"model":"llama3.2","response":"  Hallo \n","done":true}"#]));
    let response = engine(&url).translate(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(response.text, "Hallo");
    assert!(response.done);

    let body: serde_json::Value = serde_json::from_str(&bodies.recv().unwrap()).unwrap();
    assert_eq!(body["model"], "llama3.2");
    assert_eq!(body["stream"], false);
    assert!(body["prompt"].as_str().unwrap().contains("Hello"));
    assert!(body["system"].as_str().is_some());
    assert_eq!(body["options"]["num_predict"], 512);
}

#[tokio::test]
async fn test_stream_relays_ndjson_deltas() {
    let (url, bodies) = serve(Reply::ok(&[
        "{\"response\":\"Hal\",\"done\":false}\n",
        "{\"response\":\"lo\",\"done\":false}\n",
        "{\"response\":\"\",\"done\":true,\"eval_count\":2}\n",
    ]));
    let engine = engine(&url);
    assert_eq!(engine.stream_mode(), StreamMode::Delta);

    let responses = engine
        .translate_stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    let texts: Vec<&str> = responses.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["Hal", "lo", ""]);
    assert!(responses.last().unwrap().done);

    let body: serde_json::Value = serde_json::from_str(&bodies.recv().unwrap()).unwrap();
    assert_eq!(body["stream"], true);
}

#[tokio::test]
async fn test_stream_joins_lines_split_across_reads() {
    let (url, _) = serve(Reply::ok(&[
        "{\"response\":\"Hal",
        "lo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n",
    ]));
    let stream = engine(&url)
        .translate_stream(request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.collect_text(StreamMode::Delta).await.unwrap(), "Hallo");
}

#[tokio::test]
async fn test_http_error_carries_server_message() {
    let (url, _) = serve(Reply::status("404 Not Found", r#"{"error":"model \"nope\" not found"}"#));
    let err = engine(&url).translate(&request(), &CancellationToken::new()).await.unwrap_err();
    match err {
        EngineError::Transport(message) => {
            assert!(message.contains("404"), "message: {message}");
            assert!(message.contains("not found"), "message: {message}");
        }
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_error_line_is_terminal() {
    let (url, _) = serve(Reply::ok(&[
        "{\"response\":\"Hal\",\"done\":false}\n",
        "{\"error\":\"out of memory\"}\n",
    ]));
    let responses = engine(&url)
        .translate_stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    let last = responses.last().unwrap();
    assert!(last.done);
    assert!(last.error.as_deref().unwrap_or_default().contains("out of memory"));
}

#[tokio::test]
async fn test_stream_without_done_is_an_error() {
    let (url, _) = serve(Reply::ok(&["{\"response\":\"Hal\",\"done\":false}\n"]));
    let result = engine(&url)
        .translate_stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .collect_text(StreamMode::Delta)
        .await;
    let err = result.unwrap_err();
    assert!(err.contains("stream ended before completion"), "error: {err}");
}

#[tokio::test]
async fn test_slow_server_times_out() {
    let (url, _) = serve(Reply::ok(&[r#"{"response":"late","done":true}"#]).delayed(Duration::from_secs(3)));
    let engine = RemoteEngine::new(RemoteConfig {
        host: url,
        timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap();

    let err = engine.translate(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout));

    let responses = engine
        .translate_stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(responses.last().unwrap().error.as_deref(), Some("translation timed out"));
}

#[tokio::test]
async fn test_list_models_and_availability() {
    let (url, _) = serve(Reply::ok(&[
        r#"{"models":[{"name":"llama3.2:latest","modified_at":"2024-10-01T10:00:00Z","size":2019393189}]}"#,
    ]));
    let engine = engine(&url);
    let models = engine.list_models().await.unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].name, "llama3.2:latest");
    assert!(engine.available().await);
}

#[tokio::test]
async fn test_unreachable_server() {
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let engine = engine(&format!("http://127.0.0.1:{port}"));
    assert!(!engine.available().await);

    let err = engine.translate(&request(), &CancellationToken::new()).await.unwrap_err();
    match err {
        EngineError::Transport(message) => assert!(message.contains("cannot connect"), "message: {message}"),
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_text_sends_nothing() {
    let (url, bodies) = serve(Reply::ok(&[r#"{"response":"unused","done":true}"#]));
    let engine = engine(&url);
    let empty = Request::new("", "en", "de");
    let response = engine.translate(&empty, &CancellationToken::new()).await.unwrap();
    assert!(response.done && response.text.is_empty());
    assert!(bodies.recv_timeout(Duration::from_millis(100)).is_err());
}
