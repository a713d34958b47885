//! Tests for the CLI agent engine, driven by small shell scripts.

#![cfg(unix)]

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tons_core::engine::{OutputFormat, ProcessConfig, ProcessEngine};
use tons_core::{Engine, EngineError, Request, StreamMode};

/// Agent running `script` under `sh -c`; the prompt arrives as `$1`.
fn sh_agent(script: &str, output: OutputFormat) -> ProcessEngine {
    let config = ProcessConfig::custom(
        "sh-agent",
        "sh",
        vec!["-c".to_string(), script.to_string(), "sh".to_string()],
    )
    .with_output(output)
    .with_timeout(Duration::from_secs(10));
    ProcessEngine::new(config).unwrap()
}

fn request() -> Request {
    Request::new("Hallo", "German", "English")
}

const EVENT_SCRIPT: &str = r#"
printf '%s\n' '{"type":"delta","text":"Hel"}'
printf '%s\n' 'warming up, not json'
printf '%s\n' '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}}'
printf '%s\n' '{"type":"result","result":"Hello"}'
exec sleep 5
"#;

#[tokio::test]
async fn test_raw_output_is_the_translation() {
    let engine = sh_agent("printf 'Hello\\n\\n'", OutputFormat::Raw);
    let response = engine.translate(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(response.text, "Hello");
    assert!(response.done);
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_prompt_is_last_argument() {
    let engine = sh_agent(r#"printf '%s' "$1""#, OutputFormat::Raw);
    let request = request().with_template("{{text}}|{{target_lang}}");
    let response = engine.translate(&request, &CancellationToken::new()).await.unwrap();
    assert_eq!(response.text, "Hallo|English");
}

#[tokio::test]
async fn test_event_stream_blocking_uses_streamed_text() {
    let engine = sh_agent(EVENT_SCRIPT.replace("exec sleep 5", "").as_str(), OutputFormat::EventStream);
    let response = engine.translate(&request(), &CancellationToken::new()).await.unwrap();
    assert_eq!(response.text, "Hello");
}

#[tokio::test]
async fn test_event_stream_streams_cumulative_text() {
    let engine = sh_agent(EVENT_SCRIPT, OutputFormat::EventStream);
    assert_eq!(engine.stream_mode(), StreamMode::Cumulative);

    let started = Instant::now();
    let stream = engine.translate_stream(request(), CancellationToken::new()).await.unwrap();
    let responses = stream.collect().await;

    // the result record ends the stream without waiting for the agent to exit
    assert!(started.elapsed() < Duration::from_secs(4));
    let texts: Vec<&str> = responses.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["Hel", "Hello", "Hello"]);
    let last = responses.last().unwrap();
    assert!(last.done);
    assert!(last.error.is_none());
    assert_eq!(responses.iter().filter(|r| r.done).count(), 1);
}

#[tokio::test]
async fn test_raw_stream_delivers_deltas() {
    let engine = sh_agent("printf 'Hal'; sleep 0.1; printf 'lo'", OutputFormat::Raw);
    assert_eq!(engine.stream_mode(), StreamMode::Delta);
    let stream = engine.translate_stream(request(), CancellationToken::new()).await.unwrap();
    assert_eq!(stream.collect_text(StreamMode::Delta).await.unwrap(), "Hallo");
}

#[tokio::test]
async fn test_non_zero_exit_is_process_error() {
    let engine = sh_agent("echo 'quota exceeded' >&2; exit 3", OutputFormat::Raw);
    let err = engine.translate(&request(), &CancellationToken::new()).await.unwrap_err();
    match err {
        EngineError::Process(message) => {
            assert!(message.contains("quota exceeded"), "message: {message}");
        }
        other => panic!("expected process error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_zero_exit_fails_stream() {
    let engine = sh_agent("printf 'partial'; exit 3", OutputFormat::Raw);
    let responses = engine
        .translate_stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    let last = responses.last().unwrap();
    assert!(last.done);
    assert!(last.error.is_some());
}

#[tokio::test]
async fn test_timeout_kills_agent() {
    let config = ProcessConfig::custom("slow", "sh", vec!["-c".into(), "exec sleep 10".into(), "sh".into()])
        .with_timeout(Duration::from_millis(200));
    let engine = ProcessEngine::new(config).unwrap();

    let started = Instant::now();
    let err = engine.translate(&request(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Timeout));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stream_timeout_is_terminal_error() {
    let config = ProcessConfig::custom(
        "slow",
        "sh",
        vec!["-c".into(), "printf 'Hel'; exec sleep 10".into(), "sh".into()],
    )
    .with_timeout(Duration::from_millis(300));
    let engine = ProcessEngine::new(config).unwrap();

    let responses = engine
        .translate_stream(request(), CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    let last = responses.last().unwrap();
    assert!(last.done);
    assert_eq!(last.error.as_deref(), Some("translation timed out"));
}

#[tokio::test]
async fn test_cancellation_reports_timeout() {
    let engine = sh_agent("exec sleep 10", OutputFormat::Raw);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = engine.translate(&request(), &cancel).await.unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_missing_command() {
    let config = ProcessConfig::custom("ghost", "/nonexistent/agent-binary", vec!["-p".into()]);
    let engine = ProcessEngine::new(config).unwrap();
    assert!(!engine.available().await);

    let err = engine.translate(&request(), &CancellationToken::new()).await;
    tokio_test::assert_err!(&err);
    assert!(matches!(err, Err(EngineError::Process(_))));

    let stream = engine.translate_stream(request(), CancellationToken::new()).await;
    let responses = tokio_test::assert_ok!(stream).collect().await;
    assert_eq!(responses.len(), 1);
    assert!(responses[0].is_error());
}

#[tokio::test]
async fn test_empty_text_skips_spawn() {
    let config = ProcessConfig::custom("ghost", "/nonexistent/agent-binary", vec![]);
    let engine = ProcessEngine::new(config).unwrap();
    let empty = Request::new("", "en", "ko");

    let response = engine.translate(&empty, &CancellationToken::new()).await.unwrap();
    assert!(response.done);
    assert!(response.text.is_empty());

    let responses = engine
        .translate_stream(empty, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(responses.len(), 1);
    assert!(responses[0].done && responses[0].error.is_none());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let engine = sh_agent("true", OutputFormat::Raw);
    engine.close().await.unwrap();
    engine.close().await.unwrap();
}
