//! Integration tests for the offloaded worker channel.

use std::sync::{Arc, Mutex};

use futures::StreamExt;

use rag_chat_engine::config::WorkerConfig;
use rag_chat_engine::prompt::build_prompt;
use rag_chat_engine::runtime::local::LocalLoader;
use rag_chat_engine::runtime::scripted::{ScriptedLoader, ScriptedRuntime, StreamEnd};
use rag_chat_engine::runtime::{ChatMessage, ChatRuntime, CompletionRequest, EngineOptions, RuntimeError};
use rag_chat_engine::worker::{create_offloaded_engine, OffloadError};

fn options() -> EngineOptions {
    EngineOptions {
        context_window_size: 2048,
    }
}

fn request(content: String) -> CompletionRequest {
    CompletionRequest {
        messages: vec![ChatMessage::user(content)],
        stream: true,
        max_tokens: 64,
        temperature: 0.0,
    }
}

#[tokio::test]
async fn test_local_runtime_behind_worker() {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let runtime = create_offloaded_engine(
        "tiny-model",
        &options(),
        Arc::new(move |r| sink.lock().unwrap().push(r.progress)),
        Arc::new(LocalLoader),
        &WorkerConfig::default(),
    )
    .await
    .unwrap();

    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.first(), Some(&0.0));
        assert_eq!(reports.last(), Some(&1.0));
    }

    let prompt = build_prompt("Policy: lunch starts at 12:00.", "When does lunch start?");
    let stream = runtime.chat_completion(request(prompt)).await.unwrap();
    let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(fragments, vec!["Policy: ", "lunch ", "starts ", "at ", "12:00."]);

    runtime.reset_chat().await.unwrap();
}

#[tokio::test]
async fn test_stream_is_pulled_lazily() {
    let scripted = Arc::new(ScriptedRuntime::new(["a", "b", "c"]));
    let runtime = create_offloaded_engine(
        "m",
        &options(),
        Arc::new(|_| {}),
        Arc::new(ScriptedLoader::new(scripted.clone())),
        &WorkerConfig::default(),
    )
    .await
    .unwrap();

    let mut stream = runtime.chat_completion(request("q".to_string())).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "a");
    // the transcript only gains the assistant reply once the stream is drained
    assert_eq!(scripted.transcript_len(), 1);

    let rest: Vec<String> = stream.map(|f| f.unwrap()).collect().await;
    assert_eq!(rest, vec!["b", "c"]);
    assert_eq!(scripted.transcript_len(), 2);
}

#[tokio::test]
async fn test_worker_stream_error_is_propagated() {
    let scripted = Arc::new(ScriptedRuntime::new(["a"]).with_end(StreamEnd::Fail("gpu lost".into())));
    let runtime = create_offloaded_engine(
        "m",
        &options(),
        Arc::new(|_| {}),
        Arc::new(ScriptedLoader::new(scripted.clone())),
        &WorkerConfig::default(),
    )
    .await
    .unwrap();

    let items: Vec<Result<String, RuntimeError>> =
        runtime.chat_completion(request("q".to_string())).await.unwrap().collect().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_ref().unwrap(), "a");
    match &items[1] {
        Err(RuntimeError::Generation(message)) => assert!(message.contains("gpu lost")),
        other => panic!("unexpected item {other:?}"),
    }

    runtime.reset_chat().await.unwrap();
    assert_eq!(scripted.reset_count(), 1);
}

#[tokio::test]
async fn test_worker_load_failure() {
    let result = create_offloaded_engine(
        "",
        &options(),
        Arc::new(|_| {}),
        Arc::new(LocalLoader),
        &WorkerConfig::default(),
    )
    .await;

    match result {
        Err(OffloadError::Load(message)) => assert!(message.contains("empty model identifier")),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("load of an empty model id succeeded"),
    }
}
