//! JSON-RPC transport integration tests
//!
//! Requests are written as newline-delimited JSON into `serve`; everything it writes
//! back is collected from the other end of an in-memory pipe.

mod support;

use std::io::Cursor;
use std::sync::Arc;

use edgellm::ipc::{
    self, COMPLETE_NOTIFICATION, DOWNLOAD_NOTIFICATION, PARSE_ERROR, TOKEN_NOTIFICATION,
};
use edgellm::Runtime;
use serde_json::{json, Value};
use support::*;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

/// Feeds `requests` to a server and returns every message it wrote
async fn exchange(runtime: Runtime, requests: &[String]) -> Vec<Value> {
    let mut input = requests.join("\n");
    input.push('\n');

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let serving = tokio::spawn(ipc::serve(
        Arc::new(runtime),
        Cursor::new(input.into_bytes()),
        server,
    ));

    let mut output = String::new();
    client.read_to_string(&mut output).await.unwrap();
    serving.await.unwrap().unwrap();

    output
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn request(id: i64, method: &str, params: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string()
}

fn response(messages: &[Value], id: i64) -> &Value {
    messages
        .iter()
        .find(|m| m["id"] == json!(id))
        .unwrap_or_else(|| panic!("no response with id {}", id))
}

fn notifications<'a>(messages: &'a [Value], method: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["method"] == json!(method)).collect()
}

#[tokio::test]
async fn test_requests_are_answered_by_id() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_with_model(&home).await;

    let messages = exchange(
        runtime,
        &[
            request(1, "detectCapabilities", Value::Null),
            request(2, "listLocalModels", json!({})),
            request(3, "getPrivacyPolicy", Value::Null),
            request(4, "launchRockets", Value::Null),
        ],
    )
    .await;

    assert_eq!(messages.len(), 4);
    assert!(messages.iter().all(|m| m["jsonrpc"] == "2.0"));

    assert_eq!(response(&messages, 1)["result"]["performanceTier"], "high");
    assert_eq!(
        response(&messages, 2)["result"]["models"][0]["modelId"],
        MODEL_ID
    );
    assert_eq!(
        response(&messages, 3)["result"]["localProcessingOnly"],
        json!(true)
    );
    assert_eq!(response(&messages, 4)["error"]["code"], -32601);
}

#[tokio::test]
async fn test_malformed_line_gets_parse_error_and_serving_continues() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_builder(&home, Arc::new(memory_source())).build().unwrap();

    let messages = exchange(
        runtime,
        &[
            "{this is not json".to_string(),
            request(7, "getPrivacyPolicy", Value::Null),
        ],
    )
    .await;

    let parse_error = messages
        .iter()
        .find(|m| m["id"].is_null())
        .expect("parse error response");
    assert_eq!(parse_error["error"]["code"], json!(PARSE_ERROR));
    assert!(response(&messages, 7)["result"].is_object());
}

#[tokio::test]
async fn test_runtime_errors_keep_their_kind_code() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_builder(&home, Arc::new(memory_source())).build().unwrap();

    let messages = exchange(
        runtime,
        &[
            request(1, "startDownload", json!({ "modelId": "no-such-model" })),
            request(2, "updatePrivacyPolicy", json!({ "dataRetentionDays": 400 })),
        ],
    )
    .await;

    let model_error = &response(&messages, 1)["error"];
    assert_eq!(model_error["code"], -32002);
    assert_eq!(model_error["data"]["kind"], "ModelError");

    assert_eq!(response(&messages, 2)["error"]["code"], -32005);
}

#[tokio::test]
async fn test_streaming_inference_emits_ordered_tokens() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_with_model(&home).await;

    let messages = exchange(
        runtime,
        &[request(
            1,
            "startInference",
            json!({
                "modelId": MODEL_ID,
                "prompt": "What is the capital of France?",
                "params": { "maxTokens": 6 },
                "stream": true,
            }),
        )],
    )
    .await;

    assert_eq!(messages[0]["id"], 1, "the response precedes the token stream");
    let started = &response(&messages, 1)["result"];
    assert_eq!(started["decision"]["target"], "local");
    let session_id = started["sessionId"].as_str().unwrap().to_string();

    let tokens = notifications(&messages, TOKEN_NOTIFICATION);
    assert_eq!(tokens.len(), 6);
    for (i, token) in tokens.iter().enumerate() {
        assert_eq!(token["params"]["sessionId"], json!(session_id));
        assert_eq!(token["params"]["index"], json!(i));
        assert_eq!(token["params"]["finished"], json!(i == 5));
    }

    let complete = notifications(&messages, COMPLETE_NOTIFICATION);
    assert_eq!(complete.len(), 1);
    let completed = &complete[0]["params"]["response"];
    assert_eq!(completed["tokensGenerated"], 6);
    assert_eq!(completed["finishReason"], "length");
}

#[tokio::test]
async fn test_non_streaming_inference_returns_full_response() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_with_model(&home).await;

    let messages = exchange(
        runtime,
        &[request(
            9,
            "startInference",
            json!({
                "modelId": MODEL_ID,
                "prompt": "hello",
                "params": { "maxTokens": 3 },
            }),
        )],
    )
    .await;

    assert!(notifications(&messages, TOKEN_NOTIFICATION).is_empty());
    let result = &response(&messages, 9)["result"];
    assert_eq!(result["response"]["tokensGenerated"], 3);
    assert_eq!(result["decision"]["sessionId"], result["sessionId"]);
}

#[tokio::test]
async fn test_repeated_download_requests_share_one_progress_stream() {
    let home = TempDir::new().unwrap();
    let runtime = runtime_builder(&home, Arc::new(memory_source())).build().unwrap();

    let messages = exchange(
        runtime,
        &[
            request(1, "startDownload", json!({ "modelId": MODEL_ID })),
            request(2, "startDownload", json!({ "modelId": MODEL_ID })),
        ],
    )
    .await;

    assert!(response(&messages, 1)["error"].is_null());
    assert!(response(&messages, 2)["error"].is_null());

    let first_response = messages.iter().position(|m| m["id"].is_number()).unwrap();
    let first_progress = messages
        .iter()
        .position(|m| m["method"] == json!(DOWNLOAD_NOTIFICATION))
        .unwrap();
    assert!(first_response < first_progress);

    let completions = notifications(&messages, DOWNLOAD_NOTIFICATION)
        .into_iter()
        .filter(|n| n["params"]["status"] == "complete")
        .count();
    assert_eq!(completions, 1);
}
