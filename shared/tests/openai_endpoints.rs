use serde_json::json;
use serial_test::serial;
use shared::openai_client::{invoke_structured, InvokeOptions, PromptError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn opts() -> InvokeOptions {
    InvokeOptions {
        max_retries: 2,
        temperature: 0.7,
        max_tokens: Some(512),
        timeout_ms: 5_000,
    }
}

fn completion_body(content: serde_json::Value, finish_reason: &str, usage: serde_json::Value) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason
        }],
        "usage": usage
    })
}

#[tokio::test]
#[serial]
async fn invalid_content_exhausts_exactly_three_attempts() {
    let server = MockServer::start().await;
    std::env::set_var("OPENAI_API_BASE", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            json!("this is not an object"),
            "stop",
            json!({"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}),
        )))
        .expect(3)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let err = invoke_structured(&client, "test-key", "gpt-4o-mini", "sys", "user", &opts())
        .await
        .unwrap_err();
    assert!(matches!(err, PromptError::Exhausted(_)), "{err}");
    assert!(err.to_string().contains("invalid"), "{err}");
}

#[tokio::test]
#[serial]
async fn missing_credentials_fail_without_any_attempt() {
    let server = MockServer::start().await;
    std::env::set_var("OPENAI_API_BASE", server.uri());
    std::env::remove_var("OPENAI_API_KEY");

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let err = invoke_structured(&client, "", "gpt-4o-mini", "sys", "user", &opts())
        .await
        .unwrap_err();
    assert!(matches!(err, PromptError::NoApiKey));
}

#[tokio::test]
#[serial]
async fn array_of_parts_content_is_parsed() {
    let server = MockServer::start().await;
    std::env::set_var("OPENAI_API_BASE", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            json!([{"type": "text", "text": "{\"title\": \"La "},
                   {"type": "text", "text": "luna\"}"}]),
            "stop",
            json!({"prompt_tokens": 100, "completion_tokens": 20, "total_tokens": 0}),
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let answer = invoke_structured(&client, "test-key", "gpt-4o-mini", "sys", "user", &opts())
        .await
        .unwrap();
    assert_eq!(answer.value["title"], "La luna");
    // reported total was 0 → recomputed from the parts
    assert_eq!(answer.usage.total_tokens, 120);
}

#[tokio::test]
#[serial]
async fn length_cutoff_is_reported_as_truncated() {
    let server = MockServer::start().await;
    std::env::set_var("OPENAI_API_BASE", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            json!("{\"title\": \"cut off mid"),
            "length",
            json!({"prompt_tokens": 10, "completion_tokens": 512, "total_tokens": 522}),
        )))
        .expect(3)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let err = invoke_structured(&client, "test-key", "gpt-4o-mini", "sys", "user", &opts())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("truncated"), "{err}");
}

#[tokio::test]
#[serial]
async fn recovers_when_a_later_attempt_parses() {
    let server = MockServer::start().await;
    std::env::set_var("OPENAI_API_BASE", server.uri());

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            json!("```json\n{\"ok\": true}\n```"),
            "stop",
            json!({"prompt_tokens": 8, "completion_tokens": 4, "total_tokens": 12}),
        )))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let answer = invoke_structured(&client, "test-key", "gpt-4o-mini", "sys", "user", &opts())
        .await
        .unwrap();
    assert_eq!(answer.value["ok"], true);
    assert_eq!(answer.usage.total_tokens, 12);
}
