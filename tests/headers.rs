mod common;

use common::test_helpers::{config, guild, messages, session_with, MockTransport, API_BASE};
use http::{HeaderName, HeaderValue, Method};
use serde_json::json;
use sluice::{RequestOptions, Route, Session, TrackingSleeper};

#[tokio::test]
async fn authorization_carries_the_raw_token() {
    let transport = MockTransport::default();
    let sleeper = TrackingSleeper::new();
    let session = session_with(config().build().unwrap(), &transport, &sleeper);

    session.request(&guild(1), RequestOptions::new()).await.unwrap();
    session.request(&guild(1), RequestOptions::new().auth(false)).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests[0].header("authorization"), Some("test-token"));
    assert!(requests[0].request.headers["authorization"].is_sensitive());
    assert_eq!(requests[1].header("authorization"), None);
}

#[tokio::test]
async fn audit_reason_is_percent_encoded() {
    let transport = MockTransport::default();
    let sleeper = TrackingSleeper::new();
    let session = session_with(config().build().unwrap(), &transport, &sleeper);

    let options = RequestOptions::new().reason("spam / abuse: répété");
    session.request(&guild(1), options).await.unwrap();

    let requests = transport.requests();
    assert_eq!(
        requests[0].header("x-audit-log-reason"),
        Some("spam%20%2F%20abuse%3A%20r%C3%A9p%C3%A9t%C3%A9")
    );
}

#[tokio::test]
async fn json_body_sets_content_type() {
    let transport = MockTransport::default();
    let sleeper = TrackingSleeper::new();
    let session = session_with(config().build().unwrap(), &transport, &sleeper);

    let options = RequestOptions::new().json(&json!({"content": "hello"})).unwrap();
    session.request(&messages(7), options).await.unwrap();
    session.request(&messages(7), RequestOptions::new().body("raw")).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests[0].header("content-type"), Some("application/json"));
    assert_eq!(requests[0].request.body.as_deref(), Some(&b"{\"content\":\"hello\"}"[..]));
    assert_eq!(requests[0].request.method, Method::POST);
    assert_eq!(requests[0].request.url, format!("{API_BASE}/channels/7/messages"));
    assert_eq!(requests[1].header("content-type"), None);
}

#[tokio::test]
async fn session_headers_override_request_headers() {
    let transport = MockTransport::default();
    let config = config()
        .user_agent("sluice-tests/0.1")
        .extra_header("X-Super-Properties", "session")
        .build()
        .unwrap();
    let session = Session::builder(config)
        .transport(transport.clone())
        .with_sleeper(TrackingSleeper::new())
        .build()
        .unwrap();

    let options = RequestOptions::new()
        .header(HeaderName::from_static("x-super-properties"), HeaderValue::from_static("call"))
        .header(HeaderName::from_static("x-context-properties"), HeaderValue::from_static("ctx"));
    session.request(&guild(1), options).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests[0].header("user-agent"), Some("sluice-tests/0.1"));
    assert_eq!(requests[0].header("x-super-properties"), Some("session"));
    assert_eq!(requests[0].header("x-context-properties"), Some("ctx"));
    assert_eq!(requests[0].header("authorization"), None);
}

#[tokio::test]
async fn query_and_proxy_are_forwarded() {
    let transport = MockTransport::default();
    let sleeper = TrackingSleeper::new();
    let config = config().proxy("http://proxy.local:8080").build().unwrap();
    let session = session_with(config, &transport, &sleeper);

    let route = Route::builder(Method::GET, "/channels/{channel_id}/messages")
        .param("channel_id", 3)
        .build()
        .unwrap();
    session.request(&route, RequestOptions::new().query("limit", 50)).await.unwrap();
    let options = RequestOptions::new().proxy("socks5://other:1080");
    session.request(&route, options).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests[0].query("limit"), Some("50"));
    assert_eq!(requests[0].request.proxy.as_deref(), Some("http://proxy.local:8080"));
    assert_eq!(requests[1].request.proxy.as_deref(), Some("socks5://other:1080"));
}
