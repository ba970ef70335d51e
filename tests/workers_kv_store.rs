//! Integration tests for `WorkersKvStore` against a mocked Workers KV REST
//! endpoint, covering the 404-vs-success translation at the provider
//! boundary (§9: "provider-specific error types never leak above the
//! synchronizer").

use prerender_pipeline::store::{KvError, KvStore, WorkersKvStore};

fn store(base_url: &str) -> WorkersKvStore {
    WorkersKvStore::new_with_base_url(
        reqwest::Client::new(),
        "test-account".to_string(),
        "test-namespace".to_string(),
        "test-token".to_string(),
        base_url.to_string(),
    )
}

#[tokio::test]
async fn get_translates_404_to_not_found() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock(
            "GET",
            "/accounts/test-account/storage/kv/namespaces/test-namespace/values/some-key",
        )
        .with_status(404)
        .create_async()
        .await;

    let kv = store(&server.url());
    let result = kv.get("some-key").await;

    mock.assert_async().await;
    assert!(matches!(result, Err(KvError::NotFound)));
}

#[tokio::test]
async fn get_returns_body_on_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock(
            "GET",
            "/accounts/test-account/storage/kv/namespaces/test-namespace/values/some-key",
        )
        .with_status(200)
        .with_body(r#"{"url":"https://example.com/"}"#)
        .create_async()
        .await;

    let kv = store(&server.url());
    let result = kv.get("some-key").await.unwrap();

    mock.assert_async().await;
    assert_eq!(result, r#"{"url":"https://example.com/"}"#);
}

#[tokio::test]
async fn put_sends_value_and_ttl() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock(
            "PUT",
            "/accounts/test-account/storage/kv/namespaces/test-namespace/values/some-key",
        )
        .match_query(mockito::Matcher::UrlEncoded(
            "expiration_ttl".into(),
            "3600".into(),
        ))
        .match_body("hello")
        .with_status(200)
        .create_async()
        .await;

    let kv = store(&server.url());
    kv.put("some-key", "hello", 3600).await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn put_bails_on_non_success_status() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock(
            "PUT",
            "/accounts/test-account/storage/kv/namespaces/test-namespace/values/some-key",
        )
        .with_status(500)
        .create_async()
        .await;

    let kv = store(&server.url());
    let result = kv.put("some-key", "hello", 3600).await;
    assert!(result.is_err());
}
