//! HTTP transport, retry policy, and wire request/response types shared by
//! every provider adapter (spec §4.H attempt loop).

mod error;
mod request;
mod retry;
mod transport;

pub use error::TransportError;
pub use request::Request;
pub use request::RequestCompression;
pub use request::Response;
pub use retry::RetryPolicy;
pub use transport::ByteStream;
pub use transport::HttpTransport;
pub use transport::ReqwestTransport;
pub use transport::StreamResponse;

#[cfg(test)]
mod tests {
    use http::Method;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;
    use wiremock::matchers::method;
    use wiremock::matchers::path;

    use super::*;

    #[tokio::test]
    async fn execute_returns_body_and_status_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(reqwest::Client::new());
        let req = Request::new(Method::POST, format!("{}/v1/chat/completions", server.uri()))
            .with_json(&serde_json::json!({"model": "gpt-4"}));
        let resp = transport.execute(req).await.unwrap();

        assert_eq!(resp.status, http::StatusCode::OK);
        assert_eq!(resp.json::<serde_json::Value>().unwrap(), serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn execute_surfaces_non_success_status_as_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(reqwest::Client::new());
        let req = Request::new(Method::GET, format!("{}/boom", server.uri()));
        let err = transport.execute(req).await.unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn zstd_compression_sets_content_encoding_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/compressed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(reqwest::Client::new());
        let req = Request::new(Method::POST, format!("{}/compressed", server.uri()))
            .with_json(&serde_json::json!({"large": "payload"}))
            .with_compression(RequestCompression::Zstd);
        let resp = transport.execute(req).await.unwrap();
        assert_eq!(resp.status, http::StatusCode::OK);
    }

    #[tokio::test]
    async fn stream_yields_chunks_for_a_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: hello\n\n"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(reqwest::Client::new());
        let req = Request::new(Method::GET, format!("{}/stream", server.uri()));
        let mut resp = transport.stream(req).await.unwrap();

        use futures::StreamExt;
        let mut collected = Vec::new();
        while let Some(chunk) = resp.bytes.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"data: hello\n\n");
    }
}
