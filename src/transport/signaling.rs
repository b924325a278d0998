//! Credential fetch and SDP offer/answer exchange.
//!
//! The real API key never reaches this crate: the host's credential
//! endpoint mints a short-lived client secret, which is then used as the
//! bearer token for the realtime negotiation POST.

use serde::Deserialize;

use crate::error::{Result, SessionError};

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
}

/// Obtain a short-lived session credential from the host endpoint.
pub async fn fetch_ephemeral_token(http: &reqwest::Client, url: &str) -> Result<String> {
    let response = http
        .post(url)
        .send()
        .await
        .map_err(|e| SessionError::transport(format!("credential endpoint unreachable: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SessionError::transport(format!(
            "credential endpoint returned {status}"
        )));
    }

    let body: CredentialResponse = response
        .json()
        .await
        .map_err(|e| SessionError::transport(format!("credential response malformed: {e}")))?;

    if body.client_secret.value.is_empty() {
        return Err(SessionError::transport("credential response missing client secret"));
    }
    Ok(body.client_secret.value)
}

/// POST the local SDP offer and return the remote answer.
pub async fn exchange_sdp(
    http: &reqwest::Client,
    base_url: &str,
    model: &str,
    voice: &str,
    token: &str,
    offer_sdp: String,
) -> Result<String> {
    let url = format!("{base_url}?model={model}&voice={voice}");
    let response = http
        .post(&url)
        .bearer_auth(token)
        .header(reqwest::header::CONTENT_TYPE, "application/sdp")
        .body(offer_sdp)
        .send()
        .await
        .map_err(|e| SessionError::transport(format!("negotiation endpoint unreachable: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SessionError::transport(format!(
            "negotiation endpoint returned {status}"
        )));
    }

    response
        .text()
        .await
        .map_err(|e| SessionError::transport(format!("failed to read SDP answer: {e}")))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn token_fetch_parses_client_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/session"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"client_secret": {"value": "ek_test_123"}})),
            )
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let token = fetch_ephemeral_token(&http, &format!("{}/api/session", server.uri()))
            .await
            .unwrap();
        assert_eq!(token, "ek_test_123");
    }

    #[tokio::test]
    async fn token_fetch_surfaces_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = fetch_ephemeral_token(&http, &server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn token_fetch_rejects_missing_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = fetch_ephemeral_token(&http, &server.uri()).await.unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[tokio::test]
    async fn sdp_exchange_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("model", "gpt-4o-realtime-preview-2024-12-17"))
            .and(query_param("voice", "ash"))
            .and(header("content-type", "application/sdp"))
            .and(header("authorization", "Bearer ek_test_123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v=0\r\nanswer"))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let answer = exchange_sdp(
            &http,
            &server.uri(),
            "gpt-4o-realtime-preview-2024-12-17",
            "ash",
            "ek_test_123",
            "v=0\r\noffer".into(),
        )
        .await
        .unwrap();
        assert_eq!(answer, "v=0\r\nanswer");
    }

    #[tokio::test]
    async fn sdp_exchange_surfaces_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let err = exchange_sdp(&http, &server.uri(), "m", "v", "bad", "sdp".into())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
    }
}
