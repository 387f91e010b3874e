//! Reachability probe for caller-supplied callback URLs.
//!
//! When a bundle is defined with a callback, the URL is probed once before the
//! definition is accepted. The probe is a plain POST: any answer below 500
//! (including 4xx, which only means the endpoint rejected our empty body)
//! counts as reachable. It never runs inside the stitching pipeline.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, instrument};
use url::Url;

use stitcher_shared::{AppConfig, CallbackUnreachable};

/// Default timeout in seconds for the probe request.
const DEFAULT_TIMEOUT_SECS: u64 = 3;

/// User-Agent string for probe requests.
const USER_AGENT: &str = concat!("Stitcher/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Probe options
// ---------------------------------------------------------------------------

/// Configuration for the reachability probe.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Timeout for the probe request in seconds.
    pub timeout_secs: u64,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl From<&AppConfig> for ProbeOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout_secs: config.callback.probe_timeout_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Check that `url` answers a POST with a non-5xx status within the timeout.
#[instrument(skip_all, fields(url = %url))]
pub async fn probe(url: &str, opts: &ProbeOptions) -> Result<(), CallbackUnreachable> {
    let unreachable = |reason: String| CallbackUnreachable {
        url: url.to_string(),
        reason,
    };

    let target = Url::parse(url).map_err(|e| unreachable(format!("malformed URL: {e}")))?;
    if !matches!(target.scheme(), "http" | "https") {
        return Err(unreachable(format!(
            "unsupported scheme '{}'",
            target.scheme()
        )));
    }

    let client = build_client(opts).map_err(|e| unreachable(e.to_string()))?;

    let response = client
        .post(target)
        .json(&serde_json::json!({}))
        .send()
        .await
        .map_err(|e| {
            let reason = if e.is_timeout() {
                format!("no answer within {}s", opts.timeout_secs)
            } else if e.is_connect() {
                format!("connection failed: {e}")
            } else {
                format!("request failed: {e}")
            };
            debug!(%reason, "probe failed");
            unreachable(reason)
        })?;

    let status = response.status();
    if status.is_server_error() {
        return Err(unreachable(format!("HTTP {status}")));
    }

    info!(status = status.as_u16(), "callback reachable");
    Ok(())
}

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &ProbeOptions) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(opts.timeout_secs))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_answering(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/stitch"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn success_status_is_reachable() {
        let server = server_answering(204).await;
        let url = format!("{}/hooks/stitch", server.uri());
        assert!(probe(&url, &ProbeOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn client_error_is_tolerated() {
        let server = server_answering(405).await;
        let url = format!("{}/hooks/stitch", server.uri());
        assert!(probe(&url, &ProbeOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn server_error_is_rejected() {
        let server = server_answering(503).await;
        let url = format!("{}/hooks/stitch", server.uri());
        let err = probe(&url, &ProbeOptions::default()).await.unwrap_err();
        assert_eq!(err.url, url);
        assert!(err.reason.contains("503"));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let opts = ProbeOptions { timeout_secs: 1 };
        let err = probe(&server.uri(), &opts).await.unwrap_err();
        assert!(err.reason.contains("no answer within 1s"));
    }

    #[tokio::test]
    async fn malformed_url_is_rejected() {
        let err = probe("not a url", &ProbeOptions::default())
            .await
            .unwrap_err();
        assert!(err.reason.starts_with("malformed URL"));

        let err = probe("ftp://files.example.com/hook", &ProbeOptions::default())
            .await
            .unwrap_err();
        assert!(err.reason.contains("unsupported scheme"));
    }

    #[tokio::test]
    async fn refused_connection_is_rejected() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = probe(&format!("http://{addr}/hook"), &ProbeOptions::default())
            .await
            .unwrap_err();
        assert!(err.reason.contains("connection failed"));
    }

    #[tokio::test]
    async fn reset_connection_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                drop(socket);
            }
        });

        let err = probe(&format!("http://{addr}/hook"), &ProbeOptions::default())
            .await
            .unwrap_err();
        assert!(!err.reason.is_empty());
    }
}
