pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct FunctionRequest<'a, C: Serialize> {
    code: &'a str,
    context: &'a C,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    /// Run a Puppeteer module via the Browserless /function endpoint.
    ///
    /// `code` is an ES module whose default export receives `{ page, context }`
    /// and returns `{ data, type }`. The JSON `data` is returned as-is.
    pub async fn function<C: Serialize>(
        &self,
        code: &str,
        context: &C,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let endpoint = self.endpoint("function");
        debug!(
            base_url = self.base_url.as_str(),
            timeout_ms = timeout.as_millis() as u64,
            "Calling Browserless function"
        );

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(&FunctionRequest { code, context })
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = resp.text().await.map_err(|e| classify(e, timeout))?;
        serde_json::from_str(&body).map_err(|e| BrowserlessError::Decode(e.to_string()))
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}/{path}", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> BrowserlessError {
    if err.is_timeout() {
        BrowserlessError::Timeout(timeout)
    } else {
        err.into()
    }
}
