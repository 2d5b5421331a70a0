//! Execution environment backed by a Browserless server.
//!
//! Browserless is stateless per request, so `load` only remembers the
//! document; each `run` navigates to it (or sets the frozen HTML) and then
//! evaluates the program inside the page. Frozen HTML gets a `<base href>`
//! pointing at the page's URL so relative links resolve as they did live.

use std::time::Duration;

use async_trait::async_trait;
use browserless_client::{BrowserlessClient, BrowserlessError};
use fathom_common::{Config, DocumentRef};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::environment::ExecutionEnvironment;
use crate::error::ExecutionError;

/// Puppeteer module run by the /function endpoint. `program` becomes the body
/// of a function called with `args`, so the program sees them as `arguments`.
pub const FUNCTION_MODULE: &str = r#"export default async function ({ page, context }) {
  const { document, program, args } = context;
  if (document.kind === "url") {
    await page.goto(document.url, { waitUntil: "load" });
  } else if (document.kind === "frozen") {
    await page.setContent(document.html, { waitUntil: "load" });
  } else {
    await page.goto("about:blank");
  }
  const data = await page.evaluate((source, callArgs) => {
    return new Function(source).apply(window, callArgs);
  }, program, args);
  return { data: data === undefined ? null : data, type: "application/json" };
}
"#;

#[derive(Serialize)]
struct FunctionContext<'a> {
    document: &'a DocumentRef,
    program: &'a str,
    args: &'a [Value],
}

/// Insert `<base href="url">` at the start of `<head>`, or before the
/// markup when there is no head. Snapshots that already carry a base are
/// left alone.
fn with_base_href(html: &str, url: &str) -> String {
    let lower = html.to_ascii_lowercase();
    if lower.contains("<base") {
        return html.to_string();
    }

    let tag = format!("<base href=\"{}\">", url.replace('"', "&quot;"));
    let head_end = lower
        .match_indices("<head")
        .find(|(i, _)| {
            matches!(
                lower.as_bytes().get(i + 5),
                Some(b'>' | b' ' | b'\t' | b'\n' | b'\r')
            )
        })
        .and_then(|(i, _)| lower[i..].find('>').map(|end| i + end + 1));

    match head_end {
        Some(at) => format!("{}{tag}{}", &html[..at], &html[at..]),
        None => format!("{tag}{html}"),
    }
}

pub struct BrowserlessEnvironment {
    client: BrowserlessClient,
    document: DocumentRef,
    closed: bool,
}

impl BrowserlessEnvironment {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        info!(base_url, "Opening Browserless execution environment");
        Self {
            client: BrowserlessClient::new(base_url, token),
            document: DocumentRef::Blank,
            closed: false,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.browserless_url, config.browserless_token.as_deref())
    }
}

#[async_trait]
impl ExecutionEnvironment for BrowserlessEnvironment {
    async fn load(&mut self, document: &DocumentRef) -> Result<(), ExecutionError> {
        if self.closed {
            return Err(ExecutionError::Fault("session closed".to_string()));
        }
        self.document = match document {
            DocumentRef::Frozen { url, html } => DocumentRef::Frozen {
                url: url.clone(),
                html: with_base_href(html, url),
            },
            other => other.clone(),
        };
        Ok(())
    }

    async fn run(
        &mut self,
        program: &str,
        args: &[Value],
        timeout: Duration,
    ) -> Result<Value, ExecutionError> {
        if self.closed {
            return Err(ExecutionError::Fault("session closed".to_string()));
        }

        let context = FunctionContext {
            document: &self.document,
            program,
            args,
        };
        let context = serde_json::to_value(&context)
            .map_err(|e| ExecutionError::Fault(format!("unserializable arguments: {e}")))?;

        let call = self.client.function(FUNCTION_MODULE, &context, timeout);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(BrowserlessError::Timeout(_))) | Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Browserless call timed out");
                Err(ExecutionError::Timeout(timeout))
            }
            Ok(Err(e)) => Err(ExecutionError::Fault(e.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), ExecutionError> {
        self.closed = true;
        self.document = DocumentRef::Blank;
        info!("Closed Browserless execution environment");
        Ok(())
    }

    fn name(&self) -> &str {
        "browserless"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one HTTP request, headers and body.
    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    /// Serve a single canned response and return the base URL.
    async fn one_shot_server(status: &str, body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    /// Accept a connection and never answer.
    async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn returns_function_data() {
        let base = one_shot_server("200 OK", r#"{"title":"Blue Kettle"}"#).await;
        let mut env = BrowserlessEnvironment::new(&base, Some("secret"));

        let value = env
            .run("return 1;", &[], Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(value, json!({ "title": "Blue Kettle" }));
    }

    #[tokio::test]
    async fn unanswered_call_is_a_timeout() {
        let base = silent_server().await;
        let mut env = BrowserlessEnvironment::new(&base, None);
        let timeout = Duration::from_millis(300);

        let result = env.run("return 1;", &[], timeout).await;

        assert_eq!(result, Err(ExecutionError::Timeout(timeout)));
    }

    #[tokio::test]
    async fn server_error_is_a_fault() {
        let base = one_shot_server("500 Internal Server Error", "boom").await;
        let mut env = BrowserlessEnvironment::new(&base, None);

        let result = env.run("return 1;", &[], Duration::from_secs(5)).await;

        match result {
            Err(ExecutionError::Fault(message)) => assert!(message.contains("500")),
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn undecodable_response_is_a_fault() {
        let base = one_shot_server("200 OK", "not json!").await;
        let mut env = BrowserlessEnvironment::new(&base, None);

        let result = env.run("return 1;", &[], Duration::from_secs(5)).await;

        assert!(matches!(result, Err(ExecutionError::Fault(_))));
    }

    #[test]
    fn base_href_goes_inside_head() {
        let html = with_base_href(
            "<html><head><title>Kettle</title></head><body></body></html>",
            "https://shop.example/kettle",
        );
        assert_eq!(
            html,
            "<html><head><base href=\"https://shop.example/kettle\"><title>Kettle</title></head><body></body></html>"
        );
    }

    #[test]
    fn base_href_without_head_or_with_existing_base() {
        assert_eq!(
            with_base_href("<header>x</header>", "https://a.example/"),
            "<base href=\"https://a.example/\"><header>x</header>"
        );

        let based = "<html><HEAD><base href=\"/static/\"></HEAD></html>";
        assert_eq!(with_base_href(based, "https://a.example/"), based);
    }

    #[tokio::test]
    async fn loading_a_frozen_page_adds_its_base() {
        let mut env = BrowserlessEnvironment::new("http://127.0.0.1:9", None);
        env.load(&DocumentRef::Frozen {
            url: "https://shop.example/kettle".to_string(),
            html: "<head></head><h1>Kettle</h1>".to_string(),
        })
        .await
        .unwrap();

        match &env.document {
            DocumentRef::Frozen { url, html } => {
                assert_eq!(url, "https://shop.example/kettle");
                assert!(html.starts_with("<head><base href=\"https://shop.example/kettle\">"));
            }
            other => panic!("expected a frozen document, got {other:?}"),
        }
    }

    #[test]
    fn context_carries_document_program_and_args() {
        let document = DocumentRef::Frozen {
            url: "https://shop.example/kettle".to_string(),
            html: "<h1>Kettle</h1>".to_string(),
        };
        let args = vec![json!(["title"]), json!([1.0, 2.0])];
        let context = serde_json::to_value(FunctionContext {
            document: &document,
            program: "return 1;",
            args: &args,
        })
        .unwrap();

        assert_eq!(context["document"]["kind"], "frozen");
        assert_eq!(context["document"]["html"], "<h1>Kettle</h1>");
        assert_eq!(context["program"], "return 1;");
        assert_eq!(context["args"][1], json!([1.0, 2.0]));
    }

    #[test]
    fn module_handles_every_document_kind() {
        for kind in ["\"url\"", "\"frozen\""] {
            assert!(FUNCTION_MODULE.contains(kind));
        }
        assert!(FUNCTION_MODULE.contains("about:blank"));
        assert!(FUNCTION_MODULE.starts_with("export default"));
    }

    #[tokio::test]
    async fn closed_session_refuses_work() {
        let mut env = BrowserlessEnvironment::new("http://127.0.0.1:9", None);
        env.close().await.unwrap();

        assert!(matches!(
            env.load(&DocumentRef::Blank).await,
            Err(ExecutionError::Fault(_))
        ));
        assert!(matches!(
            env.run("return 1;", &[], Duration::from_secs(1)).await,
            Err(ExecutionError::Fault(_))
        ));
    }
}
