//! Headless browser for scenarios that check client-side rendering.
//!
//! Starts `chromedriver` on a free local port and speaks just enough of the
//! WebDriver protocol to open a headless session, navigate, and read the page.

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, Result};
use crate::output::LogBuffer;
use crate::poll::{Poller, Probe};
use crate::process::{BackgroundProcess, CommandRunner, Invocation};

const CHROME_ARGS: [&str; 3] = ["--headless", "--disable-gpu", "--no-sandbox"];

/// A running `chromedriver`. Killed on [`BrowserDriver::stop`] or drop.
pub struct BrowserDriver {
    process: BackgroundProcess,
    port: u16,
    output: LogBuffer,
    client: reqwest::Client,
}

fn free_port() -> Result<u16> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

impl BrowserDriver {
    /// Spawn the driver and wait until it answers `/status`.
    pub async fn start(runner: Arc<dyn CommandRunner>, ready: Poller) -> Result<Self> {
        let port = free_port()?;
        let output = LogBuffer::new();
        let process = runner
            .spawn_streaming(
                &Invocation::new("chromedriver").arg(format!("--port={}", port)),
                output.clone(),
            )
            .await?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let driver = Self {
            process,
            port,
            output,
            client,
        };

        let status_url = format!("{}/status", driver.url());
        let client = driver.client.clone();
        ready
            .until("chromedriver to accept connections", || {
                let client = client.clone();
                let status_url = status_url.clone();
                async move {
                    Ok(match client.get(&status_url).send().await {
                        Ok(r) if r.status().is_success() => Probe::Ready(()),
                        Ok(r) => Probe::Pending(format!("status {}", r.status())),
                        Err(e) => Probe::Pending(e.to_string()),
                    })
                }
            })
            .await
            .map_err(|e| HarnessError::setup(format!("chromedriver did not start: {}", e)))?;
        info!(port, "browser driver started");
        Ok(driver)
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn output(&self) -> &LogBuffer {
        &self.output
    }

    async fn call(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.url(), path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(%method, path, status = status.as_u16(), "webdriver");
        if !status.is_success() {
            return Err(HarnessError::PlatformResponse(format!(
                "webdriver {} {} returned {}: {}",
                method, path, status, text
            )));
        }
        let parsed: Value = serde_json::from_str(&text)?;
        Ok(parsed.get("value").cloned().unwrap_or(Value::Null))
    }

    /// Open a headless Chrome session.
    pub async fn session(&self) -> Result<BrowserSession<'_>> {
        let capabilities = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": CHROME_ARGS }
                }
            }
        });
        let value = self
            .call(reqwest::Method::POST, "/session", Some(capabilities))
            .await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| HarnessError::PlatformResponse(format!("no sessionId in {}", value)))?
            .to_string();
        Ok(BrowserSession { driver: self, id })
    }

    pub async fn stop(mut self) {
        self.process.stop().await;
        debug!(port = self.port, "browser driver stopped");
    }
}

/// One WebDriver session. Close it explicitly; the driver's exit reaps it otherwise.
pub struct BrowserSession<'a> {
    driver: &'a BrowserDriver,
    id: String,
}

impl BrowserSession<'_> {
    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.driver
            .call(
                reqwest::Method::POST,
                &format!("/session/{}/url", self.id),
                Some(json!({ "url": url })),
            )
            .await?;
        Ok(())
    }

    /// Current DOM serialized as HTML.
    pub async fn page_source(&self) -> Result<String> {
        let value = self
            .driver
            .call(reqwest::Method::GET, &format!("/session/{}/source", self.id), None)
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn close(self) {
        if let Err(e) = self
            .driver
            .call(reqwest::Method::DELETE, &format!("/session/{}", self.id), None)
            .await
        {
            warn!(session = %self.id, error = %e, "failed to close browser session");
        }
    }
}
