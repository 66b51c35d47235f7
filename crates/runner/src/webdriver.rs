//! `Page` over the W3C WebDriver HTTP protocol (chromedriver, geckodriver).

use crate::page::{Page, PageError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub webdriver_url: String,
    pub headless: bool,
    pub user_agent: Option<String>,
    pub window: (u32, u32),
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            webdriver_url: "http://127.0.0.1:9515".to_string(),
            headless: true,
            user_agent: None,
            window: (1366, 768),
        }
    }
}

#[derive(Debug)]
pub struct WebDriverPage {
    http: Client,
    base_url: String,
    session_id: String,
    closed: AtomicBool,
}

impl WebDriverPage {
    /// Opens a new browser session on the driver at `opts.webdriver_url`.
    pub async fn start(opts: &BrowserOptions) -> Result<Self, PageError> {
        let http = Client::builder().timeout(Duration::from_secs(90)).build()?;
        let mut base_url = opts.webdriver_url.clone();
        if base_url.ends_with('/') {
            base_url.pop();
        }

        let user_agent = opts.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        let (w, h) = opts.window;
        let mut chrome_args = vec![
            format!("--window-size={w},{h}"),
            format!("--user-agent={user_agent}"),
            "--disable-blink-features=AutomationControlled".to_string(),
        ];
        let mut firefox_args = vec![];
        if opts.headless {
            chrome_args.push("--headless=new".to_string());
            firefox_args.push("-headless".to_string());
        }
        let caps = json!({
            "capabilities": {
                "alwaysMatch": {
                    "pageLoadStrategy": "eager",
                    "goog:chromeOptions": { "args": chrome_args },
                    "moz:firefoxOptions": {
                        "args": firefox_args,
                        "prefs": { "general.useragent.override": user_agent }
                    }
                }
            }
        });

        let resp = http
            .post(format!("{base_url}/session"))
            .json(&caps)
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(driver_error(status.as_u16(), &value));
        }
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| PageError::Protocol(format!("no sessionId in {value}")))?
            .to_string();

        tracing::info!(session = %session_id, headless = opts.headless, "webdriver session started");
        Ok(Self {
            http,
            base_url,
            session_id,
            closed: AtomicBool::new(false),
        })
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, PageError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PageError::Closed);
        }
        let url = format!("{}/session/{}{}", self.base_url, self.session_id, path);
        let mut req = self.http.request(method.clone(), url.as_str());
        if method == Method::POST {
            req = req.json(&body.unwrap_or_else(|| json!({})));
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(value);
        }
        let err = driver_error(status.as_u16(), &value);
        if err.is_session_closed() {
            self.closed.store(true, Ordering::Relaxed);
        }
        Err(err)
    }

    pub async fn cookies(&self) -> Result<Vec<Value>, PageError> {
        match self.command(Method::GET, "/cookie", None).await? {
            Value::Array(items) => Ok(items),
            other => Err(PageError::Protocol(format!("cookie list: {other}"))),
        }
    }

    pub async fn add_cookie(&self, cookie: Value) -> Result<(), PageError> {
        self.command(Method::POST, "/cookie", Some(json!({ "cookie": cookie })))
            .await?;
        Ok(())
    }

    /// Writes the session cookies as JSON.
    pub async fn save_session(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let cookies = self.cookies().await?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create session dir: {}", dir.display()))?;
        }
        let blob = serde_json::to_string_pretty(&cookies)?;
        std::fs::write(path, blob)
            .with_context(|| format!("write session: {}", path.display()))?;
        tracing::info!(path = %path.display(), cookies = cookies.len(), "session saved");
        Ok(())
    }

    /// Re-installs saved cookies. A missing or unreadable file is not an error.
    pub async fn restore_session(&self, path: &Path, game_url: &str) -> Result<bool, PageError> {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Ok(false);
        };
        let cookies: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt session file");
                return Ok(false);
            }
        };

        // Cookies can only be set for the document's own domain.
        self.navigate(game_url).await?;
        let mut restored = 0usize;
        for cookie in cookies {
            match self.add_cookie(cookie).await {
                Ok(()) => restored += 1,
                Err(e) if e.is_session_closed() => return Err(e),
                Err(e) => tracing::debug!(error = %e, "cookie rejected"),
            }
        }
        tracing::info!(restored, "session cookies restored");
        Ok(restored > 0)
    }

    pub async fn close(&self) -> Result<(), PageError> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let url = format!("{}/session/{}", self.base_url, self.session_id);
        self.http.delete(url).send().await?;
        tracing::info!(session = %self.session_id, "webdriver session closed");
        Ok(())
    }
}

fn driver_error(status: u16, value: &Value) -> PageError {
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if error == "javascript error" {
        return PageError::Script(message);
    }
    PageError::WebDriver {
        status,
        error,
        message,
    }
}

#[async_trait]
impl Page for WebDriverPage {
    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, PageError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn wait_for_timeout(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    async fn screenshot(&self, path: &Path) -> Result<(), PageError> {
        let value = self.command(Method::GET, "/screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| PageError::Protocol("screenshot is not a string".into()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| PageError::Protocol(format!("screenshot base64: {e}")))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_map_to_variants() {
        let v = json!({ "error": "javascript error", "message": "x is not defined" });
        assert!(matches!(driver_error(500, &v), PageError::Script(m) if m == "x is not defined"));

        let v = json!({ "error": "invalid session id", "message": "" });
        let err = driver_error(404, &v);
        assert!(err.is_session_closed());

        let v = json!({ "error": "no such element", "message": "gone" });
        assert!(!driver_error(404, &v).is_session_closed());
    }
}
