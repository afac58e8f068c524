//! Production [`Driver`] backed by a Chromium-family browser over CDP.
//!
//! Element handles are ids in a registry kept on the page (`window.__ojk`).
//! Every call re-resolves the current frame chain from the top document, so
//! a frame reloaded by a postback is followed transparently while handles
//! into the old document report stale.

use super::{Driver, ElementHandle};
use crate::config::{BrowserSettings, Strategy};
use crate::error::{ScrapeError, ScrapeResult};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use serde_json::{Value, json};
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHILD_EXIT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
enum Reaped {
    Exited,
    WaitFailed,
    StillRunning,
}

/// Wait at most `limit` for the browser process to exit.
async fn reap<T, E>(wait: impl Future<Output = Result<T, E>>, limit: Duration) -> Reaped
where
    T: std::fmt::Debug,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, wait).await {
        Ok(Ok(status)) => {
            debug!("browser exited: {:?}", status);
            Reaped::Exited
        }
        Ok(Err(e)) => {
            debug!("waiting for browser exit: {}", e);
            Reaped::WaitFailed
        }
        Err(_) => {
            warn!("browser still running {:?} after close", limit);
            Reaped::StillRunning
        }
    }
}

const DESKTOP_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

/// Resolution order: configured path, `CHROME_EXECUTABLE`, PATH, well-known
/// install locations.
pub fn find_chrome_executable(configured: Option<&str>) -> Option<String> {
    if let Some(p) = configured.filter(|p| Path::new(p).exists()) {
        return Some(p.to_string());
    }

    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = ["google-chrome", "chromium", "chromium-browser", "chrome"];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

fn build_config(exe: &str, settings: &BrowserSettings) -> Result<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .window_size(settings.window_width, settings.window_height)
        .user_data_dir(&settings.user_data_dir)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", random_user_agent()));

    if !settings.headless {
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| anyhow!("Browser config error: {}", e))
}

// ── Page-side helpers ─────────────────────────────────────────────────────────

/// Evaluated before every call body. Defines `doc` (current context),
/// `reg` (handle registry), `find(doc, strategy)` and `get(id)`.
const PRELUDE: &str = r#"
const reg = (window.top.__ojk = window.top.__ojk || { seq: 0, nodes: {} });
const find = (d, s) => {
  if (s.by === 'id') { const e = d.getElementById(s.value); return e ? [e] : []; }
  if (s.by === 'css') { return Array.from(d.querySelectorAll(s.value)); }
  const snap = d.evaluate(s.value, d, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
  const out = [];
  for (let i = 0; i < snap.snapshotLength; i++) { out.push(snap.snapshotItem(i)); }
  return out;
};
let doc = document;
for (const f of FRAMES) {
  const host = find(doc, f).find(e => e.contentDocument);
  if (!host) { return { frameLost: true }; }
  doc = host.contentDocument;
}
const get = (id) => {
  const n = reg.nodes[id];
  return n && n.isConnected && n.ownerDocument === doc ? n : null;
};
const visible = (n) => !!(n.offsetWidth || n.offsetHeight || n.getClientRects().length);
"#;

pub struct ChromeDriver {
    browser: tokio::sync::Mutex<Browser>,
    page: Page,
    handler: Mutex<Option<JoinHandle<()>>>,
    /// Frame strategies from the top document to the current context
    frames: Mutex<Vec<Strategy>>,
}

impl ChromeDriver {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
        let exe = find_chrome_executable(settings.executable.as_deref()).ok_or_else(|| {
            anyhow!("No browser found. Install Chrome or Chromium, or set CHROME_EXECUTABLE.")
        })?;
        info!("Launching browser: {}", exe);

        let config = build_config(&exe, settings)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe, e))?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("Failed to create page: {}", e))?;

        Ok(Self {
            browser: tokio::sync::Mutex::new(browser),
            page,
            handler: Mutex::new(Some(handle)),
            frames: Mutex::new(Vec::new()),
        })
    }

    fn frames(&self) -> Vec<Strategy> {
        self.frames
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    /// Run `body` in the current context and return its JSON result.
    async fn eval(&self, body: &str) -> ScrapeResult<Value> {
        let frames = serde_json::to_string(&self.frames())
            .map_err(|e| ScrapeError::Driver(e.to_string()))?;
        let script = format!(
            "(() => {{ const FRAMES = {frames};\n{PRELUDE}\n{body}\n}})()"
        );
        let value = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| ScrapeError::Driver(e.to_string()))?
            .into_value::<Value>()
            .unwrap_or(Value::Null);

        if value.get("frameLost").and_then(Value::as_bool) == Some(true) {
            return Err(ScrapeError::StaleReference("sub-document was replaced".into()));
        }
        Ok(value)
    }

    /// Like [`eval`](Self::eval) for bodies that act on one handle.
    /// The body sees the node as `n`.
    async fn eval_on(&self, el: ElementHandle, body: &str) -> ScrapeResult<Value> {
        let value = self
            .eval(&format!(
                "const n = get({}); if (!n) {{ return {{ stale: true }}; }}\n{body}",
                el.0
            ))
            .await?;
        if value.get("stale").and_then(Value::as_bool) == Some(true) {
            return Err(ScrapeError::StaleReference(format!("handle {}", el.0)));
        }
        Ok(value)
    }

    async fn key(&self, kind: DispatchKeyEventType, text: Option<&str>) -> ScrapeResult<()> {
        let mut builder = DispatchKeyEventParams::builder()
            .r#type(kind)
            .key("Enter")
            .code("Enter")
            .windows_virtual_key_code(13);
        if let Some(t) = text {
            builder = builder.text(t);
        }
        let params = builder.build().map_err(ScrapeError::Driver)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| ScrapeError::Driver(e.to_string()))?;
        Ok(())
    }
}

fn as_bool(v: &Value) -> bool {
    v.as_bool().unwrap_or(false)
}

fn as_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Driver for ChromeDriver {
    async fn navigate(&self, url: &str) -> ScrapeResult<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| ScrapeError::Driver(format!("navigating to {url}: {e}")))?;
        if let Ok(mut f) = self.frames.lock() {
            f.clear();
        }
        Ok(())
    }

    async fn find_all(&self, strategy: &Strategy) -> ScrapeResult<Vec<ElementHandle>> {
        let s = serde_json::to_string(strategy).map_err(|e| ScrapeError::Driver(e.to_string()))?;
        let ids = self
            .eval(&format!(
                "return find(doc, {s}).map(n => {{
                   if (n.__ojkId === undefined || reg.nodes[n.__ojkId] !== n) {{
                     n.__ojkId = ++reg.seq; reg.nodes[n.__ojkId] = n;
                   }}
                   return n.__ojkId;
                 }});"
            ))
            .await?;
        Ok(ids
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_u64).map(ElementHandle).collect())
            .unwrap_or_default())
    }

    async fn is_stale(&self, el: ElementHandle) -> ScrapeResult<bool> {
        match self.eval(&format!("return get({}) === null;", el.0)).await {
            Ok(v) => Ok(as_bool(&v)),
            Err(ScrapeError::StaleReference(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn is_displayed(&self, el: ElementHandle) -> ScrapeResult<bool> {
        self.eval_on(el, "return visible(n);").await.map(|v| as_bool(&v))
    }

    async fn is_enabled(&self, el: ElementHandle) -> ScrapeResult<bool> {
        self.eval_on(
            el,
            "const c = (n.className || '').toString();
             return !n.disabled && !c.includes('disabled') && n.getAttribute('aria-disabled') !== 'true';",
        )
        .await
        .map(|v| as_bool(&v))
    }

    async fn is_checked(&self, el: ElementHandle) -> ScrapeResult<bool> {
        self.eval_on(
            el,
            "if (typeof n.checked === 'boolean') { return n.checked; }
             const c = (n.className || '').toString();
             return n.getAttribute('aria-checked') === 'true' || c.includes('checked');",
        )
        .await
        .map(|v| as_bool(&v))
    }

    async fn click(&self, el: ElementHandle) -> ScrapeResult<()> {
        // Widget triggers listen on mousedown, plain links on click.
        self.eval_on(
            el,
            "n.scrollIntoView({ block: 'center' });
             for (const t of ['mouseover', 'mousedown', 'mouseup']) {
               n.dispatchEvent(new MouseEvent(t, { bubbles: true, cancelable: true, view: n.ownerDocument.defaultView }));
             }
             n.click();
             return true;",
        )
        .await
        .map(|_| ())
    }

    async fn type_text(&self, el: ElementHandle, text: &str, commit: bool) -> ScrapeResult<()> {
        self.eval_on(el, "n.focus(); if ('value' in n) { n.value = ''; } return true;")
            .await?;
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .map_err(|e| ScrapeError::Driver(e.to_string()))?;
        self.eval_on(
            el,
            "n.dispatchEvent(new Event('input', { bubbles: true }));
             n.dispatchEvent(new Event('change', { bubbles: true }));
             return true;",
        )
        .await?;
        if commit {
            self.key(DispatchKeyEventType::KeyDown, Some("\r")).await?;
            self.key(DispatchKeyEventType::KeyUp, None).await?;
        }
        Ok(())
    }

    async fn text(&self, el: ElementHandle) -> ScrapeResult<String> {
        self.eval_on(el, "return (n.innerText || n.textContent || n.value || '').trim();")
            .await
            .map(as_string)
    }

    async fn inner_html(&self, el: ElementHandle) -> ScrapeResult<String> {
        self.eval_on(el, "return n.innerHTML;").await.map(as_string)
    }

    async fn options(&self, el: ElementHandle) -> ScrapeResult<Vec<String>> {
        let v = self
            .eval_on(el, "return Array.from(n.options || []).map(o => o.text.trim());")
            .await?;
        Ok(v.as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default())
    }

    async fn select_option(&self, el: ElementHandle, text: &str) -> ScrapeResult<bool> {
        let wanted = json!(text.trim());
        self.eval_on(
            el,
            &format!(
                "const o = Array.from(n.options || []).find(o => o.text.trim() === {wanted});
                 if (!o) {{ return false; }}
                 n.value = o.value;
                 n.dispatchEvent(new Event('change', {{ bubbles: true }}));
                 return true;"
            ),
        )
        .await
        .map(|v| as_bool(&v))
    }

    async fn enter_frame(&self, frame: &Strategy) -> ScrapeResult<bool> {
        let s = serde_json::to_string(frame).map_err(|e| ScrapeError::Driver(e.to_string()))?;
        let ready = self
            .eval(&format!(
                "const host = find(doc, {s}).find(e => e.contentDocument);
                 return !!host && host.contentDocument.readyState !== 'loading';"
            ))
            .await?;
        if as_bool(&ready) {
            if let Ok(mut f) = self.frames.lock() {
                f.push(frame.clone());
            }
        }
        Ok(as_bool(&ready))
    }

    async fn exit_frame(&self) -> ScrapeResult<()> {
        if let Ok(mut f) = self.frames.lock() {
            f.pop();
        }
        Ok(())
    }

    async fn close(&self) -> ScrapeResult<()> {
        let mut browser = self.browser.lock().await;
        let result = browser.close().await;
        // Reap the child so it does not linger as a zombie until the next sweep.
        reap(browser.wait(), CHILD_EXIT_WAIT).await;
        drop(browser);
        if let Some(handle) = self.handler.lock().ok().and_then(|mut h| h.take()) {
            handle.abort();
        }
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Browser close error (non-fatal): {}", e);
                Err(ScrapeError::Driver(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reap_is_bounded() {
        let exited = reap(async { Ok::<_, std::io::Error>(Some(0)) }, Duration::from_millis(50)).await;
        assert_eq!(exited, Reaped::Exited);

        let failed = reap(
            async { Err::<(), _>(std::io::Error::other("no child")) },
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(failed, Reaped::WaitFailed);

        let hung = reap(std::future::pending::<Result<(), std::io::Error>>(), Duration::from_millis(10)).await;
        assert_eq!(hung, Reaped::StillRunning);
    }
}
