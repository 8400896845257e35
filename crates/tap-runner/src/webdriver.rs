//! Minimal W3C WebDriver client
//!
//! Only the commands the runner needs: create/delete session, navigate,
//! element lookup and reading attributes/properties. Speaks to a Selenium
//! hub, so both W3C and legacy JSON wire responses are accepted.

use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};

/// Key under which W3C drivers return element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a0e9f6b6b6b";

/// Key used by legacy JSON wire drivers.
const LEGACY_ELEMENT_KEY: &str = "ELEMENT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(String);

impl ElementRef {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// How to find an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Id(String),
}

impl Locator {
    fn to_json(&self) -> Value {
        match self {
            // W3C has no id strategy
            Locator::Id(id) => json!({
                "using": "css selector",
                "value": format!("[id=\"{}\"]", id.replace('"', "\\\"")),
            }),
        }
    }
}

/// Capabilities for a new session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub browser: String,
    pub headless: bool,
}

impl SessionRequest {
    pub fn to_json(&self) -> Value {
        let mut caps = json!({ "browserName": self.browser });
        match self.browser.as_str() {
            "chrome" => {
                let args: Vec<&str> = if self.headless {
                    vec!["--headless", "--disable-gpu"]
                } else {
                    vec![]
                };
                caps["goog:chromeOptions"] = json!({ "args": args });
            }
            "firefox" if self.headless => {
                caps["moz:firefoxOptions"] = json!({ "args": ["-headless"] });
            }
            _ => {}
        }
        json!({
            "capabilities": { "alwaysMatch": caps.clone() },
            "desiredCapabilities": caps,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    value: Value,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
    #[serde(default)]
    status: Option<i64>,
}

/// An open browser session.
#[derive(Debug, Clone)]
pub struct WebDriverSession {
    http: reqwest::Client,
    endpoint: String,
    session_id: String,
}

impl WebDriverSession {
    /// Open a session against `endpoint` (e.g. `http://localhost:4444/wd/hub`).
    pub async fn create(endpoint: &str, request: &SessionRequest) -> RunnerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let endpoint = endpoint.trim_end_matches('/').to_string();

        info!("Opening {} session at {}", request.browser, endpoint);
        let url = format!("{}/session", endpoint);
        let response = send(&http, Method::POST, &url, Some(request.to_json()))
            .await
            .map_err(|e| RunnerError::AutomationSetup(format!("session creation failed: {}", e)))?;

        let session_id = response
            .session_id
            .clone()
            .or_else(|| {
                response
                    .value
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .ok_or_else(|| {
                RunnerError::AutomationSetup(format!(
                    "new session response has no session id: {}",
                    response.value
                ))
            })?;
        debug!("Session id: {}", session_id);

        Ok(Self {
            http,
            endpoint,
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn navigate(&self, url: &str) -> RunnerResult<()> {
        debug!("Navigating to {}", url);
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    /// Find one element; `None` when nothing matches.
    pub async fn find_element(&self, locator: &Locator) -> RunnerResult<Option<ElementRef>> {
        match self
            .command(Method::POST, "element", Some(locator.to_json()))
            .await
        {
            Ok(value) => Ok(Some(parse_element(&value)?)),
            Err(RunnerError::WebDriver { error, .. }) if error == "no such element" => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Find all descendants of `parent` matching `locator`.
    pub async fn find_child_elements(
        &self,
        parent: &ElementRef,
        locator: &Locator,
    ) -> RunnerResult<Vec<ElementRef>> {
        let value = self
            .command(
                Method::POST,
                &format!("element/{}/elements", parent.id()),
                Some(locator.to_json()),
            )
            .await?;
        parse_elements(&value)
    }

    pub async fn attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> RunnerResult<Option<String>> {
        let value = self
            .command(
                Method::GET,
                &format!("element/{}/attribute/{}", element.id(), name),
                None,
            )
            .await?;
        Ok(value_as_string(value))
    }

    pub async fn property(&self, element: &ElementRef, name: &str) -> RunnerResult<Option<String>> {
        let value = self
            .command(
                Method::GET,
                &format!("element/{}/property/{}", element.id(), name),
                None,
            )
            .await?;
        Ok(value_as_string(value))
    }

    /// Poll for an element until it appears or `timeout` elapses.
    pub async fn wait_for_element(
        &self,
        locator: &Locator,
        timeout: Duration,
        interval: Duration,
    ) -> RunnerResult<ElementRef> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = self.find_element(locator).await? {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(RunnerError::AutomationSetup(format!(
                    "element {:?} did not appear within {:?}",
                    locator, timeout
                )));
            }
            sleep(interval).await;
        }
    }

    /// Delete the session, closing the browser.
    pub async fn quit(&self) -> RunnerResult<()> {
        info!("Closing session {}", self.session_id);
        send(
            &self.http,
            Method::DELETE,
            &format!("{}/session/{}", self.endpoint, self.session_id),
            None,
        )
        .await?;
        Ok(())
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> RunnerResult<Value> {
        let url = format!("{}/session/{}/{}", self.endpoint, self.session_id, path);
        Ok(send(&self.http, method, &url, body).await?.value)
    }
}

async fn send(
    http: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> RunnerResult<WireResponse> {
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await?;
    let http_status = response.status();
    let text = response.text().await?;

    let wire: WireResponse = serde_json::from_str(&text).map_err(|_| RunnerError::WebDriver {
        error: "unknown error".to_string(),
        message: format!("HTTP {}: {}", http_status, text),
    })?;
    check_response(wire)
}

/// Turn an error envelope (W3C `value.error` or legacy non-zero `status`)
/// into a [`RunnerError::WebDriver`].
fn check_response(wire: WireResponse) -> RunnerResult<WireResponse> {
    if let Some(error) = wire.value.get("error").and_then(Value::as_str) {
        let message = wire
            .value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(RunnerError::WebDriver {
            error: error.to_string(),
            message: message.to_string(),
        });
    }
    match wire.status {
        Some(0) | None => Ok(wire),
        Some(code) => Err(RunnerError::WebDriver {
            error: legacy_error_name(code).to_string(),
            message: wire
                .value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
    }
}

fn legacy_error_name(code: i64) -> &'static str {
    match code {
        6 => "invalid session id",
        7 => "no such element",
        10 => "stale element reference",
        21 => "timeout",
        33 => "session not created",
        _ => "unknown error",
    }
}

fn parse_element(value: &Value) -> RunnerResult<ElementRef> {
    value
        .get(ELEMENT_KEY)
        .or_else(|| value.get(LEGACY_ELEMENT_KEY))
        .and_then(Value::as_str)
        .map(|id| ElementRef(id.to_string()))
        .ok_or_else(|| RunnerError::WebDriver {
            error: "unknown error".to_string(),
            message: format!("not an element reference: {}", value),
        })
}

fn parse_elements(value: &Value) -> RunnerResult<Vec<ElementRef>> {
    match value {
        Value::Array(items) => items.iter().map(parse_element).collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(RunnerError::WebDriver {
            error: "unknown error".to_string(),
            message: format!("expected an element list: {}", other),
        }),
    }
}

fn value_as_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(text: &str) -> WireResponse {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn parses_w3c_and_legacy_elements() {
        let w3c = json!({ ELEMENT_KEY: "abc" });
        let legacy = json!({ "ELEMENT": "0.123-1" });
        assert_eq!(parse_element(&w3c).unwrap().id(), "abc");
        assert_eq!(parse_element(&legacy).unwrap().id(), "0.123-1");
    }

    #[test]
    fn empty_element_list() {
        assert!(parse_elements(&json!([])).unwrap().is_empty());
        assert!(parse_elements(&Value::Null).unwrap().is_empty());
        assert_eq!(
            parse_elements(&json!([{ ELEMENT_KEY: "a" }, { ELEMENT_KEY: "b" }]))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn w3c_error_is_surfaced() {
        let err = check_response(wire(
            r#"{"value":{"error":"stale element reference","message":"gone","stacktrace":""}}"#,
        ))
        .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn legacy_status_is_surfaced() {
        let err = check_response(wire(r#"{"status":7,"value":{"message":"no el"}}"#)).unwrap_err();
        match err {
            RunnerError::WebDriver { error, message } => {
                assert_eq!(error, "no such element");
                assert_eq!(message, "no el");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn success_passes_through() {
        let ok = check_response(wire(r#"{"sessionId":"s1","status":0,"value":"done"}"#)).unwrap();
        assert_eq!(ok.session_id.as_deref(), Some("s1"));
        assert_eq!(value_as_string(ok.value).as_deref(), Some("done"));
    }

    #[test]
    fn headless_chrome_capabilities() {
        let caps = SessionRequest {
            browser: "chrome".into(),
            headless: true,
        }
        .to_json();
        assert_eq!(caps["capabilities"]["alwaysMatch"]["browserName"], "chrome");
        assert_eq!(
            caps["desiredCapabilities"]["goog:chromeOptions"]["args"][0],
            "--headless"
        );
    }

    #[test]
    fn id_locator_becomes_attribute_selector() {
        let locator = Locator::Id("__tap_list".into()).to_json();
        assert_eq!(locator["using"], "css selector");
        assert_eq!(locator["value"], "[id=\"__tap_list\"]");
    }
}
