//! Browser sessions and the page's result log

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};
use crate::poller::ResultSource;
use crate::selenium::{self, SeleniumServerConfig};
use crate::supervisor::ProcessSupervisor;
use crate::webdriver::{ElementRef, Locator, SessionRequest, WebDriverSession};

/// Drives a browser for one run.
#[async_trait]
pub trait BrowserBackend: Send {
    type Page: ResultSource;

    /// Start any automation server the backend needs.
    async fn launch(&mut self, supervisor: &mut ProcessSupervisor) -> RunnerResult<()>;

    /// Open a session, navigate to `url` and locate the result log.
    async fn open(&mut self, url: &str) -> RunnerResult<Self::Page>;

    /// Close the session. Calling it without an open session is a no-op.
    async fn close(&mut self) -> RunnerResult<()>;
}

/// How the page under test exposes its results.
#[derive(Debug, Clone)]
pub struct DomProtocol {
    /// Id of the list element holding the result lines
    pub container_id: String,

    /// Entry `n` has id `<item_id_prefix><n>`
    pub item_id_prefix: String,

    /// Attribute on the container that signals completion
    pub done_attribute: String,

    /// Value of `done_attribute` once the run is complete
    pub done_value: String,

    /// How long to wait for the container after navigation
    pub container_timeout: Duration,
}

impl Default for DomProtocol {
    fn default() -> Self {
        Self {
            container_id: "__tap_list".to_string(),
            item_id_prefix: "__tap_item_".to_string(),
            done_attribute: "data-done".to_string(),
            done_value: "1".to_string(),
            container_timeout: Duration::from_secs(30),
        }
    }
}

impl DomProtocol {
    pub fn item_id(&self, index: usize) -> String {
        format!("{}{}", self.item_id_prefix, index)
    }
}

/// The result list of an open page.
#[derive(Debug, Clone)]
pub struct DomResultLog {
    session: WebDriverSession,
    container: ElementRef,
    protocol: DomProtocol,
}

impl DomResultLog {
    /// Wait for the container element to appear.
    pub async fn locate(session: WebDriverSession, protocol: DomProtocol) -> RunnerResult<Self> {
        let container = session
            .wait_for_element(
                &Locator::Id(protocol.container_id.clone()),
                protocol.container_timeout,
                Duration::from_millis(100),
            )
            .await?;
        debug!("Found result list {}", container.id());
        Ok(Self {
            session,
            container,
            protocol,
        })
    }
}

#[async_trait]
impl ResultSource for DomResultLog {
    async fn is_complete(&mut self) -> RunnerResult<bool> {
        let value = self
            .session
            .attribute(&self.container, &self.protocol.done_attribute)
            .await?;
        Ok(value.as_deref() == Some(self.protocol.done_value.as_str()))
    }

    async fn entry(&mut self, index: usize) -> RunnerResult<Option<String>> {
        let items = self
            .session
            .find_child_elements(&self.container, &Locator::Id(self.protocol.item_id(index)))
            .await?;
        match items.first() {
            Some(item) => Ok(Some(
                self.session
                    .property(item, "textContent")
                    .await?
                    .unwrap_or_default(),
            )),
            None => Ok(None),
        }
    }
}

/// Browser choice and server settings for the Selenium backend.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Browser to launch
    pub browser: String,

    /// Run the browser headless
    pub headless: bool,

    /// Selenium server settings
    pub server: SeleniumServerConfig,

    /// Launch the server; false connects to one already listening on the port
    pub launch_server: bool,

    /// DOM contract of the page under test
    pub protocol: DomProtocol,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            browser: "chrome".to_string(),
            headless: false,
            server: SeleniumServerConfig::default(),
            launch_server: true,
            protocol: DomProtocol::default(),
        }
    }
}

/// Selenium standalone server plus a WebDriver session.
pub struct SeleniumBackend {
    options: RunnerOptions,
    session: Option<WebDriverSession>,
}

impl SeleniumBackend {
    pub fn new(options: RunnerOptions) -> Self {
        Self {
            options,
            session: None,
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }
}

#[async_trait]
impl BrowserBackend for SeleniumBackend {
    type Page = DomResultLog;

    async fn launch(&mut self, supervisor: &mut ProcessSupervisor) -> RunnerResult<()> {
        if self.options.launch_server {
            selenium::start_server(&self.options.server, supervisor).await?;
        } else {
            info!("Using selenium hub at {}", self.options.server.hub_url());
        }
        Ok(())
    }

    async fn open(&mut self, url: &str) -> RunnerResult<DomResultLog> {
        debug!("Using '{}' browser", self.options.browser);
        let request = SessionRequest {
            browser: self.options.browser.clone(),
            headless: self.options.headless,
        };
        let session = WebDriverSession::create(&self.options.server.hub_url(), &request).await?;
        self.session = Some(session.clone());

        info!("Navigating to {}", url);
        session
            .navigate(url)
            .await
            .map_err(|e| {
                RunnerError::AutomationSetup(format!("navigation to {} failed: {}", url, e))
            })?;

        DomResultLog::locate(session, self.options.protocol.clone()).await
    }

    async fn close(&mut self) -> RunnerResult<()> {
        match self.session.take() {
            Some(session) => {
                info!("Shutting WebDriver down...");
                session.quit().await
            }
            None => Ok(()),
        }
    }
}
