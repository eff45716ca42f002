//! Process supervisor
//!
//! Starts the anonymizing client, the forwarding proxy and the application,
//! then waits for task failures or a shutdown signal. Only startup failures
//! end the session; a task failing later is logged and waiting continues.

pub mod browser;
pub mod process;
pub mod task;
pub mod tor;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::models::Endpoint;
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::{
    BindOutcome, ConnectionPolicy, ForbiddenList, LoggingHooks, PolicyHooks, ProxyServer,
    SocksDialer, SplitDialer,
};

pub use browser::{application_arguments, BrowserProvisioner, SystemBrowser};
pub use task::{stop_requested, StopHandle, SupervisedTask, TaskFailure, TaskKind};
pub use tor::{AnonClientConfig, AnonClientHandle, AnonymizingClient, TorProcess};

const SOCKS_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle of a supervised session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Shutdown was requested; `task_failures` counts failures seen while running
    Signalled { task_failures: usize },
}

/// Supervises the anonymizing client, the forwarding proxy and the application
pub struct Supervisor {
    config: Config,
    anon_client: Arc<dyn AnonymizingClient>,
    browser: Arc<dyn BrowserProvisioner>,
    hooks: Arc<dyn PolicyHooks>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        anon_client: Arc<dyn AnonymizingClient>,
        browser: Arc<dyn BrowserProvisioner>,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            config,
            anon_client,
            browser,
            hooks: Arc::new(LoggingHooks),
            state,
        }
    }

    /// Replace the default logging hooks
    pub fn with_hooks(mut self, hooks: Arc<dyn PolicyHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Subscribe to state changes
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        info!(state = ?state, "Supervisor state changed");
        self.state.send_replace(state);
    }

    /// Run the session until `shutdown` resolves
    ///
    /// Returns an error only for fatal startup failures, after stopping the
    /// tasks started so far.
    pub async fn run<S>(self, shutdown: S) -> Result<SupervisorExit>
    where
        S: Future<Output = ()>,
    {
        self.set_state(SupervisorState::Starting);

        let mut tasks = Vec::new();
        if let Err(e) = self.start_tasks(&mut tasks).await {
            error!("Startup failed: {}", e);
            self.stop_all(tasks).await;
            self.set_state(SupervisorState::Stopped);
            return Err(e);
        }

        self.set_state(SupervisorState::Running);

        let mut failures = FuturesUnordered::new();
        for task in tasks.iter_mut() {
            let kind = task.kind();
            if let Some(rx) = task.take_failures() {
                failures.push(async move { (kind, rx.await) });
            }
        }

        tokio::pin!(shutdown);
        let mut task_failures = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some((kind, outcome)) = failures.next(), if !failures.is_empty() => {
                    match outcome {
                        Ok(failure) => {
                            task_failures += 1;
                            error!(task = %kind, "{}", failure);
                        }
                        Err(_) => info!(task = %kind, "Task exited"),
                    }
                    if failures.is_empty() {
                        info!("All tasks have ended, waiting for shutdown");
                    }
                }
            }
        }

        self.set_state(SupervisorState::Draining);
        self.stop_all(tasks).await;
        self.set_state(SupervisorState::Stopped);

        Ok(SupervisorExit::Signalled { task_failures })
    }

    async fn start_tasks(&self, tasks: &mut Vec<SupervisedTask>) -> Result<()> {
        let anon_config = AnonClientConfig::from(&self.config.tor);
        let anon = self.anon_client.start(&anon_config).await?;
        info!(endpoint = %anon.endpoint, "Anonymizing client ready");
        tasks.extend(anon.task);

        let mut endpoint = anon.endpoint;
        if self.config.proxy.enabled() {
            endpoint = self.start_proxy(anon.endpoint, tasks).await?;
        }

        self.start_application(&endpoint, tasks).await
    }

    async fn start_proxy(
        &self,
        socks: Endpoint,
        tasks: &mut Vec<SupervisedTask>,
    ) -> Result<Endpoint> {
        let proxy_config = self.config.proxy.clone();

        let forbidden = match &proxy_config.forbidden_list {
            Some(path) => ForbiddenList::load(path).await?,
            None => ForbiddenList::default(),
        };
        let auth = ProxyAuth::from_config(
            proxy_config.auth_username.as_deref(),
            proxy_config.auth_password.as_deref(),
        );
        let policy = ConnectionPolicy::new(Arc::new(forbidden), self.hooks.clone()).with_auth(auth);

        let socks_dialer = SocksDialer::new(socks.addr)
            .with_retries(proxy_config.socks_retries, SOCKS_RETRY_DELAY);
        let dialer = SplitDialer::over_socks(socks_dialer, proxy_config.split_networks);
        if proxy_config.split_networks {
            info!("Split mode: only hidden services go through Tor");
        }

        let server = ProxyServer::new(proxy_config, Arc::new(dialer), policy);
        match server.bind().await? {
            BindOutcome::Bound(bound) => {
                let endpoint = bound.endpoint();
                tasks.push(SupervisedTask::spawn(TaskKind::ForwardProxy, move |stop| {
                    bound.run(stop)
                }));
                Ok(endpoint)
            }
            BindOutcome::AlreadyRunning(endpoint) => {
                warn!(endpoint = %endpoint, "Reusing forwarding proxy already running");
                Ok(endpoint)
            }
        }
    }

    async fn start_application(
        &self,
        endpoint: &Endpoint,
        tasks: &mut Vec<SupervisedTask>,
    ) -> Result<()> {
        let browser = &self.config.browser;

        self.browser.ensure_installed(endpoint).await?;
        let executable = self.browser.resolve_executable()?;
        let mut args = self.browser.launch_arguments()?;
        args.extend(application_arguments(endpoint, browser.incognito));

        info!(
            executable = %executable.display(),
            proxy = %endpoint.proxy_url(),
            "Launching application"
        );
        let child = process::spawn_child(&executable, &args, browser.verbose)?;
        tasks.push(SupervisedTask::spawn(TaskKind::Application, move |stop| {
            process::supervise_child(child, "application", stop)
        }));
        Ok(())
    }

    /// Stop tasks in reverse start order
    async fn stop_all(&self, tasks: Vec<SupervisedTask>) {
        // Room for the proxy's own connection drain
        let wait = self.config.proxy.shutdown_grace() + Duration::from_secs(1);
        for task in tasks.into_iter().rev() {
            task.stop(wait).await;
        }
    }
}
