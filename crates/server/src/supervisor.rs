//! Installation and fallback supervision
//!
//! Decides whether claims go through the privileged helper or straight to
//! the device. The decision is published through a watch cell, so claim
//! calls only ever read the current route; they never wait for an install.
//!
//! Installation runs in the background with a fixed wall-clock budget, and
//! its outcome is persisted so a failed install is not retried on every
//! start.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::claim::snapshot::write_atomic;
use crate::config::{HelperSettings, ServerConfig};
use crate::ipc::{IpcClient, IpcClientOptions, IpcError};
use crate::ports::{HelperInstaller, InstallError, InstallOutcome};

/// Where claim operations are sent
#[derive(Clone)]
pub enum Route {
    Fallback,
    Privileged(Arc<IpcClient>),
}

impl Route {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Privileged(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fallback => "fallback",
            Self::Privileged(_) => "privileged",
        }
    }

    /// Both routes use the same helper connection (or both are fallback)
    pub fn same_channel(&self, other: &Route) -> bool {
        match (self, other) {
            (Self::Fallback, Self::Fallback) => true,
            (Self::Privileged(a), Self::Privileged(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Persisted outcome of helper installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum InstallationStatus {
    #[default]
    NotAttempted,
    InProgress,
    Completed,
    Failed {
        reason: String,
        attempts: u32,
    },
    AwaitingApproval,
}

impl InstallationStatus {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAttempted => f.write_str("not-attempted"),
            Self::InProgress => f.write_str("in-progress"),
            Self::Completed => f.write_str("completed"),
            Self::Failed { reason, attempts } => {
                write!(f, "failed ({}, {} attempts)", reason, attempts)
            }
            Self::AwaitingApproval => f.write_str("awaiting-approval"),
        }
    }
}

/// `installation.json`
pub struct InstallationStore {
    path: PathBuf,
}

impl InstallationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Unreadable or missing state counts as never attempted
    pub async fn load(&self) -> InstallationStatus {
        match tokio::fs::read(&self.path).await {
            Ok(content) => serde_json::from_slice(&content).unwrap_or_else(|e| {
                warn!(
                    "Ignoring invalid installation state {}: {}",
                    self.path.display(),
                    e
                );
                InstallationStatus::NotAttempted
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                InstallationStatus::NotAttempted
            }
            Err(e) => {
                warn!(
                    "Failed to read installation state {}: {}",
                    self.path.display(),
                    e
                );
                InstallationStatus::NotAttempted
            }
        }
    }

    pub async fn save(&self, status: &InstallationStatus) -> std::io::Result<()> {
        let content = serde_json::to_vec_pretty(status).map_err(std::io::Error::other)?;
        write_atomic(&self.path, &content).await
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub socket_path: PathBuf,
    pub client: IpcClientOptions,
    pub install_timeout: Duration,
    pub max_install_attempts: u32,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub status_path: PathBuf,
}

impl SupervisorOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            socket_path: config.ipc.socket_path(),
            client: IpcClientOptions::from(&config.ipc),
            install_timeout: config.helper.install_timeout(),
            max_install_attempts: config.helper.max_install_attempts,
            reconnect_interval: config.helper.reconnect_interval(),
            max_reconnect_attempts: config.helper.max_reconnect_attempts,
            status_path: config.state.installation_path(),
        }
    }
}

pub struct Supervisor {
    options: SupervisorOptions,
    installer: Arc<dyn HelperInstaller>,
    store: InstallationStore,
    route_tx: watch::Sender<Route>,
    status_tx: watch::Sender<InstallationStatus>,
    settled_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(options: SupervisorOptions, installer: Arc<dyn HelperInstaller>) -> Arc<Self> {
        let (route_tx, _) = watch::channel(Route::Fallback);
        let (status_tx, _) = watch::channel(InstallationStatus::NotAttempted);
        let (settled_tx, _) = watch::channel(false);
        Arc::new(Self {
            store: InstallationStore::new(&options.status_path),
            options,
            installer,
            route_tx,
            status_tx,
            settled_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn routes(&self) -> watch::Receiver<Route> {
        self.route_tx.subscribe()
    }

    pub fn installation(&self) -> watch::Receiver<InstallationStatus> {
        self.status_tx.subscribe()
    }

    pub fn route(&self) -> Route {
        self.route_tx.borrow().clone()
    }

    pub fn status(&self) -> InstallationStatus {
        self.status_tx.borrow().clone()
    }

    /// Resolves once the initial route is decided
    ///
    /// A reconnect to an already installed helper counts; a fresh install
    /// running in the background does not.
    pub async fn settled(&self) {
        let mut settled = self.settled_tx.subscribe();
        let _ = settled.wait_for(|done| *done).await;
    }

    /// Pick the initial route
    ///
    /// Returns without waiting on the helper. Reconnecting to an installed
    /// helper and installing both run in the background; see [`settled`].
    ///
    /// [`settled`]: Self::settled
    pub async fn start(self: &Arc<Self>) {
        let persisted = self.store.load().await;
        self.status_tx.send_replace(persisted.clone());

        let Some(bundle) = self.installer.bundle_available() else {
            info!("No privileged helper bundle available, using direct device access");
            self.settled_tx.send_replace(true);
            return;
        };

        match persisted {
            InstallationStatus::Completed => {
                self.spawn_reconnect(bundle);
                return;
            }
            InstallationStatus::Failed { attempts, reason }
                if attempts >= self.options.max_install_attempts =>
            {
                info!(
                    "Helper installation failed {} times (last: {}), staying on direct access",
                    attempts, reason
                );
            }
            InstallationStatus::AwaitingApproval => {
                info!("Helper installation was awaiting approval, trying once more");
                self.spawn_install(bundle, 0);
            }
            other => {
                let attempts = other.attempts();
                self.spawn_install(bundle, attempts);
            }
        }
        self.settled_tx.send_replace(true);
    }

    fn spawn_reconnect(self: &Arc<Self>, bundle: PathBuf) {
        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move {
            match supervisor.connect().await {
                Ok(client) => supervisor.adopt(client),
                Err(e) => {
                    warn!("Installed helper is unreachable: {}", e);
                    supervisor
                        .set_status(InstallationStatus::Failed {
                            reason: format!("helper unreachable: {}", e),
                            attempts: 0,
                        })
                        .await;
                    supervisor.spawn_install(bundle, 0);
                }
            }
            supervisor.settled_tx.send_replace(true);
        });
        self.track(task);
    }

    fn spawn_install(self: &Arc<Self>, bundle: PathBuf, previous_attempts: u32) {
        let task = tokio::spawn(self.clone().install(bundle, previous_attempts));
        self.track(task);
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
    }

    async fn install(self: Arc<Self>, bundle: PathBuf, previous_attempts: u32) {
        self.set_status(InstallationStatus::InProgress).await;
        let budget = self.options.install_timeout;
        let attempts = previous_attempts + 1;

        let outcome = match tokio::time::timeout(budget, self.installer.install(&bundle)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(InstallError::TimedOut(budget.as_secs())),
        };

        match outcome {
            Ok(InstallOutcome::Completed) => {
                info!("Privileged helper installed");
                self.set_status(InstallationStatus::Completed).await;
                match self.connect_with_retry().await {
                    Some(client) => self.adopt(client),
                    None => {
                        self.set_status(InstallationStatus::Failed {
                            reason: "helper unreachable after install".to_string(),
                            attempts,
                        })
                        .await;
                    }
                }
            }
            Ok(InstallOutcome::AwaitingApproval) => {
                info!("Privileged helper is awaiting administrator approval");
                self.set_status(InstallationStatus::AwaitingApproval).await;
            }
            Err(e) => {
                warn!(
                    "Helper installation failed (attempt {}): {}; continuing with direct access",
                    attempts, e
                );
                self.set_status(InstallationStatus::Failed {
                    reason: e.to_string(),
                    attempts,
                })
                .await;
            }
        }
    }

    async fn set_status(&self, status: InstallationStatus) {
        debug!("Helper installation status: {}", status);
        if let Err(e) = self.store.save(&status).await {
            warn!("Failed to persist installation status: {}", e);
        }
        self.status_tx.send_replace(status);
    }

    /// Open a channel and make sure the helper accepts us
    async fn connect(&self) -> Result<Arc<IpcClient>, IpcError> {
        let client =
            IpcClient::connect(&self.options.socket_path, self.options.client.clone()).await?;
        match client.health_check().await {
            Ok(uptime) => {
                debug!("Helper healthy, up {}s", uptime);
                Ok(client)
            }
            Err(e) => {
                client.stop().await;
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&self) -> Option<Arc<IpcClient>> {
        for attempt in 1..=self.options.max_reconnect_attempts {
            tokio::time::sleep(self.options.reconnect_interval).await;
            match self.connect().await {
                Ok(client) => return Some(client),
                Err(e) => debug!("Helper connect attempt {} failed: {}", attempt, e),
            }
        }
        None
    }

    /// Route claims through `client` until its connection drops
    fn adopt(self: &Arc<Self>, client: Arc<IpcClient>) {
        info!("Privileged helper connected, claims now go through the helper");
        self.route_tx
            .send_replace(Route::Privileged(Arc::clone(&client)));

        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move {
            client.closed().await;
            let current = matches!(
                &*supervisor.route_tx.borrow(),
                Route::Privileged(c) if Arc::ptr_eq(c, &client)
            );
            if !current {
                return;
            }

            warn!("Lost the privileged helper, falling back to direct access");
            supervisor.route_tx.send_replace(Route::Fallback);
            drop(client);

            match supervisor.connect_with_retry().await {
                Some(client) => supervisor.adopt(client),
                None => {
                    warn!(
                        "Helper did not come back after {} attempts",
                        supervisor.options.max_reconnect_attempts
                    );
                    supervisor
                        .set_status(InstallationStatus::Failed {
                            reason: "helper connection lost".to_string(),
                            attempts: 0,
                        })
                        .await;
                }
            }
        });
        self.track(task);
    }

    /// Stop background work and close the helper channel
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.settled_tx.send_replace(true);
        if let Route::Privileged(client) = self.route_tx.send_replace(Route::Fallback) {
            client.stop().await;
        }
    }
}

/// Runs an external install program with the bundle path as last argument
///
/// Exit status 0 means installed, `approval_exit_code` means installed but
/// waiting for approval, anything else is a failure.
pub struct ProcessInstaller {
    bundle_path: Option<PathBuf>,
    program: String,
    args: Vec<String>,
    approval_exit_code: i32,
}

impl ProcessInstaller {
    pub fn from_settings(settings: &HelperSettings) -> Self {
        Self {
            bundle_path: settings.bundle_path(),
            program: settings.install_program.clone(),
            args: settings.install_args.clone(),
            approval_exit_code: settings.approval_exit_code,
        }
    }
}

#[async_trait]
impl HelperInstaller for ProcessInstaller {
    fn bundle_available(&self) -> Option<PathBuf> {
        self.bundle_path.clone().filter(|path| path.exists())
    }

    async fn install(&self, bundle: &Path) -> Result<InstallOutcome, InstallError> {
        info!(
            "Running {} to install helper bundle {}",
            self.program,
            bundle.display()
        );
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(bundle)
            .kill_on_drop(true)
            .status()
            .await?;

        match status.code() {
            Some(0) => Ok(InstallOutcome::Completed),
            Some(code) if code == self.approval_exit_code => Ok(InstallOutcome::AwaitingApproval),
            Some(code) => Err(InstallError::Failed(format!(
                "installer exited with status {}",
                code
            ))),
            None => Err(InstallError::Failed(
                "installer terminated by a signal".to_string(),
            )),
        }
    }
}
