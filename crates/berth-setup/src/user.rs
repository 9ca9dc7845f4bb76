//! User setup: a host account whose logins are routed into a container.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use berth_common::config::{UserAuth, UserSpec};
use berth_common::constants::{RUNTIME_GROUP, USER_DESCRIPTOR_FILE, USER_SETUP_LOG_FILE};
use berth_common::error::{BerthError, JobResult, Result, SharedError};
use berth_common::types::ContainerId;

use crate::host::{HostAccount, HostAccounts};
use crate::job::{Completion, Observer, SetupJob};
use crate::password::random_password;
use crate::waiter::ContainerWaiter;

/// Serializes in-container account creation across all user jobs.
static CONTAINER_USER_LOCK: LazyLock<tokio::sync::Mutex<()>> =
    LazyLock::new(|| tokio::sync::Mutex::new(()));

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BerthError + '_ {
    move |e| BerthError::io(path, e)
}

fn create_owned(path: &Path, mode: u32, accounts: &dyn HostAccounts, account: &HostAccount) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(io_err(path))?;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(io_err(path))?;
    accounts.chown(path, account)?;
    Ok(file)
}

/// The host half of a user job: account, credentials, and home files.
///
/// Every method blocks on the filesystem or on account tools, so the job
/// runs them on the blocking pool.
struct HostUser {
    name: String,
    spec: UserSpec,
    create: bool,
    accounts: Arc<dyn HostAccounts>,
}

impl HostUser {
    fn ensure_account(&self, shell: &Path) -> Result<HostAccount> {
        if let Some(account) = self.accounts.lookup(&self.name)? {
            tracing::debug!(user = %self.name, shell = %shell.display(), "setting login shell");
            self.accounts.set_shell(&self.name, shell)?;
            return Ok(account);
        }
        if !self.create {
            return Err(BerthError::NotFound {
                kind: "user (creation disabled)",
                id: self.name.clone(),
            });
        }
        tracing::info!(user = %self.name, "creating user");
        self.accounts.create(&self.name, shell, RUNTIME_GROUP)?;
        self.accounts
            .lookup(&self.name)?
            .ok_or_else(|| BerthError::NotFound {
                kind: "user",
                id: self.name.clone(),
            })
    }

    fn apply_credentials(&self, auth: &UserAuth) -> Result<()> {
        if auth.locked {
            tracing::debug!(user = %self.name, "locking user");
            return self.accounts.lock(&self.name);
        }
        let password = if auth.password.is_empty() && !auth.allow_empty_password {
            tracing::debug!(user = %self.name, "setting random password");
            random_password()
        } else {
            auth.password.clone()
        };
        if password.is_empty() {
            if let Err(e) = self.accounts.delete_password(&self.name) {
                tracing::warn!(user = %self.name, error = %e, "cannot clear password");
            }
            return Ok(());
        }
        self.accounts.set_password(&self.name, &password)
    }

    fn write_authorized_keys(&self, account: &HostAccount, auth: &UserAuth) -> Result<()> {
        if !account.home.exists() {
            std::fs::create_dir_all(&account.home).map_err(io_err(&account.home))?;
            std::fs::set_permissions(&account.home, std::fs::Permissions::from_mode(0o755))
                .map_err(io_err(&account.home))?;
            self.accounts.chown(&account.home, account)?;
        }
        let ssh_dir = account.home.join(".ssh");
        std::fs::create_dir_all(&ssh_dir).map_err(io_err(&ssh_dir))?;
        std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))
            .map_err(io_err(&ssh_dir))?;
        self.accounts.chown(&ssh_dir, account)?;

        let path = ssh_dir.join("authorized_keys");
        let mut keys = String::new();
        if auth.copy_root_keys {
            let root_keys = self.accounts.root_authorized_keys();
            keys.push_str(&std::fs::read_to_string(&root_keys).map_err(io_err(&root_keys))?);
            keys.push('\n');
        }
        for key in &auth.ssh_keys {
            keys.push_str(key);
            keys.push('\n');
        }
        let mut file = create_owned(&path, 0o600, self.accounts.as_ref(), account)?;
        file.write_all(keys.as_bytes()).map_err(io_err(&path))?;
        file.sync_all().map_err(io_err(&path))
    }

    /// Prepares the account and opens its setup log.
    fn prepare(&self) -> Result<(HostAccount, File)> {
        self.accounts.ensure_root()?;
        let shell = self.accounts.login_shell()?;
        let account = self.ensure_account(&shell)?;
        let auth = self.spec.auth.clone().unwrap_or_default();
        self.apply_credentials(&auth)?;
        tracing::debug!(user = %self.name, "writing authorized keys");
        self.write_authorized_keys(&account, &auth)?;
        let log_path = account.home.join(USER_SETUP_LOG_FILE);
        let log = create_owned(&log_path, 0o644, self.accounts.as_ref(), &account)?;
        Ok((account, log))
    }

    fn write_descriptor(&self, account: &HostAccount, id: &ContainerId) -> Result<()> {
        let path: PathBuf = account.home.join(USER_DESCRIPTOR_FILE);
        tracing::debug!(user = %self.name, path = %path.display(), "writing shell descriptor");
        let yaml = self.spec.descriptor(id.as_str()).to_yaml()?;
        let mut file = create_owned(&path, 0o640, self.accounts.as_ref(), account)?;
        file.write_all(yaml.as_bytes()).map_err(io_err(&path))
    }
}

async fn blocking<T: Send + 'static>(
    name: &str,
    work: impl FnOnce() -> Result<T> + Send + 'static,
) -> JobResult<T> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Arc::new(BerthError::runtime(format!("user {name}: task failed: {e}"))))?
        .map_err(Arc::new)
}

/// Provisions one host user.
pub struct UserSetup {
    host: Arc<HostUser>,
    containers: Arc<dyn ContainerWaiter>,
    done: Completion<()>,
}

impl std::fmt::Debug for UserSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSetup")
            .field("name", &self.host.name)
            .field("container", &self.host.spec.container)
            .field("create", &self.host.create)
            .finish_non_exhaustive()
    }
}

impl UserSetup {
    /// Creates the job for user `name`. Missing accounts are created only
    /// when `create` is set.
    pub fn new(
        name: impl Into<String>,
        spec: UserSpec,
        create: bool,
        containers: Arc<dyn ContainerWaiter>,
        accounts: Arc<dyn HostAccounts>,
    ) -> Self {
        Self {
            host: Arc::new(HostUser {
                name: name.into(),
                spec,
                create,
                accounts,
            }),
            containers,
            done: Completion::new(),
        }
    }

    async fn ensure_container_user(&self, id: &ContainerId, user: &str) {
        let name = &self.host.name;
        let _serial = CONTAINER_USER_LOCK.lock().await;
        let probe = vec!["id".to_string(), user.to_string()];
        let output = match self.containers.exec_cmd_container(id, Some("root"), &probe).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(user = %name, container_user = user, error = %e, "cannot check container user");
                return;
            }
        };
        if !output.stderr.trim().ends_with("no such user") {
            return;
        }
        tracing::info!(user = %name, container_user = user, container = %id, "creating container user");
        let add = vec!["useradd".to_string(), user.to_string()];
        match self.containers.exec_cmd_container(id, Some("root"), &add).await {
            Ok(output) if !output.success() => {
                tracing::warn!(container_user = user, stderr = %output.stderr.trim(), "useradd failed");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(container_user = user, error = %e, "cannot create container user"),
        }
    }

    async fn converge(&self) -> JobResult<()> {
        let spec = &self.host.spec;
        if !self.containers.check_has_container(&spec.container) {
            return Err(Arc::new(BerthError::config(format!(
                "user {} references unknown container {:?}",
                self.host.name, spec.container
            ))));
        }
        let host = Arc::clone(&self.host);
        let (account, log) = blocking(&self.host.name, move || host.prepare()).await?;

        let observer: Observer = Box::new(log);
        let id = self
            .containers
            .wait_for_container(&spec.container, Some(observer))
            .await?;

        if spec.create_container_user {
            if let Some(user) = spec.container_user.as_deref() {
                self.ensure_container_user(&id, user).await;
            }
        }

        let host = Arc::clone(&self.host);
        blocking(&self.host.name, move || host.write_descriptor(&account, &id)).await
    }
}

#[async_trait]
impl SetupJob for UserSetup {
    fn kind(&self) -> &'static str {
        "user"
    }

    fn name(&self) -> &str {
        &self.host.name
    }

    async fn execute(&self) -> JobResult<()> {
        let outcome = self.converge().await;
        if outcome.is_ok() {
            tracing::info!(user = %self.host.name, container = %self.host.spec.container, "user ready");
        }
        let _ = self.done.finish(outcome.clone());
        outcome
    }

    async fn wait(&self, _observer: Option<Observer>) -> JobResult<()> {
        self.done.wait().await
    }

    fn abandon(&self, error: SharedError) {
        let _ = self.done.finish(Err(error));
    }
}
