//! Host account management.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use berth_common::constants::ROOT_AUTHORIZED_KEYS;
use berth_common::error::{BerthError, Result};
use nix::unistd::{Gid, Uid, User};

/// A host account as the setup sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAccount {
    /// Login name.
    pub name: String,
    /// Numeric user ID.
    pub uid: u32,
    /// Primary group ID.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
}

/// Operations on host accounts needed to provision users.
pub trait HostAccounts: Send + Sync {
    /// Fails unless the process runs with effective root.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::PermissionDenied`] when not root.
    fn ensure_root(&self) -> Result<()>;

    /// Path of the program installed as login shell.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be determined.
    fn login_shell(&self) -> Result<PathBuf>;

    /// Looks up an account by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the account database cannot be read.
    fn lookup(&self, name: &str) -> Result<Option<HostAccount>>;

    /// Creates an account in `group` with `shell` as login shell.
    ///
    /// # Errors
    ///
    /// Returns an error if account creation fails.
    fn create(&self, name: &str, shell: &Path, group: &str) -> Result<()>;

    /// Changes the login shell of an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the change fails.
    fn set_shell(&self, name: &str, shell: &Path) -> Result<()>;

    /// Sets an account password.
    ///
    /// # Errors
    ///
    /// Returns an error if the change fails.
    fn set_password(&self, name: &str, password: &str) -> Result<()>;

    /// Removes an account password, permitting empty logins.
    ///
    /// # Errors
    ///
    /// Returns an error if the change fails.
    fn delete_password(&self, name: &str) -> Result<()>;

    /// Locks an account against password logins.
    ///
    /// # Errors
    ///
    /// Returns an error if the change fails.
    fn lock(&self, name: &str) -> Result<()>;

    /// Hands `path` over to `account`.
    ///
    /// # Errors
    ///
    /// Returns an error if ownership cannot be changed.
    fn chown(&self, path: &Path, account: &HostAccount) -> Result<()>;

    /// Authorized keys file copied for `copyRootKeys`.
    fn root_authorized_keys(&self) -> PathBuf {
        PathBuf::from(ROOT_AUTHORIZED_KEYS)
    }
}

/// The accounts of the machine this process runs on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccounts;

fn run_command(program: &str, args: &[&str], stdin: Option<&str>) -> Result<()> {
    let command_line = format!("{program} {}", args.join(" "));
    tracing::debug!(command = %command_line, "running");
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BerthError::Command {
            command: command_line.clone(),
            message: e.to_string(),
        })?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .map_err(|e| BerthError::Command {
                command: command_line.clone(),
                message: e.to_string(),
            })?;
    }
    let output = child.wait_with_output().map_err(|e| BerthError::Command {
        command: command_line.clone(),
        message: e.to_string(),
    })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(BerthError::Command {
        command: command_line,
        message: format!("{}: {}", output.status, stderr.trim()),
    })
}

impl HostAccounts for SystemAccounts {
    fn ensure_root(&self) -> Result<()> {
        if nix::unistd::geteuid().is_root() {
            Ok(())
        } else {
            Err(BerthError::PermissionDenied {
                message: "user setup must run as root".into(),
            })
        }
    }

    fn login_shell(&self) -> Result<PathBuf> {
        std::env::current_exe().map_err(|e| BerthError::io("/proc/self/exe", e))
    }

    fn lookup(&self, name: &str) -> Result<Option<HostAccount>> {
        let user = User::from_name(name).map_err(|e| {
            BerthError::io("/etc/passwd", std::io::Error::from_raw_os_error(e as i32))
        })?;
        Ok(user.map(|u| HostAccount {
            name: u.name,
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
            home: u.dir,
        }))
    }

    fn create(&self, name: &str, shell: &Path, group: &str) -> Result<()> {
        let shell = shell.to_string_lossy();
        run_command("adduser", &["-G", group, "-D", "-s", &shell, name], None)
    }

    fn set_shell(&self, name: &str, shell: &Path) -> Result<()> {
        run_command("chsh", &["-s", &shell.to_string_lossy(), name], None)
    }

    fn set_password(&self, name: &str, password: &str) -> Result<()> {
        let password = password.replace('\n', "");
        run_command("passwd", &[name], Some(&format!("{password}\n{password}\n")))
    }

    fn delete_password(&self, name: &str) -> Result<()> {
        run_command("passwd", &["-d", name], None)
    }

    fn lock(&self, name: &str) -> Result<()> {
        run_command("passwd", &["-l", name], None)
    }

    fn chown(&self, path: &Path, account: &HostAccount) -> Result<()> {
        nix::unistd::chown(
            path,
            Some(Uid::from_raw(account.uid)),
            Some(Gid::from_raw(account.gid)),
        )
        .map_err(|e| BerthError::io(path, std::io::Error::from_raw_os_error(e as i32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_account_is_found() {
        let root = SystemAccounts.lookup("root").expect("lookup").expect("root exists");
        assert_eq!(root.uid, 0);
    }

    #[test]
    fn unknown_account_is_none() {
        assert!(
            SystemAccounts
                .lookup("berth-no-such-user-x9")
                .expect("lookup")
                .is_none()
        );
    }

    #[test]
    fn failing_command_reports_status() {
        let err = run_command("false", &[], None).unwrap_err();
        assert!(matches!(err, BerthError::Command { .. }), "got {err}");
    }

    #[test]
    fn missing_program_is_command_error() {
        let err = run_command("berth-definitely-missing", &["x"], None).unwrap_err();
        assert!(err.to_string().contains("berth-definitely-missing x"));
    }

    #[test]
    fn stdin_is_fed_to_command() {
        run_command("sh", &["-c", "read a && test \"$a\" = hello"], Some("hello\n"))
            .expect("sh reads stdin");
    }
}
