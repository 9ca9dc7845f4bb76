//! Declarative configuration model.
//!
//! A [`Config`] names the images, containers, and host users that should
//! exist. Collections are keyed by name in ordered maps so repeated runs see
//! the same iteration order, although nothing relies on it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Containers keyed by name.
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerSpec>,
    /// Host users keyed by account name.
    #[serde(default)]
    pub users: BTreeMap<String, UserSpec>,
    /// Images keyed by `name:tag`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, ImageSpec>,
}

/// When an image should be pulled from a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull on every run, even when the image is present.
    Always,
    /// Pull only when the image is absent.
    #[default]
    IfNotPresent,
    /// Build first and pull only if the build fails.
    IfBuildFails,
}

/// An image to pull or build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    /// How to pull the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullSpec>,
    /// How to build the image from source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
}

/// Pull instructions for an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSpec {
    /// When to pull.
    #[serde(default, rename = "pullPolicy")]
    pub policy: PullPolicy,
    /// Registry host prefixed to the image name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

impl PullSpec {
    /// Returns the reference to pull for the named image.
    #[must_use]
    pub fn reference_for(&self, image: &str) -> String {
        match self.registry.as_deref().filter(|r| !r.is_empty()) {
            Some(registry) => format!("{}/{image}", registry.trim_end_matches('/')),
            None => image.to_string(),
        }
    }
}

/// Build instructions for an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildSpec {
    /// Source locator: git URL, `.tar.gz` path or URL, or absolute directory.
    pub source: String,
    /// Directory inside the source used as the build context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Dockerfile path relative to the build context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Build arguments passed to the runtime.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub build_args: BTreeMap<String, Option<String>>,
    /// Keep intermediate build containers.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub preserve_intermediate: bool,
    /// Legacy mode: rebuild the whole `FROM` chain on arch-specific bases.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub scratch_build: bool,
    /// Squash the result into a single layer.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub squash: bool,
}

/// A container to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Image reference; synthesized as a bare image job when undeclared.
    pub image: String,
    /// Allocate a TTY.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tty: bool,
    /// Working directory override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Bind mounts in `host:container[:opts]` form.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
    /// Do not run the init wrapper as PID 1.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disable_init: bool,
    /// Run privileged.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub privileged: bool,
    /// Capabilities to add; accepts `ALL`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    /// Share the host IPC namespace.
    #[serde(rename = "hostIPC", skip_serializing_if = "std::ops::Not::not")]
    pub host_ipc: bool,
    /// Share the host PID namespace.
    #[serde(rename = "hostPID", skip_serializing_if = "std::ops::Not::not")]
    pub host_pid: bool,
    /// Share the host UTS namespace.
    #[serde(rename = "hostUTS", skip_serializing_if = "std::ops::Not::not")]
    pub host_uts: bool,
    /// Share the host network namespace.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub host_network: bool,
    /// Security options such as `seccomp=unconfined`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    /// Tmpfs mounts: path to mount options.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tmp_fs: BTreeMap<String, String>,
    /// Entrypoint override.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    /// Command override.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Port mappings, used when not on the host network.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,
    /// Additional DNS servers.
    #[serde(rename = "dns", skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    /// Additional DNS search domains.
    #[serde(rename = "dnsSearch", skip_serializing_if = "Vec::is_empty")]
    pub dns_search: Vec<String>,
    /// Extra `/etc/hosts` entries in `host:ip` form.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// Restart policy: `always`, `on-failure`, `unless-stopped`, or `no`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    /// Start the container right after creating it.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub start_after_create: bool,
    /// Signal used to stop the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

/// A host-to-container port mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

/// A host account whose logins land in a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserSpec {
    /// Name of the declared container the user enters.
    pub container: String,
    /// Authentication settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<UserAuth>,
    /// User to run as inside the container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_user: Option<String>,
    /// Shell argv to run inside the container.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub container_shell: Vec<String>,
    /// Create `container_user` inside the container when missing.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub create_container_user: bool,
}

impl UserSpec {
    /// Builds the descriptor persisted to the user's home directory.
    #[must_use]
    pub fn descriptor(&self, container_id: &str) -> UserShellDescriptor {
        UserShellDescriptor {
            container_id: container_id.to_string(),
            user: self.container_user.clone(),
            shell: self.container_shell.clone(),
        }
    }
}

/// Authentication settings for a host user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserAuth {
    /// Copy root's authorized SSH keys.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub copy_root_keys: bool,
    /// Additional authorized SSH keys.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    /// Explicit password. Empty means a long random one.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Permit an empty password instead of a random one.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub allow_empty_password: bool,
    /// Lock the account against password login.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub locked: bool,
}

/// Descriptor read by the interactive shell to enter the right container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserShellDescriptor {
    /// Runtime ID of the container.
    pub container_id: String,
    /// User inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Shell argv inside the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shell: Vec<String>,
}

impl UserShellDescriptor {
    /// Encodes the descriptor as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Decodes a descriptor from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed.
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}

impl Config {
    /// Parses a YAML document and fills defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(data)?;
        config.fill_defaults();
        Ok(config)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "loading configuration");
        let data = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
        Self::from_yaml(&data)
    }

    /// Encodes the configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the configuration to a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
        }
        let data = self.to_yaml()?;
        std::fs::write(path, data).map_err(|e| BerthError::io(path, e))
    }

    /// Confines build paths to the source tree.
    ///
    /// `root` and `dockerfile` lose any `..` segments and become `./`
    /// relative paths.
    pub fn fill_defaults(&mut self) {
        for build in self.images.values_mut().filter_map(|i| i.build.as_mut()) {
            build.root = build.root.as_deref().filter(|r| !r.is_empty()).map(confine_relative);
            build.dockerfile = build
                .dockerfile
                .as_deref()
                .filter(|d| !d.is_empty())
                .map(confine_relative);
        }
    }

    /// Returns the stock configuration written by `berth defconfig`.
    #[must_use]
    pub fn default_config() -> Self {
        let mut config = Self::default();
        let _ = config.users.insert(
            "core".into(),
            UserSpec {
                container: "core".into(),
                auth: Some(UserAuth {
                    copy_root_keys: true,
                    ..UserAuth::default()
                }),
                ..UserSpec::default()
            },
        );
        let _ = config.images.insert(
            "berth/core:latest".into(),
            ImageSpec {
                pull: None,
                build: Some(BuildSpec {
                    source: "/opt/berth/coreenv/user".into(),
                    ..BuildSpec::default()
                }),
            },
        );
        let mut tmp_fs = BTreeMap::new();
        let _ = tmp_fs.insert("/run".into(), "rw,noexec,nosuid,size=65536k".into());
        let _ = config.containers.insert(
            "core".into(),
            ContainerSpec {
                image: "berth/core:latest".into(),
                cmd: vec!["/bin/sleep".into(), "infinity".into()],
                privileged: true,
                cap_add: vec!["ALL".into()],
                host_ipc: true,
                host_pid: true,
                host_uts: true,
                host_network: true,
                security_opt: vec!["seccomp=unconfined".into()],
                mounts: vec![
                    "/lib/modules:/lib/modules".into(),
                    "/sys/fs/cgroup:/sys/fs/cgroup:ro".into(),
                    "/dev:/dev".into(),
                    "/mnt:/mnt".into(),
                ],
                tmp_fs,
                start_after_create: true,
                ..ContainerSpec::default()
            },
        );
        config.fill_defaults();
        config
    }
}

/// Rewrites a path as `./`-relative with `.` and `..` segments resolved
/// against a virtual root, so the result never leaves the tree.
fn confine_relative(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                let _ = parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("./{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
images:
  app/base:latest:
    pull:
      pullPolicy: ifbuildfails
      registry: registry.local:5000
    build:
      source: /opt/src
      root: ../../etc
      dockerfile: sub/../Dockerfile.arm
containers:
  core:
    image: app/base:latest
    hostNetwork: true
    hostPID: true
    tmpFs:
      /run: rw
    ports:
      - hostPort: 2222
        containerPort: 22
users:
  alice:
    container: core
    containerUser: alice
    containerShell: [/bin/bash, -l]
    auth:
      sshKeys: [ssh-ed25519 AAAA]
      locked: true
";

    #[test]
    fn parse_sample_fills_all_sections() {
        let config = Config::from_yaml(SAMPLE).expect("parse");
        let image = &config.images["app/base:latest"];
        let pull = image.pull.as_ref().expect("pull");
        assert_eq!(pull.policy, PullPolicy::IfBuildFails);
        assert_eq!(
            pull.reference_for("app/base:latest"),
            "registry.local:5000/app/base:latest"
        );

        let container = &config.containers["core"];
        assert!(container.host_network);
        assert!(container.host_pid);
        assert_eq!(container.ports[0].container_port, 22);
        assert_eq!(container.tmp_fs["/run"], "rw");

        let user = &config.users["alice"];
        assert_eq!(user.container, "core");
        assert_eq!(user.container_shell, vec!["/bin/bash", "-l"]);
        assert!(user.auth.as_ref().expect("auth").locked);
    }

    #[test]
    fn fill_defaults_confines_build_paths() {
        let config = Config::from_yaml(SAMPLE).expect("parse");
        let build = config.images["app/base:latest"]
            .build
            .as_ref()
            .expect("build");
        assert_eq!(build.root.as_deref(), Some("./etc"));
        assert_eq!(build.dockerfile.as_deref(), Some("./Dockerfile.arm"));
    }

    #[test]
    fn missing_pull_policy_defaults_to_if_not_present() {
        let config = Config::from_yaml("images:\n  a:latest:\n    pull: {}\n").expect("parse");
        let pull = config.images["a:latest"].pull.as_ref().expect("pull");
        assert_eq!(pull.policy, PullPolicy::IfNotPresent);
        assert_eq!(pull.reference_for("a:latest"), "a:latest");
    }

    #[test]
    fn confine_relative_strips_parent_segments() {
        assert_eq!(confine_relative("../../x/y"), "./x/y");
        assert_eq!(confine_relative("/abs/path"), "./abs/path");
        assert_eq!(confine_relative("a/./b/../c"), "./a/c");
        assert_eq!(confine_relative(".."), "./");
    }

    #[test]
    fn default_config_is_consistent() {
        let config = Config::default_config();
        let user = &config.users["core"];
        let container = &config.containers[&user.container];
        assert!(config.images.contains_key(&container.image));
        assert!(container.start_after_create);
    }

    #[test]
    fn save_and_load_preserve_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("etc").join("config.yaml");
        let config = Config::default_config();
        config.save(&path).expect("save");
        let loaded = Config::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn descriptor_yaml_uses_camel_case_keys() {
        let user = UserSpec {
            container: "core".into(),
            container_user: Some("alice".into()),
            container_shell: vec!["/bin/sh".into()],
            ..UserSpec::default()
        };
        let yaml = user.descriptor("abc123").to_yaml().expect("yaml");
        assert!(yaml.contains("containerId: abc123"), "got: {yaml}");
        let back = UserShellDescriptor::from_yaml(&yaml).expect("parse");
        assert_eq!(back.user.as_deref(), Some("alice"));
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = Config::load(Path::new("/nonexistent/berth.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/berth.yaml"));
    }
}
