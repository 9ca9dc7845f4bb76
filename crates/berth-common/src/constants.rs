//! System-wide constants and default paths.

/// Default location of the declarative configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/berth/config.yaml";

/// Environment variable overriding the configuration path.
pub const CONFIG_PATH_ENV: &str = "BERTH_CONFIG";

/// Per-user shell descriptor written to the user's home directory.
pub const USER_DESCRIPTOR_FILE: &str = ".berth.yaml";

/// Setup progress log written to the user's home directory.
pub const USER_SETUP_LOG_FILE: &str = ".berth-setup.log";

/// Dockerfile name used when a build does not specify one.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Ignore file honored when packing a build context.
pub const DOCKERIGNORE_FILE: &str = ".dockerignore";

/// Bind mount that provides the init wrapper inside containers.
pub const INIT_BIND_MOUNT: &str = "/usr/bin/tini:/dev/init";

/// Host group new accounts join so they can reach the runtime socket.
pub const RUNTIME_GROUP: &str = "docker";

/// Path to root's authorized SSH keys, copied when `copyRootKeys` is set.
pub const ROOT_AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";

/// Git URL of the official image library metadata.
pub const LIBRARY_REPO_URL: &str = "https://github.com/docker-library/official-images.git";

/// Tag assumed for image references that carry none.
pub const DEFAULT_TAG: &str = "latest";

/// Registry host stripped from references before library lookups.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Terminal base image that can be neither pulled nor built.
pub const SCRATCH_IMAGE: &str = "scratch";

/// Application name used in log output and temporary directory prefixes.
pub const APP_NAME: &str = "berth";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "berth";
