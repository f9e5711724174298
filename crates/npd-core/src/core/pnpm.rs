use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use npd_domain::is_path_entry;

use crate::core::effects::FileSystem;
use crate::core::process::{run_command, run_command_streaming};

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum PnpmError {
    #[error("{message}")]
    NotFound {
        message: String,
        #[source]
        source: Option<Cause>,
    },
    #[error("{message}")]
    FailedToExecute {
        message: String,
        #[source]
        source: Option<Cause>,
    },
    #[error("{message}")]
    FailedToParse {
        message: String,
        #[source]
        source: Option<Cause>,
    },
}

impl PnpmError {
    fn not_found(message: impl Into<String>, source: Option<Cause>) -> Self {
        Self::NotFound {
            message: message.into(),
            source,
        }
    }

    fn failed_to_execute(message: impl Into<String>, source: Option<Cause>) -> Self {
        Self::FailedToExecute {
            message: message.into(),
            source,
        }
    }
}

/// Options for `pnpm install`.
#[derive(Debug, Clone, Copy)]
pub struct InstallOptions<'a> {
    /// Scratch directory configured as pnpm's store-dir.
    pub store_dir: &'a Path,
    /// Directory containing `pnpm-lock.yaml`.
    pub working_dir: &'a Path,
    /// Forwarded as `--registry=<value>` when present.
    pub registry: Option<&'a str>,
    /// Forwarded as one `--filter=<value>` per entry.
    pub workspaces: &'a [String],
    /// Appended to `pnpm install` verbatim.
    pub extra_flags: &'a [String],
    /// Shell commands executed in the working directory before install.
    pub pre_install_commands: &'a [String],
}

/// Handle to a validated pnpm executable.
#[derive(Debug, Clone)]
pub struct Pnpm {
    path: PathBuf,
}

impl Pnpm {
    /// Wrap an explicit executable path.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the path does not exist, is not a regular
    /// file, or carries no execute bit.
    pub fn new(fs: &dyn FileSystem, path: &Path) -> Result<Self, PnpmError> {
        validate_executable(fs, path)?;
        debug!(path = %path.display(), "found pnpm executable");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Search pre-split `PATH` entries for an executable named `pnpm`.
    ///
    /// Invalid entries (empty, NUL-bearing) are skipped rather than
    /// treated as fatal.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no entry holds a usable executable.
    pub fn locate(fs: &dyn FileSystem, path_entries: &[String]) -> Result<Self, PnpmError> {
        for entry in path_entries {
            if !is_path_entry(entry) {
                debug!(entry, "skipping invalid PATH entry");
                continue;
            }
            let candidate = Path::new(entry).join("pnpm");
            match validate_executable(fs, &candidate) {
                Ok(()) => {
                    debug!(path = %candidate.display(), "found pnpm executable");
                    return Ok(Self { path: candidate });
                }
                Err(err) => {
                    debug!(path = %candidate.display(), %err, "no usable pnpm here");
                }
            }
        }
        Err(PnpmError::not_found(
            "pnpm executable not found in any PATH entry",
            None,
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw `pnpm --version` output (trailing newline included).
    ///
    /// # Errors
    ///
    /// Returns `FailedToExecute` when pnpm cannot be run or exits nonzero.
    pub fn version(&self) -> Result<String, PnpmError> {
        let output = run_command(&self.path, &["--version".to_string()], Path::new("."))
            .map_err(|err| {
                PnpmError::failed_to_execute(
                    "failed to execute pnpm to get version",
                    Some(err.into()),
                )
            })?;
        if !output.success() {
            return Err(PnpmError::failed_to_execute(
                format!(
                    "pnpm --version exited with code {}: {}",
                    output.code,
                    output.stderr.trim()
                ),
                None,
            ));
        }
        Ok(output.stdout)
    }

    /// Configure pnpm and run `pnpm install` with the strict flag set.
    ///
    /// `manage-package-manager-versions` is disabled first, from a
    /// throwaway temp directory: a `packageManager` field in the project's
    /// `package.json` makes pnpm try to download that version on any
    /// command run inside the project, before the config write could take
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns `FailedToExecute` for any config write, pre-install
    /// command, or install invocation that cannot be spawned or exits
    /// nonzero.
    pub fn install(&self, opts: &InstallOptions<'_>) -> Result<(), PnpmError> {
        let config_tmp = tempfile::Builder::new()
            .prefix("pnpm-config-")
            .tempdir()
            .map_err(|err| {
                PnpmError::failed_to_execute(
                    "failed to create temp directory for pnpm config",
                    Some(Box::new(err)),
                )
            })?;

        self.config_set("manage-package-manager-versions", "false", config_tmp.path())?;

        let store_dir = opts.store_dir.display().to_string();
        let settings = [
            ("store-dir", store_dir.as_str()),
            ("side-effects-cache", "false"),
            ("update-notifier", "false"),
        ];
        for (key, value) in settings {
            self.config_set(key, value, opts.working_dir)?;
        }

        for command in opts.pre_install_commands {
            debug!(%command, "running pre-install command");
            let output = run_command_streaming(
                Path::new("sh"),
                &["-c".to_string(), command.clone()],
                opts.working_dir,
            )
            .map_err(|err| {
                PnpmError::failed_to_execute(
                    format!("failed to execute pre-install command: {command}"),
                    Some(err.into()),
                )
            })?;
            if !output.success() {
                return Err(PnpmError::failed_to_execute(
                    format!(
                        "pre-install command exited with code {}: {command}",
                        output.code
                    ),
                    None,
                ));
            }
        }

        let mut args = vec![
            "install".to_string(),
            "--force".to_string(),
            "--ignore-scripts".to_string(),
            "--frozen-lockfile".to_string(),
        ];
        if let Some(registry) = opts.registry {
            args.push(format!("--registry={registry}"));
        }
        for workspace in opts.workspaces {
            args.push(format!("--filter={workspace}"));
        }
        args.extend(opts.extra_flags.iter().cloned());

        debug!(?args, "running pnpm install");
        let output =
            run_command_streaming(&self.path, &args, opts.working_dir).map_err(|err| {
                PnpmError::failed_to_execute("failed to execute pnpm install", Some(err.into()))
            })?;
        if !output.success() {
            return Err(PnpmError::failed_to_execute(
                format!("pnpm install exited with code {}", output.code),
                None,
            ));
        }
        Ok(())
    }

    fn config_set(&self, key: &str, value: &str, working_dir: &Path) -> Result<(), PnpmError> {
        let args = [
            "config".to_string(),
            "set".to_string(),
            key.to_string(),
            value.to_string(),
        ];
        let output = run_command(&self.path, &args, working_dir).map_err(|err| {
            PnpmError::failed_to_execute(
                format!("failed to set pnpm config {key}={value}"),
                Some(err.into()),
            )
        })?;
        if !output.success() {
            return Err(PnpmError::failed_to_execute(
                format!(
                    "failed to set pnpm config {key}={value}: {}",
                    output.stderr.trim()
                ),
                None,
            ));
        }
        Ok(())
    }
}

fn validate_executable(fs: &dyn FileSystem, path: &Path) -> Result<(), PnpmError> {
    let meta = fs.metadata(path).map_err(|err| {
        PnpmError::not_found(
            format!("pnpm executable not found at path: {}", path.display()),
            Some(err.into()),
        )
    })?;
    if !meta.is_file() || !meta.is_executable() {
        return Err(PnpmError::not_found(
            format!(
                "pnpm executable is not an executable file at path: {}",
                path.display()
            ),
            None,
        ));
    }
    Ok(())
}
