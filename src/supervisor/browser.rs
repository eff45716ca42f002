//! Browser provisioning
//!
//! Locates a Chromium-family browser and computes its launch arguments.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BrowserConfig;
use crate::error::{Result, TorProxyError};
use crate::models::Endpoint;

/// Executables tried in order when no browser binary is configured
pub const BROWSER_CANDIDATES: &[&str] = &[
    "chromium-browser",
    "chromium",
    "google-chrome",
    "google-chrome-stable",
];

/// Supplies the application launched behind the proxy
#[async_trait]
pub trait BrowserProvisioner: Send + Sync {
    /// Make sure the application is present and usable with `proxy`
    async fn ensure_installed(&self, proxy: &Endpoint) -> Result<()>;

    /// Path of the executable to launch
    fn resolve_executable(&self) -> Result<PathBuf>;

    /// Arguments that do not depend on the proxy endpoint
    fn launch_arguments(&self) -> Result<Vec<String>>;
}

/// Arguments pointing the browser at `endpoint`
pub fn application_arguments(endpoint: &Endpoint, incognito: bool) -> Vec<String> {
    let mut args = vec![format!("--proxy-server={}", endpoint.proxy_url())];
    if incognito {
        args.push("--incognito".to_string());
    }
    args
}

/// A browser installed on the system
#[derive(Debug, Clone)]
pub struct SystemBrowser {
    binary: Option<PathBuf>,
    extra_args: Vec<String>,
    profile_dir: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl SystemBrowser {
    pub fn from_config(config: &BrowserConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            extra_args: config.extra_args.clone(),
            profile_dir: config.profile_dir.clone(),
            search_path: env::var_os("PATH"),
        }
    }

    /// Search these directories instead of `PATH`
    pub fn with_search_path(mut self, path: impl Into<OsString>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    fn find_in_path(&self, name: &str) -> Option<PathBuf> {
        let search_path = self.search_path.as_ref()?;
        env::split_paths(search_path)
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

#[async_trait]
impl BrowserProvisioner for SystemBrowser {
    async fn ensure_installed(&self, proxy: &Endpoint) -> Result<()> {
        let executable = self.resolve_executable()?;
        info!(
            browser = %executable.display(),
            proxy = %proxy,
            "Browser available"
        );
        Ok(())
    }

    fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(binary) = &self.binary {
            // A bare name is looked up in PATH, anything else is used as is
            if binary.components().count() > 1 {
                return if is_executable(binary) {
                    Ok(binary.clone())
                } else {
                    Err(TorProxyError::BrowserNotFound(format!(
                        "{} is not an executable file",
                        binary.display()
                    )))
                };
            }

            let name = binary.to_string_lossy();
            return self.find_in_path(&name).ok_or_else(|| {
                TorProxyError::BrowserNotFound(format!("{} not found in PATH", name))
            });
        }

        for candidate in BROWSER_CANDIDATES {
            if let Some(path) = self.find_in_path(candidate) {
                debug!(browser = %path.display(), "Resolved browser");
                return Ok(path);
            }
        }

        Err(TorProxyError::BrowserNotFound(format!(
            "none of {} found in PATH",
            BROWSER_CANDIDATES.join(", ")
        )))
    }

    fn launch_arguments(&self) -> Result<Vec<String>> {
        let mut args = self.extra_args.clone();
        if let Some(dir) = &self.profile_dir {
            args.push(format!("--user-data-dir={}", dir.display()));
        }
        Ok(args)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser(binary: Option<&str>) -> SystemBrowser {
        SystemBrowser::from_config(&BrowserConfig {
            binary: binary.map(PathBuf::from),
            ..BrowserConfig::default()
        })
    }

    #[cfg(unix)]
    fn install(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_application_arguments() {
        let endpoint = Endpoint::http_forward("127.0.0.1:9046".parse().unwrap());
        assert_eq!(
            application_arguments(&endpoint, true),
            vec!["--proxy-server=http://127.0.0.1:9046", "--incognito"]
        );

        let endpoint = Endpoint::socks5("127.0.0.1:9045".parse().unwrap());
        assert_eq!(
            application_arguments(&endpoint, false),
            vec!["--proxy-server=socks5://127.0.0.1:9045"]
        );
    }

    #[test]
    fn test_launch_arguments_include_profile() {
        let browser = SystemBrowser::from_config(&BrowserConfig {
            extra_args: vec!["--no-first-run".to_string()],
            profile_dir: Some(PathBuf::from("/tmp/profile")),
            ..BrowserConfig::default()
        });

        assert_eq!(
            browser.launch_arguments().unwrap(),
            vec!["--no-first-run", "--user-data-dir=/tmp/profile"]
        );
    }

    #[test]
    fn test_missing_browser() {
        let dir = tempfile::tempdir().unwrap();
        let err = browser(None)
            .with_search_path(dir.path())
            .resolve_executable()
            .unwrap_err();
        assert!(matches!(err, TorProxyError::BrowserNotFound(_)));
        assert!(err.is_fatal_startup());
    }

    #[cfg(unix)]
    #[test]
    fn test_candidates_searched_in_order() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "google-chrome");
        let chromium = install(dir.path(), "chromium");

        let resolved = browser(None)
            .with_search_path(dir.path())
            .resolve_executable()
            .unwrap();
        assert_eq!(resolved, chromium);
    }

    #[cfg(unix)]
    #[test]
    fn test_configured_binary() {
        let dir = tempfile::tempdir().unwrap();
        let custom = install(dir.path(), "my-browser");

        let by_name = browser(Some("my-browser"))
            .with_search_path(dir.path())
            .resolve_executable()
            .unwrap();
        assert_eq!(by_name, custom);

        let by_path = browser(Some(custom.to_str().unwrap()))
            .with_search_path("")
            .resolve_executable()
            .unwrap();
        assert_eq!(by_path, custom);

        // Not executable
        let plain = dir.path().join("notes.txt");
        std::fs::write(&plain, "x").unwrap();
        assert!(browser(Some(plain.to_str().unwrap()))
            .resolve_executable()
            .is_err());
    }
}
