//! HTTP collaborators: release lookup, secret-key generation, archive download.
//!
//! Lookups are read-only and run in both modes; a failed lookup is absorbed
//! here and replaced by a documented fallback. Downloads write to the host and
//! go through the effect gate like every other mutation.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::mode::{Admission, EffectGate};

pub const VERSION_API: &str = "https://api.wordpress.org/core/version-check/1.7/";
pub const SALT_API: &str = "https://api.wordpress.org/secret-key/1.1/salt/";
pub const FALLBACK_VERSION: &str = "latest";
pub const FALLBACK_DOWNLOAD: &str = "https://wordpress.org/latest.tar.gz";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const USER_AGENT: &str = concat!("lemp-provision/", env!("CARGO_PKG_VERSION"));

/// Raw HTTP access.
pub trait Fetcher: Send + Sync {
    /// Fetch a small text payload.
    fn get_text(&self, url: &str, timeout: Duration) -> Result<String>;
    /// Stream `url` into the file at `dest`, returning the byte count.
    fn download(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64>;
}

/// Blocking `reqwest` client.
#[derive(Debug, Default, Clone)]
pub struct HttpFetcher;

impl HttpFetcher {
    fn client(timeout: Duration) -> reqwest::Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
    }
}

impl Fetcher for HttpFetcher {
    fn get_text(&self, url: &str, timeout: Duration) -> Result<String> {
        let unavailable = |e: reqwest::Error| ProvisionError::unavailable(url, e);
        let response = Self::client(timeout)
            .and_then(|c| c.get(url).send())
            .map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::unavailable(url, format!("HTTP {status}")));
        }
        response.text().map_err(unavailable)
    }

    fn download(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64> {
        let failed = |reason: String| ProvisionError::DownloadFailed {
            url: url.to_string(),
            reason,
        };
        let mut response = Self::client(timeout)
            .and_then(|c| c.get(url).send())
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }
        let mut file = File::create(dest).map_err(|e| failed(e.to_string()))?;
        response.copy_to(&mut file).map_err(|e| failed(e.to_string()))
    }
}

/// Release to deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: String,
    pub download_url: String,
}

impl Release {
    fn fallback() -> Self {
        Self {
            version: FALLBACK_VERSION.to_string(),
            download_url: FALLBACK_DOWNLOAD.to_string(),
        }
    }

    pub fn is_zip(&self) -> bool {
        self.download_url.to_ascii_lowercase().ends_with(".zip")
    }
}

#[derive(Debug, Deserialize)]
struct VersionCheck {
    #[serde(default)]
    offers: Vec<Offer>,
}

#[derive(Debug, Deserialize)]
struct Offer {
    current: Option<String>,
    download: Option<String>,
}

/// Parse the version-check payload; `None` when no usable offer is present.
pub fn parse_version_check(body: &str) -> Option<Release> {
    let payload: VersionCheck = serde_json::from_str(body).ok()?;
    let offer = payload.offers.into_iter().next()?;
    let download_url = offer.download.filter(|d| !d.is_empty())?;
    Some(Release {
        version: offer.current.unwrap_or_else(|| FALLBACK_VERSION.to_string()),
        download_url,
    })
}

/// Mode-aware front for a [`Fetcher`].
#[derive(Clone)]
pub struct WebClient {
    gate: EffectGate,
    fetcher: Arc<dyn Fetcher>,
}

impl fmt::Debug for WebClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebClient")
            .field("mode", &self.gate.mode())
            .finish_non_exhaustive()
    }
}

impl WebClient {
    pub fn new(gate: EffectGate, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { gate, fetcher }
    }

    pub fn detached(&self) -> Self {
        Self {
            gate: self.gate.detached(),
            fetcher: Arc::clone(&self.fetcher),
        }
    }

    /// Latest release, or `latest` / `latest.tar.gz` when the API is unusable.
    pub fn latest_release(&self) -> Result<Release> {
        self.gate.ensure_running()?;
        info!("Querying WordPress version API...");
        let start = Instant::now();
        let release = match self.fetcher.get_text(VERSION_API, LOOKUP_TIMEOUT) {
            Ok(body) => {
                debug!(
                    duration_sec = format!("{:.2}", start.elapsed().as_secs_f64()),
                    "version API response received"
                );
                parse_version_check(&body)
            }
            Err(e) => {
                warn!("Failed to get WordPress version via API: {}", e);
                None
            }
        };
        match release {
            Some(release) => {
                info!("Latest WordPress version: {}", release.version);
                Ok(release)
            }
            None => {
                warn!("Falling back to {}", FALLBACK_DOWNLOAD);
                Ok(Release::fallback())
            }
        }
    }

    /// Freshly generated `define(...)` salt block, or `None` if unavailable.
    pub fn salts(&self) -> Result<Option<String>> {
        self.gate.ensure_running()?;
        match self.fetcher.get_text(SALT_API, LOOKUP_TIMEOUT) {
            Ok(body) if body.contains("AUTH_KEY") => Ok(Some(body)),
            Ok(_) => {
                warn!("Secret-key API returned an unexpected payload; keeping sample salts");
                Ok(None)
            }
            Err(e) => {
                warn!("Could not fetch salts; keeping sample salts: {}", e);
                Ok(None)
            }
        }
    }

    /// Download `url` to `dest`. Simulate mode only reports the transfer.
    pub fn download(&self, url: &str, dest: &Path) -> Result<Admission> {
        let admission = self
            .gate
            .admit(|| format!("download {url} to {}", dest.display()))?;
        if admission == Admission::Perform {
            let _held = self.gate.hold()?;
            info!("Downloading {} ...", url);
            let start = Instant::now();
            let bytes = self.fetcher.download(url, dest, DOWNLOAD_TIMEOUT)?;
            info!(
                size_mb = format!("{:.2}", bytes as f64 / 1024.0 / 1024.0),
                duration_sec = format!("{:.2}", start.elapsed().as_secs_f64()),
                "Download complete"
            );
        }
        Ok(admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{ExecutionMode, Journal};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Canned {
        text: Option<String>,
        downloads: Mutex<Vec<String>>,
    }

    impl Fetcher for Canned {
        fn get_text(&self, url: &str, _timeout: Duration) -> Result<String> {
            self.text
                .clone()
                .ok_or_else(|| ProvisionError::unavailable(url, "offline"))
        }

        fn download(&self, url: &str, _dest: &Path, _timeout: Duration) -> Result<u64> {
            self.downloads.lock().unwrap().push(url.to_string());
            Ok(3)
        }
    }

    fn client(mode: ExecutionMode, canned: Arc<Canned>) -> (WebClient, Arc<Journal>) {
        let journal = Arc::new(Journal::new());
        let gate = EffectGate::new(mode, Arc::clone(&journal), Arc::new(AtomicBool::new(false)));
        (WebClient::new(gate, canned), journal)
    }

    #[test]
    fn test_parse_version_check_first_offer() {
        let body = r#"{"offers":[{"current":"6.5.2","download":"https://downloads.wordpress.org/release/wordpress-6.5.2.zip"},{"current":"6.4"}]}"#;
        let release = parse_version_check(body).expect("offer");
        assert_eq!(release.version, "6.5.2");
        assert!(release.is_zip());
    }

    #[test]
    fn test_parse_version_check_rejects_missing_download() {
        assert!(parse_version_check(r#"{"offers":[{"current":"6.5"}]}"#).is_none());
        assert!(parse_version_check(r#"{"offers":[]}"#).is_none());
        assert!(parse_version_check("not json").is_none());
    }

    #[test]
    fn test_latest_release_falls_back_when_offline() {
        let (web, _) = client(ExecutionMode::Perform, Arc::new(Canned::default()));
        let release = web.latest_release().expect("fallback is not an error");
        assert_eq!(release.version, FALLBACK_VERSION);
        assert_eq!(release.download_url, FALLBACK_DOWNLOAD);
        assert!(!release.is_zip());
    }

    #[test]
    fn test_salts_absorbs_failures() {
        let (web, _) = client(ExecutionMode::Perform, Arc::new(Canned::default()));
        assert_eq!(web.salts().unwrap(), None);

        let canned = Arc::new(Canned {
            text: Some("define('AUTH_KEY', 'x');".to_string()),
            ..Canned::default()
        });
        let (web, _) = client(ExecutionMode::Perform, canned);
        assert!(web.salts().unwrap().is_some());
    }

    #[test]
    fn test_simulated_download_does_not_fetch() {
        let canned = Arc::new(Canned::default());
        let (web, journal) = client(ExecutionMode::Simulate, Arc::clone(&canned));
        let admission = web
            .download(FALLBACK_DOWNLOAD, Path::new("/tmp/wp.tar.gz"))
            .unwrap();
        assert!(admission.is_simulated());
        assert!(canned.downloads.lock().unwrap().is_empty());
        assert!(journal.mentions("download https://wordpress.org/latest.tar.gz"));
    }
}
