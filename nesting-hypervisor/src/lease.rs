//! Address resolution by polling an external lease source.
//!
//! DHCP servers on the host write one lease record per MAC address. The
//! driver never writes these records, it only polls them after booting a VM.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::context::Context;
use crate::error::{HypervisorError, Result};

/// How often a lease source is checked while waiting for an address.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where the Parallels DHCP hook drops its lease files.
pub const DEFAULT_LEASE_DIR: &str = "/tmp/parallels.leases";

/// Normalize a MAC address into the lowercase, separator-free lease key.
pub fn lease_key(mac: &str) -> String {
    mac.chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Something that maps a MAC address to an IP address.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    /// The leased address, or `None` when no lease exists yet.
    async fn lookup(&self, mac: &str) -> Result<Option<String>>;
}

/// Lease records stored as one file per MAC address.
///
/// A file holds either the raw address bytes (4 or 16 bytes) or the address
/// as text.
#[derive(Debug, Clone)]
pub struct LeaseDirectory {
    dir: PathBuf,
}

impl LeaseDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, mac: &str) -> PathBuf {
        self.dir.join(lease_key(mac))
    }

    /// Remove the lease for `mac`. A missing lease is not an error.
    pub async fn remove(&self, mac: &str) -> Result<()> {
        if lease_key(mac).is_empty() {
            return Ok(());
        }

        let path = self.path_for(mac);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Lease removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HypervisorError::Internal(format!(
                "removing lease {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Default for LeaseDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_DIR)
    }
}

#[async_trait]
impl LeaseSource for LeaseDirectory {
    async fn lookup(&self, mac: &str) -> Result<Option<String>> {
        // A VM without a NIC has no lease to look for.
        if lease_key(mac).is_empty() {
            return Ok(None);
        }

        let path = self.path_for(mac);
        match tokio::fs::read(&path).await {
            Ok(buf) => parse_lease(&buf).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HypervisorError::QueryFailed(format!(
                "reading lease {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Decode the contents of a lease file.
pub fn parse_lease(buf: &[u8]) -> Result<String> {
    match buf.len() {
        4 => {
            let octets: [u8; 4] = [buf[0], buf[1], buf[2], buf[3]];
            Ok(Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(buf);
            Ok(Ipv6Addr::from(octets).to_string())
        }
        _ => {
            let text = std::str::from_utf8(buf)
                .map_err(|_| HypervisorError::QueryFailed("lease is not an address".to_string()))?
                .trim();
            text.parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .map_err(|_| HypervisorError::QueryFailed(format!("invalid lease address {:?}", text)))
        }
    }
}

/// Polls a [`LeaseSource`] until an address appears.
#[derive(Clone)]
pub struct AddressResolver {
    source: Arc<dyn LeaseSource>,
    interval: Duration,
}

impl AddressResolver {
    pub fn new(source: Arc<dyn LeaseSource>) -> Self {
        Self {
            source,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the polling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Resolve the address of `mac`.
    ///
    /// With a zero `timeout` this checks once and returns `Ok(None)` if there
    /// is no lease. Otherwise it polls every interval until the lease shows up
    /// and fails with [`HypervisorError::AddressTimeout`] once `timeout` has
    /// elapsed. The context can end the wait early, which yields
    /// `Cancelled` or `DeadlineExceeded` rather than a timeout.
    #[instrument(skip(self, ctx), fields(timeout_secs = timeout.as_secs()))]
    pub async fn resolve(&self, ctx: &Context, mac: &str, timeout: Duration) -> Result<Option<String>> {
        if timeout.is_zero() {
            return self.source.lookup(mac).await;
        }

        let give_up = Instant::now() + timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(addr) = self.source.lookup(mac).await? {
                debug!(%addr, attempts, "Address resolved");
                return Ok(Some(addr));
            }

            ctx.check()?;

            let now = Instant::now();
            if now >= give_up {
                warn!(attempts, "Gave up waiting for address");
                return Err(HypervisorError::AddressTimeout {
                    mac: mac.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            ctx.sleep(self.interval.min(give_up - now)).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Lease source that produces an address after a fixed number of misses.
    struct AfterMisses {
        misses: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LeaseSource for AfterMisses {
        async fn lookup(&self, _mac: &str) -> Result<Option<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((n >= self.misses).then(|| "10.0.0.7".to_string()))
        }
    }

    fn resolver(misses: u32) -> (AddressResolver, Arc<AfterMisses>) {
        let source = Arc::new(AfterMisses {
            misses,
            calls: AtomicU32::new(0),
        });
        (AddressResolver::new(source.clone()), source)
    }

    #[test]
    fn test_parse_lease_forms() {
        assert_eq!(parse_lease(&[192, 168, 64, 3]).unwrap(), "192.168.64.3");
        assert_eq!(parse_lease(b"10.211.55.4\n").unwrap(), "10.211.55.4");
        let mut v6 = [0u8; 16];
        v6[15] = 1;
        assert_eq!(parse_lease(&v6).unwrap(), "::1");
        assert!(parse_lease(b"garbage!").is_err());
    }

    #[test]
    fn test_lease_key_normalizes() {
        assert_eq!(lease_key("00:1C:42:AB:CD:EF"), "001c42abcdef");
        assert_eq!(lease_key("001C42ABCDEF"), "001c42abcdef");
    }

    #[tokio::test]
    async fn test_zero_timeout_is_best_effort() {
        let (resolver, source) = resolver(u32::MAX);
        let addr = resolver
            .resolve(&Context::background(), "02aabbccddee", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(addr, None);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_found() {
        let (resolver, source) = resolver(3);
        let addr = resolver
            .resolve(&Context::background(), "02aabbccddee", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(addr.as_deref(), Some("10.0.0.7"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_an_error() {
        let (resolver, _) = resolver(u32::MAX);
        let err = resolver
            .resolve(&Context::background(), "02aabbccddee", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::AddressTimeout { timeout_secs: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_distinct_from_timeout() {
        let (resolver, _) = resolver(u32::MAX);
        let (ctx, handle) = Context::cancellable();

        let task = tokio::spawn(async move {
            resolver
                .resolve(&ctx, "02aabbccddee", Duration::from_secs(300))
                .await
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, HypervisorError::Cancelled));
    }

    #[tokio::test]
    async fn test_lease_directory_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let leases = LeaseDirectory::new(dir.path());

        assert_eq!(leases.lookup("02:AA:BB:CC:DD:EE").await.unwrap(), None);

        std::fs::write(dir.path().join("02aabbccddee"), [10, 37, 129, 2]).unwrap();
        assert_eq!(
            leases.lookup("02:AA:BB:CC:DD:EE").await.unwrap().as_deref(),
            Some("10.37.129.2")
        );

        leases.remove("02AABBCCDDEE").await.unwrap();
        assert_eq!(leases.lookup("02aabbccddee").await.unwrap(), None);
        // Removing again is fine.
        leases.remove("02aabbccddee").await.unwrap();
    }
}
