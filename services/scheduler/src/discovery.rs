//! Host discovery polling.
//!
//! Discovery is the source of truth for which hosts exist. The scheduler
//! polls it, diffs the listing against the hosts it already knows, and feeds
//! the difference to the core as membership events.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use convoy_events::HostEvent;
use convoy_id::HostId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::scheduler::SchedulerHandle;

/// One host as listed by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub host_id: HostId,
    pub address: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid host list: {0}")]
    Invalid(String),
}

/// A source of the current host listing.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn hosts(&self) -> Result<Vec<HostEntry>, DiscoveryError>;
}

/// Discovery service reached over HTTP (`GET {base}/v1/hosts`).
pub struct HttpDiscovery {
    client: reqwest::Client,
    url: String,
}

impl HttpDiscovery {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/v1/hosts", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn hosts(&self) -> Result<Vec<HostEntry>, DiscoveryError> {
        let hosts = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(hosts)
    }
}

/// A fixed host list, for single-box and test deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    hosts: Vec<HostEntry>,
}

impl StaticDiscovery {
    pub fn new(hosts: Vec<HostEntry>) -> Self {
        Self { hosts }
    }

    /// Parse `id=addr,id=addr`.
    pub fn parse(list: &str) -> Result<Self, DiscoveryError> {
        let mut hosts = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((id, address)) = item.split_once('=') else {
                return Err(DiscoveryError::Invalid(format!(
                    "expected id=address, got {item:?}"
                )));
            };
            let host_id = HostId::parse(id.trim())
                .map_err(|e| DiscoveryError::Invalid(format!("{id:?}: {e}")))?;
            let address = address.trim();
            if address.is_empty() {
                return Err(DiscoveryError::Invalid(format!("{id:?}: empty address")));
            }
            hosts.push(HostEntry {
                host_id,
                address: address.to_string(),
            });
        }
        Ok(Self { hosts })
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn hosts(&self) -> Result<Vec<HostEntry>, DiscoveryError> {
        Ok(self.hosts.clone())
    }
}

/// Membership events that turn `known` into `listed`.
///
/// A host whose address changed is removed and re-added.
pub fn diff_hosts(known: &BTreeMap<HostId, String>, listed: &[HostEntry]) -> Vec<HostEvent> {
    let listed: BTreeMap<&HostId, &str> = listed
        .iter()
        .map(|h| (&h.host_id, h.address.as_str()))
        .collect();

    let mut events = Vec::new();
    for (host_id, address) in known {
        match listed.get(host_id) {
            Some(current) if *current == address => {}
            _ => events.push(HostEvent::removed(host_id.clone())),
        }
    }
    for (host_id, address) in &listed {
        if known.get(*host_id).map(String::as_str) != Some(*address) {
            events.push(HostEvent::added((*host_id).clone(), *address));
        }
    }
    events
}

/// Poll discovery until shutdown, forwarding membership changes.
///
/// A failed poll leaves the known set as it was: hosts are never removed
/// because discovery was unreachable.
#[instrument(skip_all, name = "discovery")]
pub async fn run_discovery_loop(
    discovery: impl Discovery,
    scheduler: SchedulerHandle,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(poll_ms = poll_interval.as_millis() as u64, "Starting discovery loop");

    let mut known: BTreeMap<HostId, String> = BTreeMap::new();
    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let listed = match discovery.hosts().await {
                    Ok(listed) => {
                        consecutive_failures = 0;
                        listed
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Discovery poll failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Discovery poll failed repeatedly");
                        }
                        continue;
                    }
                };

                for event in diff_hosts(&known, &listed) {
                    debug!(host_id = %event.host_id, kind = ?event.kind, "Membership change");
                    if scheduler.host_event(event).await.is_err() {
                        info!("Scheduler stopped, ending discovery loop");
                        return;
                    }
                }
                known = listed
                    .into_iter()
                    .map(|h| (h.host_id, h.address))
                    .collect();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Discovery loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_events::HostEventKind;

    fn entry(id: &str, address: &str) -> HostEntry {
        HostEntry {
            host_id: HostId::parse(id).unwrap(),
            address: address.to_string(),
        }
    }

    fn known(entries: &[(&str, &str)]) -> BTreeMap<HostId, String> {
        entries
            .iter()
            .map(|(id, addr)| (HostId::parse(id).unwrap(), addr.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_adds_and_removes() {
        let events = diff_hosts(
            &known(&[("a", "a:1"), ("b", "b:1")]),
            &[entry("b", "b:1"), entry("c", "c:1")],
        );
        assert_eq!(
            events,
            vec![
                HostEvent::removed(HostId::parse("a").unwrap()),
                HostEvent::added(HostId::parse("c").unwrap(), "c:1"),
            ]
        );
    }

    #[test]
    fn test_diff_address_change_readds() {
        let events = diff_hosts(&known(&[("a", "a:1")]), &[entry("a", "a:2")]);
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![HostEventKind::Removed, HostEventKind::Added]);
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        assert!(diff_hosts(&known(&[("a", "a:1")]), &[entry("a", "a:1")]).is_empty());
    }

    #[test]
    fn test_static_parse() {
        let discovery = StaticDiscovery::parse("a=10.0.0.1:1113, b=10.0.0.2:1113").unwrap();
        assert_eq!(
            discovery.hosts,
            vec![entry("a", "10.0.0.1:1113"), entry("b", "10.0.0.2:1113")]
        );
        assert!(StaticDiscovery::parse("").unwrap().hosts.is_empty());
        assert!(StaticDiscovery::parse("a").is_err());
        assert!(StaticDiscovery::parse("a=").is_err());
        assert!(StaticDiscovery::parse("=x:1").is_err());
    }
}
