use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ethers::types::Address;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use relay_core::{
    ChainResult, KnownRelay, RelayCandidate, RelayChain, RelayEventName, RelayFailureRecord,
    RelayHubEvent, TransactionDetails,
};

pub use merge::*;
pub use scoring::*;

use crate::{RelayClientConfig, RelayClientError};

mod merge;
mod scoring;


/// Snapshot of the relays the client knows about. Replaced as a whole on
/// every refresh.
#[derive(Debug, Clone, Default)]
pub struct KnownRelays {
    /// Statically configured relays, in configured order
    pub preferred: Vec<KnownRelay>,
    /// Relays derived from hub events
    pub registered: Vec<RelayCandidate>,
}

/// Keeps the list of candidate relays and their recent failures.
///
/// Tier 0 is the configured preferred relays. Tier 1 is rebuilt on every
/// [`KnownRelaysManager::refresh`] from hub events: managers active within
/// the lookback window, resolved through their full registration history.
#[derive(Debug)]
pub struct KnownRelaysManager {
    chain: Arc<dyn RelayChain>,
    config: RelayClientConfig,
    relay_filter: Arc<dyn RelayFilter>,
    scorer: Arc<dyn RelayScore>,
    known_relays: RwLock<Arc<KnownRelays>>,
    failures: RwLock<HashMap<String, Vec<RelayFailureRecord>>>,
    /// Number of sub-ranges event queries are split into. Doubled whenever
    /// the node refuses a range, up to `max_window_parts`.
    window_parts: Mutex<u64>,
    max_window_parts: u64,
}

/// Split `[from, to]` into at most `parts` contiguous ranges of equal size
/// (the last one possibly shorter).
pub fn split_range(from: u64, to: u64, parts: u64) -> Vec<(u64, u64)> {
    if to < from {
        return vec![];
    }
    let total = to - from + 1;
    let parts = parts.clamp(1, total);
    let part_size = total.div_ceil(parts);
    let mut ranges = vec![];
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(part_size - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

impl KnownRelaysManager {
    /// Create a manager with the given strategies
    pub fn new(
        chain: Arc<dyn RelayChain>,
        config: RelayClientConfig,
        relay_filter: Arc<dyn RelayFilter>,
        scorer: Arc<dyn RelayScore>,
    ) -> Self {
        let initial_parts = config.relay_lookup_window_parts.max(1);
        let max_window_parts = initial_parts
            .checked_shl(config.max_window_part_doublings)
            .unwrap_or(u64::MAX);
        let preferred = config
            .preferred_relays
            .iter()
            .map(|relay_url| KnownRelay::Preferred {
                relay_url: relay_url.clone(),
            })
            .collect();
        Self {
            chain,
            relay_filter,
            scorer,
            known_relays: RwLock::new(Arc::new(KnownRelays {
                preferred,
                registered: vec![],
            })),
            failures: RwLock::new(HashMap::new()),
            window_parts: Mutex::new(initial_parts),
            max_window_parts,
            config,
        }
    }

    /// Create a manager that accepts every relay and uses the default score
    pub fn with_defaults(chain: Arc<dyn RelayChain>, config: RelayClientConfig) -> Self {
        Self::new(
            chain,
            config,
            Arc::new(AcceptAllFilter),
            Arc::new(DefaultRelayScore::default()),
        )
    }

    /// Rebuild the candidate list from chain events and drop expired
    /// failures. The new list replaces the old one atomically; readers keep
    /// whichever snapshot they already hold.
    #[instrument(skip(self), err)]
    pub async fn refresh(&self) -> Result<(), RelayClientError> {
        self.prune_failures(now_millis()).await;

        let to_block = self.chain.get_block_number().await?;
        let from_block = to_block.saturating_sub(self.config.relay_lookup_window_blocks);
        let active_managers = self
            .fetch_recently_active_managers(from_block, to_block)
            .await?;

        let registered = self
            .relay_info_for_managers(&active_managers, to_block)
            .await?
            .into_iter()
            .filter(|relay| self.relay_filter.accept(relay))
            .collect::<Vec<_>>();

        let preferred = self.known_relays.read().await.preferred.clone();
        info!(
            preferred = preferred.len(),
            registered = registered.len(),
            active_managers = active_managers.len(),
            "Refreshed known relays"
        );
        *self.known_relays.write().await = Arc::new(KnownRelays {
            preferred,
            registered,
        });
        Ok(())
    }

    /// The current snapshot of known relays
    pub async fn known_relays(&self) -> Arc<KnownRelays> {
        self.known_relays.read().await.clone()
    }

    /// Managers seen in any hub lifecycle event within `[from_block, to_block]`
    async fn fetch_recently_active_managers(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<HashSet<Address>> {
        let events = self
            .get_past_events_in_parts(
                &RelayEventName::ACTIVE_MANAGER_EVENTS,
                &[],
                from_block,
                to_block,
            )
            .await?;
        Ok(events.into_iter().map(|e| e.relay_manager).collect())
    }

    /// Resolve managers to their current registrations, using their full
    /// event history.
    pub async fn get_relay_info_for_managers(
        &self,
        managers: &HashSet<Address>,
    ) -> Result<Vec<RelayCandidate>, RelayClientError> {
        let to_block = self.chain.get_block_number().await?;
        Ok(self.relay_info_for_managers(managers, to_block).await?)
    }

    async fn relay_info_for_managers(
        &self,
        managers: &HashSet<Address>,
        to_block: u64,
    ) -> ChainResult<Vec<RelayCandidate>> {
        if managers.is_empty() {
            return Ok(vec![]);
        }
        let mut names = vec![RelayEventName::RelayServerRegistered];
        names.extend(RelayEventName::EXIT_EVENTS);
        let managers = managers.iter().copied().collect::<Vec<_>>();
        let events = self
            .get_past_events_in_parts(&names, &managers, 0, to_block)
            .await?;
        Ok(merge_relay_events(events))
    }

    /// Fetch events over `[from_block, to_block]` split into the current
    /// number of window parts. When the node refuses a part for holding too
    /// many results, the part count is doubled and the whole range fetched
    /// again, until the cap is reached.
    async fn get_past_events_in_parts(
        &self,
        names: &[RelayEventName],
        managers: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<RelayHubEvent>> {
        let range_len = to_block.saturating_sub(from_block).saturating_add(1);
        loop {
            let parts = *self.window_parts.lock().await;
            match self
                .fetch_ranges(names, managers, split_range(from_block, to_block, parts))
                .await
            {
                Ok(events) => return Ok(events),
                Err(err)
                    if err.is_too_many_results()
                        && parts < self.max_window_parts
                        && parts < range_len =>
                {
                    let doubled = parts.saturating_mul(2).min(self.max_window_parts);
                    warn!(
                        parts,
                        doubled, from_block, to_block, "Too many events in range, splitting further"
                    );
                    let mut window_parts = self.window_parts.lock().await;
                    *window_parts = (*window_parts).max(doubled);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_ranges(
        &self,
        names: &[RelayEventName],
        managers: &[Address],
        ranges: Vec<(u64, u64)>,
    ) -> ChainResult<Vec<RelayHubEvent>> {
        let mut events = vec![];
        for (from, to) in ranges {
            debug!(from, to, "Fetching relay hub events");
            events.extend(self.chain.get_past_events(names, managers, from, to).await?);
        }
        Ok(events)
    }

    /// Candidates grouped in tiers, each tier sorted by descending score.
    /// Preferred relays keep their configured order.
    pub async fn get_relays_sorted_for_transaction(
        &self,
        details: &TransactionDetails,
    ) -> Vec<Vec<KnownRelay>> {
        let relays = self.known_relays().await;
        let failures = self.failures.read().await;

        let mut scored = relays
            .registered
            .iter()
            .map(|relay| {
                let relay_failures = failures
                    .get(&relay.relay_url)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                (
                    self.scorer.score(relay, details, relay_failures),
                    self.scorer.tie_breaker(),
                    relay,
                )
            })
            .collect::<Vec<_>>();
        scored.sort_by(|(a_score, a_tie, _), (b_score, b_tie, _)| {
            b_score.total_cmp(a_score).then_with(|| b_tie.total_cmp(a_tie))
        });

        vec![
            relays.preferred.clone(),
            scored
                .into_iter()
                .map(|(_, _, relay)| KnownRelay::Registered(relay.clone()))
                .collect(),
        ]
    }

    /// Record a failure of a relay. The relay stays a candidate; its score
    /// is lowered until the failure expires.
    pub async fn save_relay_failure(
        &self,
        timestamp_millis: u64,
        relay_manager: Option<Address>,
        relay_url: &str,
    ) {
        warn!(relay_url, ?relay_manager, "Recording relay failure");
        self.failures
            .write()
            .await
            .entry(relay_url.to_owned())
            .or_default()
            .push(RelayFailureRecord {
                relay_url: relay_url.to_owned(),
                relay_manager,
                timestamp_millis,
            });
    }

    /// Record a failure observed now
    pub async fn save_relay_failure_now(&self, relay_manager: Option<Address>, relay_url: &str) {
        self.save_relay_failure(now_millis(), relay_manager, relay_url)
            .await
    }

    /// Recent failures of a relay
    pub async fn relay_failures(&self, relay_url: &str) -> Vec<RelayFailureRecord> {
        self.failures
            .read()
            .await
            .get(relay_url)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop failures older than the grace period
    async fn prune_failures(&self, now_millis: u64) {
        let grace = self.config.relay_timeout_grace_millis();
        let mut failures = self.failures.write().await;
        for records in failures.values_mut() {
            records.retain(|record| now_millis.saturating_sub(record.timestamp_millis) <= grace);
        }
        failures.retain(|_, records| !records.is_empty());
    }
}
