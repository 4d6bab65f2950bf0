use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use derive_new::new;
use ethers::types::{Address, U256};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use relay_core::{KnownRelay, PingResponse, RelayCandidate};

use crate::{KnownRelaysManager, RelayClientError, RelayHttpClient};

/// Decides whether a relay that answered a ping can serve a transaction.
pub trait PingFilter: Send + Sync + Debug {
    /// `Ok` if the relay is usable at the given gas price
    fn check(
        &self,
        relay_url: &str,
        ping: &PingResponse,
        gas_price: U256,
    ) -> Result<(), RelayClientError>;
}

/// Rejects relays that are not ready, want a higher gas price than offered,
/// or serve another hub.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPingFilter {
    relay_hub: Address,
}

impl DefaultPingFilter {
    /// Filter for relays of the given hub
    pub fn new(relay_hub: Address) -> Self {
        Self { relay_hub }
    }
}

impl PingFilter for DefaultPingFilter {
    fn check(
        &self,
        relay_url: &str,
        ping: &PingResponse,
        gas_price: U256,
    ) -> Result<(), RelayClientError> {
        if !ping.ready {
            return Err(RelayClientError::RelayNotReady {
                url: relay_url.to_owned(),
            });
        }
        if ping.min_gas_price > gas_price {
            return Err(RelayClientError::GasPriceTooLow {
                url: relay_url.to_owned(),
                min_gas_price: ping.min_gas_price,
                gas_price,
            });
        }
        if ping.relay_hub_address != self.relay_hub {
            return Err(RelayClientError::WrongHub {
                url: relay_url.to_owned(),
                relay_hub: ping.relay_hub_address,
            });
        }
        Ok(())
    }
}

/// A relay that answered a ping and passed the ping filter.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct ActiveRelay {
    /// The relay with its fees. Preferred relays are resolved through the
    /// manager they advertise.
    pub relay: RelayCandidate,
    /// What the relay answered
    pub ping_response: PingResponse,
}

/// Picks relays for one relayed transaction.
///
/// Candidates are consumed tier by tier. Each [`RelaySelector::select_next`]
/// pings a slice of the remaining candidates of the current tier concurrently
/// and returns the first that answers and passes the filter. Relays that
/// failed before the winner answered are dropped; relays whose ping was
/// abandoned stay for the next call. A slice where every ping fails is
/// dropped as a whole.
#[derive(Debug)]
pub struct RelaySelector {
    http: Arc<dyn RelayHttpClient>,
    known_relays: Arc<KnownRelaysManager>,
    ping_filter: Arc<dyn PingFilter>,
    gas_price: U256,
    paymaster: Option<Address>,
    slice_size: usize,
    tiers: VecDeque<Vec<KnownRelay>>,
    returned: HashSet<String>,
    ping_errors: HashMap<String, RelayClientError>,
}

impl RelaySelector {
    /// Create a selector over already sorted tiers
    pub fn new(
        http: Arc<dyn RelayHttpClient>,
        known_relays: Arc<KnownRelaysManager>,
        ping_filter: Arc<dyn PingFilter>,
        tiers: Vec<Vec<KnownRelay>>,
        gas_price: U256,
        paymaster: Option<Address>,
        slice_size: usize,
    ) -> Self {
        Self {
            http,
            known_relays,
            ping_filter,
            gas_price,
            paymaster,
            slice_size: slice_size.max(1),
            tiers: tiers.into(),
            returned: HashSet::new(),
            ping_errors: HashMap::new(),
        }
    }

    /// Errors of relays that failed their ping, by relay URL
    pub fn ping_errors(&self) -> &HashMap<String, RelayClientError> {
        &self.ping_errors
    }

    /// Take the collected ping errors
    pub fn into_ping_errors(self) -> HashMap<String, RelayClientError> {
        self.ping_errors
    }

    /// The next healthy relay, or `None` once every tier is exhausted.
    pub async fn select_next(&mut self) -> Option<ActiveRelay> {
        loop {
            self.drop_exhausted_tiers();
            let slice = self
                .tiers
                .front()?
                .iter()
                .take(self.slice_size)
                .cloned()
                .collect::<Vec<_>>();

            let (winner, failed) = self.race_pings(&slice).await;
            let tier = self.tiers.front_mut()?;
            match winner {
                Some((relay, ping)) => {
                    tier.retain(|r| {
                        r.relay_url() != relay.relay_url() && !failed.contains(r.relay_url())
                    });
                    self.returned.insert(relay.relay_url().to_owned());
                    info!(relay_url = relay.relay_url(), "Selected relay");
                    return Some(self.resolve(relay, ping).await);
                }
                None => {
                    debug!(count = slice.len(), "Every relay in slice failed, dropping slice");
                    tier.drain(..slice.len().min(tier.len()));
                }
            }
        }
    }

    fn drop_exhausted_tiers(&mut self) {
        let returned = &self.returned;
        for tier in self.tiers.iter_mut() {
            tier.retain(|relay| !returned.contains(relay.relay_url()));
        }
        while matches!(self.tiers.front(), Some(tier) if tier.is_empty()) {
            self.tiers.pop_front();
        }
    }

    /// Ping every relay of the slice concurrently. Returns the first relay
    /// that passes, and the URLs of relays that failed before it did. The
    /// remaining pings are abandoned.
    async fn race_pings(
        &mut self,
        slice: &[KnownRelay],
    ) -> (Option<(KnownRelay, PingResponse)>, HashSet<String>) {
        let mut pings = slice
            .iter()
            .map(|relay| {
                let http = self.http.clone();
                let filter = self.ping_filter.clone();
                let (gas_price, paymaster) = (self.gas_price, self.paymaster);
                async move {
                    let url = relay.relay_url();
                    let result = http
                        .get_ping_response(url, paymaster)
                        .await
                        .and_then(|ping| filter.check(url, &ping, gas_price).map(|_| ping));
                    (relay, result)
                }
            })
            .collect::<FuturesUnordered<_>>();

        let mut failed = HashSet::new();
        while let Some((relay, result)) = pings.next().await {
            match result {
                Ok(ping) => return (Some((relay.clone(), ping)), failed),
                Err(err) => {
                    debug!(relay_url = relay.relay_url(), %err, "Relay failed ping");
                    failed.insert(relay.relay_url().to_owned());
                    self.ping_errors.insert(relay.relay_url().to_owned(), err);
                }
            }
        }
        (None, failed)
    }

    async fn resolve(&self, relay: KnownRelay, ping: PingResponse) -> ActiveRelay {
        let relay = match relay {
            KnownRelay::Registered(candidate) => candidate,
            KnownRelay::Preferred { relay_url } => {
                let manager = ping.relay_manager_address;
                let registration = match self
                    .known_relays
                    .get_relay_info_for_managers(&HashSet::from([manager]))
                    .await
                {
                    Ok(relays) => relays.into_iter().find(|r| r.relay_manager == manager),
                    Err(err) => {
                        warn!(relay_url, %err, "Failed to look up preferred relay registration");
                        None
                    }
                };
                match registration {
                    Some(registration) => RelayCandidate {
                        relay_url,
                        ..registration
                    },
                    None => {
                        warn!(
                            relay_url,
                            ?manager,
                            "Preferred relay is not registered, assuming zero fees"
                        );
                        RelayCandidate {
                            relay_url,
                            relay_manager: manager,
                            pct_relay_fee: U256::zero(),
                            base_relay_fee: U256::zero(),
                            registered_at_block: 0,
                            registered_at_tx_index: 0,
                        }
                    }
                }
            }
        };
        ActiveRelay::new(relay, ping)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use ethers::types::Bytes;

    use relay_core::{test_utils::MockRelayChain, RelayTransactionRequest};

    use super::*;
    use crate::RelayClientConfig;

    const HUB: Address = Address::repeat_byte(0xaa);

    fn ping(manager: u8) -> PingResponse {
        PingResponse {
            relay_worker_address: Address::repeat_byte(manager + 100),
            relay_manager_address: Address::repeat_byte(manager),
            relay_hub_address: HUB,
            min_gas_price: U256::from(1),
            max_acceptance_budget: U256::from(285_252),
            ready: true,
            version: "2.2.0".into(),
        }
    }

    /// Answers pings from a table; unknown URLs fail. Each entry carries a
    /// delay so races can be ordered.
    #[derive(Debug, Default)]
    struct FakePings {
        answers: HashMap<String, (u64, Option<PingResponse>)>,
        pinged: Mutex<Vec<String>>,
    }

    impl FakePings {
        fn with(mut self, url: &str, delay_ms: u64, answer: Option<PingResponse>) -> Self {
            self.answers.insert(url.into(), (delay_ms, answer));
            self
        }
    }

    #[async_trait]
    impl RelayHttpClient for FakePings {
        async fn get_ping_response(
            &self,
            relay_url: &str,
            _paymaster: Option<Address>,
        ) -> Result<PingResponse, RelayClientError> {
            self.pinged.lock().unwrap().push(relay_url.to_owned());
            let (delay, answer) = self.answers.get(relay_url).cloned().unwrap_or((0, None));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            answer.ok_or_else(|| RelayClientError::Timeout {
                url: relay_url.to_owned(),
            })
        }

        async fn relay_transaction(
            &self,
            relay_url: &str,
            _request: &RelayTransactionRequest,
        ) -> Result<Bytes, RelayClientError> {
            Err(RelayClientError::Timeout {
                url: relay_url.to_owned(),
            })
        }
    }

    fn registered(n: u8) -> KnownRelay {
        KnownRelay::Registered(RelayCandidate {
            relay_url: format!("http://relay-{n}"),
            relay_manager: Address::repeat_byte(n),
            pct_relay_fee: U256::from(n),
            base_relay_fee: U256::zero(),
            registered_at_block: 1,
            registered_at_tx_index: n as u64,
        })
    }

    fn selector(
        http: FakePings,
        chain: MockRelayChain,
        tiers: Vec<Vec<KnownRelay>>,
        slice_size: usize,
    ) -> RelaySelector {
        let known =
            KnownRelaysManager::with_defaults(Arc::new(chain), RelayClientConfig::default());
        RelaySelector::new(
            Arc::new(http),
            Arc::new(known),
            Arc::new(DefaultPingFilter::new(HUB)),
            tiers,
            U256::from(10),
            None,
            slice_size,
        )
    }

    #[test]
    fn default_filter_rejects_unready_expensive_and_foreign_relays() {
        let filter = DefaultPingFilter::new(HUB);
        let gas_price = U256::from(10);
        assert!(filter.check("u", &ping(1), gas_price).is_ok());

        let unready = PingResponse {
            ready: false,
            ..ping(1)
        };
        assert!(matches!(
            filter.check("u", &unready, gas_price),
            Err(RelayClientError::RelayNotReady { .. })
        ));

        let expensive = PingResponse {
            min_gas_price: U256::from(11),
            ..ping(1)
        };
        assert!(matches!(
            filter.check("u", &expensive, gas_price),
            Err(RelayClientError::GasPriceTooLow { .. })
        ));

        let foreign = PingResponse {
            relay_hub_address: Address::repeat_byte(0xbb),
            ..ping(1)
        };
        assert!(matches!(
            filter.check("u", &foreign, gas_price),
            Err(RelayClientError::WrongHub { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_healthy_relay_of_the_slice_wins() {
        let http = FakePings::default()
            .with("http://relay-1", 50, Some(ping(1)))
            .with("http://relay-2", 10, Some(ping(2)))
            .with("http://relay-3", 1, None);
        let tiers = vec![vec![registered(1), registered(2), registered(3)]];
        let mut selector = selector(http, MockRelayChain::new(), tiers, 3);

        let active = selector.select_next().await.unwrap();
        assert_eq!(active.relay.relay_url, "http://relay-2");
        assert_eq!(
            selector.ping_errors().keys().collect::<Vec<_>>(),
            vec!["http://relay-3"]
        );

        // the abandoned ping of relay-1 is retried, relay-3 is not
        let active = selector.select_next().await.unwrap();
        assert_eq!(active.relay.relay_url, "http://relay-1");
        assert!(selector.select_next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_slice_is_dropped_and_next_slice_tried() {
        let http = FakePings::default().with("http://relay-3", 0, Some(ping(3)));
        let tiers = vec![vec![registered(1), registered(2), registered(3)]];
        let mut selector = selector(http, MockRelayChain::new(), tiers, 2);

        let active = selector.select_next().await.unwrap();
        assert_eq!(active.relay.relay_url, "http://relay-3");
        assert_eq!(selector.ping_errors().len(), 2);
        assert!(selector.select_next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn never_returns_a_relay_twice() {
        let http = FakePings::default()
            .with("http://relay-1", 0, Some(ping(1)))
            .with("http://relay-2", 0, Some(ping(2)));
        // the same relay listed in both tiers
        let tiers = vec![vec![registered(1)], vec![registered(1), registered(2)]];
        let mut selector = selector(http, MockRelayChain::new(), tiers, 3);

        let mut urls = vec![];
        while let Some(active) = selector.select_next().await {
            urls.push(active.relay.relay_url);
        }
        assert_eq!(urls, vec!["http://relay-1", "http://relay-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn preferred_tier_is_tried_first() {
        let http = FakePings::default()
            .with("http://preferred", 100, Some(ping(7)))
            .with("http://relay-1", 0, Some(ping(1)));
        let mut chain = MockRelayChain::new();
        chain.expect_get_block_number().returning(|| Ok(10));
        chain
            .expect_get_past_events()
            .returning(|_, _, _, _| Ok(vec![]));
        let tiers = vec![
            vec![KnownRelay::Preferred {
                relay_url: "http://preferred".into(),
            }],
            vec![registered(1)],
        ];
        let mut selector = selector(http, chain, tiers, 3);

        let active = selector.select_next().await.unwrap();
        assert_eq!(active.relay.relay_url, "http://preferred");
        // unregistered preferred relay gets zero fees
        assert_eq!(active.relay.relay_manager, Address::repeat_byte(7));
        assert_eq!(active.relay.pct_relay_fee, U256::zero());
    }

    #[tokio::test]
    async fn empty_tiers_yield_nothing() {
        let mut selector = selector(
            FakePings::default(),
            MockRelayChain::new(),
            vec![vec![], vec![]],
            3,
        );
        assert!(selector.select_next().await.is_none());
        assert!(selector.into_ping_errors().is_empty());
    }
}
