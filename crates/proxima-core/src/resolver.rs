//! Companion identity resolution.
//!
//! Phones rotate their Bluetooth address, so a companion app exposes a stable
//! identity through a GATT characteristic. For eligible advertisements the
//! resolver connects, reads that characteristic and caches the result per
//! transport identity; later advertisements from the same address adopt the
//! companion id without another handshake.
//!
//! The handshake races against the peripheral dropping the connection and a
//! fixed timeout. A timed-out peripheral is denylisted for a cool-down window;
//! any other failure clears the pending entry so the next advertisement
//! retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::APPLE_COMPANY_ID;
use crate::error::ProximaError;
use crate::radio::{Advertisement, Peripheral, TransportError};
use crate::tag::Tag;

/// GATT service exposed by the companion app.
pub const COMPANION_SERVICE_UUID: Uuid = Uuid::from_u128(0x5403_c8a7_5c96_47e9_9ab8_59e3_73d8_75a7);

/// Characteristic holding the companion identity as UTF-8.
pub const COMPANION_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x21c4_6f33_e813_4407_8601_2ad2_8103_0052);

/// Upper bound for connect + discover + read.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a timed-out peripheral is excluded from resolution.
pub const DENYLIST_COOLDOWN: Duration = Duration::from_secs(3 * 60);

/// Why a handshake did not produce a companion identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The radio operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peripheral dropped the connection mid-handshake.
    #[error("peripheral {peripheral_id} disconnected during handshake")]
    Disconnected {
        /// Transport identity of the peripheral.
        peripheral_id: String,
    },

    /// The handshake did not finish in time.
    #[error("handshake with {peripheral_id} timed out after {secs}s")]
    Timeout {
        /// Transport identity of the peripheral.
        peripheral_id: String,
        /// Timeout that elapsed.
        secs: u64,
    },

    /// The peripheral does not expose a usable companion identity.
    #[error("peripheral {peripheral_id} exposes no companion identity")]
    NoCompanionId {
        /// Transport identity of the peripheral.
        peripheral_id: String,
    },
}

/// What [`CompanionResolver::resolve`] did with an advertisement.
#[derive(Debug)]
pub enum Resolution {
    /// A cached companion identity was applied to the tag.
    Resolved(String),
    /// A handshake for this peripheral is already in flight.
    Pending,
    /// The peripheral is cooling down after a timeout.
    Denylisted,
    /// A new handshake was started.
    Started(JoinHandle<()>),
}

#[derive(Debug, Default)]
struct ResolverState {
    /// Transport id -> companion id; `None` while a handshake is pending.
    cache: HashMap<String, Option<String>>,
    /// Transport id -> end of cool-down.
    denylist: HashMap<String, Instant>,
}

impl ResolverState {
    fn is_denylisted(&mut self, id: &str, now: Instant) -> bool {
        self.denylist.retain(|_, until| *until > now);
        self.denylist.contains_key(id)
    }

    /// Drop a pending entry; resolved entries are never downgraded.
    fn clear_pending(&mut self, id: &str) {
        if matches!(self.cache.get(id), Some(None)) {
            self.cache.remove(id);
        }
    }
}

/// Process-wide companion identity cache and denylist.
#[derive(Debug)]
pub struct CompanionResolver {
    enabled: bool,
    timeout: Duration,
    cooldown: Duration,
    state: Mutex<ResolverState>,
}

impl CompanionResolver {
    /// Create a resolver with the standard timeout and cool-down.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self::with_timing(enabled, HANDSHAKE_TIMEOUT, DENYLIST_COOLDOWN)
    }

    /// Create a resolver with custom timing.
    #[must_use]
    pub fn with_timing(enabled: bool, timeout: Duration, cooldown: Duration) -> Self {
        Self {
            enabled,
            timeout,
            cooldown,
            state: Mutex::new(ResolverState::default()),
        }
    }

    /// Whether `advertisement` may carry a companion identity.
    #[must_use]
    pub fn is_candidate(&self, advertisement: &Advertisement) -> bool {
        let data = &advertisement.manufacturer_data;
        self.enabled
            && advertisement.connectable
            && data.len() > APPLE_COMPANY_ID.len()
            && data.starts_with(&APPLE_COMPANY_ID)
    }

    /// Apply a cached companion identity to `tag`, or start resolving one.
    ///
    /// The check-and-mark happens under one lock, so concurrent advertisements
    /// for the same peripheral start at most one handshake.
    pub fn resolve(self: &Arc<Self>, tag: &mut Tag, advertisement: &Advertisement) -> Resolution {
        let transport_id = advertisement.id.as_str();
        {
            let mut state = self.state();
            match state.cache.get(transport_id) {
                Some(Some(companion)) => {
                    tag.id.clone_from(companion);
                    tag.is_app = true;
                    return Resolution::Resolved(companion.clone());
                }
                Some(None) => return Resolution::Pending,
                None => {}
            }
            if state.is_denylisted(transport_id, Instant::now()) {
                return Resolution::Denylisted;
            }
            state.cache.insert(transport_id.to_string(), None);
        }

        debug!(peripheral_id = transport_id, "Starting companion handshake");
        let resolver = Arc::clone(self);
        let peripheral = Arc::clone(&advertisement.peripheral);
        Resolution::Started(tokio::spawn(async move {
            let outcome = resolver.handshake(peripheral.as_ref()).await;
            if let Err(e) = peripheral.disconnect().await {
                debug!(peripheral_id = peripheral.id(), error = %e, "Disconnect after handshake failed");
            }
            resolver.settle(peripheral.id(), outcome);
        }))
    }

    /// Cached companion identity for a transport id.
    #[must_use]
    pub fn companion_id(&self, transport_id: &str) -> Option<String> {
        self.state().cache.get(transport_id).cloned().flatten()
    }

    /// Whether a transport id is currently cooling down.
    #[must_use]
    pub fn is_denylisted(&self, transport_id: &str) -> bool {
        self.state().is_denylisted(transport_id, Instant::now())
    }

    async fn handshake(&self, peripheral: &dyn Peripheral) -> Result<String, ResolveError> {
        let peripheral_id = peripheral.id().to_string();
        let exchange = async {
            peripheral.connect().await?;
            let value = peripheral
                .read_characteristic(COMPANION_SERVICE_UUID, COMPANION_CHARACTERISTIC_UUID)
                .await?;
            Ok::<_, ResolveError>(value)
        };

        let value = tokio::select! {
            result = exchange => result?,
            () = peripheral.disconnected() => {
                return Err(ResolveError::Disconnected { peripheral_id });
            }
            () = tokio::time::sleep(self.timeout) => {
                return Err(ResolveError::Timeout {
                    peripheral_id,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        value
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(ResolveError::NoCompanionId { peripheral_id })
    }

    fn settle(&self, transport_id: &str, outcome: Result<String, ResolveError>) {
        let mut state = self.state();
        match outcome {
            Ok(companion) => {
                info!(
                    peripheral_id = transport_id,
                    companion_id = %companion,
                    "Discovered companion app"
                );
                state.cache.insert(transport_id.to_string(), Some(companion));
            }
            Err(e @ ResolveError::Timeout { .. }) => {
                let error = ProximaError::from(e);
                warn!(
                    peripheral_id = transport_id,
                    code = error.error_code(),
                    error = %error,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Companion handshake timed out, denylisting peripheral"
                );
                state
                    .denylist
                    .insert(transport_id.to_string(), Instant::now() + self.cooldown);
                state.clear_pending(transport_id);
            }
            Err(e) => {
                let error = ProximaError::from(e);
                debug!(
                    peripheral_id = transport_id,
                    code = error.error_code(),
                    error = %error,
                    "Companion handshake failed, retrying on next advertisement"
                );
                state.clear_pending(transport_id);
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::config::BeaconConfig;
    use crate::radio::mock::{MockPeripheral, ReadBehavior};

    const APPLE_DATA: [u8; 5] = [0x4c, 0x00, 0x10, 0x05, 0x01];

    fn advertise(peripheral: &Arc<MockPeripheral>) -> (Tag, Advertisement) {
        let adv = peripheral.advertisement(-60, APPLE_DATA.to_vec());
        let tag = classify(&adv, &BeaconConfig::default(), &HashMap::new());
        (tag, adv)
    }

    fn started(resolution: Resolution) -> JoinHandle<()> {
        match resolution {
            Resolution::Started(handle) => handle,
            other => panic!("expected a new handshake, got {other:?}"),
        }
    }

    #[test]
    fn test_candidate_gate() {
        let resolver = CompanionResolver::new(true);
        let peripheral = Arc::new(MockPeripheral::new("aabbcc"));

        assert!(resolver.is_candidate(&peripheral.advertisement(-60, APPLE_DATA.to_vec())));
        assert!(!resolver.is_candidate(&peripheral.advertisement(-60, vec![0x4c, 0x00])));
        assert!(!resolver.is_candidate(&peripheral.advertisement(-60, vec![0x59, 0x00, 0x01])));

        let mut not_connectable = peripheral.advertisement(-60, APPLE_DATA.to_vec());
        not_connectable.connectable = false;
        assert!(!resolver.is_candidate(&not_connectable));

        let disabled = CompanionResolver::new(false);
        assert!(!disabled.is_candidate(&peripheral.advertisement(-60, APPLE_DATA.to_vec())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_handshake_is_cached() {
        let resolver = Arc::new(CompanionResolver::new(true));
        let peripheral = Arc::new(MockPeripheral::new("aabbcc").with_companion_id("app-7f3a"));

        let (mut tag, adv) = advertise(&peripheral);
        started(resolver.resolve(&mut tag, &adv)).await.unwrap();
        assert_eq!(resolver.companion_id("aabbcc").as_deref(), Some("app-7f3a"));
        assert_eq!(peripheral.disconnect_count(), 1);

        let (mut tag, adv) = advertise(&peripheral);
        let resolution = resolver.resolve(&mut tag, &adv);
        assert!(matches!(resolution, Resolution::Resolved(ref id) if id == "app-7f3a"));
        assert_eq!(tag.id, "app-7f3a");
        assert!(tag.is_app);
        assert_eq!(tag.peripheral_id, "aabbcc");
        assert_eq!(peripheral.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_advertisements_start_one_handshake() {
        let resolver = Arc::new(CompanionResolver::new(true));
        let peripheral = Arc::new(MockPeripheral::new("aabbcc").with_companion_id("app-7f3a"));

        let (mut first, adv) = advertise(&peripheral);
        let handle = started(resolver.resolve(&mut first, &adv));

        let (mut second, adv) = advertise(&peripheral);
        assert!(matches!(resolver.resolve(&mut second, &adv), Resolution::Pending));
        assert_eq!(second.id, "aabbcc");
        assert!(!second.is_app);

        handle.await.unwrap();
        assert_eq!(peripheral.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_denylists_until_cooldown_expires() {
        let resolver = Arc::new(CompanionResolver::new(true));
        let peripheral =
            Arc::new(MockPeripheral::new("aabbcc").with_read(ReadBehavior::Hang));

        let (mut tag, adv) = advertise(&peripheral);
        started(resolver.resolve(&mut tag, &adv)).await.unwrap();

        assert!(resolver.is_denylisted("aabbcc"));
        assert_eq!(resolver.companion_id("aabbcc"), None);
        assert_eq!(peripheral.disconnect_count(), 1);

        let (mut tag, adv) = advertise(&peripheral);
        assert!(matches!(resolver.resolve(&mut tag, &adv), Resolution::Denylisted));
        assert_eq!(peripheral.connect_count(), 1);

        tokio::time::advance(DENYLIST_COOLDOWN + Duration::from_secs(1)).await;

        let (mut tag, adv) = advertise(&peripheral);
        let retry = started(resolver.resolve(&mut tag, &adv));
        let (mut tag, adv) = advertise(&peripheral);
        assert!(matches!(resolver.resolve(&mut tag, &adv), Resolution::Pending));

        retry.await.unwrap();
        assert_eq!(peripheral.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_retries_without_denylist() {
        let resolver = Arc::new(CompanionResolver::new(true));
        let peripheral = Arc::new(MockPeripheral::new("aabbcc").failing_connect());

        let (mut tag, adv) = advertise(&peripheral);
        started(resolver.resolve(&mut tag, &adv)).await.unwrap();
        assert!(!resolver.is_denylisted("aabbcc"));
        assert_eq!(peripheral.disconnect_count(), 1);

        let (mut tag, adv) = advertise(&peripheral);
        started(resolver.resolve(&mut tag, &adv)).await.unwrap();
        assert_eq!(peripheral.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_disconnect_cancels_handshake() {
        let resolver = Arc::new(CompanionResolver::new(true));
        let peripheral =
            Arc::new(MockPeripheral::new("aabbcc").with_read(ReadBehavior::Hang));
        peripheral.drop_connection();

        let (mut tag, adv) = advertise(&peripheral);
        started(resolver.resolve(&mut tag, &adv)).await.unwrap();

        assert!(!resolver.is_denylisted("aabbcc"));
        assert_eq!(resolver.companion_id("aabbcc"), None);
        assert_eq!(peripheral.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_retried() {
        let resolver = Arc::new(CompanionResolver::new(true));
        let peripheral =
            Arc::new(MockPeripheral::new("aabbcc").with_read(ReadBehavior::Missing));

        let (mut tag, adv) = advertise(&peripheral);
        started(resolver.resolve(&mut tag, &adv)).await.unwrap();

        let (mut tag, adv) = advertise(&peripheral);
        assert!(matches!(resolver.resolve(&mut tag, &adv), Resolution::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_clears_pending_without_denylist() {
        let resolver = Arc::new(CompanionResolver::new(true));
        let peripheral = Arc::new(MockPeripheral::new("aabbcc").with_read(ReadBehavior::Fail));

        let (mut tag, adv) = advertise(&peripheral);
        started(resolver.resolve(&mut tag, &adv)).await.unwrap();

        assert!(!resolver.is_denylisted("aabbcc"));
        assert_eq!(resolver.companion_id("aabbcc"), None);
        assert_eq!(peripheral.disconnect_count(), 1);

        let (mut tag, adv) = advertise(&peripheral);
        let retry = started(resolver.resolve(&mut tag, &adv));
        assert_eq!(tag.id, "aabbcc");
        assert!(!tag.is_app);

        retry.await.unwrap();
        assert_eq!(peripheral.connect_count(), 2);
        assert_eq!(peripheral.disconnect_count(), 2);
    }

    #[test]
    fn test_failure_never_downgrades_resolved_identity() {
        let resolver = CompanionResolver::new(true);
        resolver.settle("aabbcc", Ok("app-7f3a".into()));
        resolver.settle(
            "aabbcc",
            Err(ResolveError::NoCompanionId {
                peripheral_id: "aabbcc".into(),
            }),
        );
        assert_eq!(resolver.companion_id("aabbcc").as_deref(), Some("app-7f3a"));
    }
}
