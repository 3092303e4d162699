//! The LE link registry
//!
//! The registry pairs every LE link the application creates or learns about with a shadow
//! L2CAP socket so the kernel's own link bookkeeping stays consistent (see [`shadow`]). It is
//! a small state machine per peer address:
//!
//! ```text
//! absent --intercept_connect--> connecting --connection complete--> connected
//!   ^            |                   |                                  |
//!   |            |              expiry sweep                    disconnection complete
//!   +------------+-------------------+----------------------------------+
//! ```
//!
//! Records are owned by a single address keyed map. The connecting set and the handle map are
//! secondary indices into it and never own anything; all three are only ever mutated by the
//! transition methods here. The registry itself is not synchronized, the caller serializes
//! access with one lock around the whole structure (both the packet reader and the command
//! submitter drive transitions, and a transition includes the blocking shadow connect).
//!
//! [`shadow`]: crate::shadow

use crate::events::LinkEvent;
use crate::shadow::{Shadow, ShadowFactory};
use crate::{AddressType, DeviceAddress};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// How long an intercepted connection attempt may stay in flight before the sweep reclaims it
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Size of the handle index
///
/// Connection handles are folded into this many buckets before indexing, matching the kernel
/// facing behavior this crate has always had. Handles are allocated from zero upwards so the
/// fold is lossless at realistic link counts.
const HANDLE_BUCKETS: u16 = 256;

fn bucket(handle: u16) -> u16 {
    handle % HANDLE_BUCKETS
}

enum LinkState {
    /// A create connection command was intercepted and the completion event is still pending
    Connecting { expires: Instant },
    /// The controller reported the link established
    Connected,
}

/// One tracked peer
///
/// There is exactly one record per address; it changes state in place and its shadow socket
/// closes when the record is dropped.
struct LinkRecord<S> {
    state: LinkState,
    shadow: S,
}

/// The registry of shadowed LE links
pub struct LinkTracker<F: ShadowFactory> {
    factory: F,
    links: BTreeMap<DeviceAddress, LinkRecord<F::Shadow>>,
    /// Addresses whose record is in the connecting state
    connecting: BTreeSet<DeviceAddress>,
    /// Folded connection handle to the address of a connected record
    by_handle: HashMap<u16, DeviceAddress>,
}

impl<F: ShadowFactory> LinkTracker<F> {
    pub fn new(factory: F) -> Self {
        LinkTracker {
            factory,
            links: BTreeMap::new(),
            connecting: BTreeSet::new(),
            by_handle: HashMap::new(),
        }
    }

    /// Replace the shadow factory
    ///
    /// Used when the raw channel is bound and the local adapter identity becomes known.
    /// Existing records keep the shadows they were created with.
    pub(crate) fn set_factory(&mut self, factory: F) {
        self.factory = factory;
    }

    /// An outbound create connection command was intercepted for `address`
    ///
    /// A previously unseen address gets a new record in the connecting state with a fresh
    /// expiry. An address that is already tracked has its shadow torn down and reconnected;
    /// a connecting record also gets its expiry refreshed while a connected one stays
    /// unexpirable (the HCI link is still up during the shadow refresh).
    ///
    /// Returns whether the shadow link ended up connected. On `false` for a new address the
    /// record is rolled back, so the caller can still let the command reach the kernel.
    pub fn intercept_connect(&mut self, address: DeviceAddress, address_type: AddressType, now: Instant) -> bool {
        if let Some(record) = self.links.get_mut(&address) {
            record.shadow.disconnect();
            record.shadow.connect();

            if let LinkState::Connecting { .. } = record.state {
                record.state = LinkState::Connecting {
                    expires: now + CONNECT_TIMEOUT,
                };
            }

            let connected = record.shadow.is_connected();

            log::debug!("shadow link for {} refreshed (connected: {})", address, connected);

            return connected;
        }

        let mut shadow = self.factory.open(address, address_type);

        shadow.connect();

        if !shadow.is_connected() {
            log::debug!("shadow link for {} failed to connect", address);
            return false;
        }

        self.links.insert(
            address,
            LinkRecord {
                state: LinkState::Connecting {
                    expires: now + CONNECT_TIMEOUT,
                },
                shadow,
            },
        );

        self.connecting.insert(address);

        log::debug!("tracking connection attempt to {}", address);

        true
    }

    /// The controller reported an established link
    ///
    /// A connecting record is promoted, a connected record is reused, and an address with no
    /// record at all (a link initiated by the remote peer, or by a command that was not
    /// intercepted) gets one synthesized directly into the connected state. The handle index
    /// is only populated when the record's shadow link is actually connected.
    pub fn on_connection_complete(&mut self, address: DeviceAddress, address_type: AddressType, handle: u16) {
        let shadowed = if let Some(record) = self.links.get_mut(&address) {
            let was_connecting = matches!(record.state, LinkState::Connecting { .. });

            if was_connecting {
                record.state = LinkState::Connected;
                self.connecting.remove(&address);
            }

            let connected = record.shadow.is_connected();

            // a record promoted with a dead shadow is of no use for later bookkeeping
            if was_connecting && !connected {
                self.links.remove(&address);
            }

            connected
        } else {
            let mut shadow = self.factory.open(address, address_type);

            shadow.connect();

            if shadow.is_connected() {
                self.links.insert(
                    address,
                    LinkRecord {
                        state: LinkState::Connected,
                        shadow,
                    },
                );

                true
            } else {
                log::debug!("no shadow link for incoming connection from {}", address);
                false
            }
        };

        if shadowed {
            self.by_handle.insert(bucket(handle), address);

            log::debug!("link to {} established with handle {:#x}", address, handle);
        }
    }

    /// The controller reported a link torn down
    ///
    /// Removes the handle index entry and releases the owning record with it; dropping the
    /// record closes the shadow socket, which is what lets the kernel finish its own
    /// disconnection bookkeeping.
    pub fn on_disconnection_complete(&mut self, handle: u16) {
        if let Some(address) = self.by_handle.remove(&bucket(handle)) {
            self.links.remove(&address);

            log::debug!("link to {} with handle {:#x} released", address, handle);
        }
    }

    /// Reclaim connection attempts whose completion event never arrived
    ///
    /// Only connecting records are swept, and only those whose expiry has passed.
    pub fn cleanup(&mut self, now: Instant) {
        let expired: Vec<DeviceAddress> = self
            .connecting
            .iter()
            .filter(|address| match self.links.get(address) {
                Some(record) => match record.state {
                    LinkState::Connecting { expires } => expires <= now,
                    LinkState::Connected => false,
                },
                None => true,
            })
            .copied()
            .collect();

        for address in expired {
            self.connecting.remove(&address);
            self.links.remove(&address);

            log::debug!("reclaimed abandoned connection attempt to {}", address);
        }
    }

    /// Drive a transition from a decoded inbound event
    pub fn handle_event(&mut self, event: &LinkEvent) {
        match *event {
            LinkEvent::ConnectionComplete {
                handle,
                address,
                address_type,
                ..
            } => self.on_connection_complete(address, address_type, handle),

            LinkEvent::DisconnectionComplete { handle, .. } => self.on_disconnection_complete(handle),
        }
    }

    /// The address a connection handle currently resolves to
    pub fn peer_of(&self, handle: u16) -> Option<DeviceAddress> {
        self.by_handle.get(&bucket(handle)).copied()
    }

    #[cfg(test)]
    fn connecting_expiry(&self, address: &DeviceAddress) -> Option<Instant> {
        match self.links.get(address).map(|record| &record.state) {
            Some(LinkState::Connecting { expires }) => Some(*expires),
            _ => None,
        }
    }

    #[cfg(test)]
    fn is_tracked(&self, address: &DeviceAddress) -> bool {
        self.links.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Shadow whose connect outcome is steered by the test
    struct StubShadow {
        fail: Rc<Cell<bool>>,
        connected: bool,
    }

    impl Shadow for StubShadow {
        fn connect(&mut self) {
            self.connected = !self.fail.get();
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[derive(Default)]
    struct StubFactory {
        fail: Rc<Cell<bool>>,
        opened: Rc<Cell<usize>>,
    }

    impl ShadowFactory for StubFactory {
        type Shadow = StubShadow;

        fn open(&self, _peer: DeviceAddress, _peer_type: AddressType) -> StubShadow {
            self.opened.set(self.opened.get() + 1);

            StubShadow {
                fail: self.fail.clone(),
                connected: false,
            }
        }
    }

    fn tracker() -> (LinkTracker<StubFactory>, Rc<Cell<bool>>, Rc<Cell<usize>>) {
        let factory = StubFactory::default();
        let fail = factory.fail.clone();
        let opened = factory.opened.clone();

        (LinkTracker::new(factory), fail, opened)
    }

    const PEER: DeviceAddress = DeviceAddress([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
    const OTHER: DeviceAddress = DeviceAddress([0x10, 0x11, 0x12, 0x13, 0x14, 0x15]);

    #[test]
    fn interception_creates_one_connecting_record() {
        let (mut tracker, _, opened) = tracker();
        let now = Instant::now();

        assert!(tracker.intercept_connect(PEER, AddressType::Random, now));

        assert_eq!(opened.get(), 1);
        assert!(tracker.connecting.contains(&PEER));
        assert_eq!(tracker.connecting_expiry(&PEER), Some(now + CONNECT_TIMEOUT));
    }

    #[test]
    fn reinterception_refreshes_the_expiry_without_a_duplicate() {
        let (mut tracker, _, opened) = tracker();
        let first = Instant::now();
        let second = first + Duration::from_secs(10);

        assert!(tracker.intercept_connect(PEER, AddressType::Random, first));
        assert!(tracker.intercept_connect(PEER, AddressType::Random, second));

        // the existing shadow was reconnected, not replaced
        assert_eq!(opened.get(), 1);
        assert_eq!(tracker.connecting.len(), 1);
        assert_eq!(tracker.connecting_expiry(&PEER), Some(second + CONNECT_TIMEOUT));
    }

    #[test]
    fn failed_shadow_connect_rolls_the_record_back() {
        let (mut tracker, fail, _) = tracker();

        fail.set(true);

        assert!(!tracker.intercept_connect(PEER, AddressType::Random, Instant::now()));

        assert!(!tracker.is_tracked(&PEER));
        assert!(tracker.connecting.is_empty());
    }

    #[test]
    fn connection_complete_promotes_a_connecting_record() {
        let (mut tracker, _, opened) = tracker();

        tracker.intercept_connect(PEER, AddressType::Random, Instant::now());
        tracker.on_connection_complete(PEER, AddressType::Random, 0x0040);

        assert!(tracker.connecting.is_empty());
        assert_eq!(tracker.peer_of(0x0040), Some(PEER));
        // promotion reuses the record made at interception time
        assert_eq!(opened.get(), 1);
        assert_eq!(tracker.connecting_expiry(&PEER), None);
        assert!(tracker.is_tracked(&PEER));
    }

    #[test]
    fn unknown_connection_complete_synthesizes_a_record() {
        let (mut tracker, _, opened) = tracker();

        tracker.on_connection_complete(PEER, AddressType::Public, 0x0001);

        assert_eq!(opened.get(), 1);
        assert!(tracker.connecting.is_empty());
        assert_eq!(tracker.peer_of(0x0001), Some(PEER));
    }

    #[test]
    fn synthesized_record_with_dead_shadow_is_not_kept() {
        let (mut tracker, fail, _) = tracker();

        fail.set(true);

        tracker.on_connection_complete(PEER, AddressType::Public, 0x0001);

        assert!(!tracker.is_tracked(&PEER));
        assert_eq!(tracker.peer_of(0x0001), None);
    }

    #[test]
    fn promotion_with_a_dead_shadow_drops_the_record() {
        let (mut tracker, fail, _) = tracker();
        let now = Instant::now();

        tracker.intercept_connect(PEER, AddressType::Random, now);

        // the refresh reconnect fails, leaving a connecting record with a dead shadow
        fail.set(true);
        assert!(!tracker.intercept_connect(PEER, AddressType::Random, now));
        assert!(tracker.is_tracked(&PEER));

        tracker.on_connection_complete(PEER, AddressType::Random, 0x0040);

        assert!(!tracker.is_tracked(&PEER));
        assert_eq!(tracker.peer_of(0x0040), None);
        assert!(tracker.connecting.is_empty());
    }

    #[test]
    fn disconnection_releases_the_handle_and_the_record() {
        let (mut tracker, _, _) = tracker();

        tracker.on_connection_complete(PEER, AddressType::Random, 0x0040);
        assert_eq!(tracker.peer_of(0x0040), Some(PEER));

        tracker.on_disconnection_complete(0x0040);

        assert_eq!(tracker.peer_of(0x0040), None);
        assert!(!tracker.is_tracked(&PEER));
    }

    #[test]
    fn disconnection_for_an_unknown_handle_is_a_no_op() {
        let (mut tracker, _, _) = tracker();

        tracker.on_connection_complete(PEER, AddressType::Random, 0x0040);
        tracker.on_disconnection_complete(0x0041);

        assert_eq!(tracker.peer_of(0x0040), Some(PEER));
    }

    #[test]
    fn reinterception_of_a_connected_record_keeps_it_unexpirable() {
        let (mut tracker, _, _) = tracker();
        let now = Instant::now();

        tracker.on_connection_complete(PEER, AddressType::Random, 0x0040);

        assert!(tracker.intercept_connect(PEER, AddressType::Random, now));

        assert!(tracker.connecting.is_empty());
        assert_eq!(tracker.connecting_expiry(&PEER), None);

        // a sweep far in the future must not touch it
        tracker.cleanup(now + CONNECT_TIMEOUT * 10);
        assert!(tracker.is_tracked(&PEER));
    }

    #[test]
    fn cleanup_reclaims_exactly_the_expired_attempts() {
        let (mut tracker, _, _) = tracker();
        let start = Instant::now();

        tracker.intercept_connect(PEER, AddressType::Random, start);
        tracker.intercept_connect(OTHER, AddressType::Public, start + Duration::from_secs(30));

        tracker.cleanup(start + Duration::from_secs(61));

        assert!(!tracker.is_tracked(&PEER));
        assert!(tracker.is_tracked(&OTHER));
        assert_eq!(tracker.connecting.len(), 1);

        tracker.cleanup(start + Duration::from_secs(91));

        assert!(!tracker.is_tracked(&OTHER));
        assert!(tracker.connecting.is_empty());
    }

    #[test]
    fn handles_are_folded_into_the_index_buckets() {
        let (mut tracker, _, _) = tracker();

        tracker.on_connection_complete(PEER, AddressType::Random, 0x0012);
        tracker.on_connection_complete(OTHER, AddressType::Public, 0x0112);

        // the second handle lands in the first one's bucket
        assert_eq!(tracker.peer_of(0x0012), Some(OTHER));

        tracker.on_disconnection_complete(0x0012);

        assert_eq!(tracker.peer_of(0x0112), None);
        assert!(!tracker.is_tracked(&OTHER));
        // the first record is unreachable through the index but still tracked
        assert!(tracker.is_tracked(&PEER));
    }
}
