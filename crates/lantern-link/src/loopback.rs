//! In-memory radio stack for tests and simulations.
//!
//! A [`LoopbackHub`] wires any number of [`LoopbackRadio`]s together and
//! plays the part of the ether: `join` puts two radios in range of each
//! other, `sever` takes them out of range (dropping any sessions), and
//! `drop_frames` silently loses a number of upcoming message frames on one
//! direction of a link, which is how tests exercise retransmission.
//!
//! The hub delivers events synchronously on unbounded channels and never
//! blocks, matching the non-blocking contract of [`RadioHal`].

use crate::error::LinkError;
use crate::radio::{Endpoint, LocalEndpoints, RadioEvent, RadioHal, RadioHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Default MTU the loopback negotiates for every session.
pub const LOOPBACK_MTU: usize = 182;

struct RadioSlot {
    events: mpsc::UnboundedSender<RadioEvent>,
    endpoints: Option<LocalEndpoints>,
    powered: bool,
}

#[derive(Default)]
struct HubState {
    radios: HashMap<RadioHandle, RadioSlot>,
    next_handle: RadioHandle,
    /// Unordered pairs of radios in range of each other, with a signal hint.
    links: HashMap<(RadioHandle, RadioHandle), i16>,
    /// Directed initiator -> target sessions.
    connections: HashSet<(RadioHandle, RadioHandle)>,
    /// Pending frame losses per directed (from, to) pair.
    drop_plan: HashMap<(RadioHandle, RadioHandle), u32>,
}

fn pair_key(a: RadioHandle, b: RadioHandle) -> (RadioHandle, RadioHandle) {
    if a <= b { (a, b) } else { (b, a) }
}

/// The shared ether connecting loopback radios.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a new powered-on radio.
    ///
    /// Returns the radio plus the event channel to hand to a link layer. A
    /// `PowerChanged` event is queued immediately.
    #[must_use]
    pub fn attach(&self) -> (Arc<LoopbackRadio>, mpsc::UnboundedReceiver<RadioEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = {
            let mut state = self.lock();
            let handle = state.next_handle;
            state.next_handle += 1;
            state.radios.insert(
                handle,
                RadioSlot {
                    events: events_tx.clone(),
                    endpoints: None,
                    powered: true,
                },
            );
            handle
        };
        let _ = events_tx.send(RadioEvent::PowerChanged { available: true });

        let radio = Arc::new(LoopbackRadio {
            hub: self.clone(),
            handle,
        });
        (radio, events_rx)
    }

    /// Put two radios in range of each other; both scanners see the other.
    pub fn join(&self, a: &LoopbackRadio, b: &LoopbackRadio, rssi: i16) {
        let mut state = self.lock();
        state.links.insert(pair_key(a.handle, b.handle), rssi);
        send_to(&state, a.handle, RadioEvent::DeviceDiscovered {
            handle: b.handle,
            rssi,
        });
        send_to(&state, b.handle, RadioEvent::DeviceDiscovered {
            handle: a.handle,
            rssi,
        });
    }

    /// Take two radios out of range, dropping any sessions between them.
    pub fn sever(&self, a: &LoopbackRadio, b: &LoopbackRadio) {
        let mut state = self.lock();
        state.links.remove(&pair_key(a.handle, b.handle));
        for (initiator, target) in [(a.handle, b.handle), (b.handle, a.handle)] {
            if state.connections.remove(&(initiator, target)) {
                send_to(&state, initiator, RadioEvent::Disconnected { handle: target });
                send_to(&state, target, RadioEvent::SubscriberLeft { handle: initiator });
            }
        }
    }

    /// Silently lose the next `count` message frames sent from `from`
    /// towards `to` (the transport still reports them as accepted).
    pub fn drop_frames(&self, from: &LoopbackRadio, to: &LoopbackRadio, count: u32) {
        let mut state = self.lock();
        *state.drop_plan.entry((from.handle, to.handle)).or_insert(0) += count;
    }
}

fn send_to(state: &HubState, to: RadioHandle, event: RadioEvent) {
    if let Some(slot) = state.radios.get(&to) {
        if slot.powered {
            let _ = slot.events.send(event);
        }
    }
}

/// One radio attached to a [`LoopbackHub`].
pub struct LoopbackRadio {
    hub: LoopbackHub,
    handle: RadioHandle,
}

impl LoopbackRadio {
    /// The hub-global handle other radios see this one under.
    #[must_use]
    pub fn handle(&self) -> RadioHandle {
        self.handle
    }

    fn deliver_frame(&self, to: RadioHandle, frame: &[u8]) -> bool {
        let mut state = self.hub.lock();
        if let Some(pending) = state.drop_plan.get_mut(&(self.handle, to)) {
            if *pending > 0 {
                *pending -= 1;
                tracing::debug!(from = self.handle, to, "loopback dropping frame");
                return true; // accepted by the transport, lost in the ether
            }
        }
        send_to(&state, to, RadioEvent::FrameReceived {
            handle: self.handle,
            bytes: frame.to_vec(),
        });
        true
    }
}

impl RadioHal for LoopbackRadio {
    fn configure_endpoints(&self, endpoints: LocalEndpoints) {
        let mut state = self.hub.lock();
        if let Some(slot) = state.radios.get_mut(&self.handle) {
            slot.endpoints = Some(endpoints);
        }
    }

    fn start_advertising(&self) -> Result<(), LinkError> {
        Ok(())
    }

    fn start_scanning(&self) -> Result<(), LinkError> {
        Ok(())
    }

    fn connect(&self, handle: RadioHandle) -> Result<(), LinkError> {
        let mut state = self.lock_checked()?;
        if state.links.contains_key(&pair_key(self.handle, handle)) {
            state.connections.insert((self.handle, handle));
            send_to(&state, self.handle, RadioEvent::ConnectComplete {
                handle,
                mtu: LOOPBACK_MTU,
            });
            send_to(&state, handle, RadioEvent::SubscriberJoined {
                handle: self.handle,
                mtu: LOOPBACK_MTU,
            });
        } else {
            send_to(&state, self.handle, RadioEvent::ConnectFailed { handle });
        }
        Ok(())
    }

    fn disconnect(&self, handle: RadioHandle) {
        let mut state = self.hub.lock();
        if state.connections.remove(&(self.handle, handle)) {
            send_to(&state, handle, RadioEvent::SubscriberLeft { handle: self.handle });
        }
        if state.connections.remove(&(handle, self.handle)) {
            send_to(&state, handle, RadioEvent::Disconnected { handle: self.handle });
        }
    }

    fn request_endpoint(&self, handle: RadioHandle, endpoint: Endpoint) -> Result<(), LinkError> {
        let state = self.lock_checked()?;
        let Some(remote) = state.radios.get(&handle) else {
            return Ok(());
        };
        let Some(served) = remote.endpoints.as_ref() else {
            return Ok(());
        };
        let value = match endpoint {
            Endpoint::DeviceId => served.device_id.clone(),
            Endpoint::AgreementKey => served.agreement_key.to_vec(),
            Endpoint::SigningKey => served.signing_key.to_vec(),
            Endpoint::Message => return Ok(()),
        };
        send_to(&state, self.handle, RadioEvent::EndpointValue {
            handle,
            endpoint,
            value,
        });
        Ok(())
    }

    fn write_message(&self, handle: RadioHandle, frame: &[u8]) -> bool {
        {
            let state = self.hub.lock();
            if !state.connections.contains(&(self.handle, handle)) {
                return false;
            }
        }
        self.deliver_frame(handle, frame)
    }

    fn notify_message(&self, handle: RadioHandle, frame: &[u8]) -> bool {
        {
            let state = self.hub.lock();
            if !state.connections.contains(&(handle, self.handle)) {
                return false;
            }
        }
        self.deliver_frame(handle, frame)
    }
}

impl LoopbackRadio {
    fn lock_checked(&self) -> Result<MutexGuard<'_, HubState>, LinkError> {
        let state = self.hub.lock();
        let powered = state
            .radios
            .get(&self.handle)
            .is_some_and(|slot| slot.powered);
        if powered {
            Ok(state)
        } else {
            Err(LinkError::RadioUnavailable)
        }
    }
}
