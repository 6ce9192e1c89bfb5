//! The radio stack seam.
//!
//! The operating system's radio stack is an external collaborator; the link
//! layer drives it through [`RadioHal`] and receives completions and
//! inbound traffic as [`RadioEvent`]s on a channel. All radio callbacks are
//! funnelled through that single channel, so everything the link layer does
//! happens on one task (the radio context).
//!
//! The mesh service exposes four characteristic endpoints, each with a
//! fixed 128-bit identifier baked into both sides: a bidirectional
//! *message* endpoint plus read-only *device-id*, *agreement-key*, and
//! *signing-key* endpoints.

use crate::error::LinkError;

/// Opaque handle the radio stack assigns to a remote device.
///
/// Handles are local to this node and say nothing about the remote's
/// [`lantern_crypto::NodeId`], which is only learned during pairing.
pub type RadioHandle = u64;

/// The mesh service identifier advertised and scanned for.
pub const MESH_SERVICE_ID: [u8; 16] = [
    0x4c, 0x61, 0x6e, 0x74, 0x65, 0x72, 0x6e, 0x4d, 0x65, 0x73, 0x68, 0x53, 0x76, 0x63, 0x00,
    0x01,
];

/// Identifier of the bidirectional message endpoint.
pub const MESSAGE_ENDPOINT_ID: [u8; 16] = [
    0x4c, 0x61, 0x6e, 0x74, 0x65, 0x72, 0x6e, 0x4d, 0x65, 0x73, 0x68, 0x53, 0x76, 0x63, 0x10,
    0x01,
];

/// Identifier of the read-only device-id endpoint.
pub const DEVICE_ID_ENDPOINT_ID: [u8; 16] = [
    0x4c, 0x61, 0x6e, 0x74, 0x65, 0x72, 0x6e, 0x4d, 0x65, 0x73, 0x68, 0x53, 0x76, 0x63, 0x10,
    0x02,
];

/// Identifier of the read-only agreement-key endpoint.
pub const AGREEMENT_KEY_ENDPOINT_ID: [u8; 16] = [
    0x4c, 0x61, 0x6e, 0x74, 0x65, 0x72, 0x6e, 0x4d, 0x65, 0x73, 0x68, 0x53, 0x76, 0x63, 0x10,
    0x03,
];

/// Identifier of the read-only signing-key endpoint.
pub const SIGNING_KEY_ENDPOINT_ID: [u8; 16] = [
    0x4c, 0x61, 0x6e, 0x74, 0x65, 0x72, 0x6e, 0x4d, 0x65, 0x73, 0x68, 0x53, 0x76, 0x63, 0x10,
    0x04,
];

/// One of the four characteristic endpoints of the mesh service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Bidirectional byte channel (write-with-response + notify)
    Message,
    /// Read-only node identifier
    DeviceId,
    /// Read-only X25519 agreement public key
    AgreementKey,
    /// Read-only Ed25519 signing public key
    SigningKey,
}

/// Values served on this node's read-only endpoints.
#[derive(Debug, Clone)]
pub struct LocalEndpoints {
    /// Bytes served on the device-id endpoint (the 16-byte node id)
    pub device_id: Vec<u8>,
    /// X25519 agreement public key
    pub agreement_key: [u8; 32],
    /// Ed25519 signing public key
    pub signing_key: [u8; 32],
}

/// Events the radio stack delivers to the link layer.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// The radio powered on or off (covers both roles)
    PowerChanged {
        /// Whether both roles are usable
        available: bool,
    },
    /// The scanner saw a device advertising the mesh service
    DeviceDiscovered {
        /// Stack-assigned handle for the device
        handle: RadioHandle,
        /// Signal-strength hint
        rssi: i16,
    },
    /// An outbound connection completed; the message endpoint is
    /// discovered and subscribed
    ConnectComplete {
        /// The connected device
        handle: RadioHandle,
        /// Negotiated maximum transport unit
        mtu: usize,
    },
    /// An outbound connection attempt failed
    ConnectFailed {
        /// The device that could not be reached
        handle: RadioHandle,
    },
    /// An established outbound connection dropped
    Disconnected {
        /// The device that went away
        handle: RadioHandle,
    },
    /// A value read from one of the peer's read-only endpoints
    EndpointValue {
        /// The device the value was read from
        handle: RadioHandle,
        /// Which endpoint produced it
        endpoint: Endpoint,
        /// The raw value
        value: Vec<u8>,
    },
    /// A remote scanner subscribed to our message endpoint
    SubscriberJoined {
        /// Stack-assigned handle for the subscriber
        handle: RadioHandle,
        /// Negotiated maximum transport unit
        mtu: usize,
    },
    /// A subscriber dropped its subscription or disconnected
    SubscriberLeft {
        /// The subscriber that went away
        handle: RadioHandle,
    },
    /// Bytes arrived on the message channel (a write to our endpoint or a
    /// notification from theirs)
    FrameReceived {
        /// The device the frame came from
        handle: RadioHandle,
        /// The frame, opaque at this layer
        bytes: Vec<u8>,
    },
}

/// Operations the link layer can ask of the radio stack.
///
/// All calls are non-blocking; completions arrive as [`RadioEvent`]s.
pub trait RadioHal: Send + Sync {
    /// Set the values served on this node's read-only endpoints.
    fn configure_endpoints(&self, endpoints: LocalEndpoints);

    /// Begin (or restart) advertising the mesh service.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::RadioUnavailable`] if the server role is not
    /// powered on.
    fn start_advertising(&self) -> Result<(), LinkError>;

    /// Begin (or restart) scanning for the mesh service.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::RadioUnavailable`] if the client role is not
    /// powered on.
    fn start_scanning(&self) -> Result<(), LinkError>;

    /// Initiate an outbound connection to a discovered device.
    ///
    /// Completion arrives as [`RadioEvent::ConnectComplete`] or
    /// [`RadioEvent::ConnectFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::RadioUnavailable`] if the radio is off.
    fn connect(&self, handle: RadioHandle) -> Result<(), LinkError>;

    /// Tear down any connection state with a device.
    fn disconnect(&self, handle: RadioHandle);

    /// Request a read of one of the peer's read-only endpoints.
    ///
    /// The value arrives as [`RadioEvent::EndpointValue`].
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::RadioUnavailable`] if the radio is off.
    fn request_endpoint(&self, handle: RadioHandle, endpoint: Endpoint) -> Result<(), LinkError>;

    /// Write a frame to a dialled peer's message endpoint.
    ///
    /// Returns whether the transport accepted the frame; acceptance does
    /// not imply delivery.
    fn write_message(&self, handle: RadioHandle, frame: &[u8]) -> bool;

    /// Notify a subscriber with a frame from our message endpoint.
    ///
    /// Returns whether the transport accepted the frame.
    fn notify_message(&self, handle: RadioHandle, frame: &[u8]) -> bool;
}
