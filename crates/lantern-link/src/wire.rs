//! Link-frame framing.
//!
//! Every frame on the message channel starts with a one-byte discriminator:
//! `0x01` introduces a pairing hello, `0x02` carries opaque mesh payload
//! bytes that are passed up unexamined. The hello is how a node that
//! accepted an inbound subscription learns the subscriber's identity and
//! public keys (a server cannot read its client's endpoints), mirroring the
//! endpoint reads the dialling side performs.

use crate::error::LinkError;
use lantern_crypto::NodeId;

/// Frame discriminator for the pairing hello.
pub const FRAME_HELLO: u8 = 0x01;

/// Frame discriminator for opaque mesh payload.
pub const FRAME_DATA: u8 = 0x02;

/// Fixed-size prefix of the hello body: node id + both public keys.
const HELLO_FIXED_LEN: usize = 16 + 32 + 32 + 1;

/// Pairing hello sent by the dialling side after its endpoint reads
/// complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// The sender's node identifier
    pub node_id: NodeId,
    /// The sender's X25519 agreement public key
    pub agreement_key: [u8; 32],
    /// The sender's Ed25519 signing public key
    pub signing_key: [u8; 32],
    /// The sender's display name
    pub name: String,
}

impl Hello {
    /// Encode into a link frame, discriminator included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let name_len = name.len().min(u8::MAX as usize);

        let mut frame = Vec::with_capacity(1 + HELLO_FIXED_LEN + name_len);
        frame.push(FRAME_HELLO);
        frame.extend_from_slice(self.node_id.as_bytes());
        frame.extend_from_slice(&self.agreement_key);
        frame.extend_from_slice(&self.signing_key);
        frame.push(name_len as u8);
        frame.extend_from_slice(&name[..name_len]);
        frame
    }

    /// Parse a hello body (the frame with its discriminator stripped).
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::MalformedFrame`] if the body is truncated or
    /// the name is not valid UTF-8.
    pub fn parse(body: &[u8]) -> Result<Self, LinkError> {
        if body.len() < HELLO_FIXED_LEN {
            return Err(LinkError::MalformedFrame);
        }

        let mut node_id = [0u8; 16];
        node_id.copy_from_slice(&body[0..16]);
        let mut agreement_key = [0u8; 32];
        agreement_key.copy_from_slice(&body[16..48]);
        let mut signing_key = [0u8; 32];
        signing_key.copy_from_slice(&body[48..80]);

        let name_len = body[80] as usize;
        if body.len() < HELLO_FIXED_LEN + name_len {
            return Err(LinkError::MalformedFrame);
        }
        let name = std::str::from_utf8(&body[81..81 + name_len])
            .map_err(|_| LinkError::MalformedFrame)?
            .to_owned();

        Ok(Self {
            node_id: NodeId::from_bytes(node_id),
            agreement_key,
            signing_key,
            name,
        })
    }
}

/// Wrap mesh payload bytes into a data frame.
#[must_use]
pub fn data_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(FRAME_DATA);
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Hello {
        Hello {
            node_id: NodeId::from_bytes([9u8; 16]),
            agreement_key: [1u8; 32],
            signing_key: [2u8; 32],
            name: "lighthouse".to_owned(),
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = sample();
        let frame = hello.encode();
        assert_eq!(frame[0], FRAME_HELLO);
        assert_eq!(Hello::parse(&frame[1..]).unwrap(), hello);
    }

    #[test]
    fn test_hello_empty_name() {
        let mut hello = sample();
        hello.name.clear();
        let frame = hello.encode();
        assert_eq!(Hello::parse(&frame[1..]).unwrap(), hello);
    }

    #[test]
    fn test_hello_truncated() {
        let frame = sample().encode();
        assert_eq!(
            Hello::parse(&frame[1..40]),
            Err(LinkError::MalformedFrame)
        );
    }

    #[test]
    fn test_hello_name_length_lies() {
        let mut frame = sample().encode();
        frame[81] = 200; // claims a name far past the end
        assert_eq!(Hello::parse(&frame[1..]), Err(LinkError::MalformedFrame));
    }

    #[test]
    fn test_data_frame_prefix() {
        let frame = data_frame(b"payload");
        assert_eq!(frame[0], FRAME_DATA);
        assert_eq!(&frame[1..], b"payload");
    }
}
