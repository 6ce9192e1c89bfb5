//! Chunk encoding and decoding for the mesh wire protocol.
//!
//! A serialised envelope is split into transport-sized chunks, each carrying
//! a fixed 20-byte header in network byte order:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 16 | MessageID |
//! | 16 | 2 | Chunk index (u16) |
//! | 18 | 1 | Total chunks (u8) |
//! | 19 | 1 | Flags |
//!
//! The sender transmits chunks in index order but receivers tolerate any
//! arrival order; reassembly reorders by index.

use crate::envelope::MessageId;
use crate::error::ChunkError;

/// Fixed chunk header size in bytes.
pub const CHUNK_HEADER_SIZE: usize = 20;

/// Flags carried on every chunk of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFlags(u8);

impl ChunkFlags {
    /// First chunk of the message
    pub const FIRST: u8 = 0x01;
    /// Last chunk of the message
    pub const LAST: u8 = 0x02;
    /// The origin asks for an end-to-end delivery acknowledgement
    pub const REQUIRES_ACK: u8 = 0x04;
    /// The chunk was forwarded by a relay, not sent by its origin
    pub const RELAYED: u8 = 0x08;
    /// The enclosed envelope payload is encrypted
    pub const ENCRYPTED: u8 = 0x10;

    /// Empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Wrap a raw flag byte.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag byte.
    #[must_use]
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Set the requires-ack bit.
    #[must_use]
    pub fn with_requires_ack(mut self) -> Self {
        self.0 |= Self::REQUIRES_ACK;
        self
    }

    /// Set the relayed bit.
    #[must_use]
    pub fn with_relayed(mut self) -> Self {
        self.0 |= Self::RELAYED;
        self
    }

    /// Set the encrypted bit.
    #[must_use]
    pub fn with_encrypted(mut self) -> Self {
        self.0 |= Self::ENCRYPTED;
        self
    }

    /// Whether the requires-ack bit is set.
    #[must_use]
    pub fn requires_ack(&self) -> bool {
        self.0 & Self::REQUIRES_ACK != 0
    }

    /// Whether the relayed bit is set.
    #[must_use]
    pub fn relayed(&self) -> bool {
        self.0 & Self::RELAYED != 0
    }

    /// Whether the encrypted bit is set.
    #[must_use]
    pub fn encrypted(&self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Union with another flag set.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// One transport-sized fragment of a serialised envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Identifier of the enclosing message
    pub message_id: MessageId,
    /// 0-based position of this fragment
    pub index: u16,
    /// Number of fragments in the message; immutable across a MessageID
    pub total: u8,
    /// Flag bits
    pub flags: ChunkFlags,
    /// Fragment payload
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Encode header and payload into a wire frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(CHUNK_HEADER_SIZE + self.payload.len());
        frame.extend_from_slice(self.message_id.as_bytes());
        frame.extend_from_slice(&self.index.to_be_bytes());
        frame.push(self.total);
        frame.push(self.flags.bits());
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Parse a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::TooShort`] if the frame is smaller than the
    /// header, [`ChunkError::ZeroTotal`] for a zero chunk count, and
    /// [`ChunkError::IndexOutOfRange`] if the index is not below the total.
    pub fn parse(data: &[u8]) -> Result<Self, ChunkError> {
        if data.len() < CHUNK_HEADER_SIZE {
            return Err(ChunkError::TooShort {
                expected: CHUNK_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&data[0..16]);
        let index = u16::from_be_bytes([data[16], data[17]]);
        let total = data[18];
        let flags = ChunkFlags::from_bits(data[19]);

        if total == 0 {
            return Err(ChunkError::ZeroTotal);
        }
        if index >= u16::from(total) {
            return Err(ChunkError::IndexOutOfRange { index, total });
        }

        Ok(Self {
            message_id: MessageId::from_bytes(id),
            index,
            total,
            flags,
            payload: data[CHUNK_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Largest chunk payload a transport unit can carry.
///
/// # Errors
///
/// Returns [`ChunkError::MtuTooSmall`] if the header does not fit; this is
/// a fatal configuration error.
pub fn max_chunk_payload(mtu: usize) -> Result<usize, ChunkError> {
    if mtu <= CHUNK_HEADER_SIZE {
        return Err(ChunkError::MtuTooSmall { mtu });
    }
    Ok(mtu - CHUNK_HEADER_SIZE)
}

/// Split a serialised message into chunks, in index order.
///
/// The first and last chunks carry the corresponding flags; every chunk
/// carries the caller's base flags. An empty payload still produces one
/// (empty) chunk so the message exists on the wire.
///
/// # Errors
///
/// Returns [`ChunkError::MtuTooSmall`] for an unusable MTU and
/// [`ChunkError::MessageTooLarge`] if the payload exceeds what the one-byte
/// total can count.
pub fn chunks_for(
    message_id: MessageId,
    payload: &[u8],
    flags: ChunkFlags,
    mtu: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    let max_payload = max_chunk_payload(mtu)?;
    let total = payload.len().div_ceil(max_payload).max(1);
    if total > usize::from(u8::MAX) {
        return Err(ChunkError::MessageTooLarge {
            needed: total,
            limit: usize::from(u8::MAX),
        });
    }

    let mut chunks = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * max_payload;
        let end = (start + max_payload).min(payload.len());
        let mut bits = flags.bits();
        if index == 0 {
            bits |= ChunkFlags::FIRST;
        }
        if index == total - 1 {
            bits |= ChunkFlags::LAST;
        }
        chunks.push(Chunk {
            message_id,
            index: index as u16,
            total: total as u8,
            flags: ChunkFlags::from_bits(bits),
            payload: payload[start..end].to_vec(),
        });
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_roundtrip() {
        let chunk = Chunk {
            message_id: MessageId::from_bytes([7u8; 16]),
            index: 3,
            total: 5,
            flags: ChunkFlags::new().with_requires_ack().with_encrypted(),
            payload: b"fragment".to_vec(),
        };
        let parsed = Chunk::parse(&chunk.encode()).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(matches!(
            Chunk::parse(&[0u8; 10]),
            Err(ChunkError::TooShort { .. })
        ));
    }

    #[test]
    fn test_parse_zero_total() {
        let mut frame = Chunk {
            message_id: MessageId::from_bytes([1u8; 16]),
            index: 0,
            total: 1,
            flags: ChunkFlags::new(),
            payload: Vec::new(),
        }
        .encode();
        frame[18] = 0;
        assert_eq!(Chunk::parse(&frame), Err(ChunkError::ZeroTotal));
    }

    #[test]
    fn test_parse_index_out_of_range() {
        let mut frame = Chunk {
            message_id: MessageId::from_bytes([1u8; 16]),
            index: 0,
            total: 2,
            flags: ChunkFlags::new(),
            payload: Vec::new(),
        }
        .encode();
        frame[16] = 0;
        frame[17] = 2; // index == total
        assert!(matches!(
            Chunk::parse(&frame),
            Err(ChunkError::IndexOutOfRange { index: 2, total: 2 })
        ));
    }

    #[test]
    fn test_chunk_count_at_default_mtu() {
        // 1000 bytes at MTU 182 with a 20-byte header is seven chunks.
        let payload = vec![0xAB; 1000];
        let chunks = chunks_for(MessageId::random(), &payload, ChunkFlags::new(), 182).unwrap();
        assert_eq!(chunks.len(), 7);
        assert_eq!(chunks[0].payload.len(), 162);
        assert_eq!(chunks[6].payload.len(), 1000 - 6 * 162);
    }

    #[test]
    fn test_first_and_last_flags() {
        let payload = vec![0u8; 400];
        let chunks = chunks_for(MessageId::random(), &payload, ChunkFlags::new(), 182).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].flags.bits() & ChunkFlags::FIRST, ChunkFlags::FIRST);
        assert_eq!(chunks[0].flags.bits() & ChunkFlags::LAST, 0);
        assert_eq!(chunks[1].flags.bits() & (ChunkFlags::FIRST | ChunkFlags::LAST), 0);
        assert_eq!(chunks[2].flags.bits() & ChunkFlags::LAST, ChunkFlags::LAST);
    }

    #[test]
    fn test_single_chunk_is_first_and_last() {
        let chunks = chunks_for(MessageId::random(), b"hi", ChunkFlags::new(), 182).unwrap();
        assert_eq!(chunks.len(), 1);
        let bits = chunks[0].flags.bits();
        assert_eq!(bits & ChunkFlags::FIRST, ChunkFlags::FIRST);
        assert_eq!(bits & ChunkFlags::LAST, ChunkFlags::LAST);
    }

    #[test]
    fn test_empty_payload_still_one_chunk() {
        let chunks = chunks_for(MessageId::random(), b"", ChunkFlags::new(), 182).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].payload.is_empty());
    }

    #[test]
    fn test_mtu_too_small() {
        assert!(matches!(
            chunks_for(MessageId::random(), b"x", ChunkFlags::new(), CHUNK_HEADER_SIZE),
            Err(ChunkError::MtuTooSmall { .. })
        ));
    }

    #[test]
    fn test_message_too_large() {
        let payload = vec![0u8; 162 * 256];
        assert!(matches!(
            chunks_for(MessageId::random(), &payload, ChunkFlags::new(), 182),
            Err(ChunkError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_base_flags_on_every_chunk() {
        let payload = vec![0u8; 400];
        let flags = ChunkFlags::new().with_requires_ack();
        let chunks = chunks_for(MessageId::random(), &payload, flags, 182).unwrap();
        assert!(chunks.iter().all(|c| c.flags.requires_ack()));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
                let _ = Chunk::parse(&data);
            }

            #[test]
            fn prop_concatenation_restores_payload(
                payload in prop::collection::vec(any::<u8>(), 0..8000),
                mtu in 64usize..512
            ) {
                let chunks = chunks_for(MessageId::random(), &payload, ChunkFlags::new(), mtu);
                prop_assume!(chunks.is_ok());
                let joined: Vec<u8> = chunks
                    .unwrap()
                    .iter()
                    .flat_map(|c| c.payload.iter().copied())
                    .collect();
                prop_assert_eq!(joined, payload);
            }
        }
    }
}
