use ethers::types::{Address, H256};
use sha3::{Digest, Keccak256};

use crate::types::{address_to_bytes32, MessageId, Origin};

/// Derives the canonical message identifier from routing fields.
///
/// The packed layout is fixed and must be reproduced bit-for-bit by every
/// party deriving the identifier, on and off chain:
///
/// ```text
/// nonce    u64  big-endian   8 bytes
/// srcEid   u32  big-endian   4 bytes
/// sender   bytes32          32 bytes
/// dstEid   u32  big-endian   4 bytes
/// receiver bytes32          32 bytes (EVM addresses left-padded)
/// ```
///
/// The identifier is the Keccak-256 digest of those 80 bytes.
pub fn derive(origin: &Origin, dst_eid: u32, receiver: Address) -> MessageId {
    let mut hasher = Keccak256::new();
    hasher.update(origin.nonce.to_be_bytes());
    hasher.update(origin.src_eid.to_be_bytes());
    hasher.update(origin.sender.as_bytes());
    hasher.update(dst_eid.to_be_bytes());
    hasher.update(address_to_bytes32(receiver).as_bytes());

    MessageId::from(H256::from_slice(&hasher.finalize()))
}

/// Keccak-256 over arbitrary message payload bytes, for events that carry
/// the raw payload instead of its hash.
pub fn payload_hash(payload: &[u8]) -> H256 {
    H256::from_slice(&Keccak256::digest(payload))
}

#[cfg(test)]
mod tests {
    use ethers::types::{Address, H256};
    use sha3::{Digest, Keccak256};

    use super::{derive, payload_hash};
    use crate::types::Origin;

    fn origin() -> Origin {
        Origin {
            src_eid: 1,
            sender: "0x000000000000000000000000aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01"
                .parse()
                .unwrap(),
            nonce: 1,
        }
    }

    fn receiver() -> Address {
        "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb02".parse().unwrap()
    }

    #[test]
    fn layout_is_the_documented_packed_encoding() {
        let origin = origin();
        let receiver = receiver();

        let mut packed = Vec::with_capacity(80);
        packed.extend_from_slice(&1u64.to_be_bytes());
        packed.extend_from_slice(&1u32.to_be_bytes());
        packed.extend_from_slice(origin.sender.as_bytes());
        packed.extend_from_slice(&2u32.to_be_bytes());
        packed.extend_from_slice(&[0u8; 12]);
        packed.extend_from_slice(receiver.as_bytes());
        assert_eq!(packed.len(), 80);
        let expected = H256::from_slice(&Keccak256::digest(&packed));

        assert_eq!(derive(&origin, 2, receiver), expected.into());
    }

    #[test]
    fn identical_routing_fields_always_agree() {
        // A verifier derives the id from the send event on the source chain,
        // an executor from the verified event on the destination chain. Both
        // must land on the same identifier.
        let from_send_event = derive(&origin(), 2, receiver());
        let from_verified_event = derive(&origin(), 2, receiver());

        assert_eq!(from_send_event, from_verified_event);
    }

    #[test]
    fn any_field_change_changes_the_identifier() {
        let base = derive(&origin(), 2, receiver());

        let mut other = origin();
        other.nonce = 2;
        assert_ne!(derive(&other, 2, receiver()), base);

        let mut other = origin();
        other.src_eid = 3;
        assert_ne!(derive(&other, 2, receiver()), base);

        assert_ne!(derive(&origin(), 4, receiver()), base);
        assert_ne!(derive(&origin(), 2, Address::zero()), base);
    }

    #[test]
    fn payload_hash_is_keccak_of_the_raw_bytes() {
        let payload = b"hello across chains";

        assert_eq!(
            payload_hash(payload),
            H256::from_slice(&Keccak256::digest(payload))
        );
    }
}
