use std::cmp::Ordering;
use std::fmt;

use bitcoin::{BlockHash, Txid};
use bitcoin_hashes::{hex::FromHex, hex::ToHex, sha256, Hash};

use crate::error::GatewayError;

hash_newtype!(ScriptHash, sha256::Hash, 32, doc = "The electrum-style hash of an spk.");
hash_newtype!(StatusHash, sha256::Hash, 32, doc = "The electrum status hash of a script history.");

/// The tip (or any identified block) as `(height, hash)`.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct BlockId(pub u32, pub BlockHash);

impl BlockId {
    pub fn height(&self) -> u32 {
        self.0
    }
    pub fn hash(&self) -> BlockHash {
        self.1
    }
}

/// A bit-prefix selector. `bytes` holds `⌈bits/8⌉` bytes; matching is
/// bitwise, most significant bit first. An empty selector matches anything.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Binary {
    bits: u16,
    bytes: Vec<u8>,
}

impl Binary {
    pub const MAX_BITS: u16 = 256;

    pub fn new(bits: u16, bytes: Vec<u8>) -> Result<Self, GatewayError> {
        if bits > Self::MAX_BITS || bytes.len() != (bits as usize + 7) / 8 {
            return Err(GatewayError::BadStream);
        }
        Ok(Binary { bits, bytes })
    }

    pub fn empty() -> Self {
        Binary::default()
    }

    pub fn from_hex(bits: u16, hex: &str) -> Result<Self, GatewayError> {
        let bytes = Vec::<u8>::from_hex(hex).map_err(|_| GatewayError::BadStream)?;
        Binary::new(bits, bytes)
    }

    /// The full 256 bit selector for a single script hash.
    pub fn from_script_hash(hash: &ScriptHash) -> Self {
        Binary {
            bits: 256,
            bytes: hash.into_inner().to_vec(),
        }
    }

    pub fn bits(&self) -> u16 {
        self.bits
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Whether self is a bitwise (MSB first) prefix of `field`.
    pub fn is_prefix_of(&self, field: &[u8]) -> bool {
        let full = self.bits as usize / 8;
        let rem = self.bits as usize % 8;
        if field.len() * 8 < self.bits as usize {
            return false;
        }
        if self.bytes[..full] != field[..full] {
            return false;
        }
        if rem == 0 {
            return true;
        }
        let mask = 0xffu8 << (8 - rem);
        (self.bytes[full] & mask) == (field[full] & mask)
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Binary({}, {})", self.bits, self.bytes.to_hex())
    }
}

impl serde::Serialize for Binary {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut out = serializer.serialize_struct("Binary", 2)?;
        out.serialize_field("bits", &self.bits)?;
        out.serialize_field("data", &self.bytes.to_hex())?;
        out.end()
    }
}

impl<'de> serde::Deserialize<'de> for Binary {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            bits: u16,
            data: String,
        }
        let wire = Wire::deserialize(deserializer)?;
        Binary::from_hex(wire.bits, &wire.data)
            .map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Copy, Hash)]
pub enum TxStatus {
    Conflicted, // aka double spent
    Unconfirmed,
    Confirmed(u32), // (height)
}

impl TxStatus {
    pub fn new(confirmations: i32, tip_height: u32) -> Self {
        if confirmations > 0 {
            TxStatus::Confirmed(tip_height - (confirmations as u32) + 1)
        } else if confirmations == 0 {
            TxStatus::Unconfirmed
        } else {
            // negative confirmations indicate the tx conflicts with the best chain
            TxStatus::Conflicted
        }
    }

    // height suitable for the electrum protocol
    pub fn electrum_height(&self) -> u32 {
        match self {
            TxStatus::Confirmed(height) => *height,
            TxStatus::Unconfirmed => 0,
            TxStatus::Conflicted => {
                unreachable!("electrum_height() should not be called on conflicted txs")
            }
        }
    }

    pub fn is_viable(&self) -> bool {
        matches!(self, TxStatus::Confirmed(_) | TxStatus::Unconfirmed)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, TxStatus::Confirmed(_))
    }

    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, TxStatus::Unconfirmed)
    }
}

impl Ord for TxStatus {
    fn cmp(&self, other: &TxStatus) -> Ordering {
        match self {
            TxStatus::Confirmed(height) => match other {
                TxStatus::Confirmed(other_height) => height.cmp(other_height),
                TxStatus::Unconfirmed | TxStatus::Conflicted => Ordering::Greater,
            },
            TxStatus::Unconfirmed => match other {
                TxStatus::Confirmed(_) => Ordering::Less,
                TxStatus::Unconfirmed => Ordering::Equal,
                TxStatus::Conflicted => Ordering::Greater,
            },
            TxStatus::Conflicted => match other {
                TxStatus::Confirmed(_) | TxStatus::Unconfirmed => Ordering::Less,
                TxStatus::Conflicted => Ordering::Equal,
            },
        }
    }
}

impl PartialOrd for TxStatus {
    fn partial_cmp(&self, other: &TxStatus) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A script history item, kept by the session index and hashed into the
/// electrum status hash.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct HistoryEntry {
    pub txid: Txid,
    pub status: TxStatus,
}

impl Ord for HistoryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.status
            .cmp(&other.status)
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for HistoryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
    #[serde(skip)]
    pub status: TxStatus,
}

/// The fee facts the estimator needs from one transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxFeeRate {
    pub fee: u64,
    pub bytes: u32,
}

/// Per-block fee rate set, coinbase excluded.
pub type BlockFees = Vec<TxFeeRate>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_prefix_matching() {
        let field = [0b1010_1010u8, 0xff];

        assert!(Binary::empty().is_prefix_of(&field));
        assert!(Binary::new(3, vec![0b1010_0000]).unwrap().is_prefix_of(&field));
        assert!(!Binary::new(3, vec![0b1110_0000]).unwrap().is_prefix_of(&field));
        assert!(Binary::new(8, vec![0b1010_1010]).unwrap().is_prefix_of(&field));
        assert!(Binary::new(16, vec![0b1010_1010, 0xff]).unwrap().is_prefix_of(&field));
        // selector longer than the field never matches
        assert!(!Binary::new(24, vec![0b1010_1010, 0xff, 0x00])
            .unwrap()
            .is_prefix_of(&field));
    }

    #[test]
    fn binary_validation() {
        assert!(Binary::new(8, vec![0x00]).is_ok());
        assert_eq!(Binary::new(8, vec![]), Err(GatewayError::BadStream));
        assert_eq!(Binary::new(9, vec![0x00]), Err(GatewayError::BadStream));
        assert_eq!(Binary::new(300, vec![0; 38]), Err(GatewayError::BadStream));
    }

    #[test]
    fn full_selector_matches_exactly_one_value() {
        let hash = ScriptHash::hash(b"spk");
        let selector = Binary::from_script_hash(&hash);
        assert!(selector.is_prefix_of(&hash.into_inner()));
        let other = ScriptHash::hash(b"other spk");
        assert!(!selector.is_prefix_of(&other.into_inner()));
    }
}
