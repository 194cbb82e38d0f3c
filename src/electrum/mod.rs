use std::fmt;
use std::str::FromStr;

use bitcoin::Txid;
use bitcoin_hashes::{sha256d, Hash};
use serde_json::Value;

use crate::error::{GatewayError, OptionExt, Result};
use crate::query::Query;
use crate::types::TxStatus;

mod server;
pub use server::ElectrumServer;

/// Longest accepted client name for `server.version`.
pub const MAX_CLIENT_NAME: usize = 32;

/// The protocol range this server speaks.
pub const PROTOCOL_MIN: ElectrumVersion = ElectrumVersion::new(1, 1, 0);
pub const PROTOCOL_MAX: ElectrumVersion = ElectrumVersion::new(1, 4, 2);

/// The version a client gets when it does not name one.
const DEFAULT_VERSION: ElectrumVersion = ElectrumVersion::new(1, 4, 0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElectrumVersion {
    major: u8,
    minor: u8,
    patch: u8,
}

impl ElectrumVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        ElectrumVersion {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ElectrumVersion {
    type Err = GatewayError;

    fn from_str(s: &str) -> std::result::Result<Self, GatewayError> {
        let mut parts = s.split('.');
        let mut next = |required: bool| -> std::result::Result<u8, GatewayError> {
            match parts.next() {
                Some(part) => part.parse().map_err(|_| GatewayError::InvalidArgument),
                None if required => Err(GatewayError::InvalidArgument),
                None => Ok(0),
            }
        };
        let version = ElectrumVersion {
            major: next(true)?,
            minor: next(true)?,
            patch: next(false)?,
        };
        if parts.next().is_some() {
            return Err(GatewayError::InvalidArgument);
        }
        Ok(version)
    }
}

impl fmt::Display for ElectrumVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

/// Pick the protocol version from a `server.version` protocol_version
/// parameter: absent/null defaults, a single string pins min and max, a two
/// string array is `[min, max]`. An empty intersection with the server's
/// range fails the handshake.
pub fn negotiate_version(param: &Value) -> std::result::Result<ElectrumVersion, GatewayError> {
    let (client_min, client_max) = match param {
        Value::Null => (DEFAULT_VERSION, DEFAULT_VERSION),
        Value::String(version) => {
            let version: ElectrumVersion = version.parse()?;
            (version, version)
        }
        Value::Array(versions) if versions.len() == 2 => {
            let low = versions[0].as_str().ok_or(GatewayError::InvalidArgument)?;
            let high = versions[1].as_str().ok_or(GatewayError::InvalidArgument)?;
            (low.parse()?, high.parse()?)
        }
        _ => return Err(GatewayError::InvalidArgument),
    };

    let lower = client_min.max(PROTOCOL_MIN);
    let upper = client_max.min(PROTOCOL_MAX);
    if lower > upper {
        return Err(GatewayError::InvalidArgument);
    }
    Ok(upper)
}

/// Client names are logged; anything that is not printable non-space ASCII
/// becomes `*`, oversized names fail the handshake.
pub fn sanitize_client_name(name: &str) -> std::result::Result<String, GatewayError> {
    if name.len() > MAX_CLIENT_NAME {
        return Err(GatewayError::InvalidArgument);
    }
    Ok(name
        .chars()
        .map(|c| if c.is_ascii_graphic() { c } else { '*' })
        .collect())
}

/// The electrum wire encoding of a confirmation state.
pub fn electrum_height(status: TxStatus, has_unconfirmed_parents: Option<bool>) -> i32 {
    match status {
        TxStatus::Confirmed(height) => height as i32,
        TxStatus::Unconfirmed => match has_unconfirmed_parents {
            Some(false) => 0, // all parents confirmed
            // -1 flags unconfirmed parents; unknown errs on the side of caution
            Some(true) | None => -1,
        },
        TxStatus::Conflicted => {
            unreachable!("electrum_height() should not be called on conflicted txs")
        }
    }
}

const VSIZE_BIN_WIDTH: u32 = 50_000; // vbytes

/// The `mempool.get_fee_histogram` shape: `[(feerate, vsize)]` bins of
/// ~50 kvB, highest feerate first, from a verbose getrawmempool reply.
pub fn make_fee_histogram(rawmempool: &Value) -> Result<Vec<(f32, u32)>> {
    let mut entries = rawmempool
        .as_object()
        .or_err("invalid getrawmempool reply")?
        .values()
        .filter_map(|entry| {
            let size = entry["vsize"].as_u64().or_else(|| entry["size"].as_u64())?;
            let fee = entry["fees"]["base"]
                .as_f64()
                .or_else(|| entry["fee"].as_f64())?;
            let feerate = fee as f32 / size as f32 * 100_000_000f32;
            Some((size as u32, feerate))
        })
        .collect::<Vec<(u32, f32)>>();

    entries.sort_unstable_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    let mut histogram = vec![];
    let mut bin_size = 0;
    let mut last_feerate = None;

    for (size, feerate) in entries.into_iter().rev() {
        bin_size += size;
        if bin_size > VSIZE_BIN_WIDTH && last_feerate.map_or(true, |last| feerate > last) {
            // vsize of transactions paying >= feerate
            histogram.push((feerate, bin_size));
            bin_size = 0;
        }
        last_feerate = Some(feerate);
    }

    if let Some(feerate) = last_feerate {
        histogram.push((feerate, bin_size));
    }

    Ok(histogram)
}

/// SPV proof plumbing over the query facade.
pub trait QueryExt {
    fn electrum_merkle_proof(&self, txid: &Txid, height: u32)
        -> Result<(Vec<sha256d::Hash>, usize)>;

    fn electrum_header_merkle_proof(
        &self,
        height: u32,
        cp_height: u32,
    ) -> Result<(Vec<sha256d::Hash>, sha256d::Hash)>;

    fn electrum_id_from_pos(
        &self,
        height: u32,
        tx_pos: usize,
        want_merkle: bool,
    ) -> Result<(Txid, Vec<sha256d::Hash>)>;
}

impl QueryExt for Query {
    fn electrum_merkle_proof(
        &self,
        txid: &Txid,
        height: u32,
    ) -> Result<(Vec<sha256d::Hash>, usize)> {
        let block_hash = self.get_block_hash(height)?;
        let txids = self.get_block_txids(&block_hash)?;
        let pos = txids
            .iter()
            .position(|c_txid| c_txid == txid)
            .or_err("missing tx")?;

        let hashes = txids.into_iter().map(sha256d::Hash::from).collect();
        let (branch, _root) = create_merkle_branch_and_root(hashes, pos);
        Ok((branch, pos))
    }

    fn electrum_header_merkle_proof(
        &self,
        height: u32,
        cp_height: u32,
    ) -> Result<(Vec<sha256d::Hash>, sha256d::Hash)> {
        if cp_height < height {
            bail!("cp_height #{} < height #{}", cp_height, height);
        }

        let best_height = self.get_tip_height()?;
        if best_height < cp_height {
            bail!(
                "cp_height #{} above best block height #{}",
                cp_height,
                best_height
            );
        }

        let header_hashes = (0..=cp_height)
            .map(|height| self.get_block_hash(height).map(sha256d::Hash::from))
            .collect::<Result<Vec<sha256d::Hash>>>()?;

        Ok(create_merkle_branch_and_root(header_hashes, height as usize))
    }

    fn electrum_id_from_pos(
        &self,
        height: u32,
        tx_pos: usize,
        want_merkle: bool,
    ) -> Result<(Txid, Vec<sha256d::Hash>)> {
        let block_hash = self.get_block_hash(height)?;
        let txids = self.get_block_txids(&block_hash)?;
        let txid = *txids
            .get(tx_pos)
            .or_err(format!("No tx in position #{} in block #{}", tx_pos, height))?;

        let branch = if want_merkle {
            let hashes = txids.into_iter().map(sha256d::Hash::from).collect();
            create_merkle_branch_and_root(hashes, tx_pos).0
        } else {
            vec![]
        };
        Ok((txid, branch))
    }
}

fn merklize(left: sha256d::Hash, right: sha256d::Hash) -> sha256d::Hash {
    let data = [&left[..], &right[..]].concat();
    sha256d::Hash::hash(&data)
}

pub(crate) fn create_merkle_branch_and_root(
    mut hashes: Vec<sha256d::Hash>,
    mut index: usize,
) -> (Vec<sha256d::Hash>, sha256d::Hash) {
    let mut merkle = vec![];
    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            let last = *hashes.last().unwrap();
            hashes.push(last);
        }
        index = if index % 2 == 0 { index + 1 } else { index - 1 };
        merkle.push(hashes[index]);
        index /= 2;
        hashes = hashes
            .chunks(2)
            .map(|pair| merklize(pair[0], pair[1]))
            .collect()
    }
    (merkle, hashes[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_negotiation_picks_the_shared_maximum() {
        let negotiated = negotiate_version(&json!(["1.2", "1.5"])).unwrap();
        assert_eq!(negotiated, ElectrumVersion::new(1, 4, 2));
        assert_eq!(negotiated.to_string(), "1.4.2");
    }

    #[test]
    fn version_negotiation_defaults() {
        assert_eq!(
            negotiate_version(&Value::Null).unwrap(),
            ElectrumVersion::new(1, 4, 0)
        );
        assert_eq!(
            negotiate_version(&json!("1.4.2")).unwrap(),
            ElectrumVersion::new(1, 4, 2)
        );
    }

    #[test]
    fn version_negotiation_rejects_empty_intersections() {
        assert_eq!(
            negotiate_version(&json!("0.9")).unwrap_err(),
            GatewayError::InvalidArgument
        );
        assert_eq!(
            negotiate_version(&json!(["2.0", "2.1"])).unwrap_err(),
            GatewayError::InvalidArgument
        );
        assert_eq!(
            negotiate_version(&json!(["1.4"])).unwrap_err(),
            GatewayError::InvalidArgument
        );
        assert_eq!(
            negotiate_version(&json!(42)).unwrap_err(),
            GatewayError::InvalidArgument
        );
    }

    #[test]
    fn client_names_are_escaped() {
        assert_eq!(sanitize_client_name("Electrum/4.1").unwrap(), "Electrum/4.1");
        assert_eq!(sanitize_client_name("bad name\n").unwrap(), "bad*name*");
        assert!(sanitize_client_name("x".repeat(33).as_str()).is_err());
    }

    #[test]
    fn merkle_branch_of_a_lone_hash_is_empty() {
        let hash = sha256d::Hash::hash(b"tx");
        let (branch, root) = create_merkle_branch_and_root(vec![hash], 0);
        assert!(branch.is_empty());
        assert_eq!(root, hash);
    }

    #[test]
    fn merkle_branch_duplicates_odd_tails() {
        let hashes: Vec<sha256d::Hash> = (0u8..3)
            .map(|i| sha256d::Hash::hash(&[i]))
            .collect();
        let (branch, root) = create_merkle_branch_and_root(hashes.clone(), 0);
        assert_eq!(branch.len(), 2);

        // the root must be reproducible by folding the branch back in
        let mut acc = hashes[0];
        acc = merklize(acc, branch[0]);
        acc = merklize(acc, branch[1]);
        assert_eq!(acc, root);
    }

    #[test]
    fn fee_histogram_bins_by_feerate() {
        let mempool = json!({
            "tx1": { "vsize": 60_000, "fees": { "base": 0.006 } },  // 10 sat/vb
            "tx2": { "vsize": 60_000, "fees": { "base": 0.0012 } }, // 2 sat/vb
        });
        let histogram = make_fee_histogram(&mempool).unwrap();
        assert_eq!(histogram.len(), 2);
        assert!(histogram[0].0 > histogram[1].0);
    }
}
