//! Bencode metainfo (`.torrent` file) decoding.

use crate::error::Result;
use crate::Sha1Hash;
use sha1::{Digest, Sha1};

/// A parsed `.torrent` file.
#[derive(Clone, Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,

    /// The announce URL of the torrent's UDP tracker, e.g.
    /// `udp://tracker.example.com:6969/announce`.
    pub announce: String,

    /// Additional tracker tiers, per BEP 12. Not currently consulted; the
    /// primary `announce` URL is always used.
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the torrent's info hash: the SHA-1 digest of the bencoded
    /// `info` dictionary, used to identify the torrent to trackers and
    /// peers alike.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The number of pieces the torrent is divided into.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// The expected SHA-1 digest of the piece at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.piece_count()`.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let start = index * 20;
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.info.pieces[start..start + 20]);
        hash
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_piece_count_and_hash() {
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&[1u8; 20]);
        pieces.extend_from_slice(&[2u8; 20]);
        let info = Info {
            name: "file.bin".into(),
            pieces,
            piece_length: 16384,
            length: Some(32000),
            files: None,
            private: None,
        };
        let metainfo = Metainfo {
            info,
            announce: "udp://tracker.example.com:6969/announce".into(),
            announce_list: None,
        };
        assert_eq!(metainfo.piece_count(), 2);
        assert_eq!(metainfo.piece_hash(0), [1u8; 20]);
        assert_eq!(metainfo.piece_hash(1), [2u8; 20]);
    }
}
