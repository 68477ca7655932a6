//! Raw key-value API
//!
//! Requests and responses of the raw (non-transactional) key-value
//! operations, and the modifications they are turned into.
use binrw::binrw;

use crate::net::{parse_bytes, parse_string, parse_vec, write_bytes, write_string, write_vec};

/// Column family used when the client doesn't care
pub const CF_DEFAULT: &str = "default";

/// Single modification of the key-value storage
#[derive(Clone, Debug, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub enum Modify {
    #[brw(magic(0u8))]
    Put {
        #[br(parse_with(parse_string))]
        #[bw(write_with(write_string))]
        cf: String,
        #[br(parse_with(parse_bytes))]
        #[bw(write_with(write_bytes))]
        key: Vec<u8>,
        #[br(parse_with(parse_bytes))]
        #[bw(write_with(write_bytes))]
        value: Vec<u8>,
    },
    #[brw(magic(1u8))]
    Delete {
        #[br(parse_with(parse_string))]
        #[bw(write_with(write_string))]
        cf: String,
        #[br(parse_with(parse_bytes))]
        #[bw(write_with(write_bytes))]
        key: Vec<u8>,
    },
}

impl Modify {
    pub fn cf(&self) -> &str {
        match self {
            Modify::Put { cf, .. } | Modify::Delete { cf, .. } => cf,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Modify::Put { key, .. } | Modify::Delete { key, .. } => key,
        }
    }
}

/// Ordered list of modifications applied atomically
#[derive(Clone, Debug, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub(crate) struct ModifyBatch {
    #[br(parse_with(parse_vec))]
    #[bw(write_with(write_vec))]
    pub modifies: Vec<Modify>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawGetRequest {
    pub cf: String,
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawGetResponse {
    pub value: Vec<u8>,
    pub not_found: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawPutRequest {
    pub cf: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawPutResponse {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDeleteRequest {
    pub cf: String,
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawDeleteResponse {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawScanRequest {
    pub cf: String,
    pub start_key: Vec<u8>,
    /// Maximum number of pairs to return
    pub limit: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawScanResponse {
    pub kvs: Vec<KvPair>,
}

#[test]
fn modify_batch_payload() {
    let batch = vec![
        Modify::Put {
            cf: CF_DEFAULT.into(),
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        },
        Modify::Delete {
            cf: "lock".into(),
            key: b"b".to_vec(),
        },
    ];

    let bytes = crate::encode_batch(batch.clone()).expect("can't fail");
    let decoded = crate::decode_batch(&bytes).expect("valid");
    assert_eq!(decoded, batch);
    assert_eq!(decoded[1].cf(), "lock");
    assert_eq!(decoded[0].key(), b"a");

    assert!(crate::decode_batch(&[0, 0, 0, 1, 9]).is_err());
}
