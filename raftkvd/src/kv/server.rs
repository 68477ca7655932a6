//! Raw key-value API
use convi::CastFrom;
use raftkv_api::{
    KvPair, Modify, RawDeleteRequest, RawDeleteResponse, RawGetRequest, RawGetResponse,
    RawPutRequest, RawPutResponse, RawScanRequest, RawScanResponse,
};
use tracing::trace;

use super::{CfIterator, KvResult, KvStorage, StorageReader};

pub struct Server<S> {
    storage: S,
}

impl<S: KvStorage> Server<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn raw_get(&self, req: RawGetRequest) -> KvResult<RawGetResponse> {
        let reader = self.storage.reader()?;
        Ok(match reader.get_cf(&req.cf, &req.key)? {
            Some(value) => RawGetResponse {
                value,
                not_found: false,
            },
            None => RawGetResponse {
                value: vec![],
                not_found: true,
            },
        })
    }

    pub fn raw_put(&self, req: RawPutRequest) -> KvResult<RawPutResponse> {
        self.storage.write(vec![Modify::Put {
            cf: req.cf,
            key: req.key,
            value: req.value,
        }])?;
        Ok(RawPutResponse {})
    }

    pub fn raw_delete(&self, req: RawDeleteRequest) -> KvResult<RawDeleteResponse> {
        self.storage.write(vec![Modify::Delete {
            cf: req.cf,
            key: req.key,
        }])?;
        Ok(RawDeleteResponse {})
    }

    /// Up to `limit` pairs, starting at `start_key`
    pub fn raw_scan(&self, req: RawScanRequest) -> KvResult<RawScanResponse> {
        let reader = self.storage.reader()?;
        let mut iter = reader.iter_cf(&req.cf);
        iter.seek(&req.start_key);

        let limit = usize::cast_from(req.limit);
        let mut kvs = Vec::new();
        while kvs.len() < limit {
            let Some((key, value)) = iter.item() else {
                break;
            };
            kvs.push(KvPair {
                key: key.to_vec(),
                value: value.to_vec(),
            });
            iter.next();
        }
        trace!(cf = %req.cf, num = kvs.len(), "Scanned");
        Ok(RawScanResponse { kvs })
    }
}
