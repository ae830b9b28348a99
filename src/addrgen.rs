use crate::chain::{ChainError, ChainParams, ExtendedPubKey};
use crate::errors::Error;
use crate::models::FeeXPub;
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

/// The one store operation address generation needs.
pub trait IndexStore: Send + Sync {
    fn set_last_addr_index(&self, xpub_id: u32, idx: u32) -> Result<(), Error>;
}

/// Serialized fee-address generator. All derivation happens on a fixed
/// external branch of the active xpub; the mutex is held across the index
/// persistence so a returned address can never outrun the stored index.
pub struct AddrGen {
    inner: Mutex<Gen>,
    store: Arc<dyn IndexStore>,
    params: Arc<ChainParams>,
}

struct Gen {
    xpub_id: u32,
    branch: ExtendedPubKey,
    last_index: u32,
}

/// Child of the account key that fee addresses derive from.
const EXTERNAL_BRANCH: u32 = 0;

impl AddrGen {
    pub fn new(
        store: Arc<dyn IndexStore>,
        params: Arc<ChainParams>,
        xpub: &FeeXPub,
    ) -> Result<AddrGen, Error> {
        let account = ExtendedPubKey::parse(&xpub.key, &params)
            .map_err(|e| Error::internal(format!("cannot parse fee xpub: {}", e)))?;
        let branch = account
            .child(EXTERNAL_BRANCH)
            .map_err(|e| Error::internal(format!("cannot derive external branch: {}", e)))?;
        Ok(AddrGen {
            inner: Mutex::new(Gen {
                xpub_id: xpub.id,
                branch,
                last_index: xpub.last_used_idx,
            }),
            store,
            params,
        })
    }

    pub fn xpub_id(&self) -> u32 {
        self.inner.lock().xpub_id
    }

    /// Issues the next unused address. Indices whose derivation yields an
    /// invalid curve point are skipped. The new index is persisted before
    /// the in-memory counter moves, so a crash can only lose an index,
    /// never reissue one.
    pub fn next_address(&self) -> Result<(String, u32), Error> {
        let mut gen = self.inner.lock();
        let mut idx = gen.last_index;
        loop {
            idx = idx
                .checked_add(1)
                .ok_or_else(|| Error::internal("fee address index space exhausted"))?;
            match gen.branch.child(idx) {
                Ok(child) => {
                    let addr = child.address(&self.params);
                    self.store.set_last_addr_index(gen.xpub_id, idx)?;
                    gen.last_index = idx;
                    return Ok((addr, idx));
                }
                Err(ChainError::InvalidChild) => {
                    warn!("skipping unusable address index {}", idx);
                    continue;
                }
                Err(e) => {
                    return Err(Error::internal(format!("cannot derive address: {}", e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};
    use std::collections::HashSet;

    struct RecordingStore {
        written: Mutex<Vec<(u32, u32)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingStore {
        fn new() -> Arc<Self> {
            Arc::new(RecordingStore {
                written: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl IndexStore for RecordingStore {
        fn set_last_addr_index(&self, xpub_id: u32, idx: u32) -> Result<(), Error> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::Db("write failed".to_owned()));
            }
            self.written.lock().push((xpub_id, idx));
            Ok(())
        }
    }

    fn test_xpub(params: &ChainParams) -> FeeXPub {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let key = ExtendedPubKey {
            depth: 0,
            parent_fingerprint: [0; 4],
            child_number: 0,
            chain_code: [9u8; 32],
            pubkey: PublicKey::from_secret_key(&secp, &sk),
        };
        FeeXPub {
            id: 3,
            key: key.encode(params),
            last_used_idx: 0,
            retired: 0,
        }
    }

    #[test]
    fn issues_distinct_increasing_indices() {
        let params = Arc::new(ChainParams::simnet());
        let store = RecordingStore::new();
        let gen = AddrGen::new(store.clone(), params.clone(), &test_xpub(&params)).unwrap();

        let mut last = 0;
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let (addr, idx) = gen.next_address().unwrap();
            assert!(idx > last);
            assert!(seen.insert(addr));
            last = idx;
        }
        // Every issuance was persisted under the xpub record's ID.
        let written = store.written.lock();
        assert_eq!(written.len(), 20);
        assert!(written.iter().all(|(id, _)| *id == 3));
        assert_eq!(written.last().unwrap().1, last);
    }

    #[test]
    fn resumes_from_persisted_index() {
        let params = Arc::new(ChainParams::simnet());
        let store = RecordingStore::new();
        let mut xpub = test_xpub(&params);
        xpub.last_used_idx = 41;
        let gen = AddrGen::new(store, params, &xpub).unwrap();
        let (_, idx) = gen.next_address().unwrap();
        assert_eq!(idx, 42);
    }

    #[test]
    fn failed_persistence_does_not_advance() {
        let params = Arc::new(ChainParams::simnet());
        let store = RecordingStore::new();
        let gen = AddrGen::new(store.clone(), params.clone(), &test_xpub(&params)).unwrap();

        store.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(gen.next_address().is_err());
        store.fail.store(false, std::sync::atomic::Ordering::SeqCst);

        // The index that failed to persist is issued again.
        let (_, idx) = gen.next_address().unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn concurrent_issuance_never_shares_an_index() {
        let params = Arc::new(ChainParams::simnet());
        let store = RecordingStore::new();
        let gen = Arc::new(AddrGen::new(store, params.clone(), &test_xpub(&params)).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gen = gen.clone();
            handles.push(std::thread::spawn(move || {
                (0..25)
                    .map(|_| gen.next_address().unwrap())
                    .collect::<Vec<_>>()
            }));
        }
        let mut indices = HashSet::new();
        let mut addrs = HashSet::new();
        for handle in handles {
            for (addr, idx) in handle.join().unwrap() {
                assert!(indices.insert(idx));
                assert!(addrs.insert(addr));
            }
        }
        assert_eq!(indices.len(), 100);
    }
}
