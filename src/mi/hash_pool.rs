//! Bounds how many trace digests run concurrently.
//!
//! The `Compress` pipeline stage runs with a fixed worker count:
//! `HashPool` is a thin `Semaphore` wrapper sized to that, so digesting a
//! burst of freshly preprocessed traces can't spawn unbounded concurrent
//! MD5 work. Mirrors the bounded-worker-count-via-`Semaphore` shape of
//! `KumoCorp-kumomta`'s `kumod/src/logging/hooks.rs`.

use tokio::sync::Semaphore;

use crate::entry::Trace;

use super::whole_trace::digest_trace;

pub struct HashPool {
    semaphore: Semaphore,
}

impl HashPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity.max(1)),
        }
    }

    /// Digests `trace` under the pool's concurrency bound.
    pub async fn digest(&self, trace: &Trace, granularity: u32) -> [u8; 16] {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("HashPool semaphore is never closed");
        digest_trace(trace, granularity)
    }
}
