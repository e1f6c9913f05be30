//! DERP map distribution
//!
//! One holder, many readers. Each update gets the next version and replaces
//! the shared map; readers only ever observe whole snapshots and a slow
//! reader skips straight to the newest one.

use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tailnet_proto::DerpMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
pub struct DerpMapDistributor {
    tx: watch::Sender<Arc<DerpMap>>,
}

impl DerpMapDistributor {
    /// Start with `initial` as version 1
    pub fn new(mut initial: DerpMap) -> Self {
        initial.version = 1;
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn current(&self) -> Arc<DerpMap> {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Replace the map and wake every reader. Returns the assigned version.
    pub fn update(&self, mut map: DerpMap) -> u64 {
        let mut version = 0;
        self.tx.send_modify(|current| {
            version = current.version + 1;
            map.version = version;
            *current = Arc::new(map);
        });
        info!(
            version,
            readers = self.tx.receiver_count(),
            "DERP map updated"
        );
        version
    }

    /// Like [`update`](Self::update) but skips maps with the same topology as
    /// the current one
    pub fn update_if_changed(&self, map: DerpMap) -> Option<u64> {
        if self.tx.borrow().same_topology(&map) {
            debug!("DERP map unchanged");
            return None;
        }
        Some(self.update(map))
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DerpMap>> {
        self.tx.subscribe()
    }

    /// The current map followed by every later one, until `cancel` fires
    pub fn stream_for(&self, cancel: CancellationToken) -> BoxStream<'static, Arc<DerpMap>> {
        WatchStream::new(self.tx.subscribe())
            .take_until(cancel.cancelled_owned())
            .boxed()
    }
}

impl Default for DerpMapDistributor {
    fn default() -> Self {
        Self::new(DerpMap::new())
    }
}
