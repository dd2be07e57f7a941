//! Peer layer interface
//!
//! The wire protocol lives elsewhere; the pipelines only ever fire block
//! requests and offers at it and poll pending state. Upload confirmations
//! arrive on a channel so the manager never blocks on the network.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use tessera_core::Key;

/// Fire-and-forget view of the peer wire layer.
pub trait PeerTransport: Send + Sync {
    /// Ask the network for a block. Arrival shows up in the block store.
    fn request_block(&self, key: &Key);

    /// Offer a locally held block to the network.
    fn offer_block(&self, key: &Key);

    /// True while a request for this key is in flight.
    fn is_download_pending(&self, key: &Key) -> bool;

    /// True while an offer for this key is in flight.
    fn is_upload_pending(&self, key: &Key) -> bool;
}

/// In-process transport that confirms every offer immediately and treats
/// every requested block as already local. Used in tests and for
/// single-node operation.
pub struct LoopbackPeer {
    confirmations: Sender<Key>,
}

impl LoopbackPeer {
    /// Returns the peer and the upload-confirmation stream it feeds.
    pub fn new() -> (Arc<Self>, Receiver<Key>) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { confirmations: tx }), rx)
    }
}

impl PeerTransport for LoopbackPeer {
    fn request_block(&self, _key: &Key) {}

    fn offer_block(&self, key: &Key) {
        let _ = self.confirmations.send(*key);
    }

    fn is_download_pending(&self, _key: &Key) -> bool {
        false
    }

    fn is_upload_pending(&self, _key: &Key) -> bool {
        false
    }
}
