// Narrow CRDT interface used by the sync manager, and its yrs implementation.

use coedit_common::crdt::origin::UpdateOrigin;
use tokio::sync::mpsc;
use tracing::debug;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::error::CrdtError;

/// What the sync layer needs from a replicated document.
pub trait CrdtDocument {
    /// Keeps the local-update observer alive; dropping it unsubscribes.
    type Subscription;

    fn encode_state_vector(&self) -> Vec<u8>;

    /// Everything this replica has that `state_vector` lacks.
    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError>;

    fn apply_update(&self, update: &[u8], origin: &UpdateOrigin) -> Result<(), CrdtError>;

    /// Streams updates of every transaction not tagged with a remote origin.
    fn observe_local_updates(
        &self,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Self::Subscription, CrdtError>;

    fn merge_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, CrdtError>;
}

/// yrs-backed document holding one shared text.
#[derive(Clone)]
pub struct YrsDocument {
    doc: Doc,
    text_name: String,
}

impl YrsDocument {
    pub fn new(text_name: impl Into<String>) -> Self {
        Self { doc: Doc::new(), text_name: text_name.into() }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64, text_name: impl Into<String>) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options), text_name: text_name.into() }
    }

    pub fn text(&self) -> String {
        let text = self.doc.get_or_insert_text(self.text_name.as_str());
        text.get_string(&self.doc.transact())
    }

    pub fn text_len(&self) -> u32 {
        let text = self.doc.get_or_insert_text(self.text_name.as_str());
        text.len(&self.doc.transact())
    }

    /// Local edit; observed and streamed to the connected peer.
    pub fn insert_text(&self, index: u32, content: &str) {
        let text = self.doc.get_or_insert_text(self.text_name.as_str());
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, content);
    }

    pub fn push_text(&self, content: &str) {
        self.insert_text(self.text_len(), content);
    }

    pub fn remove_text(&self, index: u32, len: u32) {
        let text = self.doc.get_or_insert_text(self.text_name.as_str());
        let mut txn = self.doc.transact_mut();
        text.remove_range(&mut txn, index, len);
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl CrdtDocument for YrsDocument {
    type Subscription = yrs::Subscription;

    fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|error| CrdtError::StateVector(error.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    fn apply_update(&self, update: &[u8], origin: &UpdateOrigin) -> Result<(), CrdtError> {
        let update = Update::decode_v1(update).map_err(|error| CrdtError::Decode(error.to_string()))?;
        let tag = origin.to_tag()?;
        let mut txn = self.doc.transact_mut_with(tag.as_str());
        txn.apply_update(update).map_err(|error| CrdtError::Apply(error.to_string()))
    }

    fn observe_local_updates(
        &self,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Self::Subscription, CrdtError> {
        self.doc
            .observe_update_v1(move |txn, event| {
                let remote = txn
                    .origin()
                    .and_then(|origin| UpdateOrigin::from_bytes(origin.as_ref()).ok())
                    .is_some_and(|origin| origin.is_remote());
                if remote {
                    return;
                }
                if sink.send(event.update.clone()).is_err() {
                    debug!("local update observer outlived its receiver");
                }
            })
            .map_err(|error| CrdtError::Observe(error.to_string()))
    }

    fn merge_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, CrdtError> {
        let slices: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
        yrs::merge_updates_v1(&slices).map_err(|error| CrdtError::Merge(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_against_remote_state_vector_converges() {
        let a = YrsDocument::with_client_id(1, "shared");
        let b = YrsDocument::with_client_id(2, "shared");
        a.insert_text(0, "hello");

        let diff = a.encode_diff(&b.encode_state_vector()).expect("diff");
        b.apply_update(&diff, &UpdateOrigin::remote("a")).expect("apply");
        assert_eq!(b.text(), "hello");
    }

    #[test]
    fn remote_origin_updates_are_not_observed() {
        let a = YrsDocument::with_client_id(1, "shared");
        let b = YrsDocument::with_client_id(2, "shared");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = b.observe_local_updates(tx).expect("observe");

        a.insert_text(0, "remote");
        let diff = a.encode_diff(&b.encode_state_vector()).expect("diff");
        b.apply_update(&diff, &UpdateOrigin::remote("a")).expect("apply");
        assert!(rx.try_recv().is_err());

        b.push_text(" local");
        let update = rx.try_recv().expect("local edit should be observed");
        assert!(!update.is_empty());
        assert_eq!(b.text(), "remote local");
    }

    #[test]
    fn dropping_subscription_stops_observation() {
        let doc = YrsDocument::with_client_id(1, "shared");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = doc.observe_local_updates(tx).expect("observe");
        drop(subscription);

        doc.insert_text(0, "quiet");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn merged_updates_apply_as_one() {
        let a = YrsDocument::with_client_id(1, "shared");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = a.observe_local_updates(tx).expect("observe");
        a.insert_text(0, "he");
        a.push_text("llo");
        a.remove_text(0, 1);

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert_eq!(updates.len(), 3);

        let merged = a.merge_updates(&updates).expect("merge");
        let b = YrsDocument::with_client_id(2, "shared");
        b.apply_update(&merged, &UpdateOrigin::remote("a")).expect("apply merged");
        assert_eq!(b.text(), "ello");
    }

    #[test]
    fn garbage_update_is_rejected() {
        let doc = YrsDocument::new("shared");
        let error = doc.apply_update(&[0xff, 0x00, 0x13], &UpdateOrigin::remote("x"));
        assert!(error.is_err());
        assert!(doc.encode_diff(&[0xff, 0xff, 0xff]).is_err());
    }
}
