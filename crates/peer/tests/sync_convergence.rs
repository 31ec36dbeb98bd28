use coedit_common::protocol::peer::decode_message;
use coedit_peer::{DebounceConfig, SyncManager, YrsDocument};
use proptest::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;

type Manager = SyncManager<YrsDocument, mpsc::UnboundedSender<String>>;

#[derive(Debug, Clone)]
enum Edit {
    Insert { at: u32, text: String },
    Remove { at: u32, len: u32 },
}

fn edit_strategy() -> impl Strategy<Value = (bool, Edit)> {
    let edit = prop_oneof![
        (any::<u32>(), "[a-z ]{1,6}").prop_map(|(at, text)| Edit::Insert { at, text }),
        (any::<u32>(), 1u32..4).prop_map(|(at, len)| Edit::Remove { at, len }),
    ];
    (any::<bool>(), edit)
}

struct Replica {
    manager: Manager,
    doc: YrsDocument,
    wire: mpsc::UnboundedReceiver<String>,
    updates: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Replica {
    fn new(client_id: u64, remote: &str) -> Self {
        let (tx, wire) = mpsc::unbounded_channel();
        let doc = YrsDocument::with_client_id(client_id, "shared");
        let mut manager = SyncManager::new(doc.clone(), tx, remote, DebounceConfig::default());
        let updates = manager.start().expect("sync should start");
        Self { manager, doc, wire, updates }
    }

    fn apply(&mut self, edit: &Edit) {
        let len = self.doc.text_len();
        match edit {
            Edit::Insert { at, text } => self.doc.insert_text(at % (len + 1), text),
            Edit::Remove { at, len: count } if len > 0 => {
                let start = at % len;
                self.doc.remove_text(start, (*count).min(len - start));
            }
            Edit::Remove { .. } => {}
        }
        let now = Instant::now();
        while let Ok(update) = self.updates.try_recv() {
            self.manager.on_local_update_at(update, now);
        }
    }

    fn outgoing(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(raw) = self.wire.try_recv() {
            frames.push(raw);
        }
        frames
    }

    fn deliver(&mut self, frames: impl IntoIterator<Item = String>) {
        for raw in frames {
            let message = decode_message(&raw).expect("frame should decode");
            self.manager.handle_message(message).expect("frame should be handled");
        }
    }
}

/// Reorders `frames` by pairing them with `keys` (cycled) and sorting.
fn shuffled(frames: Vec<String>, keys: &[u16]) -> Vec<String> {
    let mut keyed: Vec<(u16, usize, String)> = frames
        .into_iter()
        .enumerate()
        .map(|(index, raw)| (keys[index % keys.len()], index, raw))
        .collect();
    keyed.sort();
    keyed.into_iter().map(|(_, _, raw)| raw).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replicas_converge_regardless_of_delivery_order(
        edits in prop::collection::vec(edit_strategy(), 1..40),
        flush_every in 1usize..5,
        keys in prop::collection::vec(any::<u16>(), 1..16),
    ) {
        let mut alice = Replica::new(1, "bob");
        let mut bob = Replica::new(2, "alice");

        let mut to_bob = Vec::new();
        let mut to_alice = Vec::new();

        for (index, (on_alice, edit)) in edits.iter().enumerate() {
            let replica = if *on_alice { &mut alice } else { &mut bob };
            replica.apply(edit);
            if index % flush_every == 0 {
                alice.manager.flush().expect("flush");
                bob.manager.flush().expect("flush");
            }
        }
        alice.manager.flush().expect("flush");
        bob.manager.flush().expect("flush");

        // Step 1 frames go first; incremental updates arrive in any order.
        to_bob.extend(alice.outgoing());
        to_alice.extend(bob.outgoing());
        let (step1_to_bob, updates_to_bob) = to_bob.split_at(1);
        let (step1_to_alice, updates_to_alice) = to_alice.split_at(1);

        bob.deliver(step1_to_bob.to_vec());
        alice.deliver(step1_to_alice.to_vec());
        bob.deliver(shuffled(updates_to_bob.to_vec(), &keys));
        alice.deliver(shuffled(updates_to_alice.to_vec(), &keys));

        // Step 2 answers produced while delivering.
        let late_to_bob = alice.outgoing();
        let late_to_alice = bob.outgoing();
        bob.deliver(late_to_bob);
        alice.deliver(late_to_alice);

        prop_assert_eq!(alice.doc.text(), bob.doc.text());
        prop_assert!(alice.manager.is_ready());
        prop_assert!(bob.manager.is_ready());
    }

    #[test]
    fn applied_remote_updates_are_never_echoed(
        edits in prop::collection::vec(edit_strategy(), 1..20),
    ) {
        let mut alice = Replica::new(1, "bob");
        let mut bob = Replica::new(2, "alice");
        alice.outgoing();
        bob.outgoing();

        for (_, edit) in &edits {
            alice.apply(edit);
        }
        alice.manager.flush().expect("flush");
        let frames = alice.outgoing();
        bob.deliver(frames);

        prop_assert_eq!(bob.manager.pending_len(), 0);
        prop_assert!(bob.updates.try_recv().is_err());
        prop_assert!(bob.outgoing().is_empty());
        prop_assert_eq!(alice.doc.text(), bob.doc.text());
    }
}
