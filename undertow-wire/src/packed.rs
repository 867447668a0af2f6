// Per-host packed-signal batching.
//
// Commit, complete and remove-marker toward one query-handler node, and
// key/index confirms toward one api node, coalesce into a packed buffer that
// is flushed when it would overflow its word budget, on the explicit
// send-packed tick, and at the end of a dispatch batch. This is load
// reduction; nothing is allowed to sit in a buffer across a scheduling break.

use crate::signal::{Packed, PackedItem};

/// Word budget of one packed signal.
pub const PACKED_WORDS_MAX: usize = 25;

/// Which host-bound stream a packed buffer serves.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PackedClass {
    /// Commit / complete / remove-marker toward the node's query handler.
    Lqh,
    /// Key confirms toward the node's api library.
    ApiConf,
    /// Index confirms toward the node's api library.
    ApiIndxConf,
}

#[derive(Debug, Default)]
pub struct PackedBuf {
    items: Vec<PackedItem>,
    words: usize,
}

fn item_words(item: &PackedItem) -> usize {
    match item {
        PackedItem::Commit(_) => 5,
        PackedItem::Complete(_) => 3,
        PackedItem::RemoveMarker(_) => 3,
        PackedItem::TcKeyConf(conf) => 5 + 2 * conf.ops.len(),
        PackedItem::TcIndxConf(conf) => 5 + 2 * conf.ops.len(),
    }
}

impl PackedBuf {
    pub fn new() -> Self {
        PackedBuf::default()
    }

    /// Queue `item`. When the buffer cannot also hold `item`, the currently
    /// queued batch is returned and must be sent before anything else goes
    /// to this host.
    pub fn push(&mut self, item: PackedItem) -> Option<Packed> {
        let cost = item_words(&item);
        let flushed = if self.words + cost > PACKED_WORDS_MAX {
            self.take()
        } else {
            None
        };
        self.words += cost;
        self.items.push(item);
        flushed
    }

    /// Drain the queued batch, if any.
    pub fn take(&mut self) -> Option<Packed> {
        if self.items.is_empty() {
            return None;
        }
        self.words = 0;
        Some(Packed {
            items: std::mem::take(&mut self.items),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
