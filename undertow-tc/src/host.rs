// Per-peer-node state: liveness plus the packed-signal buffers for the
// host-bound streams that batch.

use undertow_base::NodeBitmap;
use undertow_wire::{Msg, NodeId, Packed, PackedBuf, PackedClass, PackedItem};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LqhSweepState {
    #[default]
    Idle,
    /// A take-over sweep is waiting on this host's last-trans sentinel.
    Active,
}

#[derive(Debug, Default)]
pub struct HostRec {
    pub alive: bool,
    pub sweep: LqhSweepState,
    packed_lqh: PackedBuf,
    packed_keyconf: PackedBuf,
    packed_indxconf: PackedBuf,
}

impl HostRec {
    fn buf(&mut self, class: PackedClass) -> &mut PackedBuf {
        match class {
            PackedClass::Lqh => &mut self.packed_lqh,
            PackedClass::ApiConf => &mut self.packed_keyconf,
            PackedClass::ApiIndxConf => &mut self.packed_indxconf,
        }
    }
}

#[derive(Debug)]
pub struct Hosts {
    recs: Vec<HostRec>,
}

impl Hosts {
    pub fn new() -> Hosts {
        let mut recs = Vec::with_capacity(NodeBitmap::MAX_NODES);
        recs.resize_with(NodeBitmap::MAX_NODES, HostRec::default);
        Hosts { recs }
    }

    pub fn get(&self, node: NodeId) -> &HostRec {
        &self.recs[node.0 as usize]
    }

    pub fn get_mut(&mut self, node: NodeId) -> &mut HostRec {
        &mut self.recs[node.0 as usize]
    }

    pub fn alive(&self, node: NodeId) -> bool {
        self.get(node).alive
    }

    /// Queue a packed item toward `node`; a threshold overflow surfaces an
    /// eager batch to send first.
    pub fn pack(&mut self, node: NodeId, class: PackedClass, item: PackedItem) -> Option<Packed> {
        self.get_mut(node).buf(class).push(item)
    }

    /// Drain every non-empty packed buffer into ready-to-send messages
    /// (destination filled in by the caller's own block reference).
    pub fn flush(&mut self, mut emit: impl FnMut(NodeId, PackedClass, Packed)) {
        for raw in 0..self.recs.len() {
            let node = NodeId(raw as u16);
            for class in [
                PackedClass::Lqh,
                PackedClass::ApiConf,
                PackedClass::ApiIndxConf,
            ] {
                if let Some(batch) = self.recs[raw].buf(class).take() {
                    emit(node, class, batch);
                }
            }
        }
    }
}

/// Destination block for a flushed batch of `class` on `node`.
pub fn packed_dst(node: NodeId, class: PackedClass) -> undertow_wire::BlockRef {
    match class {
        PackedClass::Lqh => undertow_wire::BlockRef::lqh(node),
        PackedClass::ApiConf | PackedClass::ApiIndxConf => undertow_wire::BlockRef::api(node),
    }
}

/// Unpack a received packed signal into its member messages for dispatch.
pub fn unpack(src: undertow_wire::BlockRef, dst: undertow_wire::BlockRef, p: Packed) -> Vec<Msg> {
    p.items
        .into_iter()
        .map(|item| {
            let signal = match item {
                PackedItem::Commit(s) => undertow_wire::Signal::Commit(s),
                PackedItem::Complete(s) => undertow_wire::Signal::Complete(s),
                PackedItem::RemoveMarker(s) => undertow_wire::Signal::RemoveMarker(s),
                PackedItem::TcKeyConf(s) => undertow_wire::Signal::TcKeyConf(s),
                PackedItem::TcIndxConf(s) => undertow_wire::Signal::TcIndxConf(s),
            };
            Msg { src, dst, signal }
        })
        .collect()
}
