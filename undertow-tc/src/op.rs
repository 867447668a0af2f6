// Per-operation records. A `TcOp` tracks one client operation from arrival
// to the end of its complete (or abort) phase. A `CacheRec` holds the
// streaming key/attrinfo assembly state and lives only from the first signal
// of an operation until its query-handler request has been fully emitted.

use crate::commit::CommitAckMarker;
use crate::conn::ApiConnect;
use crate::index::IndexOp;
use crate::trigger::FiredTrigger;
use undertow_base::{Ix, SegList};
use undertow_wire::{IndexId, LqhKeyConf, NodeId, OpKind, TableId};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OpState {
    /// Attached to a transaction, assembling inputs.
    #[default]
    Building,
    /// Waiting for further keyinfo signals.
    WaitKeyInfo,
    /// Waiting for further attrinfo signals.
    WaitAttr,
    /// Key request sent, prepare ack outstanding.
    Operating,
    Prepared,
    Committing,
    Committed,
    Completing,
    Completed,
    /// Abort sent, ack outstanding.
    Aborting,
    Aborted,
    /// Owned by the take-over engine.
    TakeOver,
}

/// Per-replica phase status rebuilt during take-over.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReplicaFailStatus {
    #[default]
    Invalid,
    Prepared,
    Committed,
    Aborted,
}

#[derive(Debug, Default)]
pub struct TcOp {
    pub state: OpState,
    pub conn: Option<Ix<ApiConnect>>,
    pub next: Option<Ix<TcOp>>,
    pub prev: Option<Ix<TcOp>>,
    pub op: OpKind,
    /// Replica nodes, primary first. Empty once the operation has been
    /// released or fully aborted.
    pub replicas: Vec<NodeId>,
    /// Ack bitmask over `replicas` for the fan-out phase in flight.
    pub acked: u8,
    /// Handler-side operation handle on the last contacted replica.
    pub last_lqh_conn: u32,
    pub last_lqh_node: NodeId,
    pub dirty: bool,
    pub simple: bool,
    pub abort_on_error: bool,
    pub savepoint: u32,
    pub marker: Option<Ix<CommitAckMarker>>,
    pub client_data: u32,
    pub attr_len: u32,

    // Trigger bookkeeping.
    /// Triggers the prepare reported fired.
    pub fired_count: u32,
    /// Fired-trigger records fully received.
    pub received_count: u32,
    /// Outstanding trigger-spawned child operations.
    pub trigger_exec_count: u32,
    /// Set on trigger-spawned operations: the operation whose write fired.
    pub triggering_op: Option<Ix<TcOp>>,
    /// Fired-trigger record currently accumulating payload.
    pub accumulating_trigger: Option<Ix<FiredTrigger>>,
    /// Prepare ack held back until triggers finish, then replayed.
    pub saved_conf: Option<LqhKeyConf>,

    // Index bookkeeping.
    /// Set when this operation is a phase of an index translation.
    pub index_op: Option<Ix<IndexOp>>,
    /// Index this trigger-spawned operation maintains.
    pub current_index: Option<IndexId>,

    // Take-over bookkeeping.
    /// The dead coordinator's operation slot this record was rebuilt from.
    pub dead_tc_op: u32,
    pub fail_hash_next: Option<Ix<TcOp>>,
    pub replica_fail: [ReplicaFailStatus; undertow_wire::MAX_REPLICAS],
}

impl TcOp {
    /// Mark `node`'s ack for the phase in flight. False when the node is not
    /// a replica of this operation.
    pub fn ack_from(&mut self, node: NodeId) -> bool {
        match self.replicas.iter().position(|n| *n == node) {
            Some(i) => {
                self.acked |= 1 << i;
                true
            }
            None => false,
        }
    }

    pub fn all_acked(&self) -> bool {
        self.acked.count_ones() as usize == self.replicas.len()
    }

    pub fn clear_acks(&mut self) {
        self.acked = 0;
    }

    /// Replicas that have not acked the phase in flight.
    pub fn unacked(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.replicas
            .iter()
            .enumerate()
            .filter(|(i, _)| self.acked & (1 << i) == 0)
            .map(|(_, n)| *n)
    }

    /// Record `node` as replica number `no` (take-over intake learns the
    /// chain one row at a time, in any order).
    pub fn set_replica(&mut self, no: u8, node: NodeId) {
        let no = no as usize;
        if no >= undertow_wire::MAX_REPLICAS {
            return;
        }
        if self.replicas.len() <= no {
            self.replicas.resize(no + 1, NodeId(0));
        }
        self.replicas[no] = node;
    }
}

#[derive(Debug, Default)]
pub struct CacheRec {
    pub table: TableId,
    pub schema_version: u32,
    pub op: Option<Ix<TcOp>>,
    /// Expected totals, in words.
    pub key_len: u16,
    pub attr_len: u16,
    pub key: SegList,
    pub attr: SegList,
    pub interpreted: bool,
    pub distribution_key: Option<u32>,
}

impl CacheRec {
    pub fn key_complete(&self) -> bool {
        self.key.len() >= self.key_len as u32
    }

    pub fn attr_complete(&self) -> bool {
        self.attr.len() >= self.attr_len as u32
    }
}

/// Mint the hash pair that routes a key: the locate hash spreads rows over
/// the fragment space, the distribution hash picks the fragment and may be
/// overridden by a client hint. Tables with character key attributes get the
/// key transformed to its collation-normal form before hashing.
pub fn hash_key(
    table: &crate::table::TableRec,
    key: &[u32],
    hint: Option<u32>,
) -> (u32, u32) {
    let words = if table.has_char_attrs || table.distr_keys > 0 {
        xfrm_key(key)
    } else {
        key.to_vec()
    };
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let hash = rapidhash::rapidhash(&bytes) as u32;
    let distr = match hint {
        Some(h) => h,
        None if table.distr_keys > 0 => rapidhash::rapidhash_seeded(&bytes, 0xd15b) as u32,
        None => hash,
    };
    (hash, distr)
}

/// Collation-normal form of a key. With no attribute-level schema in the
/// coordinator's catalog view the transform is byte-order normalization of
/// each word; handlers apply the same rule.
fn xfrm_key(key: &[u32]) -> Vec<u32> {
    key.iter().map(|w| w.to_be()).collect()
}

#[cfg(test)]
mod optest {
    use super::*;
    use test_log::test;

    #[test]
    fn test_ack_tracking() {
        let mut op = TcOp {
            replicas: vec![NodeId(2), NodeId(3), NodeId(4)],
            ..TcOp::default()
        };
        assert!(!op.all_acked());
        assert!(op.ack_from(NodeId(3)));
        assert!(!op.ack_from(NodeId(9)));
        assert_eq!(op.unacked().collect::<Vec<_>>(), vec![NodeId(2), NodeId(4)]);
        assert!(op.ack_from(NodeId(2)));
        assert!(op.ack_from(NodeId(4)));
        assert!(op.all_acked());
        op.clear_acks();
        assert!(!op.all_acked());
    }

    #[test]
    fn test_hash_is_stable_and_hint_wins() {
        let table = crate::table::TableRec {
            defined: true,
            enabled: true,
            ..Default::default()
        };
        let (h1, d1) = hash_key(&table, &[1, 2, 3], None);
        let (h2, d2) = hash_key(&table, &[1, 2, 3], None);
        assert_eq!((h1, d1), (h2, d2));
        assert_eq!(h1, d1);
        let (_, d3) = hash_key(&table, &[1, 2, 3], Some(42));
        assert_eq!(d3, 42);
    }

    #[test]
    fn test_distr_key_table_hashes_subset_differently() {
        let table = crate::table::TableRec {
            defined: true,
            enabled: true,
            distr_keys: 1,
            ..Default::default()
        };
        let (h, d) = hash_key(&table, &[1, 2, 3], None);
        assert_ne!(h, d);
    }
}
