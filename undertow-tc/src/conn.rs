// The per-transaction api-connection record and its state machine.
//
// A client seizes one connection and runs transactions on it back to back.
// Every record lives in one fixed array partitioned three ways at boot:
// client-facing records, commit-copy records (which carry the complete phase
// after the client has been answered), and take-over records (which carry
// rebuilt transactions of a dead coordinator). A record that is free is in
// state `Disconnected`; late signals that land on a freed or reused slot are
// discriminated by transaction id and dropped.

use crate::commit::{CommitAckMarker, GcpRec};
use crate::index::IndexOp;
use crate::op::TcOp;
use crate::scan::ScanRec;
use crate::trigger::FiredTrigger;
use undertow_base::{Ix, NodeBitmap};
use undertow_wire::{BlockRef, ConfOp, NodeId, TransId};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connected,
    Started,
    Receiving,
    /// Commit requested, final operation still streaming in.
    RecCommitting,
    /// Commit requested, waiting for outstanding prepare acks.
    StartCommitting,
    /// Commit point passed, waiting for the commit epoch from DIH.
    PrepareToCommit,
    /// Commit fan-out in progress.
    Committing,
    /// Commit fan-out done, waiting for committed acks.
    CommitSent,
    /// Complete fan-out in progress (runs on the copy record).
    Completing,
    /// Complete fan-out done, waiting for completed acks.
    CompleteSent,
    Aborting,
    /// Re-driving a phase after a timeout or node failure.
    WaitAbortConf,
    WaitCommitConf,
    WaitCompleteConf,
    // Take-over intake and drive states.
    FailPrepared,
    FailCommitting,
    FailCommitted,
    FailCompleted,
    FailAborting,
    FailAborted,
    Restart,
}

impl ConnState {
    /// States in which client operations may arrive.
    pub fn receiving(self) -> bool {
        matches!(
            self,
            ConnState::Started | ConnState::Receiving | ConnState::Connected
        )
    }

    pub fn in_commit(self) -> bool {
        matches!(
            self,
            ConnState::RecCommitting
                | ConnState::StartCommitting
                | ConnState::PrepareToCommit
                | ConnState::Committing
                | ConnState::CommitSent
                | ConnState::Completing
                | ConnState::CompleteSent
        )
    }

    pub fn in_takeover(self) -> bool {
        matches!(
            self,
            ConnState::FailPrepared
                | ConnState::FailCommitting
                | ConnState::FailCommitted
                | ConnState::FailCompleted
                | ConnState::FailAborting
                | ConnState::FailAborted
        )
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AbortState {
    #[default]
    Idle,
    Active,
}

/// What to send the client when the transaction reaches its terminal point.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReturnSignal {
    #[default]
    None,
    KeyConf,
    CommitConf,
    RollbackConf,
    RollbackRep,
}

/// Which boot-time partition a connection slot belongs to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnKind {
    #[default]
    User,
    Copy,
    Fail,
}

#[derive(Debug, Default)]
pub struct ApiConnect {
    pub state: ConnState,
    pub kind: ConnKind,
    /// Client block, set while a client owns the slot.
    pub api_ref: Option<BlockRef>,
    /// Client-side handle echoed in replies.
    pub api_conn: u32,
    pub transid: TransId,

    // Operation list, oldest first.
    pub first_op: Option<Ix<TcOp>>,
    pub last_op: Option<Ix<TcOp>>,
    /// Key requests sent to query handlers this transaction.
    pub lqhkeyreq_count: u32,
    /// Prepare acks received.
    pub lqhkeyconf_count: u32,
    /// Outstanding replies in the current fan-out phase
    /// (commit / complete / abort), counted per replica.
    pub pending_acks: u32,

    pub savepoint: u32,
    pub gci: Option<u64>,
    pub gcp: Option<Ix<GcpRec>>,
    pub gcp_next: Option<Ix<ApiConnect>>,
    pub gcp_prev: Option<Ix<ApiConnect>>,
    pub marker: Option<Ix<CommitAckMarker>>,
    /// Savepoint-coordination partner on the api side.
    pub buddy: Option<Ix<ApiConnect>>,
    pub abort_state: AbortState,
    /// Client vanished; release at the next quiet point.
    pub api_fail: bool,
    /// The client asked for immediate execution of buffered operations.
    pub exec_flag: bool,
    pub return_signal: ReturnSignal,
    pub returncode: u32,
    /// Source line that raised `returncode`; debugging aid in error replies.
    pub return_line: u32,
    /// Data nodes participating in this transaction (superset of every live
    /// operation's nodes, dirty reads excepted).
    pub nodes: NodeBitmap,
    /// Commit-copy record carrying the complete phase.
    pub copy: Option<Ix<ApiConnect>>,
    /// Operation currently streaming key/attr data.
    pub cache: Option<Ix<crate::op::CacheRec>>,
    pub scan: Option<Ix<ScanRec>>,

    /// Per-op confirm items waiting to be flushed in one `TcKeyConf`.
    pub conf_ops: Vec<ConfOp>,
    /// Consecutive watchdog checks a re-driven request has gone unanswered.
    pub timeout_counter: u8,
    /// The abort walk has visited the whole operation list.
    pub abort_walk_done: bool,
    /// Operations whose prepare fired triggers that have not finished
    /// executing; holds the commit point back.
    pub pending_trigger_ops: u32,

    // Take-over bookkeeping.
    /// Dead coordinator this record was rebuilt for.
    pub takeover_node: Option<NodeId>,
    pub fail_hash_next: Option<Ix<ApiConnect>>,

    // Trigger bookkeeping.
    pub fired_first: Option<Ix<FiredTrigger>>,
    pub fired_last: Option<Ix<FiredTrigger>>,
    /// A trigger-execution continuation is queued.
    pub trigger_pending: bool,

    // Index-operation bookkeeping.
    pub index_ops: Vec<Ix<IndexOp>>,
    pub accumulating_index_op: Option<Ix<IndexOp>>,
    /// Outstanding index operations (both phases).
    pub pending_index_ops: u32,
    /// Per-op confirm items waiting to be flushed in one `TcIndxConf`.
    pub indx_conf_ops: Vec<ConfOp>,
}

impl ApiConnect {
    /// True when `transid` matches; everything that arrives for a
    /// transaction must pass this before touching state.
    pub fn same_trans(&self, transid: TransId) -> bool {
        self.transid == transid
    }

    /// True when `src` is the client that owns this slot.
    pub fn owned_by(&self, src: BlockRef) -> bool {
        matches!(self.api_ref, Some(r) if r.node == src.node)
    }

    /// All prepare acks are in and nothing else holds the commit point back.
    pub fn prepared(&self) -> bool {
        self.lqhkeyreq_count == self.lqhkeyconf_count
            && self.pending_index_ops == 0
            && self.pending_trigger_ops == 0
            && self.fired_first.is_none()
            && !self.trigger_pending
    }
}
