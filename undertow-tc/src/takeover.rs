// Take-over of a dead coordinator's transactions, and the local sweep that
// repairs our own transactions when a data node dies.
//
// The master asks every surviving query handler for every operation it still
// holds for the dead coordinator. Rows stream back one per operation
// replica; transactions are rebuilt in a transid-keyed hash, their outcome
// decided by aggregation (any committed replica means the transaction
// committed; a committed and an aborted replica together are impossible),
// and then driven to their terminal state by the same commit, complete and
// abort engines as live transactions. Failed nodes queue FIFO; one take-over
// runs at a time, with a bounded number of transactions in flight.

use crate::conn::{ApiConnect, ConnKind, ConnState};
use crate::op::{OpState, ReplicaFailStatus, TcOp};
use crate::{Job, Tc, WALK_BATCH};
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use undertow_base::{Ix, NodeBitmap};
use undertow_wire::{
    BlockRef, LqhTransConf, LqhTransReq, LqhTransStatus, NodeFailRep, NodeId, Signal,
    TakeOverTcConf, TakeOverTcReq, TransId,
};

const FAIL_CONN_BUCKETS: usize = 512;
const FAIL_OP_BUCKETS: usize = 1024;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FailState {
    #[default]
    Idle,
    /// Waiting for every surviving handler's last-trans sentinel.
    Listening,
    /// Driving rebuilt transactions to completion.
    Completing,
}

#[derive(Debug)]
pub struct TcFailRec {
    pub queue: VecDeque<NodeId>,
    pub state: FailState,
    pub node: Option<NodeId>,
    /// Handler nodes that have not sent their sentinel yet.
    pub lqh_outstanding: NodeBitmap,
    pub workers: u32,
    /// Rebuilt transactions keyed by transid.
    conn_hash: Vec<Option<Ix<ApiConnect>>>,
    /// Rebuilt operations keyed by the dead coordinator's operation slot.
    op_hash: Vec<Option<Ix<TcOp>>>,
}

impl Default for TcFailRec {
    fn default() -> Self {
        TcFailRec {
            queue: VecDeque::new(),
            state: FailState::Idle,
            node: None,
            lqh_outstanding: NodeBitmap::new(),
            workers: 0,
            conn_hash: vec![None; FAIL_CONN_BUCKETS],
            op_hash: vec![None; FAIL_OP_BUCKETS],
        }
    }
}

fn conn_bucket(transid: TransId) -> usize {
    transid.0 as usize & (FAIL_CONN_BUCKETS - 1)
}

fn op_bucket(tc_op: u32) -> usize {
    tc_op as usize & (FAIL_OP_BUCKETS - 1)
}

impl Tc {
    // ---- node failure ----------------------------------------------------

    pub(crate) fn on_node_fail_rep(&mut self, s: NodeFailRep) {
        self.master = s.master;
        for node in s.failed.clone() {
            info!(target: "undertow", node = node.0, "data node failed");
            self.alive.remove(node.0);
            self.hosts.get_mut(node).alive = false;
            // Markers can no longer be removed at the dead node.
            let stale: Vec<_> = self
                .markers
                .iter_live()
                .filter(|(_, m)| m.lqh_nodes.contains(&node))
                .map(|(mix, _)| mix)
                .collect();
            for mix in stale {
                self.markers
                    .get_mut(mix)
                    .expect("marker")
                    .lqh_nodes
                    .retain(|n| *n != node);
            }
            self.scan_node_failed(node);
            self.continue_later(Job::NodeFailContinue { node, pos: 0 });
            if self.own == self.master {
                self.on_take_over_tc_req(self.own_ref(), TakeOverTcReq { failed: node });
            }
        }
    }

    /// Repair our own live transactions after `node` died: anything not yet
    /// at its commit point aborts; commit and complete phases stop waiting
    /// for the dead replica, whose surviving siblings carry the outcome.
    pub(crate) fn node_fail_run(&mut self, node: NodeId, pos: u32) {
        let cap = self.conns.capacity() as u32;
        let end = (pos + WALK_BATCH).min(cap);
        for raw in pos..end {
            let cix: Ix<ApiConnect> = Ix::new(raw);
            let (state, participates) = {
                let c = self.conns.get(cix).expect("conn");
                (c.state, c.nodes.contains(node.0))
            };
            if !participates || state == ConnState::Disconnected {
                continue;
            }
            match state {
                ConnState::Started
                | ConnState::Receiving
                | ConnState::RecCommitting
                | ConnState::StartCommitting
                | ConnState::PrepareToCommit => {
                    self.abort_trans(cix, undertow_wire::codes::NODE_FAIL_BEFORE_COMMIT, line!());
                }
                ConnState::Committing | ConnState::CommitSent | ConnState::WaitCommitConf => {
                    if self.fail_ack_node(cix, node, OpState::Committing) {
                        self.commit_done(cix);
                    }
                }
                ConnState::Completing | ConnState::CompleteSent | ConnState::WaitCompleteConf => {
                    if self.fail_ack_node(cix, node, OpState::Completing) {
                        self.complete_done(cix);
                    }
                }
                ConnState::Aborting | ConnState::WaitAbortConf => {
                    if self.fail_ack_node(cix, node, OpState::Aborting) {
                        let kind = self.conns.get(cix).expect("conn").kind;
                        if kind == ConnKind::Fail {
                            self.takeover_aborted(cix);
                        } else {
                            self.release_abort_resources(cix);
                        }
                    }
                }
                _ => {}
            }
        }
        if end < cap {
            self.continue_later(Job::NodeFailContinue { node, pos: end });
        }
    }

    /// Pretend the dead node acked every outstanding `phase` signal of this
    /// transaction. True when the phase just drained.
    fn fail_ack_node(&mut self, cix: Ix<ApiConnect>, node: NodeId, phase: OpState) -> bool {
        let mut drained = 0;
        let mut cur = self.conns.get(cix).expect("conn").first_op;
        while let Some(oix) = cur {
            let next = {
                let op = self.ops.get_mut(oix).expect("op");
                if op.state == phase && op.unacked().any(|n| n == node) {
                    op.ack_from(node);
                    drained += 1;
                    if op.all_acked() {
                        op.state = match phase {
                            OpState::Committing => OpState::Committed,
                            OpState::Completing => OpState::Completed,
                            _ => OpState::Aborted,
                        };
                    }
                }
                op.next
            };
            cur = next;
        }
        let c = self.conns.get_mut(cix).expect("conn");
        c.pending_acks = c.pending_acks.saturating_sub(drained);
        let walk_done = c.abort_walk_done || phase != OpState::Aborting;
        c.pending_acks == 0
            && walk_done
            && !matches!(c.state, ConnState::Committing | ConnState::Completing)
    }

    // ---- take-over intake ------------------------------------------------

    pub(crate) fn on_take_over_tc_req(&mut self, _src: BlockRef, s: TakeOverTcReq) {
        self.fail.queue.push_back(s.failed);
        if self.fail.state == FailState::Idle {
            self.start_next_takeover();
        }
    }

    fn start_next_takeover(&mut self) {
        let Some(node) = self.fail.queue.pop_front() else {
            return;
        };
        info!(target: "undertow", node = node.0, "taking over transactions of dead coordinator");
        self.fail.state = FailState::Listening;
        self.fail.node = Some(node);
        self.fail.lqh_outstanding = NodeBitmap::new();
        let peers: Vec<NodeId> = self.alive.iter().map(NodeId).collect();
        for peer in peers {
            self.fail.lqh_outstanding.insert(peer.0);
            self.hosts.get_mut(peer).sweep = crate::host::LqhSweepState::Active;
            self.send(
                BlockRef::lqh(peer),
                Signal::LqhTransReq(LqhTransReq { failed_tc: node }),
            );
        }
        if self.fail.lqh_outstanding.is_empty() {
            // No survivors hold anything.
            self.takeover_complete();
        }
    }

    pub(crate) fn on_lqh_trans_conf(&mut self, src: BlockRef, conf: LqhTransConf) {
        if self.fail.state != FailState::Listening {
            warn!(target: "undertow", from = src.node.0, "take-over row outside a sweep");
            return;
        }
        match conf.status {
            LqhTransStatus::LastTrans => {
                self.fail.lqh_outstanding.remove(src.node.0);
                self.hosts.get_mut(src.node).sweep = crate::host::LqhSweepState::Idle;
                if self.fail.lqh_outstanding.is_empty() {
                    self.takeover_intake_complete();
                }
            }
            LqhTransStatus::Marker => {
                // Marker-only row: no operation record, just the promise to
                // answer a future commit-ack.
                match self.marker_hash.find(conf.transid, &self.markers) {
                    Some(mix) => {
                        let m = self.markers.get_mut(mix).expect("marker");
                        if !m.lqh_nodes.contains(&conf.node) {
                            m.lqh_nodes.push(conf.node);
                        }
                    }
                    None => {
                        let Some(mix) = self.markers.seize() else {
                            crate::system_error!("marker pool exhausted during take-over");
                        };
                        {
                            let m = self.markers.get_mut(mix).expect("marker");
                            m.transid = conf.transid;
                            m.api_node = conf.api_node;
                            m.lqh_nodes = vec![conf.node];
                        }
                        self.marker_hash.insert(conf.transid, mix, &mut self.markers);
                    }
                }
            }
            _ => self.takeover_row(conf),
        }
    }

    fn find_fail_conn(&self, transid: TransId) -> Option<Ix<ApiConnect>> {
        let mut cur = self.fail.conn_hash[conn_bucket(transid)];
        while let Some(cix) = cur {
            let c = self.conns.get(cix)?;
            if c.transid == transid && c.state != ConnState::Disconnected {
                return Some(cix);
            }
            cur = c.fail_hash_next;
        }
        None
    }

    pub(crate) fn find_fail_op(
        &self,
        tc_op: u32,
        transid: TransId,
    ) -> Option<(Ix<ApiConnect>, Ix<TcOp>)> {
        let mut cur = self.fail.op_hash[op_bucket(tc_op)];
        while let Some(oix) = cur {
            let op = self.ops.get(oix)?;
            if op.dead_tc_op == tc_op {
                if let Some(cix) = op.conn {
                    if let Some(c) = self.conns.get(cix) {
                        if c.transid == transid && c.state != ConnState::Disconnected {
                            return Some((cix, oix));
                        }
                    }
                }
            }
            cur = op.fail_hash_next;
        }
        None
    }

    fn takeover_row(&mut self, conf: LqhTransConf) {
        let node = self.fail.node.expect("takeover node");
        let cix = match self.find_fail_conn(conf.transid) {
            Some(cix) => cix,
            None => {
                let Some(cix) = self.seize_conn(ConnKind::Fail) else {
                    crate::system_error!("take-over connection pool exhausted");
                };
                {
                    let c = self.conns.get_mut(cix).expect("conn");
                    c.transid = conf.transid;
                    c.state = match conf.status {
                        LqhTransStatus::Committed => ConnState::FailCommitted,
                        LqhTransStatus::Aborted => ConnState::FailAborted,
                        _ => ConnState::FailPrepared,
                    };
                    c.api_ref = Some(BlockRef::api(conf.api_node));
                    c.api_conn = conf.api_conn;
                    c.takeover_node = Some(node);
                }
                let b = conn_bucket(conf.transid);
                let head = self.fail.conn_hash[b];
                self.conns.get_mut(cix).expect("conn").fail_hash_next = head;
                self.fail.conn_hash[b] = Some(cix);
                cix
            }
        };
        // Aggregate the transaction outcome.
        {
            let state = self.conns.get(cix).expect("conn").state;
            let new_state = match (state, conf.status) {
                (ConnState::FailCommitted, LqhTransStatus::Prepared) => ConnState::FailCommitting,
                (ConnState::FailAborted, LqhTransStatus::Prepared) => ConnState::FailAborting,
                (ConnState::FailPrepared, LqhTransStatus::Committed) => ConnState::FailCommitting,
                (ConnState::FailAborting | ConnState::FailAborted, LqhTransStatus::Committed) => {
                    crate::system_error!(
                        "transaction {:?} has both committed and aborted replicas",
                        conf.transid
                    );
                }
                (ConnState::FailCommitting | ConnState::FailCommitted, LqhTransStatus::Aborted) => {
                    crate::system_error!(
                        "transaction {:?} has both committed and aborted replicas",
                        conf.transid
                    );
                }
                (ConnState::FailPrepared, LqhTransStatus::Aborted) => ConnState::FailAborting,
                (s, _) => s,
            };
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = new_state;
            if conf.status == LqhTransStatus::Committed {
                c.gci = Some(conf.gci);
            }
            c.nodes.insert(conf.node.0);
        }
        // Find or rebuild the operation record.
        let oix = match self.find_fail_op(conf.tc_op, conf.transid) {
            Some((_, oix)) => oix,
            None => {
                let Some(oix) = self.ops.seize() else {
                    crate::system_error!("operation pool exhausted during take-over");
                };
                {
                    let op = self.ops.get_mut(oix).expect("op");
                    op.conn = Some(cix);
                    op.state = OpState::TakeOver;
                    op.dead_tc_op = conf.tc_op;
                    op.client_data = conf.client_data;
                    op.dirty = conf.dirty;
                }
                self.link_op(cix, oix);
                let b = op_bucket(conf.tc_op);
                let head = self.fail.op_hash[b];
                self.ops.get_mut(oix).expect("op").fail_hash_next = head;
                self.fail.op_hash[b] = Some(oix);
                oix
            }
        };
        let op = self.ops.get_mut(oix).expect("op");
        op.set_replica(conf.replica_no, conf.node);
        let status = match conf.status {
            LqhTransStatus::Committed => ReplicaFailStatus::Committed,
            LqhTransStatus::Aborted => ReplicaFailStatus::Aborted,
            _ => ReplicaFailStatus::Prepared,
        };
        if (conf.replica_no as usize) < undertow_wire::MAX_REPLICAS {
            op.replica_fail[conf.replica_no as usize] = status;
        }
    }

    // ---- take-over drive -------------------------------------------------

    fn takeover_intake_complete(&mut self) {
        self.fail.state = FailState::Completing;
        let node = self.fail.node.expect("takeover node");
        debug!(target: "undertow", node = node.0, "take-over intake complete");
        let workers = self.cfg.no_parallel_takeover;
        self.fail.workers = workers;
        for _ in 0..workers {
            self.continue_later(Job::TakeoverDrive { node });
        }
    }

    pub(crate) fn takeover_drive_run(&mut self, node: NodeId) {
        if self.fail.state != FailState::Completing || self.fail.node != Some(node) {
            return;
        }
        // Pick the next rebuilt transaction; unhook it so no other worker
        // takes it.
        let mut picked = None;
        'outer: for b in 0..FAIL_CONN_BUCKETS {
            let mut prev: Option<Ix<ApiConnect>> = None;
            let mut cur = self.fail.conn_hash[b];
            while let Some(cix) = cur {
                let (next, ours) = {
                    let c = self.conns.get(cix).expect("conn");
                    (c.fail_hash_next, c.takeover_node == Some(node))
                };
                if ours {
                    match prev {
                        Some(p) => self.conns.get_mut(p).expect("conn").fail_hash_next = next,
                        None => self.fail.conn_hash[b] = next,
                    }
                    self.conns.get_mut(cix).expect("conn").fail_hash_next = None;
                    picked = Some(cix);
                    break 'outer;
                }
                prev = cur;
                cur = next;
            }
        }
        let Some(cix) = picked else {
            self.fail.workers = self.fail.workers.saturating_sub(1);
            if self.fail.workers == 0 {
                self.takeover_complete();
            }
            return;
        };
        let state = self.conns.get(cix).expect("conn").state;
        match state {
            ConnState::FailCommitted | ConnState::FailCommitting => {
                // Any committed replica means the whole transaction
                // commits.
                {
                    let c = self.conns.get_mut(cix).expect("conn");
                    c.state = ConnState::FailCommitting;
                    c.pending_acks = 0;
                }
                self.commit_fanout_run(cix, None);
            }
            ConnState::FailPrepared | ConnState::FailAborting | ConnState::FailAborted => {
                // Nothing committed anywhere: presumed abort.
                {
                    let c = self.conns.get_mut(cix).expect("conn");
                    c.state = ConnState::FailAborting;
                    c.abort_state = crate::conn::AbortState::Active;
                    c.abort_walk_done = false;
                    c.pending_acks = 0;
                }
                self.abort_run(cix, None);
            }
            other => {
                warn!(target: "undertow", conn = ?cix, state = ?other, "unexpected take-over state");
                self.release_conn(cix);
                self.continue_later(Job::TakeoverDrive { node });
            }
        }
    }

    /// Unlink a rebuilt operation from the dead-handle hash before its slot
    /// is released.
    pub(crate) fn unhook_fail_op(&mut self, oix: Ix<TcOp>) {
        let Some(tc_op) = self.ops.get(oix).map(|o| o.dead_tc_op) else {
            return;
        };
        let b = op_bucket(tc_op);
        let mut prev: Option<Ix<TcOp>> = None;
        let mut cur = self.fail.op_hash[b];
        while let Some(x) = cur {
            let next = self.ops.get(x).and_then(|o| o.fail_hash_next);
            if x == oix {
                match prev {
                    Some(p) => self.ops.get_mut(p).expect("op").fail_hash_next = next,
                    None => self.fail.op_hash[b] = next,
                }
                self.ops.get_mut(oix).expect("op").fail_hash_next = None;
                return;
            }
            prev = cur;
            cur = next;
        }
    }

    /// One rebuilt transaction reached its terminal state.
    pub(crate) fn takeover_finished_one(&mut self, cix: Ix<ApiConnect>, node: Option<NodeId>) {
        self.release_conn(cix);
        if let Some(node) = node {
            self.continue_later(Job::TakeoverDrive { node });
        }
    }

    fn takeover_complete(&mut self) {
        let node = self.fail.node.take().expect("takeover node");
        info!(target: "undertow", node = node.0, "take-over complete");
        self.fail.state = FailState::Idle;
        self.fail.conn_hash = vec![None; FAIL_CONN_BUCKETS];
        self.fail.op_hash = vec![None; FAIL_OP_BUCKETS];
        let master = self.master;
        self.send(
            BlockRef::cntr(master),
            Signal::TakeOverTcConf(TakeOverTcConf { failed: node }),
        );
        self.start_next_takeover();
    }
}
