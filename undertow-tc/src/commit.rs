// The two-phase commit driver.
//
// Once the last prepare ack is in, the transaction asks the distribution
// service to assign it a commit epoch (the verify step; its answer is the
// commit point), then fans commit out to every replica of every operation,
// answers the client, fans complete out the same way, and releases. The
// client is answered from the original connection record while a commit-copy
// record carries the complete phase, so the client can start its next
// transaction on the same handle immediately.
//
// Commit-ack markers outlive all of that: a marker seized by the first write
// of a transaction stays in its hash until the client's explicit
// acknowledgment, which fans remove-marker out to the handlers that stored
// one.

use crate::conn::{ApiConnect, ConnKind, ConnState, ReturnSignal};
use crate::op::{OpState, TcOp};
use crate::{Job, Tc, FANOUT_BATCH};
use tracing::{debug, warn};
use undertow_base::{Ix, Pool};
use undertow_wire::codes;
use undertow_wire::{
    BlockRef, Commit, Committed, Complete, Completed, DiVerifyConf, DiVerifyReq, GcpNoMoreTrans,
    GcpTcFinished, NodeId, PackedClass, PackedItem, RemoveMarker, Signal, TcCommitAck,
    TcCommitConf, TcCommitRef, TcCommitReq, TcKeyFailConf, TransId,
};

#[derive(Debug, Default)]
pub struct GcpRec {
    pub gci: u64,
    pub first_conn: Option<Ix<ApiConnect>>,
    pub last_conn: Option<Ix<ApiConnect>>,
    pub next: Option<Ix<GcpRec>>,
    /// Set once the distribution service promises no further transactions
    /// will commit under this epoch; it then waits for our finished reply.
    pub nomoretrans: bool,
}

#[derive(Debug, Default)]
pub struct CommitAckMarker {
    pub transid: TransId,
    pub api_node: NodeId,
    /// Handler nodes that stored a durable marker.
    pub lqh_nodes: Vec<NodeId>,
    /// Owning connection while the transaction is alive.
    pub conn: Option<Ix<ApiConnect>>,
    pub next_hash: Option<Ix<CommitAckMarker>>,
}

const MARKER_BUCKETS: usize = 512;

/// Closed-addressing hash over the marker pool, keyed by transaction id.
/// Fixed bucket count; no resize at runtime.
#[derive(Debug)]
pub struct MarkerHash {
    buckets: Vec<Option<Ix<CommitAckMarker>>>,
}

impl MarkerHash {
    pub fn new() -> MarkerHash {
        MarkerHash {
            buckets: vec![None; MARKER_BUCKETS],
        }
    }

    fn bucket(transid: TransId) -> usize {
        (transid.0 as usize) & (MARKER_BUCKETS - 1)
    }

    pub fn insert(
        &mut self,
        transid: TransId,
        mix: Ix<CommitAckMarker>,
        pool: &mut Pool<CommitAckMarker>,
    ) {
        let b = Self::bucket(transid);
        let head = self.buckets[b];
        pool.get_mut(mix).expect("marker").next_hash = head;
        self.buckets[b] = Some(mix);
    }

    pub fn find(
        &self,
        transid: TransId,
        pool: &Pool<CommitAckMarker>,
    ) -> Option<Ix<CommitAckMarker>> {
        let mut cur = self.buckets[Self::bucket(transid)];
        while let Some(mix) = cur {
            let m = pool.get(mix)?;
            if m.transid == transid {
                return Some(mix);
            }
            cur = m.next_hash;
        }
        None
    }

    /// Unlink and return the marker for `transid`, if present.
    pub fn remove(
        &mut self,
        transid: TransId,
        pool: &mut Pool<CommitAckMarker>,
    ) -> Option<Ix<CommitAckMarker>> {
        let b = Self::bucket(transid);
        let mut prev: Option<Ix<CommitAckMarker>> = None;
        let mut cur = self.buckets[b];
        while let Some(mix) = cur {
            let (found, next) = {
                let m = pool.get(mix)?;
                (m.transid == transid, m.next_hash)
            };
            if found {
                match prev {
                    Some(p) => pool.get_mut(p).expect("marker").next_hash = next,
                    None => self.buckets[b] = next,
                }
                return Some(mix);
            }
            prev = cur;
            cur = next;
        }
        None
    }
}

impl Tc {
    // ---- explicit client commit ------------------------------------------

    pub(crate) fn on_commit_req(&mut self, src: BlockRef, s: TcCommitReq) {
        let Some(cix) = self.conn_ix(s.tc_conn) else {
            return;
        };
        let (state, owned, same, prepared, empty, api_conn) = {
            let c = self.conns.get(cix).expect("conn");
            (
                c.state,
                c.owned_by(src),
                c.same_trans(s.transid),
                c.prepared(),
                c.first_op.is_none(),
                c.api_conn,
            )
        };
        if !owned || !same {
            return;
        }
        let refuse = |tc: &mut Tc, code: u32| {
            tc.send(
                src,
                Signal::TcCommitRef(TcCommitRef {
                    api_conn,
                    transid: s.transid,
                    code,
                }),
            );
        };
        match state {
            ConnState::Started => {
                self.touch_conn(cix);
                self.conns.get_mut(cix).expect("conn").return_signal = ReturnSignal::CommitConf;
                if empty && prepared {
                    // Nothing was written; confirm straight away.
                    self.conns.get_mut(cix).expect("conn").state = ConnState::Connected;
                    self.send(
                        src,
                        Signal::TcCommitConf(TcCommitConf {
                            api_conn,
                            transid: s.transid,
                            gci: 0,
                            marker: false,
                        }),
                    );
                    return;
                }
                self.conns.get_mut(cix).expect("conn").state = ConnState::StartCommitting;
                if prepared {
                    self.start_commit(cix);
                }
            }
            ConnState::Receiving | ConnState::RecCommitting => {
                refuse(self, codes::COMMIT_IN_PROGRESS)
            }
            s if s.in_commit() => refuse(self, codes::COMMIT_IN_PROGRESS),
            ConnState::Aborting => refuse(self, codes::ABORT_IN_PROGRESS),
            _ => refuse(self, codes::STATE_ERROR),
        }
    }

    // ---- verify ----------------------------------------------------------

    /// The commit point: all prepares acked, commit requested.
    pub(crate) fn start_commit(&mut self, cix: Ix<ApiConnect>) {
        let empty = self.conns.get(cix).expect("conn").first_op.is_none();
        if empty {
            // Read-only transaction: every operation was a committed read
            // and already released. No epoch, no fan-out.
            self.counters.commit_count += 1;
            let rs = self.conns.get(cix).expect("conn").return_signal;
            match rs {
                ReturnSignal::CommitConf => {
                    let (api_ref, api_conn, transid) = {
                        let c = self.conns.get(cix).expect("conn");
                        (c.api_ref, c.api_conn, c.transid)
                    };
                    if let Some(api) = api_ref {
                        self.send(
                            api,
                            Signal::TcCommitConf(TcCommitConf {
                                api_conn,
                                transid,
                                gci: 0,
                                marker: false,
                            }),
                        );
                    }
                }
                _ => {
                    self.flush_key_conf(cix, true);
                    self.flush_indx_conf(cix, true);
                }
            }
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = ConnState::Connected;
            c.exec_flag = false;
            self.handle_api_fail_release(cix);
            return;
        }
        let Some(copy) = self.seize_conn(ConnKind::Copy) else {
            return self.abort_trans(cix, codes::SEIZE_API_COPY_ERROR, line!());
        };
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.copy = Some(copy);
            c.state = ConnState::PrepareToCommit;
        }
        self.touch_conn(cix);
        let dih = BlockRef::dih(self.own);
        self.send(
            dih,
            Signal::DiVerifyReq(DiVerifyReq { conn: cix.raw() }),
        );
    }

    pub(crate) fn on_diverify_conf(&mut self, s: DiVerifyConf) {
        let Some(cix) = self.conn_ix(s.conn) else {
            return;
        };
        {
            let c = self.conns.get(cix).expect("conn");
            if c.state != ConnState::PrepareToCommit {
                warn!(target: "undertow", conn = s.conn, state = ?c.state, "verify conf in unexpected state");
                return;
            }
        }
        self.counters.commit_count += 1;
        self.conns.get_mut(cix).expect("conn").gci = Some(s.gci);
        self.gcp_link(cix, s.gci);
        let first = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = ConnState::Committing;
            c.pending_acks = 0;
            c.first_op
        };
        self.touch_conn(cix);
        self.commit_fanout_run(cix, first);
    }

    // ---- commit fan-out --------------------------------------------------

    /// The handler-side handle for an operation: our slot normally, the
    /// dead coordinator's slot for a rebuilt take-over operation.
    pub(crate) fn op_wire_handle(&self, cix: Ix<ApiConnect>, oix: Ix<TcOp>) -> u32 {
        let fail = self.conns.get(cix).map(|c| c.kind == ConnKind::Fail) == Some(true);
        if fail {
            self.ops.get(oix).map(|o| o.dead_tc_op).unwrap_or(0)
        } else {
            oix.raw()
        }
    }

    pub(crate) fn commit_fanout_run(&mut self, cix: Ix<ApiConnect>, from: Option<Ix<TcOp>>) {
        let (state, transid, gci) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.transid, c.gci.unwrap_or(0))
        };
        if !matches!(state, ConnState::Committing | ConnState::FailCommitting) {
            return;
        }
        let mut cur = from.or(self.conns.get(cix).expect("conn").first_op);
        let mut budget = FANOUT_BATCH;
        while let Some(oix) = cur {
            if budget == 0 {
                return self.continue_later(Job::CommitFanout {
                    conn: cix,
                    op: Some(oix),
                });
            }
            budget -= 1;
            let (next, phase_needed) = {
                let op = self.ops.get(oix).expect("op");
                (
                    op.next,
                    matches!(op.state, OpState::Prepared | OpState::TakeOver),
                )
            };
            if phase_needed {
                let handle = self.op_wire_handle(cix, oix);
                let targets: Vec<NodeId> = {
                    let op = self.ops.get_mut(oix).expect("op");
                    op.state = OpState::Committing;
                    op.clear_acks();
                    // Take-over: replicas already known committed need no
                    // second commit.
                    for i in 0..op.replicas.len().min(undertow_wire::MAX_REPLICAS) {
                        if op.replica_fail[i] == crate::op::ReplicaFailStatus::Committed {
                            op.acked |= 1 << i;
                        }
                    }
                    op.unacked().collect()
                };
                // A dead replica cannot ack; its survivors carry the
                // outcome.
                let live: Vec<NodeId> = targets
                    .into_iter()
                    .filter(|n| {
                        let alive = self.hosts.alive(*n);
                        if !alive {
                            self.ops.get_mut(oix).expect("op").ack_from(*n);
                        }
                        alive
                    })
                    .collect();
                {
                    let op = self.ops.get_mut(oix).expect("op");
                    if op.all_acked() {
                        op.state = OpState::Committed;
                    }
                }
                self.conns.get_mut(cix).expect("conn").pending_acks += live.len() as u32;
                for node in live {
                    self.send_packed(
                        node,
                        PackedClass::Lqh,
                        PackedItem::Commit(Commit {
                            tc_op: handle,
                            transid,
                            gci,
                        }),
                    );
                }
            }
            cur = next;
        }
        let done = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = if state == ConnState::FailCommitting {
                ConnState::FailCommitting
            } else {
                ConnState::CommitSent
            };
            c.pending_acks == 0
        };
        if done {
            self.commit_done(cix);
        }
    }

    pub(crate) fn on_committed(&mut self, s: Committed) {
        let Some((cix, oix)) = self.resolve_phase_op(s.tc_op, s.transid) else {
            debug!(target: "undertow", tc_op = s.tc_op, "late committed ack dropped");
            return;
        };
        let (state_ok, conn_state) = {
            let c = self.conns.get(cix).expect("conn");
            (
                matches!(
                    c.state,
                    ConnState::CommitSent
                        | ConnState::Committing
                        | ConnState::WaitCommitConf
                        | ConnState::FailCommitting
                ),
                c.state,
            )
        };
        if !state_ok {
            warn!(target: "undertow", tc_op = s.tc_op, state = ?conn_state, "committed ack in unexpected state");
            return;
        }
        if self.ops.get(oix).expect("op").state != OpState::Committing {
            warn!(target: "undertow", tc_op = s.tc_op, "duplicate committed ack ignored");
            return;
        }
        {
            let op = self.ops.get_mut(oix).expect("op");
            if !op.ack_from(s.node) {
                warn!(target: "undertow", tc_op = s.tc_op, node = s.node.0, "committed from non-replica");
                return;
            }
            if op.all_acked() {
                op.state = OpState::Committed;
            }
        }
        self.touch_conn(cix);
        let done = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.pending_acks = c.pending_acks.saturating_sub(1);
            c.pending_acks == 0
                && matches!(
                    c.state,
                    ConnState::CommitSent | ConnState::WaitCommitConf | ConnState::FailCommitting
                )
        };
        if done {
            self.commit_done(cix);
        }
    }

    /// All replicas of all operations committed: answer the client, hand
    /// the complete phase to the copy record, free the original for reuse.
    pub(crate) fn commit_done(&mut self, cix: Ix<ApiConnect>) {
        let kind = self.conns.get(cix).expect("conn").kind;
        if kind == ConnKind::Fail {
            return self.takeover_committed(cix);
        }
        let rs = self.conns.get(cix).expect("conn").return_signal;
        match rs {
            ReturnSignal::CommitConf => {
                let (api_ref, api_conn, transid, gci, marker) = {
                    let c = self.conns.get(cix).expect("conn");
                    (
                        c.api_ref,
                        c.api_conn,
                        c.transid,
                        c.gci.unwrap_or(0),
                        c.marker.is_some(),
                    )
                };
                if let Some(api) = api_ref {
                    self.send(
                        api,
                        Signal::TcCommitConf(TcCommitConf {
                            api_conn,
                            transid,
                            gci,
                            marker,
                        }),
                    );
                }
            }
            _ => {
                self.flush_key_conf(cix, true);
                self.flush_indx_conf(cix, true);
            }
        }

        let copy = self.conns.get(cix).expect("conn").copy;
        let Some(copy) = copy else {
            crate::system_error!("commit finished without a copy record");
        };
        // Move the transaction body onto the copy.
        let (transid, first, last, gci, nodes, api_ref, api_conn) = {
            let c = self.conns.get_mut(cix).expect("conn");
            (
                c.transid,
                c.first_op.take(),
                c.last_op.take(),
                c.gci,
                std::mem::take(&mut c.nodes),
                c.api_ref,
                c.api_conn,
            )
        };
        self.gcp_relink(cix, copy);
        {
            let k = self.conns.get_mut(copy).expect("copy");
            k.state = ConnState::Completing;
            k.transid = transid;
            k.first_op = first;
            k.last_op = last;
            k.gci = gci;
            k.nodes = nodes;
            k.api_ref = api_ref;
            k.api_conn = api_conn;
            k.pending_acks = 0;
        }
        self.touch_conn(copy);
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.copy = None;
            c.state = ConnState::Connected;
            c.exec_flag = false;
            c.pending_acks = 0;
        }
        self.handle_api_fail_release(cix);
        self.continue_later(Job::CompleteFanout {
            conn: copy,
            op: None,
        });
    }

    // ---- complete fan-out ------------------------------------------------

    pub(crate) fn complete_fanout_run(&mut self, cix: Ix<ApiConnect>, from: Option<Ix<TcOp>>) {
        let (state, transid) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.transid)
        };
        if !matches!(state, ConnState::Completing | ConnState::FailCompleted) {
            return;
        }
        let mut cur = from.or(self.conns.get(cix).expect("conn").first_op);
        let mut budget = FANOUT_BATCH;
        while let Some(oix) = cur {
            if budget == 0 {
                return self.continue_later(Job::CompleteFanout {
                    conn: cix,
                    op: Some(oix),
                });
            }
            budget -= 1;
            let (next, needed) = {
                let op = self.ops.get_mut(oix).expect("op");
                op.conn = Some(cix);
                (op.next, op.state == OpState::Committed)
            };
            if needed {
                let handle = self.op_wire_handle(cix, oix);
                let targets: Vec<NodeId> = {
                    let op = self.ops.get_mut(oix).expect("op");
                    op.state = OpState::Completing;
                    op.clear_acks();
                    op.replicas.clone()
                };
                let live: Vec<NodeId> = targets
                    .into_iter()
                    .filter(|n| {
                        let alive = self.hosts.alive(*n);
                        if !alive {
                            self.ops.get_mut(oix).expect("op").ack_from(*n);
                        }
                        alive
                    })
                    .collect();
                {
                    let op = self.ops.get_mut(oix).expect("op");
                    if op.all_acked() {
                        op.state = OpState::Completed;
                    }
                }
                self.conns.get_mut(cix).expect("conn").pending_acks += live.len() as u32;
                for node in live {
                    self.send_packed(
                        node,
                        PackedClass::Lqh,
                        PackedItem::Complete(Complete {
                            tc_op: handle,
                            transid,
                        }),
                    );
                }
            }
            cur = next;
        }
        let done = {
            let c = self.conns.get_mut(cix).expect("conn");
            if c.state == ConnState::Completing {
                c.state = ConnState::CompleteSent;
            }
            c.pending_acks == 0
        };
        if done {
            self.complete_done(cix);
        }
    }

    pub(crate) fn on_completed(&mut self, s: Completed) {
        let Some((cix, oix)) = self.resolve_phase_op(s.tc_op, s.transid) else {
            debug!(target: "undertow", tc_op = s.tc_op, "late completed ack dropped");
            return;
        };
        let state_ok = {
            let c = self.conns.get(cix).expect("conn");
            matches!(
                c.state,
                ConnState::CompleteSent
                    | ConnState::Completing
                    | ConnState::WaitCompleteConf
                    | ConnState::FailCompleted
            )
        };
        if !state_ok {
            warn!(target: "undertow", tc_op = s.tc_op, "completed ack in unexpected state");
            return;
        }
        if self.ops.get(oix).expect("op").state != OpState::Completing {
            warn!(target: "undertow", tc_op = s.tc_op, "duplicate completed ack ignored");
            return;
        }
        {
            let op = self.ops.get_mut(oix).expect("op");
            if !op.ack_from(s.node) {
                warn!(target: "undertow", tc_op = s.tc_op, node = s.node.0, "completed from non-replica");
                return;
            }
            if op.all_acked() {
                op.state = OpState::Completed;
            }
        }
        self.touch_conn(cix);
        let done = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.pending_acks = c.pending_acks.saturating_sub(1);
            c.pending_acks == 0
                && matches!(
                    c.state,
                    ConnState::CompleteSent | ConnState::WaitCompleteConf | ConnState::FailCompleted
                )
        };
        if done {
            self.complete_done(cix);
        }
    }

    pub(crate) fn complete_done(&mut self, cix: Ix<ApiConnect>) {
        self.gcp_unlink(cix);
        self.release_op_list(cix);
        let (kind, takeover_node) = {
            let c = self.conns.get(cix).expect("conn");
            (c.kind, c.takeover_node)
        };
        self.stop_conn_timer(cix);
        match kind {
            ConnKind::Fail => {
                self.takeover_finished_one(cix, takeover_node);
            }
            _ => {
                self.release_conn(cix);
            }
        }
    }

    /// Release every operation record of a finished transaction. Rebuilt
    /// take-over operations leave the fail hash first.
    pub(crate) fn release_op_list(&mut self, cix: Ix<ApiConnect>) {
        let is_fail = self.conns.get(cix).expect("conn").kind == ConnKind::Fail;
        let mut cur = self.conns.get(cix).expect("conn").first_op;
        while let Some(oix) = cur {
            cur = self.ops.get(oix).expect("op").next;
            if is_fail {
                self.unhook_fail_op(oix);
            }
            self.ops.release(oix);
        }
        let c = self.conns.get_mut(cix).expect("conn");
        c.first_op = None;
        c.last_op = None;
    }

    /// Resolve a commit/complete/abort ack to our operation: a live slot of
    /// ours, or a rebuilt take-over operation keyed by the dead
    /// coordinator's handle.
    pub(crate) fn resolve_phase_op(
        &self,
        tc_op: u32,
        transid: TransId,
    ) -> Option<(Ix<ApiConnect>, Ix<TcOp>)> {
        let oix: Ix<TcOp> = Ix::new(tc_op);
        if let Some(op) = self.ops.get(oix) {
            if let Some(cix) = op.conn {
                if let Some(c) = self.conns.get(cix) {
                    if c.state != ConnState::Disconnected && c.same_trans(transid) {
                        return Some((cix, oix));
                    }
                }
            }
        }
        self.find_fail_op(tc_op, transid)
    }

    // ---- global checkpoint records ---------------------------------------

    fn gcp_link(&mut self, cix: Ix<ApiConnect>, gci: u64) {
        let mut cur = self.gcp_first;
        let mut gix = None;
        while let Some(g) = cur {
            let rec = self.gcps.get(g).expect("gcp");
            if rec.gci == gci {
                gix = Some(g);
                break;
            }
            cur = rec.next;
        }
        let gix = match gix {
            Some(g) => g,
            None => {
                let Some(g) = self.gcps.seize() else {
                    crate::system_error!("global checkpoint pool exhausted");
                };
                self.gcps.get_mut(g).expect("gcp").gci = gci;
                match self.gcp_last {
                    Some(last) => self.gcps.get_mut(last).expect("gcp").next = Some(g),
                    None => self.gcp_first = Some(g),
                }
                self.gcp_last = Some(g);
                g
            }
        };
        let old_last = {
            let rec = self.gcps.get_mut(gix).expect("gcp");
            let old = rec.last_conn;
            rec.last_conn = Some(cix);
            if rec.first_conn.is_none() {
                rec.first_conn = Some(cix);
            }
            old
        };
        if let Some(prev) = old_last {
            self.conns.get_mut(prev).expect("conn").gcp_next = Some(cix);
        }
        let c = self.conns.get_mut(cix).expect("conn");
        c.gcp = Some(gix);
        c.gcp_prev = old_last;
        c.gcp_next = None;
    }

    /// Swap `from` for `to` on its epoch list (the copy record inherits the
    /// original's place when the complete phase moves over).
    fn gcp_relink(&mut self, from: Ix<ApiConnect>, to: Ix<ApiConnect>) {
        let (gix, prev, next) = {
            let c = self.conns.get_mut(from).expect("conn");
            (c.gcp.take(), c.gcp_prev.take(), c.gcp_next.take())
        };
        let Some(gix) = gix else { return };
        match prev {
            Some(p) => self.conns.get_mut(p).expect("conn").gcp_next = Some(to),
            None => self.gcps.get_mut(gix).expect("gcp").first_conn = Some(to),
        }
        match next {
            Some(n) => self.conns.get_mut(n).expect("conn").gcp_prev = Some(to),
            None => self.gcps.get_mut(gix).expect("gcp").last_conn = Some(to),
        }
        let k = self.conns.get_mut(to).expect("conn");
        k.gcp = Some(gix);
        k.gcp_prev = prev;
        k.gcp_next = next;
    }

    pub(crate) fn gcp_unlink(&mut self, cix: Ix<ApiConnect>) {
        let (gix, prev, next) = {
            let c = self.conns.get_mut(cix).expect("conn");
            (c.gcp.take(), c.gcp_prev.take(), c.gcp_next.take())
        };
        let Some(gix) = gix else { return };
        match prev {
            Some(p) => self.conns.get_mut(p).expect("conn").gcp_next = next,
            None => self.gcps.get_mut(gix).expect("gcp").first_conn = next,
        }
        match next {
            Some(n) => self.conns.get_mut(n).expect("conn").gcp_prev = prev,
            None => self.gcps.get_mut(gix).expect("gcp").last_conn = prev,
        }
        self.maybe_finish_gcp(gix);
    }

    fn maybe_finish_gcp(&mut self, gix: Ix<GcpRec>) {
        let (empty, flagged, gci) = {
            let g = self.gcps.get(gix).expect("gcp");
            (g.first_conn.is_none(), g.nomoretrans, g.gci)
        };
        if !(empty && flagged) {
            return;
        }
        let dih = BlockRef::dih(self.own);
        self.send(dih, Signal::GcpTcFinished(GcpTcFinished { gci }));
        // Unlink from the epoch chain.
        let next = self.gcps.get(gix).expect("gcp").next;
        if self.gcp_first == Some(gix) {
            self.gcp_first = next;
        } else {
            let mut cur = self.gcp_first;
            while let Some(g) = cur {
                let rec_next = self.gcps.get(g).expect("gcp").next;
                if rec_next == Some(gix) {
                    self.gcps.get_mut(g).expect("gcp").next = next;
                    break;
                }
                cur = rec_next;
            }
        }
        if self.gcp_last == Some(gix) {
            self.gcp_last = if self.gcp_first.is_none() {
                None
            } else {
                let mut cur = self.gcp_first;
                let mut last = cur;
                while let Some(g) = cur {
                    last = Some(g);
                    cur = self.gcps.get(g).expect("gcp").next;
                }
                last
            };
        }
        self.gcps.release(gix);
    }

    pub(crate) fn on_gcp_nomoretrans(&mut self, src: BlockRef, s: GcpNoMoreTrans) {
        let mut cur = self.gcp_first;
        while let Some(g) = cur {
            let (gci, next) = {
                let rec = self.gcps.get(g).expect("gcp");
                (rec.gci, rec.next)
            };
            if gci == s.gci {
                self.gcps.get_mut(g).expect("gcp").nomoretrans = true;
                self.maybe_finish_gcp(g);
                return;
            }
            cur = next;
        }
        // Nothing committed under this epoch.
        self.send(src, Signal::GcpTcFinished(GcpTcFinished { gci: s.gci }));
    }

    // ---- commit-ack markers ----------------------------------------------

    pub(crate) fn on_commit_ack(&mut self, s: TcCommitAck) {
        let Some(mix) = self.marker_hash.remove(s.transid, &mut self.markers) else {
            // Replays are idempotent: a missing marker is success.
            return;
        };
        let (nodes, conn) = {
            let m = self.markers.get(mix).expect("marker");
            (m.lqh_nodes.clone(), m.conn)
        };
        for node in nodes {
            if self.hosts.alive(node) {
                self.send_packed(
                    node,
                    PackedClass::Lqh,
                    PackedItem::RemoveMarker(RemoveMarker { transid: s.transid }),
                );
            }
        }
        if let Some(cix) = conn {
            if let Some(c) = self.conns.get_mut(cix) {
                if c.marker == Some(mix) {
                    c.marker = None;
                }
            }
        }
        self.markers.release(mix);
    }

    /// Drop a marker without fan-out (its transaction aborted; the handlers
    /// clear their own on abort).
    pub(crate) fn clear_marker(&mut self, cix: Ix<ApiConnect>) {
        let Some(mix) = self.conns.get(cix).and_then(|c| c.marker) else {
            return;
        };
        let transid = self.markers.get(mix).expect("marker").transid;
        self.marker_hash.remove(transid, &mut self.markers);
        self.markers.release(mix);
        self.conns.get_mut(cix).expect("conn").marker = None;
    }

    /// Take-over commit finished: tell the surviving client, then complete.
    fn takeover_committed(&mut self, cix: Ix<ApiConnect>) {
        let (api_ref, api_conn, transid, gci, marker) = {
            let c = self.conns.get(cix).expect("conn");
            (
                c.api_ref,
                c.api_conn,
                c.transid,
                c.gci.unwrap_or(0),
                c.marker.is_some(),
            )
        };
        if let Some(api) = api_ref {
            self.send(
                api,
                Signal::TcKeyFailConf(TcKeyFailConf {
                    api_conn,
                    transid,
                    gci,
                    marker,
                }),
            );
        }
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = ConnState::FailCompleted;
            c.pending_acks = 0;
        }
        self.complete_fanout_run(cix, None);
    }

}
