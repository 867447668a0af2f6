// The abort driver and the timeout watchdog.
//
// Aborts come from explicit client rollback, from operation failures, from
// the watchdog, and from node or api failures. The driver walks the
// operation list in bounded runs, sends abort to the primary replica of
// every operation the handlers have seen, waits for the acks, then releases
// everything and answers the client per its return-signal selection.
//
// The watchdog walks the connection array on a coarse period. Each slot's
// effective timeout is jittered by its index so that the two sides of a
// deadlock do not fire in the same tick and abort both transactions.

use crate::conn::{AbortState, ApiConnect, ConnKind, ConnState, ReturnSignal};
use crate::op::{OpState, TcOp};
use crate::{Job, Tc, ABORT_BATCH, TIMEOUT_BATCH};
use tracing::{debug, info, warn};
use undertow_base::Ix;
use undertow_wire::codes;
use undertow_wire::{
    AbortAllConf, AbortAllRef, Aborted, AbortReq, ApiFailConf, ApiFailReq, BlockRef,
    DisconnectRep, NodeId, Signal, TcHbRep, TcKeyFailRef, TcRollbackConf, TcRollbackRef,
    TcRollbackRep, TcRollbackReq,
};

/// Missed re-drive checks tolerated before a replica is reported dead:
/// abort and commit give up quickly, complete is patient.
const ABORT_RETRY_LIMIT: u8 = 3;
const COMMIT_RETRY_LIMIT: u8 = 3;
const COMPLETE_RETRY_LIMIT: u8 = 100;

impl Tc {
    // ---- client rollback -------------------------------------------------

    pub(crate) fn on_rollback_req(&mut self, src: BlockRef, s: TcRollbackReq) {
        let Some(cix) = self.conn_ix(s.tc_conn) else {
            return;
        };
        let (state, owned, same, abort_state, api_conn) = {
            let c = self.conns.get(cix).expect("conn");
            (
                c.state,
                c.owned_by(src),
                c.same_trans(s.transid),
                c.abort_state,
                c.api_conn,
            )
        };
        if !owned || (!same && state != ConnState::Connected) {
            return;
        }
        match state {
            ConnState::Connected => {
                // Nothing to roll back.
                self.send(
                    src,
                    Signal::TcRollbackConf(TcRollbackConf {
                        api_conn,
                        transid: s.transid,
                    }),
                );
            }
            ConnState::Started
            | ConnState::Receiving
            | ConnState::RecCommitting
            | ConnState::StartCommitting => {
                self.conns.get_mut(cix).expect("conn").return_signal = ReturnSignal::RollbackConf;
                self.abort_trans(cix, 0, line!());
            }
            ConnState::Aborting => {
                if abort_state == AbortState::Active {
                    self.conns.get_mut(cix).expect("conn").return_signal =
                        ReturnSignal::RollbackConf;
                } else {
                    self.conns.get_mut(cix).expect("conn").state = ConnState::Connected;
                    self.send(
                        src,
                        Signal::TcRollbackConf(TcRollbackConf {
                            api_conn,
                            transid: s.transid,
                        }),
                    );
                }
            }
            _ => {
                // Past the commit point there is no way back.
                self.send(
                    src,
                    Signal::TcRollbackRef(TcRollbackRef {
                        api_conn,
                        transid: s.transid,
                        code: codes::ROLLBACK_NOT_ALLOWED,
                    }),
                );
            }
        }
    }

    pub(crate) fn on_hb_rep(&mut self, src: BlockRef, s: TcHbRep) {
        if let Some(cix) = self.conn_ix(s.tc_conn) {
            let ok = {
                let c = self.conns.get(cix).expect("conn");
                c.owned_by(src) && c.same_trans(s.transid)
            };
            if ok {
                self.touch_conn(cix);
                self.touch_buddy(cix);
            }
        }
    }

    // ---- the abort driver ------------------------------------------------

    /// Move a transaction onto the abort path with `code` as its report.
    pub(crate) fn abort_trans(&mut self, cix: Ix<ApiConnect>, code: u32, line: u32) {
        let (state, abort_state) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.abort_state)
        };
        if state == ConnState::Aborting && abort_state == AbortState::Active {
            // Already aborting; the first error wins.
            return;
        }
        if matches!(
            state,
            ConnState::Committing
                | ConnState::CommitSent
                | ConnState::Completing
                | ConnState::CompleteSent
        ) {
            crate::system_error!("abort requested past the commit point");
        }
        debug!(target: "undertow", conn = ?cix, code, "transaction abort");
        self.counters.abort_count += 1;
        self.release_stream_cache(cix);
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = ConnState::Aborting;
            c.abort_state = AbortState::Active;
            c.abort_walk_done = false;
            c.pending_acks = 0;
            if c.returncode == 0 {
                c.returncode = code;
                c.return_line = line;
            }
            // Explicit rollbacks keep their conf; silenced (api-failed)
            // transactions stay silent.
            if matches!(
                c.return_signal,
                ReturnSignal::KeyConf | ReturnSignal::CommitConf
            ) {
                c.return_signal = if code == 0 {
                    ReturnSignal::RollbackConf
                } else {
                    ReturnSignal::RollbackRep
                };
            }
        }
        self.touch_conn(cix);
        self.abort_run(cix, None);
    }

    /// Release a half-assembled operation's streaming state.
    fn release_stream_cache(&mut self, cix: Ix<ApiConnect>) {
        let Some(caix) = self.conns.get_mut(cix).expect("conn").cache.take() else {
            return;
        };
        let (mut key, mut attr) = {
            let cache = self.caches.get_mut(caix).expect("cache");
            (
                std::mem::take(&mut cache.key),
                std::mem::take(&mut cache.attr),
            )
        };
        self.bufs.release(&mut key);
        self.bufs.release(&mut attr);
        self.caches.release(caix);
    }

    pub(crate) fn abort_run(&mut self, cix: Ix<ApiConnect>, from: Option<Ix<TcOp>>) {
        let (state, transid, kind) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.transid, c.kind)
        };
        if !matches!(state, ConnState::Aborting | ConnState::FailAborting) {
            return;
        }
        let mut cur = from.or(self.conns.get(cix).expect("conn").first_op);
        let mut budget = ABORT_BATCH;
        let mut release_local = Vec::new();
        while let Some(oix) = cur {
            if budget == 0 {
                for oix in release_local {
                    self.release_op(cix, oix);
                }
                return self.continue_later(Job::AbortContinue {
                    conn: cix,
                    op: Some(oix),
                });
            }
            budget -= 1;
            let (next, op_state) = {
                let op = self.ops.get(oix).expect("op");
                (op.next, op.state)
            };
            match op_state {
                OpState::Operating | OpState::Prepared => {
                    let handle = self.op_wire_handle(cix, oix);
                    let primary = {
                        let op = self.ops.get_mut(oix).expect("op");
                        op.state = OpState::Aborting;
                        op.clear_acks();
                        op.replicas.first().copied()
                    };
                    match primary {
                        Some(primary) if self.hosts.alive(primary) => {
                            self.conns.get_mut(cix).expect("conn").pending_acks += 1;
                            self.send(
                                BlockRef::lqh(primary),
                                Signal::AbortReq(AbortReq {
                                    tc_op: handle,
                                    transid,
                                }),
                            );
                        }
                        _ => {
                            // No one left to abort against.
                            self.ops.get_mut(oix).expect("op").state = OpState::Aborted;
                        }
                    }
                }
                OpState::TakeOver => {
                    // Take-over abort goes to every replica not yet known
                    // aborted.
                    let handle = self.op_wire_handle(cix, oix);
                    let targets: Vec<NodeId> = {
                        let op = self.ops.get_mut(oix).expect("op");
                        op.state = OpState::Aborting;
                        op.clear_acks();
                        for i in 0..op.replicas.len().min(undertow_wire::MAX_REPLICAS) {
                            if op.replica_fail[i] == crate::op::ReplicaFailStatus::Aborted {
                                op.acked |= 1 << i;
                            }
                        }
                        op.unacked().collect()
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
                    self.conns.get_mut(cix).expect("conn").pending_acks += live.len() as u32;
                    for node in live {
                        self.send(
                            BlockRef::lqh(node),
                            Signal::AbortReq(AbortReq {
                                tc_op: handle,
                                transid,
                            }),
                        );
                    }
                }
                OpState::Building | OpState::WaitKeyInfo | OpState::WaitAttr => {
                    // Never reached a handler; free it locally.
                    release_local.push(oix);
                }
                _ => {}
            }
            cur = next;
        }
        for oix in release_local {
            self.release_op(cix, oix);
        }
        let done = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.abort_walk_done = true;
            c.pending_acks == 0
        };
        if done {
            if kind == ConnKind::Fail {
                self.takeover_aborted(cix);
            } else {
                self.release_abort_resources(cix);
            }
        }
    }

    pub(crate) fn on_aborted(&mut self, s: Aborted) {
        let Some((cix, oix)) = self.resolve_phase_op(s.tc_op, s.transid) else {
            debug!(target: "undertow", tc_op = s.tc_op, "late aborted ack dropped");
            return;
        };
        let (conn_state, kind, walk_done) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.kind, c.abort_walk_done)
        };
        if !matches!(
            conn_state,
            ConnState::Aborting | ConnState::WaitAbortConf | ConnState::FailAborting
        ) {
            warn!(target: "undertow", tc_op = s.tc_op, "aborted ack in unexpected state");
            return;
        }
        if self.ops.get(oix).expect("op").state != OpState::Aborting {
            warn!(target: "undertow", tc_op = s.tc_op, "duplicate aborted ack ignored");
            return;
        }
        {
            let op = self.ops.get_mut(oix).expect("op");
            if kind == ConnKind::Fail {
                op.ack_from(s.node);
                if op.all_acked() {
                    op.state = OpState::Aborted;
                }
            } else {
                // The primary chains the abort through the replicas and
                // acks once.
                op.state = OpState::Aborted;
            }
        }
        let done = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.pending_acks = c.pending_acks.saturating_sub(1);
            c.pending_acks == 0 && walk_done
        };
        if done {
            if kind == ConnKind::Fail {
                self.takeover_aborted(cix);
            } else {
                self.release_abort_resources(cix);
            }
        }
    }

    /// Everything aborted: free the transaction's resources and answer the
    /// client.
    pub(crate) fn release_abort_resources(&mut self, cix: Ix<ApiConnect>) {
        self.release_stream_cache(cix);
        self.release_fired_triggers(cix);
        self.release_index_ops(cix);
        self.clear_marker(cix);
        self.release_op_list(cix);
        if let Some(copy) = self.conns.get_mut(cix).expect("conn").copy.take() {
            // Seized at the verify step; the commit never happened.
            self.release_conn(copy);
        }
        let (rs, api_ref, api_conn, transid, code, line, api_fail) = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.abort_state = AbortState::Idle;
            c.state = ConnState::Aborting;
            c.conf_ops.clear();
            c.indx_conf_ops.clear();
            c.nodes.clear_all();
            (
                c.return_signal,
                c.api_ref,
                c.api_conn,
                c.transid,
                c.returncode,
                c.return_line,
                c.api_fail,
            )
        };
        self.stop_conn_timer(cix);
        if let Some(api) = api_ref {
            match rs {
                ReturnSignal::RollbackConf => {
                    self.conns.get_mut(cix).expect("conn").state = ConnState::Connected;
                    self.send(
                        api,
                        Signal::TcRollbackConf(TcRollbackConf { api_conn, transid }),
                    );
                }
                ReturnSignal::RollbackRep | ReturnSignal::KeyConf | ReturnSignal::CommitConf => {
                    self.send(
                        api,
                        Signal::TcRollbackRep(TcRollbackRep {
                            api_conn,
                            transid,
                            code,
                            line,
                        }),
                    );
                }
                ReturnSignal::None => {}
            }
        }
        if api_fail {
            self.release_conn(cix);
        }
    }

    /// A take-over transaction finished aborting: tell the surviving client
    /// and free the record.
    pub(crate) fn takeover_aborted(&mut self, cix: Ix<ApiConnect>) {
        let (api_ref, api_conn, transid, node) = {
            let c = self.conns.get(cix).expect("conn");
            (c.api_ref, c.api_conn, c.transid, c.takeover_node)
        };
        if let Some(api) = api_ref {
            self.send(
                api,
                Signal::TcKeyFailRef(TcKeyFailRef { api_conn, transid }),
            );
        }
        self.clear_marker(cix);
        self.release_op_list(cix);
        self.stop_conn_timer(cix);
        self.takeover_finished_one(cix, node);
    }

    /// A committed or aborted transaction whose client died is released at
    /// its next quiet point.
    pub(crate) fn handle_api_fail_release(&mut self, cix: Ix<ApiConnect>) {
        let fail = self.conns.get(cix).expect("conn").api_fail;
        if fail {
            self.release_index_ops(cix);
            self.release_conn(cix);
        }
    }

    // ---- the watchdog ----------------------------------------------------

    pub(crate) fn on_time_signal(&mut self) {
        self.clock = self.clock.wrapping_add(1).max(1);
        if !self.timeout_scan_active
            && self.clock.wrapping_sub(self.last_timeout_check) >= self.cfg.timeout_check_ticks
        {
            self.timeout_scan_active = true;
            self.last_timeout_check = self.clock;
            self.continue_later(Job::TimeoutScan { pos: 0 });
        }
        if !self.frag_scan_active
            && self.clock.wrapping_sub(self.last_frag_check) >= self.cfg.timeout_check_ticks
        {
            self.frag_scan_active = true;
            self.last_frag_check = self.clock;
            self.continue_later(Job::FragTimeoutScan { pos: 0 });
        }
        self.maybe_report_counters();
        self.check_abort_all_done();
    }

    /// Effective deadlock timeout for a slot, jittered by the slot index so
    /// deadlocked peers time out in different ticks.
    fn slot_timeout_ticks(&self, slot: u32) -> u32 {
        let base = self.cfg.deadlock_ticks();
        let mask = if base < 100 {
            7
        } else if base < 1000 {
            31
        } else {
            63
        };
        base + (slot & mask)
    }

    pub(crate) fn timeout_scan_run(&mut self, pos: u32) {
        let cap = self.conns.capacity() as u32;
        let end = (pos + TIMEOUT_BATCH).min(cap);
        for raw in pos..end {
            let cix: Ix<ApiConnect> = Ix::new(raw);
            let timer = self.conn_timers[raw as usize];
            if timer == 0 {
                continue;
            }
            let (state, idle) = {
                let c = self.conns.get(cix).expect("conn");
                (c.state, c.prepared() && c.first_op.is_none())
            };
            if state == ConnState::Disconnected {
                self.conn_timers[raw as usize] = 0;
                continue;
            }
            let elapsed = self.clock.wrapping_sub(timer);
            let limit = if state == ConnState::Started && idle {
                // Nothing outstanding: only the (longer) inactivity limit
                // applies, and only when configured.
                match self.cfg.inactive_ticks() {
                    Some(t) => t,
                    None => continue,
                }
            } else {
                self.slot_timeout_ticks(raw)
            };
            if elapsed > limit {
                self.timeout_found(cix);
            }
        }
        if end < cap {
            self.continue_later(Job::TimeoutScan { pos: end });
        } else {
            self.timeout_scan_active = false;
        }
    }

    fn timeout_found(&mut self, cix: Ix<ApiConnect>) {
        let (state, scan) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.scan)
        };
        if let Some(scan) = scan {
            // Only a scan stuck on the cluster side times out here; one
            // waiting for the client to drain batches is the client's
            // business (the fragment timers watch the handlers).
            let waiting_on_cluster = self
                .scans
                .get(scan)
                .map(|s| s.running_count > 0 || s.state != crate::scan::ScanState::Running)
                .unwrap_or(false);
            if waiting_on_cluster {
                info!(target: "undertow", conn = ?cix, "scan timed out");
                self.scan_error(scan, codes::SCAN_TIME_OUT);
            } else {
                self.touch_conn(cix);
            }
            return;
        }
        match state {
            ConnState::Connected => self.stop_conn_timer(cix),
            ConnState::Started
            | ConnState::Receiving
            | ConnState::RecCommitting
            | ConnState::StartCommitting => {
                info!(target: "undertow", conn = ?cix, ?state, "transaction timed out");
                self.abort_trans(cix, codes::TIME_OUT, line!());
            }
            ConnState::PrepareToCommit => {
                // The verify round-trip is node-local; losing it is a bug.
                crate::system_error!("commit verify never answered");
            }
            // A fan-out continuation is still queued; let it finish.
            ConnState::Committing | ConnState::Completing => self.touch_conn(cix),
            ConnState::CommitSent => {
                self.conns.get_mut(cix).expect("conn").state = ConnState::WaitCommitConf;
                self.conns.get_mut(cix).expect("conn").timeout_counter = 0;
                self.resend_phase(cix, OpState::Committing);
            }
            ConnState::CompleteSent => {
                self.conns.get_mut(cix).expect("conn").state = ConnState::WaitCompleteConf;
                self.conns.get_mut(cix).expect("conn").timeout_counter = 0;
                self.resend_phase(cix, OpState::Completing);
            }
            ConnState::WaitCommitConf => self.retry_or_fail(cix, OpState::Committing, COMMIT_RETRY_LIMIT),
            ConnState::WaitCompleteConf => {
                self.retry_or_fail(cix, OpState::Completing, COMPLETE_RETRY_LIMIT)
            }
            ConnState::WaitAbortConf => self.retry_or_fail(cix, OpState::Aborting, ABORT_RETRY_LIMIT),
            ConnState::Aborting => {
                let active =
                    self.conns.get(cix).expect("conn").abort_state == AbortState::Active;
                if active {
                    self.conns.get_mut(cix).expect("conn").state = ConnState::WaitAbortConf;
                    self.retry_or_fail(cix, OpState::Aborting, ABORT_RETRY_LIMIT);
                } else {
                    self.stop_conn_timer(cix);
                }
            }
            // Take-over records are driven by their own engine; rebuilt
            // intake states have no timers of their own.
            _ => self.touch_conn(cix),
        }
    }

    /// Re-send the phase signal for every unacked replica, or report the
    /// replica dead once the retry budget is gone.
    fn retry_or_fail(&mut self, cix: Ix<ApiConnect>, phase: OpState, limit: u8) {
        let over = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.timeout_counter = c.timeout_counter.saturating_add(1);
            c.timeout_counter > limit
        };
        if over {
            let mut dead = Vec::new();
            let mut cur = self.conns.get(cix).expect("conn").first_op;
            while let Some(oix) = cur {
                let op = self.ops.get(oix).expect("op");
                if op.state == phase {
                    dead.extend(op.unacked());
                }
                cur = op.next;
            }
            dead.sort_unstable();
            dead.dedup();
            for node in dead {
                warn!(target: "undertow", node = node.0, "replica stopped answering, reporting");
                self.send(
                    BlockRef::cntr(self.own),
                    Signal::DisconnectRep(DisconnectRep { node }),
                );
            }
            self.touch_conn(cix);
            return;
        }
        self.resend_phase(cix, phase);
        self.touch_conn(cix);
    }

    pub(crate) fn resend_phase(&mut self, cix: Ix<ApiConnect>, phase: OpState) {
        let (transid, gci) = {
            let c = self.conns.get(cix).expect("conn");
            (c.transid, c.gci.unwrap_or(0))
        };
        let mut cur = self.conns.get(cix).expect("conn").first_op;
        while let Some(oix) = cur {
            let (next, matches_phase) = {
                let op = self.ops.get(oix).expect("op");
                (op.next, op.state == phase)
            };
            if matches_phase {
                let handle = self.op_wire_handle(cix, oix);
                let targets: Vec<NodeId> = {
                    let op = self.ops.get(oix).expect("op");
                    if phase == OpState::Aborting && self.conns.get(cix).expect("conn").kind != ConnKind::Fail {
                        op.replicas.first().copied().into_iter().collect()
                    } else {
                        op.unacked().collect()
                    }
                };
                for node in targets {
                    if !self.hosts.alive(node) {
                        continue;
                    }
                    let sig = match phase {
                        OpState::Committing => Signal::Commit(undertow_wire::Commit {
                            tc_op: handle,
                            transid,
                            gci,
                        }),
                        OpState::Completing => Signal::Complete(undertow_wire::Complete {
                            tc_op: handle,
                            transid,
                        }),
                        _ => Signal::AbortReq(AbortReq {
                            tc_op: handle,
                            transid,
                        }),
                    };
                    self.send(BlockRef::lqh(node), sig);
                }
            }
            cur = next;
        }
    }

    // ---- api failure -----------------------------------------------------

    pub(crate) fn on_api_fail_req(&mut self, src: BlockRef, s: ApiFailReq) {
        self.api_fail_pending.push((s.node, Some(src)));
        self.continue_later(Job::ApiFailContinue {
            node: s.node,
            pos: 0,
        });
    }

    pub(crate) fn on_disconnect_rep(&mut self, s: DisconnectRep) {
        // An api node dropped its link; clean up as for an api failure, with
        // nobody waiting on a conf.
        self.api_fail_pending.push((s.node, None));
        self.continue_later(Job::ApiFailContinue {
            node: s.node,
            pos: 0,
        });
    }

    pub(crate) fn api_fail_run(&mut self, node: NodeId, pos: u32) {
        let cap = self.conns.capacity() as u32;
        let end = (pos + crate::WALK_BATCH).min(cap);
        for raw in pos..end {
            let cix: Ix<ApiConnect> = Ix::new(raw);
            let (state, owned, scan) = {
                let c = self.conns.get(cix).expect("conn");
                (
                    c.state,
                    c.api_ref.map(|r| r.node) == Some(node),
                    c.scan,
                )
            };
            if !owned || state == ConnState::Disconnected {
                continue;
            }
            if let Some(scan) = scan {
                self.conns.get_mut(cix).expect("conn").api_fail = true;
                self.scan_error(scan, codes::SCAN_NODE_ERROR);
                continue;
            }
            match state {
                ConnState::Connected => {
                    self.release_index_ops(cix);
                    self.release_conn(cix);
                }
                ConnState::Started
                | ConnState::Receiving
                | ConnState::RecCommitting
                | ConnState::StartCommitting => {
                    let c = self.conns.get_mut(cix).expect("conn");
                    c.api_fail = true;
                    c.return_signal = ReturnSignal::None;
                    self.abort_trans(cix, 0, line!());
                }
                ConnState::Aborting => {
                    let c = self.conns.get_mut(cix).expect("conn");
                    c.api_fail = true;
                    c.return_signal = ReturnSignal::None;
                    if c.abort_state == AbortState::Idle {
                        self.release_conn(cix);
                    }
                }
                _ => {
                    // Mid-commit: finish the phases, release at the quiet
                    // point.
                    let c = self.conns.get_mut(cix).expect("conn");
                    c.api_fail = true;
                    c.return_signal = ReturnSignal::None;
                }
            }
        }
        if end < cap {
            return self.continue_later(Job::ApiFailContinue { node, pos: end });
        }
        // Markers owned by the failed client will never be acked; drop them
        // and their handler-side twins now.
        let stale: Vec<_> = self
            .markers
            .iter_live()
            .filter(|(_, m)| m.api_node == node)
            .map(|(mix, m)| (mix, m.transid, m.lqh_nodes.clone(), m.conn))
            .collect();
        for (mix, transid, nodes, conn) in stale {
            for n in nodes {
                if self.hosts.alive(n) {
                    self.send_packed(
                        n,
                        undertow_wire::PackedClass::Lqh,
                        undertow_wire::PackedItem::RemoveMarker(undertow_wire::RemoveMarker {
                            transid,
                        }),
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
            self.marker_hash.remove(transid, &mut self.markers);
            self.markers.release(mix);
        }
        if let Some(i) = self.api_fail_pending.iter().position(|(n, _)| *n == node) {
            let (_, reply) = self.api_fail_pending.remove(i);
            if let Some(dst) = reply {
                self.send(dst, Signal::ApiFailConf(ApiFailConf { node }));
            }
        }
    }

    // ---- abort everything (system restart) -------------------------------

    pub(crate) fn on_abort_all_req(&mut self, src: BlockRef) {
        if self.abort_all.is_some() {
            return self.send(
                src,
                Signal::AbortAllRef(AbortAllRef {
                    code: codes::ABORT_ERROR,
                }),
            );
        }
        self.abort_all = Some((src, 0));
        self.continue_later(Job::AbortAllContinue { pos: 0 });
    }

    pub(crate) fn abort_all_run(&mut self, pos: u32) {
        let cap = self.conns.capacity() as u32;
        let end = (pos + crate::WALK_BATCH).min(cap);
        for raw in pos..end {
            let cix: Ix<ApiConnect> = Ix::new(raw);
            let state = self.conns.get(cix).expect("conn").state;
            if matches!(
                state,
                ConnState::Started
                    | ConnState::Receiving
                    | ConnState::RecCommitting
                    | ConnState::StartCommitting
            ) {
                self.abort_trans(cix, codes::CLUSTER_SHUTDOWN, line!());
                if let Some((_, n)) = self.abort_all.as_mut() {
                    *n += 1;
                }
            }
        }
        if end < cap {
            self.continue_later(Job::AbortAllContinue { pos: end });
        }
    }

    /// Called each tick: confirm the abort-all once nothing is in flight.
    fn check_abort_all_done(&mut self) {
        let Some((dst, _)) = self.abort_all else {
            return;
        };
        let busy = self.conns.iter_live().any(|(_, c)| {
            matches!(
                c.state,
                ConnState::Started
                    | ConnState::Receiving
                    | ConnState::RecCommitting
                    | ConnState::StartCommitting
                    | ConnState::PrepareToCommit
                    | ConnState::Committing
                    | ConnState::CommitSent
                    | ConnState::Completing
                    | ConnState::CompleteSent
            ) || (c.state == ConnState::Aborting && c.abort_state == AbortState::Active)
        });
        if !busy {
            self.abort_all = None;
            self.send(dst, Signal::AbortAllConf(AbortAllConf {}));
        }
    }
}
