//! In-process cluster simulator: a coordinator wired to scripted stand-ins
//! for the query handlers, the distribution service and the cluster
//! controller. The demo binary boots on it and the scenario tests drive it.
//!
//! The stand-ins model just enough of their contracts to exercise the
//! coordinator: handlers stage writes at prepare, chain requests through the
//! replica list, fire index-maintenance triggers on the primary, apply on
//! commit, answer scans in batches, and report surviving operations for a
//! take-over sweep. None of it stores anything durably.

use crate::{Distribution, FragmentNodes, Tc, TcConfig};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::debug;
use undertow_wire::codes;
use undertow_wire::{
    attr, AbortReq, Aborted, AttrInfo, Block, BlockRef, Commit, Committed, Complete, Completed,
    DiFcountConf, DiGetPrimConf, DiSeizeConf, DiVerifyConf, FireTrigOrd, KeyInfo, LqhKeyConf,
    LqhKeyRef, LqhKeyReq, LqhTransConf, Msg, NodeId, OpKind, ReadConfigReq, ReadNodesConf,
    ScanFragConf, ScanFragNextReq, ScanFragReq, Signal, Sttor, TableId, TransId, TransIdAi,
    TrigAttrInfo, TrigPayloadKind, TriggerEvent,
};

/// Fragment layout of the simulated cluster: per table, one replica list
/// per fragment, primary first.
#[derive(Debug, Default)]
pub struct DihInner {
    pub tables: HashMap<TableId, Vec<Vec<NodeId>>>,
    pub current_gci: u64,
    next_cursor: u32,
}

#[derive(Clone)]
pub struct SharedDih(pub Rc<RefCell<DihInner>>);

impl Distribution for SharedDih {
    fn get_nodes(&self, table: TableId, distr_hash: u32) -> Option<FragmentNodes> {
        let inner = self.0.borrow();
        let frags = inner.tables.get(&table)?;
        if frags.is_empty() {
            return None;
        }
        let fragment = distr_hash % frags.len() as u32;
        Some(FragmentNodes {
            fragment,
            nodes: frags[fragment as usize].clone(),
        })
    }
}

/// An index-maintenance trigger as the handlers see it.
#[derive(Clone, Debug)]
pub struct SimTrigger {
    pub trigger: u32,
    pub base: TableId,
    pub event: TriggerEvent,
}

#[derive(Clone, Debug)]
struct StagedOp {
    op: OpKind,
    table: TableId,
    key: Vec<u32>,
    value: Vec<u32>,
    committed: bool,
    backups: Vec<NodeId>,
    gci: u64,
}

#[derive(Debug, Default)]
struct PendingReq {
    req: Option<Box<LqhKeyReq>>,
    src_is_chain: bool,
    key: Vec<u32>,
    attr: Vec<u32>,
}

#[derive(Debug)]
struct ScanCursor {
    scan_frag: u32,
    remaining: u32,
    transid: TransId,
}

/// One simulated query handler.
pub struct SimLqh {
    pub node: NodeId,
    pub dead: bool,
    /// Swallow commit signals without acking (for re-drive tests).
    pub hold_commits: bool,
    /// Swallow fragment-scan requests (for scan-timeout tests).
    pub hold_scans: bool,
    rows: HashMap<(TableId, Vec<u32>), Vec<u32>>,
    staged: HashMap<(u32, u64), StagedOp>,
    pending: HashMap<u32, PendingReq>,
    markers: HashMap<u64, ()>,
    scans: HashMap<u32, ScanCursor>,
    next_conn: u32,
    /// Rows per (table, fragment) that a scan of this node yields.
    pub scan_rows: HashMap<(TableId, u32), u32>,
    /// Extra take-over rows a test wants reported before the sentinel.
    pub trans_rows: Vec<LqhTransConf>,
}

impl SimLqh {
    fn new(node: NodeId) -> SimLqh {
        SimLqh {
            node,
            dead: false,
            hold_commits: false,
            hold_scans: false,
            rows: HashMap::new(),
            staged: HashMap::new(),
            pending: HashMap::new(),
            markers: HashMap::new(),
            scans: HashMap::new(),
            next_conn: 1,
            scan_rows: HashMap::new(),
            trans_rows: Vec::new(),
        }
    }

    pub fn row(&self, table: TableId, key: &[u32]) -> Option<&Vec<u32>> {
        self.rows.get(&(table, key.to_vec()))
    }

    pub fn has_marker(&self, transid: TransId) -> bool {
        self.markers.contains_key(&transid.0)
    }

    pub fn insert_row(&mut self, table: TableId, key: Vec<u32>, value: Vec<u32>) {
        self.rows.insert((table, key), value);
    }

    fn me(&self) -> BlockRef {
        BlockRef::lqh(self.node)
    }

    fn handle(&mut self, src: BlockRef, signal: Signal, triggers: &[SimTrigger]) -> Vec<Msg> {
        match signal {
            Signal::LqhKeyReq(req) => self.on_key_req(src, *req, triggers),
            Signal::KeyInfo(s) => self.on_key_info(s, triggers),
            Signal::AttrInfo(s) => self.on_attr_info(s, triggers),
            Signal::Commit(s) => self.on_commit(src, s),
            Signal::Complete(s) => self.on_complete(src, s),
            Signal::AbortReq(s) => self.on_abort(src, s),
            Signal::RemoveMarker(s) => {
                self.markers.remove(&s.transid.0);
                Vec::new()
            }
            Signal::ScanFragReq(s) => self.on_scan_frag_req(src, s),
            Signal::ScanFragNextReq(s) => self.on_scan_frag_next(src, s),
            Signal::LqhTransReq(_) => self.on_trans_req(src),
            Signal::Packed(p) => {
                let mut out = Vec::new();
                for item in p.items {
                    let sig = match item {
                        undertow_wire::PackedItem::Commit(s) => Signal::Commit(s),
                        undertow_wire::PackedItem::Complete(s) => Signal::Complete(s),
                        undertow_wire::PackedItem::RemoveMarker(s) => Signal::RemoveMarker(s),
                        other => {
                            debug!(target: "undertow", ?other, "client conf packed at a handler");
                            continue;
                        }
                    };
                    out.extend(self.handle(src, sig, triggers));
                }
                out
            }
            other => {
                debug!(target: "undertow", node = self.node.0, ?other, "handler ignores signal");
                Vec::new()
            }
        }
    }

    fn on_key_req(&mut self, src: BlockRef, req: LqhKeyReq, triggers: &[SimTrigger]) -> Vec<Msg> {
        let tc_op = req.tc_op;
        let pending = PendingReq {
            key: req.key.clone(),
            attr: req.attr.clone(),
            src_is_chain: src.block == Block::Lqh,
            req: Some(Box::new(req)),
        };
        self.pending.insert(tc_op, pending);
        self.try_run_pending(tc_op, triggers)
    }

    fn on_key_info(&mut self, s: KeyInfo, triggers: &[SimTrigger]) -> Vec<Msg> {
        if let Some(p) = self.pending.get_mut(&s.conn) {
            p.key.extend_from_slice(&s.words);
        }
        self.try_run_pending(s.conn, triggers)
    }

    fn on_attr_info(&mut self, s: AttrInfo, triggers: &[SimTrigger]) -> Vec<Msg> {
        if let Some(p) = self.pending.get_mut(&s.conn) {
            p.attr.extend_from_slice(&s.words);
        }
        self.try_run_pending(s.conn, triggers)
    }

    fn try_run_pending(&mut self, tc_op: u32, triggers: &[SimTrigger]) -> Vec<Msg> {
        let ready = match self.pending.get(&tc_op) {
            Some(p) => {
                let req = p.req.as_ref().expect("pending req");
                p.key.len() >= req.key_len as usize && p.attr.len() >= req.attr_len as usize
            }
            None => false,
        };
        if !ready {
            return Vec::new();
        }
        let p = self.pending.remove(&tc_op).expect("pending");
        let req = *p.req.expect("pending req");
        self.run_op(req, p.key, p.attr, p.src_is_chain, triggers)
    }

    fn run_op(
        &mut self,
        req: LqhKeyReq,
        key: Vec<u32>,
        value: Vec<u32>,
        chained: bool,
        triggers: &[SimTrigger],
    ) -> Vec<Msg> {
        let mut out = Vec::new();
        let me = self.me();
        let row_key = (req.table, key.clone());
        let exists = self.rows.contains_key(&row_key);
        // Validity is decided on the primary; chained replicas trust it.
        if !chained {
            let code = match req.op {
                OpKind::Insert if exists => Some(codes::ALREADY_EXISTS),
                OpKind::Update | OpKind::Delete if !exists => Some(codes::NOT_FOUND),
                OpKind::Read | OpKind::ReadExclusive if !exists => Some(codes::NOT_FOUND),
                _ => None,
            };
            if let Some(code) = code {
                out.push(Msg {
                    src: me,
                    dst: req.tc_ref,
                    signal: Signal::LqhKeyRef(LqhKeyRef {
                        tc_op: req.tc_op,
                        transid: req.transid,
                        code,
                    }),
                });
                return out;
            }
        }
        if req.flags.marker {
            self.markers.insert(req.transid.0, ());
        }

        // Reads answer immediately; writes stage until commit.
        if !req.op.is_write() {
            let row = self.rows.get(&row_key).cloned().unwrap_or_default();
            out.push(Msg {
                src: me,
                dst: req.reply_ref,
                signal: Signal::TransIdAi(TransIdAi {
                    conn: req.client_data,
                    transid: req.transid,
                    last: true,
                    words: row.clone(),
                }),
            });
            if !req.flags.dirty && !req.flags.simple {
                // Locked read: the lock lives until commit/complete.
                self.staged.insert(
                    (req.tc_op, req.transid.0),
                    StagedOp {
                        op: req.op,
                        table: req.table,
                        key,
                        value: Vec::new(),
                        committed: false,
                        backups: Vec::new(),
                        gci: 0,
                    },
                );
            }
            out.push(Msg {
                src: me,
                dst: req.tc_ref,
                signal: Signal::LqhKeyConf(LqhKeyConf {
                    tc_op: req.tc_op,
                    lqh_conn: self.alloc_conn(),
                    transid: req.transid,
                    read_len: row.len() as u32,
                    fired_triggers: 0,
                }),
            });
            return out;
        }

        // Writes: fire index maintenance on the primary, then chain.
        let mut fired = req.fired_triggers;
        if !chained {
            for t in triggers.iter().filter(|t| t.base == req.table) {
                let matches = match (req.op, t.event) {
                    (OpKind::Insert, TriggerEvent::Insert) => true,
                    (OpKind::Update, TriggerEvent::Update) => true,
                    (OpKind::Delete, TriggerEvent::Delete) => true,
                    (OpKind::Write, TriggerEvent::Insert) => !exists,
                    (OpKind::Write, TriggerEvent::Update) => exists,
                    _ => false,
                };
                if !matches {
                    continue;
                }
                fired += 1;
                let mut key_payload = vec![attr::header(0, key.len() as u16)];
                key_payload.extend_from_slice(&key);
                let before = self.rows.get(&row_key).cloned().unwrap_or_default();
                let after = if req.op == OpKind::Delete {
                    Vec::new()
                } else {
                    value.clone()
                };
                for (kind, words) in [
                    (TrigPayloadKind::Key, key_payload),
                    (TrigPayloadKind::Before, before.clone()),
                    (TrigPayloadKind::After, after.clone()),
                ] {
                    if words.is_empty() && kind != TrigPayloadKind::Key {
                        continue;
                    }
                    out.push(Msg {
                        src: me,
                        dst: req.tc_ref,
                        signal: Signal::TrigAttrInfo(TrigAttrInfo {
                            trigger: t.trigger,
                            firing_op: req.tc_op,
                            kind,
                            words,
                        }),
                    });
                }
                out.push(Msg {
                    src: me,
                    dst: req.tc_ref,
                    signal: Signal::FireTrigOrd(FireTrigOrd {
                        firing_op: req.tc_op,
                        trigger: t.trigger,
                        event: t.event,
                        fragment: req.fragment,
                        key_words: key.len() as u32 + 1,
                        before_words: before.len() as u32,
                        after_words: after.len() as u32,
                    }),
                });
            }
        }

        self.staged.insert(
            (req.tc_op, req.transid.0),
            StagedOp {
                op: req.op,
                table: req.table,
                key: key.clone(),
                value: value.clone(),
                committed: false,
                backups: req.backups.clone(),
                gci: 0,
            },
        );

        match req.backups.split_first() {
            Some((next, rest)) => {
                let mut fwd = req.clone();
                fwd.backups = rest.to_vec();
                fwd.replica_no = req.replica_no + 1;
                fwd.fired_triggers = fired;
                fwd.key = key;
                fwd.attr = value;
                fwd.key_len = fwd.key.len() as u16;
                fwd.attr_len = fwd.attr.len() as u16;
                out.push(Msg {
                    src: me,
                    dst: BlockRef::lqh(*next),
                    signal: Signal::LqhKeyReq(Box::new(fwd)),
                });
            }
            None => {
                out.push(Msg {
                    src: me,
                    dst: req.tc_ref,
                    signal: Signal::LqhKeyConf(LqhKeyConf {
                        tc_op: req.tc_op,
                        lqh_conn: self.alloc_conn(),
                        transid: req.transid,
                        read_len: 0,
                        fired_triggers: fired,
                    }),
                });
            }
        }
        out
    }

    fn alloc_conn(&mut self) -> u32 {
        self.next_conn += 1;
        self.next_conn
    }

    fn on_commit(&mut self, src: BlockRef, s: Commit) -> Vec<Msg> {
        if self.hold_commits {
            return Vec::new();
        }
        if let Some(op) = self.staged.get_mut(&(s.tc_op, s.transid.0)) {
            if !op.committed {
                op.committed = true;
                op.gci = s.gci;
                match op.op {
                    OpKind::Delete => {
                        self.rows.remove(&(op.table, op.key.clone()));
                    }
                    OpKind::Insert | OpKind::Update | OpKind::Write => {
                        let (table, key, value) = (op.table, op.key.clone(), op.value.clone());
                        self.rows.insert((table, key), value);
                    }
                    _ => {}
                }
            }
        }
        vec![Msg {
            src: self.me(),
            dst: src,
            signal: Signal::Committed(Committed {
                tc_op: s.tc_op,
                transid: s.transid,
                node: self.node,
            }),
        }]
    }

    fn on_complete(&mut self, src: BlockRef, s: Complete) -> Vec<Msg> {
        self.staged.remove(&(s.tc_op, s.transid.0));
        vec![Msg {
            src: self.me(),
            dst: src,
            signal: Signal::Completed(Completed {
                tc_op: s.tc_op,
                transid: s.transid,
                node: self.node,
            }),
        }]
    }

    fn on_abort(&mut self, src: BlockRef, s: AbortReq) -> Vec<Msg> {
        let mut out = Vec::new();
        if let Some(op) = self.staged.remove(&(s.tc_op, s.transid.0)) {
            self.markers.remove(&s.transid.0);
            // Chain the abort down the replica list.
            if let Some(next) = op.backups.first() {
                out.push(Msg {
                    src: self.me(),
                    dst: BlockRef::lqh(*next),
                    signal: Signal::AbortReq(AbortReq {
                        tc_op: s.tc_op,
                        transid: s.transid,
                    }),
                });
            }
        }
        if src.block == Block::Tc {
            out.push(Msg {
                src: self.me(),
                dst: src,
                signal: Signal::Aborted(Aborted {
                    tc_op: s.tc_op,
                    transid: s.transid,
                    node: self.node,
                }),
            });
        }
        out
    }

    fn on_scan_frag_req(&mut self, src: BlockRef, s: ScanFragReq) -> Vec<Msg> {
        if self.hold_scans {
            return Vec::new();
        }
        let total = *self.scan_rows.get(&(s.table, s.fragment)).unwrap_or(&0);
        let lqh_conn = self.alloc_conn();
        let batch = (s.batch_rows as u32).min(total);
        let completed = batch == total;
        if completed {
            // One-shot fragment; no cursor survives.
        } else {
            self.scans.insert(
                lqh_conn,
                ScanCursor {
                    scan_frag: s.scan_frag,
                    remaining: total - batch,
                    transid: s.transid,
                },
            );
        }
        vec![Msg {
            src: self.me(),
            dst: src,
            signal: Signal::ScanFragConf(ScanFragConf {
                scan_frag: s.scan_frag,
                lqh_conn,
                transid: s.transid,
                completed,
                rows: batch,
                bytes: batch * 8,
            }),
        }]
    }

    fn on_scan_frag_next(&mut self, src: BlockRef, s: ScanFragNextReq) -> Vec<Msg> {
        let Some(cursor) = self.scans.get_mut(&s.lqh_conn) else {
            return Vec::new();
        };
        let scan_frag = cursor.scan_frag;
        let transid = cursor.transid;
        if s.close {
            self.scans.remove(&s.lqh_conn);
            return vec![Msg {
                src: self.me(),
                dst: src,
                signal: Signal::ScanFragConf(ScanFragConf {
                    scan_frag,
                    lqh_conn: s.lqh_conn,
                    transid,
                    completed: true,
                    rows: 0,
                    bytes: 0,
                }),
            }];
        }
        let batch = (s.batch_rows as u32).min(cursor.remaining);
        cursor.remaining -= batch;
        let completed = cursor.remaining == 0;
        if completed {
            self.scans.remove(&s.lqh_conn);
        }
        vec![Msg {
            src: self.me(),
            dst: src,
            signal: Signal::ScanFragConf(ScanFragConf {
                scan_frag,
                lqh_conn: s.lqh_conn,
                transid,
                completed,
                rows: batch,
                bytes: batch * 8,
            }),
        }]
    }

    fn on_trans_req(&mut self, src: BlockRef) -> Vec<Msg> {
        let mut out: Vec<Msg> = self
            .trans_rows
            .drain(..)
            .map(|mut row| {
                row.node = self.node;
                Msg {
                    src: BlockRef::lqh(self.node),
                    dst: src,
                    signal: Signal::LqhTransConf(Box::new(row)),
                }
            })
            .collect();
        out.push(Msg {
            src: self.me(),
            dst: src,
            signal: Signal::LqhTransConf(Box::new(LqhTransConf {
                status: undertow_wire::LqhTransStatus::LastTrans,
                node: self.node,
                ..LqhTransConf::default()
            })),
        });
        out
    }
}

/// The simulated cluster: one coordinator plus its collaborators.
pub struct Cluster {
    pub tc: Tc,
    pub lqhs: HashMap<u16, SimLqh>,
    pub dih: Rc<RefCell<DihInner>>,
    pub triggers: Vec<SimTrigger>,
    /// Everything addressed to api blocks, in send order.
    pub api_msgs: Vec<Msg>,
    /// Everything addressed to the cluster controller.
    pub cntr_msgs: Vec<Msg>,
    /// Finished-epoch reports to the distribution service.
    pub gcp_finished: Vec<u64>,
}

/// The api node every test client sends from.
pub const API_NODE: NodeId = NodeId(100);

impl Cluster {
    /// Boot a coordinator on `own` with the given data nodes alive.
    pub fn new(own: NodeId, data_nodes: &[u16], cfg: TcConfig) -> Cluster {
        let dih = Rc::new(RefCell::new(DihInner {
            current_gci: 7,
            ..DihInner::default()
        }));
        let tc = Tc::new(cfg.clone(), own, Box::new(SharedDih(dih.clone())));
        let mut cluster = Cluster {
            tc,
            lqhs: data_nodes
                .iter()
                .map(|n| (*n, SimLqh::new(NodeId(*n))))
                .collect(),
            dih,
            triggers: Vec::new(),
            api_msgs: Vec::new(),
            cntr_msgs: Vec::new(),
            gcp_finished: Vec::new(),
        };
        let cntr = BlockRef::cntr(own);
        let tc_ref = BlockRef::tc(own);
        let config = serde_json::to_string(&cfg).expect("config json");
        for signal in [
            Signal::ReadConfigReq(ReadConfigReq { config }),
            Signal::Sttor(Sttor { phase: 1 }),
            Signal::NdbSttor(undertow_wire::NdbSttor { phase: 1 }),
            Signal::NdbSttor(undertow_wire::NdbSttor { phase: 2 }),
            Signal::NdbSttor(undertow_wire::NdbSttor { phase: 6 }),
        ] {
            cluster.tc.deliver(Msg {
                src: cntr,
                dst: tc_ref,
                signal,
            });
            cluster.pump();
        }
        cluster
    }

    /// Define a table with `fragments` replica lists and activate it.
    pub fn create_table(&mut self, table: TableId, fragments: Vec<Vec<NodeId>>) {
        self.dih.borrow_mut().tables.insert(table, fragments);
        let own = self.tc.own_node();
        self.deliver(Msg {
            src: BlockRef::dict(own),
            dst: BlockRef::tc(own),
            signal: Signal::TcSchverReq(undertow_wire::TcSchverReq {
                table,
                schema_version: 1,
                kind: undertow_wire::TableKind::Stored,
                stored: true,
                key_attrs: 1,
                has_char_attrs: false,
                distr_keys: 0,
            }),
        });
        self.pump();
    }

    /// Define a unique index over `base`: the index table, the index record
    /// and its three maintenance triggers, then bring it online.
    pub fn create_index(
        &mut self,
        index: undertow_wire::IndexId,
        base: TableId,
        fragments: Vec<Vec<NodeId>>,
        first_trigger: u32,
    ) {
        self.dih
            .borrow_mut()
            .tables
            .insert(index.as_table(), fragments);
        let own = self.tc.own_node();
        let dict = BlockRef::dict(own);
        let tc_ref = BlockRef::tc(own);
        self.deliver(Msg {
            src: dict,
            dst: tc_ref,
            signal: Signal::TcSchverReq(undertow_wire::TcSchverReq {
                table: index.as_table(),
                schema_version: 1,
                kind: undertow_wire::TableKind::Index,
                stored: true,
                key_attrs: 1,
                has_char_attrs: false,
                distr_keys: 0,
            }),
        });
        self.deliver(Msg {
            src: dict,
            dst: tc_ref,
            signal: Signal::CreateIndxReq(undertow_wire::CreateIndxReq {
                index,
                primary_table: base,
                attr_count: 1,
            }),
        });
        for (i, event) in [
            TriggerEvent::Insert,
            TriggerEvent::Update,
            TriggerEvent::Delete,
        ]
        .into_iter()
        .enumerate()
        {
            let trigger = first_trigger + i as u32;
            self.deliver(Msg {
                src: dict,
                dst: tc_ref,
                signal: Signal::CreateTrigReq(undertow_wire::CreateTrigReq {
                    trigger,
                    event,
                    index,
                }),
            });
            self.triggers.push(SimTrigger {
                trigger,
                base,
                event,
            });
        }
        self.deliver(Msg {
            src: dict,
            dst: tc_ref,
            signal: Signal::AlterIndxReq(undertow_wire::AlterIndxReq {
                index,
                online: true,
            }),
        });
        self.pump();
    }

    /// Send one client signal into the coordinator (and pump).
    pub fn api_send(&mut self, signal: Signal) {
        let msg = Msg {
            src: BlockRef::api(API_NODE),
            dst: BlockRef::tc(self.tc.own_node()),
            signal,
        };
        self.deliver(msg);
        self.pump();
    }

    pub fn deliver(&mut self, msg: Msg) {
        self.tc.deliver(msg);
    }

    /// Advance the coordinator clock by `ticks` 10 ms ticks.
    pub fn tick(&mut self, ticks: u32) {
        let own = self.tc.own_node();
        for _ in 0..ticks {
            self.tc.deliver(Msg {
                src: BlockRef::cntr(own),
                dst: BlockRef::tc(own),
                signal: Signal::TimeSignal(undertow_wire::TimeSignal {}),
            });
            self.pump();
        }
    }

    /// Run the coordinator and route its output until the cluster goes
    /// quiet.
    pub fn pump(&mut self) {
        for _ in 0..100_000 {
            self.tc.run();
            let out = self.tc.take_outbox();
            if out.is_empty() {
                return;
            }
            for msg in out {
                self.route(msg);
            }
        }
        panic!("simulated cluster did not quiesce");
    }

    fn route(&mut self, msg: Msg) {
        match msg.dst.block {
            Block::Api => self.api_msgs.push(msg),
            Block::Cntr => self.on_cntr(msg),
            Block::Dih => self.on_dih(msg),
            Block::Dict => {}
            Block::Lqh => {
                let node = msg.dst.node.0;
                let Some(lqh) = self.lqhs.get_mut(&node) else {
                    return;
                };
                if lqh.dead {
                    debug!(target: "undertow", node, "message to dead node dropped");
                    return;
                }
                let replies = lqh.handle(msg.src, msg.signal, &self.triggers);
                for r in replies {
                    if r.dst.block == Block::Lqh {
                        // Chained handler-to-handler traffic.
                        self.route(r);
                    } else if r.dst.block == Block::Api {
                        self.api_msgs.push(r);
                    } else {
                        self.tc.deliver(r);
                    }
                }
            }
            Block::Tc => self.tc.deliver(msg),
        }
    }

    fn on_cntr(&mut self, msg: Msg) {
        let own = self.tc.own_node();
        if let Signal::ReadNodesReq(_) = msg.signal {
            let nodes: Vec<NodeId> = self.lqhs.keys().map(|n| NodeId(*n)).collect();
            self.tc.deliver(Msg {
                src: BlockRef::cntr(own),
                dst: BlockRef::tc(own),
                signal: Signal::ReadNodesConf(ReadNodesConf {
                    nodes,
                    master: own,
                }),
            });
            return;
        }
        self.cntr_msgs.push(msg);
    }

    fn on_dih(&mut self, msg: Msg) {
        let own = self.tc.own_node();
        let reply = |signal| Msg {
            src: BlockRef::dih(own),
            dst: BlockRef::tc(own),
            signal,
        };
        match msg.signal {
            Signal::DiVerifyReq(s) => {
                let gci = self.dih.borrow().current_gci;
                self.tc.deliver(reply(Signal::DiVerifyConf(DiVerifyConf {
                    conn: s.conn,
                    gci,
                })));
            }
            Signal::DiSeizeReq(s) => {
                let cursor = {
                    let mut d = self.dih.borrow_mut();
                    d.next_cursor += 1;
                    d.next_cursor
                };
                self.tc.deliver(reply(Signal::DiSeizeConf(DiSeizeConf {
                    scan: s.scan,
                    dih_conn: cursor,
                })));
            }
            Signal::DiFcountReq(s) => {
                let fragments = self
                    .dih
                    .borrow()
                    .tables
                    .get(&s.table)
                    .map(|f| f.len() as u32)
                    .unwrap_or(0);
                self.tc.deliver(reply(Signal::DiFcountConf(DiFcountConf {
                    scan: s.scan,
                    table: s.table,
                    fragments,
                })));
            }
            Signal::DiGetPrimReq(s) => {
                let primary = self
                    .dih
                    .borrow()
                    .tables
                    .get(&s.table)
                    .and_then(|f| f.get(s.fragment as usize))
                    .and_then(|r| r.first().copied());
                match primary {
                    Some(primary) => {
                        self.tc
                            .deliver(reply(Signal::DiGetPrimConf(DiGetPrimConf {
                                scan_frag: s.scan_frag,
                                table: s.table,
                                fragment: s.fragment,
                                primary,
                            })));
                    }
                    None => {
                        self.tc
                            .deliver(reply(Signal::DiGetPrimRef(undertow_wire::DiGetPrimRef {
                                scan_frag: s.scan_frag,
                                code: codes::NO_FRAGMENT_RECORD,
                            })));
                    }
                }
            }
            Signal::GcpTcFinished(s) => {
                self.gcp_finished.push(s.gci);
            }
            other => {
                debug!(target: "undertow", ?other, "distribution stub ignores signal");
            }
        }
    }

    /// Kill a data node and report the failure.
    pub fn fail_node(&mut self, node: NodeId) {
        if let Some(lqh) = self.lqhs.get_mut(&node.0) {
            lqh.dead = true;
        }
        let own = self.tc.own_node();
        self.deliver(Msg {
            src: BlockRef::cntr(own),
            dst: BlockRef::tc(own),
            signal: Signal::NodeFailRep(undertow_wire::NodeFailRep {
                failed: vec![node],
                master: own,
            }),
        });
        self.pump();
    }

    /// Api-visible signals drained since the last call.
    pub fn take_api(&mut self) -> Vec<Signal> {
        let mut out = Vec::new();
        for msg in std::mem::take(&mut self.api_msgs) {
            match msg.signal {
                Signal::Packed(p) => {
                    for item in p.items {
                        out.push(match item {
                            undertow_wire::PackedItem::TcKeyConf(c) => Signal::TcKeyConf(c),
                            undertow_wire::PackedItem::TcIndxConf(c) => Signal::TcIndxConf(c),
                            undertow_wire::PackedItem::Commit(c) => Signal::Commit(c),
                            undertow_wire::PackedItem::Complete(c) => Signal::Complete(c),
                            undertow_wire::PackedItem::RemoveMarker(c) => Signal::RemoveMarker(c),
                        });
                    }
                }
                s => out.push(s),
            }
        }
        out
    }
}
