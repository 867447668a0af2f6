// Client request surface and operation dispatch: seize/release of
// connections, the key-request path from first signal to the query-handler
// request, and the prepare acks coming back.
//
// A key request may span several signals (keyinfo/attrinfo continuations);
// the assembly state lives in a cache record that exists only until the
// handler request has been fully emitted. From then on the operation is
// identified by its slot and the transaction id.

use crate::conn::{AbortState, ApiConnect, ConnKind, ConnState, ReturnSignal};
use crate::op::{hash_key, OpState, TcOp};
use crate::Tc;
use tracing::{debug, warn};
use undertow_base::Ix;
use undertow_wire::codes;
use undertow_wire::{
    AttrInfo, BlockRef, ConfOp, KeyInfo, LqhKeyConf, LqhKeyFlags, LqhKeyRef, LqhKeyReq, NodeId,
    OpKind, PackedClass, PackedItem, Signal, TableId, TcKeyConf, TcKeyRef, TcKeyReq, TcReleaseConf,
    TcReleaseRef, TcReleaseReq, TcRollbackRep, TcSeizeConf, TcSeizeRef, TcSeizeReq, TransId,
    ATTRINFO_WORDS, KEYINFO_WORDS, LQHKEYREQ_ATTR_WORDS, LQHKEYREQ_KEY_WORDS, MAX_REPLICAS,
};

/// Per-signal cap on client conf items (legacy send-array size).
const CONF_OPS_PER_SIGNAL: usize = 6;

/// Why an internal operation is being issued.
pub(crate) enum InternalOp {
    /// Index-maintenance write spawned by a fired trigger.
    TriggerChild {
        parent: Ix<TcOp>,
        index: undertow_wire::IndexId,
        op: OpKind,
    },
    /// Phase one of an index operation: read the index table.
    IndexRead { iop: Ix<crate::index::IndexOp> },
    /// Phase two: the client's operation against the base table.
    IndexExec {
        iop: Ix<crate::index::IndexOp>,
        op: OpKind,
        client_data: u32,
        abort_on_error: bool,
    },
}

impl Tc {
    // ---- connection open / close -----------------------------------------

    pub(crate) fn on_seize_req(&mut self, src: BlockRef, s: TcSeizeReq) {
        if let Err(code) = self.allow_start(src.node) {
            self.send(
                src,
                Signal::TcSeizeRef(TcSeizeRef {
                    api_conn: s.api_conn,
                    code,
                }),
            );
            return;
        }
        match self.seize_conn(ConnKind::User) {
            Some(cix) => {
                let rec = self.conns.get_mut(cix).expect("conn");
                rec.api_ref = Some(src);
                rec.api_conn = s.api_conn;
                debug!(target: "undertow", conn = ?cix, api = src.node.0, "connection seized");
                self.send(
                    src,
                    Signal::TcSeizeConf(TcSeizeConf {
                        api_conn: s.api_conn,
                        tc_conn: cix.raw(),
                    }),
                );
            }
            None => {
                self.send(
                    src,
                    Signal::TcSeizeRef(TcSeizeRef {
                        api_conn: s.api_conn,
                        code: codes::NO_FREE_API_CONNECTION,
                    }),
                );
            }
        }
    }

    pub(crate) fn on_release_req(&mut self, src: BlockRef, s: TcReleaseReq) {
        let refuse = |tc: &mut Tc, code: u32| {
            tc.send(
                src,
                Signal::TcReleaseRef(TcReleaseRef {
                    api_conn: s.api_conn,
                    code,
                }),
            );
        };
        let Some(cix) = self.conn_ix(s.tc_conn) else {
            return refuse(self, codes::INVALID_CONNECTION);
        };
        let allowed = {
            let c = self.conns.get(cix).expect("conn");
            c.owned_by(src)
                && c.scan.is_none()
                && match c.state {
                    ConnState::Connected => true,
                    ConnState::Aborting => c.abort_state == AbortState::Idle,
                    ConnState::Started => c.first_op.is_none(),
                    _ => false,
                }
        };
        if !allowed {
            return refuse(self, codes::INVALID_CONNECTION);
        }
        self.detach_marker(cix);
        self.release_index_ops(cix);
        self.release_conn(cix);
        self.send(
            src,
            Signal::TcReleaseConf(TcReleaseConf {
                api_conn: s.api_conn,
            }),
        );
    }

    /// A transaction releases its handle on the marker at release time; the
    /// marker itself survives in the hash until the client's commit-ack.
    pub(crate) fn detach_marker(&mut self, cix: Ix<ApiConnect>) {
        if let Some(m) = self.conns.get(cix).and_then(|c| c.marker) {
            if let Some(marker) = self.markers.get_mut(m) {
                marker.conn = None;
            }
            self.conns.get_mut(cix).expect("conn").marker = None;
        }
    }

    // ---- key requests ----------------------------------------------------

    /// Reply to a structurally bad request (no such slot, foreign sender):
    /// a rollback report carrying the signal-error code.
    fn refuse_signal(&mut self, src: BlockRef, tc_conn: u32, transid: TransId) {
        warn!(target: "undertow", from = ?src, tc_conn, "malformed client signal");
        self.send(
            src,
            Signal::TcRollbackRep(TcRollbackRep {
                api_conn: tc_conn,
                transid,
                code: codes::SIGNAL_ERROR,
                line: line!(),
            }),
        );
    }

    fn send_key_ref(&mut self, cix: Ix<ApiConnect>, client_data: u32, code: u32) {
        let (api_ref, api_conn, transid) = {
            let c = self.conns.get(cix).expect("conn");
            (c.api_ref, c.api_conn, c.transid)
        };
        if let Some(dst) = api_ref {
            self.send(
                dst,
                Signal::TcKeyRef(TcKeyRef {
                    api_conn,
                    transid,
                    client_data,
                    code,
                }),
            );
        }
    }

    pub(crate) fn on_key_req(&mut self, src: BlockRef, req: TcKeyReq) {
        self.counters.attrinfo_count += req.attr.len() as u64;
        let Some(cix) = self.conn_ix(req.tc_conn) else {
            return self.refuse_signal(src, req.tc_conn, req.transid);
        };
        let (state, owned, same_trans, abort_state) = {
            let c = self.conns.get(cix).expect("conn");
            (
                c.state,
                c.owned_by(src),
                c.same_trans(req.transid),
                c.abort_state,
            )
        };
        match state {
            ConnState::Disconnected => self.refuse_signal(src, req.tc_conn, req.transid),
            ConnState::Connected => {
                if !owned {
                    return self.refuse_signal(src, req.tc_conn, req.transid);
                }
                if self.conns.get(cix).expect("conn").scan.is_some() {
                    return self.send_key_ref(cix, req.client_data, codes::SCAN_IN_PROGRESS);
                }
                if !req.flags.start {
                    return self.send_key_ref(cix, req.client_data, codes::STATE_ERROR);
                }
                if let Err(code) = self.allow_start(src.node) {
                    return self.send_key_ref(cix, req.client_data, code);
                }
                self.init_trans(cix, req.transid);
                if let Some(b) = req.buddy_conn {
                    self.conns.get_mut(cix).expect("conn").buddy = self.conn_ix(b);
                }
                self.start_op(cix, req);
            }
            ConnState::Started | ConnState::Receiving => {
                if !owned {
                    return self.refuse_signal(src, req.tc_conn, req.transid);
                }
                if !same_trans {
                    // Late signal from an earlier transaction on this slot.
                    debug!(target: "undertow", conn = ?cix, "transid mismatch, dropped");
                    return;
                }
                if req.flags.start {
                    return self.send_key_ref(cix, req.client_data, codes::STATE_ERROR);
                }
                self.start_op(cix, req);
            }
            s if s.in_commit() => {
                if same_trans && owned {
                    self.send_key_ref(cix, req.client_data, codes::COMMIT_IN_PROGRESS);
                }
            }
            ConnState::Aborting => {
                if !owned {
                    return;
                }
                if abort_state == AbortState::Active {
                    // Abort is running; further client signals are discarded.
                    return;
                }
                if req.flags.start {
                    // The aborted transaction is gone; the slot may host a
                    // fresh one.
                    if let Err(code) = self.allow_start(src.node) {
                        return self.send_key_ref(cix, req.client_data, code);
                    }
                    self.init_trans(cix, req.transid);
                    self.start_op(cix, req);
                    return;
                }
                if same_trans {
                    self.send_key_ref(cix, req.client_data, codes::ABORT_IN_PROGRESS);
                }
            }
            other => {
                warn!(target: "undertow", conn = ?cix, state = ?other, "key request in unexpected state");
            }
        }
    }

    /// Reset a connection record for a fresh transaction.
    pub(crate) fn init_trans(&mut self, cix: Ix<ApiConnect>, transid: TransId) {
        self.detach_marker(cix);
        self.release_index_ops(cix);
        let c = self.conns.get_mut(cix).expect("conn");
        c.state = ConnState::Started;
        c.transid = transid;
        c.first_op = None;
        c.last_op = None;
        c.lqhkeyreq_count = 0;
        c.lqhkeyconf_count = 0;
        c.pending_acks = 0;
        c.savepoint = 0;
        c.gci = None;
        c.gcp = None;
        c.gcp_next = None;
        c.gcp_prev = None;
        c.abort_state = AbortState::Idle;
        c.buddy = None;
        c.exec_flag = false;
        c.return_signal = ReturnSignal::KeyConf;
        c.returncode = 0;
        c.return_line = 0;
        c.nodes.clear_all();
        c.copy = None;
        c.conf_ops.clear();
        c.timeout_counter = 0;
        c.abort_walk_done = false;
        c.pending_trigger_ops = 0;
        c.trigger_pending = false;
        c.indx_conf_ops.clear();
        c.pending_index_ops = 0;
        c.accumulating_index_op = None;
        self.counters.trans_count += 1;
        self.touch_conn(cix);
    }

    fn start_op(&mut self, cix: Ix<ApiConnect>, req: TcKeyReq) {
        self.touch_conn(cix);
        self.touch_buddy(cix);
        if self.conns.get(cix).expect("conn").cache.is_some() {
            // New operation while the previous one is still streaming.
            return self.abort_trans(cix, codes::SIGNAL_ERROR, line!());
        }
        let Some(trec) = self.catalog.table(req.table) else {
            return self.abort_trans(cix, codes::NO_SUCH_TABLE, line!());
        };
        if !trec.usable(req.schema_version) {
            let code = trec.reject_code(req.schema_version);
            return self.abort_trans(cix, code, line!());
        }
        if req.key_len == 0 {
            return self.abort_trans(cix, codes::ZERO_KEYLEN, line!());
        }
        if req.key.len() > req.key_len as usize {
            return self.abort_trans(cix, codes::LENGTH_ERROR, line!());
        }
        if req.attr.len() > req.attr_len as usize {
            return self.abort_trans(cix, codes::TOO_MUCH_ATTRINFO, line!());
        }
        let Some(oix) = self.ops.seize() else {
            return self.abort_trans(cix, codes::NO_FREE_TC_CONNECTION, line!());
        };
        let Some(caix) = self.caches.seize() else {
            self.ops.release(oix);
            return self.abort_trans(cix, codes::NO_DATA_RECORD, line!());
        };

        let savepoint = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.cache = Some(caix);
            c.exec_flag |= req.flags.execute || req.flags.commit;
            let sp = c.savepoint;
            if req.flags.execute || req.flags.commit {
                c.savepoint += 1;
            }
            sp
        };
        {
            let dirty = req.flags.dirty && !req.op.is_write();
            match (req.op, dirty || req.flags.simple) {
                (OpKind::Read | OpKind::ReadExclusive, true) => {
                    self.counters.simple_read_count += 1
                }
                (OpKind::Read | OpKind::ReadExclusive, false) => self.counters.read_count += 1,
                _ => self.counters.write_count += 1,
            }
            let op = self.ops.get_mut(oix).expect("op");
            op.conn = Some(cix);
            op.op = req.op;
            op.dirty = dirty;
            op.simple = req.flags.simple;
            op.abort_on_error = req.flags.abort_on_error;
            op.savepoint = savepoint;
            op.client_data = req.client_data;
            op.attr_len = req.attr_len as u32;
            op.state = OpState::Building;
        }
        self.link_op(cix, oix);
        {
            let cache = self.caches.get_mut(caix).expect("cache");
            cache.table = req.table;
            cache.schema_version = req.schema_version;
            cache.op = Some(oix);
            cache.key_len = req.key_len;
            cache.attr_len = req.attr_len;
            cache.interpreted = req.flags.interpreted;
            cache.distribution_key = req.distribution_key;
        }
        if self.cache_append(cix, caix, &req.key, true).is_err()
            || self.cache_append(cix, caix, &req.attr, false).is_err()
        {
            return; // already aborting
        }
        self.op_pieces_arrived(cix, caix, req.flags.commit);
    }

    /// Append streamed words into the cache, aborting the transaction when
    /// the shared buffer pool is out of segments.
    fn cache_append(
        &mut self,
        cix: Ix<ApiConnect>,
        caix: Ix<crate::op::CacheRec>,
        words: &[u32],
        is_key: bool,
    ) -> Result<(), ()> {
        if words.is_empty() {
            return Ok(());
        }
        let cache = self.caches.get_mut(caix).expect("cache");
        let list = if is_key {
            &mut cache.key
        } else {
            &mut cache.attr
        };
        if self.bufs.append(list, words).is_err() {
            let code = if is_key {
                codes::NO_DATA_RECORD
            } else {
                codes::NO_ATTR_BUFFER
            };
            self.abort_trans(cix, code, line!());
            return Err(());
        }
        Ok(())
    }

    /// Advance connection/operation state after new pieces arrived; routes
    /// the operation once both key and attrinfo are complete.
    fn op_pieces_arrived(&mut self, cix: Ix<ApiConnect>, caix: Ix<crate::op::CacheRec>, commit: bool) {
        let (key_done, attr_done, oix) = {
            let cache = self.caches.get(caix).expect("cache");
            (
                cache.key_complete(),
                cache.attr_complete(),
                cache.op.expect("cache op"),
            )
        };
        if key_done && attr_done {
            let c = self.conns.get_mut(cix).expect("conn");
            if commit || c.state == ConnState::RecCommitting {
                c.state = ConnState::StartCommitting;
            } else {
                c.state = ConnState::Started;
            }
            self.route_op(cix, oix, caix);
        } else {
            let op = self.ops.get_mut(oix).expect("op");
            op.state = if key_done {
                OpState::WaitAttr
            } else {
                OpState::WaitKeyInfo
            };
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = if commit || c.state == ConnState::RecCommitting {
                ConnState::RecCommitting
            } else {
                ConnState::Receiving
            };
        }
    }

    pub(crate) fn on_key_info(&mut self, src: BlockRef, s: KeyInfo) {
        let Some(cix) = self.conn_ix(s.conn) else {
            return self.refuse_signal(src, s.conn, s.transid);
        };
        let (ok, caix) = {
            let c = self.conns.get(cix).expect("conn");
            let ok = c.owned_by(src)
                && c.same_trans(s.transid)
                && matches!(c.state, ConnState::Receiving | ConnState::RecCommitting);
            (ok, c.cache)
        };
        let Some(caix) = caix.filter(|_| ok) else {
            debug!(target: "undertow", conn = s.conn, "stray keyinfo dropped");
            return;
        };
        self.touch_conn(cix);
        {
            let cache = self.caches.get(caix).expect("cache");
            if cache.key.len() + s.words.len() as u32 > cache.key_len as u32 {
                return self.abort_trans(cix, codes::LENGTH_ERROR, line!());
            }
        }
        if self.cache_append(cix, caix, &s.words, true).is_err() {
            return;
        }
        self.op_pieces_arrived(cix, caix, false);
    }

    pub(crate) fn on_attr_info(&mut self, src: BlockRef, s: AttrInfo) {
        let Some(cix) = self.conn_ix(s.conn) else {
            return self.refuse_signal(src, s.conn, s.transid);
        };
        // A scan waiting for its operand program shares this signal.
        if let Some(scan) = self.conns.get(cix).and_then(|c| c.scan) {
            if self.scan_wants_attr(scan) {
                return self.scan_attr_info(cix, scan, s);
            }
        }
        let (ok, caix) = {
            let c = self.conns.get(cix).expect("conn");
            let ok = c.owned_by(src)
                && c.same_trans(s.transid)
                && matches!(c.state, ConnState::Receiving | ConnState::RecCommitting);
            (ok, c.cache)
        };
        let Some(caix) = caix.filter(|_| ok) else {
            debug!(target: "undertow", conn = s.conn, "stray attrinfo dropped");
            return;
        };
        self.touch_conn(cix);
        {
            let cache = self.caches.get(caix).expect("cache");
            if cache.attr.len() + s.words.len() as u32 > cache.attr_len as u32 {
                return self.abort_trans(cix, codes::TOO_MUCH_ATTRINFO, line!());
            }
        }
        if self.cache_append(cix, caix, &s.words, false).is_err() {
            return;
        }
        self.op_pieces_arrived(cix, caix, false);
    }

    // ---- operation routing -----------------------------------------------

    fn route_op(&mut self, cix: Ix<ApiConnect>, oix: Ix<TcOp>, caix: Ix<crate::op::CacheRec>) {
        let (key_words, attr_words, table, schema_version, hint, interpreted) = {
            let cache = self.caches.get(caix).expect("cache");
            (
                self.bufs.to_vec(&cache.key),
                self.bufs.to_vec(&cache.attr),
                cache.table,
                cache.schema_version,
                cache.distribution_key,
                cache.interpreted,
            )
        };
        // Release the assembly state before emission; the operation record
        // carries everything needed from here on.
        {
            let cache = self.caches.get_mut(caix).expect("cache");
            let mut key = std::mem::take(&mut cache.key);
            let mut attr = std::mem::take(&mut cache.attr);
            self.bufs.release(&mut key);
            self.bufs.release(&mut attr);
        }
        self.caches.release(caix);
        self.conns.get_mut(cix).expect("conn").cache = None;
        self.dispatch_op(
            cix,
            oix,
            table,
            schema_version,
            &key_words,
            &attr_words,
            hint,
            interpreted,
        );
    }

    /// Hash, look up replicas, and emit the query-handler request for a
    /// fully assembled operation. Shared by client operations, index
    /// phases and trigger-spawned maintenance writes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dispatch_op(
        &mut self,
        cix: Ix<ApiConnect>,
        oix: Ix<TcOp>,
        table: TableId,
        schema_version: u32,
        key_words: &[u32],
        attr_words: &[u32],
        hint: Option<u32>,
        interpreted: bool,
    ) {
        let Some(trec) = self.catalog.table(table) else {
            return self.abort_trans(cix, codes::NO_SUCH_TABLE, line!());
        };
        let (hash, distr_hash) = hash_key(trec, key_words, hint);
        let Some(frag) = self.dih.get_nodes(table, distr_hash) else {
            return self.abort_trans(cix, codes::UNKNOWN_TABLE, line!());
        };
        if frag.nodes.is_empty() || frag.nodes.len() > MAX_REPLICAS {
            crate::system_error!("distribution returned {} replicas", frag.nodes.len());
        }
        let (opkind, dirty, simple, savepoint, client_data, attr_len, index_op) = {
            let op = self.ops.get(oix).expect("op");
            (
                op.op,
                op.dirty,
                op.simple,
                op.savepoint,
                op.client_data,
                op.attr_len,
                op.index_op,
            )
        };
        // Phase-one index reads stream their result back to the
        // coordinator; everything else streams to the client.
        let is_index_read = index_op
            .and_then(|iop| self.index_ops.get(iop))
            .map(|i| i.read_op == Some(oix))
            .unwrap_or(false);
        // Dirty reads take one replica only, preferring the own node to
        // avoid a network hop. Locked reads go to the primary alone; only
        // writes walk the replica chain.
        let replicas: Vec<NodeId> = if dirty {
            if frag.nodes.contains(&self.own) {
                vec![self.own]
            } else {
                vec![frag.nodes[0]]
            }
        } else if !opkind.is_write() {
            vec![frag.nodes[0]]
        } else {
            frag.nodes.clone()
        };

        let mut marker_flag = false;
        if opkind.is_write() {
            let have = self.conns.get(cix).expect("conn").marker.is_some();
            if !have {
                let Some(mix) = self.markers.seize() else {
                    return self.abort_trans(cix, codes::NO_FREE_MARKER, line!());
                };
                let (transid, api_node) = {
                    let c = self.conns.get(cix).expect("conn");
                    (c.transid, c.api_ref.map(|r| r.node).unwrap_or_default())
                };
                {
                    let m = self.markers.get_mut(mix).expect("marker");
                    m.transid = transid;
                    m.api_node = api_node;
                    m.lqh_nodes = replicas.clone();
                    m.conn = Some(cix);
                }
                self.marker_hash.insert(transid, mix, &mut self.markers);
                self.conns.get_mut(cix).expect("conn").marker = Some(mix);
                self.ops.get_mut(oix).expect("op").marker = Some(mix);
                marker_flag = true;
            }
        }

        let (transid, api_ref, api_conn) = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.lqhkeyreq_count += 1;
            if !dirty {
                for n in &replicas {
                    c.nodes.insert(n.0);
                }
            }
            (c.transid, c.api_ref, c.api_conn)
        };
        {
            let op = self.ops.get_mut(oix).expect("op");
            op.replicas = replicas.clone();
            op.clear_acks();
            op.state = OpState::Operating;
        }
        self.counters.ops_executed += 1;

        let reply_ref = if is_index_read {
            self.own_ref()
        } else {
            api_ref.unwrap_or_else(|| self.own_ref())
        };
        let primary = replicas[0];
        let lqh = BlockRef::lqh(primary);
        let inline_key = key_words[..key_words.len().min(LQHKEYREQ_KEY_WORDS)].to_vec();
        let inline_attr = attr_words[..attr_words.len().min(LQHKEYREQ_ATTR_WORDS)].to_vec();
        self.send(
            lqh,
            Signal::LqhKeyReq(Box::new(LqhKeyReq {
                tc_op: oix.raw(),
                tc_ref: self.own_ref(),
                transid,
                table,
                schema_version,
                fragment: frag.fragment,
                op: opkind,
                flags: LqhKeyFlags {
                    dirty,
                    simple,
                    interpreted,
                    marker: marker_flag,
                    no_disk: false,
                },
                backups: replicas[1..].to_vec(),
                replica_no: 0,
                fired_triggers: 0,
                savepoint,
                hash,
                key_len: key_words.len() as u16,
                attr_len: attr_len as u16,
                reply_ref,
                api_conn,
                client_data,
                key: inline_key,
                attr: inline_attr,
            })),
        );
        for chunk in key_words
            .get(LQHKEYREQ_KEY_WORDS..)
            .unwrap_or(&[])
            .chunks(KEYINFO_WORDS)
        {
            self.send(
                lqh,
                Signal::KeyInfo(KeyInfo {
                    conn: oix.raw(),
                    transid,
                    words: chunk.to_vec(),
                }),
            );
        }
        for chunk in attr_words
            .get(LQHKEYREQ_ATTR_WORDS..)
            .unwrap_or(&[])
            .chunks(ATTRINFO_WORDS)
        {
            self.send(
                lqh,
                Signal::AttrInfo(AttrInfo {
                    conn: oix.raw(),
                    transid,
                    words: chunk.to_vec(),
                }),
            );
        }
    }

    /// Seize and dispatch an operation originating inside the coordinator.
    pub(crate) fn issue_internal_op(
        &mut self,
        cix: Ix<ApiConnect>,
        table: TableId,
        key_words: &[u32],
        attr_words: &[u32],
        savepoint: u32,
        purpose: InternalOp,
    ) {
        let Some(oix) = self.ops.seize() else {
            return self.abort_trans(cix, codes::NO_FREE_TC_CONNECTION, line!());
        };
        let schema_version = match self.catalog.table(table) {
            Some(t) => t.schema_version,
            None => {
                self.ops.release(oix);
                return self.abort_trans(cix, codes::NO_SUCH_TABLE, line!());
            }
        };
        {
            let op = self.ops.get_mut(oix).expect("op");
            op.conn = Some(cix);
            op.savepoint = savepoint;
            op.attr_len = attr_words.len() as u32;
            op.state = OpState::Building;
            match &purpose {
                InternalOp::TriggerChild { parent, index, op: kind } => {
                    op.op = *kind;
                    op.abort_on_error = true;
                    op.triggering_op = Some(*parent);
                    op.current_index = Some(*index);
                }
                InternalOp::IndexRead { iop } => {
                    op.op = OpKind::Read;
                    op.abort_on_error = true;
                    op.index_op = Some(*iop);
                    op.client_data = iop.raw();
                }
                InternalOp::IndexExec {
                    iop,
                    op: kind,
                    client_data,
                    abort_on_error,
                } => {
                    op.op = *kind;
                    op.abort_on_error = *abort_on_error;
                    op.index_op = Some(*iop);
                    op.client_data = *client_data;
                }
            }
        }
        match &purpose {
            InternalOp::TriggerChild { parent, .. } => {
                if let Some(p) = self.ops.get_mut(*parent) {
                    p.trigger_exec_count += 1;
                }
            }
            InternalOp::IndexRead { iop } => {
                if let Some(i) = self.index_ops.get_mut(*iop) {
                    i.read_op = Some(oix);
                }
            }
            InternalOp::IndexExec { .. } => {}
        }
        self.link_op(cix, oix);
        self.dispatch_op(
            cix,
            oix,
            table,
            schema_version,
            key_words,
            attr_words,
            None,
            false,
        );
    }

    // ---- operation list management ---------------------------------------

    pub(crate) fn link_op(&mut self, cix: Ix<ApiConnect>, oix: Ix<TcOp>) {
        let last = {
            let c = self.conns.get(cix).expect("conn");
            c.last_op
        };
        match last {
            Some(tail) => {
                self.ops.get_mut(tail).expect("op").next = Some(oix);
                let op = self.ops.get_mut(oix).expect("op");
                op.prev = Some(tail);
                op.next = None;
                self.conns.get_mut(cix).expect("conn").last_op = Some(oix);
            }
            None => {
                let op = self.ops.get_mut(oix).expect("op");
                op.prev = None;
                op.next = None;
                let c = self.conns.get_mut(cix).expect("conn");
                c.first_op = Some(oix);
                c.last_op = Some(oix);
            }
        }
    }

    pub(crate) fn unlink_op(&mut self, cix: Ix<ApiConnect>, oix: Ix<TcOp>) {
        let (prev, next) = {
            let op = self.ops.get(oix).expect("op");
            (op.prev, op.next)
        };
        match prev {
            Some(p) => self.ops.get_mut(p).expect("op").next = next,
            None => self.conns.get_mut(cix).expect("conn").first_op = next,
        }
        match next {
            Some(n) => self.ops.get_mut(n).expect("op").prev = prev,
            None => self.conns.get_mut(cix).expect("conn").last_op = prev,
        }
    }

    pub(crate) fn release_op(&mut self, cix: Ix<ApiConnect>, oix: Ix<TcOp>) {
        self.unlink_op(cix, oix);
        self.ops.release(oix);
    }

    // ---- prepare acks ----------------------------------------------------

    pub(crate) fn on_lqh_key_conf(&mut self, src: BlockRef, conf: LqhKeyConf) {
        let oix: Ix<TcOp> = Ix::new(conf.tc_op);
        let Some(cix) = self.ops.get(oix).and_then(|o| o.conn) else {
            warn!(target: "undertow", tc_op = conf.tc_op, "prepare ack for unknown operation");
            return;
        };
        {
            let Some(c) = self.conns.get(cix) else { return };
            if c.state == ConnState::Disconnected || !c.same_trans(conf.transid) {
                debug!(target: "undertow", tc_op = conf.tc_op, "late prepare ack dropped");
                return;
            }
        }
        if self.ops.get(oix).expect("op").state != OpState::Operating {
            warn!(target: "undertow", tc_op = conf.tc_op, "duplicate prepare ack ignored");
            return;
        }
        {
            let op = self.ops.get_mut(oix).expect("op");
            op.last_lqh_conn = conf.lqh_conn;
            op.last_lqh_node = src.node;
        }
        if conf.fired_triggers > 0 {
            // Hold the prepare back until index maintenance has run.
            let all_received = {
                let op = self.ops.get_mut(oix).expect("op");
                op.fired_count = conf.fired_triggers;
                op.saved_conf = Some(conf);
                op.received_count == op.fired_count
            };
            self.conns.get_mut(cix).expect("conn").pending_trigger_ops += 1;
            if all_received {
                self.schedule_triggers(cix);
            }
            return;
        }
        self.op_prepared(cix, oix, conf);
    }

    /// Post-prepare bookkeeping, shared with the replay after trigger
    /// execution and with forgiven index misses.
    pub(crate) fn op_prepared(&mut self, cix: Ix<ApiConnect>, oix: Ix<TcOp>, conf: LqhKeyConf) {
        self.touch_conn(cix);
        {
            let op = self.ops.get_mut(oix).expect("op");
            op.state = OpState::Prepared;
        }
        self.conns.get_mut(cix).expect("conn").lqhkeyconf_count += 1;

        let (triggering, index_op, dirty, simple, is_write, client_data) = {
            let op = self.ops.get(oix).expect("op");
            (
                op.triggering_op,
                op.index_op,
                op.dirty,
                op.simple,
                op.op.is_write(),
                op.client_data,
            )
        };

        if let Some(parent) = triggering {
            // Index-maintenance child finished; maybe replay the parent.
            let replay = {
                match self.ops.get_mut(parent) {
                    Some(p) => {
                        p.trigger_exec_count -= 1;
                        p.trigger_exec_count == 0
                            && p.received_count == p.fired_count
                            && p.saved_conf.is_some()
                    }
                    None => false,
                }
            };
            if replay {
                let saved = self.ops.get_mut(parent).expect("op").saved_conf.take();
                self.conns.get_mut(cix).expect("conn").pending_trigger_ops -= 1;
                if let Some(saved) = saved {
                    self.op_prepared(cix, parent, saved);
                    return;
                }
            }
            self.check_trans_state(cix);
            return;
        }

        if let Some(iop) = index_op {
            let is_read_phase = self
                .index_ops
                .get(iop)
                .map(|i| i.read_op == Some(oix))
                .unwrap_or(false);
            if is_read_phase {
                self.index_read_conf(cix, iop, oix, conf);
            } else {
                self.index_exec_conf(cix, iop, oix, conf);
            }
            return;
        }

        if dirty || (simple && !is_write) {
            // Committed-read fast path: nothing to commit, release now.
            self.conns.get_mut(cix).expect("conn").conf_ops.push(ConfOp {
                client_data,
                read_len: conf.read_len,
            });
            self.release_op(cix, oix);
        } else {
            self.conns.get_mut(cix).expect("conn").conf_ops.push(ConfOp {
                client_data,
                read_len: conf.read_len,
            });
        }
        self.check_trans_state(cix);
    }

    /// Advance the transaction when acks drain: flush buffered confs on an
    /// execute point, or pass the commit point.
    pub(crate) fn check_trans_state(&mut self, cix: Ix<ApiConnect>) {
        let (state, prepared, exec_flag) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.prepared(), c.exec_flag)
        };
        match state {
            ConnState::StartCommitting => {
                if prepared {
                    self.start_commit(cix);
                }
            }
            ConnState::Started | ConnState::Receiving => {
                if exec_flag && prepared {
                    self.flush_key_conf(cix, false);
                    self.flush_indx_conf(cix, false);
                    self.conns.get_mut(cix).expect("conn").exec_flag = false;
                }
            }
            _ => {}
        }
    }

    /// Send buffered per-op confirms to the client, batched through the
    /// per-host packed buffer.
    pub(crate) fn flush_key_conf(&mut self, cix: Ix<ApiConnect>, commit: bool) {
        let (api_ref, api_conn, transid, marker, gci, items) = {
            let c = self.conns.get_mut(cix).expect("conn");
            (
                c.api_ref,
                c.api_conn,
                c.transid,
                c.marker.is_some(),
                c.gci,
                std::mem::take(&mut c.conf_ops),
            )
        };
        let Some(api) = api_ref else { return };
        if items.is_empty() {
            // Index-only transactions confirm through their own signal.
            let indx_pending = !self.conns.get(cix).expect("conn").indx_conf_ops.is_empty();
            if commit && !indx_pending {
                self.send_packed(
                    api.node,
                    PackedClass::ApiConf,
                    PackedItem::TcKeyConf(TcKeyConf {
                        api_conn,
                        transid,
                        commit: true,
                        gci,
                        marker,
                        ops: Vec::new(),
                    }),
                );
            }
            return;
        }
        let nchunks = items.len().div_ceil(CONF_OPS_PER_SIGNAL);
        for (i, chunk) in items.chunks(CONF_OPS_PER_SIGNAL).enumerate() {
            let last = i + 1 == nchunks;
            self.send_packed(
                api.node,
                PackedClass::ApiConf,
                PackedItem::TcKeyConf(TcKeyConf {
                    api_conn,
                    transid,
                    commit: commit && last,
                    gci: if commit && last { gci } else { None },
                    marker,
                    ops: chunk.to_vec(),
                }),
            );
        }
    }

    // ---- prepare refusals ------------------------------------------------

    pub(crate) fn on_lqh_key_ref(&mut self, _src: BlockRef, r: LqhKeyRef) {
        let oix: Ix<TcOp> = Ix::new(r.tc_op);
        let Some(cix) = self.ops.get(oix).and_then(|o| o.conn) else {
            warn!(target: "undertow", tc_op = r.tc_op, "prepare refusal for unknown operation");
            return;
        };
        {
            let Some(c) = self.conns.get(cix) else { return };
            if c.state == ConnState::Disconnected || !c.same_trans(r.transid) {
                return;
            }
        }
        if self.ops.get(oix).expect("op").state != OpState::Operating {
            warn!(target: "undertow", tc_op = r.tc_op, "late prepare refusal ignored");
            return;
        }
        self.touch_conn(cix);

        let (opkind, triggering, current_index, index_op, abort_on_error, has_marker, client_data) = {
            let op = self.ops.get(oix).expect("op");
            (
                op.op,
                op.triggering_op,
                op.current_index,
                op.index_op,
                op.abort_on_error,
                op.marker.is_some(),
                op.client_data,
            )
        };

        // A delete miss on an index still being built is not an error: the
        // row simply was not indexed yet.
        if triggering.is_some() && opkind == OpKind::Delete && r.code == codes::NOT_FOUND {
            let building = current_index
                .and_then(|ix| self.catalog.index(ix))
                .map(|i| i.state == crate::table::IndexState::Building)
                .unwrap_or(false);
            if building {
                let transid = self.conns.get(cix).expect("conn").transid;
                self.op_prepared(
                    cix,
                    oix,
                    LqhKeyConf {
                        tc_op: r.tc_op,
                        lqh_conn: 0,
                        transid,
                        read_len: 0,
                        fired_triggers: 0,
                    },
                );
                return;
            }
        }

        // A duplicate in a unique index surfaces as the constraint error,
        // not as a mysterious existing row in an internal table.
        let code = if triggering.is_some() && opkind == OpKind::Insert && r.code == codes::ALREADY_EXISTS
        {
            codes::NOT_UNIQUE
        } else {
            r.code
        };

        if let Some(iop) = index_op {
            let is_read_phase = self
                .index_ops
                .get(iop)
                .map(|i| i.read_op == Some(oix))
                .unwrap_or(false);
            if is_read_phase {
                self.index_read_ref(cix, iop, oix, code);
                return;
            }
            self.index_exec_ref(cix, iop, oix, code);
            return;
        }

        let permitted = matches!(
            (code, opkind),
            (codes::NOT_FOUND, OpKind::Delete | OpKind::Update)
                | (codes::ALREADY_EXISTS, OpKind::Insert)
        ) || (matches!(opkind, OpKind::Write)
            && (code == codes::WRITE_CONSTRAINT_A || code == codes::WRITE_CONSTRAINT_B));

        if abort_on_error || triggering.is_some() || has_marker || !permitted {
            return self.abort_trans(cix, code, line!());
        }

        // Per-operation refusal: the transaction survives, the operation
        // vanishes from its accounting.
        self.conns.get_mut(cix).expect("conn").lqhkeyreq_count -= 1;
        self.send_key_ref(cix, client_data, code);
        self.release_op(cix, oix);
        self.check_trans_state(cix);
    }
}
