// Index-qualified operations.
//
// A secondary index is a separate table whose key is the index key and whose
// row carries the base table's primary key. An index-qualified operation
// translates in two phases inside the owning transaction: read the index
// table with the supplied index key, asking for the base primary key as
// result; then run the caller's operation against the base table with that
// key substituted, at the same save point. The coordinator is the reply
// target of the phase-one read, so the row data comes here instead of going
// to the client.

use crate::conn::{ApiConnect, ConnState};
use crate::keyreq::InternalOp;
use crate::op::TcOp;
use crate::Tc;
use tracing::{debug, warn};
use undertow_base::{Ix, SegList};
use undertow_wire::codes;
use undertow_wire::{
    attr, BlockRef, ConfOp, IndxAttrInfo, IndxKeyInfo, LqhKeyConf, PackedClass, PackedItem,
    Signal, TcIndxConf, TcIndxRef, TcIndxReq, TransIdAi,
};

const CONF_OPS_PER_SIGNAL: usize = 6;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IndexOpState {
    /// Collecting the client's key/attr pieces.
    #[default]
    Accumulating,
    /// Index-table read issued; waiting for both its halves.
    IndexAccess,
    /// Read confirmed, row data still streaming.
    WaitTransIdAi,
    /// Row data complete, confirm still missing.
    WaitConf,
    /// Base-table operation issued.
    IndexOperation,
}

#[derive(Debug, Default)]
pub struct IndexOp {
    pub state: IndexOpState,
    pub conn: Option<Ix<ApiConnect>>,
    /// The client's original request, replayed against the base table in
    /// phase two.
    pub req: Option<Box<TcIndxReq>>,
    pub key: SegList,
    pub attr: SegList,
    /// Accumulated phase-one result: the base table's primary key.
    pub transid_ai: SegList,
    pub ai_done: bool,
    pub conf: Option<LqhKeyConf>,
    pub read_op: Option<Ix<TcOp>>,
    pub savepoint: u32,
}

impl IndexOp {
    fn key_complete(&self) -> bool {
        match &self.req {
            Some(r) => self.key.len() >= r.key_len as u32,
            None => false,
        }
    }
    fn attr_complete(&self) -> bool {
        match &self.req {
            Some(r) => self.attr.len() >= r.attr_len as u32,
            None => false,
        }
    }
}

impl Tc {
    pub(crate) fn on_indx_req(&mut self, src: BlockRef, req: TcIndxReq) {
        let Some(cix) = self.conn_ix(req.tc_conn) else {
            return;
        };
        let (state, owned, same) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.owned_by(src), c.same_trans(req.transid))
        };
        if !owned {
            return;
        }
        let refuse = |tc: &mut Tc, code: u32| {
            let api_conn = tc.conns.get(cix).expect("conn").api_conn;
            tc.send(
                src,
                Signal::TcIndxRef(TcIndxRef {
                    api_conn,
                    transid: req.transid,
                    code,
                }),
            );
        };
        match state {
            ConnState::Connected => {
                if !req.flags.start {
                    return refuse(self, codes::STATE_ERROR);
                }
                if let Err(code) = self.allow_start(src.node) {
                    return refuse(self, code);
                }
                self.init_trans(cix, req.transid);
            }
            ConnState::Started | ConnState::Receiving => {
                if !same {
                    return;
                }
                if req.flags.start {
                    return refuse(self, codes::STATE_ERROR);
                }
            }
            s if s.in_commit() => {
                if same {
                    refuse(self, codes::COMMIT_IN_PROGRESS);
                }
                return;
            }
            _ => return,
        }
        let online = self
            .catalog
            .index(req.index)
            .map(|i| i.state == crate::table::IndexState::Online)
            .unwrap_or(false);
        if !online {
            return refuse(self, codes::UNKNOWN_TABLE);
        }
        let Some(iop) = self.index_ops.seize() else {
            return refuse(self, codes::NO_FREE_TC_CONNECTION);
        };
        self.touch_conn(cix);
        let savepoint = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.index_ops.push(iop);
            c.accumulating_index_op = Some(iop);
            c.pending_index_ops += 1;
            c.exec_flag |= req.flags.execute || req.flags.commit;
            let sp = c.savepoint;
            if req.flags.execute || req.flags.commit {
                c.savepoint += 1;
            }
            sp
        };
        let (key, attr) = (req.key.clone(), req.attr.clone());
        {
            let i = self.index_ops.get_mut(iop).expect("index op");
            i.conn = Some(cix);
            i.savepoint = savepoint;
            i.req = Some(Box::new(req));
        }
        if self.index_append(cix, iop, &key, true).is_err()
            || self.index_append(cix, iop, &attr, false).is_err()
        {
            return;
        }
        self.index_pieces_arrived(cix, iop);
    }

    fn index_append(
        &mut self,
        cix: Ix<ApiConnect>,
        iop: Ix<IndexOp>,
        words: &[u32],
        is_key: bool,
    ) -> Result<(), ()> {
        if words.is_empty() {
            return Ok(());
        }
        let i = self.index_ops.get_mut(iop).expect("index op");
        let list = if is_key { &mut i.key } else { &mut i.attr };
        if self.bufs.append(list, words).is_err() {
            self.abort_trans(cix, codes::NO_ATTR_BUFFER, line!());
            return Err(());
        }
        Ok(())
    }

    pub(crate) fn on_indx_key_info(&mut self, src: BlockRef, s: IndxKeyInfo) {
        self.index_continuation(src, s.tc_conn, s.transid, &s.words, true);
    }

    pub(crate) fn on_indx_attr_info(&mut self, src: BlockRef, s: IndxAttrInfo) {
        self.index_continuation(src, s.tc_conn, s.transid, &s.words, false);
    }

    fn index_continuation(
        &mut self,
        src: BlockRef,
        tc_conn: u32,
        transid: undertow_wire::TransId,
        words: &[u32],
        is_key: bool,
    ) {
        let Some(cix) = self.conn_ix(tc_conn) else {
            return;
        };
        let (ok, iop) = {
            let c = self.conns.get(cix).expect("conn");
            (
                c.owned_by(src) && c.same_trans(transid),
                c.accumulating_index_op,
            )
        };
        let Some(iop) = iop.filter(|_| ok) else {
            debug!(target: "undertow", tc_conn, "stray index continuation dropped");
            return;
        };
        self.touch_conn(cix);
        if self.index_append(cix, iop, words, is_key).is_err() {
            return;
        }
        self.index_pieces_arrived(cix, iop);
    }

    fn index_pieces_arrived(&mut self, cix: Ix<ApiConnect>, iop: Ix<IndexOp>) {
        let (done, commit) = {
            let i = self.index_ops.get(iop).expect("index op");
            (
                i.key_complete() && i.attr_complete(),
                i.req.as_ref().map(|r| r.flags.commit).unwrap_or(false),
            )
        };
        if !done {
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = if commit || c.state == ConnState::RecCommitting {
                ConnState::RecCommitting
            } else {
                ConnState::Receiving
            };
            return;
        }
        self.conns.get_mut(cix).expect("conn").accumulating_index_op = None;
        // Commit, if requested, waits until phase two is on the wire.
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = if commit {
                ConnState::RecCommitting
            } else {
                ConnState::Started
            };
        }
        self.start_index_read(cix, iop);
    }

    fn start_index_read(&mut self, cix: Ix<ApiConnect>, iop: Ix<IndexOp>) {
        let (key_words, index, savepoint) = {
            let i = self.index_ops.get_mut(iop).expect("index op");
            i.state = IndexOpState::IndexAccess;
            (
                self.bufs.to_vec(&i.key),
                i.req.as_ref().expect("index req").index,
                i.savepoint,
            )
        };
        self.issue_internal_op(
            cix,
            index.as_table(),
            &key_words,
            &[],
            savepoint,
            InternalOp::IndexRead { iop },
        );
    }

    // ---- phase-one replies -----------------------------------------------

    pub(crate) fn index_read_conf(
        &mut self,
        cix: Ix<ApiConnect>,
        iop: Ix<IndexOp>,
        _oix: Ix<TcOp>,
        conf: LqhKeyConf,
    ) {
        let ready = {
            let i = self.index_ops.get_mut(iop).expect("index op");
            i.conf = Some(conf);
            i.state = if i.ai_done {
                IndexOpState::IndexOperation
            } else {
                IndexOpState::WaitTransIdAi
            };
            i.ai_done
        };
        if ready {
            self.execute_index_op(cix, iop);
        }
    }

    pub(crate) fn on_transid_ai(&mut self, s: TransIdAi) {
        let iop: Ix<IndexOp> = Ix::new(s.conn);
        let Some(cix) = self.index_ops.get(iop).and_then(|i| i.conn) else {
            debug!(target: "undertow", conn = s.conn, "row data for unknown index operation");
            return;
        };
        {
            let same = self.conns.get(cix).map(|c| c.same_trans(s.transid)) == Some(true);
            if !same {
                return;
            }
        }
        {
            let mut list =
                std::mem::take(&mut self.index_ops.get_mut(iop).expect("index op").transid_ai);
            let failed = self.bufs.append(&mut list, &s.words).is_err();
            let i = self.index_ops.get_mut(iop).expect("index op");
            i.transid_ai = list;
            if failed {
                return self.abort_trans(cix, codes::NO_ATTR_BUFFER, line!());
            }
            if s.last {
                i.ai_done = true;
            }
        }
        let ready = {
            let i = self.index_ops.get_mut(iop).expect("index op");
            if i.ai_done && i.conf.is_some() {
                i.state = IndexOpState::IndexOperation;
                true
            } else {
                if i.ai_done {
                    i.state = IndexOpState::WaitConf;
                }
                false
            }
        };
        if ready {
            self.execute_index_op(cix, iop);
        }
    }

    pub(crate) fn index_read_ref(
        &mut self,
        cix: Ix<ApiConnect>,
        iop: Ix<IndexOp>,
        oix: Ix<TcOp>,
        code: u32,
    ) {
        // The index row was not there (or the read failed outright); the
        // client's operation never happens.
        let (abort, api_conn, api_ref, transid) = {
            let i = self.index_ops.get(iop).expect("index op");
            let abort = i
                .req
                .as_ref()
                .map(|r| r.flags.abort_on_error)
                .unwrap_or(true);
            let c = self.conns.get(cix).expect("conn");
            (abort, c.api_conn, c.api_ref, c.transid)
        };
        self.conns.get_mut(cix).expect("conn").lqhkeyreq_count -= 1;
        self.release_op(cix, oix);
        self.release_one_index_op(cix, iop);
        if let Some(api) = api_ref {
            self.send(
                api,
                Signal::TcIndxRef(TcIndxRef {
                    api_conn,
                    transid,
                    code,
                }),
            );
        }
        if abort {
            return self.abort_trans(cix, code, line!());
        }
        self.check_trans_state(cix);
    }

    // ---- phase two -------------------------------------------------------

    fn execute_index_op(&mut self, cix: Ix<ApiConnect>, iop: Ix<IndexOp>) {
        let (pk_attr_words, attr_words, req) = {
            let i = self.index_ops.get(iop).expect("index op");
            (
                self.bufs.to_vec(&i.transid_ai),
                self.bufs.to_vec(&i.attr),
                i.req.clone().expect("index req"),
            )
        };
        // The read returned the base primary key attr-encoded; the base
        // operation wants the raw key words.
        let pk: Vec<u32> = attr::iter(&pk_attr_words)
            .filter_map(|(_, v)| v)
            .flatten()
            .copied()
            .collect();
        if pk.is_empty() {
            warn!(target: "undertow", index = req.index.0, "index row carried no primary key");
            return self.abort_trans(cix, codes::NOT_FOUND, line!());
        }
        let Some(primary_table) = self.catalog.index(req.index).map(|i| i.primary_table) else {
            return self.abort_trans(cix, codes::DROP_TABLE_IN_PROGRESS, line!());
        };
        let savepoint = self.index_ops.get(iop).expect("index op").savepoint;
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.state = if req.flags.commit {
                ConnState::StartCommitting
            } else {
                ConnState::Started
            };
        }
        self.issue_internal_op(
            cix,
            primary_table,
            &pk,
            &attr_words,
            savepoint,
            InternalOp::IndexExec {
                iop,
                op: req.op,
                client_data: req.client_data,
                abort_on_error: req.flags.abort_on_error,
            },
        );
    }

    pub(crate) fn index_exec_conf(
        &mut self,
        cix: Ix<ApiConnect>,
        iop: Ix<IndexOp>,
        _oix: Ix<TcOp>,
        conf: LqhKeyConf,
    ) {
        let client_data = self
            .index_ops
            .get(iop)
            .and_then(|i| i.req.as_ref().map(|r| r.client_data))
            .unwrap_or(0);
        self.conns
            .get_mut(cix)
            .expect("conn")
            .indx_conf_ops
            .push(ConfOp {
                client_data,
                read_len: conf.read_len,
            });
        self.release_one_index_op(cix, iop);
        self.check_trans_state(cix);
    }

    pub(crate) fn index_exec_ref(
        &mut self,
        cix: Ix<ApiConnect>,
        iop: Ix<IndexOp>,
        oix: Ix<TcOp>,
        code: u32,
    ) {
        let abort = self
            .index_ops
            .get(iop)
            .and_then(|i| i.req.as_ref().map(|r| r.flags.abort_on_error))
            .unwrap_or(true);
        let (api_conn, api_ref, transid) = {
            let c = self.conns.get(cix).expect("conn");
            (c.api_conn, c.api_ref, c.transid)
        };
        self.conns.get_mut(cix).expect("conn").lqhkeyreq_count -= 1;
        self.release_op(cix, oix);
        self.release_one_index_op(cix, iop);
        if let Some(api) = api_ref {
            self.send(
                api,
                Signal::TcIndxRef(TcIndxRef {
                    api_conn,
                    transid,
                    code,
                }),
            );
        }
        if abort {
            return self.abort_trans(cix, code, line!());
        }
        self.check_trans_state(cix);
    }

    /// Send buffered index confirms to the client.
    pub(crate) fn flush_indx_conf(&mut self, cix: Ix<ApiConnect>, commit: bool) {
        let (api_ref, api_conn, transid, gci, items) = {
            let c = self.conns.get_mut(cix).expect("conn");
            (
                c.api_ref,
                c.api_conn,
                c.transid,
                c.gci,
                std::mem::take(&mut c.indx_conf_ops),
            )
        };
        let Some(api) = api_ref else { return };
        if items.is_empty() {
            return;
        }
        let nchunks = items.len().div_ceil(CONF_OPS_PER_SIGNAL);
        for (i, chunk) in items.chunks(CONF_OPS_PER_SIGNAL).enumerate() {
            let last = i + 1 == nchunks;
            self.send_packed(
                api.node,
                PackedClass::ApiIndxConf,
                PackedItem::TcIndxConf(TcIndxConf {
                    api_conn,
                    transid,
                    commit: commit && last,
                    gci: if commit && last { gci } else { None },
                    ops: chunk.to_vec(),
                }),
            );
        }
    }

    // ---- release ---------------------------------------------------------

    fn release_one_index_op(&mut self, cix: Ix<ApiConnect>, iop: Ix<IndexOp>) {
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.pending_index_ops = c.pending_index_ops.saturating_sub(1);
            c.index_ops.retain(|i| *i != iop);
            if c.accumulating_index_op == Some(iop) {
                c.accumulating_index_op = None;
            }
        }
        let (mut key, mut attr, mut ai) = {
            let i = self.index_ops.get_mut(iop).expect("index op");
            (
                std::mem::take(&mut i.key),
                std::mem::take(&mut i.attr),
                std::mem::take(&mut i.transid_ai),
            )
        };
        self.bufs.release(&mut key);
        self.bufs.release(&mut attr);
        self.bufs.release(&mut ai);
        self.index_ops.release(iop);
    }

    /// Free every index operation a transaction still holds.
    pub(crate) fn release_index_ops(&mut self, cix: Ix<ApiConnect>) {
        let list = std::mem::take(&mut self.conns.get_mut(cix).expect("conn").index_ops);
        for iop in list {
            let (mut key, mut attr, mut ai) = {
                let i = self.index_ops.get_mut(iop).expect("index op");
                (
                    std::mem::take(&mut i.key),
                    std::mem::take(&mut i.attr),
                    std::mem::take(&mut i.transid_ai),
                )
            };
            self.bufs.release(&mut key);
            self.bufs.release(&mut attr);
            self.bufs.release(&mut ai);
            self.index_ops.release(iop);
        }
        let c = self.conns.get_mut(cix).expect("conn");
        c.pending_index_ops = 0;
        c.accumulating_index_op = None;
        c.indx_conf_ops.clear();
    }
}
