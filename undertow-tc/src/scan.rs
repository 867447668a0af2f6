// The scan coordinator.
//
// A scan runs up to P fragment-scan processes in parallel, each walking one
// fragment at a time through its primary replica. Fragment records move
// between three queues: running (a request is at the handler), queued for
// delivery (a batch came back and waits for the client to drain), and
// delivered (the client holds the batch and owes a scan-next). Back-pressure
// is the queues themselves: a fragment sits still until the client drains
// it. Fragment liveness runs on the same coarse clock as transactions.

use crate::conn::{ApiConnect, ConnState};
use crate::{Job, Tc};
use tracing::{debug, warn};
use undertow_base::{Ix, SegList};
use undertow_wire::codes;
use undertow_wire::{
    AttrInfo, BlockRef, DiFcountConf, DiFcountRef, DiFcountReq, DiGetPrimConf, DiGetPrimRef,
    DiGetPrimReq, DiSeizeConf, DiSeizeReq, FragDelivery, NodeId, ScanFlags, ScanFragConf,
    ScanFragNextReq, ScanFragRef, ScanFragReq, ScanHbRep, ScanNextReq, ScanTabConf, ScanTabRef,
    ScanTabReq, Signal, TableId,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScanState {
    #[default]
    Idle,
    /// Waiting for the operand attrinfo stream.
    WaitAi,
    /// Waiting for a distribution cursor.
    WaitDiCursor,
    /// Waiting for the table's fragment count.
    WaitFragCount,
    Running,
    Closing,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FragState {
    #[default]
    Idle,
    /// Waiting for the fragment's primary replica.
    WaitPrim,
    /// A request is at the handler.
    LqhActive,
    /// A batch is here, undelivered.
    QueuedForDelivery,
    /// The client holds the batch.
    Delivered,
    Completed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FragQueue {
    Running,
    Queued,
    Delivered,
}

#[derive(Debug, Default)]
pub struct ScanRec {
    pub state: ScanState,
    pub conn: Option<Ix<ApiConnect>>,
    pub table: TableId,
    pub schema_version: u32,
    pub parallelism: u16,
    pub batch_rows: u16,
    pub batch_bytes: u32,
    pub flags: ScanFlags,
    pub savepoint: u32,
    /// Expected operand length in words; the operand itself.
    pub attr_len: u32,
    pub attr: SegList,
    pub running_first: Option<Ix<ScanFragRec>>,
    pub running_count: u32,
    pub queued_first: Option<Ix<ScanFragRec>>,
    pub queued_count: u32,
    pub delivered_first: Option<Ix<ScanFragRec>>,
    pub delivered_count: u32,
    /// Next fragment ordinal to hand to a free fragment process.
    pub next_frag_id: u32,
    pub frag_count: u32,
    /// Single-fragment scan selected by a distribution-key hint.
    pub single_fragment: Option<u32>,
    pub dih_conn: u32,
    pub close_requested: bool,
    pub error_code: Option<u32>,
    /// Fragment records seized for this scan, for release.
    pub frags: Vec<Ix<ScanFragRec>>,
}

#[derive(Debug, Default)]
pub struct ScanFragRec {
    pub state: FragState,
    pub scan: Option<Ix<ScanRec>>,
    pub fragment: u32,
    pub lqh_node: NodeId,
    pub lqh_conn: u32,
    /// Tick of the last handler contact; 0 means no timer running.
    pub timer: u32,
    pub rows: u32,
    pub bytes: u32,
    /// The handler said the fragment is exhausted.
    pub completed: bool,
    pub next: Option<Ix<ScanFragRec>>,
    pub prev: Option<Ix<ScanFragRec>>,
}

impl Tc {
    // ---- queue plumbing --------------------------------------------------

    fn queue_fields(
        scan: &mut ScanRec,
        which: FragQueue,
    ) -> (&mut Option<Ix<ScanFragRec>>, &mut u32) {
        match which {
            FragQueue::Running => (&mut scan.running_first, &mut scan.running_count),
            FragQueue::Queued => (&mut scan.queued_first, &mut scan.queued_count),
            FragQueue::Delivered => (&mut scan.delivered_first, &mut scan.delivered_count),
        }
    }

    fn frag_enqueue(&mut self, six: Ix<ScanRec>, which: FragQueue, fix: Ix<ScanFragRec>) {
        let old = {
            let scan = self.scans.get_mut(six).expect("scan");
            let (head, count) = Self::queue_fields(scan, which);
            let old = *head;
            *head = Some(fix);
            *count += 1;
            old
        };
        {
            let f = self.scan_frags.get_mut(fix).expect("scan frag");
            f.prev = None;
            f.next = old;
        }
        if let Some(o) = old {
            self.scan_frags.get_mut(o).expect("scan frag").prev = Some(fix);
        }
    }

    fn frag_dequeue(&mut self, six: Ix<ScanRec>, which: FragQueue, fix: Ix<ScanFragRec>) {
        let (prev, next) = {
            let f = self.scan_frags.get_mut(fix).expect("scan frag");
            (f.prev.take(), f.next.take())
        };
        match prev {
            Some(p) => self.scan_frags.get_mut(p).expect("scan frag").next = next,
            None => {
                let scan = self.scans.get_mut(six).expect("scan");
                let (head, _) = Self::queue_fields(scan, which);
                *head = next;
            }
        }
        if let Some(n) = next {
            self.scan_frags.get_mut(n).expect("scan frag").prev = prev;
        }
        let scan = self.scans.get_mut(six).expect("scan");
        let (_, count) = Self::queue_fields(scan, which);
        *count -= 1;
    }

    // ---- open ------------------------------------------------------------

    pub(crate) fn on_scan_tab_req(&mut self, src: BlockRef, req: ScanTabReq) {
        let Some(cix) = self.conn_ix(req.tc_conn) else {
            return;
        };
        let (state, owned, has_scan, api_conn) = {
            let c = self.conns.get(cix).expect("conn");
            (c.state, c.owned_by(src), c.scan.is_some(), c.api_conn)
        };
        if !owned {
            return;
        }
        let refuse = |tc: &mut Tc, code: u32| {
            tc.send(
                src,
                Signal::ScanTabRef(ScanTabRef {
                    api_conn,
                    transid: req.transid,
                    code,
                    closed: true,
                }),
            );
        };
        if has_scan {
            return refuse(self, codes::SCAN_IN_PROGRESS);
        }
        if state != ConnState::Connected {
            return refuse(self, codes::STATE_ERROR);
        }
        if let Err(code) = self.allow_start(src.node) {
            return refuse(self, code);
        }
        if req.parallelism == 0 {
            return refuse(self, codes::NO_CONCURRENCY);
        }
        if req.parallelism as u32 > self.cfg.scan_frag_records {
            return refuse(self, codes::TOO_HIGH_CONCURRENCY);
        }
        match self.catalog.table(req.table) {
            Some(t) if t.usable(req.schema_version) => {}
            Some(t) => {
                let code = t.reject_code(req.schema_version);
                return refuse(self, code);
            }
            None => return refuse(self, codes::NO_SUCH_TABLE),
        }
        let Some(six) = self.scans.seize() else {
            return refuse(self, codes::NO_SCAN_RECORD);
        };
        let mut frags = Vec::with_capacity(req.parallelism as usize);
        for _ in 0..req.parallelism {
            match self.scan_frags.seize() {
                Some(fix) => frags.push(fix),
                None => {
                    for fix in frags {
                        self.scan_frags.release(fix);
                    }
                    self.scans.release(six);
                    return refuse(self, codes::NO_FRAGMENT_RECORD);
                }
            }
        }
        self.counters.scan_count += 1;
        if req.flags.range {
            self.counters.range_scan_count += 1;
        }
        let savepoint = {
            let c = self.conns.get_mut(cix).expect("conn");
            c.transid = req.transid;
            c.scan = Some(six);
            c.savepoint
        };
        {
            let scan = self.scans.get_mut(six).expect("scan");
            scan.conn = Some(cix);
            scan.table = req.table;
            scan.schema_version = req.schema_version;
            scan.parallelism = req.parallelism;
            scan.batch_rows = req.batch_rows;
            scan.batch_bytes = req.batch_bytes;
            scan.flags = req.flags;
            scan.savepoint = savepoint;
            scan.attr_len = req.attr_len;
            scan.single_fragment = req.distribution_key;
            scan.frags = frags.clone();
        }
        for fix in &frags {
            let f = self.scan_frags.get_mut(*fix).expect("scan frag");
            f.scan = Some(six);
            f.state = FragState::Idle;
        }
        self.touch_conn(cix);
        if req.attr_len > 0 {
            self.scans.get_mut(six).expect("scan").state = ScanState::WaitAi;
        } else {
            self.scan_ask_cursor(six);
        }
    }

    pub(crate) fn scan_wants_attr(&self, six: Ix<ScanRec>) -> bool {
        self.scans.get(six).map(|s| s.state) == Some(ScanState::WaitAi)
    }

    pub(crate) fn scan_attr_info(&mut self, cix: Ix<ApiConnect>, six: Ix<ScanRec>, s: AttrInfo) {
        let over = {
            let scan = self.scans.get(six).expect("scan");
            scan.attr.len() + s.words.len() as u32 > scan.attr_len
        };
        if over {
            return self.scan_error(six, codes::SCAN_AI_LEN_ERROR);
        }
        {
            let mut list = std::mem::take(&mut self.scans.get_mut(six).expect("scan").attr);
            let failed = self.bufs.append(&mut list, &s.words).is_err();
            self.scans.get_mut(six).expect("scan").attr = list;
            if failed {
                return self.scan_error(six, codes::NO_ATTR_BUFFER);
            }
        }
        self.touch_conn(cix);
        let done = {
            let scan = self.scans.get(six).expect("scan");
            scan.attr.len() >= scan.attr_len
        };
        if done {
            self.scan_ask_cursor(six);
        }
    }

    fn scan_ask_cursor(&mut self, six: Ix<ScanRec>) {
        self.scans.get_mut(six).expect("scan").state = ScanState::WaitDiCursor;
        let dih = BlockRef::dih(self.own);
        self.send(dih, Signal::DiSeizeReq(DiSeizeReq { scan: six.raw() }));
    }

    pub(crate) fn on_di_seize_conf(&mut self, s: DiSeizeConf) {
        let six: Ix<ScanRec> = Ix::new(s.scan);
        let Some(scan) = self.scans.get_mut(six) else {
            return;
        };
        if scan.state != ScanState::WaitDiCursor {
            return;
        }
        scan.dih_conn = s.dih_conn;
        scan.state = ScanState::WaitFragCount;
        let table = scan.table;
        let dih = BlockRef::dih(self.own);
        self.send(
            dih,
            Signal::DiFcountReq(DiFcountReq {
                dih_conn: s.dih_conn,
                scan: s.scan,
                table,
            }),
        );
    }

    pub(crate) fn on_di_fcount_conf(&mut self, s: DiFcountConf) {
        let six: Ix<ScanRec> = Ix::new(s.scan);
        let state = self.scans.get(six).map(|x| x.state);
        if state != Some(ScanState::WaitFragCount) {
            return;
        }
        if s.fragments == 0 {
            return self.scan_error(six, codes::NO_FRAGMENT_RECORD);
        }
        let to_start: Vec<(Ix<ScanFragRec>, u32)> = {
            let scan = self.scans.get_mut(six).expect("scan");
            scan.state = ScanState::Running;
            // A distribution-key hint narrows the scan to one fragment.
            scan.frag_count = match scan.single_fragment {
                Some(_) => 1,
                None => s.fragments,
            };
            if let Some(dk) = scan.single_fragment {
                scan.single_fragment = Some(dk % s.fragments);
            }
            let n = (scan.frag_count as usize).min(scan.frags.len());
            scan.next_frag_id = n as u32;
            let single = scan.single_fragment;
            scan.frags
                .iter()
                .take(n)
                .enumerate()
                .map(|(i, fix)| (*fix, single.unwrap_or(i as u32)))
                .collect()
        };
        // Spare fragment processes beyond the fragment count go back.
        let spare: Vec<Ix<ScanFragRec>> = {
            let scan = self.scans.get_mut(six).expect("scan");
            let keep = to_start.len();
            scan.frags.split_off(keep)
        };
        for fix in spare {
            self.scan_frags.release(fix);
        }
        for (fix, frag_id) in to_start {
            self.frag_start(six, fix, frag_id);
        }
    }

    pub(crate) fn on_di_fcount_ref(&mut self, s: DiFcountRef) {
        let six: Ix<ScanRec> = Ix::new(s.scan);
        if self.scans.get(six).is_some() {
            self.scan_error(six, s.code);
        }
    }

    /// Point a fragment process at `frag_id` and ask for its primary.
    fn frag_start(&mut self, six: Ix<ScanRec>, fix: Ix<ScanFragRec>, frag_id: u32) {
        let table = self.scans.get(six).expect("scan").table;
        {
            let f = self.scan_frags.get_mut(fix).expect("scan frag");
            f.state = FragState::WaitPrim;
            f.fragment = frag_id;
            f.rows = 0;
            f.bytes = 0;
            f.completed = false;
            f.timer = self.clock.max(1);
        }
        self.frag_enqueue(six, FragQueue::Running, fix);
        let dih = BlockRef::dih(self.own);
        self.send(
            dih,
            Signal::DiGetPrimReq(DiGetPrimReq {
                scan_frag: fix.raw(),
                table,
                fragment: frag_id,
            }),
        );
    }

    pub(crate) fn on_di_get_prim_conf(&mut self, s: DiGetPrimConf) {
        let fix: Ix<ScanFragRec> = Ix::new(s.scan_frag);
        let Some(six) = self.scan_frags.get(fix).and_then(|f| f.scan) else {
            return;
        };
        if self.scan_frags.get(fix).expect("scan frag").state != FragState::WaitPrim {
            return;
        }
        let closing = self.scans.get(six).expect("scan").state == ScanState::Closing;
        if closing {
            self.frag_dequeue(six, FragQueue::Running, fix);
            self.scan_frags.get_mut(fix).expect("scan frag").state = FragState::Completed;
            return self.scan_maybe_closed(six);
        }
        let (transid, api_ref) = {
            let cix = self.scans.get(six).expect("scan").conn.expect("scan conn");
            let c = self.conns.get(cix).expect("conn");
            (c.transid, c.api_ref)
        };
        let (table, schema_version, batch_rows, batch_bytes, flags, savepoint, attr) = {
            let scan = self.scans.get(six).expect("scan");
            (
                scan.table,
                scan.schema_version,
                scan.batch_rows,
                scan.batch_bytes,
                scan.flags,
                scan.savepoint,
                self.bufs.to_vec(&scan.attr),
            )
        };
        {
            let f = self.scan_frags.get_mut(fix).expect("scan frag");
            f.lqh_node = s.primary;
            f.state = FragState::LqhActive;
            f.timer = self.clock.max(1);
        }
        self.send(
            BlockRef::lqh(s.primary),
            Signal::ScanFragReq(ScanFragReq {
                scan_frag: fix.raw(),
                transid,
                table,
                schema_version,
                fragment: s.fragment,
                batch_rows,
                batch_bytes,
                flags,
                savepoint,
                attr,
                reply_ref: api_ref.unwrap_or_else(|| self.own_ref()),
            }),
        );
    }

    pub(crate) fn on_di_get_prim_ref(&mut self, s: DiGetPrimRef) {
        let fix: Ix<ScanFragRec> = Ix::new(s.scan_frag);
        if let Some(six) = self.scan_frags.get(fix).and_then(|f| f.scan) {
            self.scan_error(six, s.code);
        }
    }

    // ---- batches ---------------------------------------------------------

    pub(crate) fn on_scan_frag_conf(&mut self, _src: BlockRef, s: ScanFragConf) {
        let fix: Ix<ScanFragRec> = Ix::new(s.scan_frag);
        let Some(six) = self.scan_frags.get(fix).and_then(|f| f.scan) else {
            debug!(target: "undertow", scan_frag = s.scan_frag, "late scan batch dropped");
            return;
        };
        let Some(cix) = self.scans.get(six).and_then(|x| x.conn) else {
            return;
        };
        if !self.conns.get(cix).expect("conn").same_trans(s.transid) {
            return;
        }
        if self.scan_frags.get(fix).expect("scan frag").state != FragState::LqhActive {
            warn!(target: "undertow", scan_frag = s.scan_frag, "scan batch in unexpected state");
            return;
        }
        self.touch_conn(cix);
        {
            let f = self.scan_frags.get_mut(fix).expect("scan frag");
            f.timer = 0;
            f.lqh_conn = s.lqh_conn;
            f.rows = s.rows;
            f.bytes = s.bytes;
            f.completed = s.completed;
        }
        let closing = self.scans.get(six).expect("scan").state == ScanState::Closing;
        if closing {
            self.frag_dequeue(six, FragQueue::Running, fix);
            self.scan_frags.get_mut(fix).expect("scan frag").state = FragState::Completed;
            return self.scan_maybe_closed(six);
        }
        if s.completed && s.rows == 0 {
            // Nothing to deliver; this process can take the next fragment.
            self.frag_dequeue(six, FragQueue::Running, fix);
            let next = {
                let scan = self.scans.get_mut(six).expect("scan");
                if scan.next_frag_id < scan.frag_count {
                    let id = scan.next_frag_id;
                    scan.next_frag_id += 1;
                    Some(id)
                } else {
                    None
                }
            };
            match next {
                Some(id) => self.frag_start(six, fix, id),
                None => {
                    self.scan_frags.get_mut(fix).expect("scan frag").state = FragState::Completed;
                    self.scan_maybe_done(six);
                }
            }
            return;
        }
        self.frag_dequeue(six, FragQueue::Running, fix);
        self.scan_frags.get_mut(fix).expect("scan frag").state = FragState::QueuedForDelivery;
        self.frag_enqueue(six, FragQueue::Queued, fix);
        self.scan_deliver(six);
    }

    /// Hand every queued batch to the client in one conf.
    fn scan_deliver(&mut self, six: Ix<ScanRec>) {
        let cix = self.scans.get(six).expect("scan").conn.expect("scan conn");
        let (api_ref, api_conn, transid) = {
            let c = self.conns.get(cix).expect("conn");
            (c.api_ref, c.api_conn, c.transid)
        };
        let Some(api) = api_ref else { return };
        let mut frags = Vec::new();
        while let Some(fix) = self.scans.get(six).expect("scan").queued_first {
            self.frag_dequeue(six, FragQueue::Queued, fix);
            let f = self.scan_frags.get_mut(fix).expect("scan frag");
            f.state = FragState::Delivered;
            frags.push(FragDelivery {
                frag_handle: fix.raw(),
                rows: f.rows,
                bytes: f.bytes,
                completed: f.completed,
            });
            self.frag_enqueue(six, FragQueue::Delivered, fix);
        }
        if frags.is_empty() {
            return;
        }
        self.send(
            api,
            Signal::ScanTabConf(ScanTabConf {
                api_conn,
                transid,
                end_of_data: false,
                frags,
            }),
        );
    }

    pub(crate) fn on_scan_frag_ref(&mut self, _src: BlockRef, s: ScanFragRef) {
        let fix: Ix<ScanFragRec> = Ix::new(s.scan_frag);
        if let Some(six) = self.scan_frags.get(fix).and_then(|f| f.scan) {
            self.scan_error(six, s.code);
        }
    }

    pub(crate) fn on_scan_hb_rep(&mut self, s: ScanHbRep) {
        let fix: Ix<ScanFragRec> = Ix::new(s.scan_frag);
        let Some(six) = self.scan_frags.get(fix).and_then(|f| f.scan) else {
            return;
        };
        let f = self.scan_frags.get_mut(fix).expect("scan frag");
        if f.timer != 0 {
            f.timer = self.clock.max(1);
        }
        if let Some(cix) = self.scans.get(six).expect("scan").conn {
            self.touch_conn(cix);
        }
    }

    // ---- continuation ----------------------------------------------------

    pub(crate) fn on_scan_next_req(&mut self, src: BlockRef, s: ScanNextReq) {
        let Some(cix) = self.conn_ix(s.tc_conn) else {
            return;
        };
        let (owned, same, six) = {
            let c = self.conns.get(cix).expect("conn");
            (c.owned_by(src), c.same_trans(s.transid), c.scan)
        };
        let Some(six) = six.filter(|_| owned && same) else {
            debug!(target: "undertow", tc_conn = s.tc_conn, "scan-next without a scan");
            return;
        };
        self.touch_conn(cix);
        if s.close {
            return self.close_scan(six);
        }
        for handle in s.frag_handles {
            let fix: Ix<ScanFragRec> = Ix::new(handle);
            let ok = self.scan_frags.get(fix).map(|f| {
                f.scan == Some(six) && f.state == FragState::Delivered
            }) == Some(true);
            if !ok {
                continue;
            }
            self.frag_dequeue(six, FragQueue::Delivered, fix);
            let completed = self.scan_frags.get(fix).expect("scan frag").completed;
            if completed {
                // This fragment finished with its last delivered batch.
                let next = {
                    let scan = self.scans.get_mut(six).expect("scan");
                    if scan.next_frag_id < scan.frag_count {
                        let id = scan.next_frag_id;
                        scan.next_frag_id += 1;
                        Some(id)
                    } else {
                        None
                    }
                };
                match next {
                    Some(id) => self.frag_start(six, fix, id),
                    None => {
                        self.scan_frags.get_mut(fix).expect("scan frag").state =
                            FragState::Completed;
                    }
                }
                continue;
            }
            let (node, lqh_conn, transid, batch_rows, batch_bytes) = {
                let scan = self.scans.get(six).expect("scan");
                let f = self.scan_frags.get(fix).expect("scan frag");
                (
                    f.lqh_node,
                    f.lqh_conn,
                    s.transid,
                    scan.batch_rows,
                    scan.batch_bytes,
                )
            };
            {
                let f = self.scan_frags.get_mut(fix).expect("scan frag");
                f.state = FragState::LqhActive;
                f.timer = self.clock.max(1);
            }
            self.frag_enqueue(six, FragQueue::Running, fix);
            self.send(
                BlockRef::lqh(node),
                Signal::ScanFragNextReq(ScanFragNextReq {
                    lqh_conn,
                    transid,
                    close: false,
                    batch_rows,
                    batch_bytes,
                }),
            );
        }
        self.scan_maybe_done(six);
    }

    /// End-of-data check: every fragment walked, nothing queued, nothing
    /// out with the client or the handlers.
    fn scan_maybe_done(&mut self, six: Ix<ScanRec>) {
        let done = {
            let scan = self.scans.get(six).expect("scan");
            scan.state == ScanState::Running
                && scan.next_frag_id >= scan.frag_count
                && scan.running_count == 0
                && scan.queued_count == 0
                && scan.delivered_count == 0
                && scan
                    .frags
                    .iter()
                    .all(|f| self.scan_frags.get(*f).map(|r| r.state) == Some(FragState::Completed))
        };
        if done {
            self.scan_finish(six);
        }
    }

    // ---- close -----------------------------------------------------------

    /// Close a scan: explicit request, error, or transaction teardown.
    pub(crate) fn close_scan(&mut self, six: Ix<ScanRec>) {
        let prior = self.scans.get(six).expect("scan").state;
        if prior == ScanState::Closing {
            return;
        }
        if !matches!(prior, ScanState::Running) {
            // Not yet running: nothing is at the handlers.
            return self.scan_finish(six);
        }
        self.scans.get_mut(six).expect("scan").state = ScanState::Closing;
        let transid = {
            let cix = self.scans.get(six).expect("scan").conn.expect("scan conn");
            self.conns.get(cix).expect("conn").transid
        };
        let frags: Vec<Ix<ScanFragRec>> = self.scans.get(six).expect("scan").frags.clone();
        for fix in frags {
            let (state, node, lqh_conn) = {
                let f = self.scan_frags.get(fix).expect("scan frag");
                (f.state, f.lqh_node, f.lqh_conn)
            };
            match state {
                FragState::Delivered
                    if self.scan_frags.get(fix).expect("scan frag").completed =>
                {
                    // Last batch already delivered; nothing is open at the
                    // handler.
                    self.frag_dequeue(six, FragQueue::Delivered, fix);
                    self.scan_frags.get_mut(fix).expect("scan frag").state = FragState::Completed;
                }
                FragState::LqhActive | FragState::Delivered => {
                    if state == FragState::Delivered {
                        self.frag_dequeue(six, FragQueue::Delivered, fix);
                        self.frag_enqueue(six, FragQueue::Running, fix);
                        self.scan_frags.get_mut(fix).expect("scan frag").state =
                            FragState::LqhActive;
                    }
                    if self.hosts.alive(node) {
                        self.scan_frags.get_mut(fix).expect("scan frag").timer =
                            self.clock.max(1);
                        self.send(
                            BlockRef::lqh(node),
                            Signal::ScanFragNextReq(ScanFragNextReq {
                                lqh_conn,
                                transid,
                                close: true,
                                batch_rows: 0,
                                batch_bytes: 0,
                            }),
                        );
                    } else {
                        // No one to close against.
                        self.frag_dequeue(six, FragQueue::Running, fix);
                        self.scan_frags.get_mut(fix).expect("scan frag").state =
                            FragState::Completed;
                    }
                }
                FragState::QueuedForDelivery => {
                    self.frag_dequeue(six, FragQueue::Queued, fix);
                    self.scan_frags.get_mut(fix).expect("scan frag").state = FragState::Completed;
                }
                FragState::Idle | FragState::WaitPrim | FragState::Completed => {
                    // WaitPrim completes when the primary answer finds the
                    // scan closing.
                    if state == FragState::Idle {
                        self.scan_frags.get_mut(fix).expect("scan frag").state =
                            FragState::Completed;
                    }
                }
            }
        }
        self.scan_maybe_closed(six);
    }

    pub(crate) fn scan_maybe_closed(&mut self, six: Ix<ScanRec>) {
        let done = {
            let scan = self.scans.get(six).expect("scan");
            scan.frags
                .iter()
                .all(|f| self.scan_frags.get(*f).map(|r| r.state) == Some(FragState::Completed))
        };
        if done {
            self.scan_finish(six);
        }
    }

    /// Report the end of the scan (end-of-data, or the stored error) and
    /// release everything.
    fn scan_finish(&mut self, six: Ix<ScanRec>) {
        let cix = self.scans.get(six).expect("scan").conn.expect("scan conn");
        let (api_ref, api_conn, transid) = {
            let c = self.conns.get(cix).expect("conn");
            (c.api_ref, c.api_conn, c.transid)
        };
        let error = self.scans.get(six).expect("scan").error_code;
        if let Some(api) = api_ref {
            match error {
                Some(code) => self.send(
                    api,
                    Signal::ScanTabRef(ScanTabRef {
                        api_conn,
                        transid,
                        code,
                        closed: true,
                    }),
                ),
                None => self.send(
                    api,
                    Signal::ScanTabConf(ScanTabConf {
                        api_conn,
                        transid,
                        end_of_data: true,
                        frags: Vec::new(),
                    }),
                ),
            }
        }
        let frags = {
            let scan = self.scans.get_mut(six).expect("scan");
            let mut attr = std::mem::take(&mut scan.attr);
            let frags = std::mem::take(&mut scan.frags);
            self.bufs.release(&mut attr);
            frags
        };
        for fix in frags {
            self.scan_frags.release(fix);
        }
        self.scans.release(six);
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.scan = None;
        }
        self.stop_conn_timer(cix);
        self.handle_api_fail_release(cix);
    }

    /// Error out a scan: pre-running scans answer immediately, running
    /// scans close first.
    pub(crate) fn scan_error(&mut self, six: Ix<ScanRec>, code: u32) {
        let state = match self.scans.get(six) {
            Some(s) => s.state,
            None => return,
        };
        match state {
            ScanState::Idle => {}
            ScanState::Closing => {
                // Second failure while closing: give up waiting.
                let frags = self.scans.get(six).expect("scan").frags.clone();
                for fix in frags {
                    let f = self.scan_frags.get_mut(fix).expect("scan frag");
                    if f.state != FragState::Completed {
                        f.state = FragState::Completed;
                    }
                }
                let scan = self.scans.get_mut(six).expect("scan");
                scan.running_first = None;
                scan.running_count = 0;
                scan.queued_first = None;
                scan.queued_count = 0;
                scan.delivered_first = None;
                scan.delivered_count = 0;
                if scan.error_code.is_none() {
                    scan.error_code = Some(codes::SCAN_TIME_OUT_CLOSING);
                }
                self.scan_finish(six);
            }
            ScanState::WaitAi | ScanState::WaitDiCursor | ScanState::WaitFragCount => {
                self.scans.get_mut(six).expect("scan").error_code = Some(code);
                self.scan_finish(six);
            }
            ScanState::Running => {
                self.scans.get_mut(six).expect("scan").error_code = Some(code);
                self.close_scan(six);
            }
        }
    }

    // ---- fragment liveness -----------------------------------------------

    pub(crate) fn frag_timeout_scan_run(&mut self, pos: u32) {
        let cap = self.scan_frags.capacity() as u32;
        let end = (pos + crate::TIMEOUT_BATCH).min(cap);
        let limit = self.cfg.deadlock_ticks();
        for raw in pos..end {
            let fix: Ix<ScanFragRec> = Ix::new(raw);
            let (timer, six) = match self.scan_frags.get(fix) {
                Some(f) => (f.timer, f.scan),
                None => continue,
            };
            if timer == 0 {
                continue;
            }
            if self.clock.wrapping_sub(timer) > limit {
                if let Some(six) = six {
                    warn!(target: "undertow", scan_frag = raw, "fragment scan timed out");
                    self.scan_error(six, codes::SCAN_TIME_OUT);
                }
            }
        }
        if end < cap {
            self.continue_later(Job::FragTimeoutScan { pos: end });
        } else {
            self.frag_scan_active = false;
        }
    }

    /// A data node died: scans with a fragment at that node cannot finish
    /// their batches; error them out.
    pub(crate) fn scan_node_failed(&mut self, node: NodeId) {
        let affected: Vec<Ix<ScanRec>> = self
            .scans
            .iter_live()
            .filter(|(_, scan)| {
                scan.frags.iter().any(|fix| {
                    self.scan_frags
                        .get(*fix)
                        .map(|f| {
                            f.lqh_node == node
                                && matches!(
                                    f.state,
                                    FragState::LqhActive | FragState::Delivered
                                )
                        })
                        .unwrap_or(false)
                })
            })
            .map(|(six, _)| six)
            .collect();
        for six in affected {
            // Batches at the dead node will never arrive or close; complete
            // those processes by hand, then error the scan out.
            let frags = self.scans.get(six).expect("scan").frags.clone();
            for fix in frags {
                let (state, at_node) = {
                    let f = self.scan_frags.get(fix).expect("scan frag");
                    (f.state, f.lqh_node == node)
                };
                if !at_node {
                    continue;
                }
                match state {
                    FragState::LqhActive => {
                        self.frag_dequeue(six, FragQueue::Running, fix);
                        self.scan_frags.get_mut(fix).expect("scan frag").state =
                            FragState::Completed;
                    }
                    FragState::Delivered => {
                        self.frag_dequeue(six, FragQueue::Delivered, fix);
                        self.scan_frags.get_mut(fix).expect("scan frag").state =
                            FragState::Completed;
                    }
                    _ => {}
                }
            }
            self.scan_error(six, codes::SCAN_NODE_ERROR);
        }
    }
}
