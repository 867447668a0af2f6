// The transaction coordinator block.
//
// A single-threaded, event-driven state machine: signals go in, state
// advances, signals come out. No handler blocks; every wait is a state plus
// a timer, and long walks over record arrays yield by re-queueing a
// continuation job behind whatever else has arrived. The block talks to its
// collaborators (query handlers, distribution info, dictionary, cluster
// controller, clients) purely through the wire signal set, with one
// exception: fragment lookup on the local distribution service is an inline,
// non-suspending call behind the [`Distribution`] trait.

use std::collections::VecDeque;

use tracing::{debug, warn};
use undertow_base::{Ix, NodeBitmap, Pool, SegPool};
use undertow_wire::{BlockRef, Msg, NodeId, PackedClass, PackedItem, Signal};

pub mod config;
pub mod sim;

mod abort;
mod commit;
mod conn;
mod counters;
mod dict;
mod host;
mod index;
mod keyreq;
mod op;
mod scan;
mod start;
mod table;
mod takeover;
mod trigger;

#[cfg(test)]
mod test;

pub use config::TcConfig;
pub use conn::{AbortState, ApiConnect, ConnKind, ConnState, ReturnSignal};
pub use counters::TransCounters;
pub use op::{CacheRec, OpState, TcOp};
pub use start::ClusterState;

use commit::{CommitAckMarker, GcpRec, MarkerHash};
use host::Hosts;
use index::IndexOp;
use scan::{ScanFragRec, ScanRec};
use table::Catalog;
use takeover::TcFailRec;
use trigger::{FiredHash, FiredTrigger};

/// An invariant violation terminates the node. Never used for conditions a
/// client or a peer failure can legitimately produce.
#[macro_export]
macro_rules! system_error {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!("node failure: {}", format_args!($($arg)*));
    }};
}

/// Fragment lookup and master query on the local distribution service.
///
/// Implementations must answer inline on the calling thread: no suspension,
/// no re-entry into the coordinator.
pub trait Distribution {
    /// Replica nodes of the fragment owning `distr_hash`, primary first.
    fn get_nodes(&self, table: undertow_wire::TableId, distr_hash: u32) -> Option<FragmentNodes>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FragmentNodes {
    pub fragment: u32,
    pub nodes: Vec<NodeId>,
}

/// Deferred work, interleaved with inbound signals on the one job queue so a
/// long walk cannot starve the rest of the block.
#[derive(Debug)]
enum Job {
    Msg(Box<Msg>),
    /// Continue the commit fan-out of one transaction at `op`.
    CommitFanout {
        conn: Ix<ApiConnect>,
        op: Option<Ix<TcOp>>,
    },
    /// Continue the complete fan-out (runs on the copy record).
    CompleteFanout {
        conn: Ix<ApiConnect>,
        op: Option<Ix<TcOp>>,
    },
    /// Continue aborting one transaction at `op`.
    AbortContinue {
        conn: Ix<ApiConnect>,
        op: Option<Ix<TcOp>>,
    },
    /// Continue the watchdog walk over connection slots.
    TimeoutScan { pos: u32 },
    /// Continue the watchdog walk over fragment-scan slots.
    FragTimeoutScan { pos: u32 },
    /// Run fired triggers queued on a transaction.
    ExecuteTriggers { conn: Ix<ApiConnect> },
    /// Pick further rebuilt transactions of `node` to drive to completion.
    TakeoverDrive { node: NodeId },
    /// Continue releasing records owned by a failed api node.
    ApiFailContinue { node: NodeId, pos: u32 },
    /// Continue the abort-everything walk.
    AbortAllContinue { pos: u32 },
    /// Continue sweeping live transactions after a data node died.
    NodeFailContinue { node: NodeId, pos: u32 },
}

/// Items a long walk processes before yielding.
const WALK_BATCH: u32 = 256;
/// Connection slots per watchdog batch.
const TIMEOUT_BATCH: u32 = 1024;
/// Operations per commit/complete fan-out run.
const FANOUT_BATCH: u32 = 16;
/// Operations per abort run.
const ABORT_BATCH: u32 = 1024;

pub struct Tc {
    pub(crate) cfg: TcConfig,
    pub(crate) own: NodeId,
    pub(crate) cluster: ClusterState,
    pub(crate) single_user_node: Option<NodeId>,
    pub(crate) master: NodeId,
    pub(crate) start_phase: u32,
    /// Logical clock in 10 ms ticks.
    pub(crate) clock: u32,

    pub(crate) conns: Pool<ApiConnect>,
    /// Last-activity tick per connection slot; 0 means no timer running.
    pub(crate) conn_timers: Vec<u32>,
    pub(crate) free_conns: Vec<Ix<ApiConnect>>,
    pub(crate) free_copies: Vec<Ix<ApiConnect>>,
    pub(crate) free_fails: Vec<Ix<ApiConnect>>,

    pub(crate) ops: Pool<TcOp>,
    pub(crate) caches: Pool<CacheRec>,
    pub(crate) bufs: SegPool,

    pub(crate) gcps: Pool<GcpRec>,
    pub(crate) gcp_first: Option<Ix<GcpRec>>,
    pub(crate) gcp_last: Option<Ix<GcpRec>>,

    pub(crate) markers: Pool<CommitAckMarker>,
    pub(crate) marker_hash: MarkerHash,
    pub(crate) fired: Pool<FiredTrigger>,
    pub(crate) fired_hash: FiredHash,
    pub(crate) index_ops: Pool<IndexOp>,

    pub(crate) scans: Pool<ScanRec>,
    pub(crate) scan_frags: Pool<ScanFragRec>,

    pub(crate) catalog: Catalog,
    pub(crate) hosts: Hosts,
    pub(crate) alive: NodeBitmap,
    pub(crate) fail: TcFailRec,
    pub(crate) counters: TransCounters,

    pub(crate) dih: Box<dyn Distribution>,

    jobs: VecDeque<Job>,
    outbox: VecDeque<Msg>,
    pub(crate) timeout_scan_active: bool,
    pub(crate) last_timeout_check: u32,
    pub(crate) frag_scan_active: bool,
    pub(crate) last_frag_check: u32,
    pub(crate) last_counter_report: u32,
    /// Pending abort-all client, with the count of live transactions found.
    pub(crate) abort_all: Option<(BlockRef, u32)>,
    /// Failed api nodes being cleaned up, with who to confirm to.
    pub(crate) api_fail_pending: Vec<(NodeId, Option<BlockRef>)>,
    /// Start phase whose conf waits on a collaborator reply.
    pub(crate) pending_sttor: Option<(BlockRef, u32)>,
}

impl Tc {
    pub fn new(cfg: TcConfig, own: NodeId, dih: Box<dyn Distribution>) -> Tc {
        let mut cfg = cfg;
        cfg.normalize();
        let nconn = cfg.api_connections as usize;
        // One array, three partitions: user records, commit copies,
        // take-over records.
        let conns: Pool<ApiConnect> = Pool::new_all_live(3 * nconn);
        let mut free_conns = Vec::with_capacity(nconn);
        let mut free_copies = Vec::with_capacity(nconn);
        let mut free_fails = Vec::with_capacity(nconn);
        for raw in (0..3 * nconn as u32).rev() {
            let ix = Ix::new(raw);
            match raw as usize / nconn {
                0 => free_conns.push(ix),
                1 => free_copies.push(ix),
                _ => free_fails.push(ix),
            }
        }
        let seg_words = cfg.transaction_buffer_bytes as usize / 4;
        Tc {
            own,
            cluster: ClusterState::NotStarted,
            single_user_node: None,
            master: own,
            start_phase: 0,
            clock: 0,
            conns,
            conn_timers: vec![0; 3 * nconn],
            free_conns,
            free_copies,
            free_fails,
            ops: Pool::new(cfg.tc_ops as usize),
            caches: Pool::new(cfg.api_connections as usize),
            bufs: SegPool::new(seg_words),
            gcps: Pool::new(cfg.gcp_records as usize),
            gcp_first: None,
            gcp_last: None,
            markers: Pool::new(3 * nconn),
            marker_hash: MarkerHash::new(),
            fired: Pool::new(cfg.max_fired_triggers as usize),
            fired_hash: FiredHash::new(cfg.max_fired_triggers as usize),
            index_ops: Pool::new(cfg.max_index_operations as usize),
            scans: Pool::new(cfg.scan_records as usize),
            scan_frags: Pool::new(cfg.scan_frag_records as usize),
            catalog: Catalog::new(
                cfg.tables as usize,
                cfg.max_indexes as usize,
                cfg.max_triggers as usize,
            ),
            hosts: Hosts::new(),
            alive: NodeBitmap::new(),
            fail: TcFailRec::default(),
            counters: TransCounters::default(),
            dih,
            jobs: VecDeque::new(),
            outbox: VecDeque::new(),
            timeout_scan_active: false,
            last_timeout_check: 0,
            frag_scan_active: false,
            last_frag_check: 0,
            last_counter_report: 0,
            abort_all: None,
            api_fail_pending: Vec::new(),
            pending_sttor: None,
            cfg,
        }
    }

    pub fn own_node(&self) -> NodeId {
        self.own
    }

    pub fn own_ref(&self) -> BlockRef {
        BlockRef::tc(self.own)
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    pub fn config(&self) -> &TcConfig {
        &self.cfg
    }

    /// Enqueue an inbound signal.
    pub fn deliver(&mut self, msg: Msg) {
        self.jobs.push_back(Job::Msg(Box::new(msg)));
    }

    /// Run jobs until the queue drains, then flush the packed buffers (the
    /// end of a dispatch batch is a send-packed point).
    pub fn run(&mut self) {
        while let Some(job) = self.jobs.pop_front() {
            self.run_job(job);
        }
        self.flush_packed();
    }

    /// Drain everything the block wants to send.
    pub fn take_outbox(&mut self) -> Vec<Msg> {
        self.outbox.drain(..).collect()
    }

    pub(crate) fn continue_later(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub(crate) fn send(&mut self, dst: BlockRef, signal: Signal) {
        self.outbox.push_back(Msg {
            src: self.own_ref(),
            dst,
            signal,
        });
    }

    /// Queue a packed item; overflow batches go out immediately.
    pub(crate) fn send_packed(&mut self, node: NodeId, class: PackedClass, item: PackedItem) {
        if let Some(batch) = self.hosts.pack(node, class, item) {
            let dst = host::packed_dst(node, class);
            self.send(dst, Signal::Packed(batch));
        }
    }

    pub(crate) fn flush_packed(&mut self) {
        let mut out = Vec::new();
        self.hosts.flush(|node, class, batch| {
            out.push((host::packed_dst(node, class), batch));
        });
        for (dst, batch) in out {
            self.send(dst, Signal::Packed(batch));
        }
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::Msg(msg) => self.dispatch(*msg),
            Job::CommitFanout { conn, op } => self.commit_fanout_run(conn, op),
            Job::CompleteFanout { conn, op } => self.complete_fanout_run(conn, op),
            Job::AbortContinue { conn, op } => self.abort_run(conn, op),
            Job::TimeoutScan { pos } => self.timeout_scan_run(pos),
            Job::FragTimeoutScan { pos } => self.frag_timeout_scan_run(pos),
            Job::ExecuteTriggers { conn } => self.execute_triggers_run(conn),
            Job::TakeoverDrive { node } => self.takeover_drive_run(node),
            Job::ApiFailContinue { node, pos } => self.api_fail_run(node, pos),
            Job::AbortAllContinue { pos } => self.abort_all_run(pos),
            Job::NodeFailContinue { node, pos } => self.node_fail_run(node, pos),
        }
    }

    fn dispatch(&mut self, msg: Msg) {
        let src = msg.src;
        match msg.signal {
            // Client requests.
            Signal::TcSeizeReq(s) => self.on_seize_req(src, s),
            Signal::TcReleaseReq(s) => self.on_release_req(src, s),
            Signal::TcKeyReq(s) => self.on_key_req(src, *s),
            Signal::KeyInfo(s) => self.on_key_info(src, s),
            Signal::AttrInfo(s) => self.on_attr_info(src, s),
            Signal::TcCommitReq(s) => self.on_commit_req(src, s),
            Signal::TcRollbackReq(s) => self.on_rollback_req(src, s),
            Signal::TcHbRep(s) => self.on_hb_rep(src, s),
            Signal::TcCommitAck(s) => self.on_commit_ack(s),
            Signal::ScanTabReq(s) => self.on_scan_tab_req(src, s),
            Signal::ScanNextReq(s) => self.on_scan_next_req(src, s),
            Signal::TcIndxReq(s) => self.on_indx_req(src, *s),
            Signal::IndxKeyInfo(s) => self.on_indx_key_info(src, s),
            Signal::IndxAttrInfo(s) => self.on_indx_attr_info(src, s),
            Signal::ApiFailReq(s) => self.on_api_fail_req(src, s),
            // Query-handler replies.
            Signal::LqhKeyConf(s) => self.on_lqh_key_conf(src, s),
            Signal::LqhKeyRef(s) => self.on_lqh_key_ref(src, s),
            Signal::Committed(s) => self.on_committed(s),
            Signal::Completed(s) => self.on_completed(s),
            Signal::Aborted(s) => self.on_aborted(s),
            Signal::ScanFragConf(s) => self.on_scan_frag_conf(src, s),
            Signal::ScanFragRef(s) => self.on_scan_frag_ref(src, s),
            Signal::ScanHbRep(s) => self.on_scan_hb_rep(s),
            Signal::TrigAttrInfo(s) => self.on_trig_attr_info(src, s),
            Signal::FireTrigOrd(s) => self.on_fire_trig_ord(src, s),
            Signal::LqhTransConf(s) => self.on_lqh_trans_conf(src, *s),
            Signal::TransIdAi(s) => self.on_transid_ai(s),
            Signal::Packed(p) => {
                for m in host::unpack(src, self.own_ref(), p) {
                    self.dispatch(m);
                }
            }
            // Distribution replies.
            Signal::DiVerifyConf(s) => self.on_diverify_conf(s),
            Signal::DiSeizeConf(s) => self.on_di_seize_conf(s),
            Signal::DiFcountConf(s) => self.on_di_fcount_conf(s),
            Signal::DiFcountRef(s) => self.on_di_fcount_ref(s),
            Signal::DiGetPrimConf(s) => self.on_di_get_prim_conf(s),
            Signal::DiGetPrimRef(s) => self.on_di_get_prim_ref(s),
            Signal::GcpNoMoreTrans(s) => self.on_gcp_nomoretrans(src, s),
            // Dictionary.
            Signal::CreateTabReq(s) => self.on_create_tab_req(src, s),
            Signal::TcSchverReq(s) => self.on_schver_req(src, s),
            Signal::PrepDropTabReq(s) => self.on_prep_drop_tab_req(src, s),
            Signal::DropTabReq(s) => self.on_drop_tab_req(src, s),
            Signal::AlterTabReq(s) => self.on_alter_tab_req(src, s),
            Signal::CreateIndxReq(s) => self.on_create_indx_req(src, s),
            Signal::AlterIndxReq(s) => self.on_alter_indx_req(src, s),
            Signal::DropIndxReq(s) => self.on_drop_indx_req(src, s),
            Signal::CreateTrigReq(s) => self.on_create_trig_req(src, s),
            Signal::DropTrigReq(s) => self.on_drop_trig_req(src, s),
            // Cluster control.
            Signal::NodeFailRep(s) => self.on_node_fail_rep(s),
            Signal::InclNodeReq(s) => self.on_incl_node_req(src, s),
            Signal::ReadNodesConf(s) => self.on_read_nodes_conf(s),
            Signal::TakeOverTcReq(s) => self.on_take_over_tc_req(src, s),
            Signal::TimeSignal(_) => self.on_time_signal(),
            Signal::SendPacked(_) => self.flush_packed(),
            Signal::ReadConfigReq(s) => self.on_read_config_req(src, s),
            Signal::Sttor(s) => self.on_sttor(src, s),
            Signal::NdbSttor(s) => self.on_ndb_sttor(src, s),
            Signal::DisconnectRep(s) => self.on_disconnect_rep(s),
            Signal::AbortAllReq(_) => self.on_abort_all_req(src),
            Signal::TcGetOpSizeReq(_) => self.on_get_op_size_req(src),
            Signal::TcClOpSizeReq(_) => self.on_cl_op_size_req(src),
            Signal::DumpStateOrd(s) => self.on_dump_state_ord(s),
            other => {
                warn!(target: "undertow", ?src, signal = ?other, "unexpected signal, dropped");
            }
        }
    }

    // ---- connection slot management --------------------------------------

    pub(crate) fn seize_conn(&mut self, kind: ConnKind) -> Option<Ix<ApiConnect>> {
        let stack = match kind {
            ConnKind::User => &mut self.free_conns,
            ConnKind::Copy => &mut self.free_copies,
            ConnKind::Fail => &mut self.free_fails,
        };
        let ix = stack.pop()?;
        // Cleared on seize, not on release: late replies must find either
        // zeroed state or the next tenant, never the previous one.
        self.conns.reset(ix);
        let rec = self.conns.get_mut(ix).expect("conn slot");
        rec.kind = kind;
        rec.state = ConnState::Connected;
        self.conn_timers[ix.raw() as usize] = 0;
        Some(ix)
    }

    pub(crate) fn release_conn(&mut self, ix: Ix<ApiConnect>) {
        let rec = self.conns.get_mut(ix).expect("conn slot");
        if rec.state == ConnState::Disconnected {
            system_error!("double release of connection {:?}", ix);
        }
        let kind = rec.kind;
        rec.state = ConnState::Disconnected;
        rec.api_ref = None;
        self.conn_timers[ix.raw() as usize] = 0;
        match kind {
            ConnKind::User => self.free_conns.push(ix),
            ConnKind::Copy => self.free_copies.push(ix),
            ConnKind::Fail => self.free_fails.push(ix),
        }
        debug!(target: "undertow", conn = ?ix, ?kind, "connection released");
    }

    pub(crate) fn conn_ix(&self, raw: u32) -> Option<Ix<ApiConnect>> {
        if (raw as usize) < self.conns.capacity() {
            Some(Ix::new(raw))
        } else {
            None
        }
    }

    /// Refresh the activity timer of a connection slot.
    pub(crate) fn touch_conn(&mut self, ix: Ix<ApiConnect>) {
        // Timer value 0 means "off"; the clock itself skips 0.
        self.conn_timers[ix.raw() as usize] = self.clock.max(1);
    }

    pub(crate) fn stop_conn_timer(&mut self, ix: Ix<ApiConnect>) {
        self.conn_timers[ix.raw() as usize] = 0;
    }

    /// Refresh the buddy connection's timer too: the pair serializes
    /// savepoints on the api side and must not time out half-way.
    pub(crate) fn touch_buddy(&mut self, ix: Ix<ApiConnect>) {
        if let Some(buddy) = self.conns.get(ix).and_then(|c| c.buddy) {
            let same_trans = {
                let a = self.conns.get(ix).expect("conn");
                match self.conns.get(buddy) {
                    Some(b) => b.transid == a.transid && b.state != ConnState::Disconnected,
                    None => false,
                }
            };
            if same_trans {
                self.touch_conn(buddy);
            }
        }
    }

}
