// One struct per signal the coordinator consumes or emits, grouped by family
// (client, query handler, distribution, dictionary, cluster), plus the
// `Signal` enum that the message envelope carries.
//
// Inline payload areas are word-limited: a signal carries at most
// `MAX_SIGNAL_WORDS` words of key/attribute data and the remainder streams in
// follow-on keyinfo/attrinfo signals. The limits are protocol constants, not
// implementation conveniences.

use crate::{IndexId, NodeId, TableId, TransId};
use serde::{Deserialize, Serialize};

/// Inline data area of one signal, in words.
pub const MAX_SIGNAL_WORDS: usize = 25;
/// Key words inline in a key request; the rest follow as keyinfo.
pub const KEYREQ_KEY_WORDS: usize = 8;
/// Attr words inline in a key request; the rest follow as attrinfo.
pub const KEYREQ_ATTR_WORDS: usize = 5;
/// Key words inline in a query-handler key request.
pub const LQHKEYREQ_KEY_WORDS: usize = 4;
/// Attr words inline in a query-handler key request.
pub const LQHKEYREQ_ATTR_WORDS: usize = 5;
/// Words per follow-on keyinfo signal.
pub const KEYINFO_WORDS: usize = 20;
/// Words per follow-on attrinfo signal.
pub const ATTRINFO_WORDS: usize = 22;
/// Replicas per fragment: one primary plus up to three backups.
pub const MAX_REPLICAS: usize = 4;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    #[default]
    Read,
    ReadExclusive,
    Insert,
    Update,
    Delete,
    Write,
}

impl OpKind {
    pub fn is_write(self) -> bool {
        !matches!(self, OpKind::Read | OpKind::ReadExclusive)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TriggerEvent {
    #[default]
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    #[default]
    Stored,
    Index,
}

// ---------------------------------------------------------------------------
// Client -> TC
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcSeizeReq {
    /// Client-side handle echoed back in the conf.
    pub api_conn: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcSeizeConf {
    pub api_conn: u32,
    /// Coordinator-side connection slot the client uses from now on.
    pub tc_conn: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcSeizeRef {
    pub api_conn: u32,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcReleaseReq {
    pub tc_conn: u32,
    pub api_conn: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcReleaseConf {
    pub api_conn: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcReleaseRef {
    pub api_conn: u32,
    pub code: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyReqFlags {
    /// First operation of a new transaction.
    pub start: bool,
    /// Flush this and all buffered operations to the query handlers now.
    pub execute: bool,
    /// Commit once every operation in the transaction has prepared.
    pub commit: bool,
    pub simple: bool,
    pub dirty: bool,
    pub interpreted: bool,
    /// Abort the whole transaction on any operation failure, instead of
    /// replying a per-operation ref.
    pub abort_on_error: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcKeyReq {
    pub tc_conn: u32,
    pub transid: TransId,
    pub table: TableId,
    pub schema_version: u32,
    pub op: OpKind,
    pub flags: KeyReqFlags,
    /// Client's per-operation correlation handle, echoed in the conf.
    pub client_data: u32,
    /// Total key length in words across this signal and follow-on keyinfo.
    pub key_len: u16,
    /// Total attrinfo length in words across this signal and follow-on
    /// attrinfo.
    pub attr_len: u16,
    /// Explicit distribution-key hint; bypasses distribution hashing.
    pub distribution_key: Option<u32>,
    /// Partner connection for api-side savepoint coordination; both slots'
    /// timers refresh together.
    pub buddy_conn: Option<u32>,
    /// First `KEYREQ_KEY_WORDS` words of the key.
    pub key: Vec<u32>,
    /// First `KEYREQ_ATTR_WORDS` words of the attrinfo.
    pub attr: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Receiver-side record handle: the coordinator connection for client
    /// signals, the query-handler operation for forwarded ones.
    pub conn: u32,
    pub transid: TransId,
    pub words: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrInfo {
    pub conn: u32,
    pub transid: TransId,
    pub words: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcCommitReq {
    pub tc_conn: u32,
    pub transid: TransId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcRollbackReq {
    pub tc_conn: u32,
    pub transid: TransId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcHbRep {
    pub tc_conn: u32,
    pub transid: TransId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcCommitAck {
    pub transid: TransId,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScanFlags {
    pub lock_exclusive: bool,
    pub hold_lock: bool,
    pub keyinfo: bool,
    pub read_committed: bool,
    pub range: bool,
    pub descending: bool,
    pub tup_scan: bool,
    pub no_disk: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanTabReq {
    pub tc_conn: u32,
    pub transid: TransId,
    pub table: TableId,
    pub schema_version: u32,
    /// Fragment scans run in parallel.
    pub parallelism: u16,
    pub batch_rows: u16,
    pub batch_bytes: u32,
    pub flags: ScanFlags,
    pub key_len: u16,
    /// Total operand attrinfo length; streams in via attrinfo signals.
    pub attr_len: u32,
    pub distribution_key: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanNextReq {
    pub tc_conn: u32,
    pub transid: TransId,
    /// Close the whole scan instead of continuing.
    pub close: bool,
    /// Fragment handles from earlier `ScanTabConf` batches to continue.
    pub frag_handles: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcIndxReq {
    pub tc_conn: u32,
    pub transid: TransId,
    pub index: IndexId,
    pub schema_version: u32,
    pub op: OpKind,
    pub flags: KeyReqFlags,
    pub client_data: u32,
    /// Index key length in words.
    pub key_len: u16,
    pub attr_len: u16,
    pub key: Vec<u32>,
    pub attr: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndxKeyInfo {
    pub tc_conn: u32,
    pub transid: TransId,
    pub words: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndxAttrInfo {
    pub tc_conn: u32,
    pub transid: TransId,
    pub words: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiFailReq {
    pub node: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiFailConf {
    pub node: NodeId,
}

// ---------------------------------------------------------------------------
// TC -> client
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfOp {
    pub client_data: u32,
    /// Words of row data the read produced, 0 for writes.
    pub read_len: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcKeyConf {
    pub api_conn: u32,
    pub transid: TransId,
    /// Set when this conf also confirms the commit.
    pub commit: bool,
    pub gci: Option<u64>,
    /// A commit-ack marker is pending; the client owes a `TcCommitAck`.
    pub marker: bool,
    pub ops: Vec<ConfOp>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcKeyRef {
    pub api_conn: u32,
    pub transid: TransId,
    pub client_data: u32,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcCommitConf {
    pub api_conn: u32,
    pub transid: TransId,
    pub gci: u64,
    pub marker: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcCommitRef {
    pub api_conn: u32,
    pub transid: TransId,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcRollbackConf {
    pub api_conn: u32,
    pub transid: TransId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcRollbackRef {
    pub api_conn: u32,
    pub transid: TransId,
    pub code: u32,
}

/// Unsolicited rollback report: the transaction died for `code`, for example
/// on timeout or node failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcRollbackRep {
    pub api_conn: u32,
    pub transid: TransId,
    pub code: u32,
    /// Source line that raised the error; debugging aid only.
    pub line: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcIndxConf {
    pub api_conn: u32,
    pub transid: TransId,
    pub commit: bool,
    pub gci: Option<u64>,
    pub ops: Vec<ConfOp>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcIndxRef {
    pub api_conn: u32,
    pub transid: TransId,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FragDelivery {
    /// Coordinator-side fragment-scan handle, echoed back in `ScanNextReq`.
    pub frag_handle: u32,
    pub rows: u32,
    pub bytes: u32,
    pub completed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanTabConf {
    pub api_conn: u32,
    pub transid: TransId,
    pub end_of_data: bool,
    pub frags: Vec<FragDelivery>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanTabRef {
    pub api_conn: u32,
    pub transid: TransId,
    pub code: u32,
    /// Whether the scan was already closed when refused.
    pub closed: bool,
}

/// Take-over outcome for a transaction whose coordinator died: committed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcKeyFailConf {
    pub api_conn: u32,
    pub transid: TransId,
    pub gci: u64,
    pub marker: bool,
}

/// Take-over outcome for a transaction whose coordinator died: aborted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcKeyFailRef {
    pub api_conn: u32,
    pub transid: TransId,
}

/// Row data. Normally streamed by the query handler straight to the client;
/// the coordinator receives it only for its own index-table reads.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransIdAi {
    pub conn: u32,
    pub transid: TransId,
    /// Final chunk of this read's data.
    pub last: bool,
    pub words: Vec<u32>,
}

// ---------------------------------------------------------------------------
// TC <-> LQH
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct LqhKeyFlags {
    pub dirty: bool,
    pub simple: bool,
    pub interpreted: bool,
    /// Install a commit-ack marker for this transaction on the handler.
    pub marker: bool,
    pub no_disk: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LqhKeyReq {
    /// Coordinator operation slot; comes back in the conf/ref.
    pub tc_op: u32,
    pub tc_ref: crate::BlockRef,
    pub transid: TransId,
    pub table: TableId,
    pub schema_version: u32,
    pub fragment: u32,
    pub op: OpKind,
    pub flags: LqhKeyFlags,
    /// Replica chain after the receiving primary, in replication order.
    pub backups: Vec<NodeId>,
    /// Position of the receiver in the replica chain; the coordinator sends
    /// 0, each forwarding replica increments.
    pub replica_no: u8,
    /// Triggers fired upstream in the chain, reported to the coordinator by
    /// the final replica's conf. The coordinator sends 0.
    pub fired_triggers: u32,
    pub savepoint: u32,
    pub hash: u32,
    pub key_len: u16,
    pub attr_len: u16,
    /// Where the handler streams row data (the client, or the coordinator
    /// for index reads).
    pub reply_ref: crate::BlockRef,
    /// The client's transaction handle, carried for take-over reporting.
    pub api_conn: u32,
    pub client_data: u32,
    pub key: Vec<u32>,
    pub attr: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LqhKeyConf {
    pub tc_op: u32,
    /// Handler-side operation handle, target of commit/complete/abort.
    pub lqh_conn: u32,
    pub transid: TransId,
    pub read_len: u32,
    /// Index-maintenance triggers fired by this write.
    pub fired_triggers: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LqhKeyRef {
    pub tc_op: u32,
    pub transid: TransId,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Coordinator operation handle; handlers key their local operation on
    /// `(tc_op, transid)`. During take-over this is the dead coordinator's
    /// handle, exactly as the handlers stored it.
    pub tc_op: u32,
    pub transid: TransId,
    pub gci: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Committed {
    pub tc_op: u32,
    pub transid: TransId,
    pub node: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Complete {
    pub tc_op: u32,
    pub transid: TransId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Completed {
    pub tc_op: u32,
    pub transid: TransId,
    pub node: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortReq {
    pub tc_op: u32,
    pub transid: TransId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Aborted {
    pub tc_op: u32,
    pub transid: TransId,
    pub node: NodeId,
}

/// Drop the commit-ack marker for `transid`; the client has acknowledged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoveMarker {
    pub transid: TransId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFragReq {
    /// Coordinator fragment-scan slot.
    pub scan_frag: u32,
    pub transid: TransId,
    pub table: TableId,
    pub schema_version: u32,
    pub fragment: u32,
    pub batch_rows: u16,
    pub batch_bytes: u32,
    pub flags: ScanFlags,
    pub savepoint: u32,
    /// Operand program for the scan.
    pub attr: Vec<u32>,
    /// Where row data is streamed.
    pub reply_ref: crate::BlockRef,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFragConf {
    pub scan_frag: u32,
    /// Handler-side scan handle for next/close requests.
    pub lqh_conn: u32,
    pub transid: TransId,
    /// The fragment is exhausted; no further batches will come.
    pub completed: bool,
    pub rows: u32,
    pub bytes: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFragRef {
    pub scan_frag: u32,
    pub transid: TransId,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFragNextReq {
    pub lqh_conn: u32,
    pub transid: TransId,
    pub close: bool,
    pub batch_rows: u16,
    pub batch_bytes: u32,
}

/// Scan liveness refresh from a handler mid-batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanHbRep {
    pub scan_frag: u32,
    pub transid: TransId,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TrigPayloadKind {
    #[default]
    Key,
    Before,
    After,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrigAttrInfo {
    pub trigger: u32,
    /// Coordinator operation slot of the firing write.
    pub firing_op: u32,
    pub kind: TrigPayloadKind,
    pub words: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FireTrigOrd {
    pub firing_op: u32,
    pub trigger: u32,
    pub event: TriggerEvent,
    pub fragment: u32,
    pub key_words: u32,
    pub before_words: u32,
    pub after_words: u32,
}

/// Take-over sweep: report every surviving operation of every transaction
/// whose coordinator was `failed_tc`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LqhTransReq {
    pub failed_tc: NodeId,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum LqhTransStatus {
    #[default]
    Prepared,
    Committed,
    Aborted,
    /// Marker-only row: a commit-ack marker survives without an operation.
    Marker,
    /// Sentinel: this handler has no more rows to report.
    LastTrans,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LqhTransConf {
    pub status: LqhTransStatus,
    pub transid: TransId,
    /// Handler-side operation handle.
    pub lqh_conn: u32,
    /// The dead coordinator's operation slot, used to regroup replicas of
    /// the same operation.
    pub tc_op: u32,
    pub api_node: NodeId,
    pub api_conn: u32,
    pub client_data: u32,
    pub replica_no: u8,
    pub last_replica_no: u8,
    pub dirty: bool,
    pub table: TableId,
    /// Commit epoch, set when `status` is `Committed`.
    pub gci: u64,
    /// The reporting handler node.
    pub node: NodeId,
}

// ---------------------------------------------------------------------------
// TC <-> DIH
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiVerifyReq {
    pub conn: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiVerifyConf {
    pub conn: u32,
    /// The commit epoch this transaction commits under.
    pub gci: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiSeizeReq {
    pub scan: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiSeizeConf {
    pub scan: u32,
    pub dih_conn: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiFcountReq {
    pub dih_conn: u32,
    pub scan: u32,
    pub table: TableId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiFcountConf {
    pub scan: u32,
    pub table: TableId,
    pub fragments: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiFcountRef {
    pub scan: u32,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiGetPrimReq {
    pub scan_frag: u32,
    pub table: TableId,
    pub fragment: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiGetPrimConf {
    pub scan_frag: u32,
    pub table: TableId,
    pub fragment: u32,
    pub primary: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiGetPrimRef {
    pub scan_frag: u32,
    pub code: u32,
}

/// No further transactions will be admitted to `gci`; reply with
/// `GcpTcFinished` once every transaction on that epoch has completed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GcpNoMoreTrans {
    pub gci: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GcpTcFinished {
    pub gci: u64,
}

// ---------------------------------------------------------------------------
// TC <-> DICT / CNTR
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTabReq {
    pub table: TableId,
    pub schema_version: u32,
    pub kind: TableKind,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTabConf {
    pub table: TableId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcSchverReq {
    pub table: TableId,
    pub schema_version: u32,
    pub kind: TableKind,
    pub stored: bool,
    pub key_attrs: u8,
    pub has_char_attrs: bool,
    pub distr_keys: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcSchverConf {
    pub table: TableId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepDropTabReq {
    pub table: TableId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepDropTabConf {
    pub table: TableId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepDropTabRef {
    pub table: TableId,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropTabReq {
    pub table: TableId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropTabConf {
    pub table: TableId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropTabRef {
    pub table: TableId,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterTabReq {
    pub table: TableId,
    pub new_schema_version: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterTabConf {
    pub table: TableId,
    pub new_schema_version: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateIndxReq {
    pub index: IndexId,
    pub primary_table: TableId,
    /// Attributes in the index key.
    pub attr_count: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateIndxConf {
    pub index: IndexId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterIndxReq {
    pub index: IndexId,
    /// Build finished; the index serves reads from now on.
    pub online: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterIndxConf {
    pub index: IndexId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropIndxReq {
    pub index: IndexId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropIndxConf {
    pub index: IndexId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTrigReq {
    pub trigger: u32,
    pub event: TriggerEvent,
    pub index: IndexId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTrigConf {
    pub trigger: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTrigRef {
    pub trigger: u32,
    pub code: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropTrigReq {
    pub trigger: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropTrigConf {
    pub trigger: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DropTrigRef {
    pub trigger: u32,
    pub code: u32,
}

// ---------------------------------------------------------------------------
// Cluster control
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeFailRep {
    pub failed: Vec<NodeId>,
    /// Master after the failure.
    pub master: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InclNodeReq {
    pub node: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InclNodeConf {
    pub node: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadNodesReq {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadNodesConf {
    pub nodes: Vec<NodeId>,
    pub master: NodeId,
}

/// Instruct this coordinator to take over the transactions of `failed`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TakeOverTcReq {
    pub failed: NodeId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TakeOverTcConf {
    pub failed: NodeId,
}

/// 10 ms scheduler tick; drives every timer in the block.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSignal {}

/// Flush the per-host packed buffers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendPacked {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadConfigReq {
    /// JSON-encoded [`TcConfig`]-shaped document.
    pub config: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadConfigConf {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sttor {
    pub phase: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SttorConf {
    pub phase: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NdbSttor {
    pub phase: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NdbSttorConf {
    pub phase: u32,
}

/// A peer stopped answering; emitted toward the membership service when a
/// replica misses too many retries, received when an api node drops.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DisconnectRep {
    pub node: NodeId,
}

/// Abort every live transaction (system restart path).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortAllReq {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortAllConf {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortAllRef {
    pub code: u32,
}

/// Report the concurrent-operation gauge.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcGetOpSizeReq {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcGetOpSizeConf {
    pub ops: u64,
}

/// Clear the concurrent-operation gauge.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcClOpSizeReq {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcClOpSizeConf {}

/// Log a structured summary of one connection record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DumpStateOrd {
    pub tc_conn: u32,
}

// ---------------------------------------------------------------------------
// Packed batching
// ---------------------------------------------------------------------------

/// One entry of a packed signal. Commit/complete/remove-marker toward the
/// query handlers and key/index confs toward clients coalesce per host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PackedItem {
    Commit(Commit),
    Complete(Complete),
    RemoveMarker(RemoveMarker),
    TcKeyConf(TcKeyConf),
    TcIndxConf(TcIndxConf),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packed {
    pub items: Vec<PackedItem>,
}

// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    // Client -> TC
    TcSeizeReq(TcSeizeReq),
    TcSeizeConf(TcSeizeConf),
    TcSeizeRef(TcSeizeRef),
    TcReleaseReq(TcReleaseReq),
    TcReleaseConf(TcReleaseConf),
    TcReleaseRef(TcReleaseRef),
    TcKeyReq(Box<TcKeyReq>),
    KeyInfo(KeyInfo),
    AttrInfo(AttrInfo),
    TcCommitReq(TcCommitReq),
    TcRollbackReq(TcRollbackReq),
    TcHbRep(TcHbRep),
    TcCommitAck(TcCommitAck),
    ScanTabReq(ScanTabReq),
    ScanNextReq(ScanNextReq),
    TcIndxReq(Box<TcIndxReq>),
    IndxKeyInfo(IndxKeyInfo),
    IndxAttrInfo(IndxAttrInfo),
    ApiFailReq(ApiFailReq),
    ApiFailConf(ApiFailConf),
    // TC -> client
    TcKeyConf(TcKeyConf),
    TcKeyRef(TcKeyRef),
    TcCommitConf(TcCommitConf),
    TcCommitRef(TcCommitRef),
    TcRollbackConf(TcRollbackConf),
    TcRollbackRef(TcRollbackRef),
    TcRollbackRep(TcRollbackRep),
    TcIndxConf(TcIndxConf),
    TcIndxRef(TcIndxRef),
    ScanTabConf(ScanTabConf),
    ScanTabRef(ScanTabRef),
    TcKeyFailConf(TcKeyFailConf),
    TcKeyFailRef(TcKeyFailRef),
    TransIdAi(TransIdAi),
    // TC <-> LQH
    LqhKeyReq(Box<LqhKeyReq>),
    LqhKeyConf(LqhKeyConf),
    LqhKeyRef(LqhKeyRef),
    Commit(Commit),
    Committed(Committed),
    Complete(Complete),
    Completed(Completed),
    AbortReq(AbortReq),
    Aborted(Aborted),
    RemoveMarker(RemoveMarker),
    ScanFragReq(ScanFragReq),
    ScanFragConf(ScanFragConf),
    ScanFragRef(ScanFragRef),
    ScanFragNextReq(ScanFragNextReq),
    ScanHbRep(ScanHbRep),
    TrigAttrInfo(TrigAttrInfo),
    FireTrigOrd(FireTrigOrd),
    LqhTransReq(LqhTransReq),
    LqhTransConf(Box<LqhTransConf>),
    Packed(Packed),
    // TC <-> DIH
    DiVerifyReq(DiVerifyReq),
    DiVerifyConf(DiVerifyConf),
    DiSeizeReq(DiSeizeReq),
    DiSeizeConf(DiSeizeConf),
    DiFcountReq(DiFcountReq),
    DiFcountConf(DiFcountConf),
    DiFcountRef(DiFcountRef),
    DiGetPrimReq(DiGetPrimReq),
    DiGetPrimConf(DiGetPrimConf),
    DiGetPrimRef(DiGetPrimRef),
    GcpNoMoreTrans(GcpNoMoreTrans),
    GcpTcFinished(GcpTcFinished),
    // TC <-> DICT
    CreateTabReq(CreateTabReq),
    CreateTabConf(CreateTabConf),
    TcSchverReq(TcSchverReq),
    TcSchverConf(TcSchverConf),
    PrepDropTabReq(PrepDropTabReq),
    PrepDropTabConf(PrepDropTabConf),
    PrepDropTabRef(PrepDropTabRef),
    DropTabReq(DropTabReq),
    DropTabConf(DropTabConf),
    DropTabRef(DropTabRef),
    AlterTabReq(AlterTabReq),
    AlterTabConf(AlterTabConf),
    CreateIndxReq(CreateIndxReq),
    CreateIndxConf(CreateIndxConf),
    AlterIndxReq(AlterIndxReq),
    AlterIndxConf(AlterIndxConf),
    DropIndxReq(DropIndxReq),
    DropIndxConf(DropIndxConf),
    CreateTrigReq(CreateTrigReq),
    CreateTrigConf(CreateTrigConf),
    CreateTrigRef(CreateTrigRef),
    DropTrigReq(DropTrigReq),
    DropTrigConf(DropTrigConf),
    DropTrigRef(DropTrigRef),
    // Cluster control
    NodeFailRep(NodeFailRep),
    InclNodeReq(InclNodeReq),
    InclNodeConf(InclNodeConf),
    ReadNodesReq(ReadNodesReq),
    ReadNodesConf(ReadNodesConf),
    TakeOverTcReq(TakeOverTcReq),
    TakeOverTcConf(TakeOverTcConf),
    TimeSignal(TimeSignal),
    SendPacked(SendPacked),
    ReadConfigReq(ReadConfigReq),
    ReadConfigConf(ReadConfigConf),
    Sttor(Sttor),
    SttorConf(SttorConf),
    NdbSttor(NdbSttor),
    NdbSttorConf(NdbSttorConf),
    DisconnectRep(DisconnectRep),
    AbortAllReq(AbortAllReq),
    AbortAllConf(AbortAllConf),
    AbortAllRef(AbortAllRef),
    TcGetOpSizeReq(TcGetOpSizeReq),
    TcGetOpSizeConf(TcGetOpSizeConf),
    TcClOpSizeReq(TcClOpSizeReq),
    TcClOpSizeConf(TcClOpSizeConf),
    DumpStateOrd(DumpStateOrd),
}
