// The small transaction-counter set, reported periodically through the
// telemetry layer and on demand through the op-size requests the master uses
// for checkpoint pacing.

use crate::Tc;
use tracing::{debug, info};
use undertow_wire::{
    BlockRef, DumpStateOrd, Signal, TcClOpSizeConf, TcGetOpSizeConf,
};

/// Ticks between periodic counter reports (one minute of 10 ms ticks).
const REPORT_TICKS: u32 = 6000;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransCounters {
    pub trans_count: u64,
    pub commit_count: u64,
    pub read_count: u64,
    pub simple_read_count: u64,
    pub write_count: u64,
    pub attrinfo_count: u64,
    pub abort_count: u64,
    pub scan_count: u64,
    pub range_scan_count: u64,
    /// Operations dispatched since the last op-size clear.
    pub ops_executed: u64,
}

impl TransCounters {
    pub fn reset(&mut self) {
        let ops = self.ops_executed;
        *self = TransCounters::default();
        // The op-size gauge clears on its own request, not on report.
        self.ops_executed = ops;
    }

    fn is_quiet(&self) -> bool {
        self.trans_count == 0 && self.scan_count == 0 && self.abort_count == 0
    }
}

impl Tc {
    pub(crate) fn maybe_report_counters(&mut self) {
        if self.clock.wrapping_sub(self.last_counter_report) < REPORT_TICKS {
            return;
        }
        self.last_counter_report = self.clock;
        if self.counters.is_quiet() {
            return;
        }
        let c = &self.counters;
        info!(
            target: "undertow",
            trans = c.trans_count,
            commits = c.commit_count,
            reads = c.read_count,
            simple_reads = c.simple_read_count,
            writes = c.write_count,
            attrinfo = c.attrinfo_count,
            concurrent_ops = self.ops.in_use(),
            aborts = c.abort_count,
            scans = c.scan_count,
            range_scans = c.range_scan_count,
            "transaction report"
        );
        self.counters.reset();
    }

    pub(crate) fn on_get_op_size_req(&mut self, src: BlockRef) {
        let ops = self.counters.ops_executed;
        self.send(src, Signal::TcGetOpSizeConf(TcGetOpSizeConf { ops }));
    }

    pub(crate) fn on_cl_op_size_req(&mut self, src: BlockRef) {
        self.counters.ops_executed = 0;
        self.send(src, Signal::TcClOpSizeConf(TcClOpSizeConf {}));
    }

    /// Log a structured view of one connection record.
    pub(crate) fn on_dump_state_ord(&mut self, s: DumpStateOrd) {
        let Some(cix) = self.conn_ix(s.tc_conn) else {
            return;
        };
        let Some(c) = self.conns.get(cix) else {
            return;
        };
        let mut ops = 0;
        let mut cur = c.first_op;
        while let Some(oix) = cur {
            ops += 1;
            cur = self.ops.get(oix).and_then(|o| o.next);
        }
        debug!(
            target: "undertow",
            conn = s.tc_conn,
            state = ?c.state,
            transid = c.transid.0,
            ops,
            pending_acks = c.pending_acks,
            lqhkeyreq = c.lqhkeyreq_count,
            lqhkeyconf = c.lqhkeyconf_count,
            timer = self.conn_timers[s.tc_conn as usize],
            "connection dump"
        );
    }
}
