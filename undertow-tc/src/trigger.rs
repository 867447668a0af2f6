// Fired-trigger intake and execution.
//
// A write on an indexed table makes the primary replica fire one trigger per
// secondary index. The payload (primary key, before-values, after-values)
// arrives as a storm of trig-attr-info signals keyed by the firing operation
// and the reporting node, terminated by fire-trig-ord carrying the expected
// counts. Completed records queue on the transaction and run as
// index-table writes inside the same transaction; the firing operation's
// prepare ack is held back until every spawned write has prepared.

use crate::conn::{ApiConnect, ConnState};
use crate::keyreq::InternalOp;
use crate::{Job, Tc};
use tracing::{debug, warn};
use undertow_base::{Ix, Pool, SegList};
use undertow_wire::codes;
use undertow_wire::{attr, BlockRef, FireTrigOrd, NodeId, OpKind, TrigAttrInfo, TrigPayloadKind, TriggerEvent};

/// Fired triggers executed per continuation run.
const TRIGGER_BATCH: usize = 16;

#[derive(Debug, Default)]
pub struct FiredTrigger {
    pub trigger: u32,
    /// Firing operation slot (hash key, with `node`).
    pub firing_op: u32,
    pub node: NodeId,
    pub fragment: u32,
    pub event: TriggerEvent,
    pub keys: SegList,
    pub before: SegList,
    pub after: SegList,
    pub next_hash: Option<Ix<FiredTrigger>>,
    /// Link in the owning transaction's ready queue.
    pub next_list: Option<Ix<FiredTrigger>>,
}

/// Closed-addressing hash keyed by `(firing operation, node)`; records live
/// here only while their payload storm is in flight.
#[derive(Debug)]
pub struct FiredHash {
    buckets: Vec<Option<Ix<FiredTrigger>>>,
}

impl FiredHash {
    pub fn new(max_fired: usize) -> FiredHash {
        FiredHash {
            buckets: vec![None; (max_fired + 10) / 10],
        }
    }

    fn bucket(&self, firing_op: u32, node: NodeId) -> usize {
        (firing_op as usize ^ node.0 as usize) % self.buckets.len()
    }

    pub fn insert(&mut self, fix: Ix<FiredTrigger>, pool: &mut Pool<FiredTrigger>) {
        let (op, node) = {
            let f = pool.get(fix).expect("fired trigger");
            (f.firing_op, f.node)
        };
        let b = self.bucket(op, node);
        pool.get_mut(fix).expect("fired trigger").next_hash = self.buckets[b];
        self.buckets[b] = Some(fix);
    }

    pub fn find(
        &self,
        firing_op: u32,
        node: NodeId,
        pool: &Pool<FiredTrigger>,
    ) -> Option<Ix<FiredTrigger>> {
        let mut cur = self.buckets[self.bucket(firing_op, node)];
        while let Some(fix) = cur {
            let f = pool.get(fix)?;
            if f.firing_op == firing_op && f.node == node {
                return Some(fix);
            }
            cur = f.next_hash;
        }
        None
    }

    pub fn remove(
        &mut self,
        firing_op: u32,
        node: NodeId,
        pool: &mut Pool<FiredTrigger>,
    ) -> Option<Ix<FiredTrigger>> {
        let b = self.bucket(firing_op, node);
        let mut prev: Option<Ix<FiredTrigger>> = None;
        let mut cur = self.buckets[b];
        while let Some(fix) = cur {
            let (found, next) = {
                let f = pool.get(fix)?;
                (f.firing_op == firing_op && f.node == node, f.next_hash)
            };
            if found {
                match prev {
                    Some(p) => pool.get_mut(p).expect("fired trigger").next_hash = next,
                    None => self.buckets[b] = next,
                }
                return Some(fix);
            }
            prev = cur;
            cur = next;
        }
        None
    }
}

/// Concatenated value words of an attr-encoded stream, or None when any
/// attribute is NULL (NULLs are not indexed).
fn attr_values(words: &[u32]) -> Option<Vec<u32>> {
    let mut out = Vec::new();
    for (_, vals) in attr::iter(words) {
        out.extend_from_slice(vals?);
    }
    Some(out)
}

impl Tc {
    pub(crate) fn on_trig_attr_info(&mut self, src: BlockRef, s: TrigAttrInfo) {
        let oix: Ix<crate::op::TcOp> = Ix::new(s.firing_op);
        let Some(cix) = self.ops.get(oix).and_then(|o| o.conn) else {
            debug!(target: "undertow", firing_op = s.firing_op, "trigger data for unknown operation");
            return;
        };
        let fix = match self.fired_hash.find(s.firing_op, src.node, &self.fired) {
            Some(fix) => fix,
            None => {
                let Some(fix) = self.fired.seize() else {
                    return self.abort_trans(cix, codes::NO_ATTR_BUFFER, line!());
                };
                {
                    let f = self.fired.get_mut(fix).expect("fired trigger");
                    f.trigger = s.trigger;
                    f.firing_op = s.firing_op;
                    f.node = src.node;
                }
                self.fired_hash.insert(fix, &mut self.fired);
                self.ops.get_mut(oix).expect("op").accumulating_trigger = Some(fix);
                fix
            }
        };
        let mut list = {
            let f = self.fired.get(fix).expect("fired trigger");
            match s.kind {
                TrigPayloadKind::Key => f.keys.clone(),
                TrigPayloadKind::Before => f.before.clone(),
                TrigPayloadKind::After => f.after.clone(),
            }
        };
        if self.bufs.append(&mut list, &s.words).is_err() {
            return self.abort_trans(cix, codes::NO_ATTR_BUFFER, line!());
        }
        let f = self.fired.get_mut(fix).expect("fired trigger");
        match s.kind {
            TrigPayloadKind::Key => f.keys = list,
            TrigPayloadKind::Before => f.before = list,
            TrigPayloadKind::After => f.after = list,
        }
    }

    pub(crate) fn on_fire_trig_ord(&mut self, src: BlockRef, s: FireTrigOrd) {
        let Some(fix) = self
            .fired_hash
            .remove(s.firing_op, src.node, &mut self.fired)
        else {
            warn!(target: "undertow", firing_op = s.firing_op, "fire order without trigger data");
            return;
        };
        let oix: Ix<crate::op::TcOp> = Ix::new(s.firing_op);
        let Some(cix) = self.ops.get(oix).and_then(|o| o.conn) else {
            self.release_fired(fix);
            return;
        };
        {
            let f = self.fired.get(fix).expect("fired trigger");
            if f.keys.len() != s.key_words
                || f.before.len() != s.before_words
                || f.after.len() != s.after_words
            {
                crate::system_error!(
                    "fired trigger {} word counts disagree with the handler",
                    s.trigger
                );
            }
        }
        {
            let f = self.fired.get_mut(fix).expect("fired trigger");
            f.event = s.event;
            f.fragment = s.fragment;
            f.next_list = None;
        }
        // Queue on the transaction, oldest first.
        let last = self.conns.get(cix).expect("conn").fired_last;
        match last {
            Some(tail) => self.fired.get_mut(tail).expect("fired trigger").next_list = Some(fix),
            None => self.conns.get_mut(cix).expect("conn").fired_first = Some(fix),
        }
        self.conns.get_mut(cix).expect("conn").fired_last = Some(fix);

        let ready = {
            let op = self.ops.get_mut(oix).expect("op");
            op.received_count += 1;
            op.accumulating_trigger = None;
            op.fired_count > 0 && op.received_count == op.fired_count
        };
        if ready {
            self.schedule_triggers(cix);
        }
    }

    pub(crate) fn schedule_triggers(&mut self, cix: Ix<ApiConnect>) {
        let c = self.conns.get_mut(cix).expect("conn");
        if !c.trigger_pending {
            c.trigger_pending = true;
            self.continue_later(Job::ExecuteTriggers { conn: cix });
        }
    }

    pub(crate) fn execute_triggers_run(&mut self, cix: Ix<ApiConnect>) {
        {
            let c = self.conns.get_mut(cix).expect("conn");
            c.trigger_pending = false;
            if c.state == ConnState::Disconnected || c.state == ConnState::Aborting {
                return;
            }
        }
        for _ in 0..TRIGGER_BATCH {
            let fix = {
                let c = self.conns.get_mut(cix).expect("conn");
                let Some(fix) = c.fired_first else { break };
                c.fired_first = self.fired.get(fix).expect("fired trigger").next_list;
                if c.fired_first.is_none() {
                    c.fired_last = None;
                }
                fix
            };
            self.execute_trigger(cix, fix);
            self.release_fired(fix);
        }
        let more = self.conns.get(cix).expect("conn").fired_first.is_some();
        if more {
            self.schedule_triggers(cix);
        }
    }

    fn execute_trigger(&mut self, cix: Ix<ApiConnect>, fix: Ix<FiredTrigger>) {
        let (trigger, firing_op, event, keys, before, after) = {
            let f = self.fired.get(fix).expect("fired trigger");
            (
                f.trigger,
                f.firing_op,
                f.event,
                self.bufs.to_vec(&f.keys),
                self.bufs.to_vec(&f.before),
                self.bufs.to_vec(&f.after),
            )
        };
        let Some(index) = self.catalog.trigger(trigger).map(|t| t.index) else {
            debug!(target: "undertow", trigger, "trigger dropped mid-flight, skipped");
            return;
        };
        if self.catalog.index(index).is_none() {
            debug!(target: "undertow", index = index.0, "index dropped mid-flight, skipped");
            return;
        }
        let parent: Ix<crate::op::TcOp> = Ix::new(firing_op);
        match event {
            TriggerEvent::Insert => {
                self.index_insert(cix, parent, index, &after, &keys);
            }
            TriggerEvent::Delete => {
                self.index_delete(cix, parent, index, &before);
            }
            TriggerEvent::Update => {
                self.index_delete(cix, parent, index, &before);
                self.index_insert(cix, parent, index, &after, &keys);
            }
        }
    }

    /// Insert `{index-key-values, primary-key-as-data}` into the index
    /// table. A NULL in the key skips the maintenance: NULLs are not
    /// indexed.
    fn index_insert(
        &mut self,
        cix: Ix<ApiConnect>,
        parent: Ix<crate::op::TcOp>,
        index: undertow_wire::IndexId,
        values: &[u32],
        pk: &[u32],
    ) {
        let Some(key_words) = attr_values(values) else {
            debug!(target: "undertow", index = index.0, "NULL in index key, not indexed");
            return;
        };
        let savepoint = self.conns.get(cix).expect("conn").savepoint;
        self.issue_internal_op(
            cix,
            index.as_table(),
            &key_words,
            pk,
            savepoint,
            InternalOp::TriggerChild {
                parent,
                index,
                op: OpKind::Insert,
            },
        );
    }

    fn index_delete(
        &mut self,
        cix: Ix<ApiConnect>,
        parent: Ix<crate::op::TcOp>,
        index: undertow_wire::IndexId,
        values: &[u32],
    ) {
        let Some(key_words) = attr_values(values) else {
            debug!(target: "undertow", index = index.0, "NULL in index key, not indexed");
            return;
        };
        let savepoint = self.conns.get(cix).expect("conn").savepoint;
        self.issue_internal_op(
            cix,
            index.as_table(),
            &key_words,
            &[],
            savepoint,
            InternalOp::TriggerChild {
                parent,
                index,
                op: OpKind::Delete,
            },
        );
    }

    fn release_fired(&mut self, fix: Ix<FiredTrigger>) {
        let (mut keys, mut before, mut after) = {
            let f = self.fired.get_mut(fix).expect("fired trigger");
            (
                std::mem::take(&mut f.keys),
                std::mem::take(&mut f.before),
                std::mem::take(&mut f.after),
            )
        };
        self.bufs.release(&mut keys);
        self.bufs.release(&mut before);
        self.bufs.release(&mut after);
        self.fired.release(fix);
    }

    /// Free every fired-trigger record a dying transaction still holds:
    /// queued ones and half-accumulated ones.
    pub(crate) fn release_fired_triggers(&mut self, cix: Ix<ApiConnect>) {
        let mut cur = {
            let c = self.conns.get_mut(cix).expect("conn");
            let first = c.fired_first.take();
            c.fired_last = None;
            c.trigger_pending = false;
            first
        };
        while let Some(fix) = cur {
            cur = self.fired.get(fix).expect("fired trigger").next_list;
            self.release_fired(fix);
        }
        let mut op = self.conns.get(cix).expect("conn").first_op;
        while let Some(oix) = op {
            let (next, acc) = {
                let o = self.ops.get(oix).expect("op");
                (o.next, o.accumulating_trigger)
            };
            if let Some(fix) = acc {
                let (fop, node) = {
                    let f = self.fired.get(fix).expect("fired trigger");
                    (f.firing_op, f.node)
                };
                self.fired_hash.remove(fop, node, &mut self.fired);
                self.release_fired(fix);
                self.ops.get_mut(oix).expect("op").accumulating_trigger = None;
            }
            op = next;
        }
    }
}
