// Boot and cluster-state handling: configuration intake, start phases,
// node-set discovery and the gates that decide whether a client may open or
// run a transaction at all.

use crate::{Tc, TcConfig};
use tracing::{debug, info};
use undertow_base::{NodeBitmap, Pool, SegPool};
use undertow_wire::codes;
use undertow_wire::{
    BlockRef, InclNodeConf, InclNodeReq, NdbSttor, NdbSttorConf, NodeId, ReadConfigConf,
    ReadConfigReq, ReadNodesConf, ReadNodesReq, Signal, Sttor, SttorConf,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ClusterState {
    #[default]
    NotStarted,
    Started,
    /// Only the designated api node may run transactions.
    SingleUser,
    NodeShutdown,
    ClusterShutdown,
}

impl Tc {
    pub(crate) fn on_read_config_req(&mut self, src: BlockRef, req: ReadConfigReq) {
        let cfg = if req.config.is_empty() {
            let mut c = TcConfig::default();
            c.normalize();
            c
        } else {
            match TcConfig::from_json(&req.config) {
                Ok(c) => c,
                Err(_) => {
                    crate::system_error!("unreadable configuration document");
                }
            }
        };
        self.apply_config(cfg);
        self.send(src, Signal::ReadConfigConf(ReadConfigConf {}));
    }

    /// Re-size every pool from `cfg`. Only legal before the block starts;
    /// afterwards the pools are live and fixed.
    pub(crate) fn apply_config(&mut self, cfg: TcConfig) {
        if self.cluster != ClusterState::NotStarted {
            crate::system_error!("configuration change on a started node");
        }
        let nconn = cfg.api_connections as usize;
        self.conns = Pool::new_all_live(3 * nconn);
        self.conn_timers = vec![0; 3 * nconn];
        self.free_conns.clear();
        self.free_copies.clear();
        self.free_fails.clear();
        for raw in (0..3 * nconn as u32).rev() {
            let ix = undertow_base::Ix::new(raw);
            match raw as usize / nconn {
                0 => self.free_conns.push(ix),
                1 => self.free_copies.push(ix),
                _ => self.free_fails.push(ix),
            }
        }
        self.ops = Pool::new(cfg.tc_ops as usize);
        self.caches = Pool::new(nconn);
        self.bufs = SegPool::new(cfg.transaction_buffer_bytes as usize / 4);
        self.gcps = Pool::new(cfg.gcp_records as usize);
        self.gcp_first = None;
        self.gcp_last = None;
        self.markers = Pool::new(3 * nconn);
        self.fired = Pool::new(cfg.max_fired_triggers as usize);
        self.fired_hash = crate::trigger::FiredHash::new(cfg.max_fired_triggers as usize);
        self.index_ops = Pool::new(cfg.max_index_operations as usize);
        self.scans = Pool::new(cfg.scan_records as usize);
        self.scan_frags = Pool::new(cfg.scan_frag_records as usize);
        self.catalog = crate::table::Catalog::new(
            cfg.tables as usize,
            cfg.max_indexes as usize,
            cfg.max_triggers as usize,
        );
        debug!(target: "undertow", ?cfg, "configuration applied");
        self.cfg = cfg;
    }

    pub(crate) fn on_sttor(&mut self, src: BlockRef, s: Sttor) {
        self.start_phase = s.phase;
        self.send(src, Signal::SttorConf(SttorConf { phase: s.phase }));
    }

    pub(crate) fn on_ndb_sttor(&mut self, src: BlockRef, s: NdbSttor) {
        match s.phase {
            // Own-node bookkeeping only.
            1 => {
                self.alive.insert(self.own.0);
                self.hosts.get_mut(self.own).alive = true;
                self.send(src, Signal::NdbSttorConf(NdbSttorConf { phase: 1 }));
            }
            // Learn the node set; the conf waits for the answer.
            2 => {
                self.pending_sttor = Some((src, 2));
                let cntr = BlockRef::cntr(self.own);
                self.send(cntr, Signal::ReadNodesReq(ReadNodesReq {}));
            }
            // Open for business.
            6 => {
                self.cluster = ClusterState::Started;
                info!(target: "undertow", node = self.own.0, "coordinator started");
                self.send(src, Signal::NdbSttorConf(NdbSttorConf { phase: 6 }));
            }
            p => {
                self.send(src, Signal::NdbSttorConf(NdbSttorConf { phase: p }));
            }
        }
    }

    pub(crate) fn on_read_nodes_conf(&mut self, conf: ReadNodesConf) {
        self.alive = NodeBitmap::new();
        for n in &conf.nodes {
            self.alive.insert(n.0);
            self.hosts.get_mut(*n).alive = true;
        }
        self.master = conf.master;
        if let Some((dst, phase)) = self.pending_sttor.take() {
            self.send(dst, Signal::NdbSttorConf(NdbSttorConf { phase }));
        }
    }

    pub(crate) fn on_incl_node_req(&mut self, src: BlockRef, req: InclNodeReq) {
        self.alive.insert(req.node.0);
        self.hosts.get_mut(req.node).alive = true;
        debug!(target: "undertow", node = req.node.0, "node included");
        self.send(src, Signal::InclNodeConf(InclNodeConf { node: req.node }));
    }

    /// Gate for seizing a connection or starting a transaction. `Ok` or the
    /// reject code the client should see.
    pub(crate) fn allow_start(&self, api: NodeId) -> Result<(), u32> {
        match self.cluster {
            ClusterState::NotStarted => Err(codes::SYSTEM_NOT_STARTED),
            ClusterState::NodeShutdown => Err(codes::NODE_SHUTDOWN),
            ClusterState::ClusterShutdown => Err(codes::CLUSTER_SHUTDOWN),
            ClusterState::SingleUser if self.single_user_node != Some(api) => {
                Err(codes::SINGLE_USER_MODE)
            }
            _ => Ok(()),
        }
    }

    /// Flip into or out of single-user mode. The applicable timeout is
    /// normalized here once: zero disables it rather than firing instantly.
    pub fn set_single_user(&mut self, node: Option<NodeId>) {
        match node {
            Some(n) => {
                self.cluster = ClusterState::SingleUser;
                self.single_user_node = Some(n);
            }
            None => {
                if self.cluster == ClusterState::SingleUser {
                    self.cluster = ClusterState::Started;
                }
                self.single_user_node = None;
            }
        }
    }
}
