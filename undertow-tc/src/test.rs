mod indexes;
mod point_ops;
mod recovery;
mod scans;

pub(crate) mod util {
    use crate::sim::Cluster;
    use crate::TcConfig;
    use undertow_wire::{
        KeyReqFlags, NodeId, OpKind, Signal, TableId, TcKeyReq, TcSeizeReq, TransId,
    };

    /// A cluster whose first listed node hosts the coordinator.
    pub fn cluster(nodes: &[u16]) -> Cluster {
        Cluster::new(NodeId(nodes[0]), nodes, TcConfig::default())
    }

    pub fn seize(cl: &mut Cluster) -> u32 {
        cl.api_send(Signal::TcSeizeReq(TcSeizeReq { api_conn: 1 }));
        for s in cl.take_api() {
            if let Signal::TcSeizeConf(c) = s {
                return c.tc_conn;
            }
        }
        panic!("connection seize was refused");
    }

    pub fn key_req(
        tc_conn: u32,
        transid: TransId,
        table: TableId,
        op: OpKind,
        flags: KeyReqFlags,
        key: &[u32],
        attr: &[u32],
    ) -> Signal {
        Signal::TcKeyReq(Box::new(TcKeyReq {
            tc_conn,
            transid,
            table,
            schema_version: 1,
            op,
            flags,
            client_data: 0xc0de,
            key_len: key.len() as u16,
            attr_len: attr.len() as u16,
            distribution_key: None,
            buddy_conn: None,
            key: key.to_vec(),
            attr: attr.to_vec(),
        }))
    }

    pub fn write_flags(commit: bool) -> KeyReqFlags {
        KeyReqFlags {
            start: true,
            execute: true,
            commit,
            abort_on_error: true,
            ..KeyReqFlags::default()
        }
    }
}
