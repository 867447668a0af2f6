// A demo server: one coordinator wired to the in-process cluster simulator.
// This exists to show the coordinator doing a full transaction round trip
// end to end; a real deployment replaces the simulator with the cluster's
// actual blocks and transports.

use undertow_base::Result;
use undertow_tc::sim::{Cluster, API_NODE};
use undertow_tc::TcConfig;
use undertow_wire::{
    KeyReqFlags, NodeId, OpKind, Signal, TableId, TcKeyReq, TcSeizeReq, TransId,
};

/// Boot a three-node cluster, run one insert and one read, and return a
/// human-readable trace of what the client saw.
pub fn demo(cfg: TcConfig) -> Result<Vec<String>> {
    let mut cl = Cluster::new(NodeId(1), &[1, 2, 3], cfg);
    let table = TableId(1);
    cl.create_table(
        table,
        vec![vec![NodeId(1), NodeId(2), NodeId(3)]],
    );

    cl.api_send(Signal::TcSeizeReq(TcSeizeReq { api_conn: 1 }));
    let conn = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcSeizeConf(c) => Some(c.tc_conn),
            _ => None,
        })
        .ok_or_else(|| undertow_base::err("coordinator refused the connection"))?;

    let mut log = Vec::new();
    let mut send = |cl: &mut Cluster, op: OpKind, transid: u64, key: u32, attr: Vec<u32>| {
        cl.api_send(Signal::TcKeyReq(Box::new(TcKeyReq {
            tc_conn: conn,
            transid: TransId(transid),
            table,
            schema_version: 1,
            op,
            flags: KeyReqFlags {
                start: true,
                execute: true,
                commit: true,
                dirty: !op.is_write(),
                simple: !op.is_write(),
                abort_on_error: op.is_write(),
                ..KeyReqFlags::default()
            },
            client_data: key,
            key_len: 1,
            attr_len: attr.len() as u16,
            distribution_key: None,
            buddy_conn: None,
            key: vec![key],
            attr,
        })));
    };

    send(&mut cl, OpKind::Insert, 0x10, 7, vec![700, 701]);
    for s in cl.take_api() {
        log.push(format!("client <- {:?}", s));
    }
    send(&mut cl, OpKind::Read, 0x11, 7, vec![]);
    for s in cl.take_api() {
        log.push(format!("client <- {:?}", s));
    }
    log.push(format!(
        "node 2 sees row 7 as {:?}",
        cl.lqhs[&2].row(table, &[7])
    ));
    log.push(format!("api node was {:?}", API_NODE));
    Ok(log)
}

#[cfg(test)]
mod test {
    use super::demo;
    use undertow_tc::TcConfig;

    #[test]
    fn test_demo_round_trip() {
        let lines = demo(TcConfig::default()).expect("demo");
        assert!(lines.iter().any(|l| l.contains("TcKeyConf")));
        assert!(lines.iter().any(|l| l.contains("700")));
    }
}
