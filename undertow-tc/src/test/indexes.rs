use crate::test::util::{cluster, key_req, seize, write_flags};
use test_log::test;
use undertow_wire::codes;
use undertow_wire::{
    attr, AlterIndxReq, BlockRef, IndexId, KeyReqFlags, Msg, NodeId, OpKind, Signal, TableId,
    TcIndxReq, TransId,
};

const BASE: TableId = TableId(5);
const UQ: IndexId = IndexId(8);
const TID: TransId = TransId(0x4000_0001);

/// One node, a base table, and a unique index over it.
fn index_cluster() -> crate::sim::Cluster {
    let mut cl = cluster(&[1]);
    cl.create_table(BASE, vec![vec![NodeId(1)]]);
    cl.create_index(UQ, BASE, vec![vec![NodeId(1)]], 30);
    cl
}

/// The base row payload: one indexed attribute with value `v`.
fn row_value(v: u32) -> Vec<u32> {
    vec![attr::header(1, 1), v]
}

#[test]
fn test_insert_maintains_index() {
    let mut cl = index_cluster();
    let conn = seize(&mut cl);
    cl.api_send(key_req(
        conn,
        TID,
        BASE,
        OpKind::Insert,
        write_flags(true),
        &[1],
        &row_value(0xaa),
    ));
    let conf = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcKeyConf(c) if c.commit => Some(c),
            _ => None,
        })
        .expect("commit conf");
    assert_eq!(conf.gci, Some(7));
    // The base row and its index twin both committed.
    assert_eq!(cl.lqhs[&1].row(BASE, &[1]), Some(&row_value(0xaa)));
    let index_row = cl.lqhs[&1].row(UQ.as_table(), &[0xaa]).expect("index row");
    // The index row carries the base primary key as data.
    assert_eq!(index_row, &vec![attr::header(0, 1), 1]);
}

#[test]
fn test_update_moves_index_entry() {
    let mut cl = index_cluster();
    let conn = seize(&mut cl);
    cl.api_send(key_req(
        conn,
        TID,
        BASE,
        OpKind::Insert,
        write_flags(true),
        &[1],
        &row_value(0xaa),
    ));
    cl.take_api();

    cl.api_send(key_req(
        conn,
        TransId(0x4000_0002),
        BASE,
        OpKind::Update,
        write_flags(true),
        &[1],
        &row_value(0xbb),
    ));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if c.commit)));
    assert!(cl.lqhs[&1].row(UQ.as_table(), &[0xaa]).is_none());
    assert!(cl.lqhs[&1].row(UQ.as_table(), &[0xbb]).is_some());
}

#[test]
fn test_unique_violation_maps_to_not_unique() {
    let mut cl = index_cluster();
    // Someone already indexed value 0xaa.
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .insert_row(UQ.as_table(), vec![0xaa], vec![attr::header(0, 1), 9]);
    let conn = seize(&mut cl);

    cl.api_send(key_req(
        conn,
        TID,
        BASE,
        OpKind::Insert,
        write_flags(true),
        &[1],
        &row_value(0xaa),
    ));
    let rep = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcRollbackRep(r) => Some(r),
            _ => None,
        })
        .expect("rollback report");
    assert_eq!(rep.code, codes::NOT_UNIQUE);
    // The base insert was compensated by the abort.
    assert_eq!(cl.lqhs[&1].row(BASE, &[1]), None);
}

#[test]
fn test_index_read_translates_to_base_table() {
    let mut cl = index_cluster();
    let conn = seize(&mut cl);
    cl.api_send(key_req(
        conn,
        TID,
        BASE,
        OpKind::Insert,
        write_flags(true),
        &[17],
        &row_value(0xcc),
    ));
    cl.take_api();

    cl.api_send(Signal::TcIndxReq(Box::new(TcIndxReq {
        tc_conn: conn,
        transid: TransId(0x4000_0003),
        index: UQ,
        schema_version: 1,
        op: OpKind::Read,
        flags: KeyReqFlags {
            start: true,
            execute: true,
            commit: true,
            ..KeyReqFlags::default()
        },
        client_data: 0xfeed,
        key_len: 1,
        attr_len: 0,
        key: vec![0xcc],
        attr: vec![],
    })));
    let api = cl.take_api();
    // The row data reaches the client from the base table.
    assert!(api
        .iter()
        .any(|s| matches!(s, Signal::TransIdAi(ai) if ai.words == row_value(0xcc))));
    let conf = api
        .iter()
        .find_map(|s| match s {
            Signal::TcIndxConf(c) => Some(c.clone()),
            _ => None,
        })
        .expect("index conf");
    assert!(conf.commit);
    assert_eq!(conf.ops.len(), 1);
    assert_eq!(conf.ops[0].client_data, 0xfeed);
}

#[test]
fn test_index_read_miss_refuses() {
    let mut cl = index_cluster();
    let conn = seize(&mut cl);
    cl.api_send(Signal::TcIndxReq(Box::new(TcIndxReq {
        tc_conn: conn,
        transid: TID,
        index: UQ,
        schema_version: 1,
        op: OpKind::Read,
        flags: KeyReqFlags {
            start: true,
            execute: true,
            commit: true,
            abort_on_error: true,
            ..KeyReqFlags::default()
        },
        client_data: 1,
        key_len: 1,
        attr_len: 0,
        key: vec![0xee],
        attr: vec![],
    })));
    let api = cl.take_api();
    assert!(api
        .iter()
        .any(|s| matches!(s, Signal::TcIndxRef(r) if r.code == codes::NOT_FOUND)));
}

#[test]
fn test_delete_miss_forgiven_while_index_builds() {
    let mut cl = index_cluster();
    // The build is still running: entries may be missing legitimately.
    let own = cl.tc.own_node();
    cl.deliver(Msg {
        src: BlockRef::dict(own),
        dst: BlockRef::tc(own),
        signal: Signal::AlterIndxReq(AlterIndxReq {
            index: UQ,
            online: false,
        }),
    });
    cl.pump();
    // The base row exists but was never indexed.
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .insert_row(BASE, vec![2], row_value(0xdd));
    let conn = seize(&mut cl);

    cl.api_send(key_req(
        conn,
        TID,
        BASE,
        OpKind::Delete,
        write_flags(true),
        &[2],
        &[],
    ));
    // The missing index entry is forgiven; the delete commits.
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if c.commit)));
    assert_eq!(cl.lqhs[&1].row(BASE, &[2]), None);
}
