use crate::test::util::{cluster, key_req, seize, write_flags};
use test_log::test;
use undertow_wire::codes;
use undertow_wire::{
    ApiFailReq, BlockRef, KeyReqFlags, LqhTransConf, LqhTransStatus, Msg, NodeId, OpKind, Signal,
    TableId, TransId,
};

const T: TableId = TableId(5);
const TID: TransId = TransId(0x2000_0001);

#[test]
fn test_commit_redrive_after_replica_silence_and_death() {
    let mut cl = cluster(&[1, 2, 3]);
    cl.create_table(T, vec![vec![NodeId(1), NodeId(2), NodeId(3)]]);
    cl.lqhs.get_mut(&3).unwrap().hold_commits = true;
    let conn = seize(&mut cl);

    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Insert,
        write_flags(true),
        &[1],
        &[10],
    ));
    // Two replicas acked the commit; the third went silent, so no client
    // answer yet.
    assert!(!cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if c.commit)));

    // The watchdog re-sends a few times, then reports the replica dead.
    cl.tick(1200);
    assert!(cl
        .cntr_msgs
        .iter()
        .any(|m| matches!(&m.signal, Signal::DisconnectRep(d) if d.node == NodeId(3))));

    // The membership service confirms the death; the commit re-drives to
    // the survivors and the client gets its answer with the original epoch.
    cl.fail_node(NodeId(3));
    let conf = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcKeyConf(c) if c.commit => Some(c),
            _ => None,
        })
        .expect("commit conf after re-drive");
    assert_eq!(conf.gci, Some(7));
    assert_eq!(cl.lqhs[&1].row(T, &[1]), Some(&vec![10]));
    assert_eq!(cl.lqhs[&2].row(T, &[1]), Some(&vec![10]));
}

#[test]
fn test_node_failure_before_commit_aborts() {
    let mut cl = cluster(&[1, 2]);
    cl.create_table(T, vec![vec![NodeId(1), NodeId(2)]]);
    let conn = seize(&mut cl);

    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Insert,
        KeyReqFlags {
            start: true,
            execute: true,
            abort_on_error: true,
            ..KeyReqFlags::default()
        },
        &[1],
        &[10],
    ));
    cl.take_api();

    cl.fail_node(NodeId(2));
    let rep = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcRollbackRep(r) => Some(r),
            _ => None,
        })
        .expect("rollback report");
    assert_eq!(rep.code, codes::NODE_FAIL_BEFORE_COMMIT);
    assert_eq!(cl.lqhs[&1].row(T, &[1]), None);
}

fn trans_row(status: LqhTransStatus, tc_op: u32, replica_no: u8, gci: u64) -> LqhTransConf {
    LqhTransConf {
        status,
        transid: TID,
        tc_op,
        api_node: crate::sim::API_NODE,
        api_conn: 55,
        client_data: 7,
        replica_no,
        last_replica_no: 1,
        table: T,
        gci,
        ..LqhTransConf::default()
    }
}

#[test]
fn test_takeover_commits_partially_committed_transaction() {
    let mut cl = cluster(&[1, 2, 9]);
    cl.create_table(T, vec![vec![NodeId(1), NodeId(2)]]);
    // Node 9 was the coordinator of a transaction that had committed on
    // node 1 but only prepared on node 2 when it died.
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .trans_rows
        .push(trans_row(LqhTransStatus::Committed, 17, 0, 5));
    cl.lqhs
        .get_mut(&2)
        .unwrap()
        .trans_rows
        .push(trans_row(LqhTransStatus::Prepared, 17, 1, 0));

    cl.fail_node(NodeId(9));

    // Any committed replica decides the outcome: committed.
    let conf = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcKeyFailConf(c) => Some(c),
            _ => None,
        })
        .expect("take-over commit report");
    assert_eq!(conf.transid, TID);
    assert_eq!(conf.gci, 5);
    assert_eq!(conf.api_conn, 55);
    assert!(cl
        .cntr_msgs
        .iter()
        .any(|m| matches!(&m.signal, Signal::TakeOverTcConf(c) if c.failed == NodeId(9))));
}

#[test]
fn test_takeover_aborts_prepared_only_transaction() {
    let mut cl = cluster(&[1, 2, 9]);
    cl.create_table(T, vec![vec![NodeId(1), NodeId(2)]]);
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .trans_rows
        .push(trans_row(LqhTransStatus::Prepared, 23, 0, 0));
    cl.lqhs
        .get_mut(&2)
        .unwrap()
        .trans_rows
        .push(trans_row(LqhTransStatus::Prepared, 23, 1, 0));

    cl.fail_node(NodeId(9));

    // No replica committed anywhere: presumed abort.
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyFailRef(r) if r.transid == TID)));
    assert!(cl
        .cntr_msgs
        .iter()
        .any(|m| matches!(&m.signal, Signal::TakeOverTcConf(c) if c.failed == NodeId(9))));
}

#[test]
fn test_takeover_rebuilds_marker_rows() {
    let mut cl = cluster(&[1, 9]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .trans_rows
        .push(trans_row(LqhTransStatus::Marker, 0, 0, 0));
    cl.fail_node(NodeId(9));

    // A commit-ack for the orphaned marker fans out its removal.
    cl.api_send(Signal::TcCommitAck(undertow_wire::TcCommitAck {
        transid: TID,
    }));
    cl.pump();
    // Idempotent replay.
    cl.api_send(Signal::TcCommitAck(undertow_wire::TcCommitAck {
        transid: TID,
    }));
}

#[test]
fn test_transaction_timeout_aborts() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    let conn = seize(&mut cl);

    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Insert,
        KeyReqFlags {
            start: true,
            execute: true,
            abort_on_error: true,
            ..KeyReqFlags::default()
        },
        &[1],
        &[10],
    ));
    cl.take_api();

    // Sit past the deadlock detection timeout.
    cl.tick(400);
    let rep = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcRollbackRep(r) => Some(r),
            _ => None,
        })
        .expect("timeout rollback");
    assert_eq!(rep.code, codes::TIME_OUT);
    assert_eq!(cl.lqhs[&1].row(T, &[1]), None);
}

#[test]
fn test_heartbeat_defers_timeout() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    let conn = seize(&mut cl);
    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Insert,
        KeyReqFlags {
            start: true,
            execute: true,
            abort_on_error: true,
            ..KeyReqFlags::default()
        },
        &[1],
        &[10],
    ));
    cl.take_api();

    for _ in 0..6 {
        cl.tick(100);
        cl.api_send(Signal::TcHbRep(undertow_wire::TcHbRep {
            tc_conn: conn,
            transid: TID,
        }));
    }
    // Heartbeats kept it alive the whole time.
    assert!(!cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcRollbackRep(_))));
}

#[test]
fn test_api_failure_releases_everything() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    let conn = seize(&mut cl);
    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Insert,
        KeyReqFlags {
            start: true,
            execute: true,
            abort_on_error: true,
            ..KeyReqFlags::default()
        },
        &[1],
        &[10],
    ));
    cl.take_api();

    let own = cl.tc.own_node();
    cl.deliver(Msg {
        src: BlockRef::cntr(own),
        dst: BlockRef::tc(own),
        signal: Signal::ApiFailReq(ApiFailReq {
            node: crate::sim::API_NODE,
        }),
    });
    cl.pump();
    assert!(cl
        .cntr_msgs
        .iter()
        .any(|m| matches!(&m.signal, Signal::ApiFailConf(c) if c.node == crate::sim::API_NODE)));
    // The dead client gets no reply, its write is gone, and every
    // connection slot is free again.
    assert!(cl.take_api().is_empty());
    assert_eq!(cl.lqhs[&1].row(T, &[1]), None);
    let cap = cl.tc.config().api_connections;
    for _ in 0..cap {
        seize(&mut cl);
    }
}

#[test]
fn test_abort_all_drains_live_transactions() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    let a = seize(&mut cl);
    let b = seize(&mut cl);
    for (conn, transid) in [(a, TID), (b, TransId(0x2000_0002))] {
        cl.api_send(key_req(
            conn,
            transid,
            T,
            OpKind::Insert,
            KeyReqFlags {
                start: true,
                execute: true,
                abort_on_error: true,
                ..KeyReqFlags::default()
            },
            &[conn],
            &[1],
        ));
    }
    cl.take_api();

    let own = cl.tc.own_node();
    cl.deliver(Msg {
        src: BlockRef::cntr(own),
        dst: BlockRef::tc(own),
        signal: Signal::AbortAllReq(undertow_wire::AbortAllReq {}),
    });
    cl.pump();
    cl.tick(2);
    assert!(cl
        .cntr_msgs
        .iter()
        .any(|m| matches!(&m.signal, Signal::AbortAllConf(_))));
    let reps: Vec<_> = cl
        .take_api()
        .into_iter()
        .filter(|s| matches!(s, Signal::TcRollbackRep(r) if r.code == codes::CLUSTER_SHUTDOWN))
        .collect();
    assert_eq!(reps.len(), 2);
}
