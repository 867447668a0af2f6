use crate::test::util::{cluster, key_req, seize, write_flags};
use test_log::test;
use undertow_wire::codes;
use undertow_wire::{
    BlockRef, KeyReqFlags, LqhKeyConf, Msg, NodeId, OpKind, Signal, TableId, TcCommitAck,
    TcCommitReq, TcReleaseReq, TcRollbackReq, TcSeizeReq, TransId,
};

const T: TableId = TableId(5);
const TID: TransId = TransId(0x1000_0001);

#[test]
fn test_simple_dirty_read() {
    let mut cl = cluster(&[1, 2, 3]);
    cl.create_table(T, vec![vec![NodeId(1), NodeId(2), NodeId(3)]]);
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .insert_row(T, vec![42], vec![7, 8, 9]);

    let conn = seize(&mut cl);
    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Read,
        KeyReqFlags {
            start: true,
            commit: true,
            execute: true,
            simple: true,
            dirty: true,
            ..KeyReqFlags::default()
        },
        &[42],
        &[],
    ));

    let api = cl.take_api();
    let row = api.iter().find_map(|s| match s {
        Signal::TransIdAi(ai) => Some(ai.words.clone()),
        _ => None,
    });
    assert_eq!(row, Some(vec![7, 8, 9]));
    let conf = api
        .iter()
        .find_map(|s| match s {
            Signal::TcKeyConf(c) => Some(c.clone()),
            _ => None,
        })
        .expect("key conf");
    assert!(conf.commit);
    assert!(!conf.marker);
    assert_eq!(conf.ops.len(), 1);
    assert_eq!(conf.ops[0].read_len, 3);

    // The transaction auto-released; the handle accepts a fresh start.
    cl.api_send(key_req(
        conn,
        TransId(0x1000_0002),
        T,
        OpKind::Read,
        KeyReqFlags {
            start: true,
            commit: true,
            execute: true,
            simple: true,
            dirty: true,
            ..KeyReqFlags::default()
        },
        &[42],
        &[],
    ));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if c.commit)));
}

#[test]
fn test_insert_with_two_backups_commits_everywhere() {
    let mut cl = cluster(&[1, 2, 3]);
    cl.create_table(T, vec![vec![NodeId(1), NodeId(2), NodeId(3)]]);
    let conn = seize(&mut cl);

    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Insert,
        write_flags(true),
        &[1],
        &[10, 20],
    ));

    let conf = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcKeyConf(c) => Some(c),
            _ => None,
        })
        .expect("key conf");
    assert!(conf.commit);
    assert_eq!(conf.gci, Some(7));
    assert!(conf.marker);

    for n in [1, 2, 3] {
        let lqh = &cl.lqhs[&n];
        assert_eq!(lqh.row(T, &[1]), Some(&vec![10, 20]), "node {}", n);
        assert!(lqh.has_marker(TID), "marker missing on node {}", n);
    }

    // The deferred commit-ack fans the marker removal out; replays are
    // idempotent.
    cl.api_send(Signal::TcCommitAck(TcCommitAck { transid: TID }));
    for n in [1, 2, 3] {
        assert!(!cl.lqhs[&n].has_marker(TID));
    }
    cl.api_send(Signal::TcCommitAck(TcCommitAck { transid: TID }));
}

#[test]
fn test_insert_existing_row_rolls_back() {
    let mut cl = cluster(&[1, 2, 3]);
    cl.create_table(T, vec![vec![NodeId(1), NodeId(2), NodeId(3)]]);
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .insert_row(T, vec![1], vec![99]);
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

    let rep = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcRollbackRep(r) => Some(r),
            _ => None,
        })
        .expect("rollback report");
    assert_eq!(rep.code, codes::ALREADY_EXISTS);
    assert_eq!(rep.transid, TID);
    // The marker never survived the abort.
    assert!(!cl.lqhs[&1].has_marker(TID));

    // The slot hosts a fresh transaction afterwards.
    cl.api_send(key_req(
        conn,
        TransId(0x1000_0003),
        T,
        OpKind::Insert,
        write_flags(true),
        &[2],
        &[11],
    ));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if c.commit)));
}

#[test]
fn test_per_op_refusal_keeps_transaction_alive() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    let conn = seize(&mut cl);

    // First write seizes the marker and succeeds.
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
    // Second op misses, but tolerates errors.
    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Update,
        KeyReqFlags {
            execute: true,
            commit: true,
            abort_on_error: false,
            ..KeyReqFlags::default()
        },
        &[999],
        &[1],
    ));

    let api = cl.take_api();
    let keyref = api
        .iter()
        .find_map(|s| match s {
            Signal::TcKeyRef(r) => Some(r.clone()),
            _ => None,
        })
        .expect("per-op ref");
    assert_eq!(keyref.code, codes::NOT_FOUND);
    // The surviving insert still commits.
    assert!(api
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if c.commit)));
    assert_eq!(cl.lqhs[&1].row(T, &[1]), Some(&vec![10]));
}

#[test]
fn test_explicit_rollback() {
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
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if !c.commit)));

    cl.api_send(Signal::TcRollbackReq(TcRollbackReq {
        tc_conn: conn,
        transid: TID,
    }));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcRollbackConf(_))));
    assert_eq!(cl.lqhs[&1].row(T, &[1]), None);
    assert_eq!(cl.lqhs[&2].row(T, &[1]), None);
}

#[test]
fn test_locked_read_then_explicit_commit() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    cl.lqhs
        .get_mut(&1)
        .unwrap()
        .insert_row(T, vec![3], vec![33]);
    let conn = seize(&mut cl);

    cl.api_send(key_req(
        conn,
        TID,
        T,
        OpKind::Read,
        KeyReqFlags {
            start: true,
            execute: true,
            ..KeyReqFlags::default()
        },
        &[3],
        &[],
    ));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcKeyConf(c) if !c.commit)));

    cl.api_send(Signal::TcCommitReq(TcCommitReq {
        tc_conn: conn,
        transid: TID,
    }));
    let conf = cl
        .take_api()
        .into_iter()
        .find_map(|s| match s {
            Signal::TcCommitConf(c) => Some(c),
            _ => None,
        })
        .expect("commit conf");
    assert_eq!(conf.gci, 7);
}

#[test]
fn test_release_rules() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    let conn = seize(&mut cl);

    // Mid-transaction release is refused.
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
    cl.api_send(Signal::TcReleaseReq(TcReleaseReq {
        tc_conn: conn,
        api_conn: 1,
    }));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcReleaseRef(r) if r.code == codes::INVALID_CONNECTION)));

    // After rollback the slot is in aborting-idle and may be released.
    cl.api_send(Signal::TcRollbackReq(TcRollbackReq {
        tc_conn: conn,
        transid: TID,
    }));
    cl.take_api();
    cl.api_send(Signal::TcReleaseReq(TcReleaseReq {
        tc_conn: conn,
        api_conn: 1,
    }));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcReleaseConf(_))));
}

#[test]
fn test_pool_exhaustion_refuses_seize() {
    let mut cl = cluster(&[1]);
    let cap = cl.tc.config().api_connections;
    for _ in 0..cap {
        seize(&mut cl);
    }
    cl.api_send(Signal::TcSeizeReq(TcSeizeReq { api_conn: 9 }));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcSeizeRef(r) if r.code == codes::NO_FREE_API_CONNECTION)));
}

#[test]
fn test_late_replies_with_wrong_transid_are_dropped() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
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
    cl.take_api();

    // A stale prepare ack for a released operation, and one with a bogus
    // transaction id: both vanish without a trace.
    for transid in [TID, TransId(0xdead)] {
        cl.deliver(Msg {
            src: BlockRef::lqh(NodeId(1)),
            dst: BlockRef::tc(NodeId(1)),
            signal: Signal::LqhKeyConf(LqhKeyConf {
                tc_op: 0,
                lqh_conn: 1,
                transid,
                read_len: 0,
                fired_triggers: 0,
            }),
        });
    }
    cl.pump();
    assert!(cl.take_api().is_empty());

    // Unknown commit-ack: idempotent success.
    cl.api_send(Signal::TcCommitAck(TcCommitAck {
        transid: TransId(0xdead),
    }));
    assert!(cl.take_api().is_empty());
}

#[test]
fn test_key_req_on_foreign_slot_is_refused() {
    let mut cl = cluster(&[1]);
    cl.create_table(T, vec![vec![NodeId(1)]]);
    let _conn = seize(&mut cl);
    // A request naming a slot the pool never handed out.
    cl.api_send(key_req(
        9999,
        TID,
        T,
        OpKind::Read,
        KeyReqFlags {
            start: true,
            ..KeyReqFlags::default()
        },
        &[1],
        &[],
    ));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::TcRollbackRep(r) if r.code == codes::SIGNAL_ERROR)));
}
