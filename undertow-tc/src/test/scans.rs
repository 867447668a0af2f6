use crate::test::util::{cluster, seize};
use test_log::test;
use undertow_wire::codes;
use undertow_wire::{
    NodeId, ScanFlags, ScanNextReq, ScanTabConf, ScanTabReq, Signal, TableId, TransId,
};

const T: TableId = TableId(6);
const TID: TransId = TransId(0x3000_0001);

fn scan_req(tc_conn: u32, parallelism: u16, batch_rows: u16) -> Signal {
    Signal::ScanTabReq(ScanTabReq {
        tc_conn,
        transid: TID,
        table: T,
        schema_version: 1,
        parallelism,
        batch_rows,
        batch_bytes: 32 * 1024,
        flags: ScanFlags {
            read_committed: true,
            ..ScanFlags::default()
        },
        key_len: 0,
        attr_len: 0,
        distribution_key: None,
    })
}

/// Five fragments spread over three nodes, with known row counts.
fn scan_cluster(rows: &[u32]) -> crate::sim::Cluster {
    let mut cl = cluster(&[1, 2, 3]);
    let frags: Vec<Vec<NodeId>> = (0..rows.len())
        .map(|i| vec![NodeId((i % 3 + 1) as u16)])
        .collect();
    cl.create_table(T, frags);
    for (i, count) in rows.iter().enumerate() {
        let node = (i % 3 + 1) as u16;
        cl.lqhs
            .get_mut(&node)
            .unwrap()
            .scan_rows
            .insert((T, i as u32), *count);
    }
    cl
}

/// Drain confs, answer each with a scan-next, and tally rows until the end
/// marker arrives.
fn drive_scan(cl: &mut crate::sim::Cluster, tc_conn: u32) -> (u32, usize) {
    let mut total_rows = 0;
    let mut batches = 0;
    for _ in 0..1000 {
        let confs: Vec<ScanTabConf> = cl
            .take_api()
            .into_iter()
            .filter_map(|s| match s {
                Signal::ScanTabConf(c) => Some(c),
                _ => None,
            })
            .collect();
        for conf in confs {
            if conf.end_of_data {
                return (total_rows, batches);
            }
            batches += 1;
            let handles: Vec<u32> = conf
                .frags
                .iter()
                .map(|f| {
                    total_rows += f.rows;
                    f.frag_handle
                })
                .collect();
            cl.api_send(Signal::ScanNextReq(ScanNextReq {
                tc_conn,
                transid: TID,
                close: false,
                frag_handles: handles,
            }));
        }
    }
    panic!("scan never reached end of data");
}

#[test]
fn test_parallel_scan_five_fragments() {
    let rows = [100, 64, 10, 0, 200];
    let mut cl = scan_cluster(&rows);
    let conn = seize(&mut cl);

    cl.api_send(scan_req(conn, 3, 64));
    let (total, batches) = drive_scan(&mut cl, conn);
    assert_eq!(total, rows.iter().sum::<u32>());
    // 100 needs two batches, 64 one, 10 one, 0 none, 200 four.
    assert!(batches >= 4, "{} batches", batches);

    // The connection is reusable afterwards.
    cl.api_send(scan_req(conn, 2, 64));
    let (total2, _) = drive_scan(&mut cl, conn);
    assert_eq!(total2, total);
}

#[test]
fn test_scan_close_midway() {
    let mut cl = scan_cluster(&[500, 500, 500]);
    let conn = seize(&mut cl);
    cl.api_send(scan_req(conn, 2, 64));

    // Take the first delivery, then close instead of continuing.
    let got: Vec<ScanTabConf> = cl
        .take_api()
        .into_iter()
        .filter_map(|s| match s {
            Signal::ScanTabConf(c) => Some(c),
            _ => None,
        })
        .collect();
    assert!(!got.is_empty());
    cl.api_send(Signal::ScanNextReq(ScanNextReq {
        tc_conn: conn,
        transid: TID,
        close: true,
        frag_handles: Vec::new(),
    }));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::ScanTabConf(c) if c.end_of_data)));

    // Everything was released; a fresh scan starts clean.
    cl.api_send(scan_req(conn, 2, 64));
    assert!(!cl.take_api().is_empty());
}

#[test]
fn test_scan_refusals() {
    let mut cl = scan_cluster(&[10]);
    let conn = seize(&mut cl);

    let mut req = match scan_req(conn, 0, 64) {
        Signal::ScanTabReq(r) => r,
        _ => unreachable!(),
    };
    cl.api_send(Signal::ScanTabReq(req.clone()));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::ScanTabRef(r) if r.code == codes::NO_CONCURRENCY)));

    req.parallelism = 4;
    req.table = TableId(99);
    cl.api_send(Signal::ScanTabReq(req.clone()));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::ScanTabRef(r) if r.code == codes::NO_SUCH_TABLE)));

    req.table = T;
    req.schema_version = 2 << 24;
    cl.api_send(Signal::ScanTabReq(req));
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::ScanTabRef(r) if r.code == codes::WRONG_SCHEMA_VERSION)));
}

#[test]
fn test_scan_timeout_closes() {
    let mut cl = scan_cluster(&[50]);
    cl.lqhs.get_mut(&1).unwrap().hold_scans = true;
    let conn = seize(&mut cl);
    cl.api_send(scan_req(conn, 1, 16));
    assert!(cl.take_api().is_empty());

    cl.tick(600);
    assert!(cl
        .take_api()
        .iter()
        .any(|s| matches!(s, Signal::ScanTabRef(r) if r.code == codes::SCAN_TIME_OUT)));
}

#[test]
fn test_scan_single_fragment_hint() {
    let mut cl = scan_cluster(&[30, 40, 50]);
    let conn = seize(&mut cl);
    let mut req = match scan_req(conn, 3, 64) {
        Signal::ScanTabReq(r) => r,
        _ => unreachable!(),
    };
    // Fragment 1 lives on node 2 and holds 40 rows.
    req.distribution_key = Some(1);
    cl.api_send(Signal::ScanTabReq(req));
    let (total, _) = drive_scan(&mut cl, conn);
    assert_eq!(total, 40);
}
