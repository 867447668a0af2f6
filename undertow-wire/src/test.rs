use crate::{
    attr, Block, BlockRef, Commit, Complete, Msg, NodeId, Packed, PackedBuf, PackedItem, Signal,
    TcKeyReq, TransId, PACKED_WORDS_MAX,
};
use test_log::test;

#[test]
fn test_envelope_round_trip() {
    let msg = Msg {
        src: BlockRef::api(NodeId(7)),
        dst: BlockRef::tc(NodeId(2)),
        signal: Signal::TcKeyReq(Box::new(TcKeyReq {
            tc_conn: 3,
            transid: TransId(0x1111_2222_3333_4444),
            key_len: 2,
            key: vec![10, 20],
            ..TcKeyReq::default()
        })),
    };
    let buf = msg.encode().unwrap();
    let back = Msg::decode(&buf).unwrap();
    assert_eq!(msg, back);
}

#[test]
fn test_envelope_rejects_foreign_self_send() {
    let msg = Msg {
        src: BlockRef {
            node: NodeId(1),
            block: Block::Lqh,
        },
        dst: BlockRef {
            node: NodeId(1),
            block: Block::Lqh,
        },
        signal: Signal::TimeSignal(crate::TimeSignal {}),
    };
    let buf = msg.encode().unwrap();
    assert!(Msg::decode(&buf).is_err());
}

#[test]
fn test_packed_flushes_on_overflow() {
    let mut buf = PackedBuf::new();
    let commit = |op| {
        PackedItem::Commit(Commit {
            tc_op: op,
            transid: TransId(9),
            gci: 77,
        })
    };
    // Five words each: the fifth commit would cross the 25-word budget.
    for i in 0..4 {
        assert!(buf.push(commit(i)).is_none());
    }
    let flushed: Packed = buf.push(commit(4)).expect("flush");
    assert_eq!(flushed.items.len(), 4);
    let rest = buf.take().expect("remainder");
    assert_eq!(rest.items.len(), 1);
    assert!(buf.take().is_none());
}

#[test]
fn test_packed_word_budget_mixed() {
    let mut buf = PackedBuf::new();
    let mut sent = 0;
    for i in 0..20 {
        let item = PackedItem::Complete(Complete {
            tc_op: i,
            transid: TransId(1),
        });
        if let Some(batch) = buf.push(item) {
            sent += batch.items.len();
            // 3 words per complete: 8 fit under the budget.
            assert!(batch.items.len() * 3 <= PACKED_WORDS_MAX);
        }
    }
    sent += buf.take().map(|b| b.items.len()).unwrap_or(0);
    assert_eq!(sent, 20);
}

#[test]
fn test_attr_encoding() {
    let mut words = vec![attr::header(4, 2), 0xaa, 0xbb];
    words.push(attr::header(5, attr::NULL_LEN));
    words.push(attr::header(6, 1));
    words.push(0xcc);
    let got: Vec<_> = attr::iter(&words).collect();
    assert_eq!(got.len(), 3);
    assert_eq!(got[0], (4, Some(&[0xaa, 0xbb][..])));
    assert_eq!(got[1], (5, None));
    assert_eq!(got[2], (6, Some(&[0xcc][..])));
}
