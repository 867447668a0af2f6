use serde::{Deserialize, Serialize};
use undertow_base::{err, Error};

pub mod codes;
mod packed;
mod signal;

pub use packed::{PackedBuf, PackedClass, PACKED_WORDS_MAX};
pub use signal::*;

#[cfg(test)]
mod test;

// A cluster is composed of a set of data nodes and api (client) nodes, each
// with a unique NodeId. Node ids are small and dense; they index host tables
// and node bitmaps.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u16);

/// The blocks a signal can address. Every node runs some subset of these;
/// api nodes run only `Api`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Block {
    /// Client-side api library.
    #[default]
    Api,
    /// Transaction coordinator (this crate's subject).
    Tc,
    /// Local query handler, owns data replicas.
    Lqh,
    /// Distribution info handler, maps keys to fragments and replicas.
    Dih,
    /// Schema dictionary.
    Dict,
    /// Cluster controller / membership.
    Cntr,
}

/// Destination or source of a signal: a block on a node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub node: NodeId,
    pub block: Block,
}

impl BlockRef {
    pub fn api(node: NodeId) -> Self {
        BlockRef {
            node,
            block: Block::Api,
        }
    }
    pub fn tc(node: NodeId) -> Self {
        BlockRef {
            node,
            block: Block::Tc,
        }
    }
    pub fn lqh(node: NodeId) -> Self {
        BlockRef {
            node,
            block: Block::Lqh,
        }
    }
    pub fn dih(node: NodeId) -> Self {
        BlockRef {
            node,
            block: Block::Dih,
        }
    }
    pub fn dict(node: NodeId) -> Self {
        BlockRef {
            node,
            block: Block::Dict,
        }
    }
    pub fn cntr(node: NodeId) -> Self {
        BlockRef {
            node,
            block: Block::Cntr,
        }
    }
}

/// 64-bit transaction id. The coordinator mints these; every signal that
/// belongs to a transaction carries one, and a mismatch on arrival means the
/// signal is late and must be dropped, never acted on.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct TransId(pub u64);

#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct TableId(pub u32);

/// An index is itself a table in the dictionary; its id doubles as the id of
/// the index table.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct IndexId(pub u32);

impl IndexId {
    pub fn as_table(self) -> TableId {
        TableId(self.0)
    }
}

// All inter-node communication takes the form of typed signals wrapped in an
// envelope naming the source and destination block. Transports turn these
// into bytes-on-the-wire with msgpack framing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub src: BlockRef,
    pub dst: BlockRef,
    pub signal: Signal,
}

impl Msg {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Msg, Error> {
        let msg: Msg = rmp_serde::from_slice(buf)?;
        if msg.src == msg.dst && msg.src.block != Block::Tc {
            return Err(err("self-addressed signal from foreign block"));
        }
        Ok(msg)
    }
}

/// Attribute encoding shared by trigger payloads and index-key reads: each
/// attribute is a header word (id in the high half, word count in the low
/// half) followed by that many value words. A NULL value is a header with
/// the count `NULL_LEN` and no value words.
pub mod attr {
    pub const NULL_LEN: u16 = 0xffff;

    pub fn header(id: u16, len: u16) -> u32 {
        ((id as u32) << 16) | len as u32
    }

    pub fn split(word: u32) -> (u16, u16) {
        ((word >> 16) as u16, (word & 0xffff) as u16)
    }

    /// Iterate `(id, Option<value words>)` over an encoded attribute stream.
    pub fn iter(words: &[u32]) -> AttrIter<'_> {
        AttrIter { words, pos: 0 }
    }

    pub struct AttrIter<'a> {
        words: &'a [u32],
        pos: usize,
    }

    impl<'a> Iterator for AttrIter<'a> {
        type Item = (u16, Option<&'a [u32]>);
        fn next(&mut self) -> Option<Self::Item> {
            if self.pos >= self.words.len() {
                return None;
            }
            let (id, len) = split(self.words[self.pos]);
            self.pos += 1;
            if len == NULL_LEN {
                return Some((id, None));
            }
            let len = len as usize;
            let end = (self.pos + len).min(self.words.len());
            let vals = &self.words[self.pos..end];
            self.pos = end;
            Some((id, Some(vals)))
        }
    }
}
