// Table, index and trigger catalog. The dictionary block owns schema; this
// is the coordinator's cached view: enough to validate requests, route keys
// and drive index maintenance.

use undertow_wire::codes;
use undertow_wire::{IndexId, TableId, TableKind, TriggerEvent};

/// Schema versions compare on their major part; minor bumps (in-place
/// alters) stay compatible.
pub fn version_major(v: u32) -> u32 {
    v & 0x00ff_ffff
}

#[derive(Clone, Debug, Default)]
pub struct TableRec {
    pub defined: bool,
    pub enabled: bool,
    pub dropping: bool,
    pub kind: TableKind,
    pub stored: bool,
    pub schema_version: u32,
    pub key_attrs: u8,
    pub has_char_attrs: bool,
    pub distr_keys: u8,
}

impl TableRec {
    pub fn usable(&self, schema_version: u32) -> bool {
        self.defined
            && self.enabled
            && !self.dropping
            && version_major(schema_version) == version_major(self.schema_version)
    }

    /// Why `usable` said no.
    pub fn reject_code(&self, schema_version: u32) -> u32 {
        if !self.defined {
            codes::NO_SUCH_TABLE
        } else if self.dropping {
            codes::DROP_TABLE_IN_PROGRESS
        } else if !self.enabled {
            codes::UNKNOWN_TABLE
        } else if version_major(schema_version) != version_major(self.schema_version) {
            codes::WRONG_SCHEMA_VERSION
        } else {
            codes::STATE_ERROR
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IndexState {
    /// Build in progress; maintenance runs but lookups are not served and
    /// spurious delete misses are forgiven.
    #[default]
    Building,
    Online,
}

#[derive(Clone, Debug, Default)]
pub struct IndexRec {
    pub defined: bool,
    pub state: IndexState,
    pub index: IndexId,
    pub primary_table: TableId,
    pub attr_count: u8,
}

#[derive(Clone, Debug, Default)]
pub struct TriggerRec {
    pub defined: bool,
    pub trigger: u32,
    pub event: TriggerEvent,
    pub index: IndexId,
}

/// Fixed-slot catalog; ids are assigned by the dictionary, slots here are
/// found by linear scan (the catalog is small and changes rarely).
#[derive(Debug, Default)]
pub struct Catalog {
    pub tables: Vec<TableRec>,
    pub indexes: Vec<IndexRec>,
    pub triggers: Vec<TriggerRec>,
}

impl Catalog {
    pub fn new(tables: usize, indexes: usize, triggers: usize) -> Catalog {
        Catalog {
            tables: vec![TableRec::default(); tables],
            indexes: vec![IndexRec::default(); indexes],
            triggers: vec![TriggerRec::default(); triggers],
        }
    }

    pub fn table(&self, t: TableId) -> Option<&TableRec> {
        self.tables.get(t.0 as usize).filter(|r| r.defined)
    }

    pub fn table_mut(&mut self, t: TableId) -> Option<&mut TableRec> {
        self.tables.get_mut(t.0 as usize).filter(|r| r.defined)
    }

    /// Slot for `t`, defined or not; None when the id is out of range.
    pub fn table_slot(&mut self, t: TableId) -> Option<&mut TableRec> {
        self.tables.get_mut(t.0 as usize)
    }

    pub fn index(&self, ix: IndexId) -> Option<&IndexRec> {
        self.indexes.iter().find(|r| r.defined && r.index == ix)
    }

    pub fn index_mut(&mut self, ix: IndexId) -> Option<&mut IndexRec> {
        self.indexes.iter_mut().find(|r| r.defined && r.index == ix)
    }

    pub fn free_index_slot(&mut self) -> Option<&mut IndexRec> {
        self.indexes.iter_mut().find(|r| !r.defined)
    }

    pub fn trigger(&self, id: u32) -> Option<&TriggerRec> {
        self.triggers.iter().find(|r| r.defined && r.trigger == id)
    }

    pub fn trigger_mut(&mut self, id: u32) -> Option<&mut TriggerRec> {
        self.triggers.iter_mut().find(|r| r.defined && r.trigger == id)
    }

    pub fn free_trigger_slot(&mut self) -> Option<&mut TriggerRec> {
        self.triggers.iter_mut().find(|r| !r.defined)
    }
}

#[cfg(test)]
mod tabletest {
    use super::*;
    use test_log::test;

    #[test]
    fn test_schema_version_check() {
        let mut rec = TableRec {
            defined: true,
            enabled: true,
            schema_version: 0x0100_0007,
            ..TableRec::default()
        };
        assert!(rec.usable(0x0200_0007));
        assert!(!rec.usable(0x0100_0008));
        assert_eq!(rec.reject_code(0x0100_0008), codes::WRONG_SCHEMA_VERSION);
        rec.dropping = true;
        assert_eq!(
            rec.reject_code(rec.schema_version),
            codes::DROP_TABLE_IN_PROGRESS
        );
    }
}
