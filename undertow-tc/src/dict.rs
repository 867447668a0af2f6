// Dictionary-driven catalog maintenance. The dictionary block owns schema
// changes; these handlers keep the coordinator's cached view in step and
// confirm each step back.

use crate::table::{IndexState, TableRec};
use crate::Tc;
use tracing::{debug, warn};
use undertow_wire::codes;
use undertow_wire::{
    AlterIndxConf, AlterIndxReq, AlterTabConf, AlterTabReq, BlockRef, CreateIndxConf,
    CreateIndxReq, CreateTabConf, CreateTabReq, CreateTrigConf, CreateTrigRef, CreateTrigReq,
    DropIndxConf, DropIndxReq, DropTabConf, DropTabRef, DropTabReq, DropTrigConf, DropTrigRef,
    DropTrigReq, PrepDropTabConf, PrepDropTabRef, PrepDropTabReq, Signal, TcSchverConf,
    TcSchverReq,
};

impl Tc {
    pub(crate) fn on_create_tab_req(&mut self, src: BlockRef, s: CreateTabReq) {
        let Some(slot) = self.catalog.table_slot(s.table) else {
            warn!(target: "undertow", table = s.table.0, "table id out of catalog range");
            return;
        };
        *slot = TableRec {
            defined: true,
            enabled: false,
            kind: s.kind,
            schema_version: s.schema_version,
            ..TableRec::default()
        };
        self.send(src, Signal::CreateTabConf(CreateTabConf { table: s.table }));
    }

    /// Schema-version activation: the table becomes usable for requests.
    pub(crate) fn on_schver_req(&mut self, src: BlockRef, s: TcSchverReq) {
        let Some(slot) = self.catalog.table_slot(s.table) else {
            warn!(target: "undertow", table = s.table.0, "table id out of catalog range");
            return;
        };
        *slot = TableRec {
            defined: true,
            enabled: true,
            dropping: false,
            kind: s.kind,
            stored: s.stored,
            schema_version: s.schema_version,
            key_attrs: s.key_attrs,
            has_char_attrs: s.has_char_attrs,
            distr_keys: s.distr_keys,
        };
        debug!(target: "undertow", table = s.table.0, version = s.schema_version, "table activated");
        self.send(src, Signal::TcSchverConf(TcSchverConf { table: s.table }));
    }

    pub(crate) fn on_prep_drop_tab_req(&mut self, src: BlockRef, s: PrepDropTabReq) {
        match self.catalog.table_mut(s.table) {
            Some(t) if !t.dropping => {
                t.dropping = true;
                self.send(
                    src,
                    Signal::PrepDropTabConf(PrepDropTabConf { table: s.table }),
                );
            }
            Some(_) => self.send(
                src,
                Signal::PrepDropTabRef(PrepDropTabRef {
                    table: s.table,
                    code: codes::DROP_TABLE_IN_PROGRESS,
                }),
            ),
            None => self.send(
                src,
                Signal::PrepDropTabRef(PrepDropTabRef {
                    table: s.table,
                    code: codes::NO_SUCH_TABLE,
                }),
            ),
        }
    }

    pub(crate) fn on_drop_tab_req(&mut self, src: BlockRef, s: DropTabReq) {
        match self.catalog.table_mut(s.table) {
            Some(t) => {
                *t = TableRec::default();
                self.send(src, Signal::DropTabConf(DropTabConf { table: s.table }));
            }
            None => self.send(
                src,
                Signal::DropTabRef(DropTabRef {
                    table: s.table,
                    code: codes::NO_SUCH_TABLE,
                }),
            ),
        }
    }

    pub(crate) fn on_alter_tab_req(&mut self, src: BlockRef, s: AlterTabReq) {
        if let Some(t) = self.catalog.table_mut(s.table) {
            t.schema_version = s.new_schema_version;
        }
        self.send(
            src,
            Signal::AlterTabConf(AlterTabConf {
                table: s.table,
                new_schema_version: s.new_schema_version,
            }),
        );
    }

    pub(crate) fn on_create_indx_req(&mut self, src: BlockRef, s: CreateIndxReq) {
        let Some(slot) = self.catalog.free_index_slot() else {
            warn!(target: "undertow", index = s.index.0, "index catalog full");
            return;
        };
        slot.defined = true;
        slot.state = IndexState::Building;
        slot.index = s.index;
        slot.primary_table = s.primary_table;
        slot.attr_count = s.attr_count;
        self.send(src, Signal::CreateIndxConf(CreateIndxConf { index: s.index }));
    }

    pub(crate) fn on_alter_indx_req(&mut self, src: BlockRef, s: AlterIndxReq) {
        if let Some(ix) = self.catalog.index_mut(s.index) {
            ix.state = if s.online {
                IndexState::Online
            } else {
                IndexState::Building
            };
        }
        self.send(src, Signal::AlterIndxConf(AlterIndxConf { index: s.index }));
    }

    pub(crate) fn on_drop_indx_req(&mut self, src: BlockRef, s: DropIndxReq) {
        if let Some(ix) = self.catalog.index_mut(s.index) {
            *ix = Default::default();
        }
        self.send(src, Signal::DropIndxConf(DropIndxConf { index: s.index }));
    }

    pub(crate) fn on_create_trig_req(&mut self, src: BlockRef, s: CreateTrigReq) {
        if self.catalog.index(s.index).is_none() {
            return self.send(
                src,
                Signal::CreateTrigRef(CreateTrigRef {
                    trigger: s.trigger,
                    code: codes::NO_SUCH_TABLE,
                }),
            );
        }
        let Some(slot) = self.catalog.free_trigger_slot() else {
            return self.send(
                src,
                Signal::CreateTrigRef(CreateTrigRef {
                    trigger: s.trigger,
                    code: codes::NO_FREE_TC_CONNECTION,
                }),
            );
        };
        slot.defined = true;
        slot.trigger = s.trigger;
        slot.event = s.event;
        slot.index = s.index;
        self.send(
            src,
            Signal::CreateTrigConf(CreateTrigConf { trigger: s.trigger }),
        );
    }

    pub(crate) fn on_drop_trig_req(&mut self, src: BlockRef, s: DropTrigReq) {
        match self.catalog.trigger_mut(s.trigger) {
            Some(t) => {
                *t = Default::default();
                self.send(
                    src,
                    Signal::DropTrigConf(DropTrigConf { trigger: s.trigger }),
                );
            }
            None => self.send(
                src,
                Signal::DropTrigRef(DropTrigRef {
                    trigger: s.trigger,
                    code: codes::NO_SUCH_TABLE,
                }),
            ),
        }
    }
}
