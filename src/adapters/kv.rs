// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::sync::Arc;

use tracing::warn;

use crate::herder::{AppHerder, EngineHandle};

/// Subset of a log-structured KV store's stats the herder reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct KvStoreStats {
    /// Bytes of batched mutations not yet persisted to the lower level.
    pub cur_dirty_bytes: u64,
}

/// Herder-facing surface of a log-structured KV store.
pub trait KvStore: Send + Sync + 'static {
    /// Whether the store persists into a lower-level store. A store without
    /// one keeps everything in memory on purpose and is not herded.
    fn has_lower_level_update(&self) -> bool;

    fn stats(&self) -> anyhow::Result<KvStoreStats>;
}

/// Native lifecycle events of the KV store, as delivered by its event
/// callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KvStoreEvent {
    Close,
    BatchExecuteStart,
    BatchExecuteEnd,
    PersisterProgress,
    Grow,
}

/// Translates native KV store events into herder hooks.
pub struct KvEventBridge<S: KvStore> {
    herder: Arc<AppHerder>,
    store: Arc<S>,
    handle: EngineHandle,
}

impl<S: KvStore> KvEventBridge<S> {
    pub fn new(herder: Arc<AppHerder>, store: Arc<S>) -> Self {
        let handle = EngineHandle::of(&store);
        KvEventBridge {
            herder,
            store,
            handle,
        }
    }

    pub fn on_event(&self, event: KvStoreEvent) {
        if !self.store.has_lower_level_update() {
            return;
        }
        match event {
            KvStoreEvent::Close => self.herder.on_close(self.handle),
            KvStoreEvent::BatchExecuteStart => {
                let store = self.store.clone();
                self.herder
                    .on_batch_execute_start(self.handle, Box::new(move || kv_store_size(&*store)));
            }
            KvStoreEvent::PersisterProgress => self.herder.on_persister_progress(),
            _ => {}
        }
    }
}

fn kv_store_size<S: KvStore>(store: &S) -> u64 {
    match store.stats() {
        Ok(stats) => stats.cur_dirty_bytes,
        Err(error) => {
            warn!(%error, "failed to fetch kv store stats, assuming zero dirty bytes");
            0
        }
    }
}
