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

use crate::herder::{AppHerder, EngineHandle};

/// Epoch counters of a segmented inverted index. The root epoch advances on
/// every introduction; the merged/persisted epochs trail it until the
/// merger and persister catch up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegmentEpochs {
    pub cur_root: u64,
    pub last_merged: u64,
    pub last_persisted: u64,
}

impl SegmentEpochs {
    /// All three epochs coinciding means every introduced segment has been
    /// merged and persisted: nothing is left in memory worth accounting.
    pub fn is_quiescent(&self) -> bool {
        self.cur_root == self.last_merged && self.last_merged == self.last_persisted
    }
}

/// Herder-facing surface of a segmented inverted-index engine.
pub trait SegmentIndex: Send + Sync + 'static {
    fn epochs(&self) -> SegmentEpochs;

    /// The engine's reported in-memory bytes.
    fn memory_used(&self) -> u64;
}

/// Native lifecycle events of the segmented index engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentIndexEvent {
    Close,
    BatchIntroductionStart,
    PersisterProgress,
    MergerProgress,
}

/// Translates native segmented-index events into herder hooks.
pub struct SegmentEventBridge<I: SegmentIndex> {
    herder: Arc<AppHerder>,
    index: Arc<I>,
    handle: EngineHandle,
}

impl<I: SegmentIndex> SegmentEventBridge<I> {
    pub fn new(herder: Arc<AppHerder>, index: Arc<I>) -> Self {
        let handle = EngineHandle::of(&index);
        SegmentEventBridge {
            herder,
            index,
            handle,
        }
    }

    pub fn on_event(&self, event: SegmentIndexEvent) {
        match event {
            SegmentIndexEvent::Close => self.herder.on_close(self.handle),
            SegmentIndexEvent::BatchIntroductionStart => {
                let index = self.index.clone();
                self.herder.on_batch_execute_start(
                    self.handle,
                    Box::new(move || segment_index_size(&*index)),
                );
            }
            SegmentIndexEvent::PersisterProgress => self.herder.on_persister_progress(),
            SegmentIndexEvent::MergerProgress => self.herder.on_merger_progress(),
        }
    }
}

fn segment_index_size<I: SegmentIndex>(index: &I) -> u64 {
    if index.epochs().is_quiescent() {
        return 0;
    }
    index.memory_used()
}
