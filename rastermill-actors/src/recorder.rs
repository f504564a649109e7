// Copyright (C) 2023 Rastermill, Inc.
//
// Rastermill is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@rastermill.io.
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

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::{Actor, ActorContext, ActorExitStatus, Handler};

/// Test-only actor that records every message of type `M` it receives.
///
/// Drain the records from the test thread through the handle returned by
/// [`Recorder::handle`].
pub struct Recorder<M> {
    records: Arc<Mutex<Vec<M>>>,
}

impl<M> Default for Recorder<M> {
    fn default() -> Self {
        Recorder {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<M> Recorder<M> {
    pub fn handle(&self) -> RecorderHandle<M> {
        RecorderHandle {
            records: self.records.clone(),
        }
    }
}

pub struct RecorderHandle<M> {
    records: Arc<Mutex<Vec<M>>>,
}

impl<M> RecorderHandle<M> {
    pub fn drain(&self) -> Vec<M> {
        std::mem::take(&mut *self.records.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: Send + fmt::Debug + 'static> Actor for Recorder<M> {
    type ObservableState = usize;

    fn name(&self) -> String {
        "Recorder".to_string()
    }

    fn observable_state(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl<M: Send + fmt::Debug + 'static> Handler<M> for Recorder<M> {
    fn handle(&mut self, message: M, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.records.lock().unwrap().push(message);
        Ok(())
    }
}
