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

use std::any::Any;
use std::sync::Arc;

use fnv::FnvHashMap;
use tracing::debug;

use crate::actor::{Actor, ActorContext, ActorExitStatus, Handler};
use crate::mailbox::Mailbox;

pub(crate) type ActorId = u64;

/// A type-erased message on its way to a specific actor instance.
///
/// The closure downcasts the registered actor to its concrete type and runs
/// the matching [`Handler`] implementation.
pub(crate) struct Envelope {
    actor_id: ActorId,
    target: Arc<str>,
    invoke: InvokeFn,
}

type InvokeFn =
    Box<dyn FnOnce(&mut ActorCell, &mut ActorContext) -> Result<(), ActorExitStatus> + Send>;

impl Envelope {
    pub fn new<A, M>(mailbox: &Mailbox<A>, message: M) -> Envelope
    where
        A: Handler<M>,
        M: Send + std::fmt::Debug + 'static,
    {
        Envelope {
            actor_id: mailbox.actor_id(),
            target: mailbox.instance_id_arc(),
            invoke: Box::new(move |cell, ctx| {
                let actor: &mut A = cell
                    .actor
                    .as_any_mut()
                    .downcast_mut::<A>()
                    .expect("envelope delivered to an actor of the wrong type");
                actor.handle(message, ctx)
            }),
        }
    }

    /// A periodic-poll pseudo message.
    pub fn tick(actor_id: ActorId, target: Arc<str>) -> Envelope {
        Envelope {
            actor_id,
            target,
            invoke: Box::new(|cell, ctx| cell.actor.tick_dyn(ctx)),
        }
    }

    /// A state-observation request; the copied state leaves the loop through
    /// the captured channel.
    pub fn observe<A: Actor>(
        mailbox: &Mailbox<A>,
        state_tx: flume::Sender<A::ObservableState>,
    ) -> Envelope {
        Envelope {
            actor_id: mailbox.actor_id(),
            target: mailbox.instance_id_arc(),
            invoke: Box::new(move |cell, _ctx| {
                let actor: &mut A = cell
                    .actor
                    .as_any_mut()
                    .downcast_mut::<A>()
                    .expect("observation delivered to an actor of the wrong type");
                let _ = state_tx.send(actor.observable_state());
                Ok(())
            }),
        }
    }

    /// A no-op envelope targeting nobody, used to wake a parked loop.
    pub fn nudge() -> Envelope {
        Envelope {
            actor_id: ActorId::MAX,
            target: Arc::from("nudge"),
            invoke: Box::new(|_, _| Ok(())),
        }
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn process(self, cell: &mut ActorCell, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        (self.invoke)(cell, ctx)
    }
}

/// Object-safe view over a registered actor.
trait AnyActor: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn tick_dyn(&mut self, ctx: &mut ActorContext) -> Result<(), ActorExitStatus>;
    fn finalize_dyn(&mut self, exit_status: &ActorExitStatus, ctx: &mut ActorContext);
}

impl<A: Actor> AnyActor for A {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn tick_dyn(&mut self, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.on_tick(ctx)
    }

    fn finalize_dyn(&mut self, exit_status: &ActorExitStatus, ctx: &mut ActorContext) {
        self.finalize(exit_status, ctx);
    }
}

pub(crate) struct ActorCell {
    actor: Box<dyn AnyActor>,
    instance_id: Arc<str>,
}

impl ActorCell {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn finalize(&mut self, exit_status: &ActorExitStatus, ctx: &mut ActorContext) {
        self.actor.finalize_dyn(exit_status, ctx);
    }
}

/// All actors living in one event loop, keyed by id.
///
/// Insertion order is retained for the periodic tick round so that ticks are
/// as deterministic as message dispatch.
#[derive(Default)]
pub(crate) struct ActorSpace {
    cells: FnvHashMap<ActorId, ActorCell>,
    tick_ids: Vec<ActorId>,
}

impl ActorSpace {
    pub fn register<A: Actor>(&mut self, mailbox: &Mailbox<A>, actor: A) {
        let actor_id = mailbox.actor_id();
        debug_assert!(!self.cells.contains_key(&actor_id), "actor id reused");
        if actor.wants_tick() {
            self.tick_ids.push(actor_id);
        }
        self.cells.insert(
            actor_id,
            ActorCell {
                actor: Box::new(actor),
                instance_id: mailbox.instance_id_arc(),
            },
        );
        debug!(actor = mailbox.instance_id(), "spawned actor");
    }

    pub fn take(&mut self, actor_id: ActorId) -> Option<ActorCell> {
        self.cells.remove(&actor_id)
    }

    pub fn put_back(&mut self, actor_id: ActorId, cell: ActorCell) {
        self.cells.insert(actor_id, cell);
    }

    /// Snapshot of the tick round, pruning ids whose actor exited.
    pub fn tick_round(&mut self) -> Vec<(ActorId, Arc<str>)> {
        self.tick_ids.retain(|actor_id| self.cells.contains_key(actor_id));
        self.tick_ids
            .iter()
            .map(|&actor_id| {
                let target = self.cells[&actor_id].instance_id.clone();
                (actor_id, target)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }
}
