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

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::envelope::{ActorSpace, Envelope};
use crate::mailbox::Mailbox;
use crate::scheduler::SchedulerClient;

/// The actor exit status represents the outcome of the execution of an actor,
/// after the end of the execution.
///
/// It is in many ways, similar to the exit status code of a program.
#[derive(Clone, Debug, Error)]
pub enum ActorExitStatus {
    /// The actor successfully exited: it processed its last message and asked
    /// the loop to forget it.
    #[error("success")]
    Success,

    /// The actor was asked to gracefully shut down.
    #[error("quit")]
    Quit,

    /// The actor was killed (raster teardown, scheduler shutdown).
    #[error("killed")]
    Killed,

    /// An unexpected error happened while processing a message.
    #[error("failure(cause={0:?})")]
    Failure(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for ActorExitStatus {
    fn from(err: anyhow::Error) -> Self {
        ActorExitStatus::Failure(Arc::new(err))
    }
}

impl ActorExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ActorExitStatus::Success)
    }
}

/// An actor has an internal state and processes a stream of messages.
///
/// While processing a message, the actor typically
/// - updates its state;
/// - emits one or more messages to other actors.
///
/// Handlers run on the scheduler thread and must never block: anything slow
/// goes to a worker pool via [`SchedulerClient::submit_job`].
pub trait Actor: Send + Sized + 'static {
    /// Piece of state that can be copied for assert in unit test, admin, etc.
    type ObservableState: Send + Clone + serde::Serialize + fmt::Debug + 'static;

    /// A name identifying the type of actor.
    ///
    /// Ideally respects the `CamelCase` convention.
    ///
    /// It does not need to be "instance-unique", and can be the name of
    /// the actor implementation.
    fn name(&self) -> String {
        type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("Actor")
            .to_string()
    }

    /// Extracts an observable state. Useful for unit tests, and admin UI.
    ///
    /// This function should return quickly.
    fn observable_state(&self) -> Self::ObservableState;

    /// Actors returning `true` get their [`Actor::on_tick`] called on every
    /// loop iteration. This is the only way to observe the outside world
    /// (output queue watermarks, dropped consumer handles) without a message.
    fn wants_tick(&self) -> bool {
        false
    }

    /// Periodic poll entry point, called by the loop between message rounds.
    /// Must return promptly.
    fn on_tick(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        Ok(())
    }

    /// Hook called once upon actor exit, regardless of the exit status.
    fn finalize(&mut self, _exit_status: &ActorExitStatus, _ctx: &mut ActorContext) {}
}

/// Message handler. Emitted messages are delivered depth-first: they are
/// processed before anything that was queued when this handler started.
pub trait Handler<M: Send + 'static>: Actor {
    /// Processes a message.
    ///
    /// If an exit status is returned as an error, the actor exits: it stops
    /// processing messages, its finalize method is called, and the loop drops
    /// it.
    fn handle(&mut self, message: M, ctx: &mut ActorContext) -> Result<(), ActorExitStatus>;
}

/// Execution context handed to every handler invocation.
///
/// Emissions are buffered while the handler runs and pushed onto the
/// depth-first stack when it returns, preserving emission order.
pub struct ActorContext<'a> {
    pub(crate) space: &'a mut ActorSpace,
    pub(crate) emitted: &'a mut Vec<Envelope>,
    pub(crate) client: &'a SchedulerClient,
}

impl<'a> ActorContext<'a> {
    /// Sends a message to the actor behind `mailbox`.
    ///
    /// If the target already exited, the message is dropped when its turn
    /// comes; kill fanouts make such strays ordinary.
    pub fn send_message<A, M>(&mut self, mailbox: &Mailbox<A>, message: M)
    where
        A: Handler<M>,
        M: Send + fmt::Debug + 'static,
    {
        self.emitted.push(Envelope::new(mailbox, message));
    }

    /// Registers a new actor and returns its mailbox.
    pub fn spawn<A: Actor>(&mut self, actor: A) -> Mailbox<A> {
        let mailbox = self.client.create_mailbox::<A>(&actor.name());
        self.space.register(&mailbox, actor);
        mailbox
    }

    /// Registers a new actor under a mailbox created beforehand with
    /// [`SchedulerClient::create_mailbox`]. This lets a whole actor graph be
    /// wired up (mailboxes cross-referencing each other) before any of it
    /// runs.
    pub fn spawn_with_mailbox<A: Actor>(&mut self, mailbox: &Mailbox<A>, actor: A) {
        self.space.register(mailbox, actor);
    }

    /// A clone of the scheduler client, e.g. to hand to a worker-pool job.
    pub fn client(&self) -> SchedulerClient {
        self.client.clone()
    }
}
