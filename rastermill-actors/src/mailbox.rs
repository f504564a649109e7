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
use std::marker::PhantomData;
use std::sync::Arc;

use crate::actor::Actor;
use crate::envelope::ActorId;

/// A mailbox is the object that makes it possible to send a message
/// to an actor.
///
/// It is lightweight to clone and can cross threads: the public API and the
/// worker pools address actors exclusively through mailboxes, while the actor
/// itself lives inside the event loop.
///
/// A mailbox can be created before its actor is registered
/// ([`crate::SchedulerClient::create_mailbox`]), which is how mutually
/// referencing actor sets are wired.
pub struct Mailbox<A: Actor> {
    actor_id: ActorId,
    instance_id: Arc<str>,
    _actor: PhantomData<fn() -> A>,
}

impl<A: Actor> Mailbox<A> {
    pub(crate) fn new(actor_id: ActorId, instance_id: Arc<str>) -> Mailbox<A> {
        Mailbox {
            actor_id,
            instance_id,
            _actor: PhantomData,
        }
    }

    pub(crate) fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub(crate) fn instance_id_arc(&self) -> Arc<str> {
        self.instance_id.clone()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl<A: Actor> Clone for Mailbox<A> {
    fn clone(&self) -> Self {
        Mailbox {
            actor_id: self.actor_id,
            instance_id: self.instance_id.clone(),
            _actor: PhantomData,
        }
    }
}

impl<A: Actor> fmt::Debug for Mailbox<A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mailbox").field(&self.instance_id()).finish()
    }
}
