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

//! rastermill-actors is the deterministic actor loop of rastermill.
//!
//! It solves the following problem:
//! - let many small state machines communicate through typed messages,
//! - keep every coordination decision on one thread, in one deterministic
//!   order (depth-first delivery),
//! - let blocking work run on worker pools whose completions re-enter the
//!   loop as ordinary messages.
//!
//! No handler ever blocks and no two handlers ever run concurrently. A
//! message emitted inside a handler is dispatched before any previously
//! queued message; only the external inject queue (public API calls and pool
//! completions) is FIFO.

mod actor;
mod envelope;
mod mailbox;
#[cfg(any(test, feature = "testsuite"))]
mod recorder;
mod scheduler;
#[cfg(test)]
mod tests;

pub use actor::{Actor, ActorContext, ActorExitStatus, Handler};
pub use mailbox::Mailbox;
#[cfg(any(test, feature = "testsuite"))]
pub use recorder::Recorder;
pub use scheduler::{EventLoop, EventLoopConfig, ObserveError, SchedulerClient, SendError};
