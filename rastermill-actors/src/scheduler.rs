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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rastermill_common::{new_coolid, CancelToken, KillSwitch, Pool};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::actor::{Actor, ActorContext, ActorExitStatus, Handler};
use crate::envelope::{ActorSpace, Envelope};
use crate::mailbox::Mailbox;

#[derive(Debug, Clone, Copy)]
pub struct EventLoopConfig {
    /// How long the loop parks when fully idle before running the next
    /// periodic-poll round.
    pub idle_sleep: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> EventLoopConfig {
        EventLoopConfig {
            idle_sleep: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("the scheduler loop is gone")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ObserveError {
    #[error("observation timed out")]
    Timeout,
    #[error("the observed actor or its loop is gone")]
    Disconnected,
}

struct SchedulerState {
    next_actor_id: AtomicU64,
    kill_switch: KillSwitch,
}

/// Thread-safe handle on the event loop.
///
/// All external parties (the public dataset facade and worker-pool jobs)
/// talk to actors exclusively through a client. Injected messages enter the
/// loop FIFO, between depth-first descents.
pub struct SchedulerClient {
    inject_tx: flume::Sender<Envelope>,
    state: Arc<SchedulerState>,
}

impl Clone for SchedulerClient {
    fn clone(&self) -> Self {
        SchedulerClient {
            inject_tx: self.inject_tx.clone(),
            state: self.state.clone(),
        }
    }
}

impl SchedulerClient {
    /// Allocates a mailbox whose actor will be registered later with
    /// [`ActorContext::spawn_with_mailbox`].
    pub fn create_mailbox<A: Actor>(&self, name: &str) -> Mailbox<A> {
        let actor_id = self.state.next_actor_id.fetch_add(1, Ordering::Relaxed);
        Mailbox::new(actor_id, Arc::from(new_coolid(name)))
    }

    /// Injects a message into the loop.
    pub fn send_message<A, M>(&self, mailbox: &Mailbox<A>, message: M) -> Result<(), SendError>
    where
        A: Handler<M>,
        M: Send + fmt::Debug + 'static,
    {
        self.inject_tx
            .send(Envelope::new(mailbox, message))
            .map_err(|_| SendError::Disconnected)
    }

    /// Runs `job` on `pool` and delivers its return value to `mailbox` as a
    /// message.
    ///
    /// The job is skipped if `cancel` fires before it starts, and its
    /// completion message is dropped if `cancel` fires while it runs.
    pub fn submit_job<A, M, F>(
        &self,
        pool: &Pool,
        mailbox: &Mailbox<A>,
        cancel: &CancelToken,
        job: F,
    ) where
        A: Handler<M>,
        M: Send + fmt::Debug + 'static,
        F: FnOnce() -> M + Send + 'static,
    {
        let client = self.clone();
        let mailbox = mailbox.clone();
        let cancel = cancel.clone();
        pool.spawn(move || {
            if cancel.is_cancelled() {
                return;
            }
            let message = job();
            if cancel.is_cancelled() {
                return;
            }
            let _ = client.send_message(&mailbox, message);
        });
    }

    /// Requests a copy of the actor's observable state. The state arrives on
    /// the returned channel once the loop processes the request.
    pub fn observe<A: Actor>(&self, mailbox: &Mailbox<A>) -> flume::Receiver<A::ObservableState> {
        let (state_tx, state_rx) = flume::bounded(1);
        let _ = self
            .inject_tx
            .send(Envelope::observe::<A>(mailbox, state_tx));
        state_rx
    }

    /// Blocking flavor of [`SchedulerClient::observe`] for a loop running on
    /// its own thread.
    pub fn observe_blocking<A: Actor>(
        &self,
        mailbox: &Mailbox<A>,
        timeout: Duration,
    ) -> Result<A::ObservableState, ObserveError> {
        self.observe(mailbox)
            .recv_timeout(timeout)
            .map_err(|recv_error| match recv_error {
                flume::RecvTimeoutError::Timeout => ObserveError::Timeout,
                flume::RecvTimeoutError::Disconnected => ObserveError::Disconnected,
            })
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.state.kill_switch.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.state.kill_switch.is_alive()
    }

    /// Stops the loop. Idempotent; wakes the loop if it is parked.
    pub fn stop(&self) {
        self.state.kill_switch.kill();
        let _ = self.inject_tx.send(Envelope::nudge());
    }
}

/// The deterministic event loop.
///
/// One tick: (1) drain the external inject queue, giving each injected
/// message a full depth-first descent; (2) run the periodic-poll round on the
/// actors that asked for it; (3) park briefly when nothing happened.
///
/// Depth-first delivery is a correctness property, not an optimization:
/// handlers rely on the reactions to a message they emitted being settled
/// before the next queued message is observed.
pub struct EventLoop {
    space: ActorSpace,
    inject_rx: flume::Receiver<Envelope>,
    client: SchedulerClient,
    config: EventLoopConfig,
}

impl EventLoop {
    pub fn new(config: EventLoopConfig) -> EventLoop {
        let (inject_tx, inject_rx) = flume::unbounded();
        let client = SchedulerClient {
            inject_tx,
            state: Arc::new(SchedulerState {
                next_actor_id: AtomicU64::new(0),
                kill_switch: KillSwitch::default(),
            }),
        };
        EventLoop {
            space: ActorSpace::default(),
            inject_rx,
            client,
            config,
        }
    }

    pub fn client(&self) -> SchedulerClient {
        self.client.clone()
    }

    pub fn num_actors(&self) -> usize {
        self.space.len()
    }

    /// Registers a root actor before the loop runs. Actors spawned later are
    /// registered from within handlers through [`ActorContext::spawn`] /
    /// [`ActorContext::spawn_with_mailbox`].
    pub fn spawn_actor<A: Actor>(&mut self, actor: A) -> Mailbox<A> {
        let mailbox = self.client.create_mailbox::<A>(&actor.name());
        self.space.register(&mailbox, actor);
        mailbox
    }

    /// Same as [`EventLoop::spawn_actor`] with a mailbox created beforehand.
    pub fn spawn_actor_with_mailbox<A: Actor>(&mut self, mailbox: &Mailbox<A>, actor: A) {
        self.space.register(mailbox, actor);
    }

    /// Runs one full tick and reports how many messages moved. `0` means the
    /// loop is idle: no injected message, and no periodic poll emitted
    /// anything.
    pub fn process_pending(&mut self) -> usize {
        let mut activity = 0;
        while let Ok(envelope) = self.inject_rx.try_recv() {
            activity += self.dispatch_descent(envelope);
        }
        for (actor_id, target) in self.space.tick_round() {
            // The tick itself is not "activity", only what it emitted is;
            // otherwise an idle loop would never look idle.
            activity += self.dispatch_descent(Envelope::tick(actor_id, target)) - 1;
        }
        activity
    }

    /// Ticks until fully idle. This is the entry point for deterministic
    /// single-threaded tests; with inline pools every submitted job completes
    /// within this call.
    pub fn run_until_idle(&mut self) {
        while self.process_pending() > 0 {}
    }

    /// Runs the loop until its kill switch dies. Blocks the calling thread.
    pub fn run(mut self) {
        info!("scheduler loop starting");
        while self.client.is_alive() {
            let activity = self.process_pending();
            if activity > 0 {
                continue;
            }
            match self.inject_rx.recv_timeout(self.config.idle_sleep) {
                Ok(envelope) => {
                    self.dispatch_descent(envelope);
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(num_actors = self.space.len(), "scheduler loop exiting");
    }

    /// Runs the loop on a dedicated thread.
    pub fn spawn_thread(self) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("rastermill-scheduler".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn the scheduler thread")
    }

    /// Processes one envelope and, depth-first, everything it transitively
    /// emits. Returns the number of envelopes processed.
    fn dispatch_descent(&mut self, envelope: Envelope) -> usize {
        let mut processed = 0;
        let mut stack = vec![envelope];
        while let Some(envelope) = stack.pop() {
            processed += 1;
            let actor_id = envelope.actor_id();
            let Some(mut cell) = self.space.take(actor_id) else {
                debug!(target = envelope.target(), "dropping message for exited actor");
                continue;
            };
            let mut emitted: Vec<Envelope> = Vec::new();
            let handler_result = {
                let mut ctx = ActorContext {
                    space: &mut self.space,
                    emitted: &mut emitted,
                    client: &self.client,
                };
                envelope.process(&mut cell, &mut ctx)
            };
            match handler_result {
                Ok(()) => {
                    self.space.put_back(actor_id, cell);
                }
                Err(exit_status) => {
                    let mut ctx = ActorContext {
                        space: &mut self.space,
                        emitted: &mut emitted,
                        client: &self.client,
                    };
                    cell.finalize(&exit_status, &mut ctx);
                    if let ActorExitStatus::Failure(_) = &exit_status {
                        error!(actor = cell.instance_id(), status = %exit_status, "actor failed");
                    } else {
                        debug!(actor = cell.instance_id(), status = %exit_status, "actor exited");
                    }
                }
            }
            // Reversed so that the first emitted message is dispatched first.
            for emitted_envelope in emitted.drain(..).rev() {
                stack.push(emitted_envelope);
            }
        }
        processed
    }
}
