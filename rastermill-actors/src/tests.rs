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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rastermill_common::{CancelToken, Pool};

use crate::{
    Actor, ActorContext, ActorExitStatus, EventLoop, EventLoopConfig, Handler, Mailbox, Recorder,
    SendError,
};

fn test_loop() -> EventLoop {
    EventLoop::new(EventLoopConfig::default())
}

#[derive(Debug)]
struct Ping;

#[derive(Default)]
struct PingReceiver {
    ping_count: usize,
}

impl Actor for PingReceiver {
    type ObservableState = usize;

    fn observable_state(&self) -> usize {
        self.ping_count
    }
}

impl Handler<Ping> for PingReceiver {
    fn handle(&mut self, _msg: Ping, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.ping_count += 1;
        Ok(())
    }
}

#[test]
fn test_send_and_observe() {
    let mut event_loop = test_loop();
    let client = event_loop.client();
    let mailbox = event_loop.spawn_actor(PingReceiver::default());
    client.send_message(&mailbox, Ping).unwrap();
    client.send_message(&mailbox, Ping).unwrap();
    event_loop.run_until_idle();
    let observation_rx = client.observe(&mailbox);
    event_loop.run_until_idle();
    assert_eq!(observation_rx.try_recv().unwrap(), 2);
}

#[derive(Debug)]
struct Visit(&'static str);

struct Tracer {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    next: Vec<Mailbox<Tracer>>,
}

impl Actor for Tracer {
    type ObservableState = ();

    fn observable_state(&self) {}
}

impl Handler<Visit> for Tracer {
    fn handle(&mut self, msg: Visit, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.log.lock().unwrap().push(msg.0);
        for next_mailbox in &self.next {
            ctx.send_message(next_mailbox, Visit(self.tag));
        }
        Ok(())
    }
}

#[test]
fn test_depth_first_delivery() {
    // root emits to b then c; b emits to c in turn. Depth-first delivery
    // requires b's emission to be observed before root's second emission.
    let mut event_loop = test_loop();
    let client = event_loop.client();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();

    let c_mailbox = event_loop.spawn_actor(Tracer {
        tag: "c",
        log: log.clone(),
        next: Vec::new(),
    });
    let b_mailbox = event_loop.spawn_actor(Tracer {
        tag: "b",
        log: log.clone(),
        next: vec![c_mailbox.clone()],
    });
    let root_mailbox = event_loop.spawn_actor(Tracer {
        tag: "root",
        log: log.clone(),
        next: vec![b_mailbox, c_mailbox],
    });

    client.send_message(&root_mailbox, Visit("start")).unwrap();
    event_loop.run_until_idle();
    assert_eq!(
        log.lock().unwrap().as_slice(),
        // "start" lands on root, root visits b and c; the trace entries are
        // tagged with the *sender*.
        &["start", "root", "b", "root"]
    );
}

#[derive(Debug)]
struct Stop;

struct Stoppable {
    recorder_mailbox: Mailbox<Recorder<&'static str>>,
}

impl Actor for Stoppable {
    type ObservableState = ();

    fn observable_state(&self) {}

    fn finalize(&mut self, _exit_status: &ActorExitStatus, ctx: &mut ActorContext) {
        ctx.send_message(&self.recorder_mailbox, "finalized");
    }
}

impl Handler<Stop> for Stoppable {
    fn handle(&mut self, _msg: Stop, _ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        Err(ActorExitStatus::Success)
    }
}

#[test]
fn test_actor_exit_runs_finalize_and_drops_later_messages() {
    let mut event_loop = test_loop();
    let client = event_loop.client();
    let recorder = Recorder::<&'static str>::default();
    let records = recorder.handle();
    let recorder_mailbox = event_loop.spawn_actor(recorder);
    let stoppable_mailbox = event_loop.spawn_actor(Stoppable { recorder_mailbox });
    client.send_message(&stoppable_mailbox, Stop).unwrap();
    client.send_message(&stoppable_mailbox, Stop).unwrap();
    event_loop.run_until_idle();
    // The second Stop hit an exited actor and was dropped.
    assert_eq!(records.drain(), vec!["finalized"]);
    assert_eq!(event_loop.num_actors(), 1);
}

#[derive(Default)]
struct TickCounter {
    tick_count: usize,
    recorder_mailbox: Option<Mailbox<Recorder<usize>>>,
}

impl Actor for TickCounter {
    type ObservableState = usize;

    fn observable_state(&self) -> usize {
        self.tick_count
    }

    fn wants_tick(&self) -> bool {
        true
    }

    fn on_tick(&mut self, ctx: &mut ActorContext) -> Result<(), ActorExitStatus> {
        self.tick_count += 1;
        if self.tick_count <= 2 {
            if let Some(recorder_mailbox) = &self.recorder_mailbox {
                ctx.send_message(recorder_mailbox, self.tick_count);
            }
        }
        Ok(())
    }
}

#[test]
fn test_ticks_run_until_quiet() {
    let mut event_loop = test_loop();
    let recorder = Recorder::<usize>::default();
    let records = recorder.handle();
    let recorder_mailbox = event_loop.spawn_actor(recorder);
    event_loop.spawn_actor(TickCounter {
        tick_count: 0,
        recorder_mailbox: Some(recorder_mailbox),
    });
    // Two ticks emit something, the third one is quiet and ends the run.
    event_loop.run_until_idle();
    assert_eq!(records.drain(), vec![1, 2]);
}

#[test]
fn test_submit_job_inline_pool_completes_before_next_tick() {
    let mut event_loop = test_loop();
    let client = event_loop.client();
    let recorder = Recorder::<u64>::default();
    let records = recorder.handle();
    let recorder_mailbox = event_loop.spawn_actor(recorder);

    let pool = Pool::inline();
    client.submit_job(&pool, &recorder_mailbox, &CancelToken::new(), || 41 + 1);
    event_loop.run_until_idle();
    assert_eq!(records.drain(), vec![42]);

    let cancel = CancelToken::new();
    cancel.cancel();
    client.submit_job(&pool, &recorder_mailbox, &cancel, || 43);
    event_loop.run_until_idle();
    assert!(records.is_empty());
}

#[test]
fn test_loop_thread_stop() {
    let mut event_loop = test_loop();
    let client = event_loop.client();
    let mailbox = event_loop.spawn_actor(PingReceiver::default());
    let join_handle = event_loop.spawn_thread();
    client.stop();
    join_handle.join().unwrap();
    assert!(!client.is_alive());
    // The loop and its inject queue are gone.
    assert_eq!(
        client.send_message(&mailbox, Ping),
        Err(SendError::Disconnected)
    );
}

#[test]
fn test_observe_blocking_on_thread() {
    let mut event_loop = test_loop();
    let client = event_loop.client();
    let mailbox = event_loop.spawn_actor(PingReceiver::default());
    let join_handle = event_loop.spawn_thread();
    client.send_message(&mailbox, Ping).unwrap();
    client.send_message(&mailbox, Ping).unwrap();
    loop {
        let ping_count = client
            .observe_blocking(&mailbox, Duration::from_secs(1))
            .unwrap();
        if ping_count == 2 {
            break;
        }
    }
    client.stop();
    join_handle.join().unwrap();
}
