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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

/// An executor for blocking work submitted by the scheduler thread.
///
/// The default flavor wraps a rayon thread pool. The inline flavor runs the
/// job on the calling thread before `spawn` returns and exists for
/// deterministic tests.
#[derive(Clone)]
pub enum Pool {
    Rayon(Arc<rayon::ThreadPool>),
    Inline,
}

impl Pool {
    pub fn rayon(name: &'static str, num_threads: usize) -> Pool {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .thread_name(move |thread_id| format!("rastermill-{name}-{thread_id}"))
            .num_threads(num_threads)
            .panic_handler(move |_my_panic| {
                error!(pool = name, "task running in a rastermill worker pool panicked");
            })
            .build()
            .expect("failed to spawn worker pool");
        Pool::Rayon(Arc::new(thread_pool))
    }

    pub fn inline() -> Pool {
        Pool::Inline
    }

    pub fn spawn<F>(&self, job: F)
    where F: FnOnce() + Send + 'static {
        match self {
            Pool::Rayon(thread_pool) => thread_pool.spawn(job),
            Pool::Inline => job(),
        }
    }
}

/// Best-effort cancellation flag attached to a submitted job.
///
/// A job observes the token before running and skips itself when cancelled;
/// its completion message is also dropped when the token was cancelled while
/// the job ran. Cancellation is a hint, never a guarantee.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{CancelToken, Pool};

    #[test]
    fn test_inline_pool_runs_before_returning() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        Pool::inline().spawn(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rayon_pool_runs_jobs() {
        let pool = Pool::rayon("test", 2);
        let (tx, rx) = flume::bounded(1);
        pool.spawn(move || {
            tx.send(41 + 1).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.clone().cancel();
        assert!(token.is_cancelled());
    }
}
