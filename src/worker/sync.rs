//! Coordination between a worker's job runner and its connection watcher.
//!
//! The runner thread executes jobs. The watcher (the main thread) blocks
//! reading the active client connection so that a client that disconnects
//! early is noticed while the job is still running. Both meet twice per job:
//!
//! ```text
//! runner:  begin_job ── begin ── run ... ── end_job ── end
//! watcher:              begin ── read until EOF ───── end
//! ```
//!
//! `end_job` clears the active flag *before* shutting down the read side of
//! the connection. The watcher's read then returns EOF, and because the job is
//! no longer active the EOF is not mistaken for a client abort.

use crate::component::CancelToken;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reusable meeting point for exactly two threads that can be torn down.
///
/// Once aborted every current and future `wait` returns `false` immediately.
#[derive(Debug, Default)]
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct RendezvousState {
    waiting: usize,
    generation: u64,
    aborted: bool,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the other party arrives. Returns `false` if aborted instead.
    pub fn wait(&self) -> bool {
        let mut state = lock(&self.state);
        if state.aborted {
            return false;
        }
        let generation = state.generation;
        state.waiting += 1;
        if state.waiting == 2 {
            state.waiting = 0;
            state.generation += 1;
            self.cond.notify_all();
            return true;
        }
        while state.generation == generation && !state.aborted {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.generation != generation {
            true
        } else {
            state.waiting -= 1;
            false
        }
    }

    /// Release all waiters and make every later `wait` fail.
    pub fn abort(&self) {
        lock(&self.state).aborted = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        lock(&self.state).aborted
    }
}

#[derive(Debug, Default)]
struct JobState {
    active: bool,
    client: Option<Arc<UnixStream>>,
    cancel: CancelToken,
}

/// Shared state of the two worker threads.
#[derive(Debug, Default)]
pub struct JobSync {
    state: Mutex<JobState>,
    begin: Rendezvous,
    end: Rendezvous,
}

/// The runner's hold on an active job. Dropping it ends the job.
pub struct JobGuard<'a> {
    sync: &'a JobSync,
    cancel: CancelToken,
}

impl JobGuard<'_> {
    /// Token the watcher fires if the client disconnects.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.sync.end_job();
    }
}

/// What the watcher saw during one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The job ended normally.
    Completed,
    /// The client went away while the job was active; its token was cancelled.
    ClientAborted,
    /// The sync was closed; the watcher should exit.
    Closed,
}

impl JobSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner: publish `client` as the active job and wait for the watcher.
    ///
    /// Returns `None` if the sync was closed, in which case no job is active.
    pub fn begin_job(&self, client: Arc<UnixStream>) -> Option<JobGuard<'_>> {
        let cancel = CancelToken::new();
        {
            let mut state = lock(&self.state);
            state.active = true;
            state.client = Some(client);
            state.cancel = cancel.clone();
        }
        if !self.begin.wait() {
            let mut state = lock(&self.state);
            state.active = false;
            state.client = None;
            return None;
        }
        Some(JobGuard { sync: self, cancel })
    }

    fn end_job(&self) {
        {
            let mut state = lock(&self.state);
            state.active = false;
            if let Some(client) = &state.client {
                // Wakes the watcher's blocking read.
                let _ = client.shutdown(Shutdown::Read);
            }
        }
        self.end.wait();
        lock(&self.state).client = None;
    }

    /// Watcher: wait for the next job and block until it ends or the client leaves.
    pub fn watch_next_job(&self) -> WatchOutcome {
        if !self.begin.wait() {
            return WatchOutcome::Closed;
        }
        let client = lock(&self.state).client.clone();
        if let Some(client) = client {
            drain_until_closed(&client);
        }

        let aborted = {
            let state = lock(&self.state);
            if state.active {
                state.cancel.cancel();
                true
            } else {
                false
            }
        };
        if aborted {
            tracing::warn!("Client closed connection before the job completed. Aborting job.");
        }

        if !self.end.wait() {
            return WatchOutcome::Closed;
        }
        if aborted {
            WatchOutcome::ClientAborted
        } else {
            WatchOutcome::Completed
        }
    }

    /// Whether a job is currently running.
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    /// Tear down both meeting points so neither thread blocks again.
    pub fn close(&self) {
        self.begin.abort();
        self.end.abort();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.begin.is_aborted()
    }
}

/// Read and discard until EOF or error. Clients send nothing after their
/// request, so returning means the connection is closed or shut down.
fn drain_until_closed(mut client: &UnixStream) {
    let mut buf = [0u8; 256];
    loop {
        match client.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_rendezvous_meets() {
        let point = Arc::new(Rendezvous::new());
        let other = Arc::clone(&point);
        let handle = thread::spawn(move || (other.wait(), other.wait()));
        assert!(point.wait());
        assert!(point.wait());
        assert_eq!(handle.join().unwrap(), (true, true));
    }

    #[test]
    fn test_rendezvous_abort_releases_waiter() {
        let point = Arc::new(Rendezvous::new());
        let other = Arc::clone(&point);
        let handle = thread::spawn(move || other.wait());
        thread::sleep(Duration::from_millis(50));
        point.abort();
        assert!(!handle.join().unwrap());
        assert!(!point.wait());
        assert!(point.is_aborted());
    }

    fn spawn_watcher(sync: &Arc<JobSync>) -> thread::JoinHandle<Vec<WatchOutcome>> {
        let sync = Arc::clone(sync);
        thread::spawn(move || {
            let mut outcomes = Vec::new();
            loop {
                let outcome = sync.watch_next_job();
                outcomes.push(outcome);
                if outcome == WatchOutcome::Closed {
                    return outcomes;
                }
            }
        })
    }

    #[test]
    fn test_normal_completion_is_not_an_abort() {
        let sync = Arc::new(JobSync::new());
        let watcher = spawn_watcher(&sync);

        for _ in 0..3 {
            let (client, _peer) = UnixStream::pair().unwrap();
            let guard = sync.begin_job(Arc::new(client)).unwrap();
            assert!(sync.is_active());
            thread::sleep(Duration::from_millis(10));
            assert!(!guard.cancel_token().is_cancelled());
            drop(guard);
            assert!(!sync.is_active());
        }

        sync.close();
        let outcomes = watcher.join().unwrap();
        assert_eq!(
            outcomes,
            vec![
                WatchOutcome::Completed,
                WatchOutcome::Completed,
                WatchOutcome::Completed,
                WatchOutcome::Closed
            ]
        );
    }

    #[test]
    fn test_client_disconnect_cancels_job() {
        let sync = Arc::new(JobSync::new());
        let watcher = spawn_watcher(&sync);

        let (client, peer) = UnixStream::pair().unwrap();
        let guard = sync.begin_job(Arc::new(client)).unwrap();
        drop(peer);

        let token = guard.cancel_token().clone();
        for _ in 0..200 {
            if token.is_cancelled() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(token.is_cancelled());
        drop(guard);

        // The next job starts with a fresh token.
        let (client, _peer) = UnixStream::pair().unwrap();
        let guard = sync.begin_job(Arc::new(client)).unwrap();
        assert!(!guard.cancel_token().is_cancelled());
        drop(guard);

        sync.close();
        assert_eq!(
            watcher.join().unwrap(),
            vec![
                WatchOutcome::ClientAborted,
                WatchOutcome::Completed,
                WatchOutcome::Closed
            ]
        );
    }

    #[test]
    fn test_begin_after_close() {
        let sync = JobSync::new();
        sync.close();
        let (client, _peer) = UnixStream::pair().unwrap();
        assert!(sync.begin_job(Arc::new(client)).is_none());
        assert!(!sync.is_active());
        assert!(sync.is_closed());
        assert_eq!(sync.watch_next_job(), WatchOutcome::Closed);
    }
}
