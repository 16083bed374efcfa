//! Run/close state shared by both engines.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::ProxyError;

enum State {
    Idle,
    Running(JoinHandle<()>),
    Closed,
}

/// Owns the background loop of a proxy and the signal that stops it.
pub(crate) struct Lifecycle {
    state: Mutex<State>,
    shutdown_flag: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Lifecycle {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            state: Mutex::new(State::Idle),
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx,
            shutdown_timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    /// Flag the proxy as closing before `close` releases its frontend
    /// socket, so a concurrent `run` reports the close.
    pub fn mark_closing(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
    }

    /// Error for a `run` that found the frontend socket already taken.
    pub fn socket_taken(&self) -> ProxyError {
        if self.is_shutting_down() {
            ProxyError::ShutdownInProgress
        } else {
            ProxyError::AlreadyRunning
        }
    }

    /// Fail fast before the caller gives up its frontend socket.
    pub fn check_startable(&self) -> Result<(), ProxyError> {
        if self.is_shutting_down() {
            return Err(ProxyError::ShutdownInProgress);
        }
        match *lock(&self.state) {
            State::Idle => Ok(()),
            State::Running(_) => Err(ProxyError::AlreadyRunning),
            State::Closed => Err(ProxyError::ShutdownInProgress),
        }
    }

    /// Spawn the main loop. The loop gets its own shutdown receiver,
    /// subscribed before the task starts so no signal can be missed.
    pub fn start<F, Fut>(&self, task_fn: F) -> Result<(), ProxyError>
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = lock(&self.state);
        match *state {
            State::Idle => {
                let shutdown_rx = self.shutdown_tx.subscribe();
                *state = State::Running(tokio::spawn(task_fn(shutdown_rx)));
                Ok(())
            }
            State::Running(_) => Err(ProxyError::AlreadyRunning),
            State::Closed => Err(ProxyError::ShutdownInProgress),
        }
    }

    /// Signal the loop and wait for it, aborting it after the shutdown
    /// timeout. Closing twice is a no-op.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), State::Closed);

        self.shutdown_flag.store(true, Ordering::Release);
        // No receivers just means nothing is running.
        let _ = self.shutdown_tx.send(());

        let mut handle = match previous {
            State::Running(handle) => handle,
            State::Idle => {
                debug!("Proxy closed before it was started");
                return;
            }
            State::Closed => return,
        };

        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => debug!("Proxy loop stopped"),
            Ok(Err(e)) if e.is_cancelled() => debug!("Proxy loop was cancelled"),
            Ok(Err(e)) => error!("Proxy loop failed: {}", e),
            Err(_) => {
                warn!(
                    "Proxy loop did not stop within {:?}, aborting",
                    self.shutdown_timeout
                );
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
