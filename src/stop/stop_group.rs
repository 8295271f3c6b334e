// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::AppResult;

use super::latch::Latch;
use super::Stopper;

#[derive(Debug)]
struct GroupState {
    stop: Latch,
    /// members whose stop sequence has not finished yet
    pending: watch::Sender<usize>,
}

/// Releases one member slot in the join counter, also when the supervisor
/// task panics or is dropped by a shutting down runtime.
struct MemberSlot(Arc<GroupState>);

impl Drop for MemberSlot {
    fn drop(&mut self) {
        self.0.pending.send_modify(|pending| *pending -= 1);
    }
}

/// Behaves like a wait group that also shuts down everything attached to it.
///
/// Graceful shutdown sequence:
// 1. `stop` fires the group latch exactly once.
// 2. Every member supervisor wakes up, calls `stop` on its member and waits
//    for the member to report `stopped`.
// 3. The supervisor releases its slot in the join counter.
// 4. `wait` returns once the counter drops to zero.
///
/// A member added after `stop` runs the same sequence right away, and keeps
/// `wait` blocked until it is done.
#[derive(Debug, Clone)]
pub struct StopGroup {
    state: Arc<GroupState>,
}

impl StopGroup {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        StopGroup {
            state: Arc::new(GroupState {
                stop: Latch::new(),
                pending,
            }),
        }
    }

    /// Attaches a member. Must be called from within a tokio runtime.
    pub fn add<S: Stopper + 'static>(&self, stopper: S) {
        // counted before the supervisor is spawned, so a concurrent `wait`
        // cannot miss it
        self.state.pending.send_modify(|pending| *pending += 1);
        let slot = MemberSlot(self.state.clone());
        tokio::spawn(async move {
            slot.0.stop.wait().await;
            stopper.stop();
            stopper.wait_for_stopped().await;
            trace!("stop group member stopped");
            drop(slot);
        });
    }

    pub fn is_stopping(&self) -> bool {
        self.state.stop.is_fired()
    }

    /// Stops every member. Calling it again is a no-op.
    pub fn stop(&self) {
        if self.state.stop.fire() {
            debug!(members = self.len(), "stop group stopping");
        }
    }

    /// Resolves once `stop` has been called. Cancel safe.
    pub async fn wait_for_stop(&self) {
        self.state.stop.wait().await
    }

    /// Number of members that have not finished stopping.
    pub fn len(&self) -> usize {
        *self.state.pending.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the group on Ctrl-C, or SIGTERM on unix.
    ///
    /// The watcher exits quietly if the group is stopped some other way first.
    /// Must be called from within a tokio runtime.
    pub fn stop_on_signal(&self) -> AppResult<JoinHandle<()>> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        let group = self.clone();
        Ok(tokio::spawn(async move {
            #[cfg(unix)]
            let terminated = terminate.recv();
            #[cfg(not(unix))]
            let terminated = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = group.wait_for_stop() => {
                    trace!("stop group stopped before any signal");
                }
                res = signal::ctrl_c() => {
                    match res {
                        Ok(()) => {
                            info!("received ctrl-c, stopping group");
                            group.stop();
                        }
                        Err(err) => error!("unable to listen for ctrl-c: {}", err),
                    }
                }
                _ = terminated => {
                    info!("received terminate signal, stopping group");
                    group.stop();
                }
            }
        }))
    }

    /// Resolves once every member added so far has stopped.
    pub async fn wait(&self) {
        let mut pending = self.state.pending.subscribe();
        let _ = pending.wait_for(|pending| *pending == 0).await;
        debug!("stop group members all stopped");
    }
}

impl Default for StopGroup {
    fn default() -> Self {
        Self::new()
    }
}
