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

use std::future::Future;
use std::sync::Arc;

use tracing::trace;

use super::latch::Latch;

/// A unit of work that can be told to stop and can report that it has stopped.
///
/// `stop` and `stopped` are non-blocking notifications and must be safe to
/// call any number of times. `wait_for_stop` is what the worker selects on,
/// `wait_for_stopped` is what a supervisor joins on.
pub trait Stopper: Send + Sync {
    /// true once `stop` has been called
    fn is_stopping(&self) -> bool;

    /// true once `stopped` has been called
    fn is_stopped(&self) -> bool;

    /// Asks the work to stop.
    fn stop(&self);

    /// Reports that the work has stopped.
    fn stopped(&self);

    /// Resolves once `stop` has been called. Cancel safe.
    fn wait_for_stop(&self) -> impl Future<Output = ()> + Send;

    /// Resolves once `stopped` has been called. Cancel safe.
    fn wait_for_stopped(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Default)]
struct StopperState {
    stop: Latch,
    stopped: Latch,
}

/// The stock [`Stopper`]: two latches behind a shared handle.
///
/// Clones observe and fire the same latches, so a worker can keep one clone
/// while a [`StopGroup`](super::StopGroup) holds another.
#[derive(Debug, Clone, Default)]
pub struct ChannelStopper {
    state: Arc<StopperState>,
}

impl ChannelStopper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stopper for ChannelStopper {
    fn is_stopping(&self) -> bool {
        self.state.stop.is_fired()
    }

    fn is_stopped(&self) -> bool {
        self.state.stopped.is_fired()
    }

    fn stop(&self) {
        if self.state.stop.fire() {
            trace!("stopper received stop");
        }
    }

    fn stopped(&self) {
        if self.state.stopped.fire() {
            trace!("stopper reported stopped");
        }
    }

    fn wait_for_stop(&self) -> impl Future<Output = ()> + Send {
        self.state.stop.wait()
    }

    fn wait_for_stopped(&self) -> impl Future<Output = ()> + Send {
        self.state.stopped.wait()
    }
}

impl<T: Stopper> Stopper for Arc<T> {
    fn is_stopping(&self) -> bool {
        (**self).is_stopping()
    }

    fn is_stopped(&self) -> bool {
        (**self).is_stopped()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn stopped(&self) {
        (**self).stopped()
    }

    fn wait_for_stop(&self) -> impl Future<Output = ()> + Send {
        (**self).wait_for_stop()
    }

    fn wait_for_stopped(&self) -> impl Future<Output = ()> + Send {
        (**self).wait_for_stopped()
    }
}
