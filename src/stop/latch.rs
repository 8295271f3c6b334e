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

use parking_lot::Mutex;
use tokio::sync::watch;

/// A one-shot flag that any number of tasks can wait on.
///
/// Unlike a `broadcast` channel, a waiter that subscribes after the latch
/// fired still observes it.
#[derive(Debug)]
pub(crate) struct Latch {
    fired: Mutex<bool>,
    notify: watch::Sender<bool>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Latch {
            fired: Mutex::new(false),
            notify,
        }
    }

    /// Fires the latch. Returns false if it had already been fired.
    pub(crate) fn fire(&self) -> bool {
        let mut fired = self.fired.lock();
        if *fired {
            return false;
        }
        *fired = true;
        // send_replace also stores the value when nobody is subscribed yet
        self.notify.send_replace(true);
        true
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.fired.lock()
    }

    /// Resolves once the latch has fired. Cancel safe.
    pub(crate) async fn wait(&self) {
        let mut rx = self.notify.subscribe();
        // the sender lives in self, so this only returns once fired
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
