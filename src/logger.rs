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

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::consume::Close;
use crate::{AppError, AppResult};

/// Structured context attached to an event, e.g. offset, topic and partition.
pub type EventData = BTreeMap<String, String>;

/// Sink for data about consumers and producers.
///
/// `gauge` emits a value that changes over time, such as how far a consumer
/// is behind the high water mark. `event` emits a named lifecycle event with
/// an optional error. Failures inside a sink are the sink's own business.
pub trait Logger: Send + Sync {
    fn event(&self, event: &str, err: Option<&AppError>, data: Option<&EventData>);
    fn gauge(&self, gauge: &str, value: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn event(&self, _event: &str, _err: Option<&AppError>, _data: Option<&EventData>) {}

    fn gauge(&self, _gauge: &str, _value: f64) {}
}

/// Forwards events and gauges to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn event(&self, event: &str, err: Option<&AppError>, data: Option<&EventData>) {
        match err {
            Some(err) => error!(event, error = %err, data = ?data, "franz event"),
            None => info!(event, data = ?data, "franz event"),
        }
    }

    fn gauge(&self, gauge: &str, value: f64) {
        debug!(gauge, value, "franz gauge");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event: String,
    /// rendered error, errors themselves are not comparable
    pub err: Option<String>,
    pub data: Option<EventData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedGauge {
    pub gauge: String,
    pub value: f64,
}

/// Keeps everything it is given in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<RecordedEvent>>,
    gauges: Mutex<Vec<RecordedGauge>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event.clone()).collect()
    }

    pub fn gauges(&self) -> Vec<RecordedGauge> {
        self.gauges.lock().clone()
    }
}

impl Logger for MemoryLogger {
    fn event(&self, event: &str, err: Option<&AppError>, data: Option<&EventData>) {
        self.events.lock().push(RecordedEvent {
            event: event.to_string(),
            err: err.map(|err| err.to_string()),
            data: data.cloned(),
        });
    }

    fn gauge(&self, gauge: &str, value: f64) {
        self.gauges.lock().push(RecordedGauge {
            gauge: gauge.to_string(),
            value,
        });
    }
}

/// Closes `closer`, reporting a failure as `event` on `logger`.
pub fn close_and_log<L, C>(logger: &L, closer: &mut C, event: &str) -> AppResult<()>
where
    L: Logger + ?Sized,
    C: Close + ?Sized,
{
    closer.close().inspect_err(|err| logger.event(event, Some(err), None))
}

/// Owns an acquired resource and closes it through [`close_and_log`] when
/// dropped. Guards declared one after another are therefore released in
/// reverse order of acquisition on every exit path.
pub(crate) struct Closing<'a, T: Close, L: Logger + ?Sized> {
    resource: T,
    logger: &'a L,
    event: &'static str,
}

impl<'a, T: Close, L: Logger + ?Sized> Closing<'a, T, L> {
    pub(crate) fn new(resource: T, logger: &'a L, event: &'static str) -> Self {
        Closing {
            resource,
            logger,
            event,
        }
    }
}

impl<T: Close, L: Logger + ?Sized> Deref for Closing<'_, T, L> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<T: Close, L: Logger + ?Sized> DerefMut for Closing<'_, T, L> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.resource
    }
}

impl<T: Close, L: Logger + ?Sized> Drop for Closing<'_, T, L> {
    fn drop(&mut self) {
        // the failure has been reported, nothing left to escalate
        let _ = close_and_log(self.logger, &mut self.resource, self.event);
    }
}
