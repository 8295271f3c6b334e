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

use crate::logger::Logger;
use crate::stop::Stopper;
use crate::AppResult;

/// A service that writes records to a topic.
pub trait Producer: Logger + 'static {
    type Stop: Stopper;

    fn stopper(&self) -> &Self::Stop;

    /// Connects to the cluster at `addrs` and writes to `topic`. Resolves once
    /// it is done writing.
    fn produce(&self, addrs: &[String], topic: &str) -> impl Future<Output = AppResult<()>> + Send;
}
