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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// a consume loop could not get past initialization
    #[error("error {stage}: {source}")]
    Setup {
        stage: &'static str,
        #[source]
        source: Box<AppError>,
    },

    /// returned by a consumer callback for a single record
    #[error("consume error: {0}")]
    ConsumeError(String),

    /// log client errors
    #[error("client closed: {0}")]
    ClientClosed(String),

    #[error("unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(i64),

    #[error("close error: {0}")]
    CloseError(String),
}

impl AppError {
    /// Wraps `source` with the initialization stage that produced it.
    pub fn setup(stage: &'static str, source: AppError) -> Self {
        AppError::Setup {
            stage,
            source: Box::new(source),
        }
    }

    /// The stage name of a setup failure, if this is one.
    pub fn setup_stage(&self) -> Option<&'static str> {
        match self {
            AppError::Setup { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
