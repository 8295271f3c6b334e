use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<FranzConfig> = OnceCell::new();
pub fn global_config() -> &'static FranzConfig {
    GLOBAL_CONFIG.get().unwrap()
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ClientConfig {
    /// broker addresses handed to the log connector
    pub brokers: Vec<String>,
    /// consumer group used for offset management
    pub group: String,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct ConsumeConfig {
    pub topic: String,
    /// one consume loop is started per listed partition
    pub partitions: Vec<i32>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct DemoConfig {
    /// records seeded into every partition of the in-memory log
    pub messages_per_partition: u32,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FranzConfig {
    pub client: ClientConfig,
    pub consume: ConsumeConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

impl FranzConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<FranzConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let franz_config: FranzConfig = config.try_deserialize()?;
        franz_config.validate()?;

        Ok(franz_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.consume.topic.is_empty() {
            return Err(AppError::InvalidValue("consume.topic is empty".into()));
        }
        if self.client.group.is_empty() {
            return Err(AppError::InvalidValue("client.group is empty".into()));
        }
        if let Some(partition) = self.consume.partitions.iter().find(|p| **p < 0) {
            return Err(AppError::InvalidValue(format!(
                "consume.partitions: {}",
                partition
            )));
        }
        Ok(())
    }
}
