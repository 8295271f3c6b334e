use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use franz::consume::memory::MemoryLog;
use franz::consume::PartitionCursor;
use franz::message::OFFSET_OLDEST;
use franz::{
    consume, global_config, setup_local_tracing, setup_tracing, AppError, AppResult, ChannelStopper,
    ConsumerMessage, Consumer, EventData, FranzConfig, Logger, Producer, StopGroup, Stopper,
    TracingLogger, GLOBAL_CONFIG,
};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace), RUST_LOG takes precedence
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// also export spans over OTLP and write hourly log files under ./logs
    #[arg(long)]
    pub otel: bool,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Logs every record and marks it on the cursor.
struct LoggingConsumer {
    stopper: ChannelStopper,
    logger: TracingLogger,
}

impl Logger for LoggingConsumer {
    fn event(&self, event: &str, err: Option<&AppError>, data: Option<&EventData>) {
        self.logger.event(event, err, data)
    }

    fn gauge(&self, gauge: &str, value: f64) {
        self.logger.gauge(gauge, value)
    }
}

impl Consumer for LoggingConsumer {
    type Stop = ChannelStopper;

    fn stopper(&self) -> &ChannelStopper {
        &self.stopper
    }

    async fn consume<P: PartitionCursor>(
        &self,
        msg: &ConsumerMessage,
        cursor: &P,
    ) -> AppResult<()> {
        info!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            value = %String::from_utf8_lossy(&msg.value),
            "consumed"
        );
        cursor.mark_offset(msg.offset, "");
        Ok(())
    }

    async fn start_offset<P: PartitionCursor>(&self, cursor: &P) -> AppResult<i64> {
        // resume after the last marked record, or from the beginning
        let (offset, _metadata) = cursor.next_offset();
        if offset < 0 {
            Ok(OFFSET_OLDEST)
        } else {
            Ok(offset + 1)
        }
    }
}

/// Seeds the in-memory log with the configured number of records.
struct SeedProducer {
    stopper: ChannelStopper,
    logger: TracingLogger,
    log: MemoryLog,
    partitions: Vec<i32>,
    messages_per_partition: u32,
}

impl Logger for SeedProducer {
    fn event(&self, event: &str, err: Option<&AppError>, data: Option<&EventData>) {
        self.logger.event(event, err, data)
    }

    fn gauge(&self, gauge: &str, value: f64) {
        self.logger.gauge(gauge, value)
    }
}

impl Producer for SeedProducer {
    type Stop = ChannelStopper;

    fn stopper(&self) -> &ChannelStopper {
        &self.stopper
    }

    async fn produce(&self, _addrs: &[String], topic: &str) -> AppResult<()> {
        let result = self.write_all(topic);
        self.stopper.stopped();
        result
    }
}

impl SeedProducer {
    fn write_all(&self, topic: &str) -> AppResult<()> {
        for i in 0..self.messages_per_partition {
            for &partition in &self.partitions {
                if self.stopper.is_stopping() {
                    return Ok(());
                }
                self.log
                    .append(topic, partition, None, format!("message {}", i))?;
            }
        }
        self.event("produced", None, None);
        Ok(())
    }
}

async fn run() -> AppResult<()> {
    let config = global_config();
    let log = MemoryLog::new();
    let partition_count = config.consume.partitions.iter().max().map_or(0, |p| p + 1);
    log.create_topic(&config.consume.topic, partition_count);

    let group = StopGroup::new();
    group.stop_on_signal()?;

    let producer = SeedProducer {
        stopper: ChannelStopper::new(),
        logger: TracingLogger,
        log: log.clone(),
        partitions: config.consume.partitions.clone(),
        messages_per_partition: config.demo.messages_per_partition,
    };
    group.add(producer.stopper().clone());
    producer
        .produce(&config.client.brokers, &config.consume.topic)
        .await?;

    let mut consumers = Vec::with_capacity(config.consume.partitions.len());
    for &partition in &config.consume.partitions {
        let consumer = Arc::new(LoggingConsumer {
            stopper: ChannelStopper::new(),
            logger: TracingLogger,
        });
        group.add(consumer.stopper().clone());
        let log = log.clone();
        consumers.push(tokio::spawn(async move {
            consume(
                consumer,
                &log,
                &config.client.brokers,
                &config.client.group,
                &config.consume.topic,
                partition,
            )
            .await
        }));
    }
    info!(
        "consuming {} partitions of {}, ctrl-c to stop",
        consumers.len(),
        config.consume.topic
    );

    group.wait().await;
    for consumer in consumers {
        match consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("consume loop failed: {}", err),
            Err(err) => error!("consume loop panicked: {:?}", err),
        }
    }
    info!("all consumers stopped");
    Ok(())
}

fn main() -> AppResult<()> {
    // pick up RUST_LOG and friends from .env
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let franz_config = FranzConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", franz_config);
        return Ok(());
    }
    GLOBAL_CONFIG
        .set(franz_config)
        .map_err(|_| AppError::IllegalStateError("config already set".to_string()))?;

    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;

    let _otel_guard = if commandline.otel {
        Some(rt.block_on(setup_tracing())?)
    } else {
        setup_local_tracing()?;
        None
    };

    rt.block_on(run())
}
