use std::{
    process,
    sync::{Arc, OnceLock},
};

use rsp_mqtt_adapter::{
    config::AppConfig,
    core::{
        driver::Driver,
        host::{AsyncValues, ChannelSink, InMemoryRegistry},
    },
    logger::LoggerManager,
    print_error,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Readings buffered between the incoming listener and the consumer.
const READING_BUFFER: usize = 256;

pub fn config() -> &'static AppConfig {
    CONFIG.get_or_init(|| {
        AppConfig::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

/// Logs every reading pushed by the incoming listener until the sink closes.
async fn consume_readings(mut readings: mpsc::Receiver<AsyncValues>) {
    while let Some(values) = readings.recv().await {
        for reading in &values.readings {
            info!(
                device = %values.device_name,
                resource = %reading.resource_name,
                origin_ms = reading.origin_ms,
                value_len = reading.value.len(),
                "Reading received"
            );
            debug!(value = %reading.value, "Reading value");
        }
    }
    debug!("Reading consumer finished");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting rsp-mqtt-adapter version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);

    let driver_config = cfg.driver_config().unwrap_or_else(|e| {
        error!("Invalid protocol configuration: {}", e);
        process::exit(1);
    });
    info!(
        controller = %driver_config.controller_name,
        broker = %driver_config.mqtt.broker_uri(),
        client_id = %driver_config.mqtt.client_id,
        "Protocol configuration loaded"
    );

    let (sink, readings) = ChannelSink::new(READING_BUFFER);
    let consumer = tokio::spawn(consume_readings(readings));

    let mut driver = Driver::new(driver_config, Arc::new(InMemoryRegistry::new()));
    if let Err(e) = driver.initialize(Arc::new(sink)).await {
        error!("Failed to initialize driver: {}", e);
        if let Err(e) = driver.stop(true).await {
            error!("Driver shutdown failed: {}", e);
        }
        process::exit(1);
    }
    info!("Driver ready, waiting for controller data");

    let failure = tokio::select! {
        fatal = driver.fatal() => Some(fatal),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
            None
        }
    };

    if let Some(fatal) = failure {
        match fatal {
            Some(e) => error!("MQTT session failed: {}", e),
            None => error!("MQTT session stopped unexpectedly"),
        }
        if let Err(e) = driver.stop(true).await {
            error!("Driver shutdown failed: {}", e);
        }
        process::exit(1);
    }

    if let Err(e) = driver.stop(false).await {
        error!("Driver shutdown failed: {}", e);
        process::exit(1);
    }
    if let Err(e) = consumer.await {
        error!("Reading consumer failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
