use sml2mqtt::{obis_utils::describe_pattern, metering_sml::reader::open_serial_port};
use sml2mqtt::{Config, FrameReader, MqttManager, MqttPublisher, ObisExtractor, SmlManager, SplitStorage};
use std::io::{Error, ErrorKind};
use log::{error, info};


#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("S2M_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = Config::load().map_err(|e| {
        error!("{}", e);
        Error::new(ErrorKind::InvalidInput, e.to_string())
    })?;
    let profile = config.meter_profile().map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))?;
    let max_sync_bytes = config.max_sync_bytes().map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))?;

    info!("Reading {} ({}) with {} byte telegrams", config.meter.name(), profile.model.name(), profile.total_length);
    for channel in &profile.channels {
        info!("  {} <- {}", channel.channel, describe_pattern(&channel.obis_pattern));
    }

    let mut sml = SmlManager::new(ObisExtractor::new(&profile.channels, config.meter.start_match));

    if config.mqtt.enabled {
        let (mut mqtt, tx) = MqttManager::new(&config.mqtt, &config.base_topic()).map_err(|e| {
            error!("{}", e);
            Error::new(ErrorKind::InvalidInput, e.to_string())
        })?;
        tokio::spawn(async move {
            mqtt.start_thread().await;
        });
        sml.add_sink(Box::new(MqttPublisher::new(tx, &config.meter.name())));
    }

    if config.storage.enabled {
        sml.add_sink(Box::new(SplitStorage::new(&config.storage, &profile.channels)));
    }

    loop {
        match open_serial_port(&config.serial) {
            Ok(port) => {
                info!("Opened {} at {} baud", config.serial.device, config.serial.baud_rate);
                let mut reader = FrameReader::new(port, profile.total_length, config.serial.read_timeout(), max_sync_bytes);
                sml.start_thread(&mut reader).await;
            }
            Err(e) => {
                error!("Unable to open {}: {}", config.serial.device, e);
            }
        }

        info!("Reopening {} in {:?}", config.serial.device, config.serial.reopen_delay());
        tokio::time::sleep(config.serial.reopen_delay()).await;
    }
}
