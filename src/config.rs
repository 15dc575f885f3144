use crate::error::{DmxError, Result};
use log::debug;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

const TS_PACKET_SIZE: usize = 188;

/// Sizing and policy for one demux device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Number of filter slots
    pub filter_count: usize,
    /// Ring size a filter starts with
    pub filter_buffer_size: usize,
    /// Ring size of the DVR output and raw-input paths
    pub dvr_buffer_size: usize,
    /// Slots in each event queue
    pub event_queue_slots: usize,
    /// Slots in the raw-input command ring
    pub dvr_command_slots: usize,
    /// Decoder buffer size a filter starts with
    pub decoder_buffer_size: usize,
    /// Shortest allowed repetition of a TS insertion
    pub min_insertion_interval: Duration,
    /// Smallest recording chunk a filter may request
    pub min_rec_chunk_size: usize,
    /// Drop buffered data on overflow instead of latching an error, when the
    /// engine allows it
    pub auto_flush: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            filter_count: 32,
            filter_buffer_size: 8192,
            dvr_buffer_size: 10 * TS_PACKET_SIZE * 1024,
            event_queue_slots: 500,
            dvr_command_slots: 500,
            decoder_buffer_size: 32768,
            min_insertion_interval: Duration::from_millis(25),
            min_rec_chunk_size: 100 * TS_PACKET_SIZE,
            auto_flush: true,
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by `DMXCORE_*` environment variables and then by
    /// `./dmxcore.toml` or `./config.toml`.
    ///
    /// # Errors
    ///
    /// Fails if a value does not parse or the result does not validate.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in env::vars() {
            if let Some(key) = key.strip_prefix("DMXCORE_") {
                config.apply(&key.to_ascii_lowercase(), &value)?;
            }
        }

        let config_paths = ["./dmxcore.toml", "./config.toml"];
        for path in &config_paths {
            if Path::new(path).exists() {
                config.apply_file(path)?;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the `key = value` lines of one file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::default();
        config.apply_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut content = String::new();
        File::open(path.as_ref())?.read_to_string(&mut content)?;
        debug!("loading device config from {}", path.as_ref().display());

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                self.apply(key.trim(), value)?;
            }
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "filter_count" => self.filter_count = value.parse()?,
            "filter_buffer_size" => self.filter_buffer_size = value.parse()?,
            "dvr_buffer_size" => self.dvr_buffer_size = value.parse()?,
            "event_queue_slots" => self.event_queue_slots = value.parse()?,
            "dvr_command_slots" => self.dvr_command_slots = value.parse()?,
            "decoder_buffer_size" => self.decoder_buffer_size = value.parse()?,
            "min_insertion_interval_ms" => {
                self.min_insertion_interval = Duration::from_millis(value.parse()?)
            }
            "min_rec_chunk_size" => self.min_rec_chunk_size = value.parse()?,
            "auto_flush" => {
                self.auto_flush = match value {
                    "true" | "1" | "yes" => true,
                    "false" | "0" | "no" => false,
                    other => {
                        return Err(DmxError::Config(format!("auto_flush: bad value {other}")))
                    }
                }
            }
            _ => debug!("ignoring unknown config key {}", key),
        }
        Ok(())
    }

    /// Rejects zero sizes and queues too small to hold an event.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("filter_count", self.filter_count),
            ("filter_buffer_size", self.filter_buffer_size),
            ("dvr_buffer_size", self.dvr_buffer_size),
            ("decoder_buffer_size", self.decoder_buffer_size),
            ("min_rec_chunk_size", self.min_rec_chunk_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(DmxError::Config(format!("{name} must be non-zero")));
        }
        if self.event_queue_slots < 2 || self.dvr_command_slots < 2 {
            return Err(DmxError::Config(
                "queues need at least two slots".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_filter_count(mut self, count: usize) -> Self {
        self.filter_count = count;
        self
    }

    pub fn with_filter_buffer_size(mut self, size: usize) -> Self {
        self.filter_buffer_size = size;
        self
    }

    pub fn with_dvr_buffer_size(mut self, size: usize) -> Self {
        self.dvr_buffer_size = size;
        self
    }

    pub fn with_event_queue_slots(mut self, slots: usize) -> Self {
        self.event_queue_slots = slots;
        self
    }

    pub fn with_dvr_command_slots(mut self, slots: usize) -> Self {
        self.dvr_command_slots = slots;
        self
    }

    pub fn with_min_rec_chunk_size(mut self, size: usize) -> Self {
        self.min_rec_chunk_size = size;
        self
    }

    pub fn with_min_insertion_interval(mut self, interval: Duration) -> Self {
        self.min_insertion_interval = interval;
        self
    }

    pub fn with_auto_flush(mut self, auto_flush: bool) -> Self {
        self.auto_flush = auto_flush;
        self
    }
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# dmxcore device configuration
# Every key is optional; missing keys keep their defaults.

filter_count = 32
filter_buffer_size = 8192
dvr_buffer_size = 1925120
event_queue_slots = 500
dvr_command_slots = 500
decoder_buffer_size = 32768
min_insertion_interval_ms = 25
min_rec_chunk_size = 18800
auto_flush = true
"#;
        std::fs::write(path, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_validate() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dvr_buffer_size, 10 * 188 * 1024);
        assert_eq!(config.min_rec_chunk_size, 100 * 188);
    }

    #[test]
    fn test_template_round_trips_to_defaults() {
        let dir = env::temp_dir().join(format!("dmxcore-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dmxcore.toml");
        let _ = std::fs::remove_file(&path);

        create_default_config_template(&path).unwrap();
        let config = DeviceConfig::load_from(&path).unwrap();
        assert_eq!(config, DeviceConfig::default());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = DeviceConfig::default();
        config.apply("filter_buffer_size", "4096").unwrap();
        config.apply("auto_flush", "no").unwrap();
        config.apply("min_insertion_interval_ms", "40").unwrap();
        assert_eq!(config.filter_buffer_size, 4096);
        assert!(!config.auto_flush);
        assert_eq!(config.min_insertion_interval, Duration::from_millis(40));

        assert!(matches!(
            config.apply("filter_count", "many"),
            Err(DmxError::ParseInt(_))
        ));
        assert!(matches!(
            config.apply("auto_flush", "maybe"),
            Err(DmxError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = DeviceConfig::default().with_filter_buffer_size(0);
        assert!(matches!(config.validate(), Err(DmxError::Config(_))));
        let config = DeviceConfig::default().with_event_queue_slots(1);
        assert!(config.validate().is_err());
    }
}
