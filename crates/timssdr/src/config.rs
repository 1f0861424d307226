//! Streaming engine configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// USB packet size of the bulk endpoints; TX transfers are padded to it
pub const USB_PACKET_SIZE: usize = 512;

/// Sizing and timing of the streaming engine
///
/// The defaults match the board firmware: four 256 KiB transfers in flight,
/// a 32 KiB flush transfer, and a 500 ms event-polling step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of transfers kept in flight while streaming
    pub transfer_count: usize,
    /// Size of each transfer buffer in bytes (multiple of 512)
    pub transfer_buffer_size: usize,
    /// Size of the flush transfer buffer in bytes (multiple of 512)
    pub flush_buffer_size: usize,
    /// Upper bound of one blocking event-processing step
    pub event_timeout_ms: u64,
    /// USB configuration selected on open
    pub usb_configuration: u8,
    /// Interface claimed on open
    pub interface: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_count: 4,
            transfer_buffer_size: 262_144,
            flush_buffer_size: 32_768,
            event_timeout_ms: 500,
            usb_configuration: 1,
            interface: 0,
        }
    }
}

impl EngineConfig {
    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    /// Validate configuration values
    ///
    /// Buffer sizes must be whole USB packets so that padding a TX transfer
    /// up to the next packet boundary can never run past the buffer.
    pub fn validate(&self) -> Result<()> {
        if self.transfer_count == 0 || self.event_timeout_ms == 0 {
            return Err(Error::InvalidParam);
        }

        for size in [self.transfer_buffer_size, self.flush_buffer_size] {
            if size == 0 || size % USB_PACKET_SIZE != 0 {
                return Err(Error::InvalidParam);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transfer_count, 4);
        assert_eq!(config.transfer_buffer_size, 256 * 1024);
        assert_eq!(config.event_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_unaligned_buffer() {
        let config = EngineConfig {
            transfer_buffer_size: 1000,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidParam));
    }

    #[test]
    fn test_rejects_zero_transfers() {
        let config = EngineConfig {
            transfer_count: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidParam));
    }
}
