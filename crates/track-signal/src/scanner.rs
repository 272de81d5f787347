//! Serial port enumeration

use serialport::{available_ports, SerialPortType};
use tracing::info;

use crate::error::SignalError;

/// A serial port that could carry a track signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., /dev/ttyUSB0, COM3)
    pub port: String,
    /// USB product string, if the adapter reports one
    pub product: Option<String>,
}

impl SerialPortInfo {
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        let product = match port_type {
            SerialPortType::UsbPort(usb) => usb.product.clone(),
            _ => None,
        };
        Self {
            port: name,
            product,
        }
    }
}

/// Lists serial ports, leaving out ones that never drive a track
pub struct PortScanner {
    skip_patterns: Vec<String>,
}

impl PortScanner {
    pub fn new() -> Self {
        Self {
            skip_patterns: vec!["Bluetooth".to_string(), "debug".to_string()],
        }
    }

    /// Include Bluetooth ports as well
    pub fn including_bluetooth() -> Self {
        Self {
            skip_patterns: vec!["debug".to_string()],
        }
    }

    pub fn enumerate_ports(&self) -> Result<Vec<SerialPortInfo>, SignalError> {
        let ports = available_ports()?;
        let result: Vec<_> = ports
            .into_iter()
            .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
            .filter(|p| !self.should_skip(&p.port))
            .collect();
        info!("Found {} serial port(s)", result.len());
        Ok(result)
    }

    fn should_skip(&self, port: &str) -> bool {
        self.skip_patterns.iter().any(|pattern| port.contains(pattern))
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    #[test]
    fn test_usb_product_is_kept() {
        let usb = SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x067b,
            pid: 0x2303,
            serial_number: None,
            manufacturer: Some("Prolific".to_string()),
            product: Some("USB-Serial Controller".to_string()),
        });
        let info = SerialPortInfo::from_serialport("/dev/ttyUSB0".to_string(), &usb);
        assert_eq!(info.product.as_deref(), Some("USB-Serial Controller"));
    }

    #[test]
    fn test_bluetooth_skipped_by_default() {
        let scanner = PortScanner::new();
        assert!(scanner.should_skip("/dev/cu.Bluetooth-Incoming-Port"));
        assert!(!scanner.should_skip("/dev/ttyUSB0"));
        assert!(!PortScanner::including_bluetooth().should_skip("/dev/cu.Bluetooth-Incoming-Port"));
    }
}
