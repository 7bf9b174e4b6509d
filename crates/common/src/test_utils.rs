//! Test utilities for usbipd-rs
//!
//! Provides mock devices and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_device;
//!
//! let device = create_mock_device(1, 2, 0x1234, 0x5678);
//! assert_eq!(device.bus_id, "1-2");
//! assert_eq!(device.vendor_id, 0x1234);
//! ```

use protocol::{Device, DeviceSpeed, InterfaceInfo};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock Device for testing
///
/// The bus id is `"{bus_num}-{dev_num}"`, which keeps ids unique as long as
/// the (bus, device) pairs are.
pub fn create_mock_device(bus_num: u32, dev_num: u32, vendor_id: u16, product_id: u16) -> Device {
    Device {
        path: format!("/sys/bus/usb/devices/{}-{}", bus_num, dev_num),
        bus_id: format!("{}-{}", bus_num, dev_num),
        bus_num,
        dev_num,
        speed: DeviceSpeed::High,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![InterfaceInfo {
            class: 0xFF,
            subclass: 0x00,
            protocol: 0x00,
        }],
        manufacturer: Some(format!("Test Manufacturer {}", dev_num)),
        product: Some(format!("Test Product {}", dev_num)),
        serial_number: Some(format!("SN{:06}", dev_num)),
    }
}

/// Create a list of mock devices on bus 1, device numbers 1..=count
pub fn create_mock_device_list(count: u32) -> Vec<Device> {
    (1..=count)
        .map(|i| create_mock_device(1, i, 0x1000 + (i as u16), 0x2000 + (i as u16)))
        .collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Create a mock control transfer setup packet
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    let value = value.to_le_bytes();
    let index = index.to_le_bytes();
    let length = length.to_le_bytes();
    [
        request_type,
        request,
        value[0],
        value[1],
        index[0],
        index[1],
        length[0],
        length[1],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_device() {
        let device = create_mock_device(2, 42, 0x1234, 0x5678);

        assert_eq!(device.bus_id, "2-42");
        assert_eq!(device.key().devid(), (2 << 16) | 42);
        assert_eq!(device.vendor_id, 0x1234);
        assert!(device.manufacturer.is_some());
    }

    #[test]
    fn test_create_mock_device_list_unique_ids() {
        let devices = create_mock_device_list(10);
        assert_eq!(devices.len(), 10);

        let ids: std::collections::HashSet<_> = devices.iter().map(|d| d.bus_id.clone()).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_create_mock_setup_packet() {
        let setup = create_mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 0x0012);

        assert_eq!(setup[0], 0x80); // bmRequestType
        assert_eq!(setup[1], 0x06); // GET_DESCRIPTOR
        assert_eq!(setup[3], 0x01); // Descriptor type: Device
        assert_eq!(setup[6], 0x12); // wLength low
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
