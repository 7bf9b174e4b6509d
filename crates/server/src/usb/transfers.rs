//! USB transfer execution
//!
//! Runs one URB synchronously on the worker thread and reports the result in
//! USB/IP terms (negative errno status, actual length, IN payload).

use common::{TransferOutcome, UsbFailure, UsbTransfer};
use protocol::{TransferKind, errno};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// IN polls on bulk/interrupt endpoints give up after this long
///
/// Devices such as printers answer status polls only when they have
/// something to say; an empty completion keeps the client polling.
const IN_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Decoded control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(setup: &[u8; 8]) -> Self {
        Self {
            request_type: setup[0],
            request: setup[1],
            value: u16::from_le_bytes([setup[2], setup[3]]),
            index: u16::from_le_bytes([setup[4], setup[5]]),
            length: u16::from_le_bytes([setup[6], setup[7]]),
        }
    }

    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Execute `transfer` on an open device
pub fn execute(
    handle: &mut DeviceHandle<Context>,
    transfer: &UsbTransfer,
    timeout: Duration,
) -> TransferOutcome {
    let result = match transfer.kind {
        TransferKind::Control => control(handle, transfer, timeout),
        TransferKind::Bulk | TransferKind::Interrupt => data_stage(handle, transfer, timeout),
        TransferKind::Isochronous => return TransferOutcome::failed(errno::EOPNOTSUPP),
    };

    match result {
        Ok(outcome) => {
            debug!(
                "{} transfer on ep {:#04x} done: {} bytes",
                transfer.kind, transfer.endpoint, outcome.actual_length
            );
            outcome
        }
        Err(e) => {
            warn!(
                "{} transfer on ep {:#04x} failed: {}",
                transfer.kind, transfer.endpoint, e
            );
            TransferOutcome::failed(errno_for(e))
        }
    }
}

fn control(
    handle: &mut DeviceHandle<Context>,
    transfer: &UsbTransfer,
    timeout: Duration,
) -> Result<TransferOutcome, rusb::Error> {
    let setup = SetupPacket::parse(&transfer.setup);
    debug!(
        "Control transfer: type={:#04x} request={:#04x} value={:#06x} index={:#06x} length={}",
        setup.request_type, setup.request, setup.value, setup.index, setup.length
    );

    if setup.is_in() {
        let mut buffer = vec![0u8; setup.length as usize];
        let len = handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &mut buffer,
            timeout,
        )?;
        buffer.truncate(len);
        Ok(TransferOutcome::completed(buffer, len as u32))
    } else {
        let len = handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            &transfer.data,
            timeout,
        )?;
        Ok(TransferOutcome::completed(Vec::new(), len as u32))
    }
}

/// Bulk and interrupt transfers
fn data_stage(
    handle: &mut DeviceHandle<Context>,
    transfer: &UsbTransfer,
    timeout: Duration,
) -> Result<TransferOutcome, rusb::Error> {
    let endpoint = transfer.endpoint;
    let interrupt = transfer.kind == TransferKind::Interrupt;

    if !transfer.is_in() {
        let len = if interrupt {
            handle.write_interrupt(endpoint, &transfer.data, timeout)?
        } else {
            handle.write_bulk(endpoint, &transfer.data, timeout)?
        };
        return Ok(TransferOutcome::completed(Vec::new(), len as u32));
    }

    let mut buffer = vec![0u8; transfer.length as usize];
    let poll = IN_POLL_TIMEOUT.min(timeout);
    let read = if interrupt {
        handle.read_interrupt(endpoint, &mut buffer, poll)
    } else {
        handle.read_bulk(endpoint, &mut buffer, poll)
    };

    match read {
        Ok(len) => {
            buffer.truncate(len);
            Ok(TransferOutcome::completed(buffer, len as u32))
        }
        Err(rusb::Error::Timeout) | Err(rusb::Error::Io) => {
            debug!("No data pending on ep {:#04x}", endpoint);
            Ok(TransferOutcome::completed(Vec::new(), 0))
        }
        Err(e) => Err(e),
    }
}

/// errno reported in RET_SUBMIT for a failed transfer
pub fn errno_for(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Timeout => errno::ETIMEDOUT,
        rusb::Error::Pipe => errno::EPIPE,
        rusb::Error::NoDevice | rusb::Error::NotFound => errno::ENODEV,
        rusb::Error::Busy => errno::EBUSY,
        rusb::Error::Overflow => errno::EOVERFLOW,
        rusb::Error::InvalidParam => errno::EINVAL,
        rusb::Error::Access => errno::EACCES,
        rusb::Error::Interrupted => errno::ECONNRESET,
        rusb::Error::NotSupported => errno::EOPNOTSUPP,
        _ => errno::EIO,
    }
}

/// libusb error code (`LIBUSB_ERROR_*`) for a rusb error
pub fn libusb_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => UsbFailure::ACCESS,
        rusb::Error::NoDevice => UsbFailure::NO_DEVICE,
        rusb::Error::NotFound => UsbFailure::NOT_FOUND,
        rusb::Error::Busy => UsbFailure::BUSY,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => UsbFailure::OTHER,
    }
}

pub fn usb_failure(err: rusb::Error) -> UsbFailure {
    UsbFailure::new(libusb_code(err), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_setup_packet;

    #[test]
    fn test_setup_packet_parse() {
        let raw = create_mock_setup_packet(0x80, 0x06, 0x0100, 0x0409, 0x0012);
        let setup = SetupPacket::parse(&raw);
        assert!(setup.is_in());
        assert_eq!(setup.request, 0x06);
        assert_eq!(setup.value, 0x0100);
        assert_eq!(setup.index, 0x0409);
        assert_eq!(setup.length, 18);

        let out = SetupPacket::parse(&create_mock_setup_packet(0x00, 0x09, 1, 0, 0));
        assert!(!out.is_in());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno_for(rusb::Error::Pipe), errno::EPIPE);
        assert_eq!(errno_for(rusb::Error::NoDevice), errno::ENODEV);
        assert_eq!(errno_for(rusb::Error::Timeout), errno::ETIMEDOUT);
        assert_eq!(errno_for(rusb::Error::Other), errno::EIO);
    }

    #[test]
    fn test_failure_codes() {
        let denied = usb_failure(rusb::Error::Access);
        assert!(denied.is_access_denied());
        assert!(usb_failure(rusb::Error::NoDevice).is_not_found());
        assert_eq!(libusb_code(rusb::Error::Pipe), -9);
        assert_eq!(libusb_code(rusb::Error::BadDescriptor), UsbFailure::OTHER);
    }
}
