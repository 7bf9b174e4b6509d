//! USB/IP wire protocol codec
//!
//! Byte-exact encoding and decoding of the USB/IP messages exchanged with
//! `usbip`/`vhci_hcd` clients. The layout follows the Linux kernel
//! documentation (Documentation/usb/usbip_protocol.rst):
//!
//! - All integers are big-endian (network byte order)
//! - OP messages (device list, import) start with an 8-byte header:
//!   `[version u16][code u16][status u32]`
//! - URB messages (submit, unlink) start with a 48-byte header whose first
//!   20 bytes are `[command u32][seqnum u32][devid u32][direction u32][ep u32]`
//!
//! Decoding never reads past the end of the input: a buffer shorter than the
//! declared message fails with [`UsbIpError::TruncatedMessage`], which a
//! streaming reader treats as "wait for more bytes".

use crate::error::{Result, UsbIpError};
use crate::types::{Device, DeviceSpeed, InterfaceInfo};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// USB/IP protocol version
pub const USBIP_VERSION: u16 = 0x0111;

/// Command code: Retrieve the list of exported USB devices
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Reply code: The list of exported USB devices
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Command code: import a remote USB device
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Reply code: Reply to import
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Command code: Submit an URB
pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
/// Command code: Unlink an URB
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
/// Reply code: Reply for submitting an URB
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
/// Reply code: Reply for URB unlink
pub const USBIP_RET_UNLINK: u32 = 0x0004;

/// URB direction: host to device
pub const USBIP_DIR_OUT: u32 = 0;
/// URB direction: device to host
pub const USBIP_DIR_IN: u32 = 1;

pub const OP_HEADER_SIZE: usize = 8;
pub const URB_BASIC_HEADER_SIZE: usize = 20;
pub const URB_HEADER_SIZE: usize = 48;
pub const PATH_SIZE: usize = 256;
pub const BUS_ID_SIZE: usize = 32;
/// Device descriptor without interface records
pub const DEVICE_DESCRIPTOR_SIZE: usize = 312;
pub const INTERFACE_RECORD_SIZE: usize = 4;
pub const ISO_PACKET_DESCRIPTOR_SIZE: usize = 16;

/// Largest transfer buffer a single URB may declare
pub const MAX_TRANSFER_BUFFER_LENGTH: usize = 16 * 1024 * 1024;
/// Largest ISO packet count a single URB may declare
pub const MAX_ISO_PACKETS: usize = 1024;
/// Largest device count accepted when decoding OP_REP_DEVLIST
pub const MAX_DEVLIST_DEVICES: usize = 1024;

/// Linux errno values used in RET_SUBMIT / RET_UNLINK status fields
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const EOVERFLOW: i32 = 75;
    pub const EOPNOTSUPP: i32 = 95;
    pub const ECONNRESET: i32 = 104;
    pub const ESHUTDOWN: i32 = 108;
    pub const ETIMEDOUT: i32 = 110;
}

/// OP reply status codes defined by USB/IP (`ST_*` in usbip_common.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpStatus {
    Ok = 0,
    /// Device not available
    Na = 1,
    /// Device busy (already exported/claimed)
    DevBusy = 2,
    /// Device in error state
    DevErr = 3,
    /// Device not found
    NoDev = 4,
    /// Unexpected response
    Error = 5,
}

impl OpStatus {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Header of OP_* messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn new(code: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            code,
            status,
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.version);
        buf.put_u16(self.code);
        buf.put_u32(self.status);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            version: r.u16()?,
            code: r.u16()?,
            status: r.u32()?,
        })
    }
}

/// Basic header shared by all URB messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UrbHeader {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UrbHeader {
    pub fn is_in(&self) -> bool {
        self.direction == USBIP_DIR_IN
    }

    /// Header of the reply to this request, echoing seqnum and addressing
    pub fn reply(&self, command: u32) -> Self {
        Self { command, ..*self }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.command);
        buf.put_u32(self.seqnum);
        buf.put_u32(self.devid);
        buf.put_u32(self.direction);
        buf.put_u32(self.ep);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            command: r.u32()?,
            seqnum: r.u32()?,
            devid: r.u32()?,
            direction: r.u32()?,
            ep: r.u32()?,
        })
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Op(OpHeader),
    Urb(UrbHeader),
}

impl Header {
    /// Command or reply code carried by the header
    pub fn code(&self) -> u32 {
        match self {
            Self::Op(h) => h.code as u32,
            Self::Urb(h) => h.command,
        }
    }

    /// Encode just the header bytes (8 for OP, 20 for URB)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(URB_BASIC_HEADER_SIZE);
        match self {
            Self::Op(h) => h.write(&mut buf),
            Self::Urb(h) => h.write(&mut buf),
        }
        buf.freeze()
    }
}

/// Decode the leading header of a USB/IP message
///
/// OP messages are recognised by version 0x0111 (or 0x0000 with the request
/// bit set, as sent by older clients); URB messages start with a zero high
/// half of the 32-bit command. Anything else is a malformed header.
pub fn decode_header(bytes: &[u8]) -> Result<Header> {
    let mut r = WireReader::new(bytes);
    r.ensure(4)?;
    let version = u16::from_be_bytes([bytes[0], bytes[1]]);
    let code = u16::from_be_bytes([bytes[2], bytes[3]]);

    let is_op = match version {
        USBIP_VERSION => true,
        0 => code & 0x8000 != 0,
        _ => return Err(UsbIpError::MalformedHeader { version }),
    };

    if is_op {
        let header = OpHeader::read(&mut r)?;
        match header.code {
            OP_REQ_DEVLIST | OP_REP_DEVLIST | OP_REQ_IMPORT | OP_REP_IMPORT => {
                Ok(Header::Op(header))
            }
            other => Err(UsbIpError::UnsupportedCommand(other as u32)),
        }
    } else {
        let header = UrbHeader::read(&mut r)?;
        match header.command {
            USBIP_CMD_SUBMIT | USBIP_CMD_UNLINK | USBIP_RET_SUBMIT | USBIP_RET_UNLINK => {
                Ok(Header::Urb(header))
            }
            other => Err(UsbIpError::UnsupportedCommand(other)),
        }
    }
}

/// A message with a fixed USB/IP byte layout
pub trait WireMessage: Sized {
    /// Append the encoded message to `buf`
    fn encode_to(&self, buf: &mut BytesMut) -> Result<()>;

    /// Decode one message from the front of `bytes`, returning it and the
    /// number of bytes it occupied
    fn decode_from(bytes: &[u8]) -> Result<(Self, usize)>;
}

/// Encode a message into a fresh buffer
pub fn encode<T: WireMessage>(message: &T) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    message.encode_to(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one message; leftover bytes are an error
pub fn decode<T: WireMessage>(bytes: &[u8]) -> Result<T> {
    let (message, used) = T::decode_from(bytes)?;
    if used != bytes.len() {
        return Err(UsbIpError::TrailingBytes {
            extra: bytes.len() - used,
        });
    }
    Ok(message)
}

/// Decode one message from the front of a stream buffer
pub fn decode_prefix<T: WireMessage>(bytes: &[u8]) -> Result<(T, usize)> {
    T::decode_from(bytes)
}

/// ISO packet descriptor following SUBMIT/RET_SUBMIT payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.offset);
        buf.put_u32(self.length);
        buf.put_u32(self.actual_length);
        buf.put_i32(self.status);
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            offset: r.u32()?,
            length: r.u32()?,
            actual_length: r.u32()?,
            status: r.i32()?,
        })
    }
}

/// Whether a `number_of_packets` field announces ISO descriptors
///
/// The kernel docs say non-ISO URBs carry 0xFFFFFFFF, but the actual
/// implementation sends 0; both mean "none".
fn has_iso_packets(number_of_packets: u32) -> bool {
    number_of_packets != 0 && number_of_packets != 0xFFFF_FFFF
}

fn read_iso_descriptors(
    r: &mut WireReader<'_>,
    number_of_packets: u32,
) -> Result<Vec<IsoPacketDescriptor>> {
    if !has_iso_packets(number_of_packets) {
        return Ok(Vec::new());
    }
    let count = number_of_packets as usize;
    if count > MAX_ISO_PACKETS {
        return Err(UsbIpError::PayloadTooLarge {
            size: count,
            max: MAX_ISO_PACKETS,
        });
    }
    r.ensure(count * ISO_PACKET_DESCRIPTOR_SIZE)?;
    (0..count).map(|_| IsoPacketDescriptor::read(r)).collect()
}

/// USBIP_CMD_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: UrbHeader,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
    /// OUT payload; empty for IN transfers
    pub data: Vec<u8>,
    pub iso_packet_descriptors: Vec<IsoPacketDescriptor>,
}

impl CmdSubmit {
    pub fn is_in(&self) -> bool {
        self.header.is_in()
    }

    pub fn has_iso_packets(&self) -> bool {
        has_iso_packets(self.number_of_packets)
    }

    /// Transfer kind inferred from the URB
    ///
    /// Endpoint 0 is always control; ISO descriptors mark isochronous; a
    /// polling interval marks interrupt; everything else is bulk.
    pub fn transfer_kind(&self) -> crate::types::TransferKind {
        use crate::types::TransferKind;
        if self.header.ep == 0 {
            TransferKind::Control
        } else if self.has_iso_packets() {
            TransferKind::Isochronous
        } else if self.interval > 0 {
            TransferKind::Interrupt
        } else {
            TransferKind::Bulk
        }
    }

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.transfer_flags);
        buf.put_u32(self.transfer_buffer_length);
        buf.put_u32(self.start_frame);
        buf.put_u32(self.number_of_packets);
        buf.put_u32(self.interval);
        buf.put_slice(&self.setup);
        if !self.is_in() {
            buf.put_slice(&self.data);
        }
        for iso in &self.iso_packet_descriptors {
            iso.write(buf);
        }
    }

    fn read_body(header: UrbHeader, r: &mut WireReader<'_>) -> Result<Self> {
        let transfer_flags = r.u32()?;
        let transfer_buffer_length = r.u32()?;
        let start_frame = r.u32()?;
        let number_of_packets = r.u32()?;
        let interval = r.u32()?;
        let setup = r.array::<8>()?;

        let length = transfer_buffer_length as usize;
        if length > MAX_TRANSFER_BUFFER_LENGTH {
            return Err(UsbIpError::PayloadTooLarge {
                size: length,
                max: MAX_TRANSFER_BUFFER_LENGTH,
            });
        }
        let data = if header.is_in() {
            Vec::new()
        } else {
            r.vec(length)?
        };
        let iso_packet_descriptors = read_iso_descriptors(r, number_of_packets)?;

        Ok(Self {
            header,
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
            data,
            iso_packet_descriptors,
        })
    }
}

/// USBIP_CMD_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: UrbHeader,
    /// Sequence number of the SUBMIT to cancel
    pub unlink_seqnum: u32,
}

/// Requests sent by USB/IP clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbIpCommand {
    OpReqDevlist,
    OpReqImport { bus_id: String },
    CmdSubmit(CmdSubmit),
    CmdUnlink(CmdUnlink),
}

impl WireMessage for UsbIpCommand {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::OpReqDevlist => {
                OpHeader::new(OP_REQ_DEVLIST, 0).write(buf);
            }
            Self::OpReqImport { bus_id } => {
                OpHeader::new(OP_REQ_IMPORT, 0).write(buf);
                put_fixed_str(buf, bus_id, BUS_ID_SIZE);
            }
            Self::CmdSubmit(submit) => {
                submit.header.write(buf);
                submit.write_body(buf);
            }
            Self::CmdUnlink(unlink) => {
                unlink.header.write(buf);
                buf.put_u32(unlink.unlink_seqnum);
                buf.put_bytes(0, 24);
            }
        }
        Ok(())
    }

    fn decode_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = decode_header(bytes)?;
        let mut r = WireReader::new(bytes);

        let command = match header {
            Header::Op(op) => {
                r.skip(OP_HEADER_SIZE)?;
                match op.code {
                    OP_REQ_DEVLIST => Self::OpReqDevlist,
                    OP_REQ_IMPORT => Self::OpReqImport {
                        bus_id: r.fixed_str(BUS_ID_SIZE)?,
                    },
                    other => return Err(UsbIpError::UnsupportedCommand(other as u32)),
                }
            }
            Header::Urb(urb) => {
                r.skip(URB_BASIC_HEADER_SIZE)?;
                match urb.command {
                    USBIP_CMD_SUBMIT => Self::CmdSubmit(CmdSubmit::read_body(urb, &mut r)?),
                    USBIP_CMD_UNLINK => {
                        let unlink_seqnum = r.u32()?;
                        r.skip(24)?;
                        Self::CmdUnlink(CmdUnlink {
                            header: urb,
                            unlink_seqnum,
                        })
                    }
                    other => return Err(UsbIpError::UnsupportedCommand(other)),
                }
            }
        };

        Ok((command, r.consumed()))
    }
}

/// USBIP_RET_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: UrbHeader,
    /// 0 on success, negative errno on failure
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    /// IN payload; empty for OUT transfers
    pub data: Vec<u8>,
    pub iso_packet_descriptors: Vec<IsoPacketDescriptor>,
}

impl RetSubmit {
    /// Reply to `request` carrying a completed transfer
    pub fn reply_to(request: &UrbHeader, status: i32, actual_length: u32, data: Vec<u8>) -> Self {
        Self {
            header: request.reply(USBIP_RET_SUBMIT),
            status,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
            iso_packet_descriptors: Vec::new(),
        }
    }

    /// Failed reply with a negative errno and no payload
    pub fn error(request: &UrbHeader, errno: i32) -> Self {
        Self::reply_to(request, -errno, 0, Vec::new())
    }
}

/// USBIP_RET_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: UrbHeader,
    /// -ECONNRESET when the URB was unlinked, 0 when it had already completed
    pub status: i32,
}

impl RetUnlink {
    pub fn reply_to(request: &UrbHeader, status: i32) -> Self {
        Self {
            header: request.reply(USBIP_RET_UNLINK),
            status,
        }
    }
}

/// Replies sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbIpReply {
    OpRepDevlist { status: u32, devices: Vec<Device> },
    OpRepImport { status: u32, device: Option<Device> },
    RetSubmit(RetSubmit),
    RetUnlink(RetUnlink),
}

impl UsbIpReply {
    /// Successful OP_REP_DEVLIST
    pub fn devlist(devices: &[Device]) -> Self {
        Self::OpRepDevlist {
            status: OpStatus::Ok.code(),
            devices: devices.to_vec(),
        }
    }

    /// Successful OP_REP_IMPORT carrying the device descriptor
    pub fn import_ok(device: &Device) -> Self {
        Self::OpRepImport {
            status: OpStatus::Ok.code(),
            device: Some(device.clone()),
        }
    }

    /// Failed OP_REP_IMPORT; only the header goes on the wire
    pub fn import_failed(status: OpStatus) -> Self {
        Self::OpRepImport {
            status: status.code(),
            device: None,
        }
    }
}

impl WireMessage for UsbIpReply {
    fn encode_to(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::OpRepDevlist { status, devices } => {
                OpHeader::new(OP_REP_DEVLIST, *status).write(buf);
                buf.put_u32(devices.len() as u32);
                for device in devices {
                    put_device(buf, device, true)?;
                }
            }
            Self::OpRepImport { status, device } => {
                OpHeader::new(OP_REP_IMPORT, *status).write(buf);
                if let Some(device) = device {
                    put_device(buf, device, false)?;
                }
            }
            Self::RetSubmit(ret) => {
                ret.header.write(buf);
                buf.put_i32(ret.status);
                buf.put_u32(ret.actual_length);
                buf.put_u32(ret.start_frame);
                buf.put_u32(ret.number_of_packets);
                buf.put_u32(ret.error_count);
                buf.put_bytes(0, 8);
                if ret.header.is_in() {
                    buf.put_slice(&ret.data);
                }
                for iso in &ret.iso_packet_descriptors {
                    iso.write(buf);
                }
            }
            Self::RetUnlink(ret) => {
                ret.header.write(buf);
                buf.put_i32(ret.status);
                buf.put_bytes(0, 24);
            }
        }
        Ok(())
    }

    fn decode_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let header = decode_header(bytes)?;
        let mut r = WireReader::new(bytes);

        let reply = match header {
            Header::Op(op) => {
                r.skip(OP_HEADER_SIZE)?;
                match op.code {
                    OP_REP_DEVLIST => {
                        let count = r.u32()? as usize;
                        if count > MAX_DEVLIST_DEVICES {
                            return Err(UsbIpError::PayloadTooLarge {
                                size: count,
                                max: MAX_DEVLIST_DEVICES,
                            });
                        }
                        let devices = (0..count)
                            .map(|_| read_device(&mut r, true))
                            .collect::<Result<Vec<_>>>()?;
                        Self::OpRepDevlist {
                            status: op.status,
                            devices,
                        }
                    }
                    OP_REP_IMPORT => {
                        let device = if op.status == OpStatus::Ok.code() {
                            Some(read_device(&mut r, false)?)
                        } else {
                            None
                        };
                        Self::OpRepImport {
                            status: op.status,
                            device,
                        }
                    }
                    other => return Err(UsbIpError::UnsupportedCommand(other as u32)),
                }
            }
            Header::Urb(urb) => {
                r.skip(URB_BASIC_HEADER_SIZE)?;
                match urb.command {
                    USBIP_RET_SUBMIT => {
                        let status = r.i32()?;
                        let actual_length = r.u32()?;
                        let start_frame = r.u32()?;
                        let number_of_packets = r.u32()?;
                        let error_count = r.u32()?;
                        r.skip(8)?;
                        let length = actual_length as usize;
                        if length > MAX_TRANSFER_BUFFER_LENGTH {
                            return Err(UsbIpError::PayloadTooLarge {
                                size: length,
                                max: MAX_TRANSFER_BUFFER_LENGTH,
                            });
                        }
                        let data = if urb.is_in() {
                            r.vec(length)?
                        } else {
                            Vec::new()
                        };
                        let iso_packet_descriptors =
                            read_iso_descriptors(&mut r, number_of_packets)?;
                        Self::RetSubmit(RetSubmit {
                            header: urb,
                            status,
                            actual_length,
                            start_frame,
                            number_of_packets,
                            error_count,
                            data,
                            iso_packet_descriptors,
                        })
                    }
                    USBIP_RET_UNLINK => {
                        let status = r.i32()?;
                        r.skip(24)?;
                        Self::RetUnlink(RetUnlink {
                            header: urb,
                            status,
                        })
                    }
                    other => return Err(UsbIpError::UnsupportedCommand(other)),
                }
            }
        };

        Ok((reply, r.consumed()))
    }
}

fn put_fixed_str(buf: &mut BytesMut, value: &str, width: usize) {
    // Always leave room for the terminating NUL
    let bytes = value.as_bytes();
    let len = bytes.len().min(width - 1);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, width - len);
}

fn put_device(buf: &mut BytesMut, device: &Device, with_interfaces: bool) -> Result<()> {
    let num_interfaces =
        u8::try_from(device.interfaces.len()).map_err(|_| UsbIpError::FieldOverflow {
            field: "bNumInterfaces",
            value: device.interfaces.len(),
        })?;

    put_fixed_str(buf, &device.path, PATH_SIZE);
    put_fixed_str(buf, &device.bus_id, BUS_ID_SIZE);
    buf.put_u32(device.bus_num);
    buf.put_u32(device.dev_num);
    buf.put_u32(device.speed.code());
    buf.put_u16(device.vendor_id);
    buf.put_u16(device.product_id);
    buf.put_u16(device.bcd_device);
    buf.put_u8(device.class);
    buf.put_u8(device.subclass);
    buf.put_u8(device.protocol);
    buf.put_u8(device.configuration_value);
    buf.put_u8(device.num_configurations);
    buf.put_u8(num_interfaces);

    if with_interfaces {
        for interface in &device.interfaces {
            buf.put_u8(interface.class);
            buf.put_u8(interface.subclass);
            buf.put_u8(interface.protocol);
            buf.put_u8(0);
        }
    }
    Ok(())
}

/// Read a device descriptor
///
/// OP_REP_IMPORT carries no interface records, so the decoded device has an
/// empty interface list in that case.
fn read_device(r: &mut WireReader<'_>, with_interfaces: bool) -> Result<Device> {
    r.ensure(DEVICE_DESCRIPTOR_SIZE)?;
    let path = r.fixed_str(PATH_SIZE)?;
    let bus_id = r.fixed_str(BUS_ID_SIZE)?;
    let bus_num = r.u32()?;
    let dev_num = r.u32()?;
    let speed = DeviceSpeed::from_code(r.u32()?);
    let vendor_id = r.u16()?;
    let product_id = r.u16()?;
    let bcd_device = r.u16()?;
    let class = r.u8()?;
    let subclass = r.u8()?;
    let protocol = r.u8()?;
    let configuration_value = r.u8()?;
    let num_configurations = r.u8()?;
    let num_interfaces = r.u8()? as usize;

    let interfaces = if with_interfaces {
        r.ensure(num_interfaces * INTERFACE_RECORD_SIZE)?;
        let mut interfaces = Vec::with_capacity(num_interfaces);
        for _ in 0..num_interfaces {
            let class = r.u8()?;
            let subclass = r.u8()?;
            let protocol = r.u8()?;
            r.skip(1)?;
            interfaces.push(InterfaceInfo {
                class,
                subclass,
                protocol,
            });
        }
        interfaces
    } else {
        Vec::new()
    };

    Ok(Device {
        path,
        bus_id,
        bus_num,
        dev_num,
        speed,
        vendor_id,
        product_id,
        bcd_device,
        class,
        subclass,
        protocol,
        configuration_value,
        num_configurations,
        interfaces,
        manufacturer: None,
        product: None,
        serial_number: None,
    })
}

/// Bounds-checked big-endian reader over a borrowed buffer
struct WireReader<'a> {
    buf: &'a [u8],
    total: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            total: buf.len(),
        }
    }

    fn consumed(&self) -> usize {
        self.total - self.buf.remaining()
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(UsbIpError::TruncatedMessage {
                needed: self.consumed() + n,
                available: self.total,
            });
        }
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn vec(&mut self, n: usize) -> Result<Vec<u8>> {
        self.ensure(n)?;
        let out = self.buf[..n].to_vec();
        self.buf.advance(n);
        Ok(out)
    }

    fn fixed_str(&mut self, width: usize) -> Result<String> {
        let raw = self.vec(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Errors from reading USB/IP messages off a stream
#[cfg(feature = "async")]
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] UsbIpError),
}

/// Read one message from `reader`, buffering partial input in `buf`
///
/// Returns `Ok(None)` on a clean end of stream between messages. A stream
/// that ends in the middle of a message yields the truncation error.
#[cfg(feature = "async")]
pub async fn read_message<T, R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> std::result::Result<Option<T>, StreamError>
where
    T: WireMessage,
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            match T::decode_from(&buf[..]) {
                Ok((message, used)) => {
                    buf.advance(used);
                    return Ok(Some(message));
                }
                Err(e) if e.is_truncated() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            // EOF mid-message: surface the truncation
            return match T::decode_from(&buf[..]) {
                Ok(_) => Err(StreamError::Io(std::io::ErrorKind::UnexpectedEof.into())),
                Err(e) => Err(e.into()),
            };
        }
    }
}

/// Encode and write one message
#[cfg(feature = "async")]
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    T: WireMessage,
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&bytes).await
}
