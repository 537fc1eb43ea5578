use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::RemotingError;

/// Magic bytes at the start of every message header.
pub const MAGIC: [u8; 4] = [0x49, 0x63, 0x65, 0x50];

pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;
pub const ENCODING_MAJOR: u8 = 1;
pub const ENCODING_MINOR: u8 = 0;

/// Fixed message header:
/// `magic[4] | protocolMajor | protocolMinor | encodingMajor | encodingMinor |
///  messageType | compressionStatus | size[4]` - all integers big-endian.
pub const HEADER_SIZE: usize = 14;

/// Offset of the 4-byte total message size inside the header. The size is written as a
///  placeholder first and patched after the body has been marshaled.
pub const OFF_SIZE: usize = 10;

/// Offset of the 4-byte request id in Request and Reply messages, and of the request
///  count in RequestBatch messages.
pub const OFF_REQUEST_ID: usize = HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageType {
    CloseConnection = 0,
    Request = 1,
    RequestBatch = 2,
    Reply = 3,
    ValidateConnection = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CompressionStatus {
    /// Peer does not support compression.
    Uncompressed = 0,
    /// Peer supports compression but this message is not compressed.
    Supported = 1,
    /// The message body is compressed.
    Compressed = 2,
}

impl CompressionStatus {
    pub fn for_flag(compress: bool) -> CompressionStatus {
        if compress {
            CompressionStatus::Supported
        } else {
            CompressionStatus::Uncompressed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub compress: CompressionStatus,
    /// Total message size, header included.
    pub size: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType, compress: CompressionStatus, size: u32) -> MessageHeader {
        MessageHeader { message_type, compress, size }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u8(PROTOCOL_MAJOR);
        buf.put_u8(PROTOCOL_MINOR);
        buf.put_u8(ENCODING_MAJOR);
        buf.put_u8(ENCODING_MINOR);
        buf.put_u8(self.message_type.into());
        buf.put_u8(self.compress.into());
        buf.put_u32(self.size);
    }

    /// Parses and validates a message header.
    ///
    /// Only the *major* version numbers are checked: a peer must never emit a minor
    ///  version greater than what the other side announced, but it must accept any
    ///  minor version at or above its own, so minor mismatches are tolerated here.
    pub fn deser(buf: &mut impl Buf) -> Result<MessageHeader, RemotingError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(RemotingError::TransportFailure {
                detail: format!("truncated message header: {} bytes", buf.remaining()),
            });
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(RemotingError::BadMagic { found: magic });
        }

        let protocol_major = buf.get_u8();
        let protocol_minor = buf.get_u8();
        if protocol_major != PROTOCOL_MAJOR {
            return Err(RemotingError::UnsupportedProtocolVersion {
                found_major: protocol_major,
                found_minor: protocol_minor,
                supported_major: PROTOCOL_MAJOR,
            });
        }

        let encoding_major = buf.get_u8();
        let encoding_minor = buf.get_u8();
        if encoding_major != ENCODING_MAJOR {
            return Err(RemotingError::UnsupportedEncodingVersion {
                found_major: encoding_major,
                found_minor: encoding_minor,
                supported_major: ENCODING_MAJOR,
            });
        }

        let raw_type = buf.get_u8();
        let message_type = MessageType::try_from(raw_type)
            .map_err(|_| RemotingError::UnknownMessageType(raw_type))?;

        let raw_compress = buf.get_u8();
        let compress = CompressionStatus::try_from(raw_compress)
            .map_err(|_| RemotingError::CompressionNotSupported)?;

        let size = buf.get_u32();
        if (size as usize) < HEADER_SIZE {
            return Err(RemotingError::IllegalMessageSize { size, limit: HEADER_SIZE as u32 });
        }

        Ok(MessageHeader { message_type, compress, size })
    }
}

/// Writes a header with a size placeholder. The caller marshals the body into the same
///  buffer and calls [`patch_size`] once the body is complete.
pub fn write_envelope(buf: &mut BytesMut, message_type: MessageType, compress: CompressionStatus) {
    MessageHeader::new(message_type, compress, 0).ser(buf);
}

/// Patches the true total size into a previously written envelope.
pub fn patch_size(buf: &mut BytesMut) {
    debug_assert!(buf.len() >= HEADER_SIZE);
    let size = buf.len() as u32;
    buf[OFF_SIZE..OFF_SIZE + 4].copy_from_slice(&size.to_be_bytes());
}

/// Patches the request id into the placeholder following the header of a Request frame.
pub fn patch_request_id(buf: &mut BytesMut, request_id: u32) {
    debug_assert!(buf.len() >= OFF_REQUEST_ID + 4);
    buf[OFF_REQUEST_ID..OFF_REQUEST_ID + 4].copy_from_slice(&request_id.to_be_bytes());
}

/// A ValidateConnection frame has no body, so its size is known up front.
pub fn marshal_validate_frame(buf: &mut BytesMut) {
    MessageHeader::new(
        MessageType::ValidateConnection,
        CompressionStatus::Uncompressed,
        HEADER_SIZE as u32,
    )
    .ser(buf);
}

pub fn marshal_close_frame(buf: &mut BytesMut) {
    MessageHeader::new(
        MessageType::CloseConnection,
        CompressionStatus::Uncompressed,
        HEADER_SIZE as u32,
    )
    .ser(buf);
}

/// Marshals a complete Request frame. The request id is written as a placeholder of 0
///  (the oneway id); twoway senders patch their allocated id in afterwards.
pub fn marshal_request_frame(buf: &mut BytesMut, payload: &[u8], compress: bool) {
    write_envelope(buf, MessageType::Request, CompressionStatus::for_flag(compress));
    buf.put_u32(0); // request id placeholder
    buf.put_slice(payload);
    patch_size(buf);
}

pub fn marshal_reply_frame(buf: &mut BytesMut, request_id: u32, ok: bool, payload: &[u8]) {
    write_envelope(buf, MessageType::Reply, CompressionStatus::Uncompressed);
    buf.put_u32(request_id);
    buf.put_u8(ok as u8);
    buf.put_slice(payload);
    patch_size(buf);
}
