use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::RemotingError;
use crate::protocol::{self, CompressionStatus, MessageType, HEADER_SIZE};

/// Size of the RequestBatch envelope: message header plus the 4-byte request count.
pub const BATCH_ENVELOPE_SIZE: usize = HEADER_SIZE + 4;

/// Per-entry overhead: every batched request is written with a 4-byte length prefix so
///  the receiver can split the concatenated payloads.
pub const BATCH_ENTRY_OVERHEAD: usize = 4;

const OFF_COMPRESS: usize = 9;

/// Accumulates marshaled oneway requests into a single RequestBatch envelope.
///
/// The envelope header is written lazily on the first append. When appending a request
///  would push the message over the configured size limit, everything accumulated so far
///  is flushed eagerly and the new request starts a fresh batch; a request that cannot
///  fit into an empty batch fails with `MessageTooLarge` without poisoning the buffer.
pub struct BatchBuffer {
    buf: BytesMut,
    request_count: u32,
    compress: bool,
    /// Byte offset of the most recently appended request, for [`Self::rollback_last`].
    rollback_mark: usize,
    max_message_size: usize,
}

impl BatchBuffer {
    pub fn new(max_message_size: usize) -> BatchBuffer {
        BatchBuffer {
            buf: BytesMut::new(),
            request_count: 0,
            compress: false,
            rollback_mark: 0,
            max_message_size,
        }
    }

    fn begin(&mut self) {
        debug_assert!(self.buf.is_empty());
        protocol::write_envelope(&mut self.buf, MessageType::RequestBatch, CompressionStatus::Uncompressed);
        self.buf.put_u32(0); // request count placeholder
    }

    /// Appends one marshaled oneway request.
    ///
    /// Returns `Ok(Some(frame))` if the size limit forced an eager flush: the returned
    ///  frame holds all previously accumulated requests and must be transmitted before
    ///  anything else happens on this buffer; the new request has already been placed in
    ///  a fresh batch.
    pub fn append(&mut self, payload: &[u8], compress: bool) -> Result<Option<Bytes>, RemotingError> {
        let entry_size = BATCH_ENTRY_OVERHEAD + payload.len();

        if BATCH_ENVELOPE_SIZE + entry_size > self.max_message_size {
            // would not fit even into an empty batch - fail this send only
            return Err(RemotingError::MessageTooLarge {
                size: BATCH_ENVELOPE_SIZE + entry_size,
                limit: self.max_message_size,
            });
        }

        let flushed = if self.buf.is_empty() {
            self.begin();
            None
        } else if self.buf.len() + entry_size > self.max_message_size {
            trace!(
                "batch of {} requests reached the size limit of {} bytes, splitting",
                self.request_count,
                self.max_message_size
            );
            let frame = self.flush();
            debug_assert!(frame.is_some());
            self.begin();
            frame
        } else {
            None
        };

        self.rollback_mark = self.buf.len();
        self.buf.put_u32(payload.len() as u32);
        self.buf.put_slice(payload);
        self.request_count += 1;
        self.compress |= compress;

        Ok(flushed)
    }

    /// Truncates the buffer back to the start of the most recently appended request.
    /// Only legal directly after an [`Self::append`].
    pub fn rollback_last(&mut self) {
        debug_assert!(self.request_count > 0);
        debug_assert!(self.rollback_mark >= BATCH_ENVELOPE_SIZE);

        self.buf.truncate(self.rollback_mark);
        self.request_count -= 1;

        if self.request_count == 0 {
            self.reset();
        }
    }

    /// Patches count and size into the envelope and returns the finalized frame,
    ///  resetting the buffer. Returns `None` if no requests are buffered: a batch with
    ///  count 0 is never transmitted.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.request_count == 0 {
            return None;
        }

        self.buf[OFF_COMPRESS] = CompressionStatus::for_flag(self.compress).into();
        self.buf[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&self.request_count.to_be_bytes());
        protocol::patch_size(&mut self.buf);

        trace!("flushing batch of {} requests, {} bytes", self.request_count, self.buf.len());

        let frame = std::mem::take(&mut self.buf).freeze();
        self.reset();
        Some(frame)
    }

    fn reset(&mut self) {
        self.buf = BytesMut::new();
        self.request_count = 0;
        self.compress = false;
        self.rollback_mark = 0;
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    pub fn is_empty(&self) -> bool {
        self.request_count == 0
    }

    pub fn byte_size(&self) -> usize {
        self.buf.len()
    }
}
