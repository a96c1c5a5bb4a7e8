//! The SDO request buffer
//!
//! A staging area for the bytes of a single SDO transfer, used by both directions: for a
//! download it accumulates the bytes arriving segment by segment from the client; for an upload
//! it holds the bytes to be handed out segment by segment. [`SdoBuffer`] doesn't know about CAN
//! frames or toggle bits — that belongs to the state machine in [`crate::sdo_server`]. It only
//! tracks how many bytes have been staged against how many are expected, and converts between
//! that byte stream and a typed [`BasicValue`] at the edges.

use std::sync::Mutex;

use conop_common::{
    sdo::AbortCode,
    value::{BasicValue, DataType, ValueCodecError},
};

/// Result of [`SdoBuffer::append`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The transfer's declared size has not yet been reached
    NeedMore,
    /// The buffer now holds exactly as many bytes as were declared at [`SdoBuffer::start`]
    Complete,
}

#[derive(Default)]
struct Inner {
    total_size: Option<usize>,
    data: Vec<u8>,
}

/// The SDO transfer staging buffer
///
/// One instance is reused across the lifetime of a transfer slot: [`start`](Self::start) resets
/// it, then either [`append`](Self::append) (download) or [`put_value`](Self::put_value) +
/// [`next_segment`](Self::next_segment) (upload) drive it to completion.
#[derive(Default)]
pub struct SdoBuffer {
    inner: Mutex<Inner>,
}

impl SdoBuffer {
    /// Create an empty, unstarted buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new transfer
    ///
    /// `size`, if known up front (the client indicated a size in its download-initiate, or the
    /// object's size is known for an upload), bounds how many bytes `append`/`next_segment` will
    /// accept before reporting completion. When `None`, the transfer is streaming: completion is
    /// signalled by the caller via [`finish`](Self::finish) instead.
    pub fn start(&self, size: Option<usize>) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_size = size;
        inner.data.clear();
        if let Some(size) = size {
            inner.data.reserve(size);
        }
    }

    /// Append bytes received from a download segment
    ///
    /// Returns [`AppendOutcome::Complete`] once the buffer holds exactly the declared size.
    /// Appending past the declared size is an error ([`AbortCode::DataTypeMismatchLengthHigh`]).
    pub fn append(&self, bytes: &[u8]) -> Result<AppendOutcome, AbortCode> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(total) = inner.total_size {
            if inner.data.len() + bytes.len() > total {
                return Err(AbortCode::DataTypeMismatchLengthHigh);
            }
        }
        inner.data.extend_from_slice(bytes);
        Ok(match inner.total_size {
            Some(total) if inner.data.len() == total => AppendOutcome::Complete,
            _ => AppendOutcome::NeedMore,
        })
    }

    /// Mark a size-unknown (streaming) download as complete
    ///
    /// Used by block transfer, where the final segment's length (not a running total) is what
    /// tells the server the transfer ended.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_size = Some(inner.data.len());
    }

    /// Consume the buffer, decoding it as a fixed-width [`BasicValue`]
    ///
    /// Fails with [`AbortCode::DataTypeMismatchLengthLow`]/[`AbortCode::DataTypeMismatchLengthHigh`]
    /// if the staged byte count doesn't match `data_type`'s size, or
    /// [`AbortCode::UnsupportedAccess`] if `data_type` is an array type (those are read out with
    /// [`raw_bytes`](Self::raw_bytes) instead).
    pub fn take_value(&self, data_type: DataType) -> Result<BasicValue, AbortCode> {
        let mut inner = self.inner.lock().unwrap();
        let expected = data_type
            .size_of()
            .ok_or(AbortCode::UnsupportedAccess)?;
        match inner.data.len().cmp(&expected) {
            std::cmp::Ordering::Less => return Err(AbortCode::DataTypeMismatchLengthLow),
            std::cmp::Ordering::Greater => return Err(AbortCode::DataTypeMismatchLengthHigh),
            std::cmp::Ordering::Equal => {}
        }
        let value = BasicValue::decode(data_type, &inner.data).map_err(|e| match e {
            ValueCodecError::BufferTooShort => AbortCode::DataTypeMismatchLengthLow,
            ValueCodecError::NotABasicType => AbortCode::UnsupportedAccess,
        })?;
        inner.data.clear();
        Ok(value)
    }

    /// Consume the buffer's raw bytes, for array-typed (string/domain) downloads
    pub fn take_raw(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.data)
    }

    /// Fill the buffer with the wire encoding of `value`, for an upload
    pub fn put_value(&self, value: BasicValue) {
        let mut inner = self.inner.lock().unwrap();
        let mut buf = [0u8; 8];
        let n = value.encode(&mut buf).expect("basic value always fits 8 bytes");
        inner.data = buf[0..n].to_vec();
        inner.total_size = Some(n);
    }

    /// Fill the buffer with raw bytes, for an array-typed (string/domain) upload
    pub fn put_raw(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.data = bytes.to_vec();
        inner.total_size = Some(bytes.len());
    }

    /// Take the next chunk of at most `max_bytes` for an upload segment
    ///
    /// Returns the chunk and whether it was the last one (i.e. the buffer is now fully
    /// delivered).
    pub fn next_segment(&self, max_bytes: usize) -> (Vec<u8>, bool) {
        let mut inner = self.inner.lock().unwrap();
        let n = max_bytes.min(inner.data.len());
        let chunk: Vec<u8> = inner.data.drain(0..n).collect();
        let is_last = inner.data.is_empty();
        (chunk, is_last)
    }

    /// Total size declared at [`start`](Self::start), if any
    pub fn total_size(&self) -> Option<usize> {
        self.inner.lock().unwrap().total_size
    }

    /// Number of bytes currently staged
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().data.len()
    }

    /// True if no bytes are currently staged
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_completes_at_declared_size() {
        let buf = SdoBuffer::new();
        buf.start(Some(4));
        assert_eq!(buf.append(&[1, 2]).unwrap(), AppendOutcome::NeedMore);
        assert_eq!(buf.append(&[3, 4]).unwrap(), AppendOutcome::Complete);
        let value = buf.take_value(DataType::UInt32).unwrap();
        assert_eq!(value, BasicValue::UInt32(u32::from_le_bytes([1, 2, 3, 4])));
    }

    #[test]
    fn download_rejects_overrun() {
        let buf = SdoBuffer::new();
        buf.start(Some(2));
        assert_eq!(
            buf.append(&[1, 2, 3]),
            Err(AbortCode::DataTypeMismatchLengthHigh)
        );
    }

    #[test]
    fn streaming_download_finishes_on_signal() {
        let buf = SdoBuffer::new();
        buf.start(None);
        assert_eq!(buf.append(&[1, 2, 3]).unwrap(), AppendOutcome::NeedMore);
        buf.finish();
        assert_eq!(buf.take_raw(), vec![1, 2, 3]);
    }

    #[test]
    fn upload_segments_in_chunks() {
        let buf = SdoBuffer::new();
        buf.put_value(BasicValue::UInt32(0xAABBCCDD));
        let (chunk, last) = buf.next_segment(3);
        assert_eq!(chunk, vec![0xDD, 0xCC, 0xBB]);
        assert!(!last);
        let (chunk, last) = buf.next_segment(3);
        assert_eq!(chunk, vec![0xAA]);
        assert!(last);
    }
}
