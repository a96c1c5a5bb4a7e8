//! SDO server (CiA 301 §7.2.4)
//!
//! A single [`SdoServer`] tracks the state of at most one outstanding transfer: expedited,
//! segmented, or block, in either direction. A node offering multiple concurrent SDO channels
//! (e.g. one per configured server parameter) instantiates one `SdoServer` per channel.
//!
//! The server is CAN-agnostic: it consumes raw 8-byte request payloads and produces
//! [`SdoFrame`]s to be addressed and transmitted by the caller (normally [`crate::dispatcher`]),
//! which knows the transfer's response COB-ID. It is also driven synchronously: no threads,
//! no blocking — [`SdoServer::handle_frame`] is called once per inbound frame and
//! [`SdoServer::poll`] once per tick to expire a stalled transfer.

use std::sync::Arc;

use conop_common::{
    messages::NmtState,
    objects::{ObjectId, SubInfo},
    sdo::{AbortCode, BlockSegment, SdoRequest, SdoResponse},
    value::DataType,
};
use crc16::CrcType as _;

use crate::object_dict::{ObjectAccess, ObjectDictionary};
use crate::sdo_buffer::SdoBuffer;

/// Number of 7-byte sub-blocks offered per block transfer in both directions.
///
/// CiA 301 caps this at 127 (the largest value the 7-bit sequence number field can carry);
/// this core always offers the maximum rather than exposing it as a tunable.
const BLKSIZE: u8 = 127;

/// Bytes buffered in RAM before a download is flushed to the object via the partial-write API,
/// and the unit in which a completed (non-final) download block is flushed. Chosen to match one
/// full block (127 * 7 bytes) so a fully-acknowledged block always flushes exactly once.
const SDO_BUFFER_SIZE: usize = 889;

/// Per-transfer timeout: if no expected frame (or, during a block burst, the completing
/// acknowledgement) arrives within this window of the last one, the transfer aborts.
pub const SDO_TIMEOUT_US: u64 = 1_500_000;

/// A frame emitted by the server: either a normal SDO response, or (during block transfer) a raw
/// block segment. The caller addresses and transmits both the same way.
#[derive(Clone, Copy, Debug)]
pub enum SdoFrame {
    /// A standard SDO server response
    Response(SdoResponse),
    /// A raw upload block segment
    Block(BlockSegment),
}

/// The result of feeding one frame (or a tick) to the server
#[derive(Default)]
pub struct SdoOutcome {
    /// Frames to transmit, in order
    pub frames: Vec<SdoFrame>,
    /// The object a download just finished writing, if any
    pub updated_object: Option<ObjectId>,
}

impl SdoOutcome {
    fn none() -> Self {
        Self::default()
    }

    fn one(frame: SdoFrame) -> Self {
        Self {
            frames: vec![frame],
            updated_object: None,
        }
    }

    fn response(resp: SdoResponse) -> Self {
        Self::one(SdoFrame::Response(resp))
    }

    fn response_with_update(resp: SdoResponse, index: u16, sub: u8) -> Self {
        Self {
            frames: vec![SdoFrame::Response(resp)],
            updated_object: Some(ObjectId::new(index, sub)),
        }
    }

    fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        Self::response(SdoResponse::abort(index, sub, abort_code))
    }
}

fn validate_download_size(dl_size: usize, subinfo: &SubInfo) -> Result<(), AbortCode> {
    if subinfo.data_type.is_str() {
        if dl_size > subinfo.size {
            return Err(AbortCode::DataTypeMismatchLengthHigh);
        }
    } else if dl_size < subinfo.size {
        return Err(AbortCode::DataTypeMismatchLengthLow);
    } else if dl_size > subinfo.size {
        return Err(AbortCode::DataTypeMismatchLengthHigh);
    }
    Ok(())
}

/// Flush whole `SDO_BUFFER_SIZE` chunks out of `buffer` into the object via the partial-write
/// API, so a download larger than the buffer never needs to be held in RAM all at once.
fn stage_download_chunks(
    object: &dyn ObjectAccess,
    sub: u8,
    buffer: &SdoBuffer,
    began_partial: &mut bool,
) -> Result<(), AbortCode> {
    while buffer.len() >= SDO_BUFFER_SIZE {
        if !*began_partial {
            object.begin_partial(sub)?;
            *began_partial = true;
        }
        let (chunk, _) = buffer.next_segment(SDO_BUFFER_SIZE);
        object.write_partial(sub, &chunk)?;
    }
    Ok(())
}

/// Commit the (short, already-flushed-of-whole-chunks) remainder of a completed download.
fn commit_download(
    object: &dyn ObjectAccess,
    sub: u8,
    subinfo: &SubInfo,
    data: Vec<u8>,
    began_partial: bool,
) -> Result<(), AbortCode> {
    let short_string = subinfo.data_type.is_str() && data.len() < subinfo.size;
    if began_partial {
        if !data.is_empty() {
            object.write_partial(sub, &data)?;
        }
        if short_string {
            object.write_partial(sub, &[0])?;
        }
        object.end_partial(sub)
    } else if short_string {
        object.begin_partial(sub)?;
        object.write_partial(sub, &data)?;
        object.write_partial(sub, &[0])?;
        object.end_partial(sub)
    } else {
        object.write(sub, &data)
    }
}

/// Pull the next chunk of upload data into `buffer`, if it has run dry and more remains.
///
/// For objects larger than `SDO_BUFFER_SIZE` this performs more than one `read` over the life of
/// the upload; per [`crate::object_dict`]'s documented caveat, such reads are not atomic and a
/// concurrent write to the object can produce a torn read.
fn refill_upload(
    object: &dyn ObjectAccess,
    sub: u8,
    buffer: &SdoBuffer,
    read_offset: &mut usize,
    total_size: usize,
) -> Result<(), AbortCode> {
    if buffer.is_empty() && *read_offset < total_size {
        let chunk_len = (total_size - *read_offset).min(SDO_BUFFER_SIZE);
        let mut chunk = vec![0u8; chunk_len];
        object.read(sub, *read_offset, &mut chunk)?;
        *read_offset += chunk_len;
        buffer.put_raw(&chunk);
    }
    Ok(())
}

#[derive(Clone)]
struct Transfer {
    object: Arc<dyn ObjectAccess>,
    index: u16,
    sub: u8,
}

#[derive(Clone)]
struct Download {
    xfer: Transfer,
    toggle: bool,
    subinfo: SubInfo,
    began_partial: bool,
}

#[derive(Clone)]
struct Upload {
    xfer: Transfer,
    toggle: bool,
    read_offset: usize,
    total_size: usize,
}

#[derive(Clone)]
struct DownloadBlock {
    xfer: Transfer,
    subinfo: SubInfo,
    client_supports_crc: bool,
    crc: u16,
    /// highest contiguous sequence number accepted in the current block attempt
    last_good: u8,
    /// number of segments seen (accepted or not) in the current block attempt
    seen: u8,
    block_counter: usize,
    began_partial: bool,
}

#[derive(Clone)]
struct EndDownloadBlock {
    xfer: Transfer,
    subinfo: SubInfo,
    client_supports_crc: bool,
    crc: u16,
    last_good: u8,
    block_counter: usize,
    began_partial: bool,
}

#[derive(Clone)]
struct UploadBlockInit {
    xfer: Transfer,
}

#[derive(Clone)]
struct UploadBlockSending {
    xfer: Transfer,
    read_offset: usize,
    total_size: usize,
    crc: u16,
    last_seqnum_sent: u8,
}

enum SdoState {
    Idle,
    DownloadSegmented(Download),
    UploadSegmented(Upload),
    DownloadBlock(DownloadBlock),
    EndDownloadBlock(EndDownloadBlock),
    UploadBlockInit(UploadBlockInit),
    UploadBlockSending(UploadBlockSending),
    EndUploadBlock(Transfer),
}

fn lookup(
    od: &ObjectDictionary,
    index: u16,
    sub: u8,
) -> Result<(Arc<dyn ObjectAccess>, SubInfo), AbortCode> {
    let object = od.get(index).ok_or(AbortCode::NoSuchObject)?;
    let subinfo = object.sub_info(sub)?;
    Ok((object, subinfo))
}

/// Implements one SDO server channel
///
/// Feed it every inbound request frame via [`handle_frame`](Self::handle_frame) and call
/// [`poll`](Self::poll) on every tick so a stalled transfer can time out.
pub struct SdoServer {
    state: SdoState,
    buffer: SdoBuffer,
    deadline_us: Option<u64>,
}

impl Default for SdoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoServer {
    /// Create a new, idle SDO server
    pub fn new() -> Self {
        Self {
            state: SdoState::Idle,
            buffer: SdoBuffer::new(),
            deadline_us: None,
        }
    }

    /// True if a transfer is currently in progress
    pub fn is_busy(&self) -> bool {
        !matches!(self.state, SdoState::Idle)
    }

    fn arm_timeout(&mut self, now_us: u64) {
        self.deadline_us = Some(now_us.saturating_add(SDO_TIMEOUT_US));
    }

    fn goto_idle(&mut self) {
        self.state = SdoState::Idle;
        self.deadline_us = None;
    }

    /// Handle one inbound frame
    ///
    /// `nmt_state` gates per-object access rights that vary with the node's NMT state (e.g. an
    /// object only writable outside Operational); the blanket "Stopped rejects all SDO" rule is
    /// the caller's concern (see [`crate::dispatcher`]), since it applies before a request ever
    /// reaches a specific object.
    pub fn handle_frame(
        &mut self,
        frame: &[u8],
        od: &ObjectDictionary,
        nmt_state: NmtState,
        now_us: u64,
    ) -> SdoOutcome {
        let state = std::mem::replace(&mut self.state, SdoState::Idle);
        let (new_state, outcome) = match state {
            SdoState::Idle => self.on_idle(frame, od, nmt_state),
            SdoState::DownloadSegmented(xfer) => self.on_download_segment(xfer, frame),
            SdoState::UploadSegmented(xfer) => self.on_upload_segment(xfer, frame),
            SdoState::DownloadBlock(xfer) => self.on_block_segment(xfer, frame),
            SdoState::EndDownloadBlock(xfer) => self.on_end_download_block(xfer, frame),
            SdoState::UploadBlockInit(xfer) => self.on_start_block_upload(xfer, frame),
            SdoState::UploadBlockSending(xfer) => self.on_confirm_upload_block(xfer, frame),
            SdoState::EndUploadBlock(xfer) => self.on_end_upload_block(xfer, frame),
        };
        self.state = new_state;
        match &self.state {
            SdoState::Idle => self.deadline_us = None,
            _ => self.arm_timeout(now_us),
        }
        outcome
    }

    /// Expire the in-progress transfer if it has been idle past the SDO timeout
    ///
    /// Returns the abort response to transmit, if a transfer did time out.
    pub fn poll(&mut self, now_us: u64) -> Option<SdoResponse> {
        let deadline = self.deadline_us?;
        if now_us < deadline {
            return None;
        }
        let (index, sub) = match &self.state {
            SdoState::Idle => return None,
            SdoState::DownloadSegmented(d) => (d.xfer.index, d.xfer.sub),
            SdoState::UploadSegmented(u) => (u.xfer.index, u.xfer.sub),
            SdoState::DownloadBlock(b) => (b.xfer.index, b.xfer.sub),
            SdoState::EndDownloadBlock(b) => (b.xfer.index, b.xfer.sub),
            SdoState::UploadBlockInit(b) => (b.xfer.index, b.xfer.sub),
            SdoState::UploadBlockSending(b) => (b.xfer.index, b.xfer.sub),
            SdoState::EndUploadBlock(t) => (t.index, t.sub),
        };
        self.goto_idle();
        Some(SdoResponse::abort(index, sub, AbortCode::SdoTimeout))
    }

    fn on_idle(
        &mut self,
        frame: &[u8],
        od: &ObjectDictionary,
        nmt_state: NmtState,
    ) -> (SdoState, SdoOutcome) {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(abort_code) => return (SdoState::Idle, SdoOutcome::abort(0, 0, abort_code)),
        };
        match req {
            SdoRequest::InitiateUpload { index, sub } => {
                let (object, subinfo) = match lookup(od, index, sub) {
                    Ok(v) => v,
                    Err(e) => return (SdoState::Idle, SdoOutcome::abort(index, sub, e)),
                };
                if !subinfo.access_type.is_readable_in(nmt_state) {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, AbortCode::WriteOnly));
                }
                let current_size = match object.current_size(sub) {
                    Ok(s) => s,
                    Err(e) => return (SdoState::Idle, SdoOutcome::abort(index, sub, e)),
                };
                if current_size <= 4 {
                    let mut buf = [0u8; 4];
                    if let Err(e) = object.read(sub, 0, &mut buf[..current_size]) {
                        return (SdoState::Idle, SdoOutcome::abort(index, sub, e));
                    }
                    (
                        SdoState::Idle,
                        SdoOutcome::response(SdoResponse::expedited_upload(
                            index,
                            sub,
                            &buf[..current_size],
                        )),
                    )
                } else {
                    self.buffer.start(Some(current_size));
                    let xfer = Transfer { object, index, sub };
                    let mut read_offset = 0;
                    if let Err(e) =
                        refill_upload(xfer.object.as_ref(), sub, &self.buffer, &mut read_offset, current_size)
                    {
                        return (SdoState::Idle, SdoOutcome::abort(index, sub, e));
                    }
                    (
                        SdoState::UploadSegmented(Upload {
                            xfer,
                            toggle: false,
                            read_offset,
                            total_size: current_size,
                        }),
                        SdoOutcome::response(SdoResponse::upload_acknowledge(
                            index,
                            sub,
                            Some(current_size as u32),
                        )),
                    )
                }
            }
            SdoRequest::InitiateDownload { n, e, s, index, sub, data } => {
                let (object, subinfo) = match lookup(od, index, sub) {
                    Ok(v) => v,
                    Err(e) => return (SdoState::Idle, SdoOutcome::abort(index, sub, e)),
                };
                if !subinfo.access_type.is_writable_in(nmt_state) {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, AbortCode::ReadOnly));
                }
                if e {
                    let dl_size = 4 - n as usize;
                    if let Err(abort_code) = validate_download_size(dl_size, &subinfo) {
                        return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                    }
                    if let Err(abort_code) =
                        commit_download(object.as_ref(), sub, &subinfo, data[..dl_size].to_vec(), false)
                    {
                        return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                    }
                    (
                        SdoState::Idle,
                        SdoOutcome::response_with_update(
                            SdoResponse::download_acknowledge(index, sub),
                            index,
                            sub,
                        ),
                    )
                } else {
                    if s {
                        let dl_size = u32::from_le_bytes(data) as usize;
                        if let Err(abort_code) = validate_download_size(dl_size, &subinfo) {
                            return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                        }
                        self.buffer.start(Some(dl_size));
                    } else {
                        self.buffer.start(None);
                    }
                    let xfer = Transfer { object, index, sub };
                    (
                        SdoState::DownloadSegmented(Download {
                            xfer,
                            toggle: false,
                            subinfo,
                            began_partial: false,
                        }),
                        SdoOutcome::response(SdoResponse::download_acknowledge(index, sub)),
                    )
                }
            }
            SdoRequest::InitiateBlockDownload { cc, s, index, sub, size } => {
                let (object, subinfo) = match lookup(od, index, sub) {
                    Ok(v) => v,
                    Err(e) => return (SdoState::Idle, SdoOutcome::abort(index, sub, e)),
                };
                if !subinfo.access_type.is_writable_in(nmt_state) {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, AbortCode::ReadOnly));
                }
                if s {
                    if let Err(abort_code) = validate_download_size(size as usize, &subinfo) {
                        return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                    }
                    self.buffer.start(Some(size as usize));
                } else {
                    self.buffer.start(None);
                }
                let xfer = Transfer { object, index, sub };
                (
                    SdoState::DownloadBlock(DownloadBlock {
                        xfer,
                        subinfo,
                        client_supports_crc: cc,
                        crc: crc16::XMODEM::init(),
                        last_good: 0,
                        seen: 0,
                        block_counter: 0,
                        began_partial: false,
                    }),
                    SdoOutcome::response(SdoResponse::block_download_acknowledge(
                        true, index, sub, BLKSIZE,
                    )),
                )
            }
            SdoRequest::InitiateBlockUpload { index, sub, .. } => {
                let (object, subinfo) = match lookup(od, index, sub) {
                    Ok(v) => v,
                    Err(e) => return (SdoState::Idle, SdoOutcome::abort(index, sub, e)),
                };
                if !subinfo.access_type.is_readable_in(nmt_state) {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, AbortCode::WriteOnly));
                }
                let current_size = match object.current_size(sub) {
                    Ok(s) => s,
                    Err(e) => return (SdoState::Idle, SdoOutcome::abort(index, sub, e)),
                };
                let xfer = Transfer { object, index, sub };
                (
                    SdoState::UploadBlockInit(UploadBlockInit { xfer }),
                    SdoOutcome::response(SdoResponse::ConfirmBlockUpload {
                        sc: true,
                        s: true,
                        index,
                        sub,
                        size: current_size as u32,
                    }),
                )
            }
            SdoRequest::Abort { .. } => (SdoState::Idle, SdoOutcome::none()),
            _ => (SdoState::Idle, SdoOutcome::abort(0, 0, AbortCode::InvalidCommandSpecifier)),
        }
    }

    fn on_download_segment(&mut self, xfer: Download, frame: &[u8]) -> (SdoState, SdoOutcome) {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(abort_code) => {
                return (
                    SdoState::Idle,
                    SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, abort_code),
                )
            }
        };
        match req {
            SdoRequest::DownloadSegment { t, n, c, data } => {
                let Download { xfer: base, toggle, subinfo, mut began_partial } = xfer;
                let index = base.index;
                let sub = base.sub;
                if t != toggle {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, AbortCode::ToggleNotAlternated));
                }
                let segment_size = 7 - n as usize;
                if let Err(abort_code) = self.buffer.append(&data[..segment_size]) {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                }
                if let Err(abort_code) =
                    stage_download_chunks(base.object.as_ref(), sub, &self.buffer, &mut began_partial)
                {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                }
                if c {
                    if self.buffer.total_size().is_none() {
                        self.buffer.finish();
                    }
                    let data = self.buffer.take_raw();
                    if let Err(abort_code) =
                        commit_download(base.object.as_ref(), sub, &subinfo, data, began_partial)
                    {
                        return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                    }
                    (
                        SdoState::Idle,
                        SdoOutcome::response_with_update(
                            SdoResponse::download_segment_acknowledge(t),
                            index,
                            sub,
                        ),
                    )
                } else {
                    (
                        SdoState::DownloadSegmented(Download {
                            xfer: base,
                            toggle: !t,
                            subinfo,
                            began_partial,
                        }),
                        SdoOutcome::response(SdoResponse::download_segment_acknowledge(t)),
                    )
                }
            }
            SdoRequest::Abort { .. } => (SdoState::Idle, SdoOutcome::none()),
            _ => (
                SdoState::Idle,
                SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, AbortCode::InvalidCommandSpecifier),
            ),
        }
    }

    fn on_upload_segment(&mut self, xfer: Upload, frame: &[u8]) -> (SdoState, SdoOutcome) {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(abort_code) => {
                return (
                    SdoState::Idle,
                    SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, abort_code),
                )
            }
        };
        match req {
            SdoRequest::ReqUploadSegment { t } => {
                let Upload { xfer: base, toggle, mut read_offset, total_size } = xfer;
                let index = base.index;
                let sub = base.sub;
                if t != toggle {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, AbortCode::ToggleNotAlternated));
                }
                if let Err(abort_code) =
                    refill_upload(base.object.as_ref(), sub, &self.buffer, &mut read_offset, total_size)
                {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                }
                let (chunk, _) = self.buffer.next_segment(7);
                let done = self.buffer.is_empty() && read_offset >= total_size;
                let resp = SdoResponse::upload_segment(t, done, &chunk);
                if done {
                    (SdoState::Idle, SdoOutcome::response(resp))
                } else {
                    (
                        SdoState::UploadSegmented(Upload {
                            xfer: base,
                            toggle: !t,
                            read_offset,
                            total_size,
                        }),
                        SdoOutcome::response(resp),
                    )
                }
            }
            SdoRequest::Abort { .. } => (SdoState::Idle, SdoOutcome::none()),
            _ => (
                SdoState::Idle,
                SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, AbortCode::InvalidCommandSpecifier),
            ),
        }
    }

    fn on_block_segment(&mut self, mut xfer: DownloadBlock, frame: &[u8]) -> (SdoState, SdoOutcome) {
        // An abort frame can arrive mid-block; it is indistinguishable from a block segment with
        // seqnum 0, which the protocol otherwise never sends, so that byte pattern is reserved for it.
        if frame.first() == Some(&0x80) {
            if let Ok(SdoRequest::Abort { .. }) = SdoRequest::try_from(frame) {
                return (SdoState::Idle, SdoOutcome::none());
            }
        }
        let segment = match BlockSegment::try_from(frame) {
            Ok(s) => s,
            Err(_) => {
                return (
                    SdoState::Idle,
                    SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, AbortCode::InvalidSequenceNumber),
                )
            }
        };
        xfer.seen = xfer.seen.saturating_add(1);
        if segment.seqnum == xfer.last_good + 1 {
            xfer.last_good = segment.seqnum;
            if let Err(abort_code) = self.buffer.append(&segment.data) {
                return (SdoState::Idle, SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, abort_code));
            }
            xfer.crc = crc16::XMODEM::update(xfer.crc, &segment.data);
        }
        let block_done = segment.c || xfer.seen >= BLKSIZE;
        if !block_done {
            return (SdoState::DownloadBlock(xfer), SdoOutcome::none());
        }

        let index = xfer.xfer.index;
        let sub = xfer.xfer.sub;
        if segment.c && xfer.last_good == xfer.seen {
            // Every segment of the final block arrived; wait for the end-download request, which
            // carries the count of invalid trailing bytes in the last segment.
            (
                SdoState::EndDownloadBlock(EndDownloadBlock {
                    xfer: xfer.xfer,
                    subinfo: xfer.subinfo,
                    client_supports_crc: xfer.client_supports_crc,
                    crc: xfer.crc,
                    last_good: xfer.last_good,
                    block_counter: xfer.block_counter + 1,
                    began_partial: xfer.began_partial,
                }),
                SdoOutcome::response(SdoResponse::confirm_block(xfer.last_good, BLKSIZE)),
            )
        } else if xfer.last_good == xfer.seen {
            // A full, fully-contiguous block: flush it and start the next one.
            if let Err(abort_code) =
                stage_download_chunks(xfer.xfer.object.as_ref(), sub, &self.buffer, &mut xfer.began_partial)
            {
                return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
            }
            let ackseq = xfer.last_good;
            (
                SdoState::DownloadBlock(DownloadBlock {
                    last_good: 0,
                    seen: 0,
                    block_counter: xfer.block_counter + 1,
                    ..xfer
                }),
                SdoOutcome::response(SdoResponse::confirm_block(ackseq, BLKSIZE)),
            )
        } else {
            // A gap was detected partway through the block: NAK back to the last good segment and
            // let the client resend from there within the same block attempt.
            let ackseq = xfer.last_good;
            (
                SdoState::DownloadBlock(DownloadBlock {
                    seen: xfer.last_good,
                    ..xfer
                }),
                SdoOutcome::response(SdoResponse::confirm_block(ackseq, BLKSIZE)),
            )
        }
    }

    fn on_end_download_block(
        &mut self,
        xfer: EndDownloadBlock,
        frame: &[u8],
    ) -> (SdoState, SdoOutcome) {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(abort_code) => {
                return (SdoState::Idle, SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, abort_code))
            }
        };
        match req {
            SdoRequest::EndBlockDownload { n, crc } => {
                let index = xfer.xfer.index;
                let sub = xfer.xfer.sub;
                let mut data = self.buffer.take_raw();
                let valid_len = data.len().saturating_sub(n as usize);
                let trailing = data.split_off(valid_len);
                let final_crc = crc16::XMODEM::get(crc16::XMODEM::update(xfer.crc, &data));
                if xfer.client_supports_crc && final_crc != crc {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, AbortCode::CrcError));
                }
                let _ = trailing;
                if let Err(abort_code) =
                    commit_download(xfer.xfer.object.as_ref(), sub, &xfer.subinfo, data, xfer.began_partial)
                {
                    return (SdoState::Idle, SdoOutcome::abort(index, sub, abort_code));
                }
                (
                    SdoState::Idle,
                    SdoOutcome::response_with_update(SdoResponse::ConfirmBlockDownloadEnd, index, sub),
                )
            }
            SdoRequest::Abort { .. } => (SdoState::Idle, SdoOutcome::none()),
            _ => (
                SdoState::Idle,
                SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, AbortCode::InvalidCommandSpecifier),
            ),
        }
    }

    fn on_start_block_upload(
        &mut self,
        xfer: UploadBlockInit,
        frame: &[u8],
    ) -> (SdoState, SdoOutcome) {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(abort_code) => {
                return (SdoState::Idle, SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, abort_code))
            }
        };
        match req {
            SdoRequest::StartBlockUpload => {
                let index = xfer.xfer.index;
                let sub = xfer.xfer.sub;
                let total_size = match xfer.xfer.object.current_size(sub) {
                    Ok(s) => s,
                    Err(e) => return (SdoState::Idle, SdoOutcome::abort(index, sub, e)),
                };
                self.buffer.start(Some(total_size));
                self.send_upload_block(UploadBlockSending {
                    xfer: xfer.xfer,
                    read_offset: 0,
                    total_size,
                    crc: crc16::XMODEM::init(),
                    last_seqnum_sent: 0,
                })
            }
            SdoRequest::Abort { .. } => (SdoState::Idle, SdoOutcome::none()),
            _ => (
                SdoState::Idle,
                SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, AbortCode::InvalidCommandSpecifier),
            ),
        }
    }

    /// Send (or resume sending) a burst of up to `BLKSIZE` segments for an upload block.
    fn send_upload_block(&mut self, mut xfer: UploadBlockSending) -> (SdoState, SdoOutcome) {
        let sub = xfer.xfer.sub;
        let mut frames = Vec::new();
        let mut seqnum = 0u8;
        while seqnum < BLKSIZE {
            if let Err(abort_code) = refill_upload(
                xfer.xfer.object.as_ref(),
                sub,
                &self.buffer,
                &mut xfer.read_offset,
                xfer.total_size,
            ) {
                return (
                    SdoState::Idle,
                    SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, abort_code),
                );
            }
            if self.buffer.is_empty() {
                break;
            }
            let (chunk, _) = self.buffer.next_segment(7);
            xfer.crc = crc16::XMODEM::update(xfer.crc, &chunk);
            seqnum += 1;
            let done = self.buffer.is_empty() && xfer.read_offset >= xfer.total_size;
            let mut data = [0u8; 7];
            data[..chunk.len()].copy_from_slice(&chunk);
            frames.push(SdoFrame::Block(BlockSegment { c: done, seqnum, data }));
            if done {
                break;
            }
        }
        xfer.last_seqnum_sent = seqnum;
        (
            SdoState::UploadBlockSending(xfer),
            SdoOutcome { frames, updated_object: None },
        )
    }

    fn on_confirm_upload_block(
        &mut self,
        xfer: UploadBlockSending,
        frame: &[u8],
    ) -> (SdoState, SdoOutcome) {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(abort_code) => {
                return (SdoState::Idle, SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, abort_code))
            }
        };
        match req {
            SdoRequest::ConfirmBlock { ackseq, .. } => {
                let index = xfer.xfer.index;
                let sub = xfer.xfer.sub;
                if ackseq != xfer.last_seqnum_sent {
                    // A gap in the client's reception is not recoverable in this implementation;
                    // the transfer is aborted rather than re-reading and resending stale segments.
                    return (
                        SdoState::Idle,
                        SdoOutcome::abort(index, sub, AbortCode::InvalidSequenceNumber),
                    );
                }
                let upload_done = self.buffer.is_empty() && xfer.read_offset >= xfer.total_size;
                if upload_done {
                    let n = ((7 - xfer.total_size % 7) % 7) as u8;
                    let crc = crc16::XMODEM::get(xfer.crc);
                    (
                        SdoState::EndUploadBlock(xfer.xfer),
                        SdoOutcome::response(SdoResponse::BlockUploadEnd { n, crc }),
                    )
                } else {
                    self.send_upload_block(xfer)
                }
            }
            SdoRequest::Abort { .. } => (SdoState::Idle, SdoOutcome::none()),
            _ => (
                SdoState::Idle,
                SdoOutcome::abort(xfer.xfer.index, xfer.xfer.sub, AbortCode::InvalidCommandSpecifier),
            ),
        }
    }

    fn on_end_upload_block(&mut self, xfer: Transfer, frame: &[u8]) -> (SdoState, SdoOutcome) {
        let req = match SdoRequest::try_from(frame) {
            Ok(req) => req,
            Err(abort_code) => return (SdoState::Idle, SdoOutcome::abort(xfer.index, xfer.sub, abort_code)),
        };
        match req {
            SdoRequest::EndBlockUpload => (SdoState::Idle, SdoOutcome::none()),
            SdoRequest::Abort { .. } => (SdoState::Idle, SdoOutcome::none()),
            _ => (
                SdoState::Idle,
                SdoOutcome::abort(xfer.index, xfer.sub, AbortCode::InvalidCommandSpecifier),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conop_common::objects::{AccessType, ObjectCode};
    use conop_common::value::DataType;

    use super::*;
    use crate::object_dict::{ByteField, NullTermByteField, ObjectDictionary, ProvidesSubObjects, ScalarField, SubObjectAccess};

    const STR_LEN: usize = 16;

    struct TestObject {
        value: ScalarField<u32>,
        name: NullTermByteField<STR_LEN>,
        blob: ByteField<2000>,
    }

    impl ProvidesSubObjects for TestObject {
        fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
            match sub {
                1 => Some((SubInfo::new_u32().rw_access(), &self.value)),
                2 => Some((
                    SubInfo {
                        size: STR_LEN,
                        data_type: DataType::VisibleString,
                        access_type: AccessType::Rw,
                        ..Default::default()
                    },
                    &self.name,
                )),
                3 => Some((
                    SubInfo {
                        size: 2000,
                        data_type: DataType::OctetString,
                        access_type: AccessType::Rw,
                        ..Default::default()
                    },
                    &self.blob,
                )),
                _ => None,
            }
        }

        fn object_code(&self) -> ObjectCode {
            ObjectCode::Record
        }
    }

    fn test_od() -> ObjectDictionary {
        let od = ObjectDictionary::new();
        od.insert_object(
            0x2000,
            Arc::new(TestObject {
                value: ScalarField::new(0),
                name: NullTermByteField::new([0; STR_LEN]),
                blob: ByteField::new([0; 2000]),
            }),
        )
        .unwrap();
        od
    }

    fn frames_from(outcome: &SdoOutcome) -> Vec<SdoResponse> {
        outcome
            .frames
            .iter()
            .filter_map(|f| match f {
                SdoFrame::Response(r) => Some(*r),
                SdoFrame::Block(_) => None,
            })
            .collect()
    }

    #[test]
    fn expedited_download_and_upload_round_trip() {
        let od = test_od();
        let mut server = SdoServer::new();

        let req = SdoRequest::expedited_download(0x2000, 1, &42u32.to_le_bytes()).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::download_acknowledge(0x2000, 1)]
        );
        assert_eq!(outcome.updated_object, Some(ObjectId::new(0x2000, 1)));
        assert!(!server.is_busy());

        let req = SdoRequest::initiate_upload(0x2000, 1).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::expedited_upload(0x2000, 1, &42u32.to_le_bytes())]
        );
    }

    #[test]
    fn segmented_upload_of_string() {
        let od = test_od();
        let mut server = SdoServer::new();

        // Pre-load the object with a 10-byte value via expedited-style direct download path
        let req = SdoRequest::initiate_download(0x2000, 2, Some(10)).to_bytes();
        server.handle_frame(&req, &od, NmtState::Operational, 0);
        let req = SdoRequest::download_segment(false, false, b"HELLOWO").to_bytes();
        server.handle_frame(&req, &od, NmtState::Operational, 0);
        let req = SdoRequest::download_segment(true, true, b"RLD").to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(outcome.updated_object, Some(ObjectId::new(0x2000, 2)));

        let req = SdoRequest::initiate_upload(0x2000, 2).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::upload_acknowledge(0x2000, 2, Some(10))]
        );

        let req = SdoRequest::upload_segment_request(false).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::upload_segment(false, false, b"HELLOWO")]
        );

        let req = SdoRequest::upload_segment_request(true).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::upload_segment(true, true, b"RLD")]
        );
        assert!(!server.is_busy());
    }

    #[test]
    fn toggle_mismatch_aborts() {
        let od = test_od();
        let mut server = SdoServer::new();
        let req = SdoRequest::initiate_download(0x2000, 2, Some(10)).to_bytes();
        server.handle_frame(&req, &od, NmtState::Operational, 0);
        // Send with toggle=true when 0 was expected
        let req = SdoRequest::download_segment(true, false, b"HELLOWO").to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::abort(0x2000, 2, AbortCode::ToggleNotAlternated)]
        );
        assert!(!server.is_busy());
    }

    #[test]
    fn block_download_round_trip_with_crc() {
        let od = test_od();
        let mut server = SdoServer::new();
        let data: Vec<u8> = (0..500u32).map(|x| (x % 256) as u8).collect();
        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);

        let req = SdoRequest::initiate_block_download(0x2000, 3, true, data.len() as u32).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::block_download_acknowledge(true, 0x2000, 3, BLKSIZE)]
        );

        let mut pos = 0;
        let mut seqnum = 0u8;
        while pos < data.len() {
            let len = (data.len() - pos).min(7);
            let mut chunk = [0u8; 7];
            chunk[..len].copy_from_slice(&data[pos..pos + len]);
            pos += len;
            seqnum += 1;
            let c = pos == data.len();
            let frame = BlockSegment { c, seqnum, data: chunk }.to_bytes();
            let outcome = server.handle_frame(&frame, &od, NmtState::Operational, 0);
            if c {
                assert_eq!(
                    frames_from(&outcome),
                    vec![SdoResponse::confirm_block(seqnum, BLKSIZE)]
                );
            }
        }

        let n = ((7 - data.len() % 7) % 7) as u8;
        let req = SdoRequest::end_block_download(n, crc).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(frames_from(&outcome), vec![SdoResponse::ConfirmBlockDownloadEnd]);
        assert_eq!(outcome.updated_object, Some(ObjectId::new(0x2000, 3)));
        assert!(!server.is_busy());
    }

    #[test]
    fn block_download_crc_mismatch_aborts() {
        let od = test_od();
        let mut server = SdoServer::new();
        let data = vec![1u8, 2, 3, 4, 5];

        let req = SdoRequest::initiate_block_download(0x2000, 3, true, data.len() as u32).to_bytes();
        server.handle_frame(&req, &od, NmtState::Operational, 0);

        let mut chunk = [0u8; 7];
        chunk[..data.len()].copy_from_slice(&data);
        let frame = BlockSegment { c: true, seqnum: 1, data: chunk }.to_bytes();
        server.handle_frame(&frame, &od, NmtState::Operational, 0);

        let n = (7 - data.len()) as u8;
        let req = SdoRequest::end_block_download(n, 0xBAAD).to_bytes();
        let outcome = server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert_eq!(
            frames_from(&outcome),
            vec![SdoResponse::abort(0x2000, 3, AbortCode::CrcError)]
        );
        assert!(!server.is_busy());
    }

    #[test]
    fn timeout_aborts_stalled_transfer() {
        let od = test_od();
        let mut server = SdoServer::new();
        let req = SdoRequest::initiate_download(0x2000, 2, Some(10)).to_bytes();
        server.handle_frame(&req, &od, NmtState::Operational, 0);
        assert!(server.is_busy());
        assert!(server.poll(SDO_TIMEOUT_US - 1).is_none());
        let resp = server.poll(SDO_TIMEOUT_US + 1);
        assert_eq!(resp, Some(SdoResponse::abort(0x2000, 2, AbortCode::SdoTimeout)));
        assert!(!server.is_busy());
    }
}
