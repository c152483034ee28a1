//! SDO upload (client reads from server) state machine

use cantata_common::sdo::{AbortCode, BlockSegment, SdoResponse};
use crc16::CrcType as _;

use crate::callbacks::CallbackError;
use crate::sdo_server::{SdoAbort, SdoContext, TransferState};

/// Streaming producer for uploaded data
///
/// When a factory is installed with
/// [`SdoServer::set_upload_handler`](crate::SdoServer::set_upload_handler)
/// and returns a handler for a transfer, the data is pulled from the
/// handler instead of being read out of the dictionary.
pub trait UploadHandler: Send {
    /// The total size of the data, when known up front
    fn size(&self) -> Option<usize> {
        None
    }
    /// Produce the next chunk of up to `size` bytes; an empty chunk marks
    /// the end of the data
    fn on_read(&mut self, size: usize) -> Result<Vec<u8>, CallbackError>;
    /// Called when the transfer completed successfully
    fn on_finish(&mut self) {}
    /// Called when the transfer was aborted
    fn on_abort(&mut self) {}
}

/// Factory deciding per transfer whether to stream
pub type UploadHandlerFactory =
    std::sync::Arc<dyn Fn(u16, u8) -> Option<Box<dyn UploadHandler>> + Send + Sync>;

enum UploadStream {
    Fixed {
        data: Vec<u8>,
        pos: usize,
    },
    Handler {
        handler: Box<dyn UploadHandler>,
        buffer: Vec<u8>,
        size: Option<usize>,
    },
}

impl UploadStream {
    fn size(&self) -> Option<usize> {
        match self {
            UploadStream::Fixed { data, .. } => Some(data.len()),
            UploadStream::Handler { size, .. } => *size,
        }
    }

    /// Top the handler buffer up to `n` bytes (no-op for fixed streams)
    fn fill(&mut self, n: usize) -> Result<(), CallbackError> {
        if let UploadStream::Handler {
            handler, buffer, ..
        } = self
        {
            while buffer.len() < n {
                let chunk = handler.on_read(n - buffer.len())?;
                if chunk.is_empty() {
                    break;
                }
                buffer.extend_from_slice(&chunk);
            }
        }
        Ok(())
    }

    /// Copy up to `n` upcoming bytes without consuming them
    fn peek(&mut self, n: usize) -> Result<Vec<u8>, CallbackError> {
        self.fill(n)?;
        Ok(match self {
            UploadStream::Fixed { data, pos } => {
                data[*pos..data.len().min(*pos + n)].to_vec()
            }
            UploadStream::Handler { buffer, .. } => buffer[..buffer.len().min(n)].to_vec(),
        })
    }

    /// Consume and return up to `n` bytes
    fn read(&mut self, n: usize) -> Result<Vec<u8>, CallbackError> {
        self.fill(n)?;
        Ok(match self {
            UploadStream::Fixed { data, pos } => {
                let end = data.len().min(*pos + n);
                let out = data[*pos..end].to_vec();
                *pos = end;
                out
            }
            UploadStream::Handler { buffer, .. } => {
                let take = buffer.len().min(n);
                buffer.drain(..take).collect()
            }
        })
    }

    fn at_end(&mut self) -> Result<bool, CallbackError> {
        Ok(self.peek(1)?.is_empty())
    }

    fn release(&mut self) {
        if let UploadStream::Handler { handler, .. } = self {
            handler.on_finish();
        }
    }

    fn abort(&mut self) {
        if let UploadStream::Handler { handler, .. } = self {
            handler.on_abort();
        }
    }
}

pub(crate) struct UploadManager {
    factory: Option<UploadHandlerFactory>,
    state: TransferState,
    multiplexor: Option<(u16, u8)>,
    stream: Option<UploadStream>,
    toggle: bool,
    block_size: u8,
    crc: Option<u16>,
    // Bytes acknowledged by the client, for the end-of-block n field
    bytes_confirmed: usize,
}

impl UploadManager {
    pub fn new() -> Self {
        Self {
            factory: None,
            state: TransferState::Idle,
            multiplexor: None,
            stream: None,
            toggle: false,
            block_size: 0,
            crc: None,
            bytes_confirmed: 0,
        }
    }

    pub fn set_factory(&mut self, factory: UploadHandlerFactory) {
        self.factory = Some(factory);
    }

    /// True while block upload frames are expected
    pub fn block_active(&self) -> bool {
        matches!(self.state, TransferState::Block | TransferState::BlockEnd)
    }

    fn abort_transfer(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.abort();
        }
        self.stream = None;
        self.state = TransferState::Idle;
    }

    /// Abandon the transfer and report a failure to the client
    fn fail(&mut self, code: AbortCode) -> SdoAbort {
        let (index, sub) = self.multiplexor.unwrap_or((0, 0));
        self.abort_transfer();
        SdoAbort::at(code, index, sub)
    }

    /// Handle an inbound abort for the given multiplexor
    pub fn on_abort(&mut self, mux: (u16, u8)) {
        if self.state != TransferState::Idle && self.multiplexor == Some(mux) {
            self.abort_transfer();
        }
    }

    /// Resolve the source of the upload: a streaming handler if installed,
    /// otherwise the packed dictionary value
    fn setup(&mut self, ctx: &SdoContext, index: u16, sub: u8) -> Result<(), SdoAbort> {
        let variable = ctx.lookup(index, sub)?;
        if !variable.readable() {
            return Err(SdoAbort::at(AbortCode::WriteOnly, index, sub));
        }
        self.multiplexor = Some((index, sub));

        if let Some(factory) = &self.factory {
            if let Some(handler) = factory(index, sub) {
                let size = handler.size();
                self.stream = Some(UploadStream::Handler {
                    handler,
                    buffer: Vec::new(),
                    size,
                });
                return Ok(());
            }
        }

        let value = ctx
            .od
            .read(index, sub)
            .map_err(|_| SdoAbort::at(AbortCode::CantStore, index, sub))?;
        let data = if variable.datatype.is_numeric() {
            variable
                .pack(&value)
                .map_err(|_| SdoAbort::at(AbortCode::InvalidValue, index, sub))?
        } else {
            value.as_bytes().unwrap_or_default().to_vec()
        };
        self.stream = Some(UploadStream::Fixed { data, pos: 0 });
        Ok(())
    }

    /// ccs=2 (or ccs=5 sub 0): initiate an upload
    ///
    /// A block upload request falls back to the expedited or segmented
    /// protocol when the client's protocol switching threshold permits it.
    pub fn init_upload(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        if self.state != TransferState::Idle {
            // A new init silently abandons the transfer in progress
            self.abort_transfer();
        }

        let index = u16::from_le_bytes([msg[1], msg[2]]);
        let sub = msg[3];

        self.setup(ctx, index, sub)?;
        let size = self.stream.as_ref().and_then(|s| s.size());

        if msg[0] & 0xE3 == 0xA0 {
            // Block upload requested; honored unless the protocol
            // switching threshold covers the whole transfer
            let pst = msg[5] as usize;
            if pst == 0 || size.is_none() || size.unwrap() > pst {
                let blksize = msg[4];
                if blksize == 0 || blksize > 127 {
                    return Err(self.fail(AbortCode::InvalidBlockSize));
                }
                self.state = TransferState::Block;
                self.crc = (msg[0] & 0x04 != 0).then(|| crc16::XMODEM::init());
                self.block_size = blksize;
                self.bytes_confirmed = 0;
                ctx.send(SdoResponse::block_upload_acknowledge(
                    index,
                    sub,
                    size.map(|s| s as u32),
                ));
                return Ok(());
            }
        }

        if let Some(size) = size {
            if size <= 4 {
                let data = match self.stream.as_mut().unwrap().read(4) {
                    Ok(data) => data,
                    Err(_) => return Err(self.fail(AbortCode::CantStore)),
                };
                if let Some(stream) = self.stream.as_mut() {
                    stream.release();
                }
                self.stream = None;
                ctx.send(SdoResponse::expedited_upload(index, sub, &data));
                return Ok(());
            }
        }

        self.state = TransferState::Segment;
        self.toggle = false;
        ctx.send(SdoResponse::upload_acknowledge(
            index,
            sub,
            size.map(|s| s as u32),
        ));
        Ok(())
    }

    /// ccs=3: request for the next upload segment
    pub fn upload_segment(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        if self.state != TransferState::Segment {
            self.abort_transfer();
            return Err(SdoAbort::zero(AbortCode::InvalidCommandSpecifier));
        }

        let toggle = msg[0] & 0x10 != 0;
        if toggle != self.toggle {
            return Err(self.fail(AbortCode::ToggleNotAlternated));
        }
        self.toggle = !self.toggle;

        let data = match self.stream.as_mut().unwrap().read(7) {
            Ok(data) => data,
            Err(_) => return Err(self.fail(AbortCode::CantStore)),
        };
        let last = match self.stream.as_mut().unwrap().at_end() {
            Ok(last) => last,
            Err(_) => return Err(self.fail(AbortCode::CantStore)),
        };

        if last {
            if let Some(stream) = self.stream.as_mut() {
                stream.release();
            }
            self.stream = None;
            self.state = TransferState::Idle;
        }

        ctx.send(SdoResponse::upload_segment(toggle, last, &data));
        Ok(())
    }

    /// A frame received while a block upload is active
    pub fn upload_sub_block(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        if self.state == TransferState::BlockEnd {
            // The client's end-of-block-upload closes the transfer
            if let Some(mut stream) = self.stream.take() {
                stream.release();
            }
            self.state = TransferState::Idle;
            return Ok(());
        }

        match msg[0] & 0x03 {
            2 => {
                // Acknowledge: consume confirmed bytes, then continue
                let ack_seq = msg[1] as usize;
                let blksize = msg[2];

                let data = match self.stream.as_mut().unwrap().read(ack_seq * 7) {
                    Ok(data) => data,
                    Err(_) => return Err(self.fail(AbortCode::CantStore)),
                };
                self.bytes_confirmed += data.len();
                if let Some(crc) = self.crc.as_mut() {
                    *crc = crc16::XMODEM::update(*crc, &data);
                }

                if blksize == 0 || blksize > 127 {
                    return Err(self.fail(AbortCode::InvalidBlockSize));
                }
                self.block_size = blksize;

                let exhausted = match self.stream.as_mut().unwrap().at_end() {
                    Ok(exhausted) => exhausted,
                    Err(_) => return Err(self.fail(AbortCode::CantStore)),
                };
                if exhausted {
                    let n = (7 - self.bytes_confirmed % 7) as u8;
                    let crc = self.crc.map(crc16::XMODEM::get).unwrap_or(0);
                    ctx.send(SdoResponse::BlockUploadEnd { n, crc });
                    self.state = TransferState::BlockEnd;
                    return Ok(());
                }

                self.emit_block(ctx)
            }
            3 => self.emit_block(ctx),
            _ => {
                self.abort_transfer();
                Err(SdoAbort::zero(AbortCode::InvalidCommandSpecifier))
            }
        }
    }

    /// Emit the next run of sequenced segments
    fn emit_block(&mut self, ctx: &SdoContext) -> Result<(), SdoAbort> {
        let block_bytes = self.block_size as usize * 7;
        let chunk = match self.stream.as_mut().unwrap().peek(block_bytes + 1) {
            Ok(chunk) => chunk,
            Err(_) => return Err(self.fail(AbortCode::CantStore)),
        };
        let more_follows = chunk.len() > block_bytes;
        let data = &chunk[..chunk.len().min(block_bytes)];

        if data.is_empty() {
            ctx.send_block_segment(BlockSegment {
                c: true,
                seqnum: 1,
                data: [0; 7],
            });
            return Ok(());
        }

        let segments: Vec<&[u8]> = data.chunks(7).collect();
        for (i, segment) in segments.iter().enumerate() {
            let mut padded = [0u8; 7];
            padded[..segment.len()].copy_from_slice(segment);
            ctx.send_block_segment(BlockSegment {
                c: i == segments.len() - 1 && !more_follows,
                seqnum: i as u8 + 1,
                data: padded,
            });
        }
        Ok(())
    }
}
