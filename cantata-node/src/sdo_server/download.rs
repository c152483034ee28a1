//! SDO download (client writes to server) state machine

use cantata_common::sdo::AbortCode;
use cantata_common::sdo::SdoResponse;
use crc16::CrcType as _;

use crate::callbacks::CallbackError;
use crate::object_dict::OdError;
use crate::sdo_server::{SdoAbort, SdoContext, TransferState, BLKSIZE};

/// Streaming consumer for downloaded data
///
/// When a factory is installed with
/// [`SdoServer::set_download_handler`](crate::SdoServer::set_download_handler)
/// and returns a handler for a transfer, the data bypasses the dictionary
/// and is fed to the handler chunk by chunk instead.
pub trait DownloadHandler: Send {
    /// Called for each chunk of received data, in order
    fn on_receive(&mut self, data: &[u8]) -> Result<(), CallbackError>;
    /// Called when the transfer completed successfully
    fn on_finish(&mut self) -> Result<(), CallbackError>;
    /// Called when the transfer was aborted
    fn on_abort(&mut self);
}

/// Factory deciding per transfer whether to stream
///
/// Called with (index, sub, announced size); returning None stores to the
/// dictionary as usual.
pub type DownloadHandlerFactory =
    std::sync::Arc<dyn Fn(u16, u8, Option<usize>) -> Option<Box<dyn DownloadHandler>> + Send + Sync>;

/// Decode a completed download buffer against the target variable
///
/// Clients may expedite fewer bytes than the numeric datatype holds; the
/// value is sign- or zero-extended so the range check sees the intended
/// number. Overlong buffers are a genuine size mismatch.
fn decode_buffer(
    variable: &crate::object_dict::Variable,
    buffer: &[u8],
) -> Result<cantata_common::datatypes::Value, cantata_common::datatypes::CodecError> {
    use cantata_common::datatypes::DataType;

    if let Some(size) = variable.size() {
        if buffer.len() < size {
            let signed = matches!(
                variable.datatype,
                DataType::Integer8 | DataType::Integer16 | DataType::Integer32 | DataType::Integer64
            );
            let fill = if signed && buffer.last().is_some_and(|b| b & 0x80 != 0) {
                0xFF
            } else {
                0x00
            };
            let mut extended = buffer.to_vec();
            extended.resize(size, fill);
            return variable.unpack(&extended);
        }
    }
    variable.unpack(buffer)
}

pub(crate) struct DownloadManager {
    factory: Option<DownloadHandlerFactory>,
    handler: Option<Box<dyn DownloadHandler>>,
    state: TransferState,
    multiplexor: Option<(u16, u8)>,
    buffer: Vec<u8>,
    toggle: bool,
    sequence: u8,
    crc: Option<u16>,
}

impl DownloadManager {
    pub fn new() -> Self {
        Self {
            factory: None,
            handler: None,
            state: TransferState::Idle,
            multiplexor: None,
            buffer: Vec::new(),
            toggle: false,
            sequence: 1,
            crc: None,
        }
    }

    pub fn set_factory(&mut self, factory: DownloadHandlerFactory) {
        self.factory = Some(factory);
    }

    /// True while sequenced block segments are expected
    pub fn block_active(&self) -> bool {
        self.state == TransferState::Block
    }

    fn begin(&mut self, new_state: TransferState) {
        self.state = new_state;
        self.handler = None;
        self.sequence = 1;
        self.toggle = false;
        self.crc = None;
        self.buffer.clear();
    }

    /// Abandon the transfer in progress, notifying the handler
    fn abort_transfer(&mut self) {
        if let Some(handler) = self.handler.as_mut() {
            handler.on_abort();
        }
        self.begin(TransferState::Idle);
    }

    /// Handle an inbound abort for the given multiplexor
    pub fn on_abort(&mut self, mux: (u16, u8)) {
        if self.state != TransferState::Idle && self.multiplexor == Some(mux) {
            self.abort_transfer();
        }
    }

    fn receive(&mut self, data: &[u8]) -> Result<(), SdoAbort> {
        if let Some(handler) = self.handler.as_mut() {
            if handler.on_receive(data).is_err() {
                let (index, sub) = self.multiplexor.unwrap_or((0, 0));
                self.abort_transfer();
                return Err(SdoAbort::at(AbortCode::CantStore, index, sub));
            }
        } else {
            self.buffer.extend_from_slice(data);
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &SdoContext) -> Result<(), SdoAbort> {
        let result = self.finish_inner(ctx);
        self.begin(TransferState::Idle);
        result
    }

    fn finish_inner(&mut self, ctx: &SdoContext) -> Result<(), SdoAbort> {
        let (index, sub) = self.multiplexor.unwrap_or((0, 0));

        if let Some(handler) = self.handler.as_mut() {
            return handler
                .on_finish()
                .map_err(|_| SdoAbort::at(AbortCode::CantStore, index, sub));
        }

        let variable = ctx.lookup(index, sub)?;
        let value = decode_buffer(&variable, &self.buffer)
            .map_err(|_| SdoAbort::at(AbortCode::DataTypeMismatch, index, sub))?;

        // Range enforcement happens here, at the protocol edge
        if let Some(v) = value.as_f64() {
            if let Some(minimum) = variable.minimum {
                if v < minimum {
                    return Err(SdoAbort::at(AbortCode::ValueTooLow, index, sub));
                }
            }
            if let Some(maximum) = variable.maximum {
                if v > maximum {
                    return Err(SdoAbort::at(AbortCode::ValueTooHigh, index, sub));
                }
            }
        }

        ctx.od
            .write(index, sub, value, true)
            .map_err(|e| match e {
                OdError::TypeMismatch { .. } => {
                    SdoAbort::at(AbortCode::DataTypeMismatch, index, sub)
                }
                _ => SdoAbort::at(AbortCode::CantStore, index, sub),
            })
    }

    /// ccs=1: initiate an expedited or segmented download
    pub fn init_download(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        if self.state != TransferState::Idle {
            // A new init silently abandons the transfer in progress
            self.abort_transfer();
        }

        let cmd = msg[0];
        let index = u16::from_le_bytes([msg[1], msg[2]]);
        let sub = msg[3];

        let variable = ctx.lookup(index, sub)?;
        if !variable.writable() {
            return Err(SdoAbort::at(AbortCode::ReadOnly, index, sub));
        }

        if cmd & 0x02 == 0 {
            // Segmented transfer
            self.begin(TransferState::Segment);
            self.multiplexor = Some((index, sub));

            let size = if cmd & 0x01 != 0 {
                Some(u32::from_le_bytes(msg[4..8].try_into().unwrap()) as usize)
            } else {
                None
            };
            if let Some(factory) = &self.factory {
                self.handler = factory(index, sub, size);
            }
            ctx.send(SdoResponse::download_acknowledge(index, sub));
            return Ok(());
        }

        // Expedited transfer; without the size bit the data length falls
        // back to the target's datatype size
        let size = if cmd & 0x01 != 0 {
            4 - ((cmd >> 2) & 0x03) as usize
        } else {
            variable.size().unwrap_or(4).min(4)
        };

        self.begin(TransferState::Idle);
        self.multiplexor = Some((index, sub));
        if let Some(factory) = &self.factory {
            self.handler = factory(index, sub, Some(size));
        }

        self.receive(&msg[4..4 + size])?;
        self.finish(ctx)?;
        ctx.send(SdoResponse::download_acknowledge(index, sub));
        Ok(())
    }

    /// ccs=0: one segment of a segmented download
    pub fn download_segment(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        if self.state != TransferState::Segment {
            self.abort_transfer();
            return Err(SdoAbort::zero(AbortCode::InvalidCommandSpecifier));
        }
        let (index, sub) = self.multiplexor.unwrap_or((0, 0));

        let toggle = msg[0] & 0x10 != 0;
        if toggle != self.toggle {
            self.abort_transfer();
            return Err(SdoAbort::at(AbortCode::ToggleNotAlternated, index, sub));
        }
        self.toggle = !self.toggle;

        let size = 7 - ((msg[0] & 0x0E) >> 1) as usize;
        self.receive(&msg[1..1 + size])?;

        if msg[0] & 0x01 != 0 {
            self.finish(ctx)?;
        }
        ctx.send(SdoResponse::download_segment_acknowledge(toggle));
        Ok(())
    }

    /// ccs=6, bit 0 clear: initiate a block download
    pub fn download_block_init(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        if self.state != TransferState::Idle {
            self.abort_transfer();
        }

        let cmd = msg[0];
        let index = u16::from_le_bytes([msg[1], msg[2]]);
        let sub = msg[3];

        let variable = ctx.lookup(index, sub)?;
        if !variable.writable() {
            return Err(SdoAbort::at(AbortCode::ReadOnly, index, sub));
        }

        self.begin(TransferState::Block);
        self.multiplexor = Some((index, sub));
        self.crc = (cmd & 0x04 != 0).then(|| crc16::XMODEM::init());

        let size = if cmd & 0x02 != 0 {
            Some(u32::from_le_bytes(msg[4..8].try_into().unwrap()) as usize)
        } else {
            None
        };
        if let Some(factory) = &self.factory {
            self.handler = factory(index, sub, size);
        }

        ctx.send(SdoResponse::block_download_acknowledge(
            true, index, sub, BLKSIZE,
        ));
        Ok(())
    }

    /// A sequenced segment while a block download is active
    pub fn download_sub_block(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        let (index, sub) = self.multiplexor.unwrap_or((0, 0));

        let sequence = msg[0] & 0x7F;
        if sequence != self.sequence {
            self.abort_transfer();
            return Err(SdoAbort::at(AbortCode::InvalidSequenceNumber, index, sub));
        }

        let last_sub_block = msg[0] & 0x80 != 0;
        let data = &msg[1..8];

        if !last_sub_block {
            if let Some(crc) = self.crc.as_mut() {
                *crc = crc16::XMODEM::update(*crc, data);
            }
            self.receive(data)?;
        } else {
            // The tail is held back: how many of its bytes are valid is
            // only known at block end
            self.buffer.extend_from_slice(data);
            self.state = TransferState::BlockEnd;
        }

        if self.sequence == BLKSIZE || last_sub_block {
            ctx.send(SdoResponse::confirm_block(self.sequence, BLKSIZE));
            self.sequence = 1;
        } else {
            self.sequence += 1;
        }
        Ok(())
    }

    /// ccs=6, bit 0 set: end a block download
    pub fn download_block_end(&mut self, ctx: &SdoContext, msg: &[u8]) -> Result<(), SdoAbort> {
        if self.state != TransferState::BlockEnd {
            self.abort_transfer();
            return Err(SdoAbort::zero(AbortCode::InvalidCommandSpecifier));
        }
        let (index, sub) = self.multiplexor.unwrap_or((0, 0));

        let unused = ((msg[0] >> 2) & 0x07) as usize;
        let valid = 7 - unused;

        if let Some(crc) = self.crc {
            let tail_start = self.buffer.len() - 7;
            let computed = crc16::XMODEM::get(crc16::XMODEM::update(
                crc,
                &self.buffer[tail_start..tail_start + valid],
            ));
            let expected = u16::from_le_bytes([msg[1], msg[2]]);
            if computed != expected {
                self.abort_transfer();
                return Err(SdoAbort::at(AbortCode::CrcError, index, sub));
            }
        }

        if self.handler.is_some() {
            // In streaming mode the buffer holds only the 7-byte tail
            let tail = self.buffer[..valid].to_vec();
            self.receive(&tail)?;
        } else if valid != 7 {
            let new_len = self.buffer.len() - unused;
            self.buffer.truncate(new_len);
        }

        self.finish(ctx)?;
        ctx.send(SdoResponse::ConfirmBlockDownloadEnd);
        Ok(())
    }
}
