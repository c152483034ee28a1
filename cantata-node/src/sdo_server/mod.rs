//! SDO server
//!
//! Serves confirmed point-to-point reads (uploads) and writes (downloads)
//! of dictionary slots, in three coexisting transfer modes: expedited
//! (payload in the init frame), segmented (7-byte frames with an
//! alternating toggle bit), and block (runs of up to 127 sequence-numbered
//! frames with an optional CRC-16/XMODEM check).
//!
//! Every handler reports protocol failures as a typed [`SdoAbort`]; the
//! top of the frame handler renders them into the canonical 8-byte abort
//! frame. Wire-level aborts are expected peer behavior and are never
//! logged as errors. The server state is never reset by an abort: the next
//! init simply starts over.

mod download;
mod upload;

pub use download::{DownloadHandler, DownloadHandlerFactory};
pub use upload::{UploadHandler, UploadHandlerFactory};

use std::sync::{Arc, Mutex, Weak};

use cantata_common::constants::{cob_ids, object_ids};
use cantata_common::datatypes::{AccessType, DataType, Value};
use cantata_common::messages::NmtState;
use cantata_common::sdo::{AbortCode, BlockSegment, SdoResponse};
use cantata_common::traits::CanNetwork;
use cantata_common::NodeId;

use crate::nmt::NmtShared;
use crate::object_dict::{ObjectDictionary, OdError, Record, Variable};

use download::DownloadManager;
use upload::UploadManager;

/// Block transfers always offer the maximum of 127 segments per block
const BLKSIZE: u8 = 127;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransferState {
    Idle,
    Segment,
    Block,
    BlockEnd,
}

/// Which multiplexor an abort frame reports
pub(crate) enum AbortMux {
    /// The index/sub bytes of the offending request
    Request,
    /// (0, 0); used when the offending frame carries no multiplexor
    Zero,
    /// A specific slot
    At(u16, u8),
}

/// A protocol failure, rendered into an abort frame by the frame handler
pub(crate) struct SdoAbort {
    pub code: AbortCode,
    pub mux: AbortMux,
}

impl SdoAbort {
    pub fn request(code: AbortCode) -> Self {
        Self {
            code,
            mux: AbortMux::Request,
        }
    }

    pub fn zero(code: AbortCode) -> Self {
        Self {
            code,
            mux: AbortMux::Zero,
        }
    }

    pub fn at(code: AbortCode, index: u16, sub: u8) -> Self {
        Self {
            code,
            mux: AbortMux::At(index, sub),
        }
    }
}

/// What a transfer state machine needs to process one frame
pub(crate) struct SdoContext<'a> {
    pub od: &'a ObjectDictionary,
    pub network: &'a dyn CanNetwork,
    pub cob_tx: u16,
}

impl SdoContext<'_> {
    pub fn send(&self, response: SdoResponse) {
        self.network.send(self.cob_tx, &response.to_bytes());
    }

    pub fn send_block_segment(&self, segment: BlockSegment) {
        self.network.send(self.cob_tx, &segment.to_bytes());
    }

    /// Look a slot up, mapping dictionary misses to their abort codes
    pub fn lookup(&self, index: u16, sub: u8) -> Result<crate::object_dict::Variable, SdoAbort> {
        self.od.lookup(index, sub).map_err(|e| match e {
            OdError::NoObject { .. } => SdoAbort::at(AbortCode::NoSuchObject, index, sub),
            OdError::NoSubIndex { .. } => SdoAbort::at(AbortCode::NoSuchSubIndex, index, sub),
            _ => SdoAbort::at(AbortCode::GeneralError, index, sub),
        })
    }
}

struct CobState {
    cob_rx: u32,
    cob_tx: u32,
    subscribed: Option<u16>,
}

pub(crate) struct SdoServerShared {
    weak: Weak<SdoServerShared>,
    number: usize,
    index: u16,
    network: Arc<dyn CanNetwork>,
    od: Arc<ObjectDictionary>,
    cobs: Mutex<CobState>,
    download: Mutex<DownloadManager>,
    upload: Mutex<UploadManager>,
}

impl SdoServerShared {
    fn subscribe(&self) {
        let mut cobs = self.cobs.lock().unwrap();
        // Bit 31 on either COB-ID marks the whole channel invalid
        if (cobs.cob_rx | cobs.cob_tx) & (1 << 31) != 0 {
            return;
        }
        let cob = (cobs.cob_rx & 0x7FF) as u16;
        if cobs.subscribed == Some(cob) {
            return;
        }
        if let Some(old) = cobs.subscribed.take() {
            self.network.remove_subscription(old);
        }
        let weak = self.weak.clone();
        self.network.add_subscription(
            cob,
            Arc::new(move |_cob_id, data| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_frame(data);
                }
            }),
        );
        cobs.subscribed = Some(cob);
    }

    fn unsubscribe(&self) {
        let mut cobs = self.cobs.lock().unwrap();
        if let Some(old) = cobs.subscribed.take() {
            self.network.remove_subscription(old);
        }
    }

    fn update_cob_rx(&self, value: u32) {
        self.unsubscribe();
        self.cobs.lock().unwrap().cob_rx = value;
        self.subscribe();
    }

    fn update_cob_tx(&self, value: u32) {
        self.unsubscribe();
        self.cobs.lock().unwrap().cob_tx = value;
        self.subscribe();
    }

    /// Recompute the pre-assigned COB pair of server 0 from the node id
    fn reset_to_node_id(&self, node_id: NodeId) {
        let (cob_rx, cob_tx) = match node_id {
            NodeId::Configured(id) => (
                (cob_ids::SDO_REQ_BASE + id.raw() as u16) as u32,
                (cob_ids::SDO_RESP_BASE + id.raw() as u16) as u32,
            ),
            NodeId::Unconfigured => (0x8000_0000, 0x8000_0000),
        };
        {
            let mut cobs = self.cobs.lock().unwrap();
            cobs.cob_rx = cob_rx;
            cobs.cob_tx = cob_tx;
        }
        let _ = self.od.write(self.index, 1, Value::Unsigned32(cob_rx), false);
        let _ = self.od.write(self.index, 2, Value::Unsigned32(cob_tx), false);
    }

    fn on_nmt_state(&self, state: NmtState, node_id: NodeId) {
        match state {
            NmtState::Stopped => self.unsubscribe(),
            NmtState::PreOperational | NmtState::Operational => {
                if self.number == 0 {
                    self.reset_to_node_id(node_id);
                }
                self.subscribe();
            }
            NmtState::Initialisation => {}
        }
    }

    fn handle_frame(&self, data: &[u8]) {
        if data.len() < 8 {
            log::warn!("Dropping short SDO frame: {data:02X?}");
            return;
        }
        let cob_tx = (self.cobs.lock().unwrap().cob_tx & 0x7FF) as u16;
        let ctx = SdoContext {
            od: &self.od,
            network: &*self.network,
            cob_tx,
        };

        if let Err(abort) = self.dispatch(&ctx, data) {
            let (index, sub) = match abort.mux {
                AbortMux::At(index, sub) => (index, sub),
                AbortMux::Zero => (0, 0),
                AbortMux::Request => (u16::from_le_bytes([data[1], data[2]]), data[3]),
            };
            ctx.send(SdoResponse::abort(index, sub, abort.code));
        }
    }

    fn dispatch(&self, ctx: &SdoContext, data: &[u8]) -> Result<(), SdoAbort> {
        // An abort frame is recognized before anything else
        if data[0] == 0x80 {
            let index = u16::from_le_bytes([data[1], data[2]]);
            let sub = data[3];
            self.download.lock().unwrap().on_abort((index, sub));
            self.upload.lock().unwrap().on_abort((index, sub));
            return Ok(());
        }

        // While a block transfer runs, frames are sequenced segments (or
        // block subcommands) rather than ccs-coded requests
        {
            let mut download = self.download.lock().unwrap();
            if download.block_active() {
                return download.download_sub_block(ctx, data);
            }
        }
        {
            let mut upload = self.upload.lock().unwrap();
            if upload.block_active() {
                return upload.upload_sub_block(ctx, data);
            }
        }

        match data[0] >> 5 {
            0 => self.download.lock().unwrap().download_segment(ctx, data),
            1 => self.download.lock().unwrap().init_download(ctx, data),
            2 => self.upload.lock().unwrap().init_upload(ctx, data),
            3 => self.upload.lock().unwrap().upload_segment(ctx, data),
            5 if data[0] & 0x03 == 0 => self.upload.lock().unwrap().init_upload(ctx, data),
            6 => {
                let mut download = self.download.lock().unwrap();
                if data[0] & 0x01 != 0 {
                    download.download_block_end(ctx, data)
                } else {
                    download.download_block_init(ctx, data)
                }
            }
            _ => Err(SdoAbort::request(AbortCode::InvalidCommandSpecifier)),
        }
    }
}

/// An SDO server
///
/// Server 0 owns the pre-assigned COB pair `0x600+id` / `0x580+id`;
/// additional servers start invalid and are configured through their
/// `0x1200+N` dictionary records. A server receives only while the node is
/// Pre-Operational or Operational.
pub struct SdoServer {
    shared: Arc<SdoServerShared>,
}

impl SdoServer {
    pub(crate) fn new(
        number: usize,
        network: Arc<dyn CanNetwork>,
        od: Arc<ObjectDictionary>,
        nmt: Arc<NmtShared>,
    ) -> Self {
        let node_raw = nmt.node_id().raw() as u32;
        let (cob_rx, cob_tx) = if number == 0 {
            (
                cob_ids::SDO_REQ_BASE as u32 + node_raw,
                cob_ids::SDO_RESP_BASE as u32 + node_raw,
            )
        } else {
            (0x8000_0000, 0x8000_0000)
        };
        let index = object_ids::SDO_SERVER_BASE + number as u16;
        let access = if number == 0 {
            AccessType::Ro
        } else {
            AccessType::Rw
        };

        let mut record = Record::named("SDO Server Parameter");
        record.insert(
            1,
            Variable::new(DataType::Unsigned32, access)
                .with_default(cob_rx)
                .named("COB-ID Client->Server (rx)"),
        );
        record.insert(
            2,
            Variable::new(DataType::Unsigned32, access)
                .with_default(cob_tx)
                .named("COB-ID Server->Client (tx)"),
        );
        if number > 0 {
            record.insert(
                3,
                Variable::new(DataType::Unsigned8, AccessType::Rw)
                    .named("Node-ID of the SDO Client"),
            );
        }
        od.insert(index, record).expect("SDO server record is valid");

        let shared = Arc::new_cyclic(|weak| SdoServerShared {
            weak: weak.clone(),
            number,
            index,
            network,
            od: od.clone(),
            cobs: Mutex::new(CobState {
                cob_rx,
                cob_tx,
                subscribed: None,
            }),
            download: Mutex::new(DownloadManager::new()),
            upload: Mutex::new(UploadManager::new()),
        });

        if number > 0 {
            let weak = Arc::downgrade(&shared);
            od.update_callbacks(index, 1).add(move |value: &Value| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u32()) {
                    shared.update_cob_rx(value);
                }
                Ok(())
            });
            let weak = Arc::downgrade(&shared);
            od.update_callbacks(index, 2).add(move |value: &Value| {
                if let (Some(shared), Some(value)) = (weak.upgrade(), value.as_u32()) {
                    shared.update_cob_tx(value);
                }
                Ok(())
            });
        }

        let weak = Arc::downgrade(&shared);
        let nmt_weak = Arc::downgrade(&nmt);
        nmt.state_callbacks.add(move |state: &NmtState| {
            if let (Some(shared), Some(nmt)) = (weak.upgrade(), nmt_weak.upgrade()) {
                shared.on_nmt_state(*state, nmt.node_id());
            }
            Ok(())
        });

        Self { shared }
    }

    /// Install the download streaming factory
    ///
    /// Called at each download initiation with (index, sub, announced
    /// size); a returned handler consumes the transfer instead of the
    /// dictionary.
    pub fn set_download_handler(
        &self,
        factory: impl Fn(u16, u8, Option<usize>) -> Option<Box<dyn DownloadHandler>>
            + Send
            + Sync
            + 'static,
    ) {
        self.shared
            .download
            .lock()
            .unwrap()
            .set_factory(Arc::new(factory));
    }

    /// Install the upload streaming factory
    ///
    /// Called at each upload initiation with (index, sub); a returned
    /// handler produces the transfer instead of the dictionary.
    pub fn set_upload_handler(
        &self,
        factory: impl Fn(u16, u8) -> Option<Box<dyn UploadHandler>> + Send + Sync + 'static,
    ) {
        self.shared
            .upload
            .lock()
            .unwrap()
            .set_factory(Arc::new(factory));
    }

    /// The receive COB-ID, or None while invalid
    pub fn cob_rx(&self) -> Option<u16> {
        let cobs = self.shared.cobs.lock().unwrap();
        (cobs.cob_rx & (1 << 31) == 0).then(|| (cobs.cob_rx & 0x7FF) as u16)
    }

    /// The transmit COB-ID, or None while invalid
    pub fn cob_tx(&self) -> Option<u16> {
        let cobs = self.shared.cobs.lock().unwrap();
        (cobs.cob_tx & (1 << 31) == 0).then(|| (cobs.cob_tx & 0x7FF) as u16)
    }

    /// Configure the COB pair of an additional server (number > 0)
    ///
    /// Writes the `0x1200+N` record; bit 31 marks a COB-ID invalid. The
    /// pre-assigned pair of server 0 follows the node id instead.
    pub fn configure(&self, cob_rx: u32, cob_tx: u32) -> Result<(), OdError> {
        self.shared
            .od
            .write(self.shared.index, 1, Value::Unsigned32(cob_rx), false)?;
        self.shared
            .od
            .write(self.shared.index, 2, Value::Unsigned32(cob_tx), false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmt::NmtService;
    use cantata_common::sdo::SdoRequest;
    use cantata_common::test_utils::MockNetwork;

    fn test_setup() -> (Arc<MockNetwork>, Arc<ObjectDictionary>, SdoServer, NmtService) {
        let network = MockNetwork::new();
        let od = Arc::new(ObjectDictionary::new());
        od.insert(
            0x2000,
            Variable::new(DataType::Unsigned16, AccessType::Rw).with_default(5u16),
        )
        .unwrap();
        od.insert(0x2001, Variable::new(DataType::Domain, AccessType::Rw))
            .unwrap();
        od.insert(
            0x2002,
            Variable::new(DataType::Integer16, AccessType::Rw)
                .with_minimum(16.0)
                .with_maximum(32.0),
        )
        .unwrap();

        let nmt = NmtService::new(network.clone(), NodeId::new(2).unwrap());
        let server = SdoServer::new(0, network.clone(), od.clone(), nmt.shared().clone());
        nmt.set_state(NmtState::PreOperational);
        network.take_sent();
        (network, od, server, nmt)
    }

    #[test]
    fn test_expedited_write_then_read() {
        let (network, _od, _server, _nmt) = test_setup();

        // Write the value 1 to 0x2000:0
        network.receive(0x602, &[0x2B, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00]);
        let msg = network.take_single_sent();
        assert_eq!(0x582, msg.cob_id);
        assert_eq!(&[0x60, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00], msg.data());

        // Read it back
        network.receive(0x602, &[0x40, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let msg = network.take_single_sent();
        assert_eq!(&[0x4B, 0x00, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00], msg.data());
    }

    #[test]
    fn test_out_of_range_download_aborts() {
        let (network, od, _server, _nmt) = test_setup();

        // 15 < minimum of 16
        network.receive(0x602, &[0x2F, 0x02, 0x20, 0x00, 0x0F, 0x00, 0x00, 0x00]);
        let msg = network.take_single_sent();
        assert_eq!(&[0x80, 0x02, 0x20, 0x00, 0x32, 0x00, 0x09, 0x06], msg.data());
        assert!(!od.has_value(0x2002, 0));
    }

    #[test]
    fn test_missing_object_and_sub() {
        let (network, _od, _server, _nmt) = test_setup();

        network.receive(
            0x602,
            &SdoRequest::initiate_upload(0x5555, 0).to_bytes(),
        );
        let msg = network.take_single_sent();
        assert_eq!(&[0x80, 0x55, 0x55, 0x00, 0x00, 0x00, 0x02, 0x06], msg.data());

        network.receive(
            0x602,
            &SdoRequest::initiate_upload(0x2000, 1).to_bytes(),
        );
        let msg = network.take_single_sent();
        assert_eq!(&[0x80, 0x00, 0x20, 0x01, 0x11, 0x00, 0x09, 0x06], msg.data());
    }

    #[test]
    fn test_segmented_download_and_upload() {
        let (network, od, _server, _nmt) = test_setup();
        let payload = b"ABCDEFGHIJKLMNO"; // 15 bytes

        network.receive(
            0x602,
            &SdoRequest::initiate_download(0x2001, 0, Some(15)).to_bytes(),
        );
        assert_eq!(
            Ok(SdoResponse::download_acknowledge(0x2001, 0)),
            SdoResponse::try_from(network.take_single_sent().data())
        );

        network.receive(
            0x602,
            &SdoRequest::download_segment(false, false, &payload[0..7]).to_bytes(),
        );
        assert_eq!(
            &[0x20, 0, 0, 0, 0, 0, 0, 0],
            network.take_single_sent().data()
        );
        network.receive(
            0x602,
            &SdoRequest::download_segment(true, false, &payload[7..14]).to_bytes(),
        );
        assert_eq!(
            &[0x30, 0, 0, 0, 0, 0, 0, 0],
            network.take_single_sent().data()
        );
        network.receive(
            0x602,
            &SdoRequest::download_segment(false, true, &payload[14..15]).to_bytes(),
        );
        assert_eq!(
            &[0x20, 0, 0, 0, 0, 0, 0, 0],
            network.take_single_sent().data()
        );

        assert_eq!(
            Value::Bytes(payload.to_vec()),
            od.read(0x2001, 0).unwrap()
        );

        // Read it back with a segmented upload
        network.receive(0x602, &SdoRequest::initiate_upload(0x2001, 0).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x41, 0x01, 0x20, 0x00, 0x0F, 0x00, 0x00, 0x00], msg.data());

        network.receive(0x602, &SdoRequest::upload_segment_request(false).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x00, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47], msg.data());

        network.receive(0x602, &SdoRequest::upload_segment_request(true).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x10, 0x48, 0x49, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E], msg.data());

        // Final segment: one byte, 6 unused, last flag
        network.receive(0x602, &SdoRequest::upload_segment_request(false).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x0D, 0x4F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], msg.data());
    }

    #[test]
    fn test_toggle_error_aborts() {
        let (network, _od, _server, _nmt) = test_setup();

        network.receive(
            0x602,
            &SdoRequest::initiate_download(0x2001, 0, None).to_bytes(),
        );
        network.take_sent();
        // First segment must carry toggle=0
        network.receive(
            0x602,
            &SdoRequest::download_segment(true, true, b"A").to_bytes(),
        );
        let msg = network.take_single_sent();
        assert_eq!(&[0x80, 0x01, 0x20, 0x00, 0x00, 0x00, 0x03, 0x05], msg.data());
    }

    fn run_block_download(network: &MockNetwork, data: &[u8], corrupt_crc: bool) -> Vec<u8> {
        network.receive(
            0x602,
            &SdoRequest::initiate_block_download(0x2001, 0, true, data.len() as u32).to_bytes(),
        );
        let msg = network.take_single_sent();
        assert_eq!(&[0xA4, 0x01, 0x20, 0x00, 0x7F, 0x00, 0x00, 0x00], msg.data());

        let mut pos = 0;
        let mut seqnum = 0u8;
        while pos < data.len() {
            let len = (data.len() - pos).min(7);
            let mut chunk = [0u8; 7];
            chunk[..len].copy_from_slice(&data[pos..pos + len]);
            pos += len;
            seqnum += 1;
            let c = pos == data.len();

            network.receive(0x602, &BlockSegment { c, seqnum, data: chunk }.to_bytes());

            if c {
                let msg = network.take_single_sent();
                assert_eq!(&[0xA2, seqnum, 0x7F, 0, 0, 0, 0, 0], msg.data());
            } else if seqnum == 127 {
                let msg = network.take_single_sent();
                assert_eq!(&[0xA2, 0x7F, 0x7F, 0, 0, 0, 0, 0], msg.data());
                seqnum = 0;
            } else {
                assert!(network.take_sent().is_empty());
            }
        }

        let n = ((7 - data.len() % 7) % 7) as u8;
        let mut crc = crc16::State::<crc16::XMODEM>::calculate(data);
        if corrupt_crc {
            crc ^= 0xFFFF;
        }
        network.receive(0x602, &SdoRequest::end_block_download(n, crc).to_bytes());
        network.take_single_sent().data().to_vec()
    }

    #[test]
    fn test_block_download() {
        let (network, od, _server, _nmt) = test_setup();

        // 890 bytes: one full block of 127 segments plus one more segment
        let data = Vec::from_iter((0..890).map(|x| (x % 256) as u8));
        let reply = run_block_download(&network, &data, false);
        assert_eq!(&[0xA1, 0, 0, 0, 0, 0, 0, 0], &reply[..]);
        assert_eq!(Value::Bytes(data), od.read(0x2001, 0).unwrap());
    }

    #[test]
    fn test_block_download_crc_mismatch() {
        let (network, od, _server, _nmt) = test_setup();

        let data = Vec::from_iter((0..100).map(|x| (x % 256) as u8));
        let reply = run_block_download(&network, &data, true);
        assert_eq!(&[0x80, 0x01, 0x20, 0x00, 0x04, 0x00, 0x04, 0x05], &reply[..]);
        assert!(!od.has_value(0x2001, 0));
    }

    #[test]
    fn test_block_upload() {
        let (network, od, _server, _nmt) = test_setup();

        let data = Vec::from_iter((0..100).map(|x| (x % 256) as u8));
        od.write(0x2001, 0, Value::Bytes(data.clone()), false)
            .unwrap();

        // Initiate block upload with CRC support (bit 2), blksize 127, pst 0
        network.receive(0x602, &[0xA4, 0x01, 0x20, 0x00, 127, 0, 0, 0]);
        let msg = network.take_single_sent();
        // sc=1, s=1, size=100
        assert_eq!(&[0xC6, 0x01, 0x20, 0x00, 100, 0, 0, 0], msg.data());

        network.receive(0x602, &SdoRequest::StartBlockUpload.to_bytes());
        let frames = network.take_sent();
        // 100 bytes = 14 full segments + 1 partial
        assert_eq!(15, frames.len());
        let mut received = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let segment = BlockSegment::try_from(frame.data()).unwrap();
            assert_eq!(i as u8 + 1, segment.seqnum);
            assert_eq!(i == 14, segment.c);
            received.extend_from_slice(&segment.data);
        }
        assert_eq!(data, received[..100]);

        network.receive(
            0x602,
            &SdoRequest::ConfirmBlock {
                ackseq: 15,
                blksize: 127,
            }
            .to_bytes(),
        );
        let msg = network.take_single_sent();
        // 105 - 100 = 5 unused bytes in the last segment; CRC over the data
        let crc = crc16::State::<crc16::XMODEM>::calculate(&data);
        assert_eq!(0xC1 | (5 << 2), msg.data()[0]);
        assert_eq!(crc.to_le_bytes(), msg.data()[1..3]);

        network.receive(0x602, &SdoRequest::EndBlockUpload.to_bytes());
        assert!(network.take_sent().is_empty());

        // The server is idle again
        network.receive(0x602, &[0x40, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            &[0x4B, 0x00, 0x20, 0x00, 0x05, 0x00, 0x00, 0x00],
            network.take_single_sent().data()
        );
    }

    #[test]
    fn test_new_init_aborts_prior_transfer() {
        let (network, od, _server, _nmt) = test_setup();

        network.receive(
            0x602,
            &SdoRequest::initiate_download(0x2001, 0, None).to_bytes(),
        );
        network.take_sent();
        network.receive(
            0x602,
            &SdoRequest::download_segment(false, false, b"ABCDEFG").to_bytes(),
        );
        network.take_sent();

        // A fresh init silently abandons the open transfer
        network.receive(0x602, &SdoRequest::expedited_download(0x2000, 0, &[9, 0]).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0], msg.data());
        assert_eq!(Value::Unsigned16(9), od.read(0x2000, 0).unwrap());
        assert!(!od.has_value(0x2001, 0));
    }

    #[test]
    fn test_inbound_abort_resets_transfer() {
        let (network, od, _server, _nmt) = test_setup();

        network.receive(
            0x602,
            &SdoRequest::initiate_download(0x2001, 0, None).to_bytes(),
        );
        network.take_sent();
        network.receive(
            0x602,
            &SdoRequest::abort(0x2001, 0, AbortCode::GeneralError).to_bytes(),
        );
        // No reply to an abort
        assert!(network.take_sent().is_empty());

        // A following segment has no transfer to belong to
        network.receive(
            0x602,
            &SdoRequest::download_segment(false, true, b"A").to_bytes(),
        );
        let msg = network.take_single_sent();
        assert_eq!(&[0x80, 0x00, 0x00, 0x00, 0x01, 0x00, 0x04, 0x05], msg.data());
        assert!(!od.has_value(0x2001, 0));
    }

    #[test]
    fn test_write_only_and_read_only_access() {
        let (network, od, _server, _nmt) = test_setup();
        od.insert(0x2003, Variable::new(DataType::Unsigned8, AccessType::Ro))
            .unwrap();
        od.insert(0x2004, Variable::new(DataType::Unsigned8, AccessType::Wo))
            .unwrap();

        network.receive(0x602, &SdoRequest::expedited_download(0x2003, 0, &[1]).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x80, 0x03, 0x20, 0x00, 0x02, 0x00, 0x01, 0x06], msg.data());

        network.receive(0x602, &SdoRequest::initiate_upload(0x2004, 0).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x80, 0x04, 0x20, 0x00, 0x01, 0x00, 0x01, 0x06], msg.data());
    }

    #[test]
    fn test_stopped_state_unsubscribes() {
        let (network, _od, _server, nmt) = test_setup();

        nmt.set_state(NmtState::Stopped);
        assert!(!network.is_subscribed(0x602));
        network.receive(0x602, &SdoRequest::initiate_upload(0x2000, 0).to_bytes());
        assert!(network.take_sent().is_empty());

        nmt.set_state(NmtState::Operational);
        assert!(network.is_subscribed(0x602));
    }

    #[test]
    fn test_streaming_download_handler() {
        let (network, od, server, _nmt) = test_setup();

        struct Recorder {
            chunks: Arc<Mutex<Vec<Vec<u8>>>>,
            finished: Arc<Mutex<bool>>,
        }
        impl DownloadHandler for Recorder {
            fn on_receive(&mut self, data: &[u8]) -> Result<(), crate::callbacks::CallbackError> {
                self.chunks.lock().unwrap().push(data.to_vec());
                Ok(())
            }
            fn on_finish(&mut self) -> Result<(), crate::callbacks::CallbackError> {
                *self.finished.lock().unwrap() = true;
                Ok(())
            }
            fn on_abort(&mut self) {}
        }

        let chunks: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Mutex::new(false));
        let (chunks2, finished2) = (chunks.clone(), finished.clone());
        server.set_download_handler(move |index, _sub, _size| {
            (index == 0x2001).then(|| {
                Box::new(Recorder {
                    chunks: chunks2.clone(),
                    finished: finished2.clone(),
                }) as Box<dyn DownloadHandler>
            })
        });

        network.receive(
            0x602,
            &SdoRequest::initiate_download(0x2001, 0, Some(10)).to_bytes(),
        );
        network.take_sent();
        network.receive(
            0x602,
            &SdoRequest::download_segment(false, false, b"ABCDEFG").to_bytes(),
        );
        network.take_sent();
        network.receive(
            0x602,
            &SdoRequest::download_segment(true, true, b"HIJ").to_bytes(),
        );
        network.take_sent();

        assert_eq!(
            vec![b"ABCDEFG".to_vec(), b"HIJ".to_vec()],
            *chunks.lock().unwrap()
        );
        assert!(*finished.lock().unwrap());
        // The dictionary was bypassed
        assert!(!od.has_value(0x2001, 0));
    }

    #[test]
    fn test_streaming_upload_handler() {
        let (network, _od, server, _nmt) = test_setup();

        struct Producer {
            remaining: Vec<u8>,
        }
        impl UploadHandler for Producer {
            fn on_read(&mut self, size: usize) -> Result<Vec<u8>, crate::callbacks::CallbackError> {
                let take = self.remaining.len().min(size);
                Ok(self.remaining.drain(..take).collect())
            }
        }

        server.set_upload_handler(move |index, _sub| {
            (index == 0x2001).then(|| {
                Box::new(Producer {
                    remaining: b"streamed!".to_vec(),
                }) as Box<dyn UploadHandler>
            })
        });

        network.receive(0x602, &SdoRequest::initiate_upload(0x2001, 0).to_bytes());
        // Unknown size: segmented with no size field
        let msg = network.take_single_sent();
        assert_eq!(&[0x40, 0x01, 0x20, 0x00, 0, 0, 0, 0], msg.data());

        network.receive(0x602, &SdoRequest::upload_segment_request(false).to_bytes());
        let msg = network.take_single_sent();
        assert_eq!(&[0x00, b's', b't', b'r', b'e', b'a', b'm', b'e'], msg.data());

        network.receive(0x602, &SdoRequest::upload_segment_request(true).to_bytes());
        let msg = network.take_single_sent();
        // "d!" + last flag + 5 unused
        assert_eq!(&[0x1B, b'd', b'!', 0, 0, 0, 0, 0], msg.data());
    }
}
