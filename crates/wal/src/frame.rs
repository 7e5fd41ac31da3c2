//! WAL header and frame binary layout.

use byteorder::{ByteOrder, LittleEndian};

use galdr_common::{GaldrError, GaldrResult, PageId, PageType, TxId};

pub const WAL_MAGIC: u32 = 0x4741_4C57; // "GALW"
pub const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 32;
pub const FRAME_HEADER_SIZE: usize = 40;

const HDR_OFF_MAGIC: usize = 0;
const HDR_OFF_VERSION: usize = 4;
const HDR_OFF_PAGE_SIZE: usize = 8;
const HDR_OFF_CHECKPOINT_TX_ID: usize = 12;
const HDR_OFF_SALT1: usize = 20;
const HDR_OFF_SALT2: usize = 24;
const HDR_OFF_CHECKSUM: usize = 28;
const HDR_CHECKSUM_LEN: usize = 28;

#[derive(Debug, Clone, Copy)]
pub struct WalHeader {
    pub page_size: u32,
    pub checkpoint_tx_id: TxId,
    pub salt1: u32,
    pub salt2: u32,
}

impl WalHeader {
    pub fn to_bytes(self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[HDR_OFF_MAGIC..], WAL_MAGIC);
        LittleEndian::write_u32(&mut buf[HDR_OFF_VERSION..], WAL_VERSION);
        LittleEndian::write_u32(&mut buf[HDR_OFF_PAGE_SIZE..], self.page_size);
        LittleEndian::write_u64(&mut buf[HDR_OFF_CHECKPOINT_TX_ID..], self.checkpoint_tx_id);
        LittleEndian::write_u32(&mut buf[HDR_OFF_SALT1..], self.salt1);
        LittleEndian::write_u32(&mut buf[HDR_OFF_SALT2..], self.salt2);
        let checksum = crc32fast::hash(&buf[..HDR_CHECKSUM_LEN]);
        LittleEndian::write_u32(&mut buf[HDR_OFF_CHECKSUM..], checksum);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> GaldrResult<Self> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(GaldrError::InvalidData("WAL header truncated".into()));
        }
        let magic = LittleEndian::read_u32(&buf[HDR_OFF_MAGIC..]);
        if magic != WAL_MAGIC {
            return Err(GaldrError::InvalidData(format!(
                "WAL magic mismatch: expected {WAL_MAGIC:#x}, found {magic:#x}"
            )));
        }
        let checksum = LittleEndian::read_u32(&buf[HDR_OFF_CHECKSUM..]);
        if checksum != crc32fast::hash(&buf[..HDR_CHECKSUM_LEN]) {
            return Err(GaldrError::InvalidData("WAL header checksum mismatch".into()));
        }
        Ok(Self {
            page_size: LittleEndian::read_u32(&buf[HDR_OFF_PAGE_SIZE..]),
            checkpoint_tx_id: LittleEndian::read_u64(&buf[HDR_OFF_CHECKPOINT_TX_ID..]),
            salt1: LittleEndian::read_u32(&buf[HDR_OFF_SALT1..]),
            salt2: LittleEndian::read_u32(&buf[HDR_OFF_SALT2..]),
        })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const NONE = 0;
        const COMMIT = 0b0000_0001;
        const CHECKPOINT = 0b0000_0010;
    }
}

const FR_OFF_FRAME_NUMBER: usize = 0;
const FR_OFF_TX_ID: usize = 8;
const FR_OFF_PAGE_ID: usize = 16;
const FR_OFF_PAGE_TYPE: usize = 20;
const FR_OFF_FLAGS: usize = 21;
const FR_OFF_RESERVED: usize = 22;
const FR_OFF_PAYLOAD_LEN: usize = 24;
const FR_OFF_SALT1: usize = 28;
const FR_OFF_SALT2: usize = 32;
const FR_OFF_CHECKSUM: usize = 36;

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub frame_number: u64,
    pub tx_id: TxId,
    pub page_id: PageId,
    pub page_type: u8,
    pub flags: FrameFlags,
    pub payload_length: u32,
    pub salt1: u32,
    pub salt2: u32,
}

impl FrameHeader {
    fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[FR_OFF_FRAME_NUMBER..], self.frame_number);
        LittleEndian::write_u64(&mut buf[FR_OFF_TX_ID..], self.tx_id);
        LittleEndian::write_u32(&mut buf[FR_OFF_PAGE_ID..], self.page_id as u32);
        buf[FR_OFF_PAGE_TYPE] = self.page_type;
        buf[FR_OFF_FLAGS] = self.flags.bits();
        LittleEndian::write_u16(&mut buf[FR_OFF_RESERVED..], 0);
        LittleEndian::write_u32(&mut buf[FR_OFF_PAYLOAD_LEN..], self.payload_length);
        LittleEndian::write_u32(&mut buf[FR_OFF_SALT1..], self.salt1);
        LittleEndian::write_u32(&mut buf[FR_OFF_SALT2..], self.salt2);
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            frame_number: LittleEndian::read_u64(&buf[FR_OFF_FRAME_NUMBER..]),
            tx_id: LittleEndian::read_u64(&buf[FR_OFF_TX_ID..]),
            page_id: LittleEndian::read_u32(&buf[FR_OFF_PAGE_ID..]) as PageId,
            page_type: buf[FR_OFF_PAGE_TYPE],
            flags: FrameFlags::from_bits_truncate(buf[FR_OFF_FLAGS]),
            payload_length: LittleEndian::read_u32(&buf[FR_OFF_PAYLOAD_LEN..]),
            salt1: LittleEndian::read_u32(&buf[FR_OFF_SALT1..]),
            salt2: LittleEndian::read_u32(&buf[FR_OFF_SALT2..]),
        }
    }
}

/// A decoded frame: header fields plus the (unpadded) page payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_number: u64,
    pub tx_id: TxId,
    pub page_id: PageId,
    pub page_type: u8,
    pub flags: FrameFlags,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_commit(&self) -> bool {
        self.flags.contains(FrameFlags::COMMIT)
    }

    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_byte(self.page_type)
    }
}

/// Serializes one frame (header + page-size-padded payload) given the
/// current WAL epoch's salts.
pub fn encode_frame(
    frame_number: u64,
    tx_id: TxId,
    page_id: PageId,
    page_type: u8,
    flags: FrameFlags,
    payload: &[u8],
    page_size: usize,
    salt1: u32,
    salt2: u32,
) -> Vec<u8> {
    let header = FrameHeader {
        frame_number,
        tx_id,
        page_id,
        page_type,
        flags,
        payload_length: payload.len() as u32,
        salt1,
        salt2,
    };
    let mut header_bytes = header.to_bytes();
    let mut padded_payload = payload.to_vec();
    padded_payload.resize(page_size, 0);

    let checksum = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes[..FR_OFF_CHECKSUM]);
        hasher.update(&padded_payload);
        hasher.finalize()
    };
    LittleEndian::write_u32(&mut header_bytes[FR_OFF_CHECKSUM..], checksum);

    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + page_size);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&padded_payload);
    out
}

/// Decodes one frame from `buf` (header + page-size payload), validating it
/// against the current WAL epoch's salts and checksum. Returns `None` if the
/// frame fails validation (the recovery scan treats this as a torn tail).
pub fn decode_frame(buf: &[u8], page_size: usize, salt1: u32, salt2: u32) -> Option<Frame> {
    if buf.len() < FRAME_HEADER_SIZE + page_size {
        return None;
    }
    let header = FrameHeader::from_bytes(&buf[..FRAME_HEADER_SIZE]);
    if header.salt1 != salt1 || header.salt2 != salt2 {
        return None;
    }
    let payload_region = &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + page_size];
    let expected_checksum = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..FR_OFF_CHECKSUM]);
        hasher.update(payload_region);
        hasher.finalize()
    };
    let frame_checksum = LittleEndian::read_u32(&buf[FR_OFF_CHECKSUM..]);
    if frame_checksum != expected_checksum {
        return None;
    }
    let payload_length = header.payload_length as usize;
    if payload_length > page_size {
        return None;
    }
    Some(Frame {
        frame_number: header.frame_number,
        tx_id: header.tx_id,
        page_id: header.page_id,
        page_type: header.page_type,
        flags: header.flags,
        payload: payload_region[..payload_length].to_vec(),
    })
}
