// Sony liveview binary stream parsing.
//
// Frame layout (all integers big-endian):
//
// Common header (8 bytes)
// 0--------1--------2--------+--------4----+----+----+----8
// |0xFF    |payload | sequence number | timestamp (ms)    |
// |        |type    |                 |                   |
// +-------------------------------------------------------+
//
// Payload header (128 bytes)
// 0--------------------------4-------------------7--------8
// | start code 0x24356879    | JPEG data size    | padding|
// +--------------------------+------5------------+--------+
// | type-specific fields, rest reserved                   |
// ------------------------------------------------------128
//
// The JPEG data size is a 3-byte integer. Anything above 100000 means we
// lost framing and the stream must be restarted.

mod task;

pub use task::{LiveviewSink, LiveviewTask};

use byteorder::{BE, ByteOrder};

pub const COMMON_HEADER_LEN: usize = 8;
pub const PAYLOAD_HEADER_LEN: usize = 128;
pub const PAYLOAD_START_CODE: u32 = 0x2435_6879;
pub const MAX_JPEG_DATA_SIZE: u32 = 100_000;

const PAYLOAD_TYPE_JPEG: u8 = 0x01;
const PAYLOAD_TYPE_FRAME_INFO: u8 = 0x02;
const FRAME_INFO_RECORD_MIN_LEN: usize = 11;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("wrong liveview start byte {0:#04x}")]
    WrongStartByte(u8),
    #[error("unknown payload type {0:#04x}")]
    UnknownPayloadType(u8),
    #[error("wrong payload header start code {0:#010x}")]
    WrongStartCode(u32),
    #[error("implausible JPEG data size {0}, stream is desynchronized")]
    OversizedJpeg(u32),
    #[error("wrong JPEG payload header flag {0:#04x}")]
    WrongFlag(u8),
    #[error("frame info record too short: {0} bytes")]
    FrameInfoTooShort(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Jpeg,
    FrameInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub payload_type: PayloadType,
    pub sequence_number: u16,
    pub timestamp_ms: u32,
}

pub fn parse_common_header(data: &[u8; COMMON_HEADER_LEN]) -> Result<CommonHeader, StreamError> {
    if data[0] != 0xFF {
        return Err(StreamError::WrongStartByte(data[0]));
    }
    let payload_type = match data[1] {
        PAYLOAD_TYPE_JPEG => PayloadType::Jpeg,
        PAYLOAD_TYPE_FRAME_INFO => PayloadType::FrameInfo,
        other => return Err(StreamError::UnknownPayloadType(other)),
    };
    Ok(CommonHeader {
        payload_type,
        sequence_number: BE::read_u16(&data[2..4]),
        timestamp_ms: BE::read_u32(&data[4..8]),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadHeader {
    Jpeg {
        jpeg_data_size: u32,
        padding_size: u8,
    },
    FrameInfo {
        padding_size: u8,
        version: u16,
        frame_count: u16,
        frame_size: u16,
    },
}

impl PayloadHeader {
    pub fn padding_size(&self) -> u8 {
        match self {
            PayloadHeader::Jpeg { padding_size, .. } => *padding_size,
            PayloadHeader::FrameInfo { padding_size, .. } => *padding_size,
        }
    }
}

pub fn parse_payload_header(
    data: &[u8; PAYLOAD_HEADER_LEN],
    payload_type: PayloadType,
) -> Result<PayloadHeader, StreamError> {
    let start_code = BE::read_u32(&data[0..4]);
    if start_code != PAYLOAD_START_CODE {
        return Err(StreamError::WrongStartCode(start_code));
    }
    // A 3-byte big-endian integer.
    let jpeg_data_size =
        (u32::from(data[4]) << 16) | (u32::from(data[5]) << 8) | u32::from(data[6]);
    if jpeg_data_size > MAX_JPEG_DATA_SIZE {
        return Err(StreamError::OversizedJpeg(jpeg_data_size));
    }
    let padding_size = data[7];
    match payload_type {
        PayloadType::Jpeg => {
            let flag = data[12];
            if flag != 0 {
                return Err(StreamError::WrongFlag(flag));
            }
            Ok(PayloadHeader::Jpeg {
                jpeg_data_size,
                padding_size,
            })
        }
        PayloadType::FrameInfo => Ok(PayloadHeader::FrameInfo {
            padding_size,
            version: BE::read_u16(&data[8..10]),
            frame_count: BE::read_u16(&data[10..12]),
            frame_size: BE::read_u16(&data[12..14]),
        }),
    }
}

/// One detected-object record from a frame-info payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
    pub category: u8,
    pub status: u8,
    pub additional: u8,
}

pub fn parse_frame_info(data: &[u8]) -> Result<FrameInfo, StreamError> {
    if data.len() < FRAME_INFO_RECORD_MIN_LEN {
        return Err(StreamError::FrameInfoTooShort(data.len()));
    }
    Ok(FrameInfo {
        left: BE::read_u16(&data[0..2]),
        top: BE::read_u16(&data[2..4]),
        right: BE::read_u16(&data[4..6]),
        bottom: BE::read_u16(&data[6..8]),
        category: data[8],
        status: data[9],
        additional: data[10],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectSink {
        jpegs: Mutex<Vec<Bytes>>,
        infos: Mutex<Vec<FrameInfo>>,
    }

    impl LiveviewSink for CollectSink {
        fn on_jpeg(&self, jpeg: Bytes) {
            self.jpegs.lock().push(jpeg);
        }
        fn on_frame_info(&self, info: FrameInfo) {
            self.infos.lock().push(info);
        }
    }

    fn common_header(payload_type: u8, sequence: u16, timestamp: u32) -> Vec<u8> {
        let mut hdr = vec![0xFF, payload_type];
        hdr.extend_from_slice(&sequence.to_be_bytes());
        hdr.extend_from_slice(&timestamp.to_be_bytes());
        hdr
    }

    fn jpeg_payload_header(jpeg_data_size: u32, padding_size: u8) -> Vec<u8> {
        let mut hdr = vec![0u8; PAYLOAD_HEADER_LEN];
        hdr[0..4].copy_from_slice(&PAYLOAD_START_CODE.to_be_bytes());
        hdr[4] = (jpeg_data_size >> 16) as u8;
        hdr[5] = (jpeg_data_size >> 8) as u8;
        hdr[6] = jpeg_data_size as u8;
        hdr[7] = padding_size;
        hdr
    }

    #[test]
    fn test_parse_common_header() {
        let hdr = common_header(0x01, 0x2A, 100);
        let parsed = parse_common_header(hdr[..].try_into().unwrap()).unwrap();
        assert_eq!(parsed.payload_type, PayloadType::Jpeg);
        assert_eq!(parsed.sequence_number, 0x2A);
        assert_eq!(parsed.timestamp_ms, 100);
    }

    #[test]
    fn test_wrong_start_byte_rejected() {
        let mut hdr = common_header(0x01, 0, 0);
        hdr[0] = 0xFE;
        assert!(matches!(
            parse_common_header(hdr[..].try_into().unwrap()),
            Err(StreamError::WrongStartByte(0xFE))
        ));
    }

    #[test]
    fn test_unknown_payload_type_rejected() {
        let hdr = common_header(0x03, 0, 0);
        assert!(matches!(
            parse_common_header(hdr[..].try_into().unwrap()),
            Err(StreamError::UnknownPayloadType(0x03))
        ));
    }

    #[test]
    fn test_jpeg_size_is_a_three_byte_integer() {
        let hdr = jpeg_payload_header(0x01_02_03, 4);
        let parsed = parse_payload_header(hdr[..].try_into().unwrap(), PayloadType::Jpeg).unwrap();
        assert_eq!(
            parsed,
            PayloadHeader::Jpeg {
                jpeg_data_size: 0x01_02_03,
                padding_size: 4
            }
        );
    }

    #[test]
    fn test_jpeg_size_boundary() {
        let hdr = jpeg_payload_header(100_000, 0);
        assert!(parse_payload_header(hdr[..].try_into().unwrap(), PayloadType::Jpeg).is_ok());
        let hdr = jpeg_payload_header(100_001, 0);
        assert!(matches!(
            parse_payload_header(hdr[..].try_into().unwrap(), PayloadType::Jpeg),
            Err(StreamError::OversizedJpeg(100_001))
        ));
    }

    #[test]
    fn test_wrong_start_code_rejected() {
        let mut hdr = jpeg_payload_header(10, 0);
        hdr[0] = 0;
        assert!(matches!(
            parse_payload_header(hdr[..].try_into().unwrap(), PayloadType::Jpeg),
            Err(StreamError::WrongStartCode(_))
        ));
    }

    #[test]
    fn test_nonzero_jpeg_flag_rejected() {
        let mut hdr = jpeg_payload_header(10, 0);
        hdr[12] = 1;
        assert!(matches!(
            parse_payload_header(hdr[..].try_into().unwrap(), PayloadType::Jpeg),
            Err(StreamError::WrongFlag(1))
        ));
    }

    #[test]
    fn test_frame_info_header_fields() {
        let mut hdr = jpeg_payload_header(0, 2);
        hdr[8..10].copy_from_slice(&1u16.to_be_bytes());
        hdr[10..12].copy_from_slice(&3u16.to_be_bytes());
        hdr[12..14].copy_from_slice(&16u16.to_be_bytes());
        let parsed =
            parse_payload_header(hdr[..].try_into().unwrap(), PayloadType::FrameInfo).unwrap();
        assert_eq!(
            parsed,
            PayloadHeader::FrameInfo {
                padding_size: 2,
                version: 1,
                frame_count: 3,
                frame_size: 16
            }
        );
    }

    #[test]
    fn test_parse_frame_info_record() {
        let mut record = vec![0u8; 16];
        record[0..2].copy_from_slice(&10u16.to_be_bytes());
        record[2..4].copy_from_slice(&20u16.to_be_bytes());
        record[4..6].copy_from_slice(&30u16.to_be_bytes());
        record[6..8].copy_from_slice(&40u16.to_be_bytes());
        record[8] = 1;
        record[9] = 2;
        record[10] = 3;
        let info = parse_frame_info(&record).unwrap();
        assert_eq!(
            info,
            FrameInfo {
                left: 10,
                top: 20,
                right: 30,
                bottom: 40,
                category: 1,
                status: 2,
                additional: 3
            }
        );
        assert!(matches!(
            parse_frame_info(&record[..8]),
            Err(StreamError::FrameInfoTooShort(8))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_emits_one_jpeg_and_consumes_everything() {
        // Common header, payload header, 10 JPEG bytes, no padding.
        let mut buf = common_header(0x01, 0x2A, 100);
        buf.extend_from_slice(&jpeg_payload_header(10, 0));
        buf.extend_from_slice(b"0123456789");
        let sink = CollectSink::default();
        let mut reader = &buf[..];
        task::read_frame(&mut reader, &sink).await.unwrap();
        assert!(reader.is_empty());
        let jpegs = sink.jpegs.lock();
        assert_eq!(jpegs.len(), 1);
        assert_eq!(&jpegs[0][..], b"0123456789");
    }

    #[tokio::test]
    async fn test_read_frame_consumes_padding() {
        let mut buf = common_header(0x01, 0, 0);
        buf.extend_from_slice(&jpeg_payload_header(4, 3));
        buf.extend_from_slice(b"abcd");
        buf.extend_from_slice(&[0, 0, 0]);
        let sink = CollectSink::default();
        let mut reader = &buf[..];
        task::read_frame(&mut reader, &sink).await.unwrap();
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_parses_frame_info_records() {
        let mut hdr = jpeg_payload_header(0, 0);
        hdr[8..10].copy_from_slice(&1u16.to_be_bytes());
        hdr[10..12].copy_from_slice(&2u16.to_be_bytes());
        hdr[12..14].copy_from_slice(&16u16.to_be_bytes());
        let mut buf = common_header(0x02, 0, 0);
        buf.extend_from_slice(&hdr);
        for _ in 0..2 {
            let mut record = vec![0u8; 16];
            record[0..2].copy_from_slice(&7u16.to_be_bytes());
            buf.extend_from_slice(&record);
        }
        let sink = CollectSink::default();
        let mut reader = &buf[..];
        task::read_frame(&mut reader, &sink).await.unwrap();
        assert!(reader.is_empty());
        let infos = sink.infos.lock();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].left, 7);
    }

    #[tokio::test]
    async fn test_short_jpeg_body_is_an_error() {
        let mut buf = common_header(0x01, 0, 0);
        buf.extend_from_slice(&jpeg_payload_header(10, 0));
        buf.extend_from_slice(b"0123");
        let sink = CollectSink::default();
        let mut reader = &buf[..];
        assert!(matches!(
            task::read_frame(&mut reader, &sink).await,
            Err(StreamError::Io(_))
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        let secs: Vec<u64> = (0..7).map(|n| task::backoff_delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 16, 16]);
    }
}
