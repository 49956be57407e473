use bytes::Bytes;

use crate::AppError::InvalidConfig;
use crate::AppResult;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;
pub const DEFAULT_READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// The two supported framing families. `Tlv` frames carry a length field that
/// determines the total frame size; `HeadTail` frames are delimited purely by
/// sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    Tlv,
    HeadTail,
}

/// Static wire-format descriptor for one protocol.
///
/// Offsets are measured from the frame start. A negative `checksum_offset`
/// is measured from the frame end, so `-3` with a width of 1 addresses the
/// third byte from the tail.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    pub start_bytes: Vec<u8>,
    pub end_bytes: Vec<u8>,
    pub byte_order: ByteOrder,
    pub length_offset: usize,
    pub length_width: usize,
    /// added to the decoded length field to obtain the whole-frame byte count
    pub total_length_adjust: i64,
    pub checksum_offset: i64,
    pub checksum_width: usize,
    /// 0 falls back to [`DEFAULT_MAX_FRAME_SIZE`]
    pub max_frame_size: usize,
    pub kind: FramingKind,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            start_bytes: Vec::new(),
            end_bytes: Vec::new(),
            byte_order: ByteOrder::Big,
            length_offset: 0,
            length_width: 0,
            total_length_adjust: 0,
            checksum_offset: 0,
            checksum_width: 0,
            max_frame_size: 0,
            kind: FramingKind::Tlv,
        }
    }
}

impl FrameConfig {
    pub fn validate(&self) -> AppResult<()> {
        match self.kind {
            FramingKind::Tlv => {
                if self.start_bytes.is_empty() {
                    return Err(InvalidConfig(
                        "tlv framing requires a start sentinel".into(),
                    ));
                }
            }
            FramingKind::HeadTail => {
                if self.start_bytes.is_empty() && self.end_bytes.is_empty() {
                    return Err(InvalidConfig(
                        "head/tail framing requires at least one sentinel".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn effective_max_frame_size(&self) -> usize {
        if self.max_frame_size == 0 {
            DEFAULT_MAX_FRAME_SIZE
        } else {
            self.max_frame_size
        }
    }
}

/// One decoded wire frame. Every field owns an independent copy of its bytes,
/// so the accumulation buffer can be reused as soon as the frame is emitted.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub raw: Bytes,
    pub length: Bytes,
    pub body: Bytes,
    pub checksum: Bytes,
}

/// Outcome of one parse attempt against the front of the buffer.
#[derive(Debug)]
pub(crate) enum Progress {
    Emit { frame: Frame, consumed: usize },
    /// invalid prefix; the skipped region is reported internally only
    Skip { consumed: usize },
    NeedMore,
}

pub(crate) fn parse_frame(buf: &[u8], cfg: &FrameConfig) -> Progress {
    match cfg.kind {
        FramingKind::Tlv => parse_tlv(buf, cfg),
        FramingKind::HeadTail => parse_head_tail(buf, cfg),
    }
}

fn parse_tlv(buf: &[u8], cfg: &FrameConfig) -> Progress {
    let start = &cfg.start_bytes;
    match find_subslice(buf, start) {
        None => {
            // keep the last len(start)-1 bytes, a sentinel may straddle reads
            let n = buf.len() as i64 - start.len() as i64 + 1;
            if n > 0 {
                return Progress::Skip {
                    consumed: n as usize,
                };
            }
            return Progress::NeedMore;
        }
        Some(idx) if idx > 0 => return Progress::Skip { consumed: idx },
        Some(_) => {}
    }

    let length_end = cfg.length_offset + cfg.length_width;
    if buf.len() < length_end {
        return Progress::NeedMore;
    }

    let Some(frame_len) = read_length(&buf[cfg.length_offset..length_end], cfg) else {
        // unsupported length width, resync one byte at a time
        return Progress::Skip { consumed: 1 };
    };
    let total = frame_len as i64 + cfg.total_length_adjust;
    if total < (length_end + cfg.checksum_width) as i64 {
        return Progress::Skip { consumed: 1 };
    }
    let total = total as usize;
    if buf.len() < total {
        return Progress::NeedMore;
    }

    let frame = &buf[..total];
    if !cfg.end_bytes.is_empty() && !frame.ends_with(&cfg.end_bytes) {
        return Progress::Skip { consumed: total };
    }

    let body_start = length_end;
    let mut body_end = total - cfg.checksum_width;
    if !cfg.end_bytes.is_empty() {
        body_end = match body_end.checked_sub(cfg.end_bytes.len()) {
            Some(e) => e,
            None => return Progress::Skip { consumed: 1 },
        };
    }
    if body_end < body_start {
        return Progress::Skip { consumed: 1 };
    }

    let checksum_start = if cfg.checksum_offset >= 0 {
        cfg.checksum_offset
    } else {
        total as i64 + cfg.checksum_offset
    };
    let checksum_end = checksum_start + cfg.checksum_width as i64;
    if checksum_start < 0 || checksum_end > total as i64 {
        return Progress::Skip { consumed: 1 };
    }
    let (checksum_start, checksum_end) = (checksum_start as usize, checksum_end as usize);

    Progress::Emit {
        frame: Frame {
            raw: Bytes::copy_from_slice(frame),
            length: Bytes::copy_from_slice(&frame[cfg.length_offset..length_end]),
            body: Bytes::copy_from_slice(&frame[body_start..body_end]),
            checksum: Bytes::copy_from_slice(&frame[checksum_start..checksum_end]),
        },
        consumed: total,
    }
}

fn parse_head_tail(buf: &[u8], cfg: &FrameConfig) -> Progress {
    let start = &cfg.start_bytes;
    let end = &cfg.end_bytes;

    if start.is_empty() {
        // end sentinel only: everything up to the sentinel is one frame
        return match find_subslice(buf, end) {
            None => Progress::NeedMore,
            Some(idx) => Progress::Emit {
                frame: Frame {
                    raw: Bytes::copy_from_slice(&buf[..idx + end.len()]),
                    body: Bytes::copy_from_slice(&buf[..idx]),
                    ..Frame::default()
                },
                consumed: idx + end.len(),
            },
        };
    }

    // align the start sentinel at position 0
    match find_subslice(buf, start) {
        None => {
            let n = buf.len() as i64 - start.len() as i64 + 1;
            if n > 0 {
                return Progress::Skip {
                    consumed: n as usize,
                };
            }
            return Progress::NeedMore;
        }
        Some(idx) if idx > 0 => return Progress::Skip { consumed: idx },
        Some(_) => {}
    }

    if end.is_empty() {
        // start sentinel only: the frame runs up to the next start sentinel
        return match find_subslice(&buf[start.len()..], start) {
            None => Progress::NeedMore,
            Some(rel) => {
                let next = start.len() + rel;
                Progress::Emit {
                    frame: Frame {
                        raw: Bytes::copy_from_slice(&buf[..next]),
                        body: Bytes::copy_from_slice(&buf[start.len()..next]),
                        ..Frame::default()
                    },
                    consumed: next,
                }
            }
        };
    }

    match find_subslice(&buf[start.len()..], end) {
        None => Progress::NeedMore,
        Some(rel) => {
            let end_idx = start.len() + rel;
            Progress::Emit {
                frame: Frame {
                    raw: Bytes::copy_from_slice(&buf[..end_idx + end.len()]),
                    body: Bytes::copy_from_slice(&buf[start.len()..end_idx]),
                    ..Frame::default()
                },
                consumed: end_idx + end.len(),
            }
        }
    }
}

fn read_length(data: &[u8], cfg: &FrameConfig) -> Option<u64> {
    if data.len() < cfg.length_width {
        return None;
    }
    match (cfg.length_width, cfg.byte_order) {
        (1, _) => Some(data[0] as u64),
        (2, ByteOrder::Big) => Some(u16::from_be_bytes([data[0], data[1]]) as u64),
        (2, ByteOrder::Little) => Some(u16::from_le_bytes([data[0], data[1]]) as u64),
        (4, ByteOrder::Big) => {
            Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64)
        }
        (4, ByteOrder::Little) => {
            Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64)
        }
        _ => None,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv_config() -> FrameConfig {
        FrameConfig {
            start_bytes: vec![0xfc, 0xfe],
            end_bytes: vec![0xfc, 0xee],
            byte_order: ByteOrder::Big,
            length_offset: 2,
            length_width: 2,
            total_length_adjust: 4,
            checksum_offset: -3,
            checksum_width: 1,
            max_frame_size: 1024,
            kind: FramingKind::Tlv,
        }
    }

    #[test]
    fn tlv_emits_aligned_frame() {
        let cfg = tlv_config();
        let input = [0xfc, 0xfe, 0x00, 0x06, 0xaa, 0xbb, 0xcc, 0x5a, 0xfc, 0xee];
        match parse_frame(&input, &cfg) {
            Progress::Emit { frame, consumed } => {
                assert_eq!(consumed, 10);
                assert_eq!(frame.raw.as_ref(), &input);
                assert_eq!(frame.length.as_ref(), &[0x00, 0x06]);
                assert_eq!(frame.body.as_ref(), &[0xaa, 0xbb, 0xcc]);
                assert_eq!(frame.checksum.as_ref(), &[0x5a]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn tlv_skips_garbage_prefix() {
        let cfg = tlv_config();
        let input = [
            0x00, 0x11, 0x22, 0xfc, 0xfe, 0x00, 0x06, 0xaa, 0xbb, 0xcc, 0x5a, 0xfc, 0xee,
        ];
        match parse_frame(&input, &cfg) {
            Progress::Skip { consumed } => assert_eq!(consumed, 3),
            other => panic!("expected skip, got {:?}", other),
        }
        match parse_frame(&input[3..], &cfg) {
            Progress::Emit { frame, .. } => assert_eq!(frame.body.as_ref(), &[0xaa, 0xbb, 0xcc]),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn tlv_waits_for_partial_frame() {
        let cfg = tlv_config();
        // header promises 10 bytes, only 6 arrived
        let input = [0xfc, 0xfe, 0x00, 0x06, 0xaa, 0xbb];
        assert!(matches!(parse_frame(&input, &cfg), Progress::NeedMore));
        // not even the length field yet
        assert!(matches!(parse_frame(&[0xfc, 0xfe, 0x00], &cfg), Progress::NeedMore));
    }

    #[test]
    fn tlv_no_sentinel_keeps_tail() {
        let cfg = tlv_config();
        // a sentinel may straddle the read boundary, so the last byte stays
        match parse_frame(&[0x01, 0x02, 0x03, 0xfc], &cfg) {
            Progress::Skip { consumed } => assert_eq!(consumed, 3),
            other => panic!("expected skip, got {:?}", other),
        }
        assert!(matches!(parse_frame(&[0xfc], &cfg), Progress::NeedMore));
    }

    #[test]
    fn tlv_undersized_total_advances_one_byte() {
        let mut cfg = tlv_config();
        cfg.total_length_adjust = 0;
        // length 2 < length_end + checksum_width
        let input = [0xfc, 0xfe, 0x00, 0x02, 0xaa, 0xbb, 0xcc];
        match parse_frame(&input, &cfg) {
            Progress::Skip { consumed } => assert_eq!(consumed, 1),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn tlv_missing_end_sentinel_drops_whole_frame() {
        let cfg = tlv_config();
        let input = [0xfc, 0xfe, 0x00, 0x06, 0xaa, 0xbb, 0xcc, 0x5a, 0xde, 0xad];
        match parse_frame(&input, &cfg) {
            Progress::Skip { consumed } => assert_eq!(consumed, 10),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn tlv_unsupported_length_width_resyncs() {
        let mut cfg = tlv_config();
        cfg.length_width = 3;
        let input = [0xfc, 0xfe, 0x00, 0x00, 0x06, 0xaa, 0xbb, 0xcc];
        match parse_frame(&input, &cfg) {
            Progress::Skip { consumed } => assert_eq!(consumed, 1),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn tlv_little_endian_length() {
        let mut cfg = tlv_config();
        cfg.byte_order = ByteOrder::Little;
        let input = [0xfc, 0xfe, 0x06, 0x00, 0xaa, 0xbb, 0xcc, 0x5a, 0xfc, 0xee];
        match parse_frame(&input, &cfg) {
            Progress::Emit { frame, .. } => assert_eq!(frame.body.as_ref(), &[0xaa, 0xbb, 0xcc]),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn head_tail_end_only() {
        let cfg = FrameConfig {
            end_bytes: vec![b'\r', b'\n'],
            kind: FramingKind::HeadTail,
            ..FrameConfig::default()
        };
        let input = b"hello\r\nworld\r\n";
        match parse_frame(input, &cfg) {
            Progress::Emit { frame, consumed } => {
                assert_eq!(frame.body.as_ref(), b"hello");
                assert_eq!(frame.raw.as_ref(), b"hello\r\n");
                assert_eq!(consumed, 7);
            }
            other => panic!("expected frame, got {:?}", other),
        }
        match parse_frame(&input[7..], &cfg) {
            Progress::Emit { frame, .. } => assert_eq!(frame.body.as_ref(), b"world"),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn head_tail_start_only_waits_for_next_sentinel() {
        let cfg = FrameConfig {
            start_bytes: vec![0x70],
            kind: FramingKind::HeadTail,
            ..FrameConfig::default()
        };
        // no second start sentinel yet
        assert!(matches!(
            parse_frame(&[0x70, 0x01, 0x02], &cfg),
            Progress::NeedMore
        ));
        match parse_frame(&[0x70, 0x01, 0x02, 0x70, 0x03], &cfg) {
            Progress::Emit { frame, consumed } => {
                assert_eq!(frame.body.as_ref(), &[0x01, 0x02]);
                assert_eq!(frame.raw.as_ref(), &[0x70, 0x01, 0x02]);
                assert_eq!(consumed, 3);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn head_tail_both_sentinels() {
        let cfg = FrameConfig {
            start_bytes: vec![0x02],
            end_bytes: vec![0x03],
            kind: FramingKind::HeadTail,
            ..FrameConfig::default()
        };
        let input = [0xff, 0x02, b'a', b'b', 0x03, 0x02];
        match parse_frame(&input, &cfg) {
            Progress::Skip { consumed } => assert_eq!(consumed, 1),
            other => panic!("expected skip, got {:?}", other),
        }
        match parse_frame(&input[1..], &cfg) {
            Progress::Emit { frame, consumed } => {
                assert_eq!(frame.body.as_ref(), b"ab");
                assert_eq!(consumed, 4);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn validate_rejects_tlv_without_start() {
        let cfg = FrameConfig {
            kind: FramingKind::Tlv,
            ..FrameConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = FrameConfig {
            kind: FramingKind::HeadTail,
            ..FrameConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
