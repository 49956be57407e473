use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::network::frame::{parse_frame, Progress, DEFAULT_READ_CHUNK};
use crate::network::{Frame, FrameConfig};
use crate::AppError;
use crate::AppResult;

/// A protocol's framing rules: the static wire descriptor plus checksum
/// validation over an extracted candidate frame.
pub trait FrameDecoder: Send + Sync {
    fn config(&self) -> &FrameConfig;

    /// Returning `false` drops the candidate frame without aborting the
    /// stream.
    fn validate_checksum(&self, _frame: &Frame) -> bool {
        true
    }
}

/// Reads `reader` until end of stream, extracting frames per `decoder` and
/// handing each one to `handler`.
///
/// Framing errors are never fatal: the decoder resynchronizes on the next
/// sentinel and keeps going. Handler errors are logged and the loop
/// continues. The handler is invoked inline, so handlers that need to do
/// slow work must offload it themselves.
///
/// Returns `Ok(())` on a clean end of stream, the I/O error on a failed
/// read, and a buffer-overflow error once the accumulation buffer exceeds
/// four times the configured maximum frame size.
pub async fn decode_frames<R, D, H>(
    reader: &mut R,
    decoder: &D,
    buf_size: usize,
    mut handler: H,
) -> AppResult<()>
where
    R: AsyncRead + Unpin,
    D: FrameDecoder + ?Sized,
    H: FnMut(Frame) -> AppResult<()>,
{
    let cfg = decoder.config().clone();
    cfg.validate()?;

    let buf_size = if buf_size == 0 {
        DEFAULT_READ_CHUNK
    } else {
        buf_size
    };
    let max_size = cfg.effective_max_frame_size();
    let mut buf = BytesMut::with_capacity(buf_size);

    loop {
        // drain every complete frame currently buffered
        loop {
            match parse_frame(&buf, &cfg) {
                Progress::Emit { frame, consumed } => {
                    buf.advance(consumed);
                    if !decoder.validate_checksum(&frame) {
                        debug!(len = frame.raw.len(), "dropping frame with bad checksum");
                        continue;
                    }
                    if let Err(e) = handler(frame) {
                        warn!(error = %e, "frame handler error");
                    }
                }
                Progress::Skip { consumed } => {
                    let err =
                        AppError::InvalidFrame(format!("{} byte prefix skipped", consumed));
                    debug!(error = %err, "resynchronizing");
                    buf.advance(consumed);
                }
                Progress::NeedMore => break,
            }
        }

        if buf.len() > max_size * 4 {
            return Err(AppError::BufferOverflow(buf.len()));
        }

        if 0 == reader.read_buf(&mut buf).await? {
            // clean end of stream; any partial frame left behind is dropped
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::network::{ByteOrder, FramingKind};

    struct TestDecoder {
        config: FrameConfig,
        reject_checksum: bool,
    }

    impl TestDecoder {
        fn tlv() -> Self {
            TestDecoder {
                config: FrameConfig {
                    start_bytes: vec![0xfc, 0xfe],
                    end_bytes: vec![0xfc, 0xee],
                    byte_order: ByteOrder::Big,
                    length_offset: 2,
                    length_width: 2,
                    total_length_adjust: 4,
                    checksum_offset: -3,
                    checksum_width: 1,
                    max_frame_size: 64,
                    kind: FramingKind::Tlv,
                },
                reject_checksum: false,
            }
        }

        fn line() -> Self {
            TestDecoder {
                config: FrameConfig {
                    end_bytes: vec![b'\r', b'\n'],
                    kind: FramingKind::HeadTail,
                    ..FrameConfig::default()
                },
                reject_checksum: false,
            }
        }
    }

    impl FrameDecoder for TestDecoder {
        fn config(&self) -> &FrameConfig {
            &self.config
        }

        fn validate_checksum(&self, _frame: &Frame) -> bool {
            !self.reject_checksum
        }
    }

    fn tlv_frame(body: &[u8], checksum: u8) -> Vec<u8> {
        let length = (body.len() + 3) as u16; // body + checksum + end sentinel
        let mut out = vec![0xfc, 0xfe];
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(body);
        out.push(checksum);
        out.extend_from_slice(&[0xfc, 0xee]);
        out
    }

    #[tokio::test]
    async fn two_frames_in_one_read() {
        let mut input = tlv_frame(&[0xaa, 0xbb, 0xcc], 0x11);
        input.extend(tlv_frame(&[0xdd, 0xee, 0xff], 0x22));

        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();
        let mut reader = Cursor::new(input);
        decode_frames(&mut reader, &TestDecoder::tlv(), 1024, |frame| {
            sink.lock().unwrap().push(frame.body.to_vec());
            Ok(())
        })
        .await
        .unwrap();

        let bodies = bodies.lock().unwrap();
        assert_eq!(bodies.as_slice(), &[vec![0xaa, 0xbb, 0xcc], vec![0xdd, 0xee, 0xff]]);
    }

    #[tokio::test]
    async fn garbage_prefix_is_skipped() {
        let mut input = vec![0x00, 0x11, 0x22];
        input.extend(tlv_frame(&[0xaa, 0xbb, 0xcc], 0x11));

        let count = AtomicUsize::new(0);
        let mut reader = Cursor::new(input);
        decode_frames(&mut reader, &TestDecoder::tlv(), 1024, |frame| {
            assert_eq!(frame.body.as_ref(), &[0xaa, 0xbb, 0xcc]);
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chunked_delivery_yields_same_frames() {
        let mut stream = tlv_frame(&[0xaa, 0xbb, 0xcc], 0x11);
        stream.extend(tlv_frame(&[0xdd, 0xee, 0xff], 0x22));
        stream.extend(tlv_frame(&[0x01], 0x33));

        for chunk_size in [1usize, 2, 3, 7, 64] {
            let (client, mut server) = tokio::io::duplex(256);
            let data = stream.clone();
            let writer = tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let mut client = client;
                for chunk in data.chunks(chunk_size) {
                    client.write_all(chunk).await.unwrap();
                }
            });

            let bodies = Arc::new(Mutex::new(Vec::new()));
            let sink = bodies.clone();
            decode_frames(&mut server, &TestDecoder::tlv(), 8, |frame| {
                sink.lock().unwrap().push(frame.body.to_vec());
                Ok(())
            })
            .await
            .unwrap();
            writer.await.unwrap();

            let bodies = bodies.lock().unwrap();
            assert_eq!(
                bodies.as_slice(),
                &[vec![0xaa, 0xbb, 0xcc], vec![0xdd, 0xee, 0xff], vec![0x01]],
                "chunk size {}",
                chunk_size
            );
        }
    }

    #[tokio::test]
    async fn line_frames() {
        let mut reader = Cursor::new(b"hello\r\nworld\r\n".to_vec());
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();
        decode_frames(&mut reader, &TestDecoder::line(), 1024, |frame| {
            sink.lock().unwrap().push(String::from_utf8(frame.body.to_vec()).unwrap());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(bodies.lock().unwrap().as_slice(), &["hello", "world"]);
    }

    #[tokio::test]
    async fn checksum_rejection_drops_frame_and_continues() {
        let mut input = tlv_frame(&[0xaa], 0x00);
        input.extend(tlv_frame(&[0xbb], 0x00));
        let decoder = TestDecoder {
            reject_checksum: true,
            ..TestDecoder::tlv()
        };
        let count = AtomicUsize::new(0);
        let mut reader = Cursor::new(input);
        decode_frames(&mut reader, &decoder, 1024, |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_does_not_abort() {
        let mut input = tlv_frame(&[0xaa], 0x00);
        input.extend(tlv_frame(&[0xbb], 0x00));
        let count = AtomicUsize::new(0);
        let mut reader = Cursor::new(input);
        decode_frames(&mut reader, &TestDecoder::tlv(), 1024, |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Err(AppError::IllegalState("handler refused".into()))
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oversized_buffer_is_fatal() {
        let mut decoder = TestDecoder::tlv();
        decoder.config.max_frame_size = 8;
        // a never-completing frame: header promises far more than arrives
        let mut input = vec![0xfc, 0xfe, 0xff, 0xff];
        input.extend(std::iter::repeat(0x00).take(64));
        let mut reader = Cursor::new(input);
        let err = decode_frames(&mut reader, &decoder, 16, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BufferOverflow(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let decoder = TestDecoder {
            config: FrameConfig {
                kind: FramingKind::Tlv,
                ..FrameConfig::default()
            },
            reject_checksum: false,
        };
        let mut reader = Cursor::new(Vec::new());
        let err = decode_frames(&mut reader, &decoder, 1024, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }
}
