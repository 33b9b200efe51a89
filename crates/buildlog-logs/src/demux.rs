use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::debug;

use buildlog_types::LogRecord;

/// Length of a multiplexed frame header
pub const FRAME_HEADER_LEN: usize = 8;

/// Stream tag of stderr frames (0 = stdin, 1 = stdout)
const STDERR_TAG: u8 = 2;

/// Most the buffer grows ahead of a pending frame; the length field is
/// untrusted
const MAX_RESERVE: usize = 64 * 1024;

/// Incremental decoder for the runtime's multiplexed stdout/stderr framing.
///
/// Each frame is an 8 byte header followed by its payload. Byte 0 of the
/// header tags the origin stream, bytes 4..8 hold the big-endian payload
/// length. Frames are only emitted once completely buffered, so chunk
/// boundaries never change the decoded output.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultiplexedCodec;

impl MultiplexedCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MultiplexedCodec {
    type Item = LogRecord;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        let frame_len = FRAME_HEADER_LEN + length;
        if src.len() < frame_len {
            src.reserve((frame_len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        let is_error = src[0] == STDERR_TAG;
        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(length);

        Ok(Some(LogRecord::new(
            is_error,
            String::from_utf8_lossy(&payload).into_owned(),
        )))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(record) => Ok(Some(record)),
            None => {
                if !buf.is_empty() {
                    debug!(
                        remaining = buf.len(),
                        "Discarding incomplete frame at end of stream"
                    );
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

/// Decode one chunk of a tty stream, which carries raw text
pub fn decode_raw_chunk(chunk: &[u8], is_error: bool) -> LogRecord {
    LogRecord::new(is_error, String::from_utf8_lossy(chunk).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{StreamExt, stream};
    use proptest::prelude::*;
    use tokio_util::codec::FramedRead;
    use tokio_util::io::StreamReader;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Feed `input` to a fresh codec in the given chunk sizes
    fn decode_chunked(input: &[u8], chunk_sizes: &[usize]) -> Vec<LogRecord> {
        let mut codec = MultiplexedCodec::new();
        let mut buf = BytesMut::new();
        let mut records = Vec::new();
        let mut offset = 0;
        let mut sizes = chunk_sizes.iter().copied().cycle();

        while offset < input.len() {
            let size = sizes.next().unwrap_or(1).max(1);
            let end = (offset + size).min(input.len());
            buf.extend_from_slice(&input[offset..end]);
            offset = end;
            while let Some(record) = codec.decode(&mut buf).unwrap() {
                records.push(record);
            }
        }
        records
    }

    #[test]
    fn test_stdout_and_stderr_frames() {
        let mut input = frame(1, b"hello\n");
        input.extend(frame(2, b"err\n"));

        let records = decode_chunked(&input, &[input.len()]);
        assert_eq!(
            records,
            vec![LogRecord::stdout("hello\n"), LogRecord::stderr("err\n")]
        );
        let total: u64 = records.iter().map(LogRecord::byte_len).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut input = frame(1, b"hello\n");
        input.extend(frame(2, b"err\n"));

        assert_eq!(
            decode_chunked(&input, &[1]),
            decode_chunked(&input, &[input.len()])
        );
    }

    #[test]
    fn test_partial_payload_waits() {
        let input = frame(1, b"building...\n");
        let mut codec = MultiplexedCodec::new();
        let mut buf = BytesMut::from(&input[..input.len() - 3]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&input[input.len() - 3..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(LogRecord::stdout("building...\n"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_large_length_reserves_bounded() {
        let mut codec = MultiplexedCodec::new();
        let mut buf = BytesMut::from(&[1u8, 0, 0, 0, 0xff, 0xff, 0xff, 0xff][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.capacity() <= FRAME_HEADER_LEN + 2 * MAX_RESERVE);
        assert_eq!(buf.len(), FRAME_HEADER_LEN);

        let payload = vec![b'x'; 3 * MAX_RESERVE];
        let input = frame(1, &payload);
        let records = decode_chunked(&input, &[1000]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].byte_len(), payload.len() as u64);
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = MultiplexedCodec::new();
        let mut buf = BytesMut::from(&[1u8, 0, 0][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_zero_length_payload() {
        let mut input = frame(1, b"");
        input.extend(frame(1, b"next"));

        let records = decode_chunked(&input, &[3]);
        assert_eq!(
            records,
            vec![LogRecord::stdout(""), LogRecord::stdout("next")]
        );
    }

    #[test]
    fn test_stdin_tag_is_not_error() {
        let records = decode_chunked(&frame(0, b"x"), &[16]);
        assert_eq!(records, vec![LogRecord::stdout("x")]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let records = decode_chunked(&frame(1, &[b'o', b'k', 0xff]), &[16]);
        assert_eq!(records, vec![LogRecord::stdout("ok\u{fffd}")]);
    }

    #[test]
    fn test_eof_with_incomplete_frame() {
        let mut codec = MultiplexedCodec::new();
        let mut buf = BytesMut::from(&frame(1, b"truncated")[..10]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_over_one_byte_chunks() {
        let mut input = frame(1, b"hello\n");
        input.extend(frame(2, b"err\n"));

        let chunks: Vec<Result<Bytes, std::io::Error>> = input
            .iter()
            .map(|b| Ok(Bytes::copy_from_slice(&[*b])))
            .collect();
        let reader = StreamReader::new(stream::iter(chunks));
        let records: Vec<LogRecord> = FramedRead::new(reader, MultiplexedCodec::new())
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(
            records,
            vec![LogRecord::stdout("hello\n"), LogRecord::stderr("err\n")]
        );
    }

    #[test]
    fn test_raw_chunk() {
        assert_eq!(
            decode_raw_chunk(b"building...\n", false),
            LogRecord::stdout("building...\n")
        );
        assert_eq!(decode_raw_chunk(b"oops", true), LogRecord::stderr("oops"));
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_output(
            frames in proptest::collection::vec(
                (prop_oneof![Just(1u8), Just(2u8)], proptest::collection::vec(any::<u8>(), 0..64)),
                0..16,
            ),
            chunk_sizes in proptest::collection::vec(1usize..32, 1..8),
        ) {
            let input: Vec<u8> = frames
                .iter()
                .flat_map(|(tag, payload)| frame(*tag, payload))
                .collect();

            let whole = decode_chunked(&input, &[input.len().max(1)]);
            let chunked = decode_chunked(&input, &chunk_sizes);

            prop_assert_eq!(whole.len(), frames.len());
            prop_assert_eq!(whole, chunked);
        }
    }
}
