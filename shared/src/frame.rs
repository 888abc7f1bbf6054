//! Frame codec and stream records
//!
//! A frame is the fixed 32-bit [`MAGIC_MARKER`] followed by the payload bytes.
//! On the TCP stream every frame is carried in a record prefixed with its
//! big-endian `u32` length, so a frame split across reads (or several frames
//! arriving in one read) is reassembled before [`decode`] ever sees it.
//!
//! ```text
//! record: [4 bytes: frame length][frame]
//! frame:  [4 bytes: magic marker][N bytes: envelope payload]
//! ```
//!
//! A frame failing marker validation is never handed to the application;
//! the reader stops and the connection is torn down. No resync is attempted.

use crate::error::{NetError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC_MARKER: u32 = 0x0bad_babe;
pub const MARKER_LEN: usize = 4;
const RECORD_HEADER_LEN: usize = 4;

/// Upper bound for a single frame (marker included)
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Prepends the magic marker to `payload`.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(MARKER_LEN + payload.len());
    frame.put_u32(MAGIC_MARKER);
    frame.put_slice(payload);
    frame.freeze()
}

/// Validates the marker and returns the payload that follows it.
pub fn decode(frame: &[u8]) -> Result<Bytes> {
    if frame.len() < MARKER_LEN {
        return Err(NetError::MalformedFrame);
    }

    let (marker, payload) = frame.split_at(MARKER_LEN);
    let marker = u32::from_be_bytes([marker[0], marker[1], marker[2], marker[3]]);
    if !is_magic_marker(marker) {
        return Err(NetError::MalformedFrame);
    }

    Ok(Bytes::copy_from_slice(payload))
}

pub fn is_magic_marker(bits: u32) -> bool {
    bits == MAGIC_MARKER
}

/// Frames `payload` and wraps it in a length record ready to be written.
pub fn encode_record(payload: &[u8]) -> Result<Bytes> {
    let frame_len = MARKER_LEN + payload.len();
    if frame_len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(frame_len));
    }

    let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN + frame_len);
    record.put_u32(frame_len as u32);
    record.put_u32(MAGIC_MARKER);
    record.put_slice(payload);
    Ok(record.freeze())
}

pub async fn write_record<W>(writer: &mut W, record: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(record).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one record from the stream and returns the frame it carries.
///
/// `Ok(None)` means the peer closed the stream cleanly on a record boundary.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < RECORD_HEADER_LEN {
        reader.read_exact(&mut header[first..]).await?;
    }

    let frame_len = u32::from_be_bytes(header) as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge(frame_len));
    }

    let mut frame = BytesMut::zeroed(frame_len);
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_encode_prepends_marker() {
        let frame = encode(b"hello");
        assert_eq!(&frame[..4], &MAGIC_MARKER.to_be_bytes());
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_decode_returns_payload() {
        let payloads: [&[u8]; 4] = [b"", b"x", b"some longer payload", &[0u8; 300]];
        for payload in payloads {
            let decoded = decode(&encode(payload)).unwrap();
            assert_eq!(&decoded[..], payload);
        }
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        for len in 0..MARKER_LEN {
            let buf = vec![0x0b; len];
            assert!(matches!(decode(&buf), Err(NetError::MalformedFrame)));
        }
    }

    #[test]
    fn test_decode_rejects_wrong_marker() {
        let mut frame = encode(b"payload").to_vec();
        frame[3] ^= 0x01;
        assert!(matches!(decode(&frame), Err(NetError::MalformedFrame)));
    }

    #[test]
    fn test_marker_must_match_exactly() {
        assert!(is_magic_marker(MAGIC_MARKER));
        assert!(!is_magic_marker(u32::MAX));
        assert!(!is_magic_marker(0));
        assert!(!is_magic_marker(MAGIC_MARKER | 0x1000_0000));
    }

    #[test]
    fn test_encode_record_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_LEN];
        assert!(matches!(
            encode_record(&payload),
            Err(NetError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_record_survives_split_writes() {
        let (mut tx, mut rx) = duplex(64);
        let record = encode_record(b"split across reads").unwrap();

        let writer = tokio::spawn(async move {
            for chunk in record.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let frame = read_record(&mut rx).await.unwrap().unwrap();
        writer.await.unwrap();
        assert_eq!(&decode(&frame).unwrap()[..], b"split across reads");
    }

    #[tokio::test]
    async fn test_coalesced_records_are_separated() {
        let (mut tx, mut rx) = duplex(1024);
        let mut both = encode_record(b"first").unwrap().to_vec();
        both.extend_from_slice(&encode_record(b"second").unwrap());
        write_record(&mut tx, &both).await.unwrap();
        drop(tx);

        let first = read_record(&mut rx).await.unwrap().unwrap();
        let second = read_record(&mut rx).await.unwrap().unwrap();
        assert_eq!(&decode(&first).unwrap()[..], b"first");
        assert_eq!(&decode(&second).unwrap()[..], b"second");
        assert!(read_record(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_record_header_is_rejected() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let result = read_record(&mut rx).await;
        assert!(matches!(result, Err(NetError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_record_is_an_io_error() {
        let (mut tx, mut rx) = duplex(64);
        tx.write_all(&16u32.to_be_bytes()).await.unwrap();
        tx.write_all(b"short").await.unwrap();
        drop(tx);

        let result = read_record(&mut rx).await;
        assert!(matches!(result, Err(NetError::Io(_))));
    }
}
