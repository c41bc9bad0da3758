// Frame codec for the master <-> worker protocol.
//
// Two framings share one socket, discriminated by the first two bytes:
//   text   : u16 BE length L, then L bytes of UTF-8 JSON envelope
//   binary : marker 0x0001, u32 BE payload length, fixed-width fields
//            (file-name 32, task-id 128, parent 64, menu 30), payload
// The fixed fields are space-padded on the right and trimmed on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;
use crate::letter::{BinaryLetter, Letter};

/// Hard cap on a binary frame's payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// First-two-bytes value that selects the binary framing.
const BINARY_MARKER: u16 = 1;

/// Fixed bytes preceding a binary payload: marker + length + fields.
const BINARY_HEADER_LEN: usize = 2
    + 4
    + BinaryLetter::FILE_NAME_FIELD_LEN
    + BinaryLetter::TASK_ID_FIELD_LEN
    + BinaryLetter::PARENT_FIELD_LEN
    + BinaryLetter::MENU_FIELD_LEN;

#[derive(Debug, Default)]
pub struct LetterCodec;

impl LetterCodec {
    pub fn new() -> Self {
        Self
    }
}

fn put_padded(dst: &mut BytesMut, field: &str, width: usize) -> Result<(), TransportError> {
    let raw = field.as_bytes();
    if raw.len() > width {
        return Err(TransportError::Malformed(format!(
            "field '{field}' exceeds its {width} byte slot"
        )));
    }
    dst.put_slice(raw);
    dst.put_bytes(b' ', width - raw.len());
    Ok(())
}

fn take_trimmed(src: &mut BytesMut, width: usize) -> Result<String, TransportError> {
    let raw = src.split_to(width);
    let text = std::str::from_utf8(&raw)
        .map_err(|_| TransportError::Malformed("binary header field is not UTF-8".into()))?;
    Ok(text.trim_matches(' ').to_string())
}

impl Decoder for LetterCodec {
    type Item = Letter;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Letter>, TransportError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let tag = u16::from_be_bytes([src[0], src[1]]);

        if tag == BINARY_MARKER {
            if src.len() < 6 {
                return Ok(None);
            }
            let payload_len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
            if payload_len > MAX_FRAME_LEN {
                return Err(TransportError::LengthExceeded(payload_len, MAX_FRAME_LEN));
            }

            let total = BINARY_HEADER_LEN + payload_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(6);
            let file_name = take_trimmed(src, BinaryLetter::FILE_NAME_FIELD_LEN)?;
            let tid = take_trimmed(src, BinaryLetter::TASK_ID_FIELD_LEN)?;
            let parent = take_trimmed(src, BinaryLetter::PARENT_FIELD_LEN)?;
            let menu = take_trimmed(src, BinaryLetter::MENU_FIELD_LEN)?;
            let payload: Bytes = src.split_to(payload_len).freeze();

            return Ok(Some(Letter::Binary(BinaryLetter {
                tid,
                file_name,
                parent,
                menu,
                payload,
            })));
        }

        // Text framing: the tag is the body length.
        let body_len = tag as usize;
        if src.len() < 2 + body_len {
            src.reserve(2 + body_len - src.len());
            return Ok(None);
        }

        src.advance(2);
        let body = src.split_to(body_len);
        let letter = Letter::from_json(&body)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        Ok(Some(letter))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Letter>, TransportError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            // Bytes left over at EOF mean the peer died mid-frame.
            None if !src.is_empty() => Err(TransportError::ConnectionClosed),
            None => Ok(None),
        }
    }
}

impl Encoder<Letter> for LetterCodec {
    type Error = TransportError;

    fn encode(&mut self, letter: Letter, dst: &mut BytesMut) -> Result<(), TransportError> {
        if let Letter::Binary(bin) = &letter {
            if bin.payload.len() > MAX_FRAME_LEN {
                return Err(TransportError::LengthExceeded(bin.payload.len(), MAX_FRAME_LEN));
            }

            dst.reserve(BINARY_HEADER_LEN + bin.payload.len());
            dst.put_u16(BINARY_MARKER);
            dst.put_u32(bin.payload.len() as u32);
            put_padded(dst, &bin.file_name, BinaryLetter::FILE_NAME_FIELD_LEN)?;
            put_padded(dst, &bin.tid, BinaryLetter::TASK_ID_FIELD_LEN)?;
            put_padded(dst, &bin.parent, BinaryLetter::PARENT_FIELD_LEN)?;
            put_padded(dst, &bin.menu, BinaryLetter::MENU_FIELD_LEN)?;
            dst.put_slice(&bin.payload);
            return Ok(());
        }

        let body = letter.to_json();
        if body.len() > u16::MAX as usize {
            return Err(TransportError::LengthExceeded(body.len(), u16::MAX as usize));
        }

        dst.reserve(2 + body.len());
        dst.put_u16(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::letter::{HeartbeatLetter, StateCode, ResponseLetter};

    fn round_trip(letter: Letter) -> Letter {
        let mut codec = LetterCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(letter, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decoder must consume the whole frame");
        decoded
    }

    #[test]
    fn test_text_frame_round_trip() {
        let letter = Letter::Response(ResponseLetter::new("w1", "7_B2", StateCode::Finished));
        assert_eq!(round_trip(letter.clone()), letter);
    }

    #[test]
    fn test_binary_frame_round_trip() {
        let letter = Letter::Binary(BinaryLetter::new(
            "7_B2",
            Bytes::from_static(b"artifact-bytes"),
            "app.bin",
            "v1.0",
            "GL8900",
        ));
        assert_eq!(round_trip(letter.clone()), letter);
    }

    #[test]
    fn test_binary_end_of_stream() {
        let letter = Letter::Binary(BinaryLetter::end_of_stream("7_B2", "app.bin", "v1.0"));
        match round_trip(letter) {
            Letter::Binary(bin) => assert!(bin.is_end_of_stream()),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = LetterCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Letter::Heartbeat(HeartbeatLetter::new("w1", 3)),
                &mut full,
            )
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 4..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_eof_mid_frame_is_connection_error() {
        let mut codec = LetterCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Letter::Heartbeat(HeartbeatLetter::new("w1", 0)),
                &mut full,
            )
            .unwrap();

        let mut truncated = BytesMut::from(&full[..5]);
        match codec.decode_eof(&mut truncated) {
            Err(TransportError::ConnectionClosed) => {}
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[test]
    fn test_oversize_binary_rejected() {
        let mut src = BytesMut::new();
        src.put_u16(1);
        src.put_u32((MAX_FRAME_LEN + 1) as u32);
        src.put_bytes(b' ', 254);
        match LetterCodec::new().decode(&mut src) {
            Err(TransportError::LengthExceeded(..)) => {}
            other => panic!("expected length error, got {other:?}"),
        }
    }

    #[test]
    fn test_field_overflow_rejected_on_encode() {
        let letter = Letter::Binary(BinaryLetter::new(
            "t".repeat(BinaryLetter::TASK_ID_FIELD_LEN + 1),
            Bytes::new(),
            "f",
            "p",
            "",
        ));
        let mut buf = BytesMut::new();
        assert!(LetterCodec::new().encode(letter, &mut buf).is_err());
    }
}
