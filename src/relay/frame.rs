//! SSH Relay v4 frame codec.
//!
//! Every relay message is one binary WebSocket frame beginning with a 2-byte
//! big-endian tag. Client-visible tags:
//!
//! ```text
//! | 0x0001 CONNECT_SUCCESS_SID   | 4B length | session-id text |
//! | 0x0002 RECONNECT_SUCCESS_ACK | 8B cumulative bytes confirmed |
//! | 0x0004 DATA                  | 4B length | payload | trailing bytes |
//! | 0x0007 ACK                   | 8B cumulative bytes received |
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TAG_CONNECT_SUCCESS_SID: u16 = 0x0001;
pub const TAG_RECONNECT_SUCCESS_ACK: u16 = 0x0002;
pub const TAG_DATA: u16 = 0x0004;
pub const TAG_ACK: u16 = 0x0007;

/// Per-DATA-frame payload cap mandated by the protocol (16 KiB).
pub const MAX_DATA_PAYLOAD: usize = 16 * 1024;

const TAG_LEN: usize = 2;
const LEN_FIELD: usize = 4;
const ACK_FIELD: usize = 8;
const DATA_HEADER_LEN: usize = TAG_LEN + LEN_FIELD;

/// A decoded inbound relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// Session id issued on a fresh connect; enables reconnect.
    ConnectSuccessSid { sid: String },
    /// Bytes of ours the relay had durably accepted at reconnect time.
    ReconnectSuccessAck { ack: u64 },
    /// Inbound payload. A raw message may carry bytes past the declared
    /// length; they are surfaced as `remainder` for the caller to dispose of.
    Data { payload: Bytes, remainder: Bytes },
    /// Cumulative count of client-sent bytes the relay has accepted.
    Ack { ack: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: needed {expected} more bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown frame tag 0x{0:04x}")]
    UnknownTag(u16),
}

fn need(data: &Bytes, n: usize) -> Result<(), FrameError> {
    if data.remaining() < n {
        return Err(FrameError::Truncated {
            expected: n,
            actual: data.remaining(),
        });
    }
    Ok(())
}

/// Decode one inbound binary WebSocket message.
///
/// An unknown tag is an error value the read loop logs and drops; it never
/// terminates the session.
pub fn decode(mut data: Bytes) -> Result<RelayFrame, FrameError> {
    need(&data, TAG_LEN)?;
    let tag = data.get_u16();
    match tag {
        TAG_CONNECT_SUCCESS_SID => {
            need(&data, LEN_FIELD)?;
            let len = data.get_u32() as usize;
            need(&data, len)?;
            let sid_bytes = data.split_to(len);
            // The relay issues ASCII ids in practice; the id is opaque and
            // only ever echoed back into the reconnect URL.
            let sid = String::from_utf8_lossy(&sid_bytes).into_owned();
            Ok(RelayFrame::ConnectSuccessSid { sid })
        }
        TAG_RECONNECT_SUCCESS_ACK => {
            need(&data, ACK_FIELD)?;
            Ok(RelayFrame::ReconnectSuccessAck {
                ack: data.get_u64(),
            })
        }
        TAG_DATA => {
            need(&data, LEN_FIELD)?;
            let len = data.get_u32() as usize;
            need(&data, len)?;
            let payload = data.split_to(len);
            Ok(RelayFrame::Data {
                payload,
                remainder: data,
            })
        }
        TAG_ACK => {
            need(&data, ACK_FIELD)?;
            Ok(RelayFrame::Ack { ack: data.get_u64() })
        }
        other => Err(FrameError::UnknownTag(other)),
    }
}

/// Encode an ACK frame carrying our cumulative inbound byte count (10 bytes).
pub fn encode_ack(bytes_received: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(TAG_LEN + ACK_FIELD);
    buf.put_u16(TAG_ACK);
    buf.put_u64(bytes_received);
    buf.freeze()
}

/// Encode a DATA frame. `payload` must not exceed [`MAX_DATA_PAYLOAD`].
pub fn encode_data(payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_DATA_PAYLOAD);
    let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + payload.len());
    buf.put_u16(TAG_DATA);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_round_trip() {
        let payload = vec![0xabu8; 1234];
        let frame = encode_data(&payload);
        match decode(frame).unwrap() {
            RelayFrame::Data {
                payload: got,
                remainder,
            } => {
                assert_eq!(&got[..], &payload[..]);
                assert!(remainder.is_empty());
            }
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn data_round_trip_max_payload() {
        let payload = vec![7u8; MAX_DATA_PAYLOAD];
        let frame = encode_data(&payload);
        assert_eq!(frame.len(), DATA_HEADER_LEN + MAX_DATA_PAYLOAD);
        match decode(frame).unwrap() {
            RelayFrame::Data { payload: got, .. } => assert_eq!(got.len(), MAX_DATA_PAYLOAD),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn data_surfaces_trailing_remainder() {
        let mut raw = BytesMut::new();
        raw.put_u16(TAG_DATA);
        raw.put_u32(3);
        raw.put_slice(b"abcXYZ");
        match decode(raw.freeze()).unwrap() {
            RelayFrame::Data { payload, remainder } => {
                assert_eq!(&payload[..], b"abc");
                assert_eq!(&remainder[..], b"XYZ");
            }
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn sid_decoding() {
        let mut raw = BytesMut::new();
        raw.put_u16(TAG_CONNECT_SUCCESS_SID);
        raw.put_u32(5);
        raw.put_slice(b"s-123");
        assert_eq!(
            decode(raw.freeze()).unwrap(),
            RelayFrame::ConnectSuccessSid {
                sid: "s-123".to_string()
            }
        );
    }

    #[test]
    fn ack_wire_layout() {
        let frame = encode_ack(0x0102030405060708);
        assert_eq!(
            &frame[..],
            &[0x00, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
        assert_eq!(
            decode(frame).unwrap(),
            RelayFrame::Ack {
                ack: 0x0102030405060708
            }
        );
    }

    #[test]
    fn reconnect_ack_decoding() {
        let mut raw = BytesMut::new();
        raw.put_u16(TAG_RECONNECT_SUCCESS_ACK);
        raw.put_u64(67890);
        assert_eq!(
            decode(raw.freeze()).unwrap(),
            RelayFrame::ReconnectSuccessAck { ack: 67890 }
        );
    }

    #[test]
    fn unknown_tag_is_reported_not_fatal() {
        let mut raw = BytesMut::new();
        raw.put_u16(0x00ff);
        raw.put_u64(1);
        match decode(raw.freeze()) {
            Err(FrameError::UnknownTag(0x00ff)) => {}
            other => panic!("expected unknown tag, got {other:?}"),
        }
    }

    #[test]
    fn truncated_frames_error_cleanly() {
        assert!(decode(Bytes::from_static(&[0x00])).is_err());
        // DATA header claims more payload than the message carries.
        let mut raw = BytesMut::new();
        raw.put_u16(TAG_DATA);
        raw.put_u32(10);
        raw.put_slice(b"abc");
        assert!(matches!(
            decode(raw.freeze()),
            Err(FrameError::Truncated { .. })
        ));
    }
}
