/// RTP packet model (RFC 3550)
///
/// Decodes the fixed 12-byte header plus CSRC list, header extension and
/// padding. The two derived fields (`playout_time_ms`, `duration_ms`) are
/// filled in by the jitter buffer, never by the wire.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed RTP header
pub const RTP_HEADER_LEN: usize = 12;

/// The only RTP version we accept
pub const RTP_VERSION: u8 = 2;

/// Reasons a datagram is not a usable RTP packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet too short for RTP header: {len} bytes")]
    Truncated { len: usize },

    #[error("unsupported RTP version {0}")]
    UnsupportedVersion(u8),

    #[error("CSRC count {csrc_count} does not fit in {len} bytes")]
    CsrcOverrun { csrc_count: u8, len: usize },

    #[error("header extension needs {needed} bytes, packet has {len}")]
    ExtensionOverrun { needed: usize, len: usize },

    #[error("padding of {padding} bytes exceeds {available} available")]
    InvalidPadding { padding: usize, available: usize },
}

/// Header extension (RFC 3550 section 5.3.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub profile: u16,
    pub data: Bytes,
}

/// A received (or to-be-sent) RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    pub extension: Option<HeaderExtension>,
    pub payload: Bytes,
    /// Local playout instant in ms, assigned by the jitter buffer's clock
    pub playout_time_ms: i64,
    /// Time until the next packet in ms; `None` until the right-hand
    /// neighbour is known
    pub duration_ms: Option<i64>,
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
            payload: payload.into(),
            playout_time_ms: 0,
            duration_ms: None,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Decode a datagram into a packet.
    ///
    /// Never panics; anything that isn't a well-formed version 2 packet is
    /// reported as a [`DecodeError`] so the caller can drop it before it
    /// reaches the jitter buffer.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(DecodeError::Truncated { len: data.len() });
        }

        let version = (data[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let has_padding = (data[0] & 0x20) != 0;
        let has_extension = (data[0] & 0x10) != 0;
        let csrc_count = data[0] & 0x0F;
        let marker = (data[1] & 0x80) != 0;
        let payload_type = data[1] & 0x7F;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN;
        let csrc_end = offset + csrc_count as usize * 4;
        if csrc_end > data.len() {
            return Err(DecodeError::CsrcOverrun {
                csrc_count,
                len: data.len(),
            });
        }
        let csrc = data[offset..csrc_end]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset = csrc_end;

        let extension = if has_extension {
            if offset + 4 > data.len() {
                return Err(DecodeError::ExtensionOverrun {
                    needed: offset + 4,
                    len: data.len(),
                });
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let ext_end = offset + 4 + words * 4;
            if ext_end > data.len() {
                return Err(DecodeError::ExtensionOverrun {
                    needed: ext_end,
                    len: data.len(),
                });
            }
            let ext = HeaderExtension {
                profile,
                data: Bytes::copy_from_slice(&data[offset + 4..ext_end]),
            };
            offset = ext_end;
            Some(ext)
        } else {
            None
        };

        let mut end = data.len();
        if has_padding {
            // Last octet counts the padding, itself included
            let padding = data[end - 1] as usize;
            let available = end - offset;
            if padding == 0 || padding > available {
                return Err(DecodeError::InvalidPadding { padding, available });
            }
            end -= padding;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: Bytes::copy_from_slice(&data[offset..end]),
            playout_time_ms: 0,
            duration_ms: None,
        })
    }

    /// Serialize to wire format. Padding is never emitted.
    pub fn encode(&self) -> Bytes {
        let ext_len = self.extension.as_ref().map_or(0, |e| 4 + padded_len(e.data.len()));
        let csrc_count = self.csrc.len().min(15);
        let mut buf =
            BytesMut::with_capacity(RTP_HEADER_LEN + csrc_count * 4 + ext_len + self.payload.len());

        let mut first = RTP_VERSION << 6 | csrc_count as u8;
        if self.extension.is_some() {
            first |= 0x10;
        }
        let mut second = self.payload_type & 0x7F;
        if self.marker {
            second |= 0x80;
        }
        buf.put_u8(first);
        buf.put_u8(second);
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for &csrc in self.csrc.iter().take(csrc_count) {
            buf.put_u32(csrc);
        }
        if let Some(ext) = &self.extension {
            let padded = padded_len(ext.data.len());
            buf.put_u16(ext.profile);
            buf.put_u16((padded / 4) as u16);
            buf.put_slice(&ext.data);
            buf.put_bytes(0, padded - ext.data.len());
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}
