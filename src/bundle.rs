//! Bundle and message binary codec
//!
//! A bundle is the atomic append unit of a partition: 1..N messages framed as
//! a single on-disk record. The layout, as written inside a segment file:
//!
//! ```text
//! varint  content length (everything after this varint)
//! u8      bundle flags: bits 0-1 codec, bits 2-5 message count when 1..=15
//!         (0 means the count follows as a varint), bit 6 sparse
//! varint  message count              (only when not embedded in the flags)
//! u64 LE  first sequence number      (sparse bundles only)
//! varint  last - first - 1           (sparse bundles with count > 1)
//! bytes   message set, Snappy-compressed when codec = 1
//! ```
//!
//! Each message inside the set:
//!
//! ```text
//! u8      message flags (HAVE_KEY, USE_LAST_TS, SEQ_PREV_PLUS_ONE)
//! varint  seq delta from previous + 1   (sparse interior messages without
//!                                        SEQ_PREV_PLUS_ONE only)
//! u64 LE  timestamp ms                  (unless USE_LAST_TS)
//! u8+b    key length, key               (when HAVE_KEY)
//! varint  payload length, then payload  (zero-length payloads allowed)
//! ```
//!
//! Sparse bundles carry explicit first/last sequence numbers so a rewritten
//! log (compaction output, replicated tail) can skip sequence numbers without
//! breaking the dense ordering of the surrounding segments. In a non-sparse
//! bundle the first sequence number is implied by the position of the bundle
//! in the log and messages are consecutive.

use crate::error::{Result, TankError};
use crate::varint::{put_varu32, varu32_len, Reader};
use bytes::{BufMut, Bytes, BytesMut};

/// Keys are length-prefixed with a single byte.
pub const MAX_KEY_LEN: usize = 255;

const BUNDLE_CODEC_MASK: u8 = 0b11;
const BUNDLE_SPARSE_BIT: u8 = 1 << 6;
const BUNDLE_EMBEDDED_COUNT_MAX: u32 = 15;

const MSG_HAVE_KEY: u8 = 1;
const MSG_USE_LAST_TS: u8 = 2;
const MSG_SEQ_PREV_PLUS_ONE: u8 = 4;

/// Compression codec applied to a bundle's message set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Codec {
    /// No compression
    #[default]
    None = 0,
    /// Snappy raw-block compression
    Snappy = 1,
}

impl Codec {
    /// Decode the codec id from the bundle flags byte. Ids 2 and 3 are
    /// reserved; the decoder rejects them rather than guessing.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::None),
            1 => Some(Self::Snappy),
            _ => None,
        }
    }
}

/// A single message stored in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Dense per-partition sequence number
    pub seq_num: u64,
    /// Milliseconds since epoch
    pub ts: u64,
    /// Optional key, at most [`MAX_KEY_LEN`] bytes
    pub key: Option<Bytes>,
    /// Payload; empty together with a key marks a tombstone
    pub payload: Bytes,
}

impl Message {
    /// A keyed message with an empty payload requests deletion of the key
    /// under the compaction policy.
    pub fn is_tombstone(&self) -> bool {
        self.key.is_some() && self.payload.is_empty()
    }
}

/// Bundle prefix decoded without touching the message set.
///
/// The index rebuild, lookup scans and the compaction clean-range pass walk
/// segment files bundle by bundle; decoding just the prefix lets them skip
/// message sets without decompressing anything.
#[derive(Debug, Clone, Copy)]
pub struct BundleHeader {
    /// Whole record length including the leading length varint
    pub total_len: usize,
    /// Declared message count
    pub msg_count: u32,
    /// `(first_seq, last_seq)` for sparse bundles
    pub sparse: Option<(u64, u64)>,
}

impl BundleHeader {
    /// Sequence range covered by this bundle, given the running sequence
    /// number implied by the preceding bundle.
    pub fn seq_range(&self, next_seq: u64) -> (u64, u64) {
        match self.sparse {
            Some(range) => range,
            None => (next_seq, next_seq + u64::from(self.msg_count) - 1),
        }
    }
}

/// A fully decoded bundle
#[derive(Debug)]
pub struct DecodedBundle {
    pub first_seq: u64,
    pub last_seq: u64,
    pub msgs: Vec<Message>,
}

/// Decode the bundle prefix at the start of `buf`.
pub fn read_bundle_header(buf: &[u8]) -> Result<BundleHeader> {
    let mut r = Reader::new(buf);
    let len = r.read_varu32()? as usize;
    if r.remaining() < len {
        return Err(TankError::malformed(
            "bundle",
            format!("truncated: {} content bytes, {} available", len, r.remaining()),
        ));
    }
    let total_len = r.position() + len;

    let flags = r.read_u8()?;
    if Codec::from_byte(flags & BUNDLE_CODEC_MASK).is_none() {
        return Err(TankError::malformed(
            "bundle",
            format!("unknown codec id {}", flags & BUNDLE_CODEC_MASK),
        ));
    }
    let embedded = u32::from((flags >> 2) & 0xf);
    let msg_count = if embedded != 0 { embedded } else { r.read_varu32()? };
    if msg_count == 0 {
        return Err(TankError::malformed("bundle", "zero message count"));
    }

    let sparse = if flags & BUNDLE_SPARSE_BIT != 0 {
        let first = r.read_u64_le()?;
        let last = if msg_count != 1 {
            first + u64::from(r.read_varu32()?) + 1
        } else {
            first
        };
        Some((first, last))
    } else {
        None
    };

    Ok(BundleHeader {
        total_len,
        msg_count,
        sparse,
    })
}

/// Decode the bundle at the start of `buf`.
///
/// `next_seq` is the sequence number the first message takes when the bundle
/// is not sparse, i.e. `last_seq + 1` of the preceding bundle or the
/// segment's base sequence number. Returns the number of bytes consumed and
/// the decoded messages.
pub fn decode_bundle(buf: &[u8], next_seq: u64) -> Result<(usize, DecodedBundle)> {
    let mut r = Reader::new(buf);
    let len = r.read_varu32()? as usize;
    if r.remaining() < len {
        return Err(TankError::malformed(
            "bundle",
            format!("truncated: {} content bytes, {} available", len, r.remaining()),
        ));
    }
    let total_len = r.position() + len;
    let content = r.read_bytes(len)?;

    let mut c = Reader::new(content);
    let flags = c.read_u8()?;
    let codec = Codec::from_byte(flags & BUNDLE_CODEC_MASK).ok_or_else(|| {
        TankError::malformed("bundle", format!("unknown codec id {}", flags & BUNDLE_CODEC_MASK))
    })?;
    let sparse = flags & BUNDLE_SPARSE_BIT != 0;
    let embedded = u32::from((flags >> 2) & 0xf);
    let msg_count = if embedded != 0 { embedded } else { c.read_varu32()? };
    if msg_count == 0 {
        return Err(TankError::malformed("bundle", "zero message count"));
    }

    let (sparse_first, sparse_last) = if sparse {
        let first = c.read_u64_le()?;
        let last = if msg_count != 1 {
            first + u64::from(c.read_varu32()?) + 1
        } else {
            first
        };
        (first, last)
    } else {
        (0, 0)
    };

    let set_raw = c.read_bytes(c.remaining())?;
    let decompressed;
    let set: &[u8] = match codec {
        Codec::None => set_raw,
        Codec::Snappy => {
            decompressed = snap::raw::Decoder::new()
                .decompress_vec(set_raw)
                .map_err(|e| TankError::malformed("snappy", e.to_string()))?;
            &decompressed
        }
    };

    let mut msgs = Vec::with_capacity(msg_count as usize);
    let mut m = Reader::new(set);
    let mut seq = next_seq;
    let mut last_ts = 0u64;
    let mut idx = 0u32;

    // The message set is walked to exhaustion; msg_count only drives the
    // first/last detection for sparse sequence reconstruction.
    while !m.is_empty() {
        let mflags = m.read_u8()?;

        if sparse {
            if idx == 0 {
                seq = sparse_first;
            } else if idx + 1 == msg_count {
                seq = sparse_last;
            } else if mflags & MSG_SEQ_PREV_PLUS_ONE != 0 {
                // seq already advanced past the previous message
            } else {
                seq += u64::from(m.read_varu32()?);
            }
        }

        if mflags & MSG_USE_LAST_TS == 0 {
            last_ts = m.read_u64_le()?;
        }

        let key = if mflags & MSG_HAVE_KEY != 0 {
            let key_len = m.read_u8()? as usize;
            Some(Bytes::copy_from_slice(m.read_bytes(key_len)?))
        } else {
            None
        };

        let payload_len = m.read_varu32()? as usize;
        let payload = Bytes::copy_from_slice(m.read_bytes(payload_len)?);

        msgs.push(Message {
            seq_num: seq,
            ts: last_ts,
            key,
            payload,
        });
        seq += 1;
        idx += 1;
    }

    if msgs.is_empty() {
        return Err(TankError::malformed("bundle", "empty message set"));
    }

    let first_seq = msgs[0].seq_num;
    let last_seq = msgs[msgs.len() - 1].seq_num;
    Ok((
        total_len,
        DecodedBundle {
            first_seq,
            last_seq,
            msgs,
        },
    ))
}

/// Encode `msgs` as one on-disk bundle record, including the leading length
/// varint.
///
/// Non-sparse bundles require consecutive sequence numbers; sparse bundles
/// require strictly increasing ones. Message keys longer than
/// [`MAX_KEY_LEN`] are rejected.
pub fn encode_bundle(msgs: &[Message], codec: Codec, sparse: bool) -> Result<Bytes> {
    if msgs.is_empty() {
        return Err(TankError::malformed("bundle", "cannot encode an empty bundle"));
    }

    for pair in msgs.windows(2) {
        if sparse {
            if pair[1].seq_num <= pair[0].seq_num {
                return Err(TankError::malformed(
                    "bundle",
                    "sparse bundle sequence numbers must be strictly increasing",
                ));
            }
        } else if pair[1].seq_num != pair[0].seq_num + 1 {
            return Err(TankError::malformed(
                "bundle",
                "non-sparse bundle requires consecutive sequence numbers",
            ));
        }
    }

    let mut set = BytesMut::new();
    let mut prev_ts: Option<u64> = None;
    for (i, msg) in msgs.iter().enumerate() {
        let mut flags = 0u8;
        let mut seq_delta: Option<u32> = None;

        let interior = sparse && i > 0 && i + 1 != msgs.len();
        if interior {
            let prev = msgs[i - 1].seq_num;
            if msg.seq_num == prev + 1 {
                flags |= MSG_SEQ_PREV_PLUS_ONE;
            } else {
                let delta = msg.seq_num - prev - 1;
                seq_delta = Some(u32::try_from(delta).map_err(|_| {
                    TankError::malformed("bundle", "sequence gap too wide for a sparse bundle")
                })?);
            }
        }
        if prev_ts == Some(msg.ts) {
            flags |= MSG_USE_LAST_TS;
        }
        if msg.key.is_some() {
            flags |= MSG_HAVE_KEY;
        }

        set.put_u8(flags);
        if let Some(delta) = seq_delta {
            put_varu32(&mut set, delta);
        }
        if prev_ts != Some(msg.ts) {
            set.put_u64_le(msg.ts);
            prev_ts = Some(msg.ts);
        }
        if let Some(key) = &msg.key {
            if key.len() > MAX_KEY_LEN {
                return Err(TankError::malformed(
                    "bundle",
                    format!("key of {} bytes exceeds the {} byte limit", key.len(), MAX_KEY_LEN),
                ));
            }
            set.put_u8(key.len() as u8);
            set.put_slice(key);
        }
        let payload_len = u32::try_from(msg.payload.len())
            .map_err(|_| TankError::malformed("bundle", "payload exceeds 4 GiB"))?;
        put_varu32(&mut set, payload_len);
        set.put_slice(&msg.payload);
    }

    let set_bytes: Vec<u8> = match codec {
        Codec::None => set.to_vec(),
        Codec::Snappy => snap::raw::Encoder::new()
            .compress_vec(&set)
            .map_err(|e| TankError::malformed("snappy", e.to_string()))?,
    };

    let count = msgs.len() as u32;
    let first = msgs[0].seq_num;
    let last = msgs[msgs.len() - 1].seq_num;

    let mut flags = codec as u8;
    if sparse {
        flags |= BUNDLE_SPARSE_BIT;
    }
    if count <= BUNDLE_EMBEDDED_COUNT_MAX {
        flags |= (count as u8) << 2;
    }

    let mut content = BytesMut::with_capacity(set_bytes.len() + 32);
    content.put_u8(flags);
    if count > BUNDLE_EMBEDDED_COUNT_MAX {
        put_varu32(&mut content, count);
    }
    if sparse {
        content.put_u64_le(first);
        if count > 1 {
            let span = u32::try_from(last - first - 1).map_err(|_| {
                TankError::malformed("bundle", "sparse bundle spans too many sequence numbers")
            })?;
            put_varu32(&mut content, span);
        }
    }
    content.put_slice(&set_bytes);

    let content_len = u32::try_from(content.len())
        .map_err(|_| TankError::malformed("bundle", "bundle exceeds 4 GiB"))?;
    let mut out = BytesMut::with_capacity(varu32_len(content_len) + content.len());
    put_varu32(&mut out, content_len);
    out.put_slice(&content);
    Ok(out.freeze())
}
