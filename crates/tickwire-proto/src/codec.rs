use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{LEN_PREFIX, MAX_FRAME_LEN};
use crate::error::FrameError;
use crate::schema::{DEFAULT_FIELD, FieldLen, FrameSchema};

/// A decoded frame: field name to raw bytes, in schema order.
///
/// Frames produced by the implicit single-field schemas always contain a
/// `"data"` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBody {
    fields: Vec<(String, Bytes)>,
}

impl FrameBody {
    /// Wrap a bare payload as the implicit `"data"` field.
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        Self {
            fields: vec![(DEFAULT_FIELD.to_string(), payload.into())],
        }
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    /// The payload field: `"data"` when the schema defines it, otherwise
    /// the final field.
    pub fn payload(&self) -> &[u8] {
        self.get(DEFAULT_FIELD)
            .or_else(|| self.fields.last().map(|(_, b)| b))
            .map(|b| b.as_ref())
            .unwrap_or(&[])
    }

    /// Consume the frame, keeping only the payload field.
    pub fn into_payload(mut self) -> Bytes {
        if let Some(pos) = self.fields.iter().position(|(n, _)| n == DEFAULT_FIELD) {
            self.fields.swap_remove(pos).1
        } else if let Some((_, bytes)) = self.fields.pop() {
            bytes
        } else {
            Bytes::new()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.fields.iter().map(|(n, b)| (n.as_str(), b))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Encodes payloads into wire bytes and decodes wire bytes back into
/// frames for one configured [`FrameSchema`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    schema: FrameSchema,
}

impl FrameCodec {
    pub fn new(schema: FrameSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &FrameSchema {
        &self.schema
    }

    /// Frame an outgoing payload.
    ///
    /// Fixed frames are zero-padded up to the configured size; oversized
    /// payloads are rejected before anything touches the socket.
    /// Schema-driven frames pass through unchanged: the caller supplies
    /// bytes already laid out per the schema.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        match &self.schema {
            FrameSchema::LengthPrefixed => {
                if payload.len() > MAX_FRAME_LEN {
                    return Err(FrameError::FrameTooLarge(payload.len()));
                }
                let mut out = BytesMut::with_capacity(LEN_PREFIX + payload.len());
                out.put_u32_le(payload.len() as u32);
                out.put_slice(payload);
                Ok(out.freeze())
            }
            FrameSchema::Fixed(size) => {
                if payload.len() > *size {
                    return Err(FrameError::PayloadTooLarge {
                        len: payload.len(),
                        max: *size,
                    });
                }
                let mut out = BytesMut::zeroed(*size);
                out[..payload.len()].copy_from_slice(payload);
                Ok(out.freeze())
            }
            FrameSchema::Fields(_) => Ok(Bytes::copy_from_slice(payload)),
        }
    }

    /// Decode exactly one frame from the front of `buf`, returning the
    /// frame and the number of bytes consumed. `TooShort` means more
    /// bytes are needed.
    pub fn decode(&self, buf: &[u8]) -> Result<(FrameBody, usize), FrameError> {
        match &self.schema {
            FrameSchema::LengthPrefixed => {
                if buf.len() < LEN_PREFIX {
                    return Err(FrameError::TooShort);
                }
                let len = u32::from_le_bytes(
                    buf[..LEN_PREFIX].try_into().expect("prefix is 4 bytes"),
                ) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(FrameError::FrameTooLarge(len));
                }
                let total = LEN_PREFIX + len;
                if buf.len() < total {
                    return Err(FrameError::TooShort);
                }
                Ok((
                    FrameBody::from_payload(Bytes::copy_from_slice(&buf[LEN_PREFIX..total])),
                    total,
                ))
            }
            FrameSchema::Fixed(size) => {
                if buf.len() < *size {
                    return Err(FrameError::TooShort);
                }
                Ok((
                    FrameBody::from_payload(Bytes::copy_from_slice(&buf[..*size])),
                    *size,
                ))
            }
            FrameSchema::Fields(specs) => {
                let mut fields: Vec<(String, Bytes)> = Vec::with_capacity(specs.len());
                let mut offset = 0usize;
                for spec in specs {
                    let len = resolve_len(&spec.len, &fields, &spec.name)?;
                    if len > MAX_FRAME_LEN {
                        return Err(FrameError::FrameTooLarge(len));
                    }
                    if buf.len() < offset + len {
                        return Err(FrameError::TooShort);
                    }
                    fields.push((
                        spec.name.clone(),
                        Bytes::copy_from_slice(&buf[offset..offset + len]),
                    ));
                    offset += len;
                }
                Ok((FrameBody { fields }, offset))
            }
        }
    }

    /// Perform exactly one message's worth of blocking reads.
    ///
    /// A zero-byte read anywhere inside the frame is a graceful remote
    /// close ([`FrameError::PeerClosed`]), never a decoding error.
    pub fn read_one<R: Read>(&self, reader: &mut R) -> Result<FrameBody, FrameError> {
        match &self.schema {
            FrameSchema::LengthPrefixed => {
                let mut prefix = [0u8; LEN_PREFIX];
                read_full(reader, &mut prefix)?;
                let len = u32::from_le_bytes(prefix) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(FrameError::FrameTooLarge(len));
                }
                let mut body = vec![0u8; len];
                read_full(reader, &mut body)?;
                Ok(FrameBody::from_payload(body))
            }
            FrameSchema::Fixed(size) => {
                let mut body = vec![0u8; *size];
                read_full(reader, &mut body)?;
                Ok(FrameBody::from_payload(body))
            }
            FrameSchema::Fields(specs) => {
                let mut fields: Vec<(String, Bytes)> = Vec::with_capacity(specs.len());
                for spec in specs {
                    let len = resolve_len(&spec.len, &fields, &spec.name)?;
                    if len > MAX_FRAME_LEN {
                        return Err(FrameError::FrameTooLarge(len));
                    }
                    let mut buf = vec![0u8; len];
                    read_full(reader, &mut buf)?;
                    fields.push((spec.name.clone(), Bytes::from(buf)));
                }
                Ok(FrameBody { fields })
            }
        }
    }
}

fn resolve_len(
    len: &FieldLen,
    decoded: &[(String, Bytes)],
    field: &str,
) -> Result<usize, FrameError> {
    match len {
        FieldLen::Literal(n) => Ok(*n),
        FieldLen::Ref(reference) => {
            let Some((_, bytes)) = decoded.iter().find(|(n, _)| n == reference) else {
                return Err(FrameError::UnknownLengthRef {
                    field: field.to_string(),
                    reference: reference.clone(),
                });
            };
            let raw: [u8; 4] = bytes.as_ref().try_into().map_err(|_| {
                FrameError::BadLengthRef {
                    reference: reference.clone(),
                }
            })?;
            Ok(u32::from_le_bytes(raw) as usize)
        }
    }
}

/// Read until `buf` is full. Zero bytes from a blocking read means the
/// peer closed the stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut offset = 0;
    while offset < buf.len() {
        match reader.read(&mut buf[offset..]) {
            Ok(0) => return Err(FrameError::PeerClosed),
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}
