//! CTL wire format (§4.4, §6): fixed-size records over a message-preserving
//! local-IPC socket. All integers are host byte order, since this protocol
//! never crosses a machine boundary.

use crate::attr::{AttrType, AttrValue};
use crate::error::XcmError;

/// Bounded string length for an attribute name on the wire.
pub const MAX_NAME_LEN: usize = 64;
/// Bounded byte length for an attribute value on the wire.
pub const MAX_VALUE_LEN: usize = 256;
/// Compile-time maximum attribute count in a `GET_ALL_ATTR_CFM` (§4.4).
pub const MAX_ATTRS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordTag {
    GetAttrReq = 1,
    GetAttrCfm = 2,
    GetAttrRej = 3,
    GetAllAttrReq = 4,
    GetAllAttrCfm = 5,
}

impl RecordTag {
    fn from_u8(b: u8) -> Result<Self, XcmError> {
        match b {
            1 => Ok(Self::GetAttrReq),
            2 => Ok(Self::GetAttrCfm),
            3 => Ok(Self::GetAttrRej),
            4 => Ok(Self::GetAllAttrReq),
            5 => Ok(Self::GetAllAttrCfm),
            _ => Err(XcmError::Protocol(format!("unknown CTL record tag {b}"))),
        }
    }
}

/// A single wire-encoded attribute: `{ name, type, value_bytes, value_len }`
/// (§6).
#[derive(Debug, Clone, PartialEq)]
pub struct WireAttr {
    pub name: String,
    pub value: AttrValue,
}

impl WireAttr {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), XcmError> {
        encode_bounded_str(&self.name, MAX_NAME_LEN, buf)?;
        buf.push(self.value.attr_type() as u8);
        let value_bytes = encode_attr_value(&self.value);
        if value_bytes.len() > MAX_VALUE_LEN {
            return Err(XcmError::Overflow(format!(
                "attribute {:?} value is {} bytes, exceeds wire max {MAX_VALUE_LEN}",
                self.name,
                value_bytes.len()
            )));
        }
        buf.extend_from_slice(&(value_bytes.len() as u16).to_ne_bytes());
        buf.extend_from_slice(&value_bytes);
        Ok(())
    }

    fn decode(cursor: &mut Cursor) -> Result<Self, XcmError> {
        let name = decode_bounded_str(cursor, MAX_NAME_LEN)?;
        let tag = cursor.take_u8()?;
        let value_len = cursor.take_u16()? as usize;
        let value_bytes = cursor.take(value_len)?;
        let value = decode_attr_value(tag, value_bytes)?;
        Ok(WireAttr { name, value })
    }
}

fn encode_attr_value(v: &AttrValue) -> Vec<u8> {
    match v {
        AttrValue::Bool(b) => vec![*b as u8],
        AttrValue::Int64(i) => i.to_ne_bytes().to_vec(),
        AttrValue::Str(s) => {
            let mut v = s.as_bytes().to_vec();
            v.push(0); // NUL-terminated, per §4.3.
            v
        }
        AttrValue::Bin(b) => b.clone(),
    }
}

fn decode_attr_value(tag: u8, bytes: &[u8]) -> Result<AttrValue, XcmError> {
    match AttrType::from_u8(tag)? {
        AttrType::Bool => Ok(AttrValue::Bool(*bytes.first().unwrap_or(&0) != 0)),
        AttrType::Int64 => {
            let arr: [u8; 8] = bytes
                .try_into()
                .map_err(|_| XcmError::Protocol("int64 attribute has wrong wire length".into()))?;
            Ok(AttrValue::Int64(i64::from_ne_bytes(arr)))
        }
        AttrType::Str => {
            let s = bytes.strip_suffix(&[0]).unwrap_or(bytes);
            Ok(AttrValue::Str(String::from_utf8_lossy(s).into_owned()))
        }
        AttrType::Bin => Ok(AttrValue::Bin(bytes.to_vec())),
    }
}

impl AttrType {
    fn from_u8(b: u8) -> Result<Self, XcmError> {
        match b {
            0 => Ok(AttrType::Bool),
            1 => Ok(AttrType::Int64),
            2 => Ok(AttrType::Str),
            3 => Ok(AttrType::Bin),
            _ => Err(XcmError::Protocol(format!("unknown attribute wire type {b}"))),
        }
    }
}

/// A decoded CTL request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetAttr { name: String },
    GetAllAttr,
}

/// A decoded CTL response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    GetAttrCfm(WireAttr),
    GetAttrRej { errno: u8 },
    GetAllAttrCfm(Vec<WireAttr>),
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>, XcmError> {
        let mut buf = Vec::new();
        match self {
            Request::GetAttr { name } => {
                buf.push(RecordTag::GetAttrReq as u8);
                encode_bounded_str(name, MAX_NAME_LEN, &mut buf)?;
            }
            Request::GetAllAttr => {
                buf.push(RecordTag::GetAllAttrReq as u8);
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, XcmError> {
        let mut cursor = Cursor::new(bytes);
        let tag = RecordTag::from_u8(cursor.take_u8()?)?;
        match tag {
            RecordTag::GetAttrReq => {
                let name = decode_bounded_str(&mut cursor, MAX_NAME_LEN)?;
                Ok(Request::GetAttr { name })
            }
            RecordTag::GetAllAttrReq => Ok(Request::GetAllAttr),
            _ => Err(XcmError::Protocol("expected a request record".into())),
        }
    }
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, XcmError> {
        let mut buf = Vec::new();
        match self {
            Response::GetAttrCfm(attr) => {
                buf.push(RecordTag::GetAttrCfm as u8);
                attr.encode(&mut buf)?;
            }
            Response::GetAttrRej { errno } => {
                buf.push(RecordTag::GetAttrRej as u8);
                buf.push(*errno);
            }
            Response::GetAllAttrCfm(attrs) => {
                if attrs.len() > MAX_ATTRS {
                    return Err(XcmError::Overflow(format!(
                        "{} attributes exceeds wire max {MAX_ATTRS}",
                        attrs.len()
                    )));
                }
                buf.push(RecordTag::GetAllAttrCfm as u8);
                buf.push(attrs.len() as u8);
                for attr in attrs {
                    attr.encode(&mut buf)?;
                }
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, XcmError> {
        let mut cursor = Cursor::new(bytes);
        let tag = RecordTag::from_u8(cursor.take_u8()?)?;
        match tag {
            RecordTag::GetAttrCfm => Ok(Response::GetAttrCfm(WireAttr::decode(&mut cursor)?)),
            RecordTag::GetAttrRej => Ok(Response::GetAttrRej { errno: cursor.take_u8()? }),
            RecordTag::GetAllAttrCfm => {
                let count = cursor.take_u8()? as usize;
                let mut attrs = Vec::with_capacity(count);
                for _ in 0..count {
                    attrs.push(WireAttr::decode(&mut cursor)?);
                }
                Ok(Response::GetAllAttrCfm(attrs))
            }
            _ => Err(XcmError::Protocol("expected a response record".into())),
        }
    }
}

fn encode_bounded_str(s: &str, max_len: usize, buf: &mut Vec<u8>) -> Result<(), XcmError> {
    let bytes = s.as_bytes();
    if bytes.len() > max_len {
        return Err(XcmError::Overflow(format!(
            "{s:?} is {} bytes, exceeds wire max {max_len}",
            bytes.len()
        )));
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn decode_bounded_str(cursor: &mut Cursor, max_len: usize) -> Result<String, XcmError> {
    let len = cursor.take_u8()? as usize;
    if len > max_len {
        return Err(XcmError::Protocol("bounded string exceeds wire max on decode".into()));
    }
    let bytes = cursor.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| XcmError::Protocol("invalid utf-8 in CTL record".into()))
}

/// A tiny cursor over a request/response byte slice; short reads become
/// `Protocol` errors, which the CTL slot state machine treats as a reason to
/// drop to `DEAD` (§4.4).
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], XcmError> {
        if self.pos + n > self.bytes.len() {
            return Err(XcmError::Protocol("short CTL record".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, XcmError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, XcmError> {
        let b = self.take(2)?;
        Ok(u16::from_ne_bytes([b[0], b[1]]))
    }
}
