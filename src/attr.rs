//! Attribute framework (C4): a typed key/value registry attached to every
//! socket, combining the common attributes every socket carries (§4.3) with
//! whatever attributes the owning transport contributes.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::XcmError;

/// A typed attribute value. Stands in for the C API's "buffer + capacity +
/// type tag" shape -- Rust's enum carries both the type and the value, so
/// there is no fixed-size out-buffer to overflow on the Rust side of the
/// API; "overflow" only resurfaces at the CTL wire boundary (§4.4), where a
/// value genuinely has to fit a bounded byte record.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int64(i64),
    Str(String),
    Bin(Vec<u8>),
}

/// The value's type tag, used both for get/set type-checking and on the wire
/// (§6: CTL wire format `value_type (tag)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttrType {
    Bool = 0,
    Int64 = 1,
    Str = 2,
    Bin = 3,
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::Int64(_) => AttrType::Int64,
            AttrValue::Str(_) => AttrType::Str,
            AttrValue::Bin(_) => AttrType::Bin,
        }
    }

    pub fn as_bool(&self) -> Result<bool, XcmError> {
        match self {
            AttrValue::Bool(b) => Ok(*b),
            _ => Err(XcmError::Protocol("attribute is not bool".into())),
        }
    }

    pub fn as_i64(&self) -> Result<i64, XcmError> {
        match self {
            AttrValue::Int64(v) => Ok(*v),
            _ => Err(XcmError::Protocol("attribute is not int64".into())),
        }
    }

    pub fn as_str(&self) -> Result<&str, XcmError> {
        match self {
            AttrValue::Str(s) => Ok(s.as_str()),
            _ => Err(XcmError::Protocol("attribute is not string".into())),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int64(v) => write!(f, "{v}"),
            AttrValue::Str(s) => write!(f, "{s}"),
            AttrValue::Bin(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Names of the common, always-present attributes (§4.3).
pub mod names {
    pub const BLOCKING: &str = "xcm.blocking";
    pub const TYPE: &str = "xcm.type";
    pub const TRANSPORT: &str = "xcm.transport";
    pub const LOCAL_ADDR: &str = "xcm.local_addr";
    pub const REMOTE_ADDR: &str = "xcm.remote_addr";
    pub const MAX_MSG_SIZE: &str = "xcm.max_msg_size";

    pub const CNT_TO_APP_MSGS: &str = "xcm.to_app_msgs";
    pub const CNT_FROM_APP_MSGS: &str = "xcm.from_app_msgs";
    pub const CNT_TO_LOWER_MSGS: &str = "xcm.to_lower_msgs";
    pub const CNT_FROM_LOWER_MSGS: &str = "xcm.from_lower_msgs";
    pub const CNT_TO_APP_BYTES: &str = "xcm.to_app_bytes";
    pub const CNT_FROM_APP_BYTES: &str = "xcm.from_app_bytes";
    pub const CNT_TO_LOWER_BYTES: &str = "xcm.to_lower_bytes";
    pub const CNT_FROM_LOWER_BYTES: &str = "xcm.from_lower_bytes";

    /// The eight per-connection counter attribute names, in a stable order.
    pub const COUNTERS: [&str; 8] = [
        CNT_TO_APP_MSGS,
        CNT_FROM_APP_MSGS,
        CNT_TO_LOWER_MSGS,
        CNT_FROM_LOWER_MSGS,
        CNT_TO_APP_BYTES,
        CNT_FROM_APP_BYTES,
        CNT_TO_LOWER_BYTES,
        CNT_FROM_LOWER_BYTES,
    ];
}

/// An unordered key -> typed-value collection, the input to the `*_a`
/// creation variants (§6).
#[derive(Debug, Clone, Default)]
pub struct AttrMap {
    values: BTreeMap<String, AttrValue>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Visitor callback shape for [`get_all_attrs`]: invoked once per attribute
/// with its name and current value.
pub type AttrVisitor<'a> = dyn FnMut(&str, &AttrValue) + 'a;

/// Something that can report its own attribute values and accept new ones.
/// Both [`crate::socket::SocketCore`]'s common attributes and a transport's
/// private attributes implement this shape, collapsed by
/// [`get_all_attrs`]/`get_attr`/`set_attr` in `socket.rs`.
pub trait AttrSource {
    /// Read-only or read-write attribute names this source exposes right
    /// now (lifecycle-dependent, e.g. `local_addr` only pre-connect).
    fn attr_names(&self) -> Vec<String>;

    fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError>;

    /// Returns `Permission` if the attribute is read-only or not writable in
    /// the current lifecycle state.
    fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<(), XcmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        blocking: bool,
    }

    impl AttrSource for Fake {
        fn attr_names(&self) -> Vec<String> {
            vec![names::BLOCKING.to_string()]
        }

        fn get_attr(&self, name: &str) -> Result<AttrValue, XcmError> {
            if name == names::BLOCKING {
                Ok(AttrValue::Bool(self.blocking))
            } else {
                Err(XcmError::Protocol("no such attribute".into()))
            }
        }

        fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<(), XcmError> {
            if name == names::BLOCKING {
                self.blocking = value.as_bool()?;
                Ok(())
            } else {
                Err(XcmError::Permission(name.to_string()))
            }
        }
    }

    #[test]
    fn round_trip_set_then_get() {
        let mut f = Fake { blocking: true };
        f.set_attr(names::BLOCKING, &AttrValue::Bool(false)).unwrap();
        assert_eq!(f.get_attr(names::BLOCKING).unwrap().as_bool().unwrap(), false);
    }

    #[test]
    fn unknown_attribute_is_permission_denied_on_set() {
        let mut f = Fake { blocking: true };
        let err = f.set_attr("bogus", &AttrValue::Bool(true)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Permission);
    }

    #[test]
    fn attr_map_stores_and_retrieves() {
        let mut m = AttrMap::new();
        m.set(names::BLOCKING, AttrValue::Bool(true));
        assert_eq!(m.get(names::BLOCKING).unwrap().as_bool().unwrap(), true);
        assert!(m.get("missing").is_none());
    }
}
