//! Value capture
//!
//! Converts tracked values to JSON at capture time without ever failing the
//! call: a value serde cannot represent is kept as `Unserializable` and only
//! dropped when the trace is exported.
//!
//! Tracked arguments are declared explicitly through [`TracedArgs`] rather
//! than discovered from a call signature.

use std::collections::HashSet;
use std::fmt;

use serde::ser::{self, Impossible, Serialize, SerializeTuple, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::error::TraceError;

/// A tracked value, converted to JSON when possible
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedValue {
    Json(Value),
    Unserializable { reason: String },
}

impl CapturedValue {
    pub fn capture<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => CapturedValue::Json(v),
            Err(e) => CapturedValue::Unserializable {
                reason: e.to_string(),
            },
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            CapturedValue::Json(v) => Some(v),
            CapturedValue::Unserializable { .. } => None,
        }
    }

    pub fn is_serializable(&self) -> bool {
        matches!(self, CapturedValue::Json(_))
    }
}

impl From<Value> for CapturedValue {
    fn from(value: Value) -> Self {
        CapturedValue::Json(value)
    }
}

/// Explicit list of the tracked parameters of one traced call
///
/// ```rust,ignore
/// let args = TracedArgs::new()
///     .arg("input_data", &input)
///     .arg("temperature", &0.2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracedArgs {
    entries: Vec<(String, CapturedValue)>,
}

impl TracedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare one tracked parameter
    pub fn arg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        self.entries
            .push((name.into(), CapturedValue::capture(value)));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Every name must be non-empty and declared once
    pub fn validate(&self) -> Result<(), TraceError> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for (name, _) in &self.entries {
            if name.is_empty() || !seen.insert(name.as_str()) {
                return Err(TraceError::UnbindableArgument { name: name.clone() });
            }
        }
        Ok(())
    }

    pub(crate) fn into_entries(self) -> Vec<(String, CapturedValue)> {
        self.entries
    }
}

/// Capture a computation result for the output side of a step
///
/// Tuples (and fixed-size arrays) are recorded element-wise as `result_0`,
/// `result_1`, ...; anything else as a single `result`. An element that
/// cannot be captured is logged and skipped without affecting its siblings.
pub fn capture_result<T: Serialize + ?Sized>(value: &T) -> Vec<(String, CapturedValue)> {
    let named: Vec<(String, CapturedValue)> = match value.serialize(TupleProbe) {
        Ok(elements) => elements
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("result_{i}"), v))
            .collect(),
        Err(NotTuple) => vec![("result".to_string(), CapturedValue::capture(value))],
    };

    named
        .into_iter()
        .filter(|(name, captured)| match captured {
            CapturedValue::Json(_) => true,
            CapturedValue::Unserializable { reason } => {
                warn!(name = %name, reason = %reason, "could not capture result");
                false
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────
// Tuple detection: a serializer that only accepts `serialize_tuple`
// ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct NotTuple;

impl fmt::Display for NotTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not a tuple")
    }
}

impl std::error::Error for NotTuple {}

impl ser::Error for NotTuple {
    fn custom<T: fmt::Display>(_msg: T) -> Self {
        NotTuple
    }
}

struct TupleProbe;

struct TupleElements(Vec<CapturedValue>);

impl SerializeTuple for TupleElements {
    type Ok = Vec<CapturedValue>;
    type Error = NotTuple;

    fn serialize_element<T>(&mut self, value: &T) -> Result<(), NotTuple>
    where
        T: ?Sized + Serialize,
    {
        self.0.push(CapturedValue::capture(value));
        Ok(())
    }

    fn end(self) -> Result<Vec<CapturedValue>, NotTuple> {
        Ok(self.0)
    }
}

macro_rules! reject_scalars {
    ($($method:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> Result<Self::Ok, NotTuple> {
                Err(NotTuple)
            }
        )*
    };
}

impl Serializer for TupleProbe {
    type Ok = Vec<CapturedValue>;
    type Error = NotTuple;
    type SerializeSeq = Impossible<Vec<CapturedValue>, NotTuple>;
    type SerializeTuple = TupleElements;
    type SerializeTupleStruct = Impossible<Vec<CapturedValue>, NotTuple>;
    type SerializeTupleVariant = Impossible<Vec<CapturedValue>, NotTuple>;
    type SerializeMap = Impossible<Vec<CapturedValue>, NotTuple>;
    type SerializeStruct = Impossible<Vec<CapturedValue>, NotTuple>;
    type SerializeStructVariant = Impossible<Vec<CapturedValue>, NotTuple>;

    reject_scalars! {
        serialize_bool(bool),
        serialize_i8(i8),
        serialize_i16(i16),
        serialize_i32(i32),
        serialize_i64(i64),
        serialize_u8(u8),
        serialize_u16(u16),
        serialize_u32(u32),
        serialize_u64(u64),
        serialize_f32(f32),
        serialize_f64(f64),
        serialize_char(char),
        serialize_str(&str),
        serialize_bytes(&[u8]),
        serialize_unit_struct(&'static str),
    }

    fn serialize_none(self) -> Result<Self::Ok, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_some<T>(self, _value: &T) -> Result<Self::Ok, NotTuple>
    where
        T: ?Sized + Serialize,
    {
        Err(NotTuple)
    }

    fn serialize_unit(self) -> Result<Self::Ok, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<Self::Ok, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_newtype_struct<T>(self, _name: &'static str, _value: &T) -> Result<Self::Ok, NotTuple>
    where
        T: ?Sized + Serialize,
    {
        Err(NotTuple)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Self::Ok, NotTuple>
    where
        T: ?Sized + Serialize,
    {
        Err(NotTuple)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple, NotTuple> {
        Ok(TupleElements(Vec::with_capacity(len)))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, NotTuple> {
        Err(NotTuple)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, NotTuple> {
        Err(NotTuple)
    }
}
