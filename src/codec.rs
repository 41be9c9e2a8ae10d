//! Serialization strategy for payloads.
//!
//! History stores inputs and results as opaque [`Payload`] strings. The
//! engine never assumes a format; it goes through the [`Converter`] supplied
//! in [`EngineOptions`](crate::runtime::EngineOptions). [`JsonConverter`] is
//! the default.

use crate::errors::CodecError;
use crate::history::Payload;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// Converts between structured values and persisted payloads.
pub trait Converter: Send + Sync + fmt::Debug {
    fn to_payload(&self, value: &Value) -> Result<Payload, CodecError>;
    fn from_payload(&self, payload: &str) -> Result<Value, CodecError>;
}

/// Compact JSON text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonConverter;

impl Converter for JsonConverter {
    fn to_payload(&self, value: &Value) -> Result<Payload, CodecError> {
        serde_json::to_string(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn from_payload(&self, payload: &str) -> Result<Value, CodecError> {
        serde_json::from_str(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Encode any serializable value through `converter`.
pub fn encode<T: Serialize + ?Sized>(converter: &dyn Converter, value: &T) -> Result<Payload, CodecError> {
    let value = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
    converter.to_payload(&value)
}

/// Decode a payload produced by [`encode`].
pub fn decode<T: DeserializeOwned>(converter: &dyn Converter, payload: &str) -> Result<T, CodecError> {
    let value = converter.from_payload(payload)?;
    serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Argument lists for activities and workflow starts.
///
/// Implemented for `()`, tuples of serializable values and `Vec<T>`; each
/// element becomes one payload.
pub trait Args {
    fn into_payloads(self, converter: &dyn Converter) -> Result<Vec<Payload>, CodecError>;
}

impl Args for () {
    fn into_payloads(self, _converter: &dyn Converter) -> Result<Vec<Payload>, CodecError> {
        Ok(Vec::new())
    }
}

impl<T: Serialize> Args for Vec<T> {
    fn into_payloads(self, converter: &dyn Converter) -> Result<Vec<Payload>, CodecError> {
        self.iter().map(|v| encode(converter, v)).collect()
    }
}

macro_rules! impl_args_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: Serialize),+> Args for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_payloads(self, converter: &dyn Converter) -> Result<Vec<Payload>, CodecError> {
                let ($($name,)+) = self;
                Ok(vec![$(encode(converter, &$name)?),+])
            }
        }
    };
}

impl_args_for_tuple!(A);
impl_args_for_tuple!(A, B);
impl_args_for_tuple!(A, B, C);
impl_args_for_tuple!(A, B, C, D);
impl_args_for_tuple!(A, B, C, D, E);
impl_args_for_tuple!(A, B, C, D, E, F);

/// Collapse a payload list into one value: nothing becomes `null`, a single
/// payload is decoded as is, several become an array.
pub(crate) fn inputs_to_value(converter: &dyn Converter, inputs: &[Payload]) -> Result<Value, CodecError> {
    match inputs {
        [] => Ok(Value::Null),
        [single] => converter.from_payload(single),
        many => many
            .iter()
            .map(|p| converter.from_payload(p))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
    }
}
