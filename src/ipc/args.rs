//! Best-effort coercion of untyped script arguments into handler parameters.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Number, Value};
use thiserror::Error;

use super::IpcError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot convert {found} to {expected}")]
pub struct ArgError {
    pub expected: &'static str,
    pub found: String,
}

impl ArgError {
    fn new(expected: &'static str, value: &Value) -> Self {
        let mut found = value.to_string();
        if found.len() > 64 {
            let mut cut = 61;
            while !found.is_char_boundary(cut) {
                cut -= 1;
            }
            found.truncate(cut);
            found.push_str("...");
        }
        Self { expected, found }
    }
}

/// Conversion from one JSON argument.
pub trait FromArg: Sized {
    fn from_arg(value: Value) -> Result<Self, ArgError>;
}

impl FromArg for Value {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        Ok(value)
    }
}

impl FromArg for bool {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        match value {
            Value::Bool(flag) => Ok(flag),
            Value::Number(ref number) => Ok(number.as_f64().map_or(false, |n| n > 0.0)),
            Value::String(text) => Ok(!text.is_empty()),
            Value::Null => Ok(false),
            other => Err(ArgError::new("bool", &other)),
        }
    }
}

impl FromArg for String {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        Ok(match value {
            Value::String(text) => text,
            Value::Null => String::new(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            other => other.to_string(),
        })
    }
}

fn integer_from(value: &Value, expected: &'static str) -> Result<i128, ArgError> {
    match value {
        Value::Number(number) => number_to_integer(number).ok_or_else(|| ArgError::new(expected, value)),
        Value::Bool(flag) => Ok(i128::from(*flag)),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i128>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().and_then(float_to_integer))
                .ok_or_else(|| ArgError::new(expected, value))
        }
        Value::Null => Ok(0),
        _ => Err(ArgError::new(expected, value)),
    }
}

fn number_to_integer(number: &Number) -> Option<i128> {
    if let Some(n) = number.as_i64() {
        return Some(i128::from(n));
    }
    if let Some(n) = number.as_u64() {
        return Some(i128::from(n));
    }
    number.as_f64().and_then(float_to_integer)
}

fn float_to_integer(value: f64) -> Option<i128> {
    if value.is_finite() {
        Some(value.trunc() as i128)
    } else {
        None
    }
}

macro_rules! integer_from_arg {
    ($($ty:ty),*) => {
        $(
            impl FromArg for $ty {
                fn from_arg(value: Value) -> Result<Self, ArgError> {
                    let wide = integer_from(&value, stringify!($ty))?;
                    <$ty>::try_from(wide).map_err(|_| ArgError::new(stringify!($ty), &value))
                }
            }
        )*
    };
}

integer_from_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

fn float_from(value: &Value, expected: &'static str) -> Result<f64, ArgError> {
    match value {
        Value::Number(number) => number.as_f64().ok_or_else(|| ArgError::new(expected, value)),
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| ArgError::new(expected, value)),
        Value::Null => Ok(0.0),
        _ => Err(ArgError::new(expected, value)),
    }
}

impl FromArg for f64 {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        float_from(&value, "f64")
    }
}

impl FromArg for f32 {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        float_from(&value, "f32").map(|n| n as f32)
    }
}

impl<T: FromArg> FromArg for Option<T> {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_arg(other).map(Some),
        }
    }
}

impl<T: FromArg> FromArg for Vec<T> {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        match value {
            Value::Array(items) => items.into_iter().map(T::from_arg).collect(),
            Value::Null => Ok(Vec::new()),
            other => Err(ArgError::new("array", &other)),
        }
    }
}

impl<T: FromArg> FromArg for HashMap<String, T> {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        match value {
            Value::Object(entries) => entries
                .into_iter()
                .map(|(key, value)| T::from_arg(value).map(|value| (key, value)))
                .collect(),
            Value::Null => Ok(HashMap::new()),
            other => Err(ArgError::new("object", &other)),
        }
    }
}

/// Structured argument or reply decoded through serde.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromArg for Json<T> {
    fn from_arg(value: Value) -> Result<Self, ArgError> {
        let shown = value.clone();
        serde_json::from_value(value)
            .map(Json)
            .map_err(|_| ArgError::new(std::any::type_name::<T>(), &shown))
    }
}

/// Every remaining argument, each coerced to `T`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rest<T>(pub Vec<T>);

/// Positional arguments being consumed by a handler's parameter list.
pub struct ArgList {
    values: std::vec::IntoIter<Value>,
    index: usize,
}

impl ArgList {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into_iter(),
            index: 0,
        }
    }

    /// Missing trailing arguments read as null.
    fn next(&mut self) -> (usize, Value) {
        let index = self.index;
        self.index += 1;
        (index, self.values.next().unwrap_or(Value::Null))
    }
}

/// One handler parameter taken from an [`ArgList`].
pub trait Extract: Sized {
    fn extract(args: &mut ArgList) -> Result<Self, IpcError>;
}

impl<T: FromArg> Extract for T {
    fn extract(args: &mut ArgList) -> Result<Self, IpcError> {
        let (index, value) = args.next();
        T::from_arg(value).map_err(|source| IpcError::Argument { index, source })
    }
}

impl<T: FromArg> Extract for Rest<T> {
    fn extract(args: &mut ArgList) -> Result<Self, IpcError> {
        let start = args.index;
        let mut items = Vec::new();
        for (offset, value) in args.values.by_ref().enumerate() {
            let item = T::from_arg(value).map_err(|source| IpcError::Argument {
                index: start + offset,
                source,
            })?;
            items.push(item);
        }
        args.index = start + items.len();
        Ok(Rest(items))
    }
}

/// Conversion of a handler's return value into a reply.
pub trait IntoReply {
    fn into_reply(self) -> Result<Value, IpcError>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Value, IpcError> {
        Ok(Value::Null)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> Result<Value, IpcError> {
        Ok(self)
    }
}

macro_rules! plain_reply {
    ($($ty:ty),*) => {
        $(
            impl IntoReply for $ty {
                fn into_reply(self) -> Result<Value, IpcError> {
                    Ok(Value::from(self))
                }
            }
        )*
    };
}

plain_reply!(bool, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64, String, &'static str);

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Result<Value, IpcError> {
        match self {
            Some(value) => value.into_reply(),
            None => Ok(Value::Null),
        }
    }
}

impl<T: Serialize> IntoReply for Vec<T> {
    fn into_reply(self) -> Result<Value, IpcError> {
        serde_json::to_value(self).map_err(IpcError::from)
    }
}

impl<T: Serialize> IntoReply for Json<T> {
    fn into_reply(self) -> Result<Value, IpcError> {
        serde_json::to_value(self.0).map_err(IpcError::from)
    }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: std::fmt::Display,
{
    fn into_reply(self) -> Result<Value, IpcError> {
        match self {
            Ok(value) => value.into_reply(),
            Err(err) => Err(IpcError::Remote(err.to_string())),
        }
    }
}
