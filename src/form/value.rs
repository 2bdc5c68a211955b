use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use rust_decimal::Decimal;

use super::controller::{FieldKey, FormError, FormResult};

pub type ValueMap = BTreeMap<FieldKey, FieldValue>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Text(String),
    Number(Decimal),
    List(Vec<FieldValue>),
    Map(ValueMap),
}

impl FieldValue {
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Bool(checked) => !checked,
            FieldValue::Number(_) => false,
            FieldValue::Text(text) => text.is_empty(),
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Map(entries) => entries.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            FieldValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            FieldValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<ValueMap> {
        match self {
            FieldValue::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Number(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Number(Decimal::from(value))
    }
}

impl From<ValueMap> for FieldValue {
    fn from(value: ValueMap) -> Self {
        FieldValue::Map(value)
    }
}

impl<T> From<Vec<T>> for FieldValue
where
    T: Into<FieldValue>,
{
    fn from(value: Vec<T>) -> Self {
        FieldValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T> From<Option<T>> for FieldValue
where
    T: Into<FieldValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

pub trait FromFieldValue: Sized {
    const EXPECTED: &'static str;

    fn from_field_value(value: &FieldValue) -> Option<Self>;
}

impl FromFieldValue for FieldValue {
    const EXPECTED: &'static str = "any value";

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromFieldValue for String {
    const EXPECTED: &'static str = "text";

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        value.as_text().map(str::to_owned)
    }
}

impl FromFieldValue for bool {
    const EXPECTED: &'static str = "a boolean";

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        value.as_bool()
    }
}

impl FromFieldValue for Decimal {
    const EXPECTED: &'static str = "a number";

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        value.as_number()
    }
}

impl FromFieldValue for i64 {
    const EXPECTED: &'static str = "an integer";

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        value
            .as_number()
            .filter(|number| number.fract().is_zero())
            .and_then(|number| i64::try_from(number).ok())
    }
}

impl FromFieldValue for ValueMap {
    const EXPECTED: &'static str = "a map";

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        value.as_map().cloned()
    }
}

impl<T> FromFieldValue for Option<T>
where
    T: FromFieldValue,
{
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Null => Some(None),
            other => T::from_field_value(other).map(Some),
        }
    }
}

impl<T> FromFieldValue for Vec<T>
where
    T: FromFieldValue,
{
    const EXPECTED: &'static str = "a list";

    fn from_field_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::List(items) => items.iter().map(T::from_field_value).collect(),
            _ => None,
        }
    }
}

/// Typed view over a form's value map, usually derived with
/// `#[derive(FormValues)]`.
pub trait FormValues: Sized {
    fn field_names() -> &'static [&'static str];
    fn to_values(&self) -> ValueMap;
    fn from_values(values: &ValueMap) -> FormResult<Self>;
}

pub fn decode_field<T>(values: &ValueMap, name: &str) -> FormResult<T>
where
    T: FromFieldValue,
{
    let value = values.get(name).unwrap_or(&FieldValue::Null);
    T::from_field_value(value).ok_or_else(|| FormError::Decode {
        field: FieldKey::from(name),
        expected: T::EXPECTED,
    })
}

pub const REQUIRED_MESSAGE: &str = "required";
pub const NOT_READY_MESSAGE: &str = "not ready yet";
pub const FETCH_FAILED_MESSAGE: &str = "fetch failed";

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FieldError(Arc<str>);

impl FieldError {
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self(message.into())
    }

    pub fn required() -> Self {
        Self::new(REQUIRED_MESSAGE)
    }

    pub fn not_ready() -> Self {
        Self::new(NOT_READY_MESSAGE)
    }

    pub fn fetch_failed() -> Self {
        Self::new(FETCH_FAILED_MESSAGE)
    }

    pub fn missing_fields<'a>(names: impl IntoIterator<Item = &'a FieldKey>) -> Self {
        let names = names
            .into_iter()
            .map(FieldKey::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Self::new(format!("Fields {names} is missing."))
    }

    pub fn validator_panicked(detail: &str) -> Self {
        Self::new(format!("validator panicked: {detail}"))
    }

    pub fn message(&self) -> &str {
        &self.0
    }

    pub fn is_not_ready(&self) -> bool {
        &*self.0 == NOT_READY_MESSAGE
    }

    pub fn is_fetch_failed(&self) -> bool {
        &*self.0 == FETCH_FAILED_MESSAGE
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FieldError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
