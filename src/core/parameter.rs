//! Fields that may hold either a concrete value or a `<+...>` expression

use crate::core::error::PlanError;
use serde::de::{DeserializeOwned, Error as DeError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Returns true when `s` contains an unresolved `<+...>` expression
pub fn is_expression(s: &str) -> bool {
    s.contains("<+")
}

/// A configuration value that is either known at compile time or is an
/// expression resolved later (runtime input, matrix placeholder, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterField<T> {
    Value(T),
    Expression(String),
}

impl<T> ParameterField<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            ParameterField::Value(v) => Some(v),
            ParameterField::Expression(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            ParameterField::Value(v) => Some(v),
            ParameterField::Expression(_) => None,
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match self {
            ParameterField::Value(_) => None,
            ParameterField::Expression(e) => Some(e),
        }
    }

    pub fn is_expression(&self) -> bool {
        matches!(self, ParameterField::Expression(_))
    }

    /// The concrete value, or an `UnresolvedExpression` error naming `field`
    pub fn concrete(&self, field: &str) -> Result<&T, PlanError> {
        match self {
            ParameterField::Value(v) => Ok(v),
            ParameterField::Expression(e) => Err(PlanError::UnresolvedExpression {
                field: field.to_string(),
                expression: e.clone(),
            }),
        }
    }
}

impl ParameterField<String> {
    /// String form of the field, expression text included
    pub fn as_str(&self) -> &str {
        match self {
            ParameterField::Value(v) => v,
            ParameterField::Expression(e) => e,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.as_str().trim().is_empty()
    }
}

impl<T> From<T> for ParameterField<T> {
    fn from(value: T) -> Self {
        ParameterField::Value(value)
    }
}

impl<T: Serialize> Serialize for ParameterField<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ParameterField::Value(v) => v.serialize(serializer),
            ParameterField::Expression(e) => serializer.serialize_str(e),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for ParameterField<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        if let serde_yaml::Value::String(s) = &value {
            if is_expression(s) {
                return Ok(ParameterField::Expression(s.clone()));
            }
        }
        serde_yaml::from_value(value)
            .map(ParameterField::Value)
            .map_err(D::Error::custom)
    }
}

/// String form of an optional string field, expressions included
pub fn string_of(field: &Option<ParameterField<String>>) -> Option<&str> {
    field.as_ref().map(ParameterField::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct Holder {
        flag: ParameterField<bool>,
        refs: ParameterField<Vec<String>>,
    }

    #[test]
    fn test_values_and_expressions() {
        let holder: Holder = serde_yaml::from_str("flag: true\nrefs: [a, b]\n").unwrap();
        assert_eq!(holder.flag, ParameterField::Value(true));
        assert_eq!(holder.refs.value().unwrap().len(), 2);

        let holder: Holder =
            serde_yaml::from_str("flag: <+input>\nrefs: <+matrix.serviceRef>\n").unwrap();
        assert!(holder.flag.is_expression());
        assert_eq!(holder.refs.expression(), Some("<+matrix.serviceRef>"));
        assert!(holder.flag.concrete("deployToAll").is_err());
    }

    #[test]
    fn test_serializes_back_to_plain_form() {
        let holder = Holder {
            flag: ParameterField::Expression("<+input>".to_string()),
            refs: ParameterField::Value(vec!["a".to_string()]),
        };
        let json = serde_json::to_value(&holder).unwrap();
        assert_eq!(json["flag"], "<+input>");
        assert_eq!(json["refs"][0], "a");
    }
}
