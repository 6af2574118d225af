//! Command payload decoding and value rendering.
//!
//! A catalog type alias is resolved once into a [`TypeTag`]. Inbound command
//! text is decoded against that tag into a [`Decoded`] value, which is then
//! narrowed into the device-native [`DeviceValue`] right before the write.
//! Device notifications travel the other way through [`DeviceValue::render`].

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

/// Payload validation errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("Invalid bool payload: {0}")]
    InvalidBool(String),

    #[error("Invalid numeric payload: {0}")]
    InvalidNumber(String),

    #[error("Negative value {value} not allowed for unsigned type {width}")]
    Negative { value: String, width: IntWidth },

    #[error("Value {value} out of range for {width}")]
    OutOfRange { value: String, width: IntWidth },
}

/// Declared integer width on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
}

impl IntWidth {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntWidth::Byte => "Byte",
            IntWidth::Int16 => "Int16",
            IntWidth::UInt16 => "UInt16",
            IntWidth::Int32 => "Int32",
            IntWidth::UInt32 => "UInt32",
            IntWidth::Int64 => "Int64",
        }
    }
}

impl fmt::Display for IntWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value kind of a catalog entry, resolved from its type alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Boolean,
    /// Integer family. `unsigned` rejects negative payloads independently of the width.
    Integer {
        width: IntWidth,
        unsigned: bool,
    },
    Float,
    Double,
    Text,
    DateTime,
    /// Unknown alias: boolean tokens, then floating point, then raw text.
    BestEffort,
}

impl TypeTag {
    /// Resolve a catalog type alias. Matching is case-insensitive.
    ///
    /// The alias to width table is fixed; device schemas rely on exact widths.
    pub fn from_alias(alias: &str) -> Self {
        let integer = |width, unsigned| TypeTag::Integer { width, unsigned };

        match alias.trim().to_lowercase().as_str() {
            "bool" | "boolean" => TypeTag::Boolean,
            "int" | "int16" => integer(IntWidth::Int16, false),
            "dint" | "int32" => integer(IntWidth::Int32, false),
            "sint" | "lint" => integer(IntWidth::Int64, false),
            "uint" | "uint16" | "word" => integer(IntWidth::UInt16, true),
            "udint" | "uint32" | "dword" => integer(IntWidth::UInt32, true),
            "byte" | "uint8" => integer(IntWidth::Byte, true),
            "usint" | "ulint" => integer(IntWidth::Int64, true),
            "float" | "real" => TypeTag::Float,
            "double" | "lreal" | "number" => TypeTag::Double,
            "string" | "str" => TypeTag::Text,
            "datetime" | "date" | "time" => TypeTag::DateTime,
            _ => TypeTag::BestEffort,
        }
    }
}

/// Payload decoded against a [`TypeTag`], before width narrowing.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

const TRUE_TOKENS: [&str; 4] = ["true", "1", "on", "yes"];
const FALSE_TOKENS: [&str; 4] = ["false", "0", "off", "no"];

/// Decode a command payload. Surrounding whitespace is ignored.
pub fn parse_payload(payload: &str, tag: TypeTag) -> Result<Decoded, PayloadError> {
    let value = payload.trim();

    match tag {
        TypeTag::Boolean => {
            let lower = value.to_lowercase();
            if TRUE_TOKENS.contains(&lower.as_str()) {
                Ok(Decoded::Bool(true))
            } else if FALSE_TOKENS.contains(&lower.as_str()) {
                Ok(Decoded::Bool(false))
            } else {
                Err(PayloadError::InvalidBool(payload.to_string()))
            }
        }
        TypeTag::Integer { width, unsigned } => {
            let number = parse_float(value)?;
            if !number.is_finite() {
                return Err(PayloadError::InvalidNumber(payload.to_string()));
            }

            // Float-tolerant: "3.0" and "3.7" both become 3.
            let truncated = number.trunc();
            if truncated < i64::MIN as f64 || truncated >= i64::MAX as f64 {
                return Err(PayloadError::OutOfRange {
                    value: value.to_string(),
                    width,
                });
            }

            let n = truncated as i64;
            if unsigned && n < 0 {
                return Err(PayloadError::Negative {
                    value: value.to_string(),
                    width,
                });
            }
            Ok(Decoded::Int(n))
        }
        TypeTag::Float | TypeTag::Double => parse_float(value).map(Decoded::Float),
        TypeTag::Text | TypeTag::DateTime => Ok(Decoded::Text(value.to_string())),
        TypeTag::BestEffort => {
            let lower = value.to_lowercase();
            match lower.as_str() {
                "true" | "on" | "1" => Ok(Decoded::Bool(true)),
                "false" | "off" | "0" => Ok(Decoded::Bool(false)),
                _ => Ok(value
                    .parse::<f64>()
                    .map(Decoded::Float)
                    .unwrap_or_else(|_| Decoded::Text(value.to_string()))),
            }
        }
    }
}

fn parse_float(value: &str) -> Result<f64, PayloadError> {
    value
        .parse::<f64>()
        .map_err(|_| PayloadError::InvalidNumber(value.to_string()))
}

/// Decode a command payload all the way to the device-native value.
pub fn decode_command(payload: &str, tag: TypeTag) -> Result<DeviceValue, PayloadError> {
    let decoded = parse_payload(payload, tag)?;
    DeviceValue::from_decoded(decoded, tag)
}

/// A device-native typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceValue {
    Null,
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
    ByteString(Vec<u8>),
    Array(Vec<DeviceValue>),
    /// Anything the bridge has no native form for, already stringified.
    Other(String),
}

impl DeviceValue {
    /// Narrow a decoded payload to the width declared by `tag`.
    pub fn from_decoded(decoded: Decoded, tag: TypeTag) -> Result<Self, PayloadError> {
        let value = match (tag, decoded) {
            (TypeTag::Integer { width, .. }, Decoded::Int(n)) => narrow(n, width)?,
            (TypeTag::Float, Decoded::Float(f)) => DeviceValue::Float(f as f32),
            (TypeTag::Double, Decoded::Float(f)) => DeviceValue::Double(f),
            (TypeTag::DateTime, Decoded::Text(text)) => parse_datetime(&text)
                .map(DeviceValue::DateTime)
                .unwrap_or(DeviceValue::String(text)),
            (_, Decoded::Bool(b)) => DeviceValue::Boolean(b),
            (_, Decoded::Int(n)) => DeviceValue::Int64(n),
            (_, Decoded::Float(f)) => DeviceValue::Double(f),
            (_, Decoded::Text(text)) => DeviceValue::String(text),
        };
        Ok(value)
    }

    /// Render for publishing on a state topic.
    ///
    /// Booleans become `true`/`false`, date/times ISO-8601, arrays JSON text,
    /// and a null value an empty payload.
    pub fn render(&self) -> Vec<u8> {
        match self {
            DeviceValue::Null => Vec::new(),
            DeviceValue::ByteString(bytes) => bytes.clone(),
            DeviceValue::Array(_) => self.to_json().to_string().into_bytes(),
            other => other.to_string().into_bytes(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            DeviceValue::Null => Value::Null,
            DeviceValue::Boolean(b) => Value::Bool(*b),
            DeviceValue::SByte(n) => Value::from(*n),
            DeviceValue::Byte(n) => Value::from(*n),
            DeviceValue::Int16(n) => Value::from(*n),
            DeviceValue::UInt16(n) => Value::from(*n),
            DeviceValue::Int32(n) => Value::from(*n),
            DeviceValue::UInt32(n) => Value::from(*n),
            DeviceValue::Int64(n) => Value::from(*n),
            DeviceValue::UInt64(n) => Value::from(*n),
            DeviceValue::Float(f) => Value::from(*f),
            DeviceValue::Double(f) => Value::from(*f),
            DeviceValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceValue::Null => Ok(()),
            DeviceValue::Boolean(b) => f.write_str(if *b { "true" } else { "false" }),
            DeviceValue::SByte(n) => write!(f, "{n}"),
            DeviceValue::Byte(n) => write!(f, "{n}"),
            DeviceValue::Int16(n) => write!(f, "{n}"),
            DeviceValue::UInt16(n) => write!(f, "{n}"),
            DeviceValue::Int32(n) => write!(f, "{n}"),
            DeviceValue::UInt32(n) => write!(f, "{n}"),
            DeviceValue::Int64(n) => write!(f, "{n}"),
            DeviceValue::UInt64(n) => write!(f, "{n}"),
            DeviceValue::Float(v) => write!(f, "{v}"),
            DeviceValue::Double(v) => write!(f, "{v}"),
            DeviceValue::String(s) | DeviceValue::Other(s) => f.write_str(s),
            DeviceValue::DateTime(dt) => f.write_str(&dt.to_rfc3339()),
            DeviceValue::ByteString(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            DeviceValue::Array(_) => write!(f, "{}", self.to_json()),
        }
    }
}

fn narrow(n: i64, width: IntWidth) -> Result<DeviceValue, PayloadError> {
    let out_of_range = || PayloadError::OutOfRange {
        value: n.to_string(),
        width,
    };

    Ok(match width {
        IntWidth::Byte => DeviceValue::Byte(u8::try_from(n).map_err(|_| out_of_range())?),
        IntWidth::Int16 => DeviceValue::Int16(i16::try_from(n).map_err(|_| out_of_range())?),
        IntWidth::UInt16 => DeviceValue::UInt16(u16::try_from(n).map_err(|_| out_of_range())?),
        IntWidth::Int32 => DeviceValue::Int32(i32::try_from(n).map_err(|_| out_of_range())?),
        IntWidth::UInt32 => DeviceValue::UInt32(u32::try_from(n).map_err(|_| out_of_range())?),
        IntWidth::Int64 => DeviceValue::Int64(n),
    })
}

/// Parse ISO-8601 text. A trailing `Z` is read as `+00:00`; values without
/// an offset are taken as UTC.
fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let normalized = match text.strip_suffix('Z').or_else(|| text.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => text.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_alias_table() {
        let int = |width, unsigned| TypeTag::Integer { width, unsigned };

        assert_eq!(TypeTag::from_alias("bool"), TypeTag::Boolean);
        assert_eq!(TypeTag::from_alias("Boolean"), TypeTag::Boolean);
        assert_eq!(TypeTag::from_alias("int"), int(IntWidth::Int16, false));
        assert_eq!(TypeTag::from_alias("INT16"), int(IntWidth::Int16, false));
        assert_eq!(TypeTag::from_alias("dint"), int(IntWidth::Int32, false));
        assert_eq!(TypeTag::from_alias("int32"), int(IntWidth::Int32, false));
        assert_eq!(TypeTag::from_alias("sint"), int(IntWidth::Int64, false));
        assert_eq!(TypeTag::from_alias("lint"), int(IntWidth::Int64, false));
        assert_eq!(TypeTag::from_alias("uint"), int(IntWidth::UInt16, true));
        assert_eq!(TypeTag::from_alias("word"), int(IntWidth::UInt16, true));
        assert_eq!(TypeTag::from_alias("udint"), int(IntWidth::UInt32, true));
        assert_eq!(TypeTag::from_alias("dword"), int(IntWidth::UInt32, true));
        assert_eq!(TypeTag::from_alias("byte"), int(IntWidth::Byte, true));
        assert_eq!(TypeTag::from_alias("uint8"), int(IntWidth::Byte, true));
        assert_eq!(TypeTag::from_alias("usint"), int(IntWidth::Int64, true));
        assert_eq!(TypeTag::from_alias("ulint"), int(IntWidth::Int64, true));
        assert_eq!(TypeTag::from_alias("real"), TypeTag::Float);
        assert_eq!(TypeTag::from_alias("lreal"), TypeTag::Double);
        assert_eq!(TypeTag::from_alias("number"), TypeTag::Double);
        assert_eq!(TypeTag::from_alias(" str "), TypeTag::Text);
        assert_eq!(TypeTag::from_alias("time"), TypeTag::DateTime);
        assert_eq!(TypeTag::from_alias("variant"), TypeTag::BestEffort);
        assert_eq!(TypeTag::from_alias(""), TypeTag::BestEffort);
    }

    #[test]
    fn test_parse_bool() {
        let tag = TypeTag::from_alias("bool");

        assert_eq!(parse_payload("true", tag), Ok(Decoded::Bool(true)));
        assert_eq!(parse_payload(" YES ", tag), Ok(Decoded::Bool(true)));
        assert_eq!(parse_payload("On", tag), Ok(Decoded::Bool(true)));
        assert_eq!(parse_payload("0", tag), Ok(Decoded::Bool(false)));
        assert_eq!(parse_payload("no", tag), Ok(Decoded::Bool(false)));
        assert!(matches!(
            parse_payload("maybe", tag),
            Err(PayloadError::InvalidBool(_))
        ));
    }

    #[test]
    fn test_parse_integer_float_tolerant() {
        let tag = TypeTag::from_alias("dint");

        assert_eq!(parse_payload("3.0", tag), Ok(Decoded::Int(3)));
        assert_eq!(parse_payload("3.9", tag), Ok(Decoded::Int(3)));
        assert_eq!(parse_payload("-3.9", tag), Ok(Decoded::Int(-3)));
        assert_eq!(parse_payload("1e3", tag), Ok(Decoded::Int(1000)));
        assert!(matches!(
            parse_payload("abc", tag),
            Err(PayloadError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_payload("inf", tag),
            Err(PayloadError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_parse_unsigned_rejects_negative() {
        let tag = TypeTag::from_alias("uint");

        let err = parse_payload("-3", tag).unwrap_err();
        assert_eq!(
            err,
            PayloadError::Negative {
                value: "-3".to_string(),
                width: IntWidth::UInt16
            }
        );
        assert!(err.to_string().contains("-3"));

        // int(-0.5) == 0 is not negative
        assert_eq!(parse_payload("-0.5", tag), Ok(Decoded::Int(0)));
    }

    #[test]
    fn test_parse_float_and_text() {
        assert_eq!(
            parse_payload("21.5", TypeTag::Float),
            Ok(Decoded::Float(21.5))
        );
        assert!(parse_payload("warm", TypeTag::Double).is_err());
        assert_eq!(
            parse_payload("  hello world ", TypeTag::Text),
            Ok(Decoded::Text("hello world".to_string()))
        );
        assert_eq!(
            parse_payload("2024-05-01T10:00:00Z", TypeTag::DateTime),
            Ok(Decoded::Text("2024-05-01T10:00:00Z".to_string()))
        );
    }

    #[test]
    fn test_parse_best_effort() {
        let tag = TypeTag::BestEffort;

        assert_eq!(parse_payload("ON", tag), Ok(Decoded::Bool(true)));
        assert_eq!(parse_payload("0", tag), Ok(Decoded::Bool(false)));
        // "yes" is not a best-effort boolean token
        assert_eq!(
            parse_payload("yes", tag),
            Ok(Decoded::Text("yes".to_string()))
        );
        assert_eq!(parse_payload("2.5", tag), Ok(Decoded::Float(2.5)));
        assert_eq!(parse_payload("7", tag), Ok(Decoded::Float(7.0)));
    }

    #[test]
    fn test_decode_command_widths() {
        assert_eq!(
            decode_command("12", TypeTag::from_alias("int")),
            Ok(DeviceValue::Int16(12))
        );
        assert_eq!(
            decode_command("70000", TypeTag::from_alias("dint")),
            Ok(DeviceValue::Int32(70000))
        );
        assert_eq!(
            decode_command("255", TypeTag::from_alias("byte")),
            Ok(DeviceValue::Byte(255))
        );
        assert_eq!(
            decode_command("5", TypeTag::from_alias("ulint")),
            Ok(DeviceValue::Int64(5))
        );
        assert_eq!(
            decode_command("21.5", TypeTag::from_alias("float")),
            Ok(DeviceValue::Float(21.5))
        );
        assert_eq!(
            decode_command("21.5", TypeTag::from_alias("lreal")),
            Ok(DeviceValue::Double(21.5))
        );
        assert_eq!(
            decode_command("on", TypeTag::from_alias("bool")),
            Ok(DeviceValue::Boolean(true))
        );
    }

    #[test]
    fn test_decode_command_out_of_range() {
        let err = decode_command("40000", TypeTag::from_alias("int")).unwrap_err();
        assert!(matches!(
            err,
            PayloadError::OutOfRange {
                width: IntWidth::Int16,
                ..
            }
        ));

        assert!(decode_command("256", TypeTag::from_alias("byte")).is_err());
        assert!(decode_command("70000", TypeTag::from_alias("word")).is_err());
    }

    #[test]
    fn test_decode_datetime() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let tag = TypeTag::DateTime;

        assert_eq!(
            decode_command("2024-05-01T10:00:00Z", tag),
            Ok(DeviceValue::DateTime(expected))
        );
        assert_eq!(
            decode_command("2024-05-01T12:00:00+02:00", tag),
            Ok(DeviceValue::DateTime(expected))
        );
        assert_eq!(
            decode_command("2024-05-01T10:00:00", tag),
            Ok(DeviceValue::DateTime(expected))
        );
        assert_eq!(
            decode_command("2024-05-01", tag),
            Ok(DeviceValue::DateTime(
                Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
            ))
        );
        assert_eq!(
            decode_command("next tuesday", tag),
            Ok(DeviceValue::String("next tuesday".to_string()))
        );
    }

    #[test]
    fn test_render_values() {
        assert_eq!(DeviceValue::Boolean(true).render(), b"true");
        assert_eq!(DeviceValue::Boolean(false).render(), b"false");
        assert_eq!(DeviceValue::Int16(-4).render(), b"-4");
        assert_eq!(DeviceValue::Double(21.5).render(), b"21.5");
        assert_eq!(DeviceValue::String("abc".into()).render(), b"abc");
        assert_eq!(DeviceValue::Null.render(), b"");
        assert_eq!(DeviceValue::ByteString(vec![1, 2]).render(), vec![1, 2]);

        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(
            DeviceValue::DateTime(dt).render(),
            b"2024-05-01T10:00:00+00:00"
        );

        let array = DeviceValue::Array(vec![
            DeviceValue::Int32(1),
            DeviceValue::Boolean(false),
            DeviceValue::String("x".into()),
        ]);
        assert_eq!(array.render(), br#"[1,false,"x"]"#);
    }
}
