//! Element types of chunked arrays, expressed as numpy byte-order strings.
//!
//! Store metadata encodes the dtype as `<f8`, `<i4`, `|u1` and friends;
//! fill values follow the numcodecs convention where non-finite floats are
//! the strings `"NaN"`, `"Infinity"` and `"-Infinity"`.

use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Element type of a stored array. Multi-byte types are little endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dtype {
    Float64,
    Float32,
    Int64,
    Int32,
    Int16,
    Int8,
    UInt8,
    Bool,
}

impl Dtype {
    /// The numpy dtype string used in `.zarray` metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::Float64 => "<f8",
            Dtype::Float32 => "<f4",
            Dtype::Int64 => "<i8",
            Dtype::Int32 => "<i4",
            Dtype::Int16 => "<i2",
            Dtype::Int8 => "|i1",
            Dtype::UInt8 => "|u1",
            Dtype::Bool => "|b1",
        }
    }

    /// Width of one element in bytes.
    pub fn item_size(self) -> usize {
        match self {
            Dtype::Float64 | Dtype::Int64 => 8,
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Int16 => 2,
            Dtype::Int8 | Dtype::UInt8 | Dtype::Bool => 1,
        }
    }

    /// Fill value used when a variable does not declare one.
    pub fn default_fill(self) -> Value {
        match self {
            Dtype::Float64 | Dtype::Float32 => Value::from(f64::NAN.to_string()),
            Dtype::Bool => Value::from(false),
            _ => Value::from(0),
        }
    }

    /// Encode a fill value for `.zarray` metadata.
    ///
    /// Finite numbers stay numbers; NaN and the infinities become their
    /// string spellings so the metadata stays valid JSON.
    pub fn encode_fill_value(self, fill: Option<f64>) -> Value {
        let Some(v) = fill else {
            return self.default_fill();
        };
        match self {
            Dtype::Float64 | Dtype::Float32 => {
                if v.is_nan() {
                    json!("NaN")
                } else if v == f64::INFINITY {
                    json!("Infinity")
                } else if v == f64::NEG_INFINITY {
                    json!("-Infinity")
                } else {
                    json!(v)
                }
            }
            Dtype::Bool => json!(v != 0.0),
            _ => json!(v as i64),
        }
    }

    /// Numeric form of an encoded fill value (string spellings included).
    pub fn fill_as_f64(self, fill: &Value) -> f64 {
        match fill {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => match s.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other.parse().unwrap_or(0.0),
            },
            Value::Bool(b) => *b as u8 as f64,
            _ => 0.0,
        }
    }

    /// Little-endian byte pattern of one fill element, used to pad
    /// incomplete edge chunks.
    pub fn fill_bytes(self, fill: &Value) -> Vec<u8> {
        let v = self.fill_as_f64(fill);
        match self {
            Dtype::Float64 => v.to_le_bytes().to_vec(),
            Dtype::Float32 => (v as f32).to_le_bytes().to_vec(),
            Dtype::Int64 => (v as i64).to_le_bytes().to_vec(),
            Dtype::Int32 => (v as i32).to_le_bytes().to_vec(),
            Dtype::Int16 => (v as i16).to_le_bytes().to_vec(),
            Dtype::Int8 => (v as i8).to_le_bytes().to_vec(),
            Dtype::UInt8 | Dtype::Bool => vec![v as u8],
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<f8" | "float64" => Ok(Dtype::Float64),
            "<f4" | "float32" => Ok(Dtype::Float32),
            "<i8" | "int64" => Ok(Dtype::Int64),
            "<i4" | "int32" => Ok(Dtype::Int32),
            "<i2" | "int16" => Ok(Dtype::Int16),
            "|i1" | "int8" => Ok(Dtype::Int8),
            "|u1" | "uint8" => Ok(Dtype::UInt8),
            "|b1" | "bool" => Ok(Dtype::Bool),
            other => Err(format!("unsupported dtype: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_strings_round_trip() {
        for dtype in [
            Dtype::Float64,
            Dtype::Float32,
            Dtype::Int64,
            Dtype::Int32,
            Dtype::Int16,
            Dtype::Int8,
            Dtype::UInt8,
            Dtype::Bool,
        ] {
            assert_eq!(dtype.as_str().parse::<Dtype>().unwrap(), dtype);
        }
    }

    #[test]
    fn test_nan_fill_value_is_spelled_out() {
        let encoded = Dtype::Float32.encode_fill_value(Some(f64::NAN));
        assert_eq!(encoded, json!("NaN"));
        assert!(Dtype::Float32.fill_as_f64(&encoded).is_nan());
    }

    #[test]
    fn test_integer_fill_value_stays_numeric() {
        let encoded = Dtype::Int32.encode_fill_value(Some(-999.0));
        assert_eq!(encoded, json!(-999));
        assert_eq!(Dtype::Int32.fill_bytes(&encoded), (-999i32).to_le_bytes());
    }

    #[test]
    fn test_fill_bytes_width_matches_item_size() {
        for dtype in [Dtype::Float64, Dtype::Int16, Dtype::UInt8] {
            let fill = dtype.default_fill();
            assert_eq!(dtype.fill_bytes(&fill).len(), dtype.item_size());
        }
    }
}
