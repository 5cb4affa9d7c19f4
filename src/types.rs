//! PostgreSQL type encoding and decoding.
//!
//! The driver core only needs three things from the type layer: the wire
//! OID of each parameter, its encoded length (for exact-length Bind
//! messages) and its bytes. Those are reached through the [`TypeMapper`]
//! trait; [`BuiltinTypeMapper`] covers the common scalar types.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use bytes::{BufMut, BytesMut};
use smallvec::SmallVec;

use crate::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    /// Lets the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

/// Resolved parameter OIDs of one execution, compared against the types a
/// cached statement was prepared with.
pub type ParamFingerprint = SmallVec<[Oid; 8]>;

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    // Timestamps stored as microseconds since 2000-01-01
    Timestamp(i64),
    Date(i32),
    Time(i64),
    Json(String),
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Binary-format length of this value; `None` for NULL.
    pub fn binary_len(&self) -> Option<usize> {
        Some(match self {
            PgValue::Null => return None,
            PgValue::Bool(_) => 1,
            PgValue::Int2(_) => 2,
            PgValue::Int4(_) | PgValue::Float4(_) | PgValue::Date(_) => 4,
            PgValue::Int8(_) | PgValue::Float8(_) | PgValue::Timestamp(_) | PgValue::Time(_) => 8,
            PgValue::Text(v) => v.len(),
            PgValue::Bytea(v) => v.len(),
            PgValue::Uuid(_) => 16,
            // JSONB carries a one-byte version prefix
            PgValue::Json(v) => v.len() + 1,
            PgValue::Raw { data, .. } => data.len(),
        })
    }

    /// Append the binary-format bytes of this value.
    pub fn write_binary(&self, buf: &mut BytesMut) {
        match self {
            PgValue::Null => {}
            PgValue::Bool(v) => buf.put_u8(u8::from(*v)),
            PgValue::Int2(v) => buf.put_i16(*v),
            PgValue::Int4(v) => buf.put_i32(*v),
            PgValue::Int8(v) => buf.put_i64(*v),
            PgValue::Float4(v) => buf.put_f32(*v),
            PgValue::Float8(v) => buf.put_f64(*v),
            PgValue::Text(v) => buf.put_slice(v.as_bytes()),
            PgValue::Bytea(v) => buf.put_slice(v),
            PgValue::Uuid(v) => buf.put_slice(v),
            PgValue::Timestamp(v) | PgValue::Time(v) => buf.put_i64(*v),
            PgValue::Date(v) => buf.put_i32(*v),
            PgValue::Json(v) => {
                buf.put_u8(1);
                buf.put_slice(v.as_bytes());
            }
            PgValue::Raw { data, .. } => buf.put_slice(data),
        }
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.binary_len().unwrap_or(0));
        self.write_binary(&mut buf);
        buf.to_vec()
    }

    /// Convert to the representation of another type where that is lossless.
    pub fn coerce(&self, oid: Oid) -> PgResult<PgValue> {
        if self.is_null() || self.type_oid() == oid {
            return Ok(self.clone());
        }
        let coerced = match (self, oid) {
            (PgValue::Int2(v), Oid::INT4) => PgValue::Int4(i32::from(*v)),
            (PgValue::Int2(v), Oid::INT8) => PgValue::Int8(i64::from(*v)),
            (PgValue::Int4(v), Oid::INT8) => PgValue::Int8(i64::from(*v)),
            (PgValue::Int4(v), Oid::INT2) => PgValue::Int2(narrow(*v, oid)?),
            (PgValue::Int8(v), Oid::INT4) => PgValue::Int4(narrow(*v, oid)?),
            (PgValue::Int8(v), Oid::INT2) => PgValue::Int2(narrow(*v, oid)?),
            (PgValue::Float4(v), Oid::FLOAT8) => PgValue::Float8(f64::from(*v)),
            (PgValue::Text(v), o) if o.is_text_like() => PgValue::Text(v.clone()),
            (PgValue::Text(v), Oid::JSON | Oid::JSONB) => PgValue::Json(v.clone()),
            (PgValue::Json(v), o) if o.is_text_like() => PgValue::Text(v.clone()),
            (PgValue::Json(v), Oid::JSON) => PgValue::Raw {
                oid: Oid::JSON,
                data: v.as_bytes().to_vec(),
            },
            (PgValue::Timestamp(v), Oid::TIMESTAMPTZ) => PgValue::Raw {
                oid: Oid::TIMESTAMPTZ,
                data: v.to_be_bytes().to_vec(),
            },
            _ => {
                return Err(PgError::Type(format!(
                    "Cannot write {:?} as type {}",
                    self.type_oid(),
                    oid.as_i32()
                )))
            }
        };
        Ok(coerced)
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        match oid {
            Oid::BOOL => match data {
                [b] => Ok(PgValue::Bool(*b != 0)),
                _ => Err(bad_length("BOOL", data)),
            },
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed("INT2", data)?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed("INT4", data)?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed("INT8", data)?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed("FLOAT4", data)?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed("FLOAT8", data)?))),
            _ if oid.is_text_like() => std::str::from_utf8(data)
                .map(|s| PgValue::Text(s.to_owned()))
                .map_err(|e| PgError::Type(format!("Invalid UTF-8 in TEXT: {}", e))),
            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => Ok(PgValue::Uuid(fixed("UUID", data)?)),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => Ok(PgValue::Timestamp(i64::from_be_bytes(
                fixed("TIMESTAMP", data)?,
            ))),
            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed("DATE", data)?))),
            Oid::TIME => Ok(PgValue::Time(i64::from_be_bytes(fixed("TIME", data)?))),
            Oid::JSON | Oid::JSONB => {
                // JSONB has a version byte prefix
                let json_data = match (oid, data.split_first()) {
                    (Oid::JSONB, Some((_, rest))) => rest,
                    _ => data,
                };
                std::str::from_utf8(json_data)
                    .map(|s| PgValue::Json(s.to_owned()))
                    .map_err(|e| PgError::Type(format!("Invalid UTF-8 in JSON: {}", e)))
            }
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = String::from_utf8_lossy(data).into_owned();

        match oid {
            Oid::BOOL => Ok(PgValue::Bool(matches!(text.as_str(), "t" | "true" | "1"))),
            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| PgError::Type(format!("Invalid INT2: {}", e))),
            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| PgError::Type(format!("Invalid INT4: {}", e))),
            Oid::INT8 => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| PgError::Type(format!("Invalid INT8: {}", e))),
            Oid::FLOAT4 => text
                .parse::<f32>()
                .map(PgValue::Float4)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT4: {}", e))),
            Oid::FLOAT8 => text
                .parse::<f64>()
                .map(PgValue::Float8)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT8: {}", e))),
            Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text)),
            // Default: treat as text
            _ => Ok(PgValue::Text(text)),
        }
    }
}

fn fixed<const N: usize>(name: &str, data: &[u8]) -> PgResult<[u8; N]> {
    data.try_into().map_err(|_| bad_length(name, data))
}

fn bad_length(name: &str, data: &[u8]) -> PgError {
    PgError::Type(format!("Invalid {} length: {}", name, data.len()))
}

fn narrow<T, U>(v: T, oid: Oid) -> PgResult<U>
where
    T: Copy + std::fmt::Display,
    U: TryFrom<T>,
{
    U::try_from(v).map_err(|_| PgError::Type(format!("{} is out of range for type {}", v, oid.0)))
}

// ============================================================================
// Parameters
// ============================================================================

/// A command parameter.
///
/// `name` is matched against `@name` placeholders; unnamed parameters are
/// referenced positionally with `$n`. `db_type` pins the wire type instead
/// of deriving it from the value.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: Option<String>,
    pub value: PgValue,
    pub db_type: Option<Oid>,
}

impl Parameter {
    /// Positional parameter.
    pub fn new(value: PgValue) -> Self {
        Self {
            name: None,
            value,
            db_type: None,
        }
    }

    /// Named parameter; a leading `@` is accepted and stripped.
    pub fn named(name: &str, value: PgValue) -> Self {
        Self {
            name: Some(name.trim_start_matches('@').to_string()),
            value,
            db_type: None,
        }
    }

    pub fn with_type(mut self, oid: Oid) -> Self {
        self.db_type = Some(oid);
        self
    }
}

impl From<PgValue> for Parameter {
    fn from(value: PgValue) -> Self {
        Parameter::new(value)
    }
}

// ============================================================================
// Type mapper
// ============================================================================

/// The connector's view of the type system.
///
/// All three calls are made while building a Bind message: the OID is sent
/// in Parse and used for the prepared-statement fingerprint, the length is
/// needed before any bytes are written so the message length is exact.
pub trait TypeMapper: Send + Sync {
    /// Wire type OID for a parameter.
    fn resolve(&self, param: &Parameter) -> PgResult<Oid>;

    /// Validate the value against `oid` and return its encoded length, or
    /// `None` for NULL.
    fn validate_and_get_length(&self, param: &Parameter, oid: Oid) -> PgResult<Option<usize>>;

    /// Write the encoded value; exactly the validated length must be written.
    fn write(&self, param: &Parameter, oid: Oid, buf: &mut BytesMut) -> PgResult<()>;
}

/// Binary codecs for the [`PgValue`] variants.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTypeMapper;

impl TypeMapper for BuiltinTypeMapper {
    fn resolve(&self, param: &Parameter) -> PgResult<Oid> {
        Ok(param.db_type.unwrap_or_else(|| param.value.type_oid()))
    }

    fn validate_and_get_length(&self, param: &Parameter, oid: Oid) -> PgResult<Option<usize>> {
        if oid == Oid::UNSPECIFIED {
            return Ok(param.value.binary_len());
        }
        Ok(param.value.coerce(oid)?.binary_len())
    }

    fn write(&self, param: &Parameter, oid: Oid, buf: &mut BytesMut) -> PgResult<()> {
        if oid == Oid::UNSPECIFIED || param.value.type_oid() == oid {
            param.value.write_binary(buf);
        } else {
            param.value.coerce(oid)?.write_binary(buf);
        }
        Ok(())
    }
}
