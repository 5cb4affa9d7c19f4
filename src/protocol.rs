//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Every frontend message reports its exact wire length before it is
//! written, so a single reservation covers the whole message. Backend
//! messages are decoded through [`Body`], which bounds-checks every field
//! against the frame length.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgError, PgResult, ServerError};
use crate::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 0x0003_0000;

/// Code sent in place of the protocol version by a CancelRequest
pub const CANCEL_REQUEST_CODE: i32 = (1234 << 16) | 5678;

/// Most parameters one Parse or Bind message can carry; counts are
/// sent as unsigned 16-bit integers.
pub const MAX_PARAMETERS: usize = u16::MAX as usize;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_i16(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            _ => Err(PgError::protocol(format!("Invalid format code {}", code))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            _ => Err(PgError::protocol(format!(
                "Invalid transaction status {:?}",
                b as char
            ))),
        }
    }
}

/// What a Describe or Close message targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages.
pub trait FrontendMessage {
    /// Exact number of bytes `write` produces, including the tag byte.
    fn length(&self) -> usize;

    /// Append the message to `buf`.
    fn write(&self, buf: &mut BytesMut);

    /// Encode into a freshly reserved buffer.
    fn encode(&self) -> BytesMut {
        let len = self.length();
        let mut buf = BytesMut::with_capacity(len);
        self.write(&mut buf);
        debug_assert_eq!(buf.len(), len, "message length mismatch");
        buf
    }
}

#[inline]
fn cstr_len(s: &str) -> usize {
    s.len() + 1
}

#[inline]
fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Statement and portal names are generated by the driver and must be 7-bit.
#[inline]
fn put_identifier(buf: &mut BytesMut, name: &str) {
    debug_assert!(name.is_ascii(), "identifier {:?} is not ASCII", name);
    put_cstr(buf, name);
}

#[inline]
fn put_header(buf: &mut BytesMut, tag: u8, total_len: usize) {
    buf.put_u8(tag);
    buf.put_i32((total_len - 1) as i32);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub params: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn length(&self) -> usize {
        let params: usize = self
            .params
            .iter()
            .map(|(k, v)| cstr_len(k) + cstr_len(v))
            .sum();
        4 + 4 + params + 1
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(self.length() as i32);
        buf.put_i32(PROTOCOL_VERSION);
        for (key, value) in &self.params {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }
        buf.put_u8(0);
    }
}

/// CancelRequest, sent on a separate connection
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn length(&self) -> usize {
        16
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn length(&self) -> usize {
        1 + 4 + cstr_len(&self.password)
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'p', self.length());
        put_cstr(buf, &self.password);
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn length(&self) -> usize {
        1 + 4 + cstr_len(&self.mechanism) + 4 + self.data.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'p', self.length());
        put_cstr(buf, &self.mechanism);
        buf.put_i32(self.data.len() as i32);
        buf.put_slice(&self.data);
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn length(&self) -> usize {
        1 + 4 + self.data.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'p', self.length());
        buf.put_slice(&self.data);
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn length(&self) -> usize {
        1 + 4 + cstr_len(&self.query)
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'Q', self.length());
        put_cstr(buf, &self.query);
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn length(&self) -> usize {
        1 + 4 + cstr_len(&self.name) + cstr_len(&self.query) + 2 + 4 * self.param_types.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'P', self.length());
        put_identifier(buf, &self.name);
        put_cstr(buf, &self.query);
        buf.put_u16(self.param_types.len() as u16);
        for oid in &self.param_types {
            buf.put_i32(oid.as_i32());
        }
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
///
/// Parameter values arrive already encoded by the type mapper.
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<Format>,
}

impl BindMessage {
    /// Format codes as sent: none when all text, one when uniform, else one
    /// per entry.
    fn compact(formats: &[Format]) -> &[Format] {
        match formats.first() {
            None => formats,
            Some(Format::Text) if formats.iter().all(|f| *f == Format::Text) => &[],
            Some(first) if formats.iter().all(|f| f == first) => &formats[..1],
            Some(_) => formats,
        }
    }
}

impl FrontendMessage for BindMessage {
    fn length(&self) -> usize {
        let values: usize = self
            .params
            .iter()
            .map(|p| 4 + p.as_ref().map_or(0, Bytes::len))
            .sum();
        1 + 4
            + cstr_len(&self.portal)
            + cstr_len(&self.statement)
            + 2
            + 2 * Self::compact(&self.param_formats).len()
            + 2
            + values
            + 2
            + 2 * Self::compact(&self.result_formats).len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'B', self.length());
        put_identifier(buf, &self.portal);
        put_identifier(buf, &self.statement);

        let formats = Self::compact(&self.param_formats);
        buf.put_i16(formats.len() as i16);
        for fmt in formats {
            buf.put_i16(*fmt as i16);
        }

        buf.put_u16(self.params.len() as u16);
        for param in &self.params {
            match param {
                None => buf.put_i32(-1),
                Some(data) => {
                    buf.put_i32(data.len() as i32);
                    buf.put_slice(data);
                }
            }
        }

        let formats = Self::compact(&self.result_formats);
        buf.put_i16(formats.len() as i16);
        for fmt in formats {
            buf.put_i16(*fmt as i16);
        }
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn length(&self) -> usize {
        1 + 4 + 1 + cstr_len(&self.name)
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'D', self.length());
        buf.put_u8(self.target.code());
        put_identifier(buf, &self.name);
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: i32,
}

impl ExecuteMessage {
    /// Unnamed portal, all rows.
    pub fn all() -> Self {
        Self {
            portal: String::new(),
            max_rows: 0,
        }
    }
}

impl FrontendMessage for ExecuteMessage {
    fn length(&self) -> usize {
        1 + 4 + cstr_len(&self.portal) + 4
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'E', self.length());
        put_identifier(buf, &self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Close message ('C') - Close a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage {
    pub target: Target,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn length(&self) -> usize {
        1 + 4 + 1 + cstr_len(&self.name)
    }

    fn write(&self, buf: &mut BytesMut) {
        put_header(buf, b'C', self.length());
        buf.put_u8(self.target.code());
        put_identifier(buf, &self.name);
    }
}

macro_rules! empty_message {
    ($(#[$doc:meta])* $name:ident, $tag:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl FrontendMessage for $name {
            fn length(&self) -> usize {
                5
            }

            fn write(&self, buf: &mut BytesMut) {
                buf.put_u8($tag);
                buf.put_i32(4);
            }
        }
    };
}

empty_message!(
    /// Sync message ('S') - Marks end of an extended query
    SyncMessage,
    b'S'
);
empty_message!(
    /// Flush message ('H') - Request server to flush output buffer
    FlushMessage,
    b'H'
);
empty_message!(
    /// Terminate message ('X') - Close the connection
    TerminateMessage,
    b'X'
);

/// Owned message of a pipelined batch.
///
/// A batch is planned up front and may be finished by a separate writer
/// task, so its messages must be `'static`.
#[derive(Debug, Clone)]
pub enum Outbound {
    Query(QueryMessage),
    Parse(ParseMessage),
    Bind(BindMessage),
    Describe(DescribeMessage),
    Execute(ExecuteMessage),
    Close(CloseMessage),
    Sync,
    Flush,
}

impl FrontendMessage for Outbound {
    fn length(&self) -> usize {
        match self {
            Outbound::Query(m) => m.length(),
            Outbound::Parse(m) => m.length(),
            Outbound::Bind(m) => m.length(),
            Outbound::Describe(m) => m.length(),
            Outbound::Execute(m) => m.length(),
            Outbound::Close(m) => m.length(),
            Outbound::Sync => SyncMessage.length(),
            Outbound::Flush => FlushMessage.length(),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        match self {
            Outbound::Query(m) => m.write(buf),
            Outbound::Parse(m) => m.write(buf),
            Outbound::Bind(m) => m.write(buf),
            Outbound::Describe(m) => m.write(buf),
            Outbound::Execute(m) => m.write(buf),
            Outbound::Close(m) => m.write(buf),
            Outbound::Sync => SyncMessage.write(buf),
            Outbound::Flush => FlushMessage.write(buf),
        }
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Shared column descriptions, cloned into every result of a statement.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode a message body already split from its frame.
    pub fn decode(tag: u8, body: Bytes) -> PgResult<Self> {
        let mut body = Body::new(tag, body);
        let msg = match tag {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete { tag: body.cstr()? },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(body.u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: body.error_fields()?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: body.error_fields()?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstr()?,
                value: body.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => Self::decode_parameter_description(&mut body)?,
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstr()?,
                payload: body.cstr()?,
            },
            _ => {
                return Err(PgError::protocol(format!(
                    "Unknown message type: {}",
                    tag as char
                )))
            }
        };
        body.finish()?;
        Ok(msg)
    }

    /// One-character code, for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk
            | BackendMessage::AuthenticationCleartextPassword
            | BackendMessage::AuthenticationMD5Password { .. }
            | BackendMessage::AuthenticationSASL { .. }
            | BackendMessage::AuthenticationSASLContinue { .. }
            | BackendMessage::AuthenticationSASLFinal { .. } => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }

    /// Convert an ErrorResponse into an error.
    pub fn into_server_error(self) -> Option<PgError> {
        match self {
            BackendMessage::ErrorResponse { fields } => {
                Some(ServerError::from_fields(&fields).into())
            }
            _ => None,
        }
    }

    fn decode_auth(body: &mut Body) -> PgResult<Self> {
        let auth_type = body.i32()?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body.bytes(4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let mech = body.cstr()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body.rest() }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body.rest() }),
            _ => Err(PgError::protocol(format!(
                "Unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(body: &mut Body) -> PgResult<Self> {
        let num_fields = body.count()?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: body.cstr()?,
                table_oid: body.i32()?,
                column_attr: body.i16()?,
                type_oid: Oid::from_i32(body.i32()?),
                type_size: body.i16()?,
                type_modifier: body.i32()?,
                format: Format::from_i16(body.i16()?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Body) -> PgResult<Self> {
        let num_cols = body.count()?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            match body.i32()? {
                -1 => values.push(None),
                len if len < 0 => {
                    return Err(PgError::protocol(format!(
                        "Invalid column length {} in DataRow",
                        len
                    )))
                }
                len => values.push(Some(body.bytes(len as usize)?)),
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut Body) -> PgResult<Self> {
        let num_params = body.count()?;
        let mut type_oids = Vec::with_capacity(num_params);
        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.i32()?));
        }
        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

// ============================================================================
// Bounds-checked body reader
// ============================================================================

/// Cursor over a message body that never reads past the declared frame.
pub struct Body {
    tag: u8,
    buf: Bytes,
}

impl Body {
    pub fn new(tag: u8, buf: Bytes) -> Self {
        Self { tag, buf }
    }

    fn need(&self, n: usize) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::protocol(format!(
                "Message '{}' truncated: needed {} more bytes, {} available",
                self.tag as char,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// Non-negative Int16 element count.
    pub fn count(&mut self) -> PgResult<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| PgError::protocol(format!("Negative count {}", n)))
    }

    pub fn bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    pub fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    /// Read a null-terminated string.
    pub fn cstr(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| PgError::protocol("Missing null terminator in string"))?;
        let s = match std::str::from_utf8(&self.buf[..end]) {
            Ok(s) => s.to_owned(),
            Err(_) => String::from_utf8_lossy(&self.buf[..end]).into_owned(),
        };
        self.buf.advance(end + 1);
        Ok(s)
    }

    /// Read ErrorResponse/NoticeResponse fields.
    pub fn error_fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        loop {
            let field_type = self.u8()?;
            if field_type == 0 {
                break;
            }
            fields.insert(field_type, self.cstr()?);
        }
        Ok(fields)
    }

    /// Every byte of the frame must have been consumed.
    pub fn finish(&self) -> PgResult<()> {
        if self.buf.has_remaining() {
            return Err(PgError::protocol(format!(
                "Message '{}' has {} trailing bytes",
                self.tag as char,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
