//! Message envelope exchanged over a single TCP connection.
//!
//! ```text
//! +-----+----------------+-----------------+---------------------------+
//! | tag | length (u32 LE)| name/path bytes | body (Upload only, to EOF)|
//! +-----+----------------+-----------------+---------------------------+
//! ```
//!
//! Exactly one message is carried per connection. The end of an upload body is signalled by the
//! sender closing its side of the connection.

/// Width of the length prefix preceding the name/path field.
pub const LENGTH_FIELD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Upload = 0x01,
    Delete = 0x02,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x01 => Ok(MessageKind::Upload),
            0x02 => Ok(MessageKind::Delete),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MessageKind::Upload => write!(f, "upload"),
            MessageKind::Delete => write!(f, "delete"),
        }
    }
}

/// Everything preceding the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    /// File content follows until end of stream.
    Upload { name: String },
    /// Notice that `path` was deleted on the sender. No further bytes follow.
    Delete { path: String },
}

impl Header {
    pub fn kind(&self) -> MessageKind {
        match self {
            Header::Upload { .. } => MessageKind::Upload,
            Header::Delete { .. } => MessageKind::Delete,
        }
    }

    pub(crate) fn new(kind: MessageKind, field: String) -> Self {
        match kind {
            MessageKind::Upload => Header::Upload { name: field },
            MessageKind::Delete => Header::Delete { path: field },
        }
    }

    pub(crate) fn field(&self) -> &str {
        match self {
            Header::Upload { name } => name,
            Header::Delete { path } => path,
        }
    }
}

/// A malformed or abandoned message. The connection is closed without touching the destination.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("name field exceeds the {max} byte limit")]
    NameTooLong { max: usize },
    #[error("name field is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),
    #[error("body exceeds the {max} byte limit")]
    BodyTooLarge { max: u64 },
    #[error("unexpected bytes after a delete notice")]
    TrailingBytes,
    #[error("connection closed before the {0} was complete")]
    Truncated(&'static str),
    #[error("no data received for {0:?}")]
    IdleTimeout(std::time::Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefix codec for the name/path field.
pub fn name_codec(max_name_len: usize) -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_FIELD_LEN)
        .little_endian()
        .max_frame_length(max_name_len)
        .new_codec()
}
