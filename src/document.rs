//! Document model for the write path
//!
//! A record handed to the writer is a [`DocumentUri`] plus a [`ContentValue`].
//! The value is turned into an opaque [`Payload`] and a [`DocumentFormat`]
//! once, right before it is buffered or inserted, and travels to the shard as
//! a [`Document`] together with its [`ContentOptions`].

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Serialize, Deserialize};
use tracing::error;

use crate::codec::{self, StreamCodec};
use crate::config::{RepairLevel, WriterConfig};
use crate::error::{Result, Error};

/// Identifier of a document in the repository
///
/// The output directory prefix may be applied exactly once; the identifier is
/// immutable afterwards as far as the writer is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentUri {
    uri: String,
    prefixed: bool,
}

impl DocumentUri {
    /// Create a new document identifier
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            prefixed: false,
        }
    }

    /// The identifier as a string
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// Whether the output directory prefix was already applied
    pub fn is_prefixed(&self) -> bool {
        self.prefixed
    }

    /// Prefix the identifier with the output directory, once
    pub fn apply_output_dir(&mut self, dir: &str) {
        if self.prefixed {
            return;
        }
        self.prefixed = true;

        if dir.is_empty() {
            return;
        }

        self.uri = if dir.ends_with('/') || self.uri.starts_with('/') {
            format!("{}{}", dir, self.uri)
        } else {
            format!("{}/{}", dir, self.uri)
        };
    }

    /// Check that the identifier can be stored
    pub fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(Error::invalid_uri("empty document URI"));
        }

        if let Some(c) = self.uri.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::invalid_uri(format!(
                "{:?} contains illegal character {:?}", self.uri, c
            )));
        }

        Ok(())
    }

    /// The identifier used for shard placement
    pub fn placement_key(&self) -> &[u8] {
        self.uri.as_bytes()
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl From<&str> for DocumentUri {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for DocumentUri {
    fn from(uri: String) -> Self {
        Self::new(uri)
    }
}

/// Storage format of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentFormat {
    /// Plain text
    Text,
    /// Structured markup
    Xml,
    /// Opaque bytes
    Binary,
    /// Let the writer (or the repository) decide
    Unknown,
}

impl Default for DocumentFormat {
    fn default() -> Self {
        Self::Xml
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl DocumentFormat {
    /// Parse a document format from a string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "xml" => Ok(Self::Xml),
            "binary" => Ok(Self::Binary),
            "unknown" => Ok(Self::Unknown),
            _ => Err(Error::config(format!("Unknown document format: {}", s))),
        }
    }

    /// Get the name of the format
    pub fn name(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Xml => "xml",
            Self::Binary => "binary",
            Self::Unknown => "unknown",
        }
    }

    /// Check if the format still has to be decided
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Capability granted to a role on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    Insert,
    Update,
    Execute,
}

impl Capability {
    /// Parse a capability, ignoring case and surrounding whitespace
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "read" => Some(Self::Read),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "execute" => Some(Self::Execute),
            _ => None,
        }
    }
}

/// A (role, capability) grant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub role: String,
    pub capability: Capability,
}

/// Creation options attached to every inserted document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentOptions {
    pub format: DocumentFormat,
    pub quality: i32,
    pub permissions: Vec<Permission>,
    pub collections: Vec<String>,
    pub language: Option<String>,
    pub namespace: Option<String>,
    pub encoding: Option<String>,
    pub repair_level: RepairLevel,
}

impl ContentOptions {
    /// Build the task-wide options from configuration
    ///
    /// Illegal role names and capabilities are logged and skipped.
    pub fn from_config(config: &WriterConfig) -> Self {
        let mut permissions = Vec::new();
        for (role, capability) in &config.permissions {
            if role.trim().is_empty() {
                error!(capability = %capability, "illegal role name");
                continue;
            }
            match Capability::parse(capability) {
                Some(capability) => permissions.push(Permission {
                    role: role.trim().to_string(),
                    capability,
                }),
                None => error!(role = %role, capability = %capability, "illegal permission"),
            }
        }

        Self {
            format: config.content_type,
            quality: config.quality,
            permissions,
            collections: config.collections.iter().map(|c| c.trim().to_string()).collect(),
            language: config.language.clone(),
            namespace: config.namespace.clone(),
            encoding: config.encoding.clone(),
            repair_level: config.repair_level,
        }
    }
}

/// Encoder for values the writer does not know how to serialize itself
///
/// The encoder may adjust the options it is handed (format, collections...).
/// Each call gets a private copy of the task options.
pub trait CustomContent: Send + Sync + fmt::Debug {
    /// Produce the document bytes for `uri`
    fn encode(&self, uri: &str, options: &mut ContentOptions) -> Result<Vec<u8>>;
}

/// File-backed content, optionally compressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub path: PathBuf,
    pub codec: StreamCodec,
}

impl StreamSource {
    /// Create a stream source for an uncompressed file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            codec: StreamCodec::None,
        }
    }

    /// Set the codec the file is compressed with
    pub fn with_codec(mut self, codec: StreamCodec) -> Self {
        self.codec = codec;
        self
    }
}

/// The value half of a record
#[derive(Debug, Clone)]
pub enum ContentValue {
    /// Plain text
    Text(String),
    /// Serialized structured markup
    Node(String),
    /// Opaque bytes
    Binary(Vec<u8>),
    /// Content read from a (possibly compressed) file
    Stream(StreamSource),
    /// Content produced by a caller-supplied encoder
    Custom(Arc<dyn CustomContent>),
}

impl ContentValue {
    /// The format this kind of value is stored as when none is configured
    pub fn natural_format(&self) -> DocumentFormat {
        match self {
            Self::Text(_) => DocumentFormat::Text,
            Self::Node(_) => DocumentFormat::Xml,
            Self::Binary(_) => DocumentFormat::Binary,
            Self::Stream(_) | Self::Custom(_) => DocumentFormat::Unknown,
        }
    }

    /// Whether producing a payload may change the options
    pub fn mutates_options(&self) -> bool {
        matches!(self, Self::Custom(_))
    }

    /// Turn the value into bytes and the format they are stored as
    ///
    /// `options` is only written by custom encoders.
    pub fn to_payload(
        &self,
        uri: &DocumentUri,
        options: &mut ContentOptions,
        streaming: bool,
    ) -> Result<(Payload, DocumentFormat)> {
        let payload = match self {
            Self::Text(text) | Self::Node(text) => Payload::Bytes(text.clone().into_bytes()),
            Self::Binary(bytes) => Payload::Bytes(bytes.clone()),
            Self::Stream(source) => {
                let file = File::open(&source.path).map_err(|e| {
                    Error::content(format!("cannot open {}: {}", source.path.display(), e))
                })?;
                let reader = codec::decoder(source.codec, file)?;
                if streaming {
                    Payload::Stream(StreamPayload::new(reader))
                } else {
                    let mut buffer = Vec::new();
                    let mut reader = reader;
                    reader.read_to_end(&mut buffer).map_err(|e| {
                        Error::content(format!("cannot read {}: {}", source.path.display(), e))
                    })?;
                    Payload::Bytes(buffer)
                }
            }
            Self::Custom(encoder) => Payload::Bytes(encoder.encode(uri.as_str(), options)?),
        };

        let format = match self.natural_format() {
            DocumentFormat::Unknown => options.format,
            natural if options.format.is_unknown() => natural,
            _ => options.format,
        };

        Ok((payload, format))
    }
}

/// A lazily read document body
pub struct StreamPayload {
    reader: Box<dyn Read + Send>,
}

impl StreamPayload {
    /// Wrap a reader
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self { reader }
    }

    /// Drain the reader
    pub fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.reader.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

impl fmt::Debug for StreamPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamPayload")
    }
}

/// Document body handed to a connection
#[derive(Debug)]
pub enum Payload {
    /// Fully buffered bytes
    Bytes(Vec<u8>),
    /// Unbuffered stream, read once by the connection
    Stream(StreamPayload),
}

impl Payload {
    /// Buffered length, if known
    pub fn len_hint(&self) -> Option<usize> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len()),
            Self::Stream(_) => None,
        }
    }

    /// Read the whole body
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Stream(stream) => stream.read_all(),
        }
    }
}

/// A document ready to be inserted
#[derive(Debug)]
pub struct Document {
    pub uri: String,
    pub payload: Payload,
    pub format: DocumentFormat,
    pub options: Arc<ContentOptions>,
}

impl Document {
    /// Build a document from a record
    ///
    /// `base` is shared with the document unless the document needs its own
    /// options: a format different from the configured one, or a custom
    /// encoder that may rewrite them.
    pub fn build(
        uri: &DocumentUri,
        value: &ContentValue,
        base: &Arc<ContentOptions>,
        streaming: bool,
    ) -> Result<Self> {
        if value.mutates_options() {
            let mut options = (**base).clone();
            let (payload, format) = value.to_payload(uri, &mut options, streaming)?;
            options.format = format;
            return Ok(Self {
                uri: uri.as_str().to_string(),
                payload,
                format,
                options: Arc::new(options),
            });
        }

        let mut scratch = ContentOptions {
            format: base.format,
            ..ContentOptions::default()
        };
        let (payload, format) = value.to_payload(uri, &mut scratch, streaming)?;

        let options = if format == base.format {
            Arc::clone(base)
        } else {
            let mut own = (**base).clone();
            own.format = format;
            Arc::new(own)
        };

        Ok(Self {
            uri: uri.as_str().to_string(),
            payload,
            format,
            options,
        })
    }

    /// Convenience constructor for buffered bytes with default options
    pub fn from_bytes(uri: impl Into<String>, bytes: impl Into<Vec<u8>>, format: DocumentFormat) -> Self {
        Self {
            uri: uri.into(),
            payload: Payload::Bytes(bytes.into()),
            format,
            options: Arc::new(ContentOptions {
                format,
                ..ContentOptions::default()
            }),
        }
    }
}
