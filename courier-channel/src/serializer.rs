use std::io::{self, BufRead, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::{HttpEncoding, TelemetryItem};

/// An error returned when telemetry items cannot be converted to or from a payload.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// An item could not be encoded or a line could not be parsed.
    #[error("invalid telemetry json")]
    Json(#[from] serde_json::Error),
    /// Compression or decompression failed.
    #[error("failed to process payload")]
    Io(#[from] io::Error),
}

/// Converts batches of telemetry items into HTTP payloads.
///
/// Implementations must be able to parse their own output, which is used to split transmissions
/// that no longer retain their items.
pub trait Serializer: Send + Sync {
    /// Value of the `Content-Type` header.
    fn content_type(&self) -> &'static str;

    /// Encoding applied to the payload.
    fn content_encoding(&self) -> HttpEncoding;

    /// Serializes the items in order into a payload.
    fn serialize(&self, items: &[TelemetryItem]) -> Result<Bytes, SerializeError>;

    /// Parses a payload produced by [`serialize`](Self::serialize).
    fn deserialize(&self, payload: &[u8]) -> Result<Vec<TelemetryItem>, SerializeError>;
}

/// Writes one JSON object per line, optionally gzip-compressed.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLinesSerializer {
    encoding: HttpEncoding,
}

impl JsonLinesSerializer {
    /// Creates a serializer producing payloads with the given encoding.
    pub fn new(encoding: HttpEncoding) -> Self {
        Self { encoding }
    }

    fn write_lines<W: Write>(mut writer: W, items: &[TelemetryItem]) -> Result<W, SerializeError> {
        for (index, item) in items.iter().enumerate() {
            if index > 0 {
                writer.write_all(b"\n")?;
            }
            serde_json::to_writer(&mut writer, item)?;
        }
        Ok(writer)
    }

    fn read_lines<R: BufRead>(reader: R) -> Result<Vec<TelemetryItem>, SerializeError> {
        let mut items = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            items.push(serde_json::from_str(&line)?);
        }
        Ok(items)
    }
}

impl Serializer for JsonLinesSerializer {
    fn content_type(&self) -> &'static str {
        "application/x-json-stream"
    }

    fn content_encoding(&self) -> HttpEncoding {
        self.encoding
    }

    fn serialize(&self, items: &[TelemetryItem]) -> Result<Bytes, SerializeError> {
        let buffer = match self.encoding {
            HttpEncoding::Identity => Self::write_lines(Vec::new(), items)?,
            HttpEncoding::Gzip => {
                let encoder = GzEncoder::new(Vec::new(), Compression::default());
                Self::write_lines(encoder, items)?.finish()?
            }
        };

        Ok(buffer.into())
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Vec<TelemetryItem>, SerializeError> {
        match self.encoding {
            HttpEncoding::Identity => Self::read_lines(payload),
            HttpEncoding::Gzip => Self::read_lines(io::BufReader::new(GzDecoder::new(payload))),
        }
    }
}
