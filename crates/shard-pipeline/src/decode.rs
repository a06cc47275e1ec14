//! Field decoding
//!
//! Each field suffix maps to one [`DecodeKind`], fixed when the decoder is
//! built. Lookup tries the full field name first (`seg.png`), then its last
//! extension (`png`), and leaves anything unmapped as raw bytes.

use std::collections::HashMap;

use bytes::Bytes;
use shard_core::{DecodedImage, Error, FieldValue, Result, Sample};

/// What a field's bytes decode into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeKind {
    /// Leave the payload untouched
    Bytes,

    /// UTF-8 text
    Text,

    /// Raster image (PNG, JPEG)
    Image,

    /// JSON document
    Structured,
}

/// Suffix to decode-kind table
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    kinds: HashMap<String, DecodeKind>,
}

impl Decoder {
    /// Decoder that maps nothing; every field stays raw bytes
    pub fn new() -> Self {
        Self::default()
    }

    /// Text for `txt`/`text`/`cls`, JSON for `json`, images for
    /// `jpg`/`jpeg`/`png`
    pub fn standard() -> Self {
        Self::new()
            .with("txt", DecodeKind::Text)
            .with("text", DecodeKind::Text)
            .with("cls", DecodeKind::Text)
            .with("json", DecodeKind::Structured)
            .with("jpg", DecodeKind::Image)
            .with("jpeg", DecodeKind::Image)
            .with("png", DecodeKind::Image)
    }

    /// Map a field suffix to a kind, replacing any earlier mapping
    pub fn with(mut self, suffix: impl Into<String>, kind: DecodeKind) -> Self {
        self.kinds.insert(suffix.into().to_ascii_lowercase(), kind);
        self
    }

    /// Kind used for a field name
    pub fn kind_for(&self, field: &str) -> DecodeKind {
        if let Some(kind) = self.kinds.get(field) {
            return *kind;
        }
        field
            .rsplit_once('.')
            .and_then(|(_, ext)| self.kinds.get(ext))
            .copied()
            .unwrap_or(DecodeKind::Bytes)
    }

    /// Decode every raw field of a sample.
    ///
    /// The first failing field turns the whole sample into a `Decode` error.
    pub fn decode(&self, mut sample: Sample) -> Result<Sample> {
        for (field, value) in sample.fields.iter_mut() {
            let FieldValue::Bytes(raw) = value else {
                continue;
            };
            let kind = self.kind_for(field);
            if kind == DecodeKind::Bytes {
                continue;
            }
            let decoded = decode_bytes(kind, raw).map_err(|reason| Error::Decode {
                url: sample.url.clone(),
                key: sample.key.clone(),
                field: field.clone(),
                reason,
            })?;
            *value = decoded;
        }
        Ok(sample)
    }
}

fn decode_bytes(kind: DecodeKind, raw: &Bytes) -> std::result::Result<FieldValue, String> {
    match kind {
        DecodeKind::Bytes => Ok(FieldValue::Bytes(raw.clone())),
        DecodeKind::Text => std::str::from_utf8(raw)
            .map(|s| FieldValue::Text(s.to_string()))
            .map_err(|e| e.to_string()),
        DecodeKind::Structured => serde_json::from_slice(raw)
            .map(FieldValue::Structured)
            .map_err(|e| e.to_string()),
        DecodeKind::Image => decode_image(raw).map(FieldValue::Image),
    }
}

fn decode_image(raw: &[u8]) -> std::result::Result<DecodedImage, String> {
    let image = image::load_from_memory(raw).map_err(|e| e.to_string())?;
    let (width, height) = (image.width(), image.height());
    let color = image.color();

    let (channels, pixels) = if color.has_alpha() {
        (4, image.into_rgba8().into_raw())
    } else if color.has_color() {
        (3, image.into_rgb8().into_raw())
    } else {
        (1, image.into_luma8().into_raw())
    };

    Ok(DecodedImage {
        width,
        height,
        channels,
        pixels,
    })
}
