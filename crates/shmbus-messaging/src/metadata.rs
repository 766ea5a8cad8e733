//! Message categories, metadata and wire serialisation.
//!
//! Everything that crosses the shared buffer is `metadata || event`, each
//! part self-delimiting: strings are 0-terminated UTF-8, integers are
//! little-endian. Serialisers write into caller-provided fixed buffers and
//! report 0 when nothing coherent fits; events truncate themselves instead.

use std::time::{SystemTime, UNIX_EPOCH};

/// The four message categories a control can belong to. The discriminants
/// are the wire and environment encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Tracing = 1,
    Logging = 2,
    Reporting = 3,
    OperationalStream = 4,
}

impl Kind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Tracing),
            2 => Some(Self::Logging),
            3 => Some(Self::Reporting),
            4 => Some(Self::OperationalStream),
            _ => None,
        }
    }

    /// Whether categories of this kind start enabled when no setting says
    /// otherwise. Tracing is opt-in; everything else is opt-out.
    pub fn default_enabled(self) -> bool {
        !matches!(self, Self::Tracing)
    }
}

/// Microseconds since the UNIX epoch; the timestamp unit of every record.
pub fn now_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------
// Bounded little-endian frame access
// ---------------------------------------------------------------------

pub(crate) struct FrameWriter<'a> {
    buffer: &'a mut [u8],
    offset: usize,
    overflow: bool,
}

impl<'a> FrameWriter<'a> {
    pub(crate) fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
            overflow: false,
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.overflow
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        if self.overflow || self.offset + bytes.len() > self.buffer.len() {
            self.overflow = true;
            return;
        }
        self.buffer[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.offset += bytes.len();
    }

    pub(crate) fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// 0-terminated UTF-8. The terminator is part of the encoding, so the
    /// string itself must not contain NUL.
    pub(crate) fn write_cstr(&mut self, text: &str) {
        debug_assert!(!text.as_bytes().contains(&0));
        self.write_bytes(text.as_bytes());
        self.write_u8(0);
    }
}

pub(crate) struct FrameReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn read_u8(&mut self) -> Option<u8> {
        let value = *self.buffer.get(self.offset)?;
        self.offset += 1;
        Some(value)
    }

    pub(crate) fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.buffer.get(self.offset..self.offset + 4)?;
        self.offset += 4;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.buffer.get(self.offset..self.offset + 8)?;
        self.offset += 8;
        Some(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_cstr(&mut self) -> Option<String> {
        let remainder = self.buffer.get(self.offset..)?;
        let terminator = remainder.iter().position(|byte| *byte == 0)?;
        let text = std::str::from_utf8(&remainder[..terminator]).ok()?;
        self.offset += terminator + 1;
        Some(text.to_owned())
    }
}

// ---------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------

/// Identity of a message category: kind, producing module, category label.
///
/// Equality is the full triple. An empty module or category acts as a
/// wildcard in [`applicable`](Self::applicable) matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    kind: Kind,
    module: String,
    category: String,
}

impl Metadata {
    pub fn new(kind: Kind, module: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            kind,
            module: module.into(),
            category: category.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Whether this pattern selects `other`: kinds must match, and module
    /// and category each match exactly or by being empty.
    pub fn applicable(&self, other: &Metadata) -> bool {
        self.kind == other.kind
            && (self.module.is_empty() || self.module == other.module)
            && (self.category.is_empty() || self.category == other.category)
    }

    /// Wire encoding: `u8 kind || module NUL || category NUL`. Returns the
    /// bytes written, or 0 when the buffer is too small.
    pub fn serialize(&self, buffer: &mut [u8]) -> u16 {
        let mut writer = FrameWriter::new(buffer);
        writer.write_u8(self.kind as u8);
        writer.write_cstr(&self.module);
        writer.write_cstr(&self.category);

        if writer.overflowed() {
            0
        } else {
            writer.offset() as u16
        }
    }

    pub fn deserialize(buffer: &[u8]) -> Option<(Self, usize)> {
        let mut reader = FrameReader::new(buffer);
        let kind = Kind::from_u8(reader.read_u8()?)?;
        let module = reader.read_cstr()?;
        let category = reader.read_cstr()?;
        Some((Self::new(kind, module, category), reader.offset()))
    }
}

/// Source location attached to tracing and reporting records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSite {
    pub file: String,
    pub line: u32,
    pub class: String,
}

/// The per-record header: which category produced it and when. Tracing and
/// reporting records also carry their call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    metadata: Metadata,
    timestamp: u64,
    site: Option<CallSite>,
}

impl MessageInfo {
    pub fn new(metadata: Metadata, timestamp: u64) -> Self {
        Self {
            metadata,
            timestamp,
            site: None,
        }
    }

    pub fn with_site(metadata: Metadata, timestamp: u64, site: CallSite) -> Self {
        Self {
            metadata,
            timestamp,
            site: Some(site),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn site(&self) -> Option<&CallSite> {
        self.site.as_ref()
    }

    fn carries_site(kind: Kind) -> bool {
        matches!(kind, Kind::Tracing | Kind::Reporting)
    }

    /// `metadata || u64 timestamp [|| file NUL || u32 line || class NUL]`.
    /// Returns bytes written, or 0 when it does not fit.
    pub fn serialize(&self, buffer: &mut [u8]) -> u16 {
        let header = self.metadata.serialize(buffer);
        if header == 0 {
            return 0;
        }

        let mut writer = FrameWriter::new(&mut buffer[header as usize..]);
        writer.write_u64(self.timestamp);

        if Self::carries_site(self.metadata.kind()) {
            let site = self.site.clone().unwrap_or_default();
            writer.write_cstr(&site.file);
            writer.write_u32(site.line);
            writer.write_cstr(&site.class);
        }

        if writer.overflowed() {
            0
        } else {
            header + writer.offset() as u16
        }
    }

    pub fn deserialize(buffer: &[u8]) -> Option<(Self, usize)> {
        let (metadata, consumed) = Metadata::deserialize(buffer)?;

        let mut reader = FrameReader::new(&buffer[consumed..]);
        let timestamp = reader.read_u64()?;

        let site = if Self::carries_site(metadata.kind()) {
            let file = reader.read_cstr()?;
            let line = reader.read_u32()?;
            let class = reader.read_cstr()?;
            Some(CallSite { file, line, class })
        } else {
            None
        };

        let total = consumed + reader.offset();
        Some((
            Self {
                metadata,
                timestamp,
                site,
            },
            total,
        ))
    }
}

/// A category row as exchanged with a controller: metadata plus its current
/// (or requested) enablement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEntry {
    pub metadata: Metadata,
    pub enabled: bool,
}

impl ControlEntry {
    pub fn new(metadata: Metadata, enabled: bool) -> Self {
        Self { metadata, enabled }
    }

    pub fn serialize(&self, buffer: &mut [u8]) -> u16 {
        let header = self.metadata.serialize(buffer);
        if header == 0 || (header as usize) >= buffer.len() {
            return 0;
        }
        buffer[header as usize] = u8::from(self.enabled);
        header + 1
    }

    pub fn deserialize(buffer: &[u8]) -> Option<(Self, usize)> {
        let (metadata, consumed) = Metadata::deserialize(buffer)?;
        let enabled = *buffer.get(consumed)? != 0;
        Some((Self { metadata, enabled }, consumed + 1))
    }
}

// ---------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------

/// A message payload. Implementations serialise themselves into a bounded
/// buffer and truncate when it is too small, rather than failing.
pub trait Event {
    /// Returns the bytes written (never more than `buffer.len()`).
    fn serialize(&self, buffer: &mut [u8]) -> u16;

    /// Human-readable content, used by direct output.
    fn data(&self) -> &str;
}

/// Plain text payload, 0-terminated on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMessage {
    text: String,
}

impl TextMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn deserialize(buffer: &[u8]) -> Option<(Self, usize)> {
        let mut reader = FrameReader::new(buffer);
        let text = reader.read_cstr()?;
        Some((Self { text }, reader.offset()))
    }
}

impl Event for TextMessage {
    fn serialize(&self, buffer: &mut [u8]) -> u16 {
        if buffer.is_empty() {
            return 0;
        }

        if self.text.len() + 1 > buffer.len() {
            // Cut to fit, terminator included.
            let cut = floor_char_boundary(&self.text, buffer.len() - 1);
            buffer[..cut].copy_from_slice(&self.text.as_bytes()[..cut]);
            buffer[cut] = 0;
            (cut + 1) as u16
        } else {
            buffer[..self.text.len()].copy_from_slice(self.text.as_bytes());
            buffer[self.text.len()] = 0;
            (self.text.len() + 1) as u16
        }
    }

    fn data(&self) -> &str {
        &self.text
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
