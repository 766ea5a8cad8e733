//! Message configuration: the ordered category policy list plus the scalar
//! fields every process needs to find and use the shared buffers.
//!
//! The server parses a JSON config once; the resulting settings are
//! marshalled into a single delimited environment variable so spawned
//! processes inherit them without touching the filesystem.

use std::sync::Mutex;

use serde::Deserialize;

use crate::metadata::{Kind, Metadata};

/// Environment variable carrying the marshalled settings.
pub const CONFIG_ENV: &str = "SHMBUS_MESSAGING_CONFIG";

const DELIMITER: char = '|';

const MODE_BACKGROUND: u8 = 0x01;
const MODE_DIRECT: u8 = 0x02;
const MODE_ABBREVIATED: u8 = 0x04;

/// How the unit should emit records: into the shared buffer, or directly as
/// human-readable lines (full or abbreviated).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Off,
    Flush,
    FlushAbbreviated,
}

/// One category policy row: a (possibly wildcarded) metadata pattern and the
/// enablement it dictates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsEntry {
    pub metadata: Metadata,
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct EntryConfig {
    #[serde(default)]
    module: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SectionConfig {
    #[serde(default)]
    settings: Vec<EntryConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingConfig {
    #[serde(default)]
    settings: Vec<EntryConfig>,
    #[serde(default)]
    abbreviated: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RedirectConfig {
    #[serde(default)]
    stdout: bool,
    #[serde(default)]
    stderr: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    tracing: SectionConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    redirect: RedirectConfig,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<SettingsEntry>,
    path: String,
    identifier: String,
    socket_port: u16,
    mode: u8,
    redirect_stdout: bool,
    redirect_stderr: bool,
}

/// See the module documentation. Interior-locked so the unit, the registry
/// rebuild and the RPC server can consult it concurrently.
#[derive(Debug, Default)]
pub struct Settings {
    inner: Mutex<Inner>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the server-side configuration: scalars, mode bits and the
    /// category entries whose enablement differs from their kind's default.
    pub fn configure(
        &self,
        path: &str,
        identifier: &str,
        socket_port: u16,
        config: &str,
        background: bool,
        flush: FlushMode,
    ) {
        let parsed: ConfigFile = serde_json::from_str(config).unwrap_or_default();

        let abbreviated = flush == FlushMode::FlushAbbreviated
            || (flush != FlushMode::Off && parsed.logging.abbreviated.unwrap_or(false));

        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.path = path.to_owned();
        inner.identifier = identifier.to_owned();
        inner.socket_port = socket_port;
        inner.mode = (if background { MODE_BACKGROUND } else { 0 })
            | (if flush != FlushMode::Off { MODE_DIRECT } else { 0 })
            | (if abbreviated { MODE_ABBREVIATED } else { 0 });
        inner.redirect_stdout = parsed.redirect.stdout;
        inner.redirect_stderr = parsed.redirect.stderr;

        for entry in &parsed.tracing.settings {
            let metadata = Metadata::new(Kind::Tracing, &entry.module, &entry.category);
            if metadata.kind().default_enabled() != entry.enabled {
                inner.entries.push(SettingsEntry {
                    metadata,
                    enabled: entry.enabled,
                });
            }
        }
        for entry in &parsed.logging.settings {
            let metadata = Metadata::new(Kind::Logging, &entry.module, &entry.category);
            if metadata.kind().default_enabled() != entry.enabled {
                inner.entries.push(SettingsEntry {
                    metadata,
                    enabled: entry.enabled,
                });
            }
        }
    }

    /// Records an explicit policy change so categories announced later see
    /// it too.
    ///
    /// An exact-match row is replaced; a row is only appended when the
    /// requested enablement differs from what the remaining rows (or the
    /// kind default) already yield.
    pub fn update(&self, metadata: &Metadata, is_enabled: bool) {
        let mut inner = self.inner.lock().unwrap();

        let mut enabled = metadata.kind().default_enabled();
        let mut exact = None;

        for (index, entry) in inner.entries.iter().enumerate() {
            if entry.metadata == *metadata {
                exact = Some(index);
                break;
            }
            if entry.metadata.applicable(metadata) {
                enabled = entry.enabled;
            }
        }

        if let Some(index) = exact {
            inner.entries.remove(index);
            for entry in &inner.entries[index..] {
                if entry.metadata.applicable(metadata) {
                    enabled = entry.enabled;
                }
            }
        }

        if enabled != is_enabled {
            inner.entries.push(SettingsEntry {
                metadata: metadata.clone(),
                enabled: is_enabled,
            });
        }
    }

    /// The enablement the current policy yields for `metadata`: an exact
    /// match wins outright, otherwise the last applicable row dictates, and
    /// with no row at all the kind default stands.
    pub fn is_enabled(&self, metadata: &Metadata) -> bool {
        let inner = self.inner.lock().unwrap();
        let mut result = metadata.kind().default_enabled();

        for entry in &inner.entries {
            if entry.metadata == *metadata {
                return entry.enabled;
            }
            if entry.metadata.applicable(metadata) {
                result = entry.enabled;
            }
        }

        result
    }

    // ---------------------------------------------------------------------
    // Scalar accessors
    // ---------------------------------------------------------------------

    pub fn base_path(&self) -> String {
        self.inner.lock().unwrap().path.clone()
    }

    pub fn identifier(&self) -> String {
        self.inner.lock().unwrap().identifier.clone()
    }

    pub fn socket_port(&self) -> u16 {
        self.inner.lock().unwrap().socket_port
    }

    pub fn is_background(&self) -> bool {
        self.inner.lock().unwrap().mode & MODE_BACKGROUND != 0
    }

    pub fn is_direct(&self) -> bool {
        self.inner.lock().unwrap().mode & MODE_DIRECT != 0
    }

    pub fn is_abbreviated(&self) -> bool {
        self.inner.lock().unwrap().mode & MODE_ABBREVIATED != 0
    }

    /// Whether the config asked for stdout capture. Server-local; not part
    /// of the environment marshalling.
    pub fn has_redirected_stdout(&self) -> bool {
        self.inner.lock().unwrap().redirect_stdout
    }

    pub fn has_redirected_stderr(&self) -> bool {
        self.inner.lock().unwrap().redirect_stderr
    }

    /// Snapshot of the policy rows, in declaration order.
    pub fn entries(&self) -> Vec<SettingsEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    // ---------------------------------------------------------------------
    // Environment persistence
    // ---------------------------------------------------------------------

    /// Marshals everything into [`CONFIG_ENV`] so child processes inherit
    /// the configuration:
    /// `path|identifier|port|mode|(kind|module|category|enabled)*`.
    pub fn save(&self) {
        let inner = self.inner.lock().unwrap();

        let mut value = format!(
            "{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
            inner.path, inner.identifier, inner.socket_port, inner.mode
        );

        for entry in &inner.entries {
            value.push(DELIMITER);
            value.push_str(&format!(
                "{}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
                entry.metadata.kind() as u8,
                entry.metadata.module(),
                entry.metadata.category(),
                u8::from(entry.enabled)
            ));
        }

        std::env::set_var(CONFIG_ENV, value);
    }

    /// Rebuilds the settings from [`CONFIG_ENV`]. Unparseable trailing
    /// entries are skipped; missing scalars leave their defaults.
    pub fn load(&self) {
        let value = std::env::var(CONFIG_ENV).unwrap_or_default();
        let mut fields = value.split(DELIMITER);

        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.path = fields.next().unwrap_or_default().to_owned();
        inner.identifier = fields.next().unwrap_or_default().to_owned();
        inner.socket_port = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        inner.mode = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);

        while let Some(kind) = fields.next() {
            let (Some(module), Some(category), Some(enabled)) =
                (fields.next(), fields.next(), fields.next())
            else {
                break;
            };

            let Some(kind) = kind.parse::<u8>().ok().and_then(Kind::from_u8) else {
                continue;
            };
            let enabled = match enabled {
                "0" => false,
                "1" => true,
                _ => continue,
            };

            inner.entries.push(SettingsEntry {
                metadata: Metadata::new(kind, module, category),
                enabled,
            });
        }
    }
}
