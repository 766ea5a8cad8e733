//! The in-process registry of message categories.
//!
//! Every category object announces itself on construction and can be toggled
//! locally, from settings, or remotely through the metadata RPC. The
//! registry is a process-wide singleton, initialised lazily so nothing
//! depends on static constructor order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::metadata::{CallSite, ControlEntry, FrameWriter, Kind, Metadata, MessageInfo, TextMessage};
use crate::settings::Settings;
use crate::unit::MessageUnit;

/// A toggleable message category as the registry sees it.
pub trait Control: Send + Sync {
    fn metadata(&self) -> &Metadata;
    fn enabled(&self) -> bool;
    fn enable(&self, enabled: bool);
}

/// The stock [`Control`] implementation: a named category whose producers
/// check a cached flag before paying for serialisation.
pub struct Category {
    metadata: Metadata,
    enabled: AtomicBool,
}

impl Category {
    /// Creates the category, starting with the enablement the configured
    /// settings prescribe, and announces it to the registry.
    pub fn register(kind: Kind, module: &str, category: &str) -> Arc<Category> {
        let metadata = Metadata::new(kind, module, category);
        let enabled = MessageUnit::instance().default_enabled(&metadata);

        let control = Arc::new(Category {
            metadata,
            enabled: AtomicBool::new(enabled),
        });

        ControlRegistry::instance().announce(control.clone());
        control
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Pushes a plain text record under this category, if it is enabled.
    pub fn log(&self, text: &str) {
        if self.is_enabled() {
            let info = MessageInfo::new(self.metadata.clone(), crate::metadata::now_ticks());
            MessageUnit::instance().push(&info, &TextMessage::new(text));
        }
    }

    /// Pushes a text record carrying its call site, if enabled. Used by
    /// tracing and reporting categories.
    pub fn trace(&self, file: &str, line: u32, class: &str, text: &str) {
        if self.is_enabled() {
            let site = CallSite {
                file: file.to_owned(),
                line,
                class: class.to_owned(),
            };
            let info = MessageInfo::with_site(
                self.metadata.clone(),
                crate::metadata::now_ticks(),
                site,
            );
            MessageUnit::instance().push(&info, &TextMessage::new(text));
        }
    }
}

impl Control for Category {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Process-wide collection of announced controls.
pub struct ControlRegistry {
    controls: Mutex<Vec<Arc<dyn Control>>>,
}

impl ControlRegistry {
    pub fn instance() -> &'static ControlRegistry {
        static REGISTRY: OnceLock<ControlRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| ControlRegistry {
            controls: Mutex::new(Vec::new()),
        })
    }

    /// Adds a control. Mandatory at category construction.
    pub fn announce(&self, control: Arc<dyn Control>) {
        self.controls.lock().unwrap().push(control);
    }

    /// Removes a control by identity.
    pub fn revoke(&self, control: &Arc<dyn Control>) {
        self.controls
            .lock()
            .unwrap()
            .retain(|candidate| !Arc::ptr_eq(candidate, control));
    }

    /// Drops every registration. Used at process teardown.
    pub fn revoke_all(&self) {
        self.controls.lock().unwrap().clear();
    }

    /// Visits every control in announcement order.
    pub fn for_each(&self, mut visit: impl FnMut(&dyn Control)) {
        for control in self.controls.lock().unwrap().iter() {
            visit(control.as_ref());
        }
    }

    /// Applies a policy: every control the pattern selects takes the new
    /// enablement.
    pub fn update(&self, pattern: &Metadata, enabled: bool) {
        self.for_each(|control| {
            if pattern.applicable(control.metadata()) && control.enabled() != enabled {
                control.enable(enabled);
            }
        });
    }

    /// Recomputes every control's enablement from the settings list.
    pub fn rebuild(&self, settings: &Settings) {
        self.for_each(|control| {
            let enabled = settings.is_enabled(control.metadata());
            if enabled != control.enabled() {
                control.enable(enabled);
            }
        });
    }

    /// Announce snapshot: serialises `(kind, module, category, enabled)` per
    /// control, optionally filtered by module. Returns the bytes written and
    /// whether entries had to be cut for lack of space.
    pub fn serialize(&self, buffer: &mut [u8], module: Option<&str>) -> (u16, bool) {
        let mut offset = 0u16;
        let mut truncated = false;

        self.for_each(|control| {
            if truncated {
                return;
            }
            if let Some(module) = module {
                if control.metadata().module() != module {
                    return;
                }
            }

            let entry = ControlEntry::new(control.metadata().clone(), control.enabled());
            let written = entry.serialize(&mut buffer[offset as usize..]);
            if written == 0 {
                truncated = true;
            } else {
                offset += written;
            }
        });

        (offset, truncated)
    }

    /// The distinct module names, encoded as `u8 count || name NUL ...`.
    pub fn modules(&self, buffer: &mut [u8]) -> u16 {
        let mut names: Vec<String> = Vec::new();
        self.for_each(|control| {
            let module = control.metadata().module();
            if !names.iter().any(|name| name == module) {
                names.push(module.to_owned());
            }
        });

        debug_assert!(names.len() < 256);

        let mut writer = FrameWriter::new(buffer);
        writer.write_u8(names.len() as u8);
        for name in &names {
            writer.write_cstr(name);
        }

        if writer.overflowed() {
            0
        } else {
            writer.offset() as u16
        }
    }
}
