//! Property tests for the settings environment marshalling: any settings
//! value whose strings avoid the delimiter survives a save/load round trip
//! unchanged.
//!
//! The environment variable is process-global; this binary keeps all cases
//! inside single tests so nothing races.

use std::sync::{Mutex, MutexGuard};

use proptest::collection::vec as prop_vec;
use proptest::prelude::*;

use shmbus_messaging::{Kind, Metadata, Settings, CONFIG_ENV};

fn exclusive() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn identifier_like() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.]{0,12}"
}

#[derive(Debug, Clone)]
struct RowSpec {
    kind: u8,
    module: String,
    category: String,
    enabled: bool,
}

fn row() -> impl Strategy<Value = RowSpec> {
    (1u8..=4, identifier_like(), identifier_like(), any::<bool>()).prop_map(
        |(kind, module, category, enabled)| RowSpec {
            kind,
            module,
            category,
            enabled,
        },
    )
}

fn marshal(path: &str, port: u16, mode: u8, rows: &[RowSpec]) -> String {
    let mut value = format!("{path}|msg|{port}|{mode}");
    for row in rows {
        value.push_str(&format!(
            "|{}|{}|{}|{}",
            row.kind,
            row.module,
            row.category,
            u8::from(row.enabled)
        ));
    }
    value
}

proptest! {
    // Keep the case count modest: every case mutates the process environment.
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// load(save(S)) == S for arbitrary delimiter-free settings.
    #[test]
    fn environment_round_trip(
        path in "/[A-Za-z0-9_/]{1,24}",
        port in any::<u16>(),
        mode in 0u8..8,
        rows in prop_vec(row(), 0..12),
    ) {
        let _guard = exclusive();
        std::env::set_var(CONFIG_ENV, marshal(&path, port, mode, &rows));

        let first = Settings::new();
        first.load();
        first.save();

        let second = Settings::new();
        second.load();

        prop_assert_eq!(second.base_path(), first.base_path());
        prop_assert_eq!(second.identifier(), first.identifier());
        prop_assert_eq!(second.socket_port(), port);
        prop_assert_eq!(second.is_background(), first.is_background());
        prop_assert_eq!(second.is_direct(), first.is_direct());
        prop_assert_eq!(second.is_abbreviated(), first.is_abbreviated());
        prop_assert_eq!(second.entries(), first.entries());

        // And the loaded rows are exactly the marshalled ones.
        let entries = first.entries();
        prop_assert_eq!(entries.len(), rows.len());
        for (entry, spec) in entries.iter().zip(&rows) {
            prop_assert_eq!(entry.metadata.kind() as u8, spec.kind);
            prop_assert_eq!(entry.metadata.module(), spec.module.as_str());
            prop_assert_eq!(entry.metadata.category(), spec.category.as_str());
            prop_assert_eq!(entry.enabled, spec.enabled);
        }
    }

    /// The scan semantics hold for loaded rows: an exact match wins, else
    /// the last applicable row dictates, else the kind default.
    #[test]
    fn is_enabled_honours_row_order(rows in prop_vec(row(), 0..12)) {
        let _guard = exclusive();
        std::env::set_var(CONFIG_ENV, marshal("/tmp/props", 0, 0, &rows));

        let settings = Settings::new();
        settings.load();

        let probe = Metadata::new(Kind::Logging, "ModuleX", "CategoryY");

        let mut expected = Kind::Logging.default_enabled();
        for row in &rows {
            let pattern = Metadata::new(
                Kind::from_u8(row.kind).unwrap(),
                &row.module,
                &row.category,
            );
            if pattern == probe {
                expected = row.enabled;
                break;
            }
            if pattern.applicable(&probe) {
                expected = row.enabled;
            }
        }

        prop_assert_eq!(settings.is_enabled(&probe), expected);
    }
}
