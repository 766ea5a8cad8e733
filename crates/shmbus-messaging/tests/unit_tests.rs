//! End-to-end tests for the message unit: environment inheritance, record
//! flow from category to consumer, and the metadata RPC.
//!
//! The unit and the settings environment variable are process-global, so
//! every test serialises on one lock and closes the unit before releasing.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use shmbus::FrameBuffer;
use shmbus_messaging::{
    Category, ControllerClient, Error, FlushMode, Kind, MessageInfo, MessageUnit, Metadata,
    Settings, TextMessage, IDENTIFIER,
};

fn exclusive() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn settings_round_trip_through_environment() {
    let _guard = exclusive();

    let original = Settings::new();
    original.configure(
        "/tmp/bus-env",
        "msg",
        7120,
        r#"{
            "tracing": { "settings": [
                { "module": "Plugin", "category": "Information", "enabled": true },
                { "category": "Warning", "enabled": true }
            ]},
            "logging": { "settings": [
                { "module": "Core", "category": "Startup", "enabled": false }
            ]}
        }"#,
        true,
        FlushMode::Off,
    );
    original.save();

    let restored = Settings::new();
    restored.load();

    assert_eq!(restored.base_path(), "/tmp/bus-env");
    assert_eq!(restored.identifier(), "msg");
    assert_eq!(restored.socket_port(), 7120);
    assert_eq!(restored.is_background(), original.is_background());
    assert_eq!(restored.is_direct(), original.is_direct());
    assert_eq!(restored.entries(), original.entries());
}

#[test]
fn records_flow_from_category_to_consumer() {
    let _guard = exclusive();

    let dir = tempfile::tempdir().unwrap();
    let unit = MessageUnit::instance();
    unit.open(dir.path(), 0, "{}", false, FlushMode::Off).unwrap();

    // Attach the way a collector process would, and arm the doorbell.
    let consumer = FrameBuffer::open(IDENTIFIER, 0, dir.path(), 0).unwrap();
    assert_eq!(consumer.wait(Duration::from_millis(10)), Err(Error::TimedOut));

    let startup = Category::register(Kind::Logging, "Plugin", "Startup");
    assert!(startup.is_enabled(), "logging defaults on");
    startup.log("service is up");

    assert_eq!(consumer.wait(Duration::from_secs(1)), Ok(()));

    let mut record = [0u8; 1024];
    let length = consumer.pop(&mut record).unwrap();

    let (info, consumed) = MessageInfo::deserialize(&record[..length]).unwrap();
    assert_eq!(info.metadata(), &Metadata::new(Kind::Logging, "Plugin", "Startup"));
    assert!(info.timestamp() > 0);
    assert_eq!(info.site(), None);

    let (text, _) = TextMessage::deserialize(&record[consumed..length]).unwrap();
    assert_eq!(shmbus_messaging::Event::data(&text), "service is up");

    unit.close();
}

#[test]
fn disabled_category_pushes_nothing() {
    let _guard = exclusive();

    let dir = tempfile::tempdir().unwrap();
    let unit = MessageUnit::instance();
    unit.open(dir.path(), 0, "{}", false, FlushMode::Off).unwrap();

    let consumer = FrameBuffer::open(IDENTIFIER, 0, dir.path(), 0).unwrap();

    // Tracing defaults off.
    let verbose = Category::register(Kind::Tracing, "Plugin", "Verbose");
    assert!(!verbose.is_enabled());
    verbose.trace("file.rs", 10, "Worker", "unheard");

    let mut record = [0u8; 1024];
    assert_eq!(consumer.pop(&mut record), Err(Error::Empty));

    unit.close();
}

#[test]
fn controller_lists_and_toggles_categories() {
    let _guard = exclusive();

    let dir = tempfile::tempdir().unwrap();
    let unit = MessageUnit::instance();
    unit.open(dir.path(), 0, "{}", false, FlushMode::Off).unwrap();

    let startup = Category::register(Kind::Logging, "Plugin", "Startup");
    let verbose = Category::register(Kind::Tracing, "Plugin", "Verbose");

    let endpoint = dir
        .path()
        .join(format!("{IDENTIFIER}.0.metadata"))
        .to_string_lossy()
        .into_owned();

    {
        let mut controller = ControllerClient::connect(&endpoint).unwrap();

        let listed = controller.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed
            .iter()
            .any(|entry| entry.metadata.category() == "Startup" && entry.enabled));
        assert!(listed
            .iter()
            .any(|entry| entry.metadata.category() == "Verbose" && !entry.enabled));

        // Both categories share one module; the module list deduplicates.
        assert_eq!(controller.modules().unwrap(), vec!["Plugin".to_owned()]);

        // Flip both through the wire.
        controller
            .update(&Metadata::new(Kind::Tracing, "Plugin", "Verbose"), true)
            .unwrap();
        controller
            .update(&Metadata::new(Kind::Logging, "Plugin", "Startup"), false)
            .unwrap();

        assert!(verbose.is_enabled());
        assert!(!startup.is_enabled());

        // The change also steers categories announced afterwards.
        let late = Category::register(Kind::Logging, "Plugin", "Startup");
        assert!(!late.is_enabled());
    }

    // The controller connection must be gone before teardown.
    unit.close();
}

#[test]
fn spawned_instance_inherits_configuration() {
    let _guard = exclusive();

    let dir = tempfile::tempdir().unwrap();
    let unit = MessageUnit::instance();
    unit.open(
        dir.path(),
        0,
        r#"{ "tracing": { "settings": [ { "category": "Handshake", "enabled": true } ] } }"#,
        false,
        FlushMode::Off,
    )
    .unwrap();

    // A child process would call open_instance; here we just verify the
    // marshalled settings say what it would find.
    let inherited = Settings::new();
    inherited.load();

    assert_eq!(inherited.base_path(), dir.path().to_string_lossy());
    assert_eq!(inherited.identifier(), IDENTIFIER);
    assert!(inherited.is_enabled(&Metadata::new(Kind::Tracing, "Any", "Handshake")));
    assert!(!inherited.is_enabled(&Metadata::new(Kind::Tracing, "Any", "Other")));

    // The instance-numbered buffer a child would create is addressable in
    // the same directory.
    let sibling = FrameBuffer::create(IDENTIFIER, 7, Path::new(&inherited.base_path()), 0).unwrap();
    assert!(sibling.name().ends_with("msg.7.data"));

    unit.close();
}
