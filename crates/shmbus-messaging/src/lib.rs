//! shmbus-messaging — categorized log/trace delivery over the shmbus
//! shared-memory transport.
//!
//! Producer components register [`Category`] objects (kind + module + label,
//! each with a cached enabled flag) with the process-wide registry. Enabled
//! categories serialise `metadata || payload` records into the
//! [`MessageUnit`]'s frame buffer, where an out-of-process consumer picks
//! them up. A controller can attach to the unit's metadata RPC endpoint to
//! list categories and toggle them at runtime; settings travel to spawned
//! processes through a single environment variable.
//!
//! # Example
//!
//! ```no_run
//! use shmbus_messaging::{FlushMode, Kind, Category, MessageUnit};
//! use std::path::Path;
//!
//! MessageUnit::instance().open(
//!     Path::new("/tmp/bus"),
//!     0,
//!     r#"{ "logging": { "settings": [] } }"#,
//!     false,
//!     FlushMode::Off,
//! )?;
//!
//! let startup = Category::register(Kind::Logging, "Plugin", "Startup");
//! startup.log("service is up");
//! # Ok::<(), shmbus::Error>(())
//! ```

mod client;
mod console;
mod control;
mod direct;
mod metadata;
mod rpc;
mod settings;
mod unit;

pub use client::ControllerClient;
pub use console::{StdStream, StreamRedirect};
pub use control::{Category, Control, ControlRegistry};
pub use direct::DirectOutput;
pub use metadata::{
    now_ticks, CallSite, ControlEntry, Event, Kind, MessageInfo, Metadata, TextMessage,
};
pub use settings::{FlushMode, Settings, SettingsEntry, CONFIG_ENV};
pub use unit::{MessageUnit, IDENTIFIER, METADATA_FRAME_SIZE};

// The transport error surface is shared with the core crate.
pub use shmbus::{Error, Result};
