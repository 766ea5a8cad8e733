//! The process-wide message unit.
//!
//! One instance per process, reached through [`MessageUnit::instance`]. The
//! server side configures settings from JSON, exports them through the
//! environment, and creates its frame buffer; spawned processes pick the
//! settings back up and create their own instance-numbered buffer. Every
//! open unit also answers the metadata RPC, through which a controller
//! lists and toggles this process's categories.

use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use shmbus::{Error, FrameBuffer, Result};

use crate::console::{StdStream, StreamRedirect};
use crate::control::ControlRegistry;
use crate::direct::DirectOutput;
use crate::metadata::{ControlEntry, Event, MessageInfo, Metadata};
use crate::rpc;
use crate::settings::{FlushMode, Settings};

/// Identifier under which the unit's files live in the base directory.
pub const IDENTIFIER: &str = "msg";

/// Fixed buffer size for metadata RPC handling.
pub const METADATA_FRAME_SIZE: usize = 10 * 1024;

/// Per-thread scratch for record serialisation; records above this are cut
/// by their event serialiser.
const SCRATCH_SIZE: usize = 8 * 1024;

thread_local! {
    static SCRATCH: RefCell<[u8; SCRATCH_SIZE]> = const { RefCell::new([0u8; SCRATCH_SIZE]) };
}

struct Active {
    dispatcher: Arc<FrameBuffer>,
    rpc: Option<RpcServer>,
    redirects: Vec<StreamRedirect>,
}

/// See the module documentation.
pub struct MessageUnit {
    settings: Settings,
    direct: DirectOutput,
    active: Mutex<Option<Active>>,
}

impl MessageUnit {
    /// The one instance of this process.
    pub fn instance() -> &'static MessageUnit {
        static UNIT: OnceLock<MessageUnit> = OnceLock::new();
        UNIT.get_or_init(|| MessageUnit {
            settings: Settings::new(),
            direct: DirectOutput::new(),
            active: Mutex::new(None),
        })
    }

    /// The unit's settings; categories consult these for their defaults.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn base_path(&self) -> String {
        self.settings.base_path()
    }

    pub fn identifier(&self) -> String {
        self.settings.identifier()
    }

    pub fn socket_port(&self) -> u16 {
        self.settings.socket_port()
    }

    /// Opens the unit on the supervising side: parses `configuration`,
    /// recreates the base directory (clearing stale sockets of a previous
    /// run), exports the settings for child processes, and creates buffer
    /// instance 0.
    pub fn open(
        &self,
        base_path: &Path,
        socket_port: u16,
        configuration: &str,
        background: bool,
        flush: FlushMode,
    ) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        debug_assert!(active.is_none(), "message unit opened twice");
        if active.is_some() {
            return Err(Error::IllegalState);
        }

        self.settings.configure(
            &base_path.to_string_lossy(),
            IDENTIFIER,
            socket_port,
            configuration,
            background,
            flush,
        );

        if base_path.is_dir() {
            // Clear data (e.g. sockets) remaining from a previous run.
            let _ = std::fs::remove_dir_all(base_path);
        }
        std::fs::create_dir_all(base_path)?;

        // Spawned processes inherit the configuration from here on.
        self.settings.save();

        *active = Some(self.activate(FrameBuffer::create(
            IDENTIFIER,
            0,
            base_path,
            socket_port,
        )?)?);

        Ok(())
    }

    /// Opens the unit in a spawned process: rebuilds the settings from the
    /// environment and creates this instance's own buffer.
    pub fn open_instance(&self, instance_id: u32) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        debug_assert!(active.is_none(), "message unit opened twice");
        if active.is_some() {
            return Err(Error::IllegalState);
        }

        self.settings.load();
        let base_path = self.settings.base_path();
        if base_path.is_empty() {
            return Err(Error::IllegalState);
        }

        *active = Some(self.activate(FrameBuffer::create(
            &self.settings.identifier(),
            instance_id,
            Path::new(&base_path),
            self.settings.socket_port(),
        )?)?);

        Ok(())
    }

    fn activate(&self, dispatcher: FrameBuffer) -> Result<Active> {
        let dispatcher = Arc::new(dispatcher);
        let rpc = RpcServer::start(dispatcher.metadata_endpoint())?;

        self.direct
            .set_mode(self.settings.is_background(), self.settings.is_abbreviated());

        // Everything announced so far adopts the configured policy.
        ControlRegistry::instance().rebuild(&self.settings);

        // Console capture cannot coexist with direct output: the captured
        // lines would be printed right back into the capture.
        let mut redirects = Vec::new();
        if !self.settings.is_direct() {
            if self.settings.has_redirected_stdout() {
                redirects.push(StreamRedirect::open(StdStream::Out)?);
            }
            if self.settings.has_redirected_stderr() {
                redirects.push(StreamRedirect::open(StdStream::Err)?);
            }
        }

        Ok(Active {
            dispatcher,
            rpc: Some(rpc),
            redirects,
        })
    }

    /// Tears the unit down: restores redirected streams, stops the RPC
    /// endpoint and revokes every announced category.
    pub fn close(&self) {
        let taken = self.active.lock().unwrap().take();

        if let Some(mut active) = taken {
            // Outside the state lock: the redirect readers may be pushing,
            // which must observe the unit as closed, not deadlock on it.
            for redirect in active.redirects.drain(..) {
                redirect.close();
            }
            if let Some(mut rpc) = active.rpc.take() {
                rpc.stop();
            }
            ControlRegistry::instance().revoke_all();
            active.dispatcher.relinquish();
        }
    }

    /// The configured initial enablement for a (usually newly announced)
    /// category.
    pub fn default_enabled(&self, metadata: &Metadata) -> bool {
        self.settings.is_enabled(metadata)
    }

    /// Routes one record: direct mode formats it for a human; otherwise it
    /// is serialised into per-thread scratch and appended to the frame
    /// buffer. A record whose metadata alone overflows the scratch is
    /// dropped; oversized payloads are cut by their own serialiser.
    pub fn push(&self, info: &MessageInfo, event: &dyn Event) {
        if self.settings.is_direct() {
            self.direct.output(info, event);
            return;
        }

        let active = self.active.lock().unwrap();
        let Some(active) = active.as_ref() else {
            return;
        };

        SCRATCH.with(|cell| {
            let buffer = &mut *cell.borrow_mut();

            let header = info.serialize(buffer.as_mut_slice()) as usize;
            if header == 0 {
                return;
            }

            let payload = event.serialize(&mut buffer[header..]) as usize;
            let _ = active.dispatcher.push(&buffer[..header + payload]);
        });
    }

    /// Applies a policy change now and records it for categories announced
    /// later.
    pub fn update(&self, metadata: &Metadata, enabled: bool) {
        self.settings.update(metadata, enabled);
        ControlRegistry::instance().update(metadata, enabled);
    }

    /// Serialises the full category list for a controller.
    pub fn serialize_controls(&self, buffer: &mut [u8]) -> (u16, bool) {
        ControlRegistry::instance().serialize(buffer, None)
    }
}

// ---------------------------------------------------------------------
// Metadata RPC endpoint
// ---------------------------------------------------------------------

struct RpcServer {
    endpoint: String,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RpcServer {
    fn start(endpoint: &str) -> Result<RpcServer> {
        let listener = rpc::Listener::bind(endpoint)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    let Ok(mut stream) = listener.accept() else {
                        break;
                    };
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let _ = Self::serve(&mut stream);
                }
            })
        };

        Ok(RpcServer {
            endpoint: endpoint.to_owned(),
            shutdown,
            thread: Some(thread),
        })
    }

    /// One controller connection: an empty request lists the categories, the
    /// module-list byte asks for the distinct module names, and any other
    /// request applies one `(metadata, enabled)` update.
    fn serve(stream: &mut rpc::Stream) -> std::io::Result<()> {
        let mut frame = [0u8; METADATA_FRAME_SIZE];

        loop {
            let length = rpc::read_frame(stream, &mut frame)?;

            if length == 0 {
                // The reply frame caps the list; truncation cuts at an
                // entry boundary and is never fatal.
                let (written, _truncated) =
                    MessageUnit::instance().serialize_controls(&mut frame[..rpc::MAX_FRAME]);
                rpc::write_frame(stream, &frame[..written as usize])?;
            } else if frame[..length] == [rpc::MODULE_LIST_REQUEST] {
                let written =
                    ControlRegistry::instance().modules(&mut frame[..rpc::MAX_FRAME]);
                rpc::write_frame(stream, &frame[..written as usize])?;
            } else {
                if let Some((entry, _)) = ControlEntry::deserialize(&frame[..length]) {
                    MessageUnit::instance().update(&entry.metadata, entry.enabled);
                }
                rpc::write_frame(stream, &[])?;
            }
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Unblock the accept loop.
        let _ = rpc::connect(&self.endpoint);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}
