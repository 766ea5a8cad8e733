//! Controller client for a unit's metadata RPC endpoint: list the remote
//! process's categories (or just their module names) and toggle them.

use shmbus::{Error, Result};

use crate::metadata::{ControlEntry, FrameReader, Metadata};
use crate::rpc;

/// A connection to one process's metadata endpoint.
pub struct ControllerClient {
    stream: rpc::Stream,
}

impl ControllerClient {
    /// Dials `endpoint` (socket path or `host:port`), typically obtained
    /// from the frame buffer naming scheme.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let stream = rpc::connect(endpoint).map_err(|_| Error::Unavailable)?;
        Ok(Self { stream })
    }

    /// Fetches the remote category list. A truncated reply yields the
    /// entries that fit; parsing stops cleanly at the cut.
    pub fn list(&mut self) -> Result<Vec<ControlEntry>> {
        rpc::write_frame(&mut self.stream, &[])?;

        let mut frame = [0u8; rpc::MAX_FRAME];
        let length = rpc::read_frame(&mut self.stream, &mut frame)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < length {
            let Some((entry, consumed)) = ControlEntry::deserialize(&frame[offset..length]) else {
                break;
            };
            offset += consumed;
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Fetches the distinct module names announced on the remote side.
    pub fn modules(&mut self) -> Result<Vec<String>> {
        rpc::write_frame(&mut self.stream, &[rpc::MODULE_LIST_REQUEST])?;

        let mut frame = [0u8; rpc::MAX_FRAME];
        let length = rpc::read_frame(&mut self.stream, &mut frame)?;

        let mut reader = FrameReader::new(&frame[..length]);
        let Some(count) = reader.read_u8() else {
            return Ok(Vec::new());
        };

        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let Some(name) = reader.read_cstr() else {
                break;
            };
            names.push(name);
        }

        Ok(names)
    }

    /// Applies one `(metadata, enabled)` update on the remote side.
    pub fn update(&mut self, metadata: &Metadata, enabled: bool) -> Result<()> {
        let mut frame = [0u8; rpc::MAX_FRAME];
        let entry = ControlEntry::new(metadata.clone(), enabled);

        let written = entry.serialize(&mut frame);
        if written == 0 {
            return Err(Error::WriteError);
        }

        rpc::write_frame(&mut self.stream, &frame[..written as usize])?;

        // The acknowledgement is an empty frame.
        let mut reply = [0u8; rpc::MAX_FRAME];
        rpc::read_frame(&mut self.stream, &mut reply)?;
        Ok(())
    }
}
