//! Standard stream capture: route a process's stdout/stderr lines through
//! the message unit as operational-stream records.
//!
//! The stream's descriptor is replaced by the write end of a pipe; a reader
//! thread splits the captured bytes on newlines and pushes each line under
//! the well-known `StandardOut`/`StandardError` category. Closing restores
//! the saved descriptor, which drains the pipe and ends the reader.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::FromRawFd;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use crate::control::Category;
use crate::metadata::Kind;

const OPERATIONAL_MODULE: &str = "OperationalStream";

/// Which standard stream a redirect captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Out,
    Err,
}

impl StdStream {
    fn fd(self) -> libc::c_int {
        match self {
            StdStream::Out => libc::STDOUT_FILENO,
            StdStream::Err => libc::STDERR_FILENO,
        }
    }

    fn category(self) -> &'static Arc<Category> {
        static OUT: OnceLock<Arc<Category>> = OnceLock::new();
        static ERR: OnceLock<Arc<Category>> = OnceLock::new();

        match self {
            StdStream::Out => OUT.get_or_init(|| {
                Category::register(Kind::OperationalStream, OPERATIONAL_MODULE, "StandardOut")
            }),
            StdStream::Err => ERR.get_or_init(|| {
                Category::register(Kind::OperationalStream, OPERATIONAL_MODULE, "StandardError")
            }),
        }
    }
}

/// An active capture of one standard stream. Dropping it restores the
/// original descriptor.
pub struct StreamRedirect {
    stream: StdStream,
    saved: libc::c_int,
    reader: Option<JoinHandle<()>>,
}

impl StreamRedirect {
    /// Swaps the stream's descriptor for a pipe and starts the line reader.
    pub fn open(stream: StdStream) -> std::io::Result<Self> {
        let mut pipe_fds = [0 as libc::c_int; 2];
        // SAFETY: plain pipe(2) into a local array.
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let (read_end, write_end) = (pipe_fds[0], pipe_fds[1]);

        // SAFETY: duplicating the stream's current descriptor so it can be
        // restored, then pointing the stream at the pipe.
        let saved = unsafe { libc::dup(stream.fd()) };
        if saved < 0 || unsafe { libc::dup2(write_end, stream.fd()) } < 0 {
            let error = std::io::Error::last_os_error();
            unsafe {
                libc::close(read_end);
                libc::close(write_end);
                if saved >= 0 {
                    libc::close(saved);
                }
            }
            return Err(error);
        }
        // The stream descriptor now holds the pipe's only write reference.
        // SAFETY: write_end is ours and no longer needed.
        unsafe { libc::close(write_end) };

        let reader = std::thread::spawn(move || {
            // SAFETY: read_end is an open descriptor owned by this thread.
            let pipe = unsafe { File::from_raw_fd(read_end) };
            for line in BufReader::new(pipe).lines() {
                match line {
                    Ok(line) => stream.category().log(&line),
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            stream,
            saved,
            reader: Some(reader),
        })
    }

    fn restore(&mut self) {
        if self.saved >= 0 {
            // SAFETY: putting the saved descriptor back closes the pipe's
            // write end, which ends the reader after it drains.
            unsafe {
                libc::dup2(self.saved, self.stream.fd());
                libc::close(self.saved);
            }
            self.saved = -1;
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    /// Restores the original descriptor and joins the reader.
    pub fn close(mut self) {
        self.restore();
    }
}

impl Drop for StreamRedirect {
    fn drop(&mut self) {
        self.restore();
    }
}
