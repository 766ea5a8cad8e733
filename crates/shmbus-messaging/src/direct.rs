//! Direct output: format a record as a human-readable line instead of (or
//! before) the shared buffer exists.
//!
//! Foreground processes print to stdout; background (daemonised) processes
//! emit through syslog. Abbreviated mode trades the absolute timestamp and
//! call site for a compact microsecond offset since the unit opened.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::metadata::{now_ticks, Event, Kind, MessageInfo};

pub struct DirectOutput {
    base_ticks: u64,
    syslog: AtomicBool,
    abbreviated: AtomicBool,
}

impl Default for DirectOutput {
    fn default() -> Self {
        Self {
            base_ticks: now_ticks(),
            syslog: AtomicBool::new(false),
            abbreviated: AtomicBool::new(false),
        }
    }
}

impl DirectOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&self, background: bool, abbreviated: bool) {
        self.syslog.store(background, Ordering::Relaxed);
        self.abbreviated.store(abbreviated, Ordering::Relaxed);
    }

    /// Formats and emits one record.
    pub fn output(&self, info: &MessageInfo, event: &dyn Event) {
        let line = self.format(info, event);

        if self.syslog.load(Ordering::Relaxed) {
            if let Ok(message) = CString::new(line) {
                // SAFETY: "%s" with one matching string argument.
                unsafe {
                    libc::syslog(libc::LOG_NOTICE, c"%s".as_ptr(), message.as_ptr());
                }
            }
        } else {
            println!("{line}");
        }
    }

    fn format(&self, info: &MessageInfo, event: &dyn Event) -> String {
        let category = info.metadata().category();

        if self.abbreviated.load(Ordering::Relaxed) {
            let elapsed = info.timestamp().saturating_sub(self.base_ticks);
            return format!("[{elapsed:11} us]:[{category}] {}", event.data());
        }

        let time = format_ticks(info.timestamp());
        match info.metadata().kind() {
            Kind::Tracing | Kind::Reporting => {
                let site = info.site().cloned().unwrap_or_default();
                let file = site.file.rsplit('/').next().unwrap_or(&site.file);
                format!(
                    "[{time}]:[{file}:{}]:[{}]:[{category}]: {}",
                    site.line,
                    site.class,
                    event.data()
                )
            }
            _ => format!("[{time}]:[{category}]: {}", event.data()),
        }
    }
}

fn format_ticks(ticks: u64) -> String {
    DateTime::<Utc>::from_timestamp_micros(ticks as i64)
        .map(|stamp| stamp.format("%a, %d %b %Y %H:%M:%S%.3f GMT").to_string())
        .unwrap_or_else(|| ticks.to_string())
}
