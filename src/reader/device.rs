//! Character-device reader transport
//!
//! Device files such as `/dev/input/event3` block in `read` until the user
//! scans a tag. A helper thread owns the file and forwards chunks through a
//! channel so the lane can wait with a timeout. The helper is detached on
//! close and exits on its next read once the receiver is gone.
//!
//! Input devices are grabbed exclusively by default so keyboard-wedge scans
//! are not also typed into whatever window has focus. A failed grab is
//! logged and reading continues without it.

use super::driver::{DriverRead, ReaderDriver};
use crate::error::{Result, RfidError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const READ_BUFFER_SIZE: usize = 4096;
const CHUNK_BACKLOG: usize = 64;

type Chunk = std::result::Result<Vec<u8>, String>;

struct Link {
    chunks: Receiver<Chunk>,
    running: Arc<AtomicBool>,
    /// Second handle on the device holding the grab until close
    grabbed: Option<File>,
}

/// Device file driver
pub struct DeviceDriver {
    reader_id: String,
    path: PathBuf,
    grab: bool,
    link: Option<Link>,
}

impl DeviceDriver {
    pub fn new(reader_id: &str, path: PathBuf) -> Self {
        Self {
            reader_id: reader_id.to_string(),
            path,
            grab: false,
            link: None,
        }
    }

    /// Request exclusive access on open
    pub fn with_grab(mut self, grab: bool) -> Self {
        self.grab = grab;
        self
    }

    fn try_grab(&self, file: &File) -> Option<File> {
        let grabbed = file.try_clone().and_then(|handle| {
            set_grab(&handle, true)?;
            Ok(handle)
        });
        match grabbed {
            Ok(handle) => {
                tracing::debug!("[{}] grabbed {}", self.reader_id, self.path.display());
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] no exclusive access to {}, scans may reach other applications: {}",
                    self.reader_id,
                    self.path.display(),
                    e
                );
                None
            }
        }
    }
}

/// EVIOCGRAB: `_IOW('E', 0x90, int)`
#[cfg(target_os = "linux")]
const EVIOCGRAB: u32 = 0x4004_4590;

#[cfg(target_os = "linux")]
fn set_grab(file: &File, grab: bool) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` for the duration of the call
    // and EVIOCGRAB takes its argument by value.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), EVIOCGRAB as _, libc::c_int::from(grab)) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_grab(_file: &File, _grab: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "exclusive grab needs a Linux input device",
    ))
}

fn pump(mut file: File, tx: crossbeam_channel::Sender<Chunk>, running: Arc<AtomicBool>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    while running.load(Ordering::Relaxed) {
        let message = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => Err(e.to_string()),
        };
        let failed = message.is_err();
        if tx.send(message).is_err() || failed {
            break;
        }
    }
}

impl ReaderDriver for DeviceDriver {
    fn open(&mut self) -> Result<()> {
        self.close();
        let file = File::open(&self.path).map_err(|e| {
            RfidError::connection(&self.reader_id, format!("{}: {}", self.path.display(), e))
        })?;

        let grabbed = if self.grab { self.try_grab(&file) } else { None };

        let (tx, rx) = bounded(CHUNK_BACKLOG);
        let running = Arc::new(AtomicBool::new(true));
        let pump_running = running.clone();
        std::thread::Builder::new()
            .name(format!("device-{}", self.reader_id))
            .spawn(move || pump(file, tx, pump_running))?;

        self.link = Some(Link {
            chunks: rx,
            running,
            grabbed,
        });
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<DriverRead> {
        let Some(link) = &self.link else {
            return Err(RfidError::connection(&self.reader_id, "read on closed device"));
        };
        match link.chunks.recv_timeout(timeout) {
            Ok(Ok(bytes)) => Ok(DriverRead::Data(bytes)),
            Ok(Err(message)) => {
                self.close();
                Err(RfidError::connection(&self.reader_id, message))
            }
            Err(RecvTimeoutError::Timeout) => Ok(DriverRead::Idle),
            Err(RecvTimeoutError::Disconnected) => {
                self.close();
                Ok(DriverRead::Closed)
            }
        }
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.running.store(false, Ordering::Relaxed);
            if let Some(handle) = link.grabbed {
                if let Err(e) = set_grab(&handle, false) {
                    tracing::debug!("[{}] releasing grab failed: {}", self.reader_id, e);
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn describe(&self) -> String {
        format!("device:{}", self.path.display())
    }
}

impl Drop for DeviceDriver {
    fn drop(&mut self) {
        self.close();
    }
}
