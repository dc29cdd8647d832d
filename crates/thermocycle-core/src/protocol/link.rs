//! Byte-level link to the rig controller
//!
//! `Link` abstracts the transport so the session can run against a real
//! serial port or the in-memory simulator.

use serialport::SerialPort;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::serial::{clear_buffers, configure_port, open_port};
use super::ProtocolError;

/// Cloneable flag used to close a session from another thread
///
/// A blocking read polls this flag between slices and gives up with
/// [`ProtocolError::Closed`] once it is raised.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the session to close
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Abstraction for the byte channel to the controller
pub trait Link: Send {
    /// Human-readable endpoint name (device path)
    fn name(&self) -> &str;

    /// Read whatever bytes arrive within `timeout` (at least one)
    fn read(&mut self, timeout: Duration, cancel: &CloseHandle) -> Result<Vec<u8>, ProtocolError>;

    /// Write all of `data`, failing on a short write
    fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError>;

    /// Discard unread input
    fn clear_input(&mut self) -> Result<(), ProtocolError>;

    /// Release the underlying handle; calling twice is a no-op
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

fn claimed_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Process-wide exclusive claim on a device path
#[derive(Debug)]
pub struct PathClaim {
    path: PathBuf,
}

impl PathClaim {
    /// Claim `path`, failing if another link in this process holds it
    pub fn acquire(path: &Path) -> Result<Self, ProtocolError> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut claimed = claimed_paths().lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(key.clone()) {
            return Err(ProtocolError::Connection(format!(
                "{} is already held by another session",
                path.display()
            )));
        }
        Ok(Self { path: key })
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        let mut claimed = claimed_paths().lock().unwrap_or_else(|e| e.into_inner());
        claimed.remove(&self.path);
    }
}

/// Serial port implementation of [`Link`]
pub struct SerialLink {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    claim: Option<PathClaim>,
    poll_interval: Duration,
}

impl SerialLink {
    /// Open and configure the device at `path`
    ///
    /// Fails with [`ProtocolError::Connection`] when the path does not exist,
    /// is already claimed in this process, or the OS refuses the open.
    pub fn open(path: &str, baud_rate: u32, poll_interval: Duration) -> Result<Self, ProtocolError> {
        #[cfg(unix)]
        if !Path::new(path).exists() {
            return Err(ProtocolError::Connection(format!("{} does not exist", path)));
        }

        let claim = PathClaim::acquire(Path::new(path))?;

        // On Unix the TTY is opened with TIOCEXCL, so other processes are locked out too
        let mut port = open_port(path, baud_rate, poll_interval).map_err(|e| match e {
            ProtocolError::Serial(msg) => ProtocolError::Connection(msg),
            other => other,
        })?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;

        info!("Opened {} at {} baud", path, baud_rate);
        Ok(Self {
            name: path.to_string(),
            port: Some(port),
            claim: Some(claim),
            poll_interval,
        })
    }
}

impl Link for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, timeout: Duration, cancel: &CloseHandle) -> Result<Vec<u8>, ProtocolError> {
        let poll = self.poll_interval;
        let start = Instant::now();
        let mut buffer = [0u8; 256];

        loop {
            if cancel.is_closed() {
                return Err(ProtocolError::Closed);
            }
            let port = self.port.as_mut().ok_or(ProtocolError::Closed)?;

            if start.elapsed() > timeout {
                return Err(ProtocolError::Timeout);
            }

            // Poll with bytes_to_read() so a close request is noticed between slices
            let available = port.bytes_to_read()? as usize;
            if available == 0 {
                std::thread::sleep(poll);
                continue;
            }

            let to_read = available.min(buffer.len());
            match port.read(&mut buffer[..to_read]) {
                Ok(0) => {
                    return Err(ProtocolError::Connection(format!("{} reported EOF", self.name)));
                }
                Ok(n) => {
                    debug!("Read {} bytes: {:02x?}", n, &buffer[..n]);
                    return Ok(buffer[..n].to_vec());
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    continue;
                }
                Err(e) => return Err(ProtocolError::Io(e)),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::Closed)?;
        let written = port.write(data)?;
        if written != data.len() {
            warn!("Short write on {}: {} of {} bytes", self.name, written, data.len());
            return Err(ProtocolError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        debug!("Wrote {} bytes: {:02x?}", written, data);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::Closed)?;
        port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed {}", self.name);
        }
        self.claim = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_handle_is_shared() {
        let handle = CloseHandle::new();
        let other = handle.clone();
        assert!(!handle.is_closed());
        other.close();
        assert!(handle.is_closed());
    }

    #[test]
    fn test_path_claim_is_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ttyFAKE0");
        std::fs::write(&path, b"").expect("create file");

        let claim = PathClaim::acquire(&path).expect("first claim");
        assert!(matches!(
            PathClaim::acquire(&path),
            Err(ProtocolError::Connection(_))
        ));
        drop(claim);
        assert!(PathClaim::acquire(&path).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_open_missing_path_fails() {
        let result = SerialLink::open("/dev/definitely-not-a-rig", 115200, Duration::from_millis(2));
        assert!(matches!(result, Err(ProtocolError::Connection(_))));
    }
}
