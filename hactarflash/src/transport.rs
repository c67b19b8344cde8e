//! Byte-level serial transport shared by both bootloader clients.
//!
//! A [`SerialLink`] owns at most one open port. Opening it starts a
//! background reader thread that pushes every received byte into a channel;
//! the protocol clients pop bytes from that channel with a deadline. A read
//! that times out yields `None`, which is never confused with a received
//! byte.
//!
//! Changing parity always means a full close and reopen. `close` joins the
//! reader before releasing the port, so a new reader never races an old one.

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::port::{Connector, DEFAULT_BAUD, Parity, Port, SerialConfig};

/// How long a single read on the background thread may block.
const READ_POLL: Duration = Duration::from_millis(10);

struct Reader {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    rx: Receiver<u8>,
}

/// A serial connection with an inbound byte queue.
pub struct SerialLink {
    connector: Box<dyn Connector>,
    writer: Option<Box<dyn Port>>,
    parity: Option<Parity>,
    reader: Option<Reader>,
}

impl SerialLink {
    /// Create a closed link that opens ports through `connector`.
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            writer: None,
            parity: None,
            reader: None,
        }
    }

    /// Name of the underlying port.
    pub fn port_name(&self) -> &str {
        self.connector
            .port_name()
    }

    /// Whether a port is currently open.
    pub fn is_open(&self) -> bool {
        self.writer
            .is_some()
    }

    /// Parity of the open port, `None` when closed.
    pub fn parity(&self) -> Option<Parity> {
        self.parity
    }

    /// Open the port at 8 data bits, 1 stop bit and the given parity.
    ///
    /// Does nothing when the link is already open with the same parity.
    /// Otherwise any existing connection is closed first and the inbound
    /// queue starts empty.
    pub fn open(&mut self, parity: Parity) -> Result<()> {
        if self.is_open() && self.parity == Some(parity) {
            debug!(
                "{} already open with parity {parity}",
                self.port_name()
            );
            return Ok(());
        }

        self.close()?;

        let config = SerialConfig::new(self.port_name(), DEFAULT_BAUD)
            .with_parity(parity)
            .with_timeout(READ_POLL);
        let port = self
            .connector
            .open(&config)?;
        let reader_port = port.try_clone_port()?;

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("hactarflash-reader".into())
                .spawn(move || pump(reader_port, &stop, &tx))?
        };

        self.writer = Some(port);
        self.parity = Some(parity);
        self.reader = Some(Reader { stop, handle, rx });

        debug!(
            "Opened {} at {} baud, parity {parity}",
            self.port_name(),
            DEFAULT_BAUD
        );
        Ok(())
    }

    /// Stop the background reader, wait for it to exit and release the port.
    ///
    /// Calling this on a closed link is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut writer) = self
            .writer
            .take()
        else {
            debug!("{} already closed", self.port_name());
            return Ok(());
        };

        if let Some(reader) = self
            .reader
            .take()
        {
            reader
                .stop
                .store(true, Ordering::Release);
            if reader
                .handle
                .join()
                .is_err()
            {
                warn!("Serial reader thread panicked");
            }
        }

        self.parity = None;
        writer.close()?;
        debug!("Closed {}", self.port_name());
        Ok(())
    }

    /// Pop one byte, waiting at most `timeout`.
    ///
    /// Returns `None` when nothing arrived in time.
    pub fn read_byte(&mut self, timeout: Duration) -> Option<u8> {
        let reader = self
            .reader
            .as_ref()?;
        match reader
            .rx
            .recv_timeout(timeout)
        {
            Ok(byte) => Some(byte),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // Reader exited; behave like a silent device.
                thread::sleep(timeout);
                None
            },
        }
    }

    /// Collect up to `n` bytes within `timeout`.
    ///
    /// Returns whatever arrived, possibly nothing. Callers decide whether a
    /// short read is an error.
    pub fn read_bytes(&mut self, n: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(n);

        while out.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read_byte(remaining) {
                Some(byte) => out.push(byte),
                None => break,
            }
        }

        trace!("Read {}/{n} bytes: {out:02X?}", out.len());
        out
    }

    /// Like [`read_bytes`](Self::read_bytes), but an empty result is a
    /// [`Error::NoReply`] for `stage`.
    pub fn read_bytes_or_fail(
        &mut self,
        n: usize,
        timeout: Duration,
        stage: &str,
    ) -> Result<Vec<u8>> {
        let bytes = self.read_bytes(n, timeout);
        if bytes.is_empty() {
            return Err(Error::no_reply(stage));
        }
        Ok(bytes)
    }

    /// Write the whole buffer. A failed write is not retried.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(Error::TransportClosed)?;
        trace!("Write {} bytes: {bytes:02X?}", bytes.len());
        writer.write_all_bytes(bytes)
    }

    /// Drive the RTS line.
    pub fn set_rts(&mut self, level: bool) -> Result<()> {
        self.writer
            .as_mut()
            .ok_or(Error::TransportClosed)?
            .set_rts(level)
    }

    /// Drive the DTR line.
    pub fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.writer
            .as_mut()
            .ok_or(Error::TransportClosed)?
            .set_dtr(level)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {e}", self.port_name());
        }
    }
}

/// Background reader body: forward bytes until asked to stop or the stream ends.
fn pump(mut port: Box<dyn Port>, stop: &AtomicBool, tx: &Sender<u8>) {
    let mut buf = [0u8; 256];

    while !stop.load(Ordering::Acquire) {
        match port.read(&mut buf) {
            Ok(0) => {
                debug!("Serial stream ended");
                break;
            },
            Ok(n) => {
                for &byte in &buf[..n] {
                    if tx
                        .send(byte)
                        .is_err()
                    {
                        return;
                    }
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {},
            Err(e) => {
                warn!("Serial reader stopped: {e}");
                break;
            },
        }
    }

    if let Err(e) = port.close() {
        trace!("Reader port close failed: {e}");
    }
}
