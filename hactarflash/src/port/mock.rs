//! Scripted in-process serial device for tests.
//!
//! A [`MockDevice`] owns a [`Responder`] that sees every write and every
//! (re)open of the port and decides which bytes the device sends back.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::port::{Connector, Parity, Port, SerialConfig};

/// Device-side behaviour behind a mock port.
pub(crate) trait Responder: Send {
    /// Called when the host opens the port. Returned bytes are queued for reading.
    fn on_open(&mut self, _config: &SerialConfig) -> Vec<u8> {
        Vec::new()
    }

    /// Called for every host write. Returned bytes are queued for reading.
    fn on_write(&mut self, bytes: &[u8]) -> Vec<u8>;

    /// Called when the host toggles a modem line.
    fn on_signal(&mut self, _line: Line, _level: bool) {}
}

/// Modem control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line {
    Dtr,
    Rts,
}

/// A device that never answers.
pub(crate) struct Silent;

impl Responder for Silent {
    fn on_write(&mut self, _bytes: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

/// A device that answers every write with a closure.
pub(crate) struct Scripted<F>(pub F);

impl<F> Responder for Scripted<F>
where
    F: FnMut(&[u8]) -> Vec<u8> + Send,
{
    fn on_write(&mut self, bytes: &[u8]) -> Vec<u8> {
        (self.0)(bytes)
    }
}

struct Shared {
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    opens: Vec<Parity>,
    signals: Vec<(Line, bool)>,
    responder: Box<dyn Responder>,
}

/// Handle to a scripted device; clones share state.
#[derive(Clone)]
pub(crate) struct MockDevice {
    shared: Arc<Mutex<Shared>>,
}

impl MockDevice {
    pub(crate) fn new(responder: impl Responder + 'static) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                rx: VecDeque::new(),
                writes: Vec::new(),
                opens: Vec::new(),
                signals: Vec::new(),
                responder: Box::new(responder),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn connector(&self) -> MockConnector {
        MockConnector {
            device: self.clone(),
        }
    }

    /// Every write the host made, in order.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .clone()
    }

    /// Parity of every open, in order.
    pub(crate) fn opens(&self) -> Vec<Parity> {
        self.lock()
            .opens
            .clone()
    }

    pub(crate) fn signals(&self) -> Vec<(Line, bool)> {
        self.lock()
            .signals
            .clone()
    }

    /// Queue bytes as if the device sent them unprompted.
    pub(crate) fn inject(&self, bytes: &[u8]) {
        self.lock()
            .rx
            .extend(bytes);
    }
}

/// Connector that opens ports onto a [`MockDevice`].
pub(crate) struct MockConnector {
    device: MockDevice,
}

impl Connector for MockConnector {
    fn open(&mut self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        {
            let mut shared = self
                .device
                .lock();
            shared
                .opens
                .push(config.parity);
            shared
                .rx
                .clear();
            let greeting = shared
                .responder
                .on_open(config);
            shared
                .rx
                .extend(greeting);
        }

        Ok(Box::new(MockPort {
            device: self
                .device
                .clone(),
            timeout: config.timeout,
        }))
    }

    fn port_name(&self) -> &str {
        "mock"
    }
}

struct MockPort {
    device: MockDevice,
    timeout: Duration,
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut shared = self
            .device
            .lock();
        if shared
            .rx
            .is_empty()
        {
            drop(shared);
            thread::sleep(
                self.timeout
                    .min(Duration::from_millis(1)),
            );
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data",
            ));
        }

        let n = buf
            .len()
            .min(
                shared
                    .rx
                    .len(),
            );
        for (slot, byte) in buf
            .iter_mut()
            .zip(
                shared
                    .rx
                    .drain(..n),
            )
        {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut shared = self
            .device
            .lock();
        shared
            .writes
            .push(buf.to_vec());
        let reply = shared
            .responder
            .on_write(buf);
        shared
            .rx
            .extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.device
            .lock()
            .rx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        let mut shared = self
            .device
            .lock();
        shared
            .signals
            .push((Line::Dtr, level));
        shared
            .responder
            .on_signal(Line::Dtr, level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        let mut shared = self
            .device
            .lock();
        shared
            .signals
            .push((Line::Rts, level));
        shared
            .responder
            .on_signal(Line::Rts, level);
        Ok(())
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(Self {
            device: self
                .device
                .clone(),
            timeout: self.timeout,
        }))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
