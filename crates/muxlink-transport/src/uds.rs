//! Unix domain socket transport.
//!
//! Each connection owns a background reader thread that pushes `Received`
//! events into the owning event loop. Writes happen on the caller's thread
//! and complete synchronously; the `SendComplete` event is pushed once the
//! bytes are flushed, preserving the one-frame-in-flight discipline.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::{EventSink, Transport, TransportEvent};

const READ_CHUNK_SIZE: usize = 8 * 1024;

pub struct UdsTransport {
    writer: Mutex<UnixStream>,
    reader: Mutex<Option<UnixStream>>,
    sink: EventSink,
    closed: AtomicBool,
    deactivated: AtomicBool,
}

impl UdsTransport {
    /// Connect to a listening socket. Spawns the reader thread and pushes
    /// `Activated` once the connection is up.
    pub fn connect(path: impl AsRef<Path>, sink: EventSink) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| TransportError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to unix domain socket");
        Self::from_stream(stream, sink)
    }

    /// Wrap an already-connected stream (e.g. one returned by `accept`).
    pub fn from_stream(stream: UnixStream, sink: EventSink) -> Result<Arc<Self>> {
        let reader = stream.try_clone()?;
        let transport = Arc::new(Self {
            writer: Mutex::new(stream),
            reader: Mutex::new(Some(reader)),
            sink,
            closed: AtomicBool::new(false),
            deactivated: AtomicBool::new(false),
        });
        transport.sink.push(TransportEvent::Activated);
        spawn_reader(Arc::clone(&transport));
        Ok(transport)
    }

    fn deactivate(&self, error: Option<TransportError>) {
        if !self.deactivated.swap(true, Ordering::AcqRel) {
            self.sink.push(TransportEvent::Deactivated(error));
        }
    }
}

fn spawn_reader(transport: Arc<UdsTransport>) {
    let stream = transport
        .reader
        .lock()
        .expect("reader lock")
        .take()
        .expect("reader stream taken once");

    std::thread::spawn(move || {
        let mut stream = stream;
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    transport.deactivate(None);
                    return;
                }
                Ok(n) => {
                    transport
                        .sink
                        .push(TransportEvent::Received(Bytes::copy_from_slice(
                            &chunk[..n],
                        )));
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    // A close() on our side shuts the socket down; that read
                    // failure is an orderly teardown, not an error.
                    let error = if transport.closed.load(Ordering::Acquire) {
                        None
                    } else {
                        Some(TransportError::Io(err))
                    };
                    transport.deactivate(error);
                    return;
                }
            }
        }
    });
}

impl Transport for UdsTransport {
    fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut stream = self.writer.lock().expect("writer lock");
        let mut offset = 0usize;
        while offset < frame.len() {
            match stream.write(&frame[offset..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        stream.flush()?;
        drop(stream);
        self.sink.push(TransportEvent::SendComplete);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let stream = self.writer.lock().expect("writer lock");
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Listens on a filesystem-path Unix domain socket.
///
/// A stale socket file left by a previous run is removed before binding;
/// non-socket files are never touched. The socket file is removed on drop.
#[derive(Debug)]
pub struct UdsListener {
    listener: UnixListener,
    path: PathBuf,
}

impl UdsListener {
    /// Bind and listen on `path`.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| TransportError::Bind {
                path: path.clone(),
                source: e,
            })?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| TransportError::Bind {
                    path: path.clone(),
                    source: e,
                })?;
            } else {
                return Err(TransportError::Bind {
                    path: path.clone(),
                    source: std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                });
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| TransportError::Bind {
            path: path.clone(),
            source: e,
        })?;
        info!(?path, "listening on unix domain socket");
        Ok(Self { listener, path })
    }

    /// Accept the next connection (blocking) and wrap it as a transport.
    pub fn accept(&self, sink: EventSink) -> Result<Arc<UdsTransport>> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!("accepted connection");
        UdsTransport::from_stream(stream, sink)
    }

    /// The path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UdsListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
