//! Entry streams handed to callers.
//!
//! A stream keeps its archive holder checked out until it is closed. Formats
//! that can read an entry from an independent file handle are read directly.
//! Everything else is extracted on a background thread that pushes fixed-size
//! chunks through a bounded channel; the reader pulls them on demand.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};

use super::ArchiveHolder;
use crate::cache::CacheHandle;
use crate::config::LimitsConfig;
use crate::errors::VfsError;

type Chunk = io::Result<Vec<u8>>;

enum StreamState {
    Direct {
        reader: Box<dyn Read + Send>,
        _handle: CacheHandle<ArchiveHolder>,
    },
    Piped {
        rx: Receiver<Chunk>,
        current: Vec<u8>,
        pos: usize,
        cancel: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
    },
    Closed,
}

/// Decompressed bytes of one archive entry
pub struct EntryStream {
    state: StreamState,
}

impl EntryStream {
    pub(crate) fn direct(reader: Box<dyn Read + Send>, handle: CacheHandle<ArchiveHolder>) -> Self {
        Self {
            state: StreamState::Direct {
                reader,
                _handle: handle,
            },
        }
    }

    /// Start a background extraction of entry `index`
    pub(crate) fn piped(handle: CacheHandle<ArchiveHolder>, index: usize, limits: &LimitsConfig) -> io::Result<Self> {
        let (tx, rx) = sync_channel::<Chunk>(limits.stream_queue_depth.max(1));
        let cancel = Arc::new(AtomicBool::new(false));
        let chunk_size = limits.stream_chunk_size.max(1);

        let worker_cancel = Arc::clone(&cancel);
        let worker = thread::Builder::new()
            .name("archive-extract".to_string())
            .spawn(move || {
                let mut writer = ChannelWriter {
                    tx,
                    cancel: worker_cancel,
                    buf: Vec::with_capacity(chunk_size),
                    chunk_size,
                };
                let result = handle
                    .with_reader(|reader| reader.extract(index, &mut writer))
                    .and_then(|_| writer.flush().map_err(VfsError::from));
                if let Err(e) = result
                    && !writer.cancel.load(Ordering::SeqCst)
                {
                    let err = match e {
                        VfsError::Io(io) => io,
                        other => io::Error::other(other),
                    };
                    let _ = writer.tx.send(Err(err));
                }
                // Dropping the handle releases the holder
                drop(handle);
            })?;

        Ok(Self {
            state: StreamState::Piped {
                rx,
                current: Vec::new(),
                pos: 0,
                cancel,
                worker: Some(worker),
            },
        })
    }

    /// Stop reading. Interrupts a background extraction and releases the
    /// archive holder. Safe to call more than once.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, StreamState::Closed) {
            StreamState::Piped {
                rx, cancel, mut worker, ..
            } => {
                cancel.store(true, Ordering::SeqCst);
                // A producer blocked on a full queue fails its send once the
                // receiver is gone
                drop(rx);
                if let Some(worker) = worker.take()
                    && worker.join().is_err()
                {
                    log::warn!("archive extraction thread panicked");
                }
            }
            StreamState::Direct { .. } | StreamState::Closed => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed)
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            StreamState::Direct { reader, .. } => reader.read(buf),
            StreamState::Piped { rx, current, pos, .. } => {
                while *pos >= current.len() {
                    match rx.recv() {
                        Ok(Ok(chunk)) => {
                            *current = chunk;
                            *pos = 0;
                        }
                        Ok(Err(e)) => return Err(e),
                        // Producer finished
                        Err(_) => return Ok(0),
                    }
                }
                let n = buf.len().min(current.len() - *pos);
                buf[..n].copy_from_slice(&current[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            StreamState::Closed => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream is closed")),
        }
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write side of the piped stream: batches bytes into chunks
struct ChannelWriter {
    tx: SyncSender<Chunk>,
    cancel: Arc<AtomicBool>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChannelWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        self.tx
            .send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader closed"));
        }
        let room = self.chunk_size - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= self.chunk_size {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}
