use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8192;

/// Combined stdout/stderr of one process.
///
/// With a non-zero cap only the most recent `cap` bytes are kept and the
/// rendered text starts with a truncation marker.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Captured>>,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    cap: usize,
    dropped: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Captured {
                cap,
                ..Captured::default()
            })),
        }
    }

    pub fn append(&self, chunk: &[u8]) {
        let mut captured = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        captured.bytes.extend_from_slice(chunk);
        let cap = captured.cap;
        if cap > 0 && captured.bytes.len() > cap {
            let excess = captured.bytes.len() - cap;
            captured.bytes.drain(..excess);
            captured.dropped += excess;
        }
    }

    /// Copy everything `reader` yields into the buffer until EOF.
    pub fn capture<R>(&self, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.append(&chunk[..n]),
                    Err(e) => {
                        tracing::debug!("output reader stopped: {e}");
                        break;
                    }
                }
            }
        })
    }

    pub fn dropped(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .dropped
    }

    pub fn text(&self) -> String {
        let captured = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let body = String::from_utf8_lossy(&captured.bytes);
        if captured.dropped == 0 {
            body.into_owned()
        } else {
            format!(
                "... [output truncated: {} earlier bytes dropped]\n{body}",
                captured.dropped
            )
        }
    }
}
