//! Pipe reader tasks.
//!
//! The reader owns the child's stdout and forwards what it reads over a
//! bounded channel, so the coordinating task can wait on reads and
//! cancellation at the same time. The channel closing means end of output.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_BUFFER: usize = 1024;
const CHANNEL_CAPACITY: usize = 8;

/// One unit of reader output.
#[derive(Debug)]
pub enum ReadEvent {
    Chunk(Vec<u8>),
    Line(String),
    Failed(std::io::Error),
}

/// Forward raw chunks of up to 1 KiB as they arrive.
pub fn spawn_chunk_reader<R>(mut pipe: R) -> (mpsc::Receiver<ReadEvent>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => return,
                Ok(n) => {
                    if tx.send(ReadEvent::Chunk(buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReadEvent::Failed(e)).await;
                    return;
                }
            }
        }
    });
    (rx, handle)
}

/// Forward newline-delimited lines without their terminator.
pub fn spawn_line_reader<R>(pipe: R) -> (mpsc::Receiver<ReadEvent>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => return,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(ReadEvent::Line(line)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReadEvent::Failed(e)).await;
                    return;
                }
            }
        }
    });
    (rx, handle)
}
