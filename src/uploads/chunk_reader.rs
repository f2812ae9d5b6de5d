use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

/// Regroups an inbound byte stream into chunks of exactly `chunk_size`
/// bytes. Only the final chunk may be shorter, and it is never empty.
pub struct ChunkReader<S> {
    source: S,
    chunk_size: usize,
    buffer: BytesMut,
    exhausted: bool,
}

impl<S, E> ChunkReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    pub fn new(source: S, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            buffer: BytesMut::new(),
            exhausted: false,
        }
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, E> {
        loop {
            if self.buffer.len() >= self.chunk_size {
                return Ok(Some(self.buffer.split_to(self.chunk_size).freeze()));
            }
            if self.exhausted {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buffer.split().freeze()));
            }
            match self.source.next().await {
                Some(Ok(bytes)) => {
                    if self.buffer.is_empty() && bytes.len() == self.chunk_size {
                        return Ok(Some(bytes));
                    }
                    self.buffer.extend_from_slice(&bytes);
                }
                Some(Err(e)) => return Err(e),
                None => self.exhausted = true,
            }
        }
    }
}
