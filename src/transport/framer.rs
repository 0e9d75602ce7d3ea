use bytes::{Bytes, BytesMut};

const LENGTH_PREFIX_SIZE: usize = 4;

/// Cluster peers are trusted, but a corrupted length prefix must not make us allocate gigabytes.
pub(crate) const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame declares {0} bytes, which exceeds the limit of {} bytes", MAX_FRAME_LENGTH)]
    FrameTooLarge(usize),
}

/// Framer reassembles length-prefixed frames out of one direction of an arbitrarily chunked byte
/// stream. It is stateful, so each connection needs its own instance.
///
/// Byte representation, repeated back-to-back:
///
/// ```text
/// | 0 | 1 | 2 | 3 | 4 | ...                  |
/// +---+---+---+---+---+---------------------...
/// | Length (u32 LE)|  Payload (Length bytes) ...
/// +---------------+------------------------...
/// ```
#[derive(Default)]
pub struct Framer {
    // A length prefix can be split across chunks, so we accumulate it here.
    length_prefix: [u8; LENGTH_PREFIX_SIZE],
    length_prefix_filled: usize,
    // Present once the whole length prefix has been read.
    partial_payload: Option<PartialPayload>,
}

struct PartialPayload {
    expected_len: usize,
    buffer: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Framer::default()
    }

    /// `feed()` consumes a chunk of newly received bytes and calls `on_frame` once for every
    /// payload that becomes complete, in order, before returning.
    ///
    /// On error the framer has already been reset and the connection should be dropped.
    pub fn feed<F>(&mut self, mut chunk: &[u8], mut on_frame: F) -> Result<(), FramingError>
    where
        F: FnMut(Bytes),
    {
        while !chunk.is_empty() {
            let consumed = match self.partial_payload.as_mut() {
                None => {
                    let needed = LENGTH_PREFIX_SIZE - self.length_prefix_filled;
                    let n = needed.min(chunk.len());
                    self.length_prefix[self.length_prefix_filled..self.length_prefix_filled + n]
                        .copy_from_slice(&chunk[..n]);
                    self.length_prefix_filled += n;

                    if self.length_prefix_filled == LENGTH_PREFIX_SIZE {
                        let expected_len = u32::from_le_bytes(self.length_prefix) as usize;
                        self.length_prefix_filled = 0;

                        if expected_len > MAX_FRAME_LENGTH {
                            self.reset();
                            return Err(FramingError::FrameTooLarge(expected_len));
                        }

                        if expected_len == 0 {
                            on_frame(Bytes::new());
                        } else {
                            self.partial_payload.replace(PartialPayload {
                                expected_len,
                                buffer: BytesMut::with_capacity(expected_len),
                            });
                        }
                    }

                    n
                }
                Some(partial) => {
                    let needed = partial.expected_len - partial.buffer.len();
                    let n = needed.min(chunk.len());
                    partial.buffer.extend_from_slice(&chunk[..n]);

                    if partial.buffer.len() == partial.expected_len {
                        if let Some(complete) = self.partial_payload.take() {
                            on_frame(complete.buffer.freeze());
                        }
                    }

                    n
                }
            };

            chunk = &chunk[consumed..];
        }

        Ok(())
    }

    /// Discard any partially received frame without emitting it.
    pub fn reset(&mut self) {
        self.length_prefix_filled = 0;
        self.partial_payload = None;
    }

    #[cfg(test)]
    fn has_partial_frame(&self) -> bool {
        self.length_prefix_filled > 0 || self.partial_payload.is_some()
    }
}

/// `frame()` prepends the length prefix and returns the wire-ready buffer.
pub fn frame(payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_FRAME_LENGTH);

    let mut buffer = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(payload);
    buffer.freeze()
}
