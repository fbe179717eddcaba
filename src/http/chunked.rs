//! Chunked transfer decoding
//!
//! Incremental decoder for `Transfer-Encoding: chunked` request bodies. The
//! request parser feeds it whatever bytes have arrived and aggregates the
//! decoded output; the server never produces chunked responses itself.

use super::{Error, Result};

/// Chunked decoder
pub struct ChunkedDecoder {
    state: DecoderState,
    chunk_size: usize,
    chunk_read: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecoderState {
    ChunkSize,
    ChunkData,
    ChunkEnd,
    Trailer,
    Complete,
}

impl ChunkedDecoder {
    /// Create a new chunked decoder
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::ChunkSize,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    /// Decode as much of `input` as possible, appending data to `output`
    ///
    /// Returns (bytes_consumed, is_complete). Call again with more input
    /// until complete.
    pub fn decode(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<(usize, bool)> {
        let mut input_pos = 0;

        while input_pos < input.len() {
            match self.state {
                DecoderState::ChunkSize => {
                    if let Some(crlf_pos) = find_crlf(&input[input_pos..]) {
                        let line = String::from_utf8_lossy(&input[input_pos..input_pos + crlf_pos]);

                        // Chunk extensions after ';' are ignored
                        let size_str = line.split(';').next().unwrap_or("").trim();
                        self.chunk_size = usize::from_str_radix(size_str, 16)
                            .map_err(|_| Error::InvalidChunkSize(size_str.to_string()))?;

                        input_pos += crlf_pos + 2;
                        self.chunk_read = 0;

                        if self.chunk_size == 0 {
                            self.state = DecoderState::Trailer;
                        } else {
                            self.state = DecoderState::ChunkData;
                        }
                    } else {
                        break;
                    }
                }

                DecoderState::ChunkData => {
                    let remaining_in_chunk = self.chunk_size - self.chunk_read;
                    let available = input.len() - input_pos;
                    let to_copy = remaining_in_chunk.min(available);

                    output.extend_from_slice(&input[input_pos..input_pos + to_copy]);
                    input_pos += to_copy;
                    self.chunk_read += to_copy;

                    if self.chunk_read == self.chunk_size {
                        self.state = DecoderState::ChunkEnd;
                    } else {
                        break;
                    }
                }

                DecoderState::ChunkEnd => {
                    if input.len() - input_pos >= 2 {
                        if &input[input_pos..input_pos + 2] != b"\r\n" {
                            return Err(Error::Protocol("Expected CRLF after chunk".to_string()));
                        }
                        input_pos += 2;
                        self.state = DecoderState::ChunkSize;
                    } else {
                        break;
                    }
                }

                DecoderState::Trailer => {
                    if input.len() - input_pos >= 2 {
                        if &input[input_pos..input_pos + 2] == b"\r\n" {
                            input_pos += 2;
                            self.state = DecoderState::Complete;
                            return Ok((input_pos, true));
                        }
                        // Trailer header line, skip it
                        if let Some(crlf_pos) = find_crlf(&input[input_pos..]) {
                            input_pos += crlf_pos + 2;
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }

                DecoderState::Complete => {
                    return Ok((input_pos, true));
                }
            }
        }

        Ok((input_pos, self.state == DecoderState::Complete))
    }

    /// Check if decoding is complete
    pub fn is_complete(&self) -> bool {
        self.state == DecoderState::Complete
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Find CRLF in buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ChunkedDecoder::new();
        let mut output = Vec::new();
        let (consumed, complete) = decoder.decode(input, &mut output)?;
        assert_eq!(consumed, input.len());
        assert!(complete);
        Ok(output)
    }

    #[test]
    fn test_decode_single_chunk() {
        let output = decode_all(b"5\r\nHello\r\n0\r\n\r\n").unwrap();
        assert_eq!(output, b"Hello");
    }

    #[test]
    fn test_decode_multiple_chunks() {
        let output = decode_all(b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n").unwrap();
        assert_eq!(output, b"HelloWorld");
    }

    #[test]
    fn test_decode_with_extension() {
        let output = decode_all(b"5;extension=value\r\nHello\r\n0\r\n\r\n").unwrap();
        assert_eq!(output, b"Hello");
    }

    #[test]
    fn test_decode_ignores_trailer_headers() {
        let output = decode_all(b"5\r\nHello\r\n0\r\nX-Trailer: yes\r\n\r\n").unwrap();
        assert_eq!(output, b"Hello");
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut output = Vec::new();
        assert!(decoder.decode(b"zz\r\nHello", &mut output).is_err());
    }

    #[test]
    fn test_decoder_incremental() {
        // Callers keep unconsumed bytes and refeed them, the way the request
        // parser drives the decoder
        let input: &[u8] = b"5\r\nHello\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut output = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut complete = false;

        for chunk in input.chunks(3) {
            pending.extend_from_slice(chunk);
            let (consumed, done) = decoder.decode(&pending, &mut output).unwrap();
            pending.drain(..consumed);
            if done {
                complete = true;
                break;
            }
        }

        assert!(complete);
        assert_eq!(output, b"Hello");
    }
}
