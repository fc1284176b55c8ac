use crate::error::FetchError;

/// Incremental UTF-8 decoding of a chunked body
///
/// A multi-byte character split across two chunks is held back until the
/// rest of it arrives.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `chunk` (plus any carried bytes) as is complete
    pub fn push(&mut self, chunk: &[u8]) -> Result<String, FetchError> {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(err) => {
                return Err(FetchError::Decode(format!(
                    "invalid UTF-8 at byte {}",
                    err.valid_up_to()
                )));
            }
        };
        let complete: Vec<u8> = self.pending.drain(..valid).collect();
        String::from_utf8(complete).map_err(|err| FetchError::Decode(err.to_string()))
    }

    /// Fails if the body ended inside a character
    pub fn finish(&mut self) -> Result<(), FetchError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let dangling = self.pending.len();
        self.pending.clear();
        Err(FetchError::Decode(format!(
            "stream ended inside a multi-byte sequence ({dangling} bytes)"
        )))
    }
}
