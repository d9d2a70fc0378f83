//! Incremental netstring framing (`LEN ":" BODY ","`) used on all worker pipes.

use thiserror::Error;

/// Maximum frame body accepted on any pipe (4 MiB).
pub(crate) const NS_PAYLOAD_MAX_LEN: usize = 4_194_304;
/// Maximum total frame length: body plus length digits, colon and trailing comma.
pub(crate) const NS_MESSAGE_MAX_LEN: usize = NS_PAYLOAD_MAX_LEN + 9;

// "4194304".len()
const NS_LENGTH_MAX_DIGITS: usize = 7;

/// Frame decode error; any of these makes the accumulated buffer unrecoverable, so the decoder
/// resets itself before returning.
#[derive(Debug, Error, Eq, PartialEq)]
pub(crate) enum DecodeError {
    #[error("frame body length exceeds {NS_PAYLOAD_MAX_LEN} bytes")]
    TooLong,
    #[error("no colon found after length digits")]
    NoColon,
    #[error("no comma found after frame body")]
    NoComma,
    #[error("length has a leading zero")]
    LeadingZero,
    #[error("frame starts without length digits")]
    NoLength,
}

/// Append one framed payload to `buffer`.
pub(crate) fn encode_into(buffer: &mut Vec<u8>, payload: &[u8]) {
    buffer.extend_from_slice(payload.len().to_string().as_bytes());
    buffer.push(b':');
    buffer.extend_from_slice(payload);
    buffer.push(b',');
}

/// Incremental netstring parser: bytes are fed in arbitrary chunks and complete frames are
/// pulled out as they become available. A partial frame stays buffered until subsequent chunks
/// complete it.
#[derive(Default)]
pub(crate) struct Decoder {
    buffer: Vec<u8>,
}

impl Decoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract the next complete frame body, `Ok(None)` if more bytes are needed.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        match self.parse() {
            Ok(parsed) => Ok(parsed),
            Err(error) => {
                self.buffer.clear();
                Err(error)
            }
        }
    }

    fn parse(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let digits_end = self
            .buffer
            .iter()
            .position(|byte| !byte.is_ascii_digit())
            .unwrap_or(self.buffer.len());

        if digits_end == 0 {
            return Err(DecodeError::NoLength);
        }
        if digits_end > NS_LENGTH_MAX_DIGITS {
            return Err(DecodeError::TooLong);
        }
        if self.buffer[0] == b'0' && digits_end > 1 {
            return Err(DecodeError::LeadingZero);
        }

        match self.buffer.get(digits_end) {
            // Length digits not terminated yet.
            None => return Ok(None),
            Some(b':') => {}
            Some(_) => return Err(DecodeError::NoColon),
        }

        // The digits cannot overflow usize given the digit cap above.
        let length = std::str::from_utf8(&self.buffer[..digits_end])
            .unwrap()
            .parse::<usize>()
            .unwrap();

        if length > NS_PAYLOAD_MAX_LEN {
            return Err(DecodeError::TooLong);
        }

        let body_start = digits_end + 1;
        let frame_end = body_start + length + 1;

        if self.buffer.len() < frame_end {
            return Ok(None);
        }

        if self.buffer[frame_end - 1] != b',' {
            return Err(DecodeError::NoComma);
        }

        let body = self.buffer[body_start..frame_end - 1].to_vec();
        self.buffer.drain(..frame_end);

        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(payload: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::new();
        encode_into(&mut buffer, payload);
        buffer
    }

    #[test]
    fn encode_decode_round_trip() {
        for payload in [&b""[..], &b"x"[..], &b"hello world"[..], &[0xff_u8; 1000][..]] {
            let mut decoder = Decoder::new();
            decoder.feed(&encode(payload));
            assert_eq!(decoder.next_frame(), Ok(Some(payload.to_vec())));
            assert_eq!(decoder.next_frame(), Ok(None));
        }
    }

    #[test]
    fn partial_input_completes_on_append() {
        let encoded = encode(b"partial frame body");
        let mut decoder = Decoder::new();

        // Any prefix leaves the decoder in a "short" state that completes on append.
        for split in 0..encoded.len() {
            let mut decoder_at_split = Decoder::new();
            decoder_at_split.feed(&encoded[..split]);
            assert_eq!(decoder_at_split.next_frame(), Ok(None));
            decoder_at_split.feed(&encoded[split..]);
            assert_eq!(
                decoder_at_split.next_frame(),
                Ok(Some(b"partial frame body".to_vec())),
            );
        }

        // Byte by byte.
        for byte in &encoded {
            decoder.feed(std::slice::from_ref(byte));
        }
        assert_eq!(decoder.next_frame(), Ok(Some(b"partial frame body".to_vec())));
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut bytes = Vec::new();
        encode_into(&mut bytes, b"first");
        encode_into(&mut bytes, b"second");

        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        assert_eq!(decoder.next_frame(), Ok(Some(b"first".to_vec())));
        assert_eq!(decoder.next_frame(), Ok(Some(b"second".to_vec())));
        assert_eq!(decoder.next_frame(), Ok(None));
    }

    #[test]
    fn decode_errors() {
        let mut decoder = Decoder::new();
        decoder.feed(b":payload,");
        assert_eq!(decoder.next_frame(), Err(DecodeError::NoLength));

        decoder.feed(b"05:hello,");
        assert_eq!(decoder.next_frame(), Err(DecodeError::LeadingZero));

        decoder.feed(b"5x:hello,");
        assert_eq!(decoder.next_frame(), Err(DecodeError::NoColon));

        decoder.feed(b"5:hello;");
        assert_eq!(decoder.next_frame(), Err(DecodeError::NoComma));

        decoder.feed(b"99999999:");
        assert_eq!(decoder.next_frame(), Err(DecodeError::TooLong));

        // An error resets the buffer; the decoder accepts fresh frames afterwards.
        decoder.feed(b"2:ok,");
        assert_eq!(decoder.next_frame(), Ok(Some(b"ok".to_vec())));
    }

    #[test]
    fn zero_length_frame() {
        let mut decoder = Decoder::new();
        decoder.feed(b"0:,");
        assert_eq!(decoder.next_frame(), Ok(Some(Vec::new())));
    }
}
