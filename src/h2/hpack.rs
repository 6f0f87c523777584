//! A thin wrapper around the external `hpack` crate's encoder/decoder,
//! scoped to what the connection needs: one encoder and one decoder per
//! connection, never shared across connections (spec §5).

use crate::error::Error;

pub struct HpackContext {
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
}

impl HpackContext {
    pub fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    pub fn encode(&mut self, headers: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
        self.encoder
            .encode(headers.iter().map(|(n, v)| (n.as_slice(), v.as_slice())))
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        self.decoder
            .decode(data)
            .map_err(|e| Error::protocol("hpack", format!("HPACK decode failed: {e:?}")))
    }
}

impl Default for HpackContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips_headers() {
        let mut ctx = HpackContext::new();
        let headers = vec![
            (b":method".to_vec(), b"GET".to_vec()),
            (b":path".to_vec(), b"/".to_vec()),
        ];
        let encoded = ctx.encode(&headers);
        let decoded = ctx.decode(&encoded).unwrap();
        assert_eq!(decoded, headers);
    }
}
