//! Narrowband audio codecs negotiated by the media engine.
//!
//! All codecs operate on signed 16-bit mono PCM at 8 kHz. G.711 is
//! stateless, G.722 carries ADPCM predictor state across frames, so
//! encoding and decoding go through [`AudioEncoder`] / [`AudioDecoder`]
//! which own that state per stream.

pub mod alaw;
pub mod g722;
pub mod mulaw;

/// Static payload types supported for negotiation (RFC 3551)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// G.711 μ-law, payload type 0
    Pcmu,
    /// G.711 A-law, payload type 8
    Pcma,
    /// G.722, payload type 9
    G722,
}

impl Codec {
    /// Map a static RTP payload type to a supported codec
    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(Codec::Pcmu),
            8 => Some(Codec::Pcma),
            9 => Some(Codec::G722),
            _ => None,
        }
    }

    pub fn payload_type(self) -> u8 {
        match self {
            Codec::Pcmu => 0,
            Codec::Pcma => 8,
            Codec::G722 => 9,
        }
    }

    /// Encoded byte representing silence, used to pad the tail frame of a stream
    pub fn silence(self) -> u8 {
        match self {
            Codec::Pcmu => 255,
            Codec::Pcma => 213,
            Codec::G722 => 85,
        }
    }

    /// SDP clock rate. G.722's is 8000 by the RFC 3551 historical quirk.
    pub fn clock_rate(self) -> u32 {
        8000
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Pcmu => "PCMU",
            Codec::Pcma => "PCMA",
            Codec::G722 => "G722",
        }
    }
}

/// Stateful encoder for one outgoing stream
pub struct AudioEncoder {
    codec: Codec,
    g722: g722::Encoder,
}

impl AudioEncoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            g722: g722::Encoder::new(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Encode PCM samples, appending the wire bytes to `out`
    pub fn encode(&mut self, samples: &[i16], out: &mut Vec<u8>) {
        match self.codec {
            Codec::Pcmu => out.extend(samples.iter().map(|&s| mulaw::encode(s))),
            Codec::Pcma => out.extend(samples.iter().map(|&s| alaw::encode(s))),
            Codec::G722 => self.g722.encode(samples, out),
        }
    }
}

/// Stateful decoder for one incoming stream
pub struct AudioDecoder {
    codec: Codec,
    g722: g722::Decoder,
}

impl AudioDecoder {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            g722: g722::Decoder::new(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Decode wire bytes, appending PCM samples to `out`
    pub fn decode(&mut self, payload: &[u8], out: &mut Vec<i16>) {
        match self.codec {
            Codec::Pcmu => out.extend(payload.iter().map(|&b| mulaw::decode(b))),
            Codec::Pcma => out.extend(payload.iter().map(|&b| alaw::decode(b))),
            Codec::G722 => self.g722.decode(payload, out),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_type_mapping() {
        assert_eq!(Codec::from_payload_type(0), Some(Codec::Pcmu));
        assert_eq!(Codec::from_payload_type(8), Some(Codec::Pcma));
        assert_eq!(Codec::from_payload_type(9), Some(Codec::G722));
        assert_eq!(Codec::from_payload_type(18), None);

        assert_eq!(Codec::Pcmu.payload_type(), 0);
        assert_eq!(Codec::Pcma.payload_type(), 8);
        assert_eq!(Codec::G722.payload_type(), 9);
    }

    #[test]
    fn g711_silence_bytes_encode_zero() {
        assert_eq!(mulaw::encode(0), Codec::Pcmu.silence());
        assert_eq!(alaw::encode(0), Codec::Pcma.silence());
    }

    #[test]
    fn stateless_codecs_are_one_byte_per_sample() {
        let pcm = [0i16, 100, -100, 20000, -20000];

        for codec in [Codec::Pcmu, Codec::Pcma] {
            let mut enc = AudioEncoder::new(codec);
            let mut bytes = Vec::new();
            enc.encode(&pcm, &mut bytes);
            assert_eq!(bytes.len(), pcm.len());

            let mut dec = AudioDecoder::new(codec);
            let mut back = Vec::new();
            dec.decode(&bytes, &mut back);
            assert_eq!(back.len(), pcm.len());
        }
    }
}
