//! WAV packaging for captured PCM.
//!
//! Speech recognition endpoints want a self-describing container rather than
//! bare samples, so a capture is wrapped in a RIFF/WAVE header before upload.
//! Uploaded WAV bodies are parsed back only to learn their sample rate.

use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;

/// Wrap 16-bit LE mono PCM into a WAV file image.
///
/// A trailing odd byte is ignored, matching how the resampler treats it.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> std::io::Result<Vec<u8>> {
    let samples: Vec<i16> = pcm.chunks_exact(2).map(LittleEndian::read_i16).collect();

    let header = ::wav::Header::new(::wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let track = ::wav::BitDepth::Sixteen(samples);

    let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    ::wav::write(header, &track, &mut out)?;
    Ok(out.into_inner())
}

/// Sample rate declared by a WAV file image.
pub fn wav_sample_rate(wav: &[u8]) -> std::io::Result<u32> {
    let (header, _) = ::wav::read(&mut Cursor::new(wav))?;
    Ok(header.sampling_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_describes_pcm() {
        let pcm: Vec<u8> = (0..3200u32).map(|i| (i % 251) as u8).collect();
        let wav = pcm_to_wav(&pcm, 16000).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() >= pcm.len() + 44);
        assert_eq!(&wav[wav.len() - pcm.len()..], &pcm[..]);

        let fmt = wav.windows(4).position(|w| w == b"fmt ").unwrap();
        let channels = LittleEndian::read_u16(&wav[fmt + 10..fmt + 12]);
        let rate = LittleEndian::read_u32(&wav[fmt + 12..fmt + 16]);
        assert_eq!(channels, 1);
        assert_eq!(rate, 16000);
    }

    #[test]
    fn test_wav_sample_rate() {
        let wav = pcm_to_wav(&[0u8; 640], 8000).unwrap();
        assert_eq!(wav_sample_rate(&wav).unwrap(), 8000);
        assert!(wav_sample_rate(b"definitely not a wav file").is_err());
    }
}
