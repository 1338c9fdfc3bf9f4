//! Pure conversion of base64 PCM fragments into a playable WAV buffer.

use base64::Engine;

const HEADER_LEN: usize = 44;

#[derive(Debug, thiserror::Error)]
pub enum WavError {
    #[error("mime type `{0}` does not carry a sample rate")]
    MissingRate(String),
    #[error("audio fragment is not valid base64: {0}")]
    InvalidData(#[from] base64::DecodeError),
}

/// Header parameters derived from a MIME descriptor. Mono is fixed; the
/// model emits single-channel PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavOptions {
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

/// Parses a descriptor of the form `audio/L<bits>;rate=<sampleRate>`.
///
/// A missing `L<bits>` subtype defaults to 16-bit samples. A missing rate is
/// an error; guessing one would silently produce a header that plays at the
/// wrong speed.
pub fn parse_mime(mime: &str) -> Result<WavOptions, WavError> {
    let mut params = mime.split(';').map(str::trim);
    let file_type = params.next().unwrap_or_default();

    let mut bits_per_sample = 16u16;
    if let Some(format) = file_type.split('/').nth(1)
        && let Some(rest) = format.strip_prefix('L')
        && let Ok(bits) = rest.parse()
    {
        bits_per_sample = bits;
    }

    let mut sample_rate = None;
    for param in params {
        if let Some((key, value)) = param.split_once('=')
            && key.trim() == "rate"
        {
            sample_rate = value.trim().parse().ok();
        }
    }

    let sample_rate = sample_rate.ok_or_else(|| WavError::MissingRate(mime.to_string()))?;
    Ok(WavOptions {
        num_channels: 1,
        sample_rate,
        bits_per_sample,
    })
}

/// Concatenates decoded PCM fragments behind a canonical 44-byte RIFF/WAVE
/// header. Fragments are decoded before their lengths are summed; the data
/// chunk size counts raw bytes, not base64 characters.
pub fn encode_wav<S: AsRef<str>>(fragments: &[S], mime: &str) -> Result<Vec<u8>, WavError> {
    let options = parse_mime(mime)?;

    let mut pcm = Vec::new();
    for fragment in fragments {
        let decoded = base64::engine::general_purpose::STANDARD.decode(fragment.as_ref())?;
        pcm.extend_from_slice(&decoded);
    }

    let mut buffer = Vec::with_capacity(HEADER_LEN + pcm.len());
    write_header(&mut buffer, pcm.len() as u32, &options);
    buffer.extend_from_slice(&pcm);
    Ok(buffer)
}

fn write_header(buffer: &mut Vec<u8>, data_length: u32, options: &WavOptions) {
    let WavOptions {
        num_channels,
        sample_rate,
        bits_per_sample,
    } = *options;
    let byte_rate = sample_rate * u32::from(num_channels) * u32::from(bits_per_sample) / 8;
    let block_align = num_channels * bits_per_sample / 8;

    buffer.extend_from_slice(b"RIFF");
    buffer.extend_from_slice(&(36 + data_length).to_le_bytes());
    buffer.extend_from_slice(b"WAVE");
    buffer.extend_from_slice(b"fmt ");
    buffer.extend_from_slice(&16u32.to_le_bytes()); // PCM subchunk size
    buffer.extend_from_slice(&1u16.to_le_bytes()); // format code 1 = PCM
    buffer.extend_from_slice(&num_channels.to_le_bytes());
    buffer.extend_from_slice(&sample_rate.to_le_bytes());
    buffer.extend_from_slice(&byte_rate.to_le_bytes());
    buffer.extend_from_slice(&block_align.to_le_bytes());
    buffer.extend_from_slice(&bits_per_sample.to_le_bytes());
    buffer.extend_from_slice(b"data");
    buffer.extend_from_slice(&data_length.to_le_bytes());
}
