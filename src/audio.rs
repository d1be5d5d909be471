//! Duration of rendered speech, measured by decoding the file.

use std::path::Path;

use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decodes every packet of the first audio track and returns its length in seconds.
///
/// Container headers are not trusted: MP3 files from some engines carry no
/// frame count, and WAV headers written by a killed process can be stale.
pub fn measure_duration<P: AsRef<Path>>(path: P) -> Result<f64, SymphoniaError> {
    let path = path.as_ref();
    let src = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(src), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(SymphoniaError::Unsupported("no decodable audio track"))?;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut frames: u64 = 0;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(e),
        };

        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_rate == 0 {
                    sample_rate = decoded.spec().rate;
                }
                frames += decoded.frames() as u64;
            }
            // A corrupt packet costs its own length, not the whole clip.
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    if sample_rate == 0 {
        return Err(SymphoniaError::Unsupported("unknown sample rate"));
    }
    Ok(frames as f64 / sample_rate as f64)
}
