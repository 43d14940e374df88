pub mod check;
pub mod export;
pub mod poll;
pub mod probe;

use cutline_common::config::DecodeConfig;
use cutline_common::error::CutlineResult;
use cutline_decode_engine::{
    DecoderFactory, FfmpegDecoderFactory, MediaDecoder, SyntheticDecoderFactory,
};

/// Opens `synthetic://` URLs as generated sources and everything else
/// through ffmpeg.
pub struct CliDecoderFactory {
    synthetic: SyntheticDecoderFactory,
    ffmpeg: FfmpegDecoderFactory,
}

impl CliDecoderFactory {
    pub fn new(decode: &DecodeConfig) -> Self {
        Self {
            synthetic: SyntheticDecoderFactory::new(),
            ffmpeg: FfmpegDecoderFactory::new(decode.clone()),
        }
    }
}

impl DecoderFactory for CliDecoderFactory {
    fn open(&self, source_id: &str, url: &str) -> CutlineResult<Box<dyn MediaDecoder>> {
        if url.starts_with("synthetic://") {
            self.synthetic.open(source_id, url)
        } else {
            self.ffmpeg.open(source_id, url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_urls_route_to_generated_sources() {
        let factory = CliDecoderFactory::new(&DecodeConfig::default());
        assert!(factory.open("a", "synthetic://64x36@30/2").is_ok());
        // Malformed synthetic URLs must not fall through to ffmpeg.
        assert!(factory.open("b", "synthetic://nonsense").is_err());
        assert!(factory.open("c", "/media/clip.mp4").is_ok());
    }
}
