//! ISO-BMFF (MP4) muxer.
//!
//! Two writing strategies, both producing a file that plays on its own:
//!
//! - **Buffered:** chunk payloads are collected in memory; `finalize` writes
//!   `ftyp`, a `moov` with complete sample tables, then one `mdat`.
//! - **Fragmented:** an init segment (`ftyp` + `moov` with `mvex`) is written
//!   up front, then `moof`/`mdat` pairs as chunks arrive. A fragment is cut
//!   at the first video key chunk after at least one second of video.
//!
//! Output goes to `<output>.partial` and is renamed into place by
//! [`Mp4Muxer::finalize`]. Dropping an unfinished muxer deletes the partial
//! file, so a failed or cancelled export leaves nothing behind.
//!
//! Decode timestamps come from chunk timestamps in microseconds. Encoders
//! here never reorder frames, so composition time equals decode time.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use cutline_common::config::MuxMode;
use cutline_common::error::{CutlineError, CutlineResult};

use crate::encoder::{AudioEncoderConfig, EncodedChunk, VideoEncoderConfig, CODEC_MJPEG, CODEC_PCM_S16};

pub const MOVIE_TIMESCALE: u32 = 1_000;
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// Seconds between 1904-01-01 and the Unix epoch.
const MP4_EPOCH_OFFSET: i64 = 2_082_844_800;

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

const TFHD_DEFAULT_DURATION: u32 = 0x00_0008;
const TFHD_DEFAULT_SIZE: u32 = 0x00_0010;
const TFHD_DEFAULT_FLAGS: u32 = 0x00_0020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;

const TRUN_DATA_OFFSET: u32 = 0x00_0001;
const TRUN_SAMPLE_DURATION: u32 = 0x00_0100;
const TRUN_SAMPLE_SIZE: u32 = 0x00_0200;
const TRUN_SAMPLE_FLAGS: u32 = 0x00_0400;

/// MPEG-4 object type for JPEG stills.
const OBJECT_TYPE_JPEG: u8 = 0x6C;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Mjpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// Signed 16-bit little-endian PCM.
    PcmS16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTrackConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
}

impl VideoTrackConfig {
    pub fn from_encoder(config: &VideoEncoderConfig) -> CutlineResult<Self> {
        let codec = match config.codec.to_ascii_lowercase().as_str() {
            CODEC_MJPEG | "jpeg" => VideoCodec::Mjpeg,
            other => return Err(CutlineError::unsupported(format!("No MP4 mapping for video codec {other}"))),
        };
        Ok(Self {
            codec,
            width: config.width,
            height: config.height,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTrackConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioTrackConfig {
    pub fn from_encoder(config: &AudioEncoderConfig) -> CutlineResult<Self> {
        let codec = match config.codec.to_ascii_lowercase().as_str() {
            CODEC_PCM_S16 | "sowt" => AudioCodec::PcmS16,
            other => return Err(CutlineError::unsupported(format!("No MP4 mapping for audio codec {other}"))),
        };
        Ok(Self {
            codec,
            sample_rate: config.sample_rate,
            channels: config.channels,
        })
    }

    fn bytes_per_frame(&self) -> u32 {
        match self.codec {
            AudioCodec::PcmS16 => 2 * self.channels.max(1) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TrackMedia {
    Video(VideoTrackConfig),
    Audio(AudioTrackConfig),
}

/// One appended chunk: a video frame, or a run of PCM frames.
#[derive(Debug, Clone, Copy)]
struct ChunkEntry {
    /// Offset of the payload in the mdat body (buffered) or in the pending
    /// fragment data (fragmented).
    offset: u64,
    size: u32,
    samples: u32,
    dts: u64,
    duration: u64,
    is_key: bool,
}

#[derive(Debug)]
struct Track {
    id: u32,
    media: TrackMedia,
    timescale: u32,
    entries: Vec<ChunkEntry>,
    pending_data: Vec<u8>,
    next_dts: u64,
    last_dts: Option<u64>,
    total_duration: u64,
}

impl Track {
    fn new(id: u32, media: TrackMedia) -> Self {
        let timescale = match media {
            TrackMedia::Video(_) => VIDEO_TIMESCALE,
            TrackMedia::Audio(config) => config.sample_rate.max(1),
        };
        Self {
            id,
            media,
            timescale,
            entries: Vec::new(),
            pending_data: Vec::new(),
            next_dts: 0,
            last_dts: None,
            total_duration: 0,
        }
    }

    fn is_video(&self) -> bool {
        matches!(self.media, TrackMedia::Video(_))
    }

    /// Fixed per-sample size for PCM tracks.
    fn constant_sample_size(&self) -> Option<u32> {
        match self.media {
            TrackMedia::Audio(config) => Some(config.bytes_per_frame()),
            TrackMedia::Video(_) => None,
        }
    }

    fn sample_count(&self) -> u64 {
        self.entries.iter().map(|entry| entry.samples as u64).sum()
    }

    fn pending_duration(&self) -> u64 {
        self.entries.iter().map(|entry| entry.duration).sum()
    }

    /// Replace provisional video durations with timestamp deltas.
    fn settle_durations(&mut self) {
        if self.is_video() {
            for i in 1..self.entries.len() {
                let delta = self.entries[i].dts - self.entries[i - 1].dts;
                self.entries[i - 1].duration = delta.max(1);
            }
        }
        self.total_duration = self
            .entries
            .last()
            .map(|entry| entry.dts + entry.duration)
            .unwrap_or(0);
    }
}

fn to_ticks(us: i64, timescale: u32) -> u64 {
    ((us.max(0) as u128 * timescale as u128 + 500_000) / 1_000_000) as u64
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

trait Put {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
    fn put_u64(&mut self, value: u64);
    fn put_zeros(&mut self, count: usize);
}

impl Put for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_zeros(&mut self, count: usize) {
        self.resize(self.len() + count, 0);
    }
}

fn write_box(out: &mut Vec<u8>, kind: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.put_u32(0);
    out.extend_from_slice(kind);
    body(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(out: &mut Vec<u8>, kind: &[u8; 4], version: u8, flags: u32, body: impl FnOnce(&mut Vec<u8>)) {
    write_box(out, kind, |out| {
        out.put_u8(version);
        out.extend_from_slice(&flags.to_be_bytes()[1..]);
        body(out);
    });
}

/// `mdat` header for a body of `len` bytes.
fn mdat_header(len: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    if len + 8 > u32::MAX as u64 {
        out.put_u32(1);
        out.extend_from_slice(b"mdat");
        out.put_u64(len + 16);
    } else {
        out.put_u32((len + 8) as u32);
        out.extend_from_slice(b"mdat");
    }
    out
}

fn ftyp(fragmented: bool) -> Vec<u8> {
    let mut out = Vec::new();
    write_box(&mut out, b"ftyp", |out| {
        if fragmented {
            out.extend_from_slice(b"iso5");
            out.put_u32(512);
            out.extend_from_slice(b"iso5iso6mp41");
        } else {
            out.extend_from_slice(b"isom");
            out.put_u32(512);
            out.extend_from_slice(b"isomiso2mp41");
        }
    });
    out
}

/// ES descriptor carrying only an object type.
fn write_esds(out: &mut Vec<u8>, object_type: u8, stream_type: u8) {
    write_full_box(out, b"esds", 0, 0, |out| {
        out.put_u8(0x03);
        out.put_u8(21);
        out.put_u16(0);
        out.put_u8(0);
        out.put_u8(0x04);
        out.put_u8(13);
        out.put_u8(object_type);
        out.put_u8((stream_type << 2) | 1);
        out.put_zeros(3);
        out.put_u32(0);
        out.put_u32(0);
        out.put_u8(0x06);
        out.put_u8(1);
        out.put_u8(0x02);
    });
}

/// Writes ISO-BMFF from encoded chunks.
pub struct Mp4Muxer {
    mode: MuxMode,
    output: PathBuf,
    temp: PathBuf,
    writer: Option<BufWriter<File>>,
    tracks: Vec<Track>,
    video: Option<usize>,
    audio: Option<usize>,
    /// mdat body in buffered mode.
    payload: Vec<u8>,
    sequence: u32,
    bytes_written: u64,
    creation_time: u32,
    finalized: bool,
}

impl Mp4Muxer {
    /// Open `<output>.partial` and, in fragmented mode, write the init
    /// segment.
    pub fn create(
        output: &Path,
        mode: MuxMode,
        video: Option<VideoTrackConfig>,
        audio: Option<AudioTrackConfig>,
    ) -> CutlineResult<Self> {
        if video.is_none() && audio.is_none() {
            return Err(CutlineError::mux("Nothing to mux: no tracks configured"));
        }
        let mut name = output
            .file_name()
            .ok_or_else(|| CutlineError::mux(format!("Invalid output path {}", output.display())))?
            .to_os_string();
        name.push(".partial");
        let temp = output.with_file_name(name);

        let mut tracks = Vec::new();
        let mut video_index = None;
        let mut audio_index = None;
        if let Some(config) = video {
            video_index = Some(tracks.len());
            tracks.push(Track::new(tracks.len() as u32 + 1, TrackMedia::Video(config)));
        }
        if let Some(config) = audio {
            audio_index = Some(tracks.len());
            tracks.push(Track::new(tracks.len() as u32 + 1, TrackMedia::Audio(config)));
        }

        let writer = BufWriter::new(File::create(&temp)?);
        let creation_time = clamp_u32((chrono::Utc::now().timestamp() + MP4_EPOCH_OFFSET).max(0) as u64);
        let mut muxer = Self {
            mode,
            output: output.to_path_buf(),
            temp,
            writer: Some(writer),
            tracks,
            video: video_index,
            audio: audio_index,
            payload: Vec::new(),
            sequence: 0,
            bytes_written: 0,
            creation_time,
            finalized: false,
        };

        if mode == MuxMode::Fragmented {
            let mut init = ftyp(true);
            init.extend(muxer.moov(0, false, true));
            muxer.write(&init)?;
        }
        debug!(
            path = %muxer.temp.display(),
            mode = ?mode,
            tracks = muxer.tracks.len(),
            "Muxer opened"
        );
        Ok(muxer)
    }

    pub fn mode(&self) -> MuxMode {
        self.mode
    }

    /// Path of the in-progress file.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn add_video_chunk(&mut self, chunk: &EncodedChunk) -> CutlineResult<()> {
        let index = self
            .video
            .ok_or_else(|| CutlineError::mux("No video track configured"))?;
        self.add_chunk(index, chunk)
    }

    pub fn add_audio_chunk(&mut self, chunk: &EncodedChunk) -> CutlineResult<()> {
        let index = self
            .audio
            .ok_or_else(|| CutlineError::mux("No audio track configured"))?;
        self.add_chunk(index, chunk)
    }

    fn add_chunk(&mut self, index: usize, chunk: &EncodedChunk) -> CutlineResult<()> {
        if self.finalized {
            return Err(CutlineError::mux("Muxer already finalized"));
        }
        if chunk.data.is_empty() {
            return Ok(());
        }
        let size = u32::try_from(chunk.data.len())
            .map_err(|_| CutlineError::mux("Chunk larger than 4 GiB"))?;

        if self.mode == MuxMode::Fragmented && self.fragment_due(index, chunk) {
            self.write_fragment()?;
        }

        let track = &mut self.tracks[index];
        let (samples, dts, duration) = match track.media {
            TrackMedia::Video(_) => {
                let mut dts = to_ticks(chunk.timestamp_us, track.timescale);
                if let Some(last) = track.last_dts {
                    if dts <= last {
                        warn!(track = track.id, dts, last, "Non-increasing video timestamp, nudging");
                        dts = last + 1;
                    }
                }
                let duration = to_ticks(chunk.duration_us, track.timescale).max(1);
                (1, dts, duration)
            }
            TrackMedia::Audio(config) => {
                let frame_size = config.bytes_per_frame();
                if size % frame_size != 0 {
                    return Err(CutlineError::mux(format!(
                        "Audio chunk of {size} bytes is not a whole number of {frame_size}-byte frames"
                    )));
                }
                let frames = size / frame_size;
                // PCM is laid out back to back from time zero.
                (frames, track.next_dts, frames as u64)
            }
        };

        let offset = match self.mode {
            MuxMode::Buffered => {
                let offset = self.payload.len() as u64;
                self.payload.extend_from_slice(&chunk.data);
                offset
            }
            MuxMode::Fragmented => {
                let offset = track.pending_data.len() as u64;
                track.pending_data.extend_from_slice(&chunk.data);
                offset
            }
        };
        track.entries.push(ChunkEntry {
            offset,
            size,
            samples,
            dts,
            duration,
            is_key: chunk.is_key,
        });
        track.last_dts = Some(dts);
        track.next_dts = dts + duration;
        track.total_duration = track.next_dts;
        Ok(())
    }

    /// Whether pending samples should be written before `chunk` is added.
    fn fragment_due(&self, index: usize, chunk: &EncodedChunk) -> bool {
        let track = &self.tracks[index];
        match self.video {
            Some(video) if video == index => {
                chunk.is_key && !track.entries.is_empty() && track.pending_duration() >= track.timescale as u64
            }
            Some(_) => false,
            None => track.pending_duration() >= track.timescale as u64,
        }
    }

    fn write(&mut self, bytes: &[u8]) -> CutlineResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CutlineError::mux("Muxer output closed"))?;
        writer.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn movie_duration(&self) -> u64 {
        self.tracks
            .iter()
            .map(|track| track.total_duration * MOVIE_TIMESCALE as u64 / track.timescale as u64)
            .max()
            .unwrap_or(0)
    }

    fn moov(&self, base: u64, large: bool, fragmented: bool) -> Vec<u8> {
        let mut out = Vec::new();
        write_box(&mut out, b"moov", |out| {
            let duration = if fragmented { 0 } else { clamp_u32(self.movie_duration()) };
            write_full_box(out, b"mvhd", 0, 0, |out| {
                out.put_u32(self.creation_time);
                out.put_u32(self.creation_time);
                out.put_u32(MOVIE_TIMESCALE);
                out.put_u32(duration);
                out.put_u32(0x0001_0000);
                out.put_u16(0x0100);
                out.put_zeros(10);
                for value in UNITY_MATRIX {
                    out.put_u32(value);
                }
                out.put_zeros(24);
                out.put_u32(self.tracks.len() as u32 + 1);
            });
            for track in &self.tracks {
                self.write_trak(out, track, base, large, fragmented);
            }
            if fragmented {
                write_box(out, b"mvex", |out| {
                    for track in &self.tracks {
                        write_full_box(out, b"trex", 0, 0, |out| {
                            out.put_u32(track.id);
                            out.put_u32(1);
                            out.put_u32(0);
                            out.put_u32(0);
                            out.put_u32(0);
                        });
                    }
                });
            }
        });
        out
    }

    fn write_trak(&self, out: &mut Vec<u8>, track: &Track, base: u64, large: bool, fragmented: bool) {
        let media_duration = if fragmented { 0 } else { track.total_duration };
        let movie_duration = media_duration * MOVIE_TIMESCALE as u64 / track.timescale as u64;
        write_box(out, b"trak", |out| {
            write_full_box(out, b"tkhd", 0, 0x3, |out| {
                out.put_u32(self.creation_time);
                out.put_u32(self.creation_time);
                out.put_u32(track.id);
                out.put_u32(0);
                out.put_u32(clamp_u32(movie_duration));
                out.put_zeros(8);
                out.put_u16(0);
                out.put_u16(0);
                out.put_u16(if track.is_video() { 0 } else { 0x0100 });
                out.put_u16(0);
                for value in UNITY_MATRIX {
                    out.put_u32(value);
                }
                let (width, height) = match track.media {
                    TrackMedia::Video(config) => (config.width, config.height),
                    TrackMedia::Audio(_) => (0, 0),
                };
                out.put_u32(width << 16);
                out.put_u32(height << 16);
            });
            write_box(out, b"mdia", |out| {
                write_full_box(out, b"mdhd", 0, 0, |out| {
                    out.put_u32(self.creation_time);
                    out.put_u32(self.creation_time);
                    out.put_u32(track.timescale);
                    out.put_u32(clamp_u32(media_duration));
                    // ISO-639-2 "und"
                    out.put_u16(0x55C4);
                    out.put_u16(0);
                });
                write_full_box(out, b"hdlr", 0, 0, |out| {
                    out.put_u32(0);
                    let (handler, name): (&[u8; 4], &[u8]) = if track.is_video() {
                        (b"vide", b"VideoHandler\0")
                    } else {
                        (b"soun", b"SoundHandler\0")
                    };
                    out.extend_from_slice(handler);
                    out.put_zeros(12);
                    out.extend_from_slice(name);
                });
                write_box(out, b"minf", |out| {
                    if track.is_video() {
                        write_full_box(out, b"vmhd", 0, 1, |out| out.put_zeros(8));
                    } else {
                        write_full_box(out, b"smhd", 0, 0, |out| out.put_zeros(4));
                    }
                    write_box(out, b"dinf", |out| {
                        write_full_box(out, b"dref", 0, 0, |out| {
                            out.put_u32(1);
                            write_full_box(out, b"url ", 0, 1, |_| {});
                        });
                    });
                    write_box(out, b"stbl", |out| {
                        write_stsd(out, track);
                        if fragmented {
                            write_empty_tables(out);
                        } else {
                            write_sample_tables(out, track, base, large);
                        }
                    });
                });
            });
        });
    }

    fn moof(&self, starts: &[(usize, u64)], data_base: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_box(&mut out, b"moof", |out| {
            write_full_box(out, b"mfhd", 0, 0, |out| out.put_u32(self.sequence));
            for &(index, start) in starts {
                let track = &self.tracks[index];
                let Some(first) = track.entries.first() else {
                    continue;
                };
                let data_offset = (data_base + start) as u32;
                write_box(out, b"traf", |out| match track.constant_sample_size() {
                    Some(sample_size) => {
                        let flags = TFHD_DEFAULT_BASE_IS_MOOF
                            | TFHD_DEFAULT_DURATION
                            | TFHD_DEFAULT_SIZE
                            | TFHD_DEFAULT_FLAGS;
                        write_full_box(out, b"tfhd", 0, flags, |out| {
                            out.put_u32(track.id);
                            out.put_u32(1);
                            out.put_u32(sample_size);
                            out.put_u32(SAMPLE_FLAGS_SYNC);
                        });
                        write_full_box(out, b"tfdt", 1, 0, |out| out.put_u64(first.dts));
                        write_full_box(out, b"trun", 0, TRUN_DATA_OFFSET, |out| {
                            out.put_u32(clamp_u32(track.sample_count()));
                            out.put_u32(data_offset);
                        });
                    }
                    None => {
                        write_full_box(out, b"tfhd", 0, TFHD_DEFAULT_BASE_IS_MOOF, |out| {
                            out.put_u32(track.id);
                        });
                        write_full_box(out, b"tfdt", 1, 0, |out| out.put_u64(first.dts));
                        let flags =
                            TRUN_DATA_OFFSET | TRUN_SAMPLE_DURATION | TRUN_SAMPLE_SIZE | TRUN_SAMPLE_FLAGS;
                        write_full_box(out, b"trun", 0, flags, |out| {
                            out.put_u32(track.entries.len() as u32);
                            out.put_u32(data_offset);
                            for entry in &track.entries {
                                out.put_u32(clamp_u32(entry.duration));
                                out.put_u32(entry.size);
                                out.put_u32(if entry.is_key {
                                    SAMPLE_FLAGS_SYNC
                                } else {
                                    SAMPLE_FLAGS_NON_SYNC
                                });
                            }
                        });
                    }
                });
            }
        });
        out
    }

    /// Write all pending samples as one `moof`/`mdat` pair.
    fn write_fragment(&mut self) -> CutlineResult<()> {
        let mut starts = Vec::new();
        let mut total = 0u64;
        for (index, track) in self.tracks.iter().enumerate() {
            if !track.entries.is_empty() {
                starts.push((index, total));
                total += track.pending_data.len() as u64;
            }
        }
        if starts.is_empty() {
            return Ok(());
        }
        self.sequence += 1;

        let header = mdat_header(total);
        let moof_len = self.moof(&starts, 0).len() as u64;
        let mut bytes = self.moof(&starts, moof_len + header.len() as u64);
        bytes.extend_from_slice(&header);
        for &(index, _) in &starts {
            bytes.extend_from_slice(&self.tracks[index].pending_data);
        }
        self.write(&bytes)?;

        for track in &mut self.tracks {
            track.entries.clear();
            track.pending_data.clear();
        }
        debug!(sequence = self.sequence, bytes = bytes.len(), "Wrote fragment");
        Ok(())
    }

    /// Write everything still buffered, close the file and move it to the
    /// output path.
    pub fn finalize(mut self) -> CutlineResult<PathBuf> {
        match self.mode {
            MuxMode::Buffered => {
                for track in &mut self.tracks {
                    track.settle_durations();
                }
                let ftyp = ftyp(false);
                let header = mdat_header(self.payload.len() as u64);
                let probe_len = self.moov(0, true, false).len() as u64;
                let large = ftyp.len() as u64 + probe_len + header.len() as u64 + self.payload.len() as u64
                    > u32::MAX as u64;
                let base = ftyp.len() as u64 + self.moov(0, large, false).len() as u64 + header.len() as u64;
                let moov = self.moov(base, large, false);

                let payload = std::mem::take(&mut self.payload);
                self.write(&ftyp)?;
                self.write(&moov)?;
                self.write(&header)?;
                self.write(&payload)?;
            }
            MuxMode::Fragmented => self.write_fragment()?,
        }

        let writer = self
            .writer
            .take()
            .ok_or_else(|| CutlineError::mux("Muxer output closed"))?;
        let file = writer
            .into_inner()
            .map_err(|e| CutlineError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.temp, &self.output)?;
        self.finalized = true;

        info!(
            path = %self.output.display(),
            bytes = self.bytes_written,
            mode = ?self.mode,
            "MP4 finalized"
        );
        Ok(self.output.clone())
    }
}

fn write_stsd(out: &mut Vec<u8>, track: &Track) {
    write_full_box(out, b"stsd", 0, 0, |out| {
        out.put_u32(1);
        match track.media {
            TrackMedia::Video(config) => {
                let kind = match config.codec {
                    VideoCodec::Mjpeg => b"mp4v",
                };
                write_box(out, kind, |out| {
                    out.put_zeros(6);
                    out.put_u16(1);
                    out.put_zeros(16);
                    out.put_u16(config.width as u16);
                    out.put_u16(config.height as u16);
                    out.put_u32(0x0048_0000);
                    out.put_u32(0x0048_0000);
                    out.put_u32(0);
                    out.put_u16(1);
                    out.put_zeros(32);
                    out.put_u16(0x0018);
                    out.put_u16(0xFFFF);
                    match config.codec {
                        VideoCodec::Mjpeg => write_esds(out, OBJECT_TYPE_JPEG, 0x04),
                    }
                });
            }
            TrackMedia::Audio(config) => {
                let kind = match config.codec {
                    AudioCodec::PcmS16 => b"sowt",
                };
                write_box(out, kind, |out| {
                    out.put_zeros(6);
                    out.put_u16(1);
                    out.put_zeros(8);
                    out.put_u16(config.channels);
                    out.put_u16(16);
                    out.put_u16(0);
                    out.put_u16(0);
                    out.put_u32(config.sample_rate << 16);
                });
            }
        }
    });
}

fn write_empty_tables(out: &mut Vec<u8>) {
    write_full_box(out, b"stts", 0, 0, |out| out.put_u32(0));
    write_full_box(out, b"stsc", 0, 0, |out| out.put_u32(0));
    write_full_box(out, b"stsz", 0, 0, |out| {
        out.put_u32(0);
        out.put_u32(0);
    });
    write_full_box(out, b"stco", 0, 0, |out| out.put_u32(0));
}

fn write_sample_tables(out: &mut Vec<u8>, track: &Track, base: u64, large: bool) {
    let entries = &track.entries;

    let mut stts: Vec<(u32, u32)> = Vec::new();
    for entry in entries {
        let delta = clamp_u32(entry.duration / entry.samples.max(1) as u64);
        match stts.last_mut() {
            Some((count, last)) if *last == delta => *count += entry.samples,
            _ => stts.push((entry.samples, delta)),
        }
    }
    write_full_box(out, b"stts", 0, 0, |out| {
        out.put_u32(stts.len() as u32);
        for (count, delta) in &stts {
            out.put_u32(*count);
            out.put_u32(*delta);
        }
    });

    if entries.iter().any(|entry| !entry.is_key) {
        let mut sync = Vec::new();
        let mut sample_number = 1u32;
        for entry in entries {
            if entry.is_key {
                sync.push(sample_number);
            }
            sample_number += entry.samples;
        }
        write_full_box(out, b"stss", 0, 0, |out| {
            out.put_u32(sync.len() as u32);
            for number in &sync {
                out.put_u32(*number);
            }
        });
    }

    let mut stsc: Vec<(u32, u32)> = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if stsc.last().map(|(_, per_chunk)| *per_chunk) != Some(entry.samples) {
            stsc.push((i as u32 + 1, entry.samples));
        }
    }
    write_full_box(out, b"stsc", 0, 0, |out| {
        out.put_u32(stsc.len() as u32);
        for (first_chunk, per_chunk) in &stsc {
            out.put_u32(*first_chunk);
            out.put_u32(*per_chunk);
            out.put_u32(1);
        }
    });

    write_full_box(out, b"stsz", 0, 0, |out| match track.constant_sample_size() {
        Some(size) => {
            out.put_u32(size);
            out.put_u32(clamp_u32(track.sample_count()));
        }
        None => {
            out.put_u32(0);
            out.put_u32(entries.len() as u32);
            for entry in entries {
                out.put_u32(entry.size);
            }
        }
    });

    if large {
        write_full_box(out, b"co64", 0, 0, |out| {
            out.put_u32(entries.len() as u32);
            for entry in entries {
                out.put_u64(base + entry.offset);
            }
        });
    } else {
        write_full_box(out, b"stco", 0, 0, |out| {
            out.put_u32(entries.len() as u32);
            for entry in entries {
                out.put_u32(clamp_u32(base + entry.offset));
            }
        });
    }
}

impl Drop for Mp4Muxer {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        self.writer.take();
        match std::fs::remove_file(&self.temp) {
            Ok(()) => debug!(path = %self.temp.display(), "Removed unfinished output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.temp.display(), error = %e, "Failed to remove unfinished output"),
        }
    }
}
