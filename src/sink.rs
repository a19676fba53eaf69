//! Video sinks that record one camera stream each.
//!
//! Encoded outputs (MP4, Matroska) run through a GStreamer pipeline, see
//! [`crate::encoder`]. Y4M and raw RGB outputs are written directly.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::convert::{rgb_into, rgb_to_ycbcr};
use crate::encoder::GstSink;
use crate::error::SinkError;
use crate::traits::{Frame, PixelFormat};

/// Prefix of the primary camera's output file.
pub const LEFT_PREFIX: &str = "left_";
/// Prefix of the secondary camera's output file.
pub const RIGHT_PREFIX: &str = "right_";

/// Consumer of one raw frame stream.
///
/// The frame borrows the device buffer, so implementations must copy or
/// convert it before returning.
pub trait VideoSink {
    /// Append a frame.
    fn write_frame(&mut self, frame: &Frame<'_>) -> Result<(), SinkError>;

    /// Flush and close the output. Returns the number of frames written.
    fn finish(&mut self) -> Result<u64, SinkError>;

    /// Frames accepted so far.
    fn frames_written(&self) -> u64;
}

/// Output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// H.264 in an MP4 container.
    #[default]
    Mp4,
    /// H.264 in a Matroska container.
    Mkv,
    /// `YUV4MPEG2` with 4:4:4 planar chroma.
    Y4m,
    /// Headerless RGB24 frames.
    Raw,
}

impl Codec {
    /// Whether the output goes through an encoding pipeline.
    pub const fn is_encoded(self) -> bool {
        matches!(self, Self::Mp4 | Self::Mkv)
    }
}

/// Stream parameters a sink is opened with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkSpec {
    /// Output encoding.
    pub codec: Codec,
    /// Nominal frame rate written to the stream header.
    pub fps: f64,
    /// Frame width.
    pub width: u32,
    /// Frame height.
    pub height: u32,
    /// Encoding of the frames the camera delivers.
    pub pixel_format: PixelFormat,
}

impl SinkSpec {
    /// Reject frames whose geometry or encoding differ from the stream's.
    pub fn check(&self, frame: &Frame<'_>) -> Result<(), SinkError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(SinkError::FrameSize {
                width: self.width,
                height: self.height,
                actual_width: frame.width,
                actual_height: frame.height,
            });
        }
        if frame.pixel_format != self.pixel_format {
            return Err(SinkError::PixelFormat {
                expected: self.pixel_format,
                actual: frame.pixel_format,
            });
        }
        Ok(())
    }
}

/// Paths of the left (primary) and right (secondary) recordings.
///
/// The prefixes go in front of the file name, so a base of
/// `runs/take1.mp4` yields `runs/left_take1.mp4` and `runs/right_take1.mp4`.
pub fn output_paths(base: &str) -> (PathBuf, PathBuf) {
    let base = Path::new(base);
    let name = base
        .file_name()
        .map_or_else(|| base.to_string_lossy().into_owned(), |n| n.to_string_lossy().into_owned());
    let dir = base.parent().unwrap_or_else(|| Path::new(""));
    (
        dir.join(format!("{LEFT_PREFIX}{name}")),
        dir.join(format!("{RIGHT_PREFIX}{name}")),
    )
}

/// Express a frame rate as the `num:den` ratio used in stream headers.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn frame_rate_ratio(fps: f64) -> (u32, u32) {
    if fps.fract().abs() < f64::EPSILON {
        (fps as u32, 1)
    } else {
        ((fps * 1000.0).round() as u32, 1000)
    }
}

/// Sink chosen by [`open_sink`] for the configured codec.
pub enum OutputSink {
    /// Y4M or raw RGB file.
    File(FileSink),
    /// MP4 or Matroska through GStreamer.
    Encoded(GstSink),
}

/// Open the sink for `spec.codec` at `path`.
pub fn open_sink(path: &Path, spec: SinkSpec) -> Result<OutputSink, SinkError> {
    if spec.codec.is_encoded() {
        GstSink::open(path, spec).map(OutputSink::Encoded)
    } else {
        FileSink::open(path, spec).map(OutputSink::File)
    }
}

impl VideoSink for OutputSink {
    fn write_frame(&mut self, frame: &Frame<'_>) -> Result<(), SinkError> {
        match self {
            Self::File(sink) => sink.write_frame(frame),
            Self::Encoded(sink) => sink.write_frame(frame),
        }
    }

    fn finish(&mut self) -> Result<u64, SinkError> {
        match self {
            Self::File(sink) => sink.finish(),
            Self::Encoded(sink) => sink.finish(),
        }
    }

    fn frames_written(&self) -> u64 {
        match self {
            Self::File(sink) => sink.frames_written(),
            Self::Encoded(sink) => sink.frames_written(),
        }
    }
}

/// File-backed sink for the uncompressed codecs.
pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    spec: SinkSpec,
    frames: u64,
    rgb: Vec<u8>,
    planes: Vec<u8>,
}

impl FileSink {
    /// Create `path` and write the stream header.
    pub fn open(path: &Path, spec: SinkSpec) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|e| SinkError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut writer = BufWriter::new(file);

        if spec.codec == Codec::Y4m {
            let (num, den) = frame_rate_ratio(spec.fps);
            writeln!(
                writer,
                "YUV4MPEG2 W{} H{} F{num}:{den} Ip A1:1 C444",
                spec.width, spec.height
            )?;
        }
        info!(path = %path.display(), codec = ?spec.codec, width = spec.width, height = spec.height, fps = spec.fps, "sink opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
            spec,
            frames: 0,
            rgb: Vec::new(),
            planes: Vec::new(),
        })
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn y4m_planes(&mut self) {
        let pixels = self.rgb.len() / 3;
        self.planes.resize(pixels * 3, 0);
        let (luma, chroma) = self.planes.split_at_mut(pixels);
        let (cb_plane, cr_plane) = chroma.split_at_mut(pixels);

        for (((rgb, y), cb), cr) in self
            .rgb
            .chunks_exact(3)
            .zip(luma.iter_mut())
            .zip(cb_plane.iter_mut())
            .zip(cr_plane.iter_mut())
        {
            if let &[r, g, b] = rgb {
                (*y, *cb, *cr) = rgb_to_ycbcr(r, g, b);
            }
        }
    }
}

impl VideoSink for FileSink {
    fn write_frame(&mut self, frame: &Frame<'_>) -> Result<(), SinkError> {
        self.spec.check(frame)?;
        if self.writer.is_none() {
            return Err(SinkError::Closed);
        }

        rgb_into(frame, &mut self.rgb)?;
        if self.spec.codec == Codec::Y4m {
            self.y4m_planes();
        }
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        if self.spec.codec == Codec::Y4m {
            writer.write_all(b"FRAME\n")?;
            writer.write_all(&self.planes)?;
        } else {
            writer.write_all(&self.rgb)?;
        }
        self.frames += 1;
        debug!(path = %self.path.display(), frame = self.frames, "frame written");
        Ok(())
    }

    fn finish(&mut self) -> Result<u64, SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            info!(path = %self.path.display(), frames = self.frames, "sink closed");
        }
        Ok(self.frames)
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn solid(width: u32, height: u32, rgb: (u8, u8, u8)) -> Vec<u8> {
        (0..width * height).flat_map(|_| [rgb.0, rgb.1, rgb.2]).collect()
    }

    fn frame(data: &[u8], width: u32, height: u32, pixel_format: PixelFormat) -> Frame<'_> {
        Frame {
            data,
            width,
            height,
            pixel_format,
            timestamp: Duration::ZERO,
            frame_id: 0,
        }
    }

    fn spec(codec: Codec) -> SinkSpec {
        SinkSpec {
            codec,
            fps: 30.0,
            width: 4,
            height: 2,
            pixel_format: PixelFormat::RGB8,
        }
    }

    #[test]
    fn test_output_paths() {
        let (left, right) = output_paths("output.mp4");
        assert_eq!(left, PathBuf::from("left_output.mp4"));
        assert_eq!(right, PathBuf::from("right_output.mp4"));

        let (left, right) = output_paths("runs/take1.y4m");
        assert_eq!(left, PathBuf::from("runs/left_take1.y4m"));
        assert_eq!(right, PathBuf::from("runs/right_take1.y4m"));
    }

    #[test]
    fn test_frame_rate_ratio() {
        assert_eq!(frame_rate_ratio(30.0), (30, 1));
        assert_eq!(frame_rate_ratio(29.97), (29970, 1000));
    }

    #[test]
    fn test_codec_kinds() {
        assert_eq!(Codec::default(), Codec::Mp4);
        assert!(Codec::Mp4.is_encoded());
        assert!(Codec::Mkv.is_encoded());
        assert!(!Codec::Y4m.is_encoded());
        assert!(!Codec::Raw.is_encoded());
    }

    #[test]
    fn test_y4m_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("left_test.y4m");
        let mut sink = open_sink(&path, spec(Codec::Y4m)).expect("open should succeed");
        assert!(matches!(sink, OutputSink::File(_)));

        let white = solid(4, 2, (255, 255, 255));
        let black = solid(4, 2, (0, 0, 0));
        sink.write_frame(&frame(&white, 4, 2, PixelFormat::RGB8)).expect("write");
        sink.write_frame(&frame(&black, 4, 2, PixelFormat::RGB8)).expect("write");
        assert_eq!(sink.finish().expect("finish"), 2);

        let bytes = std::fs::read(&path).expect("read back");
        let header = b"YUV4MPEG2 W4 H2 F30:1 Ip A1:1 C444\n";
        assert!(bytes.starts_with(header));

        let frame_len = b"FRAME\n".len() + 4 * 2 * 3;
        assert_eq!(bytes.len(), header.len() + 2 * frame_len);

        let first = &bytes[header.len()..header.len() + frame_len];
        assert!(first.starts_with(b"FRAME\n"));
        // White: full luma, neutral chroma.
        assert!(first[6..14].iter().all(|&y| y == 255));
        assert!(first[14..].iter().all(|&c| c == 128));
    }

    #[test]
    fn test_y4m_from_bayer_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("left_bayer.y4m");
        let bayer = SinkSpec {
            pixel_format: PixelFormat::BayerRG8,
            ..spec(Codec::Y4m)
        };
        let mut sink = open_sink(&path, bayer).expect("open should succeed");

        let grey = [128u8; 8];
        sink.write_frame(&frame(&grey, 4, 2, PixelFormat::BayerRG8)).expect("write");
        sink.finish().expect("finish");

        let bytes = std::fs::read(&path).expect("read back");
        let body = &bytes[bytes.len() - 4 * 2 * 3..];
        assert!(body[..8].iter().all(|&y| y == 128), "grey luma");
        assert!(body[8..].iter().all(|&c| c == 128), "neutral chroma");
    }

    #[test]
    fn test_raw_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("right_test.rgb");
        let mut sink = open_sink(&path, spec(Codec::Raw)).expect("open should succeed");
        let data = solid(4, 2, (1, 2, 3));
        sink.write_frame(&frame(&data, 4, 2, PixelFormat::RGB8)).expect("write");
        sink.finish().expect("finish");

        assert_eq!(std::fs::read(&path).expect("read back"), data);
    }

    #[test]
    fn test_frame_size_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink =
            open_sink(&dir.path().join("x.y4m"), spec(Codec::Y4m)).expect("open should succeed");
        let data = solid(2, 2, (0, 0, 0));
        let err = sink
            .write_frame(&frame(&data, 2, 2, PixelFormat::RGB8))
            .expect_err("wrong size");
        assert!(matches!(err, SinkError::FrameSize { actual_width: 2, .. }));
        assert_eq!(sink.frames_written(), 0);
    }

    #[test]
    fn test_pixel_format_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink =
            open_sink(&dir.path().join("x.rgb"), spec(Codec::Raw)).expect("open should succeed");
        let data = [0u8; 8];
        let err = sink
            .write_frame(&frame(&data, 4, 2, PixelFormat::Mono8))
            .expect_err("wrong format");
        assert!(matches!(
            err,
            SinkError::PixelFormat {
                expected: PixelFormat::RGB8,
                actual: PixelFormat::Mono8
            }
        ));
    }

    #[test]
    fn test_short_frame_is_a_conversion_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink =
            open_sink(&dir.path().join("x.y4m"), spec(Codec::Y4m)).expect("open should succeed");
        let data = [0u8; 5];
        let err = sink
            .write_frame(&frame(&data, 4, 2, PixelFormat::RGB8))
            .expect_err("short buffer");
        assert!(matches!(err, SinkError::Conversion(_)));
    }

    #[test]
    fn test_write_after_finish() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink =
            open_sink(&dir.path().join("x.y4m"), spec(Codec::Y4m)).expect("open should succeed");
        sink.finish().expect("finish");
        let data = solid(4, 2, (0, 0, 0));
        let err = sink
            .write_frame(&frame(&data, 4, 2, PixelFormat::RGB8))
            .expect_err("closed");
        assert!(matches!(err, SinkError::Closed));
        assert_eq!(sink.finish().expect("second finish is a no-op"), 0);
    }

    #[test]
    fn test_open_in_missing_directory() {
        let err = open_sink(Path::new("/nonexistent/dir/out.y4m"), spec(Codec::Y4m))
            .err()
            .expect("open must fail");
        assert!(matches!(err, SinkError::Open { .. }));
    }
}
