//! GStreamer encode pipeline for the MP4 and Matroska outputs.
//!
//! # Encoder priority (highest to lowest)
//!
//! | Encoder       | Output      | Notes |
//! |---------------|-------------|-------|
//! | `x264enc`     | H.264       | gst-plugins-ugly |
//! | `openh264enc` | H.264       | gst-plugins-bad |
//! | `avenc_mpeg4` | MPEG-4 part 2 | gst-libav fallback |
//!
//! # Pipeline
//!
//! ```text
//! appsrc (raw camera frames)
//!   → bayer2rgb              (Bayer input, when the element exists)
//!   → videoconvert
//!   → video/x-raw,format=I420
//!   → <best-encoder>
//!   → <parser>
//!   → mp4mux | matroskamux
//!   → filesink
//! ```
//!
//! Without `bayer2rgb`, Bayer frames are demosaiced in process and pushed
//! as RGB. Frames are copied into GStreamer buffers, so the device buffer can
//! be released as soon as [`VideoSink::write_frame`] returns.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::AppSrc;
use tracing::{debug, info, warn};

use crate::convert::{check_frame, rgb_into};
use crate::error::SinkError;
use crate::sink::{frame_rate_ratio, Codec, SinkSpec, VideoSink};
use crate::traits::{Frame, PixelFormat};

/// Seconds to wait for the muxer to drain after end of stream.
const EOS_TIMEOUT_SECS: u64 = 10;

/// Frames the source may queue before `write_frame` blocks.
const QUEUED_FRAMES: usize = 8;

/// An encoder element and what follows it in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoder {
    /// Element factory name.
    pub element: &'static str,
    /// Properties appended after the element name.
    pub properties: &'static str,
    /// Parser placed between encoder and muxer.
    pub parser: &'static str,
}

const ENCODERS: &[Encoder] = &[
    Encoder {
        element: "x264enc",
        properties: "tune=zerolatency speed-preset=ultrafast",
        parser: "h264parse",
    },
    Encoder {
        element: "openh264enc",
        properties: "",
        parser: "h264parse",
    },
    Encoder {
        element: "avenc_mpeg4",
        properties: "",
        parser: "mpeg4videoparse",
    },
];

/// Return the first encoder whose element `available` reports installed.
pub fn select_encoder<F>(available: F) -> Option<&'static Encoder>
where
    F: Fn(&str) -> bool,
{
    ENCODERS.iter().find(|encoder| available(encoder.element))
}

/// Muxer element for an encoded codec.
pub const fn muxer(codec: Codec) -> Option<&'static str> {
    match codec {
        Codec::Mp4 => Some("mp4mux"),
        Codec::Mkv => Some("matroskamux"),
        Codec::Y4m | Codec::Raw => None,
    }
}

/// Caps format string of a Bayer tile.
const fn bayer_format(format: PixelFormat) -> Option<&'static str> {
    match format {
        PixelFormat::BayerRG8 => Some("rggb"),
        PixelFormat::BayerGB8 => Some("gbrg"),
        PixelFormat::BayerGR8 => Some("grbg"),
        PixelFormat::BayerBG8 => Some("bggr"),
        PixelFormat::Mono8 | PixelFormat::RGB8 => None,
    }
}

/// Bytes per pixel of the buffers pushed into `appsrc`.
const fn pushed_bytes_per_pixel(format: PixelFormat, debayer: bool) -> usize {
    if matches!(format, PixelFormat::Mono8) || (debayer && bayer_format(format).is_some()) {
        1
    } else {
        3
    }
}

/// GStreamer rounds raw video rows up to four bytes.
const fn stride(row_bytes: usize) -> usize {
    row_bytes.next_multiple_of(4)
}

/// Caps of the buffers pushed into `appsrc`.
///
/// With `debayer` set, Bayer frames go in as `video/x-bayer`; otherwise
/// they are pushed as RGB after in-process conversion.
pub fn input_caps(spec: &SinkSpec, debayer: bool) -> String {
    let (num, den) = frame_rate_ratio(spec.fps);
    let media = match (bayer_format(spec.pixel_format), spec.pixel_format) {
        (Some(tile), _) if debayer => format!("video/x-bayer,format={tile}"),
        (_, PixelFormat::Mono8) => "video/x-raw,format=GRAY8".to_owned(),
        _ => "video/x-raw,format=RGB".to_owned(),
    };
    format!(
        "{media},width={},height={},framerate={num}/{den}",
        spec.width, spec.height
    )
}

/// Build the `gst-launch` description of the encode pipeline.
///
/// The `filesink` is named `out`; its location is set after parsing so
/// paths never need quoting.
pub fn pipeline_description(
    spec: &SinkSpec,
    encoder: &Encoder,
    debayer: bool,
) -> Result<String, SinkError> {
    let mux = muxer(spec.codec)
        .ok_or_else(|| SinkError::Pipeline(format!("{:?} is not an encoded codec", spec.codec)))?;
    let bpp = pushed_bytes_per_pixel(spec.pixel_format, debayer);
    let max_bytes = stride(spec.width as usize * bpp) * spec.height as usize * QUEUED_FRAMES;
    let caps = input_caps(spec, debayer);
    let debayer_stage = if debayer && bayer_format(spec.pixel_format).is_some() {
        "bayer2rgb ! "
    } else {
        ""
    };
    let encode_stage = if encoder.properties.is_empty() {
        encoder.element.to_owned()
    } else {
        format!("{} {}", encoder.element, encoder.properties)
    };

    Ok(format!(
        "appsrc name=src format=time block=true max-bytes={max_bytes} caps=\"{caps}\" \
         ! {debayer_stage}videoconvert \
         ! video/x-raw,format=I420 \
         ! {encode_stage} \
         ! {parser} \
         ! {mux} \
         ! filesink name=out",
        parser = encoder.parser,
    ))
}

/// Presentation time of frame `index` in nanoseconds.
pub fn frame_time_ns(index: u64, (num, den): (u32, u32)) -> u64 {
    (u128::from(index) * 1_000_000_000 * u128::from(den))
        .checked_div(u128::from(num))
        .map_or(0, |ns| u64::try_from(ns).unwrap_or(u64::MAX))
}

fn pipeline_error<E: fmt::Display>(err: E) -> SinkError {
    SinkError::Pipeline(err.to_string())
}

fn message_error(message: &gst::Message) -> SinkError {
    let source = message
        .src()
        .map_or_else(|| "pipeline".to_owned(), |src| src.name().to_string());
    match message.view() {
        gst::MessageView::Error(err) => SinkError::Pipeline(format!("{source}: {}", err.error())),
        _ => SinkError::Pipeline(format!("{source}: unexpected {:?}", message.type_())),
    }
}

/// Sink that encodes frames through a GStreamer pipeline into a file.
pub struct GstSink {
    path: PathBuf,
    spec: SinkSpec,
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    convert: bool,
    rgb: Vec<u8>,
    rate: (u32, u32),
    frames: u64,
    finished: bool,
}

impl GstSink {
    /// Build, configure and start the pipeline writing to `path`.
    pub fn open(path: &Path, spec: SinkSpec) -> Result<Self, SinkError> {
        gst::init().map_err(pipeline_error)?;

        let encoder = select_encoder(|name| gst::ElementFactory::find(name).is_some())
            .ok_or_else(|| {
                SinkError::Pipeline("no H.264 or MPEG-4 encoder element is installed".to_owned())
            })?;
        let bayer = bayer_format(spec.pixel_format).is_some();
        let debayer = bayer && gst::ElementFactory::find("bayer2rgb").is_some();
        if bayer && !debayer {
            warn!("bayer2rgb not found; demosaicing in process");
        }

        let desc = pipeline_description(&spec, encoder, debayer)?;
        debug!(pipeline = %desc, "encoder pipeline");

        let pipeline = gst::parse::launch(&desc)
            .map_err(pipeline_error)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| SinkError::Pipeline("expected a pipeline".to_owned()))?;
        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| SinkError::Pipeline("appsrc 'src' missing".to_owned()))?
            .downcast::<AppSrc>()
            .map_err(|_| SinkError::Pipeline("'src' is not an appsrc".to_owned()))?;
        let location = path.to_str().ok_or_else(|| {
            SinkError::Pipeline(format!("{} is not valid UTF-8", path.display()))
        })?;
        pipeline
            .by_name("out")
            .ok_or_else(|| SinkError::Pipeline("filesink 'out' missing".to_owned()))?
            .set_property("location", location);

        if let Err(err) = pipeline.set_state(gst::State::Playing) {
            let reason = pipeline
                .bus()
                .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
                .map_or_else(|| err.to_string(), |msg| message_error(&msg).to_string());
            let _ = pipeline.set_state(gst::State::Null);
            return Err(SinkError::Open {
                path: path.to_path_buf(),
                source: io::Error::other(reason),
            });
        }

        info!(
            path = %path.display(),
            codec = ?spec.codec,
            encoder = encoder.element,
            debayer,
            width = spec.width,
            height = spec.height,
            fps = spec.fps,
            "sink opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            spec,
            pipeline,
            appsrc,
            convert: bayer && !debayer,
            rgb: Vec::new(),
            rate: frame_rate_ratio(spec.fps),
            frames: 0,
            finished: false,
        })
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_bus(&self) -> Result<(), SinkError> {
        match self
            .pipeline
            .bus()
            .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
        {
            Some(message) => Err(message_error(&message)),
            None => Ok(()),
        }
    }

    /// Send end of stream and wait until the muxer has written the trailer.
    fn drain(&self) -> Result<(), SinkError> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| SinkError::Pipeline(format!("end of stream refused: {e:?}")))?;
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| SinkError::Pipeline("pipeline has no bus".to_owned()))?;
        let message = bus
            .timed_pop_filtered(
                gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            )
            .ok_or_else(|| SinkError::Pipeline("timed out waiting for end of stream".to_owned()))?;
        match message.view() {
            gst::MessageView::Eos(..) => Ok(()),
            _ => Err(message_error(&message)),
        }
    }
}

/// Copy `rows` rows of `row_bytes` into a buffer with GStreamer's stride.
fn frame_buffer(
    pixels: &[u8],
    row_bytes: usize,
    rows: usize,
    pts: gst::ClockTime,
    duration: gst::ClockTime,
) -> Result<gst::Buffer, SinkError> {
    let stride = stride(row_bytes);
    let mut buffer = gst::Buffer::with_size(stride * rows).map_err(pipeline_error)?;
    {
        let buffer = buffer
            .get_mut()
            .ok_or_else(|| SinkError::Pipeline("new buffer is shared".to_owned()))?;
        buffer.set_pts(pts);
        buffer.set_duration(duration);
        let mut map = buffer.map_writable().map_err(pipeline_error)?;
        for (dst, src) in map
            .chunks_exact_mut(stride)
            .zip(pixels.chunks_exact(row_bytes))
        {
            if let Some(row) = dst.get_mut(..row_bytes) {
                row.copy_from_slice(src);
            }
        }
    }
    Ok(buffer)
}

impl VideoSink for GstSink {
    fn write_frame(&mut self, frame: &Frame<'_>) -> Result<(), SinkError> {
        if self.finished {
            return Err(SinkError::Closed);
        }
        self.spec.check(frame)?;
        self.check_bus()?;

        let (pixels, bpp) = if self.convert {
            rgb_into(frame, &mut self.rgb)?;
            (self.rgb.as_slice(), 3)
        } else {
            (check_frame(frame)?, frame.pixel_format.bytes_per_pixel())
        };
        let pts = frame_time_ns(self.frames, self.rate);
        let next = frame_time_ns(self.frames + 1, self.rate);
        let buffer = frame_buffer(
            pixels,
            frame.width as usize * bpp,
            frame.height as usize,
            gst::ClockTime::from_nseconds(pts),
            gst::ClockTime::from_nseconds(next - pts),
        )?;

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| SinkError::Pipeline(format!("appsrc refused frame: {e:?}")))?;
        self.frames += 1;
        debug!(path = %self.path.display(), frame = self.frames, "frame queued");
        Ok(())
    }

    fn finish(&mut self) -> Result<u64, SinkError> {
        if self.finished {
            return Ok(self.frames);
        }
        self.finished = true;
        let drained = self.drain();
        let stopped = self
            .pipeline
            .set_state(gst::State::Null)
            .map(|_| ())
            .map_err(pipeline_error);
        drained.and(stopped)?;
        info!(path = %self.path.display(), frames = self.frames, "sink closed");
        Ok(self.frames)
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.drain() {
                warn!(path = %self.path.display(), error = %err, "encoder not drained");
            }
            let _ = self.pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(codec: Codec, pixel_format: PixelFormat) -> SinkSpec {
        SinkSpec {
            codec,
            fps: 30.0,
            width: 1280,
            height: 720,
            pixel_format,
        }
    }

    #[test]
    fn test_select_encoder_prefers_x264() {
        let all = select_encoder(|_| true).expect("an encoder");
        assert_eq!(all.element, "x264enc");

        let fallback = select_encoder(|name| name == "avenc_mpeg4").expect("an encoder");
        assert_eq!(fallback.parser, "mpeg4videoparse");

        assert!(select_encoder(|_| false).is_none());
    }

    #[test]
    fn test_bayer_caps() {
        let caps = input_caps(&spec(Codec::Mp4, PixelFormat::BayerGB8), true);
        assert_eq!(
            caps,
            "video/x-bayer,format=gbrg,width=1280,height=720,framerate=30/1"
        );
        // Without bayer2rgb the sink pushes demosaiced RGB.
        let caps = input_caps(&spec(Codec::Mp4, PixelFormat::BayerGB8), false);
        assert!(caps.starts_with("video/x-raw,format=RGB,"), "{caps}");
    }

    #[test]
    fn test_mono_and_rgb_caps() {
        let mono = input_caps(&spec(Codec::Mkv, PixelFormat::Mono8), true);
        assert!(mono.starts_with("video/x-raw,format=GRAY8,"), "{mono}");
        let rgb = input_caps(
            &SinkSpec {
                fps: 29.97,
                ..spec(Codec::Mkv, PixelFormat::RGB8)
            },
            true,
        );
        assert!(rgb.ends_with("framerate=29970/1000"), "{rgb}");
    }

    #[test]
    fn test_mp4_pipeline_description() {
        let encoder = select_encoder(|_| true).expect("an encoder");
        let desc = pipeline_description(&spec(Codec::Mp4, PixelFormat::BayerRG8), encoder, true)
            .expect("mp4 is encoded");

        assert!(desc.starts_with("appsrc name=src format=time block=true"));
        assert!(desc.contains(&format!("max-bytes={}", 1280 * 720 * QUEUED_FRAMES)));
        assert!(desc.contains("! bayer2rgb ! videoconvert"));
        assert!(desc.contains("! x264enc tune=zerolatency speed-preset=ultrafast ! h264parse"));
        assert!(desc.contains("! mp4mux ! filesink name=out"));
    }

    #[test]
    fn test_mkv_pipeline_without_debayer() {
        let encoder = select_encoder(|name| name == "openh264enc").expect("an encoder");
        let desc = pipeline_description(&spec(Codec::Mkv, PixelFormat::BayerRG8), encoder, false)
            .expect("mkv is encoded");

        assert!(!desc.contains("bayer2rgb"));
        assert!(desc.contains(&format!("max-bytes={}", 1280 * 3 * 720 * QUEUED_FRAMES)));
        assert!(desc.contains("! openh264enc ! h264parse ! matroskamux !"));
    }

    #[test]
    fn test_uncompressed_codecs_have_no_pipeline() {
        let encoder = select_encoder(|_| true).expect("an encoder");
        let err = pipeline_description(&spec(Codec::Y4m, PixelFormat::RGB8), encoder, true)
            .expect_err("y4m is written directly");
        assert!(matches!(err, SinkError::Pipeline(_)));
    }

    #[test]
    fn test_frame_times() {
        assert_eq!(frame_time_ns(0, (30, 1)), 0);
        assert_eq!(frame_time_ns(30, (30, 1)), 1_000_000_000);
        assert_eq!(frame_time_ns(1, (30, 1)), 33_333_333);
        assert_eq!(frame_time_ns(2997, (29970, 1000)), 100_000_000_000);
        assert_eq!(frame_time_ns(5, (0, 1)), 0);
    }

    #[test]
    fn test_stride_rounds_rows_to_four_bytes() {
        assert_eq!(stride(1280 * 3), 3840);
        assert_eq!(stride(3 * 3), 12);
        assert_eq!(stride(6), 8);
    }
}
