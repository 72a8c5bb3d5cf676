//! GStreamer video backend.
//!
//! Both strategies push RGBA samples through an `appsrc` and collect the
//! container bytes from an `appsink`. The codec path stamps buffers with the
//! synthetic sample timestamps; the recorder runs live and lets the source
//! timestamp buffers as they are drawn.

use super::video::{
    MuxedVideoWriter, PlatformCapabilities, RawSample, StreamRecorder, VideoBackend, VideoError,
};
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Seconds to wait for the pipeline to drain after end of stream
const EOS_TIMEOUT_SECS: u64 = 30;

const MUXED_PIPELINE: &str = "appsrc name=src ! videoconvert ! x264enc tune=zerolatency \
     ! video/x-h264,profile=baseline ! mp4mux streamable=true fragment-duration=500 \
     ! appsink name=sink sync=false";

const RECORDER_PIPELINE: &str = "appsrc name=src ! videoconvert ! vp8enc deadline=1 \
     ! webmmux streamable=true ! appsink name=sink sync=false";

/// Video backend built on GStreamer elements
pub struct GstBackend {
    capabilities: PlatformCapabilities,
}

impl GstBackend {
    /// Initialize GStreamer and probe the available encoders
    pub fn new() -> Result<Self, VideoError> {
        gst::init().map_err(|e| VideoError::Init(e.to_string()))?;

        let has = |name: &str| gst::ElementFactory::find(name).is_some();
        let capabilities = PlatformCapabilities {
            codec_encoder: has("x264enc") && has("mp4mux"),
            stream_recorder: has("vp8enc") && has("webmmux"),
            shared_memory: has("shmsink"),
            // no browser-style sandbox for a native process
            secure_context: true,
        };

        info!(?capabilities, "GStreamer backend initialized");
        Ok(Self { capabilities })
    }
}

impl VideoBackend for GstBackend {
    fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }

    fn open_muxer(
        &self,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn MuxedVideoWriter>, VideoError> {
        let pipeline = EncodePipeline::start(MUXED_PIPELINE, width, height, fps, false)?;
        Ok(Box::new(GstMuxer {
            pipeline,
            frame_duration: Duration::from_secs_f64(1.0 / fps),
        }))
    }

    fn open_recorder(
        &self,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn StreamRecorder>, VideoError> {
        let pipeline = EncodePipeline::start(RECORDER_PIPELINE, width, height, fps, true)?;
        Ok(Box::new(GstRecorder { pipeline }))
    }
}

fn clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(duration.as_nanos() as u64)
}

/// A running appsrc → encoder → appsink pipeline
struct EncodePipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl EncodePipeline {
    fn start(description: &str, width: u32, height: u32, fps: f64, live: bool) -> Result<Self, VideoError> {
        debug!(pipeline = %description, width, height, fps, "Creating encode pipeline");

        let pipeline = gst::parse::launch(description)
            .map_err(|e| VideoError::Pipeline(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| VideoError::Pipeline("Not a pipeline".to_string()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| VideoError::Pipeline("appsrc not found".to_string()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| VideoError::Pipeline("Could not cast to AppSrc".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| VideoError::Pipeline("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| VideoError::Pipeline("Could not cast to AppSink".to_string()))?;

        let caps = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgba, width, height)
            .fps(gst::Fraction::new((fps * 1000.0).round() as i32, 1000))
            .build()
            .map_err(|e| VideoError::Pipeline(e.to_string()))?
            .to_caps()
            .map_err(|e| VideoError::Pipeline(e.to_string()))?;

        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);
        appsrc.set_is_live(live);
        appsrc.set_property("do-timestamp", live);

        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink_chunks = chunks.clone();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    sink_chunks.lock().push(map.as_slice().to_vec());
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| VideoError::Pipeline(e.to_string()))?;

        Ok(Self {
            pipeline,
            appsrc,
            chunks,
        })
    }

    fn push(&self, data: Vec<u8>, timing: Option<(Duration, Duration)>) -> Result<(), VideoError> {
        let mut buffer = gst::Buffer::from_mut_slice(data);
        if let (Some((pts, duration)), Some(buf)) = (timing, buffer.get_mut()) {
            buf.set_pts(clock_time(pts));
            buf.set_duration(clock_time(duration));
        }

        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| VideoError::Encode(e.to_string()))
    }

    /// Send end of stream, wait for the pipeline to drain, return the output
    async fn finish(self) -> Result<Vec<Vec<u8>>, VideoError> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| VideoError::Encode(e.to_string()))?;

        let pipeline = self.pipeline.clone();
        let drained = tokio::task::spawn_blocking(move || {
            let bus = pipeline
                .bus()
                .ok_or_else(|| VideoError::Pipeline("Pipeline has no bus".to_string()))?;
            let message = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );

            match message.as_ref().map(|m| m.view()) {
                Some(gst::MessageView::Eos(_)) => Ok(()),
                Some(gst::MessageView::Error(err)) => Err(VideoError::Encode(err.error().to_string())),
                _ => Err(VideoError::Encode("Timed out waiting for end of stream".to_string())),
            }
        })
        .await
        .map_err(|e| VideoError::Encode(e.to_string()))?;

        let _ = self.pipeline.set_state(gst::State::Null);
        drained?;

        let chunks = std::mem::take(&mut *self.chunks.lock());
        Ok(chunks)
    }
}

impl Drop for EncodePipeline {
    fn drop(&mut self) {
        // also reached when an append or draw fails before finish
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

struct GstMuxer {
    pipeline: EncodePipeline,
    frame_duration: Duration,
}

#[async_trait]
impl MuxedVideoWriter for GstMuxer {
    async fn append(&mut self, sample: RawSample) -> Result<(), VideoError> {
        let timing = Some((sample.timestamp, self.frame_duration));
        self.pipeline.push(sample.data, timing)
    }

    async fn finalize(self: Box<Self>) -> Result<Vec<u8>, VideoError> {
        Ok(self.pipeline.finish().await?.concat())
    }
}

struct GstRecorder {
    pipeline: EncodePipeline,
}

#[async_trait]
impl StreamRecorder for GstRecorder {
    async fn draw(&mut self, sample: &RawSample) -> Result<(), VideoError> {
        self.pipeline.push(sample.data.clone(), None)
    }

    async fn stop(self: Box<Self>) -> Result<Vec<Vec<u8>>, VideoError> {
        self.pipeline.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSTHROUGH_PIPELINE: &str = "appsrc name=src ! appsink name=sink sync=false";

    #[test]
    fn test_dropped_pipeline_is_stopped() {
        gst::init().unwrap();

        let encode = EncodePipeline::start(PASSTHROUGH_PIPELINE, 4, 4, 10.0, false).unwrap();
        let pipeline = encode.pipeline.clone();
        encode.push(vec![0; 4 * 4 * 4], None).unwrap();
        assert_ne!(pipeline.current_state(), gst::State::Null);

        // abandoned without finish, as after a failed append
        drop(encode);
        assert_eq!(pipeline.current_state(), gst::State::Null);
    }
}
