//! FFmpeg-backed capture for local files and network streams.
//!
//! The same decoder path serves uploaded files and rtmp/rtmps/srt URLs.
//! Frames are converted to packed RGB24 at the source resolution on a
//! dedicated decode thread per capture.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::{CaptureOpener, VideoCapture};
use crate::frame::Frame;

/// Decoded frames buffered ahead of the consumer.
const FRAME_QUEUE: usize = 2;

/// Handle to a decode thread.
///
/// The libav contexts are created, used and dropped on that thread. The
/// handle only holds the receiving end of a bounded frame queue, so it can
/// move between threads freely.
pub struct FfmpegCapture {
    location: String,
    frames: Option<mpsc::Receiver<Result<Frame>>>,
    stop: Arc<AtomicBool>,
}

impl FfmpegCapture {
    /// Open `location` on a new decode thread. Open failures are returned
    /// here, not on the first read.
    pub fn open(location: &str) -> Result<Self> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_QUEUE);
        let stop = Arc::new(AtomicBool::new(false));

        let worker_stop = stop.clone();
        let worker_location = location.to_string();
        let worker = thread::Builder::new()
            .name("ffmpeg-decode".to_string())
            .spawn(move || {
                let mut decoder = match Decoder::open(&worker_location) {
                    Ok(decoder) => {
                        let _ = ready_tx.send(Ok(()));
                        decoder
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                while !worker_stop.load(Ordering::SeqCst) {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            if frame_tx.send(Ok(frame)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = frame_tx.send(Err(err));
                            break;
                        }
                    }
                }
                log::debug!(
                    "FfmpegCapture: decode thread for {} exiting after {} frames",
                    worker_location,
                    decoder.frame_count
                );
            })
            .context("spawn ffmpeg decode thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = worker.join();
                anyhow::bail!("ffmpeg decode thread for '{}' exited during open", location);
            }
        }

        Ok(Self {
            location: location.to_string(),
            frames: Some(frame_rx),
            stop,
        })
    }
}

impl VideoCapture for FfmpegCapture {
    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(frames) = &self.frames else {
            return Ok(None);
        };
        match frames.recv() {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(err)) => Err(err),
            // Decode thread finished: end of input.
            Err(_) => Ok(None),
        }
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the receiver unblocks a decode thread waiting on a full queue.
        if self.frames.take().is_some() {
            log::debug!("FfmpegCapture: released {}", self.location);
        }
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Demuxer, decoder and RGB scaler. Lives on the decode thread only.
struct Decoder {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    eof_sent: bool,
}

impl Decoder {
    fn open(location: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&location)
            .with_context(|| format!("failed to open '{}' with ffmpeg", location))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("'{}' has no video track", location))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegCapture: opened {} ({}x{})",
            location,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            frame_count: 0,
            eof_sent: false,
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.receive()? {
            return Ok(Some(frame));
        }

        while !self.eof_sent {
            let mut next_packet = None;
            for (stream, packet) in self.input.packets() {
                if stream.index() == self.stream_index {
                    next_packet = Some(packet);
                    break;
                }
            }
            match next_packet {
                Some(packet) => {
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    // Flush frames still buffered in the decoder.
                    self.decoder.send_eof().context("send eof to ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
            if let Some(frame) = self.receive()? {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    fn receive(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        self.frame_count += 1;
        Ok(Some(Frame::new(pixels, width, height)?))
    }
}

#[derive(Default)]
pub struct FfmpegOpener;

impl FfmpegOpener {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureOpener for FfmpegOpener {
    fn open(&self, location: &str) -> Result<Box<dyn VideoCapture>> {
        Ok(Box::new(FfmpegCapture::open(location)?))
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
