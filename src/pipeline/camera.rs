//! Frame source: the camera and the contract the rest of the pipeline sees.

use crossbeam_channel::Receiver;

use crate::{error::CaptureError, types::Frame};

/// A live, cancellable sequence of frames. Owned by exactly one capture
/// session.
pub trait FrameSource: Send {
    fn frames(&self) -> Receiver<Frame>;

    /// Stops capture and releases the device lock. Idempotent.
    fn release(&mut self);
}

/// Acquires the camera. May block on device open and permission prompts, so
/// it is only ever called from an acquisition thread.
pub trait FrameSourceProvider: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn FrameSource>, CaptureError>;
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: u32,
    pub label: String,
}

#[cfg(feature = "camera-nokhwa")]
pub use self::native::{NokhwaProvider, available_cameras};

#[cfg(not(feature = "camera-nokhwa"))]
pub use self::unsupported::{NokhwaProvider, available_cameras};

#[cfg(feature = "camera-nokhwa")]
mod native {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Instant,
    };

    use crossbeam_channel::{Receiver, bounded};
    use nokhwa::{
        Camera,
        pixel_format::RgbFormat,
        query,
        utils::{
            ApiBackend, CameraIndex, CameraInfo, FrameFormat, RequestedFormat,
            RequestedFormatType,
        },
    };
    use rayon::prelude::*;

    use super::{CameraDevice, FrameSource, FrameSourceProvider};
    use crate::{error::CaptureError, types::Frame};

    // Prefer pixel formats that are widely supported on macOS (the built-in cameras
    // often reject YUYV even though Nokhwa reports it).
    const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
        FrameFormat::MJPEG,
        FrameFormat::NV12,
        FrameFormat::RAWRGB,
        FrameFormat::RAWBGR,
    ];

    fn requested_formats() -> [RequestedFormat<'static>; 4] {
        [
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestFrameRate,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::with_formats(
                RequestedFormatType::AbsoluteHighestResolution,
                PREFERRED_PIXEL_FORMATS,
            ),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
        ]
    }

    pub fn available_cameras() -> anyhow::Result<Vec<CameraDevice>> {
        let cameras = query(ApiBackend::Auto)?;
        Ok(cameras
            .into_iter()
            .filter_map(|info| match info.index() {
                CameraIndex::Index(index) => Some(CameraDevice {
                    index: *index,
                    label: format_camera_label(&info),
                }),
                CameraIndex::String(_) => None,
            })
            .collect())
    }

    fn format_camera_label(info: &CameraInfo) -> String {
        let name = info.human_name();
        let desc = info.description().trim();
        if desc.is_empty() || desc == "N/A" {
            name
        } else {
            format!("{name} ({desc})")
        }
    }

    fn build_camera(index: CameraIndex) -> Result<Camera, CaptureError> {
        let mut last_err = None;

        for requested in requested_formats() {
            match Camera::new(index.clone(), requested) {
                Ok(mut camera) => match camera.open_stream() {
                    Ok(()) => return Ok(camera),
                    Err(err) => last_err = Some(err.to_string()),
                },
                Err(err) => last_err = Some(err.to_string()),
            }
        }

        Err(CaptureError::from_device_message(last_err.unwrap_or_else(|| {
            "failed to open camera with any supported format".to_string()
        })))
    }

    /// Opens `camera.index` through nokhwa.
    pub struct NokhwaProvider {
        index: u32,
    }

    impl NokhwaProvider {
        pub fn new(index: u32) -> Self {
            Self { index }
        }
    }

    impl FrameSourceProvider for NokhwaProvider {
        fn acquire(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
            CameraStream::open(CameraIndex::Index(self.index))
                .map(|stream| Box::new(stream) as Box<dyn FrameSource>)
        }
    }

    #[derive(Debug)]
    pub struct CameraStream {
        stop: Arc<AtomicBool>,
        handle: Option<thread::JoinHandle<()>>,
        frames: Receiver<Frame>,
    }

    impl CameraStream {
        /// The device is opened on the capture thread itself; this call
        /// returns once the open has succeeded or failed.
        fn open(index: CameraIndex) -> Result<Self, CaptureError> {
            let (ready_tx, ready_rx) = bounded(1);
            let (frame_tx, frame_rx) = bounded(1);
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = stop.clone();

            let handle = thread::spawn(move || {
                let mut camera = match build_camera(index) {
                    Ok(cam) => {
                        let _ = ready_tx.send(Ok(()));
                        cam
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                log::info!("camera stream opened: {}", camera.info().human_name());

                while !stop_flag.load(Ordering::Relaxed) {
                    let frame = match camera.frame() {
                        Ok(frame) => frame,
                        Err(err) => {
                            log::warn!("camera frame read failed: {err:?}");
                            continue;
                        }
                    };

                    let decoded = match frame.decode_image::<RgbFormat>() {
                        Ok(img) => img,
                        Err(err) => {
                            log::warn!("failed to decode camera frame: {err:?}");
                            continue;
                        }
                    };

                    let (width, height) = decoded.dimensions();
                    let rgb = decoded.into_raw();
                    if rgb.is_empty() {
                        continue;
                    }

                    // Expand RGB to RGBA for the detector stage.
                    let pixel_count = rgb.len() / 3;
                    let mut rgba = vec![0u8; pixel_count * 4];
                    rgba.par_chunks_mut(4)
                        .zip(rgb.par_chunks_exact(3))
                        .for_each(|(dst, src)| {
                            dst[0] = src[0];
                            dst[1] = src[1];
                            dst[2] = src[2];
                            dst[3] = 255;
                        });

                    let frame = Frame {
                        rgba,
                        width,
                        height,
                        timestamp: Instant::now(),
                    };

                    // Drop if the detector is busy.
                    let _ = frame_tx.try_send(frame);
                }

                // Closing the stream is what turns the device indicator off.
                if let Err(err) = camera.stop_stream() {
                    log::warn!("failed to close camera stream: {err:?}");
                }
                log::info!("camera stream released");
            });

            let opened = ready_rx.recv().unwrap_or_else(|_| {
                Err(CaptureError::DeviceUnavailable(
                    "camera thread exited during open".to_string(),
                ))
            });

            match opened {
                Ok(()) => Ok(Self {
                    stop,
                    handle: Some(handle),
                    frames: frame_rx,
                }),
                Err(err) => {
                    let _ = handle.join();
                    Err(err)
                }
            }
        }

        fn shutdown(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    impl FrameSource for CameraStream {
        fn frames(&self) -> Receiver<Frame> {
            self.frames.clone()
        }

        fn release(&mut self) {
            self.shutdown();
        }
    }

    impl Drop for CameraStream {
        fn drop(&mut self) {
            self.shutdown();
        }
    }
}

#[cfg(not(feature = "camera-nokhwa"))]
mod unsupported {
    use super::{CameraDevice, FrameSource, FrameSourceProvider};
    use crate::error::CaptureError;

    pub fn available_cameras() -> anyhow::Result<Vec<CameraDevice>> {
        Ok(Vec::new())
    }

    pub struct NokhwaProvider;

    impl NokhwaProvider {
        pub fn new(_index: u32) -> Self {
            Self
        }
    }

    impl FrameSourceProvider for NokhwaProvider {
        fn acquire(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
            Err(CaptureError::DeviceUnavailable(
                "built without the camera-nokhwa feature".to_string(),
            ))
        }
    }
}
