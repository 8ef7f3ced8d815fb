//! Landmark detection through an external helper process.
//!
//! The helper prints `READY` once its model is loaded. For every frame it
//! receives a little-endian `u32` header (width, height, channels) followed by
//! the raw RGBA bytes, and answers with one JSON line:
//!
//! ```json
//! {"hands": [{"score": 0.93, "landmarks": [{"x": 0.41, "y": 0.62, "z": -0.01}, ...]}]}
//! ```
//!
//! A helper that misses `detector.startup_timeout_ms` or
//! `detector.reply_timeout_ms` is killed.

use std::{
    io::{self, BufRead, BufReader, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, unbounded};
use fast_image_resize::{PixelType, Resizer, images::Image, images::ImageRef};
use serde::Deserialize;

use super::detector::{Canceller, DetectorFactory, LandmarkDetector};
use crate::{config::DetectorConfig, types::Frame};

#[derive(Deserialize, Debug)]
struct PointJson {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Deserialize, Debug)]
struct HandJson {
    #[serde(default = "full_score")]
    score: f32,
    landmarks: Vec<PointJson>,
}

fn full_score() -> f32 {
    1.0
}

#[derive(Deserialize, Debug)]
struct DetectionReply {
    #[serde(default)]
    hands: Vec<HandJson>,
    #[serde(default)]
    error: Option<String>,
}

/// Picks the first hand at or above `min_confidence`.
fn parse_reply(line: &str, min_confidence: f32) -> Result<Option<Vec<[f32; 3]>>> {
    let reply: DetectionReply = serde_json::from_str(line.trim())
        .with_context(|| format!("failed to parse detector reply: {}", line.trim()))?;

    if let Some(error) = reply.error {
        bail!("detector reported: {error}");
    }

    Ok(reply
        .hands
        .into_iter()
        .find(|hand| hand.score >= min_confidence)
        .map(|hand| {
            hand.landmarks
                .into_iter()
                .map(|p| [p.x, p.y, p.z])
                .collect()
        }))
}

/// Largest size that fits inside `max_width`x`max_height` without upscaling
/// or changing the aspect ratio.
fn target_size(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if max_width == 0 || max_height == 0 || width == 0 || height == 0 {
        return (width, height);
    }
    let scale = (max_width as f32 / width as f32)
        .min(max_height as f32 / height as f32)
        .min(1.0);
    (
        ((width as f32 * scale).round() as u32).max(1),
        ((height as f32 * scale).round() as u32).max(1),
    )
}

pub struct SubprocessDetectorFactory {
    config: DetectorConfig,
}

impl SubprocessDetectorFactory {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }
}

impl DetectorFactory for SubprocessDetectorFactory {
    fn create(&self) -> Result<Box<dyn LandmarkDetector>> {
        SubprocessDetector::spawn(&self.config)
            .map(|detector| Box::new(detector) as Box<dyn LandmarkDetector>)
    }
}

/// Owned by the detector and its canceller, so either can kill the helper.
type SharedChild = Arc<Mutex<Child>>;

fn kill(process: &SharedChild) {
    let mut child = process.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = child.kill();
}

fn read_reply(stdout: &mut BufReader<ChildStdout>) -> io::Result<String> {
    let mut line = String::new();
    if stdout.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "detector process closed its output",
        ));
    }
    Ok(line)
}

/// Runs the pipe exchange on its own thread: the `READY` line first, then
/// one reply per request. The detector only ever waits on channels, never on
/// the pipes, so a wedged helper can always be timed out or cancelled.
fn spawn_exchange(
    mut stdin: ChildStdin,
    stdout: ChildStdout,
) -> Result<(Sender<Vec<u8>>, Receiver<io::Result<String>>)> {
    let (request_tx, request_rx) = unbounded::<Vec<u8>>();
    let (reply_tx, reply_rx) = unbounded();

    thread::Builder::new()
        .name("detector-io".into())
        .spawn(move || {
            let mut stdout = BufReader::new(stdout);
            if reply_tx.send(read_reply(&mut stdout)).is_err() {
                return;
            }
            for request in request_rx {
                let reply = stdin
                    .write_all(&request)
                    .and_then(|()| stdin.flush())
                    .and_then(|()| read_reply(&mut stdout));
                let failed = reply.is_err();
                if reply_tx.send(reply).is_err() || failed {
                    break;
                }
            }
            log::debug!("detector exchange closed");
        })
        .context("failed to spawn detector io thread")?;

    Ok((request_tx, reply_rx))
}

enum Exchange {
    Reply(io::Result<String>),
    Cancelled,
    TimedOut,
}

pub struct SubprocessDetector {
    process: SharedChild,
    requests: Sender<Vec<u8>>,
    replies: Receiver<io::Result<String>>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
    reply_timeout: Duration,
    broken: bool,
    resizer: Resizer,
    max_size: (u32, u32),
    min_confidence: f32,
}

impl SubprocessDetector {
    fn spawn(config: &DetectorConfig) -> Result<Self> {
        let (program, args) = config.command.split_first().ok_or_else(|| {
            anyhow!("detector.command is not configured; set it to a landmark helper program")
        })?;

        log::info!("starting landmark detector: {}", config.command.join(" "));
        let mut process = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start detector process {program}"))?;

        let stdin = process.stdin.take().context("detector stdin unavailable")?;
        let stdout = process.stdout.take().context("detector stdout unavailable")?;
        let process = Arc::new(Mutex::new(process));
        let (requests, replies) = match spawn_exchange(stdin, stdout) {
            Ok(channels) => channels,
            Err(err) => {
                kill(&process);
                return Err(err);
            }
        };
        let (cancel_tx, cancel_rx) = bounded(1);

        // From here on every early return drops `detector`, which kills the helper.
        let detector = Self {
            process,
            requests,
            replies,
            cancel_tx,
            cancel_rx,
            reply_timeout: config.reply_timeout(),
            broken: false,
            resizer: Resizer::new(),
            max_size: (config.input_width, config.input_height),
            min_confidence: config.min_confidence,
        };

        let startup = config.startup_timeout();
        match detector.replies.recv_timeout(startup) {
            Ok(Ok(line)) if line.trim() == "READY" => {}
            Ok(Ok(line)) => bail!("detector did not signal ready, got: {:?}", line.trim()),
            Ok(Err(err)) => bail!("detector exited before signalling ready: {err}"),
            Err(RecvTimeoutError::Timeout) => {
                bail!("detector did not signal ready within {startup:?}")
            }
            Err(RecvTimeoutError::Disconnected) => bail!("detector exited before signalling ready"),
        }
        log::info!("landmark detector ready");

        Ok(detector)
    }

    fn scaled(&mut self, frame: &Frame) -> Result<Option<(u32, u32, Vec<u8>)>> {
        let (width, height) =
            target_size(frame.width, frame.height, self.max_size.0, self.max_size.1);
        if (width, height) == (frame.width, frame.height) {
            return Ok(None);
        }

        let src = ImageRef::new(frame.width, frame.height, &frame.rgba, PixelType::U8x4)?;
        let mut dst = Image::new(width, height, PixelType::U8x4);
        self.resizer.resize(&src, &mut dst, None)?;
        Ok(Some((width, height, dst.into_vec())))
    }

    /// After a timeout the reply stream can no longer be matched to frames,
    /// so the helper is not reused.
    fn fail(&mut self) {
        self.broken = true;
        kill(&self.process);
    }
}

impl LandmarkDetector for SubprocessDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Vec<[f32; 3]>>> {
        if self.broken {
            bail!("detector process is no longer running");
        }

        let scaled = self.scaled(frame)?;
        let (width, height, pixels) = match &scaled {
            Some((width, height, pixels)) => (*width, *height, pixels.as_slice()),
            None => (frame.width, frame.height, frame.rgba.as_slice()),
        };

        let mut request = Vec::with_capacity(12 + pixels.len());
        request.extend_from_slice(&width.to_le_bytes());
        request.extend_from_slice(&height.to_le_bytes());
        request.extend_from_slice(&4u32.to_le_bytes());
        request.extend_from_slice(pixels);
        if self.requests.send(request).is_err() {
            self.fail();
            bail!("detector process is no longer running");
        }

        let exchange = select! {
            recv(self.replies) -> reply => Exchange::Reply(reply.unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "detector exchange closed"))
            })),
            recv(self.cancel_rx) -> _ => Exchange::Cancelled,
            default(self.reply_timeout) => Exchange::TimedOut,
        };

        match exchange {
            Exchange::Reply(Ok(line)) => parse_reply(&line, self.min_confidence),
            Exchange::Reply(Err(err)) => {
                self.fail();
                Err(err).context("detector exchange failed")
            }
            Exchange::Cancelled => {
                self.fail();
                bail!("detector was cancelled")
            }
            Exchange::TimedOut => {
                self.fail();
                bail!("detector did not answer within {:?}", self.reply_timeout)
            }
        }
    }

    fn canceller(&self) -> Option<Canceller> {
        let process = self.process.clone();
        let cancel = self.cancel_tx.clone();
        Some(Box::new(move || {
            kill(&process);
            let _ = cancel.try_send(());
        }))
    }
}

impl Drop for SubprocessDetector {
    fn drop(&mut self) {
        let mut child = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_confident_hand_wins() {
        let line = r#"{"hands": [
            {"score": 0.4, "landmarks": [{"x": 0.9, "y": 0.9, "z": 0.0}]},
            {"score": 0.8, "landmarks": [{"x": 0.1, "y": 0.2, "z": -0.3}]}
        ]}"#;
        let points = parse_reply(line, 0.7).unwrap().unwrap();
        assert_eq!(points, vec![[0.1, 0.2, -0.3]]);
    }

    #[test]
    fn no_hands_or_weak_hands_mean_absent() {
        assert_eq!(parse_reply(r#"{"hands": []}"#, 0.5).unwrap(), None);
        let weak = r#"{"hands": [{"score": 0.2, "landmarks": []}]}"#;
        assert_eq!(parse_reply(weak, 0.5).unwrap(), None);
    }

    #[test]
    fn reported_errors_and_garbage_fail() {
        assert!(parse_reply(r#"{"hands": [], "error": "model missing"}"#, 0.5).is_err());
        assert!(parse_reply("Traceback (most recent call last):", 0.5).is_err());
    }

    #[test]
    fn frames_are_only_ever_downscaled() {
        assert_eq!(target_size(1280, 720, 640, 480), (640, 360));
        assert_eq!(target_size(320, 240, 640, 480), (320, 240));
        assert_eq!(target_size(1920, 1080, 0, 0), (1920, 1080));
    }

    #[test]
    fn empty_command_is_rejected() {
        let config = DetectorConfig {
            command: Vec::new(),
            ..DetectorConfig::default()
        };
        let err = SubprocessDetectorFactory::new(config).create().err().unwrap();
        assert!(err.to_string().contains("not configured"));
    }

    #[cfg(unix)]
    mod helper_process {
        use std::time::{Duration, Instant};

        use super::*;

        fn shell(script: &str, reply_timeout_ms: u64) -> DetectorConfig {
            DetectorConfig {
                command: vec!["sh".into(), "-c".into(), script.into()],
                startup_timeout_ms: 300,
                reply_timeout_ms,
                ..DetectorConfig::default()
            }
        }

        fn frame() -> Frame {
            Frame {
                rgba: vec![0; 64 * 48 * 4],
                width: 64,
                height: 48,
                timestamp: Instant::now(),
            }
        }

        #[test]
        fn helper_that_never_signals_ready_fails_to_start() {
            let started = Instant::now();
            let err = SubprocessDetector::spawn(&shell("exec sleep 30", 1_000))
                .err()
                .unwrap();
            assert!(err.to_string().contains("ready"), "{err:#}");
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn silent_helper_times_out_and_is_not_reused() {
            let mut detector =
                SubprocessDetector::spawn(&shell("echo READY; exec cat >/dev/null", 200)).unwrap();

            let started = Instant::now();
            let err = detector.detect(&frame()).unwrap_err();
            assert!(err.to_string().contains("did not answer"), "{err:#}");
            assert!(started.elapsed() < Duration::from_secs(5));

            let err = detector.detect(&frame()).unwrap_err();
            assert!(err.to_string().contains("no longer running"), "{err:#}");
        }

        #[test]
        fn answering_helper_reports_landmarks() {
            let script = r#"echo READY; head -c 12300 >/dev/null; echo '{"hands": [{"score": 0.9, "landmarks": [{"x": 0.5, "y": 0.25, "z": 0.0}]}]}'; exec cat >/dev/null"#;
            let mut detector = SubprocessDetector::spawn(&shell(script, 5_000)).unwrap();
            let points = detector.detect(&frame()).unwrap().unwrap();
            assert_eq!(points, vec![[0.5, 0.25, 0.0]]);
        }

        #[test]
        fn canceller_interrupts_a_pending_detect() {
            let mut detector =
                SubprocessDetector::spawn(&shell("echo READY; sleep 30", 60_000)).unwrap();
            let cancel = detector.canceller().unwrap();

            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            let worker = std::thread::spawn(move || {
                let result = detector.detect(&frame());
                let _ = done_tx.send(result.is_err());
            });

            std::thread::sleep(Duration::from_millis(100));
            cancel();
            assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok(true));
            worker.join().unwrap();
        }
    }
}
