//! Recognition pipeline boundary: frame persistence, plate preprocessing,
//! deadlines around external calls, and adapters for external detector and
//! OCR programs.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat, Luma, RgbImage};
use tracing::{info, warn};
use wait_timeout::ChildExt as _;

use crate::error::{GateError, Result};
use crate::traits::{BoundingBox, PlateDetector, PlateReader};

/// Run `work` on a helper thread and give up after `limit`.
///
/// On expiry the helper is abandoned; its result is discarded when it
/// eventually finishes.
pub fn with_deadline<T, F>(stage: &'static str, limit: Duration, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name(format!("{stage}-worker"))
        .spawn(move || {
            let _ = tx.send(work());
        })?;
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(GateError::Deadline { stage, limit }),
        Err(RecvTimeoutError::Disconnected) => Err(GateError::Recognition(format!(
            "{stage} worker exited without a result"
        ))),
    }
}

/// Path for a frame captured at `at`: `image_<DDMMYYYY>_<HHMMSS>_<mmm>.jpg`.
pub fn frame_path(dir: &Path, at: &DateTime<Local>) -> PathBuf {
    dir.join(format!("image_{}.jpg", at.format("%d%m%Y_%H%M%S_%3f")))
}

/// Write a captured frame under `dir`, creating it if needed.
pub fn save_frame(frame: &RgbImage, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = frame_path(dir, &Local::now());
    frame.save(&path)?;
    info!(path = %path.display(), "Image saved");
    Ok(path)
}

/// Crop the plate, upscale it 2x with a cubic filter and binarize it.
pub fn preprocess_plate(
    frame: &RgbImage,
    region: &BoundingBox,
    threshold: u8,
) -> Result<GrayImage> {
    let (x, y, width, height) = region
        .clamp_to(frame.width(), frame.height())
        .ok_or(GateError::NoRegionDetected)?;
    let gray = imageops::grayscale(frame);
    let cropped = imageops::crop_imm(&gray, x, y, width, height).to_image();
    let mut scaled = imageops::resize(&cropped, width * 2, height * 2, FilterType::CatmullRom);
    for pixel in scaled.pixels_mut() {
        *pixel = Luma([if pixel.0[0] > threshold { 255 } else { 0 }]);
    }
    Ok(scaled)
}

fn substitute(args: &[String], replacements: &[(&str, &str)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            replacements
                .iter()
                .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect()
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        buffer
    })
}

/// Run `argv` and return its stdout. The process is killed if it is still
/// running after `limit`.
fn run_program(argv: &[String], stage: &'static str, limit: Duration) -> Result<String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| GateError::Config(format!("{stage} command is empty")))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| GateError::Recognition(format!("{stage}: failed to run {program}: {err}")))?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let Some(status) = child.wait_timeout(limit)? else {
        warn!(stage, program = %program, ?limit, "External program overran, killing it");
        if let Err(err) = child.kill() {
            warn!(stage, "Cannot kill {program}: {err}");
        }
        child.wait()?;
        return Err(GateError::Deadline { stage, limit });
    };
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();
    if !status.success() {
        return Err(GateError::Recognition(format!(
            "{stage}: {program} exited with {status}: {}",
            String::from_utf8_lossy(&stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Plate detector delegating to an external program.
///
/// The program receives the frame path and the confidence threshold through
/// `{image}` and `{confidence}` placeholders and prints a JSON array of
/// `[x1, y1, x2, y2]` boxes, best first.
pub struct CommandDetector {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandDetector {
    /// Detector running `argv`, killed after `timeout`.
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            return Err(GateError::Config(
                "recognition.detector_command must not be empty".to_owned(),
            ));
        }
        Ok(Self { argv, timeout })
    }
}

impl PlateDetector for CommandDetector {
    fn detect(&self, image_path: &Path, confidence: f32) -> Result<Vec<BoundingBox>> {
        let image = image_path.to_string_lossy();
        let confidence = confidence.to_string();
        let argv = substitute(
            &self.argv,
            &[("{image}", image.as_ref()), ("{confidence}", confidence.as_str())],
        );
        let stdout = run_program(&argv, "detector", self.timeout)?;
        let boxes: Vec<[f32; 4]> = serde_json::from_str(stdout.trim())
            .map_err(|err| GateError::Recognition(format!("detector output: {err}")))?;
        Ok(boxes
            .into_iter()
            .map(|[x1, y1, x2, y2]| BoundingBox::new(x1, y1, x2, y2))
            .collect())
    }
}

/// OCR delegating to an external program.
///
/// The preprocessed plate is written to a temporary PNG passed through the
/// `{image}` placeholder; every non-empty output line is one candidate.
/// The file is removed once the program has finished.
pub struct CommandReader {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandReader {
    /// Reader running `argv`, killed after `timeout`.
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            return Err(GateError::Config(
                "recognition.ocr_command must not be empty".to_owned(),
            ));
        }
        Ok(Self { argv, timeout })
    }
}

impl PlateReader for CommandReader {
    fn read_text(&self, plate: &GrayImage) -> Result<Vec<String>> {
        let file = tempfile::Builder::new()
            .prefix("smart-gate-plate-")
            .suffix(".png")
            .tempfile()?;
        plate
            .save_with_format(file.path(), ImageFormat::Png)
            .map_err(|err| GateError::Recognition(format!("write plate image: {err}")))?;
        let image = file.path().to_string_lossy().into_owned();
        let stdout = run_program(
            &substitute(&self.argv, &[("{image}", &image)]),
            "ocr",
            self.timeout,
        )?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

/// Tesseract OCR via leptess.
#[cfg(feature = "ocr")]
pub struct TesseractReader {
    tessdata: Option<String>,
}

#[cfg(feature = "ocr")]
impl TesseractReader {
    /// Reader using `tessdata`, or the system default when `None`.
    pub fn new(tessdata: Option<&Path>) -> Self {
        Self {
            tessdata: tessdata.map(|path| path.to_string_lossy().into_owned()),
        }
    }
}

#[cfg(feature = "ocr")]
impl PlateReader for TesseractReader {
    #[allow(clippy::cast_possible_wrap)]
    fn read_text(&self, plate: &GrayImage) -> Result<Vec<String>> {
        let (width, height) = plate.dimensions();
        if width == 0 || height == 0 {
            return Err(GateError::Recognition("empty plate image".to_owned()));
        }
        let mut engine = leptess::LepTess::new(self.tessdata.as_deref(), "eng")
            .map_err(|err| GateError::Recognition(format!("tesseract init: {err}")))?;
        engine
            .set_image_from_mem(plate.as_raw(), width as i32, height as i32, 1, width as i32)
            .map_err(|_| GateError::Recognition("tesseract image setup failed".to_owned()))?;
        let text = engine
            .get_utf8_text()
            .map_err(|err| GateError::Recognition(format!("tesseract: {err}")))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }
}
