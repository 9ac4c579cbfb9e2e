//! V4L2 still capture using the v4l crate.

use image::RgbImage;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as _;
use v4l::video::Capture as _;
use v4l::{Device, FourCC};

use crate::config::CaptureConfig;
use crate::error::{GateError, Result};
use crate::traits::FrameSource;

const YUYV: FourCC = FourCC { repr: *b"YUYV" };
const BUFFER_COUNT: u32 = 4;

/// Camera opened for each capture and released right after.
pub struct V4L2Camera {
    index: u32,
    width: u32,
    height: u32,
    warmup_frames: u32,
}

impl V4L2Camera {
    /// Camera for `/dev/video<device_index>`.
    pub const fn new(config: &CaptureConfig) -> Self {
        Self {
            index: config.device_index,
            width: config.width,
            height: config.height,
            warmup_frames: config.warmup_frames,
        }
    }
}

fn capture_error(context: &str, err: &std::io::Error) -> GateError {
    GateError::CaptureFailure(format!("{context}: {err}"))
}

impl FrameSource for V4L2Camera {
    fn capture(&self) -> Result<RgbImage> {
        let device = Device::new(self.index as usize)
            .map_err(|err| capture_error(&format!("open /dev/video{}", self.index), &err))?;

        let mut fmt = device
            .format()
            .map_err(|err| capture_error("query format", &err))?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = YUYV;
        let fmt = device
            .set_format(&fmt)
            .map_err(|err| capture_error("set format", &err))?;
        if fmt.fourcc != YUYV {
            return Err(GateError::CaptureFailure(format!(
                "camera does not support YUYV (got {})",
                String::from_utf8_lossy(&fmt.fourcc.repr)
            )));
        }

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| capture_error("start stream", &err))?;
        for _ in 0..self.warmup_frames {
            stream
                .next()
                .map_err(|err| capture_error("warm-up frame", &err))?;
        }
        let (buf, meta) = stream
            .next()
            .map_err(|err| capture_error("capture frame", &err))?;
        let used = buf.get(..meta.bytesused as usize).unwrap_or(buf);

        yuyv_to_rgb(used, fmt.width, fmt.height, fmt.stride)
    }
}

/// Convert a packed YUYV (4:2:2) frame to RGB.
///
/// Each 4-byte group `[Y0 U Y1 V]` encodes two horizontally adjacent pixels
/// sharing chroma. `stride` is the byte length of one row.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32, stride: u32) -> Result<RgbImage> {
    let stride = if stride == 0 { width * 2 } else { stride };
    let mut image = RgbImage::new(width, height);
    for y in 0..height {
        for x in (0..width).step_by(2) {
            let offset = (y * stride + x * 2) as usize;
            let Some(&[y0, u, y1, v]) = data.get(offset..offset + 4) else {
                return Err(GateError::CaptureFailure(format!(
                    "frame truncated at row {y} ({} bytes)",
                    data.len()
                )));
            };
            let (r, g, b) = yuv_to_rgb(y0, u, v);
            image.put_pixel(x, y, image::Rgb([r, g, b]));
            if x + 1 < width {
                let (r, g, b) = yuv_to_rgb(y1, u, v);
                image.put_pixel(x + 1, y, image::Rgb([r, g, b]));
            }
        }
    }
    Ok(image)
}

/// Convert YUV values to RGB using ITU-R BT.601.
#[allow(clippy::many_single_char_names)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}
