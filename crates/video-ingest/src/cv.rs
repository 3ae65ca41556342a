//! OpenCV-backed source for cameras, RTSP streams, and video files.

use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};

use crate::{CaptureError, SourceFrame, VideoSource};

pub struct CvSource {
    capture: VideoCapture,
    frame: Mat,
}

impl CvSource {
    /// Open `uri` as a device index (`0`, `/dev/video0`), stream URL, or
    /// file path. Tries V4L before the generic backend for devices.
    pub fn open(uri: &str) -> Result<CvSource, CaptureError> {
        let capture = open_video_capture(uri)?;
        Ok(CvSource {
            capture,
            frame: Mat::default(),
        })
    }
}

impl VideoSource for CvSource {
    fn read_frame(&mut self) -> Result<SourceFrame, CaptureError> {
        let ok = self
            .capture
            .read(&mut self.frame)
            .map_err(|err| CaptureError::Read(err.to_string()))?;
        if !ok {
            return Err(CaptureError::Read("end of stream".into()));
        }

        let size = self
            .frame
            .size()
            .map_err(|err| CaptureError::Read(err.to_string()))?;
        if size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::Read("empty frame".into()));
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|err| CaptureError::Read(err.to_string()))?
            .to_vec();

        Ok(SourceFrame {
            data,
            width: size.width as u32,
            height: size.height as u32,
        })
    }
}

fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            if let Ok(cap) = VideoCapture::new(index, backend) {
                if cap.is_opened().unwrap_or(false) {
                    return Ok(cap);
                }
            }
        }
    }

    for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
        if let Ok(mut cap) = VideoCapture::from_file(uri, backend) {
            if cap.is_opened().unwrap_or(false) {
                // Keep the driver buffer shallow so frames stay fresh.
                let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
                return Ok(cap);
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}
