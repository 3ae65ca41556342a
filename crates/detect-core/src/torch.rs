//! TorchScript-backed [`Detector`] implementation.
//!
//! Loads an exported YOLO-style module and parses its `[1, channels, preds]`
//! output layout: per prediction `cx, cy, w, h, confidence[, class]`. Boxes
//! come back in the coordinate space of the submitted image.

use std::convert::TryFrom;
use std::path::Path;

use anyhow::{bail, Result};
use tch::{CModule, Kind, Tensor};

pub use tch::Device;

use crate::{BoundingBox, Detection, Detector, ImageView};

pub struct TorchDetector {
    module: CModule,
    device: Device,
    input_size: (i64, i64),
    class_names: Vec<String>,
    confidence_floor: f32,
}

impl TorchDetector {
    /// Load a TorchScript module and prepare it for the given device.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        class_names: Vec<String>,
    ) -> Result<Self> {
        let module = CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            class_names,
            confidence_floor: 0.1,
        })
    }

    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    /// Converts a BGR8 frame into a normalized RGB tensor at the module's
    /// input resolution.
    fn bgr_to_tensor(&self, image: ImageView<'_>) -> Result<Tensor> {
        let expected = (image.width as usize) * (image.height as usize) * 3;
        if image.data.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                image.data.len(),
                expected
            );
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(image.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([image.height as i64, image.width as i64, 3])
            .permute([2, 0, 1])
            .flip([0])
            .unsqueeze(0)
            / 255.0;

        Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
    }

    fn class_name(&self, class_id: i64) -> String {
        self.class_names
            .get(class_id.max(0) as usize)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

impl Detector for TorchDetector {
    fn detect(&mut self, image: ImageView<'_>) -> Result<Vec<Detection>> {
        let input = self.bgr_to_tensor(image)?;
        let output = self.module.forward_ts(&[input])?;
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,conf), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = image.width as f32 / in_w as f32;
        let scale_y = image.height as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < 5 {
                continue;
            }
            let confidence = row[4];
            if confidence < self.confidence_floor {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
            let bbox = BoundingBox::new(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            )
            .clamp_to(image.width, image.height);
            detections.push(Detection {
                class: self.class_name(class_id),
                confidence,
                bbox,
            });
        }

        Ok(detections)
    }
}
