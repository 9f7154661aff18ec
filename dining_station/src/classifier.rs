// THEORY:
// An ImageNet classifier run through OpenCV's DNN module. The network is an ONNX
// export (ResNet-50 by default) taking a 1x3x224x224 RGB blob normalised with the
// ImageNet channel means. OpenCV's `blob_from_image` only takes a single scale
// factor, so the per-channel standard deviations are folded into their mean
// (0.226). The label arithmetic (softmax, top-k) is shared with the library.

use opencv::{
    core::{Mat, Scalar, Size, CV_32F},
    dnn::{self, Net},
    prelude::*,
};
use pet_dining::core_modules::labels::{load_labels, softmax, top_k_indices};
use pet_dining::{DiningError, DiningResult};
use std::path::Path;
use std::sync::Mutex;

const INPUT_SIZE: i32 = 224;
const IMAGENET_MEAN: (f64, f64, f64) = (123.675, 116.28, 103.53);
const IMAGENET_STD: f64 = 0.226;

pub struct DnnImageClassifier {
    net: Mutex<Net>,
    labels: Vec<String>,
}

pub fn cv_error(e: opencv::Error) -> DiningError {
    DiningError::Classification(e.to_string())
}

impl DnnImageClassifier {
    pub fn load(model_path: &Path, labels_path: &Path) -> DiningResult<Self> {
        if !model_path.exists() {
            return Err(DiningError::ModelLoad(format!(
                "classifier model not found: {}",
                model_path.display()
            )));
        }
        let net = dnn::read_net_from_onnx(&model_path.to_string_lossy())
            .map_err(|e| DiningError::ModelLoad(e.to_string()))?;
        let labels = load_labels(labels_path)?;
        Ok(Self {
            net: Mutex::new(net),
            labels,
        })
    }

    /// Labels of the `k` most probable classes for a BGR frame, best first.
    pub fn top_labels(&self, frame: &Mat, k: usize) -> DiningResult<Vec<String>> {
        let blob = dnn::blob_from_image(
            frame,
            1.0 / (255.0 * IMAGENET_STD),
            Size::new(INPUT_SIZE, INPUT_SIZE),
            Scalar::new(IMAGENET_MEAN.0, IMAGENET_MEAN.1, IMAGENET_MEAN.2, 0.0),
            true,
            true,
            CV_32F,
        )
        .map_err(cv_error)?;

        let mut net = self
            .net
            .lock()
            .map_err(|_| DiningError::Classification("classifier lock poisoned".into()))?;
        net.set_input(&blob, "", 1.0, Scalar::default()).map_err(cv_error)?;
        let output = net.forward_single("").map_err(cv_error)?;
        let logits = output.data_typed::<f32>().map_err(cv_error)?;

        let probabilities = softmax(logits);
        Ok(top_k_indices(&probabilities, k)
            .into_iter()
            .filter_map(|index| self.labels.get(index).cloned())
            .collect())
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }
}
