//! JSON-lines detection stream, one frame per line:
//!
//! ```text
//! {"frame": 12, "image": "frames/000012.jpg",
//!  "detections": [{"bbox": [735, 700, 790, 880], "confidence": 0.91, "class": "person", "tracker_id": 3}]}
//! ```
//!
//! `image` is optional and resolved against the stream file's directory.
//! Detections that are not people, have no tracker id, or carry an invalid
//! bbox or confidence are dropped.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{DetectionSource, TrackedFrame};
use crate::{BBox, Detection, ObjectClass};

#[derive(Debug, Deserialize)]
struct FrameLine {
    frame: Option<u64>,
    image: Option<PathBuf>,
    #[serde(default)]
    detections: Vec<DetectionLine>,
}

#[derive(Debug, Deserialize)]
struct DetectionLine {
    bbox: [f64; 4],
    confidence: f32,
    #[serde(default = "default_class")]
    class: String,
    tracker_id: Option<u64>,
}

fn default_class() -> String {
    "person".to_string()
}

pub struct JsonLinesSource {
    reader: Box<dyn BufRead + Send>,
    base_dir: Option<PathBuf>,
    line_no: u64,
    next_index: u64,
}

impl JsonLinesSource {
    /// `-` reads stdin; anything else is a file path.
    pub fn open(input: &str) -> Result<Self> {
        if input == "-" {
            return Ok(Self::from_reader(BufReader::new(std::io::stdin())));
        }
        let path = Path::new(input);
        let file =
            File::open(path).with_context(|| format!("open detection stream {}", path.display()))?;
        let mut source = Self::from_reader(BufReader::new(file));
        source.base_dir = path.parent().map(Path::to_path_buf);
        Ok(source)
    }

    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            base_dir: None,
            line_no: 0,
            next_index: 0,
        }
    }

    fn load_image(&self, image: &Path) -> Option<Arc<image::RgbImage>> {
        let path = match &self.base_dir {
            Some(dir) if image.is_relative() => dir.join(image),
            _ => image.to_path_buf(),
        };
        match image::open(&path) {
            Ok(img) => Some(Arc::new(img.into_rgb8())),
            Err(err) => {
                log::warn!(
                    "line {}: cannot load frame image {}: {}",
                    self.line_no,
                    path.display(),
                    err
                );
                None
            }
        }
    }

    fn convert(&self, raw: FrameLine) -> TrackedFrame {
        let index = raw.frame.unwrap_or(self.next_index);
        let detections = raw
            .detections
            .into_iter()
            .filter_map(|det| self.convert_detection(det))
            .collect();
        TrackedFrame {
            index,
            image: raw.image.as_deref().and_then(|p| self.load_image(p)),
            detections,
        }
    }

    fn convert_detection(&self, det: DetectionLine) -> Option<Detection> {
        if ObjectClass::from_label(&det.class) != ObjectClass::Person {
            log::debug!("line {}: skipping class `{}`", self.line_no, det.class);
            return None;
        }
        let Some(tracker_id) = det.tracker_id else {
            log::debug!("line {}: skipping untracked detection", self.line_no);
            return None;
        };
        let [x1, y1, x2, y2] = det.bbox.map(|v| v.round() as i32);
        let detection = BBox::new(x1, y1, x2, y2)
            .and_then(|bbox| Detection::person(bbox, det.confidence, tracker_id));
        match detection {
            Ok(detection) => Some(detection),
            Err(err) => {
                log::debug!("line {}: dropping detection: {}", self.line_no, err);
                None
            }
        }
    }
}

impl DetectionSource for JsonLinesSource {
    fn next_frame(&mut self) -> Result<Option<TrackedFrame>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self
                .reader
                .read_until(b'\n', &mut buf)
                .context("read detection stream")?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(err) => {
                    log::warn!("line {}: non-utf-8 frame skipped: {}", self.line_no, err);
                    continue;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<FrameLine>(trimmed) {
                Ok(raw) => {
                    let frame = self.convert(raw);
                    self.next_index = frame.index + 1;
                    return Ok(Some(frame));
                }
                Err(err) => {
                    log::warn!("line {}: malformed frame skipped: {}", self.line_no, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source(text: &str) -> JsonLinesSource {
        JsonLinesSource::from_reader(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn parses_frames_and_filters_detections() -> Result<()> {
        let mut src = source(concat!(
            r#"{"frame": 3, "detections": [{"bbox": [2, 2, 4, 4], "confidence": 0.9, "class": "person", "tracker_id": 1},"#,
            r#" {"bbox": [0, 0, 5, 5], "confidence": 0.8, "class": "car", "tracker_id": 2},"#,
            r#" {"bbox": [5, 5, 1, 1], "confidence": 0.8, "tracker_id": 3},"#,
            r#" {"bbox": [0, 0, 5, 5], "confidence": 0.8}]}"#,
            "\n\n",
            "not json\n",
            r#"{"detections": []}"#,
            "\n"
        ));
        let first = src.next_frame()?.expect("first frame");
        assert_eq!(first.index, 3);
        assert_eq!(first.detections.len(), 1);
        assert_eq!(first.detections[0].tracker_id, 1);
        assert!(first.image.is_none());

        let second = src.next_frame()?.expect("second frame");
        assert_eq!(second.index, 4);
        assert!(second.detections.is_empty());
        assert!(src.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn skips_lines_that_are_not_utf8() -> Result<()> {
        let mut bytes = b"\xff\xfe garbage\n".to_vec();
        bytes.extend_from_slice(br#"{"frame": 7, "detections": []}"#);
        bytes.push(b'\n');
        let mut src = JsonLinesSource::from_reader(Cursor::new(bytes));

        let frame = src.next_frame()?.expect("frame after corrupt line");
        assert_eq!(frame.index, 7);
        assert!(src.next_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn loads_relative_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        image::RgbImage::new(8, 6).save(dir.path().join("f0.jpg"))?;
        let stream = dir.path().join("stream.jsonl");
        std::fs::write(&stream, "{\"frame\": 0, \"image\": \"f0.jpg\", \"detections\": []}\n")?;
        let mut src = JsonLinesSource::open(stream.to_str().expect("utf-8 path"))?;
        let frame = src.next_frame()?.expect("frame");
        let image = frame.image.expect("image loaded");
        assert_eq!((image.width(), image.height()), (8, 6));
        Ok(())
    }
}
