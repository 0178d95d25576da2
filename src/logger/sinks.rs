use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Cursor, Write};
use std::path::PathBuf;
use std::time::Duration;

use image::{ImageFormat, RgbImage};
use reqwest::blocking::Client;
use serde::Serialize;

use super::{MetricsSink, SinkError};

#[derive(Debug, Serialize)]
struct ScalarRecord<'a> {
    name: &'a str,
    value: f64,
    iteration: usize,
}

/// Appends scalars to `scalars.jsonl` and writes image grids to `images/`.
pub struct FileSink {
    root: PathBuf,
    scalars: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scalars: None,
        }
    }

    fn scalars(&mut self) -> Result<&mut BufWriter<File>, SinkError> {
        if self.scalars.is_none() {
            fs::create_dir_all(&self.root)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.root.join("scalars.jsonl"))?;
            self.scalars = Some(BufWriter::new(file));
        }
        self.scalars
            .as_mut()
            .ok_or_else(|| SinkError::Io(std::io::Error::other("scalar log unavailable")))
    }
}

/// Metric names contain `/` and spaces; keep file names flat.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

impl MetricsSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn scalar(&mut self, name: &str, value: f64, iteration: usize) -> Result<(), SinkError> {
        let record = ScalarRecord {
            name,
            value,
            iteration,
        };
        let writer = self.scalars()?;
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn image(&mut self, name: &str, image: &RgbImage, iteration: usize) -> Result<(), SinkError> {
        let dir = self.root.join("images");
        fs::create_dir_all(&dir)?;
        image.save(dir.join(format!("{}_{iteration:08}.png", file_stem(name))))?;
        Ok(())
    }
}

/// Posts scalars as JSON to `{base}/scalars` and uploads PNG grids to
/// `{base}/images/{name}/{iteration}`.
pub struct HttpSink {
    base: String,
    client: Client,
}

impl HttpSink {
    pub fn new(base: &str) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| SinkError::Http(err.to_string()))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl MetricsSink for HttpSink {
    fn name(&self) -> &str {
        "dashboard"
    }

    fn scalar(&mut self, name: &str, value: f64, iteration: usize) -> Result<(), SinkError> {
        let record = ScalarRecord {
            name,
            value,
            iteration,
        };
        let response = self
            .client
            .post(format!("{}/scalars", self.base))
            .json(&record)
            .send()
            .map_err(|err| SinkError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Http(response.status().to_string()));
        }
        Ok(())
    }

    fn image(&mut self, name: &str, image: &RgbImage, iteration: usize) -> Result<(), SinkError> {
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;
        let response = self
            .client
            .put(format!("{}/images/{}/{iteration}", self.base, file_stem(name)))
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png.into_inner())
            .send()
            .map_err(|err| SinkError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Http(response.status().to_string()));
        }
        Ok(())
    }
}
