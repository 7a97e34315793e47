//! Image re-encoding into the canonical output format (PNG).

use async_trait::async_trait;
use image::ImageFormat;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub const OUTPUT_EXTENSION: &str = "png";

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("source path has no file name: {0}")]
    InvalidSourceName(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("failed to encode png: {0}")]
    Encode(#[source] image::ImageError),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("conversion timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("conversion task aborted: {0}")]
    Aborted(String),

    #[error("conversion was abandoned before its output was written")]
    Cancelled,
}

#[async_trait]
pub trait Converter: Send + Sync {
    /// Converts the file at `source` and returns where the result was written.
    /// The source is never modified; on error no destination file is left behind.
    /// Dropping the future before it resolves must not leave one behind either.
    async fn convert(&self, source: &Path) -> Result<PathBuf, ConversionError>;
}

#[derive(Debug, Clone)]
pub struct PngConverter {
    output_dir: PathBuf,
}

impl PngConverter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `<output_dir>/<source stem>.png`
    pub fn destination_for(&self, source: &Path) -> Result<PathBuf, ConversionError> {
        destination_for(&self.output_dir, source)
    }
}

#[async_trait]
impl Converter for PngConverter {
    async fn convert(&self, source: &Path) -> Result<PathBuf, ConversionError> {
        let source = source.to_path_buf();
        let destination = self.destination_for(&source)?;
        let output_dir = self.output_dir.clone();

        // the blocking thread outlives this future when the caller gives up
        // (timeout); the guard revokes its right to publish the output
        let slot = OutputSlot::default();
        let guard = AbandonGuard(Some(slot.clone()));

        let converted = tokio::task::spawn_blocking(move || {
            convert_blocking(&source, &output_dir, &destination, &slot)?;
            Ok(destination)
        })
        .await
        .map_err(|e| ConversionError::Aborted(e.to_string()))?;

        guard.disarm();
        converted
    }
}

/// Shared between a conversion future and its blocking thread. Publishing
/// the output and abandoning it both happen under the lock, so either the
/// rename never runs or the abandon removes what it produced.
#[derive(Debug, Clone, Default)]
struct OutputSlot(Arc<Mutex<SlotState>>);

#[derive(Debug, Default)]
struct SlotState {
    abandoned: bool,
    published: Option<PathBuf>,
}

impl OutputSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, dir: &Path, destination: &Path, bytes: &[u8]) -> Result<(), ConversionError> {
        let mut state = self.lock();
        if state.abandoned {
            return Err(ConversionError::Cancelled);
        }
        write_atomically(dir, destination, bytes).map_err(|e| ConversionError::Write {
            path: destination.to_path_buf(),
            source: e,
        })?;
        state.published = Some(destination.to_path_buf());
        Ok(())
    }

    fn abandon(&self) {
        let mut state = self.lock();
        state.abandoned = true;
        if let Some(path) = state.published.take() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not remove abandoned output");
            }
        }
    }
}

/// Abandons the slot when dropped before [`AbandonGuard::disarm`].
struct AbandonGuard(Option<OutputSlot>);

impl AbandonGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.0.take() {
            slot.abandon();
        }
    }
}

pub fn destination_for(output_dir: &Path, source: &Path) -> Result<PathBuf, ConversionError> {
    let stem = source
        .file_stem()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConversionError::InvalidSourceName(source.to_path_buf()))?;

    let mut name = stem.to_os_string();
    name.push(".");
    name.push(OUTPUT_EXTENSION);
    Ok(output_dir.join(name))
}

fn convert_blocking(
    source: &Path,
    output_dir: &Path,
    destination: &Path,
    slot: &OutputSlot,
) -> Result<(), ConversionError> {
    let bytes = fs::read(source).map_err(|source_err| ConversionError::Read {
        path: source.to_path_buf(),
        source: source_err,
    })?;

    let img = image::load_from_memory(&bytes).map_err(ConversionError::Decode)?;

    let mut encoded = Vec::new();
    img.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(ConversionError::Encode)?;

    fs::create_dir_all(output_dir).map_err(|e| ConversionError::Write {
        path: output_dir.to_path_buf(),
        source: e,
    })?;

    slot.publish(output_dir, destination, &encoded)
}

/// Readers see either no file or the complete one: bytes go to a hidden temp
/// file in the same directory, which is renamed over `destination` after sync.
fn write_atomically(dir: &Path, destination: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let written = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, destination)
    })();

    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_jpeg(path: &Path, w: u32, h: u32) {
        let img = ImageBuffer::from_fn(w, h, |x, y| Rgb([(x * 20) as u8, (y * 20) as u8, 128]));
        img.save_with_format(path, ImageFormat::Jpeg).unwrap();
    }

    #[test]
    fn destination_swaps_extension_and_directory() {
        let dest = destination_for(Path::new("converted"), Path::new("uploads/cat.jpeg")).unwrap();
        assert_eq!(dest, PathBuf::from("converted/cat.png"));

        let dest = destination_for(Path::new("out"), Path::new("noext")).unwrap();
        assert_eq!(dest, PathBuf::from("out/noext.png"));
    }

    #[test]
    fn destination_requires_a_file_name() {
        assert!(matches!(
            destination_for(Path::new("out"), Path::new("/")),
            Err(ConversionError::InvalidSourceName(_))
        ));
    }

    #[tokio::test]
    async fn converts_jpeg_to_png_with_same_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("photo.jpg");
        write_jpeg(&source, 10, 10);
        let original = fs::read(&source).unwrap();

        let converter = PngConverter::new(dir.path().join("converted"));
        let dest = converter.convert(&source).await.unwrap();

        assert_eq!(dest, dir.path().join("converted").join("photo.png"));
        assert_eq!(
            image::ImageFormat::from_path(&dest).unwrap(),
            ImageFormat::Png
        );

        let decoded_src = image::open(&source).unwrap().to_rgb8();
        let decoded_out = image::load_from_memory_with_format(&fs::read(&dest).unwrap(), ImageFormat::Png)
            .unwrap()
            .to_rgb8();
        assert_eq!(decoded_out.dimensions(), (10, 10));
        assert_eq!(decoded_out, decoded_src);

        assert_eq!(fs::read(&source).unwrap(), original, "source must be untouched");
    }

    #[tokio::test]
    async fn truncated_input_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.jpg");
        write_jpeg(&source, 10, 10);
        let bytes = fs::read(&source).unwrap();
        fs::write(&source, &bytes[..100]).unwrap();

        let out_dir = dir.path().join("converted");
        let converter = PngConverter::new(&out_dir);
        let err = converter.convert(&source).await.unwrap_err();
        assert!(matches!(err, ConversionError::Decode(_)), "got {err:?}");

        assert!(!out_dir.join("broken.png").exists());
        let leftovers = fs::read_dir(&out_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn abandoned_slot_never_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("late.jpg");
        write_jpeg(&source, 8, 8);
        let out_dir = dir.path().join("converted");

        let slot = OutputSlot::default();
        slot.abandon();
        let err = convert_blocking(&source, &out_dir, &out_dir.join("late.png"), &slot).unwrap_err();

        assert!(matches!(err, ConversionError::Cancelled), "got {err:?}");
        let leftovers = fs::read_dir(&out_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn abandon_after_publish_removes_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raced.jpg");
        write_jpeg(&source, 8, 8);
        let out_dir = dir.path().join("converted");
        let dest = out_dir.join("raced.png");

        let slot = OutputSlot::default();
        convert_blocking(&source, &out_dir, &dest, &slot).unwrap();
        assert!(dest.exists());

        slot.abandon();
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dropped_conversion_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("big.jpg");
        write_jpeg(&source, 800, 800);
        let out_dir = dir.path().join("converted");
        let converter = PngConverter::new(&out_dir);

        let res = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            converter.convert(&source),
        )
        .await;
        assert!(res.is_err(), "conversion should not beat a 1ms deadline");

        // give the detached blocking thread time to finish its work
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        let leftovers = fs::read_dir(&out_dir).map(|d| d.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_source_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let converter = PngConverter::new(dir.path());
        let err = converter
            .convert(&dir.path().join("nope.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Read { .. }));
    }

    #[tokio::test]
    async fn reconverting_overwrites_with_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("again.jpg");
        write_jpeg(&source, 4, 6);

        let converter = PngConverter::new(dir.path().join("converted"));
        let first = converter.convert(&source).await.unwrap();
        let second = converter.convert(&source).await.unwrap();
        assert_eq!(first, second);

        let img = image::open(&second).unwrap();
        assert_eq!((img.width(), img.height()), (4, 6));
        let entries: Vec<_> = fs::read_dir(dir.path().join("converted"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1, "temp files must not linger: {entries:?}");
    }
}
