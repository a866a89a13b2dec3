//! Decodes an image file into pixel data plus a flattened metadata map,
//! and exposes the hash helpers over both the raw bytes and the
//! decoded pixels. Everything here is stateless with respect to the
//! Path Graph — persistence is the Photo layer's job.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, ImageReader};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::hash_primitives;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoHashAlg {
    Md5,
    Sha256,
}

impl CryptoHashAlg {
    pub fn name(self) -> &'static str {
        match self {
            CryptoHashAlg::Md5 => "MD5",
            CryptoHashAlg::Sha256 => "SHA256",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageHashAlg {
    AverageHash,
    PHash,
}

impl ImageHashAlg {
    pub fn name(self) -> &'static str {
        match self {
            ImageHashAlg::AverageHash => "AVERAGE_HASH",
            ImageHashAlg::PHash => "P_HASH",
        }
    }
}

pub struct Image {
    buffer: DynamicImage,
    metadata: FxHashMap<String, String>,
    keywords: Vec<String>,
}

impl Image {
    /// Decodes `path` fully. None of the decoder's own errors are
    /// fatal to the caller — they're surfaced as `Err` and the caller
    /// (Photo) turns that into a sticky error state.
    pub fn load(path: &Path) -> Result<Image> {
        let buffer = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?;
        let (metadata, keywords) = read_exif_metadata(path);
        Ok(Image { buffer, metadata, keywords })
    }

    /// Cheap probe: peeks at the file's header to guess its format
    /// without fully decoding the pixel data.
    pub fn check_path_is_image(path: &Path) -> bool {
        let Ok(reader) = ImageReader::open(path) else {
            return false;
        };
        match reader.with_guessed_format() {
            Ok(r) => r.format().is_some(),
            Err(_) => false,
        }
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn channels(&self) -> u32 {
        self.buffer.color().channel_count() as u32
    }

    pub fn metadata(&self) -> &FxHashMap<String, String> {
        &self.metadata
    }

    /// The `Keywords` EXIF field split on `;` into individual terms,
    /// with blank entries dropped. Empty if the field was absent.
    /// [`metadata`](Self::metadata) carries the same data flattened
    /// back to a single `;`-joined string, as every other field does.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.buffer
    }

    /// Hex-encoded digest over the raw file bytes, streamed.
    pub fn get_hash(path: &Path, alg: CryptoHashAlg) -> Result<String> {
        match alg {
            CryptoHashAlg::Md5 => hash_primitives::md5_hex(path),
            CryptoHashAlg::Sha256 => hash_primitives::sha256_hex(path),
        }
    }

    /// 8-byte perceptual hash over the decoded pixel buffer.
    pub fn get_image_hash(&self, alg: ImageHashAlg) -> [u8; 8] {
        match alg {
            ImageHashAlg::AverageHash => hash_primitives::average_hash(&self.buffer),
            ImageHashAlg::PHash => hash_primitives::p_hash(&self.buffer),
        }
    }
}

/// EXIF fields flattened to a string map, plus the `Keywords` field (if
/// present) also split out into an internal list. Absence of an EXIF
/// segment (common for PNG/WebP) is not an error — just empty results.
fn read_exif_metadata(path: &Path) -> (FxHashMap<String, String>, Vec<String>) {
    let mut out = FxHashMap::default();
    let mut keywords = Vec::new();

    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return (out, keywords),
    };
    let mut reader = BufReader::new(file);

    let exif = match exif::Reader::new().read_from_container(&mut reader) {
        Ok(e) => e,
        Err(e) => {
            debug!("no EXIF metadata in {}: {e}", path.display());
            return (out, keywords);
        }
    };

    for field in exif.fields() {
        let key = field.tag.to_string();
        let value = field.display_value().with_unit(&exif).to_string();

        if key.contains("Keyword") {
            keywords = split_keywords(&value);
            out.insert(key, keywords.join(";"));
            continue;
        }

        out.insert(key, value);
    }

    (out, keywords)
}

/// Splits a `;`-separated `Keywords` field into trimmed, non-empty
/// terms.
fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use image::{GenericImage, Rgba};

    fn write_test_png(path: &Path) {
        let mut img = DynamicImage::new_rgb8(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                img.put_pixel(x, y, Rgba([128, 64, 32, 255]));
            }
        }
        img.save(path).unwrap();
    }

    #[test]
    fn check_path_is_image_true_for_real_image_false_for_text() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("x.png");
        write_test_png(&image_path);
        assert!(Image::check_path_is_image(&image_path));

        let text_path = dir.path().join("x.txt");
        std::fs::write(&text_path, b"not an image").unwrap();
        assert!(!Image::check_path_is_image(&text_path));
    }

    #[test]
    fn load_exposes_dimensions_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("x.png");
        write_test_png(&image_path);

        let image = Image::load(&image_path).unwrap();
        assert_eq!(image.width(), 16);
        assert_eq!(image.height(), 16);

        let a = image.get_image_hash(ImageHashAlg::AverageHash);
        let b = image.get_image_hash(ImageHashAlg::PHash);
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
    }

    #[test]
    fn missing_exif_yields_empty_metadata_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("x.png");
        write_test_png(&image_path);
        let image = Image::load(&image_path).unwrap();
        assert!(image.metadata().is_empty());
        assert!(image.keywords().is_empty());
    }

    #[test]
    fn split_keywords_trims_and_drops_blanks() {
        assert_eq!(
            split_keywords("beach; sunset ;;family"),
            vec!["beach", "sunset", "family"]
        );
        assert_eq!(split_keywords(""), Vec::<String>::new());
    }
}
