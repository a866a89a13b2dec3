//! Ties one [`Element`] to a lazily decoded [`Image`] and the hashes
//! cached against it in the owning [`FileTree`]'s Path Graph. This is
//! the layer that turns "a file that might be a photo" into "a photo
//! with durable, reusable hash state".

use std::cell::RefCell;

use anyhow::Result;
use camino::Utf8Path;
use tracing::{debug, warn};

use crate::file_tree::{Element, FileTree};
use crate::image_loader::{CryptoHashAlg, Image, ImageHashAlg};
use crate::path_graph::Attribute;

/// Reserved metadata key under which the sticky lifecycle state lives.
/// Applications must not write to this key outside this module.
pub const STATE_KEY: &str = "_PHOTO_STATE_";

fn hash_key(alg: ImageHashAlg) -> String {
    format!("HASH_{}", alg.name())
}

/// Lifecycle of a photo's backing element, persisted as text under
/// [`STATE_KEY`]. Once `Error`, later runs never re-probe the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoState {
    NoInfo,
    Ok,
    Error,
}

impl PhotoState {
    fn as_str(self) -> &'static str {
        match self {
            PhotoState::NoInfo => "no_info",
            PhotoState::Ok => "ok",
            PhotoState::Error => "error",
        }
    }

    fn parse(s: &str) -> PhotoState {
        match s {
            "ok" => PhotoState::Ok,
            "error" => PhotoState::Error,
            _ => PhotoState::NoInfo,
        }
    }
}

fn get_state(tree: &FileTree, path: &Utf8Path) -> PhotoState {
    match tree.get_metadata(path, STATE_KEY) {
        Some(Attribute::Text(s)) => PhotoState::parse(s),
        _ => PhotoState::NoInfo,
    }
}

fn set_state(tree: &mut FileTree, path: &Utf8Path, state: PhotoState) {
    tree.set_metadata(path, STATE_KEY, Attribute::Text(state.as_str().to_string()));
}

/// A photo: an Element plus an on-demand decoded image. Transient —
/// constructed for the duration of one analysis pass over one file,
/// dropped (along with any decoded pixel buffer) once hashes have been
/// pulled out of it.
pub struct Photo {
    element: Element,
    image: RefCell<Option<Image>>,
}

impl Photo {
    /// Attempts to load `element` as a photo. Returns `None` without
    /// touching the filesystem if the element's state is already
    /// sticky-`Error`. Otherwise runs the cheap `check_path_is_image`
    /// probe; a negative result marks the element `Error` and returns
    /// `None`.
    pub fn load(tree: &mut FileTree, element: Element) -> Option<Photo> {
        if get_state(tree, &element.path) == PhotoState::Error {
            return None;
        }

        if !Image::check_path_is_image(element.path.as_std_path()) {
            set_state(tree, &element.path, PhotoState::Error);
            return None;
        }

        Some(Photo {
            element,
            image: RefCell::new(None),
        })
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn path(&self) -> &Utf8Path {
        &self.element.path
    }

    /// Decodes the backing file on first call; cached thereafter.
    /// Returns `None` (after marking the tree's state `Error`) if
    /// decoding fails.
    pub fn get_image(&self, tree: &mut FileTree) -> Option<()> {
        if self.image.borrow().is_some() {
            return Some(());
        }

        match Image::load(self.element.path.as_std_path()) {
            Ok(img) => {
                *self.image.borrow_mut() = Some(img);
                Some(())
            }
            Err(e) => {
                warn!("failed to decode {}: {e:#}", self.element.path);
                set_state(tree, &self.element.path, PhotoState::Error);
                None
            }
        }
    }

    /// True iff a hash under `alg` is already stashed in the tree's
    /// metadata for this element. Never decodes.
    pub fn is_image_hash_in_cache(&self, tree: &FileTree, alg: ImageHashAlg) -> bool {
        matches!(
            tree.get_metadata(&self.element.path, &hash_key(alg)),
            Some(Attribute::Matrix { .. })
        )
    }

    /// Returns the perceptual hash under `alg`, pulling it from the
    /// tree's cached metadata if present, else decoding and computing
    /// it (and persisting the result). `None` on decode or computation
    /// failure, after marking the state `Error`.
    ///
    /// This is the single-threaded convenience path (used by tests and
    /// by the sequential report-generation queries); the parallel
    /// ingest loop in [`crate::driver`] instead uses
    /// [`cached_image_hash`](Self::cached_image_hash),
    /// [`decode_and_hash`](Self::decode_and_hash) and
    /// [`persist_image_hash`](Self::persist_image_hash) directly, so
    /// that image decoding (the expensive part) happens without
    /// holding the tree's mutex.
    pub fn get_image_hash(&self, tree: &mut FileTree, alg: ImageHashAlg) -> Option<[u8; 8]> {
        if let Some(hash) = self.cached_image_hash(tree, alg) {
            return Some(hash);
        }

        match self.decode_and_hash(alg) {
            Ok(hash) => {
                self.persist_image_hash(tree, alg, hash);
                Some(hash)
            }
            Err(e) => {
                warn!("failed to hash {}: {e:#}", self.element.path);
                set_state(tree, &self.element.path, PhotoState::Error);
                None
            }
        }
    }

    /// Reads a previously persisted hash under `alg` from the tree's
    /// metadata, if present. Pure read; safe to call while holding a
    /// shared reference to a mutex-guarded tree only briefly.
    pub fn cached_image_hash(&self, tree: &FileTree, alg: ImageHashAlg) -> Option<[u8; 8]> {
        let key = hash_key(alg);
        if let Some(Attribute::Matrix { payload, .. }) = tree.get_metadata(&self.element.path, &key) {
            if payload.len() == 8 {
                let mut out = [0u8; 8];
                out.copy_from_slice(payload);
                return Some(out);
            }
        }
        None
    }

    /// Decodes (caching the decoded buffer on this `Photo`) and
    /// computes the perceptual hash under `alg`. Touches no tree state
    /// at all — safe to call without holding any lock, which is the
    /// whole point: this is the CPU/IO-heavy part the parallel driver
    /// runs outside its tree mutex.
    pub fn decode_and_hash(&self, alg: ImageHashAlg) -> Result<[u8; 8]> {
        if self.image.borrow().is_none() {
            let img = Image::load(self.element.path.as_std_path())?;
            *self.image.borrow_mut() = Some(img);
        }
        let borrowed = self.image.borrow();
        let image = borrowed.as_ref().expect("just ensured image is loaded");
        Ok(image.get_image_hash(alg))
    }

    /// Persists a freshly computed hash and marks the state `Ok`.
    pub fn persist_image_hash(&self, tree: &mut FileTree, alg: ImageHashAlg, hash: [u8; 8]) {
        tree.set_metadata(&self.element.path, &hash_key(alg), Attribute::bytes(hash.to_vec()));
        set_state(tree, &self.element.path, PhotoState::Ok);
    }

    /// Marks the backing element's state `Error`, e.g. after a decode
    /// or hash failure discovered outside the tree's lock.
    pub fn mark_error(&self, tree: &mut FileTree) {
        set_state(tree, &self.element.path, PhotoState::Error);
    }

    /// Hex digest of the raw file bytes under `alg`. Not cached in the
    /// Path Graph (the crypto hash isn't a reserved key this layer
    /// persists) — recomputed on every call, streamed from disk.
    pub fn get_crypto_hash(&self, alg: CryptoHashAlg) -> Result<String> {
        Image::get_hash(self.element.path.as_std_path(), alg)
    }

    /// EXIF-style metadata map, fetched from the decoded image.
    /// Deliberately not persisted into the Path Graph — cheap to
    /// re-derive on a cache hit, and keeps the graph's binary form
    /// small.
    pub fn get_metadata(&self, tree: &mut FileTree) -> Option<std::collections::HashMap<String, String>> {
        self.get_image(tree)?;
        let borrowed = self.image.borrow();
        let image = borrowed.as_ref().expect("just ensured image is loaded");
        Some(image.metadata().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Convenience used by the driver: loads both perceptual hashes for a
/// photo, logging (not failing) if either is unavailable.
pub fn both_perceptual_hashes(
    tree: &mut FileTree,
    photo: &Photo,
) -> Option<(u64, [u8; 8])> {
    use crate::hash_primitives::bytes_to_u64_be;

    let avg = photo.get_image_hash(tree, ImageHashAlg::AverageHash);
    let p = photo.get_image_hash(tree, ImageHashAlg::PHash);
    match (avg, p) {
        (Some(a), Some(p)) => Some((bytes_to_u64_be(a), p)),
        _ => {
            debug!("{} missing a perceptual hash, skipping similarity ingest", photo.path());
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image_loader::ImageHashAlg;
    use camino::Utf8PathBuf;
    use image::{DynamicImage, GenericImage, Rgba};

    fn utf8(p: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(p.to_path_buf()).unwrap()
    }

    fn write_test_image(path: &std::path::Path) {
        let mut img = DynamicImage::new_rgb8(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                img.put_pixel(x, y, Rgba([100, 150, 200, 255]));
            }
        }
        img.save(path).unwrap();
    }

    #[test]
    fn load_and_hash_round_trip_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("a.jpg");
        write_test_image(&image_path);

        let mut tree = crate::file_tree::FileTree::build(&utf8(dir.path())).unwrap();
        let element = tree.get_element(&utf8(&image_path)).unwrap();

        let photo = Photo::load(&mut tree, element.clone()).expect("should load as a photo");
        assert!(!photo.is_image_hash_in_cache(&tree, ImageHashAlg::AverageHash));

        let h1 = photo
            .get_image_hash(&mut tree, ImageHashAlg::AverageHash)
            .unwrap();
        assert!(photo.is_image_hash_in_cache(&tree, ImageHashAlg::AverageHash));

        // Second call should hit the cache, not decode again; same bytes.
        let h2 = photo
            .get_image_hash(&mut tree, ImageHashAlg::AverageHash)
            .unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn non_image_is_marked_error_and_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let text_path = dir.path().join("notes.txt");
        std::fs::write(&text_path, b"hello").unwrap();

        let mut tree = crate::file_tree::FileTree::build(&utf8(dir.path())).unwrap();
        let element = tree.get_element(&utf8(&text_path)).unwrap();

        assert!(Photo::load(&mut tree, element.clone()).is_none());
        assert_eq!(get_state(&tree, &element.path), PhotoState::Error);

        // Second attempt must not re-probe the file; still None.
        assert!(Photo::load(&mut tree, element).is_none());
    }

    #[test]
    fn get_metadata_decodes_and_returns_a_map_without_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("a.jpg");
        write_test_image(&image_path);

        let mut tree = crate::file_tree::FileTree::build(&utf8(dir.path())).unwrap();
        let element = tree.get_element(&utf8(&image_path)).unwrap();
        let photo = Photo::load(&mut tree, element).expect("should load as a photo");

        // A freshly-written JPEG with no EXIF segment yields an empty
        // map rather than an error.
        let metadata = photo.get_metadata(&mut tree).expect("decode should succeed");
        assert!(metadata.is_empty());
    }
}
