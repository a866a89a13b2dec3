//! Glue: loads or builds the File Tree, walks it in parallel feeding
//! the photo pipeline into the Similarity Builder, queries the
//! finalised search, and emits a report. This module captures the
//! policy decisions the rest of the crate doesn't — cache load/build
//! precedence, what counts as fatal, and the shape of the parallel
//! ingest loop.

use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::counters::{Counters, Op};
use crate::error::AnalysisError;
use crate::file_tree::{Element, FileTree};
use crate::image_loader::{Image, ImageHashAlg};
use crate::photo::Photo;
use crate::progress::{ProgressCounters, Spinner};
use crate::report::{Report, SimilarEntry};
use crate::similarity::{PhotoId, SimilarityBuilder};

pub struct RunOptions {
    pub photos_path: Utf8PathBuf,
    pub cache_file: Utf8PathBuf,
    pub analyze_duplicates: bool,
    pub check_similars: Vec<Utf8PathBuf>,
    pub threads: usize,
    pub threshold: f64,
    pub max_k: usize,
}

/// Loads the cache if it exists and its stored root matches
/// `photos_path`; otherwise (missing, corrupt, or root-mismatched)
/// walks the filesystem fresh. A directory that doesn't exist is the
/// one condition that aborts the whole analysis.
fn load_or_build_tree(photos_path: &Utf8Path, cache_file: &Utf8Path) -> Result<FileTree> {
    if !photos_path.is_dir() {
        bail!(AnalysisError::NotADirectory(photos_path.to_path_buf()));
    }
    let canonical_root = photos_path
        .canonicalize_utf8()
        .with_context(|| format!("failed to canonicalize {photos_path}"))?;

    match File::open(cache_file) {
        Ok(file) => {
            let mut reader = BufReader::new(file);
            match FileTree::from_stream(&mut reader) {
                Ok(tree) if tree.root() == canonical_root => {
                    info!("loaded cache from {cache_file}");
                    Ok(tree)
                }
                Ok(tree) => {
                    let mismatch = AnalysisError::CacheRootMismatch {
                        expected: canonical_root.clone(),
                        found: tree.root().to_path_buf(),
                    };
                    warn!("{mismatch}, rebuilding");
                    FileTree::build(photos_path)
                }
                Err(e) => {
                    warn!("{} ({e:#}), rebuilding", AnalysisError::CacheCorrupt);
                    FileTree::build(photos_path)
                }
            }
        }
        Err(_) => {
            info!("no cache file at {cache_file}, walking {photos_path}");
            FileTree::build(photos_path)
        }
    }
}

/// Writes `tree` to `cache_file` atomically: serialised to a temporary
/// file beside the destination, then renamed into place, so a crash
/// mid-write never corrupts a previously good cache.
fn write_cache(tree: &FileTree, cache_file: &Utf8Path) -> Result<()> {
    let dir = cache_file.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file next to {cache_file}"))?;
    tree.to_stream(&mut tmp)
        .context("failed to serialise the file tree")?;
    tmp.persist(cache_file)
        .with_context(|| format!("failed to rename cache into place at {cache_file}"))?;
    Ok(())
}

/// Attempts to ingest one element into the similarity builder: loads
/// it as a Photo, ensures both perceptual hashes are available
/// (reading from cache or decoding), persists anything newly computed,
/// and if successful registers it with `builder` and `photo_by_id`.
/// Image decoding — the expensive part — happens without holding
/// `tree`'s lock.
fn ingest_element(
    tree: &Mutex<FileTree>,
    builder: &SimilarityBuilder,
    photo_by_id: &Mutex<Vec<(PhotoId, Element)>>,
    element: Element,
    counters: &Counters,
    progress: &ProgressCounters,
) {
    progress.walked.fetch_add(1, Ordering::Relaxed);

    let photo = {
        let mut guard = tree.lock().expect("file tree mutex poisoned");
        Photo::load(&mut guard, element)
    };
    counters.bump(Op::FilesWalked);

    let Some(photo) = photo else {
        progress.errors.fetch_add(1, Ordering::Relaxed);
        progress.processed.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let mut avg_hash = {
        let guard = tree.lock().expect("file tree mutex poisoned");
        photo.cached_image_hash(&guard, ImageHashAlg::AverageHash)
    };
    let had_cached_avg = avg_hash.is_some();
    if avg_hash.is_none() {
        match photo.decode_and_hash(ImageHashAlg::AverageHash) {
            Ok(h) => {
                avg_hash = Some(h);
                counters.bump(Op::HashesComputed);
                counters.bump(Op::ImagesDecoded);
            }
            Err(e) => {
                warn!("failed to decode {}: {e:#}", photo.path());
                counters.bump(Op::DecodeFailures);
            }
        }
    } else {
        counters.bump(Op::CacheHashHits);
    }

    let mut p_hash = {
        let guard = tree.lock().expect("file tree mutex poisoned");
        photo.cached_image_hash(&guard, ImageHashAlg::PHash)
    };
    let had_cached_phash = p_hash.is_some();
    if p_hash.is_none() {
        match photo.decode_and_hash(ImageHashAlg::PHash) {
            Ok(h) => {
                p_hash = Some(h);
                counters.bump(Op::HashesComputed);
            }
            Err(e) => {
                // The image was already decoded successfully while
                // computing the average hash above (or this call itself
                // just decoded it); a failure here means the decode
                // step failed, since hash computation over an already
                // loaded image can't fail on its own.
                warn!("failed to decode {}: {e:#}", photo.path());
                counters.bump(Op::DecodeFailures);
            }
        }
    } else {
        counters.bump(Op::CacheHashHits);
    }

    let mut guard = tree.lock().expect("file tree mutex poisoned");
    if let Some(h) = avg_hash {
        if !had_cached_avg {
            photo.persist_image_hash(&mut guard, ImageHashAlg::AverageHash, h);
        }
    }
    if let Some(h) = p_hash {
        if !had_cached_phash {
            photo.persist_image_hash(&mut guard, ImageHashAlg::PHash, h);
        }
    }

    if avg_hash.is_none() || p_hash.is_none() {
        photo.mark_error(&mut guard);
        counters.bump(Op::HashFailures);
        progress.errors.fetch_add(1, Ordering::Relaxed);
        progress.processed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    // Only worth fetching when this pass actually decoded the image
    // (a cache hit on both hashes never touches the pixel buffer, and
    // EXIF text isn't persisted, so there's nothing cheap to reuse).
    let decoded_this_pass = !had_cached_avg || !had_cached_phash;
    if decoded_this_pass {
        if let Some(metadata) = photo.get_metadata(&mut guard) {
            if !metadata.is_empty() {
                debug!("{} carries {} EXIF field(s)", photo.path(), metadata.len());
            }
        }
    }

    let id = builder.add_photo(&mut guard, &photo);
    drop(guard);

    if id != crate::similarity::NO_PHOTO_ID {
        photo_by_id
            .lock()
            .expect("photo-by-id mutex poisoned")
            .push((id, photo.element().clone()));
    }
    progress.processed.fetch_add(1, Ordering::Relaxed);
}

/// Runs the full analysis described in the driver's spec: cache
/// load/build, parallel ingest, duplicate and similarity queries,
/// cache write-back. Returns the finished report; callers decide where
/// to write it.
pub fn run(opts: RunOptions) -> Result<Report> {
    let tree = load_or_build_tree(&opts.photos_path, &opts.cache_file)?;

    let mut elements: Vec<Element> = tree.iter().collect();
    // The root directory itself is never a photo.
    elements.retain(|e| e.node_type == crate::path_graph::NodeType::File);

    let counters = Counters::new();
    let progress_counters = Arc::new(ProgressCounters::default());
    let spinner = Spinner::start(elements.len(), progress_counters.clone());

    let builder = SimilarityBuilder::new();
    let tree_mutex = Mutex::new(tree);
    let photo_by_id: Mutex<Vec<(PhotoId, Element)>> = Mutex::new(Vec::new());
    let work_queue = Mutex::new(elements.into_iter());

    let thread_count = opts.threads.max(1);
    std::thread::scope(|scope| {
        for _ in 0..thread_count {
            scope.spawn(|| loop {
                let next = work_queue.lock().expect("work queue mutex poisoned").next();
                let Some(element) = next else { break };
                ingest_element(
                    &tree_mutex,
                    &builder,
                    &photo_by_id,
                    element,
                    &counters,
                    &progress_counters,
                );
            });
        }
    });

    drop(spinner);
    counters.log_counts();

    let tree = tree_mutex.into_inner().expect("file tree mutex poisoned");
    let photo_by_id = photo_by_id.into_inner().expect("photo-by-id mutex poisoned");
    let path_by_id: std::collections::HashMap<PhotoId, Utf8PathBuf> = photo_by_id
        .into_iter()
        .map(|(id, element)| (id, element.path))
        .collect();

    let search = builder.build();

    let mut report = Report::default();

    if opts.analyze_duplicates {
        for group in search.get_duplicated_photos() {
            let mut paths: Vec<String> = group
                .into_iter()
                .filter_map(|id| path_by_id.get(&id).map(|p| p.to_string()))
                .collect();
            paths.sort();
            report.duplicates.push(paths);
        }
    }

    for query_path in &opts.check_similars {
        let entries = match Image::load(query_path.as_std_path()) {
            Ok(image) => {
                let hash = image.get_image_hash(ImageHashAlg::PHash);
                search
                    .get_similars_of_hash(hash, opts.threshold, opts.max_k)
                    .into_iter()
                    .filter_map(|(id, hamming)| {
                        path_by_id.get(&id).map(|path| SimilarEntry {
                            path: path.to_string(),
                            similarity: hamming,
                        })
                    })
                    .collect()
            }
            Err(e) => {
                warn!("couldn't load query image {query_path}: {e:#}");
                Vec::new()
            }
        };
        report.similars.insert(query_path.to_string(), entries);
    }

    if let Err(e) = write_cache(&tree, &opts.cache_file) {
        warn!("failed to write cache to {}: {e:#}", opts.cache_file);
    }

    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use image::{DynamicImage, GenericImage, Rgba};

    fn utf8(p: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(p.to_path_buf()).unwrap()
    }

    fn write_solid_image(path: &std::path::Path, value: u8) {
        let mut img = DynamicImage::new_rgb8(24, 24);
        for y in 0..24 {
            for x in 0..24 {
                img.put_pixel(x, y, Rgba([value, value, value, 255]));
            }
        }
        img.save(path).unwrap();
    }

    fn opts(photos_path: Utf8PathBuf, cache_file: Utf8PathBuf) -> RunOptions {
        RunOptions {
            photos_path,
            cache_file,
            analyze_duplicates: true,
            check_similars: Vec::new(),
            threads: 2,
            threshold: 0.8,
            max_k: 100,
        }
    }

    #[test]
    fn empty_directory_yields_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let cache = utf8(dir.path()).join("cache");
        let report = run(opts(utf8(dir.path()), cache)).unwrap();
        assert!(report.duplicates.is_empty());
    }

    #[test]
    fn exact_duplicate_detection_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            write_solid_image(&dir.path().join(name), 128);
        }
        write_solid_image(&dir.path().join("unique.png"), 10);

        let cache = utf8(dir.path()).join("cache");
        let report = run(opts(utf8(dir.path()), cache)).unwrap();

        assert_eq!(report.duplicates.len(), 1);
        assert_eq!(report.duplicates[0].len(), 3);
    }

    #[test]
    fn cache_is_reused_on_second_run() {
        let dir = tempfile::tempdir().unwrap();
        write_solid_image(&dir.path().join("a.png"), 42);
        let cache = utf8(dir.path()).join("cache");

        let first = run(opts(utf8(dir.path()), cache.clone())).unwrap();
        assert!(cache.exists());
        let second = run(opts(utf8(dir.path()), cache)).unwrap();
        assert_eq!(first.to_json_pretty().unwrap(), second.to_json_pretty().unwrap());
    }

    #[test]
    fn nonexistent_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = utf8(dir.path()).join("does-not-exist");
        let cache = utf8(dir.path()).join("cache");
        assert!(run(opts(bogus, cache)).is_err());
    }
}
