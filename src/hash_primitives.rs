//! Pure hashing functions: streamed cryptographic digests over raw
//! file bytes, and the two perceptual hashes over a decoded pixel
//! buffer. None of these touch the Path Graph or any cache; callers
//! (the Image Loader, Photo) are responsible for persistence.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, imageops::FilterType};
use md5::{Digest, Md5};
use sha2::Sha256;

const STREAM_CHUNK: usize = 4096;

fn stream_digest<D: Digest>(path: &Path, mut digest: D) -> Result<D> {
    let mut file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = [0u8; STREAM_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest)
}

/// 32 lowercase hex characters.
pub fn md5_hex(path: &Path) -> Result<String> {
    let digest = stream_digest(path, Md5::new())?;
    Ok(data_encoding::HEXLOWER.encode(&digest.finalize()))
}

/// 64 lowercase hex characters.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let digest = stream_digest(path, Sha256::new())?;
    Ok(data_encoding::HEXLOWER.encode(&digest.finalize()))
}

/// The standard average-hash (aHash) procedure: downscale to 8x8,
/// convert to grayscale, threshold each pixel against the mean. Bit `i`
/// (MSB-first, row-major) is 1 iff pixel `i` is at or above the mean.
pub fn average_hash(image: &DynamicImage) -> [u8; 8] {
    let small = image
        .resize_exact(8, 8, FilterType::Lanczos3)
        .grayscale();

    let mut values = [0u8; 64];
    for y in 0..8 {
        for x in 0..8 {
            values[y * 8 + x] = small.get_pixel(x as u32, y as u32).0[0];
        }
    }

    let mean = values.iter().map(|&v| v as u32).sum::<u32>() as f64 / 64.0;
    pack_bits(values.iter().map(|&v| v as f64 >= mean))
}

/// The standard pHash procedure: downscale to 32x32 grayscale, take a
/// 2D DCT-II, keep the top-left 8x8 block excluding the DC term,
/// threshold against the median of those 63 coefficients.
pub fn p_hash(image: &DynamicImage) -> [u8; 8] {
    const SIZE: usize = 32;
    let small = image
        .resize_exact(SIZE as u32, SIZE as u32, FilterType::Lanczos3)
        .grayscale();

    let mut samples = [[0f64; SIZE]; SIZE];
    for y in 0..SIZE {
        for x in 0..SIZE {
            samples[y][x] = small.get_pixel(x as u32, y as u32).0[0] as f64;
        }
    }

    let dct = dct_2d(&samples);

    let mut coefficients = Vec::with_capacity(63);
    for y in 0..8 {
        for x in 0..8 {
            if x == 0 && y == 0 {
                continue; // drop the DC term
            }
            coefficients.push(dct[y][x]);
        }
    }

    let median = median_of(&coefficients);
    let bits_in_order = (0..8).flat_map(|y| (0..8).map(move |x| (y, x))).filter_map(|(y, x)| {
        if x == 0 && y == 0 {
            None
        } else {
            Some(dct[y][x] >= median)
        }
    });

    // The DC term contributes no bit; pack the remaining 63 bits into
    // the low 63 bits of the 64-bit output, with the top bit fixed at 0.
    let mut hash = [0u8; 8];
    let mut bit_index = 1usize; // leave bit 0 (MSB) as a constant 0
    for bit in bits_in_order {
        if bit {
            hash[bit_index / 8] |= 0x80 >> (bit_index % 8);
        }
        bit_index += 1;
    }
    hash
}

fn pack_bits(bits: impl Iterator<Item = bool>) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, bit) in bits.enumerate() {
        if bit {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

fn median_of(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// A direct (non-FFT) 2D DCT-II, adequate for the fixed 32x32 input
/// this module ever calls it with.
fn dct_2d<const N: usize>(input: &[[f64; N]; N]) -> Vec<Vec<f64>> {
    let rows = dct_rows(input);
    let transposed = transpose(&rows);
    let cols = dct_rows_vec(&transposed);
    transpose(&cols)
}

fn dct_rows<const N: usize>(input: &[[f64; N]; N]) -> Vec<Vec<f64>> {
    input.iter().map(|row| dct_1d(row)).collect()
}

fn dct_rows_vec(input: &[Vec<f64>]) -> Vec<Vec<f64>> {
    input.iter().map(|row| dct_1d(row)).collect()
}

fn dct_1d(input: &[f64]) -> Vec<f64> {
    let n = input.len();
    let mut out = vec![0f64; n];
    for (k, slot) in out.iter_mut().enumerate() {
        let mut sum = 0f64;
        for (i, &x) in input.iter().enumerate() {
            sum += x * ((std::f64::consts::PI / n as f64) * (i as f64 + 0.5) * k as f64).cos();
        }
        let scale = if k == 0 {
            (1.0 / n as f64).sqrt()
        } else {
            (2.0 / n as f64).sqrt()
        };
        *slot = sum * scale;
    }
    out
}

fn transpose(m: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let rows = m.len();
    let cols = m[0].len();
    let mut out = vec![vec![0f64; rows]; cols];
    for (y, row) in m.iter().enumerate() {
        for (x, &v) in row.iter().enumerate() {
            out[x][y] = v;
        }
    }
    out
}

/// Number of differing bits between two 64-bit hashes.
pub fn hamming_distance(a: [u8; 8], b: [u8; 8]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

pub fn hamming_distance_u64(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

pub fn bytes_to_u64_be(bytes: [u8; 8]) -> u64 {
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use image::{GenericImage, Rgba};

    fn checkerboard(size: u32) -> DynamicImage {
        let mut img = DynamicImage::new_rgb8(size, size);
        for y in 0..size {
            for x in 0..size {
                let v = if (x / 4 + y / 4) % 2 == 0 { 255 } else { 0 };
                img.put_pixel(x, y, Rgba([v, v, v, 255]));
            }
        }
        img
    }

    #[test]
    fn hamming_distance_is_zero_for_identical_hashes() {
        let h = average_hash(&checkerboard(64));
        assert_eq!(hamming_distance(h, h), 0);
    }

    #[test]
    fn average_hash_is_stable_under_resampling() {
        let img = checkerboard(64);
        let downsampled = img.resize_exact(32, 32, FilterType::Lanczos3);
        let h1 = average_hash(&img);
        let h2 = average_hash(&downsampled);
        assert!(hamming_distance(h1, h2) < 5);
    }

    #[test]
    fn phash_is_stable_under_grayscale_conversion() {
        let img = checkerboard(64);
        let grayscale = img.grayscale();
        let h1 = p_hash(&img);
        let h2 = p_hash(&grayscale);
        assert!(hamming_distance(h1, h2) < 5);
    }

    #[test]
    fn known_answer_md5_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(md5_hex(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(
            sha256_hex(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
