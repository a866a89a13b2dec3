#![allow(dead_code)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use image::{DynamicImage, GenericImage, Rgba};

pub fn cli() -> Result<Command> {
    Ok(Command::cargo_bin(env!("CARGO_PKG_NAME"))?)
}

/// Writes a small solid-color PNG, useful as a cheap synthetic photo
/// fixture: two calls with the same `value` hash identically, two
/// with different values don't.
pub fn write_solid_png(path: &Path, value: u8) {
    let mut img = DynamicImage::new_rgb8(24, 24);
    for y in 0..24 {
        for x in 0..24 {
            img.put_pixel(x, y, Rgba([value, value, value, 255]));
        }
    }
    img.save(path).expect("failed to write fixture image");
}
