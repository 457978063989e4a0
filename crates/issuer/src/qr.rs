//! QR images for printed download links.
use image::{GrayImage, Luma};
use qrcode::{Color, QrCode};
use std::path::Path;

use crate::error::{IssuerError, Result};

/// Edge length of every image, quiet zone included.
pub const IMAGE_SIZE: u32 = 400;
/// Quiet zone around the code, in modules.
pub const MARGIN: u32 = 2;
const PROGRESS_EVERY: usize = 50;

/// `qr-N.png`, zero-padded to the width of `total`, counting from 1.
pub fn file_name(index: usize, total: usize) -> String {
    let digits = total.to_string().len();
    format!("qr-{:0width$}.png", index + 1, width = digits)
}

pub fn render(url: &str) -> Result<GrayImage> {
    let code =
        QrCode::new(url.as_bytes()).map_err(|e| IssuerError::Qr(format!("{}: {}", url, e)))?;
    let width = code.width() as u32;
    let colors = code.to_colors();
    let modules = width + 2 * MARGIN;

    Ok(GrayImage::from_fn(IMAGE_SIZE, IMAGE_SIZE, |x, y| {
        let mx = x * modules / IMAGE_SIZE;
        let my = y * modules / IMAGE_SIZE;
        let inside = (MARGIN..MARGIN + width).contains(&mx) && (MARGIN..MARGIN + width).contains(&my);
        let dark = inside
            && matches!(
                colors[((my - MARGIN) * width + (mx - MARGIN)) as usize],
                Color::Dark
            );
        if dark {
            Luma([0])
        } else {
            Luma([255])
        }
    }))
}

/// Render one PNG per URL into `out_dir`. Returns how many were written.
pub fn write_all(urls: &[String], out_dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(out_dir)?;

    for (i, url) in urls.iter().enumerate() {
        let path = out_dir.join(file_name(i, urls.len()));
        render(url)?
            .save(&path)
            .map_err(|e| IssuerError::Image(format!("{}: {}", path.display(), e)))?;
        if i == 0 || (i + 1) % PROGRESS_EVERY == 0 {
            println!("Generated {} / {}", i + 1, urls.len());
        }
    }
    Ok(urls.len())
}
