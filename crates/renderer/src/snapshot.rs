use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use image::RgbaImage;
use kernel::VariantSpec;

/// `Capture 2024-03-09 at 4.05.17 PM.png`
pub fn capture_file_name<Tz>(time: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("Capture {}.png", time.format("%Y-%m-%d at %-I.%M.%S %p"))
}

/// `03-julia-escape.png`: catalog position, name and escape mode.
pub fn thumbnail_file_name(index: usize, spec: &VariantSpec) -> String {
    let name: String = spec
        .name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("{index:02}-{name}-{}.png", spec.mode())
}

/// Writes `image` as PNG, creating parent directories as needed.
pub fn save_png(image: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    image
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write snapshot to {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "saved snapshot"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn capture_names_use_twelve_hour_clock() {
        let afternoon = Utc.with_ymd_and_hms(2024, 3, 9, 16, 5, 17).unwrap();
        assert_eq!(capture_file_name(&afternoon), "Capture 2024-03-09 at 4.05.17 PM.png");
        let midnight = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 9).unwrap();
        assert_eq!(capture_file_name(&midnight), "Capture 2023-12-31 at 12.00.09 AM.png");
    }

    #[test]
    fn thumbnail_names_are_file_safe() {
        let julia = VariantSpec::new("julia", "cmul(z, z) + c", true);
        assert_eq!(thumbnail_file_name(3, &julia), "03-julia-escape.png");
        let odd = VariantSpec::new("my/formula v2", "z", false);
        assert_eq!(thumbnail_file_name(12, &odd), "12-my_formula_v2-fixed.png");
    }

    #[test]
    fn save_png_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.png");
        let image = RgbaImage::from_pixel(3, 2, image::Rgba([10, 20, 30, 255]));
        save_png(&image, &path).unwrap();
        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded, image);
    }
}
