// Filesystem ResourceGenerator: stat + sha256 for file entries, image crate for tiles

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, ImageReader};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tessera_core::application::JobHandle;
use tessera_core::domain::{
    BlobInfo, DomainError, FileEntry, ResourceInfo, ResourceLocator, TileEntry, TileFormat, TileKey,
};
use tessera_core::error::{AppError, Result};
use tessera_core::port::ResourceGenerator;
use tessera_core::CacheConfig;
use tracing::{debug, info};

const HASH_BUFFER_SIZE: usize = 8192;
const MAX_SCALE: i32 = 30;
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "cbz", "rar", "cbr", "tar", "tgz", "7z"];

/// Generator reading source files from the local filesystem
pub struct FsResourceGenerator {
    tile_size: u32,
    jpeg_quality: u8,
}

impl FsResourceGenerator {
    pub fn new(tile_size: u32, jpeg_quality: u8) -> Self {
        Self {
            tile_size: tile_size.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.tile_size, config.jpeg_quality)
    }

    fn decode(&self, path: &str) -> Result<DynamicImage> {
        ImageReader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| image_error(path, e))
    }

    fn encode(&self, tile: &DynamicImage) -> Result<(Vec<u8>, TileFormat, u8)> {
        let mut data = Vec::new();

        // JPEG has no alpha channel
        if tile.color().has_alpha() {
            tile.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
                .map_err(|e| image_error("png tile", e))?;
            return Ok((data, TileFormat::Png, 0));
        }

        let rgb = tile.to_rgb8();
        JpegEncoder::new_with_quality(&mut data, self.jpeg_quality)
            .encode_image(&rgb)
            .map_err(|e| image_error("jpeg tile", e))?;
        Ok((data, TileFormat::Jpeg, self.jpeg_quality))
    }
}

impl ResourceGenerator for FsResourceGenerator {
    fn generate_file_entry(&self, path: &str) -> Result<FileEntry> {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(AppError::NotFound(format!("{} is not a regular file", path)));
        }

        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let hash = sha256_file(Path::new(path))?;

        let mut entry = FileEntry::new(path, metadata.len(), mtime, hash);
        entry.handler = handler_for(path);
        debug!(path = path, size = entry.size, "Generated file entry");
        Ok(entry)
    }

    fn generate_resource_info(&self, locator: &ResourceLocator, blob: &BlobInfo) -> Result<ResourceInfo> {
        let path = locator.path.as_str();
        let handler = handler_for(path).unwrap_or_else(|| "unknown".to_string());

        if ARCHIVE_EXTENSIONS.contains(&handler.as_str()) {
            return Ok(ResourceInfo::archive(blob.hash.clone(), handler));
        }

        let (width, height) = ImageReader::open(path)?
            .with_guessed_format()?
            .into_dimensions()
            .map_err(|e| image_error(path, e))?;

        Ok(ResourceInfo::image(blob.hash.clone(), handler, width, height))
    }

    fn generate_tiles(&self, file: &FileEntry, scale: i32, handle: &JobHandle) -> Result<Vec<TileEntry>> {
        let file_id = file
            .id
            .ok_or_else(|| AppError::NotFound(format!("{} has no row id", file)))?;
        if !(0..=MAX_SCALE).contains(&scale) {
            return Err(DomainError::InvalidTileCoordinate { scale, x: 0, y: 0 }.into());
        }

        let image = self.decode(&file.path)?;
        let factor = 1u32 << scale;
        let (width, height) = image.dimensions();
        let scaled_width = width.div_ceil(factor).max(1);
        let scaled_height = height.div_ceil(factor).max(1);

        let scaled = if scale == 0 {
            image
        } else {
            image.resize_exact(scaled_width, scaled_height, FilterType::Triangle)
        };

        let columns = scaled_width.div_ceil(self.tile_size);
        let rows = scaled_height.div_ceil(self.tile_size);
        let mut tiles = Vec::with_capacity((columns * rows) as usize);

        for row in 0..rows {
            for column in 0..columns {
                if handle.is_aborted() {
                    return Err(AppError::Aborted);
                }

                let left = column * self.tile_size;
                let top = row * self.tile_size;
                let tile = scaled.crop_imm(
                    left,
                    top,
                    self.tile_size.min(scaled_width - left),
                    self.tile_size.min(scaled_height - top),
                );

                let (data, format, quality) = self.encode(&tile)?;
                let key = TileKey::new(file_id, scale, column as i32, row as i32);
                tiles.push(TileEntry::new(key, data, format).with_quality(quality));
            }
        }

        info!(
            path = %file.path,
            scale = scale,
            columns = columns,
            rows = rows,
            "Rendered tiles"
        );
        Ok(tiles)
    }
}

/// Streaming SHA-256 of a file as lowercase hex
fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn handler_for(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn image_error(what: &str, err: ImageError) -> AppError {
    match err {
        ImageError::IoError(io) => AppError::Io(io),
        other => AppError::Decode(format!("{}: {}", what, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use tempfile::TempDir;

    fn write_png(dir: &TempDir, name: &str, width: u32, height: u32) -> String {
        let path = dir.path().join(name);
        RgbImage::from_pixel(width, height, Rgb([200, 100, 50])).save(&path).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn stored(generator: &FsResourceGenerator, path: &str) -> FileEntry {
        generator.generate_file_entry(path).unwrap().with_id(1)
    }

    #[test]
    fn test_file_entry_hashes_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();

        let entry = FsResourceGenerator::new(256, 75)
            .generate_file_entry(path.to_str().unwrap())
            .unwrap();

        assert_eq!(entry.size, 5);
        assert_eq!(
            entry.blob_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(entry.handler.as_deref(), Some("txt"));
        assert!(entry.mtime > 0);
        assert!(entry.id.is_none());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = FsResourceGenerator::new(256, 75)
            .generate_file_entry("/definitely/not/here.jpg")
            .unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[test]
    fn test_directory_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = FsResourceGenerator::new(256, 75)
            .generate_file_entry(dir.path().to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_resource_info_reads_dimensions() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "wide.png", 300, 120);
        let generator = FsResourceGenerator::new(256, 75);

        let info = generator
            .generate_resource_info(&ResourceLocator::from_path(&path), &BlobInfo::new("h", 1))
            .unwrap();

        assert_eq!((info.width, info.height), (300, 120));
        assert_eq!(info.handler, "png");
        assert_eq!(info.blob_hash, "h");
    }

    #[test]
    fn test_archive_resource_has_no_dimensions() {
        let generator = FsResourceGenerator::new(256, 75);
        let info = generator
            .generate_resource_info(&ResourceLocator::from_path("/comics/issue1.cbz"), &BlobInfo::new("z", 1))
            .unwrap();
        assert_eq!(info.kind, tessera_core::domain::ResourceKind::Archive);
        assert_eq!((info.width, info.height), (0, 0));
    }

    #[test]
    fn test_tiles_cover_scaled_image() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "photo.png", 300, 120);
        let generator = FsResourceGenerator::new(128, 80);
        let file = stored(&generator, &path);

        // Scale 0: 300x120 -> 3x1 tiles of 128
        let tiles = generator.generate_tiles(&file, 0, &JobHandle::new()).unwrap();
        assert_eq!(tiles.len(), 3);
        assert!(tiles.iter().all(|t| t.format == TileFormat::Jpeg && t.quality == 80));
        let last = image::load_from_memory(&tiles[2].data).unwrap();
        assert_eq!(last.dimensions(), (300 - 256, 120));

        // Scale 1: 150x60 -> 2x1 tiles
        let tiles = generator.generate_tiles(&file, 1, &JobHandle::new()).unwrap();
        let coords: Vec<_> = tiles.iter().map(|t| (t.x, t.y)).collect();
        assert_eq!(coords, vec![(0, 0), (1, 0)]);

        // Scale 3: 38x15 -> single tile
        let tiles = generator.generate_tiles(&file, 3, &JobHandle::new()).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(image::load_from_memory(&tiles[0].data).unwrap().dimensions(), (38, 15));
    }

    #[test]
    fn test_alpha_images_tile_as_png() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("icon.png");
        RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 128])).save(&path).unwrap();
        let generator = FsResourceGenerator::new(256, 75);
        let file = stored(&generator, path.to_str().unwrap());

        let tiles = generator.generate_tiles(&file, 0, &JobHandle::new()).unwrap();

        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].format, TileFormat::Png);
        assert_eq!(tiles[0].quality, 0);
    }

    #[test]
    fn test_aborted_handle_stops_rendering() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "photo.png", 64, 64);
        let generator = FsResourceGenerator::new(16, 75);
        let file = stored(&generator, &path);
        let handle = JobHandle::new();
        handle.set_aborted();

        let err = generator.generate_tiles(&file, 0, &handle).unwrap_err();
        assert!(matches!(err, AppError::Aborted));
    }

    #[test]
    fn test_corrupt_image_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"this is not an image").unwrap();
        let generator = FsResourceGenerator::new(256, 75);
        let file = stored(&generator, path.to_str().unwrap());

        let err = generator.generate_tiles(&file, 0, &JobHandle::new()).unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));
    }

    #[test]
    fn test_unstored_file_rejected() {
        let generator = FsResourceGenerator::new(256, 75);
        let file = FileEntry::new("/x.png", 1, 1, "h");
        assert!(matches!(
            generator.generate_tiles(&file, 0, &JobHandle::new()),
            Err(AppError::NotFound(_))
        ));
    }
}
