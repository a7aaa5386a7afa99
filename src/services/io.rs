//! Image I/O operations service
//!
//! Loads sources into [`PixelBuffer`]s at their native depth and writes renders back out,
//! carrying an allow-listed subset of the source's EXIF metadata into JPEG output.

use crate::{
    error::{EnhanceError, Result},
    services::format::ImageFileFormat,
    types::{BitDepth, PixelBuffer},
};
use exif::{Context, Field, In};
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::fs;
use std::io::{BufReader, Cursor};
use std::path::Path;

/// EXIF tags copied from the source file into saved JPEGs
pub const EXIF_ALLOW_LIST: [u16; 27] = [
    271,   // Make
    272,   // Model
    306,   // DateTime
    700,   // XMP
    33723, // IPTC
    34853, // GPSInfo
    34858, // TimeZoneOffset
    36867, // DateTimeOriginal
    36868, // DateTimeDigitized
    36880, // OffsetTime
    36881, // OffsetTimeOriginal
    36882, // OffsetTimeDigitized
    37520, // SubSecTime
    37521, // SubSecTimeOriginal
    37522, // SubSecTimeDigitized
    42033, // BodySerialNumber
    50971, // PreviewDateTime
    42034, // LensSpecification
    42035, // LensMake
    42036, // LensModel
    42037, // LensSerialNumber
    41989, // FocalLengthIn35mmFilm
    37386, // FocalLength
    37379, // BrightnessValue
    37380, // ExposureBiasValue
    37385, // Flash
    34867, // ISOSpeed
];

const GPS_INFO_TAG: u16 = 34853;

/// IFD pointers are regenerated by the writer, never copied
const POINTER_TAGS: [u16; 3] = [34665, 34853, 40965];

/// Largest TIFF payload that fits in one APP1 segment
const MAX_EXIF_PAYLOAD: usize = 65533 - 6;

/// Service for handling image file input/output operations
pub struct ImageIOService;

impl ImageIOService {
    /// Load an image file at its native bit depth
    ///
    /// Falls back to content sniffing when the extension is wrong.
    ///
    /// # Errors
    /// - Missing or unreadable file
    /// - Undecodable image data
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<PixelBuffer> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(EnhanceError::file_io_error(
                "read image file",
                path_ref,
                &std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            ));
        }

        let image = match image::open(path_ref) {
            Ok(img) => img,
            Err(e) => {
                log::debug!(
                    "Extension-based loading failed for {}: {}. Attempting content-based detection.",
                    path_ref.display(),
                    e
                );
                let data = fs::read(path_ref)
                    .map_err(|io_err| EnhanceError::file_io_error("read image data", path_ref, &io_err))?;
                image::load_from_memory(&data).map_err(|_| EnhanceError::image_load_error(path_ref, &e))?
            },
        };

        PixelBuffer::from_dynamic(&image)
    }

    /// Decode an in-memory image
    ///
    /// # Errors
    /// - Undecodable image data
    pub fn load_from_bytes(bytes: &[u8]) -> Result<PixelBuffer> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| EnhanceError::processing(format!("Failed to decode image from bytes: {e}")))?;
        PixelBuffer::from_dynamic(&image)
    }

    /// Save a buffer, choosing the codec from the path's extension
    ///
    /// JPEG output receives the allow-listed EXIF fields of `exif_source` when given;
    /// other formats are written without metadata.
    ///
    /// # Errors
    /// - Unsupported extension, or 16-bit samples bound for JPEG
    /// - Encoding or write failures
    pub fn save_image<P: AsRef<Path>>(
        buffer: &PixelBuffer,
        path: P,
        exif_source: Option<&Path>,
        jpeg_quality: u8,
    ) -> Result<()> {
        let path_ref = path.as_ref();
        let format = ImageFileFormat::from_path(path_ref)?;

        if buffer.depth() == BitDepth::Sixteen && !format.supports_sixteen_bit() {
            return Err(EnhanceError::unsupported_format(format!(
                "{format} cannot hold 16-bit samples ({})",
                path_ref.display()
            )));
        }

        if let Some(parent) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| EnhanceError::file_io_error("create output directory", parent, &e))?;
        }

        let image = buffer.to_dynamic()?;
        match format {
            ImageFileFormat::Jpeg => {
                let mut bytes = Self::encode_jpeg(&image, jpeg_quality)?;
                if let Some(source) = exif_source {
                    if let Some(tiff) = Self::read_allowed_exif(source) {
                        if !insert_exif_segment(&mut bytes, &tiff) {
                            log::warn!(
                                "EXIF block of {} bytes does not fit in a JPEG segment, saving without it",
                                tiff.len()
                            );
                        }
                    }
                }
                fs::write(path_ref, bytes)
                    .map_err(|e| EnhanceError::file_io_error("write image", path_ref, &e))?;
            },
            ImageFileFormat::Png | ImageFileFormat::Tiff => {
                if exif_source.is_some() {
                    log::debug!("Metadata is not carried into {format} output");
                }
                image
                    .save_with_format(path_ref, format.image_format())
                    .map_err(|e| EnhanceError::processing(format!("Failed to save as {format}: {e}")))?;
            },
        }

        log::debug!(
            "Saved {}x{} {}-bit {} to {}",
            buffer.width(),
            buffer.height(),
            buffer.depth().bits(),
            format,
            path_ref.display()
        );
        Ok(())
    }

    /// Check if a file path has an extension renders can be written with
    pub fn is_supported_format<P: AsRef<Path>>(path: P) -> bool {
        ImageFileFormat::from_path(path).is_ok()
    }

    fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let rgb_image = image.to_rgb8();
        let mut jpeg_encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
        jpeg_encoder
            .encode_image(&rgb_image)
            .map_err(|e| EnhanceError::processing(format!("Failed to encode JPEG: {e}")))?;
        Ok(buffer)
    }

    /// Serialize the allow-listed EXIF fields of `source` as a TIFF block
    ///
    /// Missing or unreadable metadata yields `None`.
    fn read_allowed_exif(source: &Path) -> Option<Vec<u8>> {
        let file = match fs::File::open(source) {
            Ok(file) => file,
            Err(e) => {
                log::debug!("Cannot open {} for EXIF: {e}", source.display());
                return None;
            },
        };
        let exif = match exif::Reader::new().read_from_container(&mut BufReader::new(file)) {
            Ok(exif) => exif,
            Err(e) => {
                log::debug!("No EXIF in {}: {e}", source.display());
                return None;
            },
        };

        let fields: Vec<&Field> = exif
            .fields()
            .filter(|f| f.ifd_num == In::PRIMARY && is_allowed(f))
            .collect();
        if fields.is_empty() {
            return None;
        }

        let mut writer = exif::experimental::Writer::new();
        for field in fields.iter().copied() {
            writer.push_field(field);
        }
        let mut tiff = Cursor::new(Vec::new());
        if let Err(e) = writer.write(&mut tiff, exif.little_endian()) {
            log::warn!("Failed to re-encode EXIF from {}: {e}", source.display());
            return None;
        }
        log::debug!("Carrying {} EXIF fields from {}", fields.len(), source.display());
        Some(tiff.into_inner())
    }
}

fn is_allowed(field: &Field) -> bool {
    match field.tag.context() {
        Context::Gps => EXIF_ALLOW_LIST.contains(&GPS_INFO_TAG),
        Context::Tiff | Context::Exif => {
            let number = field.tag.number();
            !POINTER_TAGS.contains(&number) && EXIF_ALLOW_LIST.contains(&number)
        },
        _ => false,
    }
}

/// Insert an `APP1` EXIF segment right after the JPEG start-of-image marker
///
/// Returns `false` and leaves `jpeg` untouched when the payload is too large or the data
/// is not a JPEG stream.
fn insert_exif_segment(jpeg: &mut Vec<u8>, tiff: &[u8]) -> bool {
    if tiff.len() > MAX_EXIF_PAYLOAD || !jpeg.starts_with(&[0xFF, 0xD8]) {
        return false;
    }
    let Ok(length) = u16::try_from(tiff.len() + 8) else {
        return false;
    };
    let mut segment = Vec::with_capacity(tiff.len() + 10);
    segment.extend_from_slice(&[0xFF, 0xE1]);
    segment.extend_from_slice(&length.to_be_bytes());
    segment.extend_from_slice(b"Exif\0\0");
    segment.extend_from_slice(tiff);
    jpeg.splice(2..2, segment);
    true
}
