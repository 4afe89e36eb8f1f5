//! GeoTIFF reading and writing.
//!
//! Plain strip-organized GeoTIFFs only: the intermediates this crate writes
//! are handed to the COG encoder, which does the tiling and compression.

use std::fmt::Debug;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tracing::debug;

use super::{Crs, DataType, GeoTransform, Raster, RasterProfile};
use crate::errors::RasterIoError;
use crate::georef::is_geographic;

// GeoTIFF tags
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

// GeoKeys
const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const USER_DEFINED: u16 = 32767;

const PLANAR_CHUNKY: u16 = 1;
const COMPRESSION_NONE: u16 = 1;

const PHOTOMETRIC_BLACK_IS_ZERO: u16 = 1;
const PHOTOMETRIC_RGB: u16 = 2;
const EXTRA_SAMPLE_UNSPECIFIED: u16 = 0;
const EXTRA_SAMPLE_UNASSOCIATED_ALPHA: u16 = 2;

/// Reads and writes rasters on disk.
pub trait RasterDriver: Send + Sync + Debug {
    /// Reads the full raster at `path`.
    fn read(&self, path: &Path) -> Result<Raster, RasterIoError>;

    /// Writes `raster` to `path`, replacing any existing file.
    fn write(&self, path: &Path, raster: &Raster) -> Result<(), RasterIoError>;
}

/// [`RasterDriver`] for uncompressed, strip-organized GeoTIFFs.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoTiffDriver;

impl GeoTiffDriver {
    /// Creates a new driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decodes a GeoTIFF held in memory.
    ///
    /// Gray, RGB and RGBA images go through the tiff decoder. Other band
    /// layouts (gray plus extra samples, separate planes) are read straight
    /// from uncompressed strips.
    pub fn decode(&self, bytes: Vec<u8>, path: &Path) -> Result<Raster, RasterIoError> {
        let tiff_err = |e: tiff::TiffError| RasterIoError::new(path, e.to_string());

        let mut decoder = Decoder::new(Cursor::new(bytes.as_slice()))
            .map_err(tiff_err)?
            .with_limits(Limits::unlimited());

        let (width, height) = decoder.dimensions().map_err(tiff_err)?;
        let (width, height) = (width as usize, height as usize);
        let pixel_count = width * height;
        if pixel_count == 0 {
            return Err(RasterIoError::new(path, "raster has zero dimensions"));
        }

        let transform = read_transform(&mut decoder).map_err(tiff_err)?;
        let crs = read_crs(&mut decoder).map_err(tiff_err)?;
        let nodata = read_nodata(&mut decoder).map_err(tiff_err)?;

        let planar = decoder
            .find_tag_unsigned::<u16>(Tag::PlanarConfiguration)
            .map_err(tiff_err)?
            .unwrap_or(PLANAR_CHUNKY);
        let (dtype, bands) = match decoder.colortype() {
            Ok(_) if planar == PLANAR_CHUNKY => {
                let (dtype, samples) = read_samples(&mut decoder, path)?;
                if samples.len() % pixel_count != 0 {
                    return Err(RasterIoError::new(
                        path,
                        format!("{} samples do not fill a {width}x{height} grid", samples.len()),
                    ));
                }
                let count = samples.len() / pixel_count;
                (dtype, split_chunky(&samples, count, pixel_count))
            }
            _ => read_uncompressed_bands(&mut decoder, &bytes, pixel_count)
                .map_err(|e| RasterIoError::new(path, format!("unsupported band layout: {e}")))?,
        };
        let count = bands.len();

        debug!(path = %path.display(), width, height, count, %dtype, "Read GeoTIFF");

        let profile = RasterProfile {
            crs,
            transform,
            width,
            height,
            count,
            dtype,
            nodata,
        };
        Raster::new(profile, bands).map_err(|e| RasterIoError::new(path, e.message))
    }

    /// Encodes a raster as GeoTIFF bytes.
    pub fn encode(&self, raster: &Raster, path: &Path) -> Result<Vec<u8>, RasterIoError> {
        let geokeys = geokey_directory(raster.profile().crs);
        encode_with_geokeys(raster, path, &geokeys)
    }
}

fn encode_with_geokeys(raster: &Raster, path: &Path, geokeys: &[u16]) -> Result<Vec<u8>, RasterIoError> {
    let tiff_err = |e: tiff::TiffError| RasterIoError::new(path, e.to_string());
    let profile = raster.profile();

    if profile.pixel_count() == 0 || profile.count == 0 {
        return Err(RasterIoError::new(path, "raster has zero dimensions"));
    }
    let too_large = || RasterIoError::new(path, "raster too large for a classic TIFF");
    let width = u32::try_from(profile.width).map_err(|_| too_large())?;
    let height = u32::try_from(profile.height).map_err(|_| too_large())?;
    let samples_per_pixel = u16::try_from(profile.count).map_err(|_| too_large())?;

    let pixel_bytes = interleave(raster);
    let strip_bytes = u32::try_from(pixel_bytes.len()).map_err(|_| too_large())?;

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut buffer).map_err(tiff_err)?;
        let mut dir = encoder.new_directory().map_err(tiff_err)?;

        let bits = vec![(profile.dtype.size_bytes() * 8) as u16; profile.count];
        let formats = vec![sample_format(profile.dtype); profile.count];
        let (photometric, extra_samples) = photometric_layout(profile);

        dir.write_tag(Tag::ImageWidth, width).map_err(tiff_err)?;
        dir.write_tag(Tag::ImageLength, height).map_err(tiff_err)?;
        dir.write_tag(Tag::BitsPerSample, bits.as_slice()).map_err(tiff_err)?;
        dir.write_tag(Tag::Compression, COMPRESSION_NONE).map_err(tiff_err)?;
        dir.write_tag(Tag::PhotometricInterpretation, photometric).map_err(tiff_err)?;
        dir.write_tag(Tag::SamplesPerPixel, samples_per_pixel).map_err(tiff_err)?;
        dir.write_tag(Tag::SampleFormat, formats.as_slice()).map_err(tiff_err)?;
        dir.write_tag(Tag::PlanarConfiguration, PLANAR_CHUNKY).map_err(tiff_err)?;
        dir.write_tag(Tag::RowsPerStrip, height).map_err(tiff_err)?;
        if !extra_samples.is_empty() {
            dir.write_tag(Tag::ExtraSamples, extra_samples.as_slice()).map_err(tiff_err)?;
        }

        let transform = &profile.transform;
        if transform.is_north_up() {
            let scale = [transform.pixel_width, transform.pixel_height.abs(), 0.0];
            let tiepoint = [0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0];
            dir.write_tag(tag(MODEL_PIXEL_SCALE), scale.as_slice()).map_err(tiff_err)?;
            dir.write_tag(tag(MODEL_TIEPOINT), tiepoint.as_slice()).map_err(tiff_err)?;
        } else {
            let matrix = [
                transform.pixel_width,
                transform.row_rotation,
                0.0,
                transform.origin_x,
                transform.col_rotation,
                transform.pixel_height,
                0.0,
                transform.origin_y,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
                1.0,
            ];
            dir.write_tag(tag(MODEL_TRANSFORMATION), matrix.as_slice()).map_err(tiff_err)?;
        }

        dir.write_tag(tag(GEO_KEY_DIRECTORY), geokeys).map_err(tiff_err)?;

        // ASCII; the encoder appends the terminating NUL.
        if let Some(nodata) = profile.nodata {
            dir.write_tag(tag(GDAL_NODATA), format_nodata(nodata).as_str()).map_err(tiff_err)?;
        }

        let offset = dir.write_data(pixel_bytes.as_slice()).map_err(tiff_err)?;
        let offset = u32::try_from(offset).map_err(|_| too_large())?;
        dir.write_tag(Tag::StripOffsets, offset).map_err(tiff_err)?;
        dir.write_tag(Tag::StripByteCounts, strip_bytes).map_err(tiff_err)?;
        dir.finish().map_err(tiff_err)?;
    }

    Ok(buffer.into_inner())
}

impl RasterDriver for GeoTiffDriver {
    fn read(&self, path: &Path) -> Result<Raster, RasterIoError> {
        let bytes = std::fs::read(path).map_err(|e| RasterIoError::new(path, e.to_string()))?;
        self.decode(bytes, path)
    }

    fn write(&self, path: &Path, raster: &Raster) -> Result<(), RasterIoError> {
        let bytes = self.encode(raster, path)?;
        std::fs::write(path, bytes).map_err(|e| RasterIoError::new(path, e.to_string()))?;
        debug!(
            path = %path.display(),
            width = raster.profile().width,
            height = raster.profile().height,
            count = raster.profile().count,
            "Wrote GeoTIFF"
        );
        Ok(())
    }
}

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn read_samples<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> Result<(DataType, Vec<f64>), RasterIoError> {
    let samples = match decoder.read_image().map_err(|e| RasterIoError::new(path, e.to_string()))? {
        DecodingResult::U8(v) => (DataType::U8, v.into_iter().map(f64::from).collect()),
        DecodingResult::U16(v) => (DataType::U16, v.into_iter().map(f64::from).collect()),
        DecodingResult::I16(v) => (DataType::I16, v.into_iter().map(f64::from).collect()),
        DecodingResult::U32(v) => (DataType::U32, v.into_iter().map(f64::from).collect()),
        DecodingResult::I32(v) => (DataType::I32, v.into_iter().map(f64::from).collect()),
        DecodingResult::F32(v) => (DataType::F32, v.into_iter().map(f64::from).collect()),
        DecodingResult::F64(v) => (DataType::F64, v),
        _ => return Err(RasterIoError::new(path, "unsupported sample type")),
    };
    Ok(samples)
}

fn split_chunky(samples: &[f64], count: usize, pixel_count: usize) -> Vec<Vec<f64>> {
    let mut bands = vec![Vec::with_capacity(pixel_count); count];
    for pixel in samples.chunks_exact(count) {
        for (band, value) in bands.iter_mut().zip(pixel) {
            band.push(*value);
        }
    }
    bands
}

fn data_type_of(format: u16, bits: u16) -> Option<DataType> {
    match (format, bits) {
        (1, 8) => Some(DataType::U8),
        (1, 16) => Some(DataType::U16),
        (1, 32) => Some(DataType::U32),
        (2, 16) => Some(DataType::I16),
        (2, 32) => Some(DataType::I32),
        (3, 32) => Some(DataType::F32),
        (3, 64) => Some(DataType::F64),
        _ => None,
    }
}

/// Reads uncompressed strips without the tiff decoder's color model.
fn read_uncompressed_bands<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    bytes: &[u8],
    pixel_count: usize,
) -> Result<(DataType, Vec<Vec<f64>>), String> {
    let tiff_err = |e: tiff::TiffError| e.to_string();

    let compression = decoder
        .find_tag_unsigned::<u16>(Tag::Compression)
        .map_err(tiff_err)?
        .unwrap_or(COMPRESSION_NONE);
    if compression != COMPRESSION_NONE {
        return Err(format!("compression {compression} is only supported for gray, RGB and RGBA images"));
    }
    if decoder.find_tag(Tag::TileOffsets).map_err(tiff_err)?.is_some() {
        return Err("tiled images are only supported for gray, RGB and RGBA".to_string());
    }

    let count = decoder
        .find_tag_unsigned::<u16>(Tag::SamplesPerPixel)
        .map_err(tiff_err)?
        .map_or(1, usize::from);
    let bits = decoder
        .find_tag_unsigned_vec::<u16>(Tag::BitsPerSample)
        .map_err(tiff_err)?
        .unwrap_or_else(|| vec![1]);
    let formats = decoder
        .find_tag_unsigned_vec::<u16>(Tag::SampleFormat)
        .map_err(tiff_err)?
        .unwrap_or_else(|| vec![1]);
    let (Some(&first_bits), Some(&first_format)) = (bits.first(), formats.first()) else {
        return Err("missing sample description".to_string());
    };
    if bits.iter().any(|b| *b != first_bits) || formats.iter().any(|f| *f != first_format) {
        return Err("bands with differing sample types".to_string());
    }
    let dtype = data_type_of(first_format, first_bits)
        .ok_or_else(|| format!("{first_bits}-bit samples of format {first_format}"))?;
    let planar = decoder
        .find_tag_unsigned::<u16>(Tag::PlanarConfiguration)
        .map_err(tiff_err)?
        .unwrap_or(PLANAR_CHUNKY);

    let offsets = decoder.get_tag_u64_vec(Tag::StripOffsets).map_err(tiff_err)?;
    let lengths = decoder.get_tag_u64_vec(Tag::StripByteCounts).map_err(tiff_err)?;
    let mut data = Vec::new();
    for (offset, length) in offsets.into_iter().zip(lengths) {
        let strip = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(length).ok())
            .and_then(|(start, len)| bytes.get(start..start.checked_add(len)?))
            .ok_or_else(|| "strip lies outside the file".to_string())?;
        data.extend_from_slice(strip);
    }

    let expected = pixel_count * count * dtype.size_bytes();
    if data.len() < expected {
        return Err(format!("strips hold {} bytes, expected {expected}", data.len()));
    }
    data.truncate(expected);

    let little_endian = bytes.starts_with(b"II");
    let samples: Vec<f64> = data
        .chunks_exact(dtype.size_bytes())
        .map(|sample| sample_value(dtype, sample, little_endian))
        .collect();

    let bands = if planar == PLANAR_CHUNKY {
        split_chunky(&samples, count, pixel_count)
    } else {
        samples.chunks_exact(pixel_count).map(<[f64]>::to_vec).collect()
    };
    Ok((dtype, bands))
}

fn sample_value(dtype: DataType, sample: &[u8], little_endian: bool) -> f64 {
    fn le<const N: usize>(sample: &[u8], little_endian: bool) -> [u8; N] {
        let mut buf = [0u8; N];
        buf.copy_from_slice(&sample[..N]);
        if !little_endian {
            buf.reverse();
        }
        buf
    }

    match dtype {
        DataType::U8 => f64::from(sample[0]),
        DataType::U16 => f64::from(u16::from_le_bytes(le(sample, little_endian))),
        DataType::I16 => f64::from(i16::from_le_bytes(le(sample, little_endian))),
        DataType::U32 => f64::from(u32::from_le_bytes(le(sample, little_endian))),
        DataType::I32 => f64::from(i32::from_le_bytes(le(sample, little_endian))),
        DataType::F32 => f64::from(f32::from_le_bytes(le(sample, little_endian))),
        DataType::F64 => f64::from_le_bytes(le(sample, little_endian)),
    }
}

fn sample_format(dtype: DataType) -> u16 {
    match dtype {
        DataType::U8 | DataType::U16 | DataType::U32 => 1,
        DataType::I16 | DataType::I32 => 2,
        DataType::F32 | DataType::F64 => 3,
    }
}

fn photometric_layout(profile: &RasterProfile) -> (u16, Vec<u16>) {
    match (profile.dtype, profile.count) {
        (_, 1) => (PHOTOMETRIC_BLACK_IS_ZERO, Vec::new()),
        (DataType::U8, 3) => (PHOTOMETRIC_RGB, Vec::new()),
        (DataType::U8, 4) => (PHOTOMETRIC_RGB, vec![EXTRA_SAMPLE_UNASSOCIATED_ALPHA]),
        (_, count) => (
            PHOTOMETRIC_BLACK_IS_ZERO,
            vec![EXTRA_SAMPLE_UNSPECIFIED; count - 1],
        ),
    }
}

fn interleave(raster: &Raster) -> Vec<u8> {
    let profile = raster.profile();
    let mut out = Vec::with_capacity(profile.pixel_count() * profile.count * profile.dtype.size_bytes());
    for i in 0..profile.pixel_count() {
        for band in raster.bands() {
            push_sample(&mut out, profile.dtype, band[i]);
        }
    }
    out
}

// Samples are written in native byte order, matching the header the
// encoder emits.
fn push_sample(out: &mut Vec<u8>, dtype: DataType, value: f64) {
    match dtype {
        DataType::U8 => out.push(value as u8),
        DataType::U16 => out.extend_from_slice(&(value as u16).to_ne_bytes()),
        DataType::I16 => out.extend_from_slice(&(value as i16).to_ne_bytes()),
        DataType::U32 => out.extend_from_slice(&(value as u32).to_ne_bytes()),
        DataType::I32 => out.extend_from_slice(&(value as i32).to_ne_bytes()),
        DataType::F32 => out.extend_from_slice(&(value as f32).to_ne_bytes()),
        DataType::F64 => out.extend_from_slice(&value.to_ne_bytes()),
    }
}

fn format_nodata(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn geokey_directory(crs: Option<Crs>) -> Vec<u16> {
    let raster_type = [GT_RASTER_TYPE_GEO_KEY, 0, 1, RASTER_PIXEL_IS_AREA];

    let Some(code) = crs.and_then(|c| u16::try_from(c.code()).ok()) else {
        let mut keys = vec![1, 1, 0, 1];
        keys.extend_from_slice(&raster_type);
        return keys;
    };

    let (model_type, cs_key) = if is_geographic(Crs::epsg(u32::from(code))) {
        (MODEL_TYPE_GEOGRAPHIC, GEOGRAPHIC_TYPE_GEO_KEY)
    } else {
        (MODEL_TYPE_PROJECTED, PROJECTED_CS_TYPE_GEO_KEY)
    };

    // Keys must be sorted by id.
    let mut keys = vec![1, 1, 0, 3];
    keys.extend_from_slice(&[GT_MODEL_TYPE_GEO_KEY, 0, 1, model_type]);
    keys.extend_from_slice(&raster_type);
    keys.extend_from_slice(&[cs_key, 0, 1, code]);
    keys
}

fn find_f64s<R: Read + Seek>(decoder: &mut Decoder<R>, code: u16) -> tiff::TiffResult<Option<Vec<f64>>> {
    decoder.find_tag(tag(code))?.map(Value::into_f64_vec).transpose()
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<GeoTransform> {
    if let Some(m) = find_f64s(decoder, MODEL_TRANSFORMATION)? {
        if m.len() >= 8 {
            return Ok(GeoTransform {
                origin_x: m[3],
                pixel_width: m[0],
                row_rotation: m[1],
                origin_y: m[7],
                col_rotation: m[4],
                pixel_height: m[5],
            });
        }
    }

    let scale = find_f64s(decoder, MODEL_PIXEL_SCALE)?;
    let tiepoint = find_f64s(decoder, MODEL_TIEPOINT)?;
    match (scale, tiepoint) {
        (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => {
            let origin_x = tie[3] - tie[0] * scale[0];
            let origin_y = tie[4] + tie[1] * scale[1];
            Ok(GeoTransform::north_up(origin_x, origin_y, scale[0], scale[1]))
        }
        _ => Ok(GeoTransform::north_up(0.0, 0.0, 1.0, 1.0)),
    }
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<Option<Crs>> {
    let Some(keys) = decoder.find_tag(tag(GEO_KEY_DIRECTORY))? else {
        return Ok(None);
    };
    Ok(crs_from_geokeys(&keys.into_u16_vec()?))
}

/// Picks the CRS out of a GeoKeyDirectory.
///
/// Projected files often also carry their base geographic CRS, so the model
/// type decides which key wins.
fn crs_from_geokeys(keys: &[u16]) -> Option<Crs> {
    let declared = keys.get(3).copied().map_or(0, usize::from);
    let inline = |id: u16| {
        keys.get(4..)
            .unwrap_or_default()
            .chunks_exact(4)
            .take(declared)
            .find(|entry| entry[0] == id && entry[1] == 0)
            .map(|entry| entry[3])
    };
    let epsg = |id: u16| {
        inline(id)
            .filter(|code| *code != 0 && *code != USER_DEFINED)
            .map(|code| Crs::epsg(u32::from(code)))
    };

    let projected = epsg(PROJECTED_CS_TYPE_GEO_KEY);
    let geographic = epsg(GEOGRAPHIC_TYPE_GEO_KEY);
    match inline(GT_MODEL_TYPE_GEO_KEY) {
        Some(MODEL_TYPE_GEOGRAPHIC) => geographic.or(projected),
        _ => projected.or(geographic),
    }
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<Option<f64>> {
    Ok(decoder.find_tag(tag(GDAL_NODATA))?.and_then(parse_nodata))
}

/// GDAL writes the nodata tag as ASCII; some writers use a BYTE array.
fn parse_nodata(value: Value) -> Option<f64> {
    fn byte(value: Value) -> Option<u8> {
        match value {
            Value::Byte(b) => Some(b),
            other => other.into_u64().ok().and_then(|n| u8::try_from(n).ok()),
        }
    }

    let text = match value {
        Value::Ascii(s) => s,
        Value::List(items) => {
            let bytes: Vec<u8> = items.into_iter().filter_map(byte).collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        other => char::from(byte(other)?).to_string(),
    };
    text.trim_end_matches('\0').trim().parse::<f64>().ok()
}
