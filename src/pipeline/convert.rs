//! Raw sample to pixel conversion
//!
//! MJPEG decodes to RGB24 with rows padded to 4 bytes. YUYV converts to
//! 32-bit ARGB words in native (little-endian) order, i.e. bytes B, G, R, A.

use crate::capture::frame::{align4, PixelFormat, StreamFormat};
use crate::error::DecodeError;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Decodes `input` into `out`, which must hold `format.output_len()` bytes.
pub fn decode_into(format: &StreamFormat, input: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
    let needed = format.output_len();
    if out.len() < needed {
        return Err(DecodeError::Truncated {
            len: out.len(),
            needed,
        });
    }

    match &format.pixel_format {
        PixelFormat::Jpeg => jpeg_to_rgb(format.width, format.height, input, out),
        PixelFormat::Yuyv => yuyv_to_argb(format.width, format.height, input, out),
        PixelFormat::Other(name) => Err(DecodeError::Unsupported(name.clone())),
    }
}

/// Trims a payload to its `SOI .. EOI` span. Drivers commonly pad MJPEG
/// payloads past the end-of-image marker.
pub fn jpeg_payload(input: &[u8]) -> Result<&[u8], DecodeError> {
    let invalid = || DecodeError::InvalidJpeg { len: input.len() };
    if input.len() < 4 || input[..2] != SOI {
        return Err(invalid());
    }
    let end = input
        .windows(2)
        .rposition(|w| w == EOI)
        .filter(|&pos| pos >= 2)
        .ok_or_else(invalid)?;
    Ok(&input[..end + 2])
}

fn jpeg_to_rgb(width: u32, height: u32, input: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
    let payload = jpeg_payload(input)?;
    let (actual_width, actual_height, channels, pixels) = decode_jpeg(payload)?;
    if actual_width != width || actual_height != height {
        return Err(DecodeError::Geometry {
            width,
            height,
            actual_width,
            actual_height,
        });
    }

    let w = width as usize;
    let stride = align4(w * 3);
    for (row, dst) in out.chunks_exact_mut(stride).take(height as usize).enumerate() {
        let src = &pixels[row * w * channels..(row + 1) * w * channels];
        match channels {
            3 => dst[..w * 3].copy_from_slice(src),
            _ => {
                for (rgb, &luma) in dst[..w * 3].chunks_exact_mut(3).zip(src) {
                    rgb.fill(luma);
                }
            }
        }
    }
    Ok(())
}

/// Returns width, height, channels (1 or 3) and the packed pixels.
#[cfg(not(feature = "fast-jpeg"))]
fn decode_jpeg(payload: &[u8]) -> Result<(u32, u32, usize, Vec<u8>), DecodeError> {
    use jpeg_decoder::PixelFormat as JpegPixels;

    let mut decoder = jpeg_decoder::Decoder::new(payload);
    let pixels = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| DecodeError::Jpeg("missing frame header".into()))?;
    let channels = match info.pixel_format {
        JpegPixels::RGB24 => 3,
        JpegPixels::L8 => 1,
        other => return Err(DecodeError::Unsupported(format!("jpeg {other:?}"))),
    };
    Ok((info.width as u32, info.height as u32, channels, pixels))
}

#[cfg(feature = "fast-jpeg")]
fn decode_jpeg(payload: &[u8]) -> Result<(u32, u32, usize, Vec<u8>), DecodeError> {
    use zune_jpeg::zune_core::colorspace::ColorSpace;
    use zune_jpeg::zune_core::options::DecoderOptions;
    use zune_jpeg::JpegDecoder;

    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(payload, options);
    let pixels = decoder
        .decode()
        .map_err(|err| DecodeError::Jpeg(format!("{err:?}")))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| DecodeError::Jpeg("missing frame header".into()))?;
    Ok((width as u32, height as u32, 3, pixels))
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 limited-range YUV to RGB in 8.8 fixed point.
#[inline]
fn yuv_to_bgra(y: u8, u: u8, v: u8, dst: &mut [u8]) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    dst[0] = clamp((298 * c + 516 * d + 128) >> 8);
    dst[1] = clamp((298 * c - 100 * d - 208 * e + 128) >> 8);
    dst[2] = clamp((298 * c + 409 * e + 128) >> 8);
    dst[3] = 0xFF;
}

fn yuyv_to_argb(width: u32, height: u32, input: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
    let w = width as usize;
    let h = height as usize;
    let src_stride = ((w + 1) & !1) * 2;
    let needed = src_stride * h;
    if input.len() < needed {
        return Err(DecodeError::Truncated {
            len: input.len(),
            needed,
        });
    }

    for (src, dst) in input
        .chunks_exact(src_stride)
        .zip(out.chunks_exact_mut(w * 4))
        .take(h)
    {
        for (x, px) in dst.chunks_exact_mut(4).enumerate() {
            let pair = &src[(x / 2) * 4..(x / 2) * 4 + 4];
            let y = if x % 2 == 0 { pair[0] } else { pair[2] };
            yuv_to_bgra(y, pair[1], pair[3], px);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    fn format(width: u32, height: u32, pixel_format: PixelFormat) -> StreamFormat {
        StreamFormat {
            width,
            height,
            pixel_format,
        }
    }

    #[test]
    fn yuyv_gray_and_primaries() {
        // black, white
        let input = [16, 128, 235, 128];
        let fmt = format(2, 1, PixelFormat::Yuyv);
        let mut out = vec![0u8; fmt.output_len()];
        decode_into(&fmt, &input, &mut out).unwrap();
        assert_eq!(&out[..4], &[0, 0, 0, 255]);
        assert_eq!(&out[4..], &[255, 255, 255, 255]);

        // saturated red in BT.601: Y=81 U=90 V=240
        let input = [81, 90, 81, 240];
        decode_into(&fmt, &input, &mut out).unwrap();
        let (b, g, r) = (out[0], out[1], out[2]);
        assert!(r > 240 && g < 10 && b < 10, "got r={r} g={g} b={b}");
    }

    #[test]
    fn yuyv_odd_width_uses_padded_stride() {
        // width 3 -> stride of 4 pixels (8 bytes) per row
        let fmt = format(3, 2, PixelFormat::Yuyv);
        let mut input = vec![128u8; 16];
        input[8] = 16; // first luma of row 1
        let mut out = vec![0u8; fmt.output_len()];
        decode_into(&fmt, &input, &mut out).unwrap();
        assert_eq!(&out[12..16], &[0, 0, 0, 255]);

        let err = decode_into(&fmt, &input[..12], &mut out).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { len: 12, needed: 16 }));
    }

    #[test]
    fn jpeg_rows_are_padded() {
        let fmt = format(5, 4, PixelFormat::Jpeg);
        let mut out = vec![0u8; fmt.output_len()];
        assert_eq!(out.len(), 16 * 4);

        decode_into(&fmt, &jpeg(5, 4, [200, 40, 40]), &mut out).unwrap();
        let row = &out[..16];
        assert!(row[0] > 150 && row[1] < 100);
        // padding bytes untouched
        assert_eq!(&row[15..], &[0]);
    }

    #[test]
    fn jpeg_geometry_mismatch_is_rejected() {
        let fmt = format(8, 8, PixelFormat::Jpeg);
        let mut out = vec![0u8; fmt.output_len()];
        let err = decode_into(&fmt, &jpeg(16, 8, [0, 0, 0]), &mut out).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Geometry {
                actual_width: 16,
                ..
            }
        ));
    }

    #[test]
    fn jpeg_markers_are_checked() {
        assert!(jpeg_payload(&[0xFF, 0xD8, 0x00, 0x00]).is_err());
        assert!(jpeg_payload(&[0x00, 0xD8, 0xFF, 0xD9]).is_err());

        let padded = [0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0x00, 0x00];
        assert_eq!(jpeg_payload(&padded).unwrap().len(), 5);
    }

    #[test]
    fn other_formats_are_unsupported() {
        let fmt = format(2, 2, PixelFormat::Other("NV12".into()));
        let mut out = vec![0u8; fmt.output_len()];
        assert!(matches!(
            decode_into(&fmt, &[0; 6], &mut out),
            Err(DecodeError::Unsupported(_))
        ));
    }
}
