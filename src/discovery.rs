//! Capture device discovery and format listing

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use v4l::FourCC;

use crate::capture::driver::{CaptureDriver, DeviceProvider, OpenMode};
use crate::capture::frame::{PixelFormat, Resolution};
use crate::error::CaptureError;

/// A capture node together with its USB identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub path: PathBuf,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// A pixel format the device offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    pub pixel_format: PixelFormat,
    pub fourcc: FourCC,
    pub description: String,
}

/// Extracts vendor and product ids from a `usb:v<VID>p<PID>...` modalias.
pub fn parse_modalias(text: &str) -> Option<(u16, u16)> {
    let rest = text.trim().strip_prefix("usb:v")?;
    let vendor = u16::from_str_radix(rest.get(..4)?, 16).ok()?;
    let rest = rest.get(4..)?.strip_prefix('p')?;
    let product = u16::from_str_radix(rest.get(..4)?, 16).ok()?;
    Some((vendor, product))
}

/// Lists capture nodes that answer a format probe.
///
/// Each candidate is opened read-only just long enough to query its first
/// format descriptor; nodes that fail are left out.
pub fn enumerate(provider: &dyn DeviceProvider) -> Result<Vec<DeviceInfo>, CaptureError> {
    let nodes = provider.scan().map_err(|source| CaptureError::DeviceOpen {
        path: PathBuf::from("/dev"),
        source,
    })?;

    let mut devices = Vec::new();
    for node in nodes {
        let (vendor_id, product_id) = match provider.modalias(&node) {
            Ok(alias) => parse_modalias(&alias).unwrap_or_default(),
            Err(err) => {
                debug!(node = %node.name, %err, "no modalias");
                (0, 0)
            }
        };

        let probe = provider
            .open(&node.path, OpenMode::Probe)
            .and_then(|driver| driver.enum_formats());
        match probe {
            Ok(formats) if !formats.is_empty() => devices.push(DeviceInfo {
                path: node.path,
                vendor_id,
                product_id,
            }),
            Ok(_) => debug!(node = %node.name, "no capture formats, skipped"),
            Err(err) => debug!(node = %node.name, %err, "probe failed, skipped"),
        }
    }

    info!(count = devices.len(), "capture devices enumerated");
    Ok(devices)
}

/// Finds the first enumerated device with the given USB identity.
pub fn find_by_id(
    provider: &dyn DeviceProvider,
    vendor_id: u16,
    product_id: u16,
) -> Result<DeviceInfo, CaptureError> {
    enumerate(provider)?
        .into_iter()
        .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
        .ok_or(CaptureError::NotFound {
            vendor_id,
            product_id,
        })
}

fn open_checked(
    provider: &dyn DeviceProvider,
    path: &Path,
) -> Result<std::sync::Arc<dyn CaptureDriver>, CaptureError> {
    let driver = provider
        .open(path, OpenMode::Probe)
        .map_err(|source| CaptureError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;
    let cap = driver
        .query_capability()
        .map_err(|err| CaptureError::Capability {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if !cap.can_stream_capture() {
        return Err(CaptureError::Capability {
            path: path.to_path_buf(),
            reason: format!("{} lacks streaming video capture", cap.card),
        });
    }
    Ok(driver)
}

fn format_entries(driver: &dyn CaptureDriver) -> Vec<FormatEntry> {
    match driver.enum_formats() {
        Ok(formats) => formats
            .into_iter()
            .map(|desc| FormatEntry {
                pixel_format: PixelFormat::from_description(&desc.description),
                fourcc: desc.fourcc,
                description: desc.description,
            })
            .collect(),
        Err(err) => {
            debug!(%err, "format enumeration failed");
            Vec::new()
        }
    }
}

/// Every pixel format the device at `path` offers.
pub fn pixel_formats(
    provider: &dyn DeviceProvider,
    path: &Path,
) -> Result<Vec<FormatEntry>, CaptureError> {
    let driver = open_checked(provider, path)?;
    Ok(format_entries(driver.as_ref()))
}

/// Frame sizes offered for `encoding`, largest area first, without
/// duplicates.
pub fn resolutions(
    provider: &dyn DeviceProvider,
    path: &Path,
    encoding: &str,
) -> Result<Vec<Resolution>, CaptureError> {
    let driver = open_checked(provider, path)?;
    let wanted = PixelFormat::from_name(encoding);
    let Some(entry) = format_entries(driver.as_ref())
        .into_iter()
        .find(|entry| entry.pixel_format == wanted)
    else {
        return Ok(Vec::new());
    };

    let mut sizes: Vec<Resolution> = match driver.enum_frame_sizes(entry.fourcc) {
        Ok(sizes) => sizes
            .into_iter()
            .map(|(width, height)| Resolution::new(width, height))
            .collect(),
        Err(err) => {
            debug!(%err, "frame size enumeration failed");
            Vec::new()
        }
    };

    sizes.sort_by(|a, b| b.area().cmp(&a.area()).then(b.width.cmp(&a.width)));
    sizes.dedup();
    Ok(sizes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{FailPoint, FrameSource, SimFormat, SimulatedDriver, SimulatedProvider};
    use std::sync::Arc;
    use v4l::capability::Flags as CapFlags;

    #[test]
    fn modalias_parsing() {
        assert_eq!(
            parse_modalias("usb:v046Dp0825d0012dcEFdsc02dp01ic0Eisc01ip00in00\n"),
            Some((0x046d, 0x0825))
        );
        assert_eq!(parse_modalias("usb:v1BCFp2C99d0100"), Some((0x1bcf, 0x2c99)));
        assert_eq!(parse_modalias("pci:v00008086d00001234"), None);
        assert_eq!(parse_modalias("usb:vZZZZp0001"), None);
        assert_eq!(parse_modalias("usb:v046D"), None);
    }

    #[test]
    fn enumerate_skips_failing_nodes() {
        let provider = SimulatedProvider::new();
        provider.add(
            "/dev/video0",
            "usb:v046Dp0825d0012",
            Arc::new(SimulatedDriver::webcam()),
        );
        let broken = Arc::new(SimulatedDriver::webcam());
        broken.fail_at(FailPoint::EnumFormat);
        provider.add("/dev/video1", "usb:v1234p5678d0001", broken);

        let devices = enumerate(&provider).unwrap();
        assert_eq!(
            devices,
            vec![DeviceInfo {
                path: PathBuf::from("/dev/video0"),
                vendor_id: 0x046d,
                product_id: 0x0825,
            }]
        );

        assert!(find_by_id(&provider, 0x046d, 0x0825).is_ok());
        assert!(matches!(
            find_by_id(&provider, 0x1234, 0x5678),
            Err(CaptureError::NotFound { .. })
        ));
    }

    #[test]
    fn formats_use_logical_names() {
        let provider = SimulatedProvider::single(Arc::new(SimulatedDriver::webcam()));
        let formats = pixel_formats(&provider, Path::new("/dev/video0")).unwrap();
        let names: Vec<_> = formats.iter().map(|f| f.pixel_format.name()).collect();
        assert_eq!(names, ["JPEG", "YUYV"]);
    }

    #[test]
    fn resolutions_sorted_by_area_and_deduplicated() {
        let driver = SimulatedDriver::new(
            vec![SimFormat::mjpeg(&[(320, 240), (1280, 720), (640, 480), (1280, 720)])],
            FrameSource::Repeat(Vec::new()),
        );
        let provider = SimulatedProvider::single(Arc::new(driver));
        let sizes = resolutions(&provider, Path::new("/dev/video0"), "JPEG").unwrap();
        assert_eq!(
            sizes,
            vec![
                Resolution::new(1280, 720),
                Resolution::new(640, 480),
                Resolution::new(320, 240),
            ]
        );
        assert!(resolutions(&provider, Path::new("/dev/video0"), "YUYV")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn format_listing_requires_streaming_capture() {
        let driver = SimulatedDriver::webcam().with_capability_flags(CapFlags::VIDEO_OUTPUT);
        let provider = SimulatedProvider::single(Arc::new(driver));
        assert!(matches!(
            pixel_formats(&provider, Path::new("/dev/video0")),
            Err(CaptureError::Capability { .. })
        ));
    }
}
