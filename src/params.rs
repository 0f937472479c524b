//! Named camera controls: read, write, canned profiles and persistence

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::driver::CaptureDriver;
use crate::error::{ControlError, ParamError};

/// V4L2 control ids used by the store
pub mod cid {
    const USER_BASE: u32 = 0x0098_0900;
    const CAMERA_BASE: u32 = 0x009a_0900;

    pub const BRIGHTNESS: u32 = USER_BASE;
    pub const CONTRAST: u32 = USER_BASE + 1;
    pub const SATURATION: u32 = USER_BASE + 2;
    pub const HUE: u32 = USER_BASE + 3;
    pub const AUTO_WHITE_BALANCE: u32 = USER_BASE + 12;
    pub const GAMMA: u32 = USER_BASE + 16;
    pub const EXPOSURE: u32 = USER_BASE + 17;
    pub const AUTOGAIN: u32 = USER_BASE + 18;
    pub const GAIN: u32 = USER_BASE + 19;
    pub const POWER_LINE_FREQUENCY: u32 = USER_BASE + 24;
    pub const HUE_AUTO: u32 = USER_BASE + 25;
    pub const WHITE_BALANCE_TEMPERATURE: u32 = USER_BASE + 26;
    pub const SHARPNESS: u32 = USER_BASE + 27;
    pub const BACKLIGHT_COMPENSATION: u32 = USER_BASE + 28;
    pub const AUTOBRIGHTNESS: u32 = USER_BASE + 32;

    pub const EXPOSURE_AUTO: u32 = CAMERA_BASE + 1;
    pub const EXPOSURE_ABSOLUTE: u32 = CAMERA_BASE + 2;
    pub const FOCUS_AUTO: u32 = CAMERA_BASE + 12;
}

/// `V4L2_CID_EXPOSURE_AUTO` menu entries
pub mod exposure {
    pub const AUTO: i32 = 0;
    pub const MANUAL: i32 = 1;
    pub const SHUTTER_PRIORITY: i32 = 2;
    pub const APERTURE_PRIORITY: i32 = 3;
}

pub const POWER_LINE_FREQUENCY_50HZ: i32 = 1;

/// Value reported for controls that cannot be read
pub const UNSUPPORTED: i32 = -1;

/// Named controls and their canned default values
const DEFAULT_PROFILE: [(&str, u32, i32); 15] = [
    ("WhiteBalanceMode", cid::AUTO_WHITE_BALANCE, 0),
    ("WhiteBalanceTemperature", cid::WHITE_BALANCE_TEMPERATURE, 4600),
    ("BrightnessMode", cid::AUTOBRIGHTNESS, 0),
    ("Brightness", cid::BRIGHTNESS, 0),
    ("Contrast", cid::CONTRAST, 32),
    ("Saturation", cid::SATURATION, 64),
    ("Hue", cid::HUE, 0),
    ("Sharpness", cid::SHARPNESS, 2),
    ("BacklightCompensation", cid::BACKLIGHT_COMPENSATION, 0),
    ("Gamma", cid::GAMMA, 0),
    ("ExposureMode", cid::EXPOSURE_AUTO, exposure::APERTURE_PRIORITY),
    ("ExposureAbsolute", cid::EXPOSURE_ABSOLUTE, 1500),
    ("AutoGain", cid::AUTOGAIN, 1),
    ("Gain", cid::GAIN, 4),
    ("PowerLineFrequence", cid::POWER_LINE_FREQUENCY, POWER_LINE_FREQUENCY_50HZ),
];

/// Automatic profile: continuous focus off, everything else automatic
const AUTO_PROFILE: [(u32, i32); 5] = [
    (cid::FOCUS_AUTO, 0),
    (cid::HUE_AUTO, 1),
    (cid::AUTOGAIN, 1),
    (cid::AUTO_WHITE_BALANCE, 1),
    (cid::EXPOSURE_AUTO, exposure::APERTURE_PRIORITY),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlParameter {
    pub id: u32,
    /// Last value written or read back
    pub value: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlFlag {
    Auto,
    Manual,
}

/// Driver-reported bounds of a control plus its current value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlRange {
    pub id: u32,
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub default: i32,
    pub value: i32,
    pub flag: ControlFlag,
}

/// The mode control that switches `id` between automatic and manual.
fn mode_control(id: u32) -> Option<u32> {
    match id {
        cid::AUTO_WHITE_BALANCE | cid::WHITE_BALANCE_TEMPERATURE => Some(cid::AUTO_WHITE_BALANCE),
        cid::AUTOBRIGHTNESS | cid::BRIGHTNESS => Some(cid::AUTOBRIGHTNESS),
        cid::EXPOSURE_AUTO | cid::EXPOSURE_ABSOLUTE => Some(cid::EXPOSURE_AUTO),
        cid::AUTOGAIN | cid::GAIN => Some(cid::AUTOGAIN),
        cid::HUE_AUTO | cid::HUE => Some(cid::HUE_AUTO),
        _ => None,
    }
}

fn is_auto(mode_id: u32, value: i32) -> bool {
    match mode_id {
        cid::EXPOSURE_AUTO => value != exposure::MANUAL,
        _ => value != 0,
    }
}

#[derive(Serialize)]
struct ParameterFile<'a> {
    parameter: &'a BTreeMap<String, i32>,
}

/// Flat name -> control map bound to the open device.
///
/// Writes never fail loudly: a control the camera lacks is skipped with a
/// log record, so one profile works across cameras.
pub struct ParameterStore {
    driver: Option<Arc<dyn CaptureDriver>>,
    controls: BTreeMap<String, ControlParameter>,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterStore {
    pub fn new() -> Self {
        let controls = DEFAULT_PROFILE
            .iter()
            .map(|&(name, id, value)| (name.to_string(), ControlParameter { id, value }))
            .collect();
        Self {
            driver: None,
            controls,
        }
    }

    pub fn bind(&mut self, driver: Arc<dyn CaptureDriver>) {
        self.driver = Some(driver);
    }

    pub fn unbind(&mut self) {
        self.driver = None;
    }

    pub fn is_bound(&self) -> bool {
        self.driver.is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.controls.keys().map(String::as_str)
    }

    pub fn control(&self, name: &str) -> Option<ControlParameter> {
        self.controls.get(name).copied()
    }

    /// Current driver value of `name`, or [`UNSUPPORTED`].
    pub fn get(&self, name: &str) -> i32 {
        match self.controls.get(name) {
            Some(control) => self.read(control.id),
            None => UNSUPPORTED,
        }
    }

    /// Writes `name`, logging and otherwise ignoring any failure.
    pub fn set(&mut self, name: &str, value: i32) {
        if let Err(err) = self.try_set(name, value) {
            match err {
                ControlError::Unsupported { .. } | ControlError::Disabled { .. } => {
                    debug!(name, value, %err, "control skipped")
                }
                _ => warn!(name, value, %err, "control not set"),
            }
        }
    }

    pub fn try_set(&mut self, name: &str, value: i32) -> Result<(), ControlError> {
        let id = self
            .controls
            .get(name)
            .map(|c| c.id)
            .ok_or_else(|| ControlError::UnknownName(name.to_string()))?;
        self.write(id, value)?;
        if let Some(control) = self.controls.get_mut(name) {
            control.value = value;
        }
        Ok(())
    }

    /// Bounds and automatic/manual state of `name`, `None` when the device
    /// does not expose it.
    pub fn range(&self, name: &str) -> Option<ControlRange> {
        let driver = self.driver.as_ref()?;
        let id = self.controls.get(name)?.id;
        let info = driver.query_control(id).ok()?;
        if info.is_disabled() {
            return None;
        }

        let flag = match mode_control(id) {
            Some(mode_id) => {
                let mode = self.read(mode_id);
                if mode != UNSUPPORTED && is_auto(mode_id, mode) {
                    ControlFlag::Auto
                } else {
                    ControlFlag::Manual
                }
            }
            None => ControlFlag::Manual,
        };

        Some(ControlRange {
            id,
            min: info.minimum,
            max: info.maximum,
            step: info.step,
            default: info.default_value,
            value: self.read(id),
            flag,
        })
    }

    /// Pushes the canned profile to the device.
    pub fn apply_defaults(&mut self) {
        for (name, _, value) in DEFAULT_PROFILE {
            self.set(name, value);
        }
        info!("default parameters applied");
    }

    /// Switches every automatic control on, except continuous focus.
    pub fn apply_auto(&mut self) {
        for (id, value) in AUTO_PROFILE {
            if let Err(err) = self.write(id, value) {
                debug!(id = %format_args!("{id:#010x}"), value, %err, "auto control skipped");
            }
        }
        info!("automatic parameters applied");
    }

    /// Reads every control back from the device.
    pub fn refresh(&mut self) -> BTreeMap<String, i32> {
        let Some(driver) = self.driver.clone() else {
            return self.values();
        };
        for control in self.controls.values_mut() {
            control.value = driver.control(control.id).unwrap_or(UNSUPPORTED);
        }
        self.values()
    }

    pub fn values(&self) -> BTreeMap<String, i32> {
        self.controls
            .iter()
            .map(|(name, control)| (name.clone(), control.value))
            .collect()
    }

    /// Refreshes from the device and writes `[parameter] Name = value`.
    pub fn save(&mut self, path: &Path) -> Result<(), ParamError> {
        let values = self.refresh();
        let document = toml::to_string_pretty(&ParameterFile {
            parameter: &values,
        })?;
        fs::write(path, document).map_err(|source| ParamError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "parameters saved");
        Ok(())
    }

    /// Applies every readable entry of a parameter file independently.
    ///
    /// Unknown names and non-integer values are skipped; a file that is not
    /// valid TOML is read line by line as `Name = value`. Returns how many
    /// entries were applied (stored, when no device is bound).
    pub fn load(&mut self, path: &Path) -> Result<usize, ParamError> {
        let text = fs::read_to_string(path).map_err(|source| ParamError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let entries = match text.parse::<toml::Table>() {
            Ok(table) => entries_from_table(&table),
            Err(err) => {
                warn!(path = %path.display(), %err, "parameter file is not valid TOML, reading lines");
                entries_from_lines(&text)
            }
        };

        let mut applied = 0;
        for (name, value) in entries {
            let Some(control) = self.controls.get_mut(&name) else {
                warn!(name = %name, "unknown parameter skipped");
                continue;
            };
            if self.driver.is_none() {
                control.value = value;
                applied += 1;
                continue;
            }
            match self.try_set(&name, value) {
                Ok(()) => applied += 1,
                Err(err) => debug!(name = %name, value, %err, "parameter not applied"),
            }
        }

        info!(path = %path.display(), applied, "parameters loaded");
        Ok(applied)
    }

    fn read(&self, id: u32) -> i32 {
        self.driver
            .as_ref()
            .and_then(|driver| driver.control(id).ok())
            .unwrap_or(UNSUPPORTED)
    }

    fn write(&self, id: u32, value: i32) -> Result<(), ControlError> {
        let driver = self.driver.as_ref().ok_or(ControlError::Unbound)?;
        let info = driver.query_control(id).map_err(|source| {
            if source.raw_os_error() == Some(libc::EINVAL)
                || source.kind() == std::io::ErrorKind::InvalidInput
            {
                ControlError::Unsupported { id }
            } else {
                ControlError::Io { id, source }
            }
        })?;
        if info.is_disabled() {
            return Err(ControlError::Disabled { id });
        }
        driver
            .set_control(id, value)
            .map_err(|source| ControlError::Io { id, source })
    }
}

fn entries_from_table(table: &toml::Table) -> Vec<(String, i32)> {
    let Some(section) = table.get("parameter").and_then(|v| v.as_table()) else {
        warn!("parameter file has no [parameter] table");
        return Vec::new();
    };
    section
        .iter()
        .filter_map(|(name, value)| {
            match value.as_integer().and_then(|v| i32::try_from(v).ok()) {
                Some(value) => Some((name.clone(), value)),
                None => {
                    warn!(name = %name, %value, "non-integer parameter skipped");
                    None
                }
            }
        })
        .collect()
}

fn entries_from_lines(text: &str) -> Vec<(String, i32)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('['))
        .filter_map(|line| {
            let (name, value) = line.split_once('=')?;
            let name = name.trim();
            match value.trim().parse::<i32>() {
                Ok(value) => Some((name.to_string(), value)),
                Err(_) => {
                    warn!(name, "non-integer parameter skipped");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::{default_controls, FrameSource, SimFormat, SimulatedDriver};

    fn bound(driver: SimulatedDriver) -> (ParameterStore, Arc<SimulatedDriver>) {
        let driver = Arc::new(driver);
        let mut store = ParameterStore::new();
        store.bind(driver.clone());
        (store, driver)
    }

    #[test]
    fn unbound_store_reports_sentinel() {
        let mut store = ParameterStore::new();
        assert_eq!(store.get("Contrast"), UNSUPPORTED);
        assert!(matches!(store.try_set("Contrast", 10), Err(ControlError::Unbound)));
        assert!(store.range("Contrast").is_none());
        assert_eq!(store.names().count(), 15);
    }

    #[test]
    fn unsupported_control_is_a_silent_noop() {
        let controls = default_controls()
            .into_iter()
            .filter(|c| c.id != cid::GAMMA)
            .collect();
        let driver = SimulatedDriver::new(vec![SimFormat::mjpeg(&[(64, 48)])], FrameSource::Repeat(Vec::new()))
            .with_controls(controls);
        let (mut store, driver) = bound(driver);

        let before = store.control("Gamma");
        store.set("Gamma", 120);
        assert_eq!(store.get("Gamma"), UNSUPPORTED);
        assert_eq!(store.control("Gamma"), before);
        assert_eq!(driver.control_value(cid::GAMMA), None);
        assert!(matches!(
            store.try_set("Gamma", 120),
            Err(ControlError::Unsupported { id: cid::GAMMA })
        ));
        assert!(matches!(
            store.try_set("Nope", 1),
            Err(ControlError::UnknownName(_))
        ));
    }

    #[test]
    fn defaults_reach_the_device() {
        let (mut store, driver) = bound(SimulatedDriver::webcam());
        store.apply_defaults();
        assert_eq!(driver.control_value(cid::WHITE_BALANCE_TEMPERATURE), Some(4600));
        assert_eq!(driver.control_value(cid::SHARPNESS), Some(2));
        assert_eq!(driver.control_value(cid::EXPOSURE_ABSOLUTE), Some(1500));
        assert_eq!(store.get("Gain"), 4);
    }

    #[test]
    fn range_reports_auto_flag() {
        let (mut store, _driver) = bound(SimulatedDriver::webcam());
        store.set("WhiteBalanceMode", 1);
        let range = store.range("WhiteBalanceTemperature").unwrap();
        assert_eq!(range.flag, ControlFlag::Auto);
        assert_eq!((range.min, range.max), (2800, 6500));

        store.set("ExposureMode", exposure::MANUAL);
        assert_eq!(store.range("ExposureAbsolute").unwrap().flag, ControlFlag::Manual);
        assert_eq!(store.range("Contrast").unwrap().flag, ControlFlag::Manual);
    }

    #[test]
    fn auto_profile_turns_automatics_on() {
        let (mut store, driver) = bound(SimulatedDriver::webcam());
        store.apply_defaults();
        store.apply_auto();
        assert_eq!(driver.control_value(cid::AUTO_WHITE_BALANCE), Some(1));
        assert_eq!(driver.control_value(cid::HUE_AUTO), Some(1));
        assert_eq!(driver.control_value(cid::FOCUS_AUTO), Some(0));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");

        let (mut store, driver) = bound(SimulatedDriver::webcam());
        store.apply_defaults();
        store.set("Contrast", 40);
        store.set("Brightness", -12);
        store.save(&path).unwrap();
        let saved = store.values();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("[parameter]"));
        assert!(text.contains("Contrast = 40"));

        store.set("Contrast", 0);
        store.set("Brightness", 30);
        let applied = store.load(&path).unwrap();
        assert_eq!(applied, 15);
        assert_eq!(store.refresh(), saved);
        assert_eq!(driver.control_value(cid::BRIGHTNESS), Some(-12));
    }

    #[test]
    fn load_is_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        fs::write(
            &path,
            "[parameter]\nContrast = 20\nSaturation = \"high\"\nBogus = 3\nHue = 999\n",
        )
        .unwrap();

        let (mut store, driver) = bound(SimulatedDriver::webcam());
        // Hue 999 is out of range and rejected by the driver
        assert_eq!(store.load(&path).unwrap(), 1);
        assert_eq!(driver.control_value(cid::CONTRAST), Some(20));
    }

    #[test]
    fn load_falls_back_to_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.txt");
        fs::write(&path, "Contrast = 21\nthis is = not toml = at all\nGain = 7\n").unwrap();

        let (mut store, driver) = bound(SimulatedDriver::webcam());
        assert_eq!(store.load(&path).unwrap(), 2);
        assert_eq!(driver.control_value(cid::CONTRAST), Some(21));
        assert_eq!(driver.control_value(cid::GAIN), Some(7));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let mut store = ParameterStore::new();
        assert!(matches!(
            store.load(Path::new("/nonexistent/params.toml")),
            Err(ParamError::Io { .. })
        ));
    }
}
