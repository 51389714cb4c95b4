//! Board health sensors
//!
//! The DEXTER baseboard exposes its supply rails and temperature through a
//! hwmon chip; the FPGA die temperature comes from the Zynq XADC, which
//! appears as an IIO device named `xadc`. Raw readings are in millivolts
//! behind resistor dividers and in milli-degrees, so every value is
//! corrected before it lands in the statistics map.

use std::fs;
use std::path::Path;

/// hwmon directory of the baseboard monitor chip
pub const HWMON_ROOT: &str = "/sys/bus/i2c/devices/1-002f/hwmon/hwmon0";

/// sysfs directory scanned for the XADC
pub const IIO_ROOT: &str = "/sys/bus/iio/devices";

/// Rails must lie within [0.85, 1.15] x nominal
const VMINFACT: f64 = 0.85;
const VMAXFACT: f64 = 1.15;

/// FPGA die temperature limit in degrees Celsius
const TEMP_LIMIT: f64 = 85.0;

/// Main input supply must exceed this, in volts
const VCC_MAIN_IN_MIN: f64 = 10.0;

/// One monitored supply rail
struct RailSpec {
    /// hwmon attribute file
    attr: &'static str,
    /// Name in the statistics map
    name: &'static str,
    /// Divider resistors (high side, low side) in kOhm
    divider: (f64, f64),
    /// Nominal voltage for the window check; None disables it
    nominal: Option<f64>,
}

const RAILS: &[RailSpec] = &[
    RailSpec {
        attr: "in0_input",
        name: "vcc_main_in",
        divider: (560.0, 22.0),
        nominal: None, // checked against VCC_MAIN_IN_MIN instead
    },
    RailSpec {
        attr: "in1_input",
        name: "vcc5v4",
        divider: (51.0, 36.0),
        nominal: Some(5.4),
    },
    RailSpec {
        attr: "in2_input",
        name: "vcc3v3",
        divider: (18.0, 36.0),
        nominal: Some(3.3),
    },
    RailSpec {
        attr: "in3_input",
        name: "vfan",
        divider: (560.0, 22.0),
        nominal: None,
    },
    RailSpec {
        attr: "in4_input",
        name: "vcc3v3pll",
        divider: (18.0, 36.0),
        nominal: Some(3.3),
    },
    RailSpec {
        attr: "in5_input",
        name: "vcc2v5io",
        divider: (4.7, 36.0),
        nominal: Some(2.5),
    },
    RailSpec {
        attr: "in6_input",
        name: "vccocxo",
        divider: (51.0, 36.0),
        nominal: None,
    },
];

/// Snapshot of all board health sensors
#[derive(Debug, Clone, Default)]
pub struct BoardHealth {
    /// Corrected rail voltages by statistics name; -1.0 marks a failed read
    pub rails: Vec<(&'static str, f64)>,
    /// FPGA die temperature, if the XADC was found
    pub temp_fpga: Option<f64>,
    /// At least one rail missing or outside its window
    pub voltage_alarm: bool,
    /// FPGA temperature missing or above the limit
    pub temp_alarm: bool,
}

/// Read every rail and the FPGA temperature below the given roots
pub fn read_board_health(hwmon_root: &Path, iio_root: &Path) -> BoardHealth {
    let mut health = BoardHealth::default();
    let mut voltage_ok = true;

    for rail in RAILS {
        match read_sensor(&hwmon_root.join(rail.attr)) {
            Some(raw_millivolts) => {
                let (high, low) = rail.divider;
                let volts = raw_millivolts * (high + low) / low / 1000.0;
                health.rails.push((rail.name, volts));

                if let Some(nominal) = rail.nominal {
                    voltage_ok &= volts > VMINFACT * nominal && volts < VMAXFACT * nominal;
                }
                if rail.name == "vcc_main_in" {
                    voltage_ok &= volts > VCC_MAIN_IN_MIN;
                }
            }
            None => {
                health.rails.push((rail.name, -1.0));
                voltage_ok = false;
            }
        }
    }

    health.temp_fpga = find_xadc_temperature(iio_root);
    let temp_ok = matches!(health.temp_fpga, Some(t) if t <= TEMP_LIMIT);

    health.voltage_alarm = !voltage_ok;
    health.temp_alarm = !temp_ok;
    health
}

/// Baseboard temperature in degrees Celsius
pub fn read_baseboard_temperature(hwmon_root: &Path) -> Option<f64> {
    read_sensor(&hwmon_root.join("temp1_input")).map(|millidegrees| millidegrees / 1000.0)
}

/// Scan the IIO devices for the XADC and read the die temperature
fn find_xadc_temperature(iio_root: &Path) -> Option<f64> {
    let entries = fs::read_dir(iio_root).ok()?;

    for entry in entries.filter_map(|e| e.ok()) {
        let dir_name = entry.file_name().to_string_lossy().to_string();
        if !dir_name.starts_with("iio:device") {
            continue;
        }
        let path = entry.path();
        match fs::read_to_string(path.join("name")) {
            Ok(name) if name.trim() == "xadc" => {
                let raw = read_sensor(&path.join("in_temp0_raw"))?;
                let offset = read_sensor(&path.join("in_temp0_offset"))?;
                let scale = read_sensor(&path.join("in_temp0_scale"))?;
                return Some((raw + offset) * scale / 1000.0);
            }
            _ => continue,
        }
    }
    None
}

fn read_sensor(path: &Path) -> Option<f64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| text.trim().parse::<f64>().ok())
}
