//! IIO attribute bus
//!
//! The DEXTER FPGA registers are reached through Linux industrial-I/O
//! device attributes; sample data is pushed through the buffer character
//! device. [`IioBus`] abstracts the bus so the driver logic can be
//! exercised against a scripted backend; [`LocalIio`] is the real thing,
//! scanning `/sys/bus/iio/devices` for the board's logical devices.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SdrError};

/// DSP block: gain, frequency, scheduling and clock attributes
pub const DSP_TX: &str = "dexter_dsp_tx";
/// AD9957 upconverter: centre frequency
pub const UPCONVERTER: &str = "ad9957";
/// AD9957 sample sink: TX channel and DMA buffer
pub const SAMPLE_SINK: &str = "ad9957_tx0";

/// Attribute-level access to the IIO devices of one context.
///
/// Mirrors the narrow slice of libiio the driver needs: integer attribute
/// I/O, one enabled channel and one cyclic pair of DMA blocks on the
/// sample sink. `push_block` follows the `iio_buffer_push` convention of
/// returning a negative value on failure so an underflow can be told
/// apart at the call site.
pub trait IioBus: Send {
    /// Set the attribute-operation timeout of the context
    fn set_timeout(&mut self, timeout: Duration);

    /// Whether a device with this name exists in the context
    fn has_device(&self, device: &'static str) -> bool;

    /// Read an integer device attribute
    fn attr_read(&mut self, device: &'static str, attr: &'static str) -> Result<i64>;

    /// Write an integer device attribute
    fn attr_write(&mut self, device: &'static str, attr: &'static str, value: i64) -> Result<()>;

    /// Enable the TX channel of the given device
    fn enable_channel(&mut self, device: &'static str) -> Result<()>;

    /// Disable the TX channel again
    fn disable_channel(&mut self, device: &'static str);

    /// Allocate the DMA buffer on the given device, sized in samples
    fn create_buffer(&mut self, device: &'static str, len_samples: usize) -> Result<()>;

    /// Destroy the DMA buffer
    fn destroy_buffer(&mut self);

    /// Push one block of interleaved `i16` sample bytes into the buffer.
    /// Returns the number of bytes pushed, or a negative value on failure.
    fn push_block(&mut self, data: &[u8]) -> isize;
}

/// Local IIO context backed by sysfs and the buffer character devices
pub struct LocalIio {
    /// Device name to sysfs directory
    devices: BTreeMap<String, PathBuf>,
    /// Root holding the `iio:deviceN` character devices
    dev_root: PathBuf,
    /// Open buffer character device, once created
    buffer: Option<File>,
}

impl LocalIio {
    /// Open the local context, scanning the standard sysfs location
    pub fn open() -> Result<Self> {
        Self::with_roots(Path::new("/sys/bus/iio/devices"), Path::new("/dev"))
    }

    /// Open a context rooted at the given sysfs and dev directories
    pub fn with_roots(sysfs_root: &Path, dev_root: &Path) -> Result<Self> {
        let mut devices = BTreeMap::new();

        if let Ok(entries) = fs::read_dir(sysfs_root) {
            for entry in entries.filter_map(|e| e.ok()) {
                let dir_name = entry.file_name().to_string_lossy().to_string();
                if !dir_name.starts_with("iio:device") {
                    continue;
                }
                if let Ok(name) = fs::read_to_string(entry.path().join("name")) {
                    devices.insert(name.trim().to_string(), entry.path());
                }
            }
        }

        if devices.is_empty() {
            return Err(SdrError::DeviceNotFound(format!(
                "no IIO devices under {}",
                sysfs_root.display()
            )));
        }

        Ok(Self {
            devices,
            dev_root: dev_root.to_path_buf(),
            buffer: None,
        })
    }

    /// Whether a device with this name exists in the context
    pub fn has_device(&self, device: &str) -> bool {
        self.devices.contains_key(device)
    }

    fn device_dir(&self, device: &'static str) -> Result<&PathBuf> {
        self.devices
            .get(device)
            .ok_or_else(|| SdrError::DeviceNotFound(device.to_string()))
    }

    /// Character device path of a device's buffer
    fn chardev(&self, device: &'static str) -> Result<PathBuf> {
        let dir = self.device_dir(device)?;
        let node = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(self.dev_root.join(node))
    }
}

impl IioBus for LocalIio {
    fn set_timeout(&mut self, timeout: Duration) {
        // sysfs attribute I/O has no per-operation deadline to arm
        tracing::debug!("IIO attribute timeout set to {:?}", timeout);
    }

    fn has_device(&self, device: &'static str) -> bool {
        LocalIio::has_device(self, device)
    }

    fn attr_read(&mut self, device: &'static str, attr: &'static str) -> Result<i64> {
        let path = self.device_dir(device)?.join(attr);
        let text = fs::read_to_string(&path).map_err(|e| SdrError::AttrRead {
            device,
            attr,
            reason: e.to_string(),
        })?;
        text.trim().parse::<i64>().map_err(|e| SdrError::AttrRead {
            device,
            attr,
            reason: e.to_string(),
        })
    }

    fn attr_write(&mut self, device: &'static str, attr: &'static str, value: i64) -> Result<()> {
        let path = self.device_dir(device)?.join(attr);
        fs::write(&path, format!("{}\n", value)).map_err(|e| SdrError::AttrWrite {
            device,
            attr,
            value,
            reason: e.to_string(),
        })
    }

    fn enable_channel(&mut self, device: &'static str) -> Result<()> {
        let path = self
            .device_dir(device)?
            .join("scan_elements/out_voltage0_en");
        fs::write(&path, "1\n").map_err(SdrError::from)
    }

    fn disable_channel(&mut self, device: &'static str) {
        if let Ok(dir) = self.device_dir(device) {
            let path = dir.join("scan_elements/out_voltage0_en");
            if let Err(e) = fs::write(&path, "0\n") {
                tracing::warn!("failed to disable channel on {}: {}", device, e);
            }
        }
    }

    fn create_buffer(&mut self, device: &'static str, len_samples: usize) -> Result<()> {
        {
            let dir = self.device_dir(device)?;
            fs::write(dir.join("buffer/length"), format!("{}\n", len_samples))?;
            fs::write(dir.join("buffer/enable"), "1\n")?;
        }

        let chardev = self.chardev(device)?;
        let file = OpenOptions::new().write(true).open(&chardev)?;
        self.buffer = Some(file);
        Ok(())
    }

    fn destroy_buffer(&mut self) {
        self.buffer = None;
    }

    fn push_block(&mut self, data: &[u8]) -> isize {
        let Some(buffer) = self.buffer.as_mut() else {
            return -(libc_enodev() as isize);
        };

        match buffer.write_all(data).and_then(|_| buffer.flush()) {
            Ok(()) => data.len() as isize,
            Err(e) => -(e.raw_os_error().unwrap_or(libc_enodev()) as isize),
        }
    }
}

#[cfg(target_os = "linux")]
fn libc_enodev() -> i32 {
    libc::ENODEV
}

#[cfg(not(target_os = "linux"))]
fn libc_enodev() -> i32 {
    19
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal fake sysfs tree with the three DEXTER devices
    fn fake_context() -> (tempfile::TempDir, LocalIio) {
        let tmp = tempfile::tempdir().unwrap();
        let sysfs = tmp.path().join("sys");
        let dev = tmp.path().join("dev");
        fs::create_dir_all(&dev).unwrap();

        for (i, name) in [DSP_TX, UPCONVERTER, SAMPLE_SINK].iter().enumerate() {
            let dir = sysfs.join(format!("iio:device{}", i));
            fs::create_dir_all(dir.join("scan_elements")).unwrap();
            fs::create_dir_all(dir.join("buffer")).unwrap();
            fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
            fs::write(dev.join(format!("iio:device{}", i)), "").unwrap();
        }

        let ctx = LocalIio::with_roots(&sysfs, &dev).unwrap();
        (tmp, ctx)
    }

    #[test]
    fn test_scan_finds_devices() {
        let (_tmp, ctx) = fake_context();
        assert!(ctx.has_device(DSP_TX));
        assert!(ctx.has_device(UPCONVERTER));
        assert!(ctx.has_device(SAMPLE_SINK));
        assert!(!ctx.has_device("xadc"));
    }

    #[test]
    fn test_attr_round_trip() {
        let (_tmp, mut ctx) = fake_context();
        ctx.attr_write(DSP_TX, "gain0", 75).unwrap();
        assert_eq!(ctx.attr_read(DSP_TX, "gain0").unwrap(), 75);
    }

    #[test]
    fn test_attr_read_missing() {
        let (_tmp, mut ctx) = fake_context();
        assert!(matches!(
            ctx.attr_read(DSP_TX, "no_such_attr"),
            Err(SdrError::AttrRead { .. })
        ));
    }

    #[test]
    fn test_buffer_push() {
        let (_tmp, mut ctx) = fake_context();

        // pushing without a buffer fails with a negative result
        assert!(ctx.push_block(&[0u8; 16]) < 0);

        ctx.enable_channel(SAMPLE_SINK).unwrap();
        ctx.create_buffer(SAMPLE_SINK, 8).unwrap();
        assert_eq!(ctx.push_block(&[0u8; 16]), 16);

        ctx.destroy_buffer();
        assert!(ctx.push_block(&[0u8; 16]) < 0);
    }

    #[test]
    fn test_empty_context_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            LocalIio::with_roots(tmp.path(), tmp.path()),
            Err(SdrError::DeviceNotFound(_))
        ));
    }
}
