//! Filesystem abstraction so collection logic runs against the real /proc
//! on Linux and against canned contents in tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Filesystem operations the collector needs.
pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Total and available bytes of the filesystem containing `path`.
    fn disk_usage(&self, path: &Path) -> io::Result<(u64, u64)>;
}

/// Real filesystem, delegating to `std::fs` and `statvfs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    #[cfg(unix)]
    fn disk_usage(&self, path: &Path) -> io::Result<(u64, u64)> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let block = if stat.f_frsize > 0 {
            stat.f_frsize as u64
        } else {
            stat.f_bsize as u64
        };
        Ok((stat.f_blocks as u64 * block, stat.f_bavail as u64 * block))
    }

    #[cfg(not(unix))]
    fn disk_usage(&self, _path: &Path) -> io::Result<(u64, u64)> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "statvfs"))
    }
}

/// In-memory filesystem for tests. Cloning shares the underlying contents,
/// so a test can mutate files between collections.
#[derive(Clone, Default)]
pub struct MockFs {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    disks: Arc<Mutex<HashMap<PathBuf, (u64, u64)>>>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.lock().unwrap().insert(path.into(), content.into());
    }

    pub fn set_disk(&self, mount: impl Into<PathBuf>, total: u64, available: u64) {
        self.disks
            .lock()
            .unwrap()
            .insert(mount.into(), (total, available));
    }

    /// A small single-core host with one disk and one interface.
    pub fn typical_system() -> Self {
        let fs = Self::new();
        fs.set(
            "/proc/stat",
            "cpu  100 0 50 1000 0 0 0 0 0 0\ncpu0 100 0 50 1000 0 0 0 0 0 0\n",
        );
        fs.set(
            "/proc/meminfo",
            "MemTotal:       2048000 kB\nMemFree:         512000 kB\n\
             MemAvailable:   1024000 kB\nSwapTotal:       102400 kB\nSwapFree:       102400 kB\n",
        );
        fs.set("/proc/loadavg", "0.52 0.58 0.59 1/467 12345\n");
        fs.set("/proc/uptime", "12345.67 23456.78\n");
        fs.set(
            "/proc/net/dev",
            "Inter-|   Receive                                                |  Transmit\n\
             face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
             lo: 999 9 0 0 0 0 0 0 999 9 0 0 0 0 0 0\n\
             eth0: 1000000 1000 0 0 0 0 0 0 500000 500 0 0 0 0 0 0\n",
        );
        fs.set(
            "/proc/cpuinfo",
            "processor\t: 0\nmodel name\t: Mock CPU @ 2.00GHz\ncpu MHz\t\t: 2000.000\n",
        );
        fs.set("/proc/sys/kernel/hostname", "testhost\n");
        fs.set(
            "/proc/mounts",
            "/dev/sda1 / ext4 rw 0 0\n/dev/sda1 /home ext4 rw 0 0\nproc /proc proc rw 0 0\n",
        );
        fs.set("/sys/class/net/eth0/address", "aa:bb:cc:dd:ee:ff\n");
        fs.set("/sys/class/net/eth0/speed", "1000\n");
        fs.set(
            "/etc/os-release",
            "NAME=\"Mock Linux\"\nPRETTY_NAME=\"Mock Linux 1.0\"\n",
        );
        fs.set_disk("/", 1000, 600);
        fs.set_disk("/home", 1000, 600);
        fs
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn disk_usage(&self, path: &Path) -> io::Result<(u64, u64)> {
        self.disks
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}
