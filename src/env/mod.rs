//! Filesystem provider.
//!
//! The engine talks to storage exclusively through the `Env` trait:
//! sequential readers for logs, positional readers for tables, buffered
//! writers for logs/tables/manifests, plus the directory and lock
//! operations recovery needs. `DiskEnv` is the standard-library-backed
//! implementation; tests may substitute their own.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};

/// A file read from front to back (WAL and manifest replay).
pub trait SequentialFile: Send {
    /// Reads up to `buf.len()` bytes, returning how many were read. Zero
    /// means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Skips `n` bytes.
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// A file read at arbitrary offsets from multiple threads (tables).
pub trait RandomAccessFile: Send + Sync {
    /// Reads up to `n` bytes at `offset`. Short reads at end of file are
    /// not an error; callers validate the length.
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>>;
}

/// An append-only file (WAL, manifest, table output).
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Flushes and forces the data to stable storage.
    fn sync(&mut self) -> Result<()>;
}

pub trait Env: Send + Sync {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;
    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;
    /// Creates (truncating) a writable file.
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    /// Opens a writable file positioned at its current end.
    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    fn file_exists(&self, path: &Path) -> bool;
    /// Names (not paths) of the entries in `dir`.
    fn children(&self, dir: &Path) -> Result<Vec<String>>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn create_dir(&self, path: &Path) -> Result<()>;
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn file_size(&self, path: &Path) -> Result<u64>;
    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Takes an advisory exclusive lock on `path`, creating it if needed.
    /// Fails with `Error::LockHeld` if another process holds it. The lock
    /// is released when the returned guard is dropped.
    fn lock_file(&self, path: &Path) -> Result<FileLock>;
}

/// Reads a whole file into a string (used for `CURRENT`).
pub fn read_file_to_string(env: &dyn Env, path: &Path) -> Result<String> {
    let mut file = env.new_sequential_file(path)?;
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    String::from_utf8(data).map_err(|_| Error::corruption("file is not valid utf-8"))
}

/// Writes `data` to a fresh file at `path`, replacing any existing file,
/// and syncs it (used for `CURRENT` via a temp file + rename).
pub fn write_string_to_file_sync(env: &dyn Env, data: &str, path: &Path) -> Result<()> {
    let mut file = env.new_writable_file(path)?;
    file.append(data.as_bytes())?;
    file.sync()?;
    Ok(())
}

/// Guard for an exclusive database lock. Dropping it releases the lock;
/// the sentinel file itself is left in place.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let handle = file.as_raw_handle();
    let result = unsafe {
        LockFileEx(
            handle as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };
    if result == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> std::io::Result<()> {
    Ok(())
}

/// The standard-library disk implementation.
#[derive(Debug, Default)]
pub struct DiskEnv;

impl DiskEnv {
    /// The process-wide shared instance.
    pub fn shared() -> Arc<dyn Env> {
        static SHARED: OnceLock<Arc<DiskEnv>> = OnceLock::new();
        let shared: Arc<DiskEnv> = SHARED.get_or_init(|| Arc::new(DiskEnv)).clone();
        shared
    }
}

struct DiskSequentialFile {
    reader: BufReader<File>,
}

impl SequentialFile for DiskSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader.read(buf)?)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct DiskRandomAccessFile {
    #[cfg(any(unix, windows))]
    file: File,
    // Platforms without a positional read syscall fall back to seeking
    // under a lock.
    #[cfg(not(any(unix, windows)))]
    file: std::sync::Mutex<File>,
}

impl RandomAccessFile for DiskRandomAccessFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;

        let mut buf = vec![0u8; n];
        let mut read = 0;
        while read < n {
            let got = self.file.read_at(&mut buf[read..], offset + read as u64)?;
            if got == 0 {
                break;
            }
            read += got;
        }
        buf.truncate(read);
        Ok(buf)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        use std::os::windows::fs::FileExt;

        let mut buf = vec![0u8; n];
        let mut read = 0;
        while read < n {
            let got = self.file.seek_read(&mut buf[read..], offset + read as u64)?;
            if got == 0 {
                break;
            }
            read += got;
        }
        buf.truncate(read);
        Ok(buf)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_at(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; n];
        let mut read = 0;
        while read < n {
            let got = file.read(&mut buf[read..])?;
            if got == 0 {
                break;
            }
            read += got;
        }
        buf.truncate(read);
        Ok(buf)
    }
}

struct DiskWritableFile {
    writer: BufWriter<File>,
}

impl WritableFile for DiskWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl Env for DiskEnv {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = File::open(path)?;
        Ok(Box::new(DiskSequentialFile {
            reader: BufReader::new(file),
        }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        #[cfg(any(unix, windows))]
        return Ok(Box::new(DiskRandomAccessFile { file }));
        #[cfg(not(any(unix, windows)))]
        return Ok(Box::new(DiskRandomAccessFile {
            file: std::sync::Mutex::new(file),
        }));
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(DiskWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(DiskWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn lock_file(&self, path: &Path) -> Result<FileLock> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        if let Err(e) = try_lock(&file) {
            return Err(Error::LockHeld(format!("{}: {e}", path.display())));
        }
        // Record the owning pid for post-mortem debugging.
        let _ = writeln!(file, "{}", std::process::id());
        let _ = file.flush();
        Ok(FileLock {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}
