//! ByteSource: the exclusive channel to the process image.
//!
//! The engine and the bulk operations only see the [`ByteSource`] trait.
//! Two implementations live here:
//!
//! - [`FileSource`] opens the piControl character device or a plain file
//!   used for simulation. ioctls are forwarded on character devices only.
//! - [`MemoryByteSource`] keeps the image in memory and shares it with a
//!   [`MemoryHandle`], so tests can play the role of the hardware.
//!
//! An ioctl the source cannot perform returns [`io::ErrorKind::Unsupported`];
//! callers then fall back to a read/modify/write of the affected bytes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use procimg_common::consts::IOCTL_SET_BIT;
use tracing::debug;

// ─── Contract ───────────────────────────────────────────────────────

/// Seekable byte channel to the process image.
pub trait ByteSource: Send {
    /// Move to an absolute offset.
    fn seek(&mut self, offset: u64) -> io::Result<()>;

    /// Fill `buf` from the current position, returns the byte count.
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read up to `max_len` bytes.
    fn read(&mut self, max_len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; max_len];
        let n = self.read_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` at the current position, returns the byte count.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Push buffered writes out.
    fn flush(&mut self) -> io::Result<()>;

    /// Release the channel.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Out-of-band control request; `arg` may be filled with a reply.
    fn ioctl(&mut self, request: u32, arg: &mut [u8]) -> io::Result<()> {
        let _ = arg;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("ioctl {request} not supported"),
        ))
    }

    /// Writes are buffered and need a [`flush`](Self::flush).
    fn buffered(&self) -> bool {
        false
    }
}

/// Read exactly `buf.len()` bytes at `offset`.
pub fn read_exact_at(source: &mut dyn ByteSource, offset: usize, buf: &mut [u8]) -> io::Result<()> {
    source.seek(offset as u64)?;
    let n = source.read_into(buf)?;
    if n < buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read at {offset}: {n} of {} bytes", buf.len()),
        ));
    }
    Ok(())
}

/// Write all of `data` at `offset`.
pub fn write_all_at(source: &mut dyn ByteSource, offset: usize, data: &[u8]) -> io::Result<()> {
    source.seek(offset as u64)?;
    let n = source.write(data)?;
    if n < data.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write at {offset}: {n} of {} bytes", data.len()),
        ));
    }
    Ok(())
}

/// Argument of the set-bit ioctl: `u16 LE address, u8 bit[, u8 1]`.
pub fn set_bit_arg(address: u16, bit: u8, value: bool) -> Vec<u8> {
    let mut arg = address.to_le_bytes().to_vec();
    arg.push(bit);
    if value {
        arg.push(1);
    }
    arg
}

/// Set one bit of the image directly.
///
/// Uses the set-bit ioctl and falls back to a read/modify/write of the
/// byte when the source does not support it.
pub fn set_bit(source: &mut dyn ByteSource, address: usize, bit: u8, value: bool) -> io::Result<()> {
    let mut arg = set_bit_arg(address as u16, bit, value);
    match source.ioctl(IOCTL_SET_BIT, &mut arg) {
        Err(e) if e.kind() == io::ErrorKind::Unsupported => simulate_set_bit(source, &arg),
        other => other,
    }
}

/// Read/modify/write equivalent of the set-bit ioctl.
pub fn simulate_set_bit(source: &mut dyn ByteSource, arg: &[u8]) -> io::Result<()> {
    if arg.len() < 3 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "set-bit argument needs at least 3 bytes",
        ));
    }
    let address = u16::from_le_bytes([arg[0], arg[1]]) as usize;
    let mask = 1u8 << (arg[2] % 8);
    let value = arg.get(3).is_some_and(|&b| b != 0);

    let mut byte = [0u8; 1];
    read_exact_at(source, address, &mut byte)?;
    let updated = if value { byte[0] | mask } else { byte[0] & !mask };
    if updated != byte[0] {
        write_all_at(source, address, &[updated])?;
        if source.buffered() {
            source.flush()?;
        }
    }
    Ok(())
}

// ─── FileSource ─────────────────────────────────────────────────────

/// Process image behind a file descriptor.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    char_device: bool,
}

impl FileSource {
    /// Open `path` read/write, or read-only for monitoring.
    pub fn open(path: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let char_device = file.metadata()?.file_type().is_char_device();
        debug!(path = %path.display(), char_device, writable, "process image opened");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            char_device,
        })
    }

    /// Path of the opened image.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "process image closed"))
    }
}

impl ByteSource for FileSource {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.file()?.seek(SeekFrom::Start(offset)).map(|_| ())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file()?.write_all(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.file = None;
        Ok(())
    }

    fn ioctl(&mut self, request: u32, arg: &mut [u8]) -> io::Result<()> {
        if !self.char_device {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "ioctl on a plain file",
            ));
        }
        let fd = self.file()?.as_raw_fd();
        // SAFETY: fd is open for the lifetime of self.file and the driver
        // reads/writes at most arg.len() bytes for the supported requests.
        let ret = unsafe { libc::ioctl(fd, request as _, arg.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// ─── MemoryByteSource ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryImage {
    data: Vec<u8>,
    fail_reads: u32,
    fail_writes: u32,
    reads: u64,
    writes: u64,
    flushes: u64,
}

/// In-memory process image.
#[derive(Debug)]
pub struct MemoryByteSource {
    image: Arc<Mutex<MemoryImage>>,
    position: usize,
    buffered: bool,
}

/// Second view on a [`MemoryByteSource`], used to play the hardware side.
#[derive(Debug, Clone)]
pub struct MemoryHandle {
    image: Arc<Mutex<MemoryImage>>,
}

impl MemoryByteSource {
    /// Zero-filled image of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            image: Arc::new(Mutex::new(MemoryImage {
                data: vec![0; size],
                ..MemoryImage::default()
            })),
            position: 0,
            buffered: false,
        }
    }

    /// Report writes as buffered so callers flush.
    pub fn with_buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    /// Handle sharing the same bytes.
    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle {
            image: Arc::clone(&self.image),
        }
    }
}

impl MemoryHandle {
    /// Copy of `len` bytes at `offset`.
    pub fn get(&self, offset: usize, len: usize) -> Vec<u8> {
        self.image.lock().data[offset..offset + len].to_vec()
    }

    /// Overwrite bytes at `offset`.
    pub fn set(&self, offset: usize, bytes: &[u8]) {
        self.image.lock().data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Let the next `n` reads fail.
    pub fn fail_reads(&self, n: u32) {
        self.image.lock().fail_reads = n;
    }

    /// Let the next `n` writes fail.
    pub fn fail_writes(&self, n: u32) {
        self.image.lock().fail_writes = n;
    }

    /// Successful reads so far.
    pub fn reads(&self) -> u64 {
        self.image.lock().reads
    }

    /// Successful writes so far.
    pub fn writes(&self) -> u64 {
        self.image.lock().writes
    }

    /// Flushes so far.
    pub fn flushes(&self) -> u64 {
        self.image.lock().flushes
    }
}

impl ByteSource for MemoryByteSource {
    fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.position = offset as usize;
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut image = self.image.lock();
        if image.fail_reads > 0 {
            image.fail_reads -= 1;
            return Err(io::Error::other("injected read failure"));
        }
        let start = self.position.min(image.data.len());
        let n = buf.len().min(image.data.len() - start);
        buf[..n].copy_from_slice(&image.data[start..start + n]);
        self.position = start + n;
        image.reads += 1;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut image = self.image.lock();
        if image.fail_writes > 0 {
            image.fail_writes -= 1;
            return Err(io::Error::other("injected write failure"));
        }
        let start = self.position.min(image.data.len());
        let n = data.len().min(image.data.len() - start);
        image.data[start..start + n].copy_from_slice(&data[..n]);
        self.position = start + n;
        image.writes += 1;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.image.lock().flushes += 1;
        Ok(())
    }

    fn buffered(&self) -> bool {
        self.buffered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_and_writes() {
        let mut src = MemoryByteSource::new(16);
        let hw = src.handle();
        hw.set(10, &[0x2c, 0x01]);

        let mut buf = [0u8; 2];
        read_exact_at(&mut src, 10, &mut buf).unwrap();
        assert_eq!(buf, [0x2c, 0x01]);

        write_all_at(&mut src, 12, &[0xf4, 0x01]).unwrap();
        assert_eq!(hw.get(12, 2), vec![0xf4, 0x01]);
    }

    #[test]
    fn short_read_is_an_error() {
        let mut src = MemoryByteSource::new(4);
        let mut buf = [0u8; 8];
        let err = read_exact_at(&mut src, 0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut src = MemoryByteSource::new(4);
        src.handle().fail_reads(1);
        assert!(src.read(4).is_err());
        assert_eq!(src.read(4).unwrap().len(), 4);
    }

    #[test]
    fn set_bit_falls_back_to_read_modify_write() {
        let mut src = MemoryByteSource::new(8);
        let hw = src.handle();
        hw.set(5, &[0b1000_0001]);

        set_bit(&mut src, 5, 3, true).unwrap();
        assert_eq!(hw.get(5, 1), vec![0b1000_1001]);

        set_bit(&mut src, 5, 7, false).unwrap();
        assert_eq!(hw.get(5, 1), vec![0b0000_1001]);
    }

    #[test]
    fn set_bit_arg_layout() {
        assert_eq!(set_bit_arg(0x0102, 4, false), vec![0x02, 0x01, 4]);
        assert_eq!(set_bit_arg(0x0102, 4, true), vec![0x02, 0x01, 4, 1]);
    }

    #[test]
    fn file_source_on_plain_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 32]).unwrap();
        let mut src = FileSource::open(tmp.path(), true).unwrap();

        write_all_at(&mut src, 4, &[1, 2, 3]).unwrap();
        src.flush().unwrap();
        let mut buf = [0u8; 3];
        read_exact_at(&mut src, 4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        let err = src.ioctl(IOCTL_SET_BIT, &mut [0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        src.close().unwrap();
        assert!(src.seek(0).is_err());
    }
}
