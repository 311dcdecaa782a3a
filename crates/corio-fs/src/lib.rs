//! # corio-fs
//!
//! File wrappers over the corio I/O service.
//!
//! [`RandomAccessFile`] does positioned reads and writes at explicit
//! offsets and may be shared across concurrent operations. [`File`] is a
//! stream-style wrapper that advances internal read/write offsets by the
//! transferred count of each completed operation; it is single-owner by
//! construction (its methods take `&mut self`).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use corio_core::{ErrorCode, Handle, IoBuf, IoReq, IoResult};
use corio_runtime::context::ExecutionContext;
use corio_runtime::{callback_hook, tls};

/// Open-mode bits. Combine one access mode with any of the behavior
/// bits.
pub mod open_mode {
    pub const READ_ONLY: u32 = 1 << 0;
    pub const WRITE_ONLY: u32 = 1 << 1;
    pub const READ_WRITE: u32 = 1 << 2;

    pub const CREATE: u32 = 1 << 3;
    pub const TRUNCATE: u32 = 1 << 4;
    pub const APPEND: u32 = 1 << 5;
}

fn mode_to_flags(mode: u32) -> i32 {
    let mut flags = if mode & open_mode::READ_WRITE != 0 {
        libc::O_RDWR
    } else if mode & open_mode::WRITE_ONLY != 0 {
        libc::O_WRONLY
    } else {
        libc::O_RDONLY
    };
    if mode & open_mode::CREATE != 0 {
        flags |= libc::O_CREAT;
    }
    if mode & open_mode::TRUNCATE != 0 {
        flags |= libc::O_TRUNC;
    }
    if mode & open_mode::APPEND != 0 {
        flags |= libc::O_APPEND;
    }
    flags | libc::O_CLOEXEC
}

/// A file addressed by explicit offsets.
#[derive(Debug)]
pub struct RandomAccessFile {
    handle: Handle,
}

impl RandomAccessFile {
    /// Open with default permissions (0644 for newly created files).
    pub fn open(path: impl AsRef<Path>, mode: u32) -> IoResult<Self> {
        Self::open_with(path, mode, 0o644)
    }

    pub fn open_with(path: impl AsRef<Path>, mode: u32, permissions: u32) -> IoResult<Self> {
        use std::os::unix::ffi::OsStrExt;
        let cpath = std::ffi::CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|_| ErrorCode::InvalidArgument)?;
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                mode_to_flags(mode),
                permissions as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(ErrorCode::last_os_error());
        }
        Ok(Self {
            handle: Handle::from_raw(fd),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_valid()
    }

    /// Asynchronously read up to `len` bytes at `offset`. An empty slice
    /// with `Ok` means the offset is at or past end of file.
    pub fn read_at(
        &self,
        offset: u64,
        len: usize,
        cb: impl FnOnce(ErrorCode, &[u8]) + Send + 'static,
    ) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument, &[]),
        };
        let mut req = IoReq::new(
            self.handle,
            callback_hook(move |ec, req| cb(ec, req.buf.bytes())),
        );
        req.buf = IoBuf::with_capacity(len);
        req.offset = offset;
        ctx.service().read_at(req);
    }

    /// Asynchronously write `data` at `offset`. The callback receives
    /// the transferred count.
    pub fn write_at(
        &self,
        offset: u64,
        data: &[u8],
        cb: impl FnOnce(ErrorCode, usize) + Send + 'static,
    ) {
        let ctx = match tls::current() {
            Some(ctx) => ctx,
            None => return cb(ErrorCode::InvalidArgument, 0),
        };
        let mut req = IoReq::new(
            self.handle,
            callback_hook(move |ec, req| cb(ec, req.buf.len())),
        );
        req.buf = IoBuf::copy_from(data);
        req.offset = offset;
        ctx.service().write_at(req);
    }

    /// Flush file data and metadata to stable storage.
    pub fn sync_all(&self) -> IoResult<()> {
        if unsafe { libc::fsync(self.handle.raw()) } != 0 {
            return Err(ErrorCode::last_os_error());
        }
        Ok(())
    }

    /// Flush file data to stable storage.
    pub fn sync_data(&self) -> IoResult<()> {
        if unsafe { libc::fdatasync(self.handle.raw()) } != 0 {
            return Err(ErrorCode::last_os_error());
        }
        Ok(())
    }

    /// Best-effort cancellation of outstanding operations on this file.
    pub fn cancel(&self) {
        let _ = tls::with_service(|service| service.cancel(self.handle));
    }

    /// Cancel outstanding operations, run their hooks, then release the
    /// descriptor. The fd is only returned to the kernel once nothing in
    /// flight can complete against it. A second close is a no-op.
    pub fn close(&mut self) {
        if self.handle.is_valid() {
            let _ = tls::with_service(|service| service.drain(self.handle));
            unsafe {
                libc::close(self.handle.raw());
            }
            self.handle = Handle::INVALID;
        }
    }
}

impl Drop for RandomAccessFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stream-style file with internal read and write offsets.
///
/// The offsets advance by the transferred count when each operation
/// completes. Methods take `&mut self`: one owner drives the stream at a
/// time, and interleaving from several owners is not supported.
pub struct File {
    file: RandomAccessFile,
    read_offset: Arc<AtomicU64>,
    write_offset: Arc<AtomicU64>,
}

impl File {
    pub fn open(path: impl AsRef<Path>, mode: u32) -> IoResult<Self> {
        Ok(Self {
            file: RandomAccessFile::open(path, mode)?,
            read_offset: Arc::new(AtomicU64::new(0)),
            write_offset: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    /// Read up to `len` bytes at the current read offset, advancing it
    /// by the transferred count.
    pub fn read(&mut self, len: usize, cb: impl FnOnce(ErrorCode, &[u8]) + Send + 'static) {
        let offset = self.read_offset.load(Ordering::Acquire);
        let cursor = self.read_offset.clone();
        self.file.read_at(offset, len, move |ec, data| {
            if ec.is_ok() {
                cursor.fetch_add(data.len() as u64, Ordering::AcqRel);
            }
            cb(ec, data)
        });
    }

    /// Write `data` at the current write offset, advancing it by the
    /// transferred count.
    pub fn write(&mut self, data: &[u8], cb: impl FnOnce(ErrorCode, usize) + Send + 'static) {
        let offset = self.write_offset.load(Ordering::Acquire);
        let cursor = self.write_offset.clone();
        self.file.write_at(offset, data, move |ec, n| {
            if ec.is_ok() {
                cursor.fetch_add(n as u64, Ordering::AcqRel);
            }
            cb(ec, n)
        });
    }

    pub fn sync_all(&self) -> IoResult<()> {
        self.file.sync_all()
    }

    pub fn sync_data(&self) -> IoResult<()> {
        self.file.sync_data()
    }

    pub fn cancel(&self) {
        self.file.cancel();
    }

    pub fn close(&mut self) {
        self.file.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use corio_runtime::Reactor;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("corio-fs-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_open_missing_file_fails() {
        let err = RandomAccessFile::open("/nonexistent/corio/file", open_mode::READ_ONLY)
            .unwrap_err();
        assert!(matches!(err, ErrorCode::System(_)));
    }

    #[test]
    fn test_double_close_is_noop() {
        let path = temp_path("close");
        let mut file = RandomAccessFile::open(
            &path,
            open_mode::READ_WRITE | open_mode::CREATE | open_mode::TRUNCATE,
        )
        .unwrap();
        assert!(file.is_open());
        file.close();
        assert!(!file.is_open());
        file.close();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_overlapping_writes_then_read() {
        let path = temp_path("rw");
        let reactor = Reactor::new().unwrap();
        let read_back = Arc::new(Mutex::new(Vec::new()));

        let r = reactor.clone();
        let read_back2 = read_back.clone();
        let path2 = path.clone();
        reactor.post(Box::new(move || {
            let file = Arc::new(
                RandomAccessFile::open(
                    &path2,
                    open_mode::READ_WRITE | open_mode::CREATE | open_mode::TRUNCATE,
                )
                .unwrap(),
            );

            let f1 = file.clone();
            let out = read_back2.clone();
            let stopper = r.clone();
            file.write_at(0, b"abcdef", move |ec, n| {
                assert_eq!(ec, ErrorCode::Ok);
                assert_eq!(n, 6);
                let f2 = f1.clone();
                let out = out.clone();
                let stopper = stopper.clone();
                f1.write_at(3, b"XYZ", move |ec, n| {
                    assert_eq!(ec, ErrorCode::Ok);
                    assert_eq!(n, 3);
                    let f3 = f2.clone();
                    f2.read_at(0, 6, move |ec, data| {
                        assert_eq!(ec, ErrorCode::Ok);
                        out.lock().unwrap().extend_from_slice(data);
                        f3.sync_data().unwrap();
                        stopper.stop();
                        drop(f3);
                    });
                });
            });
        }));

        reactor.run().unwrap();
        assert_eq!(read_back.lock().unwrap().as_slice(), b"abcXYZ");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_stream_offsets_advance() {
        let path = temp_path("stream");
        let reactor = Reactor::new().unwrap();
        let collected = Arc::new(Mutex::new(Vec::new()));

        let r = reactor.clone();
        let collected2 = collected.clone();
        let path2 = path.clone();
        reactor.post(Box::new(move || {
            let file = Arc::new(Mutex::new(
                File::open(
                    &path2,
                    open_mode::READ_WRITE | open_mode::CREATE | open_mode::TRUNCATE,
                )
                .unwrap(),
            ));

            // Two sequential writes land back to back, then two
            // sequential reads walk the same bytes.
            let file2 = file.clone();
            let out = collected2.clone();
            let stopper = r.clone();
            file.lock().unwrap().write(b"hello ", move |ec, n| {
                assert_eq!(ec, ErrorCode::Ok);
                assert_eq!(n, 6);
                let file3 = file2.clone();
                let out = out.clone();
                let stopper = stopper.clone();
                file2.lock().unwrap().write(b"world", move |ec, n| {
                    assert_eq!(ec, ErrorCode::Ok);
                    assert_eq!(n, 5);
                    let file4 = file3.clone();
                    let out2 = out.clone();
                    let stopper = stopper.clone();
                    file3.lock().unwrap().read(6, move |ec, data| {
                        assert_eq!(ec, ErrorCode::Ok);
                        out2.lock().unwrap().extend_from_slice(data);
                        let out3 = out2.clone();
                        let keep = file4.clone();
                        file4.lock().unwrap().read(16, move |ec, data| {
                            assert_eq!(ec, ErrorCode::Ok);
                            out3.lock().unwrap().extend_from_slice(data);
                            stopper.stop();
                            drop(keep);
                        });
                    });
                });
            });
        }));

        reactor.run().unwrap();
        assert_eq!(collected.lock().unwrap().as_slice(), b"hello world");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_read_past_eof_is_empty_ok() {
        let path = temp_path("eof");
        std::fs::write(&path, b"xy").unwrap();
        let reactor = Reactor::new().unwrap();
        let outcome = Arc::new(AtomicUsize::new(usize::MAX));

        let r = reactor.clone();
        let outcome2 = outcome.clone();
        let path2 = path.clone();
        reactor.post(Box::new(move || {
            let file = Arc::new(RandomAccessFile::open(&path2, open_mode::READ_ONLY).unwrap());
            let keep = file.clone();
            let stopper = r.clone();
            file.read_at(100, 8, move |ec, data| {
                assert_eq!(ec, ErrorCode::Ok);
                outcome2.store(data.len(), Ordering::SeqCst);
                stopper.stop();
                drop(keep);
            });
        }));

        reactor.run().unwrap();
        assert_eq!(outcome.load(Ordering::SeqCst), 0);
        let _ = std::fs::remove_file(&path);
    }
}
