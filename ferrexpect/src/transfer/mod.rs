//! File transfer over a remote filesystem capability (typically SFTP).
//!
//! [`Transfer`] sequences open / read / write / fsync / close on top of the
//! non-blocking [`RemoteFs`] primitives and adds whole-file and folder uploads
//! that keep unix permission bits.
//!
//! Files are opened as the user the connection authenticated as, not the user
//! an escalated shell runs commands as.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::channel::Blocking;
use crate::error::{Result, TransferError};
use crate::transport::{OpenFlags, RemoteFile, RemoteFs};

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Mode used for uploads when the local mode cannot be read.
pub const DEFAULT_FILE_MODE: u32 = 0o664;
pub const DEFAULT_DIR_MODE: u32 = 0o775;

fn remote_err(path: &str, source: io::Error) -> TransferError {
    TransferError::Remote {
        path: path.to_string(),
        source,
    }
}

fn local_err(path: &Path, source: io::Error) -> TransferError {
    TransferError::Local {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata, _fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_metadata: &std::fs::Metadata, fallback: u32) -> u32 {
    fallback
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// A remote file opened through [`Transfer::open`].
pub struct OpenFile<H> {
    file: Blocking<H>,
    path: String,
    writable: bool,
    chunk_size: usize,
}

impl<H: RemoteFile> OpenFile<H> {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read up to `buf.len()` bytes; `0` at end of file.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self
            .file
            .retry(|f| f.try_read(buf))
            .await
            .map_err(|e| remote_err(&self.path, e))?;
        trace!("read {} bytes from {}", n, self.path);
        Ok(n)
    }

    /// Read the rest of the file.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = self.read_chunk(&mut buf).await?;
            if n == 0 {
                return Ok(data);
            }
            data.extend_from_slice(&buf[..n]);
        }
    }

    /// Write all of `data`, one chunk at a time.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.chunk_size) {
            self.file
                .write_all_with(chunk, |f, d| f.try_write(d))
                .await
                .map_err(|e| remote_err(&self.path, e))?;
        }
        Ok(())
    }

    /// Flush (for writable files) and release the remote handle.
    pub async fn close(mut self) -> Result<()> {
        if self.writable {
            self.file
                .retry(|f| f.try_fsync())
                .await
                .map_err(|e| remote_err(&self.path, e))?;
        }
        self.file
            .retry(|f| f.try_close())
            .await
            .map_err(|e| remote_err(&self.path, e))?;
        debug!("closed {}", self.path);
        Ok(())
    }
}

/// Transfer helper over a [`RemoteFs`].
pub struct Transfer<F> {
    fs: Blocking<F>,
    chunk_size: usize,
}

impl<F: RemoteFs> Transfer<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs: Blocking::new(fs),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Bytes per read or write request.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn get_ref(&self) -> &F {
        self.fs.get_ref()
    }

    pub fn into_inner(self) -> F {
        self.fs.into_inner()
    }

    pub async fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> Result<OpenFile<F::File>> {
        let file = self
            .fs
            .retry(|fs| fs.try_open(path, flags, mode))
            .await
            .map_err(|e| remote_err(path, e))?;
        debug!("opened {} ({:?})", path, flags);
        Ok(OpenFile {
            file: Blocking::new(file),
            path: path.to_string(),
            writable: flags.write,
            chunk_size: self.chunk_size,
        })
    }

    pub async fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        self.fs
            .retry(|fs| fs.try_mkdir(path, mode))
            .await
            .map_err(|e| remote_err(path, e))?;
        Ok(())
    }

    /// Entry names in a remote directory.
    pub async fn read_dir(&mut self, path: &str) -> Result<Vec<String>> {
        let entries = self
            .fs
            .retry(|fs| fs.try_read_dir(path))
            .await
            .map_err(|e| remote_err(path, e))?;
        Ok(entries)
    }

    /// Upload a local file, keeping its permission bits. Returns the bytes sent.
    pub async fn put_file(&mut self, local: impl AsRef<Path>, remote: &str) -> Result<u64> {
        let local = local.as_ref();
        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| local_err(local, e))?;
        let metadata = source.metadata().await.map_err(|e| local_err(local, e))?;
        let mode = mode_of(&metadata, DEFAULT_FILE_MODE);

        let mut target = self.open(remote, OpenFlags::WRITE, mode).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf).await.map_err(|e| local_err(local, e))?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        target.close().await?;

        debug!("uploaded {} -> {} ({} bytes, mode {:o})", local.display(), remote, total, mode);
        Ok(total)
    }

    /// Download a remote file, replacing `local`. Returns the bytes received.
    pub async fn get_file(&mut self, remote: &str, local: impl AsRef<Path>) -> Result<u64> {
        let local = local.as_ref();
        let mut source = self.open(remote, OpenFlags::READ, 0).await?;
        let mut target = tokio::fs::File::create(local)
            .await
            .map_err(|e| local_err(local, e))?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = source.read_chunk(&mut buf).await?;
            if n == 0 {
                break;
            }
            target
                .write_all(&buf[..n])
                .await
                .map_err(|e| local_err(local, e))?;
            total += n as u64;
        }
        target.flush().await.map_err(|e| local_err(local, e))?;
        source.close().await?;

        debug!("downloaded {} -> {} ({} bytes)", remote, local.display(), total);
        Ok(total)
    }

    /// Upload the contents of `local` into the existing remote directory `remote`.
    ///
    /// Subdirectories are created with their local mode unless already listed
    /// remotely. Without `recursive` only the top-level files are uploaded.
    pub async fn put_folder(&mut self, local: impl AsRef<Path>, remote: &str, recursive: bool) -> Result<()> {
        let mut pending: Vec<(PathBuf, String)> = vec![(local.as_ref().to_path_buf(), remote.to_string())];

        while let Some((local_dir, remote_dir)) = pending.pop() {
            let existing = self.read_dir(&remote_dir).await?;
            let mut entries = tokio::fs::read_dir(&local_dir)
                .await
                .map_err(|e| local_err(&local_dir, e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| local_err(&local_dir, e))?
            {
                let local_path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();
                let remote_path = join_remote(&remote_dir, &name);
                let metadata = entry.metadata().await.map_err(|e| local_err(&local_path, e))?;

                if metadata.is_dir() {
                    if !existing.contains(&name) {
                        self.create_dir(&remote_path, mode_of(&metadata, DEFAULT_DIR_MODE))
                            .await?;
                    }
                    if recursive {
                        pending.push((local_path, remote_path));
                    }
                } else if metadata.is_file() {
                    self.put_file(&local_path, &remote_path).await?;
                }
            }
        }
        Ok(())
    }

    async fn create_dir(&mut self, path: &str, mode: u32) -> Result<()> {
        match self.fs.retry(|fs| fs.try_mkdir(path, mode)).await {
            Ok(()) => {
                debug!("created {} (mode {:o})", path, mode);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(remote_err(path, e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::sync::{Arc, Mutex};

    use tokio::io::Interest;

    use super::*;
    use crate::transport::NonBlocking;

    #[derive(Debug, Default)]
    struct Store {
        files: BTreeMap<String, (Vec<u8>, u32)>,
        dirs: BTreeMap<String, u32>,
        fsyncs: usize,
    }

    /// In-memory filesystem that reports WouldBlock on every other call.
    #[derive(Clone, Default)]
    struct MemFs {
        store: Arc<Mutex<Store>>,
        flip: bool,
    }

    impl MemFs {
        fn with_root(root: &str) -> Self {
            let fs = Self::default();
            fs.store.lock().unwrap().dirs.insert(root.to_string(), 0o755);
            fs
        }

        fn stall(&mut self) -> io::Result<()> {
            self.flip = !self.flip;
            if self.flip {
                Err(io::ErrorKind::WouldBlock.into())
            } else {
                Ok(())
            }
        }
    }

    impl NonBlocking for MemFs {
        fn block_directions(&self) -> Option<Interest> {
            Some(Interest::WRITABLE)
        }

        fn ready(&mut self, _interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
            async { Ok(()) }
        }
    }

    struct MemFile {
        store: Arc<Mutex<Store>>,
        path: String,
        pos: usize,
        flip: bool,
    }

    impl MemFile {
        fn stall(&mut self) -> io::Result<()> {
            self.flip = !self.flip;
            if self.flip {
                Err(io::ErrorKind::WouldBlock.into())
            } else {
                Ok(())
            }
        }
    }

    impl NonBlocking for MemFile {
        fn block_directions(&self) -> Option<Interest> {
            None
        }

        fn ready(&mut self, _interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
            async { Ok(()) }
        }
    }

    impl RemoteFile for MemFile {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.stall()?;
            let store = self.store.lock().unwrap();
            let data = &store.files[&self.path].0;
            let n = buf.len().min(data.len() - self.pos);
            buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.stall()?;
            // at most 3 bytes per call
            let n = data.len().min(3);
            let mut store = self.store.lock().unwrap();
            store
                .files
                .get_mut(&self.path)
                .unwrap()
                .0
                .extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn try_fsync(&mut self) -> io::Result<()> {
            self.stall()?;
            self.store.lock().unwrap().fsyncs += 1;
            Ok(())
        }

        fn try_close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RemoteFs for MemFs {
        type File = MemFile;

        fn try_open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> io::Result<MemFile> {
            self.stall()?;
            let mut store = self.store.lock().unwrap();
            if flags.create {
                let entry = store.files.entry(path.to_string()).or_insert((Vec::new(), mode));
                if flags.truncate {
                    *entry = (Vec::new(), mode);
                }
            } else if !store.files.contains_key(path) {
                return Err(io::ErrorKind::NotFound.into());
            }
            Ok(MemFile {
                store: self.store.clone(),
                path: path.to_string(),
                pos: 0,
                flip: false,
            })
        }

        fn try_mkdir(&mut self, path: &str, mode: u32) -> io::Result<()> {
            self.stall()?;
            let mut store = self.store.lock().unwrap();
            if store.dirs.contains_key(path) {
                return Err(io::ErrorKind::AlreadyExists.into());
            }
            store.dirs.insert(path.to_string(), mode);
            Ok(())
        }

        fn try_read_dir(&mut self, path: &str) -> io::Result<Vec<String>> {
            self.stall()?;
            let store = self.store.lock().unwrap();
            let prefix = format!("{path}/");
            let names = store
                .dirs
                .keys()
                .chain(store.files.keys())
                .filter_map(|p| p.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(str::to_string)
                .collect();
            Ok(names)
        }
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/srv", "a"), "/srv/a");
        assert_eq!(join_remote("/srv/", "a"), "/srv/a");
        assert_eq!(join_remote("", "a"), "a");
    }

    #[tokio::test]
    async fn test_open_write_read_close() {
        let fs = MemFs::with_root("/srv");
        let store = fs.store.clone();
        let mut transfer = Transfer::new(fs).with_chunk_size(4);

        let mut file = transfer.open("/srv/motd", OpenFlags::WRITE, 0o644).await.unwrap();
        file.write_all(b"hello over sftp").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(store.lock().unwrap().fsyncs, 1);

        let mut file = transfer.open("/srv/motd", OpenFlags::READ, 0).await.unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"hello over sftp");
        file.close().await.unwrap();
        assert_eq!(store.lock().unwrap().fsyncs, 1);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let mut transfer = Transfer::new(MemFs::with_root("/srv"));
        let err = transfer
            .open("/srv/missing", OpenFlags::READ, 0)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("/srv/missing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_put_and_get_file_keep_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("deploy.sh");
        std::fs::write(&local, b"#!/bin/sh\necho deployed\n").unwrap();
        std::fs::set_permissions(&local, std::fs::Permissions::from_mode(0o750)).unwrap();

        let fs = MemFs::with_root("/srv");
        let store = fs.store.clone();
        let mut transfer = Transfer::new(fs);

        let sent = transfer.put_file(&local, "/srv/deploy.sh").await.unwrap();
        assert_eq!(sent, 24);
        assert_eq!(store.lock().unwrap().files["/srv/deploy.sh"].1, 0o750);

        let copy = dir.path().join("copy.sh");
        let received = transfer.get_file("/srv/deploy.sh", &copy).await.unwrap();
        assert_eq!(received, 24);
        assert_eq!(std::fs::read(&copy).unwrap(), b"#!/bin/sh\necho deployed\n");
    }

    #[tokio::test]
    async fn test_put_folder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        std::fs::create_dir_all(dir.path().join("conf/nested")).unwrap();
        std::fs::write(dir.path().join("conf/app.toml"), b"port = 80").unwrap();
        std::fs::write(dir.path().join("conf/nested/deep.txt"), b"deep").unwrap();

        // flat: only top-level files, subdirectories created empty
        let fs = MemFs::with_root("/srv");
        let store = fs.store.clone();
        let mut transfer = Transfer::new(fs);
        transfer.put_folder(dir.path(), "/srv", false).await.unwrap();
        {
            let store = store.lock().unwrap();
            assert!(store.files.contains_key("/srv/top.txt"));
            assert!(store.dirs.contains_key("/srv/conf"));
            assert!(!store.files.contains_key("/srv/conf/app.toml"));
        }

        // recursive, with /srv/conf already present
        transfer.put_folder(dir.path(), "/srv", true).await.unwrap();
        let store = store.lock().unwrap();
        assert_eq!(store.files["/srv/conf/app.toml"].0, b"port = 80");
        assert!(store.dirs.contains_key("/srv/conf/nested"));
        assert_eq!(store.files["/srv/conf/nested/deep.txt"].0, b"deep");
    }
}
