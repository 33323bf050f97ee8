//! Kernel binding: hands each FUSE request to the [`Mount`] on the tokio
//! runtime and turns its result into a reply.

use anyhow::{Context, Result};
use rmfs_core::mount::BOOKMARK_XATTR;
use rmfs_core::{Attr, DocumentKind, ErrorKind, Mount, MountError, OpenedFile, RemoteSession};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::runtime::Handle;

const TTL: Duration = Duration::from_secs(1);

/// Reported capacity; the device does not tell us its free space cheaply.
const STATFS_BYTES: u64 = 8 << 30;
const BLOCK_SIZE: u32 = 4096;

/// Mount `mount` at `at` on a background thread. Dropping the returned
/// session unmounts.
pub fn spawn<R: RemoteSession + 'static>(
    mount: Arc<Mount<R>>,
    runtime: Handle,
    at: &Path,
) -> Result<fuser::BackgroundSession> {
    let filesystem = RemarkableFuse::new(mount, runtime);
    let options = [
        fuser::MountOption::FSName("rmfs".to_owned()),
        fuser::MountOption::AutoUnmount,
    ];
    fuser::spawn_mount2(filesystem, at, &options)
        .with_context(|| format!("mount {}", at.display()))
}

pub struct RemarkableFuse<R: RemoteSession> {
    mount: Arc<Mount<R>>,
    runtime: Handle,
}

impl<R: RemoteSession + 'static> RemarkableFuse<R> {
    pub fn new(mount: Arc<Mount<R>>, runtime: Handle) -> Self {
        Self { mount, runtime }
    }

    /// Run `op` against the mount on the runtime.
    fn dispatch<F, Fut>(&self, op: F)
    where
        F: FnOnce(Arc<Mount<R>>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(op(self.mount.clone()));
    }
}

pub fn errno(kind: ErrorKind) -> libc::c_int {
    match kind {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::NotEmpty => libc::ENOTEMPTY,
        ErrorKind::NotADirectory => libc::ENOTDIR,
        ErrorKind::IsADirectory => libc::EISDIR,
        ErrorKind::Busy => libc::EBUSY,
        ErrorKind::PermissionDenied => libc::EPERM,
        ErrorKind::Unsupported => libc::ENOTSUP,
        ErrorKind::BadHandle => libc::EBADF,
        ErrorKind::InvalidArgument => libc::EINVAL,
        ErrorKind::Io => libc::EIO,
    }
}

/// `FOPEN_*` reply flags for a freshly opened handle.
pub fn open_flags(opened: &OpenedFile) -> u32 {
    if opened.direct_io {
        fuser::consts::FOPEN_DIRECT_IO
    } else {
        0
    }
}

fn fail(op: &str, e: MountError) -> libc::c_int {
    let code = errno(e.kind());
    if code == libc::EIO {
        tracing::warn!("{} failed: {}", op, e);
    } else {
        tracing::debug!("{} failed: {}", op, e);
    }
    code
}

fn file_type(kind: DocumentKind) -> fuser::FileType {
    if kind.is_folder() {
        fuser::FileType::Directory
    } else {
        fuser::FileType::RegularFile
    }
}

pub fn attr_for(attr: &Attr, uid: u32, gid: u32) -> fuser::FileAttr {
    let mtime = UNIX_EPOCH + Duration::from_millis(attr.mtime_millis);
    let is_dir = attr.is_dir();
    fuser::FileAttr {
        ino: attr.node,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: file_type(attr.kind),
        perm: if is_dir { 0o755 } else { 0o644 },
        nlink: if is_dir { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        flags: 0,
        blksize: 512,
    }
}

/// Names must be UTF-8 to be stored in a record.
fn utf8(name: &OsStr) -> Option<String> {
    name.to_str().map(str::to_string)
}

/// Answer an xattr request of `size` with `value`.
fn reply_xattr(reply: fuser::ReplyXattr, size: u32, value: &[u8]) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if (size as usize) < value.len() {
        reply.error(libc::ERANGE);
    } else {
        reply.data(value);
    }
}

impl<R: RemoteSession + 'static> fuser::Filesystem for RemarkableFuse<R> {
    fn lookup(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = utf8(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (uid, gid) = (req.uid(), req.gid());
        self.dispatch(move |mount| async move {
            match mount.lookup(parent, &name).await {
                Ok(attr) => reply.entry(&TTL, &attr_for(&attr, uid, gid), 0),
                Err(e) => reply.error(fail("lookup", e)),
            }
        });
    }

    fn getattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        self.dispatch(move |mount| async move {
            match mount.getattr(ino).await {
                Ok(attr) => reply.attr(&TTL, &attr_for(&attr, uid, gid)),
                Err(e) => reply.error(fail("getattr", e)),
            }
        });
    }

    /// Only size changes do anything; permissions and times are fixed.
    fn setattr(
        &mut self,
        req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let (uid, gid) = (req.uid(), req.gid());
        self.dispatch(move |mount| async move {
            let result = match size {
                Some(len) => mount.truncate(ino, fh, len).await,
                None => mount.getattr(ino).await,
            };
            match result {
                Ok(attr) => reply.attr(&TTL, &attr_for(&attr, uid, gid)),
                Err(e) => reply.error(fail("setattr", e)),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        self.dispatch(move |mount| async move {
            let entries = match mount.readdir(ino).await {
                Ok(entries) => entries,
                Err(e) => {
                    reply.error(fail("readdir", e));
                    return;
                }
            };
            let start = offset.max(0) as usize;
            for (idx, entry) in entries.into_iter().enumerate().skip(start) {
                if reply.add(entry.node, (idx + 1) as i64, file_type(entry.kind), &entry.name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn mkdir(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = utf8(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (uid, gid) = (req.uid(), req.gid());
        self.dispatch(move |mount| async move {
            match mount.mkdir(parent, &name).await {
                Ok(attr) => reply.entry(&TTL, &attr_for(&attr, uid, gid), 0),
                Err(e) => reply.error(fail("mkdir", e)),
            }
        });
    }

    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let Some(name) = utf8(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(move |mount| async move {
            match mount.rmdir(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("rmdir", e)),
            }
        });
    }

    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let Some(name) = utf8(name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(move |mount| async move {
            match mount.unlink(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("unlink", e)),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        if flags & libc::RENAME_EXCHANGE != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let (Some(name), Some(newname)) = (utf8(name), utf8(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.dispatch(move |mount| async move {
            match mount.rename(parent, &name, newparent, &newname).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("rename", e)),
            }
        });
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        self.dispatch(move |mount| async move {
            match mount.open(ino, write).await {
                Ok(opened) => reply.opened(opened.fh, open_flags(&opened)),
                Err(e) => reply.error(fail("open", e)),
            }
        });
    }

    fn create(
        &mut self,
        req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let Some(name) = utf8(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (uid, gid) = (req.uid(), req.gid());
        self.dispatch(move |mount| async move {
            match mount.create(parent, &name).await {
                Ok((attr, opened)) => reply.created(
                    &TTL,
                    &attr_for(&attr, uid, gid),
                    0,
                    opened.fh,
                    open_flags(&opened),
                ),
                Err(e) => reply.error(fail("create", e)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        self.dispatch(move |mount| async move {
            match mount.read(fh, offset as u64, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(fail("read", e)),
            }
        });
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let data = data.to_vec();
        self.dispatch(move |mount| async move {
            match mount.write(fh, offset as u64, &data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(fail("write", e)),
            }
        });
    }

    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        self.dispatch(move |mount| async move {
            match mount.flush(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("flush", e)),
            }
        });
    }

    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.dispatch(move |mount| async move {
            match mount.release(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("release", e)),
            }
        });
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let blocks = STATFS_BYTES / BLOCK_SIZE as u64;
        reply.statfs(blocks, blocks, blocks, 0, 0, BLOCK_SIZE, 255, BLOCK_SIZE);
    }

    fn getxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        if name != BOOKMARK_XATTR {
            reply.error(libc::ENODATA);
            return;
        }
        self.dispatch(move |mount| async move {
            match mount.bookmarked(ino).await {
                Ok(true) => reply_xattr(reply, size, b"yes"),
                Ok(false) => reply_xattr(reply, size, b"no"),
                Err(e) => reply.error(fail("getxattr", e)),
            }
        });
    }

    fn setxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: fuser::ReplyEmpty,
    ) {
        if name != BOOKMARK_XATTR {
            reply.error(libc::ENOTSUP);
            return;
        }
        let value = value.to_vec();
        self.dispatch(move |mount| async move {
            match mount.set_bookmarked(ino, &value).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(fail("setxattr", e)),
            }
        });
    }

    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        size: u32,
        reply: fuser::ReplyXattr,
    ) {
        self.dispatch(move |mount| async move {
            match mount.getattr(ino).await {
                Ok(_) => {
                    let mut names = BOOKMARK_XATTR.as_bytes().to_vec();
                    names.push(0);
                    reply_xattr(reply, size, &names);
                }
                Err(e) => reply.error(fail("listxattr", e)),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmfs_core::TreeError;

    #[test]
    fn test_errno_mapping() {
        let cases = [
            (MountError::Tree(TreeError::NotFound("x".into())), libc::ENOENT),
            (MountError::Tree(TreeError::NameConflict("x".into())), libc::EEXIST),
            (MountError::Tree(TreeError::NotEmpty("x".into())), libc::ENOTEMPTY),
            (MountError::Tree(TreeError::NotAFolder("x".into())), libc::ENOTDIR),
            (MountError::Tree(TreeError::CycleRejected), libc::EINVAL),
            (MountError::Tree(TreeError::RootImmutable), libc::EBUSY),
            (MountError::IsAFolder("x".into()), libc::EISDIR),
            (MountError::ReadOnly("x".into()), libc::EPERM),
            (MountError::BadHandle(9), libc::EBADF),
        ];
        for (error, expected) in cases {
            assert_eq!(errno(error.kind()), expected, "{}", error);
        }
    }

    #[tokio::test]
    async fn test_open_flags() {
        use rmfs_core::{InMemorySession, MountConfig};

        let mount = Mount::open_session(InMemorySession::new(), MountConfig::default())
            .await
            .unwrap();
        let (_, created) = mount.create(1, "new.pdf").await.unwrap();
        assert_eq!(open_flags(&created), 0);

        let rendered = OpenedFile {
            fh: 1,
            direct_io: true,
        };
        assert_eq!(open_flags(&rendered), fuser::consts::FOPEN_DIRECT_IO);
    }

    #[test]
    fn test_attr_for() {
        let file = Attr {
            node: 5,
            kind: DocumentKind::Pdf,
            size: 1025,
            mtime_millis: 1_500,
        };
        let attr = attr_for(&file, 1000, 100);
        assert_eq!(attr.ino, 5);
        assert_eq!(attr.kind, fuser::FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_millis(1_500));

        let folder = Attr {
            node: 1,
            kind: DocumentKind::Folder,
            size: 0,
            mtime_millis: 0,
        };
        let attr = attr_for(&folder, 0, 0);
        assert_eq!(attr.kind, fuser::FileType::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.nlink, 2);
    }
}
