//! FUSE wiring for the synthetic VOD tree (Linux only)
//!
//! Read-only filesystem over the catalog snapshot. Directory structure comes
//! from the pure tree model in the parent module; file contents come from
//! the materializer. Catalog locks are never held across I/O: every callback
//! takes a snapshot first.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry,
    ReplyOpen, Request,
};
use tracing::{debug, info, warn};

use crate::catalog::CatalogStore;

use super::materialize::{MaterializeError, Materializer, VodContent};
use super::{list_dir, VodEntry, VodFsError, PLACEHOLDER_FILE_SIZE};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// Stable path <-> inode assignment for the lifetime of the mount.
#[derive(Default)]
struct InodeTable {
    by_path: HashMap<String, u64>,
    paths: HashMap<u64, String>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = Self { next: 2, ..Default::default() };
        table.by_path.insert(String::new(), ROOT_INO);
        table.paths.insert(ROOT_INO, String::new());
        table
    }

    fn ino(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(path.to_string(), ino);
        self.paths.insert(ino, path.to_string());
        ino
    }

    fn path(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }
}

pub struct VodFs {
    catalog: Arc<CatalogStore>,
    materializer: Arc<dyn Materializer>,
    inodes: InodeTable,
    handles: HashMap<u64, Box<dyn VodContent>>,
    next_fh: u64,
}

enum Resolved {
    Dir,
    File { id: String, url: String },
}

impl VodFs {
    fn new(catalog: Arc<CatalogStore>, materializer: Arc<dyn Materializer>) -> Self {
        Self {
            catalog,
            materializer,
            inodes: InodeTable::new(),
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn resolve(&self, path: &str) -> Option<Resolved> {
        let snapshot = self.catalog.snapshot();
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();

        if list_dir(&snapshot, &components).is_some() {
            return Some(Resolved::Dir);
        }

        let (parent, name) = match components.split_last() {
            Some((name, parent)) => (parent, *name),
            None => return Some(Resolved::Dir),
        };
        let entries = list_dir(&snapshot, parent)?;
        entries.into_iter().find_map(|e| match e {
            VodEntry::File { name: n, id, url } if n == name => Some(Resolved::File { id, url }),
            _ => None,
        })
    }

    fn attr_for(&self, ino: u64, resolved: &Resolved) -> FileAttr {
        let (kind, perm, size) = match resolved {
            Resolved::Dir => (FileType::Directory, 0o555, 0),
            Resolved::File { id, .. } => (
                FileType::RegularFile,
                0o444,
                self.materializer.known_size(id).unwrap_or(PLACEHOLDER_FILE_SIZE),
            ),
        };

        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind,
            perm,
            nlink: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn child_path(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }
}

impl Filesystem for VodFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inodes.path(parent).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        let path = Self::child_path(&parent_path, name);
        match self.resolve(&path) {
            Some(resolved) => {
                let ino = self.inodes.ino(&path);
                reply.entry(&TTL, &self.attr_for(ino, &resolved), 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.resolve(&path) {
            Some(resolved) => reply.attr(&TTL, &self.attr_for(ino, &resolved)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inodes.path(ino).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let snapshot = self.catalog.snapshot();
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some(entries) = list_dir(&snapshot, &components) else {
            reply.error(libc::ENOTDIR);
            return;
        };

        let mut all: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
        ];
        for entry in entries {
            let child = Self::child_path(&path, entry.name());
            let child_ino = self.inodes.ino(&child);
            let kind = match entry {
                VodEntry::Dir(_) => FileType::Directory,
                VodEntry::File { .. } => FileType::RegularFile,
            };
            all.push((child_ino, kind, entry.name().to_string()));
        }

        for (i, (entry_ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(Resolved::File { id, url }) = self.resolve(&path) else {
            reply.error(libc::EISDIR);
            return;
        };

        match self.materializer.open(&id, &url) {
            Ok(content) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.handles.insert(fh, content);
                debug!(%path, fh, "vod file opened");
                reply.opened(fh, 0);
            }
            Err(MaterializeError::NotReady) => reply.error(libc::EAGAIN),
            Err(e) => {
                warn!(%path, error = %e, "vod open failed");
                reply.error(libc::EIO);
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        let mut buf = vec![0u8; size as usize];
        let result = handle
            .seek(SeekFrom::Start(offset as u64))
            .and_then(|_| read_fully(handle.as_mut(), &mut buf));
        match result {
            Ok(read) => reply.data(&buf[..read]),
            Err(e) => {
                warn!(fh, error = %e, "vod read failed");
                reply.error(libc::EIO);
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }
}

/// Fill as much of the buffer as the source has, tolerating short reads.
fn read_fully(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Mount and serve until the filesystem is unmounted. Blocks the calling
/// thread; run it on a dedicated one.
pub fn mount(
    catalog: Arc<CatalogStore>,
    materializer: Arc<dyn Materializer>,
    mount_point: &Path,
    allow_other: bool,
) -> Result<(), VodFsError> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("tunebridge".to_string()),
        MountOption::AutoUnmount,
    ];
    if allow_other {
        // Needs user_allow_other in /etc/fuse.conf; surfaced to the operator
        options.push(MountOption::AllowOther);
    }

    info!(mount = %mount_point.display(), allow_other, "mounting vodfs");
    let fs = VodFs::new(catalog, materializer);
    fuser::mount2(fs, mount_point, &options).map_err(|e| VodFsError::Mount(e.to_string()))
}
