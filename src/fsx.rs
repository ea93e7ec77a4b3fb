//! Filesystem-side entry metadata: capture on create, apply on restore.

use std::fs::Metadata;
use std::path::Path;

use crate::{Error, Result};

/// The special-file kind of a [`FileInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    /// Character device with its device numbers.
    CharDevice {
        /// Major device number.
        major: u32,
        /// Minor device number.
        minor: u32,
    },
    /// Block device with its device numbers.
    BlockDevice {
        /// Major device number.
        major: u32,
        /// Minor device number.
        minor: u32,
    },
    /// Named pipe.
    Fifo,
    /// Unix domain socket.
    Socket,
}

/// Metadata carried in entry headers for every filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo {
    /// Size in bytes (regular files).
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub time_modified: i64,
    /// Access time, seconds since the epoch.
    pub time_access: i64,
    /// Status-change time, seconds since the epoch.
    pub time_changed: i64,
    /// Owning user id.
    pub user_id: u32,
    /// Owning group id.
    pub group_id: u32,
    /// Permission bits.
    pub permissions: u32,
    /// Set for special files.
    pub special: Option<SpecialKind>,
}

/// What kind of filesystem object a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Character/block device, fifo or socket.
    Special(SpecialKind),
}

/// Captures metadata of `path` without following symlinks.
pub fn capture(path: &Path) -> Result<(FsEntryKind, FileInfo)> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::FileNotFound {
            path: path.display().to_string(),
        },
        _ => Error::Io(e),
    })?;
    Ok((classify(&metadata)?, file_info_from_metadata(&metadata)))
}

#[cfg(unix)]
fn classify(metadata: &Metadata) -> Result<FsEntryKind> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        return Ok(FsEntryKind::Symlink);
    }
    if file_type.is_dir() {
        return Ok(FsEntryKind::Directory);
    }
    if file_type.is_file() {
        return Ok(FsEntryKind::File);
    }
    let rdev = metadata.rdev() as libc::dev_t;
    #[allow(clippy::unnecessary_cast)]
    let (major, minor) = (libc::major(rdev) as u32, libc::minor(rdev) as u32);
    if file_type.is_char_device() {
        Ok(FsEntryKind::Special(SpecialKind::CharDevice { major, minor }))
    } else if file_type.is_block_device() {
        Ok(FsEntryKind::Special(SpecialKind::BlockDevice { major, minor }))
    } else if file_type.is_fifo() {
        Ok(FsEntryKind::Special(SpecialKind::Fifo))
    } else if file_type.is_socket() {
        Ok(FsEntryKind::Special(SpecialKind::Socket))
    } else {
        Err(Error::WrongEntryType {
            name: "unknown file type".into(),
        })
    }
}

#[cfg(not(unix))]
fn classify(metadata: &Metadata) -> Result<FsEntryKind> {
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        Ok(FsEntryKind::Symlink)
    } else if file_type.is_dir() {
        Ok(FsEntryKind::Directory)
    } else {
        Ok(FsEntryKind::File)
    }
}

#[cfg(unix)]
fn file_info_from_metadata(metadata: &Metadata) -> FileInfo {
    use std::os::unix::fs::MetadataExt;

    let special = match classify(metadata) {
        Ok(FsEntryKind::Special(kind)) => Some(kind),
        _ => None,
    };
    FileInfo {
        size: metadata.len(),
        time_modified: metadata.mtime(),
        time_access: metadata.atime(),
        time_changed: metadata.ctime(),
        user_id: metadata.uid(),
        group_id: metadata.gid(),
        permissions: metadata.mode() & 0o7777,
        special,
    }
}

#[cfg(not(unix))]
fn file_info_from_metadata(metadata: &Metadata) -> FileInfo {
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    FileInfo {
        size: metadata.len(),
        time_modified: mtime,
        time_access: mtime,
        time_changed: mtime,
        user_id: 0,
        group_id: 0,
        permissions: if metadata.permissions().readonly() {
            0o444
        } else {
            0o644
        },
        special: None,
    }
}

/// The identity used to group hard links: `(device, inode)` plus the link
/// count.
#[cfg(unix)]
pub fn hardlink_id(path: &Path) -> Result<(u64, u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let metadata = std::fs::symlink_metadata(path)?;
    Ok((metadata.dev(), metadata.ino(), metadata.nlink()))
}

/// Sets permission bits on `path`.
pub fn apply_permissions(path: &Path, permissions: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(permissions))?;
    }
    #[cfg(not(unix))]
    {
        let _ = permissions;
        let _ = path;
    }
    Ok(())
}

/// Sets the owner of `path`. `user_id`/`group_id` of `u32::MAX` leave the
/// respective id unchanged.
#[cfg(unix)]
pub fn apply_owner(path: &Path, user_id: u32, group_id: u32) -> Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::FileNotFound {
            path: path.display().to_string(),
        })?;
    let rc = unsafe { libc::lchown(cpath.as_ptr(), user_id, group_id) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Sets the owner of `path` (no-op on non-unix platforms).
#[cfg(not(unix))]
pub fn apply_owner(_path: &Path, _user_id: u32, _group_id: u32) -> Result<()> {
    Ok(())
}

/// Restores modification and access times on `path`.
pub fn apply_times(path: &Path, info: &FileInfo) -> Result<()> {
    let mtime = filetime::FileTime::from_unix_time(info.time_modified, 0);
    let atime = filetime::FileTime::from_unix_time(info.time_access, 0);
    filetime::set_symlink_file_times(path, atime, mtime)?;
    Ok(())
}

/// Creates a special filesystem node described by `kind`.
///
/// Sockets cannot be re-created from an archive; callers downgrade that
/// case to a warning.
#[cfg(unix)]
pub fn create_special(path: &Path, kind: SpecialKind, permissions: u32) -> Result<()> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::FileNotFound {
            path: path.display().to_string(),
        })?;
    #[allow(clippy::unnecessary_cast)]
    let (mode, dev) = match kind {
        SpecialKind::CharDevice { major, minor } => (
            libc::S_IFCHR | permissions as libc::mode_t,
            libc::makedev(major as _, minor as _),
        ),
        SpecialKind::BlockDevice { major, minor } => (
            libc::S_IFBLK | permissions as libc::mode_t,
            libc::makedev(major as _, minor as _),
        ),
        SpecialKind::Fifo => (libc::S_IFIFO | permissions as libc::mode_t, 0),
        SpecialKind::Socket => {
            return Err(Error::WrongEntryType {
                name: path.display().to_string(),
            });
        }
    };
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode, dev) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Creates a special filesystem node (unsupported off unix).
#[cfg(not(unix))]
pub fn create_special(path: &Path, _kind: SpecialKind, _permissions: u32) -> Result<()> {
    Err(Error::WrongEntryType {
        name: path.display().to_string(),
    })
}

/// Creates a symbolic link at `path` pointing at `target`.
#[cfg(unix)]
pub fn create_symlink(path: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

/// Creates a symbolic link (unsupported off unix).
#[cfg(not(unix))]
pub fn create_symlink(path: &Path, _target: &Path) -> Result<()> {
    Err(Error::WrongEntryType {
        name: path.display().to_string(),
    })
}
