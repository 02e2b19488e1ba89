//! Encrypted, signed pool persistence.
//!
//! A pool file only ever changes by atomic rename of a fully written sibling
//! temp file. The repository assumes a single writer; concurrent processes
//! racing on the same file resolve as last-writer-wins.

use crate::cipher;
use crate::error::{MacvaultError, MacvaultResult};
use crate::pool::Pool;
use crate::signer::{self, SignatureStatus};
use log::{debug, warn};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const POOL_FILE_MODE: u32 = 0o600;

/// Behaviour switches for a repository, usually taken from `[pool]` config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// Copy the existing file to `<path>.bak` before the first save.
    pub backup: bool,
    /// Treat a pool without a signature as an integrity failure.
    pub reject_unsigned: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            backup: true,
            reject_unsigned: false,
        }
    }
}

/// A decrypted pool together with how its signature checked out.
#[derive(Debug, Clone)]
pub struct LoadedPool {
    pub pool: Pool,
    pub signature: SignatureStatus,
}

impl LoadedPool {
    pub fn is_legacy_unsigned(&self) -> bool {
        self.signature == SignatureStatus::Unsigned
    }
}

#[derive(Debug)]
pub struct PoolRepository {
    path: PathBuf,
    options: RepositoryOptions,
    backed_up: bool,
}

impl PoolRepository {
    pub fn new(path: impl Into<PathBuf>, options: RepositoryOptions) -> Self {
        Self {
            path: path.into(),
            options,
            backed_up: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Size of the encrypted file on disk.
    pub fn file_size(&self) -> MacvaultResult<u64> {
        Ok(fs::metadata(&self.path).map_err(|err| self.read_error(err))?.len())
    }

    pub fn backup_path(&self) -> PathBuf {
        backup_path_for(&self.path)
    }

    /// Decrypt, parse, validate and verify the pool.
    pub fn load(&self, passphrase: &str) -> MacvaultResult<Pool> {
        self.load_verified(passphrase).map(|loaded| loaded.pool)
    }

    /// Like [`load`](Self::load) but also reports whether the pool was signed.
    pub fn load_verified(&self, passphrase: &str) -> MacvaultResult<LoadedPool> {
        let raw = fs::read(&self.path).map_err(|err| self.read_error(err))?;
        let plaintext = cipher::open(&raw, passphrase)?;
        let pool: Pool = serde_json::from_slice(&plaintext)?;
        pool.validate()?;

        let signature = signer::document_status(&plaintext, passphrase)?;
        match signature {
            SignatureStatus::Verified => {
                debug!("pool {} signature verified", self.path.display());
            }
            SignatureStatus::Mismatch => return Err(MacvaultError::Integrity),
            SignatureStatus::Unsigned if self.options.reject_unsigned => {
                warn!(
                    "pool {} carries no signature and unsigned pools are rejected",
                    self.path.display()
                );
                return Err(MacvaultError::Integrity);
            }
            SignatureStatus::Unsigned => {
                warn!(
                    "pool {} carries no signature; integrity cannot be verified",
                    self.path.display()
                );
            }
        }

        Ok(LoadedPool { pool, signature })
    }

    /// Seal and atomically persist `pool` exactly as given. Callers are
    /// expected to have signed it; see [`commit`](Self::commit).
    pub fn save(&mut self, pool: &Pool, passphrase: &str) -> MacvaultResult<()> {
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(pool)?);
        let blob = cipher::seal(&plaintext, passphrase)?;

        let dest = resolve_write_path(&self.path)?;
        if self.options.backup && !self.backed_up {
            self.backed_up = true;
            backup_existing(&dest);
        }

        write_atomic(&dest, blob.as_bytes())?;
        debug!("pool written to {}", dest.display());
        Ok(())
    }

    /// Stamp, sign and save: the standard tail of every mutation.
    pub fn commit(&mut self, pool: &mut Pool, passphrase: &str) -> MacvaultResult<()> {
        pool.touch();
        signer::sign(pool, passphrase)?;
        self.save(pool, passphrase)
    }

    /// Write a fresh empty pool. Refuses to replace an existing file unless
    /// `overwrite` is set.
    pub fn create(
        &mut self,
        mut pool: Pool,
        passphrase: &str,
        overwrite: bool,
    ) -> MacvaultResult<Pool> {
        if self.path.exists() && !overwrite {
            return Err(MacvaultError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("pool file {} already exists", self.path.display()),
            )));
        }
        self.commit(&mut pool, passphrase)?;
        Ok(pool)
    }

    /// Re-sign and re-encrypt under `new_passphrase`. When the save fails the
    /// file on disk is unchanged and `pool` is re-signed under the old
    /// passphrase before the error is returned.
    pub fn change_passphrase(
        &mut self,
        pool: &mut Pool,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> MacvaultResult<()> {
        match self.commit(pool, new_passphrase) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("passphrase change failed, keeping previous passphrase: {err}");
                signer::sign(pool, old_passphrase)?;
                Err(err)
            }
        }
    }

    fn read_error(&self, err: io::Error) -> MacvaultError {
        if err.kind() == io::ErrorKind::NotFound {
            MacvaultError::NotFound(self.path.clone())
        } else {
            MacvaultError::Io(err)
        }
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

fn backup_existing(dest: &Path) {
    if !dest.is_file() {
        return;
    }
    let backup = backup_path_for(dest);
    match fs::copy(dest, &backup) {
        Ok(_) => {
            if let Err(err) = fs::set_permissions(&backup, fs::Permissions::from_mode(POOL_FILE_MODE)) {
                warn!("failed to restrict permissions on {}: {err}", backup.display());
            }
            debug!("backed up {} to {}", dest.display(), backup.display());
        }
        Err(err) => warn!("failed to back up {}: {err}", dest.display()),
    }
}

fn write_atomic(dest: &Path, contents: &[u8]) -> MacvaultResult<()> {
    write_atomic_with(dest, contents, |temp, dest| {
        temp.persist(dest).map(drop).map_err(|err| err.error)
    })
}

/// `persist` moves the fully written temp file over `dest`. If it fails the
/// temp file is dropped and `dest` is left as it was.
fn write_atomic_with<F>(dest: &Path, contents: &[u8], persist: F) -> MacvaultResult<()>
where
    F: FnOnce(NamedTempFile, &Path) -> io::Result<()>,
{
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let ownership = fs::metadata(dest)
        .ok()
        .map(|meta| (meta.uid(), meta.gid()));

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(contents)?;
    temp.as_file_mut().flush()?;

    if let Some((uid, gid)) = ownership {
        let rc = unsafe { libc::fchown(temp.as_file().as_raw_fd(), uid, gid) };
        if rc != 0 {
            warn!(
                "could not preserve ownership of {}: {}",
                dest.display(),
                io::Error::last_os_error()
            );
        }
    }

    temp.as_file().sync_all()?;
    persist(temp, dest)?;

    if let Err(err) = fs::set_permissions(dest, fs::Permissions::from_mode(POOL_FILE_MODE)) {
        warn!("failed to restrict permissions on {}: {err}", dest.display());
    }
    if let Err(err) = sync_parent_dir(parent) {
        debug!("parent directory sync for {} failed: {err}", dest.display());
    }
    Ok(())
}

/// Follow symlinks so the rename replaces the real file, not the link.
fn resolve_write_path(path: &Path) -> MacvaultResult<PathBuf> {
    let mut candidate = path.to_path_buf();
    for _ in 0..16 {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(MacvaultError::Io(err)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(candidate);
        }

        let target = fs::read_link(&candidate)?;
        candidate = if target.is_absolute() {
            target
        } else {
            candidate
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(target)
        };
    }

    Err(MacvaultError::Provider(format!(
        "symlink resolution depth exceeded for {}",
        path.display()
    )))
}

fn sync_parent_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}
