//! File and filesystem permissions

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use url::Url;

use super::SecurityPolicy;
use crate::origin::{FILE_SCHEME, FILESYSTEM_SCHEME, Origin, inner_url};
use crate::process::{FilePermissions, FileSystemReferences, ProcessId};

/// Kind of storage a filesystem URL points into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileSystemType {
    Temporary,
    Persistent,
    /// Files exposed to a page through drag and drop or a picker
    Isolated,
    /// Mounted native directories
    External,
    Test,
}

impl FileSystemType {
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment {
            "temporary" => Some(Self::Temporary),
            "persistent" => Some(Self::Persistent),
            "isolated" => Some(Self::Isolated),
            "external" => Some(Self::External),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::Persistent => "persistent",
            Self::Isolated => "isolated",
            Self::External => "external",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cracked filesystem URL.
///
/// `fs_type` is the storage the file lives in; `mount_type` is how it was
/// exposed. For isolated mounts `mount_filesystem_id` names the mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemUrl {
    origin: Origin,
    fs_type: FileSystemType,
    mount_type: FileSystemType,
    mount_filesystem_id: String,
    path: PathBuf,
}

impl FileSystemUrl {
    pub fn new(origin: Origin, fs_type: FileSystemType, path: impl Into<PathBuf>) -> Self {
        Self {
            origin,
            fs_type,
            mount_type: fs_type,
            mount_filesystem_id: String::new(),
            path: path.into(),
        }
    }

    /// A file reached through the isolated mount `filesystem_id`
    pub fn isolated(
        origin: Origin,
        fs_type: FileSystemType,
        filesystem_id: &str,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            origin,
            fs_type,
            mount_type: FileSystemType::Isolated,
            mount_filesystem_id: filesystem_id.to_string(),
            path: path.into(),
        }
    }

    /// Crack `filesystem:<origin>/<type>/<path>`.
    ///
    /// Isolated URLs carry the mount id as the first path segment.
    pub fn parse(url: &Url) -> Option<Self> {
        if url.scheme() != FILESYSTEM_SCHEME {
            return None;
        }
        let inner = inner_url(url)?;
        let origin = Origin::from_url(&inner);
        if origin.is_opaque() {
            return None;
        }

        let mut segments = inner.path_segments()?;
        let fs_type = FileSystemType::from_path_segment(segments.next()?)?;
        if fs_type == FileSystemType::Isolated {
            let filesystem_id = segments.next().filter(|id| !id.is_empty())?;
            let path = virtual_path(segments);
            return Some(Self::isolated(origin, FileSystemType::Isolated, filesystem_id, path));
        }
        Some(Self::new(origin, fs_type, virtual_path(segments)))
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn fs_type(&self) -> FileSystemType {
        self.fs_type
    }

    pub fn mount_type(&self) -> FileSystemType {
        self.mount_type
    }

    pub fn mount_filesystem_id(&self) -> &str {
        &self.mount_filesystem_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_valid(&self) -> bool {
        !self.origin.is_opaque()
            && (self.mount_type != FileSystemType::Isolated || !self.mount_filesystem_id.is_empty())
    }

    fn references_parent(&self) -> bool {
        self.path
            .components()
            .any(|component| component == Component::ParentDir)
    }

    fn is_root_path(&self) -> bool {
        !self
            .path
            .components()
            .any(|component| matches!(component, Component::Normal(_)))
    }
}

fn virtual_path<'a>(segments: impl Iterator<Item = &'a str>) -> PathBuf {
    let mut path = PathBuf::from("/");
    for segment in segments.filter(|segment| !segment.is_empty()) {
        path.push(segment);
    }
    path
}

/// How permissions for a filesystem type are decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileSystemPermissionPolicy(u32);

impl FileSystemPermissionPolicy {
    pub const ALWAYS_DENY: Self = Self(0);
    /// Only reads are ever allowed
    pub const READ_ONLY: Self = Self(1 << 0);
    /// Defer to the per-file grants of the underlying path
    pub const USE_FILE_PERMISSION: Self = Self(1 << 1);
    /// Origin-scoped storage, allowed once the origin is committable
    pub const SANDBOX: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for FileSystemPermissionPolicy {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Policies registered when a [`SecurityPolicy`] is built
pub(crate) fn default_file_system_policies() -> HashMap<FileSystemType, FileSystemPermissionPolicy> {
    HashMap::from([
        (FileSystemType::Temporary, FileSystemPermissionPolicy::SANDBOX),
        (FileSystemType::Persistent, FileSystemPermissionPolicy::SANDBOX),
        (FileSystemType::External, FileSystemPermissionPolicy::USE_FILE_PERMISSION),
    ])
}

/// Reference counts of isolated filesystem mounts.
///
/// A mount stays registered while any process state holds a grant for it.
#[derive(Debug, Default)]
pub struct IsolatedFileSystemRegistry {
    references: Mutex<HashMap<String, usize>>,
}

impl IsolatedFileSystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference_count(&self, filesystem_id: &str) -> usize {
        self.references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(filesystem_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_registered(&self, filesystem_id: &str) -> bool {
        self.reference_count(filesystem_id) > 0
    }
}

impl FileSystemReferences for IsolatedFileSystemRegistry {
    fn add_reference(&self, filesystem_id: &str) {
        let mut references = self.references.lock().unwrap_or_else(PoisonError::into_inner);
        *references.entry(filesystem_id.to_string()).or_default() += 1;
    }

    fn remove_reference(&self, filesystem_id: &str) {
        let mut references = self.references.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = references.get_mut(filesystem_id) else {
            log::warn!("releasing unknown filesystem {filesystem_id}");
            return;
        };
        *count -= 1;
        if *count == 0 {
            references.remove(filesystem_id);
            log::debug!("filesystem {filesystem_id} revoked");
        }
    }
}

impl SecurityPolicy {
    // File grants

    pub fn grant_permissions_for_file(&self, process: ProcessId, file: &Path, permissions: FilePermissions) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_permissions_for_file(file, permissions);
        }
    }

    pub fn grant_read_file(&self, process: ProcessId, file: &Path) {
        self.grant_permissions_for_file(process, file, FilePermissions::READ_GRANT);
    }

    pub fn grant_write_file(&self, process: ProcessId, file: &Path) {
        self.grant_permissions_for_file(process, file, FilePermissions::WRITE_GRANT);
    }

    pub fn grant_create_file(&self, process: ProcessId, file: &Path) {
        self.grant_permissions_for_file(process, file, FilePermissions::CREATE_NEW_GRANT);
    }

    pub fn grant_create_read_write_file(&self, process: ProcessId, file: &Path) {
        self.grant_permissions_for_file(process, file, FilePermissions::CREATE_READ_WRITE_GRANT);
    }

    pub fn grant_copy_into_file(&self, process: ProcessId, dir: &Path) {
        self.grant_permissions_for_file(process, dir, FilePermissions::COPY_INTO_GRANT);
    }

    pub fn grant_delete_from_file(&self, process: ProcessId, dir: &Path) {
        self.grant_permissions_for_file(process, dir, FilePermissions::DELETE_GRANT);
    }

    /// Allow loading exactly the file behind a `file://` URL
    pub fn grant_request_specific_file_url(&self, process: ProcessId, url: &Url) {
        if url.scheme() != FILE_SCHEME {
            return;
        }
        let Ok(path) = url.to_file_path() else {
            return;
        };
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_request_of_specific_file(&path);
        }
    }

    pub fn revoke_all_permissions_for_file(&self, process: ProcessId, file: &Path) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.revoke_all_permissions_for_file(file);
        }
    }

    // File checks

    pub fn has_permissions_for_file(&self, process: ProcessId, file: &Path, permissions: FilePermissions) -> bool {
        self.inner
            .processes()
            .store
            .get(process)
            .is_some_and(|state| state.has_permissions_for_file(file, permissions))
    }

    pub fn can_read_file(&self, process: ProcessId, file: &Path) -> bool {
        self.has_permissions_for_file(process, file, FilePermissions::READ_GRANT)
    }

    pub fn can_read_all_files(&self, process: ProcessId, files: &[PathBuf]) -> bool {
        files.iter().all(|file| self.can_read_file(process, file))
    }

    pub fn can_create_read_write_file(&self, process: ProcessId, file: &Path) -> bool {
        self.has_permissions_for_file(process, file, FilePermissions::CREATE_READ_WRITE_GRANT)
    }

    // Filesystem grants

    pub fn grant_permissions_for_file_system(
        &self,
        process: ProcessId,
        filesystem_id: &str,
        permissions: FilePermissions,
    ) {
        if let Some(state) = self.inner.processes().store.get_mut(process) {
            state.grant_permissions_for_file_system(filesystem_id, permissions);
        }
    }

    pub fn grant_read_file_system(&self, process: ProcessId, filesystem_id: &str) {
        self.grant_permissions_for_file_system(process, filesystem_id, FilePermissions::READ_GRANT);
    }

    pub fn grant_write_file_system(&self, process: ProcessId, filesystem_id: &str) {
        self.grant_permissions_for_file_system(process, filesystem_id, FilePermissions::WRITE_GRANT);
    }

    pub fn grant_create_file_for_file_system(&self, process: ProcessId, filesystem_id: &str) {
        self.grant_permissions_for_file_system(process, filesystem_id, FilePermissions::CREATE_NEW_GRANT);
    }

    pub fn grant_create_read_write_file_system(&self, process: ProcessId, filesystem_id: &str) {
        self.grant_permissions_for_file_system(process, filesystem_id, FilePermissions::CREATE_READ_WRITE_GRANT);
    }

    pub fn grant_copy_into_file_system(&self, process: ProcessId, filesystem_id: &str) {
        self.grant_permissions_for_file_system(process, filesystem_id, FilePermissions::COPY_INTO_GRANT);
    }

    pub fn grant_delete_from_file_system(&self, process: ProcessId, filesystem_id: &str) {
        self.grant_permissions_for_file_system(process, filesystem_id, FilePermissions::DELETE_GRANT);
    }

    /// Replace how files of `fs_type` are authorized
    pub fn register_file_system_permission_policy(&self, fs_type: FileSystemType, policy: FileSystemPermissionPolicy) {
        self.inner
            .processes()
            .file_system_policies
            .insert(fs_type, policy);
    }

    // Filesystem checks

    pub fn has_permissions_for_file_system(
        &self,
        process: ProcessId,
        filesystem_id: &str,
        permissions: FilePermissions,
    ) -> bool {
        self.inner
            .processes()
            .store
            .get(process)
            .is_some_and(|state| state.has_permissions_for_file_system(filesystem_id, permissions))
    }

    pub fn can_read_file_system(&self, process: ProcessId, filesystem_id: &str) -> bool {
        self.has_permissions_for_file_system(process, filesystem_id, FilePermissions::READ_GRANT)
    }

    pub fn can_read_write_file_system(&self, process: ProcessId, filesystem_id: &str) -> bool {
        self.has_permissions_for_file_system(
            process,
            filesystem_id,
            FilePermissions::READ_GRANT | FilePermissions::WRITE_GRANT,
        )
    }

    pub fn can_copy_into_file_system(&self, process: ProcessId, filesystem_id: &str) -> bool {
        self.has_permissions_for_file_system(process, filesystem_id, FilePermissions::COPY_INTO_GRANT)
    }

    pub fn can_delete_from_file_system(&self, process: ProcessId, filesystem_id: &str) -> bool {
        self.has_permissions_for_file_system(process, filesystem_id, FilePermissions::DELETE_GRANT)
    }

    /// Whether the process may touch `url` with `permissions`.
    ///
    /// Isolated mounts are decided by the mount grant alone. Everything else
    /// requires the URL's origin to be committable and is then decided by the
    /// policy registered for the filesystem type.
    pub fn has_permissions_for_file_system_file(
        &self,
        process: ProcessId,
        url: &FileSystemUrl,
        permissions: FilePermissions,
    ) -> bool {
        if !url.is_valid() || url.references_parent() {
            return false;
        }

        // The root is never writable.
        if url.is_root_path() && permissions != FilePermissions::READ_GRANT {
            return false;
        }

        if url.mount_type() == FileSystemType::Isolated {
            return self.has_permissions_for_file_system(process, url.mount_filesystem_id(), permissions);
        }

        let Some(origin_url) = url.origin().to_url() else {
            return false;
        };
        if !self.can_commit_url(process, &origin_url) {
            return false;
        }

        let policy = {
            let table = self.inner.processes();
            match table.file_system_policies.get(&url.fs_type()) {
                Some(policy) => *policy,
                None => return false,
            }
        };

        if policy.contains(FileSystemPermissionPolicy::READ_ONLY) && permissions != FilePermissions::READ_GRANT {
            return false;
        }
        if policy.contains(FileSystemPermissionPolicy::USE_FILE_PERMISSION) {
            return self.has_permissions_for_file(process, url.path(), permissions);
        }
        policy.contains(FileSystemPermissionPolicy::SANDBOX)
    }

    pub fn can_read_file_system_file(&self, process: ProcessId, url: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, url, FilePermissions::READ_GRANT)
    }

    pub fn can_write_file_system_file(&self, process: ProcessId, url: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, url, FilePermissions::WRITE_GRANT)
    }

    pub fn can_create_file_system_file(&self, process: ProcessId, url: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, url, FilePermissions::CREATE_NEW_GRANT)
    }

    pub fn can_create_read_write_file_system_file(&self, process: ProcessId, url: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, url, FilePermissions::CREATE_READ_WRITE_GRANT)
    }

    pub fn can_copy_into_file_system_file(&self, process: ProcessId, url: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, url, FilePermissions::COPY_INTO_GRANT)
    }

    pub fn can_delete_file_system_file(&self, process: ProcessId, url: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, url, FilePermissions::DELETE_GRANT)
    }

    pub fn can_move_file_system_file(&self, process: ProcessId, src: &FileSystemUrl, dest: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, dest, FilePermissions::CREATE_NEW_GRANT)
            && self.has_permissions_for_file_system_file(process, src, FilePermissions::READ_GRANT)
            && self.has_permissions_for_file_system_file(process, src, FilePermissions::DELETE_GRANT)
    }

    pub fn can_copy_file_system_file(&self, process: ProcessId, src: &FileSystemUrl, dest: &FileSystemUrl) -> bool {
        self.has_permissions_for_file_system_file(process, src, FilePermissions::READ_GRANT)
            && self.has_permissions_for_file_system_file(process, dest, FilePermissions::COPY_INTO_GRANT)
    }
}
