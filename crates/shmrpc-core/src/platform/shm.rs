//! POSIX shared memory segments.
//!
//! Names are passed around without the leading `/`; it is added only at the
//! `shm_open`/`shm_unlink` boundary. Segments are mapped with `memmap2`.

#![allow(unsafe_code)]

use crate::config::LockConfig;
use crate::error::{Result, ShmRpcError};
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::{sysconf, SysconfVar};
use std::fs::File;
use std::time::{Duration, Instant};
use tracing::debug;

/// OS page size, falling back to 4 KiB if it cannot be queried.
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Smallest `page_size * 2^k` that holds `min_size` bytes.
pub fn round_to_page_power(min_size: usize) -> usize {
    let mut capacity = page_size();
    while capacity < min_size {
        capacity *= 2;
    }
    capacity
}

fn os_name(name: &str) -> String {
    format!("/{}", name)
}

/// A named, mapped shared memory segment.
pub struct ShmSegment {
    name: String,
    map: MmapMut,
    _file: File,
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("len", &self.map.len())
            .finish()
    }
}

impl ShmSegment {
    /// Create a segment of exactly `len` bytes, zero-filled.
    ///
    /// With `exclusive`, fails with `ChannelExists` if the name is taken;
    /// otherwise an existing segment is unlinked first and replaced.
    pub fn create(name: &str, len: usize, exclusive: bool) -> Result<Self> {
        if !exclusive {
            Self::unlink(name)?;
        }

        let flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let fd = shm_open(os_name(name).as_str(), flags, Mode::from_bits_truncate(0o600))
            .map_err(|e| match e {
                Errno::EEXIST => ShmRpcError::ChannelExists {
                    name: name.to_string(),
                },
                e => ShmRpcError::os("shm_open", format!("{}: {}", name, e.desc())),
            })?;
        let file = File::from(fd);
        file.set_len(len as u64)?;

        Self::map(name, file)
    }

    /// Attach to an existing segment; its size comes from the OS.
    pub fn open(name: &str) -> Result<Self> {
        let fd = shm_open(os_name(name).as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            match e {
                Errno::ENOENT => ShmRpcError::NoSuchChannel {
                    name: name.to_string(),
                },
                e => ShmRpcError::os("shm_open", format!("{}: {}", name, e.desc())),
            }
        })?;
        let file = File::from(fd);

        // A concurrent creator may not have sized the segment yet.
        let deadline = Instant::now() + LockConfig::INIT_WAIT;
        while file.metadata()?.len() == 0 {
            if Instant::now() >= deadline {
                return Err(ShmRpcError::protocol(format!(
                    "shared memory segment {} was never sized",
                    name
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        Self::map(name, file)
    }

    fn map(name: &str, file: File) -> Result<Self> {
        // SAFETY: the mapping is shared with other processes. All
        // cross-process access goes through atomics (lock words) or happens
        // while the owning hybrid lock is held (channel payloads).
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!("Mapped shared memory {} ({} bytes)", name, map.len());
        Ok(Self {
            name: name.to_string(),
            map,
            _file: file,
        })
    }

    /// Remove the name; existing mappings stay valid. Returns whether it existed.
    pub fn unlink(name: &str) -> Result<bool> {
        match shm_unlink(os_name(name).as_str()) {
            Ok(()) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(e) => Err(ShmRpcError::os(
                "shm_unlink",
                format!("{}: {}", name, e.desc()),
            )),
        }
    }

    /// Whether a segment of this name currently exists.
    pub fn exists(name: &str) -> bool {
        match shm_open(os_name(name).as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }
}
