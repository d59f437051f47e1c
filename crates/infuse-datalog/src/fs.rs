// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Filesystem block logger backend
//!
//! Presents the block logger contract over fixed-size binary files on a
//! removable volume (exFAT on device, any directory on a host). Blocks
//! are stored sequentially across a file series
//! `infuse_<device_id:016x>_<index:06>.bin`; a device-ID change starts a
//! new series without touching the old one, so a card moved between
//! boards keeps both logs.
//!
//! Volume conventions:
//! * `README.txt` is created once to explain the contents to whoever
//!   mounts the card on a PC.
//! * `DELETE_TO_RESET.txt` is a user-facing sentinel: deleting it wipes
//!   all log files on the next init.
//! * `volume.label` holds the volume label (host stand-in for the exFAT
//!   label record).
//!
//! Media power is managed lazily through [`MediaPower`] with a claim
//! refcount, so the card can be powered down between bursts of writes.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::LoggerError;
use crate::logger::{BlockHeader, LoggerBackend};

const SENTINEL_NAME: &str = "DELETE_TO_RESET.txt";
const README_NAME: &str = "README.txt";
const LABEL_NAME: &str = "volume.label";
const SERIES_PREFIX: &str = "infuse_";
const SERIES_SUFFIX: &str = ".bin";

const README_TEXT: &str = "This volume holds binary telemetry logged by an Infuse device.\n\
Files named infuse_<device>_<index>.bin contain raw log blocks.\n\
Delete DELETE_TO_RESET.txt to wipe all logs on the next boot.\n";

const SENTINEL_TEXT: &str = "Delete this file to erase all logged data on the next boot.\n";

/// Host power control for the storage medium
pub trait MediaPower: Send {
    fn resume(&mut self) -> Result<(), LoggerError>;
    fn suspend(&mut self);
}

struct PowerState {
    driver: Option<Box<dyn MediaPower>>,
    refs: u32,
}

fn power_acquire(power: &Mutex<PowerState>) -> Result<(), LoggerError> {
    let mut state = power.lock();
    if state.refs == 0 {
        if let Some(driver) = &mut state.driver {
            driver.resume()?;
        }
    }
    state.refs += 1;
    Ok(())
}

fn power_release(power: &Mutex<PowerState>) {
    let mut state = power.lock();
    state.refs -= 1;
    if state.refs == 0 {
        if let Some(driver) = &mut state.driver {
            driver.suspend();
        }
    }
}

/// Filesystem logger configuration
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Mount point of the volume
    pub root: PathBuf,
    /// Device identity baked into file names
    pub device_id: u64,
    pub block_size: usize,
    /// Bytes per log file, a multiple of `block_size`
    pub file_size: usize,
    /// Volume capacity available for log files; 0 for unbounded
    pub max_bytes: u64,
    pub volume_label: String,
}

struct ClaimState {
    held: bool,
    buf: Option<Vec<u8>>,
}

struct ClaimShared {
    state: Mutex<ClaimState>,
    cond: Condvar,
}

/// Exclusive handle to the backend's shared block buffer.
///
/// Holds a media power reference until dropped. Claims are not
/// re-entrant; a second claim on the same thread deadlocks until the
/// timeout expires.
pub struct FsClaim {
    shared: Arc<ClaimShared>,
    power: Arc<Mutex<PowerState>>,
    buf: Option<Vec<u8>>,
}

impl std::ops::Deref for FsClaim {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl std::ops::DerefMut for FsClaim {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for FsClaim {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.buf = self.buf.take();
        state.held = false;
        self.shared.cond.notify_one();
        drop(state);
        power_release(&self.power);
    }
}

/// Block logger backend over a directory of fixed-size files
pub struct FsBackend {
    config: FsConfig,
    blocks_per_file: u32,
    capacity_blocks: u32,
    logical_blocks: u32,
    data_bytes: u64,
    power: Arc<Mutex<PowerState>>,
    claim: Arc<ClaimShared>,
}

impl FsBackend {
    /// Mount the volume: validate the label, seed `README.txt`, honor
    /// the wipe sentinel and index the existing file series
    pub fn new(config: FsConfig, power: Option<Box<dyn MediaPower>>) -> Result<Self, LoggerError> {
        if config.block_size <= BlockHeader::SIZE
            || config.file_size == 0
            || config.file_size % config.block_size != 0
        {
            return Err(LoggerError::Invalid);
        }
        let power = Arc::new(Mutex::new(PowerState {
            driver: power,
            refs: 0,
        }));
        power_acquire(&power)?;
        let result = Self::mount(config, Arc::clone(&power));
        power_release(&power);
        result
    }

    fn mount(config: FsConfig, power: Arc<Mutex<PowerState>>) -> Result<Self, LoggerError> {
        fs::create_dir_all(&config.root)?;

        let label_path = config.root.join(LABEL_NAME);
        match fs::read_to_string(&label_path) {
            Ok(label) => {
                if label.trim() != config.volume_label {
                    log::error!(
                        "volume label mismatch: found {:?}, expected {:?}",
                        label.trim(),
                        config.volume_label
                    );
                    return Err(LoggerError::Invalid);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&label_path, format!("{}\n", config.volume_label))?;
            }
            Err(e) => return Err(e.into()),
        }

        let readme = config.root.join(README_NAME);
        if !readme.exists() {
            fs::write(&readme, README_TEXT)?;
        }

        let sentinel = config.root.join(SENTINEL_NAME);
        if !sentinel.exists() {
            log::info!("reset sentinel missing, wiping log files");
            wipe_series_files(&config.root)?;
            fs::write(&sentinel, SENTINEL_TEXT)?;
        }

        let blocks_per_file = (config.file_size / config.block_size) as u32;
        let capacity_blocks = if config.max_bytes > 0 {
            let blocks = (config.max_bytes / config.block_size as u64).min(u32::MAX as u64) as u32;
            (blocks / blocks_per_file) * blocks_per_file
        } else {
            (u32::MAX / blocks_per_file) * blocks_per_file
        };
        if capacity_blocks == 0 {
            return Err(LoggerError::Invalid);
        }

        let data_bytes = series_bytes(&config.root)?;
        Ok(FsBackend {
            config,
            blocks_per_file,
            capacity_blocks,
            logical_blocks: capacity_blocks,
            data_bytes,
            power,
            claim: Arc::new(ClaimShared {
                state: Mutex::new(ClaimState {
                    held: false,
                    buf: Some(Vec::new()),
                }),
                cond: Condvar::new(),
            }),
        })
    }

    fn file_path(&self, index: u32) -> PathBuf {
        self.config.root.join(format!(
            "{SERIES_PREFIX}{:016x}_{:06}{SERIES_SUFFIX}",
            self.config.device_id, index
        ))
    }

    /// Indices of the current device's file series
    fn series_indices(&self) -> Result<Vec<u32>, LoggerError> {
        let prefix = format!("{SERIES_PREFIX}{:016x}_", self.config.device_id);
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.config.root)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(digits) = rest.strip_suffix(SERIES_SUFFIX) else {
                continue;
            };
            if let Ok(index) = digits.parse::<u32>() {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Take the shared block buffer, waiting up to `timeout` for another
    /// holder to release it
    pub fn claim(&self, timeout: Duration) -> Result<FsClaim, LoggerError> {
        let mut state = self.claim.state.lock();
        while state.held {
            if self.claim.cond.wait_for(&mut state, timeout).timed_out() {
                return Err(LoggerError::Timeout);
            }
        }
        state.held = true;
        let mut buf = state.buf.take().unwrap_or_default();
        buf.resize(self.config.block_size, 0);
        drop(state);
        power_acquire(&self.power)?;
        Ok(FsClaim {
            shared: Arc::clone(&self.claim),
            power: Arc::clone(&self.power),
            buf: Some(buf),
        })
    }
}

fn wipe_series_files(root: &Path) -> Result<(), LoggerError> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(SERIES_PREFIX) && name.ends_with(SERIES_SUFFIX) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn series_bytes(root: &Path) -> Result<u64, LoggerError> {
    let mut total = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(SERIES_PREFIX) && name.ends_with(SERIES_SUFFIX) {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

impl LoggerBackend for FsBackend {
    fn logical_blocks(&self) -> u32 {
        self.logical_blocks
    }

    fn physical_blocks(&self) -> u32 {
        self.capacity_blocks
    }

    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn block_overhead(&self) -> usize {
        BlockHeader::SIZE
    }

    fn erase_blocks(&self) -> u32 {
        self.blocks_per_file
    }

    fn block_align(&self) -> u32 {
        self.blocks_per_file
    }

    fn persistent(&self) -> bool {
        true
    }

    fn recover_head(&mut self) -> Result<Option<(u32, u32)>, LoggerError> {
        power_acquire(&self.power)?;
        let result = (|| {
            let indices = self.series_indices()?;
            let Some(&last) = indices.last() else {
                return Ok(Some((0, 0)));
            };
            let len = fs::metadata(self.file_path(last))?.len();
            let blocks = (len / self.config.block_size as u64) as u32;
            let current = last * self.blocks_per_file + blocks;
            let earliest = indices[0] * self.blocks_per_file;
            Ok(Some((current, earliest)))
        })();
        power_release(&self.power);
        result
    }

    fn read_header(&mut self, phys: u32) -> Result<BlockHeader, LoggerError> {
        let mut bytes = [BlockHeader::ERASED; BlockHeader::SIZE];
        match self.read(phys, 0, &mut bytes) {
            Ok(()) => Ok(BlockHeader::read_from(&bytes)),
            // Missing or short files read as erased blocks
            Err(_) => Ok(BlockHeader {
                wrap_count: BlockHeader::ERASED,
                block_type: BlockHeader::ERASED,
            }),
        }
    }

    fn write_block(
        &mut self,
        phys: u32,
        header: BlockHeader,
        payload: &[u8],
    ) -> Result<(), LoggerError> {
        let block_size = self.config.block_size as u64;
        if self.config.max_bytes > 0 && self.data_bytes + block_size > self.config.max_bytes {
            // Volume full: latch capacity at the last written block
            log::warn!("volume full at block {phys}, latching log as full");
            self.logical_blocks = phys;
            return Err(LoggerError::NoMemory);
        }

        power_acquire(&self.power)?;
        let result = (|| {
            let index = phys / self.blocks_per_file;
            let offset = (phys % self.blocks_per_file) as u64 * block_size;
            let path = self.file_path(index);
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)?;
            let old_len = file.metadata()?.len();
            file.seek(SeekFrom::Start(offset))?;
            let mut block = vec![0u8; self.config.block_size];
            header.write_to(&mut block);
            block[BlockHeader::SIZE..BlockHeader::SIZE + payload.len()].copy_from_slice(payload);
            file.write_all(&block)?;
            let new_len = file.metadata()?.len();
            self.data_bytes += new_len.saturating_sub(old_len);
            Ok(())
        })();
        power_release(&self.power);
        result
    }

    fn read(&mut self, phys: u32, offset: usize, out: &mut [u8]) -> Result<(), LoggerError> {
        power_acquire(&self.power)?;
        let result = (|| {
            let file_size = self.config.file_size as u64;
            let mut pos = phys as u64 * self.config.block_size as u64 + offset as u64;
            let mut filled = 0usize;
            while filled < out.len() {
                let index = (pos / file_size) as u32;
                let in_file = pos % file_size;
                let chunk = ((file_size - in_file) as usize).min(out.len() - filled);
                let mut file = File::open(self.file_path(index))
                    .map_err(|_| LoggerError::NotFound)?;
                file.seek(SeekFrom::Start(in_file))?;
                file.read_exact(&mut out[filled..filled + chunk])
                    .map_err(|_| LoggerError::NotFound)?;
                filled += chunk;
                pos += chunk as u64;
            }
            Ok(())
        })();
        power_release(&self.power);
        result
    }

    fn erase_range(&mut self, phys: u32, count: u32) -> Result<(), LoggerError> {
        power_acquire(&self.power)?;
        let result = (|| {
            let first = phys / self.blocks_per_file;
            let last = (phys + count - 1) / self.blocks_per_file;
            for index in first..=last {
                let path = self.file_path(index);
                let covers_whole = phys <= index * self.blocks_per_file
                    && (phys + count) >= (index + 1) * self.blocks_per_file;
                if covers_whole {
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                } else if path.exists() {
                    let keep = (phys % self.blocks_per_file) as u64
                        * self.config.block_size as u64;
                    OpenOptions::new().write(true).open(&path)?.set_len(keep)?;
                }
            }
            if phys == 0 {
                // A fresh erase clears the full-volume latch
                self.logical_blocks = self.capacity_blocks;
            }
            self.data_bytes = series_bytes(&self.config.root)?;
            Ok(())
        })();
        power_release(&self.power);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{DataLogger, EraseMode};
    use std::sync::atomic::{AtomicU32, Ordering};

    const BLOCK_SIZE: usize = 64;
    const FILE_SIZE: usize = 4 * BLOCK_SIZE;

    fn config(root: &Path, device_id: u64) -> FsConfig {
        FsConfig {
            root: root.to_path_buf(),
            device_id,
            block_size: BLOCK_SIZE,
            file_size: FILE_SIZE,
            max_bytes: 0,
            volume_label: "INFUSE".to_string(),
        }
    }

    fn payload(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_SIZE - BlockHeader::SIZE]
    }

    #[test]
    fn test_mount_creates_volume_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = FsBackend::new(config(dir.path(), 1), None).expect("mount");
        assert!(dir.path().join(README_NAME).exists());
        assert!(dir.path().join(SENTINEL_NAME).exists());
        assert!(dir.path().join(LABEL_NAME).exists());
    }

    #[test]
    fn test_label_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(LABEL_NAME), "OTHER\n").expect("write");
        assert!(FsBackend::new(config(dir.path(), 1), None).is_err());
    }

    #[test]
    fn test_write_reopen_recovers_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(config(dir.path(), 0xAB), None).expect("mount");
        let mut logger = DataLogger::new(backend).expect("logger");
        for i in 0..6u8 {
            logger.write(5, &payload(i)).expect("write");
        }
        drop(logger);

        // Blocks span two files of 4 blocks each
        let backend = FsBackend::new(config(dir.path(), 0xAB), None).expect("remount");
        let mut logger = DataLogger::new(backend).expect("logger");
        assert_eq!(logger.current_block(), 6);
        assert_eq!(logger.earliest_block(), 0);

        let mut block = vec![0u8; BLOCK_SIZE];
        logger.read(5, 0, &mut block).expect("read");
        assert_eq!(BlockHeader::read_from(&block).block_type, 5);
        assert!(block[2..].iter().all(|b| *b == 5));
    }

    #[test]
    fn test_missing_sentinel_wipes_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(config(dir.path(), 0xAB), None).expect("mount");
        let mut logger = DataLogger::new(backend).expect("logger");
        logger.write(5, &payload(1)).expect("write");
        drop(logger);

        fs::remove_file(dir.path().join(SENTINEL_NAME)).expect("remove sentinel");
        let backend = FsBackend::new(config(dir.path(), 0xAB), None).expect("remount");
        let logger = DataLogger::new(backend).expect("logger");
        assert_eq!(logger.current_block(), 0);
        assert!(dir.path().join(SENTINEL_NAME).exists());
    }

    #[test]
    fn test_device_id_change_starts_new_series() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(config(dir.path(), 0x1111), None).expect("mount");
        let mut logger = DataLogger::new(backend).expect("logger");
        for _ in 0..3 {
            logger.write(5, &payload(1)).expect("write");
        }
        drop(logger);

        let backend = FsBackend::new(config(dir.path(), 0x2222), None).expect("remount");
        let logger = DataLogger::new(backend).expect("logger");
        assert_eq!(logger.current_block(), 0);
        // Old series is untouched
        assert!(dir
            .path()
            .join("infuse_0000000000001111_000000.bin")
            .exists());
    }

    #[test]
    fn test_volume_full_latches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(dir.path(), 1);
        cfg.max_bytes = FILE_SIZE as u64; // room for 4 blocks
        let backend = FsBackend::new(cfg, None).expect("mount");
        let mut logger = DataLogger::new(backend).expect("logger");
        for _ in 0..4 {
            logger.write(5, &payload(1)).expect("write");
        }
        assert_eq!(logger.write(5, &payload(1)), Err(LoggerError::NoMemory));
        // Latched: later writes keep failing without touching the media
        assert_eq!(logger.write(5, &payload(1)), Err(LoggerError::NoMemory));
        assert_eq!(logger.current_block(), 4);
    }

    #[test]
    fn test_file_next_seals_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(config(dir.path(), 1), None).expect("mount");
        let mut logger = DataLogger::new(backend).expect("logger");
        logger.write(5, &payload(1)).expect("write");
        logger.file_next();
        assert_eq!(logger.current_block(), 4);
        logger.write(5, &payload(2)).expect("write");
        assert!(dir.path().join("infuse_0000000000000001_000001.bin").exists());
    }

    #[test]
    fn test_erase_removes_series() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(config(dir.path(), 1), None).expect("mount");
        let mut logger = DataLogger::new(backend).expect("logger");
        for _ in 0..6 {
            logger.write(5, &payload(1)).expect("write");
        }
        logger.erase(EraseMode::OnlyLogged, None).expect("erase");
        assert_eq!(logger.current_block(), 0);
        assert!(!dir.path().join("infuse_0000000000000001_000000.bin").exists());
        assert!(!dir.path().join("infuse_0000000000000001_000001.bin").exists());
    }

    #[test]
    fn test_claim_times_out_and_releases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(config(dir.path(), 1), None).expect("mount");

        let held = backend.claim(Duration::from_millis(10)).expect("claim");
        assert_eq!(held.len(), BLOCK_SIZE);
        assert!(backend.claim(Duration::from_millis(10)).is_err());
        drop(held);
        backend.claim(Duration::from_millis(10)).expect("reclaim");
    }

    struct CountingPower {
        resumes: Arc<AtomicU32>,
        suspends: Arc<AtomicU32>,
    }

    impl MediaPower for CountingPower {
        fn resume(&mut self) -> Result<(), LoggerError> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn suspend(&mut self) {
            self.suspends.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_media_power_cycles_per_operation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resumes = Arc::new(AtomicU32::new(0));
        let suspends = Arc::new(AtomicU32::new(0));
        let power = CountingPower {
            resumes: resumes.clone(),
            suspends: suspends.clone(),
        };
        let backend =
            FsBackend::new(config(dir.path(), 1), Some(Box::new(power))).expect("mount");
        let mut logger = DataLogger::new(backend).expect("logger");
        let after_init = resumes.load(Ordering::SeqCst);
        assert_eq!(after_init, suspends.load(Ordering::SeqCst));

        logger.write(5, &payload(1)).expect("write");
        assert_eq!(resumes.load(Ordering::SeqCst), after_init + 1);
        assert_eq!(suspends.load(Ordering::SeqCst), after_init + 1);

        // A claim keeps the media powered across operations
        let claim = logger.backend().claim(Duration::from_millis(10)).expect("claim");
        logger.write(5, &payload(2)).expect("write");
        assert_eq!(resumes.load(Ordering::SeqCst), after_init + 2);
        assert_eq!(suspends.load(Ordering::SeqCst), after_init + 1);
        drop(claim);
        assert_eq!(suspends.load(Ordering::SeqCst), after_init + 2);
    }
}
