use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::foundation::error::{BackdropError, BackdropResult};

static NEXT_SPILL_FILE: AtomicU64 = AtomicU64::new(0);

/// Location of a spilled block body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SpillSlot {
    offset: u64,
    len: usize,
}

impl SpillSlot {
    pub(crate) fn len(self) -> usize {
        self.len
    }
}

/// Page-scoped scratch file that evicted block bodies are paged into.
///
/// Freed slots are reused for later writes of exactly the same length; block bodies share one
/// size per page so this keeps the file from growing across bands.
pub(crate) struct SpillFile {
    path: PathBuf,
    file: File,
    end: u64,
    free: BTreeMap<usize, Vec<u64>>,
    closed: bool,
}

impl SpillFile {
    pub(crate) fn open(dir: &Path) -> BackdropResult<Self> {
        std::fs::create_dir_all(dir)?;
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = dir.join(format!(
            "backdrop_spill_{}_{}_{}.bin",
            std::process::id(),
            nanos,
            NEXT_SPILL_FILE.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        tracing::debug!(path = %path.display(), "opened backdrop spill file");
        Ok(Self {
            path,
            file,
            end: 0,
            free: BTreeMap::new(),
            closed: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) -> BackdropResult<SpillSlot> {
        let reused = self.free.get_mut(&bytes.len()).and_then(Vec::pop);
        let offset = reused.unwrap_or(self.end);
        self.file.seek(SeekFrom::Start(offset))?;
        if let Err(e) = self.file.write_all(bytes) {
            if let Some(off) = reused {
                self.free.entry(bytes.len()).or_default().push(off);
            }
            return Err(e.into());
        }
        if reused.is_none() {
            self.end += bytes.len() as u64;
        }
        Ok(SpillSlot {
            offset,
            len: bytes.len(),
        })
    }

    pub(crate) fn read(&mut self, slot: SpillSlot, buf: &mut [u8]) -> BackdropResult<()> {
        if buf.len() < slot.len {
            return Err(BackdropError::validation(format!(
                "spill reload buffer holds {} bytes, block needs {}",
                buf.len(),
                slot.len
            )));
        }
        self.file.seek(SeekFrom::Start(slot.offset))?;
        self.file.read_exact(&mut buf[..slot.len])?;
        Ok(())
    }

    pub(crate) fn free(&mut self, slot: SpillSlot) {
        self.free.entry(slot.len).or_default().push(slot.offset);
    }

    pub(crate) fn len_on_disk(&self) -> u64 {
        self.end
    }

    pub(crate) fn close(mut self) -> BackdropResult<()> {
        self.closed = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if !self.closed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/spill/file.rs"]
mod tests;
