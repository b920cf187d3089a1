//! Background frame persistence with a backlog ceiling.

use crossbeam_channel::{unbounded, Sender};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Encodes and writes one image. The format follows the path extension.
pub type ImageWriter = Arc<dyn Fn(&Path, &RgbImage) -> Result<(), image::ImageError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{pending} writes pending (limit {limit}); save skipped")]
    Backlog { pending: usize, limit: usize },
    #[error("persistence pool is shut down")]
    Closed,
    #[error("failed to spawn persistence worker: {0}")]
    Spawn(std::io::Error),
}

struct WriteJob {
    path: PathBuf,
    image: RgbImage,
}

/// Fixed pool of writer threads fed by an unbounded channel.
///
/// Submission never blocks; the caller is expected to respect the backlog
/// check instead. Dropping the pool drains outstanding writes and joins
/// the workers.
pub struct FramePersister {
    dir: PathBuf,
    tx: Option<Sender<WriteJob>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl FramePersister {
    pub fn new(dir: &Path, workers: usize, max_pending: usize) -> Result<Self, PersistError> {
        Self::with_writer(dir, workers, max_pending, Arc::new(|path: &Path, image: &RgbImage| image.save(path)))
    }

    pub fn with_writer(
        dir: &Path,
        workers: usize,
        max_pending: usize,
        writer: ImageWriter,
    ) -> Result<Self, PersistError> {
        std::fs::create_dir_all(dir).map_err(|source| PersistError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let (tx, rx) = unbounded::<WriteJob>();
        let pending = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            let writer = Arc::clone(&writer);
            let handle = std::thread::Builder::new()
                .name(format!("persist-{i}"))
                .spawn(move || {
                    for job in rx {
                        if let Err(e) = writer(&job.path, &job.image) {
                            tracing::warn!(path = %job.path.display(), error = %e, "frame write failed");
                        }
                        pending.fetch_sub(1, Ordering::AcqRel);
                    }
                })
                .map_err(PersistError::Spawn)?;
            handles.push(handle);
        }
        tracing::info!(dir = %dir.display(), workers = handles.len(), max_pending, "frame persistence ready");

        Ok(Self {
            dir: dir.to_path_buf(),
            tx: Some(tx),
            workers: handles,
            pending,
            max_pending,
        })
    }

    /// Queue one image for writing as `{dir}/{name}`.
    ///
    /// Fails with [`PersistError::Backlog`] when more than `max_pending`
    /// writes are already outstanding.
    pub fn try_submit(&self, name: &str, image: RgbImage) -> Result<(), PersistError> {
        self.check_backlog()?;
        self.enqueue(name, image)
    }

    /// Queue the RGB and IR views of one loop iteration.
    ///
    /// The backlog check covers the pair, so either both are queued or neither.
    pub fn submit_pair(&self, iteration: u64, rgb: RgbImage, ir: RgbImage) -> Result<(), PersistError> {
        self.check_backlog()?;
        self.enqueue(&format!("{iteration:05}-rgb.jpg"), rgb)?;
        self.enqueue(&format!("{iteration:05}-ir.png"), ir)
    }

    /// Writes submitted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn check_backlog(&self) -> Result<(), PersistError> {
        let pending = self.pending();
        if pending > self.max_pending {
            return Err(PersistError::Backlog {
                pending,
                limit: self.max_pending,
            });
        }
        Ok(())
    }

    fn enqueue(&self, name: &str, image: RgbImage) -> Result<(), PersistError> {
        let tx = self.tx.as_ref().ok_or(PersistError::Closed)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        let job = WriteJob {
            path: self.dir.join(name),
            image,
        };
        if tx.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(PersistError::Closed);
        }
        Ok(())
    }
}

impl Drop for FramePersister {
    fn drop(&mut self) {
        // Closing the channel lets each worker finish its queue and exit.
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("persistence worker panicked");
            }
        }
        tracing::debug!(dir = %self.dir.display(), "frame persistence drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, Receiver};
    use std::time::Duration;

    fn gated_writer(gate: Receiver<()>) -> ImageWriter {
        Arc::new(move |_path: &Path, _image: &RgbImage| {
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(())
        })
    }

    #[test]
    fn test_pair_written_with_iteration_names() {
        let dir = tempfile::tempdir().unwrap();
        let frames = dir.path().join("frames");
        {
            let persister = FramePersister::new(&frames, 2, 20).unwrap();
            persister
                .submit_pair(7, RgbImage::new(8, 6), RgbImage::new(4, 4))
                .unwrap();
        }
        let rgb = image::open(frames.join("00007-rgb.jpg")).unwrap();
        assert_eq!((rgb.width(), rgb.height()), (8, 6));
        let ir = image::open(frames.join("00007-ir.png")).unwrap();
        assert_eq!((ir.width(), ir.height()), (4, 4));
    }

    #[test]
    fn test_backlog_skips_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (release, gate) = bounded::<()>(0);
        let persister = FramePersister::with_writer(dir.path(), 1, 3, gated_writer(gate)).unwrap();

        // Two pairs put 4 writes in flight, which is over the limit of 3.
        persister.submit_pair(0, RgbImage::new(1, 1), RgbImage::new(1, 1)).unwrap();
        persister.submit_pair(1, RgbImage::new(1, 1), RgbImage::new(1, 1)).unwrap();
        assert_eq!(persister.pending(), 4);

        let err = persister
            .submit_pair(2, RgbImage::new(1, 1), RgbImage::new(1, 1))
            .unwrap_err();
        assert!(matches!(err, PersistError::Backlog { pending: 4, limit: 3 }));
        assert!(persister.try_submit("x.png", RgbImage::new(1, 1)).is_err());
        assert_eq!(persister.pending(), 4);

        for _ in 0..4 {
            release.send(()).unwrap();
        }
        drop(persister);
    }

    #[test]
    fn test_drop_drains_outstanding_writes() {
        let dir = tempfile::tempdir().unwrap();
        let written = Arc::new(AtomicUsize::new(0));
        let writer: ImageWriter = {
            let written = Arc::clone(&written);
            Arc::new(move |_path: &Path, _image: &RgbImage| {
                std::thread::sleep(Duration::from_millis(10));
                written.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let persister = FramePersister::with_writer(dir.path(), 2, 100, writer).unwrap();
        for i in 0..6 {
            persister.try_submit(&format!("{i}.png"), RgbImage::new(1, 1)).unwrap();
        }
        drop(persister);
        assert_eq!(written.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let persister = FramePersister::new(dir.path(), 1, 10).unwrap();
        // Unknown extension: the encoder rejects it, the worker logs and moves on.
        persister.try_submit("frame.unknownext", RgbImage::new(2, 2)).unwrap();
        persister.try_submit("frame.png", RgbImage::new(2, 2)).unwrap();
        drop(persister);
        assert!(dir.path().join("frame.png").exists());
        assert!(!dir.path().join("frame.unknownext").exists());
    }
}
