//! Batch sources
//!
//! [`ImageFolderSource`] decodes images on a pool of worker threads:
//! - the main thread hands out jobs (lists of file paths) over a job channel
//!   shared by all workers
//! - finished batches come back on a bounded channel, so at most `prefetch`
//!   decoded batches wait in memory
//! - every epoch reshuffles the file list, so the stream never ends
//!
//! Decode failures are returned from [`BatchSource::next_batch`], they are
//! never skipped.

use crate::bundle::Batch;
use crate::error::{Error, Result};
use image::imageops::{self, FilterType};
use ndarray::{Array3, Array4, Axis};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// File extensions picked up by [`scan_images`]
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Luma weights applied to R, G, B
const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

/// Anything that yields training batches one at a time
pub trait BatchSource {
    /// Batches making up one epoch
    fn num_batches(&self) -> usize;

    /// Next batch; blocks until one is ready
    fn next_batch(&mut self) -> Result<Batch>;
}

/// Grayscale version of a [batch, height, width, 3] tensor
pub fn luma(color: &Array4<f32>) -> Array4<f32> {
    let (b, h, w, _) = color.dim();
    Array4::from_shape_fn((b, h, w, 1), |(n, y, x, _)| {
        LUMA[0] * color[[n, y, x, 0]] + LUMA[1] * color[[n, y, x, 1]] + LUMA[2] * color[[n, y, x, 2]]
    })
}

/// Fixed list of batches served round-robin
#[derive(Debug, Clone)]
pub struct InMemorySource {
    batches: Vec<Batch>,
    cursor: usize,
}

impl InMemorySource {
    pub fn new(batches: Vec<Batch>) -> Result<Self> {
        if batches.is_empty() {
            return Err(Error::Config("in-memory source needs at least one batch".into()));
        }
        Ok(Self { batches, cursor: 0 })
    }

    /// One batch per color tensor, grayscale derived with [`luma`]
    pub fn from_color(colors: Vec<Array4<f32>>) -> Result<Self> {
        let batches = colors
            .into_iter()
            .map(|color| Batch::new(luma(&color), color))
            .collect::<Result<Vec<_>>>()?;
        Self::new(batches)
    }
}

impl BatchSource for InMemorySource {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn next_batch(&mut self) -> Result<Batch> {
        let batch = self.batches[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.batches.len();
        Ok(batch)
    }
}

/// Loader settings
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    /// Images are resized to `image_size × image_size`
    pub image_size: usize,
    /// Capacity of the finished-batch channel
    pub prefetch: usize,
    /// Randomly mirror images horizontally
    pub flip: bool,
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_workers: 4,
            image_size: 128,
            prefetch: 2,
            flip: false,
            seed: 0,
        }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".into()));
        }
        if self.num_workers == 0 {
            return Err(Error::Config("need at least one loader worker".into()));
        }
        if self.image_size == 0 {
            return Err(Error::Config("image size must be positive".into()));
        }
        if self.prefetch == 0 {
            return Err(Error::Config("prefetch depth must be positive".into()));
        }
        Ok(())
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}

/// Every image file under `root`, recursively, in sorted order
pub fn scan_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::io(&dir, e))?.path();
            if path.is_dir() {
                pending.push(path);
            } else if has_image_extension(&path) {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Decode one file into ([size, size, 1] gray, [size, size, 3] color)
pub fn decode_sample(path: &Path, size: usize, flip: bool) -> Result<(Array3<f32>, Array3<f32>)> {
    let image = image::open(path).map_err(|source| Error::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    let side = u32::try_from(size).map_err(|_| Error::Config(format!("image size {} too large", size)))?;

    let mut rgb = imageops::resize(&image.to_rgb8(), side, side, FilterType::Triangle);
    if flip {
        rgb = imageops::flip_horizontal(&rgb);
    }

    let color = Array3::from_shape_fn((size, size, 3), |(y, x, c)| {
        rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    });
    let gray = Array3::from_shape_fn((size, size, 1), |(y, x, _)| {
        LUMA[0] * color[[y, x, 0]] + LUMA[1] * color[[y, x, 1]] + LUMA[2] * color[[y, x, 2]]
    });
    Ok((gray, color))
}

struct Job {
    items: Vec<(PathBuf, bool)>,
}

fn load_job(job: &Job, size: usize) -> Result<Batch> {
    let samples = job
        .items
        .iter()
        .map(|(path, flip)| decode_sample(path, size, *flip))
        .collect::<Result<Vec<_>>>()?;

    let grays: Vec<_> = samples.iter().map(|(g, _)| g.view()).collect();
    let colors: Vec<_> = samples.iter().map(|(_, c)| c.view()).collect();
    Batch::new(
        ndarray::stack(Axis(0), &grays)?,
        ndarray::stack(Axis(0), &colors)?,
    )
}

fn worker_loop(jobs: Arc<Mutex<Receiver<Job>>>, results: SyncSender<Result<Batch>>, size: usize) {
    loop {
        let job = jobs.lock().recv();
        let Ok(job) = job else {
            return;
        };
        if results.send(load_job(&job, size)).is_err() {
            return;
        }
    }
}

/// Folder of images decoded by a worker pool
pub struct ImageFolderSource {
    paths: Vec<PathBuf>,
    config: LoaderConfig,
    rng: StdRng,
    order: Vec<usize>,
    cursor: usize,
    job_tx: Option<Sender<Job>>,
    result_rx: Option<Receiver<Result<Batch>>>,
    workers: Vec<JoinHandle<()>>,
}

impl ImageFolderSource {
    /// Scan `root`, start the workers and queue the first jobs
    pub fn open(root: &Path, config: LoaderConfig) -> Result<Self> {
        config.validate()?;
        let paths = scan_images(root)?;
        if paths.is_empty() {
            return Err(Error::EmptyDataset(root.to_path_buf()));
        }
        if paths.len() < config.batch_size {
            return Err(Error::Config(format!(
                "{} images found in {}, fewer than one batch of {}",
                paths.len(),
                root.display(),
                config.batch_size
            )));
        }

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::sync_channel(config.prefetch);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(config.num_workers);
        for i in 0..config.num_workers {
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            let size = config.image_size;
            let handle = thread::Builder::new()
                .name(format!("image-loader-{}", i))
                .spawn(move || worker_loop(jobs, results, size))
                .map_err(|e| Error::io(root, e))?;
            workers.push(handle);
        }

        info!(
            root = %root.display(),
            images = paths.len(),
            batches = paths.len() / config.batch_size,
            workers = config.num_workers,
            "opened image folder"
        );

        let order = (0..paths.len()).collect();
        let mut source = Self {
            paths,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            order,
            // Forces a shuffle before the first job
            cursor: usize::MAX,
            job_tx: Some(job_tx),
            result_rx: Some(result_rx),
            workers,
        };

        for _ in 0..source.config.num_workers + source.config.prefetch {
            source.submit_job()?;
        }
        Ok(source)
    }

    pub fn num_images(&self) -> usize {
        self.paths.len()
    }

    fn submit_job(&mut self) -> Result<()> {
        let batch_size = self.config.batch_size;
        if self.cursor.saturating_add(batch_size) > self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
            debug!("reshuffled image order");
        }

        let items = self.order[self.cursor..self.cursor + batch_size]
            .iter()
            .map(|&i| {
                let flip = self.config.flip && self.rng.random_bool(0.5);
                (self.paths[i].clone(), flip)
            })
            .collect();
        self.cursor += batch_size;

        self.job_tx
            .as_ref()
            .ok_or(Error::WorkersDisconnected)?
            .send(Job { items })
            .map_err(|_| Error::WorkersDisconnected)
    }
}

impl BatchSource for ImageFolderSource {
    fn num_batches(&self) -> usize {
        self.paths.len() / self.config.batch_size
    }

    fn next_batch(&mut self) -> Result<Batch> {
        let batch = self
            .result_rx
            .as_ref()
            .ok_or(Error::WorkersDisconnected)?
            .recv()
            .map_err(|_| Error::WorkersDisconnected)?;
        self.submit_job()?;
        batch
    }
}

impl Drop for ImageFolderSource {
    fn drop(&mut self) {
        // Closing both channels lets every worker fall out of its loop
        self.job_tx.take();
        self.result_rx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};
    use ndarray::Zip;
    use tempfile::tempdir;

    // Values in [0, 1] and gray equal to luma(color)
    fn is_consistent(batch: &Batch, tolerance: f32) -> bool {
        let expected = luma(&batch.color);
        let in_range = batch.color.iter().all(|v| (0.0..=1.0).contains(v));
        let mut matches = true;
        Zip::from(&batch.gray).and(&expected).for_each(|&g, &e| {
            if (g - e).abs() > tolerance {
                matches = false;
            }
        });
        in_range && matches
    }

    fn write_png(path: &Path, size: u32, seed: u8) {
        let img = RgbImage::from_fn(size, size, |x, y| {
            Rgb([
                (x as u8).wrapping_mul(17).wrapping_add(seed),
                (y as u8).wrapping_mul(29),
                seed.wrapping_mul(3),
            ])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn test_scan_images_recurses_and_filters() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        write_png(&dir.path().join("one.png"), 4, 1);
        write_png(&dir.path().join("a/b/two.PNG"), 4, 2);
        std::fs::write(dir.path().join("a/notes.txt"), "not an image").unwrap();

        let found = scan_images(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| has_image_extension(p)));
    }

    #[test]
    fn test_decode_sample_resizes_and_flips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img.png");
        write_png(&path, 8, 5);

        let (gray, color) = decode_sample(&path, 8, false).unwrap();
        let (_, flipped) = decode_sample(&path, 8, true).unwrap();
        assert_eq!(gray.dim(), (8, 8, 1));
        assert_eq!(color.dim(), (8, 8, 3));

        for c in 0..3 {
            assert_relative_eq!(flipped[[2, 0, c]], color[[2, 7, c]]);
        }
        let expected = LUMA[0] * color[[3, 4, 0]] + LUMA[1] * color[[3, 4, 1]] + LUMA[2] * color[[3, 4, 2]];
        assert_relative_eq!(gray[[3, 4, 0]], expected);

        let (small, _) = decode_sample(&path, 4, false).unwrap();
        assert_eq!(small.dim(), (4, 4, 1));
    }

    #[test]
    fn test_worker_pool_delivers_batches_across_epochs() {
        let dir = tempdir().unwrap();
        for i in 0..5u8 {
            write_png(&dir.path().join(format!("{}.png", i)), 12, i * 40);
        }

        let config = LoaderConfig {
            batch_size: 2,
            num_workers: 3,
            image_size: 8,
            prefetch: 2,
            flip: true,
            seed: 7,
        };
        let mut source = ImageFolderSource::open(dir.path(), config).unwrap();
        assert_eq!(source.num_images(), 5);
        assert_eq!(source.num_batches(), 2);

        for _ in 0..7 {
            let batch = source.next_batch().unwrap();
            assert_eq!(batch.gray.dim(), (2, 8, 8, 1));
            assert_eq!(batch.color.dim(), (2, 8, 8, 3));
            assert!(is_consistent(&batch, 1e-5));
        }
    }

    #[test]
    fn test_decode_error_surfaces() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"definitely not a png").unwrap();

        let config = LoaderConfig {
            num_workers: 1,
            image_size: 4,
            ..LoaderConfig::default()
        };
        let mut source = ImageFolderSource::open(dir.path(), config).unwrap();
        assert!(matches!(source.next_batch(), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_open_rejects_empty_and_small_folders() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ImageFolderSource::open(dir.path(), LoaderConfig::default()),
            Err(Error::EmptyDataset(_))
        ));

        write_png(&dir.path().join("only.png"), 4, 0);
        let config = LoaderConfig {
            batch_size: 2,
            ..LoaderConfig::default()
        };
        assert!(matches!(
            ImageFolderSource::open(dir.path(), config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_in_memory_source_cycles() {
        let colors = vec![
            Array4::from_elem((1, 2, 2, 3), 0.25f32),
            Array4::from_elem((1, 2, 2, 3), 0.75f32),
        ];
        let mut source = InMemorySource::from_color(colors).unwrap();
        assert_eq!(source.num_batches(), 2);

        let first = source.next_batch().unwrap();
        let _ = source.next_batch().unwrap();
        let third = source.next_batch().unwrap();
        assert_eq!(first.color, third.color);
        assert_relative_eq!(first.gray[[0, 0, 0, 0]], 0.25, epsilon = 1e-6);
        assert!(InMemorySource::new(Vec::new()).is_err());
    }
}
