//! Data pipeline: dataset loading and random batch sampling.
//!
//! * **[`CifarLoader`]** — CIFAR-10 binary batches, memory-mapped via `memmap2`.
//! * **[`ShakespeareLoader`]** — character-level text with a 90/10 split.
//! * **[`get_data_loader`]** — pick the loader that matches a config.
//!
//! Both loaders draw batches uniformly at random from a seeded `StdRng`, so
//! two runs with the same seed see the same batches.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{DataKind, ExperimentConfig};

// ── Batch & loader trait ────────────────────────────────────────────────────

/// One mini-batch already placed on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(B, 3, 32, 32)` f32 images or `(B, T)` u32 token ids.
    pub inputs: Tensor,
    /// `(B,)` class ids or `(B, T)` next-token ids, both u32.
    pub targets: Tensor,
}

/// Common interface for the datasets a run can train on.
pub trait DataLoader {
    /// Random batch from the training split.
    fn train_batch(&mut self) -> Result<Batch>;
    /// Random batch from the validation split.
    fn val_batch(&mut self) -> Result<Batch>;
    /// Number of classes (images) or vocabulary size (text).
    fn output_dim(&self) -> usize;
}

// ── CIFAR-10 ────────────────────────────────────────────────────────────────

/// Image side length.
pub const CIFAR_SIDE: usize = 32;
/// Pixels per image across all three channels.
pub const CIFAR_PIXELS: usize = 3 * CIFAR_SIDE * CIFAR_SIDE;
/// One record: label byte followed by channel-major pixels.
pub const CIFAR_RECORD_LEN: usize = 1 + CIFAR_PIXELS;
const CIFAR_CLASSES: usize = 10;
const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const CIFAR_STD: [f32; 3] = [0.2470, 0.2435, 0.2616];
const CIFAR_TRAIN_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];
const CIFAR_TEST_FILE: &str = "test_batch.bin";

/// A memory-mapped CIFAR binary file.
struct CifarFile {
    mmap: Mmap,
    records: usize,
}

impl CifarFile {
    fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("open CIFAR file {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap CIFAR file")? };
        if mmap.len() % CIFAR_RECORD_LEN != 0 {
            anyhow::bail!(
                "{}: length {} is not a multiple of the {}-byte record size",
                path.display(),
                mmap.len(),
                CIFAR_RECORD_LEN
            );
        }
        let records = mmap.len() / CIFAR_RECORD_LEN;
        if records == 0 {
            anyhow::bail!("{}: no records", path.display());
        }
        Ok(Self { mmap, records })
    }

    #[inline]
    fn record(&self, i: usize) -> &[u8] {
        let start = i * CIFAR_RECORD_LEN;
        &self.mmap[start..start + CIFAR_RECORD_LEN]
    }
}

/// One split (train or test) spread over several files.
struct CifarSplit {
    files: Vec<CifarFile>,
    /// Cumulative record counts, for mapping a flat index to a file.
    offsets: Vec<usize>,
}

impl CifarSplit {
    fn new(files: Vec<CifarFile>) -> Self {
        let mut offsets = Vec::with_capacity(files.len());
        let mut total = 0;
        for f in &files {
            offsets.push(total);
            total += f.records;
        }
        Self { files, offsets }
    }

    fn len(&self) -> usize {
        self.files.iter().map(|f| f.records).sum()
    }

    fn record(&self, index: usize) -> &[u8] {
        let file = match self.offsets.binary_search(&index) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        self.files[file].record(index - self.offsets[file])
    }

    fn sample(&self, rng: &mut StdRng, batch_size: usize, device: &Device) -> Result<Batch> {
        let n = self.len();
        let mut pixels = Vec::with_capacity(batch_size * CIFAR_PIXELS);
        let mut labels = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let rec = self.record(rng.gen_range(0..n));
            labels.push(rec[0] as u32);
            for (c, channel) in rec[1..].chunks_exact(CIFAR_SIDE * CIFAR_SIDE).enumerate() {
                pixels.extend(
                    channel
                        .iter()
                        .map(|&p| (p as f32 / 255.0 - CIFAR_MEAN[c]) / CIFAR_STD[c]),
                );
            }
        }
        let inputs = Tensor::from_vec(
            pixels,
            (batch_size, 3, CIFAR_SIDE, CIFAR_SIDE),
            device,
        )?;
        let targets = Tensor::from_vec(labels, (batch_size,), device)?;
        Ok(Batch { inputs, targets })
    }
}

/// CIFAR-10 loader over the official binary distribution.
///
/// Expects `data_batch_{1..5}.bin` (any non-empty subset) and `test_batch.bin`
/// in one directory.
pub struct CifarLoader {
    train: CifarSplit,
    val: CifarSplit,
    batch_size: usize,
    train_rng: StdRng,
    val_rng: StdRng,
    device: Device,
}

impl CifarLoader {
    pub fn open(dir: &Path, batch_size: usize, seed: u64, device: &Device) -> Result<Self> {
        let mut train_files = Vec::new();
        for name in CIFAR_TRAIN_FILES {
            let p = dir.join(name);
            if p.is_file() {
                train_files.push(CifarFile::open(&p)?);
            }
        }
        if train_files.is_empty() {
            anyhow::bail!("no CIFAR training batches found in {}", dir.display());
        }
        let val = CifarFile::open(&dir.join(CIFAR_TEST_FILE))?;
        let train = CifarSplit::new(train_files);
        tracing::info!(
            train_images = train.len(),
            val_images = val.records,
            "Loaded CIFAR-10"
        );
        Ok(Self {
            train,
            val: CifarSplit::new(vec![val]),
            batch_size,
            train_rng: StdRng::seed_from_u64(seed),
            val_rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            device: device.clone(),
        })
    }

    pub fn num_train(&self) -> usize {
        self.train.len()
    }

    pub fn num_val(&self) -> usize {
        self.val.len()
    }
}

impl DataLoader for CifarLoader {
    fn train_batch(&mut self) -> Result<Batch> {
        self.train
            .sample(&mut self.train_rng, self.batch_size, &self.device)
    }

    fn val_batch(&mut self) -> Result<Batch> {
        self.val.sample(&mut self.val_rng, self.batch_size, &self.device)
    }

    fn output_dim(&self) -> usize {
        CIFAR_CLASSES
    }
}

// ── Shakespeare (character level) ──────────────────────────────────────────

const SHAKESPEARE_FILE: &str = "input.txt";
const TRAIN_FRACTION: f64 = 0.9;

/// Character-level language-modelling loader.
pub struct ShakespeareLoader {
    vocab: Vec<char>,
    index: HashMap<char, u32>,
    train: Vec<u32>,
    val: Vec<u32>,
    seq_len: usize,
    batch_size: usize,
    train_rng: StdRng,
    val_rng: StdRng,
    device: Device,
}

impl ShakespeareLoader {
    /// Load `input.txt` from `dir` (or `dir` itself when it is a file).
    pub fn open(
        dir: &Path,
        seq_len: usize,
        batch_size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let path: PathBuf = if dir.is_file() {
            dir.to_path_buf()
        } else {
            dir.join(SHAKESPEARE_FILE)
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read text corpus {}", path.display()))?;
        Self::from_text(&text, seq_len, batch_size, seed, device)
    }

    pub fn from_text(
        text: &str,
        seq_len: usize,
        batch_size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut vocab: Vec<char> = text.chars().collect();
        vocab.sort_unstable();
        vocab.dedup();
        let index: HashMap<char, u32> = vocab
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();

        let tokens: Vec<u32> = text.chars().map(|c| index[&c]).collect();
        let split = (tokens.len() as f64 * TRAIN_FRACTION) as usize;
        let (train, val) = tokens.split_at(split);

        let need = seq_len + 1;
        anyhow::ensure!(
            train.len() >= need,
            "training split has {} tokens, need at least {need}",
            train.len()
        );
        anyhow::ensure!(
            val.len() >= need,
            "validation split has {} tokens, need at least {need}",
            val.len()
        );

        tracing::info!(
            vocab_size = vocab.len(),
            train_tokens = train.len(),
            val_tokens = val.len(),
            "Loaded character corpus"
        );

        Ok(Self {
            vocab,
            index,
            train: train.to_vec(),
            val: val.to_vec(),
            seq_len,
            batch_size,
            train_rng: StdRng::seed_from_u64(seed),
            val_rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            device: device.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Encode text; characters outside the vocabulary are an error.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|c| {
                self.index
                    .get(&c)
                    .copied()
                    .with_context(|| format!("character {c:?} not in vocabulary"))
            })
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|&i| self.vocab.get(i as usize))
            .collect()
    }

    fn sample(
        tokens: &[u32],
        rng: &mut StdRng,
        seq_len: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Batch> {
        let max_start = tokens.len() - (seq_len + 1);
        let mut inputs = Vec::with_capacity(batch_size * seq_len);
        let mut targets = Vec::with_capacity(batch_size * seq_len);
        for _ in 0..batch_size {
            let start = rng.gen_range(0..=max_start);
            let window = &tokens[start..start + seq_len + 1];
            inputs.extend_from_slice(&window[..seq_len]);
            targets.extend_from_slice(&window[1..]);
        }
        let inputs = Tensor::from_vec(inputs, (batch_size, seq_len), device)?;
        let targets = Tensor::from_vec(targets, (batch_size, seq_len), device)?;
        Ok(Batch { inputs, targets })
    }
}

impl DataLoader for ShakespeareLoader {
    fn train_batch(&mut self) -> Result<Batch> {
        Self::sample(
            &self.train,
            &mut self.train_rng,
            self.seq_len,
            self.batch_size,
            &self.device,
        )
    }

    fn val_batch(&mut self) -> Result<Batch> {
        Self::sample(
            &self.val,
            &mut self.val_rng,
            self.seq_len,
            self.batch_size,
            &self.device,
        )
    }

    fn output_dim(&self) -> usize {
        self.vocab_size()
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────────

/// Either loader, both implementing [`DataLoader`].
pub enum AnyDataLoader {
    Cifar(CifarLoader),
    Shakespeare(ShakespeareLoader),
}

impl DataLoader for AnyDataLoader {
    fn train_batch(&mut self) -> Result<Batch> {
        match self {
            AnyDataLoader::Cifar(d) => d.train_batch(),
            AnyDataLoader::Shakespeare(d) => d.train_batch(),
        }
    }

    fn val_batch(&mut self) -> Result<Batch> {
        match self {
            AnyDataLoader::Cifar(d) => d.val_batch(),
            AnyDataLoader::Shakespeare(d) => d.val_batch(),
        }
    }

    fn output_dim(&self) -> usize {
        match self {
            AnyDataLoader::Cifar(d) => d.output_dim(),
            AnyDataLoader::Shakespeare(d) => d.output_dim(),
        }
    }
}

/// Build the loader for `config.data`.
///
/// The caller should copy [`DataLoader::output_dim`] back into the config
/// (`vocab_size` / `num_classes`) before building the model.
pub fn get_data_loader(config: &ExperimentConfig, device: &Device) -> Result<AnyDataLoader> {
    match config.data {
        DataKind::Cifar => Ok(AnyDataLoader::Cifar(CifarLoader::open(
            &config.data_dir,
            config.batch_size,
            config.seed,
            device,
        )?)),
        DataKind::Shakespeare => Ok(AnyDataLoader::Shakespeare(ShakespeareLoader::open(
            &config.data_dir,
            config.seq_len,
            config.batch_size,
            config.seed,
            device,
        )?)),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lipschitz-data-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write `n` records whose label is `i % 10` and every pixel is `i`.
    fn write_cifar(path: &Path, n: usize) {
        let mut bytes = Vec::with_capacity(n * CIFAR_RECORD_LEN);
        for i in 0..n {
            bytes.push((i % 10) as u8);
            bytes.extend(std::iter::repeat(i as u8).take(CIFAR_PIXELS));
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn cifar_batches_have_expected_shapes() {
        let dir = temp_dir("cifar");
        write_cifar(&dir.join("data_batch_1.bin"), 4);
        write_cifar(&dir.join("data_batch_2.bin"), 3);
        write_cifar(&dir.join("test_batch.bin"), 2);

        let mut loader = CifarLoader::open(&dir, 5, 7, &Device::Cpu).unwrap();
        assert_eq!(loader.num_train(), 7);
        assert_eq!(loader.num_val(), 2);
        assert_eq!(loader.output_dim(), 10);

        let batch = loader.train_batch().unwrap();
        assert_eq!(batch.inputs.dims(), &[5, 3, 32, 32]);
        assert_eq!(batch.targets.dims(), &[5]);
        let labels = batch.targets.to_vec1::<u32>().unwrap();
        assert!(labels.iter().all(|&l| l < 10));

        let val = loader.val_batch().unwrap();
        let labels = val.targets.to_vec1::<u32>().unwrap();
        assert!(labels.iter().all(|&l| l < 2));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cifar_pixels_are_normalised_per_channel() {
        let dir = temp_dir("cifar-norm");
        write_cifar(&dir.join("data_batch_1.bin"), 1);
        write_cifar(&dir.join("test_batch.bin"), 1);

        let mut loader = CifarLoader::open(&dir, 1, 0, &Device::Cpu).unwrap();
        // Single record with all pixels 0 → (0 - mean) / std per channel.
        let x = loader.train_batch().unwrap().inputs;
        let v = x.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected_r = -CIFAR_MEAN[0] / CIFAR_STD[0];
        let expected_b = -CIFAR_MEAN[2] / CIFAR_STD[2];
        assert!((v[0] - expected_r).abs() < 1e-5);
        assert!((v[CIFAR_PIXELS - 1] - expected_b).abs() < 1e-5);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cifar_rejects_truncated_file() {
        let dir = temp_dir("cifar-bad");
        std::fs::write(dir.join("data_batch_1.bin"), vec![0u8; CIFAR_RECORD_LEN + 3]).unwrap();
        write_cifar(&dir.join("test_batch.bin"), 1);
        assert!(CifarLoader::open(&dir, 1, 0, &Device::Cpu).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cifar_requires_training_batches() {
        let dir = temp_dir("cifar-empty");
        write_cifar(&dir.join("test_batch.bin"), 1);
        assert!(CifarLoader::open(&dir, 1, 0, &Device::Cpu).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn shakespeare_targets_are_shifted_inputs() {
        let text = "abcdefghij".repeat(20);
        let mut loader = ShakespeareLoader::from_text(&text, 8, 4, 3, &Device::Cpu).unwrap();
        assert_eq!(loader.vocab_size(), 10);

        let batch = loader.train_batch().unwrap();
        assert_eq!(batch.inputs.dims(), &[4, 8]);
        let inputs = batch.inputs.to_vec2::<u32>().unwrap();
        let targets = batch.targets.to_vec2::<u32>().unwrap();
        for (x, y) in inputs.iter().zip(&targets) {
            assert_eq!(&x[1..], &y[..7]);
            // Consecutive characters in a cycle of ten.
            assert_eq!((x[7] + 1) % 10, y[7]);
        }
    }

    #[test]
    fn shakespeare_encode_decode() {
        let loader =
            ShakespeareLoader::from_text(&"to be or not ".repeat(10), 4, 1, 0, &Device::Cpu)
                .unwrap();
        let ids = loader.encode("not to be").unwrap();
        assert_eq!(loader.decode(&ids), "not to be");
        assert!(loader.encode("xyz").is_err());
    }

    #[test]
    fn shakespeare_short_corpus_is_an_error() {
        let err = ShakespeareLoader::from_text("short", 16, 1, 0, &Device::Cpu);
        assert!(err.is_err());
    }

    #[test]
    fn same_seed_same_batches() {
        let text = "the quick brown fox jumps over the lazy dog ".repeat(10);
        let mut a = ShakespeareLoader::from_text(&text, 6, 2, 42, &Device::Cpu).unwrap();
        let mut b = ShakespeareLoader::from_text(&text, 6, 2, 42, &Device::Cpu).unwrap();
        let xa = a.train_batch().unwrap().inputs.to_vec2::<u32>().unwrap();
        let xb = b.train_batch().unwrap().inputs.to_vec2::<u32>().unwrap();
        assert_eq!(xa, xb);
    }

    #[test]
    fn dispatch_by_config() {
        let dir = temp_dir("dispatch");
        std::fs::write(dir.join("input.txt"), "hello world ".repeat(50)).unwrap();
        let mut config = ExperimentConfig::shakespeare_gpt();
        config.data_dir = dir.clone();
        config.seq_len = 8;
        config.batch_size = 2;
        let mut loader = get_data_loader(&config, &Device::Cpu).unwrap();
        assert_eq!(loader.output_dim(), 8); // " dehlorw"
        assert_eq!(loader.val_batch().unwrap().inputs.dims(), &[2, 8]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
