use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use image::{imageops::FilterType, DynamicImage, ImageReader, RgbImage};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

pub const CHANNEL_COUNT: usize = 3;

const CIFAR_SIDE: usize = 32;
const CIFAR_RECORD_LEN: usize = 1 + CHANNEL_COUNT * CIFAR_SIDE * CIFAR_SIDE;
const CIFAR_BATCH_FILES: [&str; 5] = [
    "data_batch_1.bin",
    "data_batch_2.bin",
    "data_batch_3.bin",
    "data_batch_4.bin",
    "data_batch_5.bin",
];

pub const CIFAR_CLASSES: [&str; 10] = [
    "airplane",
    "automobile",
    "bird",
    "cat",
    "deer",
    "dog",
    "frog",
    "horse",
    "ship",
    "truck",
];

/// One labeled image, stored channel-major at the configured side length.
#[derive(Debug, Clone)]
pub struct ClassImage {
    pub pixels: Vec<u8>,
    pub label: u32,
}

pub struct ImageDataset {
    dataset: InMemDataset<ClassImage>,
    pub image_size: usize,
}

impl Dataset<ClassImage> for ImageDataset {
    fn get(&self, index: usize) -> Option<ClassImage> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl ImageDataset {
    pub fn new(items: Vec<ClassImage>, image_size: usize) -> Self {
        Self {
            dataset: InMemDataset::new(items),
            image_size,
        }
    }
}

/// Load a folder-per-class image tree: every immediate subdirectory of the
/// root is one class, sorted by name for a stable label order. Files that do
/// not decode as images are skipped.
pub fn load_image_folder(root: &Path, image_size: usize) -> Result<(Vec<String>, Vec<ClassImage>)> {
    let mut classes: Vec<String> = fs::read_dir(root)
        .with_context(|| format!("cannot read dataset root {}", root.display()))?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    classes.sort();

    if classes.len() < 2 {
        bail!(
            "dataset root {} must contain one directory per class (found {})",
            root.display(),
            classes.len()
        );
    }

    let mut entries: Vec<(u32, PathBuf)> = Vec::new();
    for (id, name) in classes.iter().enumerate() {
        let dir = root.join(name);
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("cannot read class directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() {
                entries.push((id as u32, path));
            }
        }
    }

    let items = entries
        .par_iter()
        .filter_map(|(label, path)| {
            let image = ImageReader::open(path).ok()?.decode().ok()?;
            Some(ClassImage {
                pixels: to_chw(&image, image_size),
                label: *label,
            })
        })
        .collect();

    Ok((classes, items))
}

/// Load the five CIFAR-10 binary training batches from the dataset root.
pub fn load_cifar10(root: &Path, image_size: usize) -> Result<Vec<ClassImage>> {
    let mut items = Vec::new();
    for name in CIFAR_BATCH_FILES {
        let path = root.join(name);
        let bytes = fs::read(&path)
            .with_context(|| format!("cannot read CIFAR-10 batch {}", path.display()))?;
        items.extend(parse_cifar_batch(&bytes, image_size)?);
    }
    Ok(items)
}

/// Parse one binary batch: records of a label byte followed by 3072 bytes of
/// plane-major RGB for a 32x32 image.
fn parse_cifar_batch(bytes: &[u8], image_size: usize) -> Result<Vec<ClassImage>> {
    if bytes.is_empty() || bytes.len() % CIFAR_RECORD_LEN != 0 {
        bail!(
            "CIFAR-10 batch length {} is not a multiple of the {}-byte record",
            bytes.len(),
            CIFAR_RECORD_LEN
        );
    }

    bytes
        .chunks_exact(CIFAR_RECORD_LEN)
        .map(|record| {
            let label = record[0];
            if label as usize >= CIFAR_CLASSES.len() {
                bail!("CIFAR-10 label {label} out of range");
            }

            let planes = &record[1..];
            let pixels = if image_size == CIFAR_SIDE {
                planes.to_vec()
            } else {
                resize_cifar(planes, image_size)?
            };

            Ok(ClassImage {
                pixels,
                label: label as u32,
            })
        })
        .collect()
}

fn resize_cifar(planes: &[u8], image_size: usize) -> Result<Vec<u8>> {
    let plane = CIFAR_SIDE * CIFAR_SIDE;
    let mut interleaved = vec![0u8; CHANNEL_COUNT * plane];
    for i in 0..plane {
        interleaved[CHANNEL_COUNT * i] = planes[i];
        interleaved[CHANNEL_COUNT * i + 1] = planes[plane + i];
        interleaved[CHANNEL_COUNT * i + 2] = planes[2 * plane + i];
    }

    let image = RgbImage::from_raw(CIFAR_SIDE as u32, CIFAR_SIDE as u32, interleaved)
        .context("CIFAR-10 record does not hold a full 32x32 image")?;

    Ok(to_chw(&DynamicImage::ImageRgb8(image), image_size))
}

fn to_chw(image: &DynamicImage, side: usize) -> Vec<u8> {
    let resized = image
        .resize_exact(side as u32, side as u32, FilterType::Triangle)
        .to_rgb8();

    let plane = side * side;
    let mut pixels = vec![0u8; CHANNEL_COUNT * plane];
    for (i, pixel) in resized.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        pixels[i] = r;
        pixels[plane + i] = g;
        pixels[2 * plane + i] = b;
    }

    pixels
}

/// Shuffle once at load time, then carve off the validation fraction.
pub fn shuffle_split(
    mut items: Vec<ClassImage>,
    val_split: f64,
    seed: u64,
) -> (Vec<ClassImage>, Vec<ClassImage>) {
    items.shuffle(&mut StdRng::seed_from_u64(seed));

    let val_count = (items.len() as f64 * val_split) as usize;
    let valid = items.split_off(items.len() - val_count);

    (items, valid)
}

#[derive(Clone, Debug)]
pub struct ClassBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct ClassBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ClassBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<ClassImage, ClassBatch<B>> for ClassBatcher<B> {
    fn batch(&self, items: Vec<ClassImage>) -> ClassBatch<B> {
        let side = self.image_size;

        let images = items
            .iter()
            .map(|item| {
                TensorData::new(item.pixels.clone(), [1, CHANNEL_COUNT, side, side])
                    .convert::<B::FloatElem>()
            })
            .map(|data| Tensor::<B, 4>::from_data(data, &self.device))
            .map(|tensor| tensor / 255.)
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    [(item.label as i64).elem::<B::IntElem>()],
                    &self.device,
                )
            })
            .collect();

        let images = Tensor::cat(images, 0).to_device(&self.device);
        let targets = Tensor::cat(targets, 0).to_device(&self.device);

        ClassBatch { images, targets }
    }
}
