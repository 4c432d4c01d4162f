use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};

pub const CHECKPOINT_EXTENSION: &str = "mpk";

/// Names and writes model snapshots under the save folder.
///
/// The rolling `{dataset}_{basenet}{depth}.mpk` file is rewritten every
/// epoch; numbered `{stem}_{epoch}.mpk` snapshots are kept at the configured
/// interval.
pub struct CheckpointManager {
    save_dir: PathBuf,
    stem: String,
}

impl CheckpointManager {
    pub fn new(save_dir: &Path, dataset: &str, basenet: &str, depth: usize) -> Self {
        Self {
            save_dir: save_dir.to_path_buf(),
            stem: format!("{dataset}_{basenet}{depth}"),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.save_dir.join(&self.stem)
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.save_dir.join(format!("{}_{}", self.stem, epoch))
    }

    /// Resolve a resume argument against the save folder, rejecting
    /// extensions the recorder cannot read.
    pub fn resolve_resume(&self, resume: &str) -> Result<PathBuf> {
        let path = Path::new(resume);
        validate_extension(path)?;

        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.save_dir.join(path))
        }
    }

    pub fn save<B: Backend, M: Module<B>>(&self, model: M, path: PathBuf) -> Result<()> {
        model
            .save_file(&path, &CompactRecorder::new())
            .map_err(|e| anyhow::anyhow!("failed to save checkpoint {}: {e:?}", path.display()))
    }

    pub fn load<B: Backend, M: Module<B>>(
        &self,
        model: M,
        path: &Path,
        device: &B::Device,
    ) -> Result<M> {
        model
            .load_file(path, &CompactRecorder::new(), device)
            .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e:?}", path.display()))
    }
}

pub fn validate_extension(path: &Path) -> Result<()> {
    if let Some(ext) = path.extension() {
        if ext != CHECKPOINT_EXTENSION {
            bail!(
                "unsupported checkpoint extension {:?} for {}, only .{} files are supported",
                ext,
                path.display(),
                CHECKPOINT_EXTENSION
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Path::new("checkpoints"), "pets", "vgg", 16)
    }

    #[test]
    fn filenames_encode_dataset_model_and_depth() {
        let manager = manager();
        assert_eq!(manager.latest_path(), Path::new("checkpoints/pets_vgg16"));
        assert_eq!(
            manager.epoch_path(5),
            Path::new("checkpoints/pets_vgg16_5")
        );
    }

    #[test]
    fn resume_resolves_relative_to_save_folder() {
        let path = manager().resolve_resume("pets_vgg16_10.mpk").unwrap();
        assert_eq!(path, Path::new("checkpoints/pets_vgg16_10.mpk"));
    }

    #[test]
    fn resume_keeps_absolute_paths() {
        let path = manager().resolve_resume("/tmp/pets_vgg16.mpk").unwrap();
        assert_eq!(path, Path::new("/tmp/pets_vgg16.mpk"));
    }

    #[test]
    fn resume_rejects_foreign_extensions() {
        let err = manager().resolve_resume("pets_vgg16.pth").unwrap_err();
        assert!(err.to_string().contains("unsupported checkpoint extension"));
    }

    #[test]
    fn bare_stems_are_accepted() {
        assert!(manager().resolve_resume("pets_vgg16").is_ok());
    }
}
