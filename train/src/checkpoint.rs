//! Training checkpoints: model, optimizer moments and the iteration they were taken at.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use gs_optimize::Adam;
use serde::{Deserialize, Serialize};

use crate::model::{GaussianModel, ModelSnapshot};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub iteration: usize,
    pub model: ModelSnapshot,
    pub optimizer: Adam,
}

impl Checkpoint {
    pub fn capture(model: &GaussianModel, iteration: usize) -> Self {
        Self {
            iteration,
            model: model.snapshot(),
            optimizer: model.optimizer.clone(),
        }
    }

    /// `<model_path>/chkpnt<iteration>.bin`
    pub fn path_for(model_path: &Path, iteration: usize) -> PathBuf {
        model_path.join(format!("chkpnt{iteration}.bin"))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)
            .map_err(|e| Error::Checkpoint(format!("failed to write {}: {e}", path.display())))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        bincode::deserialize_from(reader)
            .map_err(|e| Error::Checkpoint(format!("failed to read {}: {e}", path.display())))
    }

    /// Rebuilds the model. Training resumes at `iteration + 1`.
    pub fn restore(self) -> Result<(GaussianModel, usize)> {
        let model = GaussianModel::restore(self.model, self.optimizer)?;
        Ok((model, self.iteration))
    }
}
