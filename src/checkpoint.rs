//! Flat `name -> tensor` checkpoints.
//!
//! A module is exported into a [`StateDict`] keyed by dotted parameter paths
//! (`global_disc.conv1.conv.weight`, `fc.bias`, ...) and written as a
//! safetensors file. Loading is non-strict: entries whose key and shape match
//! replace the current parameter, everything else is collected into a
//! [`LoadReport`] and left untouched.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use burn::{
    module::{Param, RunningState},
    nn::{conv::Conv2d, BatchNorm, Linear},
    prelude::*,
};
use safetensors::{tensor::TensorView, Dtype, SafeTensors};

use crate::error::{GlDiscError, Result};

pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Modules whose parameters can be exported to and imported from a
/// [`StateDict`].
pub trait NamedParams: Sized {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> Result<()>;

    /// Replaces every parameter `loader` holds a compatible entry for.
    fn import(self, prefix: &str, loader: &mut StateLoader) -> Self;

    fn state_dict(&self) -> Result<StateDict> {
        let mut dict = StateDict::default();
        self.export("", &mut dict)?;
        Ok(dict)
    }
}

// ////////////////////////////////////////////////////////////////////////////
// State dict
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDict {
    entries: BTreeMap<String, TensorEntry>,
}
impl StateDict {
    pub fn insert(&mut self, key: String, entry: TensorEntry) {
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &str) -> Option<&TensorEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<TensorEntry> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_tensor<B: Backend, const D: usize>(
        &mut self,
        key: String,
        tensor: Tensor<B, D>,
    ) -> Result<()> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| GlDiscError::TensorData {
                name: key.clone(),
                message: format!("{err:?}"),
            })?;
        self.insert(key, TensorEntry { shape, values });
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let buffers = self
            .entries
            .iter()
            .map(|(key, entry)| {
                let bytes = entry
                    .values
                    .iter()
                    .flat_map(|value| value.to_le_bytes())
                    .collect::<Vec<u8>>();
                (key, &entry.shape, bytes)
            })
            .collect::<Vec<_>>();

        let mut views = Vec::with_capacity(buffers.len());
        for (key, shape, bytes) in &buffers {
            let view = TensorView::new(Dtype::F32, shape.to_vec(), bytes)?;
            views.push((key.to_string(), view));
        }

        safetensors::serialize_to_file(views, &None, path)?;
        tracing::debug!("Saved {} tensors to '{}'", self.len(), path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| GlDiscError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let tensors = SafeTensors::deserialize(&bytes)?;

        let mut dict = StateDict::default();
        for (name, view) in tensors.tensors() {
            let values = match view.dtype() {
                Dtype::F32 => view
                    .data()
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect(),
                Dtype::F64 => view
                    .data()
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(chunk);
                        f64::from_le_bytes(raw) as f32
                    })
                    .collect(),
                other => {
                    return Err(GlDiscError::UnsupportedDtype {
                        name,
                        dtype: format!("{other:?}"),
                    })
                }
            };
            let shape = view.shape().to_vec();
            dict.insert(name, TensorEntry { shape, values });
        }

        tracing::debug!("Read {} tensors from '{}'", dict.len(), path.display());
        Ok(dict)
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Non-strict loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub key: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters of the module with no entry in the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint entries the module has no parameter for.
    pub unexpected: Vec<String>,
    pub mismatched: Vec<ShapeMismatch>,
}
impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }

    pub fn log(&self, source: &Path) {
        if self.is_clean() {
            tracing::info!("Loaded all parameters from '{}'", source.display());
            return;
        }
        if !self.unexpected.is_empty() {
            tracing::warn!(
                "unexpected key in source state_dict ({}): {}",
                source.display(),
                self.unexpected.join(", ")
            );
        }
        if !self.missing.is_empty() {
            tracing::warn!(
                "missing keys in source state_dict ({}): {}",
                source.display(),
                self.missing.join(", ")
            );
        }
        for mismatch in &self.mismatched {
            tracing::warn!(
                "size mismatch for {}: checkpoint has {:?}, module has {:?}",
                mismatch.key,
                mismatch.found,
                mismatch.expected
            );
        }
    }
}

pub struct StateLoader {
    dict: StateDict,
    consumed: BTreeSet<String>,
    report: LoadReport,
}
impl StateLoader {
    pub fn new(dict: StateDict) -> Self {
        Self {
            dict,
            consumed: BTreeSet::new(),
            report: LoadReport::default(),
        }
    }

    /// Returns the entry for `key` when its shape is `expected`, recording a
    /// miss or a mismatch otherwise.
    pub fn take(&mut self, key: &str, expected: &[usize]) -> Option<TensorData> {
        let Some(entry) = self.dict.get(key) else {
            self.report.missing.push(key.to_string());
            return None;
        };
        self.consumed.insert(key.to_string());

        if entry.shape != expected {
            self.report.mismatched.push(ShapeMismatch {
                key: key.to_string(),
                expected: expected.to_vec(),
                found: entry.shape.clone(),
            });
            return None;
        }

        Some(TensorData::new(entry.values.clone(), entry.shape.clone()))
    }

    pub fn finish(self) -> LoadReport {
        let mut report = self.report;
        report.unexpected = self
            .dict
            .keys()
            .filter(|key| !self.consumed.contains(*key))
            .cloned()
            .collect();
        report
    }
}

pub fn import_param<B: Backend, const D: usize>(
    param: Param<Tensor<B, D>>,
    key: &str,
    loader: &mut StateLoader,
) -> Param<Tensor<B, D>> {
    let expected = param.dims();
    match loader.take(key, &expected) {
        Some(data) => param.map(|current| {
            let require_grad = current.is_require_grad();
            Tensor::from_data(data, &current.device()).set_require_grad(require_grad)
        }),
        None => param,
    }
}

fn import_running<B: Backend>(
    state: RunningState<Tensor<B, 1>>,
    key: &str,
    loader: &mut StateLoader,
) -> RunningState<Tensor<B, 1>> {
    let current = state.value();
    match loader.take(key, &current.dims()) {
        Some(data) => RunningState::new(Tensor::from_data(data, &current.device())),
        None => state,
    }
}

// ////////////////////////////////////////////////////////////////////////////
// burn primitives
impl<B: Backend> NamedParams for Linear<B> {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> Result<()> {
        dict.insert_tensor(join_key(prefix, "weight"), self.weight.val())?;
        if let Some(bias) = &self.bias {
            dict.insert_tensor(join_key(prefix, "bias"), bias.val())?;
        }
        Ok(())
    }

    fn import(mut self, prefix: &str, loader: &mut StateLoader) -> Self {
        self.weight = import_param(self.weight, &join_key(prefix, "weight"), loader);
        self.bias = self
            .bias
            .map(|bias| import_param(bias, &join_key(prefix, "bias"), loader));
        self
    }
}

impl<B: Backend> NamedParams for Conv2d<B> {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> Result<()> {
        dict.insert_tensor(join_key(prefix, "weight"), self.weight.val())?;
        if let Some(bias) = &self.bias {
            dict.insert_tensor(join_key(prefix, "bias"), bias.val())?;
        }
        Ok(())
    }

    fn import(mut self, prefix: &str, loader: &mut StateLoader) -> Self {
        self.weight = import_param(self.weight, &join_key(prefix, "weight"), loader);
        self.bias = self
            .bias
            .map(|bias| import_param(bias, &join_key(prefix, "bias"), loader));
        self
    }
}

impl<B: Backend> NamedParams for BatchNorm<B, 2> {
    fn export(&self, prefix: &str, dict: &mut StateDict) -> Result<()> {
        dict.insert_tensor(join_key(prefix, "weight"), self.gamma.val())?;
        dict.insert_tensor(join_key(prefix, "bias"), self.beta.val())?;
        dict.insert_tensor(join_key(prefix, "running_mean"), self.running_mean.value())?;
        dict.insert_tensor(join_key(prefix, "running_var"), self.running_var.value())?;
        Ok(())
    }

    fn import(mut self, prefix: &str, loader: &mut StateLoader) -> Self {
        self.gamma = import_param(self.gamma, &join_key(prefix, "weight"), loader);
        self.beta = import_param(self.beta, &join_key(prefix, "bias"), loader);
        self.running_mean =
            import_running(self.running_mean, &join_key(prefix, "running_mean"), loader);
        self.running_var =
            import_running(self.running_var, &join_key(prefix, "running_var"), loader);
        self
    }
}

// ////////////////////////////////////////////////////////////////////////////
// Entry points
pub fn save_checkpoint<M: NamedParams, P: AsRef<Path>>(module: &M, path: P) -> Result<()> {
    module.state_dict()?.save(path)
}

/// Non-strict load: returns the updated module and what did not line up.
pub fn load_checkpoint<M: NamedParams, P: AsRef<Path>>(
    module: M,
    path: P,
) -> Result<(M, LoadReport)> {
    let dict = StateDict::load(path)?;
    Ok(load_state_dict(module, dict))
}

pub fn load_state_dict<M: NamedParams>(module: M, dict: StateDict) -> (M, LoadReport) {
    let mut loader = StateLoader::new(dict);
    let module = module.import("", &mut loader);
    (module, loader.finish())
}
