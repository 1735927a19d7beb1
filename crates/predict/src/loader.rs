use crate::{
    DynamicPredictor, LinearPredictor, PredictError, PredictResult, ViewportPredictor,
};
use std::path::Path;

/// Resolves a predictor by name.
///
/// Built-in predictors are matched first. Anything else needs a shared library path.
#[derive(Debug, Default, Clone, Copy)]
pub struct PredictorLoader;

impl PredictorLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn builtin_names(&self) -> &'static [&'static str] {
        &[LinearPredictor::NAME]
    }

    pub fn load(
        &self,
        name: &str,
        lib_path: Option<&Path>,
    ) -> PredictResult<Box<dyn ViewportPredictor>> {
        if let Some(path) = lib_path {
            let predictor = DynamicPredictor::open(name, path)?;
            return Ok(Box::new(predictor));
        }

        match name {
            LinearPredictor::NAME => Ok(Box::new(LinearPredictor::new())),
            _ => Err(PredictError::PluginNotFound(name.to_string())),
        }
    }
}
