use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Trait for configurations that can build modules.
///
/// Parameters of the module are looked up or created through the
/// variable builder, so the same configuration can be used for both
/// freshly initialized and pretrained models.
pub trait BuildModule: Debug {
    /// Build a module.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError>;
}
