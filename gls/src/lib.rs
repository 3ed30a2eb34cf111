pub mod fit;
mod linalg;
pub mod stats;
pub mod types;

pub use fit::{GlsEngine, OlsEngine, RegressionEngine};
pub use linalg::{inverse_cholesky_factor, whiten_matrix, whiten_vector};
pub use types::*;
