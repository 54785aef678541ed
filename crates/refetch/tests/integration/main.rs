// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod errors;
pub mod keyed;
pub mod serial;
pub mod utils;

pub use utils::*;
