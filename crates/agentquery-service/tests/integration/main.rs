// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod http;
pub mod pagination;
pub mod queries;
pub mod retention;
pub mod utils;

pub use utils::*;
