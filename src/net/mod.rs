pub mod package;

pub use package::{Package, PackageError};
