mod paths;

pub use paths::{AppPaths, AppPathsError, create_private_dir};
