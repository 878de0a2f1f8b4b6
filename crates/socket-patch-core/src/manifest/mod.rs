mod schema;
mod store;

pub use schema::*;
pub use store::{manifest_path, ManifestStore, MANIFEST_FILE, SOCKET_DIR};
