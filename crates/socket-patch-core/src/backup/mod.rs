mod content;
mod metadata;
mod store;

pub use content::{ContentStore, LocalContentStore};
pub use metadata::{BackupFileInfo, BackupMetadata};
pub use store::{BackupStore, BackupVerification, RestoreReport};

pub(crate) use store::absolute;
