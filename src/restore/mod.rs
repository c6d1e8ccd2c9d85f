mod logic;
pub(crate) mod markers; // Recovery marker reads that yield the restore begin version

pub use logic::RestoreCoordinator;
