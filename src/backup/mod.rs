pub(crate) mod completion; // Polling state machine that waits for contiguous log coverage
pub(crate) mod submit;

pub use completion::{BackupCompletionCoordinator, PollSettings};
pub use submit::{SubmitOutcome, submit_backup};
