//! IP reputation: whitelist, blacklist, bans, violation tracking, and the
//! background sweeper that keeps them bounded.

mod events;
mod reputation;
mod sweeper;
mod violations;

pub use events::SecurityEvent;
pub use reputation::{
    BanEntry, BanSource, BanView, EntryView, PurgeReport, ReputationEntry, ReputationStore,
    ReputationTarget,
};
pub use sweeper::{SweepReport, Sweeper};
pub use violations::{ViolationOutcome, ViolationRecord, ViolationTracker, ViolationView};
