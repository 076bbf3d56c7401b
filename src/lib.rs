//! livescroll-engine — the background reload engine of a live-updating feed
//! reader.
//!
//! ## Architecture overview
//!
//! ```text
//!  ┌───────────┐ fire  ┌────────────┐ reload ┌─────────────┐ save ┌────────────┐
//!  │ scheduler │ ────► │  Reloader  │ ─────► │ reload queue│ ───► │ save queue │
//!  │ (timers)  │       │ (pipeline) │        │  (N slots)  │      │  (1 slot)  │
//!  └───────────┘       └────────────┘        └─────────────┘      └─────┬──────┘
//!        ▲ prefs / deleted                                               │ merge
//!        │                                                               ▼
//!  ┌───────────┐  index updated  ┌──────────────────┐            ┌────────────┐
//!  │ EventHub  │ ◄────────────── │ FeedPersistence  │ ◄───────── │  storage   │
//!  └───────────┘                 └──────────────────┘            └────────────┘
//!        │ debounced
//!        ▼
//!  ┌────────────────────┐
//!  │ SavedSearchService │
//!  └────────────────────┘
//! ```
//!
//! * **`task`** — tasks, monitors, the bounded [`TaskQueue`](task::TaskQueue)
//!   and the [`BatchedBuffer`](task::BatchedBuffer) debounce primitive.
//! * **`timer`** — one thread of key-tagged one-shot timers.
//! * **`reload`** — the per-subscription reload pipeline.
//! * **`scheduler`** — interval timers with sleep/wake correction.
//! * **`search`** — saved searches and their debounced recompute.
//! * **`source`** — the network side; RSS over HTTP by default.
//! * **`ports`** — the remaining collaborator traits.
//! * **`store`**, **`credentials`** — in-process implementations of them.
//! * **`context`** — wires everything together.

pub mod context;
pub mod credentials;
pub mod error;
pub mod events;
pub mod model;
pub mod ports;
pub mod reload;
pub mod scheduler;
pub mod search;
pub mod settings;
pub mod source;
pub mod store;
pub mod task;
pub mod timer;

#[cfg(test)]
pub(crate) mod test_utils;

pub use context::{AppContext, Collaborators, EngineTuning, ShutdownFlag, StartupSummary};
pub use error::ReloadError;
pub use settings::Settings;
