//! TTL-indexed sorted map.
//!
//! Two layers, leaves first:
//!
//! - [`SortedArrayMap`]: array-backed mapping from `i64` keys to values,
//!   keys kept ascending and found by binary search, with O(1) tombstone
//!   deletion compacted lazily.
//! - [`ExpiringMap`]: wraps a [`SortedArrayMap`], stamps every value with a
//!   creation/update time and a timeout, runs a cancellable per-key
//!   expiration timer, and fans out add/update/expiring/removed events to
//!   registered listeners. A listener may veto an impending removal, which
//!   resets that entry's timer instead.
//!
//! Typical flow: a producer (for example a device scanner) `put`s a key on
//! every sighting, which restarts that key's timer; when sightings stop,
//! the entry expires and observers are told to drop it from their views.
//!
//! ```no_run
//! use std::sync::Arc;
//! use expiremap::{ExpiringMap, ExpiringMapListener, ItemSnapshot};
//!
//! struct LogRemovals;
//!
//! impl ExpiringMapListener<String> for LogRemovals {
//!     fn on_item_removed(&self, key: i64, _index: usize, item: &ItemSnapshot<String>, expired: bool) {
//!         println!("{key} => {} gone (expired={expired})", item.value());
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), expiremap::MapError> {
//! let devices: ExpiringMap<String> = ExpiringMap::new("devices")?;
//! devices.add_listener(Arc::new(LogRemovals));
//! devices.put_with_timeout(0x0001, "beacon".to_string(), 30_000);
//! # Ok(())
//! # }
//! ```

pub mod collections;
pub mod utils;

pub use collections::expiring::{
    ExpiringMap, ExpiringMapListener, ExpiringMapOptions, ItemSnapshot, MapError,
    DEFAULT_EXPIRATION_TIMEOUT_MS,
};
pub use collections::sorted_array::{Cursor, PutResult, SortedArrayMap};
pub use utils::listeners::ListenerRegistry;
