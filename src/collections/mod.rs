// Collections — sorted array storage and the expiring TTL layer over it

pub mod expiring;
pub mod sorted_array;

pub use expiring::{
    ExpiringMap, ExpiringMapListener, ExpiringMapOptions, ItemSnapshot, MapError,
    DEFAULT_EXPIRATION_TIMEOUT_MS,
};
pub use sorted_array::{Cursor, PutResult, SortedArrayMap};
