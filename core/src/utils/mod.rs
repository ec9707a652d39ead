pub mod debounce;

pub use debounce::{earliest, wait_until, Debounce};
