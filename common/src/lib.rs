pub mod djb2;
pub mod file_format;
pub mod log_setup;
pub mod parallel;
pub mod slot;

pub use djb2::Djb2Hasher;
pub use slot::Slot;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
